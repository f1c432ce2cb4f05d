//! 환경변수 기반 설정 모듈.

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use trader_analytics::AnalyzerConfig;
use trader_core::ExchangeKind;
use trader_exchange::{AdapterSettings, ExchangeEndpoints, SessionConfig};
use trader_reconciliation::{DispatcherConfig, EngineConfig, MappingRetryConfig};

use crate::error::{Result, SyncError};

/// 동기화 데몬 전체 설정
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// 데이터베이스 URL (없으면 메모리 저장소)
    pub database_url: Option<String>,
    /// 자격증명 암호화 마스터 키 (base64, 32바이트)
    pub encryption_master_key: String,
    /// 거래소별 REST/WS 주소
    pub endpoints: EndpointOverrides,
    /// REST 설정
    pub rest: RestConfig,
    /// 스트리밍 세션 설정
    pub session: SessionSettings,
    /// 원장 정합 설정
    pub ledger: LedgerConfig,
    /// 리스크 분석 설정
    pub risk: RiskConfig,
    /// 데몬 주기 설정
    pub daemon: DaemonConfig,
}

/// 거래소 주소 재정의.
///
/// 설정하지 않은 값은 거래소 기본 주소를 사용합니다.
#[derive(Debug, Clone, Default)]
pub struct EndpointOverrides {
    pub binance: ExchangeUrls,
    pub bybit: ExchangeUrls,
    pub bitget: ExchangeUrls,
}

/// 한 거래소의 운영/테스트넷 주소 재정의
#[derive(Debug, Clone, Default)]
pub struct ExchangeUrls {
    pub rest: Option<String>,
    pub ws: Option<String>,
    pub testnet_rest: Option<String>,
    pub testnet_ws: Option<String>,
}

/// REST 설정
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// 요청 타임아웃 (초)
    pub timeout_secs: u64,
    /// 동시 요청 수
    pub pool_size: usize,
    /// 서명 요청 유효 시간 (밀리초)
    pub recv_window_ms: u64,
    /// 백필 1회 조회 건수
    pub backfill_limit: u32,
}

/// 스트리밍 세션 설정
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// 재연결 최초 대기 (밀리초)
    pub backoff_initial_ms: u64,
    /// 재연결 최대 대기 (초)
    pub backoff_max_secs: u64,
    /// 하트비트 주기 (초)
    pub heartbeat_secs: u64,
    /// 연속 무응답 허용 횟수
    pub missed_heartbeats: u32,
    /// listen key 연장 주기 (분)
    pub keepalive_minutes: u64,
    /// 접속/인증/구독 응답 대기 (초)
    pub handshake_timeout_secs: u64,
    /// 종료 시 대기 시간 (초)
    pub drain_timeout_secs: u64,
    /// 재연결 백필 조회 범위 (분)
    pub backfill_lookback_minutes: u64,
}

/// 원장 정합 설정
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// 실시간 체결 재정렬 창 (밀리초)
    pub reorder_window_ms: u64,
    /// flat 스냅샷 이후 청산 대기 (초)
    pub closing_timeout_secs: u64,
    /// 체결 반영 최대 시도 횟수 (일시적 저장소 오류)
    pub fill_max_attempts: u32,
    /// 체결 반영 재시도 대기 (밀리초)
    pub fill_retry_delay_ms: u64,
    /// CLOSED_UNMAPPED 재시도 주기 (초)
    pub retry_interval_secs: u64,
    /// CLOSED_UNMAPPED 최대 재시도 횟수
    pub max_retries: u32,
    /// 고아 주문 최대 재매핑 시도 횟수
    pub orphan_max_attempts: u32,
    /// 아웃박스 폴링 주기 (밀리초)
    pub outbox_poll_ms: u64,
    /// 아웃박스 1회 처리 건수
    pub outbox_batch_size: usize,
}

/// 리스크 분석 설정
#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// 감정적 재진입/충동 매매 판정 창 (분)
    pub short_window_minutes: u64,
    /// 손절/익절 허용 오차
    pub tolerance: Decimal,
    /// 기본 조회 기간 (일)
    pub lookback_days: u64,
}

/// 데몬 주기 설정
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// 자격증명 활성화 동기화 주기 (초)
    pub credential_sync_secs: u64,
    /// 상태 로그 주기 (초)
    pub status_interval_secs: u64,
    /// 세션 이벤트 채널 용량
    pub event_buffer: usize,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            pool_size: 8,
            recv_window_ms: 5000,
            backfill_limit: 100,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            backoff_initial_ms: 1000,
            backoff_max_secs: 60,
            heartbeat_secs: 20,
            missed_heartbeats: 3,
            keepalive_minutes: 30,
            handshake_timeout_secs: 10,
            drain_timeout_secs: 5,
            backfill_lookback_minutes: 60,
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            reorder_window_ms: 250,
            closing_timeout_secs: 30,
            fill_max_attempts: 3,
            fill_retry_delay_ms: 500,
            retry_interval_secs: 60,
            max_retries: 5,
            orphan_max_attempts: 5,
            outbox_poll_ms: 1000,
            outbox_batch_size: 100,
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            short_window_minutes: 15,
            tolerance: dec!(0.003),
            lookback_days: 30,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            credential_sync_secs: 30,
            status_interval_secs: 60,
            event_buffer: 1024,
        }
    }
}

impl SyncConfig {
    /// 환경변수에서 설정 로드
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let encryption_master_key = std::env::var("ENCRYPTION_MASTER_KEY").map_err(|_| {
            SyncError::Config("ENCRYPTION_MASTER_KEY 환경변수가 설정되지 않았습니다".to_string())
        })?;

        let rest = RestConfig::default();
        let session = SessionSettings::default();
        let ledger = LedgerConfig::default();
        let risk = RiskConfig::default();
        let daemon = DaemonConfig::default();

        Ok(Self {
            database_url: env_var_opt("DATABASE_URL"),
            encryption_master_key,
            endpoints: EndpointOverrides {
                binance: ExchangeUrls::from_env("BINANCE"),
                bybit: ExchangeUrls::from_env("BYBIT"),
                bitget: ExchangeUrls::from_env("BITGET"),
            },
            rest: RestConfig {
                timeout_secs: env_var_parse("REST_TIMEOUT_SECS", rest.timeout_secs),
                pool_size: env_var_parse("REST_POOL_SIZE", rest.pool_size),
                recv_window_ms: env_var_parse("RECV_WINDOW_MS", rest.recv_window_ms),
                backfill_limit: env_var_parse("BACKFILL_LIMIT", rest.backfill_limit),
            },
            session: SessionSettings {
                backoff_initial_ms: env_var_parse(
                    "RECONNECT_BACKOFF_INITIAL_MS",
                    session.backoff_initial_ms,
                ),
                backoff_max_secs: env_var_parse(
                    "RECONNECT_BACKOFF_MAX_SECS",
                    session.backoff_max_secs,
                ),
                heartbeat_secs: env_var_parse("HEARTBEAT_INTERVAL_SECS", session.heartbeat_secs),
                missed_heartbeats: env_var_parse(
                    "HEARTBEAT_MISSED_LIMIT",
                    session.missed_heartbeats,
                ),
                keepalive_minutes: env_var_parse(
                    "LISTEN_KEY_KEEPALIVE_MINUTES",
                    session.keepalive_minutes,
                ),
                handshake_timeout_secs: env_var_parse(
                    "HANDSHAKE_TIMEOUT_SECS",
                    session.handshake_timeout_secs,
                ),
                drain_timeout_secs: env_var_parse(
                    "SHUTDOWN_DRAIN_SECS",
                    session.drain_timeout_secs,
                ),
                backfill_lookback_minutes: env_var_parse(
                    "BACKFILL_LOOKBACK_MINUTES",
                    session.backfill_lookback_minutes,
                ),
            },
            ledger: LedgerConfig {
                reorder_window_ms: env_var_parse("REORDER_WINDOW_MS", ledger.reorder_window_ms),
                closing_timeout_secs: env_var_parse(
                    "CLOSING_TIMEOUT_SECS",
                    ledger.closing_timeout_secs,
                ),
                fill_max_attempts: env_var_parse("FILL_MAX_ATTEMPTS", ledger.fill_max_attempts),
                fill_retry_delay_ms: env_var_parse(
                    "FILL_RETRY_DELAY_MS",
                    ledger.fill_retry_delay_ms,
                ),
                retry_interval_secs: env_var_parse(
                    "UNMAPPED_RETRY_INTERVAL_SECS",
                    ledger.retry_interval_secs,
                ),
                max_retries: env_var_parse("UNMAPPED_MAX_RETRIES", ledger.max_retries),
                orphan_max_attempts: env_var_parse(
                    "ORPHAN_MAX_ATTEMPTS",
                    ledger.orphan_max_attempts,
                ),
                outbox_poll_ms: env_var_parse("OUTBOX_POLL_MS", ledger.outbox_poll_ms),
                outbox_batch_size: env_var_parse("OUTBOX_BATCH_SIZE", ledger.outbox_batch_size),
            },
            risk: RiskConfig {
                short_window_minutes: env_var_parse(
                    "RISK_SHORT_WINDOW_MINUTES",
                    risk.short_window_minutes,
                ),
                tolerance: env_var_parse("RISK_SLTP_TOLERANCE", risk.tolerance),
                lookback_days: env_var_parse("RISK_LOOKBACK_DAYS", risk.lookback_days),
            },
            daemon: DaemonConfig {
                credential_sync_secs: env_var_parse(
                    "CREDENTIAL_SYNC_SECS",
                    daemon.credential_sync_secs,
                ),
                status_interval_secs: env_var_parse(
                    "STATUS_INTERVAL_SECS",
                    daemon.status_interval_secs,
                ),
                event_buffer: env_var_parse("SESSION_EVENT_BUFFER", daemon.event_buffer),
            },
        })
    }

    /// 거래소/환경에 맞는 주소. 재정의가 없으면 기본 주소.
    pub fn endpoints_for(&self, kind: ExchangeKind, testnet: bool) -> ExchangeEndpoints {
        let urls = match kind {
            ExchangeKind::Binance => &self.endpoints.binance,
            ExchangeKind::Bybit => &self.endpoints.bybit,
            ExchangeKind::Bitget => &self.endpoints.bitget,
        };
        let defaults = if testnet {
            ExchangeEndpoints::testnet(kind)
        } else {
            ExchangeEndpoints::production(kind)
        };
        let (rest, ws) = if testnet {
            (&urls.testnet_rest, &urls.testnet_ws)
        } else {
            (&urls.rest, &urls.ws)
        };
        ExchangeEndpoints::new(
            rest.clone().unwrap_or(defaults.rest_base),
            ws.clone().unwrap_or(defaults.ws_base),
        )
    }

    pub fn adapter_settings(&self) -> AdapterSettings {
        AdapterSettings {
            recv_window: self.rest.recv_window_ms,
            backfill_limit: self.rest.backfill_limit,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            backoff_initial: Duration::from_millis(self.session.backoff_initial_ms),
            backoff_max: Duration::from_secs(self.session.backoff_max_secs),
            heartbeat_interval: Duration::from_secs(self.session.heartbeat_secs),
            missed_heartbeats: self.session.missed_heartbeats,
            keepalive_interval: Duration::from_secs(self.session.keepalive_minutes * 60),
            handshake_timeout: Duration::from_secs(self.session.handshake_timeout_secs),
            drain_timeout: self.drain_timeout(),
            backfill_lookback: Duration::from_secs(self.session.backfill_lookback_minutes * 60),
            ..SessionConfig::default()
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            reorder_window: Duration::from_millis(self.ledger.reorder_window_ms),
            closing_timeout: Duration::from_secs(self.ledger.closing_timeout_secs),
            max_fill_attempts: self.ledger.fill_max_attempts.max(1),
            retry_delay: Duration::from_millis(self.ledger.fill_retry_delay_ms),
            ..EngineConfig::default()
        }
    }

    pub fn retry_config(&self) -> MappingRetryConfig {
        MappingRetryConfig {
            interval: Duration::from_secs(self.ledger.retry_interval_secs),
            max_retries: self.ledger.max_retries,
            orphan_max_attempts: self.ledger.orphan_max_attempts,
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            poll_interval: Duration::from_millis(self.ledger.outbox_poll_ms),
            batch_size: self.ledger.outbox_batch_size,
            ..DispatcherConfig::default()
        }
    }

    pub fn analyzer_config(&self) -> AnalyzerConfig {
        AnalyzerConfig {
            short_window: Duration::from_secs(self.risk.short_window_minutes * 60),
            tolerance: self.risk.tolerance,
            default_lookback: Duration::from_secs(self.risk.lookback_days * 24 * 60 * 60),
            ..AnalyzerConfig::default()
        }
    }

    /// 종료 시 단계별 대기 시간
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.session.drain_timeout_secs)
    }
}

impl RestConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl DaemonConfig {
    /// 자격증명 동기화 주기를 Duration으로 반환
    pub fn credential_sync_interval(&self) -> Duration {
        Duration::from_secs(self.credential_sync_secs)
    }

    /// 상태 로그 주기를 Duration으로 반환
    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }
}

impl ExchangeUrls {
    /// `{PREFIX}_REST_URL`, `{PREFIX}_WS_URL`, `{PREFIX}_TESTNET_REST_URL`, `{PREFIX}_TESTNET_WS_URL`
    fn from_env(prefix: &str) -> Self {
        Self {
            rest: env_var_opt(&format!("{}_REST_URL", prefix)),
            ws: env_var_opt(&format!("{}_WS_URL", prefix)),
            testnet_rest: env_var_opt(&format!("{}_TESTNET_REST_URL", prefix)),
            testnet_ws: env_var_opt(&format!("{}_TESTNET_WS_URL", prefix)),
        }
    }
}

/// 환경변수에서 값을 파싱 (실패 시 기본값 사용)
fn env_var_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// 비어 있지 않은 환경변수 값
fn env_var_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
