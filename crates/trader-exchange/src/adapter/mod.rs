//! 거래소 어댑터.
//!
//! 거래소별 인증/구독/하트비트 메시지를 만들고, 푸시 메시지와 REST 응답을
//! 중립 타입([`RawFill`], [`RawPosition`])으로 변환합니다.
//!
//! # 구조
//!
//! ```text
//! ExchangeAdapter            // 거래소 태그로 분기하는 열거형
//! ├── Binance(BinanceAdapter)  // listen key + ORDER_TRADE_UPDATE
//! ├── Bybit(BybitAdapter)      // v5 private (order, position)
//! └── Bitget(BitgetAdapter)    // v2 private (orders, positions, orders-algo)
//! ```

pub mod binance;
pub mod bitget;
pub mod bybit;
pub mod rest;

use std::{
    collections::HashMap,
    str::FromStr,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio_tungstenite::tungstenite::Message;
use trader_core::{ApiCredential, ExchangeKind, RawFill, RawPosition};

pub use binance::BinanceAdapter;
pub use bitget::BitgetAdapter;
pub use bybit::BybitAdapter;
pub use rest::RestPool;

use crate::ExchangeError;

// ==================== 공용 타입 ====================

/// 스트림 메시지 해석 결과.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// 주문 체결 (상태 무관, 필터링은 대사 엔진 담당)
    Fill(RawFill),
    /// 포지션 스냅샷
    Position(RawPosition),
    /// 로그인/인증 성공
    Authenticated,
    /// 로그인/인증 거부
    AuthRejected(String),
    /// 구독 확인
    Subscribed,
    /// 하트비트 응답
    Heartbeat,
    /// listen key 만료 (재연결 필요)
    ListenKeyExpired,
    /// 처리 대상 아님
    Ignored,
}

/// REST/WS 기본 주소.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeEndpoints {
    pub rest_base: String,
    pub ws_base: String,
}

impl ExchangeEndpoints {
    pub fn new(rest_base: impl Into<String>, ws_base: impl Into<String>) -> Self {
        Self {
            rest_base: rest_base.into().trim_end_matches('/').to_string(),
            ws_base: ws_base.into().trim_end_matches('/').to_string(),
        }
    }

    /// 운영 환경 기본 주소.
    pub fn production(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Binance => {
                Self::new("https://fapi.binance.com", "wss://fstream.binance.com")
            }
            ExchangeKind::Bybit => Self::new("https://api.bybit.com", "wss://stream.bybit.com"),
            ExchangeKind::Bitget => Self::new("https://api.bitget.com", "wss://ws.bitget.com"),
        }
    }

    /// 테스트넷/데모 환경 기본 주소.
    pub fn testnet(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Binance => Self::new(
                "https://testnet.binancefuture.com",
                "wss://fstream.binancefuture.com",
            ),
            ExchangeKind::Bybit => Self::new(
                "https://api-testnet.bybit.com",
                "wss://stream-testnet.bybit.com",
            ),
            // Bitget 데모는 같은 REST 호스트에 paptrading 헤더 사용
            ExchangeKind::Bitget => Self::new("https://api.bitget.com", "wss://wspap.bitget.com"),
        }
    }
}

/// 연결할 스트림 주소와 세션 토큰.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTarget {
    pub url: String,
    /// Binance listen key
    pub listen_key: Option<String>,
}

/// 어댑터 공통 설정.
#[derive(Debug, Clone)]
pub struct AdapterSettings {
    /// 서명 요청 유효 시간 (밀리초)
    pub recv_window: u64,
    /// 백필 1회 조회 건수
    pub backfill_limit: u32,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            recv_window: 5000,
            backfill_limit: 100,
        }
    }
}

/// 심볼별 마지막 레버리지.
///
/// 주문 이벤트에 레버리지가 없는 거래소에서 계정/포지션 스트림 값을 기억해
/// 진입 체결에 붙입니다. 클론은 같은 맵을 공유합니다.
#[derive(Debug, Clone, Default)]
pub(crate) struct LeverageCache {
    by_symbol: Arc<Mutex<HashMap<String, Decimal>>>,
}

impl LeverageCache {
    pub(crate) fn record(&self, symbol: &str, leverage: Option<Decimal>) {
        if let Some(leverage) = leverage.filter(|l| *l > Decimal::ZERO) {
            self.by_symbol
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(symbol.to_string(), leverage);
        }
    }

    pub(crate) fn get(&self, symbol: &str) -> Option<Decimal> {
        self.by_symbol
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(symbol)
            .copied()
    }
}

// ==================== 어댑터 ====================

/// 거래소 어댑터 (태그 분기).
#[derive(Debug, Clone)]
pub enum ExchangeAdapter {
    Binance(BinanceAdapter),
    Bybit(BybitAdapter),
    Bitget(BitgetAdapter),
}

impl ExchangeAdapter {
    pub fn new(
        kind: ExchangeKind,
        endpoints: ExchangeEndpoints,
        settings: AdapterSettings,
        demo: bool,
    ) -> Self {
        match kind {
            ExchangeKind::Binance => Self::Binance(BinanceAdapter::new(endpoints, settings)),
            ExchangeKind::Bybit => Self::Bybit(BybitAdapter::new(endpoints, settings)),
            ExchangeKind::Bitget => Self::Bitget(BitgetAdapter::new(endpoints, settings, demo)),
        }
    }

    pub fn kind(&self) -> ExchangeKind {
        match self {
            Self::Binance(_) => ExchangeKind::Binance,
            Self::Bybit(_) => ExchangeKind::Bybit,
            Self::Bitget(_) => ExchangeKind::Bitget,
        }
    }

    /// 스트림 연결 준비 (Binance는 listen key 발급).
    pub async fn prepare_stream(
        &self,
        rest: &RestPool,
        credential: &ApiCredential,
    ) -> Result<StreamTarget, ExchangeError> {
        match self {
            Self::Binance(a) => a.prepare_stream(rest, credential).await,
            Self::Bybit(a) => Ok(a.stream_target()),
            Self::Bitget(a) => Ok(a.stream_target()),
        }
    }

    /// 연결 직후 보낼 로그인 메시지 (필요 없는 거래소는 None).
    pub fn login_message(
        &self,
        credential: &ApiCredential,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, ExchangeError> {
        match self {
            Self::Binance(_) => Ok(None),
            Self::Bybit(a) => a.login_message(credential, now).map(Some),
            Self::Bitget(a) => a.login_message(credential, now).map(Some),
        }
    }

    /// 구독 메시지 목록 (재연결 시 동일하게 재전송).
    pub fn subscribe_messages(&self) -> Vec<String> {
        match self {
            Self::Binance(_) => Vec::new(),
            Self::Bybit(a) => a.subscribe_messages(),
            Self::Bitget(a) => a.subscribe_messages(),
        }
    }

    /// 애플리케이션 레벨 하트비트 메시지.
    pub fn heartbeat_message(&self) -> Message {
        match self {
            Self::Binance(_) => Message::Ping(Vec::new()),
            Self::Bybit(_) => Message::Text(bybit::PING_MESSAGE.to_string()),
            Self::Bitget(_) => Message::Text(bitget::PING_MESSAGE.to_string()),
        }
    }

    /// 텍스트 프레임 해석.
    pub fn parse_message(&self, text: &str) -> Result<Vec<StreamEvent>, ExchangeError> {
        match self {
            Self::Binance(a) => a.parse_message(text),
            Self::Bybit(a) => a.parse_message(text),
            Self::Bitget(a) => a.parse_message(text),
        }
    }

    /// 주기적 keep-alive가 필요한지.
    pub fn needs_keepalive(&self) -> bool {
        self.kind().uses_listen_key()
    }

    /// 세션 토큰 연장.
    pub async fn keepalive(
        &self,
        rest: &RestPool,
        credential: &ApiCredential,
        target: &StreamTarget,
    ) -> Result<(), ExchangeError> {
        match (self, target.listen_key.as_deref()) {
            (Self::Binance(a), Some(listen_key)) => a.keepalive(rest, credential, listen_key).await,
            _ => Ok(()),
        }
    }

    /// 최근 주문 이력 백필.
    ///
    /// `symbols`는 심볼 지정이 필수인 거래소(Binance)에서만 사용합니다.
    pub async fn fetch_recent_fills(
        &self,
        rest: &RestPool,
        credential: &ApiCredential,
        since: DateTime<Utc>,
        symbols: &[String],
    ) -> Result<Vec<RawFill>, ExchangeError> {
        match self {
            Self::Binance(a) => a.fetch_recent_fills(rest, credential, since, symbols).await,
            Self::Bybit(a) => a.fetch_recent_fills(rest, credential, since).await,
            Self::Bitget(a) => a.fetch_recent_fills(rest, credential, since).await,
        }
    }
}

// ==================== 파싱 헬퍼 ====================

/// 거래소 숫자 문자열을 Decimal로 변환. 빈 문자열은 0.
pub(crate) fn parse_decimal(field: &str, value: &str) -> Result<Decimal, ExchangeError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(Decimal::ZERO);
    }
    Decimal::from_str(trimmed)
        .or_else(|_| Decimal::from_scientific(trimmed))
        .map_err(|e| {
            ExchangeError::MalformedEvent(format!("{} 숫자 변환 실패 ({}): {}", field, trimmed, e))
        })
}

/// 선택적 숫자 문자열. 빈 값이나 0은 None.
pub(crate) fn parse_optional_decimal(value: Option<&str>) -> Option<Decimal> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .and_then(|v| Decimal::from_str(v).ok())
        .filter(|d| !d.is_zero())
}

/// 밀리초 타임스탬프를 UTC 시각으로 변환.
pub(crate) fn millis_to_utc(ms: i64) -> Result<DateTime<Utc>, ExchangeError> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| ExchangeError::MalformedEvent(format!("잘못된 타임스탬프: {}", ms)))
}

/// 문자열 밀리초 타임스탬프 변환.
pub(crate) fn millis_str_to_utc(value: &str) -> Result<DateTime<Utc>, ExchangeError> {
    let ms = value
        .trim()
        .parse::<i64>()
        .map_err(|_| ExchangeError::MalformedEvent(format!("잘못된 타임스탬프: {}", value)))?;
    millis_to_utc(ms)
}
