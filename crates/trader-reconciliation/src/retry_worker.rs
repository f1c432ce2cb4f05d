//! 청산 매핑 재시도 워커.
//!
//! 주기적으로:
//! 1. 기한이 지난 CLOSING 포지션을 CLOSED_UNMAPPED로 전이
//! 2. CLOSED_UNMAPPED 포지션마다 재시도 횟수를 올리고 REST 백필 요청,
//!    한도를 넘기면 FAILED
//! 3. 고아 주문 재매핑 (시도 횟수 제한)
//!
//! 모든 포지션 변경은 [`ReconciliationEngine`]의 키 워커에서 실행됩니다.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use trader_core::{ExchangeKind, PositionStatus};
use trader_exchange::ConnectionManager;
use uuid::Uuid;

use crate::engine::{LedgerKey, ReconciliationEngine};
use crate::error::ReconcileError;
use crate::reconciler::RetryDecision;

/// REST 백필 요청 경로.
#[async_trait]
pub trait BackfillRequester: Send + Sync {
    /// 요청을 전달한 세션 수를 반환.
    async fn request_backfill(
        &self,
        user_id: Uuid,
        exchange: ExchangeKind,
        symbols: Vec<String>,
    ) -> usize;
}

#[async_trait]
impl BackfillRequester for ConnectionManager {
    async fn request_backfill(
        &self,
        user_id: Uuid,
        exchange: ExchangeKind,
        symbols: Vec<String>,
    ) -> usize {
        ConnectionManager::request_backfill(self, user_id, exchange, symbols).await
    }
}

/// 재시도 정책.
#[derive(Debug, Clone)]
pub struct MappingRetryConfig {
    /// 실행 간격
    pub interval: Duration,
    /// CLOSED_UNMAPPED 최대 재시도 횟수 (초과 시 FAILED)
    pub max_retries: u32,
    /// 고아 주문 최대 재매핑 시도 횟수
    pub orphan_max_attempts: u32,
}

impl Default for MappingRetryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_retries: 5,
            orphan_max_attempts: 5,
        }
    }
}

/// 한 번의 실행 결과.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub expired: usize,
    pub retried: usize,
    pub failed: usize,
    pub backfill_requests: usize,
    pub orphans_remapped: usize,
}

/// 청산 매핑 재시도 워커.
pub struct MappingRetryWorker {
    engine: Arc<ReconciliationEngine>,
    backfill: Option<Arc<dyn BackfillRequester>>,
    config: MappingRetryConfig,
}

impl MappingRetryWorker {
    pub fn new(engine: Arc<ReconciliationEngine>, config: MappingRetryConfig) -> Self {
        Self {
            engine,
            backfill: None,
            config,
        }
    }

    pub fn with_backfill(mut self, backfill: Arc<dyn BackfillRequester>) -> Self {
        self.backfill = Some(backfill);
        self
    }

    /// 종료 신호까지 주기적으로 실행.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            max_retries = self.config.max_retries,
            "매핑 재시도 워커 시작"
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_once(Utc::now()).await {
                        Ok(report) if report != RetryReport::default() => {
                            info!(
                                expired = report.expired,
                                retried = report.retried,
                                failed = report.failed,
                                remapped = report.orphans_remapped,
                                "매핑 재시도 실행"
                            );
                        }
                        Ok(_) => {}
                        Err(ReconcileError::ShutDown) => break,
                        Err(e) => error!(error = %e, "매핑 재시도 실패"),
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("매핑 재시도 워커 종료");
                    break;
                }
            }
        }
    }

    /// 한 번 실행. `now`는 CLOSING 기한 판정 기준 시각.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<RetryReport, ReconcileError> {
        let mut report = RetryReport::default();
        let store = self.engine.store().clone();

        for position in store.positions_by_status(PositionStatus::Closing).await? {
            if !position.closing_expired(now) {
                continue;
            }
            let key = LedgerKey::new(position.user_id, position.exchange, position.symbol.clone());
            if self.engine.expire_closing(&key, position.id, now).await? {
                report.expired += 1;
            }
        }

        let mut targets: HashMap<(Uuid, ExchangeKind), BTreeSet<String>> = HashMap::new();
        for position in store.positions_by_status(PositionStatus::ClosedUnmapped).await? {
            let key = LedgerKey::new(position.user_id, position.exchange, position.symbol.clone());
            match self
                .engine
                .retry_unmapped(&key, position.id, self.config.max_retries)
                .await?
            {
                RetryDecision::Retry => {
                    report.retried += 1;
                    targets
                        .entry((position.user_id, position.exchange))
                        .or_default()
                        .insert(position.symbol.clone());
                }
                RetryDecision::Failed => report.failed += 1,
                RetryDecision::Skipped => {}
            }
        }

        if let Some(backfill) = &self.backfill {
            for ((user_id, exchange), symbols) in targets {
                let symbols: Vec<String> = symbols.into_iter().collect();
                let delivered = backfill
                    .request_backfill(user_id, exchange, symbols.clone())
                    .await;
                if delivered == 0 {
                    warn!(
                        user_id = %user_id,
                        exchange = %exchange,
                        symbols = ?symbols,
                        "백필 요청을 받을 세션 없음"
                    );
                }
                report.backfill_requests += delivered;
            }
        }

        for order in store.orphan_orders(self.config.orphan_max_attempts).await? {
            let order_id = order.exchange_order_id.clone();
            if self.engine.remap_orphan(order).await? {
                report.orphans_remapped += 1;
                debug!(order_id = %order_id, "고아 주문 재매핑 성공");
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_config_defaults_are_bounded() {
        let config = MappingRetryConfig::default();
        assert!(config.max_retries > 0);
        assert!(config.orphan_max_attempts > 0);
        assert_eq!(config.interval, Duration::from_secs(60));
    }
}
