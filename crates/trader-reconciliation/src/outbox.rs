//! 아웃박스 디스패처.
//!
//! 저장소의 미전달 이벤트를 생성 순서대로 [`EventNotifier`]에 전달합니다.
//! 전달에 실패하면 시도 횟수만 올리고 다음 폴링에서 같은 항목부터 다시 보냅니다
//! (최소 1회 전달).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use trader_core::{DomainEvent, LedgerStore, StoreError};

/// 알림 전달 에러.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("이벤트 전달 실패: {0}")]
    Delivery(String),

    #[error("수신 측이 닫힘")]
    Closed,
}

/// 도메인 이벤트 수신자.
#[async_trait]
pub trait EventNotifier: Send + Sync {
    async fn notify(&self, event: &DomainEvent) -> Result<(), NotifyError>;

    fn name(&self) -> &str;
}

/// 이벤트를 로그로만 남기는 수신자.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl EventNotifier for TracingNotifier {
    async fn notify(&self, event: &DomainEvent) -> Result<(), NotifyError> {
        match event {
            DomainEvent::PositionOpened {
                position_id,
                user_id,
                symbol,
                side,
                entry_price,
                leverage,
            } => info!(
                position_id = %position_id,
                user_id = %user_id,
                symbol = %symbol,
                side = %side,
                entry_price = %entry_price,
                leverage = ?leverage,
                "PositionOpened"
            ),
            DomainEvent::PositionClosed {
                position_id,
                user_id,
                realized_pnl,
            } => info!(
                position_id = %position_id,
                user_id = %user_id,
                realized_pnl = %realized_pnl,
                "PositionClosed"
            ),
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "tracing"
    }
}

/// 이벤트를 채널로 넘기는 수신자.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::Sender<DomainEvent>,
}

impl ChannelNotifier {
    pub fn new(tx: mpsc::Sender<DomainEvent>) -> Self {
        Self { tx }
    }

    /// 수신자와 받는 쪽 채널을 함께 생성.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<DomainEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl EventNotifier for ChannelNotifier {
    async fn notify(&self, event: &DomainEvent) -> Result<(), NotifyError> {
        self.tx
            .send(event.clone())
            .await
            .map_err(|_| NotifyError::Closed)
    }

    fn name(&self) -> &str {
        "channel"
    }
}

// ==================== 디스패처 ====================

/// 디스패처 설정.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// 폴링 간격
    pub poll_interval: Duration,
    /// 한 번에 읽을 최대 항목 수
    pub batch_size: usize,
    /// 이 횟수를 넘긴 항목은 에러 로그로 승격
    pub alert_after_attempts: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
            alert_after_attempts: 10,
        }
    }
}

/// 한 번의 폴링 결과.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

/// 아웃박스 디스패처.
pub struct OutboxDispatcher {
    store: Arc<dyn LedgerStore>,
    notifiers: Vec<Arc<dyn EventNotifier>>,
    config: DispatcherConfig,
}

impl OutboxDispatcher {
    pub fn new(store: Arc<dyn LedgerStore>, config: DispatcherConfig) -> Self {
        Self {
            store,
            notifiers: Vec::new(),
            config,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn EventNotifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    /// 종료 신호까지 주기적으로 전달. 종료 직전 한 번 더 비웁니다.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            notifiers = self.notifiers.len(),
            poll_ms = self.config.poll_interval.as_millis() as u64,
            "아웃박스 디스패처 시작"
        );
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.dispatch_once().await {
                        error!(error = %e, "아웃박스 조회 실패");
                    }
                }
                _ = shutdown.cancelled() => {
                    if let Err(e) = self.dispatch_once().await {
                        error!(error = %e, "종료 전 아웃박스 전달 실패");
                    }
                    info!("아웃박스 디스패처 종료");
                    break;
                }
            }
        }
    }

    /// 미전달 항목을 순서대로 전달.
    ///
    /// 실패한 항목에서 멈춰 같은 포지션의 이벤트 순서를 지킵니다.
    pub async fn dispatch_once(&self) -> Result<DispatchReport, StoreError> {
        let mut report = DispatchReport::default();
        let entries = self.store.pending_outbox(self.config.batch_size).await?;

        for entry in entries {
            match self.deliver(&entry.event).await {
                Ok(()) => {
                    self.store.ack_outbox(entry.id).await?;
                    report.delivered += 1;
                    debug!(
                        entry_id = %entry.id,
                        kind = entry.event.kind(),
                        position_id = %entry.event.position_id(),
                        "아웃박스 전달 완료"
                    );
                }
                Err(e) => {
                    self.store.record_outbox_attempt(entry.id).await?;
                    report.failed += 1;
                    let attempts = entry.attempts + 1;
                    if attempts >= self.config.alert_after_attempts {
                        error!(
                            entry_id = %entry.id,
                            attempt = attempts,
                            error = %e,
                            "아웃박스 전달 반복 실패"
                        );
                    } else {
                        warn!(entry_id = %entry.id, attempt = attempts, error = %e, "아웃박스 전달 실패");
                    }
                    break;
                }
            }
        }
        Ok(report)
    }

    async fn deliver(&self, event: &DomainEvent) -> Result<(), NotifyError> {
        for notifier in &self.notifiers {
            notifier.notify(event).await.map_err(|e| {
                NotifyError::Delivery(format!("{}: {}", notifier.name(), e))
            })?;
        }
        Ok(())
    }
}
