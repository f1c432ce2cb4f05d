//! 세션 이벤트 → 정합 엔진 전달.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trader_exchange::SessionEvent;
use trader_reconciliation::{ReconcileError, ReconciliationEngine};

/// 세션 이벤트를 엔진의 키 워커로 넘기는 브리지.
pub struct EventBridge {
    engine: Arc<ReconciliationEngine>,
}

impl EventBridge {
    pub fn new(engine: Arc<ReconciliationEngine>) -> Self {
        Self { engine }
    }

    /// 이벤트 하나 전달.
    pub async fn forward(&self, event: SessionEvent) -> Result<(), ReconcileError> {
        match event {
            SessionEvent::Fill { user_id, fill, .. } => {
                self.engine.submit_fill(user_id, fill).await
            }
            SessionEvent::Position {
                user_id, position, ..
            } => self.engine.submit_snapshot(user_id, position).await,
            SessionEvent::Backfill {
                user_id,
                credential_id,
                fills,
            } => {
                debug!(
                    user_id = %user_id,
                    credential_id = %credential_id,
                    count = fills.len(),
                    "백필 체결 전달"
                );
                self.engine.submit_backfill(user_id, fills).await
            }
        }
    }

    /// 채널이 닫히거나 `stop`이 취소될 때까지 전달.
    ///
    /// `stop` 이후에는 새 이벤트를 받지 않고, 이미 버퍼에 있는 이벤트만 마저 전달합니다.
    pub async fn run(self, mut events: mpsc::Receiver<SessionEvent>, stop: CancellationToken) {
        let mut forwarded: u64 = 0;
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = stop.cancelled() => {
                    events.close();
                    break;
                }
            };
            match event {
                Some(event) => {
                    if !self.deliver(event).await {
                        return;
                    }
                    forwarded += 1;
                }
                None => break,
            }
        }

        // 버퍼에 남은 이벤트
        while let Some(event) = events.recv().await {
            if !self.deliver(event).await {
                return;
            }
            forwarded += 1;
        }
        info!(forwarded, "이벤트 브리지 종료");
    }

    /// 엔진이 종료되었으면 `false`.
    async fn deliver(&self, event: SessionEvent) -> bool {
        match self.forward(event).await {
            Ok(()) => true,
            Err(ReconcileError::ShutDown) => {
                warn!("엔진 종료됨, 이벤트 전달 중단");
                false
            }
            Err(e) => {
                warn!(error = %e, "이벤트 전달 실패");
                true
            }
        }
    }
}
