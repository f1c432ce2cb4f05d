//! 원장/세션 상태 요약.

use chrono::{DateTime, Utc};
use trader_core::{LedgerStore, StoreError};
use trader_exchange::{ConnectionState, SessionHealth};

/// 헬스 체크 스냅샷.
#[derive(Debug, Clone)]
pub struct LedgerStatus {
    pub sessions: Vec<SessionHealth>,
    /// CLOSED_UNMAPPED 포지션 수
    pub unmapped_positions: u64,
    /// 미전달 아웃박스 항목 수 (조회 한도까지)
    pub pending_events: usize,
    pub checked_at: DateTime<Utc>,
}

impl LedgerStatus {
    /// 아웃박스 적체 조회 한도.
    pub const OUTBOX_PROBE_LIMIT: usize = 1000;

    pub async fn collect(
        store: &dyn LedgerStore,
        sessions: Vec<SessionHealth>,
    ) -> Result<Self, StoreError> {
        let unmapped_positions = store.count_unmapped_positions().await?;
        let pending_events = store.pending_outbox(Self::OUTBOX_PROBE_LIMIT).await?.len();
        Ok(Self {
            sessions,
            unmapped_positions,
            pending_events,
            checked_at: Utc::now(),
        })
    }

    /// 모든 세션이 구독 상태인지.
    pub fn all_sessions_healthy(&self) -> bool {
        self.sessions.iter().all(|s| s.state.is_healthy())
    }

    /// 상태별 세션 수.
    pub fn count_in(&self, state: ConnectionState) -> usize {
        self.sessions.iter().filter(|s| s.state == state).count()
    }

    /// 한 줄 요약 (로그용).
    pub fn summary(&self) -> String {
        format!(
            "sessions={} subscribed={} degraded={} unmapped={} pending_events={}",
            self.sessions.len(),
            self.count_in(ConnectionState::Subscribed),
            self.count_in(ConnectionState::Degraded),
            self.unmapped_positions,
            self.pending_events
        )
    }
}
