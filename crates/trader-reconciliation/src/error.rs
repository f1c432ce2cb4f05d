//! 정합성 엔진 에러 타입.

use thiserror::Error;
use trader_core::{ExchangeKind, PositionError, StoreError};
use uuid::Uuid;

/// 정합성 엔진 에러.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("저장소 에러: {0}")]
    Store(#[from] StoreError),

    #[error("포지션 상태 에러: {0}")]
    Position(#[from] PositionError),

    #[error("엔진이 종료됨")]
    ShutDown,
}

impl ReconcileError {
    /// 같은 체결을 다시 적용하면 성공할 수 있는 에러인지.
    ///
    /// 포지션 상태 에러는 입력이 같으면 결과도 같으므로 재시도하지 않습니다.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReconcileError::Store(StoreError::Database(_) | StoreError::Conflict(_))
        )
    }
}

/// 청산 체결을 매핑할 포지션이 없음.
///
/// 에러로 전파하지 않고 고아 주문(매핑 FAILED)으로 기록합니다.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("정합성 충돌: user={user_id}, exchange={exchange}, order={exchange_order_id}, symbol={symbol}")]
pub struct ReconciliationConflict {
    pub user_id: Uuid,
    pub exchange: ExchangeKind,
    pub exchange_order_id: String,
    pub symbol: String,
}
