//! 에러 타입 정의.

use thiserror::Error;
use trader_analytics::AnalyticsError;
use trader_core::{CryptoError, StoreError};
use trader_exchange::ExchangeError;
use trader_reconciliation::ReconcileError;
use uuid::Uuid;

/// 동기화 데몬 에러 타입
#[derive(Debug, Error)]
pub enum SyncError {
    /// 설정 에러
    #[error("설정 에러: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// 자격증명 복호화 실패
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error(transparent)]
    Analytics(#[from] AnalyticsError),

    /// passphrase가 필요한 거래소인데 저장된 값이 없음
    #[error("passphrase 누락: credential_id={0}")]
    MissingPassphrase(Uuid),
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, SyncError>;
