//! 체결 → 포지션 정합성 엔진.
//!
//! 이 crate는 다음을 제공합니다:
//! - 체결/스냅샷 정합 규칙 ([`Reconciler`])
//! - (user, exchange, symbol) 단위 직렬화 엔진 ([`ReconciliationEngine`])
//! - 아웃박스 디스패처 ([`OutboxDispatcher`])
//! - CLOSED_UNMAPPED/고아 주문 재시도 워커 ([`MappingRetryWorker`])
//! - 헬스 요약 ([`LedgerStatus`])

pub mod engine;
pub mod error;
pub mod outbox;
pub mod reconciler;
pub mod retry_worker;
pub mod status;

pub use engine::{EngineConfig, LedgerKey, ReconciliationEngine};
pub use error::{ReconcileError, ReconciliationConflict};
pub use outbox::{
    ChannelNotifier, DispatchReport, DispatcherConfig, EventNotifier, NotifyError,
    OutboxDispatcher, TracingNotifier,
};
pub use reconciler::{FillOutcome, Reconciler, RetryDecision, SnapshotOutcome};
pub use retry_worker::{BackfillRequester, MappingRetryConfig, MappingRetryWorker, RetryReport};
pub use status::LedgerStatus;
