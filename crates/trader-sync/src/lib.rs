//! 거래 원장 동기화 데몬.
//!
//! 자격증명별 거래소 스트리밍 세션을 유지하고,
//! 세션 이벤트를 정합 엔진으로 전달합니다.

pub mod bridge;
pub mod config;
pub mod credentials;
pub mod error;
pub mod stats;

pub use bridge::EventBridge;
pub use config::SyncConfig;
pub use credentials::CredentialSync;
pub use error::{Result, SyncError};
pub use stats::SyncStats;
