//! 원장 도메인 모델.

pub mod credential;
pub mod event;
pub mod exchange;
pub mod fill;
pub mod journal;
pub mod order;
pub mod position;
pub mod risk_pattern;

pub use credential::{ApiCredential, Credential, CredentialSecrets};
pub use event::{DomainEvent, OutboxEntry};
pub use exchange::{ExchangeKind, PositionEffect, PositionSide, Side};
pub use fill::{FillStatus, OrderType, RawFill, RawPosition};
pub use journal::TradingJournal;
pub use order::{MappingStatus, Order, OrderStatus};
pub use position::{CloseOutcome, Position, PositionError, PositionStatus};
pub use risk_pattern::RiskPattern;
