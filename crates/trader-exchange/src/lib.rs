//! 암호화폐 선물 거래소 연결 계층.
//!
//! 이 crate는 다음을 제공합니다:
//! - 거래소별 서명 ([`signing`])
//! - 태그 분기 어댑터 ([`adapter::ExchangeAdapter`]): Binance, Bybit, Bitget
//! - 제한된 REST 실행 풀 ([`adapter::RestPool`])
//! - 자격증명별 스트리밍 세션 관리 ([`session::ConnectionManager`])

pub mod adapter;
pub mod error;
pub mod retry;
pub mod session;
pub mod signing;

// 주요 타입 재내보내기
pub use adapter::{
    AdapterSettings, ExchangeAdapter, ExchangeEndpoints, RestPool, StreamEvent, StreamTarget,
};
pub use error::ExchangeError;
pub use retry::{with_retry, ReconnectBackoff, RetryConfig};
pub use session::{
    ConnectionManager, ConnectionState, SessionConfig, SessionEvent, SessionHealth,
};
pub use signing::SignatureError;
