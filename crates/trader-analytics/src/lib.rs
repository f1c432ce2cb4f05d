//! 원장 기반 행동 리스크 분석.
//!
//! - [`RiskPatternAnalyzer`]: 청산 포지션 + 매매 일지 → [`trader_core::RiskPattern`]
//! - [`RiskPatternCache`]: 사용자별 TTL 캐시

pub mod cache;
pub mod risk_pattern;

pub use cache::RiskPatternCache;
pub use risk_pattern::{percentage, AnalyticsError, AnalyzerConfig, RiskPatternAnalyzer};
