//! 원장 핵심 도메인.
//!
//! 이 crate는 다음을 제공합니다:
//! - 거래소 중립 체결/포지션 이벤트 타입
//! - 포지션/주문 애그리거트와 상태 전이 규칙
//! - 도메인 이벤트와 아웃박스
//! - 저장소 추상화 ([`store::LedgerStore`])
//! - 자격증명 암호화 ([`crypto::CredentialEncryptor`])

pub mod crypto;
pub mod domain;
pub mod store;

// 주요 타입 재내보내기
pub use crypto::{CredentialEncryptor, CryptoError};
pub use domain::*;
pub use store::{LedgerStore, LedgerUnit, StoreError};
