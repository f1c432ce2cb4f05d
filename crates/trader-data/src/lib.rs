//! 원장 저장소 구현.
//!
//! - [`storage::MemoryLedgerStore`]: 프로세스 메모리 저장소 (DB 미설정 시, 테스트)
//! - [`storage::PgLedgerStore`]: PostgreSQL 저장소 (sqlx 트랜잭션)

pub mod storage;

pub use storage::{MemoryLedgerStore, PgLedgerStore};
