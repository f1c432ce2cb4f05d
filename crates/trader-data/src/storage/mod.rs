//! [`trader_core::LedgerStore`] 구현체.

pub mod memory;
pub mod postgres;

pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;
