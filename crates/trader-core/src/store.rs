//! 원장 저장소 추상화.
//!
//! 포지션/주문 변경과 그에 따른 도메인 이벤트는 [`LedgerUnit`] 하나로 묶어
//! [`LedgerStore::commit`]에서 원자적으로 반영됩니다.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{
    Credential, DomainEvent, ExchangeKind, Order, OutboxEntry, Position, PositionSide,
    PositionStatus, RiskPattern, TradingJournal,
};

/// 저장소 에러.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("데이터를 찾을 수 없음: {0}")]
    NotFound(String),

    #[error("제약 조건 충돌: {0}")]
    Conflict(String),

    #[error("데이터베이스 에러: {0}")]
    Database(String),

    #[error("직렬화 에러: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// 한 트랜잭션으로 반영할 변경 묶음.
#[derive(Debug, Clone, Default)]
pub struct LedgerUnit {
    /// id 기준 upsert
    pub positions: Vec<Position>,
    /// (user, exchange, exchange_order_id) 기준 upsert
    pub orders: Vec<Order>,
    /// 아웃박스에 추가할 이벤트
    pub events: Vec<DomainEvent>,
}

impl LedgerUnit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.positions.push(position);
        self
    }

    pub fn with_order(mut self, order: Order) -> Self {
        self.orders.push(order);
        self
    }

    pub fn with_event(mut self, event: DomainEvent) -> Self {
        self.events.push(event);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty() && self.orders.is_empty() && self.events.is_empty()
    }
}

/// 원장 저장소.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    // ===== 주문 =====

    /// 거래소 주문 ID로 주문 조회 (멱등성 확인).
    async fn find_order(
        &self,
        user_id: Uuid,
        exchange: ExchangeKind,
        exchange_order_id: &str,
    ) -> Result<Option<Order>, StoreError>;

    /// 포지션에 매핑된 주문 목록.
    async fn orders_for_position(&self, position_id: Uuid) -> Result<Vec<Order>, StoreError>;

    /// 재매핑 한도 미만의 고아 주문.
    async fn orphan_orders(&self, max_attempts: u32) -> Result<Vec<Order>, StoreError>;

    // ===== 포지션 =====

    /// (user, exchange, symbol, side)의 OPEN/CLOSING 포지션.
    async fn find_active_position(
        &self,
        user_id: Uuid,
        exchange: ExchangeKind,
        symbol: &str,
        side: PositionSide,
    ) -> Result<Option<Position>, StoreError>;

    /// (user, exchange, symbol, side)의 가장 최근 CLOSED_UNMAPPED 포지션.
    async fn find_unmapped_position(
        &self,
        user_id: Uuid,
        exchange: ExchangeKind,
        symbol: &str,
        side: PositionSide,
    ) -> Result<Option<Position>, StoreError>;

    async fn get_position(&self, id: Uuid) -> Result<Option<Position>, StoreError>;

    async fn positions_by_status(
        &self,
        status: PositionStatus,
    ) -> Result<Vec<Position>, StoreError>;

    /// 기간 내 청산된 포지션 (exit_time 기준, 오름차순).
    async fn closed_positions(
        &self,
        user_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Position>, StoreError>;

    /// CLOSED_UNMAPPED 포지션 수.
    async fn count_unmapped_positions(&self) -> Result<u64, StoreError>;

    // ===== 원자적 반영 =====

    /// 포지션/주문/이벤트를 하나의 트랜잭션으로 반영.
    async fn commit(&self, unit: LedgerUnit) -> Result<(), StoreError>;

    // ===== 아웃박스 =====

    /// 미전달 아웃박스 항목 (생성 순).
    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError>;

    /// 전달 완료 표시.
    async fn ack_outbox(&self, id: Uuid) -> Result<(), StoreError>;

    /// 전달 시도 횟수 증가.
    async fn record_outbox_attempt(&self, id: Uuid) -> Result<(), StoreError>;

    // ===== 매매 일지 =====

    async fn journals_for_user(&self, user_id: Uuid) -> Result<Vec<TradingJournal>, StoreError>;

    async fn upsert_journal(&self, journal: TradingJournal) -> Result<(), StoreError>;

    // ===== 리스크 패턴 =====

    async fn load_risk_pattern(&self, user_id: Uuid) -> Result<Option<RiskPattern>, StoreError>;

    async fn save_risk_pattern(&self, pattern: RiskPattern) -> Result<(), StoreError>;

    // ===== 자격증명 =====

    async fn list_credentials(&self, active_only: bool) -> Result<Vec<Credential>, StoreError>;

    async fn get_credential(&self, id: Uuid) -> Result<Option<Credential>, StoreError>;

    async fn save_credential(&self, credential: Credential) -> Result<(), StoreError>;

    async fn set_credential_active(&self, id: Uuid, active: bool) -> Result<(), StoreError>;
}
