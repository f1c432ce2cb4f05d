//! 메모리 원장 저장소.
//!
//! DB 연결 없이 데몬을 실행하거나 테스트할 때 사용합니다.
//! 모든 변경은 하나의 쓰기 잠금 안에서 반영되므로 `commit`은 원자적입니다.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use trader_core::{
    Credential, ExchangeKind, LedgerStore, LedgerUnit, Order, OutboxEntry, Position,
    PositionSide, PositionStatus, RiskPattern, StoreError, TradingJournal,
};
use uuid::Uuid;

type OrderKey = (Uuid, ExchangeKind, String);

#[derive(Default)]
struct Tables {
    positions: HashMap<Uuid, Position>,
    orders: HashMap<OrderKey, Order>,
    outbox: Vec<OutboxEntry>,
    /// position_id 기준 (1:1)
    journals: HashMap<Uuid, TradingJournal>,
    risk_patterns: HashMap<Uuid, RiskPattern>,
    credentials: HashMap<Uuid, Credential>,
}

/// 메모리 원장 저장소.
#[derive(Default)]
pub struct MemoryLedgerStore {
    tables: RwLock<Tables>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 저장된 전체 주문 (테스트/진단용).
    pub async fn all_orders(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self.tables.read().await.orders.values().cloned().collect();
        orders.sort_by_key(|o| (o.ordered_at, o.created_at));
        orders
    }

    /// 저장된 전체 포지션 (테스트/진단용).
    pub async fn all_positions(&self) -> Vec<Position> {
        let mut positions: Vec<Position> =
            self.tables.read().await.positions.values().cloned().collect();
        positions.sort_by_key(|p| (p.entry_time, p.created_at));
        positions
    }

    /// 아웃박스 전체 (전달 완료 포함).
    pub async fn all_outbox(&self) -> Vec<OutboxEntry> {
        self.tables.read().await.outbox.clone()
    }
}

fn matches_key(
    position: &Position,
    user_id: Uuid,
    exchange: ExchangeKind,
    symbol: &str,
    side: PositionSide,
) -> bool {
    position.user_id == user_id
        && position.exchange == exchange
        && position.symbol == symbol
        && position.side == side
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn find_order(
        &self,
        user_id: Uuid,
        exchange: ExchangeKind,
        exchange_order_id: &str,
    ) -> Result<Option<Order>, StoreError> {
        let key = (user_id, exchange, exchange_order_id.to_string());
        Ok(self.tables.read().await.orders.get(&key).cloned())
    }

    async fn orders_for_position(&self, position_id: Uuid) -> Result<Vec<Order>, StoreError> {
        let tables = self.tables.read().await;
        let mut orders: Vec<Order> = tables
            .orders
            .values()
            .filter(|o| o.position_id == Some(position_id))
            .cloned()
            .collect();
        orders.sort_by_key(|o| (o.ordered_at, o.sequence));
        Ok(orders)
    }

    async fn orphan_orders(&self, max_attempts: u32) -> Result<Vec<Order>, StoreError> {
        let tables = self.tables.read().await;
        let mut orders: Vec<Order> = tables
            .orders
            .values()
            .filter(|o| o.is_orphan() && o.mapping_attempts < max_attempts)
            .cloned()
            .collect();
        orders.sort_by_key(|o| (o.ordered_at, o.sequence));
        Ok(orders)
    }

    async fn find_active_position(
        &self,
        user_id: Uuid,
        exchange: ExchangeKind,
        symbol: &str,
        side: PositionSide,
    ) -> Result<Option<Position>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .positions
            .values()
            .filter(|p| p.status.is_active() && matches_key(p, user_id, exchange, symbol, side))
            .max_by_key(|p| p.entry_time)
            .cloned())
    }

    async fn find_unmapped_position(
        &self,
        user_id: Uuid,
        exchange: ExchangeKind,
        symbol: &str,
        side: PositionSide,
    ) -> Result<Option<Position>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .positions
            .values()
            .filter(|p| {
                p.status == PositionStatus::ClosedUnmapped
                    && matches_key(p, user_id, exchange, symbol, side)
            })
            .max_by_key(|p| (p.exit_time, p.updated_at))
            .cloned())
    }

    async fn get_position(&self, id: Uuid) -> Result<Option<Position>, StoreError> {
        Ok(self.tables.read().await.positions.get(&id).cloned())
    }

    async fn positions_by_status(
        &self,
        status: PositionStatus,
    ) -> Result<Vec<Position>, StoreError> {
        let tables = self.tables.read().await;
        let mut positions: Vec<Position> = tables
            .positions
            .values()
            .filter(|p| p.status == status)
            .cloned()
            .collect();
        positions.sort_by_key(|p| p.updated_at);
        Ok(positions)
    }

    async fn closed_positions(
        &self,
        user_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Position>, StoreError> {
        let tables = self.tables.read().await;
        let mut positions: Vec<Position> = tables
            .positions
            .values()
            .filter(|p| {
                p.user_id == user_id
                    && p.status.is_closed()
                    && p.exit_time.is_some_and(|t| t >= from && t < to)
            })
            .cloned()
            .collect();
        positions.sort_by_key(|p| p.exit_time);
        Ok(positions)
    }

    async fn count_unmapped_positions(&self) -> Result<u64, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .positions
            .values()
            .filter(|p| p.status == PositionStatus::ClosedUnmapped)
            .count() as u64)
    }

    async fn commit(&self, unit: LedgerUnit) -> Result<(), StoreError> {
        if unit.is_empty() {
            return Ok(());
        }
        let mut tables = self.tables.write().await;
        for position in unit.positions {
            tables.positions.insert(position.id, position);
        }
        for mut order in unit.orders {
            let key = (order.user_id, order.exchange, order.exchange_order_id.clone());
            // 외부 ID 기준 upsert: 기존 행의 내부 ID 유지
            if let Some(existing) = tables.orders.get(&key) {
                order.id = existing.id;
                order.created_at = existing.created_at;
            }
            tables.orders.insert(key, order);
        }
        for event in unit.events {
            tables.outbox.push(OutboxEntry::new(event));
        }
        Ok(())
    }

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .outbox
            .iter()
            .filter(|e| !e.delivered)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn ack_outbox(&self, id: Uuid) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let entry = tables
            .outbox
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("outbox {}", id)))?;
        entry.delivered = true;
        Ok(())
    }

    async fn record_outbox_attempt(&self, id: Uuid) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let entry = tables
            .outbox
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("outbox {}", id)))?;
        entry.attempts += 1;
        Ok(())
    }

    async fn journals_for_user(&self, user_id: Uuid) -> Result<Vec<TradingJournal>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .journals
            .values()
            .filter(|j| j.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn upsert_journal(&self, journal: TradingJournal) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        match tables.positions.get(&journal.position_id) {
            Some(position) if position.status.is_closed() => {}
            Some(_) => {
                return Err(StoreError::Conflict(format!(
                    "청산되지 않은 포지션에 일지 작성 불가: {}",
                    journal.position_id
                )))
            }
            None => {
                return Err(StoreError::NotFound(format!(
                    "position {}",
                    journal.position_id
                )))
            }
        }
        tables.journals.insert(journal.position_id, journal);
        Ok(())
    }

    async fn load_risk_pattern(&self, user_id: Uuid) -> Result<Option<RiskPattern>, StoreError> {
        Ok(self.tables.read().await.risk_patterns.get(&user_id).cloned())
    }

    async fn save_risk_pattern(&self, pattern: RiskPattern) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .risk_patterns
            .insert(pattern.user_id, pattern);
        Ok(())
    }

    async fn list_credentials(&self, active_only: bool) -> Result<Vec<Credential>, StoreError> {
        let tables = self.tables.read().await;
        let mut credentials: Vec<Credential> = tables
            .credentials
            .values()
            .filter(|c| !active_only || c.is_active)
            .cloned()
            .collect();
        credentials.sort_by_key(|c| c.created_at);
        Ok(credentials)
    }

    async fn get_credential(&self, id: Uuid) -> Result<Option<Credential>, StoreError> {
        Ok(self.tables.read().await.credentials.get(&id).cloned())
    }

    async fn save_credential(&self, credential: Credential) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .credentials
            .insert(credential.id, credential);
        Ok(())
    }

    async fn set_credential_active(&self, id: Uuid, active: bool) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let credential = tables
            .credentials
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("credential {}", id)))?;
        if active {
            credential.activate();
        } else {
            credential.deactivate();
        }
        Ok(())
    }
}
