//! 원장 주문 엔티티.
//!
//! 체결된 주문은 FILLED 이후 추가만 되고 수정되지 않습니다.
//! 포지션에 매핑되지 못한 청산 주문은 고아 주문(mapping_status=FAILED)으로 남습니다.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ExchangeKind, FillStatus, OrderType, PositionEffect, RawFill, Side};

/// 원장 주문 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    Filled,
    Canceled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Filled => "FILLED",
            Self::Canceled => "CANCELED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "NEW" => Some(Self::New),
            "FILLED" => Some(Self::Filled),
            "CANCELED" => Some(Self::Canceled),
            _ => None,
        }
    }

    /// 체결 상태를 원장 상태로 변환.
    ///
    /// 부분 체결 후 취소/만료된 주문은 CANCELED로 기록합니다.
    pub fn from_fill(status: FillStatus) -> Self {
        match status {
            FillStatus::Filled => Self::Filled,
            FillStatus::Canceled | FillStatus::Expired | FillStatus::Rejected => Self::Canceled,
            FillStatus::New | FillStatus::PartiallyFilled => Self::New,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 포지션 매핑 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MappingStatus {
    Mapped,
    Failed,
}

impl MappingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mapped => "MAPPED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "MAPPED" => Some(Self::Mapped),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// 원장 주문.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    pub exchange: ExchangeKind,
    pub exchange_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub effect: PositionEffect,
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    pub filled_price: Decimal,
    pub fee: Decimal,
    pub realized_pnl: Decimal,
    pub reduce_only: bool,
    pub position_index: u8,
    pub ordered_at: DateTime<Utc>,
    pub filled_at: Option<DateTime<Utc>>,
    /// 매핑된 포지션 (고아 주문은 None)
    pub position_id: Option<Uuid>,
    pub mapping_status: MappingStatus,
    /// 재매핑 시도 횟수
    pub mapping_attempts: u32,
    pub sequence: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl Order {
    /// 체결 이벤트로부터 원장 주문 생성.
    pub fn from_fill(user_id: Uuid, fill: &RawFill, position_id: Option<Uuid>) -> Self {
        let status = OrderStatus::from_fill(fill.status);
        let mapping_status = if position_id.is_some() {
            MappingStatus::Mapped
        } else {
            MappingStatus::Failed
        };
        Self {
            id: Uuid::new_v4(),
            user_id,
            exchange: fill.exchange,
            exchange_order_id: fill.exchange_order_id.clone(),
            symbol: fill.symbol.clone(),
            side: fill.side,
            order_type: fill.order_type,
            effect: fill.effect,
            status,
            filled_quantity: fill.quantity,
            filled_price: fill.price,
            fee: fill.fee,
            realized_pnl: fill.realized_pnl,
            reduce_only: fill.reduce_only,
            position_index: fill.position_index,
            ordered_at: fill.timestamp,
            filled_at: (fill.quantity > Decimal::ZERO).then_some(fill.timestamp),
            position_id,
            mapping_status,
            mapping_attempts: 0,
            sequence: fill.sequence,
            created_at: Utc::now(),
        }
    }

    /// 포지션에 매핑되지 않은 고아 주문인지.
    pub fn is_orphan(&self) -> bool {
        self.position_id.is_none()
    }

    /// 고아 주문을 포지션에 연결.
    pub fn map_to(&mut self, position_id: Uuid) {
        self.position_id = Some(position_id);
        self.mapping_status = MappingStatus::Mapped;
    }

    /// 원래 체결 이벤트 형태로 복원 (재매핑 시 사용).
    pub fn to_fill(&self) -> RawFill {
        RawFill {
            exchange: self.exchange,
            exchange_order_id: self.exchange_order_id.clone(),
            symbol: self.symbol.clone(),
            side: self.side,
            effect: self.effect,
            status: match self.status {
                OrderStatus::Filled => FillStatus::Filled,
                OrderStatus::Canceled => FillStatus::Canceled,
                OrderStatus::New => FillStatus::New,
            },
            order_type: self.order_type,
            quantity: self.filled_quantity,
            price: self.filled_price,
            fee: self.fee,
            realized_pnl: self.realized_pnl,
            timestamp: self.filled_at.unwrap_or(self.ordered_at),
            reduce_only: self.reduce_only,
            position_index: self.position_index,
            sequence: self.sequence,
            leverage: None,
        }
    }
}
