//! 도메인 이벤트와 아웃박스 항목.
//!
//! 이벤트는 상태 변경과 같은 저장 트랜잭션 안에서 아웃박스에 기록되고,
//! 디스패처가 최소 1회 전달을 보장합니다.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Position, PositionSide};

/// 포지션 생명주기 이벤트.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DomainEvent {
    #[serde(rename_all = "camelCase")]
    PositionOpened {
        position_id: Uuid,
        user_id: Uuid,
        symbol: String,
        side: PositionSide,
        entry_price: Decimal,
        leverage: Option<Decimal>,
    },
    #[serde(rename_all = "camelCase")]
    PositionClosed {
        position_id: Uuid,
        user_id: Uuid,
        realized_pnl: Decimal,
    },
}

impl DomainEvent {
    pub fn opened(position: &Position) -> Self {
        Self::PositionOpened {
            position_id: position.id,
            user_id: position.user_id,
            symbol: position.symbol.clone(),
            side: position.side,
            entry_price: position.entry_price,
            leverage: position.leverage,
        }
    }

    pub fn closed(position: &Position) -> Self {
        Self::PositionClosed {
            position_id: position.id,
            user_id: position.user_id,
            realized_pnl: position.realized_pnl.unwrap_or_default(),
        }
    }

    pub fn position_id(&self) -> Uuid {
        match self {
            Self::PositionOpened { position_id, .. } | Self::PositionClosed { position_id, .. } => {
                *position_id
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::PositionOpened { .. } => "PositionOpened",
            Self::PositionClosed { .. } => "PositionClosed",
        }
    }
}

/// 아웃박스 항목.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub event: DomainEvent,
    pub created_at: DateTime<Utc>,
    /// 전달 시도 횟수
    pub attempts: u32,
    pub delivered: bool,
}

impl OutboxEntry {
    pub fn new(event: DomainEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            event,
            created_at: Utc::now(),
            attempts: 0,
            delivered: false,
        }
    }
}
