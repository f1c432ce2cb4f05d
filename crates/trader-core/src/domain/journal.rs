//! 매매 일지.
//!
//! 청산된 포지션 하나에 하나씩 붙는 사용자 기록입니다.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Position, PositionError, PositionStatus};

/// 매매 일지.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingJournal {
    pub id: Uuid,
    pub user_id: Uuid,
    pub position_id: Uuid,
    /// 계획한 목표가
    pub planned_target_price: Option<Decimal>,
    /// 계획한 손절가
    pub planned_stop_price: Option<Decimal>,
    pub entry_scenario: Option<String>,
    pub entry_rationale: Option<String>,
    pub exit_review: Option<String>,
    #[serde(default)]
    pub indicator_tags: Vec<String>,
    #[serde(default)]
    pub timeframe_tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TradingJournal {
    /// 청산된 포지션에 일지 생성.
    pub fn for_position(position: &Position) -> Result<Self, PositionError> {
        if !position.status.is_closed() {
            return Err(PositionError::InvalidTransition {
                from: position.status,
                to: PositionStatus::ClosedMapped,
            });
        }
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            user_id: position.user_id,
            position_id: position.id,
            planned_target_price: None,
            planned_stop_price: None,
            entry_scenario: None,
            entry_rationale: None,
            exit_review: None,
            indicator_tags: Vec::new(),
            timeframe_tags: Vec::new(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn with_plan(mut self, target: Option<Decimal>, stop: Option<Decimal>) -> Self {
        self.planned_target_price = target;
        self.planned_stop_price = stop;
        self
    }

    /// 진입 전에 계획이 있었는지.
    ///
    /// 목표가/손절가/시나리오 중 하나라도 있으면 계획된 진입으로 봅니다.
    pub fn is_planned(&self) -> bool {
        self.planned_target_price.is_some()
            || self.planned_stop_price.is_some()
            || self
                .entry_scenario
                .as_deref()
                .is_some_and(|s| !s.trim().is_empty())
    }
}
