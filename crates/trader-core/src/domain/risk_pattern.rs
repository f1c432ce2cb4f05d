//! 사용자별 행동 리스크 패턴 스냅샷.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 리스크 패턴 집계 결과 (사용자당 1개, 캐시 대상).
///
/// 비율은 0~100 퍼센트(소수 둘째 자리 반올림)이며,
/// 분모가 0이거나 일지 조회에 실패하면 `None`입니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskPattern {
    pub user_id: Uuid,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub total_trades: u32,

    // 계획 없는 진입
    pub unplanned_entries: Option<u32>,
    pub unplanned_entry_rate: Option<Decimal>,
    pub planned_win_rate: Option<Decimal>,
    pub unplanned_win_rate: Option<Decimal>,

    // 감정적 재진입
    pub emotional_reentries: u32,
    pub emotional_reentry_rate: Option<Decimal>,

    // 충동 매매 연쇄
    pub impulsive_trades: u32,
    pub impulsive_trade_rate: Option<Decimal>,

    // 손절 위반
    pub stop_loss_violations: Option<u32>,
    pub stop_loss_violation_rate: Option<Decimal>,
    pub avg_stop_loss_slippage: Option<Decimal>,

    // 조기 익절
    pub early_take_profits: Option<u32>,
    pub early_take_profit_rate: Option<Decimal>,

    // 물타기
    pub averaging_down_trades: u32,
    pub averaging_down_rate: Option<Decimal>,

    pub avg_risk_reward: Option<Decimal>,
    pub overall_win_rate: Option<Decimal>,
    /// UTC 진입 시각(0~23)별 승률
    pub hourly_win_rates: BTreeMap<u32, Decimal>,
    /// 시장 상황 태그별 승률
    pub market_condition_win_rates: BTreeMap<String, Decimal>,

    pub computed_at: DateTime<Utc>,
}

impl RiskPattern {
    /// 거래가 없는 빈 스냅샷.
    pub fn empty(user_id: Uuid, window_start: DateTime<Utc>, window_end: DateTime<Utc>) -> Self {
        Self {
            user_id,
            window_start,
            window_end,
            total_trades: 0,
            unplanned_entries: None,
            unplanned_entry_rate: None,
            planned_win_rate: None,
            unplanned_win_rate: None,
            emotional_reentries: 0,
            emotional_reentry_rate: None,
            impulsive_trades: 0,
            impulsive_trade_rate: None,
            stop_loss_violations: None,
            stop_loss_violation_rate: None,
            avg_stop_loss_slippage: None,
            early_take_profits: None,
            early_take_profit_rate: None,
            averaging_down_trades: 0,
            averaging_down_rate: None,
            avg_risk_reward: None,
            overall_win_rate: None,
            hourly_win_rates: BTreeMap::new(),
            market_condition_win_rates: BTreeMap::new(),
            computed_at: Utc::now(),
        }
    }
}
