//! 거래소 체결/포지션 원시 이벤트.
//!
//! 거래소 어댑터가 각 거래소 고유 페이로드를 변환한 결과물입니다.
//! 한 번 생성되면 변경되지 않으며, 대사 엔진이 한 번만 소비합니다.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{ExchangeKind, PositionEffect, PositionSide, Side};

/// 거래소 주문 상태 (거래소별 어휘를 정규화한 값).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FillStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Expired,
    Rejected,
}

impl FillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::PartiallyFilled => "PARTIALLY_FILLED",
            Self::Filled => "FILLED",
            Self::Canceled => "CANCELED",
            Self::Expired => "EXPIRED",
            Self::Rejected => "REJECTED",
        }
    }

    /// 더 이상 체결이 추가되지 않는 최종 상태인지.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Canceled | Self::Expired | Self::Rejected
        )
    }
}

impl fmt::Display for FillStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 주문 유형.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
    StopMarket,
    StopLimit,
    TakeProfit,
    Liquidation,
    Other,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Market => "MARKET",
            Self::Limit => "LIMIT",
            Self::StopMarket => "STOP_MARKET",
            Self::StopLimit => "STOP_LIMIT",
            Self::TakeProfit => "TAKE_PROFIT",
            Self::Liquidation => "LIQUIDATION",
            Self::Other => "OTHER",
        }
    }

    /// 거래소 주문 유형 문자열을 느슨하게 매핑.
    pub fn parse_loose(value: &str) -> Self {
        let upper = value.trim().to_uppercase();
        match upper.as_str() {
            "MARKET" => Self::Market,
            "LIMIT" => Self::Limit,
            "STOP" | "STOP_LIMIT" => Self::StopLimit,
            "STOP_MARKET" | "STOPLOSS" | "STOP_LOSS" => Self::StopMarket,
            "TAKE_PROFIT" | "TAKE_PROFIT_MARKET" | "TAKEPROFIT" => Self::TakeProfit,
            "LIQUIDATION" => Self::Liquidation,
            _ => Self::Other,
        }
    }
}

impl FromStr for OrderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse_loose(s))
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 거래소가 보고한 주문 체결.
///
/// 수량/가격/수수료/실현손익은 해당 주문의 누적값입니다.
/// (부분 체결은 어댑터에서 최종 상태까지 합산합니다)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFill {
    /// 거래소
    pub exchange: ExchangeKind,
    /// 거래소 주문 ID (멱등성 키)
    pub exchange_order_id: String,
    /// 심볼 (예: "BTCUSDT")
    pub symbol: String,
    /// 매수/매도
    pub side: Side,
    /// 진입/청산
    pub effect: PositionEffect,
    /// 주문 상태
    pub status: FillStatus,
    /// 주문 유형
    pub order_type: OrderType,
    /// 누적 체결 수량
    pub quantity: Decimal,
    /// 평균 체결가
    pub price: Decimal,
    /// 누적 수수료 (양수 = 비용)
    pub fee: Decimal,
    /// 실현 손익 기여분
    pub realized_pnl: Decimal,
    /// 거래소 체결 시각
    pub timestamp: DateTime<Utc>,
    /// reduce-only 여부
    pub reduce_only: bool,
    /// 헤지 모드 슬롯 (0=단방향, 1=롱, 2=숏)
    pub position_index: u8,
    /// 거래소 시퀀스 번호 (제공되는 경우)
    pub sequence: Option<u64>,
    /// 체결 시점 레버리지 (주문 이벤트나 계정 스트림에서 알 수 있는 경우)
    #[serde(default)]
    pub leverage: Option<Decimal>,
}

impl RawFill {
    /// 원장에 저장할 대상인지 판단.
    ///
    /// FILLED, 또는 체결 수량이 있는 CANCELED/EXPIRED만 저장합니다.
    pub fn is_persistable(&self) -> bool {
        match self.status {
            FillStatus::Filled => self.quantity > Decimal::ZERO,
            FillStatus::Canceled | FillStatus::Expired => self.quantity > Decimal::ZERO,
            _ => false,
        }
    }

    /// 이 체결이 속하는 포지션 방향.
    pub fn position_side(&self) -> PositionSide {
        self.effect.target_side(self.side, self.position_index)
    }

    /// 같은 키 안에서 적용 순서를 정하는 정렬 키.
    ///
    /// 타임스탬프 → 시퀀스 번호 순. 시퀀스가 없으면 도착 순서를 유지합니다.
    pub fn ordering_key(&self) -> (DateTime<Utc>, u64) {
        (self.timestamp, self.sequence.unwrap_or(u64::MAX))
    }
}

/// 거래소 포지션 스냅샷 (거래소 기준 현재 상태).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPosition {
    pub exchange: ExchangeKind,
    pub symbol: String,
    pub side: PositionSide,
    /// 부호 있는 수량 (숏은 음수로 보고하는 거래소도 있음)
    pub size: Decimal,
    pub entry_price: Decimal,
    pub leverage: Option<Decimal>,
    pub unrealized_pnl: Decimal,
    pub liquidation_price: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

impl RawPosition {
    /// 포지션이 거래소 기준으로 청산(0) 상태인지.
    pub fn is_flat(&self) -> bool {
        self.size.is_zero()
    }

    /// 절대 수량.
    pub fn abs_size(&self) -> Decimal {
        self.size.abs()
    }
}
