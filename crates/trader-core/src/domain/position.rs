//! 포지션 애그리거트.
//!
//! 상태 전이:
//!
//! ```text
//! OPEN ──► CLOSING ──► CLOSED_MAPPED
//!   │          │
//!   │          └──────► CLOSED_UNMAPPED ──► CLOSED_MAPPED
//!   │                          │
//!   └──► CLOSED_MAPPED         └──────────► FAILED
//! ```
//!
//! 청산 필드(exit_time, exit_price, realized_pnl)는 OPEN/CLOSING 동안 비어 있고,
//! CLOSED_MAPPED/FAILED에서는 고정됩니다. CLOSED_UNMAPPED의 청산 필드는 잠정값이며
//! 늦게 도착한 청산 체결로 승격될 때만 갱신됩니다.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::{ExchangeKind, PositionEffect, PositionSide, RawFill};

/// 포지션 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Open,
    /// 거래소는 flat을 보고했지만 청산 체결이 아직 모두 도착하지 않음
    Closing,
    /// 청산 체결로 완전히 매핑됨 (구버전 `CLOSED`도 이 값으로 읽음)
    #[serde(alias = "CLOSED")]
    ClosedMapped,
    /// 마감 기한까지 청산 체결이 부족함
    ClosedUnmapped,
    /// 재시도 한도 초과
    Failed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Closing => "CLOSING",
            Self::ClosedMapped => "CLOSED_MAPPED",
            Self::ClosedUnmapped => "CLOSED_UNMAPPED",
            Self::Failed => "FAILED",
        }
    }

    /// 저장된 문자열 파싱. 구버전 `CLOSED`는 `CLOSED_MAPPED`로 취급.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "OPEN" => Some(Self::Open),
            "CLOSING" => Some(Self::Closing),
            "CLOSED_MAPPED" | "CLOSED" => Some(Self::ClosedMapped),
            "CLOSED_UNMAPPED" => Some(Self::ClosedUnmapped),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// 새 체결을 받을 수 있는 활성 상태인지.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Open | Self::Closing)
    }

    /// 청산 계열 상태인지.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            Self::ClosedMapped | Self::ClosedUnmapped | Self::Failed
        )
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 허용되지 않는 상태 전이.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PositionError {
    #[error("잘못된 상태 전이: {from} → {to}")]
    InvalidTransition {
        from: PositionStatus,
        to: PositionStatus,
    },

    #[error("체결 방향이 포지션과 맞지 않음: position={position}, fill={fill}")]
    SideMismatch {
        position: PositionSide,
        fill: PositionSide,
    },

    #[error("진입 체결이 아님")]
    NotAnOpenFill,
}

/// 청산 체결 적용 결과.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseOutcome {
    /// 실제 반영된 수량
    pub applied: Decimal,
    /// 잔여 수량을 초과해 버려진 수량
    pub excess: Decimal,
    /// 반영된 수량에 귀속된 실현손익 (주문 레코드에도 같은 값 기록)
    pub pnl: Decimal,
    /// 이 체결로 청산 계열 상태에 진입했는지
    pub closed: bool,
}

/// 포지션 애그리거트 루트.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub user_id: Uuid,
    pub exchange: ExchangeKind,
    pub symbol: String,
    pub side: PositionSide,
    pub entry_time: DateTime<Utc>,
    /// 가중 평균 진입가
    pub entry_price: Decimal,
    /// 누적 진입 수량
    pub quantity: Decimal,
    /// 누적 청산 수량 (항상 quantity 이하)
    pub closed_quantity: Decimal,
    pub leverage: Option<Decimal>,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_price: Option<Decimal>,
    pub realized_pnl: Option<Decimal>,
    /// 진입/청산 전체 수수료
    pub total_fee: Decimal,
    pub target_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    /// 시장 상황 태그 (예: "trending", "ranging")
    pub market_condition: Option<String>,
    pub status: PositionStatus,
    /// CLOSING 마감 기한
    pub closing_deadline: Option<DateTime<Utc>>,
    /// CLOSED_UNMAPPED 재시도 횟수
    pub mapping_retries: u32,
    /// 진입 체결 수
    pub entry_count: u32,
    /// 평가손 상태에서 추가 진입한 횟수
    pub averaging_down_entries: u32,
    /// 마지막 거래소 스냅샷 수량
    pub last_snapshot_size: Option<Decimal>,
    /// 청산 체결 누적 (수량 × 가격)
    pub close_notional: Decimal,
    /// 청산 체결 누적 실현손익
    pub accumulated_pnl: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// 진입 체결로 새 포지션 생성.
    pub fn open_from(user_id: Uuid, fill: &RawFill) -> Result<Self, PositionError> {
        if fill.effect != PositionEffect::Open {
            return Err(PositionError::NotAnOpenFill);
        }
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            user_id,
            exchange: fill.exchange,
            symbol: fill.symbol.clone(),
            side: fill.position_side(),
            entry_time: fill.timestamp,
            entry_price: fill.price,
            quantity: fill.quantity,
            closed_quantity: Decimal::ZERO,
            leverage: fill.leverage,
            exit_time: None,
            exit_price: None,
            realized_pnl: None,
            total_fee: fill.fee,
            target_price: None,
            stop_price: None,
            market_condition: None,
            status: PositionStatus::Open,
            closing_deadline: None,
            mapping_retries: 0,
            entry_count: 1,
            averaging_down_entries: 0,
            last_snapshot_size: None,
            close_notional: Decimal::ZERO,
            accumulated_pnl: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        })
    }

    /// 남은 보유 수량.
    pub fn remaining_quantity(&self) -> Decimal {
        self.quantity - self.closed_quantity
    }

    /// 주어진 가격에서 평가손 상태인지.
    pub fn is_under_water(&self, price: Decimal) -> bool {
        match self.side {
            PositionSide::Long => price < self.entry_price,
            PositionSide::Short => price > self.entry_price,
        }
    }

    /// 방향 부호 (롱=+1, 숏=-1).
    fn direction(&self) -> Decimal {
        match self.side {
            PositionSide::Long => Decimal::ONE,
            PositionSide::Short => Decimal::NEGATIVE_ONE,
        }
    }

    /// 추가 진입 체결 반영 (평균 단가 갱신).
    ///
    /// 평가손 상태에서의 추가 진입은 물타기로 집계합니다.
    pub fn add_entry(&mut self, fill: &RawFill) -> Result<(), PositionError> {
        if fill.effect != PositionEffect::Open {
            return Err(PositionError::NotAnOpenFill);
        }
        self.ensure_side(fill)?;
        if !self.status.is_active() {
            return Err(PositionError::InvalidTransition {
                from: self.status,
                to: PositionStatus::Open,
            });
        }

        if self.is_under_water(fill.price) {
            self.averaging_down_entries += 1;
        }

        let total = self.quantity + fill.quantity;
        if !total.is_zero() {
            self.entry_price =
                (self.entry_price * self.quantity + fill.price * fill.quantity) / total;
        }
        self.quantity = total;
        self.total_fee += fill.fee;
        self.entry_count += 1;
        if fill.leverage.is_some() {
            self.leverage = fill.leverage;
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// 청산 체결 반영.
    ///
    /// 청산 수량이 진입 수량에 도달하면 CLOSED_MAPPED로 전이합니다.
    /// CLOSED_UNMAPPED 포지션에 늦게 도착한 체결도 받아서 승격합니다.
    pub fn apply_close(&mut self, fill: &RawFill) -> Result<CloseOutcome, PositionError> {
        self.ensure_side(fill)?;
        if !(self.status.is_active() || self.status == PositionStatus::ClosedUnmapped) {
            return Err(PositionError::InvalidTransition {
                from: self.status,
                to: PositionStatus::ClosedMapped,
            });
        }

        let remaining = self.remaining_quantity();
        let applied = fill.quantity.min(remaining).max(Decimal::ZERO);
        let excess = fill.quantity - applied;

        let mut pnl = Decimal::ZERO;
        if !applied.is_zero() {
            // 부분 반영 시 거래소 실현손익도 같은 비율로 나눔
            pnl = if fill.realized_pnl.is_zero() {
                (fill.price - self.entry_price) * applied * self.direction()
            } else if excess.is_zero() {
                fill.realized_pnl
            } else {
                fill.realized_pnl * applied / fill.quantity
            };
            self.closed_quantity += applied;
            self.close_notional += fill.price * applied;
            self.accumulated_pnl += pnl;
        }
        self.total_fee += fill.fee;
        self.updated_at = Utc::now();

        let fully_closed = self.remaining_quantity() <= Decimal::ZERO;
        let closed = if fully_closed {
            let was_closed = self.status.is_closed();
            self.finalize(PositionStatus::ClosedMapped, fill.timestamp)?;
            !was_closed
        } else {
            if self.status == PositionStatus::ClosedUnmapped {
                self.refresh_exit_fields(self.exit_time.unwrap_or(fill.timestamp));
            }
            false
        };

        Ok(CloseOutcome {
            applied,
            excess,
            pnl,
            closed,
        })
    }

    /// 거래소 flat 스냅샷 수신: OPEN → CLOSING.
    pub fn mark_closing(&mut self, deadline: DateTime<Utc>) -> Result<(), PositionError> {
        match self.status {
            PositionStatus::Open => {
                self.status = PositionStatus::Closing;
                self.closing_deadline = Some(deadline);
                self.updated_at = Utc::now();
                Ok(())
            }
            // 이미 CLOSING이면 기한 유지
            PositionStatus::Closing => Ok(()),
            from => Err(PositionError::InvalidTransition {
                from,
                to: PositionStatus::Closing,
            }),
        }
    }

    /// CLOSING 기한이 지났는지.
    pub fn closing_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == PositionStatus::Closing
            && self.closing_deadline.is_some_and(|deadline| now >= deadline)
    }

    /// CLOSING 기한 만료: CLOSING → CLOSED_UNMAPPED.
    pub fn expire_closing(&mut self, now: DateTime<Utc>) -> Result<(), PositionError> {
        if self.status != PositionStatus::Closing {
            return Err(PositionError::InvalidTransition {
                from: self.status,
                to: PositionStatus::ClosedUnmapped,
            });
        }
        self.finalize(PositionStatus::ClosedUnmapped, now)
    }

    /// 재시도 한도 초과: CLOSED_UNMAPPED → FAILED.
    pub fn mark_failed(&mut self) -> Result<(), PositionError> {
        if self.status != PositionStatus::ClosedUnmapped {
            return Err(PositionError::InvalidTransition {
                from: self.status,
                to: PositionStatus::Failed,
            });
        }
        self.status = PositionStatus::Failed;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// 스냅샷 수량 기록. 원장 잔량과의 차이(드리프트)를 반환.
    pub fn record_snapshot(&mut self, size: Decimal) -> Decimal {
        self.last_snapshot_size = Some(size);
        self.updated_at = Utc::now();
        size.abs() - self.remaining_quantity()
    }

    fn finalize(&mut self, to: PositionStatus, at: DateTime<Utc>) -> Result<(), PositionError> {
        let allowed = match (self.status, to) {
            (PositionStatus::Open, PositionStatus::ClosedMapped)
            | (PositionStatus::Closing, PositionStatus::ClosedMapped)
            | (PositionStatus::Closing, PositionStatus::ClosedUnmapped)
            | (PositionStatus::ClosedUnmapped, PositionStatus::ClosedMapped) => true,
            _ => false,
        };
        if !allowed {
            return Err(PositionError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        let exit_time = match self.status {
            PositionStatus::ClosedUnmapped => self.exit_time.unwrap_or(at).max(at),
            _ => at,
        };
        self.status = to;
        self.closing_deadline = None;
        self.refresh_exit_fields(exit_time);
        Ok(())
    }

    fn refresh_exit_fields(&mut self, exit_time: DateTime<Utc>) {
        self.exit_time = Some(exit_time);
        self.exit_price = if self.closed_quantity.is_zero() {
            None
        } else {
            Some(self.close_notional / self.closed_quantity)
        };
        self.realized_pnl = Some(self.accumulated_pnl);
        self.updated_at = Utc::now();
    }

    fn ensure_side(&self, fill: &RawFill) -> Result<(), PositionError> {
        let fill_side = fill.position_side();
        if fill_side != self.side {
            return Err(PositionError::SideMismatch {
                position: self.side,
                fill: fill_side,
            });
        }
        Ok(())
    }

    /// 수익 포지션 여부 (수수료 제외 실현손익 기준).
    pub fn is_win(&self) -> Option<bool> {
        self.realized_pnl.map(|pnl| pnl > Decimal::ZERO)
    }

    /// 청산 후 실현손익에서 수수료를 뺀 순손익.
    pub fn net_pnl(&self) -> Option<Decimal> {
        self.realized_pnl.map(|pnl| pnl - self.total_fee)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FillStatus, OrderType, Side};
    use chrono::Duration;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn fill(side: Side, effect: PositionEffect, qty: Decimal, price: Decimal) -> RawFill {
        RawFill {
            exchange: ExchangeKind::Bybit,
            exchange_order_id: Uuid::new_v4().to_string(),
            symbol: "BTCUSDT".to_string(),
            side,
            effect,
            status: FillStatus::Filled,
            order_type: OrderType::Market,
            quantity: qty,
            price,
            fee: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            timestamp: Utc::now(),
            reduce_only: effect == PositionEffect::Close,
            position_index: 0,
            sequence: None,
            leverage: None,
        }
    }

    #[test]
    fn test_long_round_trip() {
        let user = Uuid::new_v4();
        let mut position = Position::open_from(
            user,
            &fill(Side::Buy, PositionEffect::Open, dec!(0.1), dec!(40000)),
        )
        .unwrap();
        assert_eq!(position.status, PositionStatus::Open);
        assert!(position.exit_price.is_none());

        let outcome = position
            .apply_close(&fill(Side::Sell, PositionEffect::Close, dec!(0.1), dec!(42000)))
            .unwrap();
        assert!(outcome.closed);
        assert_eq!(outcome.pnl, dec!(200));
        assert_eq!(position.status, PositionStatus::ClosedMapped);
        assert_eq!(position.realized_pnl, Some(dec!(200)));
        assert_eq!(position.exit_price, Some(dec!(42000)));
    }

    #[test]
    fn test_leverage_taken_from_entry_fills() {
        let mut first = fill(Side::Buy, PositionEffect::Open, dec!(1), dec!(100));
        first.leverage = Some(dec!(5));
        let mut position = Position::open_from(Uuid::new_v4(), &first).unwrap();
        assert_eq!(position.leverage, Some(dec!(5)));

        // 레버리지를 모르는 추가 진입은 기존 값 유지
        position
            .add_entry(&fill(Side::Buy, PositionEffect::Open, dec!(1), dec!(101)))
            .unwrap();
        assert_eq!(position.leverage, Some(dec!(5)));

        let mut raised = fill(Side::Buy, PositionEffect::Open, dec!(1), dec!(102));
        raised.leverage = Some(dec!(10));
        position.add_entry(&raised).unwrap();
        assert_eq!(position.leverage, Some(dec!(10)));
    }

    #[test]
    fn test_averaging_down_counted() {
        let mut position = Position::open_from(
            Uuid::new_v4(),
            &fill(Side::Sell, PositionEffect::Open, dec!(1), dec!(100)),
        )
        .unwrap();
        // 숏에서 더 높은 가격 진입 = 물타기
        position
            .add_entry(&fill(Side::Sell, PositionEffect::Open, dec!(1), dec!(110)))
            .unwrap();
        assert_eq!(position.averaging_down_entries, 1);
        assert_eq!(position.entry_count, 2);
        assert_eq!(position.entry_price, dec!(105));
    }

    #[test]
    fn test_closing_then_unmapped_then_promoted() {
        let mut position = Position::open_from(
            Uuid::new_v4(),
            &fill(Side::Buy, PositionEffect::Open, dec!(2), dec!(10)),
        )
        .unwrap();
        let now = Utc::now();
        position.mark_closing(now + Duration::seconds(30)).unwrap();
        assert!(!position.closing_expired(now));
        assert!(position.closing_expired(now + Duration::seconds(31)));

        position.expire_closing(now + Duration::seconds(31)).unwrap();
        assert_eq!(position.status, PositionStatus::ClosedUnmapped);
        assert!(position.exit_time.is_some());

        let outcome = position
            .apply_close(&fill(Side::Sell, PositionEffect::Close, dec!(2), dec!(12)))
            .unwrap();
        assert!(!outcome.closed);
        assert_eq!(position.status, PositionStatus::ClosedMapped);
        assert_eq!(position.realized_pnl, Some(dec!(4)));
    }

    #[test]
    fn test_failed_only_from_unmapped() {
        let mut position = Position::open_from(
            Uuid::new_v4(),
            &fill(Side::Buy, PositionEffect::Open, dec!(1), dec!(10)),
        )
        .unwrap();
        assert!(position.mark_failed().is_err());
    }

    #[test]
    fn test_legacy_closed_alias() {
        assert_eq!(
            PositionStatus::parse("CLOSED"),
            Some(PositionStatus::ClosedMapped)
        );
        let parsed: PositionStatus = serde_json::from_str("\"CLOSED\"").unwrap();
        assert_eq!(parsed, PositionStatus::ClosedMapped);
    }

    proptest! {
        /// 청산 수량은 진입 수량을 넘지 않고, 완전 청산 시에만 CLOSED_MAPPED.
        #[test]
        fn prop_close_quantity_conserved(
            opens in proptest::collection::vec(1u32..1000, 1..5),
            closes in proptest::collection::vec(1u32..1000, 0..8),
        ) {
            let mut position = Position::open_from(
                Uuid::new_v4(),
                &fill(Side::Buy, PositionEffect::Open, Decimal::from(opens[0]), dec!(100)),
            ).unwrap();
            for qty in opens.iter().skip(1) {
                position.add_entry(
                    &fill(Side::Buy, PositionEffect::Open, Decimal::from(*qty), dec!(99)),
                ).unwrap();
            }
            let opened: u32 = opens.iter().sum();
            prop_assert_eq!(position.quantity, Decimal::from(opened));

            let mut closed_total = Decimal::ZERO;
            let mut pnl_total = Decimal::ZERO;
            for qty in closes {
                if position.status.is_closed() {
                    break;
                }
                let outcome = position.apply_close(
                    &fill(Side::Sell, PositionEffect::Close, Decimal::from(qty), dec!(101)),
                ).unwrap();
                closed_total += outcome.applied;
                pnl_total += outcome.pnl;
                prop_assert_eq!(outcome.applied + outcome.excess, Decimal::from(qty));
            }

            prop_assert!(position.closed_quantity <= position.quantity);
            prop_assert_eq!(position.closed_quantity, closed_total);
            if position.status.is_closed() {
                prop_assert_eq!(position.realized_pnl, Some(pnl_total));
            }
            prop_assert_eq!(
                position.status == PositionStatus::ClosedMapped,
                position.closed_quantity == position.quantity
            );
        }
    }
}
