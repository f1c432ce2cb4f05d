//! 체결 → 포지션 정합 규칙.
//!
//! [`Reconciler`]는 한 키(user, exchange, symbol)의 변경을 순서대로 적용한다고
//! 가정합니다. 키 단위 직렬화는 [`crate::engine::ReconciliationEngine`]이 담당합니다.
//!
//! # 처리 순서
//!
//! 1. (user, exchange, exchange_order_id)로 중복 제거
//! 2. FILLED 또는 체결 수량이 있는 CANCELED/EXPIRED만 저장
//! 3. 진입 체결: OPEN/CLOSING 포지션에 합산하거나 새 포지션 생성
//! 4. 청산 체결: 활성 포지션 → 최근 CLOSED_UNMAPPED 승격 → 고아 주문 순으로 시도
//!
//! 포지션/주문 변경과 도메인 이벤트는 하나의 [`LedgerUnit`]으로 커밋됩니다.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use trader_core::{
    DomainEvent, LedgerStore, LedgerUnit, Order, Position, PositionEffect, PositionStatus,
    RawFill, RawPosition,
};
use uuid::Uuid;

use crate::error::{ReconcileError, ReconciliationConflict};

/// 체결 하나를 적용한 결과.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FillOutcome {
    /// 이미 기록된 주문
    Duplicate,
    /// 저장 대상이 아닌 체결 (부분 체결 진행 중, 미체결 취소)
    Discarded,
    /// 새 포지션 생성
    Opened { position_id: Uuid },
    /// 기존 포지션에 추가 진입
    Increased { position_id: Uuid },
    /// 일부 청산
    Reduced { position_id: Uuid },
    /// 전량 청산 (CLOSED_MAPPED)
    Closed { position_id: Uuid },
    /// CLOSED_UNMAPPED 포지션에 늦게 도착한 청산 반영
    Promoted { position_id: Uuid, mapped: bool },
    /// 매핑 실패, 고아 주문으로 기록
    Orphaned(ReconciliationConflict),
}

/// 포지션 스냅샷 적용 결과.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// 원장 잔량과 일치
    InSync,
    /// 원장 잔량과 다름 (거래소 수량 - 원장 잔량)
    Drift(Decimal),
    /// 거래소가 flat을 보고해 CLOSING으로 전이
    MarkedClosing { position_id: Uuid },
    /// 원장에 대응 포지션 없음
    Untracked,
}

/// CLOSED_UNMAPPED 재시도 판정.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// 재시도 횟수를 올리고 백필 요청 대상
    Retry,
    /// 한도 초과로 FAILED 처리
    Failed,
    /// 이미 다른 상태로 바뀜
    Skipped,
}

/// 원장 정합 규칙 적용기.
pub struct Reconciler {
    store: Arc<dyn LedgerStore>,
    closing_timeout: Duration,
}

impl Reconciler {
    pub fn new(store: Arc<dyn LedgerStore>, closing_timeout: Duration) -> Self {
        Self {
            store,
            closing_timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    // ==================== 체결 ====================

    /// 체결 이벤트 하나를 원장에 반영.
    pub async fn apply_fill(
        &self,
        user_id: Uuid,
        fill: &RawFill,
    ) -> Result<FillOutcome, ReconcileError> {
        if self
            .store
            .find_order(user_id, fill.exchange, &fill.exchange_order_id)
            .await?
            .is_some()
        {
            debug!(
                user_id = %user_id,
                exchange = %fill.exchange,
                order_id = %fill.exchange_order_id,
                "중복 체결 무시"
            );
            return Ok(FillOutcome::Duplicate);
        }

        if !fill.is_persistable() {
            debug!(
                order_id = %fill.exchange_order_id,
                status = fill.status.as_str(),
                quantity = %fill.quantity,
                "저장 대상 아닌 체결 무시"
            );
            return Ok(FillOutcome::Discarded);
        }

        match fill.effect {
            PositionEffect::Open => self.apply_open(user_id, fill).await,
            PositionEffect::Close => self.apply_close(user_id, fill).await,
        }
    }

    async fn apply_open(
        &self,
        user_id: Uuid,
        fill: &RawFill,
    ) -> Result<FillOutcome, ReconcileError> {
        let active = self
            .store
            .find_active_position(user_id, fill.exchange, &fill.symbol, fill.position_side())
            .await?;

        let (position, outcome, event) = match active {
            Some(mut position) => {
                position.add_entry(fill)?;
                let outcome = FillOutcome::Increased {
                    position_id: position.id,
                };
                (position, outcome, None)
            }
            None => {
                let position = Position::open_from(user_id, fill)?;
                let event = DomainEvent::opened(&position);
                let outcome = FillOutcome::Opened {
                    position_id: position.id,
                };
                info!(
                    user_id = %user_id,
                    exchange = %fill.exchange,
                    symbol = %fill.symbol,
                    side = %position.side,
                    entry_price = %position.entry_price,
                    quantity = %position.quantity,
                    "포지션 진입"
                );
                (position, outcome, Some(event))
            }
        };

        let order = Order::from_fill(user_id, fill, Some(position.id));
        let mut unit = LedgerUnit::new().with_position(position).with_order(order);
        if let Some(event) = event {
            unit = unit.with_event(event);
        }
        self.store.commit(unit).await?;
        Ok(outcome)
    }

    async fn apply_close(
        &self,
        user_id: Uuid,
        fill: &RawFill,
    ) -> Result<FillOutcome, ReconcileError> {
        match self.find_close_target(user_id, fill).await? {
            Some(position) => self.close_into(user_id, fill, position, None).await,
            None => {
                let conflict = ReconciliationConflict {
                    user_id,
                    exchange: fill.exchange,
                    exchange_order_id: fill.exchange_order_id.clone(),
                    symbol: fill.symbol.clone(),
                };
                warn!(
                    user_id = %user_id,
                    exchange = %fill.exchange,
                    symbol = %fill.symbol,
                    order_id = %fill.exchange_order_id,
                    "매핑할 포지션 없음, 고아 주문으로 기록"
                );
                let order = Order::from_fill(user_id, fill, None);
                self.store
                    .commit(LedgerUnit::new().with_order(order))
                    .await?;
                Ok(FillOutcome::Orphaned(conflict))
            }
        }
    }

    /// 청산 체결이 들어갈 포지션 탐색.
    ///
    /// 활성 포지션이 우선이고, 없으면 같은 키의 가장 최근 CLOSED_UNMAPPED.
    /// 체결 시각이 진입 시각보다 앞서면 그 포지션의 청산이 아닙니다.
    async fn find_close_target(
        &self,
        user_id: Uuid,
        fill: &RawFill,
    ) -> Result<Option<Position>, ReconcileError> {
        let side = fill.position_side();
        let active = self
            .store
            .find_active_position(user_id, fill.exchange, &fill.symbol, side)
            .await?;
        if let Some(position) = active.filter(|p| fill.timestamp >= p.entry_time) {
            return Ok(Some(position));
        }

        let unmapped = self
            .store
            .find_unmapped_position(user_id, fill.exchange, &fill.symbol, side)
            .await?;
        Ok(unmapped.filter(|p| fill.timestamp >= p.entry_time))
    }

    /// 청산 체결을 포지션에 반영하고 주문과 함께 커밋.
    ///
    /// `existing`이 있으면 그 주문 레코드(고아)를 매핑 상태로 갱신합니다.
    async fn close_into(
        &self,
        user_id: Uuid,
        fill: &RawFill,
        mut position: Position,
        existing: Option<Order>,
    ) -> Result<FillOutcome, ReconcileError> {
        let before = position.status;
        let outcome = position.apply_close(fill)?;
        if !outcome.excess.is_zero() {
            warn!(
                position_id = %position.id,
                order_id = %fill.exchange_order_id,
                excess = %outcome.excess,
                "청산 수량이 잔량 초과, 초과분 무시"
            );
        }

        let entered_closed = position.status != before && position.status.is_closed();
        let result = match (before, position.status) {
            (PositionStatus::ClosedUnmapped, after) => FillOutcome::Promoted {
                position_id: position.id,
                mapped: after == PositionStatus::ClosedMapped,
            },
            (_, PositionStatus::ClosedMapped) => FillOutcome::Closed {
                position_id: position.id,
            },
            _ => FillOutcome::Reduced {
                position_id: position.id,
            },
        };

        if entered_closed {
            info!(
                user_id = %user_id,
                position_id = %position.id,
                symbol = %position.symbol,
                from = %before,
                realized_pnl = ?position.realized_pnl,
                "포지션 청산 매핑 완료"
            );
        }

        // 주문 손익 합계가 포지션 실현손익과 일치하도록 반영분 손익으로 기록
        let mut order = match existing {
            Some(mut order) => {
                order.map_to(position.id);
                order
            }
            None => Order::from_fill(user_id, fill, Some(position.id)),
        };
        order.realized_pnl = outcome.pnl;
        let mut unit = LedgerUnit::new().with_order(order);
        if entered_closed {
            unit = unit.with_event(DomainEvent::closed(&position));
        }
        self.store.commit(unit.with_position(position)).await?;
        Ok(result)
    }

    // ==================== 스냅샷 ====================

    /// 거래소 포지션 스냅샷 반영 (flat 감지, 드리프트 기록).
    pub async fn apply_snapshot(
        &self,
        user_id: Uuid,
        snapshot: &RawPosition,
        now: DateTime<Utc>,
    ) -> Result<SnapshotOutcome, ReconcileError> {
        let active = self
            .store
            .find_active_position(user_id, snapshot.exchange, &snapshot.symbol, snapshot.side)
            .await?;

        let Some(mut position) = active else {
            if snapshot.is_flat() {
                return Ok(SnapshotOutcome::InSync);
            }
            warn!(
                user_id = %user_id,
                exchange = %snapshot.exchange,
                symbol = %snapshot.symbol,
                side = %snapshot.side,
                size = %snapshot.size,
                "드리프트: 원장에 없는 거래소 포지션"
            );
            return Ok(SnapshotOutcome::Untracked);
        };

        if position.leverage.is_none() {
            position.leverage = snapshot.leverage;
        }

        let drift = position.record_snapshot(snapshot.abs_size());
        let outcome = if snapshot.is_flat() && position.status == PositionStatus::Open {
            position.mark_closing(now + self.closing_timeout)?;
            info!(
                user_id = %user_id,
                position_id = %position.id,
                symbol = %position.symbol,
                remaining = %position.remaining_quantity(),
                "거래소 flat 보고, 청산 체결 대기"
            );
            SnapshotOutcome::MarkedClosing {
                position_id: position.id,
            }
        } else if drift.is_zero() || snapshot.is_flat() {
            SnapshotOutcome::InSync
        } else {
            warn!(
                user_id = %user_id,
                position_id = %position.id,
                symbol = %position.symbol,
                exchange_size = %snapshot.abs_size(),
                ledger_size = %position.remaining_quantity(),
                drift = %drift,
                "드리프트: 거래소 수량과 원장 잔량 불일치"
            );
            SnapshotOutcome::Drift(drift)
        };

        self.store
            .commit(LedgerUnit::new().with_position(position))
            .await?;
        Ok(outcome)
    }

    // ==================== 재시도 작업 ====================

    /// CLOSING 기한이 지났으면 CLOSED_UNMAPPED로 전이.
    pub async fn expire_closing(
        &self,
        position_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, ReconcileError> {
        let Some(mut position) = self.store.get_position(position_id).await? else {
            return Ok(false);
        };
        if !position.closing_expired(now) {
            return Ok(false);
        }

        position.expire_closing(now)?;
        warn!(
            user_id = %position.user_id,
            position_id = %position.id,
            symbol = %position.symbol,
            remaining = %position.remaining_quantity(),
            "CLOSING 기한 만료, CLOSED_UNMAPPED로 전이"
        );
        let event = DomainEvent::closed(&position);
        self.store
            .commit(LedgerUnit::new().with_position(position).with_event(event))
            .await?;
        Ok(true)
    }

    /// CLOSED_UNMAPPED 재시도 횟수 증가, 한도 초과면 FAILED.
    pub async fn retry_unmapped(
        &self,
        position_id: Uuid,
        max_retries: u32,
    ) -> Result<RetryDecision, ReconcileError> {
        let Some(mut position) = self.store.get_position(position_id).await? else {
            return Ok(RetryDecision::Skipped);
        };
        if position.status != PositionStatus::ClosedUnmapped {
            return Ok(RetryDecision::Skipped);
        }

        let decision = if position.mapping_retries >= max_retries {
            position.mark_failed()?;
            warn!(
                user_id = %position.user_id,
                position_id = %position.id,
                symbol = %position.symbol,
                retries = position.mapping_retries,
                "청산 매핑 재시도 한도 초과, FAILED 처리"
            );
            RetryDecision::Failed
        } else {
            position.mapping_retries += 1;
            position.updated_at = Utc::now();
            debug!(
                position_id = %position.id,
                attempt = position.mapping_retries,
                "청산 매핑 재시도"
            );
            RetryDecision::Retry
        };

        self.store
            .commit(LedgerUnit::new().with_position(position))
            .await?;
        Ok(decision)
    }

    /// 고아 주문을 포지션에 다시 매핑 시도.
    pub async fn remap_orphan(&self, mut order: Order) -> Result<bool, ReconcileError> {
        if !order.is_orphan() || order.effect != PositionEffect::Close {
            return Ok(false);
        }

        let fill = order.to_fill();
        match self.find_close_target(order.user_id, &fill).await? {
            Some(position) => {
                info!(
                    order_id = %order.exchange_order_id,
                    position_id = %position.id,
                    attempt = order.mapping_attempts + 1,
                    "고아 주문 재매핑"
                );
                order.mapping_attempts += 1;
                self.close_into(order.user_id, &fill, position, Some(order))
                    .await?;
                Ok(true)
            }
            None => {
                order.mapping_attempts += 1;
                debug!(
                    order_id = %order.exchange_order_id,
                    attempt = order.mapping_attempts,
                    "고아 주문 재매핑 실패"
                );
                self.store
                    .commit(LedgerUnit::new().with_order(order))
                    .await?;
                Ok(false)
            }
        }
    }
}
