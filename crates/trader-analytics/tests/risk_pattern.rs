//! 리스크 패턴 분석 통합 테스트.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use trader_analytics::{AnalyzerConfig, RiskPatternAnalyzer};
use trader_core::{
    Credential, ExchangeKind, FillStatus, LedgerStore, LedgerUnit, Order, OrderType, OutboxEntry,
    Position, PositionEffect, PositionSide, PositionStatus, RawFill, RiskPattern, Side,
    StoreError, TradingJournal,
};
use trader_data::MemoryLedgerStore;
use uuid::Uuid;

fn base_time() -> DateTime<Utc> {
    // 2023-11-14T22:13:20Z
    DateTime::<Utc>::from_timestamp_millis(1_700_000_000_000).unwrap()
}

fn minutes(m: i64) -> chrono::Duration {
    chrono::Duration::minutes(m)
}

fn raw_fill(
    symbol: &str,
    side: Side,
    effect: PositionEffect,
    price: Decimal,
    at: DateTime<Utc>,
) -> RawFill {
    RawFill {
        exchange: ExchangeKind::Bybit,
        exchange_order_id: Uuid::new_v4().to_string(),
        symbol: symbol.to_string(),
        side,
        effect,
        status: FillStatus::Filled,
        order_type: OrderType::Market,
        quantity: Decimal::ONE,
        price,
        fee: Decimal::ZERO,
        realized_pnl: Decimal::ZERO,
        timestamp: at,
        reduce_only: effect == PositionEffect::Close,
        position_index: 0,
        sequence: None,
        leverage: None,
    }
}

/// 진입 후 `hold`만큼 보유하고 청산한 포지션.
fn closed_position(
    user: Uuid,
    symbol: &str,
    side: PositionSide,
    entry_at: DateTime<Utc>,
    entry: Decimal,
    exit: Decimal,
    hold: chrono::Duration,
) -> Position {
    let (open_side, close_side) = match side {
        PositionSide::Long => (Side::Buy, Side::Sell),
        PositionSide::Short => (Side::Sell, Side::Buy),
    };
    let mut position = Position::open_from(
        user,
        &raw_fill(symbol, open_side, PositionEffect::Open, entry, entry_at),
    )
    .unwrap();
    position
        .apply_close(&raw_fill(
            symbol,
            close_side,
            PositionEffect::Close,
            exit,
            entry_at + hold,
        ))
        .unwrap();
    assert_eq!(position.status, PositionStatus::ClosedMapped);
    position
}

fn long(
    user: Uuid,
    symbol: &str,
    entry_at: DateTime<Utc>,
    entry: Decimal,
    exit: Decimal,
    hold: chrono::Duration,
) -> Position {
    closed_position(user, symbol, PositionSide::Long, entry_at, entry, exit, hold)
}

fn short(
    user: Uuid,
    symbol: &str,
    entry_at: DateTime<Utc>,
    entry: Decimal,
    exit: Decimal,
    hold: chrono::Duration,
) -> Position {
    closed_position(user, symbol, PositionSide::Short, entry_at, entry, exit, hold)
}

async fn save(store: &MemoryLedgerStore, positions: &[Position]) {
    let unit = positions
        .iter()
        .cloned()
        .fold(LedgerUnit::new(), |unit, p| unit.with_position(p));
    store.commit(unit).await.unwrap();
}

fn analyzer(store: Arc<dyn LedgerStore>) -> RiskPatternAnalyzer {
    RiskPatternAnalyzer::new(
        store,
        AnalyzerConfig {
            cache_ttl: None,
            ..AnalyzerConfig::default()
        },
    )
}

async fn analyze_around_base(analyzer: &RiskPatternAnalyzer, user: Uuid) -> RiskPattern {
    analyzer
        .analyze(
            user,
            base_time() - chrono::Duration::days(1),
            base_time() + chrono::Duration::days(1),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn test_three_entries_within_short_window_count_trailing_two() {
    let store = Arc::new(MemoryLedgerStore::new());
    let user = Uuid::new_v4();
    let t = base_time();
    save(
        &store,
        &[
            long(user, "BTCUSDT", t, dec!(40000), dec!(40100), minutes(2)),
            long(user, "BTCUSDT", t + minutes(5), dec!(40000), dec!(40100), minutes(2)),
            long(user, "BTCUSDT", t + minutes(10), dec!(40000), dec!(40100), minutes(2)),
            long(user, "ETHUSDT", t + minutes(60), dec!(2000), dec!(2010), minutes(2)),
        ],
    )
    .await;

    let pattern = analyze_around_base(&analyzer(store.clone()), user).await;
    assert_eq!(pattern.total_trades, 4);
    assert_eq!(pattern.impulsive_trades, 2);
    assert_eq!(pattern.impulsive_trade_rate, Some(dec!(50)));
    assert_eq!(pattern.emotional_reentries, 0);
    assert_eq!(pattern.emotional_reentry_rate, Some(dec!(0)));
    assert_eq!(pattern.overall_win_rate, Some(dec!(100)));
    // 손실이 없으면 손익비 없음
    assert_eq!(pattern.avg_risk_reward, None);
}

#[tokio::test]
async fn test_reentry_after_losing_close_is_emotional() {
    let store = Arc::new(MemoryLedgerStore::new());
    let user = Uuid::new_v4();
    let t = base_time();
    save(
        &store,
        &[
            // 손실 청산: t+10m
            long(user, "BTCUSDT", t, dec!(40000), dec!(39500), minutes(10)),
            // 다른 종목은 무관
            long(user, "ETHUSDT", t + minutes(12), dec!(2000), dec!(2010), minutes(5)),
            // 반대 방향이라도 같은 종목이면 재진입
            short(user, "BTCUSDT", t + minutes(20), dec!(39500), dec!(39600), minutes(5)),
            // 창 밖
            long(user, "BTCUSDT", t + minutes(60), dec!(39600), dec!(39700), minutes(5)),
        ],
    )
    .await;

    let pattern = analyze_around_base(&analyzer(store.clone()), user).await;
    assert_eq!(pattern.emotional_reentries, 1);
    assert_eq!(pattern.emotional_reentry_rate, Some(dec!(25)));
    assert_eq!(pattern.impulsive_trades, 0);
}

#[tokio::test]
async fn test_plan_stop_loss_and_take_profit_metrics() {
    let store = Arc::new(MemoryLedgerStore::new());
    let user = Uuid::new_v4();
    let t = base_time();

    let mut stopped_late = long(user, "BTCUSDT", t, dec!(40000), dec!(38000), minutes(30));
    stopped_late.averaging_down_entries = 1;
    stopped_late.market_condition = Some("trend".to_string());
    let mut early_exit =
        long(user, "BTCUSDT", t + minutes(60), dec!(40000), dec!(41000), minutes(30));
    early_exit.market_condition = Some("trend".to_string());
    let unplanned = short(user, "BTCUSDT", t + minutes(120), dec!(40000), dec!(39000), minutes(30));
    let stopped_on_plan =
        long(user, "BTCUSDT", t + minutes(180), dec!(40000), dec!(39500), minutes(30));
    save(
        &store,
        &[
            stopped_late.clone(),
            early_exit.clone(),
            unplanned.clone(),
            stopped_on_plan.clone(),
        ],
    )
    .await;

    for journal in [
        TradingJournal::for_position(&stopped_late)
            .unwrap()
            .with_plan(None, Some(dec!(39000))),
        TradingJournal::for_position(&early_exit)
            .unwrap()
            .with_plan(Some(dec!(42000)), None),
        TradingJournal::for_position(&stopped_on_plan)
            .unwrap()
            .with_plan(None, Some(dec!(39500))),
    ] {
        store.upsert_journal(journal).await.unwrap();
    }

    let pattern = analyze_around_base(&analyzer(store.clone()), user).await;

    assert_eq!(pattern.unplanned_entries, Some(1));
    assert_eq!(pattern.unplanned_entry_rate, Some(dec!(25)));
    assert_eq!(pattern.planned_win_rate, Some(dec!(33.33)));
    assert_eq!(pattern.unplanned_win_rate, Some(dec!(100)));

    assert_eq!(pattern.stop_loss_violations, Some(1));
    assert_eq!(pattern.stop_loss_violation_rate, Some(dec!(50)));
    assert_eq!(pattern.avg_stop_loss_slippage, Some(dec!(2.56)));

    assert_eq!(pattern.early_take_profits, Some(1));
    assert_eq!(pattern.early_take_profit_rate, Some(dec!(100)));

    assert_eq!(pattern.averaging_down_trades, 1);
    assert_eq!(pattern.averaging_down_rate, Some(dec!(25)));
    assert_eq!(pattern.avg_risk_reward, Some(dec!(0.8)));
    assert_eq!(pattern.overall_win_rate, Some(dec!(50)));

    assert_eq!(pattern.hourly_win_rates.get(&22), Some(&dec!(0)));
    assert_eq!(pattern.hourly_win_rates.get(&23), Some(&dec!(100)));
    assert_eq!(pattern.market_condition_win_rates.get("trend"), Some(&dec!(50)));
}

#[tokio::test]
async fn test_empty_window_reports_absent_rates() {
    let store = Arc::new(MemoryLedgerStore::new());
    let user = Uuid::new_v4();

    let pattern = analyze_around_base(&analyzer(store.clone()), user).await;
    assert_eq!(pattern.total_trades, 0);
    assert_eq!(pattern.unplanned_entries, Some(0));
    assert_eq!(pattern.unplanned_entry_rate, None);
    assert_eq!(pattern.emotional_reentry_rate, None);
    assert_eq!(pattern.impulsive_trade_rate, None);
    assert_eq!(pattern.stop_loss_violation_rate, None);
    assert_eq!(pattern.early_take_profit_rate, None);
    assert_eq!(pattern.averaging_down_rate, None);
    assert_eq!(pattern.overall_win_rate, None);
    assert!(pattern.hourly_win_rates.is_empty());
}

#[tokio::test]
async fn test_invalid_window_is_rejected() {
    let store = Arc::new(MemoryLedgerStore::new());
    let result = analyzer(store)
        .analyze(Uuid::new_v4(), base_time(), base_time() - minutes(1))
        .await;
    assert!(result.is_err());
}

// ==================== 일지 조회 실패 ====================

/// 일지 조회만 실패하는 저장소.
struct JournalOutageStore {
    inner: MemoryLedgerStore,
}

#[async_trait]
impl LedgerStore for JournalOutageStore {
    async fn find_order(
        &self,
        user_id: Uuid,
        exchange: ExchangeKind,
        exchange_order_id: &str,
    ) -> Result<Option<Order>, StoreError> {
        self.inner.find_order(user_id, exchange, exchange_order_id).await
    }

    async fn orders_for_position(&self, position_id: Uuid) -> Result<Vec<Order>, StoreError> {
        self.inner.orders_for_position(position_id).await
    }

    async fn orphan_orders(&self, max_attempts: u32) -> Result<Vec<Order>, StoreError> {
        self.inner.orphan_orders(max_attempts).await
    }

    async fn find_active_position(
        &self,
        user_id: Uuid,
        exchange: ExchangeKind,
        symbol: &str,
        side: PositionSide,
    ) -> Result<Option<Position>, StoreError> {
        self.inner
            .find_active_position(user_id, exchange, symbol, side)
            .await
    }

    async fn find_unmapped_position(
        &self,
        user_id: Uuid,
        exchange: ExchangeKind,
        symbol: &str,
        side: PositionSide,
    ) -> Result<Option<Position>, StoreError> {
        self.inner
            .find_unmapped_position(user_id, exchange, symbol, side)
            .await
    }

    async fn get_position(&self, id: Uuid) -> Result<Option<Position>, StoreError> {
        self.inner.get_position(id).await
    }

    async fn positions_by_status(
        &self,
        status: PositionStatus,
    ) -> Result<Vec<Position>, StoreError> {
        self.inner.positions_by_status(status).await
    }

    async fn closed_positions(
        &self,
        user_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Position>, StoreError> {
        self.inner.closed_positions(user_id, from, to).await
    }

    async fn count_unmapped_positions(&self) -> Result<u64, StoreError> {
        self.inner.count_unmapped_positions().await
    }

    async fn commit(&self, unit: LedgerUnit) -> Result<(), StoreError> {
        self.inner.commit(unit).await
    }

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        self.inner.pending_outbox(limit).await
    }

    async fn ack_outbox(&self, id: Uuid) -> Result<(), StoreError> {
        self.inner.ack_outbox(id).await
    }

    async fn record_outbox_attempt(&self, id: Uuid) -> Result<(), StoreError> {
        self.inner.record_outbox_attempt(id).await
    }

    async fn journals_for_user(&self, _user_id: Uuid) -> Result<Vec<TradingJournal>, StoreError> {
        Err(StoreError::Database("connection reset".to_string()))
    }

    async fn upsert_journal(&self, journal: TradingJournal) -> Result<(), StoreError> {
        self.inner.upsert_journal(journal).await
    }

    async fn load_risk_pattern(&self, user_id: Uuid) -> Result<Option<RiskPattern>, StoreError> {
        self.inner.load_risk_pattern(user_id).await
    }

    async fn save_risk_pattern(&self, pattern: RiskPattern) -> Result<(), StoreError> {
        self.inner.save_risk_pattern(pattern).await
    }

    async fn list_credentials(&self, active_only: bool) -> Result<Vec<Credential>, StoreError> {
        self.inner.list_credentials(active_only).await
    }

    async fn get_credential(&self, id: Uuid) -> Result<Option<Credential>, StoreError> {
        self.inner.get_credential(id).await
    }

    async fn save_credential(&self, credential: Credential) -> Result<(), StoreError> {
        self.inner.save_credential(credential).await
    }

    async fn set_credential_active(&self, id: Uuid, active: bool) -> Result<(), StoreError> {
        self.inner.set_credential_active(id, active).await
    }
}

#[tokio::test]
async fn test_journal_outage_degrades_only_journal_metrics() {
    let store = JournalOutageStore {
        inner: MemoryLedgerStore::new(),
    };
    let user = Uuid::new_v4();
    let t = base_time();
    save(
        &store.inner,
        &[
            long(user, "BTCUSDT", t, dec!(40000), dec!(39000), minutes(5)),
            long(user, "BTCUSDT", t + minutes(8), dec!(39000), dec!(39500), minutes(5)),
        ],
    )
    .await;

    let pattern = analyze_around_base(&analyzer(Arc::new(store)), user).await;
    assert_eq!(pattern.total_trades, 2);
    assert_eq!(pattern.unplanned_entries, None);
    assert_eq!(pattern.unplanned_entry_rate, None);
    assert_eq!(pattern.planned_win_rate, None);
    assert_eq!(pattern.stop_loss_violations, None);
    assert_eq!(pattern.early_take_profits, None);
    // 일지와 무관한 지표는 유지
    assert_eq!(pattern.overall_win_rate, Some(dec!(50)));
    assert_eq!(pattern.emotional_reentries, 1);
    assert_eq!(pattern.avg_risk_reward, Some(dec!(0.5)));
}

// ==================== 스냅샷 캐시 ====================

#[tokio::test]
async fn test_snapshot_is_cached_and_persisted() {
    let store = Arc::new(MemoryLedgerStore::new());
    let user = Uuid::new_v4();
    let recent = Utc::now() - chrono::Duration::hours(3);
    save(
        &store,
        &[long(user, "BTCUSDT", recent, dec!(40000), dec!(40400), minutes(10))],
    )
    .await;

    let analyzer = RiskPatternAnalyzer::new(
        store.clone(),
        AnalyzerConfig {
            cache_ttl: Some(Duration::from_secs(600)),
            ..AnalyzerConfig::default()
        },
    );

    let first = analyzer.snapshot(user).await.unwrap();
    assert_eq!(first.total_trades, 1);
    assert_eq!(
        store.load_risk_pattern(user).await.unwrap().map(|p| p.total_trades),
        Some(1)
    );

    save(
        &store,
        &[long(user, "ETHUSDT", recent + minutes(60), dec!(2000), dec!(1990), minutes(10))],
    )
    .await;
    assert_eq!(analyzer.snapshot(user).await.unwrap().total_trades, 1);

    analyzer.invalidate(user).await;
    assert_eq!(analyzer.snapshot(user).await.unwrap().total_trades, 2);
}
