//! 정합성 엔진 통합 테스트 (메모리 저장소).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::Mutex;
use trader_core::{
    Credential, DomainEvent, ExchangeKind, FillStatus, LedgerStore, LedgerUnit, MappingStatus,
    Order, OrderType, OutboxEntry, Position, PositionEffect, PositionSide, PositionStatus, RawFill,
    RawPosition, RiskPattern, Side, StoreError, TradingJournal,
};
use trader_data::MemoryLedgerStore;
use trader_reconciliation::{
    BackfillRequester, ChannelNotifier, DispatcherConfig, EngineConfig, EventNotifier,
    FillOutcome, MappingRetryConfig, MappingRetryWorker, NotifyError, OutboxDispatcher,
    ReconcileError, Reconciler, ReconciliationEngine,
};
use uuid::Uuid;

fn base_time() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(1_700_000_000_000).unwrap()
}

struct FillParams {
    order_id: &'static str,
    side: Side,
    effect: PositionEffect,
    quantity: Decimal,
    price: Decimal,
    offset_secs: i64,
}

fn fill(params: FillParams) -> RawFill {
    RawFill {
        exchange: ExchangeKind::Binance,
        exchange_order_id: params.order_id.to_string(),
        symbol: "BTCUSDT".to_string(),
        side: params.side,
        effect: params.effect,
        status: FillStatus::Filled,
        order_type: OrderType::Market,
        quantity: params.quantity,
        price: params.price,
        fee: dec!(1.6),
        realized_pnl: Decimal::ZERO,
        timestamp: base_time() + chrono::Duration::seconds(params.offset_secs),
        reduce_only: params.effect == PositionEffect::Close,
        position_index: 0,
        sequence: None,
        leverage: None,
    }
}

fn open_long(
    order_id: &'static str,
    quantity: Decimal,
    price: Decimal,
    offset_secs: i64,
) -> RawFill {
    fill(FillParams {
        order_id,
        side: Side::Buy,
        effect: PositionEffect::Open,
        quantity,
        price,
        offset_secs,
    })
}

fn close_long(
    order_id: &'static str,
    quantity: Decimal,
    price: Decimal,
    offset_secs: i64,
) -> RawFill {
    fill(FillParams {
        order_id,
        side: Side::Sell,
        effect: PositionEffect::Close,
        quantity,
        price,
        offset_secs,
    })
}

/// 포지션에 매핑된 청산 주문의 실현손익 합계.
fn close_order_pnl(orders: &[Order]) -> Decimal {
    orders
        .iter()
        .filter(|o| o.effect == PositionEffect::Close)
        .map(|o| o.realized_pnl)
        .sum()
}

fn flat_snapshot() -> RawPosition {
    RawPosition {
        exchange: ExchangeKind::Binance,
        symbol: "BTCUSDT".to_string(),
        side: PositionSide::Long,
        size: Decimal::ZERO,
        entry_price: Decimal::ZERO,
        leverage: Some(dec!(5)),
        unrealized_pnl: Decimal::ZERO,
        liquidation_price: None,
        timestamp: Utc::now(),
    }
}

fn engine(store: Arc<MemoryLedgerStore>, reorder_window: Duration) -> Arc<ReconciliationEngine> {
    Arc::new(ReconciliationEngine::new(
        store,
        EngineConfig {
            reorder_window,
            closing_timeout: Duration::from_secs(30),
            worker_capacity: 64,
            ..EngineConfig::default()
        },
    ))
}

#[derive(Default)]
struct RecordingBackfill {
    requests: Mutex<Vec<(Uuid, ExchangeKind, Vec<String>)>>,
}

#[async_trait]
impl BackfillRequester for RecordingBackfill {
    async fn request_backfill(
        &self,
        user_id: Uuid,
        exchange: ExchangeKind,
        symbols: Vec<String>,
    ) -> usize {
        self.requests.lock().await.push((user_id, exchange, symbols));
        1
    }
}

struct FailingNotifier;

#[async_trait]
impl EventNotifier for FailingNotifier {
    async fn notify(&self, _event: &DomainEvent) -> Result<(), NotifyError> {
        Err(NotifyError::Delivery("webhook 503".to_string()))
    }

    fn name(&self) -> &str {
        "failing"
    }
}

/// 처음 `failures`번의 커밋을 실패시키는 저장소.
struct FlakyStore {
    inner: MemoryLedgerStore,
    failures: AtomicU32,
    commits: AtomicU32,
}

impl FlakyStore {
    fn failing(failures: u32) -> Self {
        Self {
            inner: MemoryLedgerStore::new(),
            failures: AtomicU32::new(failures),
            commits: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl LedgerStore for FlakyStore {
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
        self.commits.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Database("connection reset".to_string()));
        }
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

    async fn journals_for_user(&self, user_id: Uuid) -> Result<Vec<TradingJournal>, StoreError> {
        self.inner.journals_for_user(user_id).await
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

fn flaky_engine(store: Arc<FlakyStore>) -> ReconciliationEngine {
    ReconciliationEngine::new(
        store,
        EngineConfig {
            reorder_window: Duration::ZERO,
            max_fill_attempts: 3,
            retry_delay: Duration::from_secs(3600),
            ..EngineConfig::default()
        },
    )
}

// ==================== 정합 규칙 ====================

#[tokio::test]
async fn test_btc_long_round_trip_realizes_pnl() {
    let store = Arc::new(MemoryLedgerStore::new());
    let reconciler = Reconciler::new(store.clone(), chrono::Duration::seconds(30));
    let user = Uuid::new_v4();

    let opened = reconciler
        .apply_fill(user, &open_long("1", dec!(0.1), dec!(40000), 0))
        .await
        .unwrap();
    let FillOutcome::Opened { position_id } = opened else {
        panic!("진입 결과 아님: {:?}", opened);
    };

    let closed = reconciler
        .apply_fill(user, &close_long("2", dec!(0.1), dec!(42000), 600))
        .await
        .unwrap();
    assert_eq!(closed, FillOutcome::Closed { position_id });

    let position = store.get_position(position_id).await.unwrap().unwrap();
    assert_eq!(position.status, PositionStatus::ClosedMapped);
    assert_eq!(position.realized_pnl, Some(dec!(200)));
    assert_eq!(position.exit_price, Some(dec!(42000)));
    assert_eq!(position.total_fee, dec!(3.2));
    assert_eq!(position.net_pnl(), Some(dec!(196.8)));
    assert_eq!(position.is_win(), Some(true));

    let orders = store.orders_for_position(position_id).await.unwrap();
    assert_eq!(orders.len(), 2);
    assert!(orders.iter().all(|o| o.mapping_status == MappingStatus::Mapped));
    assert_eq!(
        orders.iter().filter(|o| o.effect == PositionEffect::Open).count(),
        1
    );
    assert_eq!(
        orders.iter().filter(|o| o.effect == PositionEffect::Close).count(),
        1
    );
    assert_eq!(close_order_pnl(&orders), dec!(200));

    let kinds: Vec<&str> = store
        .all_outbox()
        .await
        .iter()
        .map(|e| e.event.kind())
        .collect();
    assert_eq!(kinds, vec!["PositionOpened", "PositionClosed"]);
}

#[tokio::test]
async fn test_opened_event_carries_fill_leverage() {
    let store = Arc::new(MemoryLedgerStore::new());
    let reconciler = Reconciler::new(store.clone(), chrono::Duration::seconds(30));
    let user = Uuid::new_v4();

    let mut open = open_long("1", dec!(0.1), dec!(40000), 0);
    open.leverage = Some(dec!(10));
    reconciler.apply_fill(user, &open).await.unwrap();

    let position = &store.all_positions().await[0];
    assert_eq!(position.leverage, Some(dec!(10)));
    let outbox = store.all_outbox().await;
    match &outbox[0].event {
        DomainEvent::PositionOpened { leverage, .. } => assert_eq!(*leverage, Some(dec!(10))),
        other => panic!("진입 이벤트 아님: {:?}", other),
    }
}

#[tokio::test]
async fn test_replayed_fills_are_idempotent() {
    let store = Arc::new(MemoryLedgerStore::new());
    let reconciler = Reconciler::new(store.clone(), chrono::Duration::seconds(30));
    let user = Uuid::new_v4();
    let open = open_long("1", dec!(0.1), dec!(40000), 0);
    let close = close_long("2", dec!(0.1), dec!(42000), 60);

    for _ in 0..3 {
        reconciler.apply_fill(user, &open).await.unwrap();
        reconciler.apply_fill(user, &close).await.unwrap();
    }

    assert_eq!(
        reconciler.apply_fill(user, &open).await.unwrap(),
        FillOutcome::Duplicate
    );
    assert_eq!(store.all_orders().await.len(), 2);
    let positions = store.all_positions().await;
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].realized_pnl, Some(dec!(200)));
    assert_eq!(store.all_outbox().await.len(), 2);
}

#[tokio::test]
async fn test_partial_closes_conserve_quantity() {
    let store = Arc::new(MemoryLedgerStore::new());
    let reconciler = Reconciler::new(store.clone(), chrono::Duration::seconds(30));
    let user = Uuid::new_v4();

    reconciler
        .apply_fill(user, &open_long("o1", dec!(0.6), dec!(40000), 0))
        .await
        .unwrap();
    // 평가손 상태 추가 진입 → 물타기
    reconciler
        .apply_fill(user, &open_long("o2", dec!(0.4), dec!(39000), 10))
        .await
        .unwrap();

    let first = reconciler
        .apply_fill(user, &close_long("c1", dec!(0.3), dec!(41000), 20))
        .await
        .unwrap();
    assert!(matches!(first, FillOutcome::Reduced { .. }));
    reconciler
        .apply_fill(user, &close_long("c2", dec!(0.3), dec!(41000), 30))
        .await
        .unwrap();
    let last = reconciler
        .apply_fill(user, &close_long("c3", dec!(0.4), dec!(41000), 40))
        .await
        .unwrap();
    assert!(matches!(last, FillOutcome::Closed { .. }));

    let position = &store.all_positions().await[0];
    assert_eq!(position.quantity, dec!(1.0));
    assert_eq!(position.closed_quantity, position.quantity);
    assert_eq!(position.entry_price, dec!(39600));
    assert_eq!(position.entry_count, 2);
    assert_eq!(position.averaging_down_entries, 1);
    assert_eq!(position.realized_pnl, Some(dec!(1400)));

    let closed_sum: Decimal = store
        .orders_for_position(position.id)
        .await
        .unwrap()
        .iter()
        .filter(|o| o.effect == PositionEffect::Close)
        .map(|o| o.filled_quantity)
        .sum();
    assert_eq!(closed_sum, position.quantity);
}

#[tokio::test]
async fn test_exchange_reported_pnl_is_summed_from_close_orders() {
    let store = Arc::new(MemoryLedgerStore::new());
    let reconciler = Reconciler::new(store.clone(), chrono::Duration::seconds(30));
    let user = Uuid::new_v4();

    reconciler
        .apply_fill(user, &open_long("o1", dec!(0.5), dec!(40000), 0))
        .await
        .unwrap();
    for (i, (qty, pnl)) in [(dec!(0.15), dec!(60)), (dec!(0.15), dec!(60)), (dec!(0.2), dec!(80))]
        .into_iter()
        .enumerate()
    {
        let mut close = close_long(["c1", "c2", "c3"][i], qty, dec!(40400), 10 * (i as i64 + 1));
        close.realized_pnl = pnl;
        reconciler.apply_fill(user, &close).await.unwrap();
    }

    let position = &store.all_positions().await[0];
    assert_eq!(position.status, PositionStatus::ClosedMapped);
    let reported: Decimal = store
        .orders_for_position(position.id)
        .await
        .unwrap()
        .iter()
        .filter(|o| o.effect == PositionEffect::Close)
        .map(|o| o.realized_pnl)
        .sum();
    assert_eq!(reported, dec!(200));
    assert_eq!(position.realized_pnl, Some(reported));
}

#[tokio::test]
async fn test_computed_close_pnl_is_recorded_on_order() {
    let store = Arc::new(MemoryLedgerStore::new());
    let reconciler = Reconciler::new(store.clone(), chrono::Duration::seconds(30));
    let user = Uuid::new_v4();

    reconciler
        .apply_fill(user, &open_long("1", dec!(0.1), dec!(40000), 0))
        .await
        .unwrap();
    // 거래소가 실현손익을 보내지 않은 청산
    reconciler
        .apply_fill(user, &close_long("2", dec!(0.1), dec!(42000), 60))
        .await
        .unwrap();

    let position = &store.all_positions().await[0];
    let orders = store.orders_for_position(position.id).await.unwrap();
    assert_eq!(position.realized_pnl, Some(dec!(200)));
    assert_eq!(close_order_pnl(&orders), dec!(200));
}

#[tokio::test]
async fn test_oversized_close_records_prorated_pnl_on_order() {
    let store = Arc::new(MemoryLedgerStore::new());
    let reconciler = Reconciler::new(store.clone(), chrono::Duration::seconds(30));
    let user = Uuid::new_v4();

    reconciler
        .apply_fill(user, &open_long("1", dec!(0.1), dec!(40000), 0))
        .await
        .unwrap();
    let mut close = close_long("2", dec!(0.2), dec!(42000), 60);
    close.realized_pnl = dec!(400);
    reconciler.apply_fill(user, &close).await.unwrap();

    let position = &store.all_positions().await[0];
    assert_eq!(position.status, PositionStatus::ClosedMapped);
    assert_eq!(position.closed_quantity, dec!(0.1));
    let orders = store.orders_for_position(position.id).await.unwrap();
    assert_eq!(position.realized_pnl, Some(dec!(200)));
    assert_eq!(close_order_pnl(&orders), dec!(200));
}

#[tokio::test]
async fn test_unfilled_and_partial_events_are_not_persisted() {
    let store = Arc::new(MemoryLedgerStore::new());
    let reconciler = Reconciler::new(store.clone(), chrono::Duration::seconds(30));
    let user = Uuid::new_v4();

    let mut partial = open_long("1", dec!(0.05), dec!(40000), 0);
    partial.status = FillStatus::PartiallyFilled;
    let mut canceled = open_long("2", Decimal::ZERO, dec!(40000), 0);
    canceled.status = FillStatus::Canceled;
    let mut canceled_with_fill = open_long("3", dec!(0.02), dec!(40000), 0);
    canceled_with_fill.status = FillStatus::Canceled;

    assert_eq!(
        reconciler.apply_fill(user, &partial).await.unwrap(),
        FillOutcome::Discarded
    );
    assert_eq!(
        reconciler.apply_fill(user, &canceled).await.unwrap(),
        FillOutcome::Discarded
    );
    assert!(matches!(
        reconciler.apply_fill(user, &canceled_with_fill).await.unwrap(),
        FillOutcome::Opened { .. }
    ));
    assert_eq!(store.all_orders().await.len(), 1);
}

// ==================== 키 워커 순서 보장 ====================

#[tokio::test]
async fn test_reorder_window_applies_by_exchange_timestamp() {
    let store = Arc::new(MemoryLedgerStore::new());
    let engine = engine(store.clone(), Duration::from_secs(5));
    let user = Uuid::new_v4();

    // 청산이 진입보다 먼저 도착
    engine
        .submit_fill(user, close_long("2", dec!(0.1), dec!(42000), 60))
        .await
        .unwrap();
    engine
        .submit_fill(user, open_long("1", dec!(0.1), dec!(40000), 0))
        .await
        .unwrap();
    engine.flush().await;

    let positions = store.all_positions().await;
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].status, PositionStatus::ClosedMapped);
    assert!(store.orphan_orders(u32::MAX).await.unwrap().is_empty());
    assert_eq!(engine.worker_count().await, 1);
}

#[tokio::test]
async fn test_backfill_batch_sorted_by_sequence() {
    let store = Arc::new(MemoryLedgerStore::new());
    let engine = engine(store.clone(), Duration::ZERO);
    let user = Uuid::new_v4();

    let mut close = close_long("2", dec!(0.1), dec!(42000), 0);
    close.sequence = Some(6);
    let mut open = open_long("1", dec!(0.1), dec!(40000), 0);
    open.sequence = Some(5);

    engine.submit_backfill(user, vec![close, open]).await.unwrap();
    engine.flush().await;

    let positions = store.all_positions().await;
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].status, PositionStatus::ClosedMapped);
    assert_eq!(positions[0].realized_pnl, Some(dec!(200)));
}

#[tokio::test]
async fn test_shutdown_rejects_new_submissions() {
    let store = Arc::new(MemoryLedgerStore::new());
    let engine = engine(store.clone(), Duration::from_secs(5));
    let user = Uuid::new_v4();

    engine
        .submit_fill(user, open_long("1", dec!(0.1), dec!(40000), 0))
        .await
        .unwrap();
    // 재정렬 창에 남은 체결도 종료 시 반영
    engine.shutdown(Duration::from_secs(2)).await;
    assert_eq!(store.all_positions().await.len(), 1);

    let result = engine
        .submit_fill(user, close_long("2", dec!(0.1), dec!(42000), 60))
        .await;
    assert!(matches!(result, Err(ReconcileError::ShutDown)));
}

#[tokio::test]
async fn test_failed_commit_is_retried_in_order() {
    let store = Arc::new(FlakyStore::failing(1));
    let engine = flaky_engine(store.clone());
    let user = Uuid::new_v4();

    // 진입 커밋이 실패해도 뒤따르는 청산이 고아가 되지 않아야 함
    engine
        .submit_backfill(
            user,
            vec![
                close_long("2", dec!(0.1), dec!(42000), 60),
                open_long("1", dec!(0.1), dec!(40000), 0),
            ],
        )
        .await
        .unwrap();
    assert!(store.inner.all_positions().await.is_empty());

    engine.flush().await;

    let positions = store.inner.all_positions().await;
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].status, PositionStatus::ClosedMapped);
    assert_eq!(positions[0].realized_pnl, Some(dec!(200)));
    assert!(store.inner.orphan_orders(5).await.unwrap().is_empty());
    assert_eq!(store.commits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_fill_dropped_after_max_attempts() {
    let store = Arc::new(FlakyStore::failing(10));
    let engine = flaky_engine(store.clone());
    let user = Uuid::new_v4();

    engine
        .submit_fill(user, open_long("1", dec!(0.1), dec!(40000), 0))
        .await
        .unwrap();
    for _ in 0..5 {
        engine.flush().await;
    }

    assert_eq!(store.commits.load(Ordering::SeqCst), 3);
    assert!(store.inner.all_orders().await.is_empty());
}

// ==================== CLOSING / CLOSED_UNMAPPED ====================

#[tokio::test]
async fn test_flat_snapshot_expires_then_late_close_promotes() {
    let store = Arc::new(MemoryLedgerStore::new());
    let engine = engine(store.clone(), Duration::ZERO);
    let backfill = Arc::new(RecordingBackfill::default());
    let worker = MappingRetryWorker::new(engine.clone(), MappingRetryConfig::default())
        .with_backfill(backfill.clone());
    let user = Uuid::new_v4();

    engine
        .submit_fill(user, open_long("1", dec!(0.1), dec!(40000), 0))
        .await
        .unwrap();
    engine.submit_snapshot(user, flat_snapshot()).await.unwrap();
    engine.flush().await;

    let position = store.all_positions().await.remove(0);
    assert_eq!(position.status, PositionStatus::Closing);
    assert_eq!(position.leverage, Some(dec!(5)));

    // 기한 전에는 변화 없음
    let report = worker.run_once(Utc::now()).await.unwrap();
    assert_eq!(report.expired, 0);

    let report = worker
        .run_once(Utc::now() + chrono::Duration::seconds(31))
        .await
        .unwrap();
    assert_eq!(report.expired, 1);
    assert_eq!(report.retried, 1);
    assert_eq!(report.backfill_requests, 1);
    let requests = backfill.requests.lock().await.clone();
    assert_eq!(requests, vec![(user, ExchangeKind::Binance, vec!["BTCUSDT".to_string()])]);

    let unmapped = store.get_position(position.id).await.unwrap().unwrap();
    assert_eq!(unmapped.status, PositionStatus::ClosedUnmapped);
    assert_eq!(store.count_unmapped_positions().await.unwrap(), 1);

    // 백필로 늦게 도착한 청산 체결
    engine
        .submit_backfill(user, vec![close_long("2", dec!(0.1), dec!(42000), 600)])
        .await
        .unwrap();
    engine.flush().await;

    let promoted = store.get_position(position.id).await.unwrap().unwrap();
    assert_eq!(promoted.status, PositionStatus::ClosedMapped);
    assert_eq!(promoted.realized_pnl, Some(dec!(200)));
    assert_eq!(promoted.exit_price, Some(dec!(42000)));
    assert_eq!(store.count_unmapped_positions().await.unwrap(), 0);

    let kinds: Vec<&str> = store
        .all_outbox()
        .await
        .iter()
        .map(|e| e.event.kind())
        .collect();
    assert_eq!(kinds, vec!["PositionOpened", "PositionClosed", "PositionClosed"]);
}

#[tokio::test]
async fn test_unmapped_retry_is_bounded() {
    let store = Arc::new(MemoryLedgerStore::new());
    let engine = engine(store.clone(), Duration::ZERO);
    let worker = MappingRetryWorker::new(
        engine.clone(),
        MappingRetryConfig {
            max_retries: 2,
            ..MappingRetryConfig::default()
        },
    );
    let user = Uuid::new_v4();

    engine
        .submit_fill(user, open_long("1", dec!(0.1), dec!(40000), 0))
        .await
        .unwrap();
    engine.submit_snapshot(user, flat_snapshot()).await.unwrap();
    engine.flush().await;

    let later = Utc::now() + chrono::Duration::seconds(31);
    let first = worker.run_once(later).await.unwrap();
    assert_eq!((first.expired, first.retried, first.failed), (1, 1, 0));
    let second = worker.run_once(later).await.unwrap();
    assert_eq!((second.expired, second.retried, second.failed), (0, 1, 0));
    let third = worker.run_once(later).await.unwrap();
    assert_eq!((third.expired, third.retried, third.failed), (0, 0, 1));

    let position = store.all_positions().await.remove(0);
    assert_eq!(position.status, PositionStatus::Failed);
    assert_eq!(position.mapping_retries, 2);
    assert_eq!(store.count_unmapped_positions().await.unwrap(), 0);
}

// ==================== 고아 주문 ====================

#[tokio::test]
async fn test_orphan_close_is_remapped_after_open_arrives() {
    let store = Arc::new(MemoryLedgerStore::new());
    let engine = engine(store.clone(), Duration::ZERO);
    let worker = MappingRetryWorker::new(engine.clone(), MappingRetryConfig::default());
    let user = Uuid::new_v4();

    engine
        .submit_fill(user, close_long("2", dec!(0.1), dec!(42000), 600))
        .await
        .unwrap();
    engine.flush().await;

    let orphans = store.orphan_orders(5).await.unwrap();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].mapping_status, MappingStatus::Failed);

    // 매핑 대상이 없으면 시도 횟수만 증가
    let report = worker.run_once(Utc::now()).await.unwrap();
    assert_eq!(report.orphans_remapped, 0);
    assert_eq!(store.orphan_orders(5).await.unwrap()[0].mapping_attempts, 1);

    engine
        .submit_fill(user, open_long("1", dec!(0.1), dec!(40000), 0))
        .await
        .unwrap();
    engine.flush().await;

    let report = worker.run_once(Utc::now()).await.unwrap();
    assert_eq!(report.orphans_remapped, 1);
    assert!(store.orphan_orders(5).await.unwrap().is_empty());

    let position = store.all_positions().await.remove(0);
    assert_eq!(position.status, PositionStatus::ClosedMapped);
    assert_eq!(position.realized_pnl, Some(dec!(200)));
    let order = store
        .find_order(user, ExchangeKind::Binance, "2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.position_id, Some(position.id));
    assert_eq!(order.mapping_status, MappingStatus::Mapped);
    assert_eq!(order.realized_pnl, dec!(200));
}

#[tokio::test]
async fn test_orphan_attempts_are_bounded() {
    let store = Arc::new(MemoryLedgerStore::new());
    let engine = engine(store.clone(), Duration::ZERO);
    let worker = MappingRetryWorker::new(
        engine.clone(),
        MappingRetryConfig {
            orphan_max_attempts: 2,
            ..MappingRetryConfig::default()
        },
    );
    let user = Uuid::new_v4();

    engine
        .submit_fill(user, close_long("2", dec!(0.1), dec!(42000), 600))
        .await
        .unwrap();
    engine.flush().await;

    for _ in 0..4 {
        worker.run_once(Utc::now()).await.unwrap();
    }
    let order = store
        .find_order(user, ExchangeKind::Binance, "2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.mapping_attempts, 2);
    assert!(store.orphan_orders(2).await.unwrap().is_empty());
}

// ==================== 아웃박스 ====================

#[tokio::test]
async fn test_dispatcher_delivers_in_order_and_acks() {
    let store = Arc::new(MemoryLedgerStore::new());
    let reconciler = Reconciler::new(store.clone(), chrono::Duration::seconds(30));
    let user = Uuid::new_v4();
    reconciler
        .apply_fill(user, &open_long("1", dec!(0.1), dec!(40000), 0))
        .await
        .unwrap();
    reconciler
        .apply_fill(user, &close_long("2", dec!(0.1), dec!(42000), 60))
        .await
        .unwrap();

    let (notifier, mut rx) = ChannelNotifier::channel(8);
    let dispatcher = OutboxDispatcher::new(store.clone(), DispatcherConfig::default())
        .with_notifier(Arc::new(notifier));

    let report = dispatcher.dispatch_once().await.unwrap();
    assert_eq!(report.delivered, 2);
    assert_eq!(report.failed, 0);

    assert!(matches!(rx.recv().await, Some(DomainEvent::PositionOpened { .. })));
    match rx.recv().await {
        Some(DomainEvent::PositionClosed { realized_pnl, user_id, .. }) => {
            assert_eq!(realized_pnl, dec!(200));
            assert_eq!(user_id, user);
        }
        other => panic!("청산 이벤트 아님: {:?}", other),
    }

    assert!(store.pending_outbox(10).await.unwrap().is_empty());
    assert_eq!(dispatcher.dispatch_once().await.unwrap().delivered, 0);
}

#[tokio::test]
async fn test_dispatcher_failure_keeps_entry_pending() {
    let store = Arc::new(MemoryLedgerStore::new());
    let reconciler = Reconciler::new(store.clone(), chrono::Duration::seconds(30));
    let user = Uuid::new_v4();
    reconciler
        .apply_fill(user, &open_long("1", dec!(0.1), dec!(40000), 0))
        .await
        .unwrap();
    reconciler
        .apply_fill(user, &close_long("2", dec!(0.1), dec!(42000), 60))
        .await
        .unwrap();

    let dispatcher = OutboxDispatcher::new(store.clone(), DispatcherConfig::default())
        .with_notifier(Arc::new(FailingNotifier));

    for _ in 0..2 {
        let report = dispatcher.dispatch_once().await.unwrap();
        assert_eq!(report.delivered, 0);
        assert_eq!(report.failed, 1);
    }

    let outbox = store.all_outbox().await;
    assert_eq!(outbox.len(), 2);
    assert_eq!(outbox[0].attempts, 2);
    // 첫 항목에서 멈추므로 뒤 항목은 시도되지 않음
    assert_eq!(outbox[1].attempts, 0);
    assert!(outbox.iter().all(|e| !e.delivered));
}
