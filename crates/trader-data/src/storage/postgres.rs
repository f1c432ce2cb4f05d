//! PostgreSQL 원장 저장소.
//!
//! 포지션/주문/아웃박스 변경은 [`LedgerStore::commit`] 한 번에 하나의
//! 트랜잭션으로 반영됩니다. 열거형은 TEXT, 금액은 NUMERIC으로 저장합니다.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{postgres::PgPool, FromRow};
use tracing::{debug, instrument};
use trader_core::{
    Credential, DomainEvent, ExchangeKind, LedgerStore, LedgerUnit, MappingStatus, Order,
    OrderStatus, OrderType, OutboxEntry, Position, PositionSide, PositionStatus, RiskPattern,
    StoreError, TradingJournal,
};
use uuid::Uuid;

fn db_err(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::RowNotFound => StoreError::NotFound(err.to_string()),
        sqlx::Error::Database(ref db) if db.is_unique_violation() => {
            StoreError::Conflict(db.message().to_string())
        }
        other => StoreError::Database(other.to_string()),
    }
}

fn parse_column<T: FromStr<Err = String>>(column: &str, value: &str) -> Result<T, StoreError> {
    value
        .parse()
        .map_err(|e| StoreError::Serialization(format!("{}: {}", column, e)))
}

fn to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or_default()
}

// ==================== 레코드 ====================

#[derive(Debug, FromRow)]
struct PositionRecord {
    id: Uuid,
    user_id: Uuid,
    exchange: String,
    symbol: String,
    side: String,
    entry_time: DateTime<Utc>,
    entry_price: Decimal,
    quantity: Decimal,
    closed_quantity: Decimal,
    leverage: Option<Decimal>,
    exit_time: Option<DateTime<Utc>>,
    exit_price: Option<Decimal>,
    realized_pnl: Option<Decimal>,
    total_fee: Decimal,
    target_price: Option<Decimal>,
    stop_price: Option<Decimal>,
    market_condition: Option<String>,
    status: String,
    closing_deadline: Option<DateTime<Utc>>,
    mapping_retries: i32,
    entry_count: i32,
    averaging_down_entries: i32,
    last_snapshot_size: Option<Decimal>,
    close_notional: Decimal,
    accumulated_pnl: Decimal,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PositionRecord> for Position {
    type Error = StoreError;

    fn try_from(r: PositionRecord) -> Result<Self, Self::Error> {
        let status = PositionStatus::parse(&r.status)
            .ok_or_else(|| StoreError::Serialization(format!("position status: {}", r.status)))?;
        Ok(Position {
            id: r.id,
            user_id: r.user_id,
            exchange: parse_column("exchange", &r.exchange)?,
            symbol: r.symbol,
            side: parse_column("side", &r.side)?,
            entry_time: r.entry_time,
            entry_price: r.entry_price,
            quantity: r.quantity,
            closed_quantity: r.closed_quantity,
            leverage: r.leverage,
            exit_time: r.exit_time,
            exit_price: r.exit_price,
            realized_pnl: r.realized_pnl,
            total_fee: r.total_fee,
            target_price: r.target_price,
            stop_price: r.stop_price,
            market_condition: r.market_condition,
            status,
            closing_deadline: r.closing_deadline,
            mapping_retries: to_u32(r.mapping_retries),
            entry_count: to_u32(r.entry_count),
            averaging_down_entries: to_u32(r.averaging_down_entries),
            last_snapshot_size: r.last_snapshot_size,
            close_notional: r.close_notional,
            accumulated_pnl: r.accumulated_pnl,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct OrderRecord {
    id: Uuid,
    user_id: Uuid,
    exchange: String,
    exchange_order_id: String,
    symbol: String,
    side: String,
    order_type: String,
    effect: String,
    status: String,
    filled_quantity: Decimal,
    filled_price: Decimal,
    fee: Decimal,
    realized_pnl: Decimal,
    reduce_only: bool,
    position_index: i16,
    ordered_at: DateTime<Utc>,
    filled_at: Option<DateTime<Utc>>,
    position_id: Option<Uuid>,
    mapping_status: String,
    mapping_attempts: i32,
    sequence: Option<i64>,
    created_at: DateTime<Utc>,
}

impl TryFrom<OrderRecord> for Order {
    type Error = StoreError;

    fn try_from(r: OrderRecord) -> Result<Self, Self::Error> {
        Ok(Order {
            id: r.id,
            user_id: r.user_id,
            exchange: parse_column("exchange", &r.exchange)?,
            exchange_order_id: r.exchange_order_id,
            symbol: r.symbol,
            side: parse_column("side", &r.side)?,
            order_type: OrderType::parse_loose(&r.order_type),
            effect: parse_column("effect", &r.effect)?,
            status: OrderStatus::parse(&r.status)
                .ok_or_else(|| StoreError::Serialization(format!("order status: {}", r.status)))?,
            filled_quantity: r.filled_quantity,
            filled_price: r.filled_price,
            fee: r.fee,
            realized_pnl: r.realized_pnl,
            reduce_only: r.reduce_only,
            position_index: u8::try_from(r.position_index).unwrap_or_default(),
            ordered_at: r.ordered_at,
            filled_at: r.filled_at,
            position_id: r.position_id,
            mapping_status: MappingStatus::parse(&r.mapping_status).ok_or_else(|| {
                StoreError::Serialization(format!("mapping status: {}", r.mapping_status))
            })?,
            mapping_attempts: to_u32(r.mapping_attempts),
            sequence: r.sequence.and_then(|s| u64::try_from(s).ok()),
            created_at: r.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct OutboxRecord {
    id: Uuid,
    payload: String,
    created_at: DateTime<Utc>,
    attempts: i32,
    delivered: bool,
}

#[derive(Debug, FromRow)]
struct JournalRecord {
    id: Uuid,
    user_id: Uuid,
    position_id: Uuid,
    planned_target_price: Option<Decimal>,
    planned_stop_price: Option<Decimal>,
    entry_scenario: Option<String>,
    entry_rationale: Option<String>,
    exit_review: Option<String>,
    indicator_tags: Vec<String>,
    timeframe_tags: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<JournalRecord> for TradingJournal {
    fn from(r: JournalRecord) -> Self {
        Self {
            id: r.id,
            user_id: r.user_id,
            position_id: r.position_id,
            planned_target_price: r.planned_target_price,
            planned_stop_price: r.planned_stop_price,
            entry_scenario: r.entry_scenario,
            entry_rationale: r.entry_rationale,
            exit_review: r.exit_review,
            indicator_tags: r.indicator_tags,
            timeframe_tags: r.timeframe_tags,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct CredentialRecord {
    id: Uuid,
    user_id: Uuid,
    exchange: String,
    label: String,
    encrypted_credentials: Vec<u8>,
    encryption_nonce: Vec<u8>,
    is_testnet: bool,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CredentialRecord> for Credential {
    type Error = StoreError;

    fn try_from(r: CredentialRecord) -> Result<Self, Self::Error> {
        Ok(Credential {
            id: r.id,
            user_id: r.user_id,
            exchange: parse_column("exchange", &r.exchange)?,
            label: r.label,
            encrypted_credentials: r.encrypted_credentials,
            encryption_nonce: r.encryption_nonce,
            is_testnet: r.is_testnet,
            is_active: r.is_active,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

fn positions_from(records: Vec<PositionRecord>) -> Result<Vec<Position>, StoreError> {
    records.into_iter().map(Position::try_from).collect()
}

fn orders_from(records: Vec<OrderRecord>) -> Result<Vec<Order>, StoreError> {
    records.into_iter().map(Order::try_from).collect()
}

const POSITION_COLUMNS: &str = "id, user_id, exchange, symbol, side, entry_time, entry_price, \
    quantity, closed_quantity, leverage, exit_time, exit_price, realized_pnl, total_fee, \
    target_price, stop_price, market_condition, status, closing_deadline, mapping_retries, \
    entry_count, averaging_down_entries, last_snapshot_size, close_notional, accumulated_pnl, \
    created_at, updated_at";

const ORDER_COLUMNS: &str = "id, user_id, exchange, exchange_order_id, symbol, side, order_type, \
    effect, status, filled_quantity, filled_price, fee, realized_pnl, reduce_only, position_index, \
    ordered_at, filled_at, position_id, mapping_status, mapping_attempts, sequence, created_at";

const CREDENTIAL_COLUMNS: &str = "id, user_id, exchange, label, encrypted_credentials, \
    encryption_nonce, is_testnet, is_active, created_at, updated_at";

// ==================== 저장소 ====================

/// PostgreSQL 원장 저장소.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 연결 풀 생성 후 저장소 반환.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await.map_err(db_err)?;
        Ok(Self::new(pool))
    }

    /// 내장 마이그레이션 실행.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_positions(
        &self,
        filter: &str,
        user_id: Uuid,
        exchange: ExchangeKind,
        symbol: &str,
        side: PositionSide,
    ) -> Result<Option<Position>, StoreError> {
        let sql = format!(
            "SELECT {POSITION_COLUMNS} FROM ledger_positions \
             WHERE user_id = $1 AND exchange = $2 AND symbol = $3 AND side = $4 AND {filter} LIMIT 1"
        );
        let record: Option<PositionRecord> = sqlx::query_as(&sql)
            .bind(user_id)
            .bind(exchange.as_str())
            .bind(symbol)
            .bind(side.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        record.map(Position::try_from).transpose()
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn find_order(
        &self,
        user_id: Uuid,
        exchange: ExchangeKind,
        exchange_order_id: &str,
    ) -> Result<Option<Order>, StoreError> {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM ledger_orders \
             WHERE user_id = $1 AND exchange = $2 AND exchange_order_id = $3"
        );
        let record: Option<OrderRecord> = sqlx::query_as(&sql)
            .bind(user_id)
            .bind(exchange.as_str())
            .bind(exchange_order_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        record.map(Order::try_from).transpose()
    }

    async fn orders_for_position(&self, position_id: Uuid) -> Result<Vec<Order>, StoreError> {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM ledger_orders WHERE position_id = $1 \
             ORDER BY ordered_at, sequence NULLS LAST"
        );
        let records: Vec<OrderRecord> = sqlx::query_as(&sql)
            .bind(position_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        orders_from(records)
    }

    async fn orphan_orders(&self, max_attempts: u32) -> Result<Vec<Order>, StoreError> {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM ledger_orders \
             WHERE position_id IS NULL AND mapping_attempts < $1 \
             ORDER BY ordered_at, sequence NULLS LAST"
        );
        let records: Vec<OrderRecord> = sqlx::query_as(&sql)
            .bind(max_attempts as i32)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        orders_from(records)
    }

    async fn find_active_position(
        &self,
        user_id: Uuid,
        exchange: ExchangeKind,
        symbol: &str,
        side: PositionSide,
    ) -> Result<Option<Position>, StoreError> {
        self.fetch_positions(
            "status IN ('OPEN', 'CLOSING') ORDER BY entry_time DESC",
            user_id,
            exchange,
            symbol,
            side,
        )
        .await
    }

    async fn find_unmapped_position(
        &self,
        user_id: Uuid,
        exchange: ExchangeKind,
        symbol: &str,
        side: PositionSide,
    ) -> Result<Option<Position>, StoreError> {
        self.fetch_positions(
            "status = 'CLOSED_UNMAPPED' ORDER BY exit_time DESC NULLS LAST, updated_at DESC",
            user_id,
            exchange,
            symbol,
            side,
        )
        .await
    }

    async fn get_position(&self, id: Uuid) -> Result<Option<Position>, StoreError> {
        let sql = format!("SELECT {POSITION_COLUMNS} FROM ledger_positions WHERE id = $1");
        let record: Option<PositionRecord> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        record.map(Position::try_from).transpose()
    }

    async fn positions_by_status(
        &self,
        status: PositionStatus,
    ) -> Result<Vec<Position>, StoreError> {
        // 구버전 CLOSED 행도 CLOSED_MAPPED로 조회
        let statuses: Vec<&str> = match status {
            PositionStatus::ClosedMapped => vec!["CLOSED_MAPPED", "CLOSED"],
            other => vec![other.as_str()],
        };
        let sql = format!(
            "SELECT {POSITION_COLUMNS} FROM ledger_positions WHERE status = ANY($1) ORDER BY updated_at"
        );
        let records: Vec<PositionRecord> = sqlx::query_as(&sql)
            .bind(statuses)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        positions_from(records)
    }

    async fn closed_positions(
        &self,
        user_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Position>, StoreError> {
        let sql = format!(
            "SELECT {POSITION_COLUMNS} FROM ledger_positions \
             WHERE user_id = $1 \
               AND status IN ('CLOSED_MAPPED', 'CLOSED', 'CLOSED_UNMAPPED', 'FAILED') \
               AND exit_time >= $2 AND exit_time < $3 \
             ORDER BY exit_time"
        );
        let records: Vec<PositionRecord> = sqlx::query_as(&sql)
            .bind(user_id)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        positions_from(records)
    }

    async fn count_unmapped_positions(&self) -> Result<u64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM ledger_positions WHERE status = 'CLOSED_UNMAPPED'")
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    #[instrument(skip(self, unit), fields(
        positions = unit.positions.len(),
        orders = unit.orders.len(),
        events = unit.events.len()
    ))]
    async fn commit(&self, unit: LedgerUnit) -> Result<(), StoreError> {
        if unit.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        for p in &unit.positions {
            sqlx::query(
                r#"
                INSERT INTO ledger_positions (
                    id, user_id, exchange, symbol, side, entry_time, entry_price, quantity,
                    closed_quantity, leverage, exit_time, exit_price, realized_pnl, total_fee,
                    target_price, stop_price, market_condition, status, closing_deadline,
                    mapping_retries, entry_count, averaging_down_entries, last_snapshot_size,
                    close_notional, accumulated_pnl, created_at, updated_at
                ) VALUES (
                    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19, $20, $21, $22, $23, $24, $25, $26, $27
                )
                ON CONFLICT (id) DO UPDATE SET
                    entry_price = EXCLUDED.entry_price,
                    quantity = EXCLUDED.quantity,
                    closed_quantity = EXCLUDED.closed_quantity,
                    leverage = EXCLUDED.leverage,
                    exit_time = EXCLUDED.exit_time,
                    exit_price = EXCLUDED.exit_price,
                    realized_pnl = EXCLUDED.realized_pnl,
                    total_fee = EXCLUDED.total_fee,
                    target_price = EXCLUDED.target_price,
                    stop_price = EXCLUDED.stop_price,
                    market_condition = EXCLUDED.market_condition,
                    status = EXCLUDED.status,
                    closing_deadline = EXCLUDED.closing_deadline,
                    mapping_retries = EXCLUDED.mapping_retries,
                    entry_count = EXCLUDED.entry_count,
                    averaging_down_entries = EXCLUDED.averaging_down_entries,
                    last_snapshot_size = EXCLUDED.last_snapshot_size,
                    close_notional = EXCLUDED.close_notional,
                    accumulated_pnl = EXCLUDED.accumulated_pnl,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(p.id)
            .bind(p.user_id)
            .bind(p.exchange.as_str())
            .bind(&p.symbol)
            .bind(p.side.as_str())
            .bind(p.entry_time)
            .bind(p.entry_price)
            .bind(p.quantity)
            .bind(p.closed_quantity)
            .bind(p.leverage)
            .bind(p.exit_time)
            .bind(p.exit_price)
            .bind(p.realized_pnl)
            .bind(p.total_fee)
            .bind(p.target_price)
            .bind(p.stop_price)
            .bind(&p.market_condition)
            .bind(p.status.as_str())
            .bind(p.closing_deadline)
            .bind(p.mapping_retries as i32)
            .bind(p.entry_count as i32)
            .bind(p.averaging_down_entries as i32)
            .bind(p.last_snapshot_size)
            .bind(p.close_notional)
            .bind(p.accumulated_pnl)
            .bind(p.created_at)
            .bind(p.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        for o in &unit.orders {
            sqlx::query(
                r#"
                INSERT INTO ledger_orders (
                    id, user_id, exchange, exchange_order_id, symbol, side, order_type, effect,
                    status, filled_quantity, filled_price, fee, realized_pnl, reduce_only,
                    position_index, ordered_at, filled_at, position_id, mapping_status,
                    mapping_attempts, sequence, created_at
                ) VALUES (
                    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19, $20, $21, $22
                )
                ON CONFLICT (user_id, exchange, exchange_order_id) DO UPDATE SET
                    status = EXCLUDED.status,
                    filled_quantity = EXCLUDED.filled_quantity,
                    filled_price = EXCLUDED.filled_price,
                    fee = EXCLUDED.fee,
                    realized_pnl = EXCLUDED.realized_pnl,
                    filled_at = EXCLUDED.filled_at,
                    position_id = EXCLUDED.position_id,
                    mapping_status = EXCLUDED.mapping_status,
                    mapping_attempts = EXCLUDED.mapping_attempts,
                    sequence = EXCLUDED.sequence
                "#,
            )
            .bind(o.id)
            .bind(o.user_id)
            .bind(o.exchange.as_str())
            .bind(&o.exchange_order_id)
            .bind(&o.symbol)
            .bind(o.side.as_str())
            .bind(o.order_type.as_str())
            .bind(o.effect.as_str())
            .bind(o.status.as_str())
            .bind(o.filled_quantity)
            .bind(o.filled_price)
            .bind(o.fee)
            .bind(o.realized_pnl)
            .bind(o.reduce_only)
            .bind(i16::from(o.position_index))
            .bind(o.ordered_at)
            .bind(o.filled_at)
            .bind(o.position_id)
            .bind(o.mapping_status.as_str())
            .bind(o.mapping_attempts as i32)
            .bind(o.sequence.and_then(|s| i64::try_from(s).ok()))
            .bind(o.created_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        for event in unit.events {
            let entry = OutboxEntry::new(event);
            let payload = serde_json::to_string(&entry.event)?;
            sqlx::query(
                r#"
                INSERT INTO ledger_outbox (id, event_type, position_id, payload, created_at, attempts, delivered)
                VALUES ($1, $2, $3, $4::jsonb, $5, 0, FALSE)
                "#,
            )
            .bind(entry.id)
            .bind(entry.event.kind())
            .bind(entry.event.position_id())
            .bind(payload)
            .bind(entry.created_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        debug!("원장 트랜잭션 커밋");
        Ok(())
    }

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        let records: Vec<OutboxRecord> = sqlx::query_as(
            r#"
            SELECT id, payload::text AS payload, created_at, attempts, delivered
            FROM ledger_outbox
            WHERE NOT delivered
            ORDER BY created_at
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        records
            .into_iter()
            .map(|r| -> Result<OutboxEntry, StoreError> {
                let event: DomainEvent = serde_json::from_str(&r.payload)?;
                Ok(OutboxEntry {
                    id: r.id,
                    event,
                    created_at: r.created_at,
                    attempts: to_u32(r.attempts),
                    delivered: r.delivered,
                })
            })
            .collect()
    }

    async fn ack_outbox(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE ledger_outbox SET delivered = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("outbox {}", id)));
        }
        Ok(())
    }

    async fn record_outbox_attempt(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE ledger_outbox SET attempts = attempts + 1 WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn journals_for_user(&self, user_id: Uuid) -> Result<Vec<TradingJournal>, StoreError> {
        let records: Vec<JournalRecord> = sqlx::query_as(
            r#"
            SELECT id, user_id, position_id, planned_target_price, planned_stop_price,
                   entry_scenario, entry_rationale, exit_review, indicator_tags, timeframe_tags,
                   created_at, updated_at
            FROM trading_journals
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(records.into_iter().map(TradingJournal::from).collect())
    }

    async fn upsert_journal(&self, journal: TradingJournal) -> Result<(), StoreError> {
        let position = self
            .get_position(journal.position_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("position {}", journal.position_id)))?;
        if !position.status.is_closed() {
            return Err(StoreError::Conflict(format!(
                "청산되지 않은 포지션에 일지 작성 불가: {}",
                journal.position_id
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO trading_journals (
                id, user_id, position_id, planned_target_price, planned_stop_price,
                entry_scenario, entry_rationale, exit_review, indicator_tags, timeframe_tags,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (position_id) DO UPDATE SET
                planned_target_price = EXCLUDED.planned_target_price,
                planned_stop_price = EXCLUDED.planned_stop_price,
                entry_scenario = EXCLUDED.entry_scenario,
                entry_rationale = EXCLUDED.entry_rationale,
                exit_review = EXCLUDED.exit_review,
                indicator_tags = EXCLUDED.indicator_tags,
                timeframe_tags = EXCLUDED.timeframe_tags,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(journal.id)
        .bind(journal.user_id)
        .bind(journal.position_id)
        .bind(journal.planned_target_price)
        .bind(journal.planned_stop_price)
        .bind(&journal.entry_scenario)
        .bind(&journal.entry_rationale)
        .bind(&journal.exit_review)
        .bind(&journal.indicator_tags)
        .bind(&journal.timeframe_tags)
        .bind(journal.created_at)
        .bind(journal.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn load_risk_pattern(&self, user_id: Uuid) -> Result<Option<RiskPattern>, StoreError> {
        let payload: Option<String> =
            sqlx::query_scalar("SELECT payload::text FROM risk_patterns WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        payload
            .map(|p| serde_json::from_str(&p).map_err(StoreError::from))
            .transpose()
    }

    async fn save_risk_pattern(&self, pattern: RiskPattern) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&pattern)?;
        sqlx::query(
            r#"
            INSERT INTO risk_patterns (user_id, payload, computed_at)
            VALUES ($1, $2::jsonb, $3)
            ON CONFLICT (user_id) DO UPDATE SET
                payload = EXCLUDED.payload,
                computed_at = EXCLUDED.computed_at
            "#,
        )
        .bind(pattern.user_id)
        .bind(payload)
        .bind(pattern.computed_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_credentials(&self, active_only: bool) -> Result<Vec<Credential>, StoreError> {
        let sql = format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM exchange_credentials \
             WHERE ($1 = FALSE OR is_active) ORDER BY created_at"
        );
        let records: Vec<CredentialRecord> = sqlx::query_as(&sql)
            .bind(active_only)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        records.into_iter().map(Credential::try_from).collect()
    }

    async fn get_credential(&self, id: Uuid) -> Result<Option<Credential>, StoreError> {
        let sql = format!("SELECT {CREDENTIAL_COLUMNS} FROM exchange_credentials WHERE id = $1");
        let record: Option<CredentialRecord> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        record.map(Credential::try_from).transpose()
    }

    async fn save_credential(&self, credential: Credential) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO exchange_credentials (
                id, user_id, exchange, label, encrypted_credentials, encryption_nonce,
                is_testnet, is_active, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                label = EXCLUDED.label,
                encrypted_credentials = EXCLUDED.encrypted_credentials,
                encryption_nonce = EXCLUDED.encryption_nonce,
                is_testnet = EXCLUDED.is_testnet,
                is_active = EXCLUDED.is_active,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(credential.id)
        .bind(credential.user_id)
        .bind(credential.exchange.as_str())
        .bind(&credential.label)
        .bind(&credential.encrypted_credentials)
        .bind(&credential.encryption_nonce)
        .bind(credential.is_testnet)
        .bind(credential.is_active)
        .bind(credential.created_at)
        .bind(credential.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn set_credential_active(&self, id: Uuid, active: bool) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE exchange_credentials SET is_active = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(active)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("credential {}", id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn position_record(status: &str) -> PositionRecord {
        let now = Utc::now();
        PositionRecord {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            exchange: "bybit".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: "LONG".to_string(),
            entry_time: now,
            entry_price: dec!(40000),
            quantity: dec!(0.1),
            closed_quantity: dec!(0.1),
            leverage: Some(dec!(10)),
            exit_time: Some(now),
            exit_price: Some(dec!(42000)),
            realized_pnl: Some(dec!(200)),
            total_fee: dec!(4.4),
            target_price: None,
            stop_price: None,
            market_condition: None,
            status: status.to_string(),
            closing_deadline: None,
            mapping_retries: 0,
            entry_count: 1,
            averaging_down_entries: 0,
            last_snapshot_size: None,
            close_notional: dec!(4200),
            accumulated_pnl: dec!(200),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_legacy_closed_row_reads_as_mapped() {
        let position = Position::try_from(position_record("CLOSED")).unwrap();
        assert_eq!(position.status, PositionStatus::ClosedMapped);
        assert_eq!(position.side, PositionSide::Long);
        assert_eq!(position.exchange, ExchangeKind::Bybit);
    }

    #[test]
    fn test_unknown_status_is_serialization_error() {
        assert!(matches!(
            Position::try_from(position_record("HALF_OPEN")),
            Err(StoreError::Serialization(_))
        ));
    }
}
