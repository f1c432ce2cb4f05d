//! Binance USDⓈ-M 선물 어댑터.
//!
//! - 스트림: listen key 발급 후 `/ws/{listenKey}` 접속 (로그인 메시지 없음)
//! - 이벤트: `ORDER_TRADE_UPDATE`, `ACCOUNT_UPDATE`, `ACCOUNT_CONFIG_UPDATE`, `listenKeyExpired`
//! - 주문 이벤트에는 레버리지가 없어 `ACCOUNT_CONFIG_UPDATE`/positionRisk 값을 기억해 붙입니다.
//! - 부분 체결의 수수료(`n`)와 실현손익(`rp`)은 체결 건별 값이므로
//!   주문 ID별로 누적해서 최종 상태 이벤트에 합산합니다.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use reqwest::Method;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};
use trader_core::{
    ApiCredential, ExchangeKind, FillStatus, OrderType, PositionEffect, PositionSide, RawFill,
    RawPosition, Side,
};

use super::{
    millis_to_utc, parse_decimal, parse_optional_decimal,
    rest::{read_json, RestPool},
    AdapterSettings, ExchangeEndpoints, LeverageCache, StreamEvent, StreamTarget,
};
use crate::{signing, ExchangeError};

const LISTEN_KEY_PATH: &str = "/fapi/v1/listenKey";
const ALL_ORDERS_PATH: &str = "/fapi/v1/allOrders";
const USER_TRADES_PATH: &str = "/fapi/v1/userTrades";
const POSITION_RISK_PATH: &str = "/fapi/v2/positionRisk";

/// 주문별 누적 체결 값.
#[derive(Debug, Clone, Default)]
struct PartialFill {
    fee: Decimal,
    realized_pnl: Decimal,
}

/// Binance 어댑터.
#[derive(Debug, Clone)]
pub struct BinanceAdapter {
    endpoints: ExchangeEndpoints,
    settings: AdapterSettings,
    partials: Arc<Mutex<HashMap<u64, PartialFill>>>,
    leverage: LeverageCache,
}

// ==================== 푸시 메시지 ====================

#[derive(Debug, Deserialize)]
struct OrderTradeUpdate {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "o")]
    order: OrderPayload,
}

#[derive(Debug, Deserialize)]
struct OrderPayload {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "o")]
    order_type: String,
    #[serde(rename = "x")]
    execution_type: String,
    #[serde(rename = "X")]
    status: String,
    #[serde(rename = "i")]
    order_id: u64,
    #[serde(rename = "z")]
    cumulative_qty: String,
    #[serde(rename = "ap", default)]
    avg_price: String,
    #[serde(rename = "n", default)]
    commission: Option<String>,
    #[serde(rename = "rp", default)]
    realized_profit: Option<String>,
    #[serde(rename = "R", default)]
    reduce_only: bool,
    #[serde(rename = "ps", default)]
    position_side: String,
    #[serde(rename = "T", default)]
    trade_time: i64,
    #[serde(rename = "t", default)]
    trade_id: u64,
}

#[derive(Debug, Deserialize)]
struct AccountUpdate {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "a")]
    account: AccountPayload,
}

#[derive(Debug, Deserialize)]
struct AccountPayload {
    #[serde(rename = "P", default)]
    positions: Vec<AccountPosition>,
}

#[derive(Debug, Deserialize)]
struct AccountPosition {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "pa")]
    amount: String,
    #[serde(rename = "ep", default)]
    entry_price: String,
    #[serde(rename = "up", default)]
    unrealized_pnl: String,
    #[serde(rename = "ps", default)]
    position_side: String,
}

#[derive(Debug, Deserialize)]
struct AccountConfigUpdate {
    #[serde(rename = "ac", default)]
    leverage_config: Option<LeverageConfig>,
}

#[derive(Debug, Deserialize)]
struct LeverageConfig {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "l")]
    leverage: u32,
}

// ==================== REST 응답 ====================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListenKeyResponse {
    listen_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoricalOrder {
    order_id: u64,
    symbol: String,
    status: String,
    side: String,
    #[serde(default)]
    position_side: String,
    #[serde(rename = "type", default)]
    order_type: String,
    executed_qty: String,
    avg_price: String,
    #[serde(default)]
    reduce_only: bool,
    #[serde(default)]
    update_time: i64,
    time: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserTrade {
    id: u64,
    order_id: u64,
    commission: String,
    realized_pnl: String,
    time: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRisk {
    symbol: String,
    position_amt: String,
    #[serde(default)]
    leverage: String,
}

impl BinanceAdapter {
    pub fn new(endpoints: ExchangeEndpoints, settings: AdapterSettings) -> Self {
        Self {
            endpoints,
            settings,
            partials: Arc::new(Mutex::new(HashMap::new())),
            leverage: LeverageCache::default(),
        }
    }

    // ==================== 스트림 ====================

    /// listen key 발급 후 스트림 주소 생성.
    pub async fn prepare_stream(
        &self,
        rest: &RestPool,
        credential: &ApiCredential,
    ) -> Result<StreamTarget, ExchangeError> {
        let url = format!("{}{}", self.endpoints.rest_base, LISTEN_KEY_PATH);
        let value = rest
            .execute(|| async {
                let response = rest
                    .client()
                    .post(&url)
                    .header(signing::BINANCE_API_KEY_HEADER, credential.api_key())
                    .send()
                    .await?;
                read_json(response).await
            })
            .await
            .map_err(classify_error)?;
        let parsed: ListenKeyResponse = serde_json::from_value(value)?;
        debug!(exchange = "binance", "listen key 발급 완료");
        Ok(StreamTarget {
            url: format!("{}/ws/{}", self.endpoints.ws_base, parsed.listen_key),
            listen_key: Some(parsed.listen_key),
        })
    }

    /// listen key 연장 (PUT).
    pub async fn keepalive(
        &self,
        rest: &RestPool,
        credential: &ApiCredential,
        listen_key: &str,
    ) -> Result<(), ExchangeError> {
        let url = format!("{}{}", self.endpoints.rest_base, LISTEN_KEY_PATH);
        rest.execute(|| async {
            let response = rest
                .client()
                .put(&url)
                .query(&[("listenKey", listen_key)])
                .header(signing::BINANCE_API_KEY_HEADER, credential.api_key())
                .send()
                .await?;
            read_json(response).await
        })
        .await
        .map_err(classify_error)?;
        Ok(())
    }

    /// 푸시 메시지 해석.
    pub fn parse_message(&self, text: &str) -> Result<Vec<StreamEvent>, ExchangeError> {
        let value: Value = serde_json::from_str(text)?;
        match value.get("e").and_then(|v| v.as_str()) {
            Some("ORDER_TRADE_UPDATE") => {
                let update: OrderTradeUpdate = serde_json::from_value(value)?;
                Ok(vec![StreamEvent::Fill(self.order_update_to_fill(update)?)])
            }
            Some("ACCOUNT_UPDATE") => {
                let update: AccountUpdate = serde_json::from_value(value)?;
                account_update_to_positions(update, &self.leverage)
            }
            Some("ACCOUNT_CONFIG_UPDATE") => {
                let update: AccountConfigUpdate = serde_json::from_value(value)?;
                if let Some(config) = update.leverage_config {
                    debug!(symbol = %config.symbol, leverage = config.leverage, "레버리지 변경");
                    self.leverage
                        .record(&config.symbol, Some(Decimal::from(config.leverage)));
                }
                Ok(vec![StreamEvent::Ignored])
            }
            Some("listenKeyExpired") => Ok(vec![StreamEvent::ListenKeyExpired]),
            _ => Ok(vec![StreamEvent::Ignored]),
        }
    }

    fn order_update_to_fill(&self, update: OrderTradeUpdate) -> Result<RawFill, ExchangeError> {
        let order = update.order;
        let status = map_status(&order.status)?;

        // 체결 건별 수수료/실현손익 누적
        let trade_fee = parse_decimal("n", order.commission.as_deref().unwrap_or(""))?.abs();
        let trade_pnl = parse_decimal("rp", order.realized_profit.as_deref().unwrap_or(""))?;
        let accumulated = {
            let mut partials = self.partials.lock().unwrap_or_else(|e| e.into_inner());
            if order.execution_type == "TRADE" {
                let entry = partials.entry(order.order_id).or_default();
                entry.fee += trade_fee;
                entry.realized_pnl += trade_pnl;
            }
            if status.is_terminal() {
                partials.remove(&order.order_id).unwrap_or_default()
            } else {
                partials.get(&order.order_id).cloned().unwrap_or_default()
            }
        };

        let side = Side::parse_loose(&order.side)
            .ok_or_else(|| ExchangeError::MalformedEvent(format!("알 수 없는 방향: {}", order.side)))?;
        let (effect, position_index) = resolve_effect(
            side,
            &order.position_side,
            order.reduce_only,
            accumulated.realized_pnl,
        );
        let leverage = self.leverage.get(&order.symbol);
        let ts = if order.trade_time > 0 {
            order.trade_time
        } else {
            update.event_time
        };

        Ok(RawFill {
            exchange: ExchangeKind::Binance,
            exchange_order_id: order.order_id.to_string(),
            symbol: order.symbol,
            side,
            effect,
            status,
            order_type: OrderType::parse_loose(&order.order_type),
            quantity: parse_decimal("z", &order.cumulative_qty)?,
            price: parse_decimal("ap", &order.avg_price)?,
            fee: accumulated.fee,
            realized_pnl: accumulated.realized_pnl,
            timestamp: millis_to_utc(ts)?,
            reduce_only: order.reduce_only,
            position_index,
            sequence: (order.trade_id > 0).then_some(order.trade_id),
            leverage,
        })
    }

    // ==================== REST 백필 ====================

    /// 최근 주문 이력 + 체결 내역을 합쳐 누적 체결로 변환.
    pub async fn fetch_recent_fills(
        &self,
        rest: &RestPool,
        credential: &ApiCredential,
        since: DateTime<Utc>,
        symbols: &[String],
    ) -> Result<Vec<RawFill>, ExchangeError> {
        let symbols = if symbols.is_empty() {
            self.open_position_symbols(rest, credential).await?
        } else {
            symbols.to_vec()
        };

        let start = since.timestamp_millis().to_string();
        let limit = self.settings.backfill_limit.to_string();
        let mut fills = Vec::new();
        for symbol in &symbols {
            let params = [
                ("symbol", symbol.as_str()),
                ("startTime", start.as_str()),
                ("limit", limit.as_str()),
            ];
            let orders: Vec<HistoricalOrder> = serde_json::from_value(
                self.signed_get(rest, credential, ALL_ORDERS_PATH, &params)
                    .await?,
            )?;
            let trades: Vec<UserTrade> = serde_json::from_value(
                self.signed_get(rest, credential, USER_TRADES_PATH, &params)
                    .await?,
            )?;
            fills.extend(aggregate_history(orders, trades, &self.leverage)?);
        }
        debug!(
            exchange = "binance",
            symbols = symbols.len(),
            fills = fills.len(),
            "백필 조회 완료"
        );
        Ok(fills)
    }

    /// 심볼 지정 없이 백필할 때 보유 포지션 심볼 조회.
    async fn open_position_symbols(
        &self,
        rest: &RestPool,
        credential: &ApiCredential,
    ) -> Result<Vec<String>, ExchangeError> {
        let risks: Vec<PositionRisk> = serde_json::from_value(
            self.signed_get(rest, credential, POSITION_RISK_PATH, &[])
                .await?,
        )?;
        let mut symbols = Vec::new();
        for risk in risks {
            self.leverage
                .record(&risk.symbol, parse_optional_decimal(Some(risk.leverage.as_str())));
            if !parse_decimal("positionAmt", &risk.position_amt)?.is_zero()
                && !symbols.contains(&risk.symbol)
            {
                symbols.push(risk.symbol);
            }
        }
        Ok(symbols)
    }

    async fn signed_get(
        &self,
        rest: &RestPool,
        credential: &ApiCredential,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<Value, ExchangeError> {
        let url = format!("{}{}", self.endpoints.rest_base, path);
        rest.execute(|| async {
            let mut pairs: Vec<(String, String)> = params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            pairs.push(("recvWindow".to_string(), self.settings.recv_window.to_string()));
            pairs.push(("timestamp".to_string(), Utc::now().timestamp_millis().to_string()));
            let query = serde_urlencoded::to_string(&pairs)
                .map_err(|e| ExchangeError::MalformedEvent(e.to_string()))?;
            let signature = signing::binance_rest(credential.secret(), &query)?;

            let response = rest
                .client()
                .request(Method::GET, format!("{}?{}&signature={}", url, query, signature))
                .header(signing::BINANCE_API_KEY_HEADER, credential.api_key())
                .send()
                .await?;
            read_json(response).await
        })
        .await
        .map_err(classify_error)
    }
}

// ==================== 변환 헬퍼 ====================

fn map_status(status: &str) -> Result<FillStatus, ExchangeError> {
    match status {
        "NEW" => Ok(FillStatus::New),
        "PARTIALLY_FILLED" => Ok(FillStatus::PartiallyFilled),
        "FILLED" => Ok(FillStatus::Filled),
        "CANCELED" => Ok(FillStatus::Canceled),
        "EXPIRED" | "EXPIRED_IN_MATCH" => Ok(FillStatus::Expired),
        "REJECTED" => Ok(FillStatus::Rejected),
        other => Err(ExchangeError::MalformedEvent(format!(
            "알 수 없는 주문 상태: {}",
            other
        ))),
    }
}

/// positionSide(BOTH/LONG/SHORT)와 reduceOnly로 진입/청산 판단.
fn resolve_effect(
    side: Side,
    position_side: &str,
    reduce_only: bool,
    realized_pnl: Decimal,
) -> (PositionEffect, u8) {
    match position_side {
        "LONG" => (
            if side == Side::Buy {
                PositionEffect::Open
            } else {
                PositionEffect::Close
            },
            1,
        ),
        "SHORT" => (
            if side == Side::Sell {
                PositionEffect::Open
            } else {
                PositionEffect::Close
            },
            2,
        ),
        // 단방향 모드: reduceOnly 또는 실현손익 발생 시 청산
        _ => (
            if reduce_only || !realized_pnl.is_zero() {
                PositionEffect::Close
            } else {
                PositionEffect::Open
            },
            0,
        ),
    }
}

fn account_update_to_positions(
    update: AccountUpdate,
    leverage: &LeverageCache,
) -> Result<Vec<StreamEvent>, ExchangeError> {
    let timestamp = millis_to_utc(update.event_time)?;
    let mut events = Vec::new();
    for p in update.account.positions {
        let size = parse_decimal("pa", &p.amount)?;
        let sides: Vec<PositionSide> = match p.position_side.as_str() {
            "LONG" => vec![PositionSide::Long],
            "SHORT" => vec![PositionSide::Short],
            // 단방향 모드에서 수량 0이면 어느 방향이 닫혔는지 알 수 없음
            _ if size.is_zero() => vec![PositionSide::Long, PositionSide::Short],
            _ if size > Decimal::ZERO => vec![PositionSide::Long],
            _ => vec![PositionSide::Short],
        };
        for side in sides {
            events.push(StreamEvent::Position(RawPosition {
                exchange: ExchangeKind::Binance,
                symbol: p.symbol.clone(),
                side,
                size,
                entry_price: parse_decimal("ep", &p.entry_price)?,
                leverage: leverage.get(&p.symbol),
                unrealized_pnl: parse_decimal("up", &p.unrealized_pnl)?,
                liquidation_price: None,
                timestamp,
            }));
        }
    }
    if events.is_empty() {
        events.push(StreamEvent::Ignored);
    }
    Ok(events)
}

/// 주문 이력과 체결 내역을 주문 ID 기준으로 합산.
fn aggregate_history(
    orders: Vec<HistoricalOrder>,
    trades: Vec<UserTrade>,
    leverage: &LeverageCache,
) -> Result<Vec<RawFill>, ExchangeError> {
    let mut by_order: HashMap<u64, (PartialFill, u64)> = HashMap::new();
    for trade in trades {
        let entry = by_order.entry(trade.order_id).or_default();
        entry.0.fee += parse_decimal("commission", &trade.commission)?.abs();
        entry.0.realized_pnl += parse_decimal("realizedPnl", &trade.realized_pnl)?;
        entry.1 = entry.1.max(trade.id);
        debug!(order_id = trade.order_id, time = trade.time, "체결 합산");
    }

    let mut fills = Vec::new();
    for order in orders {
        let status = match map_status(&order.status) {
            Ok(status) => status,
            Err(e) => {
                warn!(order_id = order.order_id, error = %e, "백필 주문 상태 해석 실패");
                continue;
            }
        };
        if !status.is_terminal() {
            continue;
        }
        let Some(side) = Side::parse_loose(&order.side) else {
            warn!(order_id = order.order_id, side = %order.side, "백필 주문 방향 해석 실패");
            continue;
        };
        let (partial, last_trade_id) = by_order.remove(&order.order_id).unwrap_or_default();
        let (effect, position_index) = resolve_effect(
            side,
            &order.position_side,
            order.reduce_only,
            partial.realized_pnl,
        );
        let order_leverage = leverage.get(&order.symbol);
        let ts = if order.update_time > 0 {
            order.update_time
        } else {
            order.time
        };
        fills.push(RawFill {
            exchange: ExchangeKind::Binance,
            exchange_order_id: order.order_id.to_string(),
            symbol: order.symbol,
            side,
            effect,
            status,
            order_type: OrderType::parse_loose(&order.order_type),
            quantity: parse_decimal("executedQty", &order.executed_qty)?,
            price: parse_decimal("avgPrice", &order.avg_price)?,
            fee: partial.fee,
            realized_pnl: partial.realized_pnl,
            timestamp: millis_to_utc(ts)?,
            reduce_only: order.reduce_only,
            position_index,
            sequence: (last_trade_id > 0).then_some(last_trade_id),
            leverage: order_leverage,
        });
    }
    Ok(fills)
}

/// Binance 에러 코드 분류 (-2014/-2015/-1022: 키/서명 오류).
fn classify_error(err: ExchangeError) -> ExchangeError {
    match err {
        ExchangeError::Api { code, message } if matches!(code, -2014 | -2015 | -1022) => {
            ExchangeError::AuthRejected(message)
        }
        ExchangeError::Api { code: -1003, .. } => ExchangeError::RateLimited {
            retry_after_ms: None,
        },
        other => other,
    }
}
