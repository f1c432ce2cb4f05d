//! Bybit v5 (linear) 어댑터.
//!
//! - 스트림: `/v5/private` 접속 후 `auth` → `subscribe(order, position)`
//! - 하트비트: `{"op":"ping"}` (응답 `op=pong` 또는 `ret_msg=pong`)
//! - 백필: `GET /v5/order/history?category=linear`
//! - 주문 토픽에는 레버리지가 없어 position 토픽의 마지막 값을 붙입니다.

use chrono::{DateTime, Duration, Utc};
use reqwest::Method;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;
use trader_core::{
    ApiCredential, ExchangeKind, FillStatus, OrderType, PositionEffect, PositionSide, RawFill,
    RawPosition, Side,
};

use super::{
    millis_str_to_utc, parse_decimal, parse_optional_decimal,
    rest::{read_json, RestPool},
    AdapterSettings, ExchangeEndpoints, LeverageCache, StreamEvent, StreamTarget,
};
use crate::{signing, ExchangeError};

pub(crate) const PING_MESSAGE: &str = r#"{"op":"ping"}"#;

const ORDER_HISTORY_PATH: &str = "/v5/order/history";

/// 인증 서명 유효 시간.
const AUTH_EXPIRES_SECS: i64 = 10;

/// Bybit 어댑터.
#[derive(Debug, Clone)]
pub struct BybitAdapter {
    endpoints: ExchangeEndpoints,
    settings: AdapterSettings,
    leverage: LeverageCache,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitOrder {
    symbol: String,
    order_id: String,
    side: String,
    #[serde(default)]
    order_type: String,
    order_status: String,
    #[serde(default)]
    avg_price: String,
    #[serde(default)]
    cum_exec_qty: String,
    #[serde(default)]
    cum_exec_fee: String,
    #[serde(default)]
    closed_pnl: String,
    #[serde(default)]
    reduce_only: bool,
    #[serde(default)]
    position_idx: u8,
    #[serde(default)]
    updated_time: String,
    #[serde(default)]
    created_time: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitPosition {
    symbol: String,
    #[serde(default)]
    side: String,
    #[serde(default)]
    size: String,
    #[serde(default)]
    entry_price: Option<String>,
    #[serde(default)]
    avg_price: Option<String>,
    #[serde(default)]
    leverage: Option<String>,
    #[serde(default)]
    unrealised_pnl: String,
    #[serde(default)]
    liq_price: Option<String>,
    #[serde(default)]
    position_idx: u8,
    #[serde(default)]
    updated_time: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderHistoryResult {
    #[serde(default)]
    list: Vec<BybitOrder>,
}

impl BybitAdapter {
    pub fn new(endpoints: ExchangeEndpoints, settings: AdapterSettings) -> Self {
        Self {
            endpoints,
            settings,
            leverage: LeverageCache::default(),
        }
    }

    pub fn stream_target(&self) -> StreamTarget {
        StreamTarget {
            url: format!("{}/v5/private", self.endpoints.ws_base),
            listen_key: None,
        }
    }

    /// `{"op":"auth","args":[apiKey, expires, signature]}`
    pub fn login_message(
        &self,
        credential: &ApiCredential,
        now: DateTime<Utc>,
    ) -> Result<String, ExchangeError> {
        let expires = (now + Duration::seconds(AUTH_EXPIRES_SECS)).timestamp_millis();
        let signature = signing::bybit_ws_auth(credential.secret(), expires)?;
        Ok(json!({
            "op": "auth",
            "args": [credential.api_key(), expires, signature],
        })
        .to_string())
    }

    pub fn subscribe_messages(&self) -> Vec<String> {
        vec![json!({
            "op": "subscribe",
            "args": ["order", "position"],
        })
        .to_string()]
    }

    pub fn parse_message(&self, text: &str) -> Result<Vec<StreamEvent>, ExchangeError> {
        let value: Value = serde_json::from_str(text)?;

        // 제어 응답 (auth/subscribe/pong)
        if let Some(op) = value.get("op").and_then(|v| v.as_str()) {
            let success = value
                .get("success")
                .and_then(|v| v.as_bool())
                .unwrap_or(true);
            let ret_msg = value
                .get("ret_msg")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            return Ok(vec![match op {
                "auth" if success => StreamEvent::Authenticated,
                "auth" => StreamEvent::AuthRejected(ret_msg.to_string()),
                "subscribe" if success => StreamEvent::Subscribed,
                "subscribe" => {
                    return Err(ExchangeError::Api {
                        code: 0,
                        message: format!("구독 실패: {}", ret_msg),
                    })
                }
                "pong" => StreamEvent::Heartbeat,
                "ping" if ret_msg == "pong" => StreamEvent::Heartbeat,
                _ => StreamEvent::Ignored,
            }]);
        }

        let topic = value.get("topic").and_then(|v| v.as_str()).unwrap_or_default();
        let data = value.get("data").cloned().unwrap_or(Value::Null);
        match topic {
            "order" => {
                let orders: Vec<BybitOrder> = serde_json::from_value(data)?;
                orders
                    .into_iter()
                    .map(|o| {
                        let leverage = self.leverage.get(&o.symbol);
                        order_to_fill(o, leverage).map(StreamEvent::Fill)
                    })
                    .collect()
            }
            "position" => {
                let positions: Vec<BybitPosition> = serde_json::from_value(data)?;
                let mut events = Vec::new();
                for p in positions {
                    self.leverage
                        .record(&p.symbol, parse_optional_decimal(p.leverage.as_deref()));
                    events.extend(position_to_raw(p)?.into_iter().map(StreamEvent::Position));
                }
                Ok(events)
            }
            _ => Ok(vec![StreamEvent::Ignored]),
        }
    }

    /// 최근 주문 이력 조회.
    pub async fn fetch_recent_fills(
        &self,
        rest: &RestPool,
        credential: &ApiCredential,
        since: DateTime<Utc>,
    ) -> Result<Vec<RawFill>, ExchangeError> {
        let query = serde_urlencoded::to_string([
            ("category", "linear".to_string()),
            ("limit", self.settings.backfill_limit.min(50).to_string()),
            ("startTime", since.timestamp_millis().to_string()),
        ])
        .map_err(|e| ExchangeError::MalformedEvent(e.to_string()))?;
        let url = format!("{}{}?{}", self.endpoints.rest_base, ORDER_HISTORY_PATH, query);

        let value = rest
            .execute(|| async {
                let timestamp = Utc::now().timestamp_millis();
                let signature = signing::bybit_rest(
                    credential.secret(),
                    timestamp,
                    credential.api_key(),
                    self.settings.recv_window,
                    &query,
                )?;
                let response = rest
                    .client()
                    .request(Method::GET, &url)
                    .header(signing::BYBIT_API_KEY_HEADER, credential.api_key())
                    .header(signing::BYBIT_TIMESTAMP_HEADER, timestamp.to_string())
                    .header(signing::BYBIT_SIGN_HEADER, signature)
                    .header(
                        signing::BYBIT_RECV_WINDOW_HEADER,
                        self.settings.recv_window.to_string(),
                    )
                    .send()
                    .await?;
                let body = read_json(response).await?;
                check_ret_code(&body)?;
                Ok::<_, ExchangeError>(body)
            })
            .await?;

        let result: OrderHistoryResult =
            serde_json::from_value(value.get("result").cloned().unwrap_or(Value::Null))?;
        let fills = result
            .list
            .into_iter()
            .map(|o| {
                let leverage = self.leverage.get(&o.symbol);
                order_to_fill(o, leverage)
            })
            .collect::<Result<Vec<_>, _>>()?;
        debug!(exchange = "bybit", fills = fills.len(), "백필 조회 완료");
        Ok(fills)
    }
}

/// retCode 0이 아니면 에러로 변환.
fn check_ret_code(body: &Value) -> Result<(), ExchangeError> {
    let code = body.get("retCode").and_then(|v| v.as_i64()).unwrap_or(0);
    if code == 0 {
        return Ok(());
    }
    let message = body
        .get("retMsg")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    Err(match code {
        10003 | 10004 | 10005 | 33004 => ExchangeError::AuthRejected(message),
        10006 | 10018 => ExchangeError::RateLimited {
            retry_after_ms: None,
        },
        10016 => ExchangeError::Api { code: 500, message },
        _ => ExchangeError::Api { code, message },
    })
}

fn map_status(status: &str) -> Result<FillStatus, ExchangeError> {
    match status {
        "Created" | "New" | "Untriggered" | "Triggered" | "Active" => Ok(FillStatus::New),
        "PartiallyFilled" => Ok(FillStatus::PartiallyFilled),
        "Filled" => Ok(FillStatus::Filled),
        // 부분 체결 후 취소도 CANCELED (체결 수량으로 저장 여부 결정)
        "Cancelled" | "PartiallyFilledCanceled" => Ok(FillStatus::Canceled),
        "Deactivated" => Ok(FillStatus::Expired),
        "Rejected" => Ok(FillStatus::Rejected),
        other => Err(ExchangeError::MalformedEvent(format!(
            "알 수 없는 주문 상태: {}",
            other
        ))),
    }
}

/// positionIdx(0=단방향, 1=롱, 2=숏)와 reduceOnly/closedPnl로 진입/청산 판단.
fn resolve_effect(
    side: Side,
    position_idx: u8,
    reduce_only: bool,
    closed_pnl: &str,
) -> PositionEffect {
    match (position_idx, side) {
        (1, Side::Buy) | (2, Side::Sell) => PositionEffect::Open,
        (1, Side::Sell) | (2, Side::Buy) => PositionEffect::Close,
        _ => {
            let has_pnl = parse_optional_decimal(Some(closed_pnl)).is_some();
            if reduce_only || has_pnl {
                PositionEffect::Close
            } else {
                PositionEffect::Open
            }
        }
    }
}

fn order_to_fill(order: BybitOrder, leverage: Option<Decimal>) -> Result<RawFill, ExchangeError> {
    let side = Side::parse_loose(&order.side)
        .ok_or_else(|| ExchangeError::MalformedEvent(format!("알 수 없는 방향: {}", order.side)))?;
    let ts = if order.updated_time.is_empty() {
        &order.created_time
    } else {
        &order.updated_time
    };
    Ok(RawFill {
        exchange: ExchangeKind::Bybit,
        effect: resolve_effect(side, order.position_idx, order.reduce_only, &order.closed_pnl),
        status: map_status(&order.order_status)?,
        order_type: OrderType::parse_loose(&order.order_type),
        quantity: parse_decimal("cumExecQty", &order.cum_exec_qty)?,
        price: parse_decimal("avgPrice", &order.avg_price)?,
        fee: parse_decimal("cumExecFee", &order.cum_exec_fee)?.abs(),
        realized_pnl: parse_decimal("closedPnl", &order.closed_pnl)?,
        timestamp: millis_str_to_utc(ts)?,
        reduce_only: order.reduce_only,
        position_index: order.position_idx,
        sequence: None,
        leverage,
        exchange_order_id: order.order_id,
        symbol: order.symbol,
        side,
    })
}

fn position_to_raw(p: BybitPosition) -> Result<Vec<RawPosition>, ExchangeError> {
    let size = parse_decimal("size", &p.size)?;
    let sides = match (p.position_idx, p.side.as_str()) {
        (1, _) => vec![PositionSide::Long],
        (2, _) => vec![PositionSide::Short],
        (_, "Buy") => vec![PositionSide::Long],
        (_, "Sell") => vec![PositionSide::Short],
        // 단방향 모드 청산 시 side가 비어 있음
        _ => vec![PositionSide::Long, PositionSide::Short],
    };
    let entry = p
        .entry_price
        .as_deref()
        .or(p.avg_price.as_deref())
        .unwrap_or("");
    let timestamp = if p.updated_time.is_empty() {
        Utc::now()
    } else {
        millis_str_to_utc(&p.updated_time)?
    };
    sides
        .into_iter()
        .map(|side| {
            Ok(RawPosition {
                exchange: ExchangeKind::Bybit,
                symbol: p.symbol.clone(),
                side,
                size,
                entry_price: parse_decimal("entryPrice", entry)?,
                leverage: parse_optional_decimal(p.leverage.as_deref()),
                unrealized_pnl: parse_decimal("unrealisedPnl", &p.unrealised_pnl)?,
                liquidation_price: parse_optional_decimal(p.liq_price.as_deref()),
                timestamp,
            })
        })
        .collect()
}
