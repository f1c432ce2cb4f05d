//! Bitget v2 (USDT-M 선물) 어댑터.
//!
//! - 스트림: `/v2/ws/private` 접속 후 `login` → `subscribe(orders, positions, orders-algo)`
//! - 하트비트: 텍스트 `ping` / `pong`
//! - 백필: `GET /api/v2/mix/order/orders-history`
//!
//! 헤지 모드에서 Bitget은 `side=buy, tradeSide=close`를 롱 청산으로 표기하므로
//! 실제 체결 방향으로 뒤집어서 변환합니다.

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde_json::{json, Value};
use tracing::debug;
use trader_core::{
    ApiCredential, ExchangeKind, FillStatus, OrderType, PositionEffect, PositionSide, RawFill,
    RawPosition, Side,
};

use super::{
    millis_str_to_utc, parse_decimal, parse_optional_decimal,
    rest::{read_json, RestPool},
    AdapterSettings, ExchangeEndpoints, StreamEvent, StreamTarget,
};
use crate::{signing, ExchangeError};

pub(crate) const PING_MESSAGE: &str = "ping";
const PONG_MESSAGE: &str = "pong";

const ORDERS_HISTORY_PATH: &str = "/api/v2/mix/order/orders-history";
const SUCCESS_CODE: &str = "00000";

/// Bitget 어댑터.
#[derive(Debug, Clone)]
pub struct BitgetAdapter {
    endpoints: ExchangeEndpoints,
    settings: AdapterSettings,
    /// 데모 트레이딩 여부 (상품 타입과 paptrading 헤더가 달라짐)
    demo: bool,
}

impl BitgetAdapter {
    pub fn new(endpoints: ExchangeEndpoints, settings: AdapterSettings, demo: bool) -> Self {
        Self {
            endpoints,
            settings,
            demo,
        }
    }

    fn product_type(&self) -> &'static str {
        if self.demo {
            "SUSDT-FUTURES"
        } else {
            "USDT-FUTURES"
        }
    }

    pub fn stream_target(&self) -> StreamTarget {
        StreamTarget {
            url: format!("{}/v2/ws/private", self.endpoints.ws_base),
            listen_key: None,
        }
    }

    /// `{"op":"login","args":[{apiKey, passphrase, timestamp, sign}]}`
    pub fn login_message(
        &self,
        credential: &ApiCredential,
        now: DateTime<Utc>,
    ) -> Result<String, ExchangeError> {
        let passphrase = credential
            .passphrase()
            .ok_or_else(|| ExchangeError::AuthRejected("Bitget passphrase 누락".to_string()))?;
        let timestamp = now.timestamp();
        let sign = signing::bitget_ws_login(credential.secret(), timestamp)?;
        Ok(json!({
            "op": "login",
            "args": [{
                "apiKey": credential.api_key(),
                "passphrase": passphrase,
                "timestamp": timestamp.to_string(),
                "sign": sign,
            }],
        })
        .to_string())
    }

    pub fn subscribe_messages(&self) -> Vec<String> {
        let args: Vec<Value> = ["orders", "positions", "orders-algo"]
            .iter()
            .map(|channel| {
                json!({
                    "instType": self.product_type(),
                    "channel": channel,
                    "instId": "default",
                })
            })
            .collect();
        vec![json!({ "op": "subscribe", "args": args }).to_string()]
    }

    pub fn parse_message(&self, text: &str) -> Result<Vec<StreamEvent>, ExchangeError> {
        if text.trim() == PONG_MESSAGE {
            return Ok(vec![StreamEvent::Heartbeat]);
        }
        let value: Value = serde_json::from_str(text)?;

        if let Some(event) = value.get("event").and_then(|v| v.as_str()) {
            let code = field(&value, "code").unwrap_or_else(|| "0".to_string());
            let msg = field(&value, "msg").unwrap_or_default();
            return match event {
                "login" if code == "0" || code == SUCCESS_CODE => {
                    Ok(vec![StreamEvent::Authenticated])
                }
                "login" => Ok(vec![StreamEvent::AuthRejected(msg)]),
                "subscribe" => Ok(vec![StreamEvent::Subscribed]),
                "error" => {
                    let code_num = code.parse::<i64>().unwrap_or_default();
                    // 30000번대 로그인 관련 에러
                    if matches!(code_num, 30004 | 30005 | 30006 | 30011 | 30012 | 30013 | 30015) {
                        Ok(vec![StreamEvent::AuthRejected(msg)])
                    } else {
                        Err(ExchangeError::Api {
                            code: code_num,
                            message: msg,
                        })
                    }
                }
                _ => Ok(vec![StreamEvent::Ignored]),
            };
        }

        let channel = value
            .pointer("/arg/channel")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let items = value
            .get("data")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        match channel {
            "orders" => items
                .iter()
                .map(|item| order_to_fill(item).map(StreamEvent::Fill))
                .collect(),
            "positions" => items
                .iter()
                .map(|item| position_to_raw(item).map(StreamEvent::Position))
                .collect(),
            // 계획 주문은 발동 후 일반 주문으로 다시 들어옴
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
        let passphrase = credential
            .passphrase()
            .ok_or_else(|| ExchangeError::AuthRejected("Bitget passphrase 누락".to_string()))?;
        let query = serde_urlencoded::to_string([
            ("productType", self.product_type().to_string()),
            ("startTime", since.timestamp_millis().to_string()),
            ("limit", self.settings.backfill_limit.min(100).to_string()),
        ])
        .map_err(|e| ExchangeError::MalformedEvent(e.to_string()))?;
        let request_path = format!("{}?{}", ORDERS_HISTORY_PATH, query);
        let url = format!("{}{}", self.endpoints.rest_base, request_path);

        let value = rest
            .execute(|| async {
                let timestamp = Utc::now().timestamp_millis();
                let sign =
                    signing::bitget_rest(credential.secret(), timestamp, "GET", &request_path, "")?;
                let mut request = rest
                    .client()
                    .request(Method::GET, &url)
                    .header(signing::BITGET_KEY_HEADER, credential.api_key())
                    .header(signing::BITGET_SIGN_HEADER, sign)
                    .header(signing::BITGET_TIMESTAMP_HEADER, timestamp.to_string())
                    .header(signing::BITGET_PASSPHRASE_HEADER, passphrase)
                    .header("Content-Type", "application/json")
                    .header("locale", "en-US");
                if self.demo {
                    request = request.header("paptrading", "1");
                }
                let body = read_json(request.send().await?).await.map_err(classify_error)?;
                check_code(&body)?;
                Ok::<_, ExchangeError>(body)
            })
            .await?;

        let items = value
            .pointer("/data/entrustedList")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let fills = items
            .iter()
            .map(order_to_fill)
            .collect::<Result<Vec<_>, _>>()?;
        debug!(exchange = "bitget", fills = fills.len(), "백필 조회 완료");
        Ok(fills)
    }
}

// ==================== 변환 헬퍼 ====================

/// 문자열 또는 숫자 필드를 문자열로 읽기.
fn field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn required(value: &Value, key: &str) -> Result<String, ExchangeError> {
    field(value, key).ok_or_else(|| ExchangeError::MalformedEvent(format!("필드 누락: {}", key)))
}

fn check_code(body: &Value) -> Result<(), ExchangeError> {
    match field(body, "code") {
        None => Ok(()),
        Some(code) if code == SUCCESS_CODE => Ok(()),
        Some(code) => Err(classify_error(ExchangeError::Api {
            code: code.parse().unwrap_or_default(),
            message: field(body, "msg").unwrap_or_default(),
        })),
    }
}

/// Bitget 에러 코드 분류.
fn classify_error(err: ExchangeError) -> ExchangeError {
    match err {
        ExchangeError::Api { code, message }
            if matches!(code, 40006 | 40009 | 40012 | 40014 | 40037) =>
        {
            ExchangeError::AuthRejected(message)
        }
        ExchangeError::Api { code: 429, .. } => ExchangeError::RateLimited {
            retry_after_ms: None,
        },
        other => other,
    }
}

fn map_status(status: &str) -> Result<FillStatus, ExchangeError> {
    match status {
        "live" | "new" | "init" => Ok(FillStatus::New),
        "partially_filled" | "partial_fill" => Ok(FillStatus::PartiallyFilled),
        "filled" | "full_fill" => Ok(FillStatus::Filled),
        "canceled" | "cancelled" => Ok(FillStatus::Canceled),
        other => Err(ExchangeError::MalformedEvent(format!(
            "알 수 없는 주문 상태: {}",
            other
        ))),
    }
}

/// tradeSide/reduceOnly/손익으로 진입·청산 판단.
fn resolve_effect(trade_side: &str, reduce_only: bool, pnl: Option<&str>) -> PositionEffect {
    let trade_side = trade_side.to_lowercase();
    if trade_side == "open" {
        PositionEffect::Open
    } else if trade_side.contains("close") {
        PositionEffect::Close
    } else if reduce_only || parse_optional_decimal(pnl).is_some() {
        // 단방향 모드 (buy_single / sell_single)
        PositionEffect::Close
    } else {
        PositionEffect::Open
    }
}

fn order_to_fill(item: &Value) -> Result<RawFill, ExchangeError> {
    let symbol = field(item, "symbol")
        .or_else(|| field(item, "instId"))
        .ok_or_else(|| ExchangeError::MalformedEvent("심볼 누락".to_string()))?;
    let raw_side = required(item, "side")?;
    let reduce_only = field(item, "reduceOnly")
        .map(|v| v.eq_ignore_ascii_case("yes") || v == "true")
        .unwrap_or(false);
    let pnl = field(item, "totalProfits").or_else(|| field(item, "pnl"));
    let effect = resolve_effect(
        &field(item, "tradeSide").unwrap_or_default(),
        reduce_only,
        pnl.as_deref(),
    );

    let hedge = field(item, "posMode").is_some_and(|m| m == "hedge_mode");
    let pos_side = field(item, "posSide").unwrap_or_default();
    let (side, position_index) = match (hedge, pos_side.as_str()) {
        (true, "long") => (
            if effect == PositionEffect::Open { Side::Buy } else { Side::Sell },
            1,
        ),
        (true, "short") => (
            if effect == PositionEffect::Open { Side::Sell } else { Side::Buy },
            2,
        ),
        _ => (
            Side::parse_loose(&raw_side).ok_or_else(|| {
                ExchangeError::MalformedEvent(format!("알 수 없는 방향: {}", raw_side))
            })?,
            0,
        ),
    };

    // 누적 수수료: feeDetail 합 → fee → fillFee 순
    let fee = match item.get("feeDetail").and_then(|v| v.as_array()) {
        Some(details) if !details.is_empty() => {
            let mut total = rust_decimal::Decimal::ZERO;
            for detail in details {
                let fee = field(detail, "fee").unwrap_or_default();
                total += parse_decimal("feeDetail.fee", &fee)?.abs();
            }
            total
        }
        _ => parse_decimal(
            "fee",
            &field(item, "fee")
                .or_else(|| field(item, "fillFee"))
                .unwrap_or_default(),
        )?
        .abs(),
    };

    let quantity = field(item, "accBaseVolume")
        .or_else(|| field(item, "baseVolume"))
        .unwrap_or_default();
    let price = field(item, "priceAvg")
        .or_else(|| field(item, "fillPrice"))
        .unwrap_or_default();
    let ts = field(item, "uTime")
        .or_else(|| field(item, "cTime"))
        .ok_or_else(|| ExchangeError::MalformedEvent("시각 누락".to_string()))?;

    Ok(RawFill {
        exchange: ExchangeKind::Bitget,
        exchange_order_id: required(item, "orderId")?,
        symbol,
        side,
        effect,
        status: map_status(&required(item, "status")?)?,
        order_type: OrderType::parse_loose(&field(item, "orderType").unwrap_or_default()),
        quantity: parse_decimal("accBaseVolume", &quantity)?,
        price: parse_decimal("priceAvg", &price)?,
        fee,
        realized_pnl: parse_decimal("pnl", pnl.as_deref().unwrap_or(""))?,
        timestamp: millis_str_to_utc(&ts)?,
        reduce_only,
        position_index,
        sequence: None,
        leverage: parse_optional_decimal(field(item, "leverage").as_deref()),
    })
}

fn position_to_raw(item: &Value) -> Result<RawPosition, ExchangeError> {
    let side = match required(item, "holdSide")?.as_str() {
        "long" => PositionSide::Long,
        "short" => PositionSide::Short,
        other => {
            return Err(ExchangeError::MalformedEvent(format!(
                "알 수 없는 포지션 방향: {}",
                other
            )))
        }
    };
    let timestamp = match field(item, "uTime") {
        Some(ts) => millis_str_to_utc(&ts)?,
        None => Utc::now(),
    };
    Ok(RawPosition {
        exchange: ExchangeKind::Bitget,
        symbol: required(item, "instId")?,
        side,
        size: parse_decimal("total", &field(item, "total").unwrap_or_default())?,
        entry_price: parse_decimal(
            "openPriceAvg",
            &field(item, "openPriceAvg").unwrap_or_default(),
        )?,
        leverage: parse_optional_decimal(field(item, "leverage").as_deref()),
        unrealized_pnl: parse_decimal(
            "unrealizedPL",
            &field(item, "unrealizedPL").unwrap_or_default(),
        )?,
        liquidation_price: parse_optional_decimal(field(item, "liquidationPrice").as_deref()),
        timestamp,
    })
}
