//! REST 백필/listen key 통합 테스트 (mockito).

use std::time::Duration;

use chrono::{DateTime, Utc};
use mockito::Matcher;
use rust_decimal_macros::dec;
use trader_core::{ApiCredential, Credential, ExchangeKind, FillStatus, PositionEffect};
use trader_exchange::{
    AdapterSettings, ExchangeAdapter, ExchangeEndpoints, ExchangeError, RestPool, RetryConfig,
};
use uuid::Uuid;

fn credential(exchange: ExchangeKind, passphrase: Option<&str>) -> ApiCredential {
    let credential = Credential::new(Uuid::new_v4(), exchange, "main", vec![], vec![], false);
    ApiCredential::new(&credential, "key", "secret", passphrase.map(str::to_string))
}

fn adapter(kind: ExchangeKind, rest_base: &str, demo: bool) -> ExchangeAdapter {
    ExchangeAdapter::new(
        kind,
        ExchangeEndpoints::new(rest_base, "ws://127.0.0.1:1"),
        AdapterSettings::default(),
        demo,
    )
}

fn pool() -> RestPool {
    RestPool::new(Duration::from_secs(5), 4)
        .unwrap()
        .with_retry_config(RetryConfig::no_retry())
}

fn since() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(1_700_000_000_000).unwrap()
}

#[tokio::test]
async fn test_binance_listen_key_builds_stream_url() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/fapi/v1/listenKey")
        .match_header("X-MBX-APIKEY", "key")
        .with_status(200)
        .with_body(r#"{"listenKey":"pqia91ma19a5s61cv6a81va65sdf19v8a65a1a5s61cv6a81va65sdf19v8a65a1"}"#)
        .create_async()
        .await;

    let target = adapter(ExchangeKind::Binance, &server.url(), false)
        .prepare_stream(&pool(), &credential(ExchangeKind::Binance, None))
        .await
        .unwrap();

    mock.assert_async().await;
    assert_eq!(
        target.url,
        "ws://127.0.0.1:1/ws/pqia91ma19a5s61cv6a81va65sdf19v8a65a1a5s61cv6a81va65sdf19v8a65a1"
    );
    assert!(target.listen_key.is_some());
}

#[tokio::test]
async fn test_binance_backfill_aggregates_trades_per_order() {
    let mut server = mockito::Server::new_async().await;
    let orders = server
        .mock("GET", "/fapi/v1/allOrders")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("symbol".into(), "BTCUSDT".into()),
            Matcher::Regex("signature=[0-9a-f]{64}".into()),
        ]))
        .match_header("X-MBX-APIKEY", "key")
        .with_status(200)
        .with_body(
            r#"[
                {"orderId":11,"symbol":"BTCUSDT","status":"FILLED","side":"SELL","positionSide":"BOTH","type":"MARKET","executedQty":"0.1","avgPrice":"42000","reduceOnly":true,"updateTime":1700000100000,"time":1700000090000},
                {"orderId":12,"symbol":"BTCUSDT","status":"NEW","side":"BUY","positionSide":"BOTH","type":"LIMIT","executedQty":"0","avgPrice":"0","reduceOnly":false,"updateTime":1700000200000,"time":1700000200000}
            ]"#,
        )
        .create_async()
        .await;
    let trades = server
        .mock("GET", "/fapi/v1/userTrades")
        .match_query(Matcher::UrlEncoded("symbol".into(), "BTCUSDT".into()))
        .with_status(200)
        .with_body(
            r#"[
                {"id":501,"orderId":11,"commission":"1.2","realizedPnl":"120","time":1700000095000},
                {"id":502,"orderId":11,"commission":"0.9","realizedPnl":"80","time":1700000100000}
            ]"#,
        )
        .create_async()
        .await;

    let fills = adapter(ExchangeKind::Binance, &server.url(), false)
        .fetch_recent_fills(
            &pool(),
            &credential(ExchangeKind::Binance, None),
            since(),
            &["BTCUSDT".to_string()],
        )
        .await
        .unwrap();

    orders.assert_async().await;
    trades.assert_async().await;
    assert_eq!(fills.len(), 1);
    let fill = &fills[0];
    assert_eq!(fill.exchange_order_id, "11");
    assert_eq!(fill.status, FillStatus::Filled);
    assert_eq!(fill.effect, PositionEffect::Close);
    assert_eq!(fill.fee, dec!(2.1));
    assert_eq!(fill.realized_pnl, dec!(200));
    assert_eq!(fill.sequence, Some(502));
}

#[tokio::test]
async fn test_bybit_auth_error_is_not_retried() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/v5/order/history")
        .match_query(Matcher::Any)
        .match_header("X-BAPI-API-KEY", "key")
        .match_header("X-BAPI-RECV-WINDOW", "5000")
        .with_status(200)
        .with_body(r#"{"retCode":10003,"retMsg":"API key is invalid.","result":{}}"#)
        .expect(1)
        .create_async()
        .await;

    let pool = RestPool::new(Duration::from_secs(5), 4).unwrap();
    let result = adapter(ExchangeKind::Bybit, &server.url(), false)
        .fetch_recent_fills(&pool, &credential(ExchangeKind::Bybit, None), since(), &[])
        .await;

    mock.assert_async().await;
    assert!(matches!(result, Err(ExchangeError::AuthRejected(_))));
}

#[tokio::test]
async fn test_bybit_server_error_retried_once() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/v5/order/history")
        .match_query(Matcher::Any)
        .with_status(502)
        .with_body("bad gateway")
        .expect(2)
        .create_async()
        .await;

    let pool = RestPool::new(Duration::from_secs(5), 4).unwrap();
    let result = adapter(ExchangeKind::Bybit, &server.url(), false)
        .fetch_recent_fills(&pool, &credential(ExchangeKind::Bybit, None), since(), &[])
        .await;

    mock.assert_async().await;
    let err = result.unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(err, ExchangeError::Api { code: 502, .. }));
}

#[tokio::test]
async fn test_bitget_demo_backfill_headers_and_parsing() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/api/v2/mix/order/orders-history")
        .match_query(Matcher::UrlEncoded(
            "productType".into(),
            "SUSDT-FUTURES".into(),
        ))
        .match_header("ACCESS-KEY", "key")
        .match_header("ACCESS-PASSPHRASE", "pw")
        .match_header("paptrading", "1")
        .match_header("ACCESS-SIGN", Matcher::Any)
        .with_status(200)
        .with_body(
            r#"{"code":"00000","msg":"success","requestTime":1700000000000,"data":{"entrustedList":[
                {"symbol":"ETHUSDT","orderId":"77","side":"buy","orderType":"market","status":"filled","baseVolume":"2","priceAvg":"2000","fee":"-1.6","totalProfits":"0","reduceOnly":"NO","tradeSide":"open","posMode":"hedge_mode","posSide":"long","cTime":"1700000000000","uTime":"1700000000500"}
            ],"endId":"77"}}"#,
        )
        .create_async()
        .await;

    let fills = adapter(ExchangeKind::Bitget, &server.url(), true)
        .fetch_recent_fills(
            &pool(),
            &credential(ExchangeKind::Bitget, Some("pw")),
            since(),
            &[],
        )
        .await
        .unwrap();

    mock.assert_async().await;
    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0].quantity, dec!(2));
    assert_eq!(fills[0].fee, dec!(1.6));
    assert_eq!(fills[0].position_index, 1);
    assert_eq!(fills[0].effect, PositionEffect::Open);
}

#[tokio::test]
async fn test_rate_limit_status_classified() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/api/v2/mix/order/orders-history")
        .match_query(Matcher::Any)
        .with_status(429)
        .with_header("Retry-After", "2")
        .with_body(r#"{"code":"429","msg":"Too Many Requests"}"#)
        .create_async()
        .await;

    let result = adapter(ExchangeKind::Bitget, &server.url(), false)
        .fetch_recent_fills(
            &pool(),
            &credential(ExchangeKind::Bitget, Some("pw")),
            since(),
            &[],
        )
        .await;

    match result {
        Err(ExchangeError::RateLimited { retry_after_ms }) => {
            assert_eq!(retry_after_ms, Some(2000))
        }
        other => panic!("예상과 다른 결과: {:?}", other.map(|f| f.len())),
    }
}
