//! 거래소별 요청 서명.
//!
//! 모든 함수는 순수 함수이며, 빈 시크릿이나 MAC 초기화 실패 시
//! 빈 서명을 돌려주지 않고 [`SignatureError`]를 반환합니다.
//!
//! | 거래소 | 서명 대상 | 인코딩 |
//! |--------|-----------|--------|
//! | Binance REST | 쿼리 문자열 전체 | hex |
//! | Bybit REST | `timestamp + apiKey + recvWindow + query\|body` | hex |
//! | Bybit WS | `"GET/realtime" + expires` | hex |
//! | Bitget REST | `timestamp + METHOD + path + body` | base64 |
//! | Bitget WS | `timestamp(초) + "GET" + "/user/verify"` | base64 |

use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

// ==================== 헤더 이름 ====================

pub const BINANCE_API_KEY_HEADER: &str = "X-MBX-APIKEY";

pub const BYBIT_API_KEY_HEADER: &str = "X-BAPI-API-KEY";
pub const BYBIT_TIMESTAMP_HEADER: &str = "X-BAPI-TIMESTAMP";
pub const BYBIT_SIGN_HEADER: &str = "X-BAPI-SIGN";
pub const BYBIT_RECV_WINDOW_HEADER: &str = "X-BAPI-RECV-WINDOW";

pub const BITGET_KEY_HEADER: &str = "ACCESS-KEY";
pub const BITGET_SIGN_HEADER: &str = "ACCESS-SIGN";
pub const BITGET_TIMESTAMP_HEADER: &str = "ACCESS-TIMESTAMP";
pub const BITGET_PASSPHRASE_HEADER: &str = "ACCESS-PASSPHRASE";

/// 서명 에러.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("API 시크릿이 비어 있음")]
    EmptySecret,

    #[error("서명 키 초기화 실패: {0}")]
    InvalidKey(String),
}

fn hmac_bytes(secret: &str, payload: &str) -> Result<Vec<u8>, SignatureError> {
    if secret.is_empty() {
        return Err(SignatureError::EmptySecret);
    }
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
    mac.update(payload.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// HMAC-SHA256 hex 서명.
pub fn hmac_sha256_hex(secret: &str, payload: &str) -> Result<String, SignatureError> {
    hmac_bytes(secret, payload).map(hex::encode)
}

/// HMAC-SHA256 base64 서명.
pub fn hmac_sha256_base64(secret: &str, payload: &str) -> Result<String, SignatureError> {
    hmac_bytes(secret, payload).map(|bytes| STANDARD.encode(bytes))
}

// ==================== Binance ====================

/// Binance REST 서명 (timestamp, recvWindow가 포함된 쿼리 문자열 전체).
pub fn binance_rest(secret: &str, query_string: &str) -> Result<String, SignatureError> {
    hmac_sha256_hex(secret, query_string)
}

// ==================== Bybit ====================

/// Bybit REST 서명 대상 문자열.
pub fn bybit_rest_payload(
    timestamp_ms: i64,
    api_key: &str,
    recv_window: u64,
    query_or_body: &str,
) -> String {
    format!("{timestamp_ms}{api_key}{recv_window}{query_or_body}")
}

/// Bybit REST 서명.
pub fn bybit_rest(
    secret: &str,
    timestamp_ms: i64,
    api_key: &str,
    recv_window: u64,
    query_or_body: &str,
) -> Result<String, SignatureError> {
    hmac_sha256_hex(
        secret,
        &bybit_rest_payload(timestamp_ms, api_key, recv_window, query_or_body),
    )
}

/// Bybit WebSocket 인증 서명.
pub fn bybit_ws_auth(secret: &str, expires_ms: i64) -> Result<String, SignatureError> {
    hmac_sha256_hex(secret, &format!("GET/realtime{expires_ms}"))
}

// ==================== Bitget ====================

/// Bitget REST 서명. `method`는 대문자로 정규화됩니다.
pub fn bitget_rest(
    secret: &str,
    timestamp_ms: i64,
    method: &str,
    request_path: &str,
    body: &str,
) -> Result<String, SignatureError> {
    let payload = format!(
        "{timestamp_ms}{}{request_path}{body}",
        method.to_uppercase()
    );
    hmac_sha256_base64(secret, &payload)
}

/// Bitget WebSocket 로그인 서명 (타임스탬프는 초 단위).
pub fn bitget_ws_login(secret: &str, timestamp_secs: i64) -> Result<String, SignatureError> {
    hmac_sha256_base64(secret, &format!("{timestamp_secs}GET/user/verify"))
}
