//! 서명 REST 호출 공용 풀.
//!
//! 모든 REST 호출은 세마포어로 동시 실행 수가 제한되며,
//! 타임아웃 후 1회 재시도하고 실패하면 복구 가능한 에러를 반환합니다.
//! WebSocket 수신 경로에서는 사용하지 않습니다.

use std::{future::Future, sync::Arc, time::Duration};

use reqwest::{header::RETRY_AFTER, Response, StatusCode};
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::{
    retry::{with_retry, RetryConfig},
    ExchangeError,
};

/// 제한된 REST 실행 풀.
#[derive(Debug, Clone)]
pub struct RestPool {
    client: reqwest::Client,
    permits: Arc<Semaphore>,
    retry: RetryConfig,
}

impl RestPool {
    /// 요청 타임아웃과 최대 동시 요청 수로 생성.
    pub fn new(timeout: Duration, max_concurrent: usize) -> Result<Self, ExchangeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExchangeError::NetworkError(format!("HTTP 클라이언트 생성 실패: {}", e)))?;
        Ok(Self {
            client,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            retry: RetryConfig::rest(),
        })
    }

    /// 재시도 정책 교체.
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// 현재 남은 동시 실행 슬롯.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// 풀 슬롯을 확보한 뒤 재시도 정책으로 작업 실행.
    ///
    /// 요청은 시도마다 새로 만들어야 하므로 (서명 타임스탬프 갱신)
    /// 요청 생성부터 응답 해석까지를 `operation`에 넘깁니다.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, ExchangeError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ExchangeError::Disconnected("REST 풀 종료".to_string()))?;
        with_retry(&self.retry, operation).await
    }
}

/// HTTP 응답을 JSON으로 해석하면서 상태 코드를 에러로 분류.
pub(crate) async fn read_json(response: Response) -> Result<Value, ExchangeError> {
    let status = response.status();
    let retry_after_ms = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(|secs| secs * 1000);
    let body = response.text().await?;

    if status.is_success() {
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        return Ok(serde_json::from_str(&body)?);
    }

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(ExchangeError::AuthRejected(body_message(&body)))
        }
        StatusCode::TOO_MANY_REQUESTS | StatusCode::IM_A_TEAPOT => {
            Err(ExchangeError::RateLimited { retry_after_ms })
        }
        _ => {
            // 거래소 에러 본문 {"code":..., "msg":...} 우선
            let parsed: Option<Value> = serde_json::from_str(&body).ok();
            let code = parsed
                .as_ref()
                .and_then(|v| v.get("code"))
                .and_then(|c| c.as_i64().or_else(|| c.as_str().and_then(|s| s.parse().ok())))
                .unwrap_or(status.as_u16() as i64);
            let code = if status.is_server_error() {
                status.as_u16() as i64
            } else {
                code
            };
            Err(ExchangeError::Api {
                code,
                message: body_message(&body),
            })
        }
    }
}

fn body_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("msg")
                .or_else(|| v.get("retMsg"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.chars().take(200).collect())
}
