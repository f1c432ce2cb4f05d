//! 재시도 및 재연결 백오프 유틸리티.
//!
//! - [`RetryConfig`] / [`with_retry`]: REST 호출 재시도 (기본 1회)
//! - [`ReconnectBackoff`]: 세션 재연결 대기 시간 (지수 백오프 + 지터, 상한)
//!
//! # 예시
//!
//! ```rust,ignore
//! use trader_exchange::retry::{RetryConfig, with_retry};
//!
//! let config = RetryConfig::rest();
//! let fills = with_retry(&config, || async {
//!     adapter.fetch_recent_fills(&http, &credential).await
//! }).await?;
//! ```

use std::{future::Future, time::Duration};

use rand::Rng;
use tracing::{debug, warn};

use crate::ExchangeError;

/// 재시도 설정.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// 최대 재시도 횟수 (초기 시도 제외).
    pub max_retries: u32,
    /// 기본 대기 시간 (에러에 지정된 대기 시간이 없을 때 사용).
    pub base_delay: Duration,
    /// 최대 대기 시간.
    pub max_delay: Duration,
    /// 재시도 시 지터(무작위 지연) 추가 여부.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// REST 조회용 설정: 1회 재시도 후 실패 반환.
    pub fn rest() -> Self {
        Self {
            max_retries: 1,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            add_jitter: true,
        }
    }

    /// 재시도 없음 (단일 시도).
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::rest()
        }
    }

    /// 대기 시간 계산. 에러에 지정된 대기 시간이 있으면 우선 사용합니다.
    fn calculate_delay(&self, error: &ExchangeError) -> Duration {
        let delay = error
            .retry_delay_ms()
            .map(Duration::from_millis)
            .unwrap_or(self.base_delay)
            .min(self.max_delay);

        if self.add_jitter {
            apply_jitter(delay, 0.25)
        } else {
            delay
        }
    }
}

/// ±ratio 범위의 지터 적용.
fn apply_jitter(delay: Duration, ratio: f64) -> Duration {
    let millis = delay.as_millis() as f64;
    let range = millis * ratio;
    if range <= 0.0 {
        return delay;
    }
    let jitter = rand::thread_rng().gen_range(-range..=range);
    Duration::from_millis((millis + jitter).max(0.0) as u64)
}

/// 재시도가 포함된 비동기 작업 실행.
///
/// 치명적 에러나 재시도 불가능한 에러는 즉시 반환합니다.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation: F) -> Result<T, ExchangeError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    let mut attempt = 0;
    let mut total_delay = Duration::ZERO;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(
                        attempts = attempt + 1,
                        total_delay_ms = total_delay.as_millis(),
                        "재시도 후 성공"
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                if e.is_fatal() {
                    warn!(error = %e, "치명적 에러 발생, 재시도 없이 실패 반환");
                    return Err(e);
                }

                if !e.is_retryable() {
                    debug!(error = %e, "재시도 불가능한 에러, 즉시 실패 반환");
                    return Err(e);
                }

                if attempt >= config.max_retries {
                    warn!(
                        error = %e,
                        attempts = attempt + 1,
                        max_retries = config.max_retries,
                        "최대 재시도 횟수 초과"
                    );
                    return Err(e);
                }

                let delay = config.calculate_delay(&e);
                total_delay += delay;

                warn!(
                    error = %e,
                    attempt = attempt + 1,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "재시도 대기 중"
                );

                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

// ==================== 재연결 백오프 ====================

/// 세션 재연결 백오프.
///
/// 실패할 때마다 대기 시간이 배수로 늘어나며 `max`에서 멈춥니다.
/// 구독이 정상화되면 [`reset`](Self::reset)으로 초기화합니다.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter_ratio: f64,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            multiplier: 2.0,
            jitter_ratio: 0.2,
            attempt: 0,
        }
    }

    /// 지터 비율 설정 (0이면 지터 없음).
    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    /// 누적 실패 횟수.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// 다음 대기 시간을 계산하고 실패 횟수를 증가.
    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.attempt.min(30) as i32;
        let raw_ms = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = Duration::from_millis(raw_ms.min(self.max.as_millis() as f64) as u64);
        self.attempt = self.attempt.saturating_add(1);
        apply_jitter(capped, self.jitter_ratio).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
