//! 거래소 통신 에러.

use thiserror::Error;

use crate::signing::SignatureError;

/// 거래소 어댑터/세션 에러.
///
/// 재시도 가능 여부와 치명 여부로 분류해서 세션 루프와
/// [`crate::retry`] 유틸리티가 처리 방식을 결정합니다.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// 인증 거부 (잘못된 키, 권한 부족, 서명 불일치)
    #[error("인증 거부: {0}")]
    AuthRejected(String),

    /// 네트워크/전송 계층 에러
    #[error("네트워크 에러: {0}")]
    NetworkError(String),

    /// 해석할 수 없는 메시지
    #[error("잘못된 이벤트: {0}")]
    MalformedEvent(String),

    /// 응답 시간 초과
    #[error("시간 초과: {0}")]
    Timeout(String),

    /// 거래소 API 에러 (코드 포함)
    #[error("API 에러 ({code}): {message}")]
    Api { code: i64, message: String },

    /// 요청 한도 초과
    #[error("요청 한도 초과 (retry_after_ms={retry_after_ms:?})")]
    RateLimited { retry_after_ms: Option<u64> },

    /// 세션 토큰(listen key) 만료
    #[error("listen key 만료")]
    ListenKeyExpired,

    /// 서명 생성 실패
    #[error("서명 실패: {0}")]
    Signature(#[from] SignatureError),

    /// 연결 종료
    #[error("연결 종료: {0}")]
    Disconnected(String),
}

impl ExchangeError {
    /// 재시도로 해결될 수 있는 일시적 에러인지.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkError(_)
            | Self::Timeout(_)
            | Self::RateLimited { .. }
            | Self::Disconnected(_)
            | Self::ListenKeyExpired => true,
            // 5xx 계열 또는 거래소 내부 오류 코드
            Self::Api { code, .. } => *code >= 500 || *code == -1001,
            _ => false,
        }
    }

    /// 재시도해도 의미 없는 치명적 에러인지.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthRejected(_) | Self::Signature(_))
    }

    /// 에러가 지정하는 대기 시간 (밀리초).
    pub fn retry_delay_ms(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_ms } => retry_after_ms.or(Some(1000)),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_decode() {
            Self::MalformedEvent(err.to_string())
        } else {
            Self::NetworkError(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ExchangeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                Self::Disconnected(err.to_string())
            }
            other => Self::NetworkError(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedEvent(err.to_string())
    }
}
