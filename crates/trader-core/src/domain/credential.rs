//! 거래소 API 자격증명.
//!
//! 저장소에는 AES-256-GCM으로 암호화된 블롭만 보관하며,
//! 복호화된 키는 [`ApiCredential`]로 메모리에만 존재합니다.

use std::fmt;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ExchangeKind;

/// 저장된 거래소 자격증명 (암호화 상태).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub id: Uuid,
    pub user_id: Uuid,
    pub exchange: ExchangeKind,
    /// 사용자 지정 이름
    pub label: String,
    /// 암호화된 [`CredentialSecrets`] JSON
    pub encrypted_credentials: Vec<u8>,
    /// AES-GCM nonce (12바이트)
    pub encryption_nonce: Vec<u8>,
    /// 테스트넷/데모 환경 여부
    pub is_testnet: bool,
    /// 활성화 여부 (비활성 자격증명은 세션을 열지 않음)
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Credential {
    /// 새 자격증명 생성 (활성 상태).
    pub fn new(
        user_id: Uuid,
        exchange: ExchangeKind,
        label: impl Into<String>,
        encrypted_credentials: Vec<u8>,
        encryption_nonce: Vec<u8>,
        is_testnet: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            exchange,
            label: label.into(),
            encrypted_credentials,
            encryption_nonce,
            is_testnet,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn activate(&mut self) {
        self.is_active = true;
        self.updated_at = Utc::now();
    }

    pub fn deactivate(&mut self) {
        self.is_active = false;
        self.updated_at = Utc::now();
    }
}

/// 암호화 대상 JSON 페이로드.
#[derive(Clone, Serialize, Deserialize)]
pub struct CredentialSecrets {
    pub api_key: String,
    pub api_secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
}

impl fmt::Debug for CredentialSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSecrets")
            .field("api_key", &mask(&self.api_key))
            .field("api_secret", &"[REDACTED]")
            .field("passphrase", &self.passphrase.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// 복호화된 API 키 (메모리 전용).
///
/// `Debug` 출력에서 비밀값은 가려집니다.
#[derive(Clone)]
pub struct ApiCredential {
    pub credential_id: Uuid,
    pub user_id: Uuid,
    pub exchange: ExchangeKind,
    pub is_testnet: bool,
    api_key: String,
    secret: SecretString,
    passphrase: Option<SecretString>,
}

impl ApiCredential {
    pub fn new(
        credential: &Credential,
        api_key: impl Into<String>,
        secret: impl Into<String>,
        passphrase: Option<String>,
    ) -> Self {
        Self {
            credential_id: credential.id,
            user_id: credential.user_id,
            exchange: credential.exchange,
            is_testnet: credential.is_testnet,
            api_key: api_key.into(),
            secret: SecretString::from(secret.into()),
            passphrase: passphrase.map(SecretString::from),
        }
    }

    /// 복호화된 페이로드로부터 생성.
    pub fn from_secrets(credential: &Credential, secrets: CredentialSecrets) -> Self {
        Self::new(
            credential,
            secrets.api_key,
            secrets.api_secret,
            secrets.passphrase,
        )
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn secret(&self) -> &str {
        self.secret.expose_secret()
    }

    pub fn passphrase(&self) -> Option<&str> {
        self.passphrase.as_ref().map(|p| p.expose_secret())
    }
}

impl fmt::Debug for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredential")
            .field("credential_id", &self.credential_id)
            .field("exchange", &self.exchange)
            .field("api_key", &mask(&self.api_key))
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// 로그 출력용 키 마스킹 (앞 4자리만 노출).
fn mask(value: &str) -> String {
    let prefix: String = value.chars().take(4).collect();
    format!("{}****", prefix)
}
