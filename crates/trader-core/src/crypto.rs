//! API 자격증명 암호화 (AES-256-GCM).
//!
//! 마스터 키는 프로세스 시작 시 한 번 로드해서 `Arc<CredentialEncryptor>`로
//! 공유합니다. 전역 상태는 두지 않습니다.
//!
//! ```text
//! let encryptor = CredentialEncryptor::new(&master_key_b64)?;
//! let (ciphertext, nonce) = encryptor.encrypt_json(&secrets)?;
//! let secrets: CredentialSecrets = encryptor.decrypt_json(&ciphertext, &nonce)?;
//! ```

use std::fmt;

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// AES-GCM nonce 길이 (바이트).
pub const NONCE_LEN: usize = 12;

/// AES-256 키 길이 (바이트).
pub const KEY_LEN: usize = 32;

/// 암호화 에러.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("마스터 키 형식 오류: {0}")]
    InvalidKey(String),

    #[error("nonce 길이 오류: {0}바이트 (12바이트 필요)")]
    InvalidNonce(usize),

    #[error("암호화 실패")]
    Encrypt,

    #[error("복호화 실패 (키 불일치 또는 데이터 손상)")]
    Decrypt,

    #[error("직렬화 오류: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// 자격증명 암복호화기.
pub struct CredentialEncryptor {
    cipher: Aes256Gcm,
}

impl CredentialEncryptor {
    /// base64로 인코딩된 32바이트 마스터 키로 생성.
    pub fn new(master_key_b64: &str) -> Result<Self, CryptoError> {
        let key = STANDARD
            .decode(master_key_b64.trim())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Self::from_bytes(&key)
    }

    /// 원시 키 바이트로 생성.
    pub fn from_bytes(key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "{}바이트 (32바이트 필요)",
                key.len()
            )));
        }
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// 평문 암호화. (암호문, nonce) 반환.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::Encrypt)?;
        Ok((ciphertext, nonce.to_vec()))
    }

    /// 암호문 복호화.
    pub fn decrypt(&self, ciphertext: &[u8], nonce: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if nonce.len() != NONCE_LEN {
            return Err(CryptoError::InvalidNonce(nonce.len()));
        }
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }

    /// 값을 JSON으로 직렬화한 뒤 암호화.
    pub fn encrypt_json<T: Serialize>(&self, value: &T) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
        let plaintext = serde_json::to_vec(value)?;
        self.encrypt(&plaintext)
    }

    /// 복호화 후 JSON 역직렬화.
    pub fn decrypt_json<T: DeserializeOwned>(
        &self,
        ciphertext: &[u8],
        nonce: &[u8],
    ) -> Result<T, CryptoError> {
        let plaintext = self.decrypt(ciphertext, nonce)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

impl fmt::Debug for CredentialEncryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialEncryptor")
            .field("cipher", &"AES-256-GCM")
            .finish()
    }
}
