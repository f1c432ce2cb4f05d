//! 자격증명 활성화 상태와 세션 목록 동기화.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use trader_core::{ApiCredential, Credential, CredentialEncryptor, CredentialSecrets, LedgerStore};
use trader_exchange::{ConnectionManager, ExchangeAdapter};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::stats::SyncStats;

/// 저장된 활성 자격증명마다 세션 하나를 유지합니다.
///
/// 새로 활성화된 자격증명은 세션을 시작하고,
/// 비활성화/삭제된 자격증명의 세션은 종료합니다.
pub struct CredentialSync {
    store: Arc<dyn LedgerStore>,
    encryptor: Arc<CredentialEncryptor>,
    manager: Arc<ConnectionManager>,
    config: Arc<SyncConfig>,
}

impl CredentialSync {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        encryptor: Arc<CredentialEncryptor>,
        manager: Arc<ConnectionManager>,
        config: Arc<SyncConfig>,
    ) -> Self {
        Self {
            store,
            encryptor,
            manager,
            config,
        }
    }

    /// 암호화된 자격증명 복호화.
    pub fn decrypt(&self, credential: &Credential) -> Result<ApiCredential> {
        let secrets: CredentialSecrets = self
            .encryptor
            .decrypt_json(&credential.encrypted_credentials, &credential.encryption_nonce)?;
        if credential.exchange.requires_passphrase() && secrets.passphrase.is_none() {
            return Err(SyncError::MissingPassphrase(credential.id));
        }
        Ok(ApiCredential::from_secrets(credential, secrets))
    }

    /// 자격증명 환경(운영/테스트넷)에 맞는 어댑터.
    pub fn adapter_for(&self, credential: &Credential) -> ExchangeAdapter {
        ExchangeAdapter::new(
            credential.exchange,
            self.config.endpoints_for(credential.exchange, credential.is_testnet),
            self.config.adapter_settings(),
            credential.is_testnet,
        )
    }

    /// 1회 동기화.
    pub async fn sync_once(&self) -> Result<SyncStats> {
        let started_at = Instant::now();
        let mut stats = SyncStats::new();

        let active = self.store.list_credentials(true).await?;
        let running: HashSet<Uuid> = self.manager.credential_ids().await.into_iter().collect();
        let active_ids: HashSet<Uuid> = active.iter().map(|c| c.id).collect();
        stats.active = active.len();

        for credential in &active {
            if running.contains(&credential.id) {
                stats.unchanged += 1;
                continue;
            }
            match self.decrypt(credential) {
                Ok(api) => {
                    let adapter = self.adapter_for(credential);
                    self.manager.start(api, adapter).await;
                    stats.started += 1;
                }
                Err(e) => {
                    error!(
                        credential_id = %credential.id,
                        user_id = %credential.user_id,
                        exchange = %credential.exchange,
                        error = %e,
                        "자격증명 복호화 실패, 세션 시작 건너뜀"
                    );
                    stats.errors += 1;
                }
            }
        }

        for credential_id in running.difference(&active_ids) {
            if self.manager.deactivate(*credential_id).await {
                info!(credential_id = %credential_id, "비활성 자격증명 세션 종료");
                stats.stopped += 1;
            }
        }

        stats.elapsed = started_at.elapsed();
        Ok(stats)
    }

    /// 주기 실행. 첫 동기화는 즉시 수행합니다.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.daemon.credential_sync_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("자격증명 동기화 종료");
                    break;
                }
                _ = interval.tick() => {
                    match self.sync_once().await {
                        Ok(stats) => stats.log_summary("credential_sync"),
                        Err(e) => warn!(error = %e, "자격증명 목록 조회 실패"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        DaemonConfig, EndpointOverrides, ExchangeUrls, LedgerConfig, RestConfig, RiskConfig,
        SessionSettings,
    };
    use std::time::Duration;
    use tokio::sync::mpsc;
    use trader_core::ExchangeKind;
    use trader_data::MemoryLedgerStore;
    use trader_exchange::{RestPool, SessionEvent};

    fn unreachable_urls() -> ExchangeUrls {
        ExchangeUrls {
            rest: Some("http://127.0.0.1:9".to_string()),
            ws: Some("ws://127.0.0.1:9".to_string()),
            testnet_rest: Some("http://127.0.0.1:9".to_string()),
            testnet_ws: Some("ws://127.0.0.1:9".to_string()),
        }
    }

    fn config() -> SyncConfig {
        SyncConfig {
            database_url: None,
            encryption_master_key: String::new(),
            endpoints: EndpointOverrides {
                binance: unreachable_urls(),
                bybit: unreachable_urls(),
                bitget: unreachable_urls(),
            },
            rest: RestConfig::default(),
            session: SessionSettings {
                drain_timeout_secs: 1,
                ..SessionSettings::default()
            },
            ledger: LedgerConfig::default(),
            risk: RiskConfig::default(),
            daemon: DaemonConfig::default(),
        }
    }

    struct Fixture {
        sync: CredentialSync,
        store: Arc<MemoryLedgerStore>,
        encryptor: Arc<CredentialEncryptor>,
        manager: Arc<ConnectionManager>,
        _events: mpsc::Receiver<SessionEvent>,
    }

    fn fixture() -> Fixture {
        let config = Arc::new(config());
        let store = Arc::new(MemoryLedgerStore::new());
        let encryptor = Arc::new(CredentialEncryptor::from_bytes(&[7u8; 32]).unwrap());
        let rest = RestPool::new(Duration::from_secs(1), 2).unwrap();
        let (tx, rx) = mpsc::channel(16);
        let manager = Arc::new(ConnectionManager::new(rest, config.session_config(), tx));
        let sync = CredentialSync::new(store.clone(), encryptor.clone(), manager.clone(), config);
        Fixture {
            sync,
            store,
            encryptor,
            manager,
            _events: rx,
        }
    }

    fn credential(
        encryptor: &CredentialEncryptor,
        exchange: ExchangeKind,
        passphrase: Option<&str>,
    ) -> Credential {
        let secrets = CredentialSecrets {
            api_key: "key-1234".to_string(),
            api_secret: "secret".to_string(),
            passphrase: passphrase.map(str::to_string),
        };
        let (ciphertext, nonce) = encryptor.encrypt_json(&secrets).unwrap();
        Credential::new(Uuid::new_v4(), exchange, "main", ciphertext, nonce, true)
    }

    #[tokio::test]
    async fn test_decrypt_requires_passphrase_for_bitget() {
        let f = fixture();
        let bitget = credential(&f.encryptor, ExchangeKind::Bitget, None);
        assert!(matches!(
            f.sync.decrypt(&bitget),
            Err(SyncError::MissingPassphrase(id)) if id == bitget.id
        ));

        let bybit = credential(&f.encryptor, ExchangeKind::Bybit, None);
        let api = f.sync.decrypt(&bybit).unwrap();
        assert_eq!(api.api_key(), "key-1234");
        assert_eq!(api.secret(), "secret");
        assert!(api.is_testnet);
    }

    #[tokio::test]
    async fn test_adapter_follows_credential_environment() {
        let f = fixture();
        let credential = credential(&f.encryptor, ExchangeKind::Binance, None);
        assert_eq!(f.sync.adapter_for(&credential).kind(), ExchangeKind::Binance);
    }

    #[tokio::test]
    async fn test_sync_starts_and_stops_sessions() {
        let f = fixture();
        let good = credential(&f.encryptor, ExchangeKind::Bybit, None);
        let broken = credential(&f.encryptor, ExchangeKind::Bitget, None);
        f.store.save_credential(good.clone()).await.unwrap();
        f.store.save_credential(broken).await.unwrap();

        let stats = f.sync.sync_once().await.unwrap();
        assert_eq!(stats.active, 2);
        assert_eq!(stats.started, 1);
        assert_eq!(stats.errors, 1);
        assert_eq!(f.manager.credential_ids().await, vec![good.id]);

        let stats = f.sync.sync_once().await.unwrap();
        assert_eq!(stats.unchanged, 1);
        assert_eq!(stats.started, 0);

        f.store.set_credential_active(good.id, false).await.unwrap();
        let stats = f.sync.sync_once().await.unwrap();
        assert_eq!(stats.stopped, 1);
        assert!(f.manager.credential_ids().await.is_empty());
    }
}
