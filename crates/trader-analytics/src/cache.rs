//! 사용자별 리스크 패턴 TTL 캐시.

use std::{
    collections::HashMap,
    fmt,
    time::{Duration, Instant},
};

use tokio::sync::RwLock;
use trader_core::RiskPattern;
use uuid::Uuid;

/// 캐시 내부 저장 항목.
struct CacheEntry {
    pattern: RiskPattern,
    created_at: Instant,
}

/// 사용자별 [`RiskPattern`] TTL 캐시.
///
/// `get()`은 TTL이 지나면 `None`을 반환합니다.
pub struct RiskPatternCache {
    entries: RwLock<HashMap<Uuid, CacheEntry>>,
    ttl: Duration,
}

impl RiskPatternCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// 캐시된 값 조회.
    pub async fn get(&self, user_id: Uuid) -> Option<RiskPattern> {
        let guard = self.entries.read().await;
        guard.get(&user_id).and_then(|entry| {
            if entry.created_at.elapsed() < self.ttl {
                Some(entry.pattern.clone())
            } else {
                None
            }
        })
    }

    pub async fn set(&self, pattern: RiskPattern) {
        let mut guard = self.entries.write().await;
        guard.insert(
            pattern.user_id,
            CacheEntry {
                pattern,
                created_at: Instant::now(),
            },
        );
    }

    /// 한 사용자 무효화 (포지션 청산 시).
    pub async fn invalidate(&self, user_id: Uuid) {
        self.entries.write().await.remove(&user_id);
    }
}

impl fmt::Debug for RiskPatternCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RiskPatternCache")
            .field("ttl", &self.ttl)
            .finish()
    }
}
