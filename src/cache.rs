//! The response cache. Two tiers: a DashMap hot path that never suspends,
//! and the sqlite mirror that survives restarts. Entries are whole encoded
//! responses keyed by (lowercased name, qtype); the stored query id is
//! overwritten with the asking client's id on the way out.

use crate::config::CacheConfig;
use crate::db::cachemirror::{self, MirrorEntry};
use crate::enums::RecordType;
use crate::error::HoldfastError;
use crate::message::extract_min_ttl;
use dashmap::DashMap;
use log::{debug, info};
use sqlx::SqlitePool;

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct CacheKey {
    pub name: String,
    pub rrtype: RecordType,
}

impl CacheKey {
    pub fn new(name: &str, rrtype: RecordType) -> Self {
        CacheKey {
            name: name.to_lowercase(),
            rrtype,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub response: Vec<u8>,
    pub inserted_at: i64,
    pub expires_at: i64,
}

impl CacheEntry {
    pub fn is_fresh(&self, now: i64) -> bool {
        now <= self.expires_at
    }

    /// Seconds past expiry, zero while fresh.
    pub fn staleness(&self, now: i64) -> i64 {
        (now - self.expires_at).max(0)
    }

    /// How much of the TTL is left, 0.0 at (or past) expiry.
    pub fn remaining_fraction(&self, now: i64) -> f64 {
        let lifetime = (self.expires_at - self.inserted_at).max(1);
        let remaining = (self.expires_at - now).max(0);
        remaining as f64 / lifetime as f64
    }
}

pub struct QueryCache {
    hot: DashMap<CacheKey, CacheEntry>,
    pool: SqlitePool,
    config: CacheConfig,
}

impl QueryCache {
    pub fn new(pool: SqlitePool, config: CacheConfig) -> Self {
        QueryCache {
            hot: DashMap::new(),
            pool,
            config,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn len(&self) -> usize {
        self.hot.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hot.is_empty()
    }

    /// Lift surviving mirror entries into the hot map at startup and drop
    /// the ones already past use.
    pub async fn warm_from_mirror(&self, now: i64) -> Result<usize, HoldfastError> {
        let stale_grace = self.stale_grace();
        let mut lifted = 0usize;
        for entry in cachemirror::get_all(&self.pool).await? {
            if entry.expires_at + stale_grace < now {
                cachemirror::delete(&self.pool, &entry.name, entry.rrtype).await?;
                continue;
            }
            self.hot.insert(
                CacheKey::new(&entry.name, RecordType::from(entry.rrtype)),
                CacheEntry {
                    response: entry.response,
                    inserted_at: entry.inserted_at,
                    expires_at: entry.expires_at,
                },
            );
            lifted += 1;
        }
        info!("cache warmed with {lifted} entries from the mirror");
        Ok(lifted)
    }

    fn stale_grace(&self) -> i64 {
        match self.config.serve_stale {
            true => self.config.serve_stale_max_age as i64,
            false => 0,
        }
    }

    /// Fresh-only lookup. The stored response comes back verbatim except the
    /// id field, which is overwritten with the current query's id. Never
    /// suspends.
    pub fn get(&self, name: &str, rrtype: RecordType, query_id: u16, now: i64) -> Option<Vec<u8>> {
        if !self.config.enabled {
            return None;
        }
        let key = CacheKey::new(name, rrtype);
        let entry = self.hot.get(&key)?;
        if !entry.is_fresh(now) {
            return None;
        }
        Some(serve_bytes(&entry.response, query_id))
    }

    /// Expired-but-recent lookup, for when every upstream just fell over.
    /// Only answers when stale serving is on and the entry is within the
    /// configured age.
    pub fn get_stale(
        &self,
        name: &str,
        rrtype: RecordType,
        query_id: u16,
        now: i64,
    ) -> Option<Vec<u8>> {
        if !self.config.enabled || !self.config.serve_stale {
            return None;
        }
        let key = CacheKey::new(name, rrtype);
        let entry = self.hot.get(&key)?;
        if entry.staleness(now) > self.config.serve_stale_max_age as i64 {
            return None;
        }
        debug!(
            "serving stale entry for {name}/{rrtype}, {}s past expiry",
            entry.staleness(now)
        );
        Some(serve_bytes(&entry.response, query_id))
    }

    /// Store a response. TTL comes from the answer section's minimum unless
    /// the caller overrides it (static local answers pass 3600).
    pub async fn insert(
        &self,
        name: &str,
        rrtype: RecordType,
        response: Vec<u8>,
        ttl_override: Option<u32>,
        now: i64,
    ) -> Result<(), HoldfastError> {
        if !self.config.enabled {
            return Ok(());
        }
        let ttl = ttl_override.unwrap_or_else(|| extract_min_ttl(&response));
        // a zero TTL means transaction-only, it never enters the cache
        if ttl == 0 {
            return Ok(());
        }
        let key = CacheKey::new(name, rrtype);
        let entry = CacheEntry {
            response: response.clone(),
            inserted_at: now,
            expires_at: now + ttl as i64,
        };
        cachemirror::set(
            &self.pool,
            &MirrorEntry {
                name: key.name.clone(),
                rrtype: rrtype as u16,
                response,
                inserted_at: entry.inserted_at,
                expires_at: entry.expires_at,
            },
        )
        .await?;
        self.hot.insert(key, entry);
        Ok(())
    }

    pub async fn remove(&self, name: &str, rrtype: RecordType) -> Result<(), HoldfastError> {
        let key = CacheKey::new(name, rrtype);
        self.hot.remove(&key);
        cachemirror::delete(&self.pool, &key.name, rrtype as u16).await?;
        Ok(())
    }

    /// Admin flush: drop everything, both tiers.
    pub async fn clear(&self) -> Result<(), HoldfastError> {
        self.hot.clear();
        cachemirror::clear(&self.pool).await?;
        Ok(())
    }

    /// Periodic expiry: entries past any stale-serving use leave the hot map
    /// and the mirror together.
    pub async fn expire_cycle(&self, now: i64) -> Result<usize, HoldfastError> {
        let stale_grace = self.stale_grace();
        let doomed: Vec<CacheKey> = self
            .hot
            .iter()
            .filter(|item| item.value().expires_at + stale_grace < now)
            .map(|item| item.key().clone())
            .collect();
        for key in &doomed {
            self.hot.remove(key);
        }
        cachemirror::cleanup_expired(&self.pool, now, stale_grace).await?;
        Ok(doomed.len())
    }

    /// (key, remaining fraction) for entries near enough to expiry that the
    /// prefetcher should refresh them.
    pub fn prefetch_candidate(&self, name: &str, rrtype: RecordType, now: i64) -> Option<CacheKey> {
        if !self.config.prefetch_enabled {
            return None;
        }
        let key = CacheKey::new(name, rrtype);
        let entry = self.hot.get(&key)?;
        let fraction = entry.remaining_fraction(now);
        (fraction < 1.0 - self.config.prefetch_threshold).then_some(key)
    }

    pub fn prefetch_min_queries(&self) -> u32 {
        self.config.prefetch_min_queries
    }

    pub fn prefetch_enabled(&self) -> bool {
        self.config.enabled && self.config.prefetch_enabled
    }
}

/// Clone the stored bytes and stamp the current query's id over the first
/// two octets.
fn serve_bytes(stored: &[u8], query_id: u16) -> Vec<u8> {
    let mut out = stored.to_vec();
    if out.len() >= 2 {
        out[0..2].copy_from_slice(&query_id.to_be_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_conn;

    fn test_config() -> CacheConfig {
        CacheConfig {
            enabled: true,
            serve_stale: true,
            serve_stale_max_age: 3600,
            prefetch_enabled: true,
            prefetch_threshold: 0.2,
            prefetch_min_queries: 2,
        }
    }

    /// a fake response: id 0xAAAA and enough bytes to be plausible
    fn response() -> Vec<u8> {
        let mut bytes = vec![0xAA, 0xAA];
        bytes.extend([0u8; 14]);
        bytes
    }

    #[tokio::test]
    async fn test_insert_get_rewrites_id() {
        let cache = QueryCache::new(test_conn().await, test_config());
        let now = 1_000_000;
        cache
            .insert("example.com", RecordType::A, response(), Some(300), now)
            .await
            .expect("insert");
        let served = cache
            .get("EXAMPLE.com", RecordType::A, 0x1234, now + 10)
            .expect("cache miss");
        assert_eq!(&served[0..2], &[0x12, 0x34]);
        // everything but the id is untouched
        assert_eq!(&served[2..], &response()[2..]);
    }

    #[tokio::test]
    async fn test_key_isolation() {
        let cache = QueryCache::new(test_conn().await, test_config());
        let now = 1_000_000;
        cache
            .insert("example.com", RecordType::A, response(), Some(300), now)
            .await
            .expect("insert");
        assert!(cache.get("example.com", RecordType::AAAA, 1, now).is_none());
        assert!(cache.get("other.com", RecordType::A, 1, now).is_none());
    }

    #[tokio::test]
    async fn test_expiry_and_stale_window() {
        let cache = QueryCache::new(test_conn().await, test_config());
        let now = 1_000_000;
        cache
            .insert("example.com", RecordType::A, response(), Some(300), now)
            .await
            .expect("insert");

        // fresh until expires_at
        assert!(cache.get("example.com", RecordType::A, 1, now + 300).is_some());
        assert!(cache.get("example.com", RecordType::A, 1, now + 301).is_none());

        // stale serving picks it up inside the grace window
        assert!(cache
            .get_stale("example.com", RecordType::A, 1, now + 301)
            .is_some());
        assert!(cache
            .get_stale("example.com", RecordType::A, 1, now + 301 + 3600)
            .is_none());
    }

    #[tokio::test]
    async fn test_stale_disabled_never_serves_expired() {
        let mut config = test_config();
        config.serve_stale = false;
        let cache = QueryCache::new(test_conn().await, config);
        let now = 1_000_000;
        cache
            .insert("example.com", RecordType::A, response(), Some(60), now)
            .await
            .expect("insert");
        assert!(cache
            .get_stale("example.com", RecordType::A, 1, now + 61)
            .is_none());
    }

    #[tokio::test]
    async fn test_warm_from_mirror() {
        let pool = test_conn().await;
        let now = 1_000_000;
        {
            let cache = QueryCache::new(pool.clone(), test_config());
            cache
                .insert("example.com", RecordType::A, response(), Some(300), now)
                .await
                .expect("insert");
        }
        // a new cache over the same pool starts cold, then warms
        let cache = QueryCache::new(pool, test_config());
        assert!(cache.is_empty());
        let lifted = cache.warm_from_mirror(now + 10).await.expect("warm");
        assert_eq!(lifted, 1);
        assert!(cache.get("example.com", RecordType::A, 9, now + 10).is_some());
    }

    #[tokio::test]
    async fn test_expire_cycle_clears_both_tiers() {
        let pool = test_conn().await;
        let cache = QueryCache::new(pool.clone(), test_config());
        let now = 1_000_000;
        cache
            .insert("example.com", RecordType::A, response(), Some(60), now)
            .await
            .expect("insert");
        // inside the stale window nothing is removed
        assert_eq!(cache.expire_cycle(now + 100).await.expect("cycle"), 0);
        let removed = cache.expire_cycle(now + 61 + 3600).await.expect("cycle");
        assert_eq!(removed, 1);
        assert!(cache.is_empty());
        assert!(
            crate::db::cachemirror::get(&pool, "example.com", RecordType::A as u16)
                .await
                .expect("mirror get")
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_zero_ttl_is_not_cached() {
        let cache = QueryCache::new(test_conn().await, test_config());
        let now = 1_000_000;
        cache
            .insert("flash.example.com", RecordType::A, response(), Some(0), now)
            .await
            .expect("insert");
        assert!(cache.get("flash.example.com", RecordType::A, 1, now).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_prefetch_candidate_threshold() {
        let cache = QueryCache::new(test_conn().await, test_config());
        let now = 1_000_000;
        cache
            .insert("example.com", RecordType::A, response(), Some(100), now)
            .await
            .expect("insert");
        // 90% of the TTL left: not a candidate (threshold 0.2 wants < 0.8)
        assert!(cache
            .prefetch_candidate("example.com", RecordType::A, now + 10)
            .is_none());
        // 50% left: refresh it
        assert!(cache
            .prefetch_candidate("example.com", RecordType::A, now + 50)
            .is_some());
    }
}
