//! Per-client admission control. One sliding window per source address;
//! over-budget clients get a synthesized NXDOMAIN rather than an error, so
//! the server's load doesn't telegraph itself.

use crate::config::RateLimitConfig;
use crate::db::ratewindow;
use crate::error::HoldfastError;
use log::debug;
use sqlx::SqlitePool;
use std::net::IpAddr;

pub struct RateLimiter {
    pool: SqlitePool,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(pool: SqlitePool, config: RateLimitConfig) -> Self {
        RateLimiter { pool, config }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// True when the query is admitted. Disabled limiters admit everything.
    pub async fn check(&self, client: IpAddr, now_ms: i64) -> Result<bool, HoldfastError> {
        if !self.config.enabled {
            return Ok(true);
        }
        let allowed = ratewindow::check_rate_limit(
            &self.pool,
            &client.to_string(),
            self.config.max,
            self.config.window_ms as i64,
            now_ms,
        )
        .await?;
        if !allowed {
            debug!("rate limited {client}");
        }
        Ok(allowed)
    }

    /// Drop elapsed windows for every client; runs on the maintenance
    /// schedule.
    pub async fn cleanup(&self, now_ms: i64) -> Result<u64, HoldfastError> {
        ratewindow::cleanup_old_windows(&self.pool, self.config.window_ms as i64, now_ms).await
    }

    /// Free a client mid-window.
    pub async fn unblock(&self, client: IpAddr) -> Result<(), HoldfastError> {
        ratewindow::unblock(&self.pool, &client.to_string()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_conn;

    #[tokio::test]
    async fn test_limits_per_client() {
        let config = RateLimitConfig {
            enabled: true,
            max: 2,
            window_ms: 1000,
        };
        let limiter = RateLimiter::new(test_conn().await, config);
        let alice: IpAddr = "192.0.2.1".parse().expect("ip");
        let bob: IpAddr = "192.0.2.2".parse().expect("ip");

        assert!(limiter.check(alice, 0).await.expect("check"));
        assert!(limiter.check(alice, 1).await.expect("check"));
        assert!(!limiter.check(alice, 2).await.expect("check"));
        assert!(limiter.check(bob, 2).await.expect("check"));
        // window rolls over
        assert!(limiter.check(alice, 1000).await.expect("check"));
    }

    #[tokio::test]
    async fn test_disabled_admits_everything() {
        let limiter = RateLimiter::new(test_conn().await, RateLimitConfig::default());
        let client: IpAddr = "192.0.2.1".parse().expect("ip");
        for i in 0..500 {
            assert!(limiter.check(client, i).await.expect("check"));
        }
    }
}
