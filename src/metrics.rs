//! Process-wide counters behind the `/health` endpoint. Plain atomics, no
//! metrics pipeline: uptime, query volume, error rate and QPS are all the
//! outside world gets to see.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    pub started_at: AtomicU64,
    pub queries_total: AtomicU64,
    pub cache_hits: AtomicU64,
    pub blocked: AtomicU64,
    pub rate_limited: AtomicU64,
    pub authoritative_answers: AtomicU64,
    pub upstream_answers: AtomicU64,
    pub stale_served: AtomicU64,
    pub ddns_updates: AtomicU64,
    pub errors: AtomicU64,
    pub validation_failures: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub uptime_seconds: u64,
    pub queries_total: u64,
    pub cache_hits: u64,
    pub blocked: u64,
    pub rate_limited: u64,
    pub authoritative_answers: u64,
    pub upstream_answers: u64,
    pub stale_served: u64,
    pub ddns_updates: u64,
    pub errors: u64,
    pub error_rate: f64,
    pub qps: f64,
}

impl Metrics {
    pub fn new(now: u64) -> Self {
        let metrics = Metrics::default();
        metrics.started_at.store(now, Ordering::Relaxed);
        metrics
    }

    pub fn bump(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, now: u64) -> HealthSnapshot {
        let started = self.started_at.load(Ordering::Relaxed);
        let uptime = now.saturating_sub(started);
        let total = self.queries_total.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        HealthSnapshot {
            status: "ok",
            uptime_seconds: uptime,
            queries_total: total,
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            authoritative_answers: self.authoritative_answers.load(Ordering::Relaxed),
            upstream_answers: self.upstream_answers.load(Ordering::Relaxed),
            stale_served: self.stale_served.load(Ordering::Relaxed),
            ddns_updates: self.ddns_updates.load(Ordering::Relaxed),
            errors,
            error_rate: match total {
                0 => 0.0,
                total => errors as f64 / total as f64,
            },
            qps: match uptime {
                0 => total as f64,
                uptime => total as f64 / uptime as f64,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_math() {
        let metrics = Metrics::new(1000);
        for _ in 0..10 {
            metrics.bump(&metrics.queries_total);
        }
        metrics.bump(&metrics.errors);
        let snapshot = metrics.snapshot(1005);
        assert_eq!(snapshot.uptime_seconds, 5);
        assert_eq!(snapshot.queries_total, 10);
        assert!((snapshot.error_rate - 0.1).abs() < f64::EPSILON);
        assert!((snapshot.qps - 2.0).abs() < f64::EPSILON);
    }
}
