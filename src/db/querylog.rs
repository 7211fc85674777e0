//! The query log: one row per answered (or refused) query. Feeds the
//! popularity ranking that drives cache prefetch, and the health snapshot.

use crate::error::HoldfastError;
use serde::Serialize;
use sqlx::prelude::FromRow;
use sqlx::{Row, SqlitePool};

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct QueryLogRow {
    pub id: String,
    /// unix seconds
    pub timestamp: i64,
    pub client_ip: String,
    pub name: String,
    pub rrtype: u16,
    pub blocked: bool,
    pub reason: Option<String>,
    pub cached: bool,
    pub response_time_ms: i64,
    pub rcode: u16,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryLogStats {
    pub total: i64,
    pub blocked: i64,
    pub cached: i64,
}

pub async fn insert(pool: &SqlitePool, row: &QueryLogRow) -> Result<(), HoldfastError> {
    sqlx::query(
        "INSERT INTO query_log
         (id, timestamp, client_ip, name, rrtype, blocked, reason, cached, response_time_ms, rcode)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&row.id)
    .bind(row.timestamp)
    .bind(&row.client_ip)
    .bind(&row.name)
    .bind(row.rrtype)
    .bind(row.blocked)
    .bind(&row.reason)
    .bind(row.cached)
    .bind(row.response_time_ms)
    .bind(row.rcode)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn recent(pool: &SqlitePool, limit: i64) -> Result<Vec<QueryLogRow>, HoldfastError> {
    let rows = sqlx::query_as::<_, QueryLogRow>(
        "SELECT * FROM query_log ORDER BY timestamp DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Rows matching a name substring and/or client, newest first.
pub async fn filtered(
    pool: &SqlitePool,
    name_contains: Option<&str>,
    client_ip: Option<&str>,
    limit: i64,
) -> Result<Vec<QueryLogRow>, HoldfastError> {
    let name_pattern = name_contains.map(|n| format!("%{n}%"));
    let rows = sqlx::query_as::<_, QueryLogRow>(
        "SELECT * FROM query_log
         WHERE (?1 IS NULL OR name LIKE ?1) AND (?2 IS NULL OR client_ip = ?2)
         ORDER BY timestamp DESC LIMIT ?3",
    )
    .bind(name_pattern)
    .bind(client_ip)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// The most-queried (name, rrtype) pairs since `since`, with at least
/// `min_count` hits. This is what prefetch iterates.
pub async fn popular(
    pool: &SqlitePool,
    since: i64,
    min_count: i64,
) -> Result<Vec<(String, u16, i64)>, HoldfastError> {
    let rows = sqlx::query(
        "SELECT name, rrtype, COUNT(*) AS hits FROM query_log
         WHERE timestamp >= ? AND blocked = 0
         GROUP BY name, rrtype
         HAVING hits >= ?
         ORDER BY hits DESC
         LIMIT 64",
    )
    .bind(since)
    .bind(min_count)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|r| {
            (
                r.get::<String, _>("name"),
                r.get::<u16, _>("rrtype"),
                r.get::<i64, _>("hits"),
            )
        })
        .collect())
}

pub async fn stats(pool: &SqlitePool) -> Result<QueryLogStats, HoldfastError> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS total,
                COALESCE(SUM(blocked), 0) AS blocked,
                COALESCE(SUM(cached), 0) AS cached
         FROM query_log",
    )
    .fetch_one(pool)
    .await?;
    Ok(QueryLogStats {
        total: row.get::<i64, _>("total"),
        blocked: row.get::<i64, _>("blocked"),
        cached: row.get::<i64, _>("cached"),
    })
}

/// Trim rows older than `before`.
pub async fn cleanup(pool: &SqlitePool, before: i64) -> Result<u64, HoldfastError> {
    let result = sqlx::query("DELETE FROM query_log WHERE timestamp < ?")
        .bind(before)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_conn;

    fn row(name: &str, blocked: bool) -> QueryLogRow {
        QueryLogRow {
            id: uuid::Uuid::now_v7().to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            client_ip: "192.0.2.10".to_string(),
            name: name.to_string(),
            rrtype: 1,
            blocked,
            reason: blocked.then(|| "blocklist".to_string()),
            cached: false,
            response_time_ms: 4,
            rcode: if blocked { 3 } else { 0 },
        }
    }

    #[tokio::test]
    async fn test_insert_and_stats() {
        let pool = test_conn().await;
        insert(&pool, &row("example.com", false)).await.expect("insert");
        insert(&pool, &row("ads.example.com", true)).await.expect("insert");
        let stats = stats(&pool).await.expect("stats");
        assert_eq!(stats.total, 2);
        assert_eq!(stats.blocked, 1);
    }

    #[tokio::test]
    async fn test_popular_threshold() {
        let pool = test_conn().await;
        for _ in 0..3 {
            insert(&pool, &row("popular.example.com", false))
                .await
                .expect("insert");
        }
        insert(&pool, &row("rare.example.com", false)).await.expect("insert");
        let since = chrono::Utc::now().timestamp() - 60;
        let popular = popular(&pool, since, 2).await.expect("popular");
        assert_eq!(popular.len(), 1);
        assert_eq!(popular[0].0, "popular.example.com");
        assert_eq!(popular[0].2, 3);
    }
}
