//! The durable side of the response cache. The hot map is rebuilt from this
//! table at startup, so a restart doesn't start with a cold cache.

use crate::error::HoldfastError;
use sqlx::prelude::FromRow;
use sqlx::SqlitePool;

#[derive(Debug, Clone, FromRow)]
pub struct MirrorEntry {
    pub name: String,
    pub rrtype: u16,
    pub response: Vec<u8>,
    pub inserted_at: i64,
    pub expires_at: i64,
}

pub async fn get(
    pool: &SqlitePool,
    name: &str,
    rrtype: u16,
) -> Result<Option<MirrorEntry>, HoldfastError> {
    let row = sqlx::query_as::<_, MirrorEntry>(
        "SELECT name, rrtype, response, inserted_at, expires_at FROM cache_mirror
         WHERE name = ? AND rrtype = ?",
    )
    .bind(name)
    .bind(rrtype)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn get_all(pool: &SqlitePool) -> Result<Vec<MirrorEntry>, HoldfastError> {
    let rows = sqlx::query_as::<_, MirrorEntry>(
        "SELECT name, rrtype, response, inserted_at, expires_at FROM cache_mirror",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn set(pool: &SqlitePool, entry: &MirrorEntry) -> Result<(), HoldfastError> {
    sqlx::query(
        "INSERT INTO cache_mirror (name, rrtype, response, inserted_at, expires_at)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT (name, rrtype) DO UPDATE SET
            response = excluded.response,
            inserted_at = excluded.inserted_at,
            expires_at = excluded.expires_at",
    )
    .bind(&entry.name)
    .bind(entry.rrtype)
    .bind(&entry.response)
    .bind(entry.inserted_at)
    .bind(entry.expires_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete(pool: &SqlitePool, name: &str, rrtype: u16) -> Result<(), HoldfastError> {
    sqlx::query("DELETE FROM cache_mirror WHERE name = ? AND rrtype = ?")
        .bind(name)
        .bind(rrtype)
        .execute(pool)
        .await?;
    Ok(())
}

/// Drop entries past any possible stale-serving use.
pub async fn cleanup_expired(pool: &SqlitePool, now: i64, stale_grace: i64) -> Result<u64, HoldfastError> {
    let result = sqlx::query("DELETE FROM cache_mirror WHERE expires_at + ? < ?")
        .bind(stale_grace)
        .bind(now)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn clear(pool: &SqlitePool) -> Result<(), HoldfastError> {
    sqlx::query("DELETE FROM cache_mirror").execute(pool).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_conn;

    #[tokio::test]
    async fn test_mirror_round_trip() {
        let pool = test_conn().await;
        let now = chrono::Utc::now().timestamp();
        let entry = MirrorEntry {
            name: "example.com".to_string(),
            rrtype: 1,
            response: vec![1, 2, 3, 4],
            inserted_at: now,
            expires_at: now + 300,
        };
        set(&pool, &entry).await.expect("set");
        let back = get(&pool, "example.com", 1).await.expect("get").expect("entry");
        assert_eq!(back.response, vec![1, 2, 3, 4]);
        assert_eq!(back.expires_at, now + 300);

        delete(&pool, "example.com", 1).await.expect("delete");
        assert!(get(&pool, "example.com", 1).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_cleanup_respects_stale_grace() {
        let pool = test_conn().await;
        let now = chrono::Utc::now().timestamp();
        let stale = MirrorEntry {
            name: "old.example.com".to_string(),
            rrtype: 1,
            response: vec![0],
            inserted_at: now - 4000,
            expires_at: now - 3600,
        };
        set(&pool, &stale).await.expect("set");
        // an hour expired but within a day of grace: kept
        assert_eq!(cleanup_expired(&pool, now, 86400).await.expect("cleanup"), 0);
        // no grace: gone
        assert_eq!(cleanup_expired(&pool, now, 0).await.expect("cleanup"), 1);
    }
}
