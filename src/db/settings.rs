//! A tiny key/value table for runtime toggles that should survive restarts,
//! eg "blocking disabled until" timestamps flipped through the admin surface.

use crate::error::HoldfastError;
use sqlx::{Row, SqlitePool};

pub async fn get(pool: &SqlitePool, key: &str, default: &str) -> Result<String, HoldfastError> {
    let row = sqlx::query("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(row
        .map(|r| r.get::<String, _>("value"))
        .unwrap_or_else(|| default.to_string()))
}

pub async fn set(pool: &SqlitePool, key: &str, value: &str) -> Result<(), HoldfastError> {
    sqlx::query(
        "INSERT INTO settings (key, value) VALUES (?, ?)
         ON CONFLICT (key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_conn;

    #[tokio::test]
    async fn test_settings_round_trip() {
        let pool = test_conn().await;
        assert_eq!(
            get(&pool, "blocking_enabled", "true").await.expect("get"),
            "true"
        );
        set(&pool, "blocking_enabled", "false").await.expect("set");
        assert_eq!(
            get(&pool, "blocking_enabled", "true").await.expect("get"),
            "false"
        );
        set(&pool, "blocking_enabled", "true").await.expect("set again");
        assert_eq!(
            get(&pool, "blocking_enabled", "false").await.expect("get"),
            "true"
        );
    }
}
