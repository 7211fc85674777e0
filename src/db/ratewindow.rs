//! Sliding-window rate limit state, one row per client. The check runs as a
//! single transaction so concurrent queries from the same client can't both
//! sneak under the cap.

use crate::error::HoldfastError;
use sqlx::{Row, SqlitePool};

/// Admit or reject one query from `client_ip`. Admitting increments the
/// counter; a window older than `window_ms` is restarted first.
pub async fn check_rate_limit(
    pool: &SqlitePool,
    client_ip: &str,
    max: u32,
    window_ms: i64,
    now_ms: i64,
) -> Result<bool, HoldfastError> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query("SELECT window_start, count FROM rate_windows WHERE client_ip = ?")
        .bind(client_ip)
        .fetch_optional(&mut *tx)
        .await?;

    let allowed = match row {
        Some(row) => {
            let window_start = row.get::<i64, _>("window_start");
            let count = row.get::<i64, _>("count");
            if now_ms - window_start >= window_ms {
                sqlx::query(
                    "UPDATE rate_windows SET window_start = ?, count = 1 WHERE client_ip = ?",
                )
                .bind(now_ms)
                .bind(client_ip)
                .execute(&mut *tx)
                .await?;
                true
            } else if count < max as i64 {
                sqlx::query("UPDATE rate_windows SET count = count + 1 WHERE client_ip = ?")
                    .bind(client_ip)
                    .execute(&mut *tx)
                    .await?;
                true
            } else {
                false
            }
        }
        None => {
            sqlx::query(
                "INSERT INTO rate_windows (client_ip, window_start, count) VALUES (?, ?, 1)",
            )
            .bind(client_ip)
            .bind(now_ms)
            .execute(&mut *tx)
            .await?;
            true
        }
    };

    tx.commit().await?;
    Ok(allowed)
}

/// Drop windows that have fully elapsed for every client.
pub async fn cleanup_old_windows(
    pool: &SqlitePool,
    window_ms: i64,
    now_ms: i64,
) -> Result<u64, HoldfastError> {
    let result = sqlx::query("DELETE FROM rate_windows WHERE window_start + ? <= ?")
        .bind(window_ms)
        .bind(now_ms)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Forget a client entirely, freeing it mid-window.
pub async fn unblock(pool: &SqlitePool, client_ip: &str) -> Result<(), HoldfastError> {
    sqlx::query("DELETE FROM rate_windows WHERE client_ip = ?")
        .bind(client_ip)
        .execute(pool)
        .await?;
    Ok(())
}
