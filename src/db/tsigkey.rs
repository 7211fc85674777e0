use crate::error::HoldfastError;
use crate::zones::TsigKey;
use sqlx::{Row, SqlitePool};

/// Key names arrive on the wire as domain names; lookups are
/// case-insensitive and ignore the trailing dot.
pub async fn get_by_name(
    pool: &SqlitePool,
    name: &str,
) -> Result<Option<TsigKey>, HoldfastError> {
    let row = sqlx::query("SELECT id, name, algorithm, secret FROM tsig_keys WHERE name = ?")
        .bind(name.trim_end_matches('.').to_lowercase())
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| TsigKey {
        id: Some(r.get::<i64, _>("id")),
        name: r.get("name"),
        algorithm: r.get("algorithm"),
        secret: r.get("secret"),
    }))
}

pub async fn create(pool: &SqlitePool, key: &TsigKey) -> Result<i64, HoldfastError> {
    let result = sqlx::query("INSERT INTO tsig_keys (name, algorithm, secret) VALUES (?, ?, ?)")
        .bind(key.name.trim_end_matches('.').to_lowercase())
        .bind(&key.algorithm)
        .bind(&key.secret)
        .execute(pool)
        .await?;
    Ok(result.last_insert_rowid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_conn;

    #[tokio::test]
    async fn test_lookup_ignores_case_and_dot() {
        let pool = test_conn().await;
        create(
            &pool,
            &TsigKey {
                id: None,
                name: "update-key".to_string(),
                algorithm: "hmac-sha256".to_string(),
                secret: "c2VjcmV0".to_string(),
            },
        )
        .await
        .expect("create");
        let key = get_by_name(&pool, "Update-Key.")
            .await
            .expect("lookup")
            .expect("key");
        assert_eq!(key.algorithm, "hmac-sha256");
    }
}
