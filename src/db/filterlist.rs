//! Filter list storage. The filter engine never queries these tables on the
//! hot path - [load_filter_state] pulls everything into memory and the
//! engine swaps the compiled view in atomically.

use crate::error::HoldfastError;
use sqlx::{Row, SqlitePool};
use std::collections::{HashMap, HashSet};

pub const SCOPE_GLOBAL: &str = "global";
pub const SCOPE_CLIENT: &str = "client";
pub const SCOPE_GROUP: &str = "group";
pub const KIND_ALLOW: &str = "allow";
pub const KIND_BLOCK: &str = "block";

/// A regex filter as stored.
#[derive(Debug, Clone)]
pub struct RegexFilterRow {
    pub pattern: String,
    pub kind: String,
    pub enabled: bool,
}

/// The whole filter dataset, as loaded for one atomic swap.
#[derive(Debug, Clone, Default)]
pub struct FilterData {
    pub global_allow: HashSet<String>,
    pub global_block: HashSet<String>,
    pub client_allow: HashMap<String, HashSet<String>>,
    pub client_block: HashMap<String, HashSet<String>>,
    pub group_allow: HashMap<String, HashSet<String>>,
    pub group_block: HashMap<String, HashSet<String>>,
    pub regexes: Vec<RegexFilterRow>,
    /// client ip -> groups it belongs to
    pub client_groups: HashMap<String, Vec<String>>,
    pub clients_blocking_disabled: HashSet<String>,
    pub groups_blocking_disabled: HashSet<String>,
}

pub async fn load_filter_state(pool: &SqlitePool) -> Result<FilterData, HoldfastError> {
    let mut data = FilterData::default();

    let rows = sqlx::query("SELECT scope, subject, kind, domain FROM filter_domains")
        .fetch_all(pool)
        .await?;
    for row in rows {
        let scope: String = row.get("scope");
        let subject: Option<String> = row.get("subject");
        let kind: String = row.get("kind");
        let domain: String = row.get::<String, _>("domain").to_lowercase();
        match (scope.as_str(), kind.as_str(), subject) {
            (SCOPE_GLOBAL, KIND_ALLOW, _) => {
                data.global_allow.insert(domain);
            }
            (SCOPE_GLOBAL, KIND_BLOCK, _) => {
                data.global_block.insert(domain);
            }
            (SCOPE_CLIENT, KIND_ALLOW, Some(ip)) => {
                data.client_allow.entry(ip).or_default().insert(domain);
            }
            (SCOPE_CLIENT, KIND_BLOCK, Some(ip)) => {
                data.client_block.entry(ip).or_default().insert(domain);
            }
            (SCOPE_GROUP, KIND_ALLOW, Some(group)) => {
                data.group_allow.entry(group).or_default().insert(domain);
            }
            (SCOPE_GROUP, KIND_BLOCK, Some(group)) => {
                data.group_block.entry(group).or_default().insert(domain);
            }
            (scope, kind, subject) => {
                log::warn!("skipping filter row with scope={scope} kind={kind} subject={subject:?}")
            }
        }
    }

    let rows = sqlx::query("SELECT pattern, kind, enabled FROM filter_regexes")
        .fetch_all(pool)
        .await?;
    data.regexes = rows
        .into_iter()
        .map(|r| RegexFilterRow {
            pattern: r.get("pattern"),
            kind: r.get("kind"),
            enabled: r.get("enabled"),
        })
        .collect();

    let rows = sqlx::query("SELECT client_ip, group_name FROM client_groups")
        .fetch_all(pool)
        .await?;
    for row in rows {
        data.client_groups
            .entry(row.get("client_ip"))
            .or_default()
            .push(row.get("group_name"));
    }

    let rows = sqlx::query("SELECT client_ip FROM client_settings WHERE blocking_enabled = 0")
        .fetch_all(pool)
        .await?;
    data.clients_blocking_disabled = rows.into_iter().map(|r| r.get("client_ip")).collect();

    let rows = sqlx::query("SELECT group_name FROM group_settings WHERE blocking_enabled = 0")
        .fetch_all(pool)
        .await?;
    data.groups_blocking_disabled = rows.into_iter().map(|r| r.get("group_name")).collect();

    Ok(data)
}

pub async fn add_domain(
    pool: &SqlitePool,
    scope: &str,
    subject: Option<&str>,
    kind: &str,
    domain: &str,
) -> Result<(), HoldfastError> {
    sqlx::query("INSERT INTO filter_domains (scope, subject, kind, domain) VALUES (?, ?, ?, ?)")
        .bind(scope)
        .bind(subject)
        .bind(kind)
        .bind(domain.to_lowercase())
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn add_regex(
    pool: &SqlitePool,
    pattern: &str,
    kind: &str,
    enabled: bool,
) -> Result<(), HoldfastError> {
    sqlx::query("INSERT INTO filter_regexes (pattern, kind, enabled) VALUES (?, ?, ?)")
        .bind(pattern)
        .bind(kind)
        .bind(enabled)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_conn;

    #[tokio::test]
    async fn test_load_filter_state() {
        let pool = test_conn().await;
        add_domain(&pool, SCOPE_GLOBAL, None, KIND_BLOCK, "Ads.Example.COM")
            .await
            .expect("add");
        add_domain(&pool, SCOPE_CLIENT, Some("192.0.2.10"), KIND_ALLOW, "ok.example.com")
            .await
            .expect("add");
        add_regex(&pool, r"^ad\d+\.", KIND_BLOCK, true).await.expect("add");

        let data = load_filter_state(&pool).await.expect("load");
        // domains are lowercased on the way in
        assert!(data.global_block.contains("ads.example.com"));
        assert!(data
            .client_allow
            .get("192.0.2.10")
            .expect("client set")
            .contains("ok.example.com"));
        assert_eq!(data.regexes.len(), 1);
    }
}
