//! SQLite-backed storage: zones, keys, the query log, the cache mirror,
//! filter lists and rate windows. Everything the server persists goes
//! through here.

use crate::config::ConfigFile;
use crate::error::HoldfastError;
use log::debug;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, SqlitePool};
use std::str::FromStr;

pub mod cachemirror;
pub mod filterlist;
pub mod querylog;
pub mod ratewindow;
pub mod settings;
pub mod tsigkey;
pub mod zone;

pub async fn get_conn(config: &ConfigFile) -> Result<SqlitePool, HoldfastError> {
    let db_path = shellexpand::tilde(&config.sqlite_path).into_owned();
    debug!("opening sqlite database at {db_path}");
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{db_path}"))
        .map_err(|e| HoldfastError::StartupError(format!("bad sqlite path {db_path}: {e}")))?
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// An in-memory database, for tests.
#[cfg(test)]
pub async fn test_conn() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("failed to open in-memory sqlite");
    start_db(&pool).await.expect("failed to create schema");
    pool
}

/// Create the schema if this is a fresh database.
pub async fn start_db(pool: &Pool<Sqlite>) -> Result<(), HoldfastError> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    debug!("database schema is in place");
    Ok(())
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS query_log (
        id TEXT PRIMARY KEY,
        timestamp INTEGER NOT NULL,
        client_ip TEXT NOT NULL,
        name TEXT NOT NULL,
        rrtype INTEGER NOT NULL,
        blocked INTEGER NOT NULL DEFAULT 0,
        reason TEXT,
        cached INTEGER NOT NULL DEFAULT 0,
        response_time_ms INTEGER NOT NULL,
        rcode INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_query_log_time ON query_log (timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_query_log_name ON query_log (name, rrtype)",
    "CREATE TABLE IF NOT EXISTS cache_mirror (
        name TEXT NOT NULL,
        rrtype INTEGER NOT NULL,
        response BLOB NOT NULL,
        inserted_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL,
        PRIMARY KEY (name, rrtype)
    )",
    "CREATE TABLE IF NOT EXISTS zones (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        mname TEXT NOT NULL DEFAULT '',
        rname TEXT NOT NULL DEFAULT '',
        serial INTEGER NOT NULL DEFAULT 0,
        refresh INTEGER NOT NULL DEFAULT 3600,
        retry INTEGER NOT NULL DEFAULT 900,
        expire INTEGER NOT NULL DEFAULT 604800,
        minimum INTEGER NOT NULL DEFAULT 300
    )",
    "CREATE TABLE IF NOT EXISTS zone_records (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        zoneid INTEGER NOT NULL REFERENCES zones (id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        rrtype TEXT NOT NULL,
        rdata TEXT NOT NULL,
        ttl INTEGER NOT NULL,
        priority INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_zone_records_owner ON zone_records (zoneid, name, rrtype)",
    "CREATE TABLE IF NOT EXISTS zone_keys (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        zoneid INTEGER NOT NULL REFERENCES zones (id) ON DELETE CASCADE,
        algorithm INTEGER NOT NULL,
        flags INTEGER NOT NULL,
        key_tag INTEGER NOT NULL,
        private_key TEXT NOT NULL,
        public_key TEXT NOT NULL,
        active INTEGER NOT NULL DEFAULT 1
    )",
    "CREATE TABLE IF NOT EXISTS tsig_keys (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        algorithm TEXT NOT NULL,
        secret TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS filter_domains (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        scope TEXT NOT NULL,
        subject TEXT,
        kind TEXT NOT NULL,
        domain TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_filter_domains ON filter_domains (scope, kind, domain)",
    "CREATE TABLE IF NOT EXISTS filter_regexes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        pattern TEXT NOT NULL,
        kind TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1
    )",
    "CREATE TABLE IF NOT EXISTS client_groups (
        client_ip TEXT NOT NULL,
        group_name TEXT NOT NULL,
        PRIMARY KEY (client_ip, group_name)
    )",
    "CREATE TABLE IF NOT EXISTS client_settings (
        client_ip TEXT PRIMARY KEY,
        blocking_enabled INTEGER NOT NULL DEFAULT 1
    )",
    "CREATE TABLE IF NOT EXISTS group_settings (
        group_name TEXT PRIMARY KEY,
        blocking_enabled INTEGER NOT NULL DEFAULT 1
    )",
    "CREATE TABLE IF NOT EXISTS rate_windows (
        client_ip TEXT PRIMARY KEY,
        window_start INTEGER NOT NULL,
        count INTEGER NOT NULL
    )",
];
