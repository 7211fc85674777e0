//! Zone, record and key storage. Zones, their records and their signing keys
//! are three flat tables tied together by zone id; nothing here holds
//! references to anything else in memory.

use crate::error::HoldfastError;
use crate::zones::{FileZone, FileZoneRecord, ZoneKey};
use log::debug;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

/// Longest-suffix zone match: `foo.bar.example.com` finds `example.com` if
/// no closer zone exists. Candidate suffixes are generated label by label so
/// the lookup stays indexed.
pub async fn find_zone_for_domain(
    pool: &SqlitePool,
    name: &str,
) -> Result<Option<FileZone>, HoldfastError> {
    let mut candidate = name;
    loop {
        if let Some(zone) = get_zone_by_name(pool, candidate).await? {
            return Ok(Some(zone));
        }
        match candidate.split_once('.') {
            Some((_, rest)) if !rest.is_empty() => candidate = rest,
            _ => return Ok(None),
        }
    }
}

pub async fn get_zone_by_name(
    pool: &SqlitePool,
    name: &str,
) -> Result<Option<FileZone>, HoldfastError> {
    let row = sqlx::query(
        "SELECT id, name, mname, rname, serial, refresh, retry, expire, minimum
         FROM zones WHERE name = ?",
    )
    .bind(name)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| FileZone {
        id: Some(r.get::<i64, _>("id")),
        name: r.get("name"),
        mname: r.get("mname"),
        rname: r.get("rname"),
        serial: r.get::<u32, _>("serial"),
        refresh: r.get::<u32, _>("refresh"),
        retry: r.get::<u32, _>("retry"),
        expire: r.get::<u32, _>("expire"),
        minimum: r.get::<u32, _>("minimum"),
        records: vec![],
    }))
}

pub async fn create_zone(pool: &SqlitePool, zone: &FileZone) -> Result<i64, HoldfastError> {
    let result = sqlx::query(
        "INSERT INTO zones (name, mname, rname, serial, refresh, retry, expire, minimum)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(zone.name.to_lowercase())
    .bind(&zone.mname)
    .bind(&zone.rname)
    .bind(zone.serial)
    .bind(zone.refresh)
    .bind(zone.retry)
    .bind(zone.expire)
    .bind(zone.minimum)
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn delete_zone(pool: &SqlitePool, zone_id: i64) -> Result<(), HoldfastError> {
    sqlx::query("DELETE FROM zone_records WHERE zoneid = ?")
        .bind(zone_id)
        .execute(pool)
        .await?;
    sqlx::query("DELETE FROM zone_keys WHERE zoneid = ?")
        .bind(zone_id)
        .execute(pool)
        .await?;
    sqlx::query("DELETE FROM zones WHERE id = ?")
        .bind(zone_id)
        .execute(pool)
        .await?;
    Ok(())
}

fn record_from_row(r: sqlx::sqlite::SqliteRow) -> FileZoneRecord {
    FileZoneRecord {
        id: Some(r.get::<i64, _>("id")),
        zoneid: Some(r.get::<i64, _>("zoneid")),
        name: r.get("name"),
        rrtype: r.get("rrtype"),
        rdata: r.get("rdata"),
        ttl: r.get::<u32, _>("ttl"),
        priority: r.get::<Option<u16>, _>("priority"),
    }
}

/// All records in a zone, for AXFR and export.
pub async fn get_records_by_zone(
    pool: &SqlitePool,
    zone_id: i64,
) -> Result<Vec<FileZoneRecord>, HoldfastError> {
    let rows = sqlx::query("SELECT * FROM zone_records WHERE zoneid = ? ORDER BY name, rrtype")
        .bind(zone_id)
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(record_from_row).collect())
}

/// Records at one owner. Passing `rrtype = None` returns every type, which
/// the CNAME fallback path leans on.
pub async fn get_records_for_owner(
    pool: &SqlitePool,
    zone_id: i64,
    owner: &str,
    rrtype: Option<&str>,
) -> Result<Vec<FileZoneRecord>, HoldfastError> {
    let rows = sqlx::query(
        "SELECT * FROM zone_records
         WHERE zoneid = ?1 AND name = ?2 AND (?3 IS NULL OR rrtype = ?3)",
    )
    .bind(zone_id)
    .bind(owner)
    .bind(rrtype)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(record_from_row).collect())
}

pub async fn create_record(
    pool: &SqlitePool,
    record: &FileZoneRecord,
) -> Result<i64, HoldfastError> {
    let result = sqlx::query(
        "INSERT INTO zone_records (zoneid, name, rrtype, rdata, ttl, priority)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(record.zoneid)
    .bind(record.name.to_lowercase())
    .bind(&record.rrtype)
    .bind(&record.rdata)
    .bind(record.ttl)
    .bind(record.priority)
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn delete_record(pool: &SqlitePool, record_id: i64) -> Result<(), HoldfastError> {
    sqlx::query("DELETE FROM zone_records WHERE id = ?")
        .bind(record_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// One change out of a dynamic update: replace-or-create semantics on the
/// (owner, type) pair.
#[derive(Debug, Clone)]
pub struct RecordChange {
    pub name: String,
    pub rrtype: String,
    pub ttl: u32,
    pub rdata: String,
}

/// Apply a batch of changes and bump the serial, all inside one transaction.
/// Either everything lands, or the zone is untouched. Returns the new serial.
pub async fn apply_update(
    pool: &SqlitePool,
    zone_id: i64,
    changes: &[RecordChange],
) -> Result<u32, HoldfastError> {
    let mut tx: Transaction<'_, Sqlite> = pool.begin().await?;

    for change in changes {
        let existing = sqlx::query(
            "SELECT id FROM zone_records WHERE zoneid = ? AND name = ? AND rrtype = ?",
        )
        .bind(zone_id)
        .bind(&change.name)
        .bind(&change.rrtype)
        .fetch_optional(&mut *tx)
        .await?;

        match existing {
            Some(row) => {
                sqlx::query("UPDATE zone_records SET rdata = ?, ttl = ? WHERE id = ?")
                    .bind(&change.rdata)
                    .bind(change.ttl)
                    .bind(row.get::<i64, _>("id"))
                    .execute(&mut *tx)
                    .await?;
            }
            None => {
                sqlx::query(
                    "INSERT INTO zone_records (zoneid, name, rrtype, rdata, ttl, priority)
                     VALUES (?, ?, ?, ?, ?, NULL)",
                )
                .bind(zone_id)
                .bind(&change.name)
                .bind(&change.rrtype)
                .bind(&change.rdata)
                .bind(change.ttl)
                .execute(&mut *tx)
                .await?;
            }
        }
    }

    sqlx::query("UPDATE zones SET serial = serial + 1 WHERE id = ?")
        .bind(zone_id)
        .execute(&mut *tx)
        .await?;
    let new_serial = sqlx::query("SELECT serial FROM zones WHERE id = ?")
        .bind(zone_id)
        .fetch_one(&mut *tx)
        .await?
        .get::<u32, _>("serial");

    tx.commit().await?;
    debug!("applied {} changes to zone {zone_id}, serial now {new_serial}", changes.len());
    Ok(new_serial)
}

pub async fn get_keys_by_zone(
    pool: &SqlitePool,
    zone_id: i64,
) -> Result<Vec<ZoneKey>, HoldfastError> {
    let rows = sqlx::query("SELECT * FROM zone_keys WHERE zoneid = ? AND active = 1")
        .bind(zone_id)
        .fetch_all(pool)
        .await?;
    Ok(rows
        .into_iter()
        .map(|r| ZoneKey {
            id: Some(r.get::<i64, _>("id")),
            zoneid: Some(r.get::<i64, _>("zoneid")),
            algorithm: r.get::<u8, _>("algorithm"),
            flags: r.get::<u16, _>("flags"),
            key_tag: r.get::<u16, _>("key_tag"),
            private_key: r.get("private_key"),
            public_key: r.get("public_key"),
            active: r.get("active"),
        })
        .collect())
}

pub async fn create_key(pool: &SqlitePool, key: &ZoneKey) -> Result<i64, HoldfastError> {
    let result = sqlx::query(
        "INSERT INTO zone_keys (zoneid, algorithm, flags, key_tag, private_key, public_key, active)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(key.zoneid)
    .bind(key.algorithm)
    .bind(key.flags)
    .bind(key.key_tag)
    .bind(&key.private_key)
    .bind(&key.public_key)
    .bind(key.active)
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_conn;

    async fn seed_zone(pool: &SqlitePool) -> i64 {
        let zone = FileZone {
            name: "mydomain.test".to_string(),
            mname: "ns1.mydomain.test".to_string(),
            rname: "hostmaster.mydomain.test".to_string(),
            serial: 100,
            ..Default::default()
        };
        let zone_id = create_zone(pool, &zone).await.expect("create zone");
        create_record(
            pool,
            &FileZoneRecord {
                id: None,
                zoneid: Some(zone_id),
                name: "foo".to_string(),
                rrtype: "A".to_string(),
                rdata: "10.0.0.1".to_string(),
                ttl: 300,
                priority: None,
            },
        )
        .await
        .expect("create record");
        zone_id
    }

    #[tokio::test]
    async fn test_longest_suffix_zone_match() {
        let pool = test_conn().await;
        seed_zone(&pool).await;
        let zone = find_zone_for_domain(&pool, "foo.mydomain.test")
            .await
            .expect("lookup")
            .expect("zone");
        assert_eq!(zone.name, "mydomain.test");
        assert!(find_zone_for_domain(&pool, "elsewhere.test")
            .await
            .expect("lookup")
            .is_none());
    }

    #[tokio::test]
    async fn test_apply_update_bumps_serial_once() {
        let pool = test_conn().await;
        let zone_id = seed_zone(&pool).await;
        let changes = vec![
            RecordChange {
                name: "bar".to_string(),
                rrtype: "A".to_string(),
                ttl: 60,
                rdata: "10.0.0.2".to_string(),
            },
            RecordChange {
                name: "foo".to_string(),
                rrtype: "A".to_string(),
                ttl: 120,
                rdata: "10.0.0.9".to_string(),
            },
        ];
        let serial = apply_update(&pool, zone_id, &changes).await.expect("apply");
        assert_eq!(serial, 101);

        // foo was replaced, not duplicated
        let foo = get_records_for_owner(&pool, zone_id, "foo", Some("A"))
            .await
            .expect("records");
        assert_eq!(foo.len(), 1);
        assert_eq!(foo[0].rdata, "10.0.0.9");
        assert_eq!(foo[0].ttl, 120);

        // applying the same update twice bumps the serial twice
        let serial = apply_update(&pool, zone_id, &changes).await.expect("apply");
        assert_eq!(serial, 102);
        let foo = get_records_for_owner(&pool, zone_id, "foo", Some("A"))
            .await
            .expect("records");
        assert_eq!(foo.len(), 1);
    }
}
