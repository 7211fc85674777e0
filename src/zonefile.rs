//! JSON5 zone files: the offline way in and out of zone storage. Importing
//! a zone replaces it wholesale; records that don't parse are skipped with
//! a warning rather than sinking the whole file.

use crate::db;
use crate::error::HoldfastError;
use crate::resourcerecord::InternalResourceRecord;
use crate::zones::{FileZone, FileZoneRecord};
use log::{info, warn};
use sqlx::SqlitePool;
use std::fs::File;
use std::io::Read;

/// Read a zone file from disk. The format is a JSON5 array of zones, each
/// carrying its SOA fields and records.
pub fn load_zone_file(filename: &str) -> Result<Vec<FileZone>, HoldfastError> {
    let path = shellexpand::tilde(filename).into_owned();
    let mut file = File::open(&path)?;
    let mut buf = String::new();
    file.read_to_string(&mut buf)?;
    let zones: Vec<FileZone> = json5::from_str(&buf)
        .map_err(|e| HoldfastError::InvalidValue(format!("failed to parse zone file {path}: {e}")))?;
    Ok(zones)
}

/// Does this record parse well enough to serve?
fn validate_record(record: &FileZoneRecord) -> Result<(), HoldfastError> {
    let _: InternalResourceRecord = record.clone().try_into()?;
    Ok(())
}

/// Import one zone, replacing any existing zone of the same name. Returns
/// how many records landed.
pub async fn import_zone(pool: &SqlitePool, zone: &FileZone) -> Result<usize, HoldfastError> {
    if let Some(existing) = db::zone::get_zone_by_name(pool, &zone.name.to_lowercase()).await? {
        if let Some(id) = existing.id {
            warn!("replacing existing zone {} on import", zone.name);
            db::zone::delete_zone(pool, id).await?;
        }
    }
    let zone_id = db::zone::create_zone(pool, zone).await?;

    let mut imported = 0usize;
    for record in &zone.records {
        if let Err(err) = validate_record(record) {
            warn!("skipping record {record} in {}: {err}", zone.name);
            continue;
        }
        let mut record = record.clone();
        record.zoneid = Some(zone_id);
        db::zone::create_record(pool, &record).await?;
        imported += 1;
    }
    info!("imported zone {} with {imported} records", zone.name);
    Ok(imported)
}

/// Import every zone in a file, optionally narrowed to one zone name.
pub async fn import_zone_file(
    pool: &SqlitePool,
    filename: &str,
    only_zone: Option<&str>,
) -> Result<usize, HoldfastError> {
    let zones = load_zone_file(filename)?;
    let mut total = 0usize;
    for zone in zones {
        if only_zone.is_some_and(|name| name != zone.name) {
            continue;
        }
        total += import_zone(pool, &zone).await?;
    }
    Ok(total)
}

/// A zone with its records as pretty JSON, for export tooling.
pub fn export_zone_json(zone: &FileZone) -> Result<String, HoldfastError> {
    serde_json::to_string_pretty(zone)
        .map_err(|e| HoldfastError::InternalError(format!("failed to serialize zone: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_conn;
    use std::io::Write;

    const ZONE_FILE: &str = r#"[
        {
            name: "mydomain.test",
            mname: "ns1.mydomain.test",
            rname: "hostmaster.mydomain.test",
            serial: 1,
            records: [
                { name: "@", rrtype: "A", rdata: "10.0.0.1", ttl: 300 },
                { name: "www", rrtype: "CNAME", rdata: "mydomain.test", ttl: 300 },
                { name: "mail", rrtype: "MX", rdata: "mx.mydomain.test", ttl: 300, priority: 10 },
                { name: "broken", rrtype: "A", rdata: "not-an-address", ttl: 300 },
            ],
        },
    ]"#;

    #[tokio::test]
    async fn test_import_skips_invalid_records() {
        let pool = test_conn().await;
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(ZONE_FILE.as_bytes()).expect("write");

        let imported = import_zone_file(
            &pool,
            file.path().to_str().expect("path"),
            None,
        )
        .await
        .expect("import");
        // the unparseable A record is dropped
        assert_eq!(imported, 3);

        let zone = db::zone::get_zone_by_name(&pool, "mydomain.test")
            .await
            .expect("lookup")
            .expect("zone");
        let records = db::zone::get_records_by_zone(&pool, zone.id.expect("id"))
            .await
            .expect("records");
        assert_eq!(records.len(), 3);
    }

    #[tokio::test]
    async fn test_reimport_replaces_zone() {
        let pool = test_conn().await;
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(ZONE_FILE.as_bytes()).expect("write");

        import_zone_file(&pool, file.path().to_str().expect("path"), None)
            .await
            .expect("first import");
        import_zone_file(&pool, file.path().to_str().expect("path"), None)
            .await
            .expect("second import");

        let zone = db::zone::get_zone_by_name(&pool, "mydomain.test")
            .await
            .expect("lookup")
            .expect("zone");
        let records = db::zone::get_records_by_zone(&pool, zone.id.expect("id"))
            .await
            .expect("records");
        // not doubled
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn test_export_round_trips_through_serde() {
        let zone = FileZone {
            name: "mydomain.test".to_string(),
            serial: 9,
            records: vec![FileZoneRecord {
                id: None,
                zoneid: None,
                name: "@".to_string(),
                rrtype: "A".to_string(),
                rdata: "10.0.0.1".to_string(),
                ttl: 300,
                priority: None,
            }],
            ..Default::default()
        };
        let json = export_zone_json(&zone).expect("export");
        let back: FileZone = serde_json::from_str(&json).expect("reimport");
        assert_eq!(back.name, zone.name);
        assert_eq!(back.records.len(), 1);
    }
}
