//! RFC 2136 dynamic updates, gated by RFC 8945 TSIG. The update section is
//! parsed in full before anything is touched; changes and the serial bump
//! land in one transaction so a half-applied zone can't exist.

use crate::config::ConfigFile;
use crate::db;
use crate::db::zone::RecordChange;
use crate::enums::{OpCode, PacketType, Rcode, RecordType, TsigAlgorithm};
use crate::error::HoldfastError;
use crate::message::Message;
use crate::name::name_as_bytes;
use crate::reply::Reply;
use crate::resourcerecord::InternalResourceRecord;
use crate::Header;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use log::{info, warn};
use sha1::Sha1;
use sha2::{Sha256, Sha384, Sha512};
use sqlx::SqlitePool;
use std::net::IpAddr;

/// The parsed TSIG rdata fields (RFC 8945 section 4.2).
#[derive(Debug, Clone)]
pub struct TsigData {
    pub key_name: String,
    pub algorithm_name: String,
    /// 48-bit unix seconds
    pub time_signed: u64,
    pub fudge: u16,
    pub mac: Vec<u8>,
    pub original_id: u16,
    pub error: u16,
    pub other: Vec<u8>,
}

/// Pull the TSIG fields out of the final additional record.
pub fn parse_tsig(rr: &crate::ResourceRecord) -> Result<TsigData, HoldfastError> {
    let rdata = &rr.rdata;
    let short = || HoldfastError::MalformedMessage("short TSIG rdata".to_string());

    // algorithm name is an uncompressed domain name at the front
    let mut pos = 0usize;
    let mut algorithm_labels: Vec<String> = vec![];
    loop {
        let len = *rdata.get(pos).ok_or_else(short)? as usize;
        if len == 0 {
            pos += 1;
            break;
        }
        let label = rdata.get(pos + 1..pos + 1 + len).ok_or_else(short)?;
        algorithm_labels.push(String::from_utf8_lossy(label).to_string());
        pos += 1 + len;
    }
    let algorithm_name = algorithm_labels.join(".").to_lowercase();

    let fixed = rdata.get(pos..pos + 10).ok_or_else(short)?;
    let time_signed = u64::from_be_bytes([0, 0, fixed[0], fixed[1], fixed[2], fixed[3], fixed[4], fixed[5]]);
    let fudge = u16::from_be_bytes([fixed[6], fixed[7]]);
    let mac_size = u16::from_be_bytes([fixed[8], fixed[9]]) as usize;
    pos += 10;
    let mac = rdata.get(pos..pos + mac_size).ok_or_else(short)?.to_vec();
    pos += mac_size;
    let tail = rdata.get(pos..pos + 6).ok_or_else(short)?;
    let original_id = u16::from_be_bytes([tail[0], tail[1]]);
    let error = u16::from_be_bytes([tail[2], tail[3]]);
    let other_len = u16::from_be_bytes([tail[4], tail[5]]) as usize;
    pos += 6;
    let other = rdata.get(pos..pos + other_len).ok_or_else(short)?.to_vec();

    Ok(TsigData {
        key_name: rr.name.clone(),
        algorithm_name,
        time_signed,
        fudge,
        mac,
        original_id,
        error,
        other,
    })
}

/// The bytes the MAC covers: the message as it was before the TSIG record
/// was appended (arcount wound back, original id restored), then the TSIG
/// variables.
pub fn tsig_mac_input(raw: &[u8], tsig_offset: usize, tsig: &TsigData) -> Vec<u8> {
    let mut message = raw[..tsig_offset].to_vec();
    message[0..2].copy_from_slice(&tsig.original_id.to_be_bytes());
    let arcount = u16::from_be_bytes([raw[10], raw[11]]).saturating_sub(1);
    message[10..12].copy_from_slice(&arcount.to_be_bytes());

    // TSIG variables per RFC 8945 4.3.3
    message.extend(name_as_bytes(&tsig.key_name.to_lowercase(), None));
    message.extend(255u16.to_be_bytes()); // class ANY
    message.extend(0u32.to_be_bytes()); // ttl
    message.extend(name_as_bytes(&tsig.algorithm_name, None));
    message.extend(&tsig.time_signed.to_be_bytes()[2..8]);
    message.extend(tsig.fudge.to_be_bytes());
    message.extend(tsig.error.to_be_bytes());
    message.extend((tsig.other.len() as u16).to_be_bytes());
    message.extend(&tsig.other);
    message
}

pub fn compute_mac(
    algorithm: TsigAlgorithm,
    secret: &[u8],
    data: &[u8],
) -> Result<Vec<u8>, HoldfastError> {
    fn digest<D>(secret: &[u8], data: &[u8]) -> Result<Vec<u8>, HoldfastError>
    where
        D: Mac + hmac::digest::KeyInit,
    {
        let mut mac = <D as hmac::digest::KeyInit>::new_from_slice(secret)
            .map_err(|e| HoldfastError::TsigInvalid(format!("bad key length: {e}")))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }
    match algorithm {
        TsigAlgorithm::HmacSha1 => digest::<Hmac<Sha1>>(secret, data),
        TsigAlgorithm::HmacSha256 => digest::<Hmac<Sha256>>(secret, data),
        TsigAlgorithm::HmacSha384 => digest::<Hmac<Sha384>>(secret, data),
        TsigAlgorithm::HmacSha512 => digest::<Hmac<Sha512>>(secret, data),
    }
}

/// Constant-time comparison via the Mac verifier itself.
fn verify_mac(algorithm: TsigAlgorithm, secret: &[u8], data: &[u8], expected: &[u8]) -> bool {
    fn check<D>(secret: &[u8], data: &[u8], expected: &[u8]) -> bool
    where
        D: Mac + hmac::digest::KeyInit,
    {
        let Ok(mut mac) = <D as hmac::digest::KeyInit>::new_from_slice(secret) else {
            return false;
        };
        mac.update(data);
        mac.verify_slice(expected).is_ok()
    }
    match algorithm {
        TsigAlgorithm::HmacSha1 => check::<Hmac<Sha1>>(secret, data, expected),
        TsigAlgorithm::HmacSha256 => check::<Hmac<Sha256>>(secret, data, expected),
        TsigAlgorithm::HmacSha384 => check::<Hmac<Sha384>>(secret, data, expected),
        TsigAlgorithm::HmacSha512 => check::<Hmac<Sha512>>(secret, data, expected),
    }
}

fn update_reply(id: u16, rcode: Rcode) -> Result<Vec<u8>, HoldfastError> {
    let mut reply = Reply {
        header: Header {
            id,
            qr: PacketType::Answer,
            opcode: OpCode::Update,
            rcode,
            ..Default::default()
        },
        question: None,
        answers: vec![],
        authorities: vec![],
        additionals: vec![],
    };
    reply.as_bytes()
}

/// Handle one OPCODE=5 message, returning the encoded response. The zone is
/// only mutated when the TSIG checks out and the whole update section parses.
pub async fn process_update(
    pool: &SqlitePool,
    config: &ConfigFile,
    raw: &[u8],
    client_ip: IpAddr,
    now: i64,
) -> Result<Vec<u8>, HoldfastError> {
    let header = Header::from_bytes(raw)?;

    if !config.ddns_enabled {
        return update_reply(header.id, Rcode::Refused);
    }
    if !config.ddns_allowed_nets.is_empty()
        && !config.ddns_allowed_nets.iter().any(|net| net.contains(&client_ip))
    {
        warn!("refusing update from {client_ip}: not in any allowed network");
        return update_reply(header.id, Rcode::Refused);
    }

    let message = match Message::parse(raw) {
        Ok(message) => message,
        Err(_) => return update_reply(header.id, Rcode::FormatError),
    };

    // the zone section names exactly one target zone
    let Some(zone_section) = message.question() else {
        return update_reply(header.id, Rcode::FormatError);
    };
    let Some(zone) = db::zone::get_zone_by_name(pool, &zone_section.qname).await? else {
        return update_reply(header.id, Rcode::NotZone);
    };
    let zone_id = zone
        .id
        .ok_or_else(|| HoldfastError::InternalError("zone has no id".to_string()))?;

    // TSIG is always the last record of the additional section
    let Some(tsig_offset) = message.tsig_offset else {
        warn!("refusing unsigned update for {}", zone.name);
        return update_reply(header.id, Rcode::Refused);
    };
    let Some(tsig_rr) = message
        .additionals
        .iter()
        .rev()
        .find(|rr| rr.record_type == RecordType::TSIG)
    else {
        return update_reply(header.id, Rcode::FormatError);
    };
    let tsig = match parse_tsig(tsig_rr) {
        Ok(tsig) => tsig,
        Err(_) => return update_reply(header.id, Rcode::FormatError),
    };

    let Some(algorithm) = TsigAlgorithm::from_name(&tsig.algorithm_name) else {
        warn!(
            "update for {} signed with unacceptable algorithm {:?}",
            zone.name, tsig.algorithm_name
        );
        return update_reply(header.id, Rcode::NotAuth);
    };
    if algorithm == TsigAlgorithm::HmacSha1 {
        warn!("update for {} uses hmac-sha1, accepting reluctantly", zone.name);
    }

    let Some(key) = db::tsigkey::get_by_name(pool, &tsig.key_name).await? else {
        warn!("update signed with unknown key {:?}", tsig.key_name);
        return update_reply(header.id, Rcode::NotAuth);
    };
    let secret = BASE64
        .decode(&key.secret)
        .map_err(|e| HoldfastError::TsigInvalid(format!("stored secret isn't base64: {e}")))?;

    let mac_input = tsig_mac_input(raw, tsig_offset, &tsig);
    if !verify_mac(algorithm, &secret, &mac_input, &tsig.mac) {
        warn!("bad TSIG mac on update for {} with key {}", zone.name, key.name);
        return update_reply(header.id, Rcode::NotAuth);
    }

    // signed-time must sit within the fudge window
    if (now - tsig.time_signed as i64).unsigned_abs() > tsig.fudge as u64 {
        warn!(
            "TSIG time {} outside fudge {} of {now} on update for {}",
            tsig.time_signed, tsig.fudge, zone.name
        );
        return update_reply(header.id, Rcode::NotAuth);
    }

    // the update section rides in the authority slots; parse everything
    // before touching anything
    let mut changes: Vec<RecordChange> = vec![];
    for rr in &message.authorities {
        if !zone.covers(&rr.name) {
            return update_reply(header.id, Rcode::NotZone);
        }
        if !rr.record_type.supported() {
            return update_reply(header.id, Rcode::FormatError);
        }
        let typed = match InternalResourceRecord::from_wire(rr.record_type, rr.ttl, &rr.rdata) {
            Ok(typed) => typed,
            Err(_) => return update_reply(header.id, Rcode::FormatError),
        };
        changes.push(RecordChange {
            name: zone.relative_owner(&rr.name),
            rrtype: rr.record_type.to_string(),
            ttl: rr.ttl,
            rdata: typed.to_string(),
        });
    }

    let new_serial = db::zone::apply_update(pool, zone_id, &changes).await?;
    info!(
        "applied {} change(s) to {} from {client_ip} with key {}, serial {new_serial}",
        changes.len(),
        zone.name,
        key.name
    );

    update_reply(header.id, Rcode::NoError)
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::enums::RecordClass;
    use crate::{Question, ResourceRecord};

    /// Build a signed UPDATE adding `updates` to `zone_name`.
    pub(crate) fn build_signed_update(
        id: u16,
        zone_name: &str,
        updates: &[(&str, RecordType, u32, Vec<u8>)],
        key_name: &str,
        algorithm: &str,
        secret: &[u8],
        time_signed: u64,
    ) -> Vec<u8> {
        let mut reply = Reply {
            header: Header {
                id,
                qr: PacketType::Query,
                opcode: OpCode::Update,
                ..Default::default()
            },
            question: Some(Question {
                qname: zone_name.to_string(),
                qtype: RecordType::SOA,
                qclass: RecordClass::Internet,
            }),
            answers: vec![],
            authorities: updates
                .iter()
                .map(|(name, rrtype, ttl, rdata)| ResourceRecord {
                    name: name.to_string(),
                    record_type: *rrtype,
                    class: RecordClass::Internet,
                    ttl: *ttl,
                    rdata: rdata.clone(),
                })
                .collect(),
            additionals: vec![],
        };
        let mut bytes = reply.as_bytes().expect("encode update");

        let tsig = TsigData {
            key_name: key_name.to_string(),
            algorithm_name: algorithm.to_string(),
            time_signed,
            fudge: 300,
            mac: vec![],
            original_id: id,
            error: 0,
            other: vec![],
        };
        let mac_input = tsig_mac_input(&bytes, bytes.len(), &tsig);
        // unknown algorithm names still get a (sha256) mac so the message is
        // well-formed; the server refuses them before verification anyway
        let mac = compute_mac(
            TsigAlgorithm::from_name(algorithm).unwrap_or(TsigAlgorithm::HmacSha256),
            secret,
            &mac_input,
        )
        .expect("mac");

        // TSIG rdata: algorithm, time48, fudge, mac, original id, error, other
        let mut rdata = name_as_bytes(algorithm, None);
        rdata.extend(&time_signed.to_be_bytes()[2..8]);
        rdata.extend(300u16.to_be_bytes());
        rdata.extend((mac.len() as u16).to_be_bytes());
        rdata.extend(&mac);
        rdata.extend(id.to_be_bytes());
        rdata.extend(0u16.to_be_bytes());
        rdata.extend(0u16.to_be_bytes());

        // append the TSIG record and wind the arcount forward
        bytes.extend(name_as_bytes(key_name, None));
        bytes.extend((RecordType::TSIG as u16).to_be_bytes());
        bytes.extend(255u16.to_be_bytes());
        bytes.extend(0u32.to_be_bytes());
        bytes.extend((rdata.len() as u16).to_be_bytes());
        bytes.extend(&rdata);
        let arcount = u16::from_be_bytes([bytes[10], bytes[11]]) + 1;
        bytes[10..12].copy_from_slice(&arcount.to_be_bytes());
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::build_signed_update;
    use super::*;
    use crate::db::test_conn;
    use crate::zones::{FileZone, TsigKey};

    const NOW: i64 = 1_718_000_000;
    const SECRET: &[u8] = b"a very shared secret";

    async fn seed(pool: &SqlitePool) -> FileZone {
        let mut zone = FileZone {
            name: "mydomain.test".to_string(),
            mname: "ns1.mydomain.test".to_string(),
            serial: 100,
            ..Default::default()
        };
        let id = db::zone::create_zone(pool, &zone).await.expect("zone");
        zone.id = Some(id);
        db::tsigkey::create(
            pool,
            &TsigKey {
                id: None,
                name: "update-key".to_string(),
                algorithm: "hmac-sha256".to_string(),
                secret: BASE64.encode(SECRET),
            },
        )
        .await
        .expect("tsig key");
        zone
    }

    fn ddns_config() -> ConfigFile {
        ConfigFile {
            ddns_enabled: true,
            ..Default::default()
        }
    }

    fn client() -> IpAddr {
        "192.0.2.10".parse().expect("ip")
    }

    #[tokio::test]
    async fn test_signed_update_applies_and_bumps_serial() {
        let pool = test_conn().await;
        let zone = seed(&pool).await;
        let update = build_signed_update(
            0x1111,
            "mydomain.test",
            &[("bar.mydomain.test", RecordType::A, 300, vec![10, 0, 0, 2])],
            "update-key",
            "hmac-sha256",
            SECRET,
            NOW as u64,
        );
        let response = process_update(&pool, &ddns_config(), &update, client(), NOW)
            .await
            .expect("process");
        let header = Header::from_bytes(&response).expect("header");
        assert_eq!(header.rcode, Rcode::NoError);
        assert_eq!(header.id, 0x1111);

        let after = db::zone::get_zone_by_name(&pool, "mydomain.test")
            .await
            .expect("zone")
            .expect("zone row");
        assert_eq!(after.serial, zone.serial + 1);
        let records = db::zone::get_records_for_owner(&pool, zone.id.expect("id"), "bar", Some("A"))
            .await
            .expect("records");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].rdata, "10.0.0.2");
    }

    #[tokio::test]
    async fn test_same_update_twice_is_idempotent_but_serial_moves() {
        let pool = test_conn().await;
        let zone = seed(&pool).await;
        let update = build_signed_update(
            0x2222,
            "mydomain.test",
            &[("bar.mydomain.test", RecordType::A, 300, vec![10, 0, 0, 2])],
            "update-key",
            "hmac-sha256",
            SECRET,
            NOW as u64,
        );
        process_update(&pool, &ddns_config(), &update, client(), NOW)
            .await
            .expect("first");
        process_update(&pool, &ddns_config(), &update, client(), NOW)
            .await
            .expect("second");

        let after = db::zone::get_zone_by_name(&pool, "mydomain.test")
            .await
            .expect("zone")
            .expect("zone row");
        assert_eq!(after.serial, zone.serial + 2);
        let records = db::zone::get_records_for_owner(&pool, zone.id.expect("id"), "bar", Some("A"))
            .await
            .expect("records");
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_bad_mac_is_notauth_and_leaves_zone_alone() {
        let pool = test_conn().await;
        let zone = seed(&pool).await;
        let update = build_signed_update(
            0x3333,
            "mydomain.test",
            &[("bar.mydomain.test", RecordType::A, 300, vec![10, 0, 0, 2])],
            "update-key",
            "hmac-sha256",
            b"the wrong secret entirely",
            NOW as u64,
        );
        let response = process_update(&pool, &ddns_config(), &update, client(), NOW)
            .await
            .expect("process");
        assert_eq!(Header::from_bytes(&response).expect("header").rcode, Rcode::NotAuth);

        let after = db::zone::get_zone_by_name(&pool, "mydomain.test")
            .await
            .expect("zone")
            .expect("zone row");
        assert_eq!(after.serial, zone.serial);
    }

    #[tokio::test]
    async fn test_unknown_key_is_notauth() {
        let pool = test_conn().await;
        seed(&pool).await;
        let update = build_signed_update(
            4,
            "mydomain.test",
            &[("bar.mydomain.test", RecordType::A, 300, vec![10, 0, 0, 2])],
            "who-is-this",
            "hmac-sha256",
            SECRET,
            NOW as u64,
        );
        let response = process_update(&pool, &ddns_config(), &update, client(), NOW)
            .await
            .expect("process");
        assert_eq!(Header::from_bytes(&response).expect("header").rcode, Rcode::NotAuth);
    }

    #[tokio::test]
    async fn test_md5_is_rejected() {
        let pool = test_conn().await;
        seed(&pool).await;
        let update = build_signed_update(
            5,
            "mydomain.test",
            &[("bar.mydomain.test", RecordType::A, 300, vec![10, 0, 0, 2])],
            "update-key",
            "hmac-md5.sig-alg.reg.int",
            SECRET,
            NOW as u64,
        );
        let response = process_update(&pool, &ddns_config(), &update, client(), NOW)
            .await
            .expect("process");
        assert_eq!(Header::from_bytes(&response).expect("header").rcode, Rcode::NotAuth);
    }

    #[tokio::test]
    async fn test_time_outside_fudge_is_notauth() {
        let pool = test_conn().await;
        seed(&pool).await;
        let update = build_signed_update(
            6,
            "mydomain.test",
            &[("bar.mydomain.test", RecordType::A, 300, vec![10, 0, 0, 2])],
            "update-key",
            "hmac-sha256",
            SECRET,
            (NOW - 4000) as u64,
        );
        let response = process_update(&pool, &ddns_config(), &update, client(), NOW)
            .await
            .expect("process");
        assert_eq!(Header::from_bytes(&response).expect("header").rcode, Rcode::NotAuth);
    }

    #[tokio::test]
    async fn test_unknown_zone_is_notzone() {
        let pool = test_conn().await;
        seed(&pool).await;
        let update = build_signed_update(
            7,
            "otherdomain.test",
            &[("bar.otherdomain.test", RecordType::A, 300, vec![10, 0, 0, 2])],
            "update-key",
            "hmac-sha256",
            SECRET,
            NOW as u64,
        );
        let response = process_update(&pool, &ddns_config(), &update, client(), NOW)
            .await
            .expect("process");
        assert_eq!(Header::from_bytes(&response).expect("header").rcode, Rcode::NotZone);
    }

    #[tokio::test]
    async fn test_ddns_disabled_is_refused() {
        let pool = test_conn().await;
        seed(&pool).await;
        let update = build_signed_update(
            8,
            "mydomain.test",
            &[("bar.mydomain.test", RecordType::A, 300, vec![10, 0, 0, 2])],
            "update-key",
            "hmac-sha256",
            SECRET,
            NOW as u64,
        );
        let config = ConfigFile::default();
        let response = process_update(&pool, &config, &update, client(), NOW)
            .await
            .expect("process");
        assert_eq!(Header::from_bytes(&response).expect("header").rcode, Rcode::Refused);
    }

    #[tokio::test]
    async fn test_acl_refuses_outside_networks() {
        let pool = test_conn().await;
        seed(&pool).await;
        let update = build_signed_update(
            9,
            "mydomain.test",
            &[("bar.mydomain.test", RecordType::A, 300, vec![10, 0, 0, 2])],
            "update-key",
            "hmac-sha256",
            SECRET,
            NOW as u64,
        );
        let mut config = ddns_config();
        config.ddns_allowed_nets = vec!["10.0.0.0/8".parse().expect("net")];
        let response = process_update(&pool, &config, &update, client(), NOW)
            .await
            .expect("process");
        assert_eq!(Header::from_bytes(&response).expect("header").rcode, Rcode::Refused);
    }

    #[tokio::test]
    async fn test_garbage_update_section_is_formerr_without_mutation() {
        let pool = test_conn().await;
        let zone = seed(&pool).await;
        // an A record with 3-byte rdata can't be decoded
        let update = build_signed_update(
            10,
            "mydomain.test",
            &[
                ("ok.mydomain.test", RecordType::A, 300, vec![10, 0, 0, 3]),
                ("broken.mydomain.test", RecordType::A, 300, vec![1, 2, 3]),
            ],
            "update-key",
            "hmac-sha256",
            SECRET,
            NOW as u64,
        );
        let response = process_update(&pool, &ddns_config(), &update, client(), NOW)
            .await
            .expect("process");
        assert_eq!(
            Header::from_bytes(&response).expect("header").rcode,
            Rcode::FormatError
        );
        // nothing landed, not even the well-formed record
        let after = db::zone::get_zone_by_name(&pool, "mydomain.test")
            .await
            .expect("zone")
            .expect("zone row");
        assert_eq!(after.serial, zone.serial);
        let records = db::zone::get_records_for_owner(&pool, zone.id.expect("id"), "ok", Some("A"))
            .await
            .expect("records");
        assert!(records.is_empty());
    }
}
