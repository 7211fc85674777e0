//! Answering for zones we hold: owner matching, CNAME fallback, NXDOMAIN
//! with the SOA in authority, DNSKEY answers, RRset signing, and the
//! AXFR/IXFR streams the TCP listeners hand out.

use crate::dnssec::{select_signing_key, sign_rrset};
use crate::enums::{PacketType, Rcode, RecordClass, RecordType};
use crate::error::HoldfastError;
use crate::reply::Reply;
use crate::resourcerecord::InternalResourceRecord;
use crate::zones::{FileZone, FileZoneRecord, ZoneKey};
use crate::{db, Header, Question, ResourceRecord};
use log::warn;
use sqlx::SqlitePool;
use std::collections::BTreeMap;

/// Build the authoritative answer for one question against one zone.
pub async fn answer_query(
    pool: &SqlitePool,
    zone: &FileZone,
    question: &Question,
    query_id: u16,
    recursion_available: bool,
    now: i64,
) -> Result<Reply, HoldfastError> {
    let zone_id = zone
        .id
        .ok_or_else(|| HoldfastError::InternalError("zone has no id".to_string()))?;
    let keys = db::zone::get_keys_by_zone(pool, zone_id).await?;

    let mut reply = Reply {
        header: authoritative_header(query_id, recursion_available),
        question: Some(question.clone()),
        answers: vec![],
        authorities: vec![],
        additionals: vec![],
    };

    // DNSKEY queries answer with every active zone key
    if question.qtype == RecordType::DNSKEY {
        for key in &keys {
            let dnskey = key.dnskey(zone.minimum)?;
            reply.answers.push(ResourceRecord {
                name: question.qname.clone(),
                record_type: RecordType::DNSKEY,
                class: RecordClass::Internet,
                ttl: zone.minimum,
                rdata: dnskey.as_bytes()?,
            });
        }
        sign_answers(&mut reply, &keys, zone, now);
        return Ok(reply);
    }

    let owner = zone.relative_owner(&question.qname);

    if question.qtype == RecordType::SOA && owner == "@" {
        reply.answers.push(soa_record(zone)?);
        sign_answers(&mut reply, &keys, zone, now);
        return Ok(reply);
    }

    let records = match question.qtype {
        RecordType::ANY => db::zone::get_records_for_owner(pool, zone_id, &owner, None).await?,
        qtype => {
            let matched =
                db::zone::get_records_for_owner(pool, zone_id, &owner, Some(&qtype.to_string()))
                    .await?;
            match matched.is_empty() {
                // no direct answer: a CNAME at the owner still counts
                true => {
                    db::zone::get_records_for_owner(pool, zone_id, &owner, Some("CNAME")).await?
                }
                false => matched,
            }
        }
    };

    if records.is_empty() {
        reply.header.rcode = Rcode::NameError;
        reply.authorities.push(soa_record(zone)?);
        return Ok(reply);
    }

    for record in records {
        match wire_record(zone, &record) {
            Ok(rr) => reply.answers.push(rr),
            Err(err) => warn!("skipping unservable record {record}: {err}"),
        }
    }
    sign_answers(&mut reply, &keys, zone, now);
    Ok(reply)
}

fn authoritative_header(query_id: u16, recursion_available: bool) -> Header {
    Header {
        id: query_id,
        qr: PacketType::Answer,
        authoritative: true,
        recursion_available,
        ..Default::default()
    }
}

fn soa_record(zone: &FileZone) -> Result<ResourceRecord, HoldfastError> {
    let soa = zone.soa();
    Ok(ResourceRecord {
        name: zone.name.clone(),
        record_type: RecordType::SOA,
        class: RecordClass::Internet,
        ttl: zone.minimum,
        rdata: soa.as_bytes()?,
    })
}

fn wire_record(zone: &FileZone, record: &FileZoneRecord) -> Result<ResourceRecord, HoldfastError> {
    let rrtype = record.record_type();
    let fqdn = zone.fqdn(&record.name);
    let typed: InternalResourceRecord = record.clone().try_into()?;
    Ok(ResourceRecord {
        name: fqdn,
        record_type: rrtype,
        class: RecordClass::Internet,
        ttl: record.ttl,
        rdata: typed.as_bytes()?,
    })
}

/// Sign each answer RRset and append the RRSIGs to the additional section.
/// A zone with no usable key serves unsigned; a key that refuses to sign
/// (eg a stored Ed448 key) logs once and leaves the answers unsigned.
fn sign_answers(reply: &mut Reply, keys: &[ZoneKey], zone: &FileZone, now: i64) {
    let Some(key) = select_signing_key(keys) else {
        return;
    };

    // group answers into RRsets: same owner, same type
    let mut rrsets: BTreeMap<(String, u16), (u32, Vec<Vec<u8>>)> = BTreeMap::new();
    for answer in &reply.answers {
        let entry = rrsets
            .entry((answer.name.clone(), answer.record_type as u16))
            .or_insert((answer.ttl, vec![]));
        entry.1.push(answer.rdata.clone());
    }

    for ((owner, rrtype), (ttl, rdatas)) in rrsets {
        match sign_rrset(
            key,
            &zone.name,
            &owner,
            RecordType::from(rrtype),
            ttl,
            &rdatas,
            now,
        ) {
            Ok(rrsig) => match rrsig.as_bytes() {
                Ok(rdata) => reply.additionals.push(ResourceRecord {
                    name: owner,
                    record_type: RecordType::RRSIG,
                    class: RecordClass::Internet,
                    ttl,
                    rdata,
                }),
                Err(err) => warn!("couldn't encode RRSIG for {owner}: {err}"),
            },
            Err(err) => {
                warn!("zone {} has keys but signing failed: {err}", zone.name);
                return;
            }
        }
    }
}

/// The AXFR sequence: SOA, every record, SOA again, one message per frame.
pub async fn axfr_stream(
    pool: &SqlitePool,
    zone: &FileZone,
    question: &Question,
    query_id: u16,
) -> Result<Vec<Reply>, HoldfastError> {
    let zone_id = zone
        .id
        .ok_or_else(|| HoldfastError::InternalError("zone has no id".to_string()))?;
    let soa = soa_record(zone)?;

    let mut frames = vec![Reply {
        header: authoritative_header(query_id, false),
        question: Some(question.clone()),
        answers: vec![soa.clone()],
        authorities: vec![],
        additionals: vec![],
    }];

    for record in db::zone::get_records_by_zone(pool, zone_id).await? {
        match wire_record(zone, &record) {
            Ok(rr) => frames.push(Reply {
                header: authoritative_header(query_id, false),
                question: None,
                answers: vec![rr],
                authorities: vec![],
                additionals: vec![],
            }),
            Err(err) => warn!("skipping record in transfer of {}: {err}", zone.name),
        }
    }

    frames.push(Reply {
        header: authoritative_header(query_id, false),
        question: None,
        answers: vec![soa],
        authorities: vec![],
        additionals: vec![],
    });
    Ok(frames)
}

/// IXFR: a requested serial older than ours gets the AXFR-equivalent
/// sequence; an up-to-date serial gets just the current SOA.
pub async fn ixfr_stream(
    pool: &SqlitePool,
    zone: &FileZone,
    question: &Question,
    query_id: u16,
    client_serial: Option<u32>,
) -> Result<Vec<Reply>, HoldfastError> {
    match client_serial {
        Some(serial) if serial >= zone.serial => Ok(vec![Reply {
            header: authoritative_header(query_id, false),
            question: Some(question.clone()),
            answers: vec![soa_record(zone)?],
            authorities: vec![],
            additionals: vec![],
        }]),
        _ => axfr_stream(pool, zone, question, query_id).await,
    }
}
