//! Cross-module scenarios that don't belong to any single component:
//! a signed update becoming servable, and wire-boundary checks.

use crate::cache::QueryCache;
use crate::config::ConfigFile;
use crate::datastore;
use crate::db::test_conn;
use crate::ddns::testutil::build_signed_update;
use crate::enums::{Rcode, RecordClass, RecordType};
use crate::filter::FilterEngine;
use crate::message::Message;
use crate::metrics::Metrics;
use crate::pipeline::{QueryPipeline, QueryProtocol};
use crate::ratelimit::RateLimiter;
use crate::reply::Reply;
use crate::upstream::UpstreamManager;
use crate::zones::{FileZone, TsigKey};
use crate::{db, Header, Question};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sqlx::SqlitePool;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

const SECRET: &[u8] = b"a very shared secret";

async fn pipeline_over(pool: SqlitePool, mut config: ConfigFile) -> Arc<QueryPipeline> {
    config.upstreams = vec![];
    let (tx, rx) = mpsc::channel(datastore::LOG_QUEUE_DEPTH);
    tokio::spawn(datastore::manager(rx, pool.clone()));
    Arc::new(QueryPipeline::new(
        config.clone(),
        pool.clone(),
        tx,
        Arc::new(FilterEngine::default()),
        Arc::new(QueryCache::new(pool.clone(), config.cache.clone())),
        Arc::new(UpstreamManager::from_config(&config).expect("upstreams")),
        Arc::new(RateLimiter::new(pool, config.rate_limit.clone())),
        Arc::new(Metrics::new(0)),
    ))
}

fn query(id: u16, qname: &str, qtype: RecordType) -> Vec<u8> {
    let mut reply = Reply {
        header: Header {
            id,
            recursion_desired: true,
            ..Default::default()
        },
        question: Some(Question {
            qname: qname.to_string(),
            qtype,
            qclass: RecordClass::Internet,
        }),
        answers: vec![],
        authorities: vec![],
        additionals: vec![],
    };
    reply.as_bytes().expect("encode query")
}

fn client() -> SocketAddr {
    "192.0.2.10:53000".parse().expect("addr")
}

/// A TSIG-signed update lands, bumps the serial, and the new record is
/// immediately servable through the normal query path.
#[tokio::test]
async fn test_update_then_query_round_trip() {
    let pool = test_conn().await;
    db::zone::create_zone(
        &pool,
        &FileZone {
            name: "mydomain.test".to_string(),
            mname: "ns1.mydomain.test".to_string(),
            serial: 7,
            ..Default::default()
        },
    )
    .await
    .expect("zone");
    db::tsigkey::create(
        &pool,
        &TsigKey {
            id: None,
            name: "update-key".to_string(),
            algorithm: "hmac-sha256".to_string(),
            secret: BASE64.encode(SECRET),
        },
    )
    .await
    .expect("tsig key");

    let mut config = ConfigFile::default();
    config.ddns_enabled = true;
    let pipeline = pipeline_over(pool.clone(), config).await;

    let now = chrono::Utc::now().timestamp();
    let update = build_signed_update(
        0xD0D0,
        "mydomain.test",
        &[("bar.mydomain.test", RecordType::A, 300, vec![10, 0, 0, 2])],
        "update-key",
        "hmac-sha256",
        SECRET,
        now as u64,
    );
    let response = pipeline
        .handle_query(&update, client(), QueryProtocol::Tcp)
        .await
        .expect("update");
    assert_eq!(
        Header::from_bytes(&response).expect("header").rcode,
        Rcode::NoError
    );

    let zone = db::zone::get_zone_by_name(&pool, "mydomain.test")
        .await
        .expect("lookup")
        .expect("zone");
    assert_eq!(zone.serial, 8);

    let answer = pipeline
        .handle_query(
            &query(0x0B0B, "bar.mydomain.test", RecordType::A),
            client(),
            QueryProtocol::Udp,
        )
        .await
        .expect("query");
    let message = Message::parse(&answer).expect("parse");
    assert_eq!(message.header.rcode, Rcode::NoError);
    assert_eq!(message.answers.len(), 1);
    assert_eq!(message.answers[0].rdata, vec![10, 0, 0, 2]);
}

/// A 512-octet UDP message parses and gets an answer; the padding rides in
/// an EDNS OPT record.
#[tokio::test]
async fn test_512_octet_query_accepted() {
    let pool = test_conn().await;
    let mut config = ConfigFile::default();
    config
        .local_hosts
        .insert("printer.lan".to_string(), "192.168.1.9".to_string());
    let pipeline = pipeline_over(pool, config).await;

    let mut bytes = query(0x200, "printer.lan", RecordType::A);
    // OPT with enough padding rdata to land on exactly 512 octets
    let base = bytes.len() + 11; // root + type + class + ttl + rdlen
    let padding = 512 - base;
    bytes[11] = 1; // arcount
    bytes.push(0);
    bytes.extend((RecordType::OPT as u16).to_be_bytes());
    bytes.extend(4096u16.to_be_bytes());
    bytes.extend(0u32.to_be_bytes());
    bytes.extend((padding as u16).to_be_bytes());
    bytes.extend(vec![0u8; padding]);
    assert_eq!(bytes.len(), 512);

    let response = pipeline
        .handle_query(&bytes, client(), QueryProtocol::Udp)
        .await
        .expect("handle");
    let message = Message::parse(&response).expect("parse");
    assert_eq!(message.header.rcode, Rcode::NoError);
    assert_eq!(message.answers[0].rdata, vec![192, 168, 1, 9]);
}

/// Every response carries the id the query came in with.
#[tokio::test]
async fn test_response_id_matches_query() {
    let pool = test_conn().await;
    let mut config = ConfigFile::default();
    config
        .local_hosts
        .insert("printer.lan".to_string(), "192.168.1.9".to_string());
    let pipeline = pipeline_over(pool, config).await;

    for id in [0u16, 1, 0x8000, 0xFFFF] {
        let response = pipeline
            .handle_query(
                &query(id, "printer.lan", RecordType::A),
                client(),
                QueryProtocol::Udp,
            )
            .await
            .expect("handle");
        assert_eq!(u16::from_be_bytes([response[0], response[1]]), id);
    }
}
