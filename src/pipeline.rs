//! Per-query orchestration. Every listener funnels raw messages through
//! [QueryPipeline::handle_query]; the order of battle is dynamic updates,
//! rate limiting, authoritative zones, the static host map, filtering, the
//! cache, and finally the upstreams with stale cache as the safety net.

use crate::cache::QueryCache;
use crate::config::ConfigFile;
use crate::datastore::Command;
use crate::db;
use crate::db::querylog::QueryLogRow;
use crate::ddns;
use crate::dnssec;
use crate::enums::{OpCode, PacketType, Rcode, RecordClass, RecordType};
use crate::error::HoldfastError;
use crate::filter::FilterEngine;
use crate::message::Message;
use crate::metrics::Metrics;
use crate::ratelimit::RateLimiter;
use crate::reply::{reply_builder, reply_nxdomain, reply_servfail, Reply};
use crate::resourcerecord::InternalResourceRecord;
use crate::upstream::UpstreamManager;
use crate::{Header, Question, ResourceRecord, LOCAL_ANSWER_TTL};
use chrono::Utc;
use log::warn;
use rand::Rng;
use sqlx::SqlitePool;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, instrument};

/// TTL on synthesized block-page answers.
const BLOCK_PAGE_TTL: u32 = 60;
/// Query-log rows older than this get trimmed on the maintenance schedule.
const LOG_RETENTION_SECS: i64 = 7 * 86400;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryProtocol {
    Udp,
    Tcp,
    Dot,
    Doq,
    DoH,
}

impl std::fmt::Display for QueryProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryProtocol::Udp => write!(f, "UDP"),
            QueryProtocol::Tcp => write!(f, "TCP"),
            QueryProtocol::Dot => write!(f, "DoT"),
            QueryProtocol::Doq => write!(f, "DoQ"),
            QueryProtocol::DoH => write!(f, "DoH"),
        }
    }
}

pub struct QueryPipeline {
    pub config: ConfigFile,
    pool: SqlitePool,
    datastore: mpsc::Sender<Command>,
    pub filter: Arc<FilterEngine>,
    pub cache: Arc<QueryCache>,
    pub upstreams: Arc<UpstreamManager>,
    ratelimiter: Arc<RateLimiter>,
    pub metrics: Arc<Metrics>,
}

struct QueryOutcome {
    response: Vec<u8>,
    cached: bool,
    blocked: bool,
    reason: Option<String>,
}

impl QueryOutcome {
    fn plain(response: Vec<u8>) -> Self {
        QueryOutcome {
            response,
            cached: false,
            blocked: false,
            reason: None,
        }
    }
}

impl QueryPipeline {
    pub fn new(
        config: ConfigFile,
        pool: SqlitePool,
        datastore: mpsc::Sender<Command>,
        filter: Arc<FilterEngine>,
        cache: Arc<QueryCache>,
        upstreams: Arc<UpstreamManager>,
        ratelimiter: Arc<RateLimiter>,
        metrics: Arc<Metrics>,
    ) -> Self {
        QueryPipeline {
            config,
            pool,
            datastore,
            filter,
            cache,
            upstreams,
            ratelimiter,
            metrics,
        }
    }

    /// Handle one raw message. A [HoldfastError::MalformedMessage] return
    /// means "no reply at all": the UDP listener drops it, stream listeners
    /// close the connection.
    #[instrument(level = "debug", skip_all, fields(protocol = %protocol, client = %client))]
    pub async fn handle_query(
        &self,
        buf: &[u8],
        client: SocketAddr,
        protocol: QueryProtocol,
    ) -> Result<Vec<u8>, HoldfastError> {
        let started = Instant::now();
        let now = Utc::now().timestamp();
        let header = Header::from_bytes(buf)?;

        // dynamic updates take their own road entirely
        if header.opcode == OpCode::Update {
            return match ddns::process_update(&self.pool, &self.config, buf, client.ip(), now).await
            {
                Ok(response) => {
                    self.metrics.bump(&self.metrics.ddns_updates);
                    Ok(response)
                }
                Err(err) => {
                    error!("update processing failed: {err}");
                    self.metrics.bump(&self.metrics.errors);
                    reply_servfail(header.id, None).as_bytes()
                }
            };
        }

        if header.qr == PacketType::Answer {
            return Err(HoldfastError::MalformedMessage(
                "got a message with QR=1, dropping".to_string(),
            ));
        }

        let message = Message::parse(buf)?;
        let question = message
            .question()
            .ok_or_else(|| {
                HoldfastError::MalformedMessage("query without a question section".to_string())
            })?
            .clone();
        let dnssec_requested = message.dnssec_requested();

        debug!("q={} type={} from {client}", question.qname, question.qtype);

        let outcome = self
            .resolve(buf, &header, &question, client.ip(), dnssec_requested, now)
            .await;

        let (outcome, rcode) = match outcome {
            Ok(outcome) => {
                let rcode = outcome
                    .response
                    .get(3)
                    .map(|b| b & 0x0F)
                    .unwrap_or(Rcode::NoError as u8);
                (outcome, rcode)
            }
            Err(err) => {
                error!("query for {} failed: {err}", question.qname);
                self.metrics.bump(&self.metrics.errors);
                let response = reply_servfail(header.id, Some(question.clone())).as_bytes()?;
                (QueryOutcome::plain(response), Rcode::ServFail as u8)
            }
        };

        self.log_query(QueryLogRow {
            id: uuid::Uuid::now_v7().to_string(),
            timestamp: now,
            client_ip: client.ip().to_string(),
            name: question.qname.clone(),
            rrtype: question.qtype as u16,
            blocked: outcome.blocked,
            reason: outcome.reason.clone(),
            cached: outcome.cached,
            response_time_ms: started.elapsed().as_millis() as i64,
            rcode: rcode as u16,
        });
        self.metrics.bump(&self.metrics.queries_total);

        Ok(outcome.response)
    }

    async fn resolve(
        &self,
        buf: &[u8],
        header: &Header,
        question: &Question,
        client_ip: IpAddr,
        dnssec_requested: bool,
        now: i64,
    ) -> Result<QueryOutcome, HoldfastError> {
        if question.qclass != RecordClass::Internet {
            let mut reply = reply_builder(header.id, Rcode::Refused);
            reply.question = Some(question.clone());
            return Ok(QueryOutcome::plain(reply.as_bytes()?));
        }
        if !question.qtype.supported() {
            let mut reply = reply_builder(header.id, Rcode::NotImplemented);
            reply.question = Some(question.clone());
            return Ok(QueryOutcome::plain(reply.as_bytes()?));
        }

        // rate limiting answers NXDOMAIN rather than advertising the limit
        if self.ratelimiter.enabled() {
            let now_ms = Utc::now().timestamp_millis();
            if !self.ratelimiter.check(client_ip, now_ms).await? {
                warn!("rate limited {client_ip}, answering NXDOMAIN");
                self.metrics.bump(&self.metrics.rate_limited);
                let response = reply_nxdomain(header.id, Some(question.clone())).as_bytes()?;
                return Ok(QueryOutcome::plain(response));
            }
        }

        // zones we hold answer before any filtering or forwarding
        if let Some(zone) = self.find_zone(&question.qname).await? {
            if matches!(question.qtype, RecordType::AXFR | RecordType::IXFR) {
                // transfers only make sense on the stream listeners, which
                // route them through zone_transfer instead
                let mut reply = reply_builder(header.id, Rcode::Refused);
                reply.question = Some(question.clone());
                return Ok(QueryOutcome::plain(reply.as_bytes()?));
            }

            if let Some(hit) = self.cache.get(&question.qname, question.qtype, header.id, now) {
                self.metrics.bump(&self.metrics.cache_hits);
                return Ok(QueryOutcome {
                    response: hit,
                    cached: true,
                    blocked: false,
                    reason: None,
                });
            }

            let (tx, rx) = oneshot::channel();
            self.datastore
                .send(Command::Answer {
                    zone,
                    question: question.clone(),
                    query_id: header.id,
                    recursion_available: true,
                    now,
                    resp: tx,
                })
                .await
                .map_err(|e| HoldfastError::SendError(e.to_string()))?;
            let mut reply = rx
                .await
                .map_err(|e| HoldfastError::SendError(e.to_string()))??;
            reply.header.recursion_desired = header.recursion_desired;
            let response = reply.as_bytes()?;
            self.cache
                .insert(&question.qname, question.qtype, response.clone(), None, now)
                .await?;
            self.metrics.bump(&self.metrics.authoritative_answers);
            return Ok(QueryOutcome::plain(response));
        }

        // the static local map beats filtering and forwarding
        if let Some(outcome) = self.local_host_answer(header, question, now).await? {
            return Ok(outcome);
        }

        // the filter verdict
        let verdict = self
            .filter
            .evaluate(&question.qname, &client_ip.to_string(), now);
        if verdict.blocked {
            self.metrics.bump(&self.metrics.blocked);
            let reason = verdict.reason.map(|r| r.to_string());
            let response = self.blocked_answer(header, question)?;
            return Ok(QueryOutcome {
                response,
                cached: false,
                blocked: true,
                reason,
            });
        }

        // cache, then upstreams, then the stale fallback
        if let Some(hit) = self.cache.get(&question.qname, question.qtype, header.id, now) {
            self.metrics.bump(&self.metrics.cache_hits);
            return Ok(QueryOutcome {
                response: hit,
                cached: true,
                blocked: false,
                reason: None,
            });
        }

        match self
            .upstreams
            .dispatch(buf, &client_ip.to_string(), &question.qname, now)
            .await
        {
            Ok(response) => {
                if dnssec_requested && self.config.dnssec_validation {
                    if let Err(err) = dnssec::validate_response(&response) {
                        warn!("dnssec validation failed for {}: {err}", question.qname);
                        self.metrics.bump(&self.metrics.validation_failures);
                    }
                }
                self.cache
                    .insert(&question.qname, question.qtype, response.clone(), None, now)
                    .await?;
                self.metrics.bump(&self.metrics.upstream_answers);
                Ok(QueryOutcome::plain(response))
            }
            Err(err) => {
                warn!("upstreams exhausted for {}: {err}", question.qname);
                if let Some(stale) =
                    self.cache
                        .get_stale(&question.qname, question.qtype, header.id, now)
                {
                    self.metrics.bump(&self.metrics.stale_served);
                    return Ok(QueryOutcome {
                        response: stale,
                        cached: true,
                        blocked: false,
                        reason: None,
                    });
                }
                Err(err)
            }
        }
    }

    async fn find_zone(&self, name: &str) -> Result<Option<crate::zones::FileZone>, HoldfastError> {
        let (tx, rx) = oneshot::channel();
        self.datastore
            .send(Command::FindZone {
                name: name.to_string(),
                resp: tx,
            })
            .await
            .map_err(|e| HoldfastError::SendError(e.to_string()))?;
        rx.await.map_err(|e| HoldfastError::SendError(e.to_string()))
    }

    /// Exact-name answers from the configured host map, A/AAAA only, cached
    /// with a long TTL.
    async fn local_host_answer(
        &self,
        header: &Header,
        question: &Question,
        now: i64,
    ) -> Result<Option<QueryOutcome>, HoldfastError> {
        if !matches!(question.qtype, RecordType::A | RecordType::AAAA) {
            return Ok(None);
        }
        let Some(address) = self.config.local_hosts.get(&question.qname) else {
            return Ok(None);
        };
        let Ok(ip) = address.parse::<IpAddr>() else {
            warn!("local_hosts entry for {} isn't an address: {address:?}", question.qname);
            return Ok(None);
        };
        let record = match (question.qtype, ip) {
            (RecordType::A, IpAddr::V4(v4)) => InternalResourceRecord::A {
                address: v4,
                ttl: LOCAL_ANSWER_TTL,
            },
            (RecordType::AAAA, IpAddr::V6(v6)) => InternalResourceRecord::AAAA {
                address: v6,
                ttl: LOCAL_ANSWER_TTL,
            },
            // the map matched but the family didn't; let resolution continue
            _ => return Ok(None),
        };
        let mut reply = reply_builder(header.id, Rcode::NoError);
        reply.header.recursion_available = true;
        reply.question = Some(question.clone());
        reply.answers.push(ResourceRecord {
            name: question.qname.clone(),
            record_type: question.qtype,
            class: RecordClass::Internet,
            ttl: LOCAL_ANSWER_TTL,
            rdata: record.as_bytes()?,
        });
        let response = reply.as_bytes()?;
        self.cache
            .insert(
                &question.qname,
                question.qtype,
                response.clone(),
                Some(LOCAL_ANSWER_TTL),
                now,
            )
            .await?;
        Ok(Some(QueryOutcome::plain(response)))
    }

    /// NXDOMAIN, or the configured sink address when block-page mode is on
    /// and the query is for an address record.
    fn blocked_answer(&self, header: &Header, question: &Question) -> Result<Vec<u8>, HoldfastError> {
        if self.config.block_page.enabled {
            let record = match question.qtype {
                RecordType::A => self.config.block_page.ipv4.map(|address| {
                    InternalResourceRecord::A {
                        address,
                        ttl: BLOCK_PAGE_TTL,
                    }
                }),
                RecordType::AAAA => self.config.block_page.ipv6.map(|address| {
                    InternalResourceRecord::AAAA {
                        address,
                        ttl: BLOCK_PAGE_TTL,
                    }
                }),
                _ => None,
            };
            if let Some(record) = record {
                let mut reply = reply_builder(header.id, Rcode::NoError);
                reply.question = Some(question.clone());
                reply.answers.push(ResourceRecord {
                    name: question.qname.clone(),
                    record_type: question.qtype,
                    class: RecordClass::Internet,
                    ttl: BLOCK_PAGE_TTL,
                    rdata: record.as_bytes()?,
                });
                return reply.as_bytes();
            }
        }
        reply_nxdomain(header.id, Some(question.clone())).as_bytes()
    }

    /// AXFR/IXFR over a stream transport: each returned buffer is one framed
    /// message. `None` means we aren't authoritative for the name.
    pub async fn zone_transfer(
        &self,
        raw: &[u8],
    ) -> Result<Option<Vec<Vec<u8>>>, HoldfastError> {
        let message = Message::parse(raw)?;
        let question = message
            .question()
            .ok_or_else(|| {
                HoldfastError::MalformedMessage("transfer without a question".to_string())
            })?
            .clone();
        let Some(zone) = self.find_zone(&question.qname).await? else {
            return Ok(None);
        };

        // an IXFR carries the client's current SOA in the authority section
        let client_serial = message.authorities.iter().find_map(|rr| {
            match InternalResourceRecord::from_wire(rr.record_type, rr.ttl, &rr.rdata) {
                Ok(InternalResourceRecord::SOA { serial, .. }) => Some(serial),
                _ => None,
            }
        });

        let (tx, rx) = oneshot::channel();
        self.datastore
            .send(Command::Transfer {
                zone,
                question,
                query_id: message.header.id,
                client_serial,
                resp: tx,
            })
            .await
            .map_err(|e| HoldfastError::SendError(e.to_string()))?;
        let frames = rx
            .await
            .map_err(|e| HoldfastError::SendError(e.to_string()))??;

        let mut encoded = Vec::with_capacity(frames.len());
        for mut frame in frames {
            encoded.push(frame.as_bytes()?);
        }
        Ok(Some(encoded))
    }

    /// Push a log row without ever waiting; a full queue drops the row.
    fn log_query(&self, row: QueryLogRow) {
        if self.datastore.try_send(Command::LogQuery(Box::new(row))).is_err() {
            debug!("query log queue full, dropping row");
        }
    }

    /// The five-minute prefetch pass: refresh popular entries nearing expiry.
    pub async fn prefetch_tick(&self) -> Result<usize, HoldfastError> {
        if !self.cache.prefetch_enabled() {
            return Ok(0);
        }
        let now = Utc::now().timestamp();
        let since = now - 86400;
        let popular = db::querylog::popular(
            &self.pool,
            since,
            self.cache.prefetch_min_queries() as i64,
        )
        .await?;

        let candidates: Vec<_> = popular
            .into_iter()
            .filter_map(|(name, rrtype, _count)| {
                self.cache
                    .prefetch_candidate(&name, RecordType::from(rrtype), now)
            })
            .collect();

        let refreshes = candidates.into_iter().map(|key| async move {
            let query = build_query(&key.name, key.rrtype)?;
            let response = self
                .upstreams
                .dispatch(&query, "prefetch", &key.name, now)
                .await?;
            self.cache
                .insert(&key.name, key.rrtype, response, None, now)
                .await?;
            Ok::<_, HoldfastError>(key)
        });

        let mut refreshed = 0usize;
        for result in futures::future::join_all(refreshes).await {
            match result {
                Ok(_) => refreshed += 1,
                Err(err) => debug!("prefetch refresh failed: {err}"),
            }
        }
        Ok(refreshed)
    }

    /// Housekeeping on a timer: cache expiry, rate-window cleanup, upstream
    /// heal, query-log trim.
    pub async fn maintenance_tick(&self) {
        let now = Utc::now().timestamp();
        if let Err(err) = self.cache.expire_cycle(now).await {
            error!("cache expiry cycle failed: {err}");
        }
        if let Err(err) = self.ratelimiter.cleanup(Utc::now().timestamp_millis()).await {
            error!("rate window cleanup failed: {err}");
        }
        self.upstreams.heal_cycle(now);
        if let Err(err) = db::querylog::cleanup(&self.pool, now - LOG_RETENTION_SECS).await {
            error!("query log cleanup failed: {err}");
        }
    }
}

/// A fresh query for the prefetcher, random id, RD set.
fn build_query(name: &str, rrtype: RecordType) -> Result<Vec<u8>, HoldfastError> {
    let mut reply = Reply {
        header: Header {
            id: rand::rng().random(),
            qr: PacketType::Query,
            recursion_desired: true,
            ..Default::default()
        },
        question: Some(Question {
            qname: name.to_string(),
            qtype: rrtype,
            qclass: RecordClass::Internet,
        }),
        answers: vec![],
        authorities: vec![],
        additionals: vec![],
    };
    reply.as_bytes()
}
