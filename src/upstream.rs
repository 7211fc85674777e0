//! Upstream resolver selection and dispatch. Endpoints are a tagged variant
//! over UDP/TCP, DoT and DoH; the manager walks the selected list in order,
//! tracks per-endpoint failures, and rests an endpoint that keeps failing.

use crate::config::ConfigFile;
use crate::enums::{PacketType, Rcode, RecordClass, RecordType};
use crate::error::HoldfastError;
use crate::reply::Reply;
use crate::resourcerecord::InternalResourceRecord;
use crate::message::Message;
use crate::{Header, Question, ResourceRecord, MAX_MESSAGE_SIZE};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use dashmap::DashMap;
use log::{debug, warn};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use url::Url;

const UDP_TIMEOUT: Duration = Duration::from_secs(5);
const TCP_TIMEOUT: Duration = Duration::from_secs(5);
const DOT_TIMEOUT: Duration = Duration::from_secs(10);
const DOH_TIMEOUT: Duration = Duration::from_secs(10);

/// Stop choosing an endpoint after this many failures inside the window.
const MAX_FAILURES: u32 = 3;
const FAILURE_WINDOW_SECS: i64 = 60;
const DISABLE_DURATION_SECS: i64 = 300;

/// How to reach one upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// Plain DNS; UDP first, TCP retry when the answer comes back truncated.
    Udp(SocketAddr),
    Tcp(SocketAddr),
    /// DNS over TLS, RFC 7858. Default port 853.
    Dot { host: String, port: u16 },
    /// DNS over HTTPS, RFC 8484.
    Doh { url: Url },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamAddr {
    /// The configured string, used as the health-table key
    pub raw: String,
    pub transport: Transport,
}

impl UpstreamAddr {
    /// `1.1.1.1`, `9.9.9.9:5353`, `tls://dns.quad9.net`,
    /// `https://cloudflare-dns.com/dns-query`
    pub fn parse(input: &str) -> Result<Self, HoldfastError> {
        let raw = input.to_string();
        if let Some(rest) = input.strip_prefix("tls://") {
            let (host, port) = match rest.rsplit_once(':') {
                Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => (
                    host.to_string(),
                    port.parse::<u16>().map_err(|e| {
                        HoldfastError::InvalidValue(format!("bad DoT port in {input:?}: {e}"))
                    })?,
                ),
                _ => (rest.to_string(), 853),
            };
            if host.is_empty() {
                return Err(HoldfastError::InvalidValue(format!(
                    "no host in DoT upstream {input:?}"
                )));
            }
            return Ok(UpstreamAddr {
                raw,
                transport: Transport::Dot { host, port },
            });
        }
        if let Some(rest) = input.strip_prefix("tcp://") {
            let addr = SocketAddr::from_str(rest)
                .or_else(|_| IpAddr::from_str(rest).map(|ip| SocketAddr::new(ip, 53)))
                .map_err(|e| {
                    HoldfastError::InvalidValue(format!("bad TCP upstream {input:?}: {e}"))
                })?;
            return Ok(UpstreamAddr {
                raw,
                transport: Transport::Tcp(addr),
            });
        }
        if input.starts_with("https://") {
            let url = Url::parse(input).map_err(|e| {
                HoldfastError::InvalidValue(format!("bad DoH url {input:?}: {e}"))
            })?;
            return Ok(UpstreamAddr {
                raw,
                transport: Transport::Doh { url },
            });
        }
        // plain addresses: v4, v6, or either with a :port (v6 bracketed)
        if let Ok(addr) = SocketAddr::from_str(input) {
            return Ok(UpstreamAddr {
                raw,
                transport: Transport::Udp(addr),
            });
        }
        if let Ok(ip) = IpAddr::from_str(input) {
            return Ok(UpstreamAddr {
                raw,
                transport: Transport::Udp(SocketAddr::new(ip, 53)),
            });
        }
        Err(HoldfastError::InvalidValue(format!(
            "can't parse upstream {input:?}"
        )))
    }
}

/// Failure bookkeeping for one endpoint.
#[derive(Debug, Clone, Default)]
pub struct UpstreamHealth {
    pub failures: u32,
    pub first_failure_at: i64,
    pub last_failure_at: i64,
    pub disabled_until: i64,
}

/// A conditional forwarding rule after parsing. `*.suffix` patterns match
/// strictly below the suffix; bare domains match the apex too.
#[derive(Debug, Clone)]
struct ForwardRule {
    pattern: String,
    wildcard_only: bool,
    priority: i64,
    upstreams: Vec<UpstreamAddr>,
}

impl ForwardRule {
    fn matches(&self, name: &str) -> bool {
        if self.wildcard_only {
            name.ends_with(&format!(".{}", self.pattern))
        } else {
            name == self.pattern || name.ends_with(&format!(".{}", self.pattern))
        }
    }
}

pub struct UpstreamManager {
    global: Vec<UpstreamAddr>,
    per_client: DashMap<String, Vec<UpstreamAddr>>,
    rules: Vec<ForwardRule>,
    health: DashMap<String, UpstreamHealth>,
    latencies: DashMap<String, i64>,
    http: reqwest::Client,
    tls: TlsConnector,
}

fn parse_list(list: &[String]) -> Vec<UpstreamAddr> {
    list.iter()
        .filter_map(|raw| match UpstreamAddr::parse(raw) {
            Ok(addr) => Some(addr),
            Err(err) => {
                warn!("ignoring unparseable upstream {raw:?}: {err}");
                None
            }
        })
        .collect()
}

impl UpstreamManager {
    pub fn from_config(config: &ConfigFile) -> Result<Self, HoldfastError> {
        let global = parse_list(&config.upstreams);

        let per_client = DashMap::new();
        for (client, list) in &config.client_upstreams {
            per_client.insert(client.clone(), parse_list(list));
        }

        let mut rules: Vec<ForwardRule> = config
            .conditional_forwards
            .iter()
            .map(|rule| {
                let (pattern, wildcard_only) = match rule.domain.strip_prefix("*.") {
                    Some(suffix) => (suffix.to_lowercase(), true),
                    None => (rule.domain.to_lowercase(), false),
                };
                ForwardRule {
                    pattern,
                    wildcard_only,
                    priority: rule.priority,
                    upstreams: parse_list(&rule.upstreams),
                }
            })
            .collect();
        // longest suffix first, priority breaking ties
        rules.sort_by(|a, b| {
            b.pattern
                .len()
                .cmp(&a.pattern.len())
                .then(b.priority.cmp(&a.priority))
        });

        let http = reqwest::Client::builder()
            .timeout(DOH_TIMEOUT)
            .use_rustls_tls()
            .build()?;

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let tls = TlsConnector::from(Arc::new(tls_config));

        Ok(UpstreamManager {
            global,
            per_client,
            rules,
            health: DashMap::new(),
            latencies: DashMap::new(),
            http,
            tls,
        })
    }

    /// The ordered endpoint list for this (client, name) pair: a
    /// client-specific list if one exists, else the best conditional-forward
    /// rule, else the global list. Endpoints resting in a cooldown are
    /// never chosen.
    pub fn select(&self, client_ip: &str, name: &str, now: i64) -> Vec<UpstreamAddr> {
        let list = if let Some(list) = self.per_client.get(client_ip) {
            list.clone()
        } else if let Some(rule) = self.rules.iter().find(|r| r.matches(name)) {
            rule.upstreams.clone()
        } else {
            self.global.clone()
        };
        list.into_iter()
            .filter(|u| !self.is_disabled(&u.raw, now))
            .collect()
    }

    pub fn is_disabled(&self, raw: &str, now: i64) -> bool {
        match self.health.get(raw) {
            Some(health) => now < health.disabled_until,
            None => false,
        }
    }

    pub fn health_snapshot(&self, raw: &str) -> Option<UpstreamHealth> {
        self.health.get(raw).map(|h| h.clone())
    }

    pub fn record_success(&self, raw: &str, latency_ms: i64) {
        self.health.remove(raw);
        self.latencies.insert(raw.to_string(), latency_ms);
    }

    pub fn record_failure(&self, raw: &str, now: i64) {
        let mut entry = self.health.entry(raw.to_string()).or_default();
        if entry.failures == 0 || now - entry.first_failure_at > FAILURE_WINDOW_SECS {
            entry.failures = 1;
            entry.first_failure_at = now;
        } else {
            entry.failures += 1;
        }
        entry.last_failure_at = now;
        if entry.failures >= MAX_FAILURES {
            entry.disabled_until = now + DISABLE_DURATION_SECS;
            warn!("upstream {raw} disabled for {DISABLE_DURATION_SECS}s after {} failures", entry.failures);
        }
    }

    /// Drop failure records that have sat quiet past the window.
    pub fn heal_cycle(&self, now: i64) {
        self.health.retain(|_, health| {
            now < health.disabled_until || now - health.last_failure_at <= FAILURE_WINDOW_SECS
        });
    }

    /// Walk the selected endpoints in order until one produces a response.
    pub async fn dispatch(
        &self,
        query: &[u8],
        client_ip: &str,
        name: &str,
        now: i64,
    ) -> Result<Vec<u8>, HoldfastError> {
        let endpoints = self.select(client_ip, name, now);
        if endpoints.is_empty() {
            return Err(HoldfastError::AllUpstreamsFailed(
                "no healthy upstreams to try".to_string(),
            ));
        }
        let mut causes: Vec<String> = vec![];
        for endpoint in endpoints {
            let started = std::time::Instant::now();
            match self.exchange(&endpoint, query).await {
                Ok(response) => {
                    self.record_success(&endpoint.raw, started.elapsed().as_millis() as i64);
                    return Ok(response);
                }
                Err(err) => {
                    debug!("upstream {} failed: {err}", endpoint.raw);
                    self.record_failure(&endpoint.raw, now);
                    causes.push(format!("{}: {err}", endpoint.raw));
                }
            }
        }
        Err(HoldfastError::AllUpstreamsFailed(causes.join("; ")))
    }

    async fn exchange(
        &self,
        endpoint: &UpstreamAddr,
        query: &[u8],
    ) -> Result<Vec<u8>, HoldfastError> {
        match &endpoint.transport {
            Transport::Udp(addr) => {
                let response = self.exchange_udp(*addr, query).await?;
                // truncated answer: the authority wants us on TCP
                if response.len() > 2 && response[2] & 0x02 != 0 {
                    debug!("upstream {addr} truncated the answer, retrying over TCP");
                    return self.exchange_tcp(*addr, query, TCP_TIMEOUT).await;
                }
                Ok(response)
            }
            Transport::Tcp(addr) => self.exchange_tcp(*addr, query, TCP_TIMEOUT).await,
            Transport::Dot { host, port } => self.exchange_dot(host, *port, query).await,
            Transport::Doh { url } => self.exchange_doh(url, query).await,
        }
    }

    async fn exchange_udp(
        &self,
        addr: SocketAddr,
        query: &[u8],
    ) -> Result<Vec<u8>, HoldfastError> {
        let bind_addr = match addr {
            SocketAddr::V4(_) => "0.0.0.0:0",
            SocketAddr::V6(_) => "[::]:0",
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(addr).await?;
        socket.send(query).await?;
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        let len = timeout(UDP_TIMEOUT, socket.recv(&mut buf))
            .await
            .map_err(|_| HoldfastError::UpstreamFailure(format!("udp timeout to {addr}")))??;
        buf.truncate(len);
        check_response_id(query, &buf)?;
        Ok(buf)
    }

    async fn exchange_tcp(
        &self,
        addr: SocketAddr,
        query: &[u8],
        io_timeout: Duration,
    ) -> Result<Vec<u8>, HoldfastError> {
        let stream = timeout(io_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| HoldfastError::UpstreamFailure(format!("tcp connect timeout to {addr}")))??;
        self.framed_exchange(stream, query, io_timeout, &addr.to_string())
            .await
    }

    async fn exchange_dot(
        &self,
        host: &str,
        port: u16,
        query: &[u8],
    ) -> Result<Vec<u8>, HoldfastError> {
        let stream = timeout(DOT_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .map_err(|_| {
                HoldfastError::UpstreamFailure(format!("dot connect timeout to {host}:{port}"))
            })??;
        let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
            .map_err(|e| HoldfastError::UpstreamFailure(format!("bad DoT server name {host}: {e}")))?;
        let stream = timeout(DOT_TIMEOUT, self.tls.connect(server_name, stream))
            .await
            .map_err(|_| {
                HoldfastError::UpstreamFailure(format!("tls handshake timeout to {host}:{port}"))
            })??;
        self.framed_exchange(stream, query, DOT_TIMEOUT, &format!("{host}:{port}"))
            .await
    }

    /// Two-byte length prefix, message, and the same back - TCP and DoT
    /// share this shape.
    async fn framed_exchange<S>(
        &self,
        mut stream: S,
        query: &[u8],
        io_timeout: Duration,
        peer: &str,
    ) -> Result<Vec<u8>, HoldfastError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let exchange = async {
            stream.write_all(&(query.len() as u16).to_be_bytes()).await?;
            stream.write_all(query).await?;
            let length = stream.read_u16().await? as usize;
            if length > MAX_MESSAGE_SIZE {
                return Err(HoldfastError::UpstreamFailure(format!(
                    "{peer} framed a {length} byte response"
                )));
            }
            let mut buf = vec![0u8; length];
            stream.read_exact(&mut buf).await?;
            Ok::<_, HoldfastError>(buf)
        };
        let response = timeout(io_timeout, exchange)
            .await
            .map_err(|_| HoldfastError::UpstreamFailure(format!("stream timeout to {peer}")))??;
        check_response_id(query, &response)?;
        Ok(response)
    }

    /// RFC 8484: POST the message, fall back to GET with base64url, and as a
    /// last resort ask for the JSON shape and rebuild a message from it.
    async fn exchange_doh(&self, url: &Url, query: &[u8]) -> Result<Vec<u8>, HoldfastError> {
        let post = self
            .http
            .post(url.clone())
            .header("content-type", "application/dns-message")
            .header("accept", "application/dns-message")
            .body(query.to_vec())
            .send()
            .await;
        if let Ok(response) = post {
            if response.status().is_success() {
                let body = response.bytes().await?;
                check_response_id(query, &body)?;
                return Ok(body.to_vec());
            }
        }

        let encoded = URL_SAFE_NO_PAD.encode(query);
        let get = self
            .http
            .get(url.clone())
            .query(&[("dns", encoded.as_str())])
            .header("accept", "application/dns-message")
            .send()
            .await;
        if let Ok(response) = get {
            if response.status().is_success() {
                let body = response.bytes().await?;
                check_response_id(query, &body)?;
                return Ok(body.to_vec());
            }
        }

        self.exchange_doh_json(url, query).await
    }

    async fn exchange_doh_json(&self, url: &Url, query: &[u8]) -> Result<Vec<u8>, HoldfastError> {
        let message = Message::parse(query)?;
        let question = message
            .question()
            .ok_or_else(|| HoldfastError::UpstreamFailure("query has no question".to_string()))?;
        let response = self
            .http
            .get(url.clone())
            .query(&[
                ("name", question.qname.clone()),
                ("type", (question.qtype as u16).to_string()),
            ])
            .header("accept", "application/dns-json")
            .send()
            .await?
            .error_for_status()
            .map_err(|e| HoldfastError::UpstreamFailure(format!("doh json fallback: {e}")))?;
        let body: serde_json::Value = response.json().await?;
        build_reply_from_json(message.header.id, question.clone(), &body)
    }
}

/// A response must answer the query we sent.
fn check_response_id(query: &[u8], response: &[u8]) -> Result<(), HoldfastError> {
    if query.len() < 2 || response.len() < 2 {
        return Err(HoldfastError::UpstreamFailure("short exchange".to_string()));
    }
    if query[0..2] != response[0..2] {
        return Err(HoldfastError::UpstreamFailure(
            "response id doesn't match the query".to_string(),
        ));
    }
    Ok(())
}

/// Rebuild a wire response from the `application/dns-json` answer shape.
fn build_reply_from_json(
    id: u16,
    question: Question,
    body: &serde_json::Value,
) -> Result<Vec<u8>, HoldfastError> {
    let status = body.get("Status").and_then(|s| s.as_u64()).unwrap_or(2);
    let rcode = match status {
        0 => Rcode::NoError,
        3 => Rcode::NameError,
        _ => Rcode::ServFail,
    };

    let mut answers: Vec<ResourceRecord> = vec![];
    if let Some(json_answers) = body.get("Answer").and_then(|a| a.as_array()) {
        for answer in json_answers {
            let Some(name) = answer.get("name").and_then(|n| n.as_str()) else {
                continue;
            };
            let rrtype =
                RecordType::from(answer.get("type").and_then(|t| t.as_u64()).unwrap_or(0) as u16);
            let ttl = answer.get("TTL").and_then(|t| t.as_u64()).unwrap_or(0) as u32;
            let Some(data) = answer.get("data").and_then(|d| d.as_str()) else {
                continue;
            };
            let record = crate::zones::FileZoneRecord {
                id: None,
                zoneid: None,
                name: name.trim_end_matches('.').to_lowercase(),
                rrtype: rrtype.to_string(),
                rdata: data.trim_matches('"').to_string(),
                ttl,
                priority: None,
            };
            let typed: InternalResourceRecord = match record.clone().try_into() {
                Ok(value) => value,
                Err(err) => {
                    debug!("skipping undecodable json answer {record:?}: {err}");
                    continue;
                }
            };
            answers.push(ResourceRecord {
                name: record.name,
                record_type: rrtype,
                class: RecordClass::Internet,
                ttl,
                rdata: typed.as_bytes()?,
            });
        }
    }

    let mut reply = Reply {
        header: Header {
            id,
            qr: PacketType::Answer,
            recursion_desired: true,
            recursion_available: true,
            rcode,
            ..Default::default()
        },
        question: Some(question),
        answers,
        authorities: vec![],
        additionals: vec![],
    };
    reply.as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_upstream_flavours() {
        let plain = UpstreamAddr::parse("1.1.1.1").expect("parse");
        assert_eq!(
            plain.transport,
            Transport::Udp(SocketAddr::from_str("1.1.1.1:53").expect("addr"))
        );
        let with_port = UpstreamAddr::parse("9.9.9.9:5353").expect("parse");
        assert_eq!(
            with_port.transport,
            Transport::Udp(SocketAddr::from_str("9.9.9.9:5353").expect("addr"))
        );
        let dot = UpstreamAddr::parse("tls://dns.quad9.net").expect("parse");
        assert_eq!(
            dot.transport,
            Transport::Dot {
                host: "dns.quad9.net".to_string(),
                port: 853
            }
        );
        let dot_port = UpstreamAddr::parse("tls://dns.quad9.net:8853").expect("parse");
        assert_eq!(
            dot_port.transport,
            Transport::Dot {
                host: "dns.quad9.net".to_string(),
                port: 8853
            }
        );
        let tcp = UpstreamAddr::parse("tcp://192.0.2.53").expect("parse");
        assert_eq!(
            tcp.transport,
            Transport::Tcp(SocketAddr::from_str("192.0.2.53:53").expect("addr"))
        );
        let doh = UpstreamAddr::parse("https://cloudflare-dns.com/dns-query").expect("parse");
        assert!(matches!(doh.transport, Transport::Doh { .. }));

        assert!(UpstreamAddr::parse("not an upstream").is_err());
        assert!(UpstreamAddr::parse("tls://").is_err());
    }

    fn manager(config: &ConfigFile) -> UpstreamManager {
        UpstreamManager::from_config(config).expect("manager")
    }

    #[test]
    fn test_selection_order() {
        let mut config = ConfigFile::default();
        config.upstreams = vec!["1.1.1.1".to_string()];
        config
            .client_upstreams
            .insert("192.0.2.10".to_string(), vec!["8.8.8.8".to_string()]);
        config.conditional_forwards = vec![crate::config::ConditionalForward {
            domain: "corp.example".to_string(),
            upstreams: vec!["10.0.0.53".to_string()],
            priority: 0,
        }];
        let manager = manager(&config);

        // client-specific list wins
        let selected = manager.select("192.0.2.10", "anything.example.com", 0);
        assert_eq!(selected[0].raw, "8.8.8.8");
        // conditional forward for matching names
        let selected = manager.select("192.0.2.99", "host.corp.example", 0);
        assert_eq!(selected[0].raw, "10.0.0.53");
        // everyone else gets the global list
        let selected = manager.select("192.0.2.99", "example.com", 0);
        assert_eq!(selected[0].raw, "1.1.1.1");
    }

    #[test]
    fn test_longest_suffix_and_priority() {
        let mut config = ConfigFile::default();
        config.conditional_forwards = vec![
            crate::config::ConditionalForward {
                domain: "example".to_string(),
                upstreams: vec!["10.0.0.1".to_string()],
                priority: 0,
            },
            crate::config::ConditionalForward {
                domain: "corp.example".to_string(),
                upstreams: vec!["10.0.0.2".to_string()],
                priority: 0,
            },
            crate::config::ConditionalForward {
                domain: "*.corp.example".to_string(),
                upstreams: vec!["10.0.0.3".to_string()],
                priority: 5,
            },
        ];
        let manager = manager(&config);
        // wildcard and bare pattern have the same suffix length, priority breaks the tie
        let selected = manager.select("192.0.2.1", "host.corp.example", 0);
        assert_eq!(selected[0].raw, "10.0.0.3");
        // the wildcard doesn't match the apex
        let selected = manager.select("192.0.2.1", "corp.example", 0);
        assert_eq!(selected[0].raw, "10.0.0.2");
    }

    #[test]
    fn test_failure_tracking_and_cooldown() {
        let mut config = ConfigFile::default();
        config.upstreams = vec!["1.2.3.4".to_string(), "5.6.7.8".to_string()];
        let manager = manager(&config);
        let now = 1_000_000;

        manager.record_failure("1.2.3.4", now);
        manager.record_failure("1.2.3.4", now + 10);
        assert!(!manager.is_disabled("1.2.3.4", now + 20));
        manager.record_failure("1.2.3.4", now + 20);
        assert!(manager.is_disabled("1.2.3.4", now + 21));

        // the disabled endpoint is skipped in selection
        let selected = manager.select("192.0.2.1", "example.com", now + 21);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].raw, "5.6.7.8");

        // cooldown over
        assert!(!manager.is_disabled("1.2.3.4", now + 21 + DISABLE_DURATION_SECS));

        // success resets the record entirely
        manager.record_success("1.2.3.4", 12);
        assert!(manager.health_snapshot("1.2.3.4").is_none());
    }

    #[test]
    fn test_failures_outside_window_restart_the_count() {
        let config = ConfigFile::default();
        let manager = manager(&config);
        let now = 1_000_000;
        manager.record_failure("1.2.3.4", now);
        manager.record_failure("1.2.3.4", now + 30);
        // a failure after the window restarts at 1 rather than hitting 3
        manager.record_failure("1.2.3.4", now + 120);
        assert!(!manager.is_disabled("1.2.3.4", now + 121));
        let health = manager.health_snapshot("1.2.3.4").expect("health");
        assert_eq!(health.failures, 1);
    }

    #[test]
    fn test_heal_cycle_discards_quiet_records() {
        let config = ConfigFile::default();
        let manager = manager(&config);
        let now = 1_000_000;
        manager.record_failure("1.2.3.4", now);
        manager.heal_cycle(now + FAILURE_WINDOW_SECS + 1);
        assert!(manager.health_snapshot("1.2.3.4").is_none());
    }

    #[test]
    fn test_json_reply_synthesis() {
        let body: serde_json::Value = serde_json::json!({
            "Status": 0,
            "Answer": [
                {"name": "example.com.", "type": 1, "TTL": 120, "data": "93.184.215.14"}
            ]
        });
        let question = Question {
            qname: "example.com".to_string(),
            qtype: RecordType::A,
            qclass: RecordClass::Internet,
        };
        let bytes = build_reply_from_json(0x4242, question, &body).expect("build");
        let message = Message::parse(&bytes).expect("parse");
        assert_eq!(message.header.id, 0x4242);
        assert_eq!(message.header.ancount, 1);
        assert_eq!(message.answers[0].rdata, vec![93, 184, 215, 14]);
    }
}
