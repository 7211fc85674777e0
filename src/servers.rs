//! The transport listeners: UDP datagrams, TCP with two-byte framing, the
//! same framing inside TLS for DoT, and one QUIC stream per message for DoQ.
//! Each feeds [crate::pipeline::QueryPipeline]; zone transfers peel off to
//! their own streaming path on the framed transports.

use concread::cowcell::asynch::CowCellReadTxn;
use std::io::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ConfigFile;
use crate::enums::{Agent, AgentState, RecordType};
use crate::error::HoldfastError;
use crate::packet_dumper::{dump_bytes, DumpType};
use crate::pipeline::{QueryPipeline, QueryProtocol};
use crate::reply::reply_nxdomain;
use crate::{Question, HEADER_BYTES, MAX_MESSAGE_SIZE, UDP_TRUNCATION_LIMIT};

/// The question's qtype without a full parse, for routing transfers.
fn peek_qtype(buf: &[u8]) -> Option<RecordType> {
    Question::from_wire(buf, HEADER_BYTES)
        .ok()
        .map(|(question, _)| question.qtype)
}

/// Chop a too-large UDP response down to header + question with TC set, so
/// the client knows to come back over TCP.
fn truncate_for_udp(response: &[u8]) -> Vec<u8> {
    let question_end = match Question::from_wire(response, HEADER_BYTES) {
        Ok((_, end)) => end,
        Err(_) => HEADER_BYTES,
    };
    let mut out = response[..question_end].to_vec();
    out[2] |= 0x02; // TC
    if question_end == HEADER_BYTES {
        out[4..6].copy_from_slice(&[0, 0]); // qdcount
    }
    out[6..8].copy_from_slice(&[0, 0]); // ancount
    out[8..10].copy_from_slice(&[0, 0]); // nscount
    out[10..12].copy_from_slice(&[0, 0]); // arcount
    out
}

pub async fn udp_server(
    config: CowCellReadTxn<ConfigFile>,
    pipeline: Arc<QueryPipeline>,
    cancel: CancellationToken,
    agent_tx: broadcast::Sender<AgentState>,
) -> std::io::Result<()> {
    let udp_sock = match UdpSocket::bind(config.dns_listener_address()?).await {
        Ok(value) => {
            info!("Started UDP listener on {}:{}", config.address, config.port);
            value
        }
        Err(error) => {
            error!("Failed to start UDP listener: {:?}", error);
            return Ok(());
        }
    };
    let udp_sock = Arc::new(udp_sock);
    let capture_packets = config.capture_packets;

    let mut udp_buffer = [0u8; MAX_MESSAGE_SIZE];
    loop {
        let (len, addr) = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = agent_tx.send(AgentState::Stopped { agent: Agent::UDPServer });
                return Ok(());
            }
            received = udp_sock.recv_from(&mut udp_buffer) => match received {
                Ok(value) => value,
                Err(error) => {
                    error!("Error accepting connection via UDP: {:?}", error);
                    continue;
                }
            }
        };
        debug!("{:?} bytes received from {:?}", len, addr);

        let query = udp_buffer[0..len].to_vec();
        let pipeline = pipeline.clone();
        let socket = udp_sock.clone();
        tokio::spawn(async move {
            if capture_packets {
                dump_bytes(&query, DumpType::ClientRequest);
            }
            match pipeline.handle_query(&query, addr, QueryProtocol::Udp).await {
                Ok(response) => {
                    let response = match response.len() > UDP_TRUNCATION_LIMIT {
                        true => truncate_for_udp(&response),
                        false => response,
                    };
                    if capture_packets {
                        dump_bytes(&response, DumpType::ServerReply);
                    }
                    if let Err(err) = socket.send_to(&response, addr).await {
                        error!("Failed to send data back to {:?}: {:?}", addr, err);
                    }
                }
                // malformed input gets no reply at all on UDP
                Err(error) => debug!("dropping query from {addr}: {error}"),
            }
        });
    }
}

/// One framed-stream connection: length-prefixed messages handled strictly
/// in order, transfers streamed frame by frame, framing errors closing the
/// connection.
#[instrument(level = "info", skip_all, fields(addr = %addr, protocol = %protocol))]
async fn stream_conn_handler<S>(
    stream: S,
    addr: SocketAddr,
    pipeline: Arc<QueryPipeline>,
    protocol: QueryProtocol,
    capture_packets: bool,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    loop {
        // ref <https://www.rfc-editor.org/rfc/rfc7766#section-8>
        let msg_length: usize = match reader.read_u16().await {
            Ok(value) => value.into(),
            // clean disconnect between messages
            Err(_) => return Ok(()),
        };
        if msg_length < HEADER_BYTES || msg_length > MAX_MESSAGE_SIZE {
            warn!("closing connection from {addr}: framed length {msg_length}");
            return Ok(());
        }
        let mut buf = vec![0u8; msg_length];
        reader.read_exact(&mut buf).await?;
        if capture_packets {
            dump_bytes(&buf, DumpType::ClientRequest);
        }

        if matches!(peek_qtype(&buf), Some(RecordType::AXFR) | Some(RecordType::IXFR)) {
            match pipeline.zone_transfer(&buf).await {
                Ok(Some(frames)) => {
                    debug!("streaming {} transfer frames to {addr}", frames.len());
                    for frame in frames {
                        writer.write_all(&(frame.len() as u16).to_be_bytes()).await?;
                        writer.write_all(&frame).await?;
                    }
                }
                Ok(None) => {
                    let id = u16::from_be_bytes([buf[0], buf[1]]);
                    let response = reply_nxdomain(id, None)
                        .as_bytes()
                        .map_err(std::io::Error::from)?;
                    writer.write_all(&(response.len() as u16).to_be_bytes()).await?;
                    writer.write_all(&response).await?;
                }
                Err(error) => {
                    warn!("transfer request from {addr} failed: {error}");
                    return Ok(());
                }
            }
            continue;
        }

        match pipeline.handle_query(&buf, addr, protocol).await {
            Ok(response) => {
                if capture_packets {
                    dump_bytes(&response, DumpType::ServerReply);
                }
                writer.write_all(&(response.len() as u16).to_be_bytes()).await?;
                writer.write_all(&response).await?;
            }
            // a malformed message closes the stream
            Err(error) => {
                debug!("closing connection from {addr}: {error}");
                return Ok(());
            }
        }
    }
}

/// main handler for the TCP side of things
///
/// Ref <https://www.rfc-editor.org/rfc/rfc7766>
pub async fn tcp_server(
    config: CowCellReadTxn<ConfigFile>,
    pipeline: Arc<QueryPipeline>,
    cancel: CancellationToken,
    agent_tx: broadcast::Sender<AgentState>,
) -> std::io::Result<()> {
    let tcpserver = match TcpListener::bind(config.dns_listener_address()?).await {
        Ok(value) => {
            info!("Started TCP listener on {}:{}", config.address, config.port);
            value
        }
        Err(error) => {
            error!("Failed to start TCP Server: {:?}", error);
            return Ok(());
        }
    };

    let tcp_client_timeout = config.tcp_client_timeout;
    let capture_packets = config.capture_packets;
    let connection_limit = Arc::new(Semaphore::new(config.max_connections_per_transport));

    loop {
        let permit = match connection_limit.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return Ok(()),
        };
        let (stream, addr) = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = agent_tx.send(AgentState::Stopped { agent: Agent::TCPServer });
                return Ok(());
            }
            accepted = tcpserver.accept() => match accepted {
                Ok(value) => value,
                Err(err) => {
                    error!("Couldn't accept TCP connection: {:?}", err);
                    continue;
                }
            }
        };

        debug!("TCP connection from {:?}", addr);
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if timeout(
                Duration::from_secs(tcp_client_timeout),
                stream_conn_handler(stream, addr, pipeline, QueryProtocol::Tcp, capture_packets),
            )
            .await
            .is_err()
            {
                warn!(
                    "TCP connection from {addr:?} terminated after {} seconds.",
                    tcp_client_timeout
                );
            }
        });
    }
}

/// DNS over TLS: TCP framing wrapped in rustls, RFC 7858.
pub async fn tls_server(
    config: CowCellReadTxn<ConfigFile>,
    pipeline: Arc<QueryPipeline>,
    cancel: CancellationToken,
    agent_tx: broadcast::Sender<AgentState>,
) -> std::io::Result<()> {
    let (certs, key) = config.load_tls_identity()?;
    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| std::io::Error::other(format!("TLS listener config: {e}")))?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    let listener = match TcpListener::bind(config.tls_listener_address()?).await {
        Ok(value) => {
            info!("Started DoT listener on {}:{}", config.address, config.tls_port);
            value
        }
        Err(error) => {
            error!("Failed to start DoT listener: {:?}", error);
            return Ok(());
        }
    };

    let tcp_client_timeout = config.tcp_client_timeout;
    let capture_packets = config.capture_packets;
    let connection_limit = Arc::new(Semaphore::new(config.max_connections_per_transport));

    loop {
        let permit = match connection_limit.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return Ok(()),
        };
        let (stream, addr) = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = agent_tx.send(AgentState::Stopped { agent: Agent::TLSServer });
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(value) => value,
                Err(err) => {
                    error!("Couldn't accept DoT connection: {:?}", err);
                    continue;
                }
            }
        };

        let acceptor = acceptor.clone();
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let tls_stream = match acceptor.accept(stream).await {
                Ok(value) => value,
                Err(err) => {
                    debug!("TLS handshake from {addr:?} failed: {err}");
                    return;
                }
            };
            if timeout(
                Duration::from_secs(tcp_client_timeout),
                stream_conn_handler(tls_stream, addr, pipeline, QueryProtocol::Dot, capture_packets),
            )
            .await
            .is_err()
            {
                warn!("DoT connection from {addr:?} terminated after {tcp_client_timeout} seconds.");
            }
        });
    }
}

/// DNS over QUIC, RFC 9250: ALPN `doq`, one bidirectional stream per
/// message, no length prefix.
pub async fn quic_server(
    config: CowCellReadTxn<ConfigFile>,
    pipeline: Arc<QueryPipeline>,
    cancel: CancellationToken,
    agent_tx: broadcast::Sender<AgentState>,
) -> std::io::Result<()> {
    let (certs, key) = config.load_tls_identity()?;
    let mut tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| std::io::Error::other(format!("DoQ listener config: {e}")))?;
    tls_config.alpn_protocols = vec![b"doq".to_vec()];
    let quic_config = quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)
        .map_err(|e| std::io::Error::other(format!("DoQ crypto config: {e}")))?;
    let server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_config));

    let endpoint = match quinn::Endpoint::server(server_config, config.quic_listener_address()?) {
        Ok(value) => {
            info!("Started DoQ listener on {}:{}", config.address, config.quic_port);
            value
        }
        Err(error) => {
            error!("Failed to start DoQ listener: {:?}", error);
            return Ok(());
        }
    };

    loop {
        let incoming = tokio::select! {
            _ = cancel.cancelled() => {
                endpoint.close(0u32.into(), b"shutting down");
                let _ = agent_tx.send(AgentState::Stopped { agent: Agent::QuicServer });
                return Ok(());
            }
            incoming = endpoint.accept() => match incoming {
                Some(value) => value,
                None => return Ok(()),
            }
        };

        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            let connection = match incoming.await {
                Ok(value) => value,
                Err(err) => {
                    debug!("DoQ connection failed: {err}");
                    return;
                }
            };
            let addr = connection.remote_address();
            // streams on one connection are handled sequentially, matching
            // the framed transports
            loop {
                let (mut send, mut recv) = match connection.accept_bi().await {
                    Ok(value) => value,
                    Err(_) => return,
                };
                let query = match recv.read_to_end(MAX_MESSAGE_SIZE).await {
                    Ok(value) => value,
                    Err(err) => {
                        debug!("DoQ stream read from {addr} failed: {err}");
                        return;
                    }
                };
                match pipeline.handle_query(&query, addr, QueryProtocol::Doq).await {
                    Ok(response) => {
                        if send.write_all(&response).await.is_err() {
                            return;
                        }
                        let _ = send.finish();
                    }
                    Err(error) => {
                        debug!("closing DoQ connection from {addr}: {error}");
                        return;
                    }
                }
            }
        });
    }
}

#[derive(Debug)]
pub struct Servers {
    pub datastore: Option<JoinHandle<Result<(), HoldfastError>>>,
    pub udpserver: Option<JoinHandle<Result<(), Error>>>,
    pub tcpserver: Option<JoinHandle<Result<(), Error>>>,
    pub tlsserver: Option<JoinHandle<Result<(), Error>>>,
    pub quicserver: Option<JoinHandle<Result<(), Error>>>,
    pub apiserver: Option<JoinHandle<Result<(), Error>>>,
    pub agent_tx: broadcast::Sender<AgentState>,
}

impl Default for Servers {
    fn default() -> Self {
        let (agent_tx, _) = broadcast::channel(10000);
        Self {
            datastore: None,
            udpserver: None,
            tcpserver: None,
            tlsserver: None,
            quicserver: None,
            apiserver: None,
            agent_tx,
        }
    }
}

impl Servers {
    pub fn build(agent_tx: broadcast::Sender<AgentState>) -> Self {
        Self {
            agent_tx,
            ..Default::default()
        }
    }

    pub fn with_datastore(self, datastore: JoinHandle<Result<(), HoldfastError>>) -> Self {
        Self {
            datastore: Some(datastore),
            ..self
        }
    }

    pub fn with_udpserver(self, udpserver: JoinHandle<Result<(), Error>>) -> Self {
        Self {
            udpserver: Some(udpserver),
            ..self
        }
    }

    pub fn with_tcpserver(self, tcpserver: JoinHandle<Result<(), Error>>) -> Self {
        Self {
            tcpserver: Some(tcpserver),
            ..self
        }
    }

    pub fn with_tlsserver(self, tlsserver: JoinHandle<Result<(), Error>>) -> Self {
        Self {
            tlsserver: Some(tlsserver),
            ..self
        }
    }

    pub fn with_quicserver(self, quicserver: JoinHandle<Result<(), Error>>) -> Self {
        Self {
            quicserver: Some(quicserver),
            ..self
        }
    }

    pub fn with_apiserver(self, apiserver: JoinHandle<Result<(), Error>>) -> Self {
        Self {
            apiserver: Some(apiserver),
            ..self
        }
    }

    fn send_shutdown(&self, agent: Agent) {
        info!("{agent:?} shut down");
        if let Err(error) = self.agent_tx.send(AgentState::Stopped { agent }) {
            eprintln!("Failed to send agent shutdown message: {error:?}");
        }
    }

    pub fn all_finished(&self) -> bool {
        let mut results = vec![];
        if let Some(server) = &self.datastore {
            if server.is_finished() {
                self.send_shutdown(Agent::Datastore);
            }
            results.push(server.is_finished())
        }
        if let Some(server) = &self.udpserver {
            if server.is_finished() {
                self.send_shutdown(Agent::UDPServer);
            }
            results.push(server.is_finished())
        }
        if let Some(server) = &self.tcpserver {
            if server.is_finished() {
                self.send_shutdown(Agent::TCPServer);
            }
            results.push(server.is_finished())
        }
        if let Some(server) = &self.tlsserver {
            if server.is_finished() {
                self.send_shutdown(Agent::TLSServer);
            }
            results.push(server.is_finished())
        }
        if let Some(server) = &self.quicserver {
            if server.is_finished() {
                self.send_shutdown(Agent::QuicServer);
            }
            results.push(server.is_finished())
        }
        if let Some(server) = &self.apiserver {
            if server.is_finished() {
                self.send_shutdown(Agent::API);
            }
            results.push(server.is_finished())
        }
        results.iter().any(|&r| r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_for_udp_keeps_header_and_question() {
        use crate::enums::{RecordClass, Rcode};
        use crate::reply::reply_builder;
        use crate::ResourceRecord;

        let question = Question {
            qname: "big.example.com".to_string(),
            qtype: RecordType::TXT,
            qclass: RecordClass::Internet,
        };
        let mut reply = reply_builder(0x1234, Rcode::NoError);
        reply.question = Some(question.clone());
        for _ in 0..8 {
            reply.answers.push(ResourceRecord {
                name: question.qname.clone(),
                record_type: RecordType::TXT,
                class: RecordClass::Internet,
                ttl: 60,
                rdata: {
                    let mut rdata = vec![255u8];
                    rdata.extend([b'x'; 255]);
                    rdata
                },
            });
        }
        let full = reply.as_bytes().expect("encode");
        assert!(full.len() > UDP_TRUNCATION_LIMIT);

        let truncated = truncate_for_udp(&full);
        assert!(truncated.len() <= UDP_TRUNCATION_LIMIT);
        assert_ne!(truncated[2] & 0x02, 0);
        // question survives
        let (parsed, _) = Question::from_wire(&truncated, HEADER_BYTES).expect("parse");
        assert_eq!(parsed.qname, "big.example.com");
        // counts are zeroed
        assert_eq!(&truncated[6..12], &[0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_peek_qtype() {
        let question = Question {
            qname: "mydomain.test".to_string(),
            qtype: RecordType::AXFR,
            qclass: RecordClass::Internet,
        };
        use crate::enums::{Rcode, RecordClass};
        let mut reply = crate::reply::reply_builder(1, Rcode::NoError);
        reply.question = Some(question);
        let bytes = reply.as_bytes().expect("encode");
        assert_eq!(peek_qtype(&bytes), Some(RecordType::AXFR));
    }
}
