use clap::ArgMatches;
use concread::cowcell::asynch::{CowCell, CowCellReadTxn, CowCellWriteTxn};
use config::{Config, File};
use flexi_logger::filter::{LogLineFilter, LogLineWriter};
use flexi_logger::{DeferredNow, LoggerHandle};
use gethostname::gethostname;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

/// Cache behaviour knobs.
#[derive(Debug, Deserialize, PartialEq, Clone, Serialize)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Serve expired entries when every upstream has just failed
    pub serve_stale: bool,
    /// How far past expiry an entry may still be served, seconds
    pub serve_stale_max_age: u64,
    pub prefetch_enabled: bool,
    /// Refresh when the remaining-TTL fraction drops below 1 - threshold
    pub prefetch_threshold: f64,
    /// Only prefetch names seen at least this often in the last day
    pub prefetch_min_queries: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            serve_stale: true,
            serve_stale_max_age: 86400,
            prefetch_enabled: false,
            prefetch_threshold: 0.2,
            prefetch_min_queries: 5,
        }
    }
}

// the float stops us deriving Eq
impl Eq for CacheConfig {}

#[derive(Debug, Deserialize, Eq, PartialEq, Clone, Serialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Queries admitted per window per client
    pub max: u32,
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max: 100,
            window_ms: 1000,
        }
    }
}

/// Answer blocked A/AAAA queries with a sink address instead of NXDOMAIN.
#[derive(Debug, Deserialize, Eq, PartialEq, Clone, Serialize, Default)]
pub struct BlockPageConfig {
    pub enabled: bool,
    pub ipv4: Option<std::net::Ipv4Addr>,
    pub ipv6: Option<std::net::Ipv6Addr>,
}

/// A conditional forwarding rule: names under `domain` go to `upstreams`.
/// `*.corp.example` wildcard patterns are accepted.
#[derive(Debug, Deserialize, Eq, PartialEq, Clone, Serialize)]
pub struct ConditionalForward {
    pub domain: String,
    pub upstreams: Vec<String>,
    #[serde(default)]
    pub priority: i64,
}

#[derive(Debug, Deserialize, Eq, PartialEq, Clone, Serialize)]
/// The main config blob, write this as a JSON file and load it and it'll make things go.
pub struct ConfigFile {
    /// The server's hostname when generating an SOA record, defaults to the results of gethostname()
    pub hostname: String,
    /// DNS listener address, default is 127.0.0.1
    pub address: String,
    /// Listen for DNS queries on this port, default is 15353
    pub port: u16,
    /// If we should capture packets on request/response
    pub capture_packets: bool,
    /// Default is "INFO"
    pub log_level: String,
    /// How long until we drop TCP client connections, defaults to 5 seconds.
    pub tcp_client_timeout: u64,
    /// Cap on simultaneously served connections, per transport
    pub max_connections_per_transport: usize,
    /// The location for the sqlite file backing zones, logs and the cache mirror
    pub sqlite_path: String,
    /// Where the JSON zone file is
    pub zone_file: Option<String>,
    /// Upstream resolvers in preference order: `1.1.1.1`, `9.9.9.9:53`,
    /// `tls://dns.quad9.net`, `https://cloudflare-dns.com/dns-query`
    pub upstreams: Vec<String>,
    /// Per-client upstream overrides, keyed by client IP
    pub client_upstreams: HashMap<String, Vec<String>>,
    /// Conditional forwarding rules, longest suffix wins
    pub conditional_forwards: Vec<ConditionalForward>,
    /// Static name -> address answers served before filtering or forwarding
    pub local_hosts: HashMap<String, String>,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    pub block_page: BlockPageConfig,
    /// Verify RRSIGs on upstream answers when the client set DO
    pub dnssec_validation: bool,
    /// Accept RFC 2136 dynamic updates
    pub ddns_enabled: bool,
    /// Source networks allowed to attempt an update; empty means any
    pub ddns_allowed_nets: Vec<IpNet>,
    /// DNS-over-TLS listener
    pub enable_tls: bool,
    pub tls_port: u16,
    /// DNS-over-QUIC listener
    pub enable_quic: bool,
    pub quic_port: u16,
    /// DoH + health endpoint
    pub enable_api: bool,
    pub api_port: u16,
    /// Certificate path, shared by DoT, DoQ and the API
    pub tls_cert: PathBuf,
    /// TLS key path
    pub tls_key: PathBuf,
}

impl ConfigFile {
    /// JSONify the configfile in a pretty way using serde
    pub fn as_json_pretty(&self) -> Result<String, crate::error::HoldfastError> {
        serde_json::to_string_pretty(self).map_err(|e| {
            crate::error::HoldfastError::InternalError(format!("failed to serialize config: {e:?}"))
        })
    }

    /// Get a bindable SocketAddr for use in the DNS listeners
    pub fn dns_listener_address(&self) -> Result<SocketAddr, crate::error::HoldfastError> {
        self.listener_address(self.port)
    }

    pub fn tls_listener_address(&self) -> Result<SocketAddr, crate::error::HoldfastError> {
        self.listener_address(self.tls_port)
    }

    pub fn quic_listener_address(&self) -> Result<SocketAddr, crate::error::HoldfastError> {
        self.listener_address(self.quic_port)
    }

    pub fn api_listener_address(&self) -> Result<SocketAddr, crate::error::HoldfastError> {
        self.listener_address(self.api_port)
    }

    fn listener_address(&self, port: u16) -> Result<SocketAddr, crate::error::HoldfastError> {
        format!("{}:{}", self.address, port)
            .parse::<SocketAddr>()
            .map_err(|e| {
                crate::error::HoldfastError::StartupError(format!(
                    "failed to parse listener address: {e:?}"
                ))
            })
    }

    /// Load the certificate and key for the TLS-flavoured listeners.
    pub fn load_tls_identity(
        &self,
    ) -> Result<(Vec<rustls::pki_types::CertificateDer<'static>>, rustls::pki_types::PrivateKeyDer<'static>), crate::error::HoldfastError>
    {
        let certfile = std::fs::File::open(&self.tls_cert)?;
        let certs: Vec<_> = rustls_pemfile::certs(&mut std::io::BufReader::new(certfile))
            .collect::<Result<_, _>>()?;
        let keyfile = std::fs::File::open(&self.tls_key)?;
        let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(keyfile))?
            .ok_or_else(|| {
                crate::error::HoldfastError::StartupError(format!(
                    "no private key found in {:?}",
                    self.tls_key
                ))
            })?;
        Ok((certs, key))
    }

    pub async fn check_config(
        mut config: CowCellWriteTxn<'_, ConfigFile>,
    ) -> Result<(), Vec<String>> {
        let mut errors: Vec<String> = vec![];

        if config.tls_cert.starts_with("~") {
            config.tls_cert = PathBuf::from(
                shellexpand::tilde(&config.tls_cert.to_string_lossy()).to_string(),
            );
        }
        if config.tls_key.starts_with("~") {
            config.tls_key =
                PathBuf::from(shellexpand::tilde(&config.tls_key.to_string_lossy()).to_string());
        }

        let needs_tls = config.enable_tls || config.enable_quic || config.enable_api;
        if needs_tls && !config.tls_key.exists() {
            errors.push(format!("Failed to find TLS key file: {:?}", config.tls_key));
        }
        if needs_tls && !config.tls_cert.exists() {
            errors.push(format!(
                "Failed to find TLS cert file: {:?}",
                config.tls_cert
            ));
        }

        if config.upstreams.is_empty() {
            errors.push("No upstream resolvers configured".to_string());
        }
        for upstream in &config.upstreams {
            if let Err(err) = crate::upstream::UpstreamAddr::parse(upstream) {
                errors.push(format!("Failed to parse upstream {upstream:?}: {err}"));
            }
        }
        for (name, ip) in &config.local_hosts {
            if std::net::IpAddr::from_str(ip).is_err() {
                errors.push(format!("local_hosts entry {name:?} has a bad address {ip:?}"));
            }
        }

        config.commit().await;
        match errors.is_empty() {
            true => Ok(()),
            false => Err(errors),
        }
    }

    /// Uses [Self::try_from] and wraps it in a CowCell (moo)
    pub fn try_as_cowcell(
        config_path: Option<&String>,
    ) -> Result<CowCell<ConfigFile>, std::io::Error> {
        Ok(CowCell::new(ConfigFile::try_from(config_path)?))
    }

    /// Loads the configuration from a given file or from some default locations.
    ///
    /// The default locations are `~/.config/holdfast.json` and `./holdfast.json`.
    pub fn try_from(config_path: Option<&String>) -> Result<ConfigFile, std::io::Error> {
        let file_locations = match config_path {
            Some(value) => vec![value.to_owned()],
            None => CONFIG_LOCATIONS.iter().map(|x| x.to_string()).collect(),
        };

        // clean up the file paths and filter them by the ones that exist
        let found_files: Vec<String> = file_locations
            .iter()
            .filter_map(|f| {
                let path = shellexpand::tilde(&f).into_owned();
                let filepath = std::path::Path::new(&path);
                match filepath.exists() {
                    false => {
                        eprintln!("Config file {path} doesn't exist, skipping.");
                        None
                    }
                    true => Some(path),
                }
            })
            .collect();

        if found_files.is_empty() {
            eprintln!(
                "No configuration files exist, giving up! Tried: {}",
                file_locations.join(", ")
            );
            return Err(std::io::Error::new(
                ErrorKind::NotFound,
                "No configuration files found",
            ));
        }

        for filepath in found_files {
            let config_filename: String = shellexpand::tilde(&filepath).into_owned();

            let builder = Config::builder()
                .add_source(File::new(&config_filename, config::FileFormat::Json))
                .add_source(config::Environment::with_prefix("holdfast"));

            match builder.build() {
                Ok(config) => {
                    eprintln!("Successfully loaded config from: {}", config_filename);
                    return Ok(ConfigFile::from(config));
                }
                Err(err) => eprintln!("Couldn't load config from {config_filename}: {err:?}"),
            }
        }

        Ok(ConfigFile::default())
    }
}

impl Default for ConfigFile {
    fn default() -> Self {
        let hostname = gethostname().to_string_lossy().into_owned();
        Self {
            hostname,
            address: "127.0.0.1".to_string(),
            port: 15353,
            capture_packets: false,
            log_level: "INFO".to_string(),
            tcp_client_timeout: 5,
            max_connections_per_transport: 512,
            sqlite_path: String::from("~/.cache/holdfast.sqlite"),
            zone_file: None,
            upstreams: vec!["1.1.1.1".to_string(), "9.9.9.9".to_string()],
            client_upstreams: HashMap::new(),
            conditional_forwards: vec![],
            local_hosts: HashMap::new(),
            cache: CacheConfig::default(),
            rate_limit: RateLimitConfig::default(),
            block_page: BlockPageConfig::default(),
            dnssec_validation: false,
            ddns_enabled: false,
            ddns_allowed_nets: vec![],
            enable_tls: false,
            tls_port: 10853,
            enable_quic: false,
            quic_port: 10853,
            enable_api: false,
            api_port: 9000,
            tls_cert: PathBuf::from("./certificates/cert.pem"),
            tls_key: PathBuf::from("./certificates/key.pem"),
        }
    }
}

impl Display for ConfigFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let api_details = match self.enable_api {
            false => format!("enable_api={}", self.enable_api),
            true => format!(
                "enable_api={} api_port={} tls_cert={:?} tls_key={:?}",
                self.enable_api, self.api_port, self.tls_cert, self.tls_key
            ),
        };
        f.write_fmt(format_args!(
            "hostname=\"{}\" listening_address=\"{}:{}\" upstreams={:?} capturing_pcaps={} log_level={} {api_details}",
            self.hostname, self.address, self.port, self.upstreams, self.capture_packets, self.log_level,
        ))
    }
}

impl From<Config> for ConfigFile {
    fn from(config: Config) -> Self {
        macro_rules! field {
            ($name:literal, $field:ident) => {
                config.get($name).unwrap_or(Self::default().$field)
            };
        }
        ConfigFile {
            hostname: field!("hostname", hostname),
            address: field!("address", address),
            port: field!("port", port),
            capture_packets: field!("capture_packets", capture_packets),
            log_level: field!("log_level", log_level),
            tcp_client_timeout: field!("tcp_client_timeout", tcp_client_timeout),
            max_connections_per_transport: field!(
                "max_connections_per_transport",
                max_connections_per_transport
            ),
            sqlite_path: field!("sqlite_path", sqlite_path),
            zone_file: field!("zone_file", zone_file),
            upstreams: field!("upstreams", upstreams),
            client_upstreams: field!("client_upstreams", client_upstreams),
            conditional_forwards: field!("conditional_forwards", conditional_forwards),
            local_hosts: field!("local_hosts", local_hosts),
            cache: field!("cache", cache),
            rate_limit: field!("rate_limit", rate_limit),
            block_page: field!("block_page", block_page),
            dnssec_validation: field!("dnssec_validation", dnssec_validation),
            ddns_enabled: field!("ddns_enabled", ddns_enabled),
            ddns_allowed_nets: field!("ddns_allowed_nets", ddns_allowed_nets),
            enable_tls: field!("enable_tls", enable_tls),
            tls_port: field!("tls_port", tls_port),
            enable_quic: field!("enable_quic", enable_quic),
            quic_port: field!("quic_port", quic_port),
            enable_api: field!("enable_api", enable_api),
            api_port: field!("api_port", api_port),
            tls_cert: field!("tls_cert", tls_cert),
            tls_key: field!("tls_key", tls_key),
        }
    }
}

impl FromStr for ConfigFile {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let configfile = File::from_str(input, config::FileFormat::Json);
        let res = Config::builder()
            .add_source(configfile)
            .build()
            .map_err(|e| format!("{e:?}"))?;
        Ok(res.into())
    }
}

lazy_static! {
    static ref CONFIG_LOCATIONS: Vec<&'static str> =
        ["./holdfast.json", "~/.config/holdfast.json",].to_vec();
}

pub async fn setup_logging(
    config: CowCellReadTxn<ConfigFile>,
    clap_results: &ArgMatches,
) -> Result<LoggerHandle, std::io::Error> {
    // force the log level to info if we're testing config
    let log_level = match clap_results.get_flag("configcheck") {
        true => "info".to_string(),
        false => config.log_level.to_ascii_lowercase(),
    };

    let logger = flexi_logger::Logger::try_with_str(log_level)
        .map_err(|e| std::io::Error::other(format!("Failed to start logger! {e:?}")))?;

    logger
        .write_mode(flexi_logger::WriteMode::Async)
        .filter(Box::new(LogFilter {
            filters: vec!["h2", "hyper::proto", "rustls"],
        }))
        .set_palette("b1;3;2;6;5".to_string())
        .start()
        .map_err(|e| std::io::Error::other(format!("Failed to start logger! {e:?}")))
}

pub struct LogFilter {
    filters: Vec<&'static str>,
}

impl LogLineFilter for LogFilter {
    fn write(
        &self,
        now: &mut DeferredNow,
        record: &log::Record,
        log_line_writer: &dyn LogLineWriter,
    ) -> std::io::Result<()> {
        if self
            .filters
            .iter()
            .any(|r| record.metadata().target().starts_with(r))
        {
            return Ok(());
        }
        log_line_writer.write(now, record)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_json_string() {
        let config = ConfigFile::from_str(
            r#"{
                "address": "0.0.0.0",
                "port": 10053,
                "upstreams": ["tls://dns.quad9.net", "1.1.1.1"],
                "cache": {
                    "enabled": true,
                    "serve_stale": false,
                    "serve_stale_max_age": 600,
                    "prefetch_enabled": true,
                    "prefetch_threshold": 0.25,
                    "prefetch_min_queries": 3
                }
            }"#,
        )
        .expect("failed to parse config");
        assert_eq!(config.address, "0.0.0.0");
        assert_eq!(config.port, 10053);
        assert_eq!(config.upstreams.len(), 2);
        assert!(!config.cache.serve_stale);
        assert!(config.cache.prefetch_enabled);
        // untouched fields fall back to defaults
        assert_eq!(config.tcp_client_timeout, 5);
    }

    #[test]
    fn test_default_listener_address_parses() {
        let config = ConfigFile::default();
        assert!(config.dns_listener_address().is_ok());
    }
}
