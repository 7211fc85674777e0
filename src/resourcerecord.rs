use crate::enums::RecordType;
use crate::error::HoldfastError;
use crate::name::{check_long_labels, name_as_bytes, read_name, MAX_NAME_LENGTH};
use crate::zones::FileZoneRecord;

use core::fmt::Debug;
use log::*;
use regex::Regex;
use std::fmt::Display;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::string::FromUtf8Error;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

lazy_static! {
    static ref CAA_TAG_VALIDATOR: Regex = Regex::new(r"^[a-zA-Z0-9]+$").expect("static regex");
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DomainName {
    pub name: String,
}

impl DomainName {
    /// Push the DomainName through the name encoder.
    pub fn as_bytes(&self, compress_target: Option<u16>) -> Vec<u8> {
        name_as_bytes(&self.name, compress_target)
    }
}

impl From<&str> for DomainName {
    fn from(input: &str) -> Self {
        // RNAME-style addresses use @ for the first separator
        let name = match input.contains('@') {
            false => String::from(input),
            true => input.replace('@', "."),
        };
        DomainName {
            name: name.trim_end_matches('.').to_lowercase(),
        }
    }
}

impl From<String> for DomainName {
    fn from(name: String) -> Self {
        DomainName::from(name.as_str())
    }
}

impl TryFrom<&Vec<u8>> for DomainName {
    type Error = FromUtf8Error;

    fn try_from(input: &Vec<u8>) -> Result<Self, FromUtf8Error> {
        Ok(DomainName::from(String::from_utf8(input.to_owned())?))
    }
}

impl Display for DomainName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// <character-string> is a single length octet followed by that number of
/// characters, so 255 octets of payload at most.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct DNSCharString {
    pub data: Vec<u8>,
}

impl From<&str> for DNSCharString {
    fn from(input: &str) -> Self {
        DNSCharString { data: input.into() }
    }
}

impl DNSCharString {
    /// The length octet and then the string, truncated to fit.
    pub fn as_bytes(&self) -> Vec<u8> {
        let mut data = self.data.clone();
        data.truncate(255);
        let mut res: Vec<u8> = vec![data.len() as u8];
        res.extend(&data);
        res
    }
}

/// A parsed, typed resource record - the form zone storage and the
/// authoritative responder trade in. [crate::ResourceRecord] is the wire-level
/// twin; `as_bytes` here produces its rdata field.
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum InternalResourceRecord {
    /// A single host address
    A {
        address: Ipv4Addr,
        ttl: u32,
    },
    /// IPv6 host address, RFC 3596
    AAAA {
        address: Ipv6Addr,
        ttl: u32,
    },
    NS {
        nsdname: DomainName,
        ttl: u32,
    },
    CNAME {
        cname: DomainName,
        ttl: u32,
    },
    SOA {
        mname: DomainName,
        rname: DomainName,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
        ttl: u32,
    },
    PTR {
        ptrdname: DomainName,
        ttl: u32,
    },
    MX {
        preference: u16,
        exchange: DomainName,
        ttl: u32,
    },
    TXT {
        txtdata: Vec<u8>,
        ttl: u32,
    },
    SRV {
        priority: u16,
        weight: u16,
        port: u16,
        target: DomainName,
        ttl: u32,
    },
    /// RFC 8659
    CAA {
        flag: u8,
        tag: DNSCharString,
        value: Vec<u8>,
        ttl: u32,
    },
    NAPTR {
        order: u16,
        preference: u16,
        flags: DNSCharString,
        service: DNSCharString,
        regexp: DNSCharString,
        replacement: DomainName,
        ttl: u32,
    },
    /// RFC 4255
    SSHFP {
        algorithm: u8,
        fingerprint_type: u8,
        fingerprint: Vec<u8>,
        ttl: u32,
    },
    /// RFC 6698
    TLSA {
        cert_usage: u8,
        selector: u8,
        matching_type: u8,
        cert_data: Vec<u8>,
        ttl: u32,
    },
    /// RFC 9460 service binding
    SVCB {
        priority: u16,
        target: DomainName,
        params: Vec<SvcParam>,
        ttl: u32,
    },
    /// RFC 9460, the HTTPS-specific flavour of SVCB
    HTTPS {
        priority: u16,
        target: DomainName,
        params: Vec<SvcParam>,
        ttl: u32,
    },
    /// RFC 4034 zone key
    DNSKEY {
        flags: u16,
        protocol: u8,
        algorithm: u8,
        public_key: Vec<u8>,
        ttl: u32,
    },
    /// RFC 4034 signature over an RRset
    RRSIG {
        type_covered: u16,
        algorithm: u8,
        labels: u8,
        original_ttl: u32,
        expiration: u32,
        inception: u32,
        key_tag: u16,
        signer: DomainName,
        signature: Vec<u8>,
        ttl: u32,
    },
    InvalidType,
}

/// One SVCB/HTTPS key=value parameter, kept as wire-ready bytes.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct SvcParam {
    pub key: u16,
    pub value: Vec<u8>,
}

pub mod svc_param_keys {
    pub const ALPN: u16 = 1;
    pub const PORT: u16 = 3;
    pub const IPV4HINT: u16 = 4;
    pub const IPV6HINT: u16 = 6;
}

impl TryFrom<FileZoneRecord> for InternalResourceRecord {
    type Error = HoldfastError;

    /// Convert the textual rdata a zone stores into the typed form.
    fn try_from(record: FileZoneRecord) -> Result<Self, HoldfastError> {
        if check_long_labels(&record.name) {
            return Err(HoldfastError::InvalidValue(format!(
                "label over 63 octets in name {}",
                record.name
            )));
        }
        if record.name.len() > MAX_NAME_LENGTH {
            return Err(HoldfastError::InvalidValue(format!(
                "name {} over {MAX_NAME_LENGTH} octets",
                record.name
            )));
        }

        let ttl = record.ttl;
        match record.rrtype.as_str() {
            "A" => Ok(InternalResourceRecord::A {
                address: Ipv4Addr::from_str(&record.rdata).map_err(|e| {
                    HoldfastError::InvalidValue(format!(
                        "failed to parse {:?} as an IPv4 address: {e}",
                        record.rdata
                    ))
                })?,
                ttl,
            }),
            "AAAA" => Ok(InternalResourceRecord::AAAA {
                address: Ipv6Addr::from_str(&record.rdata).map_err(|e| {
                    HoldfastError::InvalidValue(format!(
                        "failed to parse {:?} as an IPv6 address: {e}",
                        record.rdata
                    ))
                })?,
                ttl,
            }),
            "NS" => Ok(InternalResourceRecord::NS {
                nsdname: DomainName::from(record.rdata),
                ttl,
            }),
            "CNAME" => Ok(InternalResourceRecord::CNAME {
                cname: DomainName::from(record.rdata),
                ttl,
            }),
            "PTR" => Ok(InternalResourceRecord::PTR {
                ptrdname: DomainName::from(record.rdata),
                ttl,
            }),
            "TXT" => Ok(InternalResourceRecord::TXT {
                txtdata: record.rdata.into_bytes(),
                ttl,
            }),
            "MX" => {
                // priority column wins, otherwise "10 mail.example.com" form
                let (preference, exchange) = match record.priority {
                    Some(pref) => (pref, record.rdata.as_str()),
                    None => {
                        let (pref, rest) = record.rdata.split_once(' ').ok_or_else(|| {
                            HoldfastError::InvalidValue(format!(
                                "MX rdata {:?} needs a preference",
                                record.rdata
                            ))
                        })?;
                        (parse_num(pref)?, rest)
                    }
                };
                Ok(InternalResourceRecord::MX {
                    preference,
                    exchange: DomainName::from(exchange),
                    ttl,
                })
            }
            "SOA" => {
                let fields: Vec<&str> = record.rdata.split_whitespace().collect();
                if fields.len() != 7 {
                    return Err(HoldfastError::InvalidValue(format!(
                        "SOA rdata needs 7 fields, got {}",
                        fields.len()
                    )));
                }
                Ok(InternalResourceRecord::SOA {
                    mname: DomainName::from(fields[0]),
                    rname: DomainName::from(fields[1]),
                    serial: parse_num(fields[2])?,
                    refresh: parse_num(fields[3])?,
                    retry: parse_num(fields[4])?,
                    expire: parse_num(fields[5])?,
                    minimum: parse_num(fields[6])?,
                    ttl,
                })
            }
            "SRV" => {
                let mut fields: Vec<&str> = record.rdata.split_whitespace().collect();
                let priority = match record.priority {
                    Some(p) => p,
                    None => {
                        if fields.len() != 4 {
                            return Err(HoldfastError::InvalidValue(
                                "SRV rdata needs priority weight port target".to_string(),
                            ));
                        }
                        parse_num(fields.remove(0))?
                    }
                };
                if fields.len() != 3 {
                    return Err(HoldfastError::InvalidValue(
                        "SRV rdata needs weight port target".to_string(),
                    ));
                }
                Ok(InternalResourceRecord::SRV {
                    priority,
                    weight: parse_num(fields[0])?,
                    port: parse_num(fields[1])?,
                    target: DomainName::from(fields[2]),
                    ttl,
                })
            }
            "CAA" => {
                let fields: Vec<&str> = record.rdata.splitn(3, ' ').collect();
                if fields.len() != 3 {
                    return Err(HoldfastError::InvalidValue(
                        "CAA rdata needs flags tag value".to_string(),
                    ));
                }
                let tag = fields[1];
                if !CAA_TAG_VALIDATOR.is_match(tag) {
                    return Err(HoldfastError::InvalidValue(format!(
                        "CAA tag {tag:?} has characters outside a-z A-Z 0-9"
                    )));
                }
                Ok(InternalResourceRecord::CAA {
                    flag: parse_num(fields[0])?,
                    tag: DNSCharString::from(tag),
                    value: fields[2].trim_matches('"').as_bytes().to_vec(),
                    ttl,
                })
            }
            "NAPTR" => {
                let fields: Vec<&str> = record.rdata.split_whitespace().collect();
                if fields.len() != 6 {
                    return Err(HoldfastError::InvalidValue(
                        "NAPTR rdata needs order preference flags service regexp replacement"
                            .to_string(),
                    ));
                }
                Ok(InternalResourceRecord::NAPTR {
                    order: parse_num(fields[0])?,
                    preference: parse_num(fields[1])?,
                    flags: DNSCharString::from(fields[2].trim_matches('"')),
                    service: DNSCharString::from(fields[3].trim_matches('"')),
                    regexp: DNSCharString::from(fields[4].trim_matches('"')),
                    replacement: DomainName::from(fields[5]),
                    ttl,
                })
            }
            "SSHFP" => {
                let fields: Vec<&str> = record.rdata.split_whitespace().collect();
                if fields.len() != 3 {
                    return Err(HoldfastError::InvalidValue(
                        "SSHFP rdata needs algorithm fptype fingerprint".to_string(),
                    ));
                }
                Ok(InternalResourceRecord::SSHFP {
                    algorithm: parse_num(fields[0])?,
                    fingerprint_type: parse_num(fields[1])?,
                    fingerprint: hex::decode(fields[2]).map_err(|e| {
                        HoldfastError::InvalidValue(format!("SSHFP fingerprint isn't hex: {e}"))
                    })?,
                    ttl,
                })
            }
            "TLSA" => {
                let fields: Vec<&str> = record.rdata.split_whitespace().collect();
                if fields.len() != 4 {
                    return Err(HoldfastError::InvalidValue(
                        "TLSA rdata needs usage selector matching certdata".to_string(),
                    ));
                }
                Ok(InternalResourceRecord::TLSA {
                    cert_usage: parse_num(fields[0])?,
                    selector: parse_num(fields[1])?,
                    matching_type: parse_num(fields[2])?,
                    cert_data: hex::decode(fields[3]).map_err(|e| {
                        HoldfastError::InvalidValue(format!("TLSA cert data isn't hex: {e}"))
                    })?,
                    ttl,
                })
            }
            "SVCB" | "HTTPS" => {
                let mut fields = record.rdata.split_whitespace();
                let priority: u16 = parse_num(fields.next().ok_or_else(|| {
                    HoldfastError::InvalidValue("SVCB rdata needs a priority".to_string())
                })?)?;
                let target = DomainName::from(fields.next().ok_or_else(|| {
                    HoldfastError::InvalidValue("SVCB rdata needs a target".to_string())
                })?);
                let mut params = vec![];
                for field in fields {
                    params.push(parse_svc_param(field)?);
                }
                params.sort_by_key(|p| p.key);
                match record.rrtype.as_str() {
                    "SVCB" => Ok(InternalResourceRecord::SVCB {
                        priority,
                        target,
                        params,
                        ttl,
                    }),
                    _ => Ok(InternalResourceRecord::HTTPS {
                        priority,
                        target,
                        params,
                        ttl,
                    }),
                }
            }
            "DNSKEY" => {
                let fields: Vec<&str> = record.rdata.split_whitespace().collect();
                if fields.len() != 4 {
                    return Err(HoldfastError::InvalidValue(
                        "DNSKEY rdata needs flags protocol algorithm key".to_string(),
                    ));
                }
                Ok(InternalResourceRecord::DNSKEY {
                    flags: parse_num(fields[0])?,
                    protocol: parse_num(fields[1])?,
                    algorithm: parse_num(fields[2])?,
                    public_key: BASE64.decode(fields[3]).map_err(|e| {
                        HoldfastError::InvalidValue(format!("DNSKEY key isn't base64: {e}"))
                    })?,
                    ttl,
                })
            }
            "RRSIG" => {
                let fields: Vec<&str> = record.rdata.split_whitespace().collect();
                if fields.len() != 9 {
                    return Err(HoldfastError::InvalidValue(
                        "RRSIG rdata needs 9 fields".to_string(),
                    ));
                }
                Ok(InternalResourceRecord::RRSIG {
                    type_covered: RecordType::from(fields[0]) as u16,
                    algorithm: parse_num(fields[1])?,
                    labels: parse_num(fields[2])?,
                    original_ttl: parse_num(fields[3])?,
                    expiration: parse_num(fields[4])?,
                    inception: parse_num(fields[5])?,
                    key_tag: parse_num(fields[6])?,
                    signer: DomainName::from(fields[7]),
                    signature: BASE64.decode(fields[8]).map_err(|e| {
                        HoldfastError::InvalidValue(format!("RRSIG signature isn't base64: {e}"))
                    })?,
                    ttl,
                })
            }
            other => {
                error!("refusing to build a record of unknown type {other:?}");
                Err(HoldfastError::InvalidValue(format!(
                    "unknown record type {other:?}"
                )))
            }
        }
    }
}

fn parse_num<T: FromStr>(input: &str) -> Result<T, HoldfastError>
where
    <T as FromStr>::Err: Display,
{
    input
        .parse::<T>()
        .map_err(|e| HoldfastError::InvalidValue(format!("failed to parse {input:?}: {e}")))
}

fn parse_svc_param(field: &str) -> Result<SvcParam, HoldfastError> {
    use svc_param_keys::*;
    let (key, value) = field.split_once('=').ok_or_else(|| {
        HoldfastError::InvalidValue(format!("SVCB param {field:?} needs key=value form"))
    })?;
    match key {
        "alpn" => {
            let mut out = vec![];
            for proto in value.split(',') {
                out.extend(DNSCharString::from(proto).as_bytes());
            }
            Ok(SvcParam { key: ALPN, value: out })
        }
        "port" => {
            let port: u16 = parse_num(value)?;
            Ok(SvcParam {
                key: PORT,
                value: port.to_be_bytes().to_vec(),
            })
        }
        "ipv4hint" => {
            let mut out = vec![];
            for addr in value.split(',') {
                out.extend(
                    Ipv4Addr::from_str(addr)
                        .map_err(|e| {
                            HoldfastError::InvalidValue(format!("bad ipv4hint {addr:?}: {e}"))
                        })?
                        .octets(),
                );
            }
            Ok(SvcParam {
                key: IPV4HINT,
                value: out,
            })
        }
        "ipv6hint" => {
            let mut out = vec![];
            for addr in value.split(',') {
                out.extend(
                    Ipv6Addr::from_str(addr)
                        .map_err(|e| {
                            HoldfastError::InvalidValue(format!("bad ipv6hint {addr:?}: {e}"))
                        })?
                        .octets(),
                );
            }
            Ok(SvcParam {
                key: IPV6HINT,
                value: out,
            })
        }
        other => {
            // keyNNNNN=hex escape hatch for params we don't spell
            let stripped = other.strip_prefix("key").ok_or_else(|| {
                HoldfastError::InvalidValue(format!("unknown SVCB param key {other:?}"))
            })?;
            Ok(SvcParam {
                key: parse_num(stripped)?,
                value: hex::decode(value).map_err(|e| {
                    HoldfastError::InvalidValue(format!("SVCB param {other:?} isn't hex: {e}"))
                })?,
            })
        }
    }
}

impl InternalResourceRecord {
    pub fn is_type(&self, rrtype: RecordType) -> bool {
        self.record_type() == rrtype
    }

    pub fn record_type(&self) -> RecordType {
        match self {
            InternalResourceRecord::A { .. } => RecordType::A,
            InternalResourceRecord::AAAA { .. } => RecordType::AAAA,
            InternalResourceRecord::NS { .. } => RecordType::NS,
            InternalResourceRecord::CNAME { .. } => RecordType::CNAME,
            InternalResourceRecord::SOA { .. } => RecordType::SOA,
            InternalResourceRecord::PTR { .. } => RecordType::PTR,
            InternalResourceRecord::MX { .. } => RecordType::MX,
            InternalResourceRecord::TXT { .. } => RecordType::TXT,
            InternalResourceRecord::SRV { .. } => RecordType::SRV,
            InternalResourceRecord::CAA { .. } => RecordType::CAA,
            InternalResourceRecord::NAPTR { .. } => RecordType::NAPTR,
            InternalResourceRecord::SSHFP { .. } => RecordType::SSHFP,
            InternalResourceRecord::TLSA { .. } => RecordType::TLSA,
            InternalResourceRecord::SVCB { .. } => RecordType::SVCB,
            InternalResourceRecord::HTTPS { .. } => RecordType::HTTPS,
            InternalResourceRecord::DNSKEY { .. } => RecordType::DNSKEY,
            InternalResourceRecord::RRSIG { .. } => RecordType::RRSIG,
            InternalResourceRecord::InvalidType => RecordType::InvalidType,
        }
    }

    pub fn ttl(&self) -> u32 {
        match self {
            InternalResourceRecord::A { ttl, .. }
            | InternalResourceRecord::AAAA { ttl, .. }
            | InternalResourceRecord::NS { ttl, .. }
            | InternalResourceRecord::CNAME { ttl, .. }
            | InternalResourceRecord::SOA { ttl, .. }
            | InternalResourceRecord::PTR { ttl, .. }
            | InternalResourceRecord::MX { ttl, .. }
            | InternalResourceRecord::TXT { ttl, .. }
            | InternalResourceRecord::SRV { ttl, .. }
            | InternalResourceRecord::CAA { ttl, .. }
            | InternalResourceRecord::NAPTR { ttl, .. }
            | InternalResourceRecord::SSHFP { ttl, .. }
            | InternalResourceRecord::TLSA { ttl, .. }
            | InternalResourceRecord::SVCB { ttl, .. }
            | InternalResourceRecord::HTTPS { ttl, .. }
            | InternalResourceRecord::DNSKEY { ttl, .. }
            | InternalResourceRecord::RRSIG { ttl, .. } => *ttl,
            InternalResourceRecord::InvalidType => 0,
        }
    }

    /// Wire rdata for this record.
    pub fn as_bytes(&self) -> Result<Vec<u8>, HoldfastError> {
        let res = match self {
            InternalResourceRecord::A { address, .. } => address.octets().to_vec(),
            InternalResourceRecord::AAAA { address, .. } => address.octets().to_vec(),
            InternalResourceRecord::NS { nsdname, .. } => nsdname.as_bytes(None),
            InternalResourceRecord::CNAME { cname, .. } => cname.as_bytes(None),
            InternalResourceRecord::PTR { ptrdname, .. } => ptrdname.as_bytes(None),
            InternalResourceRecord::SOA {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
                ..
            } => {
                let mut out = mname.as_bytes(None);
                out.extend(rname.as_bytes(None));
                out.extend(serial.to_be_bytes());
                out.extend(refresh.to_be_bytes());
                out.extend(retry.to_be_bytes());
                out.extend(expire.to_be_bytes());
                out.extend(minimum.to_be_bytes());
                out
            }
            InternalResourceRecord::MX {
                preference,
                exchange,
                ..
            } => {
                let mut out = preference.to_be_bytes().to_vec();
                out.extend(exchange.as_bytes(None));
                out
            }
            InternalResourceRecord::TXT { txtdata, .. } => {
                // a sequence of length-prefixed character strings
                let mut out = vec![];
                for chunk in txtdata.chunks(255) {
                    out.push(chunk.len() as u8);
                    out.extend(chunk);
                }
                if txtdata.is_empty() {
                    out.push(0);
                }
                out
            }
            InternalResourceRecord::SRV {
                priority,
                weight,
                port,
                target,
                ..
            } => {
                let mut out = priority.to_be_bytes().to_vec();
                out.extend(weight.to_be_bytes());
                out.extend(port.to_be_bytes());
                out.extend(target.as_bytes(None));
                out
            }
            InternalResourceRecord::CAA {
                flag, tag, value, ..
            } => {
                let mut out = vec![*flag];
                out.extend(tag.as_bytes());
                out.extend(value);
                out
            }
            InternalResourceRecord::NAPTR {
                order,
                preference,
                flags,
                service,
                regexp,
                replacement,
                ..
            } => {
                let mut out = order.to_be_bytes().to_vec();
                out.extend(preference.to_be_bytes());
                out.extend(flags.as_bytes());
                out.extend(service.as_bytes());
                out.extend(regexp.as_bytes());
                out.extend(replacement.as_bytes(None));
                out
            }
            InternalResourceRecord::SSHFP {
                algorithm,
                fingerprint_type,
                fingerprint,
                ..
            } => {
                let mut out = vec![*algorithm, *fingerprint_type];
                out.extend(fingerprint);
                out
            }
            InternalResourceRecord::TLSA {
                cert_usage,
                selector,
                matching_type,
                cert_data,
                ..
            } => {
                let mut out = vec![*cert_usage, *selector, *matching_type];
                out.extend(cert_data);
                out
            }
            InternalResourceRecord::SVCB {
                priority,
                target,
                params,
                ..
            }
            | InternalResourceRecord::HTTPS {
                priority,
                target,
                params,
                ..
            } => {
                let mut out = priority.to_be_bytes().to_vec();
                out.extend(target.as_bytes(None));
                for param in params {
                    out.extend(param.key.to_be_bytes());
                    out.extend((param.value.len() as u16).to_be_bytes());
                    out.extend(&param.value);
                }
                out
            }
            InternalResourceRecord::DNSKEY {
                flags,
                protocol,
                algorithm,
                public_key,
                ..
            } => {
                let mut out = flags.to_be_bytes().to_vec();
                out.push(*protocol);
                out.push(*algorithm);
                out.extend(public_key);
                out
            }
            InternalResourceRecord::RRSIG {
                type_covered,
                algorithm,
                labels,
                original_ttl,
                expiration,
                inception,
                key_tag,
                signer,
                signature,
                ..
            } => {
                let mut out = type_covered.to_be_bytes().to_vec();
                out.push(*algorithm);
                out.push(*labels);
                out.extend(original_ttl.to_be_bytes());
                out.extend(expiration.to_be_bytes());
                out.extend(inception.to_be_bytes());
                out.extend(key_tag.to_be_bytes());
                out.extend(signer.as_bytes(None));
                out.extend(signature);
                out
            }
            InternalResourceRecord::InvalidType => {
                return Err(HoldfastError::InvalidValue(
                    "can't encode an invalid record".to_string(),
                ))
            }
        };
        Ok(res)
    }

    /// Parse wire rdata (already decompressed) back into the typed form.
    pub fn from_wire(rrtype: RecordType, ttl: u32, rdata: &[u8]) -> Result<Self, HoldfastError> {
        let short = || HoldfastError::MalformedMessage(format!("short {rrtype} rdata"));
        match rrtype {
            RecordType::A => {
                let octets: [u8; 4] = rdata.try_into().map_err(|_| short())?;
                Ok(InternalResourceRecord::A {
                    address: Ipv4Addr::from(octets),
                    ttl,
                })
            }
            RecordType::AAAA => {
                let octets: [u8; 16] = rdata.try_into().map_err(|_| short())?;
                Ok(InternalResourceRecord::AAAA {
                    address: Ipv6Addr::from(octets),
                    ttl,
                })
            }
            RecordType::NS => Ok(InternalResourceRecord::NS {
                nsdname: read_rdata_name(rdata)?,
                ttl,
            }),
            RecordType::CNAME => Ok(InternalResourceRecord::CNAME {
                cname: read_rdata_name(rdata)?,
                ttl,
            }),
            RecordType::PTR => Ok(InternalResourceRecord::PTR {
                ptrdname: read_rdata_name(rdata)?,
                ttl,
            }),
            RecordType::SOA => {
                let (mname, after_mname) = read_uncompressed_name(rdata, 0)?;
                let (rname, after_rname) = read_uncompressed_name(rdata, after_mname)?;
                let tail = rdata.get(after_rname..after_rname + 20).ok_or_else(short)?;
                Ok(InternalResourceRecord::SOA {
                    mname,
                    rname,
                    serial: be_u32(&tail[0..4]),
                    refresh: be_u32(&tail[4..8]),
                    retry: be_u32(&tail[8..12]),
                    expire: be_u32(&tail[12..16]),
                    minimum: be_u32(&tail[16..20]),
                    ttl,
                })
            }
            RecordType::MX => {
                if rdata.len() < 3 {
                    return Err(short());
                }
                Ok(InternalResourceRecord::MX {
                    preference: u16::from_be_bytes([rdata[0], rdata[1]]),
                    exchange: read_uncompressed_name(rdata, 2)?.0,
                    ttl,
                })
            }
            RecordType::TXT => {
                let mut txtdata = vec![];
                let mut pos = 0;
                while pos < rdata.len() {
                    let len = rdata[pos] as usize;
                    let chunk = rdata.get(pos + 1..pos + 1 + len).ok_or_else(short)?;
                    txtdata.extend(chunk);
                    pos += 1 + len;
                }
                Ok(InternalResourceRecord::TXT { txtdata, ttl })
            }
            RecordType::SRV => {
                if rdata.len() < 7 {
                    return Err(short());
                }
                Ok(InternalResourceRecord::SRV {
                    priority: u16::from_be_bytes([rdata[0], rdata[1]]),
                    weight: u16::from_be_bytes([rdata[2], rdata[3]]),
                    port: u16::from_be_bytes([rdata[4], rdata[5]]),
                    target: read_uncompressed_name(rdata, 6)?.0,
                    ttl,
                })
            }
            RecordType::CAA => {
                if rdata.len() < 2 {
                    return Err(short());
                }
                let tag_len = rdata[1] as usize;
                let tag = rdata.get(2..2 + tag_len).ok_or_else(short)?;
                Ok(InternalResourceRecord::CAA {
                    flag: rdata[0],
                    tag: DNSCharString {
                        data: tag.to_vec(),
                    },
                    value: rdata[2 + tag_len..].to_vec(),
                    ttl,
                })
            }
            RecordType::NAPTR => {
                if rdata.len() < 4 {
                    return Err(short());
                }
                let (flags, pos) = read_charstring(rdata, 4)?;
                let (service, pos) = read_charstring(rdata, pos)?;
                let (regexp, pos) = read_charstring(rdata, pos)?;
                Ok(InternalResourceRecord::NAPTR {
                    order: u16::from_be_bytes([rdata[0], rdata[1]]),
                    preference: u16::from_be_bytes([rdata[2], rdata[3]]),
                    flags,
                    service,
                    regexp,
                    replacement: read_uncompressed_name(rdata, pos)?.0,
                    ttl,
                })
            }
            RecordType::SSHFP => {
                if rdata.len() < 2 {
                    return Err(short());
                }
                Ok(InternalResourceRecord::SSHFP {
                    algorithm: rdata[0],
                    fingerprint_type: rdata[1],
                    fingerprint: rdata[2..].to_vec(),
                    ttl,
                })
            }
            RecordType::TLSA => {
                if rdata.len() < 3 {
                    return Err(short());
                }
                Ok(InternalResourceRecord::TLSA {
                    cert_usage: rdata[0],
                    selector: rdata[1],
                    matching_type: rdata[2],
                    cert_data: rdata[3..].to_vec(),
                    ttl,
                })
            }
            RecordType::SVCB | RecordType::HTTPS => {
                if rdata.len() < 2 {
                    return Err(short());
                }
                let priority = u16::from_be_bytes([rdata[0], rdata[1]]);
                let (target, mut pos) = read_uncompressed_name(rdata, 2)?;
                let mut params = vec![];
                while pos < rdata.len() {
                    let head = rdata.get(pos..pos + 4).ok_or_else(short)?;
                    let key = u16::from_be_bytes([head[0], head[1]]);
                    let len = u16::from_be_bytes([head[2], head[3]]) as usize;
                    let value = rdata.get(pos + 4..pos + 4 + len).ok_or_else(short)?;
                    params.push(SvcParam {
                        key,
                        value: value.to_vec(),
                    });
                    pos += 4 + len;
                }
                match rrtype {
                    RecordType::SVCB => Ok(InternalResourceRecord::SVCB {
                        priority,
                        target,
                        params,
                        ttl,
                    }),
                    _ => Ok(InternalResourceRecord::HTTPS {
                        priority,
                        target,
                        params,
                        ttl,
                    }),
                }
            }
            RecordType::DNSKEY => {
                if rdata.len() < 4 {
                    return Err(short());
                }
                Ok(InternalResourceRecord::DNSKEY {
                    flags: u16::from_be_bytes([rdata[0], rdata[1]]),
                    protocol: rdata[2],
                    algorithm: rdata[3],
                    public_key: rdata[4..].to_vec(),
                    ttl,
                })
            }
            RecordType::RRSIG => {
                if rdata.len() < 18 {
                    return Err(short());
                }
                let (signer, after_signer) = read_uncompressed_name(rdata, 18)?;
                Ok(InternalResourceRecord::RRSIG {
                    type_covered: u16::from_be_bytes([rdata[0], rdata[1]]),
                    algorithm: rdata[2],
                    labels: rdata[3],
                    original_ttl: be_u32(&rdata[4..8]),
                    expiration: be_u32(&rdata[8..12]),
                    inception: be_u32(&rdata[12..16]),
                    key_tag: u16::from_be_bytes([rdata[16], rdata[17]]),
                    signer,
                    signature: rdata[after_signer..].to_vec(),
                    ttl,
                })
            }
            other => Err(HoldfastError::InvalidValue(format!(
                "no typed form for {other:?}"
            ))),
        }
    }
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// The textual form of one SVCB parameter, the inverse of [parse_svc_param].
fn format_svc_param(param: &SvcParam) -> String {
    use svc_param_keys::*;
    match param.key {
        ALPN => {
            let mut protos = vec![];
            let mut pos = 0;
            while pos < param.value.len() {
                let len = param.value[pos] as usize;
                match param.value.get(pos + 1..pos + 1 + len) {
                    Some(proto) => protos.push(String::from_utf8_lossy(proto).to_string()),
                    None => break,
                }
                pos += 1 + len;
            }
            format!("alpn={}", protos.join(","))
        }
        PORT if param.value.len() == 2 => {
            format!("port={}", u16::from_be_bytes([param.value[0], param.value[1]]))
        }
        IPV4HINT if param.value.len() % 4 == 0 => {
            let hints: Vec<String> = param
                .value
                .chunks(4)
                .map(|c| Ipv4Addr::new(c[0], c[1], c[2], c[3]).to_string())
                .collect();
            format!("ipv4hint={}", hints.join(","))
        }
        IPV6HINT if param.value.len() % 16 == 0 => {
            let hints: Vec<String> = param
                .value
                .chunks(16)
                .map(|c| {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(c);
                    Ipv6Addr::from(octets).to_string()
                })
                .collect();
            format!("ipv6hint={}", hints.join(","))
        }
        key => format!("key{key}={}", hex::encode(&param.value)),
    }
}

/// Read a name sitting alone in an rdata buffer.
fn read_rdata_name(rdata: &[u8]) -> Result<DomainName, HoldfastError> {
    Ok(read_uncompressed_name(rdata, 0)?.0)
}

/// Names in stored rdata are never compressed, so read labels directly.
fn read_uncompressed_name(
    rdata: &[u8],
    start: usize,
) -> Result<(DomainName, usize), HoldfastError> {
    // pad a fake header so the shared reader's offset rules hold
    let mut buf = vec![0u8; crate::HEADER_BYTES];
    buf.extend(rdata);
    let (name, after) = read_name(&buf, crate::HEADER_BYTES + start)?;
    Ok((DomainName { name }, after - crate::HEADER_BYTES))
}

fn read_charstring(rdata: &[u8], start: usize) -> Result<(DNSCharString, usize), HoldfastError> {
    let len = *rdata
        .get(start)
        .ok_or_else(|| HoldfastError::MalformedMessage("short character-string".to_string()))?
        as usize;
    let data = rdata
        .get(start + 1..start + 1 + len)
        .ok_or_else(|| HoldfastError::MalformedMessage("short character-string".to_string()))?;
    Ok((
        DNSCharString {
            data: data.to_vec(),
        },
        start + 1 + len,
    ))
}

impl Display for InternalResourceRecord {
    /// Textual rdata, the inverse of [TryFrom<FileZoneRecord>].
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InternalResourceRecord::A { address, .. } => write!(f, "{address}"),
            InternalResourceRecord::AAAA { address, .. } => write!(f, "{address}"),
            InternalResourceRecord::NS { nsdname, .. } => write!(f, "{nsdname}"),
            InternalResourceRecord::CNAME { cname, .. } => write!(f, "{cname}"),
            InternalResourceRecord::PTR { ptrdname, .. } => write!(f, "{ptrdname}"),
            InternalResourceRecord::SOA {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
                ..
            } => write!(
                f,
                "{mname} {rname} {serial} {refresh} {retry} {expire} {minimum}"
            ),
            InternalResourceRecord::MX {
                preference,
                exchange,
                ..
            } => write!(f, "{preference} {exchange}"),
            InternalResourceRecord::TXT { txtdata, .. } => {
                write!(f, "{}", String::from_utf8_lossy(txtdata))
            }
            InternalResourceRecord::SRV {
                priority,
                weight,
                port,
                target,
                ..
            } => write!(f, "{priority} {weight} {port} {target}"),
            InternalResourceRecord::CAA {
                flag, tag, value, ..
            } => write!(
                f,
                "{flag} {} \"{}\"",
                String::from_utf8_lossy(&tag.data),
                String::from_utf8_lossy(value)
            ),
            InternalResourceRecord::NAPTR {
                order,
                preference,
                flags,
                service,
                regexp,
                replacement,
                ..
            } => write!(
                f,
                "{order} {preference} \"{}\" \"{}\" \"{}\" {replacement}",
                String::from_utf8_lossy(&flags.data),
                String::from_utf8_lossy(&service.data),
                String::from_utf8_lossy(&regexp.data)
            ),
            InternalResourceRecord::SSHFP {
                algorithm,
                fingerprint_type,
                fingerprint,
                ..
            } => write!(
                f,
                "{algorithm} {fingerprint_type} {}",
                hex::encode(fingerprint)
            ),
            InternalResourceRecord::TLSA {
                cert_usage,
                selector,
                matching_type,
                cert_data,
                ..
            } => write!(
                f,
                "{cert_usage} {selector} {matching_type} {}",
                hex::encode(cert_data)
            ),
            InternalResourceRecord::SVCB {
                priority,
                target,
                params,
                ..
            }
            | InternalResourceRecord::HTTPS {
                priority,
                target,
                params,
                ..
            } => {
                let target = match target.name.is_empty() {
                    true => ".",
                    false => target.name.as_str(),
                };
                write!(f, "{priority} {target}")?;
                for param in params {
                    write!(f, " {}", format_svc_param(param))?;
                }
                Ok(())
            }
            InternalResourceRecord::DNSKEY {
                flags,
                protocol,
                algorithm,
                public_key,
                ..
            } => write!(
                f,
                "{flags} {protocol} {algorithm} {}",
                BASE64.encode(public_key)
            ),
            InternalResourceRecord::RRSIG {
                type_covered,
                algorithm,
                labels,
                original_ttl,
                expiration,
                inception,
                key_tag,
                signer,
                signature,
                ..
            } => write!(
                f,
                "{} {algorithm} {labels} {original_ttl} {expiration} {inception} {key_tag} {signer} {}",
                RecordType::from(*type_covered),
                BASE64.encode(signature)
            ),
            InternalResourceRecord::InvalidType => write!(f, ""),
        }
    }
}
