use crate::enums::RecordType;
use crate::error::HoldfastError;
use crate::name::name_in_domain;
use crate::resourcerecord::{DomainName, InternalResourceRecord};
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// A zone we are authoritative for. The SOA fields live here; the records
/// and keys sit in their own tables keyed by the zone id.
#[derive(Debug, Clone, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct FileZone {
    #[serde(default)]
    pub id: Option<i64>,
    /// The zone apex, eg `mydomain.test`
    pub name: String,
    /// MNAME, the primary name server for this zone
    #[serde(default)]
    pub mname: String,
    /// RNAME, the mailbox of the person responsible for this zone
    #[serde(default = "rname_default")]
    pub rname: String,
    /// The unsigned 32 bit version number of the original copy of the zone.
    /// Every successful dynamic update bumps this by exactly one.
    #[serde(default)]
    pub serial: u32,
    #[serde(default = "refresh_default")]
    pub refresh: u32,
    #[serde(default = "retry_default")]
    pub retry: u32,
    #[serde(default = "expire_default")]
    pub expire: u32,
    #[serde(default = "minimum_default")]
    pub minimum: u32,
    #[serde(default)]
    pub records: Vec<FileZoneRecord>,
}

/// default RNAME value for zones that don't set one
pub fn rname_default() -> String {
    String::from("hostmaster.invalid")
}
fn refresh_default() -> u32 {
    3600
}
fn retry_default() -> u32 {
    900
}
fn expire_default() -> u32 {
    604800
}
fn minimum_default() -> u32 {
    300
}

impl FileZone {
    /// Does this zone cover `name`? Matches the apex itself and anything
    /// below it.
    pub fn covers(&self, name: &str) -> bool {
        name_in_domain(name, &self.name)
    }

    /// Strip the zone suffix from a fully qualified name, apex becomes `@`.
    pub fn relative_owner(&self, fqdn: &str) -> String {
        if fqdn == self.name {
            return "@".to_string();
        }
        fqdn.trim_end_matches(&format!(".{}", self.name)).to_string()
    }

    /// Rebuild the fully qualified name for a stored owner.
    pub fn fqdn(&self, owner: &str) -> String {
        match owner {
            "@" => self.name.clone(),
            other => format!("{}.{}", other, self.name),
        }
    }

    /// The zone's SOA in typed-record form.
    pub fn soa(&self) -> InternalResourceRecord {
        InternalResourceRecord::SOA {
            mname: DomainName::from(self.mname.as_str()),
            rname: DomainName::from(self.rname.as_str()),
            serial: self.serial,
            refresh: self.refresh,
            retry: self.retry,
            expire: self.expire,
            minimum: self.minimum,
            ttl: self.minimum,
        }
    }
}

impl Display for FileZone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "zone={} serial={} records={}",
            self.name,
            self.serial,
            self.records.len()
        ))
    }
}

/// One record within a zone, rdata in textual form.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct FileZoneRecord {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub zoneid: Option<i64>,
    /// Owner relative to the zone; the apex is spelled `@`.
    pub name: String,
    pub rrtype: String,
    pub rdata: String,
    #[serde(default = "minimum_default")]
    pub ttl: u32,
    /// MX preference / SRV priority when the rdata doesn't carry it
    #[serde(default)]
    pub priority: Option<u16>,
}

impl Display for FileZoneRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "{} {} {} {}",
            self.name, self.ttl, self.rrtype, self.rdata
        ))
    }
}

impl FileZoneRecord {
    pub fn record_type(&self) -> RecordType {
        RecordType::from(self.rrtype.as_str())
    }
}

/// A DNSSEC key attached to a zone. Flags 256 = ZSK, 257 = KSK.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct ZoneKey {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub zoneid: Option<i64>,
    /// DNSSEC algorithm number: 8, 10, 13 or 15
    pub algorithm: u8,
    pub flags: u16,
    pub key_tag: u16,
    /// base64 pkcs8 private key material
    pub private_key: String,
    /// base64 public key, as it appears in the DNSKEY rdata
    pub public_key: String,
    #[serde(default = "active_default")]
    pub active: bool,
}

fn active_default() -> bool {
    true
}

pub const FLAG_ZSK: u16 = 256;
pub const FLAG_KSK: u16 = 257;

impl ZoneKey {
    pub fn is_zsk(&self) -> bool {
        self.flags == FLAG_ZSK
    }

    /// The DNSKEY record for this key.
    pub fn dnskey(&self, ttl: u32) -> Result<InternalResourceRecord, HoldfastError> {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        Ok(InternalResourceRecord::DNSKEY {
            flags: self.flags,
            protocol: 3,
            algorithm: self.algorithm,
            public_key: STANDARD.decode(&self.public_key).map_err(|e| {
                HoldfastError::InvalidValue(format!("zone key public key isn't base64: {e}"))
            })?,
            ttl,
        })
    }
}

/// A TSIG shared secret, looked up by key name during dynamic updates.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct TsigKey {
    #[serde(default)]
    pub id: Option<i64>,
    /// Key name, a domain name on the wire
    pub name: String,
    /// eg `hmac-sha256`
    pub algorithm: String,
    /// base64 shared secret
    pub secret: String,
}
