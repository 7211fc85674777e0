use enum_iterator::Sequence;
use packed_struct::prelude::*;
use serde::{Deserialize, Serialize, Serializer};
use sqlx::encode::IsNull;
use sqlx::sqlite::SqliteArgumentValue;
use std::fmt::Display;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Agent {
    Datastore,
    UDPServer,
    TCPServer,
    TLSServer,
    QuicServer,
    API,
}

#[derive(Clone, Debug)]
pub enum AgentState {
    Started { agent: Agent },
    Stopped { agent: Agent },
}

#[derive(Debug, Eq, PartialEq, PrimitiveEnum_u8, Copy, Clone)]
/// A four bit field that specifies kind of query in this message.
/// This value is set by the originator of a query and copied into the response.
pub enum OpCode {
    /// A standard query (QUERY)
    Query = 0,
    // IQuery = 1, obsolete per RFC 3425
    /// Server status request (STATUS)
    Status = 2,
    /// NOTIFY (RFC 1996)
    Notify = 4,
    /// Dynamic update (RFC 2136)
    Update = 5,
    /// 3, 6-15 reserved for future use
    Reserved = 15,
}

impl From<u8> for OpCode {
    fn from(input: u8) -> Self {
        match input {
            0 => Self::Query,
            2 => Self::Status,
            4 => Self::Notify,
            5 => Self::Update,
            _ => Self::Reserved,
        }
    }
}

#[derive(PrimitiveEnum_u8, Clone, Copy, Debug, Eq, PartialEq)]
/// Response code: NOERROR, SERVFAIL, NXDOMAIN and friends.
pub enum Rcode {
    NoError = 0,
    /// The name server was unable to interpret the query.
    FormatError = 1,
    /// The name server was unable to process this query due to a problem with the name server.
    ServFail = 2,
    /// Meaningful only for responses from an authoritative name server: the queried name does not exist.
    NameError = 3,
    /// The name server does not support the requested kind of query.
    NotImplemented = 4,
    /// The name server refuses to perform the specified operation for policy reasons.
    Refused = 5,
    /// RFC 2136: a name exists when it should not.
    YxDomain = 6,
    /// RFC 2136: an RRset exists when it should not.
    YxRrset = 7,
    /// RFC 2136: an RRset that should exist does not.
    NxRrset = 8,
    /// RFC 8945: the server is not authoritative, or the TSIG failed verification.
    NotAuth = 9,
    /// RFC 2136: a name used in the update is not within the zone.
    NotZone = 10,
}

impl Display for Rcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Rcode::NoError => "NOERROR",
            Rcode::FormatError => "FORMERR",
            Rcode::ServFail => "SERVFAIL",
            Rcode::NameError => "NXDOMAIN",
            Rcode::NotImplemented => "NOTIMP",
            Rcode::Refused => "REFUSED",
            Rcode::YxDomain => "YXDOMAIN",
            Rcode::YxRrset => "YXRRSET",
            Rcode::NxRrset => "NXRRSET",
            Rcode::NotAuth => "NOTAUTH",
            Rcode::NotZone => "NOTZONE",
        };
        f.write_str(name)
    }
}

#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Sequence)]
/// RRType, eg A, NS, MX, etc
pub enum RecordType {
    /// A host address
    A = 1,
    /// Authoritative name server
    NS = 2,
    CNAME = 5, // the canonical name for an alias
    SOA = 6,   // marks the start of a zone of authority
    PTR = 12,  // a domain name pointer
    MX = 15,   // mail exchange
    /// Text strings
    TXT = 16,
    /// IPv6 host address <https://www.rfc-editor.org/rfc/rfc3596#section-2.1>
    AAAA = 28,
    /// Service location <https://www.rfc-editor.org/rfc/rfc2782>
    SRV = 33,
    /// NAPTR <https://www.rfc-editor.org/rfc/rfc2915>
    NAPTR = 35,
    /// EDNS(0) pseudo-record <https://www.rfc-editor.org/rfc/rfc6891>
    OPT = 41,
    /// SSH key fingerprint <https://www.rfc-editor.org/rfc/rfc4255>
    SSHFP = 44,
    /// DNSSEC signature <https://www.rfc-editor.org/rfc/rfc4034>
    RRSIG = 46,
    /// DNSSEC public key <https://www.rfc-editor.org/rfc/rfc4034>
    DNSKEY = 48,
    /// TLS association <https://www.rfc-editor.org/rfc/rfc6698>
    TLSA = 52,
    /// Service binding <https://www.rfc-editor.org/rfc/rfc9460>
    SVCB = 64,
    /// HTTPS service binding <https://www.rfc-editor.org/rfc/rfc9460>
    HTTPS = 65,
    /// Transaction signature pseudo-record <https://www.rfc-editor.org/rfc/rfc8945>
    TSIG = 250,
    /// Incremental zone transfer
    IXFR = 251,
    /// A request for a transfer of an entire zone
    AXFR = 252,
    /// A request for all records (*)
    ANY = 255,
    /// Certification Authority Authorization <https://www.rfc-editor.org/rfc/rfc8659>
    CAA = 257,
    InvalidType,
}

impl From<&u16> for RecordType {
    fn from(input: &u16) -> Self {
        match input {
            1 => Self::A,
            2 => Self::NS,
            5 => Self::CNAME,
            6 => Self::SOA,
            12 => Self::PTR,
            15 => Self::MX,
            16 => Self::TXT,
            28 => Self::AAAA,
            33 => Self::SRV,
            35 => Self::NAPTR,
            41 => Self::OPT,
            44 => Self::SSHFP,
            46 => Self::RRSIG,
            48 => Self::DNSKEY,
            52 => Self::TLSA,
            64 => Self::SVCB,
            65 => Self::HTTPS,
            250 => Self::TSIG,
            251 => Self::IXFR,
            252 => Self::AXFR,
            255 => Self::ANY,
            257 => Self::CAA,
            _ => Self::InvalidType,
        }
    }
}

impl From<u16> for RecordType {
    fn from(input: u16) -> Self {
        (&input).into()
    }
}

impl From<String> for RecordType {
    fn from(input: String) -> Self {
        input.as_str().into()
    }
}

impl From<&str> for RecordType {
    fn from(input: &str) -> Self {
        match input {
            "A" => Self::A,
            "AAAA" => Self::AAAA,
            "ANY" => Self::ANY,
            "AXFR" => Self::AXFR,
            "CAA" => Self::CAA,
            "CNAME" => Self::CNAME,
            "DNSKEY" => Self::DNSKEY,
            "HTTPS" => Self::HTTPS,
            "IXFR" => Self::IXFR,
            "MX" => Self::MX,
            "NAPTR" => Self::NAPTR,
            "NS" => Self::NS,
            "OPT" => Self::OPT,
            "PTR" => Self::PTR,
            "RRSIG" => Self::RRSIG,
            "SOA" => Self::SOA,
            "SRV" => Self::SRV,
            "SSHFP" => Self::SSHFP,
            "SVCB" => Self::SVCB,
            "TLSA" => Self::TLSA,
            "TSIG" => Self::TSIG,
            "TXT" => Self::TXT,
            _ => Self::InvalidType,
        }
    }
}

impl From<RecordType> for &'static str {
    fn from(input: RecordType) -> &'static str {
        match input {
            RecordType::A => "A",
            RecordType::AAAA => "AAAA",
            RecordType::ANY => "ANY",
            RecordType::AXFR => "AXFR",
            RecordType::CAA => "CAA",
            RecordType::CNAME => "CNAME",
            RecordType::DNSKEY => "DNSKEY",
            RecordType::HTTPS => "HTTPS",
            RecordType::IXFR => "IXFR",
            RecordType::MX => "MX",
            RecordType::NAPTR => "NAPTR",
            RecordType::NS => "NS",
            RecordType::OPT => "OPT",
            RecordType::PTR => "PTR",
            RecordType::RRSIG => "RRSIG",
            RecordType::SOA => "SOA",
            RecordType::SRV => "SRV",
            RecordType::SSHFP => "SSHFP",
            RecordType::SVCB => "SVCB",
            RecordType::TLSA => "TLSA",
            RecordType::TSIG => "TSIG",
            RecordType::TXT => "TXT",
            RecordType::InvalidType => "",
        }
    }
}

impl Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let res: &'static str = self.to_owned().into();
        f.write_fmt(format_args!("{res}"))
    }
}

impl RecordType {
    /// The types this server will answer queries for.
    pub fn supported(self: RecordType) -> bool {
        #[allow(clippy::match_like_matches_macro)]
        match self {
            RecordType::A
            | RecordType::AAAA
            | RecordType::ANY
            | RecordType::AXFR
            | RecordType::CAA
            | RecordType::CNAME
            | RecordType::DNSKEY
            | RecordType::HTTPS
            | RecordType::IXFR
            | RecordType::MX
            | RecordType::NAPTR
            | RecordType::NS
            | RecordType::PTR
            | RecordType::RRSIG
            | RecordType::SOA
            | RecordType::SRV
            | RecordType::SSHFP
            | RecordType::SVCB
            | RecordType::TLSA
            | RecordType::TXT => true,
            _ => false,
        }
    }
}

impl sqlx::Type<sqlx::Sqlite> for RecordType {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        i64::type_info()
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for RecordType {
    fn encode_by_ref(
        &self,
        args: &mut Vec<SqliteArgumentValue<'q>>,
    ) -> Result<IsNull, sqlx::error::BoxDynError> {
        args.push(SqliteArgumentValue::Int64(*self as i64));
        Ok(IsNull::No)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Sequence)]
/// CLASS fields appear in resource records, almost always IN. NONE and ANY
/// turn up in RFC 2136 update sections where the class encodes the operation.
pub enum RecordClass {
    /// IN - Internet
    Internet = 1,
    /// CH - Chaos
    Chaos = 3,
    /// Hesiod [Dyer 87]
    Hesiod = 4,
    /// RFC 2136 delete-this-record marker
    None = 254,
    /// RFC 2136 delete-rrset marker, or a *-class query
    Any = 255,

    InvalidType = 0,
}

impl Display for RecordClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "{}",
            match self {
                RecordClass::Internet => "IN",
                RecordClass::Chaos => "CHAOS",
                RecordClass::Hesiod => "HESIOD",
                RecordClass::None => "NONE",
                RecordClass::Any => "ANY",
                RecordClass::InvalidType => "Invalid",
            }
        ))
    }
}

impl Serialize for RecordClass {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(format!("{self}").as_str())
    }
}

impl From<&u16> for RecordClass {
    fn from(input: &u16) -> Self {
        match input {
            1 => Self::Internet,
            3 => Self::Chaos,
            4 => Self::Hesiod,
            254 => Self::None,
            255 => Self::Any,
            _ => Self::InvalidType,
        }
    }
}

#[derive(Debug, PrimitiveEnum_u8, Clone, Copy, Eq, PartialEq)]
pub enum PacketType {
    Query = 0,
    Answer = 1,
}

impl From<bool> for PacketType {
    fn from(input: bool) -> Self {
        match input {
            false => Self::Query,
            true => Self::Answer,
        }
    }
}

/// The HMAC flavours we accept on TSIG-signed messages. RFC 8945 also defines
/// hmac-md5, which is rejected outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsigAlgorithm {
    HmacSha1,
    HmacSha256,
    HmacSha384,
    HmacSha512,
}

impl TsigAlgorithm {
    /// Algorithm names are encoded as domain names in the TSIG rdata, eg `hmac-sha256.`
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim_end_matches('.').to_ascii_lowercase().as_str() {
            "hmac-sha1" => Some(Self::HmacSha1),
            "hmac-sha256" => Some(Self::HmacSha256),
            "hmac-sha384" => Some(Self::HmacSha384),
            "hmac-sha512" => Some(Self::HmacSha512),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::HmacSha1 => "hmac-sha1",
            Self::HmacSha256 => "hmac-sha256",
            Self::HmacSha384 => "hmac-sha384",
            Self::HmacSha512 => "hmac-sha512",
        }
    }
}

impl Display for TsigAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// DNSSEC signing algorithm numbers (RFC 4034 / RFC 8080).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnssecAlgorithm {
    RsaSha256 = 8,
    RsaSha512 = 10,
    Ed25519 = 13,
    Ed448 = 15,
}

impl DnssecAlgorithm {
    pub fn from_number(input: u8) -> Option<Self> {
        match input {
            8 => Some(Self::RsaSha256),
            10 => Some(Self::RsaSha512),
            13 => Some(Self::Ed25519),
            15 => Some(Self::Ed448),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_type_code_round_trip() {
        for rrtype in enum_iterator::all::<RecordType>() {
            if rrtype == RecordType::InvalidType {
                continue;
            }
            assert_eq!(RecordType::from(rrtype as u16), rrtype);
            // the string form round-trips too
            let name: &'static str = rrtype.into();
            assert_eq!(RecordType::from(name), rrtype);
        }
    }

    #[test]
    fn test_record_class_codes() {
        for class in enum_iterator::all::<RecordClass>() {
            if class == RecordClass::InvalidType {
                continue;
            }
            assert_eq!(RecordClass::from(&(class as u16)), class);
        }
    }

    #[test]
    fn test_tsig_algorithm_names() {
        assert_eq!(
            TsigAlgorithm::from_name("HMAC-SHA256."),
            Some(TsigAlgorithm::HmacSha256)
        );
        assert_eq!(TsigAlgorithm::from_name("hmac-md5.sig-alg.reg.int"), None);
        assert_eq!(TsigAlgorithm::from_name("hmac-md5"), None);
    }
}
