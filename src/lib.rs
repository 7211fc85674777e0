#[macro_use]
extern crate lazy_static;

use crate::enums::*;
use crate::error::HoldfastError;
use crate::name::{name_as_bytes, read_name};
use packed_struct::prelude::*;
use std::fmt::Display;

/// Serving local zones: lookup and answer assembly
pub mod authority;
/// The TTL-aware response cache and its durable mirror
pub mod cache;
pub mod cli;
/// Configuration handling for the server
pub mod config;
/// The data-storing backend for zone information
pub mod datastore;
pub mod db;
/// RFC 2136 dynamic update processing
pub mod ddns;
/// RRSIG signing and key handling
pub mod dnssec;
pub mod enums;
pub mod error;
/// Blocklist / allowlist / regex decisions
pub mod filter;
pub mod logging;
/// Whole-message parse and response synthesis
pub mod message;
pub mod metrics;
pub mod name;
pub mod packet_dumper;
/// Per-query orchestration: the order of battle for every incoming packet
pub mod pipeline;
pub mod ratelimit;
pub mod reply;
pub mod resourcerecord;
pub mod servers;
#[cfg(test)]
mod tests;
/// Upstream selection and transport dispatch
pub mod upstream;
/// DoH and health endpoints
pub mod web;
pub mod zonefile;
pub mod zones;

/// The size of a DNS message header
pub const HEADER_BYTES: usize = 12;
/// Upper bound on any message we will build or accept (encoder allocates to this)
pub const MAX_MESSAGE_SIZE: usize = 4096;
/// Replies over this size on plain UDP get the TC bit instead
pub const UDP_TRUNCATION_LIMIT: usize = 512;
/// Fallback TTL when an answer section yields none (seconds)
pub const DEFAULT_CACHE_TTL: u32 = 300;
/// TTL used when answering from the static local-host map (seconds)
pub const LOCAL_ANSWER_TTL: u32 = 3600;

/// The header of a DNS transmission, either a Query or Reply. Ref [RFC1035](https://www.rfc-editor.org/rfc/rfc1035#section-4.1.1) section 4.1.1.
#[derive(Debug, PackedStruct, PartialEq, Eq, Clone)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "12")]
pub struct Header {
    /// The query ID
    #[packed_field(bits = "0..=15", endian = "msb")]
    pub id: u16,
    // Is it a query or response
    #[packed_field(bits = "16", ty = "enum")]
    pub qr: PacketType, // bit 16
    #[packed_field(bits = "17..=20", ty = "enum")]
    pub opcode: OpCode, // 17-20 actually 4 bits
    #[packed_field(bits = "21")]
    pub authoritative: bool, // 21
    #[packed_field(bits = "22")]
    pub truncated: bool, // 22
    // RD - set in a query and copied into the response; directs the server to pursue the query recursively
    #[packed_field(bits = "23")]
    pub recursion_desired: bool, // 23
    #[packed_field(bits = "24")]
    pub recursion_available: bool, // 24
    /// reserved, must be 0
    #[packed_field(bits = "25")]
    pub z: bool,
    #[packed_field(bits = "26")]
    pub ad: bool,
    #[packed_field(bits = "27")]
    pub cd: bool,
    #[packed_field(bits = "28..=31", ty = "enum")]
    pub rcode: Rcode, // bits 28-31
    /// an unsigned 16 bit integer specifying the number of entries in the question section.
    #[packed_field(bits = "32..=47", endian = "msb")]
    pub qdcount: u16, // bits 32-47
    /// an unsigned 16 bit integer specifying the number of entries in the answer section.
    #[packed_field(bits = "48..=63", endian = "msb")]
    pub ancount: u16, // 48-63
    /// an unsigned 16 bit integer specifying the number of name server resource records in the authority records section.
    #[packed_field(bits = "64..=79", endian = "msb")]
    pub nscount: u16, // 64-79
    /// an unsigned 16 bit integer specifying the number of resource records in the additional records section.
    #[packed_field(bits = "80..=95", endian = "msb")]
    pub arcount: u16, // 80-95
}

impl Default for Header {
    fn default() -> Self {
        Header {
            id: 0,
            qr: PacketType::Query,
            opcode: OpCode::Query,
            authoritative: false,
            truncated: false,
            recursion_desired: false,
            recursion_available: false,
            z: false,
            ad: false,
            cd: false,
            rcode: Rcode::NoError,
            qdcount: 0,
            ancount: 0,
            nscount: 0,
            arcount: 0,
        }
    }
}

impl Display for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "id={} qr={:?} opcode={:?} rcode={} qd={} an={} ns={} ar={}",
            self.id,
            self.qr,
            self.opcode,
            self.rcode,
            self.qdcount,
            self.ancount,
            self.nscount,
            self.arcount
        ))
    }
}

impl Header {
    /// Parse the leading twelve bytes of a message.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, HoldfastError> {
        if buf.len() < HEADER_BYTES {
            return Err(HoldfastError::MalformedMessage(format!(
                "message of {} bytes can't hold a header",
                buf.len()
            )));
        }
        let mut split_header: [u8; HEADER_BYTES] = [0; HEADER_BYTES];
        split_header.copy_from_slice(&buf[0..HEADER_BYTES]);
        Header::unpack(&split_header)
            .map_err(|err| HoldfastError::MalformedMessage(format!("failed to parse header: {err:?}")))
    }

    pub fn as_answer(self) -> Header {
        let mut response = self;
        response.qr = PacketType::Answer;
        response
    }
}

/// A DNS Question section, from Ref [RFC1035](https://www.rfc-editor.org/rfc/rfc1035#section-4.1.2) section 4.1.2 "Question section format".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Question {
    /// The name which is being queried, lowercased dotted form
    pub qname: String,
    /// The Record type that is being requested, eg A, NS, MX, TXT etc.
    pub qtype: RecordType,
    /// The class, (typically IN for "Internet")
    pub qclass: RecordClass,
}

impl Display for Question {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "QNAME={} QTYPE={} QCLASS={}",
            self.qname, self.qtype, self.qclass,
        ))
    }
}

impl Question {
    /// Parse a question starting at `offset`, returning it and the offset of
    /// the next section.
    pub fn from_wire(buf: &[u8], offset: usize) -> Result<(Self, usize), HoldfastError> {
        let (qname, after_name) = read_name(buf, offset)?;
        let fixed = buf.get(after_name..after_name + 4).ok_or_else(|| {
            HoldfastError::MalformedMessage("question truncated before qtype/qclass".to_string())
        })?;
        let qtype = RecordType::from(u16::from_be_bytes([fixed[0], fixed[1]]));
        let qclass = RecordClass::from(&u16::from_be_bytes([fixed[2], fixed[3]]));
        Ok((
            Question {
                qname,
                qtype,
                qclass,
            },
            after_name + 4,
        ))
    }

    /// turn a question into a vec of bytes to send back to the user
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut retval: Vec<u8> = vec![];
        retval.extend(name_as_bytes(&self.qname, None));
        retval.extend((self.qtype as u16).to_be_bytes());
        retval.extend((self.qclass as u16).to_be_bytes());
        retval
    }
}

/// The answer, authority, and additional sections all share the same
/// format: a variable number of resource records, where the number of
/// records is specified in the corresponding count field in the header.
///
/// Ref [RFC1035 Section 4.1.3](https://www.rfc-editor.org/rfc/rfc1035.html#section-4.1.3)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceRecord {
    /// A domain name to which this resource record pertains, dotted form.
    pub name: String,
    /// Two octets containing one of the RR type codes.
    pub record_type: RecordType,
    /// Two octets which specify the class of the data in the RDATA field.
    pub class: RecordClass,
    /// Seconds this record may be cached for; zero means transaction-only.
    pub ttl: u32,
    /// Wire rdata, already decompressed where the type embeds names.
    pub rdata: Vec<u8>,
}

impl ResourceRecord {
    /// Encode for a reply. `compress_target` carries the offset of an earlier
    /// occurrence of the owner name (usually the question at 12).
    pub fn to_bytes(&self, compress_target: Option<u16>) -> Vec<u8> {
        let mut retval: Vec<u8> = vec![];
        retval.extend(name_as_bytes(&self.name, compress_target));
        retval.extend((self.record_type as u16).to_be_bytes());
        retval.extend((self.class as u16).to_be_bytes());
        retval.extend(self.ttl.to_be_bytes());
        retval.extend((self.rdata.len() as u16).to_be_bytes());
        retval.extend(&self.rdata);
        retval
    }
}

impl From<&ResourceRecord> for Vec<u8> {
    fn from(record: &ResourceRecord) -> Self {
        record.to_bytes(None)
    }
}
