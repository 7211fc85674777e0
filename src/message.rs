//! Whole-message parsing. The header-only fast path lives in [crate::Header];
//! this module walks all four sections, decompresses names embedded in rdata,
//! and surfaces the bits the pipeline cares about (EDNS DO, TSIG position).

use crate::enums::{RecordClass, RecordType};
use crate::error::HoldfastError;
use crate::name::{name_as_bytes, read_name};
use crate::{Header, Question, ResourceRecord, DEFAULT_CACHE_TTL, HEADER_BYTES};

/// What we lifted out of an OPT pseudo-record in the additional section.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EdnsInfo {
    /// The requestor's UDP payload size, carried in the OPT class field.
    pub payload_size: u16,
    /// The DO bit - "DNSSEC answers OK" - bit 15 of the OPT flags.
    pub dnssec_ok: bool,
}

/// An entire message, parsed. Names inside rdata are decompressed on the way
/// in, so every [ResourceRecord] here is self-contained.
#[derive(Clone, Debug)]
pub struct Message {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<ResourceRecord>,
    pub authorities: Vec<ResourceRecord>,
    pub additionals: Vec<ResourceRecord>,
    pub edns: Option<EdnsInfo>,
    /// Byte offset of the TSIG record if the final additional RR is one.
    /// TSIG verification needs the message exactly as signed, ie everything
    /// before this offset.
    pub tsig_offset: Option<usize>,
}

impl Message {
    pub fn parse(buf: &[u8]) -> Result<Self, HoldfastError> {
        let header = Header::from_bytes(buf)?;
        let mut offset = HEADER_BYTES;

        let mut questions = Vec::with_capacity(header.qdcount as usize);
        for _ in 0..header.qdcount {
            let (question, next) = Question::from_wire(buf, offset)?;
            questions.push(question);
            offset = next;
        }

        let mut edns = None;
        let mut tsig_offset = None;

        let mut sections: [Vec<ResourceRecord>; 3] = [vec![], vec![], vec![]];
        let counts = [header.ancount, header.nscount, header.arcount];
        for (section, count) in sections.iter_mut().zip(counts) {
            for _ in 0..count {
                let record_offset = offset;
                let (record, next) = parse_record(buf, offset)?;
                if record.record_type == RecordType::OPT {
                    edns = Some(EdnsInfo {
                        payload_size: read_u16(buf, record_offset_class_field(buf, record_offset)?)?,
                        dnssec_ok: (record.ttl >> 15) & 1 == 1,
                    });
                } else if record.record_type == RecordType::TSIG {
                    tsig_offset = Some(record_offset);
                }
                section.push(record);
                offset = next;
            }
        }
        let [answers, authorities, additionals] = sections;

        Ok(Message {
            header,
            questions,
            answers,
            authorities,
            additionals,
            edns,
            tsig_offset,
        })
    }

    pub fn question(&self) -> Option<&Question> {
        self.questions.first()
    }

    /// True when the client attached an OPT record with the DO bit up.
    pub fn dnssec_requested(&self) -> bool {
        self.edns.map(|e| e.dnssec_ok).unwrap_or(false)
    }

    /// Minimum TTL across the answer section, if any answers are present.
    pub fn min_answer_ttl(&self) -> Option<u32> {
        self.answers.iter().map(|rr| rr.ttl).min()
    }
}

/// Pull the cacheable TTL out of an encoded response: the minimum of the
/// answer TTLs, or the 300 second fallback when there are no answers or the
/// bytes don't parse.
pub fn extract_min_ttl(buf: &[u8]) -> u32 {
    match Message::parse(buf) {
        Ok(message) => message.min_answer_ttl().unwrap_or(DEFAULT_CACHE_TTL),
        Err(_) => DEFAULT_CACHE_TTL,
    }
}

fn read_u16(buf: &[u8], offset: usize) -> Result<u16, HoldfastError> {
    let bytes = buf
        .get(offset..offset + 2)
        .ok_or_else(|| HoldfastError::MalformedMessage("short read for u16".to_string()))?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Offset of the class field of the record starting at `offset` - the OPT
/// pseudo-record smuggles the payload size in there.
fn record_offset_class_field(buf: &[u8], offset: usize) -> Result<usize, HoldfastError> {
    let (_, after_name) = read_name(buf, offset)?;
    Ok(after_name + 2)
}

/// Parse one resource record starting at `offset`. Returns the record and the
/// offset just past it.
fn parse_record(buf: &[u8], offset: usize) -> Result<(ResourceRecord, usize), HoldfastError> {
    let (name, after_name) = read_name(buf, offset)?;
    let fixed = buf.get(after_name..after_name + 10).ok_or_else(|| {
        HoldfastError::MalformedMessage("record truncated before fixed fields".to_string())
    })?;
    let rrtype = RecordType::from(u16::from_be_bytes([fixed[0], fixed[1]]));
    let class = RecordClass::from(&u16::from_be_bytes([fixed[2], fixed[3]]));
    let ttl = u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
    let rdlength = u16::from_be_bytes([fixed[8], fixed[9]]) as usize;

    let rdata_offset = after_name + 10;
    let rdata_end = rdata_offset
        .checked_add(rdlength)
        .ok_or_else(|| HoldfastError::MalformedMessage("rdlength overflow".to_string()))?;
    if rdata_end > buf.len() {
        return Err(HoldfastError::MalformedMessage(format!(
            "rdlength {rdlength} runs past the end of the message"
        )));
    }

    let rdata = decompress_rdata(buf, rrtype, rdata_offset, rdata_end)?;

    Ok((
        ResourceRecord {
            name,
            record_type: rrtype,
            class,
            ttl,
            rdata,
        },
        rdata_end,
    ))
}

/// Names inside rdata may use compression pointers into the surrounding
/// message. Expand them so the record can outlive the buffer it came from.
fn decompress_rdata(
    buf: &[u8],
    rrtype: RecordType,
    start: usize,
    end: usize,
) -> Result<Vec<u8>, HoldfastError> {
    let raw = || buf[start..end].to_vec();
    match rrtype {
        RecordType::CNAME | RecordType::NS | RecordType::PTR => {
            let (target, _) = read_name(buf, start)?;
            Ok(name_as_bytes(&target, None))
        }
        RecordType::MX => {
            if end - start < 3 {
                return Err(HoldfastError::MalformedMessage("short MX rdata".to_string()));
            }
            let mut out = buf[start..start + 2].to_vec();
            let (exchange, _) = read_name(buf, start + 2)?;
            out.extend(name_as_bytes(&exchange, None));
            Ok(out)
        }
        RecordType::SRV => {
            if end - start < 7 {
                return Err(HoldfastError::MalformedMessage("short SRV rdata".to_string()));
            }
            let mut out = buf[start..start + 6].to_vec();
            let (target, _) = read_name(buf, start + 6)?;
            out.extend(name_as_bytes(&target, None));
            Ok(out)
        }
        RecordType::SOA => {
            let (mname, after_mname) = read_name(buf, start)?;
            let (rname, after_rname) = read_name(buf, after_mname)?;
            let tail = buf.get(after_rname..after_rname + 20).ok_or_else(|| {
                HoldfastError::MalformedMessage("short SOA rdata".to_string())
            })?;
            let mut out = name_as_bytes(&mname, None);
            out.extend(name_as_bytes(&rname, None));
            out.extend(tail);
            Ok(out)
        }
        _ => Ok(raw()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::{OpCode, PacketType, Rcode};
    use crate::reply::Reply;

    fn query_bytes(qname: &str, qtype: RecordType) -> Vec<u8> {
        let mut reply = Reply {
            header: Header {
                id: 0x1234,
                qdcount: 1,
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
        reply.as_bytes().expect("failed to encode query")
    }

    #[test]
    fn test_parse_plain_query() {
        let bytes = query_bytes("example.com", RecordType::A);
        let message = Message::parse(&bytes).expect("parse failed");
        assert_eq!(message.header.id, 0x1234);
        assert_eq!(message.header.opcode, OpCode::Query);
        assert_eq!(message.header.qr, PacketType::Query);
        let q = message.question().expect("no question");
        assert_eq!(q.qname, "example.com");
        assert_eq!(q.qtype, RecordType::A);
        assert!(!message.dnssec_requested());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Message::parse(&[0u8; 3]).is_err());
        // a header claiming one question over an empty body
        let mut bytes = query_bytes("example.com", RecordType::A);
        bytes.truncate(14);
        assert!(Message::parse(&bytes).is_err());
    }

    #[test]
    fn test_min_ttl_extraction() {
        let mut reply = Reply {
            header: Header {
                id: 7,
                qr: PacketType::Answer,
                qdcount: 1,
                rcode: Rcode::NoError,
                ..Default::default()
            },
            question: Some(Question {
                qname: "ttl.example.com".to_string(),
                qtype: RecordType::A,
                qclass: RecordClass::Internet,
            }),
            answers: vec![
                ResourceRecord {
                    name: "ttl.example.com".to_string(),
                    record_type: RecordType::A,
                    class: RecordClass::Internet,
                    ttl: 120,
                    rdata: vec![192, 0, 2, 1],
                },
                ResourceRecord {
                    name: "ttl.example.com".to_string(),
                    record_type: RecordType::A,
                    class: RecordClass::Internet,
                    ttl: 60,
                    rdata: vec![192, 0, 2, 2],
                },
            ],
            authorities: vec![],
            additionals: vec![],
        };
        let bytes = reply.as_bytes().expect("encode failed");
        assert_eq!(extract_min_ttl(&bytes), 60);
    }

    #[test]
    fn test_min_ttl_fallback_on_empty_answer() {
        let bytes = query_bytes("nothing.example.com", RecordType::A);
        assert_eq!(extract_min_ttl(&bytes), DEFAULT_CACHE_TTL);
        assert_eq!(extract_min_ttl(&[0, 1, 2]), DEFAULT_CACHE_TTL);
    }

    #[test]
    fn test_edns_do_bit() {
        let mut bytes = query_bytes("signed.example.com", RecordType::A);
        // bolt an OPT record onto the additional section by hand:
        // root name, type 41, class 4096 (payload), ttl carries the DO bit
        bytes[11] = 1; // arcount
        bytes.push(0); // root
        bytes.extend(41u16.to_be_bytes());
        bytes.extend(4096u16.to_be_bytes());
        bytes.extend(0x0000_8000u32.to_be_bytes());
        bytes.extend(0u16.to_be_bytes());
        let message = Message::parse(&bytes).expect("parse failed");
        assert!(message.dnssec_requested());
        assert_eq!(message.edns.expect("no edns").payload_size, 4096);
    }
}
