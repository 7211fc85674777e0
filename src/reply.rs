use crate::enums::{PacketType, Rcode};
use crate::error::HoldfastError;
use crate::{Header, Question, ResourceRecord, HEADER_BYTES, MAX_MESSAGE_SIZE, UDP_TRUNCATION_LIMIT};
use packed_struct::prelude::*;

/// An outgoing message under construction.
#[derive(Clone, Debug)]
pub struct Reply {
    pub header: Header,
    pub question: Option<Question>,
    pub answers: Vec<ResourceRecord>,
    pub authorities: Vec<ResourceRecord>,
    pub additionals: Vec<ResourceRecord>,
}

impl Reply {
    /// Serialize for the wire. Owner names matching the question are emitted
    /// as a compression pointer to the question name at offset 12.
    pub fn as_bytes(&mut self) -> Result<Vec<u8>, HoldfastError> {
        let mut retval: Vec<u8> = Vec::with_capacity(MAX_MESSAGE_SIZE);

        self.header.qdcount = self.question.is_some() as u16;
        self.header.ancount = self.answers.len() as u16;
        self.header.nscount = self.authorities.len() as u16;
        self.header.arcount = self.additionals.len() as u16;

        let reply_header = self.header.pack()?;
        retval.extend(reply_header);

        if let Some(question) = &self.question {
            retval.extend(question.to_bytes());
        }

        let qname = self.question.as_ref().map(|q| q.qname.as_str());
        for record in self
            .answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.additionals.iter())
        {
            let compress_target = match qname {
                Some(name) if name == record.name => Some(HEADER_BYTES as u16),
                _ => None,
            };
            retval.extend(record.to_bytes(compress_target));
        }

        if retval.len() > MAX_MESSAGE_SIZE {
            return Err(HoldfastError::InternalError(format!(
                "encoded reply of {} bytes is over the {MAX_MESSAGE_SIZE} byte ceiling",
                retval.len()
            )));
        }

        Ok(retval)
    }

    /// Serialize for plain UDP: if the full encoding is over the classic 512
    /// byte limit, set TC and send only the header and question back.
    pub fn as_bytes_udp(&mut self) -> Result<Vec<u8>, HoldfastError> {
        let full = self.as_bytes()?;
        if full.len() <= UDP_TRUNCATION_LIMIT {
            return Ok(full);
        }
        let mut truncated = self.clone();
        truncated.header.truncated = true;
        truncated.answers.clear();
        truncated.authorities.clear();
        truncated.additionals.clear();
        truncated.as_bytes()
    }
}

/// A bare reply carrying just an rcode - the workhorse for errors.
pub fn reply_builder(id: u16, rcode: Rcode) -> Reply {
    Reply {
        header: Header {
            id,
            qr: PacketType::Answer,
            rcode,
            ..Default::default()
        },
        question: None,
        answers: vec![],
        authorities: vec![],
        additionals: vec![],
    }
}

/// NXDOMAIN, echoing the question when we have one.
pub fn reply_nxdomain(id: u16, question: Option<Question>) -> Reply {
    let mut reply = reply_builder(id, Rcode::NameError);
    reply.question = question;
    reply
}

pub fn reply_servfail(id: u16, question: Option<Question>) -> Reply {
    let mut reply = reply_builder(id, Rcode::ServFail);
    reply.question = question;
    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::{RecordClass, RecordType};

    #[test]
    fn test_nxdomain_reply_shape() {
        let question = Question {
            qname: "gone.example.com".to_string(),
            qtype: RecordType::A,
            qclass: RecordClass::Internet,
        };
        let mut reply = reply_nxdomain(0xBEEF, Some(question));
        let bytes = reply.as_bytes().expect("encode failed");
        assert_eq!(&bytes[0..2], &[0xBE, 0xEF]);
        // rcode lives in the low nibble of byte 3
        assert_eq!(bytes[3] & 0x0F, Rcode::NameError as u8);
        // ancount is zero
        assert_eq!(&bytes[6..8], &[0, 0]);
    }

    #[test]
    fn test_answer_compression_points_at_question() {
        let question = Question {
            qname: "a.example.com".to_string(),
            qtype: RecordType::A,
            qclass: RecordClass::Internet,
        };
        let mut reply = reply_builder(1, Rcode::NoError);
        reply.question = Some(question.clone());
        reply.answers.push(ResourceRecord {
            name: question.qname.clone(),
            record_type: RecordType::A,
            class: RecordClass::Internet,
            ttl: 30,
            rdata: vec![10, 0, 0, 1],
        });
        let bytes = reply.as_bytes().expect("encode failed");
        let answer_start = HEADER_BYTES + question.to_bytes().len();
        assert_eq!(&bytes[answer_start..answer_start + 2], &[0xC0, 0x0C]);
    }
}
