//! Wire-format domain name handling: label encoding, and decoding that
//! follows RFC 1035 compression pointers without being led astray by them.

use crate::error::HoldfastError;
use crate::HEADER_BYTES;

/// Labels are limited to 63 octets because the two top bits flag a pointer.
pub const MAX_LABEL_LENGTH: usize = 63;
/// A name's full wire encoding, length octets and terminator included.
pub const MAX_NAME_LENGTH: usize = 255;
/// How many pointer hops we'll follow before declaring shenanigans.
const MAX_POINTER_HOPS: usize = 10;

/// Encode a dotted name (`example.com`) as wire labels. When
/// `compress_target` is set the whole name is replaced with a compression
/// pointer to that offset - callers only pass offsets of names already
/// emitted earlier in the same message.
pub fn name_as_bytes(name: &str, compress_target: Option<u16>) -> Vec<u8> {
    if let Some(target) = compress_target {
        let pointer = 0xC000u16 | (target & 0x3FFF);
        return pointer.to_be_bytes().to_vec();
    }
    let mut retval: Vec<u8> = Vec::with_capacity(name.len() + 2);
    for label in name.split('.').filter(|l| !l.is_empty()) {
        retval.push(label.len() as u8);
        retval.extend(label.as_bytes());
    }
    retval.push(0);
    retval
}

/// The length `name_as_bytes(name, None)` would produce.
pub fn encoded_len(name: &str) -> usize {
    name.split('.')
        .filter(|l| !l.is_empty())
        .map(|l| 1 + l.len())
        .sum::<usize>()
        + 1
}

/// Read a (possibly compressed) name starting at `start`, returning the
/// lowercased dotted name and the offset of the first byte after the name
/// at the top level of the stream.
///
/// Pointers may only reference earlier offsets, targets inside the header or
/// past the end of the message are rejected, and a hop budget bounds the walk
/// so parsing terminates on every input.
pub fn read_name(buf: &[u8], start: usize) -> Result<(String, usize), HoldfastError> {
    let mut labels: Vec<String> = vec![];
    let mut pos = start;
    // offset after the name in the original stream, set when we take the first pointer
    let mut resume_at: Option<usize> = None;
    let mut hops = 0usize;
    let mut wire_len = 1usize; // the terminal zero octet

    loop {
        let len_octet = *buf.get(pos).ok_or_else(|| {
            HoldfastError::MalformedMessage(format!("name at {start} ran off the end of the message"))
        })?;

        if len_octet & 0xC0 == 0xC0 {
            let second = *buf.get(pos + 1).ok_or_else(|| {
                HoldfastError::MalformedMessage("truncated compression pointer".to_string())
            })?;
            let target = ((len_octet as usize & 0x3F) << 8) | second as usize;
            if target < HEADER_BYTES {
                return Err(HoldfastError::MalformedMessage(format!(
                    "compression pointer into the header: {target}"
                )));
            }
            if target >= buf.len() {
                return Err(HoldfastError::MalformedMessage(format!(
                    "compression pointer past the end of the message: {target}"
                )));
            }
            if target >= pos {
                return Err(HoldfastError::MalformedMessage(format!(
                    "compression pointer at {pos} does not reference an earlier offset ({target})"
                )));
            }
            hops += 1;
            if hops > MAX_POINTER_HOPS {
                return Err(HoldfastError::MalformedMessage(
                    "too many compression pointer hops".to_string(),
                ));
            }
            if resume_at.is_none() {
                resume_at = Some(pos + 2);
            }
            pos = target;
            continue;
        }

        if len_octet == 0 {
            let name = labels.join(".").to_lowercase();
            return Ok((name, resume_at.unwrap_or(pos + 1)));
        }

        let label_len = len_octet as usize;
        if label_len > MAX_LABEL_LENGTH {
            return Err(HoldfastError::MalformedMessage(format!(
                "label length {label_len} over the {MAX_LABEL_LENGTH} octet limit"
            )));
        }
        wire_len += 1 + label_len;
        if wire_len > MAX_NAME_LENGTH {
            return Err(HoldfastError::MalformedMessage(format!(
                "name encoding over {MAX_NAME_LENGTH} octets"
            )));
        }
        let label_bytes = buf.get(pos + 1..pos + 1 + label_len).ok_or_else(|| {
            HoldfastError::MalformedMessage(format!(
                "label at {pos} claims {label_len} octets but the message is shorter"
            ))
        })?;
        let label = std::str::from_utf8(label_bytes)
            .map_err(|e| HoldfastError::MalformedMessage(format!("label is not utf-8: {e}")))?;
        labels.push(label.to_string());
        pos += 1 + label_len;
    }
}

/// Check that no dotted-form label is over the wire limit.
pub fn check_long_labels(testval: &str) -> bool {
    testval.split('.').any(|x| x.len() > MAX_LABEL_LENGTH)
}

/// Does `name` sit at or below `suffix`? `foo.example.com` is within
/// `example.com`, `notexample.com` is not.
pub fn name_in_domain(name: &str, suffix: &str) -> bool {
    name == suffix || name.ends_with(&format!(".{suffix}"))
}
