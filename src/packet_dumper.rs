//! Debug-time packet capture: hexdumps of client requests and our replies,
//! emitted when `capture_packets` is set in the config.

use log::info;

pub enum DumpType {
    ClientRequest,
    ServerReply,
}

impl std::fmt::Display for DumpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DumpType::ClientRequest => write!(f, "request"),
            DumpType::ServerReply => write!(f, "reply"),
        }
    }
}

/// Log the packet as rows of sixteen hex octets.
pub fn dump_bytes(buf: &[u8], dump_type: DumpType) {
    for (index, chunk) in buf.chunks(16).enumerate() {
        info!("{dump_type} {:04x}  {}", index * 16, hex::encode(chunk));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_does_not_panic_on_odd_sizes() {
        dump_bytes(&[], DumpType::ClientRequest);
        dump_bytes(&[1], DumpType::ServerReply);
        dump_bytes(&[0xAB; 33], DumpType::ClientRequest);
    }
}
