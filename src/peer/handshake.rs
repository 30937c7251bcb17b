//! BEP-3 handshake: a fixed 68-byte message exchanged before any other
//! peer wire traffic. An earlier `as_bytes_mut` helper reinterpreted the
//! struct itself as a byte buffer via an unsound pointer cast (the struct
//! isn't `repr(C)`/`repr(packed)` despite the comment claiming so); this
//! drops it in favor of the explicit `to_bytes`/`from_bytes` pair.

use crate::error::HandshakeError;

const PSTR: &str = "BitTorrent protocol";

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Handshake {
        Handshake {
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn to_bytes(&self) -> [u8; 68] {
        let mut bytes = [0u8; 68];
        bytes[0] = 19;
        bytes[1..20].copy_from_slice(PSTR.as_bytes());
        bytes[20..28].copy_from_slice(&self.reserved);
        bytes[28..48].copy_from_slice(&self.info_hash);
        bytes[48..68].copy_from_slice(&self.peer_id);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Handshake, HandshakeError> {
        if bytes.len() < 68 {
            return Err(HandshakeError::Truncated(bytes.len()));
        }
        if bytes[0] != 19 || &bytes[1..20] != PSTR.as_bytes() {
            return Err(HandshakeError::ProtocolMismatch(
                String::from_utf8_lossy(&bytes[1..20.min(bytes.len())]).to_string(),
            ));
        }
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&bytes[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&bytes[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&bytes[48..68]);
        Ok(Handshake {
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// Validates a peer's handshake against the info_hash we expect for
    /// this torrent (spec §4.5: mismatched info_hash or pstr terminates
    /// the session immediately).
    pub fn validate(&self, expected_info_hash: &[u8; 20]) -> Result<(), HandshakeError> {
        if &self.info_hash != expected_info_hash {
            return Err(HandshakeError::InfoHashMismatch);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let info_hash = [7u8; 20];
        let peer_id = [9u8; 20];
        let handshake = Handshake::new(info_hash, peer_id);
        let bytes = handshake.to_bytes();
        assert_eq!(bytes.len(), 68);
        let decoded = Handshake::from_bytes(&bytes).unwrap();
        assert_eq!(handshake, decoded);
    }

    #[test]
    fn rejects_short_buffer() {
        let bytes = [19u8; 10];
        assert!(matches!(
            Handshake::from_bytes(&bytes),
            Err(HandshakeError::Truncated(10))
        ));
    }

    #[test]
    fn rejects_wrong_pstr() {
        let mut bytes = Handshake::new([1; 20], [2; 20]).to_bytes();
        bytes[1] = b'X';
        assert!(matches!(
            Handshake::from_bytes(&bytes),
            Err(HandshakeError::ProtocolMismatch(_))
        ));
    }

    #[test]
    fn validate_rejects_mismatched_info_hash() {
        let handshake = Handshake::new([1; 20], [2; 20]);
        assert!(matches!(
            handshake.validate(&[9; 20]),
            Err(HandshakeError::InfoHashMismatch)
        ));
        assert!(handshake.validate(&[1; 20]).is_ok());
    }
}
