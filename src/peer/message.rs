//! Wire messages (BEP-3 §1): a 4-byte big-endian length prefix followed by
//! a 1-byte id and a type-specific payload. An earlier `serialize`
//! computed the length prefix by casting payload length to `u8`, which
//! silently truncates any message over 255 bytes — fatal for `piece`
//! messages, whose blocks are routinely 16 KiB. This uses the full
//! 4-byte prefix throughout and drops `Port` (id 9, BEP-5 DHT), which is
//! out of scope.

use crate::error::ProtocolError;

#[derive(Debug, PartialEq, Clone)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request(u32, u32, u32),
    Piece(u32, u32, Vec<u8>),
    Cancel(u32, u32, u32),
}

impl Message {
    /// Length of the id+payload, i.e. the value carried in the length
    /// prefix (0 for keep-alive, which has no id byte at all).
    fn body_len(&self) -> u32 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 1,
            Message::Have(_) => 5,
            Message::Bitfield(bitfield) => 1 + bitfield.len() as u32,
            Message::Request(..) | Message::Cancel(..) => 13,
            Message::Piece(_, _, block) => 9 + block.len() as u32,
        }
    }

    pub fn id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(0),
            Message::Unchoke => Some(1),
            Message::Interested => Some(2),
            Message::NotInterested => Some(3),
            Message::Have(_) => Some(4),
            Message::Bitfield(_) => Some(5),
            Message::Request(..) => Some(6),
            Message::Piece(..) => Some(7),
            Message::Cancel(..) => Some(8),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut msg = Vec::with_capacity(4 + self.body_len() as usize);
        msg.extend_from_slice(&self.body_len().to_be_bytes());
        if let Some(id) = self.id() {
            msg.push(id);
        }
        match self {
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {}
            Message::Have(index) => msg.extend_from_slice(&index.to_be_bytes()),
            Message::Bitfield(bitfield) => msg.extend_from_slice(bitfield),
            Message::Request(index, begin, length) | Message::Cancel(index, begin, length) => {
                msg.extend_from_slice(&index.to_be_bytes());
                msg.extend_from_slice(&begin.to_be_bytes());
                msg.extend_from_slice(&length.to_be_bytes());
            }
            Message::Piece(index, begin, block) => {
                msg.extend_from_slice(&index.to_be_bytes());
                msg.extend_from_slice(&begin.to_be_bytes());
                msg.extend_from_slice(block);
            }
        }
        msg
    }

    /// Parses a single complete frame (length prefix included) from the
    /// front of `data`. `data` must hold at least `4 + body_len` bytes;
    /// callers buffering from a socket should check
    /// [`Message::frame_len`] before calling this.
    pub fn deserialize(data: &[u8]) -> Result<Message, ProtocolError> {
        if data.len() < 4 {
            return Err(ProtocolError::BadFraming(0));
        }
        let mut len_buf = [0u8; 4];
        len_buf.copy_from_slice(&data[0..4]);
        let body_len_raw = u32::from_be_bytes(len_buf);
        let body_len = body_len_raw as usize;
        if body_len == 0 {
            return Ok(Message::KeepAlive);
        }
        if data.len() < 4 + body_len {
            return Err(ProtocolError::BadFraming(body_len_raw));
        }
        let body = &data[4..4 + body_len];
        let id = body[0];
        let payload = &body[1..];

        let msg = match id {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => {
                if payload.len() != 4 {
                    return Err(ProtocolError::Malformed("bad payload length for this message id".to_string()));
                }
                Message::Have(u32::from_be_bytes(payload.try_into().unwrap()))
            }
            5 => Message::Bitfield(payload.to_vec()),
            6 => {
                if payload.len() != 12 {
                    return Err(ProtocolError::Malformed("bad payload length for this message id".to_string()));
                }
                Message::Request(
                    u32::from_be_bytes(payload[0..4].try_into().unwrap()),
                    u32::from_be_bytes(payload[4..8].try_into().unwrap()),
                    u32::from_be_bytes(payload[8..12].try_into().unwrap()),
                )
            }
            7 => {
                if payload.len() < 8 {
                    return Err(ProtocolError::Malformed("bad payload length for this message id".to_string()));
                }
                Message::Piece(
                    u32::from_be_bytes(payload[0..4].try_into().unwrap()),
                    u32::from_be_bytes(payload[4..8].try_into().unwrap()),
                    payload[8..].to_vec(),
                )
            }
            8 => {
                if payload.len() != 12 {
                    return Err(ProtocolError::Malformed("bad payload length for this message id".to_string()));
                }
                Message::Cancel(
                    u32::from_be_bytes(payload[0..4].try_into().unwrap()),
                    u32::from_be_bytes(payload[4..8].try_into().unwrap()),
                    u32::from_be_bytes(payload[8..12].try_into().unwrap()),
                )
            }
            _ => return Err(ProtocolError::Malformed(format!("unknown message id {id}"))),
        };
        Ok(msg)
    }

    /// Given the front of a buffered byte stream, returns the total frame
    /// length (prefix included) once the 4-byte prefix is available, or
    /// `None` if more bytes must be read first. Used by `PeerSession`'s
    /// read loop to know when a full message has arrived.
    pub fn frame_len(data: &[u8]) -> Option<usize> {
        if data.len() < 4 {
            return None;
        }
        let mut len_buf = [0u8; 4];
        len_buf.copy_from_slice(&data[0..4]);
        Some(4 + u32::from_be_bytes(len_buf) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_alive_round_trips() {
        let msg = Message::KeepAlive;
        let bytes = msg.serialize();
        assert_eq!(bytes, vec![0, 0, 0, 0]);
        assert_eq!(Message::deserialize(&bytes).unwrap(), Message::KeepAlive);
    }

    #[test]
    fn choke_round_trips() {
        let msg = Message::Choke;
        let bytes = msg.serialize();
        assert_eq!(bytes, vec![0, 0, 0, 1, 0]);
        assert_eq!(Message::deserialize(&bytes).unwrap(), Message::Choke);
    }

    #[test]
    fn piece_message_over_255_bytes_does_not_truncate() {
        let block = vec![0xABu8; 16384];
        let msg = Message::Piece(3, 0, block.clone());
        let bytes = msg.serialize();
        assert_eq!(bytes.len(), 4 + 9 + 16384);
        let decoded = Message::deserialize(&bytes).unwrap();
        assert_eq!(decoded, Message::Piece(3, 0, block));
    }

    #[test]
    fn frame_len_reports_full_message_size_before_body_is_buffered() {
        let msg = Message::Request(1, 2, 3);
        let bytes = msg.serialize();
        assert_eq!(Message::frame_len(&bytes[..4]), Some(bytes.len()));
    }

    #[test]
    fn request_and_cancel_round_trip() {
        let req = Message::Request(1, 16384, 16384);
        assert_eq!(Message::deserialize(&req.serialize()).unwrap(), req);
        let cancel = Message::Cancel(1, 16384, 16384);
        assert_eq!(Message::deserialize(&cancel.serialize()).unwrap(), cancel);
    }

    #[test]
    fn have_and_bitfield_round_trip() {
        let have = Message::Have(42);
        assert_eq!(Message::deserialize(&have.serialize()).unwrap(), have);
        let bitfield = Message::Bitfield(vec![0xFF, 0x00, 0xC0]);
        assert_eq!(
            Message::deserialize(&bitfield.serialize()).unwrap(),
            bitfield
        );
    }

    #[test]
    fn unknown_id_is_rejected() {
        let bytes = vec![0, 0, 0, 1, 200];
        assert!(matches!(
            Message::deserialize(&bytes),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let bytes = vec![0, 0, 0, 13, 6, 0, 0];
        assert!(matches!(
            Message::deserialize(&bytes),
            Err(ProtocolError::BadFraming(_))
        ));
    }
}
