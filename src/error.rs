//! Typed error taxonomy (spec §7). Every fallible boundary in the crate
//! returns one of these enums directly (via `thiserror`'s `#[from]`/`?`)
//! rather than flattening into a single dynamic error type; these are what
//! gets logged and what callers that care about recovery policy match on.

use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("missing required key `{0}` in torrent metainfo")]
    MissingKey(&'static str),
    #[error("`piece length` must be positive, got {0}")]
    NonPositivePieceLength(i64),
    #[error("`pieces` length {0} is not a multiple of 20")]
    BadPiecesLength(usize),
    #[error("info dict has neither `length` nor `files`")]
    NoLengthOrFiles,
    #[error("failed to read torrent file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to decode bencoded metainfo: {0}")]
    Bencode(#[from] serde_bencode::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to create or open backing file {path}: {source}")]
    Create {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("read failed at piece {piece}: {source}")]
    Read {
        piece: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("write failed at piece {piece}: {source}")]
    Write {
        piece: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("piece index {0} out of range")]
    PieceOutOfRange(usize),
}

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("connect failed: {0}")]
    Connect(#[from] std::io::Error),
    #[error("malformed tracker response: {0}")]
    MalformedResponse(String),
    #[error("transaction id mismatch: sent {sent:#x}, got {got:#x}")]
    TransactionIdMismatch { sent: u32, got: u32 },
    #[error("tracker call to {addr} timed out")]
    Timeout { addr: SocketAddr },
    #[error("no tracker URL returned any peers")]
    NoPeers,
    #[error("unsupported announce URL: {0}")]
    UnsupportedUrl(String),
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("socket error during handshake: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected protocol string {0:?}")]
    ProtocolMismatch(String),
    #[error("info_hash mismatch")]
    InfoHashMismatch,
    #[error("handshake was too short ({0} bytes)")]
    Truncated(usize),
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed wire message: {0}")]
    Malformed(String),
    #[error("unexpected framing: length {0} does not match expected payload")]
    BadFraming(u32),
    #[error("piece block arrived out of order: expected begin={expected}, got {got}")]
    OutOfOrderBlock { expected: u32, got: u32 },
}

#[derive(Debug, thiserror::Error)]
#[error("piece {index} hash mismatch")]
pub struct HashMismatch {
    pub index: usize,
}
