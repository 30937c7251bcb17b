//! Metainfo parsing (spec §4.2): decodes a `.torrent` file into
//! [`TorrentInfo`], the immutable description everything else in the crate
//! is built around.

use crate::bencode;
use crate::error::ParseError;
use serde::Deserialize;
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use std::path::Path;

/// One file entry inside a (possibly multi-file) torrent.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub relative_path_components: Vec<String>,
    pub length: u64,
}

#[derive(Debug, Clone)]
pub struct TorrentInfo {
    pub announce_tiers: Vec<String>,
    pub name: String,
    pub piece_length: u64,
    pub piece_hashes: Vec<[u8; 20]>,
    pub files: Vec<FileEntry>,
    pub info_hash: [u8; 20],
    pub total_length: u64,
}

impl TorrentInfo {
    pub fn total_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Length of piece `k`: `piece_length` for every piece but the last,
    /// which is whatever remains of `total_length`.
    pub fn piece_len(&self, k: usize) -> u64 {
        let total_pieces = self.total_pieces();
        if k + 1 == total_pieces {
            self.total_length - (total_pieces as u64 - 1) * self.piece_length
        } else {
            self.piece_length
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ParseError> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let raw: RawTorrent = serde_bencode::from_bytes(bytes)?;

        let piece_length = raw.info.piece_length;
        if piece_length <= 0 {
            return Err(ParseError::NonPositivePieceLength(piece_length));
        }
        let piece_length = piece_length as u64;

        let pieces_bytes = raw.info.pieces.as_ref();
        if pieces_bytes.len() % 20 != 0 {
            return Err(ParseError::BadPiecesLength(pieces_bytes.len()));
        }
        let piece_hashes: Vec<[u8; 20]> = pieces_bytes
            .chunks_exact(20)
            .map(|c| c.try_into().expect("chunks_exact(20) yields 20 bytes"))
            .collect();

        let (files, total_length) = match (&raw.info.length, &raw.info.files) {
            (Some(length), None) => {
                let entry = FileEntry {
                    relative_path_components: vec![raw.info.name.clone()],
                    length: *length as u64,
                };
                let total = entry.length;
                (vec![entry], total)
            }
            (None, Some(files)) => {
                let mut entries = Vec::with_capacity(files.len());
                let mut total = 0u64;
                for f in files {
                    let len = f.length as u64;
                    total += len;
                    entries.push(FileEntry {
                        relative_path_components: f.path.clone(),
                        length: len,
                    });
                }
                (entries, total)
            }
            _ => return Err(ParseError::NoLengthOrFiles),
        };

        let (start, end) = bencode::raw_span(bytes, b"info")
            .map_err(|_| ParseError::MissingKey("info"))?;
        let mut hasher = Sha1::new();
        hasher.update(&bytes[start..end]);
        let info_hash: [u8; 20] = hasher.finalize().into();

        let announce_tiers = match &raw.announce_list {
            Some(tiers) => tiers.iter().flatten().cloned().collect(),
            None => raw
                .announce
                .clone()
                .map(|a| vec![a])
                .unwrap_or_default(),
        };

        Ok(TorrentInfo {
            announce_tiers,
            name: raw.info.name,
            piece_length,
            piece_hashes,
            files,
            info_hash,
            total_length,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawFile {
    length: i64,
    path: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawInfo {
    name: String,
    pieces: ByteBuf,
    #[serde(rename = "piece length")]
    piece_length: i64,
    #[serde(default)]
    length: Option<i64>,
    #[serde(default)]
    files: Option<Vec<RawFile>>,
}

#[derive(Debug, Deserialize)]
struct RawTorrent {
    info: RawInfo,
    #[serde(default)]
    announce: Option<String>,
    #[serde(default, rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{encode, Value};
    use std::collections::BTreeMap;

    fn single_file_torrent(piece_length: i64, length: i64, pieces: &[u8]) -> Vec<u8> {
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), Value::Bytes(b"test.bin".to_vec()));
        info.insert(b"piece length".to_vec(), Value::Int(piece_length));
        info.insert(b"pieces".to_vec(), Value::Bytes(pieces.to_vec()));
        info.insert(b"length".to_vec(), Value::Int(length));

        let mut root = BTreeMap::new();
        root.insert(
            b"announce".to_vec(),
            Value::Bytes(b"http://tracker.example/announce".to_vec()),
        );
        root.insert(b"info".to_vec(), Value::Dict(info));

        encode(&Value::Dict(root))
    }

    #[test]
    fn parses_single_file_torrent() {
        let pieces = vec![0u8; 40]; // two dummy 20-byte hashes
        let bytes = single_file_torrent(8, 24, &pieces);
        let info = TorrentInfo::from_bytes(&bytes).unwrap();
        assert_eq!(info.name, "test.bin");
        assert_eq!(info.piece_length, 8);
        assert_eq!(info.total_length, 24);
        assert_eq!(info.files.len(), 1);
        assert_eq!(info.files[0].relative_path_components, vec!["test.bin"]);
    }

    #[test]
    fn info_hash_matches_raw_info_bytes() {
        let pieces = vec![1u8; 20];
        let bytes = single_file_torrent(8, 8, &pieces);
        let info = TorrentInfo::from_bytes(&bytes).unwrap();

        let (start, end) = bencode::raw_span(&bytes, b"info").unwrap();
        let mut hasher = Sha1::new();
        hasher.update(&bytes[start..end]);
        let expected: [u8; 20] = hasher.finalize().into();
        assert_eq!(info.info_hash, expected);
    }

    #[test]
    fn rejects_non_positive_piece_length() {
        let bytes = single_file_torrent(0, 8, &[0u8; 20]);
        assert!(matches!(
            TorrentInfo::from_bytes(&bytes),
            Err(ParseError::NonPositivePieceLength(0))
        ));
    }

    #[test]
    fn rejects_bad_pieces_length() {
        let bytes = single_file_torrent(8, 8, &[0u8; 19]);
        assert!(matches!(
            TorrentInfo::from_bytes(&bytes),
            Err(ParseError::BadPiecesLength(19))
        ));
    }

    #[test]
    fn announce_list_takes_precedence_and_flattens_in_order() {
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), Value::Bytes(b"f".to_vec()));
        info.insert(b"piece length".to_vec(), Value::Int(4));
        info.insert(b"pieces".to_vec(), Value::Bytes(vec![0u8; 20]));
        info.insert(b"length".to_vec(), Value::Int(4));

        let mut root = BTreeMap::new();
        root.insert(
            b"announce".to_vec(),
            Value::Bytes(b"http://ignored/announce".to_vec()),
        );
        root.insert(
            b"announce-list".to_vec(),
            Value::List(vec![
                Value::List(vec![
                    Value::Bytes(b"http://tier1a".to_vec()),
                    Value::Bytes(b"http://tier1b".to_vec()),
                ]),
                Value::List(vec![Value::Bytes(b"http://tier2".to_vec())]),
            ]),
        );
        root.insert(b"info".to_vec(), Value::Dict(info));

        let bytes = encode(&Value::Dict(root));
        let info = TorrentInfo::from_bytes(&bytes).unwrap();
        assert_eq!(
            info.announce_tiers,
            vec!["http://tier1a", "http://tier1b", "http://tier2"]
        );
    }
}
