//! Piece-addressed storage manager (spec §4.3): maps piece-space onto a
//! contiguous virtual byte array backed by one or more files, supports a
//! resumable session by re-validating on-disk data at `open`, and services
//! both the downloader (write/verify/mark_completed) and the seeder
//! (read_piece) sides.
//!
//! Positional reads/writes use `FileExt::{read_at, write_at}` so concurrent
//! readers never need to coordinate with each other or with a writer of a
//! *different* piece; a writer of the *same* piece is serialized through a
//! dedicated per-piece mutex. Grounded on the file-span read/write pattern
//! in the pack's `file_manager.rs` reference (positional I/O via
//! `FileExt`), generalized here to a full multi-file span table plus resume
//! scan, which a single-file block buffer alone never supports.

use crate::bitfield::BitField;
use crate::error::StorageError;
use crate::metainfo::TorrentInfo;
use sha1::{Digest, Sha1};
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

/// A single backing file's placement within the virtual byte array.
pub struct FileSpan {
    pub path: PathBuf,
    pub start: u64,
    pub end: u64,
}

pub struct Storage {
    piece_length: u64,
    total_length: u64,
    piece_hashes: Vec<[u8; 20]>,
    spans: Vec<FileSpan>,
    files: Vec<File>,
    pieces_status: RwLock<Vec<bool>>,
    piece_write_locks: Vec<Mutex<()>>,
}

impl Storage {
    /// Creates or opens every backing file, extending each to its declared
    /// length, creating intermediate directories first, then runs the
    /// resume scan.
    pub fn open(info: &TorrentInfo, destination: impl AsRef<Path>) -> Result<Storage, StorageError> {
        let destination = destination.as_ref();
        let root: PathBuf = if info.files.len() == 1 && info.files[0].relative_path_components.len() == 1
        {
            destination.to_path_buf()
        } else {
            destination.join(&info.name)
        };

        let mut spans = Vec::with_capacity(info.files.len());
        let mut files = Vec::with_capacity(info.files.len());
        let mut offset = 0u64;
        for entry in &info.files {
            let path = root.join(entry.relative_path_components.iter().collect::<PathBuf>());
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|source| StorageError::Create {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
                .map_err(|source| StorageError::Create {
                    path: path.clone(),
                    source,
                })?;
            file.set_len(entry.length).map_err(|source| StorageError::Create {
                path: path.clone(),
                source,
            })?;

            let start = offset;
            let end = start + entry.length;
            spans.push(FileSpan { path, start, end });
            files.push(file);
            offset = end;
        }

        let total_pieces = info.total_pieces();
        let storage = Storage {
            piece_length: info.piece_length,
            total_length: info.total_length,
            piece_hashes: info.piece_hashes.clone(),
            spans,
            files,
            pieces_status: RwLock::new(vec![false; total_pieces]),
            piece_write_locks: (0..total_pieces).map(|_| Mutex::new(())).collect(),
        };
        storage.resume_scan();
        Ok(storage)
    }

    fn resume_scan(&self) {
        let total_pieces = self.piece_hashes.len();
        let mut status = self.pieces_status.write().unwrap();
        for k in 0..total_pieces {
            let len = self.piece_len(k);
            let possessed = match self.read_piece_uncounted(k, 0, len) {
                Ok(bytes) => {
                    let mut hasher = Sha1::new();
                    hasher.update(&bytes);
                    let digest: [u8; 20] = hasher.finalize().into();
                    digest == self.piece_hashes[k]
                }
                Err(_) => false,
            };
            status[k] = possessed;
        }
    }

    fn piece_len(&self, k: usize) -> u64 {
        let total_pieces = self.piece_hashes.len();
        if k + 1 == total_pieces {
            self.total_length - (total_pieces as u64 - 1) * self.piece_length
        } else {
            self.piece_length
        }
    }

    fn check_piece_index(&self, k: usize) -> Result<(), StorageError> {
        if k >= self.piece_hashes.len() {
            Err(StorageError::PieceOutOfRange(k))
        } else {
            Ok(())
        }
    }

    /// Reads `length` bytes starting at virtual offset `k*piece_length +
    /// offset`, splitting the read across file spans as needed.
    pub fn read_piece(&self, k: usize, offset: u64, length: u64) -> Result<Vec<u8>, StorageError> {
        self.check_piece_index(k)?;
        self.read_piece_uncounted(k, offset, length)
            .map_err(|source| StorageError::Read { piece: k, source })
    }

    fn read_piece_uncounted(&self, k: usize, offset: u64, length: u64) -> std::io::Result<Vec<u8>> {
        let virtual_start = k as u64 * self.piece_length + offset;
        let virtual_end = virtual_start + length;
        let mut out = vec![0u8; length as usize];
        self.for_each_span_in_range(virtual_start, virtual_end, |file_idx, file_off, buf_range| {
            self.files[file_idx].read_exact_at(&mut out[buf_range], file_off)
        })?;
        Ok(out)
    }

    /// Writes `bytes` at virtual offset `k*piece_length`, splitting across
    /// file spans as needed. Serialized per piece index.
    pub fn write_piece(&self, k: usize, bytes: &[u8]) -> Result<(), StorageError> {
        self.check_piece_index(k)?;
        let _guard = self.piece_write_locks[k].lock().unwrap();
        let virtual_start = k as u64 * self.piece_length;
        let virtual_end = virtual_start + bytes.len() as u64;
        self.for_each_span_in_range(virtual_start, virtual_end, |file_idx, file_off, buf_range| {
            self.files[file_idx].write_all_at(&bytes[buf_range], file_off)
        })
        .map_err(|source| StorageError::Write { piece: k, source })
    }

    /// Invokes `op(file_index, file_relative_offset, buf_range)` once per
    /// file span overlapping `[virtual_start, virtual_end)`, in order.
    fn for_each_span_in_range(
        &self,
        virtual_start: u64,
        virtual_end: u64,
        mut op: impl FnMut(usize, u64, std::ops::Range<usize>) -> std::io::Result<()>,
    ) -> std::io::Result<()> {
        let mut cursor = virtual_start;
        let mut buf_pos = 0usize;
        while cursor < virtual_end {
            let span_idx = self
                .spans
                .iter()
                .position(|s| cursor >= s.start && cursor < s.end)
                .ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "virtual offset is past the end of all files",
                    )
                })?;
            let span = &self.spans[span_idx];
            let file_off = cursor - span.start;
            let chunk_len = (span.end - cursor).min(virtual_end - cursor);
            let buf_range = buf_pos..buf_pos + chunk_len as usize;
            op(span_idx, file_off, buf_range)?;
            cursor += chunk_len;
            buf_pos += chunk_len as usize;
        }
        Ok(())
    }

    pub fn verify_piece(&self, k: usize, bytes: &[u8]) -> bool {
        if k >= self.piece_hashes.len() {
            return false;
        }
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        let digest: [u8; 20] = hasher.finalize().into();
        digest == self.piece_hashes[k]
    }

    /// Idempotent: sets `pieces_status[k] = true`.
    pub fn mark_completed(&self, k: usize) {
        if k >= self.piece_hashes.len() {
            return;
        }
        let mut status = self.pieces_status.write().unwrap();
        if !status[k] {
            status[k] = true;
            log::info!(
                "piece {k} complete ({}/{})",
                status.iter().filter(|&&b| b).count(),
                status.len()
            );
        }
    }

    pub fn has_piece(&self, k: usize) -> bool {
        self.pieces_status.read().unwrap().get(k).copied().unwrap_or(false)
    }

    /// MSB-first packed bitfield, `ceil(total_pieces/8)` bytes, spare bits zero.
    pub fn bitfield(&self) -> Vec<u8> {
        let status = self.pieces_status.read().unwrap();
        BitField::from_pieces_status(&status).as_bytes().to_vec()
    }

    pub fn is_complete(&self) -> bool {
        self.pieces_status.read().unwrap().iter().all(|&b| b)
    }

    pub fn total_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    pub fn piece_length_of(&self, k: usize) -> u64 {
        self.piece_len(k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::FileEntry;
    use tempfile::tempdir;

    fn hash(bytes: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        hasher.finalize().into()
    }

    fn single_file_info(piece_length: u64, pieces: &[&[u8]]) -> TorrentInfo {
        let total_length: u64 = pieces.iter().map(|p| p.len() as u64).sum();
        TorrentInfo {
            announce_tiers: vec![],
            name: "test.bin".to_string(),
            piece_length,
            piece_hashes: pieces.iter().map(|p| hash(p)).collect(),
            files: vec![FileEntry {
                relative_path_components: vec!["test.bin".to_string()],
                length: total_length,
            }],
            info_hash: [0u8; 20],
            total_length,
        }
    }

    fn multi_file_info(piece_length: u64, pieces: &[&[u8]], files: Vec<(&str, u64)>) -> TorrentInfo {
        let total_length: u64 = files.iter().map(|(_, l)| *l).sum();
        TorrentInfo {
            announce_tiers: vec![],
            name: "root".to_string(),
            piece_length,
            piece_hashes: pieces.iter().map(|p| hash(p)).collect(),
            files: files
                .into_iter()
                .map(|(name, length)| FileEntry {
                    relative_path_components: vec![name.to_string()],
                    length,
                })
                .collect(),
            info_hash: [0u8; 20],
            total_length,
        }
    }

    #[test]
    fn single_file_round_trip_scenario_1() {
        // spec §8 scenario 1
        let pieces: [&[u8]; 3] = [b"abcdefgh", b"ijklmnop", b"qrstuvwx"];
        let info = single_file_info(8, &pieces);
        let dir = tempdir().unwrap();
        let storage = Storage::open(&info, dir.path()).unwrap();

        for (k, piece) in pieces.iter().enumerate() {
            storage.write_piece(k, piece).unwrap();
            assert!(storage.verify_piece(k, piece));
            storage.mark_completed(k);
        }

        assert_eq!(storage.read_piece(1, 2, 4).unwrap(), b"klmn");
        assert!(!storage.verify_piece(0, b"12345678"));
        assert_eq!(storage.bitfield(), vec![0xE0]);
        assert!(storage.is_complete());
    }

    #[test]
    fn piece_spanning_file_boundary_scenario_2() {
        // spec §8 scenario 2
        let pieces: [&[u8]; 2] = [b"abcdefg1", b"g2345678"];
        let info = multi_file_info(8, &pieces, vec![("f1", 6), ("f2", 10)]);
        let dir = tempdir().unwrap();
        let storage = Storage::open(&info, dir.path()).unwrap();

        storage.write_piece(0, b"abcdefg1").unwrap();
        let f1 = fs::read(dir.path().join("root").join("f1")).unwrap();
        assert_eq!(f1, b"abcdef");
        let f2 = fs::read(dir.path().join("root").join("f2")).unwrap();
        assert_eq!(&f2[..2], b"g1");

        storage.write_piece(1, b"g2345678").unwrap();
        assert_eq!(storage.read_piece(0, 6, 2).unwrap(), b"g1");
    }

    #[test]
    fn resume_scan_detects_already_complete_files_scenario_3() {
        // spec §8 scenario 3
        let pieces: [&[u8]; 2] = [b"abcdefg1", b"g2345678"];
        let info = multi_file_info(8, &pieces, vec![("f1", 6), ("f2", 10)]);
        let dir = tempdir().unwrap();
        {
            let storage = Storage::open(&info, dir.path()).unwrap();
            storage.write_piece(0, b"abcdefg1").unwrap();
            storage.write_piece(1, b"g2345678").unwrap();
        }

        let storage = Storage::open(&info, dir.path()).unwrap();
        assert!(storage.is_complete());
    }

    #[test]
    fn mark_completed_is_idempotent() {
        let pieces: [&[u8]; 1] = [b"abcdefgh"];
        let info = single_file_info(8, &pieces);
        let dir = tempdir().unwrap();
        let storage = Storage::open(&info, dir.path()).unwrap();
        storage.write_piece(0, b"abcdefgh").unwrap();
        storage.mark_completed(0);
        storage.mark_completed(0);
        assert_eq!(storage.bitfield(), vec![0x80]);
    }

    #[test]
    fn reopening_complete_directory_mutates_nothing() {
        let pieces: [&[u8]; 1] = [b"abcdefgh"];
        let info = single_file_info(8, &pieces);
        let dir = tempdir().unwrap();
        {
            let storage = Storage::open(&info, dir.path()).unwrap();
            storage.write_piece(0, b"abcdefgh").unwrap();
        }
        let before = fs::read(dir.path().join("test.bin")).unwrap();
        let storage = Storage::open(&info, dir.path()).unwrap();
        assert!(storage.is_complete());
        let after = fs::read(dir.path().join("test.bin")).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn partitioned_reads_concatenate_to_whole_read() {
        let pieces: [&[u8]; 1] = [b"abcdefgh"];
        let info = single_file_info(8, &pieces);
        let dir = tempdir().unwrap();
        let storage = Storage::open(&info, dir.path()).unwrap();
        storage.write_piece(0, b"abcdefgh").unwrap();

        let whole = storage.read_piece(0, 0, 8).unwrap();
        let mut parts = storage.read_piece(0, 0, 3).unwrap();
        parts.extend(storage.read_piece(0, 3, 5).unwrap());
        assert_eq!(whole, parts);
    }

    #[test]
    fn last_piece_length_is_remainder() {
        let pieces: [&[u8]; 2] = [b"abcdefgh", b"ij"];
        let info = single_file_info(8, &pieces);
        assert_eq!(info.piece_len(1), 2);
        let dir = tempdir().unwrap();
        let storage = Storage::open(&info, dir.path()).unwrap();
        assert_eq!(storage.piece_length_of(1), 2);
        storage.write_piece(1, b"ij").unwrap();
        assert_eq!(storage.read_piece(1, 0, 2).unwrap(), b"ij");
    }

    #[test]
    fn piece_read_error_during_resume_scan_leaves_piece_unpossessed() {
        let pieces: [&[u8]; 1] = [b"abcdefgh"];
        let info = single_file_info(8, &pieces);
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.bin");
        fs::write(&path, b"wrongcon").unwrap();
        let storage = Storage::open(&info, dir.path()).unwrap();
        assert!(!storage.has_piece(0));
        assert!(!storage.is_complete());
    }
}
