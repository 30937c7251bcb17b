//! Session coordinator (spec §4.7): orchestrates one torrent end to end —
//! parse metainfo, open storage, announce, run the seeder listener in the
//! background, drive outbound peer sessions, then sit in the seed phase.
//! An earlier `peer::manager::PeerManager` drove a flat list of
//! connections from a single function; this version threads
//! `ControlState` through every loop boundary.

use crate::control::ControlState;
use crate::error::StorageError;
use crate::metainfo::TorrentInfo;
use crate::peer::session::PeerSession;
use crate::storage::Storage;
use crate::tracker::{self, AnnounceParams};
use mio::net::TcpStream as MioTcpStream;
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_SLEEP: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("failed to parse torrent: {0}")]
    Parse(#[from] crate::error::ParseError),
    #[error("failed to open storage: {0}")]
    Storage(#[from] StorageError),
}

pub fn run(
    torrent_path: impl AsRef<Path>,
    destination: impl AsRef<Path>,
    seed_port: u16,
    our_peer_id: [u8; 20],
    control: Arc<ControlState>,
) -> Result<(), CoordinatorError> {
    let info = TorrentInfo::from_file(torrent_path)?;
    let storage = Arc::new(Storage::open(&info, destination)?);
    log::info!(
        "opened {} ({} pieces, {} already possessed)",
        info.name,
        storage.total_pieces(),
        storage.bitfield().iter().map(|b| b.count_ones()).sum::<u32>()
    );

    if storage.is_complete() {
        log::info!("{} is already complete, skipping straight to seeding", info.name);
    }

    let listener_storage = storage.clone();
    let listener_control = control.clone();
    let info_hash = info.info_hash;
    thread::spawn(move || {
        if let Err(e) = crate::listener::run(
            seed_port,
            info_hash,
            our_peer_id,
            listener_storage,
            listener_control,
        ) {
            log::error!("seeder listener exited: {e}");
        }
    });

    if !storage.is_complete() {
        download_loop(&info, &storage, &control, our_peer_id, seed_port)?;
    }

    seed_phase(&control);
    Ok(())
}

fn download_loop(
    info: &TorrentInfo,
    storage: &Arc<Storage>,
    control: &Arc<ControlState>,
    our_peer_id: [u8; 20],
    seed_port: u16,
) -> Result<(), CoordinatorError> {
    while !storage.is_complete() && !control.is_stopped() {
        if !control.wait_if_paused() {
            return Ok(());
        }

        let params = AnnounceParams {
            info_hash: &info.info_hash,
            peer_id: &our_peer_id,
            port: seed_port,
            uploaded: 0,
            downloaded: 0,
            left: total_remaining(storage),
        };
        let peers = match tracker::announce_tiers(&info.announce_tiers, params) {
            Ok(peers) => peers,
            Err(e) => {
                log::warn!("announce failed: {e}, retrying in {RETRY_SLEEP:?}");
                sleep_respecting_stop(control, RETRY_SLEEP);
                continue;
            }
        };

        let mut connected_any = false;
        for addr in peers {
            if storage.is_complete() || control.is_stopped() {
                break;
            }
            if !control.wait_if_paused() {
                return Ok(());
            }
            match connect_with_timeout(addr) {
                Ok(stream) => {
                    connected_any = true;
                    let storage = storage.clone();
                    let session_control = control.clone();
                    let info_hash = info.info_hash;
                    if let Err(e) =
                        PeerSession::run(stream, storage, session_control, info_hash, our_peer_id)
                    {
                        log::warn!("peer session with {addr} ended: {e}");
                    }
                }
                Err(e) => log::warn!("failed to connect to {addr}: {e}"),
            }
        }

        if !connected_any && !storage.is_complete() {
            sleep_respecting_stop(control, RETRY_SLEEP);
        }
    }
    Ok(())
}

fn seed_phase(control: &Arc<ControlState>) {
    log::info!("entering seed phase");
    while control.wait_if_paused() {
        thread::sleep(Duration::from_millis(200));
    }
}

fn total_remaining(storage: &Storage) -> u64 {
    (0..storage.total_pieces())
        .filter(|&k| !storage.has_piece(k))
        .map(|k| storage.piece_length_of(k))
        .sum()
}

fn sleep_respecting_stop(control: &ControlState, duration: Duration) {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        if control.is_stopped() {
            return;
        }
        thread::sleep(Duration::from_millis(100).min(deadline.saturating_duration_since(Instant::now())));
    }
}

fn connect_with_timeout(addr: SocketAddr) -> std::io::Result<MioTcpStream> {
    let std_stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
    std_stream.set_nonblocking(true)?;
    Ok(MioTcpStream::from_std(std_stream))
}
