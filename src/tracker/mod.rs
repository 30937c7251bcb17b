//! Tracker client (spec §4.4): resolves peers for a torrent by iterating
//! announce tiers in order, trying HTTP(S) or UDP depending on URL scheme,
//! and returning the first non-empty peer list.

pub mod http;
pub mod udp;

use crate::error::TrackerError;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use url::Url;

/// Fixed per-call timeout recommended by spec §4.4.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct AnnounceParams<'a> {
    pub info_hash: &'a [u8; 20],
    pub peer_id: &'a [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// Tries each tier URL in order; returns the first non-empty peer list, or
/// `TrackerError::NoPeers` once every URL has failed or returned nothing.
pub fn announce_tiers(
    tiers: &[String],
    params: AnnounceParams<'_>,
) -> Result<Vec<SocketAddr>, TrackerError> {
    for url in tiers {
        let peers = match announce_one(url, params) {
            Ok(peers) => peers,
            Err(err) => {
                log::warn!("tracker {url} failed: {err}");
                continue;
            }
        };
        if !peers.is_empty() {
            return Ok(peers);
        }
        log::warn!("tracker {url} returned no peers");
    }
    Err(TrackerError::NoPeers)
}

fn announce_one(url: &str, params: AnnounceParams<'_>) -> Result<Vec<SocketAddr>, TrackerError> {
    let parsed = Url::parse(url).map_err(|_| TrackerError::UnsupportedUrl(url.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => http::announce(&parsed, params),
        "udp" => udp::announce(&parsed, params),
        other => Err(TrackerError::UnsupportedUrl(other.to_string())),
    }
}

pub(crate) fn socket_addr_v4(octets: [u8; 4], port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(octets), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_peers_when_all_tiers_fail() {
        let info_hash = [0u8; 20];
        let peer_id = [0u8; 20];
        let params = AnnounceParams {
            info_hash: &info_hash,
            peer_id: &peer_id,
            port: 6889,
            uploaded: 0,
            downloaded: 0,
            left: 0,
        };
        let result = announce_tiers(&["not a url at all".to_string()], params);
        assert!(matches!(result, Err(TrackerError::NoPeers)));
    }
}
