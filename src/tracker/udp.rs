//! UDP tracker announce (spec §4.4, BEP-15): two-stage connect+announce
//! exchange over a `mio`-polled UDP socket with a fixed 16/98-byte binary
//! layout. An earlier revision built this framing with
//! `serde_bencode::to_bytes`/`from_bytes`, which encodes bencode text
//! framing, not BEP-15's big-endian binary layout — that was a real bug;
//! this rewrites the wire format directly with `byteorder`, which was
//! already a dependency.

use super::{socket_addr_v4, AnnounceParams, CALL_TIMEOUT};
use crate::error::TrackerError;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use rand::Rng;
use std::io::Cursor;
use std::net::{SocketAddr, ToSocketAddrs};
use url::Url;

/// Magic constant for the UDP tracker protocol (BEP-15).
const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const TOKEN: Token = Token(0);

pub fn announce(url: &Url, params: AnnounceParams<'_>) -> Result<Vec<SocketAddr>, TrackerError> {
    let host = url
        .host_str()
        .ok_or_else(|| TrackerError::UnsupportedUrl(url.to_string()))?;
    let port = url.port().ok_or_else(|| TrackerError::UnsupportedUrl(url.to_string()))?;
    let addr = (host, port)
        .to_socket_addrs()
        .map_err(TrackerError::Connect)?
        .next()
        .ok_or_else(|| TrackerError::UnsupportedUrl(url.to_string()))?;

    let mut socket = UdpSocket::bind("0.0.0.0:0".parse().unwrap()).map_err(TrackerError::Connect)?;
    let mut poll = Poll::new().map_err(TrackerError::Connect)?;
    poll.registry()
        .register(&mut socket, TOKEN, Interest::READABLE)
        .map_err(TrackerError::Connect)?;
    let mut events = Events::with_capacity(4);

    let connection_id = connect(&socket, &mut poll, &mut events, addr)?;
    announce_request(&socket, &mut poll, &mut events, addr, connection_id, params)
}

fn connect(
    socket: &UdpSocket,
    poll: &mut Poll,
    events: &mut Events,
    addr: SocketAddr,
) -> Result<u64, TrackerError> {
    let txn_id: u32 = rand::thread_rng().gen();
    let mut req = Vec::with_capacity(16);
    req.write_u64::<BigEndian>(PROTOCOL_ID).unwrap();
    req.write_u32::<BigEndian>(ACTION_CONNECT).unwrap();
    req.write_u32::<BigEndian>(txn_id).unwrap();

    socket.send_to(&req, addr).map_err(TrackerError::Connect)?;
    poll.poll(events, Some(CALL_TIMEOUT))
        .map_err(TrackerError::Connect)?;
    if events.is_empty() {
        return Err(TrackerError::Timeout { addr });
    }

    let mut buf = [0u8; 16];
    let (len, _) = socket.recv_from(&mut buf).map_err(TrackerError::Connect)?;
    if len < 16 {
        return Err(TrackerError::MalformedResponse(
            "connect reply shorter than 16 bytes".to_string(),
        ));
    }
    let mut cursor = Cursor::new(&buf[..len]);
    let action = cursor.read_u32::<BigEndian>().unwrap();
    let got_txn = cursor.read_u32::<BigEndian>().unwrap();
    let connection_id = cursor.read_u64::<BigEndian>().unwrap();

    if got_txn != txn_id {
        return Err(TrackerError::TransactionIdMismatch {
            sent: txn_id,
            got: got_txn,
        });
    }
    if action != ACTION_CONNECT {
        return Err(TrackerError::MalformedResponse(format!(
            "unexpected action {action} in connect reply"
        )));
    }
    Ok(connection_id)
}

fn announce_request(
    socket: &UdpSocket,
    poll: &mut Poll,
    events: &mut Events,
    addr: SocketAddr,
    connection_id: u64,
    params: AnnounceParams<'_>,
) -> Result<Vec<SocketAddr>, TrackerError> {
    // A fresh transaction id per request, not reused from connect (spec §9
    // Open Question: the stricter option is acceptable here).
    let txn_id: u32 = rand::thread_rng().gen();
    let key: u32 = rand::thread_rng().gen();

    let mut req = Vec::with_capacity(98);
    req.write_u64::<BigEndian>(connection_id).unwrap();
    req.write_u32::<BigEndian>(ACTION_ANNOUNCE).unwrap();
    req.write_u32::<BigEndian>(txn_id).unwrap();
    req.extend_from_slice(params.info_hash);
    req.extend_from_slice(params.peer_id);
    req.write_u64::<BigEndian>(params.downloaded).unwrap();
    req.write_u64::<BigEndian>(params.left).unwrap();
    req.write_u64::<BigEndian>(params.uploaded).unwrap();
    req.write_u32::<BigEndian>(0).unwrap(); // event = none
    req.write_u32::<BigEndian>(0).unwrap(); // ip = default
    req.write_u32::<BigEndian>(key).unwrap();
    req.write_i32::<BigEndian>(-1).unwrap(); // num_want = default
    req.write_u16::<BigEndian>(params.port).unwrap();
    debug_assert_eq!(req.len(), 98);

    socket.send_to(&req, addr).map_err(TrackerError::Connect)?;
    poll.poll(events, Some(CALL_TIMEOUT))
        .map_err(TrackerError::Connect)?;
    if events.is_empty() {
        return Err(TrackerError::Timeout { addr });
    }

    let mut buf = [0u8; 2048];
    let (len, _) = socket.recv_from(&mut buf).map_err(TrackerError::Connect)?;
    if len < 20 {
        return Err(TrackerError::MalformedResponse(
            "announce reply shorter than 20 bytes".to_string(),
        ));
    }
    let mut cursor = Cursor::new(&buf[..20]);
    let action = cursor.read_u32::<BigEndian>().unwrap();
    let got_txn = cursor.read_u32::<BigEndian>().unwrap();
    let _interval = cursor.read_u32::<BigEndian>().unwrap();
    let _leechers = cursor.read_u32::<BigEndian>().unwrap();
    let _seeders = cursor.read_u32::<BigEndian>().unwrap();

    if got_txn != txn_id {
        return Err(TrackerError::TransactionIdMismatch {
            sent: txn_id,
            got: got_txn,
        });
    }
    if action != ACTION_ANNOUNCE {
        return Err(TrackerError::MalformedResponse(format!(
            "unexpected action {action} in announce reply"
        )));
    }

    let peer_bytes = &buf[20..len];
    if peer_bytes.len() % 6 != 0 {
        return Err(TrackerError::MalformedResponse(format!(
            "peer list length {} is not a multiple of 6",
            peer_bytes.len()
        )));
    }
    Ok(peer_bytes
        .chunks_exact(6)
        .map(|c| {
            let port = u16::from_be_bytes([c[4], c[5]]);
            socket_addr_v4([c[0], c[1], c[2], c[3]], port)
        })
        .collect())
}
