//! Seeder listener (spec §4.6): accepts inbound peer connections and
//! serves pieces from storage. Follows the same `mio::net::TcpListener`
//! polling pattern used for outbound connections, generalized here to a
//! 1-second accept timeout and a worker-thread-per-connection model
//! instead of a single-connection struct.

use crate::bitfield::BitField;
use crate::control::ControlState;
use crate::error::{HandshakeError, ProtocolError};
use crate::peer::handshake::Handshake;
use crate::peer::message::Message;
use crate::storage::Storage;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const ACCEPT_TIMEOUT: Duration = Duration::from_secs(1);
const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const LISTENER_TOKEN: Token = Token(0);

pub fn run(
    port: u16,
    info_hash: [u8; 20],
    our_peer_id: [u8; 20],
    storage: Arc<Storage>,
    control: Arc<ControlState>,
) -> std::io::Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let mut listener = match TcpListener::bind(addr) {
        Ok(listener) => listener,
        Err(e) => {
            // Seeder port in use is logged, not fatal (spec §7): seeding is optional.
            log::warn!("seeder listener failed to bind {addr}: {e}, seeding disabled");
            return Ok(());
        }
    };

    let mut poll = Poll::new()?;
    poll.registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
    let mut events = Events::with_capacity(16);

    log::info!("seeder listening on {addr}");
    while !control.is_stopped() {
        poll.poll(&mut events, Some(ACCEPT_TIMEOUT))?;
        for event in events.iter() {
            if event.token() != LISTENER_TOKEN {
                continue;
            }
            loop {
                match listener.accept() {
                    Ok((stream, peer_addr)) => {
                        let storage = storage.clone();
                        let control = control.clone();
                        thread::spawn(move || {
                            if let Err(e) =
                                serve_peer(stream, info_hash, our_peer_id, storage, control)
                            {
                                log::warn!("inbound peer {peer_addr} terminated: {e}");
                            }
                        });
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        log::warn!("accept error: {e}");
                        break;
                    }
                }
            }
        }
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
enum ServeError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Storage(#[from] crate::error::StorageError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn serve_peer(
    mut stream: TcpStream,
    info_hash: [u8; 20],
    our_peer_id: [u8; 20],
    storage: Arc<Storage>,
    control: Arc<ControlState>,
) -> Result<(), ServeError> {
    let mut poll = Poll::new()?;
    poll.registry()
        .register(&mut stream, Token(0), Interest::READABLE | Interest::WRITABLE)?;
    let mut events = Events::with_capacity(16);

    let mut handshake_buf = Vec::with_capacity(68);
    while handshake_buf.len() < 68 {
        poll.poll(&mut events, Some(POLL_TIMEOUT))?;
        for event in events.iter() {
            if !event.is_readable() {
                continue;
            }
            let mut chunk = [0u8; 68];
            match stream.read(&mut chunk) {
                Ok(0) => return Err(HandshakeError::Truncated(handshake_buf.len()).into()),
                Ok(n) => handshake_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
    let peer_handshake = Handshake::from_bytes(&handshake_buf)?;
    peer_handshake.validate(&info_hash)?;

    let reply = Handshake::new(info_hash, our_peer_id);
    write_blocking(&mut stream, &mut poll, &mut events, &reply.to_bytes())?;
    write_blocking(
        &mut stream,
        &mut poll,
        &mut events,
        &Message::Bitfield(storage.bitfield()).serialize(),
    )?;
    write_blocking(&mut stream, &mut poll, &mut events, &Message::Unchoke.serialize())?;

    let mut read_buf = Vec::new();
    let mut peer_bitfield = BitField::new(storage.total_pieces());
    loop {
        if control.is_stopped() {
            return Ok(());
        }
        poll.poll(&mut events, Some(POLL_TIMEOUT))?;
        let mut closed = false;
        for event in events.iter() {
            if !event.is_readable() {
                continue;
            }
            let mut chunk = [0u8; 65536];
            loop {
                match stream.read(&mut chunk) {
                    Ok(0) => {
                        closed = true;
                        break;
                    }
                    Ok(n) => read_buf.extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e.into()),
                }
            }
        }

        loop {
            let Some(frame_len) = Message::frame_len(&read_buf) else {
                break;
            };
            if read_buf.len() < frame_len {
                break;
            }
            let frame = read_buf[..frame_len].to_vec();
            read_buf.drain(..frame_len);
            match Message::deserialize(&frame)? {
                Message::Request(index, begin, length) => {
                    if storage.has_piece(index as usize) {
                        let block = storage.read_piece(index as usize, begin as u64, length as u64)?;
                        write_blocking(
                            &mut stream,
                            &mut poll,
                            &mut events,
                            &Message::Piece(index, begin, block).serialize(),
                        )?;
                    }
                }
                Message::Have(index) => {
                    if (index as usize) < peer_bitfield.len() {
                        peer_bitfield.set(index as usize);
                    }
                }
                Message::Bitfield(payload) => {
                    peer_bitfield = BitField::from_wire_payload(&payload, storage.total_pieces());
                }
                Message::NotInterested => return Ok(()),
                _ => {}
            }
        }

        if closed {
            return Ok(());
        }
    }
}

fn write_blocking(
    stream: &mut TcpStream,
    poll: &mut Poll,
    events: &mut Events,
    bytes: &[u8],
) -> std::io::Result<()> {
    let mut written = 0;
    while written < bytes.len() {
        match stream.write(&bytes[written..]) {
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                poll.poll(events, Some(POLL_TIMEOUT))?;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
