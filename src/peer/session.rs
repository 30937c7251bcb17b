//! Outbound peer wire protocol state machine (spec §4.5). One `PeerSession`
//! owns one TCP connection end to end: handshake, initial bitfield +
//! interested, then a message loop polled on a short timeout so the
//! download state machine can pump requests and the caller can observe
//! `ControlState` between reads. The connection scaffold this replaces
//! buffered entire messages with blocking reads and had no download
//! state machine at all — it only relayed messages to a channel.

use crate::bitfield::BitField;
use crate::control::ControlState;
use crate::error::{HandshakeError, ProtocolError};
use crate::peer::handshake::Handshake;
use crate::peer::message::Message;
use crate::storage::Storage;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const BLOCK_SIZE: u32 = 16384;
const TOKEN: Token = Token(0);

#[derive(Debug)]
enum DownloadState {
    Idle,
    AwaitingPiece { index: usize, buffer: Vec<u8> },
}

pub struct PeerSession {
    stream: TcpStream,
    poll: Poll,
    events: Events,
    storage: Arc<Storage>,
    control: Arc<ControlState>,
    info_hash: [u8; 20],
    peer_choking: bool,
    am_interested: bool,
    peer_bitfield: BitField,
    state: DownloadState,
    read_buf: Vec<u8>,
}

impl PeerSession {
    /// Takes ownership of an already-connected stream (the coordinator is
    /// responsible for the connect-with-timeout per spec §4.7) and runs
    /// the handshake plus message loop to completion.
    pub fn run(
        mut stream: TcpStream,
        storage: Arc<Storage>,
        control: Arc<ControlState>,
        info_hash: [u8; 20],
        our_peer_id: [u8; 20],
    ) -> Result<(), SessionError> {
        let mut poll = Poll::new().map_err(HandshakeError::Io)?;
        poll.registry()
            .register(&mut stream, TOKEN, Interest::READABLE | Interest::WRITABLE)
            .map_err(HandshakeError::Io)?;
        let mut events = Events::with_capacity(16);

        do_handshake(&mut stream, &mut poll, &mut events, &info_hash, our_peer_id)?;

        let mut session = PeerSession {
            stream,
            poll,
            events,
            storage,
            control,
            info_hash,
            peer_choking: true,
            am_interested: false,
            peer_bitfield: BitField::new(0),
            state: DownloadState::Idle,
            read_buf: Vec::new(),
        };
        session.peer_bitfield = BitField::new(session.storage.total_pieces());

        session.send(&Message::Bitfield(session.storage.bitfield()))?;
        session.send(&Message::Interested)?;
        session.am_interested = true;

        session.message_loop()
    }

    fn message_loop(&mut self) -> Result<(), SessionError> {
        loop {
            if self.storage.is_complete() {
                return Ok(());
            }
            if self.control.is_stopped() {
                return Ok(());
            }
            self.poll
                .poll(&mut self.events, Some(POLL_TIMEOUT))
                .map_err(SessionError::Io)?;

            let mut closed = false;
            for event in self.events.iter() {
                if event.token() != TOKEN {
                    continue;
                }
                if event.is_readable() {
                    closed = closed || self.drain_readable()?;
                }
            }
            self.process_buffered_messages()?;
            if closed {
                return Ok(());
            }
            if self.control.is_stopped() {
                return Ok(());
            }
            self.pump_request()?;
        }
    }

    fn drain_readable(&mut self) -> Result<bool, SessionError> {
        let mut buf = [0u8; 65536];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return Ok(true),
                Ok(n) => self.read_buf.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(SessionError::Io(e)),
            }
        }
    }

    fn process_buffered_messages(&mut self) -> Result<(), SessionError> {
        loop {
            let frame_len = match Message::frame_len(&self.read_buf) {
                Some(len) => len,
                None => return Ok(()),
            };
            if self.read_buf.len() < frame_len {
                return Ok(());
            }
            let frame = self.read_buf[..frame_len].to_vec();
            self.read_buf.drain(..frame_len);
            let message = Message::deserialize(&frame)?;
            self.handle_message(message)?;
        }
    }

    fn handle_message(&mut self, message: Message) -> Result<(), SessionError> {
        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                self.peer_choking = true;
                self.state = DownloadState::Idle;
            }
            Message::Unchoke => {
                self.peer_choking = false;
            }
            Message::Interested => {
                self.send(&Message::Unchoke)?;
            }
            Message::NotInterested => {}
            Message::Have(index) => {
                if (index as usize) < self.peer_bitfield.len() {
                    self.peer_bitfield.set(index as usize);
                }
            }
            Message::Bitfield(payload) => {
                self.peer_bitfield =
                    BitField::from_wire_payload(&payload, self.storage.total_pieces());
            }
            Message::Request(index, begin, length) => {
                self.serve_request(index, begin, length)?;
            }
            Message::Piece(index, begin, block) => {
                self.handle_piece(index, begin, block)?;
            }
            Message::Cancel(..) => {}
        }
        Ok(())
    }

    fn serve_request(&mut self, index: u32, begin: u32, length: u32) -> Result<(), SessionError> {
        if !self.storage.has_piece(index as usize) {
            return Ok(());
        }
        let block = self
            .storage
            .read_piece(index as usize, begin as u64, length as u64)
            .map_err(SessionError::Storage)?;
        self.send(&Message::Piece(index, begin, block))
    }

    fn handle_piece(&mut self, index: u32, begin: u32, block: Vec<u8>) -> Result<(), SessionError> {
        let (expected_index, buffer) = match &mut self.state {
            DownloadState::AwaitingPiece { index, buffer } => (*index, buffer),
            DownloadState::Idle => return Ok(()),
        };
        if index as usize != expected_index || begin as usize != buffer.len() {
            log::warn!(
                "ignoring out-of-order piece block: index={index} begin={begin} expected_index={expected_index} expected_begin={}",
                buffer.len()
            );
            return Ok(());
        }
        buffer.extend_from_slice(&block);
        let piece_len = self.storage.piece_length_of(expected_index) as usize;
        if buffer.len() < piece_len {
            let downloaded = buffer.len() as u32;
            return self.request_next_block(expected_index, downloaded);
        }
        let complete = std::mem::take(buffer);
        if self.storage.verify_piece(expected_index, &complete) {
            self.storage
                .write_piece(expected_index, &complete)
                .map_err(SessionError::Storage)?;
            self.storage.mark_completed(expected_index);
        } else {
            log::warn!("piece {expected_index} failed verification, discarding");
        }
        self.state = DownloadState::Idle;
        Ok(())
    }

    fn pump_request(&mut self) -> Result<(), SessionError> {
        if self.peer_choking {
            return Ok(());
        }
        match &self.state {
            DownloadState::AwaitingPiece { .. } => Ok(()),
            DownloadState::Idle => {
                let next = (0..self.storage.total_pieces())
                    .find(|&k| self.peer_bitfield.has_piece(k) && !self.storage.has_piece(k));
                let Some(index) = next else { return Ok(()) };
                self.state = DownloadState::AwaitingPiece {
                    index,
                    buffer: Vec::new(),
                };
                self.request_next_block(index, 0)
            }
        }
    }

    fn request_next_block(&mut self, index: usize, downloaded: u32) -> Result<(), SessionError> {
        let piece_len = self.storage.piece_length_of(index) as u32;
        let length = BLOCK_SIZE.min(piece_len - downloaded);
        self.send(&Message::Request(index as u32, downloaded, length))
    }

    fn send(&mut self, message: &Message) -> Result<(), SessionError> {
        let bytes = message.serialize();
        write_all_blocking(&mut self.stream, &mut self.poll, &mut self.events, &bytes)
    }
}

fn do_handshake(
    stream: &mut TcpStream,
    poll: &mut Poll,
    events: &mut Events,
    info_hash: &[u8; 20],
    our_peer_id: [u8; 20],
) -> Result<Handshake, HandshakeError> {
    let outbound = Handshake::new(*info_hash, our_peer_id);
    write_all_blocking(stream, poll, events, &outbound.to_bytes()).map_err(|e| match e {
        SessionError::Io(io) => HandshakeError::Io(io),
        _ => HandshakeError::Truncated(0),
    })?;

    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
    let mut buf = Vec::with_capacity(68);
    while buf.len() < 68 {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(HandshakeError::Truncated(buf.len()));
        }
        poll.poll(events, Some(remaining)).map_err(HandshakeError::Io)?;
        for event in events.iter() {
            if event.token() != TOKEN || !event.is_readable() {
                continue;
            }
            let mut chunk = [0u8; 68];
            match stream.read(&mut chunk) {
                Ok(0) => return Err(HandshakeError::Truncated(buf.len())),
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Err(HandshakeError::Io(e)),
            }
        }
    }

    let handshake = Handshake::from_bytes(&buf)?;
    handshake.validate(info_hash)?;
    Ok(handshake)
}

fn write_all_blocking(
    stream: &mut TcpStream,
    poll: &mut Poll,
    events: &mut Events,
    bytes: &[u8],
) -> Result<(), SessionError> {
    let mut written = 0;
    while written < bytes.len() {
        match stream.write(&bytes[written..]) {
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                poll.poll(events, Some(POLL_TIMEOUT)).map_err(SessionError::Io)?;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(SessionError::Io(e)),
        }
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("storage error: {0}")]
    Storage(crate::error::StorageError),
    #[error("socket error: {0}")]
    Io(std::io::Error),
}
