//! HTTP(S) tracker announce (spec §4.4, §6). Builds the GET request by
//! hand (query parameters with raw-byte URL-escaped `info_hash`/`peer_id`)
//! over a `mio`-polled TCP stream. A hand-rolled `\r\n\r\n` header scanner
//! is replaced here with `httparse`, a dependency already declared but
//! never used. HTTPS URLs are accepted at the scheme level but transported
//! identically (no TLS) — see DESIGN.md's Open Questions.

use super::{socket_addr_v4, AnnounceParams, CALL_TIMEOUT};
use crate::bencode::{self, Value};
use crate::error::TrackerError;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::io::{Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use url::Url;

const TOKEN: Token = Token(0);

pub fn announce(url: &Url, params: AnnounceParams<'_>) -> Result<Vec<SocketAddr>, TrackerError> {
    let host = url
        .host_str()
        .ok_or_else(|| TrackerError::UnsupportedUrl(url.to_string()))?;
    let port = url.port().unwrap_or(80);
    let addr = (host, port)
        .to_socket_addrs()
        .map_err(TrackerError::Connect)?
        .next()
        .ok_or_else(|| TrackerError::UnsupportedUrl(url.to_string()))?;

    let query = format!(
        "info_hash={}&peer_id={}&uploaded={}&downloaded={}&left={}&port={}&compact=1",
        urlencoding::encode_binary(params.info_hash),
        urlencoding::encode_binary(params.peer_id),
        params.uploaded,
        params.downloaded,
        params.left,
        params.port,
    );
    let path = if url.query().is_some() {
        format!("{}&{}", url.path(), query)
    } else {
        format!("{}?{}", url.path(), query)
    };
    let request = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");

    let body = run_request(addr, request.as_bytes())?;
    parse_peers(&body)
}

fn run_request(addr: SocketAddr, request: &[u8]) -> Result<Vec<u8>, TrackerError> {
    let mut poll = Poll::new().map_err(TrackerError::Connect)?;
    let mut events = Events::with_capacity(16);
    let mut stream = TcpStream::connect(addr).map_err(TrackerError::Connect)?;
    poll.registry()
        .register(&mut stream, TOKEN, Interest::WRITABLE)
        .map_err(TrackerError::Connect)?;

    let mut wrote = false;
    let mut response = Vec::new();
    let deadline = std::time::Instant::now() + CALL_TIMEOUT;

    loop {
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        if remaining.is_zero() {
            return Err(TrackerError::Timeout { addr });
        }
        poll.poll(&mut events, Some(remaining))
            .map_err(TrackerError::Connect)?;
        if events.is_empty() {
            return Err(TrackerError::Timeout { addr });
        }
        for event in events.iter() {
            if event.token() != TOKEN {
                continue;
            }
            if event.is_writable() && !wrote {
                stream.write_all(request).map_err(TrackerError::Connect)?;
                wrote = true;
                poll.registry()
                    .reregister(&mut stream, TOKEN, Interest::READABLE)
                    .map_err(TrackerError::Connect)?;
            }
            if event.is_readable() {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) => return Ok(response),
                        Ok(n) => response.extend_from_slice(&buf[..n]),
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) => return Err(TrackerError::Connect(e)),
                    }
                }
            }
        }
    }
}

fn parse_peers(raw: &[u8]) -> Result<Vec<SocketAddr>, TrackerError> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    let status = response
        .parse(raw)
        .map_err(|e| TrackerError::MalformedResponse(e.to_string()))?;
    let body = match status {
        httparse::Status::Complete(offset) => &raw[offset..],
        httparse::Status::Partial => {
            return Err(TrackerError::MalformedResponse(
                "incomplete HTTP response headers".to_string(),
            ))
        }
    };

    let (value, _) =
        bencode::decode(body).map_err(|e| TrackerError::MalformedResponse(e.to_string()))?;

    if let Some(reason) = value.get("failure reason").and_then(Value::as_bytes) {
        return Err(TrackerError::MalformedResponse(
            String::from_utf8_lossy(reason).to_string(),
        ));
    }

    let peers_value = value
        .get("peers")
        .ok_or_else(|| TrackerError::MalformedResponse("missing `peers` key".to_string()))?;

    match peers_value {
        Value::Bytes(compact) => decode_compact_peers(compact),
        Value::List(dicts) => decode_dict_peers(dicts),
        _ => Err(TrackerError::MalformedResponse(
            "`peers` was neither a byte string nor a list".to_string(),
        )),
    }
}

fn decode_compact_peers(compact: &[u8]) -> Result<Vec<SocketAddr>, TrackerError> {
    if compact.len() % 6 != 0 {
        return Err(TrackerError::MalformedResponse(format!(
            "compact peers length {} is not a multiple of 6",
            compact.len()
        )));
    }
    Ok(compact
        .chunks_exact(6)
        .map(|c| {
            let port = u16::from_be_bytes([c[4], c[5]]);
            socket_addr_v4([c[0], c[1], c[2], c[3]], port)
        })
        .collect())
}

fn decode_dict_peers(dicts: &[Value]) -> Result<Vec<SocketAddr>, TrackerError> {
    let mut out = Vec::with_capacity(dicts.len());
    for dict in dicts {
        let ip = dict
            .get("ip")
            .and_then(Value::as_bytes)
            .ok_or_else(|| TrackerError::MalformedResponse("peer dict missing `ip`".to_string()))?;
        let ip = std::str::from_utf8(ip)
            .map_err(|_| TrackerError::MalformedResponse("peer `ip` is not utf8".to_string()))?;
        let port = dict
            .get("port")
            .and_then(Value::as_int)
            .ok_or_else(|| TrackerError::MalformedResponse("peer dict missing `port`".to_string()))?;
        let addr: std::net::Ipv4Addr = ip
            .parse()
            .map_err(|_| TrackerError::MalformedResponse(format!("invalid peer ip {ip:?}")))?;
        out.push(socket_addr_v4(addr.octets(), port as u16));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_compact_peer_string() {
        let compact = [127, 0, 0, 1, 0x1A, 0xE1]; // 6881
        let peers = decode_compact_peers(&compact).unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].port(), 6881);
    }

    #[test]
    fn rejects_compact_peers_not_multiple_of_six() {
        assert!(decode_compact_peers(&[1, 2, 3]).is_err());
    }

    #[test]
    fn parses_full_http_response_with_compact_peers() {
        let mut dict = std::collections::BTreeMap::new();
        dict.insert(b"interval".to_vec(), Value::Int(1800));
        dict.insert(
            b"peers".to_vec(),
            Value::Bytes(vec![10, 0, 0, 1, 0x1A, 0xE1]),
        );
        let body = bencode::encode(&Value::Dict(dict));
        let mut raw = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec();
        raw.extend_from_slice(&body);

        let peers = parse_peers(&raw).unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].port(), 6881);
    }

    #[test]
    fn parses_dict_form_peers() {
        let mut peer = std::collections::BTreeMap::new();
        peer.insert(b"ip".to_vec(), Value::Bytes(b"192.168.1.5".to_vec()));
        peer.insert(b"port".to_vec(), Value::Int(51413));
        peer.insert(b"peer id".to_vec(), Value::Bytes(vec![0u8; 20]));

        let mut dict = std::collections::BTreeMap::new();
        dict.insert(b"interval".to_vec(), Value::Int(1800));
        dict.insert(b"peers".to_vec(), Value::List(vec![Value::Dict(peer)]));
        let body = bencode::encode(&Value::Dict(dict));
        let mut raw = b"HTTP/1.1 200 OK\r\n\r\n".to_vec();
        raw.extend_from_slice(&body);

        let peers = parse_peers(&raw).unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].port(), 51413);
    }

    #[test]
    fn surfaces_failure_reason() {
        let mut dict = std::collections::BTreeMap::new();
        dict.insert(
            b"failure reason".to_vec(),
            Value::Bytes(b"unregistered torrent".to_vec()),
        );
        let body = bencode::encode(&Value::Dict(dict));
        let mut raw = b"HTTP/1.1 200 OK\r\n\r\n".to_vec();
        raw.extend_from_slice(&body);
        assert!(parse_peers(&raw).is_err());
    }
}
