//! A small bencode utility, kept deliberately separate from the
//! `serde_bencode` derive path used by [`crate::metainfo`]. Its only job in
//! this crate is the one spec.md calls out explicitly: locating the exact
//! byte span of a value inside the original buffer, so `info_hash` never
//! depends on re-encode fidelity.
//!
//! The decoder also backs tracker response parsing, where the `peers` key
//! can be either a raw byte string or a list of dicts and a typed
//! `serde_bencode` struct would need a custom visitor either way.

use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

#[derive(Debug)]
pub struct DecodeError(pub String);

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bencode decode error: {}", self.0)
    }
}
impl std::error::Error for DecodeError {}

impl Value {
    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict()?.get(key.as_bytes())
    }
}

/// Decodes a single bencoded value starting at `input[0]`, returning the
/// value and the number of bytes consumed.
pub fn decode(input: &[u8]) -> Result<(Value, usize), DecodeError> {
    if input.is_empty() {
        return Err(DecodeError("unexpected end of input".into()));
    }
    match input[0] {
        b'i' => decode_int(input),
        b'l' => decode_list(input),
        b'd' => decode_dict(input),
        b'0'..=b'9' => decode_bytes(input),
        other => Err(DecodeError(format!("unexpected leading byte {other:?}"))),
    }
}

fn decode_int(input: &[u8]) -> Result<(Value, usize), DecodeError> {
    let end = find(input, b'e', 1)?;
    let s = std::str::from_utf8(&input[1..end])
        .map_err(|_| DecodeError("integer is not valid utf8".into()))?;
    if s.starts_with("-0") || (s.starts_with('0') && s != "0") {
        return Err(DecodeError(format!("non-canonical integer form {s:?}")));
    }
    let n: i64 = s
        .parse()
        .map_err(|_| DecodeError(format!("invalid integer {s:?}")))?;
    Ok((Value::Int(n), end + 1))
}

fn decode_bytes(input: &[u8]) -> Result<(Value, usize), DecodeError> {
    let colon = find(input, b':', 0)?;
    let len_str = std::str::from_utf8(&input[..colon])
        .map_err(|_| DecodeError("length prefix is not valid utf8".into()))?;
    let len: usize = len_str
        .parse()
        .map_err(|_| DecodeError(format!("invalid byte-string length {len_str:?}")))?;
    let start = colon + 1;
    let end = start
        .checked_add(len)
        .filter(|&e| e <= input.len())
        .ok_or_else(|| DecodeError("byte string runs past end of input".into()))?;
    Ok((Value::Bytes(input[start..end].to_vec()), end))
}

fn decode_list(input: &[u8]) -> Result<(Value, usize), DecodeError> {
    let mut pos = 1;
    let mut items = Vec::new();
    loop {
        if pos >= input.len() {
            return Err(DecodeError("unterminated list".into()));
        }
        if input[pos] == b'e' {
            return Ok((Value::List(items), pos + 1));
        }
        let (value, consumed) = decode(&input[pos..])?;
        items.push(value);
        pos += consumed;
    }
}

fn decode_dict(input: &[u8]) -> Result<(Value, usize), DecodeError> {
    let mut pos = 1;
    let mut map = BTreeMap::new();
    loop {
        if pos >= input.len() {
            return Err(DecodeError("unterminated dict".into()));
        }
        if input[pos] == b'e' {
            return Ok((Value::Dict(map), pos + 1));
        }
        let (key, consumed) = decode_bytes(&input[pos..])?;
        pos += consumed;
        let key = match key {
            Value::Bytes(b) => b,
            _ => unreachable!(),
        };
        let (value, consumed) = decode(&input[pos..])?;
        pos += consumed;
        map.insert(key, value);
    }
}

fn find(haystack: &[u8], needle: u8, from: usize) -> Result<usize, DecodeError> {
    haystack[from..]
        .iter()
        .position(|&b| b == needle)
        .map(|p| p + from)
        .ok_or_else(|| DecodeError(format!("expected {:?}", needle as char)))
}

/// Canonical byte-exact encoding: `i<n>e` integers, `<len>:<bytes>` strings,
/// dict keys sorted lexicographically by byte value.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(n) => {
            out.push(b'i');
            out.extend_from_slice(n.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(map) => {
            out.push(b'd');
            // BTreeMap<Vec<u8>, _> already iterates in byte-lexicographic order.
            for (k, v) in map {
                encode_into(&Value::Bytes(k.clone()), out);
                encode_into(v, out);
            }
            out.push(b'e');
        }
    }
}

/// Finds the byte span `[start, end)` of the value associated with
/// `top_level_key` in the top-level dict encoded in `input`, without
/// materializing any value. Used to compute `info_hash` from the exact
/// bytes the torrent file shipped with, per spec.md's design notes.
pub fn raw_span(input: &[u8], top_level_key: &[u8]) -> Result<(usize, usize), DecodeError> {
    if input.is_empty() || input[0] != b'd' {
        return Err(DecodeError("expected a top-level dict".into()));
    }
    let mut pos = 1;
    loop {
        if pos >= input.len() {
            return Err(DecodeError("unterminated dict".into()));
        }
        if input[pos] == b'e' {
            return Err(DecodeError(format!(
                "key {:?} not found",
                String::from_utf8_lossy(top_level_key)
            )));
        }
        let (key, consumed) = decode_bytes(&input[pos..])?;
        pos += consumed;
        let key = match key {
            Value::Bytes(b) => b,
            _ => unreachable!(),
        };
        let value_start = pos;
        let (_, consumed) = decode(&input[pos..])?;
        let value_end = pos + consumed;
        if key == top_level_key {
            return Ok((value_start, value_end));
        }
        pos = value_end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_integer() {
        let (v, n) = decode(b"i42e").unwrap();
        assert_eq!(v, Value::Int(42));
        assert_eq!(n, 4);
    }

    #[test]
    fn decodes_negative_integer() {
        let (v, _) = decode(b"i-42e").unwrap();
        assert_eq!(v, Value::Int(-42));
    }

    #[test]
    fn rejects_negative_zero() {
        assert!(decode(b"i-0e").is_err());
    }

    #[test]
    fn rejects_leading_zero() {
        assert!(decode(b"i03e").is_err());
    }

    #[test]
    fn decodes_byte_string() {
        let (v, n) = decode(b"4:spam").unwrap();
        assert_eq!(v, Value::Bytes(b"spam".to_vec()));
        assert_eq!(n, 6);
    }

    #[test]
    fn decodes_list() {
        let (v, _) = decode(b"l4:spam4:eggse").unwrap();
        assert_eq!(
            v,
            Value::List(vec![
                Value::Bytes(b"spam".to_vec()),
                Value::Bytes(b"eggs".to_vec())
            ])
        );
    }

    #[test]
    fn decodes_dict_sorted_roundtrip() {
        let input = b"d3:cow3:moo4:spam4:eggse";
        let (v, _) = decode(input).unwrap();
        let out = encode(&v);
        assert_eq!(out, input);
    }

    #[test]
    fn encode_sorts_keys() {
        let mut map = BTreeMap::new();
        map.insert(b"zzz".to_vec(), Value::Int(1));
        map.insert(b"aaa".to_vec(), Value::Int(2));
        let out = encode(&Value::Dict(map));
        assert_eq!(out, b"d3:aaai2e3:zzzi1ee");
    }

    #[test]
    fn raw_span_finds_inner_value_bytes() {
        let input = b"d4:infod4:name3:fooee";
        let (start, end) = raw_span(input, b"info").unwrap();
        assert_eq!(&input[start..end], b"d4:name3:fooe");
    }

    #[test]
    fn raw_span_missing_key_errors() {
        let input = b"d3:foo3:bare";
        assert!(raw_span(input, b"info").is_err());
    }
}
