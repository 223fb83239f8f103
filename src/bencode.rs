//! Bencode codec
//!
//! Encoder and single-pass recursive-descent decoder for BitTorrent's
//! serialization format.
//!
//! - Integers:   `i<number>e`        Example: `i42e`
//! - Strings:    `<length>:<data>`   Example: `4:spam`
//! - Lists:      `l<items>e`         Example: `l4:spami42ee`
//! - Dicts:      `d<pairs>e`         Example: `d3:cow3:moo4:spam4:eggse`
//!
//! Dictionaries are held in a `BTreeMap`, so encoding always emits keys in
//! byte-lexicographic order. Re-encoding a decoded `info` dictionary
//! therefore yields its canonical form, which is what the info hash is
//! computed over.

use std::collections::BTreeMap;
use std::fmt;

use tracing::trace;

use crate::error::{Result, TorrentError};

/// Deepest list/dict nesting the decoder accepts
const MAX_DEPTH: usize = 64;

/// A bencode value
#[derive(Clone, PartialEq, Eq)]
pub enum BencodeValue {
    /// Signed integer
    Int(i64),
    /// Byte string, not necessarily UTF-8
    Bytes(Vec<u8>),
    /// Ordered list
    List(Vec<BencodeValue>),
    /// Dictionary keyed by byte strings
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl fmt::Debug for BencodeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "Int({})", n),
            Self::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) if s.len() <= 64 => write!(f, "Bytes({:?})", s),
                _ => write!(f, "Bytes([{} bytes])", b.len()),
            },
            Self::List(l) => f.debug_tuple("List").field(l).finish(),
            Self::Dict(d) => {
                let readable: BTreeMap<String, &BencodeValue> = d
                    .iter()
                    .map(|(k, v)| (String::from_utf8_lossy(k).into_owned(), v))
                    .collect();
                f.debug_tuple("Dict").field(&readable).finish()
            }
        }
    }
}

impl BencodeValue {
    /// Empty dictionary, for building values with [`BencodeValue::with`]
    pub fn dict() -> Self {
        BencodeValue::Dict(BTreeMap::new())
    }

    /// Byte string from UTF-8 text
    pub fn string(s: &str) -> Self {
        BencodeValue::Bytes(s.as_bytes().to_vec())
    }

    /// Insert a key into a dictionary value, returning the updated value.
    /// Has no effect on non-dictionary values.
    pub fn with(mut self, key: &str, value: BencodeValue) -> Self {
        if let BencodeValue::Dict(ref mut d) = self {
            d.insert(key.as_bytes().to_vec(), value);
        }
        self
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            BencodeValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Byte string as UTF-8, if it is valid UTF-8
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Look up a key. Returns `None` if the key is absent or this value is
    /// not a dictionary.
    pub fn get(&self, key: &[u8]) -> Option<&BencodeValue> {
        self.as_dict().and_then(|d| d.get(key))
    }

    pub fn get_int(&self, key: &[u8]) -> Option<i64> {
        self.get(key).and_then(BencodeValue::as_int)
    }

    pub fn get_bytes(&self, key: &[u8]) -> Option<&[u8]> {
        self.get(key).and_then(BencodeValue::as_bytes)
    }

    pub fn get_str(&self, key: &[u8]) -> Option<&str> {
        self.get(key).and_then(BencodeValue::as_str)
    }

    pub fn get_list(&self, key: &[u8]) -> Option<&[BencodeValue]> {
        self.get(key).and_then(BencodeValue::as_list)
    }

    pub fn get_dict(&self, key: &[u8]) -> Option<&BencodeValue> {
        self.get(key).filter(|v| v.as_dict().is_some())
    }

    /// Encode this value to bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            BencodeValue::Int(i) => {
                out.push(b'i');
                out.extend_from_slice(i.to_string().as_bytes());
                out.push(b'e');
            }
            BencodeValue::Bytes(b) => encode_bytes(b, out),
            BencodeValue::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            BencodeValue::Dict(entries) => {
                out.push(b'd');
                // BTreeMap iterates in byte order
                for (key, value) in entries {
                    encode_bytes(key, out);
                    value.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }
}

impl From<i64> for BencodeValue {
    fn from(value: i64) -> Self {
        BencodeValue::Int(value)
    }
}

impl From<&str> for BencodeValue {
    fn from(value: &str) -> Self {
        BencodeValue::string(value)
    }
}

impl From<Vec<u8>> for BencodeValue {
    fn from(value: Vec<u8>) -> Self {
        BencodeValue::Bytes(value)
    }
}

impl From<Vec<BencodeValue>> for BencodeValue {
    fn from(value: Vec<BencodeValue>) -> Self {
        BencodeValue::List(value)
    }
}

fn encode_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}

/// Encode a value to bytes
pub fn encode(value: &BencodeValue) -> Vec<u8> {
    value.encode()
}

/// Decode exactly one value, rejecting trailing bytes
pub fn decode(data: &[u8]) -> Result<BencodeValue> {
    let (value, rest) = decode_prefix(data)?;
    if !rest.is_empty() {
        return Err(TorrentError::decode_error_with_source(
            "Trailing data after bencode value",
            format!("{} bytes", rest.len()),
        ));
    }
    Ok(value)
}

/// Decode one value from the front of `data`, returning it with the
/// unconsumed remainder
pub fn decode_prefix(data: &[u8]) -> Result<(BencodeValue, &[u8])> {
    trace!("Decoding bencode from {} bytes", data.len());
    let mut decoder = Decoder { data, pos: 0 };
    let value = decoder.parse_value(0)?;
    Ok((value, &data[decoder.pos..]))
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn peek(&self) -> Result<u8> {
        self.data.get(self.pos).copied().ok_or_else(|| {
            TorrentError::decode_error_with_source("Unexpected end of data", format!("offset {}", self.pos))
        })
    }

    fn parse_value(&mut self, depth: usize) -> Result<BencodeValue> {
        if depth > MAX_DEPTH {
            return Err(TorrentError::decode_error_with_source(
                "Nesting too deep",
                format!("limit {}", MAX_DEPTH),
            ));
        }

        match self.peek()? {
            b'i' => self.parse_int().map(BencodeValue::Int),
            b'0'..=b'9' => self.parse_bytes().map(|b| BencodeValue::Bytes(b.to_vec())),
            b'l' => {
                self.pos += 1;
                let mut items = Vec::new();
                while self.peek()? != b'e' {
                    items.push(self.parse_value(depth + 1)?);
                }
                self.pos += 1;
                Ok(BencodeValue::List(items))
            }
            b'd' => {
                self.pos += 1;
                let mut entries = BTreeMap::new();
                while self.peek()? != b'e' {
                    if !self.peek()?.is_ascii_digit() {
                        return Err(TorrentError::decode_error_with_source(
                            "Dictionary key must be a byte string",
                            format!("offset {}", self.pos),
                        ));
                    }
                    let key = self.parse_bytes()?.to_vec();
                    let value = self.parse_value(depth + 1)?;
                    if entries.insert(key, value).is_some() {
                        return Err(TorrentError::decode_error_with_source(
                            "Duplicate dictionary key",
                            format!("offset {}", self.pos),
                        ));
                    }
                }
                self.pos += 1;
                Ok(BencodeValue::Dict(entries))
            }
            other => Err(TorrentError::decode_error_with_source(
                "Unrecognized bencode type marker",
                format!("byte 0x{:02x} at offset {}", other, self.pos),
            )),
        }
    }

    fn parse_int(&mut self) -> Result<i64> {
        let start = self.pos + 1;
        let end = self.data[start..]
            .iter()
            .position(|&b| b == b'e')
            .map(|p| start + p)
            .ok_or_else(|| TorrentError::decode_error("Unterminated integer"))?;

        let digits = &self.data[start..end];
        let body = digits.strip_prefix(b"-").unwrap_or(digits);
        let malformed = body.is_empty()
            || !body.iter().all(u8::is_ascii_digit)
            || (body.len() > 1 && body[0] == b'0')
            || (digits.len() != body.len() && body == b"0");
        if malformed {
            return Err(TorrentError::decode_error_with_source(
                "Malformed integer",
                String::from_utf8_lossy(digits).into_owned(),
            ));
        }

        let text = std::str::from_utf8(digits).map_err(|e| TorrentError::decode_error_with_source("Malformed integer", e.to_string()))?;
        let value = text
            .parse::<i64>()
            .map_err(|e| TorrentError::decode_error_with_source("Integer out of range", e.to_string()))?;
        self.pos = end + 1;
        Ok(value)
    }

    fn parse_bytes(&mut self) -> Result<&'a [u8]> {
        let start = self.pos;
        let colon = self.data[start..]
            .iter()
            .position(|&b| b == b':')
            .map(|p| start + p)
            .ok_or_else(|| TorrentError::decode_error("Unterminated string length"))?;

        let len_digits = &self.data[start..colon];
        if len_digits.is_empty() || !len_digits.iter().all(u8::is_ascii_digit) {
            return Err(TorrentError::decode_error_with_source(
                "Non-numeric string length",
                String::from_utf8_lossy(len_digits).into_owned(),
            ));
        }

        let length = len_digits
            .iter()
            .try_fold(0usize, |acc, &d| acc.checked_mul(10)?.checked_add((d - b'0') as usize))
            .ok_or_else(|| TorrentError::decode_error("String length overflows"))?;

        let body_start = colon + 1;
        let remaining = self.data.len() - body_start;
        if length > remaining {
            return Err(TorrentError::decode_error_with_source(
                "String length exceeds remaining data",
                format!("wanted {}, have {}", length, remaining),
            ));
        }

        self.pos = body_start + length;
        Ok(&self.data[body_start..self.pos])
    }
}
