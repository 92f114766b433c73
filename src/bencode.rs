//! Lazy bencode decoder
//!
//! A zero-copy parser for the bencode encoding used in torrent metadata
//! and peer protocol messages. Scalars are not materialized at parse
//! time: integers and strings are kept as slices borrowed from the input
//! buffer and interpreted on demand. The tree therefore cannot outlive
//! the buffer it was decoded from.
//!
//! Bencode format:
//! - Integers:   `i<number>e`        Example: `i42e`
//! - Strings:    `<length>:<data>`   Example: `4:spam`
//! - Lists:      `l<items>e`         Example: `l4:spami42ee`
//! - Dicts:      `d<pairs>e`         Example: `d3:cow3:moo4:spam4:eggse`
//!
//! Dictionary pairs preserve their order of appearance and lookup is a
//! linear byte-equal scan, so a message can be re-encoded or hashed
//! byte-identically from the offsets the tree retains.

use std::fmt;

use crate::error::{CoreError, ProtocolErrorKind, Result};

/// Maximum allowed length for a bencode string (100 MiB)
/// This prevents malicious torrents from causing memory exhaustion
const MAX_STRING_LENGTH: usize = 100 * 1024 * 1024;

/// A parsed bencode entity referencing slices of the source buffer
#[derive(Clone, PartialEq, Eq)]
pub enum LazyEntry<'a> {
    /// Integer scalar: the raw digit slice, possibly with a leading `-`
    Int(&'a [u8]),
    /// Byte string (not necessarily valid UTF-8)
    Str(&'a [u8]),
    /// List of entities in order of appearance
    List(Vec<LazyEntry<'a>>),
    /// Dictionary as `(raw key bytes, value)` pairs in order of appearance
    Dict(Vec<(&'a [u8], LazyEntry<'a>)>),
}

impl fmt::Debug for LazyEntry<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(_) => write!(f, "Int({})", self.int_value()),
            Self::Str(b) => {
                if let Ok(s) = std::str::from_utf8(b) {
                    if s.len() <= 50 {
                        write!(f, "Str(\"{}\")", s)
                    } else {
                        write!(f, "Str(\"{}...\" [{} bytes])", &s[..50], b.len())
                    }
                } else {
                    write!(f, "Str([{} bytes])", b.len())
                }
            }
            Self::List(l) => f.debug_tuple("List").field(l).finish(),
            Self::Dict(d) => {
                let mut m = f.debug_map();
                for (k, v) in d {
                    m.entry(&String::from_utf8_lossy(k), v);
                }
                m.finish()
            }
        }
    }
}

/// Decode a single bencoded value covering the whole buffer.
///
/// Tolerant of unsorted dictionary keys. Trailing bytes after the value
/// are an error; malformed input never yields a partial tree.
pub fn decode(buf: &[u8], depth_limit: usize) -> Result<LazyEntry<'_>> {
    decode_impl(buf, depth_limit, false)
}

/// Decode like [`decode`], additionally requiring dictionary keys to be
/// unique and in byte-lexicographic order (the canonical encoding).
pub fn decode_strict(buf: &[u8], depth_limit: usize) -> Result<LazyEntry<'_>> {
    decode_impl(buf, depth_limit, true)
}

fn decode_impl(buf: &[u8], depth_limit: usize, strict: bool) -> Result<LazyEntry<'_>> {
    let mut parser = Parser {
        buf,
        pos: 0,
        strict,
    };
    let entry = parser.parse_value(depth_limit)?;
    if parser.pos != buf.len() {
        return Err(decode_error(format!(
            "Trailing data: {} bytes",
            buf.len() - parser.pos
        )));
    }
    Ok(entry)
}

fn decode_error(message: impl Into<String>) -> CoreError {
    CoreError::protocol(ProtocolErrorKind::BencodeParse, message)
}

struct Parser<'a> {
    buf: &'a [u8],
    pos: usize,
    strict: bool,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Result<u8> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or_else(|| decode_error("Unexpected end of input"))
    }

    fn parse_value(&mut self, depth: usize) -> Result<LazyEntry<'a>> {
        if depth == 0 {
            return Err(decode_error("Depth limit exceeded"));
        }

        match self.peek()? {
            b'i' => self.parse_int(),
            b'l' => self.parse_list(depth),
            b'd' => self.parse_dict(depth),
            b'0'..=b'9' => Ok(LazyEntry::Str(self.parse_string()?)),
            c => Err(decode_error(format!(
                "Invalid type marker: {:?}",
                c as char
            ))),
        }
    }

    /// `i<digits>e`, returning the digit slice
    fn parse_int(&mut self) -> Result<LazyEntry<'a>> {
        self.pos += 1; // 'i'
        let start = self.pos;

        if self.peek()? == b'-' {
            self.pos += 1;
        }

        let digits_start = self.pos;
        while self.peek()?.is_ascii_digit() {
            self.pos += 1;
        }
        let digits = &self.buf[digits_start..self.pos];

        if self.peek()? != b'e' {
            return Err(decode_error("Non-digit in integer"));
        }
        if digits.is_empty() {
            return Err(decode_error("Empty integer"));
        }
        if digits.len() > 1 && digits[0] == b'0' {
            return Err(decode_error("Integer with leading zero"));
        }
        if digits == b"0" && digits_start != start {
            return Err(decode_error("Negative zero"));
        }

        let slice = &self.buf[start..self.pos];
        self.pos += 1; // 'e'
        Ok(LazyEntry::Int(slice))
    }

    /// `<length>:<bytes>`, returning the byte slice
    fn parse_string(&mut self) -> Result<&'a [u8]> {
        let mut len: usize = 0;
        while self.peek()?.is_ascii_digit() {
            len = len
                .checked_mul(10)
                .and_then(|l| l.checked_add((self.buf[self.pos] - b'0') as usize))
                .ok_or_else(|| decode_error("String length overflow"))?;
            self.pos += 1;
        }

        if self.peek()? != b':' {
            return Err(decode_error("Expected colon in string"));
        }
        self.pos += 1;

        if len > MAX_STRING_LENGTH {
            return Err(decode_error(format!(
                "String length {} exceeds maximum {} bytes",
                len, MAX_STRING_LENGTH
            )));
        }
        if len > self.buf.len() - self.pos {
            return Err(decode_error(format!(
                "String length {} exceeds available data {}",
                len,
                self.buf.len() - self.pos
            )));
        }

        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// `l<items>e`
    fn parse_list(&mut self, depth: usize) -> Result<LazyEntry<'a>> {
        self.pos += 1; // 'l'
        let mut items = Vec::new();

        while self.peek()? != b'e' {
            items.push(self.parse_value(depth - 1)?);
        }
        self.pos += 1; // 'e'
        Ok(LazyEntry::List(items))
    }

    /// `d<pairs>e`; keys must be strings
    fn parse_dict(&mut self, depth: usize) -> Result<LazyEntry<'a>> {
        self.pos += 1; // 'd'
        let mut pairs: Vec<(&'a [u8], LazyEntry<'a>)> = Vec::new();

        while self.peek()? != b'e' {
            if !self.peek()?.is_ascii_digit() {
                return Err(decode_error("Dict key must be a string"));
            }
            let key = self.parse_string()?;

            if self.strict {
                if let Some((last, _)) = pairs.last() {
                    if key <= *last {
                        return Err(decode_error("Dict keys not in sorted order"));
                    }
                }
            }

            let value = self.parse_value(depth - 1)?;
            pairs.push((key, value));
        }
        self.pos += 1; // 'e'
        Ok(LazyEntry::Dict(pairs))
    }
}

impl<'a> LazyEntry<'a> {
    /// Interpret an integer slice, saturating at the bounds of `i64`.
    ///
    /// Non-integer variants return 0; malformed digit slices cannot occur
    /// because the decoder validated them.
    pub fn int_value(&self) -> i64 {
        let Self::Int(slice) = self else { return 0 };

        let (digits, negative) = match slice.split_first() {
            Some((b'-', rest)) => (rest, true),
            _ => (&slice[..], false),
        };

        // Accumulate negatively so i64::MIN is representable
        let mut val: i64 = 0;
        for &d in digits {
            val = val
                .saturating_mul(10)
                .saturating_sub((d - b'0') as i64);
        }
        if negative {
            val
        } else {
            val.checked_neg().unwrap_or(i64::MAX)
        }
    }

    /// Get as string (UTF-8)
    pub fn as_str(&self) -> Option<&'a str> {
        match self {
            Self::Str(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Get as raw bytes
    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        match self {
            Self::Str(b) => Some(b),
            _ => None,
        }
    }

    /// Get as list
    pub fn as_list(&self) -> Option<&[LazyEntry<'a>]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    /// Get as dictionary pairs
    pub fn as_dict(&self) -> Option<&[(&'a [u8], LazyEntry<'a>)]> {
        match self {
            Self::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Number of elements in a container, 0 for scalars
    pub fn len(&self) -> usize {
        match self {
            Self::List(l) => l.len(),
            Self::Dict(d) => d.len(),
            _ => 0,
        }
    }

    /// True for empty containers and all scalars
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a dictionary value by key bytes.
    ///
    /// Linear scan in insertion order; first match wins.
    pub fn dict_find(&self, key: &[u8]) -> Option<&LazyEntry<'a>> {
        match self {
            Self::Dict(d) => d.iter().find(|(k, _)| *k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Look up an integer value by key
    pub fn dict_find_int(&self, key: &[u8]) -> Option<i64> {
        match self.dict_find(key)? {
            e @ Self::Int(_) => Some(e.int_value()),
            _ => None,
        }
    }

    /// Look up a string value by key
    pub fn dict_find_str(&self, key: &[u8]) -> Option<&'a [u8]> {
        self.dict_find(key)?.as_bytes()
    }

    /// Index into a list
    pub fn list_at(&self, index: usize) -> Option<&LazyEntry<'a>> {
        self.as_list()?.get(index)
    }

    /// Check if this is a dict
    pub fn is_dict(&self) -> bool {
        matches!(self, Self::Dict(_))
    }

    /// Check if this is a list
    pub fn is_list(&self) -> bool {
        matches!(self, Self::List(_))
    }

    /// Check if this is a string
    pub fn is_str(&self) -> bool {
        matches!(self, Self::Str(_))
    }

    /// Check if this is an integer
    pub fn is_int(&self) -> bool {
        matches!(self, Self::Int(_))
    }
}
