//! Marshal codec for the `p4 -G` interchange format
//!
//! Requests are a single dictionary:
//!
//! ```text
//! '{' ( 's' <u32 LE len> <key> 's' <u32 LE len> <value> )* '0'
//! ```
//!
//! Replies are arbitrary prompt bytes up to the first `{`, followed by any
//! number of dictionaries whose values are `s` strings or `i` integers.
//! [`decode`] handles that flat shape; [`decode_extended`] accepts the full
//! marshal grammar (nested containers, floats, bools, longs).

pub mod decode;
pub mod encode;
pub mod marshal;

pub use decode::{decode, try_decode};
pub use encode::{encode, encode_to_vec};
pub use marshal::{decode_extended, try_decode_extended};

use crate::core::config::MarshalTier;
use crate::core::types::{Record, Value};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use thiserror::Error;

/// Tag opening a dictionary
pub const TAG_DICT: u8 = b'{';
/// Tag of a length-prefixed byte string
pub const TAG_STRING: u8 = b's';
/// Tag of a 32-bit integer
pub const TAG_INT: u8 = b'i';
/// Null marker; closes a dictionary
pub const TAG_NULL: u8 = b'0';

/// Outcome of decoding a reply.
///
/// Malformed output never fails the invocation: the caller gets the original
/// bytes back and decides what to do with them.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// The prompt record followed by every decoded record, in wire order
    Records(Vec<Record>),
    /// The reply did not follow the protocol; holds the original bytes
    Undecodable(Vec<u8>),
}

impl Decoded {
    pub fn records(&self) -> Option<&[Record]> {
        match self {
            Decoded::Records(records) => Some(records),
            Decoded::Undecodable(_) => None,
        }
    }

    pub fn is_undecodable(&self) -> bool {
        matches!(self, Decoded::Undecodable(_))
    }
}

/// Decode `bytes` with the decoder selected by `tier`
pub fn decode_with(tier: MarshalTier, bytes: &[u8]) -> Decoded {
    match tier {
        MarshalTier::Flat => decode(bytes),
        MarshalTier::Extended => decode_extended(bytes),
    }
}

/// Why a reply could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected tag {tag:#04x} at offset {offset}")]
    UnexpectedTag { tag: u8, offset: usize },

    #[error("input truncated at offset {offset}")]
    Truncated { offset: usize },

    #[error("dictionary key at offset {offset} is not a string")]
    InvalidKey { offset: usize },

    #[error("integer at offset {offset} does not fit in 64 bits")]
    Overflow { offset: usize },

    #[error("invalid float literal at offset {offset}")]
    InvalidFloat { offset: usize },

    #[error("unknown back-reference {index} at offset {offset}")]
    BadReference { index: u32, offset: usize },

    #[error("containers nested too deeply at offset {offset}")]
    TooDeep { offset: usize },
}

/// Split off the prompt: every byte before the first `{`.
///
/// Returns the prompt record and the offset where records start (the input
/// length when there is no `{` at all).
pub(crate) fn split_prompt(bytes: &[u8]) -> (Record, usize) {
    let start = bytes
        .iter()
        .position(|&b| b == TAG_DICT)
        .unwrap_or(bytes.len());
    let mut prompt = Record::with_code("prompt");
    prompt.insert("prompt", Value::Str(decode_text(&bytes[..start])));
    (prompt, start)
}

/// Text is taken as UTF-8 when it is valid, otherwise one character per byte
pub(crate) fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|&b| char::from(b)).collect(),
    }
}

/// Bounds-checked little-endian reader over a reply
pub(crate) struct Reader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(bytes: &'a [u8], start: usize) -> Self {
        let mut cursor = Cursor::new(bytes);
        cursor.set_position(start as u64);
        Self { cursor }
    }

    pub(crate) fn offset(&self) -> usize {
        self.cursor.position() as usize
    }

    pub(crate) fn is_at_end(&self) -> bool {
        self.offset() >= self.cursor.get_ref().len()
    }

    fn truncated(&self) -> DecodeError {
        DecodeError::Truncated {
            offset: self.offset(),
        }
    }

    pub(crate) fn u8(&mut self) -> Result<u8, DecodeError> {
        let offset = self.offset();
        self.cursor
            .read_u8()
            .map_err(|_| DecodeError::Truncated { offset })
    }

    pub(crate) fn u32(&mut self) -> Result<u32, DecodeError> {
        let offset = self.offset();
        self.cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| DecodeError::Truncated { offset })
    }

    pub(crate) fn i32(&mut self) -> Result<i32, DecodeError> {
        let offset = self.offset();
        self.cursor
            .read_i32::<LittleEndian>()
            .map_err(|_| DecodeError::Truncated { offset })
    }

    pub(crate) fn i64(&mut self) -> Result<i64, DecodeError> {
        let offset = self.offset();
        self.cursor
            .read_i64::<LittleEndian>()
            .map_err(|_| DecodeError::Truncated { offset })
    }

    pub(crate) fn u16(&mut self) -> Result<u16, DecodeError> {
        let offset = self.offset();
        self.cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| DecodeError::Truncated { offset })
    }

    pub(crate) fn f64(&mut self) -> Result<f64, DecodeError> {
        let offset = self.offset();
        self.cursor
            .read_f64::<LittleEndian>()
            .map_err(|_| DecodeError::Truncated { offset })
    }

    /// Take the next `len` bytes without copying
    pub(crate) fn bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let data: &'a [u8] = *self.cursor.get_ref();
        let start = self.offset();
        let end = start
            .checked_add(len)
            .filter(|&end| end <= data.len())
            .ok_or_else(|| self.truncated())?;
        self.cursor.set_position(end as u64);
        Ok(&data[start..end])
    }

    /// A `u32`-length-prefixed string
    pub(crate) fn string(&mut self) -> Result<String, DecodeError> {
        let len = self.u32()? as usize;
        Ok(decode_text(self.bytes(len)?))
    }
}
