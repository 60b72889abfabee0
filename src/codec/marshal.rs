//! Recursive-descent decoder for the full marshal grammar.
//!
//! Some `p4` builds and wrappers emit replies with nested values (lists of
//! dictionaries, floats, bools). This decoder accepts every value kind of the
//! marshal format and turns each top-level dictionary into a [`Record`].

use super::{decode_text, split_prompt, DecodeError, Decoded, Reader, TAG_DICT, TAG_NULL};
use crate::core::types::{Record, Value};
use indexmap::IndexMap;
use tracing::warn;

/// Set on a type byte when the value is also stored in the reference table
const FLAG_REF: u8 = 0x80;

/// Deepest container nesting accepted before the reply is given up on
pub const MAX_DEPTH: usize = 128;

/// Decode a reply with the extended grammar, degrading like [`super::decode`]
pub fn decode_extended(bytes: &[u8]) -> Decoded {
    match try_decode_extended(bytes) {
        Ok(records) => Decoded::Records(records),
        Err(err) => {
            warn!("p4 output is not a marshalled reply ({}); passing it through raw", err);
            Decoded::Undecodable(bytes.to_vec())
        }
    }
}

/// Strict form of [`decode_extended`]
pub fn try_decode_extended(bytes: &[u8]) -> Result<Vec<Record>, DecodeError> {
    let (prompt, start) = split_prompt(bytes);
    let mut records = vec![prompt];
    let mut parser = Parser {
        reader: Reader::new(bytes, start),
        refs: Vec::new(),
        depth: 0,
    };

    while !parser.reader.is_at_end() {
        let offset = parser.reader.offset();
        match parser.value()? {
            Some(Value::Map(fields)) => records.push(Record::from(fields)),
            // stray terminators between records are tolerated
            None => {}
            Some(_) => {
                return Err(DecodeError::UnexpectedTag {
                    tag: bytes[offset],
                    offset,
                })
            }
        }
    }

    Ok(records)
}

struct Parser<'a> {
    reader: Reader<'a>,
    refs: Vec<Value>,
    depth: usize,
}

impl<'a> Parser<'a> {
    /// Read one value; `None` is the null marker that closes a dictionary
    fn value(&mut self) -> Result<Option<Value>, DecodeError> {
        let offset = self.reader.offset();
        let raw = self.reader.u8()?;
        let tag = raw & !FLAG_REF;

        let slot = if raw & FLAG_REF != 0 {
            self.refs.push(Value::Null);
            Some(self.refs.len() - 1)
        } else {
            None
        };

        let value = match tag {
            TAG_NULL => return Ok(None),
            b'N' => Value::Null,
            b'F' => Value::Bool(false),
            b'T' => Value::Bool(true),
            b'i' => Value::Int(i64::from(self.reader.i32()?)),
            b'I' => Value::Int(self.reader.i64()?),
            b'l' => Value::Int(self.long(offset)?),
            b'g' => Value::Float(self.reader.f64()?),
            b'f' => {
                let len = usize::from(self.reader.u8()?);
                let literal = self.reader.bytes(len)?;
                let parsed = std::str::from_utf8(literal)
                    .ok()
                    .and_then(|text| text.trim().parse::<f64>().ok())
                    .ok_or(DecodeError::InvalidFloat { offset })?;
                Value::Float(parsed)
            }
            b's' | b't' | b'a' | b'A' => Value::Str(self.reader.string()?),
            b'u' => {
                let len = self.reader.u32()? as usize;
                Value::Str(String::from_utf8_lossy(self.reader.bytes(len)?).into_owned())
            }
            b'z' | b'Z' => {
                let len = usize::from(self.reader.u8()?);
                Value::Str(decode_text(self.reader.bytes(len)?))
            }
            b'(' | b'[' | b'<' | b'>' => {
                let count = self.reader.u32()? as usize;
                Value::List(self.nested(offset, |parser| parser.sequence(count))?)
            }
            b')' => {
                let count = usize::from(self.reader.u8()?);
                Value::List(self.nested(offset, |parser| parser.sequence(count))?)
            }
            TAG_DICT => Value::Map(self.nested(offset, Self::dict)?),
            b'r' => {
                let index = self.reader.u32()?;
                self.refs
                    .get(index as usize)
                    .cloned()
                    .ok_or(DecodeError::BadReference { index, offset })?
            }
            _ => return Err(DecodeError::UnexpectedTag { tag: raw, offset }),
        };

        if let Some(slot) = slot {
            self.refs[slot] = value.clone();
        }
        Ok(Some(value))
    }

    /// Run `parse` one container level deeper, refusing to recurse without bound
    fn nested<T>(
        &mut self,
        offset: usize,
        parse: impl FnOnce(&mut Self) -> Result<T, DecodeError>,
    ) -> Result<T, DecodeError> {
        if self.depth >= MAX_DEPTH {
            return Err(DecodeError::TooDeep { offset });
        }
        self.depth += 1;
        let parsed = parse(self);
        self.depth -= 1;
        parsed
    }

    fn sequence(&mut self, count: usize) -> Result<Vec<Value>, DecodeError> {
        // never trust the count for preallocation beyond what the input can hold
        let mut items = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let offset = self.reader.offset();
            match self.value()? {
                Some(item) => items.push(item),
                None => {
                    return Err(DecodeError::UnexpectedTag {
                        tag: TAG_NULL,
                        offset,
                    })
                }
            }
        }
        Ok(items)
    }

    fn dict(&mut self) -> Result<IndexMap<String, Value>, DecodeError> {
        let mut fields = IndexMap::new();
        loop {
            let key_offset = self.reader.offset();
            let key = match self.value()? {
                None => return Ok(fields),
                Some(Value::Str(key)) => key,
                Some(Value::Int(n)) => n.to_string(),
                Some(_) => return Err(DecodeError::InvalidKey { offset: key_offset }),
            };
            let value_offset = self.reader.offset();
            match self.value()? {
                Some(value) => {
                    fields.insert(key, value);
                }
                None => {
                    return Err(DecodeError::UnexpectedTag {
                        tag: TAG_NULL,
                        offset: value_offset,
                    })
                }
            }
        }
    }

    /// Arbitrary-precision integer stored as base-2^15 digits
    fn long(&mut self, offset: usize) -> Result<i64, DecodeError> {
        let size = self.reader.i32()?;
        let digits = size.unsigned_abs() as usize;
        let mut magnitude: i128 = 0;
        for shift in 0..digits {
            let digit = i128::from(self.reader.u16()?);
            let bits = 15 * shift as u32;
            if bits >= 64 && digit != 0 {
                return Err(DecodeError::Overflow { offset });
            }
            if bits < 64 {
                magnitude |= digit << bits;
            }
        }
        let signed = if size < 0 { -magnitude } else { magnitude };
        i64::try_from(signed).map_err(|_| DecodeError::Overflow { offset })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(out: &mut Vec<u8>, text: &str) {
        out.push(b's');
        out.extend_from_slice(&(text.len() as u32).to_le_bytes());
        out.extend_from_slice(text.as_bytes());
    }

    #[test]
    fn test_flat_reply_decodes_the_same() {
        let mut bytes = b"prompt> ".to_vec();
        bytes.push(b'{');
        s(&mut bytes, "code");
        s(&mut bytes, "stat");
        s(&mut bytes, "change");
        bytes.push(b'i');
        bytes.extend_from_slice(&42i32.to_le_bytes());
        bytes.push(b'0');

        let extended = try_decode_extended(&bytes).unwrap();
        let flat = crate::codec::try_decode(&bytes).unwrap();
        assert_eq!(extended, flat);
        assert_eq!(extended[1].get_int("change"), Some(42));
    }

    #[test]
    fn test_nested_values() {
        let mut bytes = vec![b'{'];
        s(&mut bytes, "code");
        s(&mut bytes, "stat");
        s(&mut bytes, "files");
        bytes.push(b'[');
        bytes.extend_from_slice(&2u32.to_le_bytes());
        s(&mut bytes, "//depot/a");
        bytes.push(b'{');
        s(&mut bytes, "rev");
        bytes.push(b'i');
        bytes.extend_from_slice(&(-1i32).to_le_bytes());
        bytes.push(b'0');
        s(&mut bytes, "ratio");
        bytes.push(b'g');
        bytes.extend_from_slice(&0.5f64.to_le_bytes());
        s(&mut bytes, "open");
        bytes.push(b'T');
        s(&mut bytes, "owner");
        bytes.push(b'N');
        bytes.push(b'0');

        let records = try_decode_extended(&bytes).unwrap();
        let record = &records[1];
        let mut inner = IndexMap::new();
        inner.insert("rev".to_string(), Value::Int(-1));
        assert_eq!(
            record.get("files"),
            Some(&Value::List(vec![Value::from("//depot/a"), Value::Map(inner)]))
        );
        assert_eq!(record.get("ratio"), Some(&Value::Float(0.5)));
        assert_eq!(record.get("open"), Some(&Value::Bool(true)));
        assert_eq!(record.get("owner"), Some(&Value::Null));
    }

    #[test]
    fn test_text_float_and_long() {
        let mut bytes = vec![b'{'];
        s(&mut bytes, "f");
        bytes.push(b'f');
        bytes.push(4);
        bytes.extend_from_slice(b"2.25");
        s(&mut bytes, "big");
        // 2^15 + 1 as two 15-bit digits
        bytes.push(b'l');
        bytes.extend_from_slice(&2i32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.push(b'0');

        let records = try_decode_extended(&bytes).unwrap();
        assert_eq!(records[1].get("f"), Some(&Value::Float(2.25)));
        assert_eq!(records[1].get_int("big"), Some(32769));
    }

    #[test]
    fn test_reference_flag_and_backref() {
        let mut bytes = vec![b'{'];
        // key stored with FLAG_REF, then reused as a value through 'r'
        bytes.push(b's' | FLAG_REF);
        bytes.extend_from_slice(&4u32.to_le_bytes());
        bytes.extend_from_slice(b"name");
        bytes.push(b'r');
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.push(b'0');

        let records = try_decode_extended(&bytes).unwrap();
        assert_eq!(records[1].get_str("name"), Some("name"));
    }

    #[test]
    fn test_top_level_scalar_is_undecodable() {
        let bytes = b"{0T".to_vec();
        assert!(try_decode_extended(&bytes).is_err());
        assert_eq!(decode_extended(&bytes), Decoded::Undecodable(bytes.clone()));
    }

    #[test]
    fn test_non_string_key_rejected() {
        let mut bytes = vec![b'{', b'N'];
        s(&mut bytes, "v");
        bytes.push(b'0');
        assert_eq!(
            try_decode_extended(&bytes),
            Err(DecodeError::InvalidKey { offset: 1 })
        );
    }

    #[test]
    fn test_bad_backref() {
        let mut bytes = vec![b'{'];
        s(&mut bytes, "k");
        bytes.push(b'r');
        bytes.extend_from_slice(&5u32.to_le_bytes());
        bytes.push(b'0');
        assert!(matches!(
            try_decode_extended(&bytes),
            Err(DecodeError::BadReference { index: 5, .. })
        ));
    }

    fn nested_lists(depth: usize) -> Vec<u8> {
        let mut bytes = vec![b'{'];
        s(&mut bytes, "k");
        for _ in 0..depth {
            bytes.push(b'[');
            bytes.extend_from_slice(&1u32.to_le_bytes());
        }
        bytes.push(b'N');
        bytes.push(b'0');
        bytes
    }

    #[test]
    fn test_runaway_nesting_degrades() {
        let bytes = nested_lists(200_000);
        assert!(matches!(
            try_decode_extended(&bytes),
            Err(DecodeError::TooDeep { .. })
        ));
        assert!(decode_extended(&bytes).is_undecodable());
    }

    #[test]
    fn test_moderate_nesting_decodes() {
        let records = try_decode_extended(&nested_lists(MAX_DEPTH - 1)).unwrap();
        let mut value = records[1].get("k").unwrap();
        let mut levels = 0;
        while let Value::List(items) = value {
            value = &items[0];
            levels += 1;
        }
        assert_eq!(levels, MAX_DEPTH - 1);
        assert_eq!(value, &Value::Null);
    }
}
