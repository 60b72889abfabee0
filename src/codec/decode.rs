use super::{split_prompt, DecodeError, Decoded, Reader, TAG_DICT, TAG_INT, TAG_NULL, TAG_STRING};
use crate::core::types::{Record, Value};
use tracing::warn;

/// Decode a flat `p4 -G` reply.
///
/// The first record is always `{code: "prompt", prompt: <bytes before the
/// first '{'>}`. Malformed input yields [`Decoded::Undecodable`] with the
/// original bytes.
pub fn decode(bytes: &[u8]) -> Decoded {
    match try_decode(bytes) {
        Ok(records) => Decoded::Records(records),
        Err(err) => {
            warn!("p4 output is not a marshalled reply ({}); passing it through raw", err);
            Decoded::Undecodable(bytes.to_vec())
        }
    }
}

/// Strict form of [`decode`] that reports why decoding stopped
pub fn try_decode(bytes: &[u8]) -> Result<Vec<Record>, DecodeError> {
    let (prompt, start) = split_prompt(bytes);
    let mut records = vec![prompt];
    let mut reader = Reader::new(bytes, start);
    // strings alternate between key and value
    let mut pending_key: Option<String> = None;

    while !reader.is_at_end() {
        let offset = reader.offset();
        match reader.u8()? {
            TAG_DICT => {
                records.push(Record::new());
                pending_key = None;
            }
            TAG_STRING => {
                let text = reader.string()?;
                match pending_key.take() {
                    // an empty key is no key: the next string takes its place
                    None => pending_key = (!text.is_empty()).then_some(text),
                    Some(key) => current(&mut records).insert(key, Value::Str(text)),
                }
            }
            TAG_INT => {
                let value = reader.u32()?;
                match pending_key.take() {
                    Some(key) => current(&mut records).insert(key, Value::from(value)),
                    None => warn!(
                        "integer {} at offset {} has no key; dropping it",
                        value, offset
                    ),
                }
            }
            TAG_NULL => {}
            tag => return Err(DecodeError::UnexpectedTag { tag, offset }),
        }
    }

    Ok(records)
}

fn current(records: &mut [Record]) -> &mut Record {
    // the prompt record is always present, so there is a last record
    let last = records.len() - 1;
    &mut records[last]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_to_vec;
    use crate::core::types::Payload;
    use proptest::prelude::*;

    fn string_field(out: &mut Vec<u8>, text: &str) {
        out.push(b's');
        out.extend_from_slice(&(text.len() as u32).to_le_bytes());
        out.extend_from_slice(text.as_bytes());
    }

    fn int_field(out: &mut Vec<u8>, value: u32) {
        out.push(b'i');
        out.extend_from_slice(&value.to_le_bytes());
    }

    fn prompt_of(records: &[Record]) -> &str {
        records[0].get_str("prompt").unwrap()
    }

    #[test]
    fn test_no_brace_is_all_prompt() {
        let records = try_decode(b"Enter password: ").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].code(), Some("prompt"));
        assert_eq!(prompt_of(&records), "Enter password: ");
    }

    #[test]
    fn test_empty_input() {
        let records = try_decode(b"").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(prompt_of(&records), "");
    }

    #[test]
    fn test_records_in_wire_order() {
        let mut bytes = b"Enter password: \n".to_vec();
        for (code, file) in [("stat", "//depot/a"), ("stat", "//depot/b"), ("info", "hi")] {
            bytes.push(b'{');
            string_field(&mut bytes, "code");
            string_field(&mut bytes, code);
            string_field(&mut bytes, "data");
            string_field(&mut bytes, file);
            bytes.push(b'0');
        }

        let records = try_decode(&bytes).unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(prompt_of(&records), "Enter password: \n");
        assert_eq!(records[1].get_str("data"), Some("//depot/a"));
        assert_eq!(records[2].get_str("data"), Some("//depot/b"));
        assert_eq!(records[3].code(), Some("info"));
    }

    #[test]
    fn test_integer_values() {
        let mut bytes = vec![b'{'];
        string_field(&mut bytes, "code");
        string_field(&mut bytes, "error");
        string_field(&mut bytes, "severity");
        int_field(&mut bytes, 3);
        string_field(&mut bytes, "generic");
        int_field(&mut bytes, 0x26);
        bytes.push(b'0');

        let records = try_decode(&bytes).unwrap();
        assert_eq!(records[1].get_int("severity"), Some(3));
        assert_eq!(records[1].get_int("generic"), Some(0x26));
    }

    #[test]
    fn test_integer_without_key_is_dropped() {
        let mut bytes = vec![b'{'];
        int_field(&mut bytes, 9);
        string_field(&mut bytes, "code");
        string_field(&mut bytes, "stat");
        bytes.push(b'0');

        let records = try_decode(&bytes).unwrap();
        assert_eq!(records[1].len(), 1);
        assert_eq!(records[1].code(), Some("stat"));
    }

    #[test]
    fn test_empty_key_is_no_key() {
        let mut bytes = vec![b'{'];
        string_field(&mut bytes, "");
        int_field(&mut bytes, 7);
        string_field(&mut bytes, "code");
        string_field(&mut bytes, "stat");
        bytes.push(b'0');

        let records = try_decode(&bytes).unwrap();
        assert_eq!(records[1].len(), 1);
        assert_eq!(records[1].code(), Some("stat"));
        assert!(!records[1].contains_key(""));
    }

    #[test]
    fn test_unknown_tag_returns_original_bytes() {
        let mut bytes = b"{".to_vec();
        string_field(&mut bytes, "code");
        bytes.push(b'x');

        assert_eq!(
            try_decode(&bytes),
            Err(DecodeError::UnexpectedTag { tag: b'x', offset: 10 })
        );
        assert_eq!(decode(&bytes), Decoded::Undecodable(bytes.clone()));
    }

    #[test]
    fn test_truncated_length_is_undecodable() {
        let bytes = b"{s\x10\x00\x00\x00short".to_vec();
        assert!(matches!(try_decode(&bytes), Err(DecodeError::Truncated { .. })));
        assert!(decode(&bytes).is_undecodable());
    }

    #[test]
    fn test_latin1_bytes_survive() {
        let mut bytes = vec![b'{'];
        string_field(&mut bytes, "desc");
        bytes.extend_from_slice(b"s\x01\x00\x00\x00\xe9");
        bytes.push(b'0');

        let records = try_decode(&bytes).unwrap();
        assert_eq!(records[1].get_str("desc"), Some("\u{e9}"));
    }

    proptest! {
        #[test]
        fn prop_encode_then_decode_round_trips(
            entries in prop::collection::vec(("[A-Za-z][A-Za-z0-9]{0,10}", "[ -~]{0,24}"), 0..8)
        ) {
            let payload: Payload = entries.iter().cloned().collect();
            let expected = match &payload {
                Payload::Map(map) => map.clone(),
                Payload::Text(_) => unreachable!(),
            };
            let bytes = encode_to_vec(&payload).unwrap();

            let records = try_decode(&bytes).unwrap();
            prop_assert_eq!(records.len(), 2);
            prop_assert_eq!(prompt_of(&records), "");
            let decoded: Vec<(String, String)> = records[1]
                .iter()
                .map(|(k, v)| (k.clone(), v.as_str().unwrap().to_string()))
                .collect();
            let expected: Vec<(String, String)> = expected.into_iter().collect();
            prop_assert_eq!(decoded, expected);
        }

        #[test]
        fn prop_text_without_brace_is_prompt(text in "[^{]{0,64}") {
            let records = try_decode(text.as_bytes()).unwrap();
            prop_assert_eq!(records.len(), 1);
            prop_assert_eq!(prompt_of(&records), text.as_str());
        }
    }
}
