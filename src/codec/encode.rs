use super::{TAG_DICT, TAG_NULL, TAG_STRING};
use crate::core::types::Payload;
use byteorder::{LittleEndian, WriteBytesExt};
use std::io::{self, Write};

/// Write `payload` to `sink` in the form `p4 -G` reads on stdin.
///
/// Text is written verbatim. A map becomes one dictionary whose keys and
/// values are `s`-tagged strings with a little-endian `u32` byte-length
/// prefix, followed by the `0` terminator. The sink is flushed; closing it
/// is up to the caller (dropping the child's stdin does that).
pub fn encode<W: Write>(payload: &Payload, sink: &mut W) -> io::Result<()> {
    match payload {
        Payload::Text(text) => sink.write_all(text.as_bytes())?,
        Payload::Map(map) => {
            sink.write_u8(TAG_DICT)?;
            for (key, value) in map {
                write_string(sink, key)?;
                write_string(sink, value)?;
            }
            sink.write_u8(TAG_NULL)?;
        }
    }
    sink.flush()
}

/// Encode `payload` into a fresh buffer
pub fn encode_to_vec(payload: &Payload) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    encode(payload, &mut buf)?;
    Ok(buf)
}

fn write_string<W: Write>(sink: &mut W, text: &str) -> io::Result<()> {
    let len = u32::try_from(text.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("string of {} bytes exceeds the marshal length limit", text.len()),
        )
    })?;
    sink.write_u8(TAG_STRING)?;
    sink.write_u32::<LittleEndian>(len)?;
    sink.write_all(text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_is_written_verbatim() {
        let bytes = encode_to_vec(&Payload::from("thePassword\n")).unwrap();
        assert_eq!(bytes, b"thePassword\n");
    }

    #[test]
    fn test_map_layout_is_bit_exact() {
        let payload = Payload::map().with("Change", "new").with("Count", 7);
        let bytes = encode_to_vec(&payload).unwrap();

        let mut expected = vec![b'{'];
        expected.extend_from_slice(b"s\x06\x00\x00\x00Change");
        expected.extend_from_slice(b"s\x03\x00\x00\x00new");
        expected.extend_from_slice(b"s\x05\x00\x00\x00Count");
        expected.extend_from_slice(b"s\x01\x00\x00\x007");
        expected.push(b'0');
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_empty_map_still_has_frame() {
        assert_eq!(encode_to_vec(&Payload::map()).unwrap(), b"{0");
    }

    #[test]
    fn test_length_prefix_counts_bytes() {
        let payload = Payload::map().with("Description", "café");
        let bytes = encode_to_vec(&payload).unwrap();
        let value_len_at = 1 + 1 + 4 + "Description".len() + 1;
        assert_eq!(&bytes[value_len_at..value_len_at + 4], &[5, 0, 0, 0]);
    }

    #[test]
    fn test_insertion_order_is_kept() {
        let payload: Payload = [("b", "2"), ("a", "1")].into_iter().collect();
        let bytes = encode_to_vec(&payload).unwrap();
        let b_at = bytes.iter().position(|&c| c == b'b').unwrap();
        let a_at = bytes.iter().position(|&c| c == b'a').unwrap();
        assert!(b_at < a_at);
    }
}
