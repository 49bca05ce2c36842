//! The `vec(T)` and `stringU32` primitive decoders from spec §4.4.

use super::cursor::Cursor;
use super::varint::decode_varint;

/// `varint(len) ‖ bytes*len`. Verifies `len` against the remaining buffer
/// *before* allocating/slicing so adversarial lengths can't over-read.
pub fn read_varint_prefixed_bytes<'a>(cursor: &mut Cursor<'a>) -> Option<&'a [u8]> {
    let len = decode_varint(cursor)?;
    let len = usize::try_from(len).ok()?;
    if len > cursor.remaining() {
        return None;
    }
    cursor.read_bytes(len)
}

/// `u32_be(len) ‖ utf8 bytes`. Invalid UTF-8 is replaced rather than
/// treated as a decode failure.
pub fn read_string_u32(cursor: &mut Cursor) -> Option<String> {
    let len = cursor.read_u32_be()? as usize;
    if len > cursor.remaining() {
        return None;
    }
    let bytes = cursor.read_bytes(len)?;
    Some(String::from_utf8_lossy(bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::varint::encode_varint;

    #[test]
    fn varint_prefixed_bytes_rejects_oversized_length() {
        let mut attack = encode_varint(1_000_000);
        attack.extend_from_slice(b"short");
        let mut cur = Cursor::new(&attack);
        assert_eq!(read_varint_prefixed_bytes(&mut cur), None);
    }

    #[test]
    fn string_u32_replaces_invalid_utf8() {
        let mut data = 4u32.to_be_bytes().to_vec();
        data.extend_from_slice(&[0xFF, 0xFE, b'a', b'b']);
        let mut cur = Cursor::new(&data);
        let s = read_string_u32(&mut cur).unwrap();
        assert!(s.ends_with("ab"));
    }
}
