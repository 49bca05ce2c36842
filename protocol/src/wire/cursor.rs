//! A panic-free byte reader. Every read either advances the cursor and
//! returns `Some`, or leaves the cursor untouched and returns `None` — it
//! never indexes past the end of the buffer.

pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Cursor { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Reads a single byte and advances by one.
    pub fn read_u8(&mut self) -> Option<u8> {
        let byte = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(byte)
    }

    /// Reads a fixed number of raw bytes.
    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.remaining() < len {
            return None;
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Some(slice)
    }

    /// Reads a fixed-size array.
    pub fn read_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let slice = self.read_bytes(N)?;
        let mut arr = [0u8; N];
        arr.copy_from_slice(slice);
        Some(arr)
    }

    pub fn read_u32_be(&mut self) -> Option<u32> {
        self.read_array::<4>().map(u32::from_be_bytes)
    }

    pub fn read_u64_be(&mut self) -> Option<u64> {
        self.read_array::<8>().map(u64::from_be_bytes)
    }

    pub fn read_i64_be(&mut self) -> Option<i64> {
        self.read_array::<8>().map(i64::from_be_bytes)
    }

    /// Returns all remaining bytes without advancing.
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_never_panic_on_truncation() {
        let data = [1u8, 2, 3];
        let mut cur = Cursor::new(&data);
        assert_eq!(cur.read_u8(), Some(1));
        assert_eq!(cur.read_u64_be(), None); // only 2 bytes left
        assert_eq!(cur.read_bytes(10), None);
    }

    #[test]
    fn big_endian_primitives_round_trip() {
        let data = 0x0102030405060708u64.to_be_bytes();
        let mut cur = Cursor::new(&data);
        assert_eq!(cur.read_u64_be(), Some(0x0102030405060708));
    }
}
