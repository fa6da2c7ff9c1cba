use integer_encoding::{VarInt, VarIntReader};

/// Location of a block within a table file: offset and length, both varint-encoded, excluding
/// the block's 5-byte trailer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockHandle {
    offset: usize,
    size: usize,
}

impl BlockHandle {
    /// Decodes a handle from the start of src, also returning how many bytes it occupied.
    /// Returns None for truncated input.
    pub fn decode(src: &[u8]) -> Option<(BlockHandle, usize)> {
        let mut r: &[u8] = src;
        let offset = (&mut r).read_varint::<u64>().ok()?;
        let size = (&mut r).read_varint::<u64>().ok()?;
        Some((
            BlockHandle {
                offset: offset as usize,
                size: size as usize,
            },
            src.len() - r.len(),
        ))
    }

    pub fn new(offset: usize, size: usize) -> BlockHandle {
        BlockHandle { offset, size }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns how many bytes were written, or 0 if the destination was too small.
    pub fn encode_to(&self, dst: &mut [u8]) -> usize {
        if dst.len() < self.size.required_space() + self.offset.required_space() {
            return 0;
        }
        let off = (self.offset as u64).encode_var(dst);
        off + (self.size as u64).encode_var(&mut dst[off..])
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut v = vec![0; 20];
        let n = self.encode_to(&mut v);
        v.truncate(n);
        v
    }
}
