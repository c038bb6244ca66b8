use byteorder::{BigEndian, ByteOrder};

/// Growable byte sequence with a movable write position
///
/// Everything written so far stays addressable (for patching jump offsets) even after the
/// position is moved back with [`ByteBuffer::set_pos`]. Accessing a position that was never
/// reserved is a caller bug and panics, like slice indexing.
#[derive(Debug, Default, Clone)]
pub struct ByteBuffer {
    /// Backing storage (always at least `pos` bytes long)
    data: Vec<u8>,

    /// Write position
    pos: usize,
}

impl ByteBuffer {
    pub fn new() -> ByteBuffer {
        ByteBuffer {
            data: Vec::with_capacity(64),
            pos: 0,
        }
    }

    /// Make sure there is room for `num` bytes at the write position
    fn reserve(&mut self, num: usize) -> &mut [u8] {
        let end = self.pos + num;
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        let start = self.pos;
        self.pos = end;
        &mut self.data[start..end]
    }

    pub fn add_u1(&mut self, byte: u8) {
        self.reserve(1)[0] = byte;
    }

    pub fn add_u2(&mut self, value: u16) {
        BigEndian::write_u16(self.reserve(2), value);
    }

    pub fn add_u4(&mut self, value: u32) {
        BigEndian::write_u32(self.reserve(4), value);
    }

    /// Move forward, leaving space to be patched later
    pub fn skip(&mut self, num: usize) {
        self.reserve(num);
    }

    pub fn get(&self, index: usize) -> u8 {
        self.data[index]
    }

    pub fn set(&mut self, index: usize, byte: u8) {
        self.data[index] = byte;
    }

    pub fn get_u2(&self, index: usize) -> u16 {
        BigEndian::read_u16(&self.data[index..index + 2])
    }

    pub fn set_u2(&mut self, index: usize, value: u16) {
        BigEndian::write_u16(&mut self.data[index..index + 2], value);
    }

    pub fn get_u4(&self, index: usize) -> u32 {
        BigEndian::read_u32(&self.data[index..index + 4])
    }

    pub fn set_u4(&mut self, index: usize, value: u32) {
        BigEndian::write_u32(&mut self.data[index..index + 4], value);
    }

    /// Current write position
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Size of the code written (everything before the write position)
    pub fn size(&self) -> usize {
        self.pos
    }

    /// Move the write position, growing the buffer with zeros if it moves past the end
    pub fn set_pos(&mut self, pos: usize) {
        self.pos = pos;
        if pos > self.data.len() {
            self.data.resize(pos, 0);
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.pos]
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }
}
