//! Cell frame header format.
//!
//! ```text
//! [frame_len: u32 LE][cell_id: u32 LE][length: u16 LE][record_type: u16 LE][timestamp: u32 LE]
//! [body: `length` granules in use, then unused capacity up to frame_len]
//! ```
//!
//! `frame_len` covers the whole frame (header included) and is a multiple of
//! [`config::BLOCK_SIZE`]. It never shrinks: a frame keeps its capacity when
//! overwritten with a smaller value.

use byteorder::{ByteOrder, LittleEndian};

/// Encoded size of a [`FrameHeader`] in bytes (two granules).
pub const FRAME_HEADER_SIZE: usize = 16;

const BLOCK: usize = config::BLOCK_SIZE as usize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_len: u32,
    pub cell_id: u32,
    /// Body granules currently in use.
    pub length: u16,
    pub record_type: u16,
    pub timestamp: u32,
}

impl FrameHeader {
    /// Body granules the frame can hold.
    #[must_use]
    pub fn capacity(&self) -> usize {
        (self.frame_len as usize).saturating_sub(FRAME_HEADER_SIZE) / BLOCK
    }

    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], self.frame_len);
        LittleEndian::write_u32(&mut buf[4..8], self.cell_id);
        LittleEndian::write_u16(&mut buf[8..10], self.length);
        LittleEndian::write_u16(&mut buf[10..12], self.record_type);
        LittleEndian::write_u32(&mut buf[12..16], self.timestamp);
        buf
    }

    pub fn decode(buf: &[u8; FRAME_HEADER_SIZE]) -> Self {
        Self {
            frame_len: LittleEndian::read_u32(&buf[0..4]),
            cell_id: LittleEndian::read_u32(&buf[4..8]),
            length: LittleEndian::read_u16(&buf[8..10]),
            record_type: LittleEndian::read_u16(&buf[10..12]),
            timestamp: LittleEndian::read_u32(&buf[12..16]),
        }
    }

    /// Checks the structural invariants of a frame read from disk.
    pub fn validate(&self) -> Result<(), String> {
        let len = self.frame_len as usize;
        if len < FRAME_HEADER_SIZE + BLOCK || len % BLOCK != 0 {
            return Err(format!("bad frame length {}", self.frame_len));
        }
        if self.cell_id == 0 {
            return Err("frame for reserved cell id 0".to_string());
        }
        if self.length as usize > self.capacity() {
            return Err(format!(
                "body of {} granules exceeds frame capacity {}",
                self.length,
                self.capacity()
            ));
        }
        Ok(())
    }
}
