//! Block writer and parser.
//!
//! A record is written as one contiguous buffer:
//!
//! ```text
//! [sentinel header]?  only when the time delta exceeds 0xFFFF
//! [header][body granules ...]
//! ```

use std::io::{self, BufReader, Read, Write};

use rand::RngCore;

use crate::body::{decode_body, encode_body, MAX_PAYLOAD};
use crate::header::{
    accumulate, BlockHeader, ScanState, WriteState, HEADER_SIZE, TIME_ADVANCE_TYPE,
};
use crate::CodecError;

const BLOCK: u64 = config::BLOCK_SIZE;

/// Result of a successful [`write_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Appended {
    /// Physical bytes written, sentinel included.
    pub bytes_written: u64,
    /// Block index of the primary header (after any sentinel).
    pub block_offset: u64,
    /// Timestamp actually recorded; equals the requested time unless that
    /// lay before the previous record's timestamp.
    pub timestamp: u32,
}

/// A decoded, non-sentinel record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Block index of the record header.
    pub offset: u64,
    pub timestamp: u32,
    pub record_type: u16,
    pub payload: Vec<u8>,
}

/// Rejects record types and payload sizes the format cannot represent.
pub fn validate_record(record_type: u16, payload_len: usize) -> Result<(), CodecError> {
    if record_type >= TIME_ADVANCE_TYPE {
        return Err(CodecError::InvalidArgument(format!(
            "record type {:#06x} is reserved",
            record_type
        )));
    }
    if payload_len > MAX_PAYLOAD {
        return Err(CodecError::InvalidArgument(format!(
            "payload too large: {} bytes (max {})",
            payload_len, MAX_PAYLOAD
        )));
    }
    Ok(())
}

/// Serializes one record and writes it to `w` with a single `write_all`.
///
/// `base_offset` is the byte position `w` is positioned at; it only feeds the
/// returned block offset. `state` is updated only once the write succeeded.
pub fn write_block<W, R>(
    w: &mut W,
    base_offset: u64,
    record_type: u16,
    payload: &[u8],
    time: u32,
    state: &mut WriteState,
    rng: &mut R,
) -> Result<Appended, CodecError>
where
    W: Write + ?Sized,
    R: RngCore + ?Sized,
{
    validate_record(record_type, payload.len())?;

    let mut next = *state;
    let delta = time.saturating_sub(next.last_timestamp);
    let mut buf = Vec::with_capacity(2 * HEADER_SIZE + payload.len() + BLOCK as usize);

    if delta > 0xFFFF {
        let high = (delta >> 16) as u16;
        buf.extend_from_slice(&BlockHeader::time_advance(next.checksum, high).encode());
        next.checksum = accumulate(next.checksum, &[], high, TIME_ADVANCE_TYPE);
    }
    let sentinel_bytes = buf.len() as u64;

    // Header is filled in once the body length is known.
    buf.extend_from_slice(&[0u8; HEADER_SIZE]);
    let record_size = encode_body(payload, rng, &mut buf)?;
    let low = (delta & 0xFFFF) as u16;
    let header = BlockHeader {
        checksum: next.checksum,
        record_type,
        record_size,
        time_advance: low,
    };
    let header_start = sentinel_bytes as usize;
    buf[header_start..header_start + HEADER_SIZE].copy_from_slice(&header.encode());

    let body = &buf[header_start + HEADER_SIZE..];
    next.checksum = accumulate(next.checksum, body, low, record_type);
    next.last_timestamp = next.last_timestamp.wrapping_add(delta);

    w.write_all(&buf)?;
    *state = next;

    Ok(Appended {
        bytes_written: buf.len() as u64,
        block_offset: (base_offset + sentinel_bytes) / BLOCK,
        timestamp: next.last_timestamp,
    })
}

/// Reads one block from `r` starting at byte `offset`.
///
/// `header` is filled in as soon as it has been read, so callers can report
/// the record type of a block whose body turned out to be damaged. The body
/// (still padded) lands in `body`. Returns the number of bytes consumed.
///
/// Unless `skip_checksum_check` is set, the header's checksum must equal
/// `checksum`; either way the header's value becomes the new baseline.
pub fn parse_block<R: Read + ?Sized>(
    r: &mut R,
    offset: u64,
    header: &mut BlockHeader,
    checksum: &mut u16,
    cur_time: &mut u32,
    body: &mut Vec<u8>,
    skip_checksum_check: bool,
) -> Result<u64, CodecError> {
    *header = read_header(r, offset)?;
    parse_body(r, offset, header, checksum, cur_time, body, skip_checksum_check)
}

/// First half of [`parse_block`]: reads and decodes the header only.
pub fn read_header<R: Read + ?Sized>(r: &mut R, offset: u64) -> Result<BlockHeader, CodecError> {
    let mut raw = [0u8; HEADER_SIZE];
    read_exact_at(r, &mut raw, offset / BLOCK)?;
    Ok(BlockHeader::decode(&raw))
}

/// Second half of [`parse_block`]: verifies the chain and consumes the body
/// belonging to `header`.
pub fn parse_body<R: Read + ?Sized>(
    r: &mut R,
    offset: u64,
    header: &BlockHeader,
    checksum: &mut u16,
    cur_time: &mut u32,
    body: &mut Vec<u8>,
    skip_checksum_check: bool,
) -> Result<u64, CodecError> {
    let block = offset / BLOCK;
    if !skip_checksum_check && header.checksum != *checksum {
        return Err(CodecError::Checksum {
            expected: *checksum,
            found: header.checksum,
            offset: block,
        });
    }

    body.clear();
    if header.record_type == TIME_ADVANCE_TYPE {
        if header.record_size != 0 {
            return Err(CodecError::Corrupt {
                offset: block,
                reason: format!(
                    "time-advance block with non-zero size {}",
                    header.record_size
                ),
            });
        }
        *checksum = accumulate(header.checksum, &[], header.time_advance, TIME_ADVANCE_TYPE);
        *cur_time = cur_time.wrapping_add(u32::from(header.time_advance) << 16);
        return Ok(HEADER_SIZE as u64);
    }

    body.resize(header.body_len(), 0);
    read_exact_at(r, body, block)?;
    *checksum = accumulate(header.checksum, body, header.time_advance, header.record_type);
    *cur_time = cur_time.wrapping_add(u32::from(header.time_advance));

    Ok((HEADER_SIZE + body.len()) as u64)
}

fn read_exact_at<R: Read + ?Sized>(r: &mut R, buf: &mut [u8], block: u64) -> Result<(), CodecError> {
    match r.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            Err(CodecError::UnexpectedEof { offset: block })
        }
        Err(e) => Err(CodecError::Io(e)),
    }
}

/// Sequential reader over a byte range of an append log.
///
/// Yields decoded records and silently consumes time-advance sentinels. The
/// reader is generic over any `Read` implementor, so tests can feed it a
/// `Cursor<Vec<u8>>`; `inner` must already be positioned at `start`.
pub struct BlockReader<R: Read> {
    rdr: BufReader<R>,
    offset: u64,
    end: u64,
    state: ScanState,
    skip_next_check: bool,
    header: Option<BlockHeader>,
    body: Vec<u8>,
}

impl<R: Read> BlockReader<R> {
    /// Creates a reader over bytes `[start, end)`.
    ///
    /// With `skip_first_check` the first header's checksum is adopted as the
    /// trusted baseline instead of being compared against `state`.
    pub fn new(inner: R, start: u64, end: u64, state: ScanState, skip_first_check: bool) -> Self {
        Self {
            rdr: BufReader::new(inner),
            offset: start,
            end,
            state,
            skip_next_check: skip_first_check,
            header: None,
            body: Vec::with_capacity(256),
        }
    }

    /// Current byte position (start of the next unread block).
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Chain state after the last consumed block.
    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Header of the block most recently read (possibly a failed one).
    /// `None` if the header of the current block could not be read.
    pub fn last_header(&self) -> Option<BlockHeader> {
        self.header
    }

    /// Returns the next record, or `None` once `end` is reached.
    pub fn next_record(&mut self) -> Result<Option<LogRecord>, CodecError> {
        loop {
            if self.offset >= self.end {
                return Ok(None);
            }
            let record_offset = self.offset / BLOCK;
            self.header = None;
            let header = read_header(&mut self.rdr, self.offset)?;
            self.header = Some(header);
            let consumed = parse_body(
                &mut self.rdr,
                self.offset,
                &header,
                &mut self.state.checksum,
                &mut self.state.cur_time,
                &mut self.body,
                self.skip_next_check,
            )?;
            self.skip_next_check = false;
            self.offset += consumed;

            if header.is_time_advance() {
                continue;
            }
            return Ok(Some(LogRecord {
                offset: record_offset,
                timestamp: self.state.cur_time,
                record_type: header.record_type,
                payload: decode_body(&self.body).to_vec(),
            }));
        }
    }
}
