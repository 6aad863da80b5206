//! Granule-aligned record bodies.
//!
//! ```text
//! [payload ...][filler ...][pad_len: u8]
//! ```
//!
//! `pad_len` is the number of filler bytes and is always below
//! [`config::BLOCK_SIZE`]. Filler comes from the caller's generator so stale
//! buffer contents never reach the disk. The same encoding is shared by log
//! records, cell frames and replication records.

use rand::RngCore;

use crate::header::MAX_RECORD_GRANULES;
use crate::CodecError;

const BLOCK: usize = config::BLOCK_SIZE as usize;

/// Largest payload that fits in a single record body.
pub const MAX_PAYLOAD: usize = MAX_RECORD_GRANULES as usize * BLOCK - 1;

/// Number of granules needed to hold `payload_len` bytes plus the trailer.
#[must_use]
pub fn body_granules(payload_len: usize) -> usize {
    (payload_len + 1).div_ceil(BLOCK)
}

/// Appends the encoded body of `payload` to `out` and returns its length in
/// granules.
pub fn encode_body<R: RngCore + ?Sized>(
    payload: &[u8],
    rng: &mut R,
    out: &mut Vec<u8>,
) -> Result<u16, CodecError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(CodecError::InvalidArgument(format!(
            "payload too large: {} bytes (max {})",
            payload.len(),
            MAX_PAYLOAD
        )));
    }
    let granules = body_granules(payload.len());
    let pad = granules * BLOCK - payload.len() - 1;

    out.extend_from_slice(payload);
    let start = out.len();
    out.resize(start + pad, 0);
    rng.fill_bytes(&mut out[start..]);
    out.push(pad as u8);

    Ok(granules as u16)
}

/// Returns the payload slice of an encoded body.
///
/// Never fails: a damaged trailer yields a wrong slice, and the damage is
/// reported by the checksum chain instead.
#[must_use]
pub fn decode_body(body: &[u8]) -> &[u8] {
    let Some(&last) = body.last() else {
        return body;
    };
    let pad = (last as usize) & (BLOCK - 1);
    &body[..body.len().saturating_sub(1 + pad)]
}
