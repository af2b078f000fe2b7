//! Envelope around V8 code cache bytes.
//!
//! ```text
//! offset  size  field
//!   0      4    magic        "V8HB"
//!   4      2    version      FORMAT_VERSION, little endian
//!   6      2    reserved     zero
//!   8      8    unique id    document the cache was produced for
//!  16      8    digest       FNV-1a 64 of the source
//!  24      4    checksum     FNV-1a 32 of the payload
//!  28      …    payload      V8 code cache
//! ```
//!
//! Bytes that fail any check are rejected before V8 sees them.

use crate::digest::fnv1a_32;

const MAGIC: [u8; 4] = *b"V8HB";
const FORMAT_VERSION: u16 = 1;
const HEADER_LEN: usize = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rejection {
    TooShort,
    BadMagic,
    BadVersion(u16),
    KeyMismatch,
    BadChecksum,
}

pub(crate) fn wrap(unique_id: u64, digest: u64, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(&unique_id.to_le_bytes());
    out.extend_from_slice(&digest.to_le_bytes());
    out.extend_from_slice(&fnv1a_32(payload).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// The V8 payload, if `bytes` were produced for this document and source.
pub(crate) fn unwrap(bytes: &[u8], unique_id: u64, digest: u64) -> Result<&[u8], Rejection> {
    if bytes.len() < HEADER_LEN {
        return Err(Rejection::TooShort);
    }
    let (header, payload) = bytes.split_at(HEADER_LEN);

    if header[0..4] != MAGIC {
        return Err(Rejection::BadMagic);
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != FORMAT_VERSION {
        return Err(Rejection::BadVersion(version));
    }
    if read_u64(&header[8..16]) != unique_id || read_u64(&header[16..24]) != digest {
        return Err(Rejection::KeyMismatch);
    }
    let checksum = u32::from_le_bytes([header[24], header[25], header[26], header[27]]);
    if checksum != fnv1a_32(payload) {
        return Err(Rejection::BadChecksum);
    }
    Ok(payload)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}
