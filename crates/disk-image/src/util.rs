use crate::{DiskError, Result};

pub fn align_up_u64(value: u64, alignment: u64) -> Result<u64> {
    if alignment == 0 {
        return Err(DiskError::OffsetOverflow);
    }
    let rem = value % alignment;
    if rem == 0 {
        return Ok(value);
    }
    value
        .checked_add(alignment - rem)
        .ok_or(DiskError::OffsetOverflow)
}

pub fn checked_range(offset: u64, len: usize, capacity: u64) -> Result<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or(DiskError::OffsetOverflow)?;
    if end > capacity {
        return Err(DiskError::OutOfBounds {
            offset,
            len,
            capacity,
        });
    }
    Ok(())
}

pub fn is_all_zero(buf: &[u8]) -> bool {
    // Compare in word-sized chunks; the tail is handled bytewise.
    let mut chunks = buf.chunks_exact(8);
    let words_zero = chunks
        .by_ref()
        .all(|c| u64::from_ne_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) == 0);
    words_zero && chunks.remainder().iter().all(|&b| b == 0)
}

pub fn be_u16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

pub fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

pub fn be_u64(bytes: &[u8]) -> u64 {
    u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}
