//! One's-complement byte-sum checksum shared by the VHD footer and dynamic header.

use std::ops::Range;

/// Sum every byte into a wrapping `u32` and return the complement.
pub fn checksum(bytes: &[u8]) -> u32 {
    let sum = bytes
        .iter()
        .fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)));
    !sum
}

/// Checksum of `record` as if the bytes in `field` were zero.
///
/// Equivalent to zeroing the field in a copy and calling [`checksum`], without the copy.
pub fn record_checksum(record: &[u8], field: Range<usize>) -> u32 {
    let sum = record
        .iter()
        .enumerate()
        .filter(|(i, _)| !field.contains(i))
        .fold(0u32, |acc, (_, &b)| acc.wrapping_add(u32::from(b)));
    !sum
}

/// Zero `field`, compute the checksum and store it big-endian in `field`.
pub fn seal_record(record: &mut [u8], field: Range<usize>) {
    record[field.clone()].fill(0);
    let sum = checksum(record);
    record[field].copy_from_slice(&sum.to_be_bytes());
}
