use super::VHD_DYNAMIC_COOKIE;
use crate::checksum::{record_checksum, seal_record};
use crate::util::{be_u32, be_u64};
use crate::{DiskError, Result, SECTOR_SIZE};

pub const VHD_DYNAMIC_HEADER_SIZE: usize = 1024;

const HEADER_VERSION: u32 = 0x0001_0000;

const OFF_COOKIE: usize = 0;
const OFF_DATA_OFFSET: usize = 8;
const OFF_TABLE_OFFSET: usize = 16;
const OFF_HEADER_VERSION: usize = 24;
const OFF_MAX_TABLE_ENTRIES: usize = 28;
const OFF_BLOCK_SIZE: usize = 32;
const OFF_CHECKSUM: usize = 36;

const CHECKSUM_FIELD: std::ops::Range<usize> = OFF_CHECKSUM..OFF_CHECKSUM + 4;

/// The 1024-byte dynamic disk header ("sparse layout record").
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct VhdDynamicHeader {
    pub table_offset: u64,
    pub header_version: u32,
    pub max_table_entries: u32,
    pub block_size: u32,
    /// Checksum as stored on disk. Ignored by [`VhdDynamicHeader::to_bytes`].
    pub checksum: u32,
}

impl VhdDynamicHeader {
    pub fn new(table_offset: u64, max_table_entries: u32, block_size: u32) -> Self {
        Self {
            table_offset,
            header_version: HEADER_VERSION,
            max_table_entries,
            block_size,
            checksum: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; VHD_DYNAMIC_HEADER_SIZE] {
        let mut raw = [0u8; VHD_DYNAMIC_HEADER_SIZE];
        raw[OFF_COOKIE..OFF_COOKIE + 8].copy_from_slice(&VHD_DYNAMIC_COOKIE);
        // Next-structure offset; unused for non-differencing disks.
        raw[OFF_DATA_OFFSET..OFF_DATA_OFFSET + 8].copy_from_slice(&u64::MAX.to_be_bytes());
        raw[OFF_TABLE_OFFSET..OFF_TABLE_OFFSET + 8]
            .copy_from_slice(&self.table_offset.to_be_bytes());
        raw[OFF_HEADER_VERSION..OFF_HEADER_VERSION + 4]
            .copy_from_slice(&self.header_version.to_be_bytes());
        raw[OFF_MAX_TABLE_ENTRIES..OFF_MAX_TABLE_ENTRIES + 4]
            .copy_from_slice(&self.max_table_entries.to_be_bytes());
        raw[OFF_BLOCK_SIZE..OFF_BLOCK_SIZE + 4].copy_from_slice(&self.block_size.to_be_bytes());
        seal_record(&mut raw, CHECKSUM_FIELD);
        raw
    }

    /// Parse and sanity-check the header. The checksum is not judged here; see
    /// [`VhdDynamicHeader::checksum_valid`].
    pub fn parse(raw: &[u8; VHD_DYNAMIC_HEADER_SIZE]) -> Result<Self> {
        if raw[OFF_COOKIE..OFF_COOKIE + 8] != VHD_DYNAMIC_COOKIE {
            return Err(DiskError::Format("vhd dynamic header cookie mismatch"));
        }

        let table_offset = be_u64(&raw[OFF_TABLE_OFFSET..]);
        let block_size = be_u32(&raw[OFF_BLOCK_SIZE..]);

        if table_offset % SECTOR_SIZE as u64 != 0 {
            return Err(DiskError::Format("vhd bat offset misaligned"));
        }
        if block_size == 0 || (block_size as u64) % SECTOR_SIZE as u64 != 0 {
            return Err(DiskError::Format("vhd block_size invalid"));
        }

        Ok(Self {
            table_offset,
            header_version: be_u32(&raw[OFF_HEADER_VERSION..]),
            max_table_entries: be_u32(&raw[OFF_MAX_TABLE_ENTRIES..]),
            block_size,
            checksum: be_u32(&raw[OFF_CHECKSUM..]),
        })
    }

    pub fn checksum_valid(raw: &[u8; VHD_DYNAMIC_HEADER_SIZE]) -> bool {
        be_u32(&raw[OFF_CHECKSUM..]) == record_checksum(raw, CHECKSUM_FIELD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::checksum;

    #[test]
    fn header_fields_land_at_fixed_offsets() {
        let raw = VhdDynamicHeader::new(1536, 5, 0x20_0000).to_bytes();
        assert_eq!(&raw[0..8], b"cxsparse");
        assert_eq!(be_u64(&raw[8..]), u64::MAX);
        assert_eq!(be_u64(&raw[16..]), 1536);
        assert_eq!(be_u32(&raw[24..]), 0x0001_0000);
        assert_eq!(be_u32(&raw[28..]), 5);
        assert_eq!(be_u32(&raw[32..]), 0x20_0000);
        assert!(raw[40..].iter().all(|&b| b == 0));

        let mut zeroed = raw;
        zeroed[36..40].fill(0);
        assert_eq!(be_u32(&raw[36..]), checksum(&zeroed));
    }

    #[test]
    fn parse_roundtrips_and_validates_checksum() {
        let header = VhdDynamicHeader::new(1536, 12, 0x20_0000);
        let raw = header.to_bytes();
        assert!(VhdDynamicHeader::checksum_valid(&raw));
        let parsed = VhdDynamicHeader::parse(&raw).unwrap();
        assert_eq!(parsed.table_offset, 1536);
        assert_eq!(parsed.max_table_entries, 12);
        assert_eq!(parsed.block_size, 0x20_0000);
        assert_eq!(parsed.checksum, be_u32(&raw[36..]));
    }

    #[test]
    fn parse_rejects_misaligned_block_size() {
        let raw = VhdDynamicHeader::new(1536, 1, 1000).to_bytes();
        assert!(matches!(
            VhdDynamicHeader::parse(&raw).unwrap_err(),
            DiskError::Format(_)
        ));
    }

    #[test]
    fn parse_rejects_footer_cookie() {
        let mut raw = VhdDynamicHeader::new(1536, 1, 0x20_0000).to_bytes();
        raw[..8].copy_from_slice(b"conectix");
        assert!(matches!(
            VhdDynamicHeader::parse(&raw).unwrap_err(),
            DiskError::Format(_)
        ));
    }
}
