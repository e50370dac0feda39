use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use super::{DiskType, VHD_FOOTER_COOKIE};
use crate::checksum::{record_checksum, seal_record};
use crate::util::{be_u16, be_u32, be_u64};
use crate::{DiskError, Geometry, Result, SECTOR_SIZE};

pub const VHD_FOOTER_SIZE: usize = 512;

/// Seconds between the Unix epoch and 2000-01-01T00:00:00Z, the VHD timestamp epoch.
pub const VHD_EPOCH_UNIX_SECS: u64 = 946_684_800;

const FEATURES_RESERVED: u32 = 0x0000_0002;
const FILE_FORMAT_VERSION: u32 = 0x0001_0000;

const OFF_COOKIE: usize = 0;
const OFF_FEATURES: usize = 8;
const OFF_FORMAT_VERSION: usize = 12;
const OFF_DATA_OFFSET: usize = 16;
const OFF_TIMESTAMP: usize = 24;
const OFF_CREATOR_APP: usize = 28;
const OFF_CREATOR_VERSION: usize = 32;
const OFF_CREATOR_HOST_OS: usize = 36;
const OFF_ORIGINAL_SIZE: usize = 40;
const OFF_CURRENT_SIZE: usize = 48;
const OFF_CYLINDERS: usize = 56;
const OFF_HEADS: usize = 58;
const OFF_SECTORS_PER_TRACK: usize = 59;
const OFF_DISK_TYPE: usize = 60;
const OFF_CHECKSUM: usize = 64;
const OFF_UNIQUE_ID: usize = 68;

const CHECKSUM_FIELD: std::ops::Range<usize> = OFF_CHECKSUM..OFF_CHECKSUM + 4;

/// Creator fields stamped into new footers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Creator {
    pub app: [u8; 4],
    pub version: u32,
    pub host_os: [u8; 4],
}

impl Default for Creator {
    fn default() -> Self {
        Self {
            app: *b"dcnv",
            version: 0x0001_0000,
            host_os: *b"Wi2k",
        }
    }
}

/// Convert a wall-clock time to the footer timestamp (seconds since 2000-01-01 UTC).
///
/// Times before the VHD epoch clamp to 0; times past 2136 clamp to `u32::MAX`.
pub fn vhd_timestamp(now: SystemTime) -> u32 {
    let unix = now
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    unix.saturating_sub(VHD_EPOCH_UNIX_SECS)
        .min(u64::from(u32::MAX)) as u32
}

/// The 512-byte VHD footer ("disk descriptor").
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct VhdFooter {
    pub features: u32,
    pub format_version: u32,
    /// `u64::MAX` for fixed disks, offset of the dynamic header otherwise.
    pub data_offset: u64,
    pub timestamp: u32,
    pub creator: Creator,
    pub original_size: u64,
    pub current_size: u64,
    pub geometry: Geometry,
    pub disk_type: DiskType,
    /// Checksum as stored on disk. Ignored by [`VhdFooter::to_bytes`], which always recomputes.
    pub checksum: u32,
    pub unique_id: Uuid,
}

impl VhdFooter {
    /// Footer for a new disk of `disk_size` bytes, stamped with the current time and a fresh
    /// random unique id.
    pub fn new(disk_type: DiskType, disk_size: u64, data_offset: u64, creator: Creator) -> Self {
        Self::with_identity(
            disk_type,
            disk_size,
            data_offset,
            creator,
            vhd_timestamp(SystemTime::now()),
            Uuid::new_v4(),
        )
    }

    pub fn with_identity(
        disk_type: DiskType,
        disk_size: u64,
        data_offset: u64,
        creator: Creator,
        timestamp: u32,
        unique_id: Uuid,
    ) -> Self {
        Self {
            features: FEATURES_RESERVED,
            format_version: FILE_FORMAT_VERSION,
            data_offset,
            timestamp,
            creator,
            original_size: disk_size,
            current_size: disk_size,
            geometry: Geometry::from_total_sectors(disk_size / SECTOR_SIZE as u64),
            disk_type,
            checksum: 0,
            unique_id,
        }
    }

    /// Serialize and seal. The checksum is computed last, over every other field.
    pub fn to_bytes(&self) -> [u8; VHD_FOOTER_SIZE] {
        let mut raw = [0u8; VHD_FOOTER_SIZE];
        raw[OFF_COOKIE..OFF_COOKIE + 8].copy_from_slice(&VHD_FOOTER_COOKIE);
        raw[OFF_FEATURES..OFF_FEATURES + 4].copy_from_slice(&self.features.to_be_bytes());
        raw[OFF_FORMAT_VERSION..OFF_FORMAT_VERSION + 4]
            .copy_from_slice(&self.format_version.to_be_bytes());
        raw[OFF_DATA_OFFSET..OFF_DATA_OFFSET + 8].copy_from_slice(&self.data_offset.to_be_bytes());
        raw[OFF_TIMESTAMP..OFF_TIMESTAMP + 4].copy_from_slice(&self.timestamp.to_be_bytes());
        raw[OFF_CREATOR_APP..OFF_CREATOR_APP + 4].copy_from_slice(&self.creator.app);
        raw[OFF_CREATOR_VERSION..OFF_CREATOR_VERSION + 4]
            .copy_from_slice(&self.creator.version.to_be_bytes());
        raw[OFF_CREATOR_HOST_OS..OFF_CREATOR_HOST_OS + 4].copy_from_slice(&self.creator.host_os);
        raw[OFF_ORIGINAL_SIZE..OFF_ORIGINAL_SIZE + 8]
            .copy_from_slice(&self.original_size.to_be_bytes());
        raw[OFF_CURRENT_SIZE..OFF_CURRENT_SIZE + 8]
            .copy_from_slice(&self.current_size.to_be_bytes());
        raw[OFF_CYLINDERS..OFF_CYLINDERS + 2]
            .copy_from_slice(&self.geometry.cylinders.to_be_bytes());
        raw[OFF_HEADS] = self.geometry.heads;
        raw[OFF_SECTORS_PER_TRACK] = self.geometry.sectors_per_track;
        raw[OFF_DISK_TYPE..OFF_DISK_TYPE + 4]
            .copy_from_slice(&self.disk_type.to_raw().to_be_bytes());
        raw[OFF_UNIQUE_ID..OFF_UNIQUE_ID + 16].copy_from_slice(self.unique_id.as_bytes());
        seal_record(&mut raw, CHECKSUM_FIELD);
        raw
    }

    /// Parse a footer without judging its checksum; see [`VhdFooter::checksum_valid`].
    pub fn parse(raw: &[u8; VHD_FOOTER_SIZE]) -> Result<Self> {
        if raw[OFF_COOKIE..OFF_COOKIE + 8] != VHD_FOOTER_COOKIE {
            return Err(DiskError::Format("vhd footer cookie mismatch"));
        }

        let disk_type = DiskType::from_raw(be_u32(&raw[OFF_DISK_TYPE..]))
            .ok_or(DiskError::Format("vhd disk type unknown"))?;

        let mut creator_app = [0u8; 4];
        creator_app.copy_from_slice(&raw[OFF_CREATOR_APP..OFF_CREATOR_APP + 4]);
        let mut creator_host_os = [0u8; 4];
        creator_host_os.copy_from_slice(&raw[OFF_CREATOR_HOST_OS..OFF_CREATOR_HOST_OS + 4]);
        let mut unique_id = [0u8; 16];
        unique_id.copy_from_slice(&raw[OFF_UNIQUE_ID..OFF_UNIQUE_ID + 16]);

        Ok(Self {
            features: be_u32(&raw[OFF_FEATURES..]),
            format_version: be_u32(&raw[OFF_FORMAT_VERSION..]),
            data_offset: be_u64(&raw[OFF_DATA_OFFSET..]),
            timestamp: be_u32(&raw[OFF_TIMESTAMP..]),
            creator: Creator {
                app: creator_app,
                version: be_u32(&raw[OFF_CREATOR_VERSION..]),
                host_os: creator_host_os,
            },
            original_size: be_u64(&raw[OFF_ORIGINAL_SIZE..]),
            current_size: be_u64(&raw[OFF_CURRENT_SIZE..]),
            geometry: Geometry {
                cylinders: be_u16(&raw[OFF_CYLINDERS..]),
                heads: raw[OFF_HEADS],
                sectors_per_track: raw[OFF_SECTORS_PER_TRACK],
            },
            disk_type,
            checksum: be_u32(&raw[OFF_CHECKSUM..]),
            unique_id: Uuid::from_bytes(unique_id),
        })
    }

    /// Whether the stored checksum matches the one recomputed over `raw`.
    pub fn checksum_valid(raw: &[u8; VHD_FOOTER_SIZE]) -> bool {
        be_u32(&raw[OFF_CHECKSUM..]) == record_checksum(raw, CHECKSUM_FIELD)
    }

    /// Peek at the cookie only.
    pub fn has_cookie(raw: &[u8]) -> bool {
        raw.len() >= 8 && raw[..8] == VHD_FOOTER_COOKIE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::checksum;

    fn sample(disk_type: DiskType) -> VhdFooter {
        VhdFooter::with_identity(
            disk_type,
            10 * 1024 * 1024,
            512,
            Creator::default(),
            0x1234_5678,
            Uuid::from_bytes([7u8; 16]),
        )
    }

    #[test]
    fn footer_fields_land_at_fixed_offsets() {
        let raw = sample(DiskType::Dynamic).to_bytes();
        assert_eq!(&raw[0..8], b"conectix");
        assert_eq!(be_u32(&raw[8..]), 2);
        assert_eq!(be_u32(&raw[12..]), 0x0001_0000);
        assert_eq!(be_u64(&raw[16..]), 512);
        assert_eq!(be_u32(&raw[24..]), 0x1234_5678);
        assert_eq!(&raw[28..32], b"dcnv");
        assert_eq!(&raw[36..40], b"Wi2k");
        assert_eq!(be_u64(&raw[40..]), 10 * 1024 * 1024);
        assert_eq!(be_u64(&raw[48..]), 10 * 1024 * 1024);
        assert_eq!(be_u16(&raw[56..]), 301);
        assert_eq!(raw[58], 4);
        assert_eq!(raw[59], 17);
        assert_eq!(be_u32(&raw[60..]), 3);
        assert_eq!(&raw[68..84], &[7u8; 16]);
        assert!(raw[84..].iter().all(|&b| b == 0));
    }

    #[test]
    fn stored_checksum_matches_zeroed_record() {
        let raw = sample(DiskType::Fixed).to_bytes();
        let mut zeroed = raw;
        zeroed[64..68].fill(0);
        assert_eq!(be_u32(&raw[64..]), checksum(&zeroed));
        assert!(VhdFooter::checksum_valid(&raw));
    }

    #[test]
    fn parse_recovers_every_field() {
        let footer = sample(DiskType::Dynamic);
        let raw = footer.to_bytes();
        let parsed = VhdFooter::parse(&raw).unwrap();
        assert_eq!(parsed.checksum, be_u32(&raw[64..]));
        assert_eq!(VhdFooter { checksum: 0, ..parsed }, footer);
    }

    #[test]
    fn parse_rejects_bad_cookie() {
        let mut raw = sample(DiskType::Fixed).to_bytes();
        raw[0] = b'C';
        assert!(matches!(
            VhdFooter::parse(&raw).unwrap_err(),
            DiskError::Format(_)
        ));
    }

    #[test]
    fn parse_rejects_unknown_disk_type() {
        let mut raw = sample(DiskType::Fixed).to_bytes();
        for unknown in [0u32, 1, 5, 7] {
            raw[60..64].copy_from_slice(&unknown.to_be_bytes());
            assert!(matches!(
                VhdFooter::parse(&raw).unwrap_err(),
                DiskError::Format("vhd disk type unknown")
            ));
        }
    }

    #[test]
    fn corrupted_byte_invalidates_checksum() {
        let mut raw = sample(DiskType::Fixed).to_bytes();
        raw[50] ^= 0x01;
        assert!(!VhdFooter::checksum_valid(&raw));
    }

    #[test]
    fn timestamp_counts_from_2000() {
        let t = UNIX_EPOCH + std::time::Duration::from_secs(VHD_EPOCH_UNIX_SECS + 42);
        assert_eq!(vhd_timestamp(t), 42);
        assert_eq!(vhd_timestamp(UNIX_EPOCH), 0);
    }

    #[test]
    fn new_footers_get_distinct_ids() {
        let a = VhdFooter::new(DiskType::Fixed, 512, u64::MAX, Creator::default());
        let b = VhdFooter::new(DiskType::Fixed, 512, u64::MAX, Creator::default());
        assert_ne!(a.unique_id, b.unique_id);
    }
}
