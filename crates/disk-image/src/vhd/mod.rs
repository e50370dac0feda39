//! Microsoft VHD containers: fixed and dynamic (sparse) disks.
//!
//! Dynamic layout produced by [`encode_dynamic_vhd`] (all fields big-endian):
//!
//! ```text
//! [0]     512B   footer copy
//! [512]   1024B  dynamic disk header
//! [1536]  N*4B   block allocation table, padded to a sector boundary
//! [...]          allocated blocks in ascending block order: bitmap sectors + block data
//! [end]   512B   footer (byte-identical to the copy at offset 0)
//! ```

mod bat;
mod decode;
mod dynamic_header;
mod encode;
mod footer;

pub use bat::{BlockAllocationTable, BlockLayout, BAT_UNALLOCATED, DEFAULT_BLOCK_SIZE};
pub use decode::{decode_vhd, DecodeOptions, DecodeSummary, VhdContainer};
pub use dynamic_header::{VhdDynamicHeader, VHD_DYNAMIC_HEADER_SIZE};
pub use encode::{encode_dynamic_vhd, scan_allocated_blocks, DynamicVhdConfig, EncodeSummary};
pub use footer::{vhd_timestamp, Creator, VhdFooter, VHD_EPOCH_UNIX_SECS, VHD_FOOTER_SIZE};

pub(crate) const VHD_FOOTER_COOKIE: [u8; 8] = *b"conectix";
pub(crate) const VHD_DYNAMIC_COOKIE: [u8; 8] = *b"cxsparse";

/// Disk type field of the footer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DiskType {
    Fixed,
    Dynamic,
    /// Parsed so it can be reported, never converted.
    Differencing,
}

impl DiskType {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            2 => Some(Self::Fixed),
            3 => Some(Self::Dynamic),
            4 => Some(Self::Differencing),
            _ => None,
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            Self::Fixed => 2,
            Self::Dynamic => 3,
            Self::Differencing => 4,
        }
    }
}

impl std::fmt::Display for DiskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Fixed => "fixed",
            Self::Dynamic => "dynamic",
            Self::Differencing => "differencing",
        })
    }
}
