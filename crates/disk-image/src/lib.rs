//! Disk image conversion between flat images and VHD containers.
//!
//! The emulator's SD card images are plain sector dumps, which are mostly zero. This crate
//! turns them into dynamic (sparse) VHDs that host tools can still mount, and back:
//!
//! - [`SectorSource`] / [`ImageSource`]: sector reads over a flat image or fixed VHD
//! - [`Geometry`]: advisory CHS triple for the VHD footer
//! - [`checksum`]: the one's-complement checksum shared by the VHD records
//! - [`VhdFooter`] / [`VhdDynamicHeader`]: fixed-offset metadata records
//! - [`BlockAllocationTable`]: block index to file offset map
//! - [`encode_dynamic_vhd`] / [`decode_vhd`]: the two conversion pipelines
//! - [`sprs`]: a simpler sector-list sparse format used by older tooling

mod backend;
pub mod checksum;
mod error;
mod formats;
mod geometry;
mod progress;
mod source;
pub mod sprs;
mod util;
pub mod vhd;

pub use backend::{read_padded, FileBackend, MemBackend, StorageBackend};
pub use error::{DiskError, Result};
pub use formats::{detect_format, inspect, DiskFormat, ImageInfo};
pub use geometry::{Geometry, MAX_CHS_SECTORS};
pub use progress::{NoProgress, Phase, Progress};
pub use source::{ImageSource, SectorSource, SourceKind, SECTOR_SIZE};
pub use vhd::{
    decode_vhd, encode_dynamic_vhd, BlockAllocationTable, BlockLayout, DecodeOptions,
    DecodeSummary, DiskType, DynamicVhdConfig, EncodeSummary, VhdContainer, VhdDynamicHeader,
    VhdFooter,
};

#[cfg(test)]
mod proptests;
