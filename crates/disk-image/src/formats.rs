use crate::source::read_trailing_footer;
use crate::sprs::{SprsHeader, SPRS_MAGIC};
use crate::vhd::{DecodeOptions, DiskType, VhdContainer, VhdDynamicHeader, VhdFooter};
use crate::{Result, StorageBackend, SECTOR_SIZE};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DiskFormat {
    Raw,
    VhdFixed,
    VhdDynamic,
    VhdDifferencing,
    Sprs,
}

impl DiskFormat {
    pub fn name(self) -> &'static str {
        match self {
            DiskFormat::Raw => "raw",
            DiskFormat::VhdFixed => "vhd-fixed",
            DiskFormat::VhdDynamic => "vhd-dynamic",
            DiskFormat::VhdDifferencing => "vhd-differencing",
            DiskFormat::Sprs => "sprs",
        }
    }
}

/// Detect the image format from magic values.
///
/// Detection is conservative: unknown images fall back to [`DiskFormat::Raw`]. A trailing
/// footer cookie with an unparseable disk type is reported as raw too; opening it as VHD
/// would fail anyway.
pub fn detect_format<B: StorageBackend + ?Sized>(backend: &B) -> Result<DiskFormat> {
    if let Some(raw) = read_trailing_footer(backend)? {
        if let Ok(footer) = VhdFooter::parse(&raw) {
            return Ok(match footer.disk_type {
                DiskType::Fixed => DiskFormat::VhdFixed,
                DiskType::Dynamic => DiskFormat::VhdDynamic,
                DiskType::Differencing => DiskFormat::VhdDifferencing,
            });
        }
    }

    if backend.len()? >= 4 {
        let mut magic = [0u8; 4];
        backend.read_at(0, &mut magic)?;
        if magic == SPRS_MAGIC {
            return Ok(DiskFormat::Sprs);
        }
    }

    Ok(DiskFormat::Raw)
}

/// Summary of an image, as printed by `disk-convert info`.
#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub format: DiskFormat,
    pub file_len: u64,
    /// Size of the virtual disk in bytes.
    pub disk_size: u64,
    pub footer: Option<VhdFooter>,
    pub dynamic_header: Option<VhdDynamicHeader>,
    pub total_blocks: Option<u64>,
    pub allocated_blocks: Option<u64>,
    pub sprs: Option<SprsHeader>,
}

pub fn inspect<B: StorageBackend + ?Sized>(
    backend: &B,
    options: &DecodeOptions,
) -> Result<ImageInfo> {
    let file_len = backend.len()?;
    let format = detect_format(backend)?;
    let mut info = ImageInfo {
        format,
        file_len,
        disk_size: file_len - file_len % SECTOR_SIZE as u64,
        footer: None,
        dynamic_header: None,
        total_blocks: None,
        allocated_blocks: None,
        sprs: None,
    };

    match format {
        DiskFormat::Raw => {}
        DiskFormat::VhdDifferencing => {
            // Still worth showing the footer even though the disk cannot be converted.
            if let Some(raw) = read_trailing_footer(backend)? {
                let footer = VhdFooter::parse(&raw)?;
                info.disk_size = footer.current_size;
                info.footer = Some(footer);
            }
        }
        DiskFormat::VhdFixed | DiskFormat::VhdDynamic => {
            let container = VhdContainer::open(backend, options)?;
            info.disk_size = container.footer().current_size;
            info.footer = Some(container.footer().clone());
            info.dynamic_header = container.dynamic_header().cloned();
            if let Some(bat) = container.bat() {
                info.total_blocks = Some(bat.len() as u64);
                info.allocated_blocks = Some(bat.allocated_count() as u64);
            }
        }
        DiskFormat::Sprs => {
            let header = SprsHeader::read(backend)?;
            info.disk_size = u64::from(header.total_sectors) * SECTOR_SIZE as u64;
            info.sprs = Some(header);
        }
    }

    Ok(info)
}
