use std::io::Write;

use tracing::{debug, trace, warn};

use super::{
    BlockAllocationTable, BlockLayout, DiskType, VhdDynamicHeader, VhdFooter,
    VHD_DYNAMIC_HEADER_SIZE, VHD_FOOTER_SIZE,
};
use crate::backend::read_padded;
use crate::util::align_up_u64;
use crate::{DiskError, Phase, Progress, Result, StorageBackend, SECTOR_SIZE};

const COPY_CHUNK: usize = 64 * 1024;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DecodeOptions {
    /// Fail with [`DiskError::Format`] when a footer or dynamic header checksum does not
    /// match. When off, mismatches are logged and the stored fields are trusted.
    pub verify_checksums: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            verify_checksums: true,
        }
    }
}

/// What [`decode_vhd`] produced.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DecodeSummary {
    pub disk_type: DiskType,
    pub total_sectors: u64,
    /// `None` for fixed disks.
    pub allocated_blocks: Option<u64>,
    pub bytes_written: u64,
}

#[derive(Debug, Clone)]
struct DynamicParts {
    header: VhdDynamicHeader,
    layout: BlockLayout,
    bat: BlockAllocationTable,
    /// First byte past the footer copy, dynamic header and BAT.
    data_region_start: u64,
}

/// Parsed metadata of a fixed or dynamic VHD.
#[derive(Debug, Clone)]
pub struct VhdContainer {
    footer: VhdFooter,
    dynamic: Option<DynamicParts>,
}

impl VhdContainer {
    /// Parse the trailing footer and, for dynamic disks, the dynamic header and BAT.
    ///
    /// Differencing disks fail with [`DiskError::Unsupported`].
    pub fn open<B: StorageBackend + ?Sized>(backend: &B, options: &DecodeOptions) -> Result<Self> {
        let len = backend.len()?;
        if len < VHD_FOOTER_SIZE as u64 {
            return Err(DiskError::Format("vhd file too small"));
        }

        let mut raw_footer = [0u8; VHD_FOOTER_SIZE];
        backend.read_at(len - VHD_FOOTER_SIZE as u64, &mut raw_footer)?;
        let footer = VhdFooter::parse(&raw_footer)?;
        check_checksum(
            VhdFooter::checksum_valid(&raw_footer),
            options,
            "vhd footer checksum mismatch",
        )?;

        if footer.current_size % SECTOR_SIZE as u64 != 0 {
            return Err(DiskError::Format("vhd current_size invalid"));
        }

        match footer.disk_type {
            DiskType::Fixed => {
                let required_len = footer
                    .current_size
                    .checked_add(VHD_FOOTER_SIZE as u64)
                    .ok_or(DiskError::Format("vhd current_size overflow"))?;
                if len < required_len {
                    return Err(DiskError::Io(format!(
                        "fixed vhd is shorter than declared: {len} bytes, need {required_len}"
                    )));
                }
                Ok(Self {
                    footer,
                    dynamic: None,
                })
            }
            DiskType::Dynamic => {
                let dynamic = open_dynamic(backend, &footer, len, options)?;
                Ok(Self {
                    footer,
                    dynamic: Some(dynamic),
                })
            }
            DiskType::Differencing => Err(DiskError::Unsupported("vhd differencing disk")),
        }
    }

    pub fn footer(&self) -> &VhdFooter {
        &self.footer
    }

    pub fn disk_type(&self) -> DiskType {
        self.footer.disk_type
    }

    pub fn total_sectors(&self) -> u64 {
        self.footer.current_size / SECTOR_SIZE as u64
    }

    pub fn dynamic_header(&self) -> Option<&VhdDynamicHeader> {
        self.dynamic.as_ref().map(|d| &d.header)
    }

    pub fn bat(&self) -> Option<&BlockAllocationTable> {
        self.dynamic.as_ref().map(|d| &d.bat)
    }

    /// Stream the virtual disk contents to `out`, `current_size` bytes in total.
    pub fn write_flat<B: StorageBackend + ?Sized, W: Write>(
        &self,
        backend: &B,
        mut out: W,
        progress: &mut dyn Progress,
    ) -> Result<DecodeSummary> {
        let disk_size = self.footer.current_size;
        progress.begin(Phase::Write, disk_size);

        let allocated_blocks = match &self.dynamic {
            None => {
                let mut buf = vec![0u8; COPY_CHUNK];
                let mut offset = 0u64;
                while offset < disk_size {
                    let len = (disk_size - offset).min(COPY_CHUNK as u64) as usize;
                    backend.read_at(offset, &mut buf[..len])?;
                    out.write_all(&buf[..len])?;
                    offset += len as u64;
                    progress.advance(len as u64);
                }
                None
            }
            Some(dynamic) => Some(self.write_dynamic(dynamic, backend, &mut out, progress)?),
        };

        out.flush()?;
        progress.finish();
        Ok(DecodeSummary {
            disk_type: self.footer.disk_type,
            total_sectors: self.total_sectors(),
            allocated_blocks,
            bytes_written: disk_size,
        })
    }

    fn write_dynamic<B: StorageBackend + ?Sized, W: Write>(
        &self,
        dynamic: &DynamicParts,
        backend: &B,
        out: &mut W,
        progress: &mut dyn Progress,
    ) -> Result<u64> {
        let total_sectors = self.total_sectors();
        let layout = &dynamic.layout;
        // Block size comes from the file; copy through a bounded buffer.
        let mut buf = vec![0u8; COPY_CHUNK];
        let mut allocated = 0u64;

        // Entries past the end of the virtual disk are never consulted.
        for index in 0..layout.blocks_for(total_sectors) {
            let len = layout.sectors_in_block(index, total_sectors) * SECTOR_SIZE as u64;
            match dynamic.bat.block_offset(index as usize) {
                None => write_zeroes(out, &mut buf, len)?,
                Some(block_start) => {
                    if block_start < dynamic.data_region_start {
                        return Err(DiskError::Format("vhd block overlaps metadata"));
                    }
                    let data_start = block_start
                        .checked_add(layout.bitmap_bytes())
                        .ok_or(DiskError::OffsetOverflow)?;
                    let mut done = 0u64;
                    while done < len {
                        let chunk = (len - done).min(COPY_CHUNK as u64) as usize;
                        let offset = data_start
                            .checked_add(done)
                            .ok_or(DiskError::OffsetOverflow)?;
                        let got = read_padded(backend, offset, &mut buf[..chunk])?;
                        if got < chunk {
                            trace!(block = index, got, chunk, "vhd block short read, zero-padded");
                        }
                        out.write_all(&buf[..chunk])?;
                        done += chunk as u64;
                    }
                    allocated += 1;
                }
            }
            progress.advance(len);
        }
        Ok(allocated)
    }
}

fn write_zeroes<W: Write>(out: &mut W, buf: &mut [u8], mut len: u64) -> Result<()> {
    buf.fill(0);
    while len > 0 {
        let chunk = len.min(buf.len() as u64) as usize;
        out.write_all(&buf[..chunk])?;
        len -= chunk as u64;
    }
    Ok(())
}

fn open_dynamic<B: StorageBackend + ?Sized>(
    backend: &B,
    footer: &VhdFooter,
    len: u64,
    options: &DecodeOptions,
) -> Result<DynamicParts> {
    if footer.data_offset == u64::MAX {
        return Err(DiskError::Format("vhd dynamic header offset invalid"));
    }
    if footer.data_offset % SECTOR_SIZE as u64 != 0 {
        return Err(DiskError::Format("vhd dynamic header offset misaligned"));
    }
    if footer.data_offset < VHD_FOOTER_SIZE as u64 {
        return Err(DiskError::Format("vhd dynamic header overlaps footer copy"));
    }
    let footer_offset = len - VHD_FOOTER_SIZE as u64;
    let header_end = footer
        .data_offset
        .checked_add(VHD_DYNAMIC_HEADER_SIZE as u64)
        .ok_or(DiskError::OffsetOverflow)?;
    if header_end > footer_offset {
        return Err(DiskError::Format("vhd dynamic header truncated"));
    }

    let mut raw_header = [0u8; VHD_DYNAMIC_HEADER_SIZE];
    backend.read_at(footer.data_offset, &mut raw_header)?;
    let header = VhdDynamicHeader::parse(&raw_header)?;
    check_checksum(
        VhdDynamicHeader::checksum_valid(&raw_header),
        options,
        "vhd dynamic header checksum mismatch",
    )?;

    let layout = BlockLayout::new(header.block_size)?;
    let total_sectors = footer.current_size / SECTOR_SIZE as u64;
    let required_entries = layout.blocks_for(total_sectors);
    if u64::from(header.max_table_entries) < required_entries {
        return Err(DiskError::Format("vhd bat too small"));
    }

    let bat_size_on_disk =
        BlockAllocationTable::size_on_disk(u64::from(header.max_table_entries))?;
    if header.table_offset < VHD_FOOTER_SIZE as u64 {
        return Err(DiskError::Format("vhd bat overlaps footer copy"));
    }
    let bat_end = header
        .table_offset
        .checked_add(bat_size_on_disk)
        .ok_or(DiskError::OffsetOverflow)?;
    if bat_end > footer_offset {
        return Err(DiskError::Format("vhd bat truncated"));
    }
    if header.table_offset < header_end && footer.data_offset < bat_end {
        return Err(DiskError::Format("vhd bat overlaps dynamic header"));
    }

    // Only the entries covering the virtual size are read.
    let bat_bytes: usize = (required_entries * 4)
        .try_into()
        .map_err(|_| DiskError::Unsupported("vhd bat too large"))?;
    let mut raw_bat = vec![0u8; bat_bytes];
    backend.read_at(header.table_offset, &mut raw_bat)?;
    let bat = BlockAllocationTable::from_be_bytes(&raw_bat);

    let data_region_start = align_up_u64(header_end.max(bat_end), SECTOR_SIZE as u64)?;
    debug!(
        table_offset = header.table_offset,
        max_table_entries = header.max_table_entries,
        block_size = header.block_size,
        allocated_blocks = bat.allocated_count(),
        "parsed dynamic vhd"
    );

    Ok(DynamicParts {
        header,
        layout,
        bat,
        data_region_start,
    })
}

fn check_checksum(valid: bool, options: &DecodeOptions, what: &'static str) -> Result<()> {
    if valid {
        return Ok(());
    }
    if options.verify_checksums {
        return Err(DiskError::Format(what));
    }
    warn!("{what}; continuing because checksum verification is disabled");
    Ok(())
}

/// Expand a fixed or dynamic VHD held in `backend` into a flat image written to `out`.
///
/// Nothing is written unless the metadata parses; a failure during streaming leaves `out`
/// partially written and the caller is expected to discard it.
pub fn decode_vhd<B: StorageBackend + ?Sized, W: Write>(
    backend: &B,
    out: W,
    options: &DecodeOptions,
    progress: &mut dyn Progress,
) -> Result<DecodeSummary> {
    let container = VhdContainer::open(backend, options)?;
    container.write_flat(backend, out, progress)
}
