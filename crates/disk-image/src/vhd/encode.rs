use std::io::Write;
use std::num::NonZeroUsize;

use tracing::{debug, trace};

use super::{
    BlockAllocationTable, BlockLayout, Creator, DiskType, VhdDynamicHeader, VhdFooter,
    DEFAULT_BLOCK_SIZE, VHD_DYNAMIC_HEADER_SIZE, VHD_FOOTER_SIZE,
};
use crate::util::is_all_zero;
use crate::{DiskError, Phase, Progress, Result, SectorSource, SECTOR_SIZE};

// Blocks handed to each scan worker per round; progress is reported between rounds.
const SCAN_BLOCKS_PER_WORKER: u64 = 16;

/// Parameters for a new dynamic VHD.
#[derive(Clone, Debug)]
pub struct DynamicVhdConfig {
    /// Power of two, multiple of 512. Defaults to 2 MiB.
    pub block_size_bytes: u32,
    /// Worker threads for the block scan. `1` scans on the calling thread.
    pub scan_threads: NonZeroUsize,
    pub creator: Creator,
}

impl Default for DynamicVhdConfig {
    fn default() -> Self {
        Self {
            block_size_bytes: DEFAULT_BLOCK_SIZE,
            scan_threads: NonZeroUsize::MIN,
            creator: Creator::default(),
        }
    }
}

impl DynamicVhdConfig {
    pub fn validate(&self) -> Result<BlockLayout> {
        if self.block_size_bytes == 0 {
            return Err(DiskError::InvalidConfig("block size must be non-zero"));
        }
        if (self.block_size_bytes as u64) % SECTOR_SIZE as u64 != 0 {
            return Err(DiskError::InvalidConfig(
                "block size must be a multiple of 512 bytes",
            ));
        }
        if !self.block_size_bytes.is_power_of_two() {
            return Err(DiskError::InvalidConfig("block size must be a power of two"));
        }
        BlockLayout::new(self.block_size_bytes)
    }
}

/// What [`encode_dynamic_vhd`] produced.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EncodeSummary {
    pub total_sectors: u64,
    pub total_blocks: u64,
    pub allocated_blocks: u64,
    pub bytes_written: u64,
}

/// Decide which blocks hold data: `true` at index `i` iff some sector of block `i` is
/// non-zero. Sectors past the end of the disk count as zero.
///
/// With more than one thread the block range is split across scoped workers; results come
/// back in block order regardless.
pub fn scan_allocated_blocks<S: SectorSource + Sync + ?Sized>(
    source: &S,
    layout: &BlockLayout,
    threads: NonZeroUsize,
    progress: &mut dyn Progress,
) -> Result<Vec<bool>> {
    let total_sectors = source.total_sectors();
    let total_blocks = layout.blocks_for(total_sectors);
    let block_bytes = layout.block_size as usize;
    let threads = threads.get() as u64;

    progress.begin(Phase::Scan, source.capacity_bytes());
    let mut allocated = Vec::with_capacity(total_blocks as usize);

    if threads == 1 {
        let mut buf = vec![0u8; block_bytes];
        for index in 0..total_blocks {
            allocated.push(block_has_data(source, layout, index, &mut buf)?);
            progress.advance(layout.sectors_in_block(index, total_sectors) * SECTOR_SIZE as u64);
        }
    } else {
        let per_round = threads * SCAN_BLOCKS_PER_WORKER;
        let mut round_start = 0u64;
        while round_start < total_blocks {
            let round_end = (round_start + per_round).min(total_blocks);
            let chunk = (round_end - round_start).div_ceil(threads);

            let results: Vec<Result<Vec<bool>>> = std::thread::scope(|scope| {
                let workers: Vec<_> = (round_start..round_end)
                    .step_by(chunk as usize)
                    .map(|start| {
                        let end = (start + chunk).min(round_end);
                        scope.spawn(move || {
                            let mut buf = vec![0u8; block_bytes];
                            (start..end)
                                .map(|index| block_has_data(source, layout, index, &mut buf))
                                .collect::<Result<Vec<bool>>>()
                        })
                    })
                    .collect();
                workers
                    .into_iter()
                    .map(|w| {
                        w.join()
                            .unwrap_or_else(|_| Err(DiskError::Io("scan worker panicked".into())))
                    })
                    .collect()
            });
            for part in results {
                allocated.extend(part?);
            }

            let bytes: u64 = (round_start..round_end)
                .map(|index| layout.sectors_in_block(index, total_sectors) * SECTOR_SIZE as u64)
                .sum();
            progress.advance(bytes);
            round_start = round_end;
        }
    }

    progress.finish();
    Ok(allocated)
}

fn block_has_data<S: SectorSource + ?Sized>(
    source: &S,
    layout: &BlockLayout,
    index: u64,
    buf: &mut [u8],
) -> Result<bool> {
    let len = read_block(source, layout, index, buf)?;
    Ok(!is_all_zero(&buf[..len]))
}

/// Read the in-disk part of block `index` into the front of `buf` and zero the rest.
/// Returns the number of bytes that came from the source.
fn read_block<S: SectorSource + ?Sized>(
    source: &S,
    layout: &BlockLayout,
    index: u64,
    buf: &mut [u8],
) -> Result<usize> {
    let first_lba = index
        .checked_mul(layout.sectors_per_block)
        .ok_or(DiskError::OffsetOverflow)?;
    let sectors = layout.sectors_in_block(index, source.total_sectors());
    let len = (sectors as usize) * SECTOR_SIZE;
    if len > 0 {
        source.read_sectors(first_lba, &mut buf[..len])?;
    }
    buf[len..].fill(0);
    Ok(len)
}

/// Encode `source` as a dynamic VHD into `out`.
///
/// The scan phase may run in parallel; the write phase is strictly sequential because BAT
/// offsets follow write order. Allocated blocks are read from the source a second time while
/// writing rather than held in memory.
pub fn encode_dynamic_vhd<S: SectorSource + Sync + ?Sized, W: Write>(
    source: &S,
    mut out: W,
    config: &DynamicVhdConfig,
    progress: &mut dyn Progress,
) -> Result<EncodeSummary> {
    let layout = config.validate()?;
    let total_sectors = source.total_sectors();
    let disk_size = source.capacity_bytes();
    let total_blocks = layout.blocks_for(total_sectors);
    let max_table_entries: u32 = total_blocks
        .try_into()
        .map_err(|_| DiskError::Unsupported("vhd bat too large"))?;

    debug!(
        total_sectors,
        total_blocks,
        block_size = layout.block_size,
        threads = config.scan_threads.get(),
        "scanning source"
    );
    let allocated = scan_allocated_blocks(source, &layout, config.scan_threads, progress)?;

    // Layout: footer copy, dynamic header, BAT, data blocks, footer.
    let header_offset = VHD_FOOTER_SIZE as u64;
    let table_offset = header_offset + VHD_DYNAMIC_HEADER_SIZE as u64;
    let bat_bytes = BlockAllocationTable::size_on_disk(total_blocks)?;
    let first_block_offset = table_offset + bat_bytes;

    let mut bat = BlockAllocationTable::unallocated(total_blocks as usize);
    let mut next_offset = first_block_offset;
    for (index, _) in allocated.iter().enumerate().filter(|&(_, &a)| a) {
        bat.assign(index, next_offset)?;
        next_offset = next_offset
            .checked_add(layout.block_on_disk_bytes())
            .ok_or(DiskError::OffsetOverflow)?;
    }
    let allocated_blocks = bat.allocated_count() as u64;
    let expected_len = next_offset + VHD_FOOTER_SIZE as u64;
    debug!(
        allocated_blocks,
        total_blocks,
        output_bytes = expected_len,
        "laid out dynamic vhd"
    );

    let footer =
        VhdFooter::new(DiskType::Dynamic, disk_size, header_offset, config.creator).to_bytes();
    let header = VhdDynamicHeader::new(table_offset, max_table_entries, layout.block_size);

    let mut written = 0u64;
    let mut emit = |out: &mut W, bytes: &[u8]| -> Result<()> {
        out.write_all(bytes)?;
        written += bytes.len() as u64;
        Ok(())
    };

    emit(&mut out, &footer)?;
    emit(&mut out, &header.to_bytes())?;
    emit(&mut out, &bat.to_be_bytes_padded()?)?;

    // The per-sector bitmap is not tracked: every allocated block is marked fully present.
    let bitmap = vec![0xFFu8; layout.bitmap_bytes() as usize];
    let mut block = vec![0u8; layout.block_size as usize];
    progress.begin(Phase::Write, disk_size);
    for (index, &has_data) in allocated.iter().enumerate() {
        let index = index as u64;
        if has_data {
            trace!(block = index, "writing block");
            read_block(source, &layout, index, &mut block)?;
            emit(&mut out, &bitmap)?;
            emit(&mut out, &block)?;
        }
        progress.advance(layout.sectors_in_block(index, total_sectors) * SECTOR_SIZE as u64);
    }
    emit(&mut out, &footer)?;
    out.flush()?;
    progress.finish();

    debug_assert_eq!(written, expected_len);
    Ok(EncodeSummary {
        total_sectors,
        total_blocks,
        allocated_blocks,
        bytes_written: written,
    })
}
