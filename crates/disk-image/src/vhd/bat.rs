use crate::util::{align_up_u64, be_u32};
use crate::{DiskError, Result, SECTOR_SIZE};

/// BAT entry value for a block with no storage.
pub const BAT_UNALLOCATED: u32 = u32::MAX;

/// 2 MiB, the block size every mainstream VHD tool uses.
pub const DEFAULT_BLOCK_SIZE: u32 = 2 * 1024 * 1024;

// Hard caps to avoid absurd allocations from untrusted images.
const MAX_BAT_BYTES: u64 = 128 * 1024 * 1024; // 128 MiB
const MAX_BITMAP_BYTES: u64 = 32 * 1024 * 1024; // 32 MiB

/// Sizes derived from the dynamic disk block size.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BlockLayout {
    pub block_size: u32,
    pub sectors_per_block: u64,
    pub bitmap_sectors: u64,
}

impl BlockLayout {
    /// Layout for an on-disk block size. Accepts anything sector-aligned, which is what
    /// readers must tolerate; [`crate::DynamicVhdConfig`] is stricter for new images.
    pub fn new(block_size: u32) -> Result<Self> {
        if block_size == 0 || (block_size as u64) % SECTOR_SIZE as u64 != 0 {
            return Err(DiskError::Format("vhd block_size invalid"));
        }
        let sectors_per_block = block_size as u64 / SECTOR_SIZE as u64;
        let bitmap_bytes = sectors_per_block.div_ceil(8);
        let bitmap_sectors = bitmap_bytes.div_ceil(SECTOR_SIZE as u64);
        if bitmap_sectors * SECTOR_SIZE as u64 > MAX_BITMAP_BYTES {
            return Err(DiskError::Unsupported("vhd bitmap too large"));
        }
        Ok(Self {
            block_size,
            sectors_per_block,
            bitmap_sectors,
        })
    }

    pub fn bitmap_bytes(&self) -> u64 {
        self.bitmap_sectors * SECTOR_SIZE as u64
    }

    /// Bitmap plus data: the stride between consecutive allocated blocks.
    pub fn block_on_disk_bytes(&self) -> u64 {
        (self.bitmap_sectors + self.sectors_per_block) * SECTOR_SIZE as u64
    }

    /// Number of blocks needed to cover `total_sectors`.
    pub fn blocks_for(&self, total_sectors: u64) -> u64 {
        total_sectors.div_ceil(self.sectors_per_block)
    }

    /// Sectors of block `index` that fall inside a disk of `total_sectors`.
    pub fn sectors_in_block(&self, index: u64, total_sectors: u64) -> u64 {
        let first_lba = index.saturating_mul(self.sectors_per_block);
        total_sectors
            .saturating_sub(first_lba)
            .min(self.sectors_per_block)
    }
}

/// Block allocation table: one big-endian `u32` per block, either [`BAT_UNALLOCATED`] or the
/// block's file offset in sectors.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BlockAllocationTable {
    entries: Vec<u32>,
}

impl BlockAllocationTable {
    pub fn unallocated(entries: usize) -> Self {
        Self {
            entries: vec![BAT_UNALLOCATED; entries],
        }
    }

    pub fn from_be_bytes(raw: &[u8]) -> Self {
        Self {
            entries: raw.chunks_exact(4).map(be_u32).collect(),
        }
    }

    /// Bytes the table occupies on disk, padded to a sector boundary.
    pub fn size_on_disk(entries: u64) -> Result<u64> {
        let bytes = entries.checked_mul(4).ok_or(DiskError::OffsetOverflow)?;
        let padded = align_up_u64(bytes, SECTOR_SIZE as u64)?;
        if padded > MAX_BAT_BYTES {
            return Err(DiskError::Unsupported("vhd bat too large"));
        }
        Ok(padded)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[u32] {
        &self.entries
    }

    /// File offset in bytes of block `index`, or `None` when unallocated.
    pub fn block_offset(&self, index: usize) -> Option<u64> {
        match self.entries.get(index) {
            Some(&BAT_UNALLOCATED) | None => None,
            Some(&sector) => Some(u64::from(sector) * SECTOR_SIZE as u64),
        }
    }

    /// Point block `index` at `byte_offset`, which must be sector-aligned and addressable by a
    /// 32-bit sector number.
    pub fn assign(&mut self, index: usize, byte_offset: u64) -> Result<()> {
        if byte_offset % SECTOR_SIZE as u64 != 0 {
            return Err(DiskError::Format("vhd block offset misaligned"));
        }
        let sector: u32 = (byte_offset / SECTOR_SIZE as u64)
            .try_into()
            .ok()
            .filter(|&s| s != BAT_UNALLOCATED)
            .ok_or(DiskError::Unsupported("vhd block offset exceeds 32-bit sector range"))?;
        let slot = self
            .entries
            .get_mut(index)
            .ok_or(DiskError::Format("vhd block index out of range"))?;
        *slot = sector;
        Ok(())
    }

    pub fn allocated_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|&&e| e != BAT_UNALLOCATED)
            .count()
    }

    /// Serialize, zero-padded to [`BlockAllocationTable::size_on_disk`].
    pub fn to_be_bytes_padded(&self) -> Result<Vec<u8>> {
        let padded = Self::size_on_disk(self.entries.len() as u64)?;
        let mut out = Vec::with_capacity(padded as usize);
        for entry in &self.entries {
            out.extend_from_slice(&entry.to_be_bytes());
        }
        out.resize(padded as usize, 0);
        Ok(out)
    }
}
