//! SPRS: a minimal sector-list sparse format.
//!
//! ```text
//! [4]  magic "SPRS"
//! [4]  total sectors      (u32 LE)
//! [4]  entry count        (u32 LE)
//! entry count x { [4] lba (u32 LE), [512] sector data }   ascending lba
//! ```
//!
//! Only non-zero sectors are stored. There is no checksum and no allocation table.

use std::io::Write;

use tracing::debug;

use crate::util::is_all_zero;
use crate::{DiskError, Phase, Progress, Result, SectorSource, StorageBackend, SECTOR_SIZE};

pub const SPRS_MAGIC: [u8; 4] = *b"SPRS";
pub const SPRS_HEADER_SIZE: usize = 12;
pub const SPRS_ENTRY_SIZE: usize = 4 + SECTOR_SIZE;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SprsHeader {
    pub total_sectors: u32,
    pub entry_count: u32,
}

impl SprsHeader {
    pub fn to_bytes(&self) -> [u8; SPRS_HEADER_SIZE] {
        let mut raw = [0u8; SPRS_HEADER_SIZE];
        raw[0..4].copy_from_slice(&SPRS_MAGIC);
        raw[4..8].copy_from_slice(&self.total_sectors.to_le_bytes());
        raw[8..12].copy_from_slice(&self.entry_count.to_le_bytes());
        raw
    }

    pub fn parse(raw: &[u8; SPRS_HEADER_SIZE]) -> Result<Self> {
        if raw[0..4] != SPRS_MAGIC {
            return Err(DiskError::Format("sprs magic mismatch"));
        }
        Ok(Self {
            total_sectors: le_u32(&raw[4..8]),
            entry_count: le_u32(&raw[8..12]),
        })
    }

    /// File size implied by the header.
    pub fn file_len(&self) -> u64 {
        SPRS_HEADER_SIZE as u64 + u64::from(self.entry_count) * SPRS_ENTRY_SIZE as u64
    }

    pub fn read<B: StorageBackend + ?Sized>(backend: &B) -> Result<Self> {
        if backend.len()? < SPRS_HEADER_SIZE as u64 {
            return Err(DiskError::Format("sprs header truncated"));
        }
        let mut raw = [0u8; SPRS_HEADER_SIZE];
        backend.read_at(0, &mut raw)?;
        Self::parse(&raw)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SprsSummary {
    pub total_sectors: u64,
    pub stored_sectors: u64,
    pub bytes_written: u64,
}

/// Write every non-zero sector of `source` as an SPRS stream.
///
/// Two passes: the first collects the non-zero LBAs (the header needs their count), the
/// second re-reads and writes them.
pub fn encode_sprs<S: SectorSource + ?Sized, W: Write>(
    source: &S,
    mut out: W,
    progress: &mut dyn Progress,
) -> Result<SprsSummary> {
    let total_sectors = source.total_sectors();
    let total_u32: u32 = total_sectors
        .try_into()
        .map_err(|_| DiskError::Unsupported("sprs total sectors exceed u32"))?;

    progress.begin(Phase::Scan, source.capacity_bytes());
    let mut lbas = Vec::new();
    let mut sector = [0u8; SECTOR_SIZE];
    for lba in 0..total_u32 {
        source.read_sector(u64::from(lba), &mut sector)?;
        if !is_all_zero(&sector) {
            lbas.push(lba);
        }
        progress.advance(SECTOR_SIZE as u64);
    }
    progress.finish();

    let header = SprsHeader {
        total_sectors: total_u32,
        entry_count: lbas.len() as u32,
    };
    debug!(
        total_sectors,
        stored_sectors = lbas.len(),
        "writing sprs image"
    );

    progress.begin(Phase::Write, header.file_len());
    out.write_all(&header.to_bytes())?;
    progress.advance(SPRS_HEADER_SIZE as u64);
    for &lba in &lbas {
        source.read_sector(u64::from(lba), &mut sector)?;
        out.write_all(&lba.to_le_bytes())?;
        out.write_all(&sector)?;
        progress.advance(SPRS_ENTRY_SIZE as u64);
    }
    out.flush()?;
    progress.finish();

    Ok(SprsSummary {
        total_sectors,
        stored_sectors: lbas.len() as u64,
        bytes_written: header.file_len(),
    })
}

/// Expand an SPRS image into a flat stream of `total_sectors * 512` bytes.
pub fn decode_sprs<B: StorageBackend + ?Sized, W: Write>(
    backend: &B,
    mut out: W,
    progress: &mut dyn Progress,
) -> Result<SprsSummary> {
    let header = SprsHeader::read(backend)?;
    if backend.len()? < header.file_len() {
        return Err(DiskError::Format("sprs entries truncated"));
    }

    let total_sectors = u64::from(header.total_sectors);
    let zero = [0u8; SECTOR_SIZE];
    let mut entry = [0u8; SPRS_ENTRY_SIZE];
    let mut next_lba = 0u64;

    progress.begin(Phase::Write, total_sectors * SECTOR_SIZE as u64);
    for i in 0..u64::from(header.entry_count) {
        let offset = SPRS_HEADER_SIZE as u64 + i * SPRS_ENTRY_SIZE as u64;
        backend.read_at(offset, &mut entry)?;
        let lba = u64::from(le_u32(&entry[..4]));
        if lba < next_lba {
            return Err(DiskError::Format("sprs entries out of order"));
        }
        if lba >= total_sectors {
            return Err(DiskError::Format("sprs entry beyond end of disk"));
        }
        for _ in next_lba..lba {
            out.write_all(&zero)?;
        }
        out.write_all(&entry[4..])?;
        progress.advance((lba + 1 - next_lba) * SECTOR_SIZE as u64);
        next_lba = lba + 1;
    }
    for _ in next_lba..total_sectors {
        out.write_all(&zero)?;
    }
    progress.advance((total_sectors - next_lba) * SECTOR_SIZE as u64);
    out.flush()?;
    progress.finish();

    Ok(SprsSummary {
        total_sectors,
        stored_sectors: u64::from(header.entry_count),
        bytes_written: total_sectors * SECTOR_SIZE as u64,
    })
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
