use tracing::debug;

use crate::backend::read_padded;
use crate::vhd::{DiskType, VhdFooter, VHD_FOOTER_SIZE};
use crate::{DiskError, Result, StorageBackend};

pub const SECTOR_SIZE: usize = 512;

/// Random sector reads over a disk image.
///
/// Implementations use explicit offsets and `&self`, so one source can be scanned from several
/// threads at once.
pub trait SectorSource {
    fn total_sectors(&self) -> u64;

    /// Read sector `lba`. Fails for `lba >= total_sectors()`.
    fn read_sector(&self, lba: u64, buf: &mut [u8; SECTOR_SIZE]) -> Result<()> {
        self.read_sectors(lba, buf)
    }

    /// Read `buf.len() / SECTOR_SIZE` consecutive sectors starting at `lba`.
    ///
    /// `buf` must be a whole number of sectors and the range must lie inside the disk.
    fn read_sectors(&self, lba: u64, buf: &mut [u8]) -> Result<()>;

    fn capacity_bytes(&self) -> u64 {
        self.total_sectors() * SECTOR_SIZE as u64
    }
}

impl<S: SectorSource + ?Sized> SectorSource for &S {
    fn total_sectors(&self) -> u64 {
        (**self).total_sectors()
    }

    fn read_sectors(&self, lba: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_sectors(lba, buf)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SourceKind {
    /// Headerless image, every byte is disk data.
    Flat,
    /// Fixed VHD: disk data followed by a single 512-byte footer.
    FixedVhd,
}

/// A flat image or fixed VHD presented as sectors.
#[derive(Debug)]
pub struct ImageSource<B> {
    backend: B,
    kind: SourceKind,
    total_sectors: u64,
}

impl<B: StorageBackend> ImageSource<B> {
    /// Treat the whole backend as disk data. A trailing partial sector is ignored.
    pub fn flat(backend: B) -> Result<Self> {
        let total_sectors = backend.len()? / SECTOR_SIZE as u64;
        Ok(Self {
            backend,
            kind: SourceKind::Flat,
            total_sectors,
        })
    }

    /// Open a fixed VHD. Fails with [`DiskError::Format`] if the trailing footer is missing or
    /// describes anything other than a fixed disk.
    pub fn fixed_vhd(backend: B) -> Result<Self> {
        let footer = read_trailing_footer(&backend)?
            .ok_or(DiskError::Format("vhd footer cookie mismatch"))?;
        let footer = VhdFooter::parse(&footer)?;
        if footer.disk_type != DiskType::Fixed {
            return Err(DiskError::Format(
                "only flat images and fixed vhd containers can be used as a source",
            ));
        }
        // Sector count comes from the file size, not the footer's current_size.
        let total_sectors = (backend.len()? - VHD_FOOTER_SIZE as u64) / SECTOR_SIZE as u64;
        Ok(Self {
            backend,
            kind: SourceKind::FixedVhd,
            total_sectors,
        })
    }

    /// Fixed VHD if the last sector carries a footer cookie, flat otherwise.
    pub fn open(backend: B) -> Result<Self> {
        let source = if read_trailing_footer(&backend)?.is_some() {
            Self::fixed_vhd(backend)?
        } else {
            Self::flat(backend)?
        };
        debug!(
            kind = ?source.kind,
            total_sectors = source.total_sectors,
            "opened sector source"
        );
        Ok(source)
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }
}

impl<B: StorageBackend> SectorSource for ImageSource<B> {
    fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    fn read_sectors(&self, lba: u64, buf: &mut [u8]) -> Result<()> {
        if buf.len() % SECTOR_SIZE != 0 {
            return Err(DiskError::InvalidConfig(
                "sector read buffer must be a whole number of sectors",
            ));
        }
        let count = (buf.len() / SECTOR_SIZE) as u64;
        let end = lba.checked_add(count).ok_or(DiskError::OffsetOverflow)?;
        if end > self.total_sectors {
            return Err(DiskError::OutOfBounds {
                offset: lba.saturating_mul(SECTOR_SIZE as u64),
                len: buf.len(),
                capacity: self.capacity_bytes(),
            });
        }
        let offset = lba
            .checked_mul(SECTOR_SIZE as u64)
            .ok_or(DiskError::OffsetOverflow)?;
        // Tolerate a backend that shrank underneath us: missing bytes read as zero.
        read_padded(&self.backend, offset, buf)?;
        Ok(())
    }
}

/// The last 512 bytes of `backend` if they start with the footer cookie.
pub(crate) fn read_trailing_footer<B: StorageBackend + ?Sized>(
    backend: &B,
) -> Result<Option<[u8; VHD_FOOTER_SIZE]>> {
    let len = backend.len()?;
    if len < VHD_FOOTER_SIZE as u64 {
        return Ok(None);
    }
    let mut raw = [0u8; VHD_FOOTER_SIZE];
    backend.read_at(len - VHD_FOOTER_SIZE as u64, &mut raw)?;
    Ok(VhdFooter::has_cookie(&raw).then_some(raw))
}
