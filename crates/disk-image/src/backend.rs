use std::fs::File;
use std::path::{Path, PathBuf};

use crate::util::checked_range;
use crate::{DiskError, Result};

/// Read-only, byte-addressed storage underneath a disk image.
///
/// Every access names its offset explicitly. Reads take `&self` so several scan workers can
/// share one backend without a shared cursor. Converters emit their output through
/// [`std::io::Write`], never through a backend.
pub trait StorageBackend {
    fn len(&self) -> Result<u64>;

    /// Fill `buf` from `offset`. Fails with [`DiskError::OutOfBounds`] when the range extends
    /// past [`StorageBackend::len`].
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

/// Read as much of `buf` as the backend holds starting at `offset`, zero-filling the rest.
///
/// Returns the number of bytes that came from the backend.
pub fn read_padded<B: StorageBackend + ?Sized>(
    backend: &B,
    offset: u64,
    buf: &mut [u8],
) -> Result<usize> {
    let len = backend.len()?;
    let available = len.saturating_sub(offset).min(buf.len() as u64) as usize;
    if available > 0 {
        backend.read_at(offset, &mut buf[..available])?;
    }
    buf[available..].fill(0);
    Ok(available)
}

/// In-memory backend, used for tests and for small images.
#[derive(Debug, Default, Clone)]
pub struct MemBackend {
    data: Vec<u8>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl StorageBackend for MemBackend {
    fn len(&self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.data.len() as u64)?;
        let start = offset as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }
}

/// `std::fs::File` backend using positioned reads.
#[derive(Debug)]
pub struct FileBackend {
    file: File,
    path: PathBuf,
}

impl FileBackend {
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| DiskError::Io(format!("open {}: {e}", path.display())))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    fn io_err(&self, op: &str, err: std::io::Error) -> DiskError {
        DiskError::Io(format!("{op} {}: {err}", self.path.display()))
    }
}

impl StorageBackend for FileBackend {
    fn len(&self) -> Result<u64> {
        self.file
            .metadata()
            .map(|m| m.len())
            .map_err(|e| self.io_err("stat", e))
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.len()?)?;
        read_exact_at(&self.file, offset, buf).map_err(|e| self.io_err("read", e))
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut offset: u64, mut buf: &mut [u8]) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset)? {
            0 => return Err(std::io::ErrorKind::UnexpectedEof.into()),
            n => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}
