use thiserror::Error;

pub type Result<T> = std::result::Result<T, DiskError>;

/// Unified error type for disk image conversion.
///
/// Any error aborts the conversion it came from; nothing is retried and a partially written
/// output is never considered valid.
///
/// Note: [`DiskError::Io`] stores a human-readable `String` rather than `std::io::Error`; the
/// CLI attaches path context on top via `anyhow`.
#[derive(Debug, Error)]
pub enum DiskError {
    /// Missing or incorrect magic, unknown disk type, malformed or truncated metadata, checksum
    /// mismatch.
    #[error("invalid disk image format: {0}")]
    Format(&'static str),

    /// Differencing containers, sizes the format cannot address.
    #[error("unsupported disk image feature: {0}")]
    Unsupported(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("out of bounds: offset={offset} len={len} capacity={capacity}")]
    OutOfBounds {
        offset: u64,
        len: usize,
        capacity: u64,
    },

    #[error("integer overflow while computing byte offsets")]
    OffsetOverflow,

    /// Generic I/O failure (unreadable path, short source, failed write).
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for DiskError {
    fn from(err: std::io::Error) -> Self {
        DiskError::Io(err.to_string())
    }
}
