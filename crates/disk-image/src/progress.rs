/// Stage of a conversion, reported to [`Progress::begin`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Phase {
    /// Reading the source to find non-empty blocks or sectors.
    Scan,
    /// Emitting the output stream.
    Write,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Phase::Scan => "scanning",
            Phase::Write => "writing",
        }
    }
}

/// Progress observer. All units are bytes of the virtual disk.
///
/// Converters call `begin` once per phase, then `advance` as they go, then `finish`.
pub trait Progress {
    fn begin(&mut self, _phase: Phase, _total_bytes: u64) {}
    fn advance(&mut self, _bytes: u64) {}
    fn finish(&mut self) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl Progress for NoProgress {}
