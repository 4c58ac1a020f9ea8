use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Already closed")]
    Closed,

    /// Segment-local read past the number of stored messages. Distinct from
    /// `IoError` so callers can tell "no data yet" apart from a broken file.
    #[error("Segment index {index} out of range (segment holds {size} messages)")]
    OutOfRange { index: u64, size: u64 },

    #[error("Corrupt state: {0}")]
    CorruptState(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Partition is not readable")]
    NotReadable,

    #[error("Partition is not writable")]
    NotWritable,

    #[error("Segment full: {0}")]
    SegmentFull(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    pub fn is_out_of_range(&self) -> bool {
        matches!(self, Self::OutOfRange { .. })
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::CorruptState(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
