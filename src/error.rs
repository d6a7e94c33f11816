//! Errors reported by the flash filesystem engine

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("no such file: {0}")]
    NotFound(String),

    #[error("name too long ({len} bytes, max {max})")]
    NameTooLong { len: usize, max: usize },

    #[error("invalid name: {0:?}")]
    InvalidName(String),

    #[error("filesystem full")]
    Full,

    #[error("too many open files")]
    TooManyOpenFiles,

    #[error("bad file handle {0}")]
    BadHandle(usize),

    #[error("file not open for reading")]
    NotReadable,

    #[error("file not open for writing")]
    NotWritable,

    #[error("file is open: {0}")]
    Busy(String),

    #[error("block {block} is not formatted (magic 0x{magic:08X})")]
    NotFormatted { block: u32, magic: u32 },

    #[error("bad geometry: {0}")]
    BadGeometry(String),

    #[error("flash access out of bounds: addr 0x{addr:X} len {len} (size {size})")]
    OutOfBounds { addr: u32, len: usize, size: usize },
}

impl FsError {
    /// Device faults mean the engine or its geometry is broken; nothing
    /// further can be trusted after one.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FsError::OutOfBounds { .. })
    }
}

pub type FsResult<T> = std::result::Result<T, FsError>;
