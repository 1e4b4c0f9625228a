//! Error type shared by every operation of the reader.
//!
//! Each variant belongs to one [ErrorKind] so that callers can tell a corrupt
//! image apart from an I/O failure, an allocation failure or a plain
//! "no such file".

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The block device failed to deliver the requested sectors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Corrupt or unsupported on-disk structure
    #[error("invalid squashfs image: {0}")]
    InvalidFormat(String),

    #[error("unknown inode type {0}")]
    UnknownInodeType(u16),

    #[error("inode {0} not found in the inode table")]
    InodeNotFound(u32),

    /// A (block start, offset) pair which does not point at any metadata block
    #[error("invalid metadata reference (block {block}, offset {offset})")]
    InvalidReference { block: u64, offset: u16 },

    #[error("invalid fragment {0}")]
    InvalidFragment(u32),

    #[error("decompression failed: {0}")]
    Decompression(String),

    #[error("failed to allocate {0} bytes")]
    OutOfMemory(usize),

    #[error("output buffer too small: {needed} bytes needed, {available} available")]
    BufferTooSmall { needed: u64, available: usize },

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("no such file or directory: {0}")]
    NotFound(String),

    /// An empty directory was met while more path components remained
    #[error("empty directory: {0}")]
    EmptyDir(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("too many levels of symbolic links: {0}")]
    SymlinkLoop(String),
}

/// Coarse classification of [Error]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Format,
    Io,
    Resource,
    NotFound,
    Unsupported,
    SymlinkLoop,
}

impl Error {
    pub(crate) fn format(detail: impl Into<String>) -> Self {
        Self::InvalidFormat(detail.into())
    }

    pub(crate) fn unsupported(detail: impl Into<String>) -> Self {
        Self::Unsupported(detail.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) => ErrorKind::Io,
            Self::InvalidFormat(_)
            | Self::UnknownInodeType(_)
            | Self::InodeNotFound(_)
            | Self::InvalidReference { .. }
            | Self::InvalidFragment(_)
            | Self::Decompression(_) => ErrorKind::Format,
            Self::OutOfMemory(_) | Self::BufferTooSmall { .. } => ErrorKind::Resource,
            Self::NotADirectory(_) | Self::NotFound(_) | Self::EmptyDir(_) => ErrorKind::NotFound,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::SymlinkLoop(_) => ErrorKind::SymlinkLoop,
        }
    }

    /// POSIX errno matching this error. C-style callers return its negation
    pub fn to_errno(&self) -> i32 {
        match self {
            Self::Io(_) => 5, // EIO
            Self::InvalidFormat(_)
            | Self::UnknownInodeType(_)
            | Self::InodeNotFound(_)
            | Self::InvalidReference { .. }
            | Self::InvalidFragment(_)
            | Self::Decompression(_) => 22, // EINVAL
            Self::OutOfMemory(_) => 12,         // ENOMEM
            Self::BufferTooSmall { .. } => 75,  // EOVERFLOW
            Self::NotADirectory(_) => 20,       // ENOTDIR
            Self::NotFound(_) => 2,             // ENOENT
            Self::EmptyDir(_) => 2,             // ENOENT
            Self::Unsupported(_) => 95,         // EOPNOTSUPP
            Self::SymlinkLoop(_) => 40,         // ELOOP
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::Io(inner) => inner.kind(),
            Error::OutOfMemory(_) => io::ErrorKind::OutOfMemory,
            Error::NotADirectory(_) => io::ErrorKind::NotADirectory,
            Error::NotFound(_) | Error::EmptyDir(_) => io::ErrorKind::NotFound,
            Error::Unsupported(_) => io::ErrorKind::Unsupported,
            Error::BufferTooSmall { .. } => io::ErrorKind::InvalidInput,
            _ => io::ErrorKind::InvalidData,
        };
        match err {
            Error::Io(inner) => inner,
            other => io::Error::new(kind, other),
        }
    }
}
