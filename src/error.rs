use std::io;

use thiserror::Error;

/// Filesystem error codes.
#[derive(Debug, Error)]
pub enum FsError {
    /// The inode slot holds no live file or directory.
    #[error("file not found")]
    NotFound,
    /// The sector map has no room left for the requested allocation.
    #[error("out of disk space")]
    OutOfSpace,
    /// The inode bitmap has no free slot.
    #[error("out of inodes")]
    OutOfInodes,
    /// An inode number, name, or size is outside the accepted range.
    #[error("invalid argument")]
    InvalidArgument,
    /// The backing store reported a read or write failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
