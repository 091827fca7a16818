use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GianError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid length")]
    InvalidLength,

    #[error("wrong length")]
    LengthMismatch,

    #[error("wrong index")]
    IndexMismatch,

    #[error("wrong check sum")]
    ChecksumMismatch,

    #[error("frame truncated")]
    Truncated,

    #[error("cannot fix.{0}")]
    Unrecoverable(PathBuf),

    #[error("operation on a closed log")]
    Dead,

    #[error("backup file missing, refusing to rename: {0}")]
    MissingBackup(PathBuf),
}

pub type Result<T> = std::result::Result<T, GianError>;
