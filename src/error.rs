//! Errors surfaced by the filesystem core.
//!
//! The NAND layer reports device failures as `anyhow::Error`, which is carried here unchanged in
//! [`YaffsError::Device`]. Everything above the chunk layer speaks [`YaffsError`].

use nix::errno::Errno;
use thiserror::Error;

use crate::block::BlockState;

#[derive(Error, Debug)]
pub enum YaffsError {
    #[error(transparent)]
    Device(#[from] anyhow::Error),

    #[error("uncorrectable ECC error reading chunk {chunk}")]
    EccUnfixed { chunk: u32 },

    #[error("block {block} is bad")]
    BadBlock { block: u32 },

    #[error("could not write chunk data after {attempts} attempts")]
    WriteFailed { attempts: u32 },

    #[error("no space left on flash")]
    OutOfSpace,

    #[error("file would exceed the largest size the tags can address")]
    FileTooBig,

    #[error("checkpoint is stale or corrupt: {0}")]
    StaleCheckpoint(&'static str),

    #[error("object not found")]
    NotFound,

    #[error("an object with that name already exists")]
    Exists,

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("name too long")]
    NameTooLong,

    #[error("invalid name")]
    InvalidName,

    #[error("operation not permitted")]
    NotPermitted,

    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("illegal transition of block {block} from {from:?} to {to:?}")]
    IllegalTransition {
        block: u32,
        from: BlockState,
        to: BlockState,
    },

    #[error("corrupt metadata: {0}")]
    Corrupt(&'static str),
}

impl YaffsError {
    /// The POSIX errno a VFS shim should report for this error
    pub fn to_errno(&self) -> i32 {
        let errno = match self {
            YaffsError::Device(_)
            | YaffsError::EccUnfixed { .. }
            | YaffsError::BadBlock { .. }
            | YaffsError::WriteFailed { .. }
            | YaffsError::StaleCheckpoint(_)
            | YaffsError::IllegalTransition { .. }
            | YaffsError::Corrupt(_) => Errno::EIO,
            YaffsError::OutOfSpace => Errno::ENOSPC,
            YaffsError::FileTooBig => Errno::EFBIG,
            YaffsError::NotFound => Errno::ENOENT,
            YaffsError::Exists => Errno::EEXIST,
            YaffsError::NotDirectory => Errno::ENOTDIR,
            YaffsError::IsDirectory => Errno::EISDIR,
            YaffsError::NotEmpty => Errno::ENOTEMPTY,
            YaffsError::NameTooLong => Errno::ENAMETOOLONG,
            YaffsError::InvalidName | YaffsError::InvalidGeometry(_) => Errno::EINVAL,
            YaffsError::NotPermitted => Errno::EPERM,
        };
        errno as i32
    }
}

pub type Result<T> = std::result::Result<T, YaffsError>;

#[test]
fn test_errno_mapping() {
    assert_eq!(YaffsError::OutOfSpace.to_errno(), Errno::ENOSPC as i32);
    assert_eq!(YaffsError::NotEmpty.to_errno(), Errno::ENOTEMPTY as i32);
    assert_eq!(YaffsError::FileTooBig.to_errno(), Errno::EFBIG as i32);
    assert_eq!(
        YaffsError::from(anyhow::anyhow!("device gone")).to_errno(),
        Errno::EIO as i32
    );
}
