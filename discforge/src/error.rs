//! Top-level error taxonomy.
//!
//! Every public operation in `discforge` returns `Result<T, DiscforgeError>`.
//! The variants correspond to the abstract error kinds specified for the
//! system: a parse failure is never conflated with an I/O failure, and a
//! missing path is never conflated with a corrupt structure.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiscforgeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("corrupt: {0}")]
    Corrupt(String),

    #[error("out of bounds: {0}")]
    Bounds(String),

    #[error("too many levels of symbolic links: {0}")]
    SymlinkLoop(String),

    #[error(transparent)]
    Partition(#[from] crate::partition::PartitionError),

    #[error(transparent)]
    Squash(#[from] crate::squashfs::SquashError),

    #[error(transparent)]
    Hive(#[from] crate::registry::HiveError),
}

pub type Result<T> = std::result::Result<T, DiscforgeError>;
