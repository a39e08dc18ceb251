//! SquashFS reader: superblock, metablock/data-block caches, inode
//! decoding, directory traversal, and regular-file content assembly.
//!
//! Structurally this is a top-level filesystem struct that owns the
//! backing device and a set of typed accessor methods (`read_inode`,
//! `read_dir`, block-group/indirection lookups) rather than one giant
//! parse function. SquashFS's own format — compressed metablocks,
//! fragment indirection — is grounded directly in the format description.

pub mod directory;
pub mod file;
pub mod inode;
pub mod metablock;
pub mod reader;
pub mod superblock;
pub mod table;

pub use inode::{Inode, InodeKind};
pub use reader::SquashFs;
pub use superblock::Superblock;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SquashError {
    #[error("bad magic number")]
    BadMagic,
    #[error("unsupported SquashFS version (only 4.0 is supported)")]
    UnsupportedVersion,
    #[error("unsupported compression algorithm (only DEFLATE is supported)")]
    UnsupportedCompression,
    #[error("extended attribute tables are present; unsupported")]
    XattrsUnsupported,
    #[error("unknown inode type tag {0}")]
    UnknownInodeType(u16),
    #[error("corrupt metablock: {0}")]
    CorruptMetablock(String),
    #[error("decompression failed: {0}")]
    Decompress(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SquashError>;

/// A `{block, offset}` pointer into the compressed metablock stream —
/// `block` is the byte offset of a metablock's 2-byte prelude, `offset` is
/// a byte position within that metablock's decompressed contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetadataRef {
    pub block: u64,
    pub offset: u16,
}

impl MetadataRef {
    pub fn from_u64(raw: u64) -> Self {
        Self {
            block: raw >> 16,
            offset: (raw & 0xFFFF) as u16,
        }
    }

    pub fn to_u64(self) -> u64 {
        (self.block << 16) | self.offset as u64
    }
}
