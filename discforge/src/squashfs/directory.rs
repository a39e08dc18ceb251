//! Directory-table traversal.
//!
//! A directory's content is a sequence of headers, each covering one or
//! more entries that share an inode-table metablock
//! (`{storedCount, startBlock, inodeNumberBase}`, where `storedCount + 1`
//! is the number of records that follow), each entry
//! (`{offset, inodeDelta, type, storedNameSize, name}`, where
//! `storedNameSize + 1` is the name's byte length) naming a child whose
//! inode lives at metadata reference `(startBlock, offset)`, relative to
//! the inode table's start exactly like every other `MetadataRef` this
//! reader hands out — the caller (`SquashFs::read_inode`) is the one
//! place that adds `inode_table_start`. "." and ".." are never emitted
//! here — the VFS layer synthesizes them.

use super::metablock::MetadataReader;
use super::{MetadataRef, Result};
use crate::stream::SparseStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
    Symlink,
    BlockDevice,
    CharacterDevice,
    Fifo,
    Socket,
}

impl EntryKind {
    fn from_tag(tag: u16) -> Self {
        match tag {
            2 => Self::File,
            3 => Self::Symlink,
            4 => Self::BlockDevice,
            5 => Self::CharacterDevice,
            6 => Self::Fifo,
            7 => Self::Socket,
            _ => Self::Directory,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub name: String,
    pub kind: EntryKind,
    pub inode_ref: MetadataRef,
}

/// Read every entry in a directory whose metadata occupies `total_len`
/// bytes starting at `reader`'s current position.
pub fn read_entries<S: SparseStream>(
    reader: &mut MetadataReader<S>,
    total_len: u64,
) -> Result<Vec<Entry>> {
    let mut entries = Vec::new();
    let start = reader.bytes_read();
    while reader.bytes_read() - start < total_len {
        let stored_count = reader.read_u32()?;
        let start_block = reader.read_u32()? as u64;
        let inode_number_base = reader.read_u32()?;

        for _ in 0..=stored_count {
            let offset = reader.read_u16()?;
            let inode_delta = reader.read_u16()? as i16;
            let tag = reader.read_u16()?;
            let stored_name_size = reader.read_u16()?;
            let name_bytes = reader.read_vec(stored_name_size as usize + 1)?;
            let name = String::from_utf8_lossy(&name_bytes).into_owned();

            let _inode_number = inode_number_base.wrapping_add(inode_delta as i32 as u32);
            entries.push(Entry {
                name,
                kind: EntryKind::from_tag(tag),
                inode_ref: MetadataRef {
                    block: start_block,
                    offset,
                },
            });
        }
    }
    Ok(entries)
}
