//! Plugs a `SquashFs` image into the VFS façade. Entry ids are the same
//! packed `(block, offset)` metadata reference the reader already hands
//! out for inode lookups, so no side table is needed to translate
//! between the two.

use std::time::{Duration, SystemTime};

use super::backend::{Attributes, EntryId, EntryKind, VfsBackend};
use crate::error::Result;
use crate::squashfs::inode::{Body, InodeKind};
use crate::squashfs::{MetadataRef, SquashFs};
use crate::stream::SparseStream;

pub struct SquashFsBackend<S: SparseStream> {
    fs: SquashFs<S>,
}

impl<S: SparseStream> SquashFsBackend<S> {
    pub fn new(fs: SquashFs<S>) -> Self {
        Self { fs }
    }
}

fn entry_kind(kind: InodeKind) -> EntryKind {
    match kind {
        InodeKind::Directory | InodeKind::ExtendedDirectory => EntryKind::Directory,
        InodeKind::File | InodeKind::ExtendedFile => EntryKind::Regular,
        InodeKind::Symlink | InodeKind::ExtendedSymlink => EntryKind::Symlink,
        InodeKind::BlockDevice
        | InodeKind::CharacterDevice
        | InodeKind::Fifo
        | InodeKind::Socket => EntryKind::Device,
    }
}

impl<S: SparseStream> VfsBackend for SquashFsBackend<S> {
    fn root(&self) -> EntryId {
        self.fs.root_ref().to_u64()
    }

    fn is_writable(&self) -> bool {
        false
    }

    fn is_case_sensitive(&self) -> bool {
        true
    }

    fn attributes(&self, id: EntryId) -> Result<Attributes> {
        let inode = self.fs.read_inode(MetadataRef::from_u64(id))?;
        let size = match &inode.body {
            Body::File(body) => body.file_size,
            _ => 0,
        };
        Ok(Attributes {
            kind: entry_kind(inode.header.kind),
            size,
            modified: Some(
                SystemTime::UNIX_EPOCH
                    + Duration::from_secs(inode.header.modification_time as u64),
            ),
        })
    }

    fn children(&self, id: EntryId) -> Result<Vec<(String, EntryId)>> {
        let inode = self.fs.read_inode(MetadataRef::from_u64(id))?;
        let entries = self.fs.read_directory(&inode)?;
        Ok(entries
            .into_iter()
            .map(|e| (e.name, e.inode_ref.to_u64()))
            .collect())
    }

    fn symlink_target(&self, id: EntryId) -> Result<Option<String>> {
        let inode = self.fs.read_inode(MetadataRef::from_u64(id))?;
        Ok(match inode.body {
            Body::Symlink(body) => Some(body.target),
            _ => None,
        })
    }

    fn read_at(&self, id: EntryId, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let inode = self.fs.read_inode(MetadataRef::from_u64(id))?;
        let mut content = self.fs.open_file(&inode)?;
        Ok(content.read(pos, buf)?)
    }
}
