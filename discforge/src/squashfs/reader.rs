//! Top-level SquashFs filesystem: owns the backing stream and the table
//! set needed to resolve an inode, list a directory, or assemble a
//! file's content.

use std::cell::RefCell;
use std::io::{Read, Seek, SeekFrom};
use std::rc::Rc;

use super::directory::{self, Entry};
use super::file::FileContentBuffer;
use super::inode::{Body, Inode};
use super::metablock::MetadataReader;
use super::superblock::{Superblock, SUPERBLOCK_SIZE};
use super::table::IndirectionTable;
use super::{MetadataRef, Result, SquashError};
use crate::stream::SparseStream;

pub struct SquashFs<S: SparseStream> {
    stream: Rc<RefCell<S>>,
    superblock: Superblock,
    id_table: IndirectionTable,
    fragment_table: Option<Rc<IndirectionTable>>,
}

impl<S: SparseStream> SquashFs<S> {
    pub fn open(stream: Rc<RefCell<S>>) -> Result<Self> {
        let mut sector = [0u8; SUPERBLOCK_SIZE];
        {
            let mut guard = stream.borrow_mut();
            guard.seek(SeekFrom::Start(0))?;
            guard.read_exact(&mut sector)?;
        }
        let superblock = Superblock::decode(&sector)?;
        log::debug!(
            "squashfs: opened image, block_size={}, inode_count={}, root={:#x}",
            superblock.block_size,
            superblock.inode_count,
            superblock.root_inode
        );

        let id_table = {
            let mut guard = stream.borrow_mut();
            IndirectionTable::load(
                &mut *guard,
                superblock.id_table_start,
                superblock.id_count as u32,
                4,
            )?
        };

        let fragment_table = if superblock.has_fragments() {
            let mut guard = stream.borrow_mut();
            Some(Rc::new(IndirectionTable::load(
                &mut *guard,
                superblock.fragment_table_start,
                superblock.fragment_count,
                16,
            )?))
        } else {
            None
        };

        Ok(Self {
            stream,
            superblock,
            id_table,
            fragment_table,
        })
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub fn uid(&self, key: u16) -> Result<u32> {
        super::table::read_id(&self.id_table, Rc::clone(&self.stream), key)
    }

    pub fn root_ref(&self) -> MetadataRef {
        MetadataRef::from_u64(self.superblock.root_inode)
    }

    pub fn read_inode(&self, at: MetadataRef) -> Result<Inode> {
        let mut reader = MetadataReader::new(
            Rc::clone(&self.stream),
            self.superblock.inode_table_start + at.block,
            at.offset,
        );
        Inode::decode(&mut reader, self.superblock.block_size)
    }

    pub fn read_directory(&self, inode: &Inode) -> Result<Vec<Entry>> {
        let body = match &inode.body {
            Body::Directory(body) => body,
            _ => {
                return Err(SquashError::CorruptMetablock(
                    "read_directory called on a non-directory inode".into(),
                ))
            }
        };
        if body.file_size < 3 {
            return Ok(Vec::new());
        }
        let mut reader = MetadataReader::new(
            Rc::clone(&self.stream),
            self.superblock.directory_table_start + body.block_index as u64,
            body.block_offset,
        );
        directory::read_entries(&mut reader, body.file_size as u64 - 3)
    }

    pub fn open_file(&self, inode: &Inode) -> Result<FileContentBuffer<S>> {
        let body = match &inode.body {
            Body::File(body) => body.clone(),
            _ => {
                return Err(SquashError::CorruptMetablock(
                    "open_file called on a non-regular-file inode".into(),
                ))
            }
        };
        Ok(FileContentBuffer::new(
            Rc::clone(&self.stream),
            self.superblock.block_size,
            body,
            self.fragment_table.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::squashfs::inode::InodeKind;
    use crate::squashfs::superblock::MAGIC;
    use crate::stream::MemoryStream;

    fn build_metablock(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let len = payload.len() as u16;
        out.extend_from_slice(&(len | 0x8000).to_le_bytes()); // stored uncompressed
        out.extend_from_slice(payload);
        out
    }

    /// Builds a minimal single-file SquashFS-shaped image entirely by
    /// hand, writing each section in disk order so every offset used by
    /// a later section is already known: data block, id table, inode
    /// table (file inode then root directory inode), directory table.
    fn build_image(content: &[u8]) -> Vec<u8> {
        let block_size: u32 = 4096;
        let mut image = vec![0u8; SUPERBLOCK_SIZE];

        let data_block_start = image.len() as u64;
        image.extend_from_slice(content);

        let id_record_block_start = image.len() as u64;
        image.extend_from_slice(&build_metablock(&0u32.to_le_bytes()));
        let id_table_start = image.len() as u64;
        image.extend_from_slice(&id_record_block_start.to_le_bytes());

        let inode_table_start = image.len() as u64;

        // File inode (relative block 0 within the inode table): tag=2,
        // mode, uid_key, gid_key, mtime, inode#, then the basic-file
        // body (blocks_start, frag_index=NONE, frag_offset=0, file_size,
        // one block_lengths entry covering the whole (sub-block-size)
        // file, stored uncompressed).
        let mut file_inode = Vec::new();
        file_inode.extend_from_slice(&2u16.to_le_bytes());
        file_inode.extend_from_slice(&0o100644u16.to_le_bytes());
        file_inode.extend_from_slice(&0u16.to_le_bytes());
        file_inode.extend_from_slice(&0u16.to_le_bytes());
        file_inode.extend_from_slice(&0u32.to_le_bytes());
        file_inode.extend_from_slice(&2u32.to_le_bytes());
        file_inode.extend_from_slice(&(data_block_start as u32).to_le_bytes());
        file_inode.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        file_inode.extend_from_slice(&0u32.to_le_bytes());
        file_inode.extend_from_slice(&(content.len() as u32).to_le_bytes());
        let raw_len = (content.len() as u32) | 0x0100_0000;
        file_inode.extend_from_slice(&raw_len.to_le_bytes());
        let file_metablock = build_metablock(&file_inode);
        image.extend_from_slice(&file_metablock);

        // Root directory inode sits in the next metablock of the inode
        // table, so its relative block offset is the first metablock's
        // length.
        let root_inode_block = file_metablock.len() as u64;

        let directory_table_start_placeholder = 0u64; // filled in after dir table is built
        let _ = directory_table_start_placeholder;

        // Directory table entry: one header (stored_count=0 => 1 entry)
        // pointing at the file inode (relative block 0, offset 0).
        let mut dir_data = Vec::new();
        dir_data.extend_from_slice(&0u32.to_le_bytes());
        dir_data.extend_from_slice(&0u32.to_le_bytes());
        dir_data.extend_from_slice(&2u32.to_le_bytes());
        dir_data.extend_from_slice(&0u16.to_le_bytes());
        dir_data.extend_from_slice(&0u16.to_le_bytes());
        dir_data.extend_from_slice(&2u16.to_le_bytes());
        dir_data.extend_from_slice(&4u16.to_le_bytes());
        dir_data.extend_from_slice(b"a.bin");

        let mut root_inode = Vec::new();
        root_inode.extend_from_slice(&1u16.to_le_bytes());
        root_inode.extend_from_slice(&0o040755u16.to_le_bytes());
        root_inode.extend_from_slice(&0u16.to_le_bytes());
        root_inode.extend_from_slice(&0u16.to_le_bytes());
        root_inode.extend_from_slice(&0u32.to_le_bytes());
        root_inode.extend_from_slice(&1u32.to_le_bytes());
        root_inode.extend_from_slice(&0u32.to_le_bytes()); // block_index into dir table
        root_inode.extend_from_slice(&1u32.to_le_bytes()); // link_count
        root_inode.extend_from_slice(&((dir_data.len() + 3) as u16).to_le_bytes());
        root_inode.extend_from_slice(&0u16.to_le_bytes()); // block_offset
        root_inode.extend_from_slice(&1u32.to_le_bytes()); // parent_inode
        image.extend_from_slice(&build_metablock(&root_inode));

        let directory_table_start = image.len() as u64;
        image.extend_from_slice(&build_metablock(&dir_data));

        let root_inode_ref = MetadataRef {
            block: root_inode_block,
            offset: 0,
        }
        .to_u64();

        image[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        image[12..16].copy_from_slice(&block_size.to_le_bytes());
        image[20..22].copy_from_slice(&1u16.to_le_bytes()); // DEFLATE
        image[26..28].copy_from_slice(&1u16.to_le_bytes()); // id_count
        image[28..30].copy_from_slice(&4u16.to_le_bytes()); // major
        image[32..40].copy_from_slice(&root_inode_ref.to_le_bytes());
        image[48..56].copy_from_slice(&id_table_start.to_le_bytes());
        image[56..64].copy_from_slice(&inode_table_start.to_le_bytes());
        image[64..72].copy_from_slice(&directory_table_start.to_le_bytes());
        image[72..80].copy_from_slice(&u64::MAX.to_le_bytes()); // no xattrs

        image
    }

    #[test]
    fn reads_root_directory_and_file_content() {
        let content = b"hello from squashfs";
        let image = build_image(content);
        let stream = Rc::new(RefCell::new(MemoryStream::from_vec(image)));
        let fs = SquashFs::open(stream).unwrap();

        let root = fs.read_inode(fs.root_ref()).unwrap();
        assert_eq!(root.header.kind, InodeKind::Directory);

        let entries = fs.read_directory(&root).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a.bin");

        let file_inode = fs.read_inode(entries[0].inode_ref).unwrap();
        let mut opened = fs.open_file(&file_inode).unwrap();
        let mut out = vec![0u8; content.len()];
        let n = opened.read(0, &mut out).unwrap();
        assert_eq!(n, content.len());
        assert_eq!(&out, content);
    }

    #[test]
    fn open_rejects_bad_magic() {
        let stream = Rc::new(RefCell::new(MemoryStream::from_vec(vec![0u8; 96])));
        assert!(SquashFs::open(stream).is_err());
    }
}
