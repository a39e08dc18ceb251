//! Fragment and UID/GID indirection tables.
//!
//! Both tables share the same on-disk shape: a header array of 8-byte
//! absolute block offsets (one per 8-KiB metablock needed to hold
//! `count * recordSize` bytes of table data), read once at open time, and
//! a per-record lookup that locates which metablock holds record `n` and
//! at what offset within it.

use std::cell::RefCell;
use std::io::{Read, Seek, SeekFrom};
use std::rc::Rc;

use discforge_codec::{read_u32_le, read_u64_le};

use super::metablock::MetadataReader;
use super::Result;
use crate::stream::SparseStream;

const METABLOCK_SPAN: u64 = 8192;

#[derive(Debug)]
pub struct IndirectionTable {
    block_offsets: Vec<u64>,
}

impl IndirectionTable {
    pub fn load<S: SparseStream>(
        stream: &mut S,
        header_start: u64,
        record_count: u32,
        record_size: u32,
    ) -> Result<Self> {
        let total_bytes = record_count as u64 * record_size as u64;
        let metablocks = (total_bytes + METABLOCK_SPAN - 1) / METABLOCK_SPAN;
        stream.seek(SeekFrom::Start(header_start))?;
        let mut block_offsets = Vec::with_capacity(metablocks as usize);
        for _ in 0..metablocks {
            let mut buf = [0u8; 8];
            stream.read_exact(&mut buf)?;
            block_offsets.push(read_u64_le(&buf, 0).unwrap());
        }
        Ok(Self { block_offsets })
    }

    pub fn read_record<S: SparseStream>(
        &self,
        stream: Rc<RefCell<S>>,
        n: u32,
        record_size: u32,
    ) -> Result<Vec<u8>> {
        let byte = n as u64 * record_size as u64;
        let block_index = (byte / METABLOCK_SPAN) as usize;
        let offset = (byte % METABLOCK_SPAN) as u16;
        let block_start = self.block_offsets[block_index];
        let mut reader = MetadataReader::new(stream, block_start, offset);
        reader.read_vec(record_size as usize)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FragmentEntry {
    pub start: u64,
    pub size: u32,
}

impl FragmentEntry {
    pub fn compressed(self) -> bool {
        self.size & 0x0100_0000 == 0
    }

    pub fn stored_len(self) -> u32 {
        self.size & 0x00FF_FFFF
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            start: read_u64_le(buf, 0).unwrap(),
            size: read_u32_le(buf, 8).unwrap(),
        }
    }
}

pub fn read_fragment_entry<S: SparseStream>(
    table: &IndirectionTable,
    stream: Rc<RefCell<S>>,
    index: u32,
) -> Result<FragmentEntry> {
    let buf = table.read_record(stream, index, 16)?;
    Ok(FragmentEntry::decode(&buf))
}

pub fn read_id<S: SparseStream>(
    table: &IndirectionTable,
    stream: Rc<RefCell<S>>,
    index: u16,
) -> Result<u32> {
    let buf = table.read_record(stream, index as u32, 4)?;
    Ok(read_u32_le(&buf, 0).unwrap())
}
