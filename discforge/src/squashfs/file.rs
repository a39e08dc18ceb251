//! Regular-file content assembly: block iteration and fragment-tail
//! arithmetic.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io::{Read, Seek, SeekFrom};
use std::rc::Rc;

use super::inode::FileBody;
use super::table::{read_fragment_entry, IndirectionTable};
use super::{Result, SquashError};
use crate::stream::SparseStream;

const DATA_CACHE_CAPACITY: usize = 20;
const LENGTH_MASK: u32 = 0x00FF_FFFF;
const UNCOMPRESSED_BIT: u32 = 0x0100_0000;

fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    miniz_oxide::inflate::decompress_to_vec_zlib(data)
        .map_err(|e| SquashError::Decompress(format!("{e:?}")))
}

struct DataBlockCache {
    blocks: HashMap<usize, Rc<Vec<u8>>>,
    lru: VecDeque<usize>,
}

impl DataBlockCache {
    fn new() -> Self {
        Self {
            blocks: HashMap::new(),
            lru: VecDeque::new(),
        }
    }

    fn get(&mut self, i: usize) -> Option<Rc<Vec<u8>>> {
        if self.blocks.contains_key(&i) {
            if let Some(pos) = self.lru.iter().position(|&x| x == i) {
                self.lru.remove(pos);
            }
            self.lru.push_back(i);
            self.blocks.get(&i).cloned()
        } else {
            None
        }
    }

    fn insert(&mut self, i: usize, data: Rc<Vec<u8>>) {
        if !self.blocks.contains_key(&i) && self.blocks.len() >= DATA_CACHE_CAPACITY {
            if let Some(victim) = self.lru.pop_front() {
                self.blocks.remove(&victim);
            }
        }
        self.blocks.insert(i, data);
        self.lru.push_back(i);
    }
}

/// Assembles a regular file's content out of its full-size data blocks
/// plus (for files smaller than an exact multiple of the block size) a
/// tail fragment shared with other small files.
pub struct FileContentBuffer<S: SparseStream> {
    stream: Rc<RefCell<S>>,
    block_size: u32,
    body: FileBody,
    fragment_table: Option<Rc<IndirectionTable>>,
    cache: DataBlockCache,
    start_of_fragment: u64,
}

impl<S: SparseStream> FileContentBuffer<S> {
    pub fn new(
        stream: Rc<RefCell<S>>,
        block_size: u32,
        body: FileBody,
        fragment_table: Option<Rc<IndirectionTable>>,
    ) -> Self {
        let block_count = if body.has_fragment() {
            body.file_size / block_size as u64
        } else {
            (body.file_size + block_size as u64 - 1) / block_size as u64
        };
        let start_of_fragment = block_count * block_size as u64;
        Self {
            stream,
            block_size,
            body,
            fragment_table,
            cache: DataBlockCache::new(),
            start_of_fragment,
        }
    }

    pub fn len(&self) -> u64 {
        self.body.file_size
    }

    fn block_disk_start(&self, index: usize) -> u64 {
        let mut offset = self.body.blocks_start;
        for length in &self.body.block_lengths[..index] {
            offset += (length & LENGTH_MASK) as u64;
        }
        offset
    }

    fn read_block(&mut self, index: usize) -> Result<Rc<Vec<u8>>> {
        if let Some(cached) = self.cache.get(index) {
            return Ok(cached);
        }
        let raw_len = self.body.block_lengths[index];
        let stored_len = raw_len & LENGTH_MASK;
        let compressed = raw_len & UNCOMPRESSED_BIT == 0;
        let disk_start = self.block_disk_start(index);

        let mut stream = self.stream.borrow_mut();
        stream.seek(SeekFrom::Start(disk_start))?;
        let mut raw = vec![0u8; stored_len as usize];
        stream.read_exact(&mut raw)?;
        drop(stream);

        let data = if stored_len == 0 {
            vec![0u8; self.block_size as usize]
        } else if compressed {
            decompress(&raw)?
        } else {
            raw
        };
        let data = Rc::new(data);
        self.cache.insert(index, Rc::clone(&data));
        Ok(data)
    }

    fn read_fragment(&mut self) -> Result<Rc<Vec<u8>>> {
        let table = self
            .fragment_table
            .as_ref()
            .expect("fragment index set without a fragment table");
        let entry = read_fragment_entry(table, Rc::clone(&self.stream), self.body.fragment_index)?;

        let mut stream = self.stream.borrow_mut();
        stream.seek(SeekFrom::Start(entry.start))?;
        let mut raw = vec![0u8; entry.stored_len() as usize];
        stream.read_exact(&mut raw)?;
        drop(stream);

        let data = if entry.compressed() {
            decompress(&raw)?
        } else {
            raw
        };
        Ok(Rc::new(data))
    }

    /// Read up to `buf.len()` bytes starting at `pos`. Returns the number
    /// of bytes actually copied (0 at or past end of file).
    pub fn read(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        if pos >= self.body.file_size {
            return Ok(0);
        }
        let want = buf.len().min((self.body.file_size - pos) as usize);
        let mut filled = 0;

        while filled < want {
            let current = pos + filled as u64;
            if current < self.start_of_fragment {
                let block_index = (current / self.block_size as u64) as usize;
                let block_offset = (current % self.block_size as u64) as usize;
                let data = self.read_block(block_index)?;
                let avail = data.len() - block_offset;
                let n = avail.min(want - filled);
                buf[filled..filled + n].copy_from_slice(&data[block_offset..block_offset + n]);
                filled += n;
            } else {
                let data = self.read_fragment()?;
                let frag_offset =
                    (self.body.fragment_offset as u64 + (current - self.start_of_fragment)) as usize;
                if frag_offset >= data.len() {
                    break;
                }
                let avail = data.len() - frag_offset;
                let n = avail.min(want - filled);
                buf[filled..filled + n].copy_from_slice(&data[frag_offset..frag_offset + n]);
                filled += n;
            }
        }
        Ok(filled)
    }
}
