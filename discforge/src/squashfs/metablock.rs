//! Metablock framing and the 20-entry metablock cache.
//!
//! A metablock is a 2-byte length/compressed prelude followed by up to
//! 8 KiB of (optionally DEFLATE-compressed) payload. Tables (inode,
//! directory, fragment, uid/gid) are streams of metablocks; a
//! `MetadataRef` names a byte position within the decompressed
//! concatenation of one table's metablocks.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io::{Read, Seek, SeekFrom};
use std::rc::Rc;

use discforge_codec::{read_u16_le, read_u32_le, read_u64_le};

use super::{Result, SquashError};
use crate::stream::SparseStream;

const CACHE_CAPACITY: usize = 20;
const RAW_BLOCK_SIZE: u16 = 0x8000;

fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    miniz_oxide::inflate::decompress_to_vec_zlib(data)
        .map_err(|e| SquashError::Decompress(format!("{e:?}")))
}

/// Read one metablock at absolute byte offset `pos`. Returns the
/// decompressed payload and the absolute offset of the next metablock.
fn read_one<S: SparseStream>(stream: &mut S, pos: u64) -> Result<(Vec<u8>, u64)> {
    stream.seek(SeekFrom::Start(pos))?;
    let mut prelude = [0u8; 2];
    stream.read_exact(&mut prelude)?;
    let prelude = read_u16_le(&prelude, 0).unwrap();
    let compressed = prelude & 0x8000 == 0;
    let mut length = prelude & 0x7FFF;
    if length == 0 {
        length = RAW_BLOCK_SIZE;
    }

    let mut raw = vec![0u8; length as usize];
    stream.read_exact(&mut raw)?;
    let next = pos + 2 + length as u64;

    let payload = if compressed { decompress(&raw)? } else { raw };
    Ok((payload, next))
}

type CachedBlock = Rc<(Vec<u8>, u64)>;

struct Cache {
    blocks: HashMap<u64, CachedBlock>,
    lru: VecDeque<u64>,
}

impl Cache {
    fn new() -> Self {
        Self {
            blocks: HashMap::new(),
            lru: VecDeque::new(),
        }
    }

    fn touch(&mut self, pos: u64) {
        if let Some(i) = self.lru.iter().position(|&p| p == pos) {
            self.lru.remove(i);
        }
        self.lru.push_back(pos);
    }

    fn get(&mut self, pos: u64) -> Option<CachedBlock> {
        if self.blocks.contains_key(&pos) {
            self.touch(pos);
            self.blocks.get(&pos).cloned()
        } else {
            None
        }
    }

    fn insert(&mut self, pos: u64, data: CachedBlock) {
        if !self.blocks.contains_key(&pos) && self.blocks.len() >= CACHE_CAPACITY {
            if let Some(victim) = self.lru.pop_front() {
                self.blocks.remove(&victim);
            }
        }
        self.blocks.insert(pos, data);
        self.touch(pos);
    }
}

/// Sequential reader over a metablock-framed table, positioned by a
/// `MetadataRef`-style `(block, offset)` pair and able to read across
/// block boundaries transparently.
pub struct MetadataReader<S: SparseStream> {
    stream: Rc<RefCell<S>>,
    cache: Cache,
    block: u64,
    offset: usize,
    total_read: u64,
}

impl<S: SparseStream> MetadataReader<S> {
    pub fn new(stream: Rc<RefCell<S>>, block: u64, offset: u16) -> Self {
        Self {
            stream,
            cache: Cache::new(),
            block,
            offset: offset as usize,
            total_read: 0,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.total_read
    }

    fn current_block(&mut self) -> Result<CachedBlock> {
        if let Some(cached) = self.cache.get(self.block) {
            return Ok(cached);
        }
        let (data, next) = read_one(&mut *self.stream.borrow_mut(), self.block)?;
        let cached = Rc::new((data, next));
        self.cache.insert(self.block, Rc::clone(&cached));
        Ok(cached)
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let cached = self.current_block()?;
            let (data, next) = (&cached.0, cached.1);
            if self.offset >= data.len() {
                self.block = next;
                self.offset = 0;
                continue;
            }
            let available = data.len() - self.offset;
            let want = (buf.len() - filled).min(available);
            buf[filled..filled + want].copy_from_slice(&data[self.offset..self.offset + want]);
            filled += want;
            self.offset += want;
            if self.offset >= data.len() {
                self.block = next;
                self.offset = 0;
            }
        }
        self.total_read += buf.len() as u64;
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read(&mut b)?;
        Ok(b[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let mut b = [0u8; 2];
        self.read(&mut b)?;
        Ok(read_u16_le(&b, 0).unwrap())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read(&mut b)?;
        Ok(read_u32_le(&b, 0).unwrap())
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        self.read(&mut b)?;
        Ok(read_u64_le(&b, 0).unwrap())
    }

    pub fn read_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read(&mut buf)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryStream;

    fn build_metablock(payload: &[u8], compressed: bool) -> Vec<u8> {
        let mut out = Vec::new();
        let stored = if compressed {
            miniz_oxide::deflate::compress_to_vec_zlib(payload, 6)
        } else {
            payload.to_vec()
        };
        let len = stored.len() as u16;
        let prelude = if compressed { len } else { len | 0x8000 };
        out.extend_from_slice(&prelude.to_le_bytes());
        out.extend_from_slice(&stored);
        out
    }

    #[test]
    fn reads_uncompressed_metablock() {
        let payload = b"hello squashfs metadata";
        let disk = build_metablock(payload, false);
        let stream = Rc::new(RefCell::new(MemoryStream::from_vec(disk)));
        let mut reader = MetadataReader::new(stream, 0, 0);
        let got = reader.read_vec(payload.len()).unwrap();
        assert_eq!(got, payload);
    }

    #[test]
    fn reads_compressed_metablock() {
        let payload = vec![42u8; 500];
        let disk = build_metablock(&payload, true);
        let stream = Rc::new(RefCell::new(MemoryStream::from_vec(disk)));
        let mut reader = MetadataReader::new(stream, 0, 0);
        let got = reader.read_vec(payload.len()).unwrap();
        assert_eq!(got, payload);
    }

    #[test]
    fn honors_starting_offset() {
        let payload = b"0123456789";
        let disk = build_metablock(payload, false);
        let stream = Rc::new(RefCell::new(MemoryStream::from_vec(disk)));
        let mut reader = MetadataReader::new(stream, 0, 5);
        let got = reader.read_vec(5).unwrap();
        assert_eq!(&got, b"56789");
    }
}
