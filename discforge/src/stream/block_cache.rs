//! `BlockCacheStream`: a fixed-size LRU block cache wrapped around any
//! `SparseStream`.
//!
//! Reads and writes smaller than `large_read_size` go through
//! block-granularity caching; anything at or above that threshold bypasses
//! the cache entirely and is satisfied directly against the inner stream,
//! since caching a read that large would only evict everything useful
//! already held. There is no background prefetch — a miss fetches exactly
//! the blocks the current request touches and nothing more.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::ops::Range;

use smart_default::SmartDefault;

use super::SparseStream;

#[derive(Debug, Clone, Copy, SmartDefault)]
pub struct BlockCacheSettings {
    #[default(4096)]
    pub block_size: u32,
    #[default(64)]
    pub read_cache_size: usize,
    #[default(64 * 1024)]
    pub optimum_read_size: u32,
    #[default(1024 * 1024)]
    pub large_read_size: u32,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BlockCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub unaligned_reads: u64,
    pub bypassed_reads: u64,
}

#[derive(Debug)]
struct Block {
    id: u64,
    data: Vec<u8>,
    /// Bytes within `data` actually backed by the stream (the final block
    /// of a stream whose length isn't block-aligned is short).
    available: usize,
}

#[derive(Debug, Default)]
struct BlockCache {
    capacity: usize,
    blocks: HashMap<u64, Block>,
    lru: VecDeque<u64>,
}

impl BlockCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            blocks: HashMap::new(),
            lru: VecDeque::new(),
        }
    }

    fn touch(&mut self, id: u64) {
        if let Some(pos) = self.lru.iter().position(|&x| x == id) {
            self.lru.remove(pos);
        }
        self.lru.push_back(id);
    }

    fn get(&mut self, id: u64) -> Option<&Block> {
        if self.blocks.contains_key(&id) {
            self.touch(id);
            self.blocks.get(&id)
        } else {
            None
        }
    }

    fn insert(&mut self, block: Block) {
        let id = block.id;
        if !self.blocks.contains_key(&id) && self.blocks.len() >= self.capacity {
            if let Some(victim) = self.lru.pop_front() {
                self.blocks.remove(&victim);
            }
        }
        self.blocks.insert(id, block);
        self.touch(id);
    }

    fn invalidate_range(&mut self, ids: Range<u64>) {
        for id in ids {
            self.blocks.remove(&id);
            if let Some(pos) = self.lru.iter().position(|&x| x == id) {
                self.lru.remove(pos);
            }
        }
    }

    fn contains(&self, id: u64) -> bool {
        self.blocks.contains_key(&id)
    }
}

/// A block-granularity read/write cache over an inner `SparseStream`.
///
/// Cursor position is tracked independently of the inner stream's own
/// cursor, since satisfying a cached read means seeking the inner stream
/// to whichever block boundary is missing, not wherever the caller's
/// logical position happens to be.
#[derive(Debug)]
pub struct BlockCacheStream<S: SparseStream> {
    inner: S,
    settings: BlockCacheSettings,
    cache: BlockCache,
    position: u64,
    hit_eof: bool,
    stats: BlockCacheStats,
}

impl<S: SparseStream> BlockCacheStream<S> {
    pub fn new(inner: S, settings: BlockCacheSettings) -> Self {
        let cache = BlockCache::new(settings.read_cache_size);
        Self {
            inner,
            settings,
            cache,
            position: 0,
            hit_eof: false,
            stats: BlockCacheStats::default(),
        }
    }

    pub fn stats(&self) -> BlockCacheStats {
        self.stats
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn block_size(&self) -> u64 {
        self.settings.block_size as u64
    }

    fn block_id(&self, position: u64) -> u64 {
        position / self.block_size()
    }

    fn fetch_block(&mut self, id: u64) -> io::Result<()> {
        if self.cache.contains(id) {
            self.stats.hits += 1;
            return Ok(());
        }
        self.stats.misses += 1;
        let block_size = self.block_size();
        let start = id * block_size;
        let len = self.inner.len();
        if start >= len {
            self.cache.insert(Block {
                id,
                data: vec![0; block_size as usize],
                available: 0,
            });
            return Ok(());
        }
        let mut data = vec![0u8; block_size as usize];
        self.inner.seek(SeekFrom::Start(start))?;
        let mut filled = 0usize;
        while filled < data.len() {
            let n = self.inner.read(&mut data[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        self.cache.insert(Block {
            id,
            data,
            available: filled,
        });
        Ok(())
    }

    fn cached_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let block_size = self.block_size();
        let id = self.block_id(self.position);
        let offset_in_block = (self.position % block_size) as usize;
        if offset_in_block != 0 || buf.len() < block_size as usize {
            self.stats.unaligned_reads += 1;
        }
        self.fetch_block(id)?;
        let block = self.cache.get(id).expect("just fetched");
        if offset_in_block >= block.available {
            return Ok(0);
        }
        let can_read = block.available - offset_in_block;
        let n = can_read.min(buf.len());
        buf[..n].copy_from_slice(&block.data[offset_in_block..offset_in_block + n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl<S: SparseStream> Read for BlockCacheStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.position >= self.inner.len() {
            if self.hit_eof {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "read past end of stream after prior EOF",
                ));
            }
            self.hit_eof = true;
            return Ok(0);
        }
        if buf.len() as u32 >= self.settings.large_read_size {
            self.stats.bypassed_reads += 1;
            self.inner.seek(SeekFrom::Start(self.position))?;
            let n = self.inner.read(buf)?;
            self.position += n as u64;
            return Ok(n);
        }
        let n = self.cached_read(buf)?;
        if n == 0 && !buf.is_empty() {
            self.hit_eof = true;
        }
        Ok(n)
    }
}

impl<S: SparseStream> Write for BlockCacheStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let block_size = self.block_size();
        let first = self.position / block_size;
        let last = (self.position + buf.len() as u64).saturating_sub(1) / block_size;
        self.cache.invalidate_range(first..last + 1);
        self.inner.seek(SeekFrom::Start(self.position))?;
        let n = self.inner.write(buf)?;
        self.position += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<S: SparseStream> Seek for BlockCacheStream<S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::End(delta) => self.inner.len() as i64 + delta,
            SeekFrom::Current(delta) => self.position as i64 + delta,
        };
        if new_pos < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to negative position",
            ));
        }
        self.position = new_pos as u64;
        self.hit_eof = false;
        Ok(self.position)
    }
}

impl<S: SparseStream> SparseStream for BlockCacheStream<S> {
    fn len(&self) -> u64 {
        self.inner.len()
    }

    fn set_len(&mut self, new_len: u64) -> io::Result<()> {
        self.inner.set_len(new_len)?;
        self.cache = BlockCache::new(self.settings.read_cache_size);
        Ok(())
    }

    fn extents(&self) -> Vec<Range<u64>> {
        self.inner.extents()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryStream;

    fn cache_with(data: Vec<u8>, block_size: u32) -> BlockCacheStream<MemoryStream> {
        let settings = BlockCacheSettings {
            block_size,
            read_cache_size: 4,
            ..Default::default()
        };
        BlockCacheStream::new(MemoryStream::from_vec(data), settings)
    }

    #[test]
    fn repeated_reads_of_same_block_are_cache_hits() {
        let mut s = cache_with((0u8..=255).collect(), 16);
        let mut buf = [0u8; 4];
        s.read_exact(&mut buf).unwrap();
        s.seek(SeekFrom::Start(0)).unwrap();
        s.read_exact(&mut buf).unwrap();
        assert_eq!(s.stats().hits, 1);
        assert_eq!(s.stats().misses, 1);
    }

    #[test]
    fn write_invalidates_overlapping_blocks() {
        let mut s = cache_with(vec![0u8; 64], 16);
        let mut buf = [0u8; 16];
        s.read_exact(&mut buf).unwrap();
        s.seek(SeekFrom::Start(0)).unwrap();
        s.write_all(&[9u8; 16]).unwrap();
        s.seek(SeekFrom::Start(0)).unwrap();
        s.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [9u8; 16]);
    }

    #[test]
    fn eof_is_sticky_until_seek() {
        let mut s = cache_with(vec![1, 2, 3], 16);
        s.seek(SeekFrom::Start(3)).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(s.read(&mut buf).unwrap(), 0);
        assert!(s.read(&mut buf).is_err());
        s.seek(SeekFrom::Start(3)).unwrap();
        assert_eq!(s.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn large_reads_bypass_the_cache() {
        let settings = BlockCacheSettings {
            block_size: 16,
            read_cache_size: 4,
            large_read_size: 32,
            ..Default::default()
        };
        let mut s = BlockCacheStream::new(MemoryStream::from_vec(vec![7u8; 64]), settings);
        let mut buf = vec![0u8; 40];
        s.read_exact(&mut buf).unwrap();
        assert_eq!(s.stats().bypassed_reads, 1);
        assert_eq!(s.stats().misses, 0);
    }
}
