//! Block I/O layer: the `SparseStream` capability and its concrete
//! backends.
//!
//! A single interface for sparse random I/O (`length`, `read`, `write`,
//! `extents`) that concrete backends implement directly — no virtual
//! dispatch chain. `std::io::{Read, Write, Seek}` already gives the
//! cursor-based half of that contract for free, so `SparseStream` is
//! exactly those three plus the two things they don't express: a
//! queryable length and the set of byte ranges actually backed by storage.

pub mod block_cache;
mod file;
mod memory;
mod sub;

pub use block_cache::{BlockCacheSettings, BlockCacheStats, BlockCacheStream};
pub use file::FileStream;
pub use memory::MemoryStream;
pub use sub::SubStream;

use std::io::{Read, Seek, Write};
use std::ops::Range;

/// A seekable, possibly sparse, byte-addressable stream.
///
/// Implementors provide the cursor-based `Read`/`Write`/`Seek` operations
/// a caller expects from any stream, plus `len()` (the logical size) and
/// `extents()` (the byte ranges actually backed by storage — for a plain
/// file or in-memory buffer this is simply `[0..len())`; a stream that
/// tracks holes can report a tighter set).
pub trait SparseStream: Read + Write + Seek + std::fmt::Debug {
    /// Logical length of the stream, in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grow or truncate the stream to exactly `new_len` bytes.
    fn set_len(&mut self, new_len: u64) -> std::io::Result<()>;

    /// Byte ranges that are backed by real storage (as opposed to an
    /// implicit zero-filled hole). Streams that do not track holes report
    /// a single range spanning the whole stream.
    fn extents(&self) -> Vec<Range<u64>>;
}
