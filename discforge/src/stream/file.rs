use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::ops::Range;

use super::SparseStream;

/// A `SparseStream` backed by a real `std::fs::File`.
///
/// Hole-tracking is not attempted — reporting actual sparse extents would
/// require platform-specific `lseek(SEEK_HOLE)`/`SEEK_DATA` calls, so
/// `extents()` reports the file as a single stored range.
#[derive(Debug)]
pub struct FileStream {
    file: File,
}

impl FileStream {
    pub fn new(file: File) -> Self {
        Self { file }
    }

    pub fn open(path: impl AsRef<std::path::Path>) -> io::Result<Self> {
        Ok(Self::new(File::open(path)?))
    }

    pub fn create(path: impl AsRef<std::path::Path>) -> io::Result<Self> {
        Ok(Self::new(
            File::options()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?,
        ))
    }
}

impl Read for FileStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for FileStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for FileStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl SparseStream for FileStream {
    fn len(&self) -> u64 {
        self.file.metadata().map(|m| m.len()).unwrap_or(0)
    }

    fn set_len(&mut self, new_len: u64) -> io::Result<()> {
        self.file.set_len(new_len)
    }

    fn extents(&self) -> Vec<Range<u64>> {
        let len = self.len();
        if len == 0 {
            Vec::new()
        } else {
            vec![0..len]
        }
    }
}
