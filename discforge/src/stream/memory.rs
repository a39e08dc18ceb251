use std::io::{self, Read, Seek, SeekFrom, Write};
use std::ops::Range;

use super::SparseStream;

/// A `Vec<u8>`-backed stream used by tests and by callers building an
/// image purely in memory. Every byte is considered stored — there is no
/// hole tracking — so `extents()` always reports the whole length.
#[derive(Debug, Default, Clone)]
pub struct MemoryStream {
    data: Vec<u8>,
    position: u64,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data, position: 0 }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl Read for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let pos = self.position as usize;
        if pos >= self.data.len() {
            return Ok(0);
        }
        let available = &self.data[pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl Write for MemoryStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let pos = self.position as usize;
        if pos + buf.len() > self.data.len() {
            self.data.resize(pos + buf.len(), 0);
        }
        self.data[pos..pos + buf.len()].copy_from_slice(buf);
        self.position += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::End(delta) => self.data.len() as i64 + delta,
            SeekFrom::Current(delta) => self.position as i64 + delta,
        };
        if new_pos < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to negative position",
            ));
        }
        self.position = new_pos as u64;
        Ok(self.position)
    }
}

impl SparseStream for MemoryStream {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn set_len(&mut self, new_len: u64) -> io::Result<()> {
        self.data.resize(new_len as usize, 0);
        if self.position > new_len {
            self.position = new_len;
        }
        Ok(())
    }

    fn extents(&self) -> Vec<Range<u64>> {
        if self.data.is_empty() {
            Vec::new()
        } else {
            vec![0..self.data.len() as u64]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let mut s = MemoryStream::new();
        s.write_all(b"hello world").unwrap();
        s.seek(SeekFrom::Start(0)).unwrap();
        let mut buf = [0u8; 5];
        s.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn read_past_end_returns_zero() {
        let mut s = MemoryStream::from_vec(vec![1, 2, 3]);
        s.seek(SeekFrom::Start(3)).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(s.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn set_len_grows_with_zero_fill() {
        let mut s = MemoryStream::from_vec(vec![1, 2, 3]);
        s.set_len(5).unwrap();
        assert_eq!(s.as_slice(), &[1, 2, 3, 0, 0]);
    }

    #[test]
    fn extents_span_whole_buffer() {
        let s = MemoryStream::from_vec(vec![0; 10]);
        assert_eq!(s.extents(), vec![0..10]);
    }
}
