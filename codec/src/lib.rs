//! Fixed-width byte codecs shared by every on-disk structure parser in
//! `discforge`. Every binary layout in a partition table, filesystem
//! superblock, or registry cell bottoms out in one of the primitive
//! (de)serializations provided here.
//!
//! Little-endian and big-endian encode/decode are kept as separate trait
//! methods rather than a single parameterized one, since most call sites
//! know their endianness at compile time and shouldn't pay for a runtime
//! branch on every field.

mod numbers;

pub use numbers::*;

/// Byte order a fixed-width field is encoded in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("destination buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },
}

#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("source buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },
}

/// Encode `Self` into `target`, returning the number of bytes written.
pub trait ByteEncode {
    fn encode(&self, endianness: Endianness, target: &mut [u8]) -> Result<usize, EncodeError>;
}

/// Decode `Self` from the front of `input`, returning the value and the
/// number of bytes consumed.
pub trait ByteDecode: Sized {
    fn decode(endianness: Endianness, input: &[u8]) -> Result<(Self, usize), DecodeError>;
}
