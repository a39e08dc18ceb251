use crate::{ByteDecode, ByteEncode, DecodeError, Endianness, EncodeError};

macro_rules! impl_primitive {
    ($($t:ty),*) => {
        $(
            impl ByteEncode for $t {
                fn encode(&self, endianness: Endianness, target: &mut [u8]) -> Result<usize, EncodeError> {
                    const SIZE: usize = core::mem::size_of::<$t>();
                    if target.len() < SIZE {
                        return Err(EncodeError::BufferTooSmall { need: SIZE, have: target.len() });
                    }
                    let bytes = match endianness {
                        Endianness::Little => self.to_le_bytes(),
                        Endianness::Big => self.to_be_bytes(),
                    };
                    target[..SIZE].copy_from_slice(&bytes);
                    Ok(SIZE)
                }
            }

            impl ByteDecode for $t {
                fn decode(endianness: Endianness, input: &[u8]) -> Result<(Self, usize), DecodeError> {
                    const SIZE: usize = core::mem::size_of::<$t>();
                    if input.len() < SIZE {
                        return Err(DecodeError::BufferTooSmall { need: SIZE, have: input.len() });
                    }
                    let mut bytes = [0u8; SIZE];
                    bytes.copy_from_slice(&input[..SIZE]);
                    let value = match endianness {
                        Endianness::Little => <$t>::from_le_bytes(bytes),
                        Endianness::Big => <$t>::from_be_bytes(bytes),
                    };
                    Ok((value, SIZE))
                }
            }
        )*
    };
}

impl_primitive!(u8, u16, u32, u64, u128, i8, i16, i32, i64, i128);

impl<const N: usize> ByteEncode for [u8; N] {
    fn encode(&self, _endianness: Endianness, target: &mut [u8]) -> Result<usize, EncodeError> {
        if target.len() < N {
            return Err(EncodeError::BufferTooSmall { need: N, have: target.len() });
        }
        target[..N].copy_from_slice(self);
        Ok(N)
    }
}

impl<const N: usize> ByteDecode for [u8; N] {
    fn decode(_endianness: Endianness, input: &[u8]) -> Result<(Self, usize), DecodeError> {
        if input.len() < N {
            return Err(DecodeError::BufferTooSmall { need: N, have: input.len() });
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&input[..N]);
        Ok((out, N))
    }
}

/// Reads a little-endian integer directly; a convenience used pervasively
/// by the partition and filesystem parsers, which are little-endian end to
/// end except for GPT partition names and registry hashed lists.
pub fn read_u16_le(buf: &[u8], offset: usize) -> Option<u16> {
    buf.get(offset..offset + 2).map(|s| u16::from_le_bytes(s.try_into().unwrap()))
}

pub fn read_u32_le(buf: &[u8], offset: usize) -> Option<u32> {
    buf.get(offset..offset + 4).map(|s| u32::from_le_bytes(s.try_into().unwrap()))
}

pub fn read_u64_le(buf: &[u8], offset: usize) -> Option<u64> {
    buf.get(offset..offset + 8).map(|s| u64::from_le_bytes(s.try_into().unwrap()))
}

pub fn read_i32_le(buf: &[u8], offset: usize) -> Option<i32> {
    buf.get(offset..offset + 4).map(|s| i32::from_le_bytes(s.try_into().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_le_and_be() {
        let mut buf = [0u8; 4];
        let n = 0x0102_0304u32;
        n.encode(Endianness::Little, &mut buf).unwrap();
        assert_eq!(buf, [0x04, 0x03, 0x02, 0x01]);
        let (decoded, consumed) = u32::decode(Endianness::Little, &buf).unwrap();
        assert_eq!(decoded, n);
        assert_eq!(consumed, 4);

        n.encode(Endianness::Big, &mut buf).unwrap();
        assert_eq!(buf, [0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn rejects_short_buffers() {
        let buf = [0u8; 2];
        assert!(u32::decode(Endianness::Little, &buf).is_err());
    }
}
