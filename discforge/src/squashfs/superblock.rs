use discforge_codec::{read_u16_le, read_u32_le, read_u64_le};

use super::{Result, SquashError};

pub const MAGIC: u32 = 0x7371_7368;
pub const SUPERBLOCK_SIZE: usize = 96;
const COMPRESSION_DEFLATE: u16 = 1;
const REQUIRED_MAJOR: u16 = 4;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u16 {
        const UNCOMPRESSED_INODES    = 0x0001;
        const UNCOMPRESSED_DATA      = 0x0002;
        const CHECK                  = 0x0004;
        const UNCOMPRESSED_FRAGMENTS = 0x0008;
        const NO_FRAGMENTS           = 0x0010;
        const ALWAYS_FRAGMENTS       = 0x0020;
        const DUPLICATES_REMOVED     = 0x0040;
        const EXPORTABLE             = 0x0080;
        const UNCOMPRESSED_XATTRS    = 0x0100;
        const NO_XATTRS              = 0x0200;
        const COMPRESSOR_OPTIONS     = 0x0400;
        const UNCOMPRESSED_IDS       = 0x0800;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Superblock {
    pub inode_count: u32,
    pub modification_time: u32,
    pub block_size: u32,
    pub fragment_count: u32,
    pub compression: u16,
    pub block_log: u16,
    pub flags: Flags,
    pub id_count: u16,
    pub major: u16,
    pub minor: u16,
    pub root_inode: u64,
    pub bytes_used: u64,
    pub id_table_start: u64,
    pub xattr_table_start: u64,
    pub inode_table_start: u64,
    pub directory_table_start: u64,
    pub fragment_table_start: u64,
    pub export_table_start: u64,
}

impl Superblock {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < SUPERBLOCK_SIZE {
            return Err(SquashError::CorruptMetablock(
                "superblock shorter than 96 bytes".into(),
            ));
        }
        let magic = read_u32_le(buf, 0).unwrap();
        if magic != MAGIC {
            return Err(SquashError::BadMagic);
        }

        let major = read_u16_le(buf, 28).unwrap();
        let minor = read_u16_le(buf, 30).unwrap();
        if major != REQUIRED_MAJOR {
            return Err(SquashError::UnsupportedVersion);
        }

        let compression = read_u16_le(buf, 20).unwrap();
        if compression != COMPRESSION_DEFLATE {
            return Err(SquashError::UnsupportedCompression);
        }

        let xattr_table_start = read_u64_le(buf, 72).unwrap();
        if xattr_table_start != u64::MAX {
            return Err(SquashError::XattrsUnsupported);
        }

        Ok(Self {
            inode_count: read_u32_le(buf, 4).unwrap(),
            modification_time: read_u32_le(buf, 8).unwrap(),
            block_size: read_u32_le(buf, 12).unwrap(),
            fragment_count: read_u32_le(buf, 16).unwrap(),
            compression,
            block_log: read_u16_le(buf, 22).unwrap(),
            flags: Flags::from_bits_truncate(read_u16_le(buf, 24).unwrap()),
            id_count: read_u16_le(buf, 26).unwrap(),
            major,
            minor,
            root_inode: read_u64_le(buf, 32).unwrap(),
            bytes_used: read_u64_le(buf, 40).unwrap(),
            id_table_start: read_u64_le(buf, 48).unwrap(),
            xattr_table_start,
            inode_table_start: read_u64_le(buf, 56).unwrap(),
            directory_table_start: read_u64_le(buf, 64).unwrap(),
            fragment_table_start: read_u64_le(buf, 80).unwrap(),
            export_table_start: read_u64_le(buf, 88).unwrap(),
        })
    }

    pub fn has_fragments(&self) -> bool {
        self.fragment_count > 0 && !self.flags.contains(Flags::NO_FRAGMENTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic_superblock() -> Vec<u8> {
        let mut buf = vec![0u8; SUPERBLOCK_SIZE];
        buf[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        buf[20..22].copy_from_slice(&1u16.to_le_bytes()); // DEFLATE
        buf[28..30].copy_from_slice(&4u16.to_le_bytes()); // major
        buf[30..32].copy_from_slice(&0u16.to_le_bytes()); // minor
        buf[72..80].copy_from_slice(&u64::MAX.to_le_bytes()); // no xattrs
        buf[12..16].copy_from_slice(&131072u32.to_le_bytes()); // block size
        buf
    }

    #[test]
    fn decodes_a_minimal_valid_superblock() {
        let sb = Superblock::decode(&synthetic_superblock()).unwrap();
        assert_eq!(sb.block_size, 131072);
        assert_eq!(sb.major, 4);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = synthetic_superblock();
        buf[0] = 0;
        assert!(matches!(Superblock::decode(&buf), Err(SquashError::BadMagic)));
    }

    #[test]
    fn rejects_non_deflate_compression() {
        let mut buf = synthetic_superblock();
        buf[20..22].copy_from_slice(&2u16.to_le_bytes());
        assert!(matches!(
            Superblock::decode(&buf),
            Err(SquashError::UnsupportedCompression)
        ));
    }

    #[test]
    fn rejects_present_xattr_table() {
        let mut buf = synthetic_superblock();
        buf[72..80].copy_from_slice(&0u64.to_le_bytes());
        assert!(matches!(
            Superblock::decode(&buf),
            Err(SquashError::XattrsUnsupported)
        ));
    }
}
