//! Typed cell encode/decode. A cell's on-disk payload (the bytes after
//! its 4-byte size header) is either untyped raw data (value blobs,
//! value-list arrays) or begins with a 2-byte ASCII tag identifying one
//! of the structural variants below.

use discforge_codec::{read_i32_le, read_u16_le, read_u32_le, read_u64_le};

use super::{HiveError, Result};

/// A cell's stable address: an offset relative to the start of the bin
/// region (file offset minus the 4 KiB header). `0` and `-1` are
/// reserved sentinels meaning "absent".
pub type CellIndex = i32;

pub const NONE: CellIndex = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    None,
    String,
    ExpandString,
    Binary,
    Dword,
    DwordBigEndian,
    Link,
    MultiString,
    QWord,
}

impl ValueType {
    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => Self::String,
            2 => Self::ExpandString,
            3 => Self::Binary,
            4 => Self::Dword,
            5 => Self::DwordBigEndian,
            6 => Self::Link,
            7 => Self::MultiString,
            11 => Self::QWord,
            _ => Self::None,
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            Self::None => 0,
            Self::String => 1,
            Self::ExpandString => 2,
            Self::Binary => 3,
            Self::Dword => 4,
            Self::DwordBigEndian => 5,
            Self::Link => 6,
            Self::MultiString => 7,
            Self::QWord => 11,
        }
    }

    fn is_dword_family(self) -> bool {
        matches!(self, Self::Dword | Self::DwordBigEndian)
    }
}

#[derive(Debug, Clone)]
pub struct KeyNodeCell {
    pub flags: u16,
    pub timestamp: u64,
    pub parent: CellIndex,
    pub sub_keys_index: CellIndex,
    pub num_sub_keys: u32,
    pub value_list_index: CellIndex,
    pub num_values: u32,
    pub security_index: CellIndex,
    pub class_name_index: CellIndex,
    pub class_name_length: u32,
    pub max_name_len: u32,
    pub max_class_len: u32,
    pub max_value_name_len: u32,
    pub max_value_data_len: u32,
    pub name: String,
}

pub const FLAG_ROOT: u16 = 0x0004;
pub const FLAG_SYMLINK: u16 = 0x0010;
pub const FLAG_VOLATILE: u16 = 0x0001;

impl KeyNodeCell {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 62 || &buf[0..2] != b"nk" {
            return Err(HiveError::Corrupt("truncated nk cell".into()));
        }
        let flags = read_u16_le(buf, 2).unwrap();
        let timestamp = read_u64_le(buf, 4).unwrap();
        let parent = read_i32_le(buf, 12).unwrap();
        let sub_keys_index = read_i32_le(buf, 16).unwrap();
        let num_sub_keys = read_u32_le(buf, 20).unwrap();
        let value_list_index = read_i32_le(buf, 24).unwrap();
        let num_values = read_u32_le(buf, 28).unwrap();
        let security_index = read_i32_le(buf, 32).unwrap();
        let class_name_index = read_i32_le(buf, 36).unwrap();
        let class_name_length = read_u32_le(buf, 40).unwrap();
        let max_name_len = read_u32_le(buf, 44).unwrap();
        let max_class_len = read_u32_le(buf, 48).unwrap();
        let max_value_name_len = read_u32_le(buf, 52).unwrap();
        let max_value_data_len = read_u32_le(buf, 56).unwrap();
        let name_len = read_u16_le(buf, 60).unwrap() as usize;
        let name_bytes = buf
            .get(62..62 + name_len)
            .ok_or_else(|| HiveError::Corrupt("nk name runs past cell end".into()))?;
        let name = String::from_utf8_lossy(name_bytes).into_owned();

        Ok(Self {
            flags,
            timestamp,
            parent,
            sub_keys_index,
            num_sub_keys,
            value_list_index,
            num_values,
            security_index,
            class_name_index,
            class_name_length,
            max_name_len,
            max_class_len,
            max_value_name_len,
            max_value_data_len,
            name,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let name_bytes = self.name.as_bytes();
        let mut out = Vec::with_capacity(62 + name_bytes.len());
        out.extend_from_slice(b"nk");
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.parent.to_le_bytes());
        out.extend_from_slice(&self.sub_keys_index.to_le_bytes());
        out.extend_from_slice(&self.num_sub_keys.to_le_bytes());
        out.extend_from_slice(&self.value_list_index.to_le_bytes());
        out.extend_from_slice(&self.num_values.to_le_bytes());
        out.extend_from_slice(&self.security_index.to_le_bytes());
        out.extend_from_slice(&self.class_name_index.to_le_bytes());
        out.extend_from_slice(&self.class_name_length.to_le_bytes());
        out.extend_from_slice(&self.max_name_len.to_le_bytes());
        out.extend_from_slice(&self.max_class_len.to_le_bytes());
        out.extend_from_slice(&self.max_value_name_len.to_le_bytes());
        out.extend_from_slice(&self.max_value_data_len.to_le_bytes());
        out.extend_from_slice(&(name_bytes.len() as u16).to_le_bytes());
        out.extend_from_slice(name_bytes);
        out
    }

    pub fn is_root(&self) -> bool {
        self.flags & FLAG_ROOT != 0
    }
}

/// An already-resolved value: either a short inline payload (dword
/// family, ≤4 bytes) or an index into a separate data cell.
#[derive(Debug, Clone)]
pub struct ValueCell {
    pub name: String,
    pub data_type: ValueType,
    pub data_length: u32,
    pub data_index: CellIndex,
    pub inline: Option<[u8; 4]>,
}

const INLINE_BIT: u32 = 0x8000_0000;

impl ValueCell {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 16 || &buf[0..2] != b"vk" {
            return Err(HiveError::Corrupt("truncated vk cell".into()));
        }
        let name_len = read_u16_le(buf, 2).unwrap() as usize;
        let data_type = ValueType::from_u32(read_u32_le(buf, 4).unwrap());
        let raw_len = read_u32_le(buf, 8).unwrap();
        let data_index = read_i32_le(buf, 12).unwrap();
        let name_bytes = buf
            .get(16..16 + name_len)
            .ok_or_else(|| HiveError::Corrupt("vk name runs past cell end".into()))?;
        let name = String::from_utf8_lossy(name_bytes).into_owned();

        let inline = if raw_len & INLINE_BIT != 0 && data_type.is_dword_family() {
            Some((data_index as u32).to_le_bytes())
        } else {
            None
        };
        let data_length = raw_len & !INLINE_BIT;

        Ok(Self {
            name,
            data_type,
            data_length,
            data_index,
            inline,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let name_bytes = self.name.as_bytes();
        let mut out = Vec::with_capacity(16 + name_bytes.len());
        out.extend_from_slice(b"vk");
        out.extend_from_slice(&(name_bytes.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.data_type.to_u32().to_le_bytes());
        let raw_len = if self.inline.is_some() {
            self.data_length | INLINE_BIT
        } else {
            self.data_length
        };
        out.extend_from_slice(&raw_len.to_le_bytes());
        if let Some(bytes) = self.inline {
            out.extend_from_slice(&read_u32_le(&bytes, 0).unwrap().to_le_bytes());
        } else {
            out.extend_from_slice(&self.data_index.to_le_bytes());
        }
        out.extend_from_slice(name_bytes);
        out
    }

    pub fn new_inline(name: String, data_type: ValueType, bytes: [u8; 4], len: u32) -> Self {
        Self {
            name,
            data_type,
            data_length: len,
            data_index: read_i32_le(&bytes, 0).unwrap(),
            inline: Some(bytes),
        }
    }

    pub fn new_indexed(name: String, data_type: ValueType, data_index: CellIndex, len: u32) -> Self {
        Self {
            name,
            data_type,
            data_length: len,
            data_index,
            inline: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SecurityCell {
    pub prev: CellIndex,
    pub next: CellIndex,
    pub usage_count: u32,
    pub descriptor: Vec<u8>,
}

impl SecurityCell {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 18 || &buf[0..2] != b"sk" {
            return Err(HiveError::Corrupt("truncated sk cell".into()));
        }
        let prev = read_i32_le(buf, 2).unwrap();
        let next = read_i32_le(buf, 6).unwrap();
        let usage_count = read_u32_le(buf, 10).unwrap();
        let len = read_u32_le(buf, 14).unwrap() as usize;
        let descriptor = buf
            .get(18..18 + len)
            .ok_or_else(|| HiveError::Corrupt("sk descriptor runs past cell end".into()))?
            .to_vec();
        Ok(Self {
            prev,
            next,
            usage_count,
            descriptor,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(18 + self.descriptor.len());
        out.extend_from_slice(b"sk");
        out.extend_from_slice(&self.prev.to_le_bytes());
        out.extend_from_slice(&self.next.to_le_bytes());
        out.extend_from_slice(&self.usage_count.to_le_bytes());
        out.extend_from_slice(&(self.descriptor.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.descriptor);
        out
    }
}

/// One entry in a hashed sub-key list: a child `nk` cell index plus a
/// hash of its name for fast candidate filtering.
#[derive(Debug, Clone, Copy)]
pub struct HashedListEntry {
    pub child: CellIndex,
    pub name_hash: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    /// 37-multiplicative rolling hash over the upper-cased name.
    Lh,
    /// First four upper-cased name bytes packed into a u32.
    Lf,
}

#[derive(Debug, Clone)]
pub struct HashedList {
    pub kind: ListKind,
    pub entries: Vec<HashedListEntry>,
}

impl HashedList {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 6 {
            return Err(HiveError::Corrupt("truncated lh/lf cell".into()));
        }
        let kind = match &buf[0..2] {
            b"lh" => ListKind::Lh,
            b"lf" => ListKind::Lf,
            tag => return Err(HiveError::UnknownCellTag(tag.try_into().unwrap())),
        };
        let count = read_u32_le(buf, 2).unwrap() as usize;
        let mut entries = Vec::with_capacity(count);
        let mut pos = 6;
        for _ in 0..count {
            let record = buf
                .get(pos..pos + 8)
                .ok_or_else(|| HiveError::Corrupt("lh/lf entries run past cell end".into()))?;
            entries.push(HashedListEntry {
                child: read_i32_le(record, 0).unwrap(),
                name_hash: read_u32_le(record, 4).unwrap(),
            });
            pos += 8;
        }
        Ok(Self { kind, entries })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6 + self.entries.len() * 8);
        out.extend_from_slice(if self.kind == ListKind::Lh { b"lh" } else { b"lf" });
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for entry in &self.entries {
            out.extend_from_slice(&entry.child.to_le_bytes());
            out.extend_from_slice(&entry.name_hash.to_le_bytes());
        }
        out
    }

    pub fn name_hash(kind: ListKind, name: &str) -> u32 {
        let upper: Vec<u8> = name.bytes().map(|b| b.to_ascii_uppercase()).collect();
        match kind {
            ListKind::Lh => {
                let mut hash: u32 = 0;
                for &b in &upper {
                    hash = hash.wrapping_mul(37).wrapping_add(b as u32);
                }
                hash
            }
            ListKind::Lf => {
                let mut bytes = [0u8; 4];
                for (i, &b) in upper.iter().take(4).enumerate() {
                    bytes[i] = b;
                }
                read_u32_le(&bytes, 0).unwrap()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndirectKind {
    /// Leaf list of `nk` cell indices.
    Li,
    /// Index of sub-lists (each itself an `li`/`lh`/`lf` cell).
    Ri,
}

#[derive(Debug, Clone)]
pub struct IndirectList {
    pub kind: IndirectKind,
    pub entries: Vec<CellIndex>,
}

impl IndirectList {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 6 {
            return Err(HiveError::Corrupt("truncated li/ri cell".into()));
        }
        let kind = match &buf[0..2] {
            b"li" => IndirectKind::Li,
            b"ri" => IndirectKind::Ri,
            tag => return Err(HiveError::UnknownCellTag(tag.try_into().unwrap())),
        };
        let count = read_u32_le(buf, 2).unwrap() as usize;
        let mut entries = Vec::with_capacity(count);
        let mut pos = 6;
        for _ in 0..count {
            let raw = buf
                .get(pos..pos + 4)
                .ok_or_else(|| HiveError::Corrupt("li/ri entries run past cell end".into()))?;
            entries.push(read_i32_le(raw, 0).unwrap());
            pos += 4;
        }
        Ok(Self { kind, entries })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6 + self.entries.len() * 4);
        out.extend_from_slice(if self.kind == IndirectKind::Li { b"li" } else { b"ri" });
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for &e in &self.entries {
            out.extend_from_slice(&e.to_le_bytes());
        }
        out
    }
}

/// Any of the sub-key list shapes a `KeyNodeCell::sub_keys_index` may
/// point at.
#[derive(Debug, Clone)]
pub enum SubKeyList {
    Hashed(HashedList),
    Indirect(IndirectList),
}

impl SubKeyList {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 2 {
            return Err(HiveError::Corrupt("truncated sub-key list cell".into()));
        }
        match &buf[0..2] {
            b"lh" | b"lf" => Ok(Self::Hashed(HashedList::decode(buf)?)),
            b"li" | b"ri" => Ok(Self::Indirect(IndirectList::decode(buf)?)),
            tag => Err(HiveError::UnknownCellTag(tag.try_into().unwrap())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_node_round_trips() {
        let nk = KeyNodeCell {
            flags: FLAG_ROOT,
            timestamp: 0x01D0_0000_0000_0000,
            parent: NONE,
            sub_keys_index: 0x40,
            num_sub_keys: 2,
            value_list_index: NONE,
            num_values: 0,
            security_index: 0x20,
            class_name_index: NONE,
            class_name_length: 0,
            max_name_len: 16,
            max_class_len: 0,
            max_value_name_len: 0,
            max_value_data_len: 0,
            name: "ROOT".into(),
        };
        let encoded = nk.encode();
        let decoded = KeyNodeCell::decode(&encoded).unwrap();
        assert_eq!(decoded.name, "ROOT");
        assert!(decoded.is_root());
        assert_eq!(decoded.num_sub_keys, 2);
    }

    #[test]
    fn inline_dword_value_round_trips() {
        let vk = ValueCell::new_inline("Count".into(), ValueType::Dword, 7u32.to_le_bytes(), 4);
        let encoded = vk.encode();
        let decoded = ValueCell::decode(&encoded).unwrap();
        assert_eq!(decoded.inline, Some(7u32.to_le_bytes()));
        assert_eq!(decoded.data_type, ValueType::Dword);
    }

    #[test]
    fn indexed_binary_value_round_trips() {
        let vk = ValueCell::new_indexed("Blob".into(), ValueType::Binary, 0x200, 64);
        let decoded = ValueCell::decode(&vk.encode()).unwrap();
        assert_eq!(decoded.inline, None);
        assert_eq!(decoded.data_index, 0x200);
        assert_eq!(decoded.data_length, 64);
    }

    #[test]
    fn lf_hash_packs_first_four_upper_bytes() {
        let hash = HashedList::name_hash(ListKind::Lf, "bar");
        let expected = u32::from_le_bytes([b'B', b'A', b'R', 0]);
        assert_eq!(hash, expected);
    }

    #[test]
    fn hashed_list_round_trips() {
        let list = HashedList {
            kind: ListKind::Lf,
            entries: vec![
                HashedListEntry {
                    child: 0x100,
                    name_hash: 1,
                },
                HashedListEntry {
                    child: 0x200,
                    name_hash: 2,
                },
            ],
        };
        let decoded = HashedList::decode(&list.encode()).unwrap();
        assert_eq!(decoded.entries.len(), 2);
        assert_eq!(decoded.entries[1].child, 0x200);
    }
}
