//! Hive file layout: a 4 KiB header region (`regf`) followed by a
//! contiguous sequence of bins starting at byte 0x1000. Cell indices are
//! offsets relative to the start of the bin region.

use std::cell::RefCell;
use std::io::{Read, Seek, SeekFrom, Write};
use std::rc::Rc;

use super::cell::{CellIndex, NONE};
use super::filetime::system_time_to_filetime;
use super::log;
use super::{HiveError, Result};
use crate::stream::SparseStream;
use discforge_codec::{read_i32_le, read_u32_le, read_u64_le};

pub const HEADER_SIZE: u64 = 4096;
pub const BIN_REGION_START: u64 = 4096;
const SIGNATURE: &[u8; 4] = b"regf";
const CHECKSUM_OFFSET: usize = 508;
const MIN_CELL_SIZE: u32 = 8;

#[derive(Debug, Clone, Copy)]
pub struct HiveHeader {
    pub sequence1: u32,
    pub sequence2: u32,
    pub timestamp: u64,
    pub root_cell: CellIndex,
    pub length: u32,
    pub cluster: u32,
}

fn checksum(buf: &[u8]) -> u32 {
    let mut sum = 0u32;
    for chunk in buf[0..CHECKSUM_OFFSET].chunks_exact(4) {
        sum ^= read_u32_le(chunk, 0).unwrap();
    }
    sum
}

impl HiveHeader {
    pub fn decode(buf: &[u8; 4096]) -> Result<Self> {
        if &buf[0..4] != SIGNATURE {
            return Err(HiveError::BadSignature);
        }
        let stored_checksum = read_u32_le(buf, CHECKSUM_OFFSET).unwrap();
        if checksum(buf) != stored_checksum {
            return Err(HiveError::Corrupt("hive header checksum mismatch".into()));
        }
        Ok(Self {
            sequence1: read_u32_le(buf, 4).unwrap(),
            sequence2: read_u32_le(buf, 8).unwrap(),
            timestamp: read_u64_le(buf, 12).unwrap(),
            root_cell: read_i32_le(buf, 36).unwrap(),
            length: read_u32_le(buf, 40).unwrap(),
            cluster: read_u32_le(buf, 44).unwrap(),
        })
    }

    pub fn is_clean(&self) -> bool {
        self.sequence1 == self.sequence2
    }

    pub fn encode(&self) -> [u8; 4096] {
        let mut buf = [0u8; 4096];
        buf[0..4].copy_from_slice(SIGNATURE);
        buf[4..8].copy_from_slice(&self.sequence1.to_le_bytes());
        buf[8..12].copy_from_slice(&self.sequence2.to_le_bytes());
        buf[12..20].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[36..40].copy_from_slice(&self.root_cell.to_le_bytes());
        buf[40..44].copy_from_slice(&self.length.to_le_bytes());
        buf[44..48].copy_from_slice(&self.cluster.to_le_bytes());
        let sum = checksum(&buf);
        buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&sum.to_le_bytes());
        buf
    }
}

#[derive(Debug, Clone, Copy)]
struct BinInfo {
    /// Absolute byte offset of the bin's "hbin" header.
    file_offset: u64,
    size: u32,
}

pub struct Hive<S: SparseStream> {
    stream: Rc<RefCell<S>>,
    header: HiveHeader,
    bins: Vec<BinInfo>,
}

fn round_up_8(n: u32) -> u32 {
    (n + 7) & !7
}

impl<S: SparseStream> Hive<S> {
    pub fn open(stream: Rc<RefCell<S>>) -> Result<Self> {
        Self::open_with_logs::<S>(stream, None, None)
    }

    pub fn open_with_logs<L: SparseStream>(
        stream: Rc<RefCell<S>>,
        log1: Option<Rc<RefCell<L>>>,
        log2: Option<Rc<RefCell<L>>>,
    ) -> Result<Self> {
        let mut header_buf = [0u8; 4096];
        {
            let mut guard = stream.borrow_mut();
            guard.seek(SeekFrom::Start(0))?;
            guard.read_exact(&mut header_buf)?;
        }

        let header = match HiveHeader::decode(&header_buf) {
            Ok(h) if h.is_clean() => h,
            decoded => {
                let recovery = log::recover(decoded.ok(), log1.clone(), log2.clone())?;
                recovery.apply_dirty_pages(&stream)?;
                // The logs are now fully folded into the primary hive;
                // truncating them means a subsequent open won't try to
                // replay the same entries again.
                if let Some(l) = &log1 {
                    l.borrow_mut().set_len(0)?;
                }
                if let Some(l) = &log2 {
                    l.borrow_mut().set_len(0)?;
                }
                recovery.header
            }
        };

        let bins = Self::enumerate_bins(&stream, header.length)?;
        Ok(Self {
            stream,
            header,
            bins,
        })
    }

    /// Creates a brand-new, empty, writable hive: one root `nk` cell in
    /// a single freshly allocated bin.
    pub fn initialize(stream: Rc<RefCell<S>>) -> Result<Self> {
        let header = HiveHeader {
            sequence1: 1,
            sequence2: 1,
            timestamp: system_time_to_filetime(std::time::SystemTime::now()),
            root_cell: NONE,
            length: 0,
            cluster: 1,
        };
        {
            let mut guard = stream.borrow_mut();
            guard.seek(SeekFrom::Start(0))?;
            guard.write_all(&header.encode())?;
        }
        let mut hive = Self {
            stream,
            header,
            bins: Vec::new(),
        };

        let root = super::cell::KeyNodeCell {
            flags: super::cell::FLAG_ROOT,
            timestamp: system_time_to_filetime(std::time::SystemTime::now()),
            parent: NONE,
            sub_keys_index: NONE,
            num_sub_keys: 0,
            value_list_index: NONE,
            num_values: 0,
            security_index: NONE,
            class_name_index: NONE,
            class_name_length: 0,
            max_name_len: 0,
            max_class_len: 0,
            max_value_name_len: 0,
            max_value_data_len: 0,
            name: String::new(),
        };
        let index = hive.allocate(root.encode().len() as u32)?;
        hive.write_cell(index, &root.encode())?;
        hive.header.root_cell = index;
        hive.write_header()?;
        Ok(hive)
    }

    pub fn root(&self) -> CellIndex {
        self.header.root_cell
    }

    pub fn header(&self) -> HiveHeader {
        self.header
    }

    fn enumerate_bins(stream: &Rc<RefCell<S>>, length: u32) -> Result<Vec<BinInfo>> {
        let mut bins = Vec::new();
        let mut pos = BIN_REGION_START;
        let end = BIN_REGION_START + length as u64;
        let mut guard = stream.borrow_mut();
        while pos < end {
            guard.seek(SeekFrom::Start(pos))?;
            let mut hdr = [0u8; 32];
            guard.read_exact(&mut hdr)?;
            if &hdr[0..4] != b"hbin" {
                return Err(HiveError::Corrupt("bin missing hbin signature".into()));
            }
            let bin_size = read_u32_le(&hdr, 8).unwrap();
            if bin_size == 0 {
                return Err(HiveError::Corrupt("zero-size bin".into()));
            }
            bins.push(BinInfo {
                file_offset: pos,
                size: bin_size,
            });
            pos += bin_size as u64;
        }
        Ok(bins)
    }

    fn write_header(&self) -> Result<()> {
        let mut guard = self.stream.borrow_mut();
        guard.seek(SeekFrom::Start(0))?;
        guard.write_all(&self.header.encode())?;
        Ok(())
    }

    fn bump_sequence(&mut self) -> Result<()> {
        self.header.sequence1 = self.header.sequence1.wrapping_add(1);
        self.header.sequence2 = self.header.sequence1;
        self.write_header()
    }

    fn read_at(&self, abs: u64, len: usize) -> Result<Vec<u8>> {
        let mut guard = self.stream.borrow_mut();
        guard.seek(SeekFrom::Start(abs))?;
        let mut buf = vec![0u8; len];
        guard.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write_at(&self, abs: u64, data: &[u8]) -> Result<()> {
        let mut guard = self.stream.borrow_mut();
        guard.seek(SeekFrom::Start(abs))?;
        guard.write_all(data)?;
        Ok(())
    }

    fn cell_abs_offset(index: CellIndex) -> u64 {
        BIN_REGION_START + index as u64
    }

    fn cell_raw_size(&self, index: CellIndex) -> Result<i32> {
        let buf = self.read_at(Self::cell_abs_offset(index), 4)?;
        Ok(read_i32_le(&buf, 0).unwrap())
    }

    /// The payload bytes of an allocated cell (after its 4-byte size
    /// header).
    pub fn cell_bytes(&self, index: CellIndex) -> Result<Vec<u8>> {
        if index == NONE || index == 0 {
            return Err(HiveError::Bounds(format!("absent cell index {index}")));
        }
        let size = self.cell_raw_size(index)?;
        if size >= 0 {
            return Err(HiveError::Corrupt(format!(
                "cell {index} is marked free, cannot read as allocated"
            )));
        }
        let total = (-size) as usize;
        let payload = self.read_at(Self::cell_abs_offset(index) + 4, total - 4)?;
        Ok(payload)
    }

    /// Rewrite an allocated cell's payload in place; the cell must
    /// already be large enough (use `update` when it might not be).
    pub(crate) fn write_cell(&self, index: CellIndex, payload: &[u8]) -> Result<()> {
        let size = self.cell_raw_size(index)?;
        let capacity = (-size) as usize - 4;
        if payload.len() > capacity {
            return Err(HiveError::Bounds(format!(
                "payload of {} bytes does not fit in cell of capacity {}",
                payload.len(),
                capacity
            )));
        }
        self.write_at(Self::cell_abs_offset(index) + 4, payload)
    }

    fn owning_bin(&self, abs_offset: u64) -> Result<BinInfo> {
        self.bins
            .iter()
            .copied()
            .find(|b| abs_offset >= b.file_offset + 32 && abs_offset < b.file_offset + b.size as u64)
            .ok_or_else(|| HiveError::Corrupt("cell offset not covered by any bin".into()))
    }

    /// First-fit allocation: scan every bin's cell chain for a free run
    /// of at least `round_up_8(payload_len + 4)` bytes, splitting a
    /// larger run if found; otherwise append a new bin.
    pub fn allocate(&mut self, payload_len: u32) -> Result<CellIndex> {
        let needed = round_up_8(payload_len + 4).max(MIN_CELL_SIZE);

        for bin in self.bins.clone() {
            let mut pos = bin.file_offset + 32;
            let bin_end = bin.file_offset + bin.size as u64;
            while pos < bin_end {
                let raw = self.read_at(pos, 4)?;
                let size = read_i32_le(&raw, 0).unwrap();
                if size <= 0 {
                    pos += (-size) as u64;
                    continue;
                }
                let run = size as u32;
                if run >= needed {
                    if run - needed >= MIN_CELL_SIZE {
                        self.write_at(pos, &(-(needed as i32)).to_le_bytes())?;
                        self.write_at(pos + needed as u64, &((run - needed) as i32).to_le_bytes())?;
                    } else {
                        self.write_at(pos, &(-(run as i32)).to_le_bytes())?;
                    }
                    let index = (pos - BIN_REGION_START) as CellIndex;
                    return Ok(index);
                }
                pos += run as u64;
            }
        }

        self.append_bin(needed)
    }

    fn append_bin(&mut self, min_free: u32) -> Result<CellIndex> {
        let bin_size = ((min_free as u64 + 32 + 4095) / 4096 * 4096) as u32;
        let file_offset = BIN_REGION_START + self.header.length as u64;

        let mut hdr = [0u8; 32];
        hdr[0..4].copy_from_slice(b"hbin");
        hdr[4..8].copy_from_slice(&(self.header.length).to_le_bytes());
        hdr[8..12].copy_from_slice(&bin_size.to_le_bytes());
        self.write_at(file_offset, &hdr)?;

        let free_run = bin_size - 32;
        self.write_at(file_offset + 32, &(free_run as i32).to_le_bytes())?;

        self.bins.push(BinInfo {
            file_offset,
            size: bin_size,
        });
        self.header.length += bin_size;
        self.bump_sequence()?;

        // Re-run the allocation now that a fitting free run exists.
        self.allocate_in_bin(file_offset, min_free)
    }

    fn allocate_in_bin(&mut self, bin_offset: u64, payload_len: u32) -> Result<CellIndex> {
        let needed = round_up_8(payload_len).max(MIN_CELL_SIZE);
        let pos = bin_offset + 32;
        let raw = self.read_at(pos, 4)?;
        let run = read_i32_le(&raw, 0).unwrap() as u32;
        if run - needed >= MIN_CELL_SIZE {
            self.write_at(pos, &(-(needed as i32)).to_le_bytes())?;
            self.write_at(pos + needed as u64, &((run - needed) as i32).to_le_bytes())?;
        } else {
            self.write_at(pos, &(-(run as i32)).to_le_bytes())?;
        }
        Ok((pos - BIN_REGION_START) as CellIndex)
    }

    pub fn free(&mut self, index: CellIndex) -> Result<()> {
        if index == NONE || index == 0 {
            return Ok(());
        }
        let size = self.cell_raw_size(index)?;
        if size >= 0 {
            return Ok(()); // already free
        }
        self.write_at(Self::cell_abs_offset(index), &(-size).to_le_bytes())?;
        let bin = self.owning_bin(Self::cell_abs_offset(index))?;
        self.coalesce_bin(bin)
    }

    fn coalesce_bin(&mut self, bin: BinInfo) -> Result<()> {
        let mut pos = bin.file_offset + 32;
        let bin_end = bin.file_offset + bin.size as u64;
        while pos < bin_end {
            let raw = self.read_at(pos, 4)?;
            let size = read_i32_le(&raw, 0).unwrap();
            if size <= 0 {
                pos += (-size) as u64;
                continue;
            }
            let mut run = size as u32;
            let mut next = pos + run as u64;
            while next < bin_end {
                let raw_next = self.read_at(next, 4)?;
                let next_size = read_i32_le(&raw_next, 0).unwrap();
                if next_size <= 0 {
                    break;
                }
                run += next_size as u32;
                next += next_size as u64;
            }
            if run != size as u32 {
                self.write_at(pos, &(run as i32).to_le_bytes())?;
            }
            pos += run as u64;
        }
        Ok(())
    }

    /// Resize-or-relocate a cell to hold `payload`. Returns the cell's
    /// (possibly new) index.
    pub fn update(&mut self, index: CellIndex, payload: &[u8], can_relocate: bool) -> Result<CellIndex> {
        let size = self.cell_raw_size(index)?;
        let capacity = (-size) as u32 - 4;
        let needed = round_up_8(payload.len() as u32 + 4) - 4;
        if needed <= capacity {
            self.write_cell(index, payload)?;
            return Ok(index);
        }
        if !can_relocate {
            return Err(HiveError::RelocationDisabled);
        }
        let new_index = self.allocate(payload.len() as u32)?;
        self.write_cell(new_index, payload)?;
        self.free(index)?;
        Ok(new_index)
    }
}
