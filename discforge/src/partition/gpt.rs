//! GPT partition tables: primary/secondary header recovery, CRC32
//! validation, alignment, gap-finding, and the Microsoft Reserved
//! Partition policy.
//!
//! `GptHeader`/`GptEntry` decode/encode pairs, a protective-MBR builder,
//! and read-primary-then-fall-back-to-backup recovery, adapted to
//! synchronous I/O against a `SparseStream` rather than an async block
//! device.

use std::cell::RefCell;
use std::io::{Read, Seek, SeekFrom, Write};
use std::rc::Rc;

use uuid::Uuid;

use crate::guid;
use crate::partition::{
    whole_disk_backing, PartitionError, PartitionInfo, PartitionKind, PartitionTable, Result,
    SECTOR_SIZE,
};
use crate::stream::{SparseStream, SubStream};
use discforge_codec::{read_u16_le, read_u32_le, read_u64_le};

const SIGNATURE: &[u8; 8] = b"EFI PART";
const HEADER_SIZE: u32 = 92;
const DEFAULT_ENTRY_COUNT: u32 = 128;
const ENTRY_SIZE: u32 = 128;
const MICROSOFT_BASIC_DATA: &str = "ebd0a0a2-b9e5-4433-87c0-68b6b72699c7";
const MICROSOFT_RESERVED: &str = "e3c9e316-0b5c-4db8-817d-f92df00215ae";

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GptAttributes: u64 {
        const PLATFORM_REQUIRED      = 1 << 0;
        const EFI_FIRMWARE_IGNORE    = 1 << 1;
        const LEGACY_BIOS_BOOTABLE   = 1 << 2;
        /// Bits 48-63: type-specific, e.g. the Basic Data partition's
        /// read-only/hidden/no-drive-letter/shadow-copy bits.
        const TYPE_SPECIFIC_READ_ONLY   = 1 << 60;
        const TYPE_SPECIFIC_SHADOW_COPY = 1 << 61;
        const TYPE_SPECIFIC_HIDDEN      = 1 << 62;
        const TYPE_SPECIFIC_NO_DRIVE_LETTER = 1 << 63;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GptHeader {
    pub revision: u32,
    pub header_size: u32,
    pub header_crc32: u32,
    pub header_lba: u64,
    pub alternate_lba: u64,
    pub first_usable: u64,
    pub last_usable: u64,
    pub disk_guid: Uuid,
    pub entries_lba: u64,
    pub entry_count: u32,
    pub entry_size: u32,
    pub entries_crc32: u32,
}

impl GptHeader {
    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE as usize || &buf[0..8] != SIGNATURE {
            return Err(PartitionError::Corrupt("bad GPT header signature".into()));
        }
        Ok(Self {
            revision: read_u32_le(buf, 8).unwrap(),
            header_size: read_u32_le(buf, 12).unwrap(),
            header_crc32: read_u32_le(buf, 16).unwrap(),
            header_lba: read_u64_le(buf, 24).unwrap(),
            alternate_lba: read_u64_le(buf, 32).unwrap(),
            first_usable: read_u64_le(buf, 40).unwrap(),
            last_usable: read_u64_le(buf, 48).unwrap(),
            disk_guid: guid::from_mixed_endian_bytes(buf[56..72].try_into().unwrap()),
            entries_lba: read_u64_le(buf, 72).unwrap(),
            entry_count: read_u32_le(buf, 80).unwrap(),
            entry_size: read_u32_le(buf, 84).unwrap(),
            entries_crc32: read_u32_le(buf, 88).unwrap(),
        })
    }

    /// Encode the header with `header_crc32` forced to zero, matching the
    /// "crc32 is computed with the crc32 field zeroed" invariant.
    fn encode_for_crc(&self) -> Vec<u8> {
        self.encode_with_crc(0)
    }

    fn encode_with_crc(&self, header_crc32: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE as usize);
        out.extend_from_slice(SIGNATURE);
        out.extend_from_slice(&self.revision.to_le_bytes());
        out.extend_from_slice(&self.header_size.to_le_bytes());
        out.extend_from_slice(&header_crc32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // reserved
        out.extend_from_slice(&self.header_lba.to_le_bytes());
        out.extend_from_slice(&self.alternate_lba.to_le_bytes());
        out.extend_from_slice(&self.first_usable.to_le_bytes());
        out.extend_from_slice(&self.last_usable.to_le_bytes());
        out.extend_from_slice(&guid::to_mixed_endian_bytes(self.disk_guid));
        out.extend_from_slice(&self.entries_lba.to_le_bytes());
        out.extend_from_slice(&self.entry_count.to_le_bytes());
        out.extend_from_slice(&self.entry_size.to_le_bytes());
        out.extend_from_slice(&self.entries_crc32.to_le_bytes());
        out
    }

    fn to_sector(&self) -> [u8; 512] {
        let mut sector = [0u8; 512];
        let encoded = self.encode_with_crc(self.header_crc32);
        sector[..encoded.len()].copy_from_slice(&encoded);
        sector
    }

    fn recompute_header_crc(&mut self) {
        self.header_crc32 = crate::crc32::crc32(&self.encode_for_crc());
    }

    fn verify_header_crc(&self) -> bool {
        crate::crc32::verify(&self.encode_for_crc(), self.header_crc32)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptEntry {
    pub type_guid: Uuid,
    pub unique_guid: Uuid,
    pub first_lba: u64,
    pub last_lba: u64,
    pub attributes: GptAttributes,
    pub name: String,
}

impl GptEntry {
    fn empty() -> Self {
        Self {
            type_guid: guid::nil(),
            unique_guid: guid::nil(),
            first_lba: 0,
            last_lba: 0,
            attributes: GptAttributes::empty(),
            name: String::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.type_guid == guid::nil()
    }

    fn decode(buf: &[u8]) -> Self {
        let mut units = [0u16; 36];
        for (i, chunk) in buf[56..56 + 72].chunks_exact(2).enumerate() {
            units[i] = read_u16_le(chunk, 0).unwrap();
        }
        let end = units.iter().position(|&u| u == 0).unwrap_or(units.len());
        Self {
            type_guid: guid::from_mixed_endian_bytes(buf[0..16].try_into().unwrap()),
            unique_guid: guid::from_mixed_endian_bytes(buf[16..32].try_into().unwrap()),
            first_lba: read_u64_le(buf, 32).unwrap(),
            last_lba: read_u64_le(buf, 40).unwrap(),
            attributes: GptAttributes::from_bits_truncate(read_u64_le(buf, 48).unwrap()),
            name: String::from_utf16_lossy(&units[..end]),
        }
    }

    fn encode(&self) -> [u8; 128] {
        let mut out = [0u8; 128];
        out[0..16].copy_from_slice(&guid::to_mixed_endian_bytes(self.type_guid));
        out[16..32].copy_from_slice(&guid::to_mixed_endian_bytes(self.unique_guid));
        out[32..40].copy_from_slice(&self.first_lba.to_le_bytes());
        out[40..48].copy_from_slice(&self.last_lba.to_le_bytes());
        out[48..56].copy_from_slice(&self.attributes.bits().to_le_bytes());
        let mut units: Vec<u16> = self.name.encode_utf16().collect();
        units.truncate(36);
        for (i, unit) in units.iter().enumerate() {
            out[56 + i * 2..58 + i * 2].copy_from_slice(&unit.to_le_bytes());
        }
        out
    }
}

fn entries_sector_count(entry_count: u32) -> u64 {
    let bytes = entry_count as u64 * ENTRY_SIZE as u64;
    (bytes + SECTOR_SIZE - 1) / SECTOR_SIZE
}

fn read_sector<S: SparseStream>(disk: &mut S, lba: u64) -> Result<[u8; 512]> {
    let mut buf = [0u8; 512];
    disk.seek(SeekFrom::Start(lba * SECTOR_SIZE))?;
    disk.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_entries<S: SparseStream>(disk: &mut S, lba: u64, entry_count: u32) -> Result<Vec<u8>> {
    let sectors = entries_sector_count(entry_count);
    let mut buf = vec![0u8; (sectors * SECTOR_SIZE) as usize];
    disk.seek(SeekFrom::Start(lba * SECTOR_SIZE))?;
    disk.read_exact(&mut buf)?;
    Ok(buf)
}

fn decode_entries(buf: &[u8], entry_count: u32) -> Vec<GptEntry> {
    (0..entry_count as usize)
        .map(|i| GptEntry::decode(&buf[i * ENTRY_SIZE as usize..(i + 1) * ENTRY_SIZE as usize]))
        .collect()
}

fn encode_entries(entries: &[GptEntry]) -> Vec<u8> {
    let mut out = vec![0u8; entries.len() * ENTRY_SIZE as usize];
    for (i, entry) in entries.iter().enumerate() {
        out[i * ENTRY_SIZE as usize..(i + 1) * ENTRY_SIZE as usize].copy_from_slice(&entry.encode());
    }
    out
}

struct Table {
    header: GptHeader,
    entries: Vec<GptEntry>,
}

fn try_read_table<S: SparseStream>(disk: &mut S, header_lba: u64) -> Option<Table> {
    let sector = read_sector(disk, header_lba).ok()?;
    let header = GptHeader::decode(&sector).ok()?;
    if !header.verify_header_crc() {
        return None;
    }
    let entries_buf = read_entries(disk, header.entries_lba, header.entry_count).ok()?;
    if !crate::crc32::verify(&entries_buf, header.entries_crc32) {
        return None;
    }
    Some(Table {
        entries: decode_entries(&entries_buf, header.entry_count),
        header,
    })
}

/// Build the protective MBR: a single partition of type 0xEE spanning the
/// whole disk (or as much of it as a 32-bit LBA field can represent).
fn protective_mbr(disk_sectors: u64) -> [u8; 512] {
    let mut sector = [0u8; 512];
    const OFFSET: usize = 446;
    sector[OFFSET + 4] = 0xEE;
    sector[OFFSET + 5..OFFSET + 8].copy_from_slice(&[0xFF, 0xFF, 0xFF]);
    sector[OFFSET + 8..OFFSET + 12].copy_from_slice(&1u32.to_le_bytes());
    let size = if disk_sectors - 1 > u32::MAX as u64 {
        u32::MAX
    } else {
        (disk_sectors - 1) as u32
    };
    sector[OFFSET + 12..OFFSET + 16].copy_from_slice(&size.to_le_bytes());
    sector[510] = 0x55;
    sector[511] = 0xAA;
    sector
}

#[derive(Debug)]
pub struct GptTable<S: SparseStream> {
    disk: Rc<RefCell<S>>,
    header: GptHeader,
    entries: Vec<GptEntry>,
    partitions: Vec<PartitionInfo>,
    disk_sectors: u64,
}

impl<S: SparseStream> GptTable<S> {
    pub fn open(disk: Rc<RefCell<S>>) -> Result<Self> {
        let disk_sectors = disk.borrow().len() / SECTOR_SIZE;
        let mut guard = disk.borrow_mut();

        let primary = try_read_table(&mut *guard, 1);
        let secondary = try_read_table(&mut *guard, disk_sectors - 1);

        let (header, entries, needs_primary_rebuild, needs_secondary_rebuild) =
            match (primary, secondary) {
                (Some(p), Some(_)) => (p.header, p.entries, false, false),
                (Some(p), None) => (p.header, p.entries, false, true),
                (None, Some(s)) => {
                    let mut rebuilt = s.header;
                    rebuilt.header_lba = 1;
                    rebuilt.alternate_lba = disk_sectors - 1;
                    rebuilt.entries_lba = 2;
                    rebuilt.recompute_header_crc();
                    (rebuilt, s.entries, true, false)
                }
                (None, None) => {
                    return Err(PartitionError::Corrupt(
                        "both primary and secondary GPT headers are invalid".into(),
                    ))
                }
            };

        let mut table = Self {
            disk: Rc::clone(&disk),
            header,
            entries,
            partitions: Vec::new(),
            disk_sectors,
        };
        table.rebuild_partition_list();

        drop(guard);
        if needs_primary_rebuild {
            table.write_table(true, false).ok();
        }
        if needs_secondary_rebuild {
            table.write_table(false, true).ok();
        }

        Ok(table)
    }

    pub fn initialize(disk: Rc<RefCell<S>>) -> Result<Self> {
        let disk_sectors = disk.borrow().len() / SECTOR_SIZE;
        let pmbr = protective_mbr(disk_sectors);
        disk.borrow_mut().seek(SeekFrom::Start(0))?;
        disk.borrow_mut().write_all(&pmbr)?;

        let header = GptHeader {
            revision: 0x0001_0000,
            header_size: HEADER_SIZE,
            header_crc32: 0,
            header_lba: 1,
            alternate_lba: disk_sectors - 1,
            first_usable: 2 + entries_sector_count(DEFAULT_ENTRY_COUNT),
            last_usable: disk_sectors - 2 - entries_sector_count(DEFAULT_ENTRY_COUNT),
            disk_guid: Uuid::new_v4(),
            entries_lba: 2,
            entry_count: DEFAULT_ENTRY_COUNT,
            entry_size: ENTRY_SIZE,
            entries_crc32: 0,
        };

        let mut table = Self {
            disk,
            header,
            entries: vec![GptEntry::empty(); DEFAULT_ENTRY_COUNT as usize],
            partitions: Vec::new(),
            disk_sectors,
        };
        table.recompute_and_write(true, true)?;
        Ok(table)
    }

    fn rebuild_partition_list(&mut self) {
        let mut live: Vec<&GptEntry> = self.entries.iter().filter(|e| !e.is_empty()).collect();
        live.sort_by_key(|e| e.first_lba);
        self.partitions = live
            .into_iter()
            .enumerate()
            .map(|(i, e)| PartitionInfo {
                index: i,
                first_lba: e.first_lba,
                last_lba: e.last_lba,
                partition_type: PartitionKind::Gpt(e.type_guid),
                active: false,
            })
            .collect();
    }

    fn recompute_and_write(&mut self, primary: bool, secondary: bool) -> Result<()> {
        let entries_buf = encode_entries(&self.entries);
        self.header.entries_crc32 = crate::crc32::crc32(&entries_buf);
        self.header.recompute_header_crc();
        self.write_table(primary, secondary)
    }

    fn write_table(&self, primary: bool, secondary: bool) -> Result<()> {
        let entries_buf = encode_entries(&self.entries);
        let mut disk = self.disk.borrow_mut();

        if primary {
            let mut header = self.header;
            header.header_lba = 1;
            header.alternate_lba = self.disk_sectors - 1;
            header.entries_lba = 2;
            header.recompute_header_crc();
            disk.seek(SeekFrom::Start(2 * SECTOR_SIZE))?;
            disk.write_all(&entries_buf)?;
            disk.seek(SeekFrom::Start(SECTOR_SIZE))?;
            disk.write_all(&header.to_sector())?;
        }

        if secondary {
            let entries_sectors = entries_sector_count(self.header.entry_count);
            let secondary_entries_lba = self.disk_sectors - 1 - entries_sectors;
            let mut header = self.header;
            header.header_lba = self.disk_sectors - 1;
            header.alternate_lba = 1;
            header.entries_lba = secondary_entries_lba;
            header.recompute_header_crc();
            disk.seek(SeekFrom::Start(secondary_entries_lba * SECTOR_SIZE))?;
            disk.write_all(&entries_buf)?;
            disk.seek(SeekFrom::Start(header.header_lba * SECTOR_SIZE))?;
            disk.write_all(&header.to_sector())?;
        }

        Ok(())
    }

    fn find_gap(&self, sectors: u64, alignment_sectors: u64) -> Result<(u64, u64)> {
        let mut live: Vec<&GptEntry> = self.entries.iter().filter(|e| !e.is_empty()).collect();
        live.sort_by_key(|e| e.first_lba);

        let align_up = |v: u64| -> u64 { ((v + alignment_sectors - 1) / alignment_sectors) * alignment_sectors };
        let align_down = |v: u64| -> u64 { (v / alignment_sectors) * alignment_sectors };
        let mut candidate = align_up(self.header.first_usable);

        for entry in live {
            if candidate + sectors - 1 < entry.first_lba {
                break;
            }
            if candidate <= entry.last_lba {
                candidate = align_up(entry.last_lba + 1);
            }
        }

        let unaligned_last = candidate + sectors - 1;
        if unaligned_last < candidate {
            return Err(PartitionError::NoGap);
        }
        let last = align_down(unaligned_last);
        if last > self.header.last_usable || last < candidate {
            return Err(PartitionError::NoGap);
        }
        Ok((candidate, last))
    }

    fn has_type(&self, type_guid: &str) -> bool {
        let target: Uuid = type_guid.parse().unwrap();
        self.entries.iter().any(|e| e.type_guid == target)
    }

    /// Create the Microsoft Reserved Partition if the disk is large enough
    /// and neither it nor a Basic Data partition already exists.
    pub fn ensure_reserved_partition(&mut self) -> Result<()> {
        let disk_bytes = self.disk_sectors * SECTOR_SIZE;
        if disk_bytes <= 512 * 1024 * 1024 {
            return Ok(());
        }
        if self.has_type(MICROSOFT_RESERVED) || self.has_type(MICROSOFT_BASIC_DATA) {
            return Ok(());
        }
        let reserved_bytes: u64 = if disk_bytes < 16u64 * 1024 * 1024 * 1024 {
            32 * 1024 * 1024
        } else {
            128 * 1024 * 1024
        };
        let sectors = reserved_bytes / SECTOR_SIZE;
        let type_guid = MICROSOFT_RESERVED.parse().unwrap();
        self.create(sectors, PartitionKind::Gpt(type_guid), false, None)?;
        Ok(())
    }

    pub fn create_named(
        &mut self,
        sectors: u64,
        type_guid: Uuid,
        name: &str,
        alignment: Option<u64>,
    ) -> Result<usize> {
        let alignment_sectors = match alignment {
            Some(bytes) => {
                if bytes % SECTOR_SIZE != 0 {
                    return Err(PartitionError::AlignmentMismatch);
                }
                bytes / SECTOR_SIZE
            }
            None => 1,
        };

        if sectors == 0 {
            return Err(PartitionError::ZeroSize);
        }

        let slot = self
            .entries
            .iter()
            .position(GptEntry::is_empty)
            .ok_or(PartitionError::NoFreeSlot)?;

        let (start, end) = self.find_gap(sectors, alignment_sectors.max(1))?;

        self.entries[slot] = GptEntry {
            type_guid,
            unique_guid: Uuid::new_v4(),
            first_lba: start,
            last_lba: end,
            attributes: GptAttributes::empty(),
            name: name.to_string(),
        };

        self.recompute_and_write(true, true)?;
        self.rebuild_partition_list();
        self.partitions
            .iter()
            .position(|p| p.first_lba == start)
            .ok_or_else(|| PartitionError::Corrupt("partition vanished after create".into()))
    }
}

impl<S: SparseStream> PartitionTable<S> for GptTable<S> {
    fn partitions(&self) -> &[PartitionInfo] {
        &self.partitions
    }

    fn create(
        &mut self,
        sectors: u64,
        kind: PartitionKind,
        _active: bool,
        alignment: Option<u64>,
    ) -> Result<usize> {
        let type_guid = match kind {
            PartitionKind::Gpt(guid) => guid,
            PartitionKind::Mbr(_) => {
                return Err(PartitionError::Corrupt(
                    "cannot create an MBR-typed partition in a GPT table".into(),
                ))
            }
        };
        self.create_named(sectors, type_guid, "", alignment)
    }

    fn delete(&mut self, index: usize) -> Result<()> {
        let info = self
            .partitions
            .get(index)
            .ok_or(PartitionError::InvalidIndex)?
            .clone();

        let slot = self
            .entries
            .iter()
            .position(|e| !e.is_empty() && e.first_lba == info.first_lba)
            .ok_or(PartitionError::AlreadyEmpty)?;

        self.entries[slot] = GptEntry::empty();
        self.recompute_and_write(true, true)?;
        self.rebuild_partition_list();
        Ok(())
    }

    fn open(&self, index: usize) -> Result<SubStream<S>> {
        let info = self.partitions.get(index).ok_or(PartitionError::InvalidIndex)?;
        Ok(whole_disk_backing(Rc::clone(&self.disk), info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryStream;

    fn blank_disk(sectors: u64) -> Rc<RefCell<MemoryStream>> {
        Rc::new(RefCell::new(MemoryStream::from_vec(vec![
            0u8;
            (sectors * SECTOR_SIZE) as usize
        ])))
    }

    #[test]
    fn initialize_produces_valid_crcs_on_both_copies() {
        let disk = blank_disk(131072); // 64 MiB
        let table = GptTable::initialize(disk).unwrap();
        assert_eq!(table.partitions().len(), 0);
        assert!(table.header.verify_header_crc());
    }

    #[test]
    fn create_then_reopen_finds_same_partition() {
        let disk = blank_disk(131072);
        let mut table = GptTable::initialize(disk.clone()).unwrap();
        let type_guid: Uuid = MICROSOFT_BASIC_DATA.parse().unwrap();
        let idx = table
            .create_named(2048, type_guid, "data", None)
            .unwrap();
        let first_lba = table.partitions()[idx].first_lba;

        let reopened = GptTable::open(disk).unwrap();
        assert_eq!(reopened.partitions().len(), 1);
        assert_eq!(reopened.partitions()[0].first_lba, first_lba);
    }

    #[test]
    fn recovers_primary_from_valid_secondary() {
        let disk = blank_disk(131072);
        let type_guid: Uuid = MICROSOFT_BASIC_DATA.parse().unwrap();
        {
            let mut table = GptTable::initialize(disk.clone()).unwrap();
            table.create_named(2048, type_guid, "data", None).unwrap();
        }
        // Zero out the primary header sector.
        {
            let mut guard = disk.borrow_mut();
            guard.seek(SeekFrom::Start(SECTOR_SIZE)).unwrap();
            guard.write_all(&[0u8; 512]).unwrap();
        }
        let reopened = GptTable::open(disk).unwrap();
        assert_eq!(reopened.partitions().len(), 1);
        assert!(reopened.header.verify_header_crc());
    }

    #[test]
    fn delete_clears_the_slot() {
        let disk = blank_disk(131072);
        let type_guid: Uuid = MICROSOFT_BASIC_DATA.parse().unwrap();
        let mut table = GptTable::initialize(disk).unwrap();
        let idx = table.create_named(2048, type_guid, "data", None).unwrap();
        table.delete(idx).unwrap();
        assert_eq!(table.partitions().len(), 0);
    }

    #[test]
    fn reserved_partition_policy_adds_slot_on_large_disk() {
        let disk = blank_disk(32u64 * 1024 * 1024 * 1024 / SECTOR_SIZE); // 32 GiB
        let mut table = GptTable::initialize(disk).unwrap();
        table.ensure_reserved_partition().unwrap();
        assert_eq!(table.partitions().len(), 1);
        assert!(table.has_type(MICROSOFT_RESERVED));
    }
}
