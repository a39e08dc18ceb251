//! MBR partition tables, including the recursive Extended/EBR chain.
//!
//! Same shape as the GPT reader in this module: parse-on-open, decode/
//! encode pairs for each on-disk record, and CRUD methods that re-read
//! then rewrite the whole structure.

use std::cell::RefCell;
use std::io::{Read, Seek, SeekFrom, Write};
use std::rc::Rc;

use crate::partition::{
    whole_disk_backing, PartitionError, PartitionInfo, PartitionKind, PartitionTable, Result,
    SECTOR_SIZE,
};
use crate::stream::{SparseStream, SubStream};
use discforge_codec::read_u32_le;

const BOOT_SIGNATURE_OFFSET: usize = 510;
const RECORD_TABLE_OFFSET: usize = 0x1BE;
const RECORD_SIZE: usize = 16;
const EXTENDED_CHS: u8 = 0x05;
const EXTENDED_LBA: u8 = 0x0F;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbrRecord {
    pub status: u8,
    pub start_chs: [u8; 3],
    pub partition_type: u8,
    pub end_chs: [u8; 3],
    pub lba_start: u32,
    pub lba_length: u32,
}

impl MbrRecord {
    fn from_bytes(buf: &[u8]) -> Self {
        Self {
            status: buf[0],
            start_chs: [buf[1], buf[2], buf[3]],
            partition_type: buf[4],
            end_chs: [buf[5], buf[6], buf[7]],
            lba_start: read_u32_le(buf, 8).unwrap(),
            lba_length: read_u32_le(buf, 12).unwrap(),
        }
    }

    fn to_bytes(self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0] = self.status;
        out[1..4].copy_from_slice(&self.start_chs);
        out[4] = self.partition_type;
        out[5..8].copy_from_slice(&self.end_chs);
        out[8..12].copy_from_slice(&self.lba_start.to_le_bytes());
        out[12..16].copy_from_slice(&self.lba_length.to_le_bytes());
        out
    }

    fn empty() -> Self {
        Self {
            status: 0,
            start_chs: [0; 3],
            partition_type: 0,
            end_chs: [0; 3],
            lba_start: 0,
            lba_length: 0,
        }
    }

    /// A record is valid if any of endHead, endSector, endCylinder, or
    /// lbaLength is non-zero.
    pub fn is_valid(&self) -> bool {
        let (cylinder, head, sector) = decode_chs(self.end_chs);
        head != 0 || sector != 0 || cylinder != 0 || self.lba_length != 0
    }

    pub fn is_extended(&self) -> bool {
        self.partition_type == EXTENDED_CHS || self.partition_type == EXTENDED_LBA
    }

    pub fn is_active(&self) -> bool {
        self.status == 0x80
    }
}

/// Decode the packed 3-byte CHS address: byte0 = head, byte1 = (cylinder
/// high bits << 6) | sector, byte2 = cylinder low 8 bits.
fn decode_chs(buf: [u8; 3]) -> (u16, u8, u8) {
    let head = buf[0];
    let sector = buf[1] & 0x3F;
    let cylinder = ((buf[1] as u16 & 0xC0) << 2) | buf[2] as u16;
    (cylinder, head, sector)
}

fn encode_chs(cylinder: u16, head: u8, sector: u8) -> [u8; 3] {
    let (cylinder, head, sector) = if cylinder > 1023 || head > 254 || sector > 63 {
        (1023u16, 254u8, 63u8)
    } else {
        (cylinder, head, sector)
    };
    let b1 = ((cylinder >> 2) as u8 & 0xC0) | (sector & 0x3F);
    let b2 = (cylinder & 0xFF) as u8;
    [head, b1, b2]
}

/// Compute a clamped CHS address for `lba` assuming the conventional
/// 255 heads / 63 sectors-per-track geometry used when the real geometry
/// is unknown. LBA fields remain authoritative; this is purely for the
/// informational CHS bytes.
fn lba_to_chs(lba: u64) -> [u8; 3] {
    const HEADS: u64 = 255;
    const SECTORS: u64 = 63;
    let cylinder = lba / (HEADS * SECTORS);
    let head = (lba / SECTORS) % HEADS;
    let sector = (lba % SECTORS) + 1;
    encode_chs(cylinder.min(1023) as u16, head as u8, sector as u8)
}

#[derive(Debug, Clone)]
struct LogicalEntry {
    record: MbrRecord,
    absolute_lba: u64,
    /// Absolute LBA of the EBR sector this entry's record lives in.
    ebr_lba: u64,
    /// Index of this record within its EBR (0 or 1).
    slot: usize,
}

fn read_sector<S: SparseStream>(disk: &mut S, lba: u64) -> Result<[u8; 512]> {
    let mut buf = [0u8; 512];
    disk.seek(SeekFrom::Start(lba * SECTOR_SIZE))?;
    disk.read_exact(&mut buf)?;
    Ok(buf)
}

fn write_sector<S: SparseStream>(disk: &mut S, lba: u64, buf: &[u8; 512]) -> Result<()> {
    disk.seek(SeekFrom::Start(lba * SECTOR_SIZE))?;
    disk.write_all(buf)?;
    Ok(())
}

fn walk_extended_chain<S: SparseStream>(
    disk: &mut S,
    outer_extended_lba: u64,
    ebr_lba: u64,
    out: &mut Vec<LogicalEntry>,
) -> Result<()> {
    let sector = read_sector(disk, ebr_lba)?;
    if sector[BOOT_SIGNATURE_OFFSET] != 0x55 || sector[BOOT_SIGNATURE_OFFSET + 1] != 0xAA {
        return Err(PartitionError::Corrupt(
            "extended boot record missing 0x55AA marker".into(),
        ));
    }

    let first = MbrRecord::from_bytes(&sector[RECORD_TABLE_OFFSET..RECORD_TABLE_OFFSET + 16]);
    if first.is_valid() {
        out.push(LogicalEntry {
            absolute_lba: ebr_lba + first.lba_start as u64,
            record: first,
            ebr_lba,
            slot: 0,
        });
    }

    let second = MbrRecord::from_bytes(&sector[RECORD_TABLE_OFFSET + 16..RECORD_TABLE_OFFSET + 32]);
    if second.is_valid() && second.is_extended() {
        let next_lba = outer_extended_lba + second.lba_start as u64;
        walk_extended_chain(disk, outer_extended_lba, next_lba, out)?;
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    Cylinder,
    Sector(u64),
}

#[derive(Debug)]
pub struct MbrTable<S: SparseStream> {
    disk: Rc<RefCell<S>>,
    primary: [MbrRecord; 4],
    logical: Vec<LogicalEntry>,
    partitions: Vec<PartitionInfo>,
    disk_sectors: u64,
}

impl<S: SparseStream> MbrTable<S> {
    pub fn open(disk: Rc<RefCell<S>>) -> Result<Self> {
        let disk_sectors = disk.borrow().len() / SECTOR_SIZE;
        let mut guard = disk.borrow_mut();
        let sector = read_sector(&mut *guard, 0)?;
        if sector[BOOT_SIGNATURE_OFFSET] != 0x55 || sector[BOOT_SIGNATURE_OFFSET + 1] != 0xAA {
            return Err(PartitionError::Corrupt(
                "boot sector missing 0x55AA marker".into(),
            ));
        }

        let mut primary = [MbrRecord::empty(); 4];
        for (i, slot) in primary.iter_mut().enumerate() {
            let off = RECORD_TABLE_OFFSET + i * RECORD_SIZE;
            *slot = MbrRecord::from_bytes(&sector[off..off + RECORD_SIZE]);
        }

        let mut logical = Vec::new();
        for record in primary.iter() {
            if record.is_valid() && record.is_extended() {
                let extended_lba = record.lba_start as u64;
                walk_extended_chain(&mut *guard, extended_lba, extended_lba, &mut logical)?;
            }
        }
        drop(guard);

        let mut partitions = Vec::new();
        for record in primary.iter().filter(|r| r.is_valid() && !r.is_extended()) {
            partitions.push(PartitionInfo {
                index: partitions.len(),
                first_lba: record.lba_start as u64,
                last_lba: record.lba_start as u64 + record.lba_length as u64 - 1,
                partition_type: PartitionKind::Mbr(record.partition_type),
                active: record.is_active(),
            });
        }
        for entry in &logical {
            partitions.push(PartitionInfo {
                index: partitions.len(),
                first_lba: entry.absolute_lba,
                last_lba: entry.absolute_lba + entry.record.lba_length as u64 - 1,
                partition_type: PartitionKind::Mbr(entry.record.partition_type),
                active: entry.record.is_active(),
            });
        }

        Ok(Self {
            disk,
            primary,
            logical,
            partitions,
            disk_sectors,
        })
    }

    pub fn initialize(disk: Rc<RefCell<S>>) -> Result<Self> {
        let disk_sectors = disk.borrow().len() / SECTOR_SIZE;
        let mut sector = [0u8; 512];
        sector[BOOT_SIGNATURE_OFFSET] = 0x55;
        sector[BOOT_SIGNATURE_OFFSET + 1] = 0xAA;
        write_sector(&mut *disk.borrow_mut(), 0, &sector)?;
        Ok(Self {
            disk,
            primary: [MbrRecord::empty(); 4],
            logical: Vec::new(),
            partitions: Vec::new(),
            disk_sectors,
        })
    }

    fn find_gap(&self, sectors: u64, alignment: Alignment) -> Result<u64> {
        if sectors == 0 {
            return Err(PartitionError::ZeroSize);
        }
        let unit = match alignment {
            Alignment::Cylinder => 63u64,
            Alignment::Sector(bytes) => {
                if bytes % SECTOR_SIZE != 0 {
                    return Err(PartitionError::AlignmentMismatch);
                }
                bytes / SECTOR_SIZE
            }
        };

        let mut occupied: Vec<(u64, u64)> = self
            .primary
            .iter()
            .filter(|r| r.is_valid())
            .map(|r| (r.lba_start as u64, r.lba_start as u64 + r.lba_length as u64 - 1))
            .collect();
        occupied.sort_unstable();

        let mut candidate = unit;
        for (start, end) in occupied {
            if candidate + sectors - 1 < start {
                break;
            }
            if candidate <= end {
                candidate = ((end + 1 + unit - 1) / unit) * unit;
            }
        }

        let last = candidate + sectors - 1;
        if last >= self.disk_sectors {
            return Err(PartitionError::LastSectorPastEnd);
        }
        Ok(candidate)
    }

    fn write_primary_table(&self) -> Result<()> {
        let mut disk = self.disk.borrow_mut();
        let mut sector = read_sector(&mut *disk, 0)?;
        for (i, record) in self.primary.iter().enumerate() {
            let off = RECORD_TABLE_OFFSET + i * RECORD_SIZE;
            sector[off..off + RECORD_SIZE].copy_from_slice(&record.to_bytes());
        }
        write_sector(&mut *disk, 0, &sector)
    }

    pub fn create_with_alignment(
        &mut self,
        sectors: u64,
        partition_type: u8,
        active: bool,
        alignment: Alignment,
    ) -> Result<usize> {
        let slot = self
            .primary
            .iter()
            .position(|r| !r.is_valid())
            .ok_or(PartitionError::NoFreeSlot)?;

        let start = self.find_gap(sectors, alignment)?;
        let last = start + sectors - 1;

        for record in self.primary.iter().filter(|r| r.is_valid()) {
            let rstart = record.lba_start as u64;
            let rend = rstart + record.lba_length as u64 - 1;
            if start <= rend && last >= rstart {
                return Err(PartitionError::Overlap);
            }
        }

        if active {
            for record in self.primary.iter_mut() {
                record.status = 0;
            }
        }

        self.primary[slot] = MbrRecord {
            status: if active { 0x80 } else { 0 },
            start_chs: lba_to_chs(start),
            partition_type,
            end_chs: lba_to_chs(last),
            lba_start: start as u32,
            lba_length: sectors as u32,
        };

        self.write_primary_table()?;

        self.partitions.push(PartitionInfo {
            index: self.partitions.len(),
            first_lba: start,
            last_lba: last,
            partition_type: PartitionKind::Mbr(partition_type),
            active,
        });
        Ok(self.partitions.len() - 1)
    }
}

impl<S: SparseStream> PartitionTable<S> for MbrTable<S> {
    fn partitions(&self) -> &[PartitionInfo] {
        &self.partitions
    }

    fn create(
        &mut self,
        sectors: u64,
        kind: PartitionKind,
        active: bool,
        alignment: Option<u64>,
    ) -> Result<usize> {
        let partition_type = match kind {
            PartitionKind::Mbr(t) => t,
            PartitionKind::Gpt(_) => {
                return Err(PartitionError::Corrupt(
                    "cannot create a GPT-typed partition in an MBR table".into(),
                ))
            }
        };
        let alignment = match alignment {
            Some(bytes) => Alignment::Sector(bytes),
            None => Alignment::Cylinder,
        };
        self.create_with_alignment(sectors, partition_type, active, alignment)
    }

    fn delete(&mut self, index: usize) -> Result<()> {
        let info = self
            .partitions
            .get(index)
            .ok_or(PartitionError::InvalidIndex)?
            .clone();

        if let Some(slot) = self
            .primary
            .iter()
            .position(|r| r.is_valid() && r.lba_start as u64 == info.first_lba)
        {
            self.primary[slot] = MbrRecord::empty();
            self.write_primary_table()?;
            self.partitions.remove(index);
            return Ok(());
        }

        Err(PartitionError::Corrupt(
            "deleting logical (EBR-chained) partitions is not supported".into(),
        ))
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
        let mut data = vec![0u8; (sectors * SECTOR_SIZE) as usize];
        data[BOOT_SIGNATURE_OFFSET] = 0x55;
        data[BOOT_SIGNATURE_OFFSET + 1] = 0xAA;
        Rc::new(RefCell::new(MemoryStream::from_vec(data)))
    }

    #[test]
    fn rejects_disk_without_boot_signature() {
        let disk = Rc::new(RefCell::new(MemoryStream::from_vec(vec![0u8; 512])));
        assert!(MbrTable::open(disk).is_err());
    }

    #[test]
    fn create_then_open_round_trips() {
        let disk = blank_disk(4096);
        let mut table = MbrTable::open(disk).unwrap();
        let idx = table
            .create_with_alignment(1000, 0x83, true, Alignment::Sector(512))
            .unwrap();
        assert_eq!(table.partitions()[idx].sector_count(), 1000);
        let sub = table.open(idx).unwrap();
        assert_eq!(sub.len(), 1000 * SECTOR_SIZE);
    }

    #[test]
    fn extended_chain_walk_computes_absolute_lba() {
        // Primary record 0: extended partition, type 0x0F, starting at LBA 2048
        // spanning 1000 sectors. Its EBR (at LBA 2048) holds one logical
        // partition record with relative start 63, length 500.
        let mut disk = vec![0u8; 4096 * SECTOR_SIZE as usize];
        disk[BOOT_SIGNATURE_OFFSET] = 0x55;
        disk[BOOT_SIGNATURE_OFFSET + 1] = 0xAA;
        let primary = MbrRecord {
            status: 0,
            start_chs: [0; 3],
            partition_type: EXTENDED_LBA,
            end_chs: [0, 0, 1],
            lba_start: 2048,
            lba_length: 1000,
        };
        disk[RECORD_TABLE_OFFSET..RECORD_TABLE_OFFSET + 16].copy_from_slice(&primary.to_bytes());

        let ebr_offset = 2048 * SECTOR_SIZE as usize;
        disk[ebr_offset + BOOT_SIGNATURE_OFFSET] = 0x55;
        disk[ebr_offset + BOOT_SIGNATURE_OFFSET + 1] = 0xAA;
        let logical = MbrRecord {
            status: 0,
            start_chs: [0; 3],
            partition_type: 0x83,
            end_chs: [0, 0, 1],
            lba_start: 63,
            lba_length: 500,
        };
        disk[ebr_offset + RECORD_TABLE_OFFSET..ebr_offset + RECORD_TABLE_OFFSET + 16]
            .copy_from_slice(&logical.to_bytes());

        let disk = Rc::new(RefCell::new(MemoryStream::from_vec(disk)));
        let table = MbrTable::open(disk).unwrap();
        assert_eq!(table.partitions().len(), 1);
        assert_eq!(table.partitions()[0].first_lba, 2111);
        assert_eq!(table.partitions()[0].sector_count(), 500);
    }

    #[test]
    fn chs_clamps_to_max_geometry() {
        let chs = lba_to_chs(100_000_000);
        let (cyl, head, sector) = decode_chs(chs);
        assert!(cyl <= 1023);
        assert!(head <= 254);
        assert!(sector <= 63);
    }
}
