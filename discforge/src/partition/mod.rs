//! Partition-table engine: MBR (with the extended/EBR chain) and GPT.
//!
//! Both formats are exposed through the same `PartitionTable` trait so a
//! caller that only needs "list partitions, open one" doesn't need to
//! know which table format backs a given disk image. The two formats keep
//! separate concrete types (`MbrTable`, `GptTable`) because their on-disk
//! representations and failure modes don't otherwise share a useful common
//! struct.

pub mod gpt;
pub mod mbr;

use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;

use crate::stream::{SparseStream, SubStream};

pub const SECTOR_SIZE: u64 = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub index: usize,
    pub first_lba: u64,
    pub last_lba: u64,
    pub partition_type: PartitionKind,
    pub active: bool,
}

impl PartitionInfo {
    pub fn sector_count(&self) -> u64 {
        self.last_lba - self.first_lba + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    Mbr(u8),
    Gpt(uuid::Uuid),
}

#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("no free partition-table slot")]
    NoFreeSlot,
    #[error("requested range overlaps an existing partition")]
    Overlap,
    #[error("last sector is past the end of the disk")]
    LastSectorPastEnd,
    #[error("alignment is not a multiple of the sector size")]
    AlignmentMismatch,
    #[error("no gap large enough for the requested size")]
    NoGap,
    #[error("partition index out of range")]
    InvalidIndex,
    #[error("partition slot at this index is already empty")]
    AlreadyEmpty,
    #[error("requested size is zero")]
    ZeroSize,
    #[error("partition table is corrupt: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PartitionError>;

/// Common surface both `MbrTable` and `GptTable` implement.
pub trait PartitionTable<S: SparseStream> {
    fn partitions(&self) -> &[PartitionInfo];

    fn create(
        &mut self,
        sectors: u64,
        kind: PartitionKind,
        active: bool,
        alignment: Option<u64>,
    ) -> Result<usize>;

    fn delete(&mut self, index: usize) -> Result<()>;

    fn open(&self, index: usize) -> Result<SubStream<S>>;
}

pub(crate) fn whole_disk_backing<S: SparseStream>(disk: Rc<RefCell<S>>, info: &PartitionInfo) -> SubStream<S> {
    let base = info.first_lba * SECTOR_SIZE;
    let len = info.sector_count() * SECTOR_SIZE;
    SubStream::new(disk, base, len)
}
