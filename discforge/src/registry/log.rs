//! LOG1/LOG2 transactional replay.
//!
//! Each log file carries its own hive-style 4 KiB header followed by a
//! sequence of `HvLE` entries starting at offset 0x200. An entry's two
//! Marvin32 hashes (one over its page data, one over its own 32-byte
//! header) and its sequence number (which must strictly increase) gate
//! whether scanning continues.

use std::cell::RefCell;
use std::io::{Read, Seek, SeekFrom, Write};
use std::rc::Rc;

use discforge_codec::{read_u32_le, read_u64_le};

use super::hive::{HiveHeader, BIN_REGION_START};
use super::{marvin32, HiveError, Result, MARVIN_SEED};
use crate::stream::SparseStream;

const LOG_ENTRIES_START: u64 = 0x200;
const ENTRY_HEADER_SIZE: usize = 40;

struct LogEntry {
    sequence_number: u32,
    dirty_pages: Vec<(u32, Vec<u8>)>,
}

struct ParsedLog {
    header: Option<HiveHeader>,
    entries: Vec<LogEntry>,
}

fn read_whole<S: SparseStream>(stream: &Rc<RefCell<S>>) -> Result<Vec<u8>> {
    let mut guard = stream.borrow_mut();
    let len = guard.len();
    guard.seek(SeekFrom::Start(0))?;
    let mut buf = vec![0u8; len as usize];
    guard.read_exact(&mut buf)?;
    Ok(buf)
}

fn parse_log(data: &[u8]) -> ParsedLog {
    let header = if data.len() >= 4096 {
        let mut hdr = [0u8; 4096];
        hdr.copy_from_slice(&data[0..4096]);
        HiveHeader::decode(&hdr).ok()
    } else {
        None
    };

    let mut entries = Vec::new();
    let mut pos = LOG_ENTRIES_START as usize;
    let mut last_sequence: Option<u32> = None;

    while pos + ENTRY_HEADER_SIZE <= data.len() {
        let entry_hdr = &data[pos..pos + ENTRY_HEADER_SIZE];
        if &entry_hdr[0..4] != b"HvLE" {
            break;
        }
        let size = read_u32_le(entry_hdr, 4).unwrap() as usize;
        if size < ENTRY_HEADER_SIZE || pos + size > data.len() {
            break;
        }
        let sequence_number = read_u32_le(entry_hdr, 12).unwrap();
        let hash1 = read_u64_le(entry_hdr, 16).unwrap();
        let hash2 = read_u64_le(entry_hdr, 24).unwrap();
        let dirty_page_count = read_u32_le(entry_hdr, 32).unwrap() as usize;

        let computed_hash2 = marvin32(&entry_hdr[0..32], MARVIN_SEED);
        if computed_hash2 != hash2 {
            break;
        }
        let body = &data[pos + ENTRY_HEADER_SIZE..pos + size];
        let computed_hash1 = marvin32(body, MARVIN_SEED);
        if computed_hash1 != hash1 {
            break;
        }

        if let Some(last) = last_sequence {
            if sequence_number != last.wrapping_add(1) {
                break;
            }
        }
        last_sequence = Some(sequence_number);

        let mut page_headers = Vec::with_capacity(dirty_page_count);
        let mut cursor = ENTRY_HEADER_SIZE;
        for _ in 0..dirty_page_count {
            if cursor + 8 > body.len() {
                return ParsedLog { header, entries };
            }
            let page_offset = read_u32_le(body, cursor).unwrap();
            let page_size = read_u32_le(body, cursor + 4).unwrap();
            page_headers.push((page_offset, page_size));
            cursor += 8;
        }
        let mut dirty_pages = Vec::with_capacity(dirty_page_count);
        for (offset, page_size) in page_headers {
            if cursor + page_size as usize > body.len() {
                return ParsedLog { header, entries };
            }
            let page = body[cursor..cursor + page_size as usize].to_vec();
            dirty_pages.push((offset, page));
            cursor += page_size as usize;
        }

        entries.push(LogEntry {
            sequence_number,
            dirty_pages,
        });
        pos += size;
    }

    ParsedLog { header, entries }
}

pub struct Recovery {
    pub header: HiveHeader,
    dirty_pages: Vec<(u32, Vec<u8>)>,
}

impl Recovery {
    pub fn apply_dirty_pages<S: SparseStream>(&self, stream: &Rc<RefCell<S>>) -> Result<()> {
        let mut guard = stream.borrow_mut();
        for (offset, data) in &self.dirty_pages {
            guard.seek(SeekFrom::Start(BIN_REGION_START + *offset as u64))?;
            guard.write_all(data)?;
        }
        guard.seek(SeekFrom::Start(0))?;
        guard.write_all(&self.header.encode())?;
        Ok(())
    }
}

/// Recover a hive header (and the dirty pages to replay) from up to two
/// log files, handling the case where the primary header itself is
/// unreadable and the case where the two logs' sequence ranges don't
/// line up.
pub fn recover<L: SparseStream>(
    primary: Option<HiveHeader>,
    log1: Option<Rc<RefCell<L>>>,
    log2: Option<Rc<RefCell<L>>>,
) -> Result<Recovery> {
    let raw1 = match &log1 {
        Some(s) => Some(read_whole(s)?),
        None => None,
    };
    let raw2 = match &log2 {
        Some(s) => Some(read_whole(s)?),
        None => None,
    };
    let parsed1 = raw1.as_deref().map(parse_log);
    let parsed2 = raw2.as_deref().map(parse_log);

    if primary.is_none() && parsed1.as_ref().and_then(|p| p.header).is_none()
        && parsed2.as_ref().and_then(|p| p.header).is_none()
    {
        return Err(HiveError::LogsCorrupt);
    }

    let base_header = match primary {
        Some(h) => h,
        None => {
            // Adopt the header from the last log whose header is valid,
            // preferring the later log.
            let (earlier, later) = order_by_sequence(parsed1.as_ref(), parsed2.as_ref());
            later
                .and_then(|p| p.header)
                .or_else(|| earlier.and_then(|p| p.header))
                .ok_or(HiveError::LogsCorrupt)?
        }
    };

    if parsed1.is_none() && parsed2.is_none() {
        if base_header.is_clean() {
            return Ok(Recovery {
                header: base_header,
                dirty_pages: Vec::new(),
            });
        }
        return Err(HiveError::NeedsLogs);
    }

    let (earlier, later) = order_by_sequence(parsed1.as_ref(), parsed2.as_ref());

    let mut last_applied = base_header.sequence2;
    let mut dirty_pages = Vec::new();

    if let Some(log) = earlier {
        for entry in &log.entries {
            if entry.sequence_number >= base_header.sequence2 {
                dirty_pages.extend(entry.dirty_pages.iter().cloned());
                last_applied = entry.sequence_number;
            }
        }
    }

    if let Some(log) = later {
        if let Some(first) = log.entries.first() {
            if first.sequence_number == last_applied.wrapping_add(1) {
                for entry in &log.entries {
                    dirty_pages.extend(entry.dirty_pages.iter().cloned());
                    last_applied = entry.sequence_number;
                }
            }
            // else: later log begins with a gap. Its payload is
            // discarded; the caller truncates both log files on disk
            // once recovery succeeds, so the gap is never replayed again.
        }
    }

    let mut header = base_header;
    header.sequence1 = last_applied.wrapping_add(1);
    header.sequence2 = header.sequence1;

    Ok(Recovery {
        header,
        dirty_pages,
    })
}

fn order_by_sequence<'a>(
    a: Option<&'a ParsedLog>,
    b: Option<&'a ParsedLog>,
) -> (Option<&'a ParsedLog>, Option<&'a ParsedLog>) {
    let seq = |p: &ParsedLog| p.header.map(|h| h.sequence1).unwrap_or(0);
    match (a, b) {
        (Some(la), Some(lb)) => {
            if seq(la) <= seq(lb) {
                (Some(la), Some(lb))
            } else {
                (Some(lb), Some(la))
            }
        }
        (Some(la), None) => (Some(la), None),
        (None, Some(lb)) => (Some(lb), None),
        (None, None) => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryStream;

    fn build_header(seq1: u32, seq2: u32) -> HiveHeader {
        HiveHeader {
            sequence1: seq1,
            sequence2: seq2,
            timestamp: 0,
            root_cell: 32,
            length: 4096,
            cluster: 1,
        }
    }

    fn build_log_entry(sequence_number: u32, page_offset: u32, page: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&page_offset.to_le_bytes());
        body.extend_from_slice(&(page.len() as u32).to_le_bytes());
        body.extend_from_slice(page);
        let hash1 = marvin32(&body, MARVIN_SEED);

        let size = (ENTRY_HEADER_SIZE + body.len()) as u32;
        let mut hdr = Vec::with_capacity(ENTRY_HEADER_SIZE);
        hdr.extend_from_slice(b"HvLE");
        hdr.extend_from_slice(&size.to_le_bytes());
        hdr.extend_from_slice(&0u32.to_le_bytes()); // flags
        hdr.extend_from_slice(&sequence_number.to_le_bytes());
        hdr.extend_from_slice(&hash1.to_le_bytes());
        hdr.extend_from_slice(&0u64.to_le_bytes()); // hash2 placeholder
        hdr.extend_from_slice(&1u32.to_le_bytes()); // dirty_page_count

        let hash2 = marvin32(&hdr[0..32], MARVIN_SEED);
        hdr[24..32].copy_from_slice(&hash2.to_le_bytes());

        let mut out = hdr;
        out.extend_from_slice(&body);
        out
    }

    fn build_log(header: HiveHeader, entries: &[Vec<u8>]) -> Vec<u8> {
        let mut out = header.encode().to_vec();
        out.resize(LOG_ENTRIES_START as usize, 0);
        for e in entries {
            out.extend_from_slice(e);
        }
        out
    }

    #[test]
    fn replays_a_single_dirty_page_from_one_valid_log() {
        let hive_header = build_header(42, 42);
        let page = vec![0xABu8; 16];
        let entry = build_log_entry(42, 0x2000, &page);
        let log1_bytes = build_log(build_header(42, 42), &[entry]);

        let log1 = Rc::new(RefCell::new(MemoryStream::from_vec(log1_bytes)));
        let recovery = recover::<MemoryStream>(Some(hive_header), Some(log1), None).unwrap();

        assert_eq!(recovery.header.sequence1, 43);
        assert_eq!(recovery.header.sequence2, 43);
        assert_eq!(recovery.dirty_pages.len(), 1);
        assert_eq!(recovery.dirty_pages[0].1, page);
    }

    #[test]
    fn discards_later_log_when_it_begins_with_a_gap() {
        let hive_header = build_header(10, 10);
        let early_entry = build_log_entry(10, 0x1000, &[1, 2, 3, 4]);
        let log1_bytes = build_log(build_header(10, 10), &[early_entry]);

        // Later log's first sequence (12) leaves a gap after 11.
        let later_entry = build_log_entry(12, 0x3000, &[9, 9, 9, 9]);
        let log2_bytes = build_log(build_header(11, 11), &[later_entry]);

        let log1 = Rc::new(RefCell::new(MemoryStream::from_vec(log1_bytes)));
        let log2 = Rc::new(RefCell::new(MemoryStream::from_vec(log2_bytes)));
        let recovery =
            recover::<MemoryStream>(Some(hive_header), Some(log1), Some(log2)).unwrap();

        assert_eq!(recovery.header.sequence1, 11);
        assert_eq!(recovery.dirty_pages.len(), 1);
    }
}
