//! # Disk Pages and In-Memory Images
//!
//! Every disk page image begins with a 16-byte header followed by
//! type-dependent cells. The header is read in place with `zerocopy`; the
//! cells are indexed into the disk buffer so a mapped read never copies
//! payload bytes.
//!
//! ## Header layout (16 bytes)
//!
//! ```text
//! Offset  Size  Field        Description
//! ------  ----  -----------  ----------------------------------------
//! 0       4     magic        Page magic ("KPG1")
//! 4       1     page_type    ColFix / ColVar / RowLeaf
//! 5       1     flags        PAGE_FLAG_SPILLED and future bits
//! 6       2     entry_count  Number of cells
//! 8       8     start_recno  First record number (column pages)
//! ```
//!
//! ## Cell layouts
//!
//! - **ColFix**: `entry_count` cells of exactly 8 bytes; record numbers
//!   are implicit, `start_recno + index`.
//! - **ColVar**: per cell, an absolute record number (recno encoding,
//!   strictly ascending) then a length-prefixed value.
//! - **RowLeaf**: per cell, a length-prefixed key (strictly ascending by
//!   byte order) then a length-prefixed value.
//!
//! ## Image ownership
//!
//! A parsed `PageImage` owns its `DiskBytes` buffer; entries reference
//! ranges of it. Entries added after the fact (lookaside instantiation for
//! a key with no on-page cell, or the empty leaf synthesized for a deleted
//! ref) carry owned keys and no on-page value. Each entry optionally heads
//! an update chain; the chain is exclusively owned by the entry and is
//! dropped with the image.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::encoding::decode_recno;
use crate::error::{Result, StoreError};
use crate::mvcc::update::UpdateRecord;
use crate::mvcc::TxnId;

use super::block::DiskBytes;

pub const PAGE_MAGIC: u32 = 0x3147_504B; // "KPG1" little-endian

/// Fixed header prefix of every disk page image.
pub const DISK_PAGE_HEADER_SIZE: usize = 16;

/// Set when updates for this page may have been spilled to the lookaside
/// table at eviction time. The flag is a hint: the scan may find nothing.
pub const PAGE_FLAG_SPILLED: u8 = 0x01;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Unknown = 0x00,
    /// Fixed-width column leaf: 8-byte cells, implicit record numbers.
    ColFix = 0x01,
    /// Variable-width column leaf: explicit record numbers.
    ColVar = 0x02,
    /// Row leaf: byte-string keys.
    RowLeaf = 0x03,
}

impl PageType {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x01 => PageType::ColFix,
            0x02 => PageType::ColVar,
            0x03 => PageType::RowLeaf,
            _ => PageType::Unknown,
        }
    }

    pub fn is_column(self) -> bool {
        matches!(self, PageType::ColFix | PageType::ColVar)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct DiskPageHeader {
    pub magic: u32,
    pub page_type: u8,
    pub flags: u8,
    pub entry_count: u16,
    pub start_recno: u64,
}

const _: () = assert!(size_of::<DiskPageHeader>() == DISK_PAGE_HEADER_SIZE);

impl DiskPageHeader {
    /// Serialized header bytes; page writers and fixtures prepend these to
    /// the cell area.
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out.copy_from_slice(self.as_bytes());
        out
    }

    /// Reads the header by value. Blocks sit at arbitrary file offsets, so
    /// the bytes carry no alignment guarantee and an in-place reference
    /// cast is not an option.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < DISK_PAGE_HEADER_SIZE {
            return Err(StoreError::format(format!(
                "buffer too small for page header: {} < {}",
                data.len(),
                DISK_PAGE_HEADER_SIZE
            )));
        }
        Self::read_from_bytes(&data[..DISK_PAGE_HEADER_SIZE])
            .map_err(|e| StoreError::format(format!("failed to read page header: {e:?}")))
    }
}

/// Key of one page entry. Disk-backed row keys are ranges into the image's
/// buffer; keys created by instantiation are owned.
#[derive(Debug, Clone)]
pub enum EntryKey {
    Recno(u64),
    RowDisk { start: u32, len: u32 },
    RowOwned(Vec<u8>),
}

#[derive(Debug)]
pub struct PageEntry {
    key: EntryKey,
    /// On-page value range; `None` for entries with no disk cell.
    value: Option<(u32, u32)>,
    updates: Option<Box<UpdateRecord>>,
}

impl PageEntry {
    pub fn updates(&self) -> Option<&UpdateRecord> {
        self.updates.as_deref()
    }
}

#[derive(Debug)]
pub struct PageImage {
    page_type: PageType,
    flags: u8,
    disk: Option<DiskBytes>,
    entries: Vec<PageEntry>,
    mem_footprint: usize,
    dirty: bool,
}

impl PageImage {
    /// Parses a disk image, taking ownership of the buffer. The payload is
    /// never copied; entries index into the buffer.
    pub fn from_disk(disk: DiskBytes) -> Result<Self> {
        let data = disk.as_slice();
        let header = DiskPageHeader::from_bytes(data)?;
        if header.magic != PAGE_MAGIC {
            return Err(StoreError::format(format!(
                "bad page magic {:#010x}",
                header.magic
            )));
        }
        let page_type = PageType::from_byte(header.page_type);
        if page_type == PageType::Unknown {
            return Err(StoreError::format(format!(
                "unknown page type {:#04x}",
                header.page_type
            )));
        }

        let count = header.entry_count as usize;
        let start_recno = header.start_recno;
        let flags = header.flags;
        let mut entries = Vec::with_capacity(count);
        let mut pos = DISK_PAGE_HEADER_SIZE;

        match page_type {
            PageType::ColFix => {
                for i in 0..count {
                    if pos + 8 > data.len() {
                        return Err(StoreError::format("fixed-column page truncated"));
                    }
                    entries.push(PageEntry {
                        key: EntryKey::Recno(start_recno + i as u64),
                        value: Some((pos as u32, 8)),
                        updates: None,
                    });
                    pos += 8;
                }
            }
            PageType::ColVar => {
                let mut prev_recno = None;
                for _ in 0..count {
                    let (recno, n) = decode_recno(&data[pos..])?;
                    pos += n;
                    if prev_recno.is_some_and(|prev| recno <= prev) {
                        return Err(StoreError::format(format!(
                            "record numbers out of order at recno {recno}"
                        )));
                    }
                    prev_recno = Some(recno);
                    let (start, len) = read_cell(data, &mut pos)?;
                    entries.push(PageEntry {
                        key: EntryKey::Recno(recno),
                        value: Some((start, len)),
                        updates: None,
                    });
                }
            }
            PageType::RowLeaf => {
                let mut prev_key: Option<(u32, u32)> = None;
                for _ in 0..count {
                    let (kstart, klen) = read_cell(data, &mut pos)?;
                    let key = &data[kstart as usize..(kstart + klen) as usize];
                    if let Some((ps, pl)) = prev_key {
                        let prev = &data[ps as usize..(ps + pl) as usize];
                        if key <= prev {
                            return Err(StoreError::format("row keys out of order"));
                        }
                    }
                    prev_key = Some((kstart, klen));
                    let (vstart, vlen) = read_cell(data, &mut pos)?;
                    entries.push(PageEntry {
                        key: EntryKey::RowDisk {
                            start: kstart,
                            len: klen,
                        },
                        value: Some((vstart, vlen)),
                        updates: None,
                    });
                }
            }
            PageType::Unknown => unreachable!(),
        }

        Ok(Self {
            page_type,
            flags,
            disk: Some(disk),
            entries,
            mem_footprint: 0,
            dirty: false,
        })
    }

    /// Synthesizes an empty row leaf with no backing disk image. Used when
    /// a deleted ref with no address is re-created by a search or insert.
    pub fn empty_leaf() -> Self {
        Self {
            page_type: PageType::RowLeaf,
            flags: 0,
            disk: None,
            entries: Vec::new(),
            mem_footprint: 0,
            dirty: false,
        }
    }

    pub fn page_type(&self) -> PageType {
        self.page_type
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn has_spilled_updates(&self) -> bool {
        self.flags & PAGE_FLAG_SPILLED != 0
    }

    pub fn is_mapped(&self) -> bool {
        self.disk.as_ref().is_some_and(DiskBytes::is_mapped)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn entry(&self, index: usize) -> &PageEntry {
        &self.entries[index]
    }

    pub fn recno(&self, index: usize) -> Option<u64> {
        match self.entries[index].key {
            EntryKey::Recno(recno) => Some(recno),
            _ => None,
        }
    }

    pub fn row_key(&self, index: usize) -> Option<&[u8]> {
        self.key_bytes(&self.entries[index].key)
    }

    pub fn value(&self, index: usize) -> Option<&[u8]> {
        let (start, len) = self.entries[index].value?;
        let disk = self.disk.as_ref()?;
        Some(&disk.as_slice()[start as usize..(start + len) as usize])
    }

    pub fn updates(&self, index: usize) -> Option<&UpdateRecord> {
        self.entries[index].updates()
    }

    fn key_bytes<'a>(&'a self, key: &'a EntryKey) -> Option<&'a [u8]> {
        match key {
            EntryKey::Recno(_) => None,
            EntryKey::RowDisk { start, len } => {
                let disk = self.disk.as_ref()?;
                Some(&disk.as_slice()[*start as usize..(*start + *len) as usize])
            }
            EntryKey::RowOwned(bytes) => Some(bytes),
        }
    }

    /// Position of the entry for a record number, or the insertion point.
    pub fn search_recno(&self, recno: u64) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by(|e| match e.key {
            EntryKey::Recno(r) => r.cmp(&recno),
            _ => std::cmp::Ordering::Less,
        })
    }

    /// Position of the entry for a row key, or the insertion point.
    pub fn search_row(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by(|e| {
            let mine = self.key_bytes(&e.key).unwrap_or(&[]);
            mine.cmp(key)
        })
    }

    /// Attaches an update chain to the entry for a record number, creating
    /// the entry if the page has no cell for it.
    pub fn attach_recno_updates(&mut self, recno: u64, chain: Box<UpdateRecord>) {
        match self.search_recno(recno) {
            Ok(index) => self.link_chain(index, chain),
            Err(index) => self.entries.insert(
                index,
                PageEntry {
                    key: EntryKey::Recno(recno),
                    value: None,
                    updates: Some(chain),
                },
            ),
        }
    }

    /// Attaches an update chain to the entry for a row key, creating the
    /// entry if the page has no cell for it.
    pub fn attach_row_updates(&mut self, key: &[u8], chain: Box<UpdateRecord>) {
        match self.search_row(key) {
            Ok(index) => self.link_chain(index, chain),
            Err(index) => self.entries.insert(
                index,
                PageEntry {
                    key: EntryKey::RowOwned(key.to_vec()),
                    value: None,
                    updates: Some(chain),
                },
            ),
        }
    }

    fn link_chain(&mut self, index: usize, mut chain: Box<UpdateRecord>) {
        // New chain head replaces the slot; any existing chain becomes the
        // tail of the new one.
        if let Some(existing) = self.entries[index].updates.take() {
            chain.append_tail(existing);
        }
        self.entries[index].updates = Some(chain);
    }

    /// Rebuilds the tombstone view of a logically deleted page: every
    /// on-page entry gains a tombstone update stamped with the deleting
    /// transaction.
    pub fn instantiate_deleted(&mut self, txn_id: TxnId) {
        let mut total = 0usize;
        for entry in &mut self.entries {
            let (tombstone, incr) = UpdateRecord::tombstone(txn_id);
            total += incr;
            let mut chain = tombstone;
            if let Some(existing) = entry.updates.take() {
                chain.append_tail(existing);
            }
            entry.updates = Some(chain);
        }
        self.mem_footprint += total;
        self.dirty = true;
    }

    pub fn memory_footprint(&self) -> usize {
        self.mem_footprint
    }

    pub fn incr_memory(&mut self, bytes: usize) {
        self.mem_footprint += bytes;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }
}

/// Reads one length-prefixed cell, returning its (start, len) range.
fn read_cell(data: &[u8], pos: &mut usize) -> Result<(u32, u32)> {
    let (len, n) = decode_recno(&data[*pos..])?;
    *pos += n;
    let len = usize::try_from(len).map_err(|_| StoreError::format("cell length out of range"))?;
    if *pos + len > data.len() {
        return Err(StoreError::format(format!(
            "cell [{}, {}) past end of page ({} bytes)",
            *pos,
            *pos + len,
            data.len()
        )));
    }
    let range = (*pos as u32, len as u32);
    *pos += len;
    Ok(range)
}
