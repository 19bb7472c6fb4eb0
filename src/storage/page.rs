//! # Page Types and On-Page Header Layout
//!
//! This module defines the page-level structures for TalusDB's storage layer.
//! Every structure here is persisted byte-for-byte inside pages, so layouts
//! are `#[repr(C)]` with explicit reserved fields and validated through
//! `zerocopy` transmutation.
//!
//! ## Page Roles
//!
//! A page plays exactly one role at a time, tracked in the pager's page-state
//! table (see [`flags`]):
//!
//! - **State** (0x08): page 0 (file header) and the runs holding the
//!   serialized catalog and page-state table.
//! - **RawData** (0x01): section header pages and section data pages.
//! - **Overflow | RawData** (0x03): the first page of an overflow run; the
//!   remaining pages of the run carry only Overflow.
//! - **Compressed** (0x04): set alongside Overflow when the run holds a
//!   compressed entry.
//!
//! ## Section Header Page Layout (64 bytes used)
//!
//! ```text
//! Offset  Size  Field            Description
//! ------  ----  ---------------  ----------------------------------------
//! 0       8     owner_hash       Hash identifying the owning table
//! 8       8     used_bytes       Live bytes (headers included) in the section
//! 16      1     table_type       Schema table-type byte
//! 17      1     reserved
//! 18      2     number_of_pages  Data pages following this header page
//! 20      2     alloc_hint       Data page index to try allocating in first
//! 22      2     reserved
//! 24      32    dict_hash        Compression dictionary hash (all-zero = none)
//! 56      4     min_ratio        Best (lowest) compression percentage observed
//! 60      4     reserved
//! ```
//!
//! ## Section Data Page Layout (16-byte header)
//!
//! ```text
//! Offset  Size  Field            Description
//! ------  ----  ---------------  ----------------------------------------
//! 0       8     section_page     Page number of the owning section header
//! 8       2     next_alloc       Bump pointer for fresh allocations
//! 10      2     used_bytes       Live bytes (entry headers included)
//! 12      2     live_entries     Number of non-free entries
//! 14      2     reserved
//! ```
//!
//! Entries follow back-to-back from offset 16, each prefixed by a 4-byte
//! entry header (see `section` module). A storage id points at the entry's
//! payload, so `id % PAGE_SIZE` is always at least 20 for small entries and
//! exactly 0 for overflow runs. Every routing decision in the engine rests on
//! that distinction.
//!
//! ## Overflow Run Layout (16-byte header on the first page)
//!
//! ```text
//! Offset  Size  Field            Description
//! ------  ----  ---------------  ----------------------------------------
//! 0       8     owner_hash       Hash identifying the owning table
//! 8       4     overflow_size    Payload length in bytes
//! 12      1     table_type       Schema table-type byte
//! 13      1     flags            COMPRESSED when the payload is compressed
//! 14      2     reserved
//! ```
//!
//! The payload starts at offset 16 of the first page and continues
//! contiguously across the run.
//!
//! ## Zero-Copy Access
//!
//! All structs use `zerocopy` for safe transmutation from raw page bytes, so
//! headers are read directly from the mapped file without copying.

use eyre::{ensure, Result};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::PAGE_SIZE;

/// Per-page role flags stored in the pager's page-state table.
pub mod flags {
    /// Unallocated page.
    pub const FREE: u8 = 0x00;
    /// Section header or section data page; also set on the first page of
    /// an overflow run so ownership checks can read its header.
    pub const RAW_DATA: u8 = 0x01;
    /// Page belongs to an overflow run.
    pub const OVERFLOW: u8 = 0x02;
    /// Overflow run holds a compressed payload.
    pub const COMPRESSED: u8 = 0x04;
    /// File header, catalog, or page-state page.
    pub const STATE: u8 = 0x08;
}

/// Magic bytes in the file header: `"TALUSDB\0"` little-endian.
pub const FILE_MAGIC: u64 = u64::from_le_bytes(*b"TALUSDB\0");

/// Current on-disk format version.
pub const FORMAT_VERSION: u32 = 3;

/// Returns true when `id` addresses an overflow run rather than a small
/// entry inside a section.
#[inline]
pub fn is_overflow_id(id: u64) -> bool {
    id % PAGE_SIZE as u64 == 0
}

/// Splits a storage id into `(page_number, offset_in_page)`.
#[inline]
pub fn split_id(id: u64) -> (u64, usize) {
    (id / PAGE_SIZE as u64, (id % PAGE_SIZE as u64) as usize)
}

/// Builds a storage id from a page number and an offset within the page.
#[inline]
pub fn make_id(page: u64, offset: usize) -> u64 {
    debug_assert!(offset < PAGE_SIZE);
    page * PAGE_SIZE as u64 + offset as u64
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct FileHeader {
    pub magic: u64,
    pub version: u32,
    pub page_size: u32,
    pub page_count: u64,
    pub state_page: u64,
    pub catalog_page: u64,
    pub state_pages: u32,
    pub catalog_pages: u32,
    pub state_len: u64,
    pub catalog_len: u64,
    pub state_crc: u32,
    pub catalog_crc: u32,
}

impl FileHeader {
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= size_of::<Self>(),
            "buffer too small for FileHeader: {} < {}",
            data.len(),
            size_of::<Self>()
        );
        Self::ref_from_bytes(&data[..size_of::<Self>()])
            .map_err(|e| eyre::eyre!("failed to read FileHeader: {:?}", e))
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= size_of::<Self>(),
            "buffer too small for FileHeader: {} < {}",
            data.len(),
            size_of::<Self>()
        );
        Self::mut_from_bytes(&mut data[..size_of::<Self>()])
            .map_err(|e| eyre::eyre!("failed to read FileHeader: {:?}", e))
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.magic == FILE_MAGIC,
            "bad file magic: {:016x} != {:016x}",
            self.magic,
            FILE_MAGIC
        );
        ensure!(
            self.version == FORMAT_VERSION,
            "unsupported format version: {} != {}",
            self.version,
            FORMAT_VERSION
        );
        ensure!(
            self.page_size == PAGE_SIZE as u32,
            "page size mismatch: file {} != build {}",
            self.page_size,
            PAGE_SIZE
        );
        Ok(())
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SectionHeader {
    pub owner_hash: u64,
    pub used_bytes: u64,
    pub table_type: u8,
    reserved0: u8,
    pub number_of_pages: u16,
    pub alloc_hint: u16,
    reserved1: u16,
    pub dict_hash: [u8; 32],
    pub min_ratio: i32,
    reserved2: [u8; 4],
}

impl SectionHeader {
    pub fn new(owner_hash: u64, table_type: u8, number_of_pages: u16, dict_hash: [u8; 32]) -> Self {
        Self {
            owner_hash,
            used_bytes: 0,
            table_type,
            reserved0: 0,
            number_of_pages,
            alloc_hint: 0,
            reserved1: 0,
            dict_hash,
            min_ratio: crate::config::EXPECTED_RATIO_NONE,
            reserved2: [0; 4],
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= size_of::<Self>(),
            "buffer too small for SectionHeader: {} < {}",
            data.len(),
            size_of::<Self>()
        );
        Self::ref_from_bytes(&data[..size_of::<Self>()])
            .map_err(|e| eyre::eyre!("failed to read SectionHeader: {:?}", e))
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= size_of::<Self>(),
            "buffer too small for SectionHeader: {} < {}",
            data.len(),
            size_of::<Self>()
        );
        Self::mut_from_bytes(&mut data[..size_of::<Self>()])
            .map_err(|e| eyre::eyre!("failed to read SectionHeader: {:?}", e))
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SectionDataHeader {
    pub section_page: u64,
    pub next_alloc: u16,
    pub used_bytes: u16,
    pub live_entries: u16,
    reserved: u16,
}

impl SectionDataHeader {
    pub fn new(section_page: u64) -> Self {
        Self {
            section_page,
            next_alloc: crate::config::SECTION_DATA_HEADER_SIZE as u16,
            used_bytes: 0,
            live_entries: 0,
            reserved: 0,
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= size_of::<Self>(),
            "buffer too small for SectionDataHeader: {} < {}",
            data.len(),
            size_of::<Self>()
        );
        Self::ref_from_bytes(&data[..size_of::<Self>()])
            .map_err(|e| eyre::eyre!("failed to read SectionDataHeader: {:?}", e))
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= size_of::<Self>(),
            "buffer too small for SectionDataHeader: {} < {}",
            data.len(),
            size_of::<Self>()
        );
        Self::mut_from_bytes(&mut data[..size_of::<Self>()])
            .map_err(|e| eyre::eyre!("failed to read SectionDataHeader: {:?}", e))
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct OverflowHeader {
    pub owner_hash: u64,
    pub overflow_size: u32,
    pub table_type: u8,
    pub flags: u8,
    reserved: u16,
}

impl OverflowHeader {
    pub fn new(owner_hash: u64, table_type: u8, overflow_size: u32, compressed: bool) -> Self {
        Self {
            owner_hash,
            overflow_size,
            table_type,
            flags: if compressed { flags::COMPRESSED } else { 0 },
            reserved: 0,
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & flags::COMPRESSED != 0
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= size_of::<Self>(),
            "buffer too small for OverflowHeader: {} < {}",
            data.len(),
            size_of::<Self>()
        );
        Self::ref_from_bytes(&data[..size_of::<Self>()])
            .map_err(|e| eyre::eyre!("failed to read OverflowHeader: {:?}", e))
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= size_of::<Self>(),
            "buffer too small for OverflowHeader: {} < {}",
            data.len(),
            size_of::<Self>()
        );
        Self::mut_from_bytes(&mut data[..size_of::<Self>()])
            .map_err(|e| eyre::eyre!("failed to read OverflowHeader: {:?}", e))
    }
}
