//! # Raw-Data Sections — Slab Allocation for Small Entries
//!
//! A section is a contiguous run of pages owned by one table: a header page
//! followed by `number_of_pages` data pages. Many small entries pack into
//! the data pages; entries too large for a section are routed by the table
//! to overflow runs instead.
//!
//! ## Entry Layout
//!
//! Entries sit back-to-back in a data page after its 16-byte header, each
//! prefixed by a 4-byte entry header:
//!
//! ```text
//! Offset  Size  Field           Description
//! ------  ----  --------------  -----------------------------------------
//! 0       2     allocated_size  Payload capacity of this slot
//! 2       2     used            bits 0..13 payload length
//!                               bit 14 = slot is free
//!                               bit 15 = payload is compressed
//! ```
//!
//! A storage id addresses the payload, not the header, so the id of a small
//! entry is never a page multiple. Given only an id, [`direct_read`]
//! recovers the payload span and compression flag; the data page's header
//! names the owning section, so reads work across sections — old ids stay
//! readable during a compaction window.
//!
//! ## Allocation
//!
//! Two-phase first fit, starting from the section's allocation hint:
//!
//! 1. Bump allocation at each data page's `next_alloc`.
//! 2. Reuse of freed slots whose `allocated_size` fits the request.
//!
//! Freeing the slot adjacent to `next_alloc` rewinds the bump pointer;
//! interior frees leave a hole for reuse. When a page's dead space exceeds
//! a quarter page, the page is defragmented in place: live entries slide
//! down, their ids change, and the relocation observer is invoked for every
//! move *before* the caller regains control — the observer must rewrite any
//! structure that referenced the old id, or invariants are gone for good.
//!
//! ## Density
//!
//! `free` returns the section's post-free density (live bytes over data
//! capacity). The table's delete path uses it to decide between leaving the
//! section alone, tracking it as a reuse candidate, or compacting it away.

use eyre::{ensure, Result};
use tracing::trace;

use crate::arena::ScratchArena;
use crate::config::{
    ENTRY_HEADER_SIZE, MAX_ITEM_SIZE, MAX_SECTION_DATA_PAGES, PAGE_SIZE, SECTION_DATA_HEADER_SIZE,
};
use crate::env::EnvState;
use crate::storage::{flags, make_id, split_id, Pager, SectionDataHeader, SectionHeader};

const USED_COMPRESSED: u16 = 0x8000;
const USED_FREE: u16 = 0x4000;
const USED_MASK: u16 = 0x3FFF;

/// Dead bytes per page tolerated before defragmentation kicks in.
const DEFRAG_SLACK: usize = PAGE_SIZE / 4;

/// Observer invoked for every entry relocated inside the section. Receives
/// the old id, the new id, and the raw stored payload.
pub type DataMovedObserver<'a> =
    dyn FnMut(&mut EnvState, u64, u64, &[u8]) -> Result<()> + 'a;

/// A raw payload span resolved from a storage id.
#[derive(Debug, Clone, Copy)]
pub struct RawEntry<'p> {
    pub data: &'p [u8],
    pub compressed: bool,
}

fn read_entry_header(page: &[u8], hdr_off: usize) -> (usize, usize, bool, bool) {
    let allocated = u16::from_le_bytes([page[hdr_off], page[hdr_off + 1]]) as usize;
    let used = u16::from_le_bytes([page[hdr_off + 2], page[hdr_off + 3]]);
    (
        allocated,
        (used & USED_MASK) as usize,
        used & USED_COMPRESSED != 0,
        used & USED_FREE != 0,
    )
}

fn write_entry_header(
    page: &mut [u8],
    hdr_off: usize,
    allocated: usize,
    used: usize,
    compressed: bool,
    free: bool,
) {
    debug_assert!(allocated <= USED_MASK as usize && used <= allocated);
    let mut used_word = used as u16;
    if compressed {
        used_word |= USED_COMPRESSED;
    }
    if free {
        used_word |= USED_FREE;
    }
    page[hdr_off..hdr_off + 2].copy_from_slice(&(allocated as u16).to_le_bytes());
    page[hdr_off + 2..hdr_off + 4].copy_from_slice(&used_word.to_le_bytes());
}

/// Resolves the payload of any small-entry id, regardless of which section
/// owns it. Static on purpose: compaction reads old ids while the new
/// section is already active.
pub fn direct_read(pager: &Pager, id: u64) -> Result<RawEntry<'_>> {
    let (page_no, offset) = split_id(id);
    ensure!(
        offset >= SECTION_DATA_HEADER_SIZE + ENTRY_HEADER_SIZE,
        "storage id {} does not address a small entry",
        id
    );
    let page = pager.page(page_no)?;
    let hdr_off = offset - ENTRY_HEADER_SIZE;
    let (allocated, used, compressed, free) = read_entry_header(page, hdr_off);
    ensure!(!free, "storage id {} addresses a freed entry", id);
    ensure!(
        offset + allocated <= PAGE_SIZE && used <= allocated,
        "corrupt entry header at id {}",
        id
    );
    Ok(RawEntry {
        data: &page[offset..offset + used],
        compressed,
    })
}

/// Page number of the section header owning a small-entry id.
pub fn section_of(pager: &Pager, id: u64) -> Result<u64> {
    let (page_no, offset) = split_id(id);
    ensure!(
        offset >= SECTION_DATA_HEADER_SIZE + ENTRY_HEADER_SIZE,
        "storage id {} does not address a small entry",
        id
    );
    let header = SectionDataHeader::from_bytes(pager.page(page_no)?)?;
    Ok(header.section_page)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawDataSection {
    page: u64,
}

impl RawDataSection {
    /// Allocates a fresh section: one header page plus `data_pages` data
    /// pages, physically contiguous.
    pub fn create(
        pager: &mut Pager,
        owner_hash: u64,
        table_type: u8,
        data_pages: usize,
        dict_hash: [u8; 32],
    ) -> Result<Self> {
        ensure!(
            data_pages >= 1 && data_pages <= MAX_SECTION_DATA_PAGES,
            "section size {} outside 1..={}",
            data_pages,
            MAX_SECTION_DATA_PAGES
        );
        let first = pager.allocate(1 + data_pages as u64, flags::RAW_DATA)?;
        *SectionHeader::from_bytes_mut(pager.page_mut(first)?)? =
            SectionHeader::new(owner_hash, table_type, data_pages as u16, dict_hash);
        for i in 0..data_pages as u64 {
            *SectionDataHeader::from_bytes_mut(pager.page_mut(first + 1 + i)?)? =
                SectionDataHeader::new(first);
        }
        trace!(section = first, data_pages, "created raw-data section");
        Ok(Self { page: first })
    }

    /// View over an existing section's header page.
    pub fn open(page: u64) -> Self {
        Self { page }
    }

    pub fn page_number(&self) -> u64 {
        self.page
    }

    pub fn header<'p>(&self, pager: &'p Pager) -> Result<&'p SectionHeader> {
        SectionHeader::from_bytes(pager.page(self.page)?)
    }

    pub fn data_pages(&self, pager: &Pager) -> Result<usize> {
        Ok(self.header(pager)?.number_of_pages as usize)
    }

    pub fn density(&self, pager: &Pager) -> Result<f64> {
        let header = self.header(pager)?;
        let capacity =
            header.number_of_pages as usize * (PAGE_SIZE - SECTION_DATA_HEADER_SIZE);
        Ok(header.used_bytes as f64 / capacity as f64)
    }

    pub fn dictionary_hash(&self, pager: &Pager) -> Result<[u8; 32]> {
        Ok(self.header(pager)?.dict_hash)
    }

    pub fn min_compression_ratio(&self, pager: &Pager) -> Result<i32> {
        Ok(self.header(pager)?.min_ratio)
    }

    /// Records a per-entry compression ratio; the header keeps the minimum
    /// (best) observed, which gates dictionary retraining.
    pub fn set_compression_rate(&self, pager: &mut Pager, ratio: i32) -> Result<()> {
        let header = SectionHeader::from_bytes_mut(pager.page_mut(self.page)?)?;
        if ratio < header.min_ratio {
            header.min_ratio = ratio;
        }
        Ok(())
    }

    /// Reserves space for `size` payload bytes. Returns the new id, or
    /// `None` when no data page can take the request.
    pub fn try_allocate(&self, pager: &mut Pager, size: usize) -> Result<Option<u64>> {
        if size + ENTRY_HEADER_SIZE > MAX_ITEM_SIZE {
            return Ok(None);
        }

        let header = *self.header(pager)?;
        let pages = header.number_of_pages as usize;
        let hint = (header.alloc_hint as usize).min(pages.saturating_sub(1));

        // Bump phase, then slot-reuse phase.
        for reuse in [false, true] {
            for step in 0..pages {
                let page_idx = (hint + step) % pages;
                let page_no = self.page + 1 + page_idx as u64;
                let placed = if reuse {
                    self.try_reuse_in_page(pager, page_no, size)?
                } else {
                    self.try_bump_in_page(pager, page_no, size)?
                };
                if let Some((offset, delta)) = placed {
                    let header = SectionHeader::from_bytes_mut(pager.page_mut(self.page)?)?;
                    header.alloc_hint = page_idx as u16;
                    header.used_bytes += delta as u64;
                    return Ok(Some(make_id(page_no, offset)));
                }
            }
        }
        Ok(None)
    }

    fn try_bump_in_page(
        &self,
        pager: &mut Pager,
        page_no: u64,
        size: usize,
    ) -> Result<Option<(usize, usize)>> {
        let page = pager.page_mut(page_no)?;
        let hdr_off = SectionDataHeader::from_bytes(page)?.next_alloc as usize;
        if hdr_off + ENTRY_HEADER_SIZE + size > PAGE_SIZE {
            return Ok(None);
        }
        write_entry_header(page, hdr_off, size, size, false, false);
        let delta = ENTRY_HEADER_SIZE + size;
        let header = SectionDataHeader::from_bytes_mut(page)?;
        header.next_alloc = (hdr_off + delta) as u16;
        header.used_bytes += delta as u16;
        header.live_entries += 1;
        Ok(Some((hdr_off + ENTRY_HEADER_SIZE, delta)))
    }

    fn try_reuse_in_page(
        &self,
        pager: &mut Pager,
        page_no: u64,
        size: usize,
    ) -> Result<Option<(usize, usize)>> {
        let page = pager.page_mut(page_no)?;
        let end = SectionDataHeader::from_bytes(page)?.next_alloc as usize;
        let mut hdr_off = SECTION_DATA_HEADER_SIZE;
        while hdr_off + ENTRY_HEADER_SIZE <= end {
            let (allocated, _, _, free) = read_entry_header(page, hdr_off);
            if free && allocated >= size {
                write_entry_header(page, hdr_off, allocated, size, false, false);
                let delta = ENTRY_HEADER_SIZE + allocated;
                let header = SectionDataHeader::from_bytes_mut(page)?;
                header.used_bytes += delta as u16;
                header.live_entries += 1;
                return Ok(Some((hdr_off + ENTRY_HEADER_SIZE, delta)));
            }
            hdr_off += ENTRY_HEADER_SIZE + allocated;
        }
        Ok(None)
    }

    /// Writes `data` into a previously allocated or still-fitting slot.
    /// Returns false when the slot cannot take `data.len()` bytes.
    pub fn try_write_direct(
        &self,
        pager: &mut Pager,
        id: u64,
        data: &[u8],
        compressed: bool,
    ) -> Result<bool> {
        let (page_no, offset) = split_id(id);
        ensure!(
            offset >= SECTION_DATA_HEADER_SIZE + ENTRY_HEADER_SIZE,
            "storage id {} does not address a small entry",
            id
        );
        let page = pager.page_mut(page_no)?;
        let hdr_off = offset - ENTRY_HEADER_SIZE;
        let (allocated, _, _, free) = read_entry_header(page, hdr_off);
        ensure!(!free, "write into freed entry {}", id);
        if data.len() > allocated {
            return Ok(false);
        }
        write_entry_header(page, hdr_off, allocated, data.len(), compressed, false);
        page[offset..offset + data.len()].copy_from_slice(data);
        Ok(true)
    }

    /// True when `id` falls inside this section's data pages and addresses
    /// a live entry.
    pub fn contains(&self, pager: &Pager, id: u64) -> Result<bool> {
        let (page_no, offset) = split_id(id);
        let header = self.header(pager)?;
        let first = self.page + 1;
        let last = self.page + header.number_of_pages as u64;
        if page_no < first || page_no > last {
            return Ok(false);
        }
        if offset < SECTION_DATA_HEADER_SIZE + ENTRY_HEADER_SIZE {
            return Ok(false);
        }
        Ok(direct_read(pager, id).is_ok())
    }

    /// Ownership check: does the section containing `id` carry this owner
    /// hash? Static, like [`direct_read`].
    pub fn is_owned(pager: &Pager, id: u64, owner_hash: u64) -> Result<bool> {
        let section_page = section_of(pager, id)?;
        let header = SectionHeader::from_bytes(pager.page(section_page)?)?;
        Ok(header.owner_hash == owner_hash)
    }

    /// Ids of every live entry, ascending by page then offset.
    pub fn get_all_ids(&self, pager: &Pager) -> Result<Vec<u64>> {
        let pages = self.data_pages(pager)?;
        let mut ids = Vec::new();
        for i in 0..pages as u64 {
            let page_no = self.page + 1 + i;
            let page = pager.page(page_no)?;
            let end = SectionDataHeader::from_bytes(page)?.next_alloc as usize;
            let mut hdr_off = SECTION_DATA_HEADER_SIZE;
            while hdr_off + ENTRY_HEADER_SIZE <= end {
                let (allocated, _, _, free) = read_entry_header(page, hdr_off);
                if !free {
                    ids.push(make_id(page_no, hdr_off + ENTRY_HEADER_SIZE));
                }
                hdr_off += ENTRY_HEADER_SIZE + allocated;
            }
        }
        Ok(ids)
    }

    /// Frees one entry and returns the section's post-free density. May
    /// defragment the containing page; every entry that moves is announced
    /// through `observer` before this call returns.
    pub fn free(
        &self,
        state: &mut EnvState,
        id: u64,
        observer: &mut DataMovedObserver<'_>,
    ) -> Result<f64> {
        let (page_no, offset) = split_id(id);
        ensure!(
            offset >= SECTION_DATA_HEADER_SIZE + ENTRY_HEADER_SIZE,
            "storage id {} does not address a small entry",
            id
        );

        let reclaimed;
        let needs_defrag;
        {
            let page = state.pager.page_mut(page_no)?;
            let hdr_off = offset - ENTRY_HEADER_SIZE;
            let (allocated, _, _, free) = read_entry_header(page, hdr_off);
            ensure!(!free, "double free of entry {}", id);
            write_entry_header(page, hdr_off, allocated, 0, false, true);
            reclaimed = ENTRY_HEADER_SIZE + allocated;

            let header = SectionDataHeader::from_bytes_mut(page)?;
            header.used_bytes -= reclaimed as u16;
            header.live_entries -= 1;
            if hdr_off + reclaimed == header.next_alloc as usize {
                header.next_alloc = hdr_off as u16;
            }
            let dead = header.next_alloc as usize
                - SECTION_DATA_HEADER_SIZE
                - header.used_bytes as usize;
            needs_defrag = dead > DEFRAG_SLACK && header.live_entries > 0;
        }

        {
            let header = SectionHeader::from_bytes_mut(state.pager.page_mut(self.page)?)?;
            header.used_bytes -= reclaimed as u64;
        }

        if needs_defrag {
            self.defrag_page(state, page_no, observer)?;
        }

        self.density(&state.pager)
    }

    /// Slides live entries to the front of a data page, rewinding the bump
    /// pointer. Ids change; the observer is responsible for every reference.
    fn defrag_page(
        &self,
        state: &mut EnvState,
        page_no: u64,
        observer: &mut DataMovedObserver<'_>,
    ) -> Result<()> {
        let arena = ScratchArena::new();
        let snapshot: &[u8] = arena.copy_of(state.pager.page(page_no)?);
        let old_end = SectionDataHeader::from_bytes(snapshot)?.next_alloc as usize;

        struct Move {
            old_id: u64,
            new_id: u64,
            start: usize,
            len: usize,
        }
        let mut moves: Vec<Move> = Vec::new();

        {
            let page = state.pager.page_mut(page_no)?;
            let mut write_off = SECTION_DATA_HEADER_SIZE;
            let mut read_off = SECTION_DATA_HEADER_SIZE;
            while read_off + ENTRY_HEADER_SIZE <= old_end {
                let (allocated, used, compressed, free) =
                    read_entry_header(snapshot, read_off);
                if !free {
                    write_entry_header(page, write_off, used, used, compressed, false);
                    let data_start = read_off + ENTRY_HEADER_SIZE;
                    page[write_off + ENTRY_HEADER_SIZE..write_off + ENTRY_HEADER_SIZE + used]
                        .copy_from_slice(&snapshot[data_start..data_start + used]);
                    if write_off != read_off || allocated != used {
                        moves.push(Move {
                            old_id: make_id(page_no, data_start),
                            new_id: make_id(page_no, write_off + ENTRY_HEADER_SIZE),
                            start: data_start,
                            len: used,
                        });
                    }
                    write_off += ENTRY_HEADER_SIZE + used;
                }
                read_off += ENTRY_HEADER_SIZE + allocated;
            }
            let header = SectionDataHeader::from_bytes_mut(page)?;
            header.next_alloc = write_off as u16;
            // Slot reuse padding disappears with the slots, so live bytes
            // now equal the packed span.
            header.used_bytes = (write_off - SECTION_DATA_HEADER_SIZE) as u16;
        }

        // Section accounting: recompute from page headers, since packing
        // shrank allocated spans.
        self.recompute_used_bytes(&mut state.pager)?;

        trace!(
            section = self.page,
            page = page_no,
            relocated = moves.len(),
            "defragmented section data page"
        );

        for mv in &moves {
            if mv.old_id != mv.new_id {
                observer(state, mv.old_id, mv.new_id, &snapshot[mv.start..mv.start + mv.len])?;
            }
        }
        Ok(())
    }

    fn recompute_used_bytes(&self, pager: &mut Pager) -> Result<()> {
        let pages = self.data_pages(pager)?;
        let mut used = 0u64;
        for i in 0..pages as u64 {
            let page = pager.page(self.page + 1 + i)?;
            used += SectionDataHeader::from_bytes(page)?.used_bytes as u64;
        }
        let header = SectionHeader::from_bytes_mut(pager.page_mut(self.page)?)?;
        header.used_bytes = used;
        Ok(())
    }

    /// Returns every page of the section to the free pool.
    pub fn destroy(self, pager: &mut Pager) -> Result<()> {
        let pages = self.data_pages(pager)? as u64;
        trace!(section = self.page, "destroying raw-data section");
        pager.free_run(self.page, 1 + pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::Env;
    use eyre::bail;

    fn no_moves() -> impl FnMut(&mut EnvState, u64, u64, &[u8]) -> Result<()> {
        |_, old, new, _| bail!("unexpected relocation {} -> {}", old, new)
    }

    fn setup() -> (tempfile::TempDir, Env) {
        let dir = tempfile::tempdir().unwrap();
        let env = Env::create(dir.path().join("s.tdb")).unwrap();
        (dir, env)
    }

    #[test]
    fn allocate_write_read_roundtrip() {
        let (_dir, env) = setup();
        let mut tx = env.write_txn();
        let state = tx.state_mut();

        let section = RawDataSection::create(&mut state.pager, 7, 1, 2, [0; 32]).unwrap();
        let id = section
            .try_allocate(&mut state.pager, 11)
            .unwrap()
            .expect("fresh section must accept");
        assert!(section
            .try_write_direct(&mut state.pager, id, b"hello world", false)
            .unwrap());

        let entry = direct_read(&state.pager, id).unwrap();
        assert_eq!(entry.data, b"hello world");
        assert!(!entry.compressed);
        assert!(section.contains(&state.pager, id).unwrap());
        assert!(RawDataSection::is_owned(&state.pager, id, 7).unwrap());
        assert!(!RawDataSection::is_owned(&state.pager, id, 8).unwrap());
        assert_eq!(section_of(&state.pager, id).unwrap(), section.page_number());
    }

    #[test]
    fn oversized_requests_are_refused() {
        let (_dir, env) = setup();
        let mut tx = env.write_txn();
        let state = tx.state_mut();

        let section = RawDataSection::create(&mut state.pager, 7, 1, 2, [0; 32]).unwrap();
        assert!(section
            .try_allocate(&mut state.pager, MAX_ITEM_SIZE)
            .unwrap()
            .is_none());
        assert!(section
            .try_allocate(&mut state.pager, MAX_ITEM_SIZE - ENTRY_HEADER_SIZE)
            .unwrap()
            .is_some());
    }

    #[test]
    fn section_reports_full_and_density_tracks_frees() {
        let (_dir, env) = setup();
        let mut tx = env.write_txn();
        let state = tx.state_mut();

        let section = RawDataSection::create(&mut state.pager, 7, 1, 1, [0; 32]).unwrap();
        let mut ids = Vec::new();
        while let Some(id) = section.try_allocate(&mut state.pager, 1000).unwrap() {
            section
                .try_write_direct(&mut state.pager, id, &[0xAB; 1000], false)
                .unwrap();
            ids.push(id);
        }
        assert!(ids.len() >= 7, "one data page should take several 1000B entries");
        assert!(section.density(&state.pager).unwrap() > 0.9);

        // Free back-to-front so each free rewinds the bump pointer and no
        // defragmentation (hence no relocation) is ever needed.
        let mut density = 1.0;
        for id in ids.iter().rev() {
            density = section.free(state, *id, &mut no_moves()).unwrap();
        }
        assert_eq!(density, 0.0);
    }

    #[test]
    fn freed_slots_are_reused() {
        let (_dir, env) = setup();
        let mut tx = env.write_txn();
        let state = tx.state_mut();

        let section = RawDataSection::create(&mut state.pager, 7, 1, 1, [0; 32]).unwrap();
        let mut ids = Vec::new();
        while let Some(id) = section.try_allocate(&mut state.pager, 500).unwrap() {
            section
                .try_write_direct(&mut state.pager, id, &[1u8; 500], false)
                .unwrap();
            ids.push(id);
        }

        // Free one interior slot; the next fitting allocation must land in it.
        let victim = ids[1];
        section.free(state, victim, &mut no_moves()).unwrap();
        let replacement = section
            .try_allocate(&mut state.pager, 400)
            .unwrap()
            .expect("freed slot should be reusable");
        assert_eq!(replacement, victim);
    }

    #[test]
    fn get_all_ids_walks_live_entries_in_order() {
        let (_dir, env) = setup();
        let mut tx = env.write_txn();
        let state = tx.state_mut();

        let section = RawDataSection::create(&mut state.pager, 7, 1, 2, [0; 32]).unwrap();
        let mut expected = Vec::new();
        for i in 0..10u8 {
            let id = section.try_allocate(&mut state.pager, 64).unwrap().unwrap();
            section
                .try_write_direct(&mut state.pager, id, &[i; 64], false)
                .unwrap();
            expected.push(id);
        }
        assert_eq!(section.get_all_ids(&state.pager).unwrap(), expected);

        section.free(state, expected[3], &mut no_moves()).unwrap();
        let ids = section.get_all_ids(&state.pager).unwrap();
        assert_eq!(ids.len(), 9);
        assert!(!ids.contains(&expected[3]));
    }

    #[test]
    fn defrag_relocates_and_notifies() {
        let (_dir, env) = setup();
        let mut tx = env.write_txn();
        let state = tx.state_mut();

        let section = RawDataSection::create(&mut state.pager, 7, 1, 1, [0; 32]).unwrap();
        let mut ids = Vec::new();
        for i in 0..7u8 {
            let id = section.try_allocate(&mut state.pager, 1000).unwrap().unwrap();
            section
                .try_write_direct(&mut state.pager, id, &[i; 1000], false)
                .unwrap();
            ids.push(id);
        }

        // Free enough interior slots to cross the defrag slack threshold.
        let mut moves = Vec::new();
        let mut observer = |_state: &mut EnvState, old: u64, new: u64, raw: &[u8]| -> Result<()> {
            moves.push((old, new, raw.to_vec()));
            Ok(())
        };
        section.free(state, ids[0], &mut observer).unwrap();
        section.free(state, ids[1], &mut observer).unwrap();
        section.free(state, ids[2], &mut observer).unwrap();
        drop(observer);

        assert!(!moves.is_empty(), "defrag should have relocated survivors");
        for (old, new, raw) in &moves {
            assert_ne!(old, new);
            let entry = direct_read(&state.pager, *new).unwrap();
            assert_eq!(entry.data, raw.as_slice());
        }

        // Survivors are intact regardless of relocation.
        let survivors = section.get_all_ids(&state.pager).unwrap();
        assert_eq!(survivors.len(), 4);
        for id in survivors {
            let entry = direct_read(&state.pager, id).unwrap();
            assert_eq!(entry.data.len(), 1000);
        }
    }

    #[test]
    fn min_compression_ratio_keeps_the_best() {
        let (_dir, env) = setup();
        let mut tx = env.write_txn();
        let state = tx.state_mut();

        let section = RawDataSection::create(&mut state.pager, 7, 1, 1, [0x11; 32]).unwrap();
        assert_eq!(
            section.min_compression_ratio(&state.pager).unwrap(),
            crate::config::EXPECTED_RATIO_NONE
        );
        section.set_compression_rate(&mut state.pager, 60).unwrap();
        section.set_compression_rate(&mut state.pager, 85).unwrap();
        section.set_compression_rate(&mut state.pager, 42).unwrap();
        assert_eq!(section.min_compression_ratio(&state.pager).unwrap(), 42);
        assert_eq!(section.dictionary_hash(&state.pager).unwrap(), [0x11; 32]);
    }

    #[test]
    fn destroy_returns_pages_to_the_pool() {
        let (_dir, env) = setup();
        let mut tx = env.write_txn();
        let state = tx.state_mut();

        let section = RawDataSection::create(&mut state.pager, 7, 1, 4, [0; 32]).unwrap();
        let first = section.page_number();
        section.destroy(&mut state.pager).unwrap();
        for p in first..first + 5 {
            assert!(state.pager.is_free(p));
        }
    }
}
