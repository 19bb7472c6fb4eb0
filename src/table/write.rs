//! # Table Write Paths
//!
//! Insert, update, delete, and the machinery they share: routing between
//! raw-data sections and overflow runs, active-section switching with
//! candidate reuse, compaction of under-dense sections, and the
//! dictionary-replacement lifecycle.
//!
//! ## Insert Routing
//!
//! The builder is offered the active section's dictionary first, because
//! the compressed size decides the route: under the small-entry bound the
//! entry goes to the active section (switching sections when it refuses),
//! otherwise to a fresh overflow run. Index insertion happens after the
//! entry is placed, using the storage id the placement produced — but
//! uniqueness is checked *before* anything is written, so a duplicate key
//! never leaves a half-placed entry behind.
//!
//! ## Delete Density Policy
//!
//! Freeing a small entry yields the section's post-free density, read in
//! this order:
//!
//! 1. The active section is never compacted out from under the writer.
//! 2. Density above 0.5: leave the section alone.
//! 3. Density above 0.15: track as a reuse candidate.
//! 4. Otherwise: relocate every survivor and free the section.
//!
//! ## Dictionary Lifecycle
//!
//! When a fresh section must be created (whether an insert or a
//! compaction relocation forced the switch), the retiring section's best
//! observed ratio gates training: if the current dictionary still performs
//! within the margin, training is skipped. Otherwise a candidate is
//! trained from the retiring section's live entries and adopted only when
//! it beats the probe entry's current rendering by the replacement margin
//! (the builder's rendering on the insert path, the relocated entry's on
//! the compaction path). Sections never change dictionaries after
//! creation, so historical data always decodes with the dictionary that
//! encoded it.

use std::sync::Arc;

use eyre::{ensure, Result};
use tracing::debug;

use super::{
    overflow_page_count, Table, TableValueBuilder, TableValueReader,
};
use crate::config::{
    CANDIDATE_DENSITY, DICTIONARY_MAX_SIZE, DICTIONARY_REPLACE_MARGIN, ENTRY_HEADER_SIZE,
    INITIAL_SECTION_DATA_PAGES, MAX_ITEM_SIZE, MAX_SECTION_DATA_PAGES, OVERFLOW_HEADER_SIZE,
    PAGE_SIZE, RETAIN_DENSITY, TRAINING_CORPUS_CAP, TRAINING_GATE_MARGIN,
};
use crate::dict::{keyed_hash32, store_dictionary, Dictionary};
use crate::env::{EnvState, WriteTx};
use crate::arena::ScratchArena;
use crate::codec;
use crate::section::{self, RawDataSection};
use crate::storage::{flags, is_overflow_id, OverflowHeader};

/// Callback invoked with each entry about to be deleted by a ranged
/// delete.
pub type BeforeDelete<'a> = dyn FnMut(&TableValueReader<'_>) -> Result<()> + 'a;

/// Callback polled between ranged-delete steps; returning true stops the
/// scan.
pub type ShouldAbort<'a> = dyn FnMut() -> bool + 'a;

impl Table {
    /// Inserts a new entry and returns its storage id.
    pub fn insert(&self, tx: &mut WriteTx<'_>, builder: &mut TableValueBuilder) -> Result<u64> {
        self.ensure_writable()?;
        self.insert_inner(tx.state_mut(), builder)
    }

    /// Upsert: updates the entry whose primary key matches the builder's,
    /// or inserts a new one. Returns `(id, inserted)`.
    pub fn set(
        &self,
        tx: &mut WriteTx<'_>,
        builder: &mut TableValueBuilder,
    ) -> Result<(u64, bool)> {
        self.ensure_writable()?;
        let state = tx.state_mut();
        let key = {
            let reader = builder.reader()?;
            self.schema.primary()?.source.extract(&reader)?.into_owned()
        };
        let existing = state
            .trees
            .variable(self.primary_id)?
            .get(&key)
            .map(super::decode_u64)
            .transpose()?;
        match existing {
            Some(id) => Ok((self.update_inner(state, id, builder, false)?, false)),
            None => Ok((self.insert_inner(state, builder)?, true)),
        }
    }

    /// Rewrites the entry at `id`. In-place when the new form fits the old
    /// home; otherwise the entry moves and the returned id differs.
    /// `force` rewrites index entries even when their extracted keys
    /// compare equal.
    pub fn update(
        &self,
        tx: &mut WriteTx<'_>,
        id: u64,
        builder: &mut TableValueBuilder,
        force: bool,
    ) -> Result<u64> {
        self.ensure_writable()?;
        self.update_inner(tx.state_mut(), id, builder, force)
    }

    /// Deletes the entry at `id`.
    pub fn delete(&self, tx: &mut WriteTx<'_>, id: u64) -> Result<()> {
        self.ensure_writable()?;
        self.delete_inner(tx.state_mut(), id)
    }

    /// Deletes by primary key; false when the key is absent.
    pub fn delete_by_key(&self, tx: &mut WriteTx<'_>, key: &[u8]) -> Result<bool> {
        self.ensure_writable()?;
        let state = tx.state_mut();
        let Some(id) = state
            .trees
            .variable(self.primary_id)?
            .get(key)
            .map(super::decode_u64)
            .transpose()?
        else {
            return Ok(false);
        };
        self.delete_inner(state, id)?;
        Ok(true)
    }

    /// Deletes every entry whose primary key starts with `prefix`,
    /// re-seeking after each delete. Returns whether anything was deleted.
    pub fn delete_by_primary_prefix(
        &self,
        tx: &mut WriteTx<'_>,
        prefix: &[u8],
        mut before_delete: Option<&mut BeforeDelete<'_>>,
        mut should_abort: Option<&mut ShouldAbort<'_>>,
    ) -> Result<bool> {
        self.ensure_writable()?;
        let state = tx.state_mut();
        let mut deleted = false;
        loop {
            if let Some(abort) = should_abort.as_deref_mut() {
                if abort() {
                    break;
                }
            }
            let found = {
                let tree = state.trees.variable(self.primary_id)?;
                tree.first_at_or_after(prefix)
                    .filter(|(key, _)| key.starts_with(prefix))
                    .map(|(key, value)| (key.to_vec(), value.to_vec()))
            };
            let Some((_, raw_id)) = found else { break };
            let id = super::decode_u64(&raw_id)?;
            if let Some(callback) = before_delete.as_deref_mut() {
                let decoded = self.read_owned(state, id)?;
                let reader = TableValueReader::new(&decoded)?;
                callback(&reader)?;
            }
            self.delete_inner(state, id)?;
            deleted = true;
        }
        Ok(deleted)
    }

    /// Walks a variable secondary index forward from `value` and deletes
    /// the indexed entries, at most `limit`. With `starts_with`, stops at
    /// the first index key that no longer begins with `value`.
    pub fn delete_forward_from(
        &self,
        tx: &mut WriteTx<'_>,
        index: &str,
        value: &[u8],
        starts_with: bool,
        limit: usize,
    ) -> Result<usize> {
        self.ensure_writable()?;
        let state = tx.state_mut();
        let outer = self.index_tree_ids[self.var_index_pos(index)?];
        let mut deleted = 0usize;
        while deleted < limit {
            let found = {
                let tree = state.trees.variable(outer)?;
                tree.first_at_or_after(value)
                    .filter(|(key, _)| !starts_with || key.starts_with(value))
                    .map(|(_, nested)| nested.to_vec())
            };
            let Some(raw_nested) = found else { break };
            let nested = super::decode_u64(&raw_nested)?;
            let Some(id) = state.trees.fixed(nested)?.first_key() else {
                break;
            };
            self.delete_inner(state, id)?;
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Walks a fixed secondary index backward from `value` (inclusive) and
    /// deletes the indexed entries, at most `limit`.
    pub fn delete_backward_from(
        &self,
        tx: &mut WriteTx<'_>,
        index: &str,
        value: u64,
        limit: usize,
    ) -> Result<usize> {
        self.ensure_writable()?;
        let state = tx.state_mut();
        let tree_id = self.fixed_tree_ids[self.fixed_index_pos(index)?];
        let mut deleted = 0usize;
        while deleted < limit {
            let found = {
                let tree = state.trees.fixed(tree_id)?;
                tree.range((std::ops::Bound::Unbounded, std::ops::Bound::Included(value)))
                    .next_back()
                    .map(|(_, raw)| raw.to_vec())
            };
            let Some(raw_id) = found else { break };
            self.delete_inner(state, super::decode_u64(&raw_id)?)?;
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Deletes the entry a fixed index maps `value` to; false when absent.
    pub fn delete_by_index(&self, tx: &mut WriteTx<'_>, index: &str, value: u64) -> Result<bool> {
        self.ensure_writable()?;
        let state = tx.state_mut();
        let tree_id = self.fixed_tree_ids[self.fixed_index_pos(index)?];
        let Some(raw) = state.trees.fixed(tree_id)?.get(value).map(|r| r.to_vec()) else {
            return Ok(false);
        };
        self.delete_inner(state, super::decode_u64(&raw)?)?;
        Ok(true)
    }

    // ---- insert internals ----

    pub(crate) fn insert_inner(
        &self,
        state: &mut EnvState,
        builder: &mut TableValueBuilder,
    ) -> Result<u64> {
        // Uniqueness is checked before any byte is written so a duplicate
        // never leaves an orphaned entry in a section.
        {
            let reader = builder.reader()?;
            let key = self.schema.primary()?.source.extract(&reader)?;
            ensure!(
                !state.trees.variable(self.primary_id)?.contains(&key),
                "duplicate primary key in table {}",
                self.name
            );
            for (def, tree_id) in self.schema.fixed_indexes.iter().zip(&self.fixed_tree_ids) {
                let fixed_key = def.source.extract(&reader)?;
                ensure!(
                    !state.trees.fixed(*tree_id)?.contains(fixed_key),
                    "duplicate key {} in fixed index {} of table {}",
                    fixed_key,
                    def.name,
                    self.name
                );
            }
        }

        if self.schema.compressed {
            let hash = self.active_dictionary_hash(state)?;
            let holder = Arc::clone(&state.dictionaries);
            let dictionary = holder.get(state, &hash)?;
            builder.try_compression(&dictionary)?;
        }

        let (id, overflow_pages) = if builder.size()? + ENTRY_HEADER_SIZE < MAX_ITEM_SIZE {
            (self.insert_small(state, builder)?, 0)
        } else {
            self.write_overflow(state, builder)?
        };

        {
            let reader = builder.reader()?;
            self.insert_into_indexes(state, id, &reader)?;
        }
        self.mutate_stats(state, |stats| {
            stats.number_of_entries += 1;
            stats.overflow_page_count += overflow_pages;
        })?;
        Ok(id)
    }

    fn insert_small(&self, state: &mut EnvState, builder: &mut TableValueBuilder) -> Result<u64> {
        let size = builder.size()?;
        let required = builder
            .is_compressed()
            .then(|| builder.dictionary_hash());

        if let Some(active) = self.active_section(state)? {
            let hash_ok = match required {
                Some(hash) => active.dictionary_hash(&state.pager)? == hash,
                None => true,
            };
            if hash_ok {
                if let Some(id) = active.try_allocate(&mut state.pager, size)? {
                    self.finish_small_write(state, active, id, builder)?;
                    return Ok(id);
                }
            }
        }

        // The active section refused: retire it, scan candidates, and only
        // then consider a fresh section (which may retrain the dictionary
        // and change the builder's encoded form and size).
        self.retire_active(state)?;
        if let Some((section, id)) = self.promote_candidate(state, size, required)? {
            self.finish_small_write(state, section, id, builder)?;
            return Ok(id);
        }

        let new_hash = if self.schema.compressed {
            self.consider_retraining(state, builder)?
        } else {
            [0; 32]
        };
        let section = self.create_active_section(state, new_hash)?;
        let size = builder.size()?;
        let id = section
            .try_allocate(&mut state.pager, size)?
            .ok_or_else(|| {
                eyre::eyre!(
                    "allocation failed after switching to a fresh section in table {} (size {})",
                    self.name,
                    size
                )
            })?;
        self.finish_small_write(state, section, id, builder)?;
        Ok(id)
    }

    fn finish_small_write(
        &self,
        state: &mut EnvState,
        section: RawDataSection,
        id: u64,
        builder: &mut TableValueBuilder,
    ) -> Result<()> {
        debug_assert!(
            !builder.is_compressed()
                || section.dictionary_hash(&state.pager)? == builder.dictionary_hash(),
            "compressed entry would land in a section with a different dictionary"
        );
        ensure!(
            section.try_write_direct(
                &mut state.pager,
                id,
                builder.small_form(),
                builder.is_compressed()
            )?,
            "short write after allocation in table {}",
            self.name
        );
        if let Some(ratio) = builder.compression_ratio() {
            section.set_compression_rate(&mut state.pager, ratio)?;
        }
        Ok(())
    }

    // ---- overflow internals ----

    fn write_overflow(
        &self,
        state: &mut EnvState,
        builder: &mut TableValueBuilder,
    ) -> Result<(u64, u64)> {
        let payload_len = builder.large_size()?;
        let compressed = builder.is_compressed();
        let (first, pages) = self.allocate_overflow_run(state, payload_len, compressed)?;
        let run = state.pager.run_mut(first, pages)?;
        builder.copy_large_to(&mut run[OVERFLOW_HEADER_SIZE..OVERFLOW_HEADER_SIZE + payload_len]);
        Ok((first * PAGE_SIZE as u64, pages))
    }

    fn write_overflow_raw(
        &self,
        state: &mut EnvState,
        payload: &[u8],
        compressed: bool,
    ) -> Result<(u64, u64)> {
        let (first, pages) = self.allocate_overflow_run(state, payload.len(), compressed)?;
        let run = state.pager.run_mut(first, pages)?;
        run[OVERFLOW_HEADER_SIZE..OVERFLOW_HEADER_SIZE + payload.len()].copy_from_slice(payload);
        Ok((first * PAGE_SIZE as u64, pages))
    }

    fn allocate_overflow_run(
        &self,
        state: &mut EnvState,
        payload_len: usize,
        compressed: bool,
    ) -> Result<(u64, u64)> {
        let pages = overflow_page_count(payload_len);
        let first = state.pager.allocate(pages, flags::OVERFLOW)?;
        let mut first_flags = flags::OVERFLOW | flags::RAW_DATA;
        if compressed {
            first_flags |= flags::COMPRESSED;
        }
        state.pager.set_state(first, first_flags);
        *OverflowHeader::from_bytes_mut(state.pager.page_mut(first)?)? = OverflowHeader::new(
            self.owner_hash,
            self.schema.table_type,
            payload_len as u32,
            compressed,
        );
        Ok((first, pages))
    }

    fn free_overflow(&self, state: &mut EnvState, id: u64) -> Result<u64> {
        let page = id / PAGE_SIZE as u64;
        ensure!(
            state.pager.state(page) & flags::OVERFLOW != 0,
            "storage id {} does not address an overflow run",
            id
        );
        let header = *OverflowHeader::from_bytes(state.pager.page(page)?)?;
        debug_assert_eq!(
            header.owner_hash, self.owner_hash,
            "freeing overflow run not owned by table {}",
            self.name
        );
        let pages = overflow_page_count(header.overflow_size as usize);
        state.pager.free_run(page, pages)?;
        Ok(pages)
    }

    // ---- update internals ----

    pub(crate) fn update_inner(
        &self,
        state: &mut EnvState,
        id: u64,
        builder: &mut TableValueBuilder,
        force: bool,
    ) -> Result<u64> {
        debug_assert!(
            self.is_owned_id(state, id).unwrap_or(false),
            "update of id {} not owned by table {}",
            id,
            self.name
        );
        let old = self.read_owned(state, id)?;
        self.evict(id);

        if !is_overflow_id(id) {
            let section = RawDataSection::open(section::section_of(&state.pager, id)?);
            if self.schema.compressed {
                // In-place rewrites stay inside the entry's own section, so
                // the offered dictionary is the containing section's, not
                // the active one.
                let hash = section.dictionary_hash(&state.pager)?;
                let holder = Arc::clone(&state.dictionaries);
                let dictionary = holder.get(state, &hash)?;
                builder.try_compression(&dictionary)?;
            }
            if builder.size()? + ENTRY_HEADER_SIZE < MAX_ITEM_SIZE
                && section.try_write_direct(
                    &mut state.pager,
                    id,
                    builder.small_form(),
                    builder.is_compressed(),
                )?
            {
                if let Some(ratio) = builder.compression_ratio() {
                    section.set_compression_rate(&mut state.pager, ratio)?;
                }
                let old_reader = TableValueReader::new(&old)?;
                let new_reader = builder.reader()?;
                self.diff_update_indexes(state, id, id, &old_reader, &new_reader, force)?;
                return Ok(id);
            }
        } else {
            if self.schema.compressed {
                let hash = self.active_dictionary_hash(state)?;
                let holder = Arc::clone(&state.dictionaries);
                let dictionary = holder.get(state, &hash)?;
                builder.try_compression(&dictionary)?;
            }
            let page = id / PAGE_SIZE as u64;
            let header = *OverflowHeader::from_bytes(state.pager.page(page)?)?;
            let old_pages = overflow_page_count(header.overflow_size as usize);
            let new_len = builder.large_size()?;
            if overflow_page_count(new_len) == old_pages {
                let compressed = builder.is_compressed();
                let run = state.pager.run_mut(page, old_pages)?;
                *OverflowHeader::from_bytes_mut(run)? = OverflowHeader::new(
                    self.owner_hash,
                    self.schema.table_type,
                    new_len as u32,
                    compressed,
                );
                builder.copy_large_to(&mut run[OVERFLOW_HEADER_SIZE..OVERFLOW_HEADER_SIZE + new_len]);
                let mut first_flags = flags::OVERFLOW | flags::RAW_DATA;
                if compressed {
                    first_flags |= flags::COMPRESSED;
                }
                state.pager.set_state(page, first_flags);
                let old_reader = TableValueReader::new(&old)?;
                let new_reader = builder.reader()?;
                self.diff_update_indexes(state, id, id, &old_reader, &new_reader, force)?;
                return Ok(id);
            }
        }

        // Class change: the entry moves. Check primary-key collisions
        // before tearing the old entry down.
        {
            let old_reader = TableValueReader::new(&old)?;
            let old_key = self.schema.primary()?.source.extract(&old_reader)?.into_owned();
            let new_reader = builder.reader()?;
            let new_key = self.schema.primary()?.source.extract(&new_reader)?;
            ensure!(
                new_key.as_ref() == old_key.as_slice()
                    || !state.trees.variable(self.primary_id)?.contains(&new_key),
                "duplicate primary key in table {}",
                self.name
            );
        }
        self.delete_inner(state, id)?;
        self.insert_inner(state, builder)
    }

    // ---- delete internals ----

    pub(crate) fn delete_inner(&self, state: &mut EnvState, id: u64) -> Result<()> {
        let decoded = self.read_owned(state, id)?;
        let reader = TableValueReader::new(&decoded)?;
        self.remove_from_indexes(state, id, &reader)?;
        self.evict(id);

        if is_overflow_id(id) {
            let pages = self.free_overflow(state, id)?;
            self.mutate_stats(state, |stats| {
                stats.number_of_entries -= 1;
                stats.overflow_page_count -= pages;
            })?;
            return Ok(());
        }

        let section_page = section::section_of(&state.pager, id)?;
        let section = RawDataSection::open(section_page);
        let density = {
            let mut observer = |st: &mut EnvState, old_id: u64, new_id: u64, _raw: &[u8]| {
                self.on_data_moved(st, old_id, new_id)
            };
            section.free(state, id, &mut observer)?
        };
        self.mutate_stats(state, |stats| stats.number_of_entries -= 1)?;

        let active = self.active_section_page(state)?;
        if section_page == active || density > RETAIN_DENSITY {
            return Ok(());
        }
        if density > CANDIDATE_DENSITY {
            // A section is tracked by at most one set at a time.
            state.trees.fixed_mut(self.inactive)?.remove(section_page);
            state
                .trees
                .fixed_mut(self.candidates)?
                .insert(section_page, &[])?;
            return Ok(());
        }
        self.compact_section(state, section)
    }

    /// Relocates every surviving entry out of `doomed` and frees it.
    /// Entries compressed with a different dictionary than the active one
    /// are re-encoded; entries that stop compressing are stored raw;
    /// entries that stop fitting small go to overflow runs.
    fn compact_section(&self, state: &mut EnvState, doomed: RawDataSection) -> Result<()> {
        let doomed_page = doomed.page_number();
        state.trees.fixed_mut(self.candidates)?.remove(doomed_page);
        state.trees.fixed_mut(self.inactive)?.remove(doomed_page);

        let holder = Arc::clone(&state.dictionaries);
        let src_hash = doomed.dictionary_hash(&state.pager)?;

        let ids = doomed.get_all_ids(&state.pager)?;
        let relocated = ids.len();
        for old_id in ids {
            let (raw, was_compressed) = {
                let entry = section::direct_read(&state.pager, old_id)?;
                (entry.data.to_vec(), entry.compressed)
            };
            let plain = if was_compressed {
                let src_dict = holder.get(state, &src_hash)?;
                codec::decompress(&raw, src_dict.bytes())?
            } else {
                raw.clone()
            };

            // Relocation itself can switch the active section and retrain,
            // so the target dictionary is re-read for every entry.
            let active_hash = self.active_dictionary_hash(state)?;
            let (store, compressed) = if was_compressed && src_hash != active_hash {
                let active_dict = holder.get(state, &active_hash)?;
                let re = codec::compress(&plain, active_dict.bytes());
                if re.len() < plain.len() {
                    (re, true)
                } else {
                    (plain.clone(), false)
                }
            } else {
                (raw, was_compressed)
            };

            let new_id = if store.len() + ENTRY_HEADER_SIZE < MAX_ITEM_SIZE {
                self.allocate_small_raw(state, &store, compressed, active_hash, &plain)?
            } else {
                let payload = if compressed {
                    let mut with_hash = Vec::with_capacity(32 + store.len());
                    with_hash.extend_from_slice(&active_hash);
                    with_hash.extend_from_slice(&store);
                    with_hash
                } else {
                    store
                };
                let (id, pages) = self.write_overflow_raw(state, &payload, compressed)?;
                self.mutate_stats(state, |stats| stats.overflow_page_count += pages)?;
                id
            };

            self.on_data_moved(state, old_id, new_id)?;
        }

        doomed.destroy(&mut state.pager)?;
        debug!(
            table = %self.name,
            section = doomed_page,
            relocated,
            "compacted away under-dense section"
        );
        Ok(())
    }

    /// Places raw stored bytes into the active section, switching sections
    /// when it refuses. Creating a fresh section runs the same
    /// dictionary-retraining decision as the insert path, with the
    /// relocated entry's decoded form (`plain`) as the probe; on adoption
    /// the entry is re-encoded against the new dictionary before it is
    /// written.
    fn allocate_small_raw(
        &self,
        state: &mut EnvState,
        data: &[u8],
        compressed: bool,
        dict_hash: [u8; 32],
        plain: &[u8],
    ) -> Result<u64> {
        let required = compressed.then_some(dict_hash);
        if let Some(active) = self.active_section(state)? {
            let hash_ok = match required {
                Some(hash) => active.dictionary_hash(&state.pager)? == hash,
                None => true,
            };
            if hash_ok {
                if let Some(id) = active.try_allocate(&mut state.pager, data.len())? {
                    ensure!(
                        active.try_write_direct(&mut state.pager, id, data, compressed)?,
                        "short write after allocation in table {}",
                        self.name
                    );
                    return Ok(id);
                }
            }
        }

        self.retire_active(state)?;
        if let Some((section, id)) = self.promote_candidate(state, data.len(), required)? {
            ensure!(
                section.try_write_direct(&mut state.pager, id, data, compressed)?,
                "short write after allocation in table {}",
                self.name
            );
            return Ok(id);
        }

        // No candidate matched: decide on retraining before creating the
        // fresh section, exactly as the insert path does. The candidate
        // must beat this entry's current rendering by the replacement
        // margin to be adopted.
        let mut section_hash = dict_hash;
        let mut adopted: Option<Vec<u8>> = None;
        if self.schema.compressed {
            if let Some(candidate) = self.train_replacement_candidate(state)? {
                let out = codec::compress(plain, candidate.bytes());
                let current_len = if compressed { data.len() } else { plain.len() };
                let wins = out.len() < plain.len()
                    && (out.len() as u64) * 100
                        <= (current_len as u64) * (100 - DICTIONARY_REPLACE_MARGIN) as u64;
                if wins {
                    section_hash = *candidate.hash();
                    store_dictionary(
                        state,
                        section_hash,
                        candidate.bytes().to_vec(),
                        candidate.expected_ratio(),
                    )?;
                    debug!(
                        table = %self.name,
                        expected_ratio = candidate.expected_ratio(),
                        "trained replacement compression dictionary while relocating"
                    );
                    adopted = Some(out);
                }
            }
        }
        let (write_data, write_compressed) = match &adopted {
            Some(out) => (out.as_slice(), true),
            None => (data, compressed),
        };

        let section = self.create_active_section(state, section_hash)?;
        let id = section
            .try_allocate(&mut state.pager, write_data.len())?
            .ok_or_else(|| {
                eyre::eyre!(
                    "allocation failed after switching to a fresh section in table {} (size {})",
                    self.name,
                    write_data.len()
                )
            })?;
        ensure!(
            section.try_write_direct(&mut state.pager, id, write_data, write_compressed)?,
            "short write after allocation in table {}",
            self.name
        );
        Ok(id)
    }

    // ---- active-section switching ----

    fn retire_active(&self, state: &mut EnvState) -> Result<()> {
        if let Some(active) = self.active_section(state)? {
            state
                .trees
                .fixed_mut(self.inactive)?
                .insert(active.page_number(), &[])?;
        }
        Ok(())
    }

    /// Scans candidate sections in ascending page order; promotes the
    /// first one that accepts the allocation (and, for compressed
    /// requests, carries the required dictionary).
    fn promote_candidate(
        &self,
        state: &mut EnvState,
        size: usize,
        required_hash: Option<[u8; 32]>,
    ) -> Result<Option<(RawDataSection, u64)>> {
        let pages: Vec<u64> = state
            .trees
            .fixed(self.candidates)?
            .iter()
            .map(|(page, _)| page)
            .collect();
        for page in pages {
            let candidate = RawDataSection::open(page);
            if let Some(required) = required_hash {
                if candidate.dictionary_hash(&state.pager)? != required {
                    continue;
                }
            }
            if let Some(id) = candidate.try_allocate(&mut state.pager, size)? {
                state.trees.fixed_mut(self.candidates)?.remove(page);
                self.set_active_section(state, page)?;
                debug!(
                    table = %self.name,
                    section = page,
                    "promoted candidate section to active"
                );
                return Ok(Some((candidate, id)));
            }
        }
        Ok(None)
    }

    /// Creates a fresh active section, doubling the retiring section's
    /// size up to the platform cap.
    fn create_active_section(
        &self,
        state: &mut EnvState,
        dict_hash: [u8; 32],
    ) -> Result<RawDataSection> {
        let data_pages = match self.active_section(state)? {
            Some(prev) => (prev.data_pages(&state.pager)? * 2).min(MAX_SECTION_DATA_PAGES),
            None => INITIAL_SECTION_DATA_PAGES,
        };
        let section = RawDataSection::create(
            &mut state.pager,
            self.owner_hash,
            self.schema.table_type,
            data_pages,
            dict_hash,
        )?;
        self.set_active_section(state, section.page_number())?;
        debug!(
            table = %self.name,
            section = section.page_number(),
            data_pages,
            "created fresh active section"
        );
        Ok(section)
    }

    // ---- dictionary lifecycle ----

    /// Decides the dictionary for the next section on the insert path.
    /// The trained candidate is adopted only when it beats the builder's
    /// current rendering by the replacement margin.
    fn consider_retraining(
        &self,
        state: &mut EnvState,
        builder: &mut TableValueBuilder,
    ) -> Result<[u8; 32]> {
        if self.active_section(state)?.is_none() {
            return Ok(builder.dictionary_hash());
        }
        let current_hash = self.active_dictionary_hash(state)?;
        let Some(candidate) = self.train_replacement_candidate(state)? else {
            return Ok(current_hash);
        };
        if builder.should_replace_dictionary(&candidate)? {
            store_dictionary(
                state,
                *candidate.hash(),
                candidate.bytes().to_vec(),
                candidate.expected_ratio(),
            )?;
            debug!(
                table = %self.name,
                expected_ratio = candidate.expected_ratio(),
                "trained replacement compression dictionary"
            );
            Ok(*candidate.hash())
        } else {
            Ok(current_hash)
        }
    }

    /// Trains a candidate dictionary from the retiring (current active)
    /// section's live entries. Returns `None` while the retiring section's
    /// best observed ratio says the current dictionary still performs
    /// within the margin. Adoption, and persisting the candidate, is the
    /// caller's decision; both the insert path and the compaction
    /// relocation path make it against their own probe entry.
    fn train_replacement_candidate(&self, state: &EnvState) -> Result<Option<Arc<Dictionary>>> {
        let Some(retiring) = self.active_section(state)? else {
            return Ok(None);
        };
        let current_hash = retiring.dictionary_hash(&state.pager)?;
        let min_ratio = retiring.min_compression_ratio(&state.pager)?;
        let holder = Arc::clone(&state.dictionaries);
        let current = holder.get(state, &current_hash)?;
        if min_ratio + TRAINING_GATE_MARGIN >= current.expected_ratio() {
            return Ok(None);
        }

        // The corpus is transient; every sample lives in one scratch arena
        // released when this decision returns.
        let arena = ScratchArena::new();
        let mut samples: Vec<&[u8]> = Vec::new();
        let mut total = 0usize;
        for id in retiring.get_all_ids(&state.pager)? {
            if total >= TRAINING_CORPUS_CAP {
                break;
            }
            let entry = section::direct_read(&state.pager, id)?;
            let plain: &[u8] = if entry.compressed {
                arena.copy_of(&codec::decompress(entry.data, current.bytes())?)
            } else {
                arena.copy_of(entry.data)
            };
            total += plain.len();
            samples.push(plain);
        }
        if samples.is_empty() {
            return Ok(None);
        }

        let bytes = codec::train(&samples, DICTIONARY_MAX_SIZE);
        if bytes.is_empty() {
            return Ok(None);
        }
        let mut ratio_sum = 0i64;
        let mut probed = 0i64;
        for sample in samples.iter().take(16) {
            let out = codec::compress(sample, &bytes);
            ratio_sum += codec::ratio_percent(out.len(), sample.len()) as i64;
            probed += 1;
        }
        let expected_ratio = (ratio_sum / probed) as i32;
        let hash = keyed_hash32(self.name.as_bytes(), &bytes);
        Ok(Some(Arc::new(Dictionary::new(hash, bytes, expected_ratio))))
    }
}
