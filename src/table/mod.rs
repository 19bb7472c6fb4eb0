//! # Table — the Transactional Table Engine Orchestrator
//!
//! A table stores variably-sized entries keyed by a primary key and zero or
//! more secondary indexes. Entries route between two physical homes by
//! size: small entries pack into raw-data sections, large entries take
//! overflow page runs. The table keeps every index consistent with the
//! entry heap across inserts, updates, deletes, relocations, and section
//! compaction.
//!
//! ## Table Root Layout
//!
//! Each table owns a root tree (named `table:<name>` in the environment)
//! with fixed well-known slots:
//!
//! ```text
//! Slot                  Value
//! --------------------  -------------------------------------------
//! stats                 u64 number_of_entries ++ u64 overflow_page_count
//! schema                canonical schema encoding (validated on open)
//! active-section        u64 page number of the write target (0 = none)
//! inactive-sections     fixed-tree id: full sections
//! candidate-sections    fixed-tree id: partly-free reusable sections
//! primary               tree id of the primary index
//! index:<name>          tree id per variable-key secondary index
//! fixed-index:<name>    tree id per fixed-key secondary index
//! ```
//!
//! Global indexes resolve through environment-level names instead and are
//! shared across tables with compatible schemas. The dictionaries tree is
//! always environment-level.
//!
//! ## Storage-Id Routing
//!
//! A storage id encodes `page * PAGE_SIZE + offset`. Offset zero means an
//! overflow run; anything else is a small entry inside a section. Every
//! read and write below routes on that single test.
//!
//! ## Caches
//!
//! The table instance owns a per-transaction decompression cache (id →
//! shared decoded buffer) and write-through caches of the stats and
//! active-section slots. All of them die with the table instance; none may
//! outlive the transaction that opened it. Mutating an id evicts its
//! cached decompression.
//!
//! ## Module Organization
//!
//! - `schema`: declarative table description and canonical encoding
//! - `builder`: entry staging, wire form, compression negotiation
//! - `write`: insert/update/delete paths, section switching, compaction,
//!   dictionary lifecycle
//! - `index`: index maintenance (insert/remove/diff/relink)
//! - `seek`: iteration families over primary, secondary, and fixed indexes

pub mod builder;
mod index;
pub mod schema;
mod seek;
mod write;

pub use builder::{serialize_columns, TableValueBuilder, TableValueReader};
pub use schema::{
    owner_hash, FixedIndexDef, KeySource, PrimaryKeyDef, SecondaryIndexDef, SliceSource,
    TableSchema,
};
pub use seek::{FixedSeek, PrimarySeek, SecondarySeek, SeekEntry};
pub use write::{BeforeDelete, ShouldAbort};

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use eyre::{bail, ensure, Result};
use hashbrown::HashMap;

use crate::config::{OVERFLOW_HEADER_SIZE, PAGE_SIZE};
use crate::env::{EnvState, TxView, WriteTx};
use crate::codec;
use crate::section::{self, RawDataSection};
use crate::storage::{flags, is_overflow_id, OverflowHeader};

const SLOT_STATS: &[u8] = b"stats";
const SLOT_SCHEMA: &[u8] = b"schema";
const SLOT_ACTIVE: &[u8] = b"active-section";
const SLOT_INACTIVE: &[u8] = b"inactive-sections";
const SLOT_CANDIDATES: &[u8] = b"candidate-sections";
const SLOT_PRIMARY: &[u8] = b"primary";

/// Sentinel for "active-section slot not yet read".
const ACTIVE_UNLOADED: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    pub number_of_entries: u64,
    pub overflow_page_count: u64,
}

impl TableStats {
    pub fn encode(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.number_of_entries.to_le_bytes());
        out[8..].copy_from_slice(&self.overflow_page_count.to_le_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        ensure!(data.len() == 16, "stats record is {} bytes", data.len());
        Ok(Self {
            number_of_entries: u64::from_le_bytes(data[..8].try_into().unwrap()),
            overflow_page_count: u64::from_le_bytes(data[8..].try_into().unwrap()),
        })
    }
}

/// Decoded entry bytes: either a direct slice into the mapped file or a
/// shared decompressed buffer memoized for the transaction.
pub enum EntryData<'t> {
    Raw(&'t [u8]),
    Cached(Rc<[u8]>),
}

impl std::ops::Deref for EntryData<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            EntryData::Raw(slice) => slice,
            EntryData::Cached(buf) => buf,
        }
    }
}

impl std::fmt::Debug for EntryData<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryData")
            .field("len", &self.len())
            .field("cached", &matches!(self, EntryData::Cached(_)))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SectionReport {
    pub page: u64,
    pub data_pages: usize,
    pub density: f64,
    pub dictionary: Option<[u8; 32]>,
}

#[derive(Debug, Clone)]
pub struct IndexReport {
    pub name: String,
    pub entries: u64,
}

#[derive(Debug, Clone, Default)]
pub struct TableReport {
    pub name: String,
    pub number_of_entries: u64,
    pub overflow_page_count: u64,
    pub sections: Vec<SectionReport>,
    pub indexes: Vec<IndexReport>,
}

pub struct Table {
    name: String,
    schema: TableSchema,
    owner_hash: u64,
    root: u64,
    primary_id: u64,
    inactive: u64,
    candidates: u64,
    index_tree_ids: Vec<u64>,
    fixed_tree_ids: Vec<u64>,
    read_only: bool,
    decompressed: RefCell<HashMap<u64, Rc<[u8]>>>,
    active_cache: Cell<u64>,
    stats_cache: Cell<Option<TableStats>>,
}

impl Table {
    /// Opens a table for writing, creating it when missing. The supplied
    /// schema is validated byte-for-byte against the stored one.
    pub fn open(tx: &mut WriteTx<'_>, name: &str, schema: &TableSchema) -> Result<Self> {
        schema.primary()?;
        let state = tx.state_mut();
        let root_name = format!("table:{}", name);
        let root = match state.trees.id_by_name(&root_name) {
            Some(id) => id,
            None => {
                let id = state.trees.name_variable(&root_name);
                Self::initialize_root(state, id, schema)?;
                id
            }
        };
        Self::resolve(state, root, name, schema, false)
    }

    /// Opens an existing table for reads only; every mutation fails.
    pub fn open_read_only(tx: &impl TxView, name: &str, schema: &TableSchema) -> Result<Self> {
        schema.primary()?;
        let state = tx.state();
        let root_name = format!("table:{}", name);
        let Some(root) = state.trees.id_by_name(&root_name) else {
            bail!("table {} not found", name);
        };
        Self::resolve(state, root, name, schema, true)
    }

    fn initialize_root(state: &mut EnvState, root: u64, schema: &TableSchema) -> Result<()> {
        let inactive = state.trees.create_fixed(0);
        let candidates = state.trees.create_fixed(0);
        let primary = state.trees.create_variable();

        let mut local_var: Vec<(String, u64)> = Vec::new();
        for def in &schema.indexes {
            let id = if def.global {
                state.trees.name_variable(&format!("index:{}", def.name))
            } else {
                state.trees.create_variable()
            };
            local_var.push((def.name.clone(), id));
        }
        let mut local_fixed: Vec<(String, u64)> = Vec::new();
        for def in &schema.fixed_indexes {
            let id = if def.global {
                state
                    .trees
                    .name_fixed(&format!("fixed-index:{}", def.name), 8)
            } else {
                state.trees.create_fixed(8)
            };
            local_fixed.push((def.name.clone(), id));
        }

        let tree = state.trees.variable_mut(root)?;
        tree.insert(SLOT_SCHEMA, &schema.encode());
        tree.insert(SLOT_STATS, &TableStats::default().encode());
        tree.insert(SLOT_ACTIVE, &0u64.to_le_bytes());
        tree.insert(SLOT_INACTIVE, &inactive.to_le_bytes());
        tree.insert(SLOT_CANDIDATES, &candidates.to_le_bytes());
        tree.insert(SLOT_PRIMARY, &primary.to_le_bytes());
        for (name, id) in local_var {
            tree.insert(&index_slot(&name), &id.to_le_bytes());
        }
        for (name, id) in local_fixed {
            tree.insert(&fixed_index_slot(&name), &id.to_le_bytes());
        }
        Ok(())
    }

    fn resolve(
        state: &EnvState,
        root: u64,
        name: &str,
        schema: &TableSchema,
        read_only: bool,
    ) -> Result<Self> {
        let tree = state.trees.variable(root)?;

        let stored = tree
            .get(SLOT_SCHEMA)
            .ok_or_else(|| eyre::eyre!("missing schema record for table {}", name))?;
        ensure!(
            stored == schema.encode(),
            "schema mismatch for table {}",
            name
        );
        ensure!(
            tree.get(SLOT_STATS).is_some(),
            "missing stats record for table {}",
            name
        );
        ensure!(
            tree.get(SLOT_ACTIVE).is_some(),
            "missing active-section record for table {}",
            name
        );

        let slot = |key: &[u8]| -> Result<u64> {
            let raw = tree
                .get(key)
                .ok_or_else(|| eyre::eyre!("missing structural slot for table {}", name))?;
            decode_u64(raw)
        };

        let mut index_tree_ids = Vec::with_capacity(schema.indexes.len());
        for def in &schema.indexes {
            index_tree_ids.push(slot(&index_slot(&def.name))?);
        }
        let mut fixed_tree_ids = Vec::with_capacity(schema.fixed_indexes.len());
        for def in &schema.fixed_indexes {
            fixed_tree_ids.push(slot(&fixed_index_slot(&def.name))?);
        }

        Ok(Self {
            name: name.to_string(),
            schema: schema.clone(),
            owner_hash: owner_hash(name),
            root,
            primary_id: slot(SLOT_PRIMARY)?,
            inactive: slot(SLOT_INACTIVE)?,
            candidates: slot(SLOT_CANDIDATES)?,
            index_tree_ids,
            fixed_tree_ids,
            read_only,
            decompressed: RefCell::new(HashMap::new()),
            active_cache: Cell::new(ACTIVE_UNLOADED),
            stats_cache: Cell::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn owner_hash(&self) -> u64 {
        self.owner_hash
    }

    pub fn number_of_entries(&self, tx: &impl TxView) -> Result<u64> {
        Ok(self.load_stats(tx.state())?.number_of_entries)
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        ensure!(
            !self.read_only,
            "table {} is opened read-only; writes are not allowed",
            self.name
        );
        Ok(())
    }

    // ---- stats ----

    pub(crate) fn load_stats(&self, state: &EnvState) -> Result<TableStats> {
        if let Some(stats) = self.stats_cache.get() {
            return Ok(stats);
        }
        let tree = state.trees.variable(self.root)?;
        let raw = tree
            .get(SLOT_STATS)
            .ok_or_else(|| eyre::eyre!("missing stats record for table {}", self.name))?;
        let stats = TableStats::decode(raw)?;
        self.stats_cache.set(Some(stats));
        Ok(stats)
    }

    pub(crate) fn mutate_stats(
        &self,
        state: &mut EnvState,
        f: impl FnOnce(&mut TableStats),
    ) -> Result<()> {
        let mut stats = self.load_stats(state)?;
        f(&mut stats);
        self.stats_cache.set(Some(stats));
        state
            .trees
            .variable_mut(self.root)?
            .insert(SLOT_STATS, &stats.encode());
        Ok(())
    }

    // ---- active section ----

    pub(crate) fn active_section_page(&self, state: &EnvState) -> Result<u64> {
        let cached = self.active_cache.get();
        if cached != ACTIVE_UNLOADED {
            return Ok(cached);
        }
        let tree = state.trees.variable(self.root)?;
        let raw = tree
            .get(SLOT_ACTIVE)
            .ok_or_else(|| eyre::eyre!("missing active-section record for table {}", self.name))?;
        let page = decode_u64(raw)?;
        self.active_cache.set(page);
        Ok(page)
    }

    pub(crate) fn active_section(&self, state: &EnvState) -> Result<Option<RawDataSection>> {
        let page = self.active_section_page(state)?;
        Ok((page != 0).then(|| RawDataSection::open(page)))
    }

    pub(crate) fn set_active_section(&self, state: &mut EnvState, page: u64) -> Result<()> {
        state
            .trees
            .variable_mut(self.root)?
            .insert(SLOT_ACTIVE, &page.to_le_bytes());
        self.active_cache.set(page);
        Ok(())
    }

    pub(crate) fn active_dictionary_hash(&self, state: &EnvState) -> Result<[u8; 32]> {
        match self.active_section(state)? {
            Some(section) => section.dictionary_hash(&state.pager),
            None => Ok([0; 32]),
        }
    }

    // ---- read paths ----

    pub(crate) fn evict(&self, id: u64) {
        self.decompressed.borrow_mut().remove(&id);
    }

    /// Decoded bytes of the entry at `id`, routed by the id's offset and
    /// decompressed through the transaction-scoped cache when needed.
    pub(crate) fn read_entry<'t>(&self, state: &'t EnvState, id: u64) -> Result<EntryData<'t>> {
        if is_overflow_id(id) {
            let (payload, compressed) = self.overflow_payload(state, id)?;
            if !compressed {
                return Ok(EntryData::Raw(payload));
            }
            if let Some(cached) = self.decompressed.borrow().get(&id) {
                return Ok(EntryData::Cached(cached.clone()));
            }
            ensure!(
                payload.len() >= 32,
                "compressed overflow entry {} too short for a dictionary hash",
                id
            );
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&payload[..32]);
            let holder = Arc::clone(&state.dictionaries);
            let dict = holder.get(state, &hash)?;
            let plain: Rc<[u8]> = codec::decompress(&payload[32..], dict.bytes())?.into();
            self.decompressed.borrow_mut().insert(id, plain.clone());
            return Ok(EntryData::Cached(plain));
        }

        let entry = section::direct_read(&state.pager, id)?;
        if !entry.compressed {
            return Ok(EntryData::Raw(entry.data));
        }
        if let Some(cached) = self.decompressed.borrow().get(&id) {
            return Ok(EntryData::Cached(cached.clone()));
        }
        let section_page = section::section_of(&state.pager, id)?;
        let hash = RawDataSection::open(section_page).dictionary_hash(&state.pager)?;
        let holder = Arc::clone(&state.dictionaries);
        let dict = holder.get(state, &hash)?;
        let plain: Rc<[u8]> = codec::decompress(entry.data, dict.bytes())?.into();
        self.decompressed.borrow_mut().insert(id, plain.clone());
        Ok(EntryData::Cached(plain))
    }

    pub(crate) fn read_owned(&self, state: &EnvState, id: u64) -> Result<Vec<u8>> {
        Ok(self.read_entry(state, id)?.to_vec())
    }

    fn overflow_payload<'t>(&self, state: &'t EnvState, id: u64) -> Result<(&'t [u8], bool)> {
        let page = id / PAGE_SIZE as u64;
        ensure!(
            state.pager.state(page) & flags::OVERFLOW != 0,
            "storage id {} does not address an overflow run",
            id
        );
        let header = *OverflowHeader::from_bytes(state.pager.page(page)?)?;
        debug_assert_eq!(
            header.owner_hash, self.owner_hash,
            "overflow run {} not owned by table {}",
            page, self.name
        );
        let pages = overflow_page_count(header.overflow_size as usize);
        let run = state.pager.run(page, pages)?;
        Ok((
            &run[OVERFLOW_HEADER_SIZE..OVERFLOW_HEADER_SIZE + header.overflow_size as usize],
            header.is_compressed(),
        ))
    }

    /// Looks up the storage id behind a primary key.
    pub fn id_by_key(&self, tx: &impl TxView, key: &[u8]) -> Result<Option<u64>> {
        let tree = tx.state().trees.variable(self.primary_id)?;
        tree.get(key).map(decode_u64).transpose()
    }

    /// Point read by primary key.
    pub fn read_by_key<'t, T: TxView>(
        &self,
        tx: &'t T,
        key: &[u8],
    ) -> Result<Option<EntryData<'t>>> {
        match self.id_by_key(tx, key)? {
            Some(id) => Ok(Some(self.read_entry(tx.state(), id)?)),
            None => Ok(None),
        }
    }

    /// Point read by storage id.
    pub fn read_direct<'t, T: TxView>(&self, tx: &'t T, id: u64) -> Result<EntryData<'t>> {
        self.read_entry(tx.state(), id)
    }

    /// Point read through a fixed-size secondary index.
    pub fn read_by_fixed_index<'t, T: TxView>(
        &self,
        tx: &'t T,
        index: &str,
        key: u64,
    ) -> Result<Option<(u64, EntryData<'t>)>> {
        let pos = self.fixed_index_pos(index)?;
        let tree = tx.state().trees.fixed(self.fixed_tree_ids[pos])?;
        let Some(raw) = tree.get(key) else {
            return Ok(None);
        };
        let id = decode_u64(raw)?;
        Ok(Some((id, self.read_entry(tx.state(), id)?)))
    }

    /// True when the section or overflow run behind `id` carries this
    /// table's owner hash.
    pub fn is_owned(&self, tx: &impl TxView, id: u64) -> Result<bool> {
        self.is_owned_id(tx.state(), id)
    }

    pub(crate) fn is_owned_id(&self, state: &EnvState, id: u64) -> Result<bool> {
        if is_overflow_id(id) {
            let page = id / PAGE_SIZE as u64;
            if state.pager.state(page) & flags::OVERFLOW == 0 {
                return Ok(false);
            }
            let header = OverflowHeader::from_bytes(state.pager.page(page)?)?;
            return Ok(header.owner_hash == self.owner_hash);
        }
        RawDataSection::is_owned(&state.pager, id, self.owner_hash)
    }

    // ---- index bookkeeping shared with submodules ----

    pub(crate) fn primary_tree_id(&self) -> u64 {
        self.primary_id
    }

    pub(crate) fn var_index_pos(&self, name: &str) -> Result<usize> {
        self.schema
            .indexes
            .iter()
            .position(|def| def.name == name)
            .ok_or_else(|| eyre::eyre!("no secondary index {} on table {}", name, self.name))
    }

    pub(crate) fn fixed_index_pos(&self, name: &str) -> Result<usize> {
        self.schema
            .fixed_indexes
            .iter()
            .position(|def| def.name == name)
            .ok_or_else(|| eyre::eyre!("no fixed index {} on table {}", name, self.name))
    }

    // ---- report & commit hook ----

    pub fn get_report(&self, tx: &impl TxView, include_details: bool) -> Result<TableReport> {
        let state = tx.state();
        let stats = self.load_stats(state)?;
        let mut report = TableReport {
            name: self.name.clone(),
            number_of_entries: stats.number_of_entries,
            overflow_page_count: stats.overflow_page_count,
            sections: Vec::new(),
            indexes: Vec::new(),
        };
        if !include_details {
            return Ok(report);
        }

        let mut pages = Vec::new();
        let active = self.active_section_page(state)?;
        if active != 0 {
            pages.push(active);
        }
        pages.extend(state.trees.fixed(self.inactive)?.iter().map(|(k, _)| k));
        pages.extend(state.trees.fixed(self.candidates)?.iter().map(|(k, _)| k));
        for page in pages {
            let section = RawDataSection::open(page);
            let hash = section.dictionary_hash(&state.pager)?;
            report.sections.push(SectionReport {
                page,
                data_pages: section.data_pages(&state.pager)?,
                density: section.density(&state.pager)?,
                dictionary: (hash != [0; 32]).then_some(hash),
            });
        }

        report.indexes.push(IndexReport {
            name: self.schema.primary()?.name.clone(),
            entries: state.trees.variable(self.primary_id)?.len() as u64,
        });
        for (def, id) in self.schema.indexes.iter().zip(&self.index_tree_ids) {
            report.indexes.push(IndexReport {
                name: def.name.clone(),
                entries: self.var_index_entry_count(state, *id)?,
            });
        }
        for (def, id) in self.schema.fixed_indexes.iter().zip(&self.fixed_tree_ids) {
            report.indexes.push(IndexReport {
                name: def.name.clone(),
                entries: state.trees.fixed(*id)?.len() as u64,
            });
        }
        Ok(report)
    }

    pub(crate) fn var_index_entry_count(&self, state: &EnvState, outer: u64) -> Result<u64> {
        let mut total = 0u64;
        let tree = state.trees.variable(outer)?;
        for (_, value) in tree.iter() {
            let nested = decode_u64(value)?;
            total += state.trees.fixed(nested)?.len() as u64;
        }
        Ok(total)
    }

    /// Commit hook: flushes the write-through slot caches back into the
    /// table root and, in debug builds, checks the per-index count
    /// invariants.
    pub fn prepare_for_commit(&self, tx: &mut WriteTx<'_>) -> Result<()> {
        let state = tx.state_mut();
        if let Some(stats) = self.stats_cache.get() {
            state
                .trees
                .variable_mut(self.root)?
                .insert(SLOT_STATS, &stats.encode());
        }
        let active = self.active_cache.get();
        if active != ACTIVE_UNLOADED {
            state
                .trees
                .variable_mut(self.root)?
                .insert(SLOT_ACTIVE, &active.to_le_bytes());
        }

        #[cfg(debug_assertions)]
        {
            let stats = self.load_stats(state)?;
            let primary = state.trees.variable(self.primary_id)?.len() as u64;
            debug_assert_eq!(
                primary, stats.number_of_entries,
                "primary index count diverged from stats in table {}",
                self.name
            );
            for (def, id) in self.schema.fixed_indexes.iter().zip(&self.fixed_tree_ids) {
                if !def.global {
                    let count = state.trees.fixed(*id)?.len() as u64;
                    debug_assert_eq!(
                        count, stats.number_of_entries,
                        "fixed index {} count diverged from stats in table {}",
                        def.name, self.name
                    );
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("read_only", &self.read_only)
            .finish()
    }
}

pub(crate) fn index_slot(name: &str) -> Vec<u8> {
    let mut key = b"index:".to_vec();
    key.extend_from_slice(name.as_bytes());
    key
}

pub(crate) fn fixed_index_slot(name: &str) -> Vec<u8> {
    let mut key = b"fixed-index:".to_vec();
    key.extend_from_slice(name.as_bytes());
    key
}

pub(crate) fn decode_u64(bytes: &[u8]) -> Result<u64> {
    ensure!(bytes.len() == 8, "expected 8 bytes, got {}", bytes.len());
    Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
}

/// Pages needed for an overflow payload, header included.
pub(crate) fn overflow_page_count(payload_len: usize) -> u64 {
    ((OVERFLOW_HEADER_SIZE + payload_len) as u64).div_ceil(PAGE_SIZE as u64)
}
