//! # TalusDB — Embedded Transactional Table Engine
//!
//! TalusDB stores variably-sized entries keyed by a primary key and zero or
//! more secondary indexes, packed into slab sections over a paged
//! memory-mapped store, with optional per-section dictionary compression.
//!
//! ## Quick Start
//!
//! ```ignore
//! use talusdb::{Env, SliceSource, Table, TableSchema, TableValueBuilder};
//!
//! let env = Env::create("./data.tdb")?;
//! let schema = TableSchema::new(1)
//!     .with_primary("key", SliceSource::Column(0))
//!     .with_index("by-status", SliceSource::Column(1));
//!
//! let mut tx = env.write_txn();
//! let table = Table::open(&mut tx, "orders", &schema)?;
//! let mut builder = TableValueBuilder::new();
//! builder.add(b"order-0001").add(b"open").add(b"payload");
//! let id = table.insert(&mut tx, &mut builder)?;
//! table.prepare_for_commit(&mut tx)?;
//! tx.commit()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │  Table (routing, indexes, compaction,         │
//! │         dictionary lifecycle, seeks)          │
//! ├──────────────┬──────────────┬─────────────────┤
//! │  Sections    │  Trees       │  Dictionaries   │
//! │  (slab       │  (primary &  │  (holder +      │
//! │   allocator) │   secondary) │   codec)        │
//! ├──────────────┴──────────────┴─────────────────┤
//! │  Environment (transactions, catalog commit)   │
//! ├───────────────────────────────────────────────┤
//! │  Pager / MmapStorage (pages, runs, states)    │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! Entries route by size: small ones pack into raw-data sections (many per
//! page, relocated by compaction), large ones take overflow page runs. A
//! 64-bit storage id encodes `page * PAGE_SIZE + offset`; offset zero means
//! overflow, anything else a small entry — every routing decision in the
//! engine inspects exactly that.
//!
//! ## Module Overview
//!
//! - [`config`]: page sizes, thresholds, and sizing constants
//! - [`storage`]: memory-mapped pages, page allocation, on-page headers
//! - [`env`]: environment, read/write transactions, commit persistence
//! - [`trees`]: variable and fixed-size ordered maps, tree registry
//! - [`arena`]: per-operation scratch allocation
//! - [`codec`]: dictionary-aware compression
//! - [`dict`]: process-wide dictionary cache and persistence
//! - [`section`]: raw-data section slab allocator
//! - [`table`]: the table engine itself

pub mod arena;
pub mod codec;
pub mod config;
pub mod dict;
pub mod env;
pub mod section;
pub mod storage;
pub mod table;
pub mod trees;

pub use arena::ScratchArena;
pub use dict::{Dictionary, DictionaryHolder, EMPTY_DICTIONARY_HASH};
pub use env::{Env, ReadTx, TxView, WriteTx};
pub use section::RawDataSection;
pub use table::{
    owner_hash, BeforeDelete, EntryData, FixedIndexDef, IndexReport, KeySource, SecondaryIndexDef,
    SectionReport, SeekEntry, ShouldAbort, SliceSource, Table, TableReport, TableSchema,
    TableStats, TableValueBuilder, TableValueReader,
};
