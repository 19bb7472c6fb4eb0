//! # Environment and Transactions
//!
//! The environment owns one database file, the pager over it, the tree
//! registry, and the process-wide dictionary holder. Tables are opened
//! within transactions obtained here.
//!
//! ## Transaction Model
//!
//! Single writer, multiple readers, enforced with a `parking_lot::RwLock`
//! around the whole environment state:
//!
//! - [`Env::write_txn`] takes the write lock. Mutations apply directly to
//!   the in-memory tree registry and the mapped pages.
//! - [`Env::read_txn`] takes a read lock; any number may coexist.
//!
//! [`WriteTx::commit`] serializes the tree catalog and the page-state table
//! into page runs, updates the file header, and syncs the map. Dropping a
//! `WriteTx` without committing restores the registry and page-state
//! snapshots taken at transaction start, so uncommitted logical state never
//! becomes reachable. Page *contents* written by the aborted transaction are
//! not rolled back; they are unreachable without catalog references.
//!
//! ## Persisted State
//!
//! ```text
//! Page 0     FileHeader: magic, version, page size, catalog + state runs,
//!            lengths and CRC-32 checksums
//! catalog    serialized TreeRegistry (see trees module)
//! state      the page-state table, one byte per page
//! ```
//!
//! Both runs are rewritten wholesale at commit; the old runs are freed
//! first so space is recycled.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crc::Crc;
use eyre::{ensure, Result};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::PAGE_SIZE;
use crate::dict::DictionaryHolder;
use crate::storage::{flags, FileHeader, MmapStorage, Pager, FILE_MAGIC, FORMAT_VERSION};
use crate::trees::TreeRegistry;

const CRC32: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISCSI);

/// Shared state behind the transaction lock.
#[derive(Debug)]
pub struct EnvState {
    pub pager: Pager,
    pub trees: TreeRegistry,
    pub dictionaries: Arc<DictionaryHolder>,
}

#[derive(Debug)]
struct EnvInner {
    state: RwLock<EnvState>,
    path: PathBuf,
}

/// Handle to one database file. Clone-cheap; all clones share state.
#[derive(Clone, Debug)]
pub struct Env {
    inner: Arc<EnvInner>,
}

impl Env {
    /// Creates a fresh database file, overwriting any existing one, and
    /// writes an initial empty commit so the file is always reopenable.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let storage = MmapStorage::create(&path, 8)?;
        let mut pager = Pager::new(storage);

        let header = FileHeader {
            magic: FILE_MAGIC,
            version: FORMAT_VERSION,
            page_size: PAGE_SIZE as u32,
            page_count: pager.page_count(),
            state_page: 0,
            catalog_page: 0,
            state_pages: 0,
            catalog_pages: 0,
            state_len: 0,
            catalog_len: 0,
            state_crc: 0,
            catalog_crc: 0,
        };
        *FileHeader::from_bytes_mut(pager.page_mut(0)?)? = header;

        let env = Self {
            inner: Arc::new(EnvInner {
                state: RwLock::new(EnvState {
                    pager,
                    trees: TreeRegistry::new(),
                    dictionaries: Arc::new(DictionaryHolder::new()),
                }),
                path,
            }),
        };
        env.write_txn().commit()?;
        Ok(env)
    }

    /// Opens an existing database file and restores the catalog and
    /// page-state table from its last commit.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let storage = MmapStorage::open(&path)?;

        let header = *FileHeader::from_bytes(storage.page(0)?)?;
        header.validate()?;
        ensure!(
            header.page_count == storage.page_count(),
            "file header page count {} != actual {}",
            header.page_count,
            storage.page_count()
        );

        let states = if header.state_page != 0 {
            let run = storage.run(header.state_page, header.state_pages as u64)?;
            ensure!(
                header.state_len as usize <= run.len(),
                "page-state length {} exceeds its run",
                header.state_len
            );
            let bytes = &run[..header.state_len as usize];
            ensure!(
                CRC32.checksum(bytes) == header.state_crc,
                "page-state table checksum mismatch"
            );
            bytes.to_vec()
        } else {
            let mut states = vec![flags::FREE; storage.page_count() as usize];
            states[0] = flags::STATE;
            states
        };

        let trees = if header.catalog_page != 0 {
            let run = storage.run(header.catalog_page, header.catalog_pages as u64)?;
            ensure!(
                header.catalog_len as usize <= run.len(),
                "catalog length {} exceeds its run",
                header.catalog_len
            );
            let bytes = &run[..header.catalog_len as usize];
            ensure!(
                CRC32.checksum(bytes) == header.catalog_crc,
                "catalog checksum mismatch"
            );
            TreeRegistry::deserialize(bytes)?
        } else {
            TreeRegistry::new()
        };

        let pager = Pager::with_states(storage, states)?;

        Ok(Self {
            inner: Arc::new(EnvInner {
                state: RwLock::new(EnvState {
                    pager,
                    trees,
                    dictionaries: Arc::new(DictionaryHolder::new()),
                }),
                path,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Begins the exclusive write transaction.
    pub fn write_txn(&self) -> WriteTx<'_> {
        let guard = self.inner.state.write();
        let backup_trees = guard.trees.clone();
        let backup_states = guard.pager.states().to_vec();
        WriteTx {
            guard,
            backup_trees: Some(backup_trees),
            backup_states,
            committed: false,
        }
    }

    /// Begins a shared read transaction.
    pub fn read_txn(&self) -> ReadTx<'_> {
        ReadTx {
            guard: self.inner.state.read(),
        }
    }
}

/// Read access to environment state, implemented by both transaction kinds.
pub trait TxView {
    fn state(&self) -> &EnvState;
}

pub struct ReadTx<'e> {
    guard: RwLockReadGuard<'e, EnvState>,
}

impl TxView for ReadTx<'_> {
    fn state(&self) -> &EnvState {
        &self.guard
    }
}

pub struct WriteTx<'e> {
    guard: RwLockWriteGuard<'e, EnvState>,
    backup_trees: Option<TreeRegistry>,
    backup_states: Vec<u8>,
    committed: bool,
}

impl TxView for WriteTx<'_> {
    fn state(&self) -> &EnvState {
        &self.guard
    }
}

impl WriteTx<'_> {
    pub fn state_mut(&mut self) -> &mut EnvState {
        &mut self.guard
    }

    /// Persists the catalog and page-state table and syncs the file.
    pub fn commit(mut self) -> Result<()> {
        let state = &mut *self.guard;

        // Free last commit's runs before allocating this one's.
        let old = *FileHeader::from_bytes(state.pager.page(0)?)?;
        if old.catalog_page != 0 {
            state
                .pager
                .free_run(old.catalog_page, old.catalog_pages as u64)?;
        }
        if old.state_page != 0 {
            state.pager.free_run(old.state_page, old.state_pages as u64)?;
        }

        let catalog = state.trees.serialize();
        let catalog_crc = CRC32.checksum(&catalog);
        let catalog_pages = (catalog.len().div_ceil(PAGE_SIZE)).max(1) as u64;
        let catalog_page = state.pager.allocate(catalog_pages, flags::STATE)?;
        state.pager.run_mut(catalog_page, catalog_pages)?[..catalog.len()]
            .copy_from_slice(&catalog);

        // The state table covers its own pages, so allocation and
        // serialization must agree; retry when allocation grew the file.
        let (state_page, state_pages, state_len, state_crc) = loop {
            let needed = state.pager.states().len().div_ceil(PAGE_SIZE).max(1) as u64;
            let run = state.pager.allocate(needed, flags::STATE)?;
            let now_needed = state.pager.states().len().div_ceil(PAGE_SIZE).max(1) as u64;
            if now_needed == needed {
                let bytes = state.pager.states().to_vec();
                let crc = CRC32.checksum(&bytes);
                state.pager.run_mut(run, needed)?[..bytes.len()].copy_from_slice(&bytes);
                break (run, needed, bytes.len() as u64, crc);
            }
            state.pager.free_run(run, needed)?;
        };

        let header = FileHeader {
            magic: FILE_MAGIC,
            version: FORMAT_VERSION,
            page_size: PAGE_SIZE as u32,
            page_count: state.pager.page_count(),
            state_page,
            catalog_page,
            state_pages: state_pages as u32,
            catalog_pages: catalog_pages as u32,
            state_len,
            catalog_len: catalog.len() as u64,
            state_crc,
            catalog_crc,
        };
        *FileHeader::from_bytes_mut(state.pager.page_mut(0)?)? = header;

        state.pager.sync()?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for WriteTx<'_> {
    fn drop(&mut self) {
        if !self.committed {
            if let Some(trees) = self.backup_trees.take() {
                self.guard.trees = trees;
            }
            self.guard
                .pager
                .restore_states(std::mem::take(&mut self.backup_states));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_commit_reopen_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("env.tdb");

        {
            let env = Env::create(&path).unwrap();
            let mut tx = env.write_txn();
            let id = tx.state_mut().trees.name_variable("demo");
            tx.state_mut()
                .trees
                .variable_mut(id)
                .unwrap()
                .insert(b"key", b"value");
            tx.commit().unwrap();
        }

        let env = Env::open(&path).unwrap();
        let tx = env.read_txn();
        let id = tx.state().trees.id_by_name("demo").unwrap();
        assert_eq!(
            tx.state().trees.variable(id).unwrap().get(b"key"),
            Some(b"value".as_slice())
        );
    }

    #[test]
    fn dropped_write_txn_discards_tree_mutations() {
        let dir = tempfile::tempdir().unwrap();
        let env = Env::create(dir.path().join("env.tdb")).unwrap();

        {
            let mut tx = env.write_txn();
            tx.state_mut().trees.name_variable("abandoned");
            // dropped without commit
        }

        let tx = env.read_txn();
        assert_eq!(tx.state().trees.id_by_name("abandoned"), None);
    }

    #[test]
    fn repeated_commits_recycle_state_runs() {
        let dir = tempfile::tempdir().unwrap();
        let env = Env::create(dir.path().join("env.tdb")).unwrap();

        for round in 0..20u32 {
            let mut tx = env.write_txn();
            let id = tx.state_mut().trees.name_variable("counter");
            tx.state_mut()
                .trees
                .variable_mut(id)
                .unwrap()
                .insert(b"round", &round.to_le_bytes());
            tx.commit().unwrap();
        }

        let tx = env.read_txn();
        // Catalog + state churn must not leak pages without bound.
        assert!(tx.state().pager.page_count() < 64);
    }

    #[test]
    fn reopen_rejects_corrupted_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("env.tdb");

        let catalog_page;
        {
            let env = Env::create(&path).unwrap();
            let mut tx = env.write_txn();
            tx.state_mut().trees.name_variable("t");
            tx.commit().unwrap();
            let tx = env.read_txn();
            catalog_page = FileHeader::from_bytes(tx.state().pager.page(0).unwrap())
                .unwrap()
                .catalog_page;
        }

        {
            let storage = MmapStorage::open(&path).unwrap();
            let mut storage = storage;
            storage.page_mut(catalog_page).unwrap()[0] ^= 0xFF;
            storage.sync().unwrap();
        }

        let err = Env::open(&path).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }
}
