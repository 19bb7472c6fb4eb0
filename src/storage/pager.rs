//! # Pager — Page Allocation over Memory-Mapped Storage
//!
//! The pager owns the [`MmapStorage`] map and a page-state table with one
//! byte per page (see [`super::page::flags`]). It hands out runs of
//! physically contiguous pages, frees them back into the pool, and grows the
//! file on demand.
//!
//! ## Allocation Strategy
//!
//! First-fit over the state table, starting from a rotating hint:
//!
//! 1. Scan for `n` consecutive FREE pages from the hint, wrapping once.
//! 2. If nothing fits, grow the file. A trailing free run at the end of the
//!    file is extended rather than abandoned, so growth never strands a
//!    partial run.
//!
//! Freed runs are simply marked FREE; adjacent free runs coalesce naturally
//! because the scan only looks at per-page state.
//!
//! ## Persistence
//!
//! The state table is not written back per-operation. The environment
//! serializes it (CRC-protected) into dedicated state pages at commit and
//! restores it on open, mirroring how the catalog of trees is persisted.

use eyre::{bail, ensure, Result};

use super::mmap::MmapStorage;
use super::page::flags;

#[derive(Debug)]
pub struct Pager {
    storage: MmapStorage,
    states: Vec<u8>,
    alloc_hint: u64,
}

impl Pager {
    /// Wraps freshly-created storage. Page 0 is reserved for the file header.
    pub fn new(storage: MmapStorage) -> Self {
        let mut states = vec![flags::FREE; storage.page_count() as usize];
        states[0] = flags::STATE;
        Self {
            storage,
            states,
            alloc_hint: 1,
        }
    }

    /// Wraps reopened storage with a restored page-state table.
    pub fn with_states(storage: MmapStorage, states: Vec<u8>) -> Result<Self> {
        ensure!(
            states.len() as u64 == storage.page_count(),
            "page-state table length {} != page count {}",
            states.len(),
            storage.page_count()
        );
        Ok(Self {
            storage,
            states,
            alloc_hint: 1,
        })
    }

    pub fn page_count(&self) -> u64 {
        self.storage.page_count()
    }

    pub fn states(&self) -> &[u8] {
        &self.states
    }

    pub fn state(&self, page: u64) -> u8 {
        self.states
            .get(page as usize)
            .copied()
            .unwrap_or(flags::FREE)
    }

    pub fn set_state(&mut self, page: u64, state: u8) {
        if let Some(slot) = self.states.get_mut(page as usize) {
            *slot = state;
        }
    }

    pub fn is_free(&self, page: u64) -> bool {
        self.state(page) == flags::FREE
    }

    /// Replaces the state table with a snapshot taken earlier against the
    /// same file, padding with FREE for pages added since the snapshot.
    pub fn restore_states(&mut self, mut states: Vec<u8>) {
        states.resize(self.page_count() as usize, flags::FREE);
        self.states = states;
        self.alloc_hint = 1;
    }

    /// Allocates `n_pages` physically contiguous pages, all marked with
    /// `state`, growing the file when the pool is exhausted.
    pub fn allocate(&mut self, n_pages: u64, state: u8) -> Result<u64> {
        ensure!(n_pages > 0, "cannot allocate an empty page run");
        ensure!(state != flags::FREE, "cannot allocate pages as FREE");

        if let Some(start) = self.find_free_run(n_pages) {
            self.mark(start, n_pages, state);
            return Ok(start);
        }

        // Extend a trailing free run instead of abandoning it.
        let page_count = self.page_count();
        let mut start = page_count;
        while start > 1 && self.states[start as usize - 1] == flags::FREE {
            start -= 1;
        }

        let needed = start + n_pages;
        let grown = needed.max(page_count + page_count / 2).max(page_count + 8);
        self.storage.grow_to(grown)?;
        self.states.resize(grown as usize, flags::FREE);

        self.mark(start, n_pages, state);
        Ok(start)
    }

    /// Returns a run to the free pool and zeroes its first page header area
    /// so stale section/overflow headers cannot be misread later.
    pub fn free_run(&mut self, page: u64, n_pages: u64) -> Result<()> {
        ensure!(
            page > 0 && page + n_pages <= self.page_count(),
            "free of page run {}..{} out of bounds",
            page,
            page + n_pages
        );
        for p in page..page + n_pages {
            if self.states[p as usize] == flags::FREE {
                bail!("double free of page {}", p);
            }
            self.states[p as usize] = flags::FREE;
        }
        self.storage.page_mut(page)?[..crate::config::OVERFLOW_HEADER_SIZE].fill(0);
        if page < self.alloc_hint {
            self.alloc_hint = page;
        }
        Ok(())
    }

    pub fn page(&self, page: u64) -> Result<&[u8]> {
        self.storage.page(page)
    }

    pub fn page_mut(&mut self, page: u64) -> Result<&mut [u8]> {
        self.storage.page_mut(page)
    }

    pub fn run(&self, page: u64, n_pages: u64) -> Result<&[u8]> {
        self.storage.run(page, n_pages)
    }

    pub fn run_mut(&mut self, page: u64, n_pages: u64) -> Result<&mut [u8]> {
        self.storage.run_mut(page, n_pages)
    }

    pub fn sync(&self) -> Result<()> {
        self.storage.sync()
    }

    fn find_free_run(&mut self, n_pages: u64) -> Option<u64> {
        let page_count = self.page_count();
        let hint = self.alloc_hint.clamp(1, page_count);

        for scan_start in [hint, 1] {
            let mut run_start = scan_start;
            let mut run_len = 0u64;
            for p in scan_start..page_count {
                if self.states[p as usize] == flags::FREE {
                    if run_len == 0 {
                        run_start = p;
                    }
                    run_len += 1;
                    if run_len == n_pages {
                        self.alloc_hint = run_start + n_pages;
                        return Some(run_start);
                    }
                } else {
                    run_len = 0;
                }
            }
            if scan_start == 1 {
                break;
            }
        }
        None
    }

    fn mark(&mut self, start: u64, n_pages: u64, state: u8) {
        for p in start..start + n_pages {
            self.states[p as usize] = state;
        }
    }
}
