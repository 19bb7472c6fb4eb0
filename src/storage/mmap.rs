//! # Memory-Mapped File Storage
//!
//! `MmapStorage` is the low-level building block for memory-mapped database
//! file access. It provides zero-copy page access with compile-time safety
//! guarantees through Rust's borrow checker.
//!
//! ## Safety Model
//!
//! Memory-mapped regions become invalid when remapped (during `grow_to()`).
//! Instead of runtime guards, TalusDB leverages the borrow checker:
//!
//! ```text
//! page(&self) -> &[u8]              // Immutable borrow of self
//! page_mut(&mut self) -> &mut [u8]  // Mutable borrow of self
//! grow_to(&mut self)                // Mutable borrow (exclusive)
//! ```
//!
//! Since `grow_to()` requires `&mut self`, the compiler ensures no page
//! references exist when the map is replaced. Zero runtime overhead, and
//! dangling-pointer bugs are caught by rustc.
//!
//! ## File Format
//!
//! Database files are concatenated pages; the file size is always a multiple
//! of `PAGE_SIZE`. Page 0 holds the file header.
//!
//! ## Contiguous Runs
//!
//! Overflow entries and serialized engine state span several physically
//! contiguous pages. `run()` / `run_mut()` return one slice covering a whole
//! run, which is what makes multi-page payloads readable without stitching.

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;

use crate::config::PAGE_SIZE;

#[derive(Debug)]
pub struct MmapStorage {
    file: File,
    mmap: MmapMut,
    page_count: u64,
}

impl MmapStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open database file '{}'", path.display()))?;

        let metadata = file
            .metadata()
            .wrap_err_with(|| format!("failed to get metadata for '{}'", path.display()))?;
        let file_size = metadata.len();

        ensure!(
            file_size > 0,
            "cannot open empty database file '{}'",
            path.display()
        );
        ensure!(
            file_size % PAGE_SIZE as u64 == 0,
            "database file '{}' size {} is not a multiple of page size {}",
            path.display(),
            file_size,
            PAGE_SIZE
        );

        let page_count = file_size / PAGE_SIZE as u64;

        // SAFETY: MmapMut::map_mut is unsafe because memory-mapped files can
        // be modified externally. This is safe because:
        // 1. The file is opened with exclusive read+write access
        // 2. Database files are not modified by external processes
        // 3. The mmap lifetime is tied to MmapStorage, preventing
        //    use-after-unmap
        // 4. All access goes through page()/run() which bounds-check
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            page_count,
        })
    }

    pub fn create<P: AsRef<Path>>(path: P, initial_page_count: u64) -> Result<Self> {
        let path = path.as_ref();

        ensure!(
            initial_page_count > 0,
            "initial page count must be at least 1"
        );

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create database file '{}'", path.display()))?;

        let file_size = initial_page_count * PAGE_SIZE as u64;
        file.set_len(file_size)
            .wrap_err_with(|| format!("failed to set file size to {} bytes", file_size))?;

        // SAFETY: see open(). The file was just created with truncate=true,
        // its size is a valid multiple of PAGE_SIZE, and the map's lifetime
        // is tied to MmapStorage.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            page_count: initial_page_count,
        })
    }

    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    /// Grows the file to at least `new_page_count` pages and remaps.
    /// Existing page contents are preserved; new pages are zeroed.
    pub fn grow_to(&mut self, new_page_count: u64) -> Result<()> {
        if new_page_count <= self.page_count {
            return Ok(());
        }

        let new_size = new_page_count * PAGE_SIZE as u64;
        self.file
            .set_len(new_size)
            .wrap_err_with(|| format!("failed to grow file to {} bytes", new_size))?;

        // SAFETY: see open(). The previous map is dropped before the new one
        // is installed, and &mut self guarantees no outstanding page slices.
        self.mmap =
            unsafe { MmapMut::map_mut(&self.file).wrap_err("failed to remap after grow")? };
        self.page_count = new_page_count;
        Ok(())
    }

    pub fn page(&self, page_no: u64) -> Result<&[u8]> {
        self.run(page_no, 1)
    }

    pub fn page_mut(&mut self, page_no: u64) -> Result<&mut [u8]> {
        self.run_mut(page_no, 1)
    }

    /// Returns one contiguous slice covering `n_pages` starting at `page_no`.
    pub fn run(&self, page_no: u64, n_pages: u64) -> Result<&[u8]> {
        ensure!(
            n_pages > 0 && page_no + n_pages <= self.page_count,
            "page run {}..{} out of bounds (page count {})",
            page_no,
            page_no + n_pages,
            self.page_count
        );
        let start = (page_no * PAGE_SIZE as u64) as usize;
        let len = (n_pages * PAGE_SIZE as u64) as usize;
        Ok(&self.mmap[start..start + len])
    }

    pub fn run_mut(&mut self, page_no: u64, n_pages: u64) -> Result<&mut [u8]> {
        ensure!(
            n_pages > 0 && page_no + n_pages <= self.page_count,
            "page run {}..{} out of bounds (page count {})",
            page_no,
            page_no + n_pages,
            self.page_count
        );
        let start = (page_no * PAGE_SIZE as u64) as usize;
        let len = (n_pages * PAGE_SIZE as u64) as usize;
        Ok(&mut self.mmap[start..start + len])
    }

    pub fn sync(&self) -> Result<()> {
        self.mmap.flush().wrap_err("failed to flush mmap")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_reopen_preserves_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.tdb");

        {
            let mut storage = MmapStorage::create(&path, 4).unwrap();
            storage.page_mut(2).unwrap()[0..4].copy_from_slice(b"talu");
            storage.sync().unwrap();
        }

        let storage = MmapStorage::open(&path).unwrap();
        assert_eq!(storage.page_count(), 4);
        assert_eq!(&storage.page(2).unwrap()[0..4], b"talu");
    }

    #[test]
    fn grow_preserves_and_zeroes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.tdb");

        let mut storage = MmapStorage::create(&path, 2).unwrap();
        storage.page_mut(1).unwrap()[100] = 0x5A;
        storage.grow_to(8).unwrap();

        assert_eq!(storage.page_count(), 8);
        assert_eq!(storage.page(1).unwrap()[100], 0x5A);
        assert!(storage.page(7).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn run_spans_contiguous_pages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.tdb");

        let mut storage = MmapStorage::create(&path, 4).unwrap();
        storage.run_mut(1, 2).unwrap()[PAGE_SIZE - 1..=PAGE_SIZE].copy_from_slice(&[1, 2]);

        assert_eq!(storage.page(1).unwrap()[PAGE_SIZE - 1], 1);
        assert_eq!(storage.page(2).unwrap()[0], 2);
    }

    #[test]
    fn out_of_bounds_run_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.tdb");

        let storage = MmapStorage::create(&path, 2).unwrap();
        assert!(storage.run(1, 2).is_err());
        assert!(storage.run(2, 1).is_err());
    }

}
