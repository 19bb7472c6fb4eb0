//! # TalusDB Configuration Constants
//!
//! This module centralizes all configuration constants, grouping interdependent
//! values together and documenting their relationships. Constants that depend
//! on each other are co-located to prevent mismatch bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (8192 bytes)
//!       │
//!       ├─> FILE_HEADER_SIZE (128 bytes, page 0 only)
//!       │
//!       ├─> SECTION_DATA_HEADER_SIZE (16 bytes, every section data page)
//!       │     │
//!       │     └─> MAX_ITEM_SIZE (derived: usable data-page half)
//!       │           Entries needing ENTRY_HEADER_SIZE + payload >= MAX_ITEM_SIZE
//!       │           are routed to overflow page runs instead of sections.
//!       │
//!       └─> OVERFLOW_HEADER_SIZE (16 bytes, first page of an overflow run)
//!
//! INITIAL_SECTION_DATA_PAGES (8)
//!       │
//!       └─> Section growth doubles the previous section's data pages,
//!           capped at MAX_SECTION_DATA_PAGES (256 on 32-bit hosts,
//!           8192 otherwise).
//!
//! CANDIDATE_DENSITY (0.15) < RETAIN_DENSITY (0.5)
//!       │
//!       └─> The delete path compares post-free section density against
//!           these in order; reversing them would make every section a
//!           compaction victim.
//! ```
//!
//! ## Critical Invariants
//!
//! 1. `MAX_ITEM_SIZE + SECTION_DATA_HEADER_SIZE <= PAGE_SIZE` (a maximal
//!    small entry must fit in one data page)
//! 2. `CANDIDATE_DENSITY < RETAIN_DENSITY` (delete-path ordering)
//! 3. `INITIAL_SECTION_DATA_PAGES <= MAX_SECTION_DATA_PAGES`
//!
//! ## Usage
//!
//! Import constants from this module rather than defining them locally:
//!
//! ```ignore
//! use crate::config::{PAGE_SIZE, MAX_ITEM_SIZE};
//! ```

/// Size of every page in bytes.
pub const PAGE_SIZE: usize = 8192;

/// Size of the file header on page 0.
pub const FILE_HEADER_SIZE: usize = 128;

/// Header at the start of every section data page. Carries the owning
/// section's page number so any id can be resolved back to its section.
pub const SECTION_DATA_HEADER_SIZE: usize = 16;

/// Per-entry header inside a section data page: allocated size, used size,
/// compressed/free flag bits.
pub const ENTRY_HEADER_SIZE: usize = 4;

/// Header at the start of the first page of an overflow run.
pub const OVERFLOW_HEADER_SIZE: usize = 16;

/// Largest allocation a raw-data section will accept, header included.
/// Anything larger goes to an overflow run. Half a data page keeps at least
/// two entries per page, which keeps section density meaningful.
pub const MAX_ITEM_SIZE: usize = (PAGE_SIZE - SECTION_DATA_HEADER_SIZE) / 2;

/// Data pages in the first section a table creates. Sections double on each
/// active-section switch until they hit [`MAX_SECTION_DATA_PAGES`].
pub const INITIAL_SECTION_DATA_PAGES: usize = 8;

/// Section growth cap in data pages.
#[cfg(target_pointer_width = "32")]
pub const MAX_SECTION_DATA_PAGES: usize = 256;

/// Section growth cap in data pages.
#[cfg(not(target_pointer_width = "32"))]
pub const MAX_SECTION_DATA_PAGES: usize = 8192;

/// Post-free density at or below which a section is compacted away.
pub const CANDIDATE_DENSITY: f64 = 0.15;

/// Post-free density above which a section is left alone.
pub const RETAIN_DENSITY: f64 = 0.5;

/// Target size of a trained compression dictionary in bytes.
pub const DICTIONARY_MAX_SIZE: usize = 4096;

/// Cap on the total bytes sampled from a section when training a dictionary.
pub const TRAINING_CORPUS_CAP: usize = 512 * 1024;

/// Expected-ratio sentinel for the empty (all-zero hash) dictionary. Ratios
/// are percentages of the raw size, so anything above 100 can never win a
/// replacement comparison.
pub const EXPECTED_RATIO_NONE: i32 = 101;

/// A candidate dictionary must compress the probe entry to at most
/// `100 - DICTIONARY_REPLACE_MARGIN` percent of the current dictionary's
/// output before it replaces the current one.
pub const DICTIONARY_REPLACE_MARGIN: i32 = 10;

/// Training is skipped while `min_observed_ratio + TRAINING_GATE_MARGIN`
/// is still at least the current dictionary's expected ratio.
pub const TRAINING_GATE_MARGIN: i32 = 10;

const _: () = assert!(MAX_ITEM_SIZE + SECTION_DATA_HEADER_SIZE <= PAGE_SIZE);
const _: () = assert!(CANDIDATE_DENSITY < RETAIN_DENSITY);
const _: () = assert!(INITIAL_SECTION_DATA_PAGES <= MAX_SECTION_DATA_PAGES);
const _: () = assert!(ENTRY_HEADER_SIZE < MAX_ITEM_SIZE);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_item_size_leaves_room_for_two_entries() {
        assert!(MAX_ITEM_SIZE * 2 <= PAGE_SIZE - SECTION_DATA_HEADER_SIZE + 1);
    }

    #[test]
    fn density_thresholds_are_ordered() {
        assert!(CANDIDATE_DENSITY < RETAIN_DENSITY);
        assert!(RETAIN_DENSITY < 1.0);
    }

    #[test]
    fn empty_dictionary_ratio_never_wins_replacement() {
        assert!(EXPECTED_RATIO_NONE > 100);
    }
}
