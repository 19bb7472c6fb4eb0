//! # Table Value Builder and Reader
//!
//! [`TableValueBuilder`] stages an entry's columns, serializes them into the
//! entry wire form, and optionally holds a compressed rendering negotiated
//! against a dictionary. [`TableValueReader`] is the zero-copy view over a
//! serialized (decompressed) entry.
//!
//! ## Entry Wire Form
//!
//! ```text
//! [column_count: u8][end_offset: u32 LE × count][column bytes ...]
//! ```
//!
//! End offsets are cumulative within the data area, so column `i` spans
//! `end[i-1]..end[i]` and a column *range* is one contiguous slice — which
//! is what lets by-column-range index extraction borrow instead of copy.
//!
//! ## Compression Negotiation
//!
//! `try_compression` offers the builder a dictionary; the compressed form is
//! kept only when it is strictly smaller than the raw form.
//! `should_replace_dictionary` compares a candidate dictionary against
//! whatever the builder currently holds and adopts the candidate only when
//! it wins by the configured margin — this is the gate that keeps dictionary
//! churn from thrashing on noise.
//!
//! ## Two Stored Forms
//!
//! - *Small form* (section entries): the compressed stream alone; the
//!   containing section's dictionary hash is authoritative for decoding.
//! - *Large form* (overflow runs): the 32-byte dictionary hash followed by
//!   the stream, because an overflow run has no section to name the
//!   dictionary.
//!
//! The builder owns copies of its column data, so its buffers can never
//! alias the storage location an update overwrites.

use std::sync::Arc;

use eyre::{ensure, Result};
use smallvec::SmallVec;

use crate::codec;
use crate::config::DICTIONARY_REPLACE_MARGIN;
use crate::dict::Dictionary;

/// Serializes columns into the entry wire form.
pub fn serialize_columns(columns: &[Vec<u8>]) -> Result<Vec<u8>> {
    ensure!(
        columns.len() <= u8::MAX as usize,
        "too many columns: {}",
        columns.len()
    );
    let data_len: usize = columns.iter().map(|c| c.len()).sum();
    let mut out = Vec::with_capacity(1 + columns.len() * 4 + data_len);
    out.push(columns.len() as u8);
    let mut end = 0u32;
    for column in columns {
        end += column.len() as u32;
        out.extend_from_slice(&end.to_le_bytes());
    }
    for column in columns {
        out.extend_from_slice(column);
    }
    Ok(out)
}

/// Zero-copy column access over a serialized entry.
#[derive(Debug, Clone, Copy)]
pub struct TableValueReader<'v> {
    data: &'v [u8],
}

impl<'v> TableValueReader<'v> {
    pub fn new(data: &'v [u8]) -> Result<Self> {
        ensure!(!data.is_empty(), "entry data cannot be empty");
        let count = data[0] as usize;
        let header = 1 + count * 4;
        ensure!(
            data.len() >= header,
            "entry too small for {} column offsets",
            count
        );
        let mut prev = 0u32;
        for i in 0..count {
            let end = u32::from_le_bytes(data[1 + i * 4..5 + i * 4].try_into().unwrap());
            ensure!(end >= prev, "column offsets not monotonic at {}", i);
            prev = end;
        }
        ensure!(
            header + prev as usize == data.len(),
            "entry length {} disagrees with final column offset {}",
            data.len(),
            header + prev as usize
        );
        Ok(Self { data })
    }

    pub fn data(&self) -> &'v [u8] {
        self.data
    }

    pub fn column_count(&self) -> usize {
        self.data[0] as usize
    }

    fn end_offset(&self, idx: usize) -> usize {
        u32::from_le_bytes(self.data[1 + idx * 4..5 + idx * 4].try_into().unwrap()) as usize
    }

    pub fn column(&self, idx: usize) -> Result<&'v [u8]> {
        self.column_span(idx, 1)
    }

    /// Contiguous slice covering `count` columns starting at `start`.
    pub fn column_span(&self, start: usize, count: usize) -> Result<&'v [u8]> {
        let total = self.column_count();
        ensure!(
            count >= 1 && start + count <= total,
            "column span {}+{} out of range ({} columns)",
            start,
            count,
            total
        );
        let header = 1 + total * 4;
        let from = if start == 0 {
            0
        } else {
            self.end_offset(start - 1)
        };
        let to = self.end_offset(start + count - 1);
        Ok(&self.data[header + from..header + to])
    }
}

/// Staging buffer for one entry, with optional compressed rendering.
pub struct TableValueBuilder {
    columns: SmallVec<[Vec<u8>; 8]>,
    raw: Vec<u8>,
    compressed: Option<Vec<u8>>,
    dictionary: Option<Arc<Dictionary>>,
    ratio: Option<i32>,
}

impl Default for TableValueBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TableValueBuilder {
    pub fn new() -> Self {
        Self {
            columns: SmallVec::new(),
            raw: Vec::new(),
            compressed: None,
            dictionary: None,
            ratio: None,
        }
    }

    /// Stages one column. Copies the bytes: the builder never borrows from
    /// storage, so update paths cannot alias the region they overwrite.
    pub fn add(&mut self, column: &[u8]) -> &mut Self {
        debug_assert!(self.raw.is_empty(), "add() after the builder was finalized");
        self.columns.push(column.to_vec());
        self
    }

    /// Clears all staged state for reuse.
    pub fn reset(&mut self) {
        self.columns.clear();
        self.raw.clear();
        self.compressed = None;
        self.dictionary = None;
        self.ratio = None;
    }

    /// The serialized uncompressed entry. Finalizes the builder on first
    /// call.
    pub fn raw_value(&mut self) -> Result<&[u8]> {
        if self.raw.is_empty() {
            self.raw = serialize_columns(&self.columns)?;
        }
        Ok(&self.raw)
    }

    /// Reader view over the uncompressed entry, for index extraction.
    pub fn reader(&mut self) -> Result<TableValueReader<'_>> {
        self.raw_value()?;
        TableValueReader::new(&self.raw)
    }

    /// Offers a dictionary; keeps the compressed form only when it is
    /// strictly smaller than the raw form. Recomputes from scratch, so it
    /// may be called again with a different dictionary.
    pub fn try_compression(&mut self, dictionary: &Arc<Dictionary>) -> Result<bool> {
        self.raw_value()?;
        let out = codec::compress(&self.raw, dictionary.bytes());
        let accepted = out.len() < self.raw.len();
        if accepted {
            self.ratio = Some(codec::ratio_percent(out.len(), self.raw.len()));
            self.compressed = Some(out);
        } else {
            self.ratio = None;
            self.compressed = None;
        }
        self.dictionary = Some(dictionary.clone());
        Ok(accepted)
    }

    /// Adopts `candidate` only when it beats the current rendering by at
    /// least [`DICTIONARY_REPLACE_MARGIN`] percent.
    pub fn should_replace_dictionary(&mut self, candidate: &Arc<Dictionary>) -> Result<bool> {
        self.raw_value()?;
        let out = codec::compress(&self.raw, candidate.bytes());
        let current = self
            .compressed
            .as_ref()
            .map(|c| c.len())
            .unwrap_or(self.raw.len());
        let wins = out.len() < self.raw.len()
            && (out.len() as u64) * 100
                <= (current as u64) * (100 - DICTIONARY_REPLACE_MARGIN) as u64;
        if wins {
            self.ratio = Some(codec::ratio_percent(out.len(), self.raw.len()));
            self.compressed = Some(out);
            self.dictionary = Some(candidate.clone());
        }
        Ok(wins)
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed.is_some()
    }

    pub fn compression_ratio(&self) -> Option<i32> {
        self.ratio
    }

    /// Hash of the dictionary behind the compressed form; all-zero when the
    /// builder holds no dictionary context.
    pub fn dictionary_hash(&self) -> [u8; 32] {
        self.dictionary
            .as_ref()
            .map(|d| *d.hash())
            .unwrap_or([0; 32])
    }

    /// Length of the small (section) stored form.
    pub fn size(&mut self) -> Result<usize> {
        self.raw_value()?;
        Ok(self
            .compressed
            .as_ref()
            .map(|c| c.len())
            .unwrap_or(self.raw.len()))
    }

    /// The small stored form.
    pub fn small_form(&self) -> &[u8] {
        self.compressed.as_deref().unwrap_or(&self.raw)
    }

    /// Length of the large (overflow) stored form, which prepends the
    /// dictionary hash when compressed.
    pub fn large_size(&mut self) -> Result<usize> {
        self.raw_value()?;
        Ok(match &self.compressed {
            Some(c) => 32 + c.len(),
            None => self.raw.len(),
        })
    }

    /// Copies the large stored form into `dst`.
    pub fn copy_large_to(&self, dst: &mut [u8]) {
        match &self.compressed {
            Some(c) => {
                dst[..32].copy_from_slice(&self.dictionary_hash());
                dst[32..32 + c.len()].copy_from_slice(c);
            }
            None => dst[..self.raw.len()].copy_from_slice(&self.raw),
        }
    }
}

impl std::fmt::Debug for TableValueBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableValueBuilder")
            .field("columns", &self.columns.len())
            .field("compressed", &self.is_compressed())
            .field("ratio", &self.ratio)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dict::keyed_hash32;

    fn dict_of(samples: &[&[u8]], table: &str) -> Arc<Dictionary> {
        let bytes = codec::train(samples, 4096);
        let hash = keyed_hash32(table.as_bytes(), &bytes);
        Arc::new(Dictionary::new(hash, bytes, 80))
    }

    #[test]
    fn reader_roundtrips_columns() {
        let data =
            serialize_columns(&[b"k1".to_vec(), Vec::new(), b"payload".to_vec()]).unwrap();
        let reader = TableValueReader::new(&data).unwrap();
        assert_eq!(reader.column_count(), 3);
        assert_eq!(reader.column(0).unwrap(), b"k1");
        assert_eq!(reader.column(1).unwrap(), b"");
        assert_eq!(reader.column(2).unwrap(), b"payload");
        assert!(reader.column(3).is_err());
    }

    #[test]
    fn reader_rejects_malformed_entries() {
        assert!(TableValueReader::new(&[]).is_err());
        assert!(TableValueReader::new(&[2, 1, 0, 0, 0]).is_err());

        let mut data = serialize_columns(&[b"ab".to_vec()]).unwrap();
        data.push(0xFF);
        assert!(TableValueReader::new(&data).is_err());
    }

    #[test]
    fn builder_produces_reader_over_raw_form() {
        let mut builder = TableValueBuilder::new();
        builder.add(b"alpha").add(b"A");
        let reader = builder.reader().unwrap();
        assert_eq!(reader.column(0).unwrap(), b"alpha");
        assert_eq!(reader.column(1).unwrap(), b"A");
    }

    #[test]
    fn incompressible_entries_stay_raw() {
        let mut builder = TableValueBuilder::new();
        builder.add(&[0x01, 0x7F, 0x33, 0xB2, 0x9C]);
        let dict = dict_of(&[b"unrelated dictionary content"], "t");
        assert!(!builder.try_compression(&dict).unwrap());
        assert!(!builder.is_compressed());
        assert_eq!(builder.size().unwrap(), builder.small_form().len());
    }

    #[test]
    fn repetitive_entries_compress_and_record_ratio() {
        let mut builder = TableValueBuilder::new();
        builder.add(&b"abcabcabc".repeat(40));
        let dict = dict_of(&[b"abcabcabcabc"], "t");
        assert!(builder.try_compression(&dict).unwrap());
        assert!(builder.is_compressed());
        let ratio = builder.compression_ratio().unwrap();
        assert!((1..100).contains(&ratio), "ratio {} out of range", ratio);
        assert!(builder.small_form().len() < builder.raw_value().unwrap().len());
    }

    #[test]
    fn large_form_prepends_dictionary_hash_when_compressed() {
        let mut builder = TableValueBuilder::new();
        builder.add(&b"xyzxyzxyz".repeat(50));
        let dict = dict_of(&[b"xyzxyzxyz"], "t");
        assert!(builder.try_compression(&dict).unwrap());

        let large = builder.large_size().unwrap();
        let mut dst = vec![0u8; large];
        builder.copy_large_to(&mut dst);
        assert_eq!(&dst[..32], dict.hash());
        assert_eq!(
            codec::decompress(&dst[32..], dict.bytes()).unwrap(),
            builder.raw_value().unwrap()
        );
    }

    #[test]
    fn dictionary_replacement_requires_a_real_margin() {
        let payload = b"{\"k\":\"v-000\",\"region\":\"eu\"}".repeat(4);
        let mut builder = TableValueBuilder::new();
        builder.add(&payload);

        let poor = dict_of(&[b"completely different material"], "t");
        builder.try_compression(&poor).unwrap();
        let before = builder.small_form().len();

        // A dictionary trained on the payload's own shape must win.
        let good = dict_of(&[&payload], "t");
        assert!(builder.should_replace_dictionary(&good).unwrap());
        assert!(builder.small_form().len() < before);
        assert_eq!(builder.dictionary_hash(), *good.hash());

        // Re-offering something no better than what we hold must not win.
        let mut other = TableValueBuilder::new();
        other.add(&payload);
        other.try_compression(&good).unwrap();
        assert!(!other.should_replace_dictionary(&good).unwrap());
    }

    #[test]
    fn reset_allows_reuse() {
        let mut builder = TableValueBuilder::new();
        builder.add(b"one");
        builder.raw_value().unwrap();
        builder.reset();
        builder.add(b"two");
        let reader = builder.reader().unwrap();
        assert_eq!(reader.column(0).unwrap(), b"two");
    }
}
