//! # Table Schema
//!
//! Declarative description of a table: its primary key, variable-key
//! secondary indexes, fixed-size-key secondary indexes, the table-type byte
//! stamped into every section and overflow header, and the compression
//! flag.
//!
//! ## Index Slice Sources
//!
//! An index extracts its key from an entry in one of three ways:
//!
//! - **Column range**: a contiguous span of columns. Columns are serialized
//!   back-to-back, so the span is a single slice of the entry.
//! - **Column value**: one column; fixed-size indexes read it as a
//!   little-endian `u64`.
//! - **Custom extractor**: a named function pointer injected at schema
//!   build time. The name participates in the canonical encoding so two
//!   schemas with different extractors never validate as equal.
//!
//! ## Canonical Encoding
//!
//! The schema's canonical byte encoding is stored under the table root on
//! creation and compared byte-for-byte on every subsequent open. Any
//! difference is a schema-mismatch error; there is no schema evolution.
//!
//! ## Local vs Global Indexes
//!
//! A local index lives under the table root and counts toward the table's
//! per-index entry invariants. A global index lives under an
//! environment-level name and is shared by every table that declares it
//! with a compatible schema.

use std::borrow::Cow;

use eyre::{ensure, Result};

use super::builder::TableValueReader;

/// Extracts an index slice from an entry.
pub type SliceExtractorFn = fn(&TableValueReader<'_>) -> Result<Vec<u8>>;

/// Extracts a 64-bit index key from an entry.
pub type KeyExtractorFn = fn(&TableValueReader<'_>) -> Result<u64>;

#[derive(Clone)]
pub enum SliceSource {
    /// Contiguous span of `count` columns starting at `start`.
    ColumnRange { start: usize, count: usize },
    /// A single column.
    Column(usize),
    /// Caller-supplied extractor, identified by name in the canonical
    /// encoding.
    Custom {
        tag: &'static str,
        extract: SliceExtractorFn,
    },
}

impl SliceSource {
    pub fn extract<'v>(&self, reader: &TableValueReader<'v>) -> Result<Cow<'v, [u8]>> {
        match self {
            SliceSource::ColumnRange { start, count } => {
                Ok(Cow::Borrowed(reader.column_span(*start, *count)?))
            }
            SliceSource::Column(idx) => Ok(Cow::Borrowed(reader.column(*idx)?)),
            SliceSource::Custom { extract, .. } => Ok(Cow::Owned(extract(reader)?)),
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            SliceSource::ColumnRange { start, count } => {
                out.push(0);
                out.extend_from_slice(&(*start as u16).to_le_bytes());
                out.extend_from_slice(&(*count as u16).to_le_bytes());
            }
            SliceSource::Column(idx) => {
                out.push(1);
                out.extend_from_slice(&(*idx as u16).to_le_bytes());
            }
            SliceSource::Custom { tag, .. } => {
                out.push(2);
                encode_str(out, tag);
            }
        }
    }
}

impl std::fmt::Debug for SliceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SliceSource::ColumnRange { start, count } => f
                .debug_struct("ColumnRange")
                .field("start", start)
                .field("count", count)
                .finish(),
            SliceSource::Column(idx) => f.debug_tuple("Column").field(idx).finish(),
            SliceSource::Custom { tag, .. } => f.debug_tuple("Custom").field(tag).finish(),
        }
    }
}

#[derive(Clone)]
pub enum KeySource {
    /// A single column holding a little-endian `u64`.
    Column(usize),
    /// Caller-supplied extractor, identified by name in the canonical
    /// encoding.
    Custom {
        tag: &'static str,
        extract: KeyExtractorFn,
    },
}

impl KeySource {
    pub fn extract(&self, reader: &TableValueReader<'_>) -> Result<u64> {
        match self {
            KeySource::Column(idx) => {
                let column = reader.column(*idx)?;
                ensure!(
                    column.len() == 8,
                    "fixed-index column {} is {} bytes, expected 8",
                    idx,
                    column.len()
                );
                Ok(u64::from_le_bytes(column.try_into().unwrap()))
            }
            KeySource::Custom { extract, .. } => extract(reader),
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            KeySource::Column(idx) => {
                out.push(1);
                out.extend_from_slice(&(*idx as u16).to_le_bytes());
            }
            KeySource::Custom { tag, .. } => {
                out.push(2);
                encode_str(out, tag);
            }
        }
    }
}

impl std::fmt::Debug for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::Column(idx) => f.debug_tuple("Column").field(idx).finish(),
            KeySource::Custom { tag, .. } => f.debug_tuple("Custom").field(tag).finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PrimaryKeyDef {
    pub name: String,
    pub source: SliceSource,
}

#[derive(Debug, Clone)]
pub struct SecondaryIndexDef {
    pub name: String,
    pub source: SliceSource,
    pub global: bool,
}

#[derive(Debug, Clone)]
pub struct FixedIndexDef {
    pub name: String,
    pub source: KeySource,
    pub global: bool,
}

#[derive(Debug, Clone)]
pub struct TableSchema {
    pub table_type: u8,
    pub compressed: bool,
    primary: Option<PrimaryKeyDef>,
    pub indexes: Vec<SecondaryIndexDef>,
    pub fixed_indexes: Vec<FixedIndexDef>,
}

impl TableSchema {
    pub fn new(table_type: u8) -> Self {
        Self {
            table_type,
            compressed: false,
            primary: None,
            indexes: Vec::new(),
            fixed_indexes: Vec::new(),
        }
    }

    pub fn compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    pub fn with_primary(mut self, name: &str, source: SliceSource) -> Self {
        self.primary = Some(PrimaryKeyDef {
            name: name.to_string(),
            source,
        });
        self
    }

    pub fn with_index(mut self, name: &str, source: SliceSource) -> Self {
        self.indexes.push(SecondaryIndexDef {
            name: name.to_string(),
            source,
            global: false,
        });
        self
    }

    pub fn with_global_index(mut self, name: &str, source: SliceSource) -> Self {
        self.indexes.push(SecondaryIndexDef {
            name: name.to_string(),
            source,
            global: true,
        });
        self
    }

    pub fn with_fixed_index(mut self, name: &str, source: KeySource) -> Self {
        self.fixed_indexes.push(FixedIndexDef {
            name: name.to_string(),
            source,
            global: false,
        });
        self
    }

    pub fn with_global_fixed_index(mut self, name: &str, source: KeySource) -> Self {
        self.fixed_indexes.push(FixedIndexDef {
            name: name.to_string(),
            source,
            global: true,
        });
        self
    }

    pub fn primary(&self) -> Result<&PrimaryKeyDef> {
        self.primary
            .as_ref()
            .ok_or_else(|| eyre::eyre!("schema has no primary key"))
    }

    /// Canonical encoding, stored on creation and compared on open.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![1u8, self.table_type, self.compressed as u8];
        match &self.primary {
            Some(primary) => {
                out.push(1);
                encode_str(&mut out, &primary.name);
                primary.source.encode_into(&mut out);
            }
            None => out.push(0),
        }
        out.extend_from_slice(&(self.indexes.len() as u16).to_le_bytes());
        for index in &self.indexes {
            encode_str(&mut out, &index.name);
            out.push(index.global as u8);
            index.source.encode_into(&mut out);
        }
        out.extend_from_slice(&(self.fixed_indexes.len() as u16).to_le_bytes());
        for index in &self.fixed_indexes {
            encode_str(&mut out, &index.name);
            out.push(index.global as u8);
            index.source.encode_into(&mut out);
        }
        out
    }
}

/// 64-bit identifier of the logical table owning a section or overflow run.
pub fn owner_hash(table_name: &str) -> u64 {
    let digest = blake3::hash(table_name.as_bytes());
    u64::from_le_bytes(digest.as_bytes()[..8].try_into().unwrap())
}

fn encode_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u16).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::builder::serialize_columns;

    fn reader_data() -> Vec<u8> {
        serialize_columns(&[b"alpha".to_vec(), b"beta".to_vec(), 42u64.to_le_bytes().to_vec()])
            .unwrap()
    }

    #[test]
    fn column_source_extracts_single_column() {
        let data = reader_data();
        let reader = TableValueReader::new(&data).unwrap();
        let slice = SliceSource::Column(1).extract(&reader).unwrap();
        assert_eq!(&*slice, b"beta");
    }

    #[test]
    fn column_range_source_extracts_contiguous_span() {
        let data = reader_data();
        let reader = TableValueReader::new(&data).unwrap();
        let slice = SliceSource::ColumnRange { start: 0, count: 2 }
            .extract(&reader)
            .unwrap();
        assert_eq!(&*slice, b"alphabeta");
    }

    #[test]
    fn key_source_reads_little_endian_u64() {
        let data = reader_data();
        let reader = TableValueReader::new(&data).unwrap();
        assert_eq!(KeySource::Column(2).extract(&reader).unwrap(), 42);
        assert!(KeySource::Column(0).extract(&reader).is_err());
    }

    #[test]
    fn custom_extractors_are_named_in_the_encoding() {
        fn upper_first(reader: &TableValueReader<'_>) -> Result<Vec<u8>> {
            Ok(reader.column(0)?.to_ascii_uppercase())
        }

        let a = TableSchema::new(1).with_primary(
            "pk",
            SliceSource::Custom {
                tag: "upper-first",
                extract: upper_first,
            },
        );
        let b = TableSchema::new(1).with_primary(
            "pk",
            SliceSource::Custom {
                tag: "other",
                extract: upper_first,
            },
        );
        assert_ne!(a.encode(), b.encode());

        let data = reader_data();
        let reader = TableValueReader::new(&data).unwrap();
        let slice = a.primary().unwrap().source.extract(&reader).unwrap();
        assert_eq!(&*slice, b"ALPHA");
    }

    #[test]
    fn encoding_distinguishes_every_declaration() {
        let base = TableSchema::new(1).with_primary("pk", SliceSource::Column(0));
        let with_index = base.clone().with_index("by-name", SliceSource::Column(1));
        let with_global = base
            .clone()
            .with_global_index("by-name", SliceSource::Column(1));
        let compressed = base.clone().compressed(true);
        let with_fixed = base.clone().with_fixed_index("by-num", KeySource::Column(2));

        let encodings = [
            base.encode(),
            with_index.encode(),
            with_global.encode(),
            compressed.encode(),
            with_fixed.encode(),
        ];
        for (i, a) in encodings.iter().enumerate() {
            for (j, b) in encodings.iter().enumerate() {
                if i != j {
                    assert_ne!(a, b, "encodings {} and {} collide", i, j);
                }
            }
        }
    }

    #[test]
    fn owner_hash_is_stable_and_distinct() {
        assert_eq!(owner_hash("orders"), owner_hash("orders"));
        assert_ne!(owner_hash("orders"), owner_hash("users"));
    }
}
