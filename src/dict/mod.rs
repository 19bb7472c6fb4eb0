//! # Dictionary Holder
//!
//! Process-wide cache of compression dictionaries, keyed by their 32-byte
//! hash. Dictionaries are immutable once stored: a section that names a hash
//! must always be able to decode its entries with exactly that dictionary,
//! so entries live for the life of the process and are never evicted.
//!
//! ## Lookup Protocol
//!
//! 1. The all-zero hash is the "no dictionary" sentinel: a shared empty
//!    dictionary whose expected ratio is above 100, so it can never win a
//!    replacement comparison.
//! 2. Cache hit: lock-free for readers after first publication.
//! 3. Cache miss: take the short exclusive load lock, re-check, materialize
//!    from the dictionaries tree, publish.
//!
//! A non-zero hash that the dictionaries tree cannot resolve is a fatal
//! data-integrity error; the error message carries the base64 hash for
//! operator correlation. There is no recovery path.
//!
//! ## Persisted Layout
//!
//! Rows of the `$dictionaries` variable tree:
//!
//! ```text
//! key   = 32-byte dictionary hash
//! value = [expected_ratio: i32 LE] ++ dictionary bytes
//! ```
//!
//! The hash itself is a keyed BLAKE3 of the dictionary bytes, keyed by the
//! owning table's name, so identical dictionaries from different tables do
//! not collide in the shared tree.

use std::sync::Arc;

use base64::Engine;
use eyre::{ensure, Result};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use crate::config::EXPECTED_RATIO_NONE;
use crate::env::EnvState;

/// Environment-level tree holding every trained dictionary.
pub const DICTIONARIES_TREE_NAME: &str = "$dictionaries";

/// The "no dictionary" sentinel hash.
pub const EMPTY_DICTIONARY_HASH: [u8; 32] = [0; 32];

/// Metadata persisted ahead of the dictionary bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionDictionaryInfo {
    pub expected_ratio: i32,
}

impl CompressionDictionaryInfo {
    pub const ENCODED_SIZE: usize = 4;

    pub fn encode(&self) -> [u8; Self::ENCODED_SIZE] {
        self.expected_ratio.to_le_bytes()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        ensure!(
            data.len() >= Self::ENCODED_SIZE,
            "dictionary row too short: {} bytes",
            data.len()
        );
        Ok(Self {
            expected_ratio: i32::from_le_bytes(data[..4].try_into().unwrap()),
        })
    }
}

/// A decoded dictionary handle. Shared, immutable, process-lifetime.
#[derive(Debug)]
pub struct Dictionary {
    hash: [u8; 32],
    bytes: Vec<u8>,
    expected_ratio: i32,
}

impl Dictionary {
    pub(crate) fn new(hash: [u8; 32], bytes: Vec<u8>, expected_ratio: i32) -> Self {
        Self {
            hash,
            bytes,
            expected_ratio,
        }
    }

    pub fn hash(&self) -> &[u8; 32] {
        &self.hash
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn expected_ratio(&self) -> i32 {
        self.expected_ratio
    }

    pub fn is_empty(&self) -> bool {
        self.hash == EMPTY_DICTIONARY_HASH
    }
}

/// Keyed 32-byte hash used for dictionary identity.
pub fn keyed_hash32(key: &[u8], data: &[u8]) -> [u8; 32] {
    let key = blake3::hash(key);
    *blake3::keyed_hash(key.as_bytes(), data).as_bytes()
}

#[derive(Debug)]
pub struct DictionaryHolder {
    cache: RwLock<HashMap<[u8; 32], Arc<Dictionary>>>,
    load_lock: Mutex<()>,
    empty: Arc<Dictionary>,
}

impl Default for DictionaryHolder {
    fn default() -> Self {
        Self::new()
    }
}

impl DictionaryHolder {
    pub fn new() -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            load_lock: Mutex::new(()),
            empty: Arc::new(Dictionary {
                hash: EMPTY_DICTIONARY_HASH,
                bytes: Vec::new(),
                expected_ratio: EXPECTED_RATIO_NONE,
            }),
        }
    }

    /// Resolves a dictionary handle, materializing it from the dictionaries
    /// tree on first use.
    pub fn get(&self, state: &EnvState, hash: &[u8; 32]) -> Result<Arc<Dictionary>> {
        if *hash == EMPTY_DICTIONARY_HASH {
            return Ok(self.empty.clone());
        }

        if let Some(dict) = self.cache.read().get(hash) {
            return Ok(dict.clone());
        }

        let _loading = self.load_lock.lock();
        if let Some(dict) = self.cache.read().get(hash) {
            return Ok(dict.clone());
        }

        let row = state
            .trees
            .id_by_name(DICTIONARIES_TREE_NAME)
            .and_then(|id| state.trees.variable(id).ok())
            .and_then(|tree| tree.get(hash));
        let Some(row) = row else {
            eyre::bail!(
                "dictionary not found: {}",
                base64::engine::general_purpose::STANDARD.encode(hash)
            );
        };

        let info = CompressionDictionaryInfo::decode(row)?;
        let dict = Arc::new(Dictionary {
            hash: *hash,
            bytes: row[CompressionDictionaryInfo::ENCODED_SIZE..].to_vec(),
            expected_ratio: info.expected_ratio,
        });
        self.cache.write().insert(*hash, dict.clone());
        Ok(dict)
    }
}

/// Persists a trained dictionary under its hash and publishes the handle.
pub fn store_dictionary(
    state: &mut EnvState,
    hash: [u8; 32],
    bytes: Vec<u8>,
    expected_ratio: i32,
) -> Result<Arc<Dictionary>> {
    let tree_id = state.trees.name_variable(DICTIONARIES_TREE_NAME);
    let mut row = Vec::with_capacity(CompressionDictionaryInfo::ENCODED_SIZE + bytes.len());
    row.extend_from_slice(&CompressionDictionaryInfo { expected_ratio }.encode());
    row.extend_from_slice(&bytes);
    state.trees.variable_mut(tree_id)?.insert(&hash, &row);

    let dict = Arc::new(Dictionary {
        hash,
        bytes,
        expected_ratio,
    });
    state.dictionaries.cache.write().insert(hash, dict.clone());
    Ok(dict)
}
