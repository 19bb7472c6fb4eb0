//! # Tree Registry — Ordered Maps of the Environment
//!
//! Every persistent structure above the page level is a tree: table roots,
//! primary and secondary indexes, the dictionaries tree, and the fixed-size
//! section sets. This module provides both tree shapes and the registry that
//! owns them:
//!
//! - [`VarTree`]: ordered map from variable byte keys to byte values.
//!   Lexicographic order, range/prefix iteration in both directions.
//! - [`FixedTree`]: ordered map from `u64` keys to fixed-width values.
//!   Numeric order; `value_size == 0` makes it a set (used for the
//!   inactive/candidate section sets).
//! - [`TreeRegistry`]: id-keyed ownership of every tree, with optional names
//!   for top-level structures. Nested trees (the per-key id sets behind
//!   variable secondary indexes) are anonymous ids referenced from outer
//!   tree values.
//!
//! ## Mutation and Commit
//!
//! Trees mutate in memory; the environment serializes the whole registry
//! into catalog pages at commit and restores it on open. A write transaction
//! that is dropped without committing has its registry snapshot restored, so
//! uncommitted logical state never becomes reachable.
//!
//! ## Serialized Catalog Layout
//!
//! ```text
//! [next_id: u64]
//! [name_count: u32] { [len: u32][name bytes][id: u64] } ...   (sorted by name)
//! [tree_count: u32] { [id: u64][kind: u8] body } ...          (sorted by id)
//!   kind 0 (variable): [count: u64] { [klen: u32][key][vlen: u32][value] }
//!   kind 1 (fixed):    [value_size: u32][count: u64] { [key: u64][value] }
//! ```
//!
//! All integers little-endian. The environment wraps the whole catalog in a
//! CRC-32 checksum.

use std::collections::BTreeMap;
use std::ops::Bound;

use eyre::{bail, ensure, Result};
use hashbrown::HashMap;

const KIND_VARIABLE: u8 = 0;
const KIND_FIXED: u8 = 1;

#[derive(Debug, Clone, Default)]
pub struct VarTree {
    map: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl VarTree {
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.map.get(key).map(|v| v.as_slice())
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.map.contains_key(key)
    }

    /// Inserts or replaces, returning the previous value.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Option<Vec<u8>> {
        self.map.insert(key.to_vec(), value.to_vec())
    }

    /// Returns false without touching the tree when the key already exists.
    pub fn insert_new(&mut self, key: &[u8], value: &[u8]) -> bool {
        if self.map.contains_key(key) {
            return false;
        }
        self.map.insert(key.to_vec(), value.to_vec());
        true
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.remove(key)
    }

    pub fn range<'a>(
        &'a self,
        bounds: (Bound<&'a [u8]>, Bound<&'a [u8]>),
    ) -> impl DoubleEndedIterator<Item = (&'a [u8], &'a [u8])> + 'a {
        self.map
            .range::<[u8], _>(bounds)
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (&[u8], &[u8])> + '_ {
        self.map.iter().map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    /// First key at or after `key`, ascending.
    pub fn first_at_or_after<'a>(&'a self, key: &'a [u8]) -> Option<(&'a [u8], &'a [u8])> {
        self.range((Bound::Included(key), Bound::Unbounded)).next()
    }
}

#[derive(Debug, Clone)]
pub struct FixedTree {
    value_size: usize,
    map: BTreeMap<u64, Vec<u8>>,
}

impl FixedTree {
    pub fn new(value_size: usize) -> Self {
        Self {
            value_size,
            map: BTreeMap::new(),
        }
    }

    pub fn value_size(&self) -> usize {
        self.value_size
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&self, key: u64) -> Option<&[u8]> {
        self.map.get(&key).map(|v| v.as_slice())
    }

    pub fn contains(&self, key: u64) -> bool {
        self.map.contains_key(&key)
    }

    pub fn insert(&mut self, key: u64, value: &[u8]) -> Result<Option<Vec<u8>>> {
        ensure!(
            value.len() == self.value_size,
            "fixed tree value size {} != declared {}",
            value.len(),
            self.value_size
        );
        Ok(self.map.insert(key, value.to_vec()))
    }

    pub fn remove(&mut self, key: u64) -> bool {
        self.map.remove(&key).is_some()
    }

    pub fn range(
        &self,
        bounds: (Bound<u64>, Bound<u64>),
    ) -> impl DoubleEndedIterator<Item = (u64, &[u8])> + '_ {
        self.map.range(bounds).map(|(k, v)| (*k, v.as_slice()))
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (u64, &[u8])> + '_ {
        self.map.iter().map(|(k, v)| (*k, v.as_slice()))
    }

    pub fn first_key(&self) -> Option<u64> {
        self.map.keys().next().copied()
    }
}

#[derive(Debug, Clone)]
pub enum Tree {
    Variable(VarTree),
    Fixed(FixedTree),
}

#[derive(Debug, Clone, Default)]
pub struct TreeRegistry {
    next_id: u64,
    trees: HashMap<u64, Tree>,
    names: HashMap<String, u64>,
}

impl TreeRegistry {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            trees: HashMap::new(),
            names: HashMap::new(),
        }
    }

    pub fn create_variable(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.trees.insert(id, Tree::Variable(VarTree::default()));
        id
    }

    pub fn create_fixed(&mut self, value_size: usize) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.trees.insert(id, Tree::Fixed(FixedTree::new(value_size)));
        id
    }

    pub fn id_by_name(&self, name: &str) -> Option<u64> {
        self.names.get(name).copied()
    }

    pub fn name_variable(&mut self, name: &str) -> u64 {
        if let Some(id) = self.id_by_name(name) {
            return id;
        }
        let id = self.create_variable();
        self.names.insert(name.to_string(), id);
        id
    }

    pub fn name_fixed(&mut self, name: &str, value_size: usize) -> u64 {
        if let Some(id) = self.id_by_name(name) {
            return id;
        }
        let id = self.create_fixed(value_size);
        self.names.insert(name.to_string(), id);
        id
    }

    pub fn drop_tree(&mut self, id: u64) {
        self.trees.remove(&id);
        self.names.retain(|_, v| *v != id);
    }

    pub fn variable(&self, id: u64) -> Result<&VarTree> {
        match self.trees.get(&id) {
            Some(Tree::Variable(tree)) => Ok(tree),
            Some(Tree::Fixed(_)) => bail!("tree {} is not a variable tree", id),
            None => bail!("tree {} not found", id),
        }
    }

    pub fn variable_mut(&mut self, id: u64) -> Result<&mut VarTree> {
        match self.trees.get_mut(&id) {
            Some(Tree::Variable(tree)) => Ok(tree),
            Some(Tree::Fixed(_)) => bail!("tree {} is not a variable tree", id),
            None => bail!("tree {} not found", id),
        }
    }

    pub fn fixed(&self, id: u64) -> Result<&FixedTree> {
        match self.trees.get(&id) {
            Some(Tree::Fixed(tree)) => Ok(tree),
            Some(Tree::Variable(_)) => bail!("tree {} is not a fixed tree", id),
            None => bail!("tree {} not found", id),
        }
    }

    pub fn fixed_mut(&mut self, id: u64) -> Result<&mut FixedTree> {
        match self.trees.get_mut(&id) {
            Some(Tree::Fixed(tree)) => Ok(tree),
            Some(Tree::Variable(_)) => bail!("tree {} is not a fixed tree", id),
            None => bail!("tree {} not found", id),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.next_id.to_le_bytes());

        let mut names: Vec<(&String, u64)> = self.names.iter().map(|(k, v)| (k, *v)).collect();
        names.sort();
        out.extend_from_slice(&(names.len() as u32).to_le_bytes());
        for (name, id) in names {
            out.extend_from_slice(&(name.len() as u32).to_le_bytes());
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(&id.to_le_bytes());
        }

        let mut ids: Vec<u64> = self.trees.keys().copied().collect();
        ids.sort_unstable();
        out.extend_from_slice(&(ids.len() as u32).to_le_bytes());
        for id in ids {
            out.extend_from_slice(&id.to_le_bytes());
            match &self.trees[&id] {
                Tree::Variable(tree) => {
                    out.push(KIND_VARIABLE);
                    out.extend_from_slice(&(tree.map.len() as u64).to_le_bytes());
                    for (k, v) in &tree.map {
                        out.extend_from_slice(&(k.len() as u32).to_le_bytes());
                        out.extend_from_slice(k);
                        out.extend_from_slice(&(v.len() as u32).to_le_bytes());
                        out.extend_from_slice(v);
                    }
                }
                Tree::Fixed(tree) => {
                    out.push(KIND_FIXED);
                    out.extend_from_slice(&(tree.value_size as u32).to_le_bytes());
                    out.extend_from_slice(&(tree.map.len() as u64).to_le_bytes());
                    for (k, v) in &tree.map {
                        out.extend_from_slice(&k.to_le_bytes());
                        out.extend_from_slice(v);
                    }
                }
            }
        }
        out
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor { data, pos: 0 };
        let next_id = cursor.u64()?;

        let mut names = HashMap::new();
        let name_count = cursor.u32()? as usize;
        for _ in 0..name_count {
            let len = cursor.u32()? as usize;
            let name = String::from_utf8(cursor.bytes(len)?.to_vec())
                .map_err(|e| eyre::eyre!("catalog name is not utf-8: {}", e))?;
            let id = cursor.u64()?;
            names.insert(name, id);
        }

        let mut trees = HashMap::new();
        let tree_count = cursor.u32()? as usize;
        for _ in 0..tree_count {
            let id = cursor.u64()?;
            let kind = cursor.u8()?;
            match kind {
                KIND_VARIABLE => {
                    let count = cursor.u64()? as usize;
                    let mut map = BTreeMap::new();
                    for _ in 0..count {
                        let klen = cursor.u32()? as usize;
                        let key = cursor.bytes(klen)?.to_vec();
                        let vlen = cursor.u32()? as usize;
                        let value = cursor.bytes(vlen)?.to_vec();
                        map.insert(key, value);
                    }
                    trees.insert(id, Tree::Variable(VarTree { map }));
                }
                KIND_FIXED => {
                    let value_size = cursor.u32()? as usize;
                    let count = cursor.u64()? as usize;
                    let mut map = BTreeMap::new();
                    for _ in 0..count {
                        let key = cursor.u64()?;
                        let value = cursor.bytes(value_size)?.to_vec();
                        map.insert(key, value);
                    }
                    trees.insert(id, Tree::Fixed(FixedTree { value_size, map }));
                }
                other => bail!("unknown tree kind {} in catalog", other),
            }
        }

        ensure!(
            cursor.pos == data.len(),
            "trailing bytes in catalog: {} of {}",
            data.len() - cursor.pos,
            data.len()
        );

        Ok(Self {
            next_id,
            trees,
            names,
        })
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        ensure!(
            self.pos + len <= self.data.len(),
            "catalog truncated at offset {}",
            self.pos
        );
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_new_rejects_duplicates() {
        let mut tree = VarTree::default();
        assert!(tree.insert_new(b"alpha", b"1"));
        assert!(!tree.insert_new(b"alpha", b"2"));
        assert_eq!(tree.get(b"alpha"), Some(b"1".as_slice()));
    }

    #[test]
    fn var_tree_ranges_both_directions() {
        let mut tree = VarTree::default();
        for key in ["a", "b", "c", "d"] {
            tree.insert(key.as_bytes(), b"v");
        }

        let forward: Vec<&[u8]> = tree
            .range((Bound::Included(b"b".as_slice()), Bound::Unbounded))
            .map(|(k, _)| k)
            .collect();
        assert_eq!(forward, vec![b"b".as_slice(), b"c", b"d"]);

        let backward: Vec<&[u8]> = tree
            .range((Bound::Unbounded, Bound::Excluded(b"c".as_slice())))
            .rev()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(backward, vec![b"b".as_slice(), b"a"]);
    }

    #[test]
    fn fixed_tree_enforces_value_size() {
        let mut tree = FixedTree::new(8);
        assert!(tree.insert(1, &7u64.to_le_bytes()).is_ok());
        assert!(tree.insert(2, b"short").is_err());
    }

    #[test]
    fn fixed_tree_iterates_in_numeric_order() {
        let mut tree = FixedTree::new(0);
        for key in [300u64, 2, 1_000_000, 45] {
            tree.insert(key, &[]).unwrap();
        }
        let keys: Vec<u64> = tree.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![2, 45, 300, 1_000_000]);
    }

    #[test]
    fn registry_assigns_distinct_ids_and_names() {
        let mut registry = TreeRegistry::new();
        let a = registry.name_variable("root-a");
        let b = registry.name_fixed("set-b", 0);
        assert_ne!(a, b);
        assert_eq!(registry.id_by_name("root-a"), Some(a));
        assert_eq!(registry.name_variable("root-a"), a);
        assert!(registry.variable(a).is_ok());
        assert!(registry.fixed(a).is_err());
        assert!(registry.fixed(b).is_ok());
    }

    #[test]
    fn drop_tree_removes_id_and_name() {
        let mut registry = TreeRegistry::new();
        let id = registry.name_variable("doomed");
        registry.drop_tree(id);
        assert!(registry.variable(id).is_err());
        assert_eq!(registry.id_by_name("doomed"), None);
    }

    #[test]
    fn catalog_roundtrip_preserves_everything() {
        let mut registry = TreeRegistry::new();
        let root = registry.name_variable("table-root");
        let set = registry.name_fixed("sections", 0);
        let anon = registry.create_fixed(8);

        registry
            .variable_mut(root)
            .unwrap()
            .insert(b"stats", &[1u8; 16]);
        registry.fixed_mut(set).unwrap().insert(42, &[]).unwrap();
        registry
            .fixed_mut(anon)
            .unwrap()
            .insert(7, &99u64.to_le_bytes())
            .unwrap();

        let bytes = registry.serialize();
        let restored = TreeRegistry::deserialize(&bytes).unwrap();

        assert_eq!(restored.id_by_name("table-root"), Some(root));
        assert_eq!(
            restored.variable(root).unwrap().get(b"stats"),
            Some([1u8; 16].as_slice())
        );
        assert!(restored.fixed(set).unwrap().contains(42));
        assert_eq!(
            restored.fixed(anon).unwrap().get(7),
            Some(99u64.to_le_bytes().as_slice())
        );

        // New ids in the restored registry must not collide with old ones.
        let mut restored = restored;
        let fresh = restored.create_variable();
        assert!(fresh > anon);
    }

    #[test]
    fn truncated_catalog_is_rejected() {
        let mut registry = TreeRegistry::new();
        registry.name_variable("x");
        let bytes = registry.serialize();
        assert!(TreeRegistry::deserialize(&bytes[..bytes.len() - 2]).is_err());
    }
}
