//! # Index Maintenance
//!
//! Every entry mutation flows through here so that the primary index, the
//! variable-key secondary indexes, and the fixed-key secondary indexes
//! always agree with the entry heap.
//!
//! ## Shapes
//!
//! - *Primary*: variable tree, key → storage id. Unique.
//! - *Variable secondary*: variable tree, extracted slice → id of a nested
//!   fixed-size tree whose keys are the storage ids sharing that slice.
//!   Duplicates allowed on the outer key; the nested tree is dropped when
//!   its last id leaves.
//! - *Fixed secondary*: one fixed-size tree, u64 key → storage id. Unique.
//!
//! ## Diff Mode
//!
//! Updates compare the extracted key per index between the old and new
//! value. Equal keys are skipped unless the id changed or the caller
//! forces a rewrite (`force_update`, for extractors that are sensitive to
//! more than byte equality). Different keys delete-then-add.
//!
//! ## Corruption Discipline
//!
//! A deletion that cannot find its index entry is not an application
//! error; it means the heap and the indexes disagree, which only an engine
//! bug or external page damage can cause. Those paths fail with an
//! "index inconsistency" error and the transaction must be abandoned.

use eyre::{bail, ensure, Result};

use super::{decode_u64, Table, TableValueReader};
use crate::env::EnvState;

impl Table {
    /// Resolves the nested id-set behind an outer secondary-index key,
    /// optionally creating it.
    fn nested_set(
        &self,
        state: &mut EnvState,
        outer: u64,
        key: &[u8],
        create: bool,
    ) -> Result<Option<u64>> {
        if let Some(raw) = state.trees.variable(outer)?.get(key) {
            return Ok(Some(decode_u64(raw)?));
        }
        if !create {
            return Ok(None);
        }
        let nested = state.trees.create_fixed(0);
        state
            .trees
            .variable_mut(outer)?
            .insert(key, &nested.to_le_bytes());
        Ok(Some(nested))
    }

    /// Adds `id` to every index. Duplicate primary or fixed keys must have
    /// been rejected before the entry was written.
    pub(crate) fn insert_into_indexes(
        &self,
        state: &mut EnvState,
        id: u64,
        reader: &TableValueReader<'_>,
    ) -> Result<()> {
        let key = self.schema.primary()?.source.extract(reader)?;
        ensure!(
            state
                .trees
                .variable_mut(self.primary_id)?
                .insert_new(&key, &id.to_le_bytes()),
            "duplicate primary key in table {}",
            self.name
        );

        for (def, outer) in self.schema.indexes.iter().zip(&self.index_tree_ids) {
            let slice = def.source.extract(reader)?.into_owned();
            let nested = self
                .nested_set(state, *outer, &slice, true)?
                .expect("nested set created on demand");
            state.trees.fixed_mut(nested)?.insert(id, &[])?;
        }

        for (def, tree_id) in self.schema.fixed_indexes.iter().zip(&self.fixed_tree_ids) {
            let key = def.source.extract(reader)?;
            let tree = state.trees.fixed_mut(*tree_id)?;
            ensure!(
                !tree.contains(key),
                "duplicate key {} in fixed index {} of table {}",
                key,
                def.name,
                self.name
            );
            tree.insert(key, &id.to_le_bytes())?;
        }
        Ok(())
    }

    /// Removes `id` from every index. A missing entry anywhere is
    /// unrecoverable corruption.
    pub(crate) fn remove_from_indexes(
        &self,
        state: &mut EnvState,
        id: u64,
        reader: &TableValueReader<'_>,
    ) -> Result<()> {
        let key = self.schema.primary()?.source.extract(reader)?;
        let removed = state.trees.variable_mut(self.primary_id)?.remove(&key);
        match removed {
            Some(stored) if stored == id.to_le_bytes() => {}
            _ => bail!(
                "index inconsistency: primary entry missing for id {} in table {}",
                id,
                self.name
            ),
        }

        for (def, outer) in self.schema.indexes.iter().zip(&self.index_tree_ids) {
            let slice = def.source.extract(reader)?.into_owned();
            let Some(nested) = self.nested_set(state, *outer, &slice, false)? else {
                bail!(
                    "index inconsistency: secondary index {} missing key for id {} in table {}",
                    def.name,
                    id,
                    self.name
                );
            };
            ensure!(
                state.trees.fixed_mut(nested)?.remove(id),
                "index inconsistency: secondary index {} missing id {} in table {}",
                def.name,
                id,
                self.name
            );
            if state.trees.fixed(nested)?.is_empty() {
                state.trees.variable_mut(*outer)?.remove(&slice);
                state.trees.drop_tree(nested);
            }
        }

        for (def, tree_id) in self.schema.fixed_indexes.iter().zip(&self.fixed_tree_ids) {
            let key = def.source.extract(reader)?;
            ensure!(
                state.trees.fixed_mut(*tree_id)?.remove(key),
                "index inconsistency: fixed index {} missing key {} in table {}",
                def.name,
                key,
                self.name
            );
        }
        Ok(())
    }

    /// Diff-mode rewrite for updates: per index, equal extracted keys are
    /// skipped unless the id moved or `force` is set.
    pub(crate) fn diff_update_indexes(
        &self,
        state: &mut EnvState,
        old_id: u64,
        new_id: u64,
        old_reader: &TableValueReader<'_>,
        new_reader: &TableValueReader<'_>,
        force: bool,
    ) -> Result<()> {
        let primary = self.schema.primary()?;
        let old_key = primary.source.extract(old_reader)?;
        let new_key = primary.source.extract(new_reader)?;
        if old_key != new_key {
            let tree = state.trees.variable_mut(self.primary_id)?;
            ensure!(
                tree.remove(&old_key).is_some(),
                "index inconsistency: primary entry missing on update in table {}",
                self.name
            );
            ensure!(
                tree.insert_new(&new_key, &new_id.to_le_bytes()),
                "duplicate primary key in table {}",
                self.name
            );
        } else if old_id != new_id || force {
            state
                .trees
                .variable_mut(self.primary_id)?
                .insert(&new_key, &new_id.to_le_bytes());
        }

        for (def, outer) in self.schema.indexes.iter().zip(&self.index_tree_ids) {
            let old_slice = def.source.extract(old_reader)?.into_owned();
            let new_slice = def.source.extract(new_reader)?.into_owned();
            if old_slice == new_slice && old_id == new_id && !force {
                continue;
            }
            let Some(nested) = self.nested_set(state, *outer, &old_slice, false)? else {
                bail!(
                    "index inconsistency: secondary index {} missing key on update in table {}",
                    def.name,
                    self.name
                );
            };
            ensure!(
                state.trees.fixed_mut(nested)?.remove(old_id),
                "index inconsistency: secondary index {} missing id {} in table {}",
                def.name,
                old_id,
                self.name
            );
            if state.trees.fixed(nested)?.is_empty() && old_slice != new_slice {
                state.trees.variable_mut(*outer)?.remove(&old_slice);
                state.trees.drop_tree(nested);
            }
            let target = self
                .nested_set(state, *outer, &new_slice, true)?
                .expect("nested set created on demand");
            state.trees.fixed_mut(target)?.insert(new_id, &[])?;
        }

        for (def, tree_id) in self.schema.fixed_indexes.iter().zip(&self.fixed_tree_ids) {
            let old_key = def.source.extract(old_reader)?;
            let new_key = def.source.extract(new_reader)?;
            if old_key == new_key {
                if old_id != new_id || force {
                    state
                        .trees
                        .fixed_mut(*tree_id)?
                        .insert(new_key, &new_id.to_le_bytes())?;
                }
                continue;
            }
            let tree = state.trees.fixed_mut(*tree_id)?;
            ensure!(
                tree.remove(old_key),
                "index inconsistency: fixed index {} missing key {} in table {}",
                def.name,
                old_key,
                self.name
            );
            ensure!(
                !tree.contains(new_key),
                "duplicate key {} in fixed index {} of table {}",
                new_key,
                def.name,
                self.name
            );
            tree.insert(new_key, &new_id.to_le_bytes())?;
        }
        Ok(())
    }

    /// Repoints every index from `old_id` to `new_id` after a physical
    /// relocation; the entry bytes are unchanged.
    pub(crate) fn relink_indexes(
        &self,
        state: &mut EnvState,
        old_id: u64,
        new_id: u64,
        reader: &TableValueReader<'_>,
    ) -> Result<()> {
        let key = self.schema.primary()?.source.extract(reader)?;
        let prev = state
            .trees
            .variable_mut(self.primary_id)?
            .insert(&key, &new_id.to_le_bytes());
        ensure!(
            prev.as_deref() == Some(old_id.to_le_bytes().as_slice()),
            "index inconsistency: stale primary link for relocated id {} in table {}",
            old_id,
            self.name
        );

        for (def, outer) in self.schema.indexes.iter().zip(&self.index_tree_ids) {
            let slice = def.source.extract(reader)?.into_owned();
            let Some(nested) = self.nested_set(state, *outer, &slice, false)? else {
                bail!(
                    "index inconsistency: secondary index {} lost key for relocated id {} in table {}",
                    def.name,
                    old_id,
                    self.name
                );
            };
            let tree = state.trees.fixed_mut(nested)?;
            ensure!(
                tree.remove(old_id),
                "index inconsistency: secondary index {} missing relocated id {} in table {}",
                def.name,
                old_id,
                self.name
            );
            tree.insert(new_id, &[])?;
        }

        for (def, tree_id) in self.schema.fixed_indexes.iter().zip(&self.fixed_tree_ids) {
            let key = def.source.extract(reader)?;
            let tree = state.trees.fixed_mut(*tree_id)?;
            ensure!(
                tree.get(key).map(decode_u64).transpose()? == Some(old_id),
                "index inconsistency: fixed index {} stale for relocated id {} in table {}",
                def.name,
                old_id,
                self.name
            );
            tree.insert(key, &new_id.to_le_bytes())?;
        }
        Ok(())
    }

    /// Relocation observer target: evicts stale cache entries and repoints
    /// every index at the entry's new id.
    pub(crate) fn on_data_moved(
        &self,
        state: &mut EnvState,
        old_id: u64,
        new_id: u64,
    ) -> Result<()> {
        self.evict(old_id);
        self.evict(new_id);
        let decoded = self.read_owned(state, new_id)?;
        let reader = TableValueReader::new(&decoded)?;
        self.relink_indexes(state, old_id, new_id, &reader)
    }
}
