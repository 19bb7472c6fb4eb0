//! # Seek Families
//!
//! Ordered iteration over the primary index, variable secondary indexes,
//! and fixed secondary indexes: forward, backward, prefix-bounded, and
//! seek-one, each with a skip count and (for backward scans) an
//! exclude-upper flag.
//!
//! ## Re-Seek Discipline
//!
//! Every iterator re-seeks the tree for each step instead of holding a
//! tree cursor: the position is remembered as an owned bound and the next
//! step starts a fresh range from it. A step costs an extra tree descent,
//! and in exchange the iterators never hold references into tree internals
//! — which is also why the ranged delete operations can use the same
//! discipline while mutating between steps.
//!
//! Iteration holds nothing beyond the enclosing transaction's borrow;
//! ordering is the underlying tree's (lexicographic on byte keys, numeric
//! on fixed keys).

use std::ops::Bound;

use eyre::Result;

use super::{decode_u64, EntryData, Table};
use crate::env::{EnvState, TxView};

/// One entry yielded by a seek.
pub struct SeekEntry<'t> {
    pub key: Vec<u8>,
    pub id: u64,
    pub value: EntryData<'t>,
}

impl std::fmt::Debug for SeekEntry<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeekEntry")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

fn bound_ref(bound: &Bound<Vec<u8>>) -> Bound<&[u8]> {
    match bound {
        Bound::Included(v) => Bound::Included(v.as_slice()),
        Bound::Excluded(v) => Bound::Excluded(v.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// True when the bounds describe an empty range. `BTreeMap::range` panics
/// on inverted bounds, and a caller's `from` may legitimately sit outside
/// its `prefix`.
fn empty_bounds<T: Ord>(lower: &Bound<T>, upper: &Bound<T>) -> bool {
    match (lower, upper) {
        (Bound::Excluded(l), Bound::Excluded(u)) => l >= u,
        (
            Bound::Included(l) | Bound::Excluded(l),
            Bound::Included(u) | Bound::Excluded(u),
        ) => l > u,
        _ => false,
    }
}

/// Smallest exclusive upper bound covering every key with `prefix`.
fn prefix_upper_bound(prefix: &[u8]) -> Bound<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.last_mut() {
        if *last == 0xFF {
            upper.pop();
        } else {
            *last += 1;
            return Bound::Excluded(upper);
        }
    }
    Bound::Unbounded
}

/// Iterator over the primary index.
pub struct PrimarySeek<'t> {
    table: &'t Table,
    state: &'t EnvState,
    lower: Bound<Vec<u8>>,
    upper: Bound<Vec<u8>>,
    backward: bool,
    skip: usize,
    done: bool,
}

impl<'t> Iterator for PrimarySeek<'t> {
    type Item = Result<SeekEntry<'t>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if empty_bounds(&self.lower, &self.upper) {
                self.done = true;
                return None;
            }
            let tree = match self.state.trees.variable(self.table.primary_tree_id()) {
                Ok(tree) => tree,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            let bounds = (bound_ref(&self.lower), bound_ref(&self.upper));
            let found = if self.backward {
                tree.range(bounds).next_back()
            } else {
                tree.range(bounds).next()
            };
            let Some((key, raw_id)) = found else {
                self.done = true;
                return None;
            };
            let key = key.to_vec();
            let id = match decode_u64(raw_id) {
                Ok(id) => id,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            if self.backward {
                self.upper = Bound::Excluded(key.clone());
            } else {
                self.lower = Bound::Excluded(key.clone());
            }
            if self.skip > 0 {
                self.skip -= 1;
                continue;
            }
            return Some(match self.table.read_entry(self.state, id) {
                Ok(value) => Ok(SeekEntry { key, id, value }),
                Err(e) => {
                    self.done = true;
                    Err(e)
                }
            });
        }
    }
}

/// Iterator over a variable secondary index, flattening each index value's
/// nested id set (ids ascend within a value in both directions).
pub struct SecondarySeek<'t> {
    table: &'t Table,
    state: &'t EnvState,
    outer: u64,
    lower: Bound<Vec<u8>>,
    upper: Bound<Vec<u8>>,
    backward: bool,
    skip: usize,
    buffered: std::collections::VecDeque<(Vec<u8>, u64)>,
    done: bool,
}

impl<'t> SecondarySeek<'t> {
    fn refill(&mut self) -> Result<bool> {
        if empty_bounds(&self.lower, &self.upper) {
            return Ok(false);
        }
        let tree = self.state.trees.variable(self.outer)?;
        let bounds = (bound_ref(&self.lower), bound_ref(&self.upper));
        let found = if self.backward {
            tree.range(bounds).next_back()
        } else {
            tree.range(bounds).next()
        };
        let Some((value, raw_nested)) = found else {
            return Ok(false);
        };
        let value = value.to_vec();
        let nested = decode_u64(raw_nested)?;
        if self.backward {
            self.upper = Bound::Excluded(value.clone());
        } else {
            self.lower = Bound::Excluded(value.clone());
        }
        for (id, _) in self.state.trees.fixed(nested)?.iter() {
            self.buffered.push_back((value.clone(), id));
        }
        Ok(true)
    }
}

impl<'t> Iterator for SecondarySeek<'t> {
    type Item = Result<SeekEntry<'t>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if self.buffered.is_empty() {
                match self.refill() {
                    Ok(true) => {}
                    Ok(false) => {
                        self.done = true;
                        return None;
                    }
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
            }
            let Some((key, id)) = self.buffered.pop_front() else {
                continue;
            };
            if self.skip > 0 {
                self.skip -= 1;
                continue;
            }
            return Some(match self.table.read_entry(self.state, id) {
                Ok(value) => Ok(SeekEntry { key, id, value }),
                Err(e) => {
                    self.done = true;
                    Err(e)
                }
            });
        }
    }
}

/// Iterator over a fixed secondary index.
pub struct FixedSeek<'t> {
    table: &'t Table,
    state: &'t EnvState,
    tree: u64,
    lower: Bound<u64>,
    upper: Bound<u64>,
    backward: bool,
    skip: usize,
    done: bool,
}

impl<'t> Iterator for FixedSeek<'t> {
    type Item = Result<(u64, u64, EntryData<'t>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if empty_bounds(&self.lower, &self.upper) {
                self.done = true;
                return None;
            }
            let tree = match self.state.trees.fixed(self.tree) {
                Ok(tree) => tree,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            let found = if self.backward {
                tree.range((self.lower, self.upper)).next_back()
            } else {
                tree.range((self.lower, self.upper)).next()
            };
            let Some((key, raw_id)) = found else {
                self.done = true;
                return None;
            };
            let id = match decode_u64(raw_id) {
                Ok(id) => id,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            if self.backward {
                self.upper = Bound::Excluded(key);
            } else {
                self.lower = Bound::Excluded(key);
            }
            if self.skip > 0 {
                self.skip -= 1;
                continue;
            }
            return Some(match self.table.read_entry(self.state, id) {
                Ok(value) => Ok((key, id, value)),
                Err(e) => {
                    self.done = true;
                    Err(e)
                }
            });
        }
    }
}

impl Table {
    /// Forward scan of the primary index from `from` (inclusive),
    /// optionally bounded to keys starting with `prefix`, skipping the
    /// first `skip` matches.
    pub fn seek_forward<'t, T: TxView>(
        &'t self,
        tx: &'t T,
        from: Option<&[u8]>,
        prefix: Option<&[u8]>,
        skip: usize,
    ) -> PrimarySeek<'t> {
        let mut lower = from
            .map(|f| Bound::Included(f.to_vec()))
            .unwrap_or(Bound::Unbounded);
        let mut upper = Bound::Unbounded;
        if let Some(prefix) = prefix {
            let below_prefix = match &lower {
                Bound::Included(f) => f.as_slice() < prefix,
                _ => true,
            };
            if below_prefix {
                lower = Bound::Included(prefix.to_vec());
            }
            upper = prefix_upper_bound(prefix);
        }
        PrimarySeek {
            table: self,
            state: tx.state(),
            lower,
            upper,
            backward: false,
            skip,
            done: false,
        }
    }

    /// Backward scan of the primary index from `from` downward.
    /// `exclude_from` turns the upper bound exclusive, for upper-bounded
    /// scans that must not yield the bound itself.
    pub fn seek_backward<'t, T: TxView>(
        &'t self,
        tx: &'t T,
        from: Option<&[u8]>,
        exclude_from: bool,
        prefix: Option<&[u8]>,
        skip: usize,
    ) -> PrimarySeek<'t> {
        let lower = prefix
            .map(|p| Bound::Included(p.to_vec()))
            .unwrap_or(Bound::Unbounded);
        let upper = match from {
            Some(f) if exclude_from => Bound::Excluded(f.to_vec()),
            Some(f) => Bound::Included(f.to_vec()),
            None => prefix.map(prefix_upper_bound).unwrap_or(Bound::Unbounded),
        };
        PrimarySeek {
            table: self,
            state: tx.state(),
            lower,
            upper,
            backward: true,
            skip,
            done: false,
        }
    }

    /// First primary-index match at or after `from`, within `prefix`.
    pub fn seek_one<'t, T: TxView>(
        &'t self,
        tx: &'t T,
        from: Option<&[u8]>,
        prefix: Option<&[u8]>,
    ) -> Result<Option<SeekEntry<'t>>> {
        self.seek_forward(tx, from, prefix, 0).next().transpose()
    }

    /// Scan of a variable secondary index starting at `from_value`,
    /// yielding every entry under every matching index value.
    pub fn seek_secondary<'t, T: TxView>(
        &'t self,
        tx: &'t T,
        index: &str,
        from_value: Option<&[u8]>,
        backward: bool,
        skip: usize,
    ) -> Result<SecondarySeek<'t>> {
        let outer = self.index_tree_ids[self.var_index_pos(index)?];
        let (lower, upper) = if backward {
            (
                Bound::Unbounded,
                from_value
                    .map(|v| Bound::Included(v.to_vec()))
                    .unwrap_or(Bound::Unbounded),
            )
        } else {
            (
                from_value
                    .map(|v| Bound::Included(v.to_vec()))
                    .unwrap_or(Bound::Unbounded),
                Bound::Unbounded,
            )
        };
        Ok(SecondarySeek {
            table: self,
            state: tx.state(),
            outer,
            lower,
            upper,
            backward,
            skip,
            buffered: std::collections::VecDeque::new(),
            done: false,
        })
    }

    /// Storage ids filed under exactly `value` in a variable secondary
    /// index, ascending (or descending) by id.
    pub fn seek_secondary_ids(
        &self,
        tx: &impl TxView,
        index: &str,
        value: &[u8],
        backward: bool,
    ) -> Result<Vec<u64>> {
        let outer = self.index_tree_ids[self.var_index_pos(index)?];
        let state = tx.state();
        let Some(raw_nested) = state.trees.variable(outer)?.get(value) else {
            return Ok(Vec::new());
        };
        let nested = decode_u64(raw_nested)?;
        let mut ids: Vec<u64> = state.trees.fixed(nested)?.iter().map(|(id, _)| id).collect();
        if backward {
            ids.reverse();
        }
        Ok(ids)
    }

    /// Scan of a fixed secondary index from `from` (inclusive), in either
    /// direction.
    pub fn seek_fixed<'t, T: TxView>(
        &'t self,
        tx: &'t T,
        index: &str,
        from: Option<u64>,
        backward: bool,
        skip: usize,
    ) -> Result<FixedSeek<'t>> {
        let tree = self.fixed_tree_ids[self.fixed_index_pos(index)?];
        let (lower, upper) = if backward {
            (
                Bound::Unbounded,
                from.map(Bound::Included).unwrap_or(Bound::Unbounded),
            )
        } else {
            (
                from.map(Bound::Included).unwrap_or(Bound::Unbounded),
                Bound::Unbounded,
            )
        };
        Ok(FixedSeek {
            table: self,
            state: tx.state(),
            tree,
            lower,
            upper,
            backward,
            skip,
            done: false,
        })
    }
}
