//! A persistent B-tree mapping ordered keys to values.
//!
//! The tree is itself a persistent object: its nodes are separate
//! persistent objects linked by references, so a lookup touches only
//! the nodes on one root-to-leaf path and a big tree never has to be
//! resident in memory at once. All operations go through a
//! [`Persistent<BTree<K, V>>`] handle.
//!
//! Mutations follow the classic preparatory discipline: inserts split
//! full nodes on the way down and deletes top up underfull ones, so a
//! single pass suffices and every touched node is marked dirty for the
//! next commit.
//!
//! Range iteration is direction-sensitive: `range(lo, hi)` with
//! `lo <= hi` walks ascending from `lo` (inclusive) up to `hi`
//! (exclusive), while a reversed pair walks descending from the first
//! argument (inclusive) down to the second (exclusive).

mod node;

use crate::error::{CoreError, CoreResult};
use crate::persistent::{Persistent, PersistentState};
use crate::serial::{Decode, Encode, StateReader, StateWriter};

use node::{BNode, NodeHandle};

/// Smallest accepted branching degree.
pub const MIN_DEGREE: usize = 2;
/// Largest accepted branching degree.
pub const MAX_DEGREE: usize = 512;
/// Degree used by [`BTree::new`].
pub const DEFAULT_DEGREE: usize = 16;

/// Bounds a tree key must satisfy. Blanket-implemented; never implement
/// it by hand.
pub trait TreeKey: Encode + Decode + Ord + Clone + 'static {}

impl<T: Encode + Decode + Ord + Clone + 'static> TreeKey for T {}

/// Bounds a tree value must satisfy. Blanket-implemented; never
/// implement it by hand.
pub trait TreeValue: Encode + Decode + Clone + 'static {}

impl<T: Encode + Decode + Clone + 'static> TreeValue for T {}

/// An ordered map stored as one persistent object per node.
///
/// A node holds between `degree - 1` and `2 * degree - 1` items, except
/// the root which may hold fewer.
pub struct BTree<K: TreeKey, V: TreeValue> {
    root: NodeHandle<K, V>,
    degree: usize,
    count: u64,
}

impl<K: TreeKey, V: TreeValue> BTree<K, V> {
    /// An empty tree with [`DEFAULT_DEGREE`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: Persistent::new(BNode::empty_leaf()),
            degree: DEFAULT_DEGREE,
            count: 0,
        }
    }

    /// An empty tree with the given branching degree.
    ///
    /// # Errors
    ///
    /// Fails when `degree` is outside [`MIN_DEGREE`]..=[`MAX_DEGREE`].
    pub fn with_degree(degree: usize) -> CoreResult<Self> {
        if !(MIN_DEGREE..=MAX_DEGREE).contains(&degree) {
            return Err(CoreError::invalid_operation(format!(
                "tree degree {degree} outside {MIN_DEGREE}..={MAX_DEGREE}"
            )));
        }
        Ok(Self {
            root: Persistent::new(BNode::empty_leaf()),
            degree,
            count: 0,
        })
    }
}

impl<K: TreeKey, V: TreeValue> Default for BTree<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: TreeKey, V: TreeValue> PersistentState for BTree<K, V> {
    fn store_state(&self, w: &mut StateWriter<'_>) -> CoreResult<()> {
        w.put_ref(&self.root)?;
        w.put_u32(self.degree as u32);
        w.put_u64(self.count);
        Ok(())
    }

    fn load_state(r: &mut StateReader<'_>) -> CoreResult<Self> {
        let root = r.take_ref()?;
        let degree = r.take_u32()? as usize;
        let count = r.take_u64()?;
        if !(MIN_DEGREE..=MAX_DEGREE).contains(&degree) {
            return Err(CoreError::corrupt(format!(
                "stored tree degree {degree} outside {MIN_DEGREE}..={MAX_DEGREE}"
            )));
        }
        Ok(Self {
            root,
            degree,
            count,
        })
    }
}

impl<K: TreeKey, V: TreeValue> Persistent<BTree<K, V>> {
    /// Inserts `key`, returning the value it replaces if it was
    /// already present.
    ///
    /// # Errors
    ///
    /// Propagates load failures from ghost nodes on the descent path.
    pub fn insert(&self, key: K, value: V) -> CoreResult<Option<V>> {
        enum Step<C> {
            Replace(usize),
            Insert(usize),
            Down(usize, C),
        }

        let (mut cur, degree) = self.read(|t| (t.root.clone(), t.degree))?;
        if node::is_full(&cur, degree)? {
            let new_root = Persistent::new(BNode {
                items: Vec::new(),
                children: vec![cur.clone()],
            });
            node::split_child(&new_root, 0, degree)?;
            self.modify(|t| t.root = new_root.clone())?;
            cur = new_root;
        }
        loop {
            let step = cur.read(|n| match n.items.binary_search_by(|item| item.0.cmp(&key)) {
                Ok(i) => Step::Replace(i),
                Err(i) if n.is_leaf() => Step::Insert(i),
                Err(i) => Step::Down(i, n.children[i].clone()),
            })?;
            match step {
                Step::Replace(i) => {
                    let old = cur.modify(|n| std::mem::replace(&mut n.items[i].1, value))?;
                    return Ok(Some(old));
                }
                Step::Insert(i) => {
                    cur.modify(|n| n.items.insert(i, (key, value)))?;
                    self.modify(|t| t.count += 1)?;
                    return Ok(None);
                }
                Step::Down(i, child) => {
                    if node::is_full(&child, degree)? {
                        // Split ahead of the walk, then re-search this
                        // node against the promoted median.
                        node::split_child(&cur, i, degree)?;
                    } else {
                        cur = child;
                    }
                }
            }
        }
    }

    /// Looks up `key`.
    ///
    /// # Errors
    ///
    /// Propagates load failures from ghost nodes on the descent path.
    pub fn get(&self, key: &K) -> CoreResult<Option<V>> {
        enum Step<V, C> {
            Hit(V),
            Miss,
            Down(C),
        }

        let mut cur = self.read(|t| t.root.clone())?;
        loop {
            let step = cur.read(|n| match n.items.binary_search_by(|item| item.0.cmp(key)) {
                Ok(i) => Step::Hit(n.items[i].1.clone()),
                Err(_) if n.is_leaf() => Step::Miss,
                Err(i) => Step::Down(n.children[i].clone()),
            })?;
            match step {
                Step::Hit(value) => return Ok(Some(value)),
                Step::Miss => return Ok(None),
                Step::Down(child) => cur = child,
            }
        }
    }

    /// Whether `key` is present.
    ///
    /// # Errors
    ///
    /// Same as [`Self::get`].
    pub fn contains_key(&self, key: &K) -> CoreResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Removes `key` and returns its value.
    ///
    /// # Errors
    ///
    /// [`CoreError::KeyNotFound`] when absent; load failures otherwise.
    pub fn remove(&self, key: &K) -> CoreResult<V> {
        let (root, degree) = self.read(|t| (t.root.clone(), t.degree))?;
        let outcome = remove_from(&root, key, degree);
        // The descent may have merged the root's children even when the
        // key turned out absent, so the lone-child promotion has to run
        // before the miss is reported.
        let promoted = root.read(|n| {
            if n.items.is_empty() && !n.is_leaf() {
                Some(n.children[0].clone())
            } else {
                None
            }
        })?;
        if let Some(child) = promoted {
            self.modify(|t| t.root = child)?;
        }
        let value = outcome?;
        self.modify(|t| t.count = t.count.saturating_sub(1))?;
        Ok(value)
    }

    /// Number of items in the tree.
    ///
    /// # Errors
    ///
    /// Fails only when the tree object itself cannot be loaded.
    pub fn len(&self) -> CoreResult<u64> {
        self.read(|t| t.count)
    }

    /// Whether the tree holds no items.
    ///
    /// # Errors
    ///
    /// Same as [`Self::len`].
    pub fn is_empty(&self) -> CoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// The tree's branching degree.
    ///
    /// # Errors
    ///
    /// Same as [`Self::len`].
    pub fn degree(&self) -> CoreResult<usize> {
        self.read(|t| t.degree)
    }

    /// The smallest item.
    ///
    /// # Errors
    ///
    /// [`CoreError::EmptyTree`] on an empty tree.
    pub fn min_item(&self) -> CoreResult<(K, V)> {
        let root = self.read(|t| t.root.clone())?;
        node::min_item_of(&root)
    }

    /// The largest item.
    ///
    /// # Errors
    ///
    /// [`CoreError::EmptyTree`] on an empty tree.
    pub fn max_item(&self) -> CoreResult<(K, V)> {
        let root = self.read(|t| t.root.clone())?;
        node::max_item_of(&root)
    }

    /// All items in ascending key order.
    ///
    /// # Errors
    ///
    /// Load failures during the initial descent; later failures come
    /// out of the iterator itself.
    pub fn iter(&self) -> CoreResult<TreeIter<K, V>> {
        let root = self.read(|t| t.root.clone())?;
        TreeIter::forward_all(&root)
    }

    /// All items in descending key order.
    ///
    /// # Errors
    ///
    /// Same as [`Self::iter`].
    pub fn iter_backward(&self) -> CoreResult<TreeIter<K, V>> {
        let root = self.read(|t| t.root.clone())?;
        TreeIter::backward_all(&root)
    }

    /// Ascending items starting at `start`; `closed` includes `start`
    /// itself.
    ///
    /// # Errors
    ///
    /// Same as [`Self::iter`].
    pub fn items_from(&self, start: &K, closed: bool) -> CoreResult<TreeIter<K, V>> {
        let root = self.read(|t| t.root.clone())?;
        TreeIter::forward_from(&root, start, closed)
    }

    /// Descending items starting at `end`; `closed` includes `end`
    /// itself.
    ///
    /// # Errors
    ///
    /// Same as [`Self::iter`].
    pub fn items_backward_from(&self, end: &K, closed: bool) -> CoreResult<TreeIter<K, V>> {
        let root = self.read(|t| t.root.clone())?;
        TreeIter::backward_from(&root, end, closed)
    }

    /// Items between `start` and `end`, direction-sensitive.
    ///
    /// `start <= end` walks ascending over `[start, end)`. Otherwise
    /// the walk descends from `start` (inclusive) and stops before
    /// reaching `end`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::iter`].
    pub fn range(&self, start: &K, end: &K) -> CoreResult<TreeIter<K, V>> {
        let root = self.read(|t| t.root.clone())?;
        let iter = if start <= end {
            TreeIter::forward_from(&root, start, true)?
        } else {
            TreeIter::backward_from(&root, start, true)?
        };
        Ok(iter.with_stop(end.clone()))
    }
}

fn remove_from<K: TreeKey, V: TreeValue>(
    node: &NodeHandle<K, V>,
    key: &K,
    degree: usize,
) -> CoreResult<V> {
    enum Plan<C> {
        TakeLeaf(usize),
        Missing,
        ReplaceInternal(usize, C, C),
        Descend(usize, C),
    }

    let plan = node.read(|n| match n.items.binary_search_by(|item| item.0.cmp(key)) {
        Ok(i) if n.is_leaf() => Plan::TakeLeaf(i),
        Ok(i) => Plan::ReplaceInternal(i, n.children[i].clone(), n.children[i + 1].clone()),
        Err(_) if n.is_leaf() => Plan::Missing,
        Err(i) => Plan::Descend(i, n.children[i].clone()),
    })?;
    match plan {
        Plan::TakeLeaf(i) => node.modify(|n| n.items.remove(i).1),
        Plan::Missing => Err(CoreError::KeyNotFound),
        Plan::ReplaceInternal(i, left, right) => {
            if node::item_count(&left)? >= degree {
                let stolen = take_edge(&left, degree, true)?;
                let old = node.modify(|n| std::mem::replace(&mut n.items[i], stolen))?;
                Ok(old.1)
            } else if node::item_count(&right)? >= degree {
                let stolen = take_edge(&right, degree, false)?;
                let old = node.modify(|n| std::mem::replace(&mut n.items[i], stolen))?;
                Ok(old.1)
            } else {
                // Both neighbours are minimal: fold them together with
                // the key's item and take it out of the merged node.
                node::merge_children(node, i)?;
                remove_from(&left, key, degree)
            }
        }
        Plan::Descend(i, child) => {
            let child = node::ensure_child_fill(node, i, child, degree)?;
            remove_from(&child, key, degree)
        }
    }
}

/// Removes and returns the extreme item of a subtree known to be able
/// to spare one.
fn take_edge<K: TreeKey, V: TreeValue>(
    node: &NodeHandle<K, V>,
    degree: usize,
    max: bool,
) -> CoreResult<(K, V)> {
    let (key, _) = if max {
        node::max_item_of(node)?
    } else {
        node::min_item_of(node)?
    };
    let value = remove_from(node, &key, degree)?;
    Ok((key, value))
}

enum IterStep<K, V, C> {
    Yield((K, V), Option<C>),
    Pop,
}

/// A lazy in-order walk over a tree, loading nodes as it reaches them.
///
/// Yields `CoreResult` items; a load failure ends the iteration after
/// yielding the error once.
pub struct TreeIter<K: TreeKey, V: TreeValue> {
    stack: Vec<(NodeHandle<K, V>, usize)>,
    backward: bool,
    stop: Option<K>,
}

impl<K: TreeKey, V: TreeValue> TreeIter<K, V> {
    fn forward_all(root: &NodeHandle<K, V>) -> CoreResult<Self> {
        let mut iter = Self {
            stack: Vec::new(),
            backward: false,
            stop: None,
        };
        iter.descend_min(root.clone())?;
        Ok(iter)
    }

    fn backward_all(root: &NodeHandle<K, V>) -> CoreResult<Self> {
        let mut iter = Self {
            stack: Vec::new(),
            backward: true,
            stop: None,
        };
        iter.descend_max(root.clone())?;
        Ok(iter)
    }

    fn forward_from(root: &NodeHandle<K, V>, start: &K, closed: bool) -> CoreResult<Self> {
        let mut iter = Self {
            stack: Vec::new(),
            backward: false,
            stop: None,
        };
        let mut cur = root.clone();
        loop {
            let (idx, child) = cur.read(|n| {
                let idx = n.items.partition_point(|item| {
                    if closed {
                        item.0 < *start
                    } else {
                        item.0 <= *start
                    }
                });
                (idx, n.children.get(idx).cloned())
            })?;
            iter.stack.push((cur.clone(), idx));
            match child {
                Some(next) => cur = next,
                None => return Ok(iter),
            }
        }
    }

    fn backward_from(root: &NodeHandle<K, V>, end: &K, closed: bool) -> CoreResult<Self> {
        let mut iter = Self {
            stack: Vec::new(),
            backward: true,
            stop: None,
        };
        let mut cur = root.clone();
        loop {
            let (idx, child) = cur.read(|n| {
                let idx = n.items.partition_point(|item| {
                    if closed {
                        item.0 <= *end
                    } else {
                        item.0 < *end
                    }
                });
                (idx, n.children.get(idx).cloned())
            })?;
            iter.stack.push((cur.clone(), idx));
            match child {
                Some(next) => cur = next,
                None => return Ok(iter),
            }
        }
    }

    fn with_stop(mut self, stop: K) -> Self {
        self.stop = Some(stop);
        self
    }

    fn descend_min(&mut self, mut node: NodeHandle<K, V>) -> CoreResult<()> {
        loop {
            let child = node.read(|n| n.children.first().cloned())?;
            self.stack.push((node.clone(), 0));
            match child {
                Some(next) => node = next,
                None => return Ok(()),
            }
        }
    }

    fn descend_max(&mut self, mut node: NodeHandle<K, V>) -> CoreResult<()> {
        loop {
            let (len, child) = node.read(|n| (n.items.len(), n.children.last().cloned()))?;
            self.stack.push((node.clone(), len));
            match child {
                Some(next) => node = next,
                None => return Ok(()),
            }
        }
    }

    fn past_stop(&self, key: &K) -> bool {
        match &self.stop {
            Some(stop) if self.backward => key <= stop,
            Some(stop) => key >= stop,
            None => false,
        }
    }
}

impl<K: TreeKey, V: TreeValue> Iterator for TreeIter<K, V> {
    type Item = CoreResult<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (node, idx) = match self.stack.last() {
                Some((node, idx)) => (node.clone(), *idx),
                None => return None,
            };
            let step = if self.backward {
                node.read(|n| {
                    if idx == 0 {
                        IterStep::Pop
                    } else {
                        let item = n.items[idx - 1].clone();
                        let child = if n.is_leaf() {
                            None
                        } else {
                            n.children.get(idx - 1).cloned()
                        };
                        IterStep::Yield(item, child)
                    }
                })
            } else {
                node.read(|n| {
                    if idx >= n.items.len() {
                        IterStep::Pop
                    } else {
                        let item = n.items[idx].clone();
                        let child = n.children.get(idx + 1).cloned();
                        IterStep::Yield(item, child)
                    }
                })
            };
            let step = match step {
                Ok(step) => step,
                Err(err) => {
                    self.stack.clear();
                    return Some(Err(err));
                }
            };
            match step {
                IterStep::Pop => {
                    self.stack.pop();
                }
                IterStep::Yield(item, child) => {
                    if self.past_stop(&item.0) {
                        self.stack.clear();
                        return None;
                    }
                    if let Some(top) = self.stack.last_mut() {
                        top.1 = if self.backward { idx - 1 } else { idx + 1 };
                    }
                    let descended = match child {
                        Some(child) if self.backward => self.descend_max(child),
                        Some(child) => self.descend_min(child),
                        None => Ok(()),
                    };
                    if let Err(err) = descended {
                        self.stack.clear();
                        return Some(Err(err));
                    }
                    return Some(Ok(item));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::storage::FileStorage;
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn tree(degree: usize) -> Persistent<BTree<u64, String>> {
        Persistent::new(BTree::with_degree(degree).unwrap())
    }

    /// A fixed full permutation of 0..n for any n coprime to 37.
    fn scrambled(n: u64) -> Vec<u64> {
        (0..n).map(|i| (i * 37 + 11) % n).collect()
    }

    fn collect_keys(iter: TreeIter<u64, String>) -> Vec<u64> {
        iter.map(|item| item.unwrap().0).collect()
    }

    /// Walks the whole tree checking ordering, fill, and uniform depth.
    fn check_tree(handle: &Persistent<BTree<u64, String>>) {
        let (root, degree, count) = handle
            .read(|t| (t.root.clone(), t.degree, t.count))
            .unwrap();
        let (_, items) = check_node(&root, degree, true, None, None);
        assert_eq!(items, count, "count out of step with tree contents");
    }

    fn check_node(
        node: &Persistent<BNode<u64, String>>,
        degree: usize,
        is_root: bool,
        lo: Option<u64>,
        hi: Option<u64>,
    ) -> (usize, u64) {
        node.read(|n| {
            assert!(n.items.len() <= 2 * degree - 1, "overfull node");
            if !is_root {
                assert!(n.items.len() >= degree - 1, "underfull node");
            }
            for pair in n.items.windows(2) {
                assert!(pair[0].0 < pair[1].0, "unsorted node");
            }
            if let (Some(first), Some(lo)) = (n.items.first(), lo) {
                assert!(first.0 > lo, "key below subtree bound");
            }
            if let (Some(last), Some(hi)) = (n.items.last(), hi) {
                assert!(last.0 < hi, "key above subtree bound");
            }
            if n.is_leaf() {
                return (1, n.items.len() as u64);
            }
            assert_eq!(n.children.len(), n.items.len() + 1, "fan-out mismatch");
            let mut total = n.items.len() as u64;
            let mut depth = None;
            for (i, child) in n.children.iter().enumerate() {
                let child_lo = if i == 0 { lo } else { Some(n.items[i - 1].0) };
                let child_hi = if i == n.items.len() {
                    hi
                } else {
                    Some(n.items[i].0)
                };
                let (d, c) = check_node(child, degree, false, child_lo, child_hi);
                total += c;
                match depth {
                    None => depth = Some(d),
                    Some(prev) => assert_eq!(prev, d, "uneven leaf depth"),
                }
            }
            (depth.unwrap_or(0) + 1, total)
        })
        .unwrap()
    }

    #[test]
    fn insert_and_get_many() {
        let t = tree(2);
        for k in scrambled(97) {
            assert!(t.insert(k, format!("v{k}")).unwrap().is_none());
        }
        check_tree(&t);
        assert_eq!(t.len().unwrap(), 97);
        for k in 0..97 {
            assert_eq!(t.get(&k).unwrap().unwrap(), format!("v{k}"));
        }
        assert!(t.get(&97).unwrap().is_none());
        assert!(!t.contains_key(&1000).unwrap());
    }

    #[test]
    fn insert_replaces_and_returns_previous() {
        let t = tree(4);
        assert!(t.insert(5, "first".into()).unwrap().is_none());
        assert_eq!(t.insert(5, "second".into()).unwrap().unwrap(), "first");
        assert_eq!(t.len().unwrap(), 1);
        assert_eq!(t.get(&5).unwrap().unwrap(), "second");
    }

    #[test]
    fn remove_keeps_the_tree_legal() {
        let t = tree(2);
        for k in scrambled(101) {
            t.insert(k, k.to_string()).unwrap();
        }
        for (i, k) in scrambled(101).iter().rev().enumerate() {
            assert_eq!(t.remove(k).unwrap(), k.to_string());
            assert!(t.get(k).unwrap().is_none());
            if i % 8 == 0 {
                check_tree(&t);
            }
        }
        check_tree(&t);
        assert!(t.is_empty().unwrap());
        assert!(matches!(t.min_item(), Err(CoreError::EmptyTree)));
        assert!(matches!(t.max_item(), Err(CoreError::EmptyTree)));
    }

    #[test]
    fn remove_missing_key_is_key_not_found() {
        let t = tree(2);
        assert!(matches!(t.remove(&1), Err(CoreError::KeyNotFound)));
        t.insert(1, "one".into()).unwrap();
        assert!(matches!(t.remove(&2), Err(CoreError::KeyNotFound)));
        assert_eq!(t.len().unwrap(), 1);
    }

    #[test]
    fn missed_remove_still_collapses_the_root() {
        let t = tree(2);
        for k in (10..=100).step_by(10) {
            t.insert(k, k.to_string()).unwrap();
        }
        // Thin the right spine so the next descent merges the root's
        // two children before discovering the key is absent.
        t.remove(&100).unwrap();
        t.remove(&80).unwrap();
        assert!(matches!(t.remove(&999), Err(CoreError::KeyNotFound)));
        assert_eq!(t.len().unwrap(), 8);

        let root = t.read(|tree| tree.root.clone()).unwrap();
        let (items, leaf) = root.read(|n| (n.items.len(), n.is_leaf())).unwrap();
        assert!(items > 0 || leaf, "internal root left without items");
        check_tree(&t);

        // Removing present keys after the miss must keep working all
        // the way down to the empty tree.
        for k in (10..=90).step_by(10) {
            if k == 80 {
                continue;
            }
            assert_eq!(t.remove(&k).unwrap(), k.to_string());
            check_tree(&t);
        }
        assert!(t.is_empty().unwrap());
    }

    #[test]
    fn min_and_max_follow_mutations() {
        let t = tree(3);
        for k in [50, 10, 90, 30, 70] {
            t.insert(k, k.to_string()).unwrap();
        }
        assert_eq!(t.min_item().unwrap().0, 10);
        assert_eq!(t.max_item().unwrap().0, 90);
        t.remove(&10).unwrap();
        t.remove(&90).unwrap();
        assert_eq!(t.min_item().unwrap().0, 30);
        assert_eq!(t.max_item().unwrap().0, 70);
    }

    #[test]
    fn iteration_is_sorted_both_ways() {
        let t = tree(2);
        for k in scrambled(61) {
            t.insert(k, k.to_string()).unwrap();
        }
        let forward = collect_keys(t.iter().unwrap());
        assert_eq!(forward, (0..61).collect::<Vec<_>>());
        let backward = collect_keys(t.iter_backward().unwrap());
        assert_eq!(backward, (0..61).rev().collect::<Vec<_>>());
    }

    #[test]
    fn items_from_respects_the_closed_flag() {
        let t = tree(2);
        for k in (0..40).step_by(2) {
            t.insert(k, k.to_string()).unwrap();
        }
        let closed = collect_keys(t.items_from(&10, true).unwrap());
        assert_eq!(closed.first(), Some(&10));
        let open = collect_keys(t.items_from(&10, false).unwrap());
        assert_eq!(open.first(), Some(&12));
        // A start between keys behaves the same either way.
        let between = collect_keys(t.items_from(&9, true).unwrap());
        assert_eq!(between.first(), Some(&10));
        assert_eq!(closed.last(), Some(&38));
    }

    #[test]
    fn items_backward_from_respects_the_closed_flag() {
        let t = tree(2);
        for k in (0..40).step_by(2) {
            t.insert(k, k.to_string()).unwrap();
        }
        let closed = collect_keys(t.items_backward_from(&10, true).unwrap());
        assert_eq!(closed.first(), Some(&10));
        assert_eq!(closed.last(), Some(&0));
        let open = collect_keys(t.items_backward_from(&10, false).unwrap());
        assert_eq!(open.first(), Some(&8));
    }

    #[test]
    fn range_direction_follows_argument_order() {
        let t = tree(4);
        for k in scrambled(101) {
            t.insert(k, k.to_string()).unwrap();
        }
        let ascending = collect_keys(t.range(&9, &30).unwrap());
        assert_eq!(ascending, (9..30).collect::<Vec<_>>());
        let descending = collect_keys(t.range(&30, &9).unwrap());
        assert_eq!(descending, (10..=30).rev().collect::<Vec<_>>());
        assert!(collect_keys(t.range(&5, &5).unwrap()).is_empty());
    }

    #[test]
    fn degree_bounds_are_enforced() {
        assert!(BTree::<u64, String>::with_degree(1).is_err());
        assert!(BTree::<u64, String>::with_degree(513).is_err());
        assert!(BTree::<u64, String>::with_degree(2).is_ok());
        assert!(BTree::<u64, String>::with_degree(512).is_ok());
        assert_eq!(tree(16).degree().unwrap(), 16);
        let default_tree: BTree<u64, String> = BTree::new();
        assert_eq!(default_tree.degree, DEFAULT_DEGREE);
    }

    #[test]
    fn tree_round_trips_through_storage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tree.odb");
        {
            let conn = Connection::new(FileStorage::open(&path).unwrap());
            let t = tree(2);
            conn.set_root(&t).unwrap();
            for k in scrambled(53) {
                t.insert(k, format!("v{k}")).unwrap();
            }
            conn.commit().unwrap();
        }

        let conn = Connection::new(FileStorage::open(&path).unwrap());
        let t = conn.root::<BTree<u64, String>>().unwrap().unwrap();
        assert_eq!(t.len().unwrap(), 53);
        assert_eq!(t.degree().unwrap(), 2);
        for k in 0..53 {
            assert_eq!(t.get(&k).unwrap().unwrap(), format!("v{k}"));
        }
        let keys = collect_keys(t.iter().unwrap());
        assert_eq!(keys, (0..53).collect::<Vec<_>>());

        // Mutate the reloaded tree and persist again.
        t.remove(&0).unwrap();
        t.insert(100, "v100".into()).unwrap();
        conn.commit().unwrap();
        check_tree(&t);
    }

    proptest! {
        #[test]
        fn mutations_track_a_model_map(
            ops in proptest::collection::vec((any::<bool>(), 0u64..48), 0..160),
        ) {
            let t = tree(2);
            let mut model = BTreeMap::new();
            for (is_insert, key) in ops {
                if is_insert {
                    let value = format!("v{key}");
                    prop_assert_eq!(
                        t.insert(key, value.clone()).unwrap(),
                        model.insert(key, value),
                    );
                } else {
                    match (t.remove(&key), model.remove(&key)) {
                        (Ok(got), Some(want)) => prop_assert_eq!(got, want),
                        (Err(CoreError::KeyNotFound), None) => {}
                        (got, want) => {
                            prop_assert!(false, "mismatch for {key}: {got:?} vs {want:?}");
                        }
                    }
                }
            }
            prop_assert_eq!(t.len().unwrap(), model.len() as u64);
            let keys = collect_keys(t.iter().unwrap());
            prop_assert_eq!(keys, model.keys().copied().collect::<Vec<_>>());
            check_tree(&t);
        }
    }
}
