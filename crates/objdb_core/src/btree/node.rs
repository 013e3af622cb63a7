//! Tree nodes and the structural surgery around them.
//!
//! Every helper here works through [`Persistent`] handles so that each
//! touched node is marked dirty and lands in the next commit. Nodes cut
//! out by merges are simply dropped from the tree; packing reclaims
//! their records.

use super::{TreeKey, TreeValue};
use crate::error::{CoreError, CoreResult};
use crate::persistent::{Persistent, PersistentState};
use crate::serial::{Decode, Encode, StateReader, StateWriter};

/// One node: `items` sorted by key, `children` empty for leaves and
/// holding `items.len() + 1` subtrees otherwise.
pub(crate) struct BNode<K: TreeKey, V: TreeValue> {
    pub(super) items: Vec<(K, V)>,
    pub(super) children: Vec<Persistent<BNode<K, V>>>,
}

impl<K: TreeKey, V: TreeValue> BNode<K, V> {
    pub(super) fn empty_leaf() -> Self {
        Self {
            items: Vec::new(),
            children: Vec::new(),
        }
    }

    pub(super) fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

impl<K: TreeKey, V: TreeValue> PersistentState for BNode<K, V> {
    fn store_state(&self, w: &mut StateWriter<'_>) -> CoreResult<()> {
        self.items.encode(w)?;
        self.children.encode(w)
    }

    fn load_state(r: &mut StateReader<'_>) -> CoreResult<Self> {
        Ok(Self {
            items: Vec::decode(r)?,
            children: Vec::decode(r)?,
        })
    }
}

pub(super) type NodeHandle<K, V> = Persistent<BNode<K, V>>;

fn invariant(message: &str) -> CoreError {
    CoreError::corrupt(format!("tree invariant broken: {message}"))
}

pub(super) fn item_count<K: TreeKey, V: TreeValue>(node: &NodeHandle<K, V>) -> CoreResult<usize> {
    node.read(|n| n.items.len())
}

pub(super) fn is_full<K: TreeKey, V: TreeValue>(
    node: &NodeHandle<K, V>,
    degree: usize,
) -> CoreResult<bool> {
    Ok(item_count(node)? >= 2 * degree - 1)
}

/// Splits the full `children[at]` of `parent` around its median item.
///
/// The left half stays in place, the right half moves into a fresh
/// node, and the median climbs into `parent` at `at`.
pub(super) fn split_child<K: TreeKey, V: TreeValue>(
    parent: &NodeHandle<K, V>,
    at: usize,
    degree: usize,
) -> CoreResult<()> {
    let child = parent.read(|n| n.children[at].clone())?;
    let (median, right) = child.modify(|n| {
        let right_items = n.items.split_off(degree);
        let median = n.items.pop();
        let right_children = if n.is_leaf() {
            Vec::new()
        } else {
            n.children.split_off(degree)
        };
        (
            median,
            BNode {
                items: right_items,
                children: right_children,
            },
        )
    })?;
    let median = median.ok_or_else(|| invariant("split of an empty node"))?;
    let right = Persistent::new(right);
    parent.modify(|n| {
        n.items.insert(at, median);
        n.children.insert(at + 1, right);
    })
}

/// Folds `children[at + 1]` and the separating item into
/// `children[at]`, leaving both siblings at most half full again as one
/// legal node.
pub(super) fn merge_children<K: TreeKey, V: TreeValue>(
    parent: &NodeHandle<K, V>,
    at: usize,
) -> CoreResult<()> {
    let (left, right, separator) = parent.modify(|n| {
        let separator = n.items.remove(at);
        let right = n.children.remove(at + 1);
        (n.children[at].clone(), right, separator)
    })?;
    let (right_items, right_children) = right.read(|n| (n.items.clone(), n.children.clone()))?;
    left.modify(|n| {
        n.items.push(separator);
        n.items.extend(right_items);
        n.children.extend(right_children);
    })
}

fn rotate_from_left<K: TreeKey, V: TreeValue>(
    parent: &NodeHandle<K, V>,
    at: usize,
    left: &NodeHandle<K, V>,
    child: &NodeHandle<K, V>,
) -> CoreResult<()> {
    let (stolen, moved) = left.modify(|n| (n.items.pop(), n.children.pop()))?;
    let stolen = stolen.ok_or_else(|| invariant("rotation from an empty sibling"))?;
    let separator = parent.modify(|n| std::mem::replace(&mut n.items[at - 1], stolen))?;
    child.modify(|n| {
        n.items.insert(0, separator);
        if let Some(subtree) = moved {
            n.children.insert(0, subtree);
        }
    })
}

fn rotate_from_right<K: TreeKey, V: TreeValue>(
    parent: &NodeHandle<K, V>,
    at: usize,
    child: &NodeHandle<K, V>,
    right: &NodeHandle<K, V>,
) -> CoreResult<()> {
    let (stolen, moved) = right.modify(|n| {
        let stolen = if n.items.is_empty() {
            None
        } else {
            Some(n.items.remove(0))
        };
        let moved = if n.children.is_empty() {
            None
        } else {
            Some(n.children.remove(0))
        };
        (stolen, moved)
    })?;
    let stolen = stolen.ok_or_else(|| invariant("rotation from an empty sibling"))?;
    let separator = parent.modify(|n| std::mem::replace(&mut n.items[at], stolen))?;
    child.modify(|n| {
        n.items.push(separator);
        if let Some(subtree) = moved {
            n.children.push(subtree);
        }
    })
}

/// Guarantees `children[at]` holds at least `degree` items before a
/// deletion descends into it, borrowing from a sibling when one can
/// spare an item and merging otherwise. Returns the handle the descent
/// must continue into, which differs from the original child after a
/// merge to the left.
pub(super) fn ensure_child_fill<K: TreeKey, V: TreeValue>(
    parent: &NodeHandle<K, V>,
    at: usize,
    child: NodeHandle<K, V>,
    degree: usize,
) -> CoreResult<NodeHandle<K, V>> {
    if item_count(&child)? >= degree {
        return Ok(child);
    }
    if at > 0 {
        let left = parent.read(|n| n.children[at - 1].clone())?;
        if item_count(&left)? >= degree {
            rotate_from_left(parent, at, &left, &child)?;
            return Ok(child);
        }
    }
    if let Some(right) = parent.read(|n| n.children.get(at + 1).cloned())? {
        if item_count(&right)? >= degree {
            rotate_from_right(parent, at, &child, &right)?;
            return Ok(child);
        }
    }
    if at > 0 {
        merge_children(parent, at - 1)?;
        parent.read(|n| n.children[at - 1].clone())
    } else {
        merge_children(parent, at)?;
        Ok(child)
    }
}

enum EdgeStep<K, V, C> {
    Found(K, V),
    Empty,
    Down(C),
}

fn edge_item<K: TreeKey, V: TreeValue>(
    node: &NodeHandle<K, V>,
    last: bool,
) -> CoreResult<(K, V)> {
    let mut cur = node.clone();
    loop {
        let step = cur.read(|n| {
            let edge = if last { n.items.last() } else { n.items.first() };
            match edge {
                Some(item) if n.is_leaf() => EdgeStep::Found(item.0.clone(), item.1.clone()),
                _ if n.is_leaf() => EdgeStep::Empty,
                _ => {
                    let child = if last {
                        n.children.last()
                    } else {
                        n.children.first()
                    };
                    match child {
                        Some(c) => EdgeStep::Down(c.clone()),
                        None => EdgeStep::Empty,
                    }
                }
            }
        })?;
        match step {
            EdgeStep::Found(k, v) => return Ok((k, v)),
            EdgeStep::Empty => return Err(CoreError::EmptyTree),
            EdgeStep::Down(child) => cur = child,
        }
    }
}

pub(super) fn min_item_of<K: TreeKey, V: TreeValue>(
    node: &NodeHandle<K, V>,
) -> CoreResult<(K, V)> {
    edge_item(node, false)
}

pub(super) fn max_item_of<K: TreeKey, V: TreeValue>(
    node: &NodeHandle<K, V>,
) -> CoreResult<(K, V)> {
    edge_item(node, true)
}
