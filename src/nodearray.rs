/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Node arrays: per-value maps from neighbour index to a small
//! displacement set, sparse while small and dense once crowded.

use alloc::vec;
use alloc::vec::Vec;
use core::cmp::{max, min};

/// Displacement set: bit `d + 7` for each conflicting displacement
/// `d` in `-7..=7`.
pub(crate) type NodeValue = u16;

/// Largest number of entries kept in sparse form.
pub(crate) const MAX_SPARSE: usize = 1024;

const MIN_SPARSE_CAPACITY: usize = 64;

/// A hybrid sparse/dense mapping from node indices to displacement
/// sets.
///
/// The sparse form is a key-sorted vector. Once it would hold a
/// quarter of all nodes (or `max_sparse` entries) it is replaced by a
/// dense vector indexed by node. The change is never undone.
#[derive(Clone, Debug)]
pub(crate) enum NodeArray {
    Sparse(Vec<(u32, NodeValue)>),
    Dense(Vec<NodeValue>),
}

impl Default for NodeArray {
    fn default() -> Self {
        NodeArray::new()
    }
}

impl NodeArray {
    pub fn new() -> Self {
        NodeArray::Sparse(Vec::new())
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, NodeArray::Sparse(_))
    }

    /// The displacement set recorded for `key`, or zero.
    pub fn get(&self, key: u32) -> NodeValue {
        match self {
            NodeArray::Sparse(elems) => match elems.binary_search_by_key(&key, |&(k, _)| k) {
                Ok(i) => elems[i].1,
                Err(_) => 0,
            },
            NodeArray::Dense(values) => values.get(key as usize).copied().unwrap_or(0),
        }
    }

    /// OR `value` into the set for `key`. `node_count` bounds the key
    /// space; a zero `value` records nothing.
    pub fn orr(&mut self, key: u32, value: NodeValue, max_sparse: usize, node_count: usize) {
        debug_assert!((key as usize) < node_count);
        if value == 0 {
            return;
        }

        if let NodeArray::Sparse(elems) = self {
            let pos = match elems.binary_search_by_key(&key, |&(k, _)| k) {
                Ok(i) => {
                    elems[i].1 |= value;
                    return;
                }
                Err(pos) => pos,
            };

            let size = elems.len();
            if size < max_sparse && size + 1 < node_count / 4 {
                if size == elems.capacity() {
                    let capacity = min(max(elems.capacity() * 2, MIN_SPARSE_CAPACITY), max_sparse);
                    elems.reserve_exact(capacity - size);
                }
                elems.insert(pos, (key, value));
                return;
            }

            trace!("nodearray: promoting {} entries to dense", size);
            let mut dense = vec![0; node_count];
            for &(k, v) in elems.iter() {
                dense[k as usize] = v;
            }
            *self = NodeArray::Dense(dense);
        }

        if let NodeArray::Dense(values) = self {
            if values.len() < node_count {
                values.resize(node_count, 0);
            }
            values[key as usize] |= value;
        }
    }

    /// Nonzero entries in increasing key order.
    pub fn iter(&self) -> NodeArrayIter<'_> {
        match self {
            NodeArray::Sparse(elems) => NodeArrayIter::Sparse(elems.iter()),
            NodeArray::Dense(values) => NodeArrayIter::Dense(values.iter().enumerate()),
        }
    }

    /// Number of nonzero entries.
    pub fn len(&self) -> usize {
        match self {
            NodeArray::Sparse(elems) => elems.len(),
            NodeArray::Dense(values) => values.iter().filter(|&&v| v != 0).count(),
        }
    }
}

pub(crate) enum NodeArrayIter<'a> {
    Sparse(core::slice::Iter<'a, (u32, NodeValue)>),
    Dense(core::iter::Enumerate<core::slice::Iter<'a, NodeValue>>),
}

impl<'a> Iterator for NodeArrayIter<'a> {
    type Item = (u32, NodeValue);

    fn next(&mut self) -> Option<(u32, NodeValue)> {
        match self {
            NodeArrayIter::Sparse(it) => it.next().copied(),
            NodeArrayIter::Dense(it) => it
                .find(|&(_, &v)| v != 0)
                .map(|(k, &v)| (k as u32, v)),
        }
    }
}
