//! The per-file radix tree mapping logical chunk indices to physical chunks.
//!
//! Level-0 nodes hold [`TNODES_LEVEL0`] chunk references; each internal level above them holds
//! [`TNODES_INTERNAL`] children. A chunk index is consumed from the bottom: its low
//! [`TNODES_LEVEL0_BITS`] select the leaf slot, and each further group of
//! [`TNODES_INTERNAL_BITS`] selects a child one level up. The tree grows a level by pushing the
//! old root down as child 0 of a new root, so existing paths stay valid.

use crate::error::{Result, YaffsError};

pub const TNODES_LEVEL0_BITS: u32 = 4;
pub const TNODES_LEVEL0: usize = 1 << TNODES_LEVEL0_BITS;
pub const TNODES_INTERNAL_BITS: u32 = 3;
pub const TNODES_INTERNAL: usize = 1 << TNODES_INTERNAL_BITS;
pub const TNODES_MAX_LEVEL: u32 = 6;

type Leaf = [Option<u32>; TNODES_LEVEL0];
type Internal = [Option<Tnode>; TNODES_INTERNAL];

#[derive(Debug)]
enum Tnode {
    Leaf(Box<Leaf>),
    Internal(Box<Internal>),
}

/// Number of chunk indices addressable by a tree of the given height
fn span(level: u32) -> u64 {
    (TNODES_LEVEL0 as u64) << (TNODES_INTERNAL_BITS * level)
}

fn child_index(chunk_idx: u32, level: u32) -> usize {
    let shift = TNODES_LEVEL0_BITS + TNODES_INTERNAL_BITS * (level - 1);
    (chunk_idx >> shift) as usize & (TNODES_INTERNAL - 1)
}

/// Recycles tree nodes between files
#[derive(Debug, Default)]
pub struct TnodePool {
    free_leaves: Vec<Box<Leaf>>,
    free_internals: Vec<Box<Internal>>,
    in_use: usize,
}

impl TnodePool {
    fn alloc(&mut self, level: u32) -> Tnode {
        self.in_use += 1;
        if level == 0 {
            Tnode::Leaf(self.free_leaves.pop().unwrap_or_default())
        } else {
            Tnode::Internal(self.free_internals.pop().unwrap_or_default())
        }
    }

    fn free(&mut self, node: Tnode) {
        self.in_use -= 1;
        match node {
            Tnode::Leaf(mut leaf) => {
                leaf.fill(None);
                self.free_leaves.push(leaf);
            }
            Tnode::Internal(mut internal) => {
                for child in internal.iter_mut() {
                    if let Some(child) = child.take() {
                        self.free(child);
                    }
                }
                self.free_internals.push(internal);
            }
        }
    }

    /// Nodes currently owned by some tree
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Nodes waiting on the free lists
    pub fn n_free(&self) -> usize {
        self.free_leaves.len() + self.free_internals.len()
    }
}

/// The chunk map of one file
#[derive(Debug, Default)]
pub struct FileTree {
    top_level: u32,
    root: Option<Tnode>,
}

impl FileTree {
    pub fn top_level(&self) -> u32 {
        self.top_level
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Look up the physical chunk holding logical chunk `chunk_idx`
    pub fn find(&self, chunk_idx: u32) -> Option<u32> {
        if u64::from(chunk_idx) >= span(self.top_level) {
            return None;
        }

        let mut node = self.root.as_ref()?;
        let mut level = self.top_level;
        loop {
            match node {
                Tnode::Internal(children) => {
                    node = children[child_index(chunk_idx, level)].as_ref()?;
                    level -= 1;
                }
                Tnode::Leaf(leaf) => {
                    return leaf[chunk_idx as usize & (TNODES_LEVEL0 - 1)];
                }
            }
        }
    }

    /// Map `chunk_idx` to `chunk`, returning the previous mapping
    pub fn put(&mut self, pool: &mut TnodePool, chunk_idx: u32, chunk: u32) -> Result<Option<u32>> {
        let mut required = 0;
        while u64::from(chunk_idx) >= span(required) {
            required += 1;
        }
        if required > TNODES_MAX_LEVEL {
            return Err(YaffsError::Corrupt("chunk index beyond tree range"));
        }

        while self.top_level < required {
            if let Some(old_root) = self.root.take() {
                let mut new_root = pool.alloc(self.top_level + 1);
                if let Tnode::Internal(children) = &mut new_root {
                    children[0] = Some(old_root);
                }
                self.root = Some(new_root);
            }
            self.top_level += 1;
        }

        let top_level = self.top_level;
        let mut node = self.root.get_or_insert_with(|| pool.alloc(top_level));
        let mut level = top_level;
        loop {
            match node {
                Tnode::Internal(children) => {
                    node = children[child_index(chunk_idx, level)]
                        .get_or_insert_with(|| pool.alloc(level - 1));
                    level -= 1;
                }
                Tnode::Leaf(leaf) => {
                    let slot = &mut leaf[chunk_idx as usize & (TNODES_LEVEL0 - 1)];
                    return Ok(slot.replace(chunk));
                }
            }
        }
    }

    /// Unmap `chunk_idx`, returning what it was mapped to
    pub fn remove(&mut self, pool: &mut TnodePool, chunk_idx: u32) -> Option<u32> {
        let found = self.find(chunk_idx)?;
        self.clear_range(pool, chunk_idx, Some(chunk_idx + 1));
        Some(found)
    }

    /// Drop every mapping at or beyond `n_chunks`, returning the chunks that were mapped there
    ///
    /// Emptied subtrees go back to the pool and the tree loses height while only its first
    /// child is populated.
    pub fn resize_down(&mut self, pool: &mut TnodePool, n_chunks: u32) -> Vec<u32> {
        self.clear_range(pool, n_chunks, None)
    }

    fn clear_range(&mut self, pool: &mut TnodePool, from: u32, to: Option<u32>) -> Vec<u32> {
        let mut freed = Vec::new();
        let range = (u64::from(from), to.map_or(u64::MAX, u64::from));

        if let Some(root) = &mut self.root {
            if prune(root, self.top_level, 0, range, &mut freed, pool) {
                if let Some(root) = self.root.take() {
                    pool.free(root);
                }
                self.top_level = 0;
            }
        }

        while self.top_level > 0 {
            let Some(Tnode::Internal(children)) = &mut self.root else {
                break;
            };
            if children[1..].iter().any(Option::is_some) {
                break;
            }
            let first = children[0].take();
            if let Some(shell) = std::mem::replace(&mut self.root, first) {
                pool.free(shell);
            }
            self.top_level -= 1;
        }

        freed
    }

    /// Visit every mapping in chunk index order
    pub fn for_each(&self, mut f: impl FnMut(u32, u32)) {
        if let Some(root) = &self.root {
            walk(root, self.top_level, 0, &mut f);
        }
    }

    /// Number of mapped chunks
    pub fn len(&self) -> usize {
        let mut count = 0;
        self.for_each(|_, _| count += 1);
        count
    }

    /// Return every node to the pool, handing back the chunks that were mapped
    pub fn free_all(&mut self, pool: &mut TnodePool) -> Vec<u32> {
        self.resize_down(pool, 0)
    }
}

/// Clear entries whose index falls in `[range.0, range.1)`; returns whether the node is now empty
fn prune(
    node: &mut Tnode,
    level: u32,
    base: u64,
    range: (u64, u64),
    freed: &mut Vec<u32>,
    pool: &mut TnodePool,
) -> bool {
    match node {
        Tnode::Leaf(leaf) => {
            for (i, slot) in leaf.iter_mut().enumerate() {
                let idx = base + i as u64;
                if idx >= range.0 && idx < range.1 {
                    freed.extend(slot.take());
                }
            }
            leaf.iter().all(Option::is_none)
        }
        Tnode::Internal(children) => {
            let child_span = span(level - 1);
            for (i, child) in children.iter_mut().enumerate() {
                let child_base = base + i as u64 * child_span;
                if child_base + child_span <= range.0 || child_base >= range.1 {
                    continue;
                }
                let Some(node) = child else {
                    continue;
                };
                if prune(node, level - 1, child_base, range, freed, pool) {
                    if let Some(node) = child.take() {
                        pool.free(node);
                    }
                }
            }
            children.iter().all(Option::is_none)
        }
    }
}

fn walk(node: &Tnode, level: u32, base: u64, f: &mut impl FnMut(u32, u32)) {
    match node {
        Tnode::Leaf(leaf) => {
            for (i, slot) in leaf.iter().enumerate() {
                if let Some(chunk) = slot {
                    f((base + i as u64) as u32, *chunk);
                }
            }
        }
        Tnode::Internal(children) => {
            let child_span = span(level - 1);
            for (i, child) in children.iter().enumerate() {
                if let Some(child) = child {
                    walk(child, level - 1, base + i as u64 * child_span, f);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use proptest::prelude::*;
    use std::collections::HashMap;

    #[test]
    fn test_shrink_to_one_chunk() -> anyhow::Result<()> {
        let mut pool = TnodePool::default();
        let mut tree = FileTree::default();
        for (idx, chunk) in [(0, 100), (1, 101), (2, 102)] {
            tree.put(&mut pool, idx, chunk)?;
        }

        let mut freed = tree.resize_down(&mut pool, 1);
        freed.sort();
        assert_eq!(freed, [101, 102]);
        assert_eq!(tree.find(0), Some(100));
        assert_eq!(tree.find(1), None);
        assert_eq!(tree.find(2), None);

        Ok(())
    }

    #[test]
    fn test_growth_and_collapse() -> anyhow::Result<()> {
        let mut pool = TnodePool::default();
        let mut tree = FileTree::default();

        tree.put(&mut pool, 3, 7)?;
        assert_eq!(tree.top_level(), 0);

        tree.put(&mut pool, 16, 8)?;
        assert_eq!(tree.top_level(), 1);
        tree.put(&mut pool, 128, 9)?;
        assert_eq!(tree.top_level(), 2);
        assert_eq!(tree.put(&mut pool, 3, 10)?, Some(7));

        assert_eq!(tree.resize_down(&mut pool, 17), [9]);
        assert_eq!(tree.top_level(), 1);
        assert_eq!(tree.resize_down(&mut pool, 4), [8]);
        assert_eq!(tree.top_level(), 0);
        assert_eq!(tree.find(3), Some(10));

        assert_eq!(tree.free_all(&mut pool), [10]);
        assert!(tree.is_empty());
        assert_eq!(pool.in_use(), 0);
        assert!(pool.n_free() > 0);

        Ok(())
    }

    #[test]
    fn test_remove_keeps_neighbours() -> anyhow::Result<()> {
        let mut pool = TnodePool::default();
        let mut tree = FileTree::default();
        tree.put(&mut pool, 20, 1)?;
        tree.put(&mut pool, 21, 2)?;

        assert_eq!(tree.remove(&mut pool, 20), Some(1));
        assert_eq!(tree.remove(&mut pool, 20), None);
        assert_eq!(tree.find(21), Some(2));
        assert_eq!(tree.len(), 1);

        Ok(())
    }

    #[test]
    fn test_largest_index() -> anyhow::Result<()> {
        let mut pool = TnodePool::default();
        let mut tree = FileTree::default();
        let largest = crate::config::MAX_CHUNK_ID - 1;

        tree.put(&mut pool, largest, 5)?;
        assert!(tree.top_level() <= TNODES_MAX_LEVEL);
        assert_eq!(tree.find(largest), Some(5));
        assert!(tree.put(&mut pool, u32::MAX, 1).is_err());

        Ok(())
    }

    proptest! {
        #[test]
        fn last_put_wins(ops in prop::collection::vec((0u32..5000, any::<u32>()), 1..200)) {
            let mut pool = TnodePool::default();
            let mut tree = FileTree::default();
            let mut model = HashMap::new();

            for (idx, chunk) in ops {
                let previous = tree.put(&mut pool, idx, chunk).unwrap();
                prop_assert_eq!(previous, model.insert(idx, chunk));
            }
            for idx in 0..5000 {
                prop_assert_eq!(tree.find(idx), model.get(&idx).copied());
            }

            let mut visited = Vec::new();
            tree.for_each(|idx, chunk| visited.push((idx, chunk)));
            let mut expected: Vec<_> = model.into_iter().collect();
            expected.sort();
            prop_assert_eq!(visited, expected);
        }

        #[test]
        fn growth_keeps_entries(
            small in prop::collection::btree_map(0u32..16, any::<u32>(), 1..16),
            big in 16u32..(1 << 20),
        ) {
            let mut pool = TnodePool::default();
            let mut tree = FileTree::default();
            for (&idx, &chunk) in &small {
                tree.put(&mut pool, idx, chunk).unwrap();
            }

            tree.put(&mut pool, big, 1).unwrap();
            for (&idx, &chunk) in &small {
                prop_assert_eq!(tree.find(idx), Some(chunk));
            }
        }

        #[test]
        fn resize_down_frees_tail(
            entries in prop::collection::btree_map(0u32..3000, any::<u32>(), 0..100),
            n_chunks in 0u32..3000,
        ) {
            let mut pool = TnodePool::default();
            let mut tree = FileTree::default();
            for (&idx, &chunk) in &entries {
                tree.put(&mut pool, idx, chunk).unwrap();
            }

            let freed = tree.resize_down(&mut pool, n_chunks);
            let expected: Vec<u32> = entries.range(n_chunks..).map(|(_, &c)| c).collect();
            prop_assert_eq!(freed, expected);
            for (&idx, &chunk) in &entries {
                let want = if idx < n_chunks { Some(chunk) } else { None };
                prop_assert_eq!(tree.find(idx), want);
            }
        }
    }
}
