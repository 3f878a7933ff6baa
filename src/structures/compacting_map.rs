//! Compacting red-black tree
//!
//! Ordered map (or multimap) whose nodes live in a [`NodeArena`]. Erasing a
//! node never leaves a hole: the arena's last node is moved into the freed
//! slot and every link that pointed at it is retargeted, so the backing
//! buffers stay dense and shrink as the map does.
//!
//! Balancing follows the classic CLRS insert/delete fixups. The `RANKED`
//! variant additionally keeps a subtree count on every node, which makes
//! rank queries O(log n).

use super::NodeRef;
use crate::config::MemoryConfig;
use crate::error::{MemoryError, Result};
use crate::memory::contiguous::{NodeArena, NIL};
use std::cmp::Ordering;
use std::fmt;
use std::mem;

/// Orders keys for a [`CompactingMap`].
pub trait KeyComparator<K> {
    fn compare(&self, a: &K, b: &K) -> Ordering;
}

/// `Ord` ordering.
#[derive(Debug, Clone, Copy, Default)]
pub struct NaturalOrder;

impl<K: Ord> KeyComparator<K> for NaturalOrder {
    #[inline]
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

/// Adapts a closure into a [`KeyComparator`].
#[derive(Clone, Copy)]
pub struct FnComparator<F>(pub F);

impl<K, F> KeyComparator<K> for FnComparator<F>
where
    F: Fn(&K, &K) -> Ordering,
{
    #[inline]
    fn compare(&self, a: &K, b: &K) -> Ordering {
        (self.0)(a, b)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Red,
    Black,
}

struct TreeNode<K, V> {
    key: K,
    value: V,
    parent: u32,
    left: u32,
    right: u32,
    color: Color,
    /// Nodes in this subtree, this one included. Only maintained when ranked.
    subct: u32,
}

/// Compacting ordered map.
///
/// With `unique == false` equal keys are kept in insertion order and lookups
/// land on the first of them.
pub struct CompactingMap<K, V, C = NaturalOrder, const RANKED: bool = false> {
    nodes: NodeArena<TreeNode<K, V>>,
    root: u32,
    /// Parent link of the NIL sentinel; only meaningful during delete fixup.
    nil_parent: u32,
    unique: bool,
    comparator: C,
}

/// A [`CompactingMap`] that answers rank queries.
pub type RankedCompactingMap<K, V, C = NaturalOrder> = CompactingMap<K, V, C, true>;

impl<K, V, C: KeyComparator<K> + Default, const RANKED: bool> CompactingMap<K, V, C, RANKED> {
    pub fn new(unique: bool) -> Self {
        Self::with_comparator(unique, C::default())
    }
}

impl<K, V, C: KeyComparator<K>, const RANKED: bool> CompactingMap<K, V, C, RANKED> {
    pub fn with_comparator(unique: bool, comparator: C) -> Self {
        Self::with_options(unique, comparator, MemoryConfig::current().map_nodes_per_buffer)
    }

    pub fn with_options(unique: bool, comparator: C, nodes_per_buffer: usize) -> Self {
        Self {
            nodes: NodeArena::new(nodes_per_buffer),
            root: NIL,
            nil_parent: NIL,
            unique,
            comparator,
        }
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn bytes_allocated(&self) -> usize {
        self.nodes.bytes_allocated()
    }

    /// Inserts `key -> value`. Returns false, dropping the pair, when the map
    /// is unique and already holds `key`.
    pub fn insert(&mut self, key: K, value: V) -> bool {
        let mut y = NIL;
        let mut x = self.root;
        let mut goes_left = false;
        while x != NIL {
            y = x;
            match self.comparator.compare(&key, &self.node(x).key) {
                Ordering::Less => {
                    goes_left = true;
                    x = self.node(x).left;
                }
                Ordering::Equal if self.unique => return false,
                _ => {
                    goes_left = false;
                    x = self.node(x).right;
                }
            }
        }

        let z = self.nodes.alloc(TreeNode {
            key,
            value,
            parent: y,
            left: NIL,
            right: NIL,
            color: Color::Red,
            subct: 1,
        });
        if y == NIL {
            self.root = z;
        } else if goes_left {
            self.node_mut(y).left = z;
        } else {
            self.node_mut(y).right = z;
        }
        if RANKED {
            self.adjust_counts_from(y, true);
        }
        self.insert_fixup(z);
        true
    }

    pub fn erase(&mut self, key: &K) -> bool {
        let node = self.lookup(key);
        if node == NIL {
            return false;
        }
        self.delete_node(node);
        true
    }

    /// Erases the first entry matching both `key` and `value`.
    pub fn erase_exact(&mut self, key: &K, value: &V) -> bool
    where
        V: PartialEq,
    {
        let mut node = self.lookup(key);
        while node != NIL && self.comparator.compare(&self.node(node).key, key) == Ordering::Equal {
            if self.node(node).value == *value {
                self.delete_node(node);
                return true;
            }
            node = self.successor(node);
        }
        false
    }

    /// Erases the entry at `at` and hands it back. Every other [`NodeRef`]
    /// into this map is invalidated.
    pub fn erase_at(&mut self, at: NodeRef) -> (K, V) {
        self.delete_node(at.0)
    }

    pub fn find(&self, key: &K) -> Cursor<'_, K, V, C, RANKED> {
        self.cursor(self.lookup(key))
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.lookup(key) != NIL
    }

    pub fn count(&self, key: &K) -> usize {
        self.equal_range(key).count()
    }

    /// First entry not less than `key`.
    pub fn lower_bound(&self, key: &K) -> Cursor<'_, K, V, C, RANKED> {
        self.cursor(self.lower_bound_node(key))
    }

    /// First entry greater than `key`.
    pub fn upper_bound(&self, key: &K) -> Cursor<'_, K, V, C, RANKED> {
        self.cursor(self.upper_bound_node(key))
    }

    /// Every entry equal to `key`, in order.
    pub fn equal_range(&self, key: &K) -> Iter<'_, K, V, C, RANKED> {
        Iter {
            map: self,
            next: self.lower_bound_node(key),
            end: self.upper_bound_node(key),
        }
    }

    pub fn begin(&self) -> Cursor<'_, K, V, C, RANKED> {
        if self.root == NIL {
            return self.cursor(NIL);
        }
        self.cursor(self.minimum(self.root))
    }

    pub fn rbegin(&self) -> Cursor<'_, K, V, C, RANKED> {
        if self.root == NIL {
            return self.cursor(NIL);
        }
        self.cursor(self.maximum(self.root))
    }

    /// Re-opens a cursor at a position taken from an earlier one.
    pub fn cursor_at(&self, at: NodeRef) -> Cursor<'_, K, V, C, RANKED> {
        assert!((at.0 as usize) < self.len(), "stale node reference {}", at.0);
        self.cursor(at.0)
    }

    pub fn set_value_at(&mut self, at: NodeRef, value: V) -> V {
        mem::replace(&mut self.node_mut(at.0).value, value)
    }

    pub fn iter(&self) -> Iter<'_, K, V, C, RANKED> {
        Iter {
            map: self,
            next: self.begin().node,
            end: NIL,
        }
    }

    /// Checks the red-black and ordering invariants over the whole tree.
    pub fn verify(&self) -> Result<()> {
        if self.root == NIL {
            return if self.is_empty() {
                Ok(())
            } else {
                Err(invariant(format!("empty tree holds {} nodes", self.len())))
            };
        }
        if self.node(self.root).color == Color::Red {
            return Err(invariant("root is red".to_string()));
        }
        if self.node(self.root).parent != NIL {
            return Err(invariant("root has a parent".to_string()));
        }
        self.verify_subtree(self.root)?;
        let reachable = self.full_count(self.root);
        if reachable != self.len() {
            return Err(invariant(format!(
                "{} nodes reachable but {} allocated",
                reachable,
                self.len()
            )));
        }
        let mut prev: Option<&K> = None;
        for (key, _) in self.iter() {
            if let Some(prev) = prev {
                match self.comparator.compare(prev, key) {
                    Ordering::Greater => {
                        return Err(invariant("in-order walk is not sorted".to_string()));
                    }
                    Ordering::Equal if self.unique => {
                        return Err(invariant("duplicate key in a unique map".to_string()));
                    }
                    _ => {}
                }
            }
            prev = Some(key);
        }
        Ok(())
    }

    /// Returns the black height of the subtree at `n`.
    fn verify_subtree(&self, n: u32) -> Result<usize> {
        if n == NIL {
            return Ok(0);
        }
        let node = self.node(n);
        for child in [node.left, node.right] {
            if child == NIL {
                continue;
            }
            if self.node(child).parent != n {
                return Err(invariant(format!("child {} does not point back to {}", child, n)));
            }
            if node.color == Color::Red && self.node(child).color == Color::Red {
                return Err(invariant(format!("red node {} has a red child", n)));
            }
        }
        if node.left != NIL
            && self.comparator.compare(&node.key, &self.node(node.left).key) == Ordering::Less
        {
            return Err(invariant(format!("left child of {} sorts after it", n)));
        }
        if node.right != NIL
            && self.comparator.compare(&self.node(node.right).key, &node.key) == Ordering::Less
        {
            return Err(invariant(format!("right child of {} sorts before it", n)));
        }

        let left_height = self.verify_subtree(node.left)?;
        let right_height = self.verify_subtree(node.right)?;
        if left_height != right_height {
            return Err(invariant(format!(
                "black heights differ under {}: {} vs {}",
                n, left_height, right_height
            )));
        }
        Ok(left_height + usize::from(node.color == Color::Black))
    }

    fn full_count(&self, n: u32) -> usize {
        if n == NIL {
            return 0;
        }
        self.full_count(self.node(n).left) + self.full_count(self.node(n).right) + 1
    }

    #[inline]
    fn cursor(&self, node: u32) -> Cursor<'_, K, V, C, RANKED> {
        Cursor { map: self, node }
    }

    #[inline]
    fn node(&self, x: u32) -> &TreeNode<K, V> {
        self.nodes.get(x)
    }

    #[inline]
    fn node_mut(&mut self, x: u32) -> &mut TreeNode<K, V> {
        self.nodes.get_mut(x)
    }

    #[inline]
    fn left(&self, x: u32) -> u32 {
        if x == NIL {
            NIL
        } else {
            self.node(x).left
        }
    }

    #[inline]
    fn right(&self, x: u32) -> u32 {
        if x == NIL {
            NIL
        } else {
            self.node(x).right
        }
    }

    #[inline]
    fn parent(&self, x: u32) -> u32 {
        if x == NIL {
            self.nil_parent
        } else {
            self.node(x).parent
        }
    }

    #[inline]
    fn set_parent(&mut self, x: u32, parent: u32) {
        if x == NIL {
            self.nil_parent = parent;
        } else {
            self.node_mut(x).parent = parent;
        }
    }

    #[inline]
    fn color(&self, x: u32) -> Color {
        if x == NIL {
            Color::Black
        } else {
            self.node(x).color
        }
    }

    #[inline]
    fn set_color(&mut self, x: u32, color: Color) {
        if x != NIL {
            self.node_mut(x).color = color;
        }
    }

    #[inline]
    fn subct(&self, x: u32) -> u32 {
        if x == NIL {
            0
        } else {
            self.node(x).subct
        }
    }

    /// Points whatever linked to `old` (parent's child slot or the root) at
    /// `new`, given `old`'s parent.
    fn replace_child(&mut self, parent: u32, old: u32, new: u32) {
        if parent == NIL {
            self.root = new;
        } else if self.node(parent).left == old {
            self.node_mut(parent).left = new;
        } else {
            self.node_mut(parent).right = new;
        }
    }

    fn adjust_counts_from(&mut self, mut x: u32, grow: bool) {
        while x != NIL {
            let node = self.node_mut(x);
            if grow {
                node.subct += 1;
            } else {
                node.subct -= 1;
            }
            x = node.parent;
        }
    }

    fn minimum(&self, mut x: u32) -> u32 {
        while self.node(x).left != NIL {
            x = self.node(x).left;
        }
        x
    }

    fn maximum(&self, mut x: u32) -> u32 {
        while self.node(x).right != NIL {
            x = self.node(x).right;
        }
        x
    }

    fn successor(&self, mut x: u32) -> u32 {
        if self.node(x).right != NIL {
            return self.minimum(self.node(x).right);
        }
        let mut y = self.node(x).parent;
        while y != NIL && x == self.node(y).right {
            x = y;
            y = self.node(y).parent;
        }
        y
    }

    fn predecessor(&self, mut x: u32) -> u32 {
        if self.node(x).left != NIL {
            return self.maximum(self.node(x).left);
        }
        let mut y = self.node(x).parent;
        while y != NIL && x == self.node(y).left {
            x = y;
            y = self.node(y).parent;
        }
        y
    }

    /// First node equal to `key`, or NIL.
    fn lookup(&self, key: &K) -> u32 {
        let mut x = self.root;
        let mut found = NIL;
        while x != NIL {
            match self.comparator.compare(key, &self.node(x).key) {
                Ordering::Less => x = self.node(x).left,
                Ordering::Greater => x = self.node(x).right,
                Ordering::Equal if self.unique => return x,
                Ordering::Equal => {
                    found = x;
                    x = self.node(x).left;
                }
            }
        }
        found
    }

    fn lower_bound_node(&self, key: &K) -> u32 {
        let mut x = self.root;
        let mut bound = NIL;
        while x != NIL {
            if self.comparator.compare(&self.node(x).key, key) == Ordering::Less {
                x = self.node(x).right;
            } else {
                bound = x;
                x = self.node(x).left;
            }
        }
        bound
    }

    fn upper_bound_node(&self, key: &K) -> u32 {
        let mut x = self.root;
        let mut bound = NIL;
        while x != NIL {
            if self.comparator.compare(key, &self.node(x).key) == Ordering::Less {
                bound = x;
                x = self.node(x).left;
            } else {
                x = self.node(x).right;
            }
        }
        bound
    }

    fn left_rotate(&mut self, x: u32) {
        let y = self.node(x).right;
        let y_left = self.node(y).left;
        self.node_mut(x).right = y_left;
        if y_left != NIL {
            self.node_mut(y_left).parent = x;
        }
        let x_parent = self.node(x).parent;
        self.node_mut(y).parent = x_parent;
        self.replace_child(x_parent, x, y);
        self.node_mut(y).left = x;
        self.node_mut(x).parent = y;
        if RANKED {
            self.node_mut(y).subct = self.node(x).subct;
            let subct = self.subct(self.node(x).left) + self.subct(self.node(x).right) + 1;
            self.node_mut(x).subct = subct;
        }
    }

    fn right_rotate(&mut self, x: u32) {
        let y = self.node(x).left;
        let y_right = self.node(y).right;
        self.node_mut(x).left = y_right;
        if y_right != NIL {
            self.node_mut(y_right).parent = x;
        }
        let x_parent = self.node(x).parent;
        self.node_mut(y).parent = x_parent;
        self.replace_child(x_parent, x, y);
        self.node_mut(y).right = x;
        self.node_mut(x).parent = y;
        if RANKED {
            self.node_mut(y).subct = self.node(x).subct;
            let subct = self.subct(self.node(x).left) + self.subct(self.node(x).right) + 1;
            self.node_mut(x).subct = subct;
        }
    }

    fn insert_fixup(&mut self, mut z: u32) {
        while self.color(self.parent(z)) == Color::Red {
            let zp = self.parent(z);
            let zpp = self.parent(zp);
            if zp == self.left(zpp) {
                let uncle = self.right(zpp);
                if self.color(uncle) == Color::Red {
                    self.set_color(zp, Color::Black);
                    self.set_color(uncle, Color::Black);
                    self.set_color(zpp, Color::Red);
                    z = zpp;
                } else {
                    if z == self.right(zp) {
                        z = zp;
                        self.left_rotate(z);
                    }
                    let zp = self.parent(z);
                    let zpp = self.parent(zp);
                    self.set_color(zp, Color::Black);
                    self.set_color(zpp, Color::Red);
                    self.right_rotate(zpp);
                }
            } else {
                let uncle = self.left(zpp);
                if self.color(uncle) == Color::Red {
                    self.set_color(zp, Color::Black);
                    self.set_color(uncle, Color::Black);
                    self.set_color(zpp, Color::Red);
                    z = zpp;
                } else {
                    if z == self.left(zp) {
                        z = zp;
                        self.right_rotate(z);
                    }
                    let zp = self.parent(z);
                    let zpp = self.parent(zp);
                    self.set_color(zp, Color::Black);
                    self.set_color(zpp, Color::Red);
                    self.left_rotate(zpp);
                }
            }
        }
        let root = self.root;
        self.set_color(root, Color::Black);
    }

    fn delete_node(&mut self, z: u32) -> (K, V) {
        // y is the node physically unlinked from the tree
        let y = if self.node(z).left == NIL || self.node(z).right == NIL {
            z
        } else {
            self.successor(z)
        };
        let x = if self.node(y).left != NIL {
            self.node(y).left
        } else {
            self.node(y).right
        };
        let y_parent = self.node(y).parent;
        self.set_parent(x, y_parent);
        self.replace_child(y_parent, y, x);

        if y != z {
            let (zn, yn) = self.nodes.get_pair_mut(z, y);
            mem::swap(&mut zn.key, &mut yn.key);
            mem::swap(&mut zn.value, &mut yn.value);
        }
        if RANKED {
            self.adjust_counts_from(y_parent, false);
        }
        if self.node(y).color == Color::Black {
            self.delete_fixup(x);
        }
        self.fragment_fixup(y)
    }

    fn delete_fixup(&mut self, mut x: u32) {
        while x != self.root && self.color(x) == Color::Black {
            let xp = self.parent(x);
            if x == self.left(xp) {
                let mut w = self.right(xp);
                if self.color(w) == Color::Red {
                    self.set_color(w, Color::Black);
                    self.set_color(xp, Color::Red);
                    self.left_rotate(xp);
                    w = self.right(self.parent(x));
                }
                if self.color(self.left(w)) == Color::Black && self.color(self.right(w)) == Color::Black {
                    self.set_color(w, Color::Red);
                    x = self.parent(x);
                } else {
                    if self.color(self.right(w)) == Color::Black {
                        let wl = self.left(w);
                        self.set_color(wl, Color::Black);
                        self.set_color(w, Color::Red);
                        self.right_rotate(w);
                        w = self.right(self.parent(x));
                    }
                    let xp = self.parent(x);
                    self.set_color(w, self.color(xp));
                    self.set_color(xp, Color::Black);
                    let wr = self.right(w);
                    self.set_color(wr, Color::Black);
                    self.left_rotate(xp);
                    x = self.root;
                }
            } else {
                let mut w = self.left(xp);
                if self.color(w) == Color::Red {
                    self.set_color(w, Color::Black);
                    self.set_color(xp, Color::Red);
                    self.right_rotate(xp);
                    w = self.left(self.parent(x));
                }
                if self.color(self.right(w)) == Color::Black && self.color(self.left(w)) == Color::Black {
                    self.set_color(w, Color::Red);
                    x = self.parent(x);
                } else {
                    if self.color(self.left(w)) == Color::Black {
                        let wr = self.right(w);
                        self.set_color(wr, Color::Black);
                        self.set_color(w, Color::Red);
                        self.left_rotate(w);
                        w = self.left(self.parent(x));
                    }
                    let xp = self.parent(x);
                    self.set_color(w, self.color(xp));
                    self.set_color(xp, Color::Black);
                    let wl = self.left(w);
                    self.set_color(wl, Color::Black);
                    self.right_rotate(xp);
                    x = self.root;
                }
            }
        }
        self.set_color(x, Color::Black);
        self.nil_parent = NIL;
    }

    /// Frees `hole`, which is already unlinked, by moving the arena's last
    /// node into it.
    fn fragment_fixup(&mut self, hole: u32) -> (K, V) {
        let (removed, moved_from) = self.nodes.swap_remove(hole);
        if let Some(from) = moved_from {
            let (parent, left, right) = {
                let node = self.node(hole);
                (node.parent, node.left, node.right)
            };
            self.replace_child(parent, from, hole);
            if left != NIL {
                self.node_mut(left).parent = hole;
            }
            if right != NIL {
                self.node_mut(right).parent = hole;
            }
        }
        (removed.key, removed.value)
    }
}

impl<K, V, C: KeyComparator<K>> CompactingMap<K, V, C, true> {
    /// 1-based rank of the first entry equal to `key`.
    pub fn rank_lower(&self, key: &K) -> Option<usize> {
        if self.lookup(key) == NIL {
            return None;
        }
        Some(self.count_before(key, false) + 1)
    }

    /// 1-based rank of the last entry equal to `key`.
    pub fn rank_upper(&self, key: &K) -> Option<usize> {
        if self.lookup(key) == NIL {
            return None;
        }
        Some(self.count_before(key, true))
    }

    /// Entry at 1-based position `rank`.
    pub fn find_rank(&self, rank: usize) -> Cursor<'_, K, V, C, true> {
        let mut x = self.root;
        let mut remaining = rank;
        while x != NIL {
            let left = self.subct(self.node(x).left) as usize;
            if remaining <= left {
                x = self.node(x).left;
            } else if remaining == left + 1 {
                return self.cursor(x);
            } else {
                remaining -= left + 1;
                x = self.node(x).right;
            }
        }
        self.cursor(NIL)
    }

    /// Entries strictly less than `key`, or not greater when `inclusive`.
    fn count_before(&self, key: &K, inclusive: bool) -> usize {
        let mut x = self.root;
        let mut count = 0;
        while x != NIL {
            let ord = self.comparator.compare(&self.node(x).key, key);
            let before = ord == Ordering::Less || (inclusive && ord == Ordering::Equal);
            if before {
                count += self.subct(self.node(x).left) as usize + 1;
                x = self.node(x).right;
            } else {
                x = self.node(x).left;
            }
        }
        count
    }

    /// Checks every subtree count and that each entry's rank agrees with
    /// its in-order position.
    pub fn verify_rank(&self) -> Result<()> {
        self.verify_counts(self.root)?;
        for (position, node) in NodeWalk::new(self).enumerate() {
            let rank = position + 1;
            let key = &self.node(node).key;
            let lower = self.count_before(key, false) + 1;
            let upper = self.count_before(key, true);
            if rank < lower || rank > upper {
                return Err(invariant(format!(
                    "entry at position {} reports ranks {}..={}",
                    rank, lower, upper
                )));
            }
            let at_rank = self.find_rank(rank).node;
            if at_rank == NIL
                || self.comparator.compare(&self.node(at_rank).key, key) != Ordering::Equal
            {
                return Err(invariant(format!("find_rank({}) lands on the wrong key", rank)));
            }
        }
        Ok(())
    }

    fn verify_counts(&self, n: u32) -> Result<u32> {
        if n == NIL {
            return Ok(0);
        }
        let expected = self.verify_counts(self.node(n).left)? + self.verify_counts(self.node(n).right)? + 1;
        if self.node(n).subct != expected {
            return Err(invariant(format!(
                "node {} counts {} but its subtree holds {}",
                n,
                self.node(n).subct,
                expected
            )));
        }
        Ok(expected)
    }
}

fn invariant(message: String) -> MemoryError {
    MemoryError::Invariant(message)
}

impl<K, V, C, const RANKED: bool> fmt::Debug for CompactingMap<K, V, C, RANKED> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompactingMap")
            .field("len", &self.nodes.len())
            .field("unique", &self.unique)
            .field("ranked", &RANKED)
            .field("bytes_allocated", &self.nodes.bytes_allocated())
            .finish()
    }
}

/// In-order node indices.
struct NodeWalk<'a, K, V, C, const RANKED: bool> {
    map: &'a CompactingMap<K, V, C, RANKED>,
    next: u32,
}

impl<'a, K, V, C: KeyComparator<K>, const RANKED: bool> NodeWalk<'a, K, V, C, RANKED> {
    fn new(map: &'a CompactingMap<K, V, C, RANKED>) -> Self {
        Self {
            map,
            next: map.begin().node,
        }
    }
}

impl<K, V, C: KeyComparator<K>, const RANKED: bool> Iterator for NodeWalk<'_, K, V, C, RANKED> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.next == NIL {
            return None;
        }
        let current = self.next;
        self.next = self.map.successor(current);
        Some(current)
    }
}

/// Position in a [`CompactingMap`]. Past either end it `is_end()`.
pub struct Cursor<'a, K, V, C, const RANKED: bool> {
    map: &'a CompactingMap<K, V, C, RANKED>,
    node: u32,
}

impl<'a, K, V, C: KeyComparator<K>, const RANKED: bool> Cursor<'a, K, V, C, RANKED> {
    pub fn is_end(&self) -> bool {
        self.node == NIL
    }

    pub fn key(&self) -> Option<&'a K> {
        self.entry().map(|(key, _)| key)
    }

    pub fn value(&self) -> Option<&'a V> {
        self.entry().map(|(_, value)| value)
    }

    pub fn entry(&self) -> Option<(&'a K, &'a V)> {
        if self.node == NIL {
            return None;
        }
        let node = self.map.node(self.node);
        Some((&node.key, &node.value))
    }

    pub fn move_next(&mut self) {
        if self.node != NIL {
            self.node = self.map.successor(self.node);
        }
    }

    pub fn move_prev(&mut self) {
        if self.node != NIL {
            self.node = self.map.predecessor(self.node);
        }
    }

    /// Handle for [`CompactingMap::erase_at`] and
    /// [`CompactingMap::set_value_at`]; valid until the map is next modified.
    pub fn node_ref(&self) -> Option<NodeRef> {
        (self.node != NIL).then_some(NodeRef(self.node))
    }
}

impl<K, V, C, const RANKED: bool> Clone for Cursor<'_, K, V, C, RANKED> {
    fn clone(&self) -> Self {
        Self {
            map: self.map,
            node: self.node,
        }
    }
}

/// In-order iterator over a [`CompactingMap`], optionally bounded.
pub struct Iter<'a, K, V, C, const RANKED: bool> {
    map: &'a CompactingMap<K, V, C, RANKED>,
    next: u32,
    end: u32,
}

impl<'a, K, V, C: KeyComparator<K>, const RANKED: bool> Iterator for Iter<'a, K, V, C, RANKED> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == self.end || self.next == NIL {
            return None;
        }
        let node = self.map.node(self.next);
        self.next = self.map.successor(self.next);
        Some((&node.key, &node.value))
    }
}

impl<'a, K, V, C: KeyComparator<K>, const RANKED: bool> IntoIterator for &'a CompactingMap<K, V, C, RANKED> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V, C, RANKED>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small<K: Ord, V>(unique: bool) -> CompactingMap<K, V> {
        CompactingMap::with_options(unique, NaturalOrder, 4)
    }

    fn small_ranked<K: Ord, V>(unique: bool) -> RankedCompactingMap<K, V> {
        CompactingMap::with_options(unique, NaturalOrder, 4)
    }

    #[test]
    fn test_verify_catches_misplaced_grandchild() {
        let mut map = small(false);
        for key in [20, 10, 30, 5, 15] {
            map.insert(key, ());
        }
        map.verify().unwrap();

        // 15 is the right child of 10, under the root 20
        let grandchild = map.lookup(&15);
        assert_eq!(map.node(map.node(grandchild).parent).key, 10);
        map.node_mut(grandchild).key = 25;
        assert!(matches!(map.verify(), Err(MemoryError::Invariant(_))));
    }

    #[test]
    fn test_unique_insert_rejects_duplicates() {
        let mut map = small(true);
        assert!(map.insert(5, "five"));
        assert!(!map.insert(5, "again"));
        assert_eq!(map.len(), 1);
        assert_eq!(map.find(&5).value(), Some(&"five"));
        map.verify().unwrap();
    }

    #[test]
    fn test_iteration_is_sorted_after_mixed_operations() {
        let mut map = small(true);
        for key in [50, 20, 80, 10, 30, 70, 90, 60, 40] {
            assert!(map.insert(key, key * 10));
        }
        assert!(map.erase(&20));
        assert!(map.erase(&80));
        assert!(!map.erase(&81));
        map.verify().unwrap();

        let keys: Vec<i32> = map.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![10, 30, 40, 50, 60, 70, 90]);
        assert_eq!(map.begin().key(), Some(&10));
        assert_eq!(map.rbegin().key(), Some(&90));
    }

    #[test]
    fn test_bounds() {
        let mut map = small(true);
        for key in (0..100).step_by(10) {
            map.insert(key, ());
        }
        assert_eq!(map.lower_bound(&25).key(), Some(&30));
        assert_eq!(map.lower_bound(&30).key(), Some(&30));
        assert_eq!(map.upper_bound(&30).key(), Some(&40));
        assert!(map.lower_bound(&95).is_end());
        assert_eq!(map.lower_bound(&-5).key(), Some(&0));
    }

    #[test]
    fn test_duplicates_keep_insertion_order() {
        let mut map = small(false);
        map.insert(1, 'a');
        map.insert(2, 'x');
        map.insert(1, 'b');
        map.insert(1, 'c');
        map.insert(0, 'z');

        let values: Vec<char> = map.equal_range(&1).map(|(_, v)| *v).collect();
        assert_eq!(values, vec!['a', 'b', 'c']);
        assert_eq!(map.find(&1).value(), Some(&'a'));
        assert_eq!(map.count(&1), 3);

        assert!(map.erase_exact(&1, &'b'));
        assert!(!map.erase_exact(&1, &'q'));
        let values: Vec<char> = map.equal_range(&1).map(|(_, v)| *v).collect();
        assert_eq!(values, vec!['a', 'c']);
        map.verify().unwrap();
    }

    #[test]
    fn test_cursor_walks_both_ways() {
        let mut map = small(true);
        for key in 1..=5 {
            map.insert(key, ());
        }
        let mut cursor = map.find(&3);
        cursor.move_prev();
        assert_eq!(cursor.key(), Some(&2));
        cursor.move_next();
        cursor.move_next();
        assert_eq!(cursor.key(), Some(&4));
        cursor.move_next();
        cursor.move_next();
        assert!(cursor.is_end());
    }

    #[test]
    fn test_erase_at_and_set_value_at() {
        let mut map = small(true);
        for key in 0..20 {
            map.insert(key, key);
        }
        let at = map.find(&7).node_ref().unwrap();
        assert_eq!(map.set_value_at(at, 700), 7);
        assert_eq!(map.find(&7).value(), Some(&700));

        let at = map.find(&7).node_ref().unwrap();
        assert_eq!(map.erase_at(at), (7, 700));
        assert!(map.find(&7).is_end());
        assert_eq!(map.len(), 19);
        map.verify().unwrap();
    }

    #[test]
    fn test_storage_shrinks_as_entries_are_erased() {
        let mut map = small(true);
        for key in 0..40 {
            map.insert(key, key);
        }
        let full = map.bytes_allocated();
        for key in (0..40).rev().step_by(2) {
            map.erase(&key);
            map.verify().unwrap();
        }
        assert!(map.bytes_allocated() < full);
        for key in 0..40 {
            map.erase(&key);
        }
        assert!(map.is_empty());
        assert_eq!(map.bytes_allocated(), 0);
        map.verify().unwrap();
    }

    #[test]
    fn test_custom_comparator_reverses_order() {
        let mut map: CompactingMap<i32, (), _> =
            CompactingMap::with_options(true, FnComparator(|a: &i32, b: &i32| b.cmp(a)), 8);
        for key in [3, 1, 2] {
            map.insert(key, ());
        }
        let keys: Vec<i32> = map.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![3, 2, 1]);
    }

    #[test]
    fn test_ranks_on_unique_map() {
        let mut map = small_ranked(true);
        for key in [40, 10, 30, 20, 50] {
            map.insert(key, ());
        }
        assert_eq!(map.rank_lower(&10), Some(1));
        assert_eq!(map.rank_lower(&40), Some(4));
        assert_eq!(map.rank_upper(&40), Some(4));
        assert_eq!(map.rank_lower(&35), None);
        assert_eq!(map.find_rank(3).key(), Some(&30));
        assert!(map.find_rank(6).is_end());
        map.verify_rank().unwrap();

        map.erase(&10);
        assert_eq!(map.rank_lower(&40), Some(3));
        map.verify_rank().unwrap();
    }

    #[test]
    fn test_ranks_span_duplicates() {
        let mut map = small_ranked(false);
        for (key, value) in [(1, 'a'), (2, 'b'), (2, 'c'), (2, 'd'), (3, 'e')] {
            map.insert(key, value);
        }
        assert_eq!(map.rank_lower(&2), Some(2));
        assert_eq!(map.rank_upper(&2), Some(4));
        assert_eq!(map.rank_lower(&3), Some(5));
        map.verify().unwrap();
        map.verify_rank().unwrap();
    }

    #[test]
    fn test_values_are_dropped_with_the_map() {
        use std::sync::Arc;

        let shared = Arc::new(());
        {
            let mut map = small(true);
            for key in 0..10 {
                map.insert(key, Arc::clone(&shared));
            }
            map.erase(&3);
            assert_eq!(Arc::strong_count(&shared), 10);
        }
        assert_eq!(Arc::strong_count(&shared), 1);
    }
}
