//! Compacting chained hash table
//!
//! Buckets chain distinct keys through `next`; in a multimap, further
//! entries for a key hang off its head through `dup`. Nodes sit in a
//! [`NodeArena`] and erasing one moves the arena's last node into the hole,
//! so storage stays dense.
//!
//! The bucket count is taken from a table of primes. It grows past 75% and
//! shrinks under 15% occupancy, both counted in distinct keys, and never
//! drops below the size the table started with.

use super::NodeRef;
use crate::config::MemoryConfig;
use crate::error::{fatal, MemoryError, Result};
use crate::memory::contiguous::{NodeArena, NIL};
use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::mem;
use tracing::trace;

const MAX_LOAD_FACTOR: usize = 75;
const MIN_LOAD_FACTOR: usize = 15;

const BUCKET_SIZES: [usize; 26] = [
    53, 97, 193, 389, 769, 1543, 3079, 6151, 12289, 24593, 49157, 98317, 196613, 393241, 786433,
    1572869, 3145739, 6291469, 12582917, 25165843, 50331653, 100663319, 201326611, 402653189,
    805306457, 1610612741,
];

/// Index into [`BUCKET_SIZES`] of the smallest size holding `min_buckets`.
fn size_index_for(min_buckets: usize) -> usize {
    BUCKET_SIZES
        .iter()
        .position(|&size| size >= min_buckets)
        .unwrap_or(BUCKET_SIZES.len() - 1)
}

mod sealed {
    pub trait Sealed {}
}

/// Whether a table keeps one entry per key or many.
///
/// Unique tables carry no duplicate link, so their nodes are smaller.
pub trait Uniqueness: sealed::Sealed {
    const UNIQUE: bool;
    type DupLink: Copy + fmt::Debug;

    fn no_dup() -> Self::DupLink;
    fn dup(link: &Self::DupLink) -> u32;
    fn set_dup(link: &mut Self::DupLink, to: u32);
}

/// One entry per key.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniqueKeys;

/// Any number of entries per key.
#[derive(Debug, Clone, Copy, Default)]
pub struct DuplicateKeys;

impl sealed::Sealed for UniqueKeys {}
impl sealed::Sealed for DuplicateKeys {}

impl Uniqueness for UniqueKeys {
    const UNIQUE: bool = true;
    type DupLink = ();

    #[inline]
    fn no_dup() -> Self::DupLink {}

    #[inline]
    fn dup(_: &Self::DupLink) -> u32 {
        NIL
    }

    #[inline]
    fn set_dup(_: &mut Self::DupLink, to: u32) {
        debug_assert_eq!(to, NIL, "unique tables never chain duplicates");
    }
}

impl Uniqueness for DuplicateKeys {
    const UNIQUE: bool = false;
    type DupLink = u32;

    #[inline]
    fn no_dup() -> u32 {
        NIL
    }

    #[inline]
    fn dup(link: &u32) -> u32 {
        *link
    }

    #[inline]
    fn set_dup(link: &mut u32, to: u32) {
        *link = to;
    }
}

struct HashNode<K, V, D> {
    key: K,
    value: V,
    /// Full hash, kept so resizing never rehashes keys.
    hash: u64,
    next: u32,
    dup: D,
}

/// Who points at a node.
#[derive(Debug, Clone, Copy)]
enum Link {
    Bucket(usize),
    Next(u32),
    Dup(u32),
}

/// Compacting hash table; see [`CompactingHashMap`] and
/// [`CompactingHashMultiMap`].
pub struct CompactingHashTable<K, V, U: Uniqueness, S = RandomState> {
    nodes: NodeArena<HashNode<K, V, U::DupLink>>,
    buckets: Vec<u32>,
    size_index: usize,
    initial_size_index: usize,
    unique_count: usize,
    hasher: S,
}

pub type CompactingHashMap<K, V, S = RandomState> = CompactingHashTable<K, V, UniqueKeys, S>;
pub type CompactingHashMultiMap<K, V, S = RandomState> = CompactingHashTable<K, V, DuplicateKeys, S>;

impl<K: Hash + Eq, V, U: Uniqueness> CompactingHashTable<K, V, U, RandomState> {
    pub fn new() -> Self {
        Self::with_hasher(RandomState::new())
    }
}

impl<K: Hash + Eq, V, U: Uniqueness> Default for CompactingHashTable<K, V, U, RandomState> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq, V, U: Uniqueness, S: BuildHasher> CompactingHashTable<K, V, U, S> {
    pub fn with_hasher(hasher: S) -> Self {
        let config = MemoryConfig::current();
        Self::with_options(config.hash_initial_buckets, config.hash_nodes_per_buffer, hasher)
    }

    /// `initial_buckets` is rounded up to the next size in the bucket table.
    pub fn with_options(initial_buckets: usize, nodes_per_buffer: usize, hasher: S) -> Self {
        let size_index = size_index_for(initial_buckets);
        Self {
            nodes: NodeArena::new(nodes_per_buffer),
            buckets: vec![NIL; BUCKET_SIZES[size_index]],
            size_index,
            initial_size_index: size_index,
            unique_count: 0,
            hasher,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn unique_len(&self) -> usize {
        self.unique_count
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn bytes_allocated(&self) -> usize {
        self.nodes.bytes_allocated() + self.buckets.len() * mem::size_of::<u32>()
    }

    /// First entry for `key`; the cursor then walks that key's duplicates.
    pub fn find(&self, key: &K) -> HashCursor<'_, K, V, U, S> {
        let hash = self.hasher.hash_one(key);
        self.cursor(self.find_head(hash, key))
    }

    pub fn contains_key(&self, key: &K) -> bool {
        !self.find(key).is_end()
    }

    /// Entry matching both `key` and `value`.
    pub fn find_exact(&self, key: &K, value: &V) -> HashCursor<'_, K, V, U, S>
    where
        V: PartialEq,
    {
        let hash = self.hasher.hash_one(key);
        self.cursor(self.find_exact_node(hash, key, value))
    }

    /// Returns false, dropping the pair, when the table is unique and
    /// already holds `key`.
    pub fn insert(&mut self, key: K, value: V) -> bool {
        let hash = self.hasher.hash_one(&key);
        let existing = self.find_head(hash, &key);
        if existing != NIL && U::UNIQUE {
            return false;
        }

        let node = self.nodes.alloc(HashNode {
            key,
            value,
            hash,
            next: NIL,
            dup: U::no_dup(),
        });
        if existing != NIL {
            // new duplicates go right behind the head
            let after = U::dup(&self.nodes.get(existing).dup);
            U::set_dup(&mut self.nodes.get_mut(node).dup, after);
            U::set_dup(&mut self.nodes.get_mut(existing).dup, node);
        } else {
            let bucket = self.bucket_of(hash);
            self.nodes.get_mut(node).next = self.buckets[bucket];
            self.buckets[bucket] = node;
            self.unique_count += 1;
        }
        self.check_load_factor();
        true
    }

    /// Erases the entry matching both `key` and `value`.
    pub fn erase_exact(&mut self, key: &K, value: &V) -> bool
    where
        V: PartialEq,
    {
        let hash = self.hasher.hash_one(key);
        let node = self.find_exact_node(hash, key, value);
        if node == NIL {
            return false;
        }
        self.remove_node(node);
        true
    }

    /// Erases the entry at `at`. Every other [`NodeRef`] into this table is
    /// invalidated.
    pub fn erase_at(&mut self, at: NodeRef) -> (K, V) {
        self.remove_node(at.0)
    }

    pub fn set_value_at(&mut self, at: NodeRef, value: V) -> V {
        mem::replace(&mut self.nodes.get_mut(at.0).value, value)
    }

    /// Checks hashes, bucket placement, duplicate chains and counts.
    pub fn verify(&self) -> Result<()> {
        let mut entries = 0;
        let mut heads = 0;
        for (index, &first) in self.buckets.iter().enumerate() {
            let mut head = first;
            while head != NIL {
                heads += 1;
                let head_node = self.nodes.get(head);
                let mut node = head;
                while node != NIL {
                    let entry = self.nodes.get(node);
                    let hash = self.hasher.hash_one(&entry.key);
                    if hash != entry.hash {
                        return Err(invariant(format!("node {} has a stale hash", node)));
                    }
                    if self.bucket_of(hash) != index {
                        return Err(invariant(format!("node {} sits in the wrong bucket", node)));
                    }
                    if node != head {
                        if entry.key != head_node.key {
                            return Err(invariant(format!("node {} chained under a different key", node)));
                        }
                        if entry.next != NIL {
                            return Err(invariant(format!("duplicate {} links into the bucket", node)));
                        }
                    }
                    entries += 1;
                    node = U::dup(&entry.dup);
                }
                let mut other = head_node.next;
                while other != NIL {
                    if self.nodes.get(other).key == head_node.key {
                        return Err(invariant(format!("key of node {} heads two chains", head)));
                    }
                    other = self.nodes.get(other).next;
                }
                head = head_node.next;
            }
        }
        if entries != self.len() {
            return Err(invariant(format!(
                "found {} nodes by walking all buckets, but expected {}",
                entries,
                self.len()
            )));
        }
        if heads != self.unique_count {
            return Err(invariant(format!(
                "found {} distinct keys, but expected {}",
                heads, self.unique_count
            )));
        }
        Ok(())
    }

    #[inline]
    fn cursor(&self, node: u32) -> HashCursor<'_, K, V, U, S> {
        HashCursor { table: self, node }
    }

    #[inline]
    fn bucket_of(&self, hash: u64) -> usize {
        (hash % self.buckets.len() as u64) as usize
    }

    fn find_head(&self, hash: u64, key: &K) -> u32 {
        let mut node = self.buckets[self.bucket_of(hash)];
        while node != NIL {
            let entry = self.nodes.get(node);
            if entry.hash == hash && entry.key == *key {
                return node;
            }
            node = entry.next;
        }
        NIL
    }

    fn find_exact_node(&self, hash: u64, key: &K, value: &V) -> u32
    where
        V: PartialEq,
    {
        let mut node = self.find_head(hash, key);
        while node != NIL {
            let entry = self.nodes.get(node);
            if entry.value == *value {
                return node;
            }
            node = U::dup(&entry.dup);
        }
        NIL
    }

    /// Finds the link pointing at `target` by walking the bucket for `hash`.
    /// Never dereferences `target` itself, which may already be gone.
    fn link_to(&self, target: u32, hash: u64) -> Option<Link> {
        let bucket = self.bucket_of(hash);
        let mut link = Link::Bucket(bucket);
        let mut head = self.buckets[bucket];
        while head != NIL {
            if head == target {
                return Some(link);
            }
            let head_node = self.nodes.get(head);
            if !U::UNIQUE {
                let mut prev = head;
                let mut dup = U::dup(&head_node.dup);
                while dup != NIL {
                    if dup == target {
                        return Some(Link::Dup(prev));
                    }
                    prev = dup;
                    dup = U::dup(&self.nodes.get(dup).dup);
                }
            }
            link = Link::Next(head);
            head = head_node.next;
        }
        None
    }

    fn set_link(&mut self, link: Link, to: u32) {
        match link {
            Link::Bucket(bucket) => self.buckets[bucket] = to,
            Link::Next(node) => self.nodes.get_mut(node).next = to,
            Link::Dup(node) => U::set_dup(&mut self.nodes.get_mut(node).dup, to),
        }
    }

    fn remove_node(&mut self, target: u32) -> (K, V) {
        let (hash, next, dup) = {
            let node = self.nodes.get(target);
            (node.hash, node.next, U::dup(&node.dup))
        };
        let link = match self.link_to(target, hash) {
            Some(link) => link,
            None => fatal(invariant(format!("hash node {} is not linked from its bucket", target))),
        };
        match link {
            Link::Dup(_) => self.set_link(link, dup),
            _ if dup == NIL => {
                self.set_link(link, next);
                self.unique_count -= 1;
            }
            _ => {
                // first duplicate takes over as the key's head
                self.nodes.get_mut(dup).next = next;
                self.set_link(link, dup);
            }
        }

        let (removed, moved_from) = self.nodes.swap_remove(target);
        if let Some(from) = moved_from {
            let moved_hash = self.nodes.get(target).hash;
            match self.link_to(from, moved_hash) {
                Some(link) => self.set_link(link, target),
                None => fatal(invariant(format!(
                    "relocated hash node {} is not linked from its bucket",
                    from
                ))),
            }
        }
        self.check_load_factor();
        (removed.key, removed.value)
    }

    fn check_load_factor(&mut self) {
        let load = self.unique_count * 100 / self.buckets.len();
        if load > MAX_LOAD_FACTOR && self.size_index + 1 < BUCKET_SIZES.len() {
            self.resize(self.size_index + 1);
        } else if load < MIN_LOAD_FACTOR && self.size_index > self.initial_size_index {
            self.resize(self.size_index - 1);
        }
    }

    fn resize(&mut self, size_index: usize) {
        let new_size = BUCKET_SIZES[size_index];
        trace!(
            from = self.buckets.len(),
            to = new_size,
            keys = self.unique_count,
            "Resizing hash table"
        );
        let old = mem::replace(&mut self.buckets, vec![NIL; new_size]);
        self.size_index = size_index;
        for mut head in old {
            while head != NIL {
                let (next, hash) = {
                    let node = self.nodes.get(head);
                    (node.next, node.hash)
                };
                let bucket = self.bucket_of(hash);
                self.nodes.get_mut(head).next = self.buckets[bucket];
                self.buckets[bucket] = head;
                head = next;
            }
        }
    }
}

impl<K: Hash + Eq, V, S: BuildHasher> CompactingHashTable<K, V, UniqueKeys, S> {
    pub fn erase(&mut self, key: &K) -> Option<V> {
        let hash = self.hasher.hash_one(key);
        let node = self.find_head(hash, key);
        if node == NIL {
            return None;
        }
        Some(self.remove_node(node).1)
    }
}

fn invariant(message: String) -> MemoryError {
    MemoryError::Invariant(message)
}

impl<K, V, U: Uniqueness, S> fmt::Debug for CompactingHashTable<K, V, U, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompactingHashTable")
            .field("len", &self.nodes.len())
            .field("unique_keys", &self.unique_count)
            .field("buckets", &self.buckets.len())
            .field("unique", &U::UNIQUE)
            .finish()
    }
}

/// Position in a [`CompactingHashTable`].
///
/// Unlike an ordered cursor, `move_next` only visits further entries for the
/// same key, then reaches the end.
pub struct HashCursor<'a, K, V, U: Uniqueness, S> {
    table: &'a CompactingHashTable<K, V, U, S>,
    node: u32,
}

impl<'a, K, V, U: Uniqueness, S> HashCursor<'a, K, V, U, S> {
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
        let node = self.table.nodes.get(self.node);
        Some((&node.key, &node.value))
    }

    pub fn move_next(&mut self) {
        if self.node != NIL {
            self.node = U::dup(&self.table.nodes.get(self.node).dup);
        }
    }

    /// Valid until the table is next modified.
    pub fn node_ref(&self) -> Option<NodeRef> {
        (self.node != NIL).then_some(NodeRef(self.node))
    }

    /// Remaining values for this key, starting at the cursor.
    pub fn values(mut self) -> impl Iterator<Item = &'a V> {
        std::iter::from_fn(move || {
            let value = self.value()?;
            self.move_next();
            Some(value)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::hash::{BuildHasherDefault, Hasher};

    /// Sends every key to the same bucket.
    #[derive(Default)]
    struct Collide;

    impl Hasher for Collide {
        fn finish(&self) -> u64 {
            7
        }

        fn write(&mut self, _: &[u8]) {}
    }

    fn small_map<K: Hash + Eq, V>() -> CompactingHashMap<K, V> {
        CompactingHashTable::with_options(1, 4, RandomState::new())
    }

    fn small_multi<K: Hash + Eq, V>() -> CompactingHashMultiMap<K, V> {
        CompactingHashTable::with_options(1, 4, RandomState::new())
    }

    #[test]
    fn test_unique_nodes_are_smaller() {
        assert!(
            mem::size_of::<HashNode<u16, u16, ()>>() < mem::size_of::<HashNode<u16, u16, u32>>()
        );
    }

    #[test]
    fn test_initial_size_rounds_up_to_the_table() {
        let table: CompactingHashMap<u32, u32> =
            CompactingHashTable::with_options(65536, 16, RandomState::new());
        assert_eq!(table.bucket_count(), 98317);
        let table: CompactingHashMap<u32, u32> = CompactingHashTable::with_options(1, 16, RandomState::new());
        assert_eq!(table.bucket_count(), 53);
    }

    #[test]
    fn test_unique_insert_find_erase() {
        let mut table = small_map();
        assert!(table.insert("a", 1));
        assert!(table.insert("b", 2));
        assert!(!table.insert("a", 3));
        assert_eq!(table.find(&"a").value(), Some(&1));
        assert_eq!(table.erase(&"a"), Some(1));
        assert_eq!(table.erase(&"a"), None);
        assert!(table.find(&"a").is_end());
        assert_eq!(table.len(), 1);
        table.verify().unwrap();
    }

    #[test]
    fn test_cursor_only_walks_duplicates() {
        let mut table = small_multi();
        table.insert(1, "x");
        table.insert(2, "other");
        table.insert(1, "y");
        table.insert(1, "z");

        let mut values: Vec<&str> = table.find(&1).values().copied().collect();
        values.sort_unstable();
        assert_eq!(values, vec!["x", "y", "z"]);
        assert_eq!(table.len(), 4);
        assert_eq!(table.unique_len(), 2);
        table.verify().unwrap();
    }

    #[test]
    fn test_erase_exact_promotes_next_duplicate() {
        let mut table = small_multi();
        table.insert(5, 'a');
        table.insert(5, 'b');
        table.insert(5, 'c');

        let head = *table.find(&5).value().unwrap();
        assert!(table.erase_exact(&5, &head));
        assert!(!table.erase_exact(&5, &head));
        assert_eq!(table.find(&5).values().count(), 2);
        assert_eq!(table.unique_len(), 1);
        table.verify().unwrap();

        assert!(table.find_exact(&5, &'q').is_end());
        for value in ['a', 'b', 'c'] {
            table.erase_exact(&5, &value);
        }
        assert!(table.is_empty());
        assert_eq!(table.unique_len(), 0);
        table.verify().unwrap();
    }

    #[test]
    fn test_relocation_keeps_colliding_chains_intact() {
        let mut table: CompactingHashMultiMap<u32, u32, BuildHasherDefault<Collide>> =
            CompactingHashTable::with_options(1, 3, BuildHasherDefault::default());
        for key in 0..6 {
            table.insert(key, key);
            table.insert(key, key + 100);
        }
        table.verify().unwrap();

        // erase from the front so that the tail node keeps moving
        for key in 0..3 {
            assert!(table.erase_exact(&key, &key));
            table.verify().unwrap();
        }
        for key in 0..6 {
            let mut values: Vec<u32> = table.find(&key).values().copied().collect();
            values.sort_unstable();
            let expected: Vec<u32> = if key < 3 { vec![key + 100] } else { vec![key, key + 100] };
            assert_eq!(values, expected);
        }
    }

    #[test]
    fn test_erase_at_cursor() {
        let mut table = small_map();
        for key in 0..10u32 {
            table.insert(key, key * 2);
        }
        let at = table.find(&4).node_ref().unwrap();
        assert_eq!(table.set_value_at(at, 99), 8);
        let at = table.find(&4).node_ref().unwrap();
        assert_eq!(table.erase_at(at), (4, 99));
        assert!(!table.contains_key(&4));
        table.verify().unwrap();
    }

    #[test]
    fn test_grows_and_shrinks_back_to_initial_size() {
        let mut table = small_map();
        for key in 0..1000u32 {
            table.insert(key, key);
        }
        assert!(table.bucket_count() > 1000);
        assert!(table.unique_len() * 100 / table.bucket_count() <= MAX_LOAD_FACTOR);
        table.verify().unwrap();

        for key in 0..1000u32 {
            assert_eq!(table.erase(&key), Some(key));
        }
        assert_eq!(table.bucket_count(), 53);
        assert_eq!(table.nodes.bytes_allocated(), 0);
        table.verify().unwrap();
    }

    #[test]
    fn test_matches_std_hash_map() {
        let mut table = small_map();
        let mut reference = HashMap::new();
        let mut state = 0x2545f491u64;
        for _ in 0..5000 {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let key = (state % 300) as u32;
            if state % 3 == 0 {
                assert_eq!(table.erase(&key), reference.remove(&key));
            } else {
                assert_eq!(table.insert(key, state), !reference.contains_key(&key));
                reference.entry(key).or_insert(state);
            }
        }
        assert_eq!(table.len(), reference.len());
        for (key, value) in &reference {
            assert_eq!(table.find(key).value(), Some(value));
        }
        table.verify().unwrap();
    }
}
