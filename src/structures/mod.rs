//! Compacting index containers
//!
//! Both containers keep their nodes in a private
//! [`NodeArena`](crate::memory::contiguous::NodeArena) and compact on every
//! erase, so positions handed out as [`NodeRef`] are only good until the
//! next mutation.

pub mod compacting_hash_table;
pub mod compacting_map;

pub use compacting_hash_table::{
    CompactingHashMap, CompactingHashMultiMap, CompactingHashTable, DuplicateKeys, HashCursor,
    UniqueKeys, Uniqueness,
};
pub use compacting_map::{
    CompactingMap, Cursor, FnComparator, Iter, KeyComparator, NaturalOrder, RankedCompactingMap,
};

/// Node position inside a container, taken from a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRef(pub(crate) u32);
