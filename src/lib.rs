// PhotonDB - partition memory core
// Compacting allocators, compacting indexes and replicated-memory coordination

#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod memory;
pub mod structures;
pub mod sync;
pub mod telemetry;
pub mod undo;

// Re-exports for convenience
pub use config::MemoryConfig;
pub use error::{MemoryError, Result};
pub use memory::{PartitionId, PoolLocals, Relocatable, ThreadLocalPool};
pub use structures::{CompactingHashMap, CompactingHashMultiMap, CompactingMap, RankedCompactingMap};
pub use sync::{EngineLocals, ExecutorContext, SiteContext, SynchronizedThreadLock};
pub use undo::{UndoLog, UndoQuantum, UndoReleaseAction};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
