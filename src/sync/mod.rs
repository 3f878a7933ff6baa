//! Coordination between site threads for replicated memory

pub mod barrier;
mod context;
mod scoped;
mod thread_lock;

pub use barrier::{BarrierPhase, CountdownBarrier};
pub use context::{EngineLocals, ExecutorContext, SiteContext};
pub use scoped::{
    ConditionalExecuteOutsideMpMemory, ConditionalExecuteWithMpMemory,
    ConditionalSynchronizedExecuteWithMpMemory, ExecuteWithMpMemory, ScopedReplicatedResourceLock,
};
pub use thread_lock::{ReplicatedInterests, SynchronizedThreadLock};
