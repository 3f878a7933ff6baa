//! Execution contexts registered with the coordination lock

use crate::config::MemoryConfig;
use crate::error::{fatal, MemoryError};
use crate::memory::{PartitionId, PoolLocals};
use crate::undo::{UndoLog, UndoQuantum};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// What the coordination lock needs from a site's executor.
pub trait ExecutorContext: Send + Sync {
    fn partition_id(&self) -> PartitionId;

    /// Quantum of the transaction the site is currently running, if any.
    fn current_undo_quantum(&self) -> Option<Arc<UndoQuantum>>;
}

/// A memory context together with the executor that owns it.
#[derive(Clone)]
pub struct EngineLocals {
    pub locals: PoolLocals,
    pub context: Option<Arc<dyn ExecutorContext>>,
}

impl EngineLocals {
    pub fn new(locals: PoolLocals, context: Option<Arc<dyn ExecutorContext>>) -> Self {
        Self { locals, context }
    }

    /// Bundles the calling thread's current memory context with `context`.
    pub fn current(context: Arc<dyn ExecutorContext>) -> Self {
        let locals = PoolLocals::current().unwrap_or_else(|| fatal(MemoryError::NoThreadContext));
        Self::new(locals, Some(context))
    }

    pub fn partition_id(&self) -> PartitionId {
        self.locals.engine_partition_id()
    }
}

impl fmt::Debug for EngineLocals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineLocals")
            .field("locals", &self.locals)
            .field("has_context", &self.context.is_some())
            .finish()
    }
}

/// Minimal site executor: an undo log and the quantum of the running
/// transaction.
pub struct SiteContext {
    partition: PartitionId,
    undo_log: Mutex<UndoLog>,
    current: Mutex<Option<Arc<UndoQuantum>>>,
}

impl SiteContext {
    pub fn new(partition: PartitionId) -> Arc<Self> {
        Self::with_config(partition, &MemoryConfig::current())
    }

    pub fn with_config(partition: PartitionId, config: &MemoryConfig) -> Arc<Self> {
        Arc::new(Self {
            partition,
            undo_log: Mutex::new(UndoLog::from_config(config)),
            current: Mutex::new(None),
        })
    }

    pub fn begin_undo_quantum(&self, token: i64) -> Arc<UndoQuantum> {
        let quantum = self.undo_log.lock().generate_undo_quantum(token);
        *self.current.lock() = Some(Arc::clone(&quantum));
        quantum
    }

    /// Rolls back everything from `token` on.
    pub fn undo(&self, token: i64) {
        self.clear_current_at_or_after(token);
        self.undo_log.lock().undo(token);
    }

    /// Commits everything up to and including `token`.
    pub fn release(&self, token: i64) {
        self.clear_current_at_or_before(token);
        self.undo_log.lock().release(token);
    }

    fn clear_current_at_or_after(&self, token: i64) {
        let mut current = self.current.lock();
        if current.as_ref().map_or(false, |q| q.token() >= token) {
            *current = None;
        }
    }

    fn clear_current_at_or_before(&self, token: i64) {
        let mut current = self.current.lock();
        if current.as_ref().map_or(false, |q| q.token() <= token) {
            *current = None;
        }
    }

    pub fn pending_quanta(&self) -> usize {
        self.undo_log.lock().size()
    }
}

impl ExecutorContext for SiteContext {
    fn partition_id(&self) -> PartitionId {
        self.partition
    }

    fn current_undo_quantum(&self) -> Option<Arc<UndoQuantum>> {
        self.current.lock().clone()
    }
}

impl fmt::Debug for SiteContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SiteContext")
            .field("partition", &self.partition)
            .finish()
    }
}
