//! Transaction undo log and its replicated-table variants

mod action;
mod log;
mod quantum;
mod synchronized;

pub use action::{FnUndoAction, Synchronization, UndoQuantumReleaseInterest, UndoReleaseAction};
pub use log::UndoLog;
pub use quantum::{UndoDataPool, UndoQuantum};
pub use synchronized::{SynchronizedDummyUndoReleaseAction, SynchronizedUndoReleaseAction};
