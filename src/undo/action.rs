//! Undo/release action contracts

/// Which half of an action must run under the replicated-memory barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Synchronization {
    UndoAndRelease,
    UndoOnly,
    ReleaseOnly,
}

/// One reversible step of a transaction.
///
/// `undo` rolls the step back; `release` runs once the transaction can no
/// longer be rolled back. Exactly one of the two is invoked.
pub trait UndoReleaseAction: Send {
    fn undo(&mut self);

    fn release(&mut self);

    /// Halves of this action that touch replicated state.
    fn synchronization(&self) -> Synchronization {
        Synchronization::UndoAndRelease
    }
}

/// Observer notified once a quantum it registered with is released.
pub trait UndoQuantumReleaseInterest: Send + Sync {
    fn notify_quantum_release(&self);

    /// Runs after every interest of the release window was notified.
    fn finalize_release(&self) {}
}

/// Boxed closures as actions, mainly for tests and small callers.
pub struct FnUndoAction<U, R>
where
    U: FnMut() + Send,
    R: FnMut() + Send,
{
    on_undo: U,
    on_release: R,
    synchronization: Synchronization,
}

impl<U, R> FnUndoAction<U, R>
where
    U: FnMut() + Send,
    R: FnMut() + Send,
{
    pub fn new(on_undo: U, on_release: R) -> Self {
        Self {
            on_undo,
            on_release,
            synchronization: Synchronization::UndoAndRelease,
        }
    }

    pub fn with_synchronization(mut self, synchronization: Synchronization) -> Self {
        self.synchronization = synchronization;
        self
    }
}

impl<U, R> UndoReleaseAction for FnUndoAction<U, R>
where
    U: FnMut() + Send,
    R: FnMut() + Send,
{
    fn undo(&mut self) {
        (self.on_undo)()
    }

    fn release(&mut self) {
        (self.on_release)()
    }

    fn synchronization(&self) -> Synchronization {
        self.synchronization
    }
}
