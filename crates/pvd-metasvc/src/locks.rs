//! Lock primitives with scoped-guard release.
//!
//! The NP lock serializes whole non-paged mutating sequences; stripe locks
//! are range-scoped over the paged region and exclude only overlapping
//! ranges. Both release on drop, so every exit path — success or error —
//! releases the lock without a manually chained completion step.

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::service::PagedSpan;

/// Mutual exclusion for non-paged record read-modify-write sequences.
#[derive(Debug, Default)]
pub struct NpLock {
    inner: Mutex<()>,
}

impl NpLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock; released when the guard drops.
    pub fn acquire(&self) -> NpLockGuard<'_> {
        NpLockGuard {
            _guard: self.inner.lock(),
        }
    }
}

/// Guard for [`NpLock`]; dropping releases the lock.
pub struct NpLockGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

/// Range-scoped locks over the paged metadata region.
///
/// Overlapping spans exclude each other; disjoint spans proceed
/// concurrently.
#[derive(Debug, Default)]
pub struct StripeLockTable {
    held: Mutex<Vec<PagedSpan>>,
    released: Condvar,
}

impl StripeLockTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a lock over `span`, waiting while any held span overlaps it.
    pub fn acquire(&self, span: PagedSpan) -> StripeLockGuard<'_> {
        let mut held = self.held.lock();
        while held.iter().any(|existing| existing.overlaps(&span)) {
            self.released.wait(&mut held);
        }
        held.push(span);
        StripeLockGuard { table: self, span }
    }

    fn release(&self, span: PagedSpan) {
        let mut held = self.held.lock();
        if let Some(position) = held.iter().position(|existing| *existing == span) {
            held.swap_remove(position);
        }
        drop(held);
        self.released.notify_all();
    }

    /// Number of currently held spans (diagnostic).
    #[must_use]
    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }
}

/// Guard for one locked span; dropping releases it.
pub struct StripeLockGuard<'a> {
    table: &'a StripeLockTable,
    span: PagedSpan,
}

impl StripeLockGuard<'_> {
    /// The locked span.
    #[must_use]
    pub const fn span(&self) -> PagedSpan {
        self.span
    }
}

impl Drop for StripeLockGuard<'_> {
    fn drop(&mut self) {
        self.table.release(self.span);
    }
}
