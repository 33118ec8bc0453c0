//! The read/write lock adapter.
//!
//! Every piece of synchronization in the crate — the global registry lock
//! and the per-descriptor locks — is obtained from a [`LockProvider`]. The
//! default provider, [`SingleThread`], never creates a lock, which keeps
//! single-threaded hosts free of locking overhead; [`Concurrent`] backs
//! every lock with a raw `parking_lot` rwlock. A `None` handle from
//! [`LockProvider::create_lock`] means "no locking": every enter/leave on it
//! is a no-op.

use parking_lot::lock_api::RawRwLock as _;

/// Factory for the read/write locks that guard the type registry and each
/// descriptor.
pub trait LockProvider {
    /// The lock handle type. Dropping a handle closes the lock.
    type Lock;

    /// Creates a new lock, or `None` for "no locking".
    fn create_lock(&self) -> Option<Self::Lock>;

    /// Acquires `lock` for shared access.
    fn enter_read(&self, lock: &Self::Lock);

    /// Releases a shared acquisition of `lock`.
    fn leave_read(&self, lock: &Self::Lock);

    /// Acquires `lock` for exclusive access.
    fn enter_write(&self, lock: &Self::Lock);

    /// Releases an exclusive acquisition of `lock`.
    fn leave_write(&self, lock: &Self::Lock);
}

/// Marker for providers whose locks actually exclude concurrent access.
///
/// # Safety
///
/// Implementations must guarantee that on a lock created by
/// [`LockProvider::create_lock`], `enter_write` excludes every other reader
/// and writer of the same lock and `enter_read` excludes writers, with
/// acquire/release ordering across the enter/leave pairs. The `Sync`
/// implementation of [`TypeSystem`] relies on this to share descriptor state
/// between threads.
///
/// [`TypeSystem`]: crate::TypeSystem
pub unsafe trait ConcurrentLockProvider: LockProvider {}

/// The default provider: no locks are ever created.
///
/// A [`TypeSystem`] built on this provider is confined to one thread (it is
/// not `Sync`), which is what makes the missing locks sound.
///
/// [`TypeSystem`]: crate::TypeSystem
#[derive(Clone, Copy, Debug, Default)]
pub struct SingleThread;

impl LockProvider for SingleThread {
    type Lock = ();

    fn create_lock(&self) -> Option<()> {
        None
    }

    fn enter_read(&self, _lock: &()) {}
    fn leave_read(&self, _lock: &()) {}
    fn enter_write(&self, _lock: &()) {}
    fn leave_write(&self, _lock: &()) {}
}

/// A provider backed by raw `parking_lot` rwlocks.
#[derive(Clone, Copy, Debug, Default)]
pub struct Concurrent;

impl LockProvider for Concurrent {
    type Lock = parking_lot::RawRwLock;

    fn create_lock(&self) -> Option<Self::Lock> {
        Some(<parking_lot::RawRwLock as parking_lot::lock_api::RawRwLock>::INIT)
    }

    fn enter_read(&self, lock: &Self::Lock) {
        lock.lock_shared();
    }

    fn leave_read(&self, lock: &Self::Lock) {
        // The scoped guards below pair every leave with a prior enter.
        unsafe { lock.unlock_shared() }
    }

    fn enter_write(&self, lock: &Self::Lock) {
        lock.lock_exclusive();
    }

    fn leave_write(&self, lock: &Self::Lock) {
        unsafe { lock.unlock_exclusive() }
    }
}

unsafe impl ConcurrentLockProvider for Concurrent {}

/// Scoped shared acquisition. Releases on drop, unwinding included.
pub(crate) struct ScopedRead<'a, L: LockProvider> {
    provider: &'a L,
    lock: Option<&'a L::Lock>,
}

impl<'a, L: LockProvider> ScopedRead<'a, L> {
    pub(crate) fn new(provider: &'a L, lock: Option<&'a L::Lock>) -> Self {
        if let Some(lock) = lock {
            provider.enter_read(lock);
        }
        ScopedRead { provider, lock }
    }
}

impl<L: LockProvider> Drop for ScopedRead<'_, L> {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            self.provider.leave_read(lock);
        }
    }
}

/// Scoped exclusive acquisition. Releases on drop, unwinding included.
pub(crate) struct ScopedWrite<'a, L: LockProvider> {
    provider: &'a L,
    lock: Option<&'a L::Lock>,
}

impl<'a, L: LockProvider> ScopedWrite<'a, L> {
    pub(crate) fn new(provider: &'a L, lock: Option<&'a L::Lock>) -> Self {
        if let Some(lock) = lock {
            provider.enter_write(lock);
        }
        ScopedWrite { provider, lock }
    }
}

impl<L: LockProvider> Drop for ScopedWrite<'_, L> {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            self.provider.leave_write(lock);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_handle_is_a_noop() {
        let provider = SingleThread;
        assert!(provider.create_lock().is_none());
        let _read = ScopedRead::<SingleThread>::new(&provider, None);
        let _write = ScopedWrite::<SingleThread>::new(&provider, None);
    }

    #[test]
    fn concurrent_guards_pair_enter_and_leave() {
        let provider = Concurrent;
        let lock = provider.create_lock().unwrap();
        {
            // Read locks nest.
            let _first = ScopedRead::new(&provider, Some(&lock));
            let _second = ScopedRead::new(&provider, Some(&lock));
        }
        {
            // Both readers released, so a writer can get in.
            let _write = ScopedWrite::new(&provider, Some(&lock));
        }
        let _read_again = ScopedRead::new(&provider, Some(&lock));
    }
}
