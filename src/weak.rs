//! A scope-controlled weak observer with a blocking drain on invalidation.
//!
//! [`WeakScope`] wraps a value whose address is exposed to observers without
//! giving them ownership. Any number of [`WeakPtr`] handles may be derived
//! from a scope; locking one yields a [`WeakLock`] guard while the target is
//! still alive, or `None` once the scope has started invalidating.
//! [`WeakScope::invalidate`] blocks until every outstanding [`WeakLock`] has
//! been dropped, so a destructor that invalidates first and then tears down
//! its fields never races a reader.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

struct Shared<T> {
    ptr: AtomicPtr<T>,
    cleared: AtomicBool,
    outstanding: AtomicUsize,
    drain_lock: Mutex<()>,
    drained: Condvar,
}

impl<T> Shared<T> {
    fn release(&self) {
        let guard = self.drain_lock.lock();
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_all();
        }
        drop(guard);
    }
}

/// Owns the target's address on behalf of its observers. The scope itself
/// is not `Clone`; observers hold a [`WeakPtr`] instead.
pub struct WeakScope<T> {
    shared: Arc<Shared<T>>,
}

impl<T> WeakScope<T> {
    /// Binds a scope to `owner`.
    ///
    /// # Safety
    /// The caller must guarantee `owner` stays at this address, and stays
    /// alive, until a matching call to [`WeakScope::invalidate`] completes.
    /// Typically `owner` is a field or base of the very struct whose
    /// destructor calls `invalidate()` before tearing down anything else
    /// (the aggregation pattern the [`crate::context::Context`] parent link
    /// and [`crate::message`] endpoint-to-system link both use).
    pub unsafe fn new(owner: &T) -> Self {
        Self {
            shared: Arc::new(Shared {
                ptr: AtomicPtr::new(owner as *const T as *mut T),
                cleared: AtomicBool::new(false),
                outstanding: AtomicUsize::new(0),
                drain_lock: Mutex::new(()),
                drained: Condvar::new(),
            }),
        }
    }

    /// Derives a new observer handle.
    pub fn ptr(&self) -> WeakPtr<T> {
        WeakPtr {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Marks the target unreachable and blocks until every outstanding
    /// [`WeakLock`] derived from this scope has been dropped.
    pub fn invalidate(&self) {
        self.shared.cleared.store(true, Ordering::SeqCst);
        self.shared.ptr.store(std::ptr::null_mut(), Ordering::SeqCst);
        let mut guard = self.shared.drain_lock.lock();
        while self.shared.outstanding.load(Ordering::SeqCst) > 0 {
            self.shared.drained.wait(&mut guard);
        }
    }
}

/// A cloneable observer handle that does not keep the target alive.
#[derive(Clone)]
pub struct WeakPtr<T> {
    shared: Arc<Shared<T>>,
}

impl<T> WeakPtr<T> {
    /// Attempts to lock the target. Returns `None` once the owning scope
    /// has invalidated (or started invalidating). Wait-free in the common
    /// case; only blocks [`WeakScope::invalidate`], never the other way
    /// around.
    pub fn lock(&self) -> Option<WeakLock<T>> {
        self.shared.outstanding.fetch_add(1, Ordering::SeqCst);
        let cleared = self.shared.cleared.load(Ordering::SeqCst);
        let ptr = if cleared {
            std::ptr::null_mut()
        } else {
            self.shared.ptr.load(Ordering::SeqCst)
        };
        if ptr.is_null() {
            self.shared.release();
            return None;
        }
        Some(WeakLock {
            shared: Arc::clone(&self.shared),
            ptr,
        })
    }
}

/// A guard that keeps the target's address live against concurrent
/// invalidation for as long as it is held.
pub struct WeakLock<T> {
    shared: Arc<Shared<T>>,
    ptr: *mut T,
}

// SAFETY: a `WeakLock<T>` only ever dereferences `ptr` while `outstanding`
// is nonzero, which blocks `invalidate()` from completing, so the pointee
// cannot be torn down while a lock is held. Send/Sync follow `T`'s.
unsafe impl<T: Sync> Send for WeakLock<T> {}
unsafe impl<T: Sync> Sync for WeakLock<T> {}

impl<T> Deref for WeakLock<T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: see the `unsafe impl Send/Sync` comment above.
        unsafe { &*self.ptr }
    }
}

impl<T> Drop for WeakLock<T> {
    fn drop(&mut self) {
        self.shared.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn lock_succeeds_before_invalidate() {
        let target = 42u32;
        let scope = unsafe { WeakScope::new(&target) };
        let weak = scope.ptr();
        let locked = weak.lock().expect("target still alive");
        assert_eq!(*locked, 42);
        drop(locked);
        scope.invalidate();
    }

    #[test]
    fn lock_fails_after_invalidate() {
        let target = 1u32;
        let scope = unsafe { WeakScope::new(&target) };
        let weak = scope.ptr();
        scope.invalidate();
        assert!(weak.lock().is_none());
    }

    #[test]
    fn invalidate_blocks_until_lock_dropped() {
        let target = 7u32;
        let scope = unsafe { WeakScope::new(&target) };
        let weak = scope.ptr();
        let locked = weak.lock().unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let invalidated = Arc::new(AtomicBool::new(false));

        thread::scope(|s| {
            let barrier2 = Arc::clone(&barrier);
            let invalidated2 = Arc::clone(&invalidated);
            s.spawn(|| {
                barrier2.wait();
                scope.invalidate();
                invalidated2.store(true, Ordering::SeqCst);
            });

            barrier.wait();
            thread::sleep(Duration::from_millis(50));
            assert!(!invalidated.load(Ordering::SeqCst), "invalidate returned early");
            drop(locked);
        });

        assert!(invalidated.load(Ordering::SeqCst));
    }
}
