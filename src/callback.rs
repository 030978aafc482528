//! A move-only, nullable, type-erased callback and a scope that can
//! invalidate every callback it produced without invalidating the scope
//! itself mid-call.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// A move-only, nullable, type-erased invocable over a fixed signature
/// `Args -> Ret`. `Args` is typically a tuple for multi-argument
/// callbacks (e.g. `(EndpointId, TypeKey)`).
pub struct Callback<Args, Ret = ()> {
    inner: Option<Box<dyn FnMut(Args) -> Ret + Send>>,
}

impl<Args, Ret> Callback<Args, Ret> {
    /// Wraps any `FnMut` (function pointer, owned closure, or another
    /// `Callback`) into a `Callback`.
    pub fn new<F>(f: F) -> Self
    where
        F: FnMut(Args) -> Ret + Send + 'static,
    {
        Self {
            inner: Some(Box::new(f)),
        }
    }

    /// The null callback. Invoking it is a programmer error and panics,
    /// matching the source's assumption that a null callback is never
    /// called without first checking [`Callback::is_null`].
    pub fn null() -> Self {
        Self { inner: None }
    }

    pub fn is_null(&self) -> bool {
        self.inner.is_none()
    }

    pub fn call(&mut self, args: Args) -> Ret {
        self.inner
            .as_mut()
            .expect("Callback::call invoked on a null callback")
            .as_mut()(args)
    }
}

impl<Args, Ret> Default for Callback<Args, Ret> {
    fn default() -> Self {
        Self::null()
    }
}

impl<Args, Ret> From<fn(Args) -> Ret> for Callback<Args, Ret>
where
    Args: 'static,
    Ret: 'static,
{
    fn from(f: fn(Args) -> Ret) -> Self {
        Self::new(f)
    }
}

struct ScopeShared {
    alive: AtomicBool,
    in_flight: AtomicUsize,
    drain_lock: Mutex<()>,
    drained: Condvar,
}

impl ScopeShared {
    fn release(&self) {
        let guard = self.drain_lock.lock();
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_all();
        }
        drop(guard);
    }
}

/// Wraps callbacks it produces with a shared liveness flag. After the
/// scope is dropped, invoking a callback it produced is a no-op that
/// returns `Ret::default()`. Dropping the scope blocks while any wrapped
/// callback it produced is executing, so a callback must never drop its
/// own scope.
pub struct CallbackScope {
    shared: Arc<ScopeShared>,
}

impl CallbackScope {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ScopeShared {
                alive: AtomicBool::new(true),
                in_flight: AtomicUsize::new(0),
                drain_lock: Mutex::new(()),
                drained: Condvar::new(),
            }),
        }
    }

    /// Wraps `callback` so it becomes a no-op once this scope is dropped.
    pub fn wrap<Args, Ret>(&self, mut callback: Callback<Args, Ret>) -> Callback<Args, Ret>
    where
        Args: 'static,
        Ret: Default + 'static,
    {
        let shared = Arc::clone(&self.shared);
        Callback::new(move |args| {
            shared.in_flight.fetch_add(1, Ordering::SeqCst);
            if !shared.alive.load(Ordering::SeqCst) {
                shared.release();
                return Ret::default();
            }
            let result = callback.call(args);
            shared.release();
            result
        })
    }
}

impl Default for CallbackScope {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CallbackScope {
    fn drop(&mut self) {
        self.shared.alive.store(false, Ordering::SeqCst);
        let mut guard = self.shared.drain_lock.lock();
        while self.shared.in_flight.load(Ordering::SeqCst) > 0 {
            self.shared.drained.wait(&mut guard);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn null_callback_reports_null() {
        let cb: Callback<(i32,), i32> = Callback::null();
        assert!(cb.is_null());
    }

    #[test]
    fn callback_invokes_wrapped_closure() {
        let mut cb = Callback::new(|(a, b): (i32, i32)| a + b);
        assert_eq!(cb.call((2, 3)), 5);
    }

    #[test]
    fn scoped_callback_runs_while_scope_alive() {
        let scope = CallbackScope::new();
        let counter = Arc::new(AtomicU32::new(0));
        let counter2 = Arc::clone(&counter);
        let mut wrapped = scope.wrap(Callback::new(move |()| {
            counter2.fetch_add(1, Ordering::SeqCst);
        }));
        wrapped.call(());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn scoped_callback_is_noop_after_scope_dropped() {
        let scope = CallbackScope::new();
        let mut wrapped = scope.wrap(Callback::new(|()| 99u32));
        drop(scope);
        assert_eq!(wrapped.call(()), 0);
    }
}
