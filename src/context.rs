//! A dynamic, thread-safe, type-and-name-keyed value store with ownership
//! semantics and hierarchical fallback to a parent.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use compact_str::CompactString;
use parking_lot::RwLock;

use crate::type_key::{self, TypeInfo, TypeKey};
use crate::weak::{WeakPtr, WeakScope};

type AnyValue = dyn Any + Send + Sync;

struct BorrowedRef(*const AnyValue);
// SAFETY: a `BorrowedRef` is only ever constructed through
// `Context::install_borrowed`, whose caller guarantees the pointee outlives
// every Context reference to it.
unsafe impl Send for BorrowedRef {}
unsafe impl Sync for BorrowedRef {}

enum Storage {
    Owned(Box<AnyValue>),
    Borrowed(BorrowedRef),
}

impl Storage {
    fn as_any(&self) -> &AnyValue {
        match self {
            Storage::Owned(v) => v.as_ref(),
            // SAFETY: see `BorrowedRef`'s safety comment.
            Storage::Borrowed(r) => unsafe { &*r.0 },
        }
    }

    fn is_owned(&self) -> bool {
        matches!(self, Storage::Owned(_))
    }
}

struct Entry {
    type_info: &'static TypeInfo,
    name: Option<CompactString>,
    storage: Storage,
}

type EntryKey = (Option<CompactString>, TypeKey);

/// Opaque internal storage behind a [`Context`]. Exposed only so a
/// [`WeakPtr`]/[`WeakScope`] over it can appear in `Context`'s public parent
/// API; it has no public fields or methods.
#[derive(Default)]
pub struct Inner {
    entries: HashMap<EntryKey, Entry>,
    names: HashMap<CompactString, TypeKey>,
    parent: Option<WeakPtr<RwLock<Inner>>>,
}

impl Inner {
    fn remove(&mut self, name: Option<&str>, type_key: TypeKey) -> Option<Entry> {
        let key = (name.map(CompactString::new), type_key);
        let removed = self.entries.remove(&key);
        if let (Some(name), Some(entry)) = (key.0.as_ref(), &removed) {
            if self.names.get(name) == Some(&entry.type_info.type_key()) {
                self.names.remove(name);
            }
        }
        removed
    }

    fn insert(&mut self, name: Option<&str>, entry: Entry) -> Option<Entry> {
        if let Some(name) = name {
            self.names.insert(CompactString::new(name), entry.type_info.type_key());
        }
        let key = (name.map(CompactString::new), entry.type_info.type_key());
        self.entries.insert(key, entry)
    }
}

/// A dynamic key-value store keyed by `(optional name, TypeKey)`.
///
/// `Context` is not `Clone` — it owns its entries. A [`WeakPtr`] to another
/// `Context`'s internals can be installed as a parent via [`Context::set_parent`];
/// lookups that miss locally fall through to the parent, while writes always
/// stay local.
pub struct Context {
    inner: Arc<RwLock<Inner>>,
    scope: WeakScope<RwLock<Inner>>,
}

impl Context {
    pub fn new() -> Self {
        let inner = Arc::new(RwLock::new(Inner::default()));
        // SAFETY: `scope` only ever observes `inner`'s heap allocation,
        // which stays put for the life of this `Arc` clone; `Drop` below
        // invalidates the scope before `inner` is released.
        let scope = unsafe { WeakScope::new(&*inner) };
        Self { inner, scope }
    }

    /// A weak observer of this context's internals, suitable for use as
    /// another context's parent.
    pub fn weak_ptr(&self) -> WeakPtr<RwLock<Inner>> {
        self.scope.ptr()
    }

    pub fn set_parent(&self, parent: WeakPtr<RwLock<Inner>>) {
        self.inner.write().parent = Some(parent);
    }

    pub fn clear_parent(&self) {
        self.inner.write().parent = None;
    }

    /// Applies `f` to this context's `Inner`, falling through to the parent
    /// chain on a miss — and the parent's parent, and so on — until `f`
    /// returns `Some` or the chain runs out. Holds only one read lock at a
    /// time, so this never deadlocks against a concurrent write elsewhere in
    /// the chain.
    fn with_locked_parent<R>(&self, mut f: impl FnMut(&Inner) -> Option<R>) -> Option<R> {
        let mut next_parent = {
            let inner = self.inner.read();
            if let Some(result) = f(&inner) {
                return Some(result);
            }
            inner.parent.clone()
        };
        while let Some(parent) = next_parent {
            let locked = parent.lock()?;
            let parent_inner = locked.read();
            if let Some(result) = f(&parent_inner) {
                return Some(result);
            }
            next_parent = parent_inner.parent.clone();
        }
        None
    }

    /// Installs `value`, taking ownership, replacing any prior entry under
    /// the same `(name, TypeKey)`. The prior owned entry, if any, is
    /// dropped after the write lock is released.
    pub fn install_new<T: Any + Send + Sync>(&self, name: Option<&str>, value: T) {
        let entry = Entry {
            type_info: type_key::type_info::<T>(),
            name: name.map(CompactString::new),
            storage: Storage::Owned(Box::new(value)),
        };
        let replaced = self.inner.write().insert(name, entry);
        drop(replaced); // destructor runs outside the lock
    }

    /// Installs an already-owned `value`. Semantically identical to
    /// [`Context::install_new`] in this implementation: Rust's strict
    /// ownership means there is no observable difference between
    /// "transition ownership without destruction" and "destroy the old,
    /// construct the new" once the new value has replaced the old one.
    pub fn install_owned<T: Any + Send + Sync>(&self, name: Option<&str>, value: T) {
        self.install_new(name, value);
    }

    /// Installs a non-owned reference. The Context will never destroy it.
    ///
    /// # Safety
    /// The caller guarantees `value` outlives every use of this Context
    /// (or, conservatively, outlives the Context itself).
    pub unsafe fn install_borrowed<T: Any + Send + Sync>(&self, name: Option<&str>, value: &T) {
        let erased: &AnyValue = value;
        let entry = Entry {
            type_info: type_key::type_info::<T>(),
            name: name.map(CompactString::new),
            storage: Storage::Borrowed(BorrowedRef(erased as *const AnyValue)),
        };
        let replaced = self.inner.write().insert(name, entry);
        drop(replaced);
    }

    /// If a compatible owned entry already exists at `(name, TypeKey::<T>)`,
    /// assigns onto it in place; otherwise constructs a fresh owned entry.
    pub fn install_value<T: Any + Send + Sync>(&self, name: Option<&str>, value: T) {
        let type_key = type_key::type_key::<T>();
        let mut inner = self.inner.write();
        let key = (name.map(CompactString::new), type_key);
        if let Some(entry) = inner.entries.get_mut(&key) {
            if entry.storage.is_owned() {
                if let Storage::Owned(boxed) = &mut entry.storage {
                    if let Some(slot) = boxed.downcast_mut::<T>() {
                        *slot = value;
                        return;
                    }
                }
            }
        }
        drop(inner);
        self.install_new(name, value);
    }

    /// Installs a type-erased value only if `info`'s `TypeKey` matches
    /// `expected`; otherwise clears whatever is at that slot. Used by
    /// [`crate::contract`] to plug in dynamically cloned constraint
    /// defaults.
    pub(crate) fn install_erased(
        &self,
        name: Option<&str>,
        expected: TypeKey,
        info: &'static TypeInfo,
        value: Box<AnyValue>,
    ) {
        if info.type_key() != expected {
            let removed = self.inner.write().remove(name, expected);
            drop(removed);
            return;
        }
        let entry = Entry {
            type_info: info,
            name: name.map(CompactString::new),
            storage: Storage::Owned(value),
        };
        let replaced = self.inner.write().insert(name, entry);
        drop(replaced);
    }

    /// Applies `f` to the value at `(name, TypeKey::<T>)`, falling through
    /// to the parent chain on a local miss. Holds only one read lock at a
    /// time, so this never deadlocks against a concurrent write elsewhere
    /// in the chain.
    pub fn with_value<T: Any + Send + Sync, R>(
        &self,
        name: Option<&str>,
        f: impl FnOnce(&T) -> R,
    ) -> Option<R> {
        let type_key = type_key::type_key::<T>();
        let mut f = Some(f);
        self.with_locked_parent(|inner| {
            let key = (name.map(CompactString::new), type_key);
            let entry = inner.entries.get(&key)?;
            let value = entry.storage.as_any().downcast_ref::<T>()?;
            Some((f.take().unwrap())(value))
        })
    }

    pub fn get_value<T: Any + Clone + Send + Sync>(&self, name: Option<&str>) -> Option<T> {
        self.with_value(name, |v: &T| v.clone())
    }

    pub fn get_or_default<T: Any + Clone + Send + Sync>(&self, name: Option<&str>, default: T) -> T {
        self.get_value(name).unwrap_or(default)
    }

    pub fn exists<T: Any + Send + Sync>(&self, name: Option<&str>) -> bool {
        self.with_value(name, |_: &T| ()).is_some()
    }

    pub fn exists_any(&self, name: Option<&str>, type_key: TypeKey) -> bool {
        self.with_locked_parent(|inner| {
            inner.entries.contains_key(&(name.map(CompactString::new), type_key)).then_some(())
        })
        .is_some()
    }

    pub fn name_exists(&self, name: &str) -> bool {
        self.with_locked_parent(|inner| inner.names.contains_key(name).then_some(()))
            .is_some()
    }

    /// Removes and returns the owned value at `(name, TypeKey::<T>)`.
    /// Returns `None` if the slot is absent or holds a borrowed value.
    pub fn release<T: Any + Send + Sync>(&self, name: Option<&str>) -> Option<T> {
        let type_key = type_key::type_key::<T>();
        let entry = self.inner.write().remove(name, type_key)?;
        match entry.storage {
            Storage::Owned(boxed) => boxed.downcast::<T>().ok().map(|b| *b),
            Storage::Borrowed(_) => None,
        }
    }

    pub fn clear(&self, name: Option<&str>, type_key: TypeKey) {
        let removed = self.inner.write().remove(name, type_key);
        drop(removed);
    }

    pub fn clear_name(&self, name: &str) {
        let type_key = {
            let inner = self.inner.read();
            inner.names.get(name).copied()
        };
        if let Some(type_key) = type_key {
            self.clear(Some(name), type_key);
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.write();
        let drained: Vec<Entry> = inner.entries.drain().map(|(_, v)| v).collect();
        inner.names.clear();
        drop(inner);
        drop(drained); // destructors run outside the lock
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.scope.invalidate();
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_install_and_get() {
        let ctx = Context::new();
        ctx.install_new(Some("size"), 42i32);
        assert!(ctx.exists::<i32>(Some("size")));
        assert_eq!(ctx.get_value::<i32>(Some("size")), Some(42));

        ctx.install_new(Some("size"), "big".to_string());
        assert!(!ctx.exists::<i32>(Some("size")));
        assert_eq!(ctx.get_value::<String>(Some("size")), Some("big".to_string()));

        ctx.clear_name("size");
        assert!(!ctx.name_exists("size"));
    }

    #[test]
    fn parent_fallback_and_local_shadow() {
        let parent = Context::new();
        parent.install_new(Some("width"), 100i32);

        let child = Context::new();
        child.set_parent(parent.weak_ptr());

        assert_eq!(child.get_value::<i32>(Some("width")), Some(100));

        child.install_new(Some("width"), 7i32);
        assert_eq!(child.get_value::<i32>(Some("width")), Some(7));

        child.clear(Some("width"), type_key::type_key::<i32>());
        assert_eq!(child.get_value::<i32>(Some("width")), Some(100));
    }

    #[test]
    fn parent_fallback_walks_the_full_ancestor_chain() {
        let grandparent = Context::new();
        grandparent.install_new(Some("depth"), 100i32);

        let parent = Context::new();
        parent.set_parent(grandparent.weak_ptr());

        let child = Context::new();
        child.set_parent(parent.weak_ptr());

        assert_eq!(child.get_value::<i32>(Some("depth")), Some(100));
        assert!(child.exists::<i32>(Some("depth")));
        assert!(child.name_exists("depth"));
    }

    #[test]
    fn release_only_succeeds_for_owned_entries() {
        let ctx = Context::new();
        let value = 9i32;
        unsafe { ctx.install_borrowed(Some("n"), &value) };
        assert!(ctx.release::<i32>(Some("n")).is_none());

        ctx.install_new(Some("n"), 3i32);
        assert_eq!(ctx.release::<i32>(Some("n")), Some(3));
        assert!(!ctx.exists::<i32>(Some("n")));
    }

    #[test]
    fn install_value_assigns_in_place_when_compatible() {
        let ctx = Context::new();
        ctx.install_new::<i32>(None, 1);
        ctx.install_value::<i32>(None, 2);
        assert_eq!(ctx.get_value::<i32>(None), Some(2));
    }
}
