//! Process-unique runtime identity for Rust types, plus an optional
//! destroy/clone vtable ([`TypeInfo`]) over type-erased storage.
//!
//! A [`TypeKey`] is obtained from [`type_key`] for any `T: 'static` and is
//! stable for the lifetime of the process: two calls to `type_key::<T>()`
//! for the same `T` always return a key that compares equal. The key also
//! carries a mutable display name (last writer wins, readers never observe
//! a torn value) and, once the type's capabilities are known, a pointer to
//! its [`TypeInfo`].

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use compact_str::CompactString;
use parking_lot::RwLock;

struct TypeRecord {
    ordinal: u64,
    name: RwLock<CompactString>,
    info: OnceLock<TypeInfo>,
}

fn next_ordinal() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

fn by_type_id() -> &'static Mutex<HashMap<TypeId, &'static TypeRecord>> {
    static REGISTRY: OnceLock<Mutex<HashMap<TypeId, &'static TypeRecord>>> = OnceLock::new();
    REGISTRY.get_or_init(Default::default)
}

fn by_name() -> &'static Mutex<HashMap<CompactString, &'static TypeRecord>> {
    static REGISTRY: OnceLock<Mutex<HashMap<CompactString, &'static TypeRecord>>> = OnceLock::new();
    REGISTRY.get_or_init(Default::default)
}

/// A stable, process-unique identity for a Rust type.
///
/// `TypeKey` is `Copy`; every handle derived from the same underlying type
/// compares equal and hashes identically, regardless of when it was
/// obtained.
#[derive(Clone, Copy)]
pub struct TypeKey(&'static TypeRecord);

impl TypeKey {
    /// A small integer unique to this type within the process. Stable for
    /// the life of the process, not across runs.
    pub fn ordinal(&self) -> u64 {
        self.0.ordinal
    }

    /// Returns the current display name.
    pub fn name(&self) -> CompactString {
        self.0.name.read().clone()
    }

    /// Sets the display name. Safe to call concurrently from multiple
    /// threads; the last writer wins and readers never see a torn string.
    pub fn set_name(&self, name: impl Into<CompactString>) {
        *self.0.name.write() = name.into();
    }

    /// Returns the type's [`TypeInfo`] if it has been registered with full
    /// capability information (destroy/clone). Returns `None` for a
    /// forward-declared, name-only key that has never been backed by a
    /// concrete Rust type — the Rust analogue of the original's
    /// placeholder `TypeInfo` that refuses to destroy or clone.
    pub fn type_info(&self) -> Option<&'static TypeInfo> {
        self.0.info.get()
    }

    /// Declares a name-only key with no backing Rust type and no
    /// `TypeInfo`. Used for name-only probes (a [`crate::contract::Constraint`]
    /// that matches any type under a given name). Calling this twice with
    /// the same name returns the same key.
    pub fn placeholder(name: &str) -> TypeKey {
        let mut table = by_name().lock().unwrap();
        if let Some(record) = table.get(name) {
            return TypeKey(record);
        }
        let record: &'static TypeRecord = Box::leak(Box::new(TypeRecord {
            ordinal: next_ordinal(),
            name: RwLock::new(CompactString::new(name)),
            info: OnceLock::new(),
        }));
        table.insert(CompactString::new(name), record);
        TypeKey(record)
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.0, other.0)
    }
}
impl Eq for TypeKey {}

impl Hash for TypeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.0 as *const TypeRecord as usize).hash(state)
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeKey")
            .field("ordinal", &self.0.ordinal)
            .field("name", &self.name())
            .finish()
    }
}

/// Capability bits and destroy/clone operations for a type, stored behind
/// its [`TypeKey`]. Obtained once per type via [`type_key`]/[`type_info`]
/// and cached for the life of the process.
pub struct TypeInfo {
    type_key: TypeKey,
    can_destroy: bool,
    can_clone: bool,
    clone_fn: Option<fn(&(dyn Any + Send + Sync)) -> Box<dyn Any + Send + Sync>>,
}

impl TypeInfo {
    pub fn type_key(&self) -> TypeKey {
        self.type_key
    }

    pub fn can_destroy(&self) -> bool {
        self.can_destroy
    }

    pub fn can_clone(&self) -> bool {
        self.can_clone
    }

    /// Clones a type-erased value known to be of this `TypeInfo`'s type.
    /// Returns `None` if the type is not cloneable (mirrors the source's
    /// "reject messages of non-cloneable types" dispatch rule, and the
    /// placeholder's refusal to clone).
    pub fn clone_erased(&self, value: &(dyn Any + Send + Sync)) -> Option<Box<dyn Any + Send + Sync>> {
        self.clone_fn.map(|f| f(value))
    }
}

fn record_for<T: Any + Send + Sync>() -> &'static TypeRecord {
    let type_id = TypeId::of::<T>();
    let mut table = by_type_id().lock().unwrap();
    *table.entry(type_id).or_insert_with(|| {
        Box::leak(Box::new(TypeRecord {
            ordinal: next_ordinal(),
            name: RwLock::new(CompactString::new(std::any::type_name::<T>())),
            info: OnceLock::new(),
        }))
    })
}

/// Returns the stable [`TypeKey`] for `T`, interning it on first use. Does
/// not by itself populate [`TypeInfo`] — pair with [`type_info::<T>()`] (or
/// [`type_info_cloneable::<T>()`]) wherever destroy/clone capability is
/// needed, e.g. when declaring a [`crate::contract::Constraint`] default.
pub fn type_key<T: Any + Send + Sync>() -> TypeKey {
    TypeKey(record_for::<T>())
}

/// Returns `T`'s [`TypeInfo`], registering a non-cloneable record on first
/// use (can_destroy is always true for any owned Rust value; can_clone is
/// false).
pub fn type_info<T: Any + Send + Sync>() -> &'static TypeInfo {
    let record = record_for::<T>();
    record.info.get_or_init(|| TypeInfo {
        type_key: TypeKey(record),
        can_destroy: true,
        can_clone: false,
        clone_fn: None,
    })
}

/// Returns `T`'s [`TypeInfo`] with clone capability registered. Once a type
/// has been registered cloneable it stays cloneable; calling
/// [`type_info::<T>()`] afterwards returns the same cloneable record.
pub fn type_info_cloneable<T: Any + Clone + Send + Sync>() -> &'static TypeInfo {
    let record = record_for::<T>();
    record.info.get_or_init(|| TypeInfo {
        type_key: TypeKey(record),
        can_destroy: true,
        can_clone: true,
        clone_fn: Some(|value| {
            let value = value
                .downcast_ref::<T>()
                .expect("clone_fn invoked with mismatched concrete type");
            Box::new(value.clone())
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_type_yields_equal_keys() {
        assert_eq!(type_key::<u32>(), type_key::<u32>());
        assert_ne!(type_key::<u32>(), type_key::<i64>());
    }

    #[test]
    fn display_name_last_writer_wins() {
        let key = type_key::<String>();
        key.set_name("alpha");
        key.set_name("beta");
        assert_eq!(key.name(), "beta");
    }

    #[test]
    fn placeholder_has_no_type_info() {
        let key = TypeKey::placeholder("width");
        assert!(key.type_info().is_none());
        assert_eq!(key, TypeKey::placeholder("width"));
    }

    #[test]
    fn non_cloneable_type_info_refuses_clone() {
        struct NotClone(#[allow(dead_code)] u8);
        let info = type_info::<NotClone>();
        assert!(!info.can_clone());
        let boxed: Box<dyn Any + Send + Sync> = Box::new(NotClone(1));
        assert!(info.clone_erased(boxed.as_ref()).is_none());
    }

    #[test]
    fn cloneable_type_info_clones() {
        let info = type_info_cloneable::<u32>();
        let boxed: Box<dyn Any + Send + Sync> = Box::new(7u32);
        let cloned = info.clone_erased(boxed.as_ref()).unwrap();
        assert_eq!(*cloned.downcast::<u32>().unwrap(), 7);
    }
}
