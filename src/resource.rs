//! Reference-counted, type-indexed resource cache (§4.9). A manager is
//! registered once per `TypeKey` and supplies loader/release policy; loaded
//! resources are reached through [`ResourcePtr`], a strong reference whose
//! native `Arc` drop glue stands in for the source's manual refcounting
//! (see `DESIGN.md`).

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::type_key::{self, TypeKey};

/// Whether a resource's last strong reference dropping should trigger its
/// manager's release handler automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleasePolicy {
    Manual,
    AutoRelease,
}

/// Whether a resource is inserted into the system's visible cache as soon
/// as its first strong reference is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityPolicy {
    Manual,
    AutoVisible,
}

type Loader = Box<dyn Fn(&str) -> Option<Box<dyn Any + Send + Sync>> + Send + Sync>;
type ReleaseHandler = Arc<dyn Fn(&(dyn Any + Send + Sync)) + Send + Sync>;
type DependencyVisitor = Box<dyn Fn(&(dyn Any + Send + Sync), &mut dyn FnMut(TypeKey, u64)) + Send + Sync>;

struct Manager {
    loader: Option<Loader>,
    release: Option<ReleaseHandler>,
    dependencies: Option<DependencyVisitor>,
    registered: bool,
}

impl Default for Manager {
    fn default() -> Self {
        Self {
            loader: None,
            release: None,
            dependencies: None,
            registered: false,
        }
    }
}

struct RecordInner {
    type_key: TypeKey,
    id: u64,
    value: Box<dyn Any + Send + Sync>,
    release: ReleasePolicy,
}

struct Shared {
    managers: RwLock<HashMap<TypeKey, Manager>>,
    cache: RwLock<HashMap<(TypeKey, u64), Weak<RecordInner>>>,
    next_id: RwLock<u64>,
}

/// A registry of manager bindings and a cache of loaded resources, each
/// keyed by `(TypeKey, id)`. The cache stores only [`Weak`] references: once
/// every [`ResourcePtr`] to a slot drops, the entry naturally stops
/// resolving, which is what makes AUTO-RELEASE observable (see §8 S6 and
/// `DESIGN.md`).
#[derive(Clone)]
pub struct ResourceSystem {
    shared: Arc<Shared>,
}

impl ResourceSystem {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                managers: RwLock::new(HashMap::new()),
                cache: RwLock::new(HashMap::new()),
                next_id: RwLock::new(1),
            }),
        }
    }

    /// Registers a manager for `T`. Fails if `T` already has a manager
    /// registered (the source's behaviour is reported in
    /// [`spec::Open Questions`](super)'s resolution: reject, don't panic).
    pub fn register_manager<T: Any + Send + Sync>(&self) -> bool {
        let key = type_key::type_key::<T>();
        let mut managers = self.shared.managers.write();
        let entry = managers.entry(key).or_default();
        if entry.registered {
            tracing::warn!(?key, "resource manager already registered for this type");
            return false;
        }
        entry.registered = true;
        true
    }

    /// Installs a loader for `T`. Must be called before
    /// [`register_manager`](Self::register_manager); rejected afterwards.
    pub fn set_loader<T, F>(&self, loader: F) -> bool
    where
        T: Any + Send + Sync,
        F: Fn(&str) -> Option<T> + Send + Sync + 'static,
    {
        let key = type_key::type_key::<T>();
        let mut managers = self.shared.managers.write();
        let entry = managers.entry(key).or_default();
        if entry.registered {
            tracing::warn!(?key, "cannot install a loader after manager registration");
            return false;
        }
        entry.loader = Some(Box::new(move |name| loader(name).map(|v| Box::new(v) as Box<dyn Any + Send + Sync>)));
        true
    }

    /// Installs a release handler for `T`. Same pre-registration
    /// requirement as [`set_loader`](Self::set_loader).
    pub fn set_release_handler<T, F>(&self, handler: F) -> bool
    where
        T: Any + Send + Sync,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let key = type_key::type_key::<T>();
        let mut managers = self.shared.managers.write();
        let entry = managers.entry(key).or_default();
        if entry.registered {
            tracing::warn!(?key, "cannot install a release handler after manager registration");
            return false;
        }
        entry.release = Some(Arc::new(move |value| {
            if let Some(v) = value.downcast_ref::<T>() {
                handler(v);
            }
        }));
        true
    }

    /// Installs a dependency visitor for `T`: given a loaded value, calls
    /// `visit(type_key, id)` once per declared dependency. Exposed as a
    /// callback rather than a trait method so resource types never need to
    /// implement a crate trait to participate in [`ResourceSet`] traversal.
    pub fn set_dependency_visitor<T, F>(&self, visitor: F) -> bool
    where
        T: Any + Send + Sync,
        F: Fn(&T, &mut dyn FnMut(TypeKey, u64)) + Send + Sync + 'static,
    {
        let key = type_key::type_key::<T>();
        let mut managers = self.shared.managers.write();
        let entry = managers.entry(key).or_default();
        if entry.registered {
            tracing::warn!(?key, "cannot install a dependency visitor after manager registration");
            return false;
        }
        entry.dependencies = Some(Box::new(move |value, visit| {
            if let Some(v) = value.downcast_ref::<T>() {
                visitor(v, visit);
            }
        }));
        true
    }

    fn alloc_id(&self) -> u64 {
        let mut next = self.shared.next_id.write();
        let id = *next;
        *next += 1;
        id
    }

    /// Loads a resource by name. Consults the cache first: a live, type-
    /// matching entry is returned as-is. Otherwise runs `T`'s loader (the
    /// manager must be registered and carry one), installing the result
    /// under a freshly minted id. Loaded resources are not visible by
    /// default; pass `visible: true` for AUTO-VISIBLE semantics.
    pub fn load<T: Any + Send + Sync>(&self, name: &str, release: ReleasePolicy, visible: VisibilityPolicy) -> Option<ResourcePtr<T>> {
        let key = type_key::type_key::<T>();

        let existing = {
            let cache = self.shared.cache.read();
            cache
                .iter()
                .filter(|((k, _), _)| *k == key)
                .find_map(|(_, weak)| weak.upgrade())
        };
        if let Some(inner) = existing {
            return Some(ResourcePtr::from_inner(self.clone(), inner));
        }

        let value = {
            let managers = self.shared.managers.read();
            let manager = managers.get(&key)?;
            if !manager.registered {
                tracing::warn!(?key, "no manager registered for this resource type");
                return None;
            }
            let loader = manager.loader.as_ref()?;
            loader(name)?
        };

        let id = self.alloc_id();
        let inner = Arc::new(RecordInner { type_key: key, id, value, release });
        if visible == VisibilityPolicy::AutoVisible {
            self.shared.cache.write().insert((key, id), Arc::downgrade(&inner));
        }
        Some(ResourcePtr::from_inner(self.clone(), inner))
    }

    /// Makes an already-loaded resource reachable from [`load`](Self::load)
    /// calls against the same name. A no-op if it is already visible.
    pub fn make_visible<T: Any + Send + Sync>(&self, ptr: &ResourcePtr<T>) {
        let key = ptr.inner.type_key;
        let id = ptr.inner.id;
        self.shared.cache.write().entry((key, id)).or_insert_with(|| Arc::downgrade(&ptr.inner));
    }

    /// Looks up a cached, still-live resource by `(type, id)` without
    /// loading. Returns `None` if nothing is cached under that identity or
    /// if its last strong reference has already dropped.
    pub fn get<T: Any + Send + Sync>(&self, id: u64) -> Option<ResourcePtr<T>> {
        let key = type_key::type_key::<T>();
        let inner = self.shared.cache.read().get(&(key, id))?.upgrade()?;
        Some(ResourcePtr::from_inner(self.clone(), inner))
    }

    fn release(&self, inner: &Arc<RecordInner>) {
        self.shared.cache.write().remove(&(inner.type_key, inner.id));
        if inner.release != ReleasePolicy::AutoRelease {
            return;
        }
        let release = {
            let managers = self.shared.managers.read();
            managers.get(&inner.type_key).and_then(|m| m.release.clone())
        };
        // Release handlers run outside every lock so they can re-enter the system.
        if let Some(release) = release {
            release(inner.value.as_ref());
        }
    }

    fn dependencies_of(&self, inner: &Arc<RecordInner>) -> Vec<(TypeKey, u64)> {
        let managers = self.shared.managers.read();
        let Some(manager) = managers.get(&inner.type_key) else { return Vec::new() };
        let Some(visitor) = &manager.dependencies else { return Vec::new() };
        let mut out = Vec::new();
        visitor(inner.value.as_ref(), &mut |key, id| out.push((key, id)));
        out
    }
}

impl Default for ResourceSystem {
    fn default() -> Self {
        Self::new()
    }
}

/// A strong reference to a loaded resource. Cloning increments the
/// underlying `Arc`'s strong count (Rust's native equivalent of the
/// source's manual refcount increment-on-copy); dropping the last clone of
/// an AUTO-RELEASE resource invokes its manager's release handler, if any.
pub struct ResourcePtr<T> {
    system: ResourceSystem,
    inner: Arc<RecordInner>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Any + Send + Sync> ResourcePtr<T> {
    fn from_inner(system: ResourceSystem, inner: Arc<RecordInner>) -> Self {
        Self { system, inner, _marker: std::marker::PhantomData }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn get(&self) -> &T {
        self.inner
            .value
            .downcast_ref::<T>()
            .expect("ResourcePtr<T> always wraps a value of type T")
    }
}

impl<T> Clone for ResourcePtr<T> {
    fn clone(&self) -> Self {
        Self {
            system: self.system.clone(),
            inner: Arc::clone(&self.inner),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T: Any + Send + Sync> Drop for ResourcePtr<T> {
    fn drop(&mut self) {
        if Arc::strong_count(&self.inner) == 1 {
            self.system.release(&self.inner);
        }
    }
}

/// A collection of strong references rooted at one [`ResourceSystem`],
/// deduplicated by `(type, id)`. Each entry keeps both the type-erased
/// [`ResourcePtr`] the caller added and its underlying [`RecordInner`], the
/// latter purely so [`ResourceSet::remove`] can walk dependency edges
/// without needing to know every member's concrete type.
#[derive(Default)]
pub struct ResourceSet {
    entries: HashMap<(TypeKey, u64), (Box<dyn Any + Send + Sync>, Arc<RecordInner>)>,
}

impl ResourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `ptr`. With `include_dependencies`, also walks `ptr`'s declared
    /// dependency graph (cycles tolerated; dedup by identity stops
    /// re-traversal) and loads+adds every reachable resource.
    pub fn add<T: Any + Send + Sync>(&mut self, system: &ResourceSystem, ptr: ResourcePtr<T>, include_dependencies: bool) {
        let key = (ptr.inner.type_key, ptr.inner.id);
        if self.entries.contains_key(&key) {
            return;
        }
        let inner = Arc::clone(&ptr.inner);
        self.entries.insert(key, (Box::new(ptr), Arc::clone(&inner)));

        if !include_dependencies {
            return;
        }
        let mut stack = system.dependencies_of(&inner);
        let mut seen: std::collections::HashSet<(TypeKey, u64)> = std::collections::HashSet::new();
        seen.insert(key);
        while let Some((dep_key, dep_id)) = stack.pop() {
            if !seen.insert((dep_key, dep_id)) {
                continue;
            }
            let Some(dep_inner) = system.shared.cache.read().get(&(dep_key, dep_id)).and_then(|w| w.upgrade()) else {
                continue;
            };
            self.entries.entry((dep_key, dep_id)).or_insert_with(|| {
                let ptr = ResourcePtr::<()> {
                    system: system.clone(),
                    inner: Arc::clone(&dep_inner),
                    _marker: std::marker::PhantomData,
                };
                (Box::new(ptr) as Box<dyn Any + Send + Sync>, Arc::clone(&dep_inner))
            });
            stack.extend(system.dependencies_of(&dep_inner));
        }
    }

    /// Removes the resource at `(type_key, id)`. Without
    /// `include_dependencies` this only drops that one entry. With it: the
    /// removed root's transitive dependency closure (restricted to members
    /// of this set) is computed, then intersected against whatever is still
    /// reachable from every OTHER member of the set — anything in the
    /// closure still reachable from outside it is kept, the rest is
    /// dropped.
    pub fn remove(&mut self, system: &ResourceSystem, type_key: TypeKey, id: u64, include_dependencies: bool) {
        let root = (type_key, id);
        if !include_dependencies {
            self.entries.remove(&root);
            return;
        }
        if !self.entries.contains_key(&root) {
            return;
        }

        let closure = self.reachable_from(system, root);

        let mut reachable_from_outside: std::collections::HashSet<(TypeKey, u64)> = std::collections::HashSet::new();
        for external_root in self.entries.keys().copied().collect::<Vec<_>>() {
            if closure.contains(&external_root) {
                continue;
            }
            for member in self.reachable_from(system, external_root) {
                if closure.contains(&member) {
                    reachable_from_outside.insert(member);
                }
            }
        }

        for key in closure {
            if !reachable_from_outside.contains(&key) {
                self.entries.remove(&key);
            }
        }
    }

    /// The set of `(type, id)` pairs reachable from `root` by following
    /// dependency edges, restricted to members already present in this set
    /// (a dependency this set never loaded cannot be traversed further).
    fn reachable_from(&self, system: &ResourceSystem, root: (TypeKey, u64)) -> std::collections::HashSet<(TypeKey, u64)> {
        let mut seen = std::collections::HashSet::new();
        let mut stack = vec![root];
        while let Some(key) = stack.pop() {
            if !seen.insert(key) {
                continue;
            }
            if let Some((_, inner)) = self.entries.get(&key) {
                stack.extend(system.dependencies_of(inner));
            }
        }
        seen
    }

    pub fn contains(&self, type_key: TypeKey, id: u64) -> bool {
        self.entries.contains_key(&(type_key, id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use compact_str::CompactString;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Texture {
        name: CompactString,
    }

    #[test]
    fn auto_release_fires_exactly_once_on_last_drop() {
        let system = ResourceSystem::new();
        let release_count = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&release_count);

        system.set_loader::<Texture, _>(|name| Some(Texture { name: CompactString::new(name) }));
        system.set_release_handler::<Texture, _>(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(system.register_manager::<Texture>());

        let first = system
            .load::<Texture>("wood", ReleasePolicy::AutoRelease, VisibilityPolicy::AutoVisible)
            .unwrap();
        let id = first.id();
        let second = first.clone();

        drop(first);
        assert_eq!(release_count.load(Ordering::SeqCst), 0);
        drop(second);
        assert_eq!(release_count.load(Ordering::SeqCst), 1);

        assert!(system.get::<Texture>(id).is_none());
    }

    #[test]
    fn loading_consults_cache_before_invoking_loader() {
        let system = ResourceSystem::new();
        let load_count = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&load_count);
        system.set_loader::<Texture, _>(move |name| {
            counter.fetch_add(1, Ordering::SeqCst);
            Some(Texture { name: CompactString::new(name) })
        });
        assert!(system.register_manager::<Texture>());

        let a = system
            .load::<Texture>("wood", ReleasePolicy::Manual, VisibilityPolicy::AutoVisible)
            .unwrap();
        let b = system
            .load::<Texture>("wood", ReleasePolicy::Manual, VisibilityPolicy::AutoVisible)
            .unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(load_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn registering_manager_twice_is_rejected() {
        let system = ResourceSystem::new();
        assert!(system.register_manager::<Texture>());
        assert!(!system.register_manager::<Texture>());
    }

    #[test]
    fn loader_cannot_be_installed_after_registration() {
        let system = ResourceSystem::new();
        assert!(system.register_manager::<Texture>());
        assert!(!system.set_loader::<Texture, _>(|name| Some(Texture { name: CompactString::new(name) })));
    }

    struct Model {
        #[allow(dead_code)]
        name: CompactString,
        dep_id: Option<u64>,
    }

    #[test]
    fn remove_with_dependencies_keeps_nodes_still_referenced_from_outside() {
        let system = ResourceSystem::new();
        system.set_loader::<Model, _>(|name| {
            let dep_id = if name == "base" { None } else { Some(1u64) };
            Some(Model { name: CompactString::new(name), dep_id })
        });
        system.set_dependency_visitor::<Model, _>(|m: &Model, visit| {
            if let Some(dep) = m.dep_id {
                visit(type_key::type_key::<Model>(), dep);
            }
        });
        assert!(system.register_manager::<Model>());

        let base = system.load::<Model>("base", ReleasePolicy::Manual, VisibilityPolicy::AutoVisible).unwrap();
        assert_eq!(base.id(), 1);
        let root = system.load::<Model>("root", ReleasePolicy::Manual, VisibilityPolicy::AutoVisible).unwrap();
        let other = system.load::<Model>("other", ReleasePolicy::Manual, VisibilityPolicy::AutoVisible).unwrap();

        let model_key = type_key::type_key::<Model>();
        let mut set = ResourceSet::new();
        set.add(&system, root.clone(), true);
        set.add(&system, other.clone(), true);
        assert_eq!(set.len(), 3);

        set.remove(&system, model_key, root.id(), true);

        assert!(!set.contains(model_key, root.id()));
        assert!(set.contains(model_key, other.id()));
        assert!(set.contains(model_key, base.id()), "base is still reachable from `other`, so it must survive the removal");
    }

    #[test]
    fn remove_without_dependencies_drops_only_the_named_entry() {
        let system = ResourceSystem::new();
        system.set_loader::<Texture, _>(|name| Some(Texture { name: CompactString::new(name) }));
        assert!(system.register_manager::<Texture>());
        let wood = system.load::<Texture>("wood", ReleasePolicy::Manual, VisibilityPolicy::AutoVisible).unwrap();
        let key = type_key::type_key::<Texture>();

        let mut set = ResourceSet::new();
        set.add(&system, wood.clone(), false);
        assert_eq!(set.len(), 1);
        set.remove(&system, key, wood.id(), false);
        assert!(set.is_empty());
    }
}
