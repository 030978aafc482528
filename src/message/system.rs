//! The central endpoint/channel registry (§4.6): mints ids, tracks
//! subscriptions, and walks the subscription graph on dispatch.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::ThreadId;

use compact_str::CompactString;
use parking_lot::{Condvar, Mutex, RwLock};

use super::dispatcher::{Dispatcher, QueuedMessage};
use super::endpoint::{self, Endpoint, HandlersHandle};
use super::{EndpointId, BROADCAST, NO_ENDPOINT};
use crate::type_key::{self, TypeInfo};
use crate::weak::{WeakPtr, WeakScope};

enum EntryKind {
    Endpoint(HandlersHandle),
    Channel,
}

struct Entry {
    kind: EntryKind,
    #[allow(dead_code)]
    name: Option<CompactString>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    subscribers: HashSet<EndpointId>,
    subscribed_to: HashSet<EndpointId>,
    pending_add: HashSet<EndpointId>,
    pending_remove: HashSet<EndpointId>,
    erase_after_dispatch: bool,
    dispatching_threads: HashSet<ThreadId>,
}

impl Entry {
    fn new(kind: EntryKind, name: Option<&str>, dispatcher: Option<Arc<dyn Dispatcher>>) -> Self {
        Self {
            kind,
            name: name.map(CompactString::new),
            dispatcher,
            subscribers: HashSet::new(),
            subscribed_to: HashSet::new(),
            pending_add: HashSet::new(),
            pending_remove: HashSet::new(),
            erase_after_dispatch: false,
            dispatching_threads: HashSet::new(),
        }
    }

    fn is_subscribed(&self, id: EndpointId) -> bool {
        self.subscribers.contains(&id) || self.pending_add.contains(&id)
    }
}

#[derive(Default)]
struct Table {
    entries: HashMap<EndpointId, Entry>,
    next_id: u64,
}

/// The registry behind a [`MessageSystem`]. Exposed only as an opaque type
/// so [`WeakPtr`]/[`WeakScope`] over it can appear in [`SystemHandle`]; every
/// operation is reached through `MessageSystem` or `SystemHandle`.
pub struct Registry {
    table: RwLock<Table>,
    default_dispatcher: RwLock<Option<Arc<dyn Dispatcher>>>,
    // Guards the "a dispatch on another thread is still fanning out through
    // this entry" wait in `destroy_endpoint`. `finish_dispatch_thread` takes
    // this before touching `table` so the check-then-wait in
    // `destroy_endpoint` can never race a notify it would otherwise miss —
    // the same drain idiom as `weak::WeakScope::invalidate`.
    drain_lock: Mutex<()>,
    drain: Condvar,
}

impl Registry {
    fn alloc_id(&self) -> EndpointId {
        let mut table = self.table.write();
        table.next_id = table.next_id.max(2);
        let id = EndpointId(table.next_id);
        table.next_id += 1;
        id
    }

    fn subscribe_to_broadcast(&self, id: EndpointId) {
        let mut table = self.table.write();
        let Some(broadcast) = table.entries.get_mut(&BROADCAST) else { return };
        if !broadcast.dispatching_threads.is_empty() {
            broadcast.pending_remove.remove(&id);
            broadcast.pending_add.insert(id);
        } else {
            broadcast.subscribers.insert(id);
        }
    }

    pub(crate) fn subscribe(&self, source: EndpointId, subscriber: EndpointId) -> bool {
        let mut table = self.table.write();
        if !table.entries.contains_key(&source) || !table.entries.contains_key(&subscriber) {
            return false;
        }
        let already = table.entries.get(&source).is_some_and(|e| e.is_subscribed(subscriber));
        if already {
            return true;
        }
        if let Some(sub_entry) = table.entries.get_mut(&subscriber) {
            sub_entry.subscribed_to.insert(source);
        }
        let Some(src_entry) = table.entries.get_mut(&source) else { return false };
        if !src_entry.dispatching_threads.is_empty() {
            src_entry.pending_remove.remove(&subscriber);
            src_entry.pending_add.insert(subscriber);
        } else {
            src_entry.subscribers.insert(subscriber);
        }
        true
    }

    pub(crate) fn unsubscribe(&self, source: EndpointId, subscriber: EndpointId) -> bool {
        let mut table = self.table.write();
        if !table.entries.contains_key(&source) || !table.entries.contains_key(&subscriber) {
            return false;
        }
        if let Some(sub_entry) = table.entries.get_mut(&subscriber) {
            sub_entry.subscribed_to.remove(&source);
        }
        let Some(src_entry) = table.entries.get_mut(&source) else { return false };
        if !src_entry.is_subscribed(subscriber) {
            return true;
        }
        if !src_entry.dispatching_threads.is_empty() {
            src_entry.pending_add.remove(&subscriber);
            src_entry.pending_remove.insert(subscriber);
        } else {
            src_entry.subscribers.remove(&subscriber);
        }
        true
    }

    fn resolve_dispatcher(&self, to: EndpointId) -> Option<Arc<dyn Dispatcher>> {
        let table = self.table.read();
        if let Some(entry) = table.entries.get(&to) {
            if let Some(d) = &entry.dispatcher {
                return Some(Arc::clone(d));
            }
        }
        self.default_dispatcher.read().clone()
    }

    /// Sends `message` to `to`. Rejects non-cloneable message types: `send`
    /// is generic over `T: Clone` for exactly this reason, so the rejection
    /// is a compile-time property rather than a runtime check in this port
    /// (see `DESIGN.md`).
    pub(crate) fn send<T: Any + Clone + Send + Sync>(&self, from: EndpointId, to: EndpointId, message: T) -> bool {
        if !self.table.read().entries.contains_key(&to) {
            tracing::debug!(?to, "send: destination endpoint not found");
            return false;
        }
        let type_info = type_key::type_info_cloneable::<T>();
        match self.resolve_dispatcher(to) {
            Some(dispatcher) => {
                dispatcher.enqueue(QueuedMessage {
                    from,
                    to,
                    type_info,
                    payload: Box::new(message),
                });
                true
            }
            None => {
                let mut visited = HashSet::new();
                self.dispatch_recursive(from, to, type_info, Payload::Borrowed(&message), &mut visited, None)
            }
        }
    }

    /// Entry point used by dispatchers draining a queued, already-cloned
    /// message.
    pub(crate) fn dispatch_owned(
        &self,
        from: EndpointId,
        to: EndpointId,
        type_info: &'static TypeInfo,
        payload: Box<dyn Any + Send + Sync>,
    ) -> bool {
        let driving = self.table.read().entries.get(&to).and_then(|e| e.dispatcher.clone());
        let mut visited = HashSet::new();
        self.dispatch_recursive(from, to, type_info, Payload::Owned(payload), &mut visited, driving)
    }

    fn dispatch_recursive(
        &self,
        from: EndpointId,
        to: EndpointId,
        type_info: &'static TypeInfo,
        payload: Payload<'_>,
        visited: &mut HashSet<EndpointId>,
        driving: Option<Arc<dyn Dispatcher>>,
    ) -> bool {
        if !visited.insert(to) {
            return false;
        }

        let missing_or_erasing = {
            let table = self.table.read();
            match table.entries.get(&to) {
                None => true,
                Some(e) => e.erase_after_dispatch,
            }
        };
        if missing_or_erasing {
            return false;
        }

        let node_dispatcher = self.table.read().entries.get(&to).and_then(|e| e.dispatcher.clone());
        let same_driver = match (&driving, &node_dispatcher) {
            (Some(d), Some(nd)) => Arc::ptr_eq(d, nd),
            (None, None) => true,
            _ => false,
        };
        if let Some(nd) = &node_dispatcher {
            if !same_driver {
                let cloned = type_info
                    .clone_erased(payload.as_ref())
                    .expect("message type must be cloneable to cross dispatchers");
                nd.enqueue(QueuedMessage { from, to, type_info, payload: cloned });
                return true;
            }
        }

        {
            let mut table = self.table.write();
            if let Some(e) = table.entries.get_mut(&to) {
                e.dispatching_threads.insert(std::thread::current().id());
            }
        }

        let handlers = {
            let table = self.table.read();
            table.entries.get(&to).and_then(|e| match &e.kind {
                EntryKind::Endpoint(h) => Some(Arc::clone(h)),
                EntryKind::Channel => None,
            })
        };
        if let Some(handlers) = handlers {
            endpoint::deliver(&handlers, from, type_info, payload.as_ref());
        }

        let subscribers: Vec<EndpointId> = {
            let table = self.table.read();
            table
                .entries
                .get(&to)
                .map(|e| e.subscribers.iter().copied().collect())
                .unwrap_or_default()
        };
        for subscriber in subscribers {
            self.dispatch_recursive(
                from,
                subscriber,
                type_info,
                Payload::Borrowed(payload.as_ref()),
                visited,
                driving.clone(),
            );
        }

        self.finish_dispatch_thread(to);
        true
    }

    fn finish_dispatch_thread(&self, to: EndpointId) {
        // Held across the whole mutation so a concurrent `destroy_endpoint`
        // can never observe "still dispatching" and then block on `drain`
        // after this call has already sent its notify — see the comment on
        // `Registry::drain_lock`.
        let guard = self.drain_lock.lock();
        let mut table = self.table.write();
        let Some(entry) = table.entries.get_mut(&to) else { return };
        entry.dispatching_threads.remove(&std::thread::current().id());
        if entry.dispatching_threads.is_empty() {
            let adds: Vec<_> = entry.pending_add.drain().collect();
            let removes: Vec<_> = entry.pending_remove.drain().collect();
            for a in adds {
                entry.subscribers.insert(a);
            }
            for r in removes {
                entry.subscribers.remove(&r);
            }
            if entry.erase_after_dispatch {
                table.entries.remove(&to);
            }
        }
        drop(table);
        self.drain.notify_all();
        drop(guard);
    }

    /// Tears down endpoint `id`. Blocks until: the endpoint's own handler
    /// (if any is running) returns, and every *other* thread currently
    /// fanning out a dispatch through this entry's subscriber list has
    /// finished with it (§4.6.1). The destroying thread's own presence in
    /// `dispatching_threads` — the self-referential-teardown case, dropping
    /// an `Endpoint` from inside a handler it is itself running — does not
    /// count against that wait.
    pub(crate) fn destroy_endpoint(&self, id: EndpointId, handlers: &HandlersHandle) {
        endpoint::wait_for_quiescence(handlers);

        let here = std::thread::current().id();
        let mut guard = self.drain_lock.lock();
        loop {
            let others_still_dispatching = self
                .table
                .read()
                .entries
                .get(&id)
                .is_some_and(|e| e.dispatching_threads.iter().any(|t| *t != here));
            if !others_still_dispatching {
                break;
            }
            self.drain.wait(&mut guard);
        }
        drop(guard);

        let dispatching_here = {
            let table = self.table.read();
            table.entries.get(&id).is_some_and(|e| e.dispatching_threads.contains(&here))
        };
        let mut table = self.table.write();
        if dispatching_here {
            if let Some(entry) = table.entries.get_mut(&id) {
                entry.kind = EntryKind::Channel;
                entry.erase_after_dispatch = true;
            }
            return;
        }
        if let Some(entry) = table.entries.remove(&id) {
            for subscriber in entry.subscribed_to {
                if let Some(src) = table.entries.get_mut(&subscriber) {
                    src.subscribers.remove(&id);
                    src.pending_add.remove(&id);
                }
            }
        }
    }
}

enum Payload<'a> {
    Borrowed(&'a (dyn Any + Send + Sync)),
    Owned(Box<dyn Any + Send + Sync>),
}

impl<'a> Payload<'a> {
    fn as_ref(&self) -> &(dyn Any + Send + Sync) {
        match self {
            Payload::Borrowed(r) => *r,
            Payload::Owned(b) => b.as_ref(),
        }
    }
}

/// A weak, cloneable handle to a [`MessageSystem`]'s registry. Endpoints and
/// dispatchers hold one to detect system destruction without keeping the
/// system alive.
#[derive(Clone)]
pub struct SystemHandle(WeakPtr<Registry>);

impl SystemHandle {
    pub(crate) fn lock(&self) -> Option<crate::weak::WeakLock<Registry>> {
        self.0.lock()
    }
}

/// An intra-process publish/subscribe registry. Endpoint `0` is reserved for
/// "no endpoint" and endpoint `1` for the broadcast channel every newly
/// created [`Endpoint`] auto-subscribes to.
pub struct MessageSystem {
    registry: Arc<Registry>,
    scope: WeakScope<Registry>,
}

impl MessageSystem {
    pub fn new() -> Self {
        let registry = Arc::new(Registry {
            table: RwLock::new(Table::default()),
            default_dispatcher: RwLock::new(None),
            drain_lock: Mutex::new(()),
            drain: Condvar::new(),
        });
        registry
            .table
            .write()
            .entries
            .insert(BROADCAST, Entry::new(EntryKind::Channel, Some("broadcast"), None));
        // SAFETY: `scope` only ever observes this `Arc`'s heap allocation,
        // which stays put until `Drop` invalidates the scope first.
        let scope = unsafe { WeakScope::new(&*registry) };
        Self { registry, scope }
    }

    fn handle(&self) -> SystemHandle {
        SystemHandle(self.scope.ptr())
    }

    /// Installs the system-wide default dispatcher used when an endpoint has
    /// none of its own.
    pub fn set_default_dispatcher(&self, dispatcher: Arc<dyn Dispatcher>) -> bool {
        if !dispatcher.set_system(self.handle()) {
            return false;
        }
        *self.registry.default_dispatcher.write() = Some(dispatcher);
        true
    }

    /// Creates a fresh [`Endpoint`], auto-subscribed to the broadcast
    /// channel. `dispatcher`, if given, must not already be bound to a
    /// different system.
    pub fn create_endpoint(&self, name: Option<&str>, dispatcher: Option<Arc<dyn Dispatcher>>) -> Option<Endpoint> {
        if let Some(d) = &dispatcher {
            if !d.set_system(self.handle()) {
                return None;
            }
        }
        let id = self.registry.alloc_id();
        let handlers = endpoint::new_handlers();
        self.registry
            .table
            .write()
            .entries
            .insert(id, Entry::new(EntryKind::Endpoint(Arc::clone(&handlers)), name, dispatcher));
        self.registry.subscribe_to_broadcast(id);
        Some(Endpoint { id, system: self.handle(), handlers })
    }

    /// Creates a fan-out-only channel (no handlers of its own).
    pub fn create_channel(&self, name: Option<&str>) -> EndpointId {
        let id = self.registry.alloc_id();
        self.registry.table.write().entries.insert(id, Entry::new(EntryKind::Channel, name, None));
        id
    }

    pub fn subscribe(&self, source: EndpointId, subscriber: EndpointId) -> bool {
        self.registry.subscribe(source, subscriber)
    }

    pub fn unsubscribe(&self, source: EndpointId, subscriber: EndpointId) -> bool {
        self.registry.unsubscribe(source, subscriber)
    }

    /// Sends `message` to `to`. `from` should be [`NO_ENDPOINT`] for
    /// messages originating outside any endpoint.
    pub fn send<T: Any + Clone + Send + Sync>(&self, from: EndpointId, to: EndpointId, message: T) -> bool {
        self.registry.send(from, to, message)
    }

    /// Convenience for `send` with no originating endpoint.
    pub fn broadcast<T: Any + Clone + Send + Sync>(&self, message: T) -> bool {
        self.registry.send(NO_ENDPOINT, BROADCAST, message)
    }
}

impl Default for MessageSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MessageSystem {
    fn drop(&mut self) {
        self.scope.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn broadcast_fans_out_to_every_endpoint() {
        let system = MessageSystem::new();
        let counters: Vec<_> = (0..3).map(|_| Arc::new(AtomicU32::new(0))).collect();
        let endpoints: Vec<_> = counters
            .iter()
            .map(|c| {
                let ep = system.create_endpoint(None, None).unwrap();
                let c = Arc::clone(c);
                ep.on::<i32, _>(move |from, value| {
                    assert_eq!(from, NO_ENDPOINT);
                    assert_eq!(*value, 42);
                    c.fetch_add(1, Ordering::SeqCst);
                });
                ep
            })
            .collect();

        assert!(system.broadcast(42i32));
        for c in &counters {
            assert_eq!(c.load(Ordering::SeqCst), 1);
        }
        drop(endpoints);
    }

    #[test]
    fn cyclic_subscription_delivers_exactly_once() {
        let system = MessageSystem::new();
        let e1 = system.create_endpoint(None, None).unwrap();
        let e2 = system.create_endpoint(None, None).unwrap();
        let e1_hits = Arc::new(AtomicU32::new(0));
        let e2_hits = Arc::new(AtomicU32::new(0));
        {
            let c = Arc::clone(&e1_hits);
            e1.on::<i32, _>(move |_, _| {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let c = Arc::clone(&e2_hits);
            e2.on::<i32, _>(move |_, _| {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(system.subscribe(e2.id(), e1.id()));
        assert!(system.subscribe(e1.id(), e2.id()));

        assert!(system.send(NO_ENDPOINT, e1.id(), 7i32));
        assert_eq!(e1_hits.load(Ordering::SeqCst), 1);
        assert_eq!(e2_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn send_to_missing_endpoint_fails() {
        let system = MessageSystem::new();
        assert!(!system.send(NO_ENDPOINT, EndpointId(999), 1i32));
    }

    #[test]
    fn destroying_an_endpoint_waits_for_another_threads_fan_out() {
        use std::sync::atomic::AtomicBool;
        use std::time::Duration;

        // `a` has no handler of its own, so `a`'s `Handlers::State::calling`
        // flips back to false almost instantly — but the dispatching thread
        // keeps walking `a`'s subscriber list afterward, recursing into `b`,
        // whose handler is slow. Destroying `a` must wait for that recursion
        // to finish, not just for `a`'s own (already-idle) handler flag.
        let system = Arc::new(MessageSystem::new());
        let a = system.create_endpoint(None, None).unwrap();
        let a_id = a.id();
        let b = system.create_endpoint(None, None).unwrap();
        assert!(system.subscribe(a.id(), b.id()));

        let entered = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        {
            let entered = Arc::clone(&entered);
            let finished = Arc::clone(&finished);
            b.on::<i32, _>(move |_, _| {
                entered.store(true, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(100));
                finished.store(true, Ordering::SeqCst);
            });
        }

        let sys2 = Arc::clone(&system);
        let dispatch_thread = std::thread::spawn(move || {
            assert!(sys2.send(NO_ENDPOINT, a_id, 1i32));
        });

        while !entered.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }
        // The dispatching thread is now sleeping inside `b`'s handler, deep
        // in the recursive walk that started at `a`; `a` itself is still in
        // its own `dispatching_threads` set even though its own handler call
        // already returned.
        drop(a);
        assert!(finished.load(Ordering::SeqCst), "destroying a must wait for the other thread's subscriber fan-out to finish");

        dispatch_thread.join().unwrap();
    }
}
