//! Endpoint handler storage and re-entrant-safe delivery (§4.6.1).

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::thread::ThreadId;

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::system::SystemHandle;
use super::EndpointId;
use crate::type_key::{TypeInfo, TypeKey};

type Handler = Box<dyn FnMut(EndpointId, &(dyn Any + Send + Sync)) + Send>;

struct Queued {
    from: EndpointId,
    type_key: TypeKey,
    payload: Box<dyn Any + Send + Sync>,
}

struct State {
    by_type: HashMap<TypeKey, Handler>,
    calling: bool,
    calling_thread: Option<ThreadId>,
    queue: VecDeque<Queued>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            by_type: HashMap::new(),
            calling: false,
            calling_thread: None,
            queue: VecDeque::new(),
        }
    }
}

/// Opaque per-endpoint handler storage, shared between [`Endpoint`] and the
/// [`super::system::Registry`] entry that points at it. `pub(crate)` only so
/// it can be named across sibling modules in `crate::message`; no field or
/// method is reachable outside the crate.
pub(crate) struct Handlers {
    state: Mutex<State>,
    idle: Condvar,
}

impl Default for Handlers {
    fn default() -> Self {
        Self {
            state: Mutex::new(State::default()),
            idle: Condvar::new(),
        }
    }
}

pub(crate) type HandlersHandle = std::sync::Arc<Handlers>;

pub(crate) fn new_handlers() -> HandlersHandle {
    std::sync::Arc::new(Handlers::default())
}

/// Delivers `payload` to the handler registered for `type_info`'s type. If a
/// handler is already executing (on any thread), clones `payload` through
/// `type_info` and appends it to the FIFO the in-flight call drains after it
/// returns. Otherwise runs the handler inline against `payload` with no
/// clone, then drains anything that queued up during its own execution.
pub(crate) fn deliver(
    handlers: &HandlersHandle,
    from: EndpointId,
    type_info: &'static TypeInfo,
    payload: &(dyn Any + Send + Sync),
) {
    let type_key = type_info.type_key();
    let mut guard = handlers.state.lock();
    if guard.calling {
        let cloned = type_info
            .clone_erased(payload)
            .expect("message type must be cloneable to queue into a busy endpoint");
        guard.queue.push_back(Queued { from, type_key, payload: cloned });
        return;
    }
    guard.calling = true;
    guard.calling_thread = Some(std::thread::current().id());

    let mut handler = guard.by_type.remove(&type_key);
    drop(guard);
    if let Some(h) = handler.as_mut() {
        h(from, payload);
    }
    guard = handlers.state.lock();
    if let Some(h) = handler {
        guard.by_type.entry(type_key).or_insert(h);
    }

    loop {
        let Some(queued) = guard.queue.pop_front() else { break };
        let mut handler = guard.by_type.remove(&queued.type_key);
        drop(guard);
        if let Some(h) = handler.as_mut() {
            h(queued.from, queued.payload.as_ref());
        }
        guard = handlers.state.lock();
        if let Some(h) = handler {
            guard.by_type.entry(queued.type_key).or_insert(h);
        }
    }

    guard.calling = false;
    guard.calling_thread = None;
    drop(guard);
    handlers.idle.notify_all();
}

/// Blocks the calling thread until no handler is executing for `handlers`.
/// Panics if the calling thread is itself the one currently running a
/// handler for this endpoint (deleting an endpoint from inside its own
/// handler is a programmer error, not a race to wait out).
pub(crate) fn wait_for_quiescence(handlers: &HandlersHandle) {
    let mut guard: MutexGuard<'_, State> = handlers.state.lock();
    while guard.calling {
        if guard.calling_thread == Some(std::thread::current().id()) {
            panic!("an Endpoint must not be dropped from inside its own handler");
        }
        handlers.idle.wait(&mut guard);
    }
}

pub(crate) fn clear_handlers(handlers: &HandlersHandle) {
    handlers.state.lock().by_type.clear();
}

/// An owned handle over a registry entry that can receive typed messages.
/// Dropping it removes the entry from its system, after waiting for any
/// in-flight delivery on another thread to finish.
pub struct Endpoint {
    pub(crate) id: EndpointId,
    pub(crate) system: SystemHandle,
    pub(crate) handlers: HandlersHandle,
}

impl Endpoint {
    pub fn id(&self) -> EndpointId {
        self.id
    }

    /// Registers (or replaces) the handler for messages of type `T`.
    /// Replacing a handler while it is executing is safe: the running
    /// invocation keeps its own moved-out copy and this call only affects
    /// future deliveries.
    pub fn on<T, F>(&self, mut f: F)
    where
        T: Any + Send + Sync,
        F: FnMut(EndpointId, &T) + Send + 'static,
    {
        let type_key = crate::type_key::type_key::<T>();
        let wrapped: Handler = Box::new(move |from, payload| {
            if let Some(value) = payload.downcast_ref::<T>() {
                f(from, value);
            }
        });
        self.handlers.state.lock().by_type.insert(type_key, wrapped);
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if let Some(system) = self.system.lock() {
            system.destroy_endpoint(self.id, &self.handlers);
        }
        clear_handlers(&self.handlers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deliver_runs_handler_inline_when_idle() {
        let handlers = new_handlers();
        let info = crate::type_key::type_info_cloneable::<i32>();
        handlers
            .state
            .lock()
            .by_type
            .insert(info.type_key(), Box::new(|_from, _payload| {}) as Handler);
        deliver(&handlers, EndpointId(0), info, &7i32);
        assert!(!handlers.state.lock().calling);
    }
}
