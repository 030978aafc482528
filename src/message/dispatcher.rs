//! The three dispatcher implementations sharing a single contract: accept
//! a queued message record, and at some future point — possibly on another
//! thread — call back into the owning [`MessageSystem`](super::system::MessageSystem)
//! to dispatch it, owning the cloned payload until then.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use super::system::SystemHandle;
use super::EndpointId;
use crate::type_key::TypeInfo;

/// A message record owned by a dispatcher between enqueue and drain.
pub struct QueuedMessage {
    pub from: EndpointId,
    pub to: EndpointId,
    pub type_info: &'static TypeInfo,
    pub payload: Box<dyn Any + Send + Sync>,
}

/// Common dispatcher contract. A dispatcher is bound to exactly one
/// [`MessageSystem`](super::system::MessageSystem) via a one-shot
/// [`Dispatcher::set_system`]; rebinding is a failure.
pub trait Dispatcher: Send + Sync {
    fn set_system(&self, system: SystemHandle) -> bool;
    fn enqueue(&self, message: QueuedMessage);
}

struct SystemSlot {
    handle: Mutex<Option<SystemHandle>>,
}

impl SystemSlot {
    fn new() -> Self {
        Self { handle: Mutex::new(None) }
    }

    fn set(&self, system: SystemHandle) -> bool {
        let mut slot = self.handle.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(system);
        true
    }

    fn get(&self) -> Option<SystemHandle> {
        self.handle.lock().clone()
    }
}

/// The null dispatcher: enqueuing dispatches inline on the calling thread.
/// Equivalent to the fallback a [`super::system::MessageSystem::send`] uses
/// when no dispatcher is configured at all, but available as an explicit,
/// nameable choice for an endpoint or system default.
pub struct ImmediateDispatcher {
    system: SystemSlot,
}

impl ImmediateDispatcher {
    pub fn new() -> Self {
        Self { system: SystemSlot::new() }
    }
}

impl Default for ImmediateDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher for ImmediateDispatcher {
    fn set_system(&self, system: SystemHandle) -> bool {
        self.system.set(system)
    }

    fn enqueue(&self, message: QueuedMessage) {
        if let Some(system) = self.system.get() {
            if let Some(locked) = system.lock() {
                locked.dispatch_owned(message.from, message.to, message.type_info, message.payload);
            }
        }
    }
}

/// A FIFO of queued messages drained on explicit [`PollingDispatcher::update`].
/// Any messages still queued when the dispatcher is dropped are destroyed
/// (Rust's ordinary drop glue stands in for the source's explicit
/// TypeInfo-driven destroy).
pub struct PollingDispatcher {
    system: SystemSlot,
    queue: Mutex<VecDeque<QueuedMessage>>,
}

impl PollingDispatcher {
    pub fn new() -> Self {
        Self {
            system: SystemSlot::new(),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Drains every currently-queued message, dispatching each in FIFO
    /// order on the calling thread.
    pub fn update(&self) {
        let Some(system) = self.system.get() else { return };
        loop {
            let next = self.queue.lock().pop_front();
            let Some(message) = next else { break };
            if let Some(locked) = system.lock() {
                locked.dispatch_owned(message.from, message.to, message.type_info, message.payload);
            }
        }
    }
}

impl Default for PollingDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher for PollingDispatcher {
    fn set_system(&self, system: SystemHandle) -> bool {
        self.system.set(system)
    }

    fn enqueue(&self, message: QueuedMessage) {
        self.queue.lock().push_back(message);
    }
}

struct ThreadedShared {
    system: SystemSlot,
    queue: Mutex<VecDeque<QueuedMessage>>,
    signal: Condvar,
    cancelled: AtomicBool,
}

/// A worker thread that wakes on new messages and dispatches them off the
/// enqueuing thread. [`ThreadedDispatcher::cancel`] stops the worker and
/// drains whatever remains on the calling thread; dropping without
/// cancelling first leaks any still-queued messages (matching the source's
/// documented, if questionable, behaviour — see `DESIGN.md`).
pub struct ThreadedDispatcher {
    shared: std::sync::Arc<ThreadedShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadedDispatcher {
    pub fn new() -> Self {
        let shared = std::sync::Arc::new(ThreadedShared {
            system: SystemSlot::new(),
            queue: Mutex::new(VecDeque::new()),
            signal: Condvar::new(),
            cancelled: AtomicBool::new(false),
        });
        let worker_shared = std::sync::Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("message-dispatcher".into())
            .spawn(move || Self::run(worker_shared))
            .expect("failed to spawn message dispatcher thread");
        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    fn run(shared: std::sync::Arc<ThreadedShared>) {
        loop {
            let message = {
                let mut queue = shared.queue.lock();
                loop {
                    if let Some(m) = queue.pop_front() {
                        break Some(m);
                    }
                    if shared.cancelled.load(Ordering::SeqCst) {
                        break None;
                    }
                    shared.signal.wait(&mut queue);
                }
            };
            let Some(message) = message else { break };
            if let Some(system) = shared.system.get() {
                if let Some(locked) = system.lock() {
                    locked.dispatch_owned(message.from, message.to, message.type_info, message.payload);
                }
            }
        }
    }

    /// Stops the worker thread and dispatches any remaining queued
    /// messages synchronously on the calling thread.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        self.shared.signal.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        let Some(system) = self.shared.system.get() else { return };
        loop {
            let next = self.shared.queue.lock().pop_front();
            let Some(message) = next else { break };
            if let Some(locked) = system.lock() {
                locked.dispatch_owned(message.from, message.to, message.type_info, message.payload);
            }
        }
    }
}

impl Default for ThreadedDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher for ThreadedDispatcher {
    fn set_system(&self, system: SystemHandle) -> bool {
        self.shared.system.set(system)
    }

    fn enqueue(&self, message: QueuedMessage) {
        self.shared.queue.lock().push_back(message);
        self.shared.signal.notify_one();
    }
}

impl Drop for ThreadedDispatcher {
    fn drop(&mut self) {
        if self.worker.lock().is_some() {
            tracing::warn!("ThreadedDispatcher dropped without cancel(); worker thread and any queued messages are leaked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::system::MessageSystem;
    use crate::message::NO_ENDPOINT;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[test]
    fn polling_dispatcher_queues_until_update() {
        let system = MessageSystem::new();
        let dispatcher = Arc::new(PollingDispatcher::new());
        let endpoint = system.create_endpoint(None, Some(dispatcher.clone())).unwrap();
        let hits = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&hits);
        endpoint.on::<i32, _>(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(system.send(NO_ENDPOINT, endpoint.id(), 5i32));
        assert_eq!(hits.load(Ordering::SeqCst), 0, "polling dispatcher must not deliver before update()");
        dispatcher.update();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn threaded_dispatcher_delivers_off_the_caller_thread() {
        let system = MessageSystem::new();
        let dispatcher = Arc::new(ThreadedDispatcher::new());
        let endpoint = system.create_endpoint(None, Some(dispatcher.clone())).unwrap();
        let hits = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&hits);
        endpoint.on::<i32, _>(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(system.send(NO_ENDPOINT, endpoint.id(), 1i32));

        for _ in 0..200 {
            if hits.load(Ordering::SeqCst) == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        dispatcher.cancel();
    }
}
