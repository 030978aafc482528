//! A stack of independently owned handler bundles dispatched in a
//! configurable order, each free to claim a message and stop the walk
//! (§4.8). Bundles are addressed by [`std::sync::Weak`] rather than the
//! crate's own [`crate::weak::WeakScope`]: a bundle is an external,
//! `Arc`-owned `dyn Any` and the stack only ever wants to observe whether
//! it is still alive, never to block a drop on drainage (see `DESIGN.md`).

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::EndpointId;
use crate::type_key::TypeKey;

/// A handler returns `true` to claim a message, stopping the walk.
type Handler = Box<dyn FnMut(EndpointId, &(dyn Any + Send + Sync)) -> bool + Send>;

/// Per-type-erased handler storage owned by whoever holds the bundle's
/// `Arc`. The stack only ever sees a [`Weak`] to this.
#[derive(Default)]
pub struct HandlerBundle {
    handlers: Mutex<HashMap<TypeKey, Handler>>,
    attached: Mutex<bool>,
}

impl HandlerBundle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers (or replaces) the handler for messages of type `T`.
    pub fn on<T, F>(&self, mut f: F)
    where
        T: Any + Send + Sync,
        F: FnMut(EndpointId, &T) -> bool + Send + 'static,
    {
        let key = crate::type_key::type_key::<T>();
        let wrapped: Handler = Box::new(move |from, payload| {
            match payload.downcast_ref::<T>() {
                Some(value) => f(from, value),
                None => false,
            }
        });
        self.handlers.lock().insert(key, wrapped);
    }

    fn take(&self, key: TypeKey) -> Option<Handler> {
        self.handlers.lock().remove(&key)
    }

    fn restore(&self, key: TypeKey, handler: Handler) {
        self.handlers.lock().entry(key).or_insert(handler);
    }
}

/// Direction a [`StackEndpoint`] walks its bundles in for a given dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    TopDown,
    BottomUp,
}

struct Slot {
    bundle: Weak<HandlerBundle>,
}

/// An endpoint backed by an ordered stack of externally owned handler
/// bundles. Unlike [`super::endpoint::Endpoint`], a `StackEndpoint` does not
/// itself dispatch to a [`super::system::MessageSystem`]; it is meant to sit
/// behind one (wired up the same way any other handler is), composing UI- or
/// state-layer style "topmost handler wins" dispatch.
#[derive(Default)]
pub struct StackEndpoint {
    stack: Mutex<Vec<Slot>>,
    order: Mutex<HashMap<TypeKey, Order>>,
}

impl StackEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the walk direction used for messages of type `T`. Defaults to
    /// [`Order::TopDown`] (last pushed is tried first) when unset.
    pub fn set_order<T: Any + Send + Sync>(&self, order: Order) {
        let key = crate::type_key::type_key::<T>();
        self.order.lock().insert(key, order);
    }

    fn order_for(&self, key: TypeKey) -> Order {
        self.order.lock().get(&key).copied().unwrap_or(Order::TopDown)
    }

    /// Pushes `bundle` onto the top of the stack. Fails if `bundle` is
    /// already attached to some stack (this one or another).
    pub fn push(&self, bundle: &Arc<HandlerBundle>) -> bool {
        {
            let mut attached = bundle.attached.lock();
            if *attached {
                return false;
            }
            *attached = true;
        }
        self.stack.lock().push(Slot { bundle: Arc::downgrade(bundle) });
        true
    }

    /// Removes `bundle` from the stack. Safe to call from any thread,
    /// including one concurrently walking a snapshot: it only clears the
    /// weak slot, which the next dispatch scrubs.
    pub fn remove(&self, bundle: &Arc<HandlerBundle>) {
        *bundle.attached.lock() = false;
        let target = Arc::as_ptr(bundle);
        self.stack.lock().retain(|slot| match slot.bundle.upgrade() {
            Some(b) => !std::ptr::eq(Arc::as_ptr(&b), target),
            None => false,
        });
    }

    /// Dispatches a message of type `T` through the stack in its configured
    /// order, stopping at the first handler that claims it. Returns whether
    /// any handler claimed the message.
    pub fn dispatch<T: Any + Send + Sync>(&self, from: EndpointId, message: &T) -> bool {
        let key = crate::type_key::type_key::<T>();
        let order = self.order_for(key);

        let mut snapshot: Vec<Arc<HandlerBundle>> = {
            let mut stack = self.stack.lock();
            stack.retain(|slot| slot.bundle.upgrade().is_some());
            stack.iter().filter_map(|slot| slot.bundle.upgrade()).collect()
        };
        // `stack` holds bundles in push order (last pushed = top, at the
        // end of the vec), so TopDown walks it in reverse.
        if order == Order::TopDown {
            snapshot.reverse();
        }

        for bundle in snapshot {
            let Some(mut handler) = bundle.take(key) else { continue };
            let claimed = handler(from, message as &(dyn Any + Send + Sync));
            bundle.restore(key, handler);
            if claimed {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn top_down_order_stops_at_first_claim() {
        let stack = StackEndpoint::new();
        let bottom = HandlerBundle::new();
        let top = HandlerBundle::new();
        let bottom_hits = Arc::new(AtomicU32::new(0));
        {
            let c = Arc::clone(&bottom_hits);
            bottom.on::<i32, _>(move |_, _| {
                c.fetch_add(1, Ordering::SeqCst);
                true
            });
        }
        top.on::<i32, _>(|_, _| true);

        assert!(stack.push(&bottom));
        assert!(stack.push(&top));

        assert!(stack.dispatch(EndpointId(0), &7i32));
        assert_eq!(bottom_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unclaimed_falls_through_to_next_bundle() {
        let stack = StackEndpoint::new();
        let bottom = HandlerBundle::new();
        let top = HandlerBundle::new();
        bottom.on::<i32, _>(|_, _| true);
        top.on::<i32, _>(|_, _| false);
        assert!(stack.push(&bottom));
        assert!(stack.push(&top));
        assert!(stack.dispatch(EndpointId(0), &1i32));
    }

    #[test]
    fn dropped_bundle_is_scrubbed_from_stack() {
        let stack = StackEndpoint::new();
        {
            let bundle = HandlerBundle::new();
            bundle.on::<i32, _>(|_, _| true);
            assert!(stack.push(&bundle));
        }
        assert!(!stack.dispatch(EndpointId(0), &1i32));
        assert!(stack.stack.lock().is_empty());
    }

    #[test]
    fn pushing_an_already_attached_bundle_fails() {
        let s1 = StackEndpoint::new();
        let s2 = StackEndpoint::new();
        let bundle = HandlerBundle::new();
        assert!(s1.push(&bundle));
        assert!(!s2.push(&bundle));
    }
}
