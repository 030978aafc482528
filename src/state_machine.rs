//! Hierarchical state composition with ordered transitions and
//! contract-gated activation.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};

use crate::context::Context;
use crate::contract::{Constraint, ValidatedContext};
use crate::type_key::{self, TypeKey};

/// A node's declared lifetime: GLOBAL states are instantiated once at
/// registration and never destroyed; ACTIVE states are constructed on
/// entry and destroyed on exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    Global,
    Active,
}

/// The set of parents (or siblings) a state is permitted to appear under.
#[derive(Debug, Clone)]
pub enum StateSet {
    None,
    All,
    Only(Vec<TypeKey>),
}

impl StateSet {
    fn allows(&self, key: Option<TypeKey>) -> bool {
        match (self, key) {
            (StateSet::None, None) => true,
            (StateSet::None, Some(_)) => false,
            (StateSet::All, _) => true,
            (StateSet::Only(keys), Some(k)) => keys.contains(&k),
            (StateSet::Only(_), None) => false,
        }
    }
}

/// User-implemented behaviour for a registered state.
pub trait GameStateImpl: Any + Send + Sync {
    fn on_init(&mut self, _ctx: &ValidatedContext<'_>) {}
    fn on_enter(&mut self, _ctx: &ValidatedContext<'_>) {}
    fn on_exit(&mut self, _ctx: &ValidatedContext<'_>) {}
    fn on_update(&mut self, _delta: f64, _ctx: &ValidatedContext<'_>) {}
    fn on_child_enter(&mut self, _child: TypeKey) {}
    fn on_child_exit(&mut self, _child: TypeKey) {}
}

type Factory = Box<dyn Fn() -> Box<dyn GameStateImpl> + Send + Sync>;

struct Registration {
    type_key: TypeKey,
    lifetime: Lifetime,
    valid_parents: StateSet,
    valid_siblings: StateSet,
    constraints: Vec<Constraint>,
    factory: Factory,
}

struct Instance {
    state: Box<dyn GameStateImpl>,
    context: ValidatedContext<'static>,
}

struct Node {
    registration: Registration,
    instance: Option<Instance>,
    active: bool,
    parent: Option<TypeKey>,
    child: Option<TypeKey>,
    epoch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceKind {
    ExitContextFailed,
    ConstraintFailure,
    AbortChange,
    TransitionDenied,
    CompleteChange,
    Info,
}

impl TraceKind {
    pub fn is_error(self) -> bool {
        matches!(
            self,
            TraceKind::ExitContextFailed
                | TraceKind::ConstraintFailure
                | TraceKind::AbortChange
                | TraceKind::TransitionDenied
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TraceLevel {
    None,
    Error,
    Info,
    Verbose,
}

pub struct Trace {
    pub kind: TraceKind,
    pub parent: Option<TypeKey>,
    pub state: Option<TypeKey>,
    pub source: &'static str,
    pub message: Option<String>,
}

impl fmt::Debug for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trace")
            .field("kind", &self.kind)
            .field("source", &self.source)
            .field("message", &self.message)
            .finish()
    }
}

type TraceHandler = dyn Fn(&Trace) + Send + Sync;

#[derive(Clone, Copy, PartialEq, Eq)]
struct PendingTransition {
    parent: Option<TypeKey>,
    new_state: Option<TypeKey>,
}

struct Shared {
    nodes: Mutex<HashMap<TypeKey, Node>>,
    top: Mutex<Option<TypeKey>>,
    pending: Mutex<Option<PendingTransition>>,
    trace_level: Mutex<TraceLevel>,
    trace_handler: Mutex<Option<Box<TraceHandler>>>,
    update_guard: ReentrantMutex<()>,
}

/// Hierarchical registry of states and the single active chain through
/// them. `StateMachine` is built over a base [`Context`] shared by every
/// registered state's constraint list.
pub struct StateMachine {
    base_context: Arc<Context>,
    shared: Shared,
}

impl StateMachine {
    pub fn new(base_context: Context) -> Self {
        Self {
            base_context: Arc::new(base_context),
            shared: Shared {
                nodes: Mutex::new(HashMap::new()),
                top: Mutex::new(None),
                pending: Mutex::new(None),
                trace_level: Mutex::new(TraceLevel::Info),
                trace_handler: Mutex::new(None),
                update_guard: ReentrantMutex::new(()),
            },
        }
    }

    pub fn set_trace_level(&self, level: TraceLevel) {
        *self.shared.trace_level.lock() = level;
    }

    /// Composes `handler` with any previously installed handler; both run,
    /// in registration order.
    pub fn add_trace_handler<F>(&self, handler: F)
    where
        F: Fn(&Trace) + Send + Sync + 'static,
    {
        let mut slot = self.shared.trace_handler.lock();
        let previous = slot.take();
        *slot = Some(Box::new(move |trace: &Trace| {
            if let Some(prev) = &previous {
                prev(trace);
            }
            handler(trace);
        }));
    }

    fn trace(&self, kind: TraceKind, parent: Option<TypeKey>, state: Option<TypeKey>, source: &'static str, message: Option<String>) {
        let level = *self.shared.trace_level.lock();
        let visible = match level {
            TraceLevel::None => false,
            TraceLevel::Error => kind.is_error(),
            TraceLevel::Info => true,
            TraceLevel::Verbose => true,
        };
        if !visible {
            return;
        }
        let trace = Trace { kind, parent, state, source, message };
        if let Some(handler) = self.shared.trace_handler.lock().as_ref() {
            handler(&trace);
        } else {
            tracing::event!(
                if kind.is_error() { tracing::Level::WARN } else { tracing::Level::DEBUG },
                kind = ?trace.kind,
                source = trace.source,
                message = trace.message.as_deref().unwrap_or(""),
            );
        }
    }

    /// Registers a state type. If `lifetime` is [`Lifetime::Global`], the
    /// instance is constructed immediately and `on_init` runs before this
    /// call returns.
    pub fn register<F>(
        &self,
        type_key: TypeKey,
        lifetime: Lifetime,
        valid_parents: StateSet,
        valid_siblings: StateSet,
        constraints: Vec<Constraint>,
        factory: F,
    ) where
        F: Fn() -> Box<dyn GameStateImpl> + Send + Sync + 'static,
    {
        let registration = Registration {
            type_key,
            lifetime,
            valid_parents,
            valid_siblings,
            constraints,
            factory: Box::new(factory),
        };
        let mut node = Node {
            registration,
            instance: None,
            active: false,
            parent: None,
            child: None,
            epoch: 0,
        };
        if lifetime == Lifetime::Global {
            let mut state = (node.registration.factory)();
            let ctx = self.build_context_for(&node.registration);
            match ctx {
                Ok(ctx) => {
                    state.on_init(&ctx);
                    node.instance = Some(Instance { state, context: ctx });
                }
                Err(msg) => {
                    self.trace(TraceKind::ConstraintFailure, None, Some(type_key), "register", Some(msg.to_string()));
                }
            }
        }
        self.shared.nodes.lock().insert(type_key, node);
    }

    fn build_context_for(&self, registration: &Registration) -> Result<ValidatedContext<'static>, crate::contract::AcquireError> {
        ValidatedContext::acquire_shared(Arc::clone(&self.base_context), registration.constraints.clone())
    }

    pub fn top(&self) -> Option<TypeKey> {
        *self.shared.top.lock()
    }

    pub fn is_active(&self, type_key: TypeKey) -> bool {
        self.shared
            .nodes
            .lock()
            .get(&type_key)
            .map(|n| n.active)
            .unwrap_or(false)
    }

    /// Requests a transition to `new_state` under `parent`. Dedups against
    /// an identical pending request; a differing request overwrites it and
    /// emits an "abort" trace for the one it replaces.
    pub fn change_state(&self, parent: Option<TypeKey>, new_state: Option<TypeKey>) -> bool {
        let requested = PendingTransition { parent, new_state };
        let nodes = self.shared.nodes.lock();

        if let Some(parent) = parent {
            match nodes.get(&parent) {
                Some(n) if n.active => {}
                _ => {
                    drop(nodes);
                    self.trace(TraceKind::TransitionDenied, Some(parent), new_state, "change_state", Some("parent not active".into()));
                    return false;
                }
            }
        }
        if let Some(new_state) = new_state {
            match nodes.get(&new_state) {
                Some(n) if !n.active => {}
                _ => {
                    drop(nodes);
                    self.trace(TraceKind::TransitionDenied, parent, Some(new_state), "change_state", Some("new state not registered or already active".into()));
                    return false;
                }
            }
        }

        let current_child = parent.and_then(|p| nodes.get(&p).and_then(|n| n.child)).or_else(|| {
            if parent.is_none() {
                *self.shared.top.lock()
            } else {
                None
            }
        });
        if current_child == new_state {
            drop(nodes);
            return true;
        }

        if let Some(sibling) = current_child {
            if let Some(new_state) = new_state {
                let siblings_ok = nodes
                    .get(&sibling)
                    .map(|n| n.registration.valid_siblings.allows(Some(new_state)))
                    .unwrap_or(true);
                if !siblings_ok {
                    drop(nodes);
                    self.trace(TraceKind::TransitionDenied, parent, Some(new_state), "change_state", Some("sibling set rejects new state".into()));
                    return false;
                }
            }
        }

        if let Some(new_state) = new_state {
            if let Some(parent) = parent {
                let parent_ok = nodes
                    .get(&new_state)
                    .map(|n| n.registration.valid_parents.allows(Some(parent)))
                    .unwrap_or(false);
                if !parent_ok {
                    drop(nodes);
                    self.trace(TraceKind::TransitionDenied, Some(parent), Some(new_state), "change_state", Some("valid-parent set rejects parent".into()));
                    return false;
                }
            }
        }
        drop(nodes);

        let mut pending = self.shared.pending.lock();
        if let Some(previous) = pending.replace(requested) {
            if previous != requested {
                self.trace(TraceKind::AbortChange, previous.parent, previous.new_state, "change_state", Some("superseded by a newer request".into()));
            }
        }
        true
    }

    /// Convenience for `change_state(None, state)`.
    pub fn change_top_state(&self, new_state: Option<TypeKey>) -> bool {
        self.change_state(None, new_state)
    }

    /// Runs the outer update loop: applies any pending transition, then
    /// walks the active chain root-first invoking `on_update`, repeating
    /// while a transition is pending.
    pub fn update(&self, delta: f64) {
        let Some(_guard) = self.shared.update_guard.try_lock() else {
            tracing::warn!("StateMachine::update re-entered from the same call stack");
            return;
        };

        static EPOCH: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);
        loop {
            while self.shared.pending.lock().is_some() {
                self.apply_transitions();
            }
            let update_id = EPOCH.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let chain = self.active_chain_root_first();
            let mut transitioned = false;
            for key in chain {
                let already = {
                    let mut nodes = self.shared.nodes.lock();
                    match nodes.get_mut(&key) {
                        Some(n) if n.active && n.epoch != update_id => {
                            n.epoch = update_id;
                            false
                        }
                        _ => true,
                    }
                };
                if already {
                    continue;
                }
                self.invoke_on_update(key, delta);
                if self.shared.pending.lock().is_some() {
                    transitioned = true;
                    break;
                }
            }
            if !transitioned && self.shared.pending.lock().is_none() {
                break;
            }
        }
    }

    fn active_chain_root_first(&self) -> Vec<TypeKey> {
        let mut chain = Vec::new();
        let mut current = *self.shared.top.lock();
        let nodes = self.shared.nodes.lock();
        while let Some(key) = current {
            chain.push(key);
            current = nodes.get(&key).and_then(|n| n.child);
        }
        chain
    }

    fn invoke_on_update(&self, key: TypeKey, delta: f64) {
        let mut nodes = self.shared.nodes.lock();
        let Some(node) = nodes.get_mut(&key) else { return };
        let Some(instance) = node.instance.as_mut() else { return };
        // SAFETY: the node is removed from `nodes` conceptually for the
        // duration of the callback by virtue of holding the lock for this
        // scope only; `on_update` must not re-enter this StateMachine's
        // node map reentrantly (it may call `change_state`, which only
        // touches `pending`/`top` under their own locks).
        let state_ptr: *mut dyn GameStateImpl = instance.state.as_mut();
        let ctx_ptr: *const ValidatedContext<'static> = &instance.context;
        drop(nodes);
        unsafe { (&mut *state_ptr).on_update(delta, &*ctx_ptr) };
    }

    fn apply_transitions(&self) {
        let requested = *self.shared.pending.lock();
        let Some(requested) = requested else { return };

        let deepest = self.active_chain_root_first().last().copied();
        let mut cursor = deepest;
        loop {
            if cursor == requested.parent {
                break;
            }
            let Some(current) = cursor else { break };
            // `exit_one` clears `current`'s own `parent` field before
            // returning, so the next cursor must be captured beforehand —
            // otherwise the walk up to `requested.parent` stops after the
            // first (deepest) exit and never reaches shallower ancestors.
            let next = self.shared.nodes.lock().get(&current).and_then(|n| n.parent);
            if !self.exit_one(current) {
                return;
            }
            if *self.shared.pending.lock() != Some(requested) {
                return;
            }
            cursor = next;
        }

        let Some(new_key) = requested.new_state else {
            self.trace(TraceKind::CompleteChange, requested.parent, None, "apply_transitions", None);
            self.clear_pending_if_matches(requested);
            return;
        };

        let lifetime = {
            let nodes = self.shared.nodes.lock();
            let Some(node) = nodes.get(&new_key) else { return };
            node.registration.lifetime
        };

        let built_ctx = {
            let nodes = self.shared.nodes.lock();
            let Some(node) = nodes.get(&new_key) else { return };
            self.build_context_for(&node.registration)
        };
        let built_ctx = match built_ctx {
            Ok(ctx) => ctx,
            Err(msg) => {
                self.trace(TraceKind::ConstraintFailure, requested.parent, Some(new_key), "apply_transitions", Some(msg.to_string()));
                self.trace(TraceKind::AbortChange, requested.parent, Some(new_key), "apply_transitions", None);
                return;
            }
        };

        if let Some(parent) = requested.parent {
            let mut nodes = self.shared.nodes.lock();
            if let Some(parent_node) = nodes.get_mut(&parent) {
                if let Some(instance) = parent_node.instance.as_mut() {
                    instance.state.on_child_enter(new_key);
                }
            }
        }

        {
            let mut nodes = self.shared.nodes.lock();
            if let Some(parent) = requested.parent {
                if let Some(p) = nodes.get_mut(&parent) {
                    p.child = Some(new_key);
                }
            } else {
                *self.shared.top.lock() = Some(new_key);
            }
            if let Some(node) = nodes.get_mut(&new_key) {
                node.parent = requested.parent;
                node.active = true;
                if lifetime == Lifetime::Active {
                    let mut state = (node.registration.factory)();
                    state.on_init(&built_ctx);
                    node.instance = Some(Instance { state, context: built_ctx });
                } else if let Some(instance) = node.instance.as_mut() {
                    instance.context = built_ctx;
                }
            }
        }

        {
            let mut nodes = self.shared.nodes.lock();
            if let Some(node) = nodes.get_mut(&new_key) {
                if let Some(instance) = node.instance.as_mut() {
                    let state_ptr: *mut dyn GameStateImpl = instance.state.as_mut();
                    let ctx_ptr: *const ValidatedContext<'static> = &instance.context;
                    drop(nodes);
                    unsafe { (&mut *state_ptr).on_enter(&*ctx_ptr) };
                }
            }
        }

        self.clear_pending_if_matches(requested);
    }

    fn clear_pending_if_matches(&self, requested: PendingTransition) {
        let mut pending = self.shared.pending.lock();
        if *pending == Some(requested) {
            *pending = None;
        }
    }

    /// Exits `key`: clears its links/active flag, runs `on_exit` outside
    /// the node-table lock, completes its `ValidatedContext`, destroys the
    /// instance if `ACTIVE`, and notifies the parent. Returns `false` if the
    /// context failed to complete, telling the caller to abandon the pass.
    fn exit_one(&self, key: TypeKey) -> bool {
        let (parent, mut instance, lifetime) = {
            let mut nodes = self.shared.nodes.lock();
            let Some(node) = nodes.get_mut(&key) else { return true };
            let parent = node.parent.take();
            node.child = None;
            node.active = false;
            node.epoch = 0;
            let instance = node.instance.take();
            let lifetime = node.registration.lifetime;
            (parent, instance, lifetime)
        };

        if let Some(instance) = instance.as_mut() {
            instance.state.on_exit(&instance.context);
        }

        let mut ok = true;
        if let Some(instance) = instance.as_mut() {
            if instance.context.complete().is_err() {
                self.trace(TraceKind::ExitContextFailed, parent, Some(key), "exit_one", Some("exit context could not complete".into()));
                ok = false;
            }
        }

        if lifetime == Lifetime::Active {
            drop(instance);
        } else if let Some(instance) = instance {
            let mut nodes = self.shared.nodes.lock();
            if let Some(node) = nodes.get_mut(&key) {
                node.instance = Some(instance);
            }
        }

        if let Some(parent) = parent {
            let mut nodes = self.shared.nodes.lock();
            if let Some(parent_node) = nodes.get_mut(&parent) {
                if let Some(instance) = parent_node.instance.as_mut() {
                    instance.state.on_child_exit(key);
                }
            }
        }

        ok
    }
}

/// Convenience for declaring a `TypeKey` for a state type without an
/// explicit `type_key::type_key::<T>()` call at every registration site.
pub fn state_key<T: Any + Send + Sync>() -> TypeKey {
    type_key::type_key::<T>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct Title {
        enters: Arc<AtomicU32>,
        updates: Arc<AtomicU32>,
        exits: Arc<AtomicU32>,
    }
    impl GameStateImpl for Title {
        fn on_enter(&mut self, _ctx: &ValidatedContext<'_>) {
            self.enters.fetch_add(1, Ordering::SeqCst);
        }
        fn on_update(&mut self, _delta: f64, _ctx: &ValidatedContext<'_>) {
            self.updates.fetch_add(1, Ordering::SeqCst);
        }
        fn on_exit(&mut self, _ctx: &ValidatedContext<'_>) {
            self.exits.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Play {
        enters: Arc<AtomicU32>,
    }
    impl GameStateImpl for Play {
        fn on_enter(&mut self, _ctx: &ValidatedContext<'_>) {
            self.enters.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn title_then_play_transition_hierarchy() {
        let machine = StateMachine::new(Context::new());
        let title_enters = Arc::new(AtomicU32::new(0));
        let title_updates = Arc::new(AtomicU32::new(0));
        let title_exits = Arc::new(AtomicU32::new(0));
        let play_enters = Arc::new(AtomicU32::new(0));

        let title_key = state_key::<Title>();
        let play_key = state_key::<Play>();

        {
            let (e, u, x) = (title_enters.clone(), title_updates.clone(), title_exits.clone());
            machine.register(
                title_key,
                Lifetime::Active,
                StateSet::None,
                StateSet::Only(vec![play_key]),
                vec![],
                move || Box::new(Title { enters: e.clone(), updates: u.clone(), exits: x.clone() }),
            );
        }
        {
            let e = play_enters.clone();
            machine.register(
                play_key,
                Lifetime::Active,
                StateSet::None,
                StateSet::Only(vec![title_key]),
                vec![],
                move || Box::new(Play { enters: e.clone() }),
            );
        }

        assert!(machine.change_top_state(Some(title_key)));
        machine.update(0.1);
        assert_eq!(machine.top(), Some(title_key));
        assert_eq!(title_enters.load(Ordering::SeqCst), 1);
        assert_eq!(title_updates.load(Ordering::SeqCst), 1);

        assert!(machine.change_top_state(Some(play_key)));
        machine.update(0.2);
        assert_eq!(machine.top(), Some(play_key));
        assert_eq!(title_exits.load(Ordering::SeqCst), 1);
        assert_eq!(play_enters.load(Ordering::SeqCst), 1);
    }

    struct Counting {
        exits: Arc<AtomicU32>,
        child_exits: Arc<AtomicU32>,
    }
    impl GameStateImpl for Counting {
        fn on_exit(&mut self, _ctx: &ValidatedContext<'_>) {
            self.exits.fetch_add(1, Ordering::SeqCst);
        }
        fn on_child_exit(&mut self, _child: TypeKey) {
            self.child_exits.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn exit_walk_climbs_through_every_intermediate_active_ancestor() {
        struct Root;
        struct Mid;
        struct Leaf;

        let machine = StateMachine::new(Context::new());
        let root_key = state_key::<Root>();
        let mid_key = state_key::<Mid>();
        let leaf_key = state_key::<Leaf>();

        let root_exits = Arc::new(AtomicU32::new(0));
        let root_child_exits = Arc::new(AtomicU32::new(0));
        let mid_exits = Arc::new(AtomicU32::new(0));
        let mid_child_exits = Arc::new(AtomicU32::new(0));
        let leaf_exits = Arc::new(AtomicU32::new(0));

        {
            let (exits, child_exits) = (root_exits.clone(), root_child_exits.clone());
            machine.register(root_key, Lifetime::Active, StateSet::None, StateSet::All, vec![], move || {
                Box::new(Counting { exits: exits.clone(), child_exits: child_exits.clone() })
            });
        }
        {
            let (exits, child_exits) = (mid_exits.clone(), mid_child_exits.clone());
            machine.register(
                mid_key,
                Lifetime::Active,
                StateSet::Only(vec![root_key]),
                StateSet::All,
                vec![],
                move || Box::new(Counting { exits: exits.clone(), child_exits: child_exits.clone() }),
            );
        }
        {
            let exits = leaf_exits.clone();
            machine.register(
                leaf_key,
                Lifetime::Active,
                StateSet::Only(vec![mid_key]),
                StateSet::All,
                vec![],
                move || Box::new(Counting { exits: exits.clone(), child_exits: Arc::new(AtomicU32::new(0)) }),
            );
        }

        assert!(machine.change_top_state(Some(root_key)));
        machine.update(0.0);
        assert!(machine.change_state(Some(root_key), Some(mid_key)));
        machine.update(0.0);
        assert!(machine.change_state(Some(mid_key), Some(leaf_key)));
        machine.update(0.0);

        assert!(machine.is_active(root_key));
        assert!(machine.is_active(mid_key));
        assert!(machine.is_active(leaf_key));

        // Detach root's child: both `mid` and `leaf` must exit leaf-first,
        // even though only `leaf` is the deepest active descendant.
        assert!(machine.change_state(Some(root_key), None));
        machine.update(0.0);

        assert!(machine.is_active(root_key));
        assert!(!machine.is_active(mid_key), "an intermediate ancestor must not be left dangling active");
        assert!(!machine.is_active(leaf_key));
        assert_eq!(leaf_exits.load(Ordering::SeqCst), 1);
        assert_eq!(mid_exits.load(Ordering::SeqCst), 1, "mid must receive on_exit, not just leaf");
        assert_eq!(mid_child_exits.load(Ordering::SeqCst), 1);
        assert_eq!(root_child_exits.load(Ordering::SeqCst), 1);
        assert_eq!(root_exits.load(Ordering::SeqCst), 0, "root itself stays active");
    }

    #[test]
    fn duplicate_pending_transition_dedups() {
        let machine = StateMachine::new(Context::new());
        let title_key = state_key::<Title>();
        let e = Arc::new(AtomicU32::new(0));
        let u = Arc::new(AtomicU32::new(0));
        let x = Arc::new(AtomicU32::new(0));
        machine.register(title_key, Lifetime::Active, StateSet::None, StateSet::All, vec![], {
            let (e, u, x) = (e.clone(), u.clone(), x.clone());
            move || Box::new(Title { enters: e.clone(), updates: u.clone(), exits: x.clone() })
        });
        assert!(machine.change_top_state(Some(title_key)));
        assert!(machine.change_top_state(Some(title_key)));
    }
}
