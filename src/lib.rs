//! A type-keyed context store, a contract layer that validates access to
//! it, a hierarchical state machine built on both, and an in-process
//! publish/subscribe message bus, plus a reference-counted resource cache.

pub mod callback;
pub mod context;
pub mod contract;
pub mod message;
pub mod resource;
pub mod state_machine;
pub mod type_key;
pub mod weak;

pub use callback::{Callback, CallbackScope};
pub use context::Context;
pub use contract::{
    clear_error_handler, set_error_handler, AcquireError, CompleteError, Constraint, Contract, ContractErrorKind,
    ErrorHandler, Presence, ValidatedContext,
};
pub use message::{
    Dispatcher, Endpoint, EndpointId, HandlerBundle, ImmediateDispatcher, MessageSystem, Order, PollingDispatcher,
    QueuedMessage, StackEndpoint, SystemHandle, ThreadedDispatcher, BROADCAST, NO_ENDPOINT,
};
pub use resource::{ReleasePolicy, ResourcePtr, ResourceSet, ResourceSystem, VisibilityPolicy};
pub use state_machine::{state_key, GameStateImpl, Lifetime, StateMachine, StateSet, Trace, TraceKind, TraceLevel};
pub use type_key::{type_info, type_key, TypeInfo, TypeKey};
pub use weak::{WeakLock, WeakPtr, WeakScope};
