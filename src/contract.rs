//! Context Constraints, Contracts, and the Validated Context gatekeeper.

use std::fmt;
use std::sync::OnceLock;

use compact_str::CompactString;
use parking_lot::Mutex;

use crate::context::Context;
use crate::type_key::{TypeInfo, TypeKey};

/// One of the five declared presence modes a [`Constraint`] enforces at the
/// edges of a [`ValidatedContext`]'s lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    InRequired,
    InOptional,
    OutRequired,
    OutOptional,
    Scoped,
}

/// An immutable declared presence rule for a single `(name, TypeKey)` slot.
#[derive(Clone)]
pub struct Constraint {
    presence: Presence,
    type_key: TypeKey,
    name: Option<CompactString>,
    type_name: CompactString,
    default: Option<(&'static TypeInfo, Box<dyn std::any::Any + Send + Sync>)>,
    name_only: bool,
}

impl fmt::Debug for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Constraint")
            .field("presence", &self.presence)
            .field("name", &self.name)
            .field("type_name", &self.type_name)
            .field("has_default", &self.default.is_some())
            .finish()
    }
}

impl Constraint {
    fn new(presence: Presence, type_key: TypeKey, name: Option<&str>, type_name: &str) -> Self {
        Self {
            presence,
            type_key,
            name: name.map(CompactString::new),
            type_name: CompactString::new(type_name),
            default: None,
            name_only: false,
        }
    }

    /// A constraint that matches any type under `name` (a name-only probe,
    /// analogous to a reader that only cares whether the slot is occupied).
    pub fn name_only(presence: Presence, name: &str) -> Self {
        let mut c = Self::new(presence, TypeKey::placeholder(name), Some(name), "<any>");
        c.name_only = true;
        c
    }

    pub fn in_required(type_key: TypeKey, name: Option<&str>, type_name: &str) -> Self {
        Self::new(Presence::InRequired, type_key, name, type_name)
    }

    pub fn out_required(type_key: TypeKey, name: Option<&str>, type_name: &str) -> Self {
        Self::new(Presence::OutRequired, type_key, name, type_name)
    }

    pub fn scoped(type_key: TypeKey, name: Option<&str>, type_name: &str) -> Self {
        Self::new(Presence::Scoped, type_key, name, type_name)
    }

    /// An IN-OPTIONAL constraint with no default: the value may be absent
    /// at acquisition and nothing is installed on its behalf.
    pub fn in_optional(type_key: TypeKey, name: Option<&str>, type_name: &str) -> Self {
        Self::new(Presence::InOptional, type_key, name, type_name)
    }

    /// An IN-OPTIONAL constraint with a default, cloned through `info` and
    /// installed if the slot is absent at acquisition.
    pub fn in_optional_with_default<T>(
        type_key: TypeKey,
        name: Option<&str>,
        type_name: &str,
        info: &'static TypeInfo,
        default: T,
    ) -> Self
    where
        T: std::any::Any + Send + Sync,
    {
        let mut c = Self::new(Presence::InOptional, type_key, name, type_name);
        c.default = Some((info, Box::new(default)));
        c
    }

    pub fn out_optional_with_default<T>(
        type_key: TypeKey,
        name: Option<&str>,
        type_name: &str,
        info: &'static TypeInfo,
        default: T,
    ) -> Self
    where
        T: std::any::Any + Send + Sync,
    {
        let mut c = Self::new(Presence::OutOptional, type_key, name, type_name);
        c.default = Some((info, Box::new(default)));
        c
    }

    pub fn out_optional(type_key: TypeKey, name: Option<&str>, type_name: &str) -> Self {
        Self::new(Presence::OutOptional, type_key, name, type_name)
    }

    pub fn presence(&self) -> Presence {
        self.presence
    }

    pub fn type_key(&self) -> TypeKey {
        self.type_key
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn matches(&self, name: Option<&str>, type_key: TypeKey) -> bool {
        self.name.as_deref() == name && (self.name_only || self.type_key == type_key)
    }

    fn exists_in(&self, ctx: &Context) -> bool {
        if self.name_only {
            self.name.as_deref().is_some_and(|n| ctx.name_exists(n))
        } else {
            ctx.exists_any(self.name(), self.type_key)
        }
    }

    fn install_default(&self, ctx: &Context) {
        if let Some((info, value)) = &self.default {
            let cloned = info
                .clone_erased(value.as_ref())
                .expect("a constraint default's TypeInfo must be cloneable");
            ctx.install_erased(self.name.as_deref(), self.type_key, info, cloned);
        }
    }
}

/// A compile-time-named, ordered list of [`Constraint`]s. Converting a
/// `Contract` into a [`ValidatedContext`] runs the same acquisition
/// procedure as any other constructor shape.
#[derive(Debug, Clone, Default)]
pub struct Contract {
    constraints: Vec<Constraint>,
}

impl Contract {
    pub fn new(constraints: Vec<Constraint>) -> Self {
        Self { constraints }
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }
}

/// The kind of denial reported to the global error callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractErrorKind {
    Construction,
    Completion,
    Access,
}

/// Why [`ValidatedContext::acquire`] (and its `_owned`/`_shared`/`from_contract`
/// siblings) refused to build a binding.
#[derive(Debug, Clone)]
pub enum AcquireError {
    /// An IN-REQUIRED slot had no entry at all.
    Missing { name: Option<CompactString>, type_name: CompactString },
    /// An IN-REQUIRED slot's name was occupied by a value of another type.
    WrongType { name: Option<CompactString>, type_name: CompactString },
}

impl fmt::Display for AcquireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing { name, type_name } => {
                write!(f, "IN-REQUIRED constraint on {name:?}:{type_name} missing at acquisition")
            }
            Self::WrongType { name, type_name } => {
                write!(f, "IN-REQUIRED constraint on {name:?}:{type_name} found a value of a different type at acquisition")
            }
        }
    }
}

impl std::error::Error for AcquireError {}

/// Why [`ValidatedContext::complete`] refused to release a binding: an
/// OUT-REQUIRED slot had no entry at release time.
#[derive(Debug, Clone)]
pub struct CompleteError {
    pub name: Option<CompactString>,
    pub type_name: CompactString,
}

impl fmt::Display for CompleteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OUT-REQUIRED constraint on {:?}:{} missing at release", self.name, self.type_name)
    }
}

impl std::error::Error for CompleteError {}

/// Installed process-wide via [`set_error_handler`]; invoked outside any
/// internal lock, so a handler that itself logs or escalates never
/// deadlocks the core.
pub type ErrorHandler = dyn Fn(ContractErrorKind, &str) + Send + Sync;

fn error_handler_slot() -> &'static Mutex<Option<Box<ErrorHandler>>> {
    static SLOT: OnceLock<Mutex<Option<Box<ErrorHandler>>>> = OnceLock::new();
    SLOT.get_or_init(|| Mutex::new(None))
}

/// Installs the single process-wide error callback, replacing any previous
/// one.
pub fn set_error_handler<F>(handler: F)
where
    F: Fn(ContractErrorKind, &str) + Send + Sync + 'static,
{
    *error_handler_slot().lock() = Some(Box::new(handler));
}

pub fn clear_error_handler() {
    *error_handler_slot().lock() = None;
}

fn report(kind: ContractErrorKind, message: impl fmt::Display) {
    let message = message.to_string();
    let handler = error_handler_slot().lock().take();
    match &handler {
        Some(f) => f(kind, &message),
        None => tracing::warn!(kind = ?kind, "{message}"),
    }
    if let Some(f) = handler {
        *error_handler_slot().lock() = Some(f);
    }
}

/// Owns or borrows a [`Context`] together with an ordered constraint list,
/// enforcing declared pre/postconditions at its edges.
///
/// Lifecycle: uninitialised → valid (after a successful [`ValidatedContext::acquire`]
/// family constructor) → uninitialised again (after [`ValidatedContext::complete`]).
/// While valid, reads and writes of keys outside the constraint list are
/// denied and reported to the process-wide error handler instead of
/// panicking.
pub struct ValidatedContext<'a> {
    binding: Option<Binding<'a>>,
    constraints: Vec<Constraint>,
}

enum Binding<'a> {
    Borrowed(&'a Context),
    Owned(Context),
    Shared(std::sync::Arc<Context>),
}

impl<'a> Binding<'a> {
    fn context(&self) -> &Context {
        match self {
            Binding::Borrowed(c) => c,
            Binding::Owned(c) => c,
            Binding::Shared(c) => c,
        }
    }
}

impl<'a> ValidatedContext<'a> {
    /// Acquires over a borrowed [`Context`] and constraint list.
    pub fn acquire(ctx: &'a Context, constraints: Vec<Constraint>) -> Result<Self, AcquireError> {
        Self::acquire_binding(Binding::Borrowed(ctx), constraints)
    }

    /// Acquires by taking ownership of `ctx`.
    pub fn acquire_owned(ctx: Context, constraints: Vec<Constraint>) -> Result<Self, AcquireError> {
        Self::acquire_binding(Binding::Owned(ctx), constraints)
    }

    /// Acquires over a reference-counted, shared [`Context`], yielding a
    /// `ValidatedContext<'static>` that does not borrow from any caller
    /// stack frame. Used where the context is owned jointly by several
    /// long-lived components, e.g. every registered state of a
    /// [`crate::state_machine::StateMachine`] sharing one base context.
    pub fn acquire_shared(ctx: std::sync::Arc<Context>, constraints: Vec<Constraint>) -> Result<ValidatedContext<'static>, AcquireError> {
        ValidatedContext::<'static>::acquire_binding(Binding::Shared(ctx), constraints)
    }

    /// Acquires from a [`Contract`] over a borrowed context.
    pub fn from_contract(ctx: &'a Context, contract: Contract) -> Result<Self, AcquireError> {
        Self::acquire(ctx, contract.constraints)
    }

    fn acquire_binding(binding: Binding<'a>, constraints: Vec<Constraint>) -> Result<Self, AcquireError> {
        let ctx = binding.context();
        for c in &constraints {
            if c.presence == Presence::InRequired && !c.exists_in(ctx) {
                let name = c.name.clone();
                let type_name = c.type_name.clone();
                let err = if c.name().is_some_and(|n| ctx.name_exists(n)) {
                    AcquireError::WrongType { name, type_name }
                } else {
                    AcquireError::Missing { name, type_name }
                };
                report(ContractErrorKind::Construction, &err);
                return Err(err);
            }
        }
        for c in &constraints {
            if c.presence == Presence::InOptional && c.default.is_some() {
                if !c.exists_in(ctx) {
                    c.install_default(ctx);
                }
            }
        }
        Ok(Self {
            binding: Some(binding),
            constraints,
        })
    }

    pub fn is_valid(&self) -> bool {
        self.binding.is_some()
    }

    fn find_constraint(&self, name: Option<&str>, type_key: TypeKey) -> Option<&Constraint> {
        self.constraints.iter().find(|c| c.matches(name, type_key))
    }

    pub fn get_value<T: std::any::Any + Clone + Send + Sync>(&self, name: Option<&str>) -> Option<T> {
        let ctx = self.binding.as_ref()?.context();
        let type_key = crate::type_key::type_key::<T>();
        if self.find_constraint(name, type_key).is_none() {
            report(
                ContractErrorKind::Access,
                format!("read of {name:?} not matched by any constraint"),
            );
            return None;
        }
        ctx.get_value(name)
    }

    pub fn install_value<T: std::any::Any + Send + Sync>(&self, name: Option<&str>, value: T) -> bool {
        let Some(binding) = self.binding.as_ref() else {
            return false;
        };
        let type_key = crate::type_key::type_key::<T>();
        let writable = self
            .find_constraint(name, type_key)
            .is_some_and(|c| matches!(c.presence, Presence::OutRequired | Presence::OutOptional | Presence::Scoped));
        if !writable {
            report(
                ContractErrorKind::Access,
                format!("write of {name:?} not matched by an OUT-/SCOPED constraint"),
            );
            return false;
        }
        binding.context().install_value(name, value);
        true
    }

    /// Runs the release ("complete") procedure: OUT-REQUIRED presence
    /// checks, OUT-OPTIONAL default installs, SCOPED clears, then unbinds.
    /// Idempotent: calling `complete` on an already-uninitialised instance
    /// succeeds trivially.
    pub fn complete(&mut self) -> Result<(), CompleteError> {
        let Some(binding) = self.binding.take() else {
            return Ok(());
        };
        let ctx = binding.context();
        for c in &self.constraints {
            if c.presence == Presence::OutRequired && !c.exists_in(ctx) {
                let err = CompleteError { name: c.name.clone(), type_name: c.type_name.clone() };
                report(ContractErrorKind::Completion, &err);
                // Re-bind so a caller who inspects the error can retry release.
                self.binding = Some(binding);
                return Err(err);
            }
        }
        for c in &self.constraints {
            if c.presence == Presence::OutOptional && c.default.is_some() && !c.exists_in(ctx) {
                c.install_default(ctx);
            }
        }
        for c in &self.constraints {
            if c.presence == Presence::Scoped {
                ctx.clear(c.name(), c.type_key);
            }
        }
        Ok(())
    }
}

impl<'a> Drop for ValidatedContext<'a> {
    fn drop(&mut self) {
        let _ = self.complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::type_key;

    #[test]
    fn in_optional_default_is_installed_on_acquire() {
        let ctx = Context::new();
        let constraints = vec![
            Constraint::in_optional_with_default(
                type_key::type_key::<i32>(),
                Some("width"),
                "i32",
                type_key::type_info::<i32>(),
                100,
            ),
            Constraint::in_optional_with_default(
                type_key::type_key::<i32>(),
                Some("height"),
                "i32",
                type_key::type_info::<i32>(),
                200,
            ),
        ];
        let vctx = ValidatedContext::acquire(&ctx, constraints).unwrap();
        assert_eq!(vctx.get_value::<i32>(Some("width")), Some(100));
        assert_eq!(vctx.get_value::<i32>(Some("height")), Some(200));
    }

    #[test]
    fn in_required_missing_fails_acquisition() {
        let ctx = Context::new();
        let constraints = vec![Constraint::in_required(type_key::type_key::<i32>(), Some("n"), "i32")];
        assert!(ValidatedContext::acquire(&ctx, constraints).is_err());
    }

    #[test]
    fn in_required_wrong_type_fails_acquisition_with_distinct_message() {
        let ctx = Context::new();
        ctx.install_new(Some("n"), "not an int".to_string());
        let constraints = vec![Constraint::in_required(type_key::type_key::<i32>(), Some("n"), "i32")];
        let err = ValidatedContext::acquire(&ctx, constraints).unwrap_err();
        assert!(matches!(err, AcquireError::WrongType { .. }));
    }

    #[test]
    fn write_outside_contract_is_denied() {
        let ctx = Context::new();
        let vctx = ValidatedContext::acquire(&ctx, vec![]).unwrap();
        assert!(!vctx.install_value::<i32>(Some("n"), 1));
        assert!(!ctx.exists::<i32>(Some("n")));
    }

    #[test]
    fn scoped_constraint_clears_on_release() {
        let ctx = Context::new();
        ctx.install_new(Some("tmp"), 5i32);
        let mut vctx = ValidatedContext::acquire(
            &ctx,
            vec![Constraint::scoped(type_key::type_key::<i32>(), Some("tmp"), "i32")],
        )
        .unwrap();
        assert!(vctx.install_value::<i32>(Some("tmp"), 9));
        vctx.complete().unwrap();
        assert!(!ctx.exists::<i32>(Some("tmp")));
    }

    #[test]
    fn out_required_missing_fails_release() {
        let ctx = Context::new();
        let mut vctx = ValidatedContext::acquire(
            &ctx,
            vec![Constraint::out_required(type_key::type_key::<i32>(), Some("result"), "i32")],
        )
        .unwrap();
        assert!(vctx.complete().is_err());
    }
}
