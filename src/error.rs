//! Error types for the dependency injection engine.

use thiserror::Error;

/// Dependency injection errors.
///
/// Covers both the registration surface (misuse detected while mutating a
/// container) and the resolution surface (failures while executing a
/// compiled plan). Messages carry the key, slot, scope level, or parameter
/// name needed to locate the problem.
///
/// # Examples
///
/// ```rust
/// use diwire::{Container, DiError};
///
/// let container = Container::builder().build();
/// match container.resolve::<String>() {
///     Err(DiError::NotRegistered(msg)) => {
///         assert!(msg.contains("String"));
///     }
///     _ => unreachable!(),
/// }
/// ```
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DiError {
    /// Misuse at the registration surface: bad arguments, reserved parameter
    /// names, invalid decorator kinds, inner-parameter ambiguity, or a scope
    /// contract broken by a later mutation.
    #[error("invalid registration: {0}")]
    InvalidRegistration(String),

    /// Internal plan invariant violated: missing payload for a spec kind,
    /// malformed scope metadata, circular planning dependency.
    #[error("invalid provider spec: {0}")]
    InvalidProviderSpec(String),

    /// A required dependency could not be inferred from the registration.
    #[error("cannot infer provider dependency: {0}")]
    DependencyInference(String),

    /// Resolve requested a key that is neither registered nor matchable via
    /// open generics nor a satisfiable wrapper.
    #[error("dependency not registered: {0}")]
    NotRegistered(String),

    /// Resolution requires a deeper scope than the current resolver, or an
    /// invalid scope transition was requested.
    #[error("scope mismatch: {0}")]
    ScopeMismatch(String),

    /// The sync path was selected but the dependency chain requires
    /// suspension (async provider, async lock, or async cleanup).
    #[error("async dependency in sync context: {0}")]
    AsyncInSyncContext(String),

    /// Closed generic arguments violate a type variable's constraints or
    /// bound, or substitution left free variables behind.
    #[error("invalid generic type argument: {0}")]
    InvalidGenericArgument(String),

    /// A typed surface received a value of the wrong runtime type.
    #[error("type mismatch for {0}")]
    TypeMismatch(&'static str),
}

/// Result type for DI operations.
pub type DiResult<T> = Result<T, DiError>;

impl DiError {
    pub(crate) fn not_registered(what: impl std::fmt::Display) -> Self {
        DiError::NotRegistered(what.to_string())
    }

    pub(crate) fn invalid_registration(msg: impl Into<String>) -> Self {
        DiError::InvalidRegistration(msg.into())
    }

    pub(crate) fn invalid_spec(msg: impl Into<String>) -> Self {
        DiError::InvalidProviderSpec(msg.into())
    }

    pub(crate) fn scope_mismatch(msg: impl Into<String>) -> Self {
        DiError::ScopeMismatch(msg.into())
    }

    pub(crate) fn async_in_sync(msg: impl Into<String>) -> Self {
        DiError::AsyncInSyncContext(msg.into())
    }
}
