//! Provider specs: the normalized registration record consumed by the
//! planner, plus dependency declarations and their validation.

pub mod args;

use std::fmt;
use std::sync::Arc;

use crate::error::{DiError, DiResult};
use crate::internal::BoxFuture;
use crate::key::Key;
use crate::lifetime::{Lifetime, LockMode};
use crate::scope::is_identifier;

pub use args::{
    AsyncProviderHandle, ProviderHandle, RawAsyncProviderHandle, RawProviderHandle, ResolvedArgs,
    Value,
};

/// How a provider produces its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// A pre-built value; behaves scoped-at-root with no construction cost.
    Instance,
    /// A concrete type constructed from its dependencies.
    ConcreteType,
    /// A factory callable.
    Factory,
    /// A callable yielding a value plus a teardown to run at scope exit.
    Generator,
    /// A factory producing a disposable resource entered on construction
    /// and exited at scope exit.
    ContextManager,
}

impl ProviderKind {
    pub(crate) fn label(self) -> &'static str {
        match self {
            ProviderKind::Instance => "instance",
            ProviderKind::ConcreteType => "concrete_type",
            ProviderKind::Factory => "factory",
            ProviderKind::Generator => "generator",
            ProviderKind::ContextManager => "context_manager",
        }
    }
}

pub(crate) type SyncCallFn = Arc<dyn Fn(&mut ResolvedArgs) -> DiResult<Value> + Send + Sync>;
pub(crate) type AsyncCallFn =
    Arc<dyn Fn(ResolvedArgs) -> BoxFuture<DiResult<Value>> + Send + Sync>;
pub(crate) type SyncResourceFn =
    Arc<dyn Fn(&mut ResolvedArgs) -> DiResult<(Value, Teardown)> + Send + Sync>;
pub(crate) type AsyncResourceFn =
    Arc<dyn Fn(ResolvedArgs) -> BoxFuture<DiResult<(Value, AsyncTeardown)>> + Send + Sync>;

/// Teardown callback registered by a generator or context-manager provider;
/// runs at the owning scope's exit, LIFO.
pub type Teardown = Box<dyn FnOnce() -> DiResult<()> + Send>;

/// Boxed future returned by async teardown callbacks.
pub type TeardownFuture =
    std::pin::Pin<Box<dyn std::future::Future<Output = DiResult<()>> + Send>>;

/// Async teardown callback; runs at the owning scope's async exit, LIFO.
pub type AsyncTeardown = Box<dyn FnOnce() -> TeardownFuture + Send>;

/// The payload invoked by the execution layer. Exactly one payload shape
/// exists per spec; resource shapes additionally yield a teardown.
#[derive(Clone)]
pub(crate) enum ProviderPayload {
    Instance(Value),
    SyncCall(SyncCallFn),
    AsyncCall(AsyncCallFn),
    SyncResource(SyncResourceFn),
    AsyncResource(AsyncResourceFn),
}

impl ProviderPayload {
    pub(crate) fn is_async(&self) -> bool {
        matches!(
            self,
            ProviderPayload::AsyncCall(_) | ProviderPayload::AsyncResource(_)
        )
    }

    pub(crate) fn has_cleanup(&self) -> bool {
        matches!(
            self,
            ProviderPayload::SyncResource(_) | ProviderPayload::AsyncResource(_)
        )
    }
}

impl fmt::Debug for ProviderPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProviderPayload::Instance(_) => "Instance",
            ProviderPayload::SyncCall(_) => "SyncCall",
            ProviderPayload::AsyncCall(_) => "AsyncCall",
            ProviderPayload::SyncResource(_) => "SyncResource",
            ProviderPayload::AsyncResource(_) => "AsyncResource",
        };
        f.write_str(label)
    }
}

/// Wraps a typed sync factory into the uniform payload shape.
pub(crate) fn sync_call_payload<T, F>(call: F) -> ProviderPayload
where
    T: Send + Sync + 'static,
    F: Fn(&mut ResolvedArgs) -> DiResult<T> + Send + Sync + 'static,
{
    ProviderPayload::SyncCall(Arc::new(move |args| call(args).map(Value::new)))
}

/// Wraps a typed async factory into the uniform payload shape.
pub(crate) fn async_call_payload<T, F, Fut>(call: F) -> ProviderPayload
where
    T: Send + Sync + 'static,
    F: Fn(ResolvedArgs) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = DiResult<T>> + Send + 'static,
{
    ProviderPayload::AsyncCall(Arc::new(move |args| {
        let future = call(args);
        Box::pin(async move { future.await.map(Value::new) }) as BoxFuture<DiResult<Value>>
    }))
}

/// Wraps a typed generator (value plus teardown) into the uniform payload
/// shape.
pub(crate) fn sync_resource_payload<T, F>(generator: F) -> ProviderPayload
where
    T: Send + Sync + 'static,
    F: Fn(&mut ResolvedArgs) -> DiResult<(T, Teardown)> + Send + Sync + 'static,
{
    ProviderPayload::SyncResource(Arc::new(move |args| {
        generator(args).map(|(value, teardown)| (Value::new(value), teardown))
    }))
}

/// Wraps a typed async generator into the uniform payload shape.
pub(crate) fn async_resource_payload<T, F, Fut>(generator: F) -> ProviderPayload
where
    T: Send + Sync + 'static,
    F: Fn(ResolvedArgs) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = DiResult<(T, AsyncTeardown)>> + Send + 'static,
{
    ProviderPayload::AsyncResource(Arc::new(move |args| {
        let future = generator(args);
        Box::pin(async move {
            future
                .await
                .map(|(value, teardown)| (Value::new(value), teardown))
        }) as BoxFuture<DiResult<(Value, AsyncTeardown)>>
    }))
}

/// Wraps a disposable-resource factory: the value is entered on
/// construction and its [`Dispose`](crate::traits::Dispose) hook becomes
/// the teardown.
pub(crate) fn context_manager_payload<T, F>(factory: F) -> ProviderPayload
where
    T: crate::traits::Dispose,
    F: Fn(&mut ResolvedArgs) -> DiResult<T> + Send + Sync + 'static,
{
    ProviderPayload::SyncResource(Arc::new(move |args| {
        let resource = Arc::new(factory(args)?);
        let teardown = {
            let resource = resource.clone();
            Box::new(move || {
                resource.dispose();
                Ok(())
            }) as Teardown
        };
        Ok((Value::from_arc(resource), teardown))
    }))
}

/// Async counterpart of [`context_manager_payload`], wiring
/// [`AsyncDispose`](crate::traits::AsyncDispose).
pub(crate) fn async_context_manager_payload<T, F, Fut>(factory: F) -> ProviderPayload
where
    T: crate::traits::AsyncDispose,
    F: Fn(ResolvedArgs) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = DiResult<T>> + Send + 'static,
{
    ProviderPayload::AsyncResource(Arc::new(move |args| {
        let future = factory(args);
        Box::pin(async move {
            let resource = Arc::new(future.await?);
            let teardown = {
                let resource = resource.clone();
                Box::new(move || {
                    Box::pin(async move {
                        resource.dispose().await;
                        Ok(())
                    }) as TeardownFuture
                }) as AsyncTeardown
            };
            Ok((Value::from_arc(resource), teardown))
        }) as BoxFuture<DiResult<(Value, AsyncTeardown)>>
    }))
}

/// Positional shape of a declared provider parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ParamKind {
    /// Wired positionally; the name is informational only.
    PositionalOnly,
    /// Wired by keyword, accepts positional form. The common default.
    PositionalOrKeyword,
    /// Star-args position; optional literals become an empty tuple.
    VarPositional,
    /// Wired by keyword only.
    KeywordOnly,
    /// Star-kwargs position; optional literals become an empty map.
    VarKeyword,
}

impl ParamKind {
    fn is_var(self) -> bool {
        matches!(self, ParamKind::VarPositional | ParamKind::VarKeyword)
    }
}

/// Descriptor for one declared provider parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamDescriptor {
    pub(crate) name: &'static str,
    pub(crate) kind: ParamKind,
    pub(crate) has_default: bool,
}

impl ParamDescriptor {
    /// The parameter name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The parameter's positional shape.
    pub fn kind(&self) -> ParamKind {
        self.kind
    }

    /// Whether the parameter declares a default the payload can fall back
    /// to when an optional dependency is omitted.
    pub fn has_default(&self) -> bool {
        self.has_default
    }
}

/// One declared dependency of a provider: a key (possibly wrapper-annotated)
/// plus the parameter it feeds.
///
/// # Examples
///
/// ```rust
/// use diwire::{Dependency, Key};
///
/// struct Engine;
/// struct Cache;
///
/// let engine = Dependency::of::<Engine>("engine");
/// let cache = Dependency::maybe::<Cache>("cache").with_default();
/// assert_eq!(engine.param().name(), "engine");
/// assert!(cache.key().as_wrapper().is_some());
/// ```
#[derive(Debug, Clone)]
pub struct Dependency {
    pub(crate) key: Key,
    pub(crate) param: ParamDescriptor,
}

impl Dependency {
    fn with_key(name: &'static str, key: Key) -> Self {
        Dependency {
            key,
            param: ParamDescriptor {
                name,
                kind: ParamKind::PositionalOrKeyword,
                has_default: false,
            },
        }
    }

    /// A required dependency on the concrete type `T`.
    pub fn of<T: 'static>(name: &'static str) -> Self {
        Dependency::with_key(name, Key::of::<T>())
    }

    /// A required dependency on an explicit key.
    pub fn keyed(name: &'static str, key: Key) -> Self {
        Dependency::with_key(name, key)
    }

    /// An optional (`Maybe`) dependency on `T`.
    pub fn maybe<T: 'static>(name: &'static str) -> Self {
        Dependency::with_key(name, Key::of::<T>().maybe())
    }

    /// A lazy sync provider handle for `T`.
    pub fn provider<T: 'static>(name: &'static str) -> Self {
        Dependency::with_key(name, Key::of::<T>().lazy())
    }

    /// A lazy async provider handle for `T`.
    pub fn async_provider<T: 'static>(name: &'static str) -> Self {
        Dependency::with_key(name, Key::of::<T>().lazy_async())
    }

    /// A context lookup for `T`.
    pub fn from_context<T: 'static>(name: &'static str) -> Self {
        Dependency::with_key(name, Key::of::<T>().from_context())
    }

    /// All bindings whose canonical base key is `T`, in registration order.
    pub fn all<T: 'static>(name: &'static str) -> Self {
        Dependency::with_key(name, Key::of::<T>().all())
    }

    /// Marks the parameter as carrying a default the payload falls back to.
    pub fn with_default(mut self) -> Self {
        self.param.has_default = true;
        self
    }

    /// Marks the parameter positional-only.
    pub fn positional_only(mut self) -> Self {
        self.param.kind = ParamKind::PositionalOnly;
        self
    }

    /// Marks the parameter keyword-only.
    pub fn keyword_only(mut self) -> Self {
        self.param.kind = ParamKind::KeywordOnly;
        self
    }

    /// Marks the parameter as the star-args position.
    pub fn var_positional(mut self) -> Self {
        self.param.kind = ParamKind::VarPositional;
        self
    }

    /// Marks the parameter as the star-kwargs position.
    pub fn var_keyword(mut self) -> Self {
        self.param.kind = ParamKind::VarKeyword;
        self
    }

    /// The dependency key, including wrapper annotations.
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// The parameter descriptor.
    pub fn param(&self) -> &ParamDescriptor {
        &self.param
    }
}

/// Normalized provider record. Created during registration, mutated only by
/// key replacement; the slot is assigned once and survives replacement.
#[derive(Clone)]
pub(crate) struct ProviderSpec {
    pub(crate) key: Key,
    pub(crate) kind: ProviderKind,
    pub(crate) payload: ProviderPayload,
    pub(crate) lifetime: Lifetime,
    pub(crate) scope_level: u32,
    pub(crate) scope_name: &'static str,
    pub(crate) is_async: bool,
    pub(crate) lock_mode: LockMode,
    pub(crate) dependencies: Vec<Dependency>,
    pub(crate) needs_cleanup: bool,
    pub(crate) slot: u32,
}

impl ProviderSpec {
    /// Instance kinds cache regardless of lifetime.
    pub(crate) fn is_cached(&self) -> bool {
        self.kind == ProviderKind::Instance || self.lifetime != Lifetime::Transient
    }
}

impl fmt::Debug for ProviderSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSpec")
            .field("key", &self.key)
            .field("kind", &self.kind.label())
            .field("lifetime", &self.lifetime)
            .field("scope", &self.scope_name)
            .field("slot", &self.slot)
            .field("is_async", &self.is_async)
            .field("needs_cleanup", &self.needs_cleanup)
            .finish()
    }
}

/// Validates a declared dependency list: unique valid parameter names,
/// at most one star parameter of each kind, and declaration order matching
/// the positional grammar (positional-only, then positional-or-keyword,
/// then star-args, then keyword-only, then star-kwargs).
pub(crate) fn validate_dependencies(key: &Key, dependencies: &[Dependency]) -> DiResult<()> {
    let mut seen: Vec<&'static str> = Vec::with_capacity(dependencies.len());
    let mut var_positional = false;
    let mut var_keyword = false;
    let mut last_kind = ParamKind::PositionalOnly;

    for dependency in dependencies {
        let param = &dependency.param;
        if !param.kind.is_var() && !is_identifier(param.name) {
            return Err(DiError::invalid_registration(format!(
                "provider for {key}: parameter name '{}' is not a valid identifier",
                param.name
            )));
        }
        if seen.contains(&param.name) {
            return Err(DiError::invalid_registration(format!(
                "provider for {key}: duplicate parameter name '{}'",
                param.name
            )));
        }
        seen.push(param.name);

        match param.kind {
            ParamKind::VarPositional => {
                if var_positional {
                    return Err(DiError::invalid_registration(format!(
                        "provider for {key}: multiple star-args parameters"
                    )));
                }
                var_positional = true;
            }
            ParamKind::VarKeyword => {
                if var_keyword {
                    return Err(DiError::invalid_registration(format!(
                        "provider for {key}: multiple star-kwargs parameters"
                    )));
                }
                var_keyword = true;
            }
            _ => {}
        }

        if param.kind < last_kind {
            return Err(DiError::invalid_registration(format!(
                "provider for {key}: parameter '{}' declared out of order",
                param.name
            )));
        }
        last_kind = param.kind;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct A;
    struct B;

    #[test]
    fn validate_accepts_ordered_unique_dependencies() {
        let key = Key::of::<A>();
        let deps = vec![
            Dependency::of::<A>("first").positional_only(),
            Dependency::of::<B>("second"),
            Dependency::maybe::<B>("third").keyword_only(),
        ];
        assert!(validate_dependencies(&key, &deps).is_ok());
    }

    #[test]
    fn validate_rejects_duplicate_names() {
        let key = Key::of::<A>();
        let deps = vec![Dependency::of::<A>("dup"), Dependency::of::<B>("dup")];
        assert!(matches!(
            validate_dependencies(&key, &deps),
            Err(DiError::InvalidRegistration(_))
        ));
    }

    #[test]
    fn validate_rejects_out_of_order_kinds() {
        let key = Key::of::<A>();
        let deps = vec![
            Dependency::of::<A>("kw").keyword_only(),
            Dependency::of::<B>("pos"),
        ];
        assert!(matches!(
            validate_dependencies(&key, &deps),
            Err(DiError::InvalidRegistration(_))
        ));
    }

    #[test]
    fn validate_rejects_invalid_identifiers() {
        let key = Key::of::<A>();
        let deps = vec![Dependency::of::<A>("not valid")];
        assert!(matches!(
            validate_dependencies(&key, &deps),
            Err(DiError::InvalidRegistration(_))
        ));
    }

    #[test]
    fn validate_rejects_double_star_args() {
        let key = Key::of::<A>();
        let deps = vec![
            Dependency::of::<A>("rest").var_positional(),
            Dependency::of::<B>("more").var_positional(),
        ];
        assert!(matches!(
            validate_dependencies(&key, &deps),
            Err(DiError::InvalidRegistration(_))
        ));
    }
}
