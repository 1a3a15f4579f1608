//! Injection wrapper: wraps a callable so declared dependencies are
//! resolved by the container at call time.
//!
//! The wrapper hides injected parameters from the public call surface, may
//! open a scope automatically (inferred from the injected dependencies'
//! required scope level, or explicit), and merges caller arguments over
//! injected ones; caller arguments always win. The reserved parameter
//! names `diwire_resolver` and `diwire_context` are how the call supplies
//! an explicit resolver or context frame; the wrapped callable must not
//! declare them.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::container::Container;
use crate::error::{DiError, DiResult};
use crate::key::WrapperKind;
use crate::provider::args::ArgSlot;
use crate::provider::{Dependency, ResolvedArgs, Value};
use crate::registry::strip_maybe;
use crate::resolver::{Context, Resolver};
use crate::scope::Scope;

/// Parameter names reserved for the injection wrapper itself.
pub const RESERVED_RESOLVER_PARAM: &str = "diwire_resolver";
/// See [`RESERVED_RESOLVER_PARAM`].
pub const RESERVED_CONTEXT_PARAM: &str = "diwire_context";

/// Options for [`Container::inject`].
#[derive(Debug, Clone, Default)]
pub struct InjectOptions {
    pub(crate) scope: Option<Scope>,
    pub(crate) auto_open_scope: bool,
}

impl InjectOptions {
    /// Defaults: scope inferred from dependencies, auto-open enabled.
    pub fn new() -> Self {
        InjectOptions {
            scope: None,
            auto_open_scope: true,
        }
    }

    /// Pins the scope opened for calls instead of inferring it.
    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Disables automatic scope opening; resolution then happens on the
    /// resolver the call supplies (or the container's root).
    pub fn no_auto_open_scope(mut self) -> Self {
        self.auto_open_scope = false;
        self
    }
}

/// Scope contract captured by an injected callable; revalidated after every
/// container mutation.
pub(crate) struct InjectContract {
    pub(crate) name: &'static str,
    pub(crate) dependencies: Vec<Dependency>,
    pub(crate) declared_level: Option<u32>,
    pub(crate) required_level: AtomicU32,
}

/// Per-call inputs for an injected callable: an explicit resolver
/// (`diwire_resolver`), a context frame (`diwire_context`), and caller
/// argument overrides.
#[derive(Default)]
pub struct InjectCall {
    pub(crate) resolver: Option<Resolver>,
    pub(crate) context: Option<Context>,
    pub(crate) overrides: Vec<(&'static str, Value)>,
}

impl InjectCall {
    /// An empty call: container resolver, no context, no overrides.
    pub fn new() -> Self {
        InjectCall::default()
    }

    /// Supplies the resolver to resolve against (`diwire_resolver`).
    pub fn resolver(mut self, resolver: Resolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Supplies a context frame (`diwire_context`), attached to the scope
    /// the wrapper opens.
    pub fn context(mut self, context: Context) -> Self {
        self.context = Some(context);
        self
    }

    /// Overrides the injected argument `name` with a caller-provided value.
    /// Caller arguments always win over injected ones.
    pub fn arg<T: Send + Sync + 'static>(mut self, name: &'static str, value: T) -> Self {
        self.overrides.push((name, Value::new(value)));
        self
    }
}

/// Resolver and context handed to the wrapped callable.
pub struct InjectContext<'a> {
    pub(crate) resolver: &'a Resolver,
    pub(crate) context: Option<&'a Context>,
}

impl<'a> InjectContext<'a> {
    /// The resolver the call executes against.
    pub fn resolver(&self) -> &'a Resolver {
        self.resolver
    }

    /// The caller-supplied context frame, if any.
    pub fn context(&self) -> Option<&'a Context> {
        self.context
    }
}

pub(crate) type InjectFnPayload<R> =
    Arc<dyn Fn(InjectContext<'_>, &mut ResolvedArgs) -> DiResult<R> + Send + Sync>;

/// A callable wrapped by [`Container::inject`].
///
/// # Examples
///
/// ```rust
/// use diwire::{Container, Dependency, InjectCall, InjectOptions};
/// use std::sync::Arc;
///
/// struct Greeter {
///     prefix: &'static str,
/// }
///
/// let container = Container::builder().build();
/// container.add_instance(Greeter { prefix: "hello" }).unwrap();
///
/// let greet = container
///     .inject(
///         "greet",
///         vec![Dependency::of::<Greeter>("greeter")],
///         InjectOptions::new(),
///         |_ctx, args| {
///             let greeter = args.take::<Greeter>()?;
///             Ok(format!("{}, world", greeter.prefix))
///         },
///     )
///     .unwrap();
///
/// assert_eq!(greet.call().unwrap(), "hello, world");
/// ```
pub struct InjectedFn<R> {
    container: Container,
    contract: Arc<InjectContract>,
    options: InjectOptions,
    func: InjectFnPayload<R>,
}

impl<R> Clone for InjectedFn<R> {
    fn clone(&self) -> Self {
        InjectedFn {
            container: self.container.clone(),
            contract: self.contract.clone(),
            options: self.options.clone(),
            func: self.func.clone(),
        }
    }
}

impl<R: Send + Sync + 'static> InjectedFn<R> {
    pub(crate) fn new(
        container: Container,
        contract: Arc<InjectContract>,
        options: InjectOptions,
        func: InjectFnPayload<R>,
    ) -> Self {
        InjectedFn {
            container,
            contract,
            options,
            func,
        }
    }

    /// Calls with no explicit resolver, context, or overrides.
    pub fn call(&self) -> DiResult<R> {
        self.call_with(InjectCall::new())
    }

    /// Async form of [`InjectedFn::call`].
    pub async fn acall(&self) -> DiResult<R> {
        self.acall_with(InjectCall::new()).await
    }

    /// Calls the wrapped function, resolving injected arguments on the call
    /// resolver (opening a scope when required and enabled).
    pub fn call_with(&self, call: InjectCall) -> DiResult<R> {
        let (resolver, opened) = self.call_resolver(&call)?;
        let result = self.run_sync(&resolver, &call);
        self.finish(resolver, opened, result)
    }

    /// Async form of [`InjectedFn::call_with`]; resolves async dependencies
    /// and closes an auto-opened scope asynchronously.
    pub async fn acall_with(&self, call: InjectCall) -> DiResult<R> {
        let (resolver, opened) = self.call_resolver(&call)?;
        let result = self.run_async(&resolver, &call).await;
        if opened {
            let close_result = resolver.aclose().await;
            return match result {
                Ok(value) => close_result.map(|_| value),
                Err(error) => Err(error),
            };
        }
        result
    }

    fn finish(&self, resolver: Resolver, opened: bool, result: DiResult<R>) -> DiResult<R> {
        if opened {
            let close_result = resolver.close();
            return match result {
                Ok(value) => close_result.map(|_| value),
                Err(error) => Err(error),
            };
        }
        result
    }

    /// Picks the resolver: explicit `diwire_resolver`, or the container's
    /// compiled root (compiled lazily under the container lock, so
    /// concurrent first calls observe one plan). Opens the contract's scope
    /// when the resolver is too shallow and auto-open is enabled.
    fn call_resolver(&self, call: &InjectCall) -> DiResult<(Resolver, bool)> {
        let base = match &call.resolver {
            Some(resolver) => resolver.clone(),
            None => self.container.compile()?,
        };
        let required = self.contract.required_level.load(Ordering::Acquire);
        if !self.options.auto_open_scope || base.scope().level() >= required {
            return Ok((base, false));
        }
        let target = match self.options.scope {
            Some(scope) => scope,
            None => self
                .container
                .scope_by_level(required)
                .ok_or_else(|| {
                    DiError::scope_mismatch(format!(
                        "injected callable '{}' requires scope level {required}, which has \
                         no scope in this container",
                        self.contract.name
                    ))
                })?,
        };
        let opened = match &call.context {
            Some(context) => base.enter_scope_with_context(Some(target), context.clone())?,
            None => base.enter_scope(Some(target))?,
        };
        Ok((opened, true))
    }

    fn run_sync(&self, resolver: &Resolver, call: &InjectCall) -> DiResult<R> {
        let mut args = self.collect_sync(resolver, call)?;
        for (name, value) in &call.overrides {
            args.override_named(name, value.clone());
        }
        let ctx = InjectContext {
            resolver,
            context: call.context.as_ref(),
        };
        (self.func)(ctx, &mut args)
    }

    async fn run_async(&self, resolver: &Resolver, call: &InjectCall) -> DiResult<R> {
        let mut args = self.collect_async(resolver, call).await?;
        for (name, value) in &call.overrides {
            args.override_named(name, value.clone());
        }
        let ctx = InjectContext {
            resolver,
            context: call.context.as_ref(),
        };
        (self.func)(ctx, &mut args)
    }

    fn collect_sync(&self, resolver: &Resolver, call: &InjectCall) -> DiResult<ResolvedArgs> {
        let mut args = ResolvedArgs::new();
        for dependency in &self.contract.dependencies {
            let slot = self.injected_slot_sync(resolver, call, dependency)?;
            args.push(dependency.param().name(), slot);
        }
        Ok(args)
    }

    async fn collect_async(
        &self,
        resolver: &Resolver,
        call: &InjectCall,
    ) -> DiResult<ResolvedArgs> {
        let mut args = ResolvedArgs::new();
        for dependency in &self.contract.dependencies {
            let slot = match self.injected_slot_sync(resolver, call, dependency) {
                Ok(slot) => slot,
                Err(DiError::AsyncInSyncContext(_)) => {
                    let (key, optional) = strip_maybe(dependency.key());
                    match resolver.aresolve_key(key).await {
                        Ok(value) => {
                            if matches!(key.as_wrapper(), Some((WrapperKind::All, _))) {
                                ArgSlot::Many((*value.downcast::<Vec<Value>>()?).clone())
                            } else {
                                ArgSlot::Value(value)
                            }
                        }
                        Err(DiError::NotRegistered(_)) if optional => {
                            self.missing_optional_slot(dependency)
                        }
                        Err(error) => return Err(error),
                    }
                }
                Err(error) => return Err(error),
            };
            args.push(dependency.param().name(), slot);
        }
        Ok(args)
    }

    fn injected_slot_sync(
        &self,
        resolver: &Resolver,
        call: &InjectCall,
        dependency: &Dependency,
    ) -> DiResult<ArgSlot> {
        let (key, optional) = strip_maybe(dependency.key());
        match key.as_wrapper() {
            Some((WrapperKind::FromContext, inner)) => {
                if let Some(context) = &call.context {
                    if let Some(value) = context.get(inner) {
                        return Ok(ArgSlot::Value(value));
                    }
                }
                match resolver.resolve_key(key) {
                    Ok(value) => Ok(ArgSlot::Value(value)),
                    Err(DiError::NotRegistered(_)) if optional => {
                        Ok(self.missing_optional_slot(dependency))
                    }
                    Err(error) => Err(error),
                }
            }
            Some((WrapperKind::Provider, inner)) => {
                let resolver = resolver.clone();
                let inner = inner.clone();
                Ok(ArgSlot::Handle(Arc::new(move || {
                    resolver.resolve_key(&inner)
                })))
            }
            Some((WrapperKind::AsyncProvider, inner)) => {
                let resolver = resolver.clone();
                let inner = inner.clone();
                Ok(ArgSlot::AsyncHandle(Arc::new(move || {
                    resolver.aresolve_key_inner(inner.clone())
                })))
            }
            Some((WrapperKind::All, _)) => {
                let value = resolver.resolve_key(key)?;
                Ok(ArgSlot::Many(
                    (*value.downcast::<Vec<Value>>()?).clone(),
                ))
            }
            _ => match resolver.resolve_key(key) {
                Ok(value) => Ok(ArgSlot::Value(value)),
                Err(DiError::NotRegistered(_)) if optional => {
                    Ok(self.missing_optional_slot(dependency))
                }
                Err(error) => Err(error),
            },
        }
    }

    fn missing_optional_slot(&self, dependency: &Dependency) -> ArgSlot {
        if dependency.param().has_default() {
            ArgSlot::Omitted
        } else {
            ArgSlot::NoneLiteral
        }
    }
}

/// Rejects the reserved wrapper parameter names on a wrapped callable.
pub(crate) fn validate_reserved_names(
    name: &str,
    dependencies: &[Dependency],
) -> DiResult<()> {
    for dependency in dependencies {
        let param = dependency.param().name();
        if param == RESERVED_RESOLVER_PARAM || param == RESERVED_CONTEXT_PARAM {
            return Err(DiError::invalid_registration(format!(
                "injected callable '{name}' declares reserved parameter '{param}'"
            )));
        }
    }
    Ok(())
}
