//! Deferred-registration recorder.
//!
//! A [`ContainerContext`] records registration calls made before a
//! container exists; binding one with [`ContainerContext::set_current`]
//! replays them in recording order. Calls made after binding apply to the
//! container immediately (and stay recorded). Binding a different container
//! replays the full record into it, and the resolution passthroughs and
//! injected wrappers always consult the currently bound container, so a
//! rebind transparently redirects them. Each recorder is an independent
//! instance, not a process singleton.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::container::{Container, DecorateOptions, ProviderOptions};
use crate::error::{DiError, DiResult};
use crate::inject::{InjectCall, InjectContext, InjectFnPayload, InjectOptions, InjectedFn};
use crate::key::Key;
use crate::provider::{
    context_manager_payload, sync_call_payload, sync_resource_payload, Dependency, ProviderKind,
    ResolvedArgs, Teardown, Value,
};
use crate::resolver::{Context, Resolver};
use crate::scope::Scope;
use crate::traits::Dispose;

type RecordedOp = Arc<dyn Fn(&Container) -> DiResult<()> + Send + Sync>;

#[derive(Default)]
struct ContextState {
    recorded: Vec<RecordedOp>,
    current: Option<Container>,
}

/// Records `add_*` / `decorate` / `inject` calls for replay against a
/// container.
///
/// # Examples
///
/// ```rust
/// use diwire::{Container, ContainerContext};
///
/// struct Config {
///     debug: bool,
/// }
///
/// let context = ContainerContext::new();
/// context.add_instance(Config { debug: true }).unwrap();
///
/// let container = Container::builder().build();
/// context.set_current(&container).unwrap();
///
/// assert!(container.resolve::<Config>().unwrap().debug);
/// ```
#[derive(Clone, Default)]
pub struct ContainerContext {
    state: Arc<Mutex<ContextState>>,
}

impl ContainerContext {
    /// A fresh, unbound recorder.
    pub fn new() -> Self {
        ContainerContext::default()
    }

    /// Binds the recorder to a container, replaying the full record in
    /// recording order. Rebinding the same container is a no-op; binding a
    /// different one replays the record into it and redirects the
    /// passthroughs and injected wrappers.
    pub fn set_current(&self, container: &Container) -> DiResult<()> {
        let recorded: Vec<RecordedOp> = {
            let mut state = self.state.lock();
            if let Some(current) = &state.current {
                if current.same_as(container) {
                    return Ok(());
                }
            }
            state.current = Some(container.clone());
            state.recorded.clone()
        };
        for op in recorded {
            op(container)?;
        }
        Ok(())
    }

    /// The bound container, if any.
    pub fn current(&self) -> Option<Container> {
        self.state.lock().current.clone()
    }

    fn require_current(&self) -> DiResult<Container> {
        self.current().ok_or_else(|| {
            DiError::invalid_registration(
                "container context is not bound; call set_current first",
            )
        })
    }

    /// Records the op, and applies it immediately when a container is
    /// bound.
    fn apply(&self, op: RecordedOp) -> DiResult<()> {
        let current = {
            let mut state = self.state.lock();
            state.recorded.push(op.clone());
            state.current.clone()
        };
        match current {
            Some(container) => op(&container),
            None => Ok(()),
        }
    }

    // ----- Resolution passthroughs (always the currently bound container) -----

    /// Resolves through the currently bound container.
    pub fn resolve<T: Send + Sync + 'static>(&self) -> DiResult<Arc<T>> {
        self.require_current()?.resolve::<T>()
    }

    /// Async form of [`ContainerContext::resolve`].
    pub async fn aresolve<T: Send + Sync + 'static>(&self) -> DiResult<Arc<T>> {
        self.require_current()?.aresolve::<T>().await
    }

    /// Key-level resolution through the currently bound container.
    pub fn resolve_key(&self, key: &Key) -> DiResult<Value> {
        self.require_current()?.resolve_key(key)
    }

    /// Async key-level resolution through the currently bound container.
    pub async fn aresolve_key(&self, key: &Key) -> DiResult<Value> {
        self.require_current()?.aresolve_key(key).await
    }

    /// Enters a scope on the currently bound container.
    pub fn enter_scope(&self, target: Option<Scope>) -> DiResult<Resolver> {
        self.require_current()?.enter_scope(target)
    }

    /// Enters a scope with a context frame on the currently bound
    /// container.
    pub fn enter_scope_with_context(
        &self,
        target: Option<Scope>,
        context: Context,
    ) -> DiResult<Resolver> {
        self.require_current()?.enter_scope_with_context(target, context)
    }

    // ----- Recorded registrations -----

    /// Records or applies [`Container::add_instance`].
    pub fn add_instance<T: Send + Sync + 'static>(&self, value: T) -> DiResult<()> {
        self.add_instance_with(ProviderOptions::new(), value)
    }

    /// Records or applies [`Container::add_instance_with`]. The value is
    /// shared by every container the recorder binds.
    pub fn add_instance_with<T: Send + Sync + 'static>(
        &self,
        options: ProviderOptions,
        value: T,
    ) -> DiResult<()> {
        let value = Value::new(value);
        let provides = Key::of::<T>();
        self.apply(Arc::new(move |container| {
            container.add_instance_payload(options.clone(), provides.clone(), value.clone())
        }))
    }

    /// Records or applies [`Container::add_factory`].
    pub fn add_factory<T, F>(
        &self,
        dependencies: impl IntoIterator<Item = Dependency>,
        factory: F,
    ) -> DiResult<()>
    where
        T: Send + Sync + 'static,
        F: Fn(&mut ResolvedArgs) -> DiResult<T> + Send + Sync + 'static,
    {
        self.add_factory_with::<T, F>(ProviderOptions::new(), dependencies, factory)
    }

    /// Records or applies [`Container::add_factory_with`].
    pub fn add_factory_with<T, F>(
        &self,
        options: ProviderOptions,
        dependencies: impl IntoIterator<Item = Dependency>,
        factory: F,
    ) -> DiResult<()>
    where
        T: Send + Sync + 'static,
        F: Fn(&mut ResolvedArgs) -> DiResult<T> + Send + Sync + 'static,
    {
        self.record_registration::<T>(
            options,
            ProviderKind::Factory,
            sync_call_payload(factory),
            dependencies,
        )
    }

    /// Records or applies [`Container::add_concrete`].
    pub fn add_concrete<T, F>(
        &self,
        dependencies: impl IntoIterator<Item = Dependency>,
        constructor: F,
    ) -> DiResult<()>
    where
        T: Send + Sync + 'static,
        F: Fn(&mut ResolvedArgs) -> DiResult<T> + Send + Sync + 'static,
    {
        self.record_registration::<T>(
            ProviderOptions::new(),
            ProviderKind::ConcreteType,
            sync_call_payload(constructor),
            dependencies,
        )
    }

    /// Records or applies [`Container::add_generator`].
    pub fn add_generator<T, F>(
        &self,
        dependencies: impl IntoIterator<Item = Dependency>,
        generator: F,
    ) -> DiResult<()>
    where
        T: Send + Sync + 'static,
        F: Fn(&mut ResolvedArgs) -> DiResult<(T, Teardown)> + Send + Sync + 'static,
    {
        self.record_registration::<T>(
            ProviderOptions::new(),
            ProviderKind::Generator,
            sync_resource_payload(generator),
            dependencies,
        )
    }

    /// Records or applies [`Container::add_context_manager`].
    pub fn add_context_manager<T, F>(
        &self,
        dependencies: impl IntoIterator<Item = Dependency>,
        factory: F,
    ) -> DiResult<()>
    where
        T: Dispose,
        F: Fn(&mut ResolvedArgs) -> DiResult<T> + Send + Sync + 'static,
    {
        self.record_registration::<T>(
            ProviderOptions::new(),
            ProviderKind::ContextManager,
            context_manager_payload(factory),
            dependencies,
        )
    }

    fn record_registration<T: 'static>(
        &self,
        options: ProviderOptions,
        kind: ProviderKind,
        payload: crate::provider::ProviderPayload,
        dependencies: impl IntoIterator<Item = Dependency>,
    ) -> DiResult<()> {
        let provides = Key::of::<T>();
        let dependencies: Vec<Dependency> = dependencies.into_iter().collect();
        self.apply(Arc::new(move |container| {
            container.register_payload(
                options.clone(),
                provides.clone(),
                kind,
                payload.clone(),
                dependencies.clone(),
            )
        }))
    }

    /// Records or applies [`Container::inject`]. The returned handle
    /// resolves against whichever container the recorder is bound to at
    /// call time.
    pub fn inject<R, F>(
        &self,
        name: &'static str,
        dependencies: Vec<Dependency>,
        options: InjectOptions,
        func: F,
    ) -> DiResult<DeferredInjected<R>>
    where
        R: Send + Sync + 'static,
        F: Fn(InjectContext<'_>, &mut ResolvedArgs) -> DiResult<R> + Send + Sync + 'static,
    {
        let payload: InjectFnPayload<R> = Arc::new(func);
        let cache: InjectedCache<R> = Arc::new(Mutex::new(None));
        let op = {
            let cache = cache.clone();
            let payload = payload.clone();
            let options = options.clone();
            let dependencies = dependencies.clone();
            Arc::new(move |container: &Container| {
                let injected = container.inject_payload(
                    name,
                    dependencies.clone(),
                    options.clone(),
                    payload.clone(),
                )?;
                *cache.lock() = Some((container.clone(), injected));
                Ok(())
            })
        };
        self.apply(op)?;
        Ok(DeferredInjected {
            name,
            context: self.clone(),
            dependencies,
            options,
            payload,
            cache,
        })
    }

    /// Records or applies [`Container::decorate`].
    pub fn decorate<T, F>(
        &self,
        options: DecorateOptions,
        dependencies: impl IntoIterator<Item = Dependency>,
        decorator: F,
    ) -> DiResult<()>
    where
        T: Send + Sync + 'static,
        F: Fn(&mut ResolvedArgs) -> DiResult<T> + Send + Sync + 'static,
    {
        let target = Key::of::<T>();
        let payload = sync_call_payload(decorator);
        let dependencies: Vec<Dependency> = dependencies.into_iter().collect();
        self.apply(Arc::new(move |container| {
            container.decorate_payload(
                options.clone(),
                target.clone(),
                payload.clone(),
                dependencies.clone(),
            )
        }))
    }
}

type InjectedCache<R> = Arc<Mutex<Option<(Container, InjectedFn<R>)>>>;

/// An injected callable recorded on a [`ContainerContext`]. Calls resolve
/// against the container the recorder is bound to at that moment; rebinding
/// the recorder redirects subsequent calls.
pub struct DeferredInjected<R> {
    name: &'static str,
    context: ContainerContext,
    dependencies: Vec<Dependency>,
    options: InjectOptions,
    payload: InjectFnPayload<R>,
    cache: InjectedCache<R>,
}

impl<R: Send + Sync + 'static> DeferredInjected<R> {
    /// The wrapper bound to the recorder's current container; built on
    /// first use per container and refreshed by rebinds.
    fn resolved(&self) -> DiResult<InjectedFn<R>> {
        let current = self.context.current().ok_or_else(|| {
            DiError::invalid_registration(format!(
                "injected callable '{}' was recorded but its recorder is not bound to a \
                 container yet",
                self.name
            ))
        })?;
        let mut cache = self.cache.lock();
        if let Some((container, injected)) = &*cache {
            if container.same_as(&current) {
                return Ok(injected.clone());
            }
        }
        let injected = current.inject_payload(
            self.name,
            self.dependencies.clone(),
            self.options.clone(),
            self.payload.clone(),
        )?;
        *cache = Some((current, injected.clone()));
        Ok(injected)
    }

    /// Calls the wrapped function. See [`InjectedFn::call`].
    pub fn call(&self) -> DiResult<R> {
        self.resolved()?.call()
    }

    /// Calls with explicit per-call inputs. See [`InjectedFn::call_with`].
    pub fn call_with(&self, call: InjectCall) -> DiResult<R> {
        self.resolved()?.call_with(call)
    }

    /// Async form of [`DeferredInjected::call`].
    pub async fn acall(&self) -> DiResult<R> {
        self.resolved()?.acall().await
    }

    /// Async form of [`DeferredInjected::call_with`].
    pub async fn acall_with(&self, call: InjectCall) -> DiResult<R> {
        self.resolved()?.acall_with(call).await
    }
}

impl std::fmt::Debug for ContainerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ContainerContext")
            .field("recorded", &state.recorded.len())
            .field("bound", &state.current.is_some())
            .finish()
    }
}
