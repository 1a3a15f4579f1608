//! Container facade: registration intake, transactional mutation, lazy
//! compilation, and the public resolution surface.

use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::decoration::{
    base_alias, layer_inner_key, layer_provides, resolve_inner_parameter, DecorationChain,
    DecorationRule, DecorationState,
};
use crate::error::{DiError, DiResult};
use crate::inject::{
    validate_reserved_names, InjectContext, InjectContract, InjectOptions, InjectedFn,
};
use crate::internal::di_debug;
use crate::key::{Key, TypeVar, WrapperKind};
use crate::lifetime::{Lifetime, LockMode};
use crate::open_generics::{find_best_match, OpenGenericRegistry};
use crate::planner::ResolverGenerationPlanner;
use crate::provider::{
    validate_dependencies, AsyncTeardown, Dependency, ProviderKind, ProviderPayload, ProviderSpec,
    ResolvedArgs, Teardown, Value,
};
use crate::registry::{strip_maybe, Registry};
use crate::resolver::{Context, Resolver};
use crate::scope::{Scope, Scopes};
use crate::traits::{AsyncDispose, AutoRegistrationPolicy, ConfigKeyPolicy, Dispose};

/// Per-registration options: target key, component marker, scope, lifetime,
/// lock mode, and type variables for open-generic templates.
///
/// # Examples
///
/// ```rust
/// use diwire::{Container, Lifetime, ProviderOptions, Scopes};
///
/// struct Session;
///
/// let scopes = Scopes::standard();
/// let request = scopes.by_name("request").unwrap();
/// let container = Container::builder().scopes(scopes).build();
/// container
///     .add_factory_with::<Session, _>(
///         ProviderOptions::new().scope(request).lifetime(Lifetime::Scoped),
///         [],
///         |_| Ok(Session),
///     )
///     .unwrap();
/// ```
#[derive(Clone, Default)]
pub struct ProviderOptions {
    provides: Option<Key>,
    component: Option<&'static str>,
    scope: Option<Scope>,
    lifetime: Option<Lifetime>,
    lock_mode: Option<LockMode>,
    type_vars: Vec<TypeVar>,
}

impl ProviderOptions {
    /// All defaults: key inferred from the value type, container default
    /// scope/lifetime/lock mode.
    pub fn new() -> Self {
        ProviderOptions::default()
    }

    /// Binds under an explicit key instead of the inferred one.
    pub fn provides(mut self, key: Key) -> Self {
        self.provides = Some(key);
        self
    }

    /// Attaches a component marker to the bound key.
    pub fn component(mut self, component: &'static str) -> Self {
        self.component = Some(component);
        self
    }

    /// Declares the provider at a scope level.
    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Overrides the container's default lifetime.
    pub fn lifetime(mut self, lifetime: Lifetime) -> Self {
        self.lifetime = Some(lifetime);
        self
    }

    /// Overrides the container's default lock mode.
    pub fn lock_mode(mut self, lock_mode: LockMode) -> Self {
        self.lock_mode = Some(lock_mode);
        self
    }

    /// Declares the type variables of an open-generic `provides` key.
    pub fn type_vars(mut self, vars: impl IntoIterator<Item = TypeVar>) -> Self {
        self.type_vars = vars.into_iter().collect();
        self
    }
}

/// Options for [`Container::decorate`].
#[derive(Clone, Default)]
pub struct DecorateOptions {
    provides: Option<Key>,
    component: Option<&'static str>,
    inner_parameter: Option<&'static str>,
}

impl DecorateOptions {
    /// Defaults: target inferred from the decorator's value type, inner
    /// parameter inferred from the dependency list.
    pub fn new() -> Self {
        DecorateOptions::default()
    }

    /// Decorates an explicit key.
    pub fn provides(mut self, key: Key) -> Self {
        self.provides = Some(key);
        self
    }

    /// Decorates the component-annotated binding.
    pub fn component(mut self, component: &'static str) -> Self {
        self.component = Some(component);
        self
    }

    /// Names the dependency that receives the inner (wrapped) value.
    pub fn inner_parameter(mut self, name: &'static str) -> Self {
        self.inner_parameter = Some(name);
        self
    }
}

struct Savepoint {
    registry: Registry,
    open_registry: OpenGenericRegistry,
    decorations: DecorationState,
}

pub(crate) struct ContainerState {
    pub(crate) registry: Registry,
    pub(crate) open_registry: OpenGenericRegistry,
    pub(crate) decorations: DecorationState,
    contracts: Vec<Arc<InjectContract>>,
    compiled: Option<Resolver>,
    savepoint: Option<Box<Savepoint>>,
    mutation_depth: u32,
}

struct ContainerInner {
    scopes: Scopes,
    root_scope: Scope,
    default_lifetime: Lifetime,
    default_lock_mode: LockMode,
    autoregister_concrete_types: bool,
    autoregister_dependencies: bool,
    auto_policy: Option<Arc<dyn AutoRegistrationPolicy>>,
    config_policy: Option<Arc<dyn ConfigKeyPolicy>>,
    state: Mutex<ContainerState>,
}

/// The dependency-injection container.
///
/// Registration methods take `&self`: the registry lives behind an internal
/// lock and mutations are transactional (a failing registration rolls the
/// registry back to its pre-mutation snapshot). Every mutation invalidates
/// the compiled resolver; the next resolve recompiles the plan.
///
/// # Examples
///
/// ```rust
/// use diwire::{Container, Dependency};
/// use std::sync::Arc;
///
/// struct Engine {
///     url: &'static str,
/// }
/// struct Session {
///     engine: Arc<Engine>,
/// }
///
/// let container = Container::builder().build();
/// container.add_instance(Engine { url: "postgres://localhost" }).unwrap();
/// container
///     .add_factory::<Session, _>([Dependency::of::<Engine>("engine")], |args| {
///         Ok(Session { engine: args.take::<Engine>()? })
///     })
///     .unwrap();
///
/// let session = container.resolve::<Session>().unwrap();
/// assert_eq!(session.engine.url, "postgres://localhost");
/// ```
#[derive(Clone)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

/// Builder for [`Container`].
pub struct ContainerBuilder {
    scopes: Scopes,
    root_scope: Option<&'static str>,
    default_lifetime: Lifetime,
    default_lock_mode: LockMode,
    autoregister_concrete_types: bool,
    autoregister_dependencies: bool,
    auto_policy: Option<Arc<dyn AutoRegistrationPolicy>>,
    config_policy: Option<Arc<dyn ConfigKeyPolicy>>,
}

impl ContainerBuilder {
    /// The scope hierarchy; defaults to [`Scopes::single`].
    pub fn scopes(mut self, scopes: Scopes) -> Self {
        self.scopes = scopes;
        self
    }

    /// The root scope by name; defaults to the shallowest scope.
    pub fn root_scope(mut self, name: &'static str) -> Self {
        self.root_scope = Some(name);
        self
    }

    /// Default lifetime for registrations that do not specify one.
    /// Defaults to [`Lifetime::Scoped`].
    pub fn default_lifetime(mut self, lifetime: Lifetime) -> Self {
        self.default_lifetime = lifetime;
        self
    }

    /// Default lock mode for registrations that do not specify one.
    /// Defaults to [`LockMode::Auto`].
    pub fn lock_mode(mut self, lock_mode: LockMode) -> Self {
        self.default_lock_mode = lock_mode;
        self
    }

    /// Enables consulting the autoregistration policy for unregistered
    /// concrete keys at resolve time.
    pub fn autoregister_concrete_types(mut self, enabled: bool) -> Self {
        self.autoregister_concrete_types = enabled;
        self
    }

    /// Enables consulting the autoregistration policy for missing
    /// dependencies at registration time.
    pub fn autoregister_dependencies(mut self, enabled: bool) -> Self {
        self.autoregister_dependencies = enabled;
        self
    }

    /// Installs the concrete-autoregistration policy hook.
    pub fn auto_registration_policy(
        mut self,
        policy: Arc<dyn AutoRegistrationPolicy>,
    ) -> Self {
        self.auto_policy = Some(policy);
        self
    }

    /// Installs the configuration-key policy hook.
    pub fn config_key_policy(mut self, policy: Arc<dyn ConfigKeyPolicy>) -> Self {
        self.config_policy = Some(policy);
        self
    }

    /// Builds the container.
    ///
    /// # Panics
    ///
    /// Panics when the named root scope does not exist in the scope set.
    pub fn build(self) -> Container {
        let root_scope = match self.root_scope {
            Some(name) => self
                .scopes
                .by_name(name)
                .unwrap_or_else(|| panic!("root scope '{name}' is not in the scope set")),
            None => self.scopes.root(),
        };
        Container {
            inner: Arc::new(ContainerInner {
                scopes: self.scopes,
                root_scope,
                default_lifetime: self.default_lifetime,
                default_lock_mode: self.default_lock_mode,
                autoregister_concrete_types: self.autoregister_concrete_types,
                autoregister_dependencies: self.autoregister_dependencies,
                auto_policy: self.auto_policy,
                config_policy: self.config_policy,
                state: Mutex::new(ContainerState {
                    registry: Registry::new(),
                    open_registry: OpenGenericRegistry::new(),
                    decorations: DecorationState::default(),
                    contracts: Vec::new(),
                    compiled: None,
                    savepoint: None,
                    mutation_depth: 0,
                }),
            }),
        }
    }
}

impl Container {
    /// Starts building a container.
    pub fn builder() -> ContainerBuilder {
        ContainerBuilder {
            scopes: Scopes::single(),
            root_scope: None,
            default_lifetime: Lifetime::Scoped,
            default_lock_mode: LockMode::Auto,
            autoregister_concrete_types: false,
            autoregister_dependencies: false,
            auto_policy: None,
            config_policy: None,
        }
    }

    /// The container's scope set.
    pub fn scopes(&self) -> &Scopes {
        &self.inner.scopes
    }

    /// The container's root scope.
    pub fn root_scope(&self) -> Scope {
        self.inner.root_scope
    }

    pub(crate) fn scope_by_level(&self, level: u32) -> Option<Scope> {
        self.inner.scopes.by_level(level)
    }

    // ----- Transactional mutation plumbing -----

    /// Runs a mutation against the container state. The outermost mutation
    /// takes a savepoint; `InvalidRegistration` restores it. Every mutation
    /// (successful or not) invalidates the compiled resolver.
    fn mutate<R>(
        &self,
        f: impl FnOnce(&Container, &mut ContainerState) -> DiResult<R>,
    ) -> DiResult<R> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        if state.mutation_depth == 0 {
            state.savepoint = Some(Box::new(Savepoint {
                registry: state.registry.clone(),
                open_registry: state.open_registry.clone(),
                decorations: state.decorations.clone(),
            }));
        }
        state.mutation_depth += 1;

        let mut result = f(self, state);
        if result.is_ok() && state.mutation_depth == 1 {
            state.registry.refresh_needs_cleanup();
            if let Err(error) = self.revalidate_contracts(state) {
                result = Err(error);
            }
        }

        state.mutation_depth -= 1;
        state.compiled = None;
        match result {
            Ok(value) => {
                if state.mutation_depth == 0 {
                    state.savepoint = None;
                }
                Ok(value)
            }
            Err(error) => {
                if state.mutation_depth == 0 {
                    if let Some(savepoint) = state.savepoint.take() {
                        if matches!(error, DiError::InvalidRegistration(_)) {
                            state.registry = savepoint.registry;
                            state.open_registry = savepoint.open_registry;
                            state.decorations = savepoint.decorations;
                        }
                    }
                }
                Err(error)
            }
        }
    }

    /// Recomputes every injected callable's required scope level; a
    /// contract whose requirement now exceeds its declared scope fails the
    /// mutation.
    fn revalidate_contracts(&self, state: &mut ContainerState) -> DiResult<()> {
        let contracts = state.contracts.clone();
        for contract in contracts {
            let required = self.infer_required_level(state, &contract.dependencies)?;
            if let Some(declared) = contract.declared_level {
                if declared < required {
                    return Err(DiError::invalid_registration(format!(
                        "injected callable '{}' declares scope level {declared}, but its \
                         dependencies now require level {required}",
                        contract.name
                    )));
                }
            }
            contract.required_level.store(required, Ordering::Release);
        }
        Ok(())
    }

    /// The maximum scope level the dependency set can require, walking the
    /// dependency graph of each key.
    fn infer_required_level(
        &self,
        state: &ContainerState,
        dependencies: &[Dependency],
    ) -> DiResult<u32> {
        let mut cache: AHashMap<Key, u32> = AHashMap::new();
        let mut level = self.inner.root_scope.level();
        for dependency in dependencies {
            level = level.max(self.dependency_level(state, dependency.key(), &mut cache)?);
        }
        Ok(level)
    }

    fn dependency_level(
        &self,
        state: &ContainerState,
        key: &Key,
        cache: &mut AHashMap<Key, u32>,
    ) -> DiResult<u32> {
        if let Some(known) = cache.get(key) {
            return Ok(*known);
        }
        let root_level = self.inner.root_scope.level();

        let (stripped, _) = strip_maybe(key);
        let level = match stripped.as_wrapper() {
            Some((WrapperKind::FromContext, _)) => root_level,
            Some((WrapperKind::Provider | WrapperKind::AsyncProvider, inner)) => {
                self.dependency_level(state, inner, cache)?
            }
            Some((WrapperKind::All, inner)) => {
                let mut level = root_level;
                for spec in state.registry.values() {
                    if spec.key.base_key() == inner {
                        level = level.max(spec.scope_level);
                    }
                }
                level
            }
            _ => match state.registry.find_by_key(stripped) {
                Some(spec) => {
                    let mut level = spec.scope_level;
                    // A cyclic reference re-entering this key sees its own
                    // declared scope level, not the root.
                    cache.insert(key.clone(), level);
                    let spec_dependencies = spec.dependencies.clone();
                    for dependency in &spec_dependencies {
                        level =
                            level.max(self.dependency_level(state, dependency.key(), cache)?);
                    }
                    level
                }
                None => {
                    match find_best_match(state.open_registry.specs(), stripped)? {
                        Some((open_spec, _)) => open_spec.scope_level,
                        None => root_level,
                    }
                }
            },
        };
        cache.insert(key.clone(), level);
        Ok(level)
    }

    // ----- Registration intake -----

    /// Whether two handles share the same underlying container.
    pub(crate) fn same_as(&self, other: &Container) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn effective_key_from(&self, options: &ProviderOptions, default: Key) -> Key {
        let base = options.provides.clone().unwrap_or(default);
        match options.component {
            Some(component) => base.with_component(component),
            None => base,
        }
    }

    /// Payload-level registration entry shared by the typed `add_*` surface
    /// and the deferred-registration recorder.
    pub(crate) fn register_payload(
        &self,
        options: ProviderOptions,
        provides_default: Key,
        kind: ProviderKind,
        payload: ProviderPayload,
        dependencies: Vec<Dependency>,
    ) -> DiResult<()> {
        self.mutate(|this, state| {
            let provides = this.effective_key_from(&options, provides_default.clone());
            this.register_provider(
                state,
                &options,
                provides,
                kind,
                payload.clone(),
                dependencies.clone(),
            )
        })
    }

    /// Instance registration from a pre-built value; forces scoped-at-root.
    pub(crate) fn add_instance_payload(
        &self,
        options: ProviderOptions,
        provides_default: Key,
        value: Value,
    ) -> DiResult<()> {
        let options = ProviderOptions {
            scope: Some(self.inner.root_scope),
            lifetime: Some(Lifetime::Scoped),
            ..options
        };
        self.register_payload(
            options,
            provides_default,
            ProviderKind::Instance,
            ProviderPayload::Instance(value),
            Vec::new(),
        )
    }

    /// Payload-level decoration entry shared by [`Container::decorate`] and
    /// the deferred-registration recorder.
    pub(crate) fn decorate_payload(
        &self,
        options: DecorateOptions,
        target_default: Key,
        payload: ProviderPayload,
        dependencies: Vec<Dependency>,
    ) -> DiResult<()> {
        self.mutate(|this, state| {
            let base = options.provides.clone().unwrap_or(target_default.clone());
            let target = match options.component {
                Some(component) => base.with_component(component),
                None => base,
            };
            validate_dependencies(&target, &dependencies)?;
            let inner_parameter =
                resolve_inner_parameter(&target, &dependencies, options.inner_parameter)?;
            state.decorations.push_rule(
                target.clone(),
                DecorationRule {
                    payload: payload.clone(),
                    inner_parameter,
                    dependencies: dependencies.clone(),
                    is_async: payload.is_async(),
                },
            );
            if state.registry.contains(&target)
                || state.decorations.chain_for(&target).is_some()
            {
                this.rebuild_chain(state, &target)?;
            }
            Ok(())
        })
    }

    fn register_provider(
        &self,
        state: &mut ContainerState,
        options: &ProviderOptions,
        provides: Key,
        kind: ProviderKind,
        payload: ProviderPayload,
        dependencies: Vec<Dependency>,
    ) -> DiResult<()> {
        if provides.as_wrapper().is_some() {
            return Err(DiError::invalid_registration(format!(
                "cannot register a binding under wrapper key {provides}; wrappers are \
                 resolved at dispatch time"
            )));
        }
        validate_dependencies(&provides, &dependencies)?;

        let scope = options.scope.unwrap_or(self.inner.root_scope);
        match self.inner.scopes.by_level(scope.level()) {
            Some(known) if known.name() == scope.name() => {}
            _ => {
                return Err(DiError::invalid_registration(format!(
                    "scope '{}' (level {}) is not part of this container's scope set",
                    scope.name(),
                    scope.level()
                )))
            }
        }
        let lifetime = options.lifetime.unwrap_or(self.inner.default_lifetime);
        let lock_mode = options.lock_mode.unwrap_or(self.inner.default_lock_mode);

        if provides.is_open() {
            state.open_registry.add(
                provides,
                kind,
                payload,
                lifetime,
                scope.level(),
                scope.name(),
                lock_mode,
                options.type_vars.clone(),
                &dependencies,
            )?;
            return Ok(());
        }
        if !options.type_vars.is_empty() {
            return Err(DiError::invalid_registration(format!(
                "type variables declared for {provides}, which is not an open-generic key"
            )));
        }

        self.autoregister_missing(state, &dependencies, &mut Vec::new())?;

        let is_async = payload.is_async();
        let needs_cleanup = payload.has_cleanup();
        let spec = ProviderSpec {
            key: provides.clone(),
            kind,
            payload,
            lifetime,
            scope_level: scope.level(),
            scope_name: scope.name(),
            is_async,
            lock_mode,
            dependencies,
            needs_cleanup,
            slot: 0,
        };

        if state.decorations.chain_for(&provides).is_some() {
            // Re-registering a decorated key lands on the chain's base alias.
            let mut spec = spec;
            spec.key = base_alias(&provides);
            state.registry.add(spec)?;
            self.rebuild_chain(state, &provides)?;
        } else {
            state.registry.add(spec)?;
            if state.decorations.has_rules(&provides) {
                self.rebuild_chain(state, &provides)?;
            }
        }
        Ok(())
    }

    /// Consults the configuration-key and autoregistration hooks for
    /// required dependencies that are not yet registered.
    fn autoregister_missing(
        &self,
        state: &mut ContainerState,
        dependencies: &[Dependency],
        visited: &mut Vec<Key>,
    ) -> DiResult<()> {
        for dependency in dependencies {
            let (key, optional) = strip_maybe(dependency.key());
            if optional || key.as_wrapper().is_some() || key.is_open() {
                continue;
            }
            if state.registry.contains(key) || visited.contains(key) {
                continue;
            }
            if find_best_match(state.open_registry.specs(), key)?.is_some() {
                continue;
            }
            visited.push(key.clone());

            if let Some(policy) = &self.inner.config_policy {
                if let Some(build) = policy.build(key) {
                    let payload = ProviderPayload::SyncCall(Arc::new(move |_| build()));
                    let spec = ProviderSpec {
                        key: key.clone(),
                        kind: ProviderKind::Factory,
                        payload,
                        lifetime: Lifetime::Scoped,
                        scope_level: self.inner.root_scope.level(),
                        scope_name: self.inner.root_scope.name(),
                        is_async: false,
                        lock_mode: self.inner.default_lock_mode,
                        dependencies: Vec::new(),
                        needs_cleanup: false,
                        slot: 0,
                    };
                    state.registry.add(spec)?;
                    continue;
                }
            }

            if self.inner.autoregister_dependencies {
                if let Some(policy) = &self.inner.auto_policy {
                    if policy.eligible(key) {
                        if let Some(auto) = policy.provider(key) {
                            self.autoregister_missing(state, &auto.dependencies, visited)?;
                            self.register_auto(state, key, auto)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn register_auto(
        &self,
        state: &mut ContainerState,
        key: &Key,
        auto: crate::traits::AutoProvider,
    ) -> DiResult<()> {
        let factory = auto.factory;
        let spec = ProviderSpec {
            key: key.clone(),
            kind: ProviderKind::ConcreteType,
            payload: ProviderPayload::SyncCall(Arc::new(move |args| factory(args))),
            lifetime: auto.lifetime.unwrap_or(self.inner.default_lifetime),
            scope_level: self.inner.root_scope.level(),
            scope_name: self.inner.root_scope.name(),
            is_async: false,
            lock_mode: self.inner.default_lock_mode,
            dependencies: auto.dependencies,
            needs_cleanup: false,
            slot: 0,
        };
        state.registry.add(spec)?;
        Ok(())
    }

    /// Resolve-time autoregistration for eligible concrete keys. Returns
    /// whether a registration happened (the caller retries the resolve).
    fn try_autoregister_key(&self, key: &Key) -> DiResult<bool> {
        if !self.inner.autoregister_concrete_types {
            return Ok(false);
        }
        let policy = match &self.inner.auto_policy {
            Some(policy) => policy.clone(),
            None => return Ok(false),
        };
        if !policy.eligible(key) {
            return Ok(false);
        }
        let auto = match policy.provider(key) {
            Some(auto) => auto,
            None => return Ok(false),
        };
        self.mutate(|this, state| {
            if state.registry.contains(key) {
                return Ok(());
            }
            this.autoregister_missing(state, &auto.dependencies, &mut vec![key.clone()])?;
            this.register_auto(state, key, auto)
        })?;
        Ok(true)
    }

    fn rebuild_chain(&self, state: &mut ContainerState, target: &Key) -> DiResult<()> {
        let rules = state.decorations.rules_for(target).to_vec();
        if rules.is_empty() {
            return Ok(());
        }

        let base = match state.decorations.remove_chain(target) {
            Some(chain) => {
                for key in &chain.layer_keys {
                    state.registry.remove_by_key(key);
                }
                chain.base_key
            }
            None => {
                if !state.registry.contains(target) {
                    // Rules wait until a binding arrives.
                    return Ok(());
                }
                let base = base_alias(target);
                state.registry.reassign_key(target, base.clone())?;
                base
            }
        };

        let base_spec = state.registry.get_by_key(&base)?.clone();
        let count = rules.len();
        let mut layer_keys = Vec::with_capacity(count);
        for (index, rule) in rules.iter().enumerate() {
            let provides = layer_provides(target, index, count);
            let inner_key = layer_inner_key(target, index);
            let dependencies: Vec<Dependency> = rule
                .dependencies
                .iter()
                .cloned()
                .map(|mut dependency| {
                    if dependency.param.name == rule.inner_parameter {
                        dependency.key = inner_key.clone();
                    }
                    dependency
                })
                .collect();
            let spec = ProviderSpec {
                key: provides.clone(),
                kind: ProviderKind::Factory,
                payload: rule.payload.clone(),
                lifetime: base_spec.lifetime,
                scope_level: base_spec.scope_level,
                scope_name: base_spec.scope_name,
                is_async: rule.is_async,
                lock_mode: base_spec.lock_mode,
                dependencies,
                needs_cleanup: false,
                slot: 0,
            };
            state.registry.add(spec)?;
            layer_keys.push(provides);
        }
        state.decorations.set_chain(
            target.clone(),
            DecorationChain {
                base_key: base,
                layer_keys,
            },
        );
        Ok(())
    }

    // ----- add_* surface -----

    /// Registers a pre-built instance under its own type key. Behaves as
    /// scoped-at-root: no construction cost, no cleanup.
    pub fn add_instance<T: Send + Sync + 'static>(&self, value: T) -> DiResult<()> {
        self.add_instance_with(ProviderOptions::new(), value)
    }

    /// [`Container::add_instance`] with explicit options.
    pub fn add_instance_with<T: Send + Sync + 'static>(
        &self,
        options: ProviderOptions,
        value: T,
    ) -> DiResult<()> {
        self.add_instance_payload(options, Key::of::<T>(), Value::new(value))
    }

    /// Registers a factory for `T` with the container defaults.
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

    /// [`Container::add_factory`] with explicit options.
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
        self.register_payload(
            options,
            Key::of::<T>(),
            ProviderKind::Factory,
            crate::provider::sync_call_payload(factory),
            dependencies.into_iter().collect(),
        )
    }

    /// Registers a concrete type constructed from its dependencies. The
    /// constructor closure is the explicit stand-in for constructor
    /// introspection.
    pub fn add_concrete<T, F>(
        &self,
        dependencies: impl IntoIterator<Item = Dependency>,
        constructor: F,
    ) -> DiResult<()>
    where
        T: Send + Sync + 'static,
        F: Fn(&mut ResolvedArgs) -> DiResult<T> + Send + Sync + 'static,
    {
        self.add_concrete_with::<T, F>(ProviderOptions::new(), dependencies, constructor)
    }

    /// [`Container::add_concrete`] with explicit options.
    pub fn add_concrete_with<T, F>(
        &self,
        options: ProviderOptions,
        dependencies: impl IntoIterator<Item = Dependency>,
        constructor: F,
    ) -> DiResult<()>
    where
        T: Send + Sync + 'static,
        F: Fn(&mut ResolvedArgs) -> DiResult<T> + Send + Sync + 'static,
    {
        self.register_payload(
            options,
            Key::of::<T>(),
            ProviderKind::ConcreteType,
            crate::provider::sync_call_payload(constructor),
            dependencies.into_iter().collect(),
        )
    }

    /// Registers an async factory for `T`.
    pub fn add_async_factory<T, F, Fut>(
        &self,
        dependencies: impl IntoIterator<Item = Dependency>,
        factory: F,
    ) -> DiResult<()>
    where
        T: Send + Sync + 'static,
        F: Fn(ResolvedArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DiResult<T>> + Send + 'static,
    {
        self.add_async_factory_with::<T, F, Fut>(ProviderOptions::new(), dependencies, factory)
    }

    /// [`Container::add_async_factory`] with explicit options.
    pub fn add_async_factory_with<T, F, Fut>(
        &self,
        options: ProviderOptions,
        dependencies: impl IntoIterator<Item = Dependency>,
        factory: F,
    ) -> DiResult<()>
    where
        T: Send + Sync + 'static,
        F: Fn(ResolvedArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DiResult<T>> + Send + 'static,
    {
        self.register_payload(
            options,
            Key::of::<T>(),
            ProviderKind::Factory,
            crate::provider::async_call_payload(factory),
            dependencies.into_iter().collect(),
        )
    }

    /// Registers a generator provider: yields a value plus a teardown that
    /// runs at the declaring scope's exit, LIFO.
    pub fn add_generator<T, F>(
        &self,
        dependencies: impl IntoIterator<Item = Dependency>,
        generator: F,
    ) -> DiResult<()>
    where
        T: Send + Sync + 'static,
        F: Fn(&mut ResolvedArgs) -> DiResult<(T, Teardown)> + Send + Sync + 'static,
    {
        self.add_generator_with::<T, F>(ProviderOptions::new(), dependencies, generator)
    }

    /// [`Container::add_generator`] with explicit options.
    pub fn add_generator_with<T, F>(
        &self,
        options: ProviderOptions,
        dependencies: impl IntoIterator<Item = Dependency>,
        generator: F,
    ) -> DiResult<()>
    where
        T: Send + Sync + 'static,
        F: Fn(&mut ResolvedArgs) -> DiResult<(T, Teardown)> + Send + Sync + 'static,
    {
        self.register_payload(
            options,
            Key::of::<T>(),
            ProviderKind::Generator,
            crate::provider::sync_resource_payload(generator),
            dependencies.into_iter().collect(),
        )
    }

    /// Registers an async generator provider; its teardown runs at async
    /// scope exit.
    pub fn add_async_generator<T, F, Fut>(
        &self,
        dependencies: impl IntoIterator<Item = Dependency>,
        generator: F,
    ) -> DiResult<()>
    where
        T: Send + Sync + 'static,
        F: Fn(ResolvedArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DiResult<(T, AsyncTeardown)>> + Send + 'static,
    {
        self.add_async_generator_with::<T, F, Fut>(ProviderOptions::new(), dependencies, generator)
    }

    /// [`Container::add_async_generator`] with explicit options.
    pub fn add_async_generator_with<T, F, Fut>(
        &self,
        options: ProviderOptions,
        dependencies: impl IntoIterator<Item = Dependency>,
        generator: F,
    ) -> DiResult<()>
    where
        T: Send + Sync + 'static,
        F: Fn(ResolvedArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DiResult<(T, AsyncTeardown)>> + Send + 'static,
    {
        self.register_payload(
            options,
            Key::of::<T>(),
            ProviderKind::Generator,
            crate::provider::async_resource_payload(generator),
            dependencies.into_iter().collect(),
        )
    }

    /// Registers a context-manager provider: the factory's value is entered
    /// on construction and its [`Dispose`] hook runs at scope exit.
    pub fn add_context_manager<T, F>(
        &self,
        dependencies: impl IntoIterator<Item = Dependency>,
        factory: F,
    ) -> DiResult<()>
    where
        T: Dispose,
        F: Fn(&mut ResolvedArgs) -> DiResult<T> + Send + Sync + 'static,
    {
        self.add_context_manager_with::<T, F>(ProviderOptions::new(), dependencies, factory)
    }

    /// [`Container::add_context_manager`] with explicit options.
    pub fn add_context_manager_with<T, F>(
        &self,
        options: ProviderOptions,
        dependencies: impl IntoIterator<Item = Dependency>,
        factory: F,
    ) -> DiResult<()>
    where
        T: Dispose,
        F: Fn(&mut ResolvedArgs) -> DiResult<T> + Send + Sync + 'static,
    {
        self.register_payload(
            options,
            Key::of::<T>(),
            ProviderKind::ContextManager,
            crate::provider::context_manager_payload(factory),
            dependencies.into_iter().collect(),
        )
    }

    /// Registers an async context-manager provider; its [`AsyncDispose`]
    /// hook runs at async scope exit.
    pub fn add_async_context_manager<T, F, Fut>(
        &self,
        dependencies: impl IntoIterator<Item = Dependency>,
        factory: F,
    ) -> DiResult<()>
    where
        T: AsyncDispose,
        F: Fn(ResolvedArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DiResult<T>> + Send + 'static,
    {
        self.add_async_context_manager_with::<T, F, Fut>(
            ProviderOptions::new(),
            dependencies,
            factory,
        )
    }

    /// [`Container::add_async_context_manager`] with explicit options.
    pub fn add_async_context_manager_with<T, F, Fut>(
        &self,
        options: ProviderOptions,
        dependencies: impl IntoIterator<Item = Dependency>,
        factory: F,
    ) -> DiResult<()>
    where
        T: AsyncDispose,
        F: Fn(ResolvedArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DiResult<T>> + Send + 'static,
    {
        self.register_payload(
            options,
            Key::of::<T>(),
            ProviderKind::ContextManager,
            crate::provider::async_context_manager_payload(factory),
            dependencies.into_iter().collect(),
        )
    }

    /// Appends a decoration rule for `T`'s binding. The decorator's inner
    /// dependency receives the previous layer's value; the final layer
    /// answers for the target key.
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
        self.decorate_payload(
            options,
            Key::of::<T>(),
            crate::provider::sync_call_payload(decorator),
            dependencies.into_iter().collect(),
        )
    }

    /// Wraps a callable so its declared dependencies are resolved at call
    /// time. See [`InjectedFn`].
    pub fn inject<R, F>(
        &self,
        name: &'static str,
        dependencies: Vec<Dependency>,
        options: InjectOptions,
        func: F,
    ) -> DiResult<InjectedFn<R>>
    where
        R: Send + Sync + 'static,
        F: Fn(InjectContext<'_>, &mut ResolvedArgs) -> DiResult<R> + Send + Sync + 'static,
    {
        self.inject_payload(name, dependencies, options, Arc::new(func))
    }

    pub(crate) fn inject_payload<R>(
        &self,
        name: &'static str,
        dependencies: Vec<Dependency>,
        options: InjectOptions,
        func: crate::inject::InjectFnPayload<R>,
    ) -> DiResult<InjectedFn<R>>
    where
        R: Send + Sync + 'static,
    {
        let contract = self.mutate(|this, state| {
            validate_reserved_names(name, &dependencies)?;
            let pseudo_key = Key::of::<InjectedFn<R>>();
            validate_dependencies(&pseudo_key, &dependencies)?;
            let required = this.infer_required_level(state, &dependencies)?;
            if let Some(scope) = options.scope {
                if scope.level() < required {
                    return Err(DiError::invalid_registration(format!(
                        "injected callable '{name}' declares scope '{}' (level {}), but its \
                         dependencies require level {required}",
                        scope.name(),
                        scope.level()
                    )));
                }
            }
            let contract = Arc::new(InjectContract {
                name,
                dependencies: dependencies.clone(),
                declared_level: options.scope.map(|s| s.level()),
                required_level: required.into(),
            });
            state.contracts.push(contract.clone());
            Ok(contract)
        })?;
        Ok(InjectedFn::new(self.clone(), contract, options, func))
    }

    // ----- Compilation and resolution -----

    /// Compiles (or returns the cached) resolver tree. Idempotent until the
    /// next mutation.
    pub fn compile(&self) -> DiResult<Resolver> {
        let mut state = self.inner.state.lock();
        if let Some(resolver) = &state.compiled {
            return Ok(resolver.clone());
        }
        let planner = ResolverGenerationPlanner::new(
            self.inner.root_scope,
            &self.inner.scopes,
            &state.registry,
            &state.open_registry,
        )?;
        let plan = Arc::new(planner.build()?);
        di_debug!(
            providers = plan.provider_count,
            cached = plan.cached_provider_count,
            thread_locks = plan.thread_lock_count,
            async_locks = plan.async_lock_count,
            lock_modes = ?plan.effective_mode_counts,
            has_async = plan.has_async_specs,
            has_cleanup = plan.has_cleanup,
            "compiled resolver plan"
        );
        let root = Resolver::new_root(plan);
        state.compiled = Some(root.clone());
        Ok(root)
    }

    /// Resolves a concrete type from the root resolver.
    pub fn resolve<T: Send + Sync + 'static>(&self) -> DiResult<Arc<T>> {
        self.resolve_key(&Key::of::<T>())?.downcast::<T>()
    }

    /// Async form of [`Container::resolve`].
    pub async fn aresolve<T: Send + Sync + 'static>(&self) -> DiResult<Arc<T>> {
        self.aresolve_key(&Key::of::<T>()).await?.downcast::<T>()
    }

    /// `Maybe` semantics at the container root.
    pub fn resolve_maybe<T: Send + Sync + 'static>(&self) -> DiResult<Option<Arc<T>>> {
        self.compile()?.resolve_maybe::<T>()
    }

    /// All bindings for `T`'s canonical base key.
    pub fn resolve_all<T: Send + Sync + 'static>(&self) -> DiResult<Vec<Arc<T>>> {
        self.compile()?.resolve_all::<T>()
    }

    /// Key-level resolution from the root resolver. Unregistered eligible
    /// concrete keys are autoregistered and retried when
    /// `autoregister_concrete_types` is enabled.
    pub fn resolve_key(&self, key: &Key) -> DiResult<Value> {
        match self.compile()?.resolve_key(key) {
            Err(DiError::NotRegistered(message)) => {
                if self.try_autoregister_key(key)? {
                    self.compile()?.resolve_key(key)
                } else {
                    Err(DiError::NotRegistered(message))
                }
            }
            other => other,
        }
    }

    /// Async key-level resolution from the root resolver.
    pub async fn aresolve_key(&self, key: &Key) -> DiResult<Value> {
        match self.compile()?.aresolve_key(key).await {
            Err(DiError::NotRegistered(message)) => {
                if self.try_autoregister_key(key)? {
                    self.compile()?.aresolve_key(key).await
                } else {
                    Err(DiError::NotRegistered(message))
                }
            }
            other => other,
        }
    }

    /// Enters a deeper scope from the root resolver.
    pub fn enter_scope(&self, target: Option<Scope>) -> DiResult<Resolver> {
        self.compile()?.enter_scope(target)
    }

    /// Enters a deeper scope with a context frame.
    pub fn enter_scope_with_context(
        &self,
        target: Option<Scope>,
        context: Context,
    ) -> DiResult<Resolver> {
        self.compile()?.enter_scope_with_context(target, context)
    }

    /// Closes the compiled root resolver (draining root-scoped cleanup) and
    /// drops it; the next resolve recompiles.
    pub fn close(&self) -> DiResult<()> {
        let compiled = self.inner.state.lock().compiled.take();
        match compiled {
            Some(resolver) => resolver.close(),
            None => Ok(()),
        }
    }

    /// Async form of [`Container::close`].
    pub async fn aclose(&self) -> DiResult<()> {
        let compiled = self.inner.state.lock().compiled.take();
        match compiled {
            Some(resolver) => resolver.aclose().await,
            None => Ok(()),
        }
    }

    /// Number of flat registrations, for diagnostics.
    pub fn registration_count(&self) -> usize {
        self.inner.state.lock().registry.len()
    }

    #[cfg(feature = "diagnostics")]
    pub fn to_debug_string(&self) -> String {
        let state = self.inner.state.lock();
        let mut s = String::new();
        s.push_str("=== Container Debug ===\n");
        s.push_str("Bindings:\n");
        for spec in state.registry.values() {
            s.push_str(&format!(
                "  [{}] {} ({:?} @ {}, {})\n",
                spec.slot,
                spec.key,
                spec.lifetime,
                spec.scope_name,
                spec.kind.label()
            ));
        }
        s.push_str("Open generics:\n");
        for open in state.open_registry.specs() {
            s.push_str(&format!(
                "  [{}] {} ({:?} @ {})\n",
                open.order, open.template, open.lifetime, open.scope_name
            ));
        }
        s
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Container")
            .field("root_scope", &self.inner.root_scope.name())
            .field("registrations", &state.registry.len())
            .field("open_generics", &state.open_registry.specs().len())
            .field("compiled", &state.compiled.is_some())
            .finish()
    }
}
