//! Compiled resolver execution.
//!
//! One [`Resolver`] exists per entered scope level, wired into an ancestry
//! chain up to the root. Resolution interprets the precomputed resolver
//! generation plan:
//! per-slot cache cells live on the resolver owning the slot's scope level,
//! first builds are serialized per the plan's lock discipline, and cleanup
//! callbacks drain LIFO at scope exit.

pub mod cleanup;
pub mod context;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::error::{DiError, DiResult};
use crate::internal::{di_debug, di_trace, di_warn, BoxFuture};
use crate::key::{Key, WrapperKind};
use crate::lifetime::{Lifetime, LockMode};
use crate::open_generics::{find_best_match, substitute, OpenBindingKind, OpenGenericSpec, VarMap};
use crate::planner::{
    DependencyPlanKind, LiteralKind, ProviderWorkflowPlan, ResolverGenerationPlan, ScopePlan,
};
use crate::provider::args::ArgSlot;
use crate::provider::{
    AsyncProviderHandle, ProviderHandle, ProviderPayload, RawAsyncProviderHandle,
    RawProviderHandle, ResolvedArgs, Value,
};
use crate::scope::Scope;

pub use context::Context;

use cleanup::CleanupBag;

/// Per-slot cache cell on the owning resolver.
struct SlotCell {
    value: OnceCell<Value>,
    async_lock: tokio::sync::Mutex<()>,
}

impl SlotCell {
    fn new() -> Self {
        SlotCell {
            value: OnceCell::new(),
            async_lock: tokio::sync::Mutex::new(()),
        }
    }
}

struct ResolverInner {
    plan: Arc<ResolverGenerationPlan>,
    scope: Scope,
    parent: Option<Resolver>,
    context: Option<Context>,
    cleanup_enabled: bool,
    cleanup: Mutex<CleanupBag>,
    owned_scope_resolvers: Mutex<Vec<Resolver>>,
    closed: AtomicBool,
    cells: Box<[SlotCell]>,
    /// Cache cells for open-generic materializations owned at this scope
    /// level, keyed by the closed key. Cells are created on first use and
    /// carry the same single-construction discipline as flat slots.
    open_cache: Mutex<ahash::AHashMap<Key, Arc<SlotCell>>>,
}

/// The object that executes resolution at one scope level.
///
/// Cheap to clone (a shared handle). Obtained from
/// [`Container::compile`](crate::Container::compile) (the root) or
/// [`Resolver::enter_scope`].
///
/// # Examples
///
/// ```rust
/// use diwire::{Container, Scopes};
///
/// struct Config;
///
/// let container = Container::builder().scopes(Scopes::standard()).build();
/// container.add_instance(Config).unwrap();
///
/// let root = container.compile().unwrap();
/// let request = root.enter_scope(None).unwrap();
/// assert_eq!(request.scope().name(), "request");
/// request.close().unwrap();
/// ```
#[derive(Clone)]
pub struct Resolver {
    inner: Arc<ResolverInner>,
}

impl Resolver {
    pub(crate) fn new_root(plan: Arc<ResolverGenerationPlan>) -> Resolver {
        let scope = plan
            .scope_set
            .by_level(plan.root_scope_level)
            .expect("plan root scope exists in its scope set");
        Resolver::new_inner(plan, scope, None, None, true)
    }

    fn new_inner(
        plan: Arc<ResolverGenerationPlan>,
        scope: Scope,
        parent: Option<Resolver>,
        context: Option<Context>,
        cleanup_enabled: bool,
    ) -> Resolver {
        let cell_count = plan
            .scope_plan_at(scope.level())
            .map(|p| p.owned_workflows.len())
            .unwrap_or(0);
        let cells = (0..cell_count)
            .map(|_| SlotCell::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Resolver {
            inner: Arc::new(ResolverInner {
                plan,
                scope,
                parent,
                context,
                cleanup_enabled,
                cleanup: Mutex::new(CleanupBag::default()),
                owned_scope_resolvers: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                cells,
                open_cache: Mutex::new(ahash::AHashMap::new()),
            }),
        }
    }

    /// The scope this resolver executes at.
    pub fn scope(&self) -> Scope {
        self.inner.scope
    }

    /// Whether this resolver has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> DiResult<()> {
        if self.is_closed() {
            return Err(DiError::scope_mismatch(format!(
                "resolver for scope '{}' is closed",
                self.inner.scope.name()
            )));
        }
        Ok(())
    }

    fn scope_plan(&self) -> &ScopePlan {
        self.inner
            .plan
            .scope_plan_at(self.inner.scope.level())
            .expect("resolver scope is part of its plan")
    }

    /// Nearest resolver in the ancestry chain at exactly `level`.
    fn ancestor_at(&self, level: u32) -> Option<Resolver> {
        let mut current = Some(self.clone());
        while let Some(resolver) = current {
            if resolver.inner.scope.level() == level {
                return Some(resolver);
            }
            current = resolver.inner.parent.clone();
        }
        None
    }

    // ----- Typed resolution surface -----

    /// Resolves a concrete type.
    pub fn resolve<T: Send + Sync + 'static>(&self) -> DiResult<Arc<T>> {
        self.resolve_key(&Key::of::<T>())?.downcast::<T>()
    }

    /// Resolves a concrete type, awaiting async providers.
    pub async fn aresolve<T: Send + Sync + 'static>(&self) -> DiResult<Arc<T>> {
        self.aresolve_key(&Key::of::<T>()).await?.downcast::<T>()
    }

    /// `Maybe` semantics: `None` iff the key is neither registered nor
    /// matchable through an open-generic template.
    pub fn resolve_maybe<T: Send + Sync + 'static>(&self) -> DiResult<Option<Arc<T>>> {
        match self.resolve::<T>() {
            Ok(value) => Ok(Some(value)),
            Err(DiError::NotRegistered(_)) => Ok(None),
            Err(error) => Err(error),
        }
    }

    /// Async `Maybe` semantics; swallows `NotRegistered` only.
    pub async fn aresolve_maybe<T: Send + Sync + 'static>(&self) -> DiResult<Option<Arc<T>>> {
        match self.aresolve::<T>().await {
            Ok(value) => Ok(Some(value)),
            Err(DiError::NotRegistered(_)) => Ok(None),
            Err(error) => Err(error),
        }
    }

    /// All bindings whose canonical base key is `T`, in registration order.
    pub fn resolve_all<T: Send + Sync + 'static>(&self) -> DiResult<Vec<Arc<T>>> {
        let workflows = self
            .inner
            .plan
            .all_workflows_by_key
            .get(&Key::of::<T>())
            .cloned()
            .unwrap_or_default();
        workflows
            .into_iter()
            .map(|workflow| self.resolve_workflow(workflow)?.downcast::<T>())
            .collect()
    }

    /// A lazy handle that resolves `T` at invocation time.
    pub fn provider_of<T: Send + Sync + 'static>(&self) -> ProviderHandle<T> {
        let this = self.clone();
        let key = Key::of::<T>();
        ProviderHandle::new(Arc::new(move || this.resolve_key(&key)))
    }

    /// A lazy async handle that resolves `T` at invocation time.
    pub fn async_provider_of<T: Send + Sync + 'static>(&self) -> AsyncProviderHandle<T> {
        let this = self.clone();
        let key = Key::of::<T>();
        AsyncProviderHandle::new(Arc::new(move || this.aresolve_key_inner(key.clone())))
    }

    /// Looks `T` up in the nearest context frame.
    pub fn from_context<T: Send + Sync + 'static>(&self) -> DiResult<Arc<T>> {
        let key = Key::of::<T>();
        match self.lookup_context(&key) {
            Some(value) => value.downcast::<T>(),
            None => Err(self.context_miss(&key)),
        }
    }

    // ----- Key-level dispatch -----

    /// Resolves an arbitrary key, applying wrapper fallbacks and
    /// open-generic matching on registry miss.
    pub fn resolve_key(&self, key: &Key) -> DiResult<Value> {
        self.ensure_open()?;
        if let Some(workflow) = self.inner.plan.workflow_for_key(key) {
            return self.resolve_workflow(workflow);
        }
        if let Some((kind, inner)) = key.as_wrapper() {
            return self.resolve_wrapper_sync(kind, inner);
        }
        self.resolve_open_fallback(key)
    }

    /// Async form of [`Resolver::resolve_key`].
    pub async fn aresolve_key(&self, key: &Key) -> DiResult<Value> {
        self.aresolve_key_inner(key.clone()).await
    }

    pub(crate) fn aresolve_key_inner(&self, key: Key) -> BoxFuture<DiResult<Value>> {
        let this = self.clone();
        Box::pin(async move {
            this.ensure_open()?;
            if let Some(workflow) = this.inner.plan.workflow_for_key(&key) {
                return this.aresolve_workflow(workflow).await;
            }
            if let Some((kind, inner)) = key.as_wrapper() {
                return this.resolve_wrapper_async(kind, inner).await;
            }
            if let Some((spec, map)) =
                find_best_match(&this.inner.plan.open_specs, &key)?
            {
                return this.aresolve_open(&spec, &map, &key).await;
            }
            Err(DiError::not_registered(key.display_name()))
        })
    }

    fn resolve_wrapper_sync(&self, kind: WrapperKind, inner: &Key) -> DiResult<Value> {
        match kind {
            WrapperKind::Maybe => {
                // Maybe[Provider[X]] yields the handle itself.
                if let Some((
                    handle_kind @ (WrapperKind::Provider | WrapperKind::AsyncProvider),
                    handle_inner,
                )) = inner.as_wrapper()
                {
                    return self.make_handle_value(handle_kind, handle_inner);
                }
                if let Some((WrapperKind::FromContext, ctx_key)) = inner.as_wrapper() {
                    return Ok(Value::new::<Option<Value>>(self.lookup_context(ctx_key)));
                }
                match self.resolve_key(inner) {
                    Ok(value) => Ok(Value::new(Some(value))),
                    Err(DiError::NotRegistered(_)) => Ok(Value::new::<Option<Value>>(None)),
                    Err(error) => Err(error),
                }
            }
            WrapperKind::Provider | WrapperKind::AsyncProvider => {
                self.make_handle_value(kind, inner)
            }
            WrapperKind::FromContext => match self.lookup_context(inner) {
                Some(value) => Ok(value),
                None => Err(self.context_miss(inner)),
            },
            WrapperKind::All => {
                let workflows = self
                    .inner
                    .plan
                    .all_workflows_by_key
                    .get(inner)
                    .cloned()
                    .unwrap_or_default();
                let values: DiResult<Vec<Value>> = workflows
                    .into_iter()
                    .map(|workflow| self.resolve_workflow(workflow))
                    .collect();
                Ok(Value::new(values?))
            }
        }
    }

    async fn resolve_wrapper_async(&self, kind: WrapperKind, inner: &Key) -> DiResult<Value> {
        match kind {
            WrapperKind::Maybe => {
                if let Some((
                    handle_kind @ (WrapperKind::Provider | WrapperKind::AsyncProvider),
                    handle_inner,
                )) = inner.as_wrapper()
                {
                    return self.make_handle_value(handle_kind, handle_inner);
                }
                if let Some((WrapperKind::FromContext, ctx_key)) = inner.as_wrapper() {
                    return Ok(Value::new::<Option<Value>>(self.lookup_context(ctx_key)));
                }
                match self.aresolve_key_inner(inner.clone()).await {
                    Ok(value) => Ok(Value::new(Some(value))),
                    Err(DiError::NotRegistered(_)) => Ok(Value::new::<Option<Value>>(None)),
                    Err(error) => Err(error),
                }
            }
            WrapperKind::All => {
                let workflows = self
                    .inner
                    .plan
                    .all_workflows_by_key
                    .get(inner)
                    .cloned()
                    .unwrap_or_default();
                let mut values = Vec::with_capacity(workflows.len());
                for workflow in workflows {
                    values.push(self.aresolve_workflow(workflow).await?);
                }
                Ok(Value::new(values))
            }
            _ => self.resolve_wrapper_sync(kind, inner),
        }
    }

    fn make_handle_value(&self, kind: WrapperKind, inner: &Key) -> DiResult<Value> {
        let this = self.clone();
        let key = inner.clone();
        match kind {
            WrapperKind::Provider => Ok(Value::new(RawProviderHandle {
                call: Arc::new(move || this.resolve_key(&key)),
            })),
            WrapperKind::AsyncProvider => Ok(Value::new(RawAsyncProviderHandle {
                call: Arc::new(move || this.aresolve_key_inner(key.clone())),
            })),
            _ => unreachable!("handle values are only built for provider wrappers"),
        }
    }

    fn resolve_open_fallback(&self, key: &Key) -> DiResult<Value> {
        if let Some((spec, map)) = find_best_match(&self.inner.plan.open_specs, key)? {
            return self.resolve_open(&spec, &map, key);
        }
        Err(DiError::not_registered(key.display_name()))
    }

    // ----- Per-slot workflow execution -----

    fn workflow(&self, index: usize) -> &ProviderWorkflowPlan {
        &self.inner.plan.workflows[index]
    }

    pub(crate) fn resolve_workflow(&self, index: usize) -> DiResult<Value> {
        let wf = self.workflow(index);

        if let Some(owner) = wf.cache_owner_scope_level {
            let current = self.inner.scope.level();
            if owner > current {
                return Err(DiError::scope_mismatch(format!(
                    "{} is cached at scope '{}' (level {owner}) and cannot be resolved from \
                     scope '{}' (level {current})",
                    wf.key,
                    wf.scope_name,
                    self.inner.scope.name()
                )));
            }
            if owner < current {
                let ancestor = self.ancestor_at(owner).ok_or_else(|| {
                    DiError::scope_mismatch(format!(
                        "no resolver at scope level {owner} in the ancestry of '{}'",
                        self.inner.scope.name()
                    ))
                })?;
                return ancestor.resolve_workflow(index);
            }
        } else if wf.scope_level < self.inner.scope.level()
            && wf.max_required_scope_level <= wf.scope_level
        {
            // Transient whose whole subgraph lives at its declaring scope:
            // delegate so handles and cleanup bind that resolver.
            if let Some(ancestor) = self.ancestor_at(wf.scope_level) {
                return ancestor.resolve_workflow(index);
            }
        }

        if wf.requires_async {
            return Err(DiError::async_in_sync(format!(
                "{} requires async resolution; use aresolve",
                wf.key
            )));
        }

        let psr = self.provider_scope_resolver(wf)?;

        if wf.is_cached {
            let cell_index = self.scope_plan().cache_index[&index];
            let cell = &self.inner.cells[cell_index];
            if let Some(value) = cell.value.get() {
                return Ok(value.clone());
            }
            di_trace!(
                key = %wf.key,
                slot = wf.slot,
                kind = wf.kind.label(),
                lifetime = ?wf.lifetime,
                "building cached provider"
            );
            if wf.uses_thread_lock {
                return cell
                    .value
                    .get_or_try_init(|| self.build_sync(wf, psr.as_ref()))
                    .cloned();
            }
            let value = self.build_sync(wf, psr.as_ref())?;
            return Ok(cell.value.get_or_init(|| value).clone());
        }

        self.build_sync(wf, psr.as_ref())
    }

    pub(crate) fn aresolve_workflow(&self, index: usize) -> BoxFuture<DiResult<Value>> {
        let this = self.clone();
        Box::pin(async move {
            let wf = this.workflow(index);
            if !wf.requires_async {
                return this.resolve_workflow(index);
            }

            if let Some(owner) = wf.cache_owner_scope_level {
                let current = this.inner.scope.level();
                if owner > current {
                    return Err(DiError::scope_mismatch(format!(
                        "{} is cached at scope '{}' (level {owner}) and cannot be resolved \
                         from scope '{}' (level {current})",
                        wf.key,
                        wf.scope_name,
                        this.inner.scope.name()
                    )));
                }
                if owner < current {
                    let ancestor = this.ancestor_at(owner).ok_or_else(|| {
                        DiError::scope_mismatch(format!(
                            "no resolver at scope level {owner} in the ancestry of '{}'",
                            this.inner.scope.name()
                        ))
                    })?;
                    return ancestor.aresolve_workflow(index).await;
                }
            } else if wf.scope_level < this.inner.scope.level()
                && wf.max_required_scope_level <= wf.scope_level
            {
                if let Some(ancestor) = this.ancestor_at(wf.scope_level) {
                    return ancestor.aresolve_workflow(index).await;
                }
            }

            let psr = this.provider_scope_resolver(wf)?;

            if wf.is_cached {
                let cell_index = this.scope_plan().cache_index[&index];
                let cell = &this.inner.cells[cell_index];
                if let Some(value) = cell.value.get() {
                    return Ok(value.clone());
                }
                di_trace!(
                    key = %wf.key,
                    slot = wf.slot,
                    lock_mode = ?wf.lock_mode,
                    provider_async = wf.is_provider_async,
                    "building cached provider (async)"
                );
                if wf.uses_async_lock {
                    let _guard = cell.async_lock.lock().await;
                    if let Some(value) = cell.value.get() {
                        return Ok(value.clone());
                    }
                    let value = this.build_async(wf, psr.as_ref()).await?;
                    return Ok(cell.value.get_or_init(|| value).clone());
                }
                let value = this.build_async(wf, psr.as_ref()).await?;
                return Ok(cell.value.get_or_init(|| value).clone());
            }

            this.build_async(wf, psr.as_ref()).await
        })
    }

    /// The resolver owning the provider's declared scope level, used to
    /// register cleanup for generator and context-manager providers.
    fn provider_scope_resolver(&self, wf: &ProviderWorkflowPlan) -> DiResult<Option<Resolver>> {
        let psr = self.ancestor_at(wf.scope_level);
        if psr.is_none() && wf.payload.has_cleanup() {
            return Err(DiError::scope_mismatch(format!(
                "{} needs its declaring scope '{}' (level {}) for cleanup registration, \
                 which is not in the ancestry of '{}'",
                wf.key,
                wf.scope_name,
                wf.scope_level,
                self.inner.scope.name()
            )));
        }
        Ok(psr)
    }

    // ----- Value construction -----

    fn build_sync(&self, wf: &ProviderWorkflowPlan, psr: Option<&Resolver>) -> DiResult<Value> {
        match &wf.payload {
            ProviderPayload::Instance(value) => Ok(value.clone()),
            ProviderPayload::SyncCall(call) => {
                let mut args = self.collect_args_sync(wf)?;
                call(&mut args)
            }
            ProviderPayload::SyncResource(call) => {
                let psr = psr.expect("checked by provider_scope_resolver");
                let mut args = self.collect_args_sync(wf)?;
                let (value, teardown) = call(&mut args)?;
                if psr.inner.cleanup_enabled {
                    psr.inner.cleanup.lock().push_sync(teardown);
                }
                Ok(value)
            }
            ProviderPayload::AsyncCall(_) | ProviderPayload::AsyncResource(_) => {
                Err(DiError::async_in_sync(format!(
                    "{} has an async payload; use aresolve",
                    wf.key
                )))
            }
        }
    }

    async fn build_async(
        &self,
        wf: &ProviderWorkflowPlan,
        psr: Option<&Resolver>,
    ) -> DiResult<Value> {
        match &wf.payload {
            ProviderPayload::Instance(value) => Ok(value.clone()),
            ProviderPayload::SyncCall(call) => {
                let mut args = self.collect_args_async(wf).await?;
                call(&mut args)
            }
            ProviderPayload::SyncResource(call) => {
                let psr = psr.expect("checked by provider_scope_resolver");
                let mut args = self.collect_args_async(wf).await?;
                let (value, teardown) = call(&mut args)?;
                if psr.inner.cleanup_enabled {
                    psr.inner.cleanup.lock().push_sync(teardown);
                }
                Ok(value)
            }
            ProviderPayload::AsyncCall(call) => {
                let args = self.collect_args_async(wf).await?;
                call(args).await
            }
            ProviderPayload::AsyncResource(call) => {
                let psr = psr.expect("checked by provider_scope_resolver");
                let args = self.collect_args_async(wf).await?;
                let (value, teardown) = call(args).await?;
                if psr.inner.cleanup_enabled {
                    psr.inner.cleanup.lock().push_async(teardown);
                }
                Ok(value)
            }
        }
    }

    fn collect_args_sync(&self, wf: &ProviderWorkflowPlan) -> DiResult<ResolvedArgs> {
        let mut args = ResolvedArgs::new();
        for plan in &wf.dependency_plans {
            let slot = match &plan.kind {
                DependencyPlanKind::Provider { workflow, .. } => {
                    ArgSlot::Value(self.resolve_workflow(*workflow)?)
                }
                DependencyPlanKind::OpenDependency { key, .. } => {
                    ArgSlot::Value(self.resolve_key(key)?)
                }
                DependencyPlanKind::Context { key, optional } => {
                    match self.lookup_context(key) {
                        Some(value) => ArgSlot::Value(value),
                        None if *optional => ArgSlot::NoneLiteral,
                        None => return Err(self.context_miss(key)),
                    }
                }
                DependencyPlanKind::Handle { workflow, is_async } => {
                    self.make_handle_slot(*workflow, *is_async)
                }
                DependencyPlanKind::All { workflows, .. } => {
                    let values: DiResult<Vec<Value>> = workflows
                        .iter()
                        .map(|workflow| self.resolve_workflow(*workflow))
                        .collect();
                    ArgSlot::Many(values?)
                }
                DependencyPlanKind::Literal(literal) => literal_slot(*literal),
                DependencyPlanKind::Omit => ArgSlot::Omitted,
            };
            args.push(plan.param.name(), slot);
        }
        Ok(args)
    }

    async fn collect_args_async(&self, wf: &ProviderWorkflowPlan) -> DiResult<ResolvedArgs> {
        let mut args = ResolvedArgs::new();
        for plan in &wf.dependency_plans {
            let slot = match &plan.kind {
                DependencyPlanKind::Provider {
                    workflow,
                    requires_async,
                } => {
                    let value = if *requires_async {
                        self.aresolve_workflow(*workflow).await?
                    } else {
                        self.resolve_workflow(*workflow)?
                    };
                    ArgSlot::Value(value)
                }
                DependencyPlanKind::OpenDependency { key, .. } => {
                    ArgSlot::Value(self.aresolve_key_inner(key.clone()).await?)
                }
                DependencyPlanKind::Context { key, optional } => {
                    match self.lookup_context(key) {
                        Some(value) => ArgSlot::Value(value),
                        None if *optional => ArgSlot::NoneLiteral,
                        None => return Err(self.context_miss(key)),
                    }
                }
                DependencyPlanKind::Handle { workflow, is_async } => {
                    self.make_handle_slot(*workflow, *is_async)
                }
                DependencyPlanKind::All {
                    workflows,
                    requires_async,
                } => {
                    let mut values = Vec::with_capacity(workflows.len());
                    for workflow in workflows {
                        let value = if *requires_async {
                            self.aresolve_workflow(*workflow).await?
                        } else {
                            self.resolve_workflow(*workflow)?
                        };
                        values.push(value);
                    }
                    ArgSlot::Many(values)
                }
                DependencyPlanKind::Literal(literal) => literal_slot(*literal),
                DependencyPlanKind::Omit => ArgSlot::Omitted,
            };
            args.push(plan.param.name(), slot);
        }
        Ok(args)
    }

    fn make_handle_slot(&self, workflow: usize, is_async: bool) -> ArgSlot {
        let this = self.clone();
        if is_async {
            ArgSlot::AsyncHandle(Arc::new(move || this.aresolve_workflow(workflow)))
        } else {
            ArgSlot::Handle(Arc::new(move || this.resolve_workflow(workflow)))
        }
    }

    // ----- Open-generic execution -----

    /// The cache cell for a closed key on this resolver, created on first
    /// use. Cells give open-generic materializations the same
    /// single-construction semantics as flat per-slot caches.
    fn open_cell(&self, closed_key: &Key) -> Arc<SlotCell> {
        self.inner
            .open_cache
            .lock()
            .entry(closed_key.clone())
            .or_insert_with(|| Arc::new(SlotCell::new()))
            .clone()
    }

    fn resolve_open(
        &self,
        spec: &Arc<OpenGenericSpec>,
        map: &VarMap,
        closed_key: &Key,
    ) -> DiResult<Value> {
        if spec.is_async {
            return Err(DiError::async_in_sync(format!(
                "{closed_key} matches an async open-generic template; use aresolve"
            )));
        }
        let owner = self.open_owner(spec, closed_key)?;
        if spec.lifetime != Lifetime::Scoped {
            return self.build_open_sync(spec, map, closed_key, &owner);
        }

        let cell = owner.open_cell(closed_key);
        if let Some(value) = cell.value.get() {
            return Ok(value.clone());
        }
        let effective = spec.lock_mode.effective(self.inner.plan.has_async_specs);
        if effective == LockMode::Thread {
            return cell
                .value
                .get_or_try_init(|| self.build_open_sync(spec, map, closed_key, &owner))
                .cloned();
        }
        // LockMode::None, or an async-mode plan reached on the sync path:
        // concurrent builders race and the first store wins.
        let value = self.build_open_sync(spec, map, closed_key, &owner)?;
        Ok(cell.value.get_or_init(|| value).clone())
    }

    async fn aresolve_open(
        &self,
        spec: &Arc<OpenGenericSpec>,
        map: &VarMap,
        closed_key: &Key,
    ) -> DiResult<Value> {
        let owner = self.open_owner(spec, closed_key)?;
        if spec.lifetime != Lifetime::Scoped {
            return self.build_open_async(spec, map, closed_key, &owner).await;
        }

        let cell = owner.open_cell(closed_key);
        if let Some(value) = cell.value.get() {
            return Ok(value.clone());
        }
        let effective = spec.lock_mode.effective(self.inner.plan.has_async_specs);
        if effective == LockMode::None {
            let value = self.build_open_async(spec, map, closed_key, &owner).await?;
            return Ok(cell.value.get_or_init(|| value).clone());
        }
        // Thread and Async modes both serialize on the cell's async lock:
        // a blocking get_or_try_init cannot await the build.
        let _guard = cell.async_lock.lock().await;
        if let Some(value) = cell.value.get() {
            return Ok(value.clone());
        }
        let value = self.build_open_async(spec, map, closed_key, &owner).await?;
        Ok(cell.value.get_or_init(|| value).clone())
    }

    fn build_open_sync(
        &self,
        spec: &Arc<OpenGenericSpec>,
        map: &VarMap,
        closed_key: &Key,
        owner: &Resolver,
    ) -> DiResult<Value> {
        let mut args = ResolvedArgs::new();
        for binding in &spec.bindings {
            let slot = self.open_binding_slot_sync(spec, binding, map)?;
            args.push(binding.param.name(), slot);
        }
        match &spec.payload {
            ProviderPayload::SyncCall(call) => call(&mut args),
            ProviderPayload::SyncResource(call) => {
                let (value, teardown) = call(&mut args)?;
                if owner.inner.cleanup_enabled {
                    owner.inner.cleanup.lock().push_sync(teardown);
                }
                Ok(value)
            }
            ProviderPayload::Instance(value) => Ok(value.clone()),
            _ => Err(DiError::async_in_sync(format!(
                "{closed_key} matches an async open-generic template; use aresolve"
            ))),
        }
    }

    async fn build_open_async(
        &self,
        spec: &Arc<OpenGenericSpec>,
        map: &VarMap,
        _closed_key: &Key,
        owner: &Resolver,
    ) -> DiResult<Value> {
        let mut args = ResolvedArgs::new();
        for binding in &spec.bindings {
            let slot = self.open_binding_slot_async(spec, binding, map).await?;
            args.push(binding.param.name(), slot);
        }
        match &spec.payload {
            ProviderPayload::SyncCall(call) => call(&mut args),
            ProviderPayload::AsyncCall(call) => call(args).await,
            ProviderPayload::Instance(value) => Ok(value.clone()),
            ProviderPayload::SyncResource(call) => {
                let (value, teardown) = call(&mut args)?;
                if owner.inner.cleanup_enabled {
                    owner.inner.cleanup.lock().push_sync(teardown);
                }
                Ok(value)
            }
            ProviderPayload::AsyncResource(call) => {
                let (value, teardown) = call(args).await?;
                if owner.inner.cleanup_enabled {
                    owner.inner.cleanup.lock().push_async(teardown);
                }
                Ok(value)
            }
        }
    }

    fn open_owner(
        &self,
        spec: &Arc<OpenGenericSpec>,
        closed_key: &Key,
    ) -> DiResult<Resolver> {
        if spec.scope_level > self.inner.scope.level() {
            return Err(DiError::scope_mismatch(format!(
                "{closed_key} lives at scope '{}' (level {}) and cannot be resolved from \
                 scope '{}' (level {})",
                spec.scope_name,
                spec.scope_level,
                self.inner.scope.name(),
                self.inner.scope.level()
            )));
        }
        self.ancestor_at(spec.scope_level).ok_or_else(|| {
            DiError::scope_mismatch(format!(
                "no resolver at scope level {} in the ancestry of '{}'",
                spec.scope_level,
                self.inner.scope.name()
            ))
        })
    }

    fn open_binding_slot_sync(
        &self,
        spec: &Arc<OpenGenericSpec>,
        binding: &crate::open_generics::OpenBinding,
        map: &VarMap,
    ) -> DiResult<ArgSlot> {
        match &binding.kind {
            OpenBindingKind::GenericArgument(var)
            | OpenBindingKind::GenericArgumentType(var) => {
                let bound = map.get(*var).ok_or_else(|| {
                    DiError::InvalidGenericArgument(format!(
                        "type variable in template {} has no bound argument",
                        spec.template
                    ))
                })?;
                Ok(ArgSlot::TypeArg(bound.clone()))
            }
            OpenBindingKind::Dependency(template) => {
                let substituted = substitute(template, map);
                if substituted.is_open() {
                    return Err(DiError::InvalidGenericArgument(format!(
                        "dependency template {template} of {} still contains free type \
                         variables after substitution",
                        spec.template
                    )));
                }
                Ok(ArgSlot::Value(self.resolve_key(&substituted)?))
            }
        }
    }

    async fn open_binding_slot_async(
        &self,
        spec: &Arc<OpenGenericSpec>,
        binding: &crate::open_generics::OpenBinding,
        map: &VarMap,
    ) -> DiResult<ArgSlot> {
        match &binding.kind {
            OpenBindingKind::Dependency(template) => {
                let substituted = substitute(template, map);
                if substituted.is_open() {
                    return Err(DiError::InvalidGenericArgument(format!(
                        "dependency template {template} of {} still contains free type \
                         variables after substitution",
                        spec.template
                    )));
                }
                Ok(ArgSlot::Value(self.aresolve_key_inner(substituted).await?))
            }
            _ => self.open_binding_slot_sync(spec, binding, map),
        }
    }

    // ----- Context -----

    /// Walks outward through the chain of opening resolvers, returning the
    /// value at the nearest frame containing `key`.
    fn lookup_context(&self, key: &Key) -> Option<Value> {
        let mut current = Some(self.clone());
        while let Some(resolver) = current {
            if let Some(context) = &resolver.inner.context {
                if let Some(value) = context.get(key) {
                    return Some(value);
                }
            }
            current = resolver.inner.parent.clone();
        }
        None
    }

    fn context_miss(&self, key: &Key) -> DiError {
        DiError::not_registered(format!(
            "{} was not provided in any context frame reachable from scope '{}'; \
             pass it via enter_scope(.., context)",
            key,
            self.inner.scope.name()
        ))
    }

    // ----- Scope transitions -----

    /// Enters a deeper scope. `None` targets the default next scope (the
    /// nearest deeper non-skippable one).
    pub fn enter_scope(&self, target: Option<Scope>) -> DiResult<Resolver> {
        self.enter_scope_inner(target, None)
    }

    /// Enters a deeper scope with a context frame attached to the new
    /// resolver.
    pub fn enter_scope_with_context(
        &self,
        target: Option<Scope>,
        context: Context,
    ) -> DiResult<Resolver> {
        self.enter_scope_inner(target, Some(context))
    }

    fn enter_scope_inner(
        &self,
        target: Option<Scope>,
        context: Option<Context>,
    ) -> DiResult<Resolver> {
        self.ensure_open()?;
        let plan = &self.inner.plan;
        let current = self.inner.scope.level();
        let default_next = plan.scope_set.default_next(current);

        let target = match target {
            None => default_next.ok_or_else(|| {
                DiError::scope_mismatch(format!(
                    "no scope deeper than '{}' to enter",
                    self.inner.scope.name()
                ))
            })?,
            Some(scope) => {
                let known = match plan.scope_set.by_level(scope.level()) {
                    Some(known) if known.name() == scope.name() => known,
                    _ => {
                        return Err(DiError::scope_mismatch(format!(
                            "scope '{}' (level {}) is not part of this container's scope set",
                            scope.name(),
                            scope.level()
                        )))
                    }
                };
                if known.level() == current {
                    return Ok(self.clone());
                }
                if known.level() < current {
                    return Err(DiError::scope_mismatch(format!(
                        "cannot enter scope '{}' (level {}) from deeper scope '{}' (level \
                         {current})",
                        known.name(),
                        known.level(),
                        self.inner.scope.name()
                    )));
                }
                known
            }
        };

        di_debug!(
            from = self.inner.scope.name(),
            to = target.name(),
            "entering scope"
        );

        if Some(target) == default_next {
            return Ok(Resolver::new_inner(
                plan.clone(),
                target,
                Some(self.clone()),
                context,
                self.inner.cleanup_enabled,
            ));
        }

        let path = plan.scope_set.transition_path(current, target.level())?;
        let mut context = context;
        let mut previous = self.clone();
        let mut built = Vec::with_capacity(path.len());
        let last_index = path.len() - 1;
        for (index, scope) in path.into_iter().enumerate() {
            let frame = if index == last_index {
                context.take()
            } else {
                None
            };
            let resolver = Resolver::new_inner(
                plan.clone(),
                scope,
                Some(previous.clone()),
                frame,
                self.inner.cleanup_enabled,
            );
            built.push(resolver.clone());
            previous = resolver;
        }
        let deepest = built.pop().expect("transition path is never empty");
        *deepest.inner.owned_scope_resolvers.lock() = built;
        Ok(deepest)
    }

    // ----- Exit and cleanup -----

    /// Drains this resolver's cleanup stack LIFO, then closes owned
    /// intermediate resolvers LIFO. Idempotent. An async cleanup callback
    /// on this path is an `AsyncDependencyInSyncContext` error; remaining
    /// sync callbacks still run.
    pub fn close(&self) -> DiResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        di_debug!(scope = self.inner.scope.name(), "closing resolver");
        let callbacks = self.inner.cleanup.lock().take();
        let mut first_error = cleanup::drain_sync(callbacks);

        let owned = std::mem::take(&mut *self.inner.owned_scope_resolvers.lock());
        for resolver in owned.into_iter().rev() {
            if let Err(error) = resolver.close() {
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Async form of [`Resolver::close`]; runs async teardowns.
    pub async fn aclose(&self) -> DiResult<()> {
        self.aclose_boxed().await
    }

    fn aclose_boxed(&self) -> BoxFuture<DiResult<()>> {
        let this = self.clone();
        Box::pin(async move {
            if this.inner.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            di_debug!(scope = this.inner.scope.name(), "closing resolver (async)");
            let callbacks = this.inner.cleanup.lock().take();
            let mut first_error = cleanup::drain_async(callbacks).await;

            let owned = std::mem::take(&mut *this.inner.owned_scope_resolvers.lock());
            for resolver in owned.into_iter().rev() {
                if let Err(error) = resolver.aclose_boxed().await {
                    first_error.get_or_insert(error);
                }
            }
            match first_error {
                Some(error) => Err(error),
                None => Ok(()),
            }
        })
    }
}

fn literal_slot(literal: LiteralKind) -> ArgSlot {
    match literal {
        LiteralKind::None => ArgSlot::NoneLiteral,
        LiteralKind::EmptyTuple => ArgSlot::EmptyTuple,
        LiteralKind::EmptyMap => ArgSlot::EmptyMap,
    }
}

impl Drop for ResolverInner {
    fn drop(&mut self) {
        if !*self.closed.get_mut() && !self.cleanup.get_mut().is_empty() {
            di_warn!(
                "resolver for scope '{}' dropped with pending cleanup callbacks; call \
                 close() or aclose() before dropping",
                self.scope.name()
            );
        }
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("scope", &self.inner.scope.name())
            .field("level", &self.inner.scope.level())
            .field("closed", &self.is_closed())
            .finish()
    }
}
