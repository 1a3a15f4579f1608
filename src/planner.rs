//! Resolver generation planning.
//!
//! Consumes a registry snapshot and a root scope; produces the
//! deterministic [`ResolverGenerationPlan`] the execution layer interprets:
//! per-scope plans, per-slot workflow plans with locking, caching, scope
//! placement and dependency wiring, plus dispatch tables and aggregate
//! counts.

use std::any::TypeId;
use std::collections::HashSet;
use std::sync::Arc;

use ahash::AHashMap;

use crate::error::{DiError, DiResult};
use crate::key::{Key, WrapperKind};
use crate::lifetime::{Lifetime, LockMode};
use crate::open_generics::{find_best_match, OpenGenericRegistry, OpenGenericSpec};
use crate::provider::{ParamDescriptor, ParamKind, ProviderKind, ProviderPayload, ProviderSpec};
use crate::registry::{strip_maybe, Registry};
use crate::scope::{Scope, Scopes};

/// How the shared dispatch routes a key to its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchKind {
    /// Plain concrete keys: pointer-identity comparable via `TypeId`.
    Identity,
    /// Everything else goes through the structural equality map.
    EqualityMap,
}

/// Literal inserted for a missing optional dependency without a default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LiteralKind {
    /// Plain parameters receive a none value.
    None,
    /// Star-args parameters receive an empty tuple.
    EmptyTuple,
    /// Star-kwargs parameters receive an empty map.
    EmptyMap,
}

/// Wiring plan for one declared dependency.
#[derive(Debug, Clone)]
pub(crate) enum DependencyPlanKind {
    /// Normal bound key: the dependency's own workflow.
    Provider {
        workflow: usize,
        requires_async: bool,
    },
    /// A key resolvable only through open-generic matching.
    OpenDependency { key: Key, requires_async: bool },
    /// Context lookup for the stripped inner key.
    Context { key: Key, optional: bool },
    /// Lazy handle over the inner workflow.
    Handle { workflow: usize, is_async: bool },
    /// All bindings sharing the canonical base key, registration order.
    All {
        workflows: Vec<usize>,
        requires_async: bool,
    },
    /// Missing optional with no default: insert a literal.
    Literal(LiteralKind),
    /// Missing optional with a default: skip the argument.
    Omit,
}

#[derive(Debug, Clone)]
pub(crate) struct ProviderDependencyPlan {
    pub(crate) kind: DependencyPlanKind,
    pub(crate) param: ParamDescriptor,
}

/// Scope metadata used by the execution layer. The root plan is the one
/// whose scope level equals the plan's root level.
#[derive(Debug, Clone)]
pub(crate) struct ScopePlan {
    pub(crate) scope: Scope,
    /// Workflow indexes whose cache this scope level owns.
    pub(crate) owned_workflows: Vec<usize>,
    /// Workflow index → position in this scope's cache cell array.
    pub(crate) cache_index: AHashMap<usize, usize>,
}

/// Per-slot plan driving the execution layer.
#[derive(Clone)]
pub(crate) struct ProviderWorkflowPlan {
    pub(crate) slot: u32,
    pub(crate) key: Key,
    pub(crate) kind: ProviderKind,
    pub(crate) payload: ProviderPayload,
    pub(crate) lifetime: Lifetime,
    pub(crate) scope_level: u32,
    pub(crate) scope_name: &'static str,
    pub(crate) is_cached: bool,
    pub(crate) cache_owner_scope_level: Option<u32>,
    pub(crate) lock_mode: LockMode,
    pub(crate) effective_lock_mode: LockMode,
    pub(crate) uses_thread_lock: bool,
    pub(crate) uses_async_lock: bool,
    pub(crate) is_provider_async: bool,
    pub(crate) requires_async: bool,
    pub(crate) needs_cleanup: bool,
    pub(crate) max_required_scope_level: u32,
    pub(crate) dispatch_kind: DispatchKind,
    pub(crate) dependency_plans: Vec<ProviderDependencyPlan>,
}

/// Deterministic plan consumed by the compiled resolver tree.
pub(crate) struct ResolverGenerationPlan {
    pub(crate) root_scope_level: u32,
    pub(crate) scope_set: Scopes,
    pub(crate) has_async_specs: bool,
    pub(crate) provider_count: usize,
    pub(crate) cached_provider_count: usize,
    pub(crate) thread_lock_count: usize,
    pub(crate) async_lock_count: usize,
    pub(crate) effective_mode_counts: Vec<(LockMode, usize)>,
    pub(crate) has_cleanup: bool,
    pub(crate) identity_dispatch: AHashMap<TypeId, usize>,
    pub(crate) equality_dispatch: AHashMap<Key, usize>,
    pub(crate) all_workflows_by_key: AHashMap<Key, Vec<usize>>,
    pub(crate) scopes: Vec<ScopePlan>,
    pub(crate) workflows: Vec<ProviderWorkflowPlan>,
    pub(crate) open_specs: Vec<Arc<OpenGenericSpec>>,
}

impl ResolverGenerationPlan {
    pub(crate) fn scope_plan_at(&self, level: u32) -> Option<&ScopePlan> {
        self.scopes.iter().find(|plan| plan.scope.level() == level)
    }

    pub(crate) fn workflow_for_key(&self, key: &Key) -> Option<usize> {
        if let Some(type_id) = key.concrete_type_id() {
            return self.identity_dispatch.get(&type_id).copied();
        }
        self.equality_dispatch.get(key).copied()
    }
}

/// Builds deterministic metadata for the compiled resolver tree.
pub(crate) struct ResolverGenerationPlanner<'a> {
    root_scope: Scope,
    scope_set: &'a Scopes,
    registry: &'a Registry,
    open_registry: &'a OpenGenericRegistry,
    work_specs: Vec<&'a ProviderSpec>,
    workflow_index_by_slot: AHashMap<u32, usize>,
    all_slots_by_key: AHashMap<Key, Vec<u32>>,
}

impl<'a> ResolverGenerationPlanner<'a> {
    pub(crate) fn new(
        root_scope: Scope,
        scope_set: &'a Scopes,
        registry: &'a Registry,
        open_registry: &'a OpenGenericRegistry,
    ) -> DiResult<Self> {
        if scope_set.by_level(root_scope.level()).is_none() {
            return Err(DiError::invalid_spec(format!(
                "root scope '{}' (level {}) is not part of the scope set",
                root_scope.name(),
                root_scope.level()
            )));
        }

        let work_specs: Vec<&ProviderSpec> = registry
            .values()
            .filter(|spec| spec.scope_level >= root_scope.level())
            .collect();

        let workflow_index_by_slot: AHashMap<u32, usize> = work_specs
            .iter()
            .enumerate()
            .map(|(index, spec)| (spec.slot, index))
            .collect();

        let mut all_slots_by_key: AHashMap<Key, Vec<u32>> = AHashMap::new();
        for spec in &work_specs {
            if matches!(spec.key, Key::Alias { .. }) {
                continue;
            }
            all_slots_by_key
                .entry(spec.key.base_key().clone())
                .or_default()
                .push(spec.slot);
        }

        Ok(ResolverGenerationPlanner {
            root_scope,
            scope_set,
            registry,
            open_registry,
            work_specs,
            workflow_index_by_slot,
            all_slots_by_key,
        })
    }

    /// Builds the resolver generation plan.
    pub(crate) fn build(self) -> DiResult<ResolverGenerationPlan> {
        let has_async_specs = self.work_specs.iter().any(|spec| spec.is_async)
            || self.open_registry.specs().iter().any(|spec| spec.is_async);

        let requires_async = self.propagate(|spec| spec.is_async, true)?;
        let max_scope_level = self.propagate_levels()?;

        let mut workflows = Vec::with_capacity(self.work_specs.len());
        for (index, spec) in self.work_specs.iter().enumerate() {
            workflows.push(self.build_workflow(
                spec,
                index,
                &requires_async,
                &max_scope_level,
                has_async_specs,
            )?);
        }

        let mut identity_dispatch = AHashMap::new();
        let mut equality_dispatch = AHashMap::new();
        for (index, workflow) in workflows.iter().enumerate() {
            // Alias keys stay private to decoration chains.
            if matches!(workflow.key, Key::Alias { .. }) {
                continue;
            }
            match workflow.dispatch_kind {
                DispatchKind::Identity => {
                    let type_id = workflow
                        .key
                        .concrete_type_id()
                        .expect("identity dispatch implies a concrete key");
                    identity_dispatch.insert(type_id, index);
                }
                DispatchKind::EqualityMap => {
                    equality_dispatch.insert(workflow.key.clone(), index);
                }
            }
        }

        let all_workflows_by_key: AHashMap<Key, Vec<usize>> = self
            .all_slots_by_key
            .iter()
            .map(|(key, slots)| {
                let indexes = slots
                    .iter()
                    .map(|slot| self.workflow_index_by_slot[slot])
                    .collect();
                (key.clone(), indexes)
            })
            .collect();

        let scopes = self.build_scope_plans(&workflows);

        let provider_count = workflows.len();
        let cached_provider_count = workflows.iter().filter(|w| w.is_cached).count();
        let thread_lock_count = workflows.iter().filter(|w| w.uses_thread_lock).count();
        let async_lock_count = workflows.iter().filter(|w| w.uses_async_lock).count();
        let effective_mode_counts = [LockMode::Thread, LockMode::Async, LockMode::None]
            .into_iter()
            .map(|mode| {
                let count = workflows
                    .iter()
                    .filter(|w| w.effective_lock_mode == mode)
                    .count();
                (mode, count)
            })
            .collect();
        let has_cleanup = workflows.iter().any(|w| w.needs_cleanup)
            || self.open_registry.specs().iter().any(|s| s.needs_cleanup);

        Ok(ResolverGenerationPlan {
            root_scope_level: self.root_scope.level(),
            scope_set: self.scope_set.clone(),
            has_async_specs,
            provider_count,
            cached_provider_count,
            thread_lock_count,
            async_lock_count,
            effective_mode_counts,
            has_cleanup,
            identity_dispatch,
            equality_dispatch,
            all_workflows_by_key,
            scopes,
            workflows,
            open_specs: self.open_registry.specs().to_vec(),
        })
    }

    fn build_scope_plans(&self, workflows: &[ProviderWorkflowPlan]) -> Vec<ScopePlan> {
        self.scope_set
            .iter()
            .filter(|scope| scope.level() >= self.root_scope.level())
            .map(|scope| {
                let owned_workflows: Vec<usize> = workflows
                    .iter()
                    .enumerate()
                    .filter(|(_, w)| w.cache_owner_scope_level == Some(scope.level()))
                    .map(|(index, _)| index)
                    .collect();
                let cache_index = owned_workflows
                    .iter()
                    .enumerate()
                    .map(|(cell, workflow)| (*workflow, cell))
                    .collect();
                ScopePlan {
                    scope,
                    owned_workflows,
                    cache_index,
                }
            })
            .collect()
    }

    fn build_workflow(
        &self,
        spec: &ProviderSpec,
        _index: usize,
        requires_async_by_slot: &AHashMap<u32, bool>,
        max_scope_level_by_slot: &AHashMap<u32, u32>,
        has_async_specs: bool,
    ) -> DiResult<ProviderWorkflowPlan> {
        let is_cached = spec.is_cached();
        let cache_owner_scope_level = if !is_cached {
            None
        } else if spec.kind == ProviderKind::Instance {
            Some(self.root_scope.level())
        } else {
            Some(spec.scope_level)
        };

        let requires_async = requires_async_by_slot[&spec.slot];
        let effective_lock_mode = spec.lock_mode.effective(has_async_specs);
        let uses_thread_lock =
            is_cached && effective_lock_mode == LockMode::Thread && !requires_async;
        let uses_async_lock =
            is_cached && effective_lock_mode == LockMode::Async && requires_async;
        let dispatch_kind = match spec.key {
            Key::Concrete(_) => DispatchKind::Identity,
            _ => DispatchKind::EqualityMap,
        };

        let mut dependency_plans = Vec::with_capacity(spec.dependencies.len());
        for dependency in &spec.dependencies {
            dependency_plans.push(self.plan_dependency(
                spec,
                &dependency.key,
                dependency.param,
                requires_async_by_slot,
            )?);
        }

        Ok(ProviderWorkflowPlan {
            slot: spec.slot,
            key: spec.key.clone(),
            kind: spec.kind,
            payload: spec.payload.clone(),
            lifetime: spec.lifetime,
            scope_level: spec.scope_level,
            scope_name: spec.scope_name,
            is_cached,
            cache_owner_scope_level,
            lock_mode: spec.lock_mode,
            effective_lock_mode,
            uses_thread_lock,
            uses_async_lock,
            is_provider_async: spec.is_async,
            requires_async,
            needs_cleanup: spec.needs_cleanup,
            max_required_scope_level: max_scope_level_by_slot[&spec.slot],
            dispatch_kind,
            dependency_plans,
        })
    }

    fn plan_dependency(
        &self,
        spec: &ProviderSpec,
        dependency_key: &Key,
        param: ParamDescriptor,
        requires_async_by_slot: &AHashMap<u32, bool>,
    ) -> DiResult<ProviderDependencyPlan> {
        let (key, optional) = strip_maybe(dependency_key);

        if let Some((WrapperKind::FromContext, inner)) = key.as_wrapper() {
            return Ok(ProviderDependencyPlan {
                kind: DependencyPlanKind::Context {
                    key: inner.clone(),
                    optional,
                },
                param,
            });
        }

        if let Some((kind @ (WrapperKind::Provider | WrapperKind::AsyncProvider), inner)) =
            key.as_wrapper()
        {
            if matches!(param.kind, ParamKind::VarPositional | ParamKind::VarKeyword) {
                return Err(DiError::invalid_spec(format!(
                    "Provider and AsyncProvider dependencies are not supported for star \
                     parameters: '{}' in provider for {}",
                    param.name, spec.key
                )));
            }
            let inner_spec = self.registry.find_by_key(inner).ok_or_else(|| {
                DiError::not_registered(format!(
                    "{} required by provider for {}",
                    inner, spec.key
                ))
            })?;
            if inner_spec.scope_level > spec.scope_level {
                return Err(DiError::invalid_spec(format!(
                    "provider handle scope mismatch: {} in provider for {} (scope level {}) \
                     cannot bind deeper dependency {} (scope level {})",
                    dependency_key, spec.key, spec.scope_level, inner, inner_spec.scope_level
                )));
            }
            let workflow = self.planned_workflow(inner_spec.slot, inner)?;
            return Ok(ProviderDependencyPlan {
                kind: DependencyPlanKind::Handle {
                    workflow,
                    is_async: kind == WrapperKind::AsyncProvider,
                },
                param,
            });
        }

        if let Some((WrapperKind::All, inner)) = key.as_wrapper() {
            if param.kind == ParamKind::VarKeyword {
                return Err(DiError::invalid_spec(format!(
                    "All[..] dependencies are not supported for star-kwargs parameters \
                     ('{}'): the tuple cannot be expanded as a mapping",
                    param.name
                )));
            }
            let slots = self.all_slots_by_key.get(inner).cloned().unwrap_or_default();
            let requires_async = slots
                .iter()
                .any(|slot| requires_async_by_slot[slot]);
            let workflows = slots
                .iter()
                .map(|slot| self.workflow_index_by_slot[slot])
                .collect();
            return Ok(ProviderDependencyPlan {
                kind: DependencyPlanKind::All {
                    workflows,
                    requires_async,
                },
                param,
            });
        }

        match self.registry.find_by_key(key) {
            Some(dependency_spec) => Ok(ProviderDependencyPlan {
                kind: DependencyPlanKind::Provider {
                    workflow: self.planned_workflow(dependency_spec.slot, key)?,
                    requires_async: requires_async_by_slot[&dependency_spec.slot],
                },
                param,
            }),
            None => {
                if let Some((open_spec, _)) = find_best_match(self.open_registry.specs(), key)? {
                    return Ok(ProviderDependencyPlan {
                        kind: DependencyPlanKind::OpenDependency {
                            key: key.clone(),
                            requires_async: open_spec.is_async,
                        },
                        param,
                    });
                }
                if optional {
                    if param.has_default {
                        return Ok(ProviderDependencyPlan {
                            kind: DependencyPlanKind::Omit,
                            param,
                        });
                    }
                    let literal = match param.kind {
                        ParamKind::VarPositional => LiteralKind::EmptyTuple,
                        ParamKind::VarKeyword => LiteralKind::EmptyMap,
                        _ => LiteralKind::None,
                    };
                    return Ok(ProviderDependencyPlan {
                        kind: DependencyPlanKind::Literal(literal),
                        param,
                    });
                }
                Err(DiError::not_registered(format!(
                    "{} required by provider for {}",
                    key, spec.key
                )))
            }
        }
    }

    /// The workflow index for a planned slot; a dependency registered
    /// shallower than the plan's root scope is not resolvable from it.
    fn planned_workflow(&self, slot: u32, key: &Key) -> DiResult<usize> {
        self.workflow_index_by_slot.get(&slot).copied().ok_or_else(|| {
            DiError::invalid_spec(format!(
                "dependency {key} (slot {slot}) lives outside the planned root scope"
            ))
        })
    }

    /// Slots a dependency contributes to graph propagation (async-ness and
    /// required scope level). Wrapper-only kinds contribute nothing; `All`
    /// contributes every base-key sibling.
    fn graph_dependency_slots(&self, dependency_key: &Key) -> DiResult<GraphSlots> {
        let (key, optional) = strip_maybe(dependency_key);
        match key.as_wrapper() {
            Some((WrapperKind::FromContext, _))
            | Some((WrapperKind::Provider, _))
            | Some((WrapperKind::AsyncProvider, _)) => Ok(GraphSlots::none()),
            Some((WrapperKind::All, inner)) => Ok(GraphSlots {
                slots: self.all_slots_by_key.get(inner).cloned().unwrap_or_default(),
                open: None,
            }),
            _ => match self.registry.find_by_key(key) {
                Some(spec) => Ok(GraphSlots {
                    slots: vec![spec.slot],
                    open: None,
                }),
                None => {
                    if let Some((open_spec, _)) =
                        find_best_match(self.open_registry.specs(), key)?
                    {
                        return Ok(GraphSlots {
                            slots: Vec::new(),
                            open: Some((open_spec.is_async, open_spec.scope_level)),
                        });
                    }
                    if optional {
                        Ok(GraphSlots::none())
                    } else {
                        // Reported with full context during dependency planning.
                        Ok(GraphSlots::none())
                    }
                }
            },
        }
    }

    /// Depth-first propagation of a boolean property over the dependency
    /// graph (used for async-ness). Detects cycles.
    fn propagate(
        &self,
        direct: impl Fn(&ProviderSpec) -> bool,
        include_open_async: bool,
    ) -> DiResult<AHashMap<u32, bool>> {
        let by_slot: AHashMap<u32, &ProviderSpec> = self
            .work_specs
            .iter()
            .map(|spec| (spec.slot, *spec))
            .collect();
        let mut resolved: AHashMap<u32, bool> = AHashMap::new();
        let mut in_progress: HashSet<u32> = HashSet::new();

        for slot in by_slot.keys() {
            self.propagate_slot(
                *slot,
                &by_slot,
                &mut resolved,
                &mut in_progress,
                &direct,
                include_open_async,
            )?;
        }
        Ok(resolved)
    }

    fn propagate_slot(
        &self,
        slot: u32,
        by_slot: &AHashMap<u32, &ProviderSpec>,
        resolved: &mut AHashMap<u32, bool>,
        in_progress: &mut HashSet<u32>,
        direct: &impl Fn(&ProviderSpec) -> bool,
        include_open_async: bool,
    ) -> DiResult<bool> {
        if let Some(known) = resolved.get(&slot) {
            return Ok(*known);
        }
        if !in_progress.insert(slot) {
            return Err(DiError::invalid_spec(format!(
                "circular dependency detected while planning provider slot {slot}"
            )));
        }

        let spec = by_slot[&slot];
        let mut value = direct(spec);
        if !value {
            'outer: for dependency in &spec.dependencies {
                let graph = self.graph_dependency_slots(&dependency.key)?;
                if include_open_async {
                    if let Some((open_async, _)) = graph.open {
                        if open_async {
                            value = true;
                            break 'outer;
                        }
                    }
                }
                for dependency_slot in graph.slots {
                    if by_slot.contains_key(&dependency_slot)
                        && self.propagate_slot(
                            dependency_slot,
                            by_slot,
                            resolved,
                            in_progress,
                            direct,
                            include_open_async,
                        )?
                    {
                        value = true;
                        break 'outer;
                    }
                }
            }
        }

        in_progress.remove(&slot);
        resolved.insert(slot, value);
        Ok(value)
    }

    /// Depth-first propagation of the maximum required scope level.
    fn propagate_levels(&self) -> DiResult<AHashMap<u32, u32>> {
        let by_slot: AHashMap<u32, &ProviderSpec> = self
            .work_specs
            .iter()
            .map(|spec| (spec.slot, *spec))
            .collect();
        let mut resolved: AHashMap<u32, u32> = AHashMap::new();
        let mut in_progress: HashSet<u32> = HashSet::new();
        for slot in by_slot.keys() {
            self.propagate_level_slot(*slot, &by_slot, &mut resolved, &mut in_progress)?;
        }
        Ok(resolved)
    }

    fn propagate_level_slot(
        &self,
        slot: u32,
        by_slot: &AHashMap<u32, &ProviderSpec>,
        resolved: &mut AHashMap<u32, u32>,
        in_progress: &mut HashSet<u32>,
    ) -> DiResult<u32> {
        if let Some(known) = resolved.get(&slot) {
            return Ok(*known);
        }
        if !in_progress.insert(slot) {
            return Err(DiError::invalid_spec(format!(
                "circular dependency detected while planning provider slot {slot}"
            )));
        }

        let spec = by_slot[&slot];
        let mut level = spec.scope_level;
        for dependency in &spec.dependencies {
            let graph = self.graph_dependency_slots(&dependency.key)?;
            if let Some((_, open_level)) = graph.open {
                level = level.max(open_level);
            }
            for dependency_slot in graph.slots {
                if by_slot.contains_key(&dependency_slot) {
                    let dependency_level = self.propagate_level_slot(
                        dependency_slot,
                        by_slot,
                        resolved,
                        in_progress,
                    )?;
                    level = level.max(dependency_level);
                }
            }
        }

        in_progress.remove(&slot);
        resolved.insert(slot, level);
        Ok(level)
    }
}

struct GraphSlots {
    slots: Vec<u32>,
    /// Present when the dependency resolves through an open template:
    /// (spec is async, spec scope level).
    open: Option<(bool, u32)>,
}

impl GraphSlots {
    fn none() -> Self {
        GraphSlots {
            slots: Vec::new(),
            open: None,
        }
    }
}
