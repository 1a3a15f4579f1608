//! Open-generic templates: registration, structural matching against closed
//! keys, type-variable substitution, and specificity scoring.
//!
//! An open template is a [`Key`] containing free type variables. When a
//! resolve misses the flat registry with a closed generic key, each template
//! is matched structurally; the most specific match wins and its bindings
//! are executed through the ordinary workflow machinery.

use std::sync::Arc;

use ahash::AHashMap;

use crate::error::{DiError, DiResult};
use crate::key::{Key, KeyArg, TypeVar, TypeVarId};
use crate::lifetime::{Lifetime, LockMode};
use crate::provider::{Dependency, ParamDescriptor, ProviderKind, ProviderPayload};

/// Binding template kinds inside an open-generic spec.
#[derive(Debug, Clone)]
pub(crate) enum OpenBindingKind {
    /// A pure type variable: the payload receives the bound argument key.
    GenericArgument(TypeVarId),
    /// A `type[V]`-shaped template: same value, type-shaped parameter.
    GenericArgumentType(TypeVarId),
    /// A dependency template; substituted and resolved recursively.
    Dependency(Key),
}

#[derive(Debug, Clone)]
pub(crate) struct OpenBinding {
    pub(crate) kind: OpenBindingKind,
    pub(crate) param: ParamDescriptor,
}

/// A registered open-generic provider.
pub(crate) struct OpenGenericSpec {
    pub(crate) template: Key,
    pub(crate) kind: ProviderKind,
    pub(crate) payload: ProviderPayload,
    pub(crate) lifetime: Lifetime,
    pub(crate) scope_level: u32,
    pub(crate) scope_name: &'static str,
    pub(crate) lock_mode: LockMode,
    pub(crate) is_async: bool,
    pub(crate) needs_cleanup: bool,
    pub(crate) vars: Vec<TypeVar>,
    pub(crate) bindings: Vec<OpenBinding>,
    pub(crate) order: u32,
}

impl OpenGenericSpec {
    fn var(&self, id: TypeVarId) -> Option<&TypeVar> {
        self.vars.iter().find(|var| var.id() == id)
    }
}

/// Append-only registry of open-generic specs, in registration order.
#[derive(Clone, Default)]
pub(crate) struct OpenGenericRegistry {
    specs: Vec<Arc<OpenGenericSpec>>,
    next_order: u32,
}

impl OpenGenericRegistry {
    pub(crate) fn new() -> Self {
        OpenGenericRegistry::default()
    }

    pub(crate) fn specs(&self) -> &[Arc<OpenGenericSpec>] {
        &self.specs
    }

    /// Validates and appends an open spec built from a dependency list.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn add(
        &mut self,
        template: Key,
        kind: ProviderKind,
        payload: ProviderPayload,
        lifetime: Lifetime,
        scope_level: u32,
        scope_name: &'static str,
        lock_mode: LockMode,
        vars: Vec<TypeVar>,
        dependencies: &[Dependency],
    ) -> DiResult<()> {
        if !template.is_open() {
            return Err(DiError::invalid_registration(format!(
                "open-generic registration for {template} contains no type variables"
            )));
        }
        let mut template_vars = Vec::new();
        template.collect_vars(&mut template_vars);
        for var in &template_vars {
            if !vars.iter().any(|v| v.id() == *var) {
                return Err(DiError::invalid_registration(format!(
                    "template {template} uses an undeclared type variable"
                )));
            }
        }

        let mut bindings = Vec::with_capacity(dependencies.len());
        for dependency in dependencies {
            let kind = classify_binding(&dependency.key, &template_vars, &template)?;
            bindings.push(OpenBinding {
                kind,
                param: dependency.param,
            });
        }

        let is_async = payload.is_async();
        let needs_cleanup = payload.has_cleanup();
        let order = self.next_order;
        self.next_order += 1;
        self.specs.push(Arc::new(OpenGenericSpec {
            template,
            kind,
            payload,
            lifetime,
            scope_level,
            scope_name,
            lock_mode,
            is_async,
            needs_cleanup,
            vars,
            bindings,
            order,
        }));
        Ok(())
    }
}

fn classify_binding(
    key: &Key,
    template_vars: &[TypeVarId],
    template: &Key,
) -> DiResult<OpenBindingKind> {
    if let Key::Var(var) = key {
        if !template_vars.contains(var) {
            return Err(DiError::invalid_registration(format!(
                "binding variable is not part of template {template}"
            )));
        }
        return Ok(OpenBindingKind::GenericArgument(*var));
    }
    if let Some(var) = key.as_type_of_var() {
        if !template_vars.contains(&var) {
            return Err(DiError::invalid_registration(format!(
                "binding variable is not part of template {template}"
            )));
        }
        return Ok(OpenBindingKind::GenericArgumentType(var));
    }
    if key.is_open() {
        let mut used = Vec::new();
        key.collect_vars(&mut used);
        for var in used {
            if !template_vars.contains(&var) {
                return Err(DiError::invalid_registration(format!(
                    "dependency template {key} uses a variable not bound by {template}"
                )));
            }
        }
    }
    Ok(OpenBindingKind::Dependency(key.clone()))
}

/// A finalized type-variable mapping from a structural match.
#[derive(Debug, Clone, Default)]
pub(crate) struct VarMap(AHashMap<TypeVarId, Key>);

impl VarMap {
    pub(crate) fn get(&self, var: TypeVarId) -> Option<&Key> {
        self.0.get(&var)
    }

    fn bind(&mut self, var: TypeVarId, key: &Key) -> bool {
        match self.0.get(&var) {
            Some(existing) => existing == key,
            None => {
                self.0.insert(var, key.clone());
                true
            }
        }
    }

    fn iter(&self) -> impl Iterator<Item = (TypeVarId, &Key)> {
        self.0.iter().map(|(var, key)| (*var, key))
    }
}

/// Structural match of an open template against a closed candidate key.
/// Walks origins and argument tuples pairwise; a template variable either
/// fixes the mapping or must equal its earlier binding.
pub(crate) fn match_template(template: &Key, candidate: &Key, map: &mut VarMap) -> bool {
    match (template, candidate) {
        (Key::Var(var), _) => map.bind(*var, candidate),
        (Key::Concrete(a), Key::Concrete(b)) => a == b,
        (
            Key::Component {
                base: a,
                component: ca,
            },
            Key::Component {
                base: b,
                component: cb,
            },
        ) => ca == cb && match_template(a, b, map),
        (
            Key::Wrapper { kind: ka, inner: a },
            Key::Wrapper { kind: kb, inner: b },
        ) => ka == kb && match_template(a, b, map),
        (
            Key::Generic {
                origin: oa,
                args: aa,
            },
            Key::Generic {
                origin: ob,
                args: ab,
            },
        ) => {
            if oa != ob || aa.len() != ab.len() {
                return false;
            }
            aa.iter().zip(ab.iter()).all(|(ta, ca)| match (ta, ca) {
                (KeyArg::Var(var), KeyArg::Key(key)) => map.bind(*var, key),
                (KeyArg::Key(tk), KeyArg::Key(ck)) => match_template(tk, ck, map),
                // A closed candidate never carries variables.
                (_, KeyArg::Var(_)) => false,
            })
        }
        _ => false,
    }
}

/// Specificity of a template: the count of concrete structural nodes. More
/// concrete arguments beat bare variables; ties break by registration order.
pub(crate) fn specificity(key: &Key) -> u32 {
    match key {
        Key::Var(_) => 0,
        Key::Concrete(_) => 1,
        Key::Component { base, .. } | Key::Alias { base, .. } => 1 + specificity(base),
        Key::Wrapper { inner, .. } => 1 + specificity(inner),
        Key::Generic { args, .. } => {
            1 + args
                .iter()
                .map(|arg| match arg {
                    KeyArg::Key(key) => specificity(key),
                    KeyArg::Var(_) => 0,
                })
                .sum::<u32>()
        }
    }
}

/// Substitutes bound variables through a template. Variables missing from
/// the map survive; callers reject leftover openness.
pub(crate) fn substitute(key: &Key, map: &VarMap) -> Key {
    match key {
        Key::Var(var) => map.get(*var).cloned().unwrap_or_else(|| key.clone()),
        Key::Concrete(_) => key.clone(),
        Key::Component { base, component } => Key::Component {
            base: Box::new(substitute(base, map)),
            component,
        },
        Key::Alias { base, layer } => Key::Alias {
            base: Box::new(substitute(base, map)),
            layer: *layer,
        },
        Key::Wrapper { kind, inner } => Key::Wrapper {
            kind: *kind,
            inner: Box::new(substitute(inner, map)),
        },
        Key::Generic { origin, args } => Key::Generic {
            origin: *origin,
            args: args
                .iter()
                .map(|arg| match arg {
                    KeyArg::Var(var) => match map.get(*var) {
                        Some(bound) => KeyArg::Key(bound.clone()),
                        None => arg.clone(),
                    },
                    KeyArg::Key(key) => KeyArg::Key(substitute(key, map)),
                })
                .collect(),
        },
    }
}

/// Validates the final variable mapping against each variable's constraints
/// and bound.
pub(crate) fn validate_var_map(spec: &OpenGenericSpec, map: &VarMap) -> DiResult<()> {
    for (var, argument) in map.iter() {
        if let Some(decl) = spec.var(var) {
            if !decl.accepts(argument) {
                return Err(DiError::InvalidGenericArgument(format!(
                    "argument {argument} violates the constraints of type variable '{}' in template {}",
                    decl.name(),
                    spec.template
                )));
            }
        }
    }
    Ok(())
}

/// Finds the best open-generic match for a closed key: highest specificity,
/// ties broken by later registration. A constraint violation surfaces only
/// when no other template matches.
pub(crate) fn find_best_match(
    specs: &[Arc<OpenGenericSpec>],
    key: &Key,
) -> DiResult<Option<(Arc<OpenGenericSpec>, VarMap)>> {
    let mut best: Option<(u32, u32, Arc<OpenGenericSpec>, VarMap)> = None;
    let mut validation_error: Option<DiError> = None;

    for spec in specs {
        let mut map = VarMap::default();
        if !match_template(&spec.template, key, &mut map) {
            continue;
        }
        if let Err(error) = validate_var_map(spec, &map) {
            validation_error = Some(error);
            continue;
        }
        let score = specificity(&spec.template);
        let replace = match &best {
            None => true,
            Some((best_score, best_order, _, _)) => {
                score > *best_score || (score == *best_score && spec.order >= *best_order)
            }
        };
        if replace {
            best = Some((score, spec.order, spec.clone(), map));
        }
    }

    match best {
        Some((_, _, spec, map)) => Ok(Some((spec, map))),
        None => match validation_error {
            Some(error) => Err(error),
            None => Ok(None),
        },
    }
}
