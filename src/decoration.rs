//! Decoration chains: layered wrapping of an existing binding.
//!
//! A decoration rule wraps the value bound to a target key. The first rule
//! applied to an existing binding moves that binding to an opaque alias key
//! and stacks decorator providers above it; the final layer registers under
//! the target key, so resolving the target yields `RN(...R1(base)...)`.
//! Alias keys never participate in public dispatch.

use ahash::AHashMap;

use crate::error::{DiError, DiResult};
use crate::key::Key;
use crate::provider::{Dependency, ProviderPayload};
use crate::registry::strip_maybe;

/// One decoration rule for a target key. Rules append in application order
/// and persist for the container's lifetime; chains rebuild when rules
/// change or the underlying binding is re-registered.
#[derive(Clone)]
pub(crate) struct DecorationRule {
    pub(crate) payload: ProviderPayload,
    pub(crate) inner_parameter: &'static str,
    pub(crate) dependencies: Vec<Dependency>,
    pub(crate) is_async: bool,
}

/// A materialized chain: the base alias holding the original binding plus
/// one provider per rule.
#[derive(Clone, Debug)]
pub(crate) struct DecorationChain {
    pub(crate) base_key: Key,
    pub(crate) layer_keys: Vec<Key>,
}

/// Decoration rules and materialized chains, keyed by target.
#[derive(Clone, Default)]
pub(crate) struct DecorationState {
    rules: AHashMap<Key, Vec<DecorationRule>>,
    chains: AHashMap<Key, DecorationChain>,
}

impl DecorationState {
    pub(crate) fn rules_for(&self, target: &Key) -> &[DecorationRule] {
        self.rules.get(target).map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn push_rule(&mut self, target: Key, rule: DecorationRule) {
        self.rules.entry(target).or_default().push(rule);
    }

    pub(crate) fn chain_for(&self, target: &Key) -> Option<&DecorationChain> {
        self.chains.get(target)
    }

    pub(crate) fn set_chain(&mut self, target: Key, chain: DecorationChain) {
        self.chains.insert(target, chain);
    }

    pub(crate) fn remove_chain(&mut self, target: &Key) -> Option<DecorationChain> {
        self.chains.remove(target)
    }

    pub(crate) fn has_rules(&self, target: &Key) -> bool {
        self.rules.get(target).map(|r| !r.is_empty()).unwrap_or(false)
    }
}

/// The alias key holding the original (pre-decoration) binding.
pub(crate) fn base_alias(target: &Key) -> Key {
    Key::Alias {
        base: Box::new(target.clone()),
        layer: 0,
    }
}

/// The key a given layer registers under: intermediate layers use alias
/// keys, the final layer is the target itself.
pub(crate) fn layer_provides(target: &Key, layer: usize, layer_count: usize) -> Key {
    if layer + 1 == layer_count {
        target.clone()
    } else {
        Key::Alias {
            base: Box::new(target.clone()),
            layer: (layer + 1) as u32,
        }
    }
}

/// The key a layer's inner parameter resolves: the previous layer, or the
/// base alias for the first layer.
pub(crate) fn layer_inner_key(target: &Key, layer: usize) -> Key {
    Key::Alias {
        base: Box::new(target.clone()),
        layer: layer as u32,
    }
}

/// Picks the decorator dependency that receives the inner value.
///
/// An explicit name must match a declared dependency. Without one, a single
/// dependency whose (optionally `Maybe`-stripped) key equals the target is
/// chosen; a lone dependency also qualifies. Anything else is ambiguous.
pub(crate) fn resolve_inner_parameter(
    target: &Key,
    dependencies: &[Dependency],
    explicit: Option<&'static str>,
) -> DiResult<&'static str> {
    if let Some(name) = explicit {
        if dependencies.iter().any(|dep| dep.param().name() == name) {
            return Ok(name);
        }
        return Err(DiError::invalid_registration(format!(
            "decorator for {target}: inner parameter '{name}' is not among its dependencies"
        )));
    }

    let matching: Vec<&Dependency> = dependencies
        .iter()
        .filter(|dep| {
            let (key, _) = strip_maybe(dep.key());
            key == target
        })
        .collect();
    match matching.as_slice() {
        [only] => Ok(only.param().name()),
        [] if dependencies.len() == 1 => Ok(dependencies[0].param().name()),
        [] => Err(DiError::invalid_registration(format!(
            "decorator for {target}: no dependency matches the decorated key; name the \
             inner parameter explicitly"
        ))),
        _ => Err(DiError::invalid_registration(format!(
            "decorator for {target}: multiple dependencies match the decorated key; name \
             the inner parameter explicitly"
        ))),
    }
}
