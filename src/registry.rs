//! Provider registry: specs indexed by key and by slot, with savepoint
//! support for transactional registration and cleanup-flag propagation.

use std::collections::BTreeMap;

use ahash::AHashMap;

use crate::error::{DiError, DiResult};
use crate::key::{Key, WrapperKind};
use crate::provider::ProviderSpec;

/// Flat registry of provider specs.
///
/// Slots are assigned monotonically and never reused; replacement by key
/// keeps the key→slot mapping stable so compiled-plan invalidation is the
/// only consequence of re-registration.
#[derive(Clone, Default)]
pub(crate) struct Registry {
    by_key: AHashMap<Key, u32>,
    specs: BTreeMap<u32, ProviderSpec>,
    next_slot: u32,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Registry::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.specs.len()
    }

    /// Inserts a new spec, assigning the next slot. Fails if the key is
    /// already bound; use [`Registry::replace_by_key`] for rebinding.
    pub(crate) fn add(&mut self, mut spec: ProviderSpec) -> DiResult<u32> {
        if self.by_key.contains_key(&spec.key) {
            return self.replace_by_key(spec);
        }
        let slot = self.next_slot;
        self.next_slot += 1;
        spec.slot = slot;
        self.by_key.insert(spec.key.clone(), slot);
        self.specs.insert(slot, spec);
        Ok(slot)
    }

    /// Replaces the spec bound to `spec.key`, keeping its slot.
    pub(crate) fn replace_by_key(&mut self, mut spec: ProviderSpec) -> DiResult<u32> {
        let slot = *self.by_key.get(&spec.key).ok_or_else(|| {
            DiError::not_registered(format!("{} (cannot replace unbound key)", spec.key))
        })?;
        spec.slot = slot;
        self.specs.insert(slot, spec);
        Ok(slot)
    }

    /// Moves the binding at `from` to the key `to`, keeping its slot. Used
    /// when a decoration chain claims a binding's public key.
    pub(crate) fn reassign_key(&mut self, from: &Key, to: Key) -> DiResult<()> {
        let slot = self
            .by_key
            .remove(from)
            .ok_or_else(|| DiError::not_registered(from.display_name()))?;
        let spec = self
            .specs
            .get_mut(&slot)
            .expect("slot indexed by key is present");
        spec.key = to.clone();
        self.by_key.insert(to, slot);
        Ok(())
    }

    /// Removes the binding for `key`, freeing neither the slot number nor
    /// renumbering others.
    pub(crate) fn remove_by_key(&mut self, key: &Key) -> Option<ProviderSpec> {
        let slot = self.by_key.remove(key)?;
        self.specs.remove(&slot)
    }

    pub(crate) fn contains(&self, key: &Key) -> bool {
        self.by_key.contains_key(key)
    }

    pub(crate) fn find_by_key(&self, key: &Key) -> Option<&ProviderSpec> {
        let slot = self.by_key.get(key)?;
        self.specs.get(slot)
    }

    pub(crate) fn get_by_key(&self, key: &Key) -> DiResult<&ProviderSpec> {
        self.find_by_key(key)
            .ok_or_else(|| DiError::not_registered(key.display_name()))
    }

    /// All specs in ascending slot (registration) order.
    pub(crate) fn values(&self) -> impl Iterator<Item = &ProviderSpec> {
        self.specs.values()
    }

    /// Slots sharing a canonical base key, in registration order. Feeds
    /// `All[K]` planning and cleanup propagation.
    pub(crate) fn slots_by_base_key(&self) -> AHashMap<Key, Vec<u32>> {
        let mut index: AHashMap<Key, Vec<u32>> = AHashMap::new();
        for spec in self.specs.values() {
            if matches!(spec.key, Key::Alias { .. }) {
                continue;
            }
            index
                .entry(spec.key.base_key().clone())
                .or_default()
                .push(spec.slot);
        }
        index
    }

    /// Recomputes transitive `needs_cleanup` flags to a fixed point.
    ///
    /// Runs after every mutation: dependents can be registered before their
    /// dependencies, so direct flags alone are not enough.
    pub(crate) fn refresh_needs_cleanup(&mut self) {
        let base_index = self.slots_by_base_key();
        loop {
            let mut changed = false;
            let flags: AHashMap<u32, bool> = self
                .specs
                .values()
                .map(|spec| (spec.slot, spec.needs_cleanup))
                .collect();

            let mut updates: Vec<u32> = Vec::new();
            for spec in self.specs.values() {
                if spec.needs_cleanup {
                    continue;
                }
                let mut needs = spec.payload.has_cleanup();
                if !needs {
                    'deps: for dependency in &spec.dependencies {
                        for slot in self.cleanup_dependency_slots(&dependency.key, &base_index) {
                            if flags.get(&slot).copied().unwrap_or(false) {
                                needs = true;
                                break 'deps;
                            }
                        }
                    }
                }
                if needs {
                    updates.push(spec.slot);
                    changed = true;
                }
            }
            for slot in updates {
                if let Some(spec) = self.specs.get_mut(&slot) {
                    spec.needs_cleanup = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// Slots a dependency key pulls into the cleanup graph. Lazy handles and
    /// context lookups contribute nothing; `Maybe` contributes its inner
    /// binding when present; `All` contributes every base-key sibling.
    fn cleanup_dependency_slots(
        &self,
        key: &Key,
        base_index: &AHashMap<Key, Vec<u32>>,
    ) -> Vec<u32> {
        let (key, _) = strip_maybe(key);
        match key.as_wrapper() {
            Some((WrapperKind::FromContext, _))
            | Some((WrapperKind::Provider, _))
            | Some((WrapperKind::AsyncProvider, _)) => Vec::new(),
            Some((WrapperKind::All, inner)) => {
                base_index.get(inner).cloned().unwrap_or_default()
            }
            Some((WrapperKind::Maybe, _)) | None => self
                .find_by_key(key)
                .map(|spec| vec![spec.slot])
                .unwrap_or_default(),
        }
    }
}

/// Splits `Maybe[K]` into (inner key, was_optional).
pub(crate) fn strip_maybe(key: &Key) -> (&Key, bool) {
    match key.as_wrapper() {
        Some((WrapperKind::Maybe, inner)) => (inner, true),
        _ => (key, false),
    }
}
