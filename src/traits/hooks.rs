//! Plug-in hooks consulted during registration.
//!
//! Framework integrations reach the container only through these narrow
//! hooks: a configuration-key policy ("is this key a self-constructible
//! configuration key? build it with no dependencies") and an
//! autoregistration policy (eligibility of a key as a concrete
//! autoregistration).

use crate::key::Key;
use crate::lifetime::Lifetime;
use crate::provider::{ResolvedArgs, Value};
use crate::DiResult;
use std::sync::Arc;

/// A pending registration supplied by an [`AutoRegistrationPolicy`].
pub struct AutoProvider {
    /// Dependencies of the autoregistered provider.
    pub dependencies: Vec<crate::provider::Dependency>,
    /// The factory payload.
    pub factory: Arc<dyn Fn(&mut ResolvedArgs) -> DiResult<Value> + Send + Sync>,
    /// Lifetime override; the container default applies when `None`.
    pub lifetime: Option<Lifetime>,
}

/// Policy hook deciding whether an unregistered dependency key may be
/// autoregistered as a concrete provider, and how.
pub trait AutoRegistrationPolicy: Send + Sync {
    /// Whether `key` is eligible for concrete autoregistration.
    fn eligible(&self, key: &Key) -> bool;

    /// The provider to register for an eligible key.
    fn provider(&self, key: &Key) -> Option<AutoProvider>;
}

/// Policy hook recognizing self-constructible configuration keys, built
/// with no dependencies.
pub trait ConfigKeyPolicy: Send + Sync {
    /// A zero-dependency factory for `key`, when it is a configuration key.
    fn build(&self, key: &Key)
        -> Option<Arc<dyn Fn() -> DiResult<Value> + Send + Sync>>;
}
