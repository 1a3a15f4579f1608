//! Provider lifetime and lock mode definitions.

/// Provider lifetimes controlling instance caching behavior.
///
/// # Lifetime Characteristics
///
/// - **Scoped**: one instance per scope window at the provider's declared
///   scope level; a scoped provider declared at the root level behaves as an
///   application-wide singleton.
/// - **Transient**: a new instance on every resolution, never cached.
///
/// Pre-built instances registered with `add_instance` always behave as
/// scoped-at-root with no construction cost.
///
/// # Examples
///
/// ```rust
/// use diwire::{Container, Lifetime};
///
/// struct Config;
///
/// let container = Container::builder().build();
/// container
///     .add_factory::<Config, _>([], |_| Ok(Config))
///     .unwrap();
///
/// let a = container.resolve::<Config>().unwrap();
/// let b = container.resolve::<Config>().unwrap();
/// // Default lifetime is Scoped at root: same instance.
/// assert!(std::sync::Arc::ptr_eq(&a, &b));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifetime {
    /// Single instance per scope window, cached at the provider's declared
    /// scope level for the lifetime of that resolver.
    Scoped,
    /// New instance per resolution, never cached.
    Transient,
}

/// Locking discipline for the first build of a cached provider.
///
/// Once a cached value is stored, subsequent reads are lock-free; the mode
/// only governs how concurrent first builds are serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Serialize concurrent first builds with a thread mutex.
    Thread,
    /// Serialize concurrent first builds with an async mutex; required when
    /// the dependency chain suspends.
    Async,
    /// No locking. Correctness relies on the caller not racing resolution of
    /// the same slot.
    None,
    /// Pick `Thread` or `Async` per plan, based on whether the plan contains
    /// async providers.
    Auto,
}

impl LockMode {
    /// Resolves `Auto` against the plan-wide async flag; explicit modes pass
    /// through unchanged.
    pub(crate) fn effective(self, has_async_specs: bool) -> LockMode {
        match self {
            LockMode::Auto if has_async_specs => LockMode::Async,
            LockMode::Auto => LockMode::Thread,
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_lock_mode_follows_plan_asyncness() {
        assert_eq!(LockMode::Auto.effective(true), LockMode::Async);
        assert_eq!(LockMode::Auto.effective(false), LockMode::Thread);
        assert_eq!(LockMode::None.effective(true), LockMode::None);
        assert_eq!(LockMode::Thread.effective(true), LockMode::Thread);
    }
}
