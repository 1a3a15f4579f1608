//! Scope context: an immutable key→value mapping attached to a resolver and
//! consulted by `FromContext` lookups, walking outward through the chain of
//! opening resolvers.

use ahash::AHashMap;

use crate::key::Key;
use crate::provider::Value;

/// Immutable context map attached to a scope resolver.
///
/// # Examples
///
/// ```rust
/// use diwire::{Context, Key};
///
/// struct RequestId(pub u64);
///
/// let context = Context::new().with(RequestId(7));
/// assert!(context.contains(&Key::of::<RequestId>()));
/// ```
#[derive(Clone, Default)]
pub struct Context {
    entries: AHashMap<Key, Value>,
}

impl Context {
    /// An empty context.
    pub fn new() -> Self {
        Context::default()
    }

    /// Adds a value under its own concrete type key.
    pub fn with<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        self.entries.insert(Key::of::<T>(), Value::new(value));
        self
    }

    /// Adds a value under an explicit key.
    pub fn with_keyed(mut self, key: Key, value: Value) -> Self {
        self.entries.insert(key, value);
        self
    }

    /// Whether the frame holds `key`.
    pub fn contains(&self, key: &Key) -> bool {
        self.entries.contains_key(key)
    }

    pub(crate) fn get(&self, key: &Key) -> Option<Value> {
        self.entries.get(key).cloned()
    }

    /// Number of entries in the frame.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the frame is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").field("len", &self.len()).finish()
    }
}
