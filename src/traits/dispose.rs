//! Disposal traits for context-manager providers.

use async_trait::async_trait;

/// Synchronous disposal hook for resources registered through
/// [`add_context_manager`](crate::Container::add_context_manager).
///
/// The engine enters the resource on construction and registers `dispose`
/// on the provider's declared scope resolver; it runs at scope exit, LIFO.
///
/// # Examples
///
/// ```rust
/// use diwire::Dispose;
///
/// struct Connection {
///     url: String,
/// }
///
/// impl Dispose for Connection {
///     fn dispose(&self) {
///         println!("closing {}", self.url);
///     }
/// }
/// ```
pub trait Dispose: Send + Sync + 'static {
    /// Releases the resource.
    fn dispose(&self);
}

/// Asynchronous disposal hook for resources registered through
/// [`add_async_context_manager`](crate::Container::add_async_context_manager).
///
/// Runs at async scope exit (`aclose`), LIFO. Encountering one on the sync
/// exit path is an `AsyncDependencyInSyncContext` error.
#[async_trait]
pub trait AsyncDispose: Send + Sync + 'static {
    /// Releases the resource, possibly suspending.
    async fn dispose(&self);
}
