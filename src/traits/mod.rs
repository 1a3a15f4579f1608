//! Public traits for disposable resources and container hooks.

mod dispose;
mod hooks;

pub use dispose::{AsyncDispose, Dispose};
pub use hooks::{AutoProvider, AutoRegistrationPolicy, ConfigKeyPolicy};
