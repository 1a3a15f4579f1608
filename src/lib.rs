//! # diwire
//!
//! Planned, compiled dependency injection for Rust: scoped resolver trees,
//! sync and async resolution, open-generic templates, decoration chains,
//! and deterministic cleanup.
//!
//! ## How it works
//!
//! Registration builds normalized provider specs; `compile()` plans a
//! resolver tree over the scope hierarchy (dependency wiring, async
//! propagation, caching, locking, scope placement); resolution then
//! interprets that plan with per-slot cache cells and double-checked
//! locking, so hot paths stay cheap.
//!
//! ## Quick start
//!
//! ```rust
//! use diwire::{Container, Dependency};
//! use std::sync::Arc;
//!
//! struct Database {
//!     url: &'static str,
//! }
//!
//! struct UserService {
//!     db: Arc<Database>,
//! }
//!
//! let container = Container::builder().build();
//! container.add_instance(Database { url: "postgres://localhost" }).unwrap();
//! container
//!     .add_factory::<UserService, _>([Dependency::of::<Database>("db")], |args| {
//!         Ok(UserService { db: args.take::<Database>()? })
//!     })
//!     .unwrap();
//!
//! let service = container.resolve::<UserService>().unwrap();
//! assert_eq!(service.db.url, "postgres://localhost");
//! ```
//!
//! ## Scopes and cleanup
//!
//! ```rust
//! use diwire::{Container, Dependency, ProviderOptions, Scopes, Teardown};
//!
//! struct Session {
//!     id: u32,
//! }
//!
//! let scopes = Scopes::standard();
//! let request = scopes.by_name("request").unwrap();
//! let container = Container::builder().scopes(scopes).build();
//! container
//!     .add_generator_with::<Session, _>(
//!         ProviderOptions::new().scope(request),
//!         [],
//!         |_| {
//!             Ok((Session { id: 1 }, Box::new(|| Ok(())) as Teardown))
//!         },
//!     )
//!     .unwrap();
//!
//! let scope = container.enter_scope(None).unwrap();
//! let a = scope.resolve::<Session>().unwrap();
//! let b = scope.resolve::<Session>().unwrap();
//! assert!(std::sync::Arc::ptr_eq(&a, &b));
//! scope.close().unwrap(); // teardown runs here, LIFO
//! ```
//!
//! ## Lifetimes
//!
//! - **Scoped** (the default): one instance per scope window, cached at the
//!   provider's declared scope level. Declared at root, this is an
//!   application singleton.
//! - **Transient**: a fresh instance per resolution.
//!
//! Pre-built values registered with [`Container::add_instance`] behave as
//! scoped-at-root with no construction cost.

// Module declarations
pub mod container;
pub mod container_context;
pub mod decoration;
pub mod error;
pub mod inject;
pub mod key;
pub mod lifetime;
pub mod open_generics;
pub mod provider;
pub mod registry;
pub mod resolver;
pub mod scope;
pub mod traits;

// Internal modules
mod internal;
mod planner;

// Re-export core types
pub use container::{Container, ContainerBuilder, DecorateOptions, ProviderOptions};
pub use container_context::{ContainerContext, DeferredInjected};
pub use error::{DiError, DiResult};
pub use inject::{
    InjectCall, InjectContext, InjectOptions, InjectedFn, RESERVED_CONTEXT_PARAM,
    RESERVED_RESOLVER_PARAM,
};
pub use key::{GenericOrigin, Key, KeyArg, TypeVar, TypeVarId, WrapperKind};
pub use lifetime::{Lifetime, LockMode};
pub use provider::{
    AsyncProviderHandle, AsyncTeardown, Dependency, ParamDescriptor, ParamKind, ProviderHandle,
    ProviderKind, RawAsyncProviderHandle, RawProviderHandle, ResolvedArgs, Teardown,
    TeardownFuture, Value,
};
pub use resolver::{Context, Resolver};
pub use scope::{Scope, Scopes, ScopesBuilder};
pub use traits::{AsyncDispose, AutoProvider, AutoRegistrationPolicy, ConfigKeyPolicy, Dispose};
