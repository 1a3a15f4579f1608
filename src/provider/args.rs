//! Type-erased values and the uniform provider calling convention.
//!
//! Every provider payload receives its dependencies as a [`ResolvedArgs`]
//! sequence, pre-resolved by the execution layer according to the plan.
//! Payloads consume arguments in declaration order with the typed `take_*`
//! accessors.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::error::{DiError, DiResult};
use crate::internal::BoxFuture;
use crate::key::Key;

/// A type-erased resolved value.
///
/// Values are `Arc`-backed and cheap to clone; typed access goes through
/// [`Value::downcast`].
#[derive(Clone)]
pub struct Value(Arc<dyn Any + Send + Sync>);

impl Value {
    /// Wraps an owned value.
    pub fn new<T: Send + Sync + 'static>(value: T) -> Value {
        Value(Arc::new(value))
    }

    /// Wraps an existing `Arc`.
    pub fn from_arc<T: Send + Sync + 'static>(arc: Arc<T>) -> Value {
        Value(arc)
    }

    /// Downcasts to a concrete type.
    pub fn downcast<T: Send + Sync + 'static>(self) -> DiResult<Arc<T>> {
        self.0
            .downcast::<T>()
            .map_err(|_| DiError::TypeMismatch(std::any::type_name::<T>()))
    }

    /// Whether the contained value is a `T`.
    pub fn is<T: 'static>(&self) -> bool {
        self.0.is::<T>()
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Value(..)")
    }
}

pub(crate) type UntypedHandleFn = Arc<dyn Fn() -> DiResult<Value> + Send + Sync>;
pub(crate) type UntypedAsyncHandleFn =
    Arc<dyn Fn() -> BoxFuture<DiResult<Value>> + Send + Sync>;

/// A zero-argument lazy resolution handle for `Provider[T]` dependencies.
///
/// Each invocation performs a fresh resolution at that moment: transient
/// targets produce a new value per call, cached targets return the cached
/// one.
#[derive(Clone)]
pub struct ProviderHandle<T> {
    call: UntypedHandleFn,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> ProviderHandle<T> {
    pub(crate) fn new(call: UntypedHandleFn) -> Self {
        ProviderHandle {
            call,
            _marker: PhantomData,
        }
    }

    /// Resolves the target now.
    pub fn get(&self) -> DiResult<Arc<T>> {
        (self.call)()?.downcast::<T>()
    }
}

/// The async counterpart of [`ProviderHandle`], for `AsyncProvider[T]`.
#[derive(Clone)]
pub struct AsyncProviderHandle<T> {
    call: UntypedAsyncHandleFn,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> AsyncProviderHandle<T> {
    pub(crate) fn new(call: UntypedAsyncHandleFn) -> Self {
        AsyncProviderHandle {
            call,
            _marker: PhantomData,
        }
    }

    /// Resolves the target now, awaiting async construction.
    pub async fn get(&self) -> DiResult<Arc<T>> {
        (self.call)().await?.downcast::<T>()
    }
}

/// Untyped lazy handle, surfaced when a `Provider[K]` key is resolved
/// through the key-level API rather than a typed dependency.
#[derive(Clone)]
pub struct RawProviderHandle {
    pub(crate) call: UntypedHandleFn,
}

impl RawProviderHandle {
    /// Resolves the target now.
    pub fn get(&self) -> DiResult<Value> {
        (self.call)()
    }
}

/// Untyped async lazy handle for key-level `AsyncProvider[K]` resolution.
#[derive(Clone)]
pub struct RawAsyncProviderHandle {
    pub(crate) call: UntypedAsyncHandleFn,
}

impl RawAsyncProviderHandle {
    /// Resolves the target now, awaiting async construction.
    pub async fn get(&self) -> DiResult<Value> {
        (self.call)().await
    }
}

/// One resolved argument slot.
pub(crate) enum ArgSlot {
    /// A bound value.
    Value(Value),
    /// Optional dependency missing, no declared default.
    NoneLiteral,
    /// Optional var-positional dependency missing.
    EmptyTuple,
    /// Optional var-keyword dependency missing.
    EmptyMap,
    /// Optional dependency missing with a declared default: the payload
    /// falls back to its own default.
    Omitted,
    /// Lazy sync handle.
    Handle(UntypedHandleFn),
    /// Lazy async handle.
    AsyncHandle(UntypedAsyncHandleFn),
    /// `All[K]` values in registration order.
    Many(Vec<Value>),
    /// A concrete type argument bound through an open-generic template.
    TypeArg(Key),
}

/// The resolved dependency sequence handed to a provider payload.
///
/// Arguments are consumed in declaration order; each `take_*` accessor
/// advances the cursor. Taking past the end or with the wrong accessor
/// shape is a [`DiError::InvalidProviderSpec`].
///
/// # Examples
///
/// ```rust
/// use diwire::Container;
/// use std::sync::Arc;
///
/// struct Engine;
/// struct Session(Arc<Engine>);
///
/// let container = Container::builder().build();
/// container.add_instance(Engine).unwrap();
/// container
///     .add_factory::<Session, _>([diwire::Dependency::of::<Engine>("engine")], |args| {
///         Ok(Session(args.take::<Engine>()?))
///     })
///     .unwrap();
/// ```
pub struct ResolvedArgs {
    slots: SmallVec<[(&'static str, ArgSlot); 4]>,
    cursor: usize,
}

impl ResolvedArgs {
    pub(crate) fn new() -> Self {
        ResolvedArgs {
            slots: SmallVec::new(),
            cursor: 0,
        }
    }

    pub(crate) fn push(&mut self, name: &'static str, slot: ArgSlot) {
        self.slots.push((name, slot));
    }

    /// Replaces the value bound for `name`, used by caller-argument
    /// overrides in injected callables.
    pub(crate) fn override_named(&mut self, name: &str, value: Value) -> bool {
        for (slot_name, slot) in self.slots.iter_mut() {
            if *slot_name == name {
                *slot = ArgSlot::Value(value);
                return true;
            }
        }
        false
    }

    fn next(&mut self) -> DiResult<(&'static str, ArgSlot)> {
        if self.cursor >= self.slots.len() {
            return Err(DiError::invalid_spec(format!(
                "provider payload consumed more arguments than the {} planned",
                self.slots.len()
            )));
        }
        let index = self.cursor;
        self.cursor += 1;
        let name = self.slots[index].0;
        let slot = std::mem::replace(&mut self.slots[index].1, ArgSlot::Omitted);
        Ok((name, slot))
    }

    /// Takes the next argument as a required `T`.
    pub fn take<T: Send + Sync + 'static>(&mut self) -> DiResult<Arc<T>> {
        let (name, slot) = self.next()?;
        match slot {
            ArgSlot::Value(value) => value.downcast::<T>(),
            _ => Err(DiError::invalid_spec(format!(
                "argument '{name}' is not a bound value; use the accessor matching its plan"
            ))),
        }
    }

    /// Takes the next argument as an optional `T` (`Maybe` dependencies).
    /// Missing optionals (omitted or literal-none) yield `None`.
    pub fn take_maybe<T: Send + Sync + 'static>(&mut self) -> DiResult<Option<Arc<T>>> {
        let (name, slot) = self.next()?;
        match slot {
            ArgSlot::Value(value) => value.downcast::<T>().map(Some),
            ArgSlot::NoneLiteral | ArgSlot::Omitted | ArgSlot::EmptyTuple | ArgSlot::EmptyMap => {
                Ok(None)
            }
            _ => Err(DiError::invalid_spec(format!(
                "argument '{name}' is not an optional value"
            ))),
        }
    }

    /// Takes the next argument as an untyped value.
    pub fn take_value(&mut self) -> DiResult<Value> {
        let (name, slot) = self.next()?;
        match slot {
            ArgSlot::Value(value) => Ok(value),
            _ => Err(DiError::invalid_spec(format!(
                "argument '{name}' is not a bound value"
            ))),
        }
    }

    /// Takes the next argument as a lazy `Provider[T]` handle.
    pub fn take_provider<T: Send + Sync + 'static>(&mut self) -> DiResult<ProviderHandle<T>> {
        let (name, slot) = self.next()?;
        match slot {
            ArgSlot::Handle(call) => Ok(ProviderHandle::new(call)),
            _ => Err(DiError::invalid_spec(format!(
                "argument '{name}' is not a provider handle"
            ))),
        }
    }

    /// Takes the next argument as a lazy `AsyncProvider[T]` handle.
    pub fn take_async_provider<T: Send + Sync + 'static>(
        &mut self,
    ) -> DiResult<AsyncProviderHandle<T>> {
        let (name, slot) = self.next()?;
        match slot {
            ArgSlot::AsyncHandle(call) => Ok(AsyncProviderHandle::new(call)),
            _ => Err(DiError::invalid_spec(format!(
                "argument '{name}' is not an async provider handle"
            ))),
        }
    }

    /// Takes the next argument as the `All[T]` tuple, in registration order.
    pub fn take_all<T: Send + Sync + 'static>(&mut self) -> DiResult<Vec<Arc<T>>> {
        let (name, slot) = self.next()?;
        match slot {
            ArgSlot::Many(values) => values
                .into_iter()
                .map(|value| value.downcast::<T>())
                .collect(),
            ArgSlot::EmptyTuple => Ok(Vec::new()),
            _ => Err(DiError::invalid_spec(format!(
                "argument '{name}' is not an All[..] tuple"
            ))),
        }
    }

    /// Takes the next argument as a concrete type argument bound through an
    /// open-generic template.
    pub fn take_type_arg(&mut self) -> DiResult<Key> {
        let (name, slot) = self.next()?;
        match slot {
            ArgSlot::TypeArg(key) => Ok(key),
            _ => Err(DiError::invalid_spec(format!(
                "argument '{name}' is not a generic type argument"
            ))),
        }
    }
}
