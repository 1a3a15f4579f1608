//! Dependency key types for container storage and lookup.
//!
//! A [`Key`] identifies a binding. Keys are structural values: concrete
//! runtime types, component-annotated composites, parameterized generic
//! keys (open when they contain free [`TypeVar`]s), decoration-chain
//! aliases, and wrapper keys recognized at dispatch time.

use std::any::TypeId;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Identity of a type variable inside an open-generic template.
///
/// Obtained from [`TypeVar::id`]. Two occurrences of the same `TypeVarId`
/// in one template must bind to the same concrete argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeVarId(u64);

static NEXT_TYPEVAR_ID: AtomicU64 = AtomicU64::new(1);

/// Bound predicate over candidate argument keys.
pub type TypeVarBound = Arc<dyn Fn(&Key) -> bool + Send + Sync>;

/// A type variable used in open-generic templates.
///
/// Carries optional constraints (an explicit allow-list of keys) and an
/// optional bound predicate; both are validated against the final variable
/// mapping when an open template matches a closed key.
///
/// # Examples
///
/// ```rust
/// use diwire::{Key, TypeVar};
///
/// let t = TypeVar::new("T").constrained([Key::of::<i32>(), Key::of::<String>()]);
/// assert_eq!(t.name(), "T");
/// ```
#[derive(Clone)]
pub struct TypeVar {
    id: TypeVarId,
    name: &'static str,
    constraints: Vec<Key>,
    bound: Option<TypeVarBound>,
}

impl TypeVar {
    /// Creates a fresh type variable. Each call yields a distinct identity.
    pub fn new(name: &'static str) -> Self {
        TypeVar {
            id: TypeVarId(NEXT_TYPEVAR_ID.fetch_add(1, Ordering::Relaxed)),
            name,
            constraints: Vec::new(),
            bound: None,
        }
    }

    /// The variable's identity, as it appears inside keys.
    pub fn id(&self) -> TypeVarId {
        self.id
    }

    /// The variable's display name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Restricts the variable to an explicit set of argument keys.
    pub fn constrained(mut self, keys: impl IntoIterator<Item = Key>) -> Self {
        self.constraints = keys.into_iter().collect();
        self
    }

    /// Restricts the variable with a bound predicate.
    pub fn bounded(mut self, bound: impl Fn(&Key) -> bool + Send + Sync + 'static) -> Self {
        self.bound = Some(Arc::new(bound));
        self
    }

    /// Validates a bound argument against constraints and bound.
    pub(crate) fn accepts(&self, argument: &Key) -> bool {
        if !self.constraints.is_empty() && !self.constraints.iter().any(|c| c == argument) {
            return false;
        }
        if let Some(bound) = &self.bound {
            if !bound(argument) {
                return false;
            }
        }
        true
    }
}

impl fmt::Debug for TypeVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeVar")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("constraints", &self.constraints)
            .field("bounded", &self.bound.is_some())
            .finish()
    }
}

/// Identity of a generic template family (e.g. the `Repository` in
/// `Repository[T]`), derived from a marker type.
#[derive(Debug, Clone, Copy)]
pub struct GenericOrigin {
    id: TypeId,
    name: &'static str,
}

impl GenericOrigin {
    /// Derives an origin from a marker type.
    pub fn of<M: 'static>() -> Self {
        GenericOrigin {
            id: TypeId::of::<M>(),
            name: std::any::type_name::<M>(),
        }
    }

    /// The origin's display name.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for GenericOrigin {
    #[inline(always)]
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for GenericOrigin {}

impl std::hash::Hash for GenericOrigin {
    #[inline(always)]
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Marker origin for `type[T]`-shaped bindings in open-generic templates.
pub(crate) struct TypeOfMarker;

/// An argument position inside a generic key: either a (possibly generic)
/// key or a free type variable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyArg {
    /// A concrete or nested-generic key.
    Key(Key),
    /// A free type variable; its presence makes the key open.
    Var(TypeVarId),
}

impl From<Key> for KeyArg {
    fn from(key: Key) -> Self {
        KeyArg::Key(key)
    }
}

impl From<&TypeVar> for KeyArg {
    fn from(var: &TypeVar) -> Self {
        KeyArg::Var(var.id())
    }
}

/// Wrapper markers recognized at dispatch and planning time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WrapperKind {
    /// Optional dependency; resolves to nothing instead of failing.
    Maybe,
    /// Lazy sync provider handle.
    Provider,
    /// Lazy async provider handle.
    AsyncProvider,
    /// Lookup in the scope context instead of the registry.
    FromContext,
    /// All bindings sharing the canonical base key, in registration order.
    All,
}

impl WrapperKind {
    pub(crate) fn label(self) -> &'static str {
        match self {
            WrapperKind::Maybe => "Maybe",
            WrapperKind::Provider => "Provider",
            WrapperKind::AsyncProvider => "AsyncProvider",
            WrapperKind::FromContext => "FromContext",
            WrapperKind::All => "All",
        }
    }
}

/// Key for binding storage and lookup.
///
/// Keys are equal iff structurally equal, including component metadata.
/// Concrete keys compare by `TypeId` only; the captured type name is kept
/// for diagnostics.
///
/// # Examples
///
/// ```rust
/// use diwire::Key;
///
/// struct Database;
///
/// let plain = Key::of::<Database>();
/// let primary = Key::component_of::<Database>("primary");
/// assert_ne!(plain, primary);
/// assert_eq!(primary.base_key(), &plain);
/// ```
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Key {
    /// A concrete runtime type.
    Concrete(ConcreteKey),
    /// An annotated composite carrying a component marker.
    Component {
        /// The underlying key.
        base: Box<Key>,
        /// The component marker distinguishing sibling bindings.
        component: &'static str,
    },
    /// A parameterized key; open iff any argument contains a variable.
    Generic {
        /// The template family.
        origin: GenericOrigin,
        /// Template arguments, possibly containing variables.
        args: Vec<KeyArg>,
    },
    /// A bare type variable (only meaningful inside open-generic templates).
    Var(TypeVarId),
    /// Opaque decoration-chain alias; never part of public dispatch.
    Alias {
        /// The decorated target key.
        base: Box<Key>,
        /// Chain layer index (0 is the original binding).
        layer: u32,
    },
    /// A wrapper key recognized by dispatch fallbacks.
    Wrapper {
        /// Which wrapper.
        kind: WrapperKind,
        /// The wrapped key.
        inner: Box<Key>,
    },
}

/// Concrete-type key payload: `TypeId` plus a display name.
#[derive(Debug, Clone, Copy)]
pub struct ConcreteKey {
    id: TypeId,
    name: &'static str,
}

impl PartialEq for ConcreteKey {
    #[inline(always)]
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConcreteKey {}

impl std::hash::Hash for ConcreteKey {
    #[inline(always)]
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Key {
    /// Key for a concrete type.
    #[inline(always)]
    pub fn of<T: 'static>() -> Key {
        Key::Concrete(ConcreteKey {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        })
    }

    /// Component-annotated key for a concrete type.
    pub fn component_of<T: 'static>(component: &'static str) -> Key {
        Key::of::<T>().with_component(component)
    }

    /// Wraps this key with a component marker.
    pub fn with_component(self, component: &'static str) -> Key {
        Key::Component {
            base: Box::new(self),
            component,
        }
    }

    /// A generic key for the template family `M` with the given arguments.
    /// Open when any argument is a variable.
    pub fn generic<M: 'static>(args: impl IntoIterator<Item = KeyArg>) -> Key {
        Key::Generic {
            origin: GenericOrigin::of::<M>(),
            args: args.into_iter().collect(),
        }
    }

    /// A `type[T]`-shaped key over a variable, for open-generic bindings
    /// that receive the concrete type argument itself.
    pub fn type_of_var(var: &TypeVar) -> Key {
        Key::Generic {
            origin: GenericOrigin::of::<TypeOfMarker>(),
            args: vec![KeyArg::Var(var.id())],
        }
    }

    /// A bare type-variable key (usable only inside open templates).
    pub fn var(var: &TypeVar) -> Key {
        Key::Var(var.id())
    }

    /// `Maybe[self]`.
    pub fn maybe(self) -> Key {
        self.wrapped(WrapperKind::Maybe)
    }

    /// `Provider[self]`: a lazy sync handle.
    pub fn lazy(self) -> Key {
        self.wrapped(WrapperKind::Provider)
    }

    /// `AsyncProvider[self]`: a lazy async handle.
    pub fn lazy_async(self) -> Key {
        self.wrapped(WrapperKind::AsyncProvider)
    }

    /// `FromContext[self]`.
    pub fn from_context(self) -> Key {
        self.wrapped(WrapperKind::FromContext)
    }

    /// `All[self]`.
    pub fn all(self) -> Key {
        self.wrapped(WrapperKind::All)
    }

    fn wrapped(self, kind: WrapperKind) -> Key {
        Key::Wrapper {
            kind,
            inner: Box::new(self),
        }
    }

    /// The wrapper kind and inner key, when this is a wrapper key.
    pub fn as_wrapper(&self) -> Option<(WrapperKind, &Key)> {
        match self {
            Key::Wrapper { kind, inner } => Some((*kind, inner)),
            _ => None,
        }
    }

    /// The canonical base key: strips a component marker, if any.
    pub fn base_key(&self) -> &Key {
        match self {
            Key::Component { base, .. } => base,
            other => other,
        }
    }

    /// The component marker, if any.
    pub fn component(&self) -> Option<&'static str> {
        match self {
            Key::Component { component, .. } => Some(component),
            _ => None,
        }
    }

    /// The concrete `TypeId` when this is a plain concrete key.
    pub(crate) fn concrete_type_id(&self) -> Option<TypeId> {
        match self {
            Key::Concrete(c) => Some(c.id),
            _ => None,
        }
    }

    /// Whether this key is `type[T]`-shaped over a single variable.
    pub(crate) fn as_type_of_var(&self) -> Option<TypeVarId> {
        match self {
            Key::Generic { origin, args }
                if *origin == GenericOrigin::of::<TypeOfMarker>() && args.len() == 1 =>
            {
                match args[0] {
                    KeyArg::Var(var) => Some(var),
                    KeyArg::Key(_) => None,
                }
            }
            _ => None,
        }
    }

    /// Recursive type-variable containment: true iff any position in the
    /// key holds a variable.
    pub fn is_open(&self) -> bool {
        match self {
            Key::Concrete(_) => false,
            Key::Var(_) => true,
            Key::Component { base, .. } | Key::Alias { base, .. } => base.is_open(),
            Key::Wrapper { inner, .. } => inner.is_open(),
            Key::Generic { args, .. } => args.iter().any(|arg| match arg {
                KeyArg::Var(_) => true,
                KeyArg::Key(key) => key.is_open(),
            }),
        }
    }

    /// Collects every variable occurring in the key, in first-seen order.
    pub(crate) fn collect_vars(&self, found: &mut Vec<TypeVarId>) {
        match self {
            Key::Concrete(_) => {}
            Key::Var(var) => {
                if !found.contains(var) {
                    found.push(*var);
                }
            }
            Key::Component { base, .. } | Key::Alias { base, .. } => base.collect_vars(found),
            Key::Wrapper { inner, .. } => inner.collect_vars(found),
            Key::Generic { args, .. } => {
                for arg in args {
                    match arg {
                        KeyArg::Var(var) => {
                            if !found.contains(var) {
                                found.push(*var);
                            }
                        }
                        KeyArg::Key(key) => key.collect_vars(found),
                    }
                }
            }
        }
    }

    /// Human-readable structural name for diagnostics.
    pub fn display_name(&self) -> String {
        match self {
            Key::Concrete(c) => c.name.to_string(),
            Key::Component { base, component } => {
                format!("{} (component={component})", base.display_name())
            }
            Key::Generic { origin, args } => {
                let rendered: Vec<String> = args
                    .iter()
                    .map(|arg| match arg {
                        KeyArg::Key(key) => key.display_name(),
                        KeyArg::Var(var) => format!("${}", var.0),
                    })
                    .collect();
                format!("{}[{}]", origin.name, rendered.join(", "))
            }
            Key::Var(var) => format!("${}", var.0),
            Key::Alias { base, layer } => {
                format!("{} (decoration layer {layer})", base.display_name())
            }
            Key::Wrapper { kind, inner } => {
                format!("{}[{}]", kind.label(), inner.display_name())
            }
        }
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.display_name())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RepoOf;

    #[test]
    fn concrete_keys_compare_by_type_id() {
        assert_eq!(Key::of::<u32>(), Key::of::<u32>());
        assert_ne!(Key::of::<u32>(), Key::of::<u64>());
    }

    #[test]
    fn component_keys_are_distinct_from_base() {
        let base = Key::of::<String>();
        let named = Key::component_of::<String>("primary");
        assert_ne!(base, named);
        assert_eq!(named.base_key(), &base);
        assert_eq!(named.component(), Some("primary"));
    }

    #[test]
    fn openness_is_recursive() {
        let t = TypeVar::new("T");
        let closed = Key::generic::<RepoOf>([KeyArg::Key(Key::of::<u32>())]);
        let open = Key::generic::<RepoOf>([KeyArg::Var(t.id())]);
        let nested = Key::generic::<RepoOf>([KeyArg::Key(open.clone())]);
        assert!(!closed.is_open());
        assert!(open.is_open());
        assert!(nested.is_open());
    }

    #[test]
    fn wrapper_keys_round_trip() {
        let key = Key::of::<String>().maybe();
        let (kind, inner) = key.as_wrapper().unwrap();
        assert_eq!(kind, WrapperKind::Maybe);
        assert_eq!(inner, &Key::of::<String>());
    }

    #[test]
    fn typevars_have_distinct_identity() {
        let a = TypeVar::new("T");
        let b = TypeVar::new("T");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn constrained_var_accepts_only_listed_keys() {
        let t = TypeVar::new("T").constrained([Key::of::<i32>()]);
        assert!(t.accepts(&Key::of::<i32>()));
        assert!(!t.accepts(&Key::of::<String>()));
    }
}
