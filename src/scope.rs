//! Scope model: named, totally ordered scope levels and transition planning.
//!
//! A container is configured with a [`Scopes`], an ascending list of
//! scope levels. Providers declare the level they live at; resolvers are
//! created per level by [`enter_scope`](crate::Resolver::enter_scope).
//! Scopes marked *skippable* are stepped over by default transitions but can
//! still be entered explicitly.

use crate::error::{DiError, DiResult};

/// A single named scope level.
///
/// Scopes are small copyable values; equality is by level within the owning
/// [`Scopes`].
///
/// # Examples
///
/// ```rust
/// use diwire::Scopes;
///
/// let scopes = Scopes::standard();
/// let request = scopes.by_name("request").unwrap();
/// assert_eq!(request.level(), 1);
/// assert!(!request.skippable());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Scope {
    name: &'static str,
    level: u32,
    skippable: bool,
}

impl Scope {
    /// The scope's name (a valid identifier).
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The scope's ordered level; smaller is shallower.
    pub fn level(&self) -> u32 {
        self.level
    }

    /// Whether default next-scope transitions skip this scope.
    pub fn skippable(&self) -> bool {
        self.skippable
    }
}

/// A totally ordered set of scope levels, root first.
///
/// Levels are unique and ascending; at least one scope must be
/// non-skippable. The set is defined at container construction and
/// immutable thereafter.
///
/// # Examples
///
/// ```rust
/// use diwire::Scopes;
///
/// let scopes = Scopes::builder()
///     .scope("app")
///     .scope("session")
///     .skippable_scope("step")
///     .build()
///     .unwrap();
/// assert_eq!(scopes.root().name(), "app");
/// ```
#[derive(Debug, Clone)]
pub struct Scopes {
    ordered: Vec<Scope>,
}

impl Scopes {
    /// Starts building a scope set.
    pub fn builder() -> ScopesBuilder {
        ScopesBuilder { scopes: Vec::new() }
    }

    /// The conventional three-level hierarchy: `app` (root), `request`, and
    /// a skippable `action` scope.
    pub fn standard() -> Scopes {
        Scopes::builder()
            .scope("app")
            .scope("request")
            .skippable_scope("action")
            .build()
            .expect("standard scope set is valid")
    }

    /// A single-scope set named `app`. Used when no hierarchy is needed.
    pub fn single() -> Scopes {
        Scopes::builder()
            .scope("app")
            .build()
            .expect("single scope set is valid")
    }

    /// The shallowest scope.
    pub fn root(&self) -> Scope {
        self.ordered[0]
    }

    /// All scopes in ascending level order.
    pub fn iter(&self) -> impl Iterator<Item = Scope> + '_ {
        self.ordered.iter().copied()
    }

    /// Looks a scope up by name.
    pub fn by_name(&self, name: &str) -> Option<Scope> {
        self.ordered.iter().copied().find(|s| s.name == name)
    }

    /// Looks a scope up by level.
    pub fn by_level(&self, level: u32) -> Option<Scope> {
        self.ordered.iter().copied().find(|s| s.level == level)
    }

    /// Scopes strictly deeper than `level`, ascending.
    pub fn deeper_than(&self, level: u32) -> impl Iterator<Item = Scope> + '_ {
        self.ordered.iter().copied().filter(move |s| s.level > level)
    }

    /// The nearest deeper scope, skippable or not.
    pub fn immediate_next(&self, level: u32) -> Option<Scope> {
        self.deeper_than(level).next()
    }

    /// The nearest deeper non-skippable scope.
    pub fn default_next(&self, level: u32) -> Option<Scope> {
        self.deeper_than(level).find(|s| !s.skippable)
    }

    /// Plans the chain of scopes to build when jumping from `from` to the
    /// strictly deeper `target` level: from the current level, the next hop
    /// is the default next scope unless that overshoots the target, in which
    /// case the immediate next scope is taken. The returned path ends at the
    /// target.
    pub(crate) fn transition_path(&self, from: u32, target: u32) -> DiResult<Vec<Scope>> {
        if target <= from {
            return Err(DiError::scope_mismatch(format!(
                "cannot enter scope level {target} from level {from}"
            )));
        }
        let mut path = Vec::new();
        let mut current = from;
        while current < target {
            let immediate = self.immediate_next(current).ok_or_else(|| {
                DiError::scope_mismatch(format!(
                    "no scope deeper than level {current} while entering level {target}"
                ))
            })?;
            let hop = match self.default_next(current) {
                Some(default) if default.level <= target => default,
                _ => immediate,
            };
            let hop = if hop.level > target {
                // The default hop overshot; fall back to single steps.
                immediate
            } else {
                hop
            };
            if hop.level > target {
                return Err(DiError::scope_mismatch(format!(
                    "scope level {target} is not reachable from level {from}"
                )));
            }
            path.push(hop);
            current = hop.level;
        }
        match path.last() {
            Some(last) if last.level == target => Ok(path),
            _ => Err(DiError::scope_mismatch(format!(
                "scope level {target} does not exist in this scope set"
            ))),
        }
    }
}

/// Builder for [`Scopes`].
pub struct ScopesBuilder {
    scopes: Vec<(&'static str, bool)>,
}

impl ScopesBuilder {
    /// Appends a non-skippable scope one level deeper than the previous one.
    pub fn scope(mut self, name: &'static str) -> Self {
        self.scopes.push((name, false));
        self
    }

    /// Appends a skippable scope one level deeper than the previous one.
    pub fn skippable_scope(mut self, name: &'static str) -> Self {
        self.scopes.push((name, true));
        self
    }

    /// Validates and builds the set.
    ///
    /// Fails when the set is empty, a name repeats, a name is not a valid
    /// identifier, or every scope is skippable.
    pub fn build(self) -> DiResult<Scopes> {
        if self.scopes.is_empty() {
            return Err(DiError::invalid_spec(
                "scope set must contain at least one scope",
            ));
        }
        let mut ordered = Vec::with_capacity(self.scopes.len());
        for (level, (name, skippable)) in self.scopes.into_iter().enumerate() {
            if !is_identifier(name) {
                return Err(DiError::invalid_spec(format!(
                    "scope name '{name}' is not a valid identifier"
                )));
            }
            if ordered.iter().any(|s: &Scope| s.name == name) {
                return Err(DiError::invalid_spec(format!(
                    "duplicate scope name '{name}'"
                )));
            }
            ordered.push(Scope {
                name,
                level: level as u32,
                skippable,
            });
        }
        if ordered.iter().all(|s| s.skippable) {
            return Err(DiError::invalid_spec(
                "scope set must contain at least one non-skippable scope",
            ));
        }
        Ok(Scopes { ordered })
    }
}

pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}
