//! Core permission types: roles, rules and the allowed-value domain

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::error::{AuthzError, Result};

/// Unique role identifier
pub type RoleId = String;

/// Opaque identifier of a protectable resource (query, operation, type...)
pub type ResourceKey = String;

/// Value domain a permission table is computed over.
///
/// The resolver only needs a default (the value used when nothing says
/// otherwise) and a way to tell whether a value grants access at all.
/// How parent values merge is the job of a [`Combine`] implementation.
pub trait AllowedValue: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Value of any (role, key) pair that nothing resolves
    fn default_allowed() -> Self;

    /// Whether this value grants any access
    fn is_allowed(&self) -> bool;
}

impl AllowedValue for bool {
    fn default_allowed() -> Self {
        true
    }

    fn is_allowed(&self) -> bool {
        *self
    }
}

/// Multi-level permission, ordered from most restrictive to most permissive
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    None,
    Read,
    Write,
}

impl AllowedValue for AccessLevel {
    fn default_allowed() -> Self {
        AccessLevel::Write
    }

    fn is_allowed(&self) -> bool {
        *self != AccessLevel::None
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessLevel::None => write!(f, "none"),
            AccessLevel::Read => write!(f, "read"),
            AccessLevel::Write => write!(f, "write"),
        }
    }
}

/// Label for how a role merges the values of its parents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    MostPermissive,
    MostRestrictive,
    /// Caller-supplied function
    Custom,
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeStrategy::MostPermissive => write!(f, "most permissive"),
            MergeStrategy::MostRestrictive => write!(f, "most restrictive"),
            MergeStrategy::Custom => write!(f, "custom"),
        }
    }
}

/// Merges the values a role inherits from several parents.
///
/// Implementations must be associative and commutative: the resolver folds
/// parent values in whatever order the graph yields them.
pub trait Combine<V>: Send + Sync {
    fn combine(&self, a: &V, b: &V) -> V;

    fn strategy(&self) -> MergeStrategy {
        MergeStrategy::Custom
    }

    /// Folds a non-empty sequence of values; `None` for an empty one.
    fn combine_all<'a, I>(&self, values: I) -> Option<V>
    where
        Self: Sized,
        I: IntoIterator<Item = &'a V>,
        V: 'a + Clone,
    {
        let mut iter = values.into_iter();
        let first = iter.next()?.clone();
        Some(iter.fold(first, |acc, v| self.combine(&acc, v)))
    }
}

/// Most permissive value wins (`max` under the allow ordering)
#[derive(Debug, Clone, Copy, Default)]
pub struct MostPermissive;

impl<V: Ord + Clone> Combine<V> for MostPermissive {
    fn combine(&self, a: &V, b: &V) -> V {
        match a.cmp(b) {
            Ordering::Less => b.clone(),
            _ => a.clone(),
        }
    }

    fn strategy(&self) -> MergeStrategy {
        MergeStrategy::MostPermissive
    }
}

/// Most restrictive value wins (`min` under the allow ordering)
#[derive(Debug, Clone, Copy, Default)]
pub struct MostRestrictive;

impl<V: Ord + Clone> Combine<V> for MostRestrictive {
    fn combine(&self, a: &V, b: &V) -> V {
        match a.cmp(b) {
            Ordering::Greater => b.clone(),
            _ => a.clone(),
        }
    }

    fn strategy(&self) -> MergeStrategy {
        MergeStrategy::MostRestrictive
    }
}

/// Caller-supplied combination closure
pub struct FnCombine<F>(pub F);

impl<V, F> Combine<V> for FnCombine<F>
where
    F: Fn(&V, &V) -> V + Send + Sync,
{
    fn combine(&self, a: &V, b: &V) -> V {
        (self.0)(a, b)
    }
}

/// A role and the roles it inherits permissions from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleDefinition {
    pub name: RoleId,

    #[serde(default)]
    pub parents: Vec<RoleId>,
}

impl RoleDefinition {
    pub fn new(name: impl Into<RoleId>) -> Self {
        Self {
            name: name.into(),
            parents: Vec::new(),
        }
    }

    /// Adds a parent role
    pub fn inherits(mut self, parent: impl Into<RoleId>) -> Self {
        self.parents.push(parent.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(AuthzError::EmptyRoleName);
        }
        if self.parents.iter().any(|p| p.trim().is_empty()) {
            return Err(AuthzError::EmptyParentName(self.name.clone()));
        }
        Ok(())
    }
}

/// Explicit override of the inherited value for one (role, key) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule<V> {
    pub role: RoleId,
    pub key: ResourceKey,
    pub allowed: V,
}

impl<V> Rule<V> {
    pub fn new(role: impl Into<RoleId>, key: impl Into<ResourceKey>, allowed: V) -> Self {
        Self {
            role: role.into(),
            key: key.into(),
            allowed,
        }
    }
}

/// Administrative view of one key for one role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedRule<V> {
    pub key: ResourceKey,

    /// Value the role would get from its parents alone
    pub base: V,

    /// Effective value
    pub allowed: V,
}

impl<V: PartialEq> AllowedRule<V> {
    /// An entry is an override when its effective value departs from the
    /// inherited one. Only overridden entries are persisted as rules.
    pub fn overridden(&self) -> bool {
        self.allowed != self.base
    }
}

/// Administrative view of every key for one role, together with the
/// hierarchy context the values were resolved in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulePack<V> {
    pub role: RoleId,

    /// Immediate parents of `role`
    pub parents: Vec<RoleId>,

    /// How the parents' values were merged
    pub strategy: MergeStrategy,

    pub rules: Vec<AllowedRule<V>>,
}

impl<V: PartialEq> RulePack<V> {
    /// Entries whose effective value departs from the inherited one
    pub fn overrides(&self) -> impl Iterator<Item = &AllowedRule<V>> {
        self.rules.iter().filter(|r| r.overridden())
    }
}
