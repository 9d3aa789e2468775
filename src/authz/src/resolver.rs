//! Permission resolution over the role hierarchy
//!
//! Roles are processed parents first. A root role gets exactly its explicit
//! rules. Any other role starts from the combination of its parents' values
//! for every key they know about, then its own explicit rules replace the
//! inherited value for their keys. Anything unresolved is the default value.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::error::Result;
use crate::graph::RoleGraph;
use crate::types::{
    AllowedRule, AllowedValue, Combine, MergeStrategy, MostPermissive, ResourceKey, RoleId, Rule,
    RulePack,
};

type KeyTable<V> = HashMap<ResourceKey, V>;

/// Fully resolved `(role, key) -> value` snapshot
///
/// Immutable once built; the cache replaces it wholesale.
#[derive(Debug, Clone)]
pub struct ResolvedTable<V> {
    /// Effective values per role
    effective: HashMap<RoleId, KeyTable<V>>,

    /// Values each role receives from its parents before its own overrides
    inherited: HashMap<RoleId, KeyTable<V>>,

    /// Explicit overrides per role
    explicit: HashMap<RoleId, KeyTable<V>>,

    /// Keys referenced by at least one rule
    keys: BTreeSet<ResourceKey>,

    roles: BTreeSet<RoleId>,

    /// Immediate parents per role at build time
    parents: BTreeMap<RoleId, Vec<RoleId>>,

    strategy: MergeStrategy,

    /// Invalidation epoch the table was built against
    epoch: u64,

    built_at: DateTime<Utc>,
}

impl<V: AllowedValue> ResolvedTable<V> {
    /// Effective value; the default for anything the table does not hold
    pub fn get_allowed(&self, role: &str, key: &str) -> V {
        lookup(&self.effective, role, key)
    }

    /// Value the role would get from its parents alone
    pub fn get_base_allowed(&self, role: &str, key: &str) -> V {
        lookup(&self.inherited, role, key)
    }

    pub fn has_explicit_rule(&self, role: &str, key: &str) -> bool {
        self.explicit
            .get(role)
            .map_or(false, |rules| rules.contains_key(key))
    }

    /// Administrative entry for one key
    pub fn allowed_rule(&self, role: &str, key: &str) -> AllowedRule<V> {
        AllowedRule {
            key: key.to_string(),
            base: self.get_base_allowed(role, key),
            allowed: self.get_allowed(role, key),
        }
    }

    /// Entries for every key referenced by any rule
    pub fn resolve(&self, role: &str) -> BTreeMap<ResourceKey, AllowedRule<V>> {
        self.keys
            .iter()
            .map(|key| (key.clone(), self.allowed_rule(role, key)))
            .collect()
    }

    /// Rule pack for `role` over the given keys, in their iteration order
    pub fn rule_pack<'a, I>(&self, role: &str, keys: I) -> RulePack<V>
    where
        I: IntoIterator<Item = &'a ResourceKey>,
    {
        RulePack {
            role: role.to_string(),
            parents: self.parents_of(role),
            strategy: self.strategy,
            rules: keys.into_iter().map(|key| self.allowed_rule(role, key)).collect(),
        }
    }

    /// Immediate parents of a role as the table saw them
    pub fn parents_of(&self, role: &str) -> Vec<RoleId> {
        self.parents.get(role).cloned().unwrap_or_default()
    }

    pub fn strategy(&self) -> MergeStrategy {
        self.strategy
    }

    pub fn contains_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    pub fn roles(&self) -> impl Iterator<Item = &RoleId> {
        self.roles.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ResourceKey> {
        self.keys.iter()
    }

    /// Number of materialised `(role, key)` entries
    pub fn entry_count(&self) -> usize {
        self.effective.values().map(HashMap::len).sum()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }
}

fn lookup<V: AllowedValue>(table: &HashMap<RoleId, KeyTable<V>>, role: &str, key: &str) -> V {
    table
        .get(role)
        .and_then(|keys| keys.get(key))
        .cloned()
        .unwrap_or_else(V::default_allowed)
}

/// Computes [`ResolvedTable`]s from a role graph and a rule set
#[derive(Clone)]
pub struct PermissionResolver<V> {
    combine: Arc<dyn Combine<V>>,
    prune_defaults: bool,
}

impl<V: AllowedValue + Ord> Default for PermissionResolver<V> {
    fn default() -> Self {
        Self::new(MostPermissive)
    }
}

impl<V: AllowedValue> PermissionResolver<V> {
    pub fn new(combine: impl Combine<V> + 'static) -> Self {
        Self {
            combine: Arc::new(combine),
            prune_defaults: false,
        }
    }

    pub fn strategy(&self) -> MergeStrategy {
        self.combine.strategy()
    }

    /// Omit entries equal to the default value from built tables
    pub fn with_pruning(mut self, prune_defaults: bool) -> Self {
        self.prune_defaults = prune_defaults;
        self
    }

    /// Builds a complete table.
    ///
    /// Fails only when the graph has a cycle. Rules for roles absent from
    /// the graph are skipped; referential integrity is checked on write.
    pub fn resolve(&self, graph: &RoleGraph, rules: &[Rule<V>], epoch: u64) -> Result<ResolvedTable<V>> {
        let order = graph.roles_in_dependency_order()?;

        let mut explicit: HashMap<RoleId, KeyTable<V>> = HashMap::new();
        let mut keys = BTreeSet::new();
        for rule in rules {
            if !graph.contains(&rule.role) {
                tracing::warn!(role = %rule.role, key = %rule.key, "skipping rule for unknown role");
                continue;
            }
            keys.insert(rule.key.clone());
            explicit
                .entry(rule.role.clone())
                .or_default()
                .insert(rule.key.clone(), rule.allowed.clone());
        }

        let mut effective: HashMap<RoleId, KeyTable<V>> = HashMap::with_capacity(order.len());
        let mut inherited: HashMap<RoleId, KeyTable<V>> = HashMap::with_capacity(order.len());
        let mut parents_by_role: BTreeMap<RoleId, Vec<RoleId>> = BTreeMap::new();

        for role in &order {
            let parents = graph.parents_of(role);
            let base = self.combine_parents(&parents, &effective);

            let mut values = base.clone();
            if let Some(overrides) = explicit.get(role) {
                for (key, value) in overrides {
                    values.insert(key.clone(), value.clone());
                }
            }

            effective.insert(role.clone(), values);
            inherited.insert(role.clone(), base);
            parents_by_role.insert(role.clone(), parents.into_iter().collect());
        }

        // Children combine their parents' full values, so pruning waits
        // until every role is resolved
        if self.prune_defaults {
            effective.values_mut().for_each(prune);
            inherited.values_mut().for_each(prune);
        }

        Ok(ResolvedTable {
            effective,
            inherited,
            explicit,
            keys,
            roles: order.into_iter().collect(),
            parents: parents_by_role,
            strategy: self.strategy(),
            epoch,
            built_at: Utc::now(),
        })
    }

    /// Combines parent values for every key any parent holds. A parent
    /// without an entry contributes the default value.
    fn combine_parents(
        &self,
        parents: &BTreeSet<RoleId>,
        effective: &HashMap<RoleId, KeyTable<V>>,
    ) -> KeyTable<V> {
        let parent_keys: BTreeSet<&ResourceKey> = parents
            .iter()
            .filter_map(|p| effective.get(p))
            .flat_map(|table| table.keys())
            .collect();

        parent_keys
            .into_iter()
            .filter_map(|key| {
                let mut values = parents.iter().map(|p| lookup(effective, p, key));
                let first = values.next()?;
                let combined = values.fold(first, |acc, v| self.combine.combine(&acc, &v));
                Some((key.clone(), combined))
            })
            .collect()
    }
}

fn prune<V: AllowedValue>(values: &mut KeyTable<V>) {
    let default = V::default_allowed();
    values.retain(|_, v| *v != default);
}
