//! Storage seams for roles, rules and the resource key catalog
//!
//! The resolver never talks to storage directly: it reads a [`RoleSource`],
//! a [`RuleStore`] and a [`ResourceCatalog`] at rebuild time. Stores report
//! successful writes to registered listeners so a cache can be invalidated.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use crate::error::{AuthzError, Result};
use crate::types::{AllowedValue, ResourceKey, RoleDefinition, RoleId, Rule};

/// A committed write observed by a store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    RuleSaved { role: RoleId, key: ResourceKey },
    RuleDeleted { role: RoleId, key: ResourceKey },
    RoleHierarchyChanged { role: RoleId },
}

/// Callback run after every successful write
pub type ChangeListener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    inner: RwLock<Vec<ChangeListener>>,
}

impl Listeners {
    fn push(&self, listener: ChangeListener) {
        self.inner.write().push(listener);
    }

    fn notify(&self, event: ChangeEvent) {
        // Clone out so a listener can register another without deadlocking
        let listeners: Vec<ChangeListener> = self.inner.read().clone();
        for listener in listeners {
            listener(&event);
        }
    }
}

/// Source of role definitions and their parent links
#[async_trait]
pub trait RoleSource: Send + Sync {
    async fn load(&self) -> Result<Vec<RoleDefinition>>;

    async fn contains(&self, role: &str) -> Result<bool> {
        Ok(self.load().await?.iter().any(|r| r.name == role))
    }

    fn on_changed(&self, listener: ChangeListener);
}

/// Persisted explicit overrides
#[async_trait]
pub trait RuleStore<V: AllowedValue>: Send + Sync {
    async fn load_all(&self) -> Result<Vec<Rule<V>>>;

    /// Inserts or replaces the rule for `(rule.role, rule.key)`
    async fn save(&self, rule: Rule<V>) -> Result<()>;

    /// Removes the rule for `(role, key)`; `Ok(false)` when there was none
    async fn delete(&self, role: &str, key: &str) -> Result<bool>;

    async fn rules_for_role(&self, role: &str) -> Result<Vec<Rule<V>>> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .filter(|r| r.role == role)
            .collect())
    }

    /// Registers a listener run after every committed `save`, and after
    /// every `delete` that removed a rule. Caches rely on it for
    /// invalidation.
    fn on_changed(&self, listener: ChangeListener);
}

/// Registry of resource keys rules may reference
#[async_trait]
pub trait ResourceCatalog: Send + Sync {
    async fn resource_keys(&self) -> Result<BTreeSet<ResourceKey>>;

    async fn contains_key(&self, key: &str) -> Result<bool> {
        Ok(self.resource_keys().await?.contains(key))
    }
}

/// In-memory role store
#[derive(Default)]
pub struct InMemoryRoleStore {
    roles: DashMap<RoleId, RoleDefinition>,
    listeners: Listeners,
}

impl InMemoryRoleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_roles(roles: impl IntoIterator<Item = RoleDefinition>) -> Result<Self> {
        let store = Self::new();
        for role in roles {
            role.validate()?;
            store.roles.insert(role.name.clone(), role);
        }
        Ok(store)
    }

    /// Inserts or replaces a role definition
    pub fn upsert(&self, role: RoleDefinition) -> Result<()> {
        role.validate()?;
        let name = role.name.clone();
        self.roles.insert(name.clone(), role);
        self.listeners
            .notify(ChangeEvent::RoleHierarchyChanged { role: name });
        Ok(())
    }

    pub fn remove(&self, role: &str) -> Result<()> {
        if self.roles.remove(role).is_none() {
            return Err(AuthzError::UnknownRole(role.to_string()));
        }
        self.listeners.notify(ChangeEvent::RoleHierarchyChanged {
            role: role.to_string(),
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }
}

#[async_trait]
impl RoleSource for InMemoryRoleStore {
    async fn load(&self) -> Result<Vec<RoleDefinition>> {
        let mut roles: Vec<RoleDefinition> = self.roles.iter().map(|r| r.value().clone()).collect();
        roles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(roles)
    }

    async fn contains(&self, role: &str) -> Result<bool> {
        Ok(self.roles.contains_key(role))
    }

    fn on_changed(&self, listener: ChangeListener) {
        self.listeners.push(listener);
    }
}

/// In-memory rule store keyed by `(role, key)`
pub struct InMemoryRuleStore<V> {
    rules: DashMap<(RoleId, ResourceKey), V>,
    listeners: Listeners,
}

impl<V: AllowedValue> InMemoryRuleStore<V> {
    pub fn new() -> Self {
        Self {
            rules: DashMap::new(),
            listeners: Listeners::default(),
        }
    }

    pub fn with_rules(rules: impl IntoIterator<Item = Rule<V>>) -> Self {
        let store = Self::new();
        for rule in rules {
            store.rules.insert((rule.role, rule.key), rule.allowed);
        }
        store
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl<V: AllowedValue> Default for InMemoryRuleStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<V: AllowedValue> RuleStore<V> for InMemoryRuleStore<V> {
    async fn load_all(&self) -> Result<Vec<Rule<V>>> {
        let mut rules: Vec<Rule<V>> = self
            .rules
            .iter()
            .map(|entry| {
                let (role, key) = entry.key();
                Rule::new(role.clone(), key.clone(), entry.value().clone())
            })
            .collect();
        rules.sort_by(|a, b| (&a.role, &a.key).cmp(&(&b.role, &b.key)));
        Ok(rules)
    }

    async fn save(&self, rule: Rule<V>) -> Result<()> {
        let event = ChangeEvent::RuleSaved {
            role: rule.role.clone(),
            key: rule.key.clone(),
        };
        self.rules.insert((rule.role, rule.key), rule.allowed);
        self.listeners.notify(event);
        Ok(())
    }

    async fn delete(&self, role: &str, key: &str) -> Result<bool> {
        let removed = self
            .rules
            .remove(&(role.to_string(), key.to_string()))
            .is_some();
        if removed {
            self.listeners.notify(ChangeEvent::RuleDeleted {
                role: role.to_string(),
                key: key.to_string(),
            });
        }
        Ok(removed)
    }

    fn on_changed(&self, listener: ChangeListener) {
        self.listeners.push(listener);
    }
}

/// In-memory resource key catalog
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    keys: DashSet<ResourceKey>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keys<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<ResourceKey>,
    {
        let catalog = Self::new();
        for key in keys {
            catalog.register(key);
        }
        catalog
    }

    pub fn register(&self, key: impl Into<ResourceKey>) {
        self.keys.insert(key.into());
    }
}

#[async_trait]
impl ResourceCatalog for InMemoryCatalog {
    async fn resource_keys(&self) -> Result<BTreeSet<ResourceKey>> {
        Ok(self.keys.iter().map(|k| k.key().clone()).collect())
    }

    async fn contains_key(&self, key: &str) -> Result<bool> {
        Ok(self.keys.contains(key))
    }
}

/// JSON document holding a complete permission setup
///
/// ```json
/// {
///   "roles": [{ "name": "admin" }, { "name": "user", "parents": ["admin"] }],
///   "resource_keys": ["ViewInvoice", "DeleteInvoice"],
///   "rules": [{ "role": "user", "key": "DeleteInvoice", "allowed": false }]
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "V: Serialize", deserialize = "V: Deserialize<'de>"))]
pub struct Fixture<V> {
    #[serde(default)]
    pub roles: Vec<RoleDefinition>,

    #[serde(default)]
    pub resource_keys: Vec<ResourceKey>,

    #[serde(default)]
    pub rules: Vec<Rule<V>>,
}

/// Stores populated from a [`Fixture`]
pub struct FixtureStores<V> {
    pub roles: Arc<InMemoryRoleStore>,
    pub rules: Arc<InMemoryRuleStore<V>>,
    pub catalog: Arc<InMemoryCatalog>,
}

impl<V> Fixture<V>
where
    V: AllowedValue + for<'de> Deserialize<'de>,
{
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_json_str(&raw)
    }

    /// Checks that every rule references a declared role and key, then
    /// builds the in-memory stores.
    pub fn into_stores(self) -> Result<FixtureStores<V>> {
        let role_names: BTreeSet<&str> = self.roles.iter().map(|r| r.name.as_str()).collect();
        let keys: BTreeSet<&str> = self.resource_keys.iter().map(String::as_str).collect();

        for rule in &self.rules {
            if !role_names.contains(rule.role.as_str()) {
                return Err(AuthzError::UnknownRole(rule.role.clone()));
            }
            if !keys.contains(rule.key.as_str()) {
                return Err(AuthzError::UnknownResourceKey(rule.key.clone()));
            }
        }

        Ok(FixtureStores {
            catalog: Arc::new(InMemoryCatalog::with_keys(self.resource_keys.iter().cloned())),
            roles: Arc::new(InMemoryRoleStore::with_roles(self.roles)?),
            rules: Arc::new(InMemoryRuleStore::with_rules(self.rules)),
        })
    }
}
