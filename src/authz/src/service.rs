//! Administrative write path and permission queries
//!
//! `PermissionService` is what callers hold: writes are validated against the
//! role source and the resource catalog before they reach the rule store.
//! The store announces every committed write, which invalidates the cache.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::cache::{CacheStats, PermissionCache};
use crate::config::AuthzConfig;
use crate::error::{AuthzError, Result};
use crate::resolver::PermissionResolver;
use crate::store::{ResourceCatalog, RoleSource, RuleStore};
use crate::types::{AllowedValue, ResourceKey, Rule, RulePack};

/// Outcome of [`PermissionService::set_allowed_rules`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl SyncSummary {
    pub fn is_empty(&self) -> bool {
        self.inserted + self.updated + self.deleted == 0
    }
}

/// Permission queries and rule administration over one value domain
pub struct PermissionService<V: AllowedValue> {
    roles: Arc<dyn RoleSource>,
    rules: Arc<dyn RuleStore<V>>,
    catalog: Arc<dyn ResourceCatalog>,
    cache: PermissionCache<V>,
}

impl<V: AllowedValue> PermissionService<V> {
    pub fn new(
        roles: Arc<dyn RoleSource>,
        rules: Arc<dyn RuleStore<V>>,
        catalog: Arc<dyn ResourceCatalog>,
        resolver: PermissionResolver<V>,
        config: AuthzConfig,
    ) -> Self {
        let cache = PermissionCache::new(Arc::clone(&roles), Arc::clone(&rules), resolver, config);
        Self {
            roles,
            rules,
            catalog,
            cache,
        }
    }

    pub fn cache(&self) -> &PermissionCache<V> {
        &self.cache
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub async fn get_allowed(&self, role: &str, key: &str) -> Result<V> {
        self.cache.get_allowed(role, key).await
    }

    /// Fails with `Unauthorized` unless the role's value grants access
    pub async fn authorize(&self, role: &str, key: &str) -> Result<()> {
        let allowed = self.get_allowed(role, key).await?;
        if allowed.is_allowed() {
            Ok(())
        } else {
            tracing::debug!(role, key, "access refused");
            Err(AuthzError::Unauthorized {
                role: role.to_string(),
                key: key.to_string(),
            })
        }
    }

    /// Subset of `candidates` the role may access, evaluated against a
    /// single table snapshot
    pub async fn authorized_keys<I, K>(&self, role: &str, candidates: I) -> Result<BTreeSet<ResourceKey>>
    where
        I: IntoIterator<Item = K>,
        K: Into<ResourceKey>,
    {
        let candidates: Vec<ResourceKey> = candidates.into_iter().map(Into::into).collect();
        if !self.cache.config().enabled {
            return Ok(candidates.into_iter().collect());
        }

        let table = self.cache.table().await?;
        Ok(candidates
            .into_iter()
            .filter(|key| table.get_allowed(role, key).is_allowed())
            .collect())
    }

    /// Rule pack for `role`: its parents, the merge strategy and one entry
    /// per catalog key with the inherited and the effective value
    pub async fn allowed_rules(&self, role: &str) -> Result<RulePack<V>> {
        self.ensure_role(role).await?;
        let keys = self.catalog.resource_keys().await?;
        let table = self.cache.table().await?;
        Ok(table.rule_pack(role, &keys))
    }

    /// Stores an explicit override after checking the role and key exist
    pub async fn save_rule(&self, rule: Rule<V>) -> Result<()> {
        self.ensure_role(&rule.role).await?;
        self.ensure_key(&rule.key).await?;

        tracing::info!(role = %rule.role, key = %rule.key, allowed = ?rule.allowed, "saving rule");
        self.rules.save(rule).await
    }

    /// Removes an explicit override; `Ok(false)` when there was none
    pub async fn delete_rule(&self, role: &str, key: &str) -> Result<bool> {
        self.ensure_role(role).await?;
        self.ensure_key(key).await?;

        let removed = self.rules.delete(role, key).await?;
        if removed {
            tracing::info!(role, key, "rule deleted");
        }
        Ok(removed)
    }

    /// Makes the stored overrides of `pack.role` match the overridden
    /// entries of the pack: stored rules with no overridden entry are
    /// deleted, new ones inserted, changed ones updated. The pack's parents
    /// and strategy are informational and not written back.
    pub async fn set_allowed_rules(&self, pack: &RulePack<V>) -> Result<SyncSummary> {
        let role = pack.role.as_str();
        self.ensure_role(role).await?;
        for rule in &pack.rules {
            self.ensure_key(&rule.key).await?;
        }

        let current: BTreeMap<ResourceKey, V> = self
            .rules
            .rules_for_role(role)
            .await?
            .into_iter()
            .map(|r| (r.key, r.allowed))
            .collect();
        let should: BTreeMap<&ResourceKey, &V> = pack
            .overrides()
            .map(|r| (&r.key, &r.allowed))
            .collect();

        let mut summary = SyncSummary::default();

        for key in current.keys() {
            if !should.contains_key(key) {
                self.rules.delete(role, key).await?;
                summary.deleted += 1;
            }
        }

        for (key, allowed) in should {
            match current.get(key) {
                Some(existing) if existing == allowed => {}
                Some(_) => {
                    self.rules.save(Rule::new(role, key.clone(), allowed.clone())).await?;
                    summary.updated += 1;
                }
                None => {
                    self.rules.save(Rule::new(role, key.clone(), allowed.clone())).await?;
                    summary.inserted += 1;
                }
            }
        }

        tracing::info!(
            role,
            inserted = summary.inserted,
            updated = summary.updated,
            deleted = summary.deleted,
            "role rules synchronized"
        );
        Ok(summary)
    }

    /// Hook for the role administration subsystem
    pub fn role_hierarchy_changed(&self) {
        self.cache.on_role_hierarchy_changed();
    }

    async fn ensure_role(&self, role: &str) -> Result<()> {
        if self.roles.contains(role).await? {
            Ok(())
        } else {
            Err(AuthzError::UnknownRole(role.to_string()))
        }
    }

    async fn ensure_key(&self, key: &str) -> Result<()> {
        if self.catalog.contains_key(key).await? {
            Ok(())
        } else {
            Err(AuthzError::UnknownResourceKey(key.to_string()))
        }
    }
}

impl<V: AllowedValue + Ord> PermissionService<V> {
    /// Fails with `Unauthorized` unless the role's value is at least
    /// `required`
    pub async fn authorize_at_least(&self, role: &str, key: &str, required: &V) -> Result<()> {
        let allowed = self.get_allowed(role, key).await?;
        if &allowed >= required {
            Ok(())
        } else {
            Err(AuthzError::Unauthorized {
                role: role.to_string(),
                key: key.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryCatalog, InMemoryRoleStore, InMemoryRuleStore};
    use crate::types::{AccessLevel, AllowedRule, MergeStrategy, RoleDefinition};

    fn invoice_service<V: AllowedValue + Ord>(rules: Vec<Rule<V>>) -> (PermissionService<V>, Arc<InMemoryRuleStore<V>>) {
        let roles = InMemoryRoleStore::with_roles(vec![
            RoleDefinition::new("admin"),
            RoleDefinition::new("user").inherits("admin"),
        ])
        .unwrap();
        let catalog = InMemoryCatalog::with_keys(["ViewInvoice", "DeleteInvoice", "ExportInvoice"]);
        let rule_store = Arc::new(InMemoryRuleStore::with_rules(rules));

        let service = PermissionService::new(
            Arc::new(roles),
            rule_store.clone(),
            Arc::new(catalog),
            PermissionResolver::default(),
            AuthzConfig::default(),
        );
        (service, rule_store)
    }

    #[tokio::test]
    async fn test_authorize() {
        let (service, _) = invoice_service(vec![Rule::new("user", "DeleteInvoice", false)]);

        assert!(service.authorize("admin", "DeleteInvoice").await.is_ok());
        assert_eq!(
            service.authorize("user", "DeleteInvoice").await,
            Err(AuthzError::Unauthorized {
                role: "user".to_string(),
                key: "DeleteInvoice".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_authorize_at_least() {
        let (service, _) = invoice_service(vec![Rule::new("user", "ViewInvoice", AccessLevel::Read)]);

        assert!(service
            .authorize_at_least("user", "ViewInvoice", &AccessLevel::Read)
            .await
            .is_ok());
        assert!(service
            .authorize_at_least("user", "ViewInvoice", &AccessLevel::Write)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_authorized_keys() {
        let (service, _) = invoice_service(vec![Rule::new("user", "DeleteInvoice", false)]);

        let keys = service
            .authorized_keys("user", ["ViewInvoice", "DeleteInvoice", "Unregistered"])
            .await
            .unwrap();
        assert_eq!(
            keys,
            ["Unregistered", "ViewInvoice"]
                .iter()
                .map(|k| k.to_string())
                .collect::<BTreeSet<_>>()
        );
    }

    #[tokio::test]
    async fn test_save_rule_validates() {
        let (service, store) = invoice_service::<bool>(vec![]);

        assert_eq!(
            service.save_rule(Rule::new("ghost", "ViewInvoice", false)).await,
            Err(AuthzError::UnknownRole("ghost".to_string()))
        );
        assert_eq!(
            service.save_rule(Rule::new("user", "Ghost", false)).await,
            Err(AuthzError::UnknownResourceKey("Ghost".to_string()))
        );
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_save_rule_propagates() {
        let (service, _) = invoice_service::<bool>(vec![]);
        assert!(service.get_allowed("user", "ViewInvoice").await.unwrap());

        service.save_rule(Rule::new("admin", "ViewInvoice", false)).await.unwrap();
        assert!(!service.get_allowed("user", "ViewInvoice").await.unwrap());

        assert!(service.delete_rule("admin", "ViewInvoice").await.unwrap());
        assert!(service.get_allowed("user", "ViewInvoice").await.unwrap());
        assert!(!service.delete_rule("admin", "ViewInvoice").await.unwrap());
    }

    #[tokio::test]
    async fn test_each_write_invalidates_once() {
        let (service, _) = invoice_service::<bool>(vec![]);
        service.get_allowed("user", "ViewInvoice").await.unwrap();

        service.save_rule(Rule::new("admin", "ViewInvoice", false)).await.unwrap();
        assert_eq!(service.stats().invalidations, 1);

        service.delete_rule("admin", "ViewInvoice").await.unwrap();
        assert_eq!(service.stats().invalidations, 2);

        // Nothing removed, nothing invalidated
        service.delete_rule("admin", "ViewInvoice").await.unwrap();
        assert_eq!(service.stats().invalidations, 2);
    }

    #[tokio::test]
    async fn test_allowed_rules_lists_catalog() {
        let (service, _) = invoice_service(vec![
            Rule::new("admin", "ViewInvoice", false),
            Rule::new("user", "DeleteInvoice", false),
        ]);

        let pack = service.allowed_rules("user").await.unwrap();
        assert_eq!(pack.role, "user");
        assert_eq!(pack.parents, vec!["admin"]);
        assert_eq!(pack.strategy, MergeStrategy::MostPermissive);
        let rules = &pack.rules;
        assert_eq!(rules.len(), 3);

        let export = rules.iter().find(|r| r.key == "ExportInvoice").unwrap();
        assert!(export.base && export.allowed && !export.overridden());

        let view = rules.iter().find(|r| r.key == "ViewInvoice").unwrap();
        assert!(!view.base && !view.allowed && !view.overridden());

        let delete = rules.iter().find(|r| r.key == "DeleteInvoice").unwrap();
        assert!(delete.overridden());

        assert!(matches!(
            service.allowed_rules("ghost").await,
            Err(AuthzError::UnknownRole(_))
        ));
    }

    #[tokio::test]
    async fn test_set_allowed_rules_round_trip() {
        let (service, store) = invoice_service(vec![
            Rule::new("user", "DeleteInvoice", false),
            Rule::new("user", "ExportInvoice", false),
        ]);

        let mut pack = service.allowed_rules("user").await.unwrap();
        for rule in pack.rules.iter_mut() {
            match rule.key.as_str() {
                // back to inherited: dropped
                "DeleteInvoice" => rule.allowed = rule.base,
                // new override
                "ViewInvoice" => rule.allowed = false,
                _ => {}
            }
        }

        let summary = service.set_allowed_rules(&pack).await.unwrap();
        assert_eq!(
            summary,
            SyncSummary {
                inserted: 1,
                updated: 0,
                deleted: 1,
            }
        );

        let stored = store.rules_for_role("user").await.unwrap();
        assert_eq!(
            stored,
            vec![
                Rule::new("user", "ExportInvoice", false),
                Rule::new("user", "ViewInvoice", false),
            ]
        );
        assert!(service.get_allowed("user", "DeleteInvoice").await.unwrap());
        assert!(!service.get_allowed("user", "ViewInvoice").await.unwrap());

        // Same listing again changes nothing
        let pack = service.allowed_rules("user").await.unwrap();
        let before = service.stats().invalidations;
        assert!(service.set_allowed_rules(&pack).await.unwrap().is_empty());
        assert_eq!(service.stats().invalidations, before);
    }

    #[tokio::test]
    async fn test_set_allowed_rules_updates() {
        let (service, store) = invoice_service(vec![Rule::new("user", "ViewInvoice", AccessLevel::None)]);

        let pack = RulePack {
            role: "user".to_string(),
            parents: vec!["admin".to_string()],
            strategy: MergeStrategy::MostPermissive,
            rules: vec![AllowedRule {
                key: "ViewInvoice".to_string(),
                base: AccessLevel::Write,
                allowed: AccessLevel::Read,
            }],
        };
        let summary = service.set_allowed_rules(&pack).await.unwrap();
        assert_eq!(summary.updated, 1);
        assert_eq!(
            store.load_all().await.unwrap(),
            vec![Rule::new("user", "ViewInvoice", AccessLevel::Read)]
        );
    }

    #[tokio::test]
    async fn test_disabled_allows_everything() {
        let roles = InMemoryRoleStore::with_roles(vec![RoleDefinition::new("user")]).unwrap();
        let service = PermissionService::new(
            Arc::new(roles),
            Arc::new(InMemoryRuleStore::with_rules(vec![Rule::new("user", "K", false)])),
            Arc::new(InMemoryCatalog::with_keys(["K"])),
            PermissionResolver::default(),
            AuthzConfig {
                enabled: false,
                ..Default::default()
            },
        );

        assert!(service.authorize("user", "K").await.is_ok());
        assert_eq!(service.authorized_keys("user", ["K"]).await.unwrap().len(), 1);
    }
}
