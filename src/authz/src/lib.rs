//! # Rulepack Authorization
//!
//! Role-hierarchy permission resolution with an invalidating snapshot cache.
//!
//! ## Features
//!
//! - **Role inheritance**: roles inherit permissions from any number of
//!   parent roles; cycles are detected with Kahn's algorithm
//! - **Explicit overrides**: a stored rule for `(role, key)` always wins
//!   over whatever the role inherits
//! - **Pluggable value domain**: `bool`, [`AccessLevel`] or any type
//!   implementing [`AllowedValue`], merged across parents by a [`Combine`]
//!   strategy (most permissive by default)
//! - **Snapshot cache**: lock-free reads of an immutable table, rebuilt at
//!   most once per invalidation and swapped atomically
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rulepack_authz::{
//!     AuthzConfig, InMemoryCatalog, InMemoryRoleStore, InMemoryRuleStore,
//!     PermissionResolver, PermissionService, RoleDefinition, Rule,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let roles = InMemoryRoleStore::with_roles(vec![
//!     RoleDefinition::new("admin"),
//!     RoleDefinition::new("user").inherits("admin"),
//! ])?;
//! let rules = InMemoryRuleStore::with_rules(vec![Rule::new("user", "DeleteInvoice", false)]);
//! let catalog = InMemoryCatalog::with_keys(["ViewInvoice", "DeleteInvoice"]);
//!
//! let service = PermissionService::new(
//!     Arc::new(roles),
//!     Arc::new(rules),
//!     Arc::new(catalog),
//!     PermissionResolver::default(),
//!     AuthzConfig::default(),
//! );
//!
//! assert!(!service.get_allowed("user", "DeleteInvoice").await?);
//! assert!(service.get_allowed("user", "ViewInvoice").await?);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod graph;
pub mod resolver;
pub mod service;
pub mod store;
pub mod types;

pub use cache::{CacheStats, PermissionCache};
pub use config::AuthzConfig;
pub use error::{AuthzError, Result};
pub use graph::RoleGraph;
pub use resolver::{PermissionResolver, ResolvedTable};
pub use service::{PermissionService, SyncSummary};
pub use store::{
    ChangeEvent, ChangeListener, Fixture, FixtureStores, InMemoryCatalog, InMemoryRoleStore,
    InMemoryRuleStore, ResourceCatalog, RoleSource, RuleStore,
};
pub use types::{
    AccessLevel, AllowedRule, AllowedValue, Combine, FnCombine, MergeStrategy, MostPermissive,
    MostRestrictive, ResourceKey, RoleDefinition, RoleId, Rule, RulePack,
};
