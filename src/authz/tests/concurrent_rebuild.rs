//! Concurrency tests for the permission cache
//!
//! Concurrent readers of an invalid cache share one rebuild, whether it
//! succeeds or fails, and readers racing writers only ever see complete
//! tables.

use async_trait::async_trait;
use parking_lot::RwLock;
use rulepack_authz::{
    AuthzConfig, AuthzError, ChangeListener, PermissionCache, PermissionResolver, Result,
    RoleDefinition, RoleSource, Rule, RuleStore,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;

/// Role source that counts loads and answers slowly
struct SlowRoles {
    roles: RwLock<Vec<RoleDefinition>>,
    loads: AtomicUsize,
    delay: Duration,
}

impl SlowRoles {
    fn new(roles: Vec<RoleDefinition>, delay: Duration) -> Self {
        Self {
            roles: RwLock::new(roles),
            loads: AtomicUsize::new(0),
            delay,
        }
    }
}

#[async_trait]
impl RoleSource for SlowRoles {
    async fn load(&self) -> Result<Vec<RoleDefinition>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(self.roles.read().clone())
    }

    fn on_changed(&self, _listener: ChangeListener) {}
}

/// Rule store whose whole rule set is replaced in one step
struct SwappingRules {
    rules: RwLock<Vec<Rule<bool>>>,
}

#[async_trait]
impl RuleStore<bool> for SwappingRules {
    async fn load_all(&self) -> Result<Vec<Rule<bool>>> {
        Ok(self.rules.read().clone())
    }

    async fn save(&self, rule: Rule<bool>) -> Result<()> {
        self.rules.write().push(rule);
        Ok(())
    }

    async fn delete(&self, role: &str, key: &str) -> Result<bool> {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|r| !(r.role == role && r.key == key));
        Ok(rules.len() != before)
    }

    fn on_changed(&self, _listener: ChangeListener) {}
}

/// Rule store that snapshots its rules, signals, then answers slowly
struct SlowRules {
    rules: RwLock<Vec<Rule<bool>>>,
    loading: Notify,
    delay: Duration,
}

#[async_trait]
impl RuleStore<bool> for SlowRules {
    async fn load_all(&self) -> Result<Vec<Rule<bool>>> {
        let snapshot = self.rules.read().clone();
        self.loading.notify_one();
        tokio::time::sleep(self.delay).await;
        Ok(snapshot)
    }

    async fn save(&self, rule: Rule<bool>) -> Result<()> {
        self.rules.write().push(rule);
        Ok(())
    }

    async fn delete(&self, _role: &str, _key: &str) -> Result<bool> {
        Ok(false)
    }

    fn on_changed(&self, _listener: ChangeListener) {}
}

fn rule_set(allowed: bool) -> Vec<Rule<bool>> {
    vec![
        Rule::new("admin", "ViewInvoice", allowed),
        Rule::new("admin", "ExportInvoice", allowed),
    ]
}

fn hierarchy() -> Vec<RoleDefinition> {
    vec![
        RoleDefinition::new("admin"),
        RoleDefinition::new("user").inherits("admin"),
        RoleDefinition::new("clerk").inherits("user"),
    ]
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_readers_share_one_rebuild() {
    let roles = Arc::new(SlowRoles::new(hierarchy(), Duration::from_millis(50)));
    let rules = Arc::new(SwappingRules {
        rules: RwLock::new(rule_set(false)),
    });
    let cache = Arc::new(PermissionCache::new(
        roles.clone(),
        rules,
        PermissionResolver::default(),
        AuthzConfig::default(),
    ));

    let mut readers = JoinSet::new();
    for _ in 0..16 {
        let cache = cache.clone();
        readers.spawn(async move { cache.get_allowed("clerk", "ViewInvoice").await });
    }
    while let Some(result) = readers.join_next().await {
        assert!(!result.unwrap().unwrap());
    }

    // Readers polled on one task after an invalidation share one rebuild too
    cache.invalidate();
    let results = futures::future::join_all(
        (0..16).map(|_| cache.get_allowed("user", "ExportInvoice")),
    )
    .await;
    assert!(results.into_iter().all(|r| r == Ok(false)));

    assert_eq!(roles.loads.load(Ordering::SeqCst), 2);
    assert_eq!(cache.stats().rebuilds, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_repeated_invalidation_single_rebuild() {
    let roles = Arc::new(SlowRoles::new(hierarchy(), Duration::from_millis(1)));
    let cache = PermissionCache::new(
        roles.clone(),
        Arc::new(SwappingRules {
            rules: RwLock::new(rule_set(true)),
        }),
        PermissionResolver::default(),
        AuthzConfig::default(),
    );
    cache.table().await.unwrap();

    cache.invalidate();
    cache.invalidate();
    for _ in 0..5 {
        cache.get_allowed("user", "ViewInvoice").await.unwrap();
    }

    assert_eq!(roles.loads.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_never_observe_mixed_tables() {
    let roles = Arc::new(SlowRoles::new(hierarchy(), Duration::from_millis(1)));
    let rules = Arc::new(SwappingRules {
        rules: RwLock::new(rule_set(true)),
    });
    let cache = Arc::new(PermissionCache::new(
        roles,
        rules.clone(),
        PermissionResolver::default(),
        AuthzConfig::default(),
    ));

    let writer = {
        let cache = cache.clone();
        let rules = rules.clone();
        tokio::spawn(async move {
            for round in 0..50 {
                *rules.rules.write() = rule_set(round % 2 == 0);
                cache.on_rule_saved();
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    };

    let mut readers = JoinSet::new();
    for _ in 0..8 {
        let cache = cache.clone();
        readers.spawn(async move {
            for _ in 0..100 {
                let table = cache.table().await.unwrap();
                assert_eq!(
                    table.get_allowed("clerk", "ViewInvoice"),
                    table.get_allowed("clerk", "ExportInvoice")
                );
                tokio::task::yield_now().await;
            }
        });
    }

    writer.await.unwrap();
    while let Some(result) = readers.join_next().await {
        result.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_readers_share_one_failed_rebuild() {
    let roles = Arc::new(SlowRoles::new(hierarchy(), Duration::from_millis(100)));
    let cache = Arc::new(PermissionCache::new(
        roles.clone(),
        Arc::new(SwappingRules {
            rules: RwLock::new(rule_set(false)),
        }),
        PermissionResolver::default(),
        AuthzConfig::default(),
    ));
    cache.table().await.unwrap();

    *roles.roles.write() = vec![
        RoleDefinition::new("a").inherits("b"),
        RoleDefinition::new("b").inherits("a"),
    ];
    cache.on_role_hierarchy_changed();

    let mut readers = JoinSet::new();
    for _ in 0..8 {
        let cache = cache.clone();
        readers.spawn(async move { cache.get_allowed("clerk", "ViewInvoice").await });
    }
    while let Some(result) = readers.join_next().await {
        // Last good table keeps answering
        assert_eq!(result.unwrap(), Ok(false));
    }

    assert_eq!(roles.loads.load(Ordering::SeqCst), 2);
    let stats = cache.stats();
    assert_eq!(stats.rebuilds, 1);
    assert_eq!(stats.failed_rebuilds, 1);
    assert_eq!(stats.stale_serves, 8);
    assert!(matches!(cache.last_error(), Some(AuthzError::CycleDetected { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_readers_share_failure_without_table() {
    let roles = Arc::new(SlowRoles::new(
        vec![
            RoleDefinition::new("a").inherits("b"),
            RoleDefinition::new("b").inherits("a"),
        ],
        Duration::from_millis(100),
    ));
    let cache = Arc::new(PermissionCache::new(
        roles.clone(),
        Arc::new(SwappingRules {
            rules: RwLock::new(Vec::new()),
        }),
        PermissionResolver::default(),
        AuthzConfig::default(),
    ));

    let mut readers = JoinSet::new();
    for _ in 0..8 {
        let cache = cache.clone();
        readers.spawn(async move { cache.get_allowed("a", "ViewInvoice").await });
    }
    while let Some(result) = readers.join_next().await {
        assert!(matches!(result.unwrap(), Err(AuthzError::CycleDetected { .. })));
    }

    assert_eq!(roles.loads.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats().failed_rebuilds, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_write_during_rebuild_leaves_table_stale() {
    let rules = Arc::new(SlowRules {
        rules: RwLock::new(Vec::new()),
        loading: Notify::new(),
        delay: Duration::from_millis(50),
    });
    let cache = Arc::new(PermissionCache::new(
        Arc::new(SlowRoles::new(hierarchy(), Duration::from_millis(1))),
        rules.clone(),
        PermissionResolver::default(),
        AuthzConfig::default(),
    ));

    let reader = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.get_allowed("clerk", "ViewInvoice").await })
    };

    // Commit a write while the reader's rebuild is loading rules
    rules.loading.notified().await;
    rules.save(Rule::new("admin", "ViewInvoice", false)).await.unwrap();
    cache.on_rule_saved();

    // The in-flight rebuild answers from what it loaded
    assert_eq!(reader.await.unwrap(), Ok(true));
    assert!(!cache.is_valid());

    assert!(!cache.get_allowed("clerk", "ViewInvoice").await.unwrap());
    assert_eq!(cache.stats().rebuilds, 2);
}
