//! Invalidating cache over resolved permission tables
//!
//! Holds at most one [`ResolvedTable`] snapshot. Writes to roles or rules
//! bump an invalidation epoch; the snapshot is valid only while its epoch
//! matches. The next read after an invalidation rebuilds the table from
//! freshly loaded stores and publishes it with a single atomic swap.
//!
//! Reads of a valid snapshot are lock-free. Rebuilds pass through one async
//! gate, so concurrent readers that find the cache invalid wait for the
//! rebuild in flight and then reuse its outcome: the new table, or the
//! failure together with the last good table.

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::config::AuthzConfig;
use crate::error::{AuthzError, Result};
use crate::graph::RoleGraph;
use crate::resolver::{PermissionResolver, ResolvedTable};
use crate::store::{ChangeEvent, ChangeListener, RoleSource, RuleStore};
use crate::types::{AllowedRule, AllowedValue, ResourceKey};

/// Invalidation epoch shared with store listeners
#[derive(Debug, Default)]
struct Invalidation {
    epoch: AtomicU64,
    count: AtomicU64,
}

impl Invalidation {
    fn bump(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn current(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    rebuilds: AtomicU64,
    failed_rebuilds: AtomicU64,
    stale_serves: AtomicU64,
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads served from a valid table
    pub hits: u64,
    /// Successful rebuilds
    pub rebuilds: u64,
    pub failed_rebuilds: u64,
    /// Reads answered from the last good table after a failed rebuild
    pub stale_serves: u64,
    pub invalidations: u64,
    /// Current invalidation epoch
    pub epoch: u64,
    /// Whether the held table matches the current epoch
    pub valid: bool,
}

impl CacheStats {
    /// Share of table reads that did not need a rebuild
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.rebuilds + self.failed_rebuilds;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Process-wide memoized view of the permission resolver
pub struct PermissionCache<V: AllowedValue> {
    roles: Arc<dyn RoleSource>,
    rules: Arc<dyn RuleStore<V>>,
    resolver: PermissionResolver<V>,
    config: AuthzConfig,

    /// Last successfully built table, valid or not
    current: ArcSwapOption<ResolvedTable<V>>,

    invalidation: Arc<Invalidation>,

    /// Serializes rebuilds
    rebuild_gate: tokio::sync::Mutex<()>,

    /// Finished build attempts, successful or not
    attempts: AtomicU64,

    /// Most recent failed attempt and the epoch it was made against
    last_failure: Mutex<Option<(u64, AuthzError)>>,

    counters: Counters,
}

impl<V: AllowedValue> PermissionCache<V> {
    /// Creates an empty (invalid) cache and subscribes it to both stores'
    /// change notifications.
    pub fn new(
        roles: Arc<dyn RoleSource>,
        rules: Arc<dyn RuleStore<V>>,
        resolver: PermissionResolver<V>,
        config: AuthzConfig,
    ) -> Self {
        let resolver = resolver.with_pruning(config.prune_defaults);
        let cache = Self {
            roles,
            rules,
            resolver,
            config,
            current: ArcSwapOption::empty(),
            invalidation: Arc::new(Invalidation::default()),
            rebuild_gate: tokio::sync::Mutex::new(()),
            attempts: AtomicU64::new(0),
            last_failure: Mutex::new(None),
            counters: Counters::default(),
        };

        cache.roles.on_changed(cache.listener());
        cache.rules.on_changed(cache.listener());
        cache
    }

    /// Listener that invalidates this cache; safe to register anywhere
    pub fn listener(&self) -> ChangeListener {
        let invalidation = Arc::clone(&self.invalidation);
        Arc::new(move |event: &ChangeEvent| {
            tracing::debug!(?event, "permission cache invalidated by store change");
            invalidation.bump();
        })
    }

    /// Marks the cache invalid; the next read rebuilds
    pub fn invalidate(&self) {
        tracing::debug!("permission cache invalidated");
        self.invalidation.bump();
    }

    /// Write path hook for rule commits
    pub fn on_rule_saved(&self) {
        self.invalidate();
    }

    /// Write path hook for role hierarchy commits
    pub fn on_role_hierarchy_changed(&self) {
        self.invalidate();
    }

    pub fn is_valid(&self) -> bool {
        self.valid_table().is_some()
    }

    /// Effective value for `(role, key)`. Keys without any rule, and roles
    /// the table does not know, resolve to the default value.
    pub async fn get_allowed(&self, role: &str, key: &str) -> Result<V> {
        if !self.config.enabled {
            return Ok(V::default_allowed());
        }
        Ok(self.table().await?.get_allowed(role, key))
    }

    /// Administrative listing for a role: one entry per key referenced by
    /// any rule, with the inherited base value and the effective value.
    pub async fn resolve(&self, role: &str) -> Result<BTreeMap<ResourceKey, AllowedRule<V>>> {
        Ok(self.table().await?.resolve(role))
    }

    /// Current table, rebuilding first when invalid
    pub async fn table(&self) -> Result<Arc<ResolvedTable<V>>> {
        if let Some(table) = self.valid_table() {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(table);
        }
        self.rebuild(self.config.serve_stale_on_failure).await
    }

    /// Invalidates and rebuilds now. Unlike reads, a failed rebuild is
    /// always returned as an error.
    pub async fn refresh(&self) -> Result<Arc<ResolvedTable<V>>> {
        self.invalidate();
        self.rebuild(false).await
    }

    /// Last held table regardless of validity
    pub fn snapshot(&self) -> Option<Arc<ResolvedTable<V>>> {
        self.current.load_full()
    }

    /// Error of the most recent failed rebuild, cleared by a successful one
    pub fn last_error(&self) -> Option<AuthzError> {
        self.last_failure.lock().as_ref().map(|(_, err)| err.clone())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            rebuilds: self.counters.rebuilds.load(Ordering::Relaxed),
            failed_rebuilds: self.counters.failed_rebuilds.load(Ordering::Relaxed),
            stale_serves: self.counters.stale_serves.load(Ordering::Relaxed),
            invalidations: self.invalidation.count.load(Ordering::Relaxed),
            epoch: self.invalidation.current(),
            valid: self.is_valid(),
        }
    }

    pub fn config(&self) -> &AuthzConfig {
        &self.config
    }

    fn valid_table(&self) -> Option<Arc<ResolvedTable<V>>> {
        let epoch = self.invalidation.current();
        self.current
            .load_full()
            .filter(|table| table.epoch() == epoch)
    }

    async fn rebuild(&self, serve_stale: bool) -> Result<Arc<ResolvedTable<V>>> {
        let attempts_seen = self.attempts.load(Ordering::Acquire);
        let _gate = self.rebuild_gate.lock().await;

        // Another reader may have finished a rebuild while we waited
        if let Some(table) = self.valid_table() {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(table);
        }

        // Read the epoch before loading: a write that lands mid-build leaves
        // the new table already stale
        let epoch = self.invalidation.current();

        // An attempt for this epoch failed while we waited; share its outcome
        if self.attempts.load(Ordering::Acquire) != attempts_seen {
            let failure = self.last_failure.lock().clone();
            if let Some((failed_epoch, err)) = failure {
                if failed_epoch == epoch {
                    tracing::debug!(epoch, "reusing outcome of failed permission table rebuild");
                    return self.after_failure(err, serve_stale);
                }
            }
        }

        let started = Instant::now();
        let outcome = self.build(epoch).await;

        match outcome {
            Ok(table) => {
                let table = Arc::new(table);
                self.current.store(Some(Arc::clone(&table)));
                *self.last_failure.lock() = None;
                self.attempts.fetch_add(1, Ordering::AcqRel);
                self.counters.rebuilds.fetch_add(1, Ordering::Relaxed);

                let elapsed = started.elapsed();
                tracing::info!(
                    epoch,
                    roles = table.roles().count(),
                    keys = table.keys().count(),
                    entries = table.entry_count(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "permission table rebuilt"
                );
                if elapsed > self.config.slow_rebuild_threshold() {
                    tracing::warn!(elapsed_ms = elapsed.as_millis() as u64, "slow permission table rebuild");
                }
                Ok(table)
            }
            Err(err) => {
                *self.last_failure.lock() = Some((epoch, err.clone()));
                self.attempts.fetch_add(1, Ordering::AcqRel);
                self.counters.failed_rebuilds.fetch_add(1, Ordering::Relaxed);
                tracing::error!(epoch, error = %err, "permission table rebuild failed");
                self.after_failure(err, serve_stale)
            }
        }
    }

    /// Falls back to the last good table when allowed, otherwise returns
    /// the error
    fn after_failure(&self, err: AuthzError, serve_stale: bool) -> Result<Arc<ResolvedTable<V>>> {
        if serve_stale {
            if let Some(stale) = self.current.load_full() {
                self.counters.stale_serves.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    error = %err,
                    stale_epoch = stale.epoch(),
                    "serving last good permission table"
                );
                return Ok(stale);
            }
        }
        Err(err)
    }

    async fn build(&self, epoch: u64) -> Result<ResolvedTable<V>> {
        let roles = self.roles.load().await?;
        let graph = RoleGraph::from_definitions(&roles)?;
        let rules = self.rules.load_all().await?;
        self.resolver.resolve(&graph, &rules, epoch)
    }
}
