//! # Rulepack CLI
//!
//! Inspects a permission fixture: resolution order, point checks and the
//! full per-role listing.
//!
//! ## Configuration
//!
//! - `--fixture` / `RULEPACK_FIXTURE` - JSON fixture with roles, keys and rules
//! - `--config` / `RULEPACK_CONFIG` - optional JSON `AuthzConfig`
//! - `RUST_LOG` - log level (default: warn)

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rulepack_authz::{
    AuthzConfig, Fixture, PermissionResolver, PermissionService, RoleGraph, RoleSource,
};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Rulepack - role permission inspector
#[derive(Parser)]
#[command(name = "rulepack", version, about = "Resolve role permissions from a rule fixture")]
struct Cli {
    /// Fixture file
    #[arg(short, long, env = "RULEPACK_FIXTURE")]
    fixture: PathBuf,

    /// Configuration file
    #[arg(short, long, env = "RULEPACK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print roles parents first
    Order,

    /// Print the effective value for one key
    Check { role: String, key: String },

    /// Print every catalog key for a role with base and effective values
    Resolve { role: String },

    /// Print the subset of keys the role may access
    Authorized { role: String, keys: Vec<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AuthzConfig::from_file(path).await?,
        None => AuthzConfig::default(),
    };

    let stores = Fixture::<bool>::from_file(&cli.fixture)
        .await
        .with_context(|| format!("loading fixture {}", cli.fixture.display()))?
        .into_stores()?;

    let service = PermissionService::new(
        stores.roles.clone(),
        stores.rules.clone(),
        stores.catalog.clone(),
        PermissionResolver::default(),
        config,
    );

    match cli.command {
        Commands::Order => {
            let roles = stores.roles.load().await?;
            let graph = RoleGraph::from_definitions(&roles)?;
            for role in graph.roles_in_dependency_order()? {
                let parents: Vec<String> = graph.parents_of(&role).into_iter().collect();
                if parents.is_empty() {
                    println!("{}", role);
                } else {
                    println!("{} <- {}", role, parents.join(", "));
                }
            }
        }
        Commands::Check { role, key } => {
            let allowed = service.get_allowed(&role, &key).await?;
            println!("{} {} {}", role, key, if allowed { "allow" } else { "deny" });
        }
        Commands::Resolve { role } => {
            let pack = service.allowed_rules(&role).await?;
            if pack.parents.is_empty() {
                println!("{} ({})", pack.role, pack.strategy);
            } else {
                println!("{} <- {} ({})", pack.role, pack.parents.join(", "), pack.strategy);
            }
            println!("{:<32} {:<6} {:<6} overridden", "key", "base", "allowed");
            for rule in &pack.rules {
                println!(
                    "{:<32} {:<6} {:<6} {}",
                    rule.key,
                    rule.base,
                    rule.allowed,
                    if rule.overridden() { "yes" } else { "" }
                );
            }
        }
        Commands::Authorized { role, keys } => {
            for key in service.authorized_keys(&role, keys).await? {
                println!("{}", key);
            }
        }
    }

    tracing::debug!(stats = ?service.stats(), "done");
    Ok(())
}
