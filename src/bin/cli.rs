use sqlx::Row;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use chrono::Utc;
use dotenvy::dotenv;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use case_authz::authz::{
    is_admin_bypass, registry, resolve, AuthorizationEngine, Canonicalizer,
    MatrixEditor, PermissionCache, PolicyEvaluator, DEFAULT_RULES,
};
use case_authz::config::AuthzConfig;
use case_authz::db::{PermissionStore, SqlitePermissionStore};
use case_authz::events::{init_event_bus, start_activity_listener};
use case_authz::models::permission::PermissionRecord;

#[derive(Parser, Debug)]
#[command(author, version, about = "case-authz migration and permission tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new empty migration with the provided name
    MakeMigration { name: String },
    /// Apply pending migrations
    MigrateRun,
    /// Show migration status against the current database
    MigrateStatus,
    /// Print the canonical action id for a persisted (resource, action) pair
    Canonicalize { resource: String, action: String },
    /// Decide whether a role may perform an action
    Check { role_id: String, action_id: String },
    /// Grant a permission and record it in the audit log
    Grant { role_id: String, resource: String, action: String },
    /// Revoke a permission and record it in the audit log
    Revoke { role_id: String, resource: String, action: String },
    /// List registered action ids by feature area
    Registry,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Try to load env from CWD; when running in Docker the binary CWD may differ,
    // so fall back to the crate-local `.env` using CARGO_MANIFEST_DIR.
    if dotenv().is_err() {
        let crate_env = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(crate_env);
    }

    let cli = Cli::parse();

    match cli.command {
        Commands::MakeMigration { name } => {
            let path = make_migration_file(&name)?;
            println!("Created migration: {}", path.display());
        }
        Commands::MigrateRun => {
            let pool = get_pool().await?;
            let migrator = get_migrator().await?;
            migrator.run(&pool).await?;
            println!("Migrations applied");
        }
        Commands::MigrateStatus => {
            let pool = get_pool().await?;
            let migrator = get_migrator().await?;
            print_status(&pool, &migrator).await?;
        }
        Commands::Canonicalize { resource, action } => {
            let resolution = resolve(DEFAULT_RULES, &resource, &action);
            let source = match resolution.rule {
                Some(idx) => format!("rule #{idx}"),
                None => "fallback".to_string(),
            };
            println!("{} ({})", resolution.action_id, source);
        }
        Commands::Check { role_id, action_id } => {
            let pool = get_pool().await?;
            let store: Arc<dyn PermissionStore> = Arc::new(SqlitePermissionStore::new(pool));
            let cache = Arc::new(PermissionCache::new(store, Canonicalizer::default()));
            let engine = AuthorizationEngine::new(cache);

            let allowed = engine.has_permission(&role_id, &action_id).await;
            let note = if is_admin_bypass(&role_id) { " (admin bypass)" } else { "" };
            println!("{} {} {}{}", role_id, if allowed { "may" } else { "may not" }, action_id, note);
            if !registry::is_registered(&action_id) {
                println!("warning: {} is not a registered action id", action_id);
            }
        }
        Commands::Grant { role_id, resource, action } => {
            let change = PermissionRecord::new(role_id, resource, action, true);
            apply_change(change).await?;
        }
        Commands::Revoke { role_id, resource, action } => {
            let change = PermissionRecord::new(role_id, resource, action, false);
            apply_change(change).await?;
        }
        Commands::Registry => {
            for group in registry::grouped() {
                println!("{}", group.label);
                for action in group.actions {
                    println!("  {:<28} {}", action.id, action.description);
                }
            }
        }
    }

    Ok(())
}

async fn apply_change(change: PermissionRecord) -> anyhow::Result<()> {
    let pool = get_pool().await?;
    let config = AuthzConfig::from_env()?;
    let store: Arc<dyn PermissionStore> = Arc::new(SqlitePermissionStore::new(pool.clone()));
    let cache = Arc::new(PermissionCache::new(Arc::clone(&store), Canonicalizer::default()));

    let (bus, rx) = init_event_bus();
    let listener = tokio::spawn(start_activity_listener(rx, pool));
    let editor = MatrixEditor::new(store, cache)
        .with_event_bus(bus)
        .with_concurrency(config.write_concurrency);

    let key = change.key();
    let result = editor.apply_changes(vec![change]).await;

    // Closing the bus lets the listener drain and exit.
    drop(editor);
    listener.await.context("audit listener failed")?;

    if let Some(failed) = result.failed.first() {
        anyhow::bail!("{}: {}", failed.key, failed.message);
    }
    println!("Updated {}", key);
    Ok(())
}

fn make_migration_file(name: &str) -> anyhow::Result<PathBuf> {
    let timestamp = Utc::now().format("%Y%m%d%H%M%S");
    let sanitized = sanitize_name(name);
    let filename = format!("{}_{}.sql", timestamp, sanitized);
    let path = Path::new("migrations").join(filename);

    if path.exists() {
        anyhow::bail!("migration already exists: {}", path.display());
    }

    fs::write(&path, "-- Write your migration SQL here\n")
        .with_context(|| format!("failed to create migration at {}", path.display()))?;

    Ok(path)
}

async fn get_pool() -> anyhow::Result<SqlitePool> {
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL not set")?;
    SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to database")
}

async fn print_status(pool: &SqlitePool, migrator: &sqlx::migrate::Migrator) -> anyhow::Result<()> {
    // If the migrations table doesn't exist, nothing is applied yet
    let db_applied = sqlx::query("SELECT name FROM sqlite_master WHERE type='table' AND name='_sqlx_migrations'")
        .fetch_optional(pool)
        .await?;
    let applied_versions: HashSet<i64> = if db_applied.is_some() {
        let rows = sqlx::query("SELECT version FROM _sqlx_migrations WHERE success = 1")
            .fetch_all(pool)
            .await?;
        rows.iter().filter_map(|row| row.try_get::<i64, _>("version").ok()).collect()
    } else {
        HashSet::new()
    };

    println!("{:<8} {:<20} {}", "Status", "Version", "Name");
    for migration in migrator.iter() {
        let version = migration.version;
        let status = if applied_versions.contains(&version) { "applied" } else { "pending" };
        let desc = migration.description.as_ref().trim();
        let name = if desc.is_empty() { "unknown" } else { desc };
        println!("{:<8} {:<20} {}", status, version, name);
    }

    Ok(())
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '_' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '_',
        })
        .collect()
}

async fn get_migrator() -> anyhow::Result<sqlx::migrate::Migrator> {
    // Prefer ./migrations when run from the repo root, else the crate-local folder.
    let local = Path::new("./migrations");
    let migrator_path = if local.exists() {
        local.to_path_buf()
    } else {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations")
    };

    let migrator_path_display = migrator_path.display().to_string();
    sqlx::migrate::Migrator::new(migrator_path)
        .await
        .with_context(|| format!("failed to load migrations from {}", migrator_path_display))
}
