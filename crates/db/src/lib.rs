//! Database bootstrap and migration tooling.
//!
//! Provides `init_db_pool` for creating a per-service connection pool,
//! a versioned migration runner, and migration-file authoring for the CLI.

use anyhow::{Context, Result};
use app_config::ServiceConfig;
use chrono::Utc;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use std::path::PathBuf;
use tokio::fs;
use tokio_postgres::{Client, Config as PgConfig, NoTls};
use tracing::info;

const VERSION_TIME_FORMAT: &str = "%Y%m%d%H%M%S";

/// Initializes the connection pool for one service's private database.
///
/// Retries the first connection a few times so the service can come up
/// alongside its database container.
///
/// # Errors
/// Returns an error if the DSN does not parse or no connection can be
/// obtained after the retries.
pub async fn init_db_pool(cfg: &ServiceConfig) -> Result<Pool> {
    let pg_config: PgConfig = cfg
        .database_dsn
        .parse()
        .context("Failed to parse Postgres DSN")?;

    let mgr = Manager::from_config(
        pg_config,
        NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );
    let pool = Pool::builder(mgr)
        .max_size(16)
        .runtime(Runtime::Tokio1)
        .build()
        .context("Failed to create database pool")?;

    let max_retries = 5;
    let mut retry_count = 0;

    loop {
        match pool.get().await {
            Ok(_) => {
                info!(
                    service = %cfg.name,
                    "Connected to database after {} retries",
                    retry_count
                );
                return Ok(pool);
            }
            Err(e) => {
                retry_count += 1;
                if retry_count >= max_retries {
                    return Err(anyhow::anyhow!(
                        "Failed to get DB connection after {max_retries} retries: {e:?}"
                    ));
                }
                info!(
                    "Failed to connect to database (attempt {}/{}), retrying in 1 second...",
                    retry_count, max_retries
                );
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
}

/// Applies all pending `*.up.sql` migrations from the given directory,
/// in filename order, recording each version in `schema_migrations`.
///
/// # Returns
/// The number of migrations applied (0 means the schema was already
/// up to date).
pub async fn run_pending_migrations(client: &Client, migrations_dir: &str) -> Result<usize> {
    client
        .batch_execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version    TEXT PRIMARY KEY,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
        )
        .await
        .context("Failed to create schema_migrations table")?;

    let applied: Vec<String> = client
        .query("SELECT version FROM schema_migrations", &[])
        .await?
        .into_iter()
        .map(|row| row.get(0))
        .collect();

    let mut pending = collect_up_migrations(migrations_dir).await?;
    pending.retain(|(version, _)| !applied.iter().any(|v| v == version));

    let count = pending.len();
    for (version, path) in pending {
        let file_name = path.file_name().unwrap_or_default().to_string_lossy();
        info!("Applying migration: {}", file_name);
        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read migration file {file_name}"))?;

        client
            .batch_execute(&content)
            .await
            .with_context(|| format!("Failed to execute migration {file_name}"))?;
        client
            .execute(
                "INSERT INTO schema_migrations (version) VALUES ($1)",
                &[&version],
            )
            .await
            .with_context(|| format!("Failed to record migration {version}"))?;
    }

    Ok(count)
}

/// Creates a timestamped pair of empty up/down migration files and returns
/// their paths.
pub async fn create_migration(migrations_dir: &str, name: &str) -> Result<(PathBuf, PathBuf)> {
    let version = Utc::now().format(VERSION_TIME_FORMAT);
    let dir = PathBuf::from(migrations_dir);
    fs::create_dir_all(&dir)
        .await
        .context("Failed to create migrations directory")?;

    let up = dir.join(format!("{version}_{name}.up.sql"));
    let down = dir.join(format!("{version}_{name}.down.sql"));
    fs::write(&up, b"")
        .await
        .with_context(|| format!("Failed to create {}", up.display()))?;
    fs::write(&down, b"")
        .await
        .with_context(|| format!("Failed to create {}", down.display()))?;

    Ok((up, down))
}

/// Lists `(version, path)` for every `*.up.sql` file in the directory,
/// sorted by filename. The version is the filename up to the first `_`.
async fn collect_up_migrations(migrations_dir: &str) -> Result<Vec<(String, PathBuf)>> {
    let mut entries = fs::read_dir(migrations_dir)
        .await
        .with_context(|| format!("Failed to read migrations directory {migrations_dir}"))?;

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        if let Some(stem) = file_name.strip_suffix(".up.sql") {
            let version = stem.split('_').next().unwrap_or(stem).to_string();
            files.push((file_name.clone(), version, path));
        }
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files.into_iter().map(|(_, v, p)| (v, p)).collect())
}
