//! Store connection management.
//!
//! Migrations are embedded at compile time, so a deployed `steward` binary
//! carries its own schema and `bootstrap` can take an empty server to a
//! ready database in one call.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, Executor, PgConnection, PgPool};
use tracing::info;

use crate::config::DbConfig;

static MIGRATOR: Migrator = sqlx::migrate!();

const POOL_SIZE: u32 = 10;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Open a connection pool against an existing database.
pub async fn connect(config: &DbConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(POOL_SIZE)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(&config.database_url)
        .await
        .with_context(|| format!("failed to connect to database at {}", config.database_url))
}

/// Apply any pending embedded migrations.
pub async fn apply_migrations(pool: &PgPool) -> Result<()> {
    MIGRATOR
        .run(pool)
        .await
        .context("failed to run database migrations")?;
    info!("schema is up to date");
    Ok(())
}

/// Take a server from nothing to a ready steward database: create the
/// database if it is missing, connect, and migrate. The `db-init` path.
pub async fn bootstrap(config: &DbConfig) -> Result<PgPool> {
    create_database_if_missing(config).await?;
    let pool = connect(config).await?;
    apply_migrations(&pool).await?;
    Ok(pool)
}

/// Check whether an error chain looks like an authentication failure.
///
/// Auth failures must be distinguishable from ordinary connection loss so
/// the circuit breaker can trip immediately instead of burning retries.
pub fn is_auth_failure(err: &anyhow::Error) -> bool {
    let text = format!("{err:#}");
    text.contains("28P01") || text.contains("password authentication failed")
}

/// Issue `CREATE DATABASE` over a maintenance connection when the target
/// database does not exist yet.
async fn create_database_if_missing(config: &DbConfig) -> Result<()> {
    let name = config
        .database_name()
        .context("could not determine database name from URL")?;
    // CREATE DATABASE cannot be parameterised; refuse anything that is not
    // a plain identifier before formatting it in.
    if !is_plain_identifier(name) {
        bail!("database name {name:?} contains invalid characters");
    }

    let mut admin = PgConnection::connect(&config.maintenance_url())
        .await
        .with_context(|| {
            format!(
                "failed to open maintenance connection to {}",
                config.maintenance_url()
            )
        })?;

    let known: Option<(i32,)> = sqlx::query_as("SELECT 1 FROM pg_database WHERE datname = $1")
        .bind(name)
        .fetch_optional(&mut admin)
        .await
        .context("failed to query pg_database")?;

    if known.is_none() {
        admin
            .execute(format!("CREATE DATABASE {name}").as_str())
            .await
            .with_context(|| format!("failed to create database {name}"))?;
        info!(db = name, "database created");
    }

    admin.close().await.ok();
    Ok(())
}

fn is_plain_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}
