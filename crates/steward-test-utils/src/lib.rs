//! Integration-test databases for the steward crates.
//!
//! One PostgreSQL server is shared per test binary; every [`TestDb`] is a
//! uniquely-named, fully-migrated database inside it, so tests are isolated
//! without paying a container start each. Point `STEWARD_TEST_PG_URL` at an
//! external server (nextest setup script, CI service container) to skip
//! testcontainers entirely.

use sqlx::{Connection, Executor, PgConnection, PgPool};
use testcontainers::ImageExt;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use steward_db::config::DbConfig;
use steward_db::pool;

/// Server root URL (no database path), resolved once per test binary.
static SERVER_URL: OnceCell<String> = OnceCell::const_new();

async fn server_url() -> &'static str {
    SERVER_URL
        .get_or_init(|| async {
            if let Ok(url) = std::env::var("STEWARD_TEST_PG_URL") {
                return url;
            }
            let container = Postgres::default()
                .with_tag("18")
                .start()
                .await
                .expect("failed to start PostgreSQL container");
            let host = container.get_host().await.expect("container host");
            let port = container
                .get_host_port_ipv4(5432)
                .await
                .expect("container port");
            // The container must outlive every test in the binary; leak the
            // handle so it is torn down with the process.
            Box::leak(Box::new(container));
            format!("postgresql://postgres:postgres@{host}:{port}")
        })
        .await
}

/// Run a statement over a short-lived admin connection to the server's
/// `postgres` database.
async fn admin_execute(sql: &str) {
    let url = format!("{}/postgres", server_url().await);
    let mut admin = PgConnection::connect(&url)
        .await
        .expect("failed to open admin connection");
    admin
        .execute(sql)
        .await
        .unwrap_or_else(|e| panic!("admin statement failed ({sql}): {e}"));
    admin.close().await.ok();
}

/// A dedicated, migrated database for one test.
///
/// Create with [`TestDb::new`], read the pool via [`TestDb::pool`], and
/// call [`TestDb::close`] at the end of the test; the database is dropped
/// with `FORCE`, so stray pool clones cannot keep it alive.
pub struct TestDb {
    pool: PgPool,
    url: String,
    name: String,
}

impl TestDb {
    pub async fn new() -> Self {
        let name = format!("steward_test_{}", Uuid::new_v4().simple());
        admin_execute(&format!("CREATE DATABASE {name}")).await;

        let url = format!("{}/{name}", server_url().await);
        let pool = pool::connect(&DbConfig::new(&url))
            .await
            .expect("failed to connect to test database");
        pool::apply_migrations(&pool)
            .await
            .expect("migrations should apply cleanly");

        Self { pool, url, name }
    }

    /// The pool for this database. Clones share the same inner pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Connection URL of this database, for code under test that opens its
    /// own pool (e.g. service startup).
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Tear the database down.
    pub async fn close(self) {
        self.pool.close().await;
        admin_execute(&format!("DROP DATABASE IF EXISTS {} WITH (FORCE)", self.name)).await;
    }
}
