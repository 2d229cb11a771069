mod config;
mod jobs_cmd;
mod serve_cmd;
mod stats_cmd;

use anyhow::Context;
use clap::{Parser, Subcommand};

use steward_db::pool;

use config::StewardConfig;

#[derive(Parser)]
#[command(name = "steward", about = "Durable job orchestrator for fleets of LLM agents")]
struct Cli {
    /// Database URL (overrides STEWARD_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a steward config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/steward")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the steward database (create + migrate)
    DbInit,
    /// Show queue statistics
    Stats {
        /// Restrict to one agent queue
        #[arg(long)]
        agent: Option<String>,
    },
    /// List jobs
    List {
        /// Restrict to one agent queue
        #[arg(long)]
        agent: Option<String>,
        /// Filter: queued, active, completed, failed
        #[arg(long)]
        status: Option<String>,
        /// Maximum rows
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show one job in full
    Inspect {
        /// Job ID
        job_id: String,
    },
    /// Re-enqueue a failed job
    Retry {
        /// Job ID (must be in failed state)
        job_id: String,
    },
    /// Delete all unlaunched jobs on an agent queue
    Drain {
        /// Agent queue to drain
        agent: String,
        /// Required; draining discards queued work
        #[arg(long)]
        confirm: bool,
    },
    /// List pending approvals
    Pending {
        /// Maximum rows
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Run the read-only monitoring endpoint
    Serve {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Port
        #[arg(long, default_value_t = 8787)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("steward=info")),
        )
        .init();

    let cli = Cli::parse();

    // Init needs no database connection.
    if let Commands::Init { db_url, force } = &cli.command {
        let path = config::config_path();
        if path.exists() && !force {
            anyhow::bail!(
                "config file already exists at {} (use --force to overwrite)",
                path.display()
            );
        }
        let file = config::ConfigFile {
            database: config::DatabaseSection {
                url: db_url.clone(),
            },
            orchestrator: Default::default(),
        };
        config::save_config(&file)?;
        println!("wrote {}", path.display());
        return Ok(());
    }

    let resolved = StewardConfig::resolve(cli.database_url.as_deref())?;

    if let Commands::DbInit = &cli.command {
        let db = pool::bootstrap(&resolved.db_config).await?;
        db.close().await;
        println!("database ready at {}", resolved.db_config.database_url);
        return Ok(());
    }

    let db = pool::connect(&resolved.db_config)
        .await
        .context("could not connect to the steward database (run `steward db-init`?)")?;

    match cli.command {
        Commands::Init { .. } | Commands::DbInit => unreachable!("handled above"),
        Commands::Stats { agent } => {
            stats_cmd::run_stats(&db, &resolved.orchestrator, agent.as_deref()).await?
        }
        Commands::List {
            agent,
            status,
            limit,
        } => jobs_cmd::run_list(&db, agent.as_deref(), status.as_deref(), limit).await?,
        Commands::Inspect { job_id } => jobs_cmd::run_inspect(&db, &job_id).await?,
        Commands::Retry { job_id } => {
            jobs_cmd::run_retry(&db, &resolved.orchestrator, &job_id).await?
        }
        Commands::Drain { agent, confirm } => jobs_cmd::run_drain(&db, &agent, confirm).await?,
        Commands::Pending { limit } => jobs_cmd::run_pending(&db, limit).await?,
        Commands::Serve { bind, port } => {
            serve_cmd::run_serve(db, &resolved.orchestrator, &bind, port).await?
        }
    }

    Ok(())
}
