//! # Clause Haus CLI (`clause-haus`)
//!
//! ## Usage
//!
//! ```bash
//! clause-haus --config ./config/clause-haus.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `clause-haus init` | Create the SQLite database and run schema migrations |
//! | `clause-haus serve` | Start the job protocol HTTP server |
//! | `clause-haus analyze <pdf>` | Analyze a local contract and print the report |
//! | `clause-haus status <job-id>` | Print a job's status |
//! | `clause-haus corpus load <file>` | Embed and store statute sections |
//!
//! ## Examples
//!
//! ```bash
//! clause-haus init --config ./config/clause-haus.toml
//! clause-haus corpus load ./data/bgb_sections.json
//! clause-haus analyze ./mietvertrag.pdf
//! clause-haus serve
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use clause_haus::config::{self, Config};
use clause_haus::document::encode_data_uri;
use clause_haus::jobs::JobService;
use clause_haus::models::{InputItem, JobStatus};
use clause_haus::store::{SqliteStore, Store};
use clause_haus::{corpus, db, migrate, server};

/// Clause Haus: checks rental contracts for clauses that conflict with
/// statute law.
#[derive(Parser)]
#[command(name = "clause-haus", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/clause-haus.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// Analyze a local PDF and print the report.
    ///
    /// Runs without the payment gate. Results are cached by document
    /// content, so analyzing the same file again is free.
    Analyze {
        /// Path to the contract PDF.
        pdf: PathBuf,

        /// Give up after this many seconds.
        #[arg(long, default_value_t = 600)]
        timeout_secs: u64,
    },

    /// Print the status of a job.
    Status {
        /// Job UUID.
        job_id: String,
    },

    /// Manage the statute reference corpus.
    Corpus {
        #[command(subcommand)]
        action: CorpusAction,
    },
}

#[derive(Subcommand)]
enum CorpusAction {
    /// Embed new or changed sections from a parsed statute JSON file.
    Load {
        /// Path to the sections JSON.
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("clause_haus=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Analyze { pdf, timeout_secs } => {
            run_analyze(&cfg, &pdf, Duration::from_secs(timeout_secs)).await?;
        }
        Commands::Status { job_id } => {
            run_status(&cfg, &job_id).await?;
        }
        Commands::Corpus { action } => match action {
            CorpusAction::Load { file } => {
                corpus::run_corpus_load(&cfg, &file).await?;
            }
        },
    }

    Ok(())
}

async fn run_analyze(cfg: &Config, pdf: &Path, timeout: Duration) -> anyhow::Result<()> {
    let bytes =
        std::fs::read(pdf).with_context(|| format!("Failed to read PDF: {}", pdf.display()))?;

    let jobs = JobService::from_config(cfg, false).await?;
    let submission = jobs
        .submit(None, vec![InputItem::new("document", encode_data_uri(&bytes))])
        .await?;
    let view = jobs.wait_until_terminal(submission.job_id, timeout).await?;

    match view.status {
        JobStatus::Completed => {
            println!("{}", view.result.unwrap_or_default());
            Ok(())
        }
        _ => bail!(
            "analysis failed (job {}): {}",
            view.job_id,
            view.error.unwrap_or_else(|| "unknown error".to_string())
        ),
    }
}

async fn run_status(cfg: &Config, job_id: &str) -> anyhow::Result<()> {
    let id = Uuid::parse_str(job_id.trim())
        .map_err(|_| anyhow::anyhow!("invalid job id: {}", job_id))?;

    let pool = db::connect(cfg).await?;
    migrate::apply_schema(&pool).await?;
    let store = SqliteStore::new(pool);

    let Some(job) = store.get_job(id).await? else {
        bail!("job {} not found", id);
    };

    println!("job {}", job.id);
    println!("  status:  {}", job.status);
    if let Some(payment) = job.payment_status {
        println!("  payment: {}", payment);
    }
    if let Some(error) = &job.error {
        println!("  error:   {}", error);
    }
    if let Some(result) = &job.result {
        println!();
        println!("{}", result);
    }

    store.pool().close().await;
    Ok(())
}
