//! runnel CLI tool.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "runnel")]
#[command(about = "runnel CI orchestrator", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, env = "RUNNEL_CONFIG", default_value = "runnel.kdl")]
    config: PathBuf,

    /// PostgreSQL build store; takes precedence over `--state`
    #[arg(long, global = true, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// File build store; defaults to `<root>/state.json`
    #[arg(long, global = true, env = "RUNNEL_STATE")]
    state: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync every auto repository and run one scheduling pass
    Tick,
    /// Tick forever
    Daemon {
        /// Seconds between ticks
        #[arg(long, default_value = "10")]
        interval: u64,
    },
    /// Fetch refs and create builds without scheduling
    Sync {
        /// Repository to sync; all auto repositories when omitted
        repo: Option<String>,
    },
    /// Queue a build again ahead of the pending ones
    Force {
        /// Build ID
        id: i64,
    },
    /// Kill a testing or running build
    Kill {
        /// Build ID
        id: i64,
    },
    /// Terminate every in-flight build of this host
    Killall,
    /// List builds
    Builds {
        /// Filter by repository
        #[arg(long)]
        repo: Option<String>,
        /// Filter by state
        #[arg(long)]
        state: Option<String>,
        /// Maximum number of builds to show
        #[arg(long, default_value = "20")]
        limit: usize,
        /// Show branch links and pull request details
        #[arg(long)]
        links: bool,
    },
    /// Validate a configuration file
    Validate {
        /// Path to the configuration file; `--config` when omitted
        path: Option<PathBuf>,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    if let Commands::Validate { path } = &cli.command {
        return commands::validate(path.as_ref().unwrap_or(&cli.config));
    }

    let store = commands::StoreLocation {
        database_url: cli.database_url.clone(),
        state: cli.state.clone(),
    };
    let ctx = commands::open(&cli.config, &store).await?;
    match cli.command {
        Commands::Tick => commands::schedule::tick(&ctx).await?,
        Commands::Daemon { interval } => commands::schedule::daemon(&ctx, interval).await?,
        Commands::Sync { repo } => commands::schedule::sync(&ctx, repo).await?,
        Commands::Force { id } => commands::schedule::force(&ctx, id).await?,
        Commands::Kill { id } => commands::schedule::kill(&ctx, id).await?,
        Commands::Killall => commands::schedule::killall(&ctx).await?,
        Commands::Builds {
            repo,
            state,
            limit,
            links,
        } => commands::builds::list(&ctx, repo, state, limit, links).await?,
        Commands::Validate { .. } => {}
    }

    Ok(())
}
