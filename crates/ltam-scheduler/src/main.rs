//! LTAM scheduler service.
//!
//! Runs the periodic synthesis sweep, dream-curation sweep, and
//! stale-session janitor defined in `ltam_scheduler::lib`, wiring them to a
//! real database and a real LLM/embedding provider. Never exits on its own
//! once started — SIGINT/SIGTERM triggers a graceful `JobScheduler`
//! shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use ltam_core::collaborators::Collaborators;
use ltam_core::store::Store;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use ltam_scheduler::clients::{HttpClientConfig, HttpEmbeddingClient, HttpLlmClient};
use ltam_scheduler::{run_scheduler_service, SchedulerConfig, SchedulerContext};

/// Parses `--db <PATH>`/`--db=<PATH>`, `--help`, `--version`. Anything else
/// is rejected outright rather than silently ignored.
fn parse_args() -> Option<PathBuf> {
    let args: Vec<String> = std::env::args().collect();
    let mut db_path: Option<PathBuf> = None;
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                println!("ltam-scheduler v{}", env!("CARGO_PKG_VERSION"));
                println!();
                println!("Runs the periodic synthesis/dream/stale-session sweeps.");
                println!();
                println!("USAGE:");
                println!("    ltam-scheduler [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    -h, --help          Print help information");
                println!("    -V, --version       Print version information");
                println!("    --db <PATH>         Path to the SQLite database (default: platform data dir)");
                println!();
                println!("ENVIRONMENT:");
                println!("    RUST_LOG                    Log level filter (e.g., debug, info, warn, error)");
                println!("    LTAM_LLM_API_KEY            API key for the configured LLM/embedding provider (required)");
                println!("    LTAM_LLM_BASE_URL           OpenAI-compatible base URL (default: https://api.openai.com/v1)");
                println!("    LTAM_LLM_CHAT_MODEL         Chat model name (default: gpt-4o-mini)");
                println!("    LTAM_LLM_EMBEDDING_MODEL    Embedding model name (default: text-embedding-3-small)");
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("ltam-scheduler {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--db" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("error: --db requires a path argument");
                    std::process::exit(1);
                }
                db_path = Some(PathBuf::from(&args[i]));
            }
            arg if arg.starts_with("--db=") => {
                db_path = Some(PathBuf::from(arg.strip_prefix("--db=").unwrap_or("")));
            }
            arg => {
                eprintln!("error: unknown argument '{arg}'");
                eprintln!("Try 'ltam-scheduler --help' for more information.");
                std::process::exit(1);
            }
        }
        i += 1;
    }

    db_path
}

#[tokio::main]
async fn main() {
    let db_path = parse_args();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with_target(false)
        .init();

    info!("LTAM scheduler v{} starting...", env!("CARGO_PKG_VERSION"));

    let resolved_path = match db_path {
        Some(p) => p,
        None => match ltam_core::config::default_database_path() {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to resolve default database path: {e}");
                std::process::exit(1);
            }
        },
    };

    let store = match Store::open(&resolved_path) {
        Ok(s) => {
            info!(path = %resolved_path.display(), "database opened");
            Arc::new(s)
        }
        Err(e) => {
            error!("Failed to open database at {}: {e}", resolved_path.display());
            std::process::exit(1);
        }
    };

    let client_config = match HttpClientConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("LLM provider not configured: {e}");
            std::process::exit(1);
        }
    };
    let collaborators = Arc::new(Collaborators {
        embedding: Arc::new(HttpEmbeddingClient::new(client_config.clone())),
        llm: Arc::new(HttpLlmClient::new(client_config)),
        background_jobs_enabled: true,
    });

    let ctx = SchedulerContext::new(store, collaborators, SchedulerConfig::default());

    let scheduler = match run_scheduler_service(ctx).await {
        Ok(s) => {
            info!("scheduler jobs registered and started");
            s
        }
        Err(e) => {
            error!("Failed to start scheduler: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {e}");
    }
    info!("shutdown signal received, stopping scheduler");

    let mut scheduler = scheduler;
    if let Err(e) = scheduler.shutdown().await {
        error!("Error during scheduler shutdown: {e}");
    }

    info!("LTAM scheduler shut down");
}
