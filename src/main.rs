//! vscanner - Security Scan Execution Engine CLI

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vscanner::config::{self, Config, RuntimeErrorPolicy};
use vscanner::detector::SandboxRunner;
use vscanner::http::{self, AppState};
use vscanner::jobs::WorkerPool;
use vscanner::notify::LogNotifier;
use vscanner::scanner::{ScanEngine, ScanRun};
use vscanner::store::SqliteStore;

/// vscanner - runs vulnerability detectors against a scan's targets
#[derive(Parser)]
#[command(name = "vscanner", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database path (overrides DATABASE_URL)
    #[arg(long, global = true)]
    database: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept scan triggers over HTTP and execute them on a worker pool
    Serve {
        /// Address to listen on
        #[arg(short, long)]
        bind: Option<String>,

        /// Number of scan workers
        #[arg(short, long)]
        workers: Option<usize>,

        /// Detector runtime executable
        #[arg(long)]
        runtime: Option<String>,

        /// Per-detector deadline in seconds
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        detector_timeout: Option<u64>,

        /// How a throwing detector is classified (fail_open, fail_closed)
        #[arg(long)]
        runtime_error_policy: Option<RuntimeErrorPolicy>,
    },

    /// Start and execute one scan in the foreground
    Run {
        /// Scan identifier
        #[arg(short, long)]
        scan_id: String,

        /// Detector runtime executable
        #[arg(long)]
        runtime: Option<String>,

        /// Per-detector deadline in seconds
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        detector_timeout: Option<u64>,

        /// How a throwing detector is classified (fail_open, fail_closed)
        #[arg(long)]
        runtime_error_policy: Option<RuntimeErrorPolicy>,
    },

    /// Print the persisted state of a scan
    Status {
        /// Scan identifier
        #[arg(short, long)]
        scan_id: String,
    },

    /// Create the database schema
    InitDb,
}

fn print_banner() {
    let banner = r#"
    ╔═══════════════════════════════════════╗
    ║  VSCANNER v0.1.0                      ║
    ║  Scan Execution Engine                ║
    ╚═══════════════════════════════════════╝
    "#;
    println!("{}", banner.cyan());
}

fn load_config(path: Option<&Path>) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = match path {
        Some(path) => config::load_config(path)?,
        None => {
            let default_path = Path::new("config/default.toml");
            if default_path.exists() {
                config::load_config(default_path)?
            } else {
                Config::default()
            }
        }
    };
    config::apply_env(&mut config);
    Ok(config)
}

/// Flips the shutdown flag on Ctrl+C
fn spawn_shutdown_listener(tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl+c: {}", e);
            return;
        }
        info!("Shutdown requested, finishing current items...");
        let _ = tx.send(true);
    });
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "vscanner=debug"
    } else {
        "vscanner=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve {
            bind,
            workers,
            runtime,
            detector_timeout,
            runtime_error_policy,
        } => {
            config::merge_cli_args(
                &mut config,
                bind,
                cli.database,
                workers,
                runtime,
                detector_timeout,
                runtime_error_policy,
            );
            print_banner();

            let engine = Arc::new(ScanEngine::from_config(&config)?);
            let stalled = engine.report_stalled().await?;
            if stalled > 0 {
                println!(
                    "  {} {} scan(s) left in started state",
                    "Warning:".yellow().bold(),
                    stalled
                );
            }

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            spawn_shutdown_listener(shutdown_tx);

            let (queue, pool) = WorkerPool::spawn(
                Arc::clone(&engine),
                config.workers,
                config.queue_capacity,
                shutdown_rx.clone(),
            );

            println!("  {} {}", "Listening:".bold(), config.bind.green());
            println!("  {} {}", "Workers:".bold(), config.workers.to_string().cyan());
            println!(
                "  {} {} ({}s, {:?})\n",
                "Runtime:".bold(),
                config.sandbox.runtime.cyan(),
                config.sandbox.timeout_secs,
                config.sandbox.runtime_error_policy
            );

            let listener = TcpListener::bind(&config.bind).await?;
            let state = Arc::new(AppState { engine, queue });
            http::serve(listener, state, shutdown_rx).await?;
            pool.join().await;
        }

        Commands::Run {
            scan_id,
            runtime,
            detector_timeout,
            runtime_error_policy,
        } => {
            config::merge_cli_args(
                &mut config,
                None,
                cli.database,
                None,
                runtime,
                detector_timeout,
                runtime_error_policy,
            );
            print_banner();

            let engine = ScanEngine::from_config(&config)?;
            engine.start(&scan_id).await?;
            println!("  {} {}\n", "Scan:".bold(), scan_id.green());

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            spawn_shutdown_listener(shutdown_tx);

            match engine.execute(&scan_id, &shutdown_rx).await {
                ScanRun::Completed(report) => {
                    println!("\n{}", "  Scan Summary".bold());
                    println!("  {}", "─".repeat(35));
                    println!(
                        "  {} {} {}",
                        format!("{} Found", report.total_found).red().bold(),
                        format!("{} Passed", report.total_passed).green(),
                        format!("{} Failed", report.total_failed).yellow(),
                    );
                }
                ScanRun::Failed(message) => {
                    eprintln!("  {} {}", "Scan failed:".red().bold(), message);
                    std::process::exit(1);
                }
            }
        }

        Commands::Status { scan_id } => {
            config::merge_cli_args(&mut config, None, cli.database, None, None, None, None);
            let store = SqliteStore::open(Path::new(&config.database_path))?;
            let engine = ScanEngine::new(
                Arc::new(store),
                SandboxRunner::from_config(&config.sandbox),
                Arc::new(LogNotifier),
            );
            let status = engine.status(&scan_id).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }

        Commands::InitDb => {
            config::merge_cli_args(&mut config, None, cli.database, None, None, None, None);
            SqliteStore::open(Path::new(&config.database_path))?;
            println!(
                "  {} {}",
                "Schema ready in".bold(),
                config.database_path.green()
            );
        }
    }

    Ok(())
}
