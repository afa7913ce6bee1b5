//! BigBrotr command-line entry point: one subcommand per service.
//!
//! Exit codes: 0 clean shutdown, 1 unrecoverable configuration or
//! database error, 2 consecutive-failure limit reached.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};

use bigbrotr::config::{self};
use bigbrotr::services::{self, Outcome, Service, Shutdown, metrics};
use bigbrotr::{Database, Result};

#[derive(Parser)]
#[command(name = "bigbrotr", version, about = "Nostr ecosystem archiver")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Clone)]
struct ServiceArgs {
    /// Path to the service's YAML configuration file
    #[arg(long)]
    config: PathBuf,

    /// Run a single cycle instead of the interval loop
    #[arg(long)]
    once: bool,

    /// Log filter when RUST_LOG is unset (e.g. info, debug)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Directory for rolling log files
    #[arg(long, default_value = "logs")]
    logs_dir: PathBuf,
}

#[derive(Subcommand)]
enum Command {
    /// Seed candidate relays from a file (one-shot)
    Seeder(ServiceArgs),
    /// Discover relay URLs from stored events and public APIs
    Finder(ServiceArgs),
    /// Validate candidates and promote them to relays
    Validator(ServiceArgs),
    /// Health-check relays and publish NIP-66 events
    Monitor(ServiceArgs),
    /// Collect events from relays on incremental cursors
    Synchronizer(ServiceArgs),
}

impl Command {
    fn args(&self) -> &ServiceArgs {
        match self {
            Command::Seeder(args)
            | Command::Finder(args)
            | Command::Validator(args)
            | Command::Monitor(args)
            | Command::Synchronizer(args) => args,
        }
    }
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let args = cli.command.args().clone();

    std::fs::create_dir_all(&args.logs_dir).ok();
    bigbrotr::init_tracing(&args.logs_dir, &args.log_level);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(cli.command, args)) {
        Ok(Outcome::Cancelled) => ExitCode::SUCCESS,
        Ok(Outcome::FailureLimit) => ExitCode::from(2),
        Err(e) => {
            tracing::error!(target: "bigbrotr", error = %e, "startup_failed");
            ExitCode::from(1)
        }
    }
}

async fn run(command: Command, args: ServiceArgs) -> Result<Outcome> {
    let shutdown = Shutdown::new();
    spawn_signal_handler(shutdown.clone());

    let outcome = match &command {
        Command::Seeder(_) => {
            let service_config: config::SeederConfig = config::load_yaml(&args.config)?;
            service_config.validate()?;
            let db = connect(&service_config.database).await?;
            let service =
                services::Seeder::new(db.clone(), service_config.clone(), shutdown.clone());
            drive(service, service_config.service.metrics, &args, shutdown, &db).await
        }
        Command::Finder(_) => {
            let service_config: config::FinderConfig = config::load_yaml(&args.config)?;
            service_config.validate()?;
            let db = connect(&service_config.database).await?;
            let service =
                services::Finder::new(db.clone(), service_config.clone(), shutdown.clone());
            drive(service, service_config.service.metrics, &args, shutdown, &db).await
        }
        Command::Validator(_) => {
            let service_config: config::ValidatorConfig = config::load_yaml(&args.config)?;
            service_config.validate()?;
            let db = connect(&service_config.database).await?;
            let service =
                services::Validator::new(db.clone(), service_config.clone(), shutdown.clone());
            drive(service, service_config.service.metrics, &args, shutdown, &db).await
        }
        Command::Monitor(_) => {
            let service_config: config::MonitorConfig = config::load_yaml(&args.config)?;
            service_config.validate()?;
            let db = connect(&service_config.database).await?;
            let service =
                services::Monitor::new(db.clone(), service_config.clone(), shutdown.clone())?;
            drive(service, service_config.service.metrics, &args, shutdown, &db).await
        }
        Command::Synchronizer(_) => {
            let service_config: config::SynchronizerConfig = config::load_yaml(&args.config)?;
            service_config.validate()?;
            let db = connect(&service_config.database).await?;
            let service =
                services::Synchronizer::new(db.clone(), service_config.clone(), shutdown.clone())?;
            drive(service, service_config.service.metrics, &args, shutdown, &db).await
        }
    };

    outcome
}

async fn connect(database: &config::DatabaseConfig) -> Result<Arc<Database>> {
    let db = Arc::new(Database::new(database.clone()));
    db.connect().await?;
    Ok(db)
}

/// Run the service (single cycle or forever), with the metrics endpoint
/// alongside when enabled, then release the pool.
async fn drive<S: Service>(
    mut service: S,
    metrics_config: config::MetricsConfig,
    args: &ServiceArgs,
    shutdown: Shutdown,
    db: &Arc<Database>,
) -> Result<Outcome> {
    let metrics_task = tokio::spawn(metrics::serve(metrics_config, shutdown.clone()));

    let outcome = if args.once {
        let result = service.run().await;
        shutdown.request();
        result.map(|_| Outcome::Cancelled)
    } else {
        let outcome = services::run_forever(&mut service).await;
        shutdown.request();
        Ok(outcome)
    };

    match metrics_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::warn!(target: "bigbrotr", error = %e, "metrics_server_error");
        }
        Err(e) => {
            tracing::warn!(target: "bigbrotr", error = %e, "metrics_server_failed");
        }
    }
    db.close().await;
    outcome
}

fn spawn_signal_handler(shutdown: Shutdown) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!(target: "bigbrotr", "shutdown_signal_received");
            shutdown.request();
        }
    });
}
