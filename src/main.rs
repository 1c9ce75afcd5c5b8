use clap::{Args, Parser, Subcommand};
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pacer::config::{limiter_key, LoggingConfig, PacerConfig};
use pacer::ratelimit::{LimiterRegistry, RateLimiter};
use pacer::runner::{ChildOutput, CommandRunner};

/// Run commands through a serializing rate limiter with retry.
#[derive(Debug, Parser)]
#[command(name = "pacer", version, about)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Log filter, e.g. `debug` or `pacer=trace`; RUST_LOG takes precedence
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Read shell commands from stdin and run them through a limiter
    Run(RunArgs),
    /// Validate the configuration and print the resolved limiters
    CheckConfig,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Named limiter from the configuration; unknown names use the defaults
    #[arg(short, long, default_value = "default")]
    limiter: String,

    /// Override the minimum interval between command starts
    #[arg(long)]
    min_interval_ms: Option<u64>,

    /// Override the number of retries per command
    #[arg(long)]
    max_retries: Option<u32>,

    /// Override the base retry delay
    #[arg(long)]
    retry_delay_ms: Option<u64>,

    /// Discard command output instead of forwarding it to stderr
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = PacerConfig::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if cli.json_logs {
        config.logging.json = true;
    }

    init_tracing(&config.logging);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting Pacer");

    let registry = LimiterRegistry::from_config(&config)?;

    match cli.command {
        Commands::CheckConfig => {
            info!(limiters = ?registry.names(), "Configuration is valid");
            println!("{}", serde_json::to_string_pretty(&registry.resolved())?);
        }
        Commands::Run(args) => {
            let all_ok = run(&config, &registry, args).await?;
            if !all_ok {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

/// Install the global subscriber. Logs go to stderr; stdout carries reports.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(config: &PacerConfig, registry: &LimiterRegistry, args: RunArgs) -> anyhow::Result<bool> {
    let limiter = if args.min_interval_ms.is_some()
        || args.max_retries.is_some()
        || args.retry_delay_ms.is_some()
    {
        let mut limiter_config = config.limiter(&args.limiter).clone();
        if let Some(ms) = args.min_interval_ms {
            limiter_config.min_interval_ms = ms;
        }
        if let Some(retries) = args.max_retries {
            limiter_config.max_retries = retries;
        }
        if let Some(ms) = args.retry_delay_ms {
            limiter_config.retry_delay_ms = ms;
        }
        let name = limiter_key(&args.limiter);
        registry.insert(&name, RateLimiter::from_config(&name, &limiter_config)?)
    } else {
        registry.get_or_default(&args.limiter)
    };

    info!(
        limiter = %limiter.name(),
        min_interval_ms = limiter.min_interval().as_millis() as u64,
        max_retries = limiter.max_retries(),
        "Reading commands from stdin"
    );

    let output = if args.quiet {
        ChildOutput::Null
    } else {
        ChildOutput::Stderr
    };
    let runner = CommandRunner::new(Arc::clone(&limiter)).with_output(output);
    let reports = runner
        .run_lines(BufReader::new(tokio::io::stdin()), shutdown_signal())
        .await?;

    for report in &reports {
        println!("{report}");
    }
    println!("{}", serde_json::to_string(&limiter.stats())?);

    let failed = reports.iter().filter(|r| !r.ok).count();
    info!(total = reports.len(), failed = failed, "Pacer finished");
    Ok(failed == 0)
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, draining queued commands");
        }
        _ = terminate => {
            info!("Received SIGTERM, draining queued commands");
        }
    }
}
