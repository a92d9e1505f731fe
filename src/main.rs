use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tiergate::config::{AppConfig, LoggingConfig};
use tiergate::LimiterError;

/// Admission checks against tiered rate limits.
#[derive(Debug, Parser)]
#[command(name = "tiergate", version, about)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, env = "TIERGATE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Try to admit one request for the given identities
    Acquire {
        /// Identity to meter; repeat for a joint admission
        #[arg(short, long = "identity", required = true)]
        identities: Vec<String>,

        /// Wait out rejections instead of failing
        #[arg(long)]
        delay: bool,

        /// Longest single wait in seconds when delaying
        #[arg(long, requires = "delay")]
        max_delay: Option<f64>,
    },
    /// Print the number of timestamps held for an identity
    Volume { identity: String },
    /// Clear the buckets of the given identities
    Flush {
        #[arg(required = true)]
        identities: Vec<String>,
    },
    /// Validate configuration and print the resolved tiers
    CheckConfig,
}

const EXIT_REJECTED: u8 = 2;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref())?;
    init_tracing(&config.logging);

    info!(version = env!("CARGO_PKG_VERSION"), backend = ?config.store.backend, "Starting tiergate");
    match &config.source {
        Some(path) => info!(path = %path.display(), "Loaded configuration file"),
        None => info!("No configuration file, using defaults and environment"),
    }

    if !matches!(cli.command, Command::CheckConfig) && !config.store.backend.is_shared() {
        warn!(
            "The memory backend keeps no history between runs; \
             set store.backend to redis for limits that span invocations"
        );
    }

    match cli.command {
        Command::CheckConfig => {
            for tier in config.tiers()? {
                println!("{}", tier);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Acquire {
            identities,
            delay,
            max_delay,
        } => {
            if delay {
                config.limiter.delay = true;
                config.limiter.max_delay_secs = max_delay.or(config.limiter.max_delay_secs);
                config.validate()?;
            }

            let limiter = config.build_limiter().await?;
            let guard = config.guard(&limiter, &identities);

            match guard.acquire().await {
                Ok(()) => {
                    info!(identities = ?guard.identities(), "Admitted");
                    Ok(ExitCode::SUCCESS)
                }
                Err(LimiterError::TooManyRequests(rejection)) => {
                    println!("{}", serde_json::to_string(&rejection.report())?);
                    Ok(ExitCode::from(EXIT_REJECTED))
                }
                Err(err) => Err(err.into()),
            }
        }
        Command::Volume { identity } => {
            let limiter = config.build_limiter().await?;
            println!("{}", limiter.current_volume(&identity).await?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Flush { identities } => {
            let limiter = config.build_limiter().await?;
            let mut flushed = 0usize;
            for identity in &identities {
                limiter.flush(identity).await?;
                flushed += 1;
            }
            info!(count = flushed, "Flushed buckets");
            println!("{}", flushed);
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Install the global subscriber; `RUST_LOG` overrides the configured level.
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
        builder.with_thread_ids(true).init();
    }
}
