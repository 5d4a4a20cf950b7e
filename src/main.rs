use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use ratekeeper::backends::Backends;
use ratekeeper::config::RatekeeperConfig;
use ratekeeper::lock::DistributedLock;
use ratekeeper::provider::{ApiManager, ProviderContext, ProviderRegistry};
use ratekeeper::ratelimit::{RateLimiter, RateLimiterOptions};

/// Ratekeeper: shared quota enforcement for external APIs
#[derive(Parser, Debug)]
#[command(name = "ratekeeper")]
#[command(version)]
#[command(about = "Distributed rate limiting, locking and batched fetching", long_about = None)]
struct Args {
    /// YAML configuration file; RATEKEEPER__* variables override it
    #[arg(short, long)]
    config: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print per-window usage of a resource as JSON
    Usage {
        /// Resource (provider) name
        resource: String,
    },
    /// Run a provider method and print its JSON result
    Fetch {
        /// Provider name, e.g. coingecko
        provider: String,
        /// Method name, e.g. get_prices
        method: String,
        /// Comma-separated ids passed as the `ids` parameter
        #[arg(long, value_delimiter = ',')]
        ids: Vec<String>,
        /// Save provider state under the provider's distributed lock
        #[arg(long)]
        sync_lock: bool,
    },
    /// Acquire a distributed lock, hold it, and release it
    Lock {
        /// Lock name
        name: String,
        /// Lease in seconds (defaults to the configured lease)
        #[arg(long)]
        lease: Option<u64>,
        /// Give up after this many seconds (defaults to the configured timeout)
        #[arg(long)]
        timeout: Option<u64>,
        /// Seconds to hold the lock before releasing it
        #[arg(long, default_value_t = 0)]
        hold: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Ratekeeper");

    let config = RatekeeperConfig::load(args.config.as_deref())
        .context("failed to load configuration")?;
    let backends = Backends::from_config(&config).context("failed to initialize backends")?;

    tokio::select! {
        result = run(args.command, config, backends) => result?,
        _ = shutdown_signal() => {
            info!("Command interrupted");
        }
    }

    Ok(())
}

fn init_tracing(args: &Args) {
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true);

    if args.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(command: Commands, config: RatekeeperConfig, backends: Backends) -> Result<()> {
    match command {
        Commands::Usage { resource } => {
            let options = RateLimiterOptions {
                sync_interval: config.rate_limiting.sync_interval,
                sync_queue_capacity: config.rate_limiting.sync_queue_capacity,
            };
            let limiter = RateLimiter::new(resource.as_str(), backends, options)
                .await
                .with_context(|| format!("failed to open rate limiter for {resource}"))?;

            let usage = limiter.get_usage().await?;
            let total = limiter.total_requests().await?;
            let report = json!({ "resource": resource, "windows": usage, "total_requests": total });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Fetch {
            provider,
            method,
            ids,
            sync_lock,
        } => {
            let context = ProviderContext::new(backends, config.clone());
            let registry = ProviderRegistry::with_defaults();

            let mut manager = ApiManager::new(&registry, &provider, context.clone())
                .await
                .with_context(|| format!("failed to create provider {provider}"))?;
            if sync_lock {
                manager = manager.with_sync_lock(&context, &config.lock);
            }

            let result = manager.execute(&method, json!({ "ids": ids })).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Lock {
            name,
            lease,
            timeout,
            hold,
        } => {
            let lock = DistributedLock::new(name.as_str(), backends.counters.clone())
                .with_poll_interval(config.lock.poll_interval());
            let lease = lease.map(Duration::from_secs).unwrap_or(config.lock.lease());
            let timeout = timeout.map(Duration::from_secs).or(config.lock.timeout());

            let ((), released) = lock
                .scope_with_release(lease, timeout, async {
                    info!(lock = %name, hold_secs = hold, "Holding lock");
                    tokio::time::sleep(Duration::from_secs(hold)).await;
                })
                .await?;
            println!("{}", json!({ "lock": name, "owner": lock.token(), "released": released }));
        }
    }

    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
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
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
