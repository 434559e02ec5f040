use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::TollgateConfig;
use tollgate::ratelimit::RateLimiter;

/// Drive the admission limiter with a burst of requests.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Args {
    /// YAML configuration file; TOLLGATE_* environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Request path to admit
    #[arg(short, long, default_value = "/hello")]
    path: String,

    /// Number of requests to send
    #[arg(short = 'n', long, default_value_t = 150)]
    requests: usize,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    if args.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Starting Tollgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = TollgateConfig::load(args.config.as_deref())?;
    info!(
        backend_host = %config.backend.host,
        backend_port = config.backend.port,
        capacity = config.bucket.capacity,
        local_limit = config.fallback.limit,
        "Configuration loaded"
    );

    let limiter = Arc::new(RateLimiter::from_config(&config)?);

    tokio::select! {
        _ = drive(limiter.clone(), &args.path, args.requests) => {}
        _ = shutdown_signal() => {
            warn!("Interrupted before all requests were sent");
        }
    }

    limiter.shutdown().await;
    info!("Tollgate stopped");
    Ok(())
}

/// Send `requests` admissions for `path` and log a summary.
async fn drive(limiter: Arc<RateLimiter>, path: &str, requests: usize) {
    let mut tally: BTreeMap<String, usize> = BTreeMap::new();
    let mut admitted = 0usize;
    let mut first_denial = None;

    for _ in 0..requests {
        let decision = limiter.admit(path).await;
        *tally.entry(decision.reason.to_string()).or_default() += 1;
        if decision.allowed {
            admitted += 1;
        }

        if first_denial.is_none() {
            first_denial = decision.rejection();
        }
    }

    info!(
        path = %path,
        requests = requests,
        admitted = admitted,
        denied = requests - admitted,
        by_reason = ?tally,
        "Finished sending requests"
    );

    if let Some(body) = first_denial {
        match serde_json::to_string(&body) {
            Ok(json) => println!("429 Too Many Requests {}", json),
            Err(e) => warn!(error = %e, "Failed to render rejection body"),
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
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
