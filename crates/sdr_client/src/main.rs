//! # sdr_client
//!
//! Connects to a radio server over NATS, mirrors its state and keeps the
//! session alive across outages. Status changes and device discovery are
//! logged; Ctrl-C closes the session and saves preferences.

use std::path::PathBuf;
use std::rc::Rc;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use sdr_cell::{
    Context, DEFAULT_MAX_ROUNDS, JsonFileStorage, MemoryStorage, Scheduler, Storage,
    StorageNamespace,
};
use sdr_client::{Client, ClientConfig, FailureReporting, StatusReport};
use sdr_net::{BackoffPolicy, NatsTransport, subjects};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Parser, Debug)]
#[command(name = "sdr_client", about = "Remote control client for a software-defined radio")]
struct Args {
    /// NATS server URL (defaults to `NATS_URL` or localhost)
    #[arg(long)]
    nats_url: Option<String>,

    /// Subject prefix of the radio server
    #[arg(long, default_value = subjects::DEFAULT_PREFIX)]
    prefix: String,

    /// Reconnection delay policy
    #[arg(long, value_enum, default_value_t = BackoffKind::Exponential)]
    backoff: BackoffKind,

    /// Fixed delay, or the first exponential delay, in milliseconds
    #[arg(long, default_value_t = 500)]
    retry_ms: u64,

    /// Ceiling for exponential delays, in milliseconds
    #[arg(long, default_value_t = 30_000)]
    max_retry_ms: u64,

    /// When repeated connection failures are reported again
    #[arg(long, value_enum, default_value_t = FailureReporting::FirstOnly)]
    failure_reporting: FailureReporting,

    /// Apply actions locally before the server confirms them
    #[arg(long)]
    optimistic: bool,

    /// JSON file for user preferences
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Round cap for one scheduler flush
    #[arg(long, default_value_t = DEFAULT_MAX_ROUNDS)]
    max_rounds: usize,
}

impl Args {
    fn config(&self) -> ClientConfig {
        let backoff = match self.backoff {
            BackoffKind::Fixed => BackoffPolicy::Fixed {
                delay_ms: self.retry_ms,
            },
            BackoffKind::Exponential => BackoffPolicy::Exponential {
                base_ms: self.retry_ms,
                max_ms: self.max_retry_ms,
            },
        };
        let mut config = ClientConfig::new(&self.prefix)
            .with_backoff(backoff)
            .with_failure_reporting(self.failure_reporting)
            .with_optimistic(self.optimistic)
            .with_max_rounds(self.max_rounds);
        if let Some(url) = &self.nats_url {
            config = config.with_nats_url(url);
        }
        if let Some(path) = &self.state_file {
            config = config.with_state_file(path);
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("sdr_client=info".parse()?))
        .init();

    let config = Args::parse().config();
    let url = config.resolved_nats_url();
    info!(%url, prefix = %config.prefix, "radio client starting");

    let backend: Rc<dyn Storage> = match &config.state_file {
        Some(path) => Rc::new(JsonFileStorage::open(path)?),
        None => Rc::new(MemoryStorage::default()),
    };
    let ctx = Context::new(
        Scheduler::new(config.max_rounds),
        StorageNamespace::new(backend, config.storage_prefix()),
    );

    let transport = NatsTransport::new(url, config.prefix.clone());
    let client = Client::new(ctx, transport, &config)?;

    let mut reports = client.subscribe_reports();
    tokio::spawn(async move {
        while let Ok(report) = reports.recv().await {
            if let StatusReport::FailedConnect { reason } = report {
                info!(%reason, "server unreachable, retrying in the background");
            }
        }
    });

    client
        .run(async {
            // If the signal handler cannot be installed, run until killed.
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!("radio client shut down");
    Ok(())
}
