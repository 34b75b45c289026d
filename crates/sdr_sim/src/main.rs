mod api;
mod radio;

use anyhow::Result;
use api::Api;
use clap::Parser;
use radio::Radio;
use sdr_net::{DEFAULT_NATS_URL, subjects};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sdr_sim", about = "Simulated radio server over NATS")]
struct Args {
    /// NATS server URL
    #[arg(short, long, default_value = DEFAULT_NATS_URL)]
    nats_url: String,

    /// NATS subject prefix
    #[arg(short, long, default_value = subjects::DEFAULT_PREFIX)]
    prefix: String,

    /// Initial tuning in Hz
    #[arg(short, long, default_value_t = 98e6)]
    freq: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("sdr_sim=info".parse()?))
        .init();

    let args = Args::parse();

    info!(url = %args.nats_url, "connecting to NATS");
    let client = async_nats::connect(&args.nats_url).await?;
    info!(freq = args.freq, "connected to NATS");

    let mut api = Api::new(Radio::new(args.freq), client, args.prefix);
    api.run().await?;

    Ok(())
}
