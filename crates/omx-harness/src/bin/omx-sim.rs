//! OMX connection service simulator.
//!
//! # Usage
//!
//! ```bash
//! # Exchange 16 payloads, then crash and recover the remote processor
//! omx-sim
//!
//! # Longer run without the crash, with a fixed seed and debug logs
//! omx-sim --messages 200 --no-crash --seed 42 --log-level debug
//! ```

use clap::Parser;
use omx_harness::{ScenarioConfig, scenario};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// OMX connection service simulator
#[derive(Parser, Debug)]
#[command(name = "omx-sim")]
#[command(about = "Drive an OMX session over a loopback remote processor")]
#[command(version)]
struct Args {
    /// Service name advertised by the remote processor
    #[arg(short, long, default_value = "rpmsg-omx1")]
    service: String,

    /// Component to connect to
    #[arg(short, long, default_value = "OMX.TI.DUCATI1.VIDEO.H264D")]
    component: String,

    /// Payloads to exchange before the crash
    #[arg(short, long, default_value = "16")]
    messages: usize,

    /// Skip the crash and recovery phase
    #[arg(long)]
    no_crash: bool,

    /// Seed for payload generation
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("OMX simulator starting");
    tracing::info!("Service {} component {}", args.service, args.component);

    let config = ScenarioConfig {
        service: args.service,
        component: args.component,
        messages: args.messages,
        crash: !args.no_crash,
        seed: args.seed,
    };

    let report = scenario::run(&config).await?;

    tracing::info!(
        echoed = report.echoed,
        failed_by_crash = report.failed_by_crash,
        recovered = report.recovered,
        "simulation finished"
    );

    Ok(())
}
