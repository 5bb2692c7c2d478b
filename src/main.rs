//! podrelay: watches a podping drop directory and forwards each event over HTTP.

use clap::Parser;
use podrelay::config::Config;
use podrelay::error::{
    AddressParseSnafu, ConfigSnafu, MetricsSnafu, RelayError, RenderConfigSnafu,
};
use podrelay::logging::init_logging;
use podrelay::{Relay, metrics, signal};
use snafu::prelude::*;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Podping file-to-HTTP relay.
#[derive(Parser, Debug)]
#[command(name = "podrelay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file. Defaults plus environment
    /// overrides are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error). `RUST_LOG` takes precedence.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Validate configuration, print the effective settings and exit.
    #[arg(long)]
    dry_run: bool,
}

#[snafu::report]
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), RelayError> {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!("podrelay {} starting", env!("CARGO_PKG_VERSION"));

    let config = Config::load(args.config.as_deref()).context(ConfigSnafu)?;

    if args.dry_run {
        let rendered = serde_yaml::to_string(&config).context(RenderConfigSnafu)?;
        info!("Configuration is valid");
        println!("{rendered}");
        return Ok(());
    }

    let shutdown = CancellationToken::new();

    if config.metrics.enabled {
        let addr = config.metrics.address.parse().context(AddressParseSnafu {
            address: &config.metrics.address,
        })?;
        metrics::init(addr, shutdown.clone()).context(MetricsSnafu)?;
        debug!(
            "Metrics endpoint listening on http://{}/metrics",
            config.metrics.address
        );
    }

    signal::spawn_shutdown_handler(shutdown.clone());

    let state = Relay::from_config(config)?.run(shutdown).await?;

    info!(
        consecutive_failures = state.consecutive_failures,
        last_event_at = %state.last_event_at,
        "podrelay stopped"
    );
    Ok(())
}
