//! sensor-fleet - Main Entry Point
//!
//! Runs the configured fleet for a fixed time, then shuts it down and prints
//! the shutdown report.

use anyhow::Context;
use sensor_fleet::{
    config::{FleetConfig, DEFAULT_CONFIG_FILE},
    Fleet,
};
use std::path::PathBuf;

fn main() -> anyhow::Result<()> {
    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let (config, fallback) = FleetConfig::load_or_sample(&path);
    let _guard = sensor_fleet::logging::init(&config.logging).context("initialising logging")?;
    if let Some(reason) = fallback {
        tracing::warn!("{}; using defaults", reason);
    }

    tracing::info!("Starting sensor fleet from {:?}", path);
    let fleet = Fleet::from_config(&config).context("starting fleet")?;

    tracing::info!("Running for {}s", config.run_for_secs);
    std::thread::sleep(config.run_for());

    let report = fleet.shutdown();
    println!("{}", report);

    if !report.is_clean() {
        anyhow::bail!("fleet did not shut down cleanly");
    }
    Ok(())
}
