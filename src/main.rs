use std::env;

use ctc_loss::{bench::run, error::Result, parse_config::BenchConfig};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let path = env::args()
        .nth(1)
        .unwrap_or_else(|| "configs/bench.yaml".to_string());
    let config = BenchConfig::from_yaml(&path)?;
    let report = run(&config)?;

    tracing::info!(
        loc = ?report.loc,
        mean_elapsed_ms = report.mean_elapsed_ms,
        "benchmark finished"
    );

    Ok(())
}
