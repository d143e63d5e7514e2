use anyhow::{Context, Result};
use clap::Parser;
use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use age_infer::{workflow, Config, Runtime};

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")
}

fn main() -> Result<()> {
    let config = Config::parse();
    setup_logging(config.verbose)?;

    let num_chains = usize::try_from(config.num_chains).context("Too many chains")?;
    let runtime = Runtime::new(config.device, num_chains)?;
    workflow::run(&config, &runtime)
}
