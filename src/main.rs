use std::path::PathBuf;
use anyhow::Result;
use clap::Parser;

use daqroc_runner_lib::config::RunnerConfig;

#[derive(Parser)]
#[command(name = "daqroc-runner")]
#[command(about = "Single-worker test queue and serial bridge for the DAQROC test bench", long_about = None)]
struct Cli {
    /// TOML configuration file; DAQROC_* environment variables override it
    #[arg(long, default_value = "daqroc.toml")]
    config: PathBuf,

    /// Force hardware mode regardless of configuration
    #[arg(long)]
    hardware: bool,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = RunnerConfig::load_from(&cli.config)?;
    if cli.hardware {
        config.use_hardware = true;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
        config.validate()?;
    }

    daqroc_runner_lib::logging::init(&config.log_level);
    log::debug!("Configuration: {:?}", config);

    daqroc_runner_lib::run(config).await
}
