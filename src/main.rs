/*!
 * Storm AQI service
 *
 * Loads the configuration, connects to the search store, makes sure the
 * AQI indices exist and keeps the store service running until Ctrl-C.
 */

use chrono::Datelike;
use clap::Parser;
use serde_json::json;
use std::path::PathBuf;
use storm_aqi::error::{EXIT_FATAL, EXIT_SUCCESS};
use storm_aqi::{config::AppConfig, elastic, logging, LogLevel, Result};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "storm-aqi")]
#[command(version, about = "AQI monitoring service backed by a search store", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short = 'c', long = "config", value_name = "PATH", default_value = "conf/conf.toml")]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long = "log-level", value_enum)]
    log_level: Option<LogLevel>,
}

fn main() {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {}", e);
            std::process::exit(EXIT_FATAL);
        }
    };

    let code = match runtime.block_on(run(cli)) {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = if cli.config.exists() {
        AppConfig::from_file(&cli.config)?
    } else {
        AppConfig::default()
    };
    config.apply_env_overrides();
    if let Some(level) = cli.log_level {
        config.log.level = level;
    }
    config.validate()?;

    logging::init_logging(&config.log)?;
    if !cli.config.exists() {
        info!(path = %cli.config.display(), "Config file not found, using defaults");
    }

    let service = elastic::connect(&config).await?;

    if service.is_reachable() {
        let year = chrono::Local::now().year().to_string();
        let indices = [
            (config.aqi.station_index.as_str(), ""),
            (config.aqi.realtime_index.as_str(), ""),
            (config.aqi.his_index.as_str(), year.as_str()),
        ];
        for (template, suffix) in indices {
            if let Err(e) = service.create_index(template, json!({}), suffix).await {
                error!(index = template, "❌ Failed to prepare index: {}", e);
            }
        }
    }

    info!(
        port = config.http_port,
        version = storm_aqi::VERSION,
        "🚀 Storm AQI service running"
    );

    let signal = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
    service.close().await;
    signal?;
    Ok(())
}
