// Waypoint Geolocation Engine
// Main entry point for the waypoint binary

use clap::Parser;
use waypoint_engine::cli::{Cli, Command, ConfigAction};
use waypoint_engine::config::Config;
use waypoint_engine::handlers::{
    handle_batch, handle_config_path, handle_config_show, handle_config_validate, handle_doctor,
    handle_locate, OutputFormat,
};
use waypoint_engine::server;
use waypoint_engine::telemetry::{init_telemetry, init_telemetry_with_level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize basic telemetry first (before config is loaded)
    init_telemetry();

    // Load configuration (or use custom path if provided)
    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // Re-initialize telemetry with CLI/config-driven log level
    // (only takes effect if RUST_LOG env var is not set)
    let log_level = cli.log.as_deref().unwrap_or(&config.core.log_level);
    init_telemetry_with_level(log_level);

    // Determine output format
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    match cli.command {
        Command::Locate {
            image,
            iterations,
            threshold,
        } => handle_locate(&config, &image, iterations, threshold, format).await,

        Command::Batch { dir, concurrency } => {
            handle_batch(&config, &dir, concurrency, format).await
        }

        Command::Serve { bind } => server::serve(&config, bind).await,

        Command::Doctor => handle_doctor(&config, format).await,

        Command::Config { action } => match action {
            ConfigAction::Show => handle_config_show(&config, format),
            ConfigAction::Path => handle_config_path(),
            ConfigAction::Validate => handle_config_validate(&config),
        },
    }
}
