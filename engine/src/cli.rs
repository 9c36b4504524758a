//! CLI interface for Waypoint
//!
//! This module provides the command-line interface using clap's derive
//! API. It defines all commands and global flags for driving the
//! geolocation engine.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Waypoint Geolocation Engine
///
/// An evidence-gated image geolocation agent: perception, hypothesis,
/// retrieval, and verification over a single image, producing a ranked
/// answer backed by an explicit evidence ledger.
#[derive(Parser, Debug)]
#[command(name = "waypoint")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Geolocate a single image
    Locate {
        /// Path to the image (JPEG, PNG, or WebP)
        image: PathBuf,

        /// Override the iteration budget
        #[arg(long)]
        iterations: Option<u32>,

        /// Override the confidence threshold
        #[arg(long)]
        threshold: Option<f64>,
    },

    /// Geolocate every image in a directory
    Batch {
        /// Directory containing images
        dir: PathBuf,

        /// Number of concurrent runs
        #[arg(short, long)]
        concurrency: Option<usize>,
    },

    /// Start the HTTP API server
    Serve {
        /// Bind address (default 127.0.0.1:8600)
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,
    },

    /// Check collaborator health
    Doctor,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Configuration management actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Print the configuration file path
    Path,

    /// Validate configuration file
    Validate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::parse_from(["waypoint", "doctor"]);
        assert!(matches!(cli.command, Command::Doctor));
        assert!(!cli.json);
        assert!(cli.log.is_none());
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::parse_from(["waypoint", "--json", "--log", "debug", "doctor"]);
        assert!(cli.json);
        assert_eq!(cli.log, Some("debug".to_string()));
    }

    #[test]
    fn test_locate_command() {
        let cli = Cli::parse_from(["waypoint", "locate", "photo.jpg", "--threshold", "0.9"]);
        if let Command::Locate {
            image,
            iterations,
            threshold,
        } = cli.command
        {
            assert_eq!(image, PathBuf::from("photo.jpg"));
            assert_eq!(iterations, None);
            assert_eq!(threshold, Some(0.9));
        } else {
            panic!("Expected Locate command");
        }
    }

    #[test]
    fn test_batch_command() {
        let cli = Cli::parse_from(["waypoint", "batch", "./photos", "--concurrency", "8"]);
        if let Command::Batch { dir, concurrency } = cli.command {
            assert_eq!(dir, PathBuf::from("./photos"));
            assert_eq!(concurrency, Some(8));
        } else {
            panic!("Expected Batch command");
        }
    }

    #[test]
    fn test_serve_command() {
        let cli = Cli::parse_from(["waypoint", "serve", "--bind", "0.0.0.0:9000"]);
        if let Command::Serve { bind } = cli.command {
            assert_eq!(bind, Some("0.0.0.0:9000".to_string()));
        } else {
            panic!("Expected Serve command");
        }
    }

    #[test]
    fn test_config_validate() {
        let cli = Cli::parse_from(["waypoint", "config", "validate"]);
        if let Command::Config { action } = cli.command {
            assert!(matches!(action, ConfigAction::Validate));
        } else {
            panic!("Expected Config command");
        }
    }
}
