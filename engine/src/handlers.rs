//! Command handlers
//!
//! Implements the CLI commands on top of the orchestrator. Output is
//! either human-readable text or the raw result document as JSON —
//! the JSON form is the same record the HTTP surface returns.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use sdk::errors::WaypointErrorExt;
use sdk::state::RunState;

use crate::config::Config;
use crate::orchestrator::Orchestrator;

/// Output format for command results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Geolocate a single image and print the result.
pub async fn handle_locate(
    config: &Config,
    image: &Path,
    iterations: Option<u32>,
    threshold: Option<f64>,
    format: OutputFormat,
) -> Result<()> {
    let mut config = config.clone();
    if let Some(iterations) = iterations {
        config.agent.max_iterations = iterations;
    }
    if let Some(threshold) = threshold {
        config.agent.confidence_threshold = threshold;
    }
    config
        .validate()
        .context("Invalid command-line overrides")?;

    let orchestrator = Orchestrator::from_config(&config);
    let state = orchestrator
        .run(image)
        .await
        .map_err(|e| anyhow::anyhow!("{e} (hint: {})", e.user_hint()))?;

    print_run(&state, format)?;
    Ok(())
}

/// Geolocate every image in a directory.
pub async fn handle_batch(
    config: &Config,
    dir: &Path,
    concurrency: Option<usize>,
    format: OutputFormat,
) -> Result<()> {
    let paths = collect_images(dir)?;
    if paths.is_empty() {
        anyhow::bail!("No images found in {}", dir.display());
    }
    tracing::info!("Batch: {} images from {}", paths.len(), dir.display());

    let orchestrator = Orchestrator::from_config(config);
    let concurrency = concurrency.unwrap_or(config.agent.batch_concurrency);
    let results = orchestrator.run_batch(paths, concurrency).await;

    let mut failures = 0usize;
    for (path, result) in &results {
        match result {
            Ok(state) => {
                if format == OutputFormat::Text {
                    println!("=== {} ===", path.display());
                }
                print_run(state, format)?;
            }
            Err(e) => {
                failures += 1;
                eprintln!("{}: {e}", path.display());
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures}/{} runs failed", results.len());
    }
    Ok(())
}

/// Probe collaborator health.
pub async fn handle_doctor(config: &Config, format: OutputFormat) -> Result<()> {
    let orchestrator = Orchestrator::from_config(config);
    let report = orchestrator.check_health().await;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => {
            println!("Vision collaborator:");
            for (name, healthy) in &report.vision {
                println!("  {:12} {}", name, status(*healthy));
            }
            println!("Chat collaborators:");
            for (name, healthy) in &report.llm {
                println!("  {:12} {}", name, status(*healthy));
            }
            match report.retriever {
                Some(healthy) => println!("Retrieval endpoint: {}", status(healthy)),
                None => println!("Retrieval endpoint: not configured (symbolic-only)"),
            }
        }
    }
    Ok(())
}

/// Show configuration.
pub fn handle_config_show(config: &Config, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(config)?),
        OutputFormat::Text => println!("{}", toml::to_string_pretty(config)?),
    }
    Ok(())
}

/// Print the config file path.
pub fn handle_config_path() -> Result<()> {
    println!("{}", Config::default_path()?.display());
    Ok(())
}

/// Validate the configuration file.
pub fn handle_config_validate(config: &Config) -> Result<()> {
    config.validate()?;
    println!("Configuration is valid.");
    Ok(())
}

fn status(healthy: bool) -> &'static str {
    if healthy {
        "available"
    } else {
        "unavailable"
    }
}

/// Print one run's result document.
fn print_run(state: &RunState, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            // The full state, un-transformed: clues, hypotheses,
            // candidates, evidence ledger, prediction
            println!("{}", serde_json::to_string_pretty(state)?);
        }
        OutputFormat::Text => {
            let Some(prediction) = &state.prediction else {
                println!("(no prediction)");
                return Ok(());
            };
            println!("Prediction: {}", prediction.name);
            println!("  Coordinates: {:.5}, {:.5}", prediction.lat, prediction.lon);
            println!("  Confidence:  {:.2}", prediction.confidence);
            println!("  Converged:   {}", prediction.converged);
            println!("  Reasoning:   {}", prediction.reasoning);
            if !prediction.supporting_evidence.is_empty() {
                println!("  Supporting evidence:");
                for evidence in &prediction.supporting_evidence {
                    println!("    [{}] {}", evidence.check, evidence.detail);
                }
            }
            if !prediction.excluded.is_empty() {
                println!("  Excluded:");
                for reason in &prediction.excluded {
                    println!("    {reason}");
                }
            }
            if !prediction.alternatives.is_empty() {
                println!("  Alternatives:");
                for alt in &prediction.alternatives {
                    println!(
                        "    {} ({:.5}, {:.5}) score {:.2}",
                        alt.name, alt.lat, alt.lon, alt.fused_score
                    );
                }
            }
        }
    }
    Ok(())
}

/// Image files directly inside `dir` (no recursion), sorted.
fn collect_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory {}", dir.display()))?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| {
                    matches!(
                        ext.to_ascii_lowercase().as_str(),
                        "jpg" | "jpeg" | "png" | "webp"
                    )
                })
                .unwrap_or(false)
        })
        .collect();
    paths.sort();
    Ok(paths)
}
