use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Parser, Subcommand};
use ingest_core::{
    ApiKey, CityOutcome, Config, CsvStore, GapFillEngine, RunReport, TimeSeriesStore,
    provider::provider_from_config, store::format_timestamp,
};
use inquire::{Password, PasswordDisplayMode};

/// Top-level CLI struct.
#[derive(Debug, Parser)]
#[command(name = "weather-ingest", version, about = "Hourly weather ingester")]
pub struct Cli {
    /// Config file; defaults to the platform config directory.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace). `RUST_LOG` takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fetch and store the last complete hour for every configured city.
    Run,

    /// Show how far each city's time series reaches.
    Status,

    /// Store an OpenWeather API key in the config file.
    Configure,
}

impl Cli {
    pub async fn run(self) -> anyhow::Result<()> {
        let config_path = match &self.config {
            Some(path) => path.clone(),
            None => Config::config_file_path()?,
        };
        let config = Config::load_from(&config_path)?;
        tracing::debug!(path = %config_path.display(), cities = config.cities.len(), "Loaded configuration");

        match self.command {
            Command::Run => ingest(&config).await,
            Command::Status => status(&config).await,
            Command::Configure => configure(config, &config_path),
        }
    }
}

async fn ingest(config: &Config) -> anyhow::Result<()> {
    // Fatal before any city is touched.
    let api_key = ApiKey::resolve(config)?;

    let provider = Arc::new(
        provider_from_config(config, api_key).context("Failed to set up OpenWeather client")?,
    );
    let store = Arc::new(CsvStore::new(&config.data_dir));
    let engine = GapFillEngine::new(provider.clone(), provider, store)
        .with_store_timeout(config.store_timeout());

    let report = engine.run(&config.cities).await;
    print_report(&report);
    Ok(())
}

fn print_report(report: &RunReport) {
    println!("Target hour: {}", format_timestamp(report.target_hour));
    for entry in &report.cities {
        let detail = match &entry.outcome {
            CityOutcome::Appended(r) => format!("{:.1}°C, {:.0}%", r.temperature_c, r.humidity_pct),
            CityOutcome::Skipped { latest } => format!("latest {}", format_timestamp(*latest)),
            CityOutcome::Failed(e) => e.to_string(),
        };
        println!("  {:<16} {:<9} {}", entry.city, entry.outcome.label(), detail);
    }
    println!(
        "{} appended, {} skipped, {} pending, {} failed",
        report.appended(),
        report.skipped(),
        report.pending(),
        report.failed(),
    );
}

async fn status(config: &Config) -> anyhow::Result<()> {
    let store = CsvStore::new(&config.data_dir);
    println!("Data directory: {}", store.data_dir().display());

    for city in &config.cities {
        match store.read_all(city).await {
            Ok(readings) => {
                let latest = readings
                    .last()
                    .map(|r| format_timestamp(r.timestamp))
                    .unwrap_or_else(|| "-".to_string());
                println!("  {:<16} {:>6} rows  latest {}", city.name, readings.len(), latest);
            }
            Err(e) => println!("  {:<16} error: {e}", city.name),
        }
    }

    Ok(())
}

fn configure(mut config: Config, path: &std::path::Path) -> anyhow::Result<()> {
    let api_key = Password::new("OpenWeather API key:")
        .with_display_mode(PasswordDisplayMode::Masked)
        .without_confirmation()
        .prompt()
        .context("Failed to read API key")?;

    if api_key.trim().is_empty() {
        anyhow::bail!("API key must not be empty.");
    }

    config.set_api_key(api_key.trim().to_string());
    config.save_to(path)?;
    println!("Saved API key to {}", path.display());
    Ok(())
}
