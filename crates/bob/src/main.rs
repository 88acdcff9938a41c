//! # bob
//!
//! Runs the broker, or a demo worker that exposes Hearing over a synthetic
//! tone.

#![deny(unsafe_code)]

mod logging;

use std::path::PathBuf;

use anyhow::{Context, Result};
use bob_brain::{Brain, Hearing, HearingConfig, SineReader, broker_url};
use bob_core::protocol::Interface;
use bob_server::Bob;
use bob_settings::BobSettings;
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Control-plane broker for worker brains.
#[derive(Parser, Debug)]
#[command(name = "bob", version, about = "Control-plane broker for worker brains")]
struct Cli {
    /// Settings file (defaults to `~/.bob/settings.json`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the broker.
    Serve,
    /// Run a demo worker whose Hearing ability samples a sine tone.
    Brain {
        /// Worker display name.
        #[arg(long, default_value = "Hearing Brain")]
        name: String,

        /// Broker worker socket (defaults to the configured brains address).
        #[arg(long)]
        url: Option<String>,

        /// Tone frequency in Hz.
        #[arg(long, default_value_t = 440.0)]
        frequency: f64,
    },
}

fn load(config: Option<PathBuf>) -> Result<BobSettings> {
    let path = config.unwrap_or_else(bob_settings::settings_path);
    bob_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))
}

async fn serve(settings: BobSettings) -> Result<()> {
    info!(resources = %settings.resources_directory, "starting broker");
    let bob = Bob::new(settings);
    let listening = bob.listen().await.context("Failed to start listeners")?;
    let token = bob.shutdown().token();

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for ctrl-c")?;
            info!("Shutting down...");
            bob.close();
        }
        () = token.cancelled() => {}
    }

    listening.wait().await.context("Broker stopped with error")
}

async fn brain(settings: BobSettings, name: String, url: Option<String>, frequency: f64) -> Result<()> {
    let url = url.unwrap_or_else(|| broker_url(&settings.brains.addr()));
    let config = HearingConfig::from(&settings.hearing);
    let reader = SineReader::new(config.sample_rate, frequency, config.significant_bits);
    let interface = Interface::new("hearing")
        .with_metadata("sampleRate", json!(config.sample_rate))
        .with_metadata("significantBits", json!(config.significant_bits));

    let brain = Brain::new(name)
        .with_keepalive(&settings.websocket)
        .with_ability(Hearing::new(reader, config))
        .with_interface(interface);

    let cancel = CancellationToken::new();
    let stop = cancel.clone();
    let _signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down...");
            stop.cancel();
        }
    });

    info!(worker = brain.name(), url = %url, "connecting to broker");
    brain
        .run(&url, cancel)
        .await
        .with_context(|| format!("Worker {} failed", brain.name()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load(cli.config)?;
    logging::init(&settings.logging);

    match cli.command {
        Command::Serve => serve(settings).await,
        Command::Brain {
            name,
            url,
            frequency,
        } => brain(settings, name, url, frequency).await,
    }
}
