// Nearchat daemon: relay client, WebRTC backend and stdin console around nearchat-core.

mod config;
mod console;
mod geolocate;
mod identity_store;
mod node;
mod relay;
mod rest;
mod rtc;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nearchat_core::{MeshCore, Profile, ProfileLite};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::geolocate::Locator;
use crate::node::{Input, Node};
use crate::rest::RestClient;
use crate::rtc::RtcBackend;

/// How long the RTC backend gets to close peer connections on exit.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "nearchat", version, about = "Chat with people nearby over encrypted peer links")]
struct Cli {
    /// Config file (default: ~/.config/nearchat/config.toml, then /etc/nearchat/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Display name, overrides config and NEARCHAT_NAME
    #[arg(short, long)]
    name: Option<String>,

    /// Discovery radius in kilometers
    #[arg(short, long)]
    radius: Option<f64>,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the mesh (default)
    Run,
    /// Print this node's id and public key, creating the identity if needed
    Identity,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut cfg = config::load(cli.config.as_deref());
    if let Some(name) = cli.name {
        cfg.name = name;
    }
    if let Some(radius) = cli.radius {
        cfg.radius_km = radius;
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Identity => {
            let identity = identity_store::load_or_create(&cfg.identity_path())?;
            println!("id         {}", identity.id());
            println!("public key {}", identity.public_key().to_base64());
            Ok(())
        }
        Commands::Run => {
            // MeshCore is single-owner state; one thread drives the loop and every I/O task.
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("building runtime")?;
            rt.block_on(run(cfg))
        }
    }
}

fn local_profile(cfg: &Config) -> Result<Profile> {
    let avatar_thumb = match &cfg.avatar {
        Some(path) => Some(
            std::fs::read(path).with_context(|| format!("reading avatar {}", path.display()))?,
        ),
        None => None,
    };
    Ok(Profile {
        lite: ProfileLite {
            name: cfg.name.clone(),
            age: cfg.age,
            gender: cfg.gender.clone(),
            avatar_version: u32::from(avatar_thumb.is_some()),
        },
        avatar_thumb,
    })
}

async fn run(cfg: Config) -> Result<()> {
    let identity = identity_store::load_or_create(&cfg.identity_path())?;
    info!(id = %identity.id(), relay = %cfg.relay_url, "starting");
    let core = MeshCore::new(identity, local_profile(&cfg)?, cfg.mesh.clone());

    let (inputs, input_rx) = tokio::sync::mpsc::unbounded_channel();
    let (relay_tx, relay_rx) = tokio::sync::mpsc::unbounded_channel();
    let (rtc_tx, rtc_rx) = tokio::sync::mpsc::unbounded_channel();

    let rest = RestClient::new(cfg.credential_url.clone(), cfg.geo_url.clone())?;
    let locator = Locator::new(Arc::new(rest.clone()), cfg.position.clone(), cfg.location_cache_path());
    let backend = RtcBackend::new(cfg.ice_urls.clone(), cfg.mesh.buffered_low_water, inputs.clone())?;

    let backend_task = tokio::spawn(backend.run(rtc_rx));
    tokio::spawn(relay::run(cfg.relay_url.clone(), relay_rx, inputs.clone()));
    tokio::spawn(console::run(inputs.clone()));
    let stop = inputs.clone();
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            warn!(error = %e, "signal handler failed");
        }
        let _ = stop.send(Input::Shutdown);
    });

    println!("{}", console::HELP);
    let node = Node::new(
        core,
        inputs,
        relay_tx,
        rtc_tx,
        rest,
        locator,
        cfg.radius_km,
        cfg.download_dir(),
    );
    node.run(input_rx).await;

    if tokio::time::timeout(CLOSE_GRACE, backend_task).await.is_err() {
        warn!("rtc backend did not close in time");
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
