//! slinkd - Straylight IRC services relayer.
//!
//! Links to several IRC networks over server-to-server protocols and
//! bridges channels between them with clone users and virtual subservers.

mod config;
mod error;
mod hooks;
mod ids;
mod modes;
mod network;
mod protocols;
mod relay;
mod services;
mod state;
mod world;

use std::path::Path;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::Config;
use crate::relay::Relay;
use crate::services::ServiceBot;
use crate::state::Network;
use crate::world::World;

/// Resolve the configuration path from CLI arguments.
/// Supports `-c <path>`, `--config <path>`, or a bare path.
/// Falls back to `slinkd.toml` when no argument is provided.
fn resolve_config_path() -> String {
    let mut args = std::env::args().skip(1);

    let raw_path = match args.next() {
        Some(flag) if flag == "-c" || flag == "--config" => args.next().unwrap_or_else(|| {
            eprintln!("Missing path after {}", flag);
            std::process::exit(1);
        }),
        Some(path) => path,
        None => "slinkd.toml".to_string(),
    };

    // Canonicalize to avoid relying on the current working directory during
    // rehash.
    match std::fs::canonicalize(Path::new(&raw_path)) {
        Ok(p) => p.to_string_lossy().into_owned(),
        Err(_) => raw_path,
    }
}

/// Spawn the connection task for one configured network.
fn launch_network(world: &Arc<World>, name: &str) {
    let net = Network::new(name, world.config());
    world.networks.insert(name.to_string(), net.clone());
    let world = world.clone();
    tokio::spawn(async move {
        network::run_network(world, net).await;
    });
}

/// Reload the config and reconcile the live network set: connect new
/// networks, disconnect removed ones, refresh serverdata everywhere else.
fn rehash(world: &Arc<World>, config_path: &str) {
    info!("rehashing configuration");
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "rehash failed; keeping old configuration");
            return;
        }
    };
    if let Err(errors) = config::validate(&config) {
        for err in &errors {
            error!(error = %err, "rehash validation failed");
        }
        return;
    }
    let config = Arc::new(config);
    world.set_config(config.clone());

    // Disconnect networks that were removed from the config.
    let existing: Vec<String> = world.networks.iter().map(|n| n.name.clone()).collect();
    for name in &existing {
        if !config.servers.contains_key(name) {
            info!(net = %name, "network removed from config; disconnecting");
            if let Some((_, net)) = world.networks.remove(name) {
                net.aborted.store(true, std::sync::atomic::Ordering::SeqCst);
                net.detach_sender();
            }
        }
    }
    // Connect new ones.
    for name in config.servers.keys() {
        if !world.networks.contains_key(name) {
            info!(net = %name, "new network in config; connecting");
            launch_network(world, name);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration first (before tracing, so we can use log.format).
    let config_path = resolve_config_path();

    let config = Config::load(&config_path).map_err(|e| {
        eprintln!("ERROR: Failed to load config from {}: {}", config_path, e);
        anyhow::anyhow!("{e}")
    })?;

    // Initialize tracing based on config.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match config.log.format {
        config::LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .json()
                .init();
        }
        config::LogFormat::Pretty => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .init();
        }
    }

    // Validate configuration.
    if let Err(errors) = config::validate(&config) {
        for err in &errors {
            error!(error = %err, "Configuration validation failed");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    info!(
        networks = config.servers.len(),
        nick = %config.bot.nick,
        "Starting slinkd"
    );

    let config = Arc::new(config);
    let world = World::new(config.clone());

    // Core subsystems: service bots first, then the relay (so service
    // spawns happen before relay channel initialisation on ENDBURST).
    world.services.register(ServiceBot::new("main", true));
    services::register_hooks(&world);
    let relay = Relay::start(&world, &config.relay.db_path);

    for name in config.servers.keys() {
        launch_network(&world, name);
    }

    // Signal handling: TERM/INT shut down, HUP/USR1 rehash.
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;
    let mut sigusr1 = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received; shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received; shutting down");
                break;
            }
            _ = sighup.recv() => rehash(&world, &config_path),
            _ = sigusr1.recv() => rehash(&world, &config_path),
        }
        if world.is_shutting_down() {
            // A fatal error (e.g. ID exhaustion) initiated shutdown.
            break;
        }
    }

    // Graceful teardown: tell every link to close, persist the link DB.
    world.begin_shutdown();
    for net in world.all_networks() {
        net.aborted.store(true, std::sync::atomic::Ordering::SeqCst);
        if let Some(uid) = net.pseudoclient.read().clone() {
            let _ = net.protocol.quit(&net, &uid, "Shutting down.");
        }
    }
    relay.save_db();
    // Give the writer tasks a moment to flush the goodbye lines.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    if world.is_shutting_down() {
        info!("shutdown complete");
    } else {
        warn!("shutdown raced with live connections; exiting anyway");
    }

    Ok(())
}
