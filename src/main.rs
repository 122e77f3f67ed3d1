//! riftcast Agent
//!
//! Watches the local League of Legends client and drives OBS Studio over
//! obs-websocket to record each match automatically: recording starts at
//! champion select, stops when the game ends, and aborts on a dodge.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use riftcast_agent::config::Config;
use riftcast_agent::credentials::CredentialMonitor;
use riftcast_agent::lcu::LcuClient;
use riftcast_agent::obs::ObsClient;
use riftcast_agent::tracker::GameTracker;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("riftcast Agent starting...");

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    // Load configuration
    let config = Config::load()?;
    info!("Configuration loaded from {:?}", config.config_path()?);

    // Wire up the components: credential discovery feeds the LCU client,
    // and the tracker sits between the LCU event bus and OBS.
    let monitor = CredentialMonitor::new(&config.lcu)?;
    let lcu = LcuClient::new(monitor.credentials())?;
    let obs = ObsClient::new(&config.obs);
    let tracker = GameTracker::new(
        lcu.clone(),
        Arc::new(obs.clone()),
        &config.recording.profile,
    );

    monitor.add_connection_callback(Arc::new(|connected| {
        if connected {
            info!("League client detected");
        } else {
            info!("League client is no longer running");
        }
    }));
    lcu.add_connection_callback(Arc::new(|connected| {
        if connected {
            info!("LCU event bus connected");
        } else {
            info!("LCU event bus disconnected");
        }
    }));
    obs.add_connection_handler(Arc::new(|connected| {
        if connected {
            info!("OBS connected");
        } else {
            info!("OBS disconnected");
        }
    }));

    // Start services
    monitor.start();
    lcu.start();
    tracker.start().await;

    if config.obs.auto_connect {
        info!("Auto-connecting to OBS...");
        obs.connect(None);
    }

    // Run until interrupted
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    tracker.stop();
    lcu.stop().await;
    monitor.stop().await;

    // Give the OBS teardown a bounded window to finish.
    let (tx, rx) = tokio::sync::oneshot::channel();
    obs.disconnect(Some(Box::new(move |_| {
        let _ = tx.send(());
    })));
    let _ = tokio::time::timeout(Duration::from_secs(5), rx).await;

    info!("riftcast Agent shutting down");
    Ok(())
}

fn print_help() {
    println!("riftcast Agent - automatic League of Legends match recording");
    println!();
    println!("USAGE:");
    println!("    riftcast-agent [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help    Print this help message");
    println!();
    println!("ENVIRONMENT:");
    println!("    RUST_LOG      Set log level (e.g., debug, info, warn)");
    println!();
    println!("For more information, visit: https://github.com/riftcast/riftcast");
}
