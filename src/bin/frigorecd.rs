//! Acquisition daemon: wires the engine to the configured transmitter
//! and logs what happens until interrupted.

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::Parser;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use frigorec::config::DEFAULT_CONFIG_PATH;
use frigorec::{Engine, EngineEvent, RuntimeConfig};

#[derive(Debug, Parser)]
#[command(name = "frigorecd", about = "Refrigeration test bench recorder daemon")]
struct Args {
    /// Path to the JSON runtime configuration.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the database path from the config file.
    #[arg(long)]
    database: Option<PathBuf>,

    /// Override the transmitter host.
    #[arg(long, env = "FRIGOREC_HOST")]
    host: Option<String>,

    /// Override the transmitter port.
    #[arg(long, env = "FRIGOREC_PORT")]
    port: Option<u16>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = RuntimeConfig::load(&args.config);
    if let Some(database) = args.database {
        config.database_path = database;
    }
    if let Some(host) = args.host {
        config.transmitter_host = host;
    }
    if let Some(port) = args.port {
        config.transmitter_port = port;
    }

    // Store bootstrap failure is the one fatal startup error.
    let engine = match Engine::start(&config) {
        Ok(engine) => engine,
        Err(err) => {
            error!(%err, "engine start failed");
            process::exit(1);
        }
    };

    let token = engine.shutdown_token();
    let handler_token = std::sync::Arc::clone(&token);
    if let Err(err) = ctrlc::set_handler(move || handler_token.cancel()) {
        warn!(%err, "SIGINT handler not installed");
    }

    match engine.coordinator().begin_monitoring() {
        Ok(recovered) if !recovered.is_empty() => {
            for row in &recovered {
                warn!(experiment = %row.id, name = %row.name, "recovered from previous run");
            }
        }
        Ok(_) => {}
        Err(err) => warn!(%err, "monitoring start degraded; link will be retried"),
    }

    let events = engine.subscribe();
    while !token.is_cancelled() {
        match events.recv_timeout(Duration::from_millis(500)) {
            Ok(EngineEvent::Anomaly { post, event }) => {
                info!(post = %post, kind = event.kind.as_str(), "{}", event.message);
            }
            Ok(EngineEvent::PostState { post, state }) => {
                info!(post = %post, state = state.as_str(), "post state changed");
            }
            Ok(EngineEvent::Link(status)) => info!(?status, "link status"),
            Ok(EngineEvent::Health(snapshot)) => {
                debug!(
                    samples_per_sec = snapshot.samples_per_sec,
                    pending = snapshot.writer.rows_written,
                    "tick"
                );
            }
            Ok(EngineEvent::ChannelValue { .. }) => {}
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    info!("shutting down");
    engine.stop();
}
