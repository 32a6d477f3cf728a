//! genogate-server: loads the configuration, starts the gateway and runs until Ctrl-C.
//!
//! The process hosts the gateway and its background workers (job polling, idle handle reaping,
//! catalog rescans). RPC transports embed the `genogate` library and call `Gateway` directly.

use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;

use genogate::config::{resolve_config_path, LogFormat, LoggingConfig};
use genogate::{load_config, Gateway, JobEvent};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter};

fn init_logging(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing_log::LogTracer::init()?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    match config.format {
        LogFormat::Text => {
            tracing::subscriber::set_global_default(registry.with(fmt::layer().with_target(true)))?
        }
        LogFormat::Json => tracing::subscriber::set_global_default(
            registry.with(fmt::layer().json().with_current_span(true)),
        )?,
    }
    Ok(())
}

/// Logs job state changes until the gateway closes the channel.
fn spawn_event_logger(
    mut events: broadcast::Receiver<JobEvent>,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("genogate-events".to_string())
        .spawn(move || loop {
            match events.blocking_recv() {
                Ok(event) => match &event.failure_info {
                    Some(info) => tracing::warn!(
                        job_id = %event.job_id,
                        owner = %event.owner,
                        state = %event.state,
                        "job failed: {}",
                        info
                    ),
                    None => tracing::info!(
                        job_id = %event.job_id,
                        owner = %event.owner,
                        state = %event.state,
                        map = event.map_progress,
                        reduce = event.reduce_progress,
                        "job state changed"
                    ),
                },
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Event logger fell behind, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        })
}

fn main() -> ExitCode {
    let explicit = std::env::args_os().nth(1).map(PathBuf::from);
    let config_path = match resolve_config_path(explicit.as_deref()) {
        Ok(path) => path,
        Err(e) => {
            eprintln!("genogate-server: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let config = match load_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("genogate-server: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(&config.logging) {
        eprintln!("genogate-server: failed to initialise logging: {}", e);
        return ExitCode::FAILURE;
    }
    log::info!("Loaded config from {}", config_path.display());

    let gateway = match Gateway::start(&config) {
        Ok(gateway) => gateway,
        Err(e) => {
            log::error!("Failed to start gateway: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let event_logger = match spawn_event_logger(gateway.subscribe_events()) {
        Ok(handle) => Some(handle),
        Err(e) => {
            log::warn!("Failed to start event logger: {}", e);
            None
        }
    };

    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    }) {
        log::error!("Failed to install Ctrl-C handler: {}", e);
        return ExitCode::FAILURE;
    }

    log::info!(
        "genogate gateway running over store {} with background workers active (Ctrl-C to stop)",
        config.store.root
    );
    let _ = stop_rx.recv();

    gateway.shutdown();
    drop(gateway);
    if let Some(handle) = event_logger {
        let _ = handle.join();
    }

    log::info!("Stopped");
    ExitCode::SUCCESS
}
