use std::sync::Arc;

use inventory_relay::config::Config;
use inventory_relay::errors::InitError;
use inventory_relay::kinesis::KinesisTransport;
use inventory_relay::relay::Relay;
use inventory_relay::sink::ReliableSink;
use tracing::{error, info, warn};

/// Startup failure: log and exit.
fn fatal(err: InitError) -> ! {
    error!(%err, "failed to start relay");
    std::process::exit(1);
}

fn setup_logging() {
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::prelude::*;

    let level = std::env::var("INVENTORY_RELAY_LOG_LEVEL")
        .ok()
        .and_then(|val| {
            val.parse::<LevelFilter>().ok().or_else(|| {
                eprintln!("invalid INVENTORY_RELAY_LOG_LEVEL: {val:?}, defaulting to WARN");
                None
            })
        })
        .unwrap_or(LevelFilter::WARN);

    tracing_subscriber::registry()
        .with(level)
        .with(tracing_microjson::JsonLayer::new(std::io::stderr).with_target(true))
        .init();
}

fn setup_rustls() {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls ring provider");
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() {
    setup_logging();
    setup_rustls();

    let config = Config::from_env().unwrap_or_else(|e| fatal(e.into()));
    let transport = KinesisTransport::new(&config).unwrap_or_else(|e| fatal(e.into()));
    let sink = ReliableSink::new(Arc::new(transport), config.max_attempts, config.retry_base)
        .with_deadline(config.send_deadline);

    let mut relay = Relay::new(sink, &config)
        .await
        .unwrap_or_else(|e| fatal(e));

    let shutdown = relay.shutdown_token();
    tokio::spawn(async move {
        wait_for_signal().await;
        shutdown.cancel();
    });

    info!(
        stream = %config.stream_name,
        region = %config.region,
        listener_port = config.listener_port,
        capacity = config.buffer_capacity,
        assume_role = config.role_arn.is_some(),
        "relay started"
    );

    if let Err(e) = relay.run().await {
        error!(%e, "runtime error");
        std::process::exit(1);
    }
}
