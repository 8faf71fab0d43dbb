use crate::connection_manager::BrokerConnectionManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Installs the global subscriber. `log` records from the storage layer are
/// forwarded through the same subscriber.
pub fn start_logging(level: tracing::Level) {
    tracing_subscriber::fmt().with_max_level(level).init();
}

/// Waits for Ctrl-C and then flips `shutdown` so every background task stops.
pub async fn handle_shutdown(shutdown: watch::Sender<bool>) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Termination signal received, shutting down..."),
        Err(e) => error!("Failed to listen for termination signal: {:?}", e),
    }
    let _ = shutdown.send(true);
}

/// Resolves once `shutdown` flips. Handed to the REST server for graceful stop.
pub async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}

/// Logs the state of every live broker connection on a fixed period.
pub fn periodic_status_update(
    connections: Arc<BrokerConnectionManager>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(period) => {}
            }
            let statuses = connections.status().await;
            let connected = statuses.iter().filter(|s| s.state == "CONNECTED").count();
            if connected < statuses.len() {
                warn!(
                    "{} of {} broker connection(s) are up.",
                    connected,
                    statuses.len()
                );
            } else {
                info!("{} broker connection(s) up.", connected);
            }
        }
    })
}
