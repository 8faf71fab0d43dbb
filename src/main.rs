mod admin;
mod config;
mod connection_manager;
mod connectivity;
mod db;
mod dispatcher;
mod fanout;
mod models;
mod mqtt_service;
mod payload;
mod reading_store;
mod rest_server;
mod scheduler;
mod sensor_registry;
mod service_utils;

use crate::admin::AdminService;
use crate::config::Config;
use crate::connection_manager::BrokerConnectionManager;
use crate::db::DatabaseService;
use crate::dispatcher::MessageDispatcher;
use crate::fanout::RealtimeFanout;
use crate::mqtt_service::ConnectionSettings;
use crate::reading_store::ReadingStore;
use crate::rest_server::{run_rest_server, AppState};
use crate::scheduler::{spawn_reconciliation, spawn_retention, ReconciliationScheduler};
use crate::sensor_registry::SensorRegistry;
use crate::service_utils::{handle_shutdown, periodic_status_update, start_logging, wait_for_shutdown};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

const STATUS_LOG_PERIOD: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            start_logging(tracing::Level::INFO);
            error!("Error loading configuration: {:?}", e);
            return;
        }
    };
    start_logging(config.log_level());

    let opened = if config.database_path == ":memory:" {
        DatabaseService::in_memory()
    } else {
        DatabaseService::new(&config.database_path)
    };
    let db_service = match opened {
        Ok(service) => Arc::new(service),
        Err(e) => {
            error!("Failed to create database service: {:?}", e);
            return;
        }
    };

    if let Err(e) = db_service.initialize_db() {
        error!("Database initialization failed: {:?}", e);
        return;
    }
    info!("Database initialized successfully.");

    let fanout = RealtimeFanout::new(config.fanout_capacity);
    let registry = Arc::new(SensorRegistry::new(
        db_service.clone(),
        config.default_ttl_minutes,
    ));
    let readings = Arc::new(ReadingStore::new(db_service.clone()));
    let dispatcher = Arc::new(MessageDispatcher::new(
        db_service.clone(),
        fanout.clone(),
        config.default_ttl_minutes,
    ));
    let connections = Arc::new(BrokerConnectionManager::new(
        dispatcher.clone(),
        ConnectionSettings {
            client_prefix: config.mqtt_client_prefix.clone(),
            keep_alive: Duration::from_secs(config.mqtt_keep_alive_secs),
            reconnect_interval: config.reconnect_interval(),
        },
    ));
    let admin = Arc::new(AdminService::new(
        db_service.clone(),
        registry.clone(),
        connections.clone(),
        fanout.clone(),
    ));

    if let Err(e) = admin.restore_connections().await {
        error!("Failed to restore broker connections: {:?}", e);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = Arc::new(ReconciliationScheduler::new(registry, fanout.clone()));
    let reconciliation_task =
        spawn_reconciliation(scheduler, config.sweep_interval(), shutdown_rx.clone());
    let retention_task = spawn_retention(
        readings.clone(),
        config.retention_horizon(),
        config.retention_sweep_interval(),
        shutdown_rx.clone(),
    );
    let status_task =
        periodic_status_update(connections.clone(), STATUS_LOG_PERIOD, shutdown_rx.clone());

    // Start REST API server
    let state = AppState {
        admin,
        dispatcher,
        readings,
        fanout,
    };
    let bind_addr = config.http_bind_addr.clone();
    let body_limit = config.http_body_limit_bytes;
    let server_shutdown = wait_for_shutdown(shutdown_rx.clone());
    let rest_api_task = tokio::spawn(async move {
        if let Err(e) = run_rest_server(state, &bind_addr, body_limit, server_shutdown).await {
            error!("REST server failed: {:?}", e);
        }
    });

    handle_shutdown(shutdown_tx).await;

    // In-flight messages finish before each connection task exits.
    connections.shutdown().await;
    let _ = tokio::join!(rest_api_task, reconciliation_task, retention_task, status_task);
    info!("All services shut down successfully.");
}
