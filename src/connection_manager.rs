//! Owns the live set of broker connections, one per configuration id.
//!
//! The map is the only process-wide mutable state of the ingestion engine.
//! Every open/replace/close goes through the manager's single lock, and a
//! replaced or removed connection is fully closed before anything new is
//! opened for the same id, so a topic is never subscribed twice.

use crate::dispatcher::MessageDispatcher;
use crate::models::BrokerConfig;
use crate::mqtt_service::{BrokerConnection, ClientState, ConnectionSettings, TopicDiff};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// No connection existed; one was opened.
    Opened,
    /// Same endpoint; only the topic set changed on the live connection.
    Resubscribed(TopicDiff),
    /// Endpoint or credentials changed; the connection was replaced.
    Reconnected,
    /// The configuration is inactive; any connection was closed.
    Closed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub config_id: i64,
    pub broker: String,
    pub state: String,
    pub topics: Vec<String>,
}

pub struct BrokerConnectionManager {
    connections: Mutex<HashMap<i64, BrokerConnection>>,
    dispatcher: Arc<MessageDispatcher>,
    settings: ConnectionSettings,
}

impl BrokerConnectionManager {
    pub fn new(dispatcher: Arc<MessageDispatcher>, settings: ConnectionSettings) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            dispatcher,
            settings,
        }
    }

    /// Opens a connection for `config` unless one is already live.
    /// Returns whether a connection was opened.
    pub async fn register(&self, config: BrokerConfig) -> bool {
        if !config.active {
            return false;
        }
        let mut connections = self.connections.lock().await;
        if connections.contains_key(&config.id) {
            return false;
        }
        info!(config_id = config.id, broker = %config.broker, "Registering broker connection.");
        let id = config.id;
        connections.insert(id, self.open(config));
        true
    }

    /// Brings the live connection in line with `config`.
    pub async fn update(&self, config: BrokerConfig) -> UpdateOutcome {
        let mut connections = self.connections.lock().await;

        if !config.active {
            if let Some(existing) = connections.remove(&config.id) {
                existing.close().await;
            }
            return UpdateOutcome::Closed;
        }

        let Some(existing) = connections.remove(&config.id) else {
            let id = config.id;
            connections.insert(id, self.open(config));
            return UpdateOutcome::Opened;
        };

        let current = existing.config().await;
        if !current.connection_differs(&config) {
            let diff = existing.apply_topics(config).await;
            connections.insert(current.id, existing);
            return UpdateOutcome::Resubscribed(diff);
        }

        info!(config_id = config.id, broker = %config.broker, "Connection parameters changed; reconnecting.");
        existing.close().await;
        let id = config.id;
        connections.insert(id, self.open(config));
        UpdateOutcome::Reconnected
    }

    /// Closes the old connection (if any) and opens a new one, even when
    /// nothing changed.
    pub async fn reconnect(&self, config: BrokerConfig) -> UpdateOutcome {
        let mut connections = self.connections.lock().await;
        let had_connection = match connections.remove(&config.id) {
            Some(existing) => {
                existing.close().await;
                true
            }
            None => false,
        };
        if !config.active {
            return UpdateOutcome::Closed;
        }
        let id = config.id;
        connections.insert(id, self.open(config));
        if had_connection {
            UpdateOutcome::Reconnected
        } else {
            UpdateOutcome::Opened
        }
    }

    /// Closes and forgets the connection for `config_id`. Returns whether one
    /// was live.
    pub async fn deactivate(&self, config_id: i64) -> bool {
        let removed = self.connections.lock().await.remove(&config_id);
        match removed {
            Some(connection) => {
                connection.close().await;
                true
            }
            None => {
                warn!(config_id, "Deactivate requested for a broker without a live connection.");
                false
            }
        }
    }

    pub async fn shutdown(&self) {
        let mut connections = self.connections.lock().await;
        for (_, connection) in connections.drain() {
            connection.close().await;
        }
        info!("All broker connections closed.");
    }

    #[cfg(test)]
    pub async fn live_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.connections.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    #[cfg(test)]
    pub async fn subscribed_topics(&self, config_id: i64) -> Option<Vec<String>> {
        let connections = self.connections.lock().await;
        match connections.get(&config_id) {
            Some(connection) => Some(connection.subscribed_topics().await),
            None => None,
        }
    }

    pub async fn status(&self) -> Vec<ConnectionStatus> {
        let connections = self.connections.lock().await;
        let mut statuses = Vec::with_capacity(connections.len());
        for (id, connection) in connections.iter() {
            let state = match connection.state().await {
                ClientState::Disconnected => "DISCONNECTED".to_string(),
                ClientState::Connecting => "CONNECTING".to_string(),
                ClientState::Connected => "CONNECTED".to_string(),
                ClientState::Error(e) => format!("ERROR: {}", e),
            };
            statuses.push(ConnectionStatus {
                config_id: *id,
                broker: connection.config().await.broker.clone(),
                state,
                topics: connection.subscribed_topics().await,
            });
        }
        statuses.sort_by_key(|s| s.config_id);
        statuses
    }

    fn open(&self, config: BrokerConfig) -> BrokerConnection {
        BrokerConnection::open(config, &self.settings, self.dispatcher.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::memory_db;
    use crate::fanout::RealtimeFanout;
    use crate::models::Protocol;
    use crate::mqtt_service::tests::test_settings;

    fn manager() -> BrokerConnectionManager {
        let db = Arc::new(memory_db());
        let dispatcher = Arc::new(MessageDispatcher::new(db, RealtimeFanout::new(8), 5));
        BrokerConnectionManager::new(dispatcher, test_settings())
    }

    // Nothing listens on port 1, so connections stay in their retry loop.
    fn config(id: i64, topics: &[&str]) -> BrokerConfig {
        BrokerConfig {
            id,
            name: format!("cfg-{}", id),
            broker: "127.0.0.1".to_string(),
            port: 1,
            protocol: Protocol::Mqtt,
            topic_prefix: "farm/".to_string(),
            default_topics: topics.iter().map(|t| t.to_string()).collect(),
            custom_topics: Vec::new(),
            plot_id: None,
            sub_plot_id: None,
            username: None,
            password: None,
            active: true,
            default_sensors_initialized: false,
        }
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let manager = manager();
        assert!(manager.register(config(1, &["a"])).await);
        assert!(!manager.register(config(1, &["a", "b"])).await);
        assert_eq!(manager.live_ids().await, vec![1]);
        assert_eq!(
            manager.subscribed_topics(1).await,
            Some(vec!["farm/a".to_string()])
        );
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn inactive_configs_are_not_registered() {
        let manager = manager();
        let mut cfg = config(1, &["a"]);
        cfg.active = false;
        assert!(!manager.register(cfg).await);
        assert!(manager.live_ids().await.is_empty());
    }

    #[tokio::test]
    async fn topic_only_update_subscribes_just_the_new_topic() {
        let manager = manager();
        manager.register(config(1, &["a", "b"])).await;

        let outcome = manager.update(config(1, &["a", "b", "c"])).await;
        assert_eq!(
            outcome,
            UpdateOutcome::Resubscribed(TopicDiff {
                added: vec!["farm/c".to_string()],
                removed: Vec::new(),
            })
        );
        assert_eq!(
            manager.subscribed_topics(1).await,
            Some(vec![
                "farm/a".to_string(),
                "farm/b".to_string(),
                "farm/c".to_string()
            ])
        );

        let outcome = manager.update(config(1, &["c"])).await;
        assert_eq!(
            outcome,
            UpdateOutcome::Resubscribed(TopicDiff {
                added: Vec::new(),
                removed: vec!["farm/a".to_string(), "farm/b".to_string()],
            })
        );
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn endpoint_change_replaces_the_connection() {
        let manager = manager();
        manager.register(config(1, &["a"])).await;

        let mut moved = config(1, &["a"]);
        moved.port = 2;
        assert_eq!(manager.update(moved).await, UpdateOutcome::Reconnected);
        assert_eq!(manager.live_ids().await, vec![1]);

        let status = manager.status().await;
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].topics, vec!["farm/a".to_string()]);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn update_opens_missing_and_closes_inactive() {
        let manager = manager();
        assert_eq!(manager.update(config(2, &["x"])).await, UpdateOutcome::Opened);

        let mut off = config(2, &["x"]);
        off.active = false;
        assert_eq!(manager.update(off).await, UpdateOutcome::Closed);
        assert!(manager.live_ids().await.is_empty());
    }

    #[tokio::test]
    async fn deactivate_and_reconnect() {
        let manager = manager();
        manager.register(config(1, &["a"])).await;
        manager.register(config(2, &["b"])).await;

        assert_eq!(manager.reconnect(config(1, &["a"])).await, UpdateOutcome::Reconnected);
        assert!(manager.deactivate(1).await);
        assert!(!manager.deactivate(1).await);
        assert_eq!(manager.live_ids().await, vec![2]);
        assert_eq!(manager.reconnect(config(3, &["c"])).await, UpdateOutcome::Opened);
        manager.shutdown().await;
        assert!(manager.live_ids().await.is_empty());
    }
}
