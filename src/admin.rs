//! Operations the admin layer calls. Persistence goes first, then the live
//! connection set is brought in line with what was stored.

use crate::connection_manager::{BrokerConnectionManager, ConnectionStatus, UpdateOutcome};
use crate::db::{DatabaseService, StoreError};
use crate::fanout::RealtimeFanout;
use crate::models::{
    BrokerConfig, BrokerConfigInput, NewSensorType, Protocol, Sensor, SensorFilter, SensorType,
};
use crate::sensor_registry::{SensorRegistration, SensorRegistry, SensorSettings};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("{0}")]
    Validation(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
    #[error("{0}")]
    Conflict(String),
    #[error("storage failure: {0}")]
    Store(StoreError),
    #[error("admin worker failed: {0}")]
    Worker(String),
}

impl From<StoreError> for AdminError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => AdminError::NotFound { entity, id },
            StoreError::Conflict(message) => AdminError::Conflict(message),
            other => AdminError::Store(other),
        }
    }
}

pub struct AdminService {
    db: Arc<DatabaseService>,
    registry: Arc<SensorRegistry>,
    connections: Arc<BrokerConnectionManager>,
    fanout: RealtimeFanout,
    // Held from the stored write until the connection set reflects it.
    broker_changes: Mutex<()>,
}

impl AdminService {
    pub fn new(
        db: Arc<DatabaseService>,
        registry: Arc<SensorRegistry>,
        connections: Arc<BrokerConnectionManager>,
        fanout: RealtimeFanout,
    ) -> Self {
        Self {
            db,
            registry,
            connections,
            fanout,
            broker_changes: Mutex::new(()),
        }
    }

    /// Runs a storage call on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, AdminError>
    where
        T: Send + 'static,
        F: FnOnce(&DatabaseService, &SensorRegistry) -> Result<T, StoreError> + Send + 'static,
    {
        let db = self.db.clone();
        let registry = self.registry.clone();
        tokio::task::spawn_blocking(move || f(db.as_ref(), registry.as_ref()))
            .await
            .map_err(|e| AdminError::Worker(e.to_string()))?
            .map_err(AdminError::from)
    }

    pub async fn create_broker_config(
        &self,
        input: BrokerConfigInput,
    ) -> Result<BrokerConfig, AdminError> {
        validate_broker_input(&input)?;
        let _guard = self.broker_changes.lock().await;
        let config = self
            .blocking(move |db, _| db.insert_broker_config(&input))
            .await?;
        info!(config_id = config.id, name = %config.name, "Broker config created.");

        let config = self.provision(config).await?;
        self.connections.register(config.clone()).await;
        Ok(config)
    }

    /// Full replace of the configuration. Only topics that are new to the
    /// configuration get provisioned sensors; existing sensors are left alone.
    pub async fn update_broker_config(
        &self,
        id: i64,
        input: BrokerConfigInput,
    ) -> Result<BrokerConfig, AdminError> {
        validate_broker_input(&input)?;
        let _guard = self.broker_changes.lock().await;
        let (previous, updated) = self
            .blocking(move |db, _| {
                let previous = db.get_broker_config(id)?;
                let updated = db.replace_broker_config(id, &input)?;
                Ok((previous, updated))
            })
            .await?;

        let known: HashSet<String> = previous.subscription_topics().into_iter().collect();
        let new_entries: Vec<String> = updated
            .default_topics
            .iter()
            .chain(updated.custom_topics.iter())
            .filter(|entry| !known.contains(&updated.full_topic(entry)))
            .cloned()
            .collect();
        if !new_entries.is_empty() {
            let config = updated.clone();
            let created = self
                .blocking(move |_, registry| registry.provision_topics(&config, &new_entries))
                .await?;
            self.announce(&created);
        }

        let outcome = self.connections.update(updated.clone()).await;
        info!(config_id = id, outcome = ?outcome, "Broker config updated.");
        Ok(updated)
    }

    /// Stops the connection. Sensors and readings are kept.
    pub async fn deactivate_broker_config(&self, id: i64) -> Result<BrokerConfig, AdminError> {
        let _guard = self.broker_changes.lock().await;
        let config = self
            .blocking(move |db, _| db.set_broker_config_active(id, false))
            .await?;
        self.connections.deactivate(id).await;
        info!(config_id = id, "Broker config deactivated.");
        Ok(config)
    }

    /// Forces a fresh connection without changing stored data.
    pub async fn reconnect(&self, id: i64) -> Result<UpdateOutcome, AdminError> {
        let _guard = self.broker_changes.lock().await;
        let config = self.blocking(move |db, _| db.get_broker_config(id)).await?;
        if !config.active {
            return Err(AdminError::Conflict(format!(
                "broker config {} is inactive",
                id
            )));
        }
        Ok(self.connections.reconnect(config).await)
    }

    pub async fn get_broker_config(&self, id: i64) -> Result<BrokerConfig, AdminError> {
        self.blocking(move |db, _| db.get_broker_config(id)).await
    }

    pub async fn list_broker_configs(&self) -> Result<Vec<BrokerConfig>, AdminError> {
        self.blocking(|db, _| db.list_broker_configs(false)).await
    }

    pub async fn connection_status(&self) -> Vec<ConnectionStatus> {
        self.connections.status().await
    }

    pub async fn create_sensor_type(&self, input: NewSensorType) -> Result<SensorType, AdminError> {
        if input.name.trim().is_empty() {
            return Err(AdminError::Validation("sensor type name is required".to_string()));
        }
        if matches!(input.ttl_minutes, Some(ttl) if ttl <= 0) {
            return Err(AdminError::Validation("ttlMinutes must be positive".to_string()));
        }
        if matches!(input.decimals, Some(d) if !(0..=10).contains(&d)) {
            return Err(AdminError::Validation("decimals must be between 0 and 10".to_string()));
        }
        self.blocking(move |_, registry| registry.create_type(&input)).await
    }

    pub async fn get_sensor_type(&self, id: i64) -> Result<SensorType, AdminError> {
        self.blocking(move |_, registry| registry.get_type(id)).await
    }

    pub async fn list_sensor_types(&self) -> Result<Vec<SensorType>, AdminError> {
        self.blocking(|_, registry| registry.list_types()).await
    }

    pub async fn list_sensors(&self, filter: SensorFilter) -> Result<Vec<Sensor>, AdminError> {
        self.blocking(move |_, registry| registry.list_sensors(&filter)).await
    }

    pub async fn get_sensor(&self, id: i64) -> Result<Sensor, AdminError> {
        self.blocking(move |_, registry| registry.get_sensor(id)).await
    }

    pub async fn register_sensor(&self, input: SensorRegistration) -> Result<Sensor, AdminError> {
        if input.name.trim().is_empty() || input.sensor_type.trim().is_empty() {
            return Err(AdminError::Validation(
                "name and sensorType are required".to_string(),
            ));
        }
        validate_thresholds(input.min_threshold, input.max_threshold)?;
        let sensor = self
            .blocking(move |_, registry| registry.register_sensor(&input))
            .await?;
        self.fanout.emit_sensor_changed(&sensor);
        Ok(sensor)
    }

    pub async fn update_sensor_settings(
        &self,
        id: i64,
        settings: SensorSettings,
    ) -> Result<Sensor, AdminError> {
        validate_thresholds(settings.min_threshold, settings.max_threshold)?;
        let sensor = self
            .blocking(move |_, registry| registry.update_settings(id, &settings))
            .await?;
        self.fanout.emit_sensor_changed(&sensor);
        Ok(sensor)
    }

    /// Opens connections for every active configuration and provisions the
    /// default sensors of any that were never initialized.
    pub async fn restore_connections(&self) -> Result<usize, AdminError> {
        let _guard = self.broker_changes.lock().await;
        let configs = self.blocking(|db, _| db.list_broker_configs(true)).await?;
        let mut opened = 0;
        for config in configs {
            let config = match self.provision(config.clone()).await {
                Ok(provisioned) => provisioned,
                Err(e) => {
                    warn!(config_id = config.id, "Provisioning failed at startup: {}", e);
                    config
                }
            };
            if self.connections.register(config).await {
                opened += 1;
            }
        }
        info!("Restored {} broker connection(s).", opened);
        Ok(opened)
    }

    /// Default topics are provisioned once per configuration; custom topics
    /// on every call (existing sensors are skipped).
    async fn provision(&self, config: BrokerConfig) -> Result<BrokerConfig, AdminError> {
        let mut entries = config.custom_topics.clone();
        if !config.default_sensors_initialized {
            entries.extend(config.default_topics.iter().cloned());
        }
        if entries.is_empty() && config.default_sensors_initialized {
            return Ok(config);
        }

        let (config, created) = self
            .blocking(move |db, registry| {
                let created = registry.provision_topics(&config, &entries)?;
                if !config.default_sensors_initialized {
                    db.mark_default_sensors_initialized(config.id)?;
                }
                Ok((db.get_broker_config(config.id)?, created))
            })
            .await?;
        self.announce(&created);
        Ok(config)
    }

    fn announce(&self, sensors: &[Sensor]) {
        for sensor in sensors {
            self.fanout.emit_sensor_changed(sensor);
        }
    }
}

fn validate_broker_input(input: &BrokerConfigInput) -> Result<(), AdminError> {
    if input.name.trim().is_empty() {
        return Err(AdminError::Validation("name is required".to_string()));
    }
    if input.broker.trim().is_empty() {
        return Err(AdminError::Validation("broker host is required".to_string()));
    }
    if input.port == 0 {
        return Err(AdminError::Validation("port must be non-zero".to_string()));
    }
    if input.protocol != Protocol::Mqtt {
        return Err(AdminError::Validation(format!(
            "protocol {} cannot be used for a broker connection",
            input.protocol.as_str()
        )));
    }
    let all = input.default_topics.iter().chain(input.custom_topics.iter());
    for topic in all {
        if topic.trim().is_empty() {
            return Err(AdminError::Validation("topics must not be empty".to_string()));
        }
    }
    Ok(())
}

fn validate_thresholds(min: Option<f64>, max: Option<f64>) -> Result<(), AdminError> {
    match (min, max) {
        (Some(min), Some(max)) if min > max => Err(AdminError::Validation(
            "minThreshold must not exceed maxThreshold".to_string(),
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::tests::{broker_input, memory_db};
    use crate::dispatcher::MessageDispatcher;
    use crate::mqtt_service::tests::test_settings;

    pub(crate) struct AdminHarness {
        pub admin: AdminService,
        pub connections: Arc<BrokerConnectionManager>,
        pub dispatcher: Arc<MessageDispatcher>,
        pub fanout: RealtimeFanout,
        pub db: Arc<DatabaseService>,
    }

    pub(crate) fn admin_harness() -> AdminHarness {
        let db = Arc::new(memory_db());
        let fanout = RealtimeFanout::new(64);
        let registry = Arc::new(SensorRegistry::new(db.clone(), 5));
        let dispatcher = Arc::new(MessageDispatcher::new(db.clone(), fanout.clone(), 5));
        let connections = Arc::new(BrokerConnectionManager::new(
            dispatcher.clone(),
            test_settings(),
        ));
        AdminHarness {
            admin: AdminService::new(db.clone(), registry, connections.clone(), fanout.clone()),
            connections,
            dispatcher,
            fanout,
            db,
        }
    }

    // Unreachable endpoint: connections stay in their retry loop.
    pub(crate) fn local_input(name: &str, topics: &[&str]) -> BrokerConfigInput {
        let mut input = broker_input(name, "agrotech/", topics);
        input.broker = "127.0.0.1".to_string();
        input.port = 1;
        input
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn create_provisions_defaults_once_and_connects() {
        let h = admin_harness();
        let config = h
            .admin
            .create_broker_config(local_input("north", &["soil/1", "soil/2"]))
            .await
            .unwrap();

        assert!(config.default_sensors_initialized);
        let sensors = h.admin.list_sensors(SensorFilter::default()).await.unwrap();
        assert_eq!(sensors.len(), 2);
        assert_eq!(h.connections.live_ids().await, vec![config.id]);

        // A restart must not provision the defaults again.
        h.connections.shutdown().await;
        assert_eq!(h.admin.restore_connections().await.unwrap(), 1);
        assert_eq!(h.admin.list_sensors(SensorFilter::default()).await.unwrap().len(), 2);
        h.connections.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn adding_a_topic_leaves_existing_sensors_untouched() {
        let h = admin_harness();
        let config = h
            .admin
            .create_broker_config(local_input("north", &["a", "b"]))
            .await
            .unwrap();
        let before = h.admin.list_sensors(SensorFilter::default()).await.unwrap();

        h.admin
            .update_broker_config(config.id, local_input("north", &["a", "b", "c"]))
            .await
            .unwrap();

        let after = h.admin.list_sensors(SensorFilter::default()).await.unwrap();
        assert_eq!(after.len(), 3);
        assert_eq!(&after[..2], &before[..]);
        assert_eq!(after[2].topic, "agrotech/c");
        assert_eq!(
            h.connections.subscribed_topics(config.id).await.unwrap(),
            vec!["agrotech/a", "agrotech/b", "agrotech/c"]
        );
        h.connections.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn deactivation_stops_connection_and_keeps_history() {
        let h = admin_harness();
        let config = h
            .admin
            .create_broker_config(local_input("north", &["a"]))
            .await
            .unwrap();
        h.dispatcher
            .handle(&config, "agrotech/a", br#"{"valor":3}"#)
            .unwrap();

        let deactivated = h.admin.deactivate_broker_config(config.id).await.unwrap();
        assert!(!deactivated.active);
        assert!(h.connections.live_ids().await.is_empty());
        assert_eq!(h.admin.list_sensors(SensorFilter::default()).await.unwrap().len(), 1);
        assert!(matches!(
            h.admin.reconnect(config.id).await,
            Err(AdminError::Conflict(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn editing_a_deactivated_config_does_not_revive_it() {
        let h = admin_harness();
        let config = h
            .admin
            .create_broker_config(local_input("north", &["a"]))
            .await
            .unwrap();
        h.admin.deactivate_broker_config(config.id).await.unwrap();

        let updated = h
            .admin
            .update_broker_config(config.id, local_input("north", &["a", "b"]))
            .await
            .unwrap();
        assert!(!updated.active);
        assert!(h.connections.live_ids().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn interleaved_update_and_deactivate_agree_with_storage() {
        let h = admin_harness();
        let config = h
            .admin
            .create_broker_config(local_input("north", &["a"]))
            .await
            .unwrap();

        for round in 0..8 {
            let mut input = local_input("north", &["a"]);
            input.active = Some(true);
            let (updated, deactivated) = tokio::join!(
                h.admin.update_broker_config(config.id, input),
                h.admin.deactivate_broker_config(config.id)
            );
            updated.unwrap();
            deactivated.unwrap();

            let stored = h.admin.get_broker_config(config.id).await.unwrap();
            let live = h.connections.live_ids().await.contains(&config.id);
            assert_eq!(stored.active, live, "round {}", round);
        }
        h.connections.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reconnect_replaces_live_connection() {
        let h = admin_harness();
        let config = h
            .admin
            .create_broker_config(local_input("north", &["a"]))
            .await
            .unwrap();
        assert_eq!(
            h.admin.reconnect(config.id).await.unwrap(),
            UpdateOutcome::Reconnected
        );
        assert!(matches!(
            h.admin.reconnect(999).await,
            Err(AdminError::NotFound { id: 999, .. })
        ));
        h.connections.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_inputs_are_rejected() {
        let h = admin_harness();
        let mut input = local_input("", &["a"]);
        assert!(matches!(
            h.admin.create_broker_config(input.clone()).await,
            Err(AdminError::Validation(_))
        ));
        input.name = "ok".to_string();
        input.protocol = Protocol::Http;
        assert!(matches!(
            h.admin.create_broker_config(input).await,
            Err(AdminError::Validation(_))
        ));

        let bad_type = NewSensorType {
            name: "PH".to_string(),
            unit: None,
            decimals: None,
            ttl_minutes: Some(0),
        };
        assert!(matches!(
            h.admin.create_sensor_type(bad_type).await,
            Err(AdminError::Validation(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplicate_sensor_type_is_a_conflict() {
        let h = admin_harness();
        let input = NewSensorType {
            name: "PH".to_string(),
            unit: None,
            decimals: Some(1),
            ttl_minutes: Some(10),
        };
        h.admin.create_sensor_type(input.clone()).await.unwrap();
        assert!(matches!(
            h.admin.create_sensor_type(input).await,
            Err(AdminError::Conflict(_))
        ));
        assert_eq!(h.admin.list_sensor_types().await.unwrap().len(), 1);
    }
}
