//! Per-message ingestion: decode, resolve the sensor, update its row, append
//! the reading and fan out.
//!
//! Both transports go through [`MessageDispatcher::ingest`]. They differ only
//! in how the sensor is resolved:
//! - broker messages discover sensors. Anyone able to publish on a subscribed
//!   topic can create sensor and sensor-type records; trust is placed in the
//!   topic subscription, not in the publisher.
//! - HTTP readings must name a known, active sensor.
//!
//! Each ingest is one synchronous write transaction. Nothing is buffered, so a
//! message counts as processed only once it is stored.

use crate::connectivity;
use crate::db::{DatabaseService, StoreError};
use crate::fanout::RealtimeFanout;
use crate::models::{BrokerConfig, Reading, Sensor, GENERIC_SENSOR_TYPE};
use crate::payload::{self, DecodedPayload};
use crate::reading_store;
use crate::sensor_registry::{self, MessageUpdate, NewSensor};
use rusqlite::{Connection, TransactionBehavior};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::RetryIf;
use tracing::{debug, info, warn};

const TRANSIENT_RETRY_MS: u64 = 50;
const TRANSIENT_RETRIES: usize = 3;
/// How far past the server clock a client timestamp may run.
const MAX_CLOCK_SKEW: time::Duration = time::Duration::minutes(5);

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("sensor {0} not found")]
    UnknownSensor(i64),
    #[error("sensor {0} is inactive")]
    InactiveSensor(i64),
    #[error("timestamp {0} is ahead of the server clock")]
    InvalidTimestamp(OffsetDateTime),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("ingest worker failed: {0}")]
    Worker(String),
}

impl IngestError {
    fn is_transient(&self) -> bool {
        matches!(self, IngestError::Store(e) if e.is_transient())
    }
}

/// Body accepted by the HTTP ingestion fallback.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpReading {
    pub value: Value,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub timestamp: Option<OffsetDateTime>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// One raw input, by transport.
#[derive(Debug, Clone, Copy)]
pub enum IngestInput<'a> {
    Broker {
        config: &'a BrokerConfig,
        topic: &'a str,
        payload: &'a [u8],
    },
    Http {
        sensor_id: i64,
        reading: &'a HttpReading,
    },
}

impl IngestInput<'_> {
    fn decode(&self) -> DecodedPayload {
        match self {
            IngestInput::Broker { payload, .. } => payload::decode(payload),
            IngestInput::Http { reading, .. } => {
                let mut decoded = DecodedPayload {
                    value: payload::value_text(&reading.value),
                    ..DecodedPayload::default()
                };
                // Metadata may carry the same optional keys a broker payload does.
                if let Some(meta) = &reading.metadata {
                    let from_meta = payload::decode(meta.to_string().as_bytes());
                    decoded.state = from_meta.state;
                    decoded.unit = from_meta.unit;
                }
                decoded
            }
        }
    }

    /// Client timestamps beyond the allowed skew are rejected; those within
    /// it are pulled back to `now` so no row ever holds a future time.
    fn recorded_at(&self, now: OffsetDateTime) -> Result<OffsetDateTime, IngestError> {
        match self {
            IngestInput::Broker { .. } => Ok(now),
            IngestInput::Http { reading, .. } => match reading.timestamp {
                Some(at) if at > now + MAX_CLOCK_SKEW => Err(IngestError::InvalidTimestamp(at)),
                Some(at) => Ok(at.min(now)),
                None => Ok(now),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub sensor: Sensor,
    pub reading: Reading,
    pub discovered: bool,
    pub state_changed: bool,
    pub metadata_changed: bool,
}

impl IngestOutcome {
    pub fn sensor_changed(&self) -> bool {
        self.discovered || self.state_changed || self.metadata_changed
    }
}

/// A resolved sensor plus what resolving it changed.
struct Resolved {
    sensor: Sensor,
    discovered: bool,
    retyped_to: Option<i64>,
}

pub struct MessageDispatcher {
    db: Arc<DatabaseService>,
    fanout: RealtimeFanout,
    default_ttl_minutes: i64,
}

impl MessageDispatcher {
    pub fn new(db: Arc<DatabaseService>, fanout: RealtimeFanout, default_ttl_minutes: i64) -> Self {
        Self {
            db,
            fanout,
            default_ttl_minutes,
        }
    }

    /// Broker entry point.
    pub fn handle(
        &self,
        config: &BrokerConfig,
        topic: &str,
        payload: &[u8],
    ) -> Result<IngestOutcome, IngestError> {
        self.ingest(
            IngestInput::Broker {
                config,
                topic,
                payload,
            },
            OffsetDateTime::now_utc(),
        )
    }

    pub fn ingest(
        &self,
        input: IngestInput<'_>,
        now: OffsetDateTime,
    ) -> Result<IngestOutcome, IngestError> {
        let recorded_at = input.recorded_at(now)?;
        let decoded = input.decode();

        let mut conn = self.db.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;

        let resolved = match input {
            IngestInput::Broker { config, topic, .. } => {
                self.resolve_by_topic(&tx, config, topic, &decoded)?
            }
            IngestInput::Http { sensor_id, .. } => resolve_known(&tx, sensor_id)?,
        };

        let previous = &resolved.sensor;
        let state = connectivity::on_message(decoded.state);
        let alert = connectivity::threshold_alert(
            &decoded.value,
            previous.min_threshold,
            previous.max_threshold,
        );

        let updated = sensor_registry::record_message(
            &tx,
            previous.id,
            &MessageUpdate {
                value: &decoded.value,
                recorded_at,
                seen_at: now,
                state,
                alert,
                sensor_type_id: resolved.retyped_to,
            },
        )?;
        let reading = reading_store::append(&tx, updated.id, &decoded.value, recorded_at)?;
        tx.commit().map_err(StoreError::from)?;

        let outcome = IngestOutcome {
            state_changed: previous.state != updated.state,
            metadata_changed: previous.alert != updated.alert || resolved.retyped_to.is_some(),
            discovered: resolved.discovered,
            sensor: updated,
            reading,
        };

        self.fanout.emit_reading(&outcome.reading);
        if outcome.sensor_changed() {
            self.fanout.emit_sensor_changed(&outcome.sensor);
        }

        if outcome.discovered {
            info!(
                sensor_id = outcome.sensor.id,
                topic = %outcome.sensor.topic,
                "Discovered new sensor."
            );
        } else if outcome.state_changed {
            info!(
                sensor_id = outcome.sensor.id,
                state = %outcome.sensor.state,
                "Sensor state changed on message."
            );
        }
        Ok(outcome)
    }

    fn resolve_by_topic(
        &self,
        conn: &Connection,
        config: &BrokerConfig,
        topic: &str,
        decoded: &DecodedPayload,
    ) -> Result<Resolved, StoreError> {
        if let Some(sensor) = sensor_registry::find_by_topic(conn, topic, Some(config.id))? {
            let retyped_to = self.retype_if_generic(conn, &sensor, decoded)?;
            return Ok(Resolved {
                sensor,
                discovered: false,
                retyped_to,
            });
        }

        let type_name = decoded.type_name.as_deref().unwrap_or(GENERIC_SENSOR_TYPE);
        let (sensor_type, _) = sensor_registry::find_or_create_type(
            conn,
            type_name,
            decoded.unit.as_deref(),
            self.default_ttl_minutes,
        )?;
        let (sensor, created) = sensor_registry::find_or_create_sensor(
            conn,
            &NewSensor {
                name: decoded.name.clone().unwrap_or_else(|| topic.to_string()),
                sensor_type_id: sensor_type.id,
                protocol: config.protocol,
                topic: topic.to_string(),
                broker_config_id: Some(config.id),
                plot_id: config.plot_id,
                sub_plot_id: config.sub_plot_id,
                min_threshold: None,
                max_threshold: None,
            },
        )?;
        Ok(Resolved {
            sensor,
            discovered: created,
            retyped_to: None,
        })
    }

    /// A provisioned sensor carries the placeholder type until traffic
    /// declares a real one.
    fn retype_if_generic(
        &self,
        conn: &Connection,
        sensor: &Sensor,
        decoded: &DecodedPayload,
    ) -> Result<Option<i64>, StoreError> {
        let Some(type_name) = decoded.type_name.as_deref() else {
            return Ok(None);
        };
        if sensor_registry::normalize_type_name(type_name) == GENERIC_SENSOR_TYPE {
            return Ok(None);
        }
        let current = sensor_registry::get_type(conn, sensor.sensor_type_id)?;
        if current.name != GENERIC_SENSOR_TYPE {
            return Ok(None);
        }
        let (declared, _) = sensor_registry::find_or_create_type(
            conn,
            type_name,
            decoded.unit.as_deref(),
            self.default_ttl_minutes,
        )?;
        debug!(sensor_id = sensor.id, sensor_type = %declared.name, "Assigning declared type.");
        Ok(Some(declared.id))
    }
}

fn resolve_known(conn: &Connection, sensor_id: i64) -> Result<Resolved, IngestError> {
    let sensor = match sensor_registry::get_sensor(conn, sensor_id) {
        Ok(sensor) => sensor,
        Err(StoreError::NotFound { .. }) => return Err(IngestError::UnknownSensor(sensor_id)),
        Err(e) => return Err(e.into()),
    };
    if !sensor.active {
        return Err(IngestError::InactiveSensor(sensor_id));
    }
    Ok(Resolved {
        sensor,
        discovered: false,
        retyped_to: None,
    })
}

/// Runs a broker message through the dispatcher on the blocking pool,
/// retrying transient store failures a few times. Failures are logged and
/// swallowed; the connection keeps delivering.
pub async fn dispatch_broker_message(
    dispatcher: Arc<MessageDispatcher>,
    config: Arc<BrokerConfig>,
    topic: String,
    payload: Arc<Vec<u8>>,
) -> Option<IngestOutcome> {
    let strategy = FixedInterval::from_millis(TRANSIENT_RETRY_MS).take(TRANSIENT_RETRIES);
    let result = RetryIf::spawn(
        strategy,
        || {
            let dispatcher = dispatcher.clone();
            let config = config.clone();
            let topic = topic.clone();
            let payload = payload.clone();
            async move {
                tokio::task::spawn_blocking(move || dispatcher.handle(&config, &topic, &payload))
                    .await
                    .map_err(|e| IngestError::Worker(e.to_string()))?
            }
        },
        |e: &IngestError| e.is_transient(),
    )
    .await;

    match result {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            warn!(
                config_id = config.id,
                topic = %topic,
                "Failed to ingest message: {}",
                e
            );
            None
        }
    }
}

/// HTTP entry point, on the blocking pool.
pub async fn dispatch_http_reading(
    dispatcher: Arc<MessageDispatcher>,
    sensor_id: i64,
    reading: HttpReading,
) -> Result<IngestOutcome, IngestError> {
    tokio::task::spawn_blocking(move || {
        dispatcher.ingest(
            IngestInput::Http {
                sensor_id,
                reading: &reading,
            },
            OffsetDateTime::now_utc(),
        )
    })
    .await
    .map_err(|e| IngestError::Worker(e.to_string()))?
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::tests::{broker_input, memory_db};
    use crate::fanout::FanoutEvent;
    use crate::models::{ConnectivityState, Protocol, SensorFilter, ThresholdAlert};
    use crate::reading_store::ReadingStore;
    use crate::sensor_registry::{SensorRegistration, SensorRegistry, SensorSettings};
    use serde_json::json;
    use time::macros::datetime;
    use tokio::sync::broadcast::error::TryRecvError;

    pub(crate) struct Harness {
        pub db: Arc<DatabaseService>,
        pub dispatcher: MessageDispatcher,
        pub registry: SensorRegistry,
        pub readings: ReadingStore,
        pub fanout: RealtimeFanout,
    }

    pub(crate) fn harness() -> Harness {
        let db = Arc::new(memory_db());
        let fanout = RealtimeFanout::new(64);
        Harness {
            dispatcher: MessageDispatcher::new(db.clone(), fanout.clone(), 5),
            registry: SensorRegistry::new(db.clone(), 5),
            readings: ReadingStore::new(db.clone()),
            fanout,
            db,
        }
    }

    const NOW: OffsetDateTime = datetime!(2026-04-10 09:00 UTC);

    fn broker(h: &Harness, prefix: &str, topics: &[&str]) -> BrokerConfig {
        h.db.insert_broker_config(&broker_input("field", prefix, topics)).unwrap()
    }

    fn ingest(h: &Harness, config: &BrokerConfig, topic: &str, payload: &[u8]) -> IngestOutcome {
        h.dispatcher
            .ingest(
                IngestInput::Broker {
                    config,
                    topic,
                    payload,
                },
                NOW,
            )
            .unwrap()
    }

    fn count(h: &Harness, sql: &str) -> i64 {
        let conn = h.db.conn().unwrap();
        conn.query_row(sql, [], |row| row.get(0)).unwrap()
    }

    #[test]
    fn first_humidity_message_discovers_sensor_and_type() {
        let h = harness();
        let config = broker(&h, "agrotech/", &["soil/1"]);
        let mut rx = h.fanout.subscribe();

        let outcome = ingest(
            &h,
            &config,
            "agrotech/soil/1",
            br#"{"tipo":"HUMEDAD","unidad":"%","valor":42}"#,
        );

        assert!(outcome.discovered);
        assert_eq!(outcome.sensor.topic, "agrotech/soil/1");
        assert_eq!(outcome.sensor.last_value.as_deref(), Some("42"));
        assert_eq!(outcome.sensor.state, ConnectivityState::Connected);
        assert_eq!(outcome.reading.value, "42");

        let types = h.registry.list_types().unwrap();
        assert_eq!(types.len(), 1);
        assert_eq!(types[0].name, "HUMEDAD");
        assert_eq!(types[0].unit.as_deref(), Some("%"));
        assert_eq!(h.readings.count_for_sensor(outcome.sensor.id).unwrap(), 1);

        assert!(matches!(rx.try_recv().unwrap(), FanoutEvent::Reading(_)));
        assert!(matches!(rx.try_recv().unwrap(), FanoutEvent::SensorChanged(_)));
    }

    #[test]
    fn discovery_counts_sensors_per_topic_and_types_per_name() {
        let h = harness();
        let config = broker(&h, "farm/", &[]);
        let messages = [
            ("farm/a", r#"{"tipo":"TEMP","valor":20}"#),
            ("farm/b", r#"{"tipo":"TEMP","valor":21}"#),
            ("farm/c", r#"{"tipo":"HUMEDAD","valor":50}"#),
            ("farm/d", r#"{"tipo":"PH","valor":6.5}"#),
            ("farm/e", r#"{"tipo":"ph","valor":6.7}"#),
        ];
        for (topic, payload) in messages {
            assert!(ingest(&h, &config, topic, payload.as_bytes()).discovered);
        }

        assert_eq!(count(&h, "SELECT COUNT(*) FROM sensors"), 5);
        assert_eq!(count(&h, "SELECT COUNT(*) FROM sensor_types"), 3);
    }

    #[test]
    fn repeated_topic_updates_one_sensor_and_appends_readings() {
        let h = harness();
        let config = broker(&h, "", &[]);
        let first = ingest(&h, &config, "t/1", b"10");
        let second = ingest(&h, &config, "t/1", b"11");

        assert!(first.discovered);
        assert!(!second.discovered);
        assert_eq!(first.sensor.id, second.sensor.id);
        assert_eq!(second.sensor.last_value.as_deref(), Some("11"));
        assert_eq!(count(&h, "SELECT COUNT(*) FROM sensors"), 1);
        assert_eq!(h.readings.count_for_sensor(first.sensor.id).unwrap(), 2);
    }

    #[test]
    fn steady_state_messages_only_emit_reading_ticks() {
        let h = harness();
        let config = broker(&h, "", &[]);
        ingest(&h, &config, "t/1", b"10");

        let mut rx = h.fanout.subscribe();
        let outcome = ingest(&h, &config, "t/1", b"12");
        assert!(!outcome.sensor_changed());
        assert!(matches!(rx.try_recv().unwrap(), FanoutEvent::Reading(_)));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn malformed_payload_is_still_ingested_as_text() {
        let h = harness();
        let config = broker(&h, "", &[]);
        let outcome = ingest(&h, &config, "raw/1", b"not json at all");

        assert_eq!(outcome.reading.value, "not json at all");
        let sensor_type = h.registry.get_type(outcome.sensor.sensor_type_id).unwrap();
        assert_eq!(sensor_type.name, GENERIC_SENSOR_TYPE);
    }

    #[test]
    fn pushed_state_is_applied_directly() {
        let h = harness();
        let config = broker(&h, "", &[]);
        ingest(&h, &config, "t/1", b"1");
        let offline = ingest(&h, &config, "t/1", br#"{"valor":1,"estado":"DISCONNECTED"}"#);
        assert_eq!(offline.sensor.state, ConnectivityState::Disconnected);
        assert!(offline.state_changed);

        let back = ingest(&h, &config, "t/1", b"2");
        assert_eq!(back.sensor.state, ConnectivityState::Connected);
        assert!(back.state_changed);
    }

    #[test]
    fn provisioned_sensor_takes_declared_type() {
        let h = harness();
        let config = broker(&h, "farm/", &["soil/1"]);
        let provisioned = h.registry.provision_topics(&config, &config.default_topics).unwrap();

        let outcome = ingest(&h, &config, "farm/soil/1", br#"{"tipo":"HUMEDAD","valor":40}"#);
        assert!(!outcome.discovered);
        assert!(outcome.metadata_changed);
        assert_eq!(outcome.sensor.id, provisioned[0].id);
        let sensor_type = h.registry.get_type(outcome.sensor.sensor_type_id).unwrap();
        assert_eq!(sensor_type.name, "HUMEDAD");

        let again = ingest(&h, &config, "farm/soil/1", br#"{"tipo":"TEMP","valor":41}"#);
        assert!(!again.metadata_changed);
        assert_eq!(again.sensor.sensor_type_id, outcome.sensor.sensor_type_id);
    }

    fn http_sensor(h: &Harness) -> Sensor {
        h.registry
            .register_sensor(&SensorRegistration {
                name: "tank".to_string(),
                sensor_type: "NIVEL".to_string(),
                protocol: Protocol::Http,
                topic: None,
                plot_id: None,
                sub_plot_id: None,
                min_threshold: Some(10.0),
                max_threshold: Some(90.0),
            })
            .unwrap()
    }

    #[test]
    fn http_reading_requires_known_active_sensor() {
        let h = harness();
        let reading = HttpReading {
            value: json!(50),
            timestamp: None,
            metadata: None,
        };
        let unknown = h.dispatcher.ingest(
            IngestInput::Http {
                sensor_id: 999,
                reading: &reading,
            },
            NOW,
        );
        assert!(matches!(unknown, Err(IngestError::UnknownSensor(999))));

        let sensor = http_sensor(&h);
        h.registry
            .update_settings(
                sensor.id,
                &SensorSettings {
                    active: Some(false),
                    ..SensorSettings::default()
                },
            )
            .unwrap();
        let inactive = h.dispatcher.ingest(
            IngestInput::Http {
                sensor_id: sensor.id,
                reading: &reading,
            },
            NOW,
        );
        assert!(matches!(inactive, Err(IngestError::InactiveSensor(_))));
        assert_eq!(count(&h, "SELECT COUNT(*) FROM readings"), 0);
    }

    #[test]
    fn http_reading_flags_threshold_breaches() {
        let h = harness();
        let sensor = http_sensor(&h);
        let at = datetime!(2026-04-10 08:55 UTC);
        let reading = HttpReading {
            value: json!(95.5),
            timestamp: Some(at),
            metadata: Some(json!({"firmware": "1.2"})),
        };
        let outcome = h
            .dispatcher
            .ingest(
                IngestInput::Http {
                    sensor_id: sensor.id,
                    reading: &reading,
                },
                NOW,
            )
            .unwrap();

        assert_eq!(outcome.sensor.alert, Some(ThresholdAlert::AlertMax));
        assert_eq!(outcome.sensor.state, ConnectivityState::Connected);
        assert_eq!(outcome.reading.recorded_at, at);
        assert_eq!(outcome.sensor.last_seen_at, Some(NOW));
        assert!(outcome.metadata_changed);

        let listed = h
            .registry
            .list_sensors(&SensorFilter {
                sensor_type_id: Some(sensor.sensor_type_id),
                ..SensorFilter::default()
            })
            .unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn future_client_timestamps_cannot_pin_a_sensor() {
        let h = harness();
        let sensor = http_sensor(&h);
        let http = |value, timestamp, now| {
            let reading = HttpReading {
                value: json!(value),
                timestamp,
                metadata: None,
            };
            h.dispatcher.ingest(
                IngestInput::Http {
                    sensor_id: sensor.id,
                    reading: &reading,
                },
                now,
            )
        };

        let far = datetime!(2100-01-01 00:00 UTC);
        assert!(matches!(
            http(1, Some(far), NOW),
            Err(IngestError::InvalidTimestamp(at)) if at == far
        ));
        assert_eq!(h.readings.count_for_sensor(sensor.id).unwrap(), 0);

        // Small drift is accepted but stored at the server time.
        let drifted = http(2, Some(NOW + time::Duration::minutes(2)), NOW).unwrap();
        assert_eq!(drifted.reading.recorded_at, NOW);
        assert_eq!(drifted.sensor.last_seen_at, Some(NOW));

        let later = NOW + time::Duration::minutes(1);
        let fresh = http(3, None, later).unwrap();
        assert_eq!(fresh.sensor.last_value.as_deref(), Some("3"));
        assert_eq!(fresh.sensor.last_seen_at, Some(later));

        let registry = Arc::new(SensorRegistry::new(h.db.clone(), 5));
        let scheduler = crate::scheduler::ReconciliationScheduler::new(registry, h.fanout.clone());
        scheduler.run_sweep_at(later + time::Duration::days(30)).unwrap();
        assert_eq!(
            h.registry.get_sensor(sensor.id).unwrap().state,
            ConnectivityState::Disconnected
        );
    }

    #[tokio::test]
    async fn concurrent_first_messages_converge_on_one_sensor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("race.db");
        let db = Arc::new(DatabaseService::new(path.to_str().unwrap()).unwrap());
        db.initialize_db().unwrap();
        let config = Arc::new(db.insert_broker_config(&broker_input("race", "", &[])).unwrap());
        let dispatcher = Arc::new(MessageDispatcher::new(db.clone(), RealtimeFanout::new(64), 5));

        let mut handles = Vec::new();
        for i in 0..8 {
            handles.push(tokio::spawn(dispatch_broker_message(
                dispatcher.clone(),
                config.clone(),
                "new/topic".to_string(),
                Arc::new(format!(r#"{{"tipo":"TEMP","valor":{}}}"#, i).into_bytes()),
            )));
        }
        let mut discovered = 0;
        for handle in handles {
            let outcome = handle.await.unwrap().expect("ingested");
            if outcome.discovered {
                discovered += 1;
            }
        }

        let conn = db.conn().unwrap();
        let sensors: i64 = conn
            .query_row("SELECT COUNT(*) FROM sensors", [], |row| row.get(0))
            .unwrap();
        let readings: i64 = conn
            .query_row("SELECT COUNT(*) FROM readings", [], |row| row.get(0))
            .unwrap();
        assert_eq!(sensors, 1);
        assert_eq!(readings, 8);
        assert_eq!(discovered, 1);
    }
}
