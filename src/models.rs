use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

/// Name of the placeholder type given to provisioned sensors and to traffic
/// that never declares a type.
pub const GENERIC_SENSOR_TYPE: &str = "GENERIC";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectivityState {
    Connected,
    Disconnected,
}

impl ConnectivityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectivityState::Connected => "CONNECTED",
            ConnectivityState::Disconnected => "DISCONNECTED",
        }
    }

    /// Parses stored values as well as the looser spellings devices push.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "CONNECTED" | "CONECTADO" | "ONLINE" | "ON" | "UP" => Some(ConnectivityState::Connected),
            "DISCONNECTED" | "DESCONECTADO" | "OFFLINE" | "OFF" | "DOWN" => {
                Some(ConnectivityState::Disconnected)
            }
            _ => None,
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Threshold breach recorded next to the connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThresholdAlert {
    AlertMin,
    AlertMax,
}

impl ThresholdAlert {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThresholdAlert::AlertMin => "ALERT_MIN",
            ThresholdAlert::AlertMax => "ALERT_MAX",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "ALERT_MIN" => Some(ThresholdAlert::AlertMin),
            "ALERT_MAX" => Some(ThresholdAlert::AlertMax),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Protocol {
    #[default]
    Mqtt,
    Http,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Mqtt => "MQTT",
            Protocol::Http => "HTTP",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "MQTT" => Some(Protocol::Mqtt),
            "HTTP" => Some(Protocol::Http),
            _ => None,
        }
    }
}

/// Connection profile for one message broker and the topics it watches.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerConfig {
    pub id: i64,
    pub name: String,
    pub broker: String,
    pub port: u16,
    pub protocol: Protocol,
    pub topic_prefix: String,
    pub default_topics: Vec<String>,
    pub custom_topics: Vec<String>,
    pub plot_id: Option<i64>,
    pub sub_plot_id: Option<i64>,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub active: bool,
    pub default_sensors_initialized: bool,
}

impl BrokerConfig {
    /// Full topic for a configured entry: prefix and entry joined by one `/`.
    pub fn full_topic(&self, entry: &str) -> String {
        join_topic(&self.topic_prefix, entry)
    }

    /// Every full topic this configuration subscribes to, deduplicated.
    pub fn subscription_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .default_topics
            .iter()
            .chain(self.custom_topics.iter())
            .map(|entry| self.full_topic(entry))
            .collect();
        topics.sort();
        topics.dedup();
        topics
    }

    /// True when switching from `self` to `other` needs a new socket.
    pub fn connection_differs(&self, other: &BrokerConfig) -> bool {
        self.broker != other.broker
            || self.port != other.port
            || self.protocol != other.protocol
            || self.username != other.username
            || self.password != other.password
    }
}

pub fn join_topic(prefix: &str, entry: &str) -> String {
    if prefix.is_empty() {
        entry.to_string()
    } else {
        format!("{}/{}", prefix.trim_end_matches('/'), entry.trim_start_matches('/'))
    }
}

/// Admin payload for creating or replacing a broker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerConfigInput {
    pub name: String,
    pub broker: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub topic_prefix: String,
    #[serde(default)]
    pub default_topics: Vec<String>,
    #[serde(default)]
    pub custom_topics: Vec<String>,
    #[serde(default, alias = "loteId")]
    pub plot_id: Option<i64>,
    #[serde(default, alias = "subLoteId")]
    pub sub_plot_id: Option<i64>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Absent means active on create and unchanged on update.
    #[serde(default, alias = "activo")]
    pub active: Option<bool>,
}

fn default_mqtt_port() -> u16 {
    1883
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorType {
    pub id: i64,
    pub name: String,
    pub unit: Option<String>,
    pub decimals: i64,
    pub ttl_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSensorType {
    pub name: String,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub decimals: Option<i64>,
    #[serde(default)]
    pub ttl_minutes: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Sensor {
    pub id: i64,
    pub name: String,
    pub sensor_type_id: i64,
    pub protocol: Protocol,
    pub topic: String,
    pub broker_config_id: Option<i64>,
    pub plot_id: Option<i64>,
    pub sub_plot_id: Option<i64>,
    pub min_threshold: Option<f64>,
    pub max_threshold: Option<f64>,
    pub last_value: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_reading_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen_at: Option<OffsetDateTime>,
    pub state: ConnectivityState,
    pub alert: Option<ThresholdAlert>,
    pub active: bool,
}

/// One ingested value. Values are kept as text so any payload fits.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub id: i64,
    pub sensor_id: i64,
    pub value: String,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorFilter {
    pub broker_config_id: Option<i64>,
    pub sensor_type_id: Option<i64>,
    #[serde(alias = "loteId")]
    pub plot_id: Option<i64>,
    #[serde(alias = "subLoteId")]
    pub sub_plot_id: Option<i64>,
    pub state: Option<ConnectivityState>,
    pub active: Option<bool>,
}

/// Millisecond precision is what the store keeps.
pub fn to_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn from_millis(millis: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}
