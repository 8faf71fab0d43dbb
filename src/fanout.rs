use crate::models::{Reading, Sensor};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingTick {
    pub sensor_id: i64,
    pub value: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum FanoutEvent {
    /// Sent for every ingested value.
    Reading(ReadingTick),
    /// Sent on discovery, connectivity transitions and metadata changes.
    SensorChanged(Sensor),
}

impl FanoutEvent {
    pub fn name(&self) -> &'static str {
        match self {
            FanoutEvent::Reading(_) => "reading",
            FanoutEvent::SensorChanged(_) => "sensorChanged",
        }
    }
}

/// Boundary to the real-time layer. Publishing never blocks; receivers that
/// fall behind lose the oldest events.
#[derive(Clone)]
pub struct RealtimeFanout {
    tx: broadcast::Sender<FanoutEvent>,
}

impl RealtimeFanout {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FanoutEvent> {
        self.tx.subscribe()
    }

    pub fn emit_reading(&self, reading: &Reading) {
        self.publish(FanoutEvent::Reading(ReadingTick {
            sensor_id: reading.sensor_id,
            value: reading.value.clone(),
            timestamp: reading.recorded_at,
        }));
    }

    pub fn emit_sensor_changed(&self, sensor: &Sensor) {
        self.publish(FanoutEvent::SensorChanged(sensor.clone()));
    }

    fn publish(&self, event: FanoutEvent) {
        // An error only means nobody is listening right now.
        if self.tx.send(event).is_err() {
            trace!("No realtime subscribers; event dropped.");
        }
    }
}
