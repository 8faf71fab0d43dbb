//! Lenient payload decoding. Nothing here fails: a payload that is not a
//! structured object degrades to its raw text as the value.

use crate::models::ConnectivityState;
use serde_json::{Map, Value};

const TYPE_KEYS: &[&str] = &["tipo", "type", "sensorType"];
const UNIT_KEYS: &[&str] = &["unidad", "unit"];
const VALUE_KEYS: &[&str] = &["valor", "value", "val"];
const STATE_KEYS: &[&str] = &["estado", "state", "status"];
const NAME_KEYS: &[&str] = &["nombre", "name"];

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DecodedPayload {
    pub value: String,
    pub type_name: Option<String>,
    pub unit: Option<String>,
    pub name: Option<String>,
    pub state: Option<ConnectivityState>,
}

pub fn decode(payload: &[u8]) -> DecodedPayload {
    match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Object(map)) => decode_object(&map, payload),
        Ok(scalar) => DecodedPayload {
            value: value_text(&scalar),
            ..DecodedPayload::default()
        },
        Err(_) => DecodedPayload {
            value: raw_text(payload),
            ..DecodedPayload::default()
        },
    }
}

fn decode_object(map: &Map<String, Value>, payload: &[u8]) -> DecodedPayload {
    let value = lookup(map, VALUE_KEYS)
        .map(value_text)
        .unwrap_or_else(|| raw_text(payload));

    DecodedPayload {
        value,
        type_name: lookup(map, TYPE_KEYS).and_then(non_empty_text),
        unit: lookup(map, UNIT_KEYS).and_then(non_empty_text),
        name: lookup(map, NAME_KEYS).and_then(non_empty_text),
        state: lookup(map, STATE_KEYS).and_then(state_of),
    }
}

fn lookup<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| map.get(*key))
}

/// Text form of a JSON value as it is stored in a reading.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn non_empty_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn state_of(value: &Value) -> Option<ConnectivityState> {
    match value {
        Value::String(s) => ConnectivityState::parse(s),
        Value::Bool(true) => Some(ConnectivityState::Connected),
        Value::Bool(false) => Some(ConnectivityState::Disconnected),
        _ => None,
    }
}

fn raw_text(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_spanish_payload() {
        let decoded = decode(br#"{"tipo":"HUMEDAD","unidad":"%","valor":42}"#);
        assert_eq!(decoded.value, "42");
        assert_eq!(decoded.type_name.as_deref(), Some("HUMEDAD"));
        assert_eq!(decoded.unit.as_deref(), Some("%"));
        assert!(decoded.state.is_none());
    }

    #[test]
    fn english_keys_and_pushed_state() {
        let decoded = decode(br#"{"type":"temp","value":"21.5","state":"offline","name":"barn"}"#);
        assert_eq!(decoded.value, "21.5");
        assert_eq!(decoded.type_name.as_deref(), Some("temp"));
        assert_eq!(decoded.name.as_deref(), Some("barn"));
        assert_eq!(decoded.state, Some(ConnectivityState::Disconnected));
    }

    #[test]
    fn boolean_status_counts_as_pushed_state() {
        let decoded = decode(br#"{"valor":1,"status":true}"#);
        assert_eq!(decoded.state, Some(ConnectivityState::Connected));
    }

    #[test]
    fn bare_scalars_are_values_without_type() {
        assert_eq!(decode(b"17.25").value, "17.25");
        assert_eq!(decode(br#""dry""#).value, "dry");
        assert!(decode(b"17.25").type_name.is_none());
    }

    #[test]
    fn malformed_payload_degrades_to_raw_text() {
        let decoded = decode(b"  temp=21;hum=40 ");
        assert_eq!(decoded.value, "temp=21;hum=40");
        assert_eq!(
            decoded,
            DecodedPayload {
                value: "temp=21;hum=40".to_string(),
                ..DecodedPayload::default()
            }
        );

        let broken = decode(br#"{"tipo": "HUMEDAD", "valor": "#);
        assert_eq!(broken.value, r#"{"tipo": "HUMEDAD", "valor":"#);
        assert!(broken.type_name.is_none());
    }

    #[test]
    fn object_without_value_key_keeps_whole_payload() {
        let decoded = decode(br#"{"tipo":"GPS","lat":1.5}"#);
        assert_eq!(decoded.value, r#"{"tipo":"GPS","lat":1.5}"#);
        assert_eq!(decoded.type_name.as_deref(), Some("GPS"));
    }

    #[test]
    fn invalid_utf8_is_replaced_not_rejected() {
        let decoded = decode(&[0x66, 0xff, 0x6f]);
        assert_eq!(decoded.value, "f\u{fffd}o");
    }
}
