//! JSON payloads exchanged with the bus.

use chrono::SecondsFormat;
use govee_sync_core::{Attribute, AttributeValue, DeviceId, DeviceState, ServiceStatus, ValueError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

/// One inbound attribute change.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRequest {
    /// Target device
    pub device_id: DeviceId,
    /// Target attribute
    pub attribute: Attribute,
    /// Requested value
    pub value: AttributeValue,
}

/// Changes decoded from one inbound message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    /// Recognized changes, ordered by key
    pub requests: Vec<ChangeRequest>,
    /// Keys that do not name a known attribute
    pub ignored: Vec<String>,
}

impl ChangeSet {
    /// Decode a message published to a device command topic.
    ///
    /// With `attribute` set the payload is a single value, either JSON
    /// (`80`, `true`, `[255,0,0]`) or bare text (`ON`, `255,0,0`).
    /// Without it the payload must be a JSON object keyed by attribute name.
    ///
    /// # Errors
    ///
    /// Returns error if the payload is not UTF-8, not an object where one
    /// is required, names an unknown attribute on a single-value topic, or
    /// carries a value of the wrong shape.
    pub fn decode(
        device_id: &str,
        attribute: Option<&str>,
        payload: &[u8],
    ) -> Result<Self, MessageError> {
        let text = std::str::from_utf8(payload).map_err(|_| MessageError::Utf8)?;
        let text = text.trim();

        if let Some(name) = attribute {
            let attribute: Attribute = name.parse()?;
            let raw = serde_json::from_str(text).unwrap_or_else(|_| Value::from(text));
            let value = AttributeValue::parse(attribute, &raw)?;
            return Ok(Self {
                requests: vec![ChangeRequest {
                    device_id: device_id.to_string(),
                    attribute,
                    value,
                }],
                ignored: Vec::new(),
            });
        }

        let object: Map<String, Value> = match serde_json::from_str(text) {
            Ok(Value::Object(object)) => object,
            Ok(_) => return Err(MessageError::NotAnObject),
            Err(e) => return Err(MessageError::Json(e.to_string())),
        };

        let mut set = Self::default();
        for (key, raw) in &object {
            let Ok(attribute) = key.parse::<Attribute>() else {
                set.ignored.push(key.clone());
                continue;
            };
            let value = AttributeValue::parse(attribute, raw)?;
            set.requests.push(ChangeRequest {
                device_id: device_id.to_string(),
                attribute,
                value,
            });
        }
        Ok(set)
    }
}

/// Runtime commands addressed to the bridge itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceRequest {
    /// Change the normal poll interval
    RefreshInterval(Duration),
    /// Change the inventory refresh interval
    RescanInterval(Duration),
    /// Change the boosted poll interval
    BoostInterval(Duration),
    /// Refresh the inventory now
    Rediscover,
}

impl ServiceRequest {
    /// Decode a message published to `{prefix}/service/{name}/set`.
    ///
    /// Interval payloads are whole or fractional seconds.
    ///
    /// # Errors
    ///
    /// Returns error for unknown commands or non-positive intervals.
    pub fn decode(name: &str, payload: &[u8]) -> Result<Self, MessageError> {
        let interval = || parse_interval(name, payload);
        match name {
            "refresh_interval" => interval().map(Self::RefreshInterval),
            "rescan_interval" => interval().map(Self::RescanInterval),
            "boost_interval" => interval().map(Self::BoostInterval),
            "rediscover" => Ok(Self::Rediscover),
            other => Err(MessageError::UnknownService(other.to_string())),
        }
    }
}

fn parse_interval(name: &str, payload: &[u8]) -> Result<Duration, MessageError> {
    let text = std::str::from_utf8(payload).map_err(|_| MessageError::Utf8)?;
    let invalid = || MessageError::InvalidInterval {
        name: name.to_string(),
        value: text.to_string(),
    };
    let seconds: f64 = text.trim().parse().map_err(|_| invalid())?;
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(invalid());
    }
    Ok(Duration::from_secs_f64(seconds))
}

/// Whether a home-automation status payload announces it came online.
#[must_use]
pub fn is_birth_message(payload: &[u8]) -> bool {
    payload.eq_ignore_ascii_case(crate::topics::ONLINE.as_bytes())
}

/// Retained snapshot published to `{prefix}/{device_id}/state`.
///
/// Attribute values are flattened into the top-level object so that
/// home-automation JSON schemas can read them directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Attribute values keyed by name
    #[serde(flatten)]
    pub values: BTreeMap<String, Value>,
    /// RFC 3339 time of the last confirmation from the remote API
    pub last_confirmed: Option<String>,
    /// Attributes whose value has not been verified by the remote API
    pub unconfirmed: Vec<String>,
}

impl StateSnapshot {
    /// Build a snapshot from device state.
    #[must_use]
    pub fn from_state(state: &DeviceState) -> Self {
        let mut values = BTreeMap::new();
        let mut unconfirmed = Vec::new();

        for (attribute, entry) in &state.attributes {
            let Some(value) = &entry.value else {
                continue;
            };
            values.insert(attribute.as_str().to_string(), value.to_json());
            if !entry.confirmed {
                unconfirmed.push(attribute.as_str().to_string());
            }
        }

        Self {
            values,
            last_confirmed: state
                .last_confirmed
                .map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true)),
            unconfirmed,
        }
    }

    /// Serialize to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<Vec<u8>, MessageError> {
        serde_json::to_vec(self).map_err(|e| MessageError::Serialize(e.to_string()))
    }

    /// Deserialize from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_json(bytes: &[u8]) -> Result<Self, MessageError> {
        serde_json::from_slice(bytes).map_err(|e| MessageError::Json(e.to_string()))
    }
}

/// Serialize bridge status to JSON bytes.
///
/// # Errors
///
/// Returns error if serialization fails.
pub fn encode_service_status(status: &ServiceStatus) -> Result<Vec<u8>, MessageError> {
    serde_json::to_vec(status).map_err(|e| MessageError::Serialize(e.to_string()))
}

/// Message errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MessageError {
    /// Payload is not UTF-8
    #[error("payload is not valid UTF-8")]
    Utf8,
    /// Payload is not valid JSON
    #[error("invalid JSON: {0}")]
    Json(String),
    /// A JSON object was required
    #[error("expected a JSON object")]
    NotAnObject,
    /// Attribute name or value rejected
    #[error(transparent)]
    Value(#[from] ValueError),
    /// Unknown service command
    #[error("unknown service command: {0}")]
    UnknownService(String),
    /// Interval is not a positive number of seconds
    #[error("invalid interval for {name}: {value}")]
    InvalidInterval {
        /// Command name
        name: String,
        /// Offending payload
        value: String,
    },
    /// Serialization failed
    #[error("serialization error: {0}")]
    Serialize(String),
}
