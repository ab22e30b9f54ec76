//! MQTT topic scheme.
//!
//! Topic structure:
//! - `{prefix}/{device_id}/state` retained JSON snapshot
//! - `{prefix}/{device_id}/availability` retained `online`/`offline`
//! - `{prefix}/{device_id}/set` JSON object of attribute changes
//! - `{prefix}/{device_id}/set/{attribute}` single raw value
//! - `{prefix}/service/state` bridge status
//! - `{prefix}/service/{name}/set` runtime commands
//! - `{discovery_prefix}/status` home-automation birth message

use serde::{Deserialize, Serialize};

/// Segment reserved for the bridge's own topics.
pub const SERVICE_SEGMENT: &str = "service";

/// Availability payloads.
pub const ONLINE: &str = "online";
/// See [`ONLINE`].
pub const OFFLINE: &str = "offline";

/// Topic scheme configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicScheme {
    /// Topic prefix (default: "govee2mqtt")
    pub prefix: String,
    /// Home-automation discovery prefix (default: "homeassistant")
    pub discovery_prefix: String,
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self {
            prefix: "govee2mqtt".to_string(),
            discovery_prefix: "homeassistant".to_string(),
        }
    }
}

impl TopicScheme {
    /// Create a topic scheme with the given prefixes.
    #[must_use]
    pub fn new(prefix: impl Into<String>, discovery_prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            discovery_prefix: discovery_prefix.into(),
        }
    }

    fn device(&self, device_id: &str) -> String {
        format!("{}/{}", self.prefix, device_id)
    }

    /// Topic for device state snapshots.
    #[must_use]
    pub fn state(&self, device_id: &str) -> String {
        format!("{}/state", self.device(device_id))
    }

    /// Topic for device availability.
    #[must_use]
    pub fn availability(&self, device_id: &str) -> String {
        format!("{}/availability", self.device(device_id))
    }

    /// Topic for JSON change requests.
    #[must_use]
    pub fn command(&self, device_id: &str) -> String {
        format!("{}/set", self.device(device_id))
    }

    /// Topic for a single-attribute change request.
    #[must_use]
    pub fn attribute_command(&self, device_id: &str, attribute: &str) -> String {
        format!("{}/set/{}", self.device(device_id), attribute)
    }

    /// Topic for bridge status.
    #[must_use]
    pub fn service_state(&self) -> String {
        format!("{}/{}/state", self.prefix, SERVICE_SEGMENT)
    }

    /// Topic for a runtime service command.
    #[must_use]
    pub fn service_command(&self, name: &str) -> String {
        format!("{}/{}/{}/set", self.prefix, SERVICE_SEGMENT, name)
    }

    /// Topic carrying the home-automation birth message.
    #[must_use]
    pub fn discovery_status(&self) -> String {
        format!("{}/status", self.discovery_prefix)
    }

    /// Filters the bridge subscribes to.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        vec![
            format!("{}/+/set", self.prefix),
            format!("{}/+/set/+", self.prefix),
            format!("{}/{}/+/set", self.prefix, SERVICE_SEGMENT),
            self.discovery_status(),
        ]
    }

    /// Classify an inbound topic.
    ///
    /// Returns `None` for topics outside the scheme.
    #[must_use]
    pub fn parse(&self, topic: &str) -> Option<TopicKind> {
        if topic == self.discovery_status() {
            return Some(TopicKind::DiscoveryStatus);
        }

        let remainder = topic.strip_prefix(&self.prefix)?.strip_prefix('/')?;
        let parts: Vec<&str> = remainder.split('/').collect();

        match parts.as_slice() {
            [SERVICE_SEGMENT, name, "set"] if !name.is_empty() => Some(TopicKind::ServiceCommand {
                name: (*name).to_string(),
            }),
            [device, "set"] if !device.is_empty() && *device != SERVICE_SEGMENT => {
                Some(TopicKind::DeviceCommand {
                    device_id: (*device).to_string(),
                    attribute: None,
                })
            }
            [device, "set", attribute]
                if !device.is_empty() && *device != SERVICE_SEGMENT && !attribute.is_empty() =>
            {
                Some(TopicKind::DeviceCommand {
                    device_id: (*device).to_string(),
                    attribute: Some((*attribute).to_string()),
                })
            }
            _ => None,
        }
    }
}

/// Inbound topic kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicKind {
    /// Change request for a device
    DeviceCommand {
        /// Target device
        device_id: String,
        /// Attribute name for single-value topics
        attribute: Option<String>,
    },
    /// Runtime service command
    ServiceCommand {
        /// Command name
        name: String,
    },
    /// Home-automation birth/will message
    DiscoveryStatus,
}
