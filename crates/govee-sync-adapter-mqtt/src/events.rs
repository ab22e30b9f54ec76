//! Inbound bus events.

use govee_sync_proto::{
    is_birth_message, ChangeRequest, ChangeSet, MessageError, ServiceRequest, TopicKind,
    TopicScheme,
};

/// A parsed inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// Attribute change requested for a device
    Change(ChangeRequest),
    /// Runtime command for the bridge
    Service(ServiceRequest),
    /// Home automation came online and wants everything republished
    DiscoveryOnline,
}

impl BusEvent {
    /// Parse the events carried by one MQTT message.
    ///
    /// A JSON change object yields one event per recognized attribute.
    /// Home-automation `offline` messages yield nothing.
    ///
    /// # Errors
    ///
    /// Returns error if the topic is outside the scheme or the payload
    /// cannot be decoded.
    pub fn parse(
        scheme: &TopicScheme,
        topic: &str,
        payload: &[u8],
    ) -> Result<Vec<Self>, EventParseError> {
        let kind = scheme
            .parse(topic)
            .ok_or_else(|| EventParseError::InvalidTopic(topic.to_string()))?;

        match kind {
            TopicKind::DeviceCommand {
                device_id,
                attribute,
            } => {
                let set = ChangeSet::decode(&device_id, attribute.as_deref(), payload)?;
                if !set.ignored.is_empty() {
                    tracing::debug!(
                        device_id = %device_id,
                        ignored = ?set.ignored,
                        "Ignoring unknown keys in change request"
                    );
                }
                Ok(set.requests.into_iter().map(Self::Change).collect())
            }
            TopicKind::ServiceCommand { name } => {
                Ok(vec![Self::Service(ServiceRequest::decode(&name, payload)?)])
            }
            TopicKind::DiscoveryStatus => Ok(if is_birth_message(payload) {
                vec![Self::DiscoveryOnline]
            } else {
                Vec::new()
            }),
        }
    }
}

/// Errors that can occur parsing bus events.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EventParseError {
    /// Topic is not one the bridge handles
    #[error("invalid topic: {0}")]
    InvalidTopic(String),
    /// Payload could not be decoded
    #[error(transparent)]
    Message(#[from] MessageError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use govee_sync_core::{Attribute, AttributeValue};
    use std::time::Duration;

    #[test]
    fn parse_json_change() {
        let scheme = TopicScheme::default();
        let events = BusEvent::parse(
            &scheme,
            "govee2mqtt/AABBCC/set",
            br#"{"state":"ON","brightness":80}"#,
        )
        .unwrap();

        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| matches!(
            e,
            BusEvent::Change(ChangeRequest { device_id, .. }) if device_id == "AABBCC"
        )));
    }

    #[test]
    fn parse_attribute_change() {
        let scheme = TopicScheme::default();
        let events =
            BusEvent::parse(&scheme, "govee2mqtt/AABBCC/set/color_temp", b"4000").unwrap();

        assert_eq!(
            events,
            vec![BusEvent::Change(ChangeRequest {
                device_id: "AABBCC".into(),
                attribute: Attribute::ColorTemp,
                value: AttributeValue::Kelvin(4000),
            })]
        );
    }

    #[test]
    fn parse_service_and_status() {
        let scheme = TopicScheme::default();

        assert_eq!(
            BusEvent::parse(&scheme, "govee2mqtt/service/rescan_interval/set", b"600").unwrap(),
            vec![BusEvent::Service(ServiceRequest::RescanInterval(
                Duration::from_secs(600)
            ))]
        );
        assert_eq!(
            BusEvent::parse(&scheme, "homeassistant/status", b"online").unwrap(),
            vec![BusEvent::DiscoveryOnline]
        );
        assert!(BusEvent::parse(&scheme, "homeassistant/status", b"offline")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn parse_errors() {
        let scheme = TopicScheme::default();

        assert!(matches!(
            BusEvent::parse(&scheme, "elsewhere/AABBCC/set", b"{}"),
            Err(EventParseError::InvalidTopic(_))
        ));
        assert!(matches!(
            BusEvent::parse(&scheme, "govee2mqtt/AABBCC/set", b"ON"),
            Err(EventParseError::Message(_))
        ));
    }
}
