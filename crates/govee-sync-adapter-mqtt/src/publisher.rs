//! Retained state publishing.

use async_trait::async_trait;
use govee_sync_core::{DeviceId, DeviceState, ServiceStatus, SinkError, StateSink};
use govee_sync_proto::{encode_service_status, StateSnapshot, TopicScheme, OFFLINE, ONLINE};
use rumqttc::{AsyncClient, QoS};

/// [`StateSink`] publishing retained messages through an MQTT client.
#[derive(Clone)]
pub struct MqttStateSink {
    client: AsyncClient,
    topics: TopicScheme,
}

impl MqttStateSink {
    /// Wrap a connected client.
    #[must_use]
    pub fn new(client: AsyncClient, topics: TopicScheme) -> Self {
        Self { client, topics }
    }

    async fn publish(&self, topic: String, payload: Vec<u8>) -> Result<(), SinkError> {
        tracing::trace!(topic, payload_len = payload.len(), "Publishing");
        self.client
            .publish(topic, QoS::AtLeastOnce, true, payload)
            .await
            .map_err(|e| SinkError::Publish(e.to_string()))
    }

    /// Disconnect from the broker.
    ///
    /// # Errors
    ///
    /// Returns error if the request cannot be queued.
    pub async fn disconnect(&self) -> Result<(), SinkError> {
        self.client
            .disconnect()
            .await
            .map_err(|e| SinkError::Publish(e.to_string()))
    }
}

#[async_trait]
impl StateSink for MqttStateSink {
    async fn publish_state(&self, state: &DeviceState) -> Result<(), SinkError> {
        let payload = StateSnapshot::from_state(state)
            .to_json()
            .map_err(|e| SinkError::Encoding(e.to_string()))?;
        self.publish(self.topics.state(&state.device_id), payload)
            .await
    }

    async fn publish_availability(
        &self,
        device_id: &DeviceId,
        online: bool,
    ) -> Result<(), SinkError> {
        let payload = if online { ONLINE } else { OFFLINE };
        self.publish(self.topics.availability(device_id), payload.into())
            .await
    }

    async fn publish_service(&self, status: &ServiceStatus) -> Result<(), SinkError> {
        let payload =
            encode_service_status(status).map_err(|e| SinkError::Encoding(e.to_string()))?;
        self.publish(self.topics.service_state(), payload).await
    }
}
