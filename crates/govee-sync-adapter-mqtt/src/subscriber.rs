//! MQTT bridge: connection, subscriptions and the inbound event loop.

use crate::events::{BusEvent, EventParseError};
use crate::publisher::MqttStateSink;
use govee_sync_proto::TopicScheme;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

/// Configuration for the MQTT bridge.
#[derive(Debug, Clone)]
pub struct MqttBridgeConfig {
    /// MQTT broker URL (e.g., <tcp://localhost:1883>)
    pub mqtt_broker: String,
    /// Client ID for MQTT connection
    pub client_id: String,
    /// Optional username
    pub username: Option<String>,
    /// Optional password
    pub password: Option<String>,
    /// Keep-alive interval
    pub keep_alive: Duration,
    /// Topic layout
    pub topics: TopicScheme,
}

impl Default for MqttBridgeConfig {
    fn default() -> Self {
        Self {
            mqtt_broker: "tcp://localhost:1883".to_string(),
            client_id: "govee-sync".to_string(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(30),
            topics: TopicScheme::default(),
        }
    }
}

/// MQTT connection shared by the inbound loop and the state sink.
pub struct MqttBridge {
    client: AsyncClient,
    eventloop: EventLoop,
    config: MqttBridgeConfig,
}

impl MqttBridge {
    /// Create a new bridge. Nothing is sent until [`MqttBridge::start`]
    /// drives the event loop.
    ///
    /// # Errors
    ///
    /// Returns error if the broker URL is invalid.
    pub fn new(config: MqttBridgeConfig) -> Result<Self, SubscriberError> {
        let (host, port) = parse_mqtt_url(&config.mqtt_broker)?;

        let mut mqtt_options = MqttOptions::new(&config.client_id, host, port);
        mqtt_options.set_keep_alive(config.keep_alive);
        if let Some(username) = &config.username {
            mqtt_options.set_credentials(
                username.clone(),
                config.password.clone().unwrap_or_default(),
            );
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, 100);

        Ok(Self {
            client,
            eventloop,
            config,
        })
    }

    /// Topic layout in use.
    #[must_use]
    pub fn topics(&self) -> &TopicScheme {
        &self.config.topics
    }

    /// Sink publishing through this connection.
    #[must_use]
    pub fn sink(&self) -> MqttStateSink {
        MqttStateSink::new(self.client.clone(), self.config.topics.clone())
    }

    /// Subscribe to change requests, service commands and birth messages.
    ///
    /// # Errors
    ///
    /// Returns error if a subscription request cannot be queued.
    pub async fn subscribe(&self) -> Result<(), SubscriberError> {
        for topic in self.config.topics.subscriptions() {
            tracing::info!(topic, "Subscribing");

            self.client
                .subscribe(&topic, QoS::AtLeastOnce)
                .await
                .map_err(|e| SubscriberError::Subscribe(e.to_string()))?;
        }
        Ok(())
    }

    /// Drive the connection and receive events.
    ///
    /// Returns a channel receiver for parsed events. The loop ends when the
    /// receiver is dropped.
    pub fn start(mut self) -> mpsc::Receiver<Result<BusEvent, EventParseError>> {
        let (tx, rx) = mpsc::channel(100);
        let topics = self.config.topics.clone();
        let client = self.client.clone();

        tokio::spawn(async move {
            let mut connected_before = false;
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let topic = publish.topic.clone();
                        let payload_len = publish.payload.len();

                        tracing::debug!(topic, payload_len, "Received MQTT message");

                        let events = match BusEvent::parse(&topics, &topic, &publish.payload) {
                            Ok(events) => events.into_iter().map(Ok).collect(),
                            Err(err) => {
                                tracing::warn!(
                                    error = %err,
                                    topic = %topic,
                                    payload_len,
                                    "Failed to parse bus message"
                                );
                                vec![Err(err)]
                            }
                        };

                        for event in events {
                            if tx.send(event).await.is_err() {
                                tracing::warn!("Event receiver dropped, stopping bridge");
                                return;
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        tracing::info!("Connected to MQTT broker");
                        // the session is clean, so subscriptions do not survive a reconnect
                        if connected_before {
                            for filter in topics.subscriptions() {
                                if let Err(e) = client.subscribe(&filter, QoS::AtLeastOnce).await {
                                    tracing::error!(error = %e, filter, "Resubscribe failed");
                                }
                            }
                        }
                        connected_before = true;
                    }
                    Ok(Event::Incoming(Packet::SubAck(_))) => {
                        tracing::debug!("Subscription acknowledged");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(error = %e, "MQTT error");
                        // Try to reconnect after a delay
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
                if tx.is_closed() {
                    break;
                }
            }
        });

        rx
    }
}

/// Parse MQTT URL into host and port.
pub(crate) fn parse_mqtt_url(input: &str) -> Result<(String, u16), SubscriberError> {
    if input.contains("://") {
        let url =
            Url::parse(input).map_err(|e| SubscriberError::InvalidUrl(format!("{input}: {e}")))?;

        match url.scheme() {
            "tcp" | "mqtt" => {}
            scheme => {
                return Err(SubscriberError::InvalidUrl(format!(
                    "{input}: unsupported scheme '{scheme}'"
                )));
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| SubscriberError::InvalidUrl(format!("{input}: missing host")))?;
        let port = url.port().unwrap_or(1883);

        return Ok((host.to_string(), port));
    }

    let mut parts = input.split(':');
    let host = parts
        .next()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| SubscriberError::InvalidUrl(format!("{input}: missing host")))?;
    let port = match parts.next() {
        None => 1883,
        Some(port) => port
            .parse()
            .map_err(|_| SubscriberError::InvalidUrl(format!("{input}: invalid port '{port}'")))?,
    };
    if parts.next().is_some() {
        return Err(SubscriberError::InvalidUrl(format!(
            "{input}: too many ':' separators"
        )));
    }

    Ok((host.to_string(), port))
}

/// Errors that can occur with the bridge.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SubscriberError {
    /// Invalid MQTT URL
    #[error("invalid MQTT URL: {0}")]
    InvalidUrl(String),
    /// Subscription failed
    #[error("subscription error: {0}")]
    Subscribe(String),
    /// Connection error
    #[error("connection error: {0}")]
    Connection(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mqtt_url_tcp() {
        let (host, port) = parse_mqtt_url("tcp://localhost:1883").unwrap();
        assert_eq!(host, "localhost");
        assert_eq!(port, 1883);
    }

    #[test]
    fn parse_mqtt_url_default_port() {
        let (host, port) = parse_mqtt_url("mqtt://broker.example.com").unwrap();
        assert_eq!(host, "broker.example.com");
        assert_eq!(port, 1883);
    }

    #[test]
    fn parse_mqtt_url_no_scheme() {
        let (host, port) = parse_mqtt_url("mosquitto:1884").unwrap();
        assert_eq!(host, "mosquitto");
        assert_eq!(port, 1884);
    }

    #[test]
    fn parse_mqtt_url_rejects_bad_input() {
        assert!(parse_mqtt_url("ws://localhost:9001").is_err());
        assert!(parse_mqtt_url("localhost:port").is_err());
        assert!(parse_mqtt_url("a:1:2").is_err());
        assert!(parse_mqtt_url(":1883").is_err());
    }

    #[tokio::test]
    async fn bridge_creation_with_credentials() {
        let bridge = MqttBridge::new(MqttBridgeConfig {
            username: Some("user".into()),
            password: Some("secret".into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(bridge.topics().prefix, "govee2mqtt");
    }
}
