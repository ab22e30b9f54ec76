//! # MQTT Adapter
//!
//! Connects govee-sync to an MQTT broker.
//!
//! ## Inbound
//!
//! The bridge subscribes to:
//! - `{prefix}/+/set` and `{prefix}/+/set/+`: device change requests
//! - `{prefix}/service/+/set`: runtime service commands
//! - `{discovery_prefix}/status`: home-automation birth messages
//!
//! and turns them into [`BusEvent`]s.
//!
//! ## Outbound
//!
//! [`MqttStateSink`] publishes retained state snapshots, availability and
//! bridge status.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod events;
pub mod publisher;
pub mod subscriber;

pub use events::{BusEvent, EventParseError};
pub use publisher::MqttStateSink;
pub use subscriber::{MqttBridge, MqttBridgeConfig, SubscriberError};
