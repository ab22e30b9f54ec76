//! Capabilities consumed from the outside world.
//!
//! [`RemoteApi`] is the vendor cloud; [`StateSink`] is whatever publishes
//! state downstream. Both are traits so the agent can run against fakes.

use crate::model::{Attribute, AttributeValue, DeviceDescriptor, DeviceId};
use crate::state::DeviceState;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Values reported by the remote API for one device.
pub type Reported = BTreeMap<Attribute, AttributeValue>;

/// One remote `sendCommand` call.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Command {
    /// Values to set, in send order
    pub values: BTreeMap<Attribute, AttributeValue>,
}

impl Command {
    /// A command setting a single attribute.
    #[must_use]
    pub fn single(attribute: Attribute, value: AttributeValue) -> Self {
        Self {
            values: BTreeMap::from([(attribute, value)]),
        }
    }

    /// Attributes this command touches.
    pub fn attributes(&self) -> impl Iterator<Item = Attribute> + '_ {
        self.values.keys().copied()
    }
}

/// Acknowledgement of an accepted command.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Ack {
    /// Values the API echoed back, if any
    pub reported: Reported,
}

/// Errors returned by the remote API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// Timeout, connection reset, server-side hiccup
    #[error("transient failure: {0}")]
    Transient(String),
    /// The API refused the call because its own quota was hit
    #[error("remote rate limit reached")]
    RateLimited,
    /// Invalid parameter, out-of-range value, unsupported capability
    #[error("rejected ({status}): {message}")]
    Rejected {
        /// Vendor or HTTP status code
        status: u16,
        /// Vendor message
        message: String,
    },
    /// The response could not be interpreted
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ApiError {
    /// Whether retrying the same call may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transient(_))
    }
}

/// The vendor cloud API.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Fetch the device inventory.
    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, ApiError>;

    /// Fetch current state of one device.
    async fn get_state(&self, device: &DeviceDescriptor) -> Result<Reported, ApiError>;

    /// Apply a command to one device.
    async fn send_command(
        &self,
        device: &DeviceDescriptor,
        command: &Command,
    ) -> Result<Ack, ApiError>;
}

/// Snapshot of the bridge itself, published alongside device state.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceStatus {
    /// Calls made in the current rolling window
    pub calls_in_window: usize,
    /// Call ceiling for the window
    pub quota: usize,
    /// Whether calls are currently being held back
    pub rate_limited: bool,
    /// Known devices
    pub devices: usize,
    /// Normal poll interval, seconds
    pub refresh_interval: u64,
    /// Boosted poll interval, seconds
    pub boost_interval: u64,
    /// Inventory refresh interval, seconds
    pub rescan_interval: u64,
}

/// Errors publishing downstream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    /// Encoding failed
    #[error("encoding error: {0}")]
    Encoding(String),
    /// The transport refused the message
    #[error("publish failed: {0}")]
    Publish(String),
}

/// Downstream consumer of state changes.
#[async_trait]
pub trait StateSink: Send + Sync {
    /// Publish a device snapshot.
    async fn publish_state(&self, state: &DeviceState) -> Result<(), SinkError>;

    /// Publish whether a device is present in the inventory.
    async fn publish_availability(&self, device_id: &DeviceId, online: bool)
        -> Result<(), SinkError>;

    /// Publish bridge status.
    async fn publish_service(&self, status: &ServiceStatus) -> Result<(), SinkError>;
}
