//! # govee-sync Protocol
//!
//! MQTT topic scheme and JSON payloads exchanged with the bus.
//!
//! ## Topics
//!
//! Device topics: `{prefix}/{device_id}/{state|availability|set|set/{attribute}}`
//!
//! Service topics: `{prefix}/service/{state|{name}/set}`
//!
//! ## Payloads
//!
//! - Change requests: a JSON object of attributes, or one raw value
//! - `StateSnapshot`: flattened attribute values plus confirmation metadata
//! - `ServiceRequest`: runtime interval changes and rediscovery

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod messages;
pub mod topics;

pub use messages::{
    encode_service_status, is_birth_message, ChangeRequest, ChangeSet, MessageError,
    ServiceRequest, StateSnapshot,
};
pub use topics::{TopicKind, TopicScheme, OFFLINE, ONLINE};
