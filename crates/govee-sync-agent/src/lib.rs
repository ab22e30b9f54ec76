//! # govee-sync Agent
//!
//! Runtime bridging the Govee cloud API with an MQTT bus.
//!
//! ## Architecture
//!
//! - [`SyncContext`] owns everything shared: the device inventory, the
//!   state cache, the rate-limited gateway and the root cancellation token.
//! - One [`CommandCoordinator`] task per device batches change requests
//!   and keeps at most one command in flight for that device.
//! - A single [`PollingScheduler`] task refreshes device state and the
//!   inventory, boosting devices that were just commanded.
//! - Every remote call goes through the [`RateLimitedGateway`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod gateway;
pub mod persistence;
pub mod runtime;
pub mod scheduler;

pub use cache::{DeviceStateCache, Inventory};
pub use config::AgentConfig;
pub use context::{SyncContext, SyncSettings};
pub use coordinator::{CommandCoordinator, SubmitError};
pub use gateway::{GatewayConfig, GatewayError, RateLimitedGateway};
pub use runtime::Agent;
pub use scheduler::{PollingScheduler, SchedulerSignal};
