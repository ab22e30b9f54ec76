//! # govee-sync Core
//!
//! Pure model and rules shared by every govee-sync component.
//!
//! This crate provides:
//! - The device model: attributes, typed values, descriptors
//! - `DeviceState` with the single authoritative/confirmed overwrite rule
//! - Command batching with last-write-wins merge and derived attributes
//! - Per-model call splitting of merged commands
//! - The poll planner deciding when each device is refreshed
//! - The abstract remote API and state sink capabilities
//!
//! Nothing here performs I/O or owns a runtime.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod batch;
pub mod model;
pub mod plan;
pub mod schedule;
pub mod state;

pub use api::{Ack, ApiError, Command, RemoteApi, Reported, ServiceStatus, SinkError, StateSink};
pub use batch::{BatchError, BatchPhase, CommandBatch, MergedCommand, PendingCommand};
pub use model::{
    Attribute, AttributeValue, Capability, CommandStage, DeviceCategory, DeviceDescriptor, DeviceId,
    ModeOption, Rgb, ValueError, ValueRange,
};
pub use plan::{CallPlanner, SplitRule};
pub use schedule::{InventoryChange, PollIntervalState, PollPlanner, ScheduleConfig};
pub use state::{AttributeEntry, DeviceState};
