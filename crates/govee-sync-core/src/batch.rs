//! Per-device command batching.
//!
//! Change requests that arrive within one debounce window are collected in a
//! [`CommandBatch`] and merged into a single [`MergedCommand`].
//!
//! # Merge Rules
//!
//! | Situation | Result |
//! |-----------|--------|
//! | Same attribute requested twice | Last arrival wins |
//! | `color` and `color_temp` both requested | The one that arrived last wins |
//! | RGB kept, brightness not requested | Brightness derived from the brightest channel (local only) |
//! | RGB superseded by `color_temp`, brightness not requested | Brightness derived from the RGB is sent |
//! | Power off after light values | Light values dropped |
//! | Power off before light values | Power becomes on, since the light values switch it on |
//! | One ambient mode switched on | Other supported ambient modes derived off (local only) |
//! | Attribute not advertised by the device | Dropped |

use crate::model::{Attribute, AttributeValue, DeviceDescriptor, Rgb};
use crate::state::DeviceState;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Instant;

/// Default brightness scale when the device does not advertise a range.
const DEFAULT_BRIGHTNESS_MAX: i64 = 100;

/// One requested attribute change.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCommand {
    /// Target attribute
    pub attribute: Attribute,
    /// Requested value
    pub value: AttributeValue,
    /// Arrival time
    pub arrived_at: Instant,
}

impl PendingCommand {
    /// Create a pending command arriving at `arrived_at`.
    #[must_use]
    pub fn new(attribute: Attribute, value: AttributeValue, arrived_at: Instant) -> Self {
        Self {
            attribute,
            value,
            arrived_at,
        }
    }
}

/// Lifecycle of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPhase {
    /// Window open, accepting requests
    Collecting,
    /// Requests merged into a command
    Merged,
    /// Command handed to the remote API
    Sending,
    /// Remote API accepted the command
    Acked,
    /// Remote API call failed
    Failed,
}

impl BatchPhase {
    fn can_advance_to(self, next: BatchPhase) -> bool {
        matches!(
            (self, next),
            (BatchPhase::Collecting, BatchPhase::Merged)
                | (BatchPhase::Merged, BatchPhase::Sending)
                | (BatchPhase::Sending, BatchPhase::Acked | BatchPhase::Failed)
        )
    }
}

impl fmt::Display for BatchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BatchPhase::Collecting => "collecting",
            BatchPhase::Merged => "merged",
            BatchPhase::Sending => "sending",
            BatchPhase::Acked => "acked",
            BatchPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Requests collected for one device during one window.
#[derive(Debug, Clone)]
pub struct CommandBatch {
    pending: Vec<PendingCommand>,
    phase: BatchPhase,
}

impl Default for CommandBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandBatch {
    /// Create an empty collecting batch.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            phase: BatchPhase::Collecting,
        }
    }

    /// Record a request.
    ///
    /// # Errors
    ///
    /// Returns error if the batch is no longer collecting.
    pub fn push(&mut self, command: PendingCommand) -> Result<(), BatchError> {
        if self.phase != BatchPhase::Collecting {
            return Err(BatchError::NotCollecting(self.phase));
        }
        self.pending.push(command);
        Ok(())
    }

    /// Snapshot the collected requests and leave this batch empty and
    /// collecting again.
    #[must_use]
    pub fn take(&mut self) -> CommandBatch {
        std::mem::take(self)
    }

    /// Drop every collected request.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.phase = BatchPhase::Collecting;
    }

    /// Whether no requests were collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of collected requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Collected requests in arrival order.
    #[must_use]
    pub fn pending(&self) -> &[PendingCommand] {
        &self.pending
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> BatchPhase {
        self.phase
    }

    /// Advance to `next`.
    ///
    /// # Errors
    ///
    /// Returns error for transitions outside
    /// `collecting -> merged -> sending -> {acked | failed}`.
    pub fn advance(&mut self, next: BatchPhase) -> Result<(), BatchError> {
        if !self.phase.can_advance_to(next) {
            return Err(BatchError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        self.phase = next;
        Ok(())
    }

    /// Merge the collected requests against the device's capabilities.
    ///
    /// # Errors
    ///
    /// Returns error if the batch is not collecting.
    pub fn merge(&mut self, descriptor: &DeviceDescriptor) -> Result<MergedCommand, BatchError> {
        self.advance(BatchPhase::Merged)?;

        let mut ordered: Vec<&PendingCommand> = self.pending.iter().collect();
        ordered.sort_by_key(|cmd| cmd.arrived_at);

        let mut values = BTreeMap::new();
        let mut local = BTreeMap::new();
        let mut last_color_mode = None;
        let mut last_rgb: Option<Rgb> = None;
        let mut power_at = None;
        let mut light_at = None;

        for (index, cmd) in ordered.into_iter().enumerate() {
            if !descriptor.supports(cmd.attribute) {
                tracing::warn!(
                    device_id = %descriptor.id,
                    attribute = %cmd.attribute,
                    value = %cmd.value,
                    "Dropping request for unsupported attribute"
                );
                continue;
            }
            if cmd.attribute == Attribute::Power {
                power_at = Some(index);
            }
            if cmd.attribute.implies_power_on() {
                light_at = Some(index);
            }
            if cmd.attribute.is_color_mode() {
                last_color_mode = Some(cmd.attribute);
            }
            if let (Attribute::Color, AttributeValue::Rgb(rgb)) = (cmd.attribute, &cmd.value) {
                last_rgb = Some(*rgb);
            }
            values.insert(cmd.attribute, cmd.value.clone());
        }

        // color and color_temp are mutually exclusive
        let loser = match last_color_mode {
            Some(Attribute::ColorTemp) => Some(Attribute::Color),
            Some(Attribute::Color) => Some(Attribute::ColorTemp),
            _ => None,
        };
        if let Some(loser) = loser {
            if values.remove(&loser).is_some() {
                tracing::debug!(device_id = %descriptor.id, dropped = %loser, "Color mode superseded");
            }
        }

        // any light value switches the device on
        let power_off = values.get(&Attribute::Power) == Some(&AttributeValue::Switch(false));
        if let (true, Some(power_at), Some(light_at)) = (power_off, power_at, light_at) {
            if power_at > light_at {
                values.retain(|attr, _| !attr.implies_power_on());
                last_rgb = None;
                tracing::debug!(device_id = %descriptor.id, "Power off supersedes light values");
            } else {
                values.insert(Attribute::Power, AttributeValue::Switch(true));
                tracing::debug!(device_id = %descriptor.id, "Light values supersede power off");
            }
        }

        if let Some(rgb) = last_rgb {
            if !values.contains_key(&Attribute::Brightness) {
                if let Some(level) = derive_brightness(descriptor, rgb) {
                    tracing::debug!(
                        device_id = %descriptor.id,
                        brightness = level,
                        "Derived brightness from color"
                    );
                    let level = AttributeValue::Level(level);
                    if values.contains_key(&Attribute::Color) {
                        // the color already carries its intensity
                        local.insert(Attribute::Brightness, level);
                    } else if values.contains_key(&Attribute::ColorTemp) {
                        values.insert(Attribute::Brightness, level);
                    }
                }
            }
        }

        let enabled_mode = values
            .iter()
            .find(|(attr, value)| attr.is_ambient_mode() && value.as_switch() == Some(true))
            .map(|(attr, _)| *attr);
        if let Some(enabled) = enabled_mode {
            for cap in &descriptor.capabilities {
                let other = cap.attribute;
                if other.is_ambient_mode() && other != enabled && !values.contains_key(&other) {
                    local.insert(other, AttributeValue::Switch(false));
                }
            }
        }

        Ok(MergedCommand { values, local })
    }
}

/// Brightness implied by a color, scaled to the device's brightness range.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn derive_brightness(descriptor: &DeviceDescriptor, rgb: Rgb) -> Option<u32> {
    let cap = descriptor.capability(Attribute::Brightness)?;
    let intensity = i64::from(rgb.max_channel());
    if intensity == 0 {
        return None;
    }
    let max = cap.range.map_or(DEFAULT_BRIGHTNESS_MAX, |r| r.max).max(1);
    let min = cap.range.map_or(1, |r| r.min).max(0);
    let scaled = (intensity * max + 127) / 255;
    u32::try_from(scaled.clamp(min, max)).ok()
}

/// Result of merging a batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedCommand {
    /// Values to send to the remote API, in send order
    pub values: BTreeMap<Attribute, AttributeValue>,
    /// Values derived for local state only, never sent
    pub local: BTreeMap<Attribute, AttributeValue>,
}

impl MergedCommand {
    /// Whether there is nothing to send.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Fill in anchors that partial settings need from the device's
    /// last-known state. Settings whose anchor is unknown are dropped and
    /// returned.
    pub fn complete_from(&mut self, state: &DeviceState) -> Vec<Attribute> {
        let missing: BTreeSet<Attribute> = self
            .values
            .keys()
            .map(Attribute::anchor)
            .filter(|anchor| !self.values.contains_key(anchor))
            .collect();

        let mut dropped = Vec::new();
        for anchor in missing {
            if let Some(current) = state.value(anchor) {
                self.values.insert(anchor, current.clone());
            } else {
                let orphans: Vec<Attribute> = self
                    .values
                    .keys()
                    .filter(|attr| attr.anchor() == anchor)
                    .copied()
                    .collect();
                for attr in orphans {
                    self.values.remove(&attr);
                    dropped.push(attr);
                }
            }
        }
        dropped
    }

    /// Everything to apply to local state once the command is accepted.
    #[must_use]
    pub fn optimistic_values(&self) -> BTreeMap<Attribute, AttributeValue> {
        let mut all = self.local.clone();
        all.extend(self.values.iter().map(|(k, v)| (*k, v.clone())));
        all
    }
}

impl fmt::Display for MergedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .values
            .iter()
            .map(|(attr, value)| format!("{attr}={value}"))
            .collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

/// Errors for batch lifecycle misuse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BatchError {
    /// Request pushed after the window closed
    #[error("batch is {0}, not collecting")]
    NotCollecting(BatchPhase),
    /// Illegal phase transition
    #[error("invalid batch transition {from} -> {to}")]
    InvalidTransition {
        /// Current phase
        from: BatchPhase,
        /// Requested phase
        to: BatchPhase,
    },
}
