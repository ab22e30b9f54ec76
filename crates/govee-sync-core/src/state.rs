//! Last-known device state and its overwrite rules.
//!
//! Every write to a device's state goes through one of two methods:
//! [`DeviceState::apply_report`] for values the remote API reported (poll
//! results, command acknowledgements) and [`DeviceState::apply_optimistic`]
//! for values a command just set. The per-attribute `authoritative` flag
//! decides which of them may touch an attribute.

use crate::model::{Attribute, AttributeValue, DeviceDescriptor, DeviceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One attribute's last-known value plus provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeEntry {
    /// Last-known value, if any was ever seen
    pub value: Option<AttributeValue>,
    /// `false` for attributes the remote API never reports back
    pub authoritative: bool,
    /// `true` once a poll or command acknowledgement verified the value
    pub confirmed: bool,
    /// When the value last changed
    pub updated_at: Option<DateTime<Utc>>,
}

impl AttributeEntry {
    fn empty(attribute: Attribute) -> Self {
        Self {
            value: None,
            authoritative: attribute.is_reported(),
            confirmed: false,
            updated_at: None,
        }
    }
}

/// Last-known state of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    /// Device identifier
    pub device_id: DeviceId,
    /// Per-attribute entries
    pub attributes: BTreeMap<Attribute, AttributeEntry>,
    /// Time of the last successful confirmation from the remote API
    pub last_confirmed: Option<DateTime<Utc>>,
}

impl DeviceState {
    /// Empty state for a device.
    #[must_use]
    pub fn new(device_id: impl Into<DeviceId>) -> Self {
        Self {
            device_id: device_id.into(),
            attributes: BTreeMap::new(),
            last_confirmed: None,
        }
    }

    /// Empty state with one entry per advertised capability.
    #[must_use]
    pub fn for_descriptor(descriptor: &DeviceDescriptor) -> Self {
        let mut state = Self::new(descriptor.id.clone());
        state.reconcile(descriptor);
        state
    }

    /// Add entries for capabilities the descriptor advertises but the state
    /// does not track yet. Existing entries are kept as they are.
    pub fn reconcile(&mut self, descriptor: &DeviceDescriptor) {
        for cap in &descriptor.capabilities {
            self.attributes
                .entry(cap.attribute)
                .or_insert_with(|| AttributeEntry::empty(cap.attribute));
        }
    }

    /// Last-known value of `attribute`.
    #[must_use]
    pub fn value(&self, attribute: Attribute) -> Option<&AttributeValue> {
        self.attributes
            .get(&attribute)
            .and_then(|entry| entry.value.as_ref())
    }

    /// Whether `attribute` has been verified by the remote API.
    #[must_use]
    pub fn is_confirmed(&self, attribute: Attribute) -> bool {
        self.attributes
            .get(&attribute)
            .is_some_and(|entry| entry.confirmed)
    }

    /// Whether the remote API can report `attribute` back.
    #[must_use]
    pub fn is_authoritative(&self, attribute: Attribute) -> bool {
        self.attributes
            .get(&attribute)
            .map_or(attribute.is_reported(), |entry| entry.authoritative)
    }

    /// Apply values reported by the remote API.
    ///
    /// Non-authoritative attributes are left untouched: the API cannot
    /// report them, so a report never overrides a locally inferred value.
    /// Returns `true` if any value changed.
    pub fn apply_report(
        &mut self,
        reported: &BTreeMap<Attribute, AttributeValue>,
        at: DateTime<Utc>,
    ) -> bool {
        let mut changed = false;

        for (attribute, value) in reported {
            let entry = self
                .attributes
                .entry(*attribute)
                .or_insert_with(|| AttributeEntry::empty(*attribute));

            if !entry.authoritative {
                tracing::trace!(
                    device_id = %self.device_id,
                    %attribute,
                    "Ignoring report for non-authoritative attribute"
                );
                continue;
            }

            if entry.value.as_ref() != Some(value) {
                entry.value = Some(value.clone());
                entry.updated_at = Some(at);
                changed = true;
            }
            entry.confirmed = true;
        }

        self.last_confirmed = Some(at);
        changed
    }

    /// Apply values a command has just set on the device.
    ///
    /// Attributes the API can report are marked confirmed; the others stay
    /// unconfirmed and are held purely from local knowledge.
    /// Returns `true` if any value changed.
    pub fn apply_optimistic(
        &mut self,
        values: &BTreeMap<Attribute, AttributeValue>,
        at: DateTime<Utc>,
    ) -> bool {
        let mut changed = false;

        for (attribute, value) in values {
            let entry = self
                .attributes
                .entry(*attribute)
                .or_insert_with(|| AttributeEntry::empty(*attribute));

            if entry.value.as_ref() != Some(value) {
                entry.value = Some(value.clone());
                entry.updated_at = Some(at);
                changed = true;
            }
            entry.confirmed = entry.authoritative;
        }

        changed
    }

    /// Current values keyed by attribute.
    #[must_use]
    pub fn values(&self) -> BTreeMap<Attribute, AttributeValue> {
        self.attributes
            .iter()
            .filter_map(|(attr, entry)| entry.value.clone().map(|v| (*attr, v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Capability;

    fn light() -> DeviceDescriptor {
        DeviceDescriptor::new(
            "AA:BB",
            "H6008",
            "Lamp",
            vec![
                Capability::new(Attribute::Power),
                Capability::with_range(Attribute::Brightness, 1, 100),
                Capability::new(Attribute::Gradient),
            ],
        )
    }

    #[test]
    fn entries_follow_capabilities() {
        let state = DeviceState::for_descriptor(&light());
        assert_eq!(state.attributes.len(), 3);
        assert!(state.is_authoritative(Attribute::Power));
        assert!(!state.is_authoritative(Attribute::Gradient));
        assert!(state.value(Attribute::Power).is_none());
    }

    #[test]
    fn report_confirms_authoritative_attributes() {
        let mut state = DeviceState::for_descriptor(&light());
        let now = Utc::now();
        let reported = BTreeMap::from([
            (Attribute::Power, AttributeValue::Switch(true)),
            (Attribute::Brightness, AttributeValue::Level(40)),
        ]);

        assert!(state.apply_report(&reported, now));
        assert!(state.is_confirmed(Attribute::Power));
        assert_eq!(
            state.value(Attribute::Brightness),
            Some(&AttributeValue::Level(40))
        );
        assert_eq!(state.last_confirmed, Some(now));

        // same report again changes nothing
        assert!(!state.apply_report(&reported, now));
    }

    #[test]
    fn report_never_overwrites_non_authoritative() {
        let mut state = DeviceState::for_descriptor(&light());
        let now = Utc::now();
        state.apply_optimistic(
            &BTreeMap::from([(Attribute::Gradient, AttributeValue::Switch(true))]),
            now,
        );

        let report = BTreeMap::from([(Attribute::Gradient, AttributeValue::Switch(false))]);
        assert!(!state.apply_report(&report, now));
        assert_eq!(
            state.value(Attribute::Gradient),
            Some(&AttributeValue::Switch(true))
        );
        assert!(!state.is_confirmed(Attribute::Gradient));
    }

    #[test]
    fn optimistic_confirms_only_reportable() {
        let mut state = DeviceState::for_descriptor(&light());
        let values = BTreeMap::from([
            (Attribute::Power, AttributeValue::Switch(true)),
            (Attribute::Gradient, AttributeValue::Switch(true)),
        ]);

        assert!(state.apply_optimistic(&values, Utc::now()));
        assert!(state.is_confirmed(Attribute::Power));
        assert!(!state.is_confirmed(Attribute::Gradient));
        assert!(state.last_confirmed.is_none());
    }
}
