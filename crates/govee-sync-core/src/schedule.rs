//! Poll planning.
//!
//! [`PollPlanner`] is a clock-free state machine: every method takes `now`,
//! so the scheduler task can drive it with the runtime's clock and tests can
//! drive it with plain instants.
//!
//! Devices in normal mode are polled round-robin, at most one every
//! `base_interval / device_count`, so a full rotation spreads over the
//! interval instead of bursting. First polls and boosted polls are not
//! spaced.

use crate::model::DeviceId;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

/// Poll cadence configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleConfig {
    /// Normal poll interval per device
    pub base_interval: Duration,
    /// Poll interval right after a command
    pub boost_interval: Duration,
    /// How long the boost lasts
    pub boost_duration: Duration,
    /// Inventory refresh interval
    pub list_interval: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(30),
            boost_interval: Duration::from_secs(5),
            boost_duration: Duration::from_secs(30),
            list_interval: Duration::from_secs(300),
        }
    }
}

/// Poll bookkeeping for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollIntervalState {
    /// Interval currently in force
    pub effective_interval: Duration,
    /// End of the current boost, if boosted
    pub boost_until: Option<Instant>,
    /// Last time a poll was dispatched
    pub last_poll: Option<Instant>,
    /// When the next poll is due
    pub next_poll: Instant,
}

impl PollIntervalState {
    fn is_boosted(&self, now: Instant) -> bool {
        self.boost_until.is_some_and(|until| now < until)
    }

    fn is_urgent(&self, now: Instant) -> bool {
        self.last_poll.is_none() || self.is_boosted(now)
    }
}

/// Devices that entered or left the inventory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InventoryChange {
    /// Newly listed devices
    pub added: Vec<DeviceId>,
    /// Devices no longer listed
    pub removed: Vec<DeviceId>,
}

impl InventoryChange {
    /// Whether nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Decides which devices to poll and when to refresh the inventory.
#[derive(Debug, Clone)]
pub struct PollPlanner {
    config: ScheduleConfig,
    devices: BTreeMap<DeviceId, PollIntervalState>,
    last_list: Option<Instant>,
    list_forced: bool,
    last_normal_dispatch: Option<Instant>,
}

impl PollPlanner {
    /// Create an empty planner.
    #[must_use]
    pub fn new(config: ScheduleConfig) -> Self {
        Self {
            config,
            devices: BTreeMap::new(),
            last_list: None,
            list_forced: false,
            last_normal_dispatch: None,
        }
    }

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> &ScheduleConfig {
        &self.config
    }

    /// Add a device with its first poll due immediately.
    /// Returns `false` if it was already known.
    pub fn add_device(&mut self, id: DeviceId, now: Instant) -> bool {
        if self.devices.contains_key(&id) {
            return false;
        }
        self.devices.insert(
            id,
            PollIntervalState {
                effective_interval: self.config.base_interval,
                boost_until: None,
                last_poll: None,
                next_poll: now,
            },
        );
        true
    }

    /// Drop a device from the rotation.
    pub fn remove_device(&mut self, id: &str) -> Option<PollIntervalState> {
        self.devices.remove(id)
    }

    /// Whether `id` is in the rotation.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    /// Number of devices in the rotation.
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether the rotation is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Poll bookkeeping for `id`.
    #[must_use]
    pub fn interval_state(&self, id: &str) -> Option<&PollIntervalState> {
        self.devices.get(id)
    }

    /// Replace the rotation with `ids`.
    pub fn sync_inventory<I>(&mut self, ids: I, now: Instant) -> InventoryChange
    where
        I: IntoIterator<Item = DeviceId>,
    {
        let listed: BTreeSet<DeviceId> = ids.into_iter().collect();

        let removed: Vec<DeviceId> = self
            .devices
            .keys()
            .filter(|id| !listed.contains(*id))
            .cloned()
            .collect();
        for id in &removed {
            self.devices.remove(id);
        }

        let added = listed
            .into_iter()
            .filter(|id| self.add_device(id.clone(), now))
            .collect();

        InventoryChange { added, removed }
    }

    /// Switch `id` to the boosted interval for the boost duration.
    /// Returns `false` for unknown devices.
    pub fn boost(&mut self, id: &str, now: Instant) -> bool {
        let config = self.config;
        let Some(state) = self.devices.get_mut(id) else {
            return false;
        };
        state.effective_interval = config.boost_interval;
        state.boost_until = Some(now + config.boost_duration);
        state.next_poll = state.next_poll.min(now + config.boost_interval);
        true
    }

    /// Interval in force for `id` at `now`.
    #[must_use]
    pub fn effective_interval(&self, id: &str, now: Instant) -> Option<Duration> {
        self.devices.get(id).map(|state| {
            if state.is_boosted(now) {
                self.config.boost_interval
            } else {
                self.config.base_interval
            }
        })
    }

    /// Mark `id` as polled at `now` and schedule its next poll.
    pub fn record_poll(&mut self, id: &str, now: Instant) {
        let config = self.config;
        if let Some(state) = self.devices.get_mut(id) {
            if !state.is_boosted(now) {
                state.boost_until = None;
                state.effective_interval = config.base_interval;
            }
            state.last_poll = Some(now);
            state.next_poll = now + state.effective_interval;
        }
    }

    /// Devices to poll now, oldest due first. Each returned device is
    /// recorded as polled.
    pub fn take_due(&mut self, now: Instant) -> Vec<DeviceId> {
        let mut due: Vec<(Instant, DeviceId, bool)> = self
            .devices
            .iter()
            .filter(|(_, state)| state.next_poll <= now)
            .map(|(id, state)| (state.next_poll, id.clone(), state.is_urgent(now)))
            .collect();
        due.sort();

        let mut normal_slot_free = self.normal_slot_at().map_or(true, |slot| slot <= now);
        let mut picked = Vec::new();
        for (_, id, urgent) in due {
            if urgent {
                picked.push(id);
            } else if normal_slot_free {
                normal_slot_free = false;
                self.last_normal_dispatch = Some(now);
                picked.push(id);
            }
        }

        for id in &picked {
            self.record_poll(id, now);
        }
        picked
    }

    /// Earliest instant at which a poll or inventory refresh is due.
    #[must_use]
    pub fn next_wakeup(&self, now: Instant) -> Instant {
        let normal_slot = self.normal_slot_at();
        let polls = self.devices.values().map(|state| {
            if state.is_urgent(now) {
                state.next_poll
            } else {
                normal_slot.map_or(state.next_poll, |slot| state.next_poll.max(slot))
            }
        });
        let list = self.next_list_at(now);
        polls.fold(list, Instant::min)
    }

    /// Whether the inventory should be refreshed.
    #[must_use]
    pub fn list_due(&self, now: Instant) -> bool {
        self.next_list_at(now) <= now
    }

    /// Mark the inventory as refreshed.
    pub fn record_list(&mut self, now: Instant) {
        self.last_list = Some(now);
        self.list_forced = false;
    }

    /// Request an inventory refresh at the next opportunity.
    pub fn force_list(&mut self) {
        self.list_forced = true;
    }

    /// Change the normal poll interval.
    pub fn set_base_interval(&mut self, interval: Duration, now: Instant) {
        self.config.base_interval = interval;
        for state in self.devices.values_mut() {
            if !state.is_boosted(now) {
                state.effective_interval = interval;
                if let Some(last) = state.last_poll {
                    state.next_poll = last + interval;
                }
            }
        }
    }

    /// Change the boosted poll interval. Running boosts keep their expiry.
    pub fn set_boost_interval(&mut self, interval: Duration, now: Instant) {
        self.config.boost_interval = interval;
        for state in self.devices.values_mut() {
            if state.is_boosted(now) {
                state.effective_interval = interval;
            }
        }
    }

    /// Change the inventory refresh interval.
    pub fn set_list_interval(&mut self, interval: Duration) {
        self.config.list_interval = interval;
    }

    fn next_list_at(&self, now: Instant) -> Instant {
        match self.last_list {
            _ if self.list_forced => now,
            None => now,
            Some(last) => last + self.config.list_interval,
        }
    }

    fn normal_slot_at(&self) -> Option<Instant> {
        let count = u32::try_from(self.devices.len()).unwrap_or(u32::MAX).max(1);
        self.last_normal_dispatch
            .map(|last| last + self.config.base_interval / count)
    }
}
