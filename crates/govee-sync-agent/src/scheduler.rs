//! Adaptive polling.
//!
//! [`PollingScheduler`] is a single task that owns the [`PollPlanner`] and
//! drives every `getState` and `listDevices` call. Coordinators and the
//! bus reach it through [`SchedulerSignal`]s.

use crate::context::SyncContext;
use chrono::Utc;
use govee_sync_core::{DeviceId, PollPlanner, ScheduleConfig, ServiceStatus};
use govee_sync_proto::ServiceRequest;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Requests to the scheduler from other tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerSignal {
    /// A command batch landed; poll this device at the boost interval
    Boost(DeviceId),
    /// Refresh the inventory now
    Rediscover,
    /// Change the normal poll interval
    SetRefreshInterval(Duration),
    /// Change the boosted poll interval
    SetBoostInterval(Duration),
    /// Change the inventory refresh interval
    SetRescanInterval(Duration),
    /// Republish every device and the service state
    PublishAll,
}

impl From<ServiceRequest> for SchedulerSignal {
    fn from(request: ServiceRequest) -> Self {
        match request {
            ServiceRequest::RefreshInterval(interval) => SchedulerSignal::SetRefreshInterval(interval),
            ServiceRequest::RescanInterval(interval) => SchedulerSignal::SetRescanInterval(interval),
            ServiceRequest::BoostInterval(interval) => SchedulerSignal::SetBoostInterval(interval),
            ServiceRequest::Rediscover => SchedulerSignal::Rediscover,
        }
    }
}

/// Drives polls and inventory refreshes.
pub struct PollingScheduler {
    ctx: Arc<SyncContext>,
    planner: PollPlanner,
    signals: mpsc::UnboundedReceiver<SchedulerSignal>,
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}

impl PollingScheduler {
    /// Create a scheduler.
    #[must_use]
    pub fn new(
        ctx: Arc<SyncContext>,
        config: ScheduleConfig,
        signals: mpsc::UnboundedReceiver<SchedulerSignal>,
    ) -> Self {
        Self {
            ctx,
            planner: PollPlanner::new(config),
            signals,
        }
    }

    /// Run until the context is shut down.
    pub async fn run(mut self) {
        let cancel = self.ctx.shutdown_token();
        tracing::info!(
            base_secs = self.planner.config().base_interval.as_secs(),
            boost_secs = self.planner.config().boost_interval.as_secs(),
            list_secs = self.planner.config().list_interval.as_secs(),
            "Starting polling scheduler"
        );

        loop {
            let wake = Instant::from_std(self.planner.next_wakeup(now()));

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep_until(wake) => {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = self.tick() => {}
                    }
                }
                Some(signal) = self.signals.recv() => {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = self.handle_signal(signal) => {}
                    }
                }
            }
        }

        tracing::info!("Polling scheduler stopped");
    }

    async fn tick(&mut self) {
        if self.planner.list_due(now()) {
            self.refresh_inventory().await;
        }

        for device_id in self.planner.take_due(now()) {
            self.poll_device(&device_id).await;
        }
    }

    async fn refresh_inventory(&mut self) {
        let devices = match self.ctx.gateway().list_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                // keep the previous inventory and wait a full interval
                self.planner.record_list(now());
                tracing::warn!(error = %e, "Inventory refresh failed");
                return;
            }
        };
        let at = now();
        self.planner.record_list(at);

        let change = self
            .planner
            .sync_inventory(devices.iter().map(|d| d.id.clone()), at);
        let listed = self.ctx.inventory().replace_all(devices).await;

        for descriptor in &listed {
            if let Err(e) = self.ctx.register_device(descriptor).await {
                tracing::debug!(device_id = %descriptor.id, error = %e, "Skipping registration");
                continue;
            }
            self.publish_availability(&descriptor.id, true).await;
        }
        for device_id in &change.removed {
            self.ctx.remove_device(device_id).await;
            self.publish_availability(device_id, false).await;
        }

        tracing::info!(
            devices = listed.len(),
            added = change.added.len(),
            removed = change.removed.len(),
            "Inventory refreshed"
        );
        self.publish_service().await;
    }

    async fn poll_device(&self, device_id: &str) {
        let reported = match self.ctx.gateway().get_state(device_id).await {
            Ok(reported) => reported,
            Err(e) => {
                tracing::warn!(device_id, error = %e, "Poll failed, keeping last state");
                return;
            }
        };

        let Some(slot) = self.ctx.cache().get(device_id).await else {
            tracing::debug!(device_id, "Device removed during poll");
            return;
        };
        let snapshot = {
            let mut state = slot.lock().await;
            state
                .apply_report(&reported, Utc::now())
                .then(|| state.clone())
        };

        if let Some(state) = snapshot {
            tracing::debug!(device_id, "State changed");
            if let Err(e) = self.ctx.sink().publish_state(&state).await {
                tracing::warn!(device_id, error = %e, "Failed to publish state");
            }
        }
    }

    async fn handle_signal(&mut self, signal: SchedulerSignal) {
        match signal {
            SchedulerSignal::Boost(device_id) => {
                if self.planner.boost(&device_id, now()) {
                    tracing::debug!(device_id = %device_id, "Boosted polling");
                }
            }
            SchedulerSignal::Rediscover => {
                tracing::info!("Rediscovery requested");
                self.planner.force_list();
            }
            SchedulerSignal::SetRefreshInterval(interval) => {
                tracing::info!(secs = interval.as_secs(), "Refresh interval changed");
                self.planner.set_base_interval(interval, now());
                self.publish_service().await;
            }
            SchedulerSignal::SetBoostInterval(interval) => {
                tracing::info!(secs = interval.as_secs(), "Boost interval changed");
                self.planner.set_boost_interval(interval, now());
                self.publish_service().await;
            }
            SchedulerSignal::SetRescanInterval(interval) => {
                tracing::info!(secs = interval.as_secs(), "Rescan interval changed");
                self.planner.set_list_interval(interval);
                self.publish_service().await;
            }
            SchedulerSignal::PublishAll => self.publish_all().await,
        }
    }

    async fn publish_all(&self) {
        for device_id in self.ctx.inventory().ids().await {
            self.publish_availability(&device_id, true).await;
            if let Some(state) = self.ctx.cache().snapshot(&device_id).await {
                if let Err(e) = self.ctx.sink().publish_state(&state).await {
                    tracing::warn!(device_id = %device_id, error = %e, "Failed to publish state");
                }
            }
        }
        self.publish_service().await;
    }

    async fn publish_availability(&self, device_id: &DeviceId, online: bool) {
        if let Err(e) = self.ctx.sink().publish_availability(device_id, online).await {
            tracing::warn!(
                device_id = %device_id,
                online,
                error = %e,
                "Failed to publish availability"
            );
        }
    }

    async fn publish_service(&self) {
        let status = self.service_status().await;
        if let Err(e) = self.ctx.sink().publish_service(&status).await {
            tracing::warn!(error = %e, "Failed to publish service state");
        }
    }

    async fn service_status(&self) -> ServiceStatus {
        let usage = self.ctx.gateway().usage().await;
        let poll_ceiling = usage
            .quota
            .saturating_sub(self.ctx.gateway().config().poll_reserve);
        let config = self.planner.config();
        ServiceStatus {
            calls_in_window: usage.calls_in_window,
            quota: usage.quota,
            rate_limited: usage.remote_limited || usage.calls_in_window >= poll_ceiling,
            devices: self.planner.len(),
            refresh_interval: config.base_interval.as_secs(),
            boost_interval: config.boost_interval.as_secs(),
            rescan_interval: config.list_interval.as_secs(),
        }
    }
}
