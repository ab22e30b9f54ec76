//! Per-device command batching.
//!
//! Each device gets one [`CommandCoordinator`]: a small actor task that
//! collects change requests during a debounce window, merges them, and
//! sends the result through the gateway. Because a single task owns the
//! send step, at most one `sendCommand` per device is ever in flight, and
//! batches leave in the order their windows closed.
//!
//! Two locks are involved and never nest across a remote call:
//! the coordinator's own window lock guards the pending requests, and the
//! device's state lock in [`DeviceStateCache`] guards local state while
//! results are applied.

use crate::cache::{DeviceStateCache, Inventory};
use crate::gateway::RateLimitedGateway;
use crate::scheduler::SchedulerSignal;
use chrono::Utc;
use govee_sync_core::{
    Attribute, AttributeValue, BatchError, BatchPhase, CallPlanner, CommandBatch, DeviceDescriptor,
    DeviceId, MergedCommand, PendingCommand, Reported, StateSink,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default batching window.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// Shared collaborators handed to every coordinator.
#[derive(Clone)]
pub struct CoordinatorEnv {
    /// Path to the remote API
    pub gateway: Arc<RateLimitedGateway>,
    /// Current device listing
    pub inventory: Arc<Inventory>,
    /// Device state
    pub cache: Arc<DeviceStateCache>,
    /// Downstream publisher
    pub sink: Arc<dyn StateSink>,
    /// Channel to the polling scheduler
    pub signals: mpsc::UnboundedSender<SchedulerSignal>,
    /// Batching window
    pub debounce: Duration,
    /// Per-model call splitting
    pub planner: Arc<CallPlanner>,
}

#[derive(Debug, Default)]
struct PendingWindow {
    batch: CommandBatch,
    /// Set while a debounce window is open
    deadline: Option<Instant>,
}

struct Inner {
    device_id: DeviceId,
    env: CoordinatorEnv,
    window: Mutex<PendingWindow>,
    wake: Notify,
    cancel: CancellationToken,
    last_outcome: Mutex<Option<BatchPhase>>,
}

/// Batches and sends commands for one device.
pub struct CommandCoordinator {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CommandCoordinator {
    /// Start a coordinator for `device_id`. It stops when `cancel` fires.
    #[must_use]
    pub fn spawn(device_id: DeviceId, env: CoordinatorEnv, cancel: CancellationToken) -> Self {
        let inner = Arc::new(Inner {
            device_id,
            env,
            window: Mutex::new(PendingWindow::default()),
            wake: Notify::new(),
            cancel,
            last_outcome: Mutex::new(None),
        });
        let task = tokio::spawn(Inner::run(inner.clone()));

        Self {
            inner,
            task: Mutex::new(Some(task)),
        }
    }

    /// Device this coordinator serves.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    /// Record a change request, opening a batching window if none is open.
    ///
    /// Only holds the window lock long enough to record the request.
    ///
    /// # Errors
    ///
    /// Returns [`SubmitError::Closed`] once the coordinator is shut down.
    pub async fn submit(
        &self,
        attribute: Attribute,
        value: AttributeValue,
    ) -> Result<(), SubmitError> {
        let now = Instant::now();
        let mut window = self.inner.window.lock().await;
        if self.inner.cancel.is_cancelled() {
            return Err(SubmitError::Closed(self.inner.device_id.clone()));
        }

        window
            .batch
            .push(PendingCommand::new(attribute, value, now.into_std()))?;

        if window.deadline.is_none() {
            window.deadline = Some(now + self.inner.env.debounce);
            tracing::debug!(
                device_id = %self.inner.device_id,
                debounce_ms = self.inner.env.debounce.as_millis(),
                "Opened batch window"
            );
            self.inner.wake.notify_one();
        }
        Ok(())
    }

    /// Requests collected in the open window.
    pub async fn pending_len(&self) -> usize {
        self.inner.window.lock().await.batch.len()
    }

    /// Final phase of the most recently dispatched batch.
    pub async fn last_outcome(&self) -> Option<BatchPhase> {
        *self.inner.last_outcome.lock().await
    }

    /// Whether the coordinator has been cancelled.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Cancel the coordinator and wait for its task to finish.
    ///
    /// Any open window is discarded and an in-flight send is abandoned.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::error!(device_id = %self.inner.device_id, error = %e, "Coordinator task failed");
            }
        }
        // covers a cancel observed before the task was ever polled
        self.inner.discard().await;
    }
}

impl Drop for CommandCoordinator {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl Inner {
    async fn run(self: Arc<Self>) {
        loop {
            let Some(deadline) = self.wait_for_window().await else {
                self.discard().await;
                return;
            };

            tokio::select! {
                () = self.cancel.cancelled() => {
                    self.discard().await;
                    return;
                }
                () = tokio::time::sleep_until(deadline) => {}
            }

            let batch = {
                let mut window = self.window.lock().await;
                window.deadline = None;
                window.batch.take()
            };
            if batch.is_empty() {
                continue;
            }

            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::info!(
                        device_id = %self.device_id,
                        "Coordinator cancelled, abandoning batch"
                    );
                    self.discard().await;
                    return;
                }
                () = self.dispatch(batch) => {}
            }
        }
    }

    /// Wait until a window opens. `None` means cancelled.
    async fn wait_for_window(&self) -> Option<Instant> {
        loop {
            if let Some(deadline) = self.window.lock().await.deadline {
                return Some(deadline);
            }
            tokio::select! {
                () = self.cancel.cancelled() => return None,
                () = self.wake.notified() => {}
            }
        }
    }

    async fn discard(&self) {
        let mut window = self.window.lock().await;
        if !window.batch.is_empty() {
            tracing::debug!(
                device_id = %self.device_id,
                discarded = window.batch.len(),
                "Discarding pending requests"
            );
        }
        window.batch.clear();
        window.deadline = None;
    }

    async fn dispatch(&self, mut batch: CommandBatch) {
        let Some(descriptor) = self.env.inventory.get(&self.device_id).await else {
            tracing::warn!(
                device_id = %self.device_id,
                pending = batch.len(),
                "Device left the inventory, dropping batch"
            );
            return;
        };

        let mut merged = match batch.merge(&descriptor) {
            Ok(merged) => merged,
            Err(e) => {
                tracing::error!(device_id = %self.device_id, error = %e, "Batch merge failed");
                return;
            }
        };
        self.complete(&descriptor, &mut merged).await;
        if self.env.planner.fold_implied_power(&descriptor.sku, &mut merged) {
            tracing::debug!(device_id = %self.device_id, "Power on implied by light values");
        }
        if merged.is_empty() {
            tracing::debug!(device_id = %self.device_id, "Nothing to send after merge");
            return;
        }
        if let Err(e) = batch.advance(BatchPhase::Sending) {
            tracing::error!(device_id = %self.device_id, error = %e, "Batch state error");
            return;
        }

        let calls = self.env.planner.plan(&descriptor.sku, &merged.values);
        tracing::info!(
            device_id = %self.device_id,
            command = %merged,
            calls = calls.len(),
            "Sending batch"
        );

        let mut sent = Reported::new();
        let mut echoed = Reported::new();
        let mut failed = false;
        for call in &calls {
            match self.env.gateway.send_command(&self.device_id, call).await {
                Ok(ack) => {
                    sent.extend(call.values.iter().map(|(k, v)| (*k, v.clone())));
                    echoed.extend(ack.reported);
                }
                Err(e) => {
                    let attributes: Vec<&str> = call.attributes().map(|a| a.as_str()).collect();
                    let values: Vec<String> =
                        call.values.values().map(ToString::to_string).collect();
                    tracing::error!(
                        device_id = %self.device_id,
                        attributes = ?attributes,
                        values = ?values,
                        error = %e,
                        "Command failed"
                    );
                    failed = true;
                    break;
                }
            }
        }

        let outcome = if failed {
            BatchPhase::Failed
        } else {
            BatchPhase::Acked
        };
        if let Err(e) = batch.advance(outcome) {
            tracing::error!(device_id = %self.device_id, error = %e, "Batch state error");
        }
        *self.last_outcome.lock().await = Some(outcome);

        if sent.is_empty() {
            return;
        }
        if !failed {
            // derived local values only hold when the whole batch landed
            for (attribute, value) in merged.local {
                sent.entry(attribute).or_insert(value);
            }
        }
        self.apply(&descriptor, &sent, &echoed).await;

        if self
            .env
            .signals
            .send(SchedulerSignal::Boost(self.device_id.clone()))
            .is_err()
        {
            tracing::debug!(device_id = %self.device_id, "Scheduler gone, boost skipped");
        }
    }

    /// Settings sent inside a mode capability need that mode; take it from
    /// the cached state when the batch does not name one.
    async fn complete(&self, descriptor: &DeviceDescriptor, merged: &mut MergedCommand) {
        let slot = self.env.cache.track(descriptor).await;
        let dropped = {
            let state = slot.lock().await;
            merged.complete_from(&state)
        };
        for attribute in dropped {
            tracing::warn!(
                device_id = %self.device_id,
                %attribute,
                "Dropping setting, current mode unknown"
            );
        }
    }

    async fn apply(&self, descriptor: &DeviceDescriptor, sent: &Reported, echoed: &Reported) {
        let slot = self.env.cache.track(descriptor).await;
        let snapshot = {
            let mut state = slot.lock().await;
            let now = Utc::now();
            let mut changed = state.apply_optimistic(sent, now);
            if !echoed.is_empty() {
                changed |= state.apply_report(echoed, now);
            }
            changed.then(|| state.clone())
        };

        if let Some(state) = snapshot {
            if let Err(e) = self.env.sink.publish_state(&state).await {
                tracing::warn!(device_id = %self.device_id, error = %e, "Failed to publish state");
            }
        }
    }
}

/// Errors accepting a change request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// Device is not in the inventory
    #[error("unknown device: {0}")]
    UnknownDevice(DeviceId),
    /// Device does not advertise the attribute
    #[error("device {device_id} does not support {attribute}")]
    Unsupported {
        /// Target device
        device_id: DeviceId,
        /// Requested attribute
        attribute: Attribute,
    },
    /// Attribute can only be reported, never set
    #[error("attribute {0} is read-only")]
    ReadOnly(Attribute),
    /// Coordinator is shutting down
    #[error("coordinator for {0} is closed")]
    Closed(DeviceId),
    /// Batch lifecycle misuse
    #[error(transparent)]
    Batch(#[from] BatchError),
}
