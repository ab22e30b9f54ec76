//! Process-wide synchronization context.

use crate::cache::{DeviceStateCache, Inventory};
use crate::coordinator::{CommandCoordinator, CoordinatorEnv, SubmitError, DEFAULT_DEBOUNCE};
use crate::gateway::{GatewayConfig, RateLimitedGateway};
use crate::scheduler::SchedulerSignal;
use govee_sync_core::{
    Attribute, AttributeValue, CallPlanner, DeviceDescriptor, DeviceId, RemoteApi, StateSink,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

/// Tunables for the shared context.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Quota and retry policy
    pub gateway: GatewayConfig,
    /// Command batching window
    pub debounce: Duration,
    /// Per-model call splitting
    pub planner: CallPlanner,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            debounce: DEFAULT_DEBOUNCE,
            planner: CallPlanner::default(),
        }
    }
}

/// Owner of everything shared between coordinators and the scheduler.
///
/// Cancelling the context's root token tears down every coordinator and
/// the scheduler.
pub struct SyncContext {
    env: CoordinatorEnv,
    coordinators: RwLock<HashMap<DeviceId, Arc<CommandCoordinator>>>,
    shutdown: CancellationToken,
}

impl SyncContext {
    /// Build a context over a remote API and a state sink.
    ///
    /// Returns the scheduler's signal receiver alongside the context.
    #[must_use]
    pub fn new(
        api: Arc<dyn RemoteApi>,
        sink: Arc<dyn StateSink>,
        settings: SyncSettings,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SchedulerSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inventory = Arc::new(Inventory::new());
        let gateway = Arc::new(RateLimitedGateway::new(
            api,
            inventory.clone(),
            settings.gateway,
        ));

        let ctx = Self {
            env: CoordinatorEnv {
                gateway,
                inventory,
                cache: Arc::new(DeviceStateCache::new()),
                sink,
                signals: tx,
                debounce: settings.debounce,
                planner: Arc::new(settings.planner),
            },
            coordinators: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        };
        (Arc::new(ctx), rx)
    }

    /// Current device listing.
    #[must_use]
    pub fn inventory(&self) -> &Arc<Inventory> {
        &self.env.inventory
    }

    /// Device state.
    #[must_use]
    pub fn cache(&self) -> &Arc<DeviceStateCache> {
        &self.env.cache
    }

    /// Path to the remote API.
    #[must_use]
    pub fn gateway(&self) -> &Arc<RateLimitedGateway> {
        &self.env.gateway
    }

    /// Downstream publisher.
    #[must_use]
    pub fn sink(&self) -> &Arc<dyn StateSink> {
        &self.env.sink
    }

    /// Root cancellation token.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Route a change request to the device's coordinator.
    ///
    /// # Errors
    ///
    /// Returns error if the device is unknown, the attribute is read-only
    /// or unsupported, or the coordinator is closed.
    pub async fn submit(
        &self,
        device_id: &str,
        attribute: Attribute,
        value: AttributeValue,
    ) -> Result<(), SubmitError> {
        let descriptor = self
            .env
            .inventory
            .get(device_id)
            .await
            .ok_or_else(|| SubmitError::UnknownDevice(device_id.to_string()))?;

        if !attribute.is_writable() {
            return Err(SubmitError::ReadOnly(attribute));
        }
        if !descriptor.supports(attribute) {
            return Err(SubmitError::Unsupported {
                device_id: descriptor.id.clone(),
                attribute,
            });
        }

        self.register_device(&descriptor)
            .await?
            .submit(attribute, value)
            .await
    }

    /// Start tracking a listed device. Idempotent.
    ///
    /// The inventory is checked again under the coordinator lock, so a
    /// device removed while a caller held its descriptor is not revived.
    ///
    /// # Errors
    ///
    /// Returns error if the device has left the inventory.
    pub async fn register_device(
        &self,
        descriptor: &DeviceDescriptor,
    ) -> Result<Arc<CommandCoordinator>, SubmitError> {
        {
            let coordinators = self.coordinators.read().await;
            if let Some(existing) = coordinators.get(&descriptor.id) {
                self.env.cache.track(descriptor).await;
                return Ok(existing.clone());
            }
        }

        let mut coordinators = self.coordinators.write().await;
        if !self.env.inventory.contains(&descriptor.id).await {
            tracing::debug!(device_id = %descriptor.id, "Device left the inventory, not registering");
            return Err(SubmitError::UnknownDevice(descriptor.id.clone()));
        }
        self.env.cache.track(descriptor).await;
        let coordinator = coordinators
            .entry(descriptor.id.clone())
            .or_insert_with(|| {
                tracing::debug!(device_id = %descriptor.id, "Starting coordinator");
                Arc::new(CommandCoordinator::spawn(
                    descriptor.id.clone(),
                    self.env.clone(),
                    self.shutdown.child_token(),
                ))
            })
            .clone();
        Ok(coordinator)
    }

    /// Tear down a device's coordinator and forget its state.
    ///
    /// An open batch window is discarded without a remote call.
    pub async fn remove_device(&self, device_id: &str) {
        let coordinator = {
            let mut coordinators = self.coordinators.write().await;
            let coordinator = coordinators.remove(device_id);
            self.env.cache.remove(device_id).await;
            coordinator
        };
        if let Some(coordinator) = coordinator {
            coordinator.shutdown().await;
        }
        tracing::info!(device_id, "Device removed");
    }

    /// Coordinator for `device_id`, if running.
    pub async fn coordinator(&self, device_id: &str) -> Option<Arc<CommandCoordinator>> {
        self.coordinators.read().await.get(device_id).cloned()
    }

    /// Number of running coordinators.
    pub async fn coordinator_count(&self) -> usize {
        self.coordinators.read().await.len()
    }

    /// Send a signal to the scheduler.
    pub fn signal(&self, signal: SchedulerSignal) {
        if self.env.signals.send(signal).is_err() {
            tracing::debug!("Scheduler not running, signal dropped");
        }
    }

    /// Cancel everything and wait for coordinators to stop.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let coordinators: Vec<_> = self.coordinators.write().await.drain().collect();
        for (_, coordinator) in coordinators {
            coordinator.shutdown().await;
        }
        tracing::info!("Sync context shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use govee_sync_core::{Ack, ApiError, Capability, Command, DeviceState, Reported, ServiceStatus, SinkError};

    struct NoApi;

    #[async_trait]
    impl RemoteApi for NoApi {
        async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, ApiError> {
            Ok(Vec::new())
        }
        async fn get_state(&self, _: &DeviceDescriptor) -> Result<Reported, ApiError> {
            Err(ApiError::Transient("offline".into()))
        }
        async fn send_command(&self, _: &DeviceDescriptor, _: &Command) -> Result<Ack, ApiError> {
            Ok(Ack::default())
        }
    }

    struct NullSink;

    #[async_trait]
    impl StateSink for NullSink {
        async fn publish_state(&self, _: &DeviceState) -> Result<(), SinkError> {
            Ok(())
        }
        async fn publish_availability(&self, _: &DeviceId, _: bool) -> Result<(), SinkError> {
            Ok(())
        }
        async fn publish_service(&self, _: &ServiceStatus) -> Result<(), SinkError> {
            Ok(())
        }
    }

    async fn context_with_sensor() -> Arc<SyncContext> {
        let (ctx, _rx) = SyncContext::new(Arc::new(NoApi), Arc::new(NullSink), SyncSettings::default());
        ctx.inventory()
            .replace_all(vec![DeviceDescriptor::new(
                "S1",
                "H5075",
                "Sensor",
                vec![Capability::new(Attribute::Temperature), Capability::new(Attribute::Power)],
            )])
            .await;
        ctx
    }

    #[tokio::test]
    async fn submit_validates_locally() {
        let ctx = context_with_sensor().await;

        assert_eq!(
            ctx.submit("NOPE", Attribute::Power, AttributeValue::Switch(true)).await,
            Err(SubmitError::UnknownDevice("NOPE".into()))
        );
        assert_eq!(
            ctx.submit("S1", Attribute::Temperature, AttributeValue::Reading(20.0)).await,
            Err(SubmitError::ReadOnly(Attribute::Temperature))
        );
        assert!(matches!(
            ctx.submit("S1", Attribute::Brightness, AttributeValue::Level(5)).await,
            Err(SubmitError::Unsupported { attribute: Attribute::Brightness, .. })
        ));
        assert_eq!(ctx.coordinator_count().await, 0);

        tokio_test::assert_ok!(ctx.submit("S1", Attribute::Power, AttributeValue::Switch(true)).await);
        assert_eq!(ctx.coordinator_count().await, 1);
    }

    #[tokio::test]
    async fn shutdown_closes_coordinators() {
        let ctx = context_with_sensor().await;
        let descriptor = ctx.inventory().get("S1").await.unwrap();
        let coordinator = ctx.register_device(&descriptor).await.unwrap();

        ctx.shutdown().await;

        assert!(coordinator.is_closed());
        assert_eq!(
            coordinator.submit(Attribute::Power, AttributeValue::Switch(false)).await,
            Err(SubmitError::Closed("S1".into()))
        );
    }

    #[tokio::test]
    async fn removed_device_is_not_registered_again() {
        let ctx = context_with_sensor().await;
        // a caller read the descriptor before the device disappeared
        let descriptor = ctx.inventory().get("S1").await.unwrap();

        ctx.inventory().replace_all(Vec::new()).await;
        ctx.remove_device("S1").await;

        assert_eq!(
            ctx.register_device(&descriptor).await.err(),
            Some(SubmitError::UnknownDevice("S1".into()))
        );
        assert_eq!(ctx.coordinator_count().await, 0);
        assert!(ctx.cache().get("S1").await.is_none());
    }
}
