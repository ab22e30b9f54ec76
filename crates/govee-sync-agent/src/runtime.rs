//! Agent runtime orchestration.

use crate::config::{AgentConfig, StoreKind};
use crate::context::SyncContext;
use crate::persistence::SqliteStore;
use crate::scheduler::{PollingScheduler, SchedulerSignal};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use govee_sync_adapter_govee::GoveeClient;
use govee_sync_adapter_mqtt::{BusEvent, MqttBridge};
use govee_sync_core::StateSink;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// How often the ready file is touched and the ledger saved.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// How long the bus gets to flush final messages.
const FLUSH_GRACE: Duration = Duration::from_secs(1);

/// The main agent runtime.
pub struct Agent {
    config: AgentConfig,
    store: Option<SqliteStore>,
}

impl Agent {
    /// Create a new agent.
    ///
    /// # Errors
    ///
    /// Returns error if the ledger database cannot be opened.
    pub fn new(config: AgentConfig) -> Result<Self> {
        let store = match config.persistence.store {
            StoreKind::Sqlite => Some(
                SqliteStore::open(&config.persistence.db_path)
                    .context("Failed to open SQLite database")?,
            ),
            StoreKind::Memory => None,
        };

        Ok(Self { config, store })
    }

    /// Run the agent's main loop.
    ///
    /// # Errors
    ///
    /// Returns error if the vendor client or the bus cannot be set up.
    pub async fn run(self) -> Result<()> {
        tracing::info!("Starting agent runtime");
        let Self { config, store } = self;

        let client =
            GoveeClient::new(config.client_config()).context("Failed to create Govee client")?;
        let bridge =
            MqttBridge::new(config.bridge_config()).context("Failed to create MQTT bridge")?;
        let sink = bridge.sink();

        let settings = config.sync_settings();
        let window = settings.gateway.window;
        let (ctx, signals) = SyncContext::new(Arc::new(client), Arc::new(sink.clone()), settings);

        let calls = store
            .as_ref()
            .map(|store| load_ledger(store, window))
            .unwrap_or_default();
        if !calls.is_empty() {
            ctx.gateway().restore_ledger(&calls).await;
        }

        bridge
            .subscribe()
            .await
            .context("Failed to subscribe to bus topics")?;
        let mut events = bridge.start();

        let scheduler =
            tokio::spawn(PollingScheduler::new(ctx.clone(), config.schedule, signals).run());
        let heartbeat = tokio::spawn(heartbeat(ctx.clone(), store, config.ready_file.clone()));

        tracing::info!("Agent running, press Ctrl+C to stop");

        // Main event loop
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(Ok(event)) => handle_event(&ctx, event).await,
                    // already logged by the bridge
                    Some(Err(_)) => {}
                    None => {
                        tracing::error!("Bus event stream ended");
                        break;
                    }
                },

                // Handle shutdown
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Shutdown signal received");
                    break;
                }
            }
        }

        ctx.shutdown().await;
        if let Err(e) = scheduler.await {
            tracing::error!(error = %e, "Scheduler task failed");
        }
        if let Err(e) = heartbeat.await {
            tracing::error!(error = %e, "Heartbeat task failed");
        }

        for device_id in ctx.inventory().ids().await {
            if let Err(e) = sink.publish_availability(&device_id, false).await {
                tracing::warn!(device_id = %device_id, error = %e, "Failed to publish availability");
            }
        }
        if let Err(e) = sink.disconnect().await {
            tracing::warn!(error = %e, "Failed to disconnect from bus");
        }
        // keep the bridge loop polled until the disconnect goes out
        let _ = tokio::time::timeout(FLUSH_GRACE, async {
            while events.recv().await.is_some() {}
        })
        .await;

        tracing::info!("Agent stopped");
        Ok(())
    }
}

/// Route one bus event into the context.
pub async fn handle_event(ctx: &SyncContext, event: BusEvent) {
    match event {
        BusEvent::Change(request) => {
            tracing::debug!(
                device_id = %request.device_id,
                attribute = %request.attribute,
                value = %request.value,
                "Change requested"
            );
            if let Err(e) = ctx
                .submit(&request.device_id, request.attribute, request.value.clone())
                .await
            {
                tracing::warn!(
                    device_id = %request.device_id,
                    attribute = %request.attribute,
                    value = %request.value,
                    error = %e,
                    "Change request rejected"
                );
            }
        }
        BusEvent::Service(request) => ctx.signal(request.into()),
        BusEvent::DiscoveryOnline => {
            ctx.signal(SchedulerSignal::Rediscover);
            ctx.signal(SchedulerSignal::PublishAll);
        }
    }
}

fn load_ledger(store: &SqliteStore, window: Duration) -> Vec<DateTime<Utc>> {
    let Ok(window) = chrono::Duration::from_std(window) else {
        return Vec::new();
    };
    let since = Utc::now() - window;

    if let Err(e) = store.prune_before(since) {
        tracing::warn!(error = %e, "Failed to prune call ledger");
    }
    store.load_ledger_since(since).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load call ledger");
        Vec::new()
    })
}

async fn save_ledger(ctx: &SyncContext, store: Option<&mut SqliteStore>) {
    if let Some(store) = store {
        let calls = ctx.gateway().ledger_snapshot().await;
        match store.save_ledger(&calls) {
            Ok(()) => tracing::debug!(calls = calls.len(), "Saved call ledger"),
            Err(e) => tracing::warn!(error = %e, "Failed to save call ledger"),
        }
    }
}

async fn touch_ready(path: &Path) {
    if let Err(e) = tokio::fs::write(path, Utc::now().to_rfc3339()).await {
        tracing::warn!(error = %e, path = %path.display(), "Failed to write ready file");
    }
}

async fn heartbeat(ctx: Arc<SyncContext>, mut store: Option<SqliteStore>, ready_file: PathBuf) {
    let cancel = ctx.shutdown_token();
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                touch_ready(&ready_file).await;
                save_ledger(&ctx, store.as_mut()).await;
            }
        }
    }

    save_ledger(&ctx, store.as_mut()).await;
    if let Err(e) = tokio::fs::remove_file(&ready_file).await {
        tracing::debug!(error = %e, "Ready file already gone");
    }
}
