//! Quota-aware access to the remote API.
//!
//! Every remote call in the process goes through [`RateLimitedGateway`].
//! It keeps a rolling-window ledger of calls, holds calls back when the
//! window is full, retries transient failures once, and resolves device
//! identifiers against the inventory so that calls for vanished devices
//! never leave the process.

use crate::cache::Inventory;
use chrono::{DateTime, Utc};
use govee_sync_core::{Ack, ApiError, Command, DeviceDescriptor, DeviceId, RemoteApi, Reported};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Gateway configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Calls allowed per window
    pub quota: usize,
    /// Length of the rolling window
    pub window: Duration,
    /// Slots at the top of the window kept for commands; polls and
    /// inventory refreshes stop short of them
    pub poll_reserve: usize,
    /// Longest a call may be held back waiting for a free slot
    pub max_quota_wait: Duration,
    /// Retries for transient failures
    pub max_retries: u32,
    /// Delay before the first retry, doubled for each further one
    pub retry_backoff: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            quota: 10_000,
            window: Duration::from_secs(24 * 60 * 60),
            poll_reserve: 100,
            max_quota_wait: Duration::from_secs(60),
            max_retries: 1,
            retry_backoff: Duration::from_secs(2),
        }
    }
}

/// What a call is for; decides which part of the quota it may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Inventory refresh
    List,
    /// State poll
    Poll,
    /// User command
    Command,
}

impl CallKind {
    fn as_str(self) -> &'static str {
        match self {
            CallKind::List => "list",
            CallKind::Poll => "poll",
            CallKind::Command => "command",
        }
    }
}

/// Current quota consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaUsage {
    /// Calls in the current window
    pub calls_in_window: usize,
    /// Window ceiling
    pub quota: usize,
    /// Whether the remote API itself answered "rate limited" last time
    pub remote_limited: bool,
}

#[derive(Debug, Default)]
struct CallLedger {
    calls: VecDeque<Instant>,
}

impl CallLedger {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.calls.front() {
            if now.duration_since(*oldest) >= window {
                self.calls.pop_front();
            } else {
                break;
            }
        }
    }
}

/// The single path to the remote API.
pub struct RateLimitedGateway {
    api: Arc<dyn RemoteApi>,
    inventory: Arc<Inventory>,
    ledger: Mutex<CallLedger>,
    remote_limited: AtomicBool,
    config: GatewayConfig,
}

impl RateLimitedGateway {
    /// Create a gateway over `api`.
    #[must_use]
    pub fn new(api: Arc<dyn RemoteApi>, inventory: Arc<Inventory>, config: GatewayConfig) -> Self {
        Self {
            api,
            inventory,
            ledger: Mutex::new(CallLedger::default()),
            remote_limited: AtomicBool::new(false),
            config,
        }
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Fetch the device inventory.
    ///
    /// # Errors
    ///
    /// Returns error if the quota is exhausted or the call fails.
    pub async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, GatewayError> {
        self.call(CallKind::List, "inventory", || self.api.list_devices())
            .await
    }

    /// Fetch current state of a listed device.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UnknownDevice`] without contacting the API
    /// if the device is not in the inventory.
    pub async fn get_state(&self, device_id: &str) -> Result<Reported, GatewayError> {
        let device = self.resolve(device_id).await?;
        self.call(CallKind::Poll, device_id, || self.api.get_state(&device))
            .await
    }

    /// Send a command to a listed device.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UnknownDevice`] without contacting the API
    /// if the device is not in the inventory.
    pub async fn send_command(
        &self,
        device_id: &str,
        command: &Command,
    ) -> Result<Ack, GatewayError> {
        let device = self.resolve(device_id).await?;
        self.call(CallKind::Command, device_id, || {
            self.api.send_command(&device, command)
        })
        .await
    }

    /// Current quota consumption.
    pub async fn usage(&self) -> QuotaUsage {
        let mut ledger = self.ledger.lock().await;
        ledger.prune(Instant::now(), self.config.window);
        QuotaUsage {
            calls_in_window: ledger.calls.len(),
            quota: self.config.quota,
            remote_limited: self.remote_limited.load(Ordering::Relaxed),
        }
    }

    /// Wall-clock times of the calls in the current window.
    pub async fn ledger_snapshot(&self) -> Vec<DateTime<Utc>> {
        let now = Instant::now();
        let wall_now = Utc::now();
        let mut ledger = self.ledger.lock().await;
        ledger.prune(now, self.config.window);
        ledger
            .calls
            .iter()
            .filter_map(|at| chrono::Duration::from_std(now.duration_since(*at)).ok())
            .map(|age| wall_now - age)
            .collect()
    }

    /// Seed the ledger with calls made before a restart.
    ///
    /// Entries outside the window or in the future are dropped.
    pub async fn restore_ledger(&self, calls: &[DateTime<Utc>]) {
        let now = Instant::now();
        let wall_now = Utc::now();
        let mut restored: Vec<Instant> = calls
            .iter()
            .filter_map(|at| (wall_now - *at).to_std().ok())
            .filter(|age| *age < self.config.window)
            .filter_map(|age| now.checked_sub(age))
            .collect();
        restored.sort();

        let mut ledger = self.ledger.lock().await;
        let count = restored.len();
        let mut merged: Vec<Instant> = ledger.calls.drain(..).chain(restored).collect();
        merged.sort();
        ledger.calls = merged.into();
        tracing::info!(restored = count, total = ledger.calls.len(), "Restored call ledger");
    }

    async fn resolve(&self, device_id: &str) -> Result<Arc<DeviceDescriptor>, GatewayError> {
        self.inventory
            .get(device_id)
            .await
            .ok_or_else(|| GatewayError::UnknownDevice(device_id.to_string()))
    }

    fn limit_for(&self, kind: CallKind) -> usize {
        match kind {
            CallKind::Command => self.config.quota,
            CallKind::List | CallKind::Poll => {
                self.config.quota.saturating_sub(self.config.poll_reserve)
            }
        }
    }

    /// Take a slot in the window, waiting for one to free up if that
    /// happens within `max_quota_wait`.
    async fn acquire(&self, kind: CallKind) -> Result<(), GatewayError> {
        let limit = self.limit_for(kind);
        let give_up_at = Instant::now() + self.config.max_quota_wait;

        loop {
            let free_at = {
                let mut ledger = self.ledger.lock().await;
                let now = Instant::now();
                ledger.prune(now, self.config.window);

                if ledger.calls.len() < limit {
                    ledger.calls.push_back(now);
                    return Ok(());
                }
                if limit == 0 {
                    return Err(GatewayError::QuotaExhausted { retry_after: None });
                }
                // the slot frees when enough of the oldest calls age out
                let index = ledger.calls.len() - limit;
                ledger.calls[index] + self.config.window
            };

            if free_at > give_up_at {
                let retry_after = free_at.saturating_duration_since(Instant::now());
                tracing::warn!(
                    kind = kind.as_str(),
                    retry_after_secs = retry_after.as_secs(),
                    "Call quota exhausted"
                );
                return Err(GatewayError::QuotaExhausted {
                    retry_after: Some(retry_after),
                });
            }

            tracing::debug!(
                kind = kind.as_str(),
                wait_ms = free_at.saturating_duration_since(Instant::now()).as_millis(),
                "Delaying call until quota frees"
            );
            tokio::time::sleep_until(free_at).await;
        }
    }

    async fn call<T, F, Fut>(&self, kind: CallKind, subject: &str, op: F) -> Result<T, GatewayError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut attempt = 0;
        loop {
            self.acquire(kind).await?;

            match op().await {
                Ok(value) => {
                    self.remote_limited.store(false, Ordering::Relaxed);
                    return Ok(value);
                }
                Err(err) if err.is_transient() && attempt < self.config.max_retries => {
                    let backoff = self.config.retry_backoff * 2u32.saturating_pow(attempt);
                    attempt += 1;
                    tracing::warn!(
                        kind = kind.as_str(),
                        subject,
                        attempt,
                        backoff_ms = backoff.as_millis(),
                        error = %err,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(ApiError::RateLimited) => {
                    self.remote_limited.store(true, Ordering::Relaxed);
                    tracing::warn!(kind = kind.as_str(), subject, "Remote API reports rate limit");
                    return Err(GatewayError::QuotaExhausted { retry_after: None });
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Errors surfaced by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// Device is not in the inventory; nothing was sent
    #[error("unknown device: {0}")]
    UnknownDevice(DeviceId),
    /// No call slot within the allowed wait
    #[error("call quota exhausted")]
    QuotaExhausted {
        /// When a slot is expected to free up, if known
        retry_after: Option<Duration>,
    },
    /// Invalid value, out-of-range parameter, unsupported capability
    #[error("rejected ({status}): {message}")]
    Rejected {
        /// Vendor or HTTP status
        status: u16,
        /// Vendor message
        message: String,
    },
    /// Still failing after retries
    #[error("transient failure: {0}")]
    Transient(String),
    /// Response could not be interpreted
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl From<ApiError> for GatewayError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Transient(msg) => GatewayError::Transient(msg),
            ApiError::RateLimited => GatewayError::QuotaExhausted { retry_after: None },
            ApiError::Rejected { status, message } => GatewayError::Rejected { status, message },
            ApiError::Malformed(msg) => GatewayError::Malformed(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use govee_sync_core::{Attribute, AttributeValue, Capability};
    use std::sync::atomic::AtomicUsize;

    /// Fails the first `failures` calls with the given error.
    struct FlakyApi {
        calls: AtomicUsize,
        failures: usize,
        error: ApiError,
    }

    impl FlakyApi {
        fn new(failures: usize, error: ApiError) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                failures,
                error,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn outcome<T>(&self, ok: T) -> Result<T, ApiError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(self.error.clone())
            } else {
                Ok(ok)
            }
        }
    }

    #[async_trait]
    impl RemoteApi for FlakyApi {
        async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, ApiError> {
            self.outcome(vec![lamp()])
        }

        async fn get_state(&self, _: &DeviceDescriptor) -> Result<Reported, ApiError> {
            self.outcome(Reported::from([(Attribute::Power, AttributeValue::Switch(true))]))
        }

        async fn send_command(&self, _: &DeviceDescriptor, _: &Command) -> Result<Ack, ApiError> {
            self.outcome(Ack::default())
        }
    }

    fn lamp() -> DeviceDescriptor {
        DeviceDescriptor::new("D1", "H6008", "Lamp", vec![Capability::new(Attribute::Power)])
    }

    async fn gateway(api: Arc<FlakyApi>, config: GatewayConfig) -> RateLimitedGateway {
        let inventory = Arc::new(Inventory::new());
        inventory.replace_all(vec![lamp()]).await;
        RateLimitedGateway::new(api, inventory, config)
    }

    fn power_on() -> Command {
        Command::single(Attribute::Power, AttributeValue::Switch(true))
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried_once() {
        let api = FlakyApi::new(1, ApiError::Transient("reset".into()));
        let gw = gateway(api.clone(), GatewayConfig::default()).await;

        let started = Instant::now();
        tokio_test::assert_ok!(gw.get_state("D1").await);
        assert_eq!(api.calls(), 2);
        assert!(started.elapsed() >= Duration::from_secs(2));

        let api = FlakyApi::new(2, ApiError::Transient("reset".into()));
        let gw = gateway(api.clone(), GatewayConfig::default()).await;
        assert!(matches!(
            gw.get_state("D1").await,
            Err(GatewayError::Transient(_))
        ));
        assert_eq!(api.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_is_not_retried() {
        let api = FlakyApi::new(
            1,
            ApiError::Rejected {
                status: 400,
                message: "brightness out of range".into(),
            },
        );
        let gw = gateway(api.clone(), GatewayConfig::default()).await;

        let err = gw.send_command("D1", &power_on()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Rejected { status: 400, .. }));
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_device_never_reaches_the_api() {
        let api = FlakyApi::new(0, ApiError::RateLimited);
        let gw = gateway(api.clone(), GatewayConfig::default()).await;

        assert_eq!(
            gw.send_command("GONE", &power_on()).await.unwrap_err(),
            GatewayError::UnknownDevice("GONE".into())
        );
        assert_eq!(api.calls(), 0);
        assert_eq!(gw.usage().await.calls_in_window, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn full_window_delays_then_proceeds() {
        let api = FlakyApi::new(0, ApiError::RateLimited);
        let config = GatewayConfig {
            quota: 2,
            window: Duration::from_secs(10),
            poll_reserve: 0,
            max_quota_wait: Duration::from_secs(30),
            ..GatewayConfig::default()
        };
        let gw = gateway(api.clone(), config).await;

        let started = Instant::now();
        gw.get_state("D1").await.unwrap();
        gw.get_state("D1").await.unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);

        gw.get_state("D1").await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        assert_eq!(api.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn full_window_beyond_wait_bound_is_a_quota_error() {
        let api = FlakyApi::new(0, ApiError::RateLimited);
        let config = GatewayConfig {
            quota: 1,
            window: Duration::from_secs(3600),
            poll_reserve: 0,
            max_quota_wait: Duration::from_secs(5),
            ..GatewayConfig::default()
        };
        let gw = gateway(api.clone(), config).await;

        gw.send_command("D1", &power_on()).await.unwrap();
        let err = gw.send_command("D1", &power_on()).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::QuotaExhausted { retry_after: Some(d) } if d == Duration::from_secs(3600)
        ));
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn polls_leave_the_reserve_to_commands() {
        let api = FlakyApi::new(0, ApiError::RateLimited);
        let config = GatewayConfig {
            quota: 3,
            window: Duration::from_secs(3600),
            poll_reserve: 1,
            max_quota_wait: Duration::ZERO,
            ..GatewayConfig::default()
        };
        let gw = gateway(api.clone(), config).await;

        gw.get_state("D1").await.unwrap();
        gw.list_devices().await.unwrap();
        assert!(matches!(
            gw.get_state("D1").await,
            Err(GatewayError::QuotaExhausted { .. })
        ));
        tokio_test::assert_ok!(gw.send_command("D1", &power_on()).await);
        assert_eq!(gw.usage().await.calls_in_window, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_rate_limit_is_a_quota_error() {
        let api = FlakyApi::new(1, ApiError::RateLimited);
        let gw = gateway(api.clone(), GatewayConfig::default()).await;

        assert_eq!(
            gw.list_devices().await.unwrap_err(),
            GatewayError::QuotaExhausted { retry_after: None }
        );
        assert!(gw.usage().await.remote_limited);
        assert_eq!(api.calls(), 1);

        gw.list_devices().await.unwrap();
        assert!(!gw.usage().await.remote_limited);
    }

    #[tokio::test(start_paused = true)]
    async fn ledger_survives_a_restart() {
        let api = FlakyApi::new(0, ApiError::RateLimited);
        let gw = gateway(api.clone(), GatewayConfig::default()).await;
        gw.get_state("D1").await.unwrap();
        gw.get_state("D1").await.unwrap();

        let saved = gw.ledger_snapshot().await;
        assert_eq!(saved.len(), 2);

        let fresh = gateway(api, GatewayConfig::default()).await;
        let stale = Utc::now() - chrono::Duration::days(2);
        fresh
            .restore_ledger(&[saved[0], saved[1], stale])
            .await;
        assert_eq!(fresh.usage().await.calls_in_window, 2);
    }
}
