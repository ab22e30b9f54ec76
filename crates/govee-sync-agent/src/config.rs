//! Agent configuration.

use crate::context::SyncSettings;
use crate::coordinator::DEFAULT_DEBOUNCE;
use crate::gateway::GatewayConfig;
use anyhow::{bail, Context, Result};
use govee_sync_adapter_govee::GoveeClientConfig;
use govee_sync_adapter_mqtt::MqttBridgeConfig;
use govee_sync_core::{CallPlanner, ScheduleConfig, SplitRule};
use govee_sync_proto::TopicScheme;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Vendor API configuration
    pub api: ApiConfig,

    /// Poll cadence
    pub schedule: ScheduleConfig,

    /// Quota and batching configuration
    pub sync: SyncConfig,

    /// Bus configuration
    pub mqtt: MqttConfig,

    /// Persistence configuration
    pub persistence: PersistenceConfig,

    /// Healthcheck marker file
    pub ready_file: PathBuf,

    /// Debug logging
    pub debug: bool,
}

/// Vendor API configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// API base URL
    pub base_url: String,

    /// Developer API key
    pub api_key: String,
}

/// Quota and batching configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Rolling 24h call ceiling
    pub daily_quota: usize,

    /// Calls kept back for commands near the ceiling
    pub poll_reserve: usize,

    /// Command batching window
    pub debounce: Duration,

    /// Per-model call splitting rules
    pub split_rules: Vec<SplitRule>,
}

/// Bus configuration.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// MQTT broker URL
    pub broker: String,

    /// Optional username
    pub username: Option<String>,

    /// Optional password
    pub password: Option<String>,

    /// Topic prefix
    pub prefix: String,

    /// Home-automation status prefix
    pub discovery_prefix: String,
}

/// Where the call ledger lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// `SQLite` file
    Sqlite,
    /// Not persisted
    Memory,
}

impl FromStr for StoreKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(StoreKind::Sqlite),
            "memory" => Ok(StoreKind::Memory),
            other => bail!("unknown store type '{other}', expected sqlite or memory"),
        }
    }
}

/// Persistence configuration.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Store type
    pub store: StoreKind,

    /// Database path (for `SQLite`)
    pub db_path: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let client = GoveeClientConfig::default();
        let topics = TopicScheme::default();
        Self {
            api: ApiConfig {
                base_url: client.base_url,
                api_key: String::new(),
            },
            schedule: ScheduleConfig::default(),
            sync: SyncConfig {
                daily_quota: 10_000,
                poll_reserve: 100,
                debounce: DEFAULT_DEBOUNCE,
                split_rules: Vec::new(),
            },
            mqtt: MqttConfig {
                broker: "tcp://localhost:1883".to_string(),
                username: None,
                password: None,
                prefix: topics.prefix,
                discovery_prefix: topics.discovery_prefix,
            },
            persistence: PersistenceConfig {
                store: StoreKind::Sqlite,
                db_path: PathBuf::from("./govee-sync.db"),
            },
            ready_file: PathBuf::from("/tmp/govee-sync.ready"),
            debug: false,
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `GOVEE_API_KEY`: vendor API key (required)
    /// - `GOVEE_API_URL`: API base URL
    /// - `GOVEE_DEVICE_INTERVAL`, `GOVEE_DEVICE_BOOST_INTERVAL`,
    ///   `GOVEE_BOOST_DURATION`, `GOVEE_LIST_INTERVAL`: seconds
    /// - `GOVEE_DAILY_QUOTA`, `GOVEE_POLL_RESERVE`: call counts
    /// - `GOVEE_DEBOUNCE_MS`: batching window
    /// - `GOVEE_SPLIT_RULES`: JSON list of call-splitting rules
    /// - `MQTT_BROKER`, `MQTT_USERNAME`, `MQTT_PASSWORD`, `MQTT_PREFIX`,
    ///   `MQTT_DISCOVERY_PREFIX`
    /// - `GOVEE_STORE`: "sqlite" or "memory"
    /// - `GOVEE_DB_PATH`: `SQLite` database path
    /// - `READY_FILE`: healthcheck marker
    /// - `GOVEE_DEBUG`: debug logging
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing or a value cannot be parsed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing or a value cannot be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        config.api.api_key = lookup("GOVEE_API_KEY")
            .filter(|key| !key.trim().is_empty())
            .context("GOVEE_API_KEY is required")?;

        if let Some(url) = lookup("GOVEE_API_URL") {
            config.api.base_url = url;
        }

        if let Some(interval) = seconds(&lookup, "GOVEE_DEVICE_INTERVAL")? {
            config.schedule.base_interval = interval;
        }
        if let Some(interval) = seconds(&lookup, "GOVEE_DEVICE_BOOST_INTERVAL")? {
            config.schedule.boost_interval = interval;
        }
        if let Some(duration) = seconds(&lookup, "GOVEE_BOOST_DURATION")? {
            config.schedule.boost_duration = duration;
        }
        if let Some(interval) = seconds(&lookup, "GOVEE_LIST_INTERVAL")? {
            config.schedule.list_interval = interval;
        }

        if let Some(quota) = number(&lookup, "GOVEE_DAILY_QUOTA")? {
            config.sync.daily_quota = quota;
        }
        if let Some(reserve) = number(&lookup, "GOVEE_POLL_RESERVE")? {
            config.sync.poll_reserve = reserve;
        }
        if let Some(ms) = number::<u64>(&lookup, "GOVEE_DEBOUNCE_MS")? {
            config.sync.debounce = Duration::from_millis(ms);
        }

        // Parse split rules from JSON env var
        if let Some(rules_json) = lookup("GOVEE_SPLIT_RULES") {
            config.sync.split_rules =
                serde_json::from_str(&rules_json).context("Invalid GOVEE_SPLIT_RULES JSON")?;
        }

        if let Some(broker) = lookup("MQTT_BROKER") {
            config.mqtt.broker = broker;
        }
        config.mqtt.username = lookup("MQTT_USERNAME");
        config.mqtt.password = lookup("MQTT_PASSWORD");
        if let Some(prefix) = lookup("MQTT_PREFIX") {
            config.mqtt.prefix = prefix;
        }
        if let Some(prefix) = lookup("MQTT_DISCOVERY_PREFIX") {
            config.mqtt.discovery_prefix = prefix;
        }

        if let Some(store) = lookup("GOVEE_STORE") {
            config.persistence.store = store.parse().context("Invalid GOVEE_STORE")?;
        }
        if let Some(db_path) = lookup("GOVEE_DB_PATH") {
            config.persistence.db_path = PathBuf::from(db_path);
        }

        if let Some(path) = lookup("READY_FILE") {
            config.ready_file = PathBuf::from(path);
        }

        if let Some(debug) = lookup("GOVEE_DEBUG") {
            config.debug = matches!(debug.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }

        Ok(config)
    }

    /// Vendor client settings.
    #[must_use]
    pub fn client_config(&self) -> GoveeClientConfig {
        GoveeClientConfig {
            base_url: self.api.base_url.clone(),
            api_key: self.api.api_key.clone(),
            ..GoveeClientConfig::default()
        }
    }

    /// Bus bridge settings.
    #[must_use]
    pub fn bridge_config(&self) -> MqttBridgeConfig {
        MqttBridgeConfig {
            mqtt_broker: self.mqtt.broker.clone(),
            username: self.mqtt.username.clone(),
            password: self.mqtt.password.clone(),
            topics: TopicScheme::new(&self.mqtt.prefix, &self.mqtt.discovery_prefix),
            ..MqttBridgeConfig::default()
        }
    }

    /// Shared context settings.
    ///
    /// The vendor API takes one capability per control request, so models
    /// without a rule fall back to one attribute per call.
    #[must_use]
    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            gateway: GatewayConfig {
                quota: self.sync.daily_quota,
                poll_reserve: self.sync.poll_reserve,
                ..GatewayConfig::default()
            },
            debounce: self.sync.debounce,
            planner: CallPlanner::new(
                self.sync.split_rules.clone(),
                SplitRule::single_capability(),
            ),
        }
    }
}

fn number<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("Invalid {key}: '{raw}'"))
        })
        .transpose()
}

fn seconds(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<Duration>> {
    match number::<u64>(lookup, key)? {
        Some(0) => bail!("{key} must be greater than zero"),
        Some(secs) => Ok(Some(Duration::from_secs(secs))),
        None => Ok(None),
    }
}
