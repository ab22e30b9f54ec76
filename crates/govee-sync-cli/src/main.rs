//! # govee-sync CLI
//!
//! Command-line utilities for inspecting devices and checking the agent.

use anyhow::{bail, Context, Result};
use govee_sync_adapter_govee::{GoveeClient, GoveeClientConfig};
use govee_sync_core::model::normalize_device_id;
use govee_sync_core::{DeviceDescriptor, RemoteApi};
use govee_sync_proto::TopicScheme;
use serde_json::{json, Map, Value};
use std::env;
use std::path::Path;
use std::time::{Duration, SystemTime};

/// Ready file older than this means the agent is stuck.
const READY_MAX_AGE: Duration = Duration::from_secs(120);

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "devices" => {
            let client = client_from_env()?;
            let devices = client.list_devices().await.context("Failed to list devices")?;
            for device in &devices {
                println!("{}", describe(device));
            }
        }
        "state" => {
            if args.len() < 3 {
                eprintln!("Usage: govee-sync state <device-id>");
                std::process::exit(1);
            }
            let client = client_from_env()?;
            let device = find_device(&client, &args[2]).await?;
            let reported = client
                .get_state(&device)
                .await
                .context("Failed to fetch device state")?;

            let values: Map<String, Value> = reported
                .iter()
                .map(|(attr, value)| (attr.as_str().to_string(), value.to_json()))
                .collect();
            println!("{}", serde_json::to_string_pretty(&Value::Object(values))?);
        }
        "topics" => {
            if args.len() < 3 {
                eprintln!("Usage: govee-sync topics <device-id>");
                std::process::exit(1);
            }
            let scheme = scheme_from_env();
            let id = normalize_device_id(&args[2]);
            let topics = json!({
                "state": scheme.state(&id),
                "availability": scheme.availability(&id),
                "command": scheme.command(&id),
                "attribute_command": scheme.attribute_command(&id, "{attribute}"),
                "service_state": scheme.service_state(),
            });
            println!("{}", serde_json::to_string_pretty(&topics)?);
        }
        "healthcheck" => {
            let path = env::var("READY_FILE").unwrap_or_else(|_| "/tmp/govee-sync.ready".into());
            if let Err(e) = check_ready(Path::new(&path)) {
                eprintln!("unhealthy: {e:#}");
                std::process::exit(1);
            }
            println!("ok");
        }
        "help" | "--help" | "-h" => {
            print_help();
        }
        cmd => {
            eprintln!("Unknown command: {cmd}");
            print_help();
            std::process::exit(1);
        }
    }

    Ok(())
}

fn client_from_env() -> Result<GoveeClient> {
    let api_key = env::var("GOVEE_API_KEY").context("GOVEE_API_KEY is required")?;
    let mut config = GoveeClientConfig {
        api_key,
        ..GoveeClientConfig::default()
    };
    if let Ok(url) = env::var("GOVEE_API_URL") {
        config.base_url = url;
    }
    GoveeClient::new(config).context("Failed to create Govee client")
}

fn scheme_from_env() -> TopicScheme {
    let defaults = TopicScheme::default();
    TopicScheme::new(
        env::var("MQTT_PREFIX").unwrap_or(defaults.prefix),
        env::var("MQTT_DISCOVERY_PREFIX").unwrap_or(defaults.discovery_prefix),
    )
}

async fn find_device(client: &GoveeClient, id: &str) -> Result<DeviceDescriptor> {
    let wanted = normalize_device_id(id);
    client
        .list_devices()
        .await
        .context("Failed to list devices")?
        .into_iter()
        .find(|d| d.id == wanted)
        .with_context(|| format!("No device with id {id}"))
}

fn describe(device: &DeviceDescriptor) -> String {
    let attributes: Vec<&str> = device
        .capabilities
        .iter()
        .map(|cap| cap.attribute.as_str())
        .collect();
    format!(
        "{}\t{}\t{}\t{}",
        device.id,
        device.sku,
        device.name,
        attributes.join(",")
    )
}

fn check_ready(path: &Path) -> Result<()> {
    let modified = std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .with_context(|| format!("cannot read {}", path.display()))?;
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO);
    if age > READY_MAX_AGE {
        bail!("{} is {}s old", path.display(), age.as_secs());
    }
    Ok(())
}

fn print_help() {
    println!(
        r"govee-sync CLI

USAGE:
    govee-sync <COMMAND> [OPTIONS]

COMMANDS:
    devices           List devices known to the Govee account
    state <id>        Fetch the current state of one device
    topics <id>       Print the bus topics used for a device
    healthcheck       Exit non-zero if the agent's ready file is stale
    help              Show this help message

ENVIRONMENT:
    GOVEE_API_KEY     Govee developer API key (devices, state)
    GOVEE_API_URL     API base URL override
    MQTT_PREFIX       Topic prefix (default: govee2mqtt)
    READY_FILE        Agent ready file (default: /tmp/govee-sync.ready)
"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_ready_file_is_healthy() {
        let dir = std::env::temp_dir().join(format!("govee-sync-ready-{}", std::process::id()));
        std::fs::write(&dir, "now").unwrap();
        assert!(check_ready(&dir).is_ok());
        std::fs::remove_file(&dir).unwrap();

        assert!(check_ready(&dir).is_err());
    }
}
