use govee_sync_adapter_mqtt::{BusEvent, MqttBridge, MqttBridgeConfig};
use govee_sync_core::{Attribute, AttributeValue, DeviceState, StateSink};
use govee_sync_proto::{ChangeRequest, StateSnapshot, TopicScheme};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;

fn broker() -> Option<(String, u16, String)> {
    if std::env::var("GOVEE_SYNC_INTEGRATION").is_err() {
        eprintln!("Skipping integration test; set GOVEE_SYNC_INTEGRATION=1 to run");
        return None;
    }
    let url = std::env::var("MQTT_BROKER").unwrap_or_else(|_| "tcp://localhost:1883".to_string());
    let trimmed = url
        .strip_prefix("tcp://")
        .or_else(|| url.strip_prefix("mqtt://"))
        .unwrap_or(&url);
    let mut parts = trimmed.split(':');
    let host = parts.next().unwrap_or("localhost").to_string();
    let port = parts.next().and_then(|p| p.parse().ok()).unwrap_or(1883);
    Some((host, port, url))
}

fn client(name: &str, host: &str, port: u16) -> (AsyncClient, EventLoop) {
    let mut opts = MqttOptions::new(
        format!("{name}-{}", std::process::id()),
        host.to_string(),
        port,
    );
    opts.set_keep_alive(Duration::from_secs(5));
    AsyncClient::new(opts, 10)
}

async fn spawn_eventloop(mut eventloop: EventLoop) {
    loop {
        if eventloop.poll().await.is_err() {
            break;
        }
    }
}

fn scheme() -> TopicScheme {
    TopicScheme::new(format!("govee-it-{}", std::process::id()), "homeassistant")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mqtt_change_request_reaches_bridge() {
    let Some((host, port, url)) = broker() else {
        return;
    };
    let topics = scheme();

    let bridge = MqttBridge::new(MqttBridgeConfig {
        mqtt_broker: url,
        client_id: format!("bridge-{}", std::process::id()),
        topics: topics.clone(),
        ..MqttBridgeConfig::default()
    })
    .unwrap();
    bridge.subscribe().await.unwrap();
    let mut events = bridge.start();

    let (pub_client, pub_eventloop) = client("pub", &host, port);
    tokio::spawn(spawn_eventloop(pub_eventloop));
    tokio::time::sleep(Duration::from_millis(500)).await;

    pub_client
        .publish(
            topics.command("AABBCC"),
            QoS::AtLeastOnce,
            false,
            br#"{"brightness":42}"#.to_vec(),
        )
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timeout waiting for bus event")
        .expect("bridge stopped")
        .unwrap();

    assert_eq!(
        event,
        BusEvent::Change(ChangeRequest {
            device_id: "AABBCC".into(),
            attribute: Attribute::Brightness,
            value: AttributeValue::Level(42),
        })
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mqtt_state_is_published_retained() {
    let Some((host, port, url)) = broker() else {
        return;
    };
    let topics = scheme();

    let bridge = MqttBridge::new(MqttBridgeConfig {
        mqtt_broker: url,
        client_id: format!("sink-{}", std::process::id()),
        topics: topics.clone(),
        ..MqttBridgeConfig::default()
    })
    .unwrap();
    let sink = bridge.sink();
    let _events = bridge.start();

    let mut state = DeviceState::new("AABBCC");
    state.apply_report(
        &BTreeMap::from([(Attribute::Power, AttributeValue::Switch(true))]),
        chrono::Utc::now(),
    );
    sink.publish_state(&state).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    // a late subscriber still gets the retained snapshot
    let (sub_client, mut sub_eventloop) = client("sub", &host, port);
    sub_client
        .subscribe(topics.state("AABBCC"), QoS::AtLeastOnce)
        .await
        .unwrap();

    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        loop {
            match sub_eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let _ = tx.send(publish.payload.to_vec());
                    break;
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    let received = timeout(Duration::from_secs(5), rx)
        .await
        .expect("timeout waiting for retained state")
        .expect("subscriber dropped");

    let snapshot = StateSnapshot::from_json(&received).unwrap();
    assert_eq!(snapshot.values["power"], serde_json::json!("ON"));
}
