use async_trait::async_trait;
use govee_sync_adapter_mqtt::BusEvent;
use govee_sync_agent::runtime::handle_event;
use govee_sync_agent::{PollingScheduler, SchedulerSignal, SyncContext, SyncSettings};
use govee_sync_core::{
    Ack, ApiError, Attribute, AttributeValue, BatchPhase, CallPlanner, Capability, Command,
    DeviceDescriptor, DeviceId, DeviceState, RemoteApi, Reported, Rgb, ScheduleConfig,
    ServiceStatus, SinkError, SplitRule, StateSink,
};
use govee_sync_proto::ChangeRequest;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

const BOOST: Duration = Duration::from_secs(5);

/// In-memory vendor API recording every call.
#[derive(Default)]
struct FakeApi {
    devices: Mutex<Vec<DeviceDescriptor>>,
    reported: Mutex<HashMap<DeviceId, Reported>>,
    commands: Mutex<Vec<(DeviceId, Command, Instant)>>,
    polls: Mutex<Vec<(DeviceId, Instant)>>,
    in_flight: Mutex<HashMap<DeviceId, usize>>,
    max_in_flight: Mutex<HashMap<DeviceId, usize>>,
    failing_polls: Mutex<HashSet<DeviceId>>,
    latency: Duration,
}

impl FakeApi {
    fn new(devices: Vec<DeviceDescriptor>, latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            devices: Mutex::new(devices),
            latency,
            ..Self::default()
        })
    }

    fn report(&self, device_id: &str, values: Reported) {
        self.reported
            .lock()
            .unwrap()
            .insert(device_id.to_string(), values);
    }

    fn fail_polls(&self, device_id: &str, failing: bool) {
        let mut failing_polls = self.failing_polls.lock().unwrap();
        if failing {
            failing_polls.insert(device_id.to_string());
        } else {
            failing_polls.remove(device_id);
        }
    }

    fn set_devices(&self, devices: Vec<DeviceDescriptor>) {
        *self.devices.lock().unwrap() = devices;
    }

    fn commands_for(&self, device_id: &str) -> Vec<(Command, Instant)> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _, _)| id == device_id)
            .map(|(_, cmd, at)| (cmd.clone(), *at))
            .collect()
    }

    fn polls_for(&self, device_id: &str) -> Vec<Instant> {
        self.polls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == device_id)
            .map(|(_, at)| *at)
            .collect()
    }

    fn max_in_flight(&self, device_id: &str) -> usize {
        self.max_in_flight
            .lock()
            .unwrap()
            .get(device_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl RemoteApi for FakeApi {
    async fn list_devices(&self) -> Result<Vec<DeviceDescriptor>, ApiError> {
        Ok(self.devices.lock().unwrap().clone())
    }

    async fn get_state(&self, device: &DeviceDescriptor) -> Result<Reported, ApiError> {
        self.polls
            .lock()
            .unwrap()
            .push((device.id.clone(), Instant::now()));
        sleep(self.latency).await;
        if self.failing_polls.lock().unwrap().contains(&device.id) {
            return Err(ApiError::Transient("request timed out".into()));
        }
        Ok(self
            .reported
            .lock()
            .unwrap()
            .get(&device.id)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_command(
        &self,
        device: &DeviceDescriptor,
        command: &Command,
    ) -> Result<Ack, ApiError> {
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            let count = in_flight.entry(device.id.clone()).or_insert(0);
            *count += 1;
            let mut max = self.max_in_flight.lock().unwrap();
            let peak = max.entry(device.id.clone()).or_insert(0);
            *peak = (*peak).max(*count);
        }
        self.commands
            .lock()
            .unwrap()
            .push((device.id.clone(), command.clone(), Instant::now()));

        sleep(self.latency).await;

        *self
            .in_flight
            .lock()
            .unwrap()
            .get_mut(&device.id)
            .unwrap() -= 1;

        let max = device
            .capability(Attribute::Brightness)
            .and_then(|cap| cap.range)
            .map_or(100, |range| range.max);
        if let Some(AttributeValue::Level(level)) = command.values.get(&Attribute::Brightness) {
            if i64::from(*level) > max {
                return Err(ApiError::Rejected {
                    status: 400,
                    message: format!("brightness {level} out of range"),
                });
            }
        }

        let mut reported = self.reported.lock().unwrap();
        let device_state = reported.entry(device.id.clone()).or_default();
        for (attribute, value) in &command.values {
            if attribute.is_reported() {
                device_state.insert(*attribute, value.clone());
            }
        }
        Ok(Ack::default())
    }
}

#[derive(Default)]
struct RecordingSink {
    states: Mutex<Vec<DeviceState>>,
    availability: Mutex<Vec<(DeviceId, bool)>>,
}

impl RecordingSink {
    fn states_for(&self, device_id: &str) -> Vec<DeviceState> {
        self.states
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.device_id == device_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl StateSink for RecordingSink {
    async fn publish_state(&self, state: &DeviceState) -> Result<(), SinkError> {
        self.states.lock().unwrap().push(state.clone());
        Ok(())
    }

    async fn publish_availability(
        &self,
        device_id: &DeviceId,
        online: bool,
    ) -> Result<(), SinkError> {
        self.availability
            .lock()
            .unwrap()
            .push((device_id.clone(), online));
        Ok(())
    }

    async fn publish_service(&self, _: &ServiceStatus) -> Result<(), SinkError> {
        Ok(())
    }
}

fn light(id: &str) -> DeviceDescriptor {
    DeviceDescriptor::new(
        id,
        "H6008",
        "Lamp",
        vec![
            Capability::new(Attribute::Power),
            Capability::with_range(Attribute::Brightness, 1, 100),
        ],
    )
}

struct Harness {
    ctx: Arc<SyncContext>,
    api: Arc<FakeApi>,
    sink: Arc<RecordingSink>,
    scheduler: JoinHandle<()>,
}

impl Harness {
    async fn start(api: Arc<FakeApi>) -> Self {
        Self::start_with(api, SyncSettings::default()).await
    }

    async fn start_with(api: Arc<FakeApi>, settings: SyncSettings) -> Self {
        let sink = Arc::new(RecordingSink::default());
        let (ctx, signals) = SyncContext::new(api.clone(), sink.clone(), settings);
        let config = ScheduleConfig {
            boost_interval: BOOST,
            ..ScheduleConfig::default()
        };
        let scheduler = tokio::spawn(PollingScheduler::new(ctx.clone(), config, signals).run());

        // first inventory refresh and first polls
        sleep(Duration::from_millis(100)).await;

        Self {
            ctx,
            api,
            sink,
            scheduler,
        }
    }

    async fn change(&self, device_id: &str, attribute: Attribute, value: AttributeValue) {
        let event = BusEvent::Change(ChangeRequest {
            device_id: device_id.to_string(),
            attribute,
            value,
        });
        handle_event(&self.ctx, event).await;
    }

    async fn stop(self) {
        self.ctx.shutdown().await;
        self.scheduler.await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn changes_within_window_become_one_call() {
    let api = FakeApi::new(vec![light("D1")], Duration::ZERO);
    api.report(
        "D1",
        Reported::from([
            (Attribute::Power, AttributeValue::Switch(false)),
            (Attribute::Brightness, AttributeValue::Level(10)),
        ]),
    );
    let h = Harness::start(api).await;
    let published_before = h.sink.states_for("D1").len();

    h.change("D1", Attribute::Power, AttributeValue::Switch(true))
        .await;
    sleep(Duration::from_millis(50)).await;
    h.change("D1", Attribute::Brightness, AttributeValue::Level(80))
        .await;
    sleep(Duration::from_millis(400)).await;

    let commands = h.api.commands_for("D1");
    assert_eq!(commands.len(), 1);
    assert_eq!(
        commands[0].0.values,
        Reported::from([
            (Attribute::Power, AttributeValue::Switch(true)),
            (Attribute::Brightness, AttributeValue::Level(80)),
        ])
    );

    let published = h.sink.states_for("D1");
    assert_eq!(published.len(), published_before + 1);
    let state = h.ctx.cache().snapshot("D1").await.unwrap();
    assert_eq!(
        state.value(Attribute::Power),
        Some(&AttributeValue::Switch(true))
    );
    assert_eq!(
        state.value(Attribute::Brightness),
        Some(&AttributeValue::Level(80))
    );
    assert!(state.is_confirmed(Attribute::Brightness));

    // next poll follows the boost interval, not the 30s base
    sleep(Duration::from_secs(6)).await;
    let command_at = commands[0].1;
    let next_poll = h
        .api
        .polls_for("D1")
        .into_iter()
        .find(|at| *at > command_at)
        .expect("boosted poll");
    assert_eq!(next_poll - command_at, BOOST);

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn last_write_wins_within_window() {
    let api = FakeApi::new(vec![light("D1")], Duration::ZERO);
    let h = Harness::start(api).await;

    for level in [20, 35, 60] {
        h.change("D1", Attribute::Brightness, AttributeValue::Level(level))
            .await;
        sleep(Duration::from_millis(20)).await;
    }
    sleep(Duration::from_millis(400)).await;

    let commands = h.api.commands_for("D1");
    assert_eq!(commands.len(), 1);
    assert_eq!(
        commands[0].0,
        Command::single(Attribute::Brightness, AttributeValue::Level(60))
    );

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn one_command_in_flight_per_device() {
    let api = FakeApi::new(vec![light("D1"), light("D3")], Duration::from_secs(2));
    let h = Harness::start(api).await;

    h.change("D1", Attribute::Power, AttributeValue::Switch(true))
        .await;
    h.change("D3", Attribute::Power, AttributeValue::Switch(true))
        .await;
    sleep(Duration::from_millis(350)).await;

    // first D1 call is in flight; these collect into the next batch
    h.change("D1", Attribute::Brightness, AttributeValue::Level(50))
        .await;
    sleep(Duration::from_millis(50)).await;
    h.change("D1", Attribute::Brightness, AttributeValue::Level(55))
        .await;

    sleep(Duration::from_secs(6)).await;

    let commands = h.api.commands_for("D1");
    assert_eq!(commands.len(), 2);
    assert_eq!(h.api.max_in_flight("D1"), 1);
    assert_eq!(
        commands[1].0,
        Command::single(Attribute::Brightness, AttributeValue::Level(55))
    );
    // the second batch waits for the first call to return
    assert!(commands[1].1 - commands[0].1 >= Duration::from_secs(2));

    // other devices are not held up
    assert_eq!(h.api.commands_for("D3").len(), 1);
    assert!(h.api.commands_for("D3")[0].1 < commands[0].1 + Duration::from_secs(2));

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn rejected_command_leaves_state_and_is_not_retried() {
    let api = FakeApi::new(vec![light("D1")], Duration::ZERO);
    api.report(
        "D1",
        Reported::from([(Attribute::Brightness, AttributeValue::Level(40))]),
    );
    let h = Harness::start(api).await;

    h.change("D1", Attribute::Brightness, AttributeValue::Level(200))
        .await;
    sleep(Duration::from_secs(10)).await;

    assert_eq!(h.api.commands_for("D1").len(), 1);
    let coordinator = h.ctx.coordinator("D1").await.unwrap();
    assert_eq!(coordinator.last_outcome().await, Some(BatchPhase::Failed));

    let state = h.ctx.cache().snapshot("D1").await.unwrap();
    assert_eq!(
        state.value(Attribute::Brightness),
        Some(&AttributeValue::Level(40))
    );
    assert!(state.is_confirmed(Attribute::Brightness));

    // a failed batch does not block the next one
    h.change("D1", Attribute::Brightness, AttributeValue::Level(60))
        .await;
    sleep(Duration::from_secs(1)).await;
    assert_eq!(h.api.commands_for("D1").len(), 2);
    assert_eq!(coordinator.last_outcome().await, Some(BatchPhase::Acked));

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn boost_reverts_after_duration() {
    let api = FakeApi::new(vec![light("D1")], Duration::ZERO);
    let h = Harness::start(api).await;

    h.change("D1", Attribute::Power, AttributeValue::Switch(true))
        .await;
    sleep(Duration::from_secs(70)).await;

    let command_at = h.api.commands_for("D1")[0].1;
    let after: Vec<Duration> = h
        .api
        .polls_for("D1")
        .into_iter()
        .filter(|at| *at > command_at)
        .map(|at| at - command_at)
        .collect();

    let secs: Vec<u64> = after.iter().map(Duration::as_secs).collect();
    assert_eq!(secs, vec![5, 10, 15, 20, 25, 30, 60]);

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn vanished_device_is_torn_down_without_sending() {
    let api = FakeApi::new(vec![light("D1"), light("D2")], Duration::ZERO);
    let h = Harness::start(api).await;

    h.change("D2", Attribute::Power, AttributeValue::Switch(true))
        .await;
    let coordinator = h.ctx.coordinator("D2").await.unwrap();
    assert_eq!(coordinator.pending_len().await, 1);

    h.api.set_devices(vec![light("D1")]);
    h.ctx.signal(SchedulerSignal::Rediscover);
    sleep(Duration::from_millis(50)).await;
    let removed_at = Instant::now();

    assert!(coordinator.is_closed());
    assert_eq!(coordinator.pending_len().await, 0);
    assert!(h.ctx.coordinator("D2").await.is_none());
    assert!(h.ctx.cache().get("D2").await.is_none());
    assert!(h
        .sink
        .availability
        .lock()
        .unwrap()
        .contains(&("D2".to_string(), false)));

    sleep(Duration::from_secs(90)).await;
    assert!(h.api.commands_for("D2").is_empty());
    assert!(h.api.polls_for("D2").iter().all(|at| *at < removed_at));
    assert!(h.api.polls_for("D1").iter().any(|at| *at > removed_at));

    // commands for a vanished device fail locally
    h.change("D2", Attribute::Power, AttributeValue::Switch(false))
        .await;
    sleep(Duration::from_secs(1)).await;
    assert!(h.api.commands_for("D2").is_empty());

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_discards_open_windows() {
    let api = FakeApi::new(vec![light("D1")], Duration::ZERO);
    let h = Harness::start(api).await;

    h.change("D1", Attribute::Power, AttributeValue::Switch(true))
        .await;
    let coordinator = h.ctx.coordinator("D1").await.unwrap();

    h.ctx.shutdown().await;
    sleep(Duration::from_secs(1)).await;

    assert!(h.api.commands_for("D1").is_empty());
    assert_eq!(coordinator.pending_len().await, 0);
    h.scheduler.await.unwrap();
}

fn planned_with(fallback: SplitRule) -> SyncSettings {
    SyncSettings {
        planner: CallPlanner::new(Vec::new(), fallback),
        ..SyncSettings::default()
    }
}

#[tokio::test(start_paused = true)]
async fn failed_poll_keeps_state_and_is_retried() {
    let api = FakeApi::new(vec![light("D1"), light("D2")], Duration::ZERO);
    api.report(
        "D1",
        Reported::from([(Attribute::Brightness, AttributeValue::Level(40))]),
    );
    api.report(
        "D2",
        Reported::from([(Attribute::Brightness, AttributeValue::Level(10))]),
    );
    let h = Harness::start(api).await;
    assert_eq!(
        h.ctx.cache().snapshot("D1").await.unwrap().value(Attribute::Brightness),
        Some(&AttributeValue::Level(40))
    );

    h.api.fail_polls("D1", true);
    let failing_since = Instant::now();
    h.api.report(
        "D1",
        Reported::from([(Attribute::Brightness, AttributeValue::Level(90))]),
    );
    h.api.report(
        "D2",
        Reported::from([(Attribute::Brightness, AttributeValue::Level(70))]),
    );
    sleep(Duration::from_secs(65)).await;

    let d1 = h.ctx.cache().snapshot("D1").await.unwrap();
    assert_eq!(
        d1.value(Attribute::Brightness),
        Some(&AttributeValue::Level(40))
    );
    assert!(d1.is_confirmed(Attribute::Brightness));
    assert_eq!(
        h.ctx.cache().snapshot("D2").await.unwrap().value(Attribute::Brightness),
        Some(&AttributeValue::Level(70))
    );
    let failed_polls = h
        .api
        .polls_for("D1")
        .into_iter()
        .filter(|at| *at > failing_since)
        .count();
    assert!(failed_polls >= 2, "failing device stays on its schedule");

    h.api.fail_polls("D1", false);
    sleep(Duration::from_secs(35)).await;
    assert_eq!(
        h.ctx.cache().snapshot("D1").await.unwrap().value(Attribute::Brightness),
        Some(&AttributeValue::Level(90))
    );

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn batch_failing_midway_keeps_what_landed() {
    let lamp = DeviceDescriptor::new(
        "D1",
        "H6008",
        "Lamp",
        vec![
            Capability::new(Attribute::Power),
            Capability::with_range(Attribute::Brightness, 1, 100),
            Capability::new(Attribute::Gradient),
            Capability::new(Attribute::Nightlight),
        ],
    );
    let api = FakeApi::new(vec![lamp], Duration::ZERO);
    api.report(
        "D1",
        Reported::from([
            (Attribute::Power, AttributeValue::Switch(false)),
            (Attribute::Brightness, AttributeValue::Level(40)),
        ]),
    );
    let h = Harness::start_with(api, planned_with(SplitRule::one_per_call())).await;
    let before = h.ctx.cache().snapshot("D1").await.unwrap();

    h.change("D1", Attribute::Power, AttributeValue::Switch(true))
        .await;
    h.change("D1", Attribute::Gradient, AttributeValue::Switch(true))
        .await;
    h.change("D1", Attribute::Brightness, AttributeValue::Level(200))
        .await;
    sleep(Duration::from_secs(1)).await;

    // power lands, brightness is rejected, gradient is never sent
    let commands = h.api.commands_for("D1");
    assert_eq!(commands.len(), 2);
    assert_eq!(
        commands[0].0,
        Command::single(Attribute::Power, AttributeValue::Switch(true))
    );
    assert_eq!(
        commands[1].0,
        Command::single(Attribute::Brightness, AttributeValue::Level(200))
    );
    let coordinator = h.ctx.coordinator("D1").await.unwrap();
    assert_eq!(coordinator.last_outcome().await, Some(BatchPhase::Failed));

    let state = h.ctx.cache().snapshot("D1").await.unwrap();
    assert_eq!(
        state.value(Attribute::Power),
        Some(&AttributeValue::Switch(true))
    );
    assert_eq!(
        state.value(Attribute::Brightness),
        Some(&AttributeValue::Level(40))
    );
    assert_eq!(
        state.value(Attribute::Gradient),
        before.value(Attribute::Gradient)
    );
    // the derived nightlight off rides on the whole batch
    assert_eq!(
        state.value(Attribute::Nightlight),
        before.value(Attribute::Nightlight)
    );

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn light_values_need_one_call_each() {
    let lamp = DeviceDescriptor::new(
        "D1",
        "H6008",
        "Lamp",
        vec![
            Capability::new(Attribute::Power),
            Capability::with_range(Attribute::Brightness, 1, 100),
            Capability::new(Attribute::Color),
        ],
    );
    let api = FakeApi::new(vec![lamp], Duration::ZERO);
    let h = Harness::start_with(api, planned_with(SplitRule::single_capability())).await;

    h.change("D1", Attribute::Power, AttributeValue::Switch(true))
        .await;
    h.change("D1", Attribute::Color, AttributeValue::Rgb(Rgb::new(76, 30, 0)))
        .await;
    sleep(Duration::from_secs(1)).await;

    // power is implied by the color, brightness by its intensity
    let commands = h.api.commands_for("D1");
    assert_eq!(commands.len(), 1);
    assert_eq!(
        commands[0].0,
        Command::single(Attribute::Color, AttributeValue::Rgb(Rgb::new(76, 30, 0)))
    );

    let state = h.ctx.cache().snapshot("D1").await.unwrap();
    assert_eq!(
        state.value(Attribute::Power),
        Some(&AttributeValue::Switch(true))
    );
    assert_eq!(
        state.value(Attribute::Brightness),
        Some(&AttributeValue::Level(30))
    );

    h.stop().await;
}
