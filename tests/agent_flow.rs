//! Integration tests: agent → planner → connector → decode → report,
//! driven end to end with a scripted mock transport and a recording
//! publish sink.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use sunsynk_bridge::ConnError;
use sunsynk_bridge::agent::{AgentState, InverterAgent};
use sunsynk_bridge::config::{InverterOptions, Options};
use sunsynk_bridge::connect::{Connector, Transport};
use sunsynk_bridge::mqtt::{PublishError, PublishSink, SensorCommand};
use sunsynk_bridge::schedule::Schedule;
use sunsynk_bridge::sensor::{Bound, Sensor, SensorKind};
use sunsynk_bridge::sensor_options::SensorOption;

// ── Mock field bus ────────────────────────────────────────────

#[derive(Default)]
struct FieldState {
    registers: HashMap<u16, u16>,
    /// Fail this many upcoming reads with a timeout.
    fail_next_reads: u32,
    read_log: Vec<(u16, u16)>,
    write_log: Vec<(u16, Vec<u16>)>,
}

#[derive(Clone)]
struct MockField(Arc<Mutex<FieldState>>);

impl MockField {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(FieldState::default())))
    }

    fn set(&self, addr: u16, value: u16) {
        self.0.lock().unwrap().registers.insert(addr, value);
    }

    fn set_serial(&self, base: u16, text: &str) {
        let bytes: Vec<u8> = text.bytes().collect();
        for (i, pair) in bytes.chunks(2).enumerate() {
            let word = (u16::from(pair[0]) << 8) | u16::from(*pair.get(1).unwrap_or(&b' '));
            self.set(base + i as u16, word);
        }
    }

    fn fail_reads(&self, n: u32) {
        self.0.lock().unwrap().fail_next_reads = n;
    }

    fn reads(&self) -> usize {
        self.0.lock().unwrap().read_log.len()
    }

    fn writes(&self) -> Vec<(u16, Vec<u16>)> {
        self.0.lock().unwrap().write_log.clone()
    }
}

struct MockTransport(MockField);

#[async_trait]
impl Transport for MockTransport {
    async fn read_holding(
        &mut self,
        _unit: u8,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, ConnError> {
        let mut field = self.0.0.lock().unwrap();
        field.read_log.push((start, count));
        if field.fail_next_reads > 0 {
            field.fail_next_reads -= 1;
            return Err(ConnError::Timeout);
        }
        Ok((start..start + count)
            .map(|a| field.registers.get(&a).copied().unwrap_or(0))
            .collect())
    }

    async fn write_register(&mut self, _unit: u8, addr: u16, value: u16) -> Result<(), ConnError> {
        let mut field = self.0.0.lock().unwrap();
        field.write_log.push((addr, vec![value]));
        field.registers.insert(addr, value);
        Ok(())
    }

    async fn write_registers(
        &mut self,
        _unit: u8,
        addr: u16,
        values: &[u16],
    ) -> Result<(), ConnError> {
        let mut field = self.0.0.lock().unwrap();
        field.write_log.push((addr, values.to_vec()));
        for (i, v) in values.iter().enumerate() {
            field.registers.insert(addr + i as u16, *v);
        }
        Ok(())
    }
}

// ── Recording sink ────────────────────────────────────────────

#[derive(Default)]
struct RecordingSink {
    published: Mutex<Vec<(String, String, bool)>>,
}

impl RecordingSink {
    fn on_topic(&self, topic: &str) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _, _)| t == topic)
            .map(|(_, p, _)| p.clone())
            .collect()
    }

    fn topics(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(t, _, _)| t.clone())
            .collect()
    }
}

#[async_trait]
impl PublishSink for RecordingSink {
    async fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), PublishError> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_string(), retain));
        Ok(())
    }
}

// ── Fixture ───────────────────────────────────────────────────

const SERIAL_BASE: u16 = 3;
const RATED_POWER_ADDR: u16 = 16;
const SOC_ADDR: u16 = 184;
const EXPORT_LIMIT_ADDR: u16 = 245;

fn option(sensor: Sensor, schedule: Schedule, visible: bool, startup: bool) -> SensorOption {
    SensorOption {
        sensor,
        schedule,
        visible,
        startup,
        first: false,
        affects: Vec::new(),
    }
}

/// A compact sensor set: the two startup sensors, one reported scalar and
/// one writable number whose max follows rated power.
fn sensor_set() -> Vec<SensorOption> {
    let fast = Schedule::new("", 1, 1).change_any();
    let export_limit = option(
        Sensor::new(
            &[EXPORT_LIMIT_ADDR],
            "Export limit power",
            "W",
            1.0,
            SensorKind::Number {
                min: Bound::Const(0),
                max: Bound::Sensor("rated_power".into()),
            },
        ),
        fast.clone(),
        true,
        false,
    );

    let mut rated = option(
        Sensor::scalar(&[RATED_POWER_ADDR], "Rated power", "W", 1.0),
        Schedule::new("", 1, 1).change_any(),
        false,
        true,
    );
    rated.affects = vec!["export_limit_power".to_string()];

    vec![
        option(
            Sensor::new(&[SERIAL_BASE, SERIAL_BASE + 1], "Serial", "", 1.0, SensorKind::Serial),
            Schedule::new("", 3600, 3600),
            false,
            true,
        ),
        rated,
        option(
            Sensor::scalar(&[SOC_ADDR], "Battery SOC", "%", 1.0),
            fast.clone(),
            true,
            false,
        ),
        export_limit,
    ]
}

struct Fixture {
    field: MockField,
    agent: InverterAgent,
    sink: RecordingSink,
    commands: mpsc::Sender<SensorCommand>,
}

fn fixture(serial_nr: &str) -> Fixture {
    let field = MockField::new();
    field.set_serial(SERIAL_BASE, "AB12");
    field.set(RATED_POWER_ADDR, 5000);
    field.set(SOC_ADDR, 50);

    let mut opt = Options::default();
    let inv = InverterOptions {
        ha_prefix: "ss1".into(),
        modbus_id: 1,
        serial_nr: serial_nr.into(),
        connector: "mock".into(),
        ..InverterOptions::default()
    };
    opt.inverters.push(inv.clone());

    let connector = Arc::new(Connector::new(
        "mock",
        5,
        Box::new(MockTransport(field.clone())),
    ));
    let (tx, rx) = mpsc::channel(8);
    let agent = InverterAgent::new(0, inv, Arc::new(opt), connector, sensor_set(), rx);

    Fixture {
        field,
        agent,
        sink: RecordingSink::default(),
        commands: tx,
    }
}

// ── Tests ─────────────────────────────────────────────────────

#[tokio::test]
async fn connect_reads_startup_sensors_and_discovers() {
    let mut f = fixture("AB12");
    f.agent.connect().await.unwrap();
    assert_eq!(f.agent.state(), AgentState::Discovering);

    f.agent.discover(&f.sink).await;
    assert_eq!(f.agent.state(), AgentState::Running);

    // Only the two visible sensors get discovery payloads.
    let topics = f.sink.topics();
    assert!(topics.contains(&"homeassistant/sensor/ss1_battery_soc/config".to_string()));
    assert!(topics.contains(&"homeassistant/number/ss1_export_limit_power/config".to_string()));
    assert!(!topics.iter().any(|t| t.contains("ss1_serial")));
}

#[tokio::test]
async fn serial_mismatch_is_fatal() {
    let mut f = fixture("OTHER");
    let err = f.agent.connect().await.unwrap_err();
    assert!(err.to_string().contains("serial mismatch"));
    assert_eq!(f.agent.state(), AgentState::Fatal);
}

#[tokio::test(start_paused = true)]
async fn connect_goes_fatal_after_three_failures() {
    let f = fixture("");
    let mut agent = f.agent;
    f.field.fail_reads(u32::MAX);
    assert!(agent.connect().await.is_err());
    assert_eq!(agent.state(), AgentState::Fatal);
}

#[tokio::test]
async fn tick_decodes_and_publishes_on_change() {
    let mut f = fixture("");
    f.agent.connect().await.unwrap();
    f.agent.discover(&f.sink).await;

    let soc_topic = "SUNSYNK/ss1/battery_soc";
    f.agent.tick(1, &f.sink).await;
    assert_eq!(f.sink.on_topic(soc_topic), vec!["50"]);

    // change_any: same value does not republish.
    f.agent.tick(2, &f.sink).await;
    assert_eq!(f.sink.on_topic(soc_topic), vec!["50"]);

    f.field.set(SOC_ADDR, 51);
    f.agent.tick(3, &f.sink).await;
    assert_eq!(f.sink.on_topic(soc_topic), vec!["50", "51"]);
}

#[tokio::test(start_paused = true)]
async fn failed_reads_leave_values_stale() {
    let mut f = fixture("");
    f.agent.connect().await.unwrap();
    f.agent.discover(&f.sink).await;

    f.agent.tick(1, &f.sink).await;
    let soc_topic = "SUNSYNK/ss1/battery_soc";
    assert_eq!(f.sink.on_topic(soc_topic), vec!["50"]);

    // Every retry of this tick fails; the value must stay 50 and no new
    // publish may fire (change_any sees no change).
    f.field.set(SOC_ADDR, 80);
    f.field.fail_reads(100);
    f.agent.tick(2, &f.sink).await;
    assert_eq!(f.sink.on_topic(soc_topic), vec!["50"]);
    assert_eq!(f.agent.state(), AgentState::Running);

    // Recovery on the next tick picks up the new value.
    f.field.fail_reads(0);
    f.agent.tick(3, &f.sink).await;
    assert_eq!(f.sink.on_topic(soc_topic), vec!["50", "80"]);
}

#[tokio::test(start_paused = true)]
async fn reads_retry_twice_within_a_tick() {
    let mut f = fixture("");
    f.agent.connect().await.unwrap();
    f.agent.discover(&f.sink).await;
    let before = f.field.reads();

    // Two failures, then success: the tick still lands the value. The
    // tick reads three single-register spans; the first one eats both
    // failures and succeeds on its third attempt.
    f.field.set(SOC_ADDR, 60);
    f.field.fail_reads(2);
    f.agent.tick(1, &f.sink).await;
    assert_eq!(f.field.reads() - before, 5, "3 attempts for span one, 1 each for the rest");
    assert!(f.sink.on_topic("SUNSYNK/ss1/battery_soc").contains(&"60".to_string()));
}

#[tokio::test(start_paused = true)]
async fn persistent_failures_escalate_to_connecting() {
    let mut f = fixture("");
    f.agent.connect().await.unwrap();
    f.agent.discover(&f.sink).await;

    f.field.fail_reads(u32::MAX);
    for t in 1..=3 {
        f.agent.tick(t, &f.sink).await;
    }
    assert_eq!(f.agent.state(), AgentState::Connecting);
}

#[tokio::test]
async fn command_writes_and_rereads_immediately() {
    let mut f = fixture("");
    f.agent.connect().await.unwrap();
    f.agent.discover(&f.sink).await;

    f.commands
        .send(SensorCommand {
            sensor_id: "export_limit_power".into(),
            payload: "2000".into(),
        })
        .await
        .unwrap();
    f.agent.tick(1, &f.sink).await;

    assert_eq!(f.field.writes(), vec![(EXPORT_LIMIT_ADDR, vec![2000])]);
    // The post-write re-read published the inverter's own value.
    assert!(
        f.sink
            .on_topic("SUNSYNK/ss1/export_limit_power")
            .contains(&"2000".to_string())
    );
    // The retained command error state was cleared.
    assert_eq!(
        f.sink.on_topic("SUNSYNK/ss1/export_limit_power/set_error"),
        vec![""]
    );
}

#[tokio::test]
async fn invalid_command_reports_retained_error_and_writes_nothing() {
    let mut f = fixture("");
    f.agent.connect().await.unwrap();
    f.agent.discover(&f.sink).await;

    // rated_power is 5000, so 6000 is out of range for the dependent max.
    f.commands
        .send(SensorCommand {
            sensor_id: "export_limit_power".into(),
            payload: "6000".into(),
        })
        .await
        .unwrap();
    f.agent.tick(1, &f.sink).await;

    assert!(f.field.writes().is_empty());
    let errors = f.sink.on_topic("SUNSYNK/ss1/export_limit_power/set_error");
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("6000"));
    assert_eq!(f.agent.state(), AgentState::Running);
}

#[tokio::test]
async fn dependency_change_requeues_discovery_metadata() {
    let mut f = fixture("");
    f.agent.connect().await.unwrap();
    f.agent.discover(&f.sink).await;
    f.agent.tick(1, &f.sink).await;

    let discovery_topic = "homeassistant/number/ss1_export_limit_power/config";
    let initial = f.sink.on_topic(discovery_topic);
    assert_eq!(initial.len(), 1);
    assert!(initial[0].contains("\"max\":5000"));

    // Rated power changes; the dependent number's advertised max follows
    // on the next discovery flush.
    f.field.set(RATED_POWER_ADDR, 8000);
    f.agent.tick(2, &f.sink).await;
    let flushed = f.agent.flush_discovery(&f.sink).await;
    assert_eq!(flushed, 1);

    let after = f.sink.on_topic(discovery_topic);
    assert_eq!(after.len(), 2);
    assert!(after[1].contains("\"max\":8000"));
}

#[tokio::test]
async fn hidden_sensors_are_read_but_never_published() {
    let mut f = fixture("");
    f.agent.connect().await.unwrap();
    f.agent.discover(&f.sink).await;
    f.agent.tick(1, &f.sink).await;

    assert!(!f.sink.topics().iter().any(|t| t.contains("rated_power")));
}
