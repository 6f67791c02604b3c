//! Inverter agent — the per-inverter read/decode/report pipeline.
//!
//! ```text
//! Init ─▶ Connecting ─▶ Discovering ─▶ Running ◀─┐
//!             │ 3 failures               │ transient│
//!             ▼                          └─────────┘
//!           Fatal                        persistent ─▶ Connecting
//! ```
//!
//! Per tick: build the due-read set from the schedule groups, plan the
//! register spans, run the transactions through the shared connector,
//! decode into the state map, propagate dependency changes, then evaluate
//! the report predicates and publish. Commands drained from the bus are
//! encoded, written back and re-read inside the same tick.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use crate::config::{InverterOptions, Options};
use crate::connect::Connector;
use crate::error::{ConnError, Error};
use crate::mqtt::{self, PublishSink, SensorCommand};
use crate::planner::{self, PlannedRead};
use crate::sensor::{codec, rw};
use crate::sensor_options::SensorOption;
use crate::state::InverterState;
use crate::value::Value;

/// Read retries within one tick, and their spacing.
const READ_RETRIES: u32 = 2;
const RETRY_SPACING: Duration = Duration::from_millis(250);

/// Consecutive failed ticks before the agent drops back to Connecting.
const PERSISTENT_FAILURES: u32 = 3;

/// Failed connect attempts before the agent goes Fatal.
const CONNECT_ATTEMPTS: u32 = 3;

// ───────────────────────────────────────────────────────────────
// Agent state
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Init,
    Connecting,
    Discovering,
    Running,
    Fatal,
}

/// Cumulative per-agent statistics, logged periodically.
#[derive(Debug, Default, Clone)]
pub struct AgentStats {
    pub reads: u64,
    pub read_errors: u64,
    pub decode_errors: u64,
    pub publishes: u64,
    pub commands: u64,
}

// ───────────────────────────────────────────────────────────────
// InverterAgent
// ───────────────────────────────────────────────────────────────

pub struct InverterAgent {
    pub index: usize,
    inv: InverterOptions,
    opt: Arc<Options>,
    connector: Arc<Connector>,
    sensors: Vec<SensorOption>,
    state: InverterState,
    /// read period → sensor indexes.
    read_groups: BTreeMap<u64, Vec<usize>>,
    /// report period → visible sensor indexes.
    report_groups: BTreeMap<u64, Vec<usize>>,
    agent_state: AgentState,
    failed_ticks: u32,
    reconnect_attempts: u32,
    /// Sensors whose discovery metadata must be republished.
    discovery_queue: HashSet<usize>,
    commands: mpsc::Receiver<SensorCommand>,
    stats: AgentStats,
}

impl InverterAgent {
    pub fn new(
        index: usize,
        inv: InverterOptions,
        opt: Arc<Options>,
        connector: Arc<Connector>,
        sensors: Vec<SensorOption>,
        commands: mpsc::Receiver<SensorCommand>,
    ) -> Self {
        let state = InverterState::new(sensors.iter().map(|o| o.sensor.id.as_str()));

        let mut read_groups: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
        let mut report_groups: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
        for (idx, option) in sensors.iter().enumerate() {
            read_groups
                .entry(option.schedule.read_every.max(1))
                .or_default()
                .push(idx);
            if option.visible {
                report_groups
                    .entry(option.schedule.report_every.max(1))
                    .or_default()
                    .push(idx);
            }
        }

        Self {
            index,
            inv,
            opt,
            connector,
            sensors,
            state,
            read_groups,
            report_groups,
            agent_state: AgentState::Init,
            failed_ticks: 0,
            reconnect_attempts: 0,
            discovery_queue: HashSet::new(),
            commands,
            stats: AgentStats::default(),
        }
    }

    pub fn state(&self) -> AgentState {
        self.agent_state
    }

    pub fn stats(&self) -> &AgentStats {
        &self.stats
    }

    pub fn ha_prefix(&self) -> &str {
        &self.inv.ha_prefix
    }

    /// Bold log line for operator-critical messages.
    pub fn log_bold(&self, msg: &str) {
        error!("\x1b[1m{}: {msg}\x1b[0m", self.inv.ha_prefix);
    }

    // ── Connecting ────────────────────────────────────────────

    /// Open the connector and read the startup sensors (serial and rated
    /// power). Three consecutive failures are fatal; so is a serial
    /// mismatch against the configured `serial_nr`.
    pub async fn connect(&mut self) -> Result<(), Error> {
        self.agent_state = AgentState::Connecting;

        let startup: Vec<usize> = (0..self.sensors.len())
            .filter(|&i| self.sensors[i].startup)
            .collect();

        let mut last_err = ConnError::Refused;
        for attempt in 1..=CONNECT_ATTEMPTS {
            match self.read_indexes(&startup).await {
                Ok(()) => {
                    self.verify_serial()?;
                    info!(
                        "{}: connected (unit {}), serial {}",
                        self.inv.ha_prefix,
                        self.inv.modbus_id,
                        self.state
                            .index_of("serial")
                            .map(|i| self.state.slot(i).value.to_string())
                            .unwrap_or_default()
                    );
                    self.agent_state = AgentState::Discovering;
                    return Ok(());
                }
                Err(e) => {
                    warn!("{}: connect attempt {attempt} failed: {e}", self.inv.ha_prefix);
                    last_err = e;
                }
            }
        }
        self.agent_state = AgentState::Fatal;
        Err(Error::FatalInverter(format!(
            "{}: could not connect: {last_err}",
            self.inv.ha_prefix
        )))
    }

    fn verify_serial(&mut self) -> Result<(), Error> {
        let expected = self.inv.serial_nr.trim();
        if expected.is_empty() {
            return Ok(());
        }
        let got = self
            .state
            .index_of("serial")
            .map(|i| self.state.slot(i).value.to_string())
            .unwrap_or_default();
        if got.trim() != expected {
            self.agent_state = AgentState::Fatal;
            return Err(Error::FatalInverter(format!(
                "{}: serial mismatch: expected {expected}, inverter reports {got}",
                self.inv.ha_prefix
            )));
        }
        Ok(())
    }

    // ── Discovering ───────────────────────────────────────────

    /// Publish retained discovery payloads for every visible sensor.
    pub async fn discover(&mut self, sink: &dyn PublishSink) {
        for idx in 0..self.sensors.len() {
            if self.sensors[idx].visible {
                self.publish_discovery(idx, sink).await;
            }
        }
        self.agent_state = AgentState::Running;
        info!("{}: discovery published, running", self.inv.ha_prefix);
    }

    async fn publish_discovery(&self, idx: usize, sink: &dyn PublishSink) {
        let option = &self.sensors[idx];
        let payload = mqtt::discovery_payload(&self.opt, &self.inv, option, &self.state);
        let topic = mqtt::discovery_topic(
            mqtt::component(option),
            &self.inv.ha_prefix,
            &option.sensor.id,
        );
        if let Err(e) = sink.publish(&topic, &payload.to_string(), true).await {
            warn!("{}: {e}", self.inv.ha_prefix);
        }
    }

    // ── Running ───────────────────────────────────────────────

    /// One scheduled tick at `t` seconds since start.
    pub async fn tick(&mut self, t: u64, sink: &dyn PublishSink) {
        match self.agent_state {
            AgentState::Running => {}
            AgentState::Connecting => {
                // Persistent-error recovery: one reconnect attempt per tick,
                // three strikes and the agent is fatal.
                let startup: Vec<usize> = (0..self.sensors.len())
                    .filter(|&i| self.sensors[i].startup)
                    .collect();
                if self.read_indexes(&startup).await.is_ok() {
                    info!("{}: reconnected", self.inv.ha_prefix);
                    self.failed_ticks = 0;
                    self.reconnect_attempts = 0;
                    self.agent_state = AgentState::Running;
                } else {
                    self.reconnect_attempts += 1;
                    if self.reconnect_attempts >= CONNECT_ATTEMPTS {
                        self.log_bold("connection lost and reconnects exhausted");
                        self.agent_state = AgentState::Fatal;
                    }
                    return;
                }
            }
            _ => return,
        }

        // 1. Commands first, so a write is visible to this tick's reads.
        self.drain_commands(t, sink).await;

        // 2. Scheduled reads.
        let due_read = self.due(&self.read_groups, t);
        if !due_read.is_empty() {
            let ok = self.read_due(&due_read).await;
            if ok {
                self.failed_ticks = 0;
            } else {
                self.failed_ticks += 1;
                if self.failed_ticks >= PERSISTENT_FAILURES {
                    warn!(
                        "{}: {} consecutive failed ticks, reconnecting",
                        self.inv.ha_prefix, self.failed_ticks
                    );
                    self.agent_state = AgentState::Connecting;
                    return;
                }
            }
        }

        // 3. Reports.
        let due_report = self.due(&self.report_groups, t);
        for idx in due_report {
            self.report(idx, t, sink).await;
        }
    }

    /// Union of the groups due at `t`.
    fn due(&self, groups: &BTreeMap<u64, Vec<usize>>, t: u64) -> Vec<usize> {
        let mut due: Vec<usize> = groups
            .iter()
            .filter(|(period, _)| t % **period == 0)
            .flat_map(|(_, idxs)| idxs.iter().copied())
            .collect();
        due.sort_unstable();
        due.dedup();
        due
    }

    /// Plan and execute the reads for the due set. Returns `false` when
    /// any span was abandoned after retries (values stay stale).
    async fn read_due(&mut self, due: &[usize]) -> bool {
        let tuples: Vec<&[u16]> = due
            .iter()
            .map(|&i| self.sensors[i].sensor.addresses.as_slice())
            .collect();
        let plan = planner::plan(
            &tuples,
            self.opt.read_sensors_batch_size,
            self.opt.read_allow_gap,
        );

        let mut all_ok = true;
        for planned in plan {
            match self.read_span_with_retry(&planned).await {
                Ok(regs) => self.decode_span(due, &planned, &regs),
                Err(e) => {
                    warn!(
                        "{}: read {}+{} abandoned: {e}",
                        self.inv.ha_prefix, planned.span.start, planned.span.count
                    );
                    all_ok = false;
                }
            }
        }
        all_ok
    }

    async fn read_span_with_retry(&mut self, planned: &PlannedRead) -> Result<Vec<u16>, ConnError> {
        let mut last = ConnError::Timeout;
        for attempt in 0..=READ_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(RETRY_SPACING).await;
            }
            self.stats.reads += 1;
            match self
                .connector
                .read(self.inv.modbus_id, planned.span.start, planned.span.count)
                .await
            {
                Ok(regs) if regs.len() == planned.span.count as usize => return Ok(regs),
                Ok(regs) => {
                    warn!(
                        "{}: short read: {} of {} registers",
                        self.inv.ha_prefix,
                        regs.len(),
                        planned.span.count
                    );
                    last = ConnError::Frame;
                }
                Err(e) => last = e,
            }
            self.stats.read_errors += 1;
        }
        Err(last)
    }

    /// Decode every sensor of a span and fold the values into the state
    /// map, queueing dependency propagation for changed values.
    fn decode_span(&mut self, due: &[usize], planned: &PlannedRead, regs: &[u16]) {
        for &due_pos in &planned.sensors {
            let idx = due[due_pos];
            let sensor = &self.sensors[idx].sensor;
            let words: Vec<u16> = sensor
                .addresses
                .iter()
                .map(|&a| regs[(a - planned.span.start) as usize])
                .collect();

            match codec::decode(sensor, &words, &self.state) {
                Ok(value) => {
                    debug!("{}: {}={value}{}", self.inv.ha_prefix, sensor.id, sensor.unit);
                    if self.state.apply(idx, value) {
                        self.propagate(idx);
                    }
                }
                Err(e) => {
                    // Value stays stale.
                    self.stats.decode_errors += 1;
                    debug!("{}: decode {} failed: {e}", self.inv.ha_prefix, sensor.id);
                }
            }
        }
    }

    /// Dependency propagation: queue a discovery republish for every
    /// sensor affected by this change.
    fn propagate(&mut self, idx: usize) {
        if self.sensors[idx].affects.is_empty() {
            return;
        }
        let affected: Vec<usize> = self.sensors[idx]
            .affects
            .iter()
            .filter_map(|id| self.state.index_of(id))
            .collect();
        debug!(
            "{}: {} changed, discovery republish queued for {} sensors",
            self.inv.ha_prefix,
            self.sensors[idx].sensor.id,
            affected.len()
        );
        self.discovery_queue.extend(affected);
    }

    /// Evaluate the report predicate for one sensor and publish.
    async fn report(&mut self, idx: usize, t: u64, sink: &dyn PublishSink) {
        let option = &self.sensors[idx];
        let slot = self.state.slot(idx);
        if slot.value.is_none() {
            return; // Never decoded.
        }
        if !option.schedule.should_report(&slot.last_published, &slot.value) {
            return;
        }
        let topic = mqtt::state_topic(&self.inv.ha_prefix, &option.sensor.id);
        let payload = slot.value.payload();
        match sink.publish(&topic, &payload, true).await {
            Ok(()) => {
                self.stats.publishes += 1;
                self.state.mark_published(idx, t);
            }
            Err(e) => warn!("{}: {e}", self.inv.ha_prefix),
        }
    }

    // ── Commands ──────────────────────────────────────────────

    async fn drain_commands(&mut self, t: u64, sink: &dyn PublishSink) {
        while let Ok(cmd) = self.commands.try_recv() {
            self.stats.commands += 1;
            self.handle_command(&cmd, t, sink).await;
        }
    }

    /// Encode and write one command, then re-read the affected registers
    /// immediately so the bus sees the inverter's own view.
    pub async fn handle_command(&mut self, cmd: &SensorCommand, t: u64, sink: &dyn PublishSink) {
        let Some(idx) = self.state.index_of(&cmd.sensor_id) else {
            warn!("{}: command for unknown sensor {}", self.inv.ha_prefix, cmd.sensor_id);
            return;
        };
        let sensor = self.sensors[idx].sensor.clone();
        let desired = parse_command_value(&cmd.payload);

        match rw::encode(&sensor, &desired, &self.state) {
            Ok(regs) => {
                info!(
                    "{}: set {} = {} -> {:?}",
                    self.inv.ha_prefix, sensor.id, cmd.payload, regs
                );
                let written = if regs.len() == 1 {
                    self.connector
                        .write_holding(self.inv.modbus_id, sensor.addresses[0], regs[0])
                        .await
                } else {
                    self.connector
                        .write_multiple(self.inv.modbus_id, sensor.addresses[0], &regs)
                        .await
                };
                match written {
                    Ok(()) => {
                        self.clear_command_error(&sensor.id, sink).await;
                        self.reread_sensor(idx, t, sink).await;
                    }
                    Err(e) => {
                        warn!("{}: write {} failed: {e}", self.inv.ha_prefix, sensor.id);
                        self.stats.read_errors += 1;
                    }
                }
            }
            Err(invalid) => {
                warn!("{}: {}: {invalid}", self.inv.ha_prefix, sensor.id);
                let topic = mqtt::command_error_topic(&self.inv.ha_prefix, &sensor.id);
                if let Err(e) = sink.publish(&topic, &invalid.to_string(), true).await {
                    warn!("{}: {e}", self.inv.ha_prefix);
                }
            }
        }
    }

    async fn clear_command_error(&self, sensor_id: &str, sink: &dyn PublishSink) {
        let topic = mqtt::command_error_topic(&self.inv.ha_prefix, sensor_id);
        if let Err(e) = sink.publish(&topic, "", true).await {
            warn!("{}: {e}", self.inv.ha_prefix);
        }
    }

    /// Immediate post-write read-back of one sensor, published right away.
    async fn reread_sensor(&mut self, idx: usize, t: u64, sink: &dyn PublishSink) {
        if self.read_indexes(&[idx]).await.is_ok() {
            // Publish unconditionally: the bus just asked for this value.
            let slot = self.state.slot(idx);
            if !slot.value.is_none() {
                let topic = mqtt::state_topic(&self.inv.ha_prefix, &self.sensors[idx].sensor.id);
                let payload = slot.value.payload();
                if sink.publish(&topic, &payload, true).await.is_ok() {
                    self.stats.publishes += 1;
                    self.state.mark_published(idx, t);
                }
            }
        }
    }

    /// Plan + read + decode an explicit index set (startup, re-reads).
    async fn read_indexes(&mut self, idxs: &[usize]) -> Result<(), ConnError> {
        if idxs.is_empty() {
            return Ok(());
        }
        let tuples: Vec<&[u16]> = idxs
            .iter()
            .map(|&i| self.sensors[i].sensor.addresses.as_slice())
            .collect();
        let plan = planner::plan(
            &tuples,
            self.opt.read_sensors_batch_size,
            self.opt.read_allow_gap,
        );
        for planned in plan {
            let regs = self.read_span_with_retry(&planned).await?;
            self.decode_span(idxs, &planned, &regs);
        }
        Ok(())
    }

    // ── Discovery flush (driven by the 5 s timer callback) ────

    /// Republish queued discovery payloads with freshly resolved
    /// metadata. Returns how many were flushed.
    pub async fn flush_discovery(&mut self, sink: &dyn PublishSink) -> usize {
        if self.discovery_queue.is_empty() {
            return 0;
        }
        let queued: Vec<usize> = self.discovery_queue.drain().collect();
        let mut flushed = 0;
        for idx in queued {
            if self.sensors[idx].visible {
                self.publish_discovery(idx, sink).await;
                flushed += 1;
            }
        }
        flushed
    }

    /// Periodic statistics line.
    pub fn log_stats(&self) {
        info!(
            "{}: totals: reads {}, read errors {}, decode errors {}, publishes {}, commands {}",
            self.inv.ha_prefix,
            self.stats.reads,
            self.stats.read_errors,
            self.stats.decode_errors,
            self.stats.publishes,
            self.stats.commands,
        );
    }
}

/// Interpret a raw command payload: numbers stay numeric, ON/OFF become
/// booleans, anything else is text.
fn parse_command_value(payload: &str) -> Value {
    let trimmed = payload.trim();
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        return Value::Float(f);
    }
    if trimmed.eq_ignore_ascii_case("on") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("off") {
        return Value::Bool(false);
    }
    Value::Text(trimmed.to_string())
}
