//! MQTT boundary — topics, discovery payloads, the publish-sink port and
//! the broker adapter.
//!
//! The core only ever talks to [`PublishSink`]; the rumqttc client lives
//! behind it. Command ingress runs the other way: the broker task parses
//! `SUNSYNK/<ha_prefix>/<sensor_id>/set` topics and hands
//! [`SensorCommand`]s to the owning agent's channel.

use core::fmt;
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use serde_json::json;
use tokio::sync::{mpsc, watch};

use crate::config::{InverterOptions, Options};
use crate::error::Error;
use crate::sensor::{DepValues, SensorKind};
use crate::sensor_options::SensorOption;

/// Root of every state/command topic.
pub const SS_TOPIC: &str = "SUNSYNK";

/// Discovery prefix the home-automation bus watches.
pub const DISCOVERY_PREFIX: &str = "homeassistant";

// ───────────────────────────────────────────────────────────────
// Topics
// ───────────────────────────────────────────────────────────────

pub fn state_topic(ha_prefix: &str, sensor_id: &str) -> String {
    format!("{SS_TOPIC}/{ha_prefix}/{sensor_id}")
}

pub fn command_topic(ha_prefix: &str, sensor_id: &str) -> String {
    format!("{SS_TOPIC}/{ha_prefix}/{sensor_id}/set")
}

/// Retained per-sensor command error state; cleared on the next good
/// command.
pub fn command_error_topic(ha_prefix: &str, sensor_id: &str) -> String {
    format!("{SS_TOPIC}/{ha_prefix}/{sensor_id}/set_error")
}

/// Bridge-wide availability; keyed by the first inverter's prefix.
pub fn availability_topic(first_ha_prefix: &str) -> String {
    format!("{SS_TOPIC}/availability_{first_ha_prefix}")
}

pub fn discovery_topic(component: &str, ha_prefix: &str, sensor_id: &str) -> String {
    format!("{DISCOVERY_PREFIX}/{component}/{ha_prefix}_{sensor_id}/config")
}

// ───────────────────────────────────────────────────────────────
// Publish sink port
// ───────────────────────────────────────────────────────────────

/// A publish attempt that the broker adapter gave up on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishError(pub String);

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "publish failed: {}", self.0)
    }
}

/// The agents publish through this port; adapters decide the wire.
#[async_trait]
pub trait PublishSink: Send + Sync {
    /// Publish and await confirmation. Implementations retry once before
    /// giving up; a returned error means the value was not delivered and
    /// the caller must not update its last-published bookkeeping.
    async fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), PublishError>;
}

// ───────────────────────────────────────────────────────────────
// Discovery payloads
// ───────────────────────────────────────────────────────────────

/// Home-automation component for a sensor.
pub fn component(option: &SensorOption) -> &'static str {
    match option.sensor.kind {
        SensorKind::Binary { .. } => "binary_sensor",
        SensorKind::Switch { .. } => "switch",
        SensorKind::Select { .. } | SensorKind::ProgSlot { .. } => "select",
        SensorKind::Number { .. } => "number",
        SensorKind::Time { .. } | SensorKind::SystemTime => "text",
        _ => "sensor",
    }
}

/// Build the discovery payload for one sensor of one inverter.
///
/// `deps` resolves sensor-referenced number bounds, which is why the
/// dependency propagator re-queues these payloads when a bound sensor
/// changes.
pub fn discovery_payload(
    opt: &Options,
    inv: &InverterOptions,
    option: &SensorOption,
    deps: &dyn DepValues,
) -> serde_json::Value {
    let sensor = &option.sensor;
    let uid = format!("{}_{}", inv.ha_prefix, sensor.id);
    let mut payload = json!({
        "name": sensor.name,
        "unique_id": uid,
        "state_topic": state_topic(&inv.ha_prefix, &sensor.id),
        "availability_topic": availability_topic(&opt.inverters[0].ha_prefix),
        "device": {
            "identifiers": [format!("sunsynk_{}", inv.serial_nr)],
            "name": format!("Sunsynk inverter {}", inv.serial_nr),
            "manufacturer": opt.manufacturer,
        },
    });
    if !sensor.unit.is_empty() {
        payload["unit_of_measurement"] = json!(sensor.unit);
    }
    if sensor.is_writable() {
        payload["command_topic"] = json!(command_topic(&inv.ha_prefix, &sensor.id));
    }

    match &sensor.kind {
        SensorKind::Number { min, max } => {
            payload["min"] = json!(min.resolve(deps, 0));
            payload["max"] = json!(max.resolve(deps, i64::from(u16::MAX)));
            payload["step"] = json!(sensor.factor.abs());
            payload["mode"] = json!(match opt.number_entity_mode.as_str() {
                "slider" => "slider",
                "box" => "box",
                _ => "auto",
            });
        }
        SensorKind::Select { options } | SensorKind::ProgSlot { options } => {
            let labels: Vec<&str> = options.iter().map(|(_, l)| l.as_str()).collect();
            payload["options"] = json!(labels);
        }
        SensorKind::Switch { .. } | SensorKind::Binary { .. } => {
            payload["payload_on"] = json!("ON");
            payload["payload_off"] = json!("OFF");
        }
        _ => {}
    }
    payload
}

// ───────────────────────────────────────────────────────────────
// Command ingress
// ───────────────────────────────────────────────────────────────

/// A writable-sensor command received from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorCommand {
    pub sensor_id: String,
    pub payload: String,
}

/// Routes command topics to the owning agent's channel by `ha_prefix`.
#[derive(Default)]
pub struct CommandRouter {
    routes: HashMap<String, mpsc::Sender<SensorCommand>>,
}

impl CommandRouter {
    pub fn add(&mut self, ha_prefix: &str, tx: mpsc::Sender<SensorCommand>) {
        self.routes.insert(ha_prefix.to_string(), tx);
    }

    /// Dispatch one incoming publish. Unknown topics are ignored.
    pub fn route(&self, topic: &str, payload: &str) {
        let mut parts = topic.split('/');
        let (root, prefix, sensor_id, verb) =
            (parts.next(), parts.next(), parts.next(), parts.next());
        if root != Some(SS_TOPIC) || verb != Some("set") || parts.next().is_some() {
            return;
        }
        let (Some(prefix), Some(sensor_id)) = (prefix, sensor_id) else {
            return;
        };
        let Some(tx) = self.routes.get(prefix) else {
            warn!("command for unknown inverter prefix: {topic}");
            return;
        };
        let cmd = SensorCommand {
            sensor_id: sensor_id.to_string(),
            payload: payload.to_string(),
        };
        if tx.try_send(cmd).is_err() {
            warn!("command queue full, dropping {topic}");
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Broker adapter (rumqttc)
// ───────────────────────────────────────────────────────────────

/// rumqttc-backed sink. Publishes at-least-once with one retry.
pub struct MqttSink {
    client: AsyncClient,
}

#[async_trait]
impl PublishSink for MqttSink {
    async fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<(), PublishError> {
        if let Err(e) = self
            .client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await
        {
            warn!("publish to {topic} failed ({e}), retrying once");
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.client
                .publish(topic, QoS::AtLeastOnce, retain, payload)
                .await
                .map_err(|e| PublishError(e.to_string()))?;
        }
        Ok(())
    }
}

impl MqttSink {
    pub async fn disconnect(&self) {
        let _ = self.client.disconnect().await;
    }
}

/// Connect to the broker and spawn its event-loop task.
///
/// The task subscribes to the command topics after every (re)connect,
/// routes inbound commands, and exits when the shutdown flag trips.
pub fn connect_broker(
    opt: &Options,
    router: CommandRouter,
    mut shutdown: watch::Receiver<bool>,
) -> Result<MqttSink, Error> {
    let mut mqtt_opts = MqttOptions::new("sunsynk-bridge", opt.mqtt_host.clone(), opt.mqtt_port);
    mqtt_opts.set_keep_alive(Duration::from_secs(30));
    if !opt.mqtt_username.is_empty() {
        mqtt_opts.set_credentials(opt.mqtt_username.clone(), opt.mqtt_password.clone());
    }
    let availability = availability_topic(&opt.inverters[0].ha_prefix);
    mqtt_opts.set_last_will(LastWill::new(
        &availability,
        "offline",
        QoS::AtLeastOnce,
        true,
    ));

    let (client, mut eventloop) = AsyncClient::new(mqtt_opts, 64);
    let subscriber = client.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("MQTT connected");
                        let filter = format!("{SS_TOPIC}/+/+/set");
                        if let Err(e) = subscriber.subscribe(filter, QoS::AtLeastOnce).await {
                            warn!("command subscribe failed: {e}");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let payload = String::from_utf8_lossy(&publish.payload);
                        router.route(&publish.topic, payload.trim());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("MQTT connection error: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    Ok(MqttSink { client })
}
