//! Add-on options.
//!
//! All tunable parameters for the bridge, loaded from the add-on's JSON
//! options file. Complex list fields (`connectors`, `inverters`,
//! `schedules`) are structured per item so a single bad entry produces a
//! pointed error; the remaining fields go through plain serde. Post-load
//! validation enforces the referential integrity the rest of the process
//! relies on (unique prefixes, known connector references, known driver).

use std::path::Path;

use serde::Deserialize;
use serde_json::Value as Json;

use crate::error::Error;
use crate::schedule::Schedule;

// ───────────────────────────────────────────────────────────────
// Connector options
// ───────────────────────────────────────────────────────────────

/// One shared field-side connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectorOptions {
    pub name: String,
    /// tcp, serial or solarman.
    #[serde(rename = "type")]
    pub kind: String,
    pub host: String,
    pub port: u16,
    pub driver: String,
    /// Per-call deadline in seconds.
    pub timeout: u64,
    /// Dongle serial number (solarman only).
    pub dongle_serial: u64,
    pub baudrate: u32,
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: "tcp".into(),
            host: String::new(),
            port: 502,
            driver: "pymodbus".into(),
            timeout: 10,
            dongle_serial: 0,
            baudrate: 9600,
        }
    }
}

impl ConnectorOptions {
    fn validate(&self) -> Result<(), Error> {
        if !matches!(self.kind.as_str(), "tcp" | "serial" | "solarman") {
            return Err(Error::Config(format!("invalid connector type: {}", self.kind)));
        }
        if !matches!(self.driver.as_str(), "pymodbus" | "umodbus" | "solarman") {
            return Err(Error::Config(format!("invalid driver: {}", self.driver)));
        }
        if self.kind == "solarman" && self.dongle_serial == 0 {
            return Err(Error::Config(format!(
                "connector '{}': solarman requires dongle_serial",
                self.name
            )));
        }
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────
// Inverter options
// ───────────────────────────────────────────────────────────────

/// One inverter on the field bus.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InverterOptions {
    /// Reference to a connector name.
    pub connector: String,
    /// Legacy direct port (host:port or device path).
    pub port: String,
    pub modbus_id: u8,
    /// Home-automation topic prefix; must be unique.
    pub ha_prefix: String,
    /// Expected inverter serial; verified against the decoded one.
    pub serial_nr: String,
    pub dongle_serial_number: u64,
}

// ───────────────────────────────────────────────────────────────
// Options
// ───────────────────────────────────────────────────────────────

/// The add-on option set.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Options {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: String,
    pub mqtt_password: String,

    pub number_entity_mode: String,
    /// Minute grid for the timer-program time sensors.
    pub prog_time_interval: u16,
    pub connectors: Vec<ConnectorOptions>,
    pub inverters: Vec<InverterOptions>,
    pub sensor_definitions: String,
    pub sensors: Vec<String>,
    pub sensors_first_inverter: Vec<String>,
    pub read_allow_gap: u16,
    pub read_sensors_batch_size: u16,
    pub schedules: Vec<Schedule>,
    /// Per-call connector deadline in seconds (legacy top-level).
    pub timeout: u64,
    pub debug: u8,
    /// Legacy top-level driver selection.
    pub driver: String,
    pub manufacturer: String,
    pub debug_device: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            mqtt_host: "core-mosquitto".into(),
            mqtt_port: 1883,
            mqtt_username: String::new(),
            mqtt_password: String::new(),
            number_entity_mode: "auto".into(),
            prog_time_interval: 15,
            connectors: Vec::new(),
            inverters: Vec::new(),
            sensor_definitions: "single-phase".into(),
            sensors: Vec::new(),
            sensors_first_inverter: Vec::new(),
            read_allow_gap: 2,
            read_sensors_batch_size: 20,
            schedules: Vec::new(),
            timeout: 10,
            debug: 0,
            driver: "pymodbus".into(),
            manufacturer: "Sunsynk".into(),
            debug_device: String::new(),
        }
    }
}

impl Options {
    /// Load and validate the options file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let json: Json = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        let opt = Self::from_json(json)?;
        opt.validate()?;
        Ok(opt)
    }

    /// Structure the option object, converting the complex list fields
    /// item by item before the rest goes through serde.
    pub fn from_json(mut json: Json) -> Result<Self, Error> {
        let Some(map) = json.as_object_mut() else {
            return Err(Error::Config("options must be a JSON object".into()));
        };

        let connectors = take_list::<ConnectorOptions>(map, "connectors")?;
        let inverters = take_list::<InverterOptions>(map, "inverters")?;
        let schedules = take_list::<Schedule>(map, "schedules")?;

        let mut opt: Self = serde_json::from_value(json)
            .map_err(|e| Error::Config(format!("error loading config: {e}")))?;
        opt.connectors = connectors;
        opt.inverters = inverters;
        opt.schedules = schedules;
        Ok(opt)
    }

    /// Referential-integrity checks. All failures are fatal at startup.
    pub fn validate(&self) -> Result<(), Error> {
        if !matches!(self.driver.as_str(), "pymodbus" | "umodbus" | "solarman") {
            return Err(Error::Config(format!(
                "invalid driver: {}. Expected pymodbus, umodbus or solarman",
                self.driver
            )));
        }
        if !matches!(self.number_entity_mode.as_str(), "auto" | "slider" | "box") {
            return Err(Error::Config(format!(
                "invalid number_entity_mode: {}",
                self.number_entity_mode
            )));
        }
        if self.inverters.is_empty() {
            return Err(Error::Config("at least one inverter is required".into()));
        }

        let mut prefixes = std::collections::HashSet::new();
        for inv in &self.inverters {
            let prefix = inv.ha_prefix.trim().to_lowercase();
            if prefix.is_empty() {
                return Err(Error::Config("ha_prefix is required for every inverter".into()));
            }
            if !prefixes.insert(prefix) {
                return Err(Error::Config("ha_prefix should be unique".into()));
            }
        }

        let mut names = std::collections::HashSet::new();
        for conn in &self.connectors {
            conn.validate()?;
            if !names.insert(conn.name.as_str()) {
                return Err(Error::Config(format!(
                    "connector name '{}' should be unique",
                    conn.name
                )));
            }
        }
        for inv in &self.inverters {
            if !inv.connector.is_empty() && !names.contains(inv.connector.as_str()) {
                return Err(Error::Config(format!(
                    "inverter '{}' references unknown connector '{}'",
                    inv.serial_nr, inv.connector
                )));
            }
            if inv.connector.is_empty() && inv.port.is_empty() && self.debug_device.is_empty() {
                return Err(Error::Config(format!(
                    "inverter '{}' needs either a connector or a port",
                    inv.serial_nr
                )));
            }
        }
        Ok(())
    }

    /// Apply the live-updatable subset from another option set. Everything
    /// else requires a restart; the caller reports which fields changed.
    pub fn apply_live(&mut self, other: &Self) {
        self.debug = other.debug;
        self.timeout = other.timeout;
        self.read_sensors_batch_size = other.read_sensors_batch_size;
        self.read_allow_gap = other.read_allow_gap;
    }

    /// Log level implied by the `debug` option.
    pub fn log_level(&self) -> log::LevelFilter {
        match self.debug {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

fn take_list<T: serde::de::DeserializeOwned>(
    map: &mut serde_json::Map<String, Json>,
    field: &str,
) -> Result<Vec<T>, Error> {
    let Some(raw) = map.remove(field) else {
        return Ok(Vec::new());
    };
    let Json::Array(items) = raw else {
        return Err(Error::Config(format!("{field} must be a list")));
    };
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            serde_json::from_value(item)
                .map_err(|e| Error::Config(format!("{field}[{i}]: {e}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal() -> Json {
        json!({
            "mqtt_host": "broker.local",
            "connectors": [{"name": "mbusd", "type": "tcp", "host": "10.0.0.5", "port": 502}],
            "inverters": [{"connector": "mbusd", "modbus_id": 1, "ha_prefix": "ss1", "serial_nr": "123"}],
            "sensors": ["battery_soc"],
        })
    }

    #[test]
    fn minimal_config_loads_with_defaults() {
        let opt = Options::from_json(minimal()).unwrap();
        opt.validate().unwrap();
        assert_eq!(opt.read_sensors_batch_size, 20);
        assert_eq!(opt.read_allow_gap, 2);
        assert_eq!(opt.timeout, 10);
        assert_eq!(opt.connectors[0].port, 502);
    }

    #[test]
    fn bad_connector_entry_is_a_pointed_error() {
        let mut json = minimal();
        json["connectors"][0]["port"] = json!("not-a-port");
        let err = Options::from_json(json).unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("connectors[0]")));
    }

    #[test]
    fn duplicate_ha_prefix_rejected() {
        let mut json = minimal();
        json["inverters"] = json!([
            {"connector": "mbusd", "modbus_id": 1, "ha_prefix": "ss1"},
            {"connector": "mbusd", "modbus_id": 2, "ha_prefix": "SS1"},
        ]);
        let opt = Options::from_json(json).unwrap();
        assert!(opt.validate().is_err());
    }

    #[test]
    fn unknown_connector_reference_rejected() {
        let mut json = minimal();
        json["inverters"][0]["connector"] = json!("nope");
        let opt = Options::from_json(json).unwrap();
        assert!(opt.validate().is_err());
    }

    #[test]
    fn invalid_driver_rejected() {
        let mut json = minimal();
        json["driver"] = json!("modbus2000");
        let opt = Options::from_json(json).unwrap();
        assert!(matches!(opt.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn solarman_connector_requires_dongle_serial() {
        let mut json = minimal();
        json["connectors"][0]["type"] = json!("solarman");
        let opt = Options::from_json(json).unwrap();
        assert!(opt.validate().is_err());
    }

    #[test]
    fn schedules_structure_per_item() {
        let mut json = minimal();
        json["schedules"] = json!([
            {"key": "battery_soc", "read_every": 5, "report_every": 60, "change_by": 1},
        ]);
        let opt = Options::from_json(json).unwrap();
        assert_eq!(opt.schedules.len(), 1);
        assert_eq!(opt.schedules[0].change_by, 1.0);
    }

    #[test]
    fn live_update_touches_only_the_live_fields() {
        let mut opt = Options::from_json(minimal()).unwrap();
        let mut newer = opt.clone();
        newer.debug = 2;
        newer.timeout = 3;
        newer.read_sensors_batch_size = 8;
        newer.read_allow_gap = 0;
        newer.mqtt_host = "elsewhere".into();

        opt.apply_live(&newer);
        assert_eq!(opt.debug, 2);
        assert_eq!(opt.timeout, 3);
        assert_eq!(opt.read_sensors_batch_size, 8);
        assert_eq!(opt.read_allow_gap, 0);
        assert_eq!(opt.mqtt_host, "broker.local");
    }
}
