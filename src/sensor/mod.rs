//! Sensor model.
//!
//! A [`Sensor`] describes how one or more inverter holding registers map to
//! a typed value: the ordered register tuple, a numeric factor (a negative
//! factor marks the register as two's-complement signed over its full
//! width), an optional bitmask, and a [`SensorKind`] tag that selects the
//! decode/encode behavior. The nine concrete shapes are a tagged variant
//! rather than a type hierarchy, so dispatch is a single `match` in the
//! codec.
//!
//! Identity is the slug of the name; it is stable for the process lifetime
//! and doubles as the MQTT topic segment.

pub mod codec;
pub mod defs;
pub mod rw;

use crate::value::Value;

/// Id of the load-limit sensor that gates zero-export sign handling.
pub const LOAD_LIMIT_ID: &str = "load_limit";

/// Raw register value of the load-limit "Zero Export" mode.
pub const LOAD_LIMIT_ZERO_EXPORT: i64 = 2;

// ───────────────────────────────────────────────────────────────
// Sensor
// ───────────────────────────────────────────────────────────────

/// One inverter register-backed sensor.
#[derive(Debug, Clone)]
pub struct Sensor {
    /// Human-readable name, e.g. "Battery SOC".
    pub name: String,
    /// Stable identity: the slug of the name, e.g. `battery_soc`.
    pub id: String,
    /// Ordered holding-register addresses (low word first).
    pub addresses: Vec<u16>,
    /// Unit string for discovery, e.g. "W" or "%".
    pub unit: String,
    /// Scale factor. Negative means signed decode over `16 * width` bits.
    pub factor: f64,
    /// Optional register bitmask (0 = no mask). Applied per word before
    /// the words are combined.
    pub bitmask: u16,
    /// Variant-specific behavior.
    pub kind: SensorKind,
}

/// The concrete sensor shapes.
#[derive(Debug, Clone)]
pub enum SensorKind {
    /// Single- or multi-register numeric.
    Scalar {
        /// Negative decodes flip positive.
        absolute: bool,
        /// Negative decodes flip positive only while the `load_limit`
        /// sensor reads the Zero Export mode.
        zero_export_absolute: bool,
    },
    /// Weighted sum over several registers, each decoded signed 16-bit.
    Math {
        factors: Vec<f64>,
        /// Clamp results below zero to zero.
        no_negative: bool,
        absolute: bool,
    },
    /// Scalar minus a fixed offset (temperatures are stored offset by 100).
    Temperature { offset: f64 },
    /// Reduces to a boolean: equal to `on` when given, else not-`off`.
    Binary { off: u16, on: Option<u16> },
    /// Integer → label map; unmatched raw values surface as `unknown <n>`.
    Enum { options: Vec<(u16, String)> },
    /// Iterates every bit of the register tuple, emitting labels from a
    /// fault table keyed by 1-based fault number across the whole tuple.
    Fault { table: &'static [(u16, &'static str)] },
    /// Register bytes concatenated as ASCII (inverter serial number).
    Serial,

    // ── Writable family ───────────────────────────────────────
    /// Writable on/off register.
    Switch { on: u16, off: u16 },
    /// Writable integer → label map.
    Select { options: Vec<(u16, String)> },
    /// Writable numeric with inclusive bounds. A bound can reference
    /// another sensor's current value (e.g. max charge power follows the
    /// rated-power sensor).
    Number { min: Bound, max: Bound },
    /// Writable time of day stored as `hour * 100 + minute`, constrained
    /// to a minute grid.
    Time { step_minutes: u16 },
    /// Writable system date/time packed into three registers.
    SystemTime,
    /// Writable charge-source slot of a timer program; a masked select.
    ProgSlot { options: Vec<(u16, String)> },
}

impl Sensor {
    pub fn new(
        addresses: &[u16],
        name: &str,
        unit: &str,
        factor: f64,
        kind: SensorKind,
    ) -> Self {
        Self {
            name: name.to_string(),
            id: slug(name),
            addresses: addresses.to_vec(),
            unit: unit.to_string(),
            factor,
            bitmask: 0,
            kind,
        }
    }

    /// Plain numeric sensor.
    pub fn scalar(addresses: &[u16], name: &str, unit: &str, factor: f64) -> Self {
        Self::new(
            addresses,
            name,
            unit,
            factor,
            SensorKind::Scalar {
                absolute: false,
                zero_export_absolute: false,
            },
        )
    }

    pub fn with_bitmask(mut self, bitmask: u16) -> Self {
        self.bitmask = bitmask;
        self
    }

    pub fn absolute(mut self) -> Self {
        match &mut self.kind {
            SensorKind::Scalar { absolute, .. } | SensorKind::Math { absolute, .. } => {
                *absolute = true;
            }
            _ => {}
        }
        self
    }

    pub fn zero_export_absolute(mut self) -> Self {
        if let SensorKind::Scalar {
            zero_export_absolute,
            ..
        } = &mut self.kind
        {
            *zero_export_absolute = true;
        }
        self
    }

    /// Register width of this sensor.
    pub fn width(&self) -> usize {
        self.addresses.len()
    }

    /// Whether commands can be written back to the inverter.
    pub fn is_writable(&self) -> bool {
        matches!(
            self.kind,
            SensorKind::Switch { .. }
                | SensorKind::Select { .. }
                | SensorKind::Number { .. }
                | SensorKind::Time { .. }
                | SensorKind::SystemTime
                | SensorKind::ProgSlot { .. }
        )
    }

    /// Whether discovery treats this as a non-numeric (text) entity.
    pub fn is_text(&self) -> bool {
        matches!(
            self.kind,
            SensorKind::Enum { .. }
                | SensorKind::Fault { .. }
                | SensorKind::Serial
                | SensorKind::Time { .. }
                | SensorKind::SystemTime
        )
    }

    /// Ids of sensors whose current value this sensor needs to decode or
    /// validate. The inverse edges ("affects") are computed once by the
    /// options builder.
    pub fn dependencies(&self) -> Vec<&str> {
        let mut deps = Vec::new();
        match &self.kind {
            SensorKind::Scalar {
                zero_export_absolute: true,
                ..
            } => deps.push(LOAD_LIMIT_ID),
            SensorKind::Number { min, max } => {
                if let Bound::Sensor(id) = min {
                    deps.push(id.as_str());
                }
                if let Bound::Sensor(id) = max {
                    deps.push(id.as_str());
                }
            }
            _ => {}
        }
        deps
    }
}

// ───────────────────────────────────────────────────────────────
// Number bounds
// ───────────────────────────────────────────────────────────────

/// An inclusive bound of a writable number: a constant, or the current
/// value of another sensor.
#[derive(Debug, Clone)]
pub enum Bound {
    Const(i64),
    Sensor(String),
}

impl Bound {
    /// Resolve against the dependency view; a missing or non-numeric
    /// dependency falls back to `default`.
    pub fn resolve(&self, deps: &dyn DepValues, default: i64) -> i64 {
        match self {
            Self::Const(v) => *v,
            Self::Sensor(id) => deps
                .value_of(id)
                .and_then(Value::as_f64)
                .map_or(default, |v| v as i64),
        }
    }
}

/// Read-only view of current sensor values, satisfied by the inverter
/// state map (and by plain maps in tests).
pub trait DepValues {
    fn value_of(&self, id: &str) -> Option<&Value>;
}

/// Empty dependency view for sensors without dependencies.
pub struct NoDeps;

impl DepValues for NoDeps {
    fn value_of(&self, _id: &str) -> Option<&Value> {
        None
    }
}

// ───────────────────────────────────────────────────────────────
// Helpers
// ───────────────────────────────────────────────────────────────

/// Derive the stable sensor id from its name: lowercase, with every
/// non-alphanumeric run collapsed to a single underscore.
pub fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_us = false;
    for ch in name.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_us = false;
        } else if !last_us && !out.is_empty() {
            out.push('_');
            last_us = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}
