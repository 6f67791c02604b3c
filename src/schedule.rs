//! Schedule policies — when a sensor is read and when a read is reported.
//!
//! A [`Schedule`] is a policy tuple: read period, report period, and the
//! change predicates that gate reporting. Sensors are matched to schedules
//! by key: an exact id match wins over a `prefix*` glob, which wins over a
//! `*suffix` glob, which wins over the default (empty key). Ties inside a
//! class go to the earlier entry, so configured schedules (prepended)
//! override the built-ins.

use serde::Deserialize;

use crate::value::Value;

// ───────────────────────────────────────────────────────────────
// Schedule
// ───────────────────────────────────────────────────────────────

/// A named reporting policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Schedule {
    /// Sensor id, anchored glob with a single `*`, or "" for the default.
    pub key: String,
    /// Seconds between reads.
    pub read_every: u64,
    /// Seconds between report evaluations.
    pub report_every: u64,
    /// Report on any value change.
    pub change_any: bool,
    /// Report when the absolute delta reaches this threshold.
    pub change_by: f64,
    /// Report when the relative delta reaches this many percent.
    pub change_percent: f64,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            key: String::new(),
            read_every: 15,
            report_every: 300,
            change_any: false,
            change_by: 0.0,
            change_percent: 0.0,
        }
    }
}

impl Schedule {
    pub fn new(key: &str, read_every: u64, report_every: u64) -> Self {
        Self {
            key: key.to_string(),
            read_every,
            report_every,
            ..Self::default()
        }
    }

    pub fn change_any(mut self) -> Self {
        self.change_any = true;
        self
    }

    pub fn change_by(mut self, threshold: f64) -> Self {
        self.change_by = threshold;
        self
    }

    pub fn change_percent(mut self, percent: f64) -> Self {
        self.change_percent = percent;
        self
    }

    /// Whether a due report tick should actually publish, given the last
    /// published value and the current one.
    ///
    /// With no predicate configured the sensor publishes unconditionally
    /// at the report period. A sensor that has never published always
    /// publishes.
    pub fn should_report(&self, last_published: &Value, current: &Value) -> bool {
        if last_published.is_none() {
            return true;
        }
        if !self.change_any && self.change_by <= 0.0 && self.change_percent <= 0.0 {
            return true;
        }
        if self.change_any && current != last_published {
            return true;
        }
        if self.change_by > 0.0 {
            match (current.as_f64(), last_published.as_f64()) {
                (Some(cur), Some(last)) => {
                    if (cur - last).abs() >= self.change_by {
                        return true;
                    }
                }
                // Non-numeric values fall back to plain inequality.
                _ => {
                    if current != last_published {
                        return true;
                    }
                }
            }
        }
        if self.change_percent > 0.0 {
            if let (Some(cur), Some(last)) = (current.as_f64(), last_published.as_f64()) {
                // A zero baseline always publishes.
                if last == 0.0 || (cur - last).abs() * 100.0 >= self.change_percent * last.abs() {
                    return true;
                }
            }
        }
        false
    }
}

// ───────────────────────────────────────────────────────────────
// Pattern matching
// ───────────────────────────────────────────────────────────────

/// Precompiled anchored glob. The match classes double as the ranking:
/// exact > prefix > suffix > default.
#[derive(Debug, Clone)]
enum Pattern {
    Exact(String),
    Prefix(String),
    Suffix(String),
    Default,
}

impl Pattern {
    fn compile(key: &str) -> Self {
        if key.is_empty() {
            Self::Default
        } else if let Some(prefix) = key.strip_suffix('*') {
            Self::Prefix(prefix.to_string())
        } else if let Some(suffix) = key.strip_prefix('*') {
            Self::Suffix(suffix.to_string())
        } else {
            Self::Exact(key.to_string())
        }
    }

    fn rank(&self, sensor_id: &str) -> Option<u8> {
        match self {
            Self::Exact(key) if sensor_id == key => Some(3),
            Self::Prefix(p) if sensor_id.starts_with(p.as_str()) => Some(2),
            Self::Suffix(s) if sensor_id.ends_with(s.as_str()) => Some(1),
            Self::Default => Some(0),
            _ => None,
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Schedule table
// ───────────────────────────────────────────────────────────────

/// All schedules in resolution order, patterns precompiled at init.
pub struct ScheduleTable {
    entries: Vec<(Pattern, Schedule)>,
}

impl ScheduleTable {
    /// Build the table: configured schedules first (they win ties inside
    /// a match class), then the built-in defaults.
    pub fn new(configured: &[Schedule]) -> Self {
        let entries = configured
            .iter()
            .cloned()
            .chain(builtin_schedules())
            .map(|s| (Pattern::compile(&s.key), s))
            .collect();
        Self { entries }
    }

    /// Resolve a sensor id to its schedule. The trailing built-in default
    /// guarantees every sensor resolves to exactly one schedule.
    pub fn resolve(&self, sensor_id: &str) -> &Schedule {
        let mut best: Option<(u8, &Schedule)> = None;
        for (pattern, schedule) in &self.entries {
            if let Some(rank) = pattern.rank(sensor_id) {
                // Strictly greater keeps the earliest entry on ties.
                if best.is_none_or(|(r, _)| rank > r) {
                    best = Some((rank, schedule));
                }
            }
        }
        best.map(|(_, s)| s)
            .expect("the built-in default matches everything")
    }
}

/// Built-in policies, matched after any configured schedules.
fn builtin_schedules() -> Vec<Schedule> {
    vec![
        Schedule::new("date_time", 60, 60).change_any(),
        Schedule::new("fault", 10, 300).change_any(),
        Schedule::new("serial", 3600, 3600).change_any(),
        Schedule::new("prog*", 5, 300).change_any(),
        Schedule::new("battery_*", 10, 300).change_any(),
        Schedule::new("*_power", 5, 60).change_by(80.0),
        Schedule::new("*_current", 5, 60).change_percent(2.0),
        Schedule::new("*_voltage", 5, 60).change_by(5.0),
        Schedule::new("*_temperature", 30, 300).change_by(1.0),
        Schedule::new("*_energy", 60, 300),
        Schedule::new("", 15, 300),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_beats_prefix_beats_suffix_beats_default() {
        let table = ScheduleTable::new(&[]);
        assert_eq!(table.resolve("date_time").key, "date_time");
        assert_eq!(table.resolve("prog1_power").key, "prog*");
        assert_eq!(table.resolve("grid_power").key, "*_power");
        assert_eq!(table.resolve("overall_state").key, "");
    }

    #[test]
    fn configured_schedule_wins_ties_by_order() {
        let configured = vec![Schedule::new("*_power", 2, 30).change_by(20.0)];
        let table = ScheduleTable::new(&configured);
        let s = table.resolve("grid_power");
        assert_eq!(s.read_every, 2);
        assert_eq!(s.change_by, 20.0);
    }

    #[test]
    fn configured_exact_beats_builtin_glob() {
        let configured = vec![Schedule::new("grid_power", 1, 10)];
        let table = ScheduleTable::new(&configured);
        assert_eq!(table.resolve("grid_power").read_every, 1);
    }

    #[test]
    fn every_id_resolves() {
        let table = ScheduleTable::new(&[]);
        for id in ["x", "", "prog9_zzz", "a_very_long_sensor_name"] {
            let _ = table.resolve(id);
        }
    }

    #[test]
    fn change_by_threshold_gates_publish() {
        let s = Schedule::new("", 5, 60).change_by(5.0);
        assert!(!s.should_report(&Value::Int(100), &Value::Int(104)));
        assert!(s.should_report(&Value::Int(100), &Value::Int(105)));
        assert!(s.should_report(&Value::Int(100), &Value::Int(95)));
    }

    #[test]
    fn change_percent_with_zero_baseline_always_publishes() {
        let s = Schedule::new("", 5, 60).change_percent(2.0);
        assert!(s.should_report(&Value::Int(0), &Value::Int(1)));
        assert!(s.should_report(&Value::Int(0), &Value::Int(0)));
        assert!(!s.should_report(&Value::Int(1000), &Value::Int(1010)));
        assert!(s.should_report(&Value::Int(1000), &Value::Int(1020)));
    }

    #[test]
    fn change_any_publishes_only_on_difference() {
        let s = Schedule::new("", 5, 60).change_any();
        assert!(!s.should_report(&Value::Text("ok".into()), &Value::Text("ok".into())));
        assert!(s.should_report(&Value::Text("ok".into()), &Value::Text("fault".into())));
    }

    #[test]
    fn no_predicate_publishes_unconditionally() {
        let s = Schedule::new("", 5, 60);
        assert!(s.should_report(&Value::Int(7), &Value::Int(7)));
    }

    #[test]
    fn never_published_always_publishes() {
        let s = Schedule::new("", 5, 60).change_by(1000.0);
        assert!(s.should_report(&Value::None, &Value::Int(7)));
    }
}
