//! Sensor options — from configured names to the per-sensor runtime set.
//!
//! Resolves the `sensors` / `sensors_first_inverter` option lists (ids and
//! group names) against the definition tables, pulls in hidden
//! dependencies, assigns every sensor its schedule, and inverts the
//! dependency edges into per-sensor `affects` sets.
//!
//! Dependency traversal is an iterative depth-first walk with an explicit
//! path set. A cycle logs a warning and drops the traversal back-edge;
//! both sensors stay usable and keep their `affects` edges, they just
//! decode with whatever dependency value is currently stored.

use std::collections::{HashMap, HashSet};

use log::{info, warn};

use crate::schedule::{Schedule, ScheduleTable};
use crate::sensor::defs::SensorDefinitions;
use crate::sensor::{slug, Sensor};

// ───────────────────────────────────────────────────────────────
// SensorOption
// ───────────────────────────────────────────────────────────────

/// A sensor wrapped with its runtime policy.
#[derive(Debug, Clone)]
pub struct SensorOption {
    pub sensor: Sensor,
    pub schedule: Schedule,
    /// Hidden sensors are read but never published or discovered.
    pub visible: bool,
    /// Read once while the agent connects, before the tick loop starts.
    pub startup: bool,
    /// Exposed only on the first inverter.
    pub first: bool,
    /// Ids of sensors whose discovery metadata depends on this sensor's
    /// value (inverse of `Sensor::dependencies`).
    pub affects: Vec<String>,
}

// ───────────────────────────────────────────────────────────────
// SensorOptions
// ───────────────────────────────────────────────────────────────

/// The resolved sensor set, in insertion order (startup sensors first).
pub struct SensorOptions {
    items: Vec<SensorOption>,
    by_id: HashMap<String, usize>,
}

impl SensorOptions {
    /// Resolve the configured sensor names into the runtime set.
    pub fn build(
        defs: &SensorDefinitions,
        schedules: &ScheduleTable,
        sensors: &[String],
        sensors_first_inverter: &[String],
    ) -> Self {
        let mut so = Self {
            items: Vec::new(),
            by_id: HashMap::new(),
        };

        // The agents read these while connecting, whether or not the
        // configuration asks for them.
        so.add_with_deps(defs, schedules, "rated_power", false, false, true);
        so.add_with_deps(defs, schedules, "serial", false, false, true);

        for id in resolve_names(defs, sensors, &so) {
            so.add_with_deps(defs, schedules, &id, true, false, false);
        }
        for id in resolve_names(defs, sensors_first_inverter, &so) {
            so.add_with_deps(defs, schedules, &id, true, true, false);
        }

        let hidden: Vec<&str> = so
            .items
            .iter()
            .filter(|o| !o.visible)
            .map(|o| o.sensor.name.as_str())
            .collect();
        if !hidden.is_empty() {
            info!(
                "Added hidden sensors as other sensors depend on them: {}",
                hidden.join(", ")
            );
        }
        so
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&SensorOption> {
        self.by_id.get(id).map(|&i| &self.items[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &SensorOption> {
        self.items.iter()
    }

    /// The sensor set for one inverter: first-only sensors are dropped
    /// everywhere but on inverter index 0.
    pub fn for_inverter(&self, index: usize) -> Vec<SensorOption> {
        self.items
            .iter()
            .filter(|o| index == 0 || !o.first)
            .cloned()
            .collect()
    }

    // ── Internal ──────────────────────────────────────────────

    /// Add `root` and every (transitive) dependency. Roots are visible,
    /// dependencies hidden until some other root requests them.
    fn add_with_deps(
        &mut self,
        defs: &SensorDefinitions,
        schedules: &ScheduleTable,
        root: &str,
        visible: bool,
        first: bool,
        startup: bool,
    ) {
        enum Step {
            Enter(String),
            Leave(String),
        }

        let mut stack = vec![Step::Enter(root.to_string())];
        let mut on_path: HashSet<String> = HashSet::new();
        let mut done: HashSet<String> = HashSet::new();
        let mut is_root = true;

        while let Some(step) = stack.pop() {
            match step {
                Step::Enter(id) => {
                    if on_path.contains(&id) {
                        warn!("Circular dependency detected for sensor {id}; ignoring the back-edge");
                        continue;
                    }
                    let Some(sensor) = defs.get(&id) else {
                        warn!("Unknown dependency sensor: {id}");
                        continue;
                    };
                    let root_here = std::mem::take(&mut is_root);
                    self.ensure(
                        sensor,
                        schedules,
                        visible && root_here,
                        first && root_here,
                        startup && root_here,
                    );
                    if done.contains(&id) {
                        continue;
                    }
                    done.insert(id.clone());
                    on_path.insert(id.clone());
                    stack.push(Step::Leave(id.clone()));

                    for dep in sensor.dependencies() {
                        let Some(dep_sensor) = defs.get(dep) else {
                            warn!("Sensor {id} depends on unknown sensor {dep}");
                            continue;
                        };
                        self.ensure(dep_sensor, schedules, false, false, false);
                        self.add_affects(dep, &id);
                        stack.push(Step::Enter(dep.to_string()));
                    }
                }
                Step::Leave(id) => {
                    on_path.remove(&id);
                }
            }
        }
    }

    /// Insert the sensor if missing; upgrade visibility/startup flags if
    /// it is already present. The `first` flag is only set at creation so
    /// a sensor requested for all inverters stays on all of them.
    fn ensure(
        &mut self,
        sensor: &Sensor,
        schedules: &ScheduleTable,
        visible: bool,
        first: bool,
        startup: bool,
    ) {
        match self.by_id.get(&sensor.id) {
            Some(&i) => {
                let opt = &mut self.items[i];
                opt.visible |= visible;
                opt.startup |= startup;
            }
            None => {
                self.by_id.insert(sensor.id.clone(), self.items.len());
                self.items.push(SensorOption {
                    sensor: sensor.clone(),
                    schedule: schedules.resolve(&sensor.id).clone(),
                    visible,
                    startup,
                    first,
                    affects: Vec::new(),
                });
            }
        }
    }

    fn add_affects(&mut self, dep_id: &str, affected_id: &str) {
        if let Some(&i) = self.by_id.get(dep_id) {
            let affects = &mut self.items[i].affects;
            if !affects.iter().any(|a| a == affected_id) {
                affects.push(affected_id.to_string());
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Name resolution
// ───────────────────────────────────────────────────────────────

/// Expand the configured name list: slugging, group expansion, deprecated
/// and unknown reporting. Groups expand after plain names, and expansion
/// never warns about duplicates (a group may well repeat a plain name).
fn resolve_names(defs: &SensorDefinitions, names: &[String], existing: &SensorOptions) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut groups: Vec<String> = Vec::new();

    for raw in names {
        if raw.contains(':') {
            warn!("Sensor modifiers were replaced by schedules: {raw}");
            continue;
        }
        let id = slug(raw);
        if defs.is_group(&id) {
            if !groups.contains(&id) {
                groups.push(id);
            }
            continue;
        }
        if let Some(replacement) = defs.deprecated(&id) {
            warn!("Your config includes deprecated sensors. Replace {id} with {replacement}");
            continue;
        }
        if out.contains(&id) || existing.get(&id).is_some_and(|o| o.visible) {
            warn!("Sensor {id} only allowed once");
            continue;
        }
        if defs.get(&id).is_none() {
            warn!("Unknown sensor specified: {id}");
            continue;
        }
        out.push(id);
    }

    for group in groups {
        let members = defs.group(&group).unwrap_or_default();
        for id in members {
            if defs.get(&id).is_some() && !out.contains(&id) {
                out.push(id);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::defs::DefFamily;
    use crate::sensor::{Bound, SensorKind};

    fn build(sensors: &[&str], first: &[&str]) -> SensorOptions {
        let defs = SensorDefinitions::load(DefFamily::SinglePhase, 15);
        let schedules = ScheduleTable::new(&[]);
        let sensors: Vec<String> = sensors.iter().map(ToString::to_string).collect();
        let first: Vec<String> = first.iter().map(ToString::to_string).collect();
        SensorOptions::build(&defs, &schedules, &sensors, &first)
    }

    #[test]
    fn startup_sensors_always_present_and_hidden() {
        let so = build(&[], &[]);
        let serial = so.get("serial").unwrap();
        assert!(serial.startup && !serial.visible);
        let rated = so.get("rated_power").unwrap();
        assert!(rated.startup && !rated.visible);
    }

    #[test]
    fn every_sensor_resolves_to_exactly_one_schedule() {
        let so = build(&["all"], &[]);
        for opt in so.iter() {
            assert!(opt.schedule.read_every > 0, "{} lost its schedule", opt.sensor.id);
        }
    }

    #[test]
    fn dependencies_are_pulled_in_hidden() {
        // prog1_power's max bound references rated_power; load-limited
        // power sensors reference load_limit.
        let so = build(&["prog1_power", "inverter_power"], &[]);
        assert!(so.get("prog1_power").unwrap().visible);
        let load_limit = so.get("load_limit").expect("dependency added");
        assert!(!load_limit.visible);
    }

    #[test]
    fn affects_is_the_inverse_of_dependencies() {
        let so = build(&["prog1_power"], &[]);
        let rated = so.get("rated_power").unwrap();
        assert!(rated.affects.contains(&"prog1_power".to_string()));
    }

    #[test]
    fn groups_expand_and_skip_unknown_members() {
        let so = build(&["energy_management"], &[]);
        assert!(so.get("total_pv_energy").unwrap().visible);
        assert!(so.get("total_grid_import").unwrap().visible);
    }

    #[test]
    fn first_inverter_sensors_filtered_per_agent() {
        let so = build(&["battery_soc"], &["grid_power"]);
        assert!(so.get("grid_power").unwrap().first);

        let idx0: Vec<String> = so.for_inverter(0).iter().map(|o| o.sensor.id.clone()).collect();
        let idx1: Vec<String> = so.for_inverter(1).iter().map(|o| o.sensor.id.clone()).collect();
        assert!(idx0.contains(&"grid_power".to_string()));
        assert!(!idx1.contains(&"grid_power".to_string()));
        assert!(idx1.contains(&"battery_soc".to_string()));
    }

    #[test]
    fn cyclic_dependencies_drop_the_back_edge() {
        let mut defs = SensorDefinitions::load(DefFamily::SinglePhase, 15);
        defs.register(Sensor::new(
            &[400],
            "Loop a",
            "",
            1.0,
            SensorKind::Number {
                min: Bound::Const(0),
                max: Bound::Sensor("loop_b".into()),
            },
        ));
        defs.register(Sensor::new(
            &[401],
            "Loop b",
            "",
            1.0,
            SensorKind::Number {
                min: Bound::Const(0),
                max: Bound::Sensor("loop_a".into()),
            },
        ));
        let schedules = ScheduleTable::new(&[]);
        let so = SensorOptions::build(&defs, &schedules, &["loop_a".into()], &[]);

        // No stack overflow, both sensors present, affects edges kept in
        // both directions.
        assert!(so.get("loop_a").is_some());
        assert!(so.get("loop_b").is_some());
        assert!(so.get("loop_b").unwrap().affects.contains(&"loop_a".to_string()));
        assert!(so.get("loop_a").unwrap().affects.contains(&"loop_b".to_string()));
    }

    #[test]
    fn unknown_and_deprecated_names_are_skipped() {
        let so = build(&["bogus_sensor", "battery_temp", "battery_soc"], &[]);
        assert!(so.get("bogus_sensor").is_none());
        assert!(so.get("battery_temp").is_none());
        assert!(so.get("battery_soc").is_some());
    }
}
