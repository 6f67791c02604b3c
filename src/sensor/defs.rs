//! Sensor definition tables.
//!
//! Three register maps, selected by the `sensor_definitions` option:
//! single-phase hybrids, three-phase low-voltage, and three-phase
//! high-voltage. Every family carries the `serial` and `rated_power`
//! sensors, which the agents read at startup. User-supplied definitions
//! can be registered on top and are reachable through the `mysensors`
//! group.

use std::collections::HashMap;

use crate::sensor::{Bound, Sensor, SensorKind};

// ───────────────────────────────────────────────────────────────
// Definition family
// ───────────────────────────────────────────────────────────────

/// Which register map the configured inverters use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefFamily {
    SinglePhase,
    ThreePhaseLv,
    ThreePhaseHv,
}

impl DefFamily {
    /// Parse the `sensor_definitions` option value.
    pub fn from_option(value: &str) -> Option<Self> {
        match value {
            "single-phase" => Some(Self::SinglePhase),
            "three-phase" => Some(Self::ThreePhaseLv),
            "three-phase-hv" => Some(Self::ThreePhaseHv),
            _ => None,
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Definitions container
// ───────────────────────────────────────────────────────────────

/// All sensor definitions for one family, in definition order.
pub struct SensorDefinitions {
    all: Vec<Sensor>,
    by_id: HashMap<String, usize>,
    deprecated: HashMap<&'static str, &'static str>,
    mysensors: Vec<String>,
}

impl SensorDefinitions {
    /// Build the definitions for `family`. `prog_step_minutes` constrains
    /// the minute grid of the program-time sensors.
    pub fn load(family: DefFamily, prog_step_minutes: u16) -> Self {
        let all = match family {
            DefFamily::SinglePhase => single_phase(prog_step_minutes),
            DefFamily::ThreePhaseLv => three_phase_lv(prog_step_minutes),
            DefFamily::ThreePhaseHv => three_phase_hv(prog_step_minutes),
        };
        let by_id = all
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();
        Self {
            all,
            by_id,
            deprecated: DEPRECATED.iter().copied().collect(),
            mysensors: Vec::new(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Sensor> {
        self.by_id.get(id).map(|&i| &self.all[i])
    }

    /// Replacement id for a deprecated sensor name, if any.
    pub fn deprecated(&self, id: &str) -> Option<&str> {
        self.deprecated.get(id).copied()
    }

    /// Register a user-defined sensor. Replaces an existing definition
    /// with the same id and joins the `mysensors` group.
    pub fn register(&mut self, sensor: Sensor) {
        let id = sensor.id.clone();
        if let Some(&i) = self.by_id.get(&id) {
            self.all[i] = sensor;
        } else {
            self.by_id.insert(id.clone(), self.all.len());
            self.all.push(sensor);
        }
        if !self.mysensors.contains(&id) {
            self.mysensors.push(id);
        }
    }

    /// Resolve a group name to its member ids. `all` expands to every
    /// defined sensor.
    pub fn group(&self, name: &str) -> Option<Vec<String>> {
        if name == "all" {
            return Some(self.all.iter().map(|s| s.id.clone()).collect());
        }
        if name == "mysensors" {
            return Some(self.mysensors.clone());
        }
        SENSOR_GROUPS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, ids)| ids.iter().map(|s| (*s).to_string()).collect())
    }

    pub fn is_group(&self, name: &str) -> bool {
        name == "all" || name == "mysensors" || SENSOR_GROUPS.iter().any(|(n, _)| *n == name)
    }

    pub fn serial(&self) -> &Sensor {
        self.get("serial").expect("every family defines serial")
    }

    pub fn rated_power(&self) -> &Sensor {
        self.get("rated_power").expect("every family defines rated_power")
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sensor> {
        self.all.iter()
    }
}

// ───────────────────────────────────────────────────────────────
// Shared builders
// ───────────────────────────────────────────────────────────────

fn temp(addresses: &[u16], name: &str) -> Sensor {
    Sensor::new(addresses, name, "°C", 0.1, SensorKind::Temperature { offset: 100.0 })
}

fn enum_sensor(address: u16, name: &str, options: &[(u16, &str)]) -> Sensor {
    Sensor::new(
        &[address],
        name,
        "",
        1.0,
        SensorKind::Enum {
            options: options.iter().map(|(v, l)| (*v, (*l).to_string())).collect(),
        },
    )
}

fn select(address: u16, name: &str, options: &[(u16, &str)]) -> Sensor {
    Sensor::new(
        &[address],
        name,
        "",
        1.0,
        SensorKind::Select {
            options: options.iter().map(|(v, l)| (*v, (*l).to_string())).collect(),
        },
    )
}

fn number(address: u16, name: &str, unit: &str, factor: f64, min: i64, max: i64) -> Sensor {
    Sensor::new(
        &[address],
        name,
        unit,
        factor,
        SensorKind::Number {
            min: Bound::Const(min),
            max: Bound::Const(max),
        },
    )
}

fn switch(address: u16, name: &str) -> Sensor {
    Sensor::new(&[address], name, "", 1.0, SensorKind::Switch { on: 1, off: 0 })
}

/// Sensors present in every family: identity, rated power, system time.
fn common() -> Vec<Sensor> {
    vec![
        Sensor::new(&[3, 4, 5, 6, 7], "Serial", "", 1.0, SensorKind::Serial),
        Sensor::scalar(&[16, 17], "Rated power", "W", 0.1),
        Sensor::new(&[22, 23, 24], "Date time", "", 1.0, SensorKind::SystemTime),
        enum_sensor(0, "Device type", &[
            (2, "Inverter"),
            (3, "Single phase hybrid"),
            (4, "Microinverter"),
            (5, "Low voltage three phase hybrid"),
            (6, "High voltage three phase hybrid"),
        ]),
        enum_sensor(
            59,
            "Overall state",
            &[
                (0, "standby"),
                (1, "selfcheck"),
                (2, "ok"),
                (3, "alarm"),
                (4, "fault"),
                (5, "activating"),
            ],
        ),
    ]
}

/// The six timer-program slots: start time, power limit, target capacity
/// and charge source for each.
fn programs(prog_step: u16, time_base: u16, power_base: u16, cap_base: u16, charge_base: u16) -> Vec<Sensor> {
    let mut out = Vec::with_capacity(24);
    for slot in 0..6_u16 {
        let n = slot + 1;
        out.push(Sensor::new(
            &[time_base + slot],
            &format!("Prog{n} time"),
            "",
            1.0,
            SensorKind::Time { step_minutes: prog_step },
        ));
        out.push(Sensor::new(
            &[power_base + slot],
            &format!("Prog{n} power"),
            "W",
            1.0,
            SensorKind::Number {
                min: Bound::Const(0),
                max: Bound::Sensor("rated_power".into()),
            },
        ));
        out.push(number(cap_base + slot, &format!("Prog{n} capacity"), "%", 1.0, 0, 100));
        out.push(
            Sensor::new(
                &[charge_base + slot],
                &format!("Prog{n} charge"),
                "",
                1.0,
                SensorKind::ProgSlot {
                    options: vec![
                        (0, "No Grid or Gen".into()),
                        (1, "Allow Grid".into()),
                        (2, "Allow Gen".into()),
                        (3, "Allow Grid & Gen".into()),
                    ],
                },
            )
            .with_bitmask(0x03),
        );
    }
    out
}

/// Battery management settings shared by the hybrid families.
fn battery_settings() -> Vec<Sensor> {
    vec![
        select(200, "Battery type", &[(0, "Lead Acid"), (1, "Lithium")]),
        number(210, "Battery max charge current", "A", 1.0, 0, 185),
        number(211, "Battery max discharge current", "A", 1.0, 0, 185),
        number(217, "Battery shutdown capacity", "%", 1.0, 0, 100),
        number(218, "Battery restart capacity", "%", 1.0, 0, 100),
        Sensor::new(
            &[219],
            "Battery low capacity",
            "%",
            1.0,
            SensorKind::Number {
                min: Bound::Sensor("battery_shutdown_capacity".into()),
                max: Bound::Sensor("battery_restart_capacity".into()),
            },
        ),
        switch(235, "Battery wake up"),
        number(312, "Battery resistance", "mΩ", 1.0, 0, 6000),
        number(313, "Battery charge efficiency", "%", 0.1, 0, 100),
    ]
}

// ───────────────────────────────────────────────────────────────
// Single-phase hybrids
// ───────────────────────────────────────────────────────────────

fn single_phase(prog_step: u16) -> Vec<Sensor> {
    let mut defs = common();

    defs.extend([
        // Energy counters
        Sensor::scalar(&[70], "Day battery charge", "kWh", 0.1),
        Sensor::scalar(&[71], "Day battery discharge", "kWh", 0.1),
        Sensor::scalar(&[72, 73], "Total battery charge", "kWh", 0.1),
        Sensor::scalar(&[74, 75], "Total battery discharge", "kWh", 0.1),
        Sensor::scalar(&[76], "Day grid import", "kWh", 0.1),
        Sensor::scalar(&[77], "Day grid export", "kWh", 0.1),
        Sensor::scalar(&[78, 80], "Total grid import", "kWh", 0.1),
        Sensor::scalar(&[81, 82], "Total grid export", "kWh", 0.1),
        Sensor::scalar(&[84], "Day load energy", "kWh", 0.1),
        Sensor::scalar(&[85, 86], "Total load energy", "kWh", 0.1),
        Sensor::scalar(&[108], "Day PV energy", "kWh", 0.1),
        Sensor::scalar(&[96, 97], "Total PV energy", "kWh", 0.1),
        // Grid
        Sensor::scalar(&[79], "Grid frequency", "Hz", 0.01),
        Sensor::scalar(&[150], "Grid voltage", "V", 0.1),
        Sensor::scalar(&[160], "Grid current", "A", -0.01),
        Sensor::scalar(&[169], "Grid power", "W", -1.0),
        Sensor::scalar(&[172], "Grid CT power", "W", -1.0),
        Sensor::new(&[194], "Grid connected", "", 1.0, SensorKind::Binary { off: 0, on: None }),
        // Inverter output
        Sensor::scalar(&[154], "Inverter voltage", "V", 0.1),
        Sensor::scalar(&[164], "Inverter current", "A", -0.01),
        Sensor::scalar(&[175], "Inverter power", "W", -1.0).zero_export_absolute(),
        Sensor::scalar(&[192], "Load frequency", "Hz", 0.01),
        Sensor::scalar(&[178], "Load power", "W", -1.0),
        Sensor::new(
            &[166, 169, 175],
            "Essential power",
            "W",
            1.0,
            SensorKind::Math {
                factors: vec![1.0, 1.0, -1.0],
                no_negative: true,
                absolute: false,
            },
        ),
        Sensor::new(
            &[167, 172],
            "Non-essential power",
            "W",
            1.0,
            SensorKind::Math {
                factors: vec![1.0, -1.0],
                no_negative: true,
                absolute: false,
            },
        ),
        Sensor::scalar(&[166], "AUX power", "W", -1.0),
        // Battery
        Sensor::scalar(&[183], "Battery voltage", "V", 0.01),
        Sensor::scalar(&[184], "Battery SOC", "%", 1.0),
        Sensor::scalar(&[190], "Battery power", "W", -1.0),
        Sensor::scalar(&[191], "Battery current", "A", -0.01),
        temp(&[182], "Battery temperature"),
        // PV
        Sensor::scalar(&[186], "PV1 power", "W", 1.0),
        Sensor::scalar(&[187], "PV2 power", "W", 1.0),
        Sensor::scalar(&[109], "PV1 voltage", "V", 0.1),
        Sensor::scalar(&[110], "PV1 current", "A", 0.1),
        Sensor::scalar(&[111], "PV2 voltage", "V", 0.1),
        Sensor::scalar(&[112], "PV2 current", "A", 0.1),
        Sensor::new(
            &[186, 187],
            "PV power",
            "W",
            1.0,
            SensorKind::Math {
                factors: vec![1.0, 1.0],
                no_negative: true,
                absolute: false,
            },
        ),
        // Diagnostics
        Sensor::new(&[103, 104, 105, 106], "Fault", "", 1.0, SensorKind::Fault { table: &FAULTS }),
        enum_sensor(92, "SD status", &[(1000, "fault"), (2000, "ok")]),
        temp(&[90], "DC transformer temperature"),
        temp(&[91], "Radiator temperature"),
        temp(&[95], "Environment temperature"),
        Sensor::new(&[98], "Grid relay status", "", 1.0, SensorKind::Binary { off: 0, on: None })
            .with_bitmask(0x04),
        Sensor::new(&[98], "Inverter relay status", "", 1.0, SensorKind::Binary { off: 0, on: None })
            .with_bitmask(0x10),
        Sensor::new(&[105], "Fan warning", "", 1.0, SensorKind::Binary { off: 0, on: None })
            .with_bitmask(1 << 1),
        Sensor::new(&[105], "Grid phase warning", "", 1.0, SensorKind::Binary { off: 0, on: None })
            .with_bitmask(1 << 2),
        // Settings
        select(
            243,
            "Load limit",
            &[(0, "Allow Export"), (1, "Essentials"), (2, "Zero Export")],
        ),
        switch(248, "Use timer"),
        switch(247, "Solar export"),
        number(245, "Export limit power", "W", 1.0, 0, 16000),
        switch(232, "Grid charge enabled"),
        number(230, "Grid charge battery current", "A", 1.0, 0, 185),
        number(231, "Grid charge start battery SOC", "%", 1.0, 0, 100),
        select(282, "Priority load", &[(0, "Battery first"), (1, "Load first")]),
        number(305, "UPS delay time", "s", 1.0, 0, 300),
        // Generator
        select(
            126,
            "Generator port usage",
            &[(0, "Generator input"), (1, "Smart load"), (2, "Micro inverter input")],
        ),
        number(123, "Generator off SOC", "%", 1.0, 0, 100),
        number(125, "Generator on SOC", "%", 1.0, 0, 100),
        number(129, "Generator charge start battery SOC", "%", 1.0, 0, 100),
        number(128, "Generator charge battery current", "A", 1.0, 0, 185),
        switch(127, "Generator charge enabled"),
        number(121, "Generator max operating time", "h", 0.1, 0, 240),
        number(122, "Generator cooling time", "h", 0.1, 0, 240),
        number(124, "Min PV power for gen start", "W", 1.0, 0, 16000),
        Sensor::new(&[166], "Gen signal on", "", 1.0, SensorKind::Binary { off: 0, on: None })
            .with_bitmask(1 << 15),
    ]);

    defs.extend(battery_settings());
    defs.extend(programs(prog_step, 250, 256, 268, 274));
    defs
}

// ───────────────────────────────────────────────────────────────
// Three-phase low voltage
// ───────────────────────────────────────────────────────────────

fn three_phase_lv(prog_step: u16) -> Vec<Sensor> {
    let mut defs = common();

    defs.extend([
        Sensor::scalar(&[502], "Day battery charge", "kWh", 0.1),
        Sensor::scalar(&[503], "Day battery discharge", "kWh", 0.1),
        Sensor::scalar(&[514], "Day grid import", "kWh", 0.1),
        Sensor::scalar(&[515], "Day grid export", "kWh", 0.1),
        Sensor::scalar(&[526], "Day load energy", "kWh", 0.1),
        Sensor::scalar(&[529], "Day PV energy", "kWh", 0.1),
        Sensor::scalar(&[522, 523], "Total grid import", "kWh", 0.1),
        Sensor::scalar(&[524, 525], "Total grid export", "kWh", 0.1),
        Sensor::scalar(&[534, 535], "Total PV energy", "kWh", 0.1),
        Sensor::scalar(&[516, 517], "Total battery charge", "kWh", 0.1),
        Sensor::scalar(&[518, 519], "Total battery discharge", "kWh", 0.1),
        // Grid, per phase
        Sensor::scalar(&[598], "Grid L1 voltage", "V", 0.1),
        Sensor::scalar(&[599], "Grid L2 voltage", "V", 0.1),
        Sensor::scalar(&[600], "Grid L3 voltage", "V", 0.1),
        Sensor::scalar(&[604], "Grid L1 power", "W", -1.0),
        Sensor::scalar(&[605], "Grid L2 power", "W", -1.0),
        Sensor::scalar(&[606], "Grid L3 power", "W", -1.0),
        Sensor::scalar(&[607], "Grid power", "W", -1.0),
        Sensor::scalar(&[609], "Grid frequency", "Hz", 0.01),
        Sensor::scalar(&[619], "Grid CT power", "W", -1.0),
        Sensor::new(&[552], "Grid connected", "", 1.0, SensorKind::Binary { off: 0, on: None }),
        // Inverter & load
        Sensor::scalar(&[636], "Inverter power", "W", -1.0).zero_export_absolute(),
        Sensor::scalar(&[633], "Inverter L1 power", "W", -1.0),
        Sensor::scalar(&[634], "Inverter L2 power", "W", -1.0),
        Sensor::scalar(&[635], "Inverter L3 power", "W", -1.0),
        Sensor::scalar(&[644], "Load L1 power", "W", -1.0),
        Sensor::scalar(&[645], "Load L2 power", "W", -1.0),
        Sensor::scalar(&[646], "Load L3 power", "W", -1.0),
        Sensor::scalar(&[653], "Load power", "W", -1.0),
        Sensor::scalar(&[655], "Load frequency", "Hz", 0.01),
        Sensor::new(
            &[644, 645, 646],
            "Essential power",
            "W",
            1.0,
            SensorKind::Math {
                factors: vec![1.0, 1.0, 1.0],
                no_negative: true,
                absolute: false,
            },
        ),
        // Battery
        Sensor::scalar(&[587], "Battery voltage", "V", 0.01),
        Sensor::scalar(&[588], "Battery SOC", "%", 1.0),
        Sensor::scalar(&[590], "Battery power", "W", -1.0),
        Sensor::scalar(&[591], "Battery current", "A", -0.01),
        temp(&[586], "Battery temperature"),
        // PV
        Sensor::scalar(&[672], "PV1 power", "W", 1.0),
        Sensor::scalar(&[673], "PV2 power", "W", 1.0),
        Sensor::scalar(&[676], "PV1 voltage", "V", 0.1),
        Sensor::scalar(&[677], "PV1 current", "A", 0.1),
        Sensor::scalar(&[678], "PV2 voltage", "V", 0.1),
        Sensor::scalar(&[679], "PV2 current", "A", 0.1),
        Sensor::new(
            &[672, 673],
            "PV power",
            "W",
            1.0,
            SensorKind::Math {
                factors: vec![1.0, 1.0],
                no_negative: true,
                absolute: false,
            },
        ),
        // Diagnostics
        Sensor::new(&[555, 556, 557, 558], "Fault", "", 1.0, SensorKind::Fault { table: &FAULTS }),
        temp(&[540], "DC transformer temperature"),
        temp(&[541], "Radiator temperature"),
        // Settings
        select(
            142,
            "Load limit",
            &[(0, "Allow Export"), (1, "Essentials"), (2, "Zero Export")],
        ),
        switch(146, "Use timer"),
        switch(145, "Solar export"),
        number(143, "Export limit power", "W", 1.0, 0, 48000),
        switch(130, "Grid charge enabled"),
        number(128, "Grid charge battery current", "A", 1.0, 0, 240),
        number(127, "Grid charge start battery SOC", "%", 1.0, 0, 100),
    ]);

    defs.extend(battery_settings());
    defs.extend(programs(prog_step, 148, 154, 166, 172));
    defs
}

// ───────────────────────────────────────────────────────────────
// Three-phase high voltage
// ───────────────────────────────────────────────────────────────

fn three_phase_hv(prog_step: u16) -> Vec<Sensor> {
    let mut defs = three_phase_lv(prog_step);

    // HV packs report per-battery state and use the extended fault table.
    defs.retain(|s| !matches!(s.kind, SensorKind::Fault { .. }));
    defs.extend([
        Sensor::new(&[555, 556, 557, 558], "Fault", "", 1.0, SensorKind::Fault { table: &HV_FAULTS }),
        Sensor::scalar(&[603], "Battery 1 SOC", "%", 1.0),
        Sensor::scalar(&[614], "Battery 1 voltage", "V", 0.1),
        Sensor::scalar(&[615], "Battery 1 current", "A", -0.01),
        Sensor::scalar(&[616], "Battery 1 power", "W", -1.0),
        Sensor::scalar(&[617], "Battery 2 SOC", "%", 1.0),
        Sensor::scalar(&[625], "Battery 2 voltage", "V", 0.1),
        Sensor::scalar(&[626], "Battery 2 current", "A", -0.01),
        Sensor::scalar(&[627], "Battery 2 power", "W", -1.0),
        Sensor::scalar(&[366], "Battery BMS SOH", "%", 1.0),
        Sensor::scalar(&[367], "Battery BMS alarm flag", "", 1.0),
        Sensor::scalar(&[368], "Battery BMS fault flag", "", 1.0),
    ]);
    defs
}

// ───────────────────────────────────────────────────────────────
// Fault tables (1-based fault number across the register tuple)
// ───────────────────────────────────────────────────────────────

static FAULTS: [(u16, &str); 13] = [
    (13, "F13 Working mode change"),
    (18, "F18 AC over current"),
    (20, "F20 DC over current"),
    (23, "F23 AC leak current or transient over current"),
    (24, "F24 DC insulation impedance"),
    (26, "F26 DC busbar imbalanced"),
    (29, "F29 Parallel comms cable"),
    (35, "F35 No AC grid"),
    (42, "F42 AC line low voltage"),
    (47, "F47 AC freq high/low"),
    (56, "F56 DC busbar voltage low"),
    (63, "F63 ARC fault"),
    (64, "F64 Heat sink temp failure"),
];

static HV_FAULTS: [(u16, &str); 24] = [
    (1, "F01 DC inversed failure"),
    (7, "F07 DC start failure"),
    (10, "F10 Auxiliary power supply failure"),
    (11, "F11 AC main contactor errors"),
    (12, "F12 AC auxiliary contactor errors"),
    (13, "F13 Working mode change"),
    (18, "F18 AC over current"),
    (20, "F20 DC over current"),
    (22, "F22 Remote emergency stop"),
    (23, "F23 AC leakage current is transient over current"),
    (24, "F24 DC insulation impedance"),
    (26, "F26 DC busbar imbalanced"),
    (29, "F29 Parallel comms cable/AC load switch failure"),
    (34, "F34 AC overload (backup)"),
    (35, "F35 No AC grid"),
    (41, "F41 Parallel system stopped"),
    (42, "F42 AC line low voltage"),
    (46, "F46 Battery 1 fault"),
    (47, "F47 AC grid freq too high"),
    (48, "F48 AC grid freq too low"),
    (49, "F49 Battery 2 fault"),
    (58, "F58 BMS communication lost"),
    (63, "F63 ARC fault"),
    (64, "F64 Heat sink temp failure"),
];

// ───────────────────────────────────────────────────────────────
// Sensor groups
// ───────────────────────────────────────────────────────────────

/// Named groups a configuration can pull in wholesale. Ids missing from
/// the selected family are skipped with a log line, never fatal.
static SENSOR_GROUPS: [(&str, &[&str]); 6] = [
    (
        "energy_management",
        &[
            "total_battery_charge",
            "total_battery_discharge",
            "total_grid_export",
            "total_grid_import",
            "total_pv_energy",
        ],
    ),
    (
        "power_flow_card",
        &[
            "aux_power",
            "battery_1_soc",
            "battery_1_voltage",
            "battery_current",
            "battery_power",
            "battery_soc",
            "battery_voltage",
            "day_battery_charge",
            "day_battery_discharge",
            "day_grid_export",
            "day_grid_import",
            "day_load_energy",
            "day_pv_energy",
            "essential_power",
            "grid_connected",
            "grid_ct_power",
            "grid_frequency",
            "grid_l1_power",
            "grid_l2_power",
            "grid_l3_power",
            "grid_power",
            "grid_voltage",
            "grid_current",
            "inverter_current",
            "inverter_power",
            "inverter_voltage",
            "load_frequency",
            "load_power",
            "load_l1_power",
            "load_l2_power",
            "load_l3_power",
            "non_essential_power",
            "overall_state",
            "priority_load",
            "pv_power",
            "pv1_current",
            "pv1_power",
            "pv1_voltage",
            "pv2_current",
            "pv2_power",
            "pv2_voltage",
            "use_timer",
        ],
    ),
    (
        "settings",
        &[
            "load_limit",
            "prog1_capacity",
            "prog1_charge",
            "prog1_power",
            "prog1_time",
            "prog2_capacity",
            "prog2_charge",
            "prog2_power",
            "prog2_time",
            "prog3_capacity",
            "prog3_charge",
            "prog3_power",
            "prog3_time",
            "prog4_capacity",
            "prog4_charge",
            "prog4_power",
            "prog4_time",
            "prog5_capacity",
            "prog5_charge",
            "prog5_power",
            "prog5_time",
            "prog6_capacity",
            "prog6_charge",
            "prog6_power",
            "prog6_time",
            "date_time",
            "grid_charge_battery_current",
            "grid_charge_start_battery_soc",
            "grid_charge_enabled",
            "use_timer",
            "solar_export",
            "export_limit_power",
            "battery_max_charge_current",
            "battery_max_discharge_current",
            "battery_shutdown_capacity",
            "battery_restart_capacity",
            "battery_low_capacity",
            "battery_type",
            "battery_wake_up",
            "battery_resistance",
            "battery_charge_efficiency",
            "ups_delay_time",
        ],
    ),
    (
        "generator",
        &[
            "generator_port_usage",
            "generator_off_soc",
            "generator_on_soc",
            "generator_max_operating_time",
            "generator_cooling_time",
            "min_pv_power_for_gen_start",
            "generator_charge_enabled",
            "generator_charge_start_battery_soc",
            "generator_charge_battery_current",
            "gen_signal_on",
        ],
    ),
    (
        "diagnostics",
        &[
            "inverter_l1_power",
            "inverter_l2_power",
            "inverter_l3_power",
            "grid_voltage",
            "grid_l1_voltage",
            "grid_l2_voltage",
            "grid_l3_voltage",
            "battery_temperature",
            "battery_voltage",
            "battery_soc",
            "battery_power",
            "battery_current",
            "fault",
            "dc_transformer_temperature",
            "radiator_temperature",
            "grid_relay_status",
            "inverter_relay_status",
            "battery_bms_alarm_flag",
            "battery_bms_fault_flag",
            "battery_bms_soh",
            "fan_warning",
            "grid_phase_warning",
        ],
    ),
    (
        "battery",
        &[
            "battery_type",
            "battery_max_charge_current",
            "battery_max_discharge_current",
            "battery_shutdown_capacity",
            "battery_restart_capacity",
            "battery_low_capacity",
            "battery_wake_up",
            "battery_resistance",
            "battery_charge_efficiency",
        ],
    ),
];

static DEPRECATED: [(&str, &str); 4] = [
    ("battery_temp", "battery_temperature"),
    ("grid_ct_load", "grid_ct_power"),
    ("temp_environment", "environment_temperature"),
    ("day_active_energy", "day_load_energy"),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_family_defines_startup_sensors() {
        for family in [DefFamily::SinglePhase, DefFamily::ThreePhaseLv, DefFamily::ThreePhaseHv] {
            let defs = SensorDefinitions::load(family, 15);
            assert_eq!(defs.serial().id, "serial");
            assert_eq!(defs.rated_power().id, "rated_power");
        }
    }

    #[test]
    fn sensor_ids_are_unique_per_family() {
        let defs = SensorDefinitions::load(DefFamily::SinglePhase, 15);
        let mut seen = std::collections::HashSet::new();
        for s in defs.iter() {
            assert!(seen.insert(s.id.clone()), "duplicate sensor id {}", s.id);
        }
    }

    #[test]
    fn group_resolution_and_all() {
        let defs = SensorDefinitions::load(DefFamily::SinglePhase, 15);
        let settings = defs.group("settings").unwrap();
        assert!(settings.contains(&"load_limit".to_string()));
        assert!(defs.is_group("all"));
        assert!(!defs.is_group("battery_soc"));
        let all = defs.group("all").unwrap();
        assert!(all.len() > 50);
    }

    #[test]
    fn register_adds_to_mysensors_group() {
        let mut defs = SensorDefinitions::load(DefFamily::SinglePhase, 15);
        defs.register(Sensor::scalar(&[300], "My custom power", "W", 1.0));
        assert_eq!(defs.group("mysensors").unwrap(), vec!["my_custom_power"]);
        assert!(defs.get("my_custom_power").is_some());
    }

    #[test]
    fn deprecated_ids_map_to_replacements() {
        let defs = SensorDefinitions::load(DefFamily::SinglePhase, 15);
        assert_eq!(defs.deprecated("battery_temp"), Some("battery_temperature"));
        assert_eq!(defs.deprecated("battery_temperature"), None);
    }

    #[test]
    fn hv_family_uses_extended_fault_table() {
        let defs = SensorDefinitions::load(DefFamily::ThreePhaseHv, 15);
        let fault = defs.get("fault").unwrap();
        match fault.kind {
            SensorKind::Fault { table } => assert!(table.len() > FAULTS.len()),
            _ => panic!("fault sensor has wrong kind"),
        }
    }
}
