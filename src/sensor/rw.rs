//! Writable sensors — desired value in, register payload out.
//!
//! Encode is the constrained inverse of decode: every accepted value must
//! round-trip (`decode(encode(v)) == v`). Rejections are typed
//! [`InvalidValue`]s that the agent reports back to the bus without
//! interrupting its tick loop.

use crate::error::InvalidValue;
use crate::sensor::{DepValues, Sensor, SensorKind};
use crate::value::Value;

/// Fallback bounds when a sensor-referenced bound has no value yet.
const DEFAULT_MIN: i64 = 0;
const DEFAULT_MAX: i64 = u16::MAX as i64;

/// Encode `value` into the register payload for `sensor`.
///
/// `deps` supplies current values for sensor-referenced number bounds.
pub fn encode(
    sensor: &Sensor,
    value: &Value,
    deps: &dyn DepValues,
) -> Result<Vec<u16>, InvalidValue> {
    match &sensor.kind {
        SensorKind::Switch { on, off } => {
            let state = parse_on_off(value)?;
            Ok(vec![if state { *on } else { *off }])
        }

        SensorKind::Select { options } | SensorKind::ProgSlot { options } => {
            let label = match value {
                Value::Text(label) => label.as_str(),
                other => return Err(InvalidValue::NotAnOption(other.to_string())),
            };
            options
                .iter()
                .find(|(_, l)| l == label)
                .map(|(raw, _)| vec![*raw])
                .ok_or_else(|| InvalidValue::NotAnOption(label.to_string()))
        }

        SensorKind::Number { min, max } => {
            let val = value
                .as_f64()
                .ok_or(InvalidValue::BadFormat("expected a number"))?;
            let min = min.resolve(deps, DEFAULT_MIN);
            let max = max.resolve(deps, DEFAULT_MAX);
            if val < min as f64 || val > max as f64 {
                return Err(InvalidValue::OutOfRange {
                    value: val,
                    min,
                    max,
                });
            }
            encode_scaled(sensor, val)
        }

        SensorKind::Time { step_minutes } => {
            let (hour, minute) = parse_time(value)?;
            if *step_minutes > 1 && minute % step_minutes != 0 {
                return Err(InvalidValue::OffStep(format!(
                    "{hour:02}:{minute:02} (minutes must be a multiple of {step_minutes})"
                )));
            }
            Ok(vec![hour * 100 + minute])
        }

        SensorKind::SystemTime => {
            let text = match value {
                Value::Text(t) => t.as_str(),
                _ => return Err(InvalidValue::BadFormat("expected YY-MM-DD HH:MM:SS")),
            };
            let parts = parse_system_time(text)?;
            let [year, month, day, hour, minute, second] = parts;
            Ok(vec![
                (year << 8) | month,
                (day << 8) | hour,
                (minute << 8) | second,
            ])
        }

        _ => Err(InvalidValue::NotWritable),
    }
}

/// Scale an engineering value back into registers, little-endian split.
/// Values that do not land exactly on a factor step are rejected so the
/// round-trip invariant holds.
fn encode_scaled(sensor: &Sensor, val: f64) -> Result<Vec<u16>, InvalidValue> {
    let factor = sensor.factor.abs();
    let raw = (val / factor).round();
    if (raw * factor - val).abs() > 1e-9 {
        return Err(InvalidValue::OffStep(val.to_string()));
    }

    let width = sensor.width() as u32;
    let bits = 16 * width;
    let combined: u64 = if raw < 0.0 {
        if sensor.factor >= 0.0 {
            return Err(InvalidValue::OutOfRange {
                value: val,
                min: 0,
                max: DEFAULT_MAX,
            });
        }
        // Two's complement over the sensor's full register width.
        (raw as i64).rem_euclid(1_i64 << bits) as u64
    } else {
        raw as u64
    };

    Ok((0..width)
        .map(|i| ((combined >> (16 * i)) & 0xFFFF) as u16)
        .collect())
}

fn parse_on_off(value: &Value) -> Result<bool, InvalidValue> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Text(t) if t.eq_ignore_ascii_case("on") => Ok(true),
        Value::Text(t) if t.eq_ignore_ascii_case("off") => Ok(false),
        other => Err(InvalidValue::NotAnOption(other.to_string())),
    }
}

fn parse_time(value: &Value) -> Result<(u16, u16), InvalidValue> {
    let text = match value {
        Value::Text(t) => t.as_str(),
        _ => return Err(InvalidValue::BadFormat("expected HH:MM")),
    };
    let (h, m) = text
        .split_once(':')
        .ok_or(InvalidValue::BadFormat("expected HH:MM"))?;
    let hour: u16 = h
        .parse()
        .map_err(|_| InvalidValue::BadFormat("expected HH:MM"))?;
    let minute: u16 = m
        .parse()
        .map_err(|_| InvalidValue::BadFormat("expected HH:MM"))?;
    if hour > 23 || minute > 59 {
        return Err(InvalidValue::BadFormat("time of day out of range"));
    }
    Ok((hour, minute))
}

fn parse_system_time(text: &str) -> Result<[u16; 6], InvalidValue> {
    const SHAPE: InvalidValue = InvalidValue::BadFormat("expected YY-MM-DD HH:MM:SS");
    let (date, time) = text.trim().split_once(' ').ok_or(SHAPE)?;
    let date: Vec<&str> = date.split('-').collect();
    let time: Vec<&str> = time.split(':').collect();
    if date.len() != 3 || time.len() != 3 {
        return Err(SHAPE);
    }
    let mut out = [0_u16; 6];
    for (slot, part) in out.iter_mut().zip(date.iter().chain(time.iter())) {
        *slot = part.parse().map_err(|_| SHAPE)?;
    }
    let [year, month, day, hour, minute, second] = out;
    if year > 99
        || !(1..=12).contains(&month)
        || !(1..=31).contains(&day)
        || hour > 23
        || minute > 59
        || second > 59
    {
        return Err(InvalidValue::BadFormat("date/time out of range"));
    }
    Ok(out)
}
