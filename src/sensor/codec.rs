//! Register decode — register tuples in, typed values out.
//!
//! The numeric path is shared by every variant: mask each word, combine
//! the words little-endian (low word first, each next word shifted left
//! 16), interpret the combined integer as two's-complement over the full
//! `16 * width` bits when the factor is negative, scale by `|factor|`,
//! and collapse to an integer when the scaled result is integral.
//! Variant-specific post-processing (offsets, lookups, bit expansion,
//! byte unpacking) happens on top.

use crate::error::DecodeError;
use crate::sensor::{DepValues, Sensor, SensorKind, LOAD_LIMIT_ID, LOAD_LIMIT_ZERO_EXPORT};
use crate::value::Value;

/// Decode `regs` for `sensor`. The register slice must match the sensor's
/// width exactly; the caller slices spans accordingly.
///
/// `deps` supplies current values of dependency sensors (zero-export mode
/// lookup). Failed decodes never clear a stored value; the caller keeps
/// the previous one.
pub fn decode(sensor: &Sensor, regs: &[u16], deps: &dyn DepValues) -> Result<Value, DecodeError> {
    if regs.len() != sensor.width() {
        return Err(DecodeError::WidthMismatch {
            expected: sensor.width(),
            got: regs.len(),
        });
    }

    match &sensor.kind {
        SensorKind::Scalar {
            absolute,
            zero_export_absolute,
        } => {
            let mut val = scaled(sensor, regs);
            if (*absolute || (*zero_export_absolute && zero_export_active(deps))) && val < 0.0 {
                val = -val;
            }
            Ok(int_round(val))
        }

        SensorKind::Math {
            factors,
            no_negative,
            absolute,
        } => {
            let mut val: f64 = regs
                .iter()
                .zip(factors)
                .map(|(&r, &f)| f64::from(signed16(r)) * f)
                .sum();
            if *absolute && val < 0.0 {
                val = -val;
            }
            if *no_negative && val < 0.0 {
                val = 0.0;
            }
            Ok(int_round(val))
        }

        SensorKind::Temperature { offset } => {
            let val = f64::from(regs[0]) * sensor.factor.abs() - offset;
            Ok(int_round(val))
        }

        SensorKind::Binary { off, on } => {
            let raw = masked(sensor, regs[0]);
            Ok(Value::Bool(match on {
                Some(on) => raw == *on,
                None => raw != *off,
            }))
        }

        SensorKind::Enum { options } | SensorKind::Select { options } | SensorKind::ProgSlot { options } => {
            let raw = masked(sensor, regs[0]);
            Ok(Value::Text(lookup_option(options, raw)))
        }

        SensorKind::Fault { table } => Ok(Value::Text(expand_faults(regs, table))),

        SensorKind::Serial => {
            let mut text = String::with_capacity(regs.len() * 2);
            for &word in regs {
                text.push(char::from((word >> 8) as u8));
                text.push(char::from((word & 0xFF) as u8));
            }
            Ok(Value::Text(text))
        }

        SensorKind::Switch { on, off } => {
            let raw = masked(sensor, regs[0]);
            Ok(Value::Bool(if raw == *on {
                true
            } else if raw == *off {
                false
            } else {
                raw != *off
            }))
        }

        SensorKind::Number { .. } => Ok(int_round(scaled(sensor, regs))),

        SensorKind::Time { .. } => {
            let raw = regs[0];
            let (hour, minute) = (raw / 100, raw % 100);
            if hour > 23 || minute > 59 {
                return Err(DecodeError::BadContent("time of day out of range"));
            }
            Ok(Value::Text(format!("{hour:02}:{minute:02}")))
        }

        SensorKind::SystemTime => {
            let (year, month) = (regs[0] >> 8, regs[0] & 0xFF);
            let (day, hour) = (regs[1] >> 8, regs[1] & 0xFF);
            let (minute, second) = (regs[2] >> 8, regs[2] & 0xFF);
            if month == 0 || month > 12 || day == 0 || day > 31 || hour > 23 || minute > 59 || second > 59 {
                return Err(DecodeError::BadContent("date/time out of range"));
            }
            Ok(Value::Text(format!(
                "{year:02}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}"
            )))
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Shared numeric path
// ───────────────────────────────────────────────────────────────

/// Mask, combine and scale the registers into a float.
fn scaled(sensor: &Sensor, regs: &[u16]) -> f64 {
    let mut combined: u64 = 0;
    for (i, &word) in regs.iter().enumerate() {
        combined |= u64::from(masked(sensor, word)) << (16 * i);
    }
    let val = if sensor.factor < 0.0 {
        // The sign bit lives in the combined integer, not in each word.
        signed(combined, 16 * regs.len() as u32) as f64
    } else {
        combined as f64
    };
    val * sensor.factor.abs()
}

fn masked(sensor: &Sensor, word: u16) -> u16 {
    if sensor.bitmask != 0 {
        word & sensor.bitmask
    } else {
        word
    }
}

/// Two's-complement interpretation of `val` over `bits` bits.
pub fn signed(val: u64, bits: u32) -> i64 {
    debug_assert!(bits <= 63 && bits > 0);
    if val & (1 << (bits - 1)) != 0 {
        val as i64 - (1_i64 << bits)
    } else {
        val as i64
    }
}

/// Signed 16-bit view of a single register.
pub fn signed16(word: u16) -> i16 {
    word as i16
}

/// Collapse a float to an integer value when it is integral within 1e-9.
/// Rounding is half away from zero.
pub fn int_round(val: f64) -> Value {
    let rounded = if val >= 0.0 {
        (val + 0.5).floor()
    } else {
        (val - 0.5).ceil()
    };
    if (val - rounded).abs() < 1e-9 {
        Value::Int(rounded as i64)
    } else {
        Value::Float(val)
    }
}

fn zero_export_active(deps: &dyn DepValues) -> bool {
    match deps.value_of(LOAD_LIMIT_ID) {
        Some(Value::Int(v)) => *v == LOAD_LIMIT_ZERO_EXPORT,
        Some(Value::Text(label)) => label == "Zero Export",
        _ => false,
    }
}

fn lookup_option(options: &[(u16, String)], raw: u16) -> String {
    options
        .iter()
        .find(|(v, _)| *v == raw)
        .map_or_else(|| format!("unknown {raw}"), |(_, label)| label.clone())
}

/// Expand the set bits of the register tuple into fault labels.
/// Bit indexing continues across words: bit 0 of the second word is fault
/// number 17. Faults missing from the table render as bare `Fnn`.
fn expand_faults(regs: &[u16], table: &[(u16, &str)]) -> String {
    let mut labels: Vec<String> = Vec::new();
    for (word_idx, &word) in regs.iter().enumerate() {
        for bit in 0..16 {
            if word & (1 << bit) == 0 {
                continue;
            }
            let fault_nr = (word_idx * 16 + bit + 1) as u16;
            let label = table
                .iter()
                .find(|(nr, _)| *nr == fault_nr)
                .map_or_else(|| format!("F{fault_nr:02}"), |(_, l)| (*l).to_string());
            labels.push(label);
        }
    }
    labels.join(", ")
}
