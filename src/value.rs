//! Sensor value variant.
//!
//! Every decoded register span ends up as one of these. Equality is
//! cross-numeric (`Int(2) == Float(2.0)`) because the report predicates
//! compare a freshly decoded value against the last published one, and the
//! decoder only keeps the float representation when the value is not
//! integral.

use core::fmt;

/// A decoded sensor value.
#[derive(Debug, Clone)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    /// No value yet (never read, or never published).
    None,
}

impl Value {
    /// Numeric view, if this value has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Payload representation for the state topic.
    /// Booleans use the home-automation ON/OFF convention.
    pub fn payload(&self) -> String {
        match self {
            Self::Bool(true) => "ON".into(),
            Self::Bool(false) => "OFF".into(),
            other => other.to_string(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::None, Self::None) => true,
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v}"),
            Self::None => Ok(()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cross_numeric_equality() {
        assert_eq!(Value::Int(2), Value::Float(2.0));
        assert_ne!(Value::Int(2), Value::Float(2.1));
        assert_ne!(Value::Int(1), Value::Bool(true));
    }

    #[test]
    fn none_only_equals_none() {
        assert_eq!(Value::None, Value::None);
        assert_ne!(Value::None, Value::Int(0));
        assert_ne!(Value::None, Value::Text(String::new()));
    }

    #[test]
    fn bool_payload_is_on_off() {
        assert_eq!(Value::Bool(true).payload(), "ON");
        assert_eq!(Value::Bool(false).payload(), "OFF");
        assert_eq!(Value::Float(-0.2).payload(), "-0.2");
    }
}
