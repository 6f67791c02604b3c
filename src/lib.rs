//! Sunsynk bridge library.
//!
//! Exposes the pure-logic modules for integration testing and external
//! inspection. All transport- and broker-specific code lives behind port
//! traits in `connect` and `mqtt`, so the core pipeline (codec → planner →
//! agent → report) can be driven entirely with mock adapters.

#![deny(unused_must_use)]

pub mod agent;
pub mod config;
pub mod connect;
pub mod mqtt;
pub mod planner;
pub mod schedule;
pub mod sensor;
pub mod sensor_options;
pub mod state;
pub mod timer;
pub mod value;

mod error;

pub use error::{ConnError, DecodeError, Error, InvalidValue};
