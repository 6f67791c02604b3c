//! Connector — one logical field-side connection.
//!
//! ```text
//!   agent ──▶ Connector (deadline, stats, single in-flight slot)
//!                 │
//!                 ▼
//!           Transport trait ──▶ tcp / serial / dongle adapter
//! ```
//!
//! A [`Connector`] owns exactly one boxed [`Transport`] behind an async
//! mutex: at most one request is in flight, even when several inverter
//! agents share the connector (they multiplex by unit id). Every call
//! carries a deadline; an expired deadline counts toward the timeout
//! statistic and surfaces as [`ConnError::Timeout`]. Retry discipline
//! belongs to the caller; the connector never retries.

pub mod dongle;
pub mod serial;
pub mod tcp;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use tokio::sync::Mutex;

use crate::config::{ConnectorOptions, InverterOptions, Options};
use crate::error::{ConnError, Error};

// ───────────────────────────────────────────────────────────────
// Transport port
// ───────────────────────────────────────────────────────────────

/// Wire-level port implemented by each Modbus variant (and by mock
/// transports in tests).
#[async_trait]
pub trait Transport: Send {
    /// Read `count` holding registers starting at `start` (function 3).
    async fn read_holding(&mut self, unit: u8, start: u16, count: u16)
    -> Result<Vec<u16>, ConnError>;

    /// Write a single holding register (function 6).
    async fn write_register(&mut self, unit: u8, addr: u16, value: u16) -> Result<(), ConnError>;

    /// Write multiple holding registers (function 16).
    async fn write_registers(&mut self, unit: u8, addr: u16, values: &[u16])
    -> Result<(), ConnError>;
}

// ───────────────────────────────────────────────────────────────
// Connector
// ───────────────────────────────────────────────────────────────

/// Cumulative connector statistics, readable without the request lock.
#[derive(Debug, Default)]
pub struct ConnStats {
    pub requests: AtomicU64,
    pub errors: AtomicU64,
    pub timeouts: AtomicU64,
}

/// One shared connection with serialized access and timeout accounting.
pub struct Connector {
    name: String,
    timeout: Duration,
    transport: Mutex<Box<dyn Transport>>,
    stats: ConnStats,
}

impl Connector {
    pub fn new(name: &str, timeout_secs: u64, transport: Box<dyn Transport>) -> Self {
        Self {
            name: name.to_string(),
            timeout: Duration::from_secs(timeout_secs.max(1)),
            transport: Mutex::new(transport),
            stats: ConnStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &ConnStats {
        &self.stats
    }

    pub async fn read(&self, unit: u8, start: u16, count: u16) -> Result<Vec<u16>, ConnError> {
        let mut transport = self.transport.lock().await;
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        let res =
            tokio::time::timeout(self.timeout, transport.read_holding(unit, start, count)).await;
        self.account(res)
    }

    pub async fn write_holding(&self, unit: u8, addr: u16, value: u16) -> Result<(), ConnError> {
        let mut transport = self.transport.lock().await;
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        let res =
            tokio::time::timeout(self.timeout, transport.write_register(unit, addr, value)).await;
        self.account(res)
    }

    pub async fn write_multiple(
        &self,
        unit: u8,
        addr: u16,
        values: &[u16],
    ) -> Result<(), ConnError> {
        let mut transport = self.transport.lock().await;
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        let res =
            tokio::time::timeout(self.timeout, transport.write_registers(unit, addr, values)).await;
        self.account(res)
    }

    /// Fold a deadline-wrapped transport result into the statistics.
    fn account<T>(
        &self,
        res: Result<Result<T, ConnError>, tokio::time::error::Elapsed>,
    ) -> Result<T, ConnError> {
        match res {
            Ok(Ok(val)) => Ok(val),
            Ok(Err(e)) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
            Err(_) => {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(ConnError::Timeout)
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Connector manager
// ───────────────────────────────────────────────────────────────

/// Owns every named connector; inverter agents borrow them by reference,
/// so two agents naming the same connector share one serialized socket.
pub struct ConnectorManager {
    connectors: HashMap<String, Arc<Connector>>,
}

impl ConnectorManager {
    /// Build all configured connectors. Transports connect lazily, so
    /// this never touches the network.
    pub fn from_options(opt: &Options) -> Result<Self, Error> {
        let mut connectors = HashMap::new();
        for conn in &opt.connectors {
            connectors.insert(conn.name.clone(), Arc::new(build_connector(conn)?));
        }
        Ok(Self { connectors })
    }

    pub fn get(&self, name: &str) -> Option<Arc<Connector>> {
        self.connectors.get(name).cloned()
    }

    /// Resolve the connector for one inverter: a named shared connector,
    /// or a legacy per-inverter connection built from `port` and the
    /// top-level driver.
    pub fn for_inverter(
        &mut self,
        inv: &InverterOptions,
        opt: &Options,
    ) -> Result<Arc<Connector>, Error> {
        if !inv.connector.is_empty() {
            return self
                .get(&inv.connector)
                .ok_or_else(|| Error::Config(format!("unknown connector '{}'", inv.connector)));
        }

        // Legacy path: derive a private connector from the inverter line.
        let mut port = inv.port.clone();
        if port.is_empty() {
            warn!("{}: using port from debug_device: {}", inv.serial_nr, opt.debug_device);
            port.clone_from(&opt.debug_device);
        }
        let legacy = ConnectorOptions {
            name: format!("legacy:{}", inv.ha_prefix),
            kind: match opt.driver.as_str() {
                "solarman" => "solarman".into(),
                _ if port.starts_with("serial:") || port.starts_with("/dev") => "serial".into(),
                _ => "tcp".into(),
            },
            host: port,
            port: 502,
            driver: opt.driver.clone(),
            timeout: opt.timeout,
            dongle_serial: inv.dongle_serial_number,
            baudrate: 9600,
        };
        let connector = Arc::new(build_connector(&legacy)?);
        self.connectors.insert(legacy.name.clone(), Arc::clone(&connector));
        Ok(connector)
    }
}

fn build_connector(conn: &ConnectorOptions) -> Result<Connector, Error> {
    let transport: Box<dyn Transport> = match conn.kind.as_str() {
        "tcp" => Box::new(tcp::TcpTransport::new(&conn.host, conn.port)),
        "serial" => Box::new(serial::SerialTransport::new(&conn.host, conn.baudrate)),
        "solarman" => Box::new(dongle::DongleTransport::new(
            &conn.host,
            conn.port,
            conn.dongle_serial,
        )),
        other => return Err(Error::Config(format!("invalid connector type: {other}"))),
    };
    Ok(Connector::new(&conn.name, conn.timeout, transport))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Transport that sleeps longer than the connector deadline.
    struct SlowTransport;

    #[async_trait]
    impl Transport for SlowTransport {
        async fn read_holding(
            &mut self,
            _unit: u8,
            _start: u16,
            _count: u16,
        ) -> Result<Vec<u16>, ConnError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Vec::new())
        }

        async fn write_register(&mut self, _: u8, _: u16, _: u16) -> Result<(), ConnError> {
            Ok(())
        }

        async fn write_registers(&mut self, _: u8, _: u16, _: &[u16]) -> Result<(), ConnError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expiry_counts_and_returns_timeout() {
        let conn = Connector::new("t", 1, Box::new(SlowTransport));
        let res = conn.read(1, 0, 4).await;
        assert_eq!(res, Err(ConnError::Timeout));
        assert_eq!(conn.stats().timeouts.load(Ordering::Relaxed), 1);
        assert_eq!(conn.stats().requests.load(Ordering::Relaxed), 1);
    }

    /// Transport that records request interleaving.
    struct SequencedTransport {
        in_flight: Arc<AtomicU64>,
        max_in_flight: Arc<AtomicU64>,
    }

    #[async_trait]
    impl Transport for SequencedTransport {
        async fn read_holding(
            &mut self,
            _unit: u8,
            _start: u16,
            count: u16,
        ) -> Result<Vec<u16>, ConnError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![0; count as usize])
        }

        async fn write_register(&mut self, _: u8, _: u16, _: u16) -> Result<(), ConnError> {
            Ok(())
        }

        async fn write_registers(&mut self, _: u8, _: u16, _: &[u16]) -> Result<(), ConnError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn concurrent_callers_are_serialized() {
        let in_flight = Arc::new(AtomicU64::new(0));
        let max = Arc::new(AtomicU64::new(0));
        let conn = Arc::new(Connector::new(
            "t",
            5,
            Box::new(SequencedTransport {
                in_flight: Arc::clone(&in_flight),
                max_in_flight: Arc::clone(&max),
            }),
        ));

        let mut handles = Vec::new();
        for unit in 1..=4 {
            let c = Arc::clone(&conn);
            handles.push(tokio::spawn(async move { c.read(unit, 0, 2).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(max.load(Ordering::SeqCst), 1, "requests must not overlap");
    }
}
