//! Modbus TCP transport.
//!
//! Keeps a single socket. The connection is established lazily on the
//! first call and dropped on any transport error, so the next call after
//! a failure reconnects.

use log::{debug, warn};
use tokio_modbus::client::{Context, Reader, Writer};
use tokio_modbus::slave::{Slave, SlaveContext};

use crate::error::ConnError;

use super::Transport;

pub struct TcpTransport {
    host: String,
    port: u16,
    ctx: Option<Context>,
}

impl TcpTransport {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            ctx: None,
        }
    }

    async fn ensure(&mut self, unit: u8) -> Result<&mut Context, ConnError> {
        if self.ctx.is_none() {
            let mut addrs = tokio::net::lookup_host((self.host.as_str(), self.port))
                .await
                .map_err(|e| {
                    warn!("{}:{}: resolve failed: {e}", self.host, self.port);
                    ConnError::Refused
                })?;
            let addr = addrs.next().ok_or(ConnError::Refused)?;
            let ctx = tokio_modbus::client::tcp::connect(addr).await.map_err(|e| {
                warn!("{}:{}: connect failed: {e}", self.host, self.port);
                ConnError::Refused
            })?;
            debug!("connected to {}:{}", self.host, self.port);
            self.ctx = Some(ctx);
        }
        let ctx = self.ctx.as_mut().expect("just connected");
        ctx.set_slave(Slave(unit));
        Ok(ctx)
    }

    /// Drop the socket so the next call reconnects.
    fn reset(&mut self) {
        self.ctx = None;
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn read_holding(
        &mut self,
        unit: u8,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, ConnError> {
        let ctx = self.ensure(unit).await?;
        match ctx.read_holding_registers(start, count).await {
            Ok(Ok(regs)) => Ok(regs),
            Ok(Err(exception)) => {
                warn!("unit {unit} read {start}+{count}: exception {exception}");
                Err(ConnError::Frame)
            }
            Err(e) => {
                self.reset();
                Err(map_transport(&e))
            }
        }
    }

    async fn write_register(&mut self, unit: u8, addr: u16, value: u16) -> Result<(), ConnError> {
        let ctx = self.ensure(unit).await?;
        match ctx.write_single_register(addr, value).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(exception)) => {
                warn!("unit {unit} write {addr}: exception {exception}");
                Err(ConnError::Frame)
            }
            Err(e) => {
                self.reset();
                Err(map_transport(&e))
            }
        }
    }

    async fn write_registers(
        &mut self,
        unit: u8,
        addr: u16,
        values: &[u16],
    ) -> Result<(), ConnError> {
        let ctx = self.ensure(unit).await?;
        match ctx.write_multiple_registers(addr, values).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(exception)) => {
                warn!("unit {unit} write {addr}x{}: exception {exception}", values.len());
                Err(ConnError::Frame)
            }
            Err(e) => {
                self.reset();
                Err(map_transport(&e))
            }
        }
    }
}

/// Map a transport-level failure onto the connector taxonomy.
#[allow(unreachable_patterns)]
pub(crate) fn map_transport(err: &tokio_modbus::Error) -> ConnError {
    match err {
        tokio_modbus::Error::Transport(io) => match io.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => ConnError::Timeout,
            std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::NotFound => {
                ConnError::Refused
            }
            std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::UnexpectedEof => ConnError::Closed,
            _ => ConnError::Frame,
        },
        _ => ConnError::Frame,
    }
}
