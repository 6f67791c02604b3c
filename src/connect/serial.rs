//! Modbus serial RTU transport.
//!
//! Opens the device once and keeps it. RTU has no connection to lose;
//! garbled frames surface as [`ConnError::Frame`] and the next poll simply
//! tries again on the same port.

use log::{debug, warn};
use tokio_modbus::client::{Context, Reader, Writer};
use tokio_modbus::slave::{Slave, SlaveContext};
use tokio_serial::SerialStream;

use crate::error::ConnError;

use super::tcp::map_transport;
use super::Transport;

pub struct SerialTransport {
    device: String,
    baudrate: u32,
    ctx: Option<Context>,
}

impl SerialTransport {
    pub fn new(device: &str, baudrate: u32) -> Self {
        // Accept the legacy "serial:/dev/ttyUSB0" spelling.
        let device = device.strip_prefix("serial:").unwrap_or(device);
        Self {
            device: device.to_string(),
            baudrate,
            ctx: None,
        }
    }

    fn ensure(&mut self, unit: u8) -> Result<&mut Context, ConnError> {
        if self.ctx.is_none() {
            let builder = tokio_serial::new(self.device.as_str(), self.baudrate);
            let port = SerialStream::open(&builder).map_err(|e| {
                warn!("{}: open failed: {e}", self.device);
                ConnError::Refused
            })?;
            debug!("opened {} at {} baud", self.device, self.baudrate);
            self.ctx = Some(tokio_modbus::client::rtu::attach(port));
        }
        let ctx = self.ctx.as_mut().expect("just opened");
        ctx.set_slave(Slave(unit));
        Ok(ctx)
    }
}

#[async_trait::async_trait]
impl Transport for SerialTransport {
    async fn read_holding(
        &mut self,
        unit: u8,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, ConnError> {
        let ctx = self.ensure(unit)?;
        match ctx.read_holding_registers(start, count).await {
            Ok(Ok(regs)) => Ok(regs),
            Ok(Err(exception)) => {
                warn!("unit {unit} read {start}+{count}: exception {exception}");
                Err(ConnError::Frame)
            }
            Err(e) => Err(map_transport(&e)),
        }
    }

    async fn write_register(&mut self, unit: u8, addr: u16, value: u16) -> Result<(), ConnError> {
        let ctx = self.ensure(unit)?;
        match ctx.write_single_register(addr, value).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(exception)) => {
                warn!("unit {unit} write {addr}: exception {exception}");
                Err(ConnError::Frame)
            }
            Err(e) => Err(map_transport(&e)),
        }
    }

    async fn write_registers(
        &mut self,
        unit: u8,
        addr: u16,
        values: &[u16],
    ) -> Result<(), ConnError> {
        let ctx = self.ensure(unit)?;
        match ctx.write_multiple_registers(addr, values).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(exception)) => {
                warn!("unit {unit} write {addr}x{}: exception {exception}", values.len());
                Err(ConnError::Frame)
            }
            Err(e) => Err(map_transport(&e)),
        }
    }
}
