//! Dongle transport — Modbus RTU wrapped in the vendor UDP envelope.
//!
//! Wire format:
//! ```text
//! ┌──────────┬───────────────────┬───────────┬──────────────────┐
//! │ Magic    │ Dongle serial     │ Length    │ RTU frame        │
//! │ A5 5A    │ u64 big-endian    │ u16 BE    │ unit+PDU+CRC16   │
//! └──────────┴───────────────────┴───────────┴──────────────────┘
//! ```
//!
//! The dongle forwards the embedded RTU frame to the inverter it fronts
//! and mirrors the envelope back with the response frame. The serial
//! number in the envelope selects the dongle; a response carrying a
//! different serial is a framing error.

use log::{debug, warn};
use tokio::net::UdpSocket;

use crate::error::ConnError;

use super::Transport;

const MAGIC: [u8; 2] = [0xA5, 0x5A];
const HEADER_LEN: usize = 2 + 8 + 2;
const MAX_FRAME: usize = 512;

const FN_READ_HOLDING: u8 = 0x03;
const FN_WRITE_SINGLE: u8 = 0x06;
const FN_WRITE_MULTIPLE: u8 = 0x10;

// ───────────────────────────────────────────────────────────────
// Envelope codec
// ───────────────────────────────────────────────────────────────

/// Wrap an RTU frame in the vendor envelope.
pub fn wrap(serial: u64, rtu: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + rtu.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&serial.to_be_bytes());
    out.extend_from_slice(&(rtu.len() as u16).to_be_bytes());
    out.extend_from_slice(rtu);
    out
}

/// Unwrap a response envelope, verifying magic, serial and length.
pub fn unwrap(serial: u64, frame: &[u8]) -> Result<&[u8], ConnError> {
    if frame.len() < HEADER_LEN || frame[..2] != MAGIC {
        return Err(ConnError::Frame);
    }
    let mut serial_bytes = [0_u8; 8];
    serial_bytes.copy_from_slice(&frame[2..10]);
    let got_serial = u64::from_be_bytes(serial_bytes);
    if got_serial != serial {
        warn!("dongle response for serial {got_serial}, expected {serial}");
        return Err(ConnError::Frame);
    }
    let len = u16::from_be_bytes([frame[10], frame[11]]) as usize;
    if frame.len() != HEADER_LEN + len {
        return Err(ConnError::Frame);
    }
    Ok(&frame[HEADER_LEN..])
}

// ───────────────────────────────────────────────────────────────
// RTU codec
// ───────────────────────────────────────────────────────────────

fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16::State::<crc16::MODBUS>::calculate(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Validate the trailing CRC and strip it.
fn check_crc(frame: &[u8]) -> Result<&[u8], ConnError> {
    if frame.len() < 4 {
        return Err(ConnError::Frame);
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    let expect = crc16::State::<crc16::MODBUS>::calculate(body);
    if tail != expect.to_le_bytes() {
        return Err(ConnError::Frame);
    }
    Ok(body)
}

pub fn read_request(unit: u8, start: u16, count: u16) -> Vec<u8> {
    let mut frame = vec![unit, FN_READ_HOLDING];
    frame.extend_from_slice(&start.to_be_bytes());
    frame.extend_from_slice(&count.to_be_bytes());
    append_crc(&mut frame);
    frame
}

pub fn write_single_request(unit: u8, addr: u16, value: u16) -> Vec<u8> {
    let mut frame = vec![unit, FN_WRITE_SINGLE];
    frame.extend_from_slice(&addr.to_be_bytes());
    frame.extend_from_slice(&value.to_be_bytes());
    append_crc(&mut frame);
    frame
}

pub fn write_multiple_request(unit: u8, addr: u16, values: &[u16]) -> Vec<u8> {
    let mut frame = vec![unit, FN_WRITE_MULTIPLE];
    frame.extend_from_slice(&addr.to_be_bytes());
    frame.extend_from_slice(&(values.len() as u16).to_be_bytes());
    frame.push((values.len() * 2) as u8);
    for v in values {
        frame.extend_from_slice(&v.to_be_bytes());
    }
    append_crc(&mut frame);
    frame
}

/// Validate a response frame against the request's unit and function and
/// return the PDU payload (after unit and function bytes).
fn response_payload<'a>(rtu: &'a [u8], unit: u8, function: u8) -> Result<&'a [u8], ConnError> {
    let body = check_crc(rtu)?;
    if body.len() < 2 || body[0] != unit {
        return Err(ConnError::Frame);
    }
    if body[1] == function | 0x80 {
        let code = body.get(2).copied().unwrap_or(0);
        warn!("unit {unit} fn {function:#04x}: modbus exception {code:#04x}");
        return Err(ConnError::Frame);
    }
    if body[1] != function {
        return Err(ConnError::Frame);
    }
    Ok(&body[2..])
}

/// Decode the register payload of a read response.
pub fn parse_read_response(rtu: &[u8], unit: u8, count: u16) -> Result<Vec<u16>, ConnError> {
    let payload = response_payload(rtu, unit, FN_READ_HOLDING)?;
    let expect = count as usize * 2;
    if payload.len() != expect + 1 || payload[0] as usize != expect {
        return Err(ConnError::Frame);
    }
    Ok(payload[1..]
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect())
}

// ───────────────────────────────────────────────────────────────
// Transport
// ───────────────────────────────────────────────────────────────

pub struct DongleTransport {
    host: String,
    port: u16,
    serial: u64,
    socket: Option<UdpSocket>,
}

impl DongleTransport {
    pub fn new(host: &str, port: u16, serial: u64) -> Self {
        Self {
            host: host.to_string(),
            port,
            serial,
            socket: None,
        }
    }

    async fn ensure(&mut self) -> Result<&UdpSocket, ConnError> {
        if self.socket.is_none() {
            let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(|e| {
                warn!("dongle socket bind failed: {e}");
                ConnError::Refused
            })?;
            socket
                .connect((self.host.as_str(), self.port))
                .await
                .map_err(|e| {
                    warn!("dongle {}:{}: {e}", self.host, self.port);
                    ConnError::Refused
                })?;
            debug!("dongle socket bound for {}:{}", self.host, self.port);
            self.socket = Some(socket);
        }
        Ok(self.socket.as_ref().expect("just bound"))
    }

    /// One request/response exchange with the dongle.
    async fn exchange(&mut self, rtu: Vec<u8>) -> Result<Vec<u8>, ConnError> {
        let serial = self.serial;
        let socket = self.ensure().await?;
        let frame = wrap(serial, &rtu);
        socket.send(&frame).await.map_err(|e| {
            warn!("dongle send failed: {e}");
            ConnError::Closed
        })?;

        let mut buf = [0_u8; MAX_FRAME];
        let n = socket.recv(&mut buf).await.map_err(|e| {
            warn!("dongle recv failed: {e}");
            ConnError::Closed
        })?;
        Ok(unwrap(serial, &buf[..n])?.to_vec())
    }
}

#[async_trait::async_trait]
impl Transport for DongleTransport {
    async fn read_holding(
        &mut self,
        unit: u8,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, ConnError> {
        let rtu = self.exchange(read_request(unit, start, count)).await?;
        parse_read_response(&rtu, unit, count)
    }

    async fn write_register(&mut self, unit: u8, addr: u16, value: u16) -> Result<(), ConnError> {
        let rtu = self.exchange(write_single_request(unit, addr, value)).await?;
        // The echo response mirrors address and value.
        let payload = response_payload(&rtu, unit, FN_WRITE_SINGLE)?;
        if payload.len() != 4 {
            return Err(ConnError::Frame);
        }
        Ok(())
    }

    async fn write_registers(
        &mut self,
        unit: u8,
        addr: u16,
        values: &[u16],
    ) -> Result<(), ConnError> {
        let rtu = self
            .exchange(write_multiple_request(unit, addr, values))
            .await?;
        let payload = response_payload(&rtu, unit, FN_WRITE_MULTIPLE)?;
        if payload.len() != 4 {
            return Err(ConnError::Frame);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERIAL: u64 = 0x1722_3344_5566_7788;

    fn respond(request_rtu: &[u8], registers: &[u16]) -> Vec<u8> {
        let mut rtu = vec![request_rtu[0], request_rtu[1], (registers.len() * 2) as u8];
        for r in registers {
            rtu.extend_from_slice(&r.to_be_bytes());
        }
        append_crc(&mut rtu);
        wrap(SERIAL, &rtu)
    }

    #[test]
    fn envelope_round_trip() {
        let rtu = read_request(1, 184, 2);
        let frame = wrap(SERIAL, &rtu);
        assert_eq!(&frame[..2], &MAGIC);
        assert_eq!(unwrap(SERIAL, &frame).unwrap(), rtu.as_slice());
    }

    #[test]
    fn serial_mismatch_is_a_frame_error() {
        let frame = wrap(SERIAL, &read_request(1, 0, 1));
        assert_eq!(unwrap(SERIAL + 1, &frame), Err(ConnError::Frame));
    }

    #[test]
    fn truncated_envelope_rejected() {
        let frame = wrap(SERIAL, &read_request(1, 0, 1));
        assert_eq!(unwrap(SERIAL, &frame[..frame.len() - 1]), Err(ConnError::Frame));
        assert_eq!(unwrap(SERIAL, &frame[..4]), Err(ConnError::Frame));
    }

    #[test]
    fn read_request_has_valid_crc() {
        let rtu = read_request(3, 0x00B8, 2);
        assert_eq!(rtu[0], 3);
        assert_eq!(rtu[1], FN_READ_HOLDING);
        assert_eq!(&rtu[2..6], &[0x00, 0xB8, 0x00, 0x02]);
        assert!(check_crc(&rtu).is_ok());
    }

    #[test]
    fn corrupted_crc_rejected() {
        let mut rtu = read_request(3, 10, 1);
        let last = rtu.len() - 1;
        rtu[last] ^= 0xFF;
        assert_eq!(check_crc(&rtu), Err(ConnError::Frame));
    }

    #[test]
    fn read_response_parses_registers() {
        let request = read_request(1, 184, 2);
        let frame = respond(&request, &[0x0102, 0xFFFE]);
        let rtu = unwrap(SERIAL, &frame).unwrap();
        let regs = parse_read_response(rtu, 1, 2).unwrap();
        assert_eq!(regs, vec![0x0102, 0xFFFE]);
    }

    #[test]
    fn exception_response_is_a_frame_error() {
        let mut rtu = vec![1, FN_READ_HOLDING | 0x80, 0x02];
        append_crc(&mut rtu);
        assert_eq!(parse_read_response(&rtu, 1, 2), Err(ConnError::Frame));
    }

    #[test]
    fn wrong_unit_rejected() {
        let request = read_request(1, 184, 1);
        let frame = respond(&request, &[7]);
        let rtu = unwrap(SERIAL, &frame).unwrap();
        assert_eq!(parse_read_response(rtu, 2, 1), Err(ConnError::Frame));
    }

    #[test]
    fn write_multiple_request_layout() {
        let rtu = write_multiple_request(1, 250, &[1930, 2000]);
        assert_eq!(rtu[1], FN_WRITE_MULTIPLE);
        assert_eq!(&rtu[2..4], &250_u16.to_be_bytes());
        assert_eq!(&rtu[4..6], &2_u16.to_be_bytes());
        assert_eq!(rtu[6], 4);
        assert!(check_crc(&rtu).is_ok());
    }
}
