//! Byte-stream transports the gateway can drive.
//!
//! The protocol engine only needs three operations from the link: how many
//! bytes are waiting, read them, and write a frame. The transport is owned by
//! the dispatch loop alone, so implementations need `Send` but not `Sync`.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

#[cfg(feature = "serial")]
use super::GatewayError;
#[cfg(feature = "serial")]
use log::debug;
#[cfg(feature = "serial")]
use serialport::SerialPort;
#[cfg(feature = "serial")]
use std::io::{Read, Write};
#[cfg(feature = "serial")]
use tokio::time::{sleep, Duration};

pub trait Transport: Send {
    /// Bytes that can be read without blocking.
    fn bytes_available(&mut self) -> io::Result<usize>;
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
}

/// Serial link to the radio coordinator.
#[cfg(feature = "serial")]
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

#[cfg(feature = "serial")]
impl SerialTransport {
    /// Open the port 8N1, assert DTR/RTS so the coordinator wakes, and purge any
    /// boot chatter it printed before we attached.
    pub async fn open(port_name: &str, baud_rate: u32) -> Result<Self, GatewayError> {
        debug!("Opening serial port {} at {} baud", port_name, baud_rate);

        let mut port = serialport::new(port_name, baud_rate)
            .timeout(Duration::from_millis(50))
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|e| GatewayError::Serial(format!("failed to open {}: {}", port_name, e)))?;

        let _ = port.write_data_terminal_ready(true);
        let _ = port.write_request_to_send(true);
        sleep(Duration::from_millis(150)).await;

        if let Err(e) = port.clear(serialport::ClearBuffer::Input) {
            debug!("Could not purge input buffer on {}: {}", port_name, e);
        }

        debug!("Serial port {} ready", port_name);
        Ok(Self { port })
    }
}

#[cfg(feature = "serial")]
impl Transport for SerialTransport {
    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(self.port.bytes_to_read().map_err(io::Error::from)? as usize)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            other => other,
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data)?;
        self.port.flush()
    }
}

#[derive(Debug, Default)]
struct MemoryLink {
    inbound: VecDeque<u8>,
    written: Vec<u8>,
    fail_writes: bool,
}

/// In-memory transport. Clones share the same link, so a test (or simulator)
/// keeps one clone to inject device traffic and inspect what the gateway sent.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    link: Arc<Mutex<MemoryLink>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryLink> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue bytes as if the coordinator had sent them.
    pub fn inject(&self, data: impl AsRef<[u8]>) {
        self.lock().inbound.extend(data.as_ref().iter().copied());
    }

    /// Every line written so far, terminators stripped.
    pub fn written_lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.lock().written)
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Drain and return the lines written since the last call.
    pub fn take_written(&self) -> Vec<String> {
        let bytes = std::mem::take(&mut self.lock().written);
        String::from_utf8_lossy(&bytes)
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Make subsequent writes fail with `BrokenPipe`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }
}

impl Transport for MemoryTransport {
    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(self.lock().inbound.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut link = self.lock();
        let n = buf.len().min(link.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(link.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let mut link = self.lock();
        if link.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link down"));
        }
        link.written.extend_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_transport_shares_state_between_clones() {
        let wire = MemoryTransport::new();
        let mut link = wire.clone();
        wire.inject("ID:D1\n");
        assert_eq!(link.bytes_available().unwrap(), 6);

        let mut buf = [0u8; 4];
        assert_eq!(link.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"ID:D");
        assert_eq!(link.bytes_available().unwrap(), 2);

        link.write_all(b"CMD:BRD:DISC,CRC:0\n").unwrap();
        assert_eq!(wire.written_lines(), vec!["CMD:BRD:DISC,CRC:0".to_string()]);
        assert_eq!(wire.take_written().len(), 1);
        assert!(wire.written_lines().is_empty());
    }

    #[test]
    fn memory_transport_can_fail_writes() {
        let wire = MemoryTransport::new();
        let mut link = wire.clone();
        wire.set_fail_writes(true);
        let err = link.write_all(b"x\n").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(wire.written_lines().is_empty());
    }
}
