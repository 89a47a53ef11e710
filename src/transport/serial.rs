//! Serial Transportation, through the host's CDC-ACM driver.
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use anyhow::Result;
use serialport::SerialPort;

use super::{SessionClaim, Transport};
use crate::constants::{PRODUCT_ID, VENDOR_ID};
use crate::error::Error;

/// Ignored by a USB CDC device, but the driver wants one.
const BAUDRATE: u32 = 115200;
const SERIAL_TIMEOUT_MS: u64 = 1000;

pub struct SerialTransport {
    serial_port: Box<dyn SerialPort>,
    _claim: SessionClaim,
}

impl SerialTransport {
    /// Ports whose USB IDs match the dumper.
    pub fn scan_ports() -> Result<Vec<String>> {
        let ports = serialport::available_ports()?;
        Ok(ports
            .into_iter()
            .filter(|p| match &p.port_type {
                serialport::SerialPortType::UsbPort(usb) => {
                    usb.vid == VENDOR_ID && usb.pid == PRODUCT_ID
                }
                _ => false,
            })
            .map(|p| p.port_name)
            .collect())
    }

    pub fn open(port: &str) -> Result<Self, Error> {
        let claim = SessionClaim::acquire()?;
        log::info!("Opening serial port: \"{}\"", port);
        let serial_port = serialport::new(port, BAUDRATE)
            .timeout(Duration::from_millis(SERIAL_TIMEOUT_MS))
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => Error::DeviceNotFound,
                serialport::ErrorKind::Io(ErrorKind::NotFound) => Error::DeviceNotFound,
                _ => Error::ClaimInterface(e.to_string()),
            })?;
        Ok(SerialTransport {
            serial_port,
            _claim: claim,
        })
    }

    pub fn open_any() -> Result<Self, Error> {
        let ports = Self::scan_ports().map_err(|e| Error::UsbInit(e.to_string()))?;
        match ports.first() {
            Some(port) => Self::open(port),
            None => Err(Error::DeviceNotFound),
        }
    }
}

impl Transport for SerialTransport {
    fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        self.serial_port.write_all(raw)?;
        self.serial_port.flush()?;
        Ok(())
    }

    fn recv_raw(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.serial_port.set_timeout(timeout)?;
        match self.serial_port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}
