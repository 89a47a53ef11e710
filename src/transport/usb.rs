//! USB Transportation.
use std::time::Duration;

use anyhow::Result;
use rusb::{Context, Device, DeviceHandle, UsbContext};

use super::{SessionClaim, Transport};
use crate::constants::{PRODUCT_ID, VENDOR_ID};
use crate::error::Error;

/// CDC data interface of the dumper.
const DATA_INTERFACE: u8 = 1;
const ENDPOINT_OUT: u8 = 0x01;
const ENDPOINT_IN: u8 = 0x81;

const WRITE_TIMEOUT_MS: u64 = 1000;

pub struct UsbTransport {
    device_handle: DeviceHandle<Context>,
    reattach_kernel_driver: bool,
    _claim: SessionClaim,
}

fn is_dumper(device: &Device<Context>) -> bool {
    device
        .device_descriptor()
        .map(|desc| desc.vendor_id() == VENDOR_ID && desc.product_id() == PRODUCT_ID)
        .unwrap_or(false)
}

impl UsbTransport {
    pub fn scan_devices() -> Result<usize> {
        let context = Context::new()?;

        let n = context
            .devices()?
            .iter()
            .filter(is_dumper)
            .enumerate()
            .map(|(i, device)| {
                log::debug!("Found MD dumper USB device #{}: [{:?}]", i, device);
            })
            .count();
        Ok(n)
    }

    pub fn open_nth(nth: usize) -> Result<UsbTransport, Error> {
        let claim = SessionClaim::acquire()?;
        let context = Context::new().map_err(|e| Error::UsbInit(e.to_string()))?;

        let device = context
            .devices()
            .map_err(|e| Error::UsbInit(e.to_string()))?
            .iter()
            .filter(is_dumper)
            .nth(nth)
            .ok_or(Error::DeviceNotFound)?;
        log::debug!("Found USB Device {:?}", device);

        let claim_err = |e: rusb::Error| Error::ClaimInterface(e.to_string());
        let mut device_handle = device.open().map_err(claim_err)?;

        let config = device.config_descriptor(0).map_err(claim_err)?;
        let mut endpoint_out_found = false;
        let mut endpoint_in_found = false;
        for intf in config.interfaces() {
            for desc in intf.descriptors() {
                for endpoint in desc.endpoint_descriptors() {
                    if endpoint.address() == ENDPOINT_OUT {
                        endpoint_out_found = true;
                    }
                    if endpoint.address() == ENDPOINT_IN {
                        endpoint_in_found = true;
                    }
                }
            }
        }
        if !(endpoint_out_found && endpoint_in_found) {
            return Err(Error::ClaimInterface("USB Endpoints not found".into()));
        }

        // cdc_acm usually owns the data interface
        let reattach_kernel_driver = matches!(
            device_handle.kernel_driver_active(DATA_INTERFACE),
            Ok(true)
        );
        if reattach_kernel_driver {
            device_handle
                .detach_kernel_driver(DATA_INTERFACE)
                .map_err(claim_err)?;
        }
        device_handle
            .claim_interface(DATA_INTERFACE)
            .map_err(claim_err)?;

        Ok(UsbTransport {
            device_handle,
            reattach_kernel_driver,
            _claim: claim,
        })
    }

    pub fn open_any() -> Result<UsbTransport, Error> {
        match Self::scan_devices().map_err(|e| Error::UsbInit(e.to_string()))? {
            0 => return Err(Error::DeviceNotFound),
            1 => {}
            n => log::warn!("{} dumpers attached, using the first one", n),
        }
        Self::open_nth(0)
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        let _ = self.device_handle.release_interface(DATA_INTERFACE);
        if self.reattach_kernel_driver {
            let _ = self.device_handle.attach_kernel_driver(DATA_INTERFACE);
        }
    }
}

impl Transport for UsbTransport {
    fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        let mut sent = 0;
        while sent < raw.len() {
            sent += self.device_handle.write_bulk(
                ENDPOINT_OUT,
                &raw[sent..],
                Duration::from_millis(WRITE_TIMEOUT_MS),
            )?;
        }
        Ok(())
    }

    fn recv_raw(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        match self.device_handle.read_bulk(ENDPOINT_IN, buf, timeout) {
            Ok(n) => Ok(n),
            Err(rusb::Error::Timeout) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}
