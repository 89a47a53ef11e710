//! Abstract Device transport interface.
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;

use crate::error::Error;
use crate::protocol::Command;

pub use self::serial::SerialTransport;
pub use self::sim::SimTransport;
pub use self::usb::UsbTransport;

mod serial;
mod sim;
mod usb;

/// Abstraction of the transport layer.
/// A raw libusb bulk pipe, a CDC-ACM serial port, or the in-process simulator.
///
/// The link is a plain byte stream: there is no framing beyond the fixed
/// command and chunk sizes, so a read may return part of a line or a chunk.
pub trait Transport {
    fn send_raw(&mut self, raw: &[u8]) -> Result<()>;

    /// Reads whatever is available into `buf`, waiting at most `timeout`.
    /// Returns `Ok(0)` when nothing arrived in time.
    fn recv_raw(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    fn send_command(&mut self, cmd: Command) -> Result<()> {
        let req = cmd.into_raw()?;
        log::debug!("=> {}", hex::encode(&req[..8]));
        self.send_raw(&req)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        (**self).send_raw(raw)
    }

    fn recv_raw(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        (**self).recv_raw(buf, timeout)
    }
}

static SESSION_OPEN: AtomicBool = AtomicBool::new(false);

/// Process-wide claim on the dumper; only one hardware session may exist.
#[derive(Debug)]
pub struct SessionClaim(());

impl SessionClaim {
    pub fn acquire() -> Result<Self, Error> {
        if SESSION_OPEN.swap(true, Ordering::AcqRel) {
            return Err(Error::ClaimInterface(
                "a dumper session is already open in this process".into(),
            ));
        }
        Ok(SessionClaim(()))
    }
}

impl Drop for SessionClaim {
    fn drop(&mut self) {
        SESSION_OPEN.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_is_refused_until_release() {
        let first = SessionClaim::acquire().unwrap();
        let err = SessionClaim::acquire().unwrap_err();
        assert_eq!(err.code(), -3);
        drop(first);
        let again = SessionClaim::acquire();
        assert!(again.is_ok());
    }
}
