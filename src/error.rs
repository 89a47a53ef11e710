//! Error taxonomy of the transfer engine.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// libusb could not be brought up
    #[error("Failed to initialize USB: {0}")]
    UsbInit(String),
    #[error("Device not found")]
    DeviceNotFound,
    /// The interface is held by someone else, or a session is already open
    #[error("Could not claim USB interface: {0}")]
    ClaimInterface(String),
    #[error("Operation timed out: {0}")]
    Timeout(String),
    /// Transport level read or write failure
    #[error("I/O error: {0}")]
    Io(String),
    /// Local file system failure
    #[error("File error: {0}")]
    File(#[source] std::io::Error),
    #[error("Operation interrupted")]
    Interrupted,
    #[error("Invalid parameter: {0}")]
    InvalidParam(String),
}

impl Error {
    /// Stable numeric result code, `0` being success.
    pub fn code(&self) -> i32 {
        match self {
            Error::UsbInit(_) => -1,
            Error::DeviceNotFound => -2,
            Error::ClaimInterface(_) => -3,
            Error::Timeout(_) => -4,
            Error::Io(_) => -5,
            Error::File(_) => -6,
            Error::Interrupted => -7,
            Error::InvalidParam(_) => -8,
        }
    }

    /// Wraps a raw transport failure.
    pub(crate) fn io(err: anyhow::Error) -> Self {
        Error::Io(format!("{:#}", err))
    }
}
