//! FlashMaster MD dumper protocol implementation.

pub mod constants;
pub mod device;
pub mod error;
pub mod firmware;
pub mod flashing;
pub mod geometry;
pub mod image;
pub mod ownership;
pub mod protocol;
pub mod report;
pub mod transport;

pub use self::device::{Chip, FlashId};
pub use self::error::{Error, Result};
pub use self::flashing::{Flashing, Timing};
pub use self::geometry::SizeCode;
pub use self::protocol::Command;
pub use self::report::{CancelToken, ConsoleReporter, Reporter};
pub use self::transport::Transport;
