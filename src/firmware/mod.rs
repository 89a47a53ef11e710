//! The dumper's side of the protocol: bus access, the flash algorithm and
//! the command dispatcher, plus an in-memory cartridge to run them against.

pub mod bus;
pub mod dispatcher;
pub mod flash;
pub mod sim;

pub use self::bus::Bus;
pub use self::dispatcher::{Dispatcher, EraseLimits, ResponseSink};
pub use self::sim::{SimConfig, SimulatedCart};
