//! JEDEC style parallel NOR programming: unlock, autoselect, word/byte
//! program, sector and chip erase with status polling.

use bitfield::bitfield;
use thiserror::Error;

use super::bus::Bus;
use crate::device::FlashId;

pub const UNLOCK_ADDR1: u32 = 0x555;
pub const UNLOCK_ADDR2: u32 = 0x2aa;

pub mod opcodes {
    pub const UNLOCK1: u8 = 0xaa;
    pub const UNLOCK2: u8 = 0x55;
    pub const AUTOSELECT: u8 = 0x90;
    pub const PROGRAM: u8 = 0xa0;
    pub const ERASE_SETUP: u8 = 0x80;
    pub const CHIP_ERASE: u8 = 0x10;
    pub const SECTOR_ERASE: u8 = 0x30;
    pub const RESET: u8 = 0xf0;
}

/// Addresses sampled to decide a chip erase has finished.
pub const ERASE_PROBES: [u32; 8] = [0, 1, 2, 3, 4, 5, 6, 7];

bitfield! {
    /// Status byte returned by reads while an embedded algorithm runs.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct FlashStatus(u8);
    impl Debug;
    /// DQ5, the internal timer ran out
    pub exceeded_timing, _: 5;
    /// DQ6, flips on every read while busy
    pub toggle, _: 6;
    /// DQ7, complement of the final data while busy
    pub data_polling, _: 7;
}

/// Outcome of two back to back status reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseStatus {
    Busy,
    Done,
    /// The chip flagged an erase error; the command must be reissued.
    Failed,
}

impl EraseStatus {
    /// Done once DQ6 stopped toggling and DQ7 is set. Otherwise DQ5 on the
    /// second read means the erase must be reissued.
    pub fn from_reads(first: FlashStatus, second: FlashStatus) -> Self {
        let settled = first.toggle() == second.toggle();
        if settled && second.data_polling() {
            EraseStatus::Done
        } else if second.exceeded_timing() {
            EraseStatus::Failed
        } else {
            EraseStatus::Busy
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FlashError {
    #[error("sector erase at 0x{address:06x} still busy after {polls} polls")]
    SectorEraseTimeout { address: u32, polls: u32 },
    #[error("chip erase still busy after {cycles} poll cycles")]
    ChipEraseTimeout { cycles: u32 },
}

/// What a sector erase took.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EraseReport {
    pub polls: u32,
    /// Number of times the command had to be reissued after DQ5.
    pub reissues: u32,
}

/// Write the two-cycle unlock prefix. The bus must be in write mode.
pub fn unlock<B: Bus>(bus: &mut B) {
    bus.set_byte(UNLOCK_ADDR1, opcodes::UNLOCK1);
    bus.set_byte(UNLOCK_ADDR2, opcodes::UNLOCK2);
}

fn command<B: Bus>(bus: &mut B, opcode: u8) {
    unlock(bus);
    bus.set_byte(UNLOCK_ADDR1, opcode);
}

/// Reads the manufacturer and device ID, leaving the chip in read array mode.
pub fn read_chip_id<B: Bus>(bus: &mut B) -> FlashId {
    bus.set_write_mode();
    command(bus, opcodes::AUTOSELECT);

    bus.set_read_mode();
    let manufacturer = bus.get_byte(0x0);
    let device = bus.get_byte(0x1);

    bus.set_write_mode();
    command(bus, opcodes::RESET);
    let id = FlashId::new(manufacturer, device);
    log::debug!("flash id {}", id);
    id
}

/// Programs one byte. Returns `false` when the value is the erased state and
/// nothing had to be written.
pub fn program_byte<B: Bus>(bus: &mut B, address: u32, value: u8) -> bool {
    if value == 0xff {
        return false;
    }
    command(bus, opcodes::PROGRAM);
    bus.set_byte(address, value);
    true
}

/// Programs one 16-bit word, skipping fully erased words.
pub fn program_word<B: Bus>(bus: &mut B, address: u32, value: u16) -> bool {
    if value == 0xffff {
        return false;
    }
    command(bus, opcodes::PROGRAM);
    bus.set_word(address, value);
    true
}

fn start_sector_erase<B: Bus>(bus: &mut B, address: u32) {
    bus.set_write_mode();
    command(bus, opcodes::ERASE_SETUP);
    unlock(bus);
    bus.set_byte(address, opcodes::SECTOR_ERASE);
}

/// Erases the sector holding `address` and waits for completion.
///
/// `max_polls` bounds the status loop; `None` polls forever. When the chip
/// raises DQ5 the whole unlock and erase sequence is sent again.
pub fn erase_sector<B: Bus>(
    bus: &mut B,
    address: u32,
    max_polls: Option<u32>,
) -> Result<EraseReport, FlashError> {
    let mut report = EraseReport::default();
    start_sector_erase(bus, address);

    loop {
        if max_polls.is_some_and(|max| report.polls >= max) {
            return Err(FlashError::SectorEraseTimeout {
                address,
                polls: report.polls,
            });
        }
        bus.set_read_mode();
        let first = FlashStatus(bus.get_byte(address));
        let second = FlashStatus(bus.get_byte(address));
        report.polls += 1;

        match EraseStatus::from_reads(first, second) {
            EraseStatus::Done => return Ok(report),
            EraseStatus::Failed => {
                log::warn!("erase error at 0x{:06x}, reissuing", address);
                report.reissues += 1;
                start_sector_erase(bus, address);
            }
            EraseStatus::Busy => {}
        }
    }
}

/// Erases the whole chip, polling the probe addresses once a second until
/// they all read back erased. `on_tick` receives the elapsed seconds after
/// every poll cycle. Returns the number of cycles it took.
pub fn erase_chip<B: Bus, F: FnMut(u32)>(
    bus: &mut B,
    max_cycles: Option<u32>,
    mut on_tick: F,
) -> Result<u32, FlashError> {
    bus.set_write_mode();
    bus.delay_ms(10);
    command(bus, opcodes::ERASE_SETUP);
    unlock(bus);
    bus.set_byte(UNLOCK_ADDR1, opcodes::CHIP_ERASE);
    bus.delay_ms(10);
    bus.set_read_mode();

    let mut cycles = 0;
    loop {
        if max_cycles.is_some_and(|max| cycles >= max) {
            bus.set_write_mode();
            return Err(FlashError::ChipEraseTimeout { cycles });
        }
        let erased = ERASE_PROBES
            .iter()
            .map(|&probe| bus.get_byte(probe))
            .fold(true, |all, b| all && b == 0xff);
        bus.delay_ms(1000);
        on_tick(cycles);
        cycles += 1;
        if erased {
            bus.set_write_mode();
            return Ok(cycles);
        }
    }
}
