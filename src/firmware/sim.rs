//! In-memory cartridge: a flash chip with a JEDEC command decoder plus the
//! SRAM overlay, driven through the [`Bus`] trait.

use super::bus::Bus;
use super::flash::{UNLOCK_ADDR1, UNLOCK_ADDR2, opcodes};
use crate::constants::SRAM_SIZE;
use crate::device::FlashId;
use crate::geometry::{ADDRESS_MASK, SMALL_SECTOR_LIMIT, SRAM_SELECT, sector_words};

/// Configuration for the simulated cartridge
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// ROM capacity in bytes; addresses beyond it mirror.
    pub rom_size: usize,
    pub id: FlashId,
    /// Status reads a sector erase stays busy for.
    pub sector_busy_reads: u32,
    /// Status reads a chip erase stays busy for.
    pub chip_busy_reads: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            rom_size: 4 * 1024 * 1024,
            id: FlashId::new(0xc2, 0xcb), // MX29LV640EB
            sector_busy_reads: 4,
            chip_busy_reads: 12,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmdState {
    Read,
    Unlock1,
    Unlock2,
    Autoselect,
    Program,
    EraseSetup,
    EraseUnlock1,
    EraseUnlock2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy)]
struct Busy {
    remaining: u32,
    failed: bool,
    toggle: bool,
}

/// Simulated cartridge
pub struct SimulatedCart {
    config: SimConfig,
    rom: Vec<u16>,
    sram: Vec<u8>,
    state: CmdState,
    /// State to fall back to after an aborted sequence.
    idle: CmdState,
    busy: Option<Busy>,
    direction: Direction,
    sram_selected: bool,
    failing_erases: u32,
    programs: u64,
    violations: u64,
    elapsed_ms: u64,
}

impl SimulatedCart {
    pub fn new(config: SimConfig) -> Self {
        let rom = vec![0xffff; (config.rom_size / 2).max(1)];
        Self {
            config,
            rom,
            sram: vec![0; SRAM_SIZE],
            state: CmdState::Read,
            idle: CmdState::Read,
            busy: None,
            direction: Direction::Write,
            sram_selected: false,
            failing_erases: 0,
            programs: 0,
            violations: 0,
            elapsed_ms: 0,
        }
    }

    /// Preloads the ROM from a big-endian byte image.
    pub fn load_rom(&mut self, image: &[u8]) {
        for (i, pair) in image.chunks(2).enumerate() {
            let hi = pair[0] as u16;
            let lo = pair.get(1).copied().unwrap_or(0xff) as u16;
            let idx = i % self.rom.len();
            self.rom[idx] = (hi << 8) | lo;
        }
    }

    /// The first `len` ROM bytes in big-endian order.
    pub fn rom_image(&self, len: usize) -> Vec<u8> {
        self.rom
            .iter()
            .flat_map(|w| w.to_be_bytes())
            .take(len)
            .collect()
    }

    pub fn rom_word(&self, address: u32) -> u16 {
        self.rom[self.rom_index(address)]
    }

    pub fn sram(&self) -> &[u8] {
        &self.sram
    }

    pub fn sram_mut(&mut self) -> &mut [u8] {
        &mut self.sram
    }

    /// Makes the next `n` erase commands raise DQ5 instead of erasing.
    pub fn fail_next_erases(&mut self, n: u32) {
        self.failing_erases = n;
    }

    /// Number of program operations the chip accepted.
    pub fn program_count(&self) -> u64 {
        self.programs
    }

    /// Bus accesses made with the data lines in the wrong direction.
    pub fn mode_violations(&self) -> u64 {
        self.violations
    }

    /// Device time spent in `delay_ms`.
    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms
    }

    fn rom_index(&self, address: u32) -> usize {
        (address & ADDRESS_MASK) as usize % self.rom.len()
    }

    fn is_sram(&self, address: u32) -> bool {
        self.sram_selected && address & SRAM_SELECT != 0
    }

    fn check(&mut self, expected: Direction) {
        if self.direction != expected {
            self.violations += 1;
            log::warn!("bus accessed in {:?} mode", self.direction);
        }
    }

    fn read_cycle(&mut self, address: u32) -> u16 {
        self.check(Direction::Read);
        if self.is_sram(address) {
            return 0xff00 | self.sram[address as usize % SRAM_SIZE] as u16;
        }
        if let Some(busy) = self.busy.as_mut() {
            busy.toggle = !busy.toggle;
            let mut status = if busy.toggle { 0x40u16 } else { 0 };
            if busy.failed {
                status |= 0x20;
            } else {
                busy.remaining = busy.remaining.saturating_sub(1);
                // DQ6 back at its idle level, so the next pair reads array data
                if busy.remaining == 0 && !busy.toggle {
                    self.busy = None;
                }
            }
            return status;
        }
        if self.state == CmdState::Autoselect {
            return match address & 0xff {
                0x00 => self.config.id.manufacturer as u16,
                0x01 => 0x2200 | self.config.id.device as u16,
                _ => 0x0000,
            };
        }
        self.rom[self.rom_index(address)]
    }

    fn write_cycle(&mut self, address: u32, value: u16) {
        self.check(Direction::Write);
        if self.is_sram(address) {
            self.sram[address as usize % SRAM_SIZE] = value as u8;
            return;
        }
        match self.busy {
            Some(Busy { failed: true, .. }) => self.busy = None,
            Some(_) => return,
            None => {}
        }

        let low = value as u8;
        if self.state == CmdState::Program {
            let idx = self.rom_index(address);
            self.rom[idx] &= value;
            self.programs += 1;
            self.state = CmdState::Read;
            return;
        }
        if low == opcodes::RESET {
            self.state = CmdState::Read;
            self.idle = CmdState::Read;
            return;
        }

        self.state = match (self.state, address, low) {
            (CmdState::Read | CmdState::Autoselect, UNLOCK_ADDR1, opcodes::UNLOCK1) => {
                CmdState::Unlock1
            }
            (CmdState::Unlock1, UNLOCK_ADDR2, opcodes::UNLOCK2) => CmdState::Unlock2,
            (CmdState::Unlock2, UNLOCK_ADDR1, opcodes::AUTOSELECT) => {
                self.idle = CmdState::Autoselect;
                CmdState::Autoselect
            }
            (CmdState::Unlock2, UNLOCK_ADDR1, opcodes::PROGRAM) => CmdState::Program,
            (CmdState::Unlock2, UNLOCK_ADDR1, opcodes::ERASE_SETUP) => CmdState::EraseSetup,
            (CmdState::EraseSetup, UNLOCK_ADDR1, opcodes::UNLOCK1) => CmdState::EraseUnlock1,
            (CmdState::EraseUnlock1, UNLOCK_ADDR2, opcodes::UNLOCK2) => CmdState::EraseUnlock2,
            (CmdState::EraseUnlock2, UNLOCK_ADDR1, opcodes::CHIP_ERASE) => {
                self.start_erase(0, self.rom.len(), self.config.chip_busy_reads);
                CmdState::Read
            }
            (CmdState::EraseUnlock2, _, opcodes::SECTOR_ERASE) => {
                let address = address & ADDRESS_MASK;
                let start = if address < SMALL_SECTOR_LIMIT {
                    address & !0xfff
                } else {
                    address & !0x7fff
                };
                let start_idx = self.rom_index(start);
                let words = sector_words(start) as usize;
                self.start_erase(start_idx, words, self.config.sector_busy_reads);
                CmdState::Read
            }
            _ => self.idle,
        };
    }

    fn start_erase(&mut self, start: usize, words: usize, busy_reads: u32) {
        self.idle = CmdState::Read;
        if self.failing_erases > 0 {
            self.failing_erases -= 1;
            self.busy = Some(Busy {
                remaining: busy_reads,
                failed: true,
                toggle: false,
            });
            return;
        }
        let end = (start + words).min(self.rom.len());
        self.rom[start..end].fill(0xffff);
        if busy_reads > 0 {
            self.busy = Some(Busy {
                remaining: busy_reads,
                failed: false,
                toggle: false,
            });
        }
    }
}

impl Bus for SimulatedCart {
    fn set_read_mode(&mut self) {
        self.direction = Direction::Read;
    }

    fn set_write_mode(&mut self) {
        self.direction = Direction::Write;
    }

    fn get_byte(&mut self, address: u32) -> u8 {
        self.read_cycle(address) as u8
    }

    fn set_byte(&mut self, address: u32, value: u8) {
        // upper data lines float high
        self.write_cycle(address, 0xff00 | value as u16)
    }

    fn get_word(&mut self, address: u32) -> u16 {
        self.read_cycle(address)
    }

    fn set_word(&mut self, address: u32, value: u16) {
        self.write_cycle(address, value)
    }

    fn select_sram(&mut self, enable: bool) {
        self.sram_selected = enable;
    }

    fn delay_ms(&mut self, ms: u32) {
        self.elapsed_ms += ms as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stray_writes_do_not_program() {
        let mut cart = SimulatedCart::new(SimConfig::default());
        cart.set_write_mode();
        cart.set_word(0x100, 0x0000);
        assert_eq!(cart.rom_word(0x100), 0xffff);
        assert_eq!(cart.program_count(), 0);
    }

    #[test]
    fn sram_overlay_needs_select_and_a20() {
        let mut cart = SimulatedCart::new(SimConfig::default());
        cart.set_write_mode();
        cart.set_byte(SRAM_SELECT | 5, 0x42);
        // not selected: that was a stray ROM write
        assert_eq!(cart.sram()[5], 0);

        cart.select_sram(true);
        cart.set_byte(SRAM_SELECT | 5, 0x42);
        cart.set_read_mode();
        assert_eq!(cart.get_byte(SRAM_SELECT | 5), 0x42);
        assert_eq!(cart.sram()[5], 0x42);
        assert_eq!(cart.mode_violations(), 0);
    }

    #[test]
    fn wrong_direction_is_counted() {
        let mut cart = SimulatedCart::new(SimConfig::default());
        cart.set_write_mode();
        cart.get_word(0);
        assert_eq!(cart.mode_violations(), 1);
    }

    #[test]
    fn load_and_image_are_big_endian() {
        let mut cart = SimulatedCart::new(SimConfig {
            rom_size: 1024,
            ..SimConfig::default()
        });
        cart.load_rom(&[0x12, 0x34, 0x56]);
        assert_eq!(cart.rom_word(0), 0x1234);
        assert_eq!(cart.rom_word(1), 0x56ff);
        assert_eq!(cart.rom_image(4), vec![0x12, 0x34, 0x56, 0xff]);
        // mirrored beyond capacity
        assert_eq!(cart.rom_word(512), 0x1234);
    }
}
