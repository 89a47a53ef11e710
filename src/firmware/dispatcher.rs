//! Device side command loop: splits the host byte stream into frames,
//! executes commands against the bus and answers with text or data chunks.

use std::collections::VecDeque;

use super::bus::Bus;
use super::flash::{self, FlashError};
use crate::constants::{CMD_PACKET_SIZE, DATA_CHUNK_SIZE, SRAM_SIZE, markers};
use crate::geometry::{ROM_PAGE_WORDS, SizeCode, rom_address, sector_starts, sram_address};
use crate::protocol::{Command, EraseSpan, SramSize, has_magic};

/// Where the device writes its replies. Every call is one USB transfer.
pub trait ResponseSink {
    fn transmit(&mut self, data: &[u8]);

    fn line(&mut self, text: &str) {
        let mut buf = Vec::with_capacity(text.len() + 2);
        buf.extend_from_slice(text.as_bytes());
        buf.extend_from_slice(b"\r\n");
        self.transmit(&buf);
    }
}

impl ResponseSink for VecDeque<Vec<u8>> {
    fn transmit(&mut self, data: &[u8]) {
        self.push_back(data.to_vec());
    }
}

/// Upper bounds on erase status polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EraseLimits {
    /// Status polls per sector.
    pub sector_polls: Option<u32>,
    /// One second poll cycles for a whole chip erase.
    pub chip_cycles: Option<u32>,
}

impl Default for EraseLimits {
    fn default() -> Self {
        Self {
            sector_polls: Some(1_000_000),
            chip_cycles: Some(600),
        }
    }
}

impl EraseLimits {
    /// Poll until the chip reports completion, however long it takes.
    pub const fn unbounded() -> Self {
        Self {
            sector_polls: None,
            chip_cycles: None,
        }
    }
}

const FRAMES_PER_CHUNK: usize = DATA_CHUNK_SIZE / CMD_PACKET_SIZE;

pub struct Dispatcher<B: Bus> {
    bus: B,
    limits: EraseLimits,
    /// Bytes of a frame not yet complete.
    pending: Vec<u8>,
    /// Data chunk received ahead of a write command.
    chunk: Vec<u8>,
}

impl<B: Bus> Dispatcher<B> {
    pub fn new(mut bus: B) -> Self {
        bus.set_write_mode();
        Self {
            bus,
            limits: EraseLimits::default(),
            pending: Vec::with_capacity(CMD_PACKET_SIZE),
            chunk: Vec::with_capacity(DATA_CHUNK_SIZE),
        }
    }

    pub fn with_limits(mut self, limits: EraseLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Number of data bytes waiting for a write command.
    pub fn buffered(&self) -> usize {
        self.chunk.len()
    }

    /// Consumes host bytes, running every command completed by them.
    pub fn feed<S: ResponseSink>(&mut self, mut bytes: &[u8], sink: &mut S) {
        while !bytes.is_empty() {
            let take = (CMD_PACKET_SIZE - self.pending.len()).min(bytes.len());
            self.pending.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];

            if self.pending.len() == CMD_PACKET_SIZE {
                let frame = std::mem::take(&mut self.pending);
                self.on_frame(&frame, sink);
                self.pending = frame;
                self.pending.clear();
            }
        }
    }

    fn on_frame<S: ResponseSink>(&mut self, frame: &[u8], sink: &mut S) {
        let frames = self.chunk.len() / CMD_PACKET_SIZE;
        if frames > 0 && frames < FRAMES_PER_CHUNK {
            self.chunk.extend_from_slice(frame);
            return;
        }
        if let Some(cmd) = Command::from_raw(frame) {
            self.execute(cmd, sink);
            return;
        }
        if has_magic(frame) {
            log::debug!("unknown opcode 0x{:02x}, ignored", frame[0]);
        } else if frames == FRAMES_PER_CHUNK {
            log::debug!("data frame with a full chunk buffered, dropped");
        } else {
            self.chunk.extend_from_slice(frame);
        }
    }

    /// Runs one decoded command to completion.
    pub fn execute<S: ResponseSink>(&mut self, cmd: Command, sink: &mut S) {
        log::debug!("execute {:?}", cmd);
        match cmd {
            Command::Connect => {
                self.bus.delay_ms(100);
                sink.line("FlashMaster MD Dumper is connected");
            }
            Command::CheckId => self.check_id(sink),
            Command::ClearBuffer => {
                self.chunk.clear();
                self.bus.delay_ms(100);
                sink.line("BUFF IS CLEAR");
            }
            Command::ReadRom { size } => self.read_rom(size, sink),
            Command::WriteRom { page, bank } => self.write_rom(bank, page, sink),
            Command::ReadSram { size } => self.read_sram(size, sink),
            Command::WriteSram { page, bank } => self.write_sram(bank, page, sink),
            Command::EraseFull => self.erase_full(sink),
            Command::EraseBySize(span) => self.erase_by_size(span, sink),
            Command::EraseSector { address } => {
                self.bus.set_write_mode();
                match flash::erase_sector(&mut self.bus, address, self.limits.sector_polls) {
                    Ok(_) => sink.line(&format!("\r\nSECTORADD:0x{:X} ERASE OK!", address)),
                    Err(e) => erase_failed(e, sink),
                }
            }
        }
        self.bus.set_write_mode();
    }

    fn check_id<S: ResponseSink>(&mut self, sink: &mut S) {
        sink.line("-- MD CART ID --");
        let id = flash::read_chip_id(&mut self.bus);
        self.bus.delay_ms(100);
        sink.line(&format!("FLASHID:{}", id));
        match id.chip() {
            Some(chip) => sink.line(&format!("{} MD FLASH CART", chip.name)),
            None => sink.line("NO FLASH DEVICE FOUND"),
        }
    }

    fn read_rom<S: ResponseSink>(&mut self, size: SizeCode, sink: &mut S) {
        sink.line(&format!("{} ROM DUMP START!!!", size));
        self.bus.set_read_mode();
        self.bus.delay_ms(100);

        let mut buf = [0u8; DATA_CHUNK_SIZE];
        for chunk in 0..size.chunks() {
            let base = chunk * ROM_PAGE_WORDS;
            for (i, pair) in buf.chunks_exact_mut(2).enumerate() {
                let word = self.bus.get_word(base + i as u32);
                pair.copy_from_slice(&word.to_be_bytes());
            }
            sink.transmit(&buf);
        }

        self.bus.delay_ms(150);
        sink.line("DUMPER ROM FINISH!!!");
        sink.line("PUSH SAVE GAME BUTTON!!!");
    }

    fn write_rom<S: ResponseSink>(&mut self, bank: u8, page: u8, sink: &mut S) {
        let address = rom_address(bank, page);
        self.bus.set_write_mode();
        for (i, pair) in self.chunk.chunks_exact(2).enumerate() {
            let word = u16::from_be_bytes([pair[0], pair[1]]);
            flash::program_word(&mut self.bus, address + i as u32, word);
        }
        self.chunk.clear();
        sink.line(&format!("ADD:0x{:X} WRITE OK", address));
    }

    fn read_sram<S: ResponseSink>(&mut self, size: SramSize, sink: &mut S) {
        let chunks = size.bytes() / DATA_CHUNK_SIZE;
        sink.line(&format!("{}K RAM DUMP START!!!", size.bytes() / 1024));
        self.bus.select_sram(true);
        self.bus.set_read_mode();
        self.bus.delay_ms(100);

        let mut buf = [0u8; DATA_CHUNK_SIZE];
        for chunk in 0..chunks as u32 {
            for (i, b) in buf.iter_mut().enumerate() {
                *b = self.bus.get_byte(sram_address(chunk, i as u32));
            }
            sink.transmit(&buf);
        }

        self.bus.delay_ms(150);
        self.bus.select_sram(false);
        sink.line("DUMPER RAM FINISH!!!");
    }

    fn write_sram<S: ResponseSink>(&mut self, bank: u8, page: u8, sink: &mut S) {
        let chunk = bank as u32 * 64 + page as u32;
        self.bus.select_sram(true);
        self.bus.set_write_mode();
        for (i, &b) in self.chunk.iter().enumerate() {
            self.bus.set_byte(sram_address(chunk, i as u32), b);
        }
        self.bus.select_sram(false);
        self.chunk.clear();
        let address = chunk * DATA_CHUNK_SIZE as u32;
        sink.line(&format!("ADD:0x{:X} WRITE GK", address));
    }

    /// Chip erase with the elapsed time reported once a second.
    fn erase_chip<S: ResponseSink>(&mut self, sink: &mut S) -> Result<(), FlashError> {
        sink.line("-- MD CART ERASE --");
        sink.line("FLASH ERASE START");
        flash::erase_chip(&mut self.bus, self.limits.chip_cycles, |secs| {
            sink.line(&format!("USE TIME {} s", secs));
        })?;
        sink.line("FLASH ERASE FINISH!!!");
        Ok(())
    }

    fn erase_full<S: ResponseSink>(&mut self, sink: &mut S) {
        if let Err(e) = self.erase_chip(sink) {
            return erase_failed(e, sink);
        }
        self.bus.delay_ms(100);
        sink.line("SRAM ERASE START");
        self.bus.select_sram(true);
        self.bus.set_write_mode();
        for offset in 0..SRAM_SIZE as u32 {
            self.bus.set_byte(sram_address(0, offset), 0x00);
        }
        self.bus.select_sram(false);
        sink.line("SRAM ERASE FINISH!!!");
    }

    fn erase_by_size<S: ResponseSink>(&mut self, span: EraseSpan, sink: &mut S) {
        let (start, words) = match span {
            EraseSpan::Size(SizeCode::M8) => {
                if let Err(e) = self.erase_chip(sink) {
                    return erase_failed(e, sink);
                }
                sink.line("\r\n8M ERASE OK!");
                return;
            }
            EraseSpan::Size(size) => {
                sink.line(&format!("{} ERASEING", size));
                (0, size.words())
            }
            EraseSpan::Sector(address) => {
                sink.line(&format!("SECTORADD:0x{:X} ERASEING", address));
                (address, 1)
            }
        };

        for sector in sector_starts(start, words) {
            self.bus.set_write_mode();
            if let Err(e) = flash::erase_sector(&mut self.bus, sector, self.limits.sector_polls) {
                return erase_failed(e, sink);
            }
            sink.transmit(b".");
        }

        match span {
            EraseSpan::Size(size) => sink.line(&format!("\r\n{} ERASE OK!", size)),
            EraseSpan::Sector(address) => {
                sink.line(&format!("SECTORADD:0x{:X} ERASE OK!", address))
            }
        }
    }
}

fn erase_failed<S: ResponseSink>(err: FlashError, sink: &mut S) {
    log::warn!("{}", err);
    sink.line(&format!("\r\n{}", markers::ERASE_FAILED));
}
