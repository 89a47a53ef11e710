//! The command frame format spoken between host and dumper.
//!
//! Host to device traffic is either a 64-byte command frame
//! (`opcode`, `AA 55 AA BB`, params, zero fill) or a raw 1024-byte data chunk.
//! Device to host traffic is `\r\n` terminated ASCII or raw 1024-byte chunks.

use anyhow::Result;
use scroll::{BE, Pread, Pwrite};

use crate::constants::{CMD_PACKET_SIZE, MAGIC, commands};
use crate::geometry::{ADDRESS_MASK, SizeCode};

pub type Packet = [u8; CMD_PACKET_SIZE];

/// Which SRAM window a dump covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SramSize {
    K8,
    K32,
}

impl SramSize {
    pub const fn bytes(self) -> usize {
        match self {
            SramSize::K8 => 8 * 1024,
            SramSize::K32 => 32 * 1024,
        }
    }
}

/// Target of an erase-by-size request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EraseSpan {
    /// Every sector from address 0 up to the capacity; 8M erases the chip.
    Size(SizeCode),
    /// A single sector at an explicit word address.
    Sector(u32),
}

/// Dumper command
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    /// Ping, answered with a "connected" line.
    Connect,
    /// Query the flash manufacturer/device ID.
    CheckId,
    /// Reset the device receive buffer.
    ClearBuffer,
    /// Stream a ROM dump of the given capacity as 1024-byte chunks.
    ReadRom { size: SizeCode },
    /// Program the previously sent data chunk at `page`/`bank`.
    WriteRom { page: u8, bank: u8 },
    /// Stream the SRAM as 1024-byte chunks.
    ReadSram { size: SramSize },
    /// Store the previously sent data chunk into SRAM at `page`/`bank`.
    WriteSram { page: u8, bank: u8 },
    /// Erase the whole flash chip, then zero the SRAM.
    EraseFull,
    EraseBySize(EraseSpan),
    /// Erase exactly one sector.
    EraseSector { address: u32 },
}

impl Command {
    pub fn read_rom(size: SizeCode) -> Self {
        Command::ReadRom { size }
    }

    pub fn write_rom(page: u8, bank: u8) -> Self {
        Command::WriteRom { page, bank }
    }

    pub fn write_sram(page: u8, bank: u8) -> Self {
        Command::WriteSram { page, bank }
    }

    pub fn erase_sector(address: u32) -> Self {
        Command::EraseSector { address }
    }

    pub fn opcode(&self) -> u8 {
        match self {
            Command::Connect => commands::CONNECT,
            Command::CheckId => commands::CHECK_ID,
            Command::ClearBuffer => commands::CLEAR_BUFFER,
            Command::ReadRom { .. } => commands::READ_ROM,
            Command::WriteRom { .. } => commands::WRITE_ROM,
            Command::ReadSram { .. } => commands::READ_SRAM,
            Command::WriteSram { .. } => commands::WRITE_SRAM,
            Command::EraseFull => commands::ERASE_FULL,
            Command::EraseBySize(_) => commands::ERASE_BY_SIZE,
            Command::EraseSector { .. } => commands::ERASE_SECTOR,
        }
    }

    pub fn into_raw(self) -> Result<Packet> {
        let mut buf = [0u8; CMD_PACKET_SIZE];
        buf[0] = self.opcode();
        buf[1..5].copy_from_slice(&MAGIC);

        match self {
            Command::Connect | Command::CheckId | Command::ClearBuffer | Command::EraseFull => {}
            Command::ReadRom { size } => buf[5] = size.code(),
            Command::WriteRom { page, bank } | Command::WriteSram { page, bank } => {
                buf[5] = page;
                buf[6] = bank;
            }
            Command::ReadSram { size } => {
                buf[5] = match size {
                    SramSize::K32 => 0x01,
                    SramSize::K8 => 0x00,
                }
            }
            Command::EraseBySize(EraseSpan::Size(size)) => buf[5] = size.code(),
            Command::EraseBySize(EraseSpan::Sector(address)) => {
                // code 0 selects the explicit address form
                put_address(&mut buf, 6, address)?;
            }
            Command::EraseSector { address } => put_address(&mut buf, 5, address)?,
        }
        Ok(buf)
    }

    /// Decodes a frame on the device side.
    ///
    /// Returns `None` for a mismatched magic or an unknown opcode; such a
    /// frame must never be acted upon.
    pub fn from_raw(raw: &[u8]) -> Option<Command> {
        if raw.len() < CMD_PACKET_SIZE || raw[1..5] != MAGIC {
            return None;
        }
        let cmd = match raw[0] {
            commands::CONNECT => Command::Connect,
            commands::CHECK_ID => Command::CheckId,
            commands::CLEAR_BUFFER => Command::ClearBuffer,
            commands::ERASE_FULL => Command::EraseFull,
            // unknown capacities fall back to the smallest cartridge
            commands::READ_ROM => Command::ReadRom {
                size: SizeCode::from_code(raw[5]).unwrap_or(SizeCode::K512),
            },
            commands::WRITE_ROM => Command::WriteRom {
                page: raw[5],
                bank: raw[6],
            },
            commands::READ_SRAM => Command::ReadSram {
                size: if raw[5] == 0x01 {
                    SramSize::K32
                } else {
                    SramSize::K8
                },
            },
            commands::WRITE_SRAM => Command::WriteSram {
                page: raw[5],
                bank: raw[6],
            },
            commands::ERASE_BY_SIZE => Command::EraseBySize(match raw[5] {
                0x00 => EraseSpan::Sector(get_address(raw, 6)?),
                code => EraseSpan::Size(SizeCode::from_code(code).unwrap_or(SizeCode::K512)),
            }),
            commands::ERASE_SECTOR => Command::EraseSector {
                address: get_address(raw, 5)?,
            },
            _ => return None,
        };
        Some(cmd)
    }
}

/// Writes a 24-bit big-endian address.
fn put_address(buf: &mut [u8], offset: usize, address: u32) -> Result<()> {
    anyhow::ensure!(
        address <= ADDRESS_MASK,
        "address 0x{:x} does not fit the 24-bit bus",
        address
    );
    let mut be = [0u8; 4];
    be.pwrite_with(address, 0, BE)?;
    buf[offset..offset + 3].copy_from_slice(&be[1..]);
    Ok(())
}

fn get_address(raw: &[u8], offset: usize) -> Option<u32> {
    let be = [0, raw[offset], raw[offset + 1], raw[offset + 2]];
    be.pread_with::<u32>(0, BE).ok()
}

/// Whether a 64-byte frame carries the command magic.
pub fn has_magic(frame: &[u8]) -> bool {
    frame.len() >= 5 && frame[1..5] == MAGIC
}
