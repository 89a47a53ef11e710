//! Size codes and cartridge address resolution.
//!
//! The ROM side of the bus is 16 bits wide and word addressed: one 1024-byte
//! chunk covers 512 words. The SRAM overlay is byte wide and sits behind A20.

use std::fmt;

use crate::constants::DATA_CHUNK_SIZE;

/// Words per ROM page, one transfer chunk.
pub const ROM_PAGE_WORDS: u32 = (DATA_CHUNK_SIZE / 2) as u32;
/// Pages per bank before the bank index advances.
pub const PAGES_PER_BANK: u8 = 64;
/// Address line that routes accesses into the SRAM overlay.
pub const SRAM_SELECT: u32 = 1 << 20;
/// The bus only drives 24 address lines.
pub const ADDRESS_MASK: u32 = 0x00ff_ffff;

/// Below this word address sectors are small (boot block).
pub const SMALL_SECTOR_LIMIT: u32 = 0x8000;
pub const SMALL_SECTOR_WORDS: u32 = 0x1000;
pub const LARGE_SECTOR_WORDS: u32 = 0x8000;

/// Cartridge capacity token carried in ROM dump and erase commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum SizeCode {
    K512 = 0x01,
    M1 = 0x02,
    M2 = 0x03,
    M4 = 0x04,
    M8 = 0x05,
}

impl SizeCode {
    pub const ALL: [SizeCode; 5] = [
        SizeCode::K512,
        SizeCode::M1,
        SizeCode::M2,
        SizeCode::M4,
        SizeCode::M8,
    ];

    /// Rounds a KB request up to the next capacity, saturating at 8M.
    /// `0` is the "auto" sentinel and has no size code.
    pub const fn from_kb(kb: u32) -> Option<SizeCode> {
        match kb {
            0 => None,
            1..=512 => Some(SizeCode::K512),
            513..=1024 => Some(SizeCode::M1),
            1025..=2048 => Some(SizeCode::M2),
            2049..=4096 => Some(SizeCode::M4),
            _ => Some(SizeCode::M8),
        }
    }

    pub const fn from_code(code: u8) -> Option<SizeCode> {
        match code {
            0x01 => Some(SizeCode::K512),
            0x02 => Some(SizeCode::M1),
            0x03 => Some(SizeCode::M2),
            0x04 => Some(SizeCode::M4),
            0x05 => Some(SizeCode::M8),
            _ => None,
        }
    }

    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn bytes(self) -> u32 {
        match self {
            SizeCode::K512 => 512 * 1024,
            SizeCode::M1 => 1024 * 1024,
            SizeCode::M2 => 2048 * 1024,
            SizeCode::M4 => 4096 * 1024,
            SizeCode::M8 => 8192 * 1024,
        }
    }

    /// Number of 1024-byte chunks a dump of this size streams.
    pub const fn chunks(self) -> u32 {
        self.bytes() / DATA_CHUNK_SIZE as u32
    }

    /// The same capacity expressed in bus words, the unit erase spans use.
    pub const fn words(self) -> u32 {
        self.bytes() / 2
    }
}

impl fmt::Display for SizeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SizeCode::K512 => "512K",
            SizeCode::M1 => "1M",
            SizeCode::M2 => "2M",
            SizeCode::M4 => "4M",
            SizeCode::M8 => "8M",
        };
        f.write_str(label)
    }
}

/// Page/bank pair carried by write commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageCursor {
    pub page: u8,
    pub bank: u8,
}

impl PageCursor {
    /// Moves to the next chunk; the bank increments once per 64 pages.
    pub fn advance(&mut self) {
        self.page += 1;
        if self.page >= PAGES_PER_BANK {
            self.page = 0;
            self.bank = self.bank.wrapping_add(1);
        }
    }

    /// Linear chunk index this cursor designates.
    pub fn chunk(&self) -> u32 {
        self.bank as u32 * PAGES_PER_BANK as u32 + self.page as u32
    }

    pub fn rom_address(&self) -> u32 {
        rom_address(self.bank, self.page)
    }
}

/// Word address of the first word of a ROM page.
pub const fn rom_address(bank: u8, page: u8) -> u32 {
    bank as u32 * PAGES_PER_BANK as u32 * ROM_PAGE_WORDS + page as u32 * ROM_PAGE_WORDS
}

/// Bus address of one SRAM byte, with the overlay line driven.
pub const fn sram_address(chunk: u32, offset: u32) -> u32 {
    ((chunk * DATA_CHUNK_SIZE as u32 + offset) | SRAM_SELECT) & ADDRESS_MASK
}

/// Sector size in words of the sector containing `address`.
pub const fn sector_words(address: u32) -> u32 {
    if address < SMALL_SECTOR_LIMIT {
        SMALL_SECTOR_WORDS
    } else {
        LARGE_SECTOR_WORDS
    }
}

/// Address of the sector following the one starting at `address`.
pub const fn next_sector_address(address: u32) -> u32 {
    address + sector_words(address)
}

/// Start addresses of every sector covering `span` words from `start`.
pub fn sector_starts(start: u32, span: u32) -> impl Iterator<Item = u32> {
    let mut covered = 0u32;
    let mut address = start;
    std::iter::from_fn(move || {
        if covered >= span {
            return None;
        }
        let current = address;
        let step = sector_words(current);
        covered += step;
        address += step;
        Some(current)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kb_rounds_up_never_down() {
        for kb in 1..=512 {
            assert_eq!(SizeCode::from_kb(kb), Some(SizeCode::K512));
        }
        for kb in 513..=1024 {
            assert_eq!(SizeCode::from_kb(kb), Some(SizeCode::M1));
        }
        assert_eq!(SizeCode::from_kb(2048), Some(SizeCode::M2));
        assert_eq!(SizeCode::from_kb(2049), Some(SizeCode::M4));
        assert_eq!(SizeCode::from_kb(4097), Some(SizeCode::M8));
        assert_eq!(SizeCode::from_kb(100_000), Some(SizeCode::M8));
    }

    #[test]
    fn zero_kb_is_auto() {
        assert_eq!(SizeCode::from_kb(0), None);
    }

    #[test]
    fn never_under_allocates() {
        for kb in 1..=8192u32 {
            let code = SizeCode::from_kb(kb).unwrap();
            assert!(code.bytes() >= kb * 1024, "{} KB -> {}", kb, code);
        }
    }

    #[test]
    fn code_bytes_round_trip() {
        for code in SizeCode::ALL {
            assert_eq!(SizeCode::from_code(code.code()), Some(code));
        }
        assert_eq!(SizeCode::from_code(0), None);
        assert_eq!(SizeCode::M8.bytes(), 8192 * 1024);
        assert_eq!(SizeCode::K512.chunks(), 512);
    }

    #[test]
    fn page_wraps_and_bank_increments_once_per_64() {
        let mut cursor = PageCursor::default();
        for _ in 0..63 {
            cursor.advance();
        }
        assert_eq!(cursor, PageCursor { page: 63, bank: 0 });
        cursor.advance();
        assert_eq!(cursor, PageCursor { page: 0, bank: 1 });
        for _ in 0..64 {
            cursor.advance();
        }
        assert_eq!(cursor, PageCursor { page: 0, bank: 2 });
        assert_eq!(cursor.chunk(), 128);
    }

    #[test]
    fn rom_address_of_bank_and_page() {
        assert_eq!(rom_address(2, 5), 2 * 64 * 512 + 5 * 512);
        assert_eq!(rom_address(0, 0), 0);
        let cursor = PageCursor { page: 5, bank: 2 };
        assert_eq!(cursor.rom_address(), cursor.chunk() * ROM_PAGE_WORDS);
    }

    #[test]
    fn sram_address_drives_a20() {
        assert_eq!(sram_address(0, 0), 0x10_0000);
        assert_eq!(sram_address(1, 3), 0x10_0403);
        assert_eq!(sram_address(31, 1023) & !SRAM_SELECT, 32 * 1024 - 1);
    }

    #[test]
    fn sector_steps_grow_past_boot_block() {
        assert_eq!(next_sector_address(0x7000), 0x8000);
        assert_eq!(next_sector_address(0x8000), 0x10000);
        assert_eq!(next_sector_address(0), 0x1000);
    }

    #[test]
    fn sector_starts_cover_span() {
        let starts: Vec<u32> = sector_starts(0, SizeCode::K512.words()).collect();
        // 8 boot sectors then 7 large ones
        assert_eq!(starts.len(), 8 + 7);
        assert_eq!(starts[7], 0x7000);
        assert_eq!(starts[8], 0x8000);
        assert_eq!(*starts.last().unwrap(), 0x38000);
        assert_eq!(sector_starts(0x10000, 1).count(), 1);
    }
}
