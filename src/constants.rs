//! Protocol and hardware constants shared by host and device.

/// USB identity of the dumper (STM32 virtual COM port).
pub const VENDOR_ID: u16 = 0x0483;
pub const PRODUCT_ID: u16 = 0x5740;

/// Every command frame is exactly this long, zero padded.
pub const CMD_PACKET_SIZE: usize = 64;
/// Bytes 1..5 of every command frame.
pub const MAGIC: [u8; 4] = [0xAA, 0x55, 0xAA, 0xBB];
/// Binary payload unit in both directions, no framing.
pub const DATA_CHUNK_SIZE: usize = 1024;

/// Fixed SRAM capacity handled by the SRAM transfers.
pub const SRAM_SIZE: usize = 32 * 1024;

pub mod commands {
    pub const READ_ROM: u8 = 0x0a;
    pub const WRITE_ROM: u8 = 0x0b;
    pub const CONNECT: u8 = 0x0c;
    pub const CHECK_ID: u8 = 0x0d;
    pub const ERASE_FULL: u8 = 0x0e;
    pub const CLEAR_BUFFER: u8 = 0x0f;
    pub const READ_SRAM: u8 = 0x1a;
    pub const WRITE_SRAM: u8 = 0x1b;
    pub const ERASE_BY_SIZE: u8 = 0x1e;
    pub const ERASE_SECTOR: u8 = 0x2e;
}

/// Host side silence ceilings, in milliseconds, accumulated in poll steps.
pub mod timeouts {
    pub const CONNECT_MS: u32 = 2000;
    pub const CHECK_ID_DRAIN_MS: u32 = 3000;
    pub const CLEAR_BUFFER_DRAIN_MS: u32 = 2000;
    pub const STATUS_LINE_MS: u32 = 2000;
    pub const CHUNK_MS: u32 = 5000;
    pub const ACK_MS: u32 = 5000;
    pub const FULL_ERASE_MS: u32 = 3000;
    pub const SIZE_ERASE_MS: u32 = 5000;
    pub const READ_DRAIN_MS: u32 = 2000;
    pub const WRITE_DRAIN_MS: u32 = 1000;
    pub const MARKER_DRAIN_READ_MS: u32 = 100;

    pub const TAIL_MS: u32 = 8000;
    pub const LAST_TAIL_MS: u32 = 10000;
    pub const TAIL_SETTLE_MS: u32 = 1500;
    pub const LAST_TAIL_SETTLE_MS: u32 = 2000;
    pub const LAST_TAIL_ERROR_GRACE_MS: u32 = 5000;
    pub const LAST_CHUNK_RETRY_MS: u32 = 3000;
}

/// How many chunks at the end of a ROM dump use the tolerant reader.
pub const TAIL_CHUNKS: usize = 3;

/// Text the device prints that is noise unless running verbose.
pub const FILTERED_MESSAGES: &[&str] = &[
    "BUFF IS CLEAR",
    "ROM DUMP START!!!",
    "DUMPER ROM FINISH!!!",
    "PUSH SAVE GAME BUTTON!!!",
];

pub mod markers {
    pub const CONNECTED: &str = "connected";
    pub const FULL_ERASE_DONE: &str = "SRAM ERASE FINISH";
    pub const ERASE_DONE: &str = "ERASE OK";
    /// Printed instead of the completion marker when status polling gave up.
    pub const ERASE_FAILED: &str = "ERASE TIMEOUT";
    pub const FLASH_ID: &str = "FLASHID:";
}
