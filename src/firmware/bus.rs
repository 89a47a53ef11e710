//! Cartridge bus primitives.

/// A 24-bit address, 16-bit data parallel cartridge bus.
///
/// Implementations strobe chip-select plus read or write and wait the fixed
/// settle delays themselves; there are no error returns because an absent
/// cartridge only shows up as constant data. Every call moves the shared
/// address latch, so one owner must drive the bus at a time.
pub trait Bus {
    /// Turn the data lines into inputs.
    fn set_read_mode(&mut self);
    /// Turn the data lines into outputs.
    fn set_write_mode(&mut self);

    /// Read the low data byte at `address`.
    fn get_byte(&mut self, address: u32) -> u8;
    /// Drive `value` on the low data byte and pulse write at `address`.
    fn set_byte(&mut self, address: u32, value: u8);

    /// Read the full 16-bit word at `address`.
    fn get_word(&mut self, address: u32) -> u16;
    /// Drive a full 16-bit word and pulse write.
    fn set_word(&mut self, address: u32, value: u16);

    /// Latch the cartridge TIME register so A20 accesses hit SRAM (`true`)
    /// or ROM (`false`).
    fn select_sram(&mut self, enable: bool);

    /// Busy wait on the device clock.
    fn delay_ms(&mut self, ms: u32);
}

impl<B: Bus + ?Sized> Bus for &mut B {
    fn set_read_mode(&mut self) {
        (**self).set_read_mode()
    }

    fn set_write_mode(&mut self) {
        (**self).set_write_mode()
    }

    fn get_byte(&mut self, address: u32) -> u8 {
        (**self).get_byte(address)
    }

    fn set_byte(&mut self, address: u32, value: u8) {
        (**self).set_byte(address, value)
    }

    fn get_word(&mut self, address: u32) -> u16 {
        (**self).get_word(address)
    }

    fn set_word(&mut self, address: u32, value: u16) {
        (**self).set_word(address, value)
    }

    fn select_sram(&mut self, enable: bool) {
        (**self).select_sram(enable)
    }

    fn delay_ms(&mut self, ms: u32) {
        (**self).delay_ms(ms)
    }
}
