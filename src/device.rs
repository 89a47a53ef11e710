//! Flash chip identification.
use std::fmt;

/// Manufacturer/device pair returned by the autoselect (ID) mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlashId {
    pub manufacturer: u8,
    pub device: u8,
}

impl FlashId {
    pub const fn new(manufacturer: u8, device: u8) -> Self {
        FlashId {
            manufacturer,
            device,
        }
    }

    /// The chip this ID belongs to, if it is one we know how to drive.
    pub fn chip(&self) -> Option<&'static Chip> {
        KNOWN_CHIPS.iter().find(|c| c.id == *self)
    }

    /// Parses the `MMDD` hex pair printed after `FLASHID:`.
    pub fn parse(text: &str) -> Option<Self> {
        let raw = hex::decode(text.trim().get(..4)?).ok()?;
        Some(FlashId::new(raw[0], raw[1]))
    }
}

impl fmt::Display for FlashId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}{:02X}", self.manufacturer, self.device)
    }
}

/// A cartridge flash chip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chip {
    pub name: &'static str,
    pub id: FlashId,
    /// Capacity in bytes
    pub size: u32,
}

impl fmt::Display for Chip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{})", self.name, self.id)
    }
}

pub static KNOWN_CHIPS: &[Chip] = &[Chip {
    name: "MX29LV640EB",
    id: FlashId::new(0xc2, 0xcb),
    size: 8 * 1024 * 1024,
}];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_pair_is_recognised() {
        let chip = FlashId::new(0xc2, 0xcb).chip().unwrap();
        assert_eq!(chip.name, "MX29LV640EB");
        assert_eq!(chip.size, 8 * 1024 * 1024);
        assert!(FlashId::new(0xff, 0xff).chip().is_none());
    }

    #[test]
    fn parse_round_trips_display() {
        let id = FlashId::new(0xc2, 0x0b);
        assert_eq!(id.to_string(), "C20B");
        assert_eq!(FlashId::parse(&id.to_string()), Some(id));
        assert_eq!(FlashId::parse("C2CB\r\n"), Some(FlashId::new(0xc2, 0xcb)));
        assert_eq!(FlashId::parse("C2"), None);
        assert_eq!(FlashId::parse("ZZZZ"), None);
    }
}
