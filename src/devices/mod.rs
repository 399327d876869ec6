//! Bus clients: the peripheral interface and the per-core I/O window.
//!
//! Concrete peripheral register banks are external collaborators; the bus
//! only needs the access interface plus a logging shim to park at the
//! address chunks nothing has claimed yet.

pub mod sio;

use log::warn;

/// Atomic register-write style, selected by address bits 13:12 of the
/// peripheral window (normal / XOR alias / bit-set alias / bit-clear
/// alias).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicStyle {
    Normal,
    Xor,
    Set,
    Clear,
}

impl AtomicStyle {
    pub fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            0 => AtomicStyle::Normal,
            1 => AtomicStyle::Xor,
            2 => AtomicStyle::Set,
            _ => AtomicStyle::Clear,
        }
    }
}

/// A memory-mapped peripheral register bank.
///
/// `offset` is relative to the peripheral's 16 KiB chunk; reads see the
/// full 14-bit offset, writes see the 12-bit register offset with the
/// atomic style split out.
pub trait Peripheral {
    fn name(&self) -> &'static str;

    fn read_u32(&mut self, offset: u32) -> u32;

    fn write_u32(&mut self, offset: u32, value: u32);

    /// Atomic write variants derive from read + write unless a peripheral
    /// needs the raw transaction.
    fn write_u32_atomic(&mut self, offset: u32, value: u32, style: AtomicStyle) {
        match style {
            AtomicStyle::Normal => self.write_u32(offset, value),
            AtomicStyle::Xor => {
                let old = self.read_u32(offset);
                self.write_u32(offset, old ^ value);
            }
            AtomicStyle::Set => {
                let old = self.read_u32(offset);
                self.write_u32(offset, old | value);
            }
            AtomicStyle::Clear => {
                let old = self.read_u32(offset);
                self.write_u32(offset, old & !value);
            }
        }
    }

    /// Notification hook for USB packet RAM writes; only the peripheral
    /// registered over the DPRAM region cares.
    fn dpram_updated(&mut self, _offset: u32, _value: u32) {}
}

/// Placeholder for an address chunk whose peripheral is not modeled.
/// Reads as zero so firmware probing register banks keeps running.
pub struct UnimplementedPeripheral {
    name: &'static str,
}

impl UnimplementedPeripheral {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }
}

impl Peripheral for UnimplementedPeripheral {
    fn name(&self) -> &'static str {
        self.name
    }

    fn read_u32(&mut self, offset: u32) -> u32 {
        warn!("{}: read from unimplemented register {offset:#x}", self.name);
        0
    }

    fn write_u32(&mut self, offset: u32, value: u32) {
        warn!(
            "{}: write {value:#010x} to unimplemented register {offset:#x}",
            self.name
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Reg(u32);

    impl Peripheral for Reg {
        fn name(&self) -> &'static str {
            "reg"
        }
        fn read_u32(&mut self, _offset: u32) -> u32 {
            self.0
        }
        fn write_u32(&mut self, _offset: u32, value: u32) {
            self.0 = value;
        }
    }

    #[test]
    fn test_atomic_style_selector() {
        assert_eq!(AtomicStyle::from_bits(0), AtomicStyle::Normal);
        assert_eq!(AtomicStyle::from_bits(1), AtomicStyle::Xor);
        assert_eq!(AtomicStyle::from_bits(2), AtomicStyle::Set);
        assert_eq!(AtomicStyle::from_bits(3), AtomicStyle::Clear);
    }

    #[test]
    fn test_default_atomic_variants() {
        let mut reg = Reg(0b1100);
        reg.write_u32_atomic(0, 0b0110, AtomicStyle::Set);
        assert_eq!(reg.0, 0b1110);
        reg.write_u32_atomic(0, 0b0011, AtomicStyle::Clear);
        assert_eq!(reg.0, 0b1100);
        reg.write_u32_atomic(0, 0b1111, AtomicStyle::Xor);
        assert_eq!(reg.0, 0b0011);
        reg.write_u32_atomic(0, 0xff, AtomicStyle::Normal);
        assert_eq!(reg.0, 0xff);
    }
}
