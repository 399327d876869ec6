//! System bus: address decode across boot ROM, flash, SRAM, USB packet
//! RAM, the per-core I/O window and the peripheral table.
//!
//! Peripheral chunks are 16 KiB, keyed by the address's top 18 bits. Bus
//! faults are deliberately non-fatal: boot code scans address space, so
//! an unmapped read warns and returns all-ones, and an unmapped write
//! warns and is dropped.

use std::collections::HashMap;

use log::warn;

use crate::cpu::CoreId;
use crate::devices::sio::Sio;
use crate::devices::{AtomicStyle, Peripheral};

pub const BOOTROM_SIZE: u32 = 32 * 1024;

/// Flash is one 16 MiB store mirrored at four aliasing windows
/// (cached/uncached, allocating/non-allocating).
pub const FLASH_BASE: u32 = 0x1000_0000;
pub const FLASH_SIZE: u32 = 16 * 1024 * 1024;
pub const FLASH_END: u32 = 0x1400_0000;

pub const SRAM_BASE: u32 = 0x2000_0000;
pub const SRAM_SIZE: u32 = (256 * 2 + 8) * 1024;

pub const DPRAM_BASE: u32 = 0x5010_0000;
pub const DPRAM_SIZE: u32 = 4 * 1024;

/// The USB controller's register chunk; it is notified of packet RAM
/// writes.
pub const USBCTRL_BASE: u32 = 0x5011_0000;

pub const SIO_BASE: u32 = 0xd000_0000;
pub const SIO_END: u32 = 0xe000_0000;

/// Memory access surface the execution unit drives. Accesses cannot fail:
/// unmapped addresses are recovered internally so boot code probing the
/// map keeps running.
pub trait Bus {
    fn read_u8(&mut self, addr: u32) -> u8;
    fn read_u16(&mut self, addr: u32) -> u16;
    fn read_u32(&mut self, addr: u32) -> u32;
    fn write_u8(&mut self, addr: u32, value: u8);
    fn write_u16(&mut self, addr: u32, value: u16);
    fn write_u32(&mut self, addr: u32, value: u32);
}

pub struct SystemBus {
    pub bootrom: Vec<u32>,
    flash: Vec<u8>,
    sram: Vec<u8>,
    usb_dpram: Vec<u8>,
    pub sio: Sio,
    peripherals: HashMap<u32, Box<dyn Peripheral>>,
    active_core: CoreId,
}

/// 16 KiB-chunk key: the top 18 bits of the address.
fn chunk_key(addr: u32) -> u32 {
    (addr >> 14) << 2
}

impl SystemBus {
    pub fn new() -> Self {
        Self {
            bootrom: vec![0; (BOOTROM_SIZE / 4) as usize],
            flash: vec![0xff; FLASH_SIZE as usize],
            sram: vec![0; SRAM_SIZE as usize],
            usb_dpram: vec![0; DPRAM_SIZE as usize],
            sio: Sio::new(),
            peripherals: HashMap::new(),
            active_core: CoreId::Core0,
        }
    }

    /// Erase flash and clear the I/O window; peripherals and loaded boot
    /// ROM contents stay.
    pub fn reset(&mut self) {
        self.flash.fill(0xff);
        self.sio.reset();
    }

    /// Which core the current step call belongs to; the I/O window
    /// decodes per core.
    pub fn set_active_core(&mut self, core: CoreId) {
        self.active_core = core;
    }

    /// Register a peripheral over the 16 KiB chunk containing `base`.
    pub fn register_peripheral(&mut self, base: u32, peripheral: Box<dyn Peripheral>) {
        self.peripherals.insert(chunk_key(base), peripheral);
    }

    fn check_aligned(&self, addr: u32) {
        if addr & 0x3 != 0 {
            warn!("32-bit access to {addr:#010x} is not word aligned");
        }
    }
}

impl Default for SystemBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus for SystemBus {
    fn read_u32(&mut self, addr: u32) -> u32 {
        self.check_aligned(addr);
        if addr < BOOTROM_SIZE {
            return self.bootrom[(addr / 4) as usize];
        }
        if (FLASH_BASE..FLASH_END).contains(&addr) {
            let offset = (addr & 0x00ff_ffff) as usize;
            let bytes = [
                self.flash[offset],
                self.flash[offset + 1],
                self.flash[offset + 2],
                self.flash[offset + 3],
            ];
            return u32::from_le_bytes(bytes);
        }
        if (SRAM_BASE..SRAM_BASE + SRAM_SIZE).contains(&addr) {
            let offset = (addr - SRAM_BASE) as usize;
            return u32::from_le_bytes([
                self.sram[offset],
                self.sram[offset + 1],
                self.sram[offset + 2],
                self.sram[offset + 3],
            ]);
        }
        if (DPRAM_BASE..DPRAM_BASE + DPRAM_SIZE).contains(&addr) {
            let offset = (addr - DPRAM_BASE) as usize;
            return u32::from_le_bytes([
                self.usb_dpram[offset],
                self.usb_dpram[offset + 1],
                self.usb_dpram[offset + 2],
                self.usb_dpram[offset + 3],
            ]);
        }
        if (SIO_BASE..SIO_END).contains(&addr) {
            return self.sio.read_u32(addr - SIO_BASE, self.active_core);
        }
        if let Some(peripheral) = self.peripherals.get_mut(&chunk_key(addr)) {
            return peripheral.read_u32(addr & 0x3fff);
        }
        warn!("read from unmapped address {addr:#010x}");
        0xffff_ffff
    }

    /// 16-bit reads hit the flash and SRAM byte stores directly and
    /// synthesize from the aligned 32-bit path everywhere else.
    fn read_u16(&mut self, addr: u32) -> u16 {
        if (FLASH_BASE..FLASH_BASE + FLASH_SIZE).contains(&addr) {
            let offset = (addr - FLASH_BASE) as usize;
            return u16::from_le_bytes([self.flash[offset], self.flash[offset + 1]]);
        }
        if (SRAM_BASE..SRAM_BASE + SRAM_SIZE).contains(&addr) {
            let offset = (addr - SRAM_BASE) as usize;
            return u16::from_le_bytes([self.sram[offset], self.sram[offset + 1]]);
        }
        let value = self.read_u32(addr & !0x3);
        if addr & 0x2 != 0 {
            (value >> 16) as u16
        } else {
            value as u16
        }
    }

    fn read_u8(&mut self, addr: u32) -> u8 {
        if (FLASH_BASE..FLASH_BASE + FLASH_SIZE).contains(&addr) {
            return self.flash[(addr - FLASH_BASE) as usize];
        }
        if (SRAM_BASE..SRAM_BASE + SRAM_SIZE).contains(&addr) {
            return self.sram[(addr - SRAM_BASE) as usize];
        }
        let value = self.read_u16(addr & !0x1);
        if addr & 0x1 != 0 {
            (value >> 8) as u8
        } else {
            value as u8
        }
    }

    fn write_u32(&mut self, addr: u32, value: u32) {
        self.check_aligned(addr);
        // peripherals decode first so the atomic aliases apply uniformly
        if let Some(peripheral) = self.peripherals.get_mut(&chunk_key(addr)) {
            let style = AtomicStyle::from_bits((addr >> 12) & 0x3);
            peripheral.write_u32_atomic(addr & 0xfff, value, style);
            return;
        }
        if addr < BOOTROM_SIZE {
            self.bootrom[(addr / 4) as usize] = value;
            return;
        }
        if (FLASH_BASE..FLASH_END).contains(&addr) {
            let offset = (addr & 0x00ff_ffff) as usize;
            self.flash[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
            return;
        }
        if (SRAM_BASE..SRAM_BASE + SRAM_SIZE).contains(&addr) {
            let offset = (addr - SRAM_BASE) as usize;
            self.sram[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
            return;
        }
        if (DPRAM_BASE..DPRAM_BASE + DPRAM_SIZE).contains(&addr) {
            let offset = addr - DPRAM_BASE;
            self.usb_dpram[offset as usize..offset as usize + 4]
                .copy_from_slice(&value.to_le_bytes());
            // the USB controller watches its packet RAM
            if let Some(peripheral) = self.peripherals.get_mut(&chunk_key(USBCTRL_BASE)) {
                peripheral.dpram_updated(offset, value);
            }
            return;
        }
        if (SIO_BASE..SIO_END).contains(&addr) {
            self.sio.write_u32(addr - SIO_BASE, value, self.active_core);
            return;
        }
        warn!("write {value:#010x} to unmapped address {addr:#010x}");
    }

    fn write_u8(&mut self, addr: u32, value: u8) {
        if (SRAM_BASE..SRAM_BASE + SRAM_SIZE).contains(&addr) {
            self.sram[(addr - SRAM_BASE) as usize] = value;
            return;
        }
        let aligned = addr & !0x3;
        if let Some(peripheral) = self.peripherals.get_mut(&chunk_key(addr)) {
            // replicate the byte across the lane
            let lane = u32::from_le_bytes([value; 4]);
            let style = AtomicStyle::from_bits((aligned >> 12) & 0x3);
            peripheral.write_u32_atomic(aligned & 0xfff, lane, style);
            return;
        }
        let mut bytes = self.read_u32(aligned).to_le_bytes();
        bytes[(addr & 0x3) as usize] = value;
        self.write_u32(aligned, u32::from_le_bytes(bytes));
    }

    fn write_u16(&mut self, addr: u32, value: u16) {
        if (SRAM_BASE..SRAM_BASE + SRAM_SIZE).contains(&addr) {
            let offset = (addr - SRAM_BASE) as usize;
            self.sram[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
            return;
        }
        let aligned = addr & !0x3;
        if let Some(peripheral) = self.peripherals.get_mut(&chunk_key(addr)) {
            // replicate the halfword across the lane
            let lane = (value as u32) | ((value as u32) << 16);
            let style = AtomicStyle::from_bits((aligned >> 12) & 0x3);
            peripheral.write_u32_atomic(aligned & 0xfff, lane, style);
            return;
        }
        let mut bytes = self.read_u32(aligned).to_le_bytes();
        let lane_offset = (addr & 0x2) as usize;
        bytes[lane_offset..lane_offset + 2].copy_from_slice(&value.to_le_bytes());
        self.write_u32(aligned, u32::from_le_bytes(bytes));
    }
}
