//! The chip: two cores, one bus, deterministic lockstep stepping.
//!
//! `step_cores` advances core 0 by exactly one instruction, then runs
//! core 1 until its cycle counter has caught up, which interleaves the
//! cores in proportion to their actual progress. Send-event notifications
//! are handed across right after the issuing core's step so the sibling
//! observes them before it next runs.

use std::collections::HashMap;

use log::error;

use crate::bus::SystemBus;
use crate::cpu::{CoreId, Cpu, Fault};

pub struct Chip {
    pub core0: Cpu,
    pub core1: Cpu,
    pub bus: SystemBus,
    /// Disassembly lines keyed by PC, for fault diagnostics only.
    disassembly: HashMap<u32, String>,
}

impl Chip {
    pub fn new() -> Self {
        Self {
            core0: Cpu::new(CoreId::Core0),
            core1: Cpu::new(CoreId::Core1),
            bus: SystemBus::new(),
            disassembly: HashMap::new(),
        }
    }

    /// Reinitialize both cores and the bus-side volatile state in place.
    pub fn reset(&mut self) {
        self.core0.reset();
        self.core1.reset();
        self.bus.reset();
    }

    pub fn load_bootrom(&mut self, words: &[u32]) {
        let n = words.len().min(self.bus.bootrom.len());
        self.bus.bootrom[..n].copy_from_slice(&words[..n]);
        self.reset();
    }

    /// Parse an objdump-style listing (`address: ...` per line) into the
    /// PC-keyed diagnostic table. Lines that do not start with a hex
    /// address are skipped.
    pub fn load_disassembly(&mut self, text: &str) {
        for line in text.lines() {
            let trimmed = line.trim();
            let Some((addr, _)) = trimmed.split_once(':') else {
                continue;
            };
            if let Ok(pc) = u32::from_str_radix(addr.trim(), 16) {
                self.disassembly.insert(pc, trimmed.to_string());
            }
        }
    }

    /// Drive an interrupt line into both cores' controllers.
    pub fn set_interrupt(&mut self, irq: u16, level: bool) {
        self.core0.set_interrupt(irq, level);
        self.core1.set_interrupt(irq, level);
    }

    /// Drive an interrupt line into a single core.
    pub fn set_interrupt_core(&mut self, core: CoreId, irq: u16, level: bool) {
        match core {
            CoreId::Core0 => self.core0.set_interrupt(irq, level),
            CoreId::Core1 => self.core1.set_interrupt(irq, level),
        }
    }

    /// Advance core 0 one instruction, then core 1 until its cycle count
    /// reaches core 0's. Returns the cycles core 0 consumed.
    pub fn step_cores(&mut self) -> Result<u64, Fault> {
        let start_cycles = self.core0.cycles;

        self.bus.set_active_core(CoreId::Core0);
        if let Err(fault) = self.core0.step(&mut self.bus) {
            self.log_fault(CoreId::Core0, &fault);
            return Err(fault);
        }
        if self.core0.take_sev() {
            self.core1.deliver_event();
        }

        while self.core1.cycles < self.core0.cycles {
            self.bus.set_active_core(CoreId::Core1);
            if let Err(fault) = self.core1.step(&mut self.bus) {
                self.log_fault(CoreId::Core1, &fault);
                return Err(fault);
            }
            if self.core1.take_sev() {
                self.core0.deliver_event();
            }
        }

        Ok(self.core0.cycles - start_cycles)
    }

    /// One machine step (both cores).
    pub fn step(&mut self) -> Result<u64, Fault> {
        self.step_cores()
    }

    fn log_fault(&self, core: CoreId, fault: &Fault) {
        let (pc, cycles) = match core {
            CoreId::Core0 => (self.core0.pc, self.core0.cycles),
            CoreId::Core1 => (self.core1.pc, self.core1.cycles),
        };
        match self.disassembly.get(&pc) {
            Some(line) => error!("core{}: {fault} (cycle {cycles}) [{line}]", core.index()),
            None => error!("core{}: {fault} (cycle {cycles})", core.index()),
        }
    }
}

impl Default for Chip {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Bus, SRAM_BASE};
    use crate::cpu::compressed::{enc_itype, enc_rtype};
    use crate::cpu::decode::{OPCODE_OP, OPCODE_OP_IMM};

    fn nop() -> u32 {
        enc_itype(0, 0, 0, 0, OPCODE_OP_IMM)
    }

    fn load_program(chip: &mut Chip, base: u32, words: &[u32]) {
        for (i, word) in words.iter().enumerate() {
            chip.bus.write_u32(base + 4 * i as u32, *word);
        }
    }

    #[test]
    fn test_lockstep_cycle_bound() {
        let mut chip = Chip::new();
        // both cores run nop slides
        let slide: Vec<u32> = std::iter::repeat(nop()).take(64).collect();
        load_program(&mut chip, SRAM_BASE, &slide);
        chip.core0.pc = SRAM_BASE;
        chip.core1.pc = SRAM_BASE;

        for _ in 0..20 {
            chip.step_cores().unwrap();
            // core 1 has caught up but not overshot by more than one
            // instruction's cost
            assert!(chip.core1.cycles >= chip.core0.cycles);
            assert!(chip.core1.cycles < chip.core0.cycles + 2);
        }
    }

    #[test]
    fn test_lockstep_with_uneven_costs() {
        let mut chip = Chip::new();
        // core 0 runs divisions (18 cycles each), core 1 runs nops
        let divs: Vec<u32> = std::iter::repeat(enc_rtype(1, 2, 1, 5, 3, OPCODE_OP))
            .take(8)
            .collect();
        load_program(&mut chip, SRAM_BASE, &divs);
        let slide: Vec<u32> = std::iter::repeat(nop()).take(200).collect();
        load_program(&mut chip, SRAM_BASE + 0x400, &slide);
        chip.core0.pc = SRAM_BASE;
        chip.core1.pc = SRAM_BASE + 0x400;
        chip.core0.write_reg(1, 100);
        chip.core0.write_reg(2, 3);

        let consumed = chip.step_cores().unwrap();
        assert_eq!(consumed, 18);
        // core 1 executed ~18 nops to catch up
        assert!(chip.core1.cycles >= chip.core0.cycles);
        assert!(chip.core1.cycles < chip.core0.cycles + 2);
    }

    #[test]
    fn test_send_event_wakes_sibling() {
        let mut chip = Chip::new();
        // core 0: sev (slt x0, x0, x1) then nops
        load_program(
            &mut chip,
            SRAM_BASE,
            &[enc_rtype(0, 1, 0, 2, 0, OPCODE_OP), nop(), nop()],
        );
        chip.core0.pc = SRAM_BASE;
        chip.core1.pc = SRAM_BASE + 8;
        chip.core1.waiting = true;

        chip.step_cores().unwrap();
        assert!(!chip.core1.waiting);
    }

    #[test]
    fn test_event_registered_when_sibling_awake() {
        let mut chip = Chip::new();
        load_program(
            &mut chip,
            SRAM_BASE,
            &[enc_rtype(0, 1, 0, 2, 0, OPCODE_OP), nop(), nop(), nop()],
        );
        chip.core0.pc = SRAM_BASE;
        chip.core1.pc = SRAM_BASE + 8;

        chip.step_cores().unwrap();
        assert!(chip.core1.event_registered);
    }

    #[test]
    fn test_set_interrupt_fans_out() {
        let mut chip = Chip::new();
        chip.set_interrupt(4, true);
        assert_eq!(chip.core0.irq_controller().pending_window(0), 1 << 4);
        assert_eq!(chip.core1.irq_controller().pending_window(0), 1 << 4);

        chip.set_interrupt_core(CoreId::Core1, 4, false);
        assert_eq!(chip.core0.irq_controller().pending_window(0), 1 << 4);
        assert_eq!(chip.core1.irq_controller().pending_window(0), 0);
    }

    #[test]
    fn test_load_disassembly_lookup() {
        let mut chip = Chip::new();
        chip.load_disassembly("10000130:\t4601\tli a2,0\nnot a line\n");
        assert!(chip.disassembly.contains_key(&0x1000_0130));
        assert_eq!(chip.disassembly.len(), 1);
    }

    #[test]
    fn test_waiting_cores_still_consume_cycles() {
        let mut chip = Chip::new();
        chip.core0.waiting = true;
        chip.core1.waiting = true;
        let consumed = chip.step_cores().unwrap();
        assert_eq!(consumed, 1);
        assert_eq!(chip.core0.cycles, 1);
        assert_eq!(chip.core1.cycles, 1);
    }
}
