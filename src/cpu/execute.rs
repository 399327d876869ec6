//! Instruction execution: fetch, RVC expansion, decode, dispatch, cycle
//! accounting and PC update.
//!
//! Dispatch is two-level: the opcode selects a format handler, which then
//! matches on (funct3, funct7) or the immediate pattern. Anything that
//! falls through the matches is a `Fault` — an unmatched pattern means
//! either genuinely illegal code or an emulation gap, and both must stop
//! the run rather than be silently approximated.

use super::Fault;
use super::compressed;
use super::core::Cpu;
use super::csr::{CAUSE_BREAKPOINT, CAUSE_ECALL_M, CsrOp, MSTATUS_MIE, MSTATUS_MPIE};
use super::decode::{
    Instr, OPCODE_AMO, OPCODE_AUIPC, OPCODE_BRANCH, OPCODE_JAL, OPCODE_JALR, OPCODE_LOAD,
    OPCODE_LUI, OPCODE_MISC_MEM, OPCODE_OP, OPCODE_OP_IMM, OPCODE_STORE, OPCODE_SYSTEM,
};
use crate::bus::Bus;

/// Extra cycles charged by the iterative divider.
const DIV_CYCLES: u64 = 17;

/// Extra cycles for a read-modify-write bus transaction.
const AMO_CYCLES: u64 = 3;

impl Cpu {
    /// Advance the core by one instruction: poll interrupts, fetch
    /// (expanding a compressed halfword if needed), decode, dispatch,
    /// update PC and the cycle counter. An interrupt trap entry redirects
    /// PC and consumes the whole step; a waiting core consumes one cycle
    /// and does nothing else.
    pub fn step(&mut self, bus: &mut dyn Bus) -> Result<(), Fault> {
        if self.interrupts_updated {
            self.interrupts_updated = false;
            if self.check_for_interrupts() {
                return Ok(());
            }
        }
        if self.waiting {
            self.cycles += 1;
            return Ok(());
        }

        let pc = self.pc;
        let half = bus.read_u16(pc) as u32;
        let (word, len) = if half & 0b11 == 0b11 {
            let upper = bus.read_u16(pc.wrapping_add(2)) as u32;
            (half | (upper << 16), 4)
        } else {
            let expanded = compressed::decompress(half as u16)
                .map_err(|err| Fault::ReservedCompressed { pc, insn: err.0 })?;
            (expanded, 2)
        };

        let instr = Instr::decode(word).ok_or(Fault::IllegalInstruction { pc, insn: word })?;
        self.cycles += 1;
        self.execute(instr, len, bus)
    }

    fn execute(&mut self, instr: Instr, len: u32, bus: &mut dyn Bus) -> Result<(), Fault> {
        let pc = self.pc;
        let word = instr.word;
        let mut next_pc = pc.wrapping_add(len);
        let fault = Fault::IllegalInstruction { pc, insn: word };

        match instr.opcode() {
            OPCODE_LUI => {
                self.write_reg(instr.rd(), instr.imm() as u32);
            }
            OPCODE_AUIPC => {
                self.write_reg(instr.rd(), pc.wrapping_add(instr.imm() as u32));
            }
            OPCODE_JAL => {
                self.write_reg(instr.rd(), pc.wrapping_add(len));
                next_pc = pc.wrapping_add(instr.imm() as u32);
                self.cycles += 1;
            }
            OPCODE_JALR => {
                let target = self
                    .read_reg(instr.rs1())
                    .wrapping_add(instr.imm() as u32)
                    & !1;
                self.write_reg(instr.rd(), pc.wrapping_add(len));
                next_pc = target;
                self.cycles += 1;
            }
            OPCODE_BRANCH => {
                let a = self.read_reg(instr.rs1());
                let b = self.read_reg(instr.rs2());
                let taken = match instr.funct3() {
                    0 => a == b,
                    1 => a != b,
                    4 => (a as i32) < (b as i32),
                    5 => (a as i32) >= (b as i32),
                    6 => a < b,
                    7 => a >= b,
                    _ => return Err(fault),
                };
                if taken {
                    let target = pc.wrapping_add(instr.imm() as u32);
                    if target < pc {
                        // backward branch: free when the single-entry
                        // predictor already holds this PC
                        if self.predicted_branch_pc != Some(pc) {
                            self.cycles += 1;
                            self.predicted_branch_pc = Some(pc);
                        }
                    } else {
                        self.cycles += 1;
                    }
                    next_pc = target;
                } else if self.predicted_branch_pc == Some(pc) {
                    // failed prediction: pay the flush and forget the entry
                    self.cycles += 1;
                    self.predicted_branch_pc = None;
                }
            }
            OPCODE_LOAD => {
                let addr = self.read_reg(instr.rs1()).wrapping_add(instr.imm() as u32);
                let value = match instr.funct3() {
                    0 => bus.read_u8(addr) as i8 as i32 as u32,
                    1 => bus.read_u16(addr) as i16 as i32 as u32,
                    2 => bus.read_u32(addr),
                    4 => bus.read_u8(addr) as u32,
                    5 => bus.read_u16(addr) as u32,
                    _ => return Err(fault),
                };
                self.write_reg(instr.rd(), value);
            }
            OPCODE_STORE => {
                let addr = self.read_reg(instr.rs1()).wrapping_add(instr.imm() as u32);
                let value = self.read_reg(instr.rs2());
                match instr.funct3() {
                    0 => bus.write_u8(addr, value as u8),
                    1 => bus.write_u16(addr, value as u16),
                    2 => bus.write_u32(addr, value),
                    _ => return Err(fault),
                }
            }
            OPCODE_OP_IMM => {
                let value = self.exec_op_imm(&instr).ok_or(fault)?;
                self.write_reg(instr.rd(), value);
            }
            OPCODE_OP => {
                self.exec_op(&instr).ok_or(fault)?;
            }
            OPCODE_AMO => {
                // amoor.w is the one AMO the core implements
                if instr.funct7() >> 2 == 0b01000 && instr.funct3() == 2 {
                    let addr = self.read_reg(instr.rs1());
                    let old = bus.read_u32(addr);
                    bus.write_u32(addr, old | self.read_reg(instr.rs2()));
                    self.write_reg(instr.rd(), old);
                    self.cycles += AMO_CYCLES;
                } else {
                    return Err(fault);
                }
            }
            OPCODE_MISC_MEM => {
                // fence / fence.i: nothing to order in this machine
            }
            OPCODE_SYSTEM => {
                next_pc = self.exec_system(&instr, next_pc).ok_or(fault)?;
            }
            _ => return Err(fault),
        }

        self.pc = next_pc;
        Ok(())
    }

    /// OP-IMM group: returns the rd value, or None for a fault.
    fn exec_op_imm(&mut self, instr: &Instr) -> Option<u32> {
        let a = self.read_reg(instr.rs1());
        let imm = instr.imm();
        let value = match instr.funct3() {
            0 => a.wrapping_add(imm as u32),
            2 => ((a as i32) < imm) as u32,
            3 => (a < imm as u32) as u32,
            4 => a ^ imm as u32,
            6 => a | imm as u32,
            7 => a & imm as u32,
            1 => match instr.imm_u() {
                0x600 => a.leading_zeros(),
                0x601 => a.trailing_zeros(),
                0x602 => a.count_ones(),
                0x604 => a as i8 as i32 as u32,  // sext.b
                0x605 => a as i16 as i32 as u32, // sext.h
                _ => {
                    let shamt = instr.shamt();
                    match instr.funct7() {
                        0x00 => a << shamt,
                        0x14 => a | (1 << shamt),  // bseti
                        0x24 => a & !(1 << shamt), // bclri
                        _ => return None,
                    }
                }
            },
            5 => match instr.imm_u() {
                0x698 => a.swap_bytes(), // rev8
                _ => {
                    let shamt = instr.shamt();
                    match instr.funct7() {
                        0x00 => a >> shamt,
                        0x20 => ((a as i32) >> shamt) as u32,
                        0x24 => (a >> shamt) & 1, // bexti
                        _ => return None,
                    }
                }
            },
            _ => return None,
        };
        Some(value)
    }

    /// OP group, including the two repurposed `slt x0` event encodings.
    /// Returns None for a fault.
    fn exec_op(&mut self, instr: &Instr) -> Option<()> {
        let funct3 = instr.funct3();
        let funct7 = instr.funct7();
        let (rd, rs1, rs2) = (instr.rd(), instr.rs1(), instr.rs2());

        // slt x0, x0, x0 blocks until an event; slt x0, x0, x1 sends one
        if funct3 == 2 && funct7 == 0 && rd == 0 && rs1 == 0 && rs2 <= 1 {
            if rs2 == 0 {
                if self.event_registered {
                    self.event_registered = false;
                } else {
                    self.waiting = true;
                }
            } else {
                self.sev_pending = true;
            }
            return Some(());
        }

        let a = self.read_reg(rs1);
        let b = self.read_reg(rs2);
        let value = match (funct3, funct7) {
            (0, 0x00) => a.wrapping_add(b),
            (0, 0x20) => a.wrapping_sub(b),
            (0, 0x01) => a.wrapping_mul(b),
            (1, 0x00) => a << (b & 0x1f),
            (1, 0x01) => {
                // mulh: high 32 bits of signed * signed
                (((a as i32 as i64).wrapping_mul(b as i32 as i64) >> 32) as i32) as u32
            }
            (2, 0x00) => ((a as i32) < (b as i32)) as u32,
            (2, 0x01) => {
                // mulhsu: high 32 bits of signed * unsigned
                (((a as i32 as i64).wrapping_mul(b as i64) >> 32) as i32) as u32
            }
            (2, 0x10) => b.wrapping_add(a << 1), // sh1add
            (3, 0x00) => (a < b) as u32,
            (3, 0x01) => (((a as u64) * (b as u64)) >> 32) as u32, // mulhu
            (4, 0x00) => a ^ b,
            (4, 0x01) => {
                // div: quotient -1 on zero divide, MIN on overflow
                self.cycles += DIV_CYCLES;
                let (a, b) = (a as i32, b as i32);
                let q = if b == 0 { -1 } else { a.wrapping_div(b) };
                q as u32
            }
            (4, 0x20) => !(a ^ b),               // xnor
            (4, 0x10) => b.wrapping_add(a << 2), // sh2add
            (4, 0x04) => (b << 16) | (a & 0xffff), // pack
            (4, 0x05) => (a as i32).min(b as i32) as u32, // min
            (5, 0x00) => a >> (b & 0x1f),
            (5, 0x01) => {
                // divu: all-ones quotient on zero divide
                self.cycles += DIV_CYCLES;
                if b == 0 { u32::MAX } else { a / b }
            }
            (5, 0x20) => ((a as i32) >> (b & 0x1f)) as u32,
            (5, 0x05) => a.min(b), // minu
            (6, 0x00) => a | b,
            (6, 0x01) => {
                // rem: dividend on zero divide, 0 on overflow
                self.cycles += DIV_CYCLES;
                let (a, b) = (a as i32, b as i32);
                let r = if b == 0 { a } else { a.wrapping_rem(b) };
                r as u32
            }
            (6, 0x20) => a | !b,                 // orn
            (6, 0x10) => b.wrapping_add(a << 3), // sh3add
            (6, 0x05) => (a as i32).max(b as i32) as u32, // max
            (7, 0x00) => a & b,
            (7, 0x01) => {
                // remu: dividend on zero divide
                self.cycles += DIV_CYCLES;
                if b == 0 { a } else { a % b }
            }
            (7, 0x20) => a & !b,                          // andn
            (7, 0x05) => a.max(b),                        // maxu
            (7, 0x04) => ((b & 0xff) << 8) | (a & 0xff),  // packh
            _ => return None,
        };
        self.write_reg(rd, value);
        Some(())
    }

    /// SYSTEM group: traps, mret, wfi and the Zicsr instructions.
    /// Returns the next PC, or None for a fault.
    fn exec_system(&mut self, instr: &Instr, fallthrough: u32) -> Option<u32> {
        let funct3 = instr.funct3();
        if funct3 == 0 {
            return match instr.imm_u() {
                0x000 => Some(self.enter_exception(CAUSE_ECALL_M)),
                0x001 => Some(self.enter_exception(CAUSE_BREAKPOINT)),
                0x105 => {
                    // wfi: park the core; the interrupt check on the next
                    // step wakes it immediately if a candidate is visible
                    self.waiting = true;
                    self.interrupts_updated = true;
                    Some(fallthrough)
                }
                0x302 => {
                    // mret: MIE <- MPIE, MPIE <- 1, pop the preemption
                    // context when returning from an external interrupt
                    let mpie = (self.csrs.mstatus >> 7) & 1;
                    self.csrs.mstatus =
                        (self.csrs.mstatus & !MSTATUS_MIE) | (mpie << 3) | MSTATUS_MPIE;
                    self.irq.pop_context();
                    self.interrupts_updated = true;
                    Some(self.csrs.mepc)
                }
                _ => None,
            };
        }

        let csr_addr = instr.imm_u() as u16;
        let rs1 = instr.rs1();
        let (op, operand, write) = match funct3 {
            1 => (CsrOp::Swap, self.read_reg(rs1), true),
            2 => (CsrOp::Set, self.read_reg(rs1), rs1 != 0),
            3 => (CsrOp::Clear, self.read_reg(rs1), rs1 != 0),
            5 => (CsrOp::Swap, rs1, true),
            6 => (CsrOp::Set, rs1, rs1 != 0),
            7 => (CsrOp::Clear, rs1, rs1 != 0),
            _ => return None,
        };
        let old = self.csr_access(csr_addr, op, operand, write);
        self.write_reg(instr.rd(), old);
        Some(fallthrough)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{SRAM_BASE, SystemBus};
    use crate::cpu::CoreId;
    use crate::cpu::compressed::{enc_btype, enc_itype, enc_jtype, enc_rtype, enc_stype};
    use crate::cpu::csr::{
        CSR_MCAUSE, CSR_MEICONTEXT, CSR_MEIEA, CSR_MEINEXT, CSR_MEIPRA, CSR_MEPC, CSR_MIE,
        CSR_MSTATUS, CSR_MTVEC,
    };
    use crate::cpu::decode::{OPCODE_BRANCH, OPCODE_JAL, OPCODE_OP, OPCODE_OP_IMM, OPCODE_SYSTEM};

    fn setup() -> (Cpu, SystemBus) {
        let mut cpu = Cpu::new(CoreId::Core0);
        cpu.pc = SRAM_BASE;
        (cpu, SystemBus::new())
    }

    fn load_program(bus: &mut SystemBus, base: u32, words: &[u32]) {
        for (i, word) in words.iter().enumerate() {
            bus.write_u32(base + 4 * i as u32, *word);
        }
    }

    fn add(rd: u32, rs1: u32, rs2: u32) -> u32 {
        enc_rtype(0, rs2, rs1, 0, rd, OPCODE_OP)
    }

    #[test]
    fn test_add_scenario() {
        let (mut cpu, mut bus) = setup();
        cpu.write_reg(1, 3);
        cpu.write_reg(2, 5);
        load_program(&mut bus, SRAM_BASE, &[add(3, 1, 2)]);

        cpu.step(&mut bus).unwrap();

        assert_eq!(cpu.read_reg(3), 8);
        assert_eq!(cpu.cycles, 1);
        assert_eq!(cpu.pc, SRAM_BASE + 4);
    }

    #[test]
    fn test_branch_shift_toy_program() {
        // add tp,ra,sp; beq tp,zero,0xC; blt tp,ra,12; add gp,gp,sp;
        // add gp,gp,sp; srl gp,gp,ra; add zero,zero,ra; add zero,zero,ra
        let (mut cpu, mut bus) = setup();
        let program = [
            add(4, 1, 2),
            enc_btype(0xc, 0, 4, 0, OPCODE_BRANCH),
            enc_btype(12, 1, 4, 4, OPCODE_BRANCH),
            add(3, 3, 2),
            add(3, 3, 2),
            enc_rtype(0, 1, 3, 5, 3, OPCODE_OP),
            add(0, 0, 1),
            add(0, 0, 1),
        ];
        load_program(&mut bus, SRAM_BASE, &program);
        cpu.write_reg(1, 5);
        cpu.write_reg(2, (-8i32) as u32);
        cpu.write_reg(3, 64);

        for _ in 0..6 {
            cpu.step(&mut bus).unwrap();
        }

        assert_eq!(cpu.read_reg(3), 2);
        assert_eq!(cpu.read_reg(0), 0);
    }

    #[test]
    fn test_wraparound_arithmetic() {
        let (mut cpu, mut bus) = setup();
        cpu.write_reg(1, 0xffff_ffff);
        cpu.write_reg(2, 1);
        load_program(&mut bus, SRAM_BASE, &[add(3, 1, 2)]);
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.read_reg(3), 0);
    }

    #[test]
    fn test_shift_amount_masked_to_5_bits() {
        let (mut cpu, mut bus) = setup();
        cpu.write_reg(1, 0x8000_0000);
        cpu.write_reg(2, 33); // shifts as 1
        load_program(
            &mut bus,
            SRAM_BASE,
            &[enc_rtype(0, 2, 1, 1, 3, OPCODE_OP)], // sll x3, x1, x2
        );
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.read_reg(3), 0);

        cpu.pc = SRAM_BASE;
        cpu.write_reg(1, 1);
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.read_reg(3), 2);
    }

    #[test]
    fn test_divu_charges_divider_cycles() {
        let (mut cpu, mut bus) = setup();
        cpu.write_reg(1, 100);
        cpu.write_reg(2, 7);
        load_program(
            &mut bus,
            SRAM_BASE,
            &[enc_rtype(1, 2, 1, 5, 3, OPCODE_OP)], // divu x3, x1, x2
        );
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.read_reg(3), 14);
        assert_eq!(cpu.cycles, 1 + 17);
    }

    #[test]
    fn test_division_edge_cases() {
        let (mut cpu, mut bus) = setup();
        let program = [
            enc_rtype(1, 2, 1, 4, 3, OPCODE_OP), // div x3, x1, x2
            enc_rtype(1, 2, 1, 6, 4, OPCODE_OP), // rem x4, x1, x2
            enc_rtype(1, 2, 1, 5, 5, OPCODE_OP), // divu x5, x1, x2
            enc_rtype(1, 2, 1, 7, 6, OPCODE_OP), // remu x6, x1, x2
        ];
        load_program(&mut bus, SRAM_BASE, &program);

        // divide by zero
        cpu.write_reg(1, 42);
        cpu.write_reg(2, 0);
        for _ in 0..4 {
            cpu.step(&mut bus).unwrap();
        }
        assert_eq!(cpu.read_reg(3), u32::MAX);
        assert_eq!(cpu.read_reg(4), 42);
        assert_eq!(cpu.read_reg(5), u32::MAX);
        assert_eq!(cpu.read_reg(6), 42);

        // signed overflow
        cpu.pc = SRAM_BASE;
        cpu.write_reg(1, i32::MIN as u32);
        cpu.write_reg(2, (-1i32) as u32);
        cpu.step(&mut bus).unwrap();
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.read_reg(3), i32::MIN as u32);
        assert_eq!(cpu.read_reg(4), 0);
    }

    #[test]
    fn test_backward_branch_predictor_costs() {
        let (mut cpu, mut bus) = setup();
        // x1 = 3; loop: addi x1, x1, -1; bne x1, x0, -4
        let program = [
            enc_itype(-1, 1, 0, 1, OPCODE_OP_IMM),
            enc_btype(-4, 0, 1, 1, OPCODE_BRANCH),
        ];
        load_program(&mut bus, SRAM_BASE, &program);
        cpu.write_reg(1, 3);

        // first taken backward branch: unpredicted, +1
        cpu.step(&mut bus).unwrap(); // addi
        cpu.step(&mut bus).unwrap(); // bne taken
        assert_eq!(cpu.cycles, 3);

        // second pass: predicted, free
        cpu.step(&mut bus).unwrap();
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.cycles, 5);

        // final pass: branch falls through, prediction fails, +1
        cpu.step(&mut bus).unwrap();
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.cycles, 8);
        assert_eq!(cpu.read_reg(1), 0);
    }

    #[test]
    fn test_jal_jalr_cost_and_link() {
        let (mut cpu, mut bus) = setup();
        load_program(&mut bus, SRAM_BASE, &[enc_jtype(8, 1, OPCODE_JAL)]);
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.read_reg(1), SRAM_BASE + 4);
        assert_eq!(cpu.pc, SRAM_BASE + 8);
        assert_eq!(cpu.cycles, 2);

        // jalr x0, x1, 1 - target bit 0 cleared
        load_program(
            &mut bus,
            SRAM_BASE + 8,
            &[enc_itype(1, 1, 0, 0, OPCODE_JALR)],
        );
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.pc, SRAM_BASE + 4);
    }

    #[test]
    fn test_loads_and_stores() {
        let (mut cpu, mut bus) = setup();
        let program = [
            enc_stype(0, 2, 1, 2, 0x23),  // sw x2, 0(x1)
            enc_itype(0, 1, 0, 3, 0x03),  // lb x3, 0(x1)
            enc_itype(0, 1, 4, 4, 0x03),  // lbu x4, 0(x1)
            enc_itype(0, 1, 1, 5, 0x03),  // lh x5, 0(x1)
            enc_itype(0, 1, 5, 6, 0x03),  // lhu x6, 0(x1)
            enc_itype(0, 1, 2, 7, 0x03),  // lw x7, 0(x1)
        ];
        load_program(&mut bus, SRAM_BASE, &program);
        cpu.write_reg(1, SRAM_BASE + 0x100);
        cpu.write_reg(2, 0x8000_80f0);
        for _ in 0..6 {
            cpu.step(&mut bus).unwrap();
        }
        assert_eq!(cpu.read_reg(3), 0xffff_fff0); // sign-extended byte
        assert_eq!(cpu.read_reg(4), 0xf0);
        assert_eq!(cpu.read_reg(5), 0xffff_80f0); // sign-extended half
        assert_eq!(cpu.read_reg(6), 0x80f0);
        assert_eq!(cpu.read_reg(7), 0x8000_80f0);
    }

    #[test]
    fn test_bitmanip_ops() {
        let (mut cpu, mut bus) = setup();
        let program = [
            enc_itype(0x601, 1, 1, 3, OPCODE_OP_IMM),       // ctz
            enc_itype(0x602, 1, 1, 4, OPCODE_OP_IMM),       // cpop
            enc_itype(0x698, 1, 5, 5, OPCODE_OP_IMM),       // rev8
            enc_rtype(0x20, 2, 1, 7, 6, OPCODE_OP),         // andn
            enc_rtype(0x05, 2, 1, 6, 7, OPCODE_OP),         // max
            enc_rtype(0x10, 2, 1, 2, 8, OPCODE_OP),         // sh1add
            enc_rtype(0x04, 2, 1, 4, 9, OPCODE_OP),         // pack
            enc_rtype(0x04, 2, 1, 7, 10, OPCODE_OP),        // packh
            enc_itype(0x289, 1, 1, 11, OPCODE_OP_IMM),      // bseti 9
            enc_itype(0x489, 1, 5, 12, OPCODE_OP_IMM),      // bexti 9
        ];
        load_program(&mut bus, SRAM_BASE, &program);
        cpu.write_reg(1, 0x0000_ff00);
        cpu.write_reg(2, 0x0000_0ff0);
        for _ in 0..program.len() {
            cpu.step(&mut bus).unwrap();
        }
        assert_eq!(cpu.read_reg(3), 8); // ctz(0xff00)
        assert_eq!(cpu.read_reg(4), 8); // cpop
        assert_eq!(cpu.read_reg(5), 0x00ff_0000); // rev8
        assert_eq!(cpu.read_reg(6), 0x0000_f000); // andn
        assert_eq!(cpu.read_reg(7), 0x0000_ff00); // max
        assert_eq!(cpu.read_reg(8), 0x0002_0df0); // sh1add
        assert_eq!(cpu.read_reg(9), 0x0ff0_ff00); // pack
        assert_eq!(cpu.read_reg(10), 0x0000_f000); // packh
        assert_eq!(cpu.read_reg(11), 0x0000_ff00 | 0x200); // bseti
        assert_eq!(cpu.read_reg(12), 1); // bexti
    }

    #[test]
    fn test_sext_forms() {
        let (mut cpu, mut bus) = setup();
        let program = [
            enc_itype(0x604, 1, 1, 3, OPCODE_OP_IMM), // sext.b
            enc_itype(0x605, 1, 1, 4, OPCODE_OP_IMM), // sext.h
        ];
        load_program(&mut bus, SRAM_BASE, &program);
        cpu.write_reg(1, 0x0001_8380);
        cpu.step(&mut bus).unwrap();
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.read_reg(3), 0xffff_ff80);
        assert_eq!(cpu.read_reg(4), 0xffff_8380);
    }

    #[test]
    fn test_unmatched_op_pattern_faults() {
        let (mut cpu, mut bus) = setup();
        // funct7 = 0x7f under OP is not a defined instruction
        load_program(&mut bus, SRAM_BASE, &[enc_rtype(0x7f, 2, 1, 0, 3, OPCODE_OP)]);
        let err = cpu.step(&mut bus).unwrap_err();
        assert!(matches!(err, Fault::IllegalInstruction { .. }));
    }

    #[test]
    fn test_unknown_opcode_faults() {
        let (mut cpu, mut bus) = setup();
        load_program(&mut bus, SRAM_BASE, &[0x0000_005b]);
        assert!(matches!(
            cpu.step(&mut bus),
            Err(Fault::IllegalInstruction { insn: 0x5b, .. })
        ));
    }

    #[test]
    fn test_amoor_w() {
        let (mut cpu, mut bus) = setup();
        bus.write_u32(SRAM_BASE + 0x40, 0x0f);
        cpu.write_reg(1, SRAM_BASE + 0x40);
        cpu.write_reg(2, 0xf0);
        // amoor.w x3, x2, (x1)
        load_program(
            &mut bus,
            SRAM_BASE,
            &[enc_rtype(0b01000 << 2, 2, 1, 2, 3, 0x2f)],
        );
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.read_reg(3), 0x0f);
        assert_eq!(bus.read_u32(SRAM_BASE + 0x40), 0xff);
        assert_eq!(cpu.cycles, 1 + 3);

        // any other AMO faults
        cpu.pc = SRAM_BASE;
        load_program(
            &mut bus,
            SRAM_BASE,
            &[enc_rtype(0b00001 << 2, 2, 1, 2, 3, 0x2f)], // amoswap.w
        );
        assert!(cpu.step(&mut bus).is_err());
    }

    #[test]
    fn test_compressed_execution() {
        let (mut cpu, mut bus) = setup();
        // c.li a2, 0x1f (rd=12, imm=31): funct3=010 op=01
        bus.write_u16(SRAM_BASE, 0x467d);
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.read_reg(12), 31);
        assert_eq!(cpu.pc, SRAM_BASE + 2);
        assert_eq!(cpu.cycles, 1);
    }

    #[test]
    fn test_ecall_and_mret() {
        let (mut cpu, mut bus) = setup();
        let handler = SRAM_BASE + 0x100;
        cpu.csr_write(CSR_MTVEC, handler);
        cpu.csr_write(CSR_MSTATUS, MSTATUS_MIE);
        load_program(&mut bus, SRAM_BASE, &[enc_itype(0, 0, 0, 0, OPCODE_SYSTEM)]);
        // handler: mret
        load_program(&mut bus, handler, &[enc_itype(0x302, 0, 0, 0, OPCODE_SYSTEM)]);

        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.pc, handler);
        assert_eq!(cpu.csr_read(CSR_MCAUSE), 11);
        assert_eq!(cpu.csr_read(CSR_MEPC), SRAM_BASE);
        // MIE stashed into MPIE, cleared in MSTATUS
        assert_eq!(cpu.csr_read(CSR_MSTATUS) & MSTATUS_MIE, 0);
        assert_eq!(cpu.cycles, 3); // 1 + trap entry surcharge

        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.pc, SRAM_BASE); // back at the ecall
        assert_eq!(cpu.csr_read(CSR_MSTATUS) & MSTATUS_MIE, MSTATUS_MIE);
    }

    #[test]
    fn test_block_until_event_and_send_event() {
        let (mut cpu, mut bus) = setup();
        // slt x0, x0, x0 (block)
        load_program(&mut bus, SRAM_BASE, &[enc_rtype(0, 0, 0, 2, 0, OPCODE_OP)]);
        cpu.step(&mut bus).unwrap();
        assert!(cpu.waiting);
        let pc_after = cpu.pc;

        // waiting core burns a cycle without advancing
        let cycles = cpu.cycles;
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.pc, pc_after);
        assert_eq!(cpu.cycles, cycles + 1);

        // an event wakes it; a second block consumes a registered event
        cpu.deliver_event();
        assert!(!cpu.waiting);
        cpu.deliver_event();
        assert!(cpu.event_registered);
        cpu.pc = SRAM_BASE;
        cpu.step(&mut bus).unwrap();
        assert!(!cpu.waiting);
        assert!(!cpu.event_registered);

        // slt x0, x0, x1 (send event) raises the chip-visible flag
        load_program(&mut bus, SRAM_BASE, &[enc_rtype(0, 1, 0, 2, 0, OPCODE_OP)]);
        cpu.pc = SRAM_BASE;
        cpu.step(&mut bus).unwrap();
        assert!(cpu.take_sev());
        assert!(!cpu.take_sev());
    }

    fn arm_interrupt(cpu: &mut Cpu, irq: u16, priority: u8) {
        // enable the line, give it a priority, open both gates
        cpu.csr_access(
            CSR_MEIEA,
            CsrOp::Set,
            (1u32 << (16 + irq % 16)) | (irq as u32 / 16),
            true,
        );
        let window = irq as u32 / 4;
        let shift = 16 + 4 * (irq % 4);
        cpu.csr_access(CSR_MEIPRA, CsrOp::Set, ((priority as u32) << shift) | window, true);
        cpu.csr_write(CSR_MIE, 1 << 11);
        cpu.csr_write(CSR_MSTATUS, MSTATUS_MIE);
    }

    #[test]
    fn test_external_interrupt_entry_and_return() {
        let (mut cpu, mut bus) = setup();
        let vector_base = SRAM_BASE + 0x200;
        cpu.csr_write(CSR_MTVEC, vector_base | 1); // vectored
        arm_interrupt(&mut cpu, 5, 3);
        load_program(&mut bus, SRAM_BASE, &[add(3, 1, 2)]);
        // external interrupt vector slot: cause 11
        let handler = vector_base + (11 << 2);
        load_program(&mut bus, handler, &[enc_itype(0x302, 0, 0, 0, OPCODE_SYSTEM)]);

        cpu.set_interrupt(5, true);
        let cycles_before = cpu.cycles;

        // first step: trap entry redirects to the vector slot for cause 11
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.pc, handler);
        assert_eq!(cpu.csr_read(CSR_MEPC), SRAM_BASE);
        assert_eq!(cpu.csr_read(CSR_MCAUSE), 0x8000_000b);
        assert_eq!(cpu.cycles, cycles_before + 2);
        assert_eq!(cpu.irq_controller().preempt, 3);

        // second step: the handler's mret returns to the interrupted PC
        // and pops the preemption context
        cpu.set_interrupt(5, false);
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.pc, SRAM_BASE);
        assert_eq!(cpu.cycles, cycles_before + 3);
        assert_eq!(cpu.irq_controller().preempt, 0);
    }

    #[test]
    fn test_equal_priority_does_not_preempt() {
        let (mut cpu, mut bus) = setup();
        cpu.csr_write(CSR_MTVEC, SRAM_BASE + 0x200);
        arm_interrupt(&mut cpu, 7, 4);
        // current preemption level equals the candidate priority
        cpu.csr_write(CSR_MEICONTEXT, 4);
        load_program(&mut bus, SRAM_BASE, &[add(3, 1, 2)]);

        cpu.set_interrupt(7, true);
        cpu.step(&mut bus).unwrap();

        // no trap: the add executed
        assert_eq!(cpu.pc, SRAM_BASE + 4);
        // but the line is visible in the next-IRQ register (>= check)
        assert_eq!(cpu.csr_read(CSR_MEINEXT), 7 << 2);

        // drop visibility below the line's priority and it vanishes
        cpu.csr_write(CSR_MEICONTEXT, 5);
        assert_eq!(cpu.csr_read(CSR_MEINEXT), 0xffff_ffff);
    }

    #[test]
    fn test_masked_interrupt_does_not_fire() {
        let (mut cpu, mut bus) = setup();
        cpu.csr_write(CSR_MTVEC, SRAM_BASE + 0x200);
        arm_interrupt(&mut cpu, 9, 2);
        cpu.csr_write(CSR_MSTATUS, 0); // global disable
        load_program(&mut bus, SRAM_BASE, &[add(3, 1, 2)]);

        cpu.set_interrupt(9, true);
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.pc, SRAM_BASE + 4);

        // re-enabling the global bit lets it fire
        cpu.csr_write(CSR_MSTATUS, MSTATUS_MIE);
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.csr_read(CSR_MCAUSE), 0x8000_000b);
    }

    #[test]
    fn test_wfi_wakes_on_interrupt() {
        let (mut cpu, mut bus) = setup();
        cpu.csr_write(CSR_MTVEC, SRAM_BASE + 0x200);
        arm_interrupt(&mut cpu, 3, 1);
        cpu.csr_write(CSR_MSTATUS, 0); // keep traps off; wfi still wakes
        load_program(
            &mut bus,
            SRAM_BASE,
            &[
                enc_itype(0x105, 0, 0, 0, OPCODE_SYSTEM), // wfi
                enc_itype(0, 0, 0, 0, OPCODE_OP_IMM),     // nop
            ],
        );

        cpu.step(&mut bus).unwrap();
        assert!(cpu.waiting);

        // an enabled, visible line wakes the core; with the global enable
        // off it resumes at the next instruction instead of trapping
        cpu.set_interrupt(3, true);
        cpu.step(&mut bus).unwrap();
        assert!(!cpu.waiting);
        assert_eq!(cpu.pc, SRAM_BASE + 8);
    }

    #[test]
    fn test_csr_write_elision_preserves_side_effects() {
        let (mut cpu, mut bus) = setup();
        cpu.csr_write(CSR_MEPC, 0x2000_0040);
        // csrrs x5, mepc, x0 reads without writing
        load_program(
            &mut bus,
            SRAM_BASE,
            &[enc_itype(CSR_MEPC as i32, 0, 2, 5, OPCODE_SYSTEM)],
        );
        cpu.step(&mut bus).unwrap();
        assert_eq!(cpu.read_reg(5), 0x2000_0040);
        assert_eq!(cpu.csr_read(CSR_MEPC), 0x2000_0040);
    }
}
