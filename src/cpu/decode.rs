//! Instruction word classification and field extraction.
//!
//! A fetched (and, for RVC, already expanded) 32-bit word is classified
//! into one of the six base formats by its opcode; the immediate accessor
//! reassembles the per-format bit splices before sign extension.

use crate::bitfield::{get_range, sign_extend};

pub const OPCODE_LOAD: u32 = 0x03;
pub const OPCODE_MISC_MEM: u32 = 0x0f;
pub const OPCODE_OP_IMM: u32 = 0x13;
pub const OPCODE_AUIPC: u32 = 0x17;
pub const OPCODE_STORE: u32 = 0x23;
pub const OPCODE_AMO: u32 = 0x2f;
pub const OPCODE_OP: u32 = 0x33;
pub const OPCODE_LUI: u32 = 0x37;
pub const OPCODE_BRANCH: u32 = 0x63;
pub const OPCODE_JALR: u32 = 0x67;
pub const OPCODE_JAL: u32 = 0x6f;
pub const OPCODE_SYSTEM: u32 = 0x73;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    R,
    I,
    S,
    B,
    U,
    J,
}

/// Fixed opcode-to-format classification.
pub fn opcode_format(opcode: u32) -> Option<Format> {
    match opcode {
        OPCODE_LOAD | OPCODE_OP_IMM | OPCODE_MISC_MEM | OPCODE_JALR | OPCODE_SYSTEM => {
            Some(Format::I)
        }
        OPCODE_STORE => Some(Format::S),
        OPCODE_OP | OPCODE_AMO => Some(Format::R),
        OPCODE_LUI | OPCODE_AUIPC => Some(Format::U),
        OPCODE_BRANCH => Some(Format::B),
        OPCODE_JAL => Some(Format::J),
        _ => None,
    }
}

/// A classified instruction word with typed field accessors.
#[derive(Debug, Clone, Copy)]
pub struct Instr {
    pub word: u32,
    pub format: Format,
}

impl Instr {
    /// Classify a 32-bit word. `None` means the opcode is not part of the
    /// supported instruction set (a decode fault for the caller).
    pub fn decode(word: u32) -> Option<Instr> {
        let format = opcode_format(get_range(word, 6, 0))?;
        Some(Instr { word, format })
    }

    #[inline]
    pub fn opcode(&self) -> u32 {
        get_range(self.word, 6, 0)
    }

    #[inline]
    pub fn rd(&self) -> u32 {
        get_range(self.word, 11, 7)
    }

    #[inline]
    pub fn rs1(&self) -> u32 {
        get_range(self.word, 19, 15)
    }

    #[inline]
    pub fn rs2(&self) -> u32 {
        get_range(self.word, 24, 20)
    }

    #[inline]
    pub fn funct3(&self) -> u32 {
        get_range(self.word, 14, 12)
    }

    #[inline]
    pub fn funct7(&self) -> u32 {
        get_range(self.word, 31, 25)
    }

    /// Shift amount field (I-format shifts), bits 24:20.
    #[inline]
    pub fn shamt(&self) -> u32 {
        get_range(self.word, 24, 20)
    }

    /// Unsigned immediate: the raw 12-bit field for I-format (also the CSR
    /// number for SYSTEM), the raw upper-20 value for U-format.
    pub fn imm_u(&self) -> u32 {
        match self.format {
            Format::U => self.word & 0xffff_f000,
            _ => get_range(self.word, 31, 20),
        }
    }

    /// Signed immediate, reassembled and sign-extended per format.
    /// R-format has no immediate and yields 0.
    pub fn imm(&self) -> i32 {
        let w = self.word;
        let value = match self.format {
            Format::R => 0,
            Format::I => sign_extend(get_range(w, 31, 20), 12),
            Format::S => {
                let imm = (get_range(w, 31, 25) << 5) | get_range(w, 11, 7);
                sign_extend(imm, 12)
            }
            Format::B => {
                let imm = (get_range(w, 31, 31) << 12)
                    | (get_range(w, 7, 7) << 11)
                    | (get_range(w, 30, 25) << 5)
                    | (get_range(w, 11, 8) << 1);
                sign_extend(imm, 13)
            }
            Format::U => w & 0xffff_f000,
            Format::J => {
                let imm = (get_range(w, 31, 31) << 20)
                    | (get_range(w, 19, 12) << 12)
                    | (get_range(w, 20, 20) << 11)
                    | (get_range(w, 30, 21) << 1);
                sign_extend(imm, 21)
            }
        };
        value as i32
    }
}
