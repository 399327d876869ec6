//! RVC decompressor: expands every 16-bit compressed encoding into the
//! equivalent 32-bit instruction word before decode.
//!
//! Dispatch is a 24-slot table indexed by `(op[1:0] << 3) | funct3`, one
//! row per compressed opcode quadrant (00, 01, 10; `11` means the word is
//! already a full 32-bit instruction and never reaches this module).
//! Reserved slots and reserved operand patterns fault; HINT encodings
//! (zero immediate or x0 destination) expand to the canonical `nop`.

use crate::bitfield::sign_extend;
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("reserved compressed encoding {0:#06x}")]
pub struct ReservedEncoding(pub u16);

type Decoder = fn(u32) -> Result<u32, ReservedEncoding>;

#[rustfmt::skip]
const DECODERS: [Option<Decoder>; 24] = [
//  000                      001                010                011                 100                 101               110                 111
    Some(caddi4spn_to_addi), None,              Some(clw_to_lw),   None,               Some(zcb_100_00),   None,             Some(csw_to_sw),    None,               // 00
    Some(caddi_to_addi),     Some(cjal_to_jal), Some(cli_to_addi), Some(parse_011_01), Some(parse_100_01), Some(cj_to_jal),  Some(cbeqz_to_beq), Some(cbnez_to_bne), // 01
    Some(cslli_to_slli),     None,              Some(clwsp_to_lw), None,               Some(parse_100_10), None,             Some(cswsp_to_sw),  None,               // 10
];

/// Expand a 16-bit word whose low two bits are not `11`.
pub fn decompress(inst: u16) -> Result<u32, ReservedEncoding> {
    debug_assert!(inst & 0b11 != 0b11);
    let index = (((inst & 0x0003) << 3) | ((inst & 0xe000) >> 13)) as usize;
    match DECODERS.get(index).copied().flatten() {
        Some(decoder) => decoder(inst as u32),
        None => Err(ReservedEncoding(inst)),
    }
}

// C.ADDI4SPN, funct3 = 000, opcode = 00
fn caddi4spn_to_addi(inst: u32) -> Result<u32, ReservedEncoding> {
    let nzuimm = dec_ciw_imm(inst);
    let rd = dec_rd_short(inst);

    // nzuimm = 0 is reserved; this also catches the all-zero halfword
    if nzuimm == 0 {
        return Err(ReservedEncoding(inst as u16));
    }

    // addi rd', x2, nzuimm[9:2]
    Ok(enc_itype(nzuimm as i32, 2, 0b000, rd, 0b0010011))
}

// C.LW, funct3 = 010, opcode = 00
fn clw_to_lw(inst: u32) -> Result<u32, ReservedEncoding> {
    let imm = dec_clw_csw_imm(inst);
    let rs1 = dec_rs1_short(inst);
    let rd = dec_rd_short(inst);

    // lw rd', offset[6:2](rs1')
    Ok(enc_itype(imm as i32, rs1, 0b010, rd, 0b0000011))
}

// Zcb loads, funct3 = 100, opcode = 00
fn zcb_100_00(inst: u32) -> Result<u32, ReservedEncoding> {
    if (inst & 0b1111110001000011) == 0b1000010000000000 {
        // c.lhu
        let uimm = ((inst >> 5) & 1) << 1;
        let rs1 = dec_rs1_short(inst);
        let rd = dec_rd_short(inst);

        // lhu rd', uimm(rs1')
        Ok(enc_itype(uimm as i32, rs1, 0b101, rd, 0b0000011))
    } else if (inst & 0b1111110000000011) == 0b1000000000000000 {
        // c.lbu
        let uimm = (((inst >> 5) & 1) << 1) | ((inst >> 6) & 1);
        let rs1 = dec_rs1_short(inst);
        let rd = dec_rd_short(inst);

        // lbu rd', uimm(rs1')
        Ok(enc_itype(uimm as i32, rs1, 0b100, rd, 0b0000011))
    } else {
        Err(ReservedEncoding(inst as u16))
    }
}

// C.SW, funct3 = 110, opcode = 00
fn csw_to_sw(inst: u32) -> Result<u32, ReservedEncoding> {
    let imm = dec_clw_csw_imm(inst);
    let rs1 = dec_rs1_short(inst);
    let rs2 = dec_rs2_short(inst);

    // sw rs2', offset[6:2](rs1')
    Ok(enc_stype(imm as i32, rs2, rs1, 0b010, 0b0100011))
}

fn cnop_to_addi() -> Result<u32, ReservedEncoding> {
    // addi x0, x0, 0
    Ok(enc_itype(0, 0, 0b000, 0, 0b0010011))
}

// C.ADDI, funct3 = 000, opcode = 01
fn caddi_to_addi(inst: u32) -> Result<u32, ReservedEncoding> {
    let rd = dec_rd(inst);
    let mut nzimm = 0;
    nzimm |= (inst & CI_MASK_12) >> 7;
    nzimm |= (inst & (CI_MASK_6_4 | CI_MASK_3_2)) >> 2;
    let nzimm = sign_extend(nzimm, 6) as i32;

    // nzimm = 0 is a HINT, implemented as nop
    if nzimm == 0 {
        return cnop_to_addi();
    }

    // addi rd, rd, nzimm[5:0]
    Ok(enc_itype(nzimm, rd, 0b000, rd, 0b0010011))
}

// C.JAL, funct3 = 001, opcode = 01
fn cjal_to_jal(inst: u32) -> Result<u32, ReservedEncoding> {
    let imm = dec_cj_imm(inst);

    // jal x1, offset[11:1]
    Ok(enc_jtype(imm, 1, 0b1101111))
}

// C.LI, funct3 = 010, opcode = 01
fn cli_to_addi(inst: u32) -> Result<u32, ReservedEncoding> {
    let rd = dec_rd(inst);
    let mut imm = 0;
    imm |= (inst & CI_MASK_12) >> 7;
    imm |= (inst & (CI_MASK_6_4 | CI_MASK_3_2)) >> 2;
    let imm = sign_extend(imm, 6) as i32;

    // rd = 0 is a HINT, implemented as nop
    if rd == 0 {
        return cnop_to_addi();
    }

    // addi rd, x0, imm[5:0]
    Ok(enc_itype(imm, 0, 0b000, rd, 0b0010011))
}

// C.ADDI16SP, funct3 = 011, opcode = 01, rd = 2
fn caddi16sp_to_addi(inst: u32) -> Result<u32, ReservedEncoding> {
    let mut nzimm = 0;
    nzimm |= (inst & 0x1000) >> 3;
    nzimm |= (inst & 0x0018) << 4;
    nzimm |= (inst & 0x0020) << 1;
    nzimm |= (inst & 0x0004) << 3;
    nzimm |= (inst & 0x0040) >> 2;
    let nzimm = sign_extend(nzimm, 10) as i32;

    // addi x2, x2, nzimm[9:4]
    Ok(enc_itype(nzimm, 2, 0b000, 2, 0b0010011))
}

// C.LUI, funct3 = 011, opcode = 01
fn clui_to_lui(inst: u32) -> Result<u32, ReservedEncoding> {
    let rd = dec_rd(inst);
    let mut nzimm = 0;
    nzimm |= (inst & CI_MASK_12) << 5;
    nzimm |= (inst & (CI_MASK_6_4 | CI_MASK_3_2)) << 10;
    let nzimm = sign_extend(nzimm, 18) as i32;

    // rd = 0 is a HINT, implemented as nop
    if rd == 0 {
        return cnop_to_addi();
    }

    // lui rd, nzuimm[17:12]
    Ok(enc_utype(nzimm, rd, 0b0110111))
}

fn csrli_to_srli(inst: u32) -> Result<u32, ReservedEncoding> {
    // shamt[5] (bit 12) must be zero for RV32C
    let shamt = (inst & (CI_MASK_6_4 | CI_MASK_3_2)) >> 2;
    let rd = dec_rs1_short(inst);

    // srli rd', rd', shamt[4:0]
    Ok(enc_rtype(0b0000000, shamt, rd, 0b101, rd, 0b0010011))
}

fn csrai_to_srai(inst: u32) -> Result<u32, ReservedEncoding> {
    let shamt = (inst & (CI_MASK_6_4 | CI_MASK_3_2)) >> 2;
    let rd = dec_rs1_short(inst);

    // srai rd', rd', shamt[4:0]
    Ok(enc_rtype(0b0100000, shamt, rd, 0b101, rd, 0b0010011))
}

fn candi_to_andi(inst: u32) -> Result<u32, ReservedEncoding> {
    let rd = dec_rs1_short(inst);
    let mut imm = 0;
    imm |= (inst & CI_MASK_12) >> 7;
    imm |= (inst & (CI_MASK_6_4 | CI_MASK_3_2)) >> 2;
    let imm = sign_extend(imm, 6) as i32;

    // andi rd', rd', imm[5:0]
    Ok(enc_itype(imm, rd, 0b111, rd, 0b0010011))
}

fn csub_to_sub(inst: u32) -> Result<u32, ReservedEncoding> {
    let rd = dec_rs1_short(inst);
    let rs2 = dec_rs2_short(inst);
    Ok(enc_rtype(0b0100000, rs2, rd, 0b000, rd, 0b0110011))
}

fn cxor_to_xor(inst: u32) -> Result<u32, ReservedEncoding> {
    let rd = dec_rs1_short(inst);
    let rs2 = dec_rs2_short(inst);
    Ok(enc_rtype(0b0000000, rs2, rd, 0b100, rd, 0b0110011))
}

fn cor_to_or(inst: u32) -> Result<u32, ReservedEncoding> {
    let rd = dec_rs1_short(inst);
    let rs2 = dec_rs2_short(inst);
    Ok(enc_rtype(0b0000000, rs2, rd, 0b110, rd, 0b0110011))
}

fn cand_to_and(inst: u32) -> Result<u32, ReservedEncoding> {
    let rd = dec_rs1_short(inst);
    let rs2 = dec_rs2_short(inst);
    Ok(enc_rtype(0b0000000, rs2, rd, 0b111, rd, 0b0110011))
}

// C.J, funct3 = 101, opcode = 01
fn cj_to_jal(inst: u32) -> Result<u32, ReservedEncoding> {
    let imm = dec_cj_imm(inst);

    // jal x0, offset[11:1]
    Ok(enc_jtype(imm, 0, 0b1101111))
}

// C.BEQZ, funct3 = 110, opcode = 01
fn cbeqz_to_beq(inst: u32) -> Result<u32, ReservedEncoding> {
    let offset = dec_branch_imm(inst);
    let rs1 = dec_rs1_short(inst);

    // beq rs1', x0, offset[8:1]
    Ok(enc_btype(offset, 0, rs1, 0b000, 0b1100011))
}

// C.BNEZ, funct3 = 111, opcode = 01
fn cbnez_to_bne(inst: u32) -> Result<u32, ReservedEncoding> {
    let offset = dec_branch_imm(inst);
    let rs1 = dec_rs1_short(inst);

    // bne rs1', x0, offset[8:1]
    Ok(enc_btype(offset, 0, rs1, 0b001, 0b1100011))
}

// C.SLLI, funct3 = 000, opcode = 10
fn cslli_to_slli(inst: u32) -> Result<u32, ReservedEncoding> {
    // shamt[5] (bit 12) must be zero for RV32C
    let shamt = (inst & (CI_MASK_6_4 | CI_MASK_3_2)) >> 2;
    let rd = dec_rd(inst);

    // rd = 0 is a HINT, implemented as nop
    if rd == 0 {
        return cnop_to_addi();
    }

    // slli rd, rd, shamt[4:0]
    Ok(enc_rtype(0b0000000, shamt, rd, 0b001, rd, 0b0010011))
}

// C.LWSP, funct3 = 010, opcode = 10
fn clwsp_to_lw(inst: u32) -> Result<u32, ReservedEncoding> {
    let mut offset = 0;
    offset |= (inst & CI_MASK_12) >> 7;
    offset |= (inst & CI_MASK_6_4) >> 2;
    offset |= (inst & CI_MASK_3_2) << 4;
    let rd = dec_rd(inst);

    // lw rd, offset[7:2](x2)
    Ok(enc_itype(offset as i32, 2, 0b010, rd, 0b0000011))
}

fn cjr_to_jalr(inst: u32) -> Result<u32, ReservedEncoding> {
    let rs1 = dec_rs1(inst);

    // jalr x0, rs1, 0
    Ok(enc_itype(0, rs1, 0b000, 0, 0b1100111))
}

fn cmv_to_add(inst: u32) -> Result<u32, ReservedEncoding> {
    let rs2 = dec_rs2(inst);
    let rd = dec_rd(inst);

    // rd = 0 is a HINT, implemented as nop
    if rd == 0 {
        return cnop_to_addi();
    }

    // add rd, x0, rs2
    Ok(enc_rtype(0b0000000, rs2, 0, 0b000, rd, 0b0110011))
}

fn cebreak_to_ebreak() -> Result<u32, ReservedEncoding> {
    Ok(enc_itype(1, 0, 0b000, 0, 0b1110011))
}

fn cjalr_to_jalr(inst: u32) -> Result<u32, ReservedEncoding> {
    let rs1 = dec_rs1(inst);

    // jalr x1, rs1, 0
    Ok(enc_itype(0, rs1, 0b000, 1, 0b1100111))
}

fn cadd_to_add(inst: u32) -> Result<u32, ReservedEncoding> {
    let rs2 = dec_rs2(inst);
    let rd = dec_rd(inst);

    // rd = 0 is a HINT, implemented as nop
    if rd == 0 {
        return cnop_to_addi();
    }

    // add rd, rd, rs2
    Ok(enc_rtype(0b0000000, rs2, rd, 0b000, rd, 0b0110011))
}

// C.SWSP, funct3 = 110, opcode = 10
fn cswsp_to_sw(inst: u32) -> Result<u32, ReservedEncoding> {
    let offset = dec_css_imm(inst);
    let rs2 = dec_rs2(inst);

    // sw rs2, offset[7:2](x2)
    Ok(enc_stype(offset as i32, rs2, 2, 0b010, 0b0100011))
}

// funct3 = 011, opcode = 01: C.ADDI16SP when rd = 2, else C.LUI
fn parse_011_01(inst: u32) -> Result<u32, ReservedEncoding> {
    if dec_rd(inst) == 2 {
        caddi16sp_to_addi(inst)
    } else {
        clui_to_lui(inst)
    }
}

// funct3 = 100, opcode = 01: shifts/andi plus the register-register group
fn parse_100_01(inst: u32) -> Result<u32, ReservedEncoding> {
    let cb_funct2 = dec_cb_funct2(inst);
    let cs_funct6_3_funct2 = (((dec_cs_funct6(inst) >> 2) & 1) << 2) | dec_cs_funct2(inst);

    match cb_funct2 {
        0b00 => csrli_to_srli(inst),
        0b01 => csrai_to_srai(inst),
        0b10 => candi_to_andi(inst),
        _ => match cs_funct6_3_funct2 {
            0b000 => csub_to_sub(inst),
            0b001 => cxor_to_xor(inst),
            0b010 => cor_to_or(inst),
            0b011 => cand_to_and(inst),
            0b111 if (inst & 0b1111110001111111) == 0b1001110001110101 => {
                // c.not (Zcb): xori rd', rd', -1
                let rd = dec_rs1_short(inst);
                Ok(enc_itype(-1, rd, 0b100, rd, 0b0010011))
            }
            _ => Err(ReservedEncoding(inst as u16)),
        },
    }
}

// funct3 = 100, opcode = 10: jr/mv group (bit 12 clear) or
// ebreak/jalr/add group (bit 12 set)
fn parse_100_10(inst: u32) -> Result<u32, ReservedEncoding> {
    let rs1 = dec_rs1(inst);
    let rs2 = dec_rs2(inst);

    if inst & 0x1000 == 0 {
        if rs2 == 0 {
            cjr_to_jalr(inst)
        } else {
            cmv_to_add(inst)
        }
    } else if rs1 == 0 && rs2 == 0 {
        cebreak_to_ebreak()
    } else if rs2 == 0 {
        cjalr_to_jalr(inst)
    } else {
        cadd_to_add(inst)
    }
}

//                       ....xxxx....xxxx
const C_RD: u32 = 0b0000111110000000;
const C_RS1: u32 = 0b0000111110000000;
const C_RS2: u32 = 0b0000000001111100;
const C_RD_S: u32 = 0b0000000000011100;
const C_RS1_S: u32 = 0b0000001110000000;
const C_RS2_S: u32 = 0b0000000000011100;
//                          ....xxxx....xxxx
const CI_MASK_12: u32 = 0b0001000000000000;
const CI_MASK_6_4: u32 = 0b0000000001110000;
const CI_MASK_3_2: u32 = 0b0000000000001100;
//                           ....xxxx....xxxx
const CSS_IMM_5_2: u32 = 0b0001111000000000;
const CSS_IMM_7_6: u32 = 0b0000000110000000;
//                           ....xxxx....xxxx
const CIW_IMM_5_4: u32 = 0b0001100000000000;
const CIW_IMM_9_6: u32 = 0b0000011110000000;
const CIW_IMM_2: u32 = 0b0000000001000000;
const CIW_IMM_3: u32 = 0b0000000000100000;
//                             ....xxxx....xxxx
const CLWSW_IMM_5_3: u32 = 0b0001110000000000;
const CLWSW_IMM_2: u32 = 0b0000000001000000;
const CLWSW_IMM_6: u32 = 0b0000000000100000;
//                          ....xxxx....xxxx
const CS_FUNCT6: u32 = 0b1111110000000000;
const CS_FUNCT2: u32 = 0b0000000001100000;
const CB_FUNCT2: u32 = 0b0000110000000000;
//                            ....xxxx....xxxx
const CB_OFFSET_8: u32 = 0b0001000000000000;
const CB_OFFSET_4_3: u32 = 0b0000110000000000;
const CB_OFFSET_7_6: u32 = 0b0000000001100000;
const CB_OFFSET_2_1: u32 = 0b0000000000011000;
const CB_OFFSET_5: u32 = 0b0000000000000100;
//                            ....xxxx....xxxx
const CJ_OFFSET_11: u32 = 0b0001000000000000;
const CJ_OFFSET_4: u32 = 0b0000100000000000;
const CJ_OFFSET_9_8: u32 = 0b0000011000000000;
const CJ_OFFSET_10: u32 = 0b0000000100000000;
const CJ_OFFSET_6: u32 = 0b0000000010000000;
const CJ_OFFSET_7: u32 = 0b0000000001000000;
const CJ_OFFSET_3_1: u32 = 0b0000000000111000;
const CJ_OFFSET_5: u32 = 0b0000000000000100;

fn dec_rd(inst: u32) -> u32 {
    (inst & C_RD) >> 7
}

fn dec_rs1(inst: u32) -> u32 {
    (inst & C_RS1) >> 7
}

fn dec_rs2(inst: u32) -> u32 {
    (inst & C_RS2) >> 2
}

// rd'/rs1'/rs2' address the x8..x15 register window
fn dec_rd_short(inst: u32) -> u32 {
    ((inst & C_RD_S) >> 2) | 0b1000
}

fn dec_rs1_short(inst: u32) -> u32 {
    ((inst & C_RS1_S) >> 7) | 0b1000
}

fn dec_rs2_short(inst: u32) -> u32 {
    ((inst & C_RS2_S) >> 2) | 0b1000
}

// CSS-format immediate: zero-extended offset, scaled by 4
fn dec_css_imm(inst: u32) -> u32 {
    let mut imm = 0;
    imm |= (inst & CSS_IMM_7_6) >> 1;
    imm |= (inst & CSS_IMM_5_2) >> 7;
    imm
}

// CIW-format immediate: zero-extended non-zero immediate, scaled by 4
fn dec_ciw_imm(inst: u32) -> u32 {
    let mut imm = 0;
    imm |= (inst & CIW_IMM_9_6) >> 1;
    imm |= (inst & CIW_IMM_5_4) >> 7;
    imm |= (inst & CIW_IMM_3) >> 2;
    imm |= (inst & CIW_IMM_2) >> 4;
    imm
}

// C.LW / C.SW immediate: zero-extended offset, scaled by 4
fn dec_clw_csw_imm(inst: u32) -> u32 {
    let mut imm = 0;
    imm |= (inst & CLWSW_IMM_6) << 1;
    imm |= (inst & CLWSW_IMM_5_3) >> 7;
    imm |= (inst & CLWSW_IMM_2) >> 4;
    imm
}

fn dec_cs_funct6(inst: u32) -> u32 {
    (inst & CS_FUNCT6) >> 10
}

fn dec_cs_funct2(inst: u32) -> u32 {
    (inst & CS_FUNCT2) >> 5
}

fn dec_cb_funct2(inst: u32) -> u32 {
    (inst & CB_FUNCT2) >> 10
}

// CB-format branch offset: sign-extended, scaled by 2
fn dec_branch_imm(inst: u32) -> i32 {
    let mut imm = 0;
    imm |= (inst & CB_OFFSET_8) >> 4;
    imm |= (inst & CB_OFFSET_7_6) << 1;
    imm |= (inst & CB_OFFSET_5) << 3;
    imm |= (inst & CB_OFFSET_4_3) >> 7;
    imm |= (inst & CB_OFFSET_2_1) >> 2;
    sign_extend(imm, 9) as i32
}

// CJ-format jump offset: sign-extended, scaled by 2
fn dec_cj_imm(inst: u32) -> i32 {
    let mut imm = 0;
    imm |= (inst & CJ_OFFSET_11) >> 1;
    imm |= (inst & CJ_OFFSET_10) << 2;
    imm |= (inst & CJ_OFFSET_9_8) >> 1;
    imm |= (inst & CJ_OFFSET_7) << 1;
    imm |= (inst & CJ_OFFSET_6) >> 1;
    imm |= (inst & CJ_OFFSET_5) << 3;
    imm |= (inst & CJ_OFFSET_4) >> 7;
    imm |= (inst & CJ_OFFSET_3_1) >> 2;
    sign_extend(imm, 12) as i32
}

// 32-bit encode helpers, shared with unit tests that need to synthesize
// instruction words.

pub(crate) fn enc_rtype(funct7: u32, rs2: u32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
    (funct7 << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
}

pub(crate) fn enc_itype(imm: i32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
    ((imm as u32) << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
}

pub(crate) fn enc_stype(imm: i32, rs2: u32, rs1: u32, funct3: u32, opcode: u32) -> u32 {
    let imm = imm as u32;
    ((imm & 0b111111100000) << 20)
        | (rs2 << 20)
        | (rs1 << 15)
        | (funct3 << 12)
        | ((imm & 0b000000011111) << 7)
        | opcode
}

pub(crate) fn enc_btype(imm: i32, rs2: u32, rs1: u32, funct3: u32, opcode: u32) -> u32 {
    let imm = imm as u32;
    ((imm & 0b1000000000000) << 19)
        | ((imm & 0b0011111100000) << 20)
        | (rs2 << 20)
        | (rs1 << 15)
        | (funct3 << 12)
        | ((imm & 0b0000000011110) << 7)
        | ((imm & 0b0100000000000) >> 4)
        | opcode
}

pub(crate) fn enc_utype(imm: i32, rd: u32, opcode: u32) -> u32 {
    (imm as u32) | (rd << 7) | opcode
}

pub(crate) fn enc_jtype(imm: i32, rd: u32, opcode: u32) -> u32 {
    let imm = imm as u32;
    ((imm & 0x0010_0000) << 11)
        | ((imm & 0x0000_07fe) << 20)
        | ((imm & 0x0000_0800) << 9)
        | (imm & 0x000f_f000)
        | (rd << 7)
        | opcode
}
