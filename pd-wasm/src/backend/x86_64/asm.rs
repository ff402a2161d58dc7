//! Raw x86-64 encodings used by the lowering.
//!
//! Memory operands always use the `[base + disp32]` form so every access has
//! the same shape regardless of the displacement.

use crate::error::{CompileError, CompileResult};

pub(super) const RAX: u8 = 0;
pub(super) const RCX: u8 = 1;
pub(super) const RDX: u8 = 2;
pub(super) const RBX: u8 = 3;
pub(super) const RSP: u8 = 4;
pub(super) const RBP: u8 = 5;
pub(super) const RSI: u8 = 6;
pub(super) const RDI: u8 = 7;
#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
pub(super) const R8: u8 = 8;
#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
pub(super) const R9: u8 = 9;
pub(super) const R12: u8 = 12;

pub(super) const XMM0: u8 = 0;

/// Condition nibbles shared by `jcc`, `setcc` and `cmovcc`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(super) enum Cond {
    Below = 0x2,
    AboveEqual = 0x3,
    Equal = 0x4,
    NotEqual = 0x5,
    BelowEqual = 0x6,
    Above = 0x7,
    Less = 0xC,
    GreaterEqual = 0xD,
    LessEqual = 0xE,
    Greater = 0xF,
}

fn rex(code: &mut Vec<u8>, w: bool, reg: u8, base: u8) {
    let value = 0x40 | (u8::from(w) << 3) | ((reg >> 3) << 2) | (base >> 3);
    if value != 0x40 {
        code.push(value);
    }
}

/// `[prefix] [rex] opcode modrm(reg, [base + disp32])`.
pub(super) fn op_mem(
    code: &mut Vec<u8>,
    prefix: Option<u8>,
    w: bool,
    opcode: &[u8],
    reg: u8,
    base: u8,
    disp: i32,
) {
    if let Some(prefix) = prefix {
        code.push(prefix);
    }
    rex(code, w, reg, base);
    code.extend_from_slice(opcode);
    code.push(0x80 | ((reg & 7) << 3) | (base & 7));
    if base & 7 == 4 {
        code.push(0x24); // SIB: base only
    }
    code.extend_from_slice(&disp.to_le_bytes());
}

/// `[prefix] [rex] opcode modrm(reg, rm)` with a register operand.
pub(super) fn op_reg(code: &mut Vec<u8>, prefix: Option<u8>, w: bool, opcode: &[u8], reg: u8, rm: u8) {
    if let Some(prefix) = prefix {
        code.push(prefix);
    }
    rex(code, w, reg, rm);
    code.extend_from_slice(opcode);
    code.push(0xC0 | ((reg & 7) << 3) | (rm & 7));
}

pub(super) fn load(code: &mut Vec<u8>, w: bool, dst: u8, base: u8, disp: i32) {
    op_mem(code, None, w, &[0x8B], dst, base, disp);
}

pub(super) fn store(code: &mut Vec<u8>, w: bool, base: u8, disp: i32, src: u8) {
    op_mem(code, None, w, &[0x89], src, base, disp);
}

pub(super) fn lea(code: &mut Vec<u8>, dst: u8, base: u8, disp: i32) {
    op_mem(code, None, true, &[0x8D], dst, base, disp);
}

/// `lea dst, [rip + rel32]`; returns the displacement offset for patching.
pub(super) fn lea_rip(code: &mut Vec<u8>, dst: u8) -> usize {
    code.push(0x48 | ((dst >> 3) << 2));
    code.push(0x8D);
    code.push(0x05 | ((dst & 7) << 3));
    let disp = code.len();
    code.extend_from_slice(&[0, 0, 0, 0]);
    disp
}

pub(super) fn mov_rr(code: &mut Vec<u8>, w: bool, dst: u8, src: u8) {
    op_reg(code, None, w, &[0x89], src, dst);
}

pub(super) fn mov_imm32(code: &mut Vec<u8>, dst: u8, imm: u32) {
    if dst >= 8 {
        code.push(0x41);
    }
    code.push(0xB8 + (dst & 7));
    code.extend_from_slice(&imm.to_le_bytes());
}

pub(super) fn mov_imm64(code: &mut Vec<u8>, dst: u8, imm: u64) {
    code.push(0x48 | (dst >> 3));
    code.push(0xB8 + (dst & 7));
    code.extend_from_slice(&imm.to_le_bytes());
}

/// `mov dword [base + disp], imm32`.
pub(super) fn store_imm32(code: &mut Vec<u8>, base: u8, disp: i32, imm: u32) {
    op_mem(code, None, false, &[0xC7], 0, base, disp);
    code.extend_from_slice(&imm.to_le_bytes());
}

pub(super) fn test_rr(code: &mut Vec<u8>, w: bool, a: u8, b: u8) {
    op_reg(code, None, w, &[0x85], b, a);
}

pub(super) fn xor_rr(code: &mut Vec<u8>, w: bool, dst: u8, src: u8) {
    op_reg(code, None, w, &[0x31], src, dst);
}

pub(super) fn cmp_rr(code: &mut Vec<u8>, w: bool, a: u8, b: u8) {
    op_reg(code, None, w, &[0x39], b, a);
}

/// `cmp reg, imm8` (sign-extended).
pub(super) fn cmp_imm8(code: &mut Vec<u8>, w: bool, reg: u8, imm: i8) {
    op_reg(code, None, w, &[0x83], 7, reg);
    code.push(imm as u8);
}

/// `setcc al; movzx eax, al`.
pub(super) fn setcc_eax(code: &mut Vec<u8>, cond: Cond) {
    code.extend_from_slice(&[0x0F, 0x90 | cond as u8, 0xC0]);
    code.extend_from_slice(&[0x0F, 0xB6, 0xC0]);
}

pub(super) fn cmovcc(code: &mut Vec<u8>, w: bool, cond: Cond, dst: u8, src: u8) {
    op_reg(code, None, w, &[0x0F, 0x40 | cond as u8], dst, src);
}

pub(super) fn push(code: &mut Vec<u8>, reg: u8) {
    if reg >= 8 {
        code.push(0x41);
    }
    code.push(0x50 + (reg & 7));
}

pub(super) fn pop(code: &mut Vec<u8>, reg: u8) {
    if reg >= 8 {
        code.push(0x41);
    }
    code.push(0x58 + (reg & 7));
}

pub(super) fn call_rax(code: &mut Vec<u8>) {
    code.extend_from_slice(&[0xFF, 0xD0]);
}

pub(super) fn ret(code: &mut Vec<u8>) {
    code.push(0xC3);
}

pub(super) fn emit_jcc_rel32(code: &mut Vec<u8>, cond: Cond) -> usize {
    code.extend_from_slice(&[0x0F, 0x80 | cond as u8]);
    let disp = code.len();
    code.extend_from_slice(&[0, 0, 0, 0]);
    disp
}

pub(super) fn emit_jmp_rel32(code: &mut Vec<u8>) -> usize {
    code.push(0xE9);
    let disp = code.len();
    code.extend_from_slice(&[0, 0, 0, 0]);
    disp
}

/// Points the rel32 at `disp_offset` (relative to the end of the field) at `target`.
pub(super) fn patch_rel32(code: &mut [u8], disp_offset: usize, target: usize) -> CompileResult<()> {
    let rel = (target as i64) - ((disp_offset + 4) as i64);
    let rel = i32::try_from(rel)
        .map_err(|_| CompileError::Executable("native patch displacement overflow".to_string()))?;
    code[disp_offset..disp_offset + 4].copy_from_slice(&rel.to_le_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn r12_base_gets_a_sib_byte() {
        let mut code = Vec::new();
        load(&mut code, true, RAX, R12, 8);
        assert_eq!(code, [0x49, 0x8B, 0x84, 0x24, 0x08, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn frame_register_moves_match_hand_encodings() {
        let mut code = Vec::new();
        mov_rr(&mut code, true, RBX, RDI);
        mov_rr(&mut code, true, R12, RSI);
        push(&mut code, R12);
        pop(&mut code, RBX);
        assert_eq!(code, [0x48, 0x89, 0xFB, 0x49, 0x89, 0xF4, 0x41, 0x54, 0x5B]);
    }

    #[test]
    fn rel32_patches_are_relative_to_the_field_end() {
        let mut code = Vec::new();
        let disp = emit_jmp_rel32(&mut code);
        code.extend_from_slice(&[0x90; 3]);
        let target = code.len();
        patch_rel32(&mut code, disp, target).expect("short jump fits");
        assert_eq!(&code[..5], &[0xE9, 0x03, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn condition_codes_land_in_the_opcode() {
        let mut code = Vec::new();
        setcc_eax(&mut code, Cond::Less);
        emit_jcc_rel32(&mut code, Cond::Above);
        assert_eq!(&code[..3], &[0x0F, 0x9C, 0xC0]);
        assert_eq!(&code[6..8], &[0x0F, 0x87]);
    }
}
