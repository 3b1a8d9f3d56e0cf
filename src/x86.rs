// Copyright (C) 2025 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

// Useful tool for checking the byte code: <http://shell-storm.org/online/Online-Assembler-and-Disassembler/>
// Intel SDM: <https://www.intel.com/content/www/us/en/developer/articles/technical/intel-sdm.html>

use crate::emitter::{CodeWriter, EmitOptions, InstId, InstructionEncoder};
use crate::operand::{Imm, Operand, Reg, RegType};
use crate::{Arch, ArchInfo, CodeError};

/// Instruction ids understood by [`X86Encoder`].
pub mod inst {
    use crate::emitter::InstId;

    pub const NOP: InstId = InstId(1);
    pub const RET: InstId = InstId(2);
    pub const JMP: InstId = InstId(3);
    pub const CALL: InstId = InstId(4);
    pub const MOV: InstId = InstId(5);
    pub const ADD: InstId = InstId(6);
    pub const SUB: InstId = InstId(7);
    pub const PUSH: InstId = InstId(8);
    pub const POP: InstId = InstId(9);
    pub const JE: InstId = InstId(10);
    pub const JNE: InstId = InstId(11);
    pub const JL: InstId = InstId(12);
    pub const JLE: InstId = InstId(13);
    pub const JG: InstId = InstId(14);
    pub const JGE: InstId = InstId(15);
    pub const JB: InstId = InstId(16);
    pub const JBE: InstId = InstId(17);
    pub const JA: InstId = InstId(18);
    pub const JAE: InstId = InstId(19);
}

pub const RAX: Reg = Reg::new(RegType::Gp64, 0);
pub const RCX: Reg = Reg::new(RegType::Gp64, 1);
pub const RDX: Reg = Reg::new(RegType::Gp64, 2);
pub const RBX: Reg = Reg::new(RegType::Gp64, 3);
pub const RSP: Reg = Reg::new(RegType::Gp64, 4);
pub const RBP: Reg = Reg::new(RegType::Gp64, 5);
pub const RSI: Reg = Reg::new(RegType::Gp64, 6);
pub const RDI: Reg = Reg::new(RegType::Gp64, 7);
pub const R8: Reg = Reg::new(RegType::Gp64, 8);
pub const R9: Reg = Reg::new(RegType::Gp64, 9);
pub const R10: Reg = Reg::new(RegType::Gp64, 10);
pub const R11: Reg = Reg::new(RegType::Gp64, 11);
pub const R12: Reg = Reg::new(RegType::Gp64, 12);
pub const R13: Reg = Reg::new(RegType::Gp64, 13);
pub const R14: Reg = Reg::new(RegType::Gp64, 14);
pub const R15: Reg = Reg::new(RegType::Gp64, 15);

pub const EAX: Reg = Reg::new(RegType::Gp32, 0);
pub const ECX: Reg = Reg::new(RegType::Gp32, 1);
pub const EDX: Reg = Reg::new(RegType::Gp32, 2);
pub const EBX: Reg = Reg::new(RegType::Gp32, 3);
pub const ESP: Reg = Reg::new(RegType::Gp32, 4);
pub const EBP: Reg = Reg::new(RegType::Gp32, 5);
pub const ESI: Reg = Reg::new(RegType::Gp32, 6);
pub const EDI: Reg = Reg::new(RegType::Gp32, 7);

/// Reference encoder for the x86/x64 subset the core is exercised with.
///
/// It understands plain register and immediate forms plus label-target
/// branches; everything fancier belongs to a full instruction-table
/// encoder behind the same interface.
pub struct X86Encoder;

impl InstructionEncoder for X86Encoder {
    fn encode(
        &self,
        arch: &ArchInfo,
        inst: InstId,
        _options: EmitOptions,
        _extra_reg: Option<Reg>,
        operands: &[Operand],
        writer: &mut CodeWriter,
    ) -> Result<(), CodeError> {
        if !matches!(arch.arch(), Arch::X86 | Arch::X64) {
            return Err(CodeError::InvalidInstruction);
        }

        match inst {
            inst::NOP => {
                expect_operands(operands, 0)?;
                writer.push(0x90);
                Ok(())
            }

            inst::RET => {
                expect_operands(operands, 0)?;
                writer.push(0xC3);
                Ok(())
            }

            inst::JMP => encode_branch(arch, operands, writer, &[0xE9], 4),
            inst::CALL => encode_call(arch, operands, writer),

            inst::JE => encode_jcc(operands, writer, 0x84),
            inst::JNE => encode_jcc(operands, writer, 0x85),
            inst::JL => encode_jcc(operands, writer, 0x8C),
            inst::JLE => encode_jcc(operands, writer, 0x8E),
            inst::JG => encode_jcc(operands, writer, 0x8F),
            inst::JGE => encode_jcc(operands, writer, 0x8D),
            inst::JB => encode_jcc(operands, writer, 0x82),
            inst::JBE => encode_jcc(operands, writer, 0x86),
            inst::JA => encode_jcc(operands, writer, 0x87),
            inst::JAE => encode_jcc(operands, writer, 0x83),

            inst::MOV => encode_mov(arch, operands, writer),
            inst::ADD => encode_arith(arch, operands, writer, 0),
            inst::SUB => encode_arith(arch, operands, writer, 5),

            inst::PUSH => encode_push_pop(arch, operands, writer, 0x50),
            inst::POP => encode_push_pop(arch, operands, writer, 0x58),

            _ => Err(CodeError::InvalidInstruction),
        }
    }

    fn fill_code_alignment(&self, dst: &mut [u8]) {
        // Multi-byte NOP sequences, Intel SDM volume 2B, NOP.
        const NOPS: [&[u8]; 9] = [
            &[0x90],
            &[0x66, 0x90],
            &[0x0F, 0x1F, 0x00],
            &[0x0F, 0x1F, 0x40, 0x00],
            &[0x0F, 0x1F, 0x44, 0x00, 0x00],
            &[0x66, 0x0F, 0x1F, 0x44, 0x00, 0x00],
            &[0x0F, 0x1F, 0x80, 0x00, 0x00, 0x00, 0x00],
            &[0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
            &[0x66, 0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
        ];

        let mut rest = dst;
        while !rest.is_empty() {
            let chunk = rest.len().min(NOPS.len());
            let (head, tail) = rest.split_at_mut(chunk);
            head.copy_from_slice(NOPS[chunk - 1]);
            rest = tail;
        }
    }
}

fn expect_operands(operands: &[Operand], count: usize) -> Result<(), CodeError> {
    if operands.len() == count {
        Ok(())
    } else {
        Err(CodeError::InvalidOperand)
    }
}

fn gp_operand(arch: &ArchInfo, operand: &Operand) -> Result<Reg, CodeError> {
    let reg = operand.as_reg().ok_or(CodeError::InvalidOperand)?;

    if reg.is_virtual() {
        return Err(CodeError::InvalidOperand);
    }

    let expected = if arch.gp_size() == 8 {
        RegType::Gp64
    } else {
        RegType::Gp32
    };
    if reg.reg_type() != expected {
        return Err(CodeError::InvalidOperandSize);
    }

    if reg.id() >= arch.gp_count() as u32 {
        return Err(CodeError::InvalidOperand);
    }

    Ok(reg)
}

fn encode_branch(arch: &ArchInfo, operands: &[Operand], writer: &mut CodeWriter, opcode: &[u8], width: u8) -> Result<(), CodeError> {
    expect_operands(operands, 1)?;

    if let Some(label) = operands[0].as_label() {
        writer.push_bytes(opcode);
        return writer.add_label_fixup(label, width, width as u32);
    }

    if operands[0].is_reg() {
        // jmp r: FF /4
        let reg = gp_operand(arch, &operands[0])?;
        if reg.id() >= 8 {
            writer.push(register_extension(false, false, false, true));
        }
        writer.push(0xFF);
        writer.push(mod_rm_byte(0b11, 4, reg.id() as u8 & 7));
        return Ok(());
    }

    Err(CodeError::InvalidOperand)
}

fn encode_call(arch: &ArchInfo, operands: &[Operand], writer: &mut CodeWriter) -> Result<(), CodeError> {
    expect_operands(operands, 1)?;

    if let Some(label) = operands[0].as_label() {
        writer.push(0xE8);
        return writer.add_label_fixup(label, 4, 4);
    }

    if operands[0].is_reg() {
        // call r: FF /2
        let reg = gp_operand(arch, &operands[0])?;
        if reg.id() >= 8 {
            writer.push(register_extension(false, false, false, true));
        }
        writer.push(0xFF);
        writer.push(mod_rm_byte(0b11, 2, reg.id() as u8 & 7));
        return Ok(());
    }

    Err(CodeError::InvalidOperand)
}

fn encode_jcc(operands: &[Operand], writer: &mut CodeWriter, opcode: u8) -> Result<(), CodeError> {
    expect_operands(operands, 1)?;

    let label = operands[0].as_label().ok_or(CodeError::InvalidOperand)?;
    writer.push_bytes(&[0x0F, opcode]);
    writer.add_label_fixup(label, 4, 4)
}

fn encode_mov(arch: &ArchInfo, operands: &[Operand], writer: &mut CodeWriter) -> Result<(), CodeError> {
    expect_operands(operands, 2)?;
    let dst = gp_operand(arch, &operands[0])?;

    if operands[1].is_reg() {
        let src = gp_operand(arch, &operands[1])?;
        emit_rm_reg(arch, writer, 0x89, src, dst);
        return Ok(());
    }

    if let Some(imm) = operands[1].as_imm() {
        return encode_mov_imm(arch, writer, dst, imm);
    }

    Err(CodeError::InvalidOperand)
}

fn encode_mov_imm(arch: &ArchInfo, writer: &mut CodeWriter, dst: Reg, imm: Imm) -> Result<(), CodeError> {
    if arch.gp_size() == 4 {
        if !imm.fits_i32() {
            return Err(CodeError::InvalidOperandSize);
        }
        writer.push(0xB8 + (dst.id() as u8 & 7));
        writer.push_u32_le(imm.value() as u32);
        return Ok(());
    }

    if imm.fits_i32() {
        // mov r/m64, imm32 (sign-extended): REX.W C7 /0
        writer.push(register_extension(true, false, false, dst.id() >= 8));
        writer.push(0xC7);
        writer.push(mod_rm_byte(0b11, 0, dst.id() as u8 & 7));
        writer.push_u32_le(imm.value() as u32);
    } else {
        // movabs r64, imm64: REX.W B8+r
        writer.push(register_extension(true, false, false, dst.id() >= 8));
        writer.push(0xB8 + (dst.id() as u8 & 7));
        writer.push_u64_le(imm.value() as u64);
    }

    Ok(())
}

fn encode_arith(arch: &ArchInfo, operands: &[Operand], writer: &mut CodeWriter, extension: u8) -> Result<(), CodeError> {
    expect_operands(operands, 2)?;
    let dst = gp_operand(arch, &operands[0])?;
    let imm = operands[1].as_imm().ok_or(CodeError::InvalidOperand)?;

    if !imm.fits_i32() {
        return Err(CodeError::InvalidOperandSize);
    }

    if arch.gp_size() == 8 {
        writer.push(register_extension(true, false, false, dst.id() >= 8));
    }

    if imm.fits_i8() {
        writer.push(0x83);
        writer.push(mod_rm_byte(0b11, extension, dst.id() as u8 & 7));
        writer.push(imm.value() as u8);
    } else {
        writer.push(0x81);
        writer.push(mod_rm_byte(0b11, extension, dst.id() as u8 & 7));
        writer.push_u32_le(imm.value() as u32);
    }

    Ok(())
}

fn encode_push_pop(arch: &ArchInfo, operands: &[Operand], writer: &mut CodeWriter, base: u8) -> Result<(), CodeError> {
    expect_operands(operands, 1)?;
    let reg = gp_operand(arch, &operands[0])?;

    if reg.id() >= 8 {
        writer.push(register_extension(false, false, false, true));
    }
    writer.push(base + (reg.id() as u8 & 7));
    Ok(())
}

fn emit_rm_reg(arch: &ArchInfo, writer: &mut CodeWriter, opcode: u8, src: Reg, dst: Reg) {
    if arch.gp_size() == 8 {
        writer.push(register_extension(true, src.id() >= 8, false, dst.id() >= 8));
    }
    writer.push(opcode);
    writer.push(mod_rm_byte(0b11, src.id() as u8 & 7, dst.id() as u8 & 7));
}

/// Creates the REX prefix (Volume 2A chapter 2.2.1).
#[must_use]
const fn register_extension(reg_64: bool, r: bool, x: bool, b: bool) -> u8 {
    0b0100_0000
        | ((reg_64 as u8) << 3)
        | ((r as u8) << 2)
        | ((x as u8) << 1)
        | (b as u8)
}

#[must_use]
const fn mod_rm_byte(mode: u8, reg: u8, rm: u8) -> u8 {
    (mode << 6) | (reg << 3) | rm
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SubArch;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn encode(inst: InstId, operands: &[Operand]) -> Vec<u8> {
        let arch = ArchInfo::new(Arch::X64, SubArch::None).unwrap();
        let mut writer = CodeWriter::new();
        X86Encoder
            .encode(&arch, inst, EmitOptions::NONE, None, operands, &mut writer)
            .unwrap();
        writer.bytes().to_vec()
    }

    #[rstest]
    #[case(inst::NOP, vec![], vec![0x90])]
    #[case(inst::RET, vec![], vec![0xC3])]
    #[case(inst::PUSH, vec![RBP.as_operand()], vec![0x55])]
    #[case(inst::POP, vec![R15.as_operand()], vec![0x41, 0x5F])]
    #[case(inst::MOV, vec![RAX.as_operand(), Imm::new(7).as_operand()], vec![0x48, 0xC7, 0xC0, 7, 0, 0, 0])]
    #[case(inst::MOV, vec![RBP.as_operand(), RSP.as_operand()], vec![0x48, 0x89, 0xE5])]
    #[case(inst::ADD, vec![RCX.as_operand(), Imm::new(8).as_operand()], vec![0x48, 0x83, 0xC1, 8])]
    #[case(inst::SUB, vec![RSP.as_operand(), Imm::new(32).as_operand()], vec![0x48, 0x83, 0xEC, 32])]
    fn single_instruction_encoding(#[case] inst: InstId, #[case] operands: Vec<Operand>, #[case] expected: Vec<u8>) {
        assert_eq!(encode(inst, &operands), expected);
    }

    #[test]
    fn movabs_for_wide_immediates() {
        let bytes = encode(inst::MOV, &[RAX.as_operand(), Imm::new(0x1122_3344_5566_7788).as_operand()]);
        assert_eq!(bytes, vec![0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
    }

    #[test]
    fn virtual_register_is_rejected() {
        let virt = Reg::new(RegType::Gp64, crate::operand::virt_id_of(0));
        let arch = ArchInfo::new(Arch::X64, SubArch::None).unwrap();
        let mut writer = CodeWriter::new();

        let result = X86Encoder.encode(&arch, inst::PUSH, EmitOptions::NONE, None, &[virt.as_operand()], &mut writer);
        assert_eq!(result, Err(CodeError::InvalidOperand));
    }

    #[test]
    fn nop_fill_covers_any_length() {
        for len in 1..=32 {
            let mut buffer = vec![0u8; len];
            X86Encoder.fill_code_alignment(&mut buffer);
            assert!(!buffer.iter().all(|&b| b == 0), "length {len} left zeros");
        }
    }
}
