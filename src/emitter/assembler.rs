// Copyright (C) 2025 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

use log::debug;

use crate::code::{
    signed_fits,
    write_value_le,
    CodeContainer,
    Expression,
    ExpressionOp,
    ExpressionValue,
    Label,
    LabelLink,
    RelocKind,
    SectionId,
};
use crate::const_pool::ConstPool;
use crate::emitter::{encoder_for, AlignMode, CodeWriter, Emitter, EmitterState, InstId, InstructionEncoder, PendingFixup};
use crate::operand::{Operand, TypeId};
use crate::{CodeError, EmitterKind};

const MAX_ALIGNMENT: u32 = 64;

/// Writes encoded instructions directly into the active section's buffer.
///
/// At most one assembler can be attached to a container at a time; the
/// attachment is released when the assembler is dropped or detached.
pub struct Assembler<'code> {
    code: &'code mut CodeContainer,
    state: EmitterState,
    encoder: &'static dyn InstructionEncoder,
    section_id: SectionId,
    cursor: usize,
}

impl<'code> Assembler<'code> {
    /// Attaches to `code`, continuing at the tail of `.text`.
    pub fn attach(code: &'code mut CodeContainer) -> Result<Self, CodeError> {
        let encoder = encoder_for(code.arch().arch()).ok_or(CodeError::InvalidArgument)?;
        code.acquire_assembler_slot()?;

        let cursor = code.text_section().buffer().len();

        Ok(Self {
            code,
            state: EmitterState::new(),
            encoder,
            section_id: SectionId::TEXT,
            cursor,
        })
    }

    pub fn detach(self) {
        // Drop releases the attachment slot.
    }

    #[must_use]
    pub const fn current_section(&self) -> SectionId {
        self.section_id
    }

    /// Write position within the active section's buffer.
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.cursor
    }

    /// Moves the write position anywhere within the already-emitted bytes,
    /// so user passes can patch earlier code.
    pub fn set_offset(&mut self, offset: usize) -> Result<(), CodeError> {
        let size = self.code.section(self.section_id)?.buffer().len();
        if offset > size {
            return Err(self.report_error(CodeError::InvalidArgument, "offset is past the end of the section"));
        }

        self.cursor = offset;
        Ok(())
    }

    /// Continues emission at the tail of another section.
    pub fn switch_section(&mut self, section: SectionId) -> Result<(), CodeError> {
        let buffer_len = match self.code.section(section) {
            Ok(section) => section.buffer().len(),
            Err(error) => return Err(self.report_error(error, "cannot switch to an invalid section")),
        };

        debug!("Assembler switching to section {section}");
        self.section_id = section;
        self.cursor = buffer_len;
        Ok(())
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), CodeError> {
        let cursor = self.cursor;
        let buffer = self.code.section_mut(self.section_id)?.buffer_mut();
        buffer.write_at(cursor, bytes)?;
        self.cursor += bytes.len();
        Ok(())
    }

    fn write_zeros(&mut self, count: usize) -> Result<(), CodeError> {
        let cursor = self.cursor;
        let buffer = self.code.section_mut(self.section_id)?.buffer_mut();
        buffer.write_zeros_at(cursor, count)?;
        self.cursor += count;
        Ok(())
    }

    fn emit_inner(&mut self, inst: InstId, operands: &[Operand]) -> Result<(), CodeError> {
        let mut writer = CodeWriter::new();
        let arch = *self.code.arch();

        self.encoder.encode(
            &arch,
            inst,
            self.state.merged_options(),
            self.state.extra_reg(),
            operands,
            &mut writer,
        )?;

        let start = self.cursor;
        let fixup = writer.take_fixup();

        if let Some(fixup) = fixup {
            self.commit_with_fixup(start, writer, fixup)
        } else {
            self.write_bytes(writer.bytes())
        }
    }

    fn commit_with_fixup(&mut self, start: usize, mut writer: CodeWriter, fixup: PendingFixup) -> Result<(), CodeError> {
        let entry = self.code.label_entry(fixup.label)?;
        let field_offset = (start + fixup.offset) as u64;
        let target = entry.section().map(|section| (section, entry.offset()));

        match target {
            // Bound in the section we are writing to: the displacement is
            // final, patch it before the bytes land in the buffer.
            Some((section, target_offset)) if section == self.section_id => {
                let delta = (target_offset as i64)
                    .wrapping_sub(field_offset as i64)
                    .wrapping_sub(fixup.rel_base as i64);

                if !signed_fits(delta, fixup.width) {
                    return Err(CodeError::RelocationOffsetOutOfRange);
                }

                write_value_le(writer.bytes_mut(), fixup.offset, delta as u64, fixup.width)?;
                self.write_bytes(writer.bytes())
            }

            // Bound elsewhere: the value depends on the flattened layout.
            Some((section, target_offset)) => {
                self.write_bytes(writer.bytes())?;

                let payload = target_offset
                    .wrapping_add(fixup.width as u64)
                    .wrapping_sub(fixup.rel_base as u64);

                let reloc = self.code.new_reloc_entry(RelocKind::AbsToRel, fixup.width)?;
                let entry = self.code.reloc_entry_mut(reloc)?;
                entry.set_source(self.section_id, field_offset);
                entry.set_target(section, payload);
                Ok(())
            }

            // Unbound: leave a link to be resolved when the label binds.
            None => {
                self.write_bytes(writer.bytes())?;

                self.code.new_label_link(fixup.label, LabelLink {
                    section: self.section_id,
                    offset: field_offset,
                    rel_base: fixup.rel_base,
                    width: fixup.width,
                    reloc: None,
                })
            }
        }
    }
}

impl Emitter for Assembler<'_> {
    fn kind(&self) -> EmitterKind {
        EmitterKind::Assembler
    }

    fn state(&self) -> &EmitterState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut EmitterState {
        &mut self.state
    }

    fn container(&self) -> &CodeContainer {
        self.code
    }

    fn container_mut(&mut self) -> &mut CodeContainer {
        self.code
    }

    fn emit(&mut self, inst: InstId, operands: &[Operand]) -> Result<(), CodeError> {
        let result = self.emit_inner(inst, operands);
        self.state.reset_per_inst();

        result.map_err(|error| self.report_error(error, "failed to emit instruction"))
    }

    fn bind(&mut self, label: Label) -> Result<(), CodeError> {
        let section = self.section_id;
        let offset = self.cursor as u64;
        let result = self.code.bind_label(label, section, offset);

        self.state.reset_per_inst();
        result.map_err(|error| self.report_error(error, "failed to bind label"))
    }

    fn align(&mut self, mode: AlignMode, alignment: u32) -> Result<(), CodeError> {
        if alignment <= 1 {
            return Ok(());
        }

        if !alignment.is_power_of_two() || alignment > MAX_ALIGNMENT {
            return Err(self.report_error(CodeError::InvalidArgument, "alignment must be a power of two up to 64"));
        }

        let mask = alignment as usize - 1;
        let padding = (alignment as usize - (self.cursor & mask)) & mask;
        if padding == 0 {
            return Ok(());
        }

        let result = match mode {
            AlignMode::Code => {
                let mut fill = vec![0u8; padding];
                self.encoder.fill_code_alignment(&mut fill);
                self.write_bytes(&fill)
            }
            AlignMode::Data | AlignMode::Zero => self.write_zeros(padding),
        };

        self.state.reset_per_inst();
        result.map_err(|error| self.report_error(error, "failed to align"))
    }

    fn embed(&mut self, data: &[u8]) -> Result<(), CodeError> {
        if data.is_empty() {
            return Ok(());
        }

        let result = self.write_bytes(data);
        self.state.reset_per_inst();
        result.map_err(|error| self.report_error(error, "failed to embed data"))
    }

    fn embed_data_array(&mut self, type_id: TypeId, data: &[u8], item_count: usize, repeat_count: usize) -> Result<(), CodeError> {
        let item_size = type_id.size(self.code.arch().gp_size()) as usize;
        if item_size == 0 {
            return Err(self.report_error(CodeError::InvalidArgument, "cannot embed void items"));
        }

        if item_count == 0 || repeat_count == 0 {
            return Ok(());
        }

        let data_size = item_count.checked_mul(item_size);
        if data_size.and_then(|size| size.checked_mul(repeat_count)).is_none() {
            return Err(self.report_error(CodeError::OutOfMemory, "embedded array size overflows"));
        }

        if Some(data.len()) != data_size {
            return Err(self.report_error(CodeError::InvalidArgument, "data does not match item count and size"));
        }

        let mut result = Ok(());
        for _ in 0..repeat_count {
            result = self.write_bytes(data);
            if result.is_err() {
                break;
            }
        }

        self.state.reset_per_inst();
        result.map_err(|error| self.report_error(error, "failed to embed data array"))
    }

    /// Reserves a pointer-wide field that receives the label's absolute
    /// address during `relocate_to_base`.
    fn embed_label(&mut self, label: Label) -> Result<(), CodeError> {
        let result = (|| {
            let width = self.code.arch().gp_size();
            let entry = self.code.label_entry(label)?;
            let bound = entry.section().map(|section| (section, entry.offset()));

            let reloc = self.code.new_reloc_entry(RelocKind::RelToAbs, width)?;
            let source = (self.section_id, self.cursor as u64);

            match bound {
                Some((section, offset)) => {
                    let entry = self.code.reloc_entry_mut(reloc)?;
                    entry.set_source(source.0, source.1);
                    entry.set_target(section, offset);
                }
                None => {
                    let entry = self.code.reloc_entry_mut(reloc)?;
                    entry.set_source(source.0, source.1);
                    self.code.new_label_link(label, LabelLink {
                        section: source.0,
                        offset: source.1,
                        rel_base: 0,
                        width,
                        reloc: Some(reloc),
                    })?;
                }
            }

            self.write_zeros(width as usize)
        })();

        self.state.reset_per_inst();
        result.map_err(|error| self.report_error(error, "failed to embed label"))
    }

    /// Writes `label - base` immediately when both are bound in the same
    /// section; otherwise defers through an expression relocation.
    fn embed_label_delta(&mut self, label: Label, base: Label, width: u8) -> Result<(), CodeError> {
        let result = (|| {
            let width = if width == 0 {
                self.code.arch().gp_size()
            } else {
                width
            };
            if !matches!(width, 1 | 2 | 4 | 8) {
                return Err(CodeError::InvalidOperandSize);
            }

            let label_entry = self.code.label_entry(label)?;
            let label_bound = label_entry.section().map(|section| (section, label_entry.offset()));
            let base_entry = self.code.label_entry(base)?;
            let base_bound = base_entry.section().map(|section| (section, base_entry.offset()));

            match (label_bound, base_bound) {
                (Some((label_section, label_offset)), Some((base_section, base_offset)))
                    if label_section == base_section =>
                {
                    let delta = label_offset.wrapping_sub(base_offset);
                    let mut bytes = [0u8; 8];
                    write_value_le(&mut bytes, 0, delta, width)?;
                    self.write_bytes(&bytes[..width as usize])
                }

                _ => {
                    let expression = self.code.new_expression(Expression::new(
                        ExpressionOp::Sub,
                        ExpressionValue::Label(label),
                        ExpressionValue::Label(base),
                    ))?;

                    let reloc = self.code.new_reloc_entry(RelocKind::Expression, width)?;
                    let source = (self.section_id, self.cursor as u64);
                    let entry = self.code.reloc_entry_mut(reloc)?;
                    entry.set_source(source.0, source.1);
                    entry.set_expression(expression);

                    self.write_zeros(width as usize)
                }
            }
        })();

        self.state.reset_per_inst();
        result.map_err(|error| self.report_error(error, "failed to embed label delta"))
    }

    fn embed_const_pool(&mut self, label: Label, pool: &ConstPool) -> Result<(), CodeError> {
        if !self.code.is_label_valid(label) {
            return Err(self.report_error(CodeError::InvalidLabel, "constant pool label is invalid"));
        }

        self.align(AlignMode::Data, pool.alignment().min(MAX_ALIGNMENT as u64) as u32)?;
        self.bind(label)?;
        self.embed(pool.data())
    }

    fn comment(&mut self, text: &str) -> Result<(), CodeError> {
        debug!("; {text}");
        Ok(())
    }
}

impl Drop for Assembler<'_> {
    fn drop(&mut self) {
        self.code.release_assembler_slot();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x86::{self, inst};
    use crate::{Arch, ArchInfo, SubArch};
    use pretty_assertions::assert_eq;

    fn container() -> CodeContainer {
        CodeContainer::new(ArchInfo::new(Arch::X64, SubArch::None).unwrap())
    }

    #[test]
    fn only_one_assembler_per_container() {
        let mut code = container();

        let asm = Assembler::attach(&mut code).unwrap();
        asm.detach();

        // The slot is free again after detaching.
        let asm = Assembler::attach(&mut code).unwrap();
        drop(asm);
    }

    #[test]
    fn emit_appends_at_the_cursor() {
        let mut code = container();
        let mut asm = Assembler::attach(&mut code).unwrap();

        asm.emit0(inst::NOP).unwrap();
        asm.emit0(inst::RET).unwrap();
        assert_eq!(asm.offset(), 2);

        drop(asm);
        assert_eq!(code.text_section().buffer().as_slice(), &[0x90, 0xC3]);
    }

    #[test]
    fn per_instruction_state_resets_after_emit() {
        let mut code = container();
        let mut asm = Assembler::attach(&mut code).unwrap();

        asm.set_inline_comment("counter load");
        asm.set_extra_reg(x86::RCX);
        asm.emit0(inst::NOP).unwrap();

        assert_eq!(asm.state().inline_comment(), None);
        assert_eq!(asm.state().extra_reg(), None);
    }

    #[test]
    fn code_alignment_uses_nops() {
        let mut code = container();
        let mut asm = Assembler::attach(&mut code).unwrap();

        asm.emit0(inst::RET).unwrap();
        asm.align(AlignMode::Code, 4).unwrap();
        assert_eq!(asm.offset(), 4);

        drop(asm);
        let bytes = code.text_section().buffer().as_slice();
        assert_eq!(bytes[0], 0xC3);
        assert_eq!(&bytes[1..4], &[0x0F, 0x1F, 0x00]);
    }

    #[test]
    fn set_offset_allows_patching_emitted_code() {
        let mut code = container();
        let mut asm = Assembler::attach(&mut code).unwrap();

        asm.embed(&[0xAA, 0xBB, 0xCC]).unwrap();
        asm.set_offset(1).unwrap();
        asm.embed(&[0x11]).unwrap();

        assert_eq!(asm.set_offset(100), Err(CodeError::InvalidArgument));

        drop(asm);
        assert_eq!(code.text_section().buffer().as_slice(), &[0xAA, 0x11, 0xCC]);
    }
}
