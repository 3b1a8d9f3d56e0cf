// Copyright (C) 2025 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

use std::collections::HashMap;
use std::fmt::{self, Debug};

use log::{debug, warn};

use crate::code::label::LabelNameKey;
use crate::code::reloc::{signed_fits, write_value_le};
use crate::code::{
    ExprId,
    Expression,
    ExpressionValue,
    Label,
    LabelEntry,
    LabelLink,
    LabelType,
    RelocEntry,
    RelocId,
    RelocKind,
    RelocPayload,
    Section,
    SectionFlags,
    SectionId,
};
use crate::emitter::VirtReg;
use crate::{ArchInfo, CodeError, EmitterKind, ErrorHandler, INVALID_ID};

const TEXT_SECTION_NAME: &str = ".text";
const DEFAULT_TEXT_ALIGNMENT: u32 = 16;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CopySectionFlags(u32);

impl CopySectionFlags {
    pub const NONE: Self = Self(0);
    /// Zero-fill up to the section's virtual size after the buffer bytes.
    pub const PAD_SECTION: Self = Self(1 << 0);

    #[must_use]
    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Owns everything one code-generation session produces: sections, the
/// label table, relocations, expression trees and virtual registers.
///
/// A container is driven by at most one attached assembler plus any number
/// of node-graph emitters, serialized by the caller. Two containers never
/// share state.
pub struct CodeContainer {
    arch: ArchInfo,
    base_address: Option<u64>,
    sections: Vec<Section>,
    labels: Vec<LabelEntry>,
    label_names: HashMap<LabelNameKey, u32>,
    relocations: Vec<RelocEntry>,
    expressions: Vec<Expression>,
    virt_regs: Vec<VirtReg>,
    error_handler: Option<Box<dyn ErrorHandler>>,
    assembler_attached: bool,
    text_flags: SectionFlags,
    text_alignment: u32,
}

impl CodeContainer {
    #[must_use]
    pub fn new(arch: ArchInfo) -> Self {
        let text_flags = SectionFlags::EXECUTABLE | SectionFlags::READ_ONLY;

        Self {
            arch,
            base_address: None,
            sections: vec![Section::new(SectionId::TEXT, TEXT_SECTION_NAME, text_flags, DEFAULT_TEXT_ALIGNMENT)],
            labels: Vec::new(),
            label_names: HashMap::new(),
            relocations: Vec::new(),
            expressions: Vec::new(),
            virt_regs: Vec::new(),
            error_handler: None,
            assembler_attached: false,
            text_flags,
            text_alignment: DEFAULT_TEXT_ALIGNMENT,
        }
    }

    #[must_use]
    pub fn with_base_address(arch: ArchInfo, base: u64) -> Self {
        let mut this = Self::new(arch);
        this.base_address = Some(base);
        this
    }

    /// Drops all sections, labels, relocations and virtual registers and
    /// re-creates `.text` with the flags and alignment it had at
    /// construction. With `release` the backing allocations are returned to
    /// the allocator instead of being kept for reuse.
    pub fn reset(&mut self, release: bool) {
        debug!("Resetting code container (release: {release})");

        if release {
            self.sections = Vec::new();
            self.labels = Vec::new();
            self.label_names = HashMap::new();
            self.relocations = Vec::new();
            self.expressions = Vec::new();
            self.virt_regs = Vec::new();
        } else {
            self.sections.clear();
            self.labels.clear();
            self.label_names.clear();
            self.relocations.clear();
            self.expressions.clear();
            self.virt_regs.clear();
        }

        self.sections.push(Section::new(
            SectionId::TEXT,
            TEXT_SECTION_NAME,
            self.text_flags,
            self.text_alignment,
        ));
        self.base_address = None;
        self.assembler_attached = false;
    }

    #[must_use]
    pub const fn arch(&self) -> &ArchInfo {
        &self.arch
    }

    #[must_use]
    pub const fn base_address(&self) -> Option<u64> {
        self.base_address
    }

    pub fn set_error_handler(&mut self, handler: Box<dyn ErrorHandler>) {
        self.error_handler = Some(handler);
    }

    pub fn reset_error_handler(&mut self) {
        self.error_handler = None;
    }

    #[must_use]
    pub fn has_error_handler(&self) -> bool {
        self.error_handler.is_some()
    }

    /// Invokes the container's handler, when one is installed. Returns
    /// whether a handler saw the error.
    pub(crate) fn dispatch_error(&mut self, error: CodeError, message: &str, origin: EmitterKind) -> bool {
        let Some(mut handler) = self.error_handler.take() else {
            return false;
        };

        handler.handle(error, message, origin);
        self.error_handler = Some(handler);
        true
    }

    pub(crate) fn acquire_assembler_slot(&mut self) -> Result<(), CodeError> {
        if self.assembler_attached {
            return Err(CodeError::AlreadyAttached);
        }

        self.assembler_attached = true;
        Ok(())
    }

    pub(crate) fn release_assembler_slot(&mut self) {
        self.assembler_attached = false;
    }

    //
    // Sections
    //

    pub fn new_section(&mut self, name: &str, flags: SectionFlags, alignment: u32) -> Result<SectionId, CodeError> {
        if name.is_empty() || name.contains('\0') {
            return Err(CodeError::InvalidArgument);
        }

        let alignment = alignment.max(1);
        if !alignment.is_power_of_two() {
            return Err(CodeError::InvalidArgument);
        }

        self.sections.try_reserve(1).map_err(|_| CodeError::OutOfMemory)?;

        let id = SectionId::new(u32::try_from(self.sections.len()).map_err(|_| CodeError::OutOfMemory)?);
        self.sections.push(Section::new(id, name, flags, alignment));

        debug!("New section {name} {id}");
        Ok(id)
    }

    #[must_use]
    pub fn section_count(&self) -> u32 {
        self.sections.len() as u32
    }

    #[must_use]
    pub fn is_section_valid(&self, id: SectionId) -> bool {
        id.index() < self.sections.len()
    }

    pub fn section(&self, id: SectionId) -> Result<&Section, CodeError> {
        self.sections.get(id.index()).ok_or(CodeError::InvalidSection)
    }

    pub fn section_mut(&mut self, id: SectionId) -> Result<&mut Section, CodeError> {
        self.sections.get_mut(id.index()).ok_or(CodeError::InvalidSection)
    }

    #[must_use]
    pub fn text_section(&self) -> &Section {
        &self.sections[SectionId::TEXT.index()]
    }

    #[must_use]
    pub fn section_by_name(&self, name: &str) -> Option<SectionId> {
        self.sections.iter()
            .find(|section| section.name() == name)
            .map(Section::id)
    }

    #[must_use]
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    //
    // Labels
    //

    pub fn new_label(&mut self) -> Result<Label, CodeError> {
        let label = self.allocate_label_id()?;
        self.labels.push(LabelEntry::new(label, LabelType::Anonymous, None, None));
        Ok(label)
    }

    pub fn new_named_label(&mut self, name: &str, label_type: LabelType, parent: Option<Label>) -> Result<Label, CodeError> {
        if name.is_empty() || name.contains('\0') {
            return Err(CodeError::InvalidLabelName);
        }

        let parent_key = match label_type {
            LabelType::Anonymous => return Err(CodeError::InvalidArgument),

            LabelType::Local => {
                let parent = parent.ok_or(CodeError::InvalidParentLabel)?;
                if !self.is_label_valid(parent) {
                    return Err(CodeError::InvalidParentLabel);
                }
                parent.id()
            }

            LabelType::Global | LabelType::External => {
                if parent.is_some() {
                    return Err(CodeError::InvalidArgument);
                }
                INVALID_ID
            }
        };

        let key = LabelNameKey {
            parent: parent_key,
            name: name.into(),
        };

        if self.label_names.contains_key(&key) {
            return Err(CodeError::LabelNameCollision);
        }

        let label = self.allocate_label_id()?;
        self.labels.push(LabelEntry::new(label, label_type, parent, Some(name.into())));
        self.label_names.insert(key, label.id());
        Ok(label)
    }

    fn allocate_label_id(&mut self) -> Result<Label, CodeError> {
        self.labels.try_reserve(1).map_err(|_| CodeError::OutOfMemory)?;

        let id = u32::try_from(self.labels.len()).map_err(|_| CodeError::OutOfMemory)?;
        if id == INVALID_ID {
            return Err(CodeError::OutOfMemory);
        }

        Ok(Label::from_id(id))
    }

    #[must_use]
    pub fn label_count(&self) -> u32 {
        self.labels.len() as u32
    }

    #[must_use]
    pub fn is_label_valid(&self, label: Label) -> bool {
        label.index() < self.labels.len()
    }

    pub fn label_entry(&self, label: Label) -> Result<&LabelEntry, CodeError> {
        self.labels.get(label.index()).ok_or(CodeError::InvalidLabel)
    }

    #[must_use]
    pub fn is_label_bound(&self, label: Label) -> bool {
        self.labels.get(label.index()).is_some_and(LabelEntry::is_bound)
    }

    #[must_use]
    pub fn label_by_name(&self, name: &str, parent: Option<Label>) -> Option<Label> {
        let key = LabelNameKey {
            parent: parent.map_or(INVALID_ID, |label| label.id()),
            name: name.into(),
        };

        self.label_names.get(&key).map(|&id| Label::from_id(id))
    }

    /// Binds `label` to (`section`, `offset`) and resolves its pending
    /// links: linked relocations receive their target, same-section links
    /// are patched in place, and cross-section links are converted into
    /// absolute-to-relative relocations applied at `relocate_to_base`.
    pub fn bind_label(&mut self, label: Label, section: SectionId, offset: u64) -> Result<(), CodeError> {
        if !self.is_section_valid(section) {
            return Err(CodeError::InvalidSection);
        }

        let buffer_len = self.sections[section.index()].buffer().len() as u64;
        if offset > buffer_len {
            return Err(CodeError::InvalidArgument);
        }

        let entry = self.labels.get_mut(label.index()).ok_or(CodeError::InvalidLabel)?;
        if entry.is_bound() {
            return Err(CodeError::LabelAlreadyBound);
        }

        entry.bind_to(section, offset);
        let links = entry.take_links();

        debug!("Bound {label} to {section}+{offset:#x} ({} pending links)", links.len());

        let mut first_error = None;
        for link in links {
            if let Err(error) = self.resolve_link(section, offset, &link) {
                first_error.get_or_insert(error);
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn resolve_link(&mut self, target_section: SectionId, target_offset: u64, link: &LabelLink) -> Result<(), CodeError> {
        if let Some(reloc) = link.reloc {
            let entry = self.relocations.get_mut(reloc.index()).ok_or(CodeError::InvalidArgument)?;
            entry.set_target(target_section, target_offset);
            return Ok(());
        }

        if link.section == target_section {
            let delta = (target_offset as i64)
                .wrapping_sub(link.offset as i64)
                .wrapping_sub(link.rel_base as i64);

            if !signed_fits(delta, link.width) {
                return Err(CodeError::RelocationOffsetOutOfRange);
            }

            let buffer = self.sections[link.section.index()].buffer_mut();
            return write_value_le(buffer.as_mut_slice(), link.offset as usize, delta as u64, link.width);
        }

        // The displacement spans sections, so the final value depends on
        // the flattened layout; defer to an absolute-to-relative fixup.
        let payload = target_offset
            .wrapping_add(link.width as u64)
            .wrapping_sub(link.rel_base as u64);

        let reloc = self.new_reloc_entry(RelocKind::AbsToRel, link.width)?;
        let entry = &mut self.relocations[reloc.index()];
        entry.set_source(link.section, link.offset);
        entry.set_target(target_section, payload);
        Ok(())
    }

    /// Registers a pending forward reference on `label`, resolved when the
    /// label binds.
    pub fn new_label_link(&mut self, label: Label, link: LabelLink) -> Result<(), CodeError> {
        let entry = self.labels.get_mut(label.index()).ok_or(CodeError::InvalidLabel)?;
        entry.push_link(link);
        Ok(())
    }

    //
    // Relocations & expressions
    //

    pub fn new_reloc_entry(&mut self, kind: RelocKind, width: u8) -> Result<RelocId, CodeError> {
        if !matches!(width, 1 | 2 | 4 | 8) {
            return Err(CodeError::InvalidArgument);
        }

        self.relocations.try_reserve(1).map_err(|_| CodeError::OutOfMemory)?;

        let id = RelocId::new(u32::try_from(self.relocations.len()).map_err(|_| CodeError::OutOfMemory)?);
        self.relocations.push(RelocEntry::new(id, kind, width));
        Ok(id)
    }

    pub fn reloc_entry_mut(&mut self, id: RelocId) -> Result<&mut RelocEntry, CodeError> {
        self.relocations.get_mut(id.index()).ok_or(CodeError::InvalidArgument)
    }

    #[must_use]
    pub fn relocations(&self) -> &[RelocEntry] {
        &self.relocations
    }

    pub fn new_expression(&mut self, expression: Expression) -> Result<ExprId, CodeError> {
        self.expressions.try_reserve(1).map_err(|_| CodeError::OutOfMemory)?;

        let id = ExprId::new(u32::try_from(self.expressions.len()).map_err(|_| CodeError::OutOfMemory)?);
        self.expressions.push(expression);
        Ok(id)
    }

    //
    // Virtual registers (storage; allocation goes through the Compiler)
    //

    pub(crate) fn push_virt_reg(&mut self, reg: VirtReg) -> Result<u32, CodeError> {
        self.virt_regs.try_reserve(1).map_err(|_| CodeError::OutOfMemory)?;

        let index = u32::try_from(self.virt_regs.len()).map_err(|_| CodeError::OutOfMemory)?;
        self.virt_regs.push(reg);
        Ok(index)
    }

    #[must_use]
    pub fn virt_regs(&self) -> &[VirtReg] {
        &self.virt_regs
    }

    #[must_use]
    pub fn virt_regs_mut(&mut self) -> &mut [VirtReg] {
        &mut self.virt_regs
    }

    //
    // Finalization
    //

    /// Assigns every section its offset in the final image, respecting
    /// alignment, and returns the total image size.
    pub fn flatten(&mut self) -> Result<u64, CodeError> {
        let mut offset = 0u64;

        for section in &mut self.sections {
            let aligned = align_up(offset, section.alignment() as u64).ok_or(CodeError::InvalidArgument)?;
            section.set_offset(aligned);
            offset = aligned.checked_add(section.virtual_size()).ok_or(CodeError::InvalidArgument)?;
        }

        debug!("Flattened {} sections, image size {offset:#x}", self.sections.len());
        Ok(offset)
    }

    /// Total image size using the same layout rules as [`Self::flatten`],
    /// without mutating anything.
    #[must_use]
    pub fn code_size(&self) -> u64 {
        let mut offset = 0u64;

        for section in &self.sections {
            let Some(aligned) = align_up(offset, section.alignment() as u64) else {
                return u64::MAX;
            };
            offset = aligned.saturating_add(section.virtual_size());
        }

        offset
    }

    /// Reports *unresolved-label* when any referenced label is still
    /// unbound. Every offender is logged; the first is returned.
    pub fn resolve_unresolved_links(&self) -> Result<(), CodeError> {
        let mut unresolved = 0usize;

        for entry in &self.labels {
            if !entry.is_bound() && entry.has_pending_links() {
                debug!("Label {} has {} unresolved links", entry.id(), entry.links().len());
                unresolved += 1;
            }
        }

        if unresolved != 0 {
            return Err(CodeError::UnresolvedLabel);
        }

        Ok(())
    }

    /// Applies every relocation entry against `base`, patching the source
    /// sections' buffers. The base is not sticky: applying again with a
    /// different base fully overwrites every relocated field.
    pub fn relocate_to_base(&mut self, base: u64) -> Result<(), CodeError> {
        self.resolve_unresolved_links()?;

        if self.relocations.is_empty() {
            warn!("Relocating an image without relocation entries");
        }

        let mut writes = Vec::new();
        writes.try_reserve(self.relocations.len()).map_err(|_| CodeError::OutOfMemory)?;

        for entry in &self.relocations {
            if !self.is_section_valid(entry.source_section()) {
                return Err(CodeError::InvalidSection);
            }

            let value = self.reloc_value(entry, base)?;
            writes.push((entry.source_section(), entry.source_offset(), value, entry.width()));
        }

        for (section, offset, value, width) in writes {
            debug!("Relocation write {section}+{offset:#x} = {value:#x} (width {width})");
            let buffer = self.sections[section.index()].buffer_mut();
            write_value_le(buffer.as_mut_slice(), offset as usize, value, width)?;
        }

        self.base_address = Some(base);
        Ok(())
    }

    fn reloc_value(&self, entry: &RelocEntry, base: u64) -> Result<u64, CodeError> {
        match entry.kind() {
            RelocKind::AbsToAbs => match entry.payload() {
                RelocPayload::Value(value) => Ok(value),
                RelocPayload::Expression(_) => Err(CodeError::InvalidArgument),
            },

            RelocKind::RelToAbs => {
                let RelocPayload::Value(payload) = entry.payload() else {
                    return Err(CodeError::InvalidArgument);
                };

                let target = entry.target_section().ok_or(CodeError::UnresolvedLabel)?;
                let target_offset = self.section(target)?.offset();
                Ok(base.wrapping_add(target_offset).wrapping_add(payload))
            }

            RelocKind::AbsToRel => {
                let RelocPayload::Value(payload) = entry.payload() else {
                    return Err(CodeError::InvalidArgument);
                };

                let target = entry.target_section().ok_or(CodeError::UnresolvedLabel)?;
                let target_address = base
                    .wrapping_add(self.section(target)?.offset())
                    .wrapping_add(payload);
                let source_end = base
                    .wrapping_add(self.section(entry.source_section())?.offset())
                    .wrapping_add(entry.source_offset())
                    .wrapping_add(entry.width() as u64);

                let delta = target_address.wrapping_sub(source_end) as i64;
                if !signed_fits(delta, entry.width()) {
                    return Err(CodeError::RelocationOffsetOutOfRange);
                }

                Ok(delta as u64)
            }

            RelocKind::Expression => {
                let RelocPayload::Expression(id) = entry.payload() else {
                    return Err(CodeError::InvalidArgument);
                };

                let value = self.eval_expression(id, base)?;
                if !signed_fits(value, entry.width()) {
                    return Err(CodeError::RelocationOffsetOutOfRange);
                }

                Ok(value as u64)
            }
        }
    }

    fn eval_operand(&self, value: ExpressionValue, base: u64) -> Result<i64, CodeError> {
        match value {
            ExpressionValue::None => Ok(0),
            ExpressionValue::Constant(constant) => Ok(constant),

            ExpressionValue::Label(label) => {
                let entry = self.label_entry(label)?;
                let section = entry.section().ok_or(CodeError::UnresolvedLabel)?;
                Ok(base
                    .wrapping_add(self.section(section)?.offset())
                    .wrapping_add(entry.offset()) as i64)
            }

            ExpressionValue::Expression(id) => self.eval_expression(id, base),
        }
    }

    fn eval_expression(&self, id: ExprId, base: u64) -> Result<i64, CodeError> {
        let expression = *self.expressions.get(id.index()).ok_or(CodeError::InvalidArgument)?;
        let lhs = self.eval_operand(expression.operands[0], base)?;
        let rhs = self.eval_operand(expression.operands[1], base)?;
        Ok(expression.apply(lhs, rhs))
    }

    /// Copies one section's bytes into `dst`, zero-padding up to the
    /// virtual size when requested. Returns the number of bytes written.
    pub fn copy_section_data(&self, dst: &mut [u8], id: SectionId, options: CopySectionFlags) -> Result<usize, CodeError> {
        let section = self.section(id)?;
        let data = section.buffer().as_slice();

        if dst.len() < data.len() {
            return Err(CodeError::InvalidArgument);
        }

        dst[..data.len()].copy_from_slice(data);
        let mut written = data.len();

        if options.contains(CopySectionFlags::PAD_SECTION) {
            let pad_to = usize::try_from(section.virtual_size()).map_err(|_| CodeError::InvalidArgument)?;
            let pad_to = pad_to.min(dst.len());
            if pad_to > written {
                dst[written..pad_to].fill(0);
                written = pad_to;
            }
        }

        Ok(written)
    }

    /// Copies every section at its flattened offset, zero-filling the gaps
    /// between them. `flatten` must have run. Returns the image size.
    pub fn copy_flattened_data(&self, dst: &mut [u8]) -> Result<usize, CodeError> {
        let size = usize::try_from(self.code_size()).map_err(|_| CodeError::InvalidArgument)?;
        if size == 0 {
            return Err(CodeError::NoCodeGenerated);
        }

        if dst.len() < size {
            return Err(CodeError::InvalidArgument);
        }

        dst[..size].fill(0);

        for section in &self.sections {
            let offset = usize::try_from(section.offset()).map_err(|_| CodeError::InvalidArgument)?;
            let data = section.buffer().as_slice();
            dst[offset..offset + data.len()].copy_from_slice(data);
        }

        Ok(size)
    }
}

impl Debug for CodeContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeContainer")
            .field("arch", &self.arch)
            .field("base_address", &self.base_address)
            .field("sections", &self.sections.len())
            .field("labels", &self.labels.len())
            .field("relocations", &self.relocations.len())
            .field("virt_regs", &self.virt_regs.len())
            .finish_non_exhaustive()
    }
}

#[must_use]
fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment <= 1 {
        return Some(value);
    }

    let mask = alignment - 1;
    value.checked_add(mask).map(|v| v & !mask)
}
