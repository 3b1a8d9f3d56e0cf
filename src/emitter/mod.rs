// Copyright (C) 2025 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

mod assembler;
mod builder;
mod compiler;

pub use self::{
    assembler::Assembler,
    builder::{
        Builder,
        InstData,
        Node,
        NodeId,
        NodeKind,
        Pass,
        SentinelKind,
    },
    compiler::{
        Compiler,
        ConstScope,
        FuncData,
        FuncRetData,
        InvokeData,
        JumpAnnotation,
        JumpAnnotationId,
        JumpData,
        VirtReg,
        VirtRegFlags,
    },
};

use std::ops::BitOr;

use crate::code::{CodeContainer, Label, LabelType};
use crate::const_pool::ConstPool;
use crate::operand::{Operand, Reg, TypeId};
use crate::{Arch, ArchInfo, CodeError, EmitterKind, ErrorHandler};

/// Identifier of an instruction within its architecture's namespace. The
/// core treats it as opaque; the per-architecture encoder interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstId(pub u32);

impl InstId {
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.0
    }
}

/// Option bits merged into every emit: sticky emitter-wide options plus
/// per-instruction overrides that reset after each emit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EmitOptions(u32);

impl EmitOptions {
    pub const NONE: Self = Self(0);
    /// Prefer the shortest encoding when a choice exists.
    pub const SHORT_FORM: Self = Self(1 << 0);
    /// Prefer the canonical long encoding when a choice exists.
    pub const LONG_FORM: Self = Self(1 << 1);
    pub const PREDICT_TAKEN: Self = Self(1 << 2);
    pub const PREDICT_NOT_TAKEN: Self = Self(1 << 3);

    #[must_use]
    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn merged(&self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn bits(&self) -> u32 {
        self.0
    }
}

impl BitOr for EmitOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.merged(rhs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignMode {
    /// Pad with architecture no-ops.
    Code,
    /// Pad with zeros.
    Data,
    /// Pad with zeros, even in code sections.
    Zero,
}

/// A label displacement an encoder could not finish: the field at `offset`
/// (within the just-encoded bytes) needs `label`'s location, relative to
/// the field start plus `rel_base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingFixup {
    pub label: Label,
    pub offset: usize,
    pub width: u8,
    pub rel_base: u32,
}

/// Receives the bytes of a single instruction from an encoder, together
/// with at most one pending label fixup.
#[derive(Debug, Default)]
pub struct CodeWriter {
    bytes: Vec<u8>,
    fixup: Option<PendingFixup>,
}

impl CodeWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    pub fn push_u32_le(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub fn push_u64_le(&mut self, value: u64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Reserves a zero-filled displacement field of `width` bytes at the
    /// current position and records the fixup. One fixup per instruction.
    pub fn add_label_fixup(&mut self, label: Label, width: u8, rel_base: u32) -> Result<(), CodeError> {
        if self.fixup.is_some() {
            return Err(CodeError::InvalidArgument);
        }

        self.fixup = Some(PendingFixup {
            label,
            offset: self.bytes.len(),
            width,
            rel_base,
        });

        self.bytes.extend(std::iter::repeat(0).take(width as usize));
        Ok(())
    }

    pub(crate) fn take_fixup(&mut self) -> Option<PendingFixup> {
        self.fixup.take()
    }
}

/// Per-architecture instruction encoder consumed by the core.
///
/// Encoders are stateless: everything they need arrives through the call.
pub trait InstructionEncoder: Sync {
    fn encode(
        &self,
        arch: &ArchInfo,
        inst: InstId,
        options: EmitOptions,
        extra_reg: Option<Reg>,
        operands: &[Operand],
        writer: &mut CodeWriter,
    ) -> Result<(), CodeError>;

    /// Fills an alignment gap inside a code section. The default writes
    /// zeros; architectures with multi-byte no-ops override this.
    fn fill_code_alignment(&self, dst: &mut [u8]) {
        dst.fill(0);
    }
}

#[must_use]
pub(crate) fn encoder_for(arch: Arch) -> Option<&'static dyn InstructionEncoder> {
    match arch {
        Arch::X86 | Arch::X64 => Some(&crate::x86::X86Encoder),
        _ => None,
    }
}

/// Read-only pretty-printer interface. Implementations must not mutate the
/// container or the emitter driving them.
pub trait Formatter {
    fn format_inst(&self, code: &CodeContainer, inst: InstId, operands: &[Operand]) -> String;
    fn format_label(&self, code: &CodeContainer, label: Label) -> String;
}

/// State every emitter flavor carries: sticky options, per-instruction
/// overrides, the extra-register slot for masked architectures, the inline
/// comment, and an optional error handler.
#[derive(Default)]
pub struct EmitterState {
    options: EmitOptions,
    inst_options: EmitOptions,
    extra_reg: Option<Reg>,
    inline_comment: Option<String>,
    error_handler: Option<Box<dyn ErrorHandler>>,
}

impl EmitterState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn options(&self) -> EmitOptions {
        self.options
    }

    pub fn set_options(&mut self, options: EmitOptions) {
        log::debug!("Emitter options changed to {options:?}");
        self.options = options;
    }

    #[must_use]
    pub const fn inst_options(&self) -> EmitOptions {
        self.inst_options
    }

    pub fn add_inst_options(&mut self, options: EmitOptions) {
        self.inst_options = self.inst_options.merged(options);
    }

    /// Sticky options merged with the pending per-instruction overrides.
    #[must_use]
    pub const fn merged_options(&self) -> EmitOptions {
        self.options.merged(self.inst_options)
    }

    #[must_use]
    pub const fn extra_reg(&self) -> Option<Reg> {
        self.extra_reg
    }

    pub fn set_extra_reg(&mut self, reg: Reg) {
        self.extra_reg = Some(reg);
    }

    #[must_use]
    pub fn inline_comment(&self) -> Option<&str> {
        self.inline_comment.as_deref()
    }

    pub fn set_inline_comment(&mut self, comment: &str) {
        self.inline_comment = Some(comment.to_string());
    }

    pub(crate) fn take_inline_comment(&mut self) -> Option<String> {
        self.inline_comment.take()
    }

    /// Clears everything scoped to a single instruction. Runs after every
    /// emit attempt, successful or not, and after binds and embeds.
    pub(crate) fn reset_per_inst(&mut self) {
        self.inst_options = EmitOptions::NONE;
        self.extra_reg = None;
        self.inline_comment = None;
    }

    pub fn set_error_handler(&mut self, handler: Box<dyn ErrorHandler>) {
        self.error_handler = Some(handler);
    }

    pub fn reset_error_handler(&mut self) {
        self.error_handler = None;
    }

    pub(crate) fn dispatch_error(&mut self, error: CodeError, message: &str, origin: EmitterKind) -> bool {
        let Some(mut handler) = self.error_handler.take() else {
            return false;
        };

        handler.handle(error, message, origin);
        self.error_handler = Some(handler);
        true
    }
}

/// Common surface of every emitter flavor.
///
/// The single required emit primitive is [`Self::emit`]; the arity helpers
/// avoid building operand slices at call sites.
pub trait Emitter {
    fn kind(&self) -> EmitterKind;

    fn state(&self) -> &EmitterState;
    fn state_mut(&mut self) -> &mut EmitterState;

    fn container(&self) -> &CodeContainer;
    fn container_mut(&mut self) -> &mut CodeContainer;

    /// The emit primitive every concrete emitter implements.
    fn emit(&mut self, inst: InstId, operands: &[Operand]) -> Result<(), CodeError>;

    fn bind(&mut self, label: Label) -> Result<(), CodeError>;

    fn align(&mut self, mode: AlignMode, alignment: u32) -> Result<(), CodeError>;

    fn embed(&mut self, data: &[u8]) -> Result<(), CodeError>;

    fn embed_data_array(&mut self, type_id: TypeId, data: &[u8], item_count: usize, repeat_count: usize) -> Result<(), CodeError>;

    fn embed_label(&mut self, label: Label) -> Result<(), CodeError>;

    fn embed_label_delta(&mut self, label: Label, base: Label, width: u8) -> Result<(), CodeError>;

    fn embed_const_pool(&mut self, label: Label, pool: &ConstPool) -> Result<(), CodeError>;

    fn comment(&mut self, text: &str) -> Result<(), CodeError>;

    fn new_label(&mut self) -> Result<Label, CodeError> {
        self.container_mut().new_label()
    }

    fn new_named_label(&mut self, name: &str, label_type: LabelType, parent: Option<Label>) -> Result<Label, CodeError> {
        self.container_mut().new_named_label(name, label_type, parent)
    }

    fn emit0(&mut self, inst: InstId) -> Result<(), CodeError> {
        self.emit(inst, &[])
    }

    fn emit1(&mut self, inst: InstId, o0: impl Into<Operand>) -> Result<(), CodeError> {
        self.emit(inst, &[o0.into()])
    }

    fn emit2(&mut self, inst: InstId, o0: impl Into<Operand>, o1: impl Into<Operand>) -> Result<(), CodeError> {
        self.emit(inst, &[o0.into(), o1.into()])
    }

    fn emit3(&mut self, inst: InstId, o0: impl Into<Operand>, o1: impl Into<Operand>, o2: impl Into<Operand>) -> Result<(), CodeError> {
        self.emit(inst, &[o0.into(), o1.into(), o2.into()])
    }

    fn emit4(
        &mut self,
        inst: InstId,
        o0: impl Into<Operand>,
        o1: impl Into<Operand>,
        o2: impl Into<Operand>,
        o3: impl Into<Operand>,
    ) -> Result<(), CodeError> {
        self.emit(inst, &[o0.into(), o1.into(), o2.into(), o3.into()])
    }

    fn emit5(
        &mut self,
        inst: InstId,
        o0: impl Into<Operand>,
        o1: impl Into<Operand>,
        o2: impl Into<Operand>,
        o3: impl Into<Operand>,
        o4: impl Into<Operand>,
    ) -> Result<(), CodeError> {
        self.emit(inst, &[o0.into(), o1.into(), o2.into(), o3.into(), o4.into()])
    }

    fn emit6(
        &mut self,
        inst: InstId,
        o0: impl Into<Operand>,
        o1: impl Into<Operand>,
        o2: impl Into<Operand>,
        o3: impl Into<Operand>,
        o4: impl Into<Operand>,
        o5: impl Into<Operand>,
    ) -> Result<(), CodeError> {
        self.emit(inst, &[o0.into(), o1.into(), o2.into(), o3.into(), o4.into(), o5.into()])
    }

    fn set_inline_comment(&mut self, comment: &str) {
        self.state_mut().set_inline_comment(comment);
    }

    fn set_options(&mut self, options: EmitOptions) {
        self.state_mut().set_options(options);
    }

    fn add_inst_options(&mut self, options: EmitOptions) {
        self.state_mut().add_inst_options(options);
    }

    fn set_extra_reg(&mut self, reg: Reg) {
        self.state_mut().set_extra_reg(reg);
    }

    /// Routes `error` through the emitter's handler, then the container's,
    /// and hands it back so call sites can `return Err(...)` in one step.
    fn report_error(&mut self, error: CodeError, message: &str) -> CodeError {
        let origin = self.kind();

        if !self.state_mut().dispatch_error(error, message, origin) {
            self.container_mut().dispatch_error(error, message, origin);
        }

        error
    }
}
