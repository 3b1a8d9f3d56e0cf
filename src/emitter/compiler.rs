// Copyright (C) 2025 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

use log::debug;

use crate::code::{CodeContainer, Label, LabelType};
use crate::const_pool::ConstPool;
use crate::emitter::{AlignMode, Builder, Emitter, EmitterState, InstId, NodeId, NodeKind, Pass, SentinelKind};
use crate::func::{lowerer_for, FuncDetail, FuncFrame, FuncSignature};
use crate::operand::{virt_id_of, virt_index_of, is_virt_id, Mem, Operand, Reg, RegType, TypeId};
use crate::{CodeError, EmitterKind};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VirtRegFlags(u32);

impl VirtRegFlags {
    pub const NONE: Self = Self(0);
    /// Pre-assigned to a specific physical register; the allocator must not
    /// move it.
    pub const FIXED: Self = Self(1 << 0);
    /// A stack slot dressed as a register; it must never be materialized
    /// into a general-purpose register.
    pub const STACK_ONLY: Self = Self(1 << 1);

    #[must_use]
    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// A virtual register: the compiler hands these out instead of physical
/// registers and a downstream register allocator assigns the real ones.
#[derive(Debug, Clone)]
pub struct VirtReg {
    id: u32,
    reg_type: RegType,
    virt_size: u32,
    alignment: u32,
    type_id: TypeId,
    weight: u8,
    flags: VirtRegFlags,
    name: Option<Box<str>>,
    work_state: Option<u32>,
}

impl VirtReg {
    /// Virtual id, with the virtual bit set; usable directly in operands.
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// The physical register type this virtual register maps to.
    #[must_use]
    pub const fn reg_type(&self) -> RegType {
        self.reg_type
    }

    /// Size of the value; may be smaller than the physical register, e.g. a
    /// scalar float living in a 128-bit vector register.
    #[must_use]
    pub const fn virt_size(&self) -> u32 {
        self.virt_size
    }

    #[must_use]
    pub const fn alignment(&self) -> u32 {
        self.alignment
    }

    #[must_use]
    pub const fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Allocation priority hint, 0..=255.
    #[must_use]
    pub const fn weight(&self) -> u8 {
        self.weight
    }

    pub fn set_weight(&mut self, weight: u8) {
        self.weight = weight;
    }

    #[must_use]
    pub const fn flags(&self) -> VirtRegFlags {
        self.flags
    }

    #[must_use]
    pub const fn is_stack_only(&self) -> bool {
        self.flags.contains(VirtRegFlags::STACK_ONLY)
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Scratch slot for the register allocator. The allocator attaches its
    /// per-register work index here and must clear it again before it
    /// returns.
    #[must_use]
    pub const fn work_state(&self) -> Option<u32> {
        self.work_state
    }

    pub fn set_work_state(&mut self, state: u32) {
        self.work_state = Some(state);
    }

    pub fn clear_work_state(&mut self) {
        self.work_state = None;
    }

    /// The operand-ready register handle for this virtual register.
    #[must_use]
    pub const fn as_reg(&self) -> Reg {
        Reg::new(self.reg_type, self.id)
    }
}

/// Identifier of a [`JumpAnnotation`] within one compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JumpAnnotationId(u32);

impl JumpAnnotationId {
    #[must_use]
    const fn index(&self) -> usize {
        self.0 as usize
    }
}

/// The set of labels an indirect jump may land on, so a register allocator
/// can reconstruct control flow across it.
#[derive(Debug, Clone)]
pub struct JumpAnnotation {
    id: JumpAnnotationId,
    labels: Vec<Label>,
}

impl JumpAnnotation {
    #[must_use]
    pub const fn id(&self) -> JumpAnnotationId {
        self.id
    }

    #[must_use]
    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    /// Adds a possible target; duplicates coalesce.
    pub fn add_label(&mut self, label: Label) {
        if !self.labels.contains(&label) {
            self.labels.push(label);
        }
    }
}

/// Payload of a func node: a label node opening a function region.
#[derive(Debug)]
pub struct FuncData {
    pub detail: FuncDetail,
    pub frame: FuncFrame,
    pub entry: Label,
    pub exit: Label,
    pub end: Option<NodeId>,
    /// Virtual registers bound to the lowered argument slots.
    pub args: Vec<Option<Reg>>,
}

/// Payload of a func-ret node; up to two return operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuncRetData {
    pub operands: [Operand; 2],
}

/// Payload of an invoke node: a call site with its own lowered signature.
#[derive(Debug)]
pub struct InvokeData {
    pub inst: InstId,
    pub target: Operand,
    pub detail: FuncDetail,
    pub rets: [Operand; 2],
    pub args: Vec<Operand>,
}

/// Payload of a jump node; the annotation lists the possible targets of an
/// indirect jump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JumpData {
    pub inst: InstId,
    pub target: Operand,
    pub annotation: Option<JumpAnnotationId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstScope {
    /// Pooled per function, flushed at `end_func`.
    Local,
    /// Pooled per compiler, flushed at `finalize`.
    Global,
}

struct PoolState {
    label: Label,
    pool: ConstPool,
}

/// A builder that additionally owns virtual registers, function regions and
/// jump annotations, producing a graph a register allocator can consume.
pub struct Compiler<'code> {
    base: Builder<'code>,
    current_func: Option<NodeId>,
    annotations: Vec<JumpAnnotation>,
    local_pool: Option<PoolState>,
    global_pool: Option<PoolState>,
}

impl<'code> Compiler<'code> {
    pub fn attach(code: &'code mut CodeContainer) -> Result<Self, CodeError> {
        Ok(Self {
            base: Builder::attach_with_kind(code, EmitterKind::Compiler)?,
            current_func: None,
            annotations: Vec::new(),
            local_pool: None,
            global_pool: None,
        })
    }

    /// The underlying node-graph builder, for passes and graph surgery.
    #[must_use]
    pub fn builder(&self) -> &Builder<'code> {
        &self.base
    }

    #[must_use]
    pub fn builder_mut(&mut self) -> &mut Builder<'code> {
        &mut self.base
    }

    //
    // Virtual registers
    //

    pub fn new_virt_reg(&mut self, type_id: TypeId, reg_type: RegType, name: Option<&str>) -> Result<Reg, CodeError> {
        if matches!(reg_type, RegType::None) || matches!(type_id, TypeId::Void) {
            return Err(self.report_error(CodeError::InvalidArgument, "virtual registers need a concrete type"));
        }

        let gp_size = self.base.container().arch().gp_size();
        let size = type_id.size(gp_size);

        self.alloc_virt_reg(type_id, reg_type, size, size.next_power_of_two(), VirtRegFlags::NONE, name)
    }

    /// Allocates a stack area addressed through a virtual register. The
    /// register is stack-only: a register allocator must reject it anywhere
    /// a general-purpose register is expected.
    pub fn new_stack(&mut self, size: u32, alignment: u32, name: Option<&str>) -> Result<Reg, CodeError> {
        if size == 0 {
            return Err(self.report_error(CodeError::InvalidArgument, "stack areas cannot be empty"));
        }

        let alignment = alignment.max(1);
        if !alignment.is_power_of_two() || alignment > 64 {
            return Err(self.report_error(CodeError::InvalidArgument, "stack alignment must be a power of two up to 64"));
        }

        let gp_size = self.base.container().arch().gp_size();
        let reg_type = TypeId::UIntPtr.reg_type(gp_size);

        self.alloc_virt_reg(TypeId::UIntPtr, reg_type, size, alignment, VirtRegFlags::STACK_ONLY, name)
    }

    fn alloc_virt_reg(
        &mut self,
        type_id: TypeId,
        reg_type: RegType,
        virt_size: u32,
        alignment: u32,
        flags: VirtRegFlags,
        name: Option<&str>,
    ) -> Result<Reg, CodeError> {
        let index = self.base.container().virt_regs().len() as u32;
        let id = virt_id_of(index);

        let reg = VirtReg {
            id,
            reg_type,
            virt_size,
            alignment,
            type_id,
            weight: 1,
            flags,
            name: name.map(Into::into),
            work_state: None,
        };

        self.base.container_mut().push_virt_reg(reg)?;
        debug!("New virtual register v{index} ({type_id:?}, {reg_type:?})");
        Ok(Reg::new(reg_type, id))
    }

    #[must_use]
    pub fn is_virt_id_valid(&self, id: u32) -> bool {
        is_virt_id(id) && (virt_index_of(id) as usize) < self.base.container().virt_regs().len()
    }

    #[must_use]
    pub fn virt_reg_by_id(&self, id: u32) -> Option<&VirtReg> {
        if !is_virt_id(id) {
            return None;
        }
        self.base.container().virt_regs().get(virt_index_of(id) as usize)
    }

    #[must_use]
    pub fn virt_reg_by_reg(&self, reg: &Reg) -> Option<&VirtReg> {
        self.virt_reg_by_id(reg.id())
    }

    pub fn virt_reg_mut_by_id(&mut self, id: u32) -> Option<&mut VirtReg> {
        if !is_virt_id(id) {
            return None;
        }
        self.base.container_mut().virt_regs_mut().get_mut(virt_index_of(id) as usize)
    }

    //
    // Constants
    //

    /// Returns a memory operand addressing `data` inside the requested
    /// constant pool. Identical patterns within one scope share a slot.
    pub fn new_const(&mut self, scope: ConstScope, data: &[u8]) -> Result<Mem, CodeError> {
        if matches!(scope, ConstScope::Local) && self.current_func.is_none() {
            return Err(self.report_error(CodeError::InvalidState, "local constants need an open function"));
        }

        let needs_label = match scope {
            ConstScope::Local => self.local_pool.is_none(),
            ConstScope::Global => self.global_pool.is_none(),
        };

        if needs_label {
            let label = self.base.new_label()?;
            let state = PoolState {
                label,
                pool: ConstPool::new(),
            };
            match scope {
                ConstScope::Local => self.local_pool = Some(state),
                ConstScope::Global => self.global_pool = Some(state),
            }
        }

        let state = match scope {
            ConstScope::Local => self.local_pool.as_mut(),
            ConstScope::Global => self.global_pool.as_mut(),
        };
        let Some(state) = state else {
            return Err(CodeError::InvalidState);
        };

        let offset = state.pool.add(data)?;
        let displacement = i32::try_from(offset).map_err(|_| CodeError::InvalidArgument)?;
        let size = u8::try_from(data.len().min(64)).map_err(|_| CodeError::InvalidArgument)?;

        Ok(Mem::with_base_label(state.label, displacement).with_size(size))
    }

    //
    // Functions
    //

    /// Opens a function region: lowers the signature, appends a func node
    /// followed by its end sentinel, and leaves the cursor inside.
    pub fn add_func(&mut self, signature: FuncSignature) -> Result<NodeId, CodeError> {
        if self.current_func.is_some() {
            return Err(self.report_error(CodeError::FuncInFunc, "functions cannot nest"));
        }

        let result = (|| {
            let arch = *self.base.container().arch();
            let detail = lowerer_for(signature.call_conv()).lower(&arch, &signature)?;

            let entry = self.base.new_label()?;
            let exit = self.base.new_label()?;
            let arg_count = detail.arg_count();

            let func = self.base.new_node(NodeKind::Func(Box::new(FuncData {
                detail,
                frame: FuncFrame::default(),
                entry,
                exit,
                end: None,
                args: vec![None; arg_count],
            })))?;
            self.base.add_node(func)?;

            let end = self.base.new_node(NodeKind::Sentinel(SentinelKind::FuncEnd))?;
            self.base.add_node(end)?;

            if let NodeKind::Func(data) = self.base.node_mut(func)?.kind_mut() {
                data.end = Some(end);
            }

            self.base.set_cursor(Some(func));
            Ok(func)
        })();

        match result {
            Ok(func) => {
                debug!("Opened function region at node {func:?}");
                self.current_func = Some(func);
                Ok(func)
            }
            Err(error) => Err(self.report_error(error, "failed to open a function")),
        }
    }

    #[must_use]
    pub const fn current_func(&self) -> Option<NodeId> {
        self.current_func
    }

    pub fn func_data(&self, node: NodeId) -> Result<&FuncData, CodeError> {
        match self.base.node(node)?.kind() {
            NodeKind::Func(data) => Ok(data),
            _ => Err(CodeError::InvalidArgument),
        }
    }

    /// Binds the virtual register carrying argument `index` of the open
    /// function.
    pub fn set_arg(&mut self, index: usize, reg: Reg) -> Result<(), CodeError> {
        let Some(func) = self.current_func else {
            return Err(self.report_error(CodeError::InvalidState, "no function is open"));
        };

        if !reg.is_virtual() {
            return Err(self.report_error(CodeError::InvalidArgument, "arguments bind to virtual registers"));
        }

        let result = match self.base.node_mut(func)?.kind_mut() {
            NodeKind::Func(data) => {
                if index >= data.args.len() {
                    Err(CodeError::InvalidArgument)
                } else {
                    data.args[index] = Some(reg);
                    Ok(())
                }
            }
            _ => Err(CodeError::InvalidArgument),
        };

        result.map_err(|error| self.report_error(error, "failed to bind an argument register"))
    }

    /// Appends a func-ret node carrying up to two return operands.
    pub fn add_ret(&mut self, o0: Option<Operand>, o1: Option<Operand>) -> Result<NodeId, CodeError> {
        if self.current_func.is_none() {
            return Err(self.report_error(CodeError::InvalidState, "ret is only legal inside a function"));
        }

        let data = FuncRetData {
            operands: [o0.unwrap_or_default(), o1.unwrap_or_default()],
        };

        let result = self.base.add_kind(NodeKind::FuncRet(data));
        self.base.state_mut().reset_per_inst();
        result.map_err(|error| self.report_error(error, "failed to add a ret node"))
    }

    /// Closes the open function: binds its exit label, flushes the local
    /// constant pool and moves the cursor past the end sentinel.
    pub fn end_func(&mut self) -> Result<(), CodeError> {
        let Some(func) = self.current_func else {
            return Err(self.report_error(CodeError::InvalidState, "no function is open"));
        };

        let result = (|| {
            let (exit, end) = {
                let data = self.func_data(func)?;
                (data.exit, data.end)
            };

            self.base.add_label_node(exit)?;

            if let Some(state) = self.local_pool.take() {
                if !state.pool.is_empty() {
                    self.base.add_kind(NodeKind::EmbedConstPool {
                        label: state.label,
                        pool: state.pool,
                    })?;
                }
            }

            let end = end.ok_or(CodeError::InvalidState)?;
            self.base.set_cursor(Some(end));
            Ok(())
        })();

        match result {
            Ok(()) => {
                debug!("Closed function region at node {func:?}");
                self.current_func = None;
                Ok(())
            }
            Err(error) => Err(self.report_error(error, "failed to close the function")),
        }
    }

    //
    // Invocations
    //

    /// Appends an invoke node: a call site with its own lowered signature,
    /// argument slots and up to two return slots.
    pub fn add_invoke(&mut self, inst: InstId, target: Operand, signature: FuncSignature) -> Result<NodeId, CodeError> {
        let result = (|| {
            let arch = *self.base.container().arch();
            let detail = lowerer_for(signature.call_conv()).lower(&arch, &signature)?;
            let arg_count = detail.arg_count();

            self.base.add_kind(NodeKind::Invoke(Box::new(InvokeData {
                inst,
                target,
                detail,
                rets: [Operand::none(); 2],
                args: vec![Operand::none(); arg_count],
            })))
        })();

        self.base.state_mut().reset_per_inst();
        result.map_err(|error| self.report_error(error, "failed to add an invoke node"))
    }

    pub fn invoke_set_arg(&mut self, node: NodeId, index: usize, operand: Operand) -> Result<(), CodeError> {
        let result = match self.base.node_mut(node)?.kind_mut() {
            NodeKind::Invoke(data) => {
                if index >= data.args.len() {
                    Err(CodeError::InvalidArgument)
                } else {
                    data.args[index] = operand;
                    Ok(())
                }
            }
            _ => Err(CodeError::InvalidArgument),
        };

        result.map_err(|error| self.report_error(error, "failed to set an invoke argument"))
    }

    pub fn invoke_set_ret(&mut self, node: NodeId, index: usize, operand: Operand) -> Result<(), CodeError> {
        let result = match self.base.node_mut(node)?.kind_mut() {
            NodeKind::Invoke(data) => {
                if index >= data.rets.len() {
                    Err(CodeError::InvalidArgument)
                } else {
                    data.rets[index] = operand;
                    Ok(())
                }
            }
            _ => Err(CodeError::InvalidArgument),
        };

        result.map_err(|error| self.report_error(error, "failed to set an invoke return"))
    }

    //
    // Jump annotations
    //

    pub fn new_jump_annotation(&mut self) -> Result<JumpAnnotationId, CodeError> {
        self.annotations.try_reserve(1).map_err(|_| CodeError::OutOfMemory)?;

        let id = JumpAnnotationId(u32::try_from(self.annotations.len()).map_err(|_| CodeError::OutOfMemory)?);
        self.annotations.push(JumpAnnotation {
            id,
            labels: Vec::new(),
        });

        Ok(id)
    }

    #[must_use]
    pub fn jump_annotation(&self, id: JumpAnnotationId) -> Option<&JumpAnnotation> {
        self.annotations.get(id.index())
    }

    pub fn add_annotation_label(&mut self, id: JumpAnnotationId, label: Label) -> Result<(), CodeError> {
        if !self.base.container().is_label_valid(label) {
            return Err(self.report_error(CodeError::InvalidLabel, "annotation target label is invalid"));
        }

        let Some(annotation) = self.annotations.get_mut(id.index()) else {
            return Err(self.report_error(CodeError::InvalidArgument, "unknown jump annotation"));
        };

        annotation.add_label(label);
        Ok(())
    }

    /// Appends a jump node. Without annotation labels the jump must target
    /// a label directly, otherwise a register allocator cannot recover the
    /// control-flow edges.
    pub fn emit_annotated_jump(&mut self, inst: InstId, target: Operand, annotation: Option<JumpAnnotationId>) -> Result<NodeId, CodeError> {
        let annotated = annotation
            .and_then(|id| self.jump_annotation(id))
            .is_some_and(|annotation| !annotation.labels().is_empty());

        if !target.is_label() && !annotated {
            return Err(self.report_error(
                CodeError::InvalidArgument,
                "an indirect jump needs a non-empty jump annotation",
            ));
        }

        let result = self.base.add_kind(NodeKind::Jump(JumpData {
            inst,
            target,
            annotation,
        }));

        self.base.state_mut().reset_per_inst();
        result.map_err(|error| self.report_error(error, "failed to add a jump node"))
    }

    //
    // Passes & finalization
    //

    pub fn add_pass(&mut self, pass: Box<dyn Pass>) {
        self.base.add_pass(pass);
    }

    /// Flushes the global constant pool and serializes the graph. Illegal
    /// while a function is open.
    pub fn finalize(&mut self) -> Result<(), CodeError> {
        if self.current_func.is_some() {
            return Err(self.report_error(CodeError::InvalidState, "finalize with an open function"));
        }

        if let Some(state) = self.global_pool.take() {
            if !state.pool.is_empty() {
                let tail = self.base.tail();
                self.base.set_cursor(tail);
                self.base
                    .add_kind(NodeKind::EmbedConstPool {
                        label: state.label,
                        pool: state.pool,
                    })
                    .map_err(|error| self.report_error(error, "failed to flush the global constant pool"))?;
            }
        }

        self.base.finalize()
    }
}

impl Emitter for Compiler<'_> {
    fn kind(&self) -> EmitterKind {
        EmitterKind::Compiler
    }

    fn state(&self) -> &EmitterState {
        self.base.state()
    }

    fn state_mut(&mut self) -> &mut EmitterState {
        self.base.state_mut()
    }

    fn container(&self) -> &CodeContainer {
        self.base.container()
    }

    fn container_mut(&mut self) -> &mut CodeContainer {
        self.base.container_mut()
    }

    fn emit(&mut self, inst: InstId, operands: &[Operand]) -> Result<(), CodeError> {
        self.base.emit(inst, operands)
    }

    fn bind(&mut self, label: Label) -> Result<(), CodeError> {
        self.base.bind(label)
    }

    fn align(&mut self, mode: AlignMode, alignment: u32) -> Result<(), CodeError> {
        self.base.align(mode, alignment)
    }

    fn embed(&mut self, data: &[u8]) -> Result<(), CodeError> {
        self.base.embed(data)
    }

    fn embed_data_array(&mut self, type_id: TypeId, data: &[u8], item_count: usize, repeat_count: usize) -> Result<(), CodeError> {
        self.base.embed_data_array(type_id, data, item_count, repeat_count)
    }

    fn embed_label(&mut self, label: Label) -> Result<(), CodeError> {
        self.base.embed_label(label)
    }

    fn embed_label_delta(&mut self, label: Label, base: Label, width: u8) -> Result<(), CodeError> {
        self.base.embed_label_delta(label, base, width)
    }

    fn embed_const_pool(&mut self, label: Label, pool: &ConstPool) -> Result<(), CodeError> {
        self.base.embed_const_pool(label, pool)
    }

    fn comment(&mut self, text: &str) -> Result<(), CodeError> {
        self.base.comment(text)
    }

    fn new_label(&mut self) -> Result<Label, CodeError> {
        self.base.new_label()
    }

    fn new_named_label(&mut self, name: &str, label_type: LabelType, parent: Option<Label>) -> Result<Label, CodeError> {
        self.base.new_named_label(name, label_type, parent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::func::CallConvId;
    use crate::x86::inst;
    use crate::{Arch, ArchInfo, SubArch};

    fn container() -> CodeContainer {
        CodeContainer::new(ArchInfo::new(Arch::X64, SubArch::None).unwrap())
    }

    #[test]
    fn nested_functions_are_rejected() {
        let mut code = container();
        let mut compiler = Compiler::attach(&mut code).unwrap();

        let signature = FuncSignature::new(CallConvId::SystemV64);
        compiler.add_func(signature.clone()).unwrap();

        assert_eq!(compiler.add_func(signature), Err(CodeError::FuncInFunc));
    }

    #[test]
    fn ret_outside_a_function_is_rejected() {
        let mut code = container();
        let mut compiler = Compiler::attach(&mut code).unwrap();

        assert_eq!(compiler.add_ret(None, None), Err(CodeError::InvalidState));
    }

    #[test]
    fn finalize_with_an_open_function_is_rejected() {
        let mut code = container();
        let mut compiler = Compiler::attach(&mut code).unwrap();

        compiler.add_func(FuncSignature::new(CallConvId::SystemV64)).unwrap();
        assert_eq!(compiler.finalize(), Err(CodeError::InvalidState));

        compiler.end_func().unwrap();
        compiler.finalize().unwrap();
    }

    #[test]
    fn arguments_bind_to_virtual_registers() {
        let mut code = container();
        let mut compiler = Compiler::attach(&mut code).unwrap();

        let signature = FuncSignature::new(CallConvId::SystemV64)
            .with_arg(TypeId::U64)
            .with_arg(TypeId::U64);
        let func = compiler.add_func(signature).unwrap();

        let value = compiler.new_virt_reg(TypeId::U64, RegType::Gp64, Some("value")).unwrap();
        compiler.set_arg(0, value).unwrap();
        assert_eq!(compiler.set_arg(5, value), Err(CodeError::InvalidArgument));

        assert_eq!(compiler.func_data(func).unwrap().args[0], Some(value));
        assert_eq!(compiler.func_data(func).unwrap().args[1], None);
    }

    #[test]
    fn jump_annotations_coalesce_duplicate_targets() {
        let mut code = container();
        let mut compiler = Compiler::attach(&mut code).unwrap();

        let a = compiler.new_label().unwrap();
        let b = compiler.new_label().unwrap();
        let annotation = compiler.new_jump_annotation().unwrap();

        compiler.add_annotation_label(annotation, a).unwrap();
        compiler.add_annotation_label(annotation, b).unwrap();
        compiler.add_annotation_label(annotation, a).unwrap();

        assert_eq!(compiler.jump_annotation(annotation).unwrap().labels(), &[a, b]);
    }

    #[test]
    fn indirect_jump_requires_an_annotation() {
        let mut code = container();
        let mut compiler = Compiler::attach(&mut code).unwrap();

        let target = crate::x86::RAX.as_operand();
        assert_eq!(
            compiler.emit_annotated_jump(inst::JMP, target, None),
            Err(CodeError::InvalidArgument),
        );

        let label = compiler.new_label().unwrap();
        let annotation = compiler.new_jump_annotation().unwrap();
        compiler.add_annotation_label(annotation, label).unwrap();
        compiler.emit_annotated_jump(inst::JMP, target, Some(annotation)).unwrap();
    }
}
