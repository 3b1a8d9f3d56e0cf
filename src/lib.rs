// Copyright (C) 2025 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

mod arch;
mod code;
mod const_pool;
mod emitter;
mod error;
mod func;
mod operand;
pub mod x86;

pub use self::{
    arch::{
        Arch,
        ArchInfo,
        SubArch,
    },
    code::{
        CodeBuffer,
        CodeContainer,
        CopySectionFlags,
        ExprId,
        Expression,
        ExpressionOp,
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
    },
    const_pool::ConstPool,
    emitter::{
        AlignMode,
        Assembler,
        Builder,
        CodeWriter,
        Compiler,
        ConstScope,
        Emitter,
        EmitterState,
        EmitOptions,
        Formatter,
        FuncData,
        FuncRetData,
        InstData,
        InstId,
        InstructionEncoder,
        InvokeData,
        JumpAnnotation,
        JumpAnnotationId,
        JumpData,
        Node,
        NodeId,
        NodeKind,
        Pass,
        PendingFixup,
        SentinelKind,
        VirtReg,
        VirtRegFlags,
    },
    error::{
        CodeError,
        EmitterKind,
        ErrorHandler,
    },
    func::{
        ArgAssignment,
        CallConvId,
        CallConvLowerer,
        Cdecl32Lowerer,
        FuncDetail,
        FuncFrame,
        FuncSignature,
        FuncValue,
        SystemVLowerer,
    },
    operand::{
        is_virt_id,
        virt_id_of,
        virt_index_of,
        Imm,
        Mem,
        MemShift,
        OpType,
        Operand,
        Reg,
        RegGroup,
        RegType,
        TypeId,
        INVALID_ID,
        VIRT_ID_BIT,
    },
};
