// Copyright (C) 2025 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

use thiserror::Error;

/// Every fallible operation in this crate reports one of these kinds.
///
/// Errors detected at finalize time (unresolved labels, relocations that do
/// not fit their width) leave the container usable; nothing is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodeError {
    #[error("the emitter is not attached to a code container")]
    NotInitialized,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("invalid state for this operation")]
    InvalidState,

    #[error("section id does not refer to a live section")]
    InvalidSection,

    #[error("label id does not refer to a live label")]
    InvalidLabel,

    #[error("label name is empty or contains an embedded NUL")]
    InvalidLabelName,

    #[error("local label requires a valid parent label")]
    InvalidParentLabel,

    #[error("label was already bound to a section")]
    LabelAlreadyBound,

    #[error("a label with this name was already registered under the same parent")]
    LabelNameCollision,

    #[error("operand is not valid for this instruction")]
    InvalidOperand,

    #[error("operand size is not valid for this instruction")]
    InvalidOperandSize,

    #[error("instruction is unknown or not encodable on this architecture")]
    InvalidInstruction,

    #[error("a referenced label was never bound")]
    UnresolvedLabel,

    #[error("relocated value does not fit the relocation width")]
    RelocationOffsetOutOfRange,

    #[error("out of memory")]
    OutOfMemory,

    #[error("a function is already open; functions cannot nest")]
    FuncInFunc,

    #[error("an assembler is already attached to this container")]
    AlreadyAttached,

    #[error("no code was generated")]
    NoCodeGenerated,
}

/// Which flavor of emitter raised an error. Passed to [`ErrorHandler`] so a
/// handler installed on the container can tell its callers apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitterKind {
    Assembler,
    Builder,
    Compiler,
}

/// User-installed error interceptor.
///
/// `handle` may simply return, in which case the error still propagates to
/// the caller of the failing operation, or it may panic/abort if the policy
/// is fatal. A handler installed on an emitter takes precedence over one
/// installed on the container.
pub trait ErrorHandler {
    fn handle(&mut self, error: CodeError, message: &str, origin: EmitterKind);
}
