// Copyright (C) 2025 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

mod container;
mod label;
mod reloc;
mod section;

pub use self::{
    container::{
        CodeContainer,
        CopySectionFlags,
    },
    label::{
        Label,
        LabelEntry,
        LabelLink,
        LabelType,
    },
    reloc::{
        ExprId,
        Expression,
        ExpressionOp,
        ExpressionValue,
        RelocEntry,
        RelocId,
        RelocKind,
        RelocPayload,
    },
    section::{
        CodeBuffer,
        Section,
        SectionFlags,
        SectionId,
    },
};

pub(crate) use self::reloc::{signed_fits, write_value_le};
