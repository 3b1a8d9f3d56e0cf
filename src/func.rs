// Copyright (C) 2025 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

use crate::operand::{Reg, RegGroup, RegType, TypeId};
use crate::{Arch, ArchInfo, CodeError};

/// Calling conventions the reference lowerers understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallConvId {
    /// System-V AMD64: integer arguments in rdi, rsi, rdx, rcx, r8, r9;
    /// vector arguments in xmm0..xmm7; the rest on the stack.
    SystemV64,
    /// 32-bit cdecl: everything on the stack, return value in eax.
    Cdecl32,
}

impl CallConvId {
    #[must_use]
    pub const fn default_for(arch: Arch) -> Option<Self> {
        match arch {
            Arch::X64 => Some(Self::SystemV64),
            Arch::X86 => Some(Self::Cdecl32),
            _ => None,
        }
    }
}

/// Architecture-independent description of a function's type: calling
/// convention, return type and argument types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncSignature {
    call_conv: CallConvId,
    ret: Option<TypeId>,
    args: Vec<TypeId>,
}

impl FuncSignature {
    #[must_use]
    pub fn new(call_conv: CallConvId) -> Self {
        Self {
            call_conv,
            ret: None,
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_ret(mut self, type_id: TypeId) -> Self {
        self.ret = Some(type_id);
        self
    }

    #[must_use]
    pub fn with_arg(mut self, type_id: TypeId) -> Self {
        self.args.push(type_id);
        self
    }

    #[must_use]
    pub const fn call_conv(&self) -> CallConvId {
        self.call_conv
    }

    #[must_use]
    pub const fn ret(&self) -> Option<TypeId> {
        self.ret
    }

    #[must_use]
    pub fn args(&self) -> &[TypeId] {
        &self.args
    }

    #[must_use]
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }
}

/// Where one argument or return value lives after lowering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgAssignment {
    Reg(Reg),
    /// Byte offset from the incoming stack pointer.
    Stack(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuncValue {
    pub type_id: TypeId,
    pub assignment: ArgAssignment,
}

/// A [`FuncSignature`] lowered to concrete argument locations by a calling
/// convention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncDetail {
    call_conv: CallConvId,
    args: Vec<FuncValue>,
    ret: Option<FuncValue>,
    arg_stack_size: u32,
}

impl FuncDetail {
    #[must_use]
    pub const fn call_conv(&self) -> CallConvId {
        self.call_conv
    }

    #[must_use]
    pub fn args(&self) -> &[FuncValue] {
        &self.args
    }

    #[must_use]
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    #[must_use]
    pub const fn ret(&self) -> Option<FuncValue> {
        self.ret
    }

    /// Bytes of stack the caller must reserve for overflow arguments.
    #[must_use]
    pub const fn arg_stack_size(&self) -> u32 {
        self.arg_stack_size
    }
}

/// The prolog/epilog plan for one function. The register allocator fills
/// this in; the core only transports it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FuncFrame {
    local_stack_size: u32,
    stack_alignment: u32,
    saved_gp_regs: u32,
    uses_frame_pointer: bool,
}

impl FuncFrame {
    #[must_use]
    pub const fn local_stack_size(&self) -> u32 {
        self.local_stack_size
    }

    pub fn set_local_stack_size(&mut self, size: u32) {
        self.local_stack_size = size;
    }

    #[must_use]
    pub const fn stack_alignment(&self) -> u32 {
        self.stack_alignment
    }

    pub fn set_stack_alignment(&mut self, alignment: u32) {
        self.stack_alignment = alignment;
    }

    /// Bitmask of callee-saved general-purpose registers the prolog must
    /// preserve.
    #[must_use]
    pub const fn saved_gp_regs(&self) -> u32 {
        self.saved_gp_regs
    }

    pub fn add_saved_gp_reg(&mut self, id: u32) {
        self.saved_gp_regs |= 1 << (id & 31);
    }

    #[must_use]
    pub const fn uses_frame_pointer(&self) -> bool {
        self.uses_frame_pointer
    }

    pub fn set_uses_frame_pointer(&mut self, value: bool) {
        self.uses_frame_pointer = value;
    }
}

/// Lowers a signature into argument locations for one calling convention.
pub trait CallConvLowerer: Sync {
    fn lower(&self, arch: &ArchInfo, signature: &FuncSignature) -> Result<FuncDetail, CodeError>;
}

#[must_use]
pub(crate) fn lowerer_for(call_conv: CallConvId) -> &'static dyn CallConvLowerer {
    match call_conv {
        CallConvId::SystemV64 => &SystemVLowerer,
        CallConvId::Cdecl32 => &Cdecl32Lowerer,
    }
}

const SYSTEMV_INT_ARG_REGS: [u32; 6] = [7, 6, 2, 1, 8, 9]; // rdi, rsi, rdx, rcx, r8, r9
const SYSTEMV_VEC_ARG_COUNT: u32 = 8; // xmm0..xmm7

pub struct SystemVLowerer;

impl CallConvLowerer for SystemVLowerer {
    fn lower(&self, arch: &ArchInfo, signature: &FuncSignature) -> Result<FuncDetail, CodeError> {
        if arch.arch() != Arch::X64 {
            return Err(CodeError::InvalidArgument);
        }

        let mut args = Vec::with_capacity(signature.arg_count());
        let mut next_int = 0usize;
        let mut next_vec = 0u32;
        let mut stack_offset = 0u32;

        for &type_id in signature.args() {
            let reg_type = type_id.reg_type(arch.gp_size());
            let assignment = match reg_type.group() {
                RegGroup::Gp => {
                    if next_int < SYSTEMV_INT_ARG_REGS.len() {
                        let reg = Reg::new(reg_type, SYSTEMV_INT_ARG_REGS[next_int]);
                        next_int += 1;
                        ArgAssignment::Reg(reg)
                    } else {
                        let offset = stack_offset;
                        stack_offset += 8;
                        ArgAssignment::Stack(offset)
                    }
                }

                RegGroup::Vec => {
                    if next_vec < SYSTEMV_VEC_ARG_COUNT {
                        let reg = Reg::new(RegType::Vec128, next_vec);
                        next_vec += 1;
                        ArgAssignment::Reg(reg)
                    } else {
                        let offset = stack_offset;
                        stack_offset += 8;
                        ArgAssignment::Stack(offset)
                    }
                }

                RegGroup::KMask => return Err(CodeError::InvalidArgument),
            };

            args.push(FuncValue {
                type_id,
                assignment,
            });
        }

        let ret = match signature.ret() {
            None => None,
            Some(TypeId::Void) => None,
            Some(type_id) => {
                let reg_type = type_id.reg_type(arch.gp_size());
                let reg = match reg_type.group() {
                    RegGroup::Gp => Reg::new(reg_type, 0),      // rax
                    RegGroup::Vec => Reg::new(reg_type, 0),     // xmm0
                    RegGroup::KMask => return Err(CodeError::InvalidArgument),
                };

                Some(FuncValue {
                    type_id,
                    assignment: ArgAssignment::Reg(reg),
                })
            }
        };

        Ok(FuncDetail {
            call_conv: signature.call_conv(),
            args,
            ret,
            arg_stack_size: stack_offset,
        })
    }
}

pub struct Cdecl32Lowerer;

impl CallConvLowerer for Cdecl32Lowerer {
    fn lower(&self, arch: &ArchInfo, signature: &FuncSignature) -> Result<FuncDetail, CodeError> {
        if arch.arch() != Arch::X86 {
            return Err(CodeError::InvalidArgument);
        }

        let mut args = Vec::with_capacity(signature.arg_count());
        let mut stack_offset = 0u32;

        for &type_id in signature.args() {
            let size = type_id.size(arch.gp_size()).max(4);
            let offset = stack_offset;
            stack_offset += (size + 3) & !3;

            args.push(FuncValue {
                type_id,
                assignment: ArgAssignment::Stack(offset),
            });
        }

        let ret = match signature.ret() {
            None | Some(TypeId::Void) => None,
            Some(type_id) => Some(FuncValue {
                type_id,
                assignment: ArgAssignment::Reg(Reg::new(RegType::Gp32, 0)), // eax
            }),
        };

        Ok(FuncDetail {
            call_conv: signature.call_conv(),
            args,
            ret,
            arg_stack_size: stack_offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SubArch;

    fn x64() -> ArchInfo {
        ArchInfo::new(Arch::X64, SubArch::None).unwrap()
    }

    #[test]
    fn integer_arguments_use_the_systemv_order() {
        let signature = FuncSignature::new(CallConvId::SystemV64)
            .with_ret(TypeId::U64)
            .with_arg(TypeId::U64)
            .with_arg(TypeId::U32);

        let detail = SystemVLowerer.lower(&x64(), &signature).unwrap();

        assert_eq!(detail.args()[0].assignment, ArgAssignment::Reg(Reg::new(RegType::Gp64, 7)));
        assert_eq!(detail.args()[1].assignment, ArgAssignment::Reg(Reg::new(RegType::Gp32, 6)));
        assert_eq!(detail.ret().unwrap().assignment, ArgAssignment::Reg(Reg::new(RegType::Gp64, 0)));
        assert_eq!(detail.arg_stack_size(), 0);
    }

    #[test]
    fn overflow_arguments_spill_to_the_stack() {
        let mut signature = FuncSignature::new(CallConvId::SystemV64);
        for _ in 0..8 {
            signature = signature.with_arg(TypeId::U64);
        }

        let detail = SystemVLowerer.lower(&x64(), &signature).unwrap();

        assert_eq!(detail.args()[5].assignment, ArgAssignment::Reg(Reg::new(RegType::Gp64, 9)));
        assert_eq!(detail.args()[6].assignment, ArgAssignment::Stack(0));
        assert_eq!(detail.args()[7].assignment, ArgAssignment::Stack(8));
        assert_eq!(detail.arg_stack_size(), 16);
    }

    #[test]
    fn floats_lower_to_vector_registers() {
        let signature = FuncSignature::new(CallConvId::SystemV64)
            .with_ret(TypeId::F64)
            .with_arg(TypeId::F32)
            .with_arg(TypeId::F64);

        let detail = SystemVLowerer.lower(&x64(), &signature).unwrap();

        assert_eq!(detail.args()[0].assignment, ArgAssignment::Reg(Reg::new(RegType::Vec128, 0)));
        assert_eq!(detail.args()[1].assignment, ArgAssignment::Reg(Reg::new(RegType::Vec128, 1)));
        assert_eq!(detail.ret().unwrap().assignment, ArgAssignment::Reg(Reg::new(RegType::Vec128, 0)));
    }
}
