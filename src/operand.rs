// Copyright (C) 2025 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

use crate::code::Label;

/// Register ids with this bit set refer to virtual registers owned by a
/// `Compiler`; ids without it are physical, architecture-defined numbers.
pub const VIRT_ID_BIT: u32 = 0x8000_0000;

pub const INVALID_ID: u32 = u32::MAX;

#[must_use]
pub const fn is_virt_id(id: u32) -> bool {
    id & VIRT_ID_BIT != 0
}

/// Index into the container's virtual-register table for a virtual id.
#[must_use]
pub const fn virt_index_of(id: u32) -> u32 {
    id & !VIRT_ID_BIT
}

#[must_use]
pub const fn virt_id_of(index: u32) -> u32 {
    index | VIRT_ID_BIT
}

/// Discriminant of an [`Operand`], stored in the low signature bits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpType {
    #[default]
    None = 0,
    Reg = 1,
    Mem = 2,
    Imm = 3,
    Label = 4,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RegType {
    #[default]
    None = 0,
    Gp8Lo = 1,
    Gp8Hi = 2,
    Gp16 = 3,
    Gp32 = 4,
    Gp64 = 5,
    Vec128 = 6,
    Vec256 = 7,
    Vec512 = 8,
    KMask = 9,
    Rip = 10,
}

impl RegType {
    #[must_use]
    pub const fn size(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::Gp8Lo | Self::Gp8Hi => 1,
            Self::Gp16 => 2,
            Self::Gp32 => 4,
            Self::Gp64 | Self::Rip | Self::KMask => 8,
            Self::Vec128 => 16,
            Self::Vec256 => 32,
            Self::Vec512 => 64,
        }
    }

    #[must_use]
    pub const fn group(&self) -> RegGroup {
        match self {
            Self::Vec128 | Self::Vec256 | Self::Vec512 => RegGroup::Vec,
            Self::KMask => RegGroup::KMask,
            _ => RegGroup::Gp,
        }
    }

    const fn from_bits(bits: u32) -> Self {
        match bits {
            1 => Self::Gp8Lo,
            2 => Self::Gp8Hi,
            3 => Self::Gp16,
            4 => Self::Gp32,
            5 => Self::Gp64,
            6 => Self::Vec128,
            7 => Self::Vec256,
            8 => Self::Vec512,
            9 => Self::KMask,
            10 => Self::Rip,
            _ => Self::None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RegGroup {
    #[default]
    Gp = 0,
    Vec = 1,
    KMask = 2,
}

impl RegGroup {
    const fn from_bits(bits: u32) -> Self {
        match bits {
            1 => Self::Vec,
            2 => Self::KMask,
            _ => Self::Gp,
        }
    }
}

// Signature bit layout, shared by every operand:
//
//   [ op-type:3 | reg-type:5 | reg-group:3 | size:8 | op-specific:13 ]
//
// Memory operands reuse the reg-type field for their base register type and
// pack index type, shift, segment and a base-is-label bit into the
// op-specific bits.
const SIG_OP_TYPE_SHIFT: u32 = 0;
const SIG_OP_TYPE_MASK: u32 = 0x7;
const SIG_REG_TYPE_SHIFT: u32 = 3;
const SIG_REG_TYPE_MASK: u32 = 0x1F;
const SIG_REG_GROUP_SHIFT: u32 = 8;
const SIG_REG_GROUP_MASK: u32 = 0x7;
const SIG_SIZE_SHIFT: u32 = 11;
const SIG_SIZE_MASK: u32 = 0xFF;
const SIG_MEM_INDEX_TYPE_SHIFT: u32 = 19;
const SIG_MEM_INDEX_TYPE_MASK: u32 = 0x1F;
const SIG_MEM_SHIFT_SHIFT: u32 = 24;
const SIG_MEM_SHIFT_MASK: u32 = 0x3;
const SIG_MEM_SEGMENT_SHIFT: u32 = 26;
const SIG_MEM_SEGMENT_MASK: u32 = 0x7;
const SIG_MEM_BASE_IS_LABEL: u32 = 1 << 29;

/// A single instruction operand with plain value semantics.
///
/// Always 128 bits: a packed signature word, an id word and two data words.
/// What the id and data words mean depends on the operand type.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Operand {
    signature: u32,
    id: u32,
    data: [u32; 2],
}

impl Operand {
    #[must_use]
    pub const fn none() -> Self {
        Self {
            signature: 0,
            id: 0,
            data: [0, 0],
        }
    }

    #[must_use]
    pub const fn op_type(&self) -> OpType {
        match (self.signature >> SIG_OP_TYPE_SHIFT) & SIG_OP_TYPE_MASK {
            1 => OpType::Reg,
            2 => OpType::Mem,
            3 => OpType::Imm,
            4 => OpType::Label,
            _ => OpType::None,
        }
    }

    #[must_use]
    pub const fn is_none(&self) -> bool {
        matches!(self.op_type(), OpType::None)
    }

    #[must_use]
    pub const fn is_reg(&self) -> bool {
        matches!(self.op_type(), OpType::Reg)
    }

    #[must_use]
    pub const fn is_mem(&self) -> bool {
        matches!(self.op_type(), OpType::Mem)
    }

    #[must_use]
    pub const fn is_imm(&self) -> bool {
        matches!(self.op_type(), OpType::Imm)
    }

    #[must_use]
    pub const fn is_label(&self) -> bool {
        matches!(self.op_type(), OpType::Label)
    }

    #[must_use]
    pub const fn signature(&self) -> u32 {
        self.signature
    }

    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Size in bytes encoded in the signature; 0 when not applicable.
    #[must_use]
    pub const fn size(&self) -> u8 {
        ((self.signature >> SIG_SIZE_SHIFT) & SIG_SIZE_MASK) as u8
    }

    #[must_use]
    pub const fn as_reg(&self) -> Option<Reg> {
        if self.is_reg() {
            Some(Reg(*self))
        } else {
            None
        }
    }

    #[must_use]
    pub const fn as_mem(&self) -> Option<Mem> {
        if self.is_mem() {
            Some(Mem(*self))
        } else {
            None
        }
    }

    #[must_use]
    pub const fn as_imm(&self) -> Option<Imm> {
        if self.is_imm() {
            Some(Imm(*self))
        } else {
            None
        }
    }

    #[must_use]
    pub const fn as_label(&self) -> Option<Label> {
        if self.is_label() {
            Some(Label::from_id(self.id))
        } else {
            None
        }
    }

    #[must_use]
    pub const fn from_label(label: Label) -> Self {
        Self {
            signature: (OpType::Label as u32) << SIG_OP_TYPE_SHIFT,
            id: label.id(),
            data: [0, 0],
        }
    }
}

impl From<Label> for Operand {
    fn from(value: Label) -> Self {
        Self::from_label(value)
    }
}

/// A physical or virtual register operand.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Reg(Operand);

impl Reg {
    #[must_use]
    pub const fn new(reg_type: RegType, id: u32) -> Self {
        let signature = (OpType::Reg as u32)
            | ((reg_type as u32 & SIG_REG_TYPE_MASK) << SIG_REG_TYPE_SHIFT)
            | ((reg_type.group() as u32 & SIG_REG_GROUP_MASK) << SIG_REG_GROUP_SHIFT)
            | ((reg_type.size() as u32 & SIG_SIZE_MASK) << SIG_SIZE_SHIFT);

        Self(Operand {
            signature,
            id,
            data: [0, 0],
        })
    }

    #[must_use]
    pub const fn reg_type(&self) -> RegType {
        RegType::from_bits((self.0.signature >> SIG_REG_TYPE_SHIFT) & SIG_REG_TYPE_MASK)
    }

    #[must_use]
    pub const fn group(&self) -> RegGroup {
        RegGroup::from_bits((self.0.signature >> SIG_REG_GROUP_SHIFT) & SIG_REG_GROUP_MASK)
    }

    #[must_use]
    pub const fn id(&self) -> u32 {
        self.0.id
    }

    #[must_use]
    pub const fn size(&self) -> u8 {
        self.0.size()
    }

    #[must_use]
    pub const fn is_virtual(&self) -> bool {
        is_virt_id(self.0.id)
    }

    #[must_use]
    pub const fn is_physical(&self) -> bool {
        !self.is_virtual()
    }

    /// Vector lane selected on this register, when any.
    #[must_use]
    pub const fn element_index(&self) -> Option<u32> {
        if self.0.data[0] == 0 {
            None
        } else {
            Some(self.0.data[0] - 1)
        }
    }

    #[must_use]
    pub const fn with_element_index(mut self, index: u32) -> Self {
        self.0.data[0] = index + 1;
        self
    }

    #[must_use]
    pub const fn as_operand(&self) -> Operand {
        self.0
    }
}

impl From<Reg> for Operand {
    fn from(value: Reg) -> Self {
        value.0
    }
}

/// Scale applied to the index register of a memory operand.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MemShift {
    #[default]
    Times1 = 0,
    Times2 = 1,
    Times4 = 2,
    Times8 = 3,
}

/// A memory operand: `[base + index << shift + displacement]`.
///
/// The base is either a register or a bound-or-unbound label; the index is
/// always a register.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Mem(Operand);

impl Mem {
    #[must_use]
    pub const fn with_base_reg(base: Reg, displacement: i32) -> Self {
        let signature = (OpType::Mem as u32)
            | ((base.reg_type() as u32 & SIG_REG_TYPE_MASK) << SIG_REG_TYPE_SHIFT);

        Self(Operand {
            signature,
            id: base.id(),
            data: [0, displacement as u32],
        })
    }

    #[must_use]
    pub const fn with_base_label(base: Label, displacement: i32) -> Self {
        let signature = (OpType::Mem as u32) | SIG_MEM_BASE_IS_LABEL;

        Self(Operand {
            signature,
            id: base.id(),
            data: [0, displacement as u32],
        })
    }

    #[must_use]
    pub const fn with_index(mut self, index: Reg, shift: MemShift) -> Self {
        self.0.signature |= (index.reg_type() as u32 & SIG_MEM_INDEX_TYPE_MASK) << SIG_MEM_INDEX_TYPE_SHIFT;
        self.0.signature |= (shift as u32 & SIG_MEM_SHIFT_MASK) << SIG_MEM_SHIFT_SHIFT;
        self.0.data[0] = index.id();
        self
    }

    /// Operation width in bytes; 0 leaves it to the instruction.
    #[must_use]
    pub const fn with_size(mut self, size: u8) -> Self {
        self.0.signature &= !(SIG_SIZE_MASK << SIG_SIZE_SHIFT);
        self.0.signature |= (size as u32) << SIG_SIZE_SHIFT;
        self
    }

    #[must_use]
    pub const fn with_segment(mut self, segment: u8) -> Self {
        self.0.signature &= !(SIG_MEM_SEGMENT_MASK << SIG_MEM_SEGMENT_SHIFT);
        self.0.signature |= (segment as u32 & SIG_MEM_SEGMENT_MASK) << SIG_MEM_SEGMENT_SHIFT;
        self
    }

    #[must_use]
    pub const fn has_label_base(&self) -> bool {
        self.0.signature & SIG_MEM_BASE_IS_LABEL != 0
    }

    #[must_use]
    pub const fn base_label(&self) -> Option<Label> {
        if self.has_label_base() {
            Some(Label::from_id(self.0.id))
        } else {
            None
        }
    }

    #[must_use]
    pub const fn base_reg_type(&self) -> RegType {
        RegType::from_bits((self.0.signature >> SIG_REG_TYPE_SHIFT) & SIG_REG_TYPE_MASK)
    }

    #[must_use]
    pub const fn base_id(&self) -> u32 {
        self.0.id
    }

    #[must_use]
    pub const fn index_reg_type(&self) -> RegType {
        RegType::from_bits((self.0.signature >> SIG_MEM_INDEX_TYPE_SHIFT) & SIG_MEM_INDEX_TYPE_MASK)
    }

    #[must_use]
    pub const fn has_index(&self) -> bool {
        !matches!(self.index_reg_type(), RegType::None)
    }

    #[must_use]
    pub const fn index_id(&self) -> u32 {
        self.0.data[0]
    }

    #[must_use]
    pub const fn shift(&self) -> u32 {
        (self.0.signature >> SIG_MEM_SHIFT_SHIFT) & SIG_MEM_SHIFT_MASK
    }

    #[must_use]
    pub const fn segment(&self) -> u8 {
        ((self.0.signature >> SIG_MEM_SEGMENT_SHIFT) & SIG_MEM_SEGMENT_MASK) as u8
    }

    #[must_use]
    pub const fn displacement(&self) -> i32 {
        self.0.data[1] as i32
    }

    #[must_use]
    pub const fn size(&self) -> u8 {
        self.0.size()
    }

    #[must_use]
    pub const fn as_operand(&self) -> Operand {
        self.0
    }
}

impl From<Mem> for Operand {
    fn from(value: Mem) -> Self {
        value.0
    }
}

/// An immediate operand carrying a 64-bit payload.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Imm(Operand);

impl Imm {
    #[must_use]
    pub const fn new(value: i64) -> Self {
        let bits = value as u64;

        Self(Operand {
            signature: OpType::Imm as u32,
            id: 0,
            data: [bits as u32, (bits >> 32) as u32],
        })
    }

    #[must_use]
    pub const fn value(&self) -> i64 {
        (self.0.data[0] as u64 | (self.0.data[1] as u64) << 32) as i64
    }

    #[must_use]
    pub const fn fits_i8(&self) -> bool {
        let v = self.value();
        v >= i8::MIN as i64 && v <= i8::MAX as i64
    }

    #[must_use]
    pub const fn fits_i32(&self) -> bool {
        let v = self.value();
        v >= i32::MIN as i64 && v <= i32::MAX as i64
    }

    #[must_use]
    pub const fn as_operand(&self) -> Operand {
        self.0
    }
}

impl From<i64> for Imm {
    fn from(value: i64) -> Self {
        Self::new(value)
    }
}

impl From<Imm> for Operand {
    fn from(value: Imm) -> Self {
        value.0
    }
}

/// Value types usable for embedded data arrays, virtual registers and
/// function signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeId {
    Void,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    IntPtr,
    UIntPtr,
    F32,
    F64,
    V128,
    V256,
    V512,
}

impl TypeId {
    /// Size in bytes; pointer-sized types need the architecture's word width.
    #[must_use]
    pub const fn size(&self, gp_size: u8) -> u32 {
        match self {
            Self::Void => 0,
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
            Self::IntPtr | Self::UIntPtr => gp_size as u32,
            Self::V128 => 16,
            Self::V256 => 32,
            Self::V512 => 64,
        }
    }

    /// The register type a value of this type naturally lives in.
    #[must_use]
    pub const fn reg_type(&self, gp_size: u8) -> RegType {
        match self {
            Self::Void => RegType::None,
            Self::I8 | Self::U8 => RegType::Gp8Lo,
            Self::I16 | Self::U16 => RegType::Gp16,
            Self::I32 | Self::U32 => RegType::Gp32,
            Self::I64 | Self::U64 => RegType::Gp64,
            Self::IntPtr | Self::UIntPtr => {
                if gp_size == 8 {
                    RegType::Gp64
                } else {
                    RegType::Gp32
                }
            }
            Self::F32 | Self::F64 | Self::V128 => RegType::Vec128,
            Self::V256 => RegType::Vec256,
            Self::V512 => RegType::Vec512,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn operand_is_128_bits() {
        assert_eq!(std::mem::size_of::<Operand>(), 16);
    }

    #[test]
    fn register_signature_roundtrip() {
        let reg = Reg::new(RegType::Gp64, 5);
        assert_eq!(reg.reg_type(), RegType::Gp64);
        assert_eq!(reg.group(), RegGroup::Gp);
        assert_eq!(reg.size(), 8);
        assert_eq!(reg.id(), 5);
        assert!(reg.is_physical());
    }

    #[test]
    fn virtual_bit_partitions_id_space() {
        let phys = Reg::new(RegType::Gp32, 3);
        let virt = Reg::new(RegType::Gp32, virt_id_of(3));

        assert!(!phys.is_virtual());
        assert!(virt.is_virtual());
        assert_eq!(virt_index_of(virt.id()), 3);
    }

    #[test]
    fn memory_operand_packs_and_unpacks() {
        let base = Reg::new(RegType::Gp64, 2);
        let index = Reg::new(RegType::Gp64, 9);
        let mem = Mem::with_base_reg(base, -24)
            .with_index(index, MemShift::Times8)
            .with_size(4);

        assert!(mem.as_operand().is_mem());
        assert_eq!(mem.base_id(), 2);
        assert_eq!(mem.index_id(), 9);
        assert_eq!(mem.shift(), 3);
        assert_eq!(mem.displacement(), -24);
        assert_eq!(mem.size(), 4);
        assert!(!mem.has_label_base());
    }

    #[test]
    fn label_based_memory_operand() {
        let label = Label::from_id(7);
        let mem = Mem::with_base_label(label, 16);

        assert!(mem.has_label_base());
        assert_eq!(mem.base_label(), Some(label));
        assert_eq!(mem.displacement(), 16);
    }

    #[rstest]
    #[case(Imm::new(0), true, true)]
    #[case(Imm::new(127), true, true)]
    #[case(Imm::new(128), false, true)]
    #[case(Imm::new(-129), false, true)]
    #[case(Imm::new(i64::MAX), false, false)]
    fn immediate_width_classification(#[case] imm: Imm, #[case] i8_ok: bool, #[case] i32_ok: bool) {
        assert_eq!(imm.fits_i8(), i8_ok);
        assert_eq!(imm.fits_i32(), i32_ok);
    }
}
