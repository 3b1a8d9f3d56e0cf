// Copyright (C) 2025 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

use pretty_assertions::assert_eq;

use smederij::x86::inst;
use smederij::{
    AlignMode,
    Arch,
    ArchInfo,
    Assembler,
    CodeContainer,
    CodeError,
    Emitter,
    SectionFlags,
    SubArch,
};

fn new_container() -> CodeContainer {
    CodeContainer::new(ArchInfo::new(Arch::X64, SubArch::None).unwrap())
}

#[test]
fn forward_jump_displacement_is_patched_at_bind() {
    let mut code = new_container();
    let mut asm = Assembler::attach(&mut code).unwrap();

    let label = asm.new_label().unwrap();
    asm.emit1(inst::JMP, label).unwrap();
    assert_eq!(asm.offset(), 5);

    asm.bind(label).unwrap();
    drop(asm);

    let bytes = code.text_section().buffer().as_slice();
    assert_eq!(bytes[0], 0xE9);
    // The label binds right after the instruction: displacement 0.
    assert_eq!(&bytes[1..5], &[0x00, 0x00, 0x00, 0x00]);
}

#[test]
fn backward_jump_displacement_is_written_at_emit() {
    let mut code = new_container();
    let mut asm = Assembler::attach(&mut code).unwrap();

    let label = asm.new_label().unwrap();
    asm.bind(label).unwrap();

    for _ in 0..16 {
        asm.emit0(inst::NOP).unwrap();
    }

    asm.emit1(inst::JMP, label).unwrap();
    drop(asm);

    let bytes = code.text_section().buffer().as_slice();
    assert_eq!(bytes[16], 0xE9);
    // -(16 + 5) = -21 = 0xFFFFFFEB little-endian.
    assert_eq!(&bytes[17..21], &[0xEB, 0xFF, 0xFF, 0xFF]);
}

#[test]
fn embedded_label_receives_its_absolute_address() {
    let mut code = new_container();
    let data_section = code.new_section(".data", SectionFlags::NONE, 8).unwrap();

    let mut asm = Assembler::attach(&mut code).unwrap();
    let entry = asm.new_label().unwrap();
    asm.emit0(inst::NOP).unwrap();
    asm.bind(entry).unwrap();
    asm.emit0(inst::RET).unwrap();

    asm.switch_section(data_section).unwrap();
    asm.embed_label(entry).unwrap();
    drop(asm);

    code.flatten().unwrap();
    code.relocate_to_base(0x10_0000).unwrap();

    let text_offset = code.text_section().offset();
    let expected = 0x10_0000u64 + text_offset + 1;

    let section = code.section(data_section).unwrap();
    assert_eq!(section.buffer().as_slice(), &expected.to_le_bytes());
}

#[test]
fn bound_label_delta_is_written_without_a_relocation() {
    let mut code = new_container();
    let mut asm = Assembler::attach(&mut code).unwrap();

    let start = asm.new_label().unwrap();
    let end = asm.new_label().unwrap();

    asm.embed(&[0u8; 0x10]).unwrap();
    asm.bind(start).unwrap();
    asm.embed(&[0u8; 0x30]).unwrap();
    asm.bind(end).unwrap();

    asm.embed_label_delta(end, start, 4).unwrap();
    drop(asm);

    assert!(code.relocations().is_empty());

    let bytes = code.text_section().buffer().as_slice();
    assert_eq!(&bytes[0x40..0x44], &[0x30, 0x00, 0x00, 0x00]);
}

#[test]
fn unbound_label_delta_resolves_through_an_expression() {
    let mut code = new_container();
    let mut asm = Assembler::attach(&mut code).unwrap();

    let start = asm.new_label().unwrap();
    let end = asm.new_label().unwrap();

    asm.bind(start).unwrap();
    asm.embed_label_delta(end, start, 4).unwrap();
    asm.embed(&[0u8; 4]).unwrap();
    asm.bind(end).unwrap();
    drop(asm);

    assert_eq!(code.relocations().len(), 1);

    code.flatten().unwrap();
    code.relocate_to_base(0).unwrap();

    // end - start = 8 bytes between the two bind positions.
    let bytes = code.text_section().buffer().as_slice();
    assert_eq!(&bytes[0..4], &[0x08, 0x00, 0x00, 0x00]);
}

#[test]
fn unresolved_label_fails_at_relocation_and_keeps_the_image() {
    let mut code = new_container();
    let mut asm = Assembler::attach(&mut code).unwrap();

    let label = asm.new_label().unwrap();
    asm.emit1(inst::JMP, label).unwrap();
    drop(asm);

    let before = code.text_section().buffer().as_slice().to_vec();

    code.flatten().unwrap();
    assert_eq!(code.relocate_to_base(0), Err(CodeError::UnresolvedLabel));
    assert_eq!(code.text_section().buffer().as_slice(), &before[..]);
}

#[test]
fn sections_are_isolated() {
    let mut code = new_container();
    let data_section = code.new_section(".data", SectionFlags::NONE, 8).unwrap();

    let mut asm = Assembler::attach(&mut code).unwrap();
    asm.emit0(inst::RET).unwrap();

    let text_before = asm.container().text_section().buffer().as_slice().to_vec();

    asm.switch_section(data_section).unwrap();
    asm.embed(&[0xAA; 32]).unwrap();
    drop(asm);

    assert_eq!(code.text_section().buffer().as_slice(), &text_before[..]);
}

#[test]
fn relocation_base_is_not_sticky() {
    fn build() -> (CodeContainer, smederij::SectionId) {
        let mut code = new_container();
        let data_section = code.new_section(".data", SectionFlags::NONE, 8).unwrap();

        let mut asm = Assembler::attach(&mut code).unwrap();
        let entry = asm.new_label().unwrap();
        asm.bind(entry).unwrap();
        asm.emit0(inst::RET).unwrap();

        asm.switch_section(data_section).unwrap();
        asm.embed_label(entry).unwrap();
        drop(asm);

        code.flatten().unwrap();
        (code, data_section)
    }

    let (mut first, first_data) = build();
    first.relocate_to_base(0x1000).unwrap();
    first.relocate_to_base(0x8000).unwrap();

    let (mut second, second_data) = build();
    second.relocate_to_base(0x8000).unwrap();

    assert_eq!(
        first.section(first_data).unwrap().buffer().as_slice(),
        second.section(second_data).unwrap().buffer().as_slice(),
    );
}

#[test]
fn conditional_jumps_link_like_unconditional_ones() {
    let mut code = new_container();
    let mut asm = Assembler::attach(&mut code).unwrap();

    let target = asm.new_label().unwrap();
    asm.emit1(inst::JNE, target).unwrap();
    assert_eq!(asm.offset(), 6);

    asm.emit0(inst::NOP).unwrap();
    asm.bind(target).unwrap();
    drop(asm);

    let bytes = code.text_section().buffer().as_slice();
    assert_eq!(&bytes[0..2], &[0x0F, 0x85]);
    // Target is one nop past the jcc: displacement 1.
    assert_eq!(&bytes[2..6], &[0x01, 0x00, 0x00, 0x00]);
}

#[test]
fn data_alignment_pads_with_zeros_and_code_with_nops() {
    let mut code = new_container();
    let mut asm = Assembler::attach(&mut code).unwrap();

    asm.emit0(inst::RET).unwrap();
    asm.align(AlignMode::Zero, 8).unwrap();
    assert_eq!(asm.offset(), 8);

    asm.emit0(inst::RET).unwrap();
    asm.align(AlignMode::Code, 16).unwrap();
    assert_eq!(asm.offset(), 16);
    drop(asm);

    let bytes = code.text_section().buffer().as_slice();
    assert_eq!(&bytes[1..8], &[0u8; 7]);
    assert!(bytes[9..16].iter().any(|&byte| byte != 0));
}

#[test]
fn out_of_range_backward_displacement_is_rejected() {
    let mut code = new_container();
    let mut asm = Assembler::attach(&mut code).unwrap();

    // A one-byte field cannot hold a 300-byte distance.
    let start = asm.new_label().unwrap();
    asm.bind(start).unwrap();
    asm.embed(&[0u8; 300]).unwrap();

    let end = asm.new_label().unwrap();
    asm.embed_label_delta(end, start, 1).unwrap();
    asm.embed(&[0u8; 1]).unwrap();
    asm.bind(end).unwrap();
    drop(asm);

    code.flatten().unwrap();
    assert_eq!(code.relocate_to_base(0), Err(CodeError::RelocationOffsetOutOfRange));
}
