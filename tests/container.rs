// Copyright (C) 2025 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

use std::cell::RefCell;
use std::rc::Rc;

use pretty_assertions::assert_eq;

use smederij::x86::inst;
use smederij::{
    Arch,
    ArchInfo,
    Assembler,
    CodeContainer,
    CodeError,
    CopySectionFlags,
    Emitter,
    EmitterKind,
    ErrorHandler,
    InstId,
    LabelType,
    SectionFlags,
    SectionId,
    SubArch,
};

fn new_container() -> CodeContainer {
    CodeContainer::new(ArchInfo::new(Arch::X64, SubArch::None).unwrap())
}

#[test]
fn label_ids_are_dense() {
    let mut code = new_container();

    for _ in 0..100 {
        code.new_label().unwrap();
    }

    for id in 0..code.label_count() {
        let entry = code.label_entry(smederij::Label::from_id(id)).unwrap();
        assert_eq!(entry.id().id(), id);
    }
}

#[test]
fn binding_twice_reports_label_already_bound() {
    let mut code = new_container();
    let label = code.new_label().unwrap();

    code.bind_label(label, SectionId::TEXT, 0).unwrap();
    assert_eq!(
        code.bind_label(label, SectionId::TEXT, 0),
        Err(CodeError::LabelAlreadyBound),
    );
}

#[test]
fn flatten_orders_sections_without_overlap() {
    let mut code = new_container();
    let data = code.new_section(".data", SectionFlags::NONE, 32).unwrap();
    let rodata = code.new_section(".rodata", SectionFlags::READ_ONLY, 8).unwrap();

    let mut asm = Assembler::attach(&mut code).unwrap();
    asm.embed(&[0x90; 10]).unwrap();
    asm.switch_section(data).unwrap();
    asm.embed(&[1; 5]).unwrap();
    asm.switch_section(rodata).unwrap();
    asm.embed(&[2; 3]).unwrap();
    drop(asm);

    code.flatten().unwrap();

    let sections = code.sections();
    for pair in sections.windows(2) {
        assert!(pair[0].offset() + pair[0].virtual_size() <= pair[1].offset());
        assert_eq!(pair[1].offset() % pair[1].alignment() as u64, 0);
    }
}

#[test]
fn reset_recreates_an_empty_text_section() {
    let mut code = new_container();
    code.new_section(".data", SectionFlags::NONE, 8).unwrap();
    code.new_label().unwrap();
    code.new_named_label("entry", LabelType::Global, None).unwrap();

    let mut asm = Assembler::attach(&mut code).unwrap();
    asm.emit0(inst::RET).unwrap();
    let entry = asm.new_label().unwrap();
    asm.embed_label(entry).unwrap();
    drop(asm);

    code.reset(true);

    assert_eq!(code.label_count(), 0);
    assert_eq!(code.section_count(), 1);
    assert_eq!(code.relocations().len(), 0);
    assert_eq!(code.text_section().name(), ".text");
    assert!(code.text_section().flags().contains(SectionFlags::EXECUTABLE));
    assert!(code.text_section().buffer().is_empty());
    assert_eq!(code.base_address(), None);

    // The container is fully usable again.
    let label = code.new_label().unwrap();
    assert_eq!(label.id(), 0);
}

#[test]
fn named_labels_are_looked_up_by_parent_and_name() {
    let mut code = new_container();

    let global = code.new_named_label("memcpy", LabelType::Global, None).unwrap();
    let local = code.new_named_label("tail", LabelType::Local, Some(global)).unwrap();

    assert_eq!(code.label_by_name("memcpy", None), Some(global));
    assert_eq!(code.label_by_name("tail", Some(global)), Some(local));
    assert_eq!(code.label_by_name("tail", None), None);
    assert_eq!(code.label_by_name("missing", None), None);

    assert_eq!(
        code.new_named_label("", LabelType::Global, None),
        Err(CodeError::InvalidLabelName),
    );
}

#[test]
fn copy_section_data_pads_to_the_virtual_size() {
    let mut code = new_container();

    let mut asm = Assembler::attach(&mut code).unwrap();
    asm.embed(&[0xAB; 5]).unwrap();
    drop(asm);

    code.section_mut(SectionId::TEXT).unwrap().set_virtual_size(8);

    let mut out = [0xFFu8; 8];
    let written = code
        .copy_section_data(&mut out, SectionId::TEXT, CopySectionFlags::PAD_SECTION)
        .unwrap();

    assert_eq!(written, 8);
    assert_eq!(out, [0xAB, 0xAB, 0xAB, 0xAB, 0xAB, 0, 0, 0]);
}

#[test]
fn copy_flattened_data_places_sections_at_their_offsets() {
    let mut code = new_container();
    let data = code.new_section(".data", SectionFlags::NONE, 16).unwrap();

    let mut asm = Assembler::attach(&mut code).unwrap();
    asm.emit0(inst::RET).unwrap();
    asm.switch_section(data).unwrap();
    asm.embed(&[0x11, 0x22]).unwrap();
    drop(asm);

    code.flatten().unwrap();
    let size = code.code_size() as usize;

    let mut image = vec![0xFFu8; size];
    code.copy_flattened_data(&mut image).unwrap();

    assert_eq!(image[0], 0xC3);
    let data_offset = code.section(data).unwrap().offset() as usize;
    assert_eq!(&image[data_offset..data_offset + 2], &[0x11, 0x22]);
    // The gap between the sections is zero-filled.
    assert!(image[1..data_offset].iter().all(|&byte| byte == 0));
}

#[test]
fn empty_container_reports_no_code_generated() {
    let code = new_container();
    let mut out = [0u8; 16];
    assert_eq!(code.copy_flattened_data(&mut out), Err(CodeError::NoCodeGenerated));
}

#[derive(Default)]
struct CapturingHandler {
    seen: Rc<RefCell<Vec<(CodeError, EmitterKind)>>>,
}

impl ErrorHandler for CapturingHandler {
    fn handle(&mut self, error: CodeError, _message: &str, origin: EmitterKind) {
        self.seen.borrow_mut().push((error, origin));
    }
}

#[test]
fn emitter_errors_route_through_the_installed_handler() {
    let seen = Rc::new(RefCell::new(Vec::new()));

    let mut code = new_container();
    code.set_error_handler(Box::new(CapturingHandler {
        seen: Rc::clone(&seen),
    }));

    let mut asm = Assembler::attach(&mut code).unwrap();
    let result = asm.emit0(InstId(0xFFFF));
    drop(asm);

    assert_eq!(result, Err(CodeError::InvalidInstruction));
    assert_eq!(seen.borrow().as_slice(), &[(CodeError::InvalidInstruction, EmitterKind::Assembler)]);
}

#[test]
fn emitter_handler_takes_precedence_over_the_container_handler() {
    let container_seen = Rc::new(RefCell::new(Vec::new()));
    let emitter_seen = Rc::new(RefCell::new(Vec::new()));

    let mut code = new_container();
    code.set_error_handler(Box::new(CapturingHandler {
        seen: Rc::clone(&container_seen),
    }));

    let mut asm = Assembler::attach(&mut code).unwrap();
    asm.state_mut().set_error_handler(Box::new(CapturingHandler {
        seen: Rc::clone(&emitter_seen),
    }));

    let _ = asm.emit0(InstId(0xFFFF));
    drop(asm);

    assert_eq!(emitter_seen.borrow().len(), 1);
    assert!(container_seen.borrow().is_empty());
}
