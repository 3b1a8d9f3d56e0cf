// Copyright (C) 2025 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

use pretty_assertions::assert_eq;

use smederij::x86::inst;
use smederij::{
    is_virt_id,
    Arch,
    ArchInfo,
    CallConvId,
    CodeContainer,
    CodeError,
    Compiler,
    ConstScope,
    Emitter,
    FuncSignature,
    RegType,
    SubArch,
    TypeId,
};

fn new_container() -> CodeContainer {
    CodeContainer::new(ArchInfo::new(Arch::X64, SubArch::None).unwrap())
}

#[test]
fn virtual_register_roundtrip() {
    let mut code = new_container();
    let mut compiler = Compiler::attach(&mut code).unwrap();

    let counter = compiler
        .new_virt_reg(TypeId::U32, RegType::Gp32, Some("counter"))
        .unwrap();

    assert!(is_virt_id(counter.id()));
    assert!(compiler.is_virt_id_valid(counter.id()));

    let entry = compiler.virt_reg_by_id(counter.id()).unwrap();
    assert_eq!(entry.name(), Some("counter"));
    assert_eq!(entry.type_id(), TypeId::U32);
    assert_eq!(entry.reg_type(), RegType::Gp32);
    assert_eq!(entry.virt_size(), 4);

    // Physical ids never pass the virtual-id check.
    assert!(!compiler.is_virt_id_valid(3));
}

#[test]
fn stack_registers_are_marked_stack_only() {
    let mut code = new_container();
    let mut compiler = Compiler::attach(&mut code).unwrap();

    let slot = compiler.new_stack(64, 16, Some("spill-area")).unwrap();
    let entry = compiler.virt_reg_by_reg(&slot).unwrap();

    assert!(entry.is_stack_only());
    assert_eq!(entry.virt_size(), 64);
    assert_eq!(entry.alignment(), 16);

    assert_eq!(compiler.new_stack(0, 8, None), Err(CodeError::InvalidArgument));
}

#[test]
fn local_constants_are_deduplicated_within_a_function() {
    let mut code = new_container();
    let mut compiler = Compiler::attach(&mut code).unwrap();

    compiler.add_func(FuncSignature::new(CallConvId::SystemV64)).unwrap();

    let first = compiler.new_const(ConstScope::Local, &[1, 2, 3, 4]).unwrap();
    let second = compiler.new_const(ConstScope::Local, &[1, 2, 3, 4]).unwrap();
    let different = compiler.new_const(ConstScope::Local, &[5, 6, 7, 8]).unwrap();

    assert_eq!(first.displacement(), second.displacement());
    assert_eq!(first.base_label(), second.base_label());
    assert_ne!(first.displacement(), different.displacement());

    compiler.end_func().unwrap();
}

#[test]
fn local_constants_require_an_open_function() {
    let mut code = new_container();
    let mut compiler = Compiler::attach(&mut code).unwrap();

    assert_eq!(
        compiler.new_const(ConstScope::Local, &[1, 2, 3, 4]),
        Err(CodeError::InvalidState),
    );
}

#[test]
fn local_pool_is_flushed_at_end_func() {
    let mut code = new_container();
    {
        let mut compiler = Compiler::attach(&mut code).unwrap();

        compiler.add_func(FuncSignature::new(CallConvId::SystemV64)).unwrap();
        let constant = compiler.new_const(ConstScope::Local, &[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
        compiler.end_func().unwrap();
        compiler.finalize().unwrap();

        let label = constant.base_label().unwrap();
        assert!(compiler.container().is_label_bound(label));
    }

    let bytes = code.text_section().buffer().as_slice();
    assert!(bytes.windows(4).any(|window| window == [0xDE, 0xAD, 0xBE, 0xEF]));
}

#[test]
fn global_pool_is_flushed_at_finalize() {
    let mut code = new_container();
    {
        let mut compiler = Compiler::attach(&mut code).unwrap();

        let constant = compiler.new_const(ConstScope::Global, &[0x11, 0x22]).unwrap();
        compiler.emit0(inst::RET).unwrap();
        compiler.finalize().unwrap();

        let label = constant.base_label().unwrap();
        assert!(compiler.container().is_label_bound(label));
    }

    let bytes = code.text_section().buffer().as_slice();
    assert_eq!(bytes[0], 0xC3);
    assert!(bytes.windows(2).any(|window| window == [0x11, 0x22]));
}

#[test]
fn function_scope_state_machine() {
    let mut code = new_container();
    let mut compiler = Compiler::attach(&mut code).unwrap();

    // idle: ret and end_func are illegal.
    assert_eq!(compiler.add_ret(None, None), Err(CodeError::InvalidState));
    assert_eq!(compiler.end_func(), Err(CodeError::InvalidState));

    // open: a second add_func is illegal, finalize is illegal.
    compiler.add_func(FuncSignature::new(CallConvId::SystemV64)).unwrap();
    assert_eq!(
        compiler.add_func(FuncSignature::new(CallConvId::SystemV64)),
        Err(CodeError::FuncInFunc),
    );
    assert_eq!(compiler.finalize(), Err(CodeError::InvalidState));
    compiler.add_ret(None, None).unwrap();

    // back to idle.
    compiler.end_func().unwrap();
    assert_eq!(compiler.current_func(), None);
}

#[test]
fn unlowered_ret_nodes_fail_serialization() {
    let mut code = new_container();
    let mut compiler = Compiler::attach(&mut code).unwrap();

    compiler.add_func(FuncSignature::new(CallConvId::SystemV64)).unwrap();
    compiler.add_ret(None, None).unwrap();
    compiler.end_func().unwrap();

    // No register-allocation pass ran, so the ret node cannot lower.
    assert_eq!(compiler.finalize(), Err(CodeError::InvalidState));
}

#[test]
fn invoke_nodes_carry_lowered_argument_slots() {
    let mut code = new_container();
    let mut compiler = Compiler::attach(&mut code).unwrap();

    let callee = compiler.new_label().unwrap();
    let signature = FuncSignature::new(CallConvId::SystemV64)
        .with_ret(TypeId::U64)
        .with_arg(TypeId::U64)
        .with_arg(TypeId::U64);

    let invoke = compiler
        .add_invoke(inst::CALL, callee.into(), signature)
        .unwrap();

    let value = compiler.new_virt_reg(TypeId::U64, RegType::Gp64, None).unwrap();
    compiler.invoke_set_arg(invoke, 0, value.as_operand()).unwrap();
    compiler.invoke_set_ret(invoke, 0, value.as_operand()).unwrap();

    assert_eq!(
        compiler.invoke_set_arg(invoke, 9, value.as_operand()),
        Err(CodeError::InvalidArgument),
    );
}

#[test]
fn annotated_jumps_serialize_as_plain_jumps() {
    let mut code = new_container();
    {
        let mut compiler = Compiler::attach(&mut code).unwrap();

        let target = compiler.new_label().unwrap();
        compiler.emit_annotated_jump(inst::JMP, target.into(), None).unwrap();
        compiler.bind(target).unwrap();
        compiler.finalize().unwrap();
    }

    let bytes = code.text_section().buffer().as_slice();
    assert_eq!(bytes[0], 0xE9);
    assert_eq!(&bytes[1..5], &[0, 0, 0, 0]);
}
