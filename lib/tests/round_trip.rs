use jvmasm::jvm::class_file::{Attribute, ClassFile, Constant, Method, RawAttribute, Version};
use jvmasm::jvm::code::{
    BranchInstruction, Catch, CodeAttribute, Declaration, Instruction, Op, OrdComparison,
};
use jvmasm::jvm::{ClassAccessFlags, Error, MethodAccessFlags, Settings};

fn new_class(name: &str) -> ClassFile {
    ClassFile::new(
        Version::JAVA8,
        ClassAccessFlags::PUBLIC | ClassAccessFlags::SUPER,
        name,
        Some("java/lang/Object"),
        Settings::default(),
    )
}

fn static_method(name: &str, descriptor: &str) -> Method {
    Method::new(
        MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
        name,
        descriptor,
    )
}

/// `static int get(int x) { return x < 0 ? 0 : 42; }`, optionally with unreachable instructions
fn answer(code: &mut CodeAttribute, dead_code: bool) -> Result<(), Error> {
    code.add(Op::Begin)?;
    let x = code.add(Op::Declare(Declaration::named("x", "I")?.at_slot(0)))?;
    let negative = code.create(Op::Label)?;
    code.add(Op::Insn(Instruction::ILoad(x)))?;
    code.add(Op::Branch(BranchInstruction::If(OrdComparison::LT, negative)))?;
    code.add(Op::Insn(Instruction::BiPush(42)))?;
    code.add(Op::Branch(BranchInstruction::IReturn))?;
    if dead_code {
        code.add(Op::Insn(Instruction::Nop))?;
        code.add(Op::Insn(Instruction::IConst5))?;
    }
    code.place(negative)?;
    code.add(Op::Insn(Instruction::IConst0))?;
    code.add(Op::Branch(BranchInstruction::IReturn))?;
    if dead_code {
        code.add(Op::Insn(Instruction::AConstNull))?;
    }
    code.add(Op::End)?;
    Ok(())
}

fn answer_class_with(dead_code: bool) -> ClassFile {
    let mut class = new_class("Answer");
    let mut method = static_method("get", "(I)I");
    answer(method.new_code().unwrap(), dead_code).unwrap();
    class.contents_mut().unwrap().methods.push(method);
    class
}

fn answer_class() -> ClassFile {
    answer_class_with(false)
}

/// Read a class back and force every method through disassembly and reassembly
fn rewrite(bytes: Vec<u8>, settings: Settings) -> Vec<u8> {
    let mut class = ClassFile::from_bytes(bytes, settings).unwrap();
    for method in &mut class.contents_mut().unwrap().methods {
        if let Some(code) = method.code_mut() {
            code.ops_mut().unwrap();
        }
    }
    assert!(class.is_modified());
    class.to_bytes().unwrap()
}

#[test]
fn built_code_round_trips() {
    let bytes = answer_class().to_bytes().unwrap();

    let mut class = ClassFile::from_bytes(bytes.clone(), Settings::default()).unwrap();
    let code = class.code_mut("get", "(I)I").unwrap().unwrap();
    assert_eq!(code.max_stack(), 1);
    assert_eq!(code.max_locals(), 1);

    // iload_0 iflt +6 bipush 42 ireturn iconst_0 ireturn
    assert_eq!(
        code.bytecode().unwrap(),
        &[0x1a, 0x9b, 0x00, 0x06, 0x10, 0x2a, 0xac, 0x03, 0xac]
    );
    let variables = code.local_variables();
    assert_eq!(variables.len(), 1);
    assert_eq!((variables[0].start, variables[0].end), (0, 9));
    assert_eq!(variables[0].name, "x");

    assert_eq!(rewrite(bytes.clone(), Settings::default()), bytes);
}

#[test]
fn shared_try_keeps_catch_order() {
    let mut class = new_class("Guarded");
    let mut method = static_method("run", "()V");
    let code = method.new_code().unwrap();
    code.add(Op::Begin).unwrap();
    let try_op = code.add(Op::Try(vec![])).unwrap();
    code.add(Op::Insn(Instruction::IConst0)).unwrap();
    code.add(Op::Insn(Instruction::Pop)).unwrap();
    let runtime = code.create(Op::Label).unwrap();
    let any = code.create(Op::Label).unwrap();
    let after = code.create(Op::Label).unwrap();
    code.add(Op::Catch(Catch::new(
        try_op,
        Some(String::from("java/lang/RuntimeException")),
        runtime,
    )))
    .unwrap();
    code.add(Op::Catch(Catch::new(try_op, None, any))).unwrap();
    code.add(Op::Branch(BranchInstruction::Goto(after))).unwrap();
    code.place(runtime).unwrap();
    code.add(Op::Insn(Instruction::Pop)).unwrap();
    code.add(Op::Branch(BranchInstruction::Goto(after))).unwrap();
    code.place(any).unwrap();
    code.add(Op::Insn(Instruction::Pop)).unwrap();
    code.add(Op::Branch(BranchInstruction::Goto(after))).unwrap();
    code.place(after).unwrap();
    code.add(Op::Branch(BranchInstruction::Return)).unwrap();
    code.add(Op::End).unwrap();
    class.contents_mut().unwrap().methods.push(method);

    let bytes = class.to_bytes().unwrap();
    let code = class.code_mut("run", "()V").unwrap().unwrap();
    let table: Vec<_> = code
        .exception_table()
        .iter()
        .map(|h| (h.start_pc, h.end_pc, h.handler_pc, h.catch_type.clone()))
        .collect();
    assert_eq!(
        table,
        vec![
            (0, 2, 5, Some(String::from("java/lang/RuntimeException"))),
            (0, 2, 9, None),
        ]
    );
    assert_eq!(code.max_stack(), 1);

    assert_eq!(rewrite(bytes.clone(), Settings::default()), bytes);
}

#[test]
fn dead_code_leaves_no_trace() {
    let expected = answer_class().to_bytes().unwrap();
    assert_eq!(answer_class_with(true).to_bytes().unwrap(), expected);
}

#[test]
fn untouched_classes_are_not_reencoded() {
    let bytes = answer_class().to_bytes().unwrap();
    let mut class = ClassFile::from_bytes(bytes.clone(), Settings::default()).unwrap();
    assert!(!class.is_expanded());
    assert_eq!(class.to_bytes().unwrap(), bytes);
    assert!(!class.is_expanded());

    // Reading the structure and the code does not count as a modification
    assert_eq!(class.contents().unwrap().methods.len(), 1);
    let code = class.code_mut("get", "(I)I").unwrap().unwrap();
    assert!(code.listing().unwrap().contains("bipush 42"));
    assert!(!class.is_modified());
    assert_eq!(class.to_bytes().unwrap(), bytes);

    // Editing the code does
    let code = class.code_mut("get", "(I)I").unwrap().unwrap();
    code.ops_mut().unwrap();
    assert!(class.is_modified());
    assert_eq!(class.to_bytes().unwrap(), bytes);
    assert!(!class.is_modified());
}

#[test]
fn constants_are_sorted_by_kind() {
    let mut class = new_class("Constants");
    let mut method = static_method("load", "()V");
    let code = method.new_code().unwrap();
    code.add(Op::Insn(Instruction::Ldc(Constant::Integer(100_000))))
        .unwrap();
    code.add(Op::Insn(Instruction::Ldc(Constant::string("hello"))))
        .unwrap();
    code.add(Op::Insn(Instruction::PutStatic(Constant::field_ref(
        "Constants",
        "greeting",
        "Ljava/lang/String;",
    ))))
    .unwrap();
    code.add(Op::Insn(Instruction::Pop)).unwrap();
    code.add(Op::Branch(BranchInstruction::Return)).unwrap();
    class.contents_mut().unwrap().methods.push(method);

    let bytes = class.to_bytes().unwrap();
    let mut class = ClassFile::from_bytes(bytes, Settings::default()).unwrap();
    let pool = class.contents().unwrap().constant_pool();
    let kinds: Vec<&str> = pool
        .iter()
        .map(|(_, constant)| match constant {
            Constant::String(_) => "string",
            Constant::Integer(_) => "integer",
            Constant::Class(_) => "class",
            Constant::FieldRef(_) => "field",
            Constant::NameAndType(_) => "name_and_type",
            Constant::Utf8(_) => "utf8",
            _ => "other",
        })
        .collect();
    let mut deduped = kinds.clone();
    deduped.dedup();
    assert_eq!(
        deduped,
        vec!["string", "integer", "class", "field", "name_and_type", "utf8"]
    );

    // Loadable constants end up at small indices, so `ldc` suffices
    let code = class.code_mut("load", "()V").unwrap().unwrap();
    let bytecode = code.bytecode().unwrap();
    assert_eq!(bytecode[0], 0x12);
    assert_eq!(bytecode[2], 0x12);
}

#[test]
fn unknown_attributes_keep_the_pool_order() {
    let mut class = answer_class();
    class
        .contents_mut()
        .unwrap()
        .attributes
        .push(Attribute::Opaque(RawAttribute {
            name: String::from("Custom"),
            info: vec![0, 1],
        }));
    let bytes = class.to_bytes().unwrap();

    let mut class = ClassFile::from_bytes(bytes.clone(), Settings::default()).unwrap();
    assert!(class.contents().unwrap().constant_pool().is_order_significant());
    assert_eq!(rewrite(bytes.clone(), Settings::default()), bytes);

    // Same result when the pool is extended in place on purpose
    let settings = Settings {
        optimize_constant_pool: false,
        ..Settings::default()
    };
    assert_eq!(rewrite(bytes.clone(), settings), bytes);
}

#[test]
fn assignment_ranges_start_after_stores() {
    let mut class = new_class("Locals");
    let mut method = static_method("f", "()V");
    let code = method.new_code().unwrap();
    code.add(Op::Begin).unwrap();
    let y = code
        .add(Op::Declare(Declaration::named("y", "I").unwrap()))
        .unwrap();
    code.add(Op::Insn(Instruction::IConst1)).unwrap();
    code.add(Op::Insn(Instruction::IStore(y))).unwrap();
    code.add(Op::Insn(Instruction::ILoad(y))).unwrap();
    code.add(Op::Insn(Instruction::Pop)).unwrap();
    code.add(Op::Branch(BranchInstruction::Return)).unwrap();
    code.add(Op::End).unwrap();
    class.contents_mut().unwrap().methods.push(method);

    let bytes = class.to_bytes().unwrap();
    let mut class = ClassFile::from_bytes(bytes.clone(), Settings::default()).unwrap();
    let code = class.code_mut("f", "()V").unwrap().unwrap();
    let variables = code.local_variables();
    assert_eq!(variables.len(), 1);
    assert_eq!(
        (variables[0].start, variables[0].end, variables[0].slot),
        (2, 5, 0)
    );
    assert_eq!(rewrite(bytes.clone(), Settings::default()), bytes);
}

#[test]
fn unpaired_surrogates_in_strings_round_trip() {
    let units: Vec<u16> = vec![0xd800, b' ' as u16, b'x' as u16];
    let mut class = new_class("Surrogates");
    let mut method = static_method("f", "()V");
    let code = method.new_code().unwrap();
    code.add(Op::Insn(Instruction::Ldc(Constant::string_units(units.clone()))))
        .unwrap();
    code.add(Op::Insn(Instruction::Pop)).unwrap();
    code.add(Op::Branch(BranchInstruction::Return)).unwrap();
    class.contents_mut().unwrap().methods.push(method);

    let bytes = class.to_bytes().unwrap();
    assert!(bytes.windows(3).any(|w| w == [0xed, 0xa0, 0x80]));
    let mut class = ClassFile::from_bytes(bytes.clone(), Settings::default()).unwrap();
    let pool = class.contents().unwrap().constant_pool();
    assert!(pool.find(&Constant::StringUnits(units)).is_some());
    assert_eq!(rewrite(bytes.clone(), Settings::default()), bytes);
}

#[test]
fn malformed_classes() {
    let bytes = answer_class().to_bytes().unwrap();

    let mut truncated =
        ClassFile::from_bytes(bytes[..bytes.len() - 3].to_vec(), Settings::default()).unwrap();
    assert!(matches!(truncated.contents(), Err(Error::IoError(_))));

    let mut bad_opcode = bytes.clone();
    let code_start = bad_opcode
        .windows(9)
        .position(|w| w == [0x1a, 0x9b, 0x00, 0x06, 0x10, 0x2a, 0xac, 0x03, 0xac])
        .unwrap();
    bad_opcode[code_start + 4] = 0xcb;
    let mut class = ClassFile::from_bytes(bad_opcode, Settings::default()).unwrap();
    let code = class.code_mut("get", "(I)I").unwrap().unwrap();
    assert!(matches!(code.listing(), Err(Error::InvalidOpcode { .. })));
}
