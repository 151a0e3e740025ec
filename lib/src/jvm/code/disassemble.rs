//! Decoding of bytecode into a node sequence
//!
//! Decoding happens in two steps. First, the byte stream is scanned once into instructions whose
//! operands are still raw (slots and absolute offsets). Then those are threaded into an [`Ops`]
//! sequence, with labels synthesized for every offset something refers to (branch targets,
//! exception ranges, variable ranges) and declarations synthesized for every slot/type pair.

use super::{
    BranchInstruction, Catch, CompareMode, Declaration, EqComparison, ExceptionHandler,
    Instruction, InvokeType, LineNumber, LocalVariable, Op, OpId, Ops, OrdComparison, ShiftType,
    Switch, SwitchLayout, VarType,
};
use crate::jvm::class_file::{Constant, ConstantPool};
use crate::jvm::descriptors::BaseType;
use crate::jvm::{Deserialize, Error};
use crate::util::Width;
use log::trace;
use std::collections::BTreeMap;
use std::io::Cursor;

/// Instruction with raw operands
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Decoded {
    Insn(Instruction<u16>),
    Branch(BranchInstruction<u32, u16>),
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct DecodedOp {
    pub offset: u32,
    pub size: u32,
    pub decoded: Decoded,
}

/// Raw contents of a `Code` attribute, as far as the disassembler cares
pub(crate) struct RawCode<'a> {
    pub code: &'a [u8],
    pub exception_table: &'a [ExceptionHandler],
    pub line_numbers: &'a [LineNumber],
    pub variables: &'a [LocalVariable<u32>],
    pub variable_types: &'a [LocalVariable<u32>],
}

/// Node sequence, along with the debug tables re-expressed in terms of labels
pub(crate) struct Disassembly {
    pub ops: Ops,
    pub variables: Vec<LocalVariable<OpId>>,
    pub variable_types: Vec<LocalVariable<OpId>>,
}

/// Decode the whole instruction stream
pub(crate) fn decode(code: &[u8], pool: &ConstantPool) -> Result<Vec<DecodedOp>, Error> {
    let code_len = code.len() as u32;
    let mut cursor = Cursor::new(code);
    let mut decoded = vec![];
    while (cursor.position() as u32) < code_len {
        let offset = cursor.position() as u32;
        let op = decode_one(&mut cursor, offset, code_len, pool)?;
        decoded.push(DecodedOp {
            offset,
            size: cursor.position() as u32 - offset,
            decoded: op,
        });
    }
    Ok(decoded)
}

fn pool_constant(
    pool: &ConstantPool,
    index: u16,
    expected: &'static str,
    accept: impl Fn(&Constant) -> bool,
) -> Result<Constant, Error> {
    match pool.get(index) {
        Some(constant) if accept(constant) => Ok(constant.clone()),
        Some(_) => Err(Error::UnexpectedConstant { index, expected }),
        None => Err(Error::InvalidConstantIndex(index)),
    }
}

fn field_ref(pool: &ConstantPool, index: u16) -> Result<Constant, Error> {
    pool_constant(pool, index, "FieldRef", |c| {
        matches!(c, Constant::FieldRef(_))
    })
}

fn class_ref(pool: &ConstantPool, index: u16) -> Result<Constant, Error> {
    pool_constant(pool, index, "Class", |c| matches!(c, Constant::Class(_)))
}

fn branch_target(offset: u32, relative: i64, code_len: u32) -> Result<u32, Error> {
    let target = offset as i64 + relative;
    if target < 0 || target >= code_len as i64 {
        return Err(Error::InvalidBranchTarget { offset, target });
    }
    Ok(target as u32)
}

/// Instructions without operands
fn simple_instruction(opcode: u8) -> Option<Instruction<u16>> {
    use Instruction::*;

    Some(match opcode {
        0x00 => Nop,
        0x01 => AConstNull,
        0x02 => IConstM1,
        0x03 => IConst0,
        0x04 => IConst1,
        0x05 => IConst2,
        0x06 => IConst3,
        0x07 => IConst4,
        0x08 => IConst5,
        0x09 => LConst0,
        0x0a => LConst1,
        0x0b => FConst0,
        0x0c => FConst1,
        0x0d => FConst2,
        0x0e => DConst0,
        0x0f => DConst1,
        0x2e => IALoad,
        0x2f => LALoad,
        0x30 => FALoad,
        0x31 => DALoad,
        0x32 => AALoad,
        0x33 => BALoad,
        0x34 => CALoad,
        0x35 => SALoad,
        0x4f => IAStore,
        0x50 => LAStore,
        0x51 => FAStore,
        0x52 => DAStore,
        0x53 => AAStore,
        0x54 => BAStore,
        0x55 => CAStore,
        0x56 => SAStore,
        0x57 => Pop,
        0x58 => Pop2,
        0x59 => Dup,
        0x5a => DupX1,
        0x5b => DupX2,
        0x5c => Dup2,
        0x5d => Dup2X1,
        0x5e => Dup2X2,
        0x5f => Swap,
        0x60 => IAdd,
        0x61 => LAdd,
        0x62 => FAdd,
        0x63 => DAdd,
        0x64 => ISub,
        0x65 => LSub,
        0x66 => FSub,
        0x67 => DSub,
        0x68 => IMul,
        0x69 => LMul,
        0x6a => FMul,
        0x6b => DMul,
        0x6c => IDiv,
        0x6d => LDiv,
        0x6e => FDiv,
        0x6f => DDiv,
        0x70 => IRem,
        0x71 => LRem,
        0x72 => FRem,
        0x73 => DRem,
        0x74 => INeg,
        0x75 => LNeg,
        0x76 => FNeg,
        0x77 => DNeg,
        0x78 => ISh(ShiftType::Left),
        0x79 => LSh(ShiftType::Left),
        0x7a => ISh(ShiftType::ArithmeticRight),
        0x7b => LSh(ShiftType::ArithmeticRight),
        0x7c => ISh(ShiftType::LogicalRight),
        0x7d => LSh(ShiftType::LogicalRight),
        0x7e => IAnd,
        0x7f => LAnd,
        0x80 => IOr,
        0x81 => LOr,
        0x82 => IXor,
        0x83 => LXor,
        0x85 => I2L,
        0x86 => I2F,
        0x87 => I2D,
        0x88 => L2I,
        0x89 => L2F,
        0x8a => L2D,
        0x8b => F2I,
        0x8c => F2L,
        0x8d => F2D,
        0x8e => D2I,
        0x8f => D2L,
        0x90 => D2F,
        0x91 => I2B,
        0x92 => I2C,
        0x93 => I2S,
        0x94 => LCmp,
        0x95 => FCmp(CompareMode::L),
        0x96 => FCmp(CompareMode::G),
        0x97 => DCmp(CompareMode::L),
        0x98 => DCmp(CompareMode::G),
        0xbe => ArrayLength,
        0xc2 => MonitorEnter,
        0xc3 => MonitorExit,
        _ => return None,
    })
}

/// Loads and stores, given the opcode of their normal (one byte index) form
fn local_instruction(opcode: u8, idx: u16) -> Option<Instruction<u16>> {
    use Instruction::*;

    Some(match opcode {
        0x15 => ILoad(idx),
        0x16 => LLoad(idx),
        0x17 => FLoad(idx),
        0x18 => DLoad(idx),
        0x19 => ALoad(idx),
        0x36 => IStore(idx),
        0x37 => LStore(idx),
        0x38 => FStore(idx),
        0x39 => DStore(idx),
        0x3a => AStore(idx),
        _ => return None,
    })
}

fn array_base_type(code: u8) -> Result<BaseType, Error> {
    Ok(match code {
        4 => BaseType::Boolean,
        5 => BaseType::Char,
        6 => BaseType::Float,
        7 => BaseType::Double,
        8 => BaseType::Byte,
        9 => BaseType::Short,
        10 => BaseType::Int,
        11 => BaseType::Long,
        _ => return Err(Error::InvalidArrayType(code)),
    })
}

fn decode_one(
    cursor: &mut Cursor<&[u8]>,
    offset: u32,
    code_len: u32,
    pool: &ConstantPool,
) -> Result<Decoded, Error> {
    use BranchInstruction as B;
    use Instruction as I;

    let opcode = u8::deserialize(cursor)?;
    if let Some(insn) = simple_instruction(opcode) {
        return Ok(Decoded::Insn(insn));
    }

    let insn = match opcode {
        0x10 => I::BiPush(i8::deserialize(cursor)?),
        0x11 => I::SiPush(i16::deserialize(cursor)?),
        0x12 | 0x13 => {
            let index = if opcode == 0x12 {
                u8::deserialize(cursor)? as u16
            } else {
                u16::deserialize(cursor)?
            };
            I::Ldc(pool_constant(pool, index, "loadable constant", |c| {
                c.is_single_word_loadable()
            })?)
        }
        0x14 => I::Ldc2(pool_constant(
            pool,
            u16::deserialize(cursor)?,
            "Long or Double",
            |c| c.is_double_word_loadable(),
        )?),
        0x15..=0x19 | 0x36..=0x3a => {
            let idx = u8::deserialize(cursor)? as u16;
            match local_instruction(opcode, idx) {
                Some(insn) => insn,
                None => unreachable!("opcode range is covered by local_instruction"),
            }
        }

        // Short forms: four per type, in the order int, long, float, double, reference
        0x1a..=0x2d => {
            let n = opcode - 0x1a;
            match local_instruction(0x15 + n / 4, (n % 4) as u16) {
                Some(insn) => insn,
                None => unreachable!("short loads map onto normal loads"),
            }
        }
        0x3b..=0x4e => {
            let n = opcode - 0x3b;
            match local_instruction(0x36 + n / 4, (n % 4) as u16) {
                Some(insn) => insn,
                None => unreachable!("short stores map onto normal stores"),
            }
        }
        0x84 => I::IInc(
            u8::deserialize(cursor)? as u16,
            i8::deserialize(cursor)? as i16,
        ),

        0x99..=0xa8 | 0xc6 | 0xc7 => {
            let target = branch_target(offset, i16::deserialize(cursor)? as i64, code_len)?;
            let branch = match opcode {
                0x99 => B::If(OrdComparison::EQ, target),
                0x9a => B::If(OrdComparison::NE, target),
                0x9b => B::If(OrdComparison::LT, target),
                0x9c => B::If(OrdComparison::GE, target),
                0x9d => B::If(OrdComparison::GT, target),
                0x9e => B::If(OrdComparison::LE, target),
                0x9f => B::IfICmp(OrdComparison::EQ, target),
                0xa0 => B::IfICmp(OrdComparison::NE, target),
                0xa1 => B::IfICmp(OrdComparison::LT, target),
                0xa2 => B::IfICmp(OrdComparison::GE, target),
                0xa3 => B::IfICmp(OrdComparison::GT, target),
                0xa4 => B::IfICmp(OrdComparison::LE, target),
                0xa5 => B::IfACmp(EqComparison::EQ, target),
                0xa6 => B::IfACmp(EqComparison::NE, target),
                0xa7 => B::Goto(target),
                0xa8 => B::Jsr(target),
                0xc6 => B::IfNull(EqComparison::EQ, target),
                _ => B::IfNull(EqComparison::NE, target),
            };
            return Ok(Decoded::Branch(branch));
        }
        0xc8 | 0xc9 => {
            let target = branch_target(offset, i32::deserialize(cursor)? as i64, code_len)?;
            return Ok(Decoded::Branch(if opcode == 0xc8 {
                B::Goto(target)
            } else {
                B::Jsr(target)
            }));
        }
        0xa9 => return Ok(Decoded::Branch(B::Ret(u8::deserialize(cursor)? as u16))),
        0xaa | 0xab => {
            for _ in 0..(3 - offset % 4) {
                u8::deserialize(cursor)?;
            }
            let default = branch_target(offset, i32::deserialize(cursor)? as i64, code_len)?;
            let mut switch = Switch::new(default);
            let mut push_case = |key: i32, target: u32| {
                if target != default {
                    switch.cases.push((key, target));
                }
            };
            let layout = if opcode == 0xaa {
                let low = i32::deserialize(cursor)?;
                let high = i32::deserialize(cursor)?;
                if high < low {
                    return Err(Error::MalformedSwitch { offset });
                }
                for key in low..=high {
                    let target =
                        branch_target(offset, i32::deserialize(cursor)? as i64, code_len)?;
                    push_case(key, target);
                }
                SwitchLayout::Table { low, high }
            } else {
                let pairs = i32::deserialize(cursor)?;
                if pairs < 0 {
                    return Err(Error::MalformedSwitch { offset });
                }
                for _ in 0..pairs {
                    let key = i32::deserialize(cursor)?;
                    let target =
                        branch_target(offset, i32::deserialize(cursor)? as i64, code_len)?;
                    push_case(key, target);
                }
                SwitchLayout::Lookup
            };
            switch.layout = layout;
            return Ok(Decoded::Branch(B::Switch(switch)));
        }
        0xac => return Ok(Decoded::Branch(B::IReturn)),
        0xad => return Ok(Decoded::Branch(B::LReturn)),
        0xae => return Ok(Decoded::Branch(B::FReturn)),
        0xaf => return Ok(Decoded::Branch(B::DReturn)),
        0xb0 => return Ok(Decoded::Branch(B::AReturn)),
        0xb1 => return Ok(Decoded::Branch(B::Return)),
        0xbf => return Ok(Decoded::Branch(B::AThrow)),

        0xb2 => I::GetStatic(field_ref(pool, u16::deserialize(cursor)?)?),
        0xb3 => I::PutStatic(field_ref(pool, u16::deserialize(cursor)?)?),
        0xb4 => I::GetField(field_ref(pool, u16::deserialize(cursor)?)?),
        0xb5 => I::PutField(field_ref(pool, u16::deserialize(cursor)?)?),
        0xb6..=0xb8 => {
            let method = pool_constant(pool, u16::deserialize(cursor)?, "MethodRef", |c| {
                matches!(c, Constant::MethodRef(_) | Constant::InterfaceMethodRef(_))
            })?;
            let invoke_type = match opcode {
                0xb6 => InvokeType::Virtual,
                0xb7 => InvokeType::Special,
                _ => InvokeType::Static,
            };
            I::Invoke(invoke_type, method)
        }
        0xb9 => {
            let method = pool_constant(
                pool,
                u16::deserialize(cursor)?,
                "InterfaceMethodRef",
                |c| matches!(c, Constant::InterfaceMethodRef(_)),
            )?;

            // Argument count and trailing zero are recomputed on assembly
            u8::deserialize(cursor)?;
            u8::deserialize(cursor)?;
            I::Invoke(InvokeType::Interface, method)
        }
        0xba => {
            let call_site = pool_constant(pool, u16::deserialize(cursor)?, "InvokeDynamic", |c| {
                matches!(c, Constant::InvokeDynamic { .. })
            })?;
            u16::deserialize(cursor)?;
            I::InvokeDynamic(call_site)
        }
        0xbb => I::New(class_ref(pool, u16::deserialize(cursor)?)?),
        0xbc => I::NewArray(array_base_type(u8::deserialize(cursor)?)?),
        0xbd => I::ANewArray(class_ref(pool, u16::deserialize(cursor)?)?),
        0xc0 => I::CheckCast(class_ref(pool, u16::deserialize(cursor)?)?),
        0xc1 => I::InstanceOf(class_ref(pool, u16::deserialize(cursor)?)?),
        0xc5 => {
            let class = class_ref(pool, u16::deserialize(cursor)?)?;
            I::MultiANewArray(class, u8::deserialize(cursor)?)
        }
        0xc4 => {
            let modified = u8::deserialize(cursor)?;
            match modified {
                0x84 => I::IInc(u16::deserialize(cursor)?, i16::deserialize(cursor)?),
                0xa9 => return Ok(Decoded::Branch(B::Ret(u16::deserialize(cursor)?))),
                _ => match local_instruction(modified, 0) {
                    Some(_) => match local_instruction(modified, u16::deserialize(cursor)?) {
                        Some(insn) => insn,
                        None => unreachable!("opcode was just accepted"),
                    },
                    None => {
                        return Err(Error::InvalidWideOpcode {
                            opcode: modified,
                            offset,
                        })
                    }
                },
            }
        }
        _ => return Err(Error::InvalidOpcode { opcode, offset }),
    };
    Ok(Decoded::Insn(insn))
}

/// Type of the variable accessed by a load, store, or increment
fn local_type<V>(insn: &Instruction<V>) -> VarType {
    use Instruction::*;
    match insn {
        LLoad(_) | LStore(_) => VarType::Long,
        FLoad(_) | FStore(_) => VarType::Float,
        DLoad(_) | DStore(_) => VarType::Double,
        ALoad(_) | AStore(_) => VarType::Reference,
        _ => VarType::Int,
    }
}

/// Incremental construction of the node sequence
struct Builder {
    ops: Ops,
    code_len: u32,

    /// Which offsets start an instruction (including the end of the code)
    starts: Vec<bool>,
    labels: BTreeMap<u32, OpId>,
    vars: BTreeMap<(u16, VarType), OpId>,
}

impl Builder {
    fn label_at(&mut self, offset: u32) -> Result<OpId, Error> {
        self.check_boundary(offset)?;
        let ops = &mut self.ops;
        Ok(*self
            .labels
            .entry(offset)
            .or_insert_with(|| ops.create(Op::Label, 0)))
    }

    fn var(&mut self, slot: u16, var_type: VarType) -> OpId {
        let ops = &mut self.ops;
        *self.vars.entry((slot, var_type)).or_insert_with(|| {
            ops.create(Op::Declare(Declaration::new(var_type).at_slot(slot)), 0)
        })
    }

    /// Check that an offset falls on an instruction boundary (or the end of the code)
    fn check_boundary(&self, offset: u32) -> Result<(), Error> {
        if self.starts.get(offset as usize).copied().unwrap_or(false) {
            Ok(())
        } else {
            Err(Error::MisalignedOp { offset })
        }
    }

    fn convert(&mut self, decoded: &Decoded) -> Result<Op, Error> {
        Ok(match decoded {
            Decoded::Insn(insn) => {
                let var_type = local_type(insn);
                Op::Insn(insn.map_vars(|slot| self.var(*slot, var_type)))
            }
            Decoded::Branch(BranchInstruction::Ret(slot)) => {
                let var = self.var(*slot, VarType::ReturnAddress);
                Op::Branch(BranchInstruction::Ret(var))
            }
            Decoded::Branch(branch) => {
                let mut targets = vec![];
                visit_targets(branch, |target| targets.push(target));
                for target in targets {
                    self.label_at(target)?;
                }
                let labels = &self.labels;
                Op::Branch(branch.map_labels(
                    |target| labels[target],
                    |_| unreachable!("only `ret` refers to a variable"),
                ))
            }
        })
    }

    /// Resolve a variable table entry to labels
    fn variable_range(&mut self, entry: &LocalVariable<u32>) -> Result<LocalVariable<OpId>, Error> {
        let start = self.label_at(entry.start)?;
        let end = self.label_at(entry.end)?;
        Ok(entry.clone().map_range(start, end))
    }
}

fn visit_targets<V>(branch: &BranchInstruction<u32, V>, mut visit: impl FnMut(u32)) {
    use BranchInstruction::*;
    match branch {
        If(_, target) | IfICmp(_, target) | IfACmp(_, target) | IfNull(_, target)
        | Goto(target) | Jsr(target) => visit(*target),
        Switch(switch) => {
            visit(switch.default);
            for (_, target) in &switch.cases {
                visit(*target);
            }
        }
        _ => (),
    }
}

/// Turn raw code into a node sequence
///
/// `parameters` lists the types of the method's parameters (including `this` when non-static),
/// so that declarations exist for all of them even if they are never read.
pub(crate) fn disassemble(
    raw: &RawCode<'_>,
    parameters: &[VarType],
    pool: &ConstantPool,
) -> Result<Disassembly, Error> {
    let code_len = raw.code.len() as u32;
    let decoded = decode(raw.code, pool)?;

    let mut starts = vec![false; code_len as usize + 1];
    for op in &decoded {
        starts[op.offset as usize] = true;
    }
    starts[code_len as usize] = true;
    let mut builder = Builder {
        ops: Ops::new(),
        code_len,
        starts,
        labels: BTreeMap::new(),
        vars: BTreeMap::new(),
    };

    let mut instructions: Vec<(u32, u32, OpId)> = Vec::with_capacity(decoded.len());
    for op in &decoded {
        let converted = builder.convert(&op.decoded)?;
        let id = builder.ops.create(converted, 0);
        instructions.push((op.offset, op.size, id));
    }

    // Exception ranges become `Try` at the start and `Catch` at the end
    let mut trys: BTreeMap<(u16, u16), OpId> = BTreeMap::new();
    let mut try_at: BTreeMap<u32, Vec<OpId>> = BTreeMap::new();
    let mut catch_at: BTreeMap<u32, Vec<OpId>> = BTreeMap::new();
    for (ordinal, handler) in raw.exception_table.iter().enumerate() {
        let start = handler.start_pc as u32;
        let end = handler.end_pc as u32;
        if start >= end || handler.handler_pc as u32 >= code_len {
            return Err(Error::MalformedAttribute {
                name: String::from("Code"),
            });
        }
        builder.check_boundary(start)?;
        builder.check_boundary(end)?;
        let handler_label = builder.label_at(handler.handler_pc as u32)?;

        let ops = &mut builder.ops;
        let try_op = *trys
            .entry((handler.start_pc, handler.end_pc))
            .or_insert_with(|| {
                let try_op = ops.create(Op::Try(vec![]), 0);
                try_at.entry(start).or_default().push(try_op);
                try_op
            });
        let mut catch = Catch::new(try_op, handler.catch_type.clone(), handler_label);
        catch.ordinal = Some(ordinal as u32);
        let catch_op = ops.create(Op::Catch(catch), 0);
        catch_at.entry(end).or_default().push(catch_op);
    }

    let mut slot = 0u16;
    for param in parameters {
        builder.var(slot, *param);
        slot += param.width() as u16;
    }

    let variables = raw
        .variables
        .iter()
        .map(|entry| builder.variable_range(entry))
        .collect::<Result<Vec<_>, Error>>()?;
    let variable_types = raw
        .variable_types
        .iter()
        .map(|entry| builder.variable_range(entry))
        .collect::<Result<Vec<_>, Error>>()?;

    // Each instruction gets the line of the last entry starting at or before it
    let mut line_numbers = raw.line_numbers.to_vec();
    line_numbers.sort_by_key(|entry| entry.start_pc);
    let mut lines = line_numbers.iter().peekable();
    let mut line = 0;

    let mut ops = builder.ops;
    let begin = ops.create(Op::Begin, 0);
    ops.place(begin)?;
    for var in builder.vars.values() {
        ops.place(*var)?;
    }

    let mut place_deferred = |ops: &mut Ops, offset: u32, line: u16| -> Result<(), Error> {
        let deferred = catch_at
            .remove(&offset)
            .unwrap_or_default()
            .into_iter()
            .chain(builder.labels.get(&offset).copied())
            .chain(try_at.remove(&offset).unwrap_or_default());
        for id in deferred {
            ops.place(id)?;
            ops[id].offset = offset;
            ops[id].line = line;
        }
        Ok(())
    };
    for (offset, size, id) in instructions {
        let mut line_entry = false;
        while let Some(entry) = lines.next_if(|entry| entry.start_pc as u32 <= offset) {
            line = entry.line;
            line_entry = true;
        }
        place_deferred(&mut ops, offset, line)?;
        ops.place(id)?;
        let node = &mut ops[id];
        node.offset = offset;
        node.size = size;
        node.line = line;
        node.line_entry = line_entry;
    }
    place_deferred(&mut ops, code_len, 0)?;
    let end = ops.create(Op::End, 0);
    ops.place(end)?;
    ops[end].offset = code_len;

    trace!(
        "disassembled {} bytes into {} nodes ({} labels, {} variables)",
        builder.code_len,
        ops.capacity(),
        builder.labels.len(),
        builder.vars.len()
    );
    Ok(Disassembly {
        ops,
        variables,
        variable_types,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn raw(code: &[u8]) -> RawCode<'_> {
        RawCode {
            code,
            exception_table: &[],
            line_numbers: &[],
            variables: &[],
            variable_types: &[],
        }
    }

    fn kinds(ops: &Ops) -> Vec<String> {
        ops.iter().map(|id| ops.render(id)).collect()
    }

    #[test]
    fn straight_line() {
        let pool = ConstantPool::new();
        let code = [0x04, 0x05, 0x60, 0xac]; // iconst_1 iconst_2 iadd ireturn
        let disassembly = disassemble(&raw(&code), &[], &pool).unwrap();
        let ops = &disassembly.ops;
        assert_eq!(
            kinds(ops),
            vec!["{", "iconst_1", "iconst_2", "iadd", "ireturn", "}"]
        );
        let offsets: Vec<u32> = ops
            .iter()
            .filter(|id| ops[*id].op.is_sized())
            .map(|id| ops[id].offset())
            .collect();
        assert_eq!(offsets, vec![0, 1, 2, 3]);
    }

    #[test]
    fn variables_and_labels() {
        let pool = ConstantPool::new();

        // iload_1; ifeq +5; iconst_1; ireturn; iconst_0; ireturn
        let code = [0x1b, 0x99, 0x00, 0x05, 0x04, 0xac, 0x03, 0xac];
        let disassembly =
            disassemble(&raw(&code), &[VarType::Reference, VarType::Int], &pool).unwrap();
        let ops = &disassembly.ops;

        let decls: Vec<(u16, VarType)> = ops
            .iter()
            .filter_map(|id| match &ops[id].op {
                Op::Declare(decl) => Some((decl.slot.unwrap(), decl.var_type)),
                _ => None,
            })
            .collect();
        assert_eq!(decls, vec![(0, VarType::Reference), (1, VarType::Int)]);

        let labels: Vec<u32> = ops
            .iter()
            .filter(|id| ops[*id].op == Op::Label)
            .map(|id| ops[id].offset())
            .collect();
        assert_eq!(labels, vec![6]);
    }

    #[test]
    fn wide_forms_fold() {
        let pool = ConstantPool::new();
        let code = [
            0xc4, 0x15, 0x01, 0x00, // wide iload 256
            0xc4, 0x84, 0x01, 0x00, 0x03, 0xe8, // wide iinc 256 1000
            0xc8, 0x00, 0x00, 0x00, 0x05, // goto_w +5
            0xb1,
        ];
        let decoded = decode(&code, &pool).unwrap();
        assert_eq!(decoded[0].decoded, Decoded::Insn(Instruction::ILoad(256)));
        assert_eq!(decoded[1].decoded, Decoded::Insn(Instruction::IInc(256, 1000)));
        assert_eq!(
            decoded[2].decoded,
            Decoded::Branch(BranchInstruction::Goto(15))
        );
        assert_eq!(decoded[2].size, 5);
    }

    #[test]
    fn switch_cases_matching_default_are_dropped() {
        let pool = ConstantPool::new();
        let code = [
            0xaa, 0, 0, 0, // tableswitch + padding
            0, 0, 0, 24, // default
            0, 0, 0, 1, // low
            0, 0, 0, 2, // high
            0, 0, 0, 25, // 1 -> 25
            0, 0, 0, 24, // 2 -> default
            0xb1, 0xb1,
        ];
        let decoded = decode(&code, &pool).unwrap();
        match &decoded[0].decoded {
            Decoded::Branch(BranchInstruction::Switch(switch)) => {
                assert_eq!(switch.default, 24);
                assert_eq!(switch.cases, vec![(1, 25)]);
                assert_eq!(switch.layout, SwitchLayout::Table { low: 1, high: 2 });
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn exception_ranges_share_try() {
        let mut pool = ConstantPool::new();
        pool.register(&Constant::class("java/lang/Exception")).unwrap();
        let code = [0x00, 0x00, 0xb1, 0x57, 0xb1]; // nop nop return pop return
        let exception_table = [
            ExceptionHandler {
                start_pc: 0,
                end_pc: 2,
                handler_pc: 3,
                catch_type: Some(String::from("java/lang/Exception")),
            },
            ExceptionHandler {
                start_pc: 0,
                end_pc: 2,
                handler_pc: 3,
                catch_type: None,
            },
        ];
        let raw = RawCode {
            exception_table: &exception_table,
            ..raw(&code)
        };
        let disassembly = disassemble(&raw, &[], &pool).unwrap();
        let ops = &disassembly.ops;
        let trys: Vec<OpId> = ops
            .iter()
            .filter(|id| matches!(ops[*id].op, Op::Try(_)))
            .collect();
        assert_eq!(trys.len(), 1);
        match &ops[trys[0]].op {
            Op::Try(catches) => assert_eq!(catches.len(), 2),
            _ => unreachable!(),
        }
        assert_eq!(ops.iter().next().map(|id| ops.render(id)).unwrap(), "{");
        assert_eq!(kinds(ops)[1], "try");
    }

    #[test]
    fn bad_code() {
        let pool = ConstantPool::new();
        assert!(matches!(
            decode(&[0xca], &pool),
            Err(Error::InvalidOpcode { opcode: 0xca, offset: 0 })
        ));
        assert!(matches!(
            decode(&[0xa7, 0x00, 0x10], &pool),
            Err(Error::InvalidBranchTarget { offset: 0, target: 16 })
        ));
        assert!(matches!(
            disassemble(&raw(&[0xa7, 0x00, 0x01, 0xb1]), &[], &pool),
            Err(Error::MisalignedOp { offset: 1 })
        ));
        assert!(matches!(
            decode(&[0x12, 0x07], &pool),
            Err(Error::InvalidConstantIndex(7))
        ));
    }
}
