//! Pre-assembly and assembly of a node sequence
//!
//! Pre-assembly verifies the sequence, strips unreachable code, allocates variable slots, works
//! out the debug ranges of named variables, and registers every constant the code will need.
//! Assembly then lays the nodes out and encodes them.

use super::assignment::{assigned_ranges, AssignedRange, Scopes};
use super::verifier::{check_stack, StackCheck};
use super::{
    BranchInstruction, ExceptionHandler, Instruction, LineNumber, LocalVariable, Op, OpId, Ops,
    VarType,
};
use crate::jvm::class_file::{Constant, ConstantPool};
use crate::jvm::{Error, Settings};
use crate::util::Width;
use log::{debug, trace};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Guarded section, as a `Try` and one of its catches
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Section {
    pub try_op: OpId,
    pub catch: OpId,
}

/// Outcome of pre-assembly
#[derive(Clone, Debug)]
pub(crate) struct Prepared {
    pub max_stack: u16,
    pub max_locals: u16,

    /// Guarded sections, in exception table order
    pub sections: Vec<Section>,

    /// Debug ranges of named variables
    pub assigned: Vec<AssignedRange>,

    /// Number of contexts (main body plus subroutines)
    pub contexts: usize,
}

/// Encoded code and side tables
#[derive(Clone, Debug, Default)]
pub(crate) struct Assembled {
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionHandler>,
    pub line_numbers: Vec<LineNumber>,
    pub variables: Vec<LocalVariable<u32>>,
    pub variable_types: Vec<LocalVariable<u32>>,
}

struct Scope {
    /// Free slot per context when the scope was opened
    free: Vec<u32>,
    decls: Vec<OpId>,
}

fn out_of_scope(ops: &Ops, id: OpId) -> Error {
    Error::VariableOutOfScope {
        op: ops.render(id),
    }
}

/// Variable operand of a node, if any
fn variable_operand(op: &Op) -> Option<OpId> {
    match op {
        Op::Insn(insn) => insn.variable().copied(),
        Op::Branch(BranchInstruction::Ret(var)) => Some(*var),
        _ => None,
    }
}

/// Prepare a node sequence for assembly
///
/// `parameters` are the types of the parameters (including `this`), which occupy the first
/// slots.
pub(crate) fn preassemble(
    ops: &mut Ops,
    parameters: &[VarType],
    pool: &mut ConstantPool,
    settings: &Settings,
) -> Result<Prepared, Error> {
    // Execution (and every other control transfer) always starts at a label
    match ops.first() {
        Some(first) if ops[first].op == Op::Label => (),
        _ => {
            let entry = ops.create(Op::Label, 0);
            ops.place_first(entry)?;
        }
    }
    let check = check_stack(ops, settings.max_pending_paths)?;
    let contexts = check.contexts.len();

    let mut scopes: Vec<Scope> = vec![];
    let mut free: Vec<u32> = vec![0; contexts];
    let mut context = 0;
    let mut declared: HashSet<OpId> = HashSet::new();
    let mut closed: HashSet<OpId> = HashSet::new();
    let mut relative: Vec<(OpId, usize, u32)> = vec![];
    let mut explicit_end: u32 = 0;
    let mut jsr_first_slot: HashMap<OpId, u32> = HashMap::new();
    let mut tracked: BTreeSet<OpId> = BTreeSet::new();
    let mut in_scope_debug: BTreeSet<OpId> = BTreeSet::new();
    let mut in_scope: HashMap<OpId, BTreeSet<OpId>> = HashMap::new();
    let mut scope_end: HashMap<OpId, OpId> = HashMap::new();
    let mut sections: Vec<(Section, Option<u32>)> = vec![];
    let mut removed = 0usize;

    let mut prev: Option<OpId> = None;
    let mut cursor = ops.first();
    while let Some(id) = cursor {
        cursor = ops.next(id);

        // Sized nodes the verifier never reached are dead
        if ops[id].op.is_sized() && ops[id].height.is_none() {
            ops.unlink_after(prev, id);
            removed += 1;
            continue;
        }
        if let Some(ctx) = check.context(id) {
            context = ctx;
        }

        match &ops[id].op {
            Op::Begin => scopes.push(Scope {
                free: free.clone(),
                decls: vec![],
            }),
            Op::End => {
                let scope = scopes.pop().ok_or(Error::UnmatchedEnd(id))?;
                free = scope.free;
                for decl in scope.decls {
                    in_scope_debug.remove(&decl);
                    closed.insert(decl);
                    scope_end.insert(decl, id);
                }
            }
            Op::Declare(decl) => {
                let scope = match scopes.last_mut() {
                    Some(scope) => scope,
                    None => return Err(out_of_scope(ops, id)),
                };
                scope.decls.push(id);
                declared.insert(id);
                if decl.has_debug_info() {
                    tracked.insert(id);
                    in_scope_debug.insert(id);
                }
                let width = decl.var_type.width() as u32;
                match decl.slot {
                    Some(slot) => explicit_end = explicit_end.max(slot as u32 + width),
                    None => {
                        relative.push((id, context, free[context]));
                        free[context] += width;
                    }
                }
            }
            Op::Branch(BranchInstruction::Jsr(_)) => {
                jsr_first_slot.insert(id, free[context]);
            }
            Op::Label => {
                in_scope.insert(id, in_scope_debug.clone());
            }
            Op::Catch(catch) => sections.push((
                Section {
                    try_op: catch.try_op,
                    catch: id,
                },
                catch.ordinal,
            )),
            _ => (),
        }
        if let Some(var) = variable_operand(&ops[id].op) {
            if !declared.contains(&var) || closed.contains(&var) {
                return Err(out_of_scope(ops, id));
            }
        }
        prev = Some(id);
    }
    if !scopes.is_empty() {
        return Err(Error::UnmatchedBegin);
    }
    if removed > 0 {
        debug!("removed {} unreachable instructions", removed);
    }

    // Parameters occupy the first slots even when nothing declares them
    let parameter_words: u32 = parameters.iter().map(|p| p.width() as u32).sum();
    let main_base = explicit_end.max(parameter_words);
    let bases = context_bases(&check, &jsr_first_slot, main_base);
    let mut max_locals = main_base;
    for (id, ctx, offset) in relative {
        if let Op::Declare(decl) = &mut ops[id].op {
            let slot = bases[ctx] + offset;
            let end = slot + decl.var_type.width() as u32;
            if end > u16::MAX as u32 {
                return Err(Error::MaxLocalsOverflow(end as usize));
            }
            decl.slot = Some(slot as u16);
            max_locals = max_locals.max(end);
        }
    }

    let assigned = if tracked.is_empty() {
        vec![]
    } else {
        let scopes = Scopes {
            tracked,
            in_scope,
            scope_end,
            parameter_words: parameter_words as u16,
        };
        assigned_ranges(ops, &check, &scopes, settings.max_pending_paths)?
    };

    register_constants(ops, &assigned, pool)?;

    // Disassembled sections keep their original order, others follow the catches
    if sections.iter().all(|(_, ordinal)| ordinal.is_some()) {
        sections.sort_by_key(|(_, ordinal)| *ordinal);
    }

    Ok(Prepared {
        max_stack: check.max_stack,
        max_locals: max_locals as u16,
        sections: sections.into_iter().map(|(section, _)| section).collect(),
        assigned,
        contexts,
    })
}

/// First slot of each context
///
/// A subroutine's variables go after everything its callers have allocated at the point of
/// the call. Callers can sit in any context, so this iterates until nothing changes.
fn context_bases(
    check: &StackCheck,
    jsr_first_slot: &HashMap<OpId, u32>,
    main_base: u32,
) -> Vec<u32> {
    let mut bases = vec![0; check.contexts.len()];
    if let Some(main) = bases.first_mut() {
        *main = main_base;
    }
    for _ in 0..check.contexts.len() {
        let mut changed = false;
        for (ctx, context) in check.contexts.iter().enumerate().skip(1) {
            let base = context
                .callers
                .iter()
                .filter_map(|jsr| {
                    let caller = check.context(*jsr)?;
                    Some(bases[caller] + jsr_first_slot.get(jsr).copied().unwrap_or(0))
                })
                .max()
                .unwrap_or(0);
            if base != bases[ctx] {
                bases[ctx] = base;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    bases
}

fn register_constants(
    ops: &Ops,
    assigned: &[AssignedRange],
    pool: &mut ConstantPool,
) -> Result<(), Error> {
    for id in ops.iter() {
        match &ops[id].op {
            Op::Insn(insn) => {
                if let Some(constant) = insn.constant() {
                    pool.register(constant)?;
                }
            }
            Op::Catch(catch) => {
                if let Some(class) = &catch.exception {
                    pool.register(&Constant::Class(class.clone()))?;
                }
            }
            _ => (),
        }
    }
    for range in assigned {
        let decl = ops.declaration(range.var)?;
        let strings = [&decl.name, &decl.descriptor, &decl.signature];
        for string in strings.iter().copied().flatten() {
            pool.register(&Constant::Utf8(string.clone()))?;
        }
    }
    Ok(())
}

fn slot_of(ops: &Ops, var: &OpId) -> Result<u16, Error> {
    ops.declaration(*var)?
        .slot
        .ok_or(Error::UnknownVariable(*var))
}

fn lower_insn(ops: &Ops, insn: &Instruction<OpId>) -> Result<Instruction<u16>, Error> {
    let slot = match insn.variable() {
        Some(var) => Some(slot_of(ops, var)?),
        None => None,
    };
    Ok(insn.map_vars(|_| slot.unwrap_or(0)))
}

fn lower_branch(
    ops: &Ops,
    branch: &BranchInstruction<OpId, OpId>,
    resolve_labels: bool,
) -> Result<BranchInstruction<u32, u16>, Error> {
    let slot = match branch {
        BranchInstruction::Ret(var) => slot_of(ops, var)?,
        _ => 0,
    };
    let mut missing = None;
    let lowered = branch.map_labels(
        |label| {
            if !resolve_labels {
                return 0;
            }
            match ops.get(*label) {
                Some(node) if node.op == Op::Label && node.linked => node.offset,
                _ => {
                    missing = Some(*label);
                    0
                }
            }
        },
        |_| slot,
    );
    match missing {
        Some(label) => Err(Error::NotALabel(label)),
        None => Ok(lowered),
    }
}

/// Start of a debug range in code offsets
fn range_start(ops: &Ops, id: OpId) -> u32 {
    let node = &ops[id];
    match &node.op {
        Op::Insn(insn) if insn.is_store() => node.offset + node.size,
        _ => node.offset,
    }
}

fn label_offset(ops: &Ops, label: OpId) -> Result<u32, Error> {
    match ops.get(label) {
        Some(node) if node.linked => Ok(node.offset),
        _ => Err(Error::NotALabel(label)),
    }
}

/// Lay out and encode a pre-assembled sequence
///
/// `variables` and `variable_types` are debug ranges carried over from disassembly, which are
/// emitted before the freshly computed ones.
pub(crate) fn assemble(
    ops: &mut Ops,
    prepared: &Prepared,
    variables: &[LocalVariable<OpId>],
    variable_types: &[LocalVariable<OpId>],
    pool: &ConstantPool,
) -> Result<Assembled, Error> {
    // Sizes only depend on offsets through switch padding, so one pass fixes the layout
    let ids: Vec<OpId> = ops.iter().collect();
    let mut offset: usize = 0;
    for id in &ids {
        let size = match &ops[*id].op {
            Op::Insn(insn) => lower_insn(ops, insn)?.width(pool)?,
            Op::Branch(branch) => lower_branch(ops, branch, false)?.width_at(offset as u32),
            _ => 0,
        };
        let node = &mut ops[*id];
        node.offset = offset as u32;
        node.size = size as u32;
        offset += size;
        if offset > u16::MAX as usize {
            return Err(Error::MethodCodeOverflow(offset));
        }
    }

    let mut assembled = Assembled {
        code: Vec::with_capacity(offset),
        ..Assembled::default()
    };
    let mut previous_line = 0;
    for id in &ids {
        let node = &ops[*id];
        match &node.op {
            Op::Insn(insn) => lower_insn(ops, insn)?.assemble(pool, &mut assembled.code)?,
            Op::Branch(branch) => {
                lower_branch(ops, branch, true)?.assemble(node.offset, &mut assembled.code)?
            }
            _ => continue,
        }
        if node.line > 0 && (node.line != previous_line || node.line_entry) {
            assembled.line_numbers.push(LineNumber {
                start_pc: node.offset as u16,
                line: node.line,
            });
            previous_line = node.line;
        }
    }

    for section in &prepared.sections {
        let catch = match &ops[section.catch].op {
            Op::Catch(catch) => catch,
            _ => return Err(Error::NotATry(section.catch)),
        };
        let start = ops[section.try_op].offset;
        let end = ops[section.catch].offset;
        if start >= end {
            continue;
        }
        assembled.exception_table.push(ExceptionHandler {
            start_pc: start as u16,
            end_pc: end as u16,
            handler_pc: label_offset(ops, catch.handler)? as u16,
            catch_type: catch.exception.clone(),
        });
    }

    for (retained, table) in [
        (variables, &mut assembled.variables),
        (variable_types, &mut assembled.variable_types),
    ] {
        for entry in retained {
            let start = label_offset(ops, entry.start)?;
            let end = label_offset(ops, entry.end)?;
            table.push(entry.clone().map_range(start, end));
        }
    }
    for range in &prepared.assigned {
        let decl = ops.declaration(range.var)?;
        let start = range_start(ops, range.start);
        let end = ops[range.end].offset;
        if start >= end {
            continue;
        }
        let (name, descriptor, slot) = match (&decl.name, &decl.descriptor, decl.slot) {
            (Some(name), Some(descriptor), Some(slot)) => (name, descriptor, slot),
            _ => continue,
        };
        let entry = LocalVariable {
            start,
            end,
            name: name.clone(),
            descriptor: descriptor.clone(),
            slot,
        };
        if let Some(signature) = &decl.signature {
            assembled.variable_types.push(LocalVariable {
                descriptor: signature.clone(),
                ..entry.clone()
            });
        }
        assembled.variables.push(entry);
    }

    trace!(
        "assembled {} bytes, {} handlers, {} line entries, max stack {}, max locals {}",
        assembled.code.len(),
        assembled.exception_table.len(),
        assembled.line_numbers.len(),
        prepared.max_stack,
        prepared.max_locals
    );
    Ok(assembled)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::code::{Catch, Declaration, OrdComparison};

    fn place(ops: &mut Ops, op: Op, line: u16) -> OpId {
        let id = ops.create(op, line);
        ops.place(id).unwrap();
        id
    }

    fn build(ops: &mut Ops, pool: &mut ConstantPool, params: &[VarType]) -> (Prepared, Assembled) {
        let prepared = preassemble(ops, params, pool, &Settings::default()).unwrap();
        let assembled = assemble(ops, &prepared, &[], &[], pool).unwrap();
        (prepared, assembled)
    }

    #[test]
    fn slots_follow_scopes() {
        let mut ops = Ops::new();
        let mut pool = ConstantPool::new();
        place(&mut ops, Op::Begin, 0);
        let a = place(
            &mut ops,
            Op::Declare(Declaration::new(VarType::Int).at_slot(0)),
            0,
        );
        place(&mut ops, Op::Begin, 0);
        let b = place(&mut ops, Op::Declare(Declaration::new(VarType::Long)), 0);
        place(&mut ops, Op::Insn(Instruction::LConst0), 0);
        place(&mut ops, Op::Insn(Instruction::LStore(b)), 0);
        place(&mut ops, Op::End, 0);
        place(&mut ops, Op::Begin, 0);
        let c = place(&mut ops, Op::Declare(Declaration::new(VarType::Int)), 0);
        place(&mut ops, Op::Insn(Instruction::ILoad(a)), 0);
        place(&mut ops, Op::Insn(Instruction::IStore(c)), 0);
        place(&mut ops, Op::End, 0);
        place(&mut ops, Op::Branch(BranchInstruction::Return), 0);
        place(&mut ops, Op::End, 0);

        let (prepared, assembled) = build(&mut ops, &mut pool, &[VarType::Int]);
        assert_eq!(ops.declaration(a).unwrap().slot, Some(0));
        assert_eq!(ops.declaration(b).unwrap().slot, Some(1));
        assert_eq!(ops.declaration(c).unwrap().slot, Some(1));
        assert_eq!(prepared.max_locals, 3);
        assert_eq!(prepared.max_stack, 2);

        // lconst_0 lstore_1 iload_0 istore_1 return
        assert_eq!(assembled.code, vec![0x09, 0x40, 0x1a, 0x3c, 0xb1]);
    }

    #[test]
    fn locals_start_after_undeclared_parameters() {
        // Instance method `m(I)V` whose body never declares `this` or the argument
        let mut ops = Ops::new();
        let mut pool = ConstantPool::new();
        place(&mut ops, Op::Begin, 0);
        let local = place(&mut ops, Op::Declare(Declaration::new(VarType::Int)), 0);
        place(&mut ops, Op::Insn(Instruction::IConst1), 0);
        place(&mut ops, Op::Insn(Instruction::IStore(local)), 0);
        place(&mut ops, Op::Branch(BranchInstruction::Return), 0);
        place(&mut ops, Op::End, 0);

        let (prepared, assembled) =
            build(&mut ops, &mut pool, &[VarType::Reference, VarType::Int]);
        assert_eq!(ops.declaration(local).unwrap().slot, Some(2));
        assert_eq!(prepared.max_locals, 3);

        // iconst_1 istore_2 return
        assert_eq!(assembled.code, vec![0x04, 0x3d, 0xb1]);
    }

    #[test]
    fn dead_code_is_stripped() {
        let mut ops = Ops::new();
        let mut pool = ConstantPool::new();
        let skip = ops.create(Op::Label, 0);
        place(&mut ops, Op::Branch(BranchInstruction::Goto(skip)), 1);
        place(&mut ops, Op::Insn(Instruction::Nop), 2);
        ops.place(skip).unwrap();
        place(&mut ops, Op::Branch(BranchInstruction::Return), 3);

        let (_, assembled) = build(&mut ops, &mut pool, &[]);
        assert_eq!(assembled.code, vec![0xa7, 0x00, 0x03, 0xb1]);
        assert_eq!(
            assembled.line_numbers,
            vec![
                LineNumber {
                    start_pc: 0,
                    line: 1
                },
                LineNumber {
                    start_pc: 3,
                    line: 3
                }
            ]
        );
    }

    #[test]
    fn exception_sections_and_constants() {
        let mut ops = Ops::new();
        let mut pool = ConstantPool::new();
        let handler = ops.create(Op::Label, 0);
        let done = ops.create(Op::Label, 0);
        let try_op = place(&mut ops, Op::Try(vec![]), 0);
        place(
            &mut ops,
            Op::Insn(Instruction::GetStatic(Constant::field_ref(
                "java/lang/System",
                "out",
                "Ljava/io/PrintStream;",
            ))),
            0,
        );
        place(&mut ops, Op::Insn(Instruction::Pop), 0);
        place(
            &mut ops,
            Op::Catch(Catch::new(
                try_op,
                Some(String::from("java/lang/RuntimeException")),
                handler,
            )),
            0,
        );
        place(&mut ops, Op::Catch(Catch::new(try_op, None, handler)), 0);
        place(&mut ops, Op::Branch(BranchInstruction::Goto(done)), 0);
        ops.place(handler).unwrap();
        place(&mut ops, Op::Insn(Instruction::Pop), 0);
        ops.place(done).unwrap();
        place(&mut ops, Op::Branch(BranchInstruction::Return), 0);

        let (prepared, assembled) = build(&mut ops, &mut pool, &[]);
        assert_eq!(prepared.max_stack, 1);
        assert!(pool.find(&Constant::class("java/lang/RuntimeException")).is_some());
        assert!(pool.find(&Constant::class("java/lang/System")).is_some());
        assert_eq!(
            assembled.exception_table,
            vec![
                ExceptionHandler {
                    start_pc: 0,
                    end_pc: 4,
                    handler_pc: 7,
                    catch_type: Some(String::from("java/lang/RuntimeException")),
                },
                ExceptionHandler {
                    start_pc: 0,
                    end_pc: 4,
                    handler_pc: 7,
                    catch_type: None,
                },
            ]
        );
    }

    #[test]
    fn structural_errors() {
        let mut pool = ConstantPool::new();

        let mut ops = Ops::new();
        place(&mut ops, Op::Begin, 0);
        place(&mut ops, Op::Branch(BranchInstruction::Return), 0);
        assert!(matches!(
            preassemble(&mut ops, &[], &mut pool, &Settings::default()),
            Err(Error::UnmatchedBegin)
        ));

        let mut ops = Ops::new();
        place(&mut ops, Op::Branch(BranchInstruction::Return), 0);
        let end = place(&mut ops, Op::End, 0);
        assert!(matches!(
            preassemble(&mut ops, &[], &mut pool, &Settings::default()),
            Err(Error::UnmatchedEnd(id)) if id == end
        ));

        let mut ops = Ops::new();
        place(&mut ops, Op::Begin, 0);
        let var = place(&mut ops, Op::Declare(Declaration::new(VarType::Int)), 0);
        place(&mut ops, Op::End, 0);
        place(&mut ops, Op::Insn(Instruction::IConst0), 0);
        place(&mut ops, Op::Insn(Instruction::IStore(var)), 0);
        place(&mut ops, Op::Branch(BranchInstruction::Return), 0);
        assert!(matches!(
            preassemble(&mut ops, &[], &mut pool, &Settings::default()),
            Err(Error::VariableOutOfScope { .. })
        ));
    }

    #[test]
    fn named_variables_get_ranges() {
        let mut ops = Ops::new();
        let mut pool = ConstantPool::new();
        place(&mut ops, Op::Begin, 0);
        let x = place(&mut ops, Op::Declare(Declaration::named("x", "I").unwrap()), 0);
        place(&mut ops, Op::Insn(Instruction::IConst5), 0);
        place(&mut ops, Op::Insn(Instruction::IStore(x)), 0);
        place(&mut ops, Op::Insn(Instruction::ILoad(x)), 0);
        let skip = ops.create(Op::Label, 0);
        place(&mut ops, Op::Branch(BranchInstruction::If(OrdComparison::EQ, skip)), 0);
        place(&mut ops, Op::Insn(Instruction::Nop), 0);
        ops.place(skip).unwrap();
        place(&mut ops, Op::Branch(BranchInstruction::Return), 0);
        place(&mut ops, Op::End, 0);

        let (_, assembled) = build(&mut ops, &mut pool, &[]);
        assert_eq!(
            assembled.variables,
            vec![LocalVariable {
                start: 2,
                end: 8,
                name: String::from("x"),
                descriptor: String::from("I"),
                slot: 0,
            }]
        );
        assert!(pool.find(&Constant::utf8("x")).is_some());
    }
}
