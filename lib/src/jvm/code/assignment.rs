//! Definite assignment of local variables
//!
//! Only variables declared with debug information (a name) are tracked. The result is a list of
//! ranges over which each such variable is known to hold a value, which is exactly what the
//! `LocalVariableTable` attribute wants.

use super::verifier::StackCheck;
use super::{BranchInstruction, Op, OpId, Ops};
use crate::jvm::Error;
use std::collections::{BTreeMap, BTreeSet, HashMap};

type Assigned = BTreeSet<OpId>;

/// What the analysis needs to know about the sequence, besides the nodes themselves
pub(crate) struct Scopes {
    /// Declarations with debug information
    pub tracked: BTreeSet<OpId>,

    /// Tracked variables in scope at each label
    pub in_scope: HashMap<OpId, Assigned>,

    /// `End` closing the scope of each tracked variable
    pub scope_end: HashMap<OpId, OpId>,

    /// Words taken by the parameters (these slots are assigned on entry)
    pub parameter_words: u16,
}

/// Range over which a variable definitely holds a value
///
/// If `start` is a store, the range begins right after it. Otherwise it begins at `start`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct AssignedRange {
    pub var: OpId,
    pub start: OpId,
    pub end: OpId,
}

enum Task {
    Walk {
        from: OpId,
        assigned: Assigned,
        context: usize,
    },
    Resume {
        jsr: OpId,
        assigned: Assigned,
        context: usize,
        callee: usize,
    },
}

struct Analysis<'a> {
    ops: &'a Ops,
    check: &'a StackCheck,
    scopes: &'a Scopes,
    at_label: HashMap<OpId, Assigned>,
    at_ret: HashMap<usize, Assigned>,

    /// Assigned on return from a subroutine, keyed by the node following the `jsr`
    after_call: HashMap<OpId, Assigned>,
    tasks: Vec<Task>,
    max_pending: usize,
}

impl<'a> Analysis<'a> {
    fn push(&mut self, task: Task) -> Result<(), Error> {
        if self.tasks.len() >= self.max_pending {
            return Err(Error::ControlFlowTooComplex {
                pending: self.tasks.len(),
            });
        }
        self.tasks.push(task);
        Ok(())
    }

    fn is_parameter(&self, id: OpId) -> bool {
        match &self.ops[id].op {
            Op::Declare(decl) => decl.slot.map_or(false, |slot| slot < self.scopes.parameter_words),
            _ => false,
        }
    }

    fn walk(&mut self, from: OpId, mut assigned: Assigned, context: usize) -> Result<(), Error> {
        let ops = self.ops;
        let mut cursor = Some(from);
        while let Some(id) = cursor {
            match &ops[id].op {
                Op::Declare(_) => {
                    if self.scopes.tracked.contains(&id) && self.is_parameter(id) {
                        assigned.insert(id);
                    }
                }
                Op::Label => {
                    let in_scope = self.scopes.in_scope.get(&id);
                    let first_visit = !self.at_label.contains_key(&id);
                    let recorded = self.at_label.entry(id).or_insert_with(|| match in_scope {
                        Some(in_scope) => in_scope.clone(),
                        None => Assigned::new(),
                    });
                    let before = recorded.len();
                    recorded.retain(|var| assigned.contains(var));
                    if !first_visit && recorded.len() == before {
                        return Ok(());
                    }
                    assigned = recorded.clone();
                }
                Op::Try(catches) => {
                    for catch in catches {
                        if let Op::Catch(catch) = &ops[*catch].op {
                            self.push(Task::Walk {
                                from: catch.handler,
                                assigned: assigned.clone(),
                                context,
                            })?;
                        }
                    }
                }
                Op::Insn(insn) => {
                    if insn.is_store() {
                        if let Some(var) = insn.variable() {
                            if self.scopes.tracked.contains(var) {
                                assigned.insert(*var);
                            }
                        }
                    }
                }
                Op::Branch(branch) => return self.branch(id, branch, assigned, context),
                Op::Begin | Op::End | Op::Catch(_) => (),
            }
            cursor = ops.next(id);
        }
        Ok(())
    }

    fn branch(
        &mut self,
        id: OpId,
        branch: &BranchInstruction<OpId, OpId>,
        assigned: Assigned,
        context: usize,
    ) -> Result<(), Error> {
        use BranchInstruction::*;

        let ops = self.ops;
        match branch {
            If(_, target) | IfICmp(_, target) | IfACmp(_, target) | IfNull(_, target) => {
                self.push(Task::Walk {
                    from: *target,
                    assigned: assigned.clone(),
                    context,
                })?;
                if let Some(next) = ops.next(id) {
                    self.push(Task::Walk {
                        from: next,
                        assigned,
                        context,
                    })?;
                }
            }
            Goto(target) => self.push(Task::Walk {
                from: *target,
                assigned,
                context,
            })?,
            Switch(switch) => {
                for (_, target) in &switch.cases {
                    self.push(Task::Walk {
                        from: *target,
                        assigned: assigned.clone(),
                        context,
                    })?;
                }
                self.push(Task::Walk {
                    from: switch.default,
                    assigned,
                    context,
                })?;
            }
            Jsr(target) => {
                if let Some(callee) = self.check.context(*target) {
                    // Run after the subroutine itself has been explored
                    self.push(Task::Resume {
                        jsr: id,
                        assigned: assigned.clone(),
                        context,
                        callee,
                    })?;
                    self.push(Task::Walk {
                        from: *target,
                        assigned,
                        context: callee,
                    })?;
                }
            }
            Ret(_) => match self.at_ret.get_mut(&context) {
                Some(recorded) => recorded.retain(|var| assigned.contains(var)),
                None => {
                    self.at_ret.insert(context, assigned);
                }
            },
            IReturn | LReturn | FReturn | DReturn | AReturn | Return | AThrow => (),
        }
        Ok(())
    }

    fn resume(
        &mut self,
        jsr: OpId,
        mut assigned: Assigned,
        context: usize,
        callee: usize,
    ) -> Result<(), Error> {
        if let Some(returned) = self.at_ret.get(&callee) {
            assigned.extend(returned.iter().copied());
            if let Some(next) = self.ops.next(jsr) {
                match self.after_call.get_mut(&next) {
                    Some(recorded) => recorded.retain(|var| assigned.contains(var)),
                    None => {
                        self.after_call.insert(next, assigned.clone());
                    }
                }
                self.push(Task::Walk {
                    from: next,
                    assigned,
                    context,
                })?;
            }
        }
        Ok(())
    }
}

/// Find the ranges over which tracked variables are definitely assigned
///
/// The sequence must already have been through the stack verifier (which determines the code
/// contexts) and contain no unreachable sized nodes.
pub(crate) fn assigned_ranges(
    ops: &Ops,
    check: &StackCheck,
    scopes: &Scopes,
    max_pending: usize,
) -> Result<Vec<AssignedRange>, Error> {
    let entry = match ops.first() {
        Some(entry) => entry,
        None => return Ok(vec![]),
    };
    let mut analysis = Analysis {
        ops,
        check,
        scopes,
        at_label: HashMap::new(),
        at_ret: HashMap::new(),
        after_call: HashMap::new(),
        tasks: vec![Task::Walk {
            from: entry,
            assigned: Assigned::new(),
            context: 0,
        }],
        max_pending,
    };
    while let Some(task) = analysis.tasks.pop() {
        match task {
            Task::Walk {
                from,
                assigned,
                context,
            } => analysis.walk(from, assigned, context)?,
            Task::Resume {
                jsr,
                assigned,
                context,
                callee,
            } => analysis.resume(jsr, assigned, context, callee)?,
        }
    }

    // Linear pass: open a range when a variable becomes assigned, close it when a label (or the
    // return point of a `jsr`) says it no longer is, or its scope ends
    let mut open: BTreeMap<OpId, OpId> = BTreeMap::new();
    let mut live: Assigned = Assigned::new();
    let mut ranges = vec![];
    for id in ops.iter() {
        let assigned = match &ops[id].op {
            Op::Label => analysis.at_label.get(&id),
            _ => analysis.after_call.get(&id),
        };
        if let Some(assigned) = assigned {
            rejoin(&mut open, &mut ranges, &live, id, assigned);
        }
        match &ops[id].op {
            Op::Declare(_) => {
                if scopes.tracked.contains(&id) {
                    live.insert(id);
                    if analysis.is_parameter(id) {
                        open.entry(id).or_insert(id);
                    }
                }
            }
            Op::Insn(insn) if insn.is_store() => {
                if let Some(var) = insn.variable() {
                    if scopes.tracked.contains(var) {
                        open.entry(*var).or_insert(id);
                    }
                }
            }
            Op::End => {
                let closed: Vec<OpId> = open
                    .keys()
                    .filter(|var| scopes.scope_end.get(var) == Some(&id))
                    .copied()
                    .collect();
                for var in closed {
                    if let Some(start) = open.remove(&var) {
                        ranges.push(AssignedRange { var, start, end: id });
                    }
                }
                live.retain(|var| scopes.scope_end.get(var) != Some(&id));
            }
            _ => (),
        }
    }
    Ok(ranges)
}

/// Close the open ranges of variables missing from `assigned`, and open ranges for the ones in
/// scope that are present
fn rejoin(
    open: &mut BTreeMap<OpId, OpId>,
    ranges: &mut Vec<AssignedRange>,
    live: &Assigned,
    at: OpId,
    assigned: &Assigned,
) {
    let closed: Vec<OpId> = open
        .keys()
        .filter(|var| !assigned.contains(var))
        .copied()
        .collect();
    for var in closed {
        if let Some(start) = open.remove(&var) {
            ranges.push(AssignedRange { var, start, end: at });
        }
    }
    for var in assigned.iter().filter(|var| live.contains(var)) {
        open.entry(*var).or_insert(at);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::code::verifier::check_stack;
    use crate::jvm::code::{Catch, Declaration, Instruction, OrdComparison, VarType};

    fn place(ops: &mut Ops, op: Op) -> OpId {
        let id = ops.create(op, 0);
        ops.place(id).unwrap();
        id
    }

    fn named(name: &str) -> Op {
        Op::Declare(Declaration::named(name, "I").unwrap())
    }

    /// Builds the scope bookkeeping the way pre-assembly does, for a single flat scope
    fn flat_scopes(ops: &Ops, parameter_words: u16) -> Scopes {
        let tracked: BTreeSet<OpId> = ops
            .iter()
            .filter(|id| matches!(&ops[*id].op, Op::Declare(decl) if decl.has_debug_info()))
            .collect();
        let end = ops.last().unwrap();
        Scopes {
            in_scope: ops
                .iter()
                .filter(|id| ops[*id].op == Op::Label)
                .map(|id| (id, tracked.clone()))
                .collect(),
            scope_end: tracked.iter().map(|var| (*var, end)).collect(),
            tracked,
            parameter_words,
        }
    }

    #[test]
    fn assigned_on_one_branch_only() {
        // int x; if (p == 0) x = 1; <join> x = 2; return
        let mut ops = Ops::new();
        place(&mut ops, Op::Label);
        place(&mut ops, Op::Begin);
        let p = place(
            &mut ops,
            Op::Declare(Declaration::named("p", "I").unwrap().at_slot(0)),
        );
        let x = place(&mut ops, named("x"));
        let join = ops.create(Op::Label, 0);
        place(&mut ops, Op::Insn(Instruction::ILoad(p)));
        place(&mut ops, Op::Branch(BranchInstruction::If(OrdComparison::NE, join)));
        place(&mut ops, Op::Insn(Instruction::IConst1));
        let first_store = place(&mut ops, Op::Insn(Instruction::IStore(x)));
        ops.place(join).unwrap();
        place(&mut ops, Op::Insn(Instruction::IConst2));
        let second_store = place(&mut ops, Op::Insn(Instruction::IStore(x)));
        place(&mut ops, Op::Branch(BranchInstruction::Return));
        let end = place(&mut ops, Op::End);

        let check = check_stack(&mut ops, 64).unwrap();
        let scopes = flat_scopes(&ops, 1);
        let ranges = assigned_ranges(&ops, &check, &scopes, 64).unwrap();
        assert_eq!(
            ranges,
            vec![
                AssignedRange {
                    var: x,
                    start: first_store,
                    end: join
                },
                AssignedRange {
                    var: p,
                    start: p,
                    end
                },
                AssignedRange {
                    var: x,
                    start: second_store,
                    end
                },
            ]
        );
    }

    #[test]
    fn loop_back_edge_intersects() {
        // x = 0; loop: if (x != 0) goto out; y = 1; x = y; goto loop; out: return
        let mut ops = Ops::new();
        place(&mut ops, Op::Label);
        place(&mut ops, Op::Begin);
        let x = place(&mut ops, named("x"));
        let y = place(&mut ops, named("y"));
        let looping = ops.create(Op::Label, 0);
        let out = ops.create(Op::Label, 0);
        place(&mut ops, Op::Insn(Instruction::IConst0));
        place(&mut ops, Op::Insn(Instruction::IStore(x)));
        ops.place(looping).unwrap();
        place(&mut ops, Op::Insn(Instruction::ILoad(x)));
        place(&mut ops, Op::Branch(BranchInstruction::If(OrdComparison::NE, out)));
        place(&mut ops, Op::Insn(Instruction::IConst1));
        place(&mut ops, Op::Insn(Instruction::IStore(y)));
        place(&mut ops, Op::Insn(Instruction::ILoad(y)));
        place(&mut ops, Op::Insn(Instruction::IStore(x)));
        place(&mut ops, Op::Branch(BranchInstruction::Goto(looping)));
        ops.place(out).unwrap();
        place(&mut ops, Op::Branch(BranchInstruction::Return));
        place(&mut ops, Op::End);

        let check = check_stack(&mut ops, 64).unwrap();
        let scopes = flat_scopes(&ops, 0);
        let ranges = assigned_ranges(&ops, &check, &scopes, 64).unwrap();

        // `y` is not assigned on entry to the loop, so it is closed at both labels
        let y_ranges: Vec<&AssignedRange> = ranges.iter().filter(|r| r.var == y).collect();
        assert_eq!(y_ranges.len(), 1);
        assert_eq!(y_ranges[0].end, out);

        // `x` stays assigned throughout
        let x_ranges: Vec<&AssignedRange> = ranges.iter().filter(|r| r.var == x).collect();
        assert_eq!(x_ranges.len(), 1);
    }

    #[test]
    fn subroutine_assignments_reach_the_caller() {
        // jsr sub; return x; sub: astore r; x = 1; ret r
        let mut ops = Ops::new();
        place(&mut ops, Op::Label);
        place(&mut ops, Op::Begin);
        let x = place(&mut ops, named("x"));
        let r = place(
            &mut ops,
            Op::Declare(Declaration::new(VarType::ReturnAddress)),
        );
        let sub = ops.create(Op::Label, 0);
        place(&mut ops, Op::Branch(BranchInstruction::Jsr(sub)));
        let use_x = place(&mut ops, Op::Insn(Instruction::ILoad(x)));
        place(&mut ops, Op::Branch(BranchInstruction::IReturn));
        ops.place(sub).unwrap();
        place(&mut ops, Op::Insn(Instruction::AStore(r)));
        place(&mut ops, Op::Insn(Instruction::IConst1));
        let store = place(&mut ops, Op::Insn(Instruction::IStore(x)));
        place(&mut ops, Op::Branch(BranchInstruction::Ret(r)));
        let end = place(&mut ops, Op::End);

        let check = check_stack(&mut ops, 64).unwrap();
        let scopes = flat_scopes(&ops, 0);
        let ranges = assigned_ranges(&ops, &check, &scopes, 64).unwrap();
        assert_eq!(
            ranges,
            vec![
                AssignedRange {
                    var: x,
                    start: use_x,
                    end: sub
                },
                AssignedRange {
                    var: x,
                    start: store,
                    end
                },
            ]
        );
    }

    #[test]
    fn handlers_start_from_the_try() {
        // x = 0; try { y = 1; } catch (...) { } return
        let mut ops = Ops::new();
        place(&mut ops, Op::Label);
        place(&mut ops, Op::Begin);
        let x = place(&mut ops, named("x"));
        let y = place(&mut ops, named("y"));
        let handler = ops.create(Op::Label, 0);
        let done = ops.create(Op::Label, 0);
        place(&mut ops, Op::Insn(Instruction::IConst0));
        let x_store = place(&mut ops, Op::Insn(Instruction::IStore(x)));
        let try_op = place(&mut ops, Op::Try(vec![]));
        place(&mut ops, Op::Insn(Instruction::IConst1));
        let y_store = place(&mut ops, Op::Insn(Instruction::IStore(y)));
        place(&mut ops, Op::Catch(Catch::new(try_op, None, handler)));
        place(&mut ops, Op::Branch(BranchInstruction::Goto(done)));
        ops.place(handler).unwrap();
        place(&mut ops, Op::Insn(Instruction::Pop));
        ops.place(done).unwrap();
        place(&mut ops, Op::Branch(BranchInstruction::Return));
        let end = place(&mut ops, Op::End);

        let check = check_stack(&mut ops, 64).unwrap();
        let scopes = flat_scopes(&ops, 0);
        let ranges = assigned_ranges(&ops, &check, &scopes, 64).unwrap();

        // `y` may be unassigned when the handler runs, `x` never is
        assert_eq!(
            ranges,
            vec![
                AssignedRange {
                    var: y,
                    start: y_store,
                    end: handler
                },
                AssignedRange {
                    var: x,
                    start: x_store,
                    end
                },
            ]
        );
    }

    #[test]
    fn nested_scopes_close_their_own_variables() {
        // { x; { y; y = 1; x = 2; } after: x; }
        let mut ops = Ops::new();
        let entry = place(&mut ops, Op::Label);
        place(&mut ops, Op::Begin);
        let x = place(&mut ops, named("x"));
        place(&mut ops, Op::Begin);
        let y = place(&mut ops, named("y"));
        place(&mut ops, Op::Insn(Instruction::IConst1));
        let y_store = place(&mut ops, Op::Insn(Instruction::IStore(y)));
        place(&mut ops, Op::Insn(Instruction::IConst2));
        let x_store = place(&mut ops, Op::Insn(Instruction::IStore(x)));
        let inner_end = place(&mut ops, Op::End);
        let after = place(&mut ops, Op::Label);
        place(&mut ops, Op::Insn(Instruction::ILoad(x)));
        place(&mut ops, Op::Insn(Instruction::Pop));
        place(&mut ops, Op::Branch(BranchInstruction::Return));
        let outer_end = place(&mut ops, Op::End);

        let check = check_stack(&mut ops, 64).unwrap();
        let scopes = Scopes {
            tracked: [x, y].into_iter().collect(),
            in_scope: [
                (entry, Assigned::new()),
                (after, [x].into_iter().collect()),
            ]
            .into_iter()
            .collect(),
            scope_end: [(x, outer_end), (y, inner_end)].into_iter().collect(),
            parameter_words: 0,
        };
        let ranges = assigned_ranges(&ops, &check, &scopes, 64).unwrap();
        assert_eq!(
            ranges,
            vec![
                AssignedRange {
                    var: y,
                    start: y_store,
                    end: inner_end
                },
                AssignedRange {
                    var: x,
                    start: x_store,
                    end: outer_end
                },
            ]
        );
    }
}
