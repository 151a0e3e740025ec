//! Stack height verification
//!
//! Walks every control path from the entry label, the way the JVM would, recording the stack
//! height on entry to each node. Nodes left without a height are unreachable. Subroutines
//! (`jsr`/`ret`) each get their own code context, which later determines the base slot of the
//! variables declared inside them.
//!
//! The walk uses an explicit work-list instead of recursion, so that deeply nested control flow
//! turns into [`Error::ControlFlowTooComplex`] instead of a stack overflow.

use super::{BranchInstruction, Op, OpId, Ops};
use crate::jvm::Error;
use std::convert::TryFrom;

/// Main body or subroutine
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CodeContext {
    /// Label at which the context is entered
    pub entry: OpId,

    /// Subroutine nesting depth (0 for the main body)
    pub depth: u32,

    /// `jsr` instructions calling into this context
    pub callers: Vec<OpId>,

    /// Stack height at the entry label (including the return address)
    pub entry_height: u16,

    /// Stack height at the `ret`, if one was reached
    pub ret_height: Option<u16>,
}

/// Result of a successful verification
#[derive(Debug)]
pub(crate) struct StackCheck {
    pub max_stack: u16,

    /// Contexts, the main body first
    pub contexts: Vec<CodeContext>,

    /// Context of every reached node (indexed by node id)
    pub context_of: Vec<Option<usize>>,
}

impl StackCheck {
    pub fn context(&self, id: OpId) -> Option<usize> {
        self.context_of.get(id.0).copied().flatten()
    }
}

enum Task {
    /// Walk straight-line code starting at `from`
    Walk {
        from: OpId,
        height: i32,
        context: usize,
    },

    /// Continue after a `jsr` whose subroutine has now been fully explored
    Resume {
        jsr: OpId,
        height: i32,
        context: usize,
        callee: usize,
    },
}

enum Step {
    Pass,
    Handlers(Vec<OpId>),
    Effect(i32),
    Branch(BranchInstruction<OpId, OpId>),
}

struct Verifier<'a> {
    ops: &'a mut Ops,
    contexts: Vec<CodeContext>,
    context_of: Vec<Option<usize>>,
    max_stack: i32,
    tasks: Vec<Task>,
    max_pending: usize,
}

impl<'a> Verifier<'a> {
    fn push(&mut self, task: Task) -> Result<(), Error> {
        if self.tasks.len() >= self.max_pending {
            return Err(Error::ControlFlowTooComplex {
                pending: self.tasks.len(),
            });
        }
        self.tasks.push(task);
        Ok(())
    }

    fn raise_max(&mut self, height: i32) -> Result<(), Error> {
        if height > u16::MAX as i32 {
            return Err(Error::MaxStackOverflow(height as usize));
        }
        self.max_stack = self.max_stack.max(height);
        Ok(())
    }

    fn underflow(&self, id: OpId) -> Error {
        Error::StackUnderflow {
            op: self.ops.render(id),
            offset: self.ops[id].offset,
        }
    }

    fn mismatch(&self, id: OpId, expected: u16, actual: i32) -> Error {
        Error::StackHeightMismatch {
            op: self.ops.render(id),
            offset: self.ops[id].offset,
            expected,
            actual: actual as u16,
        }
    }

    /// Walk from a node until the path ends (or moves onto the work-list)
    fn walk(&mut self, from: OpId, mut height: i32, context: usize) -> Result<(), Error> {
        let mut cursor = Some(from);
        while let Some(id) = cursor {
            // Revisits end the path, after checking they agree with the first visit
            if let Some(previous) = self.ops[id].height {
                if previous as i32 != height {
                    return Err(self.mismatch(id, previous, height));
                }
                if self.context_of[id.0] != Some(context) {
                    return Err(Error::LabelInTwoContexts(id));
                }
                return Ok(());
            }
            self.ops[id].height = Some(height as u16);
            self.context_of[id.0] = Some(context);

            let step = match &self.ops[id].op {
                Op::Label | Op::Begin | Op::End | Op::Declare(_) | Op::Catch(_) => Step::Pass,
                Op::Try(catches) => Step::Handlers(catches.clone()),
                Op::Insn(insn) => Step::Effect(insn.stack_effect()?),
                Op::Branch(branch) => Step::Branch(branch.clone()),
            };
            match step {
                Step::Pass => (),

                // Handlers start with just the exception on the stack
                Step::Handlers(catches) => {
                    self.raise_max(1)?;
                    for catch in catches {
                        let handler = match &self.ops[catch].op {
                            Op::Catch(catch) => self.ops.expect_label(catch.handler)?,
                            _ => return Err(Error::NotATry(catch)),
                        };
                        self.push(Task::Walk {
                            from: handler,
                            height: 1,
                            context,
                        })?;
                    }
                }
                Step::Effect(effect) => {
                    height += effect;
                    if height < 0 {
                        return Err(self.underflow(id));
                    }
                    self.raise_max(height)?;
                }
                Step::Branch(branch) => return self.branch(id, &branch, height, context),
            }

            cursor = self.ops.next(id);
        }
        Err(Error::CodeNotTerminated)
    }

    /// Handle a branch instruction (always the end of a straight-line walk)
    fn branch(
        &mut self,
        id: OpId,
        branch: &BranchInstruction<OpId, OpId>,
        height: i32,
        context: usize,
    ) -> Result<(), Error> {
        use BranchInstruction::*;

        let after = height + branch.stack_effect();
        if after < 0 {
            return Err(self.underflow(id));
        }
        let fallthrough = |verifier: &mut Self, height: i32| -> Result<(), Error> {
            match verifier.ops.next(id) {
                Some(next) => verifier.push(Task::Walk {
                    from: next,
                    height,
                    context,
                }),
                None => Err(Error::CodeNotTerminated),
            }
        };

        match branch {
            If(_, target) | IfICmp(_, target) | IfACmp(_, target) | IfNull(_, target) => {
                fallthrough(self, after)?;
                let target = self.ops.expect_label(*target)?;
                self.push(Task::Walk {
                    from: target,
                    height: after,
                    context,
                })?;
            }
            Goto(target) => {
                let target = self.ops.expect_label(*target)?;
                self.push(Task::Walk {
                    from: target,
                    height: after,
                    context,
                })?;
            }
            Switch(switch) => {
                let targets = std::iter::once(&switch.default).chain(switch.cases.iter().map(|c| &c.1));
                for target in targets {
                    let target = self.ops.expect_label(*target)?;
                    self.push(Task::Walk {
                        from: target,
                        height: after,
                        context,
                    })?;
                }
            }
            Jsr(target) => {
                let target = self.ops.expect_label(*target)?;
                self.raise_max(after)?;
                let known = self
                    .contexts
                    .iter()
                    .position(|ctx| ctx.entry == target && ctx.depth > 0);
                let callee = match known {
                    Some(callee) => {
                        self.contexts[callee].callers.push(id);
                        callee
                    }
                    None => {
                        if self.ops[target].height.is_some() {
                            return Err(Error::LabelInTwoContexts(target));
                        }
                        let callee = self.contexts.len();
                        self.contexts.push(CodeContext {
                            entry: target,
                            depth: self.contexts[context].depth + 1,
                            callers: vec![id],
                            entry_height: after as u16,
                            ret_height: None,
                        });
                        self.push(Task::Resume {
                            jsr: id,
                            height,
                            context,
                            callee,
                        })?;
                        self.push(Task::Walk {
                            from: target,
                            height: after,
                            context: callee,
                        })?;
                        return Ok(());
                    }
                };
                self.resume(id, height, context, callee)?;
            }
            Ret(_) => {
                if self.contexts[context].depth == 0 {
                    return Err(Error::RetOutsideSubroutine(id));
                }
                match self.contexts[context].ret_height {
                    Some(previous) if previous as i32 != height => {
                        return Err(self.mismatch(id, previous, height));
                    }
                    _ => self.contexts[context].ret_height = Some(height as u16),
                }
            }
            IReturn | LReturn | FReturn | DReturn | AReturn | Return | AThrow => (),
        }
        Ok(())
    }

    /// Continue after a call, if the subroutine returns at all
    fn resume(&mut self, jsr: OpId, height: i32, context: usize, callee: usize) -> Result<(), Error> {
        let CodeContext {
            entry_height,
            ret_height,
            ..
        } = self.contexts[callee];
        if let Some(ret_height) = ret_height {
            let after = height + 1 + ret_height as i32 - entry_height as i32;
            if after < 0 {
                return Err(self.underflow(jsr));
            }
            match self.ops.next(jsr) {
                Some(next) => self.push(Task::Walk {
                    from: next,
                    height: after,
                    context,
                })?,
                None => return Err(Error::CodeNotTerminated),
            }
        }
        Ok(())
    }
}

/// Compute the stack height on entry to every reachable node
///
/// The sequence must start with a label. Heights from any previous run are discarded.
pub(crate) fn check_stack(ops: &mut Ops, max_pending: usize) -> Result<StackCheck, Error> {
    let entry = match ops.first() {
        Some(first) => ops.expect_label(first)?,
        None => return Err(Error::CodeNotTerminated),
    };
    let ids: Vec<OpId> = (0..ops.capacity()).map(OpId).collect();
    for id in ids {
        ops[id].height = None;
    }

    let capacity = ops.capacity();
    let mut verifier = Verifier {
        ops,
        contexts: vec![CodeContext {
            entry,
            depth: 0,
            callers: vec![],
            entry_height: 0,
            ret_height: None,
        }],
        context_of: vec![None; capacity],
        max_stack: 0,
        tasks: vec![Task::Walk {
            from: entry,
            height: 0,
            context: 0,
        }],
        max_pending,
    };

    while let Some(task) = verifier.tasks.pop() {
        match task {
            Task::Walk {
                from,
                height,
                context,
            } => verifier.walk(from, height, context)?,
            Task::Resume {
                jsr,
                height,
                context,
                callee,
            } => verifier.resume(jsr, height, context, callee)?,
        }
    }

    Ok(StackCheck {
        max_stack: u16::try_from(verifier.max_stack)
            .map_err(|_| Error::MaxStackOverflow(verifier.max_stack as usize))?,
        contexts: verifier.contexts,
        context_of: verifier.context_of,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::code::{Declaration, Instruction, OrdComparison, VarType};

    fn place(ops: &mut Ops, op: Op) -> OpId {
        let id = ops.create(op, 0);
        ops.place(id).unwrap();
        id
    }

    fn insn(ops: &mut Ops, insn: Instruction<OpId>) -> OpId {
        place(ops, Op::Insn(insn))
    }

    fn branch(ops: &mut Ops, branch: BranchInstruction<OpId, OpId>) -> OpId {
        place(ops, Op::Branch(branch))
    }

    #[test]
    fn sequential_code() {
        let mut ops = Ops::new();
        place(&mut ops, Op::Label);
        insn(&mut ops, Instruction::IConst1);
        insn(&mut ops, Instruction::IConst2);
        let add = insn(&mut ops, Instruction::IAdd);
        branch(&mut ops, BranchInstruction::IReturn);

        let check = check_stack(&mut ops, 64).unwrap();
        assert_eq!(check.max_stack, 2);
        assert_eq!(check.contexts.len(), 1);
        assert_eq!(ops[add].stack_height(), Some(2));
    }

    #[test]
    fn branch_join_heights() {
        let mut ops = Ops::new();
        place(&mut ops, Op::Label);
        let skip = ops.create(Op::Label, 0);
        insn(&mut ops, Instruction::IConst0);
        insn(&mut ops, Instruction::IConst1);
        branch(&mut ops, BranchInstruction::If(OrdComparison::EQ, skip));
        insn(&mut ops, Instruction::Pop);
        insn(&mut ops, Instruction::IConst1);
        ops.place(skip).unwrap();
        branch(&mut ops, BranchInstruction::IReturn);

        check_stack(&mut ops, 64).unwrap();
        assert_eq!(ops[skip].stack_height(), Some(1));
    }

    #[test]
    fn branch_join_mismatch() {
        let mut ops = Ops::new();
        place(&mut ops, Op::Label);
        let skip = ops.create(Op::Label, 0);
        insn(&mut ops, Instruction::IConst0);
        insn(&mut ops, Instruction::IConst1);
        branch(&mut ops, BranchInstruction::If(OrdComparison::EQ, skip));
        insn(&mut ops, Instruction::IConst1);
        ops.place(skip).unwrap();
        branch(&mut ops, BranchInstruction::IReturn);

        assert!(matches!(
            check_stack(&mut ops, 64),
            Err(Error::StackHeightMismatch { .. })
        ));
    }

    #[test]
    fn unreachable_and_unterminated() {
        let mut ops = Ops::new();
        place(&mut ops, Op::Label);
        branch(&mut ops, BranchInstruction::Return);
        let dead = insn(&mut ops, Instruction::Nop);
        check_stack(&mut ops, 64).unwrap();
        assert_eq!(ops[dead].stack_height(), None);

        let mut ops = Ops::new();
        place(&mut ops, Op::Label);
        insn(&mut ops, Instruction::Nop);
        assert!(matches!(
            check_stack(&mut ops, 64),
            Err(Error::CodeNotTerminated)
        ));

        let mut ops = Ops::new();
        place(&mut ops, Op::Label);
        insn(&mut ops, Instruction::Pop);
        branch(&mut ops, BranchInstruction::Return);
        assert!(matches!(
            check_stack(&mut ops, 64),
            Err(Error::StackUnderflow { .. })
        ));
    }

    #[test]
    fn subroutine_called_at_two_heights() {
        let mut ops = Ops::new();
        let ret_addr = ops.create(Op::Declare(Declaration::new(VarType::ReturnAddress)), 0);
        let sub = ops.create(Op::Label, 0);

        place(&mut ops, Op::Label);
        ops.place(ret_addr).unwrap();
        branch(&mut ops, BranchInstruction::Jsr(sub));
        insn(&mut ops, Instruction::IConst1);
        let second = branch(&mut ops, BranchInstruction::Jsr(sub));
        let after = insn(&mut ops, Instruction::Pop);
        branch(&mut ops, BranchInstruction::Return);

        ops.place(sub).unwrap();
        insn(&mut ops, Instruction::AStore(ret_addr));
        let ret = branch(&mut ops, BranchInstruction::Ret(ret_addr));

        let check = check_stack(&mut ops, 64).unwrap();
        assert_eq!(check.contexts.len(), 2);
        let callee = &check.contexts[1];
        assert_eq!(callee.entry, sub);
        assert_eq!(callee.entry_height, 1);
        assert_eq!(callee.ret_height, Some(0));
        assert_eq!(callee.callers.len(), 2);
        assert_eq!(check.context(ret), Some(1));
        assert_eq!(check.context(second), Some(0));

        // The second call happens at height 1, and gets back to height 1
        assert_eq!(ops[after].stack_height(), Some(1));
        assert_eq!(check.max_stack, 2);
    }

    #[test]
    fn subroutine_misuse() {
        let mut ops = Ops::new();
        let var = ops.create(Op::Declare(Declaration::new(VarType::ReturnAddress)), 0);
        place(&mut ops, Op::Label);
        ops.place(var).unwrap();
        let ret = branch(&mut ops, BranchInstruction::Ret(var));
        assert!(matches!(
            check_stack(&mut ops, 64),
            Err(Error::RetOutsideSubroutine(id)) if id == ret
        ));

        // Jumping into a label that is also a subroutine entry
        let mut ops = Ops::new();
        let var = ops.create(Op::Declare(Declaration::new(VarType::ReturnAddress)), 0);
        let sub = ops.create(Op::Label, 0);
        place(&mut ops, Op::Label);
        ops.place(var).unwrap();
        insn(&mut ops, Instruction::AConstNull);
        branch(&mut ops, BranchInstruction::Goto(sub));
        ops.place(sub).unwrap();
        insn(&mut ops, Instruction::AStore(var));
        branch(&mut ops, BranchInstruction::Jsr(sub));
        assert!(matches!(
            check_stack(&mut ops, 64),
            Err(Error::LabelInTwoContexts(id)) if id == sub
        ));
    }

    #[test]
    fn work_list_limit() {
        let mut ops = Ops::new();
        place(&mut ops, Op::Label);
        let targets: Vec<OpId> = (0..8).map(|_| ops.create(Op::Label, 0)).collect();
        insn(&mut ops, Instruction::IConst0);
        let mut switch = super::super::Switch::new(targets[0]);
        for (key, target) in targets.iter().enumerate().skip(1) {
            switch.cases.push((key as i32, *target));
        }
        branch(&mut ops, BranchInstruction::Switch(switch));
        for target in targets {
            ops.place(target).unwrap();
        }
        branch(&mut ops, BranchInstruction::Return);

        assert!(matches!(
            check_stack(&mut ops, 4),
            Err(Error::ControlFlowTooComplex { .. })
        ));
        assert!(check_stack(&mut ops, 64).is_ok());
    }
}
