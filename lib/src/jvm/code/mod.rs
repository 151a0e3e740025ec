//! Bytecode representation, analysis, and encoding
//!
//! ### Structure
//!
//! The body of a method is held as a sequence of nodes in an arena ([`Ops`]). Most nodes are
//! instructions, split into two groups:
//!
//!   - [`Instruction`] for straight-line instructions
//!   - [`BranchInstruction`] for instructions that may branch (or end execution)
//!
//! The rest are pseudo nodes that take no space in the encoded code: labels, the start and end
//! of variable scopes, variable declarations, and the start and end of guarded sections.
//! Instructions refer to variables by the node that declares them and to jump targets by
//! label node, so slots and offsets only get decided on assembly.
//!
//! ### Code generation
//!
//! [`CodeAttribute`] is where nodes get added (or disassembled from bytes) and where assembly
//! is driven from. Before encoding, the stack heights of the whole body are checked, dead code
//! is dropped, variables are given slots, and named variables get their debug ranges from a
//! definite assignment analysis.
//!
//! [0]: https://docs.oracle.com/javase/specs/jvms/se18/html/jvms-6.html#jvms-6.5

mod assemble;
mod assignment;
mod code_attribute;
mod disassemble;
mod instructions;
mod ops;
mod tables;
mod verifier;

pub use code_attribute::*;
pub use instructions::*;
pub use ops::*;
pub use tables::*;
