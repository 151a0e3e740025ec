use super::class_file::{Constant, Version};
use super::code::{CodeState, OpId};
use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// Reading or writing failed (this includes streams that end too early)
    IoError(std::io::Error),

    BadMagic(u32),
    UnsupportedVersion(Version),
    InvalidConstantTag {
        tag: u8,
        index: u16,
    },

    /// Index is zero, out of range, or points into the second half of a wide constant
    InvalidConstantIndex(u16),

    /// Constant pool entry exists, but is not of a kind that can be used in this position
    UnexpectedConstant {
        index: u16,
        expected: &'static str,
    },
    InvalidHandleKind(u8),
    InvalidOpcode {
        opcode: u8,
        offset: u32,
    },
    InvalidWideOpcode {
        opcode: u8,
        offset: u32,
    },
    InvalidArrayType(u8),

    /// `tableswitch` with `high < low` or `lookupswitch` with a negative pair count
    MalformedSwitch {
        offset: u32,
    },
    InvalidBranchTarget {
        offset: u32,
        target: i64,
    },

    /// Labels, guarded sections or debug table entries refer to an offset that is not the start
    /// of an instruction
    MisalignedOp {
        offset: u32,
    },
    InvalidCodeLength(u32),
    BadDescriptor(String),
    MalformedModifiedUtf8,
    MalformedAttribute {
        name: String,
    },

    ConstantPoolOverflow {
        constant: Constant,
        offset: usize,
    },
    MissingConstant(Constant),

    /// Order-significant pools cannot be reordered
    PoolOrderSignificant,

    StackUnderflow {
        op: String,
        offset: u32,
    },
    StackHeightMismatch {
        op: String,
        offset: u32,
        expected: u16,
        actual: u16,
    },
    LabelInTwoContexts(OpId),
    RetOutsideSubroutine(OpId),

    /// Execution can fall off the end of the code
    CodeNotTerminated,
    UnmatchedBegin,
    UnmatchedEnd(OpId),
    VariableOutOfScope {
        op: String,
    },
    UnknownVariable(OpId),
    NotALabel(OpId),
    NotATry(OpId),
    BranchOutOfRange {
        offset: u32,
        target: u32,
    },
    MethodCodeOverflow(usize),
    MaxStackOverflow(usize),
    MaxLocalsOverflow(usize),
    OpAlreadyPlaced(OpId),
    CaseWithoutSwitch,
    DuplicateCase(i32),

    IllegalState {
        operation: &'static str,
        state: CodeState,
    },

    /// Walking the control flow graph needed more pending paths than allowed
    ControlFlowTooComplex {
        pending: usize,
    },
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::IoError(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::BadMagic(magic) => write!(f, "bad magic number {:#010x}", magic),
            Error::UnsupportedVersion(version) => {
                write!(f, "unsupported class file version {}", version)
            }
            Error::InvalidConstantTag { tag, index } => {
                write!(f, "invalid constant tag {} at index {}", tag, index)
            }
            Error::InvalidConstantIndex(index) => write!(f, "invalid constant index {}", index),
            Error::UnexpectedConstant { index, expected } => {
                write!(f, "constant {} is not a {}", index, expected)
            }
            Error::InvalidHandleKind(kind) => write!(f, "invalid method handle kind {}", kind),
            Error::InvalidOpcode { opcode, offset } => {
                write!(f, "invalid opcode {:#04x} at offset {}", opcode, offset)
            }
            Error::InvalidWideOpcode { opcode, offset } => {
                write!(f, "opcode {:#04x} cannot be widened (offset {})", opcode, offset)
            }
            Error::InvalidArrayType(atype) => write!(f, "invalid primitive array type {}", atype),
            Error::MalformedSwitch { offset } => write!(f, "malformed switch at offset {}", offset),
            Error::InvalidBranchTarget { offset, target } => {
                write!(f, "branch at offset {} targets {}", offset, target)
            }
            Error::MisalignedOp { offset } => {
                write!(f, "offset {} is not at an instruction boundary", offset)
            }
            Error::InvalidCodeLength(len) => write!(f, "invalid code length {}", len),
            Error::BadDescriptor(desc) => write!(f, "bad descriptor '{}'", desc),
            Error::MalformedModifiedUtf8 => write!(f, "malformed modified UTF-8"),
            Error::MalformedAttribute { name } => write!(f, "malformed {} attribute", name),
            Error::ConstantPoolOverflow { constant, offset } => {
                write!(f, "constant pool overflow adding {:?} at {}", constant, offset)
            }
            Error::MissingConstant(constant) => {
                write!(f, "constant {:?} is not in the pool", constant)
            }
            Error::PoolOrderSignificant => {
                write!(f, "constant pool order is significant and cannot be sorted")
            }
            Error::StackUnderflow { op, offset } => {
                write!(f, "stack underflow at '{}' (offset {})", op, offset)
            }
            Error::StackHeightMismatch {
                op,
                offset,
                expected,
                actual,
            } => write!(
                f,
                "stack height mismatch at '{}' (offset {}): expected {}, found {}",
                op, offset, expected, actual
            ),
            Error::LabelInTwoContexts(label) => {
                write!(f, "label {} is reachable from two code contexts", label)
            }
            Error::RetOutsideSubroutine(ret) => {
                write!(f, "{} returns from outside of any subroutine", ret)
            }
            Error::CodeNotTerminated => write!(f, "code not terminated properly"),
            Error::UnmatchedBegin => write!(f, "scope begin without matching end"),
            Error::UnmatchedEnd(end) => write!(f, "scope end {} without matching begin", end),
            Error::VariableOutOfScope { op } => write!(f, "variable out of scope at '{}'", op),
            Error::UnknownVariable(var) => write!(f, "{} is not a variable declaration", var),
            Error::NotALabel(op) => write!(f, "{} is not a label", op),
            Error::NotATry(op) => write!(f, "{} is not a try", op),
            Error::BranchOutOfRange { offset, target } => {
                write!(f, "branch from {} to {} is out of range", offset, target)
            }
            Error::MethodCodeOverflow(len) => write!(f, "method code is too long ({} bytes)", len),
            Error::MaxStackOverflow(max) => write!(f, "max stack is too large ({})", max),
            Error::MaxLocalsOverflow(max) => write!(f, "max locals is too large ({})", max),
            Error::OpAlreadyPlaced(op) => write!(f, "{} is already placed", op),
            Error::CaseWithoutSwitch => write!(f, "case does not follow a switch"),
            Error::DuplicateCase(key) => write!(f, "duplicate switch case {}", key),
            Error::IllegalState { operation, state } => {
                write!(f, "cannot {} code in state {:?}", operation, state)
            }
            Error::ControlFlowTooComplex { pending } => {
                write!(f, "control flow too complex ({} pending paths)", pending)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(err) => Some(err),
            _ => None,
        }
    }
}
