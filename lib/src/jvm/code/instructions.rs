//! Instructions as they appear inside the node sequence of a method body
//!
//! The representation is slightly more abstract than the raw bytecode:
//!
//!   - The "wide" instruction doesn't show up at all, but instead gets merged into the
//!     instructions it is allowed to modify. Similarly, the short forms of loads and stores
//!     (`iload_0` and friends) and `ldc` vs. `ldc_w` are not distinguished: the assembler always
//!     picks the smallest encoding.
//!
//!   - `goto_w` and `jsr_w` are folded into `goto` and `jsr`.
//!
//!   - Some instructions (like the branches) get abstracted into one instruction with a field.
//!
//!   - Constant operands are structural [`Constant`]s, not pool indices.
//!
//! Instructions are generic over how they refer to local variables (`Var`) and jump targets
//! (`Lbl`). Inside a node sequence both are [`super::OpId`]s; right before encoding they become
//! slot numbers and absolute code offsets.

use crate::jvm::class_file::{Constant, ConstantPool};
use crate::jvm::descriptors::{BaseType, FieldType, MethodDescriptor, ParseDescriptor};
use crate::jvm::{Error, Serialize};
use crate::util::Width;
use byteorder::WriteBytesExt;
use std::convert::TryFrom;
use std::fmt;
use std::ops::Not;

/// Non-branching JVM bytecode instruction
#[derive(Clone, Debug, PartialEq)]
pub enum Instruction<Var> {
    Nop,
    AConstNull,
    IConstM1,
    IConst0,
    IConst1,
    IConst2,
    IConst3,
    IConst4,
    IConst5,
    LConst0,
    LConst1,
    FConst0,
    FConst1,
    FConst2,
    DConst0,
    DConst1,
    BiPush(i8),
    SiPush(i16),
    Ldc(Constant), // covers both `ldc` and `ldc_w`
    Ldc2(Constant),
    ILoad(Var), // covers `iload`, `iload{0,3}`, and `wide iload`
    LLoad(Var),
    FLoad(Var),
    DLoad(Var),
    ALoad(Var),
    IALoad,
    LALoad,
    FALoad,
    DALoad,
    AALoad,
    BALoad,
    CALoad,
    SALoad,
    IStore(Var), // covers `istore`, `istore{0,3}`, and `wide istore`
    LStore(Var),
    FStore(Var),
    DStore(Var),
    AStore(Var), // also stores return addresses pushed by `jsr`
    IAStore,
    LAStore,
    FAStore,
    DAStore,
    AAStore,
    BAStore,
    CAStore,
    SAStore,
    Pop,
    Pop2,
    Dup,
    DupX1,
    DupX2,
    Dup2,
    Dup2X1,
    Dup2X2,
    Swap,
    IAdd,
    LAdd,
    FAdd,
    DAdd,
    ISub,
    LSub,
    FSub,
    DSub,
    IMul,
    LMul,
    FMul,
    DMul,
    IDiv,
    LDiv,
    FDiv,
    DDiv,
    IRem,
    LRem,
    FRem,
    DRem,
    INeg,
    LNeg,
    FNeg,
    DNeg,
    ISh(ShiftType), // covers `ishr`, `ishl`, and `iushr`
    LSh(ShiftType), // covers `lshr`, `lshl`, and `lushr`
    IAnd,
    LAnd,
    IOr,
    LOr,
    IXor,
    LXor,
    IInc(Var, i16), // covers `iinc` and `wide iinc`
    I2L,
    I2F,
    I2D,
    L2I,
    L2F,
    L2D,
    F2I,
    F2L,
    F2D,
    D2I,
    D2L,
    D2F,
    I2B,
    I2C,
    I2S,
    LCmp,
    FCmp(CompareMode), // covers `fcmpl` and `fcmpg`
    DCmp(CompareMode), // covers `dcmpl` and `dcmpg`
    GetStatic(Constant),
    PutStatic(Constant),
    GetField(Constant),
    PutField(Constant),
    Invoke(InvokeType, Constant),
    InvokeDynamic(Constant),
    New(Constant),
    NewArray(BaseType),
    ANewArray(Constant),
    ArrayLength,
    CheckCast(Constant),
    InstanceOf(Constant),
    MonitorEnter,
    MonitorExit,
    MultiANewArray(Constant, u8),
}

/// Branching JVM bytecode instruction
///
/// These are the instructions after which execution does not (just) fall through to the next
/// instruction.
#[derive(Clone, Debug, PartialEq)]
pub enum BranchInstruction<Lbl, Var> {
    If(OrdComparison, Lbl), // covers `ifeq`, `ifne`, `iflt`, `ifge`, `ifgt`, `ifle`
    IfICmp(OrdComparison, Lbl), // covers `if_icmpeq`, `if_icmpne`, `if_icmplt`, ... `if_icmple`
    IfACmp(EqComparison, Lbl), // covers `if_acmpeq`, `if_acmpne`
    IfNull(EqComparison, Lbl), // covers `ifnull`, `ifnonnull`
    Goto(Lbl),                 // covers `goto` and `goto_w`
    Jsr(Lbl),                  // covers `jsr` and `jsr_w`
    Ret(Var),                  // covers `ret` and `wide ret`
    Switch(Switch<Lbl>),       // covers `tableswitch` and `lookupswitch`
    IReturn,
    LReturn,
    FReturn,
    DReturn,
    AReturn,
    Return,
    AThrow,
}

/// Switch over an `int` on the top of the stack
#[derive(Clone, Debug, PartialEq)]
pub struct Switch<Lbl> {
    /// Jump target when no case matches
    pub default: Lbl,

    /// Keys and their jump targets (order is irrelevant, keys must be distinct)
    pub cases: Vec<(i32, Lbl)>,

    pub layout: SwitchLayout,
}

/// How a switch is encoded
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SwitchLayout {
    /// Pick whichever of `tableswitch` or `lookupswitch` is cheaper
    Auto,

    /// `tableswitch` covering at least `low..=high`
    Table { low: i32, high: i32 },

    /// `lookupswitch`
    Lookup,
}

impl<Lbl> Switch<Lbl> {
    pub fn new(default: Lbl) -> Switch<Lbl> {
        Switch {
            default,
            cases: vec![],
            layout: SwitchLayout::Auto,
        }
    }

    /// Resolve the layout, widening a table to cover all cases
    pub fn concrete_layout(&self) -> SwitchLayout {
        let low = self.cases.iter().map(|(key, _)| *key).min();
        let high = self.cases.iter().map(|(key, _)| *key).max();
        match (self.layout, low, high) {
            (SwitchLayout::Lookup, _, _) => SwitchLayout::Lookup,
            (SwitchLayout::Table { low, high }, None, None) => SwitchLayout::Table { low, high },
            (SwitchLayout::Table { low: l, high: h }, Some(low), Some(high)) => {
                SwitchLayout::Table {
                    low: l.min(low),
                    high: h.max(high),
                }
            }
            (SwitchLayout::Auto, Some(low), Some(high)) => {
                let labels = self.cases.len() as i64;
                let table_space = 4 + (high as i64 - low as i64 + 1);
                let table_time = 3;
                let lookup_space = 3 + 2 * labels;
                let lookup_time = labels;
                if table_space + 3 * table_time <= lookup_space + 3 * lookup_time {
                    SwitchLayout::Table { low, high }
                } else {
                    SwitchLayout::Lookup
                }
            }
            _ => SwitchLayout::Lookup,
        }
    }

    pub fn map_labels<Lbl2>(&self, mut map_label: impl FnMut(&Lbl) -> Lbl2) -> Switch<Lbl2> {
        Switch {
            default: map_label(&self.default),
            cases: self
                .cases
                .iter()
                .map(|(key, lbl)| (*key, map_label(lbl)))
                .collect(),
            layout: self.layout,
        }
    }
}

/// Possible bit shifts
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum ShiftType {
    Left,
    LogicalRight,
    ArithmeticRight,
}

/// Comparison modes for floating point
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum CompareMode {
    /// -1 on NaN
    L,

    /// 1 on NaN
    G,
}

/// Binary comparison operators available for `int` branches
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum OrdComparison {
    EQ,
    GE,
    GT,
    LE,
    LT,
    NE,
}

impl Not for OrdComparison {
    type Output = Self;

    fn not(self) -> Self::Output {
        match self {
            OrdComparison::EQ => OrdComparison::NE,
            OrdComparison::GE => OrdComparison::LT,
            OrdComparison::GT => OrdComparison::LE,
            OrdComparison::LE => OrdComparison::GT,
            OrdComparison::LT => OrdComparison::GE,
            OrdComparison::NE => OrdComparison::EQ,
        }
    }
}

/// Equality/inequality comparison operators
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum EqComparison {
    EQ,
    NE,
}

impl Not for EqComparison {
    type Output = Self;

    fn not(self) -> Self::Output {
        match self {
            EqComparison::EQ => EqComparison::NE,
            EqComparison::NE => EqComparison::EQ,
        }
    }
}

/// Type of method to invoke
///
/// Note: `InvokeDynamic` is kept separate because the constant argument it expects is not to a
/// `Constant::MethodRef`. The argument count of `invokeinterface` is derived from the descriptor.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum InvokeType {
    Virtual,
    Special,
    Static,
    Interface,
}

fn bad_descriptor(descriptor: &str) -> Error {
    Error::BadDescriptor(descriptor.to_owned())
}

/// Stack words taken by a field of this descriptor
fn field_words(constant: &Constant) -> Result<i32, Error> {
    match constant {
        Constant::FieldRef(member) => FieldType::parse(&member.descriptor)
            .map(|typ| typ.width() as i32)
            .map_err(|_| bad_descriptor(&member.descriptor)),
        _ => Err(Error::MissingConstant(constant.clone())),
    }
}

/// Stack words popped (arguments) and pushed (return) by a method of this descriptor
fn method_words(descriptor: &str) -> Result<(i32, i32), Error> {
    let method = MethodDescriptor::parse(descriptor).map_err(|_| bad_descriptor(descriptor))?;
    Ok((
        method.parameter_length(false) as i32,
        method.return_length() as i32,
    ))
}

/// Descriptor of a method-like constant
fn invoked_descriptor(constant: &Constant) -> Result<&str, Error> {
    match constant {
        Constant::MethodRef(member) | Constant::InterfaceMethodRef(member) => {
            Ok(&member.descriptor)
        }
        Constant::InvokeDynamic { name_and_type, .. } => Ok(&name_and_type.descriptor),
        _ => Err(Error::MissingConstant(constant.clone())),
    }
}

impl<Var> Instruction<Var> {
    /// Change in stack height (in words) from executing this instruction
    pub fn stack_effect(&self) -> Result<i32, Error> {
        use Instruction::*;

        Ok(match self {
            Nop | INeg | FNeg | LNeg | DNeg | IInc(_, _) | I2F | L2D | F2I | D2L | I2B | I2C
            | I2S | Swap | NewArray(_) | ANewArray(_) | ArrayLength | CheckCast(_)
            | InstanceOf(_) | LALoad | DALoad => 0,

            AConstNull | IConstM1 | IConst0 | IConst1 | IConst2 | IConst3 | IConst4 | IConst5
            | FConst0 | FConst1 | FConst2 | BiPush(_) | SiPush(_) | Ldc(_) | ILoad(_)
            | FLoad(_) | ALoad(_) | Dup | DupX1 | DupX2 | I2L | I2D | F2L | F2D | New(_) => 1,

            LConst0 | LConst1 | DConst0 | DConst1 | Ldc2(_) | LLoad(_) | DLoad(_) | Dup2
            | Dup2X1 | Dup2X2 => 2,

            IALoad | FALoad | AALoad | BALoad | CALoad | SALoad | IStore(_) | FStore(_)
            | AStore(_) | Pop | IAdd | FAdd | ISub | FSub | IMul | FMul | IDiv | FDiv | IRem
            | FRem | ISh(_) | LSh(_) | IAnd | IOr | IXor | L2I | L2F | D2I | D2F | FCmp(_)
            | MonitorEnter | MonitorExit => -1,

            LStore(_) | DStore(_) | Pop2 | LAdd | DAdd | LSub | DSub | LMul | DMul | LDiv
            | DDiv | LRem | DRem | LAnd | LOr | LXor => -2,

            IAStore | FAStore | AAStore | BAStore | CAStore | SAStore | LCmp | DCmp(_) => -3,

            LAStore | DAStore => -4,

            GetStatic(field) => field_words(field)?,
            PutStatic(field) => -field_words(field)?,
            GetField(field) => field_words(field)? - 1,
            PutField(field) => -field_words(field)? - 1,
            Invoke(invoke_type, method) => {
                let (args, ret) = method_words(invoked_descriptor(method)?)?;
                let receiver = if *invoke_type == InvokeType::Static { 0 } else { 1 };
                ret - args - receiver
            }
            InvokeDynamic(method) => {
                let (args, ret) = method_words(invoked_descriptor(method)?)?;
                ret - args
            }
            MultiANewArray(_, dimensions) => 1 - *dimensions as i32,
        })
    }

    /// Local variable read or written by this instruction
    pub fn variable(&self) -> Option<&Var> {
        use Instruction::*;
        match self {
            ILoad(var) | LLoad(var) | FLoad(var) | DLoad(var) | ALoad(var) | IStore(var)
            | LStore(var) | FStore(var) | DStore(var) | AStore(var) | IInc(var, _) => Some(var),
            _ => None,
        }
    }

    /// Is this a store (not counting `iinc`, which needs an already-assigned variable)?
    pub fn is_store(&self) -> bool {
        use Instruction::*;
        matches!(
            self,
            IStore(_) | LStore(_) | FStore(_) | DStore(_) | AStore(_)
        )
    }

    /// Constant operand that must be registered in the pool
    pub fn constant(&self) -> Option<&Constant> {
        use Instruction::*;
        match self {
            Ldc(constant)
            | Ldc2(constant)
            | GetStatic(constant)
            | PutStatic(constant)
            | GetField(constant)
            | PutField(constant)
            | Invoke(_, constant)
            | InvokeDynamic(constant)
            | New(constant)
            | ANewArray(constant)
            | CheckCast(constant)
            | InstanceOf(constant)
            | MultiANewArray(constant, _) => Some(constant),
            _ => None,
        }
    }

    pub fn map_vars<Var2>(&self, map_var: impl FnOnce(&Var) -> Var2) -> Instruction<Var2> {
        use Instruction::*;

        match self {
            Nop => Nop,
            AConstNull => AConstNull,
            IConstM1 => IConstM1,
            IConst0 => IConst0,
            IConst1 => IConst1,
            IConst2 => IConst2,
            IConst3 => IConst3,
            IConst4 => IConst4,
            IConst5 => IConst5,
            LConst0 => LConst0,
            LConst1 => LConst1,
            FConst0 => FConst0,
            FConst1 => FConst1,
            FConst2 => FConst2,
            DConst0 => DConst0,
            DConst1 => DConst1,
            BiPush(b) => BiPush(*b),
            SiPush(s) => SiPush(*s),
            Ldc(c) => Ldc(c.clone()),
            Ldc2(c) => Ldc2(c.clone()),
            ILoad(v) => ILoad(map_var(v)),
            LLoad(v) => LLoad(map_var(v)),
            FLoad(v) => FLoad(map_var(v)),
            DLoad(v) => DLoad(map_var(v)),
            ALoad(v) => ALoad(map_var(v)),
            IALoad => IALoad,
            LALoad => LALoad,
            FALoad => FALoad,
            DALoad => DALoad,
            AALoad => AALoad,
            BALoad => BALoad,
            CALoad => CALoad,
            SALoad => SALoad,
            IStore(v) => IStore(map_var(v)),
            LStore(v) => LStore(map_var(v)),
            FStore(v) => FStore(map_var(v)),
            DStore(v) => DStore(map_var(v)),
            AStore(v) => AStore(map_var(v)),
            IAStore => IAStore,
            LAStore => LAStore,
            FAStore => FAStore,
            DAStore => DAStore,
            AAStore => AAStore,
            BAStore => BAStore,
            CAStore => CAStore,
            SAStore => SAStore,
            Pop => Pop,
            Pop2 => Pop2,
            Dup => Dup,
            DupX1 => DupX1,
            DupX2 => DupX2,
            Dup2 => Dup2,
            Dup2X1 => Dup2X1,
            Dup2X2 => Dup2X2,
            Swap => Swap,
            IAdd => IAdd,
            LAdd => LAdd,
            FAdd => FAdd,
            DAdd => DAdd,
            ISub => ISub,
            LSub => LSub,
            FSub => FSub,
            DSub => DSub,
            IMul => IMul,
            LMul => LMul,
            FMul => FMul,
            DMul => DMul,
            IDiv => IDiv,
            LDiv => LDiv,
            FDiv => FDiv,
            DDiv => DDiv,
            IRem => IRem,
            LRem => LRem,
            FRem => FRem,
            DRem => DRem,
            INeg => INeg,
            LNeg => LNeg,
            FNeg => FNeg,
            DNeg => DNeg,
            ISh(s) => ISh(*s),
            LSh(s) => LSh(*s),
            IAnd => IAnd,
            LAnd => LAnd,
            IOr => IOr,
            LOr => LOr,
            IXor => IXor,
            LXor => LXor,
            IInc(v, diff) => IInc(map_var(v), *diff),
            I2L => I2L,
            I2F => I2F,
            I2D => I2D,
            L2I => L2I,
            L2F => L2F,
            L2D => L2D,
            F2I => F2I,
            F2L => F2L,
            F2D => F2D,
            D2I => D2I,
            D2L => D2L,
            D2F => D2F,
            I2B => I2B,
            I2C => I2C,
            I2S => I2S,
            LCmp => LCmp,
            FCmp(m) => FCmp(*m),
            DCmp(m) => DCmp(*m),
            GetStatic(c) => GetStatic(c.clone()),
            PutStatic(c) => PutStatic(c.clone()),
            GetField(c) => GetField(c.clone()),
            PutField(c) => PutField(c.clone()),
            Invoke(t, c) => Invoke(*t, c.clone()),
            InvokeDynamic(c) => InvokeDynamic(c.clone()),
            New(c) => New(c.clone()),
            NewArray(t) => NewArray(*t),
            ANewArray(c) => ANewArray(c.clone()),
            ArrayLength => ArrayLength,
            CheckCast(c) => CheckCast(c.clone()),
            InstanceOf(c) => InstanceOf(c.clone()),
            MonitorEnter => MonitorEnter,
            MonitorExit => MonitorExit,
            MultiANewArray(c, dims) => MultiANewArray(c.clone(), *dims),
        }
    }

    pub fn mnemonic(&self) -> &'static str {
        use Instruction::*;

        match self {
            Nop => "nop",
            AConstNull => "aconst_null",
            IConstM1 => "iconst_m1",
            IConst0 => "iconst_0",
            IConst1 => "iconst_1",
            IConst2 => "iconst_2",
            IConst3 => "iconst_3",
            IConst4 => "iconst_4",
            IConst5 => "iconst_5",
            LConst0 => "lconst_0",
            LConst1 => "lconst_1",
            FConst0 => "fconst_0",
            FConst1 => "fconst_1",
            FConst2 => "fconst_2",
            DConst0 => "dconst_0",
            DConst1 => "dconst_1",
            BiPush(_) => "bipush",
            SiPush(_) => "sipush",
            Ldc(_) => "ldc",
            Ldc2(_) => "ldc2_w",
            ILoad(_) => "iload",
            LLoad(_) => "lload",
            FLoad(_) => "fload",
            DLoad(_) => "dload",
            ALoad(_) => "aload",
            IALoad => "iaload",
            LALoad => "laload",
            FALoad => "faload",
            DALoad => "daload",
            AALoad => "aaload",
            BALoad => "baload",
            CALoad => "caload",
            SALoad => "saload",
            IStore(_) => "istore",
            LStore(_) => "lstore",
            FStore(_) => "fstore",
            DStore(_) => "dstore",
            AStore(_) => "astore",
            IAStore => "iastore",
            LAStore => "lastore",
            FAStore => "fastore",
            DAStore => "dastore",
            AAStore => "aastore",
            BAStore => "bastore",
            CAStore => "castore",
            SAStore => "sastore",
            Pop => "pop",
            Pop2 => "pop2",
            Dup => "dup",
            DupX1 => "dup_x1",
            DupX2 => "dup_x2",
            Dup2 => "dup2",
            Dup2X1 => "dup2_x1",
            Dup2X2 => "dup2_x2",
            Swap => "swap",
            IAdd => "iadd",
            LAdd => "ladd",
            FAdd => "fadd",
            DAdd => "dadd",
            ISub => "isub",
            LSub => "lsub",
            FSub => "fsub",
            DSub => "dsub",
            IMul => "imul",
            LMul => "lmul",
            FMul => "fmul",
            DMul => "dmul",
            IDiv => "idiv",
            LDiv => "ldiv",
            FDiv => "fdiv",
            DDiv => "ddiv",
            IRem => "irem",
            LRem => "lrem",
            FRem => "frem",
            DRem => "drem",
            INeg => "ineg",
            LNeg => "lneg",
            FNeg => "fneg",
            DNeg => "dneg",
            ISh(ShiftType::Left) => "ishl",
            ISh(ShiftType::ArithmeticRight) => "ishr",
            ISh(ShiftType::LogicalRight) => "iushr",
            LSh(ShiftType::Left) => "lshl",
            LSh(ShiftType::ArithmeticRight) => "lshr",
            LSh(ShiftType::LogicalRight) => "lushr",
            IAnd => "iand",
            LAnd => "land",
            IOr => "ior",
            LOr => "lor",
            IXor => "ixor",
            LXor => "lxor",
            IInc(_, _) => "iinc",
            I2L => "i2l",
            I2F => "i2f",
            I2D => "i2d",
            L2I => "l2i",
            L2F => "l2f",
            L2D => "l2d",
            F2I => "f2i",
            F2L => "f2l",
            F2D => "f2d",
            D2I => "d2i",
            D2L => "d2l",
            D2F => "d2f",
            I2B => "i2b",
            I2C => "i2c",
            I2S => "i2s",
            LCmp => "lcmp",
            FCmp(CompareMode::L) => "fcmpl",
            FCmp(CompareMode::G) => "fcmpg",
            DCmp(CompareMode::L) => "dcmpl",
            DCmp(CompareMode::G) => "dcmpg",
            GetStatic(_) => "getstatic",
            PutStatic(_) => "putstatic",
            GetField(_) => "getfield",
            PutField(_) => "putfield",
            Invoke(InvokeType::Virtual, _) => "invokevirtual",
            Invoke(InvokeType::Special, _) => "invokespecial",
            Invoke(InvokeType::Static, _) => "invokestatic",
            Invoke(InvokeType::Interface, _) => "invokeinterface",
            InvokeDynamic(_) => "invokedynamic",
            New(_) => "new",
            NewArray(_) => "newarray",
            ANewArray(_) => "anewarray",
            ArrayLength => "arraylength",
            CheckCast(_) => "checkcast",
            InstanceOf(_) => "instanceof",
            MonitorEnter => "monitorenter",
            MonitorExit => "monitorexit",
            MultiANewArray(_, _) => "multianewarray",
        }
    }
}

/// Array type code used by `newarray`
pub(crate) fn array_type_code(base_type: BaseType) -> u8 {
    match base_type {
        BaseType::Boolean => 4,
        BaseType::Char => 5,
        BaseType::Float => 6,
        BaseType::Double => 7,
        BaseType::Byte => 8,
        BaseType::Short => 9,
        BaseType::Int => 10,
        BaseType::Long => 11,
    }
}

/* The load/store instructions follow the same pattern:
 *
 *   - short form (0-3) have special bytes
 *   - normal form (0-255) use `iload` plus a byte operand
 *   - wide form (255-65535) use `wide iload` plus two byte operands
 */
fn load_or_store_width(idx: u16) -> usize {
    match idx {
        0..=3 => 1,
        4..=255 => 2,
        _ => 4,
    }
}

fn serialize_load_or_store<W: WriteBytesExt>(
    idx: u16,
    short_form_start: u8,
    normal_form: u8,
    writer: &mut W,
) -> std::io::Result<()> {
    match u8::try_from(idx) {
        Ok(n @ 0..=3) => (short_form_start + n).serialize(writer),
        Ok(n) => {
            normal_form.serialize(writer)?;
            n.serialize(writer)
        }
        Err(_) => {
            0xC4u8.serialize(writer)?;
            normal_form.serialize(writer)?;
            idx.serialize(writer)
        }
    }
}

impl Instruction<u16> {
    /// Number of bytes the encoded instruction takes
    ///
    /// This depends on the pool only for `ldc`, which has a shorter form for small indices.
    pub fn width(&self, pool: &ConstantPool) -> Result<usize, Error> {
        use Instruction::*;

        Ok(match self {
            BiPush(_) | NewArray(_) => 2,

            SiPush(_) | Ldc2(_) | GetStatic(_) | PutStatic(_) | GetField(_) | PutField(_)
            | Invoke(InvokeType::Virtual | InvokeType::Special | InvokeType::Static, _)
            | New(_) | ANewArray(_) | CheckCast(_) | InstanceOf(_) => 3,

            Ldc(constant) => {
                if pool.index_of(constant)? <= 255 {
                    2
                } else {
                    3
                }
            }

            ILoad(idx) | LLoad(idx) | FLoad(idx) | DLoad(idx) | ALoad(idx) | IStore(idx)
            | LStore(idx) | FStore(idx) | DStore(idx) | AStore(idx) => load_or_store_width(*idx),

            IInc(idx, diff) => {
                if *idx <= 255 && i8::try_from(*diff).is_ok() {
                    3
                } else {
                    6
                }
            }

            MultiANewArray(_, _) => 4,
            Invoke(InvokeType::Interface, _) | InvokeDynamic(_) => 5,

            _ => 1,
        })
    }

    /// Write out the encoded instruction
    pub fn assemble<W: WriteBytesExt>(
        &self,
        pool: &ConstantPool,
        writer: &mut W,
    ) -> Result<(), Error> {
        use Instruction::*;

        let simple: Option<u8> = match self {
            Nop => Some(0x00),
            AConstNull => Some(0x01),
            IConstM1 => Some(0x02),
            IConst0 => Some(0x03),
            IConst1 => Some(0x04),
            IConst2 => Some(0x05),
            IConst3 => Some(0x06),
            IConst4 => Some(0x07),
            IConst5 => Some(0x08),
            LConst0 => Some(0x09),
            LConst1 => Some(0x0a),
            FConst0 => Some(0x0b),
            FConst1 => Some(0x0c),
            FConst2 => Some(0x0d),
            DConst0 => Some(0x0e),
            DConst1 => Some(0x0f),
            IALoad => Some(0x2e),
            LALoad => Some(0x2f),
            FALoad => Some(0x30),
            DALoad => Some(0x31),
            AALoad => Some(0x32),
            BALoad => Some(0x33),
            CALoad => Some(0x34),
            SALoad => Some(0x35),
            IAStore => Some(0x4f),
            LAStore => Some(0x50),
            FAStore => Some(0x51),
            DAStore => Some(0x52),
            AAStore => Some(0x53),
            BAStore => Some(0x54),
            CAStore => Some(0x55),
            SAStore => Some(0x56),
            Pop => Some(0x57),
            Pop2 => Some(0x58),
            Dup => Some(0x59),
            DupX1 => Some(0x5a),
            DupX2 => Some(0x5b),
            Dup2 => Some(0x5c),
            Dup2X1 => Some(0x5d),
            Dup2X2 => Some(0x5e),
            Swap => Some(0x5f),
            IAdd => Some(0x60),
            LAdd => Some(0x61),
            FAdd => Some(0x62),
            DAdd => Some(0x63),
            ISub => Some(0x64),
            LSub => Some(0x65),
            FSub => Some(0x66),
            DSub => Some(0x67),
            IMul => Some(0x68),
            LMul => Some(0x69),
            FMul => Some(0x6a),
            DMul => Some(0x6b),
            IDiv => Some(0x6c),
            LDiv => Some(0x6d),
            FDiv => Some(0x6e),
            DDiv => Some(0x6f),
            IRem => Some(0x70),
            LRem => Some(0x71),
            FRem => Some(0x72),
            DRem => Some(0x73),
            INeg => Some(0x74),
            LNeg => Some(0x75),
            FNeg => Some(0x76),
            DNeg => Some(0x77),
            ISh(ShiftType::Left) => Some(0x78),
            LSh(ShiftType::Left) => Some(0x79),
            ISh(ShiftType::ArithmeticRight) => Some(0x7a),
            LSh(ShiftType::ArithmeticRight) => Some(0x7b),
            ISh(ShiftType::LogicalRight) => Some(0x7c),
            LSh(ShiftType::LogicalRight) => Some(0x7d),
            IAnd => Some(0x7e),
            LAnd => Some(0x7f),
            IOr => Some(0x80),
            LOr => Some(0x81),
            IXor => Some(0x82),
            LXor => Some(0x83),
            I2L => Some(0x85),
            I2F => Some(0x86),
            I2D => Some(0x87),
            L2I => Some(0x88),
            L2F => Some(0x89),
            L2D => Some(0x8a),
            F2I => Some(0x8b),
            F2L => Some(0x8c),
            F2D => Some(0x8d),
            D2I => Some(0x8e),
            D2L => Some(0x8f),
            D2F => Some(0x90),
            I2B => Some(0x91),
            I2C => Some(0x92),
            I2S => Some(0x93),
            LCmp => Some(0x94),
            FCmp(CompareMode::L) => Some(0x95),
            FCmp(CompareMode::G) => Some(0x96),
            DCmp(CompareMode::L) => Some(0x97),
            DCmp(CompareMode::G) => Some(0x98),
            ArrayLength => Some(0xbe),
            MonitorEnter => Some(0xc2),
            MonitorExit => Some(0xc3),
            _ => None,
        };
        if let Some(opcode) = simple {
            opcode.serialize(writer)?;
            return Ok(());
        }

        // Instructions with a two byte constant pool index operand
        let indexed: Option<(u8, &Constant)> = match self {
            Ldc2(c) => Some((0x14, c)),
            GetStatic(c) => Some((0xb2, c)),
            PutStatic(c) => Some((0xb3, c)),
            GetField(c) => Some((0xb4, c)),
            PutField(c) => Some((0xb5, c)),
            Invoke(InvokeType::Virtual, c) => Some((0xb6, c)),
            Invoke(InvokeType::Special, c) => Some((0xb7, c)),
            Invoke(InvokeType::Static, c) => Some((0xb8, c)),
            New(c) => Some((0xbb, c)),
            ANewArray(c) => Some((0xbd, c)),
            CheckCast(c) => Some((0xc0, c)),
            InstanceOf(c) => Some((0xc1, c)),
            _ => None,
        };
        if let Some((opcode, constant)) = indexed {
            opcode.serialize(writer)?;
            pool.index_of(constant)?.serialize(writer)?;
            return Ok(());
        }

        match self {
            BiPush(b) => {
                0x10u8.serialize(writer)?;
                b.serialize(writer)?;
            }
            SiPush(s) => {
                0x11u8.serialize(writer)?;
                s.serialize(writer)?;
            }
            Ldc(constant) => {
                let idx = pool.index_of(constant)?;
                match u8::try_from(idx) {
                    Ok(b) => {
                        0x12u8.serialize(writer)?;
                        b.serialize(writer)?;
                    }
                    Err(_) => {
                        0x13u8.serialize(writer)?;
                        idx.serialize(writer)?;
                    }
                }
            }
            ILoad(idx) => serialize_load_or_store(*idx, 0x1A, 0x15, writer)?,
            LLoad(idx) => serialize_load_or_store(*idx, 0x1E, 0x16, writer)?,
            FLoad(idx) => serialize_load_or_store(*idx, 0x22, 0x17, writer)?,
            DLoad(idx) => serialize_load_or_store(*idx, 0x26, 0x18, writer)?,
            ALoad(idx) => serialize_load_or_store(*idx, 0x2A, 0x19, writer)?,
            IStore(idx) => serialize_load_or_store(*idx, 0x3B, 0x36, writer)?,
            LStore(idx) => serialize_load_or_store(*idx, 0x3F, 0x37, writer)?,
            FStore(idx) => serialize_load_or_store(*idx, 0x43, 0x38, writer)?,
            DStore(idx) => serialize_load_or_store(*idx, 0x47, 0x39, writer)?,
            AStore(idx) => serialize_load_or_store(*idx, 0x4B, 0x3A, writer)?,
            IInc(idx, diff) => match (u8::try_from(*idx), i8::try_from(*diff)) {
                (Ok(b), Ok(d)) => {
                    0x84u8.serialize(writer)?;
                    b.serialize(writer)?;
                    d.serialize(writer)?;
                }
                _ => {
                    0xc4u8.serialize(writer)?;
                    0x84u8.serialize(writer)?;
                    idx.serialize(writer)?;
                    diff.serialize(writer)?;
                }
            },
            Invoke(InvokeType::Interface, method) => {
                let (args, _) = method_words(invoked_descriptor(method)?)?;
                0xb9u8.serialize(writer)?;
                pool.index_of(method)?.serialize(writer)?;
                ((args + 1) as u8).serialize(writer)?;
                0u8.serialize(writer)?;
            }
            InvokeDynamic(method) => {
                0xbau8.serialize(writer)?;
                pool.index_of(method)?.serialize(writer)?;
                0u16.serialize(writer)?;
            }
            NewArray(base_type) => {
                0xbcu8.serialize(writer)?;
                array_type_code(*base_type).serialize(writer)?;
            }
            MultiANewArray(class, dimensions) => {
                0xc5u8.serialize(writer)?;
                pool.index_of(class)?.serialize(writer)?;
                dimensions.serialize(writer)?;
            }
            _ => unreachable!("simple and indexed instructions are handled above"),
        }
        Ok(())
    }
}

impl<Lbl, Var> BranchInstruction<Lbl, Var> {
    /// Change in stack height (in words) from executing this instruction
    ///
    /// `jsr` is reported as pushing its return address: what the subroutine does to the stack is
    /// only known once it has been explored.
    pub fn stack_effect(&self) -> i32 {
        use BranchInstruction::*;

        match self {
            Goto(_) | Ret(_) | Return => 0,
            Jsr(_) => 1,
            If(_, _) | IfNull(_, _) | Switch(_) | IReturn | FReturn | AReturn | AThrow => -1,
            IfICmp(_, _) | IfACmp(_, _) | LReturn | DReturn => -2,
        }
    }

    /// Does execution continue with the next instruction (at least some of the time)?
    pub fn falls_through(&self) -> bool {
        use BranchInstruction::*;
        matches!(
            self,
            If(_, _) | IfICmp(_, _) | IfACmp(_, _) | IfNull(_, _) | Jsr(_)
        )
    }

    pub fn map_labels<Lbl2, Var2>(
        &self,
        mut map_label: impl FnMut(&Lbl) -> Lbl2,
        map_var: impl FnOnce(&Var) -> Var2,
    ) -> BranchInstruction<Lbl2, Var2> {
        use BranchInstruction::*;

        match self {
            If(op, lbl) => If(*op, map_label(lbl)),
            IfICmp(op, lbl) => IfICmp(*op, map_label(lbl)),
            IfACmp(op, lbl) => IfACmp(*op, map_label(lbl)),
            IfNull(op, lbl) => IfNull(*op, map_label(lbl)),
            Goto(lbl) => Goto(map_label(lbl)),
            Jsr(lbl) => Jsr(map_label(lbl)),
            Ret(var) => Ret(map_var(var)),
            Switch(switch) => Switch(switch.map_labels(map_label)),
            IReturn => IReturn,
            LReturn => LReturn,
            FReturn => FReturn,
            DReturn => DReturn,
            AReturn => AReturn,
            Return => Return,
            AThrow => AThrow,
        }
    }

    pub fn mnemonic(&self) -> &'static str {
        use BranchInstruction::*;

        match self {
            If(OrdComparison::EQ, _) => "ifeq",
            If(OrdComparison::NE, _) => "ifne",
            If(OrdComparison::LT, _) => "iflt",
            If(OrdComparison::GE, _) => "ifge",
            If(OrdComparison::GT, _) => "ifgt",
            If(OrdComparison::LE, _) => "ifle",
            IfICmp(OrdComparison::EQ, _) => "if_icmpeq",
            IfICmp(OrdComparison::NE, _) => "if_icmpne",
            IfICmp(OrdComparison::LT, _) => "if_icmplt",
            IfICmp(OrdComparison::GE, _) => "if_icmpge",
            IfICmp(OrdComparison::GT, _) => "if_icmpgt",
            IfICmp(OrdComparison::LE, _) => "if_icmple",
            IfACmp(EqComparison::EQ, _) => "if_acmpeq",
            IfACmp(EqComparison::NE, _) => "if_acmpne",
            IfNull(EqComparison::EQ, _) => "ifnull",
            IfNull(EqComparison::NE, _) => "ifnonnull",
            Goto(_) => "goto",
            Jsr(_) => "jsr",
            Ret(_) => "ret",
            Switch(switch) => match switch.concrete_layout() {
                SwitchLayout::Table { .. } => "tableswitch",
                _ => "lookupswitch",
            },
            IReturn => "ireturn",
            LReturn => "lreturn",
            FReturn => "freturn",
            DReturn => "dreturn",
            AReturn => "areturn",
            Return => "return",
            AThrow => "athrow",
        }
    }
}

/// Padding bytes after a switch opcode at `offset`, so that the operands are 4-byte aligned
fn switch_padding(offset: u32) -> u32 {
    3 - offset % 4
}

impl BranchInstruction<u32, u16> {
    /// Number of bytes the encoded instruction takes, when it starts at `offset`
    pub fn width_at(&self, offset: u32) -> usize {
        use BranchInstruction::*;

        match self {
            IReturn | LReturn | FReturn | DReturn | AReturn | Return | AThrow => 1,
            Ret(idx) => {
                if *idx <= 255 {
                    2
                } else {
                    4
                }
            }
            If(_, _) | IfICmp(_, _) | IfACmp(_, _) | IfNull(_, _) | Goto(_) | Jsr(_) => 3,
            Switch(switch) => {
                let fixed = 1 + switch_padding(offset) as usize;
                match switch.concrete_layout() {
                    SwitchLayout::Table { low, high } => {
                        fixed + 12 + 4 * (high as i64 - low as i64 + 1) as usize
                    }
                    _ => fixed + 8 + 8 * switch.cases.len(),
                }
            }
        }
    }

    /// Write out the encoded instruction, which starts at `offset`
    pub fn assemble<W: WriteBytesExt>(&self, offset: u32, writer: &mut W) -> Result<(), Error> {
        use BranchInstruction::*;

        let relative = |target: &u32| -> Result<i16, Error> {
            i16::try_from(*target as i64 - offset as i64).map_err(|_| Error::BranchOutOfRange {
                offset,
                target: *target,
            })
        };
        let relative_wide = |target: &u32| -> i32 { (*target as i64 - offset as i64) as i32 };

        match self {
            If(comp, lbl) => {
                let opcode: u8 = match comp {
                    OrdComparison::EQ => 0x99,
                    OrdComparison::NE => 0x9a,
                    OrdComparison::LT => 0x9b,
                    OrdComparison::GE => 0x9c,
                    OrdComparison::GT => 0x9d,
                    OrdComparison::LE => 0x9e,
                };
                opcode.serialize(writer)?;
                relative(lbl)?.serialize(writer)?;
            }
            IfICmp(comp, lbl) => {
                let opcode: u8 = match comp {
                    OrdComparison::EQ => 0x9f,
                    OrdComparison::NE => 0xa0,
                    OrdComparison::LT => 0xa1,
                    OrdComparison::GE => 0xa2,
                    OrdComparison::GT => 0xa3,
                    OrdComparison::LE => 0xa4,
                };
                opcode.serialize(writer)?;
                relative(lbl)?.serialize(writer)?;
            }
            IfACmp(comp, lbl) => {
                let opcode: u8 = match comp {
                    EqComparison::EQ => 0xa5,
                    EqComparison::NE => 0xa6,
                };
                opcode.serialize(writer)?;
                relative(lbl)?.serialize(writer)?;
            }
            IfNull(comp, lbl) => {
                let opcode: u8 = match comp {
                    EqComparison::EQ => 0xc6,
                    EqComparison::NE => 0xc7,
                };
                opcode.serialize(writer)?;
                relative(lbl)?.serialize(writer)?;
            }
            Goto(lbl) => {
                0xa7u8.serialize(writer)?;
                relative(lbl)?.serialize(writer)?;
            }
            Jsr(lbl) => {
                0xa8u8.serialize(writer)?;
                relative(lbl)?.serialize(writer)?;
            }
            Ret(idx) => match u8::try_from(*idx) {
                Ok(b) => {
                    0xa9u8.serialize(writer)?;
                    b.serialize(writer)?;
                }
                Err(_) => {
                    0xc4u8.serialize(writer)?;
                    0xa9u8.serialize(writer)?;
                    idx.serialize(writer)?;
                }
            },
            Switch(switch) => {
                let layout = switch.concrete_layout();
                let opcode: u8 = match layout {
                    SwitchLayout::Table { .. } => 0xaa,
                    _ => 0xab,
                };
                opcode.serialize(writer)?;
                for _ in 0..switch_padding(offset) {
                    0x00u8.serialize(writer)?;
                }
                relative_wide(&switch.default).serialize(writer)?;

                let mut cases = switch.cases.clone();
                cases.sort_by_key(|(key, _)| *key);
                if let SwitchLayout::Table { low, high } = layout {
                    low.serialize(writer)?;
                    high.serialize(writer)?;
                    let mut cases = cases.iter().peekable();
                    for key in low as i64..=high as i64 {
                        let target = match cases.next_if(|(k, _)| *k as i64 == key) {
                            Some((_, target)) => target,
                            None => &switch.default,
                        };
                        relative_wide(target).serialize(writer)?;
                    }
                } else {
                    (cases.len() as i32).serialize(writer)?;
                    for (key, target) in &cases {
                        key.serialize(writer)?;
                        relative_wide(target).serialize(writer)?;
                    }
                }
            }
            IReturn => 0xacu8.serialize(writer)?,
            LReturn => 0xadu8.serialize(writer)?,
            FReturn => 0xaeu8.serialize(writer)?,
            DReturn => 0xafu8.serialize(writer)?,
            AReturn => 0xb0u8.serialize(writer)?,
            Return => 0xb1u8.serialize(writer)?,
            AThrow => 0xbfu8.serialize(writer)?,
        }
        Ok(())
    }
}

/// Short human readable rendering of a constant operand
pub(crate) fn render_constant(constant: &Constant) -> String {
    match constant {
        Constant::Utf8(string) | Constant::String(string) => format!("{:?}", string),
        Constant::Utf8Units(units) | Constant::StringUnits(units) => {
            format!("{:?}", String::from_utf16_lossy(units))
        }
        Constant::Integer(integer) => integer.to_string(),
        Constant::Float(bits) => format!("{}f", f32::from_bits(*bits)),
        Constant::Long(long) => format!("{}L", long),
        Constant::Double(bits) => format!("{}d", f64::from_bits(*bits)),
        Constant::Class(name) => name.clone(),
        Constant::FieldRef(member)
        | Constant::MethodRef(member)
        | Constant::InterfaceMethodRef(member) => {
            format!("{}.{}:{}", member.class, member.name, member.descriptor)
        }
        Constant::NameAndType(nat) => format!("{}:{}", nat.name, nat.descriptor),
        Constant::MethodHandle { kind, member } => {
            format!("{:?} {}", kind, render_constant(member))
        }
        Constant::MethodType(descriptor) => descriptor.clone(),
        Constant::Dynamic {
            bootstrap_method,
            name_and_type,
        }
        | Constant::InvokeDynamic {
            bootstrap_method,
            name_and_type,
        } => format!(
            "#{}:{}:{}",
            bootstrap_method, name_and_type.name, name_and_type.descriptor
        ),
        Constant::Module(name) | Constant::Package(name) => name.clone(),
    }
}

impl<Var: fmt::Display> fmt::Display for Instruction<Var> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Instruction::*;

        f.write_str(self.mnemonic())?;
        match self {
            BiPush(b) => write!(f, " {}", b),
            SiPush(s) => write!(f, " {}", s),
            IInc(var, diff) => write!(f, " {} {}", var, diff),
            NewArray(base_type) => write!(f, " {:?}", base_type),
            MultiANewArray(class, dimensions) => {
                write!(f, " {} {}", render_constant(class), dimensions)
            }
            _ => {
                if let Some(var) = self.variable() {
                    write!(f, " {}", var)
                } else if let Some(constant) = self.constant() {
                    write!(f, " {}", render_constant(constant))
                } else {
                    Ok(())
                }
            }
        }
    }
}

impl<Lbl: fmt::Display, Var: fmt::Display> fmt::Display for BranchInstruction<Lbl, Var> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use BranchInstruction::*;

        f.write_str(self.mnemonic())?;
        match self {
            If(_, lbl) | IfICmp(_, lbl) | IfACmp(_, lbl) | IfNull(_, lbl) | Goto(lbl)
            | Jsr(lbl) => write!(f, " {}", lbl),
            Ret(var) => write!(f, " {}", var),
            Switch(switch) => {
                let mut cases: Vec<&(i32, Lbl)> = switch.cases.iter().collect();
                cases.sort_by_key(|(key, _)| *key);
                for (key, lbl) in cases {
                    write!(f, " {}:{}", key, lbl)?;
                }
                write!(f, " default:{}", switch.default)
            }
            _ => Ok(()),
        }
    }
}
