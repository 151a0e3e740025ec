use super::assemble::{assemble, preassemble, Assembled, Prepared};
use super::disassemble::{disassemble, RawCode};
use super::{
    BranchInstruction, ExceptionHandler, LineNumber, LocalVariable, Op, OpId, Ops, VarType,
};
use crate::jvm::binary_format::read_bytes;
use crate::jvm::class_file::{Constant, ConstantPool, RawAttribute};
use crate::jvm::{Deserialize, Error, Serialize, Settings};
use byteorder::WriteBytesExt;
use std::fmt;
use std::io::Cursor;
use std::rc::Rc;

/// Where a [`CodeAttribute`] is in its life cycle
///
/// ```text
///   Clear ──add──▶ Added ───────────────┐
///                                       ├──assemble──▶ Assembled
///   Loaded ──disassemble──▶ Disassembled ◀──edit───────┘
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CodeState {
    /// No code at all
    Clear,

    /// Nodes are being added by hand
    Added,

    /// Raw bytes read from a class file, not decoded yet
    Loaded,

    /// Raw bytes decoded into nodes
    Disassembled,

    /// Nodes encoded into raw bytes
    Assembled,
}

impl fmt::Display for CodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CodeState::Clear => "clear",
            CodeState::Added => "added",
            CodeState::Loaded => "loaded",
            CodeState::Disassembled => "disassembled",
            CodeState::Assembled => "assembled",
        };
        f.write_str(name)
    }
}

/// Attributes nested in `Code`, in the order they appear
#[derive(Clone, Debug, PartialEq)]
enum SubAttribute {
    LineNumbers,
    Variables,
    VariableTypes,
    Opaque(RawAttribute),
}

impl SubAttribute {
    const LINE_NUMBERS: &'static str = "LineNumberTable";
    const VARIABLES: &'static str = "LocalVariableTable";
    const VARIABLE_TYPES: &'static str = "LocalVariableTypeTable";
}

/// Body of a method: the [`Code` attribute][0]
///
/// Code is either built by adding nodes one at a time, or loaded from a class file. Loaded code
/// stays as bytes until something asks for its nodes.
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html#jvms-4.7.3
#[derive(Debug)]
pub struct CodeAttribute {
    state: CodeState,
    modified: bool,

    /// Types of the parameters, including `this` for instance methods
    parameters: Vec<VarType>,

    ops: Ops,
    line: u16,
    last_added: Option<OpId>,

    /// Debug ranges carried over from disassembly
    variables: Vec<LocalVariable<OpId>>,
    variable_types: Vec<LocalVariable<OpId>>,

    /// Raw form (when loaded or assembled)
    max_stack: u16,
    max_locals: u16,
    raw: Assembled,

    /// Frame size read from the class file, which assembly never shrinks
    loaded_frame: Option<(u16, u16)>,

    sub_attributes: Vec<SubAttribute>,
    pool: Option<Rc<ConstantPool>>,
    prepared: Option<Prepared>,
}

impl CodeAttribute {
    pub const NAME: &'static str = "Code";

    /// Empty code for a method with these parameters (including `this` if not static)
    pub fn new(parameters: Vec<VarType>) -> CodeAttribute {
        CodeAttribute {
            state: CodeState::Clear,
            modified: false,
            parameters,
            ops: Ops::new(),
            line: 0,
            last_added: None,
            variables: vec![],
            variable_types: vec![],
            max_stack: 0,
            max_locals: 0,
            raw: Assembled::default(),
            loaded_frame: None,
            sub_attributes: vec![],
            pool: None,
            prepared: None,
        }
    }

    pub fn state(&self) -> CodeState {
        self.state
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn parameters(&self) -> &[VarType] {
        &self.parameters
    }

    pub fn max_stack(&self) -> u16 {
        self.max_stack
    }

    pub fn max_locals(&self) -> u16 {
        self.max_locals
    }

    /// Encoded instructions (only available when loaded or assembled)
    pub fn bytecode(&self) -> Option<&[u8]> {
        match self.state {
            CodeState::Loaded | CodeState::Assembled => Some(&self.raw.code),
            _ => None,
        }
    }

    /// Exception table (only meaningful when loaded or assembled)
    pub fn exception_table(&self) -> &[ExceptionHandler] {
        &self.raw.exception_table
    }

    pub fn line_numbers(&self) -> &[LineNumber] {
        &self.raw.line_numbers
    }

    pub fn local_variables(&self) -> &[LocalVariable<u32>] {
        &self.raw.variables
    }

    fn expect_state(&self, operation: &'static str, allowed: &[CodeState]) -> Result<(), Error> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::IllegalState {
                operation,
                state: self.state,
            })
        }
    }

    /// Source line attached to the nodes added from now on
    pub fn set_line(&mut self, line: u16) {
        self.line = line;
    }

    /// Create a node without placing it (typically a label to jump to before it is placed)
    pub fn create(&mut self, op: Op) -> Result<OpId, Error> {
        self.expect_state("create", &[CodeState::Clear, CodeState::Added])?;
        Ok(self.ops.create(op, self.line))
    }

    /// Place a node made with [`CodeAttribute::create`] at the end of the code
    pub fn place(&mut self, id: OpId) -> Result<(), Error> {
        self.expect_state("place", &[CodeState::Clear, CodeState::Added])?;
        self.ops.place(id)?;
        self.state = CodeState::Added;
        self.modified = true;
        self.last_added = Some(id);
        Ok(())
    }

    /// Append a node at the end of the code
    pub fn add(&mut self, op: Op) -> Result<OpId, Error> {
        let id = self.create(op)?;
        self.place(id)?;
        Ok(id)
    }

    /// Add a case to the switch that was just added
    pub fn add_case(&mut self, key: i32, label: OpId) -> Result<(), Error> {
        self.expect_state("add_case", &[CodeState::Added])?;
        let label = self.ops.expect_label(label)?;
        let last = self.last_added.ok_or(Error::CaseWithoutSwitch)?;
        match &mut self.ops[last].op {
            Op::Branch(BranchInstruction::Switch(switch)) => {
                if switch.cases.iter().any(|(k, _)| *k == key) {
                    return Err(Error::DuplicateCase(key));
                }
                switch.cases.push((key, label));
                Ok(())
            }
            _ => Err(Error::CaseWithoutSwitch),
        }
    }

    /// Nodes of the code (disassembling it if it has only been loaded so far)
    pub fn ops(&mut self) -> Result<&Ops, Error> {
        self.ensure_ops()?;
        Ok(&self.ops)
    }

    /// Nodes of the code, for editing (this marks the code as modified)
    pub fn ops_mut(&mut self) -> Result<&mut Ops, Error> {
        self.ensure_ops()?;
        self.state = match self.state {
            CodeState::Clear => CodeState::Added,
            CodeState::Assembled => CodeState::Disassembled,
            state => state,
        };
        self.last_added = None;
        self.modified = true;
        Ok(&mut self.ops)
    }

    /// Render the nodes, one per line
    pub fn listing(&mut self) -> Result<String, Error> {
        Ok(self.ops()?.listing())
    }

    /// Decode loaded bytes into nodes (does nothing if there are nodes already)
    pub fn disassemble(&mut self) -> Result<(), Error> {
        self.ensure_ops()
    }

    fn ensure_ops(&mut self) -> Result<(), Error> {
        if self.state != CodeState::Loaded {
            return Ok(());
        }
        let pool = match &self.pool {
            Some(pool) => Rc::clone(pool),
            None => {
                return Err(Error::IllegalState {
                    operation: "disassemble",
                    state: self.state,
                })
            }
        };
        let raw = RawCode {
            code: &self.raw.code,
            exception_table: &self.raw.exception_table,
            line_numbers: &self.raw.line_numbers,
            variables: &self.raw.variables,
            variable_types: &self.raw.variable_types,
        };
        let disassembly = disassemble(&raw, &self.parameters, &pool)?;
        self.ops = disassembly.ops;
        self.variables = disassembly.variables;
        self.variable_types = disassembly.variable_types;
        self.state = CodeState::Disassembled;
        Ok(())
    }

    /// Verify the code, strip dead code, allocate slots, and register every constant needed
    pub fn preassemble(&mut self, pool: &mut ConstantPool, settings: &Settings) -> Result<(), Error> {
        self.ensure_ops()?;
        if self.state == CodeState::Assembled {
            self.state = CodeState::Disassembled;
        }
        self.expect_state("preassemble", &[CodeState::Added, CodeState::Disassembled])?;
        if self.ops.is_empty() {
            return Err(Error::IllegalState {
                operation: "preassemble",
                state: self.state,
            });
        }
        let prepared = preassemble(&mut self.ops, &self.parameters, pool, settings)?;

        pool.register(&Constant::utf8(CodeAttribute::NAME))?;
        let has_lines = self.ops.iter().any(|id| {
            let node = &self.ops[id];
            node.op.is_sized() && node.line > 0
        });
        if has_lines || self.sub_attributes.contains(&SubAttribute::LineNumbers) {
            pool.register(&Constant::utf8(SubAttribute::LINE_NUMBERS))?;
        }
        let has_types = !self.variable_types.is_empty()
            || prepared.assigned.iter().any(|range| {
                matches!(&self.ops[range.var].op, Op::Declare(decl) if decl.signature.is_some())
            });
        if !self.variables.is_empty()
            || !prepared.assigned.is_empty()
            || self.sub_attributes.contains(&SubAttribute::Variables)
        {
            pool.register(&Constant::utf8(SubAttribute::VARIABLES))?;
        }
        if has_types || self.sub_attributes.contains(&SubAttribute::VariableTypes) {
            pool.register(&Constant::utf8(SubAttribute::VARIABLE_TYPES))?;
        }
        for entry in self.variables.iter().chain(&self.variable_types) {
            pool.register(&Constant::Utf8(entry.name.clone()))?;
            pool.register(&Constant::Utf8(entry.descriptor.clone()))?;
        }
        for sub in &self.sub_attributes {
            if let SubAttribute::Opaque(raw) = sub {
                pool.register(&Constant::Utf8(raw.name.clone()))?;
            }
        }

        self.prepared = Some(prepared);
        Ok(())
    }

    /// Encode pre-assembled code
    pub fn assemble(&mut self, pool: &ConstantPool) -> Result<(), Error> {
        self.expect_state("assemble", &[CodeState::Added, CodeState::Disassembled])?;
        let prepared = match self.prepared.take() {
            Some(prepared) => prepared,
            None => {
                return Err(Error::IllegalState {
                    operation: "assemble",
                    state: self.state,
                })
            }
        };
        let assembled = assemble(
            &mut self.ops,
            &prepared,
            &self.variables,
            &self.variable_types,
            pool,
        )?;

        let (max_stack, max_locals) = match (self.state, self.loaded_frame) {
            (CodeState::Disassembled, Some((stack, locals))) => (
                prepared.max_stack.max(stack),
                prepared.max_locals.max(locals),
            ),
            _ => (prepared.max_stack, prepared.max_locals),
        };
        self.max_stack = max_stack;
        self.max_locals = max_locals;

        // Debug tables already there keep their position (even when empty); new ones go at the end
        let present = [
            (SubAttribute::LineNumbers, !assembled.line_numbers.is_empty()),
            (SubAttribute::Variables, !assembled.variables.is_empty()),
            (SubAttribute::VariableTypes, !assembled.variable_types.is_empty()),
        ];
        for (table, non_empty) in present {
            if non_empty && !self.sub_attributes.contains(&table) {
                self.sub_attributes.push(table);
            }
        }

        self.raw = assembled;
        self.state = CodeState::Assembled;
        Ok(())
    }

    /// Read the body of a `Code` attribute
    ///
    /// Unknown nested attributes make the pool order-significant, since they may hold indices.
    pub(crate) fn load(
        info: &[u8],
        parameters: Vec<VarType>,
        pool: &mut ConstantPool,
    ) -> Result<CodeAttribute, Error> {
        let mut reader = Cursor::new(info);
        let max_stack = u16::deserialize(&mut reader)?;
        let max_locals = u16::deserialize(&mut reader)?;
        let code_len = u32::deserialize(&mut reader)?;
        if code_len == 0 || code_len > u16::MAX as u32 {
            return Err(Error::InvalidCodeLength(code_len));
        }
        let code = read_bytes(&mut reader, code_len as usize)?;

        let handlers = u16::deserialize(&mut reader)?;
        let mut exception_table = Vec::with_capacity(handlers as usize);
        for _ in 0..handlers {
            exception_table.push(ExceptionHandler::deserialize(&mut reader, pool)?);
        }

        let mut raw = Assembled {
            code,
            exception_table,
            ..Assembled::default()
        };
        let mut sub_attributes = vec![];
        for attribute in RawAttribute::deserialize_all(&mut reader, pool)? {
            let sub = match attribute.name.as_str() {
                SubAttribute::LINE_NUMBERS => {
                    let mut reader = Cursor::new(&attribute.info[..]);
                    let count = u16::deserialize(&mut reader)?;
                    for _ in 0..count {
                        raw.line_numbers.push(LineNumber::deserialize(&mut reader)?);
                    }
                    SubAttribute::LineNumbers
                }
                SubAttribute::VARIABLES | SubAttribute::VARIABLE_TYPES => {
                    let types = attribute.name == SubAttribute::VARIABLE_TYPES;
                    let mut reader = Cursor::new(&attribute.info[..]);
                    let count = u16::deserialize(&mut reader)?;
                    for _ in 0..count {
                        let entry = LocalVariable::<u32>::deserialize(&mut reader, pool)?;
                        if types {
                            raw.variable_types.push(entry);
                        } else {
                            raw.variables.push(entry);
                        }
                    }
                    if types {
                        SubAttribute::VariableTypes
                    } else {
                        SubAttribute::Variables
                    }
                }
                _ => {
                    pool.mark_order_significant();
                    SubAttribute::Opaque(attribute)
                }
            };
            if !sub_attributes.contains(&sub) {
                sub_attributes.push(sub);
            }
        }

        Ok(CodeAttribute {
            state: CodeState::Loaded,
            max_stack,
            max_locals,
            raw,
            loaded_frame: Some((max_stack, max_locals)),
            sub_attributes,
            ..CodeAttribute::new(parameters)
        })
    }

    /// Pool used to disassemble loaded code
    pub(crate) fn attach_pool(&mut self, pool: Rc<ConstantPool>) {
        self.pool = Some(pool);
    }

    /// Drop the reference to the pool the code was loaded with
    pub(crate) fn detach_pool(&mut self) {
        self.pool = None;
    }

    /// Clear the modification flag (after the enclosing class has been written out)
    pub(crate) fn mark_saved(&mut self) {
        self.modified = false;
    }

    /// Write the body of the `Code` attribute
    pub(crate) fn write_info<W: WriteBytesExt>(
        &self,
        pool: &ConstantPool,
        writer: &mut W,
    ) -> Result<(), Error> {
        self.expect_state("write", &[CodeState::Loaded, CodeState::Assembled])?;
        self.max_stack.serialize(writer)?;
        self.max_locals.serialize(writer)?;
        (self.raw.code.len() as u32).serialize(writer)?;
        writer.write_all(&self.raw.code)?;

        (self.raw.exception_table.len() as u16).serialize(writer)?;
        for handler in &self.raw.exception_table {
            handler.assemble(pool, writer)?;
        }

        (self.sub_attributes.len() as u16).serialize(writer)?;
        for sub in &self.sub_attributes {
            let (name, info) = match sub {
                SubAttribute::LineNumbers => {
                    let mut info = vec![];
                    (self.raw.line_numbers.len() as u16).serialize(&mut info)?;
                    for entry in &self.raw.line_numbers {
                        entry.serialize(&mut info)?;
                    }
                    (SubAttribute::LINE_NUMBERS, info)
                }
                SubAttribute::Variables | SubAttribute::VariableTypes => {
                    let (name, entries) = if *sub == SubAttribute::Variables {
                        (SubAttribute::VARIABLES, &self.raw.variables)
                    } else {
                        (SubAttribute::VARIABLE_TYPES, &self.raw.variable_types)
                    };
                    let mut info = vec![];
                    (entries.len() as u16).serialize(&mut info)?;
                    for entry in entries {
                        entry.assemble(pool, &mut info)?;
                    }
                    (name, info)
                }
                SubAttribute::Opaque(raw) => {
                    raw.write(pool, writer)?;
                    continue;
                }
            };
            RawAttribute {
                name: String::from(name),
                info,
            }
            .write(pool, writer)?;
        }
        Ok(())
    }
}
