use super::{BranchInstruction, Instruction};
use crate::jvm::descriptors::{BaseType, FieldType, ParseDescriptor};
use crate::jvm::Error;
use crate::util::Width;
use std::fmt;
use std::ops::{Index, IndexMut};

/// Handle to a node in an [`Ops`] arena
///
/// Ids are only meaningful for the arena that created them.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct OpId(pub(crate) usize);

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Type of a local variable, as far as loads, stores, and slot widths are concerned
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum VarType {
    Int,
    Long,
    Float,
    Double,
    Reference,

    /// Return address of a subroutine, stored by `astore` and read by `ret`
    ReturnAddress,
}

impl Width for VarType {
    fn width(&self) -> usize {
        match self {
            VarType::Long | VarType::Double => 2,
            _ => 1,
        }
    }
}

impl VarType {
    pub fn from_field_type(field_type: &FieldType) -> VarType {
        match field_type {
            FieldType::Base(BaseType::Long) => VarType::Long,
            FieldType::Base(BaseType::Double) => VarType::Double,
            FieldType::Base(BaseType::Float) => VarType::Float,
            FieldType::Base(_) => VarType::Int,
            FieldType::Object(_) | FieldType::Array(_) => VarType::Reference,
        }
    }

    pub fn from_descriptor(descriptor: &str) -> Result<VarType, Error> {
        FieldType::parse(descriptor)
            .map(|field_type| VarType::from_field_type(&field_type))
            .map_err(|_| Error::BadDescriptor(descriptor.to_owned()))
    }

    fn letter(&self) -> char {
        match self {
            VarType::Int => 'i',
            VarType::Long => 'l',
            VarType::Float => 'f',
            VarType::Double => 'd',
            VarType::Reference => 'a',
            VarType::ReturnAddress => 'r',
        }
    }
}

/// Declaration of a local variable
///
/// A declaration is in scope from its position up to the `End` matching the innermost enclosing
/// `Begin`. Loads, stores, `iinc`, and `ret` refer to variables by the id of their declaration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Declaration {
    pub var_type: VarType,

    /// Absolute slot, or `None` to have one allocated relative to the scope during
    /// pre-assembly (never overlapping the parameters). Parameters are reached by declaring
    /// them at their slot.
    pub slot: Option<u16>,

    pub name: Option<String>,
    pub descriptor: Option<String>,

    /// Generic signature, for the local variable type table
    pub signature: Option<String>,
}

impl Declaration {
    /// Anonymous variable with a slot chosen during pre-assembly
    pub fn new(var_type: VarType) -> Declaration {
        Declaration {
            var_type,
            slot: None,
            name: None,
            descriptor: None,
            signature: None,
        }
    }

    /// Variable with debug information
    pub fn named(
        name: impl Into<String>,
        descriptor: impl Into<String>,
    ) -> Result<Declaration, Error> {
        let descriptor = descriptor.into();
        Ok(Declaration {
            var_type: VarType::from_descriptor(&descriptor)?,
            slot: None,
            name: Some(name.into()),
            descriptor: Some(descriptor),
            signature: None,
        })
    }

    pub fn at_slot(mut self, slot: u16) -> Declaration {
        self.slot = Some(slot);
        self
    }

    pub fn has_debug_info(&self) -> bool {
        self.name.is_some() && self.descriptor.is_some()
    }
}

/// Exception handler for a guarded section
///
/// The section starts at its `Try` and ends at the catch. Catches belonging to the same `Try`
/// must be placed after it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Catch {
    pub try_op: OpId,

    /// Class of exceptions caught, or `None` for all of them
    pub exception: Option<String>,

    /// Label where the handler starts
    pub handler: OpId,

    /// Position in the exception table this came from, if disassembled
    pub(crate) ordinal: Option<u32>,
}

impl Catch {
    pub fn new(try_op: OpId, exception: Option<String>, handler: OpId) -> Catch {
        Catch {
            try_op,
            exception,
            handler,
            ordinal: None,
        }
    }
}

/// Node in a method body
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    /// Jump target
    Label,

    /// Opens a variable scope
    Begin,

    /// Closes the innermost open variable scope
    End,

    Declare(Declaration),

    /// Start of a guarded section, along with its catches (in placement order)
    Try(Vec<OpId>),
    Catch(Catch),

    Insn(Instruction<OpId>),
    Branch(BranchInstruction<OpId, OpId>),
}

impl Op {
    /// Does this node turn into bytes?
    pub fn is_sized(&self) -> bool {
        matches!(self, Op::Insn(_) | Op::Branch(_))
    }
}

/// Node along with the bookkeeping the assembler and analyzers keep for it
#[derive(Clone, Debug)]
pub struct Node {
    pub op: Op,

    /// Source line, or 0 if unknown
    pub line: u16,

    /// Loaded code had a line table entry starting here, even if it repeats the previous line
    pub(crate) line_entry: bool,

    pub(crate) next: Option<OpId>,
    pub(crate) linked: bool,

    /// Code offset, valid after assembly (or disassembly)
    pub(crate) offset: u32,
    pub(crate) size: u32,

    /// Stack height on entry, if the verifier reached the node
    pub(crate) height: Option<u16>,
}

impl Node {
    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Stack height before the node executes (`None` if unreachable or not yet verified)
    pub fn stack_height(&self) -> Option<u16> {
        self.height
    }
}

/// Arena of nodes, threaded into a singly linked sequence
///
/// Nodes can be created before they are placed into the sequence (typically labels which are
/// jumped to before they are placed).
#[derive(Clone, Debug, Default)]
pub struct Ops {
    nodes: Vec<Node>,
    first: Option<OpId>,
    last: Option<OpId>,
}

impl Ops {
    pub fn new() -> Ops {
        Ops::default()
    }

    /// Allocate a node without placing it in the sequence
    pub fn create(&mut self, op: Op, line: u16) -> OpId {
        let id = OpId(self.nodes.len());
        self.nodes.push(Node {
            op,
            line,
            line_entry: false,
            next: None,
            linked: false,
            offset: 0,
            size: 0,
            height: None,
        });
        id
    }

    /// Append a created node to the end of the sequence
    pub fn place(&mut self, id: OpId) -> Result<(), Error> {
        self.check_placeable(id)?;
        match self.last {
            None => self.first = Some(id),
            Some(last) => self.nodes[last.0].next = Some(id),
        }
        self.last = Some(id);
        self.mark_linked(id);
        Ok(())
    }

    /// Put a created node at the very front of the sequence
    pub(crate) fn place_first(&mut self, id: OpId) -> Result<(), Error> {
        self.check_placeable(id)?;
        self.nodes[id.0].next = self.first;
        self.first = Some(id);
        if self.last.is_none() {
            self.last = Some(id);
        }
        self.mark_linked(id);
        Ok(())
    }

    fn check_placeable(&self, id: OpId) -> Result<(), Error> {
        let node = match self.nodes.get(id.0) {
            Some(node) if !node.linked => node,
            _ => return Err(Error::OpAlreadyPlaced(id)),
        };
        if let Op::Catch(catch) = &node.op {
            match self.nodes.get(catch.try_op.0).map(|node| &node.op) {
                Some(Op::Try(_)) => (),
                _ => return Err(Error::NotATry(catch.try_op)),
            }
        }
        Ok(())
    }

    fn mark_linked(&mut self, id: OpId) {
        self.nodes[id.0].linked = true;

        // Catches register with their guarded section
        if let Op::Catch(catch) = &self.nodes[id.0].op {
            let try_op = catch.try_op;
            if let Op::Try(catches) = &mut self.nodes[try_op.0].op {
                catches.push(id);
            }
        }
    }

    /// Remove the node following `prev` (or the first node) from the sequence
    pub(crate) fn unlink_after(&mut self, prev: Option<OpId>, id: OpId) {
        let next = self.nodes[id.0].next.take();
        match prev {
            None => self.first = next,
            Some(prev) => self.nodes[prev.0].next = next,
        }
        if self.last == Some(id) {
            self.last = prev;
        }
        self.nodes[id.0].linked = false;
    }

    pub fn get(&self, id: OpId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    pub fn get_mut(&mut self, id: OpId) -> Option<&mut Node> {
        self.nodes.get_mut(id.0)
    }

    pub fn first(&self) -> Option<OpId> {
        self.first
    }

    pub fn last(&self) -> Option<OpId> {
        self.last
    }

    pub fn next(&self, id: OpId) -> Option<OpId> {
        self.nodes.get(id.0).and_then(|node| node.next)
    }

    pub fn is_placed(&self, id: OpId) -> bool {
        self.nodes.get(id.0).map_or(false, |node| node.linked)
    }

    /// Number of allocated nodes (placed or not)
    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    /// Placed nodes, in sequence order
    pub fn iter(&self) -> OpsIter<'_> {
        OpsIter {
            ops: self,
            cursor: self.first,
        }
    }

    /// Declaration referred to by a variable operand
    pub fn declaration(&self, var: OpId) -> Result<&Declaration, Error> {
        match self.get(var).map(|node| &node.op) {
            Some(Op::Declare(decl)) => Ok(decl),
            _ => Err(Error::UnknownVariable(var)),
        }
    }

    /// Check that an operand refers to a label
    pub fn expect_label(&self, label: OpId) -> Result<OpId, Error> {
        match self.get(label).map(|node| &node.op) {
            Some(Op::Label) => Ok(label),
            _ => Err(Error::NotALabel(label)),
        }
    }

    /// Render the sequence, one node per line
    pub fn listing(&self) -> String {
        let mut out = String::new();
        let mut depth = 0usize;
        for id in self.iter() {
            let node = &self[id];
            if let Op::End = node.op {
                depth = depth.saturating_sub(1);
            }
            let offset = if node.op.is_sized() {
                format!("{:>5}", node.offset)
            } else {
                String::from("     ")
            };
            out.push_str(&format!("{} {:>5}  {}", offset, id, "  ".repeat(depth)));
            out.push_str(&self.render(id));
            out.push('\n');
            if let Op::Begin = node.op {
                depth += 1;
            }
        }
        out
    }

    /// Render a single node
    pub fn render(&self, id: OpId) -> String {
        let var_name = |var: &OpId| -> String {
            match self.declaration(*var) {
                Ok(decl) => match (&decl.name, decl.slot) {
                    (Some(name), _) => name.clone(),
                    (None, Some(slot)) => format!("{}{}", decl.var_type.letter(), slot),
                    (None, None) => format!("{}{}", decl.var_type.letter(), var),
                },
                Err(_) => format!("?{}", var),
            }
        };

        match &self[id].op {
            Op::Label => format!("{}:", id),
            Op::Begin => String::from("{"),
            Op::End => String::from("}"),
            Op::Declare(decl) => {
                let mut out = format!("var {}", var_name(&id));
                if let Some(descriptor) = &decl.descriptor {
                    out.push_str(&format!(" {}", descriptor));
                }
                if let Some(slot) = decl.slot {
                    out.push_str(&format!(" @{}", slot));
                }
                out
            }
            Op::Try(_) => String::from("try"),
            Op::Catch(catch) => format!(
                "catch {} {} -> {}",
                catch.try_op,
                catch.exception.as_deref().unwrap_or("*"),
                catch.handler
            ),
            Op::Insn(insn) => insn.map_vars(var_name).to_string(),
            Op::Branch(branch) => branch.map_labels(|lbl| *lbl, var_name).to_string(),
        }
    }
}

impl Index<OpId> for Ops {
    type Output = Node;

    fn index(&self, id: OpId) -> &Node {
        &self.nodes[id.0]
    }
}

impl IndexMut<OpId> for Ops {
    fn index_mut(&mut self, id: OpId) -> &mut Node {
        &mut self.nodes[id.0]
    }
}

pub struct OpsIter<'a> {
    ops: &'a Ops,
    cursor: Option<OpId>,
}

impl<'a> Iterator for OpsIter<'a> {
    type Item = OpId;

    fn next(&mut self) -> Option<OpId> {
        let current = self.cursor?;
        self.cursor = self.ops.next(current);
        Some(current)
    }
}
