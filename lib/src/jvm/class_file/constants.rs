use crate::jvm::binary_format::read_bytes;
use crate::jvm::{Deserialize, Error, Serialize};
use crate::util::{Offset, OffsetVec, Width};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::result::Result;

/// Constant in the constant pool
///
/// Constants are structural: references to other constants are held by value rather than by
/// index, so two constants are equal exactly when they would denote the same thing in a class
/// file. Indices only exist relative to a particular [`ConstantPool`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Constant {
    Utf8(String),

    /// `Utf8` entry with unpaired surrogates, which a Rust string cannot hold
    ///
    /// The contents are kept as UTF-16 code units. Build these with [`Constant::utf8_units`], which
    /// falls back to [`Constant::Utf8`] for valid text, so that equal contents are equal constants.
    Utf8Units(Vec<u16>),
    Integer(i32),

    /// Raw IEEE 754 bits, so that equality is bitwise (`NaN`s and `-0.0` intern separately)
    Float(u32),
    Long(i64),

    /// Raw IEEE 754 bits
    Double(u64),

    /// Class, interface, or array type, in internal form (eg. `java/lang/Object` or `[I`)
    Class(String),
    String(String),

    /// `String` whose contents have unpaired surrogates (see [`Constant::Utf8Units`])
    StringUnits(Vec<u16>),
    FieldRef(MemberRef),
    MethodRef(MemberRef),
    InterfaceMethodRef(MemberRef),
    NameAndType(NameAndType),

    /// Method handle
    ///
    /// Depending on the kind, the member is a `FieldRef`, `MethodRef`, or `InterfaceMethodRef`.
    MethodHandle {
        kind: HandleKind,
        member: Box<Constant>,
    },
    MethodType(String),

    /// Dynamically-computed constant
    Dynamic {
        /// Index into the `BootstrapMethods` attribute
        bootstrap_method: u16,
        name_and_type: NameAndType,
    },

    /// Dynamically-computed call site
    InvokeDynamic {
        /// Index into the `BootstrapMethods` attribute
        bootstrap_method: u16,
        name_and_type: NameAndType,
    },
    Module(String),
    Package(String),
}

/// Reference to a field or method of some class
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberRef {
    pub class: String,
    pub name: String,
    pub descriptor: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NameAndType {
    pub name: String,
    pub descriptor: String,
}

impl Constant {
    pub fn utf8(string: impl Into<String>) -> Constant {
        Constant::Utf8(string.into())
    }

    /// `Utf8` constant from UTF-16 code units, which need not be valid UTF-16
    pub fn utf8_units(units: Vec<u16>) -> Constant {
        match String::from_utf16(&units) {
            Ok(string) => Constant::Utf8(string),
            Err(_) => Constant::Utf8Units(units),
        }
    }

    pub fn class(name: impl Into<String>) -> Constant {
        Constant::Class(name.into())
    }

    pub fn string(string: impl Into<String>) -> Constant {
        Constant::String(string.into())
    }

    /// `String` constant from UTF-16 code units, which need not be valid UTF-16
    pub fn string_units(units: Vec<u16>) -> Constant {
        match String::from_utf16(&units) {
            Ok(string) => Constant::String(string),
            Err(_) => Constant::StringUnits(units),
        }
    }

    pub fn float(float: f32) -> Constant {
        Constant::Float(float.to_bits())
    }

    pub fn double(double: f64) -> Constant {
        Constant::Double(double.to_bits())
    }

    pub fn field_ref(
        class: impl Into<String>,
        name: impl Into<String>,
        descriptor: impl Into<String>,
    ) -> Constant {
        Constant::FieldRef(MemberRef {
            class: class.into(),
            name: name.into(),
            descriptor: descriptor.into(),
        })
    }

    pub fn method_ref(
        class: impl Into<String>,
        name: impl Into<String>,
        descriptor: impl Into<String>,
    ) -> Constant {
        Constant::MethodRef(MemberRef {
            class: class.into(),
            name: name.into(),
            descriptor: descriptor.into(),
        })
    }

    pub fn interface_method_ref(
        class: impl Into<String>,
        name: impl Into<String>,
        descriptor: impl Into<String>,
    ) -> Constant {
        Constant::InterfaceMethodRef(MemberRef {
            class: class.into(),
            name: name.into(),
            descriptor: descriptor.into(),
        })
    }

    /// Tag byte used in the binary format
    pub fn tag(&self) -> u8 {
        match self {
            Constant::Utf8(_) | Constant::Utf8Units(_) => 1,
            Constant::Integer(_) => 3,
            Constant::Float(_) => 4,
            Constant::Long(_) => 5,
            Constant::Double(_) => 6,
            Constant::Class(_) => 7,
            Constant::String(_) | Constant::StringUnits(_) => 8,
            Constant::FieldRef(_) => 9,
            Constant::MethodRef(_) => 10,
            Constant::InterfaceMethodRef(_) => 11,
            Constant::NameAndType(_) => 12,
            Constant::MethodHandle { .. } => 15,
            Constant::MethodType(_) => 16,
            Constant::Dynamic { .. } => 17,
            Constant::InvokeDynamic { .. } => 18,
            Constant::Module(_) => 19,
            Constant::Package(_) => 20,
        }
    }

    /// Position of this kind of constant in a sorted pool
    ///
    /// Constants loadable with a one-byte `ldc` index come first.
    fn sort_rank(&self) -> u8 {
        match self {
            Constant::String(_) | Constant::StringUnits(_) => 0,
            Constant::Integer(_) => 1,
            Constant::Float(_) => 2,
            Constant::Class(_) => 3,
            Constant::MethodType(_) => 4,
            Constant::MethodHandle { .. } => 5,
            Constant::Dynamic { .. } => 6,
            Constant::Long(_) => 7,
            Constant::Double(_) => 8,
            Constant::FieldRef(_) => 9,
            Constant::MethodRef(_) => 10,
            Constant::InterfaceMethodRef(_) => 11,
            Constant::InvokeDynamic { .. } => 12,
            Constant::NameAndType(_) => 13,
            Constant::Module(_) => 14,
            Constant::Package(_) => 15,
            Constant::Utf8(_) | Constant::Utf8Units(_) => 16,
        }
    }

    /// Can this be pushed onto the stack with `ldc`/`ldc_w`?
    pub fn is_single_word_loadable(&self) -> bool {
        match self {
            Constant::Integer(_)
            | Constant::Float(_)
            | Constant::Class(_)
            | Constant::String(_)
            | Constant::StringUnits(_)
            | Constant::MethodHandle { .. }
            | Constant::MethodType(_) => true,
            Constant::Dynamic { name_and_type, .. } => {
                !matches!(name_and_type.descriptor.as_str(), "J" | "D")
            }
            _ => false,
        }
    }

    /// Can this be pushed onto the stack with `ldc2_w`?
    pub fn is_double_word_loadable(&self) -> bool {
        match self {
            Constant::Long(_) | Constant::Double(_) => true,
            Constant::Dynamic { name_and_type, .. } => {
                matches!(name_and_type.descriptor.as_str(), "J" | "D")
            }
            _ => false,
        }
    }

    /// Constants that must be in the pool for this constant to be serialized
    fn nested(&self) -> Vec<Constant> {
        match self {
            Constant::Utf8(_)
            | Constant::Utf8Units(_)
            | Constant::Integer(_)
            | Constant::Float(_)
            | Constant::Long(_)
            | Constant::Double(_) => vec![],
            Constant::Class(name)
            | Constant::String(name)
            | Constant::MethodType(name)
            | Constant::Module(name)
            | Constant::Package(name) => vec![Constant::Utf8(name.clone())],
            Constant::StringUnits(units) => vec![Constant::utf8_units(units.clone())],
            Constant::FieldRef(member)
            | Constant::MethodRef(member)
            | Constant::InterfaceMethodRef(member) => vec![
                Constant::Class(member.class.clone()),
                Constant::NameAndType(NameAndType {
                    name: member.name.clone(),
                    descriptor: member.descriptor.clone(),
                }),
            ],
            Constant::NameAndType(nat) => vec![
                Constant::Utf8(nat.name.clone()),
                Constant::Utf8(nat.descriptor.clone()),
            ],
            Constant::MethodHandle { member, .. } => vec![(**member).clone()],
            Constant::Dynamic { name_and_type, .. }
            | Constant::InvokeDynamic { name_and_type, .. } => {
                vec![Constant::NameAndType(name_and_type.clone())]
            }
        }
    }

    /// Write out the tagged record, with references to other constants given by `links`
    fn serialize_into<W: WriteBytesExt>(
        &self,
        links: &[u16],
        writer: &mut W,
    ) -> Result<(), Error> {
        self.tag().serialize(writer)?;
        match self {
            Constant::Utf8(string) => write_utf8(&encode_modified_utf8(string), writer)?,
            Constant::Utf8Units(units) => {
                write_utf8(&encode_modified_utf8_units(units), writer)?
            }
            Constant::Integer(integer) => integer.serialize(writer)?,
            Constant::Float(bits) => bits.serialize(writer)?,
            Constant::Long(long) => long.serialize(writer)?,
            Constant::Double(bits) => bits.serialize(writer)?,
            Constant::MethodHandle { kind, .. } => kind.serialize(writer)?,
            Constant::Dynamic {
                bootstrap_method, ..
            }
            | Constant::InvokeDynamic {
                bootstrap_method, ..
            } => bootstrap_method.serialize(writer)?,
            _ => (),
        }
        for link in links {
            link.serialize(writer)?;
        }
        Ok(())
    }
}

fn write_utf8<W: WriteBytesExt>(buffer: &[u8], writer: &mut W) -> Result<(), Error> {
    (buffer.len() as u16).serialize(writer)?;
    writer.write_all(buffer)?;
    Ok(())
}

impl Width for Constant {
    fn width(&self) -> usize {
        match self {
            Constant::Long(_) | Constant::Double(_) => 2,
            _ => 1,
        }
    }
}

/// Method handle kinds
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-5.html#jvms-5.4.3.5
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HandleKind {
    GetField,
    GetStatic,
    PutField,
    PutStatic,
    InvokeVirtual,
    InvokeStatic,
    InvokeSpecial,
    NewInvokeSpecial,
    InvokeInterface,
}

impl HandleKind {
    fn from_byte(byte: u8) -> Result<HandleKind, Error> {
        Ok(match byte {
            1 => HandleKind::GetField,
            2 => HandleKind::GetStatic,
            3 => HandleKind::PutField,
            4 => HandleKind::PutStatic,
            5 => HandleKind::InvokeVirtual,
            6 => HandleKind::InvokeStatic,
            7 => HandleKind::InvokeSpecial,
            8 => HandleKind::NewInvokeSpecial,
            9 => HandleKind::InvokeInterface,
            other => return Err(Error::InvalidHandleKind(other)),
        })
    }
}

impl Serialize for HandleKind {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        let byte: u8 = match self {
            HandleKind::GetField => 1,
            HandleKind::GetStatic => 2,
            HandleKind::PutField => 3,
            HandleKind::PutStatic => 4,
            HandleKind::InvokeVirtual => 5,
            HandleKind::InvokeStatic => 6,
            HandleKind::InvokeSpecial => 7,
            HandleKind::NewInvokeSpecial => 8,
            HandleKind::InvokeInterface => 9,
        };
        byte.serialize(writer)
    }
}

/// Constant pool
///
/// Registering a constant is idempotent: structurally equal constants share one index. A pool
/// read from a class file may contain duplicates, in which case lookups find the first one.
/// Constants read from a class file still point at exactly the entries they pointed at there,
/// duplicates included.
///
/// Once an attribute the library does not understand has been read against this pool, the
/// pool is "order significant": the attribute's bytes may contain indices, so existing
/// constants must keep their positions.
#[derive(Clone, Debug)]
pub struct ConstantPool {
    constants: OffsetVec<Constant>,
    indices: HashMap<Constant, u16>,

    /// References of constants read from a class file, as they were read
    links: HashMap<u16, Vec<u16>>,
    order_significant: bool,
}

impl Default for ConstantPool {
    fn default() -> Self {
        ConstantPool::new()
    }
}

impl ConstantPool {
    /// Make a fresh empty constants pool
    pub fn new() -> ConstantPool {
        ConstantPool {
            constants: OffsetVec::new_starting_at(Offset(1)),
            indices: HashMap::new(),
            links: HashMap::new(),
            order_significant: false,
        }
    }

    /// Number of constants (not indices: wide constants count once)
    pub fn len(&self) -> usize {
        self.constants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constants.is_empty()
    }

    /// Add a constant (and everything it refers to) if it isn't already present
    pub fn register(&mut self, constant: &Constant) -> Result<u16, Error> {
        if let Some(idx) = self.indices.get(constant) {
            return Ok(*idx);
        }
        for nested in constant.nested() {
            self.register(&nested)?;
        }
        let idx = self.push_constant(constant.clone())?;
        self.indices.insert(constant.clone(), idx);
        Ok(idx)
    }

    pub fn find(&self, constant: &Constant) -> Option<u16> {
        self.indices.get(constant).copied()
    }

    /// Like [`ConstantPool::find`], but a missing constant is an error
    pub fn index_of(&self, constant: &Constant) -> Result<u16, Error> {
        self.find(constant)
            .ok_or_else(|| Error::MissingConstant(constant.clone()))
    }

    /// Look up the constant at an index
    ///
    /// Index 0, indices past the end, and the unusable index after a wide constant are all
    /// absent.
    pub fn get(&self, index: u16) -> Option<&Constant> {
        self.constants.get_offset(Offset(index as usize))
    }

    /// Look up a `Utf8` constant
    pub fn utf8_at(&self, index: u16) -> Result<&str, Error> {
        match self.get(index) {
            Some(Constant::Utf8(string)) => Ok(string),
            Some(_) => Err(Error::UnexpectedConstant {
                index,
                expected: "Utf8",
            }),
            None => Err(Error::InvalidConstantIndex(index)),
        }
    }

    /// Look up a `Class` constant, returning the class name
    pub fn class_at(&self, index: u16) -> Result<&str, Error> {
        match self.get(index) {
            Some(Constant::Class(name)) => Ok(name),
            Some(_) => Err(Error::UnexpectedConstant {
                index,
                expected: "Class",
            }),
            None => Err(Error::InvalidConstantIndex(index)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &Constant)> {
        self.constants
            .iter()
            .map(|(offset, _, constant)| (offset.0 as u16, constant))
    }

    pub fn is_order_significant(&self) -> bool {
        self.order_significant
    }

    pub fn mark_order_significant(&mut self) {
        if !self.order_significant {
            log::debug!("Constant pool marked as order significant");
            self.order_significant = true;
        }
    }

    /// Renumber the constants, grouped by kind and ordered by value within a kind
    ///
    /// Any index obtained before sorting is invalidated.
    pub fn sort(&mut self) -> Result<(), Error> {
        if self.order_significant {
            return Err(Error::PoolOrderSignificant);
        }

        let mut constants: Vec<Constant> = self.indices.keys().cloned().collect();
        constants.sort_by(|c1, c2| {
            c1.sort_rank()
                .cmp(&c2.sort_rank())
                .then_with(|| c1.cmp(c2))
        });

        self.constants.clear();
        self.indices.clear();
        self.links.clear();
        for constant in constants {
            let idx = self.push_constant(constant.clone())?;
            self.indices.insert(constant, idx);
        }
        Ok(())
    }

    /// Push a constant into the constant pool, provided there is space for it
    ///
    /// Note: the pool count is a `u16` one greater than the largest index, indexing starts at 1,
    /// and some constants take two spaces.
    fn push_constant(&mut self, constant: Constant) -> Result<u16, Error> {
        let offset: usize = self.constants.offset_len().0;
        if offset + constant.width() > u16::MAX as usize {
            return Err(Error::ConstantPoolOverflow { constant, offset });
        }

        self.constants.push(constant);
        Ok(offset as u16)
    }

    pub fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<(), Error> {
        (self.constants.offset_len().0 as u16).serialize(writer)?;
        for (offset, _, constant) in &self.constants {
            let links = match self.links.get(&(offset.0 as u16)) {
                Some(links) => links.clone(),
                None => constant
                    .nested()
                    .iter()
                    .map(|nested| self.index_of(nested))
                    .collect::<Result<Vec<u16>, Error>>()?,
            };
            constant.serialize_into(&links, writer)?;
        }
        Ok(())
    }

    pub fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<ConstantPool, Error> {
        let count = u16::deserialize(reader)?;

        // First pass: records exactly as they appear, with indices unresolved
        let mut raws: Vec<Option<RawConstant>> = vec![None; count.max(1) as usize];
        let mut index: u32 = 1;
        while index < count as u32 {
            let raw = RawConstant::deserialize(reader, index as u16)?;
            let width = raw.width() as u32;
            raws[index as usize] = Some(raw);
            index += width;
        }
        if index > count.max(1) as u32 {
            // A wide constant was the last entry and spilled past the count
            return Err(Error::InvalidConstantIndex(count));
        }

        // Second pass: resolve references
        let resolver = Resolver { raws: &raws };
        let mut pool = ConstantPool::new();
        let mut index: usize = 1;
        while index < raws.len() {
            let constant = resolver.resolve(index as u16)?;
            let width = constant.width();
            let idx = pool.push_constant(constant.clone())?;
            pool.indices.entry(constant).or_insert(idx);
            if let Some(raw) = &raws[index] {
                let links = raw.links();
                if !links.is_empty() {
                    pool.links.insert(idx, links);
                }
            }
            index += width;
        }
        Ok(pool)
    }
}

/// Constant as it appears in the class file, with references still given by index
#[derive(Clone, Debug)]
enum RawConstant {
    Utf8(Vec<u16>),
    Integer(i32),
    Float(u32),
    Long(i64),
    Double(u64),
    Class(u16),
    String(u16),
    FieldRef(u16, u16),
    MethodRef(u16, u16),
    InterfaceMethodRef(u16, u16),
    NameAndType(u16, u16),
    MethodHandle(HandleKind, u16),
    MethodType(u16),
    Dynamic(u16, u16),
    InvokeDynamic(u16, u16),
    Module(u16),
    Package(u16),
}

impl RawConstant {
    fn width(&self) -> usize {
        match self {
            RawConstant::Long(_) | RawConstant::Double(_) => 2,
            _ => 1,
        }
    }

    /// Indices of the constants this one refers to, in the order they are written
    fn links(&self) -> Vec<u16> {
        match self {
            RawConstant::Utf8(_)
            | RawConstant::Integer(_)
            | RawConstant::Float(_)
            | RawConstant::Long(_)
            | RawConstant::Double(_) => vec![],
            RawConstant::Class(index)
            | RawConstant::String(index)
            | RawConstant::MethodHandle(_, index)
            | RawConstant::MethodType(index)
            | RawConstant::Dynamic(_, index)
            | RawConstant::InvokeDynamic(_, index)
            | RawConstant::Module(index)
            | RawConstant::Package(index) => vec![*index],
            RawConstant::FieldRef(first, second)
            | RawConstant::MethodRef(first, second)
            | RawConstant::InterfaceMethodRef(first, second)
            | RawConstant::NameAndType(first, second) => vec![*first, *second],
        }
    }

    fn deserialize<R: ReadBytesExt>(reader: &mut R, index: u16) -> Result<RawConstant, Error> {
        let tag = u8::deserialize(reader)?;
        Ok(match tag {
            1 => {
                let len = u16::deserialize(reader)?;
                let bytes = read_bytes(reader, len as usize)?;
                RawConstant::Utf8(decode_modified_utf8_units(&bytes)?)
            }
            3 => RawConstant::Integer(i32::deserialize(reader)?),
            4 => RawConstant::Float(u32::deserialize(reader)?),
            5 => RawConstant::Long(i64::deserialize(reader)?),
            6 => RawConstant::Double(u64::deserialize(reader)?),
            7 => RawConstant::Class(u16::deserialize(reader)?),
            8 => RawConstant::String(u16::deserialize(reader)?),
            9 => RawConstant::FieldRef(u16::deserialize(reader)?, u16::deserialize(reader)?),
            10 => RawConstant::MethodRef(u16::deserialize(reader)?, u16::deserialize(reader)?),
            11 => RawConstant::InterfaceMethodRef(
                u16::deserialize(reader)?,
                u16::deserialize(reader)?,
            ),
            12 => RawConstant::NameAndType(u16::deserialize(reader)?, u16::deserialize(reader)?),
            15 => RawConstant::MethodHandle(
                HandleKind::from_byte(u8::deserialize(reader)?)?,
                u16::deserialize(reader)?,
            ),
            16 => RawConstant::MethodType(u16::deserialize(reader)?),
            17 => RawConstant::Dynamic(u16::deserialize(reader)?, u16::deserialize(reader)?),
            18 => RawConstant::InvokeDynamic(u16::deserialize(reader)?, u16::deserialize(reader)?),
            19 => RawConstant::Module(u16::deserialize(reader)?),
            20 => RawConstant::Package(u16::deserialize(reader)?),
            tag => return Err(Error::InvalidConstantTag { tag, index }),
        })
    }
}

/// Turns raw constants into structural ones
///
/// Every reference must point at a specific kind of constant, and those kinds only nest a few
/// levels deep, so resolution always terminates.
struct Resolver<'a> {
    raws: &'a [Option<RawConstant>],
}

impl<'a> Resolver<'a> {
    fn raw(&self, index: u16) -> Result<&'a RawConstant, Error> {
        self.raws
            .get(index as usize)
            .and_then(|raw| raw.as_ref())
            .ok_or(Error::InvalidConstantIndex(index))
    }

    fn units(&self, index: u16) -> Result<&'a [u16], Error> {
        match self.raw(index)? {
            RawConstant::Utf8(units) => Ok(units),
            _ => Err(Error::UnexpectedConstant {
                index,
                expected: "Utf8",
            }),
        }
    }

    /// Contents of a `Utf8` used as a name or descriptor, which must be valid text
    fn utf8(&self, index: u16) -> Result<String, Error> {
        String::from_utf16(self.units(index)?).map_err(|_| Error::MalformedModifiedUtf8)
    }

    fn class(&self, index: u16) -> Result<String, Error> {
        match self.raw(index)? {
            RawConstant::Class(name) => self.utf8(*name),
            _ => Err(Error::UnexpectedConstant {
                index,
                expected: "Class",
            }),
        }
    }

    fn name_and_type(&self, index: u16) -> Result<NameAndType, Error> {
        match self.raw(index)? {
            RawConstant::NameAndType(name, descriptor) => Ok(NameAndType {
                name: self.utf8(*name)?,
                descriptor: self.utf8(*descriptor)?,
            }),
            _ => Err(Error::UnexpectedConstant {
                index,
                expected: "NameAndType",
            }),
        }
    }

    fn member(&self, class: u16, name_and_type: u16) -> Result<MemberRef, Error> {
        let nat = self.name_and_type(name_and_type)?;
        Ok(MemberRef {
            class: self.class(class)?,
            name: nat.name,
            descriptor: nat.descriptor,
        })
    }

    fn resolve(&self, index: u16) -> Result<Constant, Error> {
        Ok(match self.raw(index)? {
            RawConstant::Utf8(units) => Constant::utf8_units(units.clone()),
            RawConstant::Integer(integer) => Constant::Integer(*integer),
            RawConstant::Float(bits) => Constant::Float(*bits),
            RawConstant::Long(long) => Constant::Long(*long),
            RawConstant::Double(bits) => Constant::Double(*bits),
            RawConstant::Class(name) => Constant::Class(self.utf8(*name)?),
            RawConstant::String(string) => Constant::string_units(self.units(*string)?.to_vec()),
            RawConstant::FieldRef(class, nat) => Constant::FieldRef(self.member(*class, *nat)?),
            RawConstant::MethodRef(class, nat) => Constant::MethodRef(self.member(*class, *nat)?),
            RawConstant::InterfaceMethodRef(class, nat) => {
                Constant::InterfaceMethodRef(self.member(*class, *nat)?)
            }
            RawConstant::NameAndType(_, _) => Constant::NameAndType(self.name_and_type(index)?),
            RawConstant::MethodHandle(kind, member) => {
                let member_constant = match self.raw(*member)? {
                    RawConstant::FieldRef(..)
                    | RawConstant::MethodRef(..)
                    | RawConstant::InterfaceMethodRef(..) => self.resolve(*member)?,
                    _ => {
                        return Err(Error::UnexpectedConstant {
                            index: *member,
                            expected: "member reference",
                        })
                    }
                };
                Constant::MethodHandle {
                    kind: *kind,
                    member: Box::new(member_constant),
                }
            }
            RawConstant::MethodType(descriptor) => Constant::MethodType(self.utf8(*descriptor)?),
            RawConstant::Dynamic(bootstrap_method, nat) => Constant::Dynamic {
                bootstrap_method: *bootstrap_method,
                name_and_type: self.name_and_type(*nat)?,
            },
            RawConstant::InvokeDynamic(bootstrap_method, nat) => Constant::InvokeDynamic {
                bootstrap_method: *bootstrap_method,
                name_and_type: self.name_and_type(*nat)?,
            },
            RawConstant::Module(name) => Constant::Module(self.utf8(*name)?),
            RawConstant::Package(name) => Constant::Package(self.utf8(*name)?),
        })
    }
}

/// Encode a string in the modified UTF-8 format used by the JVM
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-4.html#jvms-4.4.7
pub fn encode_modified_utf8(string: &str) -> Vec<u8> {
    let units: Vec<u16> = string.encode_utf16().collect();
    encode_modified_utf8_units(&units)
}

/// Encode UTF-16 code units (paired or not) in modified UTF-8
///
/// Every unit is encoded on its own, so supplementary characters take two three-byte sequences
/// and `\u{0000}` takes two bytes.
pub fn encode_modified_utf8_units(units: &[u16]) -> Vec<u8> {
    let mut buffer: Vec<u8> = Vec::with_capacity(units.len());
    for &unit in units {
        match unit {
            0x0001..=0x007F => buffer.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                buffer.push((unit >> 6 & 0x1F) as u8 | 0b1100_0000);
                buffer.push((unit & 0x3F) as u8 | 0b1000_0000);
            }
            _ => {
                buffer.push((unit >> 12 & 0x0F) as u8 | 0b1110_0000);
                buffer.push((unit >> 6 & 0x3F) as u8 | 0b1000_0000);
                buffer.push((unit & 0x3F) as u8 | 0b1000_0000);
            }
        }
    }
    buffer
}

/// Decode the modified UTF-8 format used by the JVM
///
/// Unpaired surrogates are legal in modified UTF-8 but fail here. Use
/// [`decode_modified_utf8_units`] to accept them.
pub fn decode_modified_utf8(bytes: &[u8]) -> Result<String, Error> {
    let units = decode_modified_utf8_units(bytes)?;
    String::from_utf16(&units).map_err(|_| Error::MalformedModifiedUtf8)
}

/// Decode modified UTF-8 into UTF-16 code units, without requiring surrogates to be paired
pub fn decode_modified_utf8_units(bytes: &[u8]) -> Result<Vec<u16>, Error> {
    let continuation = |idx: usize| -> Result<u16, Error> {
        match bytes.get(idx) {
            Some(b) if b & 0b1100_0000 == 0b1000_0000 => Ok((b & 0x3F) as u16),
            _ => Err(Error::MalformedModifiedUtf8),
        }
    };

    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        let b = bytes[idx];
        if b == 0 {
            return Err(Error::MalformedModifiedUtf8);
        } else if b & 0b1000_0000 == 0 {
            units.push(b as u16);
            idx += 1;
        } else if b & 0b1110_0000 == 0b1100_0000 {
            units.push(((b & 0x1F) as u16) << 6 | continuation(idx + 1)?);
            idx += 2;
        } else if b & 0b1111_0000 == 0b1110_0000 {
            units.push(
                ((b & 0x0F) as u16) << 12 | continuation(idx + 1)? << 6 | continuation(idx + 2)?,
            );
            idx += 3;
        } else {
            return Err(Error::MalformedModifiedUtf8);
        }
    }
    Ok(units)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn registering_is_idempotent() {
        let mut pool = ConstantPool::new();
        let method = Constant::method_ref("java/lang/Object", "<init>", "()V");
        let idx1 = pool.register(&method).unwrap();
        let idx2 = pool.register(&method.clone()).unwrap();
        assert_eq!(idx1, idx2);
        assert_eq!(pool.get(idx1), Some(&method));

        // Class, NameAndType, and three Utf8s were registered along the way
        assert_eq!(pool.len(), 6);
        assert!(pool.find(&Constant::class("java/lang/Object")).is_some());
        assert!(pool.find(&Constant::utf8("()V")).is_some());
    }

    #[test]
    fn wide_constants_take_two_indices() {
        let mut pool = ConstantPool::new();
        let long = pool.register(&Constant::Long(1 << 40)).unwrap();
        let double = pool.register(&Constant::double(2.5)).unwrap();
        let int = pool.register(&Constant::Integer(7)).unwrap();
        assert_eq!((long, double, int), (1, 3, 5));

        assert_eq!(pool.get(long), Some(&Constant::Long(1 << 40)));
        assert_eq!(pool.get(2), None);
        assert_eq!(pool.get(double), Some(&Constant::double(2.5)));
        assert_eq!(pool.get(4), None);
        assert_eq!(pool.get(0), None);
        assert_eq!(pool.get(6), None);
        assert_eq!(pool.get(u16::MAX), None);
    }

    #[test]
    fn floats_intern_bitwise() {
        let mut pool = ConstantPool::new();
        let zero = pool.register(&Constant::float(0.0)).unwrap();
        let negative_zero = pool.register(&Constant::float(-0.0)).unwrap();
        let nan1 = pool.register(&Constant::float(f32::NAN)).unwrap();
        let nan2 = pool.register(&Constant::float(f32::NAN)).unwrap();
        assert_ne!(zero, negative_zero);
        assert_eq!(nan1, nan2);
    }

    #[test]
    fn sorting_groups_kinds() {
        let mut pool = ConstantPool::new();
        let method = Constant::method_ref("Foo", "bar", "(J)I");
        pool.register(&method).unwrap();
        pool.register(&Constant::Long(5)).unwrap();
        pool.register(&Constant::string("hello")).unwrap();
        pool.register(&Constant::Integer(3)).unwrap();
        pool.sort().unwrap();

        let kinds: Vec<u8> = pool.iter().map(|(_, c)| c.tag()).collect();
        assert_eq!(kinds, vec![8, 3, 7, 5, 10, 12, 1, 1, 1, 1]);
        assert_eq!(pool.find(&Constant::string("hello")), Some(1));
        assert_eq!(pool.find(&Constant::Long(5)), Some(4));
        assert_eq!(pool.find(&method), Some(6));
        assert_eq!(pool.get(pool.find(&method).unwrap()), Some(&method));

        pool.mark_order_significant();
        assert!(matches!(pool.sort(), Err(Error::PoolOrderSignificant)));
    }

    #[test]
    fn read_back_written_pool() {
        let mut pool = ConstantPool::new();
        let handle = Constant::MethodHandle {
            kind: HandleKind::InvokeStatic,
            member: Box::new(Constant::method_ref("A", "b", "()V")),
        };
        let indy = Constant::InvokeDynamic {
            bootstrap_method: 0,
            name_and_type: NameAndType {
                name: String::from("run"),
                descriptor: String::from("()Ljava/lang/Runnable;"),
            },
        };
        for constant in [&handle, &indy, &Constant::double(1.5), &Constant::utf8("\u{0}é😀")] {
            pool.register(constant).unwrap();
        }

        let mut buffer = vec![];
        pool.serialize(&mut buffer).unwrap();
        let read = ConstantPool::deserialize(&mut Cursor::new(&buffer[..])).unwrap();
        assert_eq!(
            read.iter().collect::<Vec<_>>(),
            pool.iter().collect::<Vec<_>>()
        );
        assert_eq!(read.find(&handle), pool.find(&handle));

        let mut buffer2 = vec![];
        read.serialize(&mut buffer2).unwrap();
        assert_eq!(buffer, buffer2);
    }

    #[test]
    fn duplicates_are_preserved_on_read() {
        // count = 4: two identical Utf8 entries and a Class pointing at the second one
        let bytes = [0, 4, 1, 0, 1, b'A', 1, 0, 1, b'A', 7, 0, 2];
        let pool = ConstantPool::deserialize(&mut Cursor::new(&bytes[..])).unwrap();
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.find(&Constant::utf8("A")), Some(1));
        assert_eq!(pool.get(2), Some(&Constant::utf8("A")));
        assert_eq!(pool.get(3), Some(&Constant::class("A")));

        let mut written = vec![];
        pool.serialize(&mut written).unwrap();
        assert_eq!(written, bytes);
    }

    #[test]
    fn references_to_duplicates_are_kept() {
        // #2 and #3 are the same class, and the method reference goes through #3
        let bytes = [
            0, 8, //
            1, 0, 1, b'A', //
            7, 0, 1, //
            7, 0, 1, //
            1, 0, 1, b'm', //
            1, 0, 3, b'(', b')', b'V', //
            12, 0, 4, 0, 5, //
            10, 0, 3, 0, 6,
        ];
        let mut pool = ConstantPool::deserialize(&mut Cursor::new(&bytes[..])).unwrap();
        let method = Constant::method_ref("A", "m", "()V");
        assert_eq!(pool.find(&method), Some(7));
        assert_eq!(pool.find(&Constant::class("A")), Some(2));

        // Constants added later refer to the first copy
        let field = pool.register(&Constant::field_ref("A", "m", "I")).unwrap();
        let mut written = vec![];
        pool.serialize(&mut written).unwrap();
        assert_eq!(&written[2..bytes.len()], &bytes[2..]);
        let read = ConstantPool::deserialize(&mut Cursor::new(&written[..])).unwrap();
        assert_eq!(read.get(7), Some(&method));
        assert_eq!(read.get(field), pool.get(field));
        let field_record = &written[written.len() - 5..];
        assert_eq!(field_record[..3], [9, 0, 2]);
    }

    #[test]
    fn unpaired_surrogates_are_kept() {
        // Utf8 "\u{d800} x" and a String pointing at it
        let bytes = [0, 3, 1, 0, 5, 0xed, 0xa0, 0x80, b' ', b'x', 8, 0, 1];
        let pool = ConstantPool::deserialize(&mut Cursor::new(&bytes[..])).unwrap();
        let units: Vec<u16> = vec![0xd800, b' ' as u16, b'x' as u16];
        assert_eq!(pool.get(1), Some(&Constant::Utf8Units(units.clone())));
        assert_eq!(pool.get(2), Some(&Constant::StringUnits(units.clone())));
        let mut written = vec![];
        pool.serialize(&mut written).unwrap();
        assert_eq!(written, bytes);

        let mut fresh = ConstantPool::new();
        let string = Constant::string_units(units.clone());
        let idx = fresh.register(&string).unwrap();
        assert_eq!(fresh.get(idx), Some(&string));
        assert_eq!(fresh.register(&string).unwrap(), idx);
        assert_eq!(fresh.find(&Constant::Utf8Units(units)), Some(1));

        // Valid text always ends up as a plain string
        assert_eq!(
            Constant::utf8_units("hé".encode_utf16().collect()),
            Constant::utf8("hé")
        );

        // Names still have to be valid text
        let class_name = [0, 3, 1, 0, 3, 0xed, 0xa0, 0x80, 7, 0, 1];
        assert!(matches!(
            ConstantPool::deserialize(&mut Cursor::new(&class_name[..])),
            Err(Error::MalformedModifiedUtf8)
        ));
    }

    #[test]
    fn malformed_pools() {
        let bad_tag = [0, 2, 2, 0, 0];
        assert!(matches!(
            ConstantPool::deserialize(&mut Cursor::new(&bad_tag[..])),
            Err(Error::InvalidConstantTag { tag: 2, index: 1 })
        ));

        let class_to_int = [0, 3, 3, 0, 0, 0, 1, 7, 0, 1];
        assert!(matches!(
            ConstantPool::deserialize(&mut Cursor::new(&class_to_int[..])),
            Err(Error::UnexpectedConstant { index: 1, .. })
        ));

        let truncated = [0, 2, 1, 0, 5, b'a'];
        assert!(matches!(
            ConstantPool::deserialize(&mut Cursor::new(&truncated[..])),
            Err(Error::IoError(_))
        ));
    }

    #[test]
    fn encode_containing_null_byte() {
        assert_eq!(encode_modified_utf8("a\x00a"), vec![97, 192, 128, 97]);
    }

    #[test]
    fn encode_two_and_three_byte_encodings() {
        assert_eq!(
            encode_modified_utf8("ĄǍǞǠǺȀȂȦȺӐӒ"),
            vec![
                196, 132, 199, 141, 199, 158, 199, 160, 199, 186, 200, 128, 200, 130, 200, 166,
                200, 186, 211, 144, 211, 146
            ]
        );
    }

    #[test]
    fn decode_modified_utf8_strings() {
        for string in ["", "foo", "a\x00a", "ĄǍǞ", "\u{FFFF}", "😀 grin"] {
            assert_eq!(
                decode_modified_utf8(&encode_modified_utf8(string)).unwrap(),
                string
            );
        }
        assert!(decode_modified_utf8(&[0]).is_err());
        assert!(decode_modified_utf8(&[0xC0]).is_err());
        assert!(decode_modified_utf8(&[0xF0, 0x80, 0x80, 0x80]).is_err());

        // Lone surrogate
        assert!(decode_modified_utf8(&[0xED, 0xA0, 0x80]).is_err());
    }
}
