//! Side tables of the `Code` attribute, in their raw (offset based) form

use crate::jvm::class_file::{Constant, ConstantPool};
use crate::jvm::{Deserialize, Error, Serialize};
use byteorder::{ReadBytesExt, WriteBytesExt};

/// Entry in the exception table
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExceptionHandler {
    /// Start of the guarded range (inclusive)
    pub start_pc: u16,

    /// End of the guarded range (exclusive)
    pub end_pc: u16,

    pub handler_pc: u16,

    /// Class of exceptions caught, or `None` for all of them (eg. `finally`)
    pub catch_type: Option<String>,
}

impl ExceptionHandler {
    pub fn deserialize<R: ReadBytesExt>(
        reader: &mut R,
        pool: &ConstantPool,
    ) -> Result<ExceptionHandler, Error> {
        let start_pc = u16::deserialize(reader)?;
        let end_pc = u16::deserialize(reader)?;
        let handler_pc = u16::deserialize(reader)?;
        let catch_type = match u16::deserialize(reader)? {
            0 => None,
            idx => Some(pool.class_at(idx)?.to_owned()),
        };
        Ok(ExceptionHandler {
            start_pc,
            end_pc,
            handler_pc,
            catch_type,
        })
    }

    pub fn assemble<W: WriteBytesExt>(
        &self,
        pool: &ConstantPool,
        writer: &mut W,
    ) -> Result<(), Error> {
        self.start_pc.serialize(writer)?;
        self.end_pc.serialize(writer)?;
        self.handler_pc.serialize(writer)?;
        match &self.catch_type {
            None => 0u16.serialize(writer)?,
            Some(class) => pool
                .index_of(&Constant::Class(class.clone()))?
                .serialize(writer)?,
        }
        Ok(())
    }
}

/// Entry in the `LineNumberTable` attribute
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LineNumber {
    pub start_pc: u16,
    pub line: u16,
}

impl Serialize for LineNumber {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.start_pc.serialize(writer)?;
        self.line.serialize(writer)
    }
}

impl Deserialize for LineNumber {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> std::io::Result<Self> {
        Ok(LineNumber {
            start_pc: u16::deserialize(reader)?,
            line: u16::deserialize(reader)?,
        })
    }
}

/// Entry in the `LocalVariableTable` or `LocalVariableTypeTable` attribute
///
/// The range is given by its start and its (exclusive) end: code offsets when raw, node ids
/// once the code has been disassembled. In a type table, `descriptor` holds the signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalVariable<L> {
    pub start: L,
    pub end: L,
    pub name: String,
    pub descriptor: String,
    pub slot: u16,
}

impl<L> LocalVariable<L> {
    pub fn map_range<L2>(self, start: L2, end: L2) -> LocalVariable<L2> {
        LocalVariable {
            start,
            end,
            name: self.name,
            descriptor: self.descriptor,
            slot: self.slot,
        }
    }
}

impl LocalVariable<u32> {
    pub fn deserialize<R: ReadBytesExt>(
        reader: &mut R,
        pool: &ConstantPool,
    ) -> Result<LocalVariable<u32>, Error> {
        let start = u16::deserialize(reader)? as u32;
        let length = u16::deserialize(reader)? as u32;
        Ok(LocalVariable {
            start,
            end: start + length,
            name: pool.utf8_at(u16::deserialize(reader)?)?.to_owned(),
            descriptor: pool.utf8_at(u16::deserialize(reader)?)?.to_owned(),
            slot: u16::deserialize(reader)?,
        })
    }

    /// Constants needed to write out this entry
    pub fn constants(&self) -> [Constant; 2] {
        [
            Constant::Utf8(self.name.clone()),
            Constant::Utf8(self.descriptor.clone()),
        ]
    }

    pub fn assemble<W: WriteBytesExt>(
        &self,
        pool: &ConstantPool,
        writer: &mut W,
    ) -> Result<(), Error> {
        let [name, descriptor] = self.constants();
        (self.start as u16).serialize(writer)?;
        (self.end.saturating_sub(self.start) as u16).serialize(writer)?;
        pool.index_of(&name)?.serialize(writer)?;
        pool.index_of(&descriptor)?.serialize(writer)?;
        self.slot.serialize(writer)?;
        Ok(())
    }
}
