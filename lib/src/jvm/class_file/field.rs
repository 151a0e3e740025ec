use crate::jvm::class_file::{
    load_attributes, write_attributes, Attribute, Constant, ConstantPool,
};
use crate::jvm::{Deserialize, Error, FieldAccessFlags, Serialize, Settings};
use byteorder::{ReadBytesExt, WriteBytesExt};

/// Field declared by a class or interface
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html#jvms-4.5
#[derive(Debug)]
pub struct Field {
    pub access_flags: FieldAccessFlags,
    pub name: String,
    pub descriptor: String,
    pub attributes: Vec<Attribute>,
}

impl Field {
    pub fn new(access_flags: FieldAccessFlags, name: &str, descriptor: &str) -> Field {
        Field {
            access_flags,
            name: String::from(name),
            descriptor: String::from(descriptor),
            attributes: vec![],
        }
    }

    pub(crate) fn deserialize<R: ReadBytesExt>(
        reader: &mut R,
        pool: &mut ConstantPool,
    ) -> Result<Field, Error> {
        let access_flags = FieldAccessFlags::deserialize(reader)?;
        let name = pool.utf8_at(u16::deserialize(reader)?)?.to_owned();
        let descriptor = pool.utf8_at(u16::deserialize(reader)?)?.to_owned();
        let attributes = load_attributes(reader, pool, None)?;
        Ok(Field {
            access_flags,
            name,
            descriptor,
            attributes,
        })
    }

    pub(crate) fn preassemble(
        &mut self,
        pool: &mut ConstantPool,
        settings: &Settings,
    ) -> Result<(), Error> {
        pool.register(&Constant::Utf8(self.name.clone()))?;
        pool.register(&Constant::Utf8(self.descriptor.clone()))?;
        for attribute in &mut self.attributes {
            attribute.preassemble(pool, settings)?;
        }
        Ok(())
    }

    pub(crate) fn write<W: WriteBytesExt>(
        &self,
        pool: &ConstantPool,
        writer: &mut W,
    ) -> Result<(), Error> {
        self.access_flags.serialize(writer)?;
        pool.index_of(&Constant::Utf8(self.name.clone()))?
            .serialize(writer)?;
        pool.index_of(&Constant::Utf8(self.descriptor.clone()))?
            .serialize(writer)?;
        write_attributes(&self.attributes, pool, writer)
    }
}
