use crate::jvm::class_file::{
    load_attributes, write_attributes, Attribute, Constant, ConstantPool,
};
use crate::jvm::code::{CodeAttribute, VarType};
use crate::jvm::{
    Deserialize, Error, MethodAccessFlags, MethodDescriptor, ParseDescriptor, Serialize, Settings,
};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::rc::Rc;

/// Method declared by a class or interface
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html#jvms-4.6
#[derive(Debug)]
pub struct Method {
    pub access_flags: MethodAccessFlags,
    pub name: String,
    pub descriptor: String,
    pub attributes: Vec<Attribute>,
}

impl Method {
    pub fn new(access_flags: MethodAccessFlags, name: &str, descriptor: &str) -> Method {
        Method {
            access_flags,
            name: String::from(name),
            descriptor: String::from(descriptor),
            attributes: vec![],
        }
    }

    /// Types of the local variables holding the arguments on entry (`this` comes first for
    /// instance methods)
    pub fn parameter_types(&self) -> Result<Vec<VarType>, Error> {
        let descriptor = MethodDescriptor::parse(&self.descriptor)
            .map_err(|_| Error::BadDescriptor(self.descriptor.clone()))?;
        let mut parameters = vec![];
        if !self.access_flags.contains(MethodAccessFlags::STATIC) {
            parameters.push(VarType::Reference);
        }
        parameters.extend(descriptor.parameters.iter().map(VarType::from_field_type));
        Ok(parameters)
    }

    /// Start an empty body for this method, replacing any existing one
    pub fn new_code(&mut self) -> Result<&mut CodeAttribute, Error> {
        let code = CodeAttribute::new(self.parameter_types()?);
        self.attributes
            .retain(|attribute| !matches!(attribute, Attribute::Code(_)));
        self.attributes.push(Attribute::Code(Box::new(code)));
        match self.attributes.last_mut() {
            Some(Attribute::Code(code)) => Ok(code),
            _ => unreachable!("code attribute was just pushed"),
        }
    }

    pub fn code(&self) -> Option<&CodeAttribute> {
        self.attributes.iter().find_map(|attribute| match attribute {
            Attribute::Code(code) => Some(code.as_ref()),
            _ => None,
        })
    }

    pub fn code_mut(&mut self) -> Option<&mut CodeAttribute> {
        self.attributes.iter_mut().find_map(|attribute| match attribute {
            Attribute::Code(code) => Some(code.as_mut()),
            _ => None,
        })
    }

    pub fn is_modified(&self) -> bool {
        self.attributes.iter().any(Attribute::is_modified)
    }

    pub(crate) fn deserialize<R: ReadBytesExt>(
        reader: &mut R,
        pool: &mut ConstantPool,
    ) -> Result<Method, Error> {
        let mut method = Method {
            access_flags: MethodAccessFlags::deserialize(reader)?,
            name: pool.utf8_at(u16::deserialize(reader)?)?.to_owned(),
            descriptor: pool.utf8_at(u16::deserialize(reader)?)?.to_owned(),
            attributes: vec![],
        };
        let parameters = method.parameter_types()?;
        method.attributes = load_attributes(reader, pool, Some(&parameters))?;
        Ok(method)
    }

    pub(crate) fn attach_pool(&mut self, pool: &Rc<ConstantPool>) {
        for attribute in &mut self.attributes {
            attribute.attach_pool(pool);
        }
    }

    pub(crate) fn detach_pool(&mut self) {
        for attribute in &mut self.attributes {
            attribute.detach_pool();
        }
    }

    pub(crate) fn mark_saved(&mut self) {
        for attribute in &mut self.attributes {
            attribute.mark_saved();
        }
    }

    pub(crate) fn disassemble(&mut self) -> Result<(), Error> {
        for attribute in &mut self.attributes {
            attribute.disassemble()?;
        }
        Ok(())
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

    pub(crate) fn assemble(&mut self, pool: &ConstantPool) -> Result<(), Error> {
        for attribute in &mut self.attributes {
            attribute.assemble(pool)?;
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
