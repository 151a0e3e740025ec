use crate::jvm::binary_format::read_bytes;
use crate::jvm::class_file::{Constant, ConstantPool};
use crate::jvm::code::{CodeAttribute, VarType};
use crate::jvm::{Deserialize, Error, Serialize, Settings};
use byteorder::{ReadBytesExt, WriteBytesExt};
use log::debug;
use std::io::Cursor;
use std::rc::Rc;

/// Attribute in its raw form: a name and an uninterpreted blob of bytes
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html#jvms-4.7
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawAttribute {
    pub name: String,
    pub info: Vec<u8>,
}

impl RawAttribute {
    pub fn deserialize<R: ReadBytesExt>(
        reader: &mut R,
        pool: &ConstantPool,
    ) -> Result<RawAttribute, Error> {
        let name = pool.utf8_at(u16::deserialize(reader)?)?.to_owned();

        // Attribute info length is 4 bytes
        let len = u32::deserialize(reader)?;
        let info = read_bytes(reader, len as usize)?;
        Ok(RawAttribute { name, info })
    }

    /// Read a `u16` count followed by that many attributes
    pub(crate) fn deserialize_all<R: ReadBytesExt>(
        reader: &mut R,
        pool: &ConstantPool,
    ) -> Result<Vec<RawAttribute>, Error> {
        let count = u16::deserialize(reader)?;
        let mut attributes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            attributes.push(RawAttribute::deserialize(reader, pool)?);
        }
        Ok(attributes)
    }

    pub fn write<W: WriteBytesExt>(&self, pool: &ConstantPool, writer: &mut W) -> Result<(), Error> {
        pool.index_of(&Constant::Utf8(self.name.clone()))?
            .serialize(writer)?;
        (self.info.len() as u32).serialize(writer)?;
        writer.write_all(&self.info)?;
        Ok(())
    }
}

/// Attributes on classes, fields, and methods
///
/// Attributes the library understands are decoded. Everything else stays raw, which forces the
/// constant pool to keep its order (see [`ConstantPool::mark_order_significant`]).
#[derive(Debug)]
pub enum Attribute {
    /// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html#jvms-4.7.3
    Code(Box<CodeAttribute>),

    /// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html#jvms-4.7.2
    ConstantValue(Constant),
    SourceFile(String),
    Signature(String),

    /// Checked exceptions a method may throw
    Exceptions(Vec<String>),
    Deprecated,
    Synthetic,
    Opaque(RawAttribute),
}

impl Attribute {
    const CONSTANT_VALUE: &'static str = "ConstantValue";
    const SOURCE_FILE: &'static str = "SourceFile";
    const SIGNATURE: &'static str = "Signature";
    const EXCEPTIONS: &'static str = "Exceptions";
    const DEPRECATED: &'static str = "Deprecated";
    const SYNTHETIC: &'static str = "Synthetic";

    pub fn name(&self) -> &str {
        match self {
            Attribute::Code(_) => CodeAttribute::NAME,
            Attribute::ConstantValue(_) => Attribute::CONSTANT_VALUE,
            Attribute::SourceFile(_) => Attribute::SOURCE_FILE,
            Attribute::Signature(_) => Attribute::SIGNATURE,
            Attribute::Exceptions(_) => Attribute::EXCEPTIONS,
            Attribute::Deprecated => Attribute::DEPRECATED,
            Attribute::Synthetic => Attribute::SYNTHETIC,
            Attribute::Opaque(raw) => &raw.name,
        }
    }

    /// Decode a raw attribute
    ///
    /// `code_parameters` is only set for method attributes: a `Code` attribute anywhere else is
    /// kept raw.
    pub(crate) fn load(
        raw: RawAttribute,
        pool: &mut ConstantPool,
        code_parameters: Option<&[VarType]>,
    ) -> Result<Attribute, Error> {
        let mut reader = Cursor::new(&raw.info[..]);
        let attribute = match (raw.name.as_str(), code_parameters) {
            (CodeAttribute::NAME, Some(parameters)) => {
                let code = CodeAttribute::load(&raw.info, parameters.to_vec(), pool)?;
                return Ok(Attribute::Code(Box::new(code)));
            }
            (Attribute::CONSTANT_VALUE, _) => {
                let index = u16::deserialize(&mut reader)?;
                match pool.get(index) {
                    Some(
                        constant @ (Constant::Integer(_)
                        | Constant::Float(_)
                        | Constant::Long(_)
                        | Constant::Double(_)
                        | Constant::String(_)
                        | Constant::StringUnits(_)),
                    ) => Attribute::ConstantValue(constant.clone()),
                    Some(_) => {
                        return Err(Error::UnexpectedConstant {
                            index,
                            expected: "constant value",
                        })
                    }
                    None => return Err(Error::InvalidConstantIndex(index)),
                }
            }
            (Attribute::SOURCE_FILE, _) => {
                Attribute::SourceFile(pool.utf8_at(u16::deserialize(&mut reader)?)?.to_owned())
            }
            (Attribute::SIGNATURE, _) => {
                Attribute::Signature(pool.utf8_at(u16::deserialize(&mut reader)?)?.to_owned())
            }
            (Attribute::EXCEPTIONS, _) => {
                let count = u16::deserialize(&mut reader)?;
                let mut classes = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    classes.push(pool.class_at(u16::deserialize(&mut reader)?)?.to_owned());
                }
                Attribute::Exceptions(classes)
            }
            (Attribute::DEPRECATED, _) => Attribute::Deprecated,
            (Attribute::SYNTHETIC, _) => Attribute::Synthetic,
            _ => {
                debug!("keeping unknown attribute {:?} as raw bytes", raw.name);
                pool.mark_order_significant();
                return Ok(Attribute::Opaque(raw));
            }
        };
        if reader.position() as usize != raw.info.len() {
            return Err(Error::MalformedAttribute { name: raw.name });
        }
        Ok(attribute)
    }

    pub fn is_modified(&self) -> bool {
        match self {
            Attribute::Code(code) => code.is_modified(),
            _ => false,
        }
    }

    /// Decode code that is still in its raw form
    pub(crate) fn disassemble(&mut self) -> Result<(), Error> {
        match self {
            Attribute::Code(code) => code.disassemble(),
            _ => Ok(()),
        }
    }

    pub(crate) fn attach_pool(&mut self, pool: &Rc<ConstantPool>) {
        if let Attribute::Code(code) = self {
            code.attach_pool(Rc::clone(pool));
        }
    }

    pub(crate) fn detach_pool(&mut self) {
        if let Attribute::Code(code) = self {
            code.detach_pool();
        }
    }

    pub(crate) fn mark_saved(&mut self) {
        if let Attribute::Code(code) = self {
            code.mark_saved();
        }
    }

    /// Register every constant the attribute needs
    pub(crate) fn preassemble(
        &mut self,
        pool: &mut ConstantPool,
        settings: &Settings,
    ) -> Result<(), Error> {
        pool.register(&Constant::utf8(self.name()))?;
        match self {
            Attribute::Code(code) => code.preassemble(pool, settings)?,
            Attribute::ConstantValue(constant) => {
                pool.register(constant)?;
            }
            Attribute::SourceFile(string) | Attribute::Signature(string) => {
                pool.register(&Constant::Utf8(string.clone()))?;
            }
            Attribute::Exceptions(classes) => {
                for class in classes {
                    pool.register(&Constant::Class(class.clone()))?;
                }
            }
            Attribute::Deprecated | Attribute::Synthetic | Attribute::Opaque(_) => (),
        }
        Ok(())
    }

    pub(crate) fn assemble(&mut self, pool: &ConstantPool) -> Result<(), Error> {
        match self {
            Attribute::Code(code) => code.assemble(pool),
            _ => Ok(()),
        }
    }

    pub(crate) fn write<W: WriteBytesExt>(
        &self,
        pool: &ConstantPool,
        writer: &mut W,
    ) -> Result<(), Error> {
        let mut info = vec![];
        match self {
            Attribute::Opaque(raw) => return raw.write(pool, writer),
            Attribute::Code(code) => code.write_info(pool, &mut info)?,
            Attribute::ConstantValue(constant) => pool.index_of(constant)?.serialize(&mut info)?,
            Attribute::SourceFile(string) | Attribute::Signature(string) => pool
                .index_of(&Constant::Utf8(string.clone()))?
                .serialize(&mut info)?,
            Attribute::Exceptions(classes) => {
                (classes.len() as u16).serialize(&mut info)?;
                for class in classes {
                    pool.index_of(&Constant::Class(class.clone()))?
                        .serialize(&mut info)?;
                }
            }
            Attribute::Deprecated | Attribute::Synthetic => (),
        }
        RawAttribute {
            name: self.name().to_owned(),
            info,
        }
        .write(pool, writer)
    }
}

/// Read a `u16` count followed by that many attributes, decoding the ones that are understood
pub(crate) fn load_attributes<R: ReadBytesExt>(
    reader: &mut R,
    pool: &mut ConstantPool,
    code_parameters: Option<&[VarType]>,
) -> Result<Vec<Attribute>, Error> {
    RawAttribute::deserialize_all(reader, pool)?
        .into_iter()
        .map(|raw| Attribute::load(raw, pool, code_parameters))
        .collect()
}

pub(crate) fn write_attributes<W: WriteBytesExt>(
    attributes: &[Attribute],
    pool: &ConstantPool,
    writer: &mut W,
) -> Result<(), Error> {
    (attributes.len() as u16).serialize(writer)?;
    for attribute in attributes {
        attribute.write(pool, writer)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn raw(name: &str, info: Vec<u8>) -> RawAttribute {
        RawAttribute {
            name: String::from(name),
            info,
        }
    }

    #[test]
    fn known_attributes() {
        let mut pool = ConstantPool::new();
        let string = pool.register(&Constant::string("hi")).unwrap();
        let source = pool.register(&Constant::utf8("Foo.java")).unwrap();
        let class = pool.register(&Constant::class("java/io/IOException")).unwrap();

        let value = Attribute::load(
            raw("ConstantValue", string.to_be_bytes().to_vec()),
            &mut pool,
            None,
        )
        .unwrap();
        assert!(matches!(value, Attribute::ConstantValue(Constant::String(ref s)) if s == "hi"));

        let file = Attribute::load(
            raw("SourceFile", source.to_be_bytes().to_vec()),
            &mut pool,
            None,
        )
        .unwrap();
        assert!(matches!(file, Attribute::SourceFile(ref s) if s == "Foo.java"));

        let mut info = vec![0, 1];
        info.extend_from_slice(&class.to_be_bytes());
        let exceptions = Attribute::load(raw("Exceptions", info), &mut pool, None).unwrap();
        assert!(
            matches!(exceptions, Attribute::Exceptions(ref c) if c == &["java/io/IOException"])
        );
        assert!(!pool.is_order_significant());
    }

    #[test]
    fn bad_attributes() {
        let mut pool = ConstantPool::new();
        let utf8 = pool.register(&Constant::utf8("x")).unwrap();

        // Wrong kind of constant for a constant value
        assert!(matches!(
            Attribute::load(
                raw("ConstantValue", utf8.to_be_bytes().to_vec()),
                &mut pool,
                None
            ),
            Err(Error::UnexpectedConstant { .. })
        ));

        // Trailing bytes
        assert!(matches!(
            Attribute::load(raw("Deprecated", vec![0]), &mut pool, None),
            Err(Error::MalformedAttribute { .. })
        ));

        // Truncated
        assert!(matches!(
            Attribute::load(raw("SourceFile", vec![0]), &mut pool, None),
            Err(Error::IoError(_))
        ));
    }

    #[test]
    fn unknown_attributes_pin_the_pool() {
        let mut pool = ConstantPool::new();
        let attribute =
            Attribute::load(raw("RuntimeVisibleAnnotations", vec![0, 0]), &mut pool, None)
                .unwrap();
        assert_eq!(attribute.name(), "RuntimeVisibleAnnotations");
        assert!(pool.is_order_significant());

        // Code outside of a method is not decoded
        let code = Attribute::load(raw("Code", vec![1, 2, 3]), &mut pool, None).unwrap();
        assert!(matches!(code, Attribute::Opaque(_)));
    }

    #[test]
    fn write_out() {
        let mut pool = ConstantPool::new();
        let mut attribute = Attribute::Exceptions(vec![String::from("java/lang/Exception")]);
        attribute
            .preassemble(&mut pool, &Settings::default())
            .unwrap();

        let mut bytes = vec![];
        attribute.write(&pool, &mut bytes).unwrap();
        let read = RawAttribute::deserialize(&mut Cursor::new(&bytes), &pool).unwrap();
        assert_eq!(read.name, "Exceptions");
        let class = pool.find(&Constant::class("java/lang/Exception")).unwrap();
        assert_eq!(read.info, vec![0, 1, (class >> 8) as u8, class as u8]);
    }
}
