use crate::jvm::class_file::{
    load_attributes, write_attributes, Attribute, Constant, ConstantPool, Field, Method, Version,
};
use crate::jvm::code::CodeAttribute;
use crate::jvm::{ClassAccessFlags, Deserialize, Error, Serialize, Settings};
use byteorder::ReadBytesExt;
use log::debug;
use std::fs;
use std::io::{Cursor, Write};
use std::path::Path;
use std::rc::Rc;

/// Decoded structure of a class file
#[derive(Debug)]
pub struct ClassContents {
    pub version: Version,
    pool: Rc<ConstantPool>,
    pub access_flags: ClassAccessFlags,
    pub this_class: String,

    /// Super class (only `java/lang/Object` has none)
    pub super_class: Option<String>,
    pub interfaces: Vec<String>,
    pub fields: Vec<Field>,
    pub methods: Vec<Method>,
    pub attributes: Vec<Attribute>,
}

impl ClassContents {
    /// Constant pool the class was read with (or last written with)
    pub fn constant_pool(&self) -> &ConstantPool {
        &self.pool
    }

    pub fn find_method(&self, name: &str, descriptor: &str) -> Option<&Method> {
        self.methods
            .iter()
            .find(|method| method.name == name && method.descriptor == descriptor)
    }

    fn deserialize<R: ReadBytesExt>(
        reader: &mut R,
        settings: &Settings,
    ) -> Result<ClassContents, Error> {
        let version = read_header(reader, settings)?;
        let mut pool = ConstantPool::deserialize(reader)?;
        let access_flags = ClassAccessFlags::deserialize(reader)?;
        let this_class = pool.class_at(u16::deserialize(reader)?)?.to_owned();
        let super_class = match u16::deserialize(reader)? {
            0 => None,
            idx => Some(pool.class_at(idx)?.to_owned()),
        };

        let count = u16::deserialize(reader)?;
        let mut interfaces = Vec::with_capacity(count as usize);
        for _ in 0..count {
            interfaces.push(pool.class_at(u16::deserialize(reader)?)?.to_owned());
        }

        let count = u16::deserialize(reader)?;
        let mut fields = Vec::with_capacity(count as usize);
        for _ in 0..count {
            fields.push(Field::deserialize(reader, &mut pool)?);
        }

        let count = u16::deserialize(reader)?;
        let mut methods = Vec::with_capacity(count as usize);
        for _ in 0..count {
            methods.push(Method::deserialize(reader, &mut pool)?);
        }

        let attributes = load_attributes(reader, &mut pool, None)?;

        let pool = Rc::new(pool);
        for method in &mut methods {
            method.attach_pool(&pool);
        }
        Ok(ClassContents {
            version,
            pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        })
    }

    fn is_modified(&self) -> bool {
        self.fields
            .iter()
            .flat_map(|field| &field.attributes)
            .chain(&self.attributes)
            .any(Attribute::is_modified)
            || self.methods.iter().any(Method::is_modified)
    }

    /// Encode everything into a new constant pool
    fn contract(&mut self, settings: &Settings) -> Result<Vec<u8>, Error> {
        for method in &mut self.methods {
            method.disassemble()?;
            method.detach_pool();
        }

        let fresh = settings.optimize_constant_pool && !self.pool.is_order_significant();
        let mut pool = if fresh {
            ConstantPool::new()
        } else {
            self.pool.as_ref().clone()
        };

        pool.register(&Constant::Class(self.this_class.clone()))?;
        if let Some(super_class) = &self.super_class {
            pool.register(&Constant::Class(super_class.clone()))?;
        }
        for interface in &self.interfaces {
            pool.register(&Constant::Class(interface.clone()))?;
        }
        for field in &mut self.fields {
            field.preassemble(&mut pool, settings)?;
        }
        for method in &mut self.methods {
            method.preassemble(&mut pool, settings)?;
        }
        for attribute in &mut self.attributes {
            attribute.preassemble(&mut pool, settings)?;
        }
        if fresh {
            pool.sort()?;
        }

        for method in &mut self.methods {
            method.assemble(&pool)?;
        }

        let mut bytes = vec![];
        bytes.write_all(&ClassFile::MAGIC)?;
        self.version.serialize(&mut bytes)?;
        pool.serialize(&mut bytes)?;
        self.access_flags.serialize(&mut bytes)?;
        pool.index_of(&Constant::Class(self.this_class.clone()))?
            .serialize(&mut bytes)?;
        match &self.super_class {
            Some(super_class) => pool
                .index_of(&Constant::Class(super_class.clone()))?
                .serialize(&mut bytes)?,
            None => 0u16.serialize(&mut bytes)?,
        }
        (self.interfaces.len() as u16).serialize(&mut bytes)?;
        for interface in &self.interfaces {
            pool.index_of(&Constant::Class(interface.clone()))?
                .serialize(&mut bytes)?;
        }
        (self.fields.len() as u16).serialize(&mut bytes)?;
        for field in &self.fields {
            field.write(&pool, &mut bytes)?;
        }
        (self.methods.len() as u16).serialize(&mut bytes)?;
        for method in &self.methods {
            method.write(&pool, &mut bytes)?;
        }
        write_attributes(&self.attributes, &pool, &mut bytes)?;

        for method in &mut self.methods {
            method.mark_saved();
        }
        self.pool = Rc::new(pool);
        Ok(bytes)
    }
}

fn read_header<R: ReadBytesExt>(reader: &mut R, settings: &Settings) -> Result<Version, Error> {
    let magic = u32::deserialize(reader)?;
    if magic != u32::from_be_bytes(ClassFile::MAGIC) {
        return Err(Error::BadMagic(magic));
    }
    let version = Version::deserialize(reader)?;
    if version.major_version < Version::OLDEST_MAJOR
        || version.major_version > settings.max_major_version
    {
        return Err(Error::UnsupportedVersion(version));
    }
    Ok(version)
}

/// Representation of the [`class` file format of the JVM][0]
///
/// A class read from bytes is only decoded when something asks for its structure, and is
/// written back out as the very same bytes as long as nothing was modified. Once decoded, the
/// code of each method is in turn only disassembled on demand.
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se15/html/jvms-4.html
#[derive(Debug)]
pub struct ClassFile {
    settings: Settings,

    /// Serialized form, if it is up to date with `contents`
    bytes: Option<Vec<u8>>,
    contents: Option<ClassContents>,
    modified: bool,
}

impl ClassFile {
    /// Magic header bytes that go at the front of the serialized class file
    const MAGIC: [u8; 4] = [0xCA, 0xFE, 0xBA, 0xBE];

    /// Start a new class with no members
    pub fn new(
        version: Version,
        access_flags: ClassAccessFlags,
        this_class: &str,
        super_class: Option<&str>,
        settings: Settings,
    ) -> ClassFile {
        let contents = ClassContents {
            version,
            pool: Rc::new(ConstantPool::new()),
            access_flags,
            this_class: String::from(this_class),
            super_class: super_class.map(String::from),
            interfaces: vec![],
            fields: vec![],
            methods: vec![],
            attributes: vec![],
        };
        ClassFile {
            settings,
            bytes: None,
            contents: Some(contents),
            modified: true,
        }
    }

    /// Wrap the bytes of a class file
    ///
    /// Only the header is checked here. The rest is decoded on first access.
    pub fn from_bytes(bytes: Vec<u8>, settings: Settings) -> Result<ClassFile, Error> {
        read_header(&mut Cursor::new(&bytes), &settings)?;
        Ok(ClassFile {
            settings,
            bytes: Some(bytes),
            contents: None,
            modified: false,
        })
    }

    /// Read a class file from disk
    pub fn read_from_path<P: AsRef<Path>>(
        path: P,
        settings: Settings,
    ) -> Result<ClassFile, Error> {
        let bytes = fs::read(path)?;
        ClassFile::from_bytes(bytes, settings)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Whether the class has been decoded into its structure
    pub fn is_expanded(&self) -> bool {
        self.contents.is_some()
    }

    /// Whether anything changed since the class was read or last written
    pub fn is_modified(&self) -> bool {
        self.modified || self.contents.as_ref().map_or(false, ClassContents::is_modified)
    }

    fn expand(&mut self) -> Result<&mut ClassContents, Error> {
        if self.contents.is_none() {
            let bytes = match &self.bytes {
                Some(bytes) => bytes,
                None => unreachable!("class has neither bytes nor contents"),
            };
            debug!("expanding class file of {} bytes", bytes.len());
            let contents = ClassContents::deserialize(&mut Cursor::new(bytes), &self.settings)?;
            self.contents = Some(contents);
        }
        match &mut self.contents {
            Some(contents) => Ok(contents),
            None => unreachable!("class was just expanded"),
        }
    }

    /// Structure of the class
    pub fn contents(&mut self) -> Result<&ClassContents, Error> {
        Ok(self.expand()?)
    }

    /// Structure of the class, for editing (this marks the class as modified)
    pub fn contents_mut(&mut self) -> Result<&mut ClassContents, Error> {
        self.expand()?;
        self.modified = true;
        self.expand()
    }

    /// Code of a method, if it has any
    ///
    /// Unlike [`ClassFile::contents_mut`], this does not mark the class as modified: the code
    /// tracks modifications itself.
    pub fn code_mut(
        &mut self,
        name: &str,
        descriptor: &str,
    ) -> Result<Option<&mut CodeAttribute>, Error> {
        Ok(self
            .expand()?
            .methods
            .iter_mut()
            .find(|method| method.name == name && method.descriptor == descriptor)
            .and_then(Method::code_mut))
    }

    /// Serialize the class
    ///
    /// If nothing was modified, this is the exact sequence of bytes the class was read from.
    pub fn to_bytes(&mut self) -> Result<Vec<u8>, Error> {
        if !self.is_modified() {
            if let Some(bytes) = &self.bytes {
                return Ok(bytes.clone());
            }
        }

        let settings = self.settings.clone();
        let contents = self.expand()?;
        debug!("contracting class {}", contents.this_class);
        let bytes = contents.contract(&settings)?;
        self.bytes = Some(bytes.clone());
        self.modified = false;
        Ok(bytes)
    }

    /// Save the class file to disk
    pub fn save_to_path<P: AsRef<Path>>(
        &mut self,
        path: P,
        create_missing_directories: bool,
    ) -> Result<(), Error> {
        let path = path.as_ref();
        if create_missing_directories {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
        }
        let bytes = self.to_bytes()?;
        fs::write(path, bytes)?;
        Ok(())
    }
}
