use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Result};

/// Utility trait for serializing data inside class files
///
/// Java class files have some peculiarities that make it useful to define an extra trait (instead
/// of just using `serde`):
///
///   - tags are always `u8`
///   - when serializing a sequence, the length of the sequence is usually `u16`
///
/// Structures that refer to the constant pool do not implement this: they have their own
/// `assemble` or `write` methods taking the pool.
pub trait Serialize: Sized {
    /// Serialize construct into a binary output stream
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()>;
}

/// Inverse of [`Serialize`], for the fixed-width big-endian primitives of the format
///
/// A stream ending early surfaces as an `UnexpectedEof` IO error.
pub trait Deserialize: Sized {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self>;
}

impl Serialize for u8 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        writer.write_u8(*self)
    }
}

impl Serialize for u16 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        writer.write_u16::<BigEndian>(*self)
    }
}

impl Serialize for u32 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<BigEndian>(*self)
    }
}

impl Serialize for u64 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        writer.write_u64::<BigEndian>(*self)
    }
}

impl Serialize for i8 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        writer.write_i8(*self)
    }
}

impl Serialize for i16 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        writer.write_i16::<BigEndian>(*self)
    }
}

impl Serialize for i32 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        writer.write_i32::<BigEndian>(*self)
    }
}

impl Serialize for i64 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        writer.write_i64::<BigEndian>(*self)
    }
}

/// Size in `u16` is the first thing serialized/deserialized
impl<A: Serialize> Serialize for Vec<A> {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        (self.len() as u16).serialize(writer)?;
        for elem in self {
            elem.serialize(writer)?;
        }
        Ok(())
    }
}

impl Deserialize for u8 {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self> {
        reader.read_u8()
    }
}

impl Deserialize for u16 {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self> {
        reader.read_u16::<BigEndian>()
    }
}

impl Deserialize for u32 {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self> {
        reader.read_u32::<BigEndian>()
    }
}

impl Deserialize for u64 {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self> {
        reader.read_u64::<BigEndian>()
    }
}

impl Deserialize for i8 {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self> {
        reader.read_i8()
    }
}

impl Deserialize for i16 {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self> {
        reader.read_i16::<BigEndian>()
    }
}

impl Deserialize for i32 {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self> {
        reader.read_i32::<BigEndian>()
    }
}

impl Deserialize for i64 {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Self> {
        reader.read_i64::<BigEndian>()
    }
}

/// Read exactly `len` bytes
///
/// Lengths come from untrusted input, so the buffer only grows as bytes actually arrive.
pub fn read_bytes<R: ReadBytesExt>(reader: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    reader.take(len as u64).read_to_end(&mut buffer)?;
    if buffer.len() < len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "stream ended early",
        ));
    }
    Ok(buffer)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::{Cursor, ErrorKind};

    #[test]
    fn big_endian_primitives() {
        let mut buffer = vec![];
        0xCAFEu16.serialize(&mut buffer).unwrap();
        (-2i32).serialize(&mut buffer).unwrap();
        assert_eq!(buffer, vec![0xCA, 0xFE, 0xFF, 0xFF, 0xFF, 0xFE]);

        let mut cursor = Cursor::new(&buffer[..]);
        assert_eq!(u16::deserialize(&mut cursor).unwrap(), 0xCAFE);
        assert_eq!(i32::deserialize(&mut cursor).unwrap(), -2);
    }

    #[test]
    fn vectors_are_length_prefixed() {
        let mut buffer = vec![];
        vec![7u16, 9u16].serialize(&mut buffer).unwrap();
        assert_eq!(buffer, vec![0, 2, 0, 7, 0, 9]);
    }

    #[test]
    fn truncated_input() {
        let mut cursor = Cursor::new(&[0x01u8][..]);
        let err = u32::deserialize(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
        assert!(read_bytes(&mut Cursor::new(&[1u8, 2][..]), 3).is_err());
    }
}
