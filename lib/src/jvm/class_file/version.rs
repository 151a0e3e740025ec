use crate::jvm::{Deserialize, Serialize};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::Result;

/// Version of the class file, which is used to verify that the JVM has the
/// necessary features to interpret the class
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct Version {
    pub minor_version: u16,
    pub major_version: u16,
}

impl Version {
    /// Oldest major version still in use (JDK 1.1)
    pub const OLDEST_MAJOR: u16 = 45;

    /// JVM class file version corresponding to Java SE 8 (released March 2014)
    pub const JAVA8: Version = Version {
        minor_version: 0,
        major_version: 52,
    };
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major_version, self.minor_version)
    }
}

impl Serialize for Version {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        self.minor_version.serialize(writer)?;
        self.major_version.serialize(writer)?;
        Ok(())
    }
}

impl Deserialize for Version {
    fn deserialize<R: ReadBytesExt>(reader: &mut R) -> Result<Version> {
        let minor_version = u16::deserialize(reader)?;
        let major_version = u16::deserialize(reader)?;
        Ok(Version {
            minor_version,
            major_version,
        })
    }
}
