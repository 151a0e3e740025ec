//! Assembler and disassembler for JVM class files
//!
//! Class files are read lazily and written back byte for byte when left untouched. Method bodies
//! are decoded into a sequence of nodes that can be edited freely, then verified and encoded
//! again. See [`jvm`] for an example.

pub mod jvm;
pub mod util;
