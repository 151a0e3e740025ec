//! Read, edit, and write JVM classes
//!
//! ### Simple example
//!
//! Consider the following simple Java class:
//!
//! ```java,ignore,no_run
//! public class Answer {
//!     public static int get(int x) {
//!         return x < 0 ? 0 : 42;
//!     }
//! }
//! ```
//!
//! Generating an analogous class file can be done as follows:
//!
//! ```
//! use jvmasm::jvm::class_file::{ClassFile, Method, Version};
//! use jvmasm::jvm::code::{BranchInstruction, Declaration, Instruction, Op, OrdComparison};
//! use jvmasm::jvm::*;
//!
//! # fn generate_class() -> Result<(), Error> {
//! let mut class = ClassFile::new(
//!     Version::JAVA8,
//!     ClassAccessFlags::PUBLIC | ClassAccessFlags::SUPER,
//!     "Answer",
//!     Some("java/lang/Object"),
//!     Settings::default(),
//! );
//! let mut method = Method::new(
//!     MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
//!     "get",
//!     "(I)I",
//! );
//!
//! let code = method.new_code()?;
//! code.add(Op::Begin)?;
//! let x = code.add(Op::Declare(Declaration::named("x", "I")?.at_slot(0)))?;
//! let negative = code.create(Op::Label)?;
//! code.add(Op::Insn(Instruction::ILoad(x)))?;
//! code.add(Op::Branch(BranchInstruction::If(OrdComparison::LT, negative)))?;
//! code.add(Op::Insn(Instruction::BiPush(42)))?;
//! code.add(Op::Branch(BranchInstruction::IReturn))?;
//! code.place(negative)?;
//! code.add(Op::Insn(Instruction::IConst0))?;
//! code.add(Op::Branch(BranchInstruction::IReturn))?;
//! code.add(Op::End)?;
//!
//! class.contents_mut()?.methods.push(method);
//! let class_bytes: Vec<u8> = class.to_bytes()?;
//! # Ok(())
//! # }
//! ```

mod access_flags;
pub(crate) mod binary_format;
pub mod class_file;
pub mod code;
mod descriptors;
mod errors;
mod settings;

pub use access_flags::*;
pub use binary_format::{Deserialize, Serialize};
pub use descriptors::*;
pub use errors::*;
pub use settings::*;
