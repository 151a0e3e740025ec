//! Class files and the structures inside them (other than code, see [`crate::jvm::code`])

mod attribute;
mod class;
mod constants;
mod field;
mod method;
mod version;

pub use attribute::*;
pub use class::*;
pub use constants::*;
pub use field::*;
pub use method::*;
pub use version::*;
