//! Serializable class file structures produced for a method body
//!
//! Only the pieces that belong to the `Code` attribute live here. Everything else in a class file
//! (fields, methods, the constant pool itself) is assembled by the caller, which exposes itself
//! to this crate through [`ClassConstants`].

mod attribute;
mod binary_format;
mod constants;

pub use attribute::*;
pub use binary_format::*;
pub use constants::*;
