//! Generate JVM method bodies
//!
//! ### Simple example
//!
//! Consider the following Java method:
//!
//! ```java,ignore,no_run
//! static int clamp(int x) {
//!     if (x < 0) {
//!         x = 0;
//!     }
//!     return x;
//! }
//! ```
//!
//! Generating the corresponding `Code` attribute can be done as follows:
//!
//! ```
//! use jcodegen::jvm::class_file::{ConstantsPool, Serialize};
//! use jcodegen::jvm::code::{CodeGenerator, OrdComparison};
//! use jcodegen::jvm::verifier::{TypeArenas, TypeLattice};
//! use jcodegen::jvm::*;
//!
//! # fn generate_method() -> Result<(), Error> {
//! let arenas = TypeArenas::new();
//! let lattice = TypeLattice::new(&arenas);
//!
//! let mut code = CodeGenerator::new(&lattice, "Example.clamp(I)I", CodeOptions::default());
//! let x = code.allocate_parameter(lattice.integer());
//!
//! let positive = code.new_label();
//! code.load(lattice.integer(), x)?;
//! code.emit_if(OrdComparison::GE, positive)?;
//! code.iconst(0)?;
//! code.store(lattice.integer(), x)?;
//! code.place(positive)?;
//! code.load(lattice.integer(), x)?;
//! code.return_value(Some(lattice.integer()))?;
//!
//! // Resolve the method body, then wrap it up as a `Code` attribute
//! let mut constants = ConstantsPool::new();
//! let method_code = code.finish(&mut constants)?;
//! assert_eq!(method_code.stack_map_frames.len(), 1);
//!
//! let code_attribute = method_code.into_code_attribute(&mut constants)?;
//! let mut bytes: Vec<u8> = vec![];
//! code_attribute.serialize(&mut bytes).map_err(Error::IoError)?;
//! # Ok(())
//! # }
//! # generate_method().unwrap();
//! ```

pub mod class_file;
pub mod code;
mod errors;
mod names;
mod options;
pub mod verifier;

pub use errors::*;
pub use names::*;
pub use options::*;
