//! Types and frames used to build the `StackMapTable` that the JVM verifier checks
//!
//! Verification types form a lattice (see [`TypeLattice`]) and frames ([`StackFrame`]) hold
//! the verification types of the locals and stack at a program point. Frames from different
//! predecessors of a block are combined with [`StackFrame::merge`].

mod frame;
mod types;

pub use frame::*;
pub use types::*;
