//! Emit the bytecode of a method body
//!
//! The entry point is [`CodeGenerator`], which writes instructions into a [`ByteBuffer`], patches
//! jumps to [`Label`]s, and logs the effect of each [`BasicBlock`] on the stack and locals. When
//! the method is done, [`CodeGenerator::finish`] runs the dataflow over the blocks and produces a
//! [`MethodCode`] with the stack map frames and the other tables that go into a `Code` attribute.

mod basic_block;
mod byte_buffer;
mod code_generator;
mod dataflow;
mod instructions;
mod label;
mod method_code;
mod monitors;
pub mod opcodes;

pub use basic_block::*;
pub use byte_buffer::*;
pub use code_generator::*;
pub use label::*;
pub use method_code::*;
pub use opcodes::{EqComparison, InvokeType, OrdComparison};
