//! Back end for generating JVM method bodies
//!
//! A front end drives a [`jvm::code::CodeGenerator`] in program order (pushing typed values,
//! branching to labels, entering `try` and `synchronized` regions) and gets back a
//! [`jvm::code::MethodCode`]: patched bytecode, an exception table, and the stack map frames the
//! JVM verifier requires.

pub mod jvm;
