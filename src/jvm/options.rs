use bitflags::bitflags;

bitflags! {
    /// Settings for generating one method body
    pub struct CodeOptions: u8 {
        /// Unconditional jumps use `goto_w` (4-byte offsets) instead of `goto`
        ///
        /// This is what to retry with after [`crate::jvm::code::MethodCode::branch_overflow`]
        /// reports an offset that didn't fit in 16 bits.
        const WIDE_GOTO = 0x01;

        /// Compute the `StackMapTable` (required from class file version 50 onwards)
        ///
        /// Without this, dead code is left as is and `max_stack` comes only from tracking the
        /// stack depth while emitting.
        const STACK_MAP_FRAMES = 0x02;
    }
}

impl Default for CodeOptions {
    fn default() -> CodeOptions {
        CodeOptions::STACK_MAP_FRAMES
    }
}
