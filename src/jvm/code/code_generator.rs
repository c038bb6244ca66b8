use super::opcodes::{self, GOTO, GOTO_W};
use super::{BasicBlock, BlockKey, ByteBuffer, JumpRecord, Label, LabelTable};
use crate::jvm::verifier::{StackFrame, TypeLattice, VType};
use crate::jvm::{BinaryName, CodeOptions, Error, UnqualifiedName};

/// Emits the code of one method body, keeping track of everything needed around it
///
/// Instructions are written in order into a byte buffer, with the generator doing the
/// bookkeeping:
///
///   - jumps to labels get back-patched when the label is placed
///   - the running stack depth (in words) and the number of locals used are tracked, for
///     `max_stack` and `max_locals`
///   - the code is split into [`BasicBlock`]s, each logging its effect on the types of the stack
///     and locals so that stack map frames can be computed when the method is finished
///   - exception ranges, synchronized regions, line numbers and local variable scopes are
///     recorded for the tables that go next to the code
///
/// ### Typed and untyped emission
///
/// Helpers like [`CodeGenerator::load`] or [`CodeGenerator::invoke`] know what they do to the
/// stack. Anything else goes through [`CodeGenerator::emit`], which only tracks the stack
/// depth. Callers then describe the types involved with [`CodeGenerator::pop_types`] and
/// [`CodeGenerator::push_type`].
pub struct CodeGenerator<'g> {
    pub(super) lattice: &'g TypeLattice<'g>,

    /// Name of the method (for error messages and logs)
    pub(super) method: String,

    pub(super) options: CodeOptions,

    pub(super) bytes: ByteBuffer,

    pub(super) labels: LabelTable,

    /// Basic blocks in layout order (the last one is the block being emitted)
    pub(super) blocks: Vec<BasicBlock<'g>>,

    /// Count of blocks started after branches
    synthetic_blocks: usize,

    /// Frame on entry to the method (parameters only)
    pub(super) entry_frame: StackFrame<'g>,

    /// Next free local variable
    next_local: usize,

    pub(super) max_locals: usize,

    /// Running stack depth, in words
    pub(super) stack_depth: i32,

    pub(super) max_stack: i32,

    /// Can the next instruction be reached from the previous one (or a placed label)?
    pub(super) reachable: bool,

    pub(super) exceptions: Vec<ExceptionEntry>,

    /// Stack of entered monitors
    pub(super) monitors: Vec<Monitor<'g>>,

    /// Pairs of code offset and source line
    pub(super) line_numbers: Vec<(usize, u16)>,

    pub(super) local_variables: Vec<PendingLocalVariable>,

    /// Some 16-bit branch offset didn't fit
    pub(super) branch_overflow: bool,
}

/// Entry in the exception table, with its range already resolved
#[derive(Debug, Clone)]
pub(super) struct ExceptionEntry {
    pub start_pc: usize,
    pub end_pc: usize,
    pub handler: Label,

    /// `None` catches everything
    pub catch_type: Option<BinaryName>,
}

/// Synchronized region being generated
#[derive(Debug)]
pub(super) struct Monitor<'g> {
    /// Local holding the locked object
    pub local: usize,

    pub lock_type: VType<'g>,

    /// Code offset ranges where the monitor is held
    pub ranges: Vec<(usize, usize)>,

    /// Start of the current range, if the monitor is held at this point
    pub open: Option<usize>,
}

/// Local variable table entry whose scope end is not known yet
#[derive(Debug, Clone)]
pub(super) struct PendingLocalVariable {
    pub start_pc: usize,
    pub scope_end: Label,
    pub name: UnqualifiedName,
    pub descriptor: String,
    pub index: u16,
}

impl<'g> CodeGenerator<'g> {
    pub fn new(
        lattice: &'g TypeLattice<'g>,
        method: impl Into<String>,
        options: CodeOptions,
    ) -> CodeGenerator<'g> {
        CodeGenerator {
            lattice,
            method: method.into(),
            options,
            bytes: ByteBuffer::new(),
            labels: LabelTable::default(),
            blocks: vec![BasicBlock::new(BlockKey::Start, 0, lattice.top())],
            synthetic_blocks: 0,
            entry_frame: StackFrame::new(lattice),
            next_local: 0,
            max_locals: 0,
            stack_depth: 0,
            max_stack: 0,
            reachable: true,
            exceptions: vec![],
            monitors: vec![],
            line_numbers: vec![],
            local_variables: vec![],
            branch_overflow: false,
        }
    }

    pub fn lattice(&self) -> &'g TypeLattice<'g> {
        self.lattice
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn options(&self) -> CodeOptions {
        self.options
    }

    /// Offset where the next instruction will go
    pub fn pos(&self) -> usize {
        self.bytes.pos()
    }

    /// Code emitted so far
    pub fn code(&self) -> &[u8] {
        self.bytes.as_slice()
    }

    /// Current stack depth, in words
    pub fn stack_depth(&self) -> usize {
        self.stack_depth as usize
    }

    /// Largest stack depth seen while emitting
    pub fn max_stack_depth(&self) -> usize {
        self.max_stack as usize
    }

    pub fn max_locals(&self) -> usize {
        self.max_locals
    }

    /// Can control reach the current position?
    ///
    /// This is `false` right after an unconditional jump, return, or throw, until a label is
    /// placed.
    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    /// Did some branch get an offset that doesn't fit in 16 bits?
    ///
    /// The bytes written for such a branch are wrong. The method should be generated again with
    /// [`CodeOptions::WIDE_GOTO`] (or otherwise restructured).
    pub fn branch_overflow(&self) -> bool {
        self.branch_overflow
    }

    /// Frame on entry to the method
    pub fn entry_frame(&self) -> &StackFrame<'g> {
        &self.entry_frame
    }

    pub(super) fn current_block(&mut self) -> &mut BasicBlock<'g> {
        let last = self.blocks.len() - 1;
        &mut self.blocks[last]
    }

    /// Declare the next parameter (including `this` for instance methods)
    ///
    /// Parameters must be declared before any other local is allocated. Returns the local index
    /// of the parameter.
    pub fn allocate_parameter(&mut self, verification_type: VType<'g>) -> usize {
        let index = self.next_local;
        self.entry_frame.allocate_local(index, verification_type);
        self.next_local += verification_type.size();
        self.max_locals = self.max_locals.max(self.next_local);
        index
    }

    /// Reserve a fresh local variable (two slots for `long` and `double`)
    pub fn new_local(&mut self, verification_type: VType<'g>) -> usize {
        let index = self.next_local;
        self.next_local += verification_type.size();
        self.max_locals = self.max_locals.max(self.next_local);
        index
    }

    /// Log a value pushed by an instruction emitted with [`CodeGenerator::emit`]
    pub fn push_type(&mut self, verification_type: VType<'g>) {
        self.current_block().push(verification_type);
    }

    /// Log values popped by an instruction emitted with [`CodeGenerator::emit`]
    pub fn pop_types(&mut self, count: usize) {
        self.current_block().pop_n(count);
    }

    pub(super) fn change_stack_depth(&mut self, change: i32) -> Result<(), Error> {
        let depth = self.stack_depth + change;
        if depth < 0 {
            return Err(Error::StackUnderflow {
                method: self.method.clone(),
                offset: self.bytes.pos(),
            });
        }
        self.stack_depth = depth;
        self.max_stack = self.max_stack.max(depth);
        Ok(())
    }

    /// Emit an opcode, updating the stack depth from its known stack effect
    ///
    /// Returns and `athrow` end the current block. Branches are rejected: they go through the
    /// dedicated helpers (eg. [`CodeGenerator::emit_goto`]) so that their targets get patched.
    pub fn emit(&mut self, opcode: u8) -> Result<(), Error> {
        let change = opcodes::stack_effect(opcode).ok_or_else(|| Error::VariableStackEffect {
            method: self.method.clone(),
            offset: self.bytes.pos(),
            opcode,
        })?;
        self.emit_with_stack_change(opcode, change)
    }

    /// Emit an opcode with an explicit change in stack depth (in words)
    ///
    /// Branches and switches are rejected, since their offsets could never be patched.
    pub fn emit_with_stack_change(&mut self, opcode: u8, change: i32) -> Result<(), Error> {
        if opcodes::is_branch(opcode) {
            return Err(Error::BranchWithoutLabel {
                method: self.method.clone(),
                offset: self.bytes.pos(),
                opcode,
            });
        }
        self.write_opcode(opcode, change)
    }

    /// Emit an opcode without checking that it makes sense on its own
    pub(super) fn write_opcode(&mut self, opcode: u8, change: i32) -> Result<(), Error> {
        self.change_stack_depth(change)?;
        self.bytes.add_u1(opcode);
        if matches!(opcode, opcodes::IRETURN..=opcodes::RETURN | opcodes::ATHROW) {
            self.end_block(false);
        }
        Ok(())
    }

    /// Append a one byte operand
    pub fn add_u1(&mut self, byte: u8) {
        self.bytes.add_u1(byte);
    }

    /// Append a two byte operand
    pub fn add_u2(&mut self, value: u16) {
        self.bytes.add_u2(value);
    }

    /// Append a four byte operand
    pub fn add_u4(&mut self, value: u32) {
        self.bytes.add_u4(value);
    }

    /// Close the current block and start a new unlabelled one
    pub(super) fn end_block(&mut self, falls_through: bool) {
        let pos = self.bytes.pos();
        let block = self.current_block();
        block.end = pos;
        block.falls_through = falls_through;
        self.reachable = falls_through;

        self.synthetic_blocks += 1;
        let key = BlockKey::Synthetic(self.synthetic_blocks);
        self.blocks
            .push(BasicBlock::new(key, pos, self.lattice.top()));
    }

    /// Make a new label, to be placed later
    pub fn new_label(&mut self) -> Label {
        self.labels.new_label()
    }

    /// Offset of a placed label
    pub fn address_of(&self, label: Label) -> Result<usize, Error> {
        self.labels.address(label).ok_or_else(|| Error::UnplacedLabel {
            method: self.method.clone(),
            label,
        })
    }

    /// Place a label at the current position
    ///
    /// All jumps already emitted to the label get patched. Placing a label starts a new basic
    /// block (labels placed at the same position share one block).
    pub fn place(&mut self, label: Label) -> Result<(), Error> {
        let pos = self.bytes.pos();
        if let Some(offset) = self.labels.address(label) {
            return Err(Error::LabelAlreadyPlaced {
                method: self.method.clone(),
                label,
                offset,
            });
        }

        let last = self.blocks.len() - 1;
        let block_index = if self.blocks[last].start == pos {
            if let BlockKey::Synthetic(_) = self.blocks[last].key {
                self.blocks[last].key = BlockKey::Label(label);
            }
            last
        } else {
            let reachable = self.reachable;
            let block = self.current_block();
            block.end = pos;
            block.falls_through = reachable;
            self.blocks
                .push(BasicBlock::new(BlockKey::Label(label), pos, self.lattice.top()));
            last + 1
        };

        let uses = self
            .labels
            .place(label, pos, block_index)
            .map_err(|offset| Error::LabelAlreadyPlaced {
                method: self.method.clone(),
                label,
                offset,
            })?;
        for record in uses {
            self.patch(record, pos);
        }

        // Stack depth after a jump is the depth at the jumps to the label
        if !self.reachable {
            self.stack_depth = self.labels.depth(label).unwrap_or(0);
        }
        self.reachable = true;
        log::trace!("{}: placed {:?} at {}", self.method, label, pos);
        Ok(())
    }

    /// Write the offset from a branch instruction to its target
    fn patch(&mut self, record: JumpRecord, target: usize) {
        let offset = target as i64 - record.instruction as i64;
        if record.wide {
            self.bytes.set_u4(record.operand, offset as i32 as u32);
        } else {
            if i16::try_from(offset).is_err() {
                self.flag_branch_overflow(record.instruction, offset);
            }
            self.bytes.set_u2(record.operand, offset as i16 as u16);
        }
    }

    fn flag_branch_overflow(&mut self, instruction: usize, offset: i64) {
        if !self.branch_overflow {
            log::warn!(
                "{}: branch at {} needs offset {}, which does not fit in 16 bits",
                self.method,
                instruction,
                offset
            );
        }
        self.branch_overflow = true;
    }

    /// Write the (possibly provisional) offset to a label as the operand of a branch
    pub(super) fn label_operand(&mut self, label: Label, instruction: usize, wide: bool) {
        let record = JumpRecord {
            instruction,
            operand: self.bytes.pos(),
            wide,
        };
        let address = self.labels.jump(label, record, self.stack_depth);
        if wide {
            self.bytes.add_u4(0);
        } else {
            self.bytes.add_u2(0);
        }
        if let Some(address) = address {
            self.patch(record, address);
        }
    }

    /// Emit a branch to a label, ending the current block
    ///
    /// The operand types popped by the branch must already be logged.
    pub(super) fn emit_branch(&mut self, opcode: u8, label: Label) -> Result<(), Error> {
        let instruction = self.bytes.pos();
        let change = opcodes::stack_effect(opcode).unwrap_or(0);
        self.change_stack_depth(change)?;
        self.bytes.add_u1(opcode);
        self.label_operand(label, instruction, opcode == GOTO_W);
        self.current_block().jumps.push(label);
        self.end_block(!opcodes::is_unconditional(opcode));
        Ok(())
    }

    /// Unconditional jump (`goto`, or `goto_w` if [`CodeOptions::WIDE_GOTO`] is set)
    pub fn emit_goto(&mut self, label: Label) -> Result<(), Error> {
        let opcode = if self.options.contains(CodeOptions::WIDE_GOTO) {
            GOTO_W
        } else {
            GOTO
        };
        self.emit_branch(opcode, label)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::code::opcodes::*;
    use crate::jvm::code::OrdComparison;
    use crate::jvm::verifier::TypeArenas;

    #[test]
    fn forward_and_backward_jumps() {
        let arenas = TypeArenas::new();
        let lattice = TypeLattice::new(&arenas);
        let mut code = CodeGenerator::new(&lattice, "Test.loop()V", CodeOptions::default());

        let top = code.new_label();
        let end = code.new_label();
        code.place(top).unwrap();
        code.iconst(1).unwrap();
        code.emit_if(OrdComparison::EQ, end).unwrap();
        code.emit_goto(top).unwrap();
        code.place(end).unwrap();
        code.return_value(None).unwrap();

        assert_eq!(
            code.code(),
            &[ICONST_1, IFEQ, 0, 6, GOTO, 0xff, 0xfc, RETURN]
        );
        assert!(!code.branch_overflow());
        assert_eq!(code.max_stack_depth(), 1);
        assert_eq!(code.stack_depth(), 0);
    }

    #[test]
    fn blocks_split_at_labels_and_branches() {
        let arenas = TypeArenas::new();
        let lattice = TypeLattice::new(&arenas);
        let mut code = CodeGenerator::new(&lattice, "Test.blocks()V", CodeOptions::default());

        let first = code.new_label();
        let second = code.new_label();
        let third = code.new_label();

        // Labels at the very start share the first block
        code.place(first).unwrap();
        code.place(second).unwrap();
        code.iconst(0).unwrap();
        code.emit_if(OrdComparison::NE, third).unwrap();
        code.place(third).unwrap();
        code.return_value(None).unwrap();

        let keys: Vec<String> = code.blocks.iter().map(|b| b.to_string()).collect();
        assert_eq!(keys, vec!["S (0..4)", "L2 (4..5)", "B2 (5..5)"]);
        assert_eq!(code.labels.block(first), Some(0));
        assert_eq!(code.labels.block(second), Some(0));
        assert_eq!(code.blocks[0].jumps, vec![third]);
        assert!(code.blocks[0].falls_through);
        assert!(!code.blocks[1].falls_through);
        assert!(!code.is_reachable());
    }

    #[test]
    fn labels_placed_once() {
        let arenas = TypeArenas::new();
        let lattice = TypeLattice::new(&arenas);
        let mut code = CodeGenerator::new(&lattice, "Test.twice()V", CodeOptions::default());

        let label = code.new_label();
        assert!(matches!(
            code.address_of(label),
            Err(Error::UnplacedLabel { .. })
        ));
        code.place(label).unwrap();
        assert!(matches!(
            code.place(label),
            Err(Error::LabelAlreadyPlaced { offset: 0, .. })
        ));
    }

    #[test]
    fn stack_depth_tracking() {
        let arenas = TypeArenas::new();
        let lattice = TypeLattice::new(&arenas);
        let mut code = CodeGenerator::new(&lattice, "Test.depth()V", CodeOptions::default());

        code.emit(LCONST_1).unwrap();
        code.emit(DCONST_0).unwrap();
        assert_eq!(code.stack_depth(), 4);
        code.emit(POP2).unwrap();
        code.emit(POP2).unwrap();
        assert!(matches!(
            code.emit(POP),
            Err(Error::StackUnderflow { offset: 4, .. })
        ));
        assert!(matches!(
            code.emit(INVOKESTATIC),
            Err(Error::VariableStackEffect {
                opcode: INVOKESTATIC,
                ..
            })
        ));
        code.emit_with_stack_change(INVOKESTATIC, 1).unwrap();
        code.add_u2(7);
        assert_eq!(code.code(), &[LCONST_1, DCONST_0, POP2, POP2, INVOKESTATIC, 0, 7]);
        assert_eq!(code.max_stack_depth(), 4);
    }

    #[test]
    fn branches_need_labels() {
        let arenas = TypeArenas::new();
        let lattice = TypeLattice::new(&arenas);
        let mut code = CodeGenerator::new(&lattice, "Test.branch()V", CodeOptions::default());

        for opcode in [GOTO, GOTO_W, IFEQ, IF_ACMPNE, IFNULL, JSR, RET, TABLESWITCH] {
            assert!(matches!(
                code.emit(opcode),
                Err(Error::BranchWithoutLabel { offset: 0, .. })
            ));
        }
        code.iconst(0).unwrap();
        assert!(matches!(
            code.emit_with_stack_change(LOOKUPSWITCH, -1),
            Err(Error::BranchWithoutLabel { offset: 1, .. })
        ));
        assert_eq!(code.code(), &[ICONST_0]);
        assert_eq!(code.stack_depth(), 1);
        assert!(code.is_reachable());
    }

    #[test]
    fn depth_restored_after_jumps() {
        let arenas = TypeArenas::new();
        let lattice = TypeLattice::new(&arenas);
        let mut code = CodeGenerator::new(&lattice, "Test.depth()I", CodeOptions::default());

        let join = code.new_label();
        code.iconst(1).unwrap();
        code.emit_goto(join).unwrap();
        assert!(!code.is_reachable());
        code.place(join).unwrap();
        assert_eq!(code.stack_depth(), 1);
        assert!(code.is_reachable());
    }
}
