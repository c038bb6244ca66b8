use super::Label;
use crate::jvm::verifier::{StackFrame, VType, VerificationType};
use crate::jvm::FrameErrorKind;
use std::fmt;

/// How a block got started
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BlockKey {
    /// First block in the method
    Start,

    /// Block following a branch, with no label of its own (numbered in order of creation)
    Synthetic(usize),

    /// Block starting at a placed label
    Label(Label),
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockKey::Start => f.write_str("S"),
            BlockKey::Synthetic(n) => write!(f, "B{}", n),
            BlockKey::Label(label) => write!(f, "L{}", label.0),
        }
    }
}

/// Change to the operand stack, logged as instructions are emitted
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum StackOp<'g> {
    Push(VType<'g>),
    Pop,

    /// Stack temporarily grew by this many words (a push that was popped again)
    Grow(usize),

    Dup,
    DupX1,
    DupX2,
    Swap,

    /// Constructor call replacing an uninitialized type with the initialized one
    Initialize {
        uninitialized: VType<'g>,
        initialized: VType<'g>,
    },
}

/// Straight-line run of code, recording how it changes the stack and locals
///
/// The log holds differences rather than frames, so blocks are cheap to build while emitting.
/// Frames at the start of blocks are computed only once the whole method is known (see
/// [`BasicBlock::apply`]).
#[derive(Debug)]
pub struct BasicBlock<'g> {
    pub key: BlockKey,

    /// Offset of the first instruction
    pub start: usize,

    /// Offset past the last instruction (only known once the block is closed)
    pub end: usize,

    /// Control can continue into the next block
    pub falls_through: bool,

    /// Labels this block may jump to
    pub jumps: Vec<Label>,

    /// Indices of exception table entries covering this block
    pub handlers: Vec<usize>,

    ops: Vec<StackOp<'g>>,

    /// Types written to locals in this block (`top` if untouched)
    locals: Vec<VType<'g>>,

    /// Locals whose type changed within the block
    changed: Vec<bool>,

    top: VType<'g>,
}

impl<'g> BasicBlock<'g> {
    pub fn new(key: BlockKey, start: usize, top: VType<'g>) -> BasicBlock<'g> {
        BasicBlock {
            key,
            start,
            end: start,
            falls_through: true,
            jumps: vec![],
            handlers: vec![],
            ops: vec![],
            locals: vec![],
            changed: vec![],
            top,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn ops(&self) -> &[StackOp<'g>] {
        &self.ops
    }

    pub fn push(&mut self, verification_type: VType<'g>) {
        self.ops.push(StackOp::Push(verification_type));
    }

    /// Last two logged operations (most recent second)
    fn tail(&self) -> (Option<StackOp<'g>>, Option<StackOp<'g>>) {
        let len = self.ops.len();
        let second_last = len.checked_sub(2).map(|idx| self.ops[idx]);
        (second_last, self.ops.last().copied())
    }

    /// Log a pop, folding it into a preceding push where possible
    pub fn pop(&mut self) {
        match self.tail() {
            (_, Some(StackOp::Push(pushed))) => {
                self.ops.pop();
                self.ops.push(StackOp::Grow(pushed.size()));
                self.merge_grows();
            }
            (Some(StackOp::Push(pushed)), Some(StackOp::Grow(diff))) => {
                self.ops.truncate(self.ops.len() - 2);
                self.ops.push(StackOp::Grow(diff + pushed.size()));
                self.merge_grows();
            }
            _ => self.ops.push(StackOp::Pop),
        }
    }

    pub fn pop_n(&mut self, count: usize) {
        for _ in 0..count {
            self.pop();
        }
    }

    /// Two adjacent growths only need the larger one
    fn merge_grows(&mut self) {
        if let (Some(StackOp::Grow(first)), Some(StackOp::Grow(second))) = self.tail() {
            self.ops.truncate(self.ops.len() - 2);
            self.ops.push(StackOp::Grow(first.max(second)));
        }
    }

    pub fn dup(&mut self) {
        match self.tail() {
            (_, Some(StackOp::Push(pushed)))
            | (Some(StackOp::Push(pushed)), Some(StackOp::Grow(_))) => {
                self.ops.push(StackOp::Push(pushed))
            }
            _ => self.ops.push(StackOp::Dup),
        }
    }

    pub fn dup_x1(&mut self) {
        self.ops.push(StackOp::DupX1);
    }

    pub fn dup_x2(&mut self) {
        self.ops.push(StackOp::DupX2);
    }

    pub fn swap(&mut self) {
        self.ops.push(StackOp::Swap);
    }

    pub fn initialize(&mut self, uninitialized: VType<'g>, initialized: VType<'g>) {
        for local in &mut self.locals {
            if *local == uninitialized {
                *local = initialized;
            }
        }
        self.ops.push(StackOp::Initialize {
            uninitialized,
            initialized,
        });
    }

    /// Record a write to a local
    ///
    /// A local counts as changed if it is killed (written with `top`) or written twice with
    /// different types.
    pub fn set_local(&mut self, index: usize, verification_type: VType<'g>) {
        if index >= self.locals.len() {
            self.locals.resize(index + 1, self.top);
            self.changed.resize(index + 1, false);
        }
        let previous = self.locals[index];
        if verification_type.is_top() || (!previous.is_top() && previous != verification_type) {
            self.changed[index] = true;
        }
        self.locals[index] = verification_type;
    }

    /// Pop the top of the stack into a local
    pub fn store(&mut self, index: usize, verification_type: VType<'g>) {
        self.pop();
        if index > 0 && self.locals.get(index - 1).map_or(false, |t| t.is_two_word()) {
            self.set_local(index - 1, self.top);
        }
        self.set_local(index, verification_type);
        if verification_type.is_two_word() {
            self.set_local(index + 1, self.top);
        }
    }

    /// Compute the frame at the end of the block from the frame at its start
    pub fn apply(&self, entry: &StackFrame<'g>) -> Result<StackFrame<'g>, FrameErrorKind> {
        let mut frame = entry.clone();
        for op in &self.ops {
            match *op {
                StackOp::Push(pushed) => frame.push(pushed),
                StackOp::Pop => {
                    frame.pop()?;
                }
                StackOp::Grow(diff) => frame.stack_diff(diff),
                StackOp::Dup => frame.dup()?,
                StackOp::DupX1 => frame.dup_x1()?,
                StackOp::DupX2 => frame.dup_x2()?,
                StackOp::Swap => frame.swap()?,
                StackOp::Initialize {
                    uninitialized,
                    initialized,
                } => frame.initialize(uninitialized, initialized),
            }
        }
        for (index, local) in self.locals.iter().enumerate() {
            if !local.is_top() {
                frame.allocate_local(index, *local);
            }
        }
        Ok(frame)
    }

    /// Fold the effect of this block on the locals into a frame
    ///
    /// An exception handler covering the block can be entered from any instruction in it, so its
    /// frame must accept every intermediate state of the locals. Locals that changed type inside
    /// the block become `top`, and locals written once are merged with their type on entry.
    pub fn local_subset(&self, frame: &mut StackFrame<'g>) {
        for (index, local) in self.locals.iter().enumerate() {
            let written = self.changed[index] || !local.is_top();
            if !written {
                continue;
            }

            // Clobbering the second half of a wide local from before the block kills it
            let below_is_ours = index > 0 && self.locals[index - 1].is_two_word();
            if index > 0 && !below_is_ours && frame.local(index - 1).is_two_word() {
                frame.set_local(index - 1, self.top);
            }

            if self.changed[index] {
                frame.set_local(index, self.top);
            } else {
                let merged = VerificationType::nearest_common_ancestor(*local, frame.local(index));
                frame.set_local(index, merged);
            }
        }
    }
}

impl<'g> fmt::Display for BasicBlock<'g> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}..{})", self.key, self.start, self.end)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::jvm::verifier::{TypeArenas, TypeLattice};

    #[test]
    fn pops_fold_into_pushes() {
        let arenas = TypeArenas::new();
        let lattice = TypeLattice::new(&arenas);
        let mut block = BasicBlock::new(BlockKey::Start, 0, lattice.top());

        block.push(lattice.long());
        block.pop();
        assert_eq!(block.ops(), &[StackOp::Grow(2)]);

        block.push(lattice.integer());
        block.push(lattice.double());
        block.pop();
        assert_eq!(
            block.ops(),
            &[StackOp::Grow(2), StackOp::Push(lattice.integer()), StackOp::Grow(2)]
        );

        // Pop the `int` under the transient growth
        block.pop();
        assert_eq!(block.ops(), &[StackOp::Grow(3)]);

        block.pop();
        assert_eq!(block.ops(), &[StackOp::Grow(3), StackOp::Pop]);
        assert_eq!(format!("{}", block), "S (0..0)");
    }

    #[test]
    fn dups_fold_into_pushes() {
        let arenas = TypeArenas::new();
        let lattice = TypeLattice::new(&arenas);
        let mut block = BasicBlock::new(BlockKey::Synthetic(2), 4, lattice.top());

        block.dup();
        block.push(lattice.string());
        block.dup();
        block.push(lattice.float());
        block.pop();
        block.dup();
        assert_eq!(
            block.ops(),
            &[
                StackOp::Dup,
                StackOp::Push(lattice.string()),
                StackOp::Push(lattice.string()),
                StackOp::Grow(1),
                StackOp::Push(lattice.string()),
            ]
        );
    }

    #[test]
    fn apply_replays_log() {
        let arenas = TypeArenas::new();
        let lattice = TypeLattice::new(&arenas);
        let mut block = BasicBlock::new(BlockKey::Start, 0, lattice.top());

        let mut entry = StackFrame::new(&lattice);
        entry.allocate_local(0, lattice.string());
        entry.push(lattice.integer());

        // new Object(); dup; invokespecial <init>; astore_1; iconst; pop
        let uninit = lattice.uninitialized(1);
        block.push(uninit);
        block.dup();
        block.pop();
        block.initialize(uninit, lattice.object());
        block.store(1, lattice.object());
        block.push(lattice.long());
        block.pop();

        let exit = block.apply(&entry).unwrap();
        assert_eq!(exit.locals(), &[lattice.string(), lattice.object()]);
        assert_eq!(exit.stack(), &[lattice.integer()]);
        assert_eq!(exit.max_stack(), 3);

        // The log can't be replayed on a frame missing the stack it expects
        let mut popping = BasicBlock::new(BlockKey::Start, 0, lattice.top());
        popping.pop();
        popping.pop();
        assert_eq!(popping.apply(&entry), Err(FrameErrorKind::EmptyStack));
    }

    #[test]
    fn wide_locals_in_log() {
        let arenas = TypeArenas::new();
        let lattice = TypeLattice::new(&arenas);
        let mut block = BasicBlock::new(BlockKey::Start, 0, lattice.top());

        let mut entry = StackFrame::new(&lattice);
        entry.allocate_local(0, lattice.double());

        // Store an `int` in the second half of the `double`
        block.push(lattice.integer());
        block.store(1, lattice.integer());
        let exit = block.apply(&entry).unwrap();
        assert_eq!(exit.locals(), &[lattice.top(), lattice.integer()]);

        let mut handler_frame = entry.clone();
        block.local_subset(&mut handler_frame);
        assert_eq!(handler_frame.local(0), lattice.top());
        assert_eq!(handler_frame.local(1), lattice.top());

        // Store a `long` over an `int` written in the same block
        let mut block = BasicBlock::new(BlockKey::Start, 0, lattice.top());
        block.push(lattice.integer());
        block.store(2, lattice.integer());
        block.push(lattice.long());
        block.store(1, lattice.long());
        let exit = block.apply(&StackFrame::new(&lattice)).unwrap();
        assert_eq!(
            exit.locals(),
            &[lattice.top(), lattice.long(), lattice.top()]
        );
    }

    #[test]
    fn local_subset() {
        let arenas = TypeArenas::new();
        let lattice = TypeLattice::new(&arenas);

        let mut entry = StackFrame::new(&lattice);
        entry.allocate_local(0, lattice.integer());
        entry.allocate_local(1, lattice.string());
        entry.allocate_local(2, lattice.float());
        entry.allocate_local(3, lattice.null());

        let mut block = BasicBlock::new(BlockKey::Label(Label(3)), 0, lattice.top());
        assert_eq!(block.to_string(), "L3 (0..0)");

        // Local 1 is overwritten with two different types
        block.push(lattice.integer());
        block.store(1, lattice.integer());
        block.push(lattice.float());
        block.store(1, lattice.float());

        // Local 2 is overwritten with the same type
        block.push(lattice.float());
        block.store(2, lattice.float());

        // Local 3 gets a more precise reference
        block.push(lattice.string());
        block.store(3, lattice.string());

        let mut frame = entry.clone();
        block.local_subset(&mut frame);
        assert_eq!(
            frame.locals(),
            &[
                lattice.integer(),
                lattice.top(),
                lattice.float(),
                lattice.string(),
            ]
        );
    }
}
