use super::{TypeLattice, VType, VerificationType};
use crate::jvm::class_file::{ClassConstants, StackMapFrame};
use crate::jvm::{Error, FrameErrorKind};
use std::fmt;

/// Snapshot of the local variables and the stack at a point in the bytecode
///
/// Wide types (`long` and `double`) are stored in the locals along with an extra `top` entry
/// after them, which keeps local indices and list positions identical. On the stack, wide types
/// take only one entry but count for two words in [`StackFrame::stack_size`].
#[derive(Debug, Clone)]
pub struct StackFrame<'g> {
    top: VType<'g>,

    /// Local variables (unassigned locals are `top`)
    locals: Vec<VType<'g>>,

    /// Types of values on the stack (top of the stack is last)
    stack: Vec<VType<'g>>,

    /// Size of the stack in words
    stack_size: usize,

    /// Largest `stack_size` seen so far
    max_stack: usize,
}

impl<'g> StackFrame<'g> {
    /// Frame with no locals and an empty stack
    pub fn new(lattice: &TypeLattice<'g>) -> Self {
        StackFrame {
            top: lattice.top(),
            locals: vec![],
            stack: vec![],
            stack_size: 0,
            max_stack: 0,
        }
    }

    pub fn locals(&self) -> &[VType<'g>] {
        &self.locals
    }

    pub fn stack(&self) -> &[VType<'g>] {
        &self.stack
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub fn max_stack(&self) -> usize {
        self.max_stack
    }

    /// Type of a local (`top` past the end of the locals)
    pub fn local(&self, index: usize) -> VType<'g> {
        self.locals.get(index).copied().unwrap_or(self.top)
    }

    pub fn push(&mut self, verification_type: VType<'g>) {
        self.stack.push(verification_type);
        self.after_push(verification_type);
    }

    fn after_push(&mut self, verification_type: VType<'g>) {
        self.stack_size += verification_type.size();
        self.max_stack = self.max_stack.max(self.stack_size);
    }

    pub fn pop(&mut self) -> Result<VType<'g>, FrameErrorKind> {
        let popped = self.stack.pop().ok_or(FrameErrorKind::EmptyStack)?;
        self.stack_size -= popped.size();
        Ok(popped)
    }

    /// Pop multiple elements off the stack
    pub fn pop_n(&mut self, count: usize) -> Result<(), FrameErrorKind> {
        for _ in 0..count {
            self.pop()?;
        }
        Ok(())
    }

    /// Inspect the element `depth` entries below the top of the stack
    pub fn peek(&self, depth: usize) -> Result<VType<'g>, FrameErrorKind> {
        self.stack
            .len()
            .checked_sub(depth + 1)
            .map(|idx| self.stack[idx])
            .ok_or(FrameErrorKind::EmptyStack)
    }

    /// Account for words that are pushed then popped again without their types mattering
    pub fn stack_diff(&mut self, words: usize) {
        self.max_stack = self.max_stack.max(self.stack_size + words);
    }

    /// Duplicate the top of the stack
    pub fn dup(&mut self) -> Result<(), FrameErrorKind> {
        let top_type = self.peek(0)?;
        self.push(top_type);
        Ok(())
    }

    /// Duplicate the top of the stack and insert it below the next element
    ///
    /// This covers both `dup_x1` and the second form of `dup2_x1` (wide value over a narrow one).
    pub fn dup_x1(&mut self) -> Result<(), FrameErrorKind> {
        let top_type = self.peek(0)?;
        self.peek(1)?;
        let insert_at = self.stack.len() - 2;
        self.stack.insert(insert_at, top_type);
        self.after_push(top_type);
        Ok(())
    }

    /// Duplicate the top of the stack and insert it two words below
    ///
    /// If the element below the top is wide, the copy goes right beneath it.
    pub fn dup_x2(&mut self) -> Result<(), FrameErrorKind> {
        let top_type = self.peek(0)?;
        let insert_at = if self.peek(1)?.is_two_word() {
            self.stack.len() - 2
        } else {
            self.peek(2)?;
            self.stack.len() - 3
        };
        self.stack.insert(insert_at, top_type);
        self.after_push(top_type);
        Ok(())
    }

    /// Swap the top two elements of the stack (both must be narrow)
    pub fn swap(&mut self) -> Result<(), FrameErrorKind> {
        let a = self.peek(0)?;
        let b = self.peek(1)?;
        if a.is_two_word() || b.is_two_word() {
            return Err(FrameErrorKind::InvalidWidth(2));
        }
        let len = self.stack.len();
        self.stack.swap(len - 1, len - 2);
        Ok(())
    }

    /// Overwrite one local slot, growing the locals with `top` if needed
    pub fn set_local(&mut self, index: usize, verification_type: VType<'g>) {
        if index >= self.locals.len() {
            self.locals.resize(index + 1, self.top);
        }
        self.locals[index] = verification_type;
    }

    /// Assign a local without touching the stack (eg. for parameters)
    ///
    /// Wide types also claim the next slot. Overwriting the second slot of a wide local makes
    /// the wide local unusable, so it becomes `top`.
    pub fn allocate_local(&mut self, index: usize, verification_type: VType<'g>) {
        if index > 0 && self.local(index - 1).is_two_word() {
            self.set_local(index - 1, self.top);
        }
        self.set_local(index, verification_type);
        if verification_type.is_two_word() {
            self.set_local(index + 1, self.top);
        }
    }

    /// Pop the top of the stack into a local
    pub fn store_local(&mut self, index: usize) -> Result<(), FrameErrorKind> {
        let stored = self.pop()?;
        self.allocate_local(index, stored);
        Ok(())
    }

    /// Replace every occurrence of an uninitialized type (after the constructor is called)
    pub fn initialize(&mut self, uninitialized: VType<'g>, initialized: VType<'g>) {
        for local in self.locals.iter_mut().chain(self.stack.iter_mut()) {
            if *local == uninitialized {
                *local = initialized;
            }
        }
    }

    pub fn clear_stack(&mut self) {
        self.stack.clear();
        self.stack_size = 0;
    }

    /// Combine this frame with another frame reaching the same program point
    ///
    /// Mismatched locals become their nearest common ancestor (locals present in only one of
    /// the frames become `top`). The stack is merged element-wise, and truncated to the shorter
    /// of the two stacks. Returns whether this frame changed.
    pub fn merge(&mut self, other: &StackFrame<'g>) -> bool {
        let mut changed = false;

        let locals_len = self.locals.len().max(other.locals.len());
        for i in 0..locals_len {
            let this_type = self.local(i);
            let other_type = other.local(i);
            let merged = if this_type == other_type {
                this_type
            } else {
                VerificationType::nearest_common_ancestor(this_type, other_type)
            };
            if merged != this_type {
                changed = true;
            }
            self.set_local(i, merged);
        }

        let stack_len = self.stack.len().min(other.stack.len());
        if self.stack.len() > stack_len {
            self.stack.truncate(stack_len);
            changed = true;
        }
        for (this_type, other_type) in self.stack.iter_mut().zip(other.stack.iter()) {
            if *this_type != *other_type {
                *this_type = VerificationType::nearest_common_ancestor(*this_type, *other_type);
                changed = true;
            }
        }
        self.stack_size = self.stack.iter().map(|t| t.size()).sum();
        self.max_stack = self.max_stack.max(other.max_stack);

        changed
    }

    /// Number of local slots up to and including the last assigned (non-`top`) local
    pub fn assigned_locals(&self) -> usize {
        self.locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, t)| !t.is_top())
            .map_or(0, |(i, t)| i + t.size())
    }

    /// Do both frames agree on the types of the first `limit` locals?
    pub fn same_locals(&self, other: &StackFrame<'g>, limit: usize) -> bool {
        (0..limit).all(|i| self.local(i) == other.local(i))
    }

    /// Locals in a range of slots, as they appear in a stack map frame (one entry per wide
    /// local)
    fn local_entries(&self, from: usize, to: usize) -> Vec<VType<'g>> {
        let mut entries = vec![];
        let mut i = from;
        while i < to {
            let local = self.local(i);
            entries.push(local);
            i += local.size();
        }
        entries
    }

    /// Compute a stack map frame for this frame, given the previous frame
    ///
    /// The cheapest applicable encoding is picked in this order: same locals with no stack, same
    /// locals with one stack item, chopped locals, appended locals. This will fall back to the
    /// `Full` option using [`Self::full_stack_map_frame`] only if none of the other stack map
    /// frame variants are enough to encode the transition.
    pub fn stack_map_frame<C: ClassConstants>(
        &self,
        offset_delta: u16,
        previous_frame: &StackFrame<'g>,
        constants: &mut C,
    ) -> Result<StackMapFrame, Error> {
        let assigned = self.assigned_locals();
        let prev_assigned = previous_frame.assigned_locals();
        let same_locals =
            assigned == prev_assigned && self.same_locals(previous_frame, assigned);

        match self.stack.len() {
            0 if same_locals => {
                return Ok(StackMapFrame::SameLocalsNoStack { offset_delta });
            }
            1 if same_locals => {
                return Ok(StackMapFrame::SameLocalsOneStack {
                    offset_delta,
                    stack: self.stack[0].into_serializable(constants)?,
                });
            }
            0 => {
                if assigned < prev_assigned && self.same_locals(previous_frame, assigned) {
                    let chopped_k = previous_frame
                        .local_entries(assigned, prev_assigned)
                        .len();
                    if chopped_k <= 3 {
                        return Ok(StackMapFrame::ChopLocalsNoStack {
                            offset_delta,
                            chopped_k: chopped_k as u8,
                        });
                    }
                }

                if assigned > prev_assigned && self.same_locals(previous_frame, prev_assigned) {
                    let appended = self.local_entries(prev_assigned, assigned);
                    if appended.len() <= 3 {
                        return Ok(StackMapFrame::AppendLocalsNoStack {
                            offset_delta,
                            locals: appended
                                .iter()
                                .map(|t| t.into_serializable(constants))
                                .collect::<Result<_, _>>()?,
                        });
                    }
                }
            }
            _ => (),
        }

        self.full_stack_map_frame(offset_delta, constants)
    }

    /// Compute a `Full` stack map frame
    pub fn full_stack_map_frame<C: ClassConstants>(
        &self,
        offset_delta: u16,
        constants: &mut C,
    ) -> Result<StackMapFrame, Error> {
        Ok(StackMapFrame::Full {
            offset_delta,
            locals: self
                .local_entries(0, self.assigned_locals())
                .iter()
                .map(|t| t.into_serializable(constants))
                .collect::<Result<_, _>>()?,
            stack: self
                .stack
                .iter()
                .map(|t| t.into_serializable(constants))
                .collect::<Result<_, _>>()?,
        })
    }
}

/// Frames are equal when their locals (with missing locals as `top`) and stacks are
impl<'g> PartialEq for StackFrame<'g> {
    fn eq(&self, other: &StackFrame<'g>) -> bool {
        let locals_len = self.locals.len().max(other.locals.len());
        self.same_locals(other, locals_len) && self.stack == other.stack
    }
}

impl<'g> Eq for StackFrame<'g> {}

impl<'g> fmt::Display for StackFrame<'g> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for local in &self.locals {
            write!(f, "{} ", local)?;
        }
        f.write_str("::")?;
        for stack_elem in &self.stack {
            write!(f, " {}", stack_elem)?;
        }
        Ok(())
    }
}
