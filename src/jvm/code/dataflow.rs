//! Frames at block boundaries, and removal of unreachable code
//!
//! Blocks only log what they do to the stack and locals. Once the method is done, frames are
//! propagated from the entry frame along fallthrough, jump and exception edges until nothing
//! changes. Blocks that never get a frame are dead, and get rewritten to `nop ... athrow` since
//! the verifier still checks them.

use super::opcodes::{ATHROW, NOP};
use super::{CodeGenerator, ExceptionEntry};
use crate::jvm::verifier::StackFrame;
use crate::jvm::Error;

/// Frames of a finished method
pub(super) struct Frames<'g> {
    /// Offsets and frames of the points needing a stack map frame, in order
    pub frames: Vec<(usize, StackFrame<'g>)>,

    /// Largest stack size (in words) on any path
    pub max_stack: usize,
}

/// Remove `start..end` from the ranges of exception handlers (splitting ranges if needed)
fn carve_out(exceptions: Vec<ExceptionEntry>, start: usize, end: usize) -> Vec<ExceptionEntry> {
    let mut carved = Vec::with_capacity(exceptions.len());
    for entry in exceptions {
        if entry.end_pc <= start || end <= entry.start_pc {
            carved.push(entry);
            continue;
        }
        if entry.start_pc < start {
            carved.push(ExceptionEntry {
                end_pc: start,
                ..entry.clone()
            });
        }
        if end < entry.end_pc {
            carved.push(ExceptionEntry {
                start_pc: end,
                ..entry
            });
        }
    }
    carved
}

impl<'g> CodeGenerator<'g> {
    /// Record on every non-empty block which exception handlers cover it
    fn attach_handlers(&mut self) {
        let exceptions = &self.exceptions;
        for block in &mut self.blocks {
            block.handlers.clear();
            if block.is_empty() {
                continue;
            }
            for (index, entry) in exceptions.iter().enumerate() {
                if entry.start_pc < block.end && block.start < entry.end_pc {
                    block.handlers.push(index);
                }
            }
        }
    }

    /// Compute the frame on entry to each block (`None` for unreachable blocks)
    ///
    /// Also returns the largest stack size seen.
    fn block_entry_frames(&self) -> Result<(Vec<Option<StackFrame<'g>>>, usize), Error> {
        let block_count = self.blocks.len();
        let mut entries: Vec<Option<StackFrame<'g>>> = vec![None; block_count];
        let mut queued = vec![false; block_count];
        let mut worklist = vec![0];
        let mut max_stack = 0;
        entries[0] = Some(self.entry_frame.clone());
        queued[0] = true;

        while let Some(index) = worklist.pop() {
            queued[index] = false;
            let entry = match &entries[index] {
                Some(entry) => entry.clone(),
                None => continue,
            };
            let block = &self.blocks[index];
            let exit = block.apply(&entry).map_err(|kind| Error::Verifier {
                method: self.method.clone(),
                offset: block.start,
                kind,
            })?;
            max_stack = max_stack.max(exit.max_stack());

            let mut successors: Vec<(usize, StackFrame<'g>)> = vec![];
            if block.falls_through && index + 1 < block_count {
                successors.push((index + 1, exit.clone()));
            }
            for label in &block.jumps {
                if let Some(target) = self.labels.block(*label) {
                    successors.push((target, exit.clone()));
                }
            }
            for handler in &block.handlers {
                let exception = &self.exceptions[*handler];
                let catch_type = match &exception.catch_type {
                    Some(name) => self.lattice.class_type(name),
                    None => self.lattice.throwable(),
                };
                let mut frame = entry.clone();
                block.local_subset(&mut frame);
                frame.clear_stack();
                frame.push(catch_type);
                max_stack = max_stack.max(frame.max_stack());
                if let Some(target) = self.labels.block(exception.handler) {
                    successors.push((target, frame));
                }
            }

            for (target, frame) in successors {
                let changed = match entries[target].as_mut() {
                    Some(existing) => existing.merge(&frame),
                    None => {
                        entries[target] = Some(frame);
                        true
                    }
                };
                if changed && !queued[target] {
                    queued[target] = true;
                    worklist.push(target);
                }
            }
        }

        Ok((entries, max_stack))
    }

    /// Overwrite runs of unreachable blocks with `nop ... athrow`
    ///
    /// Exception ranges are carved around the rewritten code. Returns the start of each run.
    fn remove_dead_code(&mut self, entries: &[Option<StackFrame<'g>>]) -> Vec<usize> {
        let mut runs: Vec<(usize, usize)> = vec![];
        for (block, entry) in self.blocks.iter().zip(entries) {
            if entry.is_some() || block.is_empty() {
                continue;
            }
            match runs.last_mut() {
                Some(run) if run.1 == block.start => run.1 = block.end,
                _ => runs.push((block.start, block.end)),
            }
        }

        for &(start, end) in &runs {
            log::warn!(
                "{}: replacing unreachable code at {}..{}",
                self.method,
                start,
                end
            );
            for offset in start..end - 1 {
                self.bytes.set(offset, NOP);
            }
            self.bytes.set(end - 1, ATHROW);
            let exceptions = std::mem::take(&mut self.exceptions);
            self.exceptions = carve_out(exceptions, start, end);
        }
        runs.into_iter().map(|(start, _)| start).collect()
    }

    /// Run the dataflow over the blocks of the method
    ///
    /// The last block must have been closed.
    pub(super) fn compute_frames(&mut self) -> Result<Frames<'g>, Error> {
        self.attach_handlers();
        let (entries, mut max_stack) = self.block_entry_frames()?;

        let last = self.blocks.len() - 1;
        if entries[last].is_some() && self.blocks[last].falls_through {
            return Err(Error::FallsOffEnd {
                method: self.method.clone(),
                offset: self.blocks[last].end,
            });
        }

        let dead_runs = self.remove_dead_code(&entries);
        if !dead_runs.is_empty() {
            max_stack = max_stack.max(1);
        }

        // Blocks that control can reach other than by falling through
        let mut targets = vec![false; self.blocks.len()];
        for (block, entry) in self.blocks.iter().zip(&entries) {
            if entry.is_none() {
                continue;
            }
            for label in &block.jumps {
                if let Some(target) = self.labels.block(*label) {
                    targets[target] = true;
                }
            }
        }
        for exception in &self.exceptions {
            if let Some(target) = self.labels.block(exception.handler) {
                targets[target] = true;
            }
        }

        let mut dead_frame = StackFrame::new(self.lattice);
        dead_frame.push(self.lattice.throwable());

        let mut frames = vec![];
        for (index, block) in self.blocks.iter().enumerate() {
            if block.is_empty() {
                continue;
            }
            match &entries[index] {
                Some(entry) => {
                    log::trace!("{}: {} starts with {}", self.method, block, entry);
                    let after_jump = index > 0
                        && !(self.blocks[index - 1].falls_through && entries[index - 1].is_some());
                    if targets[index] || after_jump {
                        frames.push((block.start, entry.clone()));
                    }
                }
                None if dead_runs.contains(&block.start) => {
                    frames.push((block.start, dead_frame.clone()));
                }
                None => (),
            }
        }

        Ok(Frames { frames, max_stack })
    }
}
