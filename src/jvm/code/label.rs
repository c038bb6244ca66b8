use std::fmt;

/// Opaque label naming a position in the code
///
/// Labels are handed out by [`super::CodeGenerator::new_label`] and placed exactly once.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Label(pub(super) u32);

impl fmt::Debug for Label {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_fmt(format_args!("l{}", self.0))
    }
}

/// Handle on an entered monitor (index in the stack of entered monitors)
#[derive(Copy, Clone, Hash, Eq, PartialEq)]
pub struct MonitorId(pub(super) usize);

impl fmt::Debug for MonitorId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_fmt(format_args!("m{}", self.0))
    }
}

/// Branch operand waiting for its label to be placed
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(super) struct JumpRecord {
    /// Offset of the branch opcode (offsets are relative to this)
    pub instruction: usize,

    /// Offset of the operand to patch
    pub operand: usize,

    /// Operand takes 4 bytes (`goto_w` and switches) instead of 2
    pub wide: bool,
}

/// Per-label state, indexed by the label number
#[derive(Default, Debug)]
pub(super) struct LabelTable {
    /// Offset of placed labels
    addresses: Vec<Option<usize>>,

    /// Pending uses of labels not placed yet
    uses: Vec<Vec<JumpRecord>>,

    /// Stack depth at the jumps to this label
    depths: Vec<Option<i32>>,

    /// Index of the basic block starting at the label
    blocks: Vec<Option<usize>>,
}

impl LabelTable {
    pub fn new_label(&mut self) -> Label {
        let label = Label(self.addresses.len() as u32);
        self.addresses.push(None);
        self.uses.push(vec![]);
        self.depths.push(None);
        self.blocks.push(None);
        label
    }

    /// Extend the table to cover labels it didn't hand out
    fn ensure(&mut self, label: Label) -> usize {
        let idx = label.0 as usize;
        if idx >= self.addresses.len() {
            self.addresses.resize(idx + 1, None);
            self.uses.resize(idx + 1, vec![]);
            self.depths.resize(idx + 1, None);
            self.blocks.resize(idx + 1, None);
        }
        idx
    }

    pub fn address(&self, label: Label) -> Option<usize> {
        self.addresses.get(label.0 as usize).copied().flatten()
    }

    pub fn depth(&self, label: Label) -> Option<i32> {
        self.depths.get(label.0 as usize).copied().flatten()
    }

    pub fn block(&self, label: Label) -> Option<usize> {
        self.blocks.get(label.0 as usize).copied().flatten()
    }

    /// Bind a label to an offset and take the uses that now need to be patched
    ///
    /// Fails with the existing offset if the label was already placed.
    pub fn place(
        &mut self,
        label: Label,
        offset: usize,
        block: usize,
    ) -> Result<Vec<JumpRecord>, usize> {
        let idx = self.ensure(label);
        if let Some(existing) = self.addresses[idx] {
            return Err(existing);
        }
        self.addresses[idx] = Some(offset);
        self.blocks[idx] = Some(block);
        Ok(std::mem::take(&mut self.uses[idx]))
    }

    /// Refer to a label from a branch
    ///
    /// If the label is already placed, its offset is returned and nothing is recorded. Otherwise
    /// the use is kept until the label gets placed.
    pub fn jump(&mut self, label: Label, record: JumpRecord, depth: i32) -> Option<usize> {
        let idx = self.ensure(label);
        self.depths[idx].get_or_insert(depth);
        if let Some(address) = self.addresses[idx] {
            Some(address)
        } else {
            self.uses[idx].push(record);
            None
        }
    }

    /// Some label that was jumped to but never placed
    pub fn first_unplaced_use(&self) -> Option<Label> {
        self.uses
            .iter()
            .position(|uses| !uses.is_empty())
            .map(|idx| Label(idx as u32))
    }
}
