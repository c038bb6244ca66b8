use super::class_file::ConstantPoolOverflow;
use super::code::{Label, MonitorId};
use super::BinaryName;
use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// A label was referenced (by a jump, an exception range, or a local variable scope) but
    /// never placed
    UnplacedLabel { method: String, label: Label },

    /// Labels are placed exactly once
    LabelAlreadyPlaced {
        method: String,
        label: Label,
        offset: usize,
    },

    /// The running stack depth went below zero
    StackUnderflow { method: String, offset: usize },

    /// Replaying the recorded stack and local effects of a block failed
    Verifier {
        method: String,
        offset: usize,
        kind: FrameErrorKind,
    },

    /// Local variable indices must fit in the `wide` form (`u16`)
    LocalIndexOverflow {
        method: String,
        offset: usize,
        index: usize,
    },

    /// The stack effect of this opcode depends on its operands
    VariableStackEffect {
        method: String,
        offset: usize,
        opcode: u8,
    },

    /// Branch and switch opcodes must be emitted with their labels
    BranchWithoutLabel {
        method: String,
        offset: usize,
        opcode: u8,
    },

    MonitorStackEmpty { method: String, offset: usize },
    UnknownMonitor {
        method: String,
        offset: usize,
        monitor: MonitorId,
    },

    /// Method was finished with monitors still entered
    OpenMonitors { method: String, count: usize },

    /// Execution can run past the last instruction
    FallsOffEnd { method: String, offset: usize },

    MethodCodeOverflow { method: String, length: usize },
    MaxStackOverflow { method: String, max_stack: usize },
    MaxLocalsOverflow { method: String, max_locals: usize },

    ConstantPoolOverflow(ConstantPoolOverflow),
    IoError(std::io::Error),

    InvalidDescriptor(String),
    InvalidBinaryName(String),

    /// A class was declared twice with different superclasses
    ConflictingSupertype {
        class: BinaryName,
        existing: String,
        requested: String,
    },
}

/// Problems detected while simulating the effect of instructions on a frame
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FrameErrorKind {
    /// Popped or inspected more values than were on the stack
    EmptyStack,

    /// Operation is not defined for values of this width
    InvalidWidth(usize),

    /// Local variable index that can't hold the value
    InvalidIndex(usize),
}

impl From<ConstantPoolOverflow> for Error {
    fn from(overflow: ConstantPoolOverflow) -> Error {
        Error::ConstantPoolOverflow(overflow)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UnplacedLabel { method, label } => {
                write!(f, "{}: label {:?} is used but never placed", method, label)
            }
            Error::LabelAlreadyPlaced {
                method,
                label,
                offset,
            } => write!(
                f,
                "{}: label {:?} placed a second time (at offset {})",
                method, label, offset
            ),
            Error::StackUnderflow { method, offset } => {
                write!(f, "{}: operand stack underflow at offset {}", method, offset)
            }
            Error::Verifier {
                method,
                offset,
                kind,
            } => write!(
                f,
                "{}: invalid frame in block at offset {}: {}",
                method, offset, kind
            ),
            Error::LocalIndexOverflow {
                method,
                offset,
                index,
            } => write!(
                f,
                "{}: local index {} out of range at offset {}",
                method, index, offset
            ),
            Error::VariableStackEffect {
                method,
                offset,
                opcode,
            } => write!(
                f,
                "{}: opcode 0x{:02x} at offset {} needs an explicit stack change",
                method, opcode, offset
            ),
            Error::BranchWithoutLabel {
                method,
                offset,
                opcode,
            } => write!(
                f,
                "{}: branch opcode 0x{:02x} at offset {} emitted without a target label",
                method, opcode, offset
            ),
            Error::MonitorStackEmpty { method, offset } => {
                write!(f, "{}: no monitor to exit at offset {}", method, offset)
            }
            Error::UnknownMonitor {
                method,
                offset,
                monitor,
            } => write!(
                f,
                "{}: monitor {:?} is not active at offset {}",
                method, monitor, offset
            ),
            Error::OpenMonitors { method, count } => {
                write!(f, "{}: {} monitor(s) never exited", method, count)
            }
            Error::FallsOffEnd { method, offset } => {
                write!(f, "{}: execution falls off the end at offset {}", method, offset)
            }
            Error::MethodCodeOverflow { method, length } => {
                write!(f, "{}: method code is too long ({} bytes)", method, length)
            }
            Error::MaxStackOverflow { method, max_stack } => {
                write!(f, "{}: max stack {} does not fit in u16", method, max_stack)
            }
            Error::MaxLocalsOverflow { method, max_locals } => {
                write!(f, "{}: max locals {} does not fit in u16", method, max_locals)
            }
            Error::ConstantPoolOverflow(overflow) => write!(
                f,
                "constant pool overflow adding {:?} at index {}",
                overflow.constant, overflow.offset
            ),
            Error::IoError(err) => write!(f, "{}", err),
            Error::InvalidDescriptor(msg) | Error::InvalidBinaryName(msg) => f.write_str(msg),
            Error::ConflictingSupertype {
                class,
                existing,
                requested,
            } => write!(
                f,
                "class {} already has supertype {} (requested {})",
                class, existing, requested
            ),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for FrameErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameErrorKind::EmptyStack => f.write_str("stack is too shallow"),
            FrameErrorKind::InvalidWidth(width) => write!(f, "unexpected value width {}", width),
            FrameErrorKind::InvalidIndex(index) => write!(f, "invalid local index {}", index),
        }
    }
}
