use crate::{memory::MemoryError, preimage_oracle::OracleError};
use thiserror::Error;

/// Fatal conditions of a step. A step returning one of these leaves the
/// state untouched.
#[derive(Error, Debug)]
pub enum VmError {
    #[error("unaligned program counter {0:#010x}")]
    UnalignedPc(u32),
    #[error("unaligned access at {addr:#010x}, expected alignment on {required} bytes")]
    UnalignedAccess { addr: u32, required: u32 },
    #[error("unknown instruction {0:#010x}")]
    UnknownInstruction(u32),
    #[error("break instruction at pc {pc:#010x}")]
    Break { pc: u32 },
    #[error("multiple memory accesses in one step: {first:#010x} and {second:#010x}")]
    MultipleMemoryAccesses { first: u32, second: u32 },
    #[error("jump or branch in a delay slot at pc {pc:#010x}")]
    JumpInDelaySlot { pc: u32 },
    #[error("division by zero at pc {pc:#010x}")]
    DivideByZero { pc: u32 },
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error("pre-image oracle failure: {0}")]
    Oracle(#[from] OracleError),
    #[error("failed to write guest output: {0}")]
    Io(#[from] std::io::Error),
}
