//! MIPS32 big-endian user-mode interpreter.

pub mod instruction;
pub mod interpreter;

#[cfg(test)]
mod tests_helpers;

pub use instruction::Instruction;
pub use interpreter::InstrumentedState;
