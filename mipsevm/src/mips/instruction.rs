//! MIPS32 instruction set understood by the VM, and its decoding.
//!
//! Syscalls are decoded into sub-instructions depending on the syscall number
//! held in `$v0` and, for `read`/`write`, on the file descriptor in `$a0`.

use crate::{
    cannon::{FD_HINT_WRITE, FD_PREIMAGE_READ, FD_PREIMAGE_WRITE},
    error::VmError,
};
use strum::{EnumCount, IntoEnumIterator};
use strum_macros::{EnumCount, EnumIter};

pub const SYSCALL_MMAP: u32 = 4090;
pub const SYSCALL_BRK: u32 = 4045;
pub const SYSCALL_CLONE: u32 = 4120;
pub const SYSCALL_EXIT_GROUP: u32 = 4246;
pub const SYSCALL_READ: u32 = 4003;
pub const SYSCALL_WRITE: u32 = 4004;
pub const SYSCALL_FCNTL: u32 = 4055;

pub const REGISTER_V0: usize = 2;
pub const REGISTER_A0: usize = 4;
pub const REGISTER_A1: usize = 5;
pub const REGISTER_A2: usize = 6;
pub const REGISTER_A3: usize = 7;
pub const REGISTER_RA: usize = 31;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Instruction {
    RType(RTypeInstruction),
    JType(JTypeInstruction),
    IType(ITypeInstruction),
}

#[derive(
    Debug, Clone, Copy, Eq, PartialEq, EnumCount, EnumIter, Default, Hash, Ord, PartialOrd,
)]
pub enum RTypeInstruction {
    #[default]
    ShiftLeftLogical, // sll
    ShiftRightLogical,            // srl
    ShiftRightArithmetic,         // sra
    ShiftLeftLogicalVariable,     // sllv
    ShiftRightLogicalVariable,    // srlv
    ShiftRightArithmeticVariable, // srav
    JumpRegister,                 // jr
    JumpAndLinkRegister,          // jalr
    SyscallMmap,                  // syscall (Mmap)
    SyscallBrk,                   // syscall (Brk)
    SyscallClone,                 // syscall (Clone)
    SyscallExitGroup,             // syscall (ExitGroup)
    SyscallReadPreimage,          // syscall (Read 5)
    SyscallReadOther,             // syscall (Read ?)
    SyscallWriteHint,             // syscall (Write 4)
    SyscallWritePreimage,         // syscall (Write 6)
    SyscallWriteOther,            // syscall (Write ?)
    SyscallFcntl,                 // syscall (Fcntl)
    SyscallOther,                 // syscall (?)
    Break,                        // break
    MoveZero,                     // movz
    MoveNonZero,                  // movn
    Sync,                         // sync
    MoveFromHi,                   // mfhi
    MoveToHi,                     // mthi
    MoveFromLo,                   // mflo
    MoveToLo,                     // mtlo
    Multiply,                     // mult
    MultiplyUnsigned,             // multu
    Div,                          // div
    DivUnsigned,                  // divu
    Add,                          // add
    AddUnsigned,                  // addu
    Sub,                          // sub
    SubUnsigned,                  // subu
    And,                          // and
    Or,                           // or
    Xor,                          // xor
    Nor,                          // nor
    SetLessThan,                  // slt
    SetLessThanUnsigned,          // sltu
    MultiplyToRegister,           // mul
    CountLeadingOnes,             // clo
    CountLeadingZeros,            // clz
}

#[derive(
    Debug, Clone, Copy, Eq, PartialEq, EnumCount, EnumIter, Default, Hash, Ord, PartialOrd,
)]
pub enum JTypeInstruction {
    #[default]
    Jump, // j
    JumpAndLink, // jal
}

#[derive(
    Debug, Clone, Copy, Eq, PartialEq, EnumCount, EnumIter, Default, Hash, Ord, PartialOrd,
)]
pub enum ITypeInstruction {
    #[default]
    BranchEq, // beq
    BranchNeq,                    // bne
    BranchLeqZero,                // blez
    BranchGtZero,                 // bgtz
    BranchLtZero,                 // bltz
    BranchGeqZero,                // bgez
    BranchGeqZeroAndLink,         // bgezal
    RegimmNop,                    // regimm with an unsupported rt, never taken
    AddImmediate,                 // addi
    AddImmediateUnsigned,         // addiu
    SetLessThanImmediate,         // slti
    SetLessThanImmediateUnsigned, // sltiu
    AndImmediate,                 // andi
    OrImmediate,                  // ori
    XorImmediate,                 // xori
    LoadUpperImmediate,           // lui
    Load8,                        // lb
    Load16,                       // lh
    Load32,                       // lw
    Load8Unsigned,                // lbu
    Load16Unsigned,               // lhu
    LoadWordLeft,                 // lwl
    LoadWordRight,                // lwr
    LoadLinked,                   // ll
    Store8,                       // sb
    Store16,                      // sh
    Store32,                      // sw
    Store32Conditional,           // sc
    StoreWordLeft,                // swl
    StoreWordRight,               // swr
}

impl Instruction {
    /// Every instruction the VM knows about.
    pub fn iter() -> impl Iterator<Item = Instruction> {
        RTypeInstruction::iter()
            .map(Instruction::RType)
            .chain(JTypeInstruction::iter().map(Instruction::JType))
            .chain(ITypeInstruction::iter().map(Instruction::IType))
    }

    pub const COUNT: usize =
        RTypeInstruction::COUNT + JTypeInstruction::COUNT + ITypeInstruction::COUNT;

    /// Whether the instruction changes the control flow. Such instructions
    /// may not sit in a delay slot.
    pub fn is_branch(&self) -> bool {
        use ITypeInstruction::*;
        use RTypeInstruction::*;
        matches!(
            self,
            Instruction::JType(_)
                | Instruction::RType(JumpRegister | JumpAndLinkRegister)
                | Instruction::IType(
                    BranchEq
                        | BranchNeq
                        | BranchLeqZero
                        | BranchGtZero
                        | BranchLtZero
                        | BranchGeqZero
                        | BranchGeqZeroAndLink
                        | RegimmNop
                )
        )
    }
}

/// Decode `instruction`. `registers` is consulted for syscalls only.
pub fn decode(instruction: u32, registers: &[u32; 32]) -> Result<Instruction, VmError> {
    use ITypeInstruction::*;
    use JTypeInstruction::*;
    use RTypeInstruction::*;

    let unknown = || VmError::UnknownInstruction(instruction);
    let parts = debugging::InstructionParts::decode(instruction);

    let decoded = match parts.op_code {
        0x00 => Instruction::RType(match parts.funct {
            0x00 => ShiftLeftLogical,
            0x02 => ShiftRightLogical,
            0x03 => ShiftRightArithmetic,
            0x04 => ShiftLeftLogicalVariable,
            0x06 => ShiftRightLogicalVariable,
            0x07 => ShiftRightArithmeticVariable,
            0x08 => JumpRegister,
            0x09 => JumpAndLinkRegister,
            0x0a => MoveZero,
            0x0b => MoveNonZero,
            0x0c => decode_syscall(registers),
            0x0d => Break,
            0x0f => Sync,
            0x10 => MoveFromHi,
            0x11 => MoveToHi,
            0x12 => MoveFromLo,
            0x13 => MoveToLo,
            0x18 => Multiply,
            0x19 => MultiplyUnsigned,
            0x1a => Div,
            0x1b => DivUnsigned,
            0x20 => Add,
            0x21 => AddUnsigned,
            0x22 => Sub,
            0x23 => SubUnsigned,
            0x24 => And,
            0x25 => Or,
            0x26 => Xor,
            0x27 => Nor,
            0x2a => SetLessThan,
            0x2b => SetLessThanUnsigned,
            _ => return Err(unknown()),
        }),
        0x01 => Instruction::IType(match parts.rt {
            0x00 => BranchLtZero,
            0x01 => BranchGeqZero,
            0x11 => BranchGeqZeroAndLink,
            _ => RegimmNop,
        }),
        0x02 => Instruction::JType(Jump),
        0x03 => Instruction::JType(JumpAndLink),
        0x04 => Instruction::IType(BranchEq),
        0x05 => Instruction::IType(BranchNeq),
        0x06 => Instruction::IType(BranchLeqZero),
        0x07 => Instruction::IType(BranchGtZero),
        0x08 => Instruction::IType(AddImmediate),
        0x09 => Instruction::IType(AddImmediateUnsigned),
        0x0a => Instruction::IType(SetLessThanImmediate),
        0x0b => Instruction::IType(SetLessThanImmediateUnsigned),
        0x0c => Instruction::IType(AndImmediate),
        0x0d => Instruction::IType(OrImmediate),
        0x0e => Instruction::IType(XorImmediate),
        0x0f => Instruction::IType(LoadUpperImmediate),
        0x1c => Instruction::RType(match parts.funct {
            0x02 => MultiplyToRegister,
            0x20 => CountLeadingZeros,
            0x21 => CountLeadingOnes,
            _ => return Err(unknown()),
        }),
        0x20 => Instruction::IType(Load8),
        0x21 => Instruction::IType(Load16),
        0x22 => Instruction::IType(LoadWordLeft),
        0x23 => Instruction::IType(Load32),
        0x24 => Instruction::IType(Load8Unsigned),
        0x25 => Instruction::IType(Load16Unsigned),
        0x26 => Instruction::IType(LoadWordRight),
        0x28 => Instruction::IType(Store8),
        0x29 => Instruction::IType(Store16),
        0x2a => Instruction::IType(StoreWordLeft),
        0x2b => Instruction::IType(Store32),
        0x2e => Instruction::IType(StoreWordRight),
        // Single processor: ll and sc always succeed.
        0x30 => Instruction::IType(LoadLinked),
        0x38 => Instruction::IType(Store32Conditional),
        _ => return Err(unknown()),
    };
    Ok(decoded)
}

fn decode_syscall(registers: &[u32; 32]) -> RTypeInstruction {
    use RTypeInstruction::*;
    match registers[REGISTER_V0] {
        SYSCALL_MMAP => SyscallMmap,
        SYSCALL_BRK => SyscallBrk,
        SYSCALL_CLONE => SyscallClone,
        SYSCALL_EXIT_GROUP => SyscallExitGroup,
        SYSCALL_READ => match registers[REGISTER_A0] {
            FD_PREIMAGE_READ => SyscallReadPreimage,
            _ => SyscallReadOther,
        },
        SYSCALL_WRITE => match registers[REGISTER_A0] {
            FD_HINT_WRITE => SyscallWriteHint,
            FD_PREIMAGE_WRITE => SyscallWritePreimage,
            _ => SyscallWriteOther,
        },
        SYSCALL_FCNTL => SyscallFcntl,
        // Well-defined: returns 0
        _ => SyscallOther,
    }
}

pub mod debugging {
    use serde::{Deserialize, Serialize};
    #[derive(Debug, Clone, Copy, Eq, PartialEq, Default, Serialize, Deserialize)]
    pub struct InstructionParts {
        pub op_code: u32,
        pub rs: u32,
        pub rt: u32,
        pub rd: u32,
        pub shamt: u32,
        pub funct: u32,
    }

    impl InstructionParts {
        pub fn decode(instruction: u32) -> Self {
            InstructionParts {
                op_code: instruction >> 26,
                rs: (instruction >> 21) & 0x1F,
                rt: (instruction >> 16) & 0x1F,
                rd: (instruction >> 11) & 0x1F,
                shamt: (instruction >> 6) & 0x1F,
                funct: instruction & 0x3F,
            }
        }

        pub fn encode(self) -> u32 {
            (self.op_code << 26)
                | (self.rs << 21)
                | (self.rt << 16)
                | (self.rd << 11)
                | (self.shamt << 6)
                | self.funct
        }

        /// The 16-bit immediate of I-type instructions.
        pub fn immediate(&self) -> u32 {
            ((self.rd << 11) | (self.shamt << 6) | self.funct) & 0xFFFF
        }

        /// The 26-bit target of J-type instructions.
        pub fn target(&self) -> u32 {
            self.encode() & 0x03FF_FFFF
        }
    }
}
