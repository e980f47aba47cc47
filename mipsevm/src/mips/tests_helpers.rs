use crate::{
    cannon::PAGE_SIZE,
    mips::{instruction::debugging::InstructionParts, interpreter::InstrumentedState},
    preimage_oracle::InMemoryPreImageOracle,
    state::State,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

const PAGE_INDEX_EXECUTABLE_MEMORY: u32 = 1;

/// Start of the data page filled with random bytes by [dummy_vm].
pub(crate) const DATA_ADDRESS: u32 = 0x4000;

pub(crate) type TestVm = InstrumentedState<InMemoryPreImageOracle, Vec<u8>, Vec<u8>>;

pub(crate) fn make_test_rng() -> StdRng {
    StdRng::seed_from_u64(0x6d69_7073)
}

/// A VM with random registers, a random data page at [DATA_ADDRESS] and the
/// instruction pointer at the start of the executable page.
pub(crate) fn dummy_vm<RNG: Rng>(rng: &mut RNG) -> TestVm {
    let mut state = State::new(PAGE_INDEX_EXECUTABLE_MEMORY * PAGE_SIZE);
    for reg in state.registers.iter_mut().skip(1) {
        *reg = rng.gen();
    }
    let data: Vec<u8> = (0..PAGE_SIZE).map(|_| rng.gen()).collect();
    state
        .memory
        .set_memory_range(DATA_ADDRESS, &data[..])
        .unwrap();
    InstrumentedState::new(state, InMemoryPreImageOracle::new(), Vec::new(), Vec::new())
}

/// A VM whose registers are all zero and whose memory is empty.
pub(crate) fn empty_vm(pc: u32) -> TestVm {
    InstrumentedState::new(
        State::new(pc),
        InMemoryPreImageOracle::new(),
        Vec::new(),
        Vec::new(),
    )
}

// Write the instruction to the location of the instruction pointer.
pub(crate) fn write_instruction(vm: &mut TestVm, instruction_parts: InstructionParts) {
    let pc = vm.state.pc;
    vm.state
        .memory
        .set_memory(pc, instruction_parts.encode())
        .unwrap();
}

pub(crate) fn rtype(rs: u32, rt: u32, rd: u32, shamt: u32, funct: u32) -> InstructionParts {
    InstructionParts {
        op_code: 0,
        rs,
        rt,
        rd,
        shamt,
        funct,
    }
}

/// I-type instruction with the 16-bit immediate `imm`.
pub(crate) fn itype(op_code: u32, rs: u32, rt: u32, imm: u16) -> InstructionParts {
    let imm = imm as u32;
    InstructionParts {
        op_code,
        rs,
        rt,
        rd: imm >> 11,
        shamt: (imm >> 6) & 0x1F,
        funct: imm & 0x3F,
    }
}

pub(crate) fn jtype(op_code: u32, target: u32) -> InstructionParts {
    InstructionParts::decode((op_code << 26) | (target & 0x03FF_FFFF))
}

pub(crate) const SYSCALL: u32 = 0x0000_000C;
