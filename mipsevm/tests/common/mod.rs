#![allow(dead_code)]

use mipsevm::{
    hasher::{hash_pair, Hash, TREE_DEPTH, ZERO_HASHES},
    memory::Memory,
    mips::InstrumentedState,
    preimage_oracle::InMemoryPreImageOracle,
    state::State,
};
use std::collections::BTreeMap;

pub type TestVm = InstrumentedState<InMemoryPreImageOracle, Vec<u8>, Vec<u8>>;

/// VM starting at `pc` with `program` loaded at the given addresses.
pub fn vm_with_program(pc: u32, program: &[(u32, u32)]) -> TestVm {
    let mut state = State::new(pc);
    for (addr, insn) in program {
        state.memory.set_memory(*addr, *insn).unwrap();
    }
    InstrumentedState::new(state, InMemoryPreImageOracle::new(), Vec::new(), Vec::new())
}

/// Merkleization of the memory contents computed level by level from the
/// raw page bytes, without any caching.
pub fn naive_merkle_root(memory: &Memory) -> Hash {
    let mut level: BTreeMap<u64, Hash> = BTreeMap::new();
    for (index, page) in memory.pages() {
        for (i, chunk) in page.data().chunks(32).enumerate() {
            level.insert(((index as u64) << 7) | i as u64, chunk.try_into().unwrap());
        }
    }
    for height in 0..TREE_DEPTH {
        let zero = ZERO_HASHES[height];
        let mut parents = BTreeMap::new();
        for (&idx, node) in &level {
            let parent = idx >> 1;
            if parents.contains_key(&parent) {
                continue;
            }
            let (left, right) = if idx & 1 == 0 {
                (*node, level.get(&(idx | 1)).copied().unwrap_or(zero))
            } else {
                (zero, *node)
            };
            parents.insert(parent, hash_pair(&left, &right));
        }
        level = parents;
    }
    level.get(&0).copied().unwrap_or(ZERO_HASHES[TREE_DEPTH])
}
