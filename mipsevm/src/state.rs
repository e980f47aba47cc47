//! Architectural state of the VM and its canonical binary encoding.

use crate::{
    cannon::{
        deserialize_hex_bytes, deserialize_preimage_key, serialize_hex_bytes,
        serialize_preimage_key,
    },
    hasher::{keccak256, Hash},
    memory::Memory,
};
use core::fmt::{self, Display, Formatter};
use serde::{Deserialize, Serialize};

/// Size of the encoded state: memory root, pre-image key, 9 scalar fields and
/// the 32 registers.
pub const STATE_WITNESS_SIZE: usize = 32 + 32 + 4 * 6 + 1 + 1 + 8 + 32 * 4;

pub type StateWitness = [u8; STATE_WITNESS_SIZE];

// The renaming below keeps compatibility with OP Cannon's state format
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct State {
    pub memory: Memory,
    #[serde(
        rename = "preimageKey",
        deserialize_with = "deserialize_preimage_key",
        serialize_with = "serialize_preimage_key"
    )]
    pub preimage_key: [u8; 32],
    #[serde(rename = "preimageOffset")]
    pub preimage_offset: u32,
    pub pc: u32,
    #[serde(rename = "nextPC")]
    pub next_pc: u32,
    pub lo: u32,
    pub hi: u32,
    pub heap: u32,
    #[serde(rename = "exit")]
    pub exit_code: u8,
    pub exited: bool,
    pub step: u64,
    pub registers: [u32; 32],
    /// Hint bytes written by the program and not yet forwarded to the oracle.
    #[serde(
        default,
        deserialize_with = "deserialize_hex_bytes",
        serialize_with = "serialize_hex_bytes"
    )]
    pub last_hint: Vec<u8>,
}

impl State {
    /// Empty state with execution starting at `pc`.
    pub fn new(pc: u32) -> Self {
        State {
            pc,
            next_pc: pc.wrapping_add(4),
            ..State::default()
        }
    }

    /// Canonical big-endian encoding of the state, the memory being
    /// represented by its Merkle root.
    pub fn encode_witness(&mut self) -> StateWitness {
        let mut out = [0u8; STATE_WITNESS_SIZE];
        let mut offset = 0;
        let mut put = |bytes: &[u8]| {
            out[offset..offset + bytes.len()].copy_from_slice(bytes);
            offset += bytes.len();
        };
        put(&self.memory.merkle_root());
        put(&self.preimage_key);
        put(&self.preimage_offset.to_be_bytes());
        put(&self.pc.to_be_bytes());
        put(&self.next_pc.to_be_bytes());
        put(&self.lo.to_be_bytes());
        put(&self.hi.to_be_bytes());
        put(&self.heap.to_be_bytes());
        put(&[self.exit_code, self.exited as u8]);
        put(&self.step.to_be_bytes());
        for r in self.registers {
            put(&r.to_be_bytes());
        }
        out
    }

    pub fn state_hash(&mut self) -> Hash {
        keccak256(&self.encode_witness())
    }
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pages: {}\npreimage key: 0x{}\npreimage offset: {}\npc: {:#010x}\nnext pc: {:#010x}\nlo: {:#010x}\nhi: {:#010x}\nheap: {:#010x}\nstep: {}\nexited: {} (code {})\nregisters: {:08x?}",
            self.memory.page_count(),
            hex::encode(self.preimage_key),
            self.preimage_offset,
            self.pc,
            self.next_pc,
            self.lo,
            self.hi,
            self.heap,
            self.step,
            self.exited,
            self.exit_code,
            self.registers
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::{ZERO_HASHES, TREE_DEPTH};

    #[test]
    fn test_encode_witness_layout() {
        let mut state = State::new(0x1000);
        state.preimage_key = [0xAB; 32];
        state.preimage_offset = 0x01020304;
        state.lo = 0x11;
        state.hi = 0x22;
        state.heap = 0x4000_0000;
        state.exit_code = 7;
        state.exited = true;
        state.step = 0x0102_0304_0506_0708;
        state.registers[0] = 0;
        state.registers[31] = 0xCAFEBABE;

        let w = state.encode_witness();
        assert_eq!(w.len(), 226);
        assert_eq!(w[..32], ZERO_HASHES[TREE_DEPTH]);
        assert_eq!(w[32..64], [0xAB; 32]);
        assert_eq!(w[64..68], [1, 2, 3, 4]);
        assert_eq!(w[68..72], 0x1000u32.to_be_bytes());
        assert_eq!(w[72..76], 0x1004u32.to_be_bytes());
        assert_eq!(w[76..80], 0x11u32.to_be_bytes());
        assert_eq!(w[80..84], 0x22u32.to_be_bytes());
        assert_eq!(w[84..88], 0x4000_0000u32.to_be_bytes());
        assert_eq!(w[88], 7);
        assert_eq!(w[89], 1);
        assert_eq!(w[90..98], [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(w[98..102], [0; 4]);
        assert_eq!(w[222..226], 0xCAFEBABEu32.to_be_bytes());
    }

    #[test]
    fn test_state_hash_tracks_memory() {
        let mut state = State::new(0);
        let before = state.state_hash();
        state.memory.set_memory(0x100, 1).unwrap();
        assert_ne!(state.state_hash(), before);
    }

    #[test]
    fn test_json_roundtrip() {
        let mut state = State::new(0x400000);
        state.memory.set_memory(0x400000, 0x2402000A).unwrap();
        state.memory.set_memory(0x7FFF_F000, 0xFFFF_FFFF).unwrap();
        state.registers[29] = 0x7FFF_F000;
        state.last_hint = vec![0, 0, 0, 4, 1];
        state.step = 12;

        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains(r#""nextPC":4194308"#));
        assert!(json.contains(r#""last_hint":"0x0000000401""#));

        let mut back: State = serde_json::from_str(&json).unwrap();
        assert_eq!(back.memory.page_count(), 2);
        assert_eq!(back.last_hint, state.last_hint);
        assert_eq!(back.encode_witness(), state.encode_witness());
    }

    #[test]
    fn test_json_without_hint() {
        let json = r#"{"memory":[],"preimageKey":"0x0000000000000000000000000000000000000000000000000000000000000000","preimageOffset":0,"pc":0,"nextPC":4,"lo":0,"hi":0,"heap":0,"exit":0,"exited":false,"step":0,"registers":[0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0]}"#;
        let state: State = serde_json::from_str(json).unwrap();
        assert!(state.last_hint.is_empty());
        assert_eq!(state.next_pc, 4);
    }
}
