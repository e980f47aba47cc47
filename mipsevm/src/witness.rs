//! Step witnesses: everything an on-chain verifier needs to replay one step.

use crate::{
    cannon::{
        deserialize_hex_bytes, deserialize_preimage_key, serialize_hex_bytes,
        serialize_preimage_key,
    },
    hasher::{keccak256, Hash},
    memory::MEM_PROOF_SIZE,
    state::STATE_WITNESS_SIZE,
};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Selector of the verifier entry point `Step(bytes32,bytes,bytes)`.
pub static STEP_SELECTOR: Lazy<[u8; 4]> = Lazy::new(|| {
    let h = keccak256(b"Step(bytes32,bytes,bytes)");
    [h[0], h[1], h[2], h[3]]
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepWitness {
    /// Encoded pre-state.
    pub state: Vec<u8>,
    /// Proof of the instruction word, followed by the proof of the data word
    /// when the step accessed memory.
    pub mem_proof: Vec<u8>,
    pub preimage_key: Option<[u8; 32]>,
    /// Raw pre-image, without its length prefix.
    pub preimage_value: Option<Vec<u8>>,
    /// Pre-image offset at the end of the step.
    pub preimage_offset: Option<u32>,
}

fn pad32(len: usize) -> usize {
    len.div_ceil(32) * 32
}

fn abi_word(value: usize) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[24..].copy_from_slice(&(value as u64).to_be_bytes());
    out
}

fn abi_bytes(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&abi_word(data.len()));
    out.extend_from_slice(data);
    out.resize(out.len() + pad32(data.len()) - data.len(), 0);
}

impl StepWitness {
    pub fn state_hash(&self) -> Hash {
        keccak256(&self.state)
    }

    pub fn has_preimage(&self) -> bool {
        self.preimage_key.is_some()
    }

    /// Number of memory proofs carried by the witness.
    pub fn proof_count(&self) -> usize {
        self.mem_proof.len() / MEM_PROOF_SIZE
    }

    /// Calldata of `Step(bytes32 stateHash, bytes state, bytes proof)`.
    pub fn encode_step_input(&self) -> Vec<u8> {
        debug_assert_eq!(self.state.len(), STATE_WITNESS_SIZE);
        let head = 3 * 32;
        let state_offset = head;
        let proof_offset = state_offset + 32 + pad32(self.state.len());

        let mut out = Vec::with_capacity(4 + proof_offset + 32 + pad32(self.mem_proof.len()));
        out.extend_from_slice(&*STEP_SELECTOR);
        out.extend_from_slice(&self.state_hash());
        out.extend_from_slice(&abi_word(state_offset));
        out.extend_from_slice(&abi_word(proof_offset));
        abi_bytes(&mut out, &self.state);
        abi_bytes(&mut out, &self.mem_proof);
        out
    }
}

mod opt_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(v) => serializer.serialize_str(&format!("0x{}", hex::encode(v))),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let s: Option<String> = Deserialize::deserialize(deserializer)?;
        s.map(|s| hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Proof file written by the runner for a witnessed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StepProof {
    pub step: u64,
    #[serde(
        deserialize_with = "deserialize_preimage_key",
        serialize_with = "serialize_preimage_key"
    )]
    pub pre: Hash,
    #[serde(
        deserialize_with = "deserialize_preimage_key",
        serialize_with = "serialize_preimage_key"
    )]
    pub post: Hash,
    #[serde(
        deserialize_with = "deserialize_hex_bytes",
        serialize_with = "serialize_hex_bytes"
    )]
    pub state_data: Vec<u8>,
    #[serde(
        deserialize_with = "deserialize_hex_bytes",
        serialize_with = "serialize_hex_bytes"
    )]
    pub proof_data: Vec<u8>,
    #[serde(default, with = "opt_hex", skip_serializing_if = "Option::is_none")]
    pub oracle_key: Option<Vec<u8>>,
    #[serde(default, with = "opt_hex", skip_serializing_if = "Option::is_none")]
    pub oracle_value: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oracle_offset: Option<u32>,
}

impl StepProof {
    /// Proof of the step numbered `step`, leading to the state hashed as
    /// `post`.
    pub fn create(step: u64, witness: &StepWitness, post: Hash) -> Self {
        StepProof {
            step,
            pre: witness.state_hash(),
            post,
            state_data: witness.state.clone(),
            proof_data: witness.mem_proof.clone(),
            oracle_key: witness.preimage_key.map(|k| k.to_vec()),
            oracle_value: witness.preimage_value.clone(),
            oracle_offset: witness.preimage_offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_witness(proofs: usize) -> StepWitness {
        StepWitness {
            state: (0..STATE_WITNESS_SIZE).map(|i| i as u8).collect(),
            mem_proof: vec![0xEE; proofs * MEM_PROOF_SIZE],
            preimage_key: None,
            preimage_value: None,
            preimage_offset: None,
        }
    }

    #[test]
    fn test_step_selector() {
        assert_eq!(*STEP_SELECTOR, [0x39, 0x24, 0xa4, 0x7b]);
    }

    #[test]
    fn test_encode_step_input_layout() {
        let witness = dummy_witness(2);
        let input = witness.encode_step_input();

        assert_eq!(input[..4], *STEP_SELECTOR);
        assert_eq!(input[4..36], witness.state_hash());
        assert_eq!(input[36..68], abi_word(0x60));
        assert_eq!(input[68..100], abi_word(384));
        // state: length, 226 bytes, padded to 256
        assert_eq!(input[100..132], abi_word(226));
        assert_eq!(input[132..358], witness.state[..]);
        assert!(input[358..388].iter().all(|b| *b == 0));
        // proof: starts at 4 + 384
        assert_eq!(input[388..420], abi_word(2 * MEM_PROOF_SIZE));
        assert_eq!(input[420..], witness.mem_proof[..]);
        assert_eq!(input.len(), 4 + 384 + 32 + 2 * MEM_PROOF_SIZE);
        assert_eq!(witness.proof_count(), 2);
    }

    #[test]
    fn test_step_proof_json() {
        let mut witness = dummy_witness(1);
        let proof = StepProof::create(3, &witness, [0x11; 32]);
        let json = serde_json::to_value(&proof).unwrap();
        assert_eq!(json["step"], 3);
        assert_eq!(
            json["post"],
            format!("0x{}", hex::encode([0x11; 32])).as_str()
        );
        assert!(json["state-data"].as_str().unwrap().starts_with("0x0001"));
        assert!(json.get("oracle-key").is_none());

        witness.preimage_key = Some([2; 32]);
        witness.preimage_value = Some(vec![1, 2, 3]);
        witness.preimage_offset = Some(9);
        let proof = StepProof::create(3, &witness, [0x11; 32]);
        let json = serde_json::to_string(&proof).unwrap();
        assert!(json.contains(r#""oracle-value":"0x010203""#));
        assert!(json.contains(r#""oracle-offset":9"#));
        let back: StepProof = serde_json::from_str(&json).unwrap();
        assert_eq!(back, proof);
    }
}
