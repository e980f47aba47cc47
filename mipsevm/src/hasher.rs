//! Keccak-256 hashing used by the Merkleized memory and the state witness.

use once_cell::sync::Lazy;
use sha3::{Digest, Keccak256};

/// A 32-byte node of the memory Merkle tree.
pub type Hash = [u8; 32];

/// Height of the memory tree above its 32-byte leaves: 2^32 bytes split in
/// 2^27 leaves.
pub const TREE_DEPTH: usize = 32 - 5;

/// Number of entries in the zero-subtree table, one per height `0..=27`.
pub const ZERO_HASHES_LEN: usize = TREE_DEPTH + 1;

/// `ZERO_HASHES[h]` is the root of a fully-zeroed subtree of height `h` above
/// the leaves. `ZERO_HASHES[0]` is the all-zero leaf.
pub static ZERO_HASHES: Lazy<[Hash; ZERO_HASHES_LEN]> = Lazy::new(|| {
    let mut out = [[0u8; 32]; ZERO_HASHES_LEN];
    for i in 1..ZERO_HASHES_LEN {
        out[i] = hash_pair(&out[i - 1], &out[i - 1]);
    }
    out
});

pub fn keccak256(data: &[u8]) -> Hash {
    Keccak256::digest(data).into()
}

/// `H(left, right)`: keccak-256 over the 64-byte concatenation of both nodes.
pub fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Hash of an absent subtree whose root sits at `depth` in the tree (root at
/// depth 0, leaves at depth [TREE_DEPTH]).
pub fn zero_hash_at_depth(depth: usize) -> Hash {
    assert!(depth <= TREE_DEPTH, "depth {depth} is below the leaves");
    ZERO_HASHES[TREE_DEPTH - depth]
}
