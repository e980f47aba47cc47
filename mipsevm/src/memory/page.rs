//! A 4 KiB page of memory carrying the cached hashes of its own Merkle
//! subtree.
//!
//! The 4096 bytes of a page are split into 128 leaves of 32 bytes. The 127
//! inner nodes above them are cached in an array indexed by their generalized
//! index local to the page (root = 1, children of `g` are `2g` and `2g + 1`),
//! so that the sibling of `g` is simply `g ^ 1`. Slot 0 is unused.

use crate::{
    cannon::{PAGE_ADDRESS_MASK, PAGE_ADDRESS_SIZE, PAGE_SIZE},
    hasher::{hash_pair, Hash},
};

/// Number of 32-byte leaves in a page.
pub const PAGE_LEAVES: usize = (PAGE_SIZE as usize) / 32;

/// Height of the intra-page tree, `log2(PAGE_LEAVES)`.
pub const PAGE_TREE_DEPTH: usize = (PAGE_ADDRESS_SIZE - 5) as usize;

#[derive(Clone)]
pub struct CachedPage {
    data: Box<[u8; PAGE_SIZE as usize]>,
    cache: Box<[Hash; PAGE_LEAVES]>,
    ok: [bool; PAGE_LEAVES],
}

impl Default for CachedPage {
    fn default() -> Self {
        CachedPage {
            data: Box::new([0u8; PAGE_SIZE as usize]),
            cache: Box::new([[0u8; 32]; PAGE_LEAVES]),
            ok: [false; PAGE_LEAVES],
        }
    }
}

impl std::fmt::Debug for CachedPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedPage")
            .field("valid_nodes", &self.ok.iter().filter(|b| **b).count())
            .finish()
    }
}

impl CachedPage {
    pub fn data(&self) -> &[u8] {
        &self.data[..]
    }

    /// Invalidate the cached nodes on the path from the 64-byte pair
    /// containing `page_addr` up to the page root.
    pub fn invalidate(&mut self, page_addr: u32) {
        // The bottom cache layer holds nodes hashing two 32-byte leaves,
        // hence the shift by 6.
        let mut k = (((1 << PAGE_ADDRESS_SIZE) | page_addr) >> 6) as usize;
        while k > 0 {
            self.ok[k] = false;
            k >>= 1;
        }
    }

    pub fn invalidate_full(&mut self) {
        self.ok = [false; PAGE_LEAVES];
    }

    /// Whether the page root is currently cached.
    pub fn is_root_valid(&self) -> bool {
        self.ok[1]
    }

    /// Copy `bytes` into the page starting at `page_addr`, returning the
    /// number of bytes written. Stops at the end of the page.
    pub fn write_range(&mut self, page_addr: u32, bytes: &[u8]) -> usize {
        let start = page_addr as usize;
        let n = std::cmp::min(bytes.len(), PAGE_SIZE as usize - start);
        self.data[start..start + n].copy_from_slice(&bytes[..n]);
        self.invalidate_full();
        n
    }

    pub fn get_word(&self, page_addr: u32) -> u32 {
        let start = (page_addr & PAGE_ADDRESS_MASK & !3) as usize;
        let bytes: [u8; 4] = [
            self.data[start],
            self.data[start + 1],
            self.data[start + 2],
            self.data[start + 3],
        ];
        u32::from_be_bytes(bytes)
    }

    pub fn set_word(&mut self, page_addr: u32, value: u32) {
        let start = (page_addr & PAGE_ADDRESS_MASK & !3) as usize;
        self.data[start..start + 4].copy_from_slice(&value.to_be_bytes());
        self.invalidate(page_addr);
    }

    fn leaf(&self, leaf_index: usize) -> Hash {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.data[leaf_index * 32..(leaf_index + 1) * 32]);
        out
    }

    /// Root of the page subtree, filling every missing cache slot.
    pub fn merkle_root(&mut self) -> Hash {
        // Bottom layer: nodes over two 32-byte leaves.
        for j in PAGE_LEAVES / 2..PAGE_LEAVES {
            if self.ok[j] {
                continue;
            }
            let i = (j - PAGE_LEAVES / 2) * 2;
            self.cache[j] = hash_pair(&self.leaf(i), &self.leaf(i + 1));
            self.ok[j] = true;
        }
        // Upper layers, bottom-up.
        for j in (1..PAGE_LEAVES / 2).rev() {
            if self.ok[j] {
                continue;
            }
            self.cache[j] = hash_pair(&self.cache[2 * j], &self.cache[2 * j + 1]);
            self.ok[j] = true;
        }
        self.cache[1]
    }

    /// Hash of the node at the page-local generalized index `gindex`,
    /// `1 <= gindex < 256`. Indices in `[128, 256)` are the raw leaves.
    pub fn merkleize_subtree(&mut self, gindex: u64) -> Hash {
        assert!(
            (1..2 * PAGE_LEAVES as u64).contains(&gindex),
            "page gindex {gindex} out of range"
        );
        let gindex = gindex as usize;
        if gindex >= PAGE_LEAVES {
            return self.leaf(gindex - PAGE_LEAVES);
        }
        self.merkle_root();
        self.cache[gindex]
    }
}
