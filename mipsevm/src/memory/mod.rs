//! Page-addressed memory of the VM, Merkleized as a binary tree of depth 27
//! over 32-byte leaves.
//!
//! The tree is split in two parts:
//! - the top 20 levels address pages. Their nodes live in [Memory] and are
//!   keyed by generalized index. An absent entry is a zeroed subtree, a
//!   `None` entry is a node that was invalidated by a write and that must be
//!   recomputed, a `Some` entry is a cached hash.
//! - the bottom 7 levels live in each [CachedPage].
//!
//! Roots are computed lazily: after `n` word writes, the next root costs
//! `O(n)` hashes.

pub mod page;

use crate::{
    cannon::{Page, PAGE_ADDRESS_MASK, PAGE_ADDRESS_SIZE, PAGE_SIZE},
    hasher::{hash_pair, zero_hash_at_depth, Hash, TREE_DEPTH},
    utils::memory_size,
};
use itertools::Itertools;
use log::debug;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{
    collections::HashMap,
    io::{self, Read},
};
use thiserror::Error;

pub use page::CachedPage;

/// Number of bits of an address selecting its page.
pub const PAGE_KEY_SIZE: u32 = 32 - PAGE_ADDRESS_SIZE;
pub const PAGE_KEY_MASK: u64 = (1 << PAGE_KEY_SIZE) - 1;

/// Number of 32-byte hashes in a memory proof: the leaf followed by its 27
/// siblings.
pub const MEM_PROOF_LEAVES: usize = TREE_DEPTH + 1;
/// Size in bytes of a single memory proof.
pub const MEM_PROOF_SIZE: usize = MEM_PROOF_LEAVES * 32;

pub type MemoryProof = [u8; MEM_PROOF_SIZE];

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("unaligned memory access at address {0:#010x}")]
    UnalignedAddress(u32),
    #[error("failed to read memory contents: {0}")]
    Io(#[from] io::Error),
}

/// Generalized index of the 32-byte leaf containing `addr`.
pub fn leaf_gindex(addr: u32) -> u64 {
    ((1u64 << 32) | addr as u64) >> 5
}

/// Depth of `gindex` in the tree, the root being at depth 0.
pub fn gindex_depth(gindex: u64) -> usize {
    assert!(gindex > 0, "generalized indices start at 1");
    (63 - gindex.leading_zeros()) as usize
}

#[derive(Default, Clone, Debug)]
pub struct Memory {
    /// Inter-page nodes, above the page roots.
    nodes: HashMap<u64, Option<Hash>>,
    pages: HashMap<u32, CachedPage>,
}

impl Memory {
    pub fn new() -> Self {
        Memory::default()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Human-readable amount of allocated memory.
    pub fn usage(&self) -> String {
        memory_size(self.page_count() * PAGE_SIZE as usize)
    }

    pub fn page_lookup(&self, page_index: u32) -> Option<&CachedPage> {
        self.pages.get(&page_index)
    }

    /// Allocated pages, by increasing page index.
    pub fn pages(&self) -> impl Iterator<Item = (u32, &CachedPage)> {
        self.pages
            .iter()
            .sorted_by_key(|(index, _)| **index)
            .map(|(index, page)| (*index, page))
    }

    /// Mark every inter-page node above `page_index` as dirty.
    fn invalidate_nodes(&mut self, page_index: u32) {
        let mut gindex = ((1u64 << PAGE_KEY_SIZE) | page_index as u64) >> 1;
        while gindex > 0 {
            self.nodes.insert(gindex, None);
            gindex >>= 1;
        }
    }

    fn page_or_alloc(&mut self, page_index: u32) -> &mut CachedPage {
        if !self.pages.contains_key(&page_index) {
            debug!("Allocating page {page_index:#07x}");
            self.invalidate_nodes(page_index);
        }
        self.pages.entry(page_index).or_default()
    }

    /// Hash of the subtree rooted at `gindex`.
    pub fn merkleize_subtree(&mut self, gindex: u64) -> Hash {
        let depth = gindex_depth(gindex);
        assert!(depth <= TREE_DEPTH, "gindex {gindex:#x} is too deep");
        if depth >= PAGE_KEY_SIZE as usize {
            let depth_into_page = depth - PAGE_KEY_SIZE as usize;
            let page_index = ((gindex >> depth_into_page) & PAGE_KEY_MASK) as u32;
            return match self.pages.get_mut(&page_index) {
                Some(page) => {
                    let page_gindex =
                        (1 << depth_into_page) | (gindex & ((1 << depth_into_page) - 1));
                    page.merkleize_subtree(page_gindex)
                }
                None => zero_hash_at_depth(depth),
            };
        }
        match self.nodes.get(&gindex) {
            None => zero_hash_at_depth(depth),
            Some(Some(hash)) => *hash,
            Some(None) => {
                let left = self.merkleize_subtree(gindex << 1);
                let right = self.merkleize_subtree((gindex << 1) | 1);
                let hash = hash_pair(&left, &right);
                self.nodes.insert(gindex, Some(hash));
                hash
            }
        }
    }

    pub fn merkle_root(&mut self) -> Hash {
        self.merkleize_subtree(1)
    }

    /// Proof for the 32-byte leaf containing `addr`: the leaf itself, then
    /// its siblings from the bottom of the tree up to the children of the
    /// root.
    pub fn merkle_proof(&mut self, addr: u32) -> MemoryProof {
        let mut out = [0u8; MEM_PROOF_SIZE];
        let mut gindex = leaf_gindex(addr);
        out[..32].copy_from_slice(&self.merkleize_subtree(gindex));
        for i in 1..MEM_PROOF_LEAVES {
            let sibling = self.merkleize_subtree(gindex ^ 1);
            out[i * 32..(i + 1) * 32].copy_from_slice(&sibling);
            gindex >>= 1;
        }
        out
    }

    /// Big-endian word at the 4-byte aligned address `addr`. Absent pages
    /// read as zero.
    pub fn get_memory(&self, addr: u32) -> Result<u32, MemoryError> {
        if addr & 3 != 0 {
            return Err(MemoryError::UnalignedAddress(addr));
        }
        Ok(self
            .page_lookup(addr >> PAGE_ADDRESS_SIZE)
            .map_or(0, |page| page.get_word(addr & PAGE_ADDRESS_MASK)))
    }

    /// Write the big-endian word `value` at the 4-byte aligned address
    /// `addr`, allocating the page if needed.
    pub fn set_memory(&mut self, addr: u32, value: u32) -> Result<(), MemoryError> {
        if addr & 3 != 0 {
            return Err(MemoryError::UnalignedAddress(addr));
        }
        let page_index = addr >> PAGE_ADDRESS_SIZE;
        self.page_or_alloc(page_index)
            .set_word(addr & PAGE_ADDRESS_MASK, value);
        self.invalidate_nodes(page_index);
        Ok(())
    }

    /// Copy the contents of `reader` into memory starting at `addr`, until
    /// the reader is exhausted. Ranges may span several pages and may be
    /// unaligned.
    pub fn set_memory_range<R: Read>(
        &mut self,
        addr: u32,
        mut reader: R,
    ) -> Result<(), MemoryError> {
        let mut addr = addr;
        let mut buf = [0u8; PAGE_SIZE as usize];
        loop {
            let page_index = addr >> PAGE_ADDRESS_SIZE;
            let page_addr = addr & PAGE_ADDRESS_MASK;
            let space = (PAGE_SIZE - page_addr) as usize;
            let n = match reader.read(&mut buf[..space]) {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            self.page_or_alloc(page_index)
                .write_range(page_addr, &buf[..n]);
            self.invalidate_nodes(page_index);
            addr = addr.wrapping_add(n as u32);
        }
    }

    /// Lazy reader over `count` bytes starting at `addr`. Absent pages read as
    /// zeroes.
    pub fn read_memory_range(&self, addr: u32, count: u32) -> MemoryRangeReader<'_> {
        MemoryRangeReader {
            memory: self,
            addr,
            count,
        }
    }

    pub fn to_pages(&self) -> Vec<Page> {
        self.pages()
            .map(|(index, page)| Page {
                index,
                data: page.data().to_vec(),
            })
            .collect()
    }

    pub fn from_pages(pages: Vec<Page>) -> Result<Self, MemoryError> {
        let mut memory = Memory::new();
        for page in pages {
            memory.set_memory_range(page.index << PAGE_ADDRESS_SIZE, &page.data[..])?;
        }
        Ok(memory)
    }
}

pub struct MemoryRangeReader<'a> {
    memory: &'a Memory,
    addr: u32,
    count: u32,
}

impl Read for MemoryRangeReader<'_> {
    fn read(&mut self, dest: &mut [u8]) -> io::Result<usize> {
        if self.count == 0 || dest.is_empty() {
            return Ok(0);
        }
        let end_addr = self.addr.wrapping_add(self.count);
        let page_index = self.addr >> PAGE_ADDRESS_SIZE;
        let start = (self.addr & PAGE_ADDRESS_MASK) as usize;
        let end = if page_index == end_addr >> PAGE_ADDRESS_SIZE && end_addr > self.addr {
            (end_addr & PAGE_ADDRESS_MASK) as usize
        } else {
            PAGE_SIZE as usize
        };
        let n = std::cmp::min(dest.len(), end - start);
        match self.memory.page_lookup(page_index) {
            Some(page) => dest[..n].copy_from_slice(&page.data()[start..start + n]),
            None => dest[..n].fill(0),
        }
        self.addr = self.addr.wrapping_add(n as u32);
        self.count -= n as u32;
        Ok(n)
    }
}

/// Check `proof` for the leaf containing `addr` against `root`.
pub fn verify_proof(root: &Hash, addr: u32, proof: &[u8]) -> bool {
    if proof.len() != MEM_PROOF_SIZE {
        return false;
    }
    let mut node: Hash = [0u8; 32];
    node.copy_from_slice(&proof[..32]);
    let mut gindex = leaf_gindex(addr);
    for sibling in proof[32..].chunks_exact(32) {
        let mut other: Hash = [0u8; 32];
        other.copy_from_slice(sibling);
        node = if gindex & 1 == 1 {
            hash_pair(&other, &node)
        } else {
            hash_pair(&node, &other)
        };
        gindex >>= 1;
    }
    node == *root
}

/// Big-endian word at `addr` within the leaf carried by `proof`.
pub fn proof_leaf_word(proof: &[u8], addr: u32) -> u32 {
    let offset = (addr & 0x1C) as usize;
    let mut word = [0u8; 4];
    word.copy_from_slice(&proof[offset..offset + 4]);
    u32::from_be_bytes(word)
}

impl Serialize for Memory {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_pages().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Memory {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let pages: Vec<Page> = Deserialize::deserialize(deserializer)?;
        Memory::from_pages(pages).map_err(de::Error::custom)
    }
}
