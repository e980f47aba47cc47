/// Modules mimicking the structures used by the Cannon CLI: page and key
/// codecs, step frequencies, runner configuration.
pub mod cannon;

/// The `mipsevm` command line.
pub mod cli;

pub mod error;

/// Keccak-256 hashing and the table of zero-subtree roots.
pub mod hasher;

/// Sparse, paged memory Merkleized into a binary tree of depth 27.
pub mod memory;

/// Symbol table of the loaded program, used to name addresses in logs.
pub mod metadata;

pub mod mips;

/// Preimage oracle interface used by the VM.
pub mod preimage_oracle;

pub mod state;

pub mod utils;

/// Step witnesses and their encodings.
pub mod witness;

pub use error::VmError;
pub use mips::InstrumentedState;
pub use state::State;
