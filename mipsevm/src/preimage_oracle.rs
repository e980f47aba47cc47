use crate::{
    cannon::{
        Hint, HostProgram, Preimage, HINT_CLIENT_READ_FD, HINT_CLIENT_WRITE_FD,
        PREIMAGE_CLIENT_READ_FD, PREIMAGE_CLIENT_WRITE_FD,
    },
    hasher::keccak256,
};
use command_fds::{CommandFdExt, FdMapping};
use log::{debug, warn};
use os_pipe::{PipeReader, PipeWriter};
use std::{
    collections::HashMap,
    io::{Read, Write},
    os::fd::{FromRawFd, IntoRawFd, OwnedFd},
    process::{Child, Command},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OracleError {
    #[error("unknown pre-image key 0x{}", hex::encode(.0))]
    UnknownKey([u8; 32]),
    #[error("no pre-image oracle configured")]
    NoOracle,
    #[error("pre-image oracle channel failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("truncated pre-image: expected {expected} bytes, got {got}")]
    TruncatedResponse { expected: u64, got: u64 },
}

/// Source of pre-images consumed by the VM.
pub trait PreImageOracleT {
    fn get_preimage(&mut self, key: [u8; 32]) -> Result<Preimage, OracleError>;

    /// Advisory: lets the oracle prepare the data behind upcoming keys.
    fn hint(&mut self, hint: Hint);
}

/// Type-2 (global keccak256) key of `data`.
pub fn keccak256_key(data: &[u8]) -> [u8; 32] {
    let mut key = keccak256(data);
    key[0] = 2;
    key
}

/// Type-1 (local) key for the bootstrap value at `index`.
pub fn local_key(index: u64) -> [u8; 32] {
    let mut key = [0u8; 32];
    key[0] = 1;
    key[24..].copy_from_slice(&index.to_be_bytes());
    key
}

pub struct ReadWrite<R, W> {
    pub reader: R,
    pub writer: W,
}

pub struct RW(pub ReadWrite<PipeReader, PipeWriter>);

// `os_pipe::pipe` with flags. `CLOEXEC` is not passed, as these pipes must
// survive an exec, and `DIRECT` makes writes single atomic packets (up to
// splitting at the buffer size), which avoids IPC hangs.
#[cfg(not(any(target_os = "ios", target_os = "macos", target_os = "haiku")))]
fn create_pipe() -> std::io::Result<(PipeReader, PipeWriter)> {
    let mut fds: [libc::c_int; 2] = [0; 2];
    let res = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_DIRECT) };
    if res != 0 {
        return Err(std::io::Error::last_os_error());
    }
    unsafe {
        Ok((
            PipeReader::from_raw_fd(fds[0]),
            PipeWriter::from_raw_fd(fds[1]),
        ))
    }
}

#[cfg(any(target_os = "ios", target_os = "macos", target_os = "haiku"))]
fn create_pipe() -> std::io::Result<(PipeReader, PipeWriter)> {
    let mut fds: [libc::c_int; 2] = [0; 2];
    let res = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if res != 0 {
        return Err(std::io::Error::last_os_error());
    }
    // No DIRECT here.
    for fd in fds {
        let res = unsafe { libc::fcntl(fd, libc::F_SETFD, 0) };
        if res != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    unsafe {
        Ok((
            PipeReader::from_raw_fd(fds[0]),
            PipeWriter::from_raw_fd(fds[1]),
        ))
    }
}

// Create bidirectional channel between A and B
//
// Schematically we create 2 unidirectional pipes and creates 2 structures made
// by taking the writer from one and the reader from the other.
//
//     A                     B
//     |     ar  <---- bw    |
//     |     aw  ----> br    |
//
pub fn create_bidirectional_channel() -> std::io::Result<(RW, RW)> {
    let (ar, bw) = create_pipe()?;
    let (br, aw) = create_pipe()?;
    Ok((
        RW(ReadWrite {
            reader: ar,
            writer: aw,
        }),
        RW(ReadWrite {
            reader: br,
            writer: bw,
        }),
    ))
}

fn owned<F: IntoRawFd>(f: F) -> OwnedFd {
    // Ownership of the descriptor moves from `f` to the returned value.
    unsafe { OwnedFd::from_raw_fd(f.into_raw_fd()) }
}

/// Pre-image server running as a child process, reached through the
/// file descriptors 3 to 6 of the child.
pub struct PreImageOracle {
    pub cmd: Command,
    pub oracle_client: RW,
    pub hint_client: RW,
}

impl PreImageOracle {
    pub fn create(host_program: &HostProgram) -> std::io::Result<PreImageOracle> {
        let mut cmd = Command::new(&host_program.name);
        cmd.args(&host_program.arguments);

        let (oracle_client, oracle_server) = create_bidirectional_channel()?;
        let (hint_client, hint_server) = create_bidirectional_channel()?;

        // 0, 1, 2 are the inherited stdin, stdout, stderr.
        cmd.fd_mappings(vec![
            FdMapping {
                parent_fd: owned(hint_server.0.writer),
                child_fd: HINT_CLIENT_WRITE_FD,
            },
            FdMapping {
                parent_fd: owned(hint_server.0.reader),
                child_fd: HINT_CLIENT_READ_FD,
            },
            FdMapping {
                parent_fd: owned(oracle_server.0.writer),
                child_fd: PREIMAGE_CLIENT_WRITE_FD,
            },
            FdMapping {
                parent_fd: owned(oracle_server.0.reader),
                child_fd: PREIMAGE_CLIENT_READ_FD,
            },
        ])
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        Ok(PreImageOracle {
            cmd,
            oracle_client,
            hint_client,
        })
    }

    pub fn start(&mut self) -> std::io::Result<Child> {
        // Spawning inherits the current process's stdin/stdout/stderr descriptors
        self.cmd.spawn()
    }
}

impl PreImageOracleT for PreImageOracle {
    // The preimage protocol goes as follows
    // 1. Ask for data through a key
    // 2. Get the answers in the following format
    //      +------------+--------------------+
    //      | length <8> | pre-image <length> |
    //      +---------------------------------+
    //   a. a 64-bit integer indicating the length of the actual data
    //   b. the preimage data, with a size of <length> bytes
    fn get_preimage(&mut self, key: [u8; 32]) -> Result<Preimage, OracleError> {
        let RW(ReadWrite { reader, writer }) = &mut self.oracle_client;

        writer.write_all(&key)?;
        writer.flush()?;

        let mut buf = [0_u8; 8];
        reader.read_exact(&mut buf)?;
        let length = u64::from_be_bytes(buf);

        let mut preimage = Vec::new();
        reader.by_ref().take(length).read_to_end(&mut preimage)?;
        if preimage.len() as u64 != length {
            return Err(OracleError::TruncatedResponse {
                expected: length,
                got: preimage.len() as u64,
            });
        }

        debug!(
            "Got preimage of length {} for key 0x{}",
            preimage.len(),
            hex::encode(key)
        );
        Ok(Preimage::create(preimage))
    }

    // The hint protocol goes as follows:
    // 1. Write a hint request with the following byte-stream format
    //       +------------+---------------+
    //       | length <8> | hint <length> |
    //       +----------------------------+
    //
    // 2. Get back a single ack byte informing the hint has been processed.
    fn hint(&mut self, hint: Hint) {
        let RW(ReadWrite { reader, writer }) = &mut self.hint_client;

        let hint_bytes = hint.get();
        let mut msg = u64::to_be_bytes(hint_bytes.len() as u64).to_vec();
        msg.extend_from_slice(&hint_bytes);

        if let Err(e) = writer.write_all(&msg).and_then(|_| writer.flush()) {
            warn!("Could not send hint to the pre-image server: {e}");
            return;
        }

        // The ack carries no information
        let mut ack = [0_u8];
        if let Err(e) = reader.read_exact(&mut ack) {
            warn!("No acknowledgment for hint: {e}");
        }
    }
}

/// Oracle for programs that never request pre-images.
pub struct NullPreImageOracle;

impl PreImageOracleT for NullPreImageOracle {
    fn get_preimage(&mut self, _key: [u8; 32]) -> Result<Preimage, OracleError> {
        Err(OracleError::NoOracle)
    }

    fn hint(&mut self, _hint: Hint) {}
}

/// Oracle backed by a map, recording every hint it receives.
#[derive(Debug, Default, Clone)]
pub struct InMemoryPreImageOracle {
    preimages: HashMap<[u8; 32], Vec<u8>>,
    pub hints: Vec<Vec<u8>>,
    pub requests: usize,
}

impl InMemoryPreImageOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: [u8; 32], value: Vec<u8>) {
        self.preimages.insert(key, value);
    }

    /// Store `data` under its keccak key, which is returned.
    pub fn insert_keccak(&mut self, data: Vec<u8>) -> [u8; 32] {
        let key = keccak256_key(&data);
        self.insert(key, data);
        key
    }
}

impl PreImageOracleT for InMemoryPreImageOracle {
    fn get_preimage(&mut self, key: [u8; 32]) -> Result<Preimage, OracleError> {
        self.requests += 1;
        self.preimages
            .get(&key)
            .cloned()
            .map(Preimage::create)
            .ok_or(OracleError::UnknownKey(key))
    }

    fn hint(&mut self, hint: Hint) {
        self.hints.push(hint.get());
    }
}

impl PreImageOracleT for Box<dyn PreImageOracleT> {
    fn get_preimage(&mut self, key: [u8; 32]) -> Result<Preimage, OracleError> {
        self.as_mut().get_preimage(key)
    }

    fn hint(&mut self, hint: Hint) {
        self.as_mut().hint(hint)
    }
}
