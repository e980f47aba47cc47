//! Single-step execution of MIPS instructions against a [State].
//!
//! A step works on a scratch copy of the CPU registers and defers its single
//! memory store, its output and its hints until every check has passed, so
//! that a failing step leaves the state untouched.

use crate::{
    cannon::{
        Hint, FD_HINT_READ, FD_HINT_WRITE, FD_PREIMAGE_READ, FD_PREIMAGE_WRITE, FD_STDERR,
        FD_STDIN, FD_STDOUT, PAGE_ADDRESS_MASK, PAGE_SIZE,
    },
    error::VmError,
    memory::Memory,
    mips::instruction::{
        debugging::InstructionParts, decode, ITypeInstruction, Instruction, JTypeInstruction,
        RTypeInstruction, REGISTER_A0, REGISTER_A1, REGISTER_A2, REGISTER_A3, REGISTER_RA,
        REGISTER_V0,
    },
    preimage_oracle::{OracleError, PreImageOracleT},
    state::State,
    utils::sign_extend,
    witness::StepWitness,
};
use log::{debug, warn};
use std::io::{self, Read, Write};

/// Value returned by `brk`: the program break never moves.
pub const PROGRAM_BREAK: u32 = 0x4000_0000;

pub const MIPS_EBADF: u32 = 0x9;
pub const MIPS_EINVAL: u32 = 0x16;

/// `F_GETFL` command of `fcntl`.
const FCNTL_GETFL: u32 = 3;

/// Bytes copied out of memory at a time when collecting hints.
const HINT_CHUNK_SIZE: usize = 4096;

/// Bits of `word` holding the `len` bytes at `addr`, big-endian, shifted down.
pub fn select_subword(word: u32, addr: u32, len: u32) -> u32 {
    let bit_offset = (4 - len - (addr & 3)) * 8;
    let mask = ((1u64 << (len * 8)) - 1) as u32;
    (word >> bit_offset) & mask
}

/// `word` with the `len` bytes at `addr` replaced by the low bytes of `value`.
pub fn update_subword(word: u32, addr: u32, len: u32, value: u32) -> u32 {
    let bit_offset = (4 - len - (addr & 3)) * 8;
    let mask = (((1u64 << (len * 8)) - 1) as u32) << bit_offset;
    (word & !mask) | ((value << bit_offset) & mask)
}

/// Last pre-image fetched from the oracle, kept with its 8-byte big-endian
/// length prefix as read by the program.
#[derive(Debug, Default)]
struct PreimageCache {
    key: Option<[u8; 32]>,
    payload: Vec<u8>,
}

impl PreimageCache {
    fn fetch<O: PreImageOracleT + ?Sized>(
        &mut self,
        key: [u8; 32],
        oracle: &mut O,
    ) -> Result<&[u8], OracleError> {
        if self.key != Some(key) {
            let preimage = oracle.get_preimage(key)?.get();
            debug!(
                "Fetched pre-image of {} bytes for key 0x{}",
                preimage.len(),
                hex::encode(key)
            );
            let mut payload = Vec::with_capacity(preimage.len() + 8);
            payload.extend_from_slice(&(preimage.len() as u64).to_be_bytes());
            payload.extend_from_slice(&preimage);
            self.payload = payload;
            self.key = Some(key);
        }
        Ok(&self.payload)
    }
}

/// Pre-image read performed by the last step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastPreimage {
    pub key: [u8; 32],
    /// Size of the pre-image, without its length prefix.
    pub size: usize,
    /// Offset the read started at.
    pub offset: u32,
}

/// Destination of the bytes of a `write` syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sink {
    Stdout,
    Stderr,
    Hint,
}

/// A `write` whose bytes are copied out of memory once every check of the
/// step has passed.
#[derive(Debug, Clone, Copy)]
struct PendingWrite {
    sink: Sink,
    addr: u32,
    count: u32,
}

/// Every state field but the memory, as modified by the step in progress.
#[derive(Debug, Clone)]
struct Cpu {
    registers: [u32; 32],
    pc: u32,
    next_pc: u32,
    lo: u32,
    hi: u32,
    heap: u32,
    exit_code: u8,
    exited: bool,
    preimage_key: [u8; 32],
    preimage_offset: u32,
    last_hint: Vec<u8>,
}

impl Cpu {
    fn from_state(state: &State) -> Self {
        Cpu {
            registers: state.registers,
            pc: state.pc,
            next_pc: state.next_pc,
            lo: state.lo,
            hi: state.hi,
            heap: state.heap,
            exit_code: state.exit_code,
            exited: state.exited,
            preimage_key: state.preimage_key,
            preimage_offset: state.preimage_offset,
            last_hint: state.last_hint.clone(),
        }
    }

    fn commit(self, state: &mut State) {
        state.registers = self.registers;
        state.pc = self.pc;
        state.next_pc = self.next_pc;
        state.lo = self.lo;
        state.hi = self.hi;
        state.heap = self.heap;
        state.exit_code = self.exit_code;
        state.exited = self.exited;
        state.preimage_key = self.preimage_key;
        state.preimage_offset = self.preimage_offset;
        state.last_hint = self.last_hint;
    }
}

/// Environment of a single step.
struct Env<'a, O: ?Sized> {
    cpu: Cpu,
    memory: &'a mut Memory,
    oracle: &'a mut O,
    preimages: &'a mut PreimageCache,
    /// Aligned address of the data word accessed by the instruction.
    mem_access: Option<u32>,
    /// Memory proofs gathered so far, when a witness is requested.
    mem_proof: Option<Vec<u8>>,
    pending_store: Option<(u32, u32)>,
    pending_write: Option<PendingWrite>,
    preimage_read: Option<LastPreimage>,
}

impl<O: PreImageOracleT + ?Sized> Env<'_, O> {
    fn reg(&self, idx: u32) -> u32 {
        self.cpu.registers[idx as usize]
    }

    fn write_register(&mut self, idx: u32, value: u32) {
        // $zero is hardwired
        if idx != 0 {
            self.cpu.registers[idx as usize] = value;
        }
    }

    /// Move to the instruction in the delay slot.
    fn advance(&mut self) {
        self.cpu.pc = self.cpu.next_pc;
        self.cpu.next_pc = self.cpu.next_pc.wrapping_add(4);
    }

    fn jump(&mut self, dest: u32, link: Option<u32>) {
        let prev_pc = self.cpu.pc;
        self.cpu.pc = self.cpu.next_pc;
        self.cpu.next_pc = dest;
        if let Some(link) = link {
            self.write_register(link, prev_pc.wrapping_add(8));
        }
    }

    fn branch(&mut self, taken: bool, offset: u32) {
        let prev_pc = self.cpu.pc;
        self.cpu.pc = self.cpu.next_pc;
        self.cpu.next_pc = if taken {
            prev_pc.wrapping_add(4).wrapping_add(offset << 2)
        } else {
            self.cpu.next_pc.wrapping_add(4)
        };
    }

    fn track_mem_access(&mut self, addr: u32) -> Result<(), VmError> {
        match self.mem_access {
            Some(first) if first != addr => {
                return Err(VmError::MultipleMemoryAccesses {
                    first,
                    second: addr,
                })
            }
            Some(_) => {}
            None => {
                self.mem_access = Some(addr);
                if let Some(proof) = self.mem_proof.as_mut() {
                    proof.extend_from_slice(&self.memory.merkle_proof(addr));
                }
            }
        }
        Ok(())
    }

    fn store(&mut self, addr: u32, value: u32) {
        self.pending_store = Some((addr, value));
    }

    fn write(&mut self, sink: Sink, addr: u32, count: u32) -> (u32, u32) {
        self.pending_write = Some(PendingWrite { sink, addr, count });
        (count, 0)
    }

    fn interpret_instruction(&mut self, instruction: Instruction, insn: u32) -> Result<(), VmError> {
        if instruction.is_branch() && self.cpu.next_pc != self.cpu.pc.wrapping_add(4) {
            return Err(VmError::JumpInDelaySlot { pc: self.cpu.pc });
        }
        let parts = InstructionParts::decode(insn);
        match instruction {
            Instruction::RType(instr) => self.interpret_rtype(instr, parts),
            Instruction::JType(instr) => {
                self.interpret_jtype(instr, parts);
                Ok(())
            }
            Instruction::IType(instr) => self.interpret_itype(instr, parts),
        }
    }

    fn interpret_rtype(
        &mut self,
        instr: RTypeInstruction,
        parts: InstructionParts,
    ) -> Result<(), VmError> {
        use RTypeInstruction::*;

        let rs = self.reg(parts.rs);
        let rt = self.reg(parts.rt);
        let shamt = parts.shamt;
        let value = match instr {
            ShiftLeftLogical => Some(rt << shamt),
            ShiftRightLogical => Some(rt >> shamt),
            ShiftRightArithmetic => Some(((rt as i32) >> shamt) as u32),
            ShiftLeftLogicalVariable => Some(rt << (rs & 0x1F)),
            ShiftRightLogicalVariable => Some(rt >> (rs & 0x1F)),
            ShiftRightArithmeticVariable => Some(((rt as i32) >> (rs & 0x1F)) as u32),
            JumpRegister => {
                self.jump(rs, None);
                return Ok(());
            }
            JumpAndLinkRegister => {
                self.jump(rs, Some(parts.rd));
                return Ok(());
            }
            SyscallMmap | SyscallBrk | SyscallClone | SyscallExitGroup | SyscallReadPreimage
            | SyscallReadOther | SyscallWriteHint | SyscallWritePreimage | SyscallWriteOther
            | SyscallFcntl | SyscallOther => return self.interpret_syscall(instr),
            Break => return Err(VmError::Break { pc: self.cpu.pc }),
            MoveZero => (rt == 0).then_some(rs),
            MoveNonZero => (rt != 0).then_some(rs),
            Sync => None,
            MoveFromHi => Some(self.cpu.hi),
            MoveToHi => {
                self.cpu.hi = rs;
                None
            }
            MoveFromLo => Some(self.cpu.lo),
            MoveToLo => {
                self.cpu.lo = rs;
                None
            }
            Multiply => {
                let acc = ((rs as i32 as i64) * (rt as i32 as i64)) as u64;
                self.cpu.hi = (acc >> 32) as u32;
                self.cpu.lo = acc as u32;
                None
            }
            MultiplyUnsigned => {
                let acc = (rs as u64) * (rt as u64);
                self.cpu.hi = (acc >> 32) as u32;
                self.cpu.lo = acc as u32;
                None
            }
            Div => {
                if rt == 0 {
                    return Err(VmError::DivideByZero { pc: self.cpu.pc });
                }
                self.cpu.hi = (rs as i32).wrapping_rem(rt as i32) as u32;
                self.cpu.lo = (rs as i32).wrapping_div(rt as i32) as u32;
                None
            }
            DivUnsigned => {
                if rt == 0 {
                    return Err(VmError::DivideByZero { pc: self.cpu.pc });
                }
                self.cpu.hi = rs % rt;
                self.cpu.lo = rs / rt;
                None
            }
            Add | AddUnsigned => Some(rs.wrapping_add(rt)),
            Sub | SubUnsigned => Some(rs.wrapping_sub(rt)),
            And => Some(rs & rt),
            Or => Some(rs | rt),
            Xor => Some(rs ^ rt),
            Nor => Some(!(rs | rt)),
            SetLessThan => Some(((rs as i32) < (rt as i32)) as u32),
            SetLessThanUnsigned => Some((rs < rt) as u32),
            MultiplyToRegister => Some((rs as i32).wrapping_mul(rt as i32) as u32),
            CountLeadingOnes => Some(rs.leading_ones()),
            CountLeadingZeros => Some(rs.leading_zeros()),
        };
        if let Some(value) = value {
            self.write_register(parts.rd, value);
        }
        self.advance();
        Ok(())
    }

    fn interpret_jtype(&mut self, instr: JTypeInstruction, parts: InstructionParts) {
        let target = sign_extend(parts.target(), 26) << 2;
        match instr {
            JTypeInstruction::Jump => self.jump(target, None),
            JTypeInstruction::JumpAndLink => self.jump(target, Some(REGISTER_RA as u32)),
        }
    }

    fn interpret_itype(
        &mut self,
        instr: ITypeInstruction,
        parts: InstructionParts,
    ) -> Result<(), VmError> {
        use ITypeInstruction::*;

        let rs = self.reg(parts.rs);
        let rt = self.reg(parts.rt);
        let imm = parts.immediate();
        let simm = sign_extend(imm, 16);
        let taken = match instr {
            BranchEq => Some(rs == rt),
            BranchNeq => Some(rs != rt),
            BranchLeqZero => Some((rs as i32) <= 0),
            BranchGtZero => Some((rs as i32) > 0),
            BranchLtZero => Some((rs as i32) < 0),
            BranchGeqZero => Some((rs as i32) >= 0),
            BranchGeqZeroAndLink => {
                // The link is written whether the branch is taken or not
                let link = self.cpu.pc.wrapping_add(8);
                self.write_register(REGISTER_RA as u32, link);
                Some((rs as i32) >= 0)
            }
            RegimmNop => Some(false),
            _ => None,
        };
        if let Some(taken) = taken {
            self.branch(taken, simm);
            return Ok(());
        }

        let value = match instr {
            AddImmediate | AddImmediateUnsigned => rs.wrapping_add(simm),
            SetLessThanImmediate => ((rs as i32) < (simm as i32)) as u32,
            SetLessThanImmediateUnsigned => (rs < simm) as u32,
            AndImmediate => rs & imm,
            OrImmediate => rs | imm,
            XorImmediate => rs ^ imm,
            LoadUpperImmediate => imm << 16,
            BranchEq | BranchNeq | BranchLeqZero | BranchGtZero | BranchLtZero
            | BranchGeqZero | BranchGeqZeroAndLink | RegimmNop => {
                unreachable!("branches are handled above")
            }
            Load8 | Load16 | Load32 | Load8Unsigned | Load16Unsigned | LoadWordLeft
            | LoadWordRight | LoadLinked | Store8 | Store16 | Store32 | Store32Conditional
            | StoreWordLeft | StoreWordRight => {
                return self.interpret_memory(instr, rs.wrapping_add(simm), parts.rt, rt)
            }
        };
        self.write_register(parts.rt, value);
        self.advance();
        Ok(())
    }

    fn interpret_memory(
        &mut self,
        instr: ITypeInstruction,
        addr: u32,
        rt_reg: u32,
        rt: u32,
    ) -> Result<(), VmError> {
        use ITypeInstruction::*;

        let required = match instr {
            Load32 | LoadLinked | Store32 | Store32Conditional => 4,
            Load16 | Load16Unsigned | Store16 => 2,
            _ => 1,
        };
        if addr % required != 0 {
            return Err(VmError::UnalignedAccess { addr, required });
        }
        let word_addr = addr & !3;
        self.track_mem_access(word_addr)?;
        let mem = self.memory.get_memory(word_addr)?;
        // Shift of the byte at `addr` within the word, from the top
        let shift = (addr & 3) * 8;

        match instr {
            Load8 => self.write_register(rt_reg, sign_extend(select_subword(mem, addr, 1), 8)),
            Load16 => self.write_register(rt_reg, sign_extend(select_subword(mem, addr, 2), 16)),
            Load8Unsigned => self.write_register(rt_reg, select_subword(mem, addr, 1)),
            Load16Unsigned => self.write_register(rt_reg, select_subword(mem, addr, 2)),
            Load32 | LoadLinked => self.write_register(rt_reg, mem),
            LoadWordLeft => {
                let mask = u32::MAX << shift;
                self.write_register(rt_reg, (rt & !mask) | (mem << shift));
            }
            LoadWordRight => {
                let mask = u32::MAX >> (24 - shift);
                self.write_register(rt_reg, (rt & !mask) | (mem >> (24 - shift)));
            }
            Store8 => self.store(word_addr, update_subword(mem, addr, 1, rt)),
            Store16 => self.store(word_addr, update_subword(mem, addr, 2, rt)),
            Store32 => self.store(word_addr, rt),
            Store32Conditional => {
                self.store(word_addr, rt);
                self.write_register(rt_reg, 1);
            }
            StoreWordLeft => {
                let mask = u32::MAX >> shift;
                self.store(word_addr, (mem & !mask) | (rt >> shift));
            }
            StoreWordRight => {
                let mask = u32::MAX << (24 - shift);
                self.store(word_addr, (mem & !mask) | (rt << (24 - shift)));
            }
            _ => unreachable!("{instr:?} is not a memory instruction"),
        }
        self.advance();
        Ok(())
    }

    fn interpret_syscall(&mut self, instr: RTypeInstruction) -> Result<(), VmError> {
        use RTypeInstruction::*;

        let a0 = self.reg(REGISTER_A0 as u32);
        let a1 = self.reg(REGISTER_A1 as u32);
        let a2 = self.reg(REGISTER_A2 as u32);

        let (v0, v1) = match instr {
            SyscallMmap => {
                let mut size = a1;
                if size & PAGE_ADDRESS_MASK != 0 {
                    // Round up to a full page
                    size = size.wrapping_add(PAGE_SIZE - (size & PAGE_ADDRESS_MASK));
                }
                if a0 == 0 {
                    let base = self.cpu.heap;
                    self.cpu.heap = base.wrapping_add(size);
                    debug!("mmap: {size:#x} bytes at heap {base:#010x}");
                    (base, 0)
                } else {
                    (a0, 0)
                }
            }
            SyscallBrk => (PROGRAM_BREAK, 0),
            // Threads are not supported
            SyscallClone => (1, 0),
            SyscallExitGroup => {
                self.cpu.exited = true;
                self.cpu.exit_code = a0 as u8;
                return Ok(());
            }
            SyscallReadPreimage => (self.read_preimage(a1, a2)?, 0),
            SyscallReadOther => match a0 {
                // Nothing to read, no error
                FD_STDIN => (0, 0),
                // Hint responses are ignored
                FD_HINT_READ => (a2, 0),
                _ => (u32::MAX, MIPS_EBADF),
            },
            SyscallWriteHint => self.write(Sink::Hint, a1, a2),
            SyscallWritePreimage => (self.write_preimage_key(a1, a2)?, 0),
            SyscallWriteOther => match a0 {
                FD_STDOUT => self.write(Sink::Stdout, a1, a2),
                FD_STDERR => self.write(Sink::Stderr, a1, a2),
                _ => (u32::MAX, MIPS_EBADF),
            },
            SyscallFcntl => fcntl(a0, a1),
            _ => {
                warn!(
                    "Unhandled syscall {} at pc {:#010x}",
                    self.reg(REGISTER_V0 as u32),
                    self.cpu.pc
                );
                (0, 0)
            }
        };
        self.write_register(REGISTER_V0 as u32, v0);
        self.write_register(REGISTER_A3 as u32, v1);
        self.advance();
        Ok(())
    }

    /// Copy the next bytes of the current pre-image into the word holding
    /// `addr`, without crossing the end of that word. At or past the end of
    /// the pre-image nothing is copied and 0 is returned.
    fn read_preimage(&mut self, addr: u32, count: u32) -> Result<u32, VmError> {
        let word_addr = addr & !3;
        self.track_mem_access(word_addr)?;
        let mem = self.memory.get_memory(word_addr)?;

        let key = self.cpu.preimage_key;
        let payload = self.preimages.fetch(key, &mut *self.oracle)?;
        let offset = self.cpu.preimage_offset;
        let start = offset as usize;
        let alignment = (addr & 3) as usize;
        let available = payload.len().saturating_sub(start);
        let n = (count as usize).min(4 - alignment).min(available);

        let size = payload.len() - 8;
        if n > 0 {
            let mut word = mem.to_be_bytes();
            word[alignment..alignment + n].copy_from_slice(&payload[start..start + n]);
            self.store(word_addr, u32::from_be_bytes(word));
            self.cpu.preimage_offset += n as u32;
        }
        self.preimage_read = Some(LastPreimage { key, size, offset });
        Ok(n as u32)
    }

    /// Shift up to the rest of the word holding `addr` into the pre-image key.
    fn write_preimage_key(&mut self, addr: u32, count: u32) -> Result<u32, VmError> {
        let word_addr = addr & !3;
        self.track_mem_access(word_addr)?;
        let mem = self.memory.get_memory(word_addr)?;

        let alignment = (addr & 3) as usize;
        let n = (count as usize).min(4 - alignment);
        let key = &mut self.cpu.preimage_key;
        key.copy_within(n.., 0);
        key[32 - n..].copy_from_slice(&mem.to_be_bytes()[alignment..alignment + n]);
        self.cpu.preimage_offset = 0;
        Ok(n as u32)
    }
}

/// Append `count` bytes of memory at `addr` to the hint buffer, forwarding
/// every complete length-prefixed hint to the oracle. Memory is copied one
/// chunk at a time so that only an incomplete hint stays buffered.
fn collect_hints<O: PreImageOracleT + ?Sized>(
    memory: &Memory,
    addr: u32,
    count: u32,
    buffer: &mut Vec<u8>,
    oracle: &mut O,
) -> io::Result<()> {
    let mut reader = memory.read_memory_range(addr, count);
    let mut chunk = [0u8; HINT_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            return Ok(());
        }
        buffer.extend_from_slice(&chunk[..n]);
        forward_complete_hints(buffer, oracle);
    }
}

fn forward_complete_hints<O: PreImageOracleT + ?Sized>(buffer: &mut Vec<u8>, oracle: &mut O) {
    let mut start = 0;
    while buffer.len() - start >= 4 {
        let len = u32::from_be_bytes([
            buffer[start],
            buffer[start + 1],
            buffer[start + 2],
            buffer[start + 3],
        ]) as usize;
        let end = start + 4 + len;
        if end > buffer.len() {
            break;
        }
        let hint = buffer[start + 4..end].to_vec();
        debug!("Hint: 0x{}", hex::encode(&hint));
        oracle.hint(Hint::create(hint));
        start = end;
    }
    buffer.drain(..start);
}

fn fcntl(fd: u32, cmd: u32) -> (u32, u32) {
    if cmd != FCNTL_GETFL {
        return (u32::MAX, MIPS_EINVAL);
    }
    match fd {
        // O_RDONLY
        FD_STDIN | FD_PREIMAGE_READ | FD_HINT_READ => (0, 0),
        // O_WRONLY
        FD_STDOUT | FD_STDERR | FD_PREIMAGE_WRITE | FD_HINT_WRITE => (1, 0),
        _ => (u32::MAX, MIPS_EBADF),
    }
}

/// A [State] together with everything it interacts with while running: the
/// pre-image oracle and the sinks receiving the program output.
pub struct InstrumentedState<O, W1, W2> {
    pub state: State,
    pub preimage_oracle: O,
    pub stdout: W1,
    pub stderr: W2,
    preimages: PreimageCache,
    last_preimage: Option<LastPreimage>,
}

impl<O: PreImageOracleT, W1: Write, W2: Write> InstrumentedState<O, W1, W2> {
    pub fn new(state: State, preimage_oracle: O, stdout: W1, stderr: W2) -> Self {
        InstrumentedState {
            state,
            preimage_oracle,
            stdout,
            stderr,
            preimages: PreimageCache::default(),
            last_preimage: None,
        }
    }

    /// Pre-image read by the last step, if it read one.
    pub fn last_preimage(&self) -> Option<&LastPreimage> {
        self.last_preimage.as_ref()
    }

    /// Execute one instruction. Returns the witness of the step when
    /// `with_witness` is set. An exited state is left unchanged and yields no
    /// witness.
    pub fn step(&mut self, with_witness: bool) -> Result<Option<StepWitness>, VmError> {
        self.last_preimage = None;
        if self.state.exited {
            return Ok(None);
        }
        let pc = self.state.pc;
        if pc & 3 != 0 {
            return Err(VmError::UnalignedPc(pc));
        }
        let insn = self.state.memory.get_memory(pc)?;

        let (state_witness, mem_proof) = if with_witness {
            let state_witness = self.state.encode_witness().to_vec();
            let proof = self.state.memory.merkle_proof(pc).to_vec();
            (Some(state_witness), Some(proof))
        } else {
            (None, None)
        };

        let cpu = Cpu::from_state(&self.state);
        let instruction = decode(insn, &cpu.registers)?;
        debug!("instruction: {:?}", instruction);
        debug!("Instruction hex: {:#010x}", insn);

        let mut env = Env {
            cpu,
            memory: &mut self.state.memory,
            oracle: &mut self.preimage_oracle,
            preimages: &mut self.preimages,
            mem_access: None,
            mem_proof,
            pending_store: None,
            pending_write: None,
            preimage_read: None,
        };
        env.interpret_instruction(instruction, insn)?;

        let Env {
            mut cpu,
            mem_proof,
            pending_store,
            pending_write,
            preimage_read,
            ..
        } = env;

        // Write steps store nothing: memory still holds the bytes to copy
        if let Some(PendingWrite { sink, addr, count }) = pending_write {
            let memory = &self.state.memory;
            match sink {
                Sink::Stdout => {
                    io::copy(&mut memory.read_memory_range(addr, count), &mut self.stdout)?;
                }
                Sink::Stderr => {
                    io::copy(&mut memory.read_memory_range(addr, count), &mut self.stderr)?;
                }
                Sink::Hint => collect_hints(
                    memory,
                    addr,
                    count,
                    &mut cpu.last_hint,
                    &mut self.preimage_oracle,
                )?,
            }
        }

        let witness = state_witness.map(|state| {
            let mut witness = StepWitness {
                state,
                mem_proof: mem_proof.unwrap_or_default(),
                preimage_key: None,
                preimage_value: None,
                preimage_offset: None,
            };
            if preimage_read.is_some() {
                witness.preimage_key = Some(cpu.preimage_key);
                witness.preimage_value = Some(self.preimages.payload[8..].to_vec());
                witness.preimage_offset = Some(cpu.preimage_offset);
            }
            witness
        });

        cpu.commit(&mut self.state);
        if let Some((addr, value)) = pending_store {
            self.state.memory.set_memory(addr, value)?;
        }
        self.state.step += 1;
        self.last_preimage = preimage_read;
        Ok(witness)
    }
}
