mod common;

use common::{naive_merkle_root, vm_with_program};
use mipsevm::{
    memory::{proof_leaf_word, verify_proof, MEM_PROOF_SIZE},
    preimage_oracle::keccak256_key,
};
use std::io::Read;

const SYSCALL: u32 = 0x0000_000C;

#[test]
fn test_addi() {
    let mut vm = vm_with_program(0, &[(0, 0x2042_0001)]);
    vm.state.registers[2] = 0x41;
    vm.step(false).unwrap();
    assert_eq!(vm.state.pc, 4);
    assert_eq!(vm.state.next_pc, 8);
    assert_eq!(vm.state.registers[2], 0x42);
    assert_eq!(vm.state.step, 1);
}

#[test]
fn test_jal_delay_slot() {
    let mut vm = vm_with_program(
        0,
        &[
            (0, 0x0C00_0004),  // jal 0x10
            (4, 0x2402_0005),  // addiu $v0, $zero, 5
            (16, 0x03E0_0008), // jr $ra
            (20, 0x0000_0000), // nop
        ],
    );
    vm.state.registers[31] = 0xA7EF_00D0;

    vm.step(false).unwrap();
    assert_eq!(vm.state.pc, 4);
    assert_eq!(vm.state.next_pc, 0x10);
    assert_eq!(vm.state.registers[31], 8);

    // The delay slot runs before the target
    vm.step(false).unwrap();
    assert_eq!(vm.state.pc, 0x10);
    assert_eq!(vm.state.registers[2], 5);

    // jr $ra goes back to the link written by jal
    vm.step(false).unwrap();
    assert_eq!(vm.state.pc, 0x14);
    assert_eq!(vm.state.next_pc, 8);

    vm.step(false).unwrap();
    assert_eq!(vm.state.pc, 8);
    assert_eq!(vm.state.step, 4);
}

#[test]
fn test_sb_byte_patching() {
    // sb $t0, 0($t1)
    let mut vm = vm_with_program(0, &[(0, 0xA128_0000)]);
    vm.state.memory.set_memory(0x1000, 0xAABB_CCDD).unwrap();
    vm.state.registers[8] = 0x11;
    vm.state.registers[9] = 0x1001;
    let root_before = vm.state.memory.merkle_root();

    let witness = vm.step(true).unwrap().unwrap();
    assert_eq!(vm.state.memory.get_memory(0x1000).unwrap(), 0xAA11_CCDD);

    let root_after = vm.state.memory.merkle_root();
    assert_ne!(root_before, root_after);
    assert_eq!(root_after, naive_merkle_root(&vm.state.memory));
    let proof = vm.state.memory.merkle_proof(0x1000);
    assert!(verify_proof(&root_after, 0x1000, &proof));

    // The witness proves the old word
    assert_eq!(witness.proof_count(), 2);
    let data_proof = &witness.mem_proof[MEM_PROOF_SIZE..];
    assert!(verify_proof(&root_before, 0x1000, data_proof));
    assert_eq!(proof_leaf_word(data_proof, 0x1000), 0xAABB_CCDD);
}

#[test]
fn test_preimage_read_crossing_the_length_prefix() {
    let mut vm = vm_with_program(0, &[(0, SYSCALL)]);
    let payload: Vec<u8> = (0..0x1000u32).map(|i| (i * 7) as u8).collect();
    let key = keccak256_key(&payload);
    vm.preimage_oracle.insert(key, payload.clone());
    vm.state.preimage_key = key;
    vm.state.preimage_offset = 6;
    vm.state.registers[2] = 4003;
    vm.state.registers[4] = 5;
    vm.state.registers[5] = 0x2000;
    vm.state.registers[6] = 4;

    vm.step(false).unwrap();

    let len_bytes = 0x1000u64.to_be_bytes();
    let mut bytes = Vec::new();
    vm.state
        .memory
        .read_memory_range(0x2000, 4)
        .read_to_end(&mut bytes)
        .unwrap();
    assert_eq!(bytes, [len_bytes[6], len_bytes[7], payload[0], payload[1]]);
    assert_eq!(vm.state.preimage_offset, 10);
    assert_eq!(vm.state.registers[2], 4);
    assert_eq!(vm.state.registers[7], 0);
}

#[test]
fn test_mmap_allocation() {
    let mut vm = vm_with_program(0, &[(0, SYSCALL)]);
    vm.state.heap = 0x4000_0000;
    vm.state.registers[2] = 4090;
    vm.state.registers[4] = 0;
    vm.state.registers[5] = 0x2500;
    let root_before = vm.state.memory.merkle_root();
    assert_eq!(vm.state.memory.page_count(), 1);

    vm.step(false).unwrap();
    assert_eq!(vm.state.registers[2], 0x4000_0000);
    assert_eq!(vm.state.heap, 0x4000_3000);
    // Fresh mappings read as zero and leave the root unchanged
    for addr in (0x4000_0000..0x4000_3000).step_by(0x400) {
        assert_eq!(vm.state.memory.get_memory(addr).unwrap(), 0);
    }
    assert_eq!(vm.state.memory.merkle_root(), root_before);
    // No page is materialized by the mapping
    assert_eq!(vm.state.memory.page_count(), 1);
}

#[test]
fn test_exit_is_a_fixed_point() {
    let mut vm = vm_with_program(0, &[(0, SYSCALL)]);
    vm.state.registers[2] = 4246;
    vm.state.registers[4] = 0;

    vm.step(false).unwrap();
    assert!(vm.state.exited);
    assert_eq!(vm.state.exit_code, 0);

    let before = vm.state.encode_witness();
    assert!(vm.step(true).unwrap().is_none());
    assert_eq!(vm.state.encode_witness(), before);
}

#[test]
fn test_loop_program_invariants() {
    // Sum 1..=10 into $v0, then exit with it:
    //   0x00: addiu $t0, $zero, 10
    //   0x04: addu  $v0, $v0, $t0
    //   0x08: addiu $t0, $t0, -1
    //   0x0c: bne   $t0, $zero, -3
    //   0x10: nop
    //   0x14: addu  $a0, $v0, $zero
    //   0x18: addiu $v0, $zero, 4246
    //   0x1c: syscall
    let mut vm = vm_with_program(
        0,
        &[
            (0x00, 0x2408_000A),
            (0x04, 0x0048_1021),
            (0x08, 0x2508_FFFF),
            (0x0c, 0x1500_FFFD),
            (0x10, 0x0000_0000),
            (0x14, 0x0040_2021),
            (0x18, 0x2402_1096),
            (0x1c, SYSCALL),
        ],
    );

    while !vm.state.exited {
        let next_pc = vm.state.next_pc;
        let step = vm.state.step;
        let witness = vm.step(true).unwrap().unwrap();
        assert_eq!(vm.state.registers[0], 0);
        assert_eq!(vm.state.step, step + 1);
        if !vm.state.exited {
            assert_eq!(vm.state.pc, next_pc);
        }
        assert_eq!(witness.encode_step_input().len(), 4 + 384 + 32 + witness.mem_proof.len());
        assert!(step < 1000, "program does not terminate");
    }
    assert_eq!(vm.state.exit_code, 55);
}

#[test]
fn test_last_word_of_the_address_space() {
    // lw $t1, -4($zero) then sw $t1, -8($zero)
    let mut vm = vm_with_program(0, &[(0, 0x8C09_FFFC), (4, 0xAC09_FFF8)]);
    vm.state.memory.set_memory(0xFFFF_FFFC, 0x0102_0304).unwrap();

    let witness = vm.step(true).unwrap().unwrap();
    assert_eq!(vm.state.registers[9], 0x0102_0304);
    assert_eq!(witness.mem_proof.len(), 2 * MEM_PROOF_SIZE);
    let root = vm.state.memory.merkle_root();
    assert!(verify_proof(&root, 0xFFFF_FFFC, &witness.mem_proof[MEM_PROOF_SIZE..]));

    vm.step(false).unwrap();
    assert_eq!(vm.state.memory.get_memory(0xFFFF_FFF8).unwrap(), 0x0102_0304);
    assert_eq!(
        vm.state.memory.merkle_root(),
        naive_merkle_root(&vm.state.memory)
    );
}
