#![cfg(feature = "jit")]

//! Semantic equivalence: every ROM must leave the machine in exactly the
//! state the reference interpreter produces (stacks, pointers, memory and
//! the device page).

use uxn_engine::jit::Jit;
use uxn_engine::vm::{interp, Uxn, RESET_VECTOR};

fn run_interpreter(rom: &[u8]) -> Box<Uxn> {
    let mut vm = Uxn::new();
    vm.load_rom(rom).unwrap();
    let mut pc = RESET_VECTOR;
    let mut fuel = 1_000_000u32;
    while pc != 0 {
        pc = interp::step(&mut vm, pc);
        fuel -= 1;
        assert!(fuel > 0, "reference interpreter did not halt");
    }
    vm
}

fn run_jit(rom: &[u8]) -> Box<Uxn> {
    let mut vm = Uxn::new();
    vm.load_rom(rom).unwrap();
    let mut jit = Jit::new().unwrap();
    jit.execute(&mut vm, RESET_VECTOR);
    vm
}

fn assert_equivalent(rom: &[u8]) {
    let reference = run_interpreter(rom);
    let jitted = run_jit(rom);

    assert_eq!(jitted.wsp, reference.wsp, "wsp");
    assert_eq!(jitted.rsp, reference.rsp, "rsp");
    assert_eq!(&jitted.ws[..], &reference.ws[..], "working stack");
    assert_eq!(&jitted.rs[..], &reference.rs[..], "return stack");
    assert_eq!(&jitted.device[..], &reference.device[..], "device page");
    assert!(jitted.memory[..] == reference.memory[..], "guest memory");
}

#[test]
fn arithmetic_and_logic() {
    // #12 #34 ADD #0f AND #03 ORA #ff EOR #02 MUL #03 DIV
    assert_equivalent(&[
        0x80, 0x12, 0x80, 0x34, 0x18, 0x80, 0x0f, 0x1c, 0x80, 0x03, 0x1d, 0x80, 0xff, 0x1e,
        0x80, 0x02, 0x1a, 0x80, 0x03, 0x1b,
    ]);
    // #1234 #0404 ADD2 #00ff AND2 SWP2
    assert_equivalent(&[
        0xa0, 0x12, 0x34, 0xa0, 0x04, 0x04, 0x38, 0xa0, 0x00, 0xff, 0x3c, 0x24,
    ]);
}

#[test]
fn keep_and_return_modes() {
    // #0a #05 SUBk DIVk MULk ADDk
    assert_equivalent(&[0x80, 0x0a, 0x80, 0x05, 0x99, 0x9b, 0x9a, 0x98]);
    // LITr 07 LITr 03 ADDr STHr INC
    assert_equivalent(&[0xc0, 0x07, 0xc0, 0x03, 0x58, 0x4f, 0x01]);
    // LIT2r 1234 INC2kr POP2r STH2r
    assert_equivalent(&[0xe0, 0x12, 0x34, 0xe1, 0x62, 0x6f]);
}

#[test]
fn stack_shuffles_and_wrap() {
    // POP on empty stack, then push over the wrapped pointer
    assert_equivalent(&[0x02, 0x80, 0x41, 0x06, 0x03]);
    // #01 #02 #03 ROT OVR NIP SWP DUP
    assert_equivalent(&[
        0x80, 0x01, 0x80, 0x02, 0x80, 0x03, 0x05, 0x07, 0x03, 0x04, 0x06,
    ]);
    // Short shuffles: #0102 #0304 SWP2 OVR2 ROT2 NIP2 DUP2
    assert_equivalent(&[
        0xa0, 0x01, 0x02, 0xa0, 0x03, 0x04, 0x24, 0x27, 0x25, 0x23, 0x26,
    ]);
}

#[test]
fn comparisons() {
    // #05 #03 GTH #05 #03 LTH EQU #01 NEQ
    assert_equivalent(&[
        0x80, 0x05, 0x80, 0x03, 0x0a, 0x80, 0x05, 0x80, 0x03, 0x0b, 0x08, 0x80, 0x01, 0x09,
    ]);
    // #0102 #0103 GTH2 #0102 #0103 LTH2
    assert_equivalent(&[
        0xa0, 0x01, 0x02, 0xa0, 0x01, 0x03, 0x2a, 0xa0, 0x01, 0x02, 0xa0, 0x01, 0x03, 0x2b,
    ]);
}

#[test]
fn shifts() {
    // #34 #33 SFT, #1234 #14 SFT2, SFTk over a short
    assert_equivalent(&[0x80, 0x34, 0x80, 0x33, 0x1f]);
    assert_equivalent(&[0xa0, 0x12, 0x34, 0x80, 0x14, 0x3f]);
    assert_equivalent(&[0xa0, 0x12, 0x34, 0x80, 0x01, 0xbf]);
}

#[test]
fn memory_traffic() {
    // #abcd #80 STZ2 #80 LDZ2 ADD
    assert_equivalent(&[
        0xa0, 0xab, 0xcd, 0x80, 0x80, 0x31, 0x80, 0x80, 0x30, 0x18,
    ]);
    // #1234 ;cell STA2 ;cell LDA2 BRK @cell $2
    assert_equivalent(&[
        0xa0, 0x12, 0x34, 0xa0, 0x01, 0x0c, 0x35, 0xa0, 0x01, 0x0c, 0x34, 0x00,
    ]);
    // Relative store then load: #77 ,cell STR ,cell LDR BRK @cell $1
    assert_equivalent(&[
        0x80, 0x77, 0x80, 0x04, 0x13, 0x80, 0x01, 0x12, 0x00,
    ]);
}

#[test]
fn device_page_round_trip() {
    // Without a bus, DEO lands in the device page and DEI reads it back:
    // #2a #40 DEO #40 DEI INC #41 DEO
    assert_equivalent(&[
        0x80, 0x2a, 0x80, 0x40, 0x17, 0x80, 0x40, 0x16, 0x01, 0x80, 0x41, 0x17,
    ]);
    // DEO2/DEI2: #beef #50 DEO2 #50 DEI2
    assert_equivalent(&[
        0xa0, 0xbe, 0xef, 0x80, 0x50, 0x37, 0x80, 0x50, 0x36,
    ]);
}

#[test]
fn subroutines_and_jumps() {
    // The modulo routine
    assert_equivalent(&[
        0x80, 0x07, 0x80, 0x04, 0x60, 0x00, 0x01, 0x00, 0x9b, 0x1a, 0x19, 0x6c,
    ]);
    // JCN both ways in one program:
    // #abcd #01 ,&pass JCN SWP &pass POP
    assert_equivalent(&[
        0xa0, 0xab, 0xcd, 0x80, 0x01, 0x80, 0x01, 0x0d, 0x04, 0x02,
    ]);
    // JSR through a register target: #01 ,&r JSR BRK &r INC JMP2r
    assert_equivalent(&[
        0x80, 0x01, 0x80, 0x01, 0x0e, 0x00, 0x01, 0x6c,
    ]);
}

#[test]
fn boolean_jump_idiom() {
    // #05 #03 GTH JMP BRK #2a, in both the taken and fallthrough shapes
    assert_equivalent(&[0x80, 0x05, 0x80, 0x03, 0x0a, 0x0c, 0x00, 0x80, 0x2a]);
    assert_equivalent(&[0x80, 0x03, 0x80, 0x05, 0x0a, 0x0c, 0x00, 0x80, 0x2a]);
}

#[test]
fn sth_traffic() {
    // #12 STH #34 STH ADDr STHr
    assert_equivalent(&[0x80, 0x12, 0x0f, 0x80, 0x34, 0x0f, 0x58, 0x4f]);
    // Shorts: #1234 STH2 STH2r
    assert_equivalent(&[0xa0, 0x12, 0x34, 0x2f, 0x6f]);
}
