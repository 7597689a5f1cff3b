#![cfg(feature = "jit")]

//! The cached top-of-stack and constant folding must never change guest
//! state, and straight-line constant code must never bounce.

mod common;

use common::run_rom;

#[test]
fn add_consts() {
    // #01 #01 ADD
    let (jit, vm) = run_rom(&[0x80, 0x01, 0x80, 0x01, 0x18]);
    assert_eq!(vm.wsp, 1);
    assert_eq!(vm.ws[0], 0x02);
    assert_eq!(jit.stats().num_bounces, 0);
}

#[test]
fn inc_wraps_const() {
    // #ff INC ?{ #01 }
    let (jit, vm) = run_rom(&[0x80, 0xff, 0x01, 0x20, 0x00, 0x02, 0x80, 0x01]);
    assert_eq!(vm.wsp, 1);
    assert_eq!(vm.ws[0], 0x01);
    assert_eq!(jit.stats().num_bounces, 0);
}

#[test]
fn inc_keep() {
    // #01 INCk
    let (jit, vm) = run_rom(&[0x80, 0x01, 0x81]);
    assert_eq!(vm.wsp, 2);
    assert_eq!(&vm.ws[..2], &[0x01, 0x02]);
    assert_eq!(jit.stats().num_bounces, 0);
}

#[test]
fn ora_keep_short_literal() {
    // #0102 ORAk: the keep flush must materialize the cached short push
    let (jit, vm) = run_rom(&[0xa0, 0x01, 0x02, 0x9d]);
    assert_eq!(vm.wsp, 3);
    assert_eq!(&vm.ws[..3], &[0x01, 0x02, 0x03]);
    assert_eq!(jit.stats().num_bounces, 0);
}

#[test]
fn ora_keep_byte_literals() {
    // #01 #02 ORAk: only the newest push is cached; the older one must
    // already be in guest memory
    let (jit, vm) = run_rom(&[0x80, 0x01, 0x80, 0x02, 0x9d]);
    assert_eq!(vm.wsp, 3);
    assert_eq!(&vm.ws[..3], &[0x01, 0x02, 0x03]);
    assert_eq!(jit.stats().num_bounces, 0);
}

#[test]
fn cached_pop_after_push() {
    // #12 #34 SWP: the second literal is popped straight out of the cache
    let (jit, vm) = run_rom(&[0x80, 0x12, 0x80, 0x34, 0x04]);
    assert_eq!(vm.wsp, 2);
    assert_eq!(&vm.ws[..2], &[0x34, 0x12]);
    assert_eq!(jit.stats().num_bounces, 0);
}

#[test]
fn mixed_width_cache_flush() {
    // #1234 #56 ADD: a byte pop over a cached short must flush first
    let (jit, vm) = run_rom(&[0xa0, 0x12, 0x34, 0x80, 0x56, 0x18]);
    assert_eq!(vm.wsp, 2);
    assert_eq!(&vm.ws[..2], &[0x12, 0x8a]);
    assert_eq!(jit.stats().num_bounces, 0);
}
