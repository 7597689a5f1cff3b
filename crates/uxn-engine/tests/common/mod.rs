#![cfg(feature = "jit")]
#![allow(dead_code)]

use uxn_engine::jit::Jit;
use uxn_engine::vm::{Uxn, RESET_VECTOR};

pub fn boot(rom: &[u8]) -> Box<Uxn> {
    let mut vm = Uxn::new();
    vm.load_rom(rom).expect("rom fits in memory");
    vm
}

pub fn jit() -> Jit {
    Jit::new().expect("host backend")
}

/// Load a ROM and run its reset vector under the JIT.
pub fn run_rom(rom: &[u8]) -> (Jit, Box<Uxn>) {
    let mut jit = jit();
    let mut vm = boot(rom);
    jit.execute(&mut vm, RESET_VECTOR);
    (jit, vm)
}
