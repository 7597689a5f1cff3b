#![cfg(feature = "jit")]

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::jit;
use uxn_engine::vm::{Device, Uxn, RESET_VECTOR};

/// Records every DEO callback and serves a fixed value on 0xd2/0xd3.
struct TestDevice {
    deo_log: Rc<RefCell<Vec<(u8, u8)>>>,
    dei_value: u16,
}

impl Device for TestDevice {
    fn dei(&mut self, vm: &mut Uxn, addr: u8) -> u8 {
        match addr {
            0xd2 => (self.dei_value >> 8) as u8,
            0xd3 => self.dei_value as u8,
            _ => vm.device[addr as usize],
        }
    }

    fn deo(&mut self, vm: &mut Uxn, addr: u8) {
        self.deo_log.borrow_mut().push((addr, vm.device[addr as usize]));
    }
}

fn boot_with_device(rom: &[u8], dei_value: u16) -> (Box<Uxn>, Rc<RefCell<Vec<(u8, u8)>>>) {
    let deo_log = Rc::new(RefCell::new(Vec::new()));
    let mut vm = Uxn::with_device(Box::new(TestDevice {
        deo_log: deo_log.clone(),
        dei_value,
    }));
    vm.load_rom(rom).unwrap();
    (vm, deo_log)
}

#[test]
fn dei2_composes_two_reads() {
    // |d0 @Test &deo $2 &dei $2 |0100 .Test/dei DEI2
    let (mut vm, _log) = boot_with_device(&[0x80, 0xd2, 0x36], 0xbeef);
    jit().execute(&mut vm, RESET_VECTOR);
    assert_eq!(vm.wsp, 2);
    assert_eq!(vm.ws[0], 0xbe);
    assert_eq!(vm.ws[1], 0xef);
}

#[test]
fn deo2_issues_two_writes() {
    // |d0 @Test &deo $2 |0100 #cafe .Test/deo DEO2
    let (mut vm, log) = boot_with_device(&[0xa0, 0xca, 0xfe, 0x80, 0xd0, 0x37], 0);
    jit().execute(&mut vm, RESET_VECTOR);
    assert_eq!(vm.wsp, 0);
    assert_eq!(log.borrow().as_slice(), &[(0xd0, 0xca), (0xd1, 0xfe)]);
    assert_eq!(vm.device[0xd0], 0xca);
    assert_eq!(vm.device[0xd1], 0xfe);
}

#[test]
fn deo_byte() {
    // #2a #d0 DEO
    let (mut vm, log) = boot_with_device(&[0x80, 0x2a, 0x80, 0xd0, 0x17], 0);
    jit().execute(&mut vm, RESET_VECTOR);
    assert_eq!(vm.wsp, 0);
    assert_eq!(log.borrow().as_slice(), &[(0xd0, 0x2a)]);
}

#[test]
fn device_handler_sees_flushed_stacks() {
    // #11 #22 #d0 DEO: the cached push of #22... is materialized before the
    // handler runs, and the stack pointer it observes matches
    struct SpyDevice {
        seen: Rc<RefCell<Vec<(u8, Vec<u8>)>>>,
    }
    impl Device for SpyDevice {
        fn deo(&mut self, vm: &mut Uxn, _addr: u8) {
            self.seen
                .borrow_mut()
                .push((vm.wsp, vm.ws[..vm.wsp as usize].to_vec()));
        }
    }

    let seen = Rc::new(RefCell::new(Vec::new()));
    let mut vm = Uxn::with_device(Box::new(SpyDevice { seen: seen.clone() }));
    vm.load_rom(&[0x80, 0x11, 0x80, 0x22, 0x80, 0xd0, 0x17])
        .unwrap();
    jit().execute(&mut vm, RESET_VECTOR);

    assert_eq!(vm.wsp, 1);
    assert_eq!(vm.ws[0], 0x11);
    assert_eq!(seen.borrow().as_slice(), &[(1, vec![0x11])]);
}
