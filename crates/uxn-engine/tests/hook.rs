#![cfg(feature = "jit")]

//! The debug-info hook must see every block: begin before emission, one
//! opcode notification per compiled opcode, and an end with resolved
//! address marks inside the emitted range.

use std::cell::RefCell;
use std::rc::Rc;

use uxn_engine::jit::{BlockInfo, CompositeHook, Jit, JitHook};
use uxn_engine::vm::{Uxn, RESET_VECTOR};

#[derive(Default)]
struct Record {
    begins: Vec<u16>,
    opcodes: Vec<(u16, u8)>,
    ends: Vec<(u16, usize, usize, Vec<(u16, usize)>)>,
}

struct RecordingHook(Rc<RefCell<Record>>);

impl JitHook for RecordingHook {
    fn begin_block(&mut self, entry: u16) {
        self.0.borrow_mut().begins.push(entry);
    }

    fn opcode(&mut self, pc: u16, opcode: u8) {
        self.0.borrow_mut().opcodes.push((pc, opcode));
    }

    fn end_block(&mut self, info: &BlockInfo<'_>) {
        self.0.borrow_mut().ends.push((
            info.entry,
            info.native_start,
            info.native_size,
            info.marks.iter().map(|m| (m.pc, m.addr)).collect(),
        ));
    }
}

fn run_with_hook(rom: &[u8], hook: Box<dyn JitHook>) -> Box<Uxn> {
    let mut vm = Uxn::new();
    vm.load_rom(rom).unwrap();
    let mut jit = Jit::with_hook(Some(hook)).unwrap();
    jit.execute(&mut vm, RESET_VECTOR);
    vm
}

#[test]
fn hook_sees_block_lifecycle() {
    let record = Rc::new(RefCell::new(Record::default()));
    // #01 #02 ADD
    run_with_hook(
        &[0x80, 0x01, 0x80, 0x02, 0x18],
        Box::new(RecordingHook(record.clone())),
    );

    let record = record.borrow();
    assert_eq!(record.begins, vec![0x0100]);

    // LIT, LIT, ADD, then the trailing BRK
    let ops: Vec<u8> = record.opcodes.iter().map(|&(_, op)| op).collect();
    assert_eq!(ops, vec![0x80, 0x80, 0x18, 0x00]);
    assert_eq!(record.opcodes[0].0, 0x0100);
    assert_eq!(record.opcodes[1].0, 0x0102);
    assert_eq!(record.opcodes[2].0, 0x0104);
    assert_eq!(record.opcodes[3].0, 0x0105);

    assert_eq!(record.ends.len(), 1);
    let (entry, start, size, marks) = &record.ends[0];
    assert_eq!(*entry, 0x0100);
    assert!(*size > 0);
    assert!(!marks.is_empty());
    for &(pc, addr) in marks {
        assert!((0x0100..=0x0105).contains(&pc));
        assert!(addr >= *start && addr < start + size);
    }
}

#[test]
fn hook_sees_discovered_blocks() {
    let record = Rc::new(RefCell::new(Record::default()));
    // #0a !{ INC }: the jump target is discovered and compiled in the same
    // wavefront
    run_with_hook(
        &[0x80, 0x0a, 0x40, 0x00, 0x01, 0x01],
        Box::new(RecordingHook(record.clone())),
    );

    let record = record.borrow();
    let mut begins = record.begins.clone();
    begins.sort_unstable();
    assert_eq!(begins, vec![0x0100, 0x0106]);
    assert_eq!(record.ends.len(), 2);
}

#[test]
fn composite_hook_fans_out() {
    let first = Rc::new(RefCell::new(Record::default()));
    let second = Rc::new(RefCell::new(Record::default()));
    run_with_hook(
        &[0x80, 0x01, 0x01],
        Box::new(CompositeHook(
            RecordingHook(first.clone()),
            RecordingHook(second.clone()),
        )),
    );

    assert_eq!(first.borrow().begins, second.borrow().begins);
    assert_eq!(first.borrow().opcodes, second.borrow().opcodes);
    assert_eq!(first.borrow().ends.len(), second.borrow().ends.len());
}
