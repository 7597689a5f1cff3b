//! Block index
//!
//! An insertion-only hash trie keyed by the 16-bit guest entry pc. Each block
//! is itself a trie node; entries are never removed or relocated, so block
//! records can be shared freely (`Rc`) and published function pointers stay
//! valid until teardown. A flat list of every block is kept alongside the
//! trie for ordered teardown.

use std::cell::{Cell, OnceCell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};

use cranelift_jit::JITModule;

use crate::vm::Uxn;

/// Host-callable entry of a compiled block.
pub(crate) type HeadFn = unsafe extern "C" fn(*mut Uxn) -> u32;

const TRIE_FANOUT: usize = 16;

// https://nullprogram.com/blog/2018/07/31/
fn prospector32(mut x: u32) -> u32 {
    x ^= x >> 15;
    x = x.wrapping_mul(0x2c1b3c6d);
    x ^= x >> 12;
    x = x.wrapping_mul(0x297a2d39);
    x ^= x >> 15;
    x
}

/// A patchable inter-block jump site.
///
/// Generated code loads the slot and tail-jumps (or calls) through it when it
/// is non-zero; zero means unlinked and the site returns the assumed target
/// pc to the trampoline instead. The linker fills the slot once the target
/// block is compiled. Atomic because the reader is generated code.
#[repr(transparent)]
pub(crate) struct LinkSlot(AtomicUsize);

impl LinkSlot {
    pub fn new() -> Self {
        LinkSlot(AtomicUsize::new(0))
    }

    /// Address baked into generated code as the load operand.
    pub fn addr(&self) -> usize {
        self as *const LinkSlot as usize
    }

    pub fn set(&self, target: usize) {
        self.0.store(target, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// A compiled (or about to be compiled) basic block.
///
/// `fn_ptr` transitions from `None` to `Some` exactly once, when the block's
/// native code is published together with its module and entry addresses.
pub(crate) struct Block {
    key: u16,
    children: [OnceCell<Rc<Block>>; TRIE_FANOUT],
    fn_ptr: Cell<Option<HeadFn>>,
    head_addr: Cell<usize>,
    body_addr: Cell<usize>,
    module: RefCell<Option<JITModule>>,
    /// Outgoing link slots; kept alive as long as this block's code.
    slots: RefCell<Vec<Rc<LinkSlot>>>,
}

impl Block {
    fn new(key: u16) -> Self {
        Block {
            key,
            children: std::array::from_fn(|_| OnceCell::new()),
            fn_ptr: Cell::new(None),
            head_addr: Cell::new(0),
            body_addr: Cell::new(0),
            module: RefCell::new(None),
            slots: RefCell::new(Vec::new()),
        }
    }

    pub fn key(&self) -> u16 {
        self.key
    }

    pub fn fn_ptr(&self) -> Option<HeadFn> {
        self.fn_ptr.get()
    }

    pub fn head_addr(&self) -> usize {
        self.head_addr.get()
    }

    pub fn body_addr(&self) -> usize {
        self.body_addr.get()
    }

    pub fn add_slot(&self, slot: Rc<LinkSlot>) {
        self.slots.borrow_mut().push(slot);
    }

    pub fn publish(&self, f: HeadFn, head_addr: usize, body_addr: usize, module: JITModule) {
        debug_assert!(self.fn_ptr.get().is_none(), "block published twice");
        *self.module.borrow_mut() = Some(module);
        self.head_addr.set(head_addr);
        self.body_addr.set(body_addr);
        self.fn_ptr.set(Some(f));
    }

    /// Drop the block's native code. Only valid at engine teardown: callers
    /// into this block (link slots, the executor) must be gone.
    pub fn release_code(&self) {
        self.fn_ptr.set(None);
        self.head_addr.set(0);
        self.body_addr.set(0);
        if let Some(module) = self.module.borrow_mut().take() {
            unsafe { module.free_memory() };
        }
    }
}

/// The block index plus the all-blocks list.
pub(crate) struct BlockMap {
    root: OnceCell<Rc<Block>>,
    all: RefCell<Vec<Rc<Block>>>,
}

impl BlockMap {
    pub fn new() -> Self {
        BlockMap {
            root: OnceCell::new(),
            all: RefCell::new(Vec::new()),
        }
    }

    /// Find or create the block keyed by `pc`. The bool is true when a new
    /// record was inserted.
    pub fn get_or_insert(&self, pc: u16) -> (Rc<Block>, bool) {
        let mut node = match self.root.get() {
            Some(root) => root.clone(),
            None => {
                let block = self.new_block(pc);
                let _ = self.root.set(block.clone());
                return (block, true);
            }
        };

        let mut hash = prospector32(pc as u32);
        loop {
            if node.key == pc {
                return (node, false);
            }
            // Consume a nibble per level; once the hash runs out the walk
            // degenerates to a list, which is still correct.
            let idx = (hash & 0xf) as usize;
            hash >>= 4;
            let next = match node.children[idx].get() {
                Some(child) => child.clone(),
                None => {
                    let block = self.new_block(pc);
                    let _ = node.children[idx].set(block.clone());
                    return (block, true);
                }
            };
            node = next;
        }
    }

    fn new_block(&self, pc: u16) -> Rc<Block> {
        let block = Rc::new(Block::new(pc));
        self.all.borrow_mut().push(block.clone());
        block
    }

    /// Snapshot of every block, in insertion order, for teardown.
    pub fn all(&self) -> Vec<Rc<Block>> {
        self.all.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.all.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_insert_is_idempotent() {
        let map = BlockMap::new();
        let (a, inserted_a) = map.get_or_insert(0x0100);
        assert!(inserted_a);
        let (b, inserted_b) = map.get_or_insert(0x0100);
        assert!(!inserted_b);
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn distinct_keys_get_distinct_blocks() {
        let map = BlockMap::new();
        for pc in 0x0100..0x0500u16 {
            let (block, inserted) = map.get_or_insert(pc);
            assert!(inserted);
            assert_eq!(block.key(), pc);
        }
        assert_eq!(map.len(), 0x0400);
        for pc in 0x0100..0x0500u16 {
            let (block, inserted) = map.get_or_insert(pc);
            assert!(!inserted);
            assert_eq!(block.key(), pc);
        }
        assert_eq!(map.len(), 0x0400);
    }

    #[test]
    fn link_slot_starts_unlinked() {
        let slot = LinkSlot::new();
        assert_eq!(slot.get(), 0);
        slot.set(0xdead_0000);
        assert_eq!(slot.get(), 0xdead_0000);
        assert_ne!(slot.addr(), 0);
    }
}
