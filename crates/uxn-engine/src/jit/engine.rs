//! Executor and link queues
//!
//! The executor looks up or compiles the block at the current pc, invokes it
//! and follows the returned pc. A non-zero return is a bounce: the block had
//! to come back to the trampoline instead of jumping into the next block
//! directly. Each lookup miss drains three queues in order: compile (which
//! may discover further blocks), link (patch the jump slots of everything
//! just compiled) and cleanup (recycle per-compile resources).

use std::rc::Rc;

use crate::vm::{interp, Uxn, RESET_VECTOR};

use super::backend::{CodegenError, CompilerHandle, NativeBackend};
use super::block_map::{Block, BlockMap, LinkSlot};
use super::compiler;
use super::hook::JitHook;

/// Engine counters. `num_bounces` counts returns through the trampoline;
/// `code_size` is the total native code emitted.
#[derive(Debug, Default, Clone, Copy)]
pub struct JitStats {
    pub num_blocks: u32,
    pub num_bounces: u64,
    pub code_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkKind {
    /// Call through the host-callable entry (JSR with a known target).
    ToHead,
    /// Tail jump into the fast body entry (JMP/JCN with a known target).
    ToBody,
}

pub(crate) struct LinkEntry {
    pub slot: Rc<LinkSlot>,
    pub block: Rc<Block>,
    pub kind: LinkKind,
}

struct CompileEntry {
    block: Rc<Block>,
    pc: u16,
}

/// The JIT engine.
///
/// Single-threaded by design: the executor, block map, queues and compiler
/// all share the caller's thread, so no locking is needed anywhere in the
/// core.
pub struct Jit {
    pub(crate) backend: NativeBackend,
    blocks: BlockMap,
    compile_queue: Vec<CompileEntry>,
    pub(crate) link_queue: Vec<LinkEntry>,
    cleanup_queue: Vec<CompilerHandle>,
    handle_pool: Vec<CompilerHandle>,
    pub(crate) stats: JitStats,
    pub(crate) hook: Option<Box<dyn JitHook>>,
}

impl Jit {
    pub fn new() -> Result<Self, CodegenError> {
        Self::with_hook(None)
    }

    pub fn with_hook(hook: Option<Box<dyn JitHook>>) -> Result<Self, CodegenError> {
        Ok(Jit {
            backend: NativeBackend::host()?,
            blocks: BlockMap::new(),
            compile_queue: Vec::new(),
            link_queue: Vec::new(),
            cleanup_queue: Vec::new(),
            handle_pool: Vec::new(),
            stats: JitStats::default(),
            hook,
        })
    }

    pub fn stats(&self) -> &JitStats {
        &self.stats
    }

    pub fn backend(&self) -> &NativeBackend {
        &self.backend
    }

    /// Run the guest from `pc` until it halts (BRK or an empty vector).
    ///
    /// Zero-page addresses are delegated to the interpreter one step at a
    /// time; everything else runs compiled.
    pub fn execute(&mut self, vm: &mut Uxn, mut pc: u16) {
        while pc != 0 {
            if pc >= RESET_VECTOR {
                let block = self.ensure_compiled(vm, pc);
                match block.fn_ptr() {
                    Some(f) => {
                        // Safety: the block's module is alive until engine
                        // teardown and the function only touches the
                        // `#[repr(C)]` prefix of the VM.
                        pc = unsafe { f(vm as *mut Uxn) } as u16;
                        if pc != 0 {
                            self.stats.num_bounces += 1;
                        }
                    }
                    // Best-effort JIT: a block the emitter could not produce
                    // is interpreted instead.
                    None => pc = interp::step(vm, pc),
                }
            } else {
                pc = interp::step(vm, pc);
            }
        }
    }

    /// Register the block keyed by `pc`, scheduling a compile on first
    /// sight.
    pub(crate) fn queue_block(&mut self, pc: u16) -> Rc<Block> {
        let (block, inserted) = self.blocks.get_or_insert(pc);
        if inserted {
            self.stats.num_blocks += 1;
            self.compile_queue.push(CompileEntry {
                block: block.clone(),
                pc,
            });
        }
        block
    }

    fn ensure_compiled(&mut self, vm: &mut Uxn, pc: u16) -> Rc<Block> {
        let block = self.queue_block(pc);
        if block.fn_ptr().is_some() {
            return block;
        }

        // Compile wavefront: each compile may discover further targets and
        // push them onto the queue.
        while let Some(entry) = self.compile_queue.pop() {
            let mut handle = self.handle_pool.pop().unwrap_or_default();
            if let Some(hook) = self.hook.as_deref_mut() {
                hook.begin_block(entry.pc);
            }
            // On failure the block's fn stays unset and the executor falls
            // back to the interpreter for it.
            let _ = compiler::compile_block(self, vm, entry.block, entry.pc, &mut handle);
            self.cleanup_queue.push(handle);
        }

        // Link: point every jump slot at its target's entry. A still-missing
        // target leaves the slot unlinked; the site keeps bouncing through
        // the trampoline.
        while let Some(entry) = self.link_queue.pop() {
            let target = match entry.kind {
                LinkKind::ToHead => entry.block.head_addr(),
                LinkKind::ToBody => entry.block.body_addr(),
            };
            if target != 0 {
                entry.slot.set(target);
            }
        }

        // Cleanup: recycle the per-compile emitter state.
        while let Some(mut handle) = self.cleanup_queue.pop() {
            handle.clear();
            self.handle_pool.push(handle);
        }

        block
    }
}

impl Drop for Jit {
    fn drop(&mut self) {
        for block in self.blocks.all() {
            block.release_code();
        }
    }
}
