//! JIT compilation engine for Uxn bytecode
//!
//! The engine discovers basic blocks on demand, compiles each one to native
//! code through Cranelift and links blocks together with guarded direct
//! jumps. It includes:
//! - The emitter adapter over Cranelift (`backend`)
//! - The block index: an insertion-only hash trie keyed by guest pc
//!   (`block_map`)
//! - The per-block compiler: abstract stack model, constant folding, cached
//!   top-of-stack, register bank (`compiler`)
//! - The executor, the compile/link/cleanup queues and teardown (`engine`)
//! - The debug-info hook and the perf-map consumer (`hook`, `perf`)

mod backend;
mod block_map;
mod compiler;
mod engine;
mod hook;
mod perf;

pub use backend::{CodegenError, NativeBackend, TargetArch};
pub use engine::{Jit, JitStats};
pub use hook::{AddrMark, BlockInfo, JitHook};
pub use perf::{CompositeHook, PerfMapHook};
