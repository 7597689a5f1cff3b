//! Uxn virtual machine engine
//!
//! This crate provides:
//! - The guest machine model: 64 KiB of memory, two wrapping 256-byte stacks,
//!   a device page and a pluggable device bus (`vm`)
//! - A single-step reference interpreter (`vm::interp`)
//! - A basic-block JIT compiler built on Cranelift (`jit`, behind the `jit`
//!   feature): block discovery, compile-time stack modeling with constant
//!   folding and a cached top-of-stack, direct inter-block linking with
//!   self-modification guards, and a debug-info hook for profiler consumers
//!
//! The JIT is best-effort: any block it cannot compile is executed by the
//! interpreter instead, so guest behavior never depends on the JIT.

pub mod vm;

#[cfg(feature = "jit")]
pub mod jit;
