//! Debug-info hook
//!
//! The compiler reports every emitted block to an optional hook: consumers
//! build GDB jit-interface entries or perf map files from the raw tuples.
//! The engine itself never interprets the information.

/// A resolved per-opcode address mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrMark {
    /// Guest address of the opcode.
    pub pc: u16,
    /// Native address its emitted code starts at.
    pub addr: usize,
}

/// Everything a consumer learns about one compiled block.
pub struct BlockInfo<'a> {
    /// Guest entry pc.
    pub entry: u16,
    /// Native address of the block body.
    pub native_start: usize,
    /// Size of the block body in bytes.
    pub native_size: usize,
    /// Per-opcode address marks, in emission order.
    pub marks: &'a [AddrMark],
}

/// Observer of block compilation.
pub trait JitHook {
    /// Called before any emission for the block at `entry`.
    fn begin_block(&mut self, _entry: u16) {}

    /// Called before each opcode is emitted.
    fn opcode(&mut self, _pc: u16, _opcode: u8) {}

    /// Called after the block's native code has been finalized.
    fn end_block(&mut self, _info: &BlockInfo<'_>) {}
}
