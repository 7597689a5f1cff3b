//! Hook consumers
//!
//! [`PerfMapHook`] writes the `/tmp/perf-<pid>.map` format understood by
//! `perf` and most sampling profilers; [`CompositeHook`] chains two hooks.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use super::hook::{BlockInfo, JitHook};

/// Writes one perf-map line per compiled block, flushed eagerly so the map is
/// usable even if the process is sampled mid-run.
pub struct PerfMapHook {
    out: BufWriter<File>,
}

impl PerfMapHook {
    /// Create the map file for the current process.
    pub fn new() -> io::Result<Self> {
        let mut path = PathBuf::from("/tmp");
        path.push(format!("perf-{}.map", std::process::id()));
        Ok(PerfMapHook {
            out: BufWriter::new(File::create(path)?),
        })
    }
}

impl JitHook for PerfMapHook {
    fn end_block(&mut self, info: &BlockInfo<'_>) {
        let _ = writeln!(
            self.out,
            "{:x} {:x} uxn:{:04x}",
            info.native_start, info.native_size, info.entry
        );
        let _ = self.out.flush();
    }
}

/// Fans every notification out to two hooks.
pub struct CompositeHook<A, B>(pub A, pub B);

impl<A: JitHook, B: JitHook> JitHook for CompositeHook<A, B> {
    fn begin_block(&mut self, entry: u16) {
        self.0.begin_block(entry);
        self.1.begin_block(entry);
    }

    fn opcode(&mut self, pc: u16, opcode: u8) {
        self.0.opcode(pc, opcode);
        self.1.opcode(pc, opcode);
    }

    fn end_block(&mut self, info: &BlockInfo<'_>) {
        self.0.end_block(info);
        self.1.end_block(info);
    }
}
