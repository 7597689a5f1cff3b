//! Command-line host for the Uxn engine
//!
//! Loads a ROM at the reset vector, wires the console and system devices,
//! runs the reset vector, then feeds command-line arguments and stdin through
//! the console vector. The process exit code is the guest's system exit code
//! (0 if it never set one); block and bounce counts go to stderr.

mod devices;

use std::cell::Cell;
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use uxn_engine::vm::{interp, Uxn, RESET_VECTOR};

use devices::{
    HostDevices, CONSOLE_READ, CONSOLE_TYPE, CONSOLE_VECTOR, INPUT_ARG, INPUT_ARG_END,
    INPUT_ARG_SPACER, INPUT_STDIN,
};

#[derive(Parser)]
#[command(name = "uxn")]
#[command(about = "Uxn virtual machine with a block JIT")]
#[command(version)]
struct Args {
    /// ROM file to load at the reset vector
    rom: PathBuf,

    /// Arguments forwarded to the guest console
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,

    /// Disable the JIT and interpret everything
    #[arg(long)]
    no_jit: bool,

    /// Write /tmp/perf-<pid>.map for sampling profilers
    #[cfg(feature = "jit")]
    #[arg(long)]
    perf_map: bool,
}

/// Execution engine: the JIT when available, the interpreter otherwise.
enum Engine {
    #[cfg(feature = "jit")]
    Jit(uxn_engine::jit::Jit),
    Interp,
}

impl Engine {
    fn execute(&mut self, vm: &mut Uxn, pc: u16) {
        match self {
            #[cfg(feature = "jit")]
            Engine::Jit(jit) => jit.execute(vm, pc),
            Engine::Interp => {
                let mut pc = pc;
                while pc != 0 {
                    pc = interp::step(vm, pc);
                }
            }
        }
    }
}

/// Send one byte of console input through the guest's console vector.
fn send_console(engine: &mut Engine, vm: &mut Uxn, kind: u8, value: u8) {
    vm.device[CONSOLE_TYPE as usize] = kind;
    vm.device[CONSOLE_READ as usize] = value;
    let vector = vm.dev_read2(CONSOLE_VECTOR);
    engine.execute(vm, vector);
}

/// Feed the trailing CLI arguments to the guest, one character at a time,
/// with spacer bytes between arguments and an end byte after the last.
fn send_args(engine: &mut Engine, vm: &mut Uxn, args: &[String], halted: &Cell<Option<i32>>) {
    for (i, arg) in args.iter().enumerate() {
        for &byte in arg.as_bytes() {
            if halted.get().is_some() {
                return;
            }
            send_console(engine, vm, INPUT_ARG, byte);
        }
        let last = i + 1 == args.len();
        if halted.get().is_some() {
            return;
        }
        if last {
            send_console(engine, vm, INPUT_ARG_END, b'\n');
        } else {
            send_console(engine, vm, INPUT_ARG_SPACER, b'\n');
        }
    }
}

fn run(args: &Args) -> anyhow::Result<i32> {
    let rom = std::fs::read(&args.rom)
        .with_context(|| format!("failed to read rom {}", args.rom.display()))?;

    let (devices, exit_code) = HostDevices::new();
    let mut vm = Uxn::with_device(Box::new(devices));
    vm.load_rom(&rom)?;

    let mut engine = make_engine(args)?;

    engine.execute(&mut vm, RESET_VECTOR);

    if exit_code.get().is_none() {
        send_args(&mut engine, &mut vm, &args.args, &exit_code);
    }

    // Pump stdin while the guest keeps its console vector armed.
    let mut stdin = std::io::stdin().lock();
    let mut byte = [0u8; 1];
    while exit_code.get().is_none() && vm.dev_read2(CONSOLE_VECTOR) != 0 {
        match stdin.read(&mut byte) {
            Ok(0) => {
                send_console(&mut engine, &mut vm, INPUT_ARG_END, 0);
                break;
            }
            Ok(_) => send_console(&mut engine, &mut vm, INPUT_STDIN, byte[0]),
            Err(e) => return Err(e.into()),
        }
    }

    #[cfg(feature = "jit")]
    if let Engine::Jit(jit) = &engine {
        let stats = jit.stats();
        eprintln!("Num blocks: {}", stats.num_blocks);
        eprintln!("Num bounces: {}", stats.num_bounces);
    }

    Ok(exit_code.get().unwrap_or(0))
}

#[cfg(feature = "jit")]
fn make_engine(args: &Args) -> anyhow::Result<Engine> {
    if args.no_jit {
        return Ok(Engine::Interp);
    }
    let hook: Option<Box<dyn uxn_engine::jit::JitHook>> = if args.perf_map {
        Some(Box::new(
            uxn_engine::jit::PerfMapHook::new().context("failed to create perf map")?,
        ))
    } else {
        None
    };
    Ok(Engine::Jit(uxn_engine::jit::Jit::with_hook(hook)?))
}

#[cfg(not(feature = "jit"))]
fn make_engine(_args: &Args) -> anyhow::Result<Engine> {
    Ok(Engine::Interp)
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args) {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
