//! Console and system devices
//!
//! The minimal Varvara subset a command-line host needs: console output on
//! ports 0x18/0x19, console input through the vector at 0x10, and the system
//! device's halt/exit-code port at 0x0f plus the stack-dump debug port at
//! 0x0e.

use std::cell::Cell;
use std::io::Write;
use std::rc::Rc;

use uxn_engine::vm::{Device, Uxn};

pub const CONSOLE_VECTOR: u8 = 0x10;
pub const CONSOLE_READ: u8 = 0x12;
pub const CONSOLE_TYPE: u8 = 0x17;

/// Console input type codes.
pub const INPUT_STDIN: u8 = 1;
pub const INPUT_ARG: u8 = 2;
pub const INPUT_ARG_SPACER: u8 = 3;
pub const INPUT_ARG_END: u8 = 4;

/// Exit code for a system state byte: writing a non-zero state halts the
/// guest with `(state & 0x7f) - 1`.
pub fn exit_code_for_state(state: u8) -> Option<i32> {
    if state == 0 {
        None
    } else {
        Some(((state & 0x7f) as i32) - 1)
    }
}

/// The host device bus. The exit cell is shared with the driver loop so it
/// can stop pumping input once the guest halts.
pub struct HostDevices {
    exit_code: Rc<Cell<Option<i32>>>,
}

impl HostDevices {
    pub fn new() -> (Self, Rc<Cell<Option<i32>>>) {
        let exit_code = Rc::new(Cell::new(None));
        (
            HostDevices {
                exit_code: exit_code.clone(),
            },
            exit_code,
        )
    }
}

impl Device for HostDevices {
    fn deo(&mut self, vm: &mut Uxn, addr: u8) {
        match addr {
            0x0e => {
                // System/debug: dump both stacks
                if vm.device[0x0e] != 0 {
                    let mut err = std::io::stderr().lock();
                    let _ = write!(err, "WST");
                    for i in 0..vm.wsp {
                        let _ = write!(err, " {:02x}", vm.ws[i as usize]);
                    }
                    let _ = writeln!(err);
                    let _ = write!(err, "RST");
                    for i in 0..vm.rsp {
                        let _ = write!(err, " {:02x}", vm.rs[i as usize]);
                    }
                    let _ = writeln!(err);
                }
            }
            0x0f => {
                // System/state: non-zero halts the guest
                if let Some(code) = exit_code_for_state(vm.device[0x0f]) {
                    self.exit_code.set(Some(code));
                }
            }
            0x18 => {
                let mut out = std::io::stdout().lock();
                let _ = out.write_all(&[vm.device[0x18]]);
                let _ = out.flush();
            }
            0x19 => {
                let mut err = std::io::stderr().lock();
                let _ = err.write_all(&[vm.device[0x19]]);
                let _ = err.flush();
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_mapping() {
        assert_eq!(exit_code_for_state(0), None);
        assert_eq!(exit_code_for_state(0x01), Some(0));
        assert_eq!(exit_code_for_state(0x02), Some(1));
        // The high bit is a soft flag, not part of the code
        assert_eq!(exit_code_for_state(0x81), Some(0));
    }
}
