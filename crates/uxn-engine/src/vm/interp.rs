//! Single-step reference interpreter
//!
//! Executes exactly one opcode per [`step`] call and returns the next program
//! counter (0 after `BRK`). The executor uses it for zero-page execution and
//! as the fallback when a block cannot be compiled; the test suite uses it as
//! the reference implementation the JIT must agree with.

use super::Uxn;

const OP_2: u8 = 0x20;
const OP_R: u8 = 0x40;

/// Execute the opcode at `pc` and return the next pc (0 = halted).
pub fn step(vm: &mut Uxn, pc: u16) -> u16 {
    let op = vm.memory[pc as usize];
    let pc = pc.wrapping_add(1);

    // Fixed encodings where the flag bits are not modifiers.
    match op {
        0x00 => return 0, // BRK
        0x20 => {
            // JCI
            let imm = read16(vm, pc);
            let after = pc.wrapping_add(2);
            let cond = pop8_raw(vm, false);
            return if cond != 0 { after.wrapping_add(imm) } else { after };
        }
        0x40 => {
            // JMI
            let imm = read16(vm, pc);
            return pc.wrapping_add(2).wrapping_add(imm);
        }
        0x60 => {
            // JSI
            let imm = read16(vm, pc);
            let after = pc.wrapping_add(2);
            push16_raw(vm, true, after);
            return after.wrapping_add(imm);
        }
        0x80 | 0xa0 | 0xc0 | 0xe0 => {
            // LIT variants; bit 5 selects width, bit 6 the stack
            let r = op & OP_R != 0;
            if op & OP_2 != 0 {
                let v = read16(vm, pc);
                push16_raw(vm, r, v);
                return pc.wrapping_add(2);
            }
            let v = vm.memory[pc as usize];
            push8_raw(vm, r, v);
            return pc.wrapping_add(1);
        }
        _ => {}
    }

    let mut st = Step::new(vm, pc, op);
    st.exec(op & 0x1f)
}

fn read16(vm: &Uxn, addr: u16) -> u16 {
    let hi = vm.memory[addr as usize];
    let lo = vm.memory[addr.wrapping_add(1) as usize];
    (hi as u16) << 8 | lo as u16
}

fn push8_raw(vm: &mut Uxn, r: bool, v: u8) {
    if r {
        vm.rs[vm.rsp as usize] = v;
        vm.rsp = vm.rsp.wrapping_add(1);
    } else {
        vm.ws[vm.wsp as usize] = v;
        vm.wsp = vm.wsp.wrapping_add(1);
    }
}

fn push16_raw(vm: &mut Uxn, r: bool, v: u16) {
    push8_raw(vm, r, (v >> 8) as u8);
    push8_raw(vm, r, v as u8);
}

fn pop8_raw(vm: &mut Uxn, r: bool) -> u8 {
    if r {
        vm.rsp = vm.rsp.wrapping_sub(1);
        vm.rs[vm.rsp as usize]
    } else {
        vm.wsp = vm.wsp.wrapping_sub(1);
        vm.ws[vm.wsp as usize]
    }
}

/// Per-opcode state for the modifier-flag opcodes. Keep mode pops through
/// shadow stack pointers so the real ones never move.
struct Step<'a> {
    vm: &'a mut Uxn,
    pc: u16,
    short: bool,
    r: bool,
    keep: bool,
    swsp: u8,
    srsp: u8,
}

impl<'a> Step<'a> {
    fn new(vm: &'a mut Uxn, pc: u16, op: u8) -> Self {
        let swsp = vm.wsp;
        let srsp = vm.rsp;
        Step {
            vm,
            pc,
            short: op & OP_2 != 0,
            r: op & OP_R != 0,
            keep: op & 0x80 != 0,
            swsp,
            srsp,
        }
    }

    fn width_mask(&self) -> u16 {
        if self.short {
            0xffff
        } else {
            0x00ff
        }
    }

    fn pop8_from(&mut self, r: bool) -> u8 {
        let sp = {
            let p = if r {
                if self.keep { &mut self.srsp } else { &mut self.vm.rsp }
            } else if self.keep {
                &mut self.swsp
            } else {
                &mut self.vm.wsp
            };
            *p = p.wrapping_sub(1);
            *p
        };
        if r {
            self.vm.rs[sp as usize]
        } else {
            self.vm.ws[sp as usize]
        }
    }

    fn pop16_from(&mut self, r: bool) -> u16 {
        let lo = self.pop8_from(r);
        let hi = self.pop8_from(r);
        (hi as u16) << 8 | lo as u16
    }

    fn pop(&mut self) -> u16 {
        if self.short {
            self.pop16_from(self.r)
        } else {
            self.pop8_from(self.r) as u16
        }
    }

    fn push_to(&mut self, r: bool, v: u16) {
        if self.short {
            push16_raw(self.vm, r, v);
        } else {
            push8_raw(self.vm, r, v as u8);
        }
    }

    fn push(&mut self, v: u16) {
        self.push_to(self.r, v);
    }

    fn load(&mut self, addr: u16, addr_is_short: bool) -> u16 {
        let wrap = if addr_is_short { 0xffff } else { 0x00ff };
        let b0 = self.vm.memory[addr as usize];
        if self.short {
            let b1 = self.vm.memory[(addr.wrapping_add(1) & wrap) as usize];
            (b0 as u16) << 8 | b1 as u16
        } else {
            b0 as u16
        }
    }

    fn store(&mut self, addr: u16, addr_is_short: bool, v: u16) {
        let wrap = if addr_is_short { 0xffff } else { 0x00ff };
        if self.short {
            self.vm.memory[addr as usize] = (v >> 8) as u8;
            self.vm.memory[(addr.wrapping_add(1) & wrap) as usize] = v as u8;
        } else {
            self.vm.memory[addr as usize] = v as u8;
        }
    }

    /// Jump operand: a short is an absolute address, a byte a signed offset
    /// relative to the next instruction.
    fn jump_target(&self, v: u16) -> u16 {
        if self.short {
            v
        } else {
            self.pc.wrapping_add((v as u8 as i8) as u16)
        }
    }

    fn exec(&mut self, base: u8) -> u16 {
        match base {
            0x01 => {
                // INC
                let v = self.pop();
                self.push(v.wrapping_add(1) & self.width_mask());
            }
            0x02 => {
                // POP
                let _ = self.pop();
            }
            0x03 => {
                // NIP
                let b = self.pop();
                let _ = self.pop();
                self.push(b);
            }
            0x04 => {
                // SWP
                let b = self.pop();
                let a = self.pop();
                self.push(b);
                self.push(a);
            }
            0x05 => {
                // ROT
                let c = self.pop();
                let b = self.pop();
                let a = self.pop();
                self.push(b);
                self.push(c);
                self.push(a);
            }
            0x06 => {
                // DUP
                let a = self.pop();
                self.push(a);
                self.push(a);
            }
            0x07 => {
                // OVR
                let b = self.pop();
                let a = self.pop();
                self.push(a);
                self.push(b);
                self.push(a);
            }
            0x08 => self.compare(|a, b| a == b),
            0x09 => self.compare(|a, b| a != b),
            0x0a => self.compare(|a, b| a > b),
            0x0b => self.compare(|a, b| a < b),
            0x0c => {
                // JMP
                let t = self.pop();
                return self.jump_target(t);
            }
            0x0d => {
                // JCN
                let t = self.pop();
                let cond = self.pop8_from(self.r);
                if cond != 0 {
                    return self.jump_target(t);
                }
            }
            0x0e => {
                // JSR
                let t = self.pop();
                let ret = self.pc;
                push16_raw(self.vm, !self.r, ret);
                return self.jump_target(t);
            }
            0x0f => {
                // STH
                let a = self.pop();
                self.push_to(!self.r, a);
            }
            0x10 => {
                // LDZ
                let addr = self.pop8_from(self.r) as u16;
                let v = self.load(addr, false);
                self.push(v);
            }
            0x11 => {
                // STZ
                let addr = self.pop8_from(self.r) as u16;
                let v = self.pop();
                self.store(addr, false, v);
            }
            0x12 => {
                // LDR
                let off = self.pop8_from(self.r);
                let addr = self.pc.wrapping_add((off as i8) as u16);
                let v = self.load(addr, true);
                self.push(v);
            }
            0x13 => {
                // STR
                let off = self.pop8_from(self.r);
                let v = self.pop();
                let addr = self.pc.wrapping_add((off as i8) as u16);
                self.store(addr, true, v);
            }
            0x14 => {
                // LDA
                let addr = self.pop16_from(self.r);
                let v = self.load(addr, true);
                self.push(v);
            }
            0x15 => {
                // STA
                let addr = self.pop16_from(self.r);
                let v = self.pop();
                self.store(addr, true, v);
            }
            0x16 => {
                // DEI
                let addr = self.pop8_from(self.r);
                if self.short {
                    let hi = self.vm.dei(addr);
                    let lo = self.vm.dei(addr.wrapping_add(1));
                    self.push((hi as u16) << 8 | lo as u16);
                } else {
                    let v = self.vm.dei(addr);
                    self.push(v as u16);
                }
            }
            0x17 => {
                // DEO: device bytes are written before the bus callbacks run
                let addr = self.pop8_from(self.r);
                let v = self.pop();
                if self.short {
                    self.vm.device[addr as usize] = (v >> 8) as u8;
                    self.vm.device[addr.wrapping_add(1) as usize] = v as u8;
                    self.vm.deo(addr);
                    self.vm.deo(addr.wrapping_add(1));
                } else {
                    self.vm.device[addr as usize] = v as u8;
                    self.vm.deo(addr);
                }
            }
            0x18 => self.binary(u16::wrapping_add),
            0x19 => self.binary(u16::wrapping_sub),
            0x1a => self.binary(u16::wrapping_mul),
            0x1b => self.binary(|a, b| if b == 0 { 0 } else { a / b }),
            0x1c => self.binary(|a, b| a & b),
            0x1d => self.binary(|a, b| a | b),
            0x1e => self.binary(|a, b| a ^ b),
            0x1f => {
                // SFT
                let shift = self.pop8_from(self.r);
                let a = self.pop();
                let v = ((a as u32) >> (shift & 0x0f)) << (shift >> 4);
                self.push(v as u16 & self.width_mask());
            }
            _ => unreachable!("fixed encodings handled before dispatch"),
        }
        self.pc
    }

    fn binary(&mut self, f: fn(u16, u16) -> u16) {
        let b = self.pop();
        let a = self.pop();
        self.push(f(a, b) & self.width_mask());
    }

    /// Comparisons push a single byte flag regardless of operand width.
    fn compare(&mut self, f: fn(u16, u16) -> bool) {
        let b = self.pop();
        let a = self.pop();
        push8_raw(self.vm, self.r, f(a, b) as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::RESET_VECTOR;

    fn run(vm: &mut Uxn) {
        let mut pc = RESET_VECTOR;
        while pc != 0 {
            pc = step(vm, pc);
        }
    }

    #[test]
    fn add() {
        let mut vm = Uxn::new();
        vm.memory[0x0100] = 0x18;
        vm.ws[0] = 1;
        vm.ws[1] = 2;
        vm.wsp = 2;
        run(&mut vm);
        assert_eq!(vm.wsp, 1);
        assert_eq!(vm.ws[0], 3);
    }

    #[test]
    fn add_keep() {
        let mut vm = Uxn::new();
        vm.memory[0x0100] = 0x98;
        vm.ws[0] = 1;
        vm.ws[1] = 2;
        vm.wsp = 2;
        run(&mut vm);
        assert_eq!(vm.wsp, 3);
        assert_eq!(&vm.ws[..3], &[1, 2, 3]);
    }

    #[test]
    fn pop_wraps_empty_stack() {
        let mut vm = Uxn::new();
        vm.memory[0x0100] = 0x02;
        run(&mut vm);
        assert_eq!(vm.wsp, 0xff);
    }

    #[test]
    fn div_by_zero_is_zero() {
        let mut vm = Uxn::new();
        vm.memory[0x0100] = 0x1b;
        vm.ws[0] = 6;
        vm.wsp = 2;
        run(&mut vm);
        assert_eq!(vm.wsp, 1);
        assert_eq!(vm.ws[0], 0);
    }

    #[test]
    fn sft() {
        let mut vm = Uxn::new();
        vm.memory[0x0100] = 0x1f;
        vm.ws[0] = 0x34;
        vm.ws[1] = 0x33;
        vm.wsp = 2;
        run(&mut vm);
        assert_eq!(vm.wsp, 1);
        assert_eq!(vm.ws[0], 0x30);
    }

    #[test]
    fn jsi_routine() {
        // #07 #04 modulo BRK  @modulo DIVk MUL SUB JMP2r
        let mut vm = Uxn::new();
        let rom = [
            0x80, 0x07, 0x80, 0x04, 0x60, 0x00, 0x01, 0x00, 0x9b, 0x1a, 0x19, 0x6c,
        ];
        vm.load_rom(&rom).unwrap();
        run(&mut vm);
        assert_eq!(vm.wsp, 1);
        assert_eq!(vm.ws[0], 3);
        assert_eq!(vm.rsp, 0);
    }
}
