//! Per-block compiler
//!
//! Compiles one Uxn basic block, opcode by opcode, into a pair of Cranelift
//! functions (host-callable head, tail-convention body). The compiler keeps
//! two compile-time models next to the emitted code:
//!
//! - *Abstract stacks*: 256 entries of `{semantics, const_value}` per guest
//!   stack, used only for constant and boolean inference. The concrete bytes
//!   live on the guest stacks at run time.
//! - *Cached top-of-stack*: the most recent push per stack is deferred in a
//!   register and only materialized when something can observe the guest
//!   stack (a jump, a device call, a keep-mode opcode) or when a differently
//!   shaped value lands on top.
//!
//! Every value that can be statically known is still materialized in a
//! register: constants are assumptions about ROM bytes, and jump sites
//! re-check them at run time before taking a direct link.

use std::rc::Rc;

use cranelift_codegen::ir::{self, condcodes::IntCC, types, InstBuilder, MemFlags, Value};
use cranelift_codegen::ir::UserFuncName;
use cranelift_frontend::{FunctionBuilder, Variable};
use cranelift_module::{Linkage, Module};

use crate::vm::{Uxn, RESET_VECTOR};

use super::backend::{CodegenError, CompilerHandle};
use super::block_map::{Block, HeadFn, LinkSlot};
use super::engine::{Jit, LinkEntry, LinkKind};
use super::hook::{AddrMark, BlockInfo};

const OP_K: u8 = 0x80;
const OP_R: u8 = 0x40;
const OP_2: u8 = 0x20;

const SEM_CONST: u8 = 1 << 0;
const SEM_BOOLEAN: u8 = 1 << 1;

const NUM_OPERAND_REGS: usize = 6;

const WSP_OFF: i32 = core::mem::offset_of!(Uxn, wsp) as i32;
const RSP_OFF: i32 = core::mem::offset_of!(Uxn, rsp) as i32;
const WS_OFF: i64 = core::mem::offset_of!(Uxn, ws) as i64;
const RS_OFF: i64 = core::mem::offset_of!(Uxn, rs) as i64;
const MEM_OFF: i64 = core::mem::offset_of!(Uxn, memory) as i64;
const DEV_OFF: i64 = core::mem::offset_of!(Uxn, device) as i64;

/// Compile-time model of one guest stack cell.
#[derive(Debug, Clone, Copy, Default)]
struct AbstractValue {
    semantics: u8,
    const_value: u8,
}

/// Handle into the operand register bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Reg(u8);

fn reg_mask(reg: Reg) -> u8 {
    debug_assert!((reg.0 as usize) < NUM_OPERAND_REGS, "invalid register");
    1 << reg.0
}

/// A live expression during block compilation.
#[derive(Debug, Clone, Copy)]
struct Operand {
    is_short: bool,
    semantics: u8,
    const_value: u16,
    reg: Reg,
}

pub(crate) fn compile_block(
    jit: &mut Jit,
    vm: &mut Uxn,
    block: Rc<Block>,
    entry_pc: u16,
    handle: &mut CompilerHandle,
) -> Result<(), CodegenError> {
    let mut module = jit.backend.new_module();
    let head_sig = jit.backend.head_signature();
    let body_sig = jit.backend.body_signature();

    let head_id = module.declare_function(&format!("uxn_{entry_pc:04x}"), Linkage::Export, &head_sig)?;
    let body_id =
        module.declare_function(&format!("uxn_{entry_pc:04x}_body"), Linkage::Local, &body_sig)?;

    // Body: the block itself, in the fast convention.
    handle.ctx.clear();
    handle.ctx.func.signature = body_sig;
    handle.ctx.func.name = UserFuncName::user(0, entry_pc as u32);
    {
        let builder = FunctionBuilder::new(&mut handle.ctx.func, &mut handle.fctx);
        let compiler = BlockCompiler::new(jit, vm, &block, entry_pc, builder);
        compiler.run();
    }
    module.define_function(body_id, &mut handle.ctx)?;

    let mut body_size = 0;
    let mut marks: Vec<AddrMark> = Vec::new();
    if let Some(code) = handle.ctx.compiled_code() {
        body_size = code.code_buffer().len();
        for loc in code.buffer.get_srclocs_sorted() {
            if loc.loc.is_default() {
                continue;
            }
            let pc = loc.loc.bits() as u16;
            if marks.last().map(|m| m.pc) != Some(pc) {
                marks.push(AddrMark {
                    pc,
                    addr: loc.start as usize,
                });
            }
        }
    }

    // Head: load the stack pointers, enter the body, hand the next pc back
    // to the trampoline. State save happens at the body's exits.
    handle.ctx.clear();
    handle.ctx.func.signature = head_sig;
    handle.ctx.func.name = UserFuncName::user(1, entry_pc as u32);
    {
        let mut builder = FunctionBuilder::new(&mut handle.ctx.func, &mut handle.fctx);
        let entry = builder.create_block();
        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);
        builder.seal_block(entry);
        let vm_ptr = builder.block_params(entry)[0];
        let wsp = builder.ins().uload8(types::I32, MemFlags::trusted(), vm_ptr, WSP_OFF);
        let rsp = builder.ins().uload8(types::I32, MemFlags::trusted(), vm_ptr, RSP_OFF);
        let body_ref = module.declare_func_in_func(body_id, &mut builder.func);
        let call = builder.ins().call(body_ref, &[vm_ptr, wsp, rsp]);
        let next_pc = builder.inst_results(call)[0];
        builder.ins().return_(&[next_pc]);
        builder.finalize();
    }
    module.define_function(head_id, &mut handle.ctx)?;
    let head_size = handle
        .ctx
        .compiled_code()
        .map(|code| code.code_buffer().len())
        .unwrap_or(0);

    module.finalize_definitions()?;
    let head_ptr = module.get_finalized_function(head_id);
    let body_ptr = module.get_finalized_function(body_id);

    for mark in &mut marks {
        mark.addr += body_ptr as usize;
    }

    // Safety: head_ptr is the finalized code of a function emitted with
    // exactly the HeadFn signature; the module is kept alive in the block.
    let fn_ptr: HeadFn = unsafe { std::mem::transmute(head_ptr) };
    block.publish(fn_ptr, head_ptr as usize, body_ptr as usize, module);
    jit.stats.code_size += head_size + body_size;

    if let Some(hook) = jit.hook.as_deref_mut() {
        hook.end_block(&BlockInfo {
            entry: entry_pc,
            native_start: body_ptr as usize,
            native_size: body_size,
            marks: &marks,
        });
    }

    Ok(())
}

struct BlockCompiler<'j, 'b> {
    jit: &'j mut Jit,
    vm: &'j mut Uxn,
    block: &'j Rc<Block>,
    builder: FunctionBuilder<'b>,

    pc: u16,
    opcode: u8,
    done: bool,
    inlining: bool,

    vm_ptr: Value,
    ws_base: Value,
    rs_base: Value,
    mem_base: Value,
    dev_base: Value,

    // Saved stack-pointer registers; live across direct links.
    wsp_var: Variable,
    rsp_var: Variable,
    // Stack pointers pops go through: the saved ones, or keep-mode scratch.
    wsp_pop_var: Variable,
    rsp_pop_var: Variable,

    regs: [Variable; NUM_OPERAND_REGS],
    used_registers: u8,

    wst: [AbstractValue; 256],
    rst: [AbstractValue; 256],
    wsp: u8,
    rsp: u8,
    shadow_wsp: u8,
    shadow_rsp: u8,
    keep: bool,

    wst_top: Option<Operand>,
    rst_top: Option<Operand>,

    head_sigref: ir::SigRef,
    body_sigref: ir::SigRef,
    dei_sigref: ir::SigRef,
    deo_sigref: ir::SigRef,
}

impl<'j, 'b> BlockCompiler<'j, 'b> {
    fn new(
        jit: &'j mut Jit,
        vm: &'j mut Uxn,
        block: &'j Rc<Block>,
        entry_pc: u16,
        mut builder: FunctionBuilder<'b>,
    ) -> Self {
        let head_sig = jit.backend.head_signature();
        let body_sig = jit.backend.body_signature();
        let dei_sig = jit.backend.helper_signature(true);
        let deo_sig = jit.backend.helper_signature(false);

        let head_sigref = builder.import_signature(head_sig);
        let body_sigref = builder.import_signature(body_sig);
        let dei_sigref = builder.import_signature(dei_sig);
        let deo_sigref = builder.import_signature(deo_sig);

        let entry = builder.create_block();
        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);
        builder.seal_block(entry);

        let vm_ptr = builder.block_params(entry)[0];
        let wsp_param = builder.block_params(entry)[1];
        let rsp_param = builder.block_params(entry)[2];

        let wsp_var = builder.declare_var(types::I32);
        let rsp_var = builder.declare_var(types::I32);
        builder.def_var(wsp_var, wsp_param);
        builder.def_var(rsp_var, rsp_param);

        let regs = std::array::from_fn(|_| builder.declare_var(types::I32));
        let zero = builder.ins().iconst(types::I32, 0);
        for reg in regs {
            builder.def_var(reg, zero);
        }

        // Region bases are entry-block values: they dominate every use and
        // survive call-outs.
        let ws_base = builder.ins().iadd_imm(vm_ptr, WS_OFF);
        let rs_base = builder.ins().iadd_imm(vm_ptr, RS_OFF);
        let mem_base = builder.ins().iadd_imm(vm_ptr, MEM_OFF);
        let dev_base = builder.ins().iadd_imm(vm_ptr, DEV_OFF);

        BlockCompiler {
            jit,
            vm,
            block,
            builder,
            pc: entry_pc,
            opcode: 0,
            done: false,
            inlining: false,
            vm_ptr,
            ws_base,
            rs_base,
            mem_base,
            dev_base,
            wsp_var,
            rsp_var,
            wsp_pop_var: wsp_var,
            rsp_pop_var: rsp_var,
            regs,
            used_registers: 0,
            wst: [AbstractValue::default(); 256],
            rst: [AbstractValue::default(); 256],
            wsp: 0,
            rsp: 0,
            shadow_wsp: 0,
            shadow_rsp: 0,
            keep: false,
            wst_top: None,
            rst_top: None,
            head_sigref,
            body_sigref,
            dei_sigref,
            deo_sigref,
        }
    }

    fn run(mut self) {
        while !self.done {
            self.next_opcode();
        }
        self.builder.finalize();
    }

    // ===== Flags =====

    fn flag_2(&self) -> bool {
        self.opcode & OP_2 != 0
    }

    fn flag_r(&self) -> bool {
        self.opcode & OP_R != 0
    }

    fn flag_k(&self) -> bool {
        // The k bit is not a modifier on JCI/JMI/JSI and the LIT family.
        self.opcode & OP_K != 0
            && !matches!(self.opcode, 0x20 | 0x40 | 0x60 | 0x80 | 0xa0 | 0xc0 | 0xe0)
    }

    // ===== Register bank =====

    fn alloc_reg(&mut self) -> Reg {
        for i in 0..NUM_OPERAND_REGS as u8 {
            let mask = 1 << i;
            if self.used_registers & mask == 0 {
                self.used_registers |= mask;
                return Reg(i);
            }
        }
        panic!("operand register bank exhausted");
    }

    fn free_reg(&mut self, reg: Reg) {
        let mask = reg_mask(reg);
        debug_assert!(self.used_registers & mask != 0, "freeing unused register");
        self.used_registers &= !mask;
    }

    fn reg_val(&mut self, reg: Reg) -> Value {
        self.builder.use_var(self.regs[reg.0 as usize])
    }

    fn set_reg(&mut self, reg: Reg, value: Value) {
        self.builder.def_var(self.regs[reg.0 as usize], value);
    }

    // ===== Small emission helpers =====

    fn iconst(&mut self, v: i64) -> Value {
        self.builder.ins().iconst(types::I32, v)
    }

    fn mask_to_width(&mut self, v: Value, is_short: bool) -> Value {
        self.builder.ins().band_imm(v, if is_short { 0xffff } else { 0xff })
    }

    fn wrap_sp(&mut self, sp: Value, delta: i64) -> Value {
        let sp = self.builder.ins().iadd_imm(sp, delta);
        self.builder.ins().band_imm(sp, 0xff)
    }

    fn byte_addr(&mut self, base: Value, offset: Value) -> Value {
        let offset = self.builder.ins().uextend(types::I64, offset);
        self.builder.ins().iadd(base, offset)
    }

    fn load_byte(&mut self, base: Value, offset: Value) -> Value {
        let addr = self.byte_addr(base, offset);
        self.builder.ins().uload8(types::I32, MemFlags::trusted(), addr, 0)
    }

    fn store_byte(&mut self, base: Value, offset: Value, v: Value) {
        let addr = self.byte_addr(base, offset);
        self.builder.ins().istore8(MemFlags::trusted(), v, addr, 0);
    }

    fn stack_base(&self, flag_r: bool) -> Value {
        if flag_r {
            self.rs_base
        } else {
            self.ws_base
        }
    }

    fn saved_sp_var(&self, flag_r: bool) -> Variable {
        if flag_r {
            self.rsp_var
        } else {
            self.wsp_var
        }
    }

    fn pop_sp_var(&self, flag_r: bool) -> Variable {
        if flag_r {
            self.rsp_pop_var
        } else {
            self.wsp_pop_var
        }
    }

    fn emit_save_state(&mut self) {
        let wsp = self.builder.use_var(self.wsp_var);
        self.builder.ins().istore8(MemFlags::trusted(), wsp, self.vm_ptr, WSP_OFF);
        let rsp = self.builder.use_var(self.rsp_var);
        self.builder.ins().istore8(MemFlags::trusted(), rsp, self.vm_ptr, RSP_OFF);
    }

    fn emit_load_state(&mut self) {
        let wsp = self.builder.ins().uload8(types::I32, MemFlags::trusted(), self.vm_ptr, WSP_OFF);
        self.builder.def_var(self.wsp_var, wsp);
        let rsp = self.builder.ins().uload8(types::I32, MemFlags::trusted(), self.vm_ptr, RSP_OFF);
        self.builder.def_var(self.rsp_var, rsp);
    }

    /// Leave the block: persist the stack pointers and hand `next_pc` to
    /// whoever entered it.
    fn emit_exit(&mut self, next_pc: Value) {
        self.emit_save_state();
        self.builder.ins().return_(&[next_pc]);
    }

    /// Create a block, branch into it and make it current.
    fn begin_block(&mut self, block: ir::Block) {
        self.builder.switch_to_block(block);
        self.builder.seal_block(block);
    }

    // ===== Abstract stacks =====

    fn abs_pop(&mut self, flag_r: bool) -> AbstractValue {
        let sp = {
            let p = if flag_r {
                if self.keep { &mut self.shadow_rsp } else { &mut self.rsp }
            } else if self.keep {
                &mut self.shadow_wsp
            } else {
                &mut self.wsp
            };
            *p = p.wrapping_sub(1);
            *p
        };
        if flag_r {
            self.rst[sp as usize]
        } else {
            self.wst[sp as usize]
        }
    }

    /// Pushes always move the real emulated stack pointer, even in keep mode.
    fn abs_push(&mut self, flag_r: bool, value: AbstractValue) {
        let sp = if flag_r {
            let sp = self.rsp;
            self.rsp = self.rsp.wrapping_add(1);
            sp
        } else {
            let sp = self.wsp;
            self.wsp = self.wsp.wrapping_add(1);
            sp
        };
        if flag_r {
            self.rst[sp as usize] = value;
        } else {
            self.wst[sp as usize] = value;
        }
    }

    // ===== Concrete stack traffic =====

    /// Materialize a deferred push as byte stores plus a stack-pointer bump.
    fn emit_push(&mut self, operand: Operand, flag_r: bool) {
        let base = self.stack_base(flag_r);
        let sp_var = self.saved_sp_var(flag_r);
        let value = self.reg_val(operand.reg);
        let mut sp = self.builder.use_var(sp_var);
        if operand.is_short {
            let hi = self.builder.ins().ushr_imm(value, 8);
            self.store_byte(base, sp, hi);
            sp = self.wrap_sp(sp, 1);
            self.store_byte(base, sp, value);
            sp = self.wrap_sp(sp, 1);
        } else {
            self.store_byte(base, sp, value);
            sp = self.wrap_sp(sp, 1);
        }
        self.builder.def_var(sp_var, sp);
    }

    fn flush_stack(&mut self, flag_r: bool) {
        let top = if flag_r {
            self.rst_top.take()
        } else {
            self.wst_top.take()
        };
        if let Some(operand) = top {
            self.emit_push(operand, flag_r);
        }
    }

    fn flush_stacks(&mut self) {
        self.flush_stack(false);
        self.flush_stack(true);
    }

    /// Defer a push: the previous deferred push (if any) is materialized and
    /// the operand becomes the new cached top of stack.
    fn push_ex(&mut self, operand: Operand, flag_r: bool) {
        debug_assert!(
            self.used_registers & reg_mask(operand.reg) != 0,
            "pushing operand with unused register"
        );

        let occupied = if flag_r {
            self.rst_top.is_some()
        } else {
            self.wst_top.is_some()
        };
        if occupied {
            self.flush_stack(flag_r);
        }
        if flag_r {
            self.rst_top = Some(operand);
        } else {
            self.wst_top = Some(operand);
        }

        if operand.is_short {
            self.abs_push(
                flag_r,
                AbstractValue {
                    semantics: operand.semantics,
                    const_value: (operand.const_value >> 8) as u8,
                },
            );
            self.abs_push(
                flag_r,
                AbstractValue {
                    semantics: operand.semantics,
                    const_value: operand.const_value as u8,
                },
            );
        } else {
            self.abs_push(
                flag_r,
                AbstractValue {
                    semantics: operand.semantics,
                    const_value: operand.const_value as u8,
                },
            );
        }
    }

    fn push(&mut self, operand: Operand) {
        self.push_ex(operand, self.flag_r());
    }

    fn pop_ex(&mut self, is_short: bool, flag_r: bool) -> Operand {
        let mut operand = Operand {
            is_short,
            semantics: 0,
            const_value: 0,
            reg: Reg(0),
        };

        if is_short {
            let lo = self.abs_pop(flag_r);
            let hi = self.abs_pop(flag_r);
            if hi.semantics & SEM_CONST != 0 && lo.semantics & SEM_CONST != 0 {
                operand.semantics = SEM_CONST;
                operand.const_value = (hi.const_value as u16) << 8 | lo.const_value as u16;
            }
        } else {
            let value = self.abs_pop(flag_r);
            operand.semantics = value.semantics;
            operand.const_value = value.const_value as u16;
        }

        let cached = if flag_r { self.rst_top } else { self.wst_top };
        if let Some(c) = cached {
            debug_assert!(
                self.used_registers & reg_mask(c.reg) != 0,
                "cached operand's register is not reserved"
            );
        }

        match cached {
            // The value on top is a deferred push of the right shape: hand it
            // back without any stack traffic.
            Some(c) if c.is_short == is_short => {
                operand = c;
                if flag_r {
                    self.rst_top = None;
                } else {
                    self.wst_top = None;
                }
            }
            _ => {
                self.flush_stack(flag_r);
                operand.reg = self.alloc_reg();
                let base = self.stack_base(flag_r);
                let sp_var = self.pop_sp_var(flag_r);
                let mut sp = self.builder.use_var(sp_var);
                sp = self.wrap_sp(sp, -1);
                let b0 = self.load_byte(base, sp);
                if is_short {
                    sp = self.wrap_sp(sp, -1);
                    let b1 = self.load_byte(base, sp);
                    let hi = self.builder.ins().ishl_imm(b1, 8);
                    let v = self.builder.ins().bor(hi, b0);
                    self.set_reg(operand.reg, v);
                } else {
                    self.set_reg(operand.reg, b0);
                }
                self.builder.def_var(sp_var, sp);
            }
        }

        operand
    }

    fn pop(&mut self) -> Operand {
        self.pop_ex(self.flag_2(), self.flag_r())
    }

    // ===== Memory access =====

    fn emit_load(&mut self, addr: Operand) -> Operand {
        let result = Operand {
            is_short: self.flag_2(),
            semantics: 0,
            const_value: 0,
            reg: self.alloc_reg(),
        };
        let addr_val = self.reg_val(addr.reg);
        let off0 = self.builder.ins().band_imm(addr_val, 0xffff);
        let b0 = self.load_byte(self.mem_base, off0);
        if result.is_short {
            let hi = self.builder.ins().ishl_imm(b0, 8);
            let off1 = self.builder.ins().iadd_imm(off0, 1);
            let off1 = self
                .builder
                .ins()
                .band_imm(off1, if addr.is_short { 0xffff } else { 0x00ff });
            let lo = self.load_byte(self.mem_base, off1);
            let v = self.builder.ins().bor(hi, lo);
            self.set_reg(result.reg, v);
        } else {
            self.set_reg(result.reg, b0);
        }
        self.free_reg(addr.reg);
        result
    }

    fn emit_store(&mut self, addr: Operand, value: Operand) {
        let addr_val = self.reg_val(addr.reg);
        let value_val = self.reg_val(value.reg);
        let off0 = self.builder.ins().band_imm(addr_val, 0xffff);
        if value.is_short {
            let hi = self.builder.ins().ushr_imm(value_val, 8);
            self.store_byte(self.mem_base, off0, hi);
            let off1 = self.builder.ins().iadd_imm(off0, 1);
            let off1 = self
                .builder
                .ins()
                .band_imm(off1, if addr.is_short { 0xffff } else { 0x00ff });
            self.store_byte(self.mem_base, off1, value_val);
        } else {
            self.store_byte(self.mem_base, off0, value_val);
        }
        self.free_reg(addr.reg);
        self.free_reg(value.reg);
    }

    // ===== Immediates =====

    /// Read ROM bytes at the cursor: constant-fold from the current memory
    /// image, but still emit the runtime fetch so self-modified ROM is
    /// observed.
    fn immediate(&mut self, is_short: bool) -> Operand {
        let reg = self.alloc_reg();
        let mut imm = Operand {
            // Assume constant even though it can be overwritten; jump
            // opcodes re-check the assumption.
            semantics: SEM_CONST,
            is_short,
            const_value: 0,
            reg,
        };

        if is_short {
            let hi = self.vm.memory[self.pc as usize];
            let lo = self.vm.memory[self.pc.wrapping_add(1) as usize];
            imm.const_value = (hi as u16) << 8 | lo as u16;

            let b0 = self
                .builder
                .ins()
                .uload8(types::I32, MemFlags::trusted(), self.mem_base, self.pc as i32);
            let b0 = self.builder.ins().ishl_imm(b0, 8);
            let b1 = self.builder.ins().uload8(
                types::I32,
                MemFlags::trusted(),
                self.mem_base,
                self.pc.wrapping_add(1) as i32,
            );
            let v = self.builder.ins().bor(b0, b1);
            self.set_reg(reg, v);
            self.pc = self.pc.wrapping_add(2);
        } else {
            imm.const_value = self.vm.memory[self.pc as usize] as u16;
            let b = self
                .builder
                .ins()
                .uload8(types::I32, MemFlags::trusted(), self.mem_base, self.pc as i32);
            self.set_reg(reg, b);
            self.pc = self.pc.wrapping_add(1);
        }

        imm
    }

    /// Immediate jump target: two ROM bytes, relative to the pc after them.
    fn immediate_jump_target(&mut self) -> Operand {
        let mut target = self.immediate(true);
        target.const_value = target.const_value.wrapping_add(self.pc);
        let v = self.reg_val(target.reg);
        let v = self.builder.ins().iadd_imm(v, self.pc as i64);
        let v = self.builder.ins().band_imm(v, 0xffff);
        self.set_reg(target.reg, v);
        target
    }

    // ===== Control transfer =====

    /// Returns true when the current block continues after the transfer
    /// (a linked call whose expected-return path falls through).
    fn emit_jump(&mut self, mut target: Operand, return_addr: u16) -> bool {
        self.flush_stacks();

        if !target.is_short {
            // Signed byte offset relative to the next instruction.
            let v = self.reg_val(target.reg);
            let v = self.builder.ins().ireduce(types::I8, v);
            let v = self.builder.ins().sextend(types::I32, v);
            let v = self.builder.ins().iadd_imm(v, self.pc as i64);
            let v = self.builder.ins().band_imm(v, 0xffff);
            self.set_reg(target.reg, v);
            target.const_value = self
                .pc
                .wrapping_add((target.const_value as u8 as i8) as u16);
            target.is_short = true;
        }

        let continues = self.emit_jump_abs(target, return_addr);
        self.free_reg(target.reg);
        continues
    }

    fn emit_jump_abs(&mut self, target: Operand, return_addr: u16) -> bool {
        let target_val = self.reg_val(target.reg);

        // Zero-page targets are interpreter territory: never link them.
        let linkable = target.semantics & SEM_CONST != 0 && target.const_value >= RESET_VECTOR;
        if !linkable {
            // Always correct but slow: bounce through the trampoline.
            self.emit_exit(target_val);
            return false;
        }

        let slot = Rc::new(LinkSlot::new());
        self.block.add_slot(slot.clone());
        let target_block = self.jit.queue_block(target.const_value);
        let kind = if return_addr == 0 { LinkKind::ToBody } else { LinkKind::ToHead };
        self.jit.link_queue.push(LinkEntry {
            slot: slot.clone(),
            block: target_block,
            kind,
        });

        // Re-check the assumed constant before taking the direct link; the
        // ROM byte may have been rewritten since compilation.
        let guard_ok = self.builder.create_block();
        let bounce = self.builder.create_block();
        let guard = self
            .builder
            .ins()
            .icmp_imm(IntCC::Equal, target_val, target.const_value as i64);
        self.builder.ins().brif(guard, guard_ok, &[], bounce, &[]);

        self.begin_block(guard_ok);
        if return_addr == 0 {
            // Tail jump into the target's body, stack pointers in registers.
            let slot_addr = self.builder.ins().iconst(types::I64, slot.addr() as i64);
            let fn_addr = self.builder.ins().load(types::I64, MemFlags::trusted(), slot_addr, 0);
            let linked = self.builder.create_block();
            let unlinked = self.builder.create_block();
            self.builder.ins().brif(fn_addr, linked, &[], unlinked, &[]);

            self.begin_block(linked);
            let wsp = self.builder.use_var(self.wsp_var);
            let rsp = self.builder.use_var(self.rsp_var);
            self.builder
                .ins()
                .return_call_indirect(self.body_sigref, fn_addr, &[self.vm_ptr, wsp, rsp]);

            self.begin_block(unlinked);
            let t = self.iconst(target.const_value as i64);
            self.emit_exit(t);
        } else {
            // Call through the target's host entry; the callee persists the
            // stack pointers, so save before and reload after.
            self.emit_save_state();
            let slot_addr = self.builder.ins().iconst(types::I64, slot.addr() as i64);
            let fn_addr = self.builder.ins().load(types::I64, MemFlags::trusted(), slot_addr, 0);
            let linked = self.builder.create_block();
            let unlinked = self.builder.create_block();
            self.builder.ins().brif(fn_addr, linked, &[], unlinked, &[]);

            self.begin_block(unlinked);
            let t = self.iconst(target.const_value as i64);
            self.emit_exit(t);

            self.begin_block(linked);
            let call = self
                .builder
                .ins()
                .call_indirect(self.head_sigref, fn_addr, &[self.vm_ptr]);
            let returned_pc = self.builder.inst_results(call)[0];
            self.emit_load_state();

            // If the routine returned to an unexpected pc, bounce out
            // instead of silently continuing.
            let cont = self.builder.create_block();
            let unexpected = self.builder.create_block();
            let ok = self
                .builder
                .ins()
                .icmp_imm(IntCC::Equal, returned_pc, return_addr as i64);
            self.builder.ins().brif(ok, cont, &[], unexpected, &[]);

            self.begin_block(unexpected);
            self.emit_exit(returned_pc);

            self.begin_block(bounce);
            self.emit_exit(target_val);

            self.begin_block(cont);
            return true;
        }

        self.begin_block(bounce);
        self.emit_exit(target_val);
        false
    }

    fn emit_conditional_jump(&mut self, condition: Operand, target: Operand) {
        self.flush_stacks();

        let cond_val = self.reg_val(condition.reg);
        let cond = self.builder.ins().band_imm(cond_val, 0xff);
        self.free_reg(condition.reg);

        let taken = self.builder.create_block();
        let skip = self.builder.create_block();
        self.builder.ins().brif(cond, taken, &[], skip, &[]);

        self.begin_block(taken);
        let _ = self.emit_jump(target, 0);

        self.begin_block(skip);
    }

    // ===== Opcodes =====

    fn op_brk(&mut self) {
        self.flush_stacks();
        let zero = self.iconst(0);
        self.emit_exit(zero);
        self.done = true;
    }

    fn op_inc(&mut self) {
        let mut operand = self.pop();
        operand.semantics &= !SEM_BOOLEAN;
        if operand.semantics & SEM_CONST != 0 {
            let mask = if operand.is_short { 0xffff } else { 0x00ff };
            operand.const_value = operand.const_value.wrapping_add(1) & mask;
        }
        let v = self.reg_val(operand.reg);
        let v = self.builder.ins().iadd_imm(v, 1);
        let v = self.mask_to_width(v, operand.is_short);
        self.set_reg(operand.reg, v);
        self.push(operand);
    }

    fn op_pop(&mut self) {
        if self.flag_k() {
            return; // POPk is a nop
        }
        let size = if self.flag_2() { 2u8 } else { 1u8 };
        let flag_r = self.flag_r();
        self.flush_stack(flag_r);
        if flag_r {
            self.rsp = self.rsp.wrapping_sub(size);
        } else {
            self.wsp = self.wsp.wrapping_sub(size);
        }
        let sp_var = self.saved_sp_var(flag_r);
        let sp = self.builder.use_var(sp_var);
        let sp = self.wrap_sp(sp, -(size as i64));
        self.builder.def_var(sp_var, sp);
    }

    fn op_nip(&mut self) {
        let b = self.pop();
        self.op_pop();
        self.push(b);
    }

    fn op_swp(&mut self) {
        let b = self.pop();
        let a = self.pop();
        self.push(b);
        self.push(a);
    }

    fn op_rot(&mut self) {
        let c = self.pop();
        let b = self.pop();
        let a = self.pop();
        self.push(b);
        self.push(c);
        self.push(a);
    }

    fn op_dup(&mut self) {
        let a = self.pop();
        self.push(a);
        self.push(a);
    }

    fn op_ovr(&mut self) {
        let b = self.pop();
        let a = self.pop();
        self.push(a);
        self.push(b);
        self.push(a);
    }

    /// Comparisons push a single byte flag and taint it BOOLEAN.
    fn op_compare(&mut self, cc: IntCC) {
        let b = self.pop();
        let a = self.pop();
        let result = Operand {
            is_short: false,
            semantics: SEM_BOOLEAN,
            const_value: 0,
            reg: self.alloc_reg(),
        };
        let a_val = self.reg_val(a.reg);
        let b_val = self.reg_val(b.reg);
        let flag = self.builder.ins().icmp(cc, a_val, b_val);
        let flag = self.builder.ins().uextend(types::I32, flag);
        self.set_reg(result.reg, flag);
        self.free_reg(a.reg);
        self.free_reg(b.reg);
        self.push(result);
    }

    fn op_jmp(&mut self) {
        let target = self.pop();

        // A boolean byte target is 0 or 1: the "jump over the next opcode"
        // idiom. Inline it when the skipped opcode is a one-byte terminator
        // (conditional return); the two paths never re-join, which is what
        // makes the inline sound.
        if !self.inlining
            && !target.is_short
            && target.semantics & SEM_BOOLEAN != 0
            && self.next_op_is_inline_terminator()
        {
            self.flush_stacks();
            let target_val = self.reg_val(target.reg);
            self.free_reg(target.reg);

            let skip = self.builder.create_block();
            let fall = self.builder.create_block();
            self.builder.ins().brif(target_val, skip, &[], fall, &[]);

            self.begin_block(fall);
            let snap_wst = self.wst;
            let snap_rst = self.rst;
            let snap_wsp = self.wsp;
            let snap_rsp = self.rsp;
            let inline_pc = self.pc;
            self.inlining = true;
            self.next_opcode();
            self.inlining = false;
            debug_assert!(self.done, "inlined opcode must terminate the block");
            debug_assert!(self.wst_top.is_none() && self.rst_top.is_none());
            self.wst = snap_wst;
            self.rst = snap_rst;
            self.wsp = snap_wsp;
            self.rsp = snap_rsp;
            self.done = false;
            self.pc = inline_pc.wrapping_add(1);

            self.begin_block(skip);
            return;
        }

        let _ = self.emit_jump(target, 0);
        self.done = true;
    }

    fn next_op_is_inline_terminator(&self) -> bool {
        let op = self.vm.memory[self.pc as usize];
        op == 0x00 || op & 0x1f == 0x0c
    }

    fn op_jcn(&mut self) {
        let target = self.pop();
        let condition = self.pop_ex(false, self.flag_r());
        self.emit_conditional_jump(condition, target);
    }

    fn op_jsr(&mut self) {
        let target = self.pop();
        let return_pc = Operand {
            is_short: true,
            semantics: 0,
            const_value: 0,
            reg: self.alloc_reg(),
        };
        let v = self.iconst(self.pc as i64);
        self.set_reg(return_pc.reg, v);
        self.push_ex(return_pc, !self.flag_r());

        // An unlinkable call always bounces; nothing in this block can
        // follow it.
        if !self.emit_jump(target, self.pc) {
            self.done = true;
        }
    }

    fn op_sth(&mut self) {
        let a = self.pop();
        self.push_ex(a, !self.flag_r());
    }

    fn op_ldz(&mut self) {
        let addr = self.pop_ex(false, self.flag_r());
        let value = self.emit_load(addr);
        self.push(value);
    }

    fn op_stz(&mut self) {
        let addr = self.pop_ex(false, self.flag_r());
        let value = self.pop();
        self.emit_store(addr, value);
    }

    /// Turn a popped signed byte offset into an absolute address operand.
    fn relative_addr(&mut self, mut addr: Operand) -> Operand {
        let v = self.reg_val(addr.reg);
        let v = self.builder.ins().ireduce(types::I8, v);
        let v = self.builder.ins().sextend(types::I32, v);
        let v = self.builder.ins().iadd_imm(v, self.pc as i64);
        self.set_reg(addr.reg, v);
        addr.is_short = true;
        addr
    }

    fn op_ldr(&mut self) {
        let addr = self.pop_ex(false, self.flag_r());
        let addr = self.relative_addr(addr);
        let value = self.emit_load(addr);
        self.push(value);
    }

    fn op_str(&mut self) {
        let addr = self.pop_ex(false, self.flag_r());
        let value = self.pop();
        let addr = self.relative_addr(addr);
        self.emit_store(addr, value);
    }

    fn op_lda(&mut self) {
        let addr = self.pop_ex(true, self.flag_r());
        let value = self.emit_load(addr);
        self.push(value);
    }

    fn op_sta(&mut self) {
        let addr = self.pop_ex(true, self.flag_r());
        let value = self.pop();
        self.emit_store(addr, value);
    }

    fn op_dei(&mut self) {
        let addr = self.pop_ex(false, self.flag_r());
        let result = Operand {
            is_short: self.flag_2(),
            semantics: 0,
            const_value: 0,
            reg: self.alloc_reg(),
        };

        self.flush_stacks();
        self.emit_save_state();
        let addr_val = self.reg_val(addr.reg);
        self.free_reg(addr.reg);
        let helper = if result.is_short {
            dei2_helper as usize
        } else {
            dei_helper as usize
        };
        let callee = self.builder.ins().iconst(types::I64, helper as i64);
        let call = self
            .builder
            .ins()
            .call_indirect(self.dei_sigref, callee, &[self.vm_ptr, addr_val]);
        let value = self.builder.inst_results(call)[0];
        self.set_reg(result.reg, value);
        self.emit_load_state();

        self.push(result);
    }

    fn op_deo(&mut self) {
        let addr = self.pop_ex(false, self.flag_r());
        let value = self.pop();

        // The device byte(s) are written before the handler runs, so the
        // handler reads the new value from the device page.
        let addr_val = self.reg_val(addr.reg);
        let value_val = self.reg_val(value.reg);
        let off0 = self.builder.ins().band_imm(addr_val, 0xff);
        if value.is_short {
            let hi = self.builder.ins().ushr_imm(value_val, 8);
            self.store_byte(self.dev_base, off0, hi);
            let off1 = self.builder.ins().iadd_imm(off0, 1);
            let off1 = self.builder.ins().band_imm(off1, 0xff);
            self.store_byte(self.dev_base, off1, value_val);
        } else {
            self.store_byte(self.dev_base, off0, value_val);
        }
        self.free_reg(value.reg);

        self.flush_stacks();
        self.emit_save_state();
        let addr_val = self.reg_val(addr.reg);
        self.free_reg(addr.reg);
        let helper = if value.is_short {
            deo2_helper as usize
        } else {
            deo_helper as usize
        };
        let callee = self.builder.ins().iconst(types::I64, helper as i64);
        self.builder
            .ins()
            .call_indirect(self.deo_sigref, callee, &[self.vm_ptr, addr_val]);
        self.emit_load_state();
    }

    fn op_binary(
        &mut self,
        fold: fn(u16, u16) -> u16,
        emit: fn(&mut FunctionBuilder, Value, Value) -> Value,
    ) {
        let b = self.pop();
        let a = self.pop();
        let both_const =
            a.semantics & SEM_CONST != 0 && b.semantics & SEM_CONST != 0;
        let mask = if b.is_short { 0xffff } else { 0x00ff };
        let result = Operand {
            is_short: b.is_short,
            semantics: if both_const { SEM_CONST } else { 0 },
            const_value: fold(a.const_value, b.const_value) & mask,
            reg: self.alloc_reg(),
        };
        let a_val = self.reg_val(a.reg);
        let b_val = self.reg_val(b.reg);
        let v = emit(&mut self.builder, a_val, b_val);
        let v = self.mask_to_width(v, result.is_short);
        self.set_reg(result.reg, v);
        self.free_reg(a.reg);
        self.free_reg(b.reg);
        self.push(result);
    }

    fn op_div(&mut self) {
        let b = self.pop();
        let a = self.pop();
        let both_const =
            a.semantics & SEM_CONST != 0 && b.semantics & SEM_CONST != 0;
        let mut result = Operand {
            is_short: b.is_short,
            semantics: if both_const { SEM_CONST } else { 0 },
            const_value: 0,
            reg: self.alloc_reg(),
        };
        if both_const && b.const_value != 0 {
            result.const_value = a.const_value / b.const_value;
        }

        // Division by zero yields zero in the guest.
        let a_val = self.reg_val(a.reg);
        let b_val = self.reg_val(b.reg);
        let divide = self.builder.create_block();
        let zero = self.builder.create_block();
        let join = self.builder.create_block();
        self.builder.ins().brif(b_val, divide, &[], zero, &[]);

        self.begin_block(divide);
        let q = self.builder.ins().udiv(a_val, b_val);
        self.set_reg(result.reg, q);
        self.builder.ins().jump(join, &[]);

        self.begin_block(zero);
        let z = self.iconst(0);
        self.set_reg(result.reg, z);
        self.builder.ins().jump(join, &[]);

        self.begin_block(join);
        self.free_reg(a.reg);
        self.free_reg(b.reg);
        self.push(result);
    }

    fn op_sft(&mut self) {
        let b = self.pop_ex(false, self.flag_r());
        let a = self.pop();
        let both_const =
            a.semantics & SEM_CONST != 0 && b.semantics & SEM_CONST != 0;
        let mask = if a.is_short { 0xffff } else { 0x00ff };
        let result = Operand {
            is_short: a.is_short,
            semantics: if both_const { SEM_CONST } else { 0 },
            const_value: (((a.const_value as u32 >> (b.const_value & 0x0f))
                << ((b.const_value >> 4) & 0x0f)) as u16)
                & mask,
            reg: self.alloc_reg(),
        };
        let a_val = self.reg_val(a.reg);
        let b_val = self.reg_val(b.reg);
        let right = self.builder.ins().band_imm(b_val, 0x0f);
        let v = self.builder.ins().ushr(a_val, right);
        let left = self.builder.ins().ushr_imm(b_val, 4);
        let v = self.builder.ins().ishl(v, left);
        let v = self.mask_to_width(v, result.is_short);
        self.set_reg(result.reg, v);
        self.free_reg(a.reg);
        self.free_reg(b.reg);
        self.push(result);
    }

    fn op_jci(&mut self) {
        let condition = self.pop_ex(false, false);
        let target = self.immediate_jump_target();
        self.emit_conditional_jump(condition, target);
    }

    fn op_jmi(&mut self) {
        let target = self.immediate_jump_target();
        let _ = self.emit_jump(target, 0);
        self.done = true;
    }

    fn op_jsi(&mut self) {
        let target = self.immediate_jump_target();
        let return_pc = Operand {
            is_short: true,
            semantics: 0,
            const_value: 0,
            reg: self.alloc_reg(),
        };
        let v = self.iconst(self.pc as i64);
        self.set_reg(return_pc.reg, v);
        self.push_ex(return_pc, true);
        if !self.emit_jump(target, self.pc) {
            self.done = true;
        }
    }

    fn op_lit(&mut self) {
        let lit = self.immediate(self.flag_2());
        self.push(lit);
    }

    // ===== Driver =====

    fn next_opcode(&mut self) {
        // Fall-through into the zero page: hand the pc back to the
        // trampoline, which delegates to the interpreter.
        if self.pc < RESET_VECTOR {
            self.flush_stacks();
            let pc = self.iconst(self.pc as i64);
            self.emit_exit(pc);
            self.done = true;
            return;
        }

        // Re-pin the cached top-of-stack registers across the boundary.
        self.used_registers = 0;
        if let Some(top) = self.wst_top {
            self.used_registers |= reg_mask(top.reg);
        }
        if let Some(top) = self.rst_top {
            self.used_registers |= reg_mask(top.reg);
        }

        let op_pc = self.pc;
        self.opcode = self.vm.memory[op_pc as usize];
        self.pc = self.pc.wrapping_add(1);

        if let Some(hook) = self.jit.hook.as_deref_mut() {
            hook.opcode(op_pc, self.opcode);
        }
        self.builder.set_srcloc(ir::SourceLoc::new(op_pc as u32));

        if self.flag_k() {
            // Non-destructive opcode: make the guest stacks consistent, then
            // pop through shadow pointers so the real ones never move.
            if let Some(top) = self.wst_top {
                self.flush_stack(false);
                self.free_reg(top.reg);
            }
            if let Some(top) = self.rst_top {
                self.flush_stack(true);
                self.free_reg(top.reg);
            }
            self.shadow_wsp = self.wsp;
            self.shadow_rsp = self.rsp;
            self.keep = true;

            let scratch_wsp = self.alloc_reg();
            let scratch_rsp = self.alloc_reg();
            let wsp = self.builder.use_var(self.wsp_var);
            self.builder.def_var(self.regs[scratch_wsp.0 as usize], wsp);
            let rsp = self.builder.use_var(self.rsp_var);
            self.builder.def_var(self.regs[scratch_rsp.0 as usize], rsp);
            self.wsp_pop_var = self.regs[scratch_wsp.0 as usize];
            self.rsp_pop_var = self.regs[scratch_rsp.0 as usize];
        } else {
            self.keep = false;
            self.wsp_pop_var = self.wsp_var;
            self.rsp_pop_var = self.rsp_var;
        }

        self.dispatch();
    }

    fn dispatch(&mut self) {
        match self.opcode {
            0x00 => self.op_brk(),
            0x20 => self.op_jci(),
            0x40 => self.op_jmi(),
            0x60 => self.op_jsi(),
            0x80 | 0xa0 | 0xc0 | 0xe0 => self.op_lit(),
            op => match op & 0x1f {
                0x00 => self.op_brk(),
                0x01 => self.op_inc(),
                0x02 => self.op_pop(),
                0x03 => self.op_nip(),
                0x04 => self.op_swp(),
                0x05 => self.op_rot(),
                0x06 => self.op_dup(),
                0x07 => self.op_ovr(),
                0x08 => self.op_compare(IntCC::Equal),
                0x09 => self.op_compare(IntCC::NotEqual),
                0x0a => self.op_compare(IntCC::UnsignedGreaterThan),
                0x0b => self.op_compare(IntCC::UnsignedLessThan),
                0x0c => self.op_jmp(),
                0x0d => self.op_jcn(),
                0x0e => self.op_jsr(),
                0x0f => self.op_sth(),
                0x10 => self.op_ldz(),
                0x11 => self.op_stz(),
                0x12 => self.op_ldr(),
                0x13 => self.op_str(),
                0x14 => self.op_lda(),
                0x15 => self.op_sta(),
                0x16 => self.op_dei(),
                0x17 => self.op_deo(),
                0x18 => self.op_binary(u16::wrapping_add, |b, x, y| b.ins().iadd(x, y)),
                0x19 => self.op_binary(u16::wrapping_sub, |b, x, y| b.ins().isub(x, y)),
                0x1a => self.op_binary(u16::wrapping_mul, |b, x, y| b.ins().imul(x, y)),
                0x1b => self.op_div(),
                0x1c => self.op_binary(|x, y| x & y, |b, x, y| b.ins().band(x, y)),
                0x1d => self.op_binary(|x, y| x | y, |b, x, y| b.ins().bor(x, y)),
                0x1e => self.op_binary(|x, y| x ^ y, |b, x, y| b.ins().bxor(x, y)),
                0x1f => self.op_sft(),
                _ => unreachable!(),
            },
        }
    }
}

// ===== Device helper shims =====
//
// Called from generated code with the VM pointer the block was entered with.
// Stack pointers have been written back before the call and are reloaded
// after it, so the handlers see a consistent machine.

extern "C" fn dei_helper(vm: *mut Uxn, addr: u32) -> u32 {
    let vm = unsafe { &mut *vm };
    vm.dei(addr as u8) as u32
}

extern "C" fn dei2_helper(vm: *mut Uxn, addr: u32) -> u32 {
    let vm = unsafe { &mut *vm };
    let hi = vm.dei(addr as u8);
    let lo = vm.dei((addr as u8).wrapping_add(1));
    (hi as u32) << 8 | lo as u32
}

extern "C" fn deo_helper(vm: *mut Uxn, addr: u32) {
    let vm = unsafe { &mut *vm };
    vm.deo(addr as u8);
}

extern "C" fn deo2_helper(vm: *mut Uxn, addr: u32) {
    let vm = unsafe { &mut *vm };
    vm.deo(addr as u8);
    vm.deo((addr as u8).wrapping_add(1));
}
