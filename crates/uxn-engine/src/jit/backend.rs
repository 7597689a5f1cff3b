//! Native code emitter adapter
//!
//! Thin layer over Cranelift that hides the target ISA from the rest of the
//! engine: it owns the ISA handle, hands out one `JITModule` per compiled
//! block and defines the two calling conventions every block is emitted
//! against (host-callable head, tail-convention body).

use std::sync::Arc;

use cranelift_codegen::ir::{self, types, AbiParam};
use cranelift_codegen::isa::{CallConv, TargetIsa};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_codegen::Context;
use cranelift_frontend::FunctionBuilderContext;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::default_libcall_names;
use target_lexicon::Architecture;

/// Target architecture, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetArch {
    X86_64,
    AArch64,
    Other,
}

/// Error during code generation.
#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    #[error("backend error: {0}")]
    Backend(String),
    #[error("module error: {0}")]
    Module(#[from] cranelift_module::ModuleError),
}

/// Cranelift-based emitter.
pub struct NativeBackend {
    isa: Arc<dyn TargetIsa>,
}

impl NativeBackend {
    /// Create a backend targeting the host machine.
    pub fn host() -> Result<Self, CodegenError> {
        let mut flag_builder = settings::builder();
        flag_builder
            .set("opt_level", "speed")
            .map_err(|e| CodegenError::Backend(format!("failed to set opt_level: {e}")))?;
        flag_builder
            .set("is_pic", "false")
            .map_err(|e| CodegenError::Backend(format!("failed to set is_pic: {e}")))?;
        let flags = settings::Flags::new(flag_builder);

        let isa = cranelift_native::builder()
            .map_err(|e| CodegenError::Backend(format!("failed to create native ISA builder: {e}")))?
            .finish(flags)
            .map_err(|e| CodegenError::Backend(format!("failed to finish ISA: {e}")))?;

        Ok(NativeBackend { isa })
    }

    pub fn name(&self) -> &str {
        "cranelift"
    }

    pub fn target_arch(&self) -> TargetArch {
        match self.isa.triple().architecture {
            Architecture::X86_64 => TargetArch::X86_64,
            Architecture::Aarch64(_) => TargetArch::AArch64,
            _ => TargetArch::Other,
        }
    }

    pub(crate) fn default_call_conv(&self) -> CallConv {
        self.isa.default_call_conv()
    }

    /// One module per block: code lives until engine teardown.
    pub(crate) fn new_module(&self) -> JITModule {
        let builder = JITBuilder::with_isa(self.isa.clone(), default_libcall_names());
        JITModule::new(builder)
    }

    /// Host entry: `extern "C" fn(*mut Uxn) -> u32` (the next guest pc).
    pub(crate) fn head_signature(&self) -> ir::Signature {
        let mut sig = ir::Signature::new(self.default_call_conv());
        sig.params.push(AbiParam::new(types::I64)); // vm
        sig.returns.push(AbiParam::new(types::I32)); // next pc
        sig
    }

    /// Fast entry: `(vm, wsp, rsp) -> next pc` with the tail calling
    /// convention, so direct block-to-block jumps keep the stack pointers in
    /// registers.
    pub(crate) fn body_signature(&self) -> ir::Signature {
        let mut sig = ir::Signature::new(CallConv::Tail);
        sig.params.push(AbiParam::new(types::I64)); // vm
        sig.params.push(AbiParam::new(types::I32)); // wsp
        sig.params.push(AbiParam::new(types::I32)); // rsp
        sig.returns.push(AbiParam::new(types::I32)); // next pc
        sig
    }

    /// Signature of the device helper shims: `(vm, addr) [-> value]`.
    pub(crate) fn helper_signature(&self, has_result: bool) -> ir::Signature {
        let mut sig = ir::Signature::new(self.default_call_conv());
        sig.params.push(AbiParam::new(types::I64)); // vm
        sig.params.push(AbiParam::new(types::I32)); // device address
        if has_result {
            sig.returns.push(AbiParam::new(types::I32));
        }
        sig
    }
}

/// Reusable per-compile Cranelift state; pooled by the cleanup queue.
pub(crate) struct CompilerHandle {
    pub ctx: Context,
    pub fctx: FunctionBuilderContext,
}

impl Default for CompilerHandle {
    fn default() -> Self {
        CompilerHandle {
            ctx: Context::new(),
            fctx: FunctionBuilderContext::new(),
        }
    }
}

impl CompilerHandle {
    pub fn clear(&mut self) {
        self.ctx.clear();
    }
}
