use std::ffi::{c_void, CStr, CString};
use std::mem;
use std::ptr;
use std::sync::Once;

use llvm_sys::execution_engine::{
    LLVMAddGlobalMapping, LLVMCreateMCJITCompilerForModule, LLVMDisposeExecutionEngine,
    LLVMExecutionEngineRef, LLVMGetFunctionAddress, LLVMInitializeMCJITCompilerOptions,
    LLVMLinkInMCJIT, LLVMMCJITCompilerOptions,
};
use llvm_sys::target::{
    LLVM_InitializeNativeAsmParser, LLVM_InitializeNativeAsmPrinter, LLVM_InitializeNativeTarget,
};
use llvm_sys::{core, prelude::*};

use super::codegen::Codegen;
use super::error::{ErrorKind, Result};

static INIT: Once = Once::new();

fn initialize() {
    INIT.call_once(|| unsafe {
        LLVM_InitializeNativeTarget();
        LLVM_InitializeNativeAsmPrinter();
        LLVM_InitializeNativeAsmParser();
        LLVMLinkInMCJIT();
    });
}

/// putchard - putchar that takes a double and returns 0.
#[no_mangle]
pub extern "C" fn putchard(c: f64) -> f64 {
    unsafe {
        libc::putchar(c as libc::c_int);
    }
    0.0
}

/// printd - print a double followed by a newline, returning 0.
#[no_mangle]
pub extern "C" fn printd(x: f64) -> f64 {
    println!("{}", x);
    0.0
}

/// Executor collaborator: compile the generator's module with MCJIT and
/// invoke one nullary function, returning its double result.
///
/// The engine runs over a clone of the module so the code generator keeps
/// ownership of the original and can go on adding functions to it.
pub(crate) fn run_function(codegen: &Codegen, name: &str) -> Result<f64> {
    initialize();

    let cname = CString::new(name)
        .map_err(|_| ErrorKind::Exec(format!("invalid function name {:?}", name)))?;

    unsafe {
        let module = core::LLVMCloneModule(codegen.module());

        let mut engine: LLVMExecutionEngineRef = ptr::null_mut();
        let mut options: LLVMMCJITCompilerOptions = mem::zeroed();
        LLVMInitializeMCJITCompilerOptions(&mut options, mem::size_of::<LLVMMCJITCompilerOptions>());

        let mut error: *mut libc::c_char = ptr::null_mut();
        if LLVMCreateMCJITCompilerForModule(
            &mut engine,
            module,
            &mut options,
            mem::size_of::<LLVMMCJITCompilerOptions>(),
            &mut error,
        ) != 0
        {
            let message = CStr::from_ptr(error).to_string_lossy().into_owned();
            core::LLVMDisposeMessage(error);
            core::LLVMDisposeModule(module);
            return Err(ErrorKind::Exec(format!(
                "failed to create execution engine: {}",
                message
            ))
            .into());
        }

        // Resolve the host-side runtime before any lookup forces
        // compilation.
        let runtime: [(&[u8], *const c_void); 2] = [
            (b"putchard\0", putchard as *const c_void),
            (b"printd\0", printd as *const c_void),
        ];
        for (symbol, address) in runtime {
            let declaration: LLVMValueRef =
                core::LLVMGetNamedFunction(module, symbol.as_ptr() as *const _);
            if !declaration.is_null() {
                LLVMAddGlobalMapping(engine, declaration, address as *mut c_void);
            }
        }

        let address = LLVMGetFunctionAddress(engine, cname.as_ptr());
        if address == 0 {
            LLVMDisposeExecutionEngine(engine);
            return Err(ErrorKind::Exec(format!("function '{}' not found in module", name)).into());
        }

        let callable: extern "C" fn() -> f64 = mem::transmute(address as usize);
        let result = callable();

        // Disposing the engine also frees the cloned module it owns.
        LLVMDisposeExecutionEngine(engine);

        Ok(result)
    }
}
