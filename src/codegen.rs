use std::collections::HashMap;
use std::ffi::{CStr, CString};

use llvm_sys::analysis::{LLVMVerifierFailureAction, LLVMVerifyFunction};
use llvm_sys::prelude::*;
use llvm_sys::transforms::instcombine::LLVMAddInstructionCombiningPass;
use llvm_sys::transforms::scalar::{
    LLVMAddCFGSimplificationPass, LLVMAddGVNPass, LLVMAddReassociatePass,
};
use llvm_sys::transforms::util::LLVMAddPromoteMemoryToRegisterPass;
use llvm_sys::{core, LLVMRealPredicate};

use super::ast::{Expr, Function, Prototype};
use super::error::{ErrorKind, Result};
use super::parser::OperatorTable;

/// Code generator state: one LLVM context/module/builder, the per-function
/// scope table mapping variable names to their alloca cells, and the
/// function pass manager run over every finished function.
///
/// Every variable (parameter, loop variable, var binding) lives in a
/// mutable entry-block alloca; mem2reg turns the cells back into SSA
/// registers after the fact.
pub(crate) struct Codegen {
    context: LLVMContextRef,
    module: LLVMModuleRef,
    builder: LLVMBuilderRef,
    fpm: LLVMPassManagerRef,
    double_type: LLVMTypeRef,
    named_values: HashMap<String, LLVMValueRef>,
}

fn codegen_error<T>(msg: impl Into<String>) -> Result<T> {
    Err(ErrorKind::Codegen(msg.into()).into())
}

/// Identifiers are scanned as [a-zA-Z0-9]+ so this cannot fail in practice,
/// but a NUL smuggled in through an operator name must not reach LLVM.
fn cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| ErrorKind::Codegen(format!("invalid symbol name {:?}", s)).into())
}

impl Codegen {
    pub(crate) fn new() -> Self {
        unsafe {
            let context = core::LLVMContextCreate();
            let module = core::LLVMModuleCreateWithNameInContext(
                b"my cool jit\0".as_ptr() as *const _,
                context,
            );
            let builder = core::LLVMCreateBuilderInContext(context);
            let double_type = core::LLVMDoubleTypeInContext(context);

            // Per-function pass pipeline: promote allocas to registers,
            // then local cleanups.
            let fpm = core::LLVMCreateFunctionPassManagerForModule(module);
            LLVMAddPromoteMemoryToRegisterPass(fpm);
            LLVMAddInstructionCombiningPass(fpm);
            LLVMAddReassociatePass(fpm);
            LLVMAddGVNPass(fpm);
            LLVMAddCFGSimplificationPass(fpm);
            core::LLVMInitializeFunctionPassManager(fpm);

            Codegen {
                context,
                module,
                builder,
                fpm,
                double_type,
                named_values: HashMap::new(),
            }
        }
    }

    pub(crate) fn module(&self) -> LLVMModuleRef {
        self.module
    }

    /// Print a function's IR, mainly for logging and tests.
    pub(crate) fn function_ir(&self, function: LLVMValueRef) -> String {
        unsafe {
            let s = core::LLVMPrintValueToString(function);
            let ir = CStr::from_ptr(s).to_string_lossy().into_owned();
            core::LLVMDisposeMessage(s);
            ir
        }
    }

    /// Run the function pass pipeline over an already finished function.
    pub(crate) fn optimize(&self, function: LLVMValueRef) {
        unsafe {
            core::LLVMRunFunctionPassManager(self.fpm, function);
        }
    }

    fn const_double(&self, value: f64) -> LLVMValueRef {
        unsafe { core::LLVMConstReal(self.double_type, value) }
    }

    fn current_function(&self) -> LLVMValueRef {
        unsafe { core::LLVMGetBasicBlockParent(core::LLVMGetInsertBlock(self.builder)) }
    }

    fn named_function(&self, name: &str) -> Result<LLVMValueRef> {
        let cname = cstring(name)?;
        Ok(unsafe { core::LLVMGetNamedFunction(self.module, cname.as_ptr()) })
    }

    /// Create an alloca in the entry block of `function`, regardless of
    /// where the main builder currently sits.
    fn create_entry_block_alloca(&self, function: LLVMValueRef, name: &str) -> Result<LLVMValueRef> {
        let cname = cstring(name)?;
        unsafe {
            let builder = core::LLVMCreateBuilderInContext(self.context);
            let entry = core::LLVMGetEntryBasicBlock(function);
            let first = core::LLVMGetFirstInstruction(entry);
            core::LLVMPositionBuilder(builder, entry, first);
            let alloca = core::LLVMBuildAlloca(builder, self.double_type, cname.as_ptr());
            core::LLVMDisposeBuilder(builder);
            Ok(alloca)
        }
    }

    fn build_call(&mut self, callee: LLVMValueRef, args: &mut [LLVMValueRef], name: &[u8]) -> LLVMValueRef {
        unsafe {
            let fn_type = core::LLVMGlobalGetValueType(callee);
            core::LLVMBuildCall2(
                self.builder,
                fn_type,
                callee,
                args.as_mut_ptr(),
                args.len() as u32,
                name.as_ptr() as *const _,
            )
        }
    }

    pub(crate) fn codegen_expr(&mut self, expr: &Expr) -> Result<LLVMValueRef> {
        match expr {
            Expr::Number(n) => Ok(self.const_double(*n)),
            Expr::Variable(name) => self.codegen_variable(name),
            Expr::Unary(op, operand) => self.codegen_unary(*op, operand),
            Expr::Binary(op, lhs, rhs) => self.codegen_binary(*op, lhs, rhs),
            Expr::Call(callee, args) => self.codegen_call(callee, args),
            Expr::If(cond, then, else_) => self.codegen_if(cond, then, else_),
            Expr::For {
                var_name,
                start,
                end,
                step,
                body,
            } => self.codegen_for(var_name, start, end, step.as_deref(), body),
            Expr::Var { bindings, body } => self.codegen_var(bindings, body),
        }
    }

    fn codegen_variable(&mut self, name: &str) -> Result<LLVMValueRef> {
        let cell = match self.named_values.get(name) {
            Some(cell) => *cell,
            None => return codegen_error(format!("unknown variable name '{}'", name)),
        };
        let cname = cstring(name)?;
        Ok(unsafe { core::LLVMBuildLoad2(self.builder, self.double_type, cell, cname.as_ptr()) })
    }

    fn codegen_unary(&mut self, op: char, operand: &Expr) -> Result<LLVMValueRef> {
        let operand = self.codegen_expr(operand)?;

        let function = self.named_function(&format!("unary{}", op))?;
        if function.is_null() {
            return codegen_error(format!("unknown unary operator '{}'", op));
        }
        Ok(self.build_call(function, &mut [operand], b"unop\0"))
    }

    fn codegen_binary(&mut self, op: char, lhs: &Expr, rhs: &Expr) -> Result<LLVMValueRef> {
        // Special case '=' because the LHS is a destination, not a value.
        if op == '=' {
            let name = match lhs {
                Expr::Variable(name) => name,
                _ => return codegen_error("destination of '=' must be a variable"),
            };

            let value = self.codegen_expr(rhs)?;

            let cell = match self.named_values.get(name) {
                Some(cell) => *cell,
                None => return codegen_error(format!("unknown variable name '{}'", name)),
            };
            unsafe {
                core::LLVMBuildStore(self.builder, value, cell);
            }
            return Ok(value);
        }

        let l = self.codegen_expr(lhs)?;
        let r = self.codegen_expr(rhs)?;

        unsafe {
            match op {
                '+' => Ok(core::LLVMBuildFAdd(
                    self.builder,
                    l,
                    r,
                    b"addtmp\0".as_ptr() as *const _,
                )),
                '-' => Ok(core::LLVMBuildFSub(
                    self.builder,
                    l,
                    r,
                    b"subtmp\0".as_ptr() as *const _,
                )),
                '*' => Ok(core::LLVMBuildFMul(
                    self.builder,
                    l,
                    r,
                    b"multmp\0".as_ptr() as *const _,
                )),
                '<' => {
                    let cmp = core::LLVMBuildFCmp(
                        self.builder,
                        LLVMRealPredicate::LLVMRealULT,
                        l,
                        r,
                        b"cmptmp\0".as_ptr() as *const _,
                    );
                    // Unsigned widening yields exactly 0.0 or 1.0.
                    Ok(core::LLVMBuildUIToFP(
                        self.builder,
                        cmp,
                        self.double_type,
                        b"booltmp\0".as_ptr() as *const _,
                    ))
                }
                _ => {
                    // Not builtin: emit a call to the user-defined operator.
                    let function = self.named_function(&format!("binary{}", op))?;
                    if function.is_null() {
                        return codegen_error(format!("unknown binary operator '{}'", op));
                    }
                    Ok(self.build_call(function, &mut [l, r], b"binop\0"))
                }
            }
        }
    }

    fn codegen_call(&mut self, callee: &str, args: &[Expr]) -> Result<LLVMValueRef> {
        // Look up the name in the global module table.
        let function = self.named_function(callee)?;
        if function.is_null() {
            return codegen_error(format!("unknown function '{}' referenced", callee));
        }

        let expected = unsafe { core::LLVMCountParams(function) } as usize;
        if expected != args.len() {
            return codegen_error(format!(
                "incorrect number of arguments passed to '{}': expected {}, got {}",
                callee,
                expected,
                args.len()
            ));
        }

        let mut arg_values = Vec::with_capacity(args.len());
        for arg in args {
            arg_values.push(self.codegen_expr(arg)?);
        }

        Ok(self.build_call(function, &mut arg_values, b"calltmp\0"))
    }

    fn codegen_if(&mut self, cond: &Expr, then: &Expr, else_: &Expr) -> Result<LLVMValueRef> {
        let cond = self.codegen_expr(cond)?;

        unsafe {
            // Convert condition to a bool by comparing non-equal to 0.0.
            let cond = core::LLVMBuildFCmp(
                self.builder,
                LLVMRealPredicate::LLVMRealONE,
                cond,
                self.const_double(0.0),
                b"ifcond\0".as_ptr() as *const _,
            );

            let function = self.current_function();

            let then_bb = core::LLVMAppendBasicBlockInContext(
                self.context,
                function,
                b"then\0".as_ptr() as *const _,
            );
            let else_bb = core::LLVMAppendBasicBlockInContext(
                self.context,
                function,
                b"else\0".as_ptr() as *const _,
            );
            let merge_bb = core::LLVMAppendBasicBlockInContext(
                self.context,
                function,
                b"ifcont\0".as_ptr() as *const _,
            );

            core::LLVMBuildCondBr(self.builder, cond, then_bb, else_bb);

            // Emit then value.
            core::LLVMPositionBuilderAtEnd(self.builder, then_bb);
            let then_value = self.codegen_expr(then)?;
            core::LLVMBuildBr(self.builder, merge_bb);
            // Codegen of 'then' can change the current block; use the block
            // the branch actually left from as the phi predecessor.
            let then_end = core::LLVMGetInsertBlock(self.builder);

            // Emit else value.
            core::LLVMPositionBuilderAtEnd(self.builder, else_bb);
            let else_value = self.codegen_expr(else_)?;
            core::LLVMBuildBr(self.builder, merge_bb);
            let else_end = core::LLVMGetInsertBlock(self.builder);

            // Join the two results in the merge block.
            core::LLVMPositionBuilderAtEnd(self.builder, merge_bb);
            let phi = core::LLVMBuildPhi(
                self.builder,
                self.double_type,
                b"iftmp\0".as_ptr() as *const _,
            );
            let mut incoming_values = [then_value, else_value];
            let mut incoming_blocks = [then_end, else_end];
            core::LLVMAddIncoming(
                phi,
                incoming_values.as_mut_ptr(),
                incoming_blocks.as_mut_ptr(),
                2,
            );

            Ok(phi)
        }
    }

    /// Lower a for loop:
    ///
    ///   entry:     start = ...; cell = alloca; store start -> cell; br loop
    ///   loop:      body; step; cell += step; br (end != 0), loop, afterloop
    ///   afterloop: result is 0.0
    ///
    /// The body runs before the condition is first checked, so it always
    /// executes at least once.
    fn codegen_for(
        &mut self,
        var_name: &str,
        start: &Expr,
        end: &Expr,
        step: Option<&Expr>,
        body: &Expr,
    ) -> Result<LLVMValueRef> {
        let function = self.current_function();

        // Create the loop variable's cell and store the start value,
        // emitted while the variable itself is not yet in scope.
        let cell = self.create_entry_block_alloca(function, var_name)?;
        let start_value = self.codegen_expr(start)?;

        let loop_bb = unsafe {
            core::LLVMBuildStore(self.builder, start_value, cell);

            let loop_bb = core::LLVMAppendBasicBlockInContext(
                self.context,
                function,
                b"loop\0".as_ptr() as *const _,
            );

            // Unconditional fall through into the loop body.
            core::LLVMBuildBr(self.builder, loop_bb);
            core::LLVMPositionBuilderAtEnd(self.builder, loop_bb);
            loop_bb
        };

        // Shadow any existing binding of the same name for the body; the
        // save/restore brackets the tail even when the body fails.
        let old_value = self.named_values.insert(var_name.to_owned(), cell);
        let tail = self.codegen_for_tail(function, loop_bb, cell, var_name, end, step, body);
        match old_value {
            Some(old) => self.named_values.insert(var_name.to_owned(), old),
            None => self.named_values.remove(var_name),
        };
        tail?;

        // The for expression always evaluates to 0.0.
        Ok(self.const_double(0.0))
    }

    /// Body, step, end condition and back edge of a for loop.
    fn codegen_for_tail(
        &mut self,
        function: LLVMValueRef,
        loop_bb: LLVMBasicBlockRef,
        cell: LLVMValueRef,
        var_name: &str,
        end: &Expr,
        step: Option<&Expr>,
        body: &Expr,
    ) -> Result<()> {
        // The body's value is ignored, but its failure is not.
        self.codegen_expr(body)?;

        let step_value = match step {
            Some(step) => self.codegen_expr(step)?,
            None => self.const_double(1.0),
        };

        unsafe {
            // Reload, increment and store back; the body may have mutated
            // the loop variable.
            let cname = cstring(var_name)?;
            let current =
                core::LLVMBuildLoad2(self.builder, self.double_type, cell, cname.as_ptr());
            let next = core::LLVMBuildFAdd(
                self.builder,
                current,
                step_value,
                b"nextvar\0".as_ptr() as *const _,
            );
            core::LLVMBuildStore(self.builder, next, cell);
        }

        let end_value = self.codegen_expr(end)?;

        unsafe {
            let end_cond = core::LLVMBuildFCmp(
                self.builder,
                LLVMRealPredicate::LLVMRealONE,
                end_value,
                self.const_double(0.0),
                b"loopcond\0".as_ptr() as *const _,
            );

            let after_bb = core::LLVMAppendBasicBlockInContext(
                self.context,
                function,
                b"afterloop\0".as_ptr() as *const _,
            );
            core::LLVMBuildCondBr(self.builder, end_cond, loop_bb, after_bb);
            core::LLVMPositionBuilderAtEnd(self.builder, after_bb);
        }
        Ok(())
    }

    fn codegen_var(&mut self, bindings: &[(String, Option<Expr>)], body: &Expr) -> Result<LLVMValueRef> {
        let function = self.current_function();
        let mut old_bindings = Vec::with_capacity(bindings.len());

        // Register all variables and emit their initializers. The scope is
        // unwound below even if an initializer or the body fails.
        let result = (|| -> Result<LLVMValueRef> {
            for (name, init) in bindings {
                // Emit the initializer before adding the variable to scope;
                // in "var a = 1 in var a = a in ..." the inner initializer
                // sees the outer 'a'.
                let init_value = match init {
                    Some(init) => self.codegen_expr(init)?,
                    None => self.const_double(0.0),
                };

                let cell = self.create_entry_block_alloca(function, name)?;
                unsafe {
                    core::LLVMBuildStore(self.builder, init_value, cell);
                }

                old_bindings.push((name.clone(), self.named_values.insert(name.clone(), cell)));
            }

            self.codegen_expr(body)
        })();

        // Pop our variables from scope, restoring what they shadowed.
        for (name, old) in old_bindings.into_iter().rev() {
            match old {
                Some(old) => self.named_values.insert(name, old),
                None => self.named_values.remove(&name),
            };
        }

        result
    }

    /// Declare a module-level function for a prototype: all parameters and
    /// the return value are doubles; parameter names are set for
    /// readability and for body codegen to bind against.
    pub(crate) fn codegen_proto(&mut self, proto: &Prototype) -> Result<LLVMValueRef> {
        let cname = cstring(&proto.name)?;
        unsafe {
            let mut param_types = vec![self.double_type; proto.args.len()];
            let fn_type = core::LLVMFunctionType(
                self.double_type,
                param_types.as_mut_ptr(),
                param_types.len() as u32,
                0,
            );
            let function = core::LLVMAddFunction(self.module, cname.as_ptr(), fn_type);

            self.set_param_names(function, &proto.args)?;

            Ok(function)
        }
    }

    fn set_param_names(&self, function: LLVMValueRef, names: &[String]) -> Result<()> {
        for (i, name) in names.iter().enumerate() {
            let cname = cstring(name)?;
            unsafe {
                let param = core::LLVMGetParam(function, i as u32);
                core::LLVMSetValueName2(param, cname.as_ptr(), name.len());
            }
        }
        Ok(())
    }

    pub(crate) fn codegen_func(
        &mut self,
        func: &Function,
        ops: &mut OperatorTable,
    ) -> Result<LLVMValueRef> {
        let proto = &func.proto;

        // Reuse a declaration from a previous 'extern' if there is one.
        let mut function = self.named_function(&proto.name)?;
        if function.is_null() {
            function = self.codegen_proto(proto)?;
        } else {
            unsafe {
                if core::LLVMCountParams(function) as usize != proto.args.len() {
                    return codegen_error(format!(
                        "definition of '{}' conflicts with earlier declaration: expected {} parameters, got {}",
                        proto.name,
                        core::LLVMCountParams(function),
                        proto.args.len()
                    ));
                }
                if core::LLVMCountBasicBlocks(function) != 0 {
                    return codegen_error(format!("function '{}' cannot be redefined", proto.name));
                }
            }
            // The declaration may have used different parameter names;
            // the definition's names are the ones the body refers to.
            self.set_param_names(function, &proto.args)?;
        }

        // If this is a binary operator, install its precedence before the
        // body is generated so the operator can be used recursively. The
        // registration is rolled back if the body fails.
        let saved_precedence = if proto.is_binary_op() {
            let op = proto.operator_name();
            let old = ops.precedence(op);
            ops.set(op, proto.binary_precedence());
            Some((op, old))
        } else {
            None
        };

        match self.codegen_func_body(function, func) {
            Ok(()) => {
                self.optimize(function);
                Ok(function)
            }
            Err(err) => {
                // Remove the half-built function so a corrected
                // redefinition is not blocked by it.
                unsafe {
                    core::LLVMDeleteFunction(function);
                }
                if let Some((op, old)) = saved_precedence {
                    ops.restore(op, old);
                }
                Err(err)
            }
        }
    }

    /// Entry block, parameter cells, body, return, verification.
    fn codegen_func_body(&mut self, function: LLVMValueRef, func: &Function) -> Result<()> {
        unsafe {
            let entry = core::LLVMAppendBasicBlockInContext(
                self.context,
                function,
                b"entry\0".as_ptr() as *const _,
            );
            core::LLVMPositionBuilderAtEnd(self.builder, entry);

            // Bind the arguments: a fresh cell per parameter, in a freshly
            // cleared scope.
            self.named_values.clear();
            for (i, name) in func.proto.args.iter().enumerate() {
                let param = core::LLVMGetParam(function, i as u32);
                let cell = self.create_entry_block_alloca(function, name)?;
                core::LLVMBuildStore(self.builder, param, cell);
                self.named_values.insert(name.clone(), cell);
            }

            let ret = self.codegen_expr(&func.body)?;
            core::LLVMBuildRet(self.builder, ret);

            // A malformed function here is a generator bug, not user error.
            let broken = LLVMVerifyFunction(
                function,
                LLVMVerifierFailureAction::LLVMPrintMessageAction,
            ) != 0;
            debug_assert!(!broken, "generated function failed verification");
            if broken {
                return codegen_error(format!(
                    "function '{}' failed verification",
                    func.proto.name
                ));
            }
        }
        Ok(())
    }
}

impl Drop for Codegen {
    fn drop(&mut self) {
        unsafe {
            core::LLVMDisposePassManager(self.fpm);
            core::LLVMDisposeBuilder(self.builder);
            core::LLVMDisposeModule(self.module);
            core::LLVMContextDispose(self.context);
        }
    }
}
