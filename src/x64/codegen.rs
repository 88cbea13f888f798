//! AST to x86-64 lowering
//!
//! A single recursive pass over the translation unit. Expression results
//! always end up in RAX; a value that must survive a nested evaluation is
//! pushed and popped explicitly. Control flow is built from fresh labels that
//! are numbered per compilation by [`LoweringContext`].
//!
//! ## Code layout
//!
//! ```text
//! _start:  entry stub (calls main, turns its result into the exit status)
//! main:    prologue, body, epilogue at every return
//! f:       ...
//! ```

use std::collections::HashMap;

use log::{debug, warn};

use super::encoding::Mem;
use super::frame::{FrameBuilder, SLOT_SIZE};
use super::image::ImageFormat;
use super::labels::Assembler;
use super::registers::{Cond, Reg64, ACCUMULATOR, AUX, SCRATCH, STACK_POINTER, SYSV_ARG_REGS};
use crate::ast::{BinaryOp, Expr, FunctionDef, Span, Stmt, TranslationUnit, UnaryOp};
use crate::error::{CodegenError, Result};
use crate::CompileOptions;

/// Label of the synthesized entry stub
pub const ENTRY_SYMBOL: &str = "_start";

/// Function the entry stub calls
pub const MAIN_SYMBOL: &str = "main";

/// Linux `exit` syscall number
const SYS_EXIT: i32 = 60;

/// Windows x64 shadow space plus the 8 bytes that realign the stack
const WIN64_STUB_FRAME: i32 = 40;

/// Where a function landed in the code buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionRecord {
    pub name: String,
    pub start_offset: usize,
    pub size: usize,
    pub stack_size: u32,
    pub is_entry: bool,
}

/// Fully linked machine code for one translation unit
#[derive(Debug, Clone)]
pub struct CompiledProgram {
    pub code: Vec<u8>,
    pub entry_offset: usize,
    pub functions: Vec<FunctionRecord>,
    /// Target the entry stub was generated for
    pub format: ImageFormat,
}

impl CompiledProgram {
    pub fn entry(&self) -> Option<&FunctionRecord> {
        self.functions.iter().find(|f| f.is_entry)
    }

    pub fn function(&self, name: &str) -> Option<&FunctionRecord> {
        self.functions.iter().find(|f| f.name == name)
    }
}

/// Jump targets of the innermost enclosing loop
#[derive(Debug)]
struct LoopTargets {
    continue_label: String,
    break_label: String,
}

/// All state for lowering one translation unit
#[derive(Debug)]
pub struct LoweringContext<'a> {
    options: &'a CompileOptions,
    asm: Assembler,
    frame: FrameBuilder,
    arities: HashMap<String, usize>,
    functions: Vec<FunctionRecord>,
    loops: Vec<LoopTargets>,
    next_label: u32,
    /// Temporaries currently pushed by expression evaluation
    pushed: usize,
    current: String,
}

/// Lower a whole translation unit to linked machine code
pub fn lower(unit: &TranslationUnit, options: &CompileOptions) -> Result<CompiledProgram> {
    LoweringContext::new(options).lower_unit(unit)
}

impl<'a> LoweringContext<'a> {
    pub fn new(options: &'a CompileOptions) -> Self {
        Self {
            options,
            asm: Assembler::new(),
            frame: FrameBuilder::new(options.max_frame_size),
            arities: HashMap::new(),
            functions: Vec::new(),
            loops: Vec::new(),
            next_label: 0,
            pushed: 0,
            current: String::new(),
        }
    }

    pub fn lower_unit(mut self, unit: &TranslationUnit) -> Result<CompiledProgram> {
        self.collect_signatures(unit)?;

        self.emit_entry_stub()?;
        for func in &unit.functions {
            self.lower_function(func)?;
        }
        self.asm.resolve_all()?;

        let code = self.asm.code.into_code();
        let entry_offset = self
            .functions
            .iter()
            .find(|f| f.is_entry)
            .map(|f| f.start_offset)
            .ok_or_else(|| CodegenError::MissingEntryPoint {
                message: "entry stub was not emitted".to_string(),
            })?;
        debug!(
            "lowered {} function(s), {} bytes, entry at {:#x}",
            unit.functions.len(),
            code.len(),
            entry_offset
        );
        Ok(CompiledProgram {
            code,
            entry_offset,
            functions: self.functions,
            format: self.options.format,
        })
    }

    fn collect_signatures(&mut self, unit: &TranslationUnit) -> Result<()> {
        for func in &unit.functions {
            if func.params.len() > SYSV_ARG_REGS.len() {
                return Err(CodegenError::unsupported(
                    format!(
                        "'{}' has {} parameters, at most {} are supported",
                        func.name,
                        func.params.len(),
                        SYSV_ARG_REGS.len()
                    ),
                    Some(func.span),
                ));
            }
            if self.arities.insert(func.name.clone(), func.params.len()).is_some() {
                return Err(CodegenError::DuplicateLabel {
                    name: func.name.clone(),
                });
            }
        }

        match self.arities.get(MAIN_SYMBOL) {
            None => Err(CodegenError::MissingEntryPoint {
                message: format!("no function named '{}'", MAIN_SYMBOL),
            }),
            Some(&n) if n > 0 => Err(CodegenError::unsupported(
                format!("'{}' must not take parameters", MAIN_SYMBOL),
                unit.function(MAIN_SYMBOL).map(|f| f.span),
            )),
            Some(_) => Ok(()),
        }
    }

    /// Program entry: call main, hand its result to the OS
    fn emit_entry_stub(&mut self) -> Result<()> {
        let start = self.asm.define_label(ENTRY_SYMBOL)?;
        match self.options.format {
            ImageFormat::Elf64 => {
                self.asm.call(MAIN_SYMBOL)?;
                self.asm.code.mov_r64_r64(Reg64::RDI, ACCUMULATOR);
                self.asm.code.mov_r64_imm32(ACCUMULATOR, SYS_EXIT);
                self.asm.code.syscall();
            }
            ImageFormat::Pe64 => {
                // The loader's return address leaves RSP 8 off alignment.
                self.asm.code.sub_r64_imm32(STACK_POINTER, WIN64_STUB_FRAME);
                self.asm.call(MAIN_SYMBOL)?;
                self.asm.code.add_r64_imm32(STACK_POINTER, WIN64_STUB_FRAME);
                self.asm.code.ret();
            }
        }
        self.functions.push(FunctionRecord {
            name: ENTRY_SYMBOL.to_string(),
            start_offset: start,
            size: self.asm.offset() - start,
            stack_size: 0,
            is_entry: true,
        });
        Ok(())
    }

    fn lower_function(&mut self, func: &FunctionDef) -> Result<()> {
        self.current = func.name.clone();
        self.loops.clear();
        self.pushed = 0;

        let start = self.asm.define_label(&func.name)?;
        self.frame.enter_function(&func.name, &mut self.asm.code);

        for (param, reg) in func.params.iter().zip(SYSV_ARG_REGS) {
            let home = self.frame.allocate_slot(&param.name, SLOT_SIZE)?.mem();
            self.asm.code.mov_mem_r64(home, reg);
        }

        for stmt in &func.body {
            self.lower_stmt(stmt)?;
        }

        // Falling off the end returns 0.
        if !matches!(func.body.last(), Some(Stmt::Return { .. })) {
            self.asm.code.mov_r64_imm32(ACCUMULATOR, 0);
            FrameBuilder::exit_function(&mut self.asm.code);
        }

        let stack_size = self.frame.finish(&mut self.asm.code)?;
        let size = self.asm.offset() - start;
        debug!(
            "function {} at {:#x}: {} bytes, frame {}",
            func.name, start, size, stack_size
        );
        self.functions.push(FunctionRecord {
            name: func.name.clone(),
            start_offset: start,
            size,
            stack_size,
            is_entry: false,
        });
        Ok(())
    }

    fn fresh_label(&mut self, prefix: &str) -> String {
        let label = format!(".L{}{}", prefix, self.next_label);
        self.next_label += 1;
        label
    }

    // ==================== Statements ====================

    fn lower_stmt(&mut self, stmt: &Stmt) -> Result<()> {
        debug_assert_eq!(self.pushed, 0, "temporaries left on the stack");
        match stmt {
            Stmt::Expr { expr } => self.lower_expr(expr),
            Stmt::Decl { name, init, .. } => {
                let home = self.frame.allocate_slot(name, SLOT_SIZE)?.mem();
                if let Some(init) = init {
                    self.lower_expr(init)?;
                    self.asm.code.mov_mem_r64(home, ACCUMULATOR);
                }
                Ok(())
            }
            Stmt::Block { stmts } => {
                self.frame.push_scope();
                let result = stmts.iter().try_for_each(|s| self.lower_stmt(s));
                self.frame.pop_scope();
                result
            }
            Stmt::If {
                cond,
                then_branch,
                else_branch,
            } => self.lower_if(cond, then_branch, else_branch.as_deref()),
            Stmt::While { cond, body } => self.lower_while(cond, body),
            Stmt::For {
                init,
                cond,
                step,
                body,
            } => {
                self.frame.push_scope();
                let result = self.lower_for(init.as_deref(), cond.as_ref(), step.as_ref(), body);
                self.frame.pop_scope();
                result
            }
            Stmt::Return { value, .. } => {
                match value {
                    Some(value) => self.lower_expr(value)?,
                    None => {
                        self.asm.code.mov_r64_imm32(ACCUMULATOR, 0);
                    }
                }
                FrameBuilder::exit_function(&mut self.asm.code);
                Ok(())
            }
            Stmt::Break { span } => {
                let target = self.innermost_loop("break", *span)?.break_label.clone();
                self.asm.jmp(&target).map(drop)
            }
            Stmt::Continue { span } => {
                let target = self.innermost_loop("continue", *span)?.continue_label.clone();
                self.asm.jmp(&target).map(drop)
            }
        }
    }

    fn innermost_loop(&self, keyword: &str, span: Span) -> Result<&LoopTargets> {
        self.loops.last().ok_or_else(|| {
            CodegenError::unsupported(format!("'{}' outside of a loop", keyword), Some(span))
        })
    }

    /// Evaluate `cond` and set ZF when it is false
    fn lower_condition(&mut self, cond: &Expr) -> Result<()> {
        self.lower_expr(cond)?;
        self.asm.code.test_r64_r64(ACCUMULATOR, ACCUMULATOR);
        Ok(())
    }

    fn lower_if(&mut self, cond: &Expr, then_branch: &Stmt, else_branch: Option<&Stmt>) -> Result<()> {
        let else_or_end = self.fresh_label("else");
        self.lower_condition(cond)?;
        self.asm.jcc(Cond::Equal, &else_or_end)?;
        self.lower_stmt(then_branch)?;

        match else_branch {
            Some(else_branch) => {
                let end = self.fresh_label("endif");
                self.asm.jmp(&end)?;
                self.asm.define_label(&else_or_end)?;
                self.lower_stmt(else_branch)?;
                self.asm.define_label(&end)?;
            }
            None => {
                self.asm.define_label(&else_or_end)?;
            }
        }
        Ok(())
    }

    fn lower_while(&mut self, cond: &Expr, body: &Stmt) -> Result<()> {
        let start = self.fresh_label("loop");
        let end = self.fresh_label("endloop");

        self.asm.define_label(&start)?;
        self.lower_condition(cond)?;
        self.asm.jcc(Cond::Equal, &end)?;
        self.lower_loop_body(body, &start, &end)?;
        self.asm.jmp(&start)?;
        self.asm.define_label(&end)?;
        Ok(())
    }

    fn lower_for(
        &mut self,
        init: Option<&Stmt>,
        cond: Option<&Expr>,
        step: Option<&Expr>,
        body: &Stmt,
    ) -> Result<()> {
        let start = self.fresh_label("loop");
        let next = self.fresh_label("step");
        let end = self.fresh_label("endloop");

        if let Some(init) = init {
            self.lower_stmt(init)?;
        }
        self.asm.define_label(&start)?;
        // No condition loops until break or return.
        if let Some(cond) = cond {
            self.lower_condition(cond)?;
            self.asm.jcc(Cond::Equal, &end)?;
        }
        self.lower_loop_body(body, &next, &end)?;
        self.asm.define_label(&next)?;
        if let Some(step) = step {
            self.lower_expr(step)?;
        }
        self.asm.jmp(&start)?;
        self.asm.define_label(&end)?;
        Ok(())
    }

    fn lower_loop_body(&mut self, body: &Stmt, continue_label: &str, break_label: &str) -> Result<()> {
        self.loops.push(LoopTargets {
            continue_label: continue_label.to_string(),
            break_label: break_label.to_string(),
        });
        let result = self.lower_stmt(body);
        self.loops.pop();
        result
    }

    // ==================== Expressions ====================

    fn lower_expr(&mut self, expr: &Expr) -> Result<()> {
        match expr {
            Expr::IntLiteral { value } => {
                self.asm.code.mov_r64_imm(ACCUMULATOR, *value);
                Ok(())
            }
            Expr::Ident { name, span } => {
                let home = self.local(name, *span)?;
                self.asm.code.mov_r64_mem(ACCUMULATOR, home);
                Ok(())
            }
            Expr::Assign { name, value, span } => {
                self.lower_expr(value)?;
                let home = self.local(name, *span)?;
                self.asm.code.mov_mem_r64(home, ACCUMULATOR);
                Ok(())
            }
            Expr::Unary { op, operand, .. } => {
                self.lower_expr(operand)?;
                let code = &mut self.asm.code;
                match op {
                    UnaryOp::Neg => {
                        code.neg_r64(ACCUMULATOR);
                    }
                    UnaryOp::BitNot => {
                        code.not_r64(ACCUMULATOR);
                    }
                    UnaryOp::Not => {
                        code.test_r64_r64(ACCUMULATOR, ACCUMULATOR);
                        code.setcc(Cond::Equal, ACCUMULATOR);
                        code.movzx_r64_r8(ACCUMULATOR, ACCUMULATOR);
                    }
                }
                Ok(())
            }
            Expr::Binary { op, lhs, rhs, .. } => match op {
                BinaryOp::LogicalAnd | BinaryOp::LogicalOr => self.lower_logical(*op, lhs, rhs),
                _ => self.lower_binary(*op, lhs, rhs),
            },
            Expr::Call { callee, args, span } => self.lower_call(callee, args, *span),
        }
    }

    /// Home of `name`, allocating one on first use unless strict locals are on
    fn local(&mut self, name: &str, span: Span) -> Result<Mem> {
        if let Some(slot) = self.frame.lookup(name) {
            return Ok(slot.mem());
        }
        if self.options.strict_locals {
            return Err(CodegenError::UndefinedVariable {
                name: name.to_string(),
                span: Some(span),
            });
        }
        warn!(
            "{}: '{}' used in '{}' without a declaration; allocating a local",
            span, name, self.current
        );
        Ok(self.frame.allocate_function_slot(name, SLOT_SIZE)?.mem())
    }

    fn push_accumulator(&mut self) {
        self.asm.code.push_r64(ACCUMULATOR);
        self.pushed += 1;
    }

    fn pop_into(&mut self, reg: Reg64) {
        self.asm.code.pop_r64(reg);
        self.pushed -= 1;
    }

    /// Left operand ends up in RCX, right operand in RAX, result in RAX.
    fn lower_binary(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Result<()> {
        self.lower_expr(lhs)?;
        self.push_accumulator();
        self.lower_expr(rhs)?;
        self.pop_into(SCRATCH);

        let code = &mut self.asm.code;
        match op {
            BinaryOp::Add => {
                code.add_r64_r64(ACCUMULATOR, SCRATCH);
            }
            BinaryOp::Mul => {
                code.imul_r64_r64(ACCUMULATOR, SCRATCH);
            }
            BinaryOp::BitAnd => {
                code.and_r64_r64(ACCUMULATOR, SCRATCH);
            }
            BinaryOp::BitOr => {
                code.or_r64_r64(ACCUMULATOR, SCRATCH);
            }
            BinaryOp::BitXor => {
                code.xor_r64_r64(ACCUMULATOR, SCRATCH);
            }
            BinaryOp::Sub => {
                code.sub_r64_r64(SCRATCH, ACCUMULATOR);
                code.mov_r64_r64(ACCUMULATOR, SCRATCH);
            }
            BinaryOp::Div | BinaryOp::Mod => {
                code.mov_r64_r64(AUX, ACCUMULATOR);
                code.mov_r64_r64(ACCUMULATOR, SCRATCH);
                code.cqo();
                code.idiv_r64(AUX);
                if op == BinaryOp::Mod {
                    code.mov_r64_r64(ACCUMULATOR, Reg64::RDX);
                }
            }
            BinaryOp::Shl | BinaryOp::Shr => {
                // The count has to be in CL.
                code.mov_r64_r64(AUX, SCRATCH);
                code.mov_r64_r64(SCRATCH, ACCUMULATOR);
                if op == BinaryOp::Shl {
                    code.shl_r64_cl(AUX);
                } else {
                    code.sar_r64_cl(AUX);
                }
                code.mov_r64_r64(ACCUMULATOR, AUX);
            }
            BinaryOp::Eq
            | BinaryOp::Ne
            | BinaryOp::Lt
            | BinaryOp::Le
            | BinaryOp::Gt
            | BinaryOp::Ge => {
                let cond = comparison(op);
                code.cmp_r64_r64(SCRATCH, ACCUMULATOR);
                code.setcc(cond, ACCUMULATOR);
                code.movzx_r64_r8(ACCUMULATOR, ACCUMULATOR);
            }
            BinaryOp::LogicalAnd | BinaryOp::LogicalOr => {
                return Err(CodegenError::Encoding {
                    message: format!("'{}' must be lowered with short-circuiting", op),
                });
            }
        }
        Ok(())
    }

    /// `&&` jumps out on the first zero, `||` on the first non-zero
    fn lower_logical(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Result<()> {
        let (exit_when, exit_value) = if op == BinaryOp::LogicalAnd {
            (Cond::Equal, 0)
        } else {
            (Cond::NotEqual, 1)
        };
        let short = self.fresh_label("short");
        let end = self.fresh_label("endlogic");

        self.lower_condition(lhs)?;
        self.asm.jcc(exit_when, &short)?;
        self.lower_condition(rhs)?;
        self.asm.jcc(exit_when, &short)?;
        self.asm.code.mov_r64_imm32(ACCUMULATOR, 1 - exit_value);
        self.asm.jmp(&end)?;
        self.asm.define_label(&short)?;
        self.asm.code.mov_r64_imm32(ACCUMULATOR, exit_value);
        self.asm.define_label(&end)?;
        Ok(())
    }

    /// Direct call to a function of this unit, System V register arguments
    fn lower_call(&mut self, callee: &str, args: &[Expr], span: Span) -> Result<()> {
        let arity = self.arities.get(callee).copied().ok_or_else(|| {
            CodegenError::unsupported(format!("call to unknown function '{}'", callee), Some(span))
        })?;
        if args.len() != arity {
            return Err(CodegenError::unsupported(
                format!(
                    "'{}' takes {} argument(s) but {} were given",
                    callee,
                    arity,
                    args.len()
                ),
                Some(span),
            ));
        }

        for arg in args {
            self.lower_expr(arg)?;
            self.push_accumulator();
        }
        for &reg in SYSV_ARG_REGS[..args.len()].iter().rev() {
            self.pop_into(reg);
        }

        // Keep RSP 16-byte aligned at the call while temporaries are pending.
        let misaligned = self.pushed % 2 == 1;
        if misaligned {
            self.asm.code.sub_r64_imm32(STACK_POINTER, 8);
        }
        self.asm.call(callee)?;
        if misaligned {
            self.asm.code.add_r64_imm32(STACK_POINTER, 8);
        }
        Ok(())
    }
}

fn comparison(op: BinaryOp) -> Cond {
    match op {
        BinaryOp::Eq => Cond::Equal,
        BinaryOp::Ne => Cond::NotEqual,
        BinaryOp::Lt => Cond::Less,
        BinaryOp::Le => Cond::LessEqual,
        BinaryOp::Gt => Cond::Greater,
        _ => Cond::GreaterEqual,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BinaryOp as B, Expr as E, FunctionDef, Stmt as S};

    fn unit(body: Vec<S>) -> TranslationUnit {
        TranslationUnit::new(vec![FunctionDef::new("main", &[], body)])
    }

    fn lower_default(unit: &TranslationUnit) -> Result<CompiledProgram> {
        lower(unit, &CompileOptions::default())
    }

    #[test]
    fn test_return_42_exact_bytes() {
        let program = lower_default(&unit(vec![S::ret(E::int(42))])).unwrap();
        #[rustfmt::skip]
        let expected: Vec<u8> = vec![
            // _start
            0xE8, 0x0C, 0x00, 0x00, 0x00,             // call main
            0x48, 0x89, 0xC7,                         // mov rdi, rax
            0x48, 0xC7, 0xC0, 0x3C, 0x00, 0x00, 0x00, // mov rax, 60
            0x0F, 0x05,                               // syscall
            // main
            0x55,                                     // push rbp
            0x48, 0x89, 0xE5,                         // mov rbp, rsp
            0x48, 0x81, 0xEC, 0x00, 0x00, 0x00, 0x00, // sub rsp, 0
            0x48, 0xC7, 0xC0, 0x2A, 0x00, 0x00, 0x00, // mov rax, 42
            0x48, 0x89, 0xEC,                         // mov rsp, rbp
            0x5D,                                     // pop rbp
            0xC3,                                     // ret
        ];
        assert_eq!(program.code, expected);
        assert_eq!(program.entry_offset, 0);
        let main = program.function("main").unwrap();
        assert_eq!(main.start_offset, 17);
        assert_eq!(main.size, 23);
        assert!(!main.is_entry);
        assert_eq!(program.entry().unwrap().name, ENTRY_SYMBOL);
    }

    #[test]
    fn test_pe_entry_stub() {
        let options = CompileOptions::default().format(ImageFormat::Pe64);
        let program = lower(&unit(vec![S::ret(E::int(0))]), &options).unwrap();
        assert_eq!(&program.code[..7], &[0x48, 0x81, 0xEC, 0x28, 0x00, 0x00, 0x00]);
        assert_eq!(program.code[7], 0xE8);
        assert_eq!(&program.code[12..20], &[0x48, 0x81, 0xC4, 0x28, 0x00, 0x00, 0x00, 0xC3]);
        assert_eq!(program.format, ImageFormat::Pe64);
    }

    #[test]
    fn test_implicit_return_zero() {
        let program = lower_default(&unit(vec![S::decl("x", Some(E::int(1)))])).unwrap();
        let tail = &program.code[program.code.len() - 12..];
        assert_eq!(
            tail,
            &[0x48, 0xC7, 0xC0, 0x00, 0x00, 0x00, 0x00, 0x48, 0x89, 0xEC, 0x5D, 0xC3]
        );
        assert_eq!(program.function("main").unwrap().stack_size, 16);
    }

    #[test]
    fn test_bare_return_loads_zero() {
        let program = lower_default(&unit(vec![S::ret_void()])).unwrap();
        let main = program.function("main").unwrap();
        let body = &program.code[main.start_offset + 11..main.start_offset + main.size];
        assert_eq!(
            body,
            &[0x48, 0xC7, 0xC0, 0x00, 0x00, 0x00, 0x00, 0x48, 0x89, 0xEC, 0x5D, 0xC3]
        );
    }

    #[test]
    fn test_for_without_condition_has_no_exit_test() {
        let program = lower_default(&unit(vec![S::for_(None, None, None, S::break_())])).unwrap();
        let main = program.function("main").unwrap();
        let body = &program.code[main.start_offset..main.start_offset + main.size];
        // no `test rax, rax`: only the break leaves the loop
        assert!(!body.windows(3).any(|w| w == [0x48, 0x85, 0xC0]));
        // jmp .Lendloop (break) then jmp .Lloop (back edge)
        assert_eq!(&body[11..16], &[0xE9, 0x05, 0x00, 0x00, 0x00]);
        assert_eq!(&body[16..21], &[0xE9, 0xF6, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_every_return_gets_an_epilogue() {
        let program = lower_default(&unit(vec![
            S::if_(E::int(1), S::ret(E::int(1)), Some(S::ret(E::int(2)))),
            S::ret(E::int(3)),
        ]))
        .unwrap();
        let epilogue = [0x48, 0x89, 0xEC, 0x5D, 0xC3];
        let count = program.code.windows(epilogue.len()).filter(|w| *w == epilogue).count();
        assert_eq!(count, 3);
    }

    #[test]
    fn test_sibling_ifs_do_not_collide() {
        let cond = || E::binary(B::Eq, E::ident("x"), E::int(0));
        let program = lower_default(&unit(vec![
            S::decl("x", Some(E::int(0))),
            S::if_(cond(), S::expr(E::assign("x", E::int(1))), None),
            S::if_(cond(), S::expr(E::assign("x", E::int(2))), Some(S::block(vec![]))),
            S::ret(E::ident("x")),
        ]));
        assert!(program.is_ok());
    }

    #[test]
    fn test_lowering_is_deterministic() {
        let ast = unit(vec![
            S::decl("i", Some(E::int(0))),
            S::while_(
                E::binary(B::Lt, E::ident("i"), E::int(5)),
                S::expr(E::assign("i", E::binary(B::Add, E::ident("i"), E::int(1)))),
            ),
            S::ret(E::ident("i")),
        ]);
        let first = lower_default(&ast).unwrap();
        let second = lower_default(&ast).unwrap();
        assert_eq!(first.code, second.code);
        assert_eq!(first.functions, second.functions);
    }

    #[test]
    fn test_auto_vivified_local_by_default() {
        let program = lower_default(&unit(vec![
            S::expr(E::assign("y", E::int(7))),
            S::ret(E::ident("y")),
        ]))
        .unwrap();
        assert_eq!(program.function("main").unwrap().stack_size, 16);
    }

    #[test]
    fn test_strict_locals_rejects_undeclared() {
        let options = CompileOptions::default().strict_locals(true);
        let ast = unit(vec![S::ret(E::Ident {
            name: "cnt".into(),
            span: Span::new(2, 12),
        })]);
        let err = lower(&ast, &options).unwrap_err();
        assert!(matches!(
            err,
            CodegenError::UndefinedVariable { ref name, span: Some(span) }
                if name == "cnt" && span == Span::new(2, 12)
        ));
    }

    #[test]
    fn test_missing_main() {
        let ast = TranslationUnit::new(vec![FunctionDef::new("helper", &[], vec![])]);
        assert!(matches!(
            lower_default(&ast),
            Err(CodegenError::MissingEntryPoint { .. })
        ));
    }

    #[test]
    fn test_duplicate_function() {
        let ast = TranslationUnit::new(vec![
            FunctionDef::new("main", &[], vec![]),
            FunctionDef::new("main", &[], vec![]),
        ]);
        assert!(matches!(
            lower_default(&ast),
            Err(CodegenError::DuplicateLabel { ref name }) if name == "main"
        ));
    }

    #[test]
    fn test_break_outside_loop() {
        let err = lower_default(&unit(vec![S::break_()])).unwrap_err();
        assert!(matches!(err, CodegenError::UnsupportedConstruct { .. }));
    }

    #[test]
    fn test_call_checks() {
        let unknown = unit(vec![S::ret(E::call("printf", vec![]))]);
        assert!(matches!(
            lower_default(&unknown),
            Err(CodegenError::UnsupportedConstruct { .. })
        ));

        let wrong_arity = TranslationUnit::new(vec![
            FunctionDef::new("id", &["x"], vec![S::ret(E::ident("x"))]),
            FunctionDef::new("main", &[], vec![S::ret(E::call("id", vec![]))]),
        ]);
        assert!(matches!(
            lower_default(&wrong_arity),
            Err(CodegenError::UnsupportedConstruct { .. })
        ));

        let params: Vec<String> = (0..7).map(|i| format!("p{}", i)).collect();
        let names: Vec<&str> = params.iter().map(String::as_str).collect();
        let too_many = TranslationUnit::new(vec![
            FunctionDef::new("wide", &names, vec![]),
            FunctionDef::new("main", &[], vec![]),
        ]);
        assert!(matches!(
            lower_default(&too_many),
            Err(CodegenError::UnsupportedConstruct { .. })
        ));
    }

    #[test]
    fn test_forward_call_and_param_spill() {
        let ast = TranslationUnit::new(vec![
            FunctionDef::new("main", &[], vec![S::ret(E::call("add", vec![E::int(1), E::int(2)]))]),
            FunctionDef::new(
                "add",
                &["a", "b"],
                vec![S::ret(E::binary(B::Add, E::ident("a"), E::ident("b")))],
            ),
        ]);
        let program = lower_default(&ast).unwrap();
        let add = program.function("add").unwrap();
        assert_eq!(add.stack_size, 16);
        // mov [rbp-8], rdi; mov [rbp-16], rsi right after the prologue
        let spill = &program.code[add.start_offset + 11..add.start_offset + 19];
        assert_eq!(spill, &[0x48, 0x89, 0x7D, 0xF8, 0x48, 0x89, 0x75, 0xF0]);
    }

    #[test]
    fn test_call_with_pending_temporary_realigns_stack() {
        let ast = TranslationUnit::new(vec![
            FunctionDef::new("one", &[], vec![S::ret(E::int(1))]),
            FunctionDef::new(
                "main",
                &[],
                vec![S::ret(E::binary(B::Add, E::int(1), E::call("one", vec![])))],
            ),
        ]);
        let program = lower_default(&ast).unwrap();
        let main = program.function("main").unwrap();
        let body = &program.code[main.start_offset..main.start_offset + main.size];
        let realign = [0x48, 0x81, 0xEC, 0x08, 0x00, 0x00, 0x00];
        assert!(body.windows(realign.len()).any(|w| w == realign));
    }

    #[test]
    fn test_frame_overflow_is_reported() {
        let options = CompileOptions::default().max_frame_size(16);
        let ast = unit(vec![
            S::decl("a", None),
            S::decl("b", None),
            S::decl("c", None),
        ]);
        assert!(matches!(
            lower(&ast, &options),
            Err(CodegenError::FrameOverflow { .. })
        ));
    }
}
