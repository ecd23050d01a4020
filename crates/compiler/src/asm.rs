//! x86-64 System V assembly emission from TAC
//!
//! Register-conservative: every ordinary temporary lives in a stack slot,
//! `%r10` is the working scratch, `%r11`/`%r12` alternate for static-link
//! walks so two captured operands in one instruction cannot clobber each
//! other. Callee-saved registers are never touched.
//!
//! Frame layout, per procedure:
//!
//! ```text
//!  16(%rbp)  stack-passed arguments (7th onward)
//!   8(%rbp)  return address
//!   0(%rbp)  saved %rbp
//!  -8(%rbp)  incoming static link (stored by the flagged prologue copy)
//! -16(%rbp)  slot 0, then slot 1 at -24, ...
//! ```
//!
//! Slot indices are assigned densely in order of first appearance during a
//! pre-pass over each body, so deleting a temporary in the optimizer can
//! never skew another temporary's address.

use crate::error::{CompileError, ErrorKind, Result};
use crate::lower::Context;
use crate::tac::{Instr, Opcode, Temp, is_global, is_ordinary, is_param};
use std::collections::HashMap;
use tracing::debug;

const ARG_REGISTERS: [&str; 6] = ["%rdi", "%rsi", "%rdx", "%rcx", "%r8", "%r9"];

pub struct Assembler<'a> {
    ctx: &'a Context,
    instr: &'a [Instr],
    out: String,
    /// proc name -> (temp -> dense slot index)
    slots: HashMap<String, HashMap<Temp, usize>>,
    /// temp -> name of the procedure defining it
    func_of_temp: HashMap<Temp, String>,
    /// proc name -> linker-visible symbol
    asm_name: HashMap<String, String>,
    /// proc name -> declared parameter slot count
    param_slots: HashMap<String, usize>,
    current_func: String,
    args_on_stack: usize,
    /// alternates the static-link scratch between %r11 and %r12
    link_scratch_flip: bool,
}

/// Assemble the whole program to GAS-syntax text.
pub fn assemble(ctx: &Context, instr: &[Instr]) -> Result<String> {
    Assembler::new(ctx, instr).run()
}

impl<'a> Assembler<'a> {
    pub fn new(ctx: &'a Context, instr: &'a [Instr]) -> Self {
        Assembler {
            ctx,
            instr,
            out: String::new(),
            slots: HashMap::new(),
            func_of_temp: HashMap::new(),
            asm_name: HashMap::new(),
            param_slots: HashMap::new(),
            current_func: String::new(),
            args_on_stack: 0,
            link_scratch_flip: false,
        }
    }

    pub fn run(mut self) -> Result<String> {
        self.emit_globals()?;
        self.build_maps()?;

        for &(start, finish) in &self.ctx.procs {
            let name = self.proc_name(start)?;
            let symbol = self.asm_name[&name].clone();
            self.emit("");
            self.emit(format!("\t.globl {}", symbol));
            self.emit("\t.text");
            self.emit(format!("{}:", symbol));
            self.assemble_proc(&name, start, finish)?;
        }

        debug!(bytes = self.out.len(), "assembly emitted");
        Ok(self.out)
    }

    fn emit(&mut self, line: impl AsRef<str>) {
        self.out.push_str(line.as_ref());
        self.out.push('\n');
    }

    fn proc_name(&self, start: usize) -> Result<String> {
        self.instr[start].result.clone().ok_or_else(|| {
            CompileError::new(ErrorKind::Codegen, "proc instruction without a name")
        })
    }

    fn emit_globals(&mut self) -> Result<()> {
        for tac in &self.ctx.globals {
            let Some(result) = &tac.result else {
                return Err(CompileError::new(
                    ErrorKind::Codegen,
                    "global initializer without a target",
                ));
            };
            let name = result.trim_start_matches('@');
            self.emit(format!("\t.globl {}", name));
            self.emit("\t.data");
            self.emit(format!("{}:\t.quad {}", name, tac.args[0]));
        }
        Ok(())
    }

    /// First pass: linker symbols, defining procedure of each temporary,
    /// and dense per-procedure slot indices.
    fn build_maps(&mut self) -> Result<()> {
        for (count, &(start, finish)) in self.ctx.procs.iter().enumerate() {
            let name = self.proc_name(start)?;

            let symbol = if name == "main" {
                "main".to_string()
            } else {
                format!("{}{}", name.replace(':', "_"), count + 1)
            };
            self.asm_name.insert(name.clone(), symbol);
            self.param_slots
                .insert(name.clone(), self.instr[start].args.len() + 1);

            for tac in &self.instr[start + 1..=finish] {
                if let Some(result) = &tac.result
                    && is_ordinary(result)
                {
                    self.func_of_temp
                        .entry(result.clone())
                        .or_insert_with(|| name.clone());
                }
            }
        }

        // Slots are per defining procedure; an operand that belongs to an
        // enclosing procedure is addressed through that procedure's table.
        for &(start, finish) in &self.ctx.procs {
            let name = self.proc_name(start)?;
            let mut table: HashMap<Temp, usize> = HashMap::new();
            for tac in &self.instr[start + 1..=finish] {
                for operand in tac.args.iter().chain(tac.result.iter()) {
                    if is_ordinary(operand)
                        && self.func_of_temp.get(operand) == Some(&name)
                        && !table.contains_key(operand)
                    {
                        table.insert(operand.clone(), table.len());
                    }
                }
            }
            self.slots.insert(name, table);
        }
        Ok(())
    }

    fn assemble_proc(&mut self, name: &str, start: usize, finish: usize) -> Result<()> {
        self.current_func = name.to_string();
        self.args_on_stack = 0;

        let slot_count = self.slots[name].len();
        let params = self.param_slots[name];
        let mut stack_size = slot_count + 2 + params;
        stack_size = (stack_size + 1) / 2 * 2;

        self.emit("\tpushq %rbp");
        self.emit("\tmovq %rsp, %rbp");
        self.emit(format!("\tsubq ${}, %rsp", 8 * stack_size));

        let instr = self.instr;
        for tac in &instr[start + 1..=finish] {
            self.assemble_instr(tac)?;
        }
        Ok(())
    }

    /// Memory or register operand for a TAC operand, emitting static-link
    /// walk code when the temporary belongs to an enclosing procedure.
    fn operand(&mut self, temp: &str) -> Result<String> {
        if is_global(temp) {
            return Ok(format!("{}(%rip)", temp.trim_start_matches('@')));
        }

        if is_param(temp) {
            let index: usize = temp[2..].parse().map_err(|_| {
                CompileError::new(
                    ErrorKind::Codegen,
                    format!("malformed parameter temporary '{}'", temp),
                )
            })?;
            return Ok(if index < 6 {
                ARG_REGISTERS[index].to_string()
            } else {
                format!("{}(%rbp)", 8 * (index - 6 + 2))
            });
        }

        if !is_ordinary(temp) {
            return Err(CompileError::new(
                ErrorKind::Codegen,
                format!("'{}' cannot be materialized as an operand", temp),
            ));
        }

        let owner = self.func_of_temp.get(temp).cloned().ok_or_else(|| {
            CompileError::new(
                ErrorKind::Codegen,
                format!("temporary '{}' has no defining procedure", temp),
            )
        })?;
        let slot = self.slots[&owner][temp];

        if owner == self.current_func {
            return Ok(format!("-{}(%rbp)", 8 * (slot + 2)));
        }

        // Captured: the owner must be a lexical ancestor. Walk the static
        // link chain one hop per nesting level.
        let current_depth = self.current_func.split("::").count();
        let owner_depth = owner.split("::").count();
        let is_ancestor = self
            .current_func
            .starts_with(&format!("{}::", owner));
        if !is_ancestor || owner_depth >= current_depth {
            return Err(CompileError::new(
                ErrorKind::Codegen,
                format!(
                    "temporary '{}' of '{}' is not reachable from '{}'",
                    temp, owner, self.current_func
                ),
            ));
        }
        let delta = current_depth - owner_depth;

        let scratch = if self.link_scratch_flip { "%r12" } else { "%r11" };
        self.link_scratch_flip = !self.link_scratch_flip;

        self.emit(format!("\tmovq -8(%rbp), {}", scratch));
        for _ in 1..delta {
            self.emit(format!("\tmovq -8({0}), {0}", scratch));
        }
        Ok(format!("-{}({})", 8 * (slot + 2), scratch))
    }

    fn assemble_instr(&mut self, tac: &Instr) -> Result<()> {
        match tac.opcode {
            Opcode::Label => {
                self.emit(format!("{}:", tac.args[0].trim_start_matches('%')));
            }
            Opcode::Const => {
                let dst = self.operand(self.result(tac)?)?;
                let value = &tac.args[0];
                match value.parse::<i64>() {
                    Ok(n) if i32::try_from(n).is_ok() => {
                        self.emit(format!("\tmovq ${}, {}", n, dst));
                    }
                    Ok(n) => {
                        // 64-bit immediates cannot go straight to memory
                        self.emit(format!("\tmovabsq ${}, %r10", n));
                        self.emit(format!("\tmovq %r10, {}", dst));
                    }
                    Err(_) => {
                        // a code pointer: resolve through the symbol map
                        let symbol = self
                            .asm_name
                            .get(value)
                            .cloned()
                            .unwrap_or_else(|| value.clone());
                        self.emit(format!("\tmovq ${}, {}", symbol, dst));
                    }
                }
            }
            Opcode::Copy => {
                let src = self.operand(&tac.args[0])?;
                // the flagged two-argument form stores the incoming static
                // link at its fixed frame slot
                let dst = if tac.args.len() == 2 {
                    "-8(%rbp)".to_string()
                } else {
                    self.operand(self.result(tac)?)?
                };
                self.emit(format!("\tmovq {}, %r10", src));
                self.emit(format!("\tmovq %r10, {}", dst));
            }
            Opcode::Add | Opcode::Sub | Opcode::And | Opcode::Or | Opcode::Xor => {
                let mnemonic = match tac.opcode {
                    Opcode::Add => "addq",
                    Opcode::Sub => "subq",
                    Opcode::And => "andq",
                    Opcode::Or => "orq",
                    _ => "xorq",
                };
                let lhs = self.operand(&tac.args[0])?;
                let rhs = self.operand(&tac.args[1])?;
                let dst = self.operand(self.result(tac)?)?;
                self.emit(format!("\tmovq {}, %r10", lhs));
                self.emit(format!("\t{} {}, %r10", mnemonic, rhs));
                self.emit(format!("\tmovq %r10, {}", dst));
            }
            Opcode::Neg | Opcode::Not => {
                let mnemonic = if tac.opcode == Opcode::Neg {
                    "negq"
                } else {
                    "notq"
                };
                let src = self.operand(&tac.args[0])?;
                let dst = self.operand(self.result(tac)?)?;
                self.emit(format!("\tmovq {}, %r10", src));
                self.emit(format!("\t{} %r10", mnemonic));
                self.emit(format!("\tmovq %r10, {}", dst));
            }
            Opcode::Mul => {
                let lhs = self.operand(&tac.args[0])?;
                let rhs = self.operand(&tac.args[1])?;
                let dst = self.operand(self.result(tac)?)?;
                self.emit(format!("\tmovq {}, %rax", lhs));
                self.emit(format!("\tmovq {}, %r10", rhs));
                self.emit("\timulq %r10");
                self.emit(format!("\tmovq %rax, {}", dst));
            }
            Opcode::Div | Opcode::Mod => {
                let lhs = self.operand(&tac.args[0])?;
                let rhs = self.operand(&tac.args[1])?;
                let dst = self.operand(self.result(tac)?)?;
                // the divisor goes through %r10: cqto clobbers %rdx, which
                // may hold an argument register operand
                self.emit(format!("\tmovq {}, %rax", lhs));
                self.emit(format!("\tmovq {}, %r10", rhs));
                self.emit("\tcqto");
                self.emit("\tidivq %r10");
                let result_reg = if tac.opcode == Opcode::Div {
                    "%rax"
                } else {
                    "%rdx"
                };
                self.emit(format!("\tmovq {}, {}", result_reg, dst));
            }
            Opcode::Shl | Opcode::Shr => {
                let mnemonic = if tac.opcode == Opcode::Shl {
                    "salq"
                } else {
                    "sarq"
                };
                let lhs = self.operand(&tac.args[0])?;
                let rhs = self.operand(&tac.args[1])?;
                let dst = self.operand(self.result(tac)?)?;
                // value before count: the count clobbers %rcx, which may be
                // the register holding the value operand
                self.emit(format!("\tmovq {}, %r10", lhs));
                self.emit(format!("\tmovq {}, %rcx", rhs));
                self.emit(format!("\t{} %cl, %r10", mnemonic));
                self.emit(format!("\tmovq %r10, {}", dst));
            }
            Opcode::Jmp => {
                let target = tac.jmp_target().ok_or_else(|| {
                    CompileError::new(ErrorKind::Codegen, "jmp without a target")
                })?;
                self.emit(format!("\tjmp {}", target.trim_start_matches('%')));
            }
            Opcode::Jz | Opcode::Jnz | Opcode::Jl | Opcode::Jle | Opcode::Jg | Opcode::Jge => {
                let src = self.operand(&tac.args[0])?;
                let target = self.result(tac)?.trim_start_matches('%').to_string();
                self.emit(format!("\tcmpq $0, {}", src));
                self.emit(format!("\t{} {}", tac.opcode.as_str(), target));
            }
            Opcode::Param => {
                let index: usize = self.result(tac)?.parse().map_err(|_| {
                    CompileError::new(ErrorKind::Codegen, "param with a non-numeric index")
                })?;
                let src = self.operand(&tac.args[0])?;
                if index <= 6 {
                    self.emit(format!("\tmovq {}, {}", src, ARG_REGISTERS[index - 1]));
                } else {
                    // params arrive highest index first; pad once up front
                    // so the stack stays 16-byte aligned at the call
                    if self.args_on_stack == 0 && (index - 6) % 2 == 1 {
                        self.emit("\tsubq $8, %rsp");
                        self.args_on_stack = 1;
                    }
                    self.emit(format!("\tpushq {}", src));
                    self.args_on_stack += 1;
                }
            }
            Opcode::Call => {
                let code_ptr = self.operand(&tac.args[0])?;
                self.emit(format!("\tcall *{}", code_ptr));
                if self.args_on_stack > 0 {
                    let pop = (self.args_on_stack + 1) / 2 * 2;
                    self.emit(format!("\taddq ${}, %rsp", 8 * pop));
                    self.args_on_stack = 0;
                }
                if let Some(result) = &tac.result {
                    let dst = self.operand(result)?;
                    self.emit(format!("\tmovq %rax, {}", dst));
                }
            }
            Opcode::Ret => {
                if let Some(value) = tac.args.first() {
                    let src = self.operand(value)?;
                    self.emit(format!("\tmovq {}, %rax", src));
                } else {
                    self.emit("\tmovq $0, %rax");
                }
                self.emit("\tmovq %rbp, %rsp");
                self.emit("\tpopq %rbp");
                self.emit("\tretq");
            }
            Opcode::GetFp => {
                let dst = self.operand(self.result(tac)?)?;
                self.emit("\tmovq %rbp, %r10");
                self.emit(format!("\tmovq %r10, {}", dst));
            }
            Opcode::Proc => {}
        }
        Ok(())
    }

    fn result<'t>(&self, tac: &'t Instr) -> Result<&'t Temp> {
        tac.result.as_ref().ok_or_else(|| {
            CompileError::new(
                ErrorKind::Codegen,
                format!("'{}' instruction is missing its result", tac.opcode),
            )
        })
    }
}
