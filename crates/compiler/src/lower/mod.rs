//! Lowering from the typed AST to three-address code
//!
//! The lowerer ("muncher") walks a type-checked program and emits a flat TAC
//! sequence: global initializers first, then one contiguous run of
//! instructions per procedure, each delimited by a `proc` pseudo-instruction
//! and ending in `ret`. Nested `def`s are hoisted: their closure value (code
//! pointer + frame pointer) is built in the enclosing block, while the body
//! is lowered into a deferred queue appended after the top-level code.
//!
//! Expressions lower in two modes. Value mode produces a temporary holding
//! the result; boolean mode is threaded on a `(true, false)` label pair and
//! never materializes a value, which is what makes `&&`/`||` short-circuit
//! for free. A boolean needed as data goes through boolean mode against
//! fresh labels with 1/0 written at the join.

mod expr;
mod stmt;

use crate::ast::{Decl, ExprKind, FuncDecl, Program};
use crate::error::{CompileError, ErrorKind, Result};
use crate::scope::ScopeStack;
use crate::tac::{Instr, Opcode, Temp};
use crate::types::Type;
use std::collections::VecDeque;
use tracing::debug;

/// Suffix distinguishing the static-link binding that accompanies every
/// function-valued name in scope.
pub const STATIC_LINK_SUFFIX: &str = "$static_link";

/// Marker argument on the prologue copy that saves the incoming static
/// link; the assembler stores such copies at `-8(%rbp)` and the optimizer
/// never deletes them.
pub const STATIC_LINK_FLAG: &str = "static_link_flag";

/// Runtime symbols behind the `print` builtin.
pub const PRINT_INT: &str = "__bx_print_int";
pub const PRINT_BOOL: &str = "__bx_print_bool";

/// Mutable lowering state: fresh-name counters, label stacks, the scope
/// stack, the deferred-lambda queue, and (after [`Context::process`]) the
/// per-procedure index ranges used by the CFG builder and the assembler.
#[derive(Debug, Default)]
pub struct Context {
    temp_counter: usize,
    label_counter: usize,
    param_counter: usize,
    lambda_counter: usize,
    func_handle_counter: usize,
    pub scopes: ScopeStack,
    break_points: Vec<Temp>,
    continue_points: Vec<Temp>,
    /// Qualified (`::`-joined) names of the enclosing functions, innermost
    /// last.
    func_stack: Vec<String>,
    /// Lowered lambda bodies waiting to be appended after top-level code.
    deferred: VecDeque<Vec<Instr>>,
    /// TAC entries before any `proc` (global initializers).
    pub globals: Vec<Instr>,
    /// Inclusive `[start, finish]` index ranges, one per procedure; `start`
    /// points at the `proc` instruction.
    pub procs: Vec<(usize, usize)>,
}

impl Context {
    pub fn new() -> Self {
        Context::default()
    }

    pub fn new_temp(&mut self) -> Temp {
        let t = format!("%{}", self.temp_counter);
        self.temp_counter += 1;
        t
    }

    pub fn new_label(&mut self) -> Temp {
        let l = format!("%.L{}", self.label_counter);
        self.label_counter += 1;
        l
    }

    fn new_param(&mut self) -> Temp {
        let p = format!("%p{}", self.param_counter);
        self.param_counter += 1;
        p
    }

    fn new_func_handle(&mut self) -> Temp {
        let h = format!("#{}", self.func_handle_counter);
        self.func_handle_counter += 1;
        h
    }

    fn next_lambda_index(&mut self) -> usize {
        let i = self.lambda_counter;
        self.lambda_counter += 1;
        i
    }

    pub fn push_break_point(&mut self, label: Temp) {
        self.break_points.push(label);
    }

    pub fn pop_break_point(&mut self) {
        self.break_points.pop();
    }

    pub fn break_point(&self) -> Option<&Temp> {
        self.break_points.last()
    }

    pub fn push_continue_point(&mut self, label: Temp) {
        self.continue_points.push(label);
    }

    pub fn pop_continue_point(&mut self) {
        self.continue_points.pop();
    }

    pub fn continue_point(&self) -> Option<&Temp> {
        self.continue_points.last()
    }

    /// Qualified name of the function currently being lowered.
    pub fn qualified_name(&self) -> String {
        self.func_stack.last().cloned().unwrap_or_default()
    }

    /// Rebuild the `globals`/`procs` indexing from a flat TAC sequence.
    /// Called after lowering and again after every optimization pass.
    pub fn process(&mut self, instr: &[Instr]) {
        self.globals.clear();
        self.procs.clear();

        let mut first_proc = instr.len();
        for (i, tac) in instr.iter().enumerate() {
            if tac.opcode == Opcode::Proc {
                first_proc = i;
                break;
            }
            self.globals.push(tac.clone());
        }

        let mut start = first_proc;
        for i in first_proc + 1..instr.len() {
            if instr[i].opcode == Opcode::Proc {
                self.procs.push((start, i - 1));
                start = i;
            }
        }
        if start < instr.len() {
            self.procs.push((start, instr.len() - 1));
        }
    }
}

/// Lower a type-checked program to a flat TAC sequence and the context
/// holding its indexing.
pub fn lower_program(program: &Program) -> Result<(Vec<Instr>, Context)> {
    let mut ctx = Context::new();
    let mut out = Vec::new();

    ctx.scopes.push();

    // Pre-pass: bind every top-level name. Procedures get `#<k>` handles so
    // call sites can tell a top-level target from a captured local one.
    for decl in &program.decls {
        match decl {
            Decl::GlobalVar { inits, declared } => {
                for init in inits {
                    let global = format!("@{}", init.name);
                    let value = match &init.value.kind {
                        ExprKind::Number(n) => n.to_string(),
                        ExprKind::Bool(b) => if *b { "1" } else { "0" }.to_string(),
                        _ => {
                            return Err(CompileError::at(
                                ErrorKind::BadGlobalInit,
                                format!("global '{}' initializer is not a literal", init.name),
                                init.span.line,
                                init.span.col,
                            ));
                        }
                    };
                    out.push(Instr::new(
                        Opcode::Const,
                        vec![value],
                        Some(global.clone()),
                    ));
                    ctx.scopes
                        .declare(init.name.as_str(), declared.clone(), global);
                }
            }
            Decl::Func(func) => {
                let handle = ctx.new_func_handle();
                ctx.scopes
                    .declare(func.name.as_str(), func.func_type(), handle);
            }
        }
    }

    for decl in &program.decls {
        if let Decl::Func(func) = decl {
            let body = lower_proc(&mut ctx, func, func.name.clone())?;
            out.extend(body);
        }
    }

    // Hoisted lambda bodies go after everything at top level; lowering one
    // may enqueue more, so drain until empty.
    while let Some(body) = ctx.deferred.pop_front() {
        out.extend(body);
    }

    ctx.scopes.pop();
    ctx.process(&out);
    debug!(instructions = out.len(), "lowering finished");
    Ok((out, ctx))
}

/// Lower one procedure body into its own instruction run:
/// `proc`, entry label, parameter copies, static-link save, body, `ret`.
fn lower_proc(ctx: &mut Context, func: &FuncDecl, qualified: String) -> Result<Vec<Instr>> {
    let mut out = Vec::new();
    ctx.func_stack.push(qualified.clone());
    ctx.param_counter = 0;

    // One proc argument per ABI slot; function-typed parameters occupy two
    // (code pointer, then its static link).
    let mut slot_names = Vec::new();
    for param in &func.params {
        slot_names.push(param.name.clone());
        if param.ty.is_function() {
            slot_names.push(format!("{}{}", param.name, STATIC_LINK_SUFFIX));
        }
    }
    out.push(Instr::new(
        Opcode::Proc,
        slot_names,
        Some(qualified.clone()),
    ));
    let entry = ctx.new_label();
    out.push(Instr::label(entry));

    ctx.scopes.push();
    ctx.scopes.set_function(qualified.clone(), func.ret.clone());

    for param in &func.params {
        let incoming = ctx.new_param();
        let temp = ctx.new_temp();
        out.push(Instr::new(
            Opcode::Copy,
            vec![incoming],
            Some(temp.clone()),
        ));
        ctx.scopes
            .declare(param.name.as_str(), param.ty.clone(), temp);

        if param.ty.is_function() {
            let incoming_link = ctx.new_param();
            let link_temp = ctx.new_temp();
            out.push(Instr::new(
                Opcode::Copy,
                vec![incoming_link],
                Some(link_temp.clone()),
            ));
            ctx.scopes.declare(
                format!("{}{}", param.name, STATIC_LINK_SUFFIX),
                Type::Int,
                link_temp,
            );
        }
    }

    // The incoming static link always rides in the last parameter slot; the
    // flagged copy stores it at the frame's fixed -8(%rbp) slot.
    let link_param = ctx.new_param();
    let link_temp = ctx.new_temp();
    out.push(Instr::new(
        Opcode::Copy,
        vec![link_param, STATIC_LINK_FLAG.to_string()],
        Some(link_temp),
    ));

    stmt::lower_block(ctx, &func.body, &mut out)?;

    if out.last().map(|i| i.opcode) != Some(Opcode::Ret) {
        if func.ret.is_void() {
            out.push(Instr::new(Opcode::Ret, vec![], None));
        } else {
            return Err(CompileError::at(
                ErrorKind::MissingReturn,
                format!(
                    "procedure '{}' returns '{}' but its body does not end in a return",
                    func.name, func.ret
                ),
                func.span.line,
                func.span.col,
            ));
        }
    }

    ctx.scopes.pop();
    ctx.func_stack.pop();
    Ok(out)
}

/// Hoist a nested `def`: build the closure pair in the current block, bind
/// it, and lower the body into the deferred queue.
fn lower_lambda(ctx: &mut Context, func: &FuncDecl, out: &mut Vec<Instr>) -> Result<()> {
    let label = format!(
        "{}::{}{}",
        ctx.qualified_name(),
        func.name,
        ctx.next_lambda_index()
    );

    let code_ptr = ctx.new_temp();
    out.push(Instr::new(
        Opcode::Const,
        vec![label.clone()],
        Some(code_ptr.clone()),
    ));
    let static_link = ctx.new_temp();
    out.push(Instr::new(Opcode::GetFp, vec![], Some(static_link.clone())));

    ctx.scopes
        .declare(func.name.as_str(), func.func_type(), code_ptr);
    ctx.scopes.declare(
        format!("{}{}", func.name, STATIC_LINK_SUFFIX),
        Type::Int,
        static_link,
    );

    // Reserve the queue slot first so a lambda precedes any lambdas nested
    // inside its own body.
    let slot = ctx.deferred.len();
    ctx.deferred.push_back(Vec::new());
    let body = lower_proc(ctx, func, label)?;
    ctx.deferred[slot] = body;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;
    use crate::tac::is_ordinary;
    use crate::typecheck::type_check;
    use std::collections::HashMap;

    pub(super) fn lower(source: &str) -> (Vec<Instr>, Context) {
        let mut program = Parser::new(source).unwrap().parse().unwrap();
        type_check(&mut program).unwrap();
        lower_program(&program).unwrap()
    }

    fn render(instr: &[Instr]) -> Vec<String> {
        instr.iter().map(|i| i.to_string()).collect()
    }

    #[test]
    fn test_proc_shape() {
        let (instr, ctx) = lower("def main() { print(42); }");
        assert_eq!(ctx.procs.len(), 1);
        let (start, finish) = ctx.procs[0];
        assert_eq!(instr[start].opcode, Opcode::Proc);
        assert_eq!(instr[start].result.as_deref(), Some("main"));
        assert_eq!(instr[start + 1].opcode, Opcode::Label);
        assert_eq!(instr[finish].opcode, Opcode::Ret);
    }

    #[test]
    fn test_globals_precede_procs() {
        let (instr, ctx) = lower("var g = 7 : int;\ndef main() { print(g); }");
        assert_eq!(ctx.globals.len(), 1);
        assert_eq!(instr[0].opcode, Opcode::Const);
        assert_eq!(instr[0].result.as_deref(), Some("@g"));
        assert_eq!(instr[0].args, vec!["7"]);
    }

    #[test]
    fn test_bool_global_lowered_to_bit() {
        let (instr, _) = lower("var flag = true : bool;\ndef main() { print(flag); }");
        assert_eq!(instr[0].args, vec!["1"]);
    }

    #[test]
    fn test_static_link_save_is_flagged() {
        let (instr, ctx) = lower("def main() { }");
        let (start, finish) = ctx.procs[0];
        let save = instr[start..=finish]
            .iter()
            .find(|i| i.opcode == Opcode::Copy && i.args.len() == 2)
            .expect("static link save missing");
        assert_eq!(save.args[0], "%p0");
        assert_eq!(save.args[1], STATIC_LINK_FLAG);
    }

    #[test]
    fn test_function_param_takes_two_slots() {
        let (instr, ctx) =
            lower("def apply(f : function(int) -> int, v : int) : int { return f(v); } def main() { }");
        let (start, _) = ctx.procs[0];
        let proc = &instr[start];
        assert_eq!(
            proc.args,
            vec!["f", "f$static_link", "v"],
            "proc args list one name per ABI slot"
        );
        // Copies of %p0 (code ptr), %p1 (its link), %p2 (v), then the
        // flagged save of %p3 (incoming static link).
        let copies: Vec<_> = instr[start..]
            .iter()
            .filter(|i| i.opcode == Opcode::Copy)
            .take(4)
            .map(|i| i.args[0].clone())
            .collect();
        assert_eq!(copies, vec!["%p0", "%p1", "%p2", "%p3"]);
    }

    #[test]
    fn test_every_ordinary_temp_defined_once() {
        // Pre-optimization single-definition shape: assignments redefine a
        // variable's cell, so use a program without assignment or bool joins.
        let (instr, _) = lower(
            "def main() { var a = 1 : int; var b = a + 2 : int; print(b * a); }",
        );
        let mut defs: HashMap<String, usize> = HashMap::new();
        for tac in &instr {
            if let Some(result) = &tac.result
                && is_ordinary(result)
            {
                *defs.entry(result.clone()).or_default() += 1;
            }
        }
        for (temp, count) in defs {
            assert_eq!(count, 1, "temp {} defined {} times", temp, count);
        }
    }

    #[test]
    fn test_labels_unique() {
        let (instr, _) = lower(
            "def main() { var i = 0 : int; while (i < 3) { if (i == 1) { print(i); } i = i + 1; } }",
        );
        let mut seen = std::collections::HashSet::new();
        for tac in &instr {
            if tac.opcode == Opcode::Label {
                assert!(seen.insert(tac.args[0].clone()), "duplicate {}", tac.args[0]);
            }
        }
    }

    #[test]
    fn test_lambda_hoisted_after_top_level() {
        let (instr, ctx) = lower(
            "def main() { var a = 10 : int; def add(x : int) : int { return x + a; } print(add(5)); }",
        );
        assert_eq!(ctx.procs.len(), 2);
        let names: Vec<_> = ctx
            .procs
            .iter()
            .map(|&(s, _)| instr[s].result.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["main", "main::add0"]);

        // The closure is built inline in main: const of the lambda label,
        // then get_fp.
        let (start, finish) = ctx.procs[0];
        let main_body = render(&instr[start..=finish]);
        assert!(main_body.iter().any(|i| i.starts_with("const(main::add0)")));
        assert!(main_body.iter().any(|i| i.starts_with("get_fp(")));
    }

    #[test]
    fn test_nested_lambda_naming() {
        let (instr, ctx) = lower(
            "def main() {
               def outer(x : int) : int {
                 def inner(y : int) : int { return y + x; }
                 return inner(x);
               }
               print(outer(3));
             }",
        );
        let names: Vec<_> = ctx
            .procs
            .iter()
            .map(|&(s, _)| instr[s].result.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["main", "main::outer0", "main::outer0::inner1"]);
    }

    #[test]
    fn test_missing_return_in_int_function() {
        let mut program = Parser::new("def f(x : int) : int { print(x); } def main() { }")
            .unwrap()
            .parse()
            .unwrap();
        type_check(&mut program).unwrap();
        let err = lower_program(&program).unwrap_err();
        assert_eq!(err.kind, ErrorKind::MissingReturn);
    }

    #[test]
    fn test_void_proc_gets_synthesized_ret() {
        let (instr, ctx) = lower("def main() { print(1); }");
        let (_, finish) = ctx.procs[0];
        assert_eq!(instr[finish].opcode, Opcode::Ret);
        assert!(instr[finish].args.is_empty());
    }

    #[test]
    fn test_process_reindexes_after_edit() {
        let (mut instr, mut ctx) = lower("def f() { } def main() { f(); }");
        assert_eq!(ctx.procs.len(), 2);
        // Drop a trailing instruction and re-process; ranges must follow.
        instr.pop();
        ctx.process(&instr);
        assert_eq!(ctx.procs.len(), 2);
        assert_eq!(ctx.procs[1].1, instr.len() - 1);
    }
}
