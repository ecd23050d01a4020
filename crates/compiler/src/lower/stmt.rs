//! Statement lowering
//!
//! Control flow is label threading over the boolean expression mode: `if`
//! and `while` hand their condition a `(true, false)` label pair and place
//! the labels around the branches. `while` pushes its exit and test labels
//! on the break/continue stacks so `break;`/`continue;` are plain jumps.

use super::{Context, expr, lower_lambda};
use crate::ast::{Block, Expr, Stmt};
use crate::error::{CompileError, ErrorKind, Result};
use crate::tac::{Instr, Opcode};

pub fn lower_block(ctx: &mut Context, block: &Block, out: &mut Vec<Instr>) -> Result<()> {
    ctx.scopes.push();
    for stmt in &block.stmts {
        lower_stmt(ctx, stmt, out)?;
    }
    ctx.scopes.pop();
    Ok(())
}

fn lower_stmt(ctx: &mut Context, stmt: &Stmt, out: &mut Vec<Instr>) -> Result<()> {
    match stmt {
        Stmt::VarDecl { inits, declared } => {
            for init in inits {
                let value = expr::lower_value(ctx, &init.value, out)?;
                ctx.scopes
                    .declare(init.name.as_str(), declared.clone(), value);
            }
            Ok(())
        }
        Stmt::Assign { name, value, span } => {
            let target = ctx
                .scopes
                .lookup(name)
                .map(|s| s.temp.clone())
                .ok_or_else(|| {
                    CompileError::at(
                        ErrorKind::UndeclaredName,
                        format!("'{}' is not declared", name),
                        span.line,
                        span.col,
                    )
                })?;
            let value = expr::lower_value(ctx, value, out)?;
            out.push(Instr::new(Opcode::Copy, vec![value], Some(target)));
            Ok(())
        }
        Stmt::Eval(call) => {
            // Result, if any, is discarded; the type checker already warned.
            expr::lower_call(ctx, call, out)?;
            Ok(())
        }
        Stmt::If { cond, then, els } => lower_if(ctx, cond, then, els.as_ref(), out),
        Stmt::While { cond, body } => lower_while(ctx, cond, body, out),
        Stmt::Break(span) => {
            let target = ctx.break_point().cloned().ok_or_else(|| {
                CompileError::at(
                    ErrorKind::Codegen,
                    "'break' with no enclosing loop reached lowering",
                    span.line,
                    span.col,
                )
            })?;
            out.push(Instr::jmp(target));
            Ok(())
        }
        Stmt::Continue(span) => {
            let target = ctx.continue_point().cloned().ok_or_else(|| {
                CompileError::at(
                    ErrorKind::Codegen,
                    "'continue' with no enclosing loop reached lowering",
                    span.line,
                    span.col,
                )
            })?;
            out.push(Instr::jmp(target));
            Ok(())
        }
        Stmt::Return { value, .. } => lower_return(ctx, value.as_ref(), out),
        Stmt::Block(block) => lower_block(ctx, block, out),
        Stmt::Func(func) => lower_lambda(ctx, func, out),
    }
}

fn lower_if(
    ctx: &mut Context,
    cond: &Expr,
    then: &Block,
    els: Option<&Block>,
    out: &mut Vec<Instr>,
) -> Result<()> {
    let label_then = ctx.new_label();
    let label_end = ctx.new_label();

    match els {
        None => {
            expr::lower_bool(ctx, cond, label_then.clone(), label_end.clone(), out)?;
            out.push(Instr::label(label_then));
            lower_block(ctx, then, out)?;
            out.push(Instr::label(label_end));
        }
        Some(els) => {
            let label_else = ctx.new_label();
            expr::lower_bool(ctx, cond, label_then.clone(), label_else.clone(), out)?;
            out.push(Instr::label(label_then));
            lower_block(ctx, then, out)?;
            out.push(Instr::jmp(label_end.clone()));
            out.push(Instr::label(label_else));
            lower_block(ctx, els, out)?;
            out.push(Instr::label(label_end));
        }
    }
    Ok(())
}

fn lower_while(ctx: &mut Context, cond: &Expr, body: &Block, out: &mut Vec<Instr>) -> Result<()> {
    let label_start = ctx.new_label();
    let label_body = ctx.new_label();
    let label_end = ctx.new_label();

    ctx.push_break_point(label_end.clone());
    ctx.push_continue_point(label_start.clone());

    out.push(Instr::label(label_start.clone()));
    expr::lower_bool(ctx, cond, label_body.clone(), label_end.clone(), out)?;
    out.push(Instr::label(label_body));
    lower_block(ctx, body, out)?;
    out.push(Instr::jmp(label_start));
    out.push(Instr::label(label_end));

    ctx.pop_break_point();
    ctx.pop_continue_point();
    Ok(())
}

fn lower_return(ctx: &mut Context, value: Option<&Expr>, out: &mut Vec<Instr>) -> Result<()> {
    let Some(value) = value else {
        out.push(Instr::new(Opcode::Ret, vec![], None));
        return Ok(());
    };

    if value.ty().is_bool() {
        // Branch to a 1-arm or 0-arm and return from each; no join needed.
        let label_true = ctx.new_label();
        let label_false = ctx.new_label();
        expr::lower_bool(ctx, value, label_true.clone(), label_false.clone(), out)?;

        out.push(Instr::label(label_true));
        let t_true = ctx.new_temp();
        out.push(Instr::new(
            Opcode::Const,
            vec!["1".into()],
            Some(t_true.clone()),
        ));
        out.push(Instr::new(Opcode::Ret, vec![t_true], None));

        out.push(Instr::label(label_false));
        let t_false = ctx.new_temp();
        out.push(Instr::new(
            Opcode::Const,
            vec!["0".into()],
            Some(t_false.clone()),
        ));
        out.push(Instr::new(Opcode::Ret, vec![t_false], None));
    } else {
        let result = expr::lower_value(ctx, value, out)?;
        let t = ctx.new_temp();
        out.push(Instr::new(Opcode::Copy, vec![result], Some(t.clone())));
        out.push(Instr::new(Opcode::Ret, vec![t], None));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::tests::lower;
    use crate::tac::{Instr, Opcode};

    fn render(instr: &[Instr]) -> String {
        instr
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn test_if_else_threads_labels() {
        let (instr, ctx) = lower(
            "def main() { var x = 1 : int; if (x == 0) { print(1); } else { print(2); } }",
        );
        let (start, finish) = ctx.procs[0];
        let body = render(&instr[start..=finish]);
        // comparison branches on the subtraction's result
        assert!(body.contains("sub("));
        let sub_result = instr[start..=finish]
            .iter()
            .find(|i| i.opcode == Opcode::Sub)
            .and_then(|i| i.result.clone())
            .unwrap();
        let jz = instr[start..=finish]
            .iter()
            .find(|i| i.opcode == Opcode::Jz)
            .unwrap();
        assert_eq!(jz.args[0], sub_result);
    }

    #[test]
    fn test_while_break_jumps_to_end() {
        let (instr, ctx) = lower(
            "def main() { var i = 0 : int; while (true) { if (i == 3) { break; } i = i + 1; } print(i); }",
        );
        let (start, finish) = ctx.procs[0];
        let body = &instr[start..=finish];
        // The loop produces start/body/end labels; the break jump targets a
        // label that is defined after the back-edge jump to the start.
        let back_edge = body
            .iter()
            .rev()
            .find(|i| i.opcode == Opcode::Jmp && i.jmp_target().is_some())
            .unwrap();
        assert!(back_edge.jmp_target().unwrap().starts_with("%.L"));
    }

    #[test]
    fn test_short_circuit_and_skips_rhs() {
        let (instr, ctx) = lower(
            "def main() { var x = 0 : int; if (false && (1 / 0 > 0)) { x = 1; } print(x); }",
        );
        let (start, finish) = ctx.procs[0];
        let body = body_slice(&instr, start, finish);
        // The false literal lowers to an unconditional jump; the division is
        // still emitted (in the never-reached arm) but control cannot get
        // there: the first jump of the condition is unconditional.
        let first_jump = body.iter().find(|i| i.opcode.is_jump()).unwrap();
        assert_eq!(first_jump.opcode, Opcode::Jmp);
    }

    fn body_slice(instr: &[Instr], start: usize, finish: usize) -> &[Instr] {
        &instr[start..=finish]
    }

    #[test]
    fn test_assign_copies_into_variable_cell() {
        let (instr, ctx) = lower("def main() { var x = 5 : int; x = 7; print(x); }");
        let (start, finish) = ctx.procs[0];
        let body = &instr[start..=finish];
        let cell = body
            .iter()
            .find(|i| i.opcode == Opcode::Const && i.args == vec!["5"])
            .and_then(|i| i.result.clone())
            .unwrap();
        // the assignment redefines the same cell
        let assign = body
            .iter()
            .find(|i| i.opcode == Opcode::Copy && i.result.as_deref() == Some(cell.as_str()))
            .expect("assignment copy not found");
        assert_eq!(assign.args.len(), 1);
    }

    #[test]
    fn test_bool_return_has_two_arms() {
        let (instr, ctx) = lower(
            "def flag(x : int) : bool { return x == 0; } def main() { print(flag(3)); }",
        );
        let flag_range = ctx.procs[0];
        let body = &instr[flag_range.0..=flag_range.1];
        let rets: Vec<_> = body.iter().filter(|i| i.opcode == Opcode::Ret).collect();
        assert_eq!(rets.len(), 2);
        assert!(rets.iter().all(|r| !r.args.is_empty()));
    }

    #[test]
    fn test_print_bool_resolves_runtime_symbol() {
        let (instr, _) = lower("def main() { print(true); }");
        assert!(
            instr
                .iter()
                .any(|i| i.opcode == Opcode::Const && i.args == vec!["__bx_print_bool"])
        );
    }

    #[test]
    fn test_print_int_resolves_runtime_symbol() {
        let (instr, _) = lower("def main() { print(42); }");
        assert!(
            instr
                .iter()
                .any(|i| i.opcode == Opcode::Const && i.args == vec!["__bx_print_int"])
        );
    }

    #[test]
    fn test_call_params_reversed_with_static_link_last() {
        let (instr, ctx) = lower(
            "def add(a, b : int) : int { return a + b; } def main() { print(add(1, 2)); }",
        );
        let main_range = ctx.procs[1];
        let body = &instr[main_range.0..=main_range.1];
        let call_pos = body
            .iter()
            .position(|i| {
                i.opcode == Opcode::Call && i.result.is_some() // the add call binds a result
            })
            .unwrap();
        let call = &body[call_pos];
        // two value slots + static link
        assert_eq!(call.args[1], "3");
        // param marks directly before the call, reversed: 3, 2, 1
        let marks: Vec<_> = body[call_pos - 3..call_pos]
            .iter()
            .map(|i| {
                assert_eq!(i.opcode, Opcode::Param);
                i.result.clone().unwrap()
            })
            .collect();
        assert_eq!(marks, vec!["3", "2", "1"]);
    }

    #[test]
    fn test_top_level_callee_gets_zero_static_link() {
        let (instr, ctx) = lower("def f() { } def main() { f(); }");
        let main_range = ctx.procs[1];
        let body = &instr[main_range.0..=main_range.1];
        // const(f) for the code pointer and const(0) for the static link
        assert!(
            body.iter()
                .any(|i| i.opcode == Opcode::Const && i.args == vec!["f"])
        );
        assert!(
            body.iter()
                .any(|i| i.opcode == Opcode::Const && i.args == vec!["0"])
        );
    }

    #[test]
    fn test_function_argument_passes_two_slots() {
        let (instr, ctx) = lower(
            "def apply(f : function(int) -> int, v : int) : int { return f(v); }
             def double(x : int) : int { return x + x; }
             def main() { print(apply(double, 5)); }",
        );
        let main_range = ctx.procs[2];
        let body = &instr[main_range.0..=main_range.1];
        let call = body
            .iter()
            .find(|i| i.opcode == Opcode::Call && i.result.is_some())
            .unwrap();
        // double's (code ptr, static link) + 5 + apply's static link
        assert_eq!(call.args[1], "4");
    }

    #[test]
    fn test_lambda_call_uses_captured_pair() {
        let (instr, ctx) = lower(
            "def main() { var a = 1 : int; def add(x : int) : int { return x + a; } print(add(5)); }",
        );
        let main_range = ctx.procs[0];
        let body = &instr[main_range.0..=main_range.1];
        // the code pointer const and the get_fp both feed copies at the call
        let get_fp = body
            .iter()
            .find(|i| i.opcode == Opcode::GetFp)
            .and_then(|i| i.result.clone())
            .unwrap();
        assert!(
            body.iter()
                .any(|i| i.opcode == Opcode::Copy && i.args == vec![get_fp.clone()]),
            "call site must copy the captured static link"
        );
    }
}
