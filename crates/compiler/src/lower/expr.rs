//! Expression lowering: value mode and boolean mode
//!
//! Value mode returns the temporary holding the expression's result.
//! Boolean mode takes a `(true, false)` label pair and emits branches; it
//! is the only place comparisons and `&&`/`||` are lowered, which gives
//! short-circuit evaluation by construction and puts comparison logic
//! directly on the branch.

use super::{Context, PRINT_BOOL, PRINT_INT, STATIC_LINK_SUFFIX};
use crate::ast::{Expr, ExprKind, UnOp};
use crate::error::{CompileError, ErrorKind, Result};
use crate::tac::{Instr, Opcode, Temp, is_global_function};
use crate::typecheck::PRINT;

/// Lower `expr` so its value ends up in the returned temporary.
pub fn lower_value(ctx: &mut Context, expr: &Expr, out: &mut Vec<Instr>) -> Result<Temp> {
    match &expr.kind {
        ExprKind::Number(n) => {
            let t = ctx.new_temp();
            out.push(Instr::new(Opcode::Const, vec![n.to_string()], Some(t.clone())));
            Ok(t)
        }
        ExprKind::Bool(_) => materialize_bool(ctx, expr, out),
        ExprKind::Ident(name) => {
            let symbol = lookup(ctx, name, expr)?;
            let t = ctx.new_temp();
            out.push(Instr::new(Opcode::Copy, vec![symbol], Some(t.clone())));
            Ok(t)
        }
        ExprKind::Unary { op, operand } => match op {
            UnOp::Not => materialize_bool(ctx, expr, out),
            UnOp::Neg | UnOp::BitNot => {
                let operand_temp = lower_value(ctx, operand, out)?;
                let opcode = if *op == UnOp::Neg {
                    Opcode::Neg
                } else {
                    Opcode::Not
                };
                let t = ctx.new_temp();
                out.push(Instr::new(opcode, vec![operand_temp], Some(t.clone())));
                Ok(t)
            }
        },
        ExprKind::Binary { op, lhs, rhs } => {
            if let Some(opcode) = Opcode::alu_for(*op) {
                let lhs_temp = lower_value(ctx, lhs, out)?;
                let rhs_temp = lower_value(ctx, rhs, out)?;
                let t = ctx.new_temp();
                out.push(Instr::new(opcode, vec![lhs_temp, rhs_temp], Some(t.clone())));
                Ok(t)
            } else {
                // comparison or short-circuit operator used as data
                materialize_bool(ctx, expr, out)
            }
        }
        ExprKind::Call { .. } => {
            let result = lower_call(ctx, expr, out)?;
            result.ok_or_else(|| {
                CompileError::at(
                    ErrorKind::Codegen,
                    "void call in value position survived type checking",
                    expr.span.line,
                    expr.span.col,
                )
            })
        }
    }
}

/// Lower a Bool expression so control reaches `label_true` exactly when it
/// is true and `label_false` exactly when it is false.
pub fn lower_bool(
    ctx: &mut Context,
    expr: &Expr,
    label_true: Temp,
    label_false: Temp,
    out: &mut Vec<Instr>,
) -> Result<()> {
    match &expr.kind {
        ExprKind::Bool(value) => {
            out.push(Instr::jmp(if *value { label_true } else { label_false }));
            Ok(())
        }
        ExprKind::Ident(name) => {
            let symbol = lookup(ctx, name, expr)?;
            out.push(Instr::new(Opcode::Jnz, vec![symbol], Some(label_true)));
            out.push(Instr::jmp(label_false));
            Ok(())
        }
        ExprKind::Unary {
            op: UnOp::Not,
            operand,
        } => lower_bool(ctx, operand, label_false, label_true, out),
        ExprKind::Binary { op, lhs, rhs } if op.is_logical() => {
            let mid = ctx.new_label();
            if *op == crate::ast::BinOp::LogAnd {
                lower_bool(ctx, lhs, mid.clone(), label_false.clone(), out)?;
            } else {
                lower_bool(ctx, lhs, label_true.clone(), mid.clone(), out)?;
            }
            out.push(Instr::label(mid));
            lower_bool(ctx, rhs, label_true, label_false, out)
        }
        ExprKind::Binary { op, lhs, rhs } if op.is_comparison() => {
            let lhs_temp = lower_value(ctx, lhs, out)?;
            let rhs_temp = lower_value(ctx, rhs, out)?;
            let diff = ctx.new_temp();
            out.push(Instr::new(
                Opcode::Sub,
                vec![lhs_temp, rhs_temp],
                Some(diff.clone()),
            ));
            let jump = Opcode::cond_for(*op).expect("comparison has a condition code");
            out.push(Instr::new(jump, vec![diff], Some(label_true)));
            out.push(Instr::jmp(label_false));
            Ok(())
        }
        ExprKind::Call { .. } => {
            let result = lower_call(ctx, expr, out)?.ok_or_else(|| {
                CompileError::at(
                    ErrorKind::Codegen,
                    "void call in boolean position survived type checking",
                    expr.span.line,
                    expr.span.col,
                )
            })?;
            out.push(Instr::new(Opcode::Jnz, vec![result], Some(label_true)));
            out.push(Instr::jmp(label_false));
            Ok(())
        }
        _ => Err(CompileError::at(
            ErrorKind::Codegen,
            "non-boolean expression reached boolean lowering",
            expr.span.line,
            expr.span.col,
        )),
    }
}

/// Build a Bool value as data: thread boolean mode against fresh labels and
/// write 1/0 at the join. Both writes target the same temporary, which acts
/// as a cell the way variables do under assignment.
pub fn materialize_bool(ctx: &mut Context, expr: &Expr, out: &mut Vec<Instr>) -> Result<Temp> {
    let label_true = ctx.new_label();
    let label_false = ctx.new_label();
    let label_end = ctx.new_label();

    lower_bool(ctx, expr, label_true.clone(), label_false.clone(), out)?;

    let t = ctx.new_temp();
    out.push(Instr::label(label_true));
    out.push(Instr::new(Opcode::Const, vec!["1".into()], Some(t.clone())));
    out.push(Instr::jmp(label_end.clone()));
    out.push(Instr::label(label_false));
    out.push(Instr::new(Opcode::Const, vec!["0".into()], Some(t.clone())));
    out.push(Instr::label(label_end));
    Ok(t)
}

/// Lower a call, returning the result temporary for non-void callees.
///
/// Every BX function value is a `(code pointer, static link)` pair. The
/// callee's pair is resolved first, argument slots are evaluated left to
/// right, `param` marks are emitted in reverse so the callee sees its first
/// argument at index 1, and the callee's static link always rides in the
/// last slot.
pub fn lower_call(ctx: &mut Context, expr: &Expr, out: &mut Vec<Instr>) -> Result<Option<Temp>> {
    let ExprKind::Call { callee, args } = &expr.kind else {
        return Err(CompileError::at(
            ErrorKind::Codegen,
            "lower_call on a non-call expression",
            expr.span.line,
            expr.span.col,
        ));
    };

    // print is a thin veneer over the runtime: one argument, no static link.
    if callee.as_str() == PRINT {
        let arg = &args[0];
        let value = lower_value(ctx, arg, out)?;
        let symbol = if arg.ty().is_bool() {
            PRINT_BOOL
        } else {
            PRINT_INT
        };
        let code_ptr = ctx.new_temp();
        out.push(Instr::new(
            Opcode::Const,
            vec![symbol.to_string()],
            Some(code_ptr.clone()),
        ));
        out.push(Instr::new(Opcode::Param, vec![value], Some("1".into())));
        out.push(Instr::new(Opcode::Call, vec![code_ptr, "1".into()], None));
        return Ok(None);
    }

    let (code_ptr, static_link) = resolve_function_pair(ctx, callee, expr, out)?;

    let mut slots = Vec::new();
    for arg in args {
        if arg.ty().is_function() {
            let ExprKind::Ident(name) = &arg.kind else {
                return Err(CompileError::at(
                    ErrorKind::Codegen,
                    "function-typed argument is not a name",
                    arg.span.line,
                    arg.span.col,
                ));
            };
            let (arg_ptr, arg_link) = resolve_function_pair(ctx, name, arg, out)?;
            slots.push(arg_ptr);
            slots.push(arg_link);
        } else {
            slots.push(lower_value(ctx, arg, out)?);
        }
    }
    slots.push(static_link);

    for (index, slot) in slots.iter().enumerate().rev() {
        out.push(Instr::new(
            Opcode::Param,
            vec![slot.clone()],
            Some((index + 1).to_string()),
        ));
    }

    let ret = expr.ty();
    let result = if ret.is_void() {
        None
    } else {
        Some(ctx.new_temp())
    };
    out.push(Instr::new(
        Opcode::Call,
        vec![code_ptr, slots.len().to_string()],
        result.clone(),
    ));
    Ok(result)
}

/// Resolve a function-valued name to a fresh `(code pointer, static link)`
/// pair of temporaries.
///
/// A `#`-handle binding is a top-level procedure: its code pointer is the
/// procedure name as a constant and its static link is 0. Anything else is
/// a local function value (lambda or function parameter), carried by the
/// bound temporary and its `$static_link` companion.
fn resolve_function_pair(
    ctx: &mut Context,
    name: &str,
    expr: &Expr,
    out: &mut Vec<Instr>,
) -> Result<(Temp, Temp)> {
    let symbol = lookup(ctx, name, expr)?;

    if is_global_function(&symbol) {
        let code_ptr = ctx.new_temp();
        out.push(Instr::new(
            Opcode::Const,
            vec![name.to_string()],
            Some(code_ptr.clone()),
        ));
        let static_link = ctx.new_temp();
        out.push(Instr::new(
            Opcode::Const,
            vec!["0".into()],
            Some(static_link.clone()),
        ));
        Ok((code_ptr, static_link))
    } else {
        let code_ptr = ctx.new_temp();
        out.push(Instr::new(Opcode::Copy, vec![symbol], Some(code_ptr.clone())));
        let link_name = format!("{}{}", name, STATIC_LINK_SUFFIX);
        let link_symbol = lookup(ctx, &link_name, expr)?;
        let static_link = ctx.new_temp();
        out.push(Instr::new(
            Opcode::Copy,
            vec![link_symbol],
            Some(static_link.clone()),
        ));
        Ok((code_ptr, static_link))
    }
}

fn lookup(ctx: &Context, name: &str, expr: &Expr) -> Result<Temp> {
    ctx.scopes
        .lookup(name)
        .map(|s| s.temp.clone())
        .ok_or_else(|| {
            CompileError::at(
                ErrorKind::UndeclaredName,
                format!("'{}' is not declared", name),
                expr.span.line,
                expr.span.col,
            )
        })
}
