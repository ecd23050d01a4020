//! Type checker for BX
//!
//! Walks the AST once, annotating every expression with its type in place
//! and validating operators, call arities, declarations, and returns. The
//! first ill-typed construct aborts with a positioned diagnostic; there is
//! no recovery.
//!
//! Top-level names are collected in a pre-pass so procedures can call each
//! other and reference globals regardless of declaration order. A nested
//! `def` only enters scope after its own body is checked, so lambdas cannot
//! recurse into themselves.

use crate::ast::{Block, Decl, Expr, ExprKind, FuncDecl, Program, Span, Stmt, UnOp, VarInit};
use crate::error::{CompileError, ErrorKind, Result};
use crate::types::Type;
use std::collections::HashMap;
use tracing::warn;

/// Name of the built-in print procedure; resolved to a runtime symbol
/// during lowering.
pub const PRINT: &str = "print";

pub struct TypeChecker {
    /// Name -> type frames, innermost last.
    scopes: Vec<HashMap<String, Type>>,
    /// Enclosing function stack: `(name, return type)`.
    functions: Vec<(String, Type)>,
    loop_depth: usize,
}

/// Type check a program in place. On success every expression's `ty` slot
/// is filled.
pub fn type_check(program: &mut Program) -> Result<()> {
    TypeChecker::new().check_program(program)
}

impl TypeChecker {
    pub fn new() -> Self {
        TypeChecker {
            scopes: Vec::new(),
            functions: Vec::new(),
            loop_depth: 0,
        }
    }

    fn check_program(&mut self, program: &mut Program) -> Result<()> {
        self.scopes.push(HashMap::new());

        // Pre-pass: collect top-level names so declaration order does not
        // matter and mutual recursion works.
        for decl in &program.decls {
            match decl {
                Decl::GlobalVar { inits, declared } => {
                    for init in inits {
                        self.declare(&init.name, declared.clone(), init.span)?;
                    }
                }
                Decl::Func(func) => {
                    self.declare(&func.name, func.func_type(), func.span)?;
                }
            }
        }

        match program.find_func("main") {
            None => {
                return Err(CompileError::new(
                    ErrorKind::UndeclaredName,
                    "no 'main' procedure defined",
                ));
            }
            Some(main) if !main.ret.is_void() => {
                return Err(CompileError::at(
                    ErrorKind::TypeMismatch,
                    format!("'main' must return 'void', not '{}'", main.ret),
                    main.span.line,
                    main.span.col,
                ));
            }
            Some(_) => {}
        }

        for decl in &mut program.decls {
            match decl {
                Decl::GlobalVar { inits, declared } => {
                    self.check_global_var(inits, declared)?;
                }
                Decl::Func(func) => self.check_func(func)?,
            }
        }

        self.scopes.pop();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Scope helpers
    // ------------------------------------------------------------------

    fn declare(&mut self, name: &str, ty: Type, span: Span) -> Result<()> {
        let scope = self.scopes.last_mut().expect("no open scope");
        if scope.contains_key(name) {
            return Err(CompileError::at(
                ErrorKind::Redeclaration,
                format!("'{}' is already declared in this scope", name),
                span.line,
                span.col,
            ));
        }
        scope.insert(name.to_string(), ty);
        Ok(())
    }

    fn lookup(&self, name: &str, span: Span) -> Result<&Type> {
        self.scopes
            .iter()
            .rev()
            .find_map(|s| s.get(name))
            .ok_or_else(|| {
                CompileError::at(
                    ErrorKind::UndeclaredName,
                    format!("'{}' is not declared", name),
                    span.line,
                    span.col,
                )
            })
    }

    // ------------------------------------------------------------------
    // Declarations
    // ------------------------------------------------------------------

    fn check_global_var(&mut self, inits: &mut [VarInit], declared: &Type) -> Result<()> {
        for init in inits.iter_mut() {
            self.require_var_type(declared, init.span)?;
            let ty = self.check_expr(&mut init.value)?;
            if ty != *declared {
                return Err(CompileError::at(
                    ErrorKind::TypeMismatch,
                    format!(
                        "global '{}' declared as '{}' but initialized with '{}'",
                        init.name, declared, ty
                    ),
                    init.span.line,
                    init.span.col,
                ));
            }
        }
        Ok(())
    }

    fn check_func(&mut self, func: &mut FuncDecl) -> Result<()> {
        if !func.ret.is_first_order() {
            return Err(CompileError::at(
                ErrorKind::TypeMismatch,
                format!(
                    "procedure '{}' cannot return a function type '{}'",
                    func.name, func.ret
                ),
                func.span.line,
                func.span.col,
            ));
        }

        self.scopes.push(HashMap::new());
        self.functions.push((func.name.clone(), func.ret.clone()));

        for param in &func.params {
            if param.ty.is_void() {
                return Err(CompileError::at(
                    ErrorKind::TypeMismatch,
                    format!(
                        "parameter '{}' of '{}' cannot have type 'void'",
                        param.name, func.name
                    ),
                    param.span.line,
                    param.span.col,
                ));
            }
            self.declare(&param.name, param.ty.clone(), param.span)?;
        }

        self.check_block(&mut func.body)?;

        self.functions.pop();
        self.scopes.pop();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn check_block(&mut self, block: &mut Block) -> Result<()> {
        self.scopes.push(HashMap::new());
        for stmt in &mut block.stmts {
            self.check_stmt(stmt)?;
        }
        self.scopes.pop();
        Ok(())
    }

    fn check_stmt(&mut self, stmt: &mut Stmt) -> Result<()> {
        match stmt {
            Stmt::VarDecl { inits, declared } => {
                for init in inits.iter_mut() {
                    self.require_var_type(declared, init.span)?;
                    let ty = self.check_expr(&mut init.value)?;
                    if ty != *declared {
                        return Err(CompileError::at(
                            ErrorKind::TypeMismatch,
                            format!(
                                "variable '{}' declared as '{}' but initialized with '{}'",
                                init.name, declared, ty
                            ),
                            init.span.line,
                            init.span.col,
                        ));
                    }
                    self.declare(&init.name, declared.clone(), init.span)?;
                }
                Ok(())
            }
            Stmt::Assign { name, value, span } => {
                let var_ty = self.lookup(name, *span)?.clone();
                if var_ty.is_function() {
                    return Err(CompileError::at(
                        ErrorKind::TypeMismatch,
                        format!("cannot assign to procedure '{}'", name),
                        span.line,
                        span.col,
                    ));
                }
                let ty = self.check_expr(value)?;
                if ty != var_ty {
                    return Err(CompileError::at(
                        ErrorKind::TypeMismatch,
                        format!(
                            "cannot assign '{}' to variable '{}' of type '{}'",
                            ty, name, var_ty
                        ),
                        span.line,
                        span.col,
                    ));
                }
                Ok(())
            }
            Stmt::Eval(expr) => {
                let ty = self.check_expr(expr)?;
                if !ty.is_void() {
                    warn!(
                        "call at {} discards a result of type '{}'",
                        expr.span, ty
                    );
                }
                Ok(())
            }
            Stmt::If { cond, then, els } => {
                self.require_bool_cond(cond, "if")?;
                self.check_block(then)?;
                if let Some(els) = els {
                    self.check_block(els)?;
                }
                Ok(())
            }
            Stmt::While { cond, body } => {
                self.require_bool_cond(cond, "while")?;
                self.loop_depth += 1;
                self.check_block(body)?;
                self.loop_depth -= 1;
                Ok(())
            }
            Stmt::Break(span) => self.check_loop_jump("break", *span),
            Stmt::Continue(span) => self.check_loop_jump("continue", *span),
            Stmt::Return { value, span } => {
                let (func_name, ret) = self
                    .functions
                    .last()
                    .cloned()
                    .expect("return outside of a function body");
                match value {
                    None => {
                        if !ret.is_void() {
                            return Err(CompileError::at(
                                ErrorKind::TypeMismatch,
                                format!(
                                    "'{}' must return a value of type '{}'",
                                    func_name, ret
                                ),
                                span.line,
                                span.col,
                            ));
                        }
                    }
                    Some(expr) => {
                        let ty = self.check_expr(expr)?;
                        if ty != ret {
                            return Err(CompileError::at(
                                ErrorKind::TypeMismatch,
                                format!(
                                    "'{}' returns '{}' but the value has type '{}'",
                                    func_name, ret, ty
                                ),
                                span.line,
                                span.col,
                            ));
                        }
                    }
                }
                Ok(())
            }
            Stmt::Block(block) => self.check_block(block),
            Stmt::Func(func) => {
                // The body sees everything already in scope, but not the
                // lambda itself; the name enters scope afterwards.
                self.check_func(func)?;
                self.declare(&func.name, func.func_type(), func.span)
            }
        }
    }

    fn check_loop_jump(&self, which: &str, span: Span) -> Result<()> {
        if self.loop_depth == 0 {
            return Err(CompileError::at(
                ErrorKind::Parse,
                format!("'{}' outside of a loop", which),
                span.line,
                span.col,
            ));
        }
        Ok(())
    }

    fn require_var_type(&self, declared: &Type, span: Span) -> Result<()> {
        if declared.is_int() || declared.is_bool() {
            Ok(())
        } else {
            Err(CompileError::at(
                ErrorKind::TypeMismatch,
                format!("variables must be 'int' or 'bool', not '{}'", declared),
                span.line,
                span.col,
            ))
        }
    }

    fn require_bool_cond(&mut self, cond: &mut Expr, stmt: &str) -> Result<()> {
        let ty = self.check_expr(cond)?;
        if !ty.is_bool() {
            return Err(CompileError::at(
                ErrorKind::TypeMismatch,
                format!(
                    "'{}' condition must be 'bool', got '{}'",
                    stmt, ty
                ),
                cond.span.line,
                cond.span.col,
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn check_expr(&mut self, expr: &mut Expr) -> Result<Type> {
        let ty = match &mut expr.kind {
            ExprKind::Number(_) => Type::Int,
            ExprKind::Bool(_) => Type::Bool,
            ExprKind::Ident(name) => self.lookup(name, expr.span)?.clone(),
            ExprKind::Unary { op, operand } => {
                let operand_ty = self.check_expr(operand)?;
                match op {
                    UnOp::Not => {
                        if !operand_ty.is_bool() {
                            return Err(type_error_unary(*op, "bool", &operand_ty, expr.span));
                        }
                        Type::Bool
                    }
                    UnOp::Neg | UnOp::BitNot => {
                        if !operand_ty.is_int() {
                            return Err(type_error_unary(*op, "int", &operand_ty, expr.span));
                        }
                        Type::Int
                    }
                }
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let lhs_ty = self.check_expr(lhs)?;
                let rhs_ty = self.check_expr(rhs)?;
                if lhs_ty != rhs_ty {
                    return Err(CompileError::at(
                        ErrorKind::TypeMismatch,
                        format!(
                            "operator '{}' expects operands of the same type, got '{}' and '{}'",
                            op.symbol(),
                            lhs_ty,
                            rhs_ty
                        ),
                        expr.span.line,
                        expr.span.col,
                    ));
                }
                if op.is_logical() {
                    if !lhs_ty.is_bool() {
                        return Err(type_error_binary(op.symbol(), "bool", &lhs_ty, expr.span));
                    }
                    Type::Bool
                } else if op.is_comparison() {
                    if !lhs_ty.is_int() {
                        return Err(type_error_binary(op.symbol(), "int", &lhs_ty, expr.span));
                    }
                    Type::Bool
                } else {
                    if !lhs_ty.is_int() {
                        return Err(type_error_binary(op.symbol(), "int", &lhs_ty, expr.span));
                    }
                    Type::Int
                }
            }
            ExprKind::Call { callee, args } => {
                if callee.as_str() == PRINT {
                    self.check_print_call(args, expr.span)?
                } else {
                    let callee_ty = self.lookup(callee, expr.span)?.clone();
                    let Type::Function { params, ret } = callee_ty else {
                        return Err(CompileError::at(
                            ErrorKind::TypeMismatch,
                            format!("'{}' is not callable", callee),
                            expr.span.line,
                            expr.span.col,
                        ));
                    };
                    if args.len() != params.len() {
                        return Err(CompileError::at(
                            ErrorKind::ArityMismatch,
                            format!(
                                "'{}' expects {} argument(s), got {}",
                                callee,
                                params.len(),
                                args.len()
                            ),
                            expr.span.line,
                            expr.span.col,
                        ));
                    }
                    for (arg, param_ty) in args.iter_mut().zip(&params) {
                        let arg_ty = self.check_expr(arg)?;
                        if arg_ty != *param_ty {
                            return Err(CompileError::at(
                                ErrorKind::TypeMismatch,
                                format!(
                                    "'{}' expects an argument of type '{}', got '{}'",
                                    callee, param_ty, arg_ty
                                ),
                                arg.span.line,
                                arg.span.col,
                            ));
                        }
                    }
                    *ret
                }
            }
        };
        expr.ty = Some(ty.clone());
        Ok(ty)
    }

    /// `print` is variadic of arity 1 over `int` and `bool`.
    fn check_print_call(&mut self, args: &mut [Expr], span: Span) -> Result<Type> {
        if args.len() != 1 {
            return Err(CompileError::at(
                ErrorKind::ArityMismatch,
                format!("'print' expects exactly 1 argument, got {}", args.len()),
                span.line,
                span.col,
            ));
        }
        let arg_ty = self.check_expr(&mut args[0])?;
        if !arg_ty.is_int() && !arg_ty.is_bool() {
            return Err(CompileError::at(
                ErrorKind::TypeMismatch,
                format!("'print' expects 'int' or 'bool', got '{}'", arg_ty),
                span.line,
                span.col,
            ));
        }
        Ok(Type::Void)
    }
}

impl Default for TypeChecker {
    fn default() -> Self {
        Self::new()
    }
}

fn type_error_unary(op: UnOp, expected: &str, got: &Type, span: Span) -> CompileError {
    CompileError::at(
        ErrorKind::TypeMismatch,
        format!(
            "unary '{}' expects a '{}' operand, got '{}'",
            op.symbol(),
            expected,
            got
        ),
        span.line,
        span.col,
    )
}

fn type_error_binary(symbol: &str, expected: &str, got: &Type, span: Span) -> CompileError {
    CompileError::at(
        ErrorKind::TypeMismatch,
        format!(
            "operator '{}' expects '{}' operands, got '{}'",
            symbol, expected, got
        ),
        span.line,
        span.col,
    )
}
