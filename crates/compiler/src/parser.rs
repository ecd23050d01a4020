//! Recursive-descent parser for BX
//!
//! Statements and declarations are parsed by dispatch on the leading token;
//! expressions use precedence climbing over the operator table in the lexer.
//! Comparison operators are non-associative, so `a == b == c` is rejected
//! here rather than surfacing later as a type error.

use crate::ast::{
    BinOp, Block, Decl, Expr, ExprKind, FuncDecl, Param, Program, Span, Stmt, UnOp, VarInit,
};
use crate::error::{CompileError, ErrorKind, Result};
use crate::lexer::{Assoc, Lexer, NEG_PRECEDENCE, NOT_PRECEDENCE, Token, TokenKind};
use crate::types::Type;

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(source: &str) -> Result<Self> {
        let tokens = Lexer::new(source).tokenize()?;
        Ok(Parser { tokens, pos: 0 })
    }

    /// Parse a whole program: a sequence of global variable and procedure
    /// declarations.
    pub fn parse(&mut self) -> Result<Program> {
        let mut program = Program::default();
        while let Some(token) = self.peek() {
            match token.kind {
                TokenKind::Var => {
                    let (inits, declared) = self.parse_global_var()?;
                    program.decls.push(Decl::GlobalVar { inits, declared });
                }
                TokenKind::Def => {
                    let func = self.parse_func_decl()?;
                    program.decls.push(Decl::Func(func));
                }
                _ => {
                    return Err(self.error_here("expected 'var' or 'def' at top level"));
                }
            }
        }
        Ok(program)
    }

    // ------------------------------------------------------------------
    // Token plumbing
    // ------------------------------------------------------------------

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self) -> Option<&TokenKind> {
        self.peek().map(|t| &t.kind)
    }

    fn peek_at(&self, off: usize) -> Option<&Token> {
        self.tokens.get(self.pos + off)
    }

    fn advance(&mut self) -> Result<Token> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| self.eof_error())?;
        self.pos += 1;
        Ok(token)
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek_kind() == Some(kind)
    }

    fn consume(&mut self, kind: &TokenKind, what: &str) -> Result<Token> {
        if self.check(kind) {
            self.advance()
        } else {
            Err(self.error_here(&format!("expected {}", what)))
        }
    }

    fn consume_ident(&mut self, what: &str) -> Result<(String, Span)> {
        match self.peek() {
            Some(Token {
                kind: TokenKind::Ident(name),
                line,
                col,
                ..
            }) => {
                let result = (name.clone(), Span::new(*line, *col));
                self.pos += 1;
                Ok(result)
            }
            _ => Err(self.error_here(&format!("expected {}", what))),
        }
    }

    fn span_here(&self) -> Span {
        match self.peek() {
            Some(token) => Span::new(token.line, token.col),
            None => self
                .tokens
                .last()
                .map(|t| Span::new(t.line, t.col))
                .unwrap_or_default(),
        }
    }

    fn error_here(&self, message: &str) -> CompileError {
        match self.peek() {
            Some(token) => CompileError::at(
                ErrorKind::Parse,
                format!("{}, got '{}'", message, token.text),
                token.line,
                token.col,
            ),
            None => self.eof_error(),
        }
    }

    fn eof_error(&self) -> CompileError {
        let span = self.span_here();
        CompileError::at(
            ErrorKind::Parse,
            "unexpected end of input",
            span.line,
            span.col,
        )
    }

    // ------------------------------------------------------------------
    // Declarations
    // ------------------------------------------------------------------

    /// `var (IDENT = literal),+ : type ;`; global initializers must be
    /// integer or boolean literals.
    fn parse_global_var(&mut self) -> Result<(Vec<VarInit>, Type)> {
        self.consume(&TokenKind::Var, "'var'")?;
        let mut inits = Vec::new();
        loop {
            let (name, span) = self.consume_ident("variable name")?;
            self.consume(&TokenKind::Eq, "'='")?;
            let value = self.parse_literal(&name)?;
            inits.push(VarInit { name, value, span });
            if !self.check(&TokenKind::Comma) {
                break;
            }
            self.advance()?;
        }
        self.consume(&TokenKind::Colon, "':' before type")?;
        let declared = self.parse_type()?;
        self.consume(&TokenKind::Semicolon, "';'")?;
        Ok((inits, declared))
    }

    fn parse_literal(&mut self, var_name: &str) -> Result<Expr> {
        let span = self.span_here();
        match self.peek_kind() {
            Some(TokenKind::Number(n)) => {
                let n = *n;
                self.advance()?;
                Ok(Expr::new(ExprKind::Number(n), span))
            }
            Some(TokenKind::True) => {
                self.advance()?;
                Ok(Expr::new(ExprKind::Bool(true), span))
            }
            Some(TokenKind::False) => {
                self.advance()?;
                Ok(Expr::new(ExprKind::Bool(false), span))
            }
            _ => Err(CompileError::at(
                ErrorKind::BadGlobalInit,
                format!(
                    "global variable '{}' expects an integer or boolean literal initializer",
                    var_name
                ),
                span.line,
                span.col,
            )),
        }
    }

    /// `def IDENT ( params? ) (: type)? block`, used for both top-level
    /// procedures and nested lambdas.
    fn parse_func_decl(&mut self) -> Result<FuncDecl> {
        self.consume(&TokenKind::Def, "'def'")?;
        let (name, span) = self.consume_ident("procedure name")?;
        self.consume(&TokenKind::LParen, "'('")?;
        let params = self.parse_params(&name)?;
        self.consume(&TokenKind::RParen, "')'")?;

        let ret = if self.check(&TokenKind::Colon) {
            self.advance()?;
            self.parse_type()?
        } else {
            Type::Void
        };

        let body = self.parse_block()?;
        Ok(FuncDecl {
            name,
            params,
            ret,
            body,
            span,
        })
    }

    /// Comma-separated parameter groups; names in a group share one type:
    /// `x, y : int, f : function(int) -> int`.
    fn parse_params(&mut self, func_name: &str) -> Result<Vec<Param>> {
        let mut params = Vec::new();
        while !self.check(&TokenKind::RParen) {
            let mut names = Vec::new();
            loop {
                let (name, span) = self.consume_ident(&format!(
                    "parameter name in procedure '{}'",
                    func_name
                ))?;
                names.push((name, span));
                if !self.check(&TokenKind::Comma) {
                    break;
                }
                self.advance()?;
            }
            self.consume(&TokenKind::Colon, "':' before parameter type")?;
            let ty = self.parse_type()?;
            for (name, span) in names {
                params.push(Param {
                    name,
                    ty: ty.clone(),
                    span,
                });
            }
            if self.check(&TokenKind::Comma) {
                self.advance()?;
            }
        }
        Ok(params)
    }

    /// `int | bool | void | function(type, ...) -> type`
    fn parse_type(&mut self) -> Result<Type> {
        match self.peek_kind() {
            Some(TokenKind::Int) => {
                self.advance()?;
                Ok(Type::Int)
            }
            Some(TokenKind::Bool) => {
                self.advance()?;
                Ok(Type::Bool)
            }
            Some(TokenKind::Void) => {
                self.advance()?;
                Ok(Type::Void)
            }
            Some(TokenKind::Function) => {
                self.advance()?;
                self.consume(&TokenKind::LParen, "'(' after 'function'")?;
                let mut params = Vec::new();
                while !self.check(&TokenKind::RParen) {
                    params.push(self.parse_type()?);
                    if !self.check(&TokenKind::Comma) {
                        break;
                    }
                    self.advance()?;
                }
                self.consume(&TokenKind::RParen, "')'")?;
                self.consume(&TokenKind::Arrow, "'->' after function parameters")?;
                let ret = self.parse_type()?;
                Ok(Type::function(params, ret))
            }
            _ => Err(self.error_here("expected a type")),
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn parse_block(&mut self) -> Result<Block> {
        self.consume(&TokenKind::LBrace, "'{'")?;
        let mut stmts = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            if self.peek().is_none() {
                return Err(self.eof_error());
            }
            stmts.push(self.parse_stmt()?);
        }
        self.consume(&TokenKind::RBrace, "'}'")?;
        Ok(Block { stmts })
    }

    fn parse_stmt(&mut self) -> Result<Stmt> {
        match self.peek_kind() {
            Some(TokenKind::Var) => self.parse_var_decl(),
            Some(TokenKind::If) => self.parse_if(),
            Some(TokenKind::While) => self.parse_while(),
            Some(TokenKind::Break) => {
                let token = self.advance()?;
                self.consume(&TokenKind::Semicolon, "';' after 'break'")?;
                Ok(Stmt::Break(Span::new(token.line, token.col)))
            }
            Some(TokenKind::Continue) => {
                let token = self.advance()?;
                self.consume(&TokenKind::Semicolon, "';' after 'continue'")?;
                Ok(Stmt::Continue(Span::new(token.line, token.col)))
            }
            Some(TokenKind::Return) => self.parse_return(),
            Some(TokenKind::LBrace) => Ok(Stmt::Block(self.parse_block()?)),
            Some(TokenKind::Def) => Ok(Stmt::Func(self.parse_func_decl()?)),
            Some(TokenKind::Ident(_)) => self.parse_assign_or_eval(),
            _ => Err(self.error_here("expected a statement")),
        }
    }

    /// `var (IDENT = expr),+ : type ;`
    fn parse_var_decl(&mut self) -> Result<Stmt> {
        self.consume(&TokenKind::Var, "'var'")?;
        let mut inits = Vec::new();
        loop {
            let (name, span) = self.consume_ident("variable name")?;
            self.consume(&TokenKind::Eq, "'='")?;
            let value = self.parse_expr()?;
            inits.push(VarInit { name, value, span });
            if !self.check(&TokenKind::Comma) {
                break;
            }
            self.advance()?;
        }
        self.consume(&TokenKind::Colon, "':' before type")?;
        let declared = self.parse_type()?;
        self.consume(&TokenKind::Semicolon, "';'")?;
        Ok(Stmt::VarDecl { inits, declared })
    }

    fn parse_if(&mut self) -> Result<Stmt> {
        self.consume(&TokenKind::If, "'if'")?;
        self.consume(&TokenKind::LParen, "'(' after 'if'")?;
        let cond = self.parse_expr()?;
        self.consume(&TokenKind::RParen, "')'")?;
        let then = self.parse_block()?;

        let els = if self.check(&TokenKind::Else) {
            self.advance()?;
            if self.check(&TokenKind::If) {
                // else-if chain: wrap the nested if in a one-statement block
                let nested = self.parse_if()?;
                Some(Block {
                    stmts: vec![nested],
                })
            } else {
                Some(self.parse_block()?)
            }
        } else {
            None
        };

        Ok(Stmt::If { cond, then, els })
    }

    fn parse_while(&mut self) -> Result<Stmt> {
        self.consume(&TokenKind::While, "'while'")?;
        self.consume(&TokenKind::LParen, "'(' after 'while'")?;
        let cond = self.parse_expr()?;
        self.consume(&TokenKind::RParen, "')'")?;
        let body = self.parse_block()?;
        Ok(Stmt::While { cond, body })
    }

    fn parse_return(&mut self) -> Result<Stmt> {
        let token = self.consume(&TokenKind::Return, "'return'")?;
        let span = Span::new(token.line, token.col);
        let value = if self.check(&TokenKind::Semicolon) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.consume(&TokenKind::Semicolon, "';' after return")?;
        Ok(Stmt::Return { value, span })
    }

    /// An identifier starts either an assignment (`x = e;`) or a call
    /// statement (`f(...);`).
    fn parse_assign_or_eval(&mut self) -> Result<Stmt> {
        match self.peek_at(1).map(|t| &t.kind) {
            Some(TokenKind::Eq) => {
                let (name, span) = self.consume_ident("variable name")?;
                self.consume(&TokenKind::Eq, "'='")?;
                let value = self.parse_expr()?;
                self.consume(&TokenKind::Semicolon, "';'")?;
                Ok(Stmt::Assign { name, value, span })
            }
            Some(TokenKind::LParen) => {
                let call = self.parse_term()?;
                self.consume(&TokenKind::Semicolon, "';' after call")?;
                Ok(Stmt::Eval(call))
            }
            _ => Err(self.error_here("expected '=' or '(' after identifier")),
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    pub fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_expr_min(0)
    }

    fn parse_expr_min(&mut self, min_prec: u8) -> Result<Expr> {
        let mut lhs = self.parse_term()?;

        while let Some((prec, assoc)) = self.peek_kind().and_then(|k| k.precedence()) {
            if prec < min_prec {
                break;
            }
            let op_token = self.advance()?;
            let op = binop_for(&op_token.kind);
            let rhs = self.parse_expr_min(prec + 1)?;

            // Non-associative operators refuse to chain at their own level.
            if assoc == Assoc::None
                && let Some((next_prec, Assoc::None)) =
                    self.peek_kind().and_then(|k| k.precedence())
                && next_prec == prec
            {
                return Err(self.error_here(&format!(
                    "comparison '{}' is non-associative; parenthesize the chain",
                    op.symbol()
                )));
            }

            let span = Span::new(op_token.line, op_token.col);
            lhs = Expr::new(
                ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                span,
            );
        }

        Ok(lhs)
    }

    fn parse_term(&mut self) -> Result<Expr> {
        let span = self.span_here();
        match self.peek_kind() {
            Some(TokenKind::LParen) => {
                self.advance()?;
                let expr = self.parse_expr()?;
                self.consume(&TokenKind::RParen, "')'")?;
                Ok(expr)
            }
            Some(TokenKind::Number(n)) => {
                let n = *n;
                self.advance()?;
                Ok(Expr::new(ExprKind::Number(n), span))
            }
            Some(TokenKind::True) => {
                self.advance()?;
                Ok(Expr::new(ExprKind::Bool(true), span))
            }
            Some(TokenKind::False) => {
                self.advance()?;
                Ok(Expr::new(ExprKind::Bool(false), span))
            }
            Some(TokenKind::Ident(_)) => {
                let (name, span) = self.consume_ident("identifier")?;
                if self.check(&TokenKind::LParen) {
                    self.advance()?;
                    let mut args = Vec::new();
                    while !self.check(&TokenKind::RParen) {
                        args.push(self.parse_expr()?);
                        if !self.check(&TokenKind::Comma) {
                            break;
                        }
                        self.advance()?;
                    }
                    self.consume(&TokenKind::RParen, "')' after call arguments")?;
                    Ok(Expr::new(ExprKind::Call { callee: name, args }, span))
                } else {
                    Ok(Expr::new(ExprKind::Ident(name), span))
                }
            }
            Some(TokenKind::Not) => {
                self.advance()?;
                let operand = self.parse_expr_min(NOT_PRECEDENCE)?;
                Ok(Expr::new(
                    ExprKind::Unary {
                        op: UnOp::Not,
                        operand: Box::new(operand),
                    },
                    span,
                ))
            }
            Some(TokenKind::Dash) | Some(TokenKind::Tilde) => {
                let token = self.advance()?;
                let op = if token.kind == TokenKind::Dash {
                    UnOp::Neg
                } else {
                    UnOp::BitNot
                };
                let operand = self.parse_expr_min(NEG_PRECEDENCE)?;
                Ok(Expr::new(
                    ExprKind::Unary {
                        op,
                        operand: Box::new(operand),
                    },
                    span,
                ))
            }
            _ => Err(self.error_here("expected an expression")),
        }
    }
}

fn binop_for(kind: &TokenKind) -> BinOp {
    match kind {
        TokenKind::Plus => BinOp::Add,
        TokenKind::Dash => BinOp::Sub,
        TokenKind::Star => BinOp::Mul,
        TokenKind::Slash => BinOp::Div,
        TokenKind::Pcent => BinOp::Rem,
        TokenKind::Amp => BinOp::BitAnd,
        TokenKind::Pipe => BinOp::BitOr,
        TokenKind::Hat => BinOp::BitXor,
        TokenKind::Shl => BinOp::Shl,
        TokenKind::Shr => BinOp::Shr,
        TokenKind::EqEq => BinOp::Eq,
        TokenKind::NotEq => BinOp::Ne,
        TokenKind::Lt => BinOp::Lt,
        TokenKind::Le => BinOp::Le,
        TokenKind::Gt => BinOp::Gt,
        TokenKind::Ge => BinOp::Ge,
        TokenKind::AndAnd => BinOp::LogAnd,
        TokenKind::OrOr => BinOp::LogOr,
        _ => unreachable!("token without operator precedence in binop_for"),
    }
}
