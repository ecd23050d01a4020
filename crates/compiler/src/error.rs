//! Compilation error types.
//!
//! Every phase returns `Result<_, CompileError>` and propagates with `?`.
//! The driver reports the error on stderr and exits nonzero; there is no
//! recovery, the first error aborts the compilation.

/// What went wrong, independent of the wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unknown character in the source text
    Lex,
    /// Unexpected token
    Parse,
    /// Name declared twice in the same scope
    Redeclaration,
    /// Name looked up but never declared
    UndeclaredName,
    /// Operator, assignment, argument, or return type disagreement
    TypeMismatch,
    /// Call with the wrong number of arguments
    ArityMismatch,
    /// Global initializer that is not an integer or boolean literal
    BadGlobalInit,
    /// Non-void function whose body does not end in a return
    MissingReturn,
    /// Internal inconsistency in a late phase (should be unreachable)
    Codegen,
}

impl ErrorKind {
    fn label(self) -> &'static str {
        match self {
            ErrorKind::Lex => "lex error",
            ErrorKind::Parse => "parse error",
            ErrorKind::Redeclaration => "redeclaration",
            ErrorKind::UndeclaredName => "undeclared name",
            ErrorKind::TypeMismatch => "type mismatch",
            ErrorKind::ArityMismatch => "arity mismatch",
            ErrorKind::BadGlobalInit => "bad global initializer",
            ErrorKind::MissingReturn => "missing return",
            ErrorKind::Codegen => "internal codegen error",
        }
    }
}

/// A fatal compilation error with an optional source position.
///
/// Positions are 1-based `(line, column)` pairs as produced by the lexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub kind: ErrorKind,
    pub message: String,
    pub location: Option<(usize, usize)>,
}

impl CompileError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        CompileError {
            kind,
            message: message.into(),
            location: None,
        }
    }

    pub fn at(kind: ErrorKind, message: impl Into<String>, line: usize, col: usize) -> Self {
        CompileError {
            kind,
            message: message.into(),
            location: Some((line, col)),
        }
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.location {
            Some((line, col)) => write!(
                f,
                "{} at {}:{}: {}",
                self.kind.label(),
                line,
                col,
                self.message
            ),
            None => write!(f, "{}: {}", self.kind.label(), self.message),
        }
    }
}

impl std::error::Error for CompileError {}

/// Shorthand used across all phases.
pub type Result<T> = std::result::Result<T, CompileError>;
