//! Tokenizer for BX source text
//!
//! Produces positioned tokens (1-based line/column). Whitespace and `//`
//! line comments are skipped. A `-` immediately before a digit run is part
//! of the number literal, so `-5` lexes as one token; the parser never sees
//! a separate unary minus for literals.

use crate::error::{CompileError, ErrorKind, Result};

/// Token kinds. Number and identifier tokens carry their payload; everything
/// else is identified by the variant alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Ident(String),
    Number(i64),

    // Keywords
    Def,
    Var,
    Return,
    Int,
    Bool,
    True,
    False,
    Void,
    If,
    Else,
    While,
    Break,
    Continue,
    Function,
    Arrow,

    // Punctuation
    LParen,
    RParen,
    LBrace,
    RBrace,
    Colon,
    Semicolon,
    Comma,

    // Operators
    Eq,     // =
    Plus,   // +
    Dash,   // -
    Star,   // *
    Slash,  // /
    Pcent,  // %
    Amp,    // &
    Pipe,   // |
    Hat,    // ^
    Tilde,  // ~
    Shl,    // <<
    Shr,    // >>
    EqEq,   // ==
    NotEq,  // !=
    Lt,     // <
    Le,     // <=
    Gt,     // >
    Ge,     // >=
    AndAnd, // &&
    OrOr,   // ||
    Not,    // !
}

/// Binary operator associativity. Comparisons are non-associative: `a == b
/// == c` is rejected by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assoc {
    Left,
    None,
}

impl TokenKind {
    /// Binding power of a binary operator token, or `None` for non-operators.
    /// Higher binds tighter.
    pub fn precedence(&self) -> Option<(u8, Assoc)> {
        let entry = match self {
            TokenKind::OrOr => (3, Assoc::Left),
            TokenKind::AndAnd => (6, Assoc::Left),
            TokenKind::Pipe => (10, Assoc::Left),
            TokenKind::Hat => (20, Assoc::Left),
            TokenKind::Amp => (30, Assoc::Left),
            TokenKind::EqEq | TokenKind::NotEq => (33, Assoc::None),
            TokenKind::Lt | TokenKind::Le | TokenKind::Gt | TokenKind::Ge => (36, Assoc::Left),
            TokenKind::Shl | TokenKind::Shr => (40, Assoc::Left),
            TokenKind::Plus | TokenKind::Dash => (50, Assoc::Left),
            TokenKind::Star | TokenKind::Slash | TokenKind::Pcent => (60, Assoc::Left),
            _ => return None,
        };
        Some(entry)
    }
}

/// Binding power of unary `!`.
pub const NOT_PRECEDENCE: u8 = 70;
/// Binding power of unary `-` and `~`.
pub const NEG_PRECEDENCE: u8 = 80;

/// A token with its source position (1-based).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: usize,
    pub col: usize,
}

impl Token {
    fn new(kind: TokenKind, text: impl Into<String>, line: usize, col: usize) -> Self {
        Token {
            kind,
            text: text.into(),
            line,
            col,
        }
    }
}

fn keyword(word: &str) -> Option<TokenKind> {
    let kind = match word {
        "def" => TokenKind::Def,
        "var" => TokenKind::Var,
        "return" => TokenKind::Return,
        "int" => TokenKind::Int,
        "bool" => TokenKind::Bool,
        "true" => TokenKind::True,
        "false" => TokenKind::False,
        "void" => TokenKind::Void,
        "if" => TokenKind::If,
        "else" => TokenKind::Else,
        "while" => TokenKind::While,
        "break" => TokenKind::Break,
        "continue" => TokenKind::Continue,
        "function" => TokenKind::Function,
        _ => return None,
    };
    Some(kind)
}

// Two-character operators must come before their one-character prefixes so
// the longest match wins.
const PUNCT: &[(&str, TokenKind)] = &[
    ("->", TokenKind::Arrow),
    ("<<", TokenKind::Shl),
    (">>", TokenKind::Shr),
    ("==", TokenKind::EqEq),
    ("!=", TokenKind::NotEq),
    ("<=", TokenKind::Le),
    (">=", TokenKind::Ge),
    ("&&", TokenKind::AndAnd),
    ("||", TokenKind::OrOr),
    ("(", TokenKind::LParen),
    (")", TokenKind::RParen),
    ("{", TokenKind::LBrace),
    ("}", TokenKind::RBrace),
    (":", TokenKind::Colon),
    (";", TokenKind::Semicolon),
    (",", TokenKind::Comma),
    ("=", TokenKind::Eq),
    ("+", TokenKind::Plus),
    ("-", TokenKind::Dash),
    ("*", TokenKind::Star),
    ("/", TokenKind::Slash),
    ("%", TokenKind::Pcent),
    ("&", TokenKind::Amp),
    ("|", TokenKind::Pipe),
    ("^", TokenKind::Hat),
    ("~", TokenKind::Tilde),
    ("<", TokenKind::Lt),
    (">", TokenKind::Gt),
    ("!", TokenKind::Not),
];

pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: usize,
    col: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Lexer {
            src: source.as_bytes(),
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    /// Tokenize the whole source.
    pub fn tokenize(mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        while let Some(token) = self.next_token()? {
            tokens.push(token);
        }
        Ok(tokens)
    }

    fn bump(&mut self) {
        if self.src[self.pos] == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        self.pos += 1;
    }

    fn skip_trivia(&mut self) {
        loop {
            while self.pos < self.src.len() && self.src[self.pos].is_ascii_whitespace() {
                self.bump();
            }
            if self.pos + 1 < self.src.len()
                && self.src[self.pos] == b'/'
                && self.src[self.pos + 1] == b'/'
            {
                while self.pos < self.src.len() && self.src[self.pos] != b'\n' {
                    self.bump();
                }
                continue;
            }
            break;
        }
    }

    fn next_token(&mut self) -> Result<Option<Token>> {
        self.skip_trivia();
        if self.pos >= self.src.len() {
            return Ok(None);
        }

        let (line, col) = (self.line, self.col);
        let c = self.src[self.pos];

        // Number, including a leading '-' glued to a digit
        let negative_number =
            c == b'-' && self.pos + 1 < self.src.len() && self.src[self.pos + 1].is_ascii_digit();
        if c.is_ascii_digit() || negative_number {
            let start = self.pos;
            if negative_number {
                self.bump();
            }
            while self.pos < self.src.len() && self.src[self.pos].is_ascii_digit() {
                self.bump();
            }
            let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
            let value: i64 = text.parse().map_err(|_| {
                CompileError::at(
                    ErrorKind::Lex,
                    format!("integer literal '{}' out of 64-bit range", text),
                    line,
                    col,
                )
            })?;
            return Ok(Some(Token::new(TokenKind::Number(value), text, line, col)));
        }

        // Identifier or keyword
        if c.is_ascii_alphabetic() || c == b'_' {
            let start = self.pos;
            while self.pos < self.src.len()
                && (self.src[self.pos].is_ascii_alphanumeric() || self.src[self.pos] == b'_')
            {
                self.bump();
            }
            let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
            let kind = keyword(text).unwrap_or_else(|| TokenKind::Ident(text.to_string()));
            return Ok(Some(Token::new(kind, text, line, col)));
        }

        // Punctuation and operators, longest match first
        for (text, kind) in PUNCT {
            if self.src[self.pos..].starts_with(text.as_bytes()) {
                for _ in 0..text.len() {
                    self.bump();
                }
                return Ok(Some(Token::new(kind.clone(), *text, line, col)));
            }
        }

        Err(CompileError::at(
            ErrorKind::Lex,
            format!("unexpected character '{}'", c as char),
            line,
            col,
        ))
    }
}
