//! Lexer for the textual IR, built on logos.
//!
//! Shaped-type bodies like `?x?xf32` or `2xi32` are lexed as a single
//! `Shape` token and split by the parser; everything else is conventional.

use logos::Logos;

/// Source position of a token, tracked as byte offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// One lexed token with its source span.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub span: Span,
}

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
#[logos(skip r"//[^\n]*")]
pub enum Token {
    #[token("module")]
    Module,

    #[token("func")]
    Func,

    #[token("private")]
    Private,

    #[token("attributes")]
    Attributes,

    #[token("to")]
    To,

    #[token("dense")]
    Dense,

    // Shaped-type body: dims separated by `x`, ending in an element type,
    // e.g. `2xi32`, `?x?xf32`, `4xf32`. Must start with a dim so that a bare
    // element type like `f32` still lexes as an identifier.
    #[regex(r"(\?|[0-9]+)(x(\?|[0-9]+))*x[a-z][a-z0-9]*", |lex| lex.slice().to_string())]
    Shape(String),

    // Unranked shaped-type body: `*xf32`.
    #[regex(r"\*x[a-z][a-z0-9]*", |lex| lex.slice().to_string())]
    UnrankedShape(String),

    // Dotted identifiers cover op names (`memref.load`), symbols, and
    // element types.
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_.]*", |lex| lex.slice().to_string())]
    Ident(String),

    // SSA value name: %foo or %0
    #[regex(r"%[a-zA-Z0-9_]+", |lex| lex.slice()[1..].to_string())]
    ValueName(String),

    // Symbol reference: @compute, @my.intrinsic
    #[regex(r"@[a-zA-Z_][a-zA-Z0-9_.]*", |lex| lex.slice()[1..].to_string())]
    SymbolName(String),

    // Dialect type: !testlib.custom_arg, !async.token
    #[regex(r"![a-zA-Z_][a-zA-Z0-9_.]*", |lex| lex.slice()[1..].to_string())]
    BangIdent(String),

    #[regex(r"-?[0-9]+\.[0-9]+([eE][+-]?[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    FloatLit(f64),

    #[regex(r"-?[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    IntLit(i64),

    #[regex(r#""([^"\\]|\\.)*""#, |lex| {
        let s = lex.slice();
        s[1..s.len() - 1].replace("\\\"", "\"").replace("\\\\", "\\")
    })]
    StringLit(String),

    #[token("->")]
    Arrow,

    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("<")]
    LAngle,
    #[token(">")]
    RAngle,
    #[token(",")]
    Comma,
    #[token("=")]
    Equals,
    #[token(":")]
    Colon,
    #[token("?")]
    Question,
    #[token("*")]
    Star,
}

/// Lex `source` into a token stream.
///
/// Returns the byte offset of the first unlexable character on failure.
pub fn lex(source: &str) -> Result<Vec<Spanned>, usize> {
    let mut tokens = Vec::new();
    let mut lexer = Token::lexer(source);
    while let Some(result) = lexer.next() {
        let range = lexer.span();
        match result {
            Ok(token) => tokens.push(Spanned {
                token,
                span: Span {
                    start: range.start,
                    end: range.end,
                },
            }),
            Err(_) => return Err(range.start),
        }
    }
    Ok(tokens)
}

/// Convert a byte offset to a 1-based (line, column) pair.
pub fn line_col(source: &str, offset: usize) -> (usize, usize) {
    let mut line = 1;
    let mut col = 1;
    for (i, c) in source.char_indices() {
        if i >= offset {
            break;
        }
        if c == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}
