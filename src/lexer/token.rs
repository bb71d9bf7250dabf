//! Token kinds produced by the lexer (§4.4).

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Keywords
    If,
    Else,
    For,
    While,
    Do,
    Then,
    End,
    Function,
    Local,
    Try,
    Catch,
    Return,
    Break,
    Continue,
    True,
    False,
    Null,
    Delete,
    With,
    And,
    Or,
    Not,
    Public,

    // Literals / names
    Int(i64),
    Float(f64),
    /// Index into the literal-string pool.
    Str(u32),
    /// Index into the identifier pool.
    Ident(u32),

    // Punctuation / operators
    Plus,
    Minus,
    Star,
    Slash,
    SlashSlash, // `//` integer division
    Percent,
    Assign,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Dot,
    DotQuestion, // `.?`
    QuestionQuestion, // `??`
    Arrow, // `->`
    Ellipsis, // `...`
    Colon,
    Semicolon,

    /// Semantic statement separator (explicit `;` or a newline that ends a
    /// statement). Distinguished from [`TokenKind::RawNewline`], which is a
    /// newline inside a context where it has no syntactic meaning (e.g.
    /// inside parentheses).
    Newline,
    RawNewline,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
}
