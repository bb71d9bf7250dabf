//! Source text → token stream (§4.4).

pub mod token;

pub use token::{Token, TokenKind};

use crate::containers::byteset::InternTable;
use crate::error::UncilError;

/// Character source abstraction, mirroring the reference's
/// `get_char(udata) -> int` callback so an embedder could plug in a stream
/// reader instead of an in-memory string. The default implementation reads
/// a `&str` already fully in memory, which is all the core itself needs.
pub trait CharSource {
    fn get_char(&mut self) -> Option<char>;
}

pub struct StrSource<'a> {
    chars: std::str::Chars<'a>,
}

impl<'a> StrSource<'a> {
    pub fn new(s: &'a str) -> Self {
        StrSource { chars: s.chars() }
    }
}

impl CharSource for StrSource<'_> {
    fn get_char(&mut self) -> Option<char> {
        self.chars.next()
    }
}

#[derive(Debug)]
pub struct LexOutput {
    pub tokens: Vec<Token>,
    pub literals: InternTable,
    pub idents: InternTable,
}

pub struct Lexer<S: CharSource> {
    source: S,
    peeked: Option<char>,
    line: u32,
    literals: InternTable,
    idents: InternTable,
}

fn keyword(s: &str) -> Option<TokenKind> {
    Some(match s {
        "if" => TokenKind::If,
        "else" => TokenKind::Else,
        "for" => TokenKind::For,
        "while" => TokenKind::While,
        "do" => TokenKind::Do,
        "then" => TokenKind::Then,
        "end" => TokenKind::End,
        "function" => TokenKind::Function,
        "local" => TokenKind::Local,
        "try" => TokenKind::Try,
        "catch" => TokenKind::Catch,
        "return" => TokenKind::Return,
        "break" => TokenKind::Break,
        "continue" => TokenKind::Continue,
        "true" => TokenKind::True,
        "false" => TokenKind::False,
        "null" => TokenKind::Null,
        "delete" => TokenKind::Delete,
        "with" => TokenKind::With,
        "and" => TokenKind::And,
        "or" => TokenKind::Or,
        "not" => TokenKind::Not,
        "public" => TokenKind::Public,
        _ => return None,
    })
}

impl<S: CharSource> Lexer<S> {
    pub fn new(source: S) -> Self {
        Lexer {
            source,
            peeked: None,
            line: 1,
            literals: InternTable::new(),
            idents: InternTable::new(),
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = match self.peeked.take() {
            Some(c) => Some(c),
            None => self.source.get_char(),
        };
        if c == Some('\n') {
            self.line += 1;
        }
        c
    }

    fn peek(&mut self) -> Option<char> {
        if self.peeked.is_none() {
            self.peeked = self.source.get_char();
        }
        self.peeked
    }

    fn syntax_err(&self, message: impl Into<String>) -> UncilError {
        UncilError::Syntax { line: self.line, message: message.into() }
    }

    pub fn tokenize(mut self) -> Result<LexOutput, UncilError> {
        let mut tokens = Vec::new();
        loop {
            let tok = self.next_token()?;
            let is_eof = tok.kind == TokenKind::Eof;
            tokens.push(tok);
            if is_eof {
                break;
            }
        }
        Ok(LexOutput { tokens, literals: self.literals, idents: self.idents })
    }

    fn next_token(&mut self) -> Result<Token, UncilError> {
        loop {
            let line = self.line;
            let Some(c) = self.peek() else {
                return Ok(Token { kind: TokenKind::Eof, line });
            };
            match c {
                ' ' | '\t' | '\r' => {
                    self.bump();
                    continue;
                }
                '\n' => {
                    self.bump();
                    return Ok(Token { kind: TokenKind::Newline, line });
                }
                '#' => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                    continue;
                }
                _ => return self.scan_token(line),
            }
        }
    }

    fn scan_token(&mut self, line: u32) -> Result<Token, UncilError> {
        let c = self.bump().expect("checked by caller");
        let kind = match c {
            '+' => TokenKind::Plus,
            '-' => {
                if self.peek() == Some('>') {
                    self.bump();
                    TokenKind::Arrow
                } else {
                    TokenKind::Minus
                }
            }
            '*' => TokenKind::Star,
            '/' => {
                if self.peek() == Some('/') {
                    self.bump();
                    TokenKind::SlashSlash
                } else {
                    TokenKind::Slash
                }
            }
            '%' => TokenKind::Percent,
            '=' => {
                if self.peek() == Some('=') {
                    self.bump();
                    TokenKind::Eq
                } else {
                    TokenKind::Assign
                }
            }
            '!' => {
                if self.peek() == Some('=') {
                    self.bump();
                    TokenKind::NotEq
                } else {
                    return Err(self.syntax_err("unexpected character '!'"));
                }
            }
            '<' => {
                if self.peek() == Some('=') {
                    self.bump();
                    TokenKind::Le
                } else {
                    TokenKind::Lt
                }
            }
            '>' => {
                if self.peek() == Some('=') {
                    self.bump();
                    TokenKind::Ge
                } else {
                    TokenKind::Gt
                }
            }
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            ',' => TokenKind::Comma,
            ':' => TokenKind::Colon,
            ';' => TokenKind::Semicolon,
            '.' => {
                if self.peek() == Some('?') {
                    self.bump();
                    TokenKind::DotQuestion
                } else if self.peek() == Some('.') {
                    self.bump();
                    if self.peek() == Some('.') {
                        self.bump();
                        TokenKind::Ellipsis
                    } else {
                        return Err(self.syntax_err("unexpected '..'"));
                    }
                } else {
                    TokenKind::Dot
                }
            }
            '?' => {
                if self.peek() == Some('?') {
                    self.bump();
                    TokenKind::QuestionQuestion
                } else {
                    return Err(self.syntax_err("unexpected character '?'"));
                }
            }
            '"' => return self.scan_string(line),
            c if c.is_ascii_digit() => return self.scan_number(c, line),
            c if c.is_alphabetic() || c == '_' => return self.scan_ident(c, line),
            other => return Err(self.syntax_err(format!("unexpected character '{other}'"))),
        };
        Ok(Token { kind, line })
    }

    fn scan_string(&mut self, line: u32) -> Result<Token, UncilError> {
        let mut bytes = crate::containers::strbuf::ByteBuf::new();
        loop {
            match self.bump() {
                None => return Err(self.syntax_err("unterminated string literal")),
                Some('"') => break,
                Some('\\') => match self.bump() {
                    Some('n') => bytes.push_byte(b'\n'),
                    Some('t') => bytes.push_byte(b'\t'),
                    Some('r') => bytes.push_byte(b'\r'),
                    Some('\\') => bytes.push_byte(b'\\'),
                    Some('"') => bytes.push_byte(b'"'),
                    Some('0') => bytes.push_byte(0),
                    Some(other) => return Err(self.syntax_err(format!("bad escape '\\{other}'"))),
                    None => return Err(self.syntax_err("unterminated string literal")),
                },
                Some(c) => {
                    let mut buf = [0u8; 4];
                    bytes.append(c.encode_utf8(&mut buf).as_bytes());
                }
            }
        }
        let idx = self.literals.intern(bytes.as_slice());
        Ok(Token { kind: TokenKind::Str(idx), line })
    }

    fn scan_number(&mut self, first: char, line: u32) -> Result<Token, UncilError> {
        let mut text = String::new();
        text.push(first);
        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.bump();
            } else if c == '.' && !is_float {
                is_float = true;
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        if is_float {
            let v: f64 = text.parse().map_err(|_| self.syntax_err("malformed float literal"))?;
            Ok(Token { kind: TokenKind::Float(v), line })
        } else {
            let v: i64 = text.parse().map_err(|_| self.syntax_err("malformed int literal"))?;
            Ok(Token { kind: TokenKind::Int(v), line })
        }
    }

    fn scan_ident(&mut self, first: char, line: u32) -> Result<Token, UncilError> {
        let mut text = String::new();
        text.push(first);
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        if let Some(kw) = keyword(&text) {
            return Ok(Token { kind: kw, line });
        }
        let idx = self.idents.intern(text.as_bytes());
        Ok(Token { kind: TokenKind::Ident(idx), line })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(src: &str) -> Vec<TokenKind> {
        let l = Lexer::new(StrSource::new(src));
        l.tokenize().unwrap().tokens.into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn tokenizes_arithmetic_and_keywords() {
        let toks = lex("x = 1 + 2 * 3\n");
        assert!(matches!(toks[0], TokenKind::Ident(_)));
        assert_eq!(toks[1], TokenKind::Assign);
        assert_eq!(toks[2], TokenKind::Int(1));
        assert_eq!(toks[3], TokenKind::Plus);
    }

    #[test]
    fn tokenizes_string_escapes() {
        let toks = lex("\"a\\nb\"");
        match &toks[0] {
            TokenKind::Str(_) => {}
            other => panic!("expected Str, got {other:?}"),
        }
    }

    #[test]
    fn reports_line_number_on_syntax_error() {
        let l = Lexer::new(StrSource::new("x = 1\ny = !\n"));
        let err = l.tokenize().unwrap_err();
        match err {
            UncilError::Syntax { line, .. } => assert_eq!(line, 2),
            other => panic!("expected Syntax error, got {other:?}"),
        }
    }
}
