//! Lexer and parser for the expression inside a `${{ ... }}` placeholder.
//!
//! ```text
//! expr := term+              several terms: the first names a function
//! term := STRING | BOOL | path | IDENT '(' [expr (',' expr)*] ')' | '(' expr ')'
//! path := IDENT ('.' IDENT)*
//! ```
//!
//! Both `join(previous_step.added_files, " ")` and
//! `join previous_step.added_files " "` parse to the same call. A `(`
//! directly after an identifier opens an argument list; after whitespace it
//! groups a sub-expression.

use core::iter::Peekable;
use core::str::Chars;

use crate::error::{Result, TemplateError};
use crate::value::Value;

/// Parsed expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// String or boolean literal.
    Literal(Value),
    /// Dotted identifier path such as `repository.name`.
    Path(Vec<String>),
    /// Call of a built-in function.
    Call {
        /// Function name.
        name: String,
        /// Argument expressions.
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    Dot,
    Comma,
    /// `(` directly after an identifier, opening an argument list.
    CallOpen,
    LParen,
    RParen,
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    let mut adjacent_ident = false;

    while let Some(&next) = chars.peek() {
        let was_adjacent = adjacent_ident;
        adjacent_ident = false;
        match next {
            ch if ch.is_whitespace() => {
                chars.next();
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '(' => {
                chars.next();
                if was_adjacent {
                    tokens.push(Token::CallOpen);
                } else {
                    tokens.push(Token::LParen);
                }
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '"' => {
                chars.next();
                tokens.push(Token::Str(read_quoted(&mut chars, source)?));
            }
            '`' => {
                chars.next();
                tokens.push(Token::Str(read_raw(&mut chars, source)?));
            }
            ch if is_ident_char(ch) => {
                let mut ident = String::new();
                while let Some(&part) = chars.peek() {
                    if !is_ident_char(part) {
                        break;
                    }
                    ident.push(part);
                    chars.next();
                }
                tokens.push(Token::Ident(ident));
                adjacent_ident = true;
            }
            other => {
                return Err(syntax(source, format!("unexpected character `{other}`")));
            }
        }
    }

    Ok(tokens)
}

fn is_ident_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_' || ch == '-'
}

fn read_quoted(chars: &mut Peekable<Chars<'_>>, source: &str) -> Result<String> {
    let mut text = String::new();
    loop {
        match chars.next() {
            Some('"') => return Ok(text),
            Some('\\') => match chars.next() {
                Some('n') => text.push('\n'),
                Some('t') => text.push('\t'),
                Some(escaped @ ('"' | '\\')) => text.push(escaped),
                Some(other) => {
                    return Err(syntax(source, format!("unknown escape `\\{other}`")));
                }
                None => return Err(syntax(source, "unterminated string literal")),
            },
            Some(ch) => text.push(ch),
            None => return Err(syntax(source, "unterminated string literal")),
        }
    }
}

fn read_raw(chars: &mut Peekable<Chars<'_>>, source: &str) -> Result<String> {
    let mut text = String::new();
    for ch in chars.by_ref() {
        if ch == '`' {
            return Ok(text);
        }
        text.push(ch);
    }
    Err(syntax(source, "unterminated raw string literal"))
}

fn syntax(source: &str, message: impl Into<String>) -> TemplateError {
    TemplateError::Syntax {
        expression: source.to_owned(),
        message: message.into(),
    }
}

/// Parse the source of one placeholder into an expression.
///
/// # Errors
/// Returns [`TemplateError::Syntax`] if the source is empty or malformed.
pub fn parse_expression(source: &str) -> Result<Expr> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(syntax(source, "empty expression"));
    }

    let mut parser = Parser {
        source,
        tokens,
        position: 0,
    };
    let expr = parser.expr()?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(syntax(source, format!("unexpected {token:?}"))),
    }
}

struct Parser<'src> {
    source: &'src str,
    tokens: Vec<Token>,
    position: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn expect(&mut self, expected: &Token) -> Result<()> {
        match self.advance() {
            Some(ref token) if token == expected => Ok(()),
            Some(token) => Err(syntax(
                self.source,
                format!("expected {expected:?}, found {token:?}"),
            )),
            None => Err(syntax(
                self.source,
                format!("expected {expected:?}, found end of expression"),
            )),
        }
    }

    fn starts_term(&self) -> bool {
        matches!(
            self.peek(),
            Some(Token::Ident(_) | Token::Str(_) | Token::LParen)
        )
    }

    fn expr(&mut self) -> Result<Expr> {
        let head = self.term()?;
        let mut args = Vec::new();
        while self.starts_term() {
            args.push(self.term()?);
        }

        if args.is_empty() {
            return Ok(head);
        }

        match head {
            Expr::Path(mut segments) if segments.len() == 1 => Ok(Expr::Call {
                name: segments.remove(0),
                args,
            }),
            _ => Err(syntax(
                self.source,
                "only a function name may be followed by arguments",
            )),
        }
    }

    fn term(&mut self) -> Result<Expr> {
        match self.advance() {
            Some(Token::Str(text)) => Ok(Expr::Literal(Value::String(text))),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(ident)) => self.ident_term(ident),
            Some(token) => Err(syntax(self.source, format!("unexpected {token:?}"))),
            None => Err(syntax(self.source, "unexpected end of expression")),
        }
    }

    fn ident_term(&mut self, ident: String) -> Result<Expr> {
        match self.peek() {
            Some(Token::CallOpen) => {
                self.advance();
                let args = self.call_args()?;
                return Ok(Expr::Call { name: ident, args });
            }
            Some(Token::Dot) => {}
            _ => match ident.as_str() {
                "true" => return Ok(Expr::Literal(Value::Bool(true))),
                "false" => return Ok(Expr::Literal(Value::Bool(false))),
                _ => {}
            },
        }

        let mut segments = vec![ident];
        while self.peek() == Some(&Token::Dot) {
            self.advance();
            match self.advance() {
                Some(Token::Ident(segment)) => segments.push(segment),
                _ => return Err(syntax(self.source, "expected identifier after `.`")),
            }
        }
        Ok(Expr::Path(segments))
    }

    fn call_args(&mut self) -> Result<Vec<Expr>> {
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.expr()?);
            match self.advance() {
                Some(Token::Comma) => {}
                Some(Token::RParen) => return Ok(args),
                _ => return Err(syntax(self.source, "expected `,` or `)` in argument list")),
            }
        }
    }
}
