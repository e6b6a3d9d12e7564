//! Lexer for the Python 2 expression subset
//!
//! Converts source text into a stream of tokens with position tracking.
//! Only expression syntax is recognised; there are no statements, so
//! newlines are plain whitespace.

use super::error::{ErrorKind, ParseError, ParseResult};
use std::fmt;

/// Position in source code (line and column, both 1-indexed)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub line: usize,
    pub column: usize,
    pub offset: usize,
}

impl Position {
    pub fn new(line: usize, column: usize, offset: usize) -> Self {
        Position {
            line,
            column,
            offset,
        }
    }

    pub fn start() -> Self {
        Position::new(1, 1, 0)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Range in source code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: Position,
    pub end: Position,
}

impl Span {
    pub fn new(start: Position, end: Position) -> Self {
        Span { start, end }
    }

    pub fn single(pos: Position) -> Self {
        Span::new(pos, pos)
    }

    /// Smallest span covering both
    pub fn to(self, other: Span) -> Span {
        Span::new(self.start, other.end)
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start.line == self.end.line {
            write!(
                f,
                "{}:{}-{}",
                self.start.line, self.start.column, self.end.column
            )
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Literals
    Int(i64),
    Float(f64),
    Str(String),

    Name(String),

    // Keywords
    And,
    Or,
    Not,
    In,
    Is,
    For,
    If,
    Else,
    Lambda,

    // Arithmetic
    Plus,
    Minus,
    Star,
    DoubleStar,
    Slash,
    DoubleSlash,
    Percent,

    // Bitwise
    LShift,
    RShift,
    Amp,
    Pipe,
    Caret,
    Tilde,

    // Comparison
    Lt,
    Gt,
    LtEq,
    GtEq,
    EqEq,
    /// `!=` or `<>`
    NotEq,

    /// `=` of a keyword argument
    Eq,
    Backquote,

    // Delimiters
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,

    Colon,
    Comma,
    Dot,

    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            TokenKind::Int(n) => return write!(f, "integer '{}'", n),
            TokenKind::Float(x) => return write!(f, "float '{}'", x),
            TokenKind::Str(s) => return write!(f, "string {:?}", s),
            TokenKind::Name(s) => return write!(f, "name '{}'", s),
            TokenKind::Eof => return write!(f, "end of input"),
            TokenKind::And => "and",
            TokenKind::Or => "or",
            TokenKind::Not => "not",
            TokenKind::In => "in",
            TokenKind::Is => "is",
            TokenKind::For => "for",
            TokenKind::If => "if",
            TokenKind::Else => "else",
            TokenKind::Lambda => "lambda",
            TokenKind::Plus => "+",
            TokenKind::Minus => "-",
            TokenKind::Star => "*",
            TokenKind::DoubleStar => "**",
            TokenKind::Slash => "/",
            TokenKind::DoubleSlash => "//",
            TokenKind::Percent => "%",
            TokenKind::LShift => "<<",
            TokenKind::RShift => ">>",
            TokenKind::Amp => "&",
            TokenKind::Pipe => "|",
            TokenKind::Caret => "^",
            TokenKind::Tilde => "~",
            TokenKind::Lt => "<",
            TokenKind::Gt => ">",
            TokenKind::LtEq => "<=",
            TokenKind::GtEq => ">=",
            TokenKind::EqEq => "==",
            TokenKind::NotEq => "!=",
            TokenKind::Eq => "=",
            TokenKind::Backquote => "`",
            TokenKind::LParen => "(",
            TokenKind::RParen => ")",
            TokenKind::LBracket => "[",
            TokenKind::RBracket => "]",
            TokenKind::LBrace => "{",
            TokenKind::RBrace => "}",
            TokenKind::Colon => ":",
            TokenKind::Comma => ",",
            TokenKind::Dot => ".",
        };
        write!(f, "'{}'", symbol)
    }
}

/// A token with its kind and source location
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

impl Token {
    pub fn new(kind: TokenKind, span: Span) -> Self {
        Token { kind, span }
    }
}

pub struct Lexer<'a> {
    source: &'a str,
    chars: std::str::Chars<'a>,
    current: Option<char>,
    position: Position,
    token_start: Position,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        let mut chars = source.chars();
        let current = chars.next();
        Lexer {
            source,
            chars,
            current,
            position: Position::start(),
            token_start: Position::start(),
        }
    }

    /// Get the source code (useful for error reporting)
    pub fn source(&self) -> &'a str {
        self.source
    }

    /// Lex the whole input, `Eof` included
    pub fn tokenize(mut self) -> ParseResult<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                return Ok(tokens);
            }
        }
    }

    pub fn next_token(&mut self) -> ParseResult<Token> {
        self.skip_whitespace_and_comments()?;
        self.token_start = self.position;

        let Some(ch) = self.current else {
            return Ok(self.make_token(TokenKind::Eof));
        };
        let kind = match ch {
            '(' => self.single(TokenKind::LParen),
            ')' => self.single(TokenKind::RParen),
            '[' => self.single(TokenKind::LBracket),
            ']' => self.single(TokenKind::RBracket),
            '{' => self.single(TokenKind::LBrace),
            '}' => self.single(TokenKind::RBrace),
            ':' => self.single(TokenKind::Colon),
            ',' => self.single(TokenKind::Comma),
            '+' => self.single(TokenKind::Plus),
            '-' => self.single(TokenKind::Minus),
            '%' => self.single(TokenKind::Percent),
            '&' => self.single(TokenKind::Amp),
            '|' => self.single(TokenKind::Pipe),
            '^' => self.single(TokenKind::Caret),
            '~' => self.single(TokenKind::Tilde),
            '`' => self.single(TokenKind::Backquote),

            '*' => self.one_or_two('*', TokenKind::Star, TokenKind::DoubleStar),
            '/' => self.one_or_two('/', TokenKind::Slash, TokenKind::DoubleSlash),
            '=' => self.one_or_two('=', TokenKind::Eq, TokenKind::EqEq),
            '>' => {
                self.advance();
                match self.current {
                    Some('=') => self.single(TokenKind::GtEq),
                    Some('>') => self.single(TokenKind::RShift),
                    _ => TokenKind::Gt,
                }
            }
            '<' => {
                self.advance();
                match self.current {
                    Some('=') => self.single(TokenKind::LtEq),
                    Some('<') => self.single(TokenKind::LShift),
                    Some('>') => self.single(TokenKind::NotEq),
                    _ => TokenKind::Lt,
                }
            }
            '!' => {
                self.advance();
                if self.current != Some('=') {
                    return Err(self
                        .error("Unexpected character '!'")
                        .with_suggestion("Use 'not' for negation or '!=' for inequality")
                        .boxed());
                }
                self.single(TokenKind::NotEq)
            }

            '.' if matches!(self.peek(), Some('0'..='9')) => self.lex_number()?,
            '.' => self.single(TokenKind::Dot),

            '"' | '\'' => self.lex_string(false)?,
            '0'..='9' => self.lex_number()?,
            'a'..='z' | 'A'..='Z' | '_' => self.lex_name_or_prefixed_string()?,

            other => {
                self.advance();
                return Err(self
                    .error(format!("Unexpected character '{}'", other))
                    .boxed());
            }
        };
        Ok(self.make_token(kind))
    }

    fn advance(&mut self) {
        if let Some(ch) = self.current {
            if ch == '\n' {
                self.position.line += 1;
                self.position.column = 1;
            } else {
                self.position.column += 1;
            }
            self.position.offset += ch.len_utf8();
        }
        self.current = self.chars.next();
    }

    fn peek(&self) -> Option<char> {
        self.chars.clone().next()
    }

    fn skip_whitespace_and_comments(&mut self) -> ParseResult<()> {
        loop {
            match self.current {
                Some(' ' | '\t' | '\r' | '\n' | '\x0c') => self.advance(),
                Some('#') => {
                    while self.current.is_some() && self.current != Some('\n') {
                        self.advance();
                    }
                }
                Some('\\') => {
                    self.token_start = self.position;
                    self.advance();
                    match self.current {
                        Some('\n') => self.advance(),
                        Some('\r') if self.peek() == Some('\n') => {
                            self.advance();
                            self.advance();
                        }
                        _ => {
                            return Err(self
                                .error("Unexpected character after line continuation")
                                .boxed());
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn make_token(&self, kind: TokenKind) -> Token {
        Token::new(kind, Span::new(self.token_start, self.position))
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::with_kind(
            ErrorKind::InvalidToken,
            message,
            Span::new(self.token_start, self.position),
        )
        .with_source(self.source)
    }

    fn single(&mut self, kind: TokenKind) -> TokenKind {
        self.advance();
        kind
    }

    /// `c` or `cc`, e.g. `*` and `**`
    fn one_or_two(&mut self, ch: char, one: TokenKind, two: TokenKind) -> TokenKind {
        self.advance();
        if self.current == Some(ch) {
            self.advance();
            two
        } else {
            one
        }
    }

    fn take_while(&mut self, mut pred: impl FnMut(char) -> bool) -> String {
        let mut value = String::new();
        while let Some(ch) = self.current {
            if !pred(ch) {
                break;
            }
            value.push(ch);
            self.advance();
        }
        value
    }

    /// String literal, the opening quote under the cursor
    fn lex_string(&mut self, raw: bool) -> ParseResult<TokenKind> {
        let Some(quote) = self.current else {
            return Err(self.error("Expected string literal").boxed());
        };
        self.advance();
        let triple = self.current == Some(quote) && self.peek() == Some(quote);
        if triple {
            self.advance();
            self.advance();
        } else if self.current == Some(quote) {
            self.advance();
            return Ok(TokenKind::Str(String::new()));
        }

        let mut value = String::new();
        loop {
            let Some(ch) = self.current else {
                return Err(self
                    .error("Unterminated string literal")
                    .with_suggestion(format!("Add a closing {}", quote))
                    .boxed());
            };
            if ch == quote {
                if !triple {
                    self.advance();
                    return Ok(TokenKind::Str(value));
                }
                let mut ahead = self.chars.clone();
                if ahead.next() == Some(quote) && ahead.next() == Some(quote) {
                    self.advance();
                    self.advance();
                    self.advance();
                    return Ok(TokenKind::Str(value));
                }
            }
            if ch == '\n' && !triple {
                return Err(self
                    .error("Unterminated string literal")
                    .with_suggestion("Single-quoted strings cannot span lines")
                    .boxed());
            }
            self.advance();

            if ch != '\\' {
                value.push(ch);
                continue;
            }
            let Some(escaped) = self.current else {
                continue;
            };
            if raw {
                value.push('\\');
                value.push(escaped);
                self.advance();
                continue;
            }
            self.advance();
            match escaped {
                '\n' => {}
                'n' => value.push('\n'),
                't' => value.push('\t'),
                'r' => value.push('\r'),
                'a' => value.push('\x07'),
                'b' => value.push('\x08'),
                'f' => value.push('\x0c'),
                'v' => value.push('\x0b'),
                '\\' | '\'' | '"' => value.push(escaped),
                'x' => {
                    let digits = self.take_limited(2, |c| c.is_ascii_hexdigit());
                    let code = u32::from_str_radix(&digits, 16)
                        .ok()
                        .filter(|_| digits.len() == 2)
                        .and_then(char::from_u32)
                        .ok_or_else(|| self.error("Invalid \\x escape").boxed())?;
                    value.push(code);
                }
                '0'..='7' => {
                    let mut digits = escaped.to_string();
                    digits.push_str(&self.take_limited(2, |c| ('0'..='7').contains(&c)));
                    let code = u32::from_str_radix(&digits, 8)
                        .ok()
                        .and_then(char::from_u32)
                        .ok_or_else(|| self.error("Invalid octal escape").boxed())?;
                    value.push(code);
                }
                // Unknown escapes keep their backslash
                other => {
                    value.push('\\');
                    value.push(other);
                }
            }
        }
    }

    fn take_limited(&mut self, limit: usize, pred: impl Fn(char) -> bool) -> String {
        let mut taken = 0;
        self.take_while(|c| {
            taken += 1;
            taken <= limit && pred(c)
        })
    }

    fn lex_number(&mut self) -> ParseResult<TokenKind> {
        if self.current == Some('0') && matches!(self.peek(), Some('x' | 'X')) {
            self.advance();
            self.advance();
            let digits = self.take_while(|c| c.is_ascii_hexdigit());
            return self.finish_int(&digits, 16);
        }

        let mut text = self.take_while(|c| c.is_ascii_digit());
        let mut is_float = false;

        if self.current == Some('.') {
            is_float = true;
            text.push('.');
            self.advance();
            text.push_str(&self.take_while(|c| c.is_ascii_digit()));
        }
        if matches!(self.current, Some('e' | 'E')) {
            is_float = true;
            text.push('e');
            self.advance();
            if let Some(sign @ ('+' | '-')) = self.current {
                text.push(sign);
                self.advance();
            }
            let exponent = self.take_while(|c| c.is_ascii_digit());
            if exponent.is_empty() {
                return Err(self.error("Missing exponent digits").boxed());
            }
            text.push_str(&exponent);
        }
        if matches!(self.current, Some('j' | 'J')) {
            self.advance();
            return Err(ParseError::unsupported(
                "complex literals",
                Span::new(self.token_start, self.position),
            )
            .boxed());
        }

        if is_float {
            return text
                .parse::<f64>()
                .map(TokenKind::Float)
                .map_err(|_| self.error(format!("Invalid float literal '{}'", text)).boxed());
        }
        // A leading zero means octal
        if text.len() > 1 && text.starts_with('0') {
            return self.finish_int(&text[1..], 8);
        }
        self.finish_int(&text, 10)
    }

    fn finish_int(&mut self, digits: &str, radix: u32) -> ParseResult<TokenKind> {
        // Long suffix
        if matches!(self.current, Some('l' | 'L')) {
            self.advance();
        }
        if matches!(self.current, Some(c) if c.is_ascii_alphanumeric() || c == '_') {
            return Err(self.error("Invalid character in number literal").boxed());
        }
        i64::from_str_radix(digits, radix)
            .map(TokenKind::Int)
            .map_err(|_| self.error("Invalid or out-of-range integer literal").boxed())
    }

    fn lex_name_or_prefixed_string(&mut self) -> ParseResult<TokenKind> {
        let value = self.take_while(|c| c.is_ascii_alphanumeric() || c == '_');

        if matches!(self.current, Some('\'' | '"')) {
            let prefix = value.to_ascii_lowercase();
            match prefix.as_str() {
                "u" | "b" => return self.lex_string(false),
                "r" | "ur" | "br" => return self.lex_string(true),
                _ => {}
            }
        }

        Ok(match value.as_str() {
            "and" => TokenKind::And,
            "or" => TokenKind::Or,
            "not" => TokenKind::Not,
            "in" => TokenKind::In,
            "is" => TokenKind::Is,
            "for" => TokenKind::For,
            "if" => TokenKind::If,
            "else" => TokenKind::Else,
            "lambda" => TokenKind::Lambda,
            _ => TokenKind::Name(value),
        })
    }
}
