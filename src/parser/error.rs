//! Error types for the expression parser and reference compiler

use super::lexer::{Span, Token, TokenKind};
use std::fmt;

/// Result type for parser and compiler operations
pub type ParseResult<T> = Result<T, Box<ParseError>>;

/// Error kind for categorization and better messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UnexpectedToken,
    UnexpectedEof,
    /// Character or literal the lexer cannot turn into a token
    InvalidToken,
    MissingDelimiter,
    InvalidExpression,
    /// Expression used where a loop target is required
    InvalidTarget,
    /// Valid source the reference compiler does not emit code for
    Unsupported,
    Other,
}

/// Parse error with location information and helpful context
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub kind: ErrorKind,
    pub message: String,
    pub span: Span,
    pub suggestion: Option<String>,
    pub source: Option<String>,
}

impl ParseError {
    pub fn new(message: String, span: Span) -> Self {
        Self::with_kind(ErrorKind::Other, message, span)
    }

    /// Create an "expected token" error
    pub fn expected(expected: TokenKind, found: Token) -> Self {
        let kind = match found.kind {
            TokenKind::Eof => ErrorKind::UnexpectedEof,
            _ => ErrorKind::UnexpectedToken,
        };
        let mut error = Self::with_kind(
            kind,
            format!("Expected {}, found {}", expected, found.kind),
            found.span,
        );
        error.suggestion = Self::suggest_for_expected(&expected, &found.kind);
        error
    }

    /// Create a custom error at a specific span
    pub fn at_span(message: impl Into<String>, span: Span) -> Self {
        Self::with_kind(ErrorKind::Other, message, span)
    }

    /// Create an error with a specific kind
    pub fn with_kind(kind: ErrorKind, message: impl Into<String>, span: Span) -> Self {
        ParseError {
            kind,
            message: message.into(),
            span,
            suggestion: None,
            source: None,
        }
    }

    /// Source construct the compiler has no encoding for
    pub fn unsupported(construct: &str, span: Span) -> Self {
        Self::with_kind(
            ErrorKind::Unsupported,
            format!("{} are not supported", construct),
            span,
        )
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Attach the source text for snippet rendering
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn boxed(self) -> Box<Self> {
        Box::new(self)
    }

    fn suggest_for_expected(expected: &TokenKind, found: &TokenKind) -> Option<String> {
        match (expected, found) {
            (TokenKind::RParen, TokenKind::Eof) => {
                Some("Add a closing parenthesis ')' to match the opening parenthesis".to_string())
            }
            (TokenKind::RBracket, TokenKind::Eof) => {
                Some("Add a closing bracket ']' to match the opening bracket".to_string())
            }
            (TokenKind::RBrace, TokenKind::Eof) => {
                Some("Add a closing brace '}' to match the opening brace".to_string())
            }
            (TokenKind::In, TokenKind::Eq) => {
                Some("Loop clauses are written 'for target in iterable'".to_string())
            }
            (TokenKind::Eof, TokenKind::For) => Some(
                "A generator expression must be parenthesized: '(x for x in xs)'".to_string(),
            ),
            _ => None,
        }
    }

    /// Render the error with a caret under the offending span
    ///
    /// `label` names the input in the location line, e.g. `<expr>`.
    pub fn format_with_source(&self, label: &str) -> String {
        let mut out = String::new();
        let start = self.span.start;
        out.push_str(&format!("error: {}\n", self.message));
        out.push_str(&format!("  --> {}:{}:{}\n", label, start.line, start.column));

        let line = self
            .source
            .as_deref()
            .and_then(|source| source.lines().nth(start.line.saturating_sub(1)));
        if let Some(line) = line {
            let gutter = " ".repeat(start.line.to_string().len());
            let end_column = if self.span.end.line == start.line {
                self.span.end.column
            } else {
                line.chars().count() + 1
            };
            let width = end_column.saturating_sub(start.column).max(1);
            out.push_str(&format!("{} |\n", gutter));
            out.push_str(&format!("{} | {}\n", start.line, line));
            out.push_str(&format!(
                "{} | {}{}\n",
                gutter,
                " ".repeat(start.column.saturating_sub(1)),
                "^".repeat(width)
            ));
        }

        if let Some(suggestion) = &self.suggestion {
            out.push_str(&format!("   = help: {}\n", suggestion));
        }
        out
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Parse error at {}: {}", self.span, self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, "\n  help: {}", suggestion)?;
        }
        Ok(())
    }
}

impl std::error::Error for ParseError {}
