//! Expression parser and reference compiler
//!
//! Parses Python 2 expression source into the same [`Node`] model the
//! decompiler produces, and compiles it to the bytecode format the
//! decompiler reads. Together they form the oracle for round-trip
//! conformance tests; the decompiler itself never depends on this module.

pub mod compiler;
pub mod error;
pub mod lexer;
mod peephole;


pub use compiler::{CompileOptions, Compiler};
pub use error::{ErrorKind, ParseError, ParseResult};
pub use lexer::{Lexer, Position, Span, Token, TokenKind};

use crate::artifact::CodeArtifact;
use crate::ast::{
    AssignTarget, BinaryKind, BoolKind, CompareOp, GenExprFor, GenExprInner, Keyword, Lambda,
    Literal, Node, UnaryKind,
};

/// Parse a single expression
pub fn parse(source: &str) -> ParseResult<Node> {
    Parser::new(Lexer::new(source))?.parse_expression()
}

/// Parse and compile an expression with default options
///
/// A generator expression compiles to its `<genexpr>` code object, whose
/// first loop reads the `.0` argument; anything else compiles to the body
/// of an argument-less `<lambda>`.
pub fn compile(source: &str) -> ParseResult<CodeArtifact> {
    compile_with(source, &CompileOptions::default())
}

pub fn compile_with(source: &str, options: &CompileOptions) -> ParseResult<CodeArtifact> {
    let node = parse(source)?;
    Compiler::with_options(options.clone())
        .compile(&node)
        .map_err(|error| (*error).with_source(source).boxed())
}

pub struct Parser<'a> {
    lexer: Lexer<'a>,
    current: Token,
    peek: Token,
    source: &'a str,
}

impl<'a> Parser<'a> {
    pub fn new(mut lexer: Lexer<'a>) -> ParseResult<Self> {
        let source = lexer.source();
        let current = lexer.next_token()?;
        let peek = lexer.next_token()?;
        Ok(Parser {
            lexer,
            current,
            peek,
            source,
        })
    }

    /// Add source context to an error
    fn enrich_error(&self, error: Box<ParseError>) -> Box<ParseError> {
        if error.source.is_some() {
            return error;
        }
        (*error).with_source(self.source).boxed()
    }

    /// Parse the whole input as one expression
    pub fn parse_expression(&mut self) -> ParseResult<Node> {
        let result = self.parse_testlist().and_then(|node| {
            if self.check(&TokenKind::Eof) {
                Ok(node)
            } else {
                Err(ParseError::expected(TokenKind::Eof, self.current.clone()).boxed())
            }
        });
        result.map_err(|error| self.enrich_error(error))
    }

    /// `test (',' test)* [',']`, a bare tuple when commas are present
    fn parse_testlist(&mut self) -> ParseResult<Node> {
        let first = self.parse_test()?;
        if !self.check(&TokenKind::Comma) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(&TokenKind::Comma)? {
            if self.check(&TokenKind::Eof) {
                break;
            }
            items.push(self.parse_test()?);
        }
        Ok(Node::Tuple(items))
    }

    /// `or_test ['if' or_test 'else' test] | lambdef`
    pub fn parse_test(&mut self) -> ParseResult<Node> {
        if self.check(&TokenKind::Lambda) {
            return self.parse_lambda(Self::parse_test);
        }
        let body = self.parse_or_test()?;
        if !self.eat(&TokenKind::If)? {
            return Ok(body);
        }
        let test = self.parse_or_test()?;
        self.expect(TokenKind::Else)?;
        let orelse = self.parse_test()?;
        Ok(Node::if_exp(test, body, orelse))
    }

    /// Generator filters take no unparenthesized conditional expression
    fn parse_old_test(&mut self) -> ParseResult<Node> {
        if self.check(&TokenKind::Lambda) {
            return self.parse_lambda(Self::parse_old_test);
        }
        self.parse_or_test()
    }

    /// `lambda [params]: body`
    fn parse_lambda(&mut self, parse_body: fn(&mut Self) -> ParseResult<Node>) -> ParseResult<Node> {
        self.expect(TokenKind::Lambda)?;
        let mut seen = Vec::new();
        let mut args = Vec::new();
        let mut varargs = None;
        let mut kwargs = None;

        while !self.check(&TokenKind::Colon) {
            let start = self.current.span;
            if kwargs.is_some() {
                return Err(ParseError::at_span("Parameters cannot follow '**'", start).boxed());
            }
            if self.eat(&TokenKind::DoubleStar)? {
                kwargs = Some(self.parse_parameter(&mut seen)?);
            } else if self.eat(&TokenKind::Star)? {
                if varargs.is_some() {
                    return Err(ParseError::at_span("Only one '*' parameter is allowed", start)
                        .boxed());
                }
                varargs = Some(self.parse_parameter(&mut seen)?);
            } else if varargs.is_some() {
                return Err(ParseError::at_span("Parameters cannot follow '*'", start).boxed());
            } else {
                args.push(self.parse_parameter(&mut seen)?);
            }

            if !self.eat(&TokenKind::Comma)? {
                break;
            }
        }
        self.expect(TokenKind::Colon)?;
        let body = parse_body(self)?;

        Ok(Node::Lambda(Box::new(Lambda {
            args,
            varargs,
            kwargs,
            body,
        })))
    }

    fn parse_parameter(&mut self, seen: &mut Vec<String>) -> ParseResult<String> {
        let token = self.current.clone();
        let name = match token.kind {
            TokenKind::Name(name) => name,
            TokenKind::LParen => {
                return Err(ParseError::unsupported("tuple parameters", token.span).boxed());
            }
            other => {
                return Err(ParseError::with_kind(
                    ErrorKind::InvalidExpression,
                    format!("Expected parameter name, found {}", other),
                    token.span,
                )
                .boxed());
            }
        };
        if seen.contains(&name) {
            return Err(ParseError::with_kind(
                ErrorKind::InvalidExpression,
                format!("Duplicate parameter '{}' in lambda", name),
                token.span,
            )
            .boxed());
        }
        self.advance()?;
        if self.check(&TokenKind::Eq) {
            return Err(ParseError::unsupported("default arguments", self.current.span)
                .with_suggestion("Bind the value outside the lambda")
                .boxed());
        }
        seen.push(name.clone());
        Ok(name)
    }

    fn parse_or_test(&mut self) -> ParseResult<Node> {
        let first = self.parse_and_test()?;
        if !self.check(&TokenKind::Or) {
            return Ok(first);
        }
        let mut operands = vec![first];
        while self.eat(&TokenKind::Or)? {
            operands.push(self.parse_and_test()?);
        }
        Ok(Node::bool_op(BoolKind::Or, operands))
    }

    fn parse_and_test(&mut self) -> ParseResult<Node> {
        let first = self.parse_not_test()?;
        if !self.check(&TokenKind::And) {
            return Ok(first);
        }
        let mut operands = vec![first];
        while self.eat(&TokenKind::And)? {
            operands.push(self.parse_not_test()?);
        }
        Ok(Node::bool_op(BoolKind::And, operands))
    }

    fn parse_not_test(&mut self) -> ParseResult<Node> {
        if self.eat(&TokenKind::Not)? {
            return Ok(Node::not(self.parse_not_test()?));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> ParseResult<Node> {
        let first = self.parse_expr(0)?;
        let mut operands = vec![first];
        let mut ops = Vec::new();

        loop {
            let op = match self.current.kind {
                TokenKind::Lt => CompareOp::Lt,
                TokenKind::LtEq => CompareOp::Le,
                TokenKind::EqEq => CompareOp::Eq,
                TokenKind::NotEq => CompareOp::Ne,
                TokenKind::Gt => CompareOp::Gt,
                TokenKind::GtEq => CompareOp::Ge,
                TokenKind::In => CompareOp::In,
                TokenKind::Not if self.peek.kind == TokenKind::In => {
                    self.advance()?;
                    CompareOp::NotIn
                }
                TokenKind::Is if self.peek.kind == TokenKind::Not => {
                    self.advance()?;
                    CompareOp::IsNot
                }
                TokenKind::Is => CompareOp::Is,
                _ => break,
            };
            self.advance()?;
            ops.push(op);
            operands.push(self.parse_expr(0)?);
        }

        match operands.pop() {
            Some(only) if ops.is_empty() => Ok(only),
            Some(last) => {
                operands.push(last);
                Ok(Node::CompareChain { operands, ops })
            }
            None => Err(ParseError::at_span("Expected expression", self.current.span).boxed()),
        }
    }

    /// Binary operators by precedence climbing, `|` loosest
    fn parse_expr(&mut self, min_precedence: u8) -> ParseResult<Node> {
        let mut left = self.parse_factor()?;

        while let Some((op, precedence)) = self.current_binary_op() {
            if precedence < min_precedence {
                break;
            }
            self.advance()?;
            let right = self.parse_expr(precedence + 1)?;
            left = Node::binary(op, left, right);
        }

        Ok(left)
    }

    fn current_binary_op(&self) -> Option<(BinaryKind, u8)> {
        let (op, precedence) = match self.current.kind {
            TokenKind::Pipe => (BinaryKind::BitOr, 1),
            TokenKind::Caret => (BinaryKind::BitXor, 2),
            TokenKind::Amp => (BinaryKind::BitAnd, 3),
            TokenKind::LShift => (BinaryKind::LShift, 4),
            TokenKind::RShift => (BinaryKind::RShift, 4),
            TokenKind::Plus => (BinaryKind::Add, 5),
            TokenKind::Minus => (BinaryKind::Sub, 5),
            TokenKind::Star => (BinaryKind::Mul, 6),
            TokenKind::Slash => (BinaryKind::Div, 6),
            TokenKind::DoubleSlash => (BinaryKind::FloorDiv, 6),
            TokenKind::Percent => (BinaryKind::Mod, 6),
            _ => return None,
        };
        Some((op, precedence))
    }

    fn parse_factor(&mut self) -> ParseResult<Node> {
        let op = match self.current.kind {
            TokenKind::Plus => UnaryKind::Plus,
            TokenKind::Minus => UnaryKind::Minus,
            TokenKind::Tilde => UnaryKind::Invert,
            _ => return self.parse_power(),
        };
        self.advance()?;

        // A minus directly on a number literal is part of the literal
        let literal = match (op, &self.current.kind) {
            (UnaryKind::Minus, TokenKind::Int(i)) => Some(Literal::Int(*i)),
            (UnaryKind::Minus, TokenKind::Float(x)) => Some(Literal::Float(*x)),
            _ => None,
        };
        let operand = self.parse_factor()?;
        match literal {
            Some(Literal::Int(i)) if operand == Node::int(i) => Ok(Node::int(-i)),
            Some(Literal::Float(x)) if operand == Node::Const(Literal::Float(x)) => {
                Ok(Node::Const(Literal::Float(-x)))
            }
            _ => Ok(Node::unary(op, operand)),
        }
    }

    fn parse_power(&mut self) -> ParseResult<Node> {
        let base = self.parse_atom()?;
        let base = self.parse_trailers(base)?;
        if self.eat(&TokenKind::DoubleStar)? {
            let exponent = self.parse_factor()?;
            return Ok(Node::binary(BinaryKind::Power, base, exponent));
        }
        Ok(base)
    }

    fn parse_atom(&mut self) -> ParseResult<Node> {
        let token = self.current.clone();
        match token.kind {
            TokenKind::Int(i) => {
                self.advance()?;
                Ok(Node::int(i))
            }
            TokenKind::Float(x) => {
                self.advance()?;
                Ok(Node::Const(Literal::Float(x)))
            }
            TokenKind::Str(_) => {
                // Adjacent literals concatenate
                let mut value = String::new();
                while let TokenKind::Str(part) = &self.current.kind {
                    value.push_str(part);
                    self.advance()?;
                }
                Ok(Node::str(value))
            }
            TokenKind::Name(name) => {
                self.advance()?;
                Ok(Node::Name(name))
            }
            TokenKind::LParen => self.parse_parenthesized(),
            TokenKind::LBracket => self.parse_list(),
            TokenKind::LBrace => self.parse_dict(),
            TokenKind::Backquote => {
                self.advance()?;
                let value = self.parse_testlist_until(&TokenKind::Backquote)?;
                self.expect(TokenKind::Backquote)?;
                Ok(Node::unary(UnaryKind::Backquote, value))
            }
            _ => Err(ParseError::with_kind(
                ErrorKind::InvalidExpression,
                format!("Expected expression, found {}", token.kind),
                token.span,
            )
            .boxed()),
        }
    }

    /// Comma-separated tests up to `close`; several become a tuple
    fn parse_testlist_until(&mut self, close: &TokenKind) -> ParseResult<Node> {
        let first = self.parse_test()?;
        if !self.check(&TokenKind::Comma) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(&TokenKind::Comma)? {
            if self.check(close) {
                break;
            }
            items.push(self.parse_test()?);
        }
        Ok(Node::Tuple(items))
    }

    fn parse_parenthesized(&mut self) -> ParseResult<Node> {
        self.expect(TokenKind::LParen)?;
        if self.eat(&TokenKind::RParen)? {
            return Ok(Node::Tuple(Vec::new()));
        }

        let first = self.parse_test()?;
        let node = if self.check(&TokenKind::For) {
            self.parse_genexpr(first)?
        } else if self.check(&TokenKind::Comma) {
            let mut items = vec![first];
            while self.eat(&TokenKind::Comma)? {
                if self.check(&TokenKind::RParen) {
                    break;
                }
                items.push(self.parse_test()?);
            }
            Node::Tuple(items)
        } else {
            first
        };
        self.expect(TokenKind::RParen)?;
        Ok(node)
    }

    fn parse_list(&mut self) -> ParseResult<Node> {
        let open = self.expect(TokenKind::LBracket)?;
        let mut items = Vec::new();
        while !self.check(&TokenKind::RBracket) {
            items.push(self.parse_test()?);
            if self.check(&TokenKind::For) {
                return Err(ParseError::unsupported(
                    "list comprehensions",
                    open.span.to(self.current.span),
                )
                .with_suggestion("Use a generator expression: '(x for x in xs)'")
                .boxed());
            }
            if !self.eat(&TokenKind::Comma)? {
                break;
            }
        }
        self.expect(TokenKind::RBracket)?;
        Ok(Node::List(items))
    }

    fn parse_dict(&mut self) -> ParseResult<Node> {
        self.expect(TokenKind::LBrace)?;
        let mut pairs = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            let key = self.parse_test()?;
            self.expect(TokenKind::Colon)?;
            let value = self.parse_test()?;
            pairs.push((key, value));
            if !self.eat(&TokenKind::Comma)? {
                break;
            }
        }
        self.expect(TokenKind::RBrace)?;
        Ok(Node::Dict(pairs))
    }

    /// `for ... in ... [if ...]` clauses following the element
    fn parse_genexpr(&mut self, expr: Node) -> ParseResult<Node> {
        let mut clauses: Vec<GenExprFor> = Vec::new();

        while self.eat(&TokenKind::For)? {
            let target = self.parse_target_list()?;
            self.expect(TokenKind::In)?;
            let iter = self.parse_or_test()?;
            clauses.push(GenExprFor {
                target,
                iter,
                ifs: Vec::new(),
            });

            while self.eat(&TokenKind::If)? {
                let cond = self.parse_old_test()?;
                if let Some(clause) = clauses.last_mut() {
                    clause.ifs.push(cond);
                }
            }
        }

        Ok(Node::GenExprInner(Box::new(GenExprInner { expr, clauses })))
    }

    /// `expr (',' expr)* [',']` as a loop target
    fn parse_target_list(&mut self) -> ParseResult<AssignTarget> {
        let start = self.current.span;
        let first = self.parse_expr(0)?;
        let node = if self.check(&TokenKind::Comma) {
            let mut items = vec![first];
            while self.eat(&TokenKind::Comma)? {
                if self.check(&TokenKind::In) {
                    break;
                }
                items.push(self.parse_expr(0)?);
            }
            Node::Tuple(items)
        } else {
            first
        };
        to_target(node, start.to(self.current.span))
    }

    fn parse_trailers(&mut self, mut node: Node) -> ParseResult<Node> {
        loop {
            match self.current.kind {
                TokenKind::LParen => node = self.parse_call(node)?,
                TokenKind::LBracket => {
                    self.advance()?;
                    let index = self.parse_subscript_list()?;
                    self.expect(TokenKind::RBracket)?;
                    node = Node::subscript(node, index);
                }
                TokenKind::Dot => {
                    self.advance()?;
                    let name = self.expect_name()?;
                    node = Node::attribute(node, name);
                }
                _ => return Ok(node),
            }
        }
    }

    fn parse_call(&mut self, func: Node) -> ParseResult<Node> {
        self.expect(TokenKind::LParen)?;
        let mut args = Vec::new();
        let mut keywords = Vec::new();
        let mut star_args = None;
        let mut kwargs = None;

        while !self.check(&TokenKind::RParen) {
            let start = self.current.span;
            if kwargs.is_some() {
                return Err(ParseError::at_span(
                    "Arguments cannot follow '**' arguments",
                    start,
                )
                .boxed());
            }

            if self.eat(&TokenKind::DoubleStar)? {
                kwargs = Some(Box::new(self.parse_test()?));
            } else if self.eat(&TokenKind::Star)? {
                if star_args.is_some() {
                    return Err(ParseError::at_span("Only one '*' argument is allowed", start)
                        .boxed());
                }
                star_args = Some(Box::new(self.parse_test()?));
            } else {
                let arg = self.parse_test()?;
                if self.check(&TokenKind::For) {
                    // Sole unparenthesized generator argument
                    let genexpr = self.parse_genexpr(arg)?;
                    if !args.is_empty() || !keywords.is_empty() || !self.check(&TokenKind::RParen) {
                        return Err(ParseError::with_kind(
                            ErrorKind::InvalidExpression,
                            "Generator expression must be parenthesized if not sole argument",
                            start.to(self.current.span),
                        )
                        .boxed());
                    }
                    args.push(genexpr);
                } else if self.eat(&TokenKind::Eq)? {
                    let name = match arg {
                        Node::Name(name) => name,
                        other => {
                            return Err(ParseError::with_kind(
                                ErrorKind::InvalidExpression,
                                format!("Keyword can't be an expression: {}", other),
                                start,
                            )
                            .boxed());
                        }
                    };
                    let value = self.parse_test()?;
                    keywords.push(Keyword { name, value });
                } else if !keywords.is_empty() || star_args.is_some() {
                    return Err(ParseError::with_kind(
                        ErrorKind::InvalidExpression,
                        "Non-keyword argument after keyword argument",
                        start,
                    )
                    .boxed());
                } else {
                    args.push(arg);
                }
            }

            if !self.eat(&TokenKind::Comma)? {
                break;
            }
        }
        self.expect(TokenKind::RParen)?;

        Ok(Node::Call {
            func: Box::new(func),
            args,
            keywords,
            star_args,
            kwargs,
        })
    }

    /// Index of a subscript; several comma-separated items form a tuple
    fn parse_subscript_list(&mut self) -> ParseResult<Node> {
        let first = self.parse_subscript()?;
        if !self.check(&TokenKind::Comma) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(&TokenKind::Comma)? {
            if self.check(&TokenKind::RBracket) {
                break;
            }
            items.push(self.parse_subscript()?);
        }
        Ok(Node::Tuple(items))
    }

    /// `test` or `[test] ':' [test] [':' [test]]`
    fn parse_subscript(&mut self) -> ParseResult<Node> {
        let lower = if self.check(&TokenKind::Colon) {
            None
        } else {
            let index = self.parse_test()?;
            if !self.check(&TokenKind::Colon) {
                return Ok(index);
            }
            Some(Box::new(index))
        };
        self.expect(TokenKind::Colon)?;

        let upper = self.parse_slice_bound()?;
        let step = if self.eat(&TokenKind::Colon)? {
            self.parse_slice_bound()?
        } else {
            None
        };
        Ok(Node::Slice { lower, upper, step })
    }

    fn parse_slice_bound(&mut self) -> ParseResult<Option<Box<Node>>> {
        match self.current.kind {
            TokenKind::Colon | TokenKind::Comma | TokenKind::RBracket => Ok(None),
            _ => Ok(Some(Box::new(self.parse_test()?))),
        }
    }

    fn advance(&mut self) -> ParseResult<Token> {
        let next = self.lexer.next_token()?;
        let peek = std::mem::replace(&mut self.peek, next);
        Ok(std::mem::replace(&mut self.current, peek))
    }

    fn check(&self, kind: &TokenKind) -> bool {
        &self.current.kind == kind
    }

    /// Consume the current token if it matches
    fn eat(&mut self, kind: &TokenKind) -> ParseResult<bool> {
        if self.check(kind) {
            self.advance()?;
            return Ok(true);
        }
        Ok(false)
    }

    fn expect(&mut self, kind: TokenKind) -> ParseResult<Token> {
        if self.check(&kind) {
            self.advance()
        } else {
            Err(ParseError::expected(kind, self.current.clone()).boxed())
        }
    }

    fn expect_name(&mut self) -> ParseResult<String> {
        match &self.current.kind {
            TokenKind::Name(name) => {
                let name = name.clone();
                self.advance()?;
                Ok(name)
            }
            other => Err(ParseError::at_span(
                format!("Expected name after '.', found {}", other),
                self.current.span,
            )
            .boxed()),
        }
    }
}

/// Reinterpret a parsed expression as an assignment target
fn to_target(node: Node, span: Span) -> ParseResult<AssignTarget> {
    let invalid = |what: String| {
        ParseError::with_kind(
            ErrorKind::InvalidTarget,
            format!("Can't assign to {}", what),
            span,
        )
        .boxed()
    };
    match node {
        Node::Name(name) if name == "None" => Err(invalid("None".to_string())),
        Node::Name(name) => Ok(AssignTarget::Name(name)),
        Node::Tuple(items) | Node::List(items) => Ok(AssignTarget::Tuple(
            items
                .into_iter()
                .map(|item| to_target(item, span))
                .collect::<ParseResult<Vec<_>>>()?,
        )),
        Node::Attribute { target, name } => Ok(AssignTarget::Attribute {
            target: *target,
            name,
        }),
        Node::Subscript { target, index } => Ok(AssignTarget::Subscript {
            target: *target,
            index: *index,
        }),
        other => Err(invalid(format!("'{}'", other))),
    }
}
