//! Abstract Syntax Tree produced by the decompiler
//!
//! The node set is closed: consumers match exhaustively on [`Node`] with no
//! catch-all arm. The same model is produced by the source parser in
//! [`crate::parser`], so the two can be compared structurally.

use crate::constant_pool::quote_str;
pub use crate::opcodes::CompareOp;
use std::fmt;

/// Rendered name of the outer-iterable sentinel
pub const OUTER_ITERABLE_NAME: &str = ".0";

/// Literal constants
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryKind {
    Not,
    Invert,
    Plus,
    Minus,
    /// `` `x` ``, repr conversion
    Backquote,
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryKind {
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Power,

    // Bitwise
    LShift,
    RShift,
    BitAnd,
    BitOr,
    BitXor,
}

/// Short-circuit combinators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolKind {
    And,
    Or,
}

impl BoolKind {
    pub fn opposite(self) -> Self {
        match self {
            BoolKind::And => BoolKind::Or,
            BoolKind::Or => BoolKind::And,
        }
    }
}

/// `name=value` argument of a call
#[derive(Debug, Clone, PartialEq)]
pub struct Keyword {
    pub name: String,
    pub value: Node,
}

/// Expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Placeholder for the implicit first iterable of a generator
    /// expression; callers substitute the real collection
    OuterIterable,

    Name(String),
    Const(Literal),

    UnaryOp {
        op: UnaryKind,
        operand: Box<Node>,
    },

    BinOp {
        op: BinaryKind,
        left: Box<Node>,
        right: Box<Node>,
    },

    /// At least two operands, none of them a `BoolOp` of the same kind
    BoolOp {
        op: BoolKind,
        operands: Vec<Node>,
    },

    /// `operands[0] ops[0] operands[1] ops[1] ...`
    CompareChain {
        operands: Vec<Node>,
        ops: Vec<CompareOp>,
    },

    Call {
        func: Box<Node>,
        args: Vec<Node>,
        keywords: Vec<Keyword>,
        star_args: Option<Box<Node>>,
        kwargs: Option<Box<Node>>,
    },

    Attribute {
        target: Box<Node>,
        name: String,
    },

    Subscript {
        target: Box<Node>,
        index: Box<Node>,
    },

    /// Slice bounds; only meaningful as a `Subscript` index
    Slice {
        lower: Option<Box<Node>>,
        upper: Option<Box<Node>>,
        step: Option<Box<Node>>,
    },

    Tuple(Vec<Node>),
    List(Vec<Node>),
    Dict(Vec<(Node, Node)>),

    /// `body if test else orelse`
    IfExp {
        test: Box<Node>,
        body: Box<Node>,
        orelse: Box<Node>,
    },

    Lambda(Box<Lambda>),

    GenExprInner(Box<GenExprInner>),
}

/// `lambda args, *varargs, **kwargs: body`; defaults are not modelled
#[derive(Debug, Clone, PartialEq)]
pub struct Lambda {
    pub args: Vec<String>,
    pub varargs: Option<String>,
    pub kwargs: Option<String>,
    pub body: Node,
}

impl Lambda {
    /// Parameter names in slot order
    pub fn params(&self) -> impl Iterator<Item = &String> {
        self.args
            .iter()
            .chain(self.varargs.iter())
            .chain(self.kwargs.iter())
    }

    /// `co_flags` bits describing the parameter list
    pub fn flags(&self) -> u32 {
        let mut flags = 0;
        if self.varargs.is_some() {
            flags |= crate::artifact::CO_VARARGS;
        }
        if self.kwargs.is_some() {
            flags |= crate::artifact::CO_VARKEYWORDS;
        }
        flags
    }
}

/// `(expr for ... in ... if ...)`
#[derive(Debug, Clone, PartialEq)]
pub struct GenExprInner {
    pub expr: Node,
    /// Outermost loop first
    pub clauses: Vec<GenExprFor>,
}

/// One `for target in iter if ... if ...` clause
#[derive(Debug, Clone, PartialEq)]
pub struct GenExprFor {
    pub target: AssignTarget,
    pub iter: Node,
    /// Filter conditions in source order
    pub ifs: Vec<Node>,
}

/// Loop-variable pattern
#[derive(Debug, Clone, PartialEq)]
pub enum AssignTarget {
    Name(String),
    Tuple(Vec<AssignTarget>),
    Attribute { target: Node, name: String },
    Subscript { target: Node, index: Node },
}

// ===== Constructors =====

impl Node {
    pub fn name(name: impl Into<String>) -> Self {
        Node::Name(name.into())
    }

    pub fn int(value: i64) -> Self {
        Node::Const(Literal::Int(value))
    }

    pub fn str(value: impl Into<String>) -> Self {
        Node::Const(Literal::Str(value.into()))
    }

    pub fn unary(op: UnaryKind, operand: Node) -> Self {
        Node::UnaryOp {
            op,
            operand: Box::new(operand),
        }
    }

    pub fn not(operand: Node) -> Self {
        Node::unary(UnaryKind::Not, operand)
    }

    pub fn binary(op: BinaryKind, left: Node, right: Node) -> Self {
        Node::BinOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn compare(left: Node, op: CompareOp, right: Node) -> Self {
        Node::CompareChain {
            operands: vec![left, right],
            ops: vec![op],
        }
    }

    pub fn attribute(target: Node, name: impl Into<String>) -> Self {
        Node::Attribute {
            target: Box::new(target),
            name: name.into(),
        }
    }

    pub fn subscript(target: Node, index: Node) -> Self {
        Node::Subscript {
            target: Box::new(target),
            index: Box::new(index),
        }
    }

    /// Positional-only call
    pub fn call(func: Node, args: Vec<Node>) -> Self {
        Node::Call {
            func: Box::new(func),
            args,
            keywords: Vec::new(),
            star_args: None,
            kwargs: None,
        }
    }

    pub fn if_exp(test: Node, body: Node, orelse: Node) -> Self {
        Node::IfExp {
            test: Box::new(test),
            body: Box::new(body),
            orelse: Box::new(orelse),
        }
    }

    /// Combine operands under `op`, splicing in same-kind `BoolOp`s
    ///
    /// A single surviving operand is returned unwrapped.
    pub fn bool_op(op: BoolKind, operands: impl IntoIterator<Item = Node>) -> Self {
        let mut flat = Vec::new();
        for operand in operands {
            match operand {
                Node::BoolOp {
                    op: inner,
                    operands,
                } if inner == op => flat.extend(operands),
                other => flat.push(other),
            }
        }
        if flat.len() == 1 {
            if let Some(only) = flat.pop() {
                return only;
            }
        }
        Node::BoolOp { op, operands: flat }
    }

    pub fn is_outer_iterable(&self) -> bool {
        matches!(self, Node::OuterIterable)
    }

    /// Replace every outer-iterable sentinel in this tree
    ///
    /// Nested generator expressions and lambdas are left alone; a nested
    /// sentinel was bound by the call that created it.
    pub fn substitute_outer_iterable(&mut self, replacement: &Node) {
        match self {
            Node::OuterIterable => *self = replacement.clone(),
            Node::Name(_) | Node::Const(_) => {}
            Node::UnaryOp { operand, .. } => operand.substitute_outer_iterable(replacement),
            Node::BinOp { left, right, .. } => {
                left.substitute_outer_iterable(replacement);
                right.substitute_outer_iterable(replacement);
            }
            Node::BoolOp { operands, .. }
            | Node::CompareChain { operands, .. }
            | Node::Tuple(operands)
            | Node::List(operands) => {
                for operand in operands {
                    operand.substitute_outer_iterable(replacement);
                }
            }
            Node::Call {
                func,
                args,
                keywords,
                star_args,
                kwargs,
            } => {
                func.substitute_outer_iterable(replacement);
                for arg in args {
                    arg.substitute_outer_iterable(replacement);
                }
                for keyword in keywords {
                    keyword.value.substitute_outer_iterable(replacement);
                }
                for extra in [star_args, kwargs].into_iter().flatten() {
                    extra.substitute_outer_iterable(replacement);
                }
            }
            Node::Attribute { target, .. } => target.substitute_outer_iterable(replacement),
            Node::Subscript { target, index } => {
                target.substitute_outer_iterable(replacement);
                index.substitute_outer_iterable(replacement);
            }
            Node::Slice { lower, upper, step } => {
                for bound in [lower, upper, step].into_iter().flatten() {
                    bound.substitute_outer_iterable(replacement);
                }
            }
            Node::Dict(pairs) => {
                for (key, value) in pairs {
                    key.substitute_outer_iterable(replacement);
                    value.substitute_outer_iterable(replacement);
                }
            }
            Node::IfExp { test, body, orelse } => {
                test.substitute_outer_iterable(replacement);
                body.substitute_outer_iterable(replacement);
                orelse.substitute_outer_iterable(replacement);
            }
            Node::Lambda(_) | Node::GenExprInner(_) => {}
        }
    }
}

impl GenExprInner {
    /// Bind the outer iterable to a real collection expression
    pub fn with_outer_iterable(mut self, collection: Node) -> Self {
        self.expr.substitute_outer_iterable(&collection);
        for clause in &mut self.clauses {
            clause.iter.substitute_outer_iterable(&collection);
            for cond in &mut clause.ifs {
                cond.substitute_outer_iterable(&collection);
            }
        }
        self
    }

    /// True while the first clause still iterates the sentinel
    pub fn has_outer_iterable(&self) -> bool {
        self.clauses
            .first()
            .is_some_and(|clause| clause.iter.is_outer_iterable())
    }
}

// ===== Structural rendering =====

/// Render a node as a compiler-AST style structure, e.g.
/// `GenExprInner(Name('a'), [GenExprFor(AssName('b', 'OP_ASSIGN'), Name('.0'), [])])`
pub fn render(node: &Node) -> String {
    let mut out = String::new();
    render_node(node, &mut out);
    out
}

fn render_list<T>(items: &[T], out: &mut String, each: impl Fn(&T, &mut String)) {
    out.push('[');
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        each(item, out);
    }
    out.push(']');
}

fn render_optional(node: &Option<Box<Node>>, out: &mut String) {
    match node {
        Some(node) => render_node(node, out),
        None => out.push_str("None"),
    }
}

fn render_node(node: &Node, out: &mut String) {
    match node {
        Node::OuterIterable => {
            out.push_str("Name(");
            out.push_str(&quote_str(OUTER_ITERABLE_NAME));
            out.push(')');
        }
        Node::Name(name) => {
            out.push_str("Name(");
            out.push_str(&quote_str(name));
            out.push(')');
        }
        Node::Const(literal) => {
            out.push_str("Const(");
            out.push_str(&literal.to_string());
            out.push(')');
        }
        Node::UnaryOp { op, operand } => {
            out.push_str(match op {
                UnaryKind::Not => "Not(",
                UnaryKind::Invert => "Invert(",
                UnaryKind::Plus => "UnaryAdd(",
                UnaryKind::Minus => "UnarySub(",
                UnaryKind::Backquote => "Backquote(",
            });
            render_node(operand, out);
            out.push(')');
        }
        Node::BinOp { op, left, right } => {
            let (name, listed) = match op {
                BinaryKind::Add => ("Add", false),
                BinaryKind::Sub => ("Sub", false),
                BinaryKind::Mul => ("Mul", false),
                BinaryKind::Div => ("Div", false),
                BinaryKind::FloorDiv => ("FloorDiv", false),
                BinaryKind::Mod => ("Mod", false),
                BinaryKind::Power => ("Power", false),
                BinaryKind::LShift => ("LeftShift", false),
                BinaryKind::RShift => ("RightShift", false),
                BinaryKind::BitAnd => ("Bitand", true),
                BinaryKind::BitOr => ("Bitor", true),
                BinaryKind::BitXor => ("Bitxor", true),
            };
            out.push_str(name);
            out.push_str(if listed { "([" } else { "((" });
            render_node(left, out);
            out.push_str(", ");
            render_node(right, out);
            out.push_str(if listed { "])" } else { "))" });
        }
        Node::BoolOp { op, operands } => {
            out.push_str(match op {
                BoolKind::And => "And(",
                BoolKind::Or => "Or(",
            });
            render_list(operands, out, render_node);
            out.push(')');
        }
        Node::CompareChain { operands, ops } => {
            out.push_str("Compare(");
            if let Some(first) = operands.first() {
                render_node(first, out);
            }
            out.push_str(", ");
            let pairs: Vec<(&CompareOp, &Node)> = ops.iter().zip(operands.iter().skip(1)).collect();
            render_list(&pairs, out, |(op, operand), out| {
                out.push('(');
                out.push_str(&quote_str(op.symbol()));
                out.push_str(", ");
                render_node(operand, out);
                out.push(')');
            });
            out.push(')');
        }
        Node::Call {
            func,
            args,
            keywords,
            star_args,
            kwargs,
        } => {
            out.push_str("CallFunc(");
            render_node(func, out);
            out.push_str(", [");
            let mut first = true;
            for arg in args {
                if !first {
                    out.push_str(", ");
                }
                first = false;
                render_node(arg, out);
            }
            for keyword in keywords {
                if !first {
                    out.push_str(", ");
                }
                first = false;
                out.push_str("Keyword(");
                out.push_str(&quote_str(&keyword.name));
                out.push_str(", ");
                render_node(&keyword.value, out);
                out.push(')');
            }
            out.push_str("], ");
            render_optional(star_args, out);
            out.push_str(", ");
            render_optional(kwargs, out);
            out.push(')');
        }
        Node::Attribute { target, name } => {
            out.push_str("Getattr(");
            render_node(target, out);
            out.push_str(", ");
            out.push_str(&quote_str(name));
            out.push(')');
        }
        Node::Subscript { target, index } => {
            out.push_str("Subscript(");
            render_node(target, out);
            out.push_str(", 'OP_APPLY', [");
            render_node(index, out);
            out.push_str("])");
        }
        Node::Slice { lower, upper, step } => {
            out.push_str("Sliceobj([");
            render_optional(lower, out);
            out.push_str(", ");
            render_optional(upper, out);
            out.push_str(", ");
            render_optional(step, out);
            out.push_str("])");
        }
        Node::Tuple(items) => {
            out.push_str("Tuple(");
            render_list(items, out, render_node);
            out.push(')');
        }
        Node::List(items) => {
            out.push_str("List(");
            render_list(items, out, render_node);
            out.push(')');
        }
        Node::Dict(pairs) => {
            out.push_str("Dict(");
            render_list(pairs, out, |(key, value), out| {
                out.push('(');
                render_node(key, out);
                out.push_str(", ");
                render_node(value, out);
                out.push(')');
            });
            out.push(')');
        }
        Node::IfExp { test, body, orelse } => {
            out.push_str("IfExp(");
            render_node(test, out);
            out.push_str(", ");
            render_node(body, out);
            out.push_str(", ");
            render_node(orelse, out);
            out.push(')');
        }
        Node::Lambda(lambda) => {
            out.push_str("Lambda(");
            let names: Vec<&String> = lambda.params().collect();
            render_list(&names, out, |name, out| out.push_str(&quote_str(name)));
            out.push_str(", [], ");
            out.push_str(&lambda.flags().to_string());
            out.push_str(", ");
            render_node(&lambda.body, out);
            out.push(')');
        }
        Node::GenExprInner(inner) => render_genexpr(inner, out),
    }
}

fn render_genexpr(inner: &GenExprInner, out: &mut String) {
    out.push_str("GenExprInner(");
    render_node(&inner.expr, out);
    out.push_str(", ");
    render_list(&inner.clauses, out, |clause, out| {
        out.push_str("GenExprFor(");
        render_target(&clause.target, out);
        out.push_str(", ");
        render_node(&clause.iter, out);
        out.push_str(", ");
        render_list(&clause.ifs, out, |cond, out| {
            out.push_str("GenExprIf(");
            render_node(cond, out);
            out.push(')');
        });
        out.push(')');
    });
    out.push(')');
}

fn render_target(target: &AssignTarget, out: &mut String) {
    match target {
        AssignTarget::Name(name) => {
            out.push_str("AssName(");
            out.push_str(&quote_str(name));
            out.push_str(", 'OP_ASSIGN')");
        }
        AssignTarget::Tuple(items) => {
            out.push_str("AssTuple(");
            render_list(items, out, render_target);
            out.push(')');
        }
        AssignTarget::Attribute { target, name } => {
            out.push_str("AssAttr(");
            render_node(target, out);
            out.push_str(", ");
            out.push_str(&quote_str(name));
            out.push_str(", 'OP_ASSIGN')");
        }
        AssignTarget::Subscript { target, index } => {
            out.push_str("Subscript(");
            render_node(target, out);
            out.push_str(", 'OP_ASSIGN', [");
            render_node(index, out);
            out.push_str("])");
        }
    }
}

// ===== Source rendering =====

// Binding strength, loosest first
const PREC_LAMBDA: u8 = 1;
const PREC_IF: u8 = 2;
const PREC_OR: u8 = 3;
const PREC_AND: u8 = 4;
const PREC_NOT: u8 = 5;
const PREC_CMP: u8 = 6;
const PREC_BITOR: u8 = 7;
const PREC_BITXOR: u8 = 8;
const PREC_BITAND: u8 = 9;
const PREC_SHIFT: u8 = 10;
const PREC_ARITH: u8 = 11;
const PREC_TERM: u8 = 12;
const PREC_UNARY: u8 = 13;
const PREC_POWER: u8 = 14;
const PREC_ATOM: u8 = 15;

impl BinaryKind {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryKind::Add => "+",
            BinaryKind::Sub => "-",
            BinaryKind::Mul => "*",
            BinaryKind::Div => "/",
            BinaryKind::FloorDiv => "//",
            BinaryKind::Mod => "%",
            BinaryKind::Power => "**",
            BinaryKind::LShift => "<<",
            BinaryKind::RShift => ">>",
            BinaryKind::BitAnd => "&",
            BinaryKind::BitOr => "|",
            BinaryKind::BitXor => "^",
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            BinaryKind::Add | BinaryKind::Sub => PREC_ARITH,
            BinaryKind::Mul | BinaryKind::Div | BinaryKind::FloorDiv | BinaryKind::Mod => {
                PREC_TERM
            }
            BinaryKind::Power => PREC_POWER,
            BinaryKind::LShift | BinaryKind::RShift => PREC_SHIFT,
            BinaryKind::BitAnd => PREC_BITAND,
            BinaryKind::BitOr => PREC_BITOR,
            BinaryKind::BitXor => PREC_BITXOR,
        }
    }
}

impl Node {
    fn precedence(&self) -> u8 {
        match self {
            Node::Lambda(_) => PREC_LAMBDA,
            Node::IfExp { .. } => PREC_IF,
            Node::BoolOp {
                op: BoolKind::Or, ..
            } => PREC_OR,
            Node::BoolOp {
                op: BoolKind::And, ..
            } => PREC_AND,
            Node::UnaryOp {
                op: UnaryKind::Not, ..
            } => PREC_NOT,
            Node::CompareChain { .. } => PREC_CMP,
            Node::BinOp { op, .. } => op.precedence(),
            Node::UnaryOp { .. } => PREC_UNARY,
            // Negative literals print with a sign
            Node::Const(Literal::Int(i)) if *i < 0 => PREC_UNARY,
            Node::Const(Literal::Float(x)) if x.is_sign_negative() => PREC_UNARY,
            _ => PREC_ATOM,
        }
    }

    fn fmt_prec(&self, f: &mut fmt::Formatter<'_>, min: u8) -> fmt::Result {
        if self.precedence() < min {
            write!(f, "(")?;
            self.fmt_bare(f)?;
            write!(f, ")")
        } else {
            self.fmt_bare(f)
        }
    }

    fn fmt_bare(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::OuterIterable => write!(f, "{}", OUTER_ITERABLE_NAME),
            Node::Name(name) => write!(f, "{}", name),
            Node::Const(literal) => write!(f, "{}", literal),
            Node::UnaryOp { op, operand } => match op {
                UnaryKind::Not => {
                    write!(f, "not ")?;
                    operand.fmt_prec(f, PREC_NOT)
                }
                UnaryKind::Backquote => write!(f, "`{}`", operand),
                UnaryKind::Invert | UnaryKind::Plus | UnaryKind::Minus => {
                    let sign = match op {
                        UnaryKind::Invert => "~",
                        UnaryKind::Plus => "+",
                        _ => "-",
                    };
                    write!(f, "{}", sign)?;
                    operand.fmt_prec(f, PREC_UNARY)
                }
            },
            Node::BinOp { op, left, right } => {
                let prec = op.precedence();
                if *op == BinaryKind::Power {
                    left.fmt_prec(f, PREC_ATOM)?;
                    write!(f, " ** ")?;
                    right.fmt_prec(f, PREC_UNARY)
                } else {
                    left.fmt_prec(f, prec)?;
                    write!(f, " {} ", op.symbol())?;
                    right.fmt_prec(f, prec + 1)
                }
            }
            Node::BoolOp { op, operands } => {
                let (word, prec) = match op {
                    BoolKind::And => (" and ", PREC_AND),
                    BoolKind::Or => (" or ", PREC_OR),
                };
                for (i, operand) in operands.iter().enumerate() {
                    if i > 0 {
                        f.write_str(word)?;
                    }
                    operand.fmt_prec(f, prec + 1)?;
                }
                Ok(())
            }
            Node::CompareChain { operands, ops } => {
                for (i, operand) in operands.iter().enumerate() {
                    if i > 0 {
                        if let Some(op) = ops.get(i - 1) {
                            write!(f, " {} ", op.symbol())?;
                        }
                    }
                    operand.fmt_prec(f, PREC_BITOR)?;
                }
                Ok(())
            }
            Node::Call {
                func,
                args,
                keywords,
                star_args,
                kwargs,
            } => {
                func.fmt_prec(f, PREC_ATOM)?;
                write!(f, "(")?;
                let mut parts: Vec<String> = args.iter().map(|arg| arg.to_string()).collect();
                parts.extend(keywords.iter().map(|kw| format!("{}={}", kw.name, kw.value)));
                if let Some(star) = star_args {
                    parts.push(format!("*{}", star));
                }
                if let Some(kw) = kwargs {
                    parts.push(format!("**{}", kw));
                }
                write!(f, "{})", parts.join(", "))
            }
            Node::Attribute { target, name } => {
                target.fmt_prec(f, PREC_ATOM)?;
                write!(f, ".{}", name)
            }
            Node::Subscript { target, index } => {
                target.fmt_prec(f, PREC_ATOM)?;
                match index.as_ref() {
                    Node::Tuple(items) if !items.is_empty() => {
                        write!(f, "[")?;
                        write_items(f, items)?;
                        if items.len() == 1 {
                            write!(f, ",")?;
                        }
                        write!(f, "]")
                    }
                    other => write!(f, "[{}]", other),
                }
            }
            Node::Slice { lower, upper, step } => {
                if let Some(lower) = lower {
                    write!(f, "{}", lower)?;
                }
                write!(f, ":")?;
                if let Some(upper) = upper {
                    write!(f, "{}", upper)?;
                }
                if let Some(step) = step {
                    write!(f, ":{}", step)?;
                }
                Ok(())
            }
            Node::Tuple(items) => {
                write!(f, "(")?;
                write_items(f, items)?;
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Node::List(items) => {
                write!(f, "[")?;
                write_items(f, items)?;
                write!(f, "]")
            }
            Node::Dict(pairs) => {
                write!(f, "{{")?;
                for (i, (key, value)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, value)?;
                }
                write!(f, "}}")
            }
            Node::IfExp { test, body, orelse } => {
                body.fmt_prec(f, PREC_OR)?;
                write!(f, " if ")?;
                test.fmt_prec(f, PREC_OR)?;
                write!(f, " else ")?;
                orelse.fmt_prec(f, PREC_LAMBDA)
            }
            Node::Lambda(lambda) => {
                write!(f, "lambda")?;
                let mut params: Vec<String> = lambda.args.clone();
                if let Some(varargs) = &lambda.varargs {
                    params.push(format!("*{}", varargs));
                }
                if let Some(kwargs) = &lambda.kwargs {
                    params.push(format!("**{}", kwargs));
                }
                if !params.is_empty() {
                    write!(f, " {}", params.join(", "))?;
                }
                write!(f, ": ")?;
                lambda.body.fmt_prec(f, PREC_LAMBDA)
            }
            Node::GenExprInner(inner) => write!(f, "{}", inner),
        }
    }
}

fn write_items(f: &mut fmt::Formatter<'_>, items: &[Node]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::None => write!(f, "None"),
            Literal::Bool(true) => write!(f, "True"),
            Literal::Bool(false) => write!(f, "False"),
            Literal::Int(i) => write!(f, "{}", i),
            Literal::Float(x) => write!(f, "{:?}", x),
            Literal::Str(s) => f.write_str(&quote_str(s)),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_bare(f)
    }
}

impl fmt::Display for AssignTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssignTarget::Name(name) => write!(f, "{}", name),
            AssignTarget::Tuple(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    match item {
                        AssignTarget::Tuple(_) => write!(f, "({})", item)?,
                        _ => write!(f, "{}", item)?,
                    }
                }
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                Ok(())
            }
            AssignTarget::Attribute { target, name } => {
                target.fmt_prec(f, PREC_ATOM)?;
                write!(f, ".{}", name)
            }
            AssignTarget::Subscript { target, index } => {
                target.fmt_prec(f, PREC_ATOM)?;
                write!(f, "[{}]", index)
            }
        }
    }
}

impl fmt::Display for GenExprInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        self.expr.fmt_prec(f, PREC_IF)?;
        for clause in &self.clauses {
            write!(f, " for {} in ", clause.target)?;
            clause.iter.fmt_prec(f, PREC_OR)?;
            for cond in &clause.ifs {
                write!(f, " if ")?;
                cond.fmt_prec(f, PREC_OR)?;
            }
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple(expr: Node, target: &str, ifs: Vec<Node>) -> GenExprInner {
        GenExprInner {
            expr,
            clauses: vec![GenExprFor {
                target: AssignTarget::Name(target.to_string()),
                iter: Node::OuterIterable,
                ifs,
            }],
        }
    }

    #[test]
    fn test_bool_op_flattens_same_kind() {
        let inner = Node::bool_op(BoolKind::And, [Node::name("a"), Node::name("b")]);
        let outer = Node::bool_op(BoolKind::And, [inner, Node::name("c")]);
        match outer {
            Node::BoolOp { op, operands } => {
                assert_eq!(op, BoolKind::And);
                assert_eq!(operands.len(), 3);
            }
            other => panic!("Expected BoolOp, got {:?}", other),
        }
    }

    #[test]
    fn test_bool_op_keeps_other_kind_nested() {
        let inner = Node::bool_op(BoolKind::Or, [Node::name("a"), Node::name("b")]);
        let outer = Node::bool_op(BoolKind::And, [inner.clone(), Node::name("c")]);
        match outer {
            Node::BoolOp { operands, .. } => assert_eq!(operands[0], inner),
            other => panic!("Expected BoolOp, got {:?}", other),
        }
    }

    #[test]
    fn test_bool_op_single_operand_unwraps() {
        assert_eq!(
            Node::bool_op(BoolKind::Or, [Node::name("x")]),
            Node::name("x")
        );
    }

    #[test]
    fn test_render_simple_genexpr() {
        let inner = simple(Node::name("a"), "b", vec![]);
        assert_eq!(
            render(&Node::GenExprInner(Box::new(inner))),
            "GenExprInner(Name('a'), [GenExprFor(AssName('b', 'OP_ASSIGN'), Name('.0'), [])])"
        );
    }

    #[test]
    fn test_render_operators() {
        let cond = Node::bool_op(
            BoolKind::Or,
            [
                Node::compare(Node::name("f"), CompareOp::Eq, Node::int(5)),
                Node::not(Node::name("t")),
            ],
        );
        assert_eq!(
            render(&cond),
            "Or([Compare(Name('f'), [('==', Const(5))]), Not(Name('t'))])"
        );

        let call = Node::Call {
            func: Box::new(Node::name("f")),
            args: vec![Node::binary(BinaryKind::Add, Node::name("a"), Node::int(1))],
            keywords: vec![Keyword {
                name: "k".to_string(),
                value: Node::str("v"),
            }],
            star_args: None,
            kwargs: Some(Box::new(Node::name("kw"))),
        };
        assert_eq!(
            render(&call),
            "CallFunc(Name('f'), [Add((Name('a'), Const(1))), Keyword('k', Const('v'))], None, Name('kw'))"
        );
    }

    #[test]
    fn test_render_targets() {
        let inner = GenExprInner {
            expr: Node::name("a"),
            clauses: vec![GenExprFor {
                target: AssignTarget::Tuple(vec![
                    AssignTarget::Name("b".to_string()),
                    AssignTarget::Attribute {
                        target: Node::name("o"),
                        name: "x".to_string(),
                    },
                ]),
                iter: Node::OuterIterable,
                ifs: vec![Node::name("f")],
            }],
        };
        assert_eq!(
            render(&Node::GenExprInner(Box::new(inner))),
            "GenExprInner(Name('a'), [GenExprFor(AssTuple([AssName('b', 'OP_ASSIGN'), \
             AssAttr(Name('o'), 'x', 'OP_ASSIGN')]), Name('.0'), [GenExprIf(Name('f'))])])"
        );
    }

    #[test]
    fn test_display_source_form() {
        let inner = simple(
            Node::name("a"),
            "b",
            vec![Node::bool_op(
                BoolKind::And,
                [
                    Node::bool_op(BoolKind::Or, [Node::name("x"), Node::name("y")]),
                    Node::not(Node::name("z")),
                ],
            )],
        );
        assert_eq!(inner.to_string(), "(a for b in .0 if (x or y) and not z)");
    }

    #[test]
    fn test_display_precedence() {
        let expr = Node::binary(
            BinaryKind::Mul,
            Node::binary(BinaryKind::Add, Node::name("a"), Node::name("b")),
            Node::unary(UnaryKind::Minus, Node::name("c")),
        );
        assert_eq!(expr.to_string(), "(a + b) * -c");

        let right = Node::binary(
            BinaryKind::Sub,
            Node::name("a"),
            Node::binary(BinaryKind::Sub, Node::name("b"), Node::name("c")),
        );
        assert_eq!(right.to_string(), "a - (b - c)");

        let power = Node::binary(
            BinaryKind::Power,
            Node::unary(UnaryKind::Minus, Node::name("a")),
            Node::name("b"),
        );
        assert_eq!(power.to_string(), "(-a) ** b");

        let sliced = Node::subscript(
            Node::name("s"),
            Node::Slice {
                lower: None,
                upper: Some(Box::new(Node::int(2))),
                step: None,
            },
        );
        assert_eq!(sliced.to_string(), "s[:2]");
        assert_eq!(Node::Tuple(vec![Node::int(1)]).to_string(), "(1,)");
    }

    #[test]
    fn test_with_outer_iterable() {
        let inner = simple(Node::name("a"), "a", vec![]);
        assert!(inner.has_outer_iterable());

        let bound = inner.with_outer_iterable(Node::name("Person"));
        assert!(!bound.has_outer_iterable());
        assert_eq!(bound.clauses[0].iter, Node::name("Person"));
        assert_eq!(bound.to_string(), "(a for a in Person)");
    }

    #[test]
    fn test_display_conditional_expression() {
        let both = Node::bool_op(BoolKind::And, [Node::name("a"), Node::name("b")]);
        let chained = Node::if_exp(
            Node::name("c"),
            both.clone(),
            Node::if_exp(Node::name("d"), Node::name("e"), Node::name("f")),
        );
        assert_eq!(chained.to_string(), "a and b if c else e if d else f");

        let nested_body = Node::if_exp(
            Node::name("c"),
            Node::if_exp(Node::name("d"), Node::name("e"), Node::name("f")),
            Node::name("g"),
        );
        assert_eq!(nested_body.to_string(), "(e if d else f) if c else g");

        let operand = Node::bool_op(
            BoolKind::Or,
            [Node::if_exp(Node::name("b"), Node::name("a"), Node::name("c")), Node::name("x")],
        );
        assert_eq!(operand.to_string(), "(a if b else c) or x");

        let cond = Node::if_exp(Node::name("b"), Node::name("a"), Node::name("c"));
        let inner = simple(cond.clone(), "x", vec![cond]);
        assert_eq!(
            inner.to_string(),
            "(a if b else c for x in .0 if (a if b else c))"
        );
    }

    #[test]
    fn test_display_lambda() {
        let lambda = Node::Lambda(Box::new(Lambda {
            args: vec!["x".to_string()],
            varargs: Some("r".to_string()),
            kwargs: Some("k".to_string()),
            body: Node::compare(Node::name("x"), CompareOp::Gt, Node::int(1)),
        }));
        assert_eq!(lambda.to_string(), "lambda x, *r, **k: x > 1");

        let call = Node::call(Node::name("f"), vec![lambda.clone()]);
        assert_eq!(call.to_string(), "f(lambda x, *r, **k: x > 1)");

        let operand = Node::bool_op(BoolKind::Or, [lambda, Node::name("y")]);
        assert_eq!(operand.to_string(), "(lambda x, *r, **k: x > 1) or y");

        let bare = Node::Lambda(Box::new(Lambda {
            args: vec![],
            varargs: None,
            kwargs: None,
            body: Node::if_exp(Node::name("b"), Node::name("a"), Node::name("c")),
        }));
        assert_eq!(bare.to_string(), "lambda: a if b else c");
    }

    #[test]
    fn test_render_conditional_and_lambda() {
        let cond = Node::if_exp(Node::name("t"), Node::name("b"), Node::name("o"));
        assert_eq!(render(&cond), "IfExp(Name('t'), Name('b'), Name('o'))");

        let lambda = Node::Lambda(Box::new(Lambda {
            args: vec!["x".to_string()],
            varargs: Some("r".to_string()),
            kwargs: None,
            body: Node::name("x"),
        }));
        assert_eq!(render(&lambda), "Lambda(['x', 'r'], [], 4, Name('x'))");
    }
}
