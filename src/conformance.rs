//! Round-trip conformance against the reference compiler
//!
//! A case is an expression in source form. It is parsed to an oracle tree,
//! compiled, decompiled and compared structurally after the decompiler's
//! outer-iterable sentinel is bound to the parsed collection. Decompilation
//! loads `None` as a name, which is how the parser reads it.

use crate::ast::Node;
use crate::error::DecompileError;
use crate::options::{DecompileOptions, NoneLiteral};
use crate::parser::{self, CompileOptions, ParseError};
use log::{debug, warn};
use thiserror::Error;

/// Expressions every build must reconstruct exactly
pub const CORPUS: &[&str] = &[
    // Loops and targets
    "(a for b in Student)",
    "(a for b, c in Student)",
    "(a for b in Student for c in [])",
    "(a for b in Student for c in [] for d in [])",
    "(a.b.c for d.e.f.g in Student)",
    "(a.b.c for d[g] in Student)",
    // Filters and boolean structure
    "(a for b in Student if f)",
    "(a for b in Student if f and h)",
    "(a for b in Student if f and h or t)",
    "(a for b in Student if f == 5 and r or t)",
    "(a for b in Student if f and (r and t) )",
    "(a for b in Student if f == 5 and +r or not t)",
    "(a for b in Student if -t and ~r or `f`)",
    "(a for b in Student if +t and r is None)",
    "(a for b in Student if f == 5 and r > 5 or not t)",
    "(s for t in Student if a == 5)",
    "( (s,d,w) for t in Student if (((4 != x.a) or (a * 3 > 20)) and (a * 2 < 5) ))",
    "( [s,d,w] for t in Student if ((4 != x.amount or (amount * 3 > 20 or amount * 2 < 5)) and (amount * 8 == 20)))",
    "( [s,d,w] for t in Student if ((4 != x.a or (a * 3 > 20 or (a * 2 < 5 or (4 == 5)))) and (a * 8 == 20)))",
    "((s, d, w) for t in Student if ((4 != x.a) or (a * 3 > 20) or (a * 2 < 5) and (a * 8 == 20)))",
    "((s, d, w) for t in Student if ( 4 != x.a or a * 3 > 20 ) and ( a * 2 < 5 or a * 8 == 20 ))",
    "((s, t, w) for t in Student if ((4 != x.a.b or a * 3 > 20 or a * 2 < 5 and v == 6) and a * 8 == 20 or (f > 4) ))",
    "(s for s in Student if s.age > 20 and (s.group.number == 4142 or 'Math' in s.marks.subject.name))",
    "(a for b in Student if c > d for e in Student if f < g)",
    "(x.a for x in X if x.b < 3 or x.c in (1, 2))",
    "(x.y for x in T if (a and (b or (c and d))) or X)",
    "((x or y) and (p or q) for a in T if (a or b) and (c or d))",
    "(a for b in T if x and not y and z)",
    "(a for b in T if not x and y)",
    "(a for b in T if not (x and y))",
    // Chained comparisons
    "(a for b in Student if c > d > e)",
    "(a for b in Student if c < d <= e and f)",
    "(a for b in Student if f or 1 < c < 3)",
    // Arithmetic and bitwise operators
    "(a**2 for b in Student if t * r > y / 3)",
    "(a + 2 for b in Student if t + r > y // 3)",
    "(a[2,v] for b in Student if t - r > y[3])",
    "((a + 2) * 3 for b in Student if t[r, e] > y[3, r * 4, t])",
    "(a<<2 for b in Student if t>>e > r & (y & u))",
    "(a|b for c in Student if t^e > r | (y & (u & (w % z))))",
    "(-a.price for a in Item if a.price > -10)",
    // Displays
    "([a, b, c] for d in Student )",
    "([a, b, 4] for d in Student if a[4, b] > b[1,v,3])",
    "((a, b, c) for d in Student )",
    "({} for d in Student )",
    "({'a' : x, 'b' : y} for a, b in Student)",
    "(({'a' : x, 'b' : y}, {'c' : x1, 'd' : 1}) for a, b, c, d in Student)",
    "([{'a' : x, 'b' : y}, {'c' : x1, 'd' : 1}] for a, b, c, d in Student)",
    // Slices
    "(a[1:2] for b in Student)",
    "(a[:2] for b in Student)",
    "(a[2:] for b in Student)",
    "(a[:] for b in Student)",
    "(a[1:2:3] for b in Student)",
    "(a[1:2, 3:4] for b in Student)",
    "(a[2:4:6,6:8] for a, y in Student)",
    // Calls
    "(func1(a, a.attr, keyarg=123) for s in Student)",
    "(func1(a, a.attr, keyarg=123, *e) for s in Student)",
    "(func1(a, b, a.attr1, a.b.c, keyarg1=123, keyarg2='mx', *e, **f) for s in Student)",
    "(func(a, a.attr, keyarg=123) for a in Student if a.method(x, *y, **z) == 4)",
    // Conditional expressions
    "(a if b else c for d in T)",
    "(a and b if c and d else e and f for i in T if (A and B if C and D else E and F))",
    "(a if b else c if d else e for f in T if (x if y or z else w) > 1)",
    "(f(a if b else c) for d in T if not (p if q else r))",
    // Lambdas
    "(s for s in Student if s.select(lambda m: m.v > s.v))",
    "(map(lambda x, *r, **k: x + len(r), s) for s in Student)",
    "((lambda: s.name) for s in Student)",
    "(f(lambda a: lambda b: a + b + c) for c in T)",
    // Nested generator expressions
    "(sum(c.credits for c in s.courses) for s in Student)",
    "(s for s in Student if count(m for m in s.marks if m.value == s.best) > 1)",
    "(g for g in Group if exists(s for s in g.students if any(m.v > s.v for m in Mark)))",
];

/// Why a case failed
#[derive(Debug, Error)]
pub enum ConformanceError {
    #[error("reference compiler rejected the case: {0}")]
    Compile(#[source] Box<ParseError>),

    #[error("decompilation failed: {0}")]
    Decompile(#[from] DecompileError),

    #[error("reconstructed tree differs\n  expected: {expected}\n  actual:   {actual}")]
    Mismatch { expected: String, actual: String },
}

/// Oracle and reconstructed tree of one case
#[derive(Debug, Clone, PartialEq)]
pub struct RoundTrip {
    pub expected: Node,
    pub actual: Node,
}

impl RoundTrip {
    pub fn matches(&self) -> bool {
        self.expected == self.actual
    }
}

fn decompile_options() -> DecompileOptions {
    DecompileOptions::new().with_none_literal(NoneLiteral::Name)
}

/// Parse, compile and decompile `source`
pub fn round_trip(source: &str) -> Result<RoundTrip, ConformanceError> {
    round_trip_with(source, &CompileOptions::default(), &decompile_options())
}

pub fn round_trip_with(
    source: &str,
    compile_options: &CompileOptions,
    decompile_options: &DecompileOptions,
) -> Result<RoundTrip, ConformanceError> {
    let expected = parser::parse(source).map_err(ConformanceError::Compile)?;
    let artifact =
        parser::compile_with(source, compile_options).map_err(ConformanceError::Compile)?;
    let decompiled = crate::decompile_with(&artifact, decompile_options)?;

    let actual = match (&expected, decompiled.root) {
        (Node::GenExprInner(oracle), Node::GenExprInner(inner)) => match oracle.clauses.first() {
            Some(first) => Node::GenExprInner(Box::new(
                (*inner).with_outer_iterable(first.iter.clone()),
            )),
            None => Node::GenExprInner(inner),
        },
        (_, root) => root,
    };
    Ok(RoundTrip { expected, actual })
}

/// Round-trip `source` and require an exact structural match
pub fn check(source: &str) -> Result<(), ConformanceError> {
    let result = round_trip(source)?;
    if result.matches() {
        debug!("conforms: {}", source);
        return Ok(());
    }
    Err(ConformanceError::Mismatch {
        expected: result.expected.to_string(),
        actual: result.actual.to_string(),
    })
}

/// Check every case; returns the failures
pub fn check_all<'a>(corpus: &[&'a str]) -> Vec<(&'a str, ConformanceError)> {
    let failures: Vec<_> = corpus
        .iter()
        .filter_map(|source| check(source).err().map(|error| (*source, error)))
        .collect();
    for (source, error) in &failures {
        warn!("conformance failure for {}: {}", source, error);
    }
    failures
}
