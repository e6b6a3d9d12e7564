//! Generator-expression decompiler
//!
//! Reconstructs the source-level syntax tree of a generator expression (or a
//! lambda body) from its compiled instruction stream, so that a query
//! written as `(p for p in Person if p.age > 20)` can be translated into SQL
//! without access to its source text.
//!
//! # Architecture
//!
//! - **Decoder**: raw code bytes plus side tables to structured instructions
//! - **Control-flow graph**: basic blocks and classified jump edges
//! - **Jump roles**: every conditional jump is classified once as a filter,
//!   a short-circuit operand or a chained-comparison link
//! - **Symbolic stack machine**: replays the instructions over AST
//!   fragments, folding boolean clauses at their merge points and loops at
//!   the yield
//!
//! The [`parser`] module carries an expression parser and a reference
//! compiler for the same bytecode format. The core never uses it; it exists
//! to produce artifacts and oracle trees for tests, fuzzing and the demo
//! binary.
//!
//! # Example Usage
//!
//! ```
//! use genexpr_decompiler::{decompile, parser};
//!
//! let artifact = parser::compile("(p.name for p in Person if p.age > 20)").unwrap();
//! let decompiled = decompile(&artifact).unwrap();
//!
//! assert_eq!(
//!     decompiled.root.to_string(),
//!     "(p.name for p in .0 if p.age > 20)"
//! );
//! ```

// Core modules
pub mod artifact;
pub mod ast;
pub mod cache;
pub mod cfg;
pub mod constant_pool;
pub mod decoder;
pub mod error;
pub mod opcodes;
pub mod options;

// Reconstruction passes
mod boolean;
mod loops;
mod machine;

// Conformance toolkit
pub mod conformance;
pub mod parser;

#[cfg(feature = "python")]
mod python_bindings;

// Re-export main types for convenience
pub use artifact::{ArtifactError, CodeArtifact, OUTER_ITERABLE_SLOT};
pub use ast::{AssignTarget, GenExprFor, GenExprInner, Node, render};
pub use cache::{ArtifactKey, DecompileCache};
pub use constant_pool::{Constant, ConstantPool};
pub use error::{DecompileError, DecompileResult, ErrorKind};
pub use machine::Decompiled;
pub use opcodes::Opcode;
pub use options::{DecompileOptions, NoneLiteral};

/// Bytecode format the decoder understands
pub const BYTECODE_FORMAT: &str = "cpython-2.6";

/// Current serialized artifact version
pub const ARTIFACT_VERSION: u32 = 1;

/// Decompile a code artifact with default options
pub fn decompile(artifact: &CodeArtifact) -> DecompileResult<Decompiled> {
    decompile_with(artifact, &DecompileOptions::default())
}

/// Decompile a code artifact
///
/// Generator code yields a `Node::GenExprInner` whose first clause iterates
/// `Node::OuterIterable`; any other expression code yields the returned
/// expression. The call either succeeds completely or fails; no partial
/// tree is ever produced.
pub fn decompile_with(
    artifact: &CodeArtifact,
    options: &DecompileOptions,
) -> DecompileResult<Decompiled> {
    machine::decompile_code(artifact, options, 0)
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::ast::{BoolKind, CompareOp, UnaryKind};

    fn genexpr_of(source: &str) -> GenExprInner {
        let artifact = parser::compile(source).unwrap();
        match decompile(&artifact).unwrap().root {
            Node::GenExprInner(inner) => *inner,
            other => panic!("Expected GenExprInner, got {:?}", other),
        }
    }

    fn name_target(name: &str) -> AssignTarget {
        AssignTarget::Name(name.to_string())
    }

    #[test]
    fn test_single_loop() {
        let inner = genexpr_of("(a for b in X)");
        assert_eq!(inner.expr, Node::name("a"));
        assert_eq!(
            inner.clauses,
            vec![GenExprFor {
                target: name_target("b"),
                iter: Node::OuterIterable,
                ifs: vec![],
            }]
        );
    }

    #[test]
    fn test_tuple_target() {
        let inner = genexpr_of("(a for b, c in X)");
        assert_eq!(
            inner.clauses[0].target,
            AssignTarget::Tuple(vec![name_target("b"), name_target("c")])
        );
    }

    #[test]
    fn test_two_loops_in_order() {
        let inner = genexpr_of("(a for b in X for c in [])");
        assert_eq!(inner.clauses.len(), 2);
        assert_eq!(inner.clauses[0].target, name_target("b"));
        assert!(inner.clauses[0].iter.is_outer_iterable());
        assert_eq!(inner.clauses[1].target, name_target("c"));
        assert_eq!(inner.clauses[1].iter, Node::List(vec![]));
    }

    #[test]
    fn test_single_filter() {
        let inner = genexpr_of("(a for b in X if f)");
        assert_eq!(inner.clauses[0].ifs, vec![Node::name("f")]);
    }

    #[test]
    fn test_and_filter() {
        let inner = genexpr_of("(a for b in X if f and h)");
        assert_eq!(
            inner.clauses[0].ifs,
            vec![Node::BoolOp {
                op: BoolKind::And,
                operands: vec![Node::name("f"), Node::name("h")],
            }]
        );
    }

    #[test]
    fn test_mixed_filter() {
        let inner = genexpr_of("(a for b in X if f == 5 and r > 5 or not t)");
        let expected = Node::BoolOp {
            op: BoolKind::Or,
            operands: vec![
                Node::BoolOp {
                    op: BoolKind::And,
                    operands: vec![
                        Node::compare(Node::name("f"), CompareOp::Eq, Node::int(5)),
                        Node::compare(Node::name("r"), CompareOp::Gt, Node::int(5)),
                    ],
                },
                Node::unary(UnaryKind::Not, Node::name("t")),
            ],
        };
        assert_eq!(inner.clauses[0].ifs, vec![expected]);
    }

    #[test]
    fn test_decompile_is_deterministic() {
        let artifact = parser::compile("(x.a for x in X if x.b < 3 or x.c in (1, 2))").unwrap();
        assert_eq!(decompile(&artifact).unwrap(), decompile(&artifact).unwrap());
    }

    #[test]
    fn test_external_names() {
        let artifact = parser::compile("(f(a, y) for a in X if a > limit)").unwrap();
        let result = decompile(&artifact).unwrap();
        let names: Vec<&str> = result.external_names.iter().map(String::as_str).collect();
        assert_eq!(names, vec!["f", "limit", "y"]);
    }

    #[test]
    fn test_artifact_survives_serialization() {
        let artifact = parser::compile("(a for b in X if f and h)").unwrap();
        let bytes = artifact.to_proto_bytes().unwrap();
        let restored = CodeArtifact::from_proto_bytes(&bytes).unwrap();
        assert_eq!(decompile(&restored).unwrap(), decompile(&artifact).unwrap());
    }
}
