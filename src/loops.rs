//! Loop reconstruction: loop-variable targets and the folding of open
//! loops into generator clauses once the element is yielded

use crate::ast::{AssignTarget, BoolKind, GenExprFor, GenExprInner, Node};
use crate::machine::Slot;

/// An iteration opened by `FOR_ITER`
#[derive(Debug, Clone, PartialEq)]
pub struct OpenLoop {
    /// Offset of the `FOR_ITER`; filter branches name their loop by it
    pub for_iter: usize,
    pub iter: Node,
    /// Bound by the store(s) right after `FOR_ITER`
    pub target: Option<AssignTarget>,
}

impl OpenLoop {
    pub fn new(for_iter: usize, iter: Node) -> Self {
        OpenLoop {
            for_iter,
            iter,
            target: None,
        }
    }

    fn close(self, ifs: Vec<Node>) -> Result<GenExprFor, String> {
        let target = self
            .target
            .ok_or_else(|| format!("loop at {} never bound its variable", self.for_iter))?;
        Ok(GenExprFor {
            target,
            iter: self.iter,
            ifs,
        })
    }
}

/// `UNPACK_SEQUENCE n` waiting for its `n` stores
#[derive(Debug, Clone, PartialEq)]
pub struct PendingUnpack {
    pub count: usize,
    pub items: Vec<AssignTarget>,
}

impl PendingUnpack {
    pub fn new(count: usize) -> Self {
        // `count` comes straight from the bytecode; items grow as stores
        // arrive
        PendingUnpack {
            count,
            items: Vec::new(),
        }
    }

    #[inline]
    fn is_complete(&self) -> bool {
        self.items.len() >= self.count
    }
}

/// Route a store into the innermost open unpack or unbound loop
///
/// Completed unpacks collapse into a tuple target and are stored one level
/// further out, so nested patterns like `for a, (b, c) in ...` come out
/// whole.
pub(crate) fn store_target(stack: &mut Vec<Slot<'_>>, target: AssignTarget) -> Result<(), String> {
    let mut target = target;
    loop {
        match stack.last_mut() {
            Some(Slot::Unpack(unpack)) => {
                unpack.items.push(target);
                if !unpack.is_complete() {
                    return Ok(());
                }
                match stack.pop() {
                    Some(Slot::Unpack(done)) => target = AssignTarget::Tuple(done.items),
                    _ => return Err("unpack vanished from the stack".to_string()),
                }
            }
            Some(Slot::Loop(open)) if open.target.is_none() => {
                open.target = Some(target);
                return Ok(());
            }
            Some(Slot::Loop(open)) => {
                return Err(format!(
                    "loop at {} already bound its variable",
                    open.for_iter
                ));
            }
            Some(other) => {
                return Err(format!("store into {} instead of a loop", other.describe()));
            }
            None => return Err("store with an empty stack".to_string()),
        }
    }
}

/// Fold every open loop into a clause once the element has been popped
///
/// Filter clauses above a loop belong to it and merge into one condition.
/// Nothing may remain below the outermost loop.
pub(crate) fn close_loops(stack: &mut Vec<Slot<'_>>, elt: Node) -> Result<GenExprInner, String> {
    let mut clauses = Vec::new();

    while let Some(index) = stack.iter().rposition(|slot| matches!(slot, Slot::Loop(_))) {
        let mut conditions = Vec::new();
        for slot in stack.split_off(index + 1) {
            match slot {
                Slot::Clause(clause) => conditions.push(clause.finish()),
                other => {
                    return Err(format!("{} left above a loop at yield", other.describe()));
                }
            }
        }
        let ifs = if conditions.is_empty() {
            Vec::new()
        } else {
            vec![Node::bool_op(BoolKind::And, conditions)]
        };

        match stack.pop() {
            Some(Slot::Loop(open)) => clauses.push(open.close(ifs)?),
            _ => return Err("loop vanished from the stack".to_string()),
        }
    }

    if clauses.is_empty() {
        return Err("yield outside of any loop".to_string());
    }
    if let Some(slot) = stack.last() {
        return Err(format!("{} left below the outermost loop", slot.describe()));
    }

    clauses.reverse();
    Ok(GenExprInner { expr: elt, clauses })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boolean::OpenClause;

    fn name(n: &str) -> AssignTarget {
        AssignTarget::Name(n.to_string())
    }

    #[test]
    fn test_store_binds_loop() {
        let mut stack = vec![Slot::Loop(OpenLoop::new(6, Node::OuterIterable))];
        store_target(&mut stack, name("x")).unwrap();
        match &stack[0] {
            Slot::Loop(open) => assert_eq!(open.target, Some(name("x"))),
            other => panic!("Expected Loop, got {:?}", other),
        }

        // A second store has nowhere to go
        assert!(store_target(&mut stack, name("y")).is_err());
    }

    #[test]
    fn test_nested_unpack() {
        // for a, (b, c) in .0
        let mut stack = vec![
            Slot::Loop(OpenLoop::new(6, Node::OuterIterable)),
            Slot::Unpack(PendingUnpack::new(2)),
        ];
        store_target(&mut stack, name("a")).unwrap();
        stack.push(Slot::Unpack(PendingUnpack::new(2)));
        store_target(&mut stack, name("b")).unwrap();
        store_target(&mut stack, name("c")).unwrap();

        assert_eq!(stack.len(), 1);
        match &stack[0] {
            Slot::Loop(open) => assert_eq!(
                open.target,
                Some(AssignTarget::Tuple(vec![
                    name("a"),
                    AssignTarget::Tuple(vec![name("b"), name("c")]),
                ]))
            ),
            other => panic!("Expected Loop, got {:?}", other),
        }
    }

    #[test]
    fn test_unpack_count_is_not_preallocated() {
        let mut stack = vec![
            Slot::Loop(OpenLoop::new(6, Node::OuterIterable)),
            Slot::Unpack(PendingUnpack::new(usize::MAX)),
        ];
        store_target(&mut stack, name("a")).unwrap();
        match &stack[1] {
            Slot::Unpack(unpack) => {
                assert_eq!(unpack.items, vec![name("a")]);
                assert!(unpack.items.capacity() < 1024);
            }
            other => panic!("Expected Unpack, got {:?}", other),
        }
    }

    #[test]
    fn test_store_without_loop() {
        let mut stack = vec![Slot::Expr(Node::name("a"))];
        assert!(store_target(&mut stack, name("x")).is_err());
        assert!(store_target(&mut Vec::new(), name("x")).is_err());
    }

    #[test]
    fn test_close_loops_merges_filters() {
        let mut outer = OpenLoop::new(6, Node::OuterIterable);
        outer.target = Some(name("x"));
        let mut inner = OpenLoop::new(30, Node::name("y"));
        inner.target = Some(name("z"));

        let mut stack = vec![
            Slot::Loop(outer),
            Slot::Clause(OpenClause::new(BoolKind::And, Node::name("f"))),
            Slot::Clause(OpenClause::new(BoolKind::And, Node::name("g"))),
            Slot::Loop(inner),
        ];
        let genexpr = close_loops(&mut stack, Node::name("x")).unwrap();

        assert!(stack.is_empty());
        assert_eq!(genexpr.clauses.len(), 2);
        assert_eq!(genexpr.clauses[0].iter, Node::OuterIterable);
        assert_eq!(
            genexpr.clauses[0].ifs,
            vec![Node::bool_op(
                BoolKind::And,
                [Node::name("f"), Node::name("g")]
            )]
        );
        assert!(genexpr.clauses[1].ifs.is_empty());
        assert_eq!(genexpr.to_string(), "(x for x in .0 if f and g for z in y)");
    }

    #[test]
    fn test_close_loops_rejects_stray_values() {
        let mut open = OpenLoop::new(6, Node::OuterIterable);
        open.target = Some(name("x"));

        let mut stack = vec![Slot::Loop(open.clone()), Slot::Expr(Node::name("a"))];
        assert!(close_loops(&mut stack, Node::name("x")).is_err());

        let mut stack = vec![Slot::Expr(Node::name("a")), Slot::Loop(open)];
        assert!(close_loops(&mut stack, Node::name("x")).is_err());

        assert!(close_loops(&mut Vec::new(), Node::name("x")).is_err());

        let mut stack = vec![Slot::Loop(OpenLoop::new(6, Node::OuterIterable))];
        assert!(close_loops(&mut stack, Node::name("x")).is_err());
    }
}
