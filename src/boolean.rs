//! Boolean-tree reconstruction
//!
//! Conditional jumps are classified once, over the whole graph, before any
//! symbolic execution. The machine then opens a clause at each short-circuit
//! branch and folds it at the clause's merge point.

use crate::ast::{BoolKind, CompareOp, Node};
use crate::cfg::ControlFlowGraph;
use crate::opcodes::Opcode;
use log::trace;
use std::collections::{HashMap, HashSet};

/// What a conditional jump encodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpRole {
    /// One link of a chained comparison; `cleanup` is the shared
    /// `ROT_TWO; POP_TOP` block
    ChainLink { cleanup: usize },
    /// Failure of a filter condition of the loop at `for_iter`
    Filter { for_iter: usize, negate: bool },
    /// `and`/`or` operand whose clause folds at `merge`
    ShortCircuit { kind: BoolKind, merge: usize },
    /// Test of a conditional expression; the else branch starts at
    /// `orelse` and both branches meet at `end`
    IfTest {
        negate: bool,
        orelse: usize,
        end: usize,
    },
}

/// `body if test else orelse`, laid out as
/// `test; JUMP_IF_FALSE orelse; POP_TOP; body; JUMP_FORWARD end;
/// orelse: POP_TOP; orelse; end:`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conditional {
    pub test_jump: usize,
    pub then_exit: usize,
    pub orelse: usize,
    pub end: usize,
}

impl Conditional {
    /// Is `offset` inside one of the two branches?
    fn contains(&self, offset: usize) -> bool {
        self.test_jump < offset && offset < self.end
    }
}

/// Result of the jump-role pass
#[derive(Debug, Default)]
pub struct JumpRoles {
    roles: HashMap<usize, JumpRole>,
    /// Offset of a chain-exit jump -> its cleanup block
    chain_exits: HashMap<usize, usize>,
    chain_cleanups: HashSet<usize>,
    /// Offset of the jump closing a `then` branch -> where the branches meet
    then_exits: HashMap<usize, usize>,
}

impl JumpRoles {
    /// Classify every conditional jump, latest offset first
    ///
    /// The operand kind of a short-circuit jump follows its opcode even
    /// after threading: a jump only threads through tests of the same
    /// sense, or lands just past a test of the opposite sense. Inside a
    /// conditional expression a jump threaded onto a loop continuation
    /// still ends a branch operand, so only jumps outside every branch
    /// can be filters.
    pub fn analyze(cfg: &ControlFlowGraph<'_>) -> Self {
        let mut result = JumpRoles::default();
        let conditionals = find_conditionals(cfg);
        for conditional in &conditionals {
            result
                .then_exits
                .insert(conditional.then_exit, conditional.end);
        }

        for instr in cfg.instructions().iter().rev() {
            if !instr.opcode.is_conditional_jump() {
                continue;
            }
            let Some(target) = instr.jump_target() else {
                continue;
            };
            let on_true = instr.opcode == Opcode::JumpIfTrue;

            if is_chain_cleanup(cfg, target) {
                result.chain_cleanups.insert(target);
                if let Some(exit) = cfg.predecessor(target) {
                    if exit.opcode.is_unconditional_jump() {
                        result.chain_exits.insert(exit.offset, target);
                    }
                }
                result
                    .roles
                    .insert(instr.offset, JumpRole::ChainLink { cleanup: target });
                continue;
            }

            if let Some(conditional) = conditionals
                .iter()
                .find(|conditional| conditional.test_jump == instr.offset)
            {
                result.roles.insert(
                    instr.offset,
                    JumpRole::IfTest {
                        negate: on_true,
                        orelse: conditional.orelse,
                        end: conditional.end,
                    },
                );
                continue;
            }

            let in_branch = conditionals
                .iter()
                .any(|conditional| conditional.contains(instr.offset));
            if !in_branch {
                if let Some(for_iter) = cfg.loop_continue(target) {
                    result.roles.insert(
                        instr.offset,
                        JumpRole::Filter {
                            for_iter,
                            negate: on_true,
                        },
                    );
                    continue;
                }
            }

            let kind = if on_true { BoolKind::Or } else { BoolKind::And };
            result.roles.insert(
                instr.offset,
                JumpRole::ShortCircuit {
                    kind,
                    merge: target,
                },
            );
        }

        result
    }

    pub fn role(&self, offset: usize) -> Option<JumpRole> {
        self.roles.get(&offset).copied()
    }

    /// Cleanup block closed by the jump at `offset`, if it is a chain exit
    pub fn chain_exit(&self, offset: usize) -> Option<usize> {
        self.chain_exits.get(&offset).copied()
    }

    pub fn is_chain_cleanup(&self, offset: usize) -> bool {
        self.chain_cleanups.contains(&offset)
    }

    /// Meeting point of the branches, if the jump at `offset` ends the
    /// `then` branch of a conditional expression
    pub fn then_exit(&self, offset: usize) -> Option<usize> {
        self.then_exits.get(&offset).copied()
    }
}

/// Locate conditional expressions by their `then` exits
///
/// A forward unconditional jump followed by a `POP_TOP` that some earlier
/// conditional jump lands on closes a `then` branch, unless that
/// `POP_TOP` is a filter cleanup falling back into a loop. The test is
/// the last such conditional jump; earlier ones are `and` operands of the
/// test threaded onto the else branch.
fn find_conditionals(cfg: &ControlFlowGraph<'_>) -> Vec<Conditional> {
    let instructions = cfg.instructions();
    let mut found = Vec::new();

    for (index, exit) in instructions.iter().enumerate() {
        if !matches!(exit.opcode, Opcode::JumpForward | Opcode::JumpAbsolute) {
            continue;
        }
        let Some(end) = exit.jump_target().filter(|&end| end > exit.offset) else {
            continue;
        };
        let orelse = exit.next_offset();
        let pops = cfg
            .instruction_at(orelse)
            .is_some_and(|instr| instr.opcode == Opcode::PopTop);
        if !pops || cfg.loop_continue(orelse).is_some() {
            continue;
        }
        let test = instructions[..index].iter().rev().find(|instr| {
            instr.opcode.is_conditional_jump() && instr.jump_target() == Some(orelse)
        });
        if let Some(test) = test {
            trace!(
                "conditional expression: test at {}, else at {}, end at {}",
                test.offset, orelse, end
            );
            found.push(Conditional {
                test_jump: test.offset,
                then_exit: exit.offset,
                orelse,
                end,
            });
        }
    }
    found
}

/// `ROT_TWO; POP_TOP` discards the duplicated operand of a failed link
fn is_chain_cleanup(cfg: &ControlFlowGraph<'_>, offset: usize) -> bool {
    match cfg.instruction_at(offset) {
        Some(instr) if instr.opcode == Opcode::RotTwo => cfg
            .successor(offset)
            .is_some_and(|next| next.opcode == Opcode::PopTop),
        _ => false,
    }
}

/// A short-circuit (or filter) clause still collecting operands
#[derive(Debug, Clone, PartialEq)]
pub struct OpenClause {
    pub kind: BoolKind,
    pub operands: Vec<Node>,
}

impl OpenClause {
    pub fn new(kind: BoolKind, first: Node) -> Self {
        OpenClause {
            kind,
            operands: vec![first],
        }
    }

    pub fn absorb(&mut self, operand: Node) {
        self.operands.push(operand);
    }

    /// Close the clause; a single operand stands for itself
    pub fn finish(self) -> Node {
        Node::bool_op(self.kind, self.operands)
    }
}

/// A conditional expression between its test and the meeting point of
/// its branches
#[derive(Debug, Clone, PartialEq)]
pub struct PendingIfExp {
    test: Node,
    /// Set once the `then` branch has exited
    body: Option<Node>,
    pub end: usize,
}

impl PendingIfExp {
    pub fn new(test: Node, end: usize) -> Self {
        PendingIfExp {
            test,
            body: None,
            end,
        }
    }

    pub fn in_else(&self) -> bool {
        self.body.is_some()
    }

    pub fn close_body(&mut self, body: Node) -> Result<(), String> {
        if self.body.is_some() {
            return Err(format!(
                "conditional expression meeting at {} left its then branch twice",
                self.end
            ));
        }
        self.body = Some(body);
        Ok(())
    }

    pub fn finish(self, orelse: Node) -> Result<Node, String> {
        match self.body {
            Some(body) => Ok(Node::if_exp(self.test, body, orelse)),
            None => Err(format!(
                "conditional expression meeting at {} never left its then branch",
                self.end
            )),
        }
    }
}

/// A chained comparison between its first link and its exit
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChain {
    operands: Vec<Node>,
    ops: Vec<CompareOp>,
    /// Stack depth after each link has consumed its comparison
    base: usize,
}

/// Split a freshly built single comparison
fn single_compare(node: Node) -> Result<(Node, CompareOp, Node), String> {
    match node {
        Node::CompareChain { mut operands, ops } if ops.len() == 1 && operands.len() == 2 => {
            let right = operands.pop();
            let left = operands.pop();
            match (left, right) {
                (Some(left), Some(right)) => Ok((left, ops[0], right)),
                _ => Err("malformed comparison".to_string()),
            }
        }
        other => Err(format!("chained comparison link is not a comparison: {}", other)),
    }
}

impl PendingChain {
    /// Start a chain from its first link
    pub fn start(compare: Node, depth: usize) -> Result<Self, String> {
        let (left, op, right) = single_compare(compare)?;
        Ok(PendingChain {
            operands: vec![left, right],
            ops: vec![op],
            base: depth,
        })
    }

    fn extend(&mut self, compare: Node) -> Result<(), String> {
        let (left, op, right) = single_compare(compare)?;
        if self.operands.last() != Some(&left) {
            return Err(format!(
                "comparison link starts at {} instead of the shared operand",
                left
            ));
        }
        self.operands.push(right);
        self.ops.push(op);
        Ok(())
    }

    /// A middle link: the duplicated operand stays below
    pub fn link(&mut self, compare: Node, depth: usize) -> Result<(), String> {
        if depth != self.base {
            return Err(format!(
                "chain link at depth {}, expected {}",
                depth, self.base
            ));
        }
        self.extend(compare)
    }

    /// The final comparison; its duplicate was consumed, so the stack is
    /// one slot shallower than during the links
    pub fn exit(mut self, compare: Node, depth: usize) -> Result<Node, String> {
        if depth + 1 != self.base {
            return Err(format!(
                "chain exit at depth {}, expected {}",
                depth,
                self.base.saturating_sub(1)
            ));
        }
        self.extend(compare)?;
        Ok(Node::CompareChain {
            operands: self.operands,
            ops: self.ops,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::CodeArtifact;
    use crate::decoder::decode;

    fn roles_for(code: Vec<u8>) -> JumpRoles {
        let mut artifact = CodeArtifact::new("<genexpr>", code);
        artifact.varnames = vec![".0".to_string(), "x".to_string()];
        artifact.names = ["a", "b", "c", "d", "x"]
            .into_iter()
            .map(String::from)
            .collect();
        let instructions = decode(&artifact).unwrap();
        let cfg = ControlFlowGraph::build(&instructions).unwrap();
        JumpRoles::analyze(&cfg)
    }

    #[test]
    fn test_value_merge_roles() {
        // a and b or c, jump-threaded
        let roles = roles_for(vec![
            116, 0, 0, // 0: LOAD_GLOBAL a
            111, 7, 0, // 3: JUMP_IF_FALSE (to 13)
            1,  // 6: POP_TOP
            116, 1, 0, // 7: LOAD_GLOBAL b
            112, 5, 0, // 10: JUMP_IF_TRUE (to 18)
            1,  // 13: POP_TOP
            116, 2, 0, // 14: LOAD_GLOBAL c
            83, // 17: RETURN_VALUE
            83, // 18: RETURN_VALUE
        ]);

        assert_eq!(
            roles.role(10),
            Some(JumpRole::ShortCircuit {
                kind: BoolKind::Or,
                merge: 18
            })
        );
        assert_eq!(
            roles.role(3),
            Some(JumpRole::ShortCircuit {
                kind: BoolKind::And,
                merge: 13
            })
        );
    }

    fn short_circuit(kind: BoolKind, merge: usize) -> Option<JumpRole> {
        Some(JumpRole::ShortCircuit { kind, merge })
    }

    #[test]
    fn test_three_levels_threaded_to_two_merges() {
        // (a and (b or (c and d))) or x: every inner merge is the outer
        // JUMP_IF_TRUE, so `and` jumps land past it and `or` jumps on the
        // return
        let roles = roles_for(vec![
            116, 0, 0, // 0: LOAD_GLOBAL a
            111, 21, 0, // 3: JUMP_IF_FALSE (to 27)
            1,  // 6: POP_TOP
            116, 1, 0, // 7: LOAD_GLOBAL b
            112, 18, 0, // 10: JUMP_IF_TRUE (to 31)
            1,  // 13: POP_TOP
            116, 2, 0, // 14: LOAD_GLOBAL c
            111, 7, 0, // 17: JUMP_IF_FALSE (to 27)
            1,  // 20: POP_TOP
            116, 3, 0, // 21: LOAD_GLOBAL d
            112, 4, 0, // 24: JUMP_IF_TRUE (to 31)
            1,  // 27: POP_TOP
            116, 4, 0, // 28: LOAD_GLOBAL x
            83, // 31: RETURN_VALUE
        ]);

        assert_eq!(roles.role(3), short_circuit(BoolKind::And, 27));
        assert_eq!(roles.role(10), short_circuit(BoolKind::Or, 31));
        assert_eq!(roles.role(17), short_circuit(BoolKind::And, 27));
        assert_eq!(roles.role(24), short_circuit(BoolKind::Or, 31));
    }

    #[test]
    fn test_three_levels_sharing_one_merge() {
        // a or (b and (c or d)): nothing to thread, all jumps meet at the end
        let roles = roles_for(vec![
            116, 0, 0, // 0: LOAD_GLOBAL a
            112, 18, 0, // 3: JUMP_IF_TRUE (to 24)
            1,  // 6: POP_TOP
            116, 1, 0, // 7: LOAD_GLOBAL b
            111, 11, 0, // 10: JUMP_IF_FALSE (to 24)
            1,  // 13: POP_TOP
            116, 2, 0, // 14: LOAD_GLOBAL c
            112, 4, 0, // 17: JUMP_IF_TRUE (to 24)
            1,  // 20: POP_TOP
            116, 3, 0, // 21: LOAD_GLOBAL d
            83, // 24: RETURN_VALUE
        ]);

        assert_eq!(roles.role(3), short_circuit(BoolKind::Or, 24));
        assert_eq!(roles.role(10), short_circuit(BoolKind::And, 24));
        assert_eq!(roles.role(17), short_circuit(BoolKind::Or, 24));
    }

    #[test]
    fn test_three_levels_in_filter_position() {
        // (x for x in .0 if (a and (b or (c and d))) or x): the `or` jumps
        // are threaded through the filter test onto the element
        let roles = roles_for(vec![
            124, 0, 0, // 0: LOAD_FAST .0
            93, 50, 0, // 3: FOR_ITER (to 56)
            125, 1, 0, // 6: STORE_FAST x
            116, 0, 0, // 9: LOAD_GLOBAL a
            111, 21, 0, // 12: JUMP_IF_FALSE (to 36)
            1,  // 15: POP_TOP
            116, 1, 0, // 16: LOAD_GLOBAL b
            112, 21, 0, // 19: JUMP_IF_TRUE (to 43)
            1,  // 22: POP_TOP
            116, 2, 0, // 23: LOAD_GLOBAL c
            111, 7, 0, // 26: JUMP_IF_FALSE (to 36)
            1,  // 29: POP_TOP
            116, 3, 0, // 30: LOAD_GLOBAL d
            112, 7, 0, // 33: JUMP_IF_TRUE (to 43)
            1,  // 36: POP_TOP
            116, 4, 0, // 37: LOAD_GLOBAL x
            111, 9, 0, // 40: JUMP_IF_FALSE (to 52)
            1,  // 43: POP_TOP
            124, 1, 0, // 44: LOAD_FAST x
            86, // 47: YIELD_VALUE
            1,  // 48: POP_TOP
            113, 3, 0, // 49: JUMP_ABSOLUTE 3
            1,  // 52: POP_TOP
            113, 3, 0, // 53: JUMP_ABSOLUTE 3
            87, // 56: POP_BLOCK
        ]);

        assert_eq!(roles.role(12), short_circuit(BoolKind::And, 36));
        assert_eq!(roles.role(19), short_circuit(BoolKind::Or, 43));
        assert_eq!(roles.role(26), short_circuit(BoolKind::And, 36));
        assert_eq!(roles.role(33), short_circuit(BoolKind::Or, 43));
        assert_eq!(
            roles.role(40),
            Some(JumpRole::Filter {
                for_iter: 3,
                negate: false
            })
        );
    }

    #[test]
    fn test_negated_conjunction_filter() {
        // (x for x in .0 if not (a and b)): the `not` folds into the last
        // operand's jump, which then skips the element
        let roles = roles_for(vec![
            124, 0, 0, // 0: LOAD_FAST .0
            93, 29, 0, // 3: FOR_ITER (to 35)
            125, 1, 0, // 6: STORE_FAST x
            116, 0, 0, // 9: LOAD_GLOBAL a
            111, 7, 0, // 12: JUMP_IF_FALSE (to 22)
            1,  // 15: POP_TOP
            116, 1, 0, // 16: LOAD_GLOBAL b
            112, 9, 0, // 19: JUMP_IF_TRUE (to 31)
            1,  // 22: POP_TOP
            124, 1, 0, // 23: LOAD_FAST x
            86, // 26: YIELD_VALUE
            1,  // 27: POP_TOP
            113, 3, 0, // 28: JUMP_ABSOLUTE 3
            1,  // 31: POP_TOP
            113, 3, 0, // 32: JUMP_ABSOLUTE 3
            87, // 35: POP_BLOCK
        ]);

        assert_eq!(roles.role(12), short_circuit(BoolKind::And, 22));
        assert_eq!(
            roles.role(19),
            Some(JumpRole::Filter {
                for_iter: 3,
                negate: true
            })
        );
    }

    #[test]
    fn test_conditional_expression_roles() {
        // a if b else c
        let roles = roles_for(vec![
            116, 1, 0, // 0: LOAD_GLOBAL b
            111, 7, 0, // 3: JUMP_IF_FALSE (to 13)
            1,  // 6: POP_TOP
            116, 0, 0, // 7: LOAD_GLOBAL a
            110, 4, 0, // 10: JUMP_FORWARD (to 17)
            1,  // 13: POP_TOP
            116, 2, 0, // 14: LOAD_GLOBAL c
            83, // 17: RETURN_VALUE
        ]);

        assert_eq!(
            roles.role(3),
            Some(JumpRole::IfTest {
                negate: false,
                orelse: 13,
                end: 17
            })
        );
        assert_eq!(roles.then_exit(10), Some(17));
        assert_eq!(roles.then_exit(3), None);
    }

    #[test]
    fn test_operand_jumps_inside_branches_are_not_filters() {
        // (x for x in .0 if (a and b if c else d)): `a` fails straight to
        // the filter cleanup once threaded, but still belongs to the branch
        let roles = roles_for(vec![
            124, 0, 0, // 0: LOAD_FAST .0
            93, 43, 0, // 3: FOR_ITER (to 49)
            125, 1, 0, // 6: STORE_FAST x
            116, 2, 0, // 9: LOAD_GLOBAL c
            111, 14, 0, // 12: JUMP_IF_FALSE (to 29)
            1,  // 15: POP_TOP
            116, 0, 0, // 16: LOAD_GLOBAL a
            111, 23, 0, // 19: JUMP_IF_FALSE (to 45)
            1,  // 22: POP_TOP
            116, 1, 0, // 23: LOAD_GLOBAL b
            110, 4, 0, // 26: JUMP_FORWARD (to 33)
            1,  // 29: POP_TOP
            116, 3, 0, // 30: LOAD_GLOBAL d
            111, 9, 0, // 33: JUMP_IF_FALSE (to 45)
            1,  // 36: POP_TOP
            124, 1, 0, // 37: LOAD_FAST x
            86, // 40: YIELD_VALUE
            1,  // 41: POP_TOP
            113, 3, 0, // 42: JUMP_ABSOLUTE 3
            1,  // 45: POP_TOP
            113, 3, 0, // 46: JUMP_ABSOLUTE 3
            87, // 49: POP_BLOCK
        ]);

        assert_eq!(
            roles.role(12),
            Some(JumpRole::IfTest {
                negate: false,
                orelse: 29,
                end: 33
            })
        );
        assert_eq!(roles.role(19), short_circuit(BoolKind::And, 45));
        assert_eq!(
            roles.role(33),
            Some(JumpRole::Filter {
                for_iter: 3,
                negate: false
            })
        );
    }

    #[test]
    fn test_filter_and_negated_filter() {
        // (x for x in .0 if not a): UNARY_NOT folded into JUMP_IF_TRUE
        let roles = roles_for(vec![
            124, 0, 0, // 0: LOAD_FAST .0
            93, 16, 0, // 3: FOR_ITER (to 22)
            125, 1, 0, // 6: STORE_FAST x
            116, 0, 0, // 9: LOAD_GLOBAL a
            112, 6, 0, // 12: JUMP_IF_TRUE (to 21)
            1,  // 15: POP_TOP
            9,  // 16: NOP
            124, 1, 0, // 17: LOAD_FAST x
            86, // 20: YIELD_VALUE
            1,  // 21: POP_TOP
            113, 3, 0, // 22: JUMP_ABSOLUTE 3
        ]);
        // FOR_ITER would exit at 22, which is the loop-back jump here; only
        // the role of the filter matters for this test
        assert_eq!(
            roles.role(12),
            Some(JumpRole::Filter {
                for_iter: 3,
                negate: true
            })
        );
    }

    #[test]
    fn test_chain_roles() {
        // a < b < c
        let roles = roles_for(vec![
            116, 0, 0, // 0: LOAD_GLOBAL a
            116, 1, 0, // 3: LOAD_GLOBAL b
            4,  // 6: DUP_TOP
            3,  // 7: ROT_THREE
            106, 0, 0, // 8: COMPARE_OP <
            111, 10, 0, // 11: JUMP_IF_FALSE (to 24)
            1,  // 14: POP_TOP
            116, 2, 0, // 15: LOAD_GLOBAL c
            106, 0, 0, // 18: COMPARE_OP <
            110, 2, 0, // 21: JUMP_FORWARD (to 26)
            2,  // 24: ROT_TWO
            1,  // 25: POP_TOP
            83, // 26: RETURN_VALUE
        ]);

        assert_eq!(roles.role(11), Some(JumpRole::ChainLink { cleanup: 24 }));
        assert_eq!(roles.chain_exit(21), Some(24));
        assert!(roles.is_chain_cleanup(24));
        assert!(!roles.is_chain_cleanup(26));
    }

    #[test]
    fn test_open_clause_finish() {
        let mut clause = OpenClause::new(BoolKind::And, Node::name("a"));
        assert_eq!(clause.clone().finish(), Node::name("a"));

        clause.absorb(Node::bool_op(BoolKind::And, [Node::name("b"), Node::name("c")]));
        match clause.finish() {
            Node::BoolOp { op, operands } => {
                assert_eq!(op, BoolKind::And);
                assert_eq!(operands.len(), 3);
            }
            other => panic!("Expected BoolOp, got {:?}", other),
        }
    }

    #[test]
    fn test_pending_if_exp() {
        let mut pending = PendingIfExp::new(Node::name("t"), 17);
        assert!(!pending.in_else());
        assert!(pending.clone().finish(Node::name("o")).is_err());

        pending.close_body(Node::name("b")).unwrap();
        assert!(pending.in_else());
        assert!(pending.clone().close_body(Node::name("b")).is_err());
        assert_eq!(
            pending.finish(Node::name("o")).unwrap(),
            Node::if_exp(Node::name("t"), Node::name("b"), Node::name("o"))
        );
    }

    #[test]
    fn test_pending_chain() {
        let a = Node::name("a");
        let b = Node::name("b");
        let c = Node::name("c");

        let chain = PendingChain::start(Node::compare(a.clone(), CompareOp::Lt, b.clone()), 1)
            .unwrap();
        let node = chain
            .exit(Node::compare(b.clone(), CompareOp::Le, c.clone()), 0)
            .unwrap();
        assert_eq!(
            node,
            Node::CompareChain {
                operands: vec![a.clone(), b.clone(), c.clone()],
                ops: vec![CompareOp::Lt, CompareOp::Le],
            }
        );

        // Link that does not share the previous right operand
        let mut chain = PendingChain::start(Node::compare(a.clone(), CompareOp::Lt, b), 1)
            .unwrap();
        assert!(chain.link(Node::compare(c, CompareOp::Lt, a.clone()), 1).is_err());

        // Wrong depth at exit
        let chain = PendingChain::start(Node::compare(a.clone(), CompareOp::Lt, a.clone()), 3)
            .unwrap();
        assert!(chain.exit(Node::compare(a.clone(), CompareOp::Lt, a), 3).is_err());
    }
}
