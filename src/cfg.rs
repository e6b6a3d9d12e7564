//! Control-flow resolver: basic blocks, classified edges and the
//! structural queries the reconstructors ask about them

use crate::decoder::Instruction;
use crate::error::{DecompileError, DecompileResult};
use crate::opcodes::Opcode;
use log::trace;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Upper bound on instructions followed by `loop_continue`
const CONTINUE_WALK_LIMIT: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Fallthrough,
    /// Taken branch of a conditional jump or `FOR_ITER`
    ForwardConditional,
    /// Unconditional jump forward
    ForwardJump,
    /// Target at or before the source: a loop edge
    Backward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    /// Start offset of the source block
    pub from: usize,
    /// Start offset of the target block
    pub to: usize,
    /// Offset of the instruction that produced the edge
    pub source: usize,
    pub kind: EdgeKind,
}

/// A maximal single-entry, single-exit run of instructions
#[derive(Debug, Clone, PartialEq)]
pub struct BasicBlock {
    pub start: usize,
    /// Index range into the instruction sequence
    first: usize,
    last: usize,
    pub successors: Vec<Edge>,
}

/// Control-flow graph over a decoded instruction sequence
pub struct ControlFlowGraph<'a> {
    instructions: &'a [Instruction],
    /// offset -> index into `instructions`
    index_of: HashMap<usize, usize>,
    blocks: BTreeMap<usize, BasicBlock>,
    predecessors: HashMap<usize, Vec<Edge>>,
}

impl<'a> ControlFlowGraph<'a> {
    /// Partition the sequence into basic blocks and compute their edges
    ///
    /// Fails with a control-flow error if any jump (including block setup
    /// targets) does not land on an instruction boundary.
    pub fn build(instructions: &'a [Instruction]) -> DecompileResult<Self> {
        let index_of: HashMap<usize, usize> = instructions
            .iter()
            .enumerate()
            .map(|(index, instr)| (instr.offset, index))
            .collect();

        // ===== Leaders =====
        let mut leaders = BTreeSet::new();
        if let Some(first) = instructions.first() {
            leaders.insert(first.offset);
        }
        for instr in instructions {
            if let Some(target) = instr.jump_target() {
                if !index_of.contains_key(&target) {
                    return Err(DecompileError::ControlFlow {
                        offset: instr.offset,
                        opcode: instr.opcode,
                        target,
                    });
                }
                if !instr.opcode.is_block_setup() {
                    leaders.insert(target);
                }
            }
            if instr.opcode.is_branch() || instr.opcode.is_terminal() {
                leaders.insert(instr.next_offset());
            }
        }

        // ===== Blocks =====
        let mut blocks = BTreeMap::new();
        let starts: Vec<usize> = leaders
            .iter()
            .copied()
            .filter(|offset| index_of.contains_key(offset))
            .collect();
        for (i, &start) in starts.iter().enumerate() {
            let first = index_of[&start];
            let last = match starts.get(i + 1) {
                Some(next) => index_of[next] - 1,
                None => instructions.len() - 1,
            };
            let exit = &instructions[last];
            let fallthrough = starts.get(i + 1).copied();

            let mut successors = Vec::new();
            let jump = |kind: EdgeKind, target: usize| Edge {
                from: start,
                to: target,
                source: exit.offset,
                kind: if target <= exit.offset {
                    EdgeKind::Backward
                } else {
                    kind
                },
            };
            let op = exit.opcode;
            if op.is_conditional_jump() || op == Opcode::ForIter {
                if let Some(next) = fallthrough {
                    successors.push(jump(EdgeKind::Fallthrough, next));
                }
                if let Some(target) = exit.jump_target() {
                    successors.push(jump(EdgeKind::ForwardConditional, target));
                }
            } else if op.is_unconditional_jump() {
                if let Some(target) = exit.jump_target() {
                    successors.push(jump(EdgeKind::ForwardJump, target));
                }
            } else if op != Opcode::ReturnValue {
                if let Some(next) = fallthrough {
                    successors.push(jump(EdgeKind::Fallthrough, next));
                }
            }

            blocks.insert(
                start,
                BasicBlock {
                    start,
                    first,
                    last,
                    successors,
                },
            );
        }

        let mut predecessors: HashMap<usize, Vec<Edge>> = HashMap::new();
        for block in blocks.values() {
            for edge in &block.successors {
                predecessors.entry(edge.to).or_default().push(*edge);
            }
        }

        trace!(
            "built control-flow graph: {} instructions, {} blocks",
            instructions.len(),
            blocks.len()
        );

        Ok(ControlFlowGraph {
            instructions,
            index_of,
            blocks,
            predecessors,
        })
    }

    pub fn instructions(&self) -> &'a [Instruction] {
        self.instructions
    }

    /// Blocks in offset order
    pub fn blocks(&self) -> impl Iterator<Item = &BasicBlock> {
        self.blocks.values()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn block(&self, start: usize) -> Option<&BasicBlock> {
        self.blocks.get(&start)
    }

    pub fn is_block_start(&self, offset: usize) -> bool {
        self.blocks.contains_key(&offset)
    }

    /// Instructions of the block starting at `start`
    pub fn block_instructions(&self, block: &BasicBlock) -> &'a [Instruction] {
        &self.instructions[block.first..=block.last]
    }

    /// Incoming edges of the block starting at `start`
    pub fn incoming(&self, start: usize) -> &[Edge] {
        self.predecessors
            .get(&start)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Targets of backward edges
    pub fn loop_headers(&self) -> BTreeSet<usize> {
        self.blocks
            .values()
            .flat_map(|block| block.successors.iter())
            .filter(|edge| edge.kind == EdgeKind::Backward)
            .map(|edge| edge.to)
            .collect()
    }

    #[inline]
    pub fn instruction_at(&self, offset: usize) -> Option<&'a Instruction> {
        let instructions = self.instructions;
        self.index_of.get(&offset).map(|&index| &instructions[index])
    }

    /// Instruction immediately preceding `offset` in the stream
    pub fn predecessor(&self, offset: usize) -> Option<&'a Instruction> {
        let index = *self.index_of.get(&offset)?;
        let instructions = self.instructions;
        index.checked_sub(1).map(|prev| &instructions[prev])
    }

    /// Instruction immediately following the one at `offset`
    pub fn successor(&self, offset: usize) -> Option<&'a Instruction> {
        let index = *self.index_of.get(&offset)?;
        self.instructions.get(index + 1)
    }

    /// Does control from `offset` reach a backward edge into a `FOR_ITER`
    /// using only pops and unconditional jumps?
    ///
    /// Returns the offset of that `FOR_ITER`: the loop a branch to `offset`
    /// continues.
    pub fn loop_continue(&self, offset: usize) -> Option<usize> {
        let mut visited = HashSet::new();
        let mut current = offset;

        for _ in 0..CONTINUE_WALK_LIMIT {
            if !visited.insert(current) {
                return None;
            }
            let instr = self.instruction_at(current)?;
            match instr.opcode {
                Opcode::PopTop | Opcode::Nop => current = instr.next_offset(),
                Opcode::JumpForward => current = instr.jump_target()?,
                Opcode::JumpAbsolute | Opcode::ContinueLoop => {
                    let target = instr.jump_target()?;
                    if target <= instr.offset
                        && self.instruction_at(target)?.opcode == Opcode::ForIter
                    {
                        return Some(target);
                    }
                    current = target;
                }
                _ => return None,
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::CodeArtifact;
    use crate::decoder::decode;
    use crate::error::ErrorKind;

    fn artifact(code: Vec<u8>) -> CodeArtifact {
        let mut artifact = CodeArtifact::new("<genexpr>", code);
        artifact.varnames = vec![".0".to_string(), "b".to_string()];
        artifact.names = vec!["a".to_string(), "f".to_string()];
        artifact.constants.add(crate::constant_pool::Constant::None);
        artifact
    }

    /// (a for b in .0 if f), after jump threading
    fn filtered() -> Vec<u8> {
        vec![
            120, 29, 0, // 0: SETUP_LOOP (to 32)
            124, 0, 0, // 3: LOAD_FAST .0
            93, 22, 0, // 6: FOR_ITER (to 31)
            125, 1, 0, // 9: STORE_FAST b
            116, 1, 0, // 12: LOAD_GLOBAL f
            111, 9, 0, // 15: JUMP_IF_FALSE (to 27)
            1,  // 18: POP_TOP
            116, 0, 0, // 19: LOAD_GLOBAL a
            86, // 22: YIELD_VALUE
            1,  // 23: POP_TOP
            113, 6, 0, // 24: JUMP_ABSOLUTE 6
            1,  // 27: POP_TOP
            113, 6, 0, // 28: JUMP_ABSOLUTE 6
            87, // 31: POP_BLOCK
            100, 0, 0, // 32: LOAD_CONST None
            83, // 35: RETURN_VALUE
        ]
    }

    fn build_and_check(code: Vec<u8>) -> DecompileResult<usize> {
        let artifact = artifact(code);
        let instructions = decode(&artifact).unwrap();
        ControlFlowGraph::build(&instructions).map(|cfg| cfg.block_count())
    }

    #[test]
    fn test_malformed_target() {
        let mut code = filtered();
        // FOR_ITER (to 39), past the end of the code
        code[7] = 30;
        let err = build_and_check(code).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ControlFlow);
        assert_eq!(err.offset(), 6);
    }

    #[test]
    fn test_mid_instruction_target() {
        // 0: JUMP_FORWARD (to 4), which is inside the LOAD_GLOBAL at 3
        let code = artifact(vec![110, 1, 0, 116, 0, 0, 83]);
        let instructions = decode(&code).unwrap();
        let err = ControlFlowGraph::build(&instructions).err().unwrap();
        assert_eq!(
            err,
            DecompileError::ControlFlow {
                offset: 0,
                opcode: Opcode::JumpForward,
                target: 4
            }
        );
    }

    #[test]
    fn test_blocks_and_edges() {
        let code = artifact(filtered());
        let instructions = decode(&code).unwrap();
        let cfg = ControlFlowGraph::build(&instructions).unwrap();

        let starts: Vec<usize> = cfg.blocks().map(|b| b.start).collect();
        assert_eq!(starts, vec![0, 6, 9, 18, 27, 31]);

        let for_iter = cfg.block(6).unwrap();
        assert_eq!(
            for_iter
                .successors
                .iter()
                .map(|e| (e.to, e.kind))
                .collect::<Vec<_>>(),
            vec![
                (9, EdgeKind::Fallthrough),
                (31, EdgeKind::ForwardConditional)
            ]
        );

        let filter = cfg.block(9).unwrap();
        assert_eq!(filter.successors[1].kind, EdgeKind::ForwardConditional);
        assert_eq!(filter.successors[1].source, 15);

        let cleanup = cfg.block(27).unwrap();
        assert_eq!(cfg.block_instructions(cleanup).len(), 2);
        assert_eq!(cleanup.successors[0].kind, EdgeKind::Backward);

        assert!(cfg.block(31).unwrap().successors.is_empty());
        assert_eq!(cfg.loop_headers(), BTreeSet::from([6]));
        assert_eq!(cfg.incoming(27).len(), 1);
        assert_eq!(cfg.incoming(6).len(), 3);
    }

    #[test]
    fn test_loop_continue_query() {
        let code = artifact(filtered());
        let instructions = decode(&code).unwrap();
        let cfg = ControlFlowGraph::build(&instructions).unwrap();

        // The filter target pops and jumps back to the FOR_ITER
        assert_eq!(cfg.loop_continue(27), Some(6));
        assert_eq!(cfg.loop_continue(23), Some(6));
        // A load is not a pop
        assert_eq!(cfg.loop_continue(19), None);
        assert_eq!(cfg.loop_continue(31), None);
    }

    #[test]
    fn test_predecessor_and_successor() {
        let code = artifact(filtered());
        let instructions = decode(&code).unwrap();
        let cfg = ControlFlowGraph::build(&instructions).unwrap();

        assert_eq!(cfg.predecessor(18).unwrap().opcode, Opcode::JumpIfFalse);
        assert!(cfg.predecessor(0).is_none());
        assert_eq!(cfg.successor(15).unwrap().offset, 18);
        assert!(cfg.instruction_at(16).is_none());
    }
}
