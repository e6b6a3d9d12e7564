//! Post-assembly bytecode rewrites
//!
//! Reproduces the target compiler's rewrites that change instruction shape
//! or control flow: jump threading, `not` folded into the following
//! conditional jump, the `None` name loaded as a constant, and tuples of
//! constants folded into one constant. Constant arithmetic is left alone.
//! Rewrites pad with NOPs, which a final pass removes while fixing up
//! every jump operand.

use crate::artifact::CodeArtifact;
use crate::constant_pool::{Constant, ConstantPool};
use crate::opcodes::{HAVE_ARGUMENT, Opcode, OperandKind};
use log::trace;

/// Larger code is left as assembled
const MAX_CODE_SIZE: usize = 32700;

pub(crate) fn optimize(artifact: &mut CodeArtifact) {
    let CodeArtifact {
        code,
        constants,
        names,
        ..
    } = artifact;

    if code.len() > MAX_CODE_SIZE {
        return;
    }
    let Some(starts) = instruction_starts(code) else {
        trace!("peephole skipped: irregular instruction stream");
        return;
    };
    if starts
        .iter()
        .any(|&offset| code[offset] == Opcode::ExtendedArg as u8)
    {
        return;
    }

    let before = code.len();
    let blocks = BasicBlocks::mark(code, &starts);
    rewrite_instructions(code, constants, names, &blocks);

    let Some(starts) = instruction_starts(code) else {
        return;
    };
    thread_jumps(code, &starts);
    *code = remove_nops(code, &starts);
    trace!("peephole: {} -> {} bytes", before, code.len());
}

// ===== Instruction Access =====

fn size_at(code: &[u8], offset: usize) -> usize {
    if code[offset] >= HAVE_ARGUMENT { 3 } else { 1 }
}

fn arg_at(code: &[u8], offset: usize) -> usize {
    u16::from_le_bytes([code[offset + 1], code[offset + 2]]) as usize
}

fn set_arg(code: &mut [u8], offset: usize, value: usize) {
    let bytes = (value as u16).to_le_bytes();
    code[offset + 1] = bytes[0];
    code[offset + 2] = bytes[1];
}

fn opcode_at(code: &[u8], offset: usize) -> Option<Opcode> {
    code.get(offset).and_then(|byte| Opcode::from_u8(*byte).ok())
}

fn jump_target(code: &[u8], offset: usize) -> Option<usize> {
    match opcode_at(code, offset)?.operand_kind() {
        OperandKind::JumpRelative => Some(offset + 3 + arg_at(code, offset)),
        OperandKind::JumpAbsolute => Some(arg_at(code, offset)),
        _ => None,
    }
}

/// Offsets of every instruction, or `None` when an opcode is unknown or
/// truncated
fn instruction_starts(code: &[u8]) -> Option<Vec<usize>> {
    let mut starts = Vec::new();
    let mut offset = 0;
    while offset < code.len() {
        opcode_at(code, offset)?;
        let size = size_at(code, offset);
        if offset + size > code.len() {
            return None;
        }
        starts.push(offset);
        offset += size;
    }
    Some(starts)
}

/// Only JUMP_FORWARD and JUMP_ABSOLUTE are threaded through
fn is_plain_jump(op: Option<Opcode>) -> bool {
    matches!(op, Some(Opcode::JumpForward | Opcode::JumpAbsolute))
}

/// Jump-target boundaries of the code as assembled
struct BasicBlocks {
    /// Number of jump targets at or before each offset
    ids: Vec<usize>,
}

impl BasicBlocks {
    fn mark(code: &[u8], starts: &[usize]) -> Self {
        let mut is_target = vec![false; code.len()];
        for &offset in starts {
            if let Some(target) = jump_target(code, offset) {
                if let Some(flag) = is_target.get_mut(target) {
                    *flag = true;
                }
            }
        }
        let mut ids = Vec::with_capacity(code.len());
        let mut count = 0;
        for flag in is_target {
            count += usize::from(flag);
            ids.push(count);
        }
        BasicBlocks { ids }
    }

    /// No jump lands inside `[start + 1, start + len)`
    fn contains(&self, start: usize, len: usize) -> bool {
        match (self.ids.get(start), self.ids.get(start + len - 1)) {
            (Some(first), Some(last)) => first == last,
            _ => false,
        }
    }
}

// ===== Rewrites =====

fn rewrite_instructions(
    code: &mut [u8],
    constants: &mut ConstantPool,
    names: &[String],
    blocks: &BasicBlocks,
) {
    let mut offset = 0;
    // LOAD_CONSTs immediately before the current instruction
    let mut const_run = 0;

    while offset < code.len() {
        let previous_run = const_run;
        const_run = 0;

        match opcode_at(code, offset) {
            Some(Opcode::UnaryNot) => fold_not(code, offset, blocks),
            Some(Opcode::LoadGlobal | Opcode::LoadName) => {
                if names.get(arg_at(code, offset)).is_some_and(|name| name == "None") {
                    let index = constants
                        .position(&Constant::None)
                        .unwrap_or_else(|| constants.add(Constant::None));
                    code[offset] = Opcode::LoadConst as u8;
                    set_arg(code, offset, index as usize);
                    const_run = previous_run + 1;
                }
            }
            Some(Opcode::LoadConst) => const_run = previous_run + 1,
            Some(Opcode::BuildTuple) => {
                let count = arg_at(code, offset);
                if count <= previous_run
                    && fold_tuple(code, offset, count, constants, blocks)
                {
                    const_run = 1;
                }
            }
            _ => {}
        }
        offset += size_at(code, offset);
    }
}

/// `UNARY_NOT; JUMP_IF_FALSE t; POP_TOP` becomes `JUMP_IF_TRUE t; POP_TOP;
/// NOP` when `t` pops the condition
fn fold_not(code: &mut [u8], offset: usize, blocks: &BasicBlocks) {
    if opcode_at(code, offset + 1) != Some(Opcode::JumpIfFalse)
        || opcode_at(code, offset + 4) != Some(Opcode::PopTop)
        || !blocks.contains(offset, 5)
    {
        return;
    }
    let lands_on_pop = jump_target(code, offset + 1)
        .is_some_and(|target| opcode_at(code, target) == Some(Opcode::PopTop));
    if !lands_on_pop {
        return;
    }

    let arg = arg_at(code, offset + 1) + 1;
    code[offset] = Opcode::JumpIfTrue as u8;
    set_arg(code, offset, arg);
    code[offset + 3] = Opcode::PopTop as u8;
    code[offset + 4] = Opcode::Nop as u8;
    trace!("folded not into jump at {}", offset);
}

/// `LOAD_CONST` x n, `BUILD_TUPLE n` becomes NOPs and one `LOAD_CONST`
fn fold_tuple(
    code: &mut [u8],
    offset: usize,
    count: usize,
    constants: &mut ConstantPool,
    blocks: &BasicBlocks,
) -> bool {
    let Some(start) = offset.checked_sub(3 * count) else {
        return false;
    };
    if !blocks.contains(start, 3 * (count + 1)) {
        return false;
    }

    let mut items = Vec::with_capacity(count);
    for at in (start..offset).step_by(3) {
        match constants.get(arg_at(code, at) as u32) {
            Ok(Constant::Code(_)) | Err(_) => return false,
            Ok(constant) => items.push(constant.clone()),
        }
    }
    let tuple = Constant::Tuple(items);
    let index = match constants.position(&tuple) {
        Some(index) => index,
        None => constants.add(tuple),
    };

    code[start..offset].fill(Opcode::Nop as u8);
    code[offset] = Opcode::LoadConst as u8;
    set_arg(code, offset, index as usize);
    trace!("folded {}-tuple of constants at {}", count, offset);
    true
}

/// Retarget jumps whose target is itself a jump, until nothing changes
fn thread_jumps(code: &mut [u8], starts: &[usize]) {
    // Every change moves a target strictly later or shortens a chain
    for _ in 0..=code.len() {
        let mut changed = false;
        for &offset in starts {
            changed |= thread_jump(code, offset);
        }
        if !changed {
            return;
        }
    }
}

fn thread_jump(code: &mut [u8], offset: usize) -> bool {
    let Some(op) = opcode_at(code, offset) else {
        return false;
    };
    let Some(target) = jump_target(code, offset) else {
        return false;
    };
    let target_op = opcode_at(code, target);

    let (op, new_target) = match op {
        Opcode::JumpIfFalse | Opcode::JumpIfTrue
            if target_op.is_some_and(|t| t.is_conditional_jump()) =>
        {
            // Same sense: the second test repeats the first. Opposite
            // sense: it is known to fall through.
            if target_op == Some(op) {
                match jump_target(code, target) {
                    Some(next) => (op, next),
                    None => return false,
                }
            } else {
                (op, target + 3)
            }
        }
        Opcode::JumpIfFalse
        | Opcode::JumpIfTrue
        | Opcode::JumpForward
        | Opcode::JumpAbsolute
        | Opcode::ContinueLoop
        | Opcode::SetupLoop
        | Opcode::SetupExcept
        | Opcode::SetupFinally => {
            if !is_plain_jump(target_op) {
                return false;
            }
            let Some(next) = jump_target(code, target) else {
                return false;
            };
            let op = if op == Opcode::JumpForward {
                Opcode::JumpAbsolute
            } else {
                op
            };
            (op, next)
        }
        _ => return false,
    };

    let arg = match op.operand_kind() {
        OperandKind::JumpAbsolute => new_target,
        // No backward relative jumps
        _ => match new_target.checked_sub(offset + 3) {
            Some(relative) => relative,
            None => return false,
        },
    };
    if arg > 0xFFFF || (code[offset] == op as u8 && arg_at(code, offset) == arg) {
        return false;
    }
    code[offset] = op as u8;
    set_arg(code, offset, arg);
    true
}

/// Drop NOPs and re-encode every jump for the shifted offsets
fn remove_nops(code: &[u8], starts: &[usize]) -> Vec<u8> {
    let nop = Opcode::Nop as u8;
    if !starts.iter().any(|&offset| code[offset] == nop) {
        return code.to_vec();
    }

    // Old offset to new offset; a NOP maps to what follows it
    let mut address_map = vec![0; code.len() + 1];
    let mut removed = 0;
    for &offset in starts {
        address_map[offset] = offset - removed;
        if code[offset] == nop {
            removed += 1;
        }
    }
    address_map[code.len()] = code.len() - removed;

    let mut out = Vec::with_capacity(code.len() - removed);
    for &offset in starts {
        if code[offset] == nop {
            continue;
        }
        let size = size_at(code, offset);
        let at = out.len();
        out.extend_from_slice(&code[offset..offset + size]);

        let Some(target) = jump_target(code, offset) else {
            continue;
        };
        let new_target = address_map.get(target).copied().unwrap_or(target);
        let arg = match opcode_at(code, offset).map(|op| op.operand_kind()) {
            Some(OperandKind::JumpAbsolute) => new_target,
            _ => new_target.saturating_sub(address_map[offset] + 3),
        };
        set_arg(&mut out, at, arg);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(code: Vec<u8>) -> CodeArtifact {
        let mut artifact = CodeArtifact::new("<lambda>", code);
        artifact.names = vec!["a".to_string(), "None".to_string()];
        artifact.constants.add(Constant::None);
        artifact
    }

    #[test]
    fn test_same_sense_conditional_chain_threaded() {
        let mut code = artifact(vec![
            116, 0, 0, // 0 LOAD_GLOBAL a
            111, 0, 0, // 3 JUMP_IF_FALSE to 6
            111, 4, 0, // 6 JUMP_IF_FALSE to 13
            1, // 9 POP_TOP
            116, 0, 0, // 10 LOAD_GLOBAL a
            83, // 13 RETURN_VALUE
        ]);
        optimize(&mut code);
        assert_eq!(&code.code[3..6], &[111, 7, 0]);
    }

    #[test]
    fn test_opposite_sense_conditional_skips_test() {
        let mut code = artifact(vec![
            116, 0, 0, // 0 LOAD_GLOBAL a
            111, 0, 0, // 3 JUMP_IF_FALSE to 6
            112, 4, 0, // 6 JUMP_IF_TRUE to 13
            1, // 9 POP_TOP
            116, 0, 0, // 10 LOAD_GLOBAL a
            83, // 13 RETURN_VALUE
        ]);
        optimize(&mut code);
        // Now lands on the POP_TOP after the second test
        assert_eq!(&code.code[3..6], &[111, 3, 0]);
    }

    #[test]
    fn test_forward_jump_to_absolute_jump() {
        let mut code = artifact(vec![
            110, 0, 0, // 0 JUMP_FORWARD to 3
            113, 7, 0, // 3 JUMP_ABSOLUTE 7
            9, // 6 NOP
            83, // 7 RETURN_VALUE
        ]);
        optimize(&mut code);
        // Threaded, then re-encoded once the NOP is gone
        assert_eq!(code.code, vec![113, 6, 0, 113, 6, 0, 83]);
    }

    #[test]
    fn test_not_kept_when_target_does_not_pop() {
        let original = vec![
            116, 0, 0, // 0 LOAD_GLOBAL a
            12, // 3 UNARY_NOT
            111, 1, 0, // 4 JUMP_IF_FALSE to 8
            1, // 7 POP_TOP
            83, // 8 RETURN_VALUE
        ];
        let mut code = artifact(original.clone());
        optimize(&mut code);
        assert_eq!(code.code, original);
    }

    #[test]
    fn test_tuple_not_folded_across_jump_target() {
        let original = vec![
            116, 0, 0, // 0 LOAD_GLOBAL a
            111, 3, 0, // 3 JUMP_IF_FALSE to 9
            100, 0, 0, // 6 LOAD_CONST None
            100, 0, 0, // 9 LOAD_CONST None
            102, 2, 0, // 12 BUILD_TUPLE 2
            83, // 15 RETURN_VALUE
        ];
        let mut code = artifact(original.clone());
        optimize(&mut code);
        assert_eq!(code.code, original);
    }

    #[test]
    fn test_none_global_loaded_as_constant() {
        let mut code = artifact(vec![116, 1, 0, 83]);
        optimize(&mut code);
        assert_eq!(code.code, vec![100, 0, 0, 83]);
    }

    #[test]
    fn test_unknown_opcode_left_alone() {
        let original = vec![116, 0, 0, 255];
        let mut code = artifact(original.clone());
        optimize(&mut code);
        assert_eq!(code.code, original);
    }
}
