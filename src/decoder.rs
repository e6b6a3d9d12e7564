//! Instruction decoder: raw code bytes plus side tables to a structured
//! instruction sequence

use crate::artifact::CodeArtifact;
use crate::error::{DecompileError, DecompileResult};
use crate::opcodes::{CompareOp, Opcode, OperandKind};
use std::collections::BTreeSet;
use std::fmt;

/// Decoded operand, resolved against the artifact's tables
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    None,
    /// Plain count or flag argument
    Int(u32),
    /// Index into the constant pool (validated in range)
    Const(u32),
    /// Entry of the global name table
    Name(String),
    /// Entry of the local variable table
    Local(String),
    /// Entry of the combined cell/free table
    Free(String),
    Compare(CompareOp),
    /// Absolute offset of the jump target
    Jump(usize),
}

/// One decoded instruction
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// Offset of the first byte, including any `EXTENDED_ARG` prefix
    pub offset: usize,
    /// Encoded size in bytes
    pub size: usize,
    pub opcode: Opcode,
    /// Raw numeric argument
    pub arg: Option<u32>,
    pub operand: Operand,
}

impl Instruction {
    /// Offset of the instruction that follows in the stream
    #[inline]
    pub fn next_offset(&self) -> usize {
        self.offset + self.size
    }

    #[inline]
    pub fn jump_target(&self) -> Option<usize> {
        match self.operand {
            Operand::Jump(target) => Some(target),
            _ => None,
        }
    }

    /// Name carried by a name, local or free operand
    pub fn name(&self) -> Option<&str> {
        match &self.operand {
            Operand::Name(name) | Operand::Local(name) | Operand::Free(name) => Some(name),
            _ => None,
        }
    }
}

/// Decode the artifact's code into an ordered instruction sequence
///
/// Fails on unknown opcodes, truncated operands, out-of-range table indices
/// and malformed `EXTENDED_ARG` prefixes. Jump targets are computed but not
/// validated here; the control-flow resolver checks them.
pub fn decode(artifact: &CodeArtifact) -> DecompileResult<Vec<Instruction>> {
    let code = &artifact.code;
    let mut instructions = Vec::with_capacity(code.len() / 2);
    let mut i = 0;

    while i < code.len() {
        let offset = i;
        let mut opcode = read_opcode(code, i)?;
        i += 1;

        let mut extended: u32 = 0;
        if opcode == Opcode::ExtendedArg {
            extended = u32::from(read_u16(code, &mut i, offset)?) << 16;
            if i >= code.len() {
                return Err(DecompileError::decode(
                    offset,
                    code[offset],
                    "EXTENDED_ARG at end of code",
                ));
            }
            opcode = read_opcode(code, i)?;
            if !opcode.has_argument() || opcode == Opcode::ExtendedArg {
                return Err(DecompileError::decode(
                    i,
                    code[i],
                    format!("EXTENDED_ARG cannot prefix {}", opcode),
                ));
            }
            i += 1;
        }

        let arg = if opcode.has_argument() {
            Some(extended | u32::from(read_u16(code, &mut i, offset)?))
        } else {
            None
        };

        let size = i - offset;
        let operand = match arg {
            Some(arg) => resolve_operand(artifact, opcode, arg, offset, size)?,
            None => Operand::None,
        };

        instructions.push(Instruction {
            offset,
            size,
            opcode,
            arg,
            operand,
        });
    }

    Ok(instructions)
}

#[inline]
fn read_opcode(code: &[u8], i: usize) -> DecompileResult<Opcode> {
    Opcode::from_u8(code[i]).map_err(|reason| DecompileError::decode(i, code[i], reason))
}

/// Read a little-endian u16 operand, reporting truncation at `offset`
#[inline]
fn read_u16(code: &[u8], i: &mut usize, offset: usize) -> DecompileResult<u16> {
    if *i + 2 > code.len() {
        return Err(DecompileError::decode(
            offset,
            code[offset],
            "operand runs past end of code",
        ));
    }
    let value = u16::from_le_bytes([code[*i], code[*i + 1]]);
    *i += 2;
    Ok(value)
}

fn resolve_operand(
    artifact: &CodeArtifact,
    opcode: Opcode,
    arg: u32,
    offset: usize,
    size: usize,
) -> DecompileResult<Operand> {
    let byte = opcode as u8;
    let index = arg as usize;
    let out_of_range = |table: &str, len: usize| {
        DecompileError::decode(
            offset,
            byte,
            format!("{} index {} out of range ({} entries)", table, index, len),
        )
    };

    Ok(match opcode.operand_kind() {
        OperandKind::None => Operand::None,
        OperandKind::Int => Operand::Int(arg),
        OperandKind::Const => {
            if index >= artifact.constants.len() {
                return Err(out_of_range("constant", artifact.constants.len()));
            }
            Operand::Const(arg)
        }
        OperandKind::Name => Operand::Name(
            artifact
                .names
                .get(index)
                .ok_or_else(|| out_of_range("name", artifact.names.len()))?
                .clone(),
        ),
        OperandKind::Local => Operand::Local(
            artifact
                .varnames
                .get(index)
                .ok_or_else(|| out_of_range("local", artifact.varnames.len()))?
                .clone(),
        ),
        OperandKind::Free => Operand::Free(
            artifact
                .deref_name(index)
                .ok_or_else(|| out_of_range("free variable", artifact.deref_count()))?
                .to_string(),
        ),
        OperandKind::Compare => Operand::Compare(CompareOp::from_index(arg).ok_or_else(|| {
            DecompileError::decode(
                offset,
                byte,
                format!("comparison index {} out of range", arg),
            )
        })?),
        OperandKind::JumpRelative => {
            let target = (offset + size).checked_add(index).ok_or_else(|| {
                DecompileError::decode(offset, byte, "jump target overflows")
            })?;
            Operand::Jump(target)
        }
        OperandKind::JumpAbsolute => Operand::Jump(index),
    })
}

/// Render a human-readable listing, one instruction per line
///
/// Jump targets are marked with `>>`.
pub fn disassemble(artifact: &CodeArtifact) -> DecompileResult<String> {
    let instructions = decode(artifact)?;
    Ok(Listing {
        artifact,
        instructions: &instructions,
    }
    .to_string())
}

/// Decoded instructions with their operands resolved against `artifact`
struct Listing<'a> {
    artifact: &'a CodeArtifact,
    instructions: &'a [Instruction],
}

impl Listing<'_> {
    fn resolve(&self, operand: &Operand) -> Option<String> {
        match operand {
            Operand::None | Operand::Int(_) => None,
            Operand::Const(index) => self
                .artifact
                .constants
                .get(*index)
                .ok()
                .map(|constant| constant.to_string()),
            Operand::Name(name) | Operand::Local(name) | Operand::Free(name) => {
                Some(name.clone())
            }
            Operand::Compare(op) => Some(op.to_string()),
            Operand::Jump(target) => Some(format!("to {}", target)),
        }
    }
}

impl fmt::Display for Listing<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let targets: BTreeSet<usize> = self
            .instructions
            .iter()
            .filter(|instr| !instr.opcode.is_block_setup())
            .filter_map(Instruction::jump_target)
            .collect();

        for instr in self.instructions {
            let marker = if targets.contains(&instr.offset) { ">>" } else { "" };
            write!(f, "{:>2} {:>4} {:<20}", marker, instr.offset, instr.opcode)?;
            if let Some(arg) = instr.arg {
                write!(f, " {:>5}", arg)?;
                if let Some(resolved) = self.resolve(&instr.operand) {
                    write!(f, " ({})", resolved)?;
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constant_pool::Constant;
    use crate::error::ErrorKind;

    fn genexpr(code: Vec<u8>) -> CodeArtifact {
        let mut artifact = CodeArtifact::new("<genexpr>", code);
        artifact.varnames = vec![".0".to_string(), "b".to_string()];
        artifact.names = vec!["a".to_string()];
        artifact.constants.add(Constant::None);
        artifact
    }

    /// (a for b in X)
    fn simple_genexpr() -> Vec<u8> {
        vec![
            120, 18, 0, // 0: SETUP_LOOP 18 (to 21)
            124, 0, 0, // 3: LOAD_FAST 0 (.0)
            93, 11, 0, // 6: FOR_ITER 11 (to 20)
            125, 1, 0, // 9: STORE_FAST 1 (b)
            116, 0, 0, // 12: LOAD_GLOBAL 0 (a)
            86, // 15: YIELD_VALUE
            1,  // 16: POP_TOP
            113, 6, 0, // 17: JUMP_ABSOLUTE 6
            87, // 20: POP_BLOCK
            100, 0, 0, // 21: LOAD_CONST 0 (None)
            83, // 24: RETURN_VALUE
        ]
    }

    #[test]
    fn test_decode_genexpr() {
        let instructions = decode(&genexpr(simple_genexpr())).unwrap();

        let offsets: Vec<usize> = instructions.iter().map(|i| i.offset).collect();
        assert_eq!(offsets, vec![0, 3, 6, 9, 12, 15, 16, 17, 20, 21, 24]);

        assert_eq!(instructions[0].operand, Operand::Jump(21));
        assert_eq!(instructions[1].operand, Operand::Local(".0".to_string()));
        assert_eq!(instructions[2].operand, Operand::Jump(20));
        assert_eq!(instructions[4].operand, Operand::Name("a".to_string()));
        assert_eq!(instructions[5].operand, Operand::None);
        assert_eq!(instructions[7].operand, Operand::Jump(6));
        assert_eq!(instructions[9].operand, Operand::Const(0));
    }

    #[test]
    fn test_extended_arg_merges() {
        let artifact = genexpr(vec![
            143, 1, 0, // 0: EXTENDED_ARG 1
            113, 2, 0, // 3: JUMP_ABSOLUTE 2 -> 0x10002
        ]);

        let instructions = decode(&artifact).unwrap();
        assert_eq!(instructions.len(), 1);
        assert_eq!(instructions[0].offset, 0);
        assert_eq!(instructions[0].size, 6);
        assert_eq!(instructions[0].operand, Operand::Jump(0x10002));
    }

    #[test]
    fn test_extended_arg_on_argless_opcode() {
        let err = decode(&genexpr(vec![143, 1, 0, 1])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Decode);
        assert_eq!(err.offset(), 3);
    }

    #[test]
    fn test_truncated_operand() {
        let err = decode(&genexpr(vec![1, 100, 0])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Decode);
        assert_eq!(err.offset(), 1);
    }

    #[test]
    fn test_unknown_opcode() {
        let err = decode(&genexpr(vec![1, 6])).unwrap_err();
        assert_eq!(
            err,
            DecompileError::decode(1, 6, "Unknown opcode: 6")
        );
    }

    #[test]
    fn test_out_of_range_tables() {
        // LOAD_CONST 5 with a single constant
        let err = decode(&genexpr(vec![100, 5, 0])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Decode);

        // LOAD_GLOBAL 1 with a single name
        assert!(decode(&genexpr(vec![116, 1, 0])).is_err());

        // LOAD_DEREF 0 without cells or frees
        assert!(decode(&genexpr(vec![136, 0, 0])).is_err());

        // COMPARE_OP 11 is past the comparison table
        assert!(decode(&genexpr(vec![106, 11, 0])).is_err());
    }

    #[test]
    fn test_disassemble_marks_targets() {
        let listing = disassemble(&genexpr(simple_genexpr())).unwrap();
        let lines: Vec<&str> = listing.lines().collect();

        assert_eq!(lines.len(), 11);
        assert!(lines[2].starts_with(">>    6 FOR_ITER"));
        assert!(lines[2].ends_with("(to 20)"));
        assert!(lines[3].ends_with("(b)"));
        assert!(lines[8].starts_with(">>   20 POP_BLOCK"));
        // SETUP_LOOP targets are not branch targets
        assert!(!lines[9].starts_with(">>"));
        assert!(lines[9].ends_with("(None)"));
    }

    #[test]
    fn test_disassemble_resolves_operands() {
        let mut artifact = genexpr(vec![
            124, 1, 0, // 0: LOAD_FAST b
            116, 0, 0, // 3: LOAD_GLOBAL a
            106, 2, 0, // 6: COMPARE_OP ==
            83, // 9: RETURN_VALUE
        ]);
        artifact.name = "<lambda>".to_string();
        let listing = disassemble(&artifact).unwrap();

        assert_eq!(listing.matches('\n').count(), 4);
        assert!(listing.ends_with('\n'));
        let lines: Vec<&str> = listing.lines().collect();
        assert!(lines[0].ends_with("(b)"));
        assert!(lines[1].ends_with("(a)"));
        assert!(lines[2].ends_with("(==)"));
        assert_eq!(lines[3].trim(), "9 RETURN_VALUE");
    }
}
