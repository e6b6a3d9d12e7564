//! Error taxonomy for the decompiler core

use crate::opcodes::Opcode;
use thiserror::Error;

/// Result type for decompiler operations
pub type DecompileResult<T> = Result<T, DecompileError>;

/// Coarse error category, one per taxonomy entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Decode,
    ControlFlow,
    UnsupportedOpcode,
    StackInvariant,
}

/// Every failure the decompiler can report.
///
/// All variants are terminal for the call that produced them: no partial
/// AST is ever returned alongside an error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecompileError {
    /// Malformed instruction stream or out-of-range table reference
    #[error("decode error at offset {offset} (byte 0x{byte:02x}): {reason}")]
    Decode {
        offset: usize,
        byte: u8,
        reason: String,
    },

    /// A jump lands somewhere that is not the start of an instruction
    #[error(
        "control-flow error at offset {offset} ({opcode}): target {target} is not an instruction boundary"
    )]
    ControlFlow {
        offset: usize,
        opcode: Opcode,
        target: usize,
    },

    /// Opcode outside the whitelist, or a whitelisted opcode in a shape
    /// generator expressions never produce
    #[error("unsupported opcode {opcode} at offset {offset}{}", hint_suffix(.hint))]
    UnsupportedOpcode {
        offset: usize,
        opcode: Opcode,
        hint: Option<&'static str>,
    },

    /// Operand stack count mismatch, underflow, or a slot of the wrong shape
    #[error("stack invariant violated at offset {offset} ({opcode}): {reason}")]
    StackInvariant {
        offset: usize,
        opcode: Opcode,
        reason: String,
    },
}

fn hint_suffix(hint: &Option<&'static str>) -> String {
    match hint {
        Some(hint) => format!(" ({})", hint),
        None => String::new(),
    }
}

impl DecompileError {
    pub fn decode(offset: usize, byte: u8, reason: impl Into<String>) -> Self {
        DecompileError::Decode {
            offset,
            byte,
            reason: reason.into(),
        }
    }

    pub fn unsupported(offset: usize, opcode: Opcode) -> Self {
        DecompileError::UnsupportedOpcode {
            offset,
            opcode,
            hint: None,
        }
    }

    pub fn unsupported_with_hint(offset: usize, opcode: Opcode, hint: &'static str) -> Self {
        DecompileError::UnsupportedOpcode {
            offset,
            opcode,
            hint: Some(hint),
        }
    }

    pub fn stack(offset: usize, opcode: Opcode, reason: impl Into<String>) -> Self {
        DecompileError::StackInvariant {
            offset,
            opcode,
            reason: reason.into(),
        }
    }

    /// Offset of the instruction that triggered the error
    pub fn offset(&self) -> usize {
        match self {
            DecompileError::Decode { offset, .. }
            | DecompileError::ControlFlow { offset, .. }
            | DecompileError::UnsupportedOpcode { offset, .. }
            | DecompileError::StackInvariant { offset, .. } => *offset,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DecompileError::Decode { .. } => ErrorKind::Decode,
            DecompileError::ControlFlow { .. } => ErrorKind::ControlFlow,
            DecompileError::UnsupportedOpcode { .. } => ErrorKind::UnsupportedOpcode,
            DecompileError::StackInvariant { .. } => ErrorKind::StackInvariant,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_offset_and_opcode() {
        let err = DecompileError::stack(12, Opcode::BinaryAdd, "stack underflow");
        assert_eq!(
            err.to_string(),
            "stack invariant violated at offset 12 (BINARY_ADD): stack underflow"
        );
        assert_eq!(err.offset(), 12);
        assert_eq!(err.kind(), ErrorKind::StackInvariant);
    }

    #[test]
    fn test_unsupported_hint() {
        let plain = DecompileError::unsupported(3, Opcode::PrintExpr);
        assert_eq!(plain.to_string(), "unsupported opcode PRINT_EXPR at offset 3");

        let hinted = DecompileError::unsupported_with_hint(
            7,
            Opcode::ListAppend,
            "use a generator expression instead of a list comprehension",
        );
        assert!(hinted.to_string().ends_with("list comprehension)"));
        assert_eq!(hinted.kind(), ErrorKind::UnsupportedOpcode);
    }

    #[test]
    fn test_decode_display() {
        let err = DecompileError::decode(4, 0x64, "operand runs past end of code");
        assert_eq!(
            err.to_string(),
            "decode error at offset 4 (byte 0x64): operand runs past end of code"
        );
    }

    #[test]
    fn test_control_flow_display() {
        let err = DecompileError::ControlFlow {
            offset: 6,
            opcode: Opcode::JumpIfFalse,
            target: 11,
        };
        assert_eq!(err.offset(), 6);
        assert!(err.to_string().contains("JUMP_IF_FALSE"));
        assert!(err.to_string().contains("target 11"));
    }
}
