/// Instruction set of the classic 2.x stack bytecode (2.6 numbering)
///
/// Every opcode is a single byte. Opcodes at or above `HAVE_ARGUMENT` are
/// followed by a 16-bit little-endian operand, optionally widened to 32 bits
/// by a preceding `EXTENDED_ARG`.
use std::fmt;

/// First opcode value that carries an operand
pub const HAVE_ARGUMENT: u8 = 90;

/// Operand bytes following an opcode that takes an argument
pub const ARGUMENT_SIZE: usize = 2;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // Stack manipulation
    StopCode = 0,
    /// Discard TOS. In expression code this follows every conditional jump
    PopTop = 1,
    /// Swap TOS and TOS1
    RotTwo = 2,
    /// Lift TOS2 and TOS1 up one, move TOS down to position three
    RotThree = 3,
    /// Duplicate TOS (chained comparisons)
    DupTop = 4,
    RotFour = 5,
    Nop = 9,

    // Unary operators (pop 1, push 1)
    UnaryPositive = 10,
    UnaryNegative = 11,
    UnaryNot = 12,
    /// Backquote repr: `x`
    UnaryConvert = 13,
    UnaryInvert = 15,

    /// List comprehension accumulator; never valid in a query
    ListAppend = 18,

    // Binary operators (pop 2, push 1)
    BinaryPower = 19,
    BinaryMultiply = 20,
    BinaryDivide = 21,
    BinaryModulo = 22,
    BinaryAdd = 23,
    BinarySubtract = 24,
    /// TOS1[TOS]
    BinarySubscr = 25,
    BinaryFloorDivide = 26,
    BinaryTrueDivide = 27,
    InplaceFloorDivide = 28,
    InplaceTrueDivide = 29,

    // Simple slices: TOS1[TOS:], TOS1[:TOS], TOS2[TOS1:TOS]
    Slice0 = 30,
    Slice1 = 31,
    Slice2 = 32,
    Slice3 = 33,
    StoreSlice0 = 40,
    StoreSlice1 = 41,
    StoreSlice2 = 42,
    StoreSlice3 = 43,
    DeleteSlice0 = 50,
    DeleteSlice1 = 51,
    DeleteSlice2 = 52,
    DeleteSlice3 = 53,

    /// Stack: [dict, value, key] -> [dict]
    StoreMap = 54,
    InplaceAdd = 55,
    InplaceSubtract = 56,
    InplaceMultiply = 57,
    InplaceDivide = 58,
    InplaceModulo = 59,
    /// Stack: [value, obj, key] -> []
    StoreSubscr = 60,
    DeleteSubscr = 61,
    BinaryLshift = 62,
    BinaryRshift = 63,
    BinaryAnd = 64,
    BinaryXor = 65,
    BinaryOr = 66,
    InplacePower = 67,
    /// iter(TOS); a no-op for symbolic execution
    GetIter = 68,

    PrintExpr = 70,
    PrintItem = 71,
    PrintNewline = 72,
    PrintItemTo = 73,
    PrintNewlineTo = 74,
    InplaceLshift = 75,
    InplaceRshift = 76,
    InplaceAnd = 77,
    InplaceXor = 78,
    InplaceOr = 79,
    BreakLoop = 80,
    WithCleanup = 81,
    LoadLocals = 82,
    ReturnValue = 83,
    ImportStar = 84,
    ExecStmt = 85,
    /// Ends the expression region of generator code
    YieldValue = 86,
    PopBlock = 87,
    EndFinally = 88,
    BuildClass = 89,

    // ----- opcodes below carry an operand -----
    /// Operand: name index
    StoreName = 90,
    DeleteName = 91,
    /// Operand: element count
    UnpackSequence = 92,
    /// Operand: relative jump to loop exit
    ForIter = 93,
    /// Operand: name index. Stack: [value, obj] -> []
    StoreAttr = 95,
    DeleteAttr = 96,
    StoreGlobal = 97,
    DeleteGlobal = 98,
    DupTopx = 99,
    /// Operand: constant pool index
    LoadConst = 100,
    LoadName = 101,
    BuildTuple = 102,
    BuildList = 103,
    /// Operand: size hint; entries arrive through STORE_MAP
    BuildMap = 104,
    LoadAttr = 105,
    /// Operand: index into the comparison table
    CompareOp = 106,
    ImportName = 107,
    ImportFrom = 108,
    JumpForward = 110,
    /// Relative jump taken when TOS is falsey; TOS is left in place
    JumpIfFalse = 111,
    /// Relative jump taken when TOS is truthy; TOS is left in place
    JumpIfTrue = 112,
    JumpAbsolute = 113,
    LoadGlobal = 116,
    ContinueLoop = 119,
    SetupLoop = 120,
    SetupExcept = 121,
    SetupFinally = 122,
    /// Operand: local variable index
    LoadFast = 124,
    StoreFast = 125,
    DeleteFast = 126,
    RaiseVarargs = 130,
    /// Operand: (keyword count << 8) | positional count
    CallFunction = 131,
    /// Operand: default argument count
    MakeFunction = 132,
    BuildSlice = 133,
    MakeClosure = 134,
    /// Operand: cell/free variable index
    LoadClosure = 135,
    LoadDeref = 136,
    StoreDeref = 137,
    CallFunctionVar = 140,
    CallFunctionKw = 141,
    CallFunctionVarKw = 142,
    /// High 16 bits of the next instruction's operand
    ExtendedArg = 143,
}

/// How an instruction's operand is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    None,
    Int,
    Const,
    Name,
    Local,
    Free,
    Compare,
    JumpRelative,
    JumpAbsolute,
}

impl Opcode {
    /// Try to parse a u8 into an Opcode
    pub fn from_u8(byte: u8) -> Result<Self, String> {
        use Opcode::*;
        Ok(match byte {
            0 => StopCode,
            1 => PopTop,
            2 => RotTwo,
            3 => RotThree,
            4 => DupTop,
            5 => RotFour,
            9 => Nop,
            10 => UnaryPositive,
            11 => UnaryNegative,
            12 => UnaryNot,
            13 => UnaryConvert,
            15 => UnaryInvert,
            18 => ListAppend,
            19 => BinaryPower,
            20 => BinaryMultiply,
            21 => BinaryDivide,
            22 => BinaryModulo,
            23 => BinaryAdd,
            24 => BinarySubtract,
            25 => BinarySubscr,
            26 => BinaryFloorDivide,
            27 => BinaryTrueDivide,
            28 => InplaceFloorDivide,
            29 => InplaceTrueDivide,
            30 => Slice0,
            31 => Slice1,
            32 => Slice2,
            33 => Slice3,
            40 => StoreSlice0,
            41 => StoreSlice1,
            42 => StoreSlice2,
            43 => StoreSlice3,
            50 => DeleteSlice0,
            51 => DeleteSlice1,
            52 => DeleteSlice2,
            53 => DeleteSlice3,
            54 => StoreMap,
            55 => InplaceAdd,
            56 => InplaceSubtract,
            57 => InplaceMultiply,
            58 => InplaceDivide,
            59 => InplaceModulo,
            60 => StoreSubscr,
            61 => DeleteSubscr,
            62 => BinaryLshift,
            63 => BinaryRshift,
            64 => BinaryAnd,
            65 => BinaryXor,
            66 => BinaryOr,
            67 => InplacePower,
            68 => GetIter,
            70 => PrintExpr,
            71 => PrintItem,
            72 => PrintNewline,
            73 => PrintItemTo,
            74 => PrintNewlineTo,
            75 => InplaceLshift,
            76 => InplaceRshift,
            77 => InplaceAnd,
            78 => InplaceXor,
            79 => InplaceOr,
            80 => BreakLoop,
            81 => WithCleanup,
            82 => LoadLocals,
            83 => ReturnValue,
            84 => ImportStar,
            85 => ExecStmt,
            86 => YieldValue,
            87 => PopBlock,
            88 => EndFinally,
            89 => BuildClass,
            90 => StoreName,
            91 => DeleteName,
            92 => UnpackSequence,
            93 => ForIter,
            95 => StoreAttr,
            96 => DeleteAttr,
            97 => StoreGlobal,
            98 => DeleteGlobal,
            99 => DupTopx,
            100 => LoadConst,
            101 => LoadName,
            102 => BuildTuple,
            103 => BuildList,
            104 => BuildMap,
            105 => LoadAttr,
            106 => Opcode::CompareOp,
            107 => ImportName,
            108 => ImportFrom,
            110 => JumpForward,
            111 => JumpIfFalse,
            112 => JumpIfTrue,
            113 => JumpAbsolute,
            116 => LoadGlobal,
            119 => ContinueLoop,
            120 => SetupLoop,
            121 => SetupExcept,
            122 => SetupFinally,
            124 => LoadFast,
            125 => StoreFast,
            126 => DeleteFast,
            130 => RaiseVarargs,
            131 => CallFunction,
            132 => MakeFunction,
            133 => BuildSlice,
            134 => MakeClosure,
            135 => LoadClosure,
            136 => LoadDeref,
            137 => StoreDeref,
            140 => CallFunctionVar,
            141 => CallFunctionKw,
            142 => CallFunctionVarKw,
            143 => ExtendedArg,
            _ => return Err(format!("Unknown opcode: {}", byte)),
        })
    }

    /// Whether an operand follows the opcode byte
    pub fn has_argument(&self) -> bool {
        *self as u8 >= HAVE_ARGUMENT
    }

    /// Returns the number of operand bytes this opcode requires
    pub fn operand_size(&self) -> usize {
        if self.has_argument() { ARGUMENT_SIZE } else { 0 }
    }

    pub fn operand_kind(&self) -> OperandKind {
        use Opcode::*;
        match self {
            LoadConst => OperandKind::Const,
            StoreName | DeleteName | StoreAttr | DeleteAttr | StoreGlobal | DeleteGlobal
            | LoadName | LoadAttr | ImportName | ImportFrom | LoadGlobal => OperandKind::Name,
            LoadFast | StoreFast | DeleteFast => OperandKind::Local,
            LoadClosure | LoadDeref | StoreDeref => OperandKind::Free,
            Opcode::CompareOp => OperandKind::Compare,
            ForIter | JumpForward | JumpIfFalse | JumpIfTrue | SetupLoop | SetupExcept
            | SetupFinally => OperandKind::JumpRelative,
            JumpAbsolute | ContinueLoop => OperandKind::JumpAbsolute,
            op if op.has_argument() => OperandKind::Int,
            _ => OperandKind::None,
        }
    }

    /// Conditional branches that leave their operand on the stack
    pub fn is_conditional_jump(&self) -> bool {
        matches!(self, Opcode::JumpIfFalse | Opcode::JumpIfTrue)
    }

    pub fn is_unconditional_jump(&self) -> bool {
        matches!(
            self,
            Opcode::JumpForward | Opcode::JumpAbsolute | Opcode::ContinueLoop
        )
    }

    /// Instructions that end a basic block with an edge to their target
    pub fn is_branch(&self) -> bool {
        self.is_conditional_jump() || self.is_unconditional_jump() || *self == Opcode::ForIter
    }

    /// Block-setup instructions carry a jump operand but create no edge
    pub fn is_block_setup(&self) -> bool {
        matches!(
            self,
            Opcode::SetupLoop | Opcode::SetupExcept | Opcode::SetupFinally
        )
    }

    /// Instructions after which control never falls through
    pub fn is_terminal(&self) -> bool {
        self.is_unconditional_jump() || *self == Opcode::ReturnValue
    }

    /// Canonical upper-case mnemonic
    pub fn name(&self) -> &'static str {
        use Opcode::*;
        match self {
            StopCode => "STOP_CODE",
            PopTop => "POP_TOP",
            RotTwo => "ROT_TWO",
            RotThree => "ROT_THREE",
            DupTop => "DUP_TOP",
            RotFour => "ROT_FOUR",
            Nop => "NOP",
            UnaryPositive => "UNARY_POSITIVE",
            UnaryNegative => "UNARY_NEGATIVE",
            UnaryNot => "UNARY_NOT",
            UnaryConvert => "UNARY_CONVERT",
            UnaryInvert => "UNARY_INVERT",
            ListAppend => "LIST_APPEND",
            BinaryPower => "BINARY_POWER",
            BinaryMultiply => "BINARY_MULTIPLY",
            BinaryDivide => "BINARY_DIVIDE",
            BinaryModulo => "BINARY_MODULO",
            BinaryAdd => "BINARY_ADD",
            BinarySubtract => "BINARY_SUBTRACT",
            BinarySubscr => "BINARY_SUBSCR",
            BinaryFloorDivide => "BINARY_FLOOR_DIVIDE",
            BinaryTrueDivide => "BINARY_TRUE_DIVIDE",
            InplaceFloorDivide => "INPLACE_FLOOR_DIVIDE",
            InplaceTrueDivide => "INPLACE_TRUE_DIVIDE",
            Slice0 => "SLICE+0",
            Slice1 => "SLICE+1",
            Slice2 => "SLICE+2",
            Slice3 => "SLICE+3",
            StoreSlice0 => "STORE_SLICE+0",
            StoreSlice1 => "STORE_SLICE+1",
            StoreSlice2 => "STORE_SLICE+2",
            StoreSlice3 => "STORE_SLICE+3",
            DeleteSlice0 => "DELETE_SLICE+0",
            DeleteSlice1 => "DELETE_SLICE+1",
            DeleteSlice2 => "DELETE_SLICE+2",
            DeleteSlice3 => "DELETE_SLICE+3",
            StoreMap => "STORE_MAP",
            InplaceAdd => "INPLACE_ADD",
            InplaceSubtract => "INPLACE_SUBTRACT",
            InplaceMultiply => "INPLACE_MULTIPLY",
            InplaceDivide => "INPLACE_DIVIDE",
            InplaceModulo => "INPLACE_MODULO",
            StoreSubscr => "STORE_SUBSCR",
            DeleteSubscr => "DELETE_SUBSCR",
            BinaryLshift => "BINARY_LSHIFT",
            BinaryRshift => "BINARY_RSHIFT",
            BinaryAnd => "BINARY_AND",
            BinaryXor => "BINARY_XOR",
            BinaryOr => "BINARY_OR",
            InplacePower => "INPLACE_POWER",
            GetIter => "GET_ITER",
            PrintExpr => "PRINT_EXPR",
            PrintItem => "PRINT_ITEM",
            PrintNewline => "PRINT_NEWLINE",
            PrintItemTo => "PRINT_ITEM_TO",
            PrintNewlineTo => "PRINT_NEWLINE_TO",
            InplaceLshift => "INPLACE_LSHIFT",
            InplaceRshift => "INPLACE_RSHIFT",
            InplaceAnd => "INPLACE_AND",
            InplaceXor => "INPLACE_XOR",
            InplaceOr => "INPLACE_OR",
            BreakLoop => "BREAK_LOOP",
            WithCleanup => "WITH_CLEANUP",
            LoadLocals => "LOAD_LOCALS",
            ReturnValue => "RETURN_VALUE",
            ImportStar => "IMPORT_STAR",
            ExecStmt => "EXEC_STMT",
            YieldValue => "YIELD_VALUE",
            PopBlock => "POP_BLOCK",
            EndFinally => "END_FINALLY",
            BuildClass => "BUILD_CLASS",
            StoreName => "STORE_NAME",
            DeleteName => "DELETE_NAME",
            UnpackSequence => "UNPACK_SEQUENCE",
            ForIter => "FOR_ITER",
            StoreAttr => "STORE_ATTR",
            DeleteAttr => "DELETE_ATTR",
            StoreGlobal => "STORE_GLOBAL",
            DeleteGlobal => "DELETE_GLOBAL",
            DupTopx => "DUP_TOPX",
            LoadConst => "LOAD_CONST",
            LoadName => "LOAD_NAME",
            BuildTuple => "BUILD_TUPLE",
            BuildList => "BUILD_LIST",
            BuildMap => "BUILD_MAP",
            LoadAttr => "LOAD_ATTR",
            Opcode::CompareOp => "COMPARE_OP",
            ImportName => "IMPORT_NAME",
            ImportFrom => "IMPORT_FROM",
            JumpForward => "JUMP_FORWARD",
            JumpIfFalse => "JUMP_IF_FALSE",
            JumpIfTrue => "JUMP_IF_TRUE",
            JumpAbsolute => "JUMP_ABSOLUTE",
            LoadGlobal => "LOAD_GLOBAL",
            ContinueLoop => "CONTINUE_LOOP",
            SetupLoop => "SETUP_LOOP",
            SetupExcept => "SETUP_EXCEPT",
            SetupFinally => "SETUP_FINALLY",
            LoadFast => "LOAD_FAST",
            StoreFast => "STORE_FAST",
            DeleteFast => "DELETE_FAST",
            RaiseVarargs => "RAISE_VARARGS",
            CallFunction => "CALL_FUNCTION",
            MakeFunction => "MAKE_FUNCTION",
            BuildSlice => "BUILD_SLICE",
            MakeClosure => "MAKE_CLOSURE",
            LoadClosure => "LOAD_CLOSURE",
            LoadDeref => "LOAD_DEREF",
            StoreDeref => "STORE_DEREF",
            CallFunctionVar => "CALL_FUNCTION_VAR",
            CallFunctionKw => "CALL_FUNCTION_KW",
            CallFunctionVarKw => "CALL_FUNCTION_VAR_KW",
            ExtendedArg => "EXTENDED_ARG",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

/// Comparison operators, in COMPARE_OP operand order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Lt,
    Le,
    Eq,
    Ne,
    Gt,
    Ge,
    In,
    NotIn,
    Is,
    IsNot,
    ExceptionMatch,
}

impl CompareOp {
    const TABLE: [CompareOp; 11] = [
        CompareOp::Lt,
        CompareOp::Le,
        CompareOp::Eq,
        CompareOp::Ne,
        CompareOp::Gt,
        CompareOp::Ge,
        CompareOp::In,
        CompareOp::NotIn,
        CompareOp::Is,
        CompareOp::IsNot,
        CompareOp::ExceptionMatch,
    ];

    pub fn from_index(index: u32) -> Option<Self> {
        Self::TABLE.get(index as usize).copied()
    }

    pub fn index(&self) -> u16 {
        *self as u16
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::In => "in",
            CompareOp::NotIn => "not in",
            CompareOp::Is => "is",
            CompareOp::IsNot => "is not",
            CompareOp::ExceptionMatch => "exception match",
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.symbol())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        for byte in 0..=u8::MAX {
            if let Ok(opcode) = Opcode::from_u8(byte) {
                assert_eq!(opcode as u8, byte, "{} decoded from {}", opcode, byte);
            }
        }
        assert_eq!(Opcode::from_u8(100).unwrap(), Opcode::LoadConst);
        assert_eq!(Opcode::from_u8(111).unwrap(), Opcode::JumpIfFalse);
    }

    #[test]
    fn test_invalid_opcode() {
        assert!(Opcode::from_u8(6).is_err());
        assert!(Opcode::from_u8(94).is_err());
        assert!(Opcode::from_u8(255).is_err());
    }

    #[test]
    fn test_operand_sizes() {
        assert_eq!(Opcode::PopTop.operand_size(), 0);
        assert_eq!(Opcode::YieldValue.operand_size(), 0);
        assert_eq!(Opcode::StoreName.operand_size(), 2);
        assert_eq!(Opcode::LoadConst.operand_size(), 2);
        assert_eq!(Opcode::ExtendedArg.operand_size(), 2);
    }

    #[test]
    fn test_operand_kinds() {
        assert_eq!(Opcode::LoadConst.operand_kind(), OperandKind::Const);
        assert_eq!(Opcode::LoadGlobal.operand_kind(), OperandKind::Name);
        assert_eq!(Opcode::StoreFast.operand_kind(), OperandKind::Local);
        assert_eq!(Opcode::LoadDeref.operand_kind(), OperandKind::Free);
        assert_eq!(Opcode::CompareOp.operand_kind(), OperandKind::Compare);
        assert_eq!(Opcode::ForIter.operand_kind(), OperandKind::JumpRelative);
        assert_eq!(Opcode::JumpAbsolute.operand_kind(), OperandKind::JumpAbsolute);
        assert_eq!(Opcode::BuildTuple.operand_kind(), OperandKind::Int);
        assert_eq!(Opcode::BinaryAdd.operand_kind(), OperandKind::None);
    }

    #[test]
    fn test_branch_classification() {
        assert!(Opcode::JumpIfFalse.is_conditional_jump());
        assert!(!Opcode::JumpForward.is_conditional_jump());
        assert!(Opcode::ForIter.is_branch());
        assert!(!Opcode::SetupLoop.is_branch());
        assert!(Opcode::SetupLoop.is_block_setup());
        assert!(Opcode::ReturnValue.is_terminal());
    }

    #[test]
    fn test_compare_table() {
        assert_eq!(CompareOp::from_index(0), Some(CompareOp::Lt));
        assert_eq!(CompareOp::from_index(7), Some(CompareOp::NotIn));
        assert_eq!(CompareOp::from_index(11), None);
        assert_eq!(CompareOp::IsNot.index(), 9);
        assert_eq!(CompareOp::NotIn.to_string(), "not in");
    }
}
