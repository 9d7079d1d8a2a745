//! Bytecode data types.
//! One opcode plus one immediate operand per instruction, stack VM.

use serde::{Deserialize, Serialize};
use std::rc::Rc;
use strum::{Display, EnumString, IntoStaticStr};

/// Opcodes for the stack VM
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, IntoStaticStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum OpCode {
    // Stack manipulation
    Nop = 0,
    PopTop = 1,          // drop TOS
    RotTwo = 2,          // swap TOS and TOS1
    RotThree = 3,        // lift TOS two places down
    DupTop = 4,          // push a copy of TOS
    DupTopTwo = 5,       // push copies of TOS1, TOS

    // Unary
    UnaryPositive = 10,
    UnaryNegative = 11,
    UnaryNot = 12,
    UnaryInvert = 13,

    // Binary (TOS1 op TOS)
    BinaryAdd = 20,
    BinarySubtract = 21,
    BinaryMultiply = 22,
    BinaryTrueDivide = 23,
    BinaryFloorDivide = 24,
    BinaryModulo = 25,
    BinaryPower = 26,
    BinarySubscr = 27,   // TOS1[TOS]
    BinaryLshift = 28,
    BinaryRshift = 29,
    BinaryAnd = 30,
    BinaryOr = 31,
    BinaryXor = 32,

    // In-place binary
    InplaceAdd = 40,
    InplaceSubtract = 41,
    InplaceMultiply = 42,
    InplaceTrueDivide = 43,
    InplaceFloorDivide = 44,
    InplaceModulo = 45,
    InplacePower = 46,
    InplaceLshift = 47,
    InplaceRshift = 48,
    InplaceAnd = 49,
    InplaceOr = 50,
    InplaceXor = 51,

    // Comparison
    CompareOp = 60,      // arg: CompareOp index
    IsOp = 61,           // arg: 1 = `is not`
    ContainsOp = 62,     // TOS1 in TOS; arg: 1 = `not in`

    // Loads and stores
    LoadConst = 70,      // arg: consts index
    LoadName = 71,       // arg: names index
    StoreName = 72,
    LoadGlobal = 73,
    StoreGlobal = 74,
    LoadFast = 75,       // arg: varnames index
    StoreFast = 76,
    LoadAttr = 77,       // TOS = TOS.names[arg]
    StoreAttr = 78,      // TOS.names[arg] = TOS1
    LoadMethod = 79,     // push NULL, attr  or  method, receiver
    StoreSubscr = 80,    // TOS1[TOS] = TOS2

    // Construction
    BuildList = 90,      // arg: item count
    BuildTuple = 91,
    BuildMap = 92,       // arg: key/value pair count
    BuildString = 93,    // arg: piece count

    // Imports
    ImportName = 100,    // TOS1 = level, TOS = fromlist; arg: names index
    ImportFrom = 101,    // push TOS.names[arg], module stays
    ImportStar = 102,

    // Calls
    CallFunction = 110,  // arg: positional count
    CallFunctionKw = 111,// arg: total count, TOS = keyword-names tuple
    CallFunctionEx = 112,// arg & 1: kwargs mapping present
    CallMethod = 113,    // arg: positional count after receiver slot
    MakeFunction = 114,  // TOS = qualname, TOS1 = code; arg & 1: defaults tuple below
    ReturnValue = 115,

    // Control flow
    JumpForward = 120,   // relative to the next instruction
    JumpAbsolute = 121,  // absolute instruction index
    PopJumpIfFalse = 122,
    PopJumpIfTrue = 123,
    JumpIfFalseOrPop = 124,
    JumpIfTrueOrPop = 125,
    JumpIfNotExcMatch = 126,
    GetIter = 127,
    ForIter = 128,       // relative; jump when the iterator is exhausted
    UnpackSequence = 129,// arg: target count

    // Blocks and exceptions
    SetupFinally = 140,  // relative handler offset
    PopBlock = 141,
    PopExcept = 142,
    Reraise = 143,
    RaiseVarargs = 144,  // arg: 0 = re-raise, 1 = raise TOS
}

impl OpCode {
    pub fn name(self) -> &'static str {
        self.into()
    }

    pub fn is_call(self) -> bool {
        matches!(
            self,
            OpCode::CallFunction | OpCode::CallFunctionKw | OpCode::CallFunctionEx | OpCode::CallMethod
        )
    }

    pub fn is_conditional_branch(self) -> bool {
        matches!(self, OpCode::PopJumpIfFalse | OpCode::PopJumpIfTrue)
    }

    /// Operand is an absolute instruction index.
    pub fn has_absolute_target(self) -> bool {
        matches!(
            self,
            OpCode::JumpAbsolute
                | OpCode::PopJumpIfFalse
                | OpCode::PopJumpIfTrue
                | OpCode::JumpIfFalseOrPop
                | OpCode::JumpIfTrueOrPop
                | OpCode::JumpIfNotExcMatch
        )
    }

    /// Operand is an offset from the following instruction.
    pub fn has_relative_target(self) -> bool {
        matches!(self, OpCode::JumpForward | OpCode::ForIter | OpCode::SetupFinally)
    }

    /// Operand indexes the code object's `names` table.
    pub fn uses_name(self) -> bool {
        matches!(
            self,
            OpCode::LoadName
                | OpCode::StoreName
                | OpCode::LoadGlobal
                | OpCode::StoreGlobal
                | OpCode::LoadAttr
                | OpCode::StoreAttr
                | OpCode::LoadMethod
                | OpCode::ImportName
                | OpCode::ImportFrom
        )
    }

    pub fn uses_varname(self) -> bool {
        matches!(self, OpCode::LoadFast | OpCode::StoreFast)
    }

    pub fn unary_op(self) -> Option<UnaryOp> {
        Some(match self {
            OpCode::UnaryPositive => UnaryOp::Positive,
            OpCode::UnaryNegative => UnaryOp::Negative,
            OpCode::UnaryNot => UnaryOp::Not,
            OpCode::UnaryInvert => UnaryOp::Invert,
            _ => return None,
        })
    }

    /// Binary and in-place binary opcodes share one operator.
    pub fn binary_op(self) -> Option<BinaryOp> {
        Some(match self {
            OpCode::BinaryAdd | OpCode::InplaceAdd => BinaryOp::Add,
            OpCode::BinarySubtract | OpCode::InplaceSubtract => BinaryOp::Sub,
            OpCode::BinaryMultiply | OpCode::InplaceMultiply => BinaryOp::Mul,
            OpCode::BinaryTrueDivide | OpCode::InplaceTrueDivide => BinaryOp::Div,
            OpCode::BinaryFloorDivide | OpCode::InplaceFloorDivide => BinaryOp::FloorDiv,
            OpCode::BinaryModulo | OpCode::InplaceModulo => BinaryOp::Mod,
            OpCode::BinaryPower | OpCode::InplacePower => BinaryOp::Pow,
            OpCode::BinarySubscr => BinaryOp::Subscr,
            OpCode::BinaryLshift | OpCode::InplaceLshift => BinaryOp::Lshift,
            OpCode::BinaryRshift | OpCode::InplaceRshift => BinaryOp::Rshift,
            OpCode::BinaryAnd | OpCode::InplaceAnd => BinaryOp::And,
            OpCode::BinaryOr | OpCode::InplaceOr => BinaryOp::Or,
            OpCode::BinaryXor | OpCode::InplaceXor => BinaryOp::Xor,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Positive,
    Negative,
    Not,
    Invert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    Subscr,
    Lshift,
    Rshift,
    And,
    Or,
    Xor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Le,
    Eq,
    Ne,
    Gt,
    Ge,
    In,
    NotIn,
}

impl CompareOp {
    /// Decode a `COMPARE_OP` operand.
    pub fn from_arg(arg: u32) -> Option<Self> {
        Some(match arg {
            0 => CompareOp::Lt,
            1 => CompareOp::Le,
            2 => CompareOp::Eq,
            3 => CompareOp::Ne,
            4 => CompareOp::Gt,
            5 => CompareOp::Ge,
            _ => return None,
        })
    }

    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::In => "in",
            CompareOp::NotIn => "not in",
        }
    }

    pub fn from_symbol(symbol: &str) -> Option<Self> {
        Some(match symbol {
            "<" => CompareOp::Lt,
            "<=" => CompareOp::Le,
            "==" => CompareOp::Eq,
            "!=" => CompareOp::Ne,
            ">" => CompareOp::Gt,
            ">=" => CompareOp::Ge,
            _ => return None,
        })
    }

    pub fn to_arg(self) -> Option<u32> {
        Some(match self {
            CompareOp::Lt => 0,
            CompareOp::Le => 1,
            CompareOp::Eq => 2,
            CompareOp::Ne => 3,
            CompareOp::Gt => 4,
            CompareOp::Ge => 5,
            CompareOp::In | CompareOp::NotIn => return None,
        })
    }
}

/// A single instruction: opcode, immediate operand, source line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub op: OpCode,
    #[serde(default)]
    pub arg: u32,
    #[serde(default)]
    pub line: u32,
}

impl Instruction {
    pub fn new(op: OpCode, arg: u32) -> Self { Self { op, arg, line: 0 } }
    pub fn at_line(op: OpCode, arg: u32, line: u32) -> Self { Self { op, arg, line } }

    /// Resolved jump target for an instruction sitting at `index`.
    pub fn jump_target(&self, index: usize) -> Option<usize> {
        if self.op.has_absolute_target() {
            Some(self.arg as usize)
        } else if self.op.has_relative_target() {
            Some(index + 1 + self.arg as usize)
        } else {
            None
        }
    }
}

/// Constant value in the constant pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(Vec<Constant>),
    Code(Rc<CodeObject>),
}

/// A compiled body: module top level or one function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeObject {
    pub name: String,
    pub filename: String,
    #[serde(default)]
    pub first_line: u32,
    /// Leading entries of `varnames` that are positional parameters.
    #[serde(default)]
    pub argcount: u32,
    #[serde(default)]
    pub varnames: Vec<String>,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub consts: Vec<Constant>,
    pub instructions: Vec<Instruction>,
}

impl CodeObject {
    pub fn new(name: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filename: filename.into(),
            first_line: 0,
            argcount: 0,
            varnames: Vec::new(),
            names: Vec::new(),
            consts: Vec::new(),
            instructions: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn instruction(&self, index: usize) -> Option<&Instruction> {
        self.instructions.get(index)
    }

    pub fn opcode_at(&self, index: usize) -> Option<OpCode> {
        self.instructions.get(index).map(|i| i.op)
    }

    pub fn name_at(&self, arg: u32) -> Option<&str> {
        self.names.get(arg as usize).map(String::as_str)
    }

    pub fn varname_at(&self, arg: u32) -> Option<&str> {
        self.varnames.get(arg as usize).map(String::as_str)
    }

    /// Index of the structurally final instruction.
    pub fn last_index(&self) -> Option<usize> {
        self.instructions.len().checked_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_opcode_names_round_trip_through_strum() {
        assert_eq!(OpCode::CallFunctionKw.name(), "CALL_FUNCTION_KW");
        assert_eq!(OpCode::JumpIfNotExcMatch.name(), "JUMP_IF_NOT_EXC_MATCH");
        assert_eq!(OpCode::from_str("POP_JUMP_IF_FALSE").ok(), Some(OpCode::PopJumpIfFalse));
        assert!(OpCode::from_str("NOT_AN_OP").is_err());
    }

    #[test]
    fn test_jump_targets() {
        let fwd = Instruction::new(OpCode::JumpForward, 4);
        assert_eq!(fwd.jump_target(10), Some(15));
        let abs = Instruction::new(OpCode::JumpAbsolute, 3);
        assert_eq!(abs.jump_target(10), Some(3));
        assert_eq!(Instruction::new(OpCode::PopTop, 0).jump_target(1), None);
    }

    #[test]
    fn test_inplace_ops_share_binary_operator() {
        assert_eq!(OpCode::InplaceAdd.binary_op(), Some(BinaryOp::Add));
        assert_eq!(OpCode::BinarySubscr.binary_op(), Some(BinaryOp::Subscr));
        assert_eq!(OpCode::CompareOp.binary_op(), None);
    }
}
