use std::fmt;

use thiserror::Error;

// =============================================================================
// OPCODE - one byte per instruction
// =============================================================================

/// Bytecode instructions.
///
/// The binary operations `Add..=Or` must stay contiguous: the VM dispatches
/// them with a single range check into one shared handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    // binary operations (contiguous)
    Add = 0,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    And,
    Or,
    // end binary operations
    Neg,
    Not,

    // control flow
    Jump,
    JumpIfFalse,

    // data movement
    Store,
    Load,
    Push,
    Pop,
    Swap,

    // calls
    Call,
    Return,
    Halt,

    // I/O
    Print,

    // thread control
    Fork,
    Kill,
}

impl OpCode {
    const ALL: [OpCode; 28] = [
        OpCode::Add,
        OpCode::Sub,
        OpCode::Mul,
        OpCode::Div,
        OpCode::Mod,
        OpCode::Eq,
        OpCode::Ne,
        OpCode::Gt,
        OpCode::Lt,
        OpCode::Ge,
        OpCode::Le,
        OpCode::And,
        OpCode::Or,
        OpCode::Neg,
        OpCode::Not,
        OpCode::Jump,
        OpCode::JumpIfFalse,
        OpCode::Store,
        OpCode::Load,
        OpCode::Push,
        OpCode::Pop,
        OpCode::Swap,
        OpCode::Call,
        OpCode::Return,
        OpCode::Halt,
        OpCode::Print,
        OpCode::Fork,
        OpCode::Kill,
    ];

    /// Size in bytes of the 32-bit operand carried by some opcodes.
    pub const OPERAND_SIZE: usize = 4;

    pub fn from_byte(byte: u8) -> Option<OpCode> {
        Self::ALL.get(byte as usize).copied()
    }

    /// True for the contiguous binary range `Add..=Or`.
    pub fn is_binary(self) -> bool {
        (OpCode::Add as u8..=OpCode::Or as u8).contains(&(self as u8))
    }

    /// Jump-family opcodes carry an absolute address that must be rebased
    /// when the owning buffer is moved into the linked image.
    pub fn is_jump(self) -> bool {
        matches!(self, OpCode::Jump | OpCode::JumpIfFalse)
    }

    pub fn has_operand(self) -> bool {
        matches!(
            self,
            OpCode::Jump
                | OpCode::JumpIfFalse
                | OpCode::Store
                | OpCode::Load
                | OpCode::Push
                | OpCode::Call
        )
    }

    /// Total encoded length: opcode byte plus optional operand.
    pub fn encoded_len(self) -> usize {
        if self.has_operand() {
            1 + Self::OPERAND_SIZE
        } else {
            1
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            OpCode::Add => "ADD",
            OpCode::Sub => "SUB",
            OpCode::Mul => "MUL",
            OpCode::Div => "DIV",
            OpCode::Mod => "MOD",
            OpCode::Eq => "EQ",
            OpCode::Ne => "NE",
            OpCode::Gt => "GT",
            OpCode::Lt => "LT",
            OpCode::Ge => "GE",
            OpCode::Le => "LE",
            OpCode::And => "AND",
            OpCode::Or => "OR",
            OpCode::Neg => "NEG",
            OpCode::Not => "NOT",
            OpCode::Jump => "JUMP",
            OpCode::JumpIfFalse => "JUMP_FALSE",
            OpCode::Store => "STORE",
            OpCode::Load => "LOAD",
            OpCode::Push => "PUSH",
            OpCode::Pop => "POP",
            OpCode::Swap => "SWAP",
            OpCode::Call => "CALL",
            OpCode::Return => "RETURN",
            OpCode::Halt => "HALT",
            OpCode::Print => "PRINT",
            OpCode::Fork => "FORK",
            OpCode::Kill => "KILL",
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// INSTRUCTION - decoded view of one opcode + operand
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub op: OpCode,
    pub operand: Option<i32>,
}

impl Instruction {
    pub fn new(op: OpCode) -> Self {
        Instruction { op, operand: None }
    }

    pub fn with_operand(op: OpCode, operand: i32) -> Self {
        Instruction {
            op,
            operand: Some(operand),
        }
    }

    pub fn encoded_len(&self) -> usize {
        self.op.encoded_len()
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operand {
            Some(arg) => write!(f, "{:<11} {}", self.op.name(), arg),
            None => write!(f, "{}", self.op.name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("illegal opcode {byte:#04x} at offset {offset}")]
    IllegalOpcode { byte: u8, offset: usize },

    #[error("truncated operand for {op} at offset {offset}")]
    TruncatedOperand { op: OpCode, offset: usize },
}

/// Decodes the instruction at `*cursor`, advancing the cursor past it.
///
/// Returns `Ok(None)` once the cursor reaches the end of `code`. Operands are
/// 4-byte signed integers in host byte order.
pub fn decode(code: &[u8], cursor: &mut usize) -> Result<Option<Instruction>, DecodeError> {
    let offset = *cursor;
    let Some(&byte) = code.get(offset) else {
        return Ok(None);
    };

    let op = OpCode::from_byte(byte).ok_or(DecodeError::IllegalOpcode { byte, offset })?;

    if !op.has_operand() {
        *cursor = offset + 1;
        return Ok(Some(Instruction::new(op)));
    }

    let start = offset + 1;
    let bytes: [u8; OpCode::OPERAND_SIZE] = code
        .get(start..start + OpCode::OPERAND_SIZE)
        .and_then(|s| s.try_into().ok())
        .ok_or(DecodeError::TruncatedOperand { op, offset })?;

    *cursor = start + OpCode::OPERAND_SIZE;
    Ok(Some(Instruction::with_operand(op, i32::from_ne_bytes(bytes))))
}
