use thiserror::Error;

use crate::bytecode::op::{DecodeError, Instruction, OpCode, decode};

/// Operand written by `emit_jump`/`emit_jump_false` until the jump is patched.
pub const JUMP_SENTINEL: i32 = -1;

const INITIAL_CAPACITY: usize = 1 << 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BytecodeError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("patch offset {offset} is outside the buffer ({count} bytes)")]
    PatchOutOfRange { offset: usize, count: usize },

    #[error("address {0} does not fit in a 32-bit operand")]
    AddressOverflow(i64),
}

/// Growable byte buffer that instructions are emitted into.
///
/// `count()` is the number of bytes used and doubles as the "current address"
/// for jump patching. Capacity grows geometrically and never shrinks.
///
/// Jump operands are absolute offsets relative to `address_offset`, which is
/// 0 while a function is being compiled. [`Bytecode::set_address_offset`]
/// rebases them when the buffer is placed into a linked image.
#[derive(Debug, Clone)]
pub struct Bytecode {
    chunk: Vec<u8>,
    address_offset: usize,
}

impl Default for Bytecode {
    fn default() -> Self {
        Self::new()
    }
}

impl Bytecode {
    pub fn new() -> Self {
        Bytecode {
            chunk: Vec::with_capacity(INITIAL_CAPACITY),
            address_offset: 0,
        }
    }

    /// Wraps raw bytes, e.g. a loaded image.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Bytecode {
            chunk: bytes,
            address_offset: 0,
        }
    }

    pub fn count(&self) -> usize {
        self.chunk.len()
    }

    pub fn capacity(&self) -> usize {
        self.chunk.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.chunk.is_empty()
    }

    /// Address of the next byte to be written.
    pub fn address(&self) -> usize {
        self.chunk.len()
    }

    pub fn address_offset(&self) -> usize {
        self.address_offset
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.chunk
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.chunk
    }

    fn grow_for(&mut self, additional: usize) {
        let needed = self.chunk.len() + additional;
        let capacity = self.chunk.capacity();
        if needed <= capacity {
            return;
        }

        let mut new_capacity = capacity.max(1);
        while new_capacity < needed {
            new_capacity *= 2;
        }
        self.chunk.reserve_exact(new_capacity - self.chunk.len());
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> usize {
        self.grow_for(bytes.len());
        let offset = self.chunk.len();
        self.chunk.extend_from_slice(bytes);
        offset
    }

    // =========================================================================
    // Typed appends - each returns the offset it wrote at
    // =========================================================================

    pub fn write_i8(&mut self, value: i8) -> usize {
        self.write_bytes(&value.to_ne_bytes())
    }

    pub fn write_i16(&mut self, value: i16) -> usize {
        self.write_bytes(&value.to_ne_bytes())
    }

    pub fn write_i32(&mut self, value: i32) -> usize {
        self.write_bytes(&value.to_ne_bytes())
    }

    pub fn write_i64(&mut self, value: i64) -> usize {
        self.write_bytes(&value.to_ne_bytes())
    }

    pub fn emit_op(&mut self, op: OpCode) -> usize {
        self.write_bytes(&[op as u8])
    }

    /// Emits `op` followed by its operand, returning the operand's offset.
    pub fn emit_op_arg(&mut self, op: OpCode, arg: i32) -> usize {
        self.emit_op(op);
        self.write_i32(arg)
    }

    /// Emits an unconditional jump to a known address (backward jumps).
    pub fn emit_jump_to(&mut self, address: usize) -> Result<usize, BytecodeError> {
        let target = to_operand(address as i64)?;
        Ok(self.emit_op_arg(OpCode::Jump, target))
    }

    /// Emits an unconditional jump with a sentinel target, for patching.
    pub fn emit_jump(&mut self) -> usize {
        self.emit_op_arg(OpCode::Jump, JUMP_SENTINEL)
    }

    /// Emits a jump-if-false with a sentinel target, for patching.
    pub fn emit_jump_false(&mut self) -> usize {
        self.emit_op_arg(OpCode::JumpIfFalse, JUMP_SENTINEL)
    }

    /// Points the jump operand at `offset` to the current write position.
    pub fn patch_jump(&mut self, offset: usize) -> Result<(), BytecodeError> {
        let target = to_operand(self.address() as i64)?;
        self.patch_i32(offset, target)
    }

    /// Overwrites the 4-byte operand stored at `offset`.
    pub fn patch_i32(&mut self, offset: usize, value: i32) -> Result<(), BytecodeError> {
        let count = self.count();
        let slot = self
            .chunk
            .get_mut(offset..offset + OpCode::OPERAND_SIZE)
            .ok_or(BytecodeError::PatchOutOfRange { offset, count })?;
        slot.copy_from_slice(&value.to_ne_bytes());
        Ok(())
    }

    /// Rebases every jump target from the current `address_offset` to
    /// `new_base`, then records `new_base`.
    pub fn set_address_offset(&mut self, new_base: usize) -> Result<(), BytecodeError> {
        let mut cursor = 0;
        while let Some(instr) = self.instruction_at(&mut cursor)? {
            if !instr.op.is_jump() {
                continue;
            }
            let old = instr.operand.unwrap_or(JUMP_SENTINEL) as i64;
            let rebased = old - self.address_offset as i64 + new_base as i64;
            let operand_offset = cursor - OpCode::OPERAND_SIZE;
            self.patch_i32(operand_offset, to_operand(rebased)?)?;
        }
        self.address_offset = new_base;
        Ok(())
    }

    /// Decodes the instruction at `*cursor` and advances past it.
    ///
    /// `Ok(None)` means no further instruction remains.
    pub fn instruction_at(&self, cursor: &mut usize) -> Result<Option<Instruction>, DecodeError> {
        decode(&self.chunk, cursor)
    }

    /// Iterates `(offset, instruction)` pairs from the start of the buffer.
    pub fn instructions(&self) -> Instructions<'_> {
        Instructions {
            code: &self.chunk,
            cursor: 0,
            failed: false,
        }
    }

    /// Appends raw bytes verbatim, returning where they landed.
    pub fn import(&mut self, bytes: &[u8]) -> usize {
        self.write_bytes(bytes)
    }
}

fn to_operand(value: i64) -> Result<i32, BytecodeError> {
    i32::try_from(value).map_err(|_| BytecodeError::AddressOverflow(value))
}

pub struct Instructions<'a> {
    code: &'a [u8],
    cursor: usize,
    failed: bool,
}

impl Iterator for Instructions<'_> {
    type Item = Result<(usize, Instruction), DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let offset = self.cursor;
        match decode(self.code, &mut self.cursor) {
            Ok(Some(instr)) => Some(Ok((offset, instr))),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
