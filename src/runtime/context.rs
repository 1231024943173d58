use crate::bytecode::op::{DecodeError, Instruction, OpCode, decode};
use crate::runtime::runtime_error::RuntimeFault;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Running,
    Killed,
    Exited,
    Unused,
}

impl ContextState {
    /// Whether `fork` may reuse a context in this state.
    pub fn is_free(self) -> bool {
        self != ContextState::Running
    }
}

impl std::fmt::Display for ContextState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContextState::Running => "running",
            ContextState::Killed => "killed",
            ContextState::Exited => "exited",
            ContextState::Unused => "unused",
        };
        f.write_str(s)
    }
}

/// What an executed instruction needs from the VM beyond the context itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    None,
    Print(i32),
    Fork,
    Kill(i32),
}

/// One cooperative virtual thread.
///
/// Owns a private copy of the code image, a fixed-size operand stack and a
/// bounded frame stack. Every stack access is bounds-checked; a violation is
/// returned as a [`RuntimeFault`] instead of touching memory outside the
/// context.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    id: usize,
    code: Vec<u8>,
    stack: Vec<i32>,
    sp: usize,
    fp: usize,
    frames: Vec<usize>,
    ip: usize,
    state: ContextState,
    op_count: u64,
    fault: Option<RuntimeFault>,
}

impl ExecutionContext {
    pub fn unused(id: usize) -> Self {
        ExecutionContext {
            id,
            code: Vec::new(),
            stack: Vec::new(),
            sp: 0,
            fp: 0,
            frames: Vec::new(),
            ip: 0,
            state: ContextState::Unused,
            op_count: 0,
            fault: None,
        }
    }

    /// Resets this context to start executing `code` at `entry`.
    pub fn start(&mut self, code: Vec<u8>, entry: usize, stack_size: usize) {
        self.code = code;
        self.stack = vec![0; stack_size];
        self.sp = 0;
        self.fp = 0;
        self.frames.clear();
        self.ip = entry;
        self.state = ContextState::Running;
        self.op_count = 0;
        self.fault = None;
    }

    /// Makes this context a copy of `parent`: code, the used part of the
    /// stack, registers and call frames.
    pub fn fork_from(&mut self, parent: &ExecutionContext) {
        self.code.clone_from(&parent.code);
        self.stack.clear();
        self.stack.resize(parent.stack.len(), 0);
        self.stack[..parent.sp].copy_from_slice(&parent.stack[..parent.sp]);
        self.sp = parent.sp;
        self.fp = parent.fp;
        self.frames.clone_from(&parent.frames);
        self.ip = parent.ip;
        self.state = ContextState::Running;
        self.op_count = 0;
        self.fault = None;
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == ContextState::Running
    }

    pub fn op_count(&self) -> u64 {
        self.op_count
    }

    pub fn fault(&self) -> Option<&RuntimeFault> {
        self.fault.as_ref()
    }

    pub fn ip(&self) -> usize {
        self.ip
    }

    pub fn fp(&self) -> usize {
        self.fp
    }

    /// The used portion of the operand stack, bottom first.
    pub fn stack(&self) -> &[i32] {
        &self.stack[..self.sp]
    }

    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    pub fn kill(&mut self) {
        self.state = ContextState::Killed;
    }

    /// Kills the context and records why.
    pub fn fail(&mut self, fault: RuntimeFault) {
        self.state = ContextState::Killed;
        self.fault = Some(fault);
    }

    // =========================================================================
    // Bounds-checked stack access
    // =========================================================================

    pub fn push(&mut self, value: i32) -> Result<(), RuntimeFault> {
        let capacity = self.stack.len();
        let slot = self
            .stack
            .get_mut(self.sp)
            .ok_or(RuntimeFault::StackOverflow { capacity })?;
        *slot = value;
        self.sp += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Result<i32, RuntimeFault> {
        if self.sp == 0 {
            return Err(RuntimeFault::StackUnderflow);
        }
        self.sp -= 1;
        Ok(self.stack[self.sp])
    }

    fn slot_index(&self, slot: i32) -> Result<usize, RuntimeFault> {
        let address = self.fp as i64 + slot as i64;
        usize::try_from(address)
            .ok()
            .filter(|&a| a < self.stack.len())
            .ok_or(RuntimeFault::SlotOutOfBounds { fp: self.fp, slot })
    }

    pub fn load(&self, slot: i32) -> Result<i32, RuntimeFault> {
        let index = self.slot_index(slot)?;
        Ok(self.stack[index])
    }

    pub fn store(&mut self, slot: i32, value: i32) -> Result<(), RuntimeFault> {
        let index = self.slot_index(slot)?;
        self.stack[index] = value;
        Ok(())
    }

    fn jump(&mut self, target: i32) -> Result<(), RuntimeFault> {
        match usize::try_from(target) {
            Ok(ip) if ip < self.code.len() => {
                self.ip = ip;
                Ok(())
            }
            _ => Err(RuntimeFault::IpOutOfBounds(target as i64)),
        }
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Decodes the instruction at `ip` and advances past it.
    pub fn fetch(&mut self) -> Result<Instruction, RuntimeFault> {
        let mut cursor = self.ip;
        match decode(&self.code, &mut cursor) {
            Ok(Some(instr)) => {
                self.ip = cursor;
                self.op_count += 1;
                Ok(instr)
            }
            Ok(None) => Err(RuntimeFault::IpOutOfBounds(self.ip as i64)),
            Err(DecodeError::IllegalOpcode { byte, offset }) => {
                Err(RuntimeFault::IllegalOpcode { byte, ip: offset })
            }
            // the operand runs past the end of the code
            Err(DecodeError::TruncatedOperand { offset, .. }) => {
                Err(RuntimeFault::IpOutOfBounds(offset as i64 + 1))
            }
        }
    }

    /// Executes one already-fetched instruction.
    pub fn execute(&mut self, instr: Instruction, frame_limit: usize) -> Result<Effect, RuntimeFault> {
        let operand = instr.operand.unwrap_or(0);

        if instr.op.is_binary() {
            let b = self.pop()?;
            let a = self.pop()?;
            self.push(binary(instr.op, a, b)?)?;
            return Ok(Effect::None);
        }

        match instr.op {
            OpCode::Neg => {
                let a = self.pop()?;
                self.push(a.wrapping_neg())?;
            }
            OpCode::Not => {
                let a = self.pop()?;
                self.push((a == 0) as i32)?;
            }

            OpCode::Jump => self.jump(operand)?,
            OpCode::JumpIfFalse => {
                if self.pop()? == 0 {
                    self.jump(operand)?;
                }
            }

            OpCode::Store => {
                let value = self.pop()?;
                self.store(operand, value)?;
            }
            OpCode::Load => {
                let value = self.load(operand)?;
                self.push(value)?;
            }
            OpCode::Push => self.push(operand)?,
            OpCode::Pop => {
                self.pop()?;
            }
            OpCode::Swap => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(b)?;
                self.push(a)?;
            }

            OpCode::Call => {
                if self.frames.len() >= frame_limit {
                    return Err(RuntimeFault::RecursionLimit(frame_limit));
                }
                self.push(self.ip as i32)?;
                self.frames.push(self.fp);
                self.fp = self.sp;
                self.jump(operand)?;
            }
            OpCode::Return => {
                let value = self.pop()?;
                let return_address = self.pop()?;
                self.fp = self.frames.pop().ok_or(RuntimeFault::FrameUnderflow)?;
                self.jump(return_address)?;
                self.push(value)?;
            }
            OpCode::Halt => self.state = ContextState::Exited,

            OpCode::Print => return Ok(Effect::Print(self.pop()?)),
            OpCode::Fork => return Ok(Effect::Fork),
            OpCode::Kill => return Ok(Effect::Kill(self.pop()?)),

            // binary ops handled above
            _ => {}
        }
        Ok(Effect::None)
    }
}

/// Shared handler for the contiguous binary range. Arithmetic wraps;
/// comparisons and logic yield 1 or 0.
fn binary(op: OpCode, a: i32, b: i32) -> Result<i32, RuntimeFault> {
    let value = match op {
        OpCode::Add => a.wrapping_add(b),
        OpCode::Sub => a.wrapping_sub(b),
        OpCode::Mul => a.wrapping_mul(b),
        OpCode::Div => {
            if b == 0 {
                return Err(RuntimeFault::DivisionByZero);
            }
            a.wrapping_div(b)
        }
        OpCode::Mod => {
            if b == 0 {
                return Err(RuntimeFault::DivisionByZero);
            }
            a.wrapping_rem(b)
        }
        OpCode::Eq => (a == b) as i32,
        OpCode::Ne => (a != b) as i32,
        OpCode::Gt => (a > b) as i32,
        OpCode::Lt => (a < b) as i32,
        OpCode::Ge => (a >= b) as i32,
        OpCode::Le => (a <= b) as i32,
        OpCode::And => (a != 0 && b != 0) as i32,
        OpCode::Or => (a != 0 || b != 0) as i32,
        _ => return Err(RuntimeFault::IllegalOpcode { byte: op as u8, ip: 0 }),
    };
    Ok(value)
}
