use thiserror::Error;

/// A fault raised by one execution context.
///
/// Faults are local: the VM marks the offending context Killed, keeps the
/// fault on it for inspection and keeps scheduling the others.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeFault {
    #[error("stack overflow ({capacity} words)")]
    StackOverflow { capacity: usize },

    #[error("stack underflow")]
    StackUnderflow,

    #[error("slot {slot} relative to frame {fp} is outside the stack")]
    SlotOutOfBounds { fp: usize, slot: i32 },

    #[error("instruction pointer {0} is outside the code")]
    IpOutOfBounds(i64),

    #[error("illegal opcode {byte:#04x} at {ip:04}")]
    IllegalOpcode { byte: u8, ip: usize },

    #[error("recursion depth exceeded ({0} frames)")]
    RecursionLimit(usize),

    #[error("return without an active call frame")]
    FrameUnderflow,

    #[error("division by zero")]
    DivisionByZero,
}

/// Errors that stop the whole VM rather than one context.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("image of {size} bytes exceeds code memory ({limit} bytes)")]
    ImageTooLarge { size: usize, limit: usize },

    #[error("entry address {entry} is outside the {size}-byte image")]
    BadEntry { entry: usize, size: usize },

    #[error("execution step limit exceeded ({0})")]
    StepLimit(u64),

    #[error("cannot write program output: {0}")]
    Output(#[from] std::io::Error),
}
