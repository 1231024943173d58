pub mod buffer;
pub mod compile;
pub mod compile_error;
pub mod disasm;
pub mod ir;
pub mod link;
pub mod op;
pub mod symbols;

pub use buffer::Bytecode;
pub use compile::Compiler;
pub use compile_error::{CompileError, Diagnostic};
pub use ir::{CallTarget, Function, Program, Symbol};
pub use link::{LinkError, Linker};
pub use op::{Instruction, OpCode};
