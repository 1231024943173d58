//! Cobra: a small imperative language with a single-pass bytecode compiler,
//! a linker and a cooperative multi-context virtual machine.

pub mod bytecode;
pub mod lexer;
pub mod object;
pub mod runtime;
pub mod token;

use bytecode::{CompileError, Compiler, Program};

/// Compiles and links `source` into an executable image.
pub fn compile(source: &str) -> Result<Program, CompileError> {
    Compiler::new(source).compile()
}
