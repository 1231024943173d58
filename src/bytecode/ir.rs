use serde::{Deserialize, Serialize};

use crate::bytecode::buffer::Bytecode;

/// A compiled function: its own buffer, addressed from 0 until linked.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    /// Number of declared parameters.
    pub arity: usize,
    pub bytecode: Bytecode,
    /// Absolute offset in the linked image; assigned by the linker.
    pub entry_address: Option<usize>,
}

impl Function {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arity: 0,
            bytecode: Bytecode::new(),
            entry_address: None,
        }
    }
}

/// What a call placeholder stands for: the callee's name and how many
/// arguments the call site pushed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallTarget {
    pub name: String,
    pub argc: usize,
}

impl CallTarget {
    pub fn new(name: impl Into<String>, argc: usize) -> Self {
        CallTarget {
            name: name.into(),
            argc,
        }
    }
}

/// Name and entry address of a linked function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    pub address: u32,
}

/// A linked, executable image.
///
/// `code` is the concatenation of every function's bytecode with jumps and
/// calls resolved to absolute offsets. Execution starts at `entry_address`,
/// which is where the top-level script was placed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub entry_address: u32,
    pub code: Vec<u8>,
    /// Convention: functions in link order, the script last.
    pub symbols: Vec<Symbol>,
}

impl Program {
    pub fn symbol_at(&self, address: usize) -> Option<&str> {
        self.symbols
            .iter()
            .find(|s| s.address as usize == address)
            .map(|s| s.name.as_str())
    }

    pub fn address_of(&self, name: &str) -> Option<usize> {
        self.symbols
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.address as usize)
    }
}
