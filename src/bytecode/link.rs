use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;

use crate::bytecode::buffer::{Bytecode, BytecodeError};
use crate::bytecode::ir::{CallTarget, Function, Program, Symbol};
use crate::bytecode::op::OpCode;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("call to undeclared function '{name}'")]
    UnresolvedCall { name: String },

    #[error("function '{name}' takes {expected} argument(s) but was called with {found}")]
    ArityMismatch {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("call placeholder {0} was never issued by the compiler")]
    UnknownPlaceholder(i32),

    #[error("entry address {0} does not fit in the image address space")]
    AddressOverflow(usize),

    #[error(transparent)]
    Bytecode(#[from] BytecodeError),
}

/// Stitches per-function buffers into one image.
///
/// Functions are placed in the order given, each one rebased to the offset
/// it lands at; the top-level script goes last. A final pass replaces every
/// call placeholder with the callee's entry address, after checking the call
/// site pushed as many arguments as the callee declares.
pub struct Linker<'a> {
    /// Placeholder `i` stands for the call target `placeholders[i]`.
    placeholders: &'a [CallTarget],
    image: Bytecode,
    /// Entry address and arity by function name.
    entries: HashMap<String, (usize, usize)>,
    symbols: Vec<Symbol>,
}

impl<'a> Linker<'a> {
    pub fn new(placeholders: &'a [CallTarget]) -> Self {
        Linker {
            placeholders,
            image: Bytecode::new(),
            entries: HashMap::new(),
            symbols: Vec::new(),
        }
    }

    fn place(&mut self, function: &mut Function) -> Result<usize, LinkError> {
        let entry = self.image.address();
        let address = u32::try_from(entry).map_err(|_| LinkError::AddressOverflow(entry))?;

        function.bytecode.set_address_offset(entry)?;
        function.entry_address = Some(entry);
        self.image.import(function.bytecode.as_bytes());

        debug!(function = %function.name, entry, size = function.bytecode.count(), "function placed");

        self.entries.insert(function.name.clone(), (entry, function.arity));
        self.symbols.push(Symbol {
            name: function.name.clone(),
            address,
        });
        Ok(entry)
    }

    fn resolve(&self, placeholder: i32) -> Result<i32, LinkError> {
        let target = usize::try_from(placeholder)
            .ok()
            .and_then(|i| self.placeholders.get(i))
            .ok_or(LinkError::UnknownPlaceholder(placeholder))?;

        let &(entry, arity) = self
            .entries
            .get(&target.name)
            .ok_or_else(|| LinkError::UnresolvedCall {
                name: target.name.clone(),
            })?;
        if arity != target.argc {
            return Err(LinkError::ArityMismatch {
                name: target.name.clone(),
                expected: arity,
                found: target.argc,
            });
        }

        i32::try_from(entry).map_err(|_| LinkError::AddressOverflow(entry))
    }

    fn patch_calls(&mut self) -> Result<(), LinkError> {
        let mut cursor = 0;
        while let Some(instr) = self.image.instruction_at(&mut cursor).map_err(BytecodeError::from)? {
            if instr.op != OpCode::Call {
                continue;
            }
            let placeholder = instr.operand.unwrap_or(-1);
            let address = self.resolve(placeholder)?;
            self.image
                .patch_i32(cursor - OpCode::OPERAND_SIZE, address)?;

            debug!(placeholder, address, "call patched");
        }
        Ok(())
    }

    pub fn link(
        mut self,
        functions: &mut [Function],
        script: &mut Function,
    ) -> Result<Program, LinkError> {
        for function in functions.iter_mut() {
            self.place(function)?;
        }
        let entry = self.place(script)?;

        self.patch_calls()?;

        Ok(Program {
            entry_address: entry as u32,
            code: self.image.into_bytes(),
            symbols: self.symbols,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::op::Instruction;

    fn decode_all(code: &[u8]) -> Vec<(usize, Instruction)> {
        Bytecode::from_bytes(code.to_vec())
            .instructions()
            .map(|r| r.unwrap())
            .collect()
    }

    fn function_returning(name: &str, value: i32) -> Function {
        let mut f = Function::new(name);
        f.bytecode.emit_op_arg(OpCode::Push, value);
        f.bytecode.emit_op(OpCode::Return);
        f
    }

    #[test]
    fn test_script_is_placed_last() {
        let mut functions = vec![function_returning("one", 1)];
        let mut script = Function::new("script");
        script.bytecode.emit_op(OpCode::Halt);

        let placeholders = Vec::new();
        let program = Linker::new(&placeholders)
            .link(&mut functions, &mut script)
            .unwrap();

        assert_eq!(functions[0].entry_address, Some(0));
        assert_eq!(program.entry_address, 6);
        assert_eq!(program.code.len(), 7);
        assert_eq!(program.symbol_at(6), Some("script"));
    }

    #[test]
    fn test_internal_jumps_are_rebased() {
        let mut functions = vec![function_returning("pad", 0)];

        let mut script = Function::new("script");
        let jump = script.bytecode.emit_jump();
        script.bytecode.emit_op(OpCode::Pop);
        script.bytecode.patch_jump(jump).unwrap();
        script.bytecode.emit_op(OpCode::Halt);

        let placeholders = Vec::new();
        let program = Linker::new(&placeholders)
            .link(&mut functions, &mut script)
            .unwrap();

        let instrs = decode_all(&program.code);
        // JUMP at 6 skips the POP at 11 and lands on HALT at 12
        assert_eq!(instrs[2], (6, Instruction::with_operand(OpCode::Jump, 12)));
        assert_eq!(instrs[4], (12, Instruction::new(OpCode::Halt)));
    }

    #[test]
    fn test_calls_resolve_to_entry_addresses() {
        let mut functions = vec![function_returning("a", 1), function_returning("b", 2)];

        let mut script = Function::new("script");
        script.bytecode.emit_op_arg(OpCode::Call, 1);
        script.bytecode.emit_op_arg(OpCode::Call, 0);
        script.bytecode.emit_op(OpCode::Halt);

        let placeholders = vec![CallTarget::new("a", 0), CallTarget::new("b", 0)];
        let program = Linker::new(&placeholders)
            .link(&mut functions, &mut script)
            .unwrap();

        let calls: Vec<i32> = decode_all(&program.code)
            .into_iter()
            .filter(|(_, i)| i.op == OpCode::Call)
            .filter_map(|(_, i)| i.operand)
            .collect();
        assert_eq!(calls, vec![6, 0]);
    }

    #[test]
    fn test_unresolved_call_is_fatal() {
        let mut script = Function::new("script");
        script.bytecode.emit_op_arg(OpCode::Call, 0);

        let placeholders = vec![CallTarget::new("missing", 0)];
        let err = Linker::new(&placeholders)
            .link(&mut [], &mut script)
            .unwrap_err();

        assert_eq!(
            err,
            LinkError::UnresolvedCall {
                name: "missing".to_string()
            }
        );
    }

    #[test]
    fn test_argument_count_must_match_arity() {
        let mut functions = vec![function_returning("pair", 0)];
        functions[0].arity = 2;

        let mut script = Function::new("script");
        script.bytecode.emit_op_arg(OpCode::Push, 1);
        script.bytecode.emit_op_arg(OpCode::Call, 0);
        script.bytecode.emit_op(OpCode::Halt);

        let placeholders = vec![CallTarget::new("pair", 1)];
        let err = Linker::new(&placeholders)
            .link(&mut functions, &mut script)
            .unwrap_err();

        assert_eq!(
            err,
            LinkError::ArityMismatch {
                name: "pair".to_string(),
                expected: 2,
                found: 1,
            }
        );
    }

    #[test]
    fn test_unknown_placeholder() {
        let mut script = Function::new("script");
        script.bytecode.emit_op_arg(OpCode::Call, 7);

        let placeholders = Vec::new();
        let err = Linker::new(&placeholders)
            .link(&mut [], &mut script)
            .unwrap_err();
        assert_eq!(err, LinkError::UnknownPlaceholder(7));
    }
}
