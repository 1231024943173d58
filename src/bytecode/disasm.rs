use std::collections::HashSet;
use std::fmt::Write;

use crate::bytecode::buffer::Bytecode;
use crate::bytecode::ir::Program;
use crate::bytecode::op::{DecodeError, Instruction, OpCode};

/// Print disassembly of a linked program
pub fn print_program(program: &Program) {
    match disassemble(program) {
        Ok(text) => print!("{}", text),
        Err(e) => eprintln!("disassembly stopped: {}", e),
    }
}

/// Return disassembly of a linked program as a String.
///
/// Each function starts with a banner taken from the symbol table, jump
/// targets are marked with `►`, and call operands are annotated with the
/// callee's name.
pub fn disassemble(program: &Program) -> Result<String, DecodeError> {
    let code = Bytecode::from_bytes(program.code.clone());
    let decoded: Vec<(usize, Instruction)> = code.instructions().collect::<Result<_, _>>()?;
    let jump_targets = collect_jump_targets(&decoded);

    let mut output = String::new();
    let _ = writeln!(output, "=== BYTECODE PROGRAM ===");
    let _ = writeln!(
        output,
        "{} bytes, entry {:04}",
        program.code.len(),
        program.entry_address
    );
    output.push('\n');

    for (ip, instr) in &decoded {
        if let Some(name) = program.symbol_at(*ip) {
            if *ip > 0 {
                output.push('\n');
            }
            let _ = writeln!(output, "════════════════════════════════════════");
            let _ = writeln!(output, " {}", name);
            let _ = writeln!(output, "════════════════════════════════════════");
        }

        let is_target = jump_targets.contains(ip);
        if is_target {
            let _ = writeln!(output, "      ┌──────────────────────────────────");
        }

        let marker = if is_target { "► " } else { "  " };
        let _ = writeln!(
            output,
            "{:04} {}{}",
            ip,
            marker,
            format_instruction(program, *ip, instr)
        );
    }

    Ok(output)
}

fn collect_jump_targets(decoded: &[(usize, Instruction)]) -> HashSet<usize> {
    decoded
        .iter()
        .filter(|(_, instr)| instr.op.is_jump())
        .filter_map(|(_, instr)| instr.operand)
        .filter_map(|target| usize::try_from(target).ok())
        .collect()
}

fn format_instruction(program: &Program, ip: usize, instr: &Instruction) -> String {
    let Some(operand) = instr.operand else {
        return instr.op.name().to_string();
    };

    match instr.op {
        OpCode::Jump | OpCode::JumpIfFalse => {
            let direction = if (operand as i64) <= ip as i64 { "↑" } else { "↓" };
            format!("{:<11} {:04} {}", instr.op.name(), operand, direction)
        }
        OpCode::Call => {
            let callee = usize::try_from(operand)
                .ok()
                .and_then(|addr| program.symbol_at(addr))
                .unwrap_or("?");
            format!("{:<11} {:04} <{}>", instr.op.name(), operand, callee)
        }
        _ => format!("{:<11} {}", instr.op.name(), operand),
    }
}
