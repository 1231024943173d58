use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Write};

use tracing::{info, trace, warn};

use crate::bytecode::ir::Program;
use crate::runtime::context::{ContextState, Effect, ExecutionContext};
use crate::runtime::runtime_error::{RuntimeFault, VmError};

#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Operand stack size of each context, in words.
    pub stack_size: usize,
    /// Maximum call depth of each context.
    pub frame_limit: usize,
    /// Largest code image `load` accepts, in bytes.
    pub code_size: usize,
    /// Size of the context pool.
    pub max_contexts: usize,
    /// Total instructions executed across all contexts before `run` gives up.
    pub max_steps: Option<u64>,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            stack_size: 3072,
            frame_limit: 3072,
            code_size: 3072,
            max_contexts: 10,
            max_steps: None,
        }
    }
}

/// Final state of one context after a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextReport {
    pub id: usize,
    pub state: ContextState,
    pub op_count: u64,
    pub fault: Option<RuntimeFault>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Every context that was ever activated, by id.
    pub contexts: Vec<ContextReport>,
}

impl RunReport {
    pub fn total_ops(&self) -> u64 {
        self.contexts.iter().map(|c| c.op_count).sum()
    }

    pub fn faults(&self) -> impl Iterator<Item = (usize, &RuntimeFault)> {
        self.contexts
            .iter()
            .filter_map(|c| c.fault.as_ref().map(|f| (c.id, f)))
    }

    pub fn context(&self, id: usize) -> Option<&ContextReport> {
        self.contexts.iter().find(|c| c.id == id)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in &self.contexts {
            write!(f, "context {}: {} after {} instructions", c.id, c.state, c.op_count)?;
            if let Some(fault) = &c.fault {
                write!(f, " ({})", fault)?;
            }
            writeln!(f)?;
        }
        write!(f, "total: {} instructions", self.total_ops())
    }
}

/// Why the current instruction stopped short.
enum Interrupt {
    Fault(RuntimeFault),
    Output(io::Error),
}

impl From<RuntimeFault> for Interrupt {
    fn from(fault: RuntimeFault) -> Self {
        Interrupt::Fault(fault)
    }
}

/// Cooperative multi-context virtual machine.
///
/// Contexts live in a fixed pool and are identified by pool index + 1. The
/// front of `ready` is the current context; each `step` runs exactly one of
/// its instructions and then rotates it to the back.
pub struct Vm<W: Write = io::Stdout> {
    config: VmConfig,
    contexts: Vec<ExecutionContext>,
    ready: VecDeque<usize>,
    steps: u64,
    output: W,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        Self::with_output(config, io::stdout())
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Write> Vm<W> {
    pub fn with_output(config: VmConfig, output: W) -> Self {
        Vm {
            config,
            contexts: Vec::new(),
            ready: VecDeque::new(),
            steps: 0,
            output,
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn output(&self) -> &W {
        &self.output
    }

    pub fn into_output(self) -> W {
        self.output
    }

    /// Context by id (pool index + 1).
    pub fn context(&self, id: usize) -> Option<&ExecutionContext> {
        id.checked_sub(1).and_then(|index| self.contexts.get(index))
    }

    /// Instructions executed since the last `load`.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Resets the pool and starts context 1 at the program's entry address.
    pub fn load(&mut self, program: &Program) -> Result<(), VmError> {
        let size = program.code.len();
        if size > self.config.code_size {
            return Err(VmError::ImageTooLarge {
                size,
                limit: self.config.code_size,
            });
        }
        let entry = program.entry_address as usize;
        if entry >= size {
            return Err(VmError::BadEntry { entry, size });
        }

        self.contexts = (1..=self.config.max_contexts.max(1))
            .map(ExecutionContext::unused)
            .collect();
        self.contexts[0].start(program.code.clone(), entry, self.config.stack_size);
        self.ready = VecDeque::from([0]);
        self.steps = 0;

        info!(context = 1, entry, size, "context spawned");
        Ok(())
    }

    /// Loads `program` and runs it to completion.
    pub fn run_program(&mut self, program: &Program) -> Result<RunReport, VmError> {
        self.load(program)?;
        self.run()
    }

    /// Runs until no context is Running.
    pub fn run(&mut self) -> Result<RunReport, VmError> {
        while self.step()? {}

        let report = self.report();
        info!(
            contexts = report.contexts.len(),
            instructions = report.total_ops(),
            "run finished"
        );
        Ok(report)
    }

    /// Executes one instruction of the current context and advances the
    /// scheduler. Returns `false` once nothing is left to run.
    pub fn step(&mut self) -> Result<bool, VmError> {
        let Some(&current) = self.ready.front() else {
            return Ok(false);
        };
        if let Some(limit) = self.config.max_steps
            && self.steps >= limit
        {
            return Err(VmError::StepLimit(limit));
        }
        self.steps += 1;

        match self.execute_one(current) {
            Ok(()) => {}
            Err(Interrupt::Fault(fault)) => {
                let ctx = &mut self.contexts[current];
                warn!(context = ctx.id(), ip = ctx.ip(), %fault, "context faulted");
                ctx.fail(fault);
            }
            Err(Interrupt::Output(e)) => return Err(VmError::Output(e)),
        }

        // a context that killed itself has already left the queue
        if self.ready.front() == Some(&current) {
            self.ready.pop_front();
            let ctx = &self.contexts[current];
            match ctx.state() {
                ContextState::Running => self.ready.push_back(current),
                ContextState::Exited => {
                    info!(context = ctx.id(), ops = ctx.op_count(), "context exited")
                }
                _ => {}
            }
        }
        Ok(true)
    }

    fn execute_one(&mut self, index: usize) -> Result<(), Interrupt> {
        let frame_limit = self.config.frame_limit;
        let ctx = &mut self.contexts[index];
        let ip = ctx.ip();
        let instr = ctx.fetch()?;
        trace!(context = ctx.id(), ip, %instr);

        match ctx.execute(instr, frame_limit)? {
            Effect::None => {}
            Effect::Print(value) => writeln!(self.output, "{}", value).map_err(Interrupt::Output)?,
            Effect::Fork => self.fork(index)?,
            Effect::Kill(id) => self.kill(index, id)?,
        }
        Ok(())
    }

    /// First never-used slot, otherwise the first dead one.
    fn free_slot(&self) -> Option<usize> {
        self.contexts
            .iter()
            .position(|c| c.state() == ContextState::Unused)
            .or_else(|| self.contexts.iter().position(|c| c.state().is_free()))
    }

    fn fork(&mut self, parent: usize) -> Result<(), RuntimeFault> {
        let Some(child) = self.free_slot() else {
            warn!(context = parent + 1, "context pool exhausted");
            return self.contexts[parent].push(-1);
        };

        let (parent_ctx, child_ctx) = pair_mut(&mut self.contexts, parent, child);
        child_ctx.fork_from(parent_ctx);
        if let Err(fault) = parent_ctx.push(child_ctx.id() as i32) {
            child_ctx.kill();
            return Err(fault);
        }
        child_ctx.push(0)?;

        self.ready.insert(1, child);
        info!(parent = parent + 1, context = child + 1, "context spawned");
        Ok(())
    }

    fn kill(&mut self, current: usize, target_id: i32) -> Result<(), RuntimeFault> {
        let target = usize::try_from(target_id)
            .ok()
            .and_then(|id| id.checked_sub(1))
            .filter(|&index| index < self.contexts.len());

        let killed = match target {
            Some(index) if self.contexts[index].is_running() => {
                self.contexts[index].kill();
                self.ready.retain(|&r| r != index);
                info!(by = current + 1, context = index + 1, "context killed");
                true
            }
            _ => false,
        };

        if target == Some(current) {
            return Ok(());
        }
        self.contexts[current].push(killed as i32)
    }

    fn report(&self) -> RunReport {
        let contexts = self
            .contexts
            .iter()
            .filter(|c| c.state() != ContextState::Unused)
            .map(|c| ContextReport {
                id: c.id(),
                state: c.state(),
                op_count: c.op_count(),
                fault: c.fault().cloned(),
            })
            .collect();
        RunReport { contexts }
    }
}

fn pair_mut<T>(items: &mut [T], a: usize, b: usize) -> (&mut T, &mut T) {
    if a < b {
        let (left, right) = items.split_at_mut(b);
        (&mut left[a], &mut right[0])
    } else {
        let (left, right) = items.split_at_mut(a);
        (&mut right[0], &mut left[b])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::buffer::Bytecode;
    use crate::bytecode::compile::Compiler;
    use crate::bytecode::ir::Symbol;
    use crate::bytecode::op::OpCode;

    // ============================================================
    // Test helpers
    // ============================================================

    fn image(code: Bytecode) -> Program {
        Program {
            entry_address: 0,
            code: code.into_bytes(),
            symbols: vec![Symbol {
                name: "script".to_string(),
                address: 0,
            }],
        }
    }

    fn vm_with(config: VmConfig) -> Vm<Vec<u8>> {
        Vm::with_output(config, Vec::new())
    }

    fn run_program(program: &Program) -> (Vm<Vec<u8>>, RunReport) {
        let mut vm = vm_with(VmConfig {
            max_steps: Some(100_000),
            ..VmConfig::default()
        });
        let report = vm.run_program(program).unwrap();
        (vm, report)
    }

    fn run_source(source: &str) -> (Vm<Vec<u8>>, RunReport) {
        run_program(&Compiler::new(source).compile().unwrap())
    }

    fn stack_of(vm: &Vm<Vec<u8>>, id: usize) -> Vec<i32> {
        vm.context(id).unwrap().stack().to_vec()
    }

    fn printed(vm: Vm<Vec<u8>>) -> String {
        String::from_utf8(vm.into_output()).unwrap()
    }

    // ============================================================
    // Loading
    // ============================================================

    #[test]
    fn test_image_too_large() {
        let mut code = Bytecode::new();
        for _ in 0..10 {
            code.emit_op(OpCode::Halt);
        }
        let mut vm = vm_with(VmConfig {
            code_size: 4,
            ..VmConfig::default()
        });
        assert!(matches!(
            vm.load(&image(code)),
            Err(VmError::ImageTooLarge { size: 10, limit: 4 })
        ));
    }

    #[test]
    fn test_entry_outside_image() {
        let mut program = image(Bytecode::new());
        program.code.push(OpCode::Halt as u8);
        program.entry_address = 1;
        assert!(matches!(
            vm_with(VmConfig::default()).load(&program),
            Err(VmError::BadEntry { entry: 1, size: 1 })
        ));
    }

    #[test]
    fn test_starts_at_entry_address() {
        let program = Compiler::new("func f() { return 9; } print(f());").compile().unwrap();
        assert_ne!(program.entry_address, 0);

        let (vm, report) = run_source("func f() { return 9; } print(f());");
        assert_eq!(printed(vm), "9\n");
        assert_eq!(report.context(1).unwrap().state, ContextState::Exited);
    }

    // ============================================================
    // Single context
    // ============================================================

    #[test]
    fn test_precedence_result_on_stack() {
        let (vm, _) = run_source("2 + 3 * 4;");
        assert_eq!(stack_of(&vm, 1), vec![14]);

        let (vm, _) = run_source("(2 + 3) * 4;");
        assert_eq!(stack_of(&vm, 1), vec![20]);
    }

    #[test]
    fn test_print_writes_to_output() {
        let (vm, _) = run_source("x = 3; while (x > 0) { print(x); x -= 1; }");
        assert_eq!(printed(vm), "3\n2\n1\n");
    }

    #[test]
    fn test_recursion() {
        let (vm, _) = run_source(
            "func fact(n) { if (n < 2) { return 1; } return n * fact(n - 1); } print(fact(6));",
        );
        assert_eq!(printed(vm), "720\n");
    }

    #[test]
    fn test_fault_kills_context_and_is_reported() {
        let mut code = Bytecode::new();
        code.emit_op_arg(OpCode::Push, 1);
        code.emit_op_arg(OpCode::Store, -5);
        code.emit_op(OpCode::Halt);

        let (vm, report) = run_program(&image(code));
        let ctx = vm.context(1).unwrap();
        assert_eq!(ctx.state(), ContextState::Killed);
        assert_eq!(
            ctx.fault(),
            Some(&RuntimeFault::SlotOutOfBounds { fp: 0, slot: -5 })
        );
        assert_eq!(report.faults().count(), 1);
    }

    #[test]
    fn test_step_limit() {
        let mut vm = vm_with(VmConfig {
            max_steps: Some(50),
            ..VmConfig::default()
        });
        let program = Compiler::new("while (1) { }").compile().unwrap();
        assert!(matches!(
            vm.run_program(&program),
            Err(VmError::StepLimit(50))
        ));
        assert_eq!(vm.steps(), 50);
    }

    #[test]
    fn test_step_on_empty_vm() {
        let mut vm = vm_with(VmConfig::default());
        assert!(!vm.step().unwrap());
    }

    // ============================================================
    // Fork and kill
    // ============================================================

    #[test]
    fn test_fork_returns_ids() {
        let mut code = Bytecode::new();
        code.emit_op(OpCode::Fork);
        code.emit_op(OpCode::Halt);

        let (vm, report) = run_program(&image(code));
        assert_eq!(stack_of(&vm, 1), vec![2]);
        assert_eq!(stack_of(&vm, 2), vec![0]);
        assert_eq!(report.contexts.len(), 2);
        assert!(report.contexts.iter().all(|c| c.state == ContextState::Exited));
    }

    #[test]
    fn test_child_runs_before_parent_resumes() {
        let (vm, _) = run_source("pid = fork(); if (pid == 0) { print(1); } else { print(2); }");
        // the child is scheduled ahead of its parent
        assert_eq!(printed(vm), "1\n2\n");
    }

    #[test]
    fn test_each_side_increments_its_own_counter() {
        let (vm, _) = run_source(
            "a = 0; b = 0; pid = fork(); if (pid == 0) { b += 1; } else { a += 1; }",
        );
        assert_eq!(&stack_of(&vm, 1)[..3], &[1, 0, 2]);
        assert_eq!(&stack_of(&vm, 2)[..3], &[0, 1, 0]);
    }

    #[test]
    fn test_pool_exhaustion_pushes_failure() {
        let mut code = Bytecode::new();
        code.emit_op(OpCode::Fork);
        code.emit_op(OpCode::Halt);

        let mut vm = vm_with(VmConfig {
            max_contexts: 1,
            ..VmConfig::default()
        });
        vm.run_program(&image(code)).unwrap();
        assert_eq!(stack_of(&vm, 1), vec![-1]);
    }

    #[test]
    fn test_kill_before_child_runs() {
        let (vm, report) = run_source(
            "b = 0; r = 0; pid = fork(); if (pid == 0) { b += 1; } else { r = kill(pid); }",
        );
        // both branches need six instructions to reach STORE/KILL; the kill lands first
        assert_eq!(report.context(2).unwrap().state, ContextState::Killed);
        assert_eq!(stack_of(&vm, 2)[0], 0);
        assert_eq!(stack_of(&vm, 1), vec![0, 1, 2]);
    }

    #[test]
    fn test_context_can_kill_itself() {
        let mut code = Bytecode::new();
        code.emit_op_arg(OpCode::Push, 1);
        code.emit_op(OpCode::Kill);
        code.emit_op(OpCode::Fork);
        code.emit_op(OpCode::Halt);

        // context 1 kills itself before forking
        let (vm, report) = run_program(&image(code));
        assert_eq!(report.contexts.len(), 1);
        assert_eq!(vm.context(1).unwrap().state(), ContextState::Killed);
        assert_eq!(stack_of(&vm, 1), Vec::<i32>::new());
    }

    #[test]
    fn test_kill_unknown_or_dead_id_returns_zero() {
        let mut code = Bytecode::new();
        code.emit_op_arg(OpCode::Push, 7);
        code.emit_op(OpCode::Kill);
        code.emit_op_arg(OpCode::Push, -3);
        code.emit_op(OpCode::Kill);
        code.emit_op(OpCode::Halt);

        let (vm, _) = run_program(&image(code));
        assert_eq!(stack_of(&vm, 1), vec![0, 0]);
    }

    #[test]
    fn test_kill_exited_context_fails() {
        let (vm, report) = run_source(
            "pid = fork(); if (pid == 0) { halt; } else { x = 0; while (x < 20) { x += 1; } print(kill(pid)); }",
        );
        assert_eq!(printed(vm), "0\n");
        assert_eq!(report.context(2).unwrap().state, ContextState::Exited);
    }

    #[test]
    fn test_fault_in_one_context_leaves_others_running() {
        let (vm, report) = run_source(
            "pid = fork(); if (pid == 0) { x = 1 / 0; } else { print(5); }",
        );
        assert_eq!(printed(vm), "5\n");
        assert_eq!(report.context(1).unwrap().state, ContextState::Exited);
        let child = report.context(2).unwrap();
        assert_eq!(child.state, ContextState::Killed);
        assert_eq!(child.fault, Some(RuntimeFault::DivisionByZero));
    }

    #[test]
    fn test_report_display() {
        let (_, report) = run_source("x = 1;");
        let text = report.to_string();
        assert!(text.starts_with("context 1: exited after 2 instructions"));
        assert!(text.ends_with("total: 2 instructions"));
    }
}
