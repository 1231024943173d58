use std::collections::{HashMap, HashSet};

use thiserror::Error;

/// One lexical scope.
///
/// Block scopes continue the enclosing scope's local-slot counter (nested
/// blocks share a frame); function scopes restart it at 0 and own the
/// negative parameter offsets.
#[derive(Debug, Clone)]
pub struct Scope {
    offsets: HashMap<String, i32>,
    functions: HashSet<String>,
    next_local: i32,
    next_param: i32,
    locals_count: usize,
    function_boundary: bool,
}

impl Scope {
    fn new(next_local: i32, function_boundary: bool) -> Self {
        Scope {
            offsets: HashMap::new(),
            functions: HashSet::new(),
            next_local,
            // slot -1 holds the return address
            next_param: 1,
            locals_count: 0,
            function_boundary,
        }
    }

    /// Number of locals declared directly in this scope.
    pub fn locals_count(&self) -> usize {
        self.locals_count
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SymbolError {
    #[error("variable {0} already declared")]
    Redeclared(String),

    #[error("undeclared variable {0}")]
    Undeclared(String),
}

/// Chain of scopes mapping variable names to frame-relative slot offsets.
///
/// The chain is stored innermost-last. The outermost scope (the script) is
/// itself a function boundary and can never be popped.
#[derive(Debug, Clone)]
pub struct SymbolTable {
    scopes: Vec<Scope>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable {
            scopes: vec![Scope::new(0, true)],
        }
    }

    fn current(&self) -> &Scope {
        // the root scope is never popped
        &self.scopes[self.scopes.len() - 1]
    }

    fn current_mut(&mut self) -> &mut Scope {
        let last = self.scopes.len() - 1;
        &mut self.scopes[last]
    }

    /// Opens a block scope that keeps counting slots from the enclosing one.
    pub fn push_scope(&mut self) {
        let next_local = self.current().next_local;
        self.scopes.push(Scope::new(next_local, false));
    }

    /// Opens a function body scope: slot numbering restarts at 0.
    pub fn push_function_scope(&mut self) {
        self.scopes.push(Scope::new(0, true));
    }

    /// Closes the innermost scope and returns it, so the caller can emit one
    /// discard per local it introduced. Returns `None` for the root scope.
    pub fn pop_scope(&mut self) -> Option<Scope> {
        if self.scopes.len() == 1 {
            return None;
        }
        self.scopes.pop()
    }

    /// How many slots the current scope introduced.
    pub fn locals_count(&self) -> usize {
        self.current().locals_count
    }

    /// Locals live in the current function frame, across nested blocks.
    pub fn frame_locals(&self) -> usize {
        self.current().next_local.max(0) as usize
    }

    pub fn in_function(&self) -> bool {
        self.scopes.len() > 1
            && self
                .scopes
                .iter()
                .skip(1)
                .any(|scope| scope.function_boundary)
    }

    pub fn declare_local(&mut self, name: &str) -> Result<i32, SymbolError> {
        let scope = self.current_mut();
        if scope.offsets.contains_key(name) {
            return Err(SymbolError::Redeclared(name.to_string()));
        }
        let slot = scope.next_local;
        scope.offsets.insert(name.to_string(), slot);
        scope.next_local += 1;
        scope.locals_count += 1;
        Ok(slot)
    }

    /// Reserves an unnamed slot for a value an expression statement left on
    /// the stack, so later locals keep matching their stack positions.
    pub fn declare_temporary(&mut self) -> i32 {
        let scope = self.current_mut();
        let slot = scope.next_local;
        scope.next_local += 1;
        scope.locals_count += 1;
        slot
    }

    /// Parameters live below the frame pointer; the first one declared gets
    /// the offset nearest to it (-2).
    pub fn declare_parameter(&mut self, name: &str) -> Result<i32, SymbolError> {
        let scope = self.current_mut();
        if scope.offsets.contains_key(name) {
            return Err(SymbolError::Redeclared(name.to_string()));
        }
        scope.next_param += 1;
        let slot = -scope.next_param;
        scope.offsets.insert(name.to_string(), slot);
        Ok(slot)
    }

    /// Looks `name` up through enclosing scopes of the current frame.
    pub fn resolve(&self, name: &str) -> Result<i32, SymbolError> {
        for scope in self.scopes.iter().rev() {
            if let Some(&slot) = scope.offsets.get(name) {
                return Ok(slot);
            }
            if scope.function_boundary {
                break;
            }
        }
        Err(SymbolError::Undeclared(name.to_string()))
    }

    pub fn declare_function(&mut self, name: &str) {
        self.current_mut().functions.insert(name.to_string());
    }

    /// Function names are visible through every enclosing scope.
    pub fn function_declared(&self, name: &str) -> bool {
        self.scopes.iter().any(|s| s.functions.contains(name))
    }
}
