use std::collections::HashMap;

use tracing::debug;

use crate::{
    bytecode::{
        buffer::BytecodeError,
        compile_error::{CompileError, Diagnostic},
        ir::{CallTarget, Function, Program},
        link::Linker,
        op::OpCode,
        symbols::SymbolTable,
    },
    lexer::Lexer,
    token::{Literal, Token, TokenKind},
};

/// Name the top-level code is linked under.
pub const SCRIPT: &str = "script";

/// Deepest nesting of expressions and statements the parser recurses into.
pub const MAX_NESTING: usize = 256;

/// Binding strength, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Logical,
    Comparison,
    /// `+ -`
    Term,
    /// `* / %`
    Factor,
    Unary,
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Logical,
            Precedence::Logical => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary | Precedence::Primary => Precedence::Primary,
        }
    }
}

type Emit = Result<(), BytecodeError>;
type ParseFn = fn(&mut Compiler, bool) -> Emit;

struct ParseRule {
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
}

impl ParseRule {
    const fn new(prefix: Option<ParseFn>, infix: Option<ParseFn>, precedence: Precedence) -> Self {
        ParseRule {
            prefix,
            infix,
            precedence,
        }
    }
}

fn rule(kind: TokenKind) -> ParseRule {
    use TokenKind::*;

    match kind {
        LParen => ParseRule::new(Some(Compiler::grouping), None, Precedence::None),
        Minus => ParseRule::new(Some(Compiler::unary), Some(Compiler::binary), Precedence::Term),
        Plus => ParseRule::new(None, Some(Compiler::binary), Precedence::Term),
        Star | Slash | Percent => ParseRule::new(None, Some(Compiler::binary), Precedence::Factor),
        Bang => ParseRule::new(Some(Compiler::unary), None, Precedence::None),
        EqualEqual | BangEqual | Gt | GtEqual | Lt | LtEqual => {
            ParseRule::new(None, Some(Compiler::binary), Precedence::Comparison)
        }
        And | Or => ParseRule::new(None, Some(Compiler::binary), Precedence::Logical),
        Int | Float => ParseRule::new(Some(Compiler::number), None, Precedence::None),
        Identifier => ParseRule::new(Some(Compiler::variable), None, Precedence::None),
        Fork => ParseRule::new(Some(Compiler::fork), None, Precedence::None),
        Kill => ParseRule::new(Some(Compiler::kill), None, Precedence::None),
        _ => ParseRule::new(None, None, Precedence::None),
    }
}

fn binary_op(kind: TokenKind) -> Option<OpCode> {
    let op = match kind {
        TokenKind::Plus | TokenKind::PlusEqual => OpCode::Add,
        TokenKind::Minus | TokenKind::MinusEqual => OpCode::Sub,
        TokenKind::Star | TokenKind::StarEqual => OpCode::Mul,
        TokenKind::Slash | TokenKind::SlashEqual => OpCode::Div,
        TokenKind::Percent | TokenKind::PercentEqual => OpCode::Mod,
        TokenKind::EqualEqual => OpCode::Eq,
        TokenKind::BangEqual => OpCode::Ne,
        TokenKind::Gt => OpCode::Gt,
        TokenKind::Lt => OpCode::Lt,
        TokenKind::GtEqual => OpCode::Ge,
        TokenKind::LtEqual => OpCode::Le,
        TokenKind::And => OpCode::And,
        TokenKind::Or => OpCode::Or,
        _ => return None,
    };
    Some(op)
}

/// Everything the single pass produced, before linking.
#[derive(Debug, Clone)]
pub struct CompiledUnit {
    /// Functions in declaration order.
    pub functions: Vec<Function>,
    pub script: Function,
    /// Call placeholder `i` refers to the call target `placeholders[i]`.
    pub placeholders: Vec<CallTarget>,
}

impl CompiledUnit {
    pub fn link(mut self) -> Result<Program, CompileError> {
        let program = Linker::new(&self.placeholders).link(&mut self.functions, &mut self.script)?;
        Ok(program)
    }
}

/// Single-pass compiler: parses Cobra source with precedence climbing and
/// emits bytecode as it goes.
///
/// Each `func` gets its own [`Function`] buffer; the top-level statements go
/// into the script function. Calls carry placeholders that the linker
/// replaces with entry addresses.
pub struct Compiler {
    lexer: Lexer,
    current: Token,
    previous: Token,

    symbols: SymbolTable,

    /// Function whose body is being emitted.
    function: Function,
    functions: Vec<Function>,

    placeholders: Vec<CallTarget>,
    placeholder_ids: HashMap<CallTarget, i32>,

    diagnostics: Vec<Diagnostic>,
    panic_mode: bool,

    /// Set when the statement expression just parsed was an assignment.
    assigned: bool,
    /// Set while parsing a `for` update clause, which runs every iteration
    /// and so must not declare anything.
    loop_update: bool,
    /// Current recursion depth of the parser.
    depth: usize,
}

impl Compiler {
    pub fn new(source: &str) -> Self {
        Compiler {
            lexer: Lexer::new(source),
            current: Token::empty(),
            previous: Token::empty(),
            symbols: SymbolTable::new(),
            function: Function::new(SCRIPT),
            functions: Vec::new(),
            placeholders: Vec::new(),
            placeholder_ids: HashMap::new(),
            diagnostics: Vec::new(),
            panic_mode: false,
            assigned: false,
            loop_update: false,
            depth: 0,
        }
    }

    /// Compiles and links.
    pub fn compile(self) -> Result<Program, CompileError> {
        self.compile_unit()?.link()
    }

    /// Compiles without linking. Fails if any diagnostic was reported.
    pub fn compile_unit(mut self) -> Result<CompiledUnit, CompileError> {
        self.advance();
        while !self.matches(TokenKind::Eof) {
            self.declaration()?;
        }
        self.emit(OpCode::Halt);

        if self.lexer.had_error() || !self.diagnostics.is_empty() {
            return Err(CompileError::Diagnostics(self.diagnostics));
        }

        debug!(
            functions = self.functions.len(),
            script_size = self.function.bytecode.count(),
            "compiled"
        );

        Ok(CompiledUnit {
            functions: self.functions,
            script: self.function,
            placeholders: self.placeholders,
        })
    }

    // =========================================================================
    // Token plumbing
    // =========================================================================

    fn advance(&mut self) {
        self.previous = std::mem::replace(&mut self.current, Token::empty());
        loop {
            self.current = self.lexer.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme.clone();
            self.error_at_current(message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.check(kind) {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn report(&mut self, token: &Token, message: String) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        let line = self.lexer.line_text(token.line_start);
        self.diagnostics.push(Diagnostic::at(token, line, message));
    }

    fn error(&mut self, message: impl Into<String>) {
        let token = self.previous.clone();
        self.report(&token, message.into());
    }

    fn error_at_current(&mut self, message: impl Into<String>) {
        let token = self.current.clone();
        self.report(&token, message.into());
    }

    /// Runs `parse` one level deeper, or reports `message` and skips the
    /// nested construct if that would exceed [`MAX_NESTING`].
    fn nested(&mut self, message: &str, parse: impl FnOnce(&mut Self) -> Emit) -> Emit {
        if self.depth >= MAX_NESTING {
            self.error_at_current(message);
            self.skip_nested();
            return Ok(());
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    /// Skips tokens up to the `;` or closing bracket that ends the construct
    /// starting at the current token. Brackets opened on the way are matched.
    fn skip_nested(&mut self) {
        let mut open = 0usize;
        loop {
            match self.current.kind {
                TokenKind::Eof => return,
                TokenKind::LParen | TokenKind::LBrace => open += 1,
                TokenKind::RParen | TokenKind::RBrace | TokenKind::Semicolon if open == 0 => return,
                TokenKind::RParen | TokenKind::RBrace => open -= 1,
                _ => {}
            }
            self.advance();
        }
    }

    /// Skips to a likely statement boundary after an error.
    fn synchronize(&mut self) {
        self.panic_mode = false;

        while !self.check(TokenKind::Eof) {
            if matches!(self.previous.kind, TokenKind::Semicolon | TokenKind::RBrace) {
                return;
            }
            if self.current.kind.starts_statement() || self.check(TokenKind::RBrace) {
                return;
            }
            self.advance();
        }
    }

    // =========================================================================
    // Emission helpers
    // =========================================================================

    fn emit(&mut self, op: OpCode) {
        self.function.bytecode.emit_op(op);
    }

    fn emit_arg(&mut self, op: OpCode, arg: i32) {
        self.function.bytecode.emit_op_arg(op, arg);
    }

    fn emit_pops(&mut self, count: usize) {
        for _ in 0..count {
            self.emit(OpCode::Pop);
        }
    }

    fn address(&self) -> usize {
        self.function.bytecode.address()
    }

    /// One placeholder per distinct callee and argument count.
    fn placeholder_for(&mut self, name: &str, argc: usize) -> i32 {
        let target = CallTarget::new(name, argc);
        if let Some(&id) = self.placeholder_ids.get(&target) {
            return id;
        }
        let id = self.placeholders.len() as i32;
        self.placeholders.push(target.clone());
        self.placeholder_ids.insert(target, id);
        id
    }

    fn begin_scope(&mut self) {
        self.symbols.push_scope();
    }

    fn end_scope(&mut self) {
        if let Some(scope) = self.symbols.pop_scope() {
            self.emit_pops(scope.locals_count());
        }
    }

    // =========================================================================
    // Statements
    // =========================================================================

    fn declaration(&mut self) -> Emit {
        if self.matches(TokenKind::Func) {
            self.nested("function nested too deeply", Self::function_declaration)?;
        } else {
            self.statement()?;
        }

        if self.panic_mode {
            self.synchronize();
        }
        Ok(())
    }

    fn statement(&mut self) -> Emit {
        self.nested("statement nested too deeply", Self::unnested_statement)
    }

    fn unnested_statement(&mut self) -> Emit {
        if self.matches(TokenKind::If) {
            self.if_statement()
        } else if self.matches(TokenKind::While) {
            self.while_statement()
        } else if self.matches(TokenKind::For) {
            self.for_statement()
        } else if self.matches(TokenKind::Return) {
            self.return_statement()
        } else if self.matches(TokenKind::Print) {
            self.print_statement()
        } else if self.matches(TokenKind::Halt) {
            self.emit(OpCode::Halt);
            self.matches(TokenKind::Semicolon);
            Ok(())
        } else if self.matches(TokenKind::LBrace) {
            self.begin_scope();
            self.block()?;
            self.end_scope();
            Ok(())
        } else {
            self.expression_statement()
        }
    }

    /// Branch and loop bodies get their own scope so whatever they declare is
    /// discarded before control leaves them.
    fn scoped_statement(&mut self) -> Emit {
        self.begin_scope();
        self.statement()?;
        self.end_scope();
        Ok(())
    }

    fn block(&mut self) -> Emit {
        while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
            self.declaration()?;
        }
        self.consume(TokenKind::RBrace, "expected '}' after block");
        Ok(())
    }

    /// Parses an expression in statement position. Returns true if it left a
    /// value on the stack (assignments don't).
    fn statement_expression(&mut self) -> Result<bool, BytecodeError> {
        self.assigned = false;
        self.parse_precedence(Precedence::Assignment)?;
        Ok(!self.assigned)
    }

    fn expression_statement(&mut self) -> Emit {
        if self.statement_expression()? {
            self.symbols.declare_temporary();
        }
        self.matches(TokenKind::Semicolon);
        Ok(())
    }

    fn print_statement(&mut self) -> Emit {
        self.consume(TokenKind::LParen, "expected '(' after 'print'");
        self.expression()?;
        self.consume(TokenKind::RParen, "expected ')' after value");
        self.emit(OpCode::Print);
        self.matches(TokenKind::Semicolon);
        Ok(())
    }

    fn if_statement(&mut self) -> Emit {
        self.consume(TokenKind::LParen, "expected '(' after 'if'");
        self.expression()?;
        self.consume(TokenKind::RParen, "expected ')' after condition");

        let else_jump = self.function.bytecode.emit_jump_false();
        self.scoped_statement()?;
        let end_jump = self.function.bytecode.emit_jump();

        self.function.bytecode.patch_jump(else_jump)?;
        if self.matches(TokenKind::Else) {
            self.scoped_statement()?;
        }
        self.function.bytecode.patch_jump(end_jump)
    }

    fn while_statement(&mut self) -> Emit {
        let loop_start = self.address();

        self.consume(TokenKind::LParen, "expected '(' after 'while'");
        self.expression()?;
        self.consume(TokenKind::RParen, "expected ')' after condition");

        let exit_jump = self.function.bytecode.emit_jump_false();
        self.scoped_statement()?;
        self.function.bytecode.emit_jump_to(loop_start)?;

        self.function.bytecode.patch_jump(exit_jump)
    }

    /// ```text
    ///         <init>
    /// cond:   <cond>
    ///         JMPF exit
    ///         JMP  body
    /// update: <update>
    ///         JMP  cond
    /// body:   <body>
    ///         JMP  update
    /// exit:
    /// ```
    fn for_statement(&mut self) -> Emit {
        self.consume(TokenKind::LParen, "expected '(' after 'for'");

        if !self.matches(TokenKind::Semicolon) {
            if self.statement_expression()? {
                self.symbols.declare_temporary();
            }
            self.consume(TokenKind::Semicolon, "expected ';' after loop initializer");
        }

        let condition = self.address();
        if self.check(TokenKind::Semicolon) {
            self.emit_arg(OpCode::Push, 1);
        } else {
            self.expression()?;
        }
        self.consume(TokenKind::Semicolon, "expected ';' after loop condition");

        let exit_jump = self.function.bytecode.emit_jump_false();
        let body_jump = self.function.bytecode.emit_jump();

        let update = self.address();
        if !self.check(TokenKind::RParen) {
            self.loop_update = true;
            let leaves_value = self.statement_expression();
            self.loop_update = false;
            if leaves_value? {
                self.emit(OpCode::Pop);
            }
        }
        self.consume(TokenKind::RParen, "expected ')' after for clauses");
        self.function.bytecode.emit_jump_to(condition)?;

        self.function.bytecode.patch_jump(body_jump)?;
        self.scoped_statement()?;
        self.function.bytecode.emit_jump_to(update)?;

        self.function.bytecode.patch_jump(exit_jump)
    }

    fn return_statement(&mut self) -> Emit {
        if !self.symbols.in_function() {
            self.error("can't return from top-level code");
        }

        if self.check(TokenKind::Semicolon) || self.check(TokenKind::RBrace) {
            self.emit_arg(OpCode::Push, 0);
        } else {
            self.expression()?;
        }
        self.matches(TokenKind::Semicolon);

        // collapse the frame's locals so the value sits in slot 0
        let locals = self.symbols.frame_locals();
        if locals > 0 {
            self.emit_arg(OpCode::Store, 0);
            self.emit_pops(locals - 1);
        }
        self.emit(OpCode::Return);
        Ok(())
    }

    fn function_declaration(&mut self) -> Emit {
        self.consume(TokenKind::Identifier, "expected function name");
        let name = self.previous.lexeme.clone();

        if name == SCRIPT || self.functions.iter().any(|f| f.name == name) {
            self.error(format!("function already defined: {}", name));
        }
        self.symbols.declare_function(&name);

        // reserve the slot now so functions link in declaration order
        let index = self.functions.len();
        self.functions.push(Function::new(name.clone()));
        let enclosing = std::mem::replace(&mut self.function, Function::new(name.clone()));
        self.symbols.push_function_scope();

        self.consume(TokenKind::LParen, "expected '(' after function name");
        let mut params = Vec::new();
        if !self.check(TokenKind::RParen) {
            loop {
                self.consume(TokenKind::Identifier, "expected parameter name");
                params.push(self.previous.clone());
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RParen, "expected ')' after parameters");

        for param in params.iter().rev() {
            if let Err(e) = self.symbols.declare_parameter(&param.lexeme) {
                self.report(param, e.to_string());
            }
        }

        self.consume(TokenKind::LBrace, "expected '{' before function body");
        self.block()?;

        // falling off the end returns 0
        let locals = self.symbols.locals_count();
        self.emit_pops(locals);
        self.emit_arg(OpCode::Push, 0);
        self.emit(OpCode::Return);
        self.symbols.pop_scope();

        let mut compiled = std::mem::replace(&mut self.function, enclosing);
        compiled.arity = params.len();
        debug!(function = %name, arity = params.len(), size = compiled.bytecode.count(), "function compiled");
        self.functions[index] = compiled;
        Ok(())
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    /// An expression in value position: assignment is not allowed here.
    fn expression(&mut self) -> Emit {
        self.parse_precedence(Precedence::Logical)
    }

    fn parse_precedence(&mut self, precedence: Precedence) -> Emit {
        self.nested("expression nested too deeply", |c| c.unnested_precedence(precedence))
    }

    fn unnested_precedence(&mut self, precedence: Precedence) -> Emit {
        self.advance();

        let can_assign = precedence <= Precedence::Assignment;
        let Some(prefix) = rule(self.previous.kind).prefix else {
            self.error("expected expression");
            return Ok(());
        };
        prefix(self, can_assign)?;

        while precedence <= rule(self.current.kind).precedence {
            self.advance();
            if let Some(infix) = rule(self.previous.kind).infix {
                infix(self, can_assign)?;
            }
        }

        if self.current.kind.is_assignment() {
            self.error_at_current("invalid assignment target");
            self.advance();
        }
        Ok(())
    }

    fn grouping(&mut self, _can_assign: bool) -> Emit {
        self.expression()?;
        self.consume(TokenKind::RParen, "expected ')' after expression");
        Ok(())
    }

    fn number(&mut self, _can_assign: bool) -> Emit {
        match self.previous.literal {
            Literal::Int(value) => self.emit_arg(OpCode::Push, value),
            _ => self.error("floating point literals are not supported"),
        }
        Ok(())
    }

    fn unary(&mut self, _can_assign: bool) -> Emit {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary)?;

        match operator {
            TokenKind::Minus => self.emit(OpCode::Neg),
            TokenKind::Bang => self.emit(OpCode::Not),
            _ => {}
        }
        Ok(())
    }

    fn binary(&mut self, _can_assign: bool) -> Emit {
        let operator = self.previous.kind;
        let precedence = rule(operator).precedence;
        self.parse_precedence(precedence.next())?;

        if let Some(op) = binary_op(operator) {
            self.emit(op);
        }
        Ok(())
    }

    fn fork(&mut self, _can_assign: bool) -> Emit {
        self.consume(TokenKind::LParen, "expected '(' after 'fork'");
        self.consume(TokenKind::RParen, "expected ')' after 'fork('");
        self.emit(OpCode::Fork);
        Ok(())
    }

    fn kill(&mut self, _can_assign: bool) -> Emit {
        self.consume(TokenKind::LParen, "expected '(' after 'kill'");
        self.expression()?;
        self.consume(TokenKind::RParen, "expected ')' after context id");
        self.emit(OpCode::Kill);
        Ok(())
    }

    fn variable(&mut self, can_assign: bool) -> Emit {
        let token = self.previous.clone();
        let name = token.lexeme.clone();

        if self.matches(TokenKind::LParen) {
            return self.call(&name);
        }

        if can_assign && self.current.kind.is_assignment() {
            self.advance();
            return self.assignment(&token, self.previous.kind);
        }

        match self.symbols.resolve(&name) {
            Ok(slot) => self.emit_arg(OpCode::Load, slot),
            Err(_) if self.symbols.function_declared(&name) => {
                self.error(format!("function {} used as a value", name));
            }
            Err(e) => self.error(e.to_string()),
        }
        Ok(())
    }

    fn assignment(&mut self, target: &Token, operator: TokenKind) -> Emit {
        self.assigned = true;
        let name = target.lexeme.as_str();
        let resolved = self.symbols.resolve(name);

        if operator == TokenKind::Equal {
            self.expression()?;
            match resolved {
                Ok(slot) => self.emit_arg(OpCode::Store, slot),
                // the update clause has no scope of its own to pop a new local
                Err(e) if self.loop_update => self.report(target, e.to_string()),
                // a fresh name becomes a local; the value already sits in its slot
                Err(_) => {
                    if let Err(e) = self.symbols.declare_local(name) {
                        self.error(e.to_string());
                    }
                }
            }
            return Ok(());
        }

        let slot = match resolved {
            Ok(slot) => slot,
            Err(e) => {
                self.error(e.to_string());
                return Ok(());
            }
        };
        self.emit_arg(OpCode::Load, slot);
        self.expression()?;
        if let Some(op) = binary_op(operator) {
            self.emit(op);
        }
        self.emit_arg(OpCode::Store, slot);
        Ok(())
    }

    /// Arguments are pushed left to right; after the callee returns, each one
    /// is swapped out from under the return value and discarded.
    fn call(&mut self, name: &str) -> Emit {
        let mut argc = 0;
        if !self.check(TokenKind::RParen) {
            loop {
                self.expression()?;
                argc += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RParen, "expected ')' after arguments");

        let placeholder = self.placeholder_for(name, argc);
        self.emit_arg(OpCode::Call, placeholder);
        for _ in 0..argc {
            self.emit(OpCode::Swap);
            self.emit(OpCode::Pop);
        }
        Ok(())
    }
}
