//! Single-pass Pratt compiler.
//!
//! Consumes tokens straight from the scanner and emits bytecode into the
//! chunk of the function currently being compiled. There is no AST: each
//! grammar rule writes its instructions as it parses.
//!
//! Compilation state is an explicit linked stack of `CompilerState`
//! frames, one per nested function; entering a function body pushes a
//! frame and leaving pops it. Name resolution walks that stack: local
//! slot, then captured upvalue (recorded in every intervening frame), then
//! global by name.
//!
//! Functions under construction live on the heap so the collector can see
//! their constant pools; the compiler keeps each one on the heap's protect
//! stack until it is reachable from an enclosing chunk.

use tracing::trace;

use skiff_core::chunk::{Chunk, LONG_INDEX_MAX, OpCode};
use skiff_core::heap::Heap;
use skiff_core::object::{FunctionObj, Obj, RawObj};
use skiff_core::value::Value;

use crate::error::CompileError;
use crate::scanner::{Scanner, Token, TokenKind};

/// Sentinel depth for a local that is declared but not yet initialized.
/// Resolution skips these so an initializer can still capture an outer
/// binding of the same name.
const UNINITIALIZED: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . () []
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FunctionKind {
    Script,
    Function,
}

struct Local {
    name: String,
    depth: i32,
    captured: bool,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct UpvalueMeta {
    pub index: u8,
    pub is_local: bool,
}

/// Per-function compilation frame.
pub(crate) struct CompilerState {
    pub(crate) enclosing: Option<Box<CompilerState>>,
    pub(crate) function: RawObj,
    kind: FunctionKind,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueMeta>,
    scope_depth: i32,
}

impl CompilerState {
    pub(crate) fn new(function: RawObj, kind: FunctionKind) -> CompilerState {
        CompilerState {
            enclosing: None,
            function,
            kind,
            // Slot 0 of every frame holds the callee.
            locals: vec![Local {
                name: String::new(),
                depth: 0,
                captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

fn resolve_local(state: &CompilerState, name: &str) -> Option<usize> {
    for (index, local) in state.locals.iter().enumerate().rev() {
        if local.depth != UNINITIALIZED && local.name == name {
            return Some(index);
        }
    }
    None
}

fn resolve_upvalue(state: &mut CompilerState, name: &str) -> Result<Option<u8>, String> {
    if state.enclosing.is_none() {
        return Ok(None);
    }
    let local = {
        let enclosing = state.enclosing.as_deref_mut().expect("enclosing checked above");
        match resolve_local(enclosing, name) {
            Some(index) => {
                enclosing.locals[index].captured = true;
                Some(index)
            }
            None => None,
        }
    };
    if let Some(index) = local {
        if index > u8::MAX as usize {
            return Err("Too many locals to capture in a closure.".to_string());
        }
        return add_upvalue(state, index as u8, true).map(Some);
    }
    let upvalue = {
        let enclosing = state.enclosing.as_deref_mut().expect("enclosing checked above");
        resolve_upvalue(enclosing, name)?
    };
    match upvalue {
        Some(index) => add_upvalue(state, index, false).map(Some),
        None => Ok(None),
    }
}

fn add_upvalue(state: &mut CompilerState, index: u8, is_local: bool) -> Result<u8, String> {
    for (i, upvalue) in state.upvalues.iter().enumerate() {
        if upvalue.index == index && upvalue.is_local == is_local {
            return Ok(i as u8);
        }
    }
    if state.upvalues.len() >= u8::MAX as usize {
        return Err("Too many closure variables in function.".to_string());
    }
    state.upvalues.push(UpvalueMeta { index, is_local });
    Ok((state.upvalues.len() - 1) as u8)
}

enum VarSlot {
    Local(usize),
    Upvalue(u8),
    Global(usize),
}

type ParseFn<'src, 'h> = fn(&mut Compiler<'src, 'h>, bool);

struct ParseRule<'src, 'h> {
    prefix: Option<ParseFn<'src, 'h>>,
    infix: Option<ParseFn<'src, 'h>>,
    precedence: Precedence,
}

pub(crate) struct Compiler<'src, 'h> {
    scanner: Scanner<'src>,
    heap: &'h mut Heap,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    diagnostics: Vec<String>,
    state: Box<CompilerState>,
}

/// Compile a whole source unit into a script function. Diagnostics are
/// printed to stderr as they are found and also collected into the error.
///
/// The returned function is unrooted; the caller must make it reachable
/// (push it, protect it) before allocating again.
pub fn compile(source: &str, heap: &mut Heap) -> Result<RawObj, CompileError> {
    trace!(bytes = source.len(), "compile start");
    let function = heap.allocate(Obj::Function(FunctionObj::new(std::ptr::null_mut())));
    heap.protect(Value::Obj(function));
    let state = Box::new(CompilerState::new(function, FunctionKind::Script));
    let mut compiler = Compiler::with_state(source, heap, state);
    compiler.advance();
    while !compiler.match_token(TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.emit_return();
    let (_, result) = compiler.into_state();
    heap.unprotect();
    trace!(ok = result.is_ok(), "compile end");
    result.map(|()| function)
}

impl<'src, 'h> Compiler<'src, 'h> {
    pub(crate) fn with_state(
        source: &'src str,
        heap: &'h mut Heap,
        state: Box<CompilerState>,
    ) -> Compiler<'src, 'h> {
        Compiler {
            scanner: Scanner::new(source),
            heap,
            previous: Token::synthetic(),
            current: Token::synthetic(),
            had_error: false,
            panic_mode: false,
            diagnostics: Vec::new(),
            state,
        }
    }

    /// Hand the (outermost) state back, with the line's diagnostics.
    pub(crate) fn into_state(self) -> (Box<CompilerState>, Result<(), CompileError>) {
        debug_assert!(self.state.enclosing.is_none());
        let result = if self.had_error {
            Err(CompileError {
                diagnostics: self.diagnostics,
            })
        } else {
            Ok(())
        };
        (self.state, result)
    }

    // ------------------------------------------------------------------
    // Token plumbing and error reporting
    // ------------------------------------------------------------------

    pub(crate) fn advance(&mut self) {
        self.previous = std::mem::replace(&mut self.current, Token::synthetic());
        loop {
            let token = self.scanner.next_token();
            if token.kind != TokenKind::Error {
                self.current = token;
                return;
            }
            let line = token.line;
            let message = token.lexeme.into_owned();
            self.report(line, String::new(), &message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    pub(crate) fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.check(kind) {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn report(&mut self, line: usize, location: String, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let diagnostic = format!("[line {line}] Error{location}: {message}");
        eprintln!("{diagnostic}");
        self.diagnostics.push(diagnostic);
    }

    fn error_at(&mut self, at_current: bool, message: &str) {
        let token = if at_current { &self.current } else { &self.previous };
        let line = token.line;
        let location = match token.kind {
            TokenKind::Eof => " at end".to_string(),
            TokenKind::Error => String::new(),
            _ => format!(" at '{}'", token.lexeme),
        };
        self.report(line, location, message);
    }

    fn error(&mut self, message: &str) {
        self.error_at(false, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(true, message);
    }

    // ------------------------------------------------------------------
    // Bytecode emission
    // ------------------------------------------------------------------

    fn function_ref(&self) -> &FunctionObj {
        unsafe { (*self.state.function).function() }
    }

    fn function_mut(&mut self) -> &mut FunctionObj {
        unsafe { (*self.state.function).function_mut() }
    }

    fn chunk_mut(&mut self) -> &mut Chunk {
        &mut self.function_mut().chunk
    }

    fn chunk_len(&self) -> usize {
        self.function_ref().chunk.code.len()
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.chunk_mut().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.previous.line;
        self.chunk_mut().write_op(op, line);
    }

    fn emit_ops(&mut self, first: OpCode, second: OpCode) {
        self.emit_op(first);
        self.emit_op(second);
    }

    fn emit_return(&mut self) {
        self.emit_op(OpCode::Nil);
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> usize {
        if self.function_ref().chunk.constants.len() >= LONG_INDEX_MAX {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        self.chunk_mut().add_constant(value)
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_indexed(OpCode::Constant, OpCode::ConstantLong, index);
    }

    fn emit_indexed(&mut self, short: OpCode, long: OpCode, index: usize) {
        let line = self.previous.line;
        self.chunk_mut().write_indexed(short, long, index, line);
    }

    /// Emit a jump with a placeholder 4-byte operand; returns the operand
    /// offset for later patching.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        for _ in 0..4 {
            self.emit_byte(0xFF);
        }
        self.chunk_len() - 4
    }

    fn patch_jump(&mut self, operand: usize) {
        // The displacement is measured from just past the operand.
        let distance = self.chunk_len() - operand - 4;
        if distance > i32::MAX as usize {
            self.error("Too much code to jump over.");
            return;
        }
        let bytes = (distance as i32).to_be_bytes();
        self.chunk_mut().code[operand..operand + 4].copy_from_slice(&bytes);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let distance = self.chunk_len() + 4 - loop_start;
        if distance > i32::MAX as usize {
            self.error("Loop body too large.");
            return;
        }
        for byte in (distance as i32).to_be_bytes() {
            self.emit_byte(byte);
        }
    }

    fn identifier_constant(&mut self, name: &str) -> usize {
        let string = self.heap.intern(name);
        self.make_constant(Value::Obj(string))
    }

    // ------------------------------------------------------------------
    // Scopes, locals, and function frames
    // ------------------------------------------------------------------

    fn begin_scope(&mut self) {
        self.state.scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.state.scope_depth -= 1;
        loop {
            let captured = match self.state.locals.last() {
                Some(local) if local.depth > self.state.scope_depth => local.captured,
                _ => break,
            };
            // A captured local needs its upvalue closed as the slot dies;
            // CLOSE_UPVALUE also pops.
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.state.locals.pop();
        }
    }

    fn add_local(&mut self, name: &str) {
        if self.state.locals.len() >= LONG_INDEX_MAX {
            self.error("Too many local variables in function.");
            return;
        }
        self.state.locals.push(Local {
            name: name.to_string(),
            depth: UNINITIALIZED,
            captured: false,
        });
    }

    fn declare_variable(&mut self, name: &str) {
        if self.state.scope_depth == 0 {
            return;
        }
        // Shadowing within the same scope is permitted: the new local is
        // appended and wins resolution from then on.
        self.add_local(name);
    }

    fn mark_initialized(&mut self) {
        if self.state.scope_depth == 0 {
            return;
        }
        let depth = self.state.scope_depth;
        if let Some(local) = self.state.locals.last_mut() {
            local.depth = depth;
        }
    }

    /// Consume an identifier and declare it. Returns the name-constant
    /// index for globals, or `None` for locals.
    fn parse_variable(&mut self, message: &str) -> Option<usize> {
        self.consume(TokenKind::Identifier, message);
        let name = self.previous.lexeme.to_string();
        self.declare_variable(&name);
        if self.state.scope_depth > 0 {
            None
        } else {
            Some(self.identifier_constant(&name))
        }
    }

    fn define_variable(&mut self, global: Option<usize>) {
        match global {
            None => self.mark_initialized(),
            Some(index) => {
                self.emit_indexed(OpCode::DefineGlobal, OpCode::DefineGlobalLong, index)
            }
        }
    }

    fn begin_state(&mut self, kind: FunctionKind, name: Option<&str>) {
        let name_obj = match name {
            Some(text) => {
                let string = self.heap.intern(text);
                self.heap.protect(Value::Obj(string));
                string
            }
            None => std::ptr::null_mut(),
        };
        let function = self
            .heap
            .allocate(Obj::Function(FunctionObj::new(name_obj)));
        if !name_obj.is_null() {
            self.heap.unprotect();
        }
        self.heap.protect(Value::Obj(function));
        let enclosing = std::mem::replace(
            &mut self.state,
            Box::new(CompilerState::new(function, kind)),
        );
        self.state.enclosing = Some(enclosing);
    }

    fn end_state(&mut self) -> (RawObj, Vec<UpvalueMeta>) {
        self.emit_return();
        let upvalues = std::mem::take(&mut self.state.upvalues);
        self.function_mut().upvalue_count = upvalues.len() as u8;
        let function = self.state.function;
        let enclosing = self
            .state
            .enclosing
            .take()
            .expect("nested state always has an enclosing state");
        self.state = enclosing;
        // The caller stores the function into the enclosing (protected)
        // chunk before any further allocation, so its own root can go.
        self.heap.unprotect();
        (function, upvalues)
    }

    // ------------------------------------------------------------------
    // Declarations and statements
    // ------------------------------------------------------------------

    pub(crate) fn declaration(&mut self) {
        if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        let name = self.previous.lexeme.to_string();
        // Initialized before the body so the function can call itself.
        self.mark_initialized();
        self.function(FunctionKind::Function, Some(&name));
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind, name: Option<&str>) {
        self.begin_state(kind, name);
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let arity = self.function_ref().arity;
                if arity == u8::MAX {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.function_mut().arity = arity + 1;
                }
                let param = self.parse_variable("Expect parameter name.");
                self.define_variable(param);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();
        let (function, upvalues) = self.end_state();
        let index = self.make_constant(Value::Obj(function));
        self.emit_indexed(OpCode::Closure, OpCode::ClosureLong, index);
        for upvalue in upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_byte(upvalue.index);
        }
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk_len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // No initializer.
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk_len();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk_len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");
            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);
        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.state.kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Fun
                | TokenKind::Var
                | TokenKind::If
                | TokenKind::While
                | TokenKind::For
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = Self::rule(self.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= Self::rule(self.current.kind).precedence {
            self.advance();
            let infix = Self::rule(self.previous.kind)
                .infix
                .expect("token with an infix precedence has an infix rule");
            infix(self, can_assign);
        }

        if can_assign
            && (self.match_token(TokenKind::Equal) || self.match_compound_op().is_some())
        {
            self.error("Invalid assignment target.");
        }
    }

    fn rule(kind: TokenKind) -> ParseRule<'src, 'h> {
        use TokenKind::*;
        let (prefix, infix, precedence): (
            Option<ParseFn<'src, 'h>>,
            Option<ParseFn<'src, 'h>>,
            Precedence,
        ) = match kind {
            LeftParen => (Some(Self::grouping), Some(Self::call), Precedence::Call),
            LeftBracket => (Some(Self::list_literal), Some(Self::index), Precedence::Call),
            LeftBrace => (Some(Self::dict_literal), None, Precedence::None),
            Dot => (None, Some(Self::dot), Precedence::Call),
            Minus => (Some(Self::unary), Some(Self::binary), Precedence::Term),
            Plus => (None, Some(Self::binary), Precedence::Term),
            Slash | Star => (None, Some(Self::binary), Precedence::Factor),
            Bang => (Some(Self::unary), None, Precedence::None),
            BangEqual | EqualEqual => (None, Some(Self::binary), Precedence::Equality),
            Greater | GreaterEqual | Less | LessEqual => {
                (None, Some(Self::binary), Precedence::Comparison)
            }
            Identifier => (Some(Self::variable), None, Precedence::None),
            Str => (Some(Self::string), None, Precedence::None),
            Number => (Some(Self::number), None, Precedence::None),
            And => (None, Some(Self::and_operator), Precedence::And),
            Or => (None, Some(Self::or_operator), Precedence::Or),
            False | True | Nil => (Some(Self::literal), None, Precedence::None),
            Fun => (Some(Self::function_expression), None, Precedence::None),
            Coroutine => (Some(Self::coroutine_expression), None, Precedence::None),
            Yield => (Some(Self::yield_expression), None, Precedence::None),
            Await => (Some(Self::await_expression), None, Precedence::None),
            _ => (None, None, Precedence::None),
        };
        ParseRule {
            prefix,
            infix,
            precedence,
        }
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        // The lexeme keeps its quotes; strip them here.
        let text = {
            let lexeme = self.previous.lexeme.as_ref();
            lexeme[1..lexeme.len() - 1].to_string()
        };
        let string = self.heap.intern(&text);
        self.emit_constant(Value::Obj(string));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!("literal rule on non-literal token"),
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!("unary rule on non-unary token"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        let precedence = Self::rule(operator).precedence.next();
        self.parse_precedence(precedence);
        match operator {
            TokenKind::BangEqual => self.emit_ops(OpCode::Equal, OpCode::Not),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => self.emit_ops(OpCode::Less, OpCode::Not),
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => self.emit_ops(OpCode::Greater, OpCode::Not),
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            _ => unreachable!("binary rule on non-binary token"),
        }
    }

    /// `and` leaves the left operand on the stack when it is falsy.
    fn and_operator(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    /// `or` jumps on false to the right operand, past it on true.
    fn or_operator(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.argument_list();
        self.emit_op(OpCode::Call);
        self.emit_byte(argc);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 arguments.");
                } else {
                    count += 1;
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count as u8
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme.to_string();
        self.named_variable(&name, can_assign);
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let slot = if let Some(index) = resolve_local(&self.state, name) {
            VarSlot::Local(index)
        } else if let Some(index) = self.resolve_upvalue_entry(name) {
            VarSlot::Upvalue(index)
        } else {
            VarSlot::Global(self.identifier_constant(name))
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_set(&slot);
            return;
        }
        let compound = if can_assign { self.match_compound_op() } else { None };
        match compound {
            Some(op) => {
                self.emit_get(&slot);
                self.expression();
                self.emit_op(op);
                self.emit_set(&slot);
            }
            None => self.emit_get(&slot),
        }
    }

    fn resolve_upvalue_entry(&mut self, name: &str) -> Option<u8> {
        match resolve_upvalue(&mut self.state, name) {
            Ok(found) => found,
            Err(message) => {
                self.error(&message);
                Some(0)
            }
        }
    }

    fn emit_get(&mut self, slot: &VarSlot) {
        match *slot {
            VarSlot::Local(index) => {
                self.emit_indexed(OpCode::GetLocal, OpCode::GetLocalLong, index)
            }
            VarSlot::Upvalue(index) => {
                self.emit_op(OpCode::GetUpvalue);
                self.emit_byte(index);
            }
            VarSlot::Global(index) => {
                self.emit_indexed(OpCode::GetGlobal, OpCode::GetGlobalLong, index)
            }
        }
    }

    fn emit_set(&mut self, slot: &VarSlot) {
        match *slot {
            VarSlot::Local(index) => {
                self.emit_indexed(OpCode::SetLocal, OpCode::SetLocalLong, index)
            }
            VarSlot::Upvalue(index) => {
                self.emit_op(OpCode::SetUpvalue);
                self.emit_byte(index);
            }
            VarSlot::Global(index) => {
                self.emit_indexed(OpCode::SetGlobal, OpCode::SetGlobalLong, index)
            }
        }
    }

    /// Consume a compound-assignment operator if one is next, returning
    /// the arithmetic opcode it lowers to.
    fn match_compound_op(&mut self) -> Option<OpCode> {
        let op = match self.current.kind {
            TokenKind::PlusEqual => OpCode::Add,
            TokenKind::MinusEqual => OpCode::Subtract,
            TokenKind::StarEqual => OpCode::Multiply,
            TokenKind::SlashEqual => OpCode::Divide,
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    fn index(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightBracket, "Expect ']' after index.");
        self.field_access(can_assign);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.previous.lexeme.to_string();
        let index = self.identifier_constant(&name);
        self.emit_indexed(OpCode::Constant, OpCode::ConstantLong, index);
        self.field_access(can_assign);
    }

    /// Container and key are on the stack; decide between read and write.
    /// Compound assignment would need to re-evaluate the container and key
    /// (there is no DUP opcode), so it is rejected here.
    fn field_access(&mut self, can_assign: bool) {
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::SetField);
            return;
        }
        if can_assign && self.match_compound_op().is_some() {
            self.error("Invalid assignment target.");
            return;
        }
        self.emit_op(OpCode::GetField);
    }

    fn list_literal(&mut self, _can_assign: bool) {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightBracket) {
            loop {
                self.expression();
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
                if self.check(TokenKind::RightBracket) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBracket, "Expect ']' after list elements.");
        if count >= LONG_INDEX_MAX {
            self.error("Too many elements in list literal.");
        }
        self.emit_indexed(OpCode::List, OpCode::ListLong, count);
    }

    fn dict_literal(&mut self, _can_assign: bool) {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightBrace) {
            loop {
                self.expression();
                self.consume(TokenKind::Colon, "Expect ':' after dict key.");
                self.expression();
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
                if self.check(TokenKind::RightBrace) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after dict entries.");
        if count >= LONG_INDEX_MAX {
            self.error("Too many entries in dict literal.");
        }
        self.emit_indexed(OpCode::Dict, OpCode::DictLong, count);
    }

    fn function_expression(&mut self, _can_assign: bool) {
        self.function(FunctionKind::Function, None);
    }

    fn coroutine_expression(&mut self, _can_assign: bool) {
        self.parse_precedence(Precedence::Unary);
        self.emit_op(OpCode::Coroutine);
    }

    fn yield_expression(&mut self, _can_assign: bool) {
        if self.check(TokenKind::Semicolon)
            || self.check(TokenKind::RightParen)
            || self.check(TokenKind::RightBrace)
            || self.check(TokenKind::RightBracket)
            || self.check(TokenKind::Comma)
            || self.check(TokenKind::Eof)
        {
            self.emit_op(OpCode::Nil);
        } else {
            self.expression();
        }
        self.emit_op(OpCode::Yield);
    }

    fn await_expression(&mut self, _can_assign: bool) {
        self.parse_precedence(Precedence::Unary);
        self.emit_op(OpCode::Await);
    }
}
