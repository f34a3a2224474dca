// File: src/compiler.rs
//
// Single-pass Pratt compiler for the Lox VM.
// Consumes the token stream and emits bytecode directly, with no AST in
// between: lexical scopes are resolved, upvalues detected, and forward
// jumps back-patched while parsing. Allocation goes through the VM so
// the garbage collector can run mid-compile and still see every
// in-progress function as a root.

use crate::bytecode::{Chunk, OpCode};
use crate::debug;
use crate::errors::{Diagnostic, ErrorAt};
use crate::heap::ObjRef;
use crate::lexer::{self, Token, TokenKind};
use crate::value::Value;
use crate::vm::Vm;

/// Per-function caps; indices must fit in one operand byte.
const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

/// Expression precedence, lowest to highest.
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
    Call,       // . ()
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call | Primary => Primary,
        }
    }
}

/// Parse actions named by the rule table and dispatched in `apply`.
#[derive(Debug, Clone, Copy)]
enum ParseFn {
    Grouping,
    Call,
    Unary,
    Binary,
    Number,
    String,
    Literal,
    Variable,
    And,
    Or,
}

struct ParseRule {
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
}

fn rule(prefix: Option<ParseFn>, infix: Option<ParseFn>, precedence: Precedence) -> ParseRule {
    ParseRule { prefix, infix, precedence }
}

/// Static rule triple for a token kind.
fn get_rule(kind: TokenKind) -> ParseRule {
    use TokenKind::*;
    match kind {
        LeftParen => rule(Some(ParseFn::Grouping), Some(ParseFn::Call), Precedence::Call),
        Minus => rule(Some(ParseFn::Unary), Some(ParseFn::Binary), Precedence::Term),
        Plus => rule(None, Some(ParseFn::Binary), Precedence::Term),
        Slash | Star => rule(None, Some(ParseFn::Binary), Precedence::Factor),
        Bang => rule(Some(ParseFn::Unary), None, Precedence::None),
        BangEqual | EqualEqual => rule(None, Some(ParseFn::Binary), Precedence::Equality),
        Greater | GreaterEqual | Less | LessEqual => {
            rule(None, Some(ParseFn::Binary), Precedence::Comparison)
        }
        Identifier => rule(Some(ParseFn::Variable), None, Precedence::None),
        Str => rule(Some(ParseFn::String), None, Precedence::None),
        Number => rule(Some(ParseFn::Number), None, Precedence::None),
        And => rule(None, Some(ParseFn::And), Precedence::And),
        Or => rule(None, Some(ParseFn::Or), Precedence::Or),
        False | True | Nil => rule(Some(ParseFn::Literal), None, Precedence::None),
        _ => rule(None, None, Precedence::None),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Script,
    Function,
}

/// A local variable slot. Depth -1 marks "declared but not yet
/// initialized", which is what catches `var a = a;`.
struct Local {
    name: String,
    depth: i32,
    is_captured: bool,
}

/// Compile-time description of one captured variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

/// Per-function compiler state. The enclosing function is the previous
/// entry on the frame stack.
struct FuncState {
    function: ObjRef,
    kind: FunctionKind,
    locals: Vec<Local>,
    scope_depth: i32,
    upvalues: Vec<UpvalueDesc>,
}

pub struct Compiler<'vm> {
    vm: &'vm mut Vm,
    tokens: Vec<Token>,
    current: usize,
    previous: usize,
    frames: Vec<FuncState>,
    diagnostics: Vec<Diagnostic>,
    panic_mode: bool,
}

/// Compile a source string to the top-level script function. All
/// diagnostics are collected; compilation fails if any were reported,
/// even though parsing continues past them.
pub fn compile(vm: &mut Vm, source: &str) -> Result<ObjRef, Vec<Diagnostic>> {
    let tokens = lexer::tokenize(source);
    let mut compiler = Compiler {
        vm,
        tokens,
        current: 0,
        previous: 0,
        frames: Vec::new(),
        diagnostics: Vec::new(),
        panic_mode: false,
    };
    compiler.begin_func(FunctionKind::Script);
    compiler.skip_error_tokens();
    while !compiler.match_kind(TokenKind::Eof) {
        compiler.declaration();
    }
    let (function, _) = compiler.end_func();
    if compiler.diagnostics.is_empty() {
        Ok(function)
    } else {
        Err(compiler.diagnostics)
    }
}

impl<'vm> Compiler<'vm> {
    // Token plumbing.

    fn current_token(&self) -> &Token {
        &self.tokens[self.current]
    }

    fn previous_token(&self) -> &Token {
        &self.tokens[self.previous]
    }

    fn advance(&mut self) {
        self.previous = self.current;
        if self.current_token().kind != TokenKind::Eof {
            self.current += 1;
            self.skip_error_tokens();
        }
    }

    /// The scanner reports problems as error tokens; turn each into a
    /// diagnostic and move past it so the parser only sees real tokens.
    fn skip_error_tokens(&mut self) {
        while self.current_token().kind == TokenKind::Error {
            let line = self.current_token().line;
            let message = self.current_token().lexeme.clone();
            self.report(line, ErrorAt::Bare, &message);
            self.current += 1;
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current_token().kind == kind
    }

    fn match_kind(&mut self, kind: TokenKind) -> bool {
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

    // Diagnostics. The first error sets panic mode, which silences
    // everything until `synchronize` finds a statement boundary.

    fn error(&mut self, message: &str) {
        let (line, at) = self.describe(self.previous);
        self.report(line, at, message);
    }

    fn error_at_current(&mut self, message: &str) {
        let (line, at) = self.describe(self.current);
        self.report(line, at, message);
    }

    fn describe(&self, index: usize) -> (usize, ErrorAt) {
        let token = &self.tokens[index];
        let at = match token.kind {
            TokenKind::Eof => ErrorAt::End,
            TokenKind::Error => ErrorAt::Bare,
            _ => ErrorAt::Token(token.lexeme.clone()),
        };
        (token.line, at)
    }

    fn report(&mut self, line: usize, at: ErrorAt, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.diagnostics.push(Diagnostic {
            line,
            at,
            message: message.to_string(),
        });
    }

    /// Skip tokens until a statement boundary, then clear panic mode.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.check(TokenKind::Eof) {
            if self.previous_token().kind == TokenKind::Semicolon {
                return;
            }
            match self.current_token().kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // Function frames.

    fn state(&self) -> &FuncState {
        self.frames.last().expect("compiler frame")
    }

    fn state_mut(&mut self) -> &mut FuncState {
        self.frames.last_mut().expect("compiler frame")
    }

    /// Open a new function frame. The function object is allocated first
    /// and registered as a GC root before anything else can allocate.
    fn begin_func(&mut self, kind: FunctionKind) {
        let function = self.vm.new_function();
        self.vm.heap.push_compiler_root(function);
        if kind != FunctionKind::Script {
            let name = self.previous_token().lexeme.clone();
            let name_ref = self.vm.intern(&name);
            self.vm.heap.function_mut(function).name = Some(name_ref);
        }

        // Slot 0 belongs to the callee itself.
        let mut locals = Vec::with_capacity(8);
        locals.push(Local {
            name: String::new(),
            depth: 0,
            is_captured: false,
        });
        self.frames.push(FuncState {
            function,
            kind,
            locals,
            scope_depth: 0,
            upvalues: Vec::new(),
        });
    }

    /// Close the current frame and hand back the finished function with
    /// its upvalue descriptors for the enclosing CLOSURE instruction.
    fn end_func(&mut self) -> (ObjRef, Vec<UpvalueDesc>) {
        self.emit_return();
        let state = self.frames.pop().expect("compiler frame");
        self.vm.heap.pop_compiler_root();
        if std::env::var("LOX_PRINT_CODE").is_ok() && self.diagnostics.is_empty() {
            let name = self.vm.heap.format_object(state.function);
            let chunk = &self.vm.heap.function(state.function).chunk;
            eprintln!("{}", debug::disassemble_chunk(&self.vm.heap, chunk, &name));
        }
        (state.function, state.upvalues)
    }

    // Bytecode emission, always into the current frame's chunk.

    fn chunk_mut(&mut self) -> &mut Chunk {
        let function = self.state().function;
        &mut self.vm.heap.function_mut(function).chunk
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous_token().line;
        self.chunk_mut().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op.into());
    }

    fn emit_ops(&mut self, first: OpCode, second: OpCode) {
        self.emit_op(first);
        self.emit_op(second);
    }

    fn emit_op_byte(&mut self, op: OpCode, byte: u8) {
        self.emit_op(op);
        self.emit_byte(byte);
    }

    /// Functions fall off their end returning nil.
    fn emit_return(&mut self) {
        self.emit_ops(OpCode::Nil, OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let index = self.chunk_mut().add_constant(value);
        if index > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_op_byte(OpCode::Constant, index);
    }

    /// Emit a jump with a two-byte placeholder; returns the placeholder
    /// offset for `patch_jump`.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk_mut().code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // The jump is measured from just past its own operand bytes.
        let jump = self.chunk_mut().code.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let bytes = (jump as u16).to_be_bytes();
        let chunk = self.chunk_mut();
        chunk.code[offset] = bytes[0];
        chunk.code[offset + 1] = bytes[1];
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.chunk_mut().code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        let bytes = (offset as u16).to_be_bytes();
        self.emit_byte(bytes[0]);
        self.emit_byte(bytes[1]);
    }

    // Declarations and statements.

    fn declaration(&mut self) {
        if self.match_kind(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_kind(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // A function may refer to itself; its name is usable before the
        // body finishes compiling.
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind) {
        self.begin_func(kind);
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let function = self.state().function;
                let arity = {
                    let function = self.vm.heap.function_mut(function);
                    function.arity += 1;
                    function.arity
                };
                if arity > 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_kind(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        // No end_scope: the whole frame is discarded with its locals.
        let (function, upvalues) = self.end_func();
        let constant = self.make_constant(Value::Obj(function));
        self.emit_op_byte(OpCode::Closure, constant);
        for upvalue in upvalues {
            self.emit_byte(u8::from(upvalue.is_local));
            self.emit_byte(upvalue.index);
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_kind(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn statement(&mut self) {
        if self.match_kind(TokenKind::Print) {
            self.print_statement();
        } else if self.match_kind(TokenKind::If) {
            self.if_statement();
        } else if self.match_kind(TokenKind::Return) {
            self.return_statement();
        } else if self.match_kind(TokenKind::While) {
            self.while_statement();
        } else if self.match_kind(TokenKind::For) {
            self.for_statement();
        } else if self.match_kind(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
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

        // The condition stays on the stack through the jump; both arms
        // start by popping it.
        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.match_kind(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk_mut().code.len();
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

    /// Desugared in place: initializer once, then condition, then body,
    /// then increment, looping back to the condition. The increment
    /// section is jumped over on the way in and looped to from the body.
    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_kind(TokenKind::Semicolon) {
            // No initializer.
        } else if self.match_kind(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk_mut().code.len();
        let mut exit_jump = None;
        if !self.match_kind(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_kind(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk_mut().code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.state().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_kind(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    // Scopes and variables.

    fn begin_scope(&mut self) {
        self.state_mut().scope_depth += 1;
    }

    /// Pop every local that belonged to the closed scope. Captured
    /// locals are migrated to the heap instead of plainly popped.
    fn end_scope(&mut self) {
        self.state_mut().scope_depth -= 1;
        loop {
            let state = self.state();
            let Some(local) = state.locals.last() else { break };
            if local.depth <= state.scope_depth {
                break;
            }
            let captured = local.is_captured;
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.state_mut().locals.pop();
        }
    }

    /// Consume an identifier, declare it, and return the constant index
    /// used by DEFINE_GLOBAL (globals only; locals live on the stack).
    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        let name = self.previous_token().lexeme.clone();
        self.declare_variable(&name);
        if self.state().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(&name)
    }

    fn declare_variable(&mut self, name: &str) {
        if self.state().scope_depth == 0 {
            return;
        }
        let depth = self.state().scope_depth;
        let mut duplicate = false;
        for local in self.state().locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn add_local(&mut self, name: &str) {
        if self.state().locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.state_mut().locals.push(Local {
            name: name.to_string(),
            depth: -1,
            is_captured: false,
        });
    }

    fn define_variable(&mut self, global: u8) {
        if self.state().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_byte(OpCode::DefineGlobal, global);
    }

    /// Flip the newest local from "declared" to "usable".
    fn mark_initialized(&mut self) {
        if self.state().scope_depth == 0 {
            return;
        }
        let depth = self.state().scope_depth;
        if let Some(local) = self.state_mut().locals.last_mut() {
            local.depth = depth;
        }
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let name = self.vm.intern(name);
        self.make_constant(Value::Obj(name))
    }

    fn resolve_local(&mut self, frame: usize, name: &str) -> Option<u8> {
        for i in (0..self.frames[frame].locals.len()).rev() {
            if self.frames[frame].locals[i].name == name {
                if self.frames[frame].locals[i].depth == -1 {
                    self.error("Can't read local variable in its own initializer.");
                }
                return Some(i as u8);
            }
        }
        None
    }

    /// Find `name` in an enclosing frame, threading an upvalue chain
    /// down to the current frame. Direct captures mark the enclosing
    /// local so its scope exit closes it instead of popping it.
    fn resolve_upvalue(&mut self, frame: usize, name: &str) -> Option<u8> {
        if frame == 0 {
            return None;
        }
        let enclosing = frame - 1;
        if let Some(local) = self.resolve_local(enclosing, name) {
            self.frames[enclosing].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(frame, local, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(frame, upvalue, false));
        }
        None
    }

    fn add_upvalue(&mut self, frame: usize, index: u8, is_local: bool) -> u8 {
        let descriptor = UpvalueDesc { index, is_local };
        if let Some(existing) =
            self.frames[frame].upvalues.iter().position(|u| *u == descriptor)
        {
            return existing as u8;
        }
        if self.frames[frame].upvalues.len() == MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.frames[frame].upvalues.push(descriptor);
        let count = self.frames[frame].upvalues.len();
        let function = self.frames[frame].function;
        self.vm.heap.function_mut(function).upvalue_count = count;
        (count - 1) as u8
    }

    /// Resolve a name against the current frame outward: local, then
    /// upvalue, then global by name at runtime.
    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let frame = self.frames.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(frame, name) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(index) = self.resolve_upvalue(frame, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, index)
        } else {
            let constant = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, constant)
        };

        if can_assign && self.match_kind(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(set_op, arg);
        } else {
            self.emit_op_byte(get_op, arg);
        }
    }

    // Expressions.

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    /// The Pratt driver: one prefix rule, then infix rules while the
    /// lookahead binds at least as tightly as `precedence`.
    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = get_rule(self.previous_token().kind).prefix else {
            self.error("Expect expression.");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        self.apply(prefix, can_assign);

        while precedence <= get_rule(self.current_token().kind).precedence {
            self.advance();
            if let Some(infix) = get_rule(self.previous_token().kind).infix {
                self.apply(infix, can_assign);
            }
        }

        // An `=` nobody consumed means the target was not assignable.
        if can_assign && self.match_kind(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn apply(&mut self, function: ParseFn, can_assign: bool) {
        match function {
            ParseFn::Grouping => self.grouping(),
            ParseFn::Call => self.call(),
            ParseFn::Unary => self.unary(),
            ParseFn::Binary => self.binary(),
            ParseFn::Number => self.number(),
            ParseFn::String => self.string(),
            ParseFn::Literal => self.literal(),
            ParseFn::Variable => self.variable(can_assign),
            ParseFn::And => self.and_(),
            ParseFn::Or => self.or_(),
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn call(&mut self) {
        let arg_count = self.argument_list();
        self.emit_op_byte(OpCode::Call, arg_count);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.match_kind(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count.min(255) as u8
    }

    fn unary(&mut self) {
        let operator = self.previous_token().kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!("unary rule on non-unary token"),
        }
    }

    fn binary(&mut self) {
        let operator = self.previous_token().kind;
        let precedence = get_rule(operator).precedence;
        self.parse_precedence(precedence.next());
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

    fn number(&mut self) {
        let value: f64 = self.previous_token().lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self) {
        // The lexeme still carries its quotes.
        let lexeme = &self.previous_token().lexeme;
        let content = lexeme[1..lexeme.len() - 1].to_string();
        let string = self.vm.intern(&content);
        self.emit_constant(Value::Obj(string));
    }

    fn literal(&mut self) {
        match self.previous_token().kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!("literal rule on non-literal token"),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous_token().lexeme.clone();
        self.named_variable(&name, can_assign);
    }

    /// `a and b`: skip `b` when `a` is falsey, leaving `a` as the result.
    fn and_(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    /// `a or b`: keep `a` when truthy, otherwise evaluate `b`.
    fn or_(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }
}
