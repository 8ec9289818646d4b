//! The single-pass Pratt compiler (§4.G): one pass over the token stream,
//! emitting directly into a [`Chunk`] while tracking lexical scopes,
//! upvalue capture, and class/method context.

use vellum_core::{Chunk, Heap, ObjRef, OpCode, Value};

use crate::diagnostics::{AtToken, CompileError};
use crate::scanner::{Scanner, Token, TokenKind};

/// Binding-power levels, lowest to highest; `parse_precedence` consumes
/// infix operators whose precedence is at least the level requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    const fn one_higher(self) -> Self {
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

/// Infix binding power of each token kind; `None` means "not an infix
/// operator", so `parse_precedence`'s loop simply stops there. This is
/// the enum-indexed dispatch table the design calls for, expressed as a
/// `match` (the form rustc itself lowers to a jump table) rather than an
/// array of function pointers, which is awkward to thread through `&mut
/// self` borrows in safe Rust.
const fn infix_precedence(kind: TokenKind) -> Precedence {
    match kind {
        TokenKind::Or => Precedence::Or,
        TokenKind::And => Precedence::And,
        TokenKind::EqualEqual | TokenKind::BangEqual => Precedence::Equality,
        TokenKind::Less | TokenKind::LessEqual | TokenKind::Greater | TokenKind::GreaterEqual => {
            Precedence::Comparison
        }
        TokenKind::Plus | TokenKind::Minus => Precedence::Term,
        TokenKind::Star | TokenKind::Slash => Precedence::Factor,
        TokenKind::LeftParen | TokenKind::Dot => Precedence::Call,
        _ => Precedence::None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local {
    name: String,
    depth: Option<u32>,
    is_captured: bool,
}

struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

struct FunctionState {
    chunk: Chunk,
    name: Option<String>,
    arity: u8,
    kind: FunctionKind,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: u32,
}

impl FunctionState {
    fn new(kind: FunctionKind, name: Option<String>) -> Self {
        // Slot 0 is reserved: empty for plain functions, `this` for
        // methods/initializers (declared so user locals start at index 1).
        let slot0 = Local {
            name: if kind == FunctionKind::Method || kind == FunctionKind::Initializer {
                "this".to_string()
            } else {
                String::new()
            },
            depth: Some(0),
            is_captured: false,
        };
        FunctionState {
            chunk: Chunk::new(),
            name,
            arity: 0,
            kind,
            locals: vec![slot0],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

struct ClassState {
    has_superclass: bool,
}

/// Owns the token stream and every nested compiler/class frame for one
/// `compile()` call.
pub struct Compiler<'s> {
    scanner: Scanner<'s>,
    previous: Token<'s>,
    current: Token<'s>,
    had_error: bool,
    panic_mode: bool,
    diagnostics: Vec<CompileError>,
    functions: Vec<FunctionState>,
    classes: Vec<ClassState>,
    heap: &'s mut Heap,
}

/// Compiles `source` into a top-level `Function` object, or returns every
/// diagnostic gathered via panic-mode synchronization.
pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjRef, Vec<CompileError>> {
    let mut compiler = Compiler::new(source, heap);
    compiler.advance();
    while !compiler.check(TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.consume(TokenKind::Eof, "Expect end of expression.");

    if compiler.had_error {
        Err(compiler.diagnostics)
    } else {
        let (func_ref, _upvalues) = compiler.end_function();
        Ok(func_ref)
    }
}

impl<'s> Compiler<'s> {
    fn new(source: &'s str, heap: &'s mut Heap) -> Self {
        let mut scanner = Scanner::new(source);
        let first = scanner.scan_token();
        Compiler {
            scanner,
            previous: first,
            current: first,
            had_error: false,
            panic_mode: false,
            diagnostics: Vec::new(),
            functions: vec![FunctionState::new(FunctionKind::Script, None)],
            classes: Vec::new(),
            heap,
        }
    }

    // ---------- token stream plumbing ----------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let msg = self.current.lexeme.to_string();
            self.error_at(self.current, &msg);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_tok(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            let tok = self.current;
            self.error_at(tok, message);
        }
    }

    fn error_at_current(&mut self, message: &str) {
        let tok = self.current;
        self.error_at(tok, message);
    }

    fn error(&mut self, message: &str) {
        let tok = self.previous;
        self.error_at(tok, message);
    }

    fn error_at(&mut self, token: Token<'s>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let at = if token.kind == TokenKind::Eof {
            AtToken::End
        } else if token.kind == TokenKind::Error {
            AtToken::End
        } else {
            AtToken::Lexeme(token.lexeme.to_string())
        };
        self.diagnostics.push(CompileError { line: token.line, at, message: message.to_string() });
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => self.advance(),
            }
        }
    }

    // ---------- emission ----------

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.functions.last_mut().expect("script frame always present").chunk
    }

    fn line(&self) -> u32 {
        self.previous.line
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.line();
        self.chunk().write_u8(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_bytes(&mut self, a: u8, b: u8) {
        self.emit_byte(a);
        self.emit_byte(b);
    }

    fn emit_return(&mut self) {
        let kind = self.functions.last().unwrap().kind;
        if kind == FunctionKind::Initializer {
            self.emit_bytes(OpCode::GetLocal as u8, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u32 {
        match self.chunk().add_constant(value) {
            Ok(idx) => idx,
            Err(e) => {
                self.error(&e.to_string());
                0
            }
        }
    }

    /// Several opcodes (`Class`, `Method`, `GetProperty`/`SetProperty`,
    /// `Invoke`/`SuperInvoke`, `GetSuper`, `Closure`) have no long form and
    /// take their pool index as a single byte; this guards the truncation
    /// rather than silently wrapping once a chunk holds more than 256
    /// constants.
    fn small_constant(&mut self, idx: u32) -> u8 {
        if idx > u8::MAX as u32 {
            self.error("Too many constants for this operation.");
            0
        } else {
            idx as u8
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.make_constant(value);
        let line = self.line();
        self.chunk().emit_variable_width(OpCode::Constant, OpCode::ConstantLong, idx, line);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_bytes(0xff, 0xff);
        self.chunk().code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.chunk().code.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
            return;
        }
        let bytes = (jump as u16).to_be_bytes();
        let chunk = self.chunk();
        chunk.code[offset] = bytes[0];
        chunk.code[offset + 1] = bytes[1];
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.chunk().code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        let bytes = (offset as u16).to_be_bytes();
        self.emit_bytes(bytes[0], bytes[1]);
    }

    // ---------- scope / locals / upvalues ----------

    fn begin_scope(&mut self) {
        self.functions.last_mut().unwrap().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.functions.last_mut().unwrap().scope_depth -= 1;
        let depth = self.functions.last().unwrap().scope_depth;
        loop {
            // Re-borrow fresh each iteration: `emit_op` below needs `&mut
            // self` and must not race an outstanding borrow of `locals`.
            let is_captured = match self.functions.last().unwrap().locals.last() {
                Some(local) if local.depth.is_some_and(|d| d > depth) => local.is_captured,
                _ => break,
            };
            if is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.functions.last_mut().unwrap().locals.pop();
        }
    }

    fn add_local(&mut self, name: String) {
        let f = self.functions.last_mut().unwrap();
        if f.locals.len() >= u8::MAX as usize + 1 {
            self.error("Too many local variables in function.");
            return;
        }
        self.functions.last_mut().unwrap().locals.push(Local { name, depth: None, is_captured: false });
    }

    fn declare_variable(&mut self) {
        let depth = self.functions.last().unwrap().scope_depth;
        if depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        // Scoped so the borrow of `self.functions` ends before the
        // possible `self.error` call below needs `&mut self`.
        let duplicate = {
            let f = self.functions.last().unwrap();
            let mut found = false;
            for local in f.locals.iter().rev() {
                if local.depth.is_some_and(|d| d < depth) {
                    break;
                }
                if local.name == name {
                    found = true;
                    break;
                }
            }
            found
        };
        if duplicate {
            self.error("Already a variable with this name in this scope.");
            return;
        }
        self.add_local(name.to_string());
    }

    fn mark_initialized(&mut self) {
        let f = self.functions.last_mut().unwrap();
        if f.scope_depth == 0 {
            return;
        }
        let depth = f.scope_depth;
        if let Some(local) = f.locals.last_mut() {
            local.depth = Some(depth);
        }
    }

    fn identifier_constant(&mut self, name: &str) -> u32 {
        let obj = self.heap.intern(name);
        self.make_constant(Value::Obj(obj))
    }

    fn parse_variable(&mut self, message: &str) -> u32 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.functions.last().unwrap().scope_depth > 0 {
            return 0;
        }
        let name = self.previous.lexeme.to_string();
        self.identifier_constant(&name)
    }

    fn define_variable(&mut self, global: u32) {
        if self.functions.last().unwrap().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        let line = self.line();
        self.chunk().emit_variable_width(OpCode::DefineGlobal, OpCode::DefineGlobalLong, global, line);
    }

    fn resolve_local(&mut self, func_idx: usize, name: &str) -> Option<u16> {
        // Scoped so the borrow of `self.functions` ends before the
        // possible `self.error` call below needs `&mut self`.
        let found = {
            let f = &self.functions[func_idx];
            f.locals
                .iter()
                .enumerate()
                .rev()
                .find(|(_, local)| local.name == name)
                .map(|(i, local)| (i as u16, local.depth.is_none()))
        };
        let (idx, uninitialized) = found?;
        if uninitialized {
            self.error("Can't read local variable in its own initializer.");
        }
        Some(idx)
    }

    fn resolve_upvalue(&mut self, func_idx: usize, name: &str) -> Option<u8> {
        if func_idx == 0 {
            return None;
        }
        if let Some(local_idx) = self.resolve_local(func_idx - 1, name) {
            self.functions[func_idx - 1].locals[local_idx as usize].is_captured = true;
            return Some(self.add_upvalue(func_idx, local_idx as u8, true));
        }
        if let Some(up_idx) = self.resolve_upvalue(func_idx - 1, name) {
            return Some(self.add_upvalue(func_idx, up_idx, false));
        }
        None
    }

    fn add_upvalue(&mut self, func_idx: usize, index: u8, is_local: bool) -> u8 {
        let f = &mut self.functions[func_idx];
        for (i, u) in f.upvalues.iter().enumerate() {
            if u.index == index && u.is_local == is_local {
                return i as u8;
            }
        }
        if f.upvalues.len() >= u8::MAX as usize + 1 {
            self.error("Too many closure variables in function.");
            return 0;
        }
        f.upvalues.push(UpvalueDesc { index, is_local });
        (f.upvalues.len() - 1) as u8
    }

    // ---------- declarations & statements ----------

    fn declaration(&mut self) {
        if self.match_tok(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_tok(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_tok(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_tok(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind) {
        let name = self.previous.lexeme.to_string();
        self.functions.push(FunctionState::new(kind, Some(name)));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let f = self.functions.last_mut().unwrap();
                f.arity += 1;
                if f.arity > 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_tok(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (func_ref, upvalues) = self.end_function();
        let idx = self.make_constant(Value::Obj(func_ref));
        let byte = self.small_constant(idx);
        // Descriptor bytes must follow the opcode and its constant-index
        // operand, so these are emitted here in the *enclosing* frame, not
        // inside `end_function` (which still belongs to the frame being
        // closed when its upvalues are captured).
        self.emit_op(OpCode::Closure);
        self.emit_byte(byte);
        for u in upvalues {
            self.emit_byte(u8::from(u.is_local));
            self.emit_byte(u.index);
        }
    }

    /// Pops the current function frame, returning the compiled function and
    /// its upvalue descriptors for the caller to emit after `Closure`.
    fn end_function(&mut self) -> (ObjRef, Vec<UpvalueDesc>) {
        self.emit_return();
        let f = self.functions.pop().expect("end_function called with no frame");
        let upvalue_count = f.upvalues.len() as u8;
        let name = f.name.map(|n| self.heap.intern(&n));
        let func_obj = vellum_core::Obj::Function { name, arity: f.arity, upvalue_count, chunk: f.chunk };
        let func_ref = self.heap.alloc(func_obj);
        (func_ref, f.upvalues)
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous;
        let name_const = self.identifier_constant(class_name.lexeme);
        self.declare_variable();

        let name_byte = self.small_constant(name_const);
        self.emit_op(OpCode::Class);
        self.emit_byte(name_byte);
        self.define_variable(name_const);

        self.classes.push(ClassState { has_superclass: false });

        if self.match_tok(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let super_name = self.previous;
            if super_name.lexeme == class_name.lexeme {
                self.error("A class can't inherit from itself.");
            }
            self.named_variable(super_name, false);

            self.begin_scope();
            self.add_local("super".to_string());
            self.define_variable(0);

            self.named_variable(class_name, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        if self.classes.last().unwrap().has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name_tok = self.previous;
        let constant = self.identifier_constant(name_tok.lexeme);
        let kind = if name_tok.lexeme == "init" { FunctionKind::Initializer } else { FunctionKind::Method };
        self.function(kind);
        let byte = self.small_constant(constant);
        self.emit_op(OpCode::Method);
        self.emit_byte(byte);
    }

    fn statement(&mut self) {
        if self.match_tok(TokenKind::Print) {
            self.print_statement();
        } else if self.match_tok(TokenKind::For) {
            self.for_statement();
        } else if self.match_tok(TokenKind::If) {
            self.if_statement();
        } else if self.match_tok(TokenKind::Return) {
            self.return_statement();
        } else if self.match_tok(TokenKind::While) {
            self.while_statement();
        } else if self.match_tok(TokenKind::LeftBrace) {
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

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn return_statement(&mut self) {
        if self.functions.last().unwrap().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_tok(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.functions.last().unwrap().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
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
        if self.match_tok(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk().code.len();
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
        if self.match_tok(TokenKind::Semicolon) {
            // no initializer
        } else if self.match_tok(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk().code.len();
        let mut exit_jump: Option<usize> = None;
        if !self.match_tok(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_tok(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk().code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(ej) = exit_jump {
            self.patch_jump(ej);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    // ---------- expressions (Pratt parser) ----------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix(self.previous.kind, can_assign) {
            self.error("Expect expression.");
            return;
        }

        while precedence <= infix_precedence(self.current.kind) {
            self.advance();
            self.infix(self.previous.kind, can_assign);
        }

        if can_assign && self.match_tok(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn prefix(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        match kind {
            TokenKind::LeftParen => self.grouping(),
            TokenKind::Minus | TokenKind::Bang => self.unary(),
            TokenKind::Number => self.number(),
            TokenKind::Str => self.string_literal(),
            TokenKind::True | TokenKind::False | TokenKind::Nil => self.literal(),
            TokenKind::Identifier => {
                let tok = self.previous;
                self.named_variable(tok, can_assign);
            }
            TokenKind::This => self.this_expr(),
            TokenKind::Super => self.super_expr(),
            _ => return false,
        }
        true
    }

    fn infix(&mut self, kind: TokenKind, can_assign: bool) {
        match kind {
            TokenKind::Plus
            | TokenKind::Minus
            | TokenKind::Star
            | TokenKind::Slash
            | TokenKind::EqualEqual
            | TokenKind::BangEqual
            | TokenKind::Less
            | TokenKind::LessEqual
            | TokenKind::Greater
            | TokenKind::GreaterEqual => self.binary(kind),
            TokenKind::And => self.and_(),
            TokenKind::Or => self.or_(),
            TokenKind::LeftParen => self.call(),
            TokenKind::Dot => self.dot(can_assign),
            _ => unreachable!("infix_precedence only admits handled kinds"),
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self) {
        let op_kind = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match op_kind {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, op_kind: TokenKind) {
        let prec = infix_precedence(op_kind);
        self.parse_precedence(prec.one_higher());
        match op_kind {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            _ => unreachable!(),
        }
    }

    fn and_(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self) {
        let argc = self.argument_list();
        self.emit_op(OpCode::Call);
        self.emit_byte(argc);
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: u16 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if argc == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                argc += 1;
                if !self.match_tok(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        argc as u8
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name_const = self.identifier_constant(self.previous.lexeme);
        let name_byte = self.small_constant(name_const);
        if can_assign && self.match_tok(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::SetProperty);
            self.emit_byte(name_byte);
        } else if self.match_tok(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit_op(OpCode::Invoke);
            self.emit_byte(name_byte);
            self.emit_byte(argc);
        } else {
            self.emit_op(OpCode::GetProperty);
            self.emit_byte(name_byte);
        }
    }

    fn number(&mut self) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(f64::NAN);
        self.emit_constant(Value::Number(value));
    }

    fn string_literal(&mut self) {
        let lexeme = self.previous.lexeme;
        let s = &lexeme[1..lexeme.len() - 1];
        let obj = self.heap.intern(s);
        self.emit_constant(Value::Obj(obj));
    }

    fn literal(&mut self) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!(),
        }
    }

    fn this_expr(&mut self) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        let tok = self.previous;
        self.named_variable(tok, false);
    }

    fn super_expr(&mut self) {
        if self.classes.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.classes.last().unwrap().has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name_const = self.identifier_constant(self.previous.lexeme);
        let name_byte = self.small_constant(name_const);

        self.push_named_simple("this");
        if self.match_tok(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.push_named_simple("super");
            self.emit_op(OpCode::SuperInvoke);
            self.emit_byte(name_byte);
            self.emit_byte(argc);
        } else {
            self.push_named_simple("super");
            self.emit_op(OpCode::GetSuper);
            self.emit_byte(name_byte);
        }
    }

    /// Pushes a local/upvalue known to exist by this exact name (`this` or
    /// `super`); never falls back to a global lookup.
    fn push_named_simple(&mut self, name: &str) {
        let func_idx = self.functions.len() - 1;
        if let Some(slot) = self.resolve_local(func_idx, name) {
            self.emit_bytes(OpCode::GetLocal as u8, slot as u8);
        } else if let Some(idx) = self.resolve_upvalue(func_idx, name) {
            self.emit_bytes(OpCode::GetUpvalue as u8, idx);
        } else {
            self.error(&format!("Can't resolve '{name}'."));
        }
    }

    fn named_variable(&mut self, name: Token<'s>, can_assign: bool) {
        let func_idx = self.functions.len() - 1;
        let (get_short, get_long, set_short, set_long, slot): (OpCode, Option<OpCode>, OpCode, Option<OpCode>, u32);

        if let Some(local_slot) = self.resolve_local(func_idx, name.lexeme) {
            get_short = OpCode::GetLocal;
            get_long = Some(OpCode::GetLocalLong);
            set_short = OpCode::SetLocal;
            set_long = Some(OpCode::SetLocalLong);
            slot = u32::from(local_slot);
        } else if let Some(up_idx) = self.resolve_upvalue(func_idx, name.lexeme) {
            // Upvalues have no long form (capped at 256 per function).
            if can_assign && self.match_tok(TokenKind::Equal) {
                self.expression();
                self.emit_bytes(OpCode::SetUpvalue as u8, up_idx);
            } else {
                self.emit_bytes(OpCode::GetUpvalue as u8, up_idx);
            }
            return;
        } else {
            get_short = OpCode::GetGlobal;
            get_long = Some(OpCode::GetGlobalLong);
            set_short = OpCode::SetGlobal;
            set_long = Some(OpCode::SetGlobalLong);
            slot = self.identifier_constant(name.lexeme);
        }

        if can_assign && self.match_tok(TokenKind::Equal) {
            self.expression();
            let line = self.line();
            if let Some(long_op) = set_long {
                self.chunk().emit_variable_width(set_short, long_op, slot, line);
            } else {
                self.emit_bytes(set_short as u8, slot as u8);
            }
        } else {
            let line = self.line();
            if let Some(long_op) = get_long {
                self.chunk().emit_variable_width(get_short, long_op, slot, line);
            } else {
                self.emit_bytes(get_short as u8, slot as u8);
            }
        }
    }
}
