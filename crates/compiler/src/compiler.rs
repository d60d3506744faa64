//! The Crux bytecode compiler.
//!
//! A single-pass Pratt parser: the scanner feeds tokens straight into
//! per-function bytecode emitters, with no AST in between. A stack of
//! function contexts tracks lexical scopes, local slots, upvalue capture,
//! and match state; closing over an enclosing local threads an upvalue
//! entry through every intermediate function.
//!
//! On error the compiler enters panic mode, records a structured
//! [`CompileError`], and synchronizes at the next statement boundary so one
//! mistake produces one diagnostic.

use crux_core::chunk::Chunk;
use crux_core::heap::{Heap, ObjRef};
use crux_core::object::{
    Function, FunctionKind, Object, StructObj,
};
use crux_core::opcode::OpCode;
use crux_core::table::Table;
use crux_core::value::Value;
use crux_core::{ErrorKind, UINT8_COUNT};

use crate::error::CompileError;
use crate::scanner::{Scanner, Token, TokenKind};

const MAX_FUNCTION_ARITY: usize = 255;
const MAX_USE_NAMES: usize = 255;
const MAX_COLLECTION_ELEMENTS: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Shift,      // << >>
    Term,       // + -
    Factor,     // * / \ % **
    Unary,      // ! -
    Call,       // . () [] ? {}
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
            Precedence::Comparison => Precedence::Shift,
            Precedence::Shift => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum CompoundOp {
    Plus,
    Minus,
    Star,
    Slash,
    IntDivide,
    Modulus,
}

#[derive(Debug, Clone, Copy)]
struct Local<'src> {
    name: &'src str,
    depth: i32,
    captured: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

/// State of the innermost `match` being compiled in a function.
#[derive(Debug, Default)]
struct MatchCtx {
    /// Jump offsets from arm exits, patched to the end of the match.
    end_jumps: Vec<usize>,
    /// Local count at the start of the current arm body; `give` pops back
    /// to this depth before jumping out.
    arm_locals_base: usize,
}

/// One function being compiled; the stack of these mirrors function nesting.
struct FnCtx<'src> {
    function: ObjRef,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
    match_depth: u8,
    match_ctx: Option<MatchCtx>,
}

impl<'src> FnCtx<'src> {
    fn new(function: ObjRef, kind: FunctionKind) -> FnCtx<'src> {
        FnCtx {
            function,
            kind,
            // Slot zero holds the callee and is not nameable.
            locals: vec![Local {
                name: "",
                depth: 0,
                captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
            match_depth: 0,
            match_ctx: None,
        }
    }
}

struct Parser<'src> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
}

pub struct Compiler<'h, 'src> {
    heap: &'h mut Heap,
    parser: Parser<'src>,
    ctxs: Vec<FnCtx<'src>>,
    module: ObjRef,
    errors: Vec<CompileError>,
    /// `ident{...}` struct literals are disabled while parsing match
    /// targets and arm patterns, where `{` begins the arm list.
    struct_literals_allowed: bool,
    /// Result-binding arms write into a fixed local slot, which only lines
    /// up with the runtime stack when the match is a whole statement or a
    /// top-level initializer. True only in those positions.
    match_bind_allowed: bool,
    /// Set by `pub`; consumed by the next global definition.
    pending_pub: bool,
}

/// Compiles a source string into the module's top-level script function.
pub fn compile(
    heap: &mut Heap,
    source: &str,
    module: ObjRef,
) -> Result<ObjRef, Vec<CompileError>> {
    let scanner = Scanner::new(source);
    let placeholder = Token::synthetic("");
    let script = heap.allocate(Object::Function(Function::new(Some(module))));
    let mut compiler = Compiler {
        heap,
        parser: Parser {
            scanner,
            current: placeholder,
            previous: placeholder,
            had_error: false,
            panic_mode: false,
        },
        ctxs: vec![FnCtx::new(script, FunctionKind::Script)],
        module,
        errors: Vec::new(),
        struct_literals_allowed: true,
        match_bind_allowed: false,
        pending_pub: false,
    };

    compiler.advance();
    while !compiler.match_token(TokenKind::Eof) {
        compiler.declaration();
    }
    let (function, _) = compiler.end_compiler();

    if compiler.parser.had_error {
        Err(compiler.errors)
    } else {
        Ok(function)
    }
}

impl<'h, 'src> Compiler<'h, 'src> {
    // --- token plumbing ----------------------------------------------------

    fn advance(&mut self) {
        self.parser.previous = self.parser.current;
        loop {
            self.parser.current = self.parser.scanner.scan_token();
            if self.parser.current.kind != TokenKind::Error {
                break;
            }
            let message = self
                .parser
                .current
                .message
                .unwrap_or("Unexpected character.");
            self.error_at_current(ErrorKind::Syntax, message);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.parser.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(ErrorKind::Syntax, message);
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.parser.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    // --- error reporting ---------------------------------------------------

    fn error_at(&mut self, token: Token<'src>, kind: ErrorKind, message: &str) {
        if self.parser.panic_mode {
            return;
        }
        self.parser.panic_mode = true;
        self.parser.had_error = true;
        self.errors.push(CompileError {
            kind,
            message: message.to_string(),
            line: token.line,
            start: token.start,
            len: token.lexeme.len(),
        });
    }

    fn error(&mut self, kind: ErrorKind, message: &str) {
        self.error_at(self.parser.previous, kind, message);
    }

    fn error_at_current(&mut self, kind: ErrorKind, message: &str) {
        self.error_at(self.parser.current, kind, message);
    }

    fn synchronize(&mut self) {
        self.parser.panic_mode = false;
        while self.parser.current.kind != TokenKind::Eof {
            if self.parser.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.parser.current.kind {
                TokenKind::Struct
                | TokenKind::Fn
                | TokenKind::Let
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Return
                | TokenKind::Use
                | TokenKind::Match
                | TokenKind::Give
                | TokenKind::Pub => return,
                _ => {}
            }
            self.advance();
        }
    }

    // --- context helpers ---------------------------------------------------

    fn ctx(&self) -> &FnCtx<'src> {
        self.ctxs.last().expect("compiler context stack is never empty")
    }

    fn ctx_mut(&mut self) -> &mut FnCtx<'src> {
        self.ctxs.last_mut().expect("compiler context stack is never empty")
    }

    fn chunk_mut(&mut self) -> &mut Chunk {
        let function = self.ctx().function;
        &mut self.heap.function_mut(function).chunk
    }

    fn code_len(&self) -> usize {
        let function = self.ctx().function;
        self.heap.function(function).chunk.code.len()
    }

    // --- emission ----------------------------------------------------------

    fn emit_byte(&mut self, byte: u8) {
        let line = self.parser.previous.line;
        self.chunk_mut().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op.into());
    }

    fn emit_u16(&mut self, value: u16) {
        self.emit_byte((value >> 8) as u8);
        self.emit_byte((value & 0xff) as u8);
    }

    fn emit_return(&mut self) {
        self.emit_op(OpCode::NilReturn);
    }

    fn make_constant(&mut self, value: Value) -> u16 {
        match self.chunk_mut().add_constant(value) {
            Some(index) => index,
            None => {
                self.error(ErrorKind::Limit, "Too many constants in one chunk.");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_const_op(OpCode::Constant, OpCode::Constant16, index);
    }

    /// Emits the one-byte opcode for pool indexes up to 255, otherwise the
    /// 16-bit escape.
    fn emit_const_op(&mut self, narrow: OpCode, wide: OpCode, index: u16) {
        if index <= u8::MAX as u16 {
            self.emit_op(narrow);
            self.emit_byte(index as u8);
        } else {
            self.emit_op(wide);
            self.emit_u16(index);
        }
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.code_len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.code_len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error(ErrorKind::BranchExtent, "Too much code to jump over.");
            return;
        }
        let chunk = self.chunk_mut();
        chunk.code[offset] = (jump >> 8) as u8;
        chunk.code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.code_len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error(ErrorKind::LoopExtent, "Loop body too large.");
            return;
        }
        self.emit_u16(offset as u16);
    }

    fn identifier_constant(&mut self, name: &str) -> u16 {
        let string = self.heap.intern(name);
        self.make_constant(Value::Obj(string))
    }

    fn end_compiler(&mut self) -> (ObjRef, Vec<UpvalueDesc>) {
        self.emit_return();
        let ctx = self.ctxs.pop().expect("compiler context stack is never empty");
        (ctx.function, ctx.upvalues)
    }

    // --- scopes and locals -------------------------------------------------

    fn begin_scope(&mut self) {
        self.ctx_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.ctx_mut().scope_depth -= 1;
        loop {
            let ctx = self.ctx();
            let Some(local) = ctx.locals.last() else {
                break;
            };
            if local.depth <= ctx.scope_depth {
                break;
            }
            let captured = local.captured;
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.ctx_mut().locals.pop();
        }
    }

    fn add_local(&mut self, name: &'src str) {
        if self.ctx().locals.len() >= UINT8_COUNT {
            self.error(
                ErrorKind::LocalExtent,
                "Too many local variables in function.",
            );
            return;
        }
        self.ctx_mut().locals.push(Local {
            name,
            depth: -1,
            captured: false,
        });
    }

    fn declare_variable(&mut self) {
        if self.ctx().scope_depth == 0 {
            return;
        }
        let name = self.parser.previous.lexeme;
        let mut duplicate = false;
        {
            let ctx = self.ctx();
            for local in ctx.locals.iter().rev() {
                if local.depth != -1 && local.depth < ctx.scope_depth {
                    break;
                }
                if local.name == name {
                    duplicate = true;
                    break;
                }
            }
        }
        if duplicate {
            self.error(
                ErrorKind::Name,
                "Cannot redefine variable in the same scope.",
            );
        }
        self.add_local(name);
    }

    fn mark_initialized(&mut self) {
        let ctx = self.ctx_mut();
        if ctx.scope_depth == 0 {
            return;
        }
        if let Some(local) = ctx.locals.last_mut() {
            local.depth = ctx.scope_depth;
        }
    }

    fn parse_variable(&mut self, message: &str) -> u16 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.ctx().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.parser.previous.lexeme)
    }

    fn define_variable(&mut self, global: u16) {
        if self.ctx().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        if std::mem::take(&mut self.pending_pub) {
            self.emit_op(OpCode::Pub);
        }
        self.emit_const_op(OpCode::DefineGlobal, OpCode::DefineGlobal16, global);
    }

    fn resolve_local(&mut self, ctx_index: usize, name: &str) -> Option<u8> {
        let mut uninitialized = false;
        let mut found = None;
        {
            let ctx = &self.ctxs[ctx_index];
            for (i, local) in ctx.locals.iter().enumerate().rev() {
                if local.name == name {
                    if local.depth == -1 {
                        uninitialized = true;
                    }
                    found = Some(i as u8);
                    break;
                }
            }
        }
        if uninitialized {
            self.error(
                ErrorKind::Name,
                "Cannot read local variable in its own initializer.",
            );
        }
        found
    }

    fn add_upvalue(&mut self, ctx_index: usize, index: u8, is_local: bool) -> u8 {
        let desc = UpvalueDesc { index, is_local };
        if let Some(existing) = self.ctxs[ctx_index]
            .upvalues
            .iter()
            .position(|&u| u == desc)
        {
            return existing as u8;
        }
        if self.ctxs[ctx_index].upvalues.len() >= UINT8_COUNT {
            self.error(
                ErrorKind::ClosureExtent,
                "Too many closure variables in function.",
            );
            return 0;
        }
        self.ctxs[ctx_index].upvalues.push(desc);
        let count = self.ctxs[ctx_index].upvalues.len();
        let function = self.ctxs[ctx_index].function;
        self.heap.function_mut(function).upvalue_count = count as u8;
        (count - 1) as u8
    }

    fn resolve_upvalue(&mut self, ctx_index: usize, name: &str) -> Option<u8> {
        if ctx_index == 0 {
            return None;
        }
        let enclosing = ctx_index - 1;
        if let Some(local) = self.resolve_local(enclosing, name) {
            self.ctxs[enclosing].locals[local as usize].captured = true;
            return Some(self.add_upvalue(ctx_index, local, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(ctx_index, upvalue, false));
        }
        None
    }

    // --- declarations ------------------------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Struct) {
            self.struct_declaration();
        } else if self.match_token(TokenKind::Fn) {
            self.fn_declaration();
        } else if self.match_token(TokenKind::Let) {
            self.let_declaration();
        } else if self.match_token(TokenKind::Pub) {
            self.pub_declaration();
        } else {
            self.statement();
        }
        if self.parser.panic_mode {
            self.synchronize();
        }
    }

    fn pub_declaration(&mut self) {
        if self.ctx().scope_depth > 0 {
            self.error(ErrorKind::Syntax, "'pub' is only allowed at top level.");
        }
        self.pending_pub = true;
        if self.match_token(TokenKind::Struct) {
            self.struct_declaration();
        } else if self.match_token(TokenKind::Fn) {
            self.fn_declaration();
        } else if self.match_token(TokenKind::Let) {
            self.let_declaration();
        } else {
            self.pending_pub = false;
            self.error_at_current(
                ErrorKind::Syntax,
                "Expected 'let', 'fn' or 'struct' after 'pub'.",
            );
        }
    }

    fn let_declaration(&mut self) {
        let global = self.parse_variable("Expected variable name.");
        if self.match_token(TokenKind::Equal) {
            if self.ctx().scope_depth == 0 && self.match_token(TokenKind::Match) {
                // A whole-initializer match at top level may use binding
                // arms; globals occupy no local slots.
                let saved = std::mem::replace(&mut self.match_bind_allowed, true);
                self.match_expression();
                self.match_bind_allowed = saved;
            } else {
                self.expression();
            }
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(
            TokenKind::Semicolon,
            "Expected ';' after variable declaration.",
        );
        self.define_variable(global);
    }

    fn fn_declaration(&mut self) {
        let global = self.parse_variable("Expected function name.");
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind) {
        let name = match kind {
            FunctionKind::Anonymous => self.heap.intern("anonymous"),
            _ => self.heap.intern(self.parser.previous.lexeme),
        };
        let function = self
            .heap
            .allocate(Object::Function(Function::new(Some(self.module))));
        self.heap.function_mut(function).name = Some(name);
        self.ctxs.push(FnCtx::new(function, kind));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expected '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let arity = {
                    let f = self.heap.function(self.ctx().function);
                    f.arity as usize
                };
                if arity >= MAX_FUNCTION_ARITY {
                    self.error_at_current(
                        ErrorKind::ArgumentExtent,
                        "Cannot have more than 255 parameters.",
                    );
                }
                let constant = self.parse_variable("Expected parameter name.");
                self.define_variable(constant);
                let function = self.ctx().function;
                let f = self.heap.function_mut(function);
                f.arity = f.arity.saturating_add(1);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expected ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expected '{' before function body.");
        self.block();

        let (function, upvalues) = self.end_compiler();
        let index = self.make_constant(Value::Obj(function));
        let anonymous = kind == FunctionKind::Anonymous;
        if index <= u8::MAX as u16 {
            self.emit_op(if anonymous {
                OpCode::AnonFunction
            } else {
                OpCode::Closure
            });
            self.emit_byte(index as u8);
        } else {
            // AnonFunction16 is the 16-bit closure constructor; the VM
            // treats it identically to Closure apart from operand width.
            self.emit_op(OpCode::AnonFunction16);
            self.emit_u16(index);
        }
        for upvalue in upvalues {
            self.emit_byte(u8::from(upvalue.is_local));
            self.emit_byte(upvalue.index);
        }
    }

    fn struct_declaration(&mut self) {
        let global = self.parse_variable("Expected struct name.");
        let name_token = self.parser.previous;
        self.consume(TokenKind::LeftBrace, "Expected '{' after struct name.");

        let name = self.heap.intern(name_token.lexeme);
        let mut fields = Table::new();
        let mut index = 0i32;
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.consume(TokenKind::Identifier, "Expected field name.");
            let field = self.heap.intern(self.parser.previous.lexeme);
            let hash = self.heap.string(field).hash;
            if !fields.set(hash, Value::Obj(field), Value::Int(index)) {
                self.error(ErrorKind::Name, "Duplicate field name in struct.");
            } else {
                index += 1;
            }
            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after struct fields.");
        if index as usize > UINT8_COUNT {
            self.error(ErrorKind::Limit, "Too many fields in struct.");
        }

        let struct_obj = self.heap.allocate(Object::Struct(StructObj { name, fields }));
        let constant = self.make_constant(Value::Obj(struct_obj));
        self.emit_const_op(OpCode::Struct, OpCode::Struct16, constant);
        self.define_variable(global);
    }

    // --- statements --------------------------------------------------------

    fn statement(&mut self) {
        if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::Use) {
            self.use_statement();
        } else if self.match_token(TokenKind::Give) {
            self.give_statement();
        } else if self.match_token(TokenKind::Match) {
            // A match in statement position is the expression form with its
            // value dropped; the trailing semicolon is optional.
            let saved = std::mem::replace(&mut self.match_bind_allowed, true);
            self.match_expression();
            self.match_bind_allowed = saved;
            self.emit_op(OpCode::Pop);
            self.match_token(TokenKind::Semicolon);
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
        self.consume(TokenKind::RightBrace, "Expected '}' after block.");
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expected ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expected '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expected ')' after condition.");

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
        let loop_start = self.code_len();
        self.consume(TokenKind::LeftParen, "Expected '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expected ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expected '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // No initializer.
        } else if self.match_token(TokenKind::Let) {
            self.let_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.code_len();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expected ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.code_len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expected ')' after for clauses.");
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
        if self.ctx().kind == FunctionKind::Script {
            self.error(ErrorKind::Syntax, "Cannot return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expected ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn give_statement(&mut self) {
        if self.ctx().match_ctx.is_none() {
            self.error(ErrorKind::Syntax, "'give' is only allowed inside a match arm.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_op(OpCode::Nil);
        } else {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expected ';' after give value.");
        }
        self.emit_op(OpCode::Give);
        // Unwind arm-body locals before leaving the match.
        let base = self
            .ctx()
            .match_ctx
            .as_ref()
            .map_or(0, |m| m.arm_locals_base);
        let locals = &self.ctx().locals;
        let captured: Vec<bool> = locals[base.min(locals.len())..]
            .iter()
            .rev()
            .map(|l| l.captured)
            .collect();
        for is_captured in captured {
            if is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
        let jump = self.emit_jump(OpCode::Jump);
        if let Some(match_ctx) = self.ctx_mut().match_ctx.as_mut() {
            match_ctx.end_jumps.push(jump);
        }
    }

    fn use_statement(&mut self) {
        let mut names: Vec<u16> = Vec::new();
        let mut aliases: Vec<u16> = Vec::new();
        loop {
            self.consume(TokenKind::Identifier, "Expected imported name.");
            let name = self.identifier_constant(self.parser.previous.lexeme);
            let alias = if self.match_token(TokenKind::As) {
                self.consume(TokenKind::Identifier, "Expected alias after 'as'.");
                self.identifier_constant(self.parser.previous.lexeme)
            } else {
                name
            };
            names.push(name);
            aliases.push(alias);
            if names.len() > MAX_USE_NAMES {
                self.error(
                    ErrorKind::ImportExtent,
                    "Cannot import more than 255 names in one 'use'.",
                );
                return;
            }
            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }
        self.consume(TokenKind::From, "Expected 'from' after import names.");
        self.consume(TokenKind::String, "Expected module path string.");
        let path_token = self.parser.previous;
        let Some(path) = self.string_contents(path_token) else {
            return;
        };
        self.consume(TokenKind::Semicolon, "Expected ';' after use statement.");

        // Name constants are single-byte operands in the use opcodes.
        if names.iter().chain(aliases.iter()).any(|&i| i > u8::MAX as u16) {
            self.error(
                ErrorKind::Limit,
                "Too many constants in one chunk for 'use'.",
            );
            return;
        }

        if let Some(native) = path.strip_prefix("crux:") {
            let module_name = self.identifier_like_constant(native);
            if module_name > u8::MAX as u16 {
                self.error(
                    ErrorKind::Limit,
                    "Too many constants in one chunk for 'use'.",
                );
                return;
            }
            self.emit_op(OpCode::UseNative);
            self.emit_byte(names.len() as u8);
            for &name in &names {
                self.emit_byte(name as u8);
            }
            for &alias in &aliases {
                self.emit_byte(alias as u8);
            }
            self.emit_byte(module_name as u8);
        } else {
            let path_constant = self.identifier_like_constant(&path);
            if path_constant > u8::MAX as u16 {
                self.error(
                    ErrorKind::Limit,
                    "Too many constants in one chunk for 'use'.",
                );
                return;
            }
            self.emit_op(OpCode::UseModule);
            self.emit_byte(path_constant as u8);
            self.emit_op(OpCode::FinishUse);
            self.emit_byte(names.len() as u8);
            for &name in &names {
                self.emit_byte(name as u8);
            }
            for &alias in &aliases {
                self.emit_byte(alias as u8);
            }
        }
    }

    fn identifier_like_constant(&mut self, text: &str) -> u16 {
        let string = self.heap.intern(text);
        self.make_constant(Value::Obj(string))
    }

    // --- expressions -------------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix_dispatch(self.parser.previous.kind, can_assign) {
            self.error(ErrorKind::Syntax, "Expected expression.");
            return;
        }
        while precedence <= self.infix_precedence(self.parser.current.kind) {
            self.advance();
            self.infix_dispatch(self.parser.previous.kind, can_assign);
        }
        if can_assign && self.match_token(TokenKind::Equal) {
            self.error(ErrorKind::Syntax, "Invalid assignment target.");
        }
    }

    fn prefix_dispatch(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        match kind {
            TokenKind::LeftParen => self.grouping(),
            TokenKind::LeftBracket => self.array_literal(),
            TokenKind::LeftBrace => self.table_literal(),
            TokenKind::Hash => self.static_literal(),
            TokenKind::Minus => self.unary(TokenKind::Minus),
            TokenKind::Bang => self.unary(TokenKind::Bang),
            TokenKind::Int => self.int_literal(),
            TokenKind::Float => self.float_literal(),
            TokenKind::String => self.string_literal(),
            TokenKind::Identifier => self.variable(can_assign),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::Typeof => self.typeof_expression(),
            TokenKind::Fn => self.function(FunctionKind::Anonymous),
            TokenKind::Match => self.match_expression(),
            _ => return false,
        }
        true
    }

    fn infix_dispatch(&mut self, kind: TokenKind, can_assign: bool) {
        match kind {
            TokenKind::LeftParen => self.call(),
            TokenKind::LeftBracket => self.index(can_assign),
            TokenKind::LeftBrace => self.struct_literal(),
            TokenKind::Dot => self.dot(can_assign),
            TokenKind::Question => self.emit_op(OpCode::Unwrap),
            TokenKind::And => self.and_expression(),
            TokenKind::Or => self.or_expression(),
            _ => self.binary(kind),
        }
    }

    fn infix_precedence(&self, kind: TokenKind) -> Precedence {
        match kind {
            TokenKind::Or => Precedence::Or,
            TokenKind::And => Precedence::And,
            TokenKind::EqualEqual | TokenKind::BangEqual => Precedence::Equality,
            TokenKind::Less
            | TokenKind::LessEqual
            | TokenKind::Greater
            | TokenKind::GreaterEqual => Precedence::Comparison,
            TokenKind::LeftShift | TokenKind::RightShift => Precedence::Shift,
            TokenKind::Plus | TokenKind::Minus => Precedence::Term,
            TokenKind::Star
            | TokenKind::Slash
            | TokenKind::BackSlash
            | TokenKind::Percent
            | TokenKind::StarStar => Precedence::Factor,
            TokenKind::LeftParen
            | TokenKind::LeftBracket
            | TokenKind::Dot
            | TokenKind::Question => Precedence::Call,
            TokenKind::LeftBrace if self.struct_literals_allowed => Precedence::Call,
            _ => Precedence::None,
        }
    }

    fn binary(&mut self, operator: TokenKind) {
        let precedence = self.infix_precedence(operator);
        self.parse_precedence(precedence.next());
        match operator {
            TokenKind::BangEqual => self.emit_op(OpCode::NotEqual),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => self.emit_op(OpCode::GreaterEqual),
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => self.emit_op(OpCode::LessEqual),
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::BackSlash => self.emit_op(OpCode::IntDivide),
            TokenKind::Percent => self.emit_op(OpCode::Modulus),
            TokenKind::StarStar => self.emit_op(OpCode::Power),
            TokenKind::LeftShift => self.emit_op(OpCode::LeftShift),
            TokenKind::RightShift => self.emit_op(OpCode::RightShift),
            _ => self.error(ErrorKind::Syntax, "Expected binary operator."),
        }
    }

    fn unary(&mut self, operator: TokenKind) {
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!("unary dispatch only sees '-' and '!'"),
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expected ')' after expression.");
    }

    fn typeof_expression(&mut self) {
        self.parse_precedence(Precedence::Unary);
        self.emit_op(OpCode::Typeof);
    }

    fn and_expression(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_expression(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn int_literal(&mut self) {
        let lexeme = self.parser.previous.lexeme;
        match lexeme.parse::<i32>() {
            Ok(value) => self.emit_constant(Value::Int(value)),
            // Too wide for an i32: promote the literal to a float.
            Err(_) => match lexeme.parse::<f64>() {
                Ok(value) => self.emit_constant(Value::Float(value)),
                Err(_) => self.error(ErrorKind::Syntax, "Invalid integer literal."),
            },
        }
    }

    fn float_literal(&mut self) {
        match self.parser.previous.lexeme.parse::<f64>() {
            Ok(value) => self.emit_constant(Value::Float(value)),
            Err(_) => self.error(ErrorKind::Syntax, "Invalid float literal."),
        }
    }

    /// Decodes a string token's escapes. Returns `None` (after reporting)
    /// on an unknown escape.
    fn string_contents(&mut self, token: Token<'src>) -> Option<String> {
        let raw = &token.lexeme[1..token.lexeme.len() - 1];
        let mut out = String::with_capacity(raw.len());
        let mut chars = raw.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('r') => out.push('\r'),
                Some('\\') => out.push('\\'),
                Some('"') => out.push('"'),
                Some('\'') => out.push('\''),
                Some('0') => out.push('\0'),
                Some('a') => out.push('\x07'),
                Some('b') => out.push('\x08'),
                Some('f') => out.push('\x0C'),
                Some('v') => out.push('\x0B'),
                _ => {
                    self.error_at(token, ErrorKind::Syntax, "Unknown escape sequence.");
                    return None;
                }
            }
        }
        Some(out)
    }

    fn string_literal(&mut self) {
        let token = self.parser.previous;
        if let Some(contents) = self.string_contents(token) {
            let string = self.heap.intern_owned(contents);
            self.emit_constant(Value::Obj(string));
        }
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.parser.previous.lexeme, can_assign);
    }

    fn compound_op(&mut self) -> Option<CompoundOp> {
        if self.match_token(TokenKind::PlusEqual) {
            Some(CompoundOp::Plus)
        } else if self.match_token(TokenKind::MinusEqual) {
            Some(CompoundOp::Minus)
        } else if self.match_token(TokenKind::StarEqual) {
            Some(CompoundOp::Star)
        } else if self.match_token(TokenKind::SlashEqual) {
            Some(CompoundOp::Slash)
        } else if self.match_token(TokenKind::BackSlashEqual) {
            Some(CompoundOp::IntDivide)
        } else if self.match_token(TokenKind::PercentEqual) {
            Some(CompoundOp::Modulus)
        } else {
            None
        }
    }

    fn named_variable(&mut self, name: &'src str, can_assign: bool) {
        let top = self.ctxs.len() - 1;

        if let Some(slot) = self.resolve_local(top, name) {
            if can_assign {
                if self.match_token(TokenKind::Equal) {
                    self.expression();
                    self.emit_op(OpCode::SetLocal);
                    self.emit_byte(slot);
                    return;
                }
                if let Some(op) = self.compound_op() {
                    self.expression();
                    self.emit_op(local_compound_opcode(op));
                    self.emit_byte(slot);
                    return;
                }
            }
            self.emit_op(OpCode::GetLocal);
            self.emit_byte(slot);
            return;
        }

        if let Some(slot) = self.resolve_upvalue(top, name) {
            if can_assign {
                if self.match_token(TokenKind::Equal) {
                    self.expression();
                    self.emit_op(OpCode::SetUpvalue);
                    self.emit_byte(slot);
                    return;
                }
                if let Some(op) = self.compound_op() {
                    self.expression();
                    self.emit_op(upvalue_compound_opcode(op));
                    self.emit_byte(slot);
                    return;
                }
            }
            self.emit_op(OpCode::GetUpvalue);
            self.emit_byte(slot);
            return;
        }

        let global = self.identifier_constant(name);
        if can_assign {
            if self.match_token(TokenKind::Equal) {
                self.expression();
                self.emit_const_op(OpCode::SetGlobal, OpCode::SetGlobal16, global);
                return;
            }
            if let Some(op) = self.compound_op() {
                if global <= u8::MAX as u16 {
                    self.expression();
                    self.emit_op(global_compound_opcode(op));
                    self.emit_byte(global as u8);
                } else {
                    // No 16-bit compound opcodes; lower to read-modify-write.
                    self.emit_op(OpCode::GetGlobal16);
                    self.emit_u16(global);
                    self.expression();
                    self.emit_op(compound_arithmetic_opcode(op));
                    self.emit_op(OpCode::SetGlobal16);
                    self.emit_u16(global);
                }
                return;
            }
        }
        self.emit_const_op(OpCode::GetGlobal, OpCode::GetGlobal16, global);
    }

    fn call(&mut self) {
        let arg_count = self.argument_list();
        self.emit_op(OpCode::Call);
        self.emit_byte(arg_count);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == MAX_FUNCTION_ARITY {
                    self.error(
                        ErrorKind::ArgumentExtent,
                        "Cannot have more than 255 arguments.",
                    );
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expected ')' after argument list.");
        count.min(MAX_FUNCTION_ARITY) as u8
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expected property name after '.'.");
        let name = self.identifier_constant(self.parser.previous.lexeme);

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_const_op(OpCode::SetProperty, OpCode::SetProperty16, name);
        } else if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.emit_const_op(OpCode::Invoke, OpCode::Invoke16, name);
            self.emit_byte(arg_count);
        } else {
            self.emit_const_op(OpCode::GetProperty, OpCode::GetProperty16, name);
        }
    }

    fn index(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightBracket, "Expected ']' after index.");
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::SetCollection);
        } else {
            self.emit_op(OpCode::GetCollection);
        }
    }

    fn array_literal(&mut self) {
        let count = self.expression_list(TokenKind::RightBracket, "Expected ']' after array elements.");
        self.emit_op(OpCode::Array);
        self.emit_u16(count);
    }

    fn expression_list(&mut self, terminator: TokenKind, message: &str) -> u16 {
        let mut count: usize = 0;
        if !self.check(terminator) {
            loop {
                self.expression();
                count += 1;
                if count > MAX_COLLECTION_ELEMENTS {
                    self.error(
                        ErrorKind::CollectionExtent,
                        "Too many elements in collection literal.",
                    );
                    break;
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
                if self.check(terminator) {
                    break; // trailing comma
                }
            }
        }
        self.consume(terminator, message);
        count.min(MAX_COLLECTION_ELEMENTS) as u16
    }

    fn table_literal(&mut self) {
        let count = self.table_entries();
        self.emit_op(OpCode::Table);
        self.emit_u16(count);
    }

    fn table_entries(&mut self) -> u16 {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightBrace) {
            loop {
                self.expression();
                self.consume(TokenKind::Colon, "Expected ':' after table key.");
                self.expression();
                count += 1;
                if count > MAX_COLLECTION_ELEMENTS {
                    self.error(
                        ErrorKind::CollectionExtent,
                        "Too many entries in table literal.",
                    );
                    break;
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
                if self.check(TokenKind::RightBrace) {
                    break; // trailing comma
                }
            }
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after table entries.");
        count.min(MAX_COLLECTION_ELEMENTS) as u16
    }

    /// `#[...]` and `#{...}`: frozen collection literals.
    fn static_literal(&mut self) {
        if self.match_token(TokenKind::LeftBracket) {
            let count =
                self.expression_list(TokenKind::RightBracket, "Expected ']' after array elements.");
            self.emit_op(OpCode::StaticArray);
            self.emit_u16(count);
        } else if self.match_token(TokenKind::LeftBrace) {
            let count = self.table_entries();
            self.emit_op(OpCode::StaticTable);
            self.emit_u16(count);
        } else {
            self.error_at_current(ErrorKind::Syntax, "Expected '[' or '{' after '#'.");
        }
    }

    /// Infix `{` after a struct value: `Point{x: 1, y: 2}`.
    fn struct_literal(&mut self) {
        self.emit_op(OpCode::StructInstanceStart);
        if !self.check(TokenKind::RightBrace) {
            loop {
                self.consume(TokenKind::Identifier, "Expected field name.");
                let name = self.identifier_constant(self.parser.previous.lexeme);
                self.consume(TokenKind::Colon, "Expected ':' after field name.");
                self.expression();
                self.emit_const_op(OpCode::StructNamedField, OpCode::StructNamedField16, name);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
                if self.check(TokenKind::RightBrace) {
                    break; // trailing comma
                }
            }
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after struct fields.");
        self.emit_op(OpCode::StructInstanceEnd);
    }

    // --- match -------------------------------------------------------------

    fn match_expression(&mut self) {
        if self.ctx().match_depth >= 1 {
            self.error(ErrorKind::Limit, "Cannot nest 'match' expressions.");
        }
        self.ctx_mut().match_depth += 1;
        let saved_ctx = self.ctx_mut().match_ctx.replace(MatchCtx::default());

        let allowed = std::mem::replace(&mut self.struct_literals_allowed, false);
        self.expression();
        self.struct_literals_allowed = allowed;
        self.emit_op(OpCode::Match);
        self.consume(TokenKind::LeftBrace, "Expected '{' after match target.");

        let mut has_default = false;
        let mut has_ok = false;
        let mut has_err = false;
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            if has_default {
                self.error_at_current(ErrorKind::Syntax, "'default' must be the last arm.");
                break;
            }
            if self.match_token(TokenKind::Default) {
                has_default = true;
                self.consume(TokenKind::FatArrow, "Expected '=>' after 'default'.");
                let base = self.ctx().locals.len();
                self.match_arm_body(base);
                self.emit_arm_exit();
            } else if self.match_token(TokenKind::OkKw) {
                has_ok = true;
                self.result_arm(OpCode::ResultMatchOk);
            } else if self.match_token(TokenKind::ErrKw) {
                has_err = true;
                self.result_arm(OpCode::ResultMatchErr);
            } else {
                let allowed = std::mem::replace(&mut self.struct_literals_allowed, false);
                self.expression();
                self.struct_literals_allowed = allowed;
                self.consume(TokenKind::FatArrow, "Expected '=>' after match pattern.");
                let else_jump = self.emit_jump(OpCode::MatchJump);
                let base = self.ctx().locals.len();
                self.match_arm_body(base);
                self.emit_arm_exit();
                self.patch_jump(else_jump);
            }
            self.match_token(TokenKind::Comma);
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after match arms.");

        let result_match = has_ok || has_err;
        if result_match {
            if !(has_ok && has_err) && !has_default {
                self.error(
                    ErrorKind::Syntax,
                    "A Result match requires both 'Ok' and 'Err' arms, or a 'default'.",
                );
            }
        } else if !has_default {
            self.error(ErrorKind::Syntax, "Match requires a 'default' arm.");
        }

        let match_ctx = std::mem::replace(&mut self.ctx_mut().match_ctx, saved_ctx);
        if let Some(ctx) = match_ctx {
            for jump in ctx.end_jumps {
                self.patch_jump(jump);
            }
        }
        self.emit_op(OpCode::MatchEnd);
        self.ctx_mut().match_depth -= 1;
    }

    fn result_arm(&mut self, test: OpCode) {
        if !self.match_bind_allowed {
            self.error(
                ErrorKind::Syntax,
                "'Ok'/'Err' binding arms are only allowed when the match is a statement or a top-level initializer.",
            );
        }
        self.consume(TokenKind::LeftParen, "Expected '(' after result arm.");
        self.consume(TokenKind::Identifier, "Expected binding name.");
        let bind_name = self.parser.previous.lexeme;
        self.consume(TokenKind::RightParen, "Expected ')' after binding name.");
        self.consume(TokenKind::FatArrow, "Expected '=>' after result pattern.");

        let else_jump = self.emit_jump(test);
        // On success the unwrapped payload was pushed; it becomes the
        // binding's slot for the arm body.
        self.begin_scope();
        let base = self.ctx().locals.len();
        self.add_local(bind_name);
        self.mark_initialized();
        let slot = base as u8;
        self.emit_op(OpCode::ResultBind);
        self.emit_byte(slot);

        // `give` unwinds down to `base`, popping the binding too; the
        // fall-through path pops it via the scope exit below instead.
        self.match_arm_body(base);

        self.end_scope();
        self.emit_arm_exit();
        self.patch_jump(else_jump);
    }

    /// Compiles one arm body. Expression arms give their value implicitly;
    /// block arms fall through unless they `give`.
    fn match_arm_body(&mut self, locals_base: usize) {
        if let Some(match_ctx) = self.ctx_mut().match_ctx.as_mut() {
            match_ctx.arm_locals_base = locals_base;
        }
        if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression();
            self.emit_op(OpCode::Give);
        }
    }

    /// The jump a completed arm takes to the end of the match.
    fn emit_arm_exit(&mut self) {
        let jump = self.emit_jump(OpCode::Jump);
        if let Some(match_ctx) = self.ctx_mut().match_ctx.as_mut() {
            match_ctx.end_jumps.push(jump);
        }
    }
}

fn local_compound_opcode(op: CompoundOp) -> OpCode {
    match op {
        CompoundOp::Plus => OpCode::SetLocalPlus,
        CompoundOp::Minus => OpCode::SetLocalMinus,
        CompoundOp::Star => OpCode::SetLocalStar,
        CompoundOp::Slash => OpCode::SetLocalSlash,
        CompoundOp::IntDivide => OpCode::SetLocalIntDivide,
        CompoundOp::Modulus => OpCode::SetLocalModulus,
    }
}

fn upvalue_compound_opcode(op: CompoundOp) -> OpCode {
    match op {
        CompoundOp::Plus => OpCode::SetUpvaluePlus,
        CompoundOp::Minus => OpCode::SetUpvalueMinus,
        CompoundOp::Star => OpCode::SetUpvalueStar,
        CompoundOp::Slash => OpCode::SetUpvalueSlash,
        CompoundOp::IntDivide => OpCode::SetUpvalueIntDivide,
        CompoundOp::Modulus => OpCode::SetUpvalueModulus,
    }
}

fn global_compound_opcode(op: CompoundOp) -> OpCode {
    match op {
        CompoundOp::Plus => OpCode::SetGlobalPlus,
        CompoundOp::Minus => OpCode::SetGlobalMinus,
        CompoundOp::Star => OpCode::SetGlobalStar,
        CompoundOp::Slash => OpCode::SetGlobalSlash,
        CompoundOp::IntDivide => OpCode::SetGlobalIntDivide,
        CompoundOp::Modulus => OpCode::SetGlobalModulus,
    }
}

fn compound_arithmetic_opcode(op: CompoundOp) -> OpCode {
    match op {
        CompoundOp::Plus => OpCode::Add,
        CompoundOp::Minus => OpCode::Subtract,
        CompoundOp::Star => OpCode::Multiply,
        CompoundOp::Slash => OpCode::Divide,
        CompoundOp::IntDivide => OpCode::IntDivide,
        CompoundOp::Modulus => OpCode::Modulus,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crux_core::object::ModuleRecord;

    fn compile_source(source: &str) -> (Heap, Result<ObjRef, Vec<CompileError>>) {
        let mut heap = Heap::new();
        let module = heap.allocate(Object::Module(ModuleRecord::new(None, false, true)));
        let result = compile(&mut heap, source, module);
        (heap, result)
    }

    fn ops_of(heap: &Heap, function: ObjRef) -> Vec<OpCode> {
        let chunk = &heap.function(function).chunk;
        let mut out = Vec::new();
        let mut ip = 0;
        while ip < chunk.code.len() {
            let op = OpCode::from_byte(chunk.code[ip]).expect("valid opcode");
            out.push(op);
            ip += 1 + operand_width(heap, chunk, op, ip + 1);
        }
        out
    }

    fn operand_width(heap: &Heap, chunk: &Chunk, op: OpCode, operand_at: usize) -> usize {
        match op {
            OpCode::Constant
            | OpCode::DefineGlobal
            | OpCode::GetGlobal
            | OpCode::SetGlobal
            | OpCode::GetLocal
            | OpCode::SetLocal
            | OpCode::GetUpvalue
            | OpCode::SetUpvalue
            | OpCode::Call
            | OpCode::GetProperty
            | OpCode::SetProperty
            | OpCode::SetLocalSlash
            | OpCode::SetLocalStar
            | OpCode::SetLocalPlus
            | OpCode::SetLocalMinus
            | OpCode::SetLocalIntDivide
            | OpCode::SetLocalModulus
            | OpCode::SetUpvalueSlash
            | OpCode::SetUpvalueStar
            | OpCode::SetUpvaluePlus
            | OpCode::SetUpvalueMinus
            | OpCode::SetUpvalueIntDivide
            | OpCode::SetUpvalueModulus
            | OpCode::SetGlobalSlash
            | OpCode::SetGlobalStar
            | OpCode::SetGlobalPlus
            | OpCode::SetGlobalMinus
            | OpCode::SetGlobalIntDivide
            | OpCode::SetGlobalModulus
            | OpCode::Struct
            | OpCode::StructNamedField
            | OpCode::UseModule
            | OpCode::ResultBind => 1,
            OpCode::Jump
            | OpCode::JumpIfFalse
            | OpCode::Loop
            | OpCode::MatchJump
            | OpCode::ResultMatchOk
            | OpCode::ResultMatchErr
            | OpCode::Array
            | OpCode::Table
            | OpCode::StaticArray
            | OpCode::StaticTable
            | OpCode::Constant16
            | OpCode::DefineGlobal16
            | OpCode::GetGlobal16
            | OpCode::SetGlobal16
            | OpCode::GetProperty16
            | OpCode::SetProperty16
            | OpCode::Struct16
            | OpCode::StructNamedField16 => 2,
            OpCode::Invoke => 2,
            OpCode::Invoke16 => 3,
            OpCode::Closure | OpCode::AnonFunction => {
                let index = chunk.code[operand_at] as usize;
                let function = match chunk.constants[index] {
                    Value::Obj(r) => r,
                    _ => panic!("closure constant must be a function"),
                };
                1 + 2 * heap.function(function).upvalue_count as usize
            }
            OpCode::AnonFunction16 => {
                let index =
                    ((chunk.code[operand_at] as usize) << 8) | chunk.code[operand_at + 1] as usize;
                let function = match chunk.constants[index] {
                    Value::Obj(r) => r,
                    _ => panic!("closure constant must be a function"),
                };
                2 + 2 * heap.function(function).upvalue_count as usize
            }
            OpCode::UseNative | OpCode::FinishUse => {
                let count = chunk.code[operand_at] as usize;
                if op == OpCode::UseNative {
                    1 + 2 * count + 1
                } else {
                    1 + 2 * count
                }
            }
            _ => 0,
        }
    }

    #[test]
    fn test_simple_arithmetic_statement() {
        let (heap, result) = compile_source("let a = 1 + 2;");
        let function = result.expect("compiles");
        let ops = ops_of(&heap, function);
        assert_eq!(
            ops,
            vec![
                OpCode::Constant,
                OpCode::Constant,
                OpCode::Add,
                OpCode::DefineGlobal,
                OpCode::NilReturn,
            ]
        );
    }

    #[test]
    fn test_pub_emits_marker_before_define() {
        let (heap, result) = compile_source("pub let answer = 42;");
        let function = result.expect("compiles");
        let ops = ops_of(&heap, function);
        assert_eq!(
            ops,
            vec![
                OpCode::Constant,
                OpCode::Pub,
                OpCode::DefineGlobal,
                OpCode::NilReturn,
            ]
        );
    }

    #[test]
    fn test_compound_assignment_opcodes() {
        let (heap, result) = compile_source("let x = 1; { let y = 2; y += 3; y \\= 2; }");
        let function = result.expect("compiles");
        let ops = ops_of(&heap, function);
        assert!(ops.contains(&OpCode::SetLocalPlus));
        assert!(ops.contains(&OpCode::SetLocalIntDivide));
    }

    #[test]
    fn test_global_compound_assignment() {
        let (heap, result) = compile_source("let x = 1; x %= 2;");
        let function = result.expect("compiles");
        let ops = ops_of(&heap, function);
        assert!(ops.contains(&OpCode::SetGlobalModulus));
    }

    #[test]
    fn test_closure_captures_local() {
        let source = "fn outer() { let x = 1; fn inner() { return x; } return inner; }";
        let (heap, result) = compile_source(source);
        let function = result.expect("compiles");
        let ops = ops_of(&heap, function);
        assert!(ops.contains(&OpCode::Closure));
    }

    #[test]
    fn test_match_requires_default() {
        let (_, result) = compile_source("let x = 1; match x { 1 => 2 };");
        assert!(result.is_err());
    }

    #[test]
    fn test_match_with_default_compiles() {
        let (heap, result) = compile_source("let x = 1; match x { 1 => 2, default => 3 };");
        let function = result.expect("compiles");
        let ops = ops_of(&heap, function);
        assert!(ops.contains(&OpCode::Match));
        assert!(ops.contains(&OpCode::MatchJump));
        assert!(ops.contains(&OpCode::Give));
        assert!(ops.contains(&OpCode::MatchEnd));
    }

    #[test]
    fn test_result_match_requires_both_arms() {
        let (_, result) = compile_source("let r = nil; match r { Ok(v) => v };");
        assert!(result.is_err());
        let (_, result) =
            compile_source("let r = nil; match r { Ok(v) => v, Err(e) => e };");
        assert!(result.is_ok());
    }

    #[test]
    fn test_nested_match_is_rejected() {
        let source = "let x = 1; match x { default => match x { default => 1 } };";
        let (_, result) = compile_source(source);
        assert!(result.is_err());
    }

    #[test]
    fn test_match_in_function_inside_arm_is_allowed() {
        let source =
            "let x = 1; match x { default => fn() { match x { default => 1 }; } };";
        let (_, result) = compile_source(source);
        assert!(result.is_ok());
    }

    #[test]
    fn test_unknown_escape_is_error() {
        let (_, result) = compile_source("let s = \"bad \\q escape\";");
        assert!(result.is_err());
    }

    #[test]
    fn test_escapes_decode() {
        let (heap, result) = compile_source("let s = \"a\\n\\tb\";");
        let function = result.expect("compiles");
        let strings: Vec<&str> = heap
            .function(function)
            .chunk
            .constants
            .iter()
            .filter_map(|v| v.as_obj())
            .filter_map(|r| match heap.get(r) {
                Object::String(s) => Some(&*s.chars),
                _ => None,
            })
            .collect();
        assert!(strings.contains(&"a\n\tb"));
    }

    #[test]
    fn test_local_redefinition_rejected() {
        let (_, result) = compile_source("{ let a = 1; let a = 2; }");
        assert!(result.is_err());
    }

    #[test]
    fn test_reading_local_in_own_initializer_rejected() {
        let (_, result) = compile_source("{ let a = 1; { let a = a; } }");
        assert!(result.is_err());
    }

    #[test]
    fn test_too_many_locals() {
        let mut source = String::from("{\n");
        for i in 0..256 {
            source.push_str(&format!("let v{} = {};\n", i, i));
        }
        source.push('}');
        let (_, result) = compile_source(&source);
        assert!(result.is_err());
    }

    #[test]
    fn test_return_outside_function_rejected() {
        let (_, result) = compile_source("return 1;");
        assert!(result.is_err());
    }

    #[test]
    fn test_give_outside_match_rejected() {
        let (_, result) = compile_source("give 1;");
        assert!(result.is_err());
    }

    #[test]
    fn test_use_emits_module_ops() {
        let (heap, result) = compile_source("use helper, extra as more from \"./lib.crux\";");
        let function = result.expect("compiles");
        let ops = ops_of(&heap, function);
        assert_eq!(
            ops,
            vec![OpCode::UseModule, OpCode::FinishUse, OpCode::NilReturn]
        );
    }

    #[test]
    fn test_use_native_path() {
        let (heap, result) = compile_source("use sqrt from \"crux:math\";");
        let function = result.expect("compiles");
        let ops = ops_of(&heap, function);
        assert_eq!(ops, vec![OpCode::UseNative, OpCode::NilReturn]);
    }

    #[test]
    fn test_struct_declaration_and_literal() {
        let source = "struct Point { x, y } let p = Point{x: 1, y: 2};";
        let (heap, result) = compile_source(source);
        let function = result.expect("compiles");
        let ops = ops_of(&heap, function);
        assert!(ops.contains(&OpCode::Struct));
        assert!(ops.contains(&OpCode::StructInstanceStart));
        assert!(ops.contains(&OpCode::StructNamedField));
        assert!(ops.contains(&OpCode::StructInstanceEnd));
    }

    #[test]
    fn test_static_literals() {
        let (heap, result) = compile_source("let a = #[1, 2]; let t = #{1: 2};");
        let function = result.expect("compiles");
        let ops = ops_of(&heap, function);
        assert!(ops.contains(&OpCode::StaticArray));
        assert!(ops.contains(&OpCode::StaticTable));
    }

    #[test]
    fn test_unwrap_postfix() {
        let (heap, result) = compile_source("let r = nil; let v = r?;");
        let function = result.expect("compiles");
        let ops = ops_of(&heap, function);
        assert!(ops.contains(&OpCode::Unwrap));
    }

    #[test]
    fn test_wide_constant_pool_uses_16_bit_ops() {
        // Force more than 256 distinct constants in one chunk.
        let mut source = String::new();
        for i in 0..300 {
            source.push_str(&format!("let g{} = {}.5;\n", i, i));
        }
        let (heap, result) = compile_source(&source);
        let function = result.expect("compiles");
        let ops = ops_of(&heap, function);
        assert!(ops.contains(&OpCode::Constant16));
        assert!(ops.contains(&OpCode::DefineGlobal16));
    }

    #[test]
    fn test_error_reports_line() {
        let (_, result) = compile_source("let a = 1;\nlet b = ;\n");
        let errors = result.expect_err("should fail");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].line, 2);
    }

    #[test]
    fn test_synchronize_reports_later_errors() {
        let (_, result) = compile_source("let a = ;\nlet b = ;\n");
        let errors = result.expect_err("should fail");
        assert_eq!(errors.len(), 2);
    }
}
