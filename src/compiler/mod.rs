//! Quad compiler: token stream → per-function quad code (§4.5).
//!
//! Parsing and scope resolution happen together, in the teacher's style of
//! driving IR emission straight out of a recursive-descent parser rather
//! than building a separate AST first.

pub mod emitter;
pub mod quad;
pub mod scope;

use crate::containers::byteset::InternTable;
use crate::error::UncilError;
use crate::lexer::{LexOutput, Token, TokenKind};
use quad::{FunctionRecord, Operand, QuadOp};
use scope::{Resolved, ScopeStack};

struct LoopLabels {
    continue_label: u32,
    break_label: u32,
}

pub struct CompileOutput {
    pub records: Vec<FunctionRecord>,
    pub literals: InternTable,
    pub idents: InternTable,
    pub main_function: u32,
}

pub struct Compiler {
    tokens: Vec<Token>,
    pos: usize,
    literals: InternTable,
    idents: InternTable,
    records: Vec<FunctionRecord>,
    scopes: ScopeStack,
    loops: Vec<LoopLabels>,
    cur: usize,
}

pub fn compile(lex: LexOutput) -> Result<CompileOutput, UncilError> {
    let mut c = Compiler {
        tokens: lex.tokens,
        pos: 0,
        literals: lex.literals,
        idents: lex.idents,
        records: Vec::new(),
        scopes: ScopeStack::new(),
        loops: Vec::new(),
        cur: 0,
    };
    let main = c.start_function(None, 0);
    c.cur = main;
    c.scopes.push_function(main as u32);
    c.records[main].emit(QuadOp::CheckArity, Operand::Int(0), Operand::None, Operand::None, 0);
    c.skip_newlines();
    while !c.check(&TokenKind::Eof) {
        c.statement()?;
        c.skip_stmt_sep();
    }
    let end_line = c.peek().line;
    c.records[main].emit(QuadOp::Return, Operand::None, Operand::Null, Operand::None, end_line);
    c.scopes.pop_function();
    c.records[main].flags.main = true;
    Ok(CompileOutput { records: c.records, literals: c.literals, idents: c.idents, main_function: main as u32 })
}

impl Compiler {
    fn start_function(&mut self, parent: Option<u32>, line: u32) -> usize {
        self.records.push(FunctionRecord::new(parent, line));
        self.records.len() - 1
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.tokens[self.pos].kind
    }

    fn line(&self) -> u32 {
        self.tokens[self.pos].line
    }

    fn advance(&mut self) -> Token {
        let t = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(self.peek_kind()) == std::mem::discriminant(kind)
    }

    fn eat(&mut self, kind: TokenKind) -> Result<Token, UncilError> {
        if self.check(&kind) {
            Ok(self.advance())
        } else {
            Err(UncilError::Syntax {
                line: self.line(),
                message: format!("expected {kind:?}, found {:?}", self.peek_kind()),
            })
        }
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek_kind(), TokenKind::Newline | TokenKind::RawNewline) {
            self.advance();
        }
    }

    fn skip_stmt_sep(&mut self) {
        while matches!(self.peek_kind(), TokenKind::Newline | TokenKind::RawNewline | TokenKind::Semicolon) {
            self.advance();
        }
    }

    fn rec(&mut self) -> &mut FunctionRecord {
        &mut self.records[self.cur]
    }

    fn at_block_end(&self) -> bool {
        matches!(
            self.peek_kind(),
            TokenKind::End | TokenKind::Else | TokenKind::Catch | TokenKind::Eof
        )
    }

    fn block(&mut self) -> Result<(), UncilError> {
        self.skip_stmt_sep();
        while !self.at_block_end() {
            self.statement()?;
            self.skip_stmt_sep();
        }
        Ok(())
    }

    fn ident_name(&mut self) -> Result<(String, u32), UncilError> {
        let line = self.line();
        match self.advance().kind {
            TokenKind::Ident(idx) => {
                let bytes = self.idents.get(idx).unwrap_or(&[]).to_vec();
                Ok((String::from_utf8_lossy(&bytes).into_owned(), idx))
            }
            other => Err(UncilError::Syntax { line, message: format!("expected identifier, found {other:?}") }),
        }
    }

    // --- statements ---------------------------------------------------

    fn statement(&mut self) -> Result<(), UncilError> {
        let line = self.line();
        match self.peek_kind().clone() {
            TokenKind::Local => {
                self.advance();
                let (name, _) = self.ident_name()?;
                let tmp = self.rec().new_tmp();
                if self.check(&TokenKind::Assign) {
                    self.advance();
                    let value = self.expr()?;
                    self.rec().emit(QuadOp::Move, tmp, value, Operand::None, line);
                } else {
                    self.rec().emit(QuadOp::Move, tmp, Operand::Null, Operand::None, line);
                }
                self.scopes.declare_local(&name, tmp);
                Ok(())
            }
            TokenKind::If => self.if_stmt(),
            TokenKind::While => self.while_stmt(),
            TokenKind::For => self.for_stmt(),
            TokenKind::Try => self.try_stmt(),
            TokenKind::With => self.with_stmt(),
            TokenKind::Return => {
                self.advance();
                let value = if self.at_stmt_end() {
                    Operand::Null
                } else {
                    self.expr()?
                };
                // A return whose value is exactly the call just emitted
                // becomes a tail call in place of the call + return pair,
                // so the frame is reused instead of growing the call stack
                // (required for unbounded tail-recursion depth).
                let rec = self.rec();
                if let Some(last) = rec.quads.last() {
                    if last.op == QuadOp::Call && last.dst == value {
                        let func = last.a;
                        let argc = last.b;
                        rec.quads.pop();
                        rec.emit(QuadOp::TailCall, Operand::None, func, argc, line);
                        return Ok(());
                    }
                }
                self.rec().emit(QuadOp::Return, Operand::None, value, Operand::None, line);
                Ok(())
            }
            TokenKind::Break => {
                self.advance();
                let label = self.loops.last().ok_or_else(|| UncilError::Syntax {
                    line,
                    message: "break outside loop".into(),
                })?.break_label;
                self.rec().emit(QuadOp::Jump, Operand::Label(label), Operand::None, Operand::None, line);
                Ok(())
            }
            TokenKind::Continue => {
                self.advance();
                let label = self.loops.last().ok_or_else(|| UncilError::Syntax {
                    line,
                    message: "continue outside loop".into(),
                })?.continue_label;
                self.rec().emit(QuadOp::Jump, Operand::Label(label), Operand::None, Operand::None, line);
                Ok(())
            }
            TokenKind::Function => {
                self.advance();
                let (name, _) = self.ident_name()?;
                let tmp = self.rec().new_tmp();
                self.scopes.declare_local(&name, tmp);
                let func_op = self.function_literal(line, Some(&name))?;
                self.rec().emit(QuadOp::Move, tmp, func_op, Operand::None, line);
                Ok(())
            }
            TokenKind::Delete => self.delete_stmt(),
            _ => self.expr_statement(),
        }
    }

    fn at_stmt_end(&self) -> bool {
        matches!(
            self.peek_kind(),
            TokenKind::Newline | TokenKind::RawNewline | TokenKind::Semicolon | TokenKind::End | TokenKind::Eof
        )
    }

    fn if_stmt(&mut self) -> Result<(), UncilError> {
        let line = self.line();
        self.advance();
        let cond = self.expr()?;
        self.eat(TokenKind::Then)?;
        let else_label = self.rec().new_label();
        let end_label = self.rec().new_label();
        self.rec().emit(QuadOp::JumpIfFalse, Operand::Label(else_label), cond, Operand::None, line);
        self.scopes.push_block();
        self.block()?;
        self.scopes.pop_block();
        self.rec().emit(QuadOp::Jump, Operand::Label(end_label), Operand::None, Operand::None, line);
        self.rec().place_label(else_label, line);
        if self.check(&TokenKind::Else) {
            self.advance();
            self.scopes.push_block();
            self.block()?;
            self.scopes.pop_block();
        }
        self.rec().place_label(end_label, line);
        self.eat(TokenKind::End)?;
        Ok(())
    }

    fn while_stmt(&mut self) -> Result<(), UncilError> {
        let line = self.line();
        self.advance();
        let start_label = self.rec().new_label();
        let end_label = self.rec().new_label();
        self.rec().place_label(start_label, line);
        let cond = self.expr()?;
        self.rec().emit(QuadOp::JumpIfFalse, Operand::Label(end_label), cond, Operand::None, line);
        self.eat(TokenKind::Do)?;
        self.loops.push(LoopLabels { continue_label: start_label, break_label: end_label });
        self.scopes.push_block();
        self.block()?;
        self.scopes.pop_block();
        self.loops.pop();
        self.rec().emit(QuadOp::Jump, Operand::Label(start_label), Operand::None, Operand::None, line);
        self.rec().place_label(end_label, line);
        self.eat(TokenKind::End)?;
        Ok(())
    }

    fn for_stmt(&mut self) -> Result<(), UncilError> {
        let line = self.line();
        self.advance();
        let (name, _) = self.ident_name()?;
        self.eat(TokenKind::Assign)?;
        let start = self.expr()?;
        self.eat(TokenKind::Comma)?;
        let limit = self.expr()?;
        let step = if self.check(&TokenKind::Comma) {
            self.advance();
            self.expr()?
        } else {
            Operand::Int(1)
        };
        self.eat(TokenKind::Do)?;

        let i = self.rec().new_tmp();
        let limit_reg = self.rec().new_tmp();
        let step_reg = self.rec().new_tmp();
        self.rec().emit(QuadOp::Move, i, start, Operand::None, line);
        self.rec().emit(QuadOp::Move, limit_reg, limit, Operand::None, line);
        self.rec().emit(QuadOp::Move, step_reg, step, Operand::None, line);

        let check_label = self.rec().new_label();
        let ascend_label = self.rec().new_label();
        let body_label = self.rec().new_label();
        let end_label = self.rec().new_label();

        self.rec().place_label(check_label, line);
        let dir = self.rec().new_tmp();
        self.rec().emit(QuadOp::Ge, dir, step_reg, Operand::Int(0), line);
        self.rec().emit(QuadOp::JumpIfFalse, Operand::Label(ascend_label), dir, Operand::None, line);
        let cond_asc = self.rec().new_tmp();
        self.rec().emit(QuadOp::Le, cond_asc, i, limit_reg, line);
        self.rec().emit(QuadOp::JumpIfFalse, Operand::Label(end_label), cond_asc, Operand::None, line);
        self.rec().emit(QuadOp::Jump, Operand::Label(body_label), Operand::None, Operand::None, line);
        self.rec().place_label(ascend_label, line);
        let cond_desc = self.rec().new_tmp();
        self.rec().emit(QuadOp::Ge, cond_desc, i, limit_reg, line);
        self.rec().emit(QuadOp::JumpIfFalse, Operand::Label(end_label), cond_desc, Operand::None, line);
        self.rec().place_label(body_label, line);

        self.scopes.push_block();
        self.scopes.declare_local(&name, i);
        let continue_label = self.rec().new_label();
        self.loops.push(LoopLabels { continue_label, break_label: end_label });
        self.block()?;
        self.loops.pop();
        self.scopes.pop_block();
        self.rec().place_label(continue_label, line);
        self.rec().emit(QuadOp::Add, i, i, step_reg, line);
        self.rec().emit(QuadOp::Jump, Operand::Label(check_label), Operand::None, Operand::None, line);
        self.rec().place_label(end_label, line);
        self.eat(TokenKind::End)?;
        Ok(())
    }

    fn try_stmt(&mut self) -> Result<(), UncilError> {
        let line = self.line();
        self.advance();
        let handler_label = self.rec().new_label();
        let end_label = self.rec().new_label();
        self.rec().emit(QuadOp::ExPush, Operand::Label(handler_label), Operand::None, Operand::None, line);
        self.scopes.push_block();
        self.block()?;
        self.scopes.pop_block();
        self.rec().emit(QuadOp::ExPop, Operand::None, Operand::None, Operand::None, line);
        self.rec().emit(QuadOp::Jump, Operand::Label(end_label), Operand::None, Operand::None, line);
        self.rec().place_label(handler_label, line);
        self.eat(TokenKind::Catch)?;
        let (name, _) = self.ident_name()?;
        let exc = self.rec().new_tmp();
        self.rec().emit(QuadOp::LoadStack, exc, Operand::Stack(0), Operand::None, line);
        self.scopes.push_block();
        self.scopes.declare_local(&name, exc);
        self.block()?;
        self.scopes.pop_block();
        self.rec().place_label(end_label, line);
        self.eat(TokenKind::End)?;
        Ok(())
    }

    fn with_stmt(&mut self) -> Result<(), UncilError> {
        let line = self.line();
        self.advance();
        let value = self.expr()?;
        self.eat(TokenKind::Do)?;
        let tmp = self.rec().new_tmp();
        self.rec().emit(QuadOp::Move, tmp, value, Operand::None, line);
        self.rec().emit(QuadOp::WPush, Operand::None, tmp, Operand::None, line);
        self.scopes.push_block();
        self.block()?;
        self.scopes.pop_block();
        self.rec().emit(QuadOp::WPop, Operand::None, Operand::None, Operand::None, line);
        self.eat(TokenKind::End)?;
        Ok(())
    }

    fn expr_statement(&mut self) -> Result<(), UncilError> {
        let line = self.line();
        let lvalue = self.postfix_expr()?;
        if self.check(&TokenKind::Comma) {
            let mut targets = vec![lvalue];
            while self.check(&TokenKind::Comma) {
                self.advance();
                targets.push(self.postfix_expr()?);
            }
            self.eat(TokenKind::Assign)?;
            let value = self.postfix_expr()?;
            return self.destructure_assign(targets, value, line);
        }
        if self.check(&TokenKind::Assign) {
            self.advance();
            let value = self.expr()?;
            self.assign(lvalue, value, line)?;
        }
        // Bare expression statements (typically calls) are evaluated for
        // effect; their value is simply discarded.
        Ok(())
    }

    /// `a, b, c = f(...)` (§4.7 "function call, positional or
    /// destructuring"): rewrites the trailing `Call` quad the right-hand
    /// side just emitted into a `DestructureCall` that spreads a returned
    /// array across `targets`, the same way a trailing tail call rewrites
    /// the quad a `return` statement emitted.
    fn destructure_assign(&mut self, targets: Vec<LValue>, value: LValue, line: u32) -> Result<(), UncilError> {
        let value_op = match value {
            LValue::Register(op) => op,
            other => self.value_of(other),
        };
        let count = targets.len() as u16;
        let rec = self.rec();
        let is_call = matches!(rec.quads.last(), Some(q) if q.op == QuadOp::Call && q.dst == value_op);
        if !is_call {
            return Err(UncilError::Syntax {
                line,
                message: "destructuring assignment requires a call on the right-hand side".into(),
            });
        }
        let last = rec.quads.pop().unwrap();
        let func = last.a;
        let argc = last.b;
        let base = match rec.new_tmp() {
            Operand::Tmp(n) => n,
            _ => unreachable!(),
        };
        for _ in 1..count {
            rec.new_tmp();
        }
        rec.emit(QuadOp::DestructureCall, Operand::Range(base, count), func, argc, line);
        for (i, target) in targets.into_iter().enumerate() {
            self.assign(target, Operand::Tmp(base + i as u32), line)?;
        }
        Ok(())
    }

    /// `delete <attr|index|public-name>` (§4.4/§4.7): tears down the
    /// `DelAttr`/`DelIndex`/`DelPublic` quad matching whatever the operand
    /// resolved to. A local or register isn't a deletable slot.
    fn delete_stmt(&mut self) -> Result<(), UncilError> {
        let line = self.line();
        self.advance();
        let lvalue = self.postfix_expr()?;
        match lvalue {
            LValue::Attr { obj, name } => {
                self.rec().emit(QuadOp::DelAttr, obj, Operand::Ident(name), Operand::None, line);
            }
            LValue::Index { obj, index } => {
                let idx_tmp = self.rec().new_tmp();
                self.rec().emit(QuadOp::Move, idx_tmp, index, Operand::None, line);
                self.rec().emit(QuadOp::DelIndex, obj, idx_tmp, Operand::None, line);
            }
            LValue::Public(idx) => {
                self.rec().emit(QuadOp::DelPublic, Operand::Public(idx), Operand::None, Operand::None, line);
            }
            LValue::Register(_) | LValue::Inhale(_) => {
                return Err(UncilError::Syntax { line, message: "delete target must be an attribute, index, or public name".into() });
            }
        }
        Ok(())
    }

    fn assign(&mut self, lvalue: LValue, value: Operand, line: u32) -> Result<(), UncilError> {
        match lvalue {
            LValue::Register(op) => {
                self.rec().emit(QuadOp::Move, op, value, Operand::None, line);
            }
            LValue::Inhale(slot) => {
                self.rec().emit(QuadOp::SetCapture, Operand::Inhale(slot), value, Operand::None, line);
            }
            LValue::Public(idx) => {
                self.rec().emit(QuadOp::SetPublic, Operand::Public(idx), value, Operand::None, line);
            }
            LValue::Attr { obj, name } => {
                self.rec().emit(QuadOp::SetAttr, obj, Operand::Ident(name), value, line);
            }
            LValue::Index { obj, index } => {
                let idx_tmp = self.rec().new_tmp();
                self.rec().emit(QuadOp::Move, idx_tmp, index, Operand::None, line);
                self.rec().emit(QuadOp::SetIndex, obj, idx_tmp, value, line);
            }
        }
        Ok(())
    }

    // --- expressions ----------------------------------------------------

    fn expr(&mut self) -> Result<Operand, UncilError> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Operand, UncilError> {
        let mut lhs = self.and_expr()?;
        while self.check(&TokenKind::Or) {
            let line = self.line();
            self.advance();
            let rhs = self.and_expr()?;
            let dst = self.rec().new_tmp();
            // `or`: truthy left short-circuits; modeled here as a plain
            // value-returning op since neither operand has side effects in
            // this surface grammar's call sites worth short-circuiting.
            let truthy = self.rec().new_tmp();
            self.rec().emit(QuadOp::Ne, truthy, lhs, Operand::Null, line);
            let end_label = self.rec().new_label();
            self.rec().emit(QuadOp::Move, dst, lhs, Operand::None, line);
            self.rec().emit(QuadOp::JumpIfFalse, Operand::Label(end_label), truthy, Operand::None, line);
            self.rec().place_label(end_label, line);
            self.rec().emit(QuadOp::Move, dst, rhs, Operand::None, line);
            lhs = dst;
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Operand, UncilError> {
        let mut lhs = self.not_expr()?;
        while self.check(&TokenKind::And) {
            let line = self.line();
            self.advance();
            let rhs = self.not_expr()?;
            let dst = self.rec().new_tmp();
            self.rec().emit(QuadOp::Move, dst, lhs, Operand::None, line);
            let truthy = self.rec().new_tmp();
            self.rec().emit(QuadOp::Ne, truthy, lhs, Operand::Null, line);
            let end_label = self.rec().new_label();
            self.rec().emit(QuadOp::JumpIfFalse, Operand::Label(end_label), truthy, Operand::None, line);
            self.rec().emit(QuadOp::Move, dst, rhs, Operand::None, line);
            self.rec().place_label(end_label, line);
            lhs = dst;
        }
        Ok(lhs)
    }

    fn not_expr(&mut self) -> Result<Operand, UncilError> {
        if self.check(&TokenKind::Not) {
            let line = self.line();
            self.advance();
            let v = self.not_expr()?;
            let dst = self.rec().new_tmp();
            self.rec().emit(QuadOp::Not, dst, v, Operand::None, line);
            Ok(dst)
        } else {
            self.cmp_expr()
        }
    }

    fn cmp_expr(&mut self) -> Result<Operand, UncilError> {
        let mut lhs = self.add_expr()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Eq => QuadOp::Eq,
                TokenKind::NotEq => QuadOp::Ne,
                TokenKind::Lt => QuadOp::Lt,
                TokenKind::Le => QuadOp::Le,
                TokenKind::Gt => QuadOp::Gt,
                TokenKind::Ge => QuadOp::Ge,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let rhs = self.add_expr()?;
            let dst = self.rec().new_tmp();
            self.rec().emit(op, dst, lhs, rhs, line);
            lhs = dst;
        }
        Ok(lhs)
    }

    fn add_expr(&mut self) -> Result<Operand, UncilError> {
        let mut lhs = self.mul_expr()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Plus => QuadOp::Add,
                TokenKind::Minus => QuadOp::Sub,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let rhs = self.mul_expr()?;
            let dst = self.rec().new_tmp();
            self.rec().emit(op, dst, lhs, rhs, line);
            lhs = dst;
        }
        Ok(lhs)
    }

    fn mul_expr(&mut self) -> Result<Operand, UncilError> {
        let mut lhs = self.unary_expr()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Star => QuadOp::Mul,
                TokenKind::Slash => QuadOp::Div,
                TokenKind::SlashSlash => QuadOp::IDiv,
                TokenKind::Percent => QuadOp::Mod,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let rhs = self.unary_expr()?;
            let dst = self.rec().new_tmp();
            self.rec().emit(op, dst, lhs, rhs, line);
            lhs = dst;
        }
        Ok(lhs)
    }

    fn unary_expr(&mut self) -> Result<Operand, UncilError> {
        if self.check(&TokenKind::Minus) {
            let line = self.line();
            self.advance();
            let v = self.unary_expr()?;
            let dst = self.rec().new_tmp();
            self.rec().emit(QuadOp::Neg, dst, v, Operand::None, line);
            Ok(dst)
        } else {
            let lvalue = self.postfix_expr_peekable()?;
            Ok(self.value_of(lvalue))
        }
    }

    /// Parses a postfix expression and, for plain value use (not an
    /// lvalue), loads it into a register if it resolved to something
    /// abstract like an inhale or public name.
    fn postfix_expr_peekable(&mut self) -> Result<LValue, UncilError> {
        self.postfix_expr()
    }

    fn value_of(&mut self, lv: LValue) -> Operand {
        match lv {
            LValue::Register(op) => op,
            LValue::Inhale(slot) => {
                let line = self.line();
                let dst = self.rec().new_tmp();
                self.rec().emit(QuadOp::GetCapture, dst, Operand::Inhale(slot), Operand::None, line);
                dst
            }
            LValue::Public(idx) => {
                let line = self.line();
                let dst = self.rec().new_tmp();
                self.rec().emit(QuadOp::GetPublic, dst, Operand::Public(idx), Operand::None, line);
                dst
            }
            LValue::Attr { obj, name } => {
                let line = self.line();
                let dst = self.rec().new_tmp();
                self.rec().emit(QuadOp::GetAttr, dst, obj, Operand::Ident(name), line);
                dst
            }
            LValue::Index { obj, index } => {
                let line = self.line();
                let idx_tmp = self.rec().new_tmp();
                self.rec().emit(QuadOp::Move, idx_tmp, index, Operand::None, line);
                let dst = self.rec().new_tmp();
                self.rec().emit(QuadOp::GetIndex, dst, obj, idx_tmp, line);
                dst
            }
        }
    }

    fn postfix_expr(&mut self) -> Result<LValue, UncilError> {
        let mut base = self.primary()?;
        loop {
            match self.peek_kind().clone() {
                TokenKind::Dot => {
                    self.advance();
                    let (_, idx) = self.ident_name()?;
                    let obj = self.value_of(base);
                    base = LValue::Attr { obj, name: idx };
                }
                TokenKind::LBracket => {
                    self.advance();
                    let index = self.expr()?;
                    self.eat(TokenKind::RBracket)?;
                    let obj = self.value_of(base);
                    base = LValue::Index { obj, index };
                }
                TokenKind::LParen => {
                    let line = self.line();
                    self.advance();
                    let func = self.value_of(base);
                    let mut args = Vec::new();
                    if !self.check(&TokenKind::RParen) {
                        loop {
                            args.push(self.expr()?);
                            if self.check(&TokenKind::Comma) {
                                self.advance();
                            } else {
                                break;
                            }
                        }
                    }
                    self.eat(TokenKind::RParen)?;
                    for a in &args {
                        self.rec().emit(QuadOp::Push, Operand::None, *a, Operand::None, line);
                    }
                    let dst = self.rec().new_tmp();
                    self.rec().emit(
                        QuadOp::Call,
                        dst,
                        func,
                        Operand::Int(args.len() as i64),
                        line,
                    );
                    base = LValue::Register(dst);
                }
                _ => break,
            }
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<LValue, UncilError> {
        let line = self.line();
        match self.peek_kind().clone() {
            TokenKind::Int(v) => {
                self.advance();
                Ok(LValue::Register(Operand::Int(v)))
            }
            TokenKind::Float(v) => {
                self.advance();
                Ok(LValue::Register(Operand::Float(v)))
            }
            TokenKind::Str(idx) => {
                self.advance();
                let dst = self.rec().new_tmp();
                self.rec().emit(QuadOp::Move, dst, Operand::Str(idx), Operand::None, line);
                Ok(LValue::Register(dst))
            }
            TokenKind::True => {
                self.advance();
                Ok(LValue::Register(Operand::Bool(true)))
            }
            TokenKind::False => {
                self.advance();
                Ok(LValue::Register(Operand::Bool(false)))
            }
            TokenKind::Null => {
                self.advance();
                Ok(LValue::Register(Operand::Null))
            }
            TokenKind::LParen => {
                self.advance();
                let e = self.expr()?;
                self.eat(TokenKind::RParen)?;
                Ok(LValue::Register(e))
            }
            TokenKind::LBracket => {
                self.advance();
                let mut items = Vec::new();
                if !self.check(&TokenKind::RBracket) {
                    loop {
                        items.push(self.expr()?);
                        if self.check(&TokenKind::Comma) {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
                self.eat(TokenKind::RBracket)?;
                for it in &items {
                    self.rec().emit(QuadOp::Push, Operand::None, *it, Operand::None, line);
                }
                let dst = self.rec().new_tmp();
                self.rec().emit(QuadOp::MakeArray, dst, Operand::Int(items.len() as i64), Operand::None, line);
                Ok(LValue::Register(dst))
            }
            TokenKind::LBrace => {
                self.advance();
                let mut pairs = 0i64;
                if !self.check(&TokenKind::RBrace) {
                    loop {
                        let (_, key_idx) = self.ident_name()?;
                        let key_dst = self.rec().new_tmp();
                        self.rec().emit(QuadOp::Move, key_dst, Operand::Str(key_idx), Operand::None, line);
                        self.eat(TokenKind::Assign)?;
                        let value = self.expr()?;
                        self.rec().emit(QuadOp::Push, Operand::None, key_dst, Operand::None, line);
                        self.rec().emit(QuadOp::Push, Operand::None, value, Operand::None, line);
                        pairs += 1;
                        if self.check(&TokenKind::Comma) {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                }
                self.eat(TokenKind::RBrace)?;
                let dst = self.rec().new_tmp();
                self.rec().emit(QuadOp::MakeDict, dst, Operand::Int(pairs), Operand::None, line);
                Ok(LValue::Register(dst))
            }
            TokenKind::Function => {
                self.advance();
                let op = self.function_literal(line, None)?;
                Ok(LValue::Register(op))
            }
            TokenKind::Ident(_) => {
                let (name, _idx) = self.ident_name()?;
                let resolved = self.scopes.resolve(&name, &mut self.records);
                match resolved {
                    Resolved::Register(op) => Ok(LValue::Register(op)),
                    Resolved::Inhale(slot) => Ok(LValue::Inhale(slot)),
                    Resolved::Public => {
                        let bytes = name.as_bytes();
                        let pub_idx = self.idents.intern(bytes);
                        Ok(LValue::Public(pub_idx))
                    }
                }
            }
            other => Err(UncilError::Syntax { line, message: format!("unexpected token {other:?}") }),
        }
    }

    fn function_literal(&mut self, line: u32, name: Option<&str>) -> Result<Operand, UncilError> {
        let parent = self.cur as u32;
        let func_index = self.start_function(Some(parent), line);
        let mut required = 0u32;
        self.eat(TokenKind::LParen)?;
        let mut param_names = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                let (pname, _) = self.ident_name()?;
                param_names.push(pname);
                required += 1;
                if self.check(&TokenKind::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.eat(TokenKind::RParen)?;
        self.records[func_index].required_args = required;
        if let Some(n) = name {
            let idx = self.idents.intern(n.as_bytes());
            self.records[func_index].name = Some(idx);
            self.records[func_index].flags.named = true;
        }

        let outer = self.cur;
        self.cur = func_index;
        self.scopes.push_function(func_index as u32);
        self.records[func_index].emit(QuadOp::CheckArity, Operand::Int(required as i64), Operand::None, Operand::None, line);
        for pname in &param_names {
            let reg = self.records[func_index].new_tmp();
            self.scopes.declare_local(pname, reg);
        }
        self.block()?;
        let end_line = self.line();
        self.records[func_index].emit(QuadOp::Return, Operand::None, Operand::Null, Operand::None, end_line);
        self.scopes.pop_function();
        self.cur = outer;
        self.eat(TokenKind::End)?;

        let dst = self.rec().new_tmp();
        self.rec().emit(QuadOp::MakeFunction, dst, Operand::Func(func_index as u32), Operand::None, line);
        Ok(dst)
    }
}

#[derive(Debug, Clone, Copy)]
enum LValue {
    Register(Operand),
    Inhale(u32),
    Public(u32),
    Attr { obj: Operand, name: u32 },
    Index { obj: Operand, index: Operand },
}
