//! AST lowering.
//!
//! [`Generator`] walks the tree recursively, dispatching on node kind and
//! emitting into the innermost scope. Every expression is lowered in one of
//! two modes: value mode leaves exactly one result on the register stack,
//! discard mode leaves the stack untouched. Forward control transfers are
//! emitted with placeholder offsets and resolved through the scope's
//! dispatch chains once their targets are known.

use crate::ast::{BlockBody, CallArgs, ClassPath, MultiLhs, Node, NodeKind, ScopeBody};
use crate::irep::{FileSpan, LocalVar, Value};
use crate::op::{self, Op, CALL_MAXARGS, L_BLOCK, L_LAMBDA, L_METHOD, MAXARG_SBX, R_BREAK, R_NORMAL, R_RETURN};
use crate::scope::{LoopInfo, LoopKind, Scope};
use crate::{CodegenError, Irep, ParserState, SymbolTable};

const REGEXP_CLASS: &str = "Regexp";

pub(crate) struct Generator<'a, T: SymbolTable> {
    symbols: &'a mut T,
    filenames: &'a [String],
    init_filename_index: u16,
    no_optimize: bool,
    scopes: Vec<Scope<T>>,
}

impl<'a, T: SymbolTable> Generator<'a, T> {
    pub fn new(symbols: &'a mut T, parser: &'a ParserState<T::Symbol>) -> Generator<'a, T> {
        Generator {
            symbols,
            filenames: &parser.filenames,
            init_filename_index: parser.filename_index,
            no_optimize: parser.no_optimize,
            scopes: Vec::new(),
        }
    }

    pub fn generate(mut self, tree: &Node<T::Symbol>) -> Result<Irep<T>, CodegenError> {
        match &tree.kind {
            NodeKind::Scope(body) => {
                self.scope_new(body.locals.clone());
                self.s().lineno = tree.lineno;
                self.gen(&body.body, true)?;
                self.genop(op::mkop_a(Op::STOP, 0));
                Ok(self.finish_irep())
            }
            _ => Err(self.error("malformed program (scope expected)")),
        }
    }

    // ---- scope plumbing ----

    fn s(&mut self) -> &mut Scope<T> {
        self.scopes.last_mut().expect("no open scope")
    }

    fn sref(&self) -> &Scope<T> {
        self.scopes.last().expect("no open scope")
    }

    fn scope_new(&mut self, lv: Vec<Option<T::Symbol>>) {
        let (fi, line) = match self.scopes.last() {
            Some(s) => (s.filename_index, s.lineno),
            None => (self.init_filename_index, 0),
        };
        self.scopes.push(Scope::new(lv, fi, line, self.no_optimize));
    }

    /// Seals the innermost scope into an `Irep` and attaches it to the parent,
    /// returning its sub-procedure index.
    fn scope_finish(&mut self) -> usize {
        let irep = self.finish_irep();
        let parent = self.s();
        parent.reps.push(irep);
        parent.reps.len() - 1
    }

    fn finish_irep(&mut self) -> Irep<T> {
        let scope = self.scopes.pop().expect("no open scope");
        let mut iseq = scope.iseq;
        let mut lines = scope.lines;
        let mut pool = scope.pool;
        let mut syms = scope.syms;
        let mut reps = scope.reps;
        iseq.shrink_to_fit();
        lines.shrink_to_fit();
        pool.shrink_to_fit();
        syms.shrink_to_fit();
        reps.shrink_to_fit();
        Irep {
            iseq,
            lines,
            pool,
            syms,
            reps,
            lv: scope
                .lv
                .iter()
                .enumerate()
                .map(|(i, name)| LocalVar {
                    name: *name,
                    r: if name.is_some() { i as u16 + 1 } else { 0 },
                })
                .collect(),
            nlocals: scope.nlocals,
            nregs: scope.nregs,
            filename: self.filenames.get(scope.filename_index as usize).cloned(),
            debug: scope.debug,
        }
    }

    fn error(&self, msg: &str) -> CodegenError {
        let (fi, line) = self
            .scopes
            .last()
            .map(|s| (s.filename_index, s.lineno))
            .unwrap_or((self.init_filename_index, 0));
        CodegenError {
            message: msg.to_string(),
            filename: self.filenames.get(fi as usize).cloned(),
            lineno: line,
        }
    }

    // ---- register stack ----

    fn cursp(&self) -> u32 {
        self.sref().sp.max(0) as u32
    }

    fn push(&mut self) -> Result<(), CodegenError> {
        if self.sref().sp > 511 {
            return Err(self.error("too complex expression"));
        }
        let s = self.s();
        s.sp += 1;
        if s.sp > s.nregs as i32 {
            s.nregs = s.sp as u16;
        }
        Ok(())
    }

    fn push_n(&mut self, n: usize) -> Result<(), CodegenError> {
        if self.sref().sp + n as i32 > 511 {
            return Err(self.error("too complex expression"));
        }
        let s = self.s();
        s.sp += n as i32;
        if s.sp > s.nregs as i32 {
            s.nregs = s.sp as u16;
        }
        Ok(())
    }

    fn pop(&mut self) {
        self.s().sp -= 1;
    }

    fn pop_n(&mut self, n: usize) {
        self.s().sp -= n as i32;
    }

    // ---- emission ----

    fn genop(&mut self, i: op::Code) -> usize {
        self.s().genop(i)
    }

    fn genop_peep(&mut self, i: op::Code, val: bool) -> usize {
        self.s().genop_peep(i, val)
    }

    fn new_label(&mut self) -> usize {
        self.s().new_label()
    }

    fn dispatch(&mut self, pc: usize) -> Result<(), CodegenError> {
        if self.s().dispatch(pc) {
            Ok(())
        } else {
            Err(self.error("dispatch on non-jump instruction"))
        }
    }

    fn dispatch_linked(&mut self, pc: usize) -> Result<(), CodegenError> {
        if self.s().dispatch_linked(pc) {
            Ok(())
        } else {
            Err(self.error("dispatch on non-jump instruction"))
        }
    }

    // ---- interning ----

    fn lit(&mut self, v: Value) -> u32 {
        self.s().new_lit(v) as u32
    }

    fn msym(&mut self, sym: T::Symbol) -> Result<u32, CodegenError> {
        match self.s().new_msym(sym) {
            Some(i) => Ok(i),
            None => Err(self.error("too many symbols (max 256)")),
        }
    }

    fn msym_str(&mut self, name: &str) -> Result<u32, CodegenError> {
        let sym = self.symbols.symbol(name);
        self.msym(sym)
    }

    fn sym(&mut self, sym: T::Symbol) -> u32 {
        self.s().new_sym(sym) as u32
    }

    fn sym_str(&mut self, name: &str) -> u32 {
        let sym = self.symbols.symbol(name);
        self.sym(sym)
    }

    /// The assignment-method name for an attribute: `name` + `=`.
    fn attrsym(&mut self, sym: T::Symbol) -> T::Symbol {
        let name = match self.symbols.symbol_name(sym) {
            Some(n) => format!("{}=", n),
            None => "=".to_string(),
        };
        self.symbols.symbol(&name)
    }

    // ---- lexical lookup ----

    /// Searches enclosing scopes for a local, returning its register index
    /// and the parent depth (0 = immediate parent).
    fn upvar(&self, name: T::Symbol) -> Option<(u32, u32)> {
        let len = self.scopes.len();
        for (d, sc) in self.scopes[..len - 1].iter().rev().enumerate() {
            if let Some(idx) = sc.lv_idx(name) {
                return Some((idx, d as u32));
            }
        }
        None
    }

    /// Walks out to the nearest method scope, returning the depth and its
    /// packed arity word (for argv recovery by `SUPER`/`ARGARY`/`BLKPUSH`).
    fn nearest_mscope(&self) -> (u32, u16) {
        let mut lv = 0u32;
        for sc in self.scopes.iter().rev() {
            if sc.mscope {
                return (lv, sc.ainfo);
            }
            lv += 1;
        }
        (lv, 0)
    }

    // ---- loop bookkeeping ----

    fn loop_push(&mut self, kind: LoopKind) {
        let acc = self.cursp();
        let s = self.s();
        let ensure_level = s.ensure_level;
        s.loops.push(LoopInfo {
            kind,
            pc1: 0,
            pc2: 0,
            pc3: 0,
            acc,
            ensure_level,
        });
    }

    fn loop_pop(&mut self, val: bool) -> Result<(), CodegenError> {
        if val {
            let sp = self.cursp();
            self.genop(op::mkop_a(Op::LOADNIL, sp));
        }
        let pc3 = self.sref().loops.last().map(|l| l.pc3).unwrap_or(0);
        self.dispatch_linked(pc3)?;
        self.s().loops.pop();
        if val {
            self.push()?;
        }
        Ok(())
    }

    fn loop_break(&mut self, value: Option<&Node<T::Symbol>>) -> Result<(), CodegenError> {
        if self.sref().loops.is_empty() {
            return Err(self.error("unexpected break"));
        }
        if let Some(v) = value {
            self.gen(v, true)?;
            self.pop();
        }
        // leave begin bodies (closing their handler regions) and skip
        // handler frames before picking the break target
        let mut i = self.sref().loops.len();
        while i > 0 && self.sref().loops[i - 1].kind == LoopKind::Begin {
            self.genop_peep(op::mkop_a(Op::POPERR, 1), false);
            i -= 1;
        }
        while i > 0 && self.sref().loops[i - 1].kind == LoopKind::Rescue {
            i -= 1;
        }
        if i == 0 {
            return Err(self.error("unexpected break"));
        }
        let target = self.sref().loops[i - 1];
        if target.kind == LoopKind::Normal {
            let level = self.sref().ensure_level;
            if level > target.ensure_level {
                self.genop_peep(op::mkop_a(Op::EPOP, (level - target.ensure_level) as u32), false);
            }
            if value.is_some() {
                let sp = self.cursp();
                self.genop_peep(op::mkop_ab(Op::MOVE, target.acc, sp), false);
            }
            let tmp = self.genop(op::mkop_sbx(Op::JMP, target.pc3 as i32));
            self.s().loops[i - 1].pc3 = tmp;
        } else {
            let sp = self.cursp();
            self.genop(op::mkop_ab(Op::RETURN, sp, R_BREAK));
        }
        Ok(())
    }

    // ---- numeric literals ----

    fn read_int(&self, text: &str, base: u8, neg: bool) -> Result<Option<i64>, CodegenError> {
        if base < 2 || base > 36 {
            return Err(self.error("malformed integer literal"));
        }
        let digits = text.strip_prefix('+').unwrap_or(text);
        let mut result: i64 = 0;
        for ch in digits.chars() {
            let n = match ch.to_ascii_lowercase().to_digit(base as u32) {
                Some(n) => n as i64,
                None => return Err(self.error("malformed integer literal")),
            };
            let step = if neg {
                result.checked_mul(base as i64).and_then(|r| r.checked_sub(n))
            } else {
                result.checked_mul(base as i64).and_then(|r| r.checked_add(n))
            };
            result = match step {
                Some(r) => r,
                None => return Ok(None),
            };
        }
        Ok(Some(result))
    }

    /// Overflow fallback: re-reads the digits into a double.
    fn read_int_float(&self, text: &str, base: u8) -> Result<f64, CodegenError> {
        if base < 2 || base > 36 {
            return Err(self.error("malformed integer literal"));
        }
        let digits = text.strip_prefix('+').unwrap_or(text);
        let mut f = 0f64;
        for ch in digits.chars() {
            match ch.to_ascii_lowercase().to_digit(base as u32) {
                Some(n) => f = f * base as f64 + n as f64,
                None => return Err(self.error("malformed integer literal")),
            }
        }
        Ok(f)
    }

    fn gen_int(&mut self, i: i64) {
        let sp = self.cursp();
        if i < MAXARG_SBX as i64 && i > -(MAXARG_SBX as i64) {
            self.genop(op::mkop_asbx(Op::LOADI, sp, i as i32));
        } else {
            let off = self.lit(Value::Int(i));
            self.genop(op::mkop_abx(Op::LOADL, sp, off));
        }
    }

    // ---- argument lists ----

    /// Lowers a positional argument list. Returns the pushed count, or
    /// `None` once a splat or the 127-argument limit forces the arguments
    /// into a single array (left on top of the stack in value mode).
    fn gen_values(&mut self, list: &[Node<T::Symbol>], val: bool) -> Result<Option<usize>, CodegenError> {
        let mut n = 0usize;
        for (pos, item) in list.iter().enumerate() {
            let is_splat = matches!(item.kind, NodeKind::Splat(_));
            if n >= 127 || is_splat {
                if val {
                    let inner_array = match &item.kind {
                        NodeKind::Splat(inner) if n == 0 => {
                            matches!(inner.kind, NodeKind::Array(_))
                        }
                        _ => false,
                    };
                    if inner_array {
                        // splat of an array literal: lower it directly
                        if let NodeKind::Splat(inner) = &item.kind {
                            self.gen(inner, true)?;
                        }
                        self.pop();
                    } else {
                        self.pop_n(n);
                        let sp = self.cursp();
                        self.genop(op::mkop_abc(Op::ARRAY, sp, sp, n as u32));
                        self.push()?;
                        self.gen(item, true)?;
                        self.pop();
                        self.pop();
                        let sp = self.cursp();
                        if is_splat {
                            self.genop(op::mkop_ab(Op::ARYCAT, sp, sp + 1));
                        } else {
                            self.genop(op::mkop_ab(Op::ARYPUSH, sp, sp + 1));
                        }
                    }
                    for rest in &list[pos + 1..] {
                        self.push()?;
                        self.gen(rest, true)?;
                        self.pop();
                        self.pop();
                        let sp = self.cursp();
                        if matches!(rest.kind, NodeKind::Splat(_)) {
                            self.genop(op::mkop_ab(Op::ARYCAT, sp, sp + 1));
                        } else {
                            self.genop(op::mkop_ab(Op::ARYPUSH, sp, sp + 1));
                        }
                    }
                } else {
                    for rest in &list[pos..] {
                        match &rest.kind {
                            NodeKind::Splat(inner) => self.gen(inner, false)?,
                            _ => self.gen(rest, false)?,
                        }
                    }
                }
                return Ok(None);
            }
            self.gen(item, val)?;
            n += 1;
        }
        Ok(Some(n))
    }

    // ---- calls ----

    fn gen_call(
        &mut self,
        recv: &Node<T::Symbol>,
        name: T::Symbol,
        args: Option<&CallArgs<T::Symbol>>,
        sp_reuse: u32,
        val: bool,
        safe: bool,
    ) -> Result<(), CodegenError> {
        self.gen(recv, true)?;
        let skip = if safe {
            let recv_reg = self.cursp() - 1;
            let sp = self.cursp();
            self.genop(op::mkop_a(Op::LOADNIL, sp));
            self.push()?;
            let sp = self.cursp();
            self.genop(op::mkop_ab(Op::MOVE, sp, recv_reg));
            self.pop();
            let idx = self.msym_str("==")?;
            let sp = self.cursp();
            self.genop(op::mkop_abc(Op::EQ, sp, idx, 1));
            Some(self.genop(op::mkop_asbx(Op::JMPIF, sp, 0)))
        } else {
            None
        };
        let idx = self.msym(name)?;
        let mut n = 0u32;
        let mut noop = false;
        let mut sendv = false;
        if let Some(ca) = args {
            if !ca.args.is_empty() {
                match self.gen_values(&ca.args, true)? {
                    Some(k) => n = k as u32,
                    None => {
                        n = 1;
                        noop = true;
                        sendv = true;
                        self.push()?;
                    }
                }
            }
        }
        if sp_reuse != 0 {
            if sendv {
                self.pop();
                let sp = self.cursp();
                self.genop(op::mkop_ab(Op::ARYPUSH, sp, sp_reuse));
                self.push()?;
            } else {
                let sp = self.cursp();
                self.genop(op::mkop_ab(Op::MOVE, sp, sp_reuse));
                self.push()?;
                n += 1;
            }
        }
        let mut has_block = false;
        if let Some(ca) = args {
            if let Some(blk) = &ca.block {
                noop = true;
                has_block = true;
                self.gen(blk, true)?;
                self.pop();
            }
        }
        self.push()?;
        self.pop();
        self.pop_n(n as usize + 1);
        let fast = if noop {
            None
        } else {
            match self.symbols.symbol_name(name) {
                Some("+") => Some(Op::ADD),
                Some("-") => Some(Op::SUB),
                Some("*") => Some(Op::MUL),
                Some("/") => Some(Op::DIV),
                Some("<") => Some(Op::LT),
                Some("<=") => Some(Op::LE),
                Some(">") => Some(Op::GT),
                Some(">=") => Some(Op::GE),
                Some("==") => Some(Op::EQ),
                _ => None,
            }
        };
        let sp = self.cursp();
        match fast {
            Some(c @ Op::ADD) | Some(c @ Op::SUB) => {
                self.genop_peep(op::mkop_abc(c, sp, idx, n), val);
            }
            Some(c) => {
                self.genop(op::mkop_abc(c, sp, idx, n));
            }
            None => {
                if sendv {
                    n = CALL_MAXARGS;
                }
                if has_block {
                    self.genop(op::mkop_abc(Op::SENDB, sp, idx, n));
                } else {
                    self.genop(op::mkop_abc(Op::SEND, sp, idx, n));
                }
            }
        }
        if let Some(skip) = skip {
            self.dispatch(skip)?;
        }
        if val {
            self.push()?;
        }
        Ok(())
    }

    // ---- assignment ----

    fn gen_assignment(&mut self, lhs: &Node<T::Symbol>, sp: u32, val: bool) -> Result<(), CodegenError> {
        match &lhs.kind {
            NodeKind::Gvar(name) => {
                let idx = self.sym(*name);
                self.genop_peep(op::mkop_abx(Op::SETGLOBAL, sp, idx), val);
            }
            NodeKind::Lvar(name) => {
                if let Some(idx) = self.sref().lv_idx(*name) {
                    if idx != sp {
                        self.genop_peep(op::mkop_ab(Op::MOVE, idx, sp), val);
                    }
                } else if let Some((idx, lv)) = self.upvar(*name) {
                    self.genop_peep(op::mkop_abc(Op::SETUPVAR, sp, idx, lv), val);
                }
            }
            NodeKind::Ivar(name) => {
                let idx = self.sym(*name);
                self.genop_peep(op::mkop_abx(Op::SETIV, sp, idx), val);
            }
            NodeKind::Cvar(name) => {
                let idx = self.sym(*name);
                self.genop_peep(op::mkop_abx(Op::SETCV, sp, idx), val);
            }
            NodeKind::Const(name) => {
                let idx = self.sym(*name);
                self.genop_peep(op::mkop_abx(Op::SETCONST, sp, idx), val);
            }
            NodeKind::Colon2 { base, name } => {
                let idx = self.sym(*name);
                let c = self.cursp();
                self.genop_peep(op::mkop_ab(Op::MOVE, c, sp), false);
                self.push()?;
                self.gen(base, true)?;
                self.pop_n(2);
                let c = self.cursp();
                self.genop_peep(op::mkop_abx(Op::SETMCNST, c, idx), val);
            }
            NodeKind::Call { recv, method, args, .. } => {
                self.push()?;
                let setter = self.attrsym(*method);
                self.gen_call(recv, setter, args.as_ref(), sp, false, false)?;
                self.pop();
                if val {
                    let c = self.cursp();
                    self.genop_peep(op::mkop_ab(Op::MOVE, c, sp), true);
                }
            }
            NodeKind::Masgn { lhs, .. } => {
                self.gen_vmassignment(lhs, sp, val)?;
            }
            // splat without a binding target
            NodeKind::Nil => {}
            _ => return Err(self.error("unknown left-hand side")),
        }
        if val {
            self.push()?;
        }
        Ok(())
    }

    /// Destructures the array in register `rhs` into a multi-target list.
    fn gen_vmassignment(&mut self, lhs: &MultiLhs<T::Symbol>, rhs: u32, val: bool) -> Result<(), CodegenError> {
        for (i, l) in lhs.pre.iter().enumerate() {
            let sp = self.cursp();
            self.genop(op::mkop_abc(Op::AREF, sp, rhs, i as u32));
            self.gen_assignment(l, self.cursp(), false)?;
        }
        if let Some(rest) = &lhs.rest {
            let post = lhs.post.len();
            if val {
                let sp = self.cursp();
                self.genop(op::mkop_ab(Op::MOVE, sp, rhs));
            } else {
                self.pop();
            }
            self.push_n(post)?;
            self.pop_n(post);
            let sp = self.cursp();
            self.genop(op::mkop_abc(Op::APOST, sp, lhs.pre.len() as u32, post as u32));
            if let Some(target) = rest {
                self.gen_assignment(target, self.cursp(), false)?;
            }
            let mut k = 1u32;
            for p in &lhs.post {
                self.gen_assignment(p, self.cursp() + k, false)?;
                k += 1;
            }
            self.push()?;
        }
        Ok(())
    }

    // ---- literal arrays (%w / %i) ----

    /// Sends `intern` to the string on top of the stack.
    fn gen_intern(&mut self) -> Result<(), CodegenError> {
        self.pop();
        let m = self.msym_str("intern")?;
        let sp = self.cursp();
        self.genop(op::mkop_abc(Op::SEND, sp, m, 0));
        self.push()
    }

    fn gen_literal_array(&mut self, list: &[Node<T::Symbol>], sym: bool, val: bool) -> Result<(), CodegenError> {
        if val {
            let mut words = 0usize;
            let mut pieces = 0usize;
            for (pos, item) in list.iter().enumerate() {
                match &item.kind {
                    NodeKind::Str(s) if pos + 1 == list.len() && s.is_empty() => {
                        // trailing empty piece
                    }
                    NodeKind::Str(_) | NodeKind::Begin(_) => {
                        self.gen(item, true)?;
                        pieces += 1;
                    }
                    NodeKind::LiteralDelim => {
                        if pieces > 0 {
                            pieces = 0;
                            words += 1;
                            if sym {
                                self.gen_intern()?;
                            }
                        }
                    }
                    _ => {}
                }
                if pieces >= 2 {
                    self.pop();
                    self.pop();
                    let sp = self.cursp();
                    self.genop_peep(op::mkop_ab(Op::STRCAT, sp, sp + 1), true);
                    self.push()?;
                    pieces = 1;
                }
            }
            if pieces > 0 {
                words += 1;
                if sym {
                    self.gen_intern()?;
                }
            }
            self.pop_n(words);
            let sp = self.cursp();
            self.genop(op::mkop_abc(Op::ARRAY, sp, sp, words as u32));
            self.push()?;
        } else {
            for item in list {
                if matches!(item.kind, NodeKind::Begin(_)) {
                    self.gen(item, false)?;
                }
            }
        }
        Ok(())
    }

    // ---- bodies ----

    /// Compiles a nested variable scope (class body, `ensure` clause) into a
    /// sub-procedure of the current unit and returns its index.
    fn scope_body(&mut self, sb: &ScopeBody<T::Symbol>, val: bool) -> Result<usize, CodegenError> {
        self.scope_new(sb.locals.clone());
        self.gen(&sb.body, true)?;
        if !val {
            self.genop(op::mkop_ab(Op::RETURN, 0, R_NORMAL));
        } else if self.sref().nregs == 0 {
            self.genop(op::mkop_a(Op::LOADNIL, 0));
            self.genop(op::mkop_ab(Op::RETURN, 0, R_NORMAL));
        } else {
            let sp = (self.sref().sp - 1).max(0) as u32;
            self.genop_peep(op::mkop_ab(Op::RETURN, sp, R_NORMAL), false);
        }
        Ok(self.scope_finish())
    }

    /// Compiles a method or block body into a sub-procedure, emitting the
    /// argument-descriptor prologue and synthesizing the final return.
    fn lambda_body(&mut self, body: &BlockBody<T::Symbol>, blk: bool) -> Result<usize, CodegenError> {
        self.scope_new(body.locals.clone());
        self.s().mscope = !blk;
        if blk {
            self.loop_push(LoopKind::Block);
            let pc1 = self.new_label();
            self.s().loops.last_mut().expect("loop").pc1 = pc1;
        }
        if let Some(params) = &body.params {
            let ma = params.mandatory.len() as u32;
            let oa = params.optional.len() as u32;
            let pa = params.post.len() as u32;
            let aspec = op::pack_aspec(ma, oa, params.rest, pa, 0, false, params.block);
            self.s().ainfo = op::pack_ainfo(ma, oa, params.rest, pa) as u16;
            self.genop(op::mkop_ax(Op::ENTER, aspec));
            let pos = self.new_label();
            for _ in 0..oa {
                self.new_label();
                self.genop(op::mkop_sbx(Op::JMP, 0));
            }
            if oa > 0 {
                self.genop(op::mkop_sbx(Op::JMP, 0));
            }
            let mut i = 0usize;
            for (name, default) in &params.optional {
                self.dispatch(pos + i)?;
                self.gen(default, true)?;
                let idx = self.sref().lv_idx(*name).unwrap_or(0);
                self.pop();
                let sp = self.cursp();
                self.genop_peep(op::mkop_ab(Op::MOVE, idx, sp), false);
                i += 1;
            }
            if oa > 0 {
                self.dispatch(pos + i)?;
            }
        }
        self.gen(&body.body, true)?;
        self.pop();
        if self.sref().pc() > 0 {
            let last = *self.sref().iseq.last().expect("instruction");
            if op::get_opcode(last) != Op::RETURN
                || op::getarg_b(last) != R_NORMAL
                || self.sref().pc() == self.sref().lastlabel
            {
                if self.sref().nregs == 0 {
                    self.genop(op::mkop_a(Op::LOADNIL, 0));
                    self.genop(op::mkop_ab(Op::RETURN, 0, R_NORMAL));
                } else {
                    let sp = self.cursp();
                    self.genop_peep(op::mkop_ab(Op::RETURN, sp, R_NORMAL), false);
                }
            }
        }
        if blk {
            self.loop_pop(false)?;
        }
        Ok(self.scope_finish())
    }

    /// Lowers `for v in expr` to `expr.each { |v| body }`: the body becomes
    /// a block sub-procedure whose loop variables assign into the enclosing
    /// scope.
    fn for_body(
        &mut self,
        var: &MultiLhs<T::Symbol>,
        iter: &Node<T::Symbol>,
        body: &Node<T::Symbol>,
    ) -> Result<(), CodegenError> {
        self.gen(iter, true)?;
        self.scope_new(Vec::new());
        self.push()?; // block parameter slot
        self.loop_push(LoopKind::For);
        let pc1 = self.new_label();
        self.s().loops.last_mut().expect("loop").pc1 = pc1;
        self.genop(op::mkop_ax(Op::ENTER, op::pack_aspec(1, 0, false, 0, 0, false, false)));
        if var.pre.len() == 1 && var.rest.is_none() && var.post.is_empty() {
            self.gen_assignment(&var.pre[0], 1, false)?;
        } else {
            self.gen_vmassignment(var, 1, true)?;
        }
        self.gen(body, true)?;
        self.pop();
        if self.sref().pc() > 0 {
            let last = *self.sref().iseq.last().expect("instruction");
            if op::get_opcode(last) != Op::RETURN
                || op::getarg_b(last) != R_NORMAL
                || self.sref().pc() == self.sref().lastlabel
            {
                let sp = self.cursp();
                self.genop_peep(op::mkop_ab(Op::RETURN, sp, R_NORMAL), false);
            }
        }
        self.loop_pop(false)?;
        let idx = self.scope_finish();
        let sp = self.cursp();
        self.genop(op::mkop_abz(Op::LAMBDA, sp, idx as u32, L_BLOCK));
        self.pop();
        let each = self.msym_str("each")?;
        let sp = self.cursp();
        self.genop(op::mkop_abc(Op::SENDB, sp, each, 0));
        Ok(())
    }

    // ---- the dispatcher ----

    fn gen_opt(&mut self, tree: Option<&Node<T::Symbol>>, val: bool) -> Result<(), CodegenError> {
        match tree {
            Some(t) => self.gen(t, val),
            None => {
                if val {
                    let sp = self.cursp();
                    self.genop(op::mkop_a(Op::LOADNIL, sp));
                    self.push()?;
                }
                Ok(())
            }
        }
    }

    fn gen(&mut self, tree: &Node<T::Symbol>, val: bool) -> Result<(), CodegenError> {
        if self.sref().filename_index != tree.filename_index {
            let start = self.sref().pc();
            let s = self.s();
            s.filename_index = tree.filename_index;
            s.debug.push(FileSpan {
                start,
                filename_index: tree.filename_index,
            });
        }
        self.s().lineno = tree.lineno;

        match &tree.kind {
            NodeKind::Begin(list) => {
                if val && list.is_empty() {
                    let sp = self.cursp();
                    self.genop(op::mkop_a(Op::LOADNIL, sp));
                    self.push()?;
                }
                for (i, item) in list.iter().enumerate() {
                    let last = i + 1 == list.len();
                    self.gen(item, if last { val } else { false })?;
                }
            }

            NodeKind::Rescue {
                body,
                clauses,
                else_body,
            } => {
                let body = match body {
                    Some(b) => b,
                    None => return Ok(()),
                };
                let onerr = self.genop(op::mkop_bx(Op::ONERR, 0));
                self.loop_push(LoopKind::Begin);
                self.s().loops.last_mut().expect("loop").pc1 = onerr;
                self.gen(body, true)?;
                self.pop();
                self.s().loops.last_mut().expect("loop").kind = LoopKind::Rescue;
                let noexc = self.genop(op::mkop_bx(Op::JMP, 0));
                self.dispatch(onerr)?;
                let mut exend = 0usize;
                let mut pos1 = 0usize;
                if !clauses.is_empty() {
                    let exc = self.cursp();
                    self.genop(op::mkop_a(Op::RESCUE, exc));
                    self.push()?;
                    for clause in clauses {
                        if pos1 != 0 {
                            self.dispatch(pos1)?;
                        }
                        let mut pos2 = 0usize;
                        if clause.classes.is_empty() {
                            let idx = self.msym_str("StandardError")?;
                            let sp = self.cursp();
                            self.genop(op::mkop_abx(Op::GETCONST, sp, idx));
                            self.push()?;
                            pos2 = self.gen_rescue_match(exc, false, pos2)?;
                        } else {
                            for cls in &clause.classes {
                                let splat = matches!(cls.kind, NodeKind::Splat(_));
                                self.gen(cls, true)?;
                                pos2 = self.gen_rescue_match(exc, splat, pos2)?;
                            }
                        }
                        pos1 = self.genop(op::mkop_sbx(Op::JMP, 0));
                        self.dispatch_linked(pos2)?;
                        self.pop();
                        if let Some(var) = &clause.var {
                            self.gen_assignment(var, exc, false)?;
                        }
                        if let Some(b) = &clause.body {
                            self.gen(b, val)?;
                            if val {
                                self.pop();
                            }
                        }
                        exend = self.genop(op::mkop_sbx(Op::JMP, exend as i32));
                        self.push()?;
                    }
                    if pos1 != 0 {
                        self.dispatch(pos1)?;
                        self.genop(op::mkop_a(Op::RAISE, exc));
                    }
                }
                self.pop();
                self.dispatch(noexc)?;
                self.genop(op::mkop_a(Op::POPERR, 1));
                if let Some(e) = else_body {
                    self.gen(e, val)?;
                } else if val {
                    self.push()?;
                }
                self.dispatch_linked(exend)?;
                self.loop_pop(false)?;
            }

            NodeKind::Ensure { body, ensure } => {
                let epush = self.sref().pc();
                self.genop(op::mkop_bx(Op::EPUSH, 0));
                self.s().ensure_level += 1;
                self.gen(body, val)?;
                let idx = self.scope_body(ensure, false)?;
                self.s().iseq[epush] = op::mkop_bx(Op::EPUSH, idx as u32);
                self.s().ensure_level -= 1;
                self.genop_peep(op::mkop_a(Op::EPOP, 1), false);
            }

            NodeKind::Lambda(body) => {
                let idx = self.lambda_body(body, true)?;
                let sp = self.cursp();
                self.genop(op::mkop_abz(Op::LAMBDA, sp, idx as u32, L_LAMBDA));
                self.push()?;
            }

            NodeKind::Block(body) => {
                let idx = self.lambda_body(body, true)?;
                let sp = self.cursp();
                self.genop(op::mkop_abz(Op::LAMBDA, sp, idx as u32, L_BLOCK));
                self.push()?;
            }

            NodeKind::If { cond, then, els } => {
                match cond.kind {
                    NodeKind::True | NodeKind::Int { .. } | NodeKind::Str(_) => {
                        return self.gen_opt(then.as_deref(), val);
                    }
                    NodeKind::False | NodeKind::Nil => {
                        return self.gen_opt(els.as_deref(), val);
                    }
                    _ => {}
                }
                self.gen(cond, true)?;
                self.pop();
                let sp = self.cursp();
                let pos1 = self.genop_peep(op::mkop_asbx(Op::JMPNOT, sp, 0), false);
                self.gen_opt(then.as_deref(), val)?;
                if let Some(e) = els {
                    if val {
                        self.pop();
                    }
                    let pos2 = self.genop(op::mkop_sbx(Op::JMP, 0));
                    self.dispatch(pos1)?;
                    self.gen(e, val)?;
                    self.dispatch(pos2)?;
                } else if val {
                    self.pop();
                    let pos2 = self.genop(op::mkop_sbx(Op::JMP, 0));
                    self.dispatch(pos1)?;
                    let sp = self.cursp();
                    self.genop(op::mkop_a(Op::LOADNIL, sp));
                    self.dispatch(pos2)?;
                    self.push()?;
                } else {
                    self.dispatch(pos1)?;
                }
            }

            NodeKind::And(a, b) => {
                self.gen(a, true)?;
                self.pop();
                let sp = self.cursp();
                let pos = self.genop(op::mkop_asbx(Op::JMPNOT, sp, 0));
                self.gen(b, val)?;
                self.dispatch(pos)?;
            }

            NodeKind::Or(a, b) => {
                self.gen(a, true)?;
                self.pop();
                let sp = self.cursp();
                let pos = self.genop(op::mkop_asbx(Op::JMPIF, sp, 0));
                self.gen(b, val)?;
                self.dispatch(pos)?;
            }

            NodeKind::While { cond, body } => {
                self.loop_push(LoopKind::Normal);
                let pc1 = self.genop(op::mkop_sbx(Op::JMP, 0));
                let pc2 = self.new_label();
                {
                    let lp = self.s().loops.last_mut().expect("loop");
                    lp.pc1 = pc1;
                    lp.pc2 = pc2;
                }
                self.gen(body, false)?;
                self.dispatch(pc1)?;
                self.gen(cond, true)?;
                self.pop();
                let sp = self.cursp();
                let pc = self.sref().pc();
                self.genop(op::mkop_asbx(Op::JMPIF, sp, pc2 as i32 - pc as i32));
                self.loop_pop(val)?;
            }

            NodeKind::Until { cond, body } => {
                self.loop_push(LoopKind::Normal);
                let pc1 = self.genop(op::mkop_sbx(Op::JMP, 0));
                let pc2 = self.new_label();
                {
                    let lp = self.s().loops.last_mut().expect("loop");
                    lp.pc1 = pc1;
                    lp.pc2 = pc2;
                }
                self.gen(body, false)?;
                self.dispatch(pc1)?;
                self.gen(cond, true)?;
                self.pop();
                let sp = self.cursp();
                let pc = self.sref().pc();
                self.genop(op::mkop_asbx(Op::JMPNOT, sp, pc2 as i32 - pc as i32));
                self.loop_pop(val)?;
            }

            NodeKind::For { var, iter, body } => {
                self.for_body(var, iter, body)?;
                if val {
                    self.push()?;
                }
            }

            NodeKind::Case { head, clauses } => {
                let mut pos3 = 0usize;
                let head_reg = match head {
                    Some(h) => {
                        let r = self.cursp();
                        self.gen(h, true)?;
                        Some(r)
                    }
                    None => None,
                };
                for clause in clauses {
                    let mut pos1 = 0usize;
                    let mut pos2 = 0usize;
                    for pat in &clause.patterns {
                        self.gen(pat, true)?;
                        if let Some(hr) = head_reg {
                            let sp = self.cursp();
                            self.genop(op::mkop_ab(Op::MOVE, sp, hr));
                            self.pop();
                            let m = if matches!(pat.kind, NodeKind::Splat(_)) {
                                self.msym_str("__case_eqq")?
                            } else {
                                self.msym_str("===")?
                            };
                            let sp = self.cursp();
                            self.genop(op::mkop_abc(Op::SEND, sp, m, 1));
                        } else {
                            self.pop();
                        }
                        let sp = self.cursp();
                        pos2 = self.genop(op::mkop_asbx(Op::JMPIF, sp, pos2 as i32));
                    }
                    if !clause.patterns.is_empty() {
                        pos1 = self.genop(op::mkop_sbx(Op::JMP, 0));
                        self.dispatch_linked(pos2)?;
                    }
                    self.gen_opt(clause.body.as_deref(), val)?;
                    if val {
                        self.pop();
                    }
                    pos3 = self.genop(op::mkop_sbx(Op::JMP, pos3 as i32));
                    if pos1 != 0 {
                        self.dispatch(pos1)?;
                    }
                }
                if val {
                    let pos = self.cursp();
                    self.genop(op::mkop_a(Op::LOADNIL, pos));
                    if pos3 != 0 {
                        self.dispatch_linked(pos3)?;
                    }
                    if head_reg.is_some() {
                        self.pop();
                    }
                    let sp = self.cursp();
                    self.genop(op::mkop_ab(Op::MOVE, sp, pos));
                    self.push()?;
                } else {
                    if pos3 != 0 {
                        self.dispatch_linked(pos3)?;
                    }
                    if head_reg.is_some() {
                        self.pop();
                    }
                }
            }

            NodeKind::Scope(sb) => {
                self.scope_body(sb, false)?;
            }

            NodeKind::Call {
                recv,
                method,
                args,
                safe,
            } => {
                self.gen_call(recv, *method, args.as_ref(), 0, val, *safe)?;
            }

            NodeKind::Dot2(a, b) => {
                self.gen(a, val)?;
                self.gen(b, val)?;
                if val {
                    self.pop();
                    self.pop();
                    let sp = self.cursp();
                    self.genop(op::mkop_abc(Op::RANGE, sp, sp, 0));
                    self.push()?;
                }
            }

            NodeKind::Dot3(a, b) => {
                self.gen(a, val)?;
                self.gen(b, val)?;
                if val {
                    self.pop();
                    self.pop();
                    let sp = self.cursp();
                    self.genop(op::mkop_abc(Op::RANGE, sp, sp, 1));
                    self.push()?;
                }
            }

            NodeKind::Colon2 { base, name } => {
                let idx = self.sym(*name);
                self.gen(base, true)?;
                self.pop();
                let sp = self.cursp();
                self.genop(op::mkop_abx(Op::GETMCNST, sp, idx));
                if val {
                    self.push()?;
                }
            }

            NodeKind::Colon3(name) => {
                let idx = self.sym(*name);
                let sp = self.cursp();
                self.genop(op::mkop_a(Op::OCLASS, sp));
                self.genop(op::mkop_abx(Op::GETMCNST, sp, idx));
                if val {
                    self.push()?;
                }
            }

            NodeKind::Array(list) => {
                match self.gen_values(list, val)? {
                    Some(n) => {
                        if val {
                            self.pop_n(n);
                            let sp = self.cursp();
                            self.genop(op::mkop_abc(Op::ARRAY, sp, sp, n as u32));
                            self.push()?;
                        }
                    }
                    None => {
                        if val {
                            self.push()?;
                        }
                    }
                }
            }

            NodeKind::Hash(pairs) => {
                let mut len = 0u32;
                let mut update = false;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    self.gen(k, val)?;
                    self.gen(v, val)?;
                    len += 1;
                    if val && len == 126 && i + 1 < pairs.len() {
                        self.pop_n(len as usize * 2);
                        let sp = self.cursp();
                        self.genop(op::mkop_abc(Op::HASH, sp, sp, len));
                        if update {
                            self.pop();
                            let m = self.msym_str("__update")?;
                            let sp = self.cursp();
                            self.genop(op::mkop_abc(Op::SEND, sp, m, 1));
                        }
                        self.push()?;
                        update = true;
                        len = 0;
                    }
                }
                if val {
                    self.pop_n(len as usize * 2);
                    let sp = self.cursp();
                    self.genop(op::mkop_abc(Op::HASH, sp, sp, len));
                    if update {
                        self.pop();
                        let m = self.msym_str("__update")?;
                        let sp = self.cursp();
                        self.genop(op::mkop_abc(Op::SEND, sp, m, 1));
                    }
                    self.push()?;
                }
            }

            NodeKind::Splat(inner) => {
                self.gen(inner, true)?;
            }

            NodeKind::Asgn { lhs, rhs } => {
                self.gen(rhs, true)?;
                self.pop();
                self.gen_assignment(lhs, self.cursp(), val)?;
            }

            NodeKind::Masgn { lhs, rhs } => {
                let rhs = match rhs {
                    Some(r) => r,
                    None => return Err(self.error("malformed multiple assignment")),
                };
                let base = self.cursp();
                let fixed = match &rhs.kind {
                    NodeKind::Array(elems) => {
                        !elems.iter().any(|e| matches!(e.kind, NodeKind::Splat(_)))
                    }
                    _ => false,
                };
                if fixed {
                    let elems = match &rhs.kind {
                        NodeKind::Array(elems) => elems,
                        _ => unreachable!(),
                    };
                    let len = elems.len();
                    for e in elems {
                        self.gen(e, true)?;
                    }
                    let mut n = 0usize;
                    for l in &lhs.pre {
                        self.gen_assignment(l, base + n as u32, false)?;
                        n += 1;
                    }
                    if let Some(rest) = &lhs.rest {
                        let post = lhs.post.len();
                        // rest takes whatever the pre and post targets leave
                        let rn = if len < post + n { 0 } else { len - post - n };
                        let sp = self.cursp();
                        self.genop(op::mkop_abc(Op::ARRAY, sp, base + n as u32, rn as u32));
                        if let Some(target) = rest {
                            self.gen_assignment(target, self.cursp(), false)?;
                        }
                        n += rn;
                        for p in &lhs.post {
                            if n >= len {
                                break;
                            }
                            self.gen_assignment(p, base + n as u32, false)?;
                            n += 1;
                        }
                    }
                    self.pop_n(len);
                    if val {
                        self.genop(op::mkop_abc(Op::ARRAY, base, base, len as u32));
                        self.push()?;
                    }
                } else {
                    self.gen(rhs, true)?;
                    self.gen_vmassignment(lhs, base, val)?;
                    if !val {
                        self.pop();
                    }
                }
            }

            NodeKind::OpAsgn { lhs, op: opsym, rhs } => {
                self.gen_op_asgn(lhs, *opsym, rhs, val)?;
            }

            NodeKind::Super(args) => {
                self.push()?; // room for the receiver
                let mut n = 0u32;
                let mut sendv = false;
                if let Some(ca) = args {
                    if !ca.args.is_empty() {
                        match self.gen_values(&ca.args, true)? {
                            Some(k) => n = k as u32,
                            None => {
                                n = 1;
                                sendv = true;
                                self.push()?;
                            }
                        }
                    }
                }
                let block = args.as_ref().and_then(|ca| ca.block.as_deref());
                if let Some(b) = block {
                    self.gen(b, true)?;
                    self.pop();
                } else {
                    let sp = self.cursp();
                    self.genop(op::mkop_a(Op::LOADNIL, sp));
                    self.push()?;
                    self.pop();
                }
                self.pop_n(n as usize + 1);
                if sendv {
                    n = CALL_MAXARGS;
                }
                let sp = self.cursp();
                self.genop(op::mkop_abc(Op::SUPER, sp, 0, n));
                if val {
                    self.push()?;
                }
            }

            NodeKind::ZSuper { block } => {
                self.push()?; // room for the receiver
                let (lv, ainfo) = self.nearest_mscope();
                let sp = self.cursp();
                self.genop(op::mkop_abx(Op::ARGARY, sp, ((ainfo as u32) << 4) | (lv & 0xf)));
                self.push()?; // ARGARY pushes the argv array and the block
                self.push()?;
                self.pop();
                if let Some(b) = block {
                    self.gen(b, true)?;
                    self.pop();
                }
                self.pop();
                self.pop();
                let sp = self.cursp();
                self.genop(op::mkop_abc(Op::SUPER, sp, 0, CALL_MAXARGS));
                if val {
                    self.push()?;
                }
            }

            NodeKind::Yield(args) => {
                let (lv, ainfo) = self.nearest_mscope();
                let sp = self.cursp();
                self.genop(op::mkop_abx(Op::BLKPUSH, sp, ((ainfo as u32) << 4) | (lv & 0xf)));
                self.push()?;
                let mut n = 0u32;
                let mut sendv = false;
                if !args.is_empty() {
                    match self.gen_values(args, true)? {
                        Some(k) => n = k as u32,
                        None => {
                            n = 1;
                            sendv = true;
                            self.push()?;
                        }
                    }
                }
                self.pop_n(n as usize + 1);
                if sendv {
                    n = CALL_MAXARGS;
                }
                let m = self.msym_str("call")?;
                let sp = self.cursp();
                self.genop(op::mkop_abc(Op::SEND, sp, m, n));
                if val {
                    self.push()?;
                }
            }

            NodeKind::Return(v) => {
                match v {
                    Some(v) => {
                        self.gen(v, true)?;
                        self.pop();
                    }
                    None => {
                        let sp = self.cursp();
                        self.genop(op::mkop_a(Op::LOADNIL, sp));
                    }
                }
                let sp = self.cursp();
                if self.sref().loops.is_empty() {
                    self.genop_peep(op::mkop_ab(Op::RETURN, sp, R_NORMAL), false);
                } else {
                    // non-local return out of the enclosing block
                    self.genop(op::mkop_ab(Op::RETURN, sp, R_RETURN));
                }
                if val {
                    self.push()?;
                }
            }

            NodeKind::Break(v) => {
                self.loop_break(v.as_deref())?;
                if val {
                    self.push()?;
                }
            }

            NodeKind::Next(v) => {
                if self.sref().loops.is_empty() {
                    return Err(self.error("unexpected next"));
                }
                let lp = *self.sref().loops.last().expect("loop");
                if lp.kind == LoopKind::Normal {
                    let level = self.sref().ensure_level;
                    if level > lp.ensure_level {
                        self.genop_peep(op::mkop_a(Op::EPOP, (level - lp.ensure_level) as u32), false);
                    }
                    if let Some(v) = v {
                        self.gen(v, false)?;
                    }
                    let pc = self.sref().pc();
                    self.genop(op::mkop_sbx(Op::JMP, lp.pc1 as i32 - pc as i32));
                } else {
                    // early return from the block
                    match v {
                        Some(v) => {
                            self.gen(v, true)?;
                            self.pop();
                        }
                        None => {
                            let sp = self.cursp();
                            self.genop(op::mkop_a(Op::LOADNIL, sp));
                        }
                    }
                    let sp = self.cursp();
                    self.genop_peep(op::mkop_ab(Op::RETURN, sp, R_NORMAL), false);
                }
                if val {
                    self.push()?;
                }
            }

            NodeKind::Redo => {
                if self.sref().loops.is_empty() {
                    return Err(self.error("unexpected redo"));
                }
                let lp = *self.sref().loops.last().expect("loop");
                let level = self.sref().ensure_level;
                if level > lp.ensure_level {
                    self.genop_peep(op::mkop_a(Op::EPOP, (level - lp.ensure_level) as u32), false);
                }
                let pc = self.sref().pc();
                self.genop(op::mkop_sbx(Op::JMP, lp.pc2 as i32 - pc as i32));
            }

            NodeKind::Retry => {
                let mut begins = 0u32;
                let mut target = None;
                for lf in self.sref().loops.iter().rev() {
                    match lf.kind {
                        LoopKind::Rescue => {
                            target = Some(*lf);
                            break;
                        }
                        LoopKind::Begin => begins += 1,
                        _ => {}
                    }
                }
                let lp = match target {
                    Some(lp) => lp,
                    None => return Err(self.error("unexpected retry")),
                };
                while begins > 0 {
                    self.genop_peep(op::mkop_a(Op::POPERR, 1), false);
                    begins -= 1;
                }
                let level = self.sref().ensure_level;
                if level > lp.ensure_level {
                    self.genop_peep(op::mkop_a(Op::EPOP, (level - lp.ensure_level) as u32), false);
                }
                let pc = self.sref().pc();
                self.genop(op::mkop_sbx(Op::JMP, lp.pc1 as i32 - pc as i32));
            }

            NodeKind::Lvar(name) => {
                if val {
                    if let Some(idx) = self.sref().lv_idx(*name) {
                        let sp = self.cursp();
                        self.genop_peep(op::mkop_ab(Op::MOVE, sp, idx), false);
                    } else if let Some((idx, lv)) = self.upvar(*name) {
                        let sp = self.cursp();
                        self.genop(op::mkop_abc(Op::GETUPVAR, sp, idx, lv));
                    }
                    self.push()?;
                }
            }

            NodeKind::Gvar(name) => {
                if val {
                    let idx = self.sym(*name);
                    let sp = self.cursp();
                    self.genop(op::mkop_abx(Op::GETGLOBAL, sp, idx));
                    self.push()?;
                }
            }

            NodeKind::Ivar(name) => {
                if val {
                    let idx = self.sym(*name);
                    let sp = self.cursp();
                    self.genop(op::mkop_abx(Op::GETIV, sp, idx));
                    self.push()?;
                }
            }

            NodeKind::Cvar(name) => {
                if val {
                    let idx = self.sym(*name);
                    let sp = self.cursp();
                    self.genop(op::mkop_abx(Op::GETCV, sp, idx));
                    self.push()?;
                }
            }

            NodeKind::Const(name) => {
                // constant lookup may raise, so it is emitted even when the
                // value is discarded
                let idx = self.sym(*name);
                let sp = self.cursp();
                self.genop(op::mkop_abx(Op::GETCONST, sp, idx));
                if val {
                    self.push()?;
                }
            }

            NodeKind::Defined(operand) => {
                self.gen(operand, true)?;
            }

            NodeKind::BackRef(ch) => {
                if val {
                    let idx = self.sym_str(&format!("${}", ch));
                    let sp = self.cursp();
                    self.genop(op::mkop_abx(Op::GETGLOBAL, sp, idx));
                    self.push()?;
                }
            }

            NodeKind::NthRef(n) => {
                if val {
                    let idx = self.sym_str(&format!("${}", n));
                    let sp = self.cursp();
                    self.genop(op::mkop_abx(Op::GETGLOBAL, sp, idx));
                    self.push()?;
                }
            }

            NodeKind::BlockArg(inner) => {
                self.gen(inner, true)?;
            }

            NodeKind::Int { text, base } => {
                if val {
                    match self.read_int(text, *base, false)? {
                        Some(i) => self.gen_int(i),
                        None => {
                            let f = self.read_int_float(text, *base)?;
                            let off = self.lit(Value::Float(f));
                            let sp = self.cursp();
                            self.genop(op::mkop_abx(Op::LOADL, sp, off));
                        }
                    }
                    self.push()?;
                }
            }

            NodeKind::Float(text) => {
                if val {
                    let f: f64 = text
                        .parse()
                        .map_err(|_| self.error("malformed float literal"))?;
                    let off = self.lit(Value::Float(f));
                    let sp = self.cursp();
                    self.genop(op::mkop_abx(Op::LOADL, sp, off));
                    self.push()?;
                }
            }

            NodeKind::Negate(inner) => match &inner.kind {
                NodeKind::Float(text) => {
                    if val {
                        let f: f64 = text
                            .parse()
                            .map_err(|_| self.error("malformed float literal"))?;
                        let off = self.lit(Value::Float(-f));
                        let sp = self.cursp();
                        self.genop(op::mkop_abx(Op::LOADL, sp, off));
                        self.push()?;
                    }
                }
                NodeKind::Int { text, base } => {
                    if val {
                        // negate before the range check so the most negative
                        // fixed integer still parses
                        match self.read_int(text, *base, true)? {
                            Some(i) => self.gen_int(i),
                            None => {
                                let f = self.read_int_float(text, *base)?;
                                let off = self.lit(Value::Float(-f));
                                let sp = self.cursp();
                                self.genop(op::mkop_abx(Op::LOADL, sp, off));
                            }
                        }
                        self.push()?;
                    }
                }
                _ => {
                    if val {
                        let minus = self.msym_str("-")?;
                        let sp = self.cursp();
                        self.genop(op::mkop_asbx(Op::LOADI, sp, 0));
                        self.push()?;
                        self.gen(inner, true)?;
                        self.pop();
                        self.pop();
                        let sp = self.cursp();
                        self.genop(op::mkop_abc(Op::SUB, sp, minus, 2));
                        self.push()?;
                    } else {
                        self.gen(inner, false)?;
                    }
                }
            },

            NodeKind::Str(s) => {
                if val {
                    let off = self.lit(Value::Str(s.clone()));
                    let sp = self.cursp();
                    self.genop(op::mkop_abx(Op::STRING, sp, off));
                    self.push()?;
                }
            }

            NodeKind::DStr(parts) | NodeKind::Heredoc(parts) => {
                if val {
                    if parts.is_empty() {
                        return Ok(());
                    }
                    self.gen(&parts[0], true)?;
                    for part in &parts[1..] {
                        self.gen(part, true)?;
                        self.pop();
                        self.pop();
                        let sp = self.cursp();
                        self.genop_peep(op::mkop_ab(Op::STRCAT, sp, sp + 1), true);
                        self.push()?;
                    }
                } else {
                    for part in parts {
                        if !matches!(part.kind, NodeKind::Str(_)) {
                            self.gen(part, false)?;
                        }
                    }
                }
            }

            NodeKind::Words(list) => {
                self.gen_literal_array(list, false, val)?;
            }

            NodeKind::Symbols(list) => {
                self.gen_literal_array(list, true, val)?;
            }

            NodeKind::LiteralDelim => {}

            NodeKind::XStr(text) => {
                let kernel = self.sym_str("Kernel");
                let off = self.lit(Value::Str(text.clone()));
                if !val {
                    self.push()?;
                }
                let sp = self.cursp();
                self.genop(op::mkop_a(Op::OCLASS, sp));
                self.genop(op::mkop_abx(Op::GETMCNST, sp, kernel));
                self.push()?;
                let sp = self.cursp();
                self.genop(op::mkop_abx(Op::STRING, sp, off));
                self.pop();
                let tick = self.sym_str("`");
                let sp = self.cursp();
                self.genop(op::mkop_abc(Op::SEND, sp, tick, 1));
                if val {
                    self.push()?;
                } else {
                    self.pop();
                }
            }

            NodeKind::DXStr(parts) => {
                if parts.is_empty() {
                    return Ok(());
                }
                let kernel = self.sym_str("Kernel");
                if !val {
                    self.push()?;
                }
                let sp = self.cursp();
                self.genop(op::mkop_a(Op::OCLASS, sp));
                self.genop(op::mkop_abx(Op::GETMCNST, sp, kernel));
                self.push()?;
                self.gen(&parts[0], true)?;
                for part in &parts[1..] {
                    self.gen(part, true)?;
                    self.pop();
                    self.pop();
                    let sp = self.cursp();
                    self.genop_peep(op::mkop_ab(Op::STRCAT, sp, sp + 1), true);
                    self.push()?;
                }
                self.pop();
                self.pop();
                let tick = self.sym_str("`");
                let sp = self.cursp();
                self.genop(op::mkop_abc(Op::SEND, sp, tick, 1));
                if val {
                    self.push()?;
                } else {
                    self.pop();
                }
            }

            NodeKind::Regx {
                pattern,
                flags,
                encoding,
            } => {
                if val {
                    let cls = self.sym_str(REGEXP_CLASS);
                    let off = self.lit(Value::Str(pattern.clone()));
                    let sp = self.cursp();
                    self.genop(op::mkop_a(Op::OCLASS, sp));
                    self.genop(op::mkop_abx(Op::GETMCNST, sp, cls));
                    self.push()?;
                    let sp = self.cursp();
                    self.genop(op::mkop_abx(Op::STRING, sp, off));
                    let mut argc = 1u32;
                    if flags.is_some() || encoding.is_some() {
                        self.push()?;
                        let sp = self.cursp();
                        match flags {
                            Some(f) => {
                                let off = self.lit(Value::Str(f.clone()));
                                self.genop(op::mkop_abx(Op::STRING, sp, off));
                            }
                            None => {
                                self.genop(op::mkop_a(Op::LOADNIL, sp));
                            }
                        }
                        argc += 1;
                        if let Some(e) = encoding {
                            self.push()?;
                            let off = self.lit(Value::Str(e.to_string()));
                            let sp = self.cursp();
                            self.genop(op::mkop_abx(Op::STRING, sp, off));
                            argc += 1;
                            self.pop();
                        }
                        self.pop();
                    }
                    self.pop();
                    let compile = self.sym_str("compile");
                    let sp = self.cursp();
                    self.genop(op::mkop_abc(Op::SEND, sp, compile, argc));
                    self.push()?;
                }
            }

            NodeKind::DRegx { parts, tail, flags } => {
                if val {
                    if parts.is_empty() {
                        return Ok(());
                    }
                    let cls = self.sym_str(REGEXP_CLASS);
                    let sp = self.cursp();
                    self.genop(op::mkop_a(Op::OCLASS, sp));
                    self.genop(op::mkop_abx(Op::GETMCNST, sp, cls));
                    self.push()?;
                    self.gen(&parts[0], true)?;
                    for part in &parts[1..] {
                        self.gen(part, true)?;
                        self.pop();
                        self.pop();
                        let sp = self.cursp();
                        self.genop_peep(op::mkop_ab(Op::STRCAT, sp, sp + 1), true);
                        self.push()?;
                    }
                    if let Some(t) = tail {
                        let off = self.lit(Value::Str(t.clone()));
                        let sp = self.cursp();
                        self.genop(op::mkop_abx(Op::STRING, sp, off));
                        self.push()?;
                        self.pop();
                        self.pop();
                        let sp = self.cursp();
                        self.genop_peep(op::mkop_ab(Op::STRCAT, sp, sp + 1), true);
                        self.push()?;
                    }
                    let mut argc = 1u32;
                    if let Some(f) = flags {
                        let off = self.lit(Value::Str(f.clone()));
                        let sp = self.cursp();
                        self.genop(op::mkop_abx(Op::STRING, sp, off));
                        self.push()?;
                        argc += 1;
                        self.pop();
                    }
                    self.pop();
                    self.pop();
                    let compile = self.sym_str("compile");
                    let sp = self.cursp();
                    self.genop(op::mkop_abc(Op::SEND, sp, compile, argc));
                    self.push()?;
                } else {
                    for part in parts {
                        if !matches!(part.kind, NodeKind::Str(_)) {
                            self.gen(part, false)?;
                        }
                    }
                }
            }

            NodeKind::Sym(sym) => {
                if val {
                    let idx = self.sym(*sym);
                    let sp = self.cursp();
                    self.genop(op::mkop_abx(Op::LOADSYM, sp, idx));
                    self.push()?;
                }
            }

            NodeKind::DSym(inner) => {
                self.gen(inner, val)?;
                if val {
                    self.gen_intern()?;
                }
            }

            NodeKind::SelfRef => {
                if val {
                    let sp = self.cursp();
                    self.genop(op::mkop_a(Op::LOADSELF, sp));
                    self.push()?;
                }
            }

            NodeKind::Nil => {
                if val {
                    let sp = self.cursp();
                    self.genop(op::mkop_a(Op::LOADNIL, sp));
                    self.push()?;
                }
            }

            NodeKind::True => {
                if val {
                    let sp = self.cursp();
                    self.genop(op::mkop_a(Op::LOADT, sp));
                    self.push()?;
                }
            }

            NodeKind::False => {
                if val {
                    let sp = self.cursp();
                    self.genop(op::mkop_a(Op::LOADF, sp));
                    self.push()?;
                }
            }

            NodeKind::Alias { new, old } => {
                let a = self.msym(*new)?;
                let b = self.msym(*old)?;
                let c = self.msym_str("alias_method")?;
                let sp = self.cursp();
                self.genop(op::mkop_a(Op::TCLASS, sp));
                self.push()?;
                let sp = self.cursp();
                self.genop(op::mkop_abx(Op::LOADSYM, sp, a));
                self.push()?;
                let sp = self.cursp();
                self.genop(op::mkop_abx(Op::LOADSYM, sp, b));
                self.push()?;
                let sp = self.cursp();
                self.genop(op::mkop_a(Op::LOADNIL, sp));
                self.pop_n(3);
                let sp = self.cursp();
                self.genop(op::mkop_abc(Op::SEND, sp, c, 2));
                if val {
                    self.push()?;
                }
            }

            NodeKind::Undef(names) => {
                let undef = self.msym_str("undef_method")?;
                let sp = self.cursp();
                self.genop(op::mkop_a(Op::TCLASS, sp));
                self.push()?;
                let mut num = 0u32;
                for name in names {
                    let idx = self.msym(*name)?;
                    let sp = self.cursp();
                    self.genop(op::mkop_abx(Op::LOADSYM, sp, idx));
                    self.push()?;
                    num += 1;
                }
                self.pop_n(num as usize + 1);
                let sp = self.cursp();
                self.genop(op::mkop_abc(Op::SEND, sp, undef, num));
                if val {
                    self.push()?;
                }
            }

            NodeKind::Class {
                path,
                superclass,
                body,
            } => {
                match path {
                    ClassPath::Local(_) => {
                        let sp = self.cursp();
                        self.genop(op::mkop_a(Op::LOADNIL, sp));
                        self.push()?;
                    }
                    ClassPath::Root(_) => {
                        let sp = self.cursp();
                        self.genop(op::mkop_a(Op::OCLASS, sp));
                        self.push()?;
                    }
                    ClassPath::In(base, _) => {
                        self.gen(base, true)?;
                    }
                }
                match superclass {
                    Some(sc) => self.gen(sc, true)?,
                    None => {
                        let sp = self.cursp();
                        self.genop(op::mkop_a(Op::LOADNIL, sp));
                        self.push()?;
                    }
                }
                self.pop();
                self.pop();
                let idx = self.msym(path.name())?;
                let sp = self.cursp();
                self.genop(op::mkop_ab(Op::CLASS, sp, idx));
                let bidx = self.scope_body(body, val)?;
                let sp = self.cursp();
                self.genop(op::mkop_abx(Op::EXEC, sp, bidx as u32));
                if val {
                    self.push()?;
                }
            }

            NodeKind::Module { path, body } => {
                match path {
                    ClassPath::Local(_) => {
                        let sp = self.cursp();
                        self.genop(op::mkop_a(Op::LOADNIL, sp));
                        self.push()?;
                    }
                    ClassPath::Root(_) => {
                        let sp = self.cursp();
                        self.genop(op::mkop_a(Op::OCLASS, sp));
                        self.push()?;
                    }
                    ClassPath::In(base, _) => {
                        self.gen(base, true)?;
                    }
                }
                self.pop();
                let idx = self.msym(path.name())?;
                let sp = self.cursp();
                self.genop(op::mkop_ab(Op::MODULE, sp, idx));
                let bidx = self.scope_body(body, val)?;
                let sp = self.cursp();
                self.genop(op::mkop_abx(Op::EXEC, sp, bidx as u32));
                if val {
                    self.push()?;
                }
            }

            NodeKind::SClass { expr, body } => {
                self.gen(expr, true)?;
                self.pop();
                let sp = self.cursp();
                self.genop(op::mkop_ab(Op::SCLASS, sp, sp));
                let bidx = self.scope_body(body, val)?;
                let sp = self.cursp();
                self.genop(op::mkop_abx(Op::EXEC, sp, bidx as u32));
                if val {
                    self.push()?;
                }
            }

            NodeKind::Def { name, body } => {
                let sym = self.msym(*name)?;
                let idx = self.lambda_body(body, false)?;
                let sp = self.cursp();
                self.genop(op::mkop_a(Op::TCLASS, sp));
                self.push()?;
                let sp = self.cursp();
                self.genop(op::mkop_abz(Op::LAMBDA, sp, idx as u32, L_METHOD));
                self.push()?;
                self.pop();
                self.pop();
                let sp = self.cursp();
                self.genop(op::mkop_ab(Op::METHOD, sp, sym));
                if val {
                    let sp = self.cursp();
                    self.genop(op::mkop_abx(Op::LOADSYM, sp, sym));
                    self.push()?;
                }
            }

            NodeKind::SDef { recv, name, body } => {
                let sym = self.msym(*name)?;
                let idx = self.lambda_body(body, false)?;
                self.gen(recv, true)?;
                self.pop();
                let sp = self.cursp();
                self.genop(op::mkop_ab(Op::SCLASS, sp, sp));
                self.push()?;
                let sp = self.cursp();
                self.genop(op::mkop_abz(Op::LAMBDA, sp, idx as u32, L_METHOD));
                self.pop();
                let sp = self.cursp();
                self.genop(op::mkop_ab(Op::METHOD, sp, sym));
                if val {
                    let sp = self.cursp();
                    self.genop(op::mkop_abx(Op::LOADSYM, sp, sym));
                    self.push()?;
                }
            }

            NodeKind::Postexe(body) => {
                self.gen(body, false)?;
            }
        }
        Ok(())
    }

    // one exception-class match round in a rescue clause: the class is on
    // top of the stack, the exception value in `exc`
    fn gen_rescue_match(&mut self, exc: u32, splat: bool, pos2: usize) -> Result<usize, CodegenError> {
        let sp = self.cursp();
        self.genop(op::mkop_ab(Op::MOVE, sp, exc));
        self.pop();
        let m = if splat {
            self.msym_str("__case_eqq")?
        } else {
            self.msym_str("===")?
        };
        let sp = self.cursp();
        self.genop(op::mkop_abc(Op::SEND, sp, m, 1));
        Ok(self.genop(op::mkop_asbx(Op::JMPIF, sp, pos2 as i32)))
    }

    fn gen_op_asgn(
        &mut self,
        lhs: &Node<T::Symbol>,
        opsym: T::Symbol,
        rhs: &Node<T::Symbol>,
        val: bool,
    ) -> Result<(), CodegenError> {
        let opname = self
            .symbols
            .symbol_name(opsym)
            .unwrap_or("")
            .to_string();
        let mut callargs: i32 = -1;
        let mut vsp: i32 = -1;

        if opname == "||" && matches!(lhs.kind, NodeKind::Const(_) | NodeKind::Cvar(_)) {
            // probing an undefined constant raises, so wrap the read in a
            // one-off handler region that yields false instead
            let onerr = self.genop(op::mkop_bx(Op::ONERR, 0));
            self.loop_push(LoopKind::Begin);
            self.s().loops.last_mut().expect("loop").pc1 = onerr;
            let exc = self.cursp();
            self.gen(lhs, true)?;
            self.s().loops.last_mut().expect("loop").kind = LoopKind::Rescue;
            self.genop(op::mkop_a(Op::POPERR, 1));
            let noexc = self.genop(op::mkop_bx(Op::JMP, 0));
            self.dispatch(onerr)?;
            self.genop(op::mkop_a(Op::RESCUE, exc));
            self.genop(op::mkop_a(Op::LOADF, exc));
            self.dispatch(noexc)?;
            self.s().loops.pop();
        } else if let NodeKind::Call {
            recv,
            method,
            args,
            ..
        } = &lhs.kind
        {
            if val {
                vsp = self.cursp() as i32;
                self.push()?;
            }
            self.gen(recv, true)?;
            let idx = self.msym(*method)?;
            let arglist = args.as_ref().filter(|a| !a.args.is_empty());
            if let Some(ca) = arglist {
                if let Some(i) = self.gen_values(&ca.args, true)? {
                    self.pop_n(i);
                    let sp = self.cursp();
                    self.genop(op::mkop_abc(Op::ARRAY, sp, sp, i as u32));
                }
                let sp = self.cursp();
                self.genop(op::mkop_ab(Op::MOVE, sp + 1, sp - 1));
                self.genop(op::mkop_ab(Op::MOVE, sp + 2, sp));
                self.push()?;
                let sp = self.cursp();
                self.genop(op::mkop_abc(Op::SEND, sp, idx, CALL_MAXARGS));
                callargs = CALL_MAXARGS as i32;
            } else {
                let sp = self.cursp();
                self.genop(op::mkop_ab(Op::MOVE, sp, sp - 1));
                self.genop(op::mkop_abc(Op::SEND, sp, idx, 0));
                callargs = 1;
            }
            self.push()?;
        } else {
            self.gen(lhs, true)?;
        }

        if opname == "||" || opname == "&&" {
            self.pop();
            let jop = if opname == "||" { Op::JMPIF } else { Op::JMPNOT };
            let sp = self.cursp();
            let pos = if val {
                self.genop(op::mkop_asbx(jop, sp, 0))
            } else {
                self.genop_peep(op::mkop_asbx(jop, sp, 0), false)
            };
            self.gen(rhs, true)?;
            self.pop();
            self.gen_assignment(lhs, self.cursp(), val)?;
            self.dispatch(pos)?;
            return Ok(());
        }

        self.gen(rhs, true)?;
        self.push()?;
        self.pop();
        self.pop();
        self.pop();

        let idx = self.msym(opsym)?;
        let sp = self.cursp();
        match opname.as_str() {
            "+" => {
                self.genop_peep(op::mkop_abc(Op::ADD, sp, idx, 1), val);
            }
            "-" => {
                self.genop_peep(op::mkop_abc(Op::SUB, sp, idx, 1), val);
            }
            "*" => {
                self.genop(op::mkop_abc(Op::MUL, sp, idx, 1));
            }
            "/" => {
                self.genop(op::mkop_abc(Op::DIV, sp, idx, 1));
            }
            "<" => {
                self.genop(op::mkop_abc(Op::LT, sp, idx, 1));
            }
            "<=" => {
                self.genop(op::mkop_abc(Op::LE, sp, idx, 1));
            }
            ">" => {
                self.genop(op::mkop_abc(Op::GT, sp, idx, 1));
            }
            ">=" => {
                self.genop(op::mkop_abc(Op::GE, sp, idx, 1));
            }
            _ => {
                self.genop(op::mkop_abc(Op::SEND, sp, idx, 1));
            }
        }

        if callargs < 0 {
            self.gen_assignment(lhs, self.cursp(), val)?;
        } else {
            if callargs == CALL_MAXARGS as i32 {
                let sp = self.cursp();
                self.genop(op::mkop_ab(Op::ARYPUSH, sp - 1, sp));
                if val {
                    let sp = self.cursp();
                    self.genop(op::mkop_ab(Op::MOVE, vsp as u32, sp));
                }
                self.pop();
            } else if val {
                let sp = self.cursp();
                self.genop(op::mkop_ab(Op::MOVE, vsp as u32, sp));
            }
            self.pop();
            let method = match &lhs.kind {
                NodeKind::Call { method, .. } => *method,
                _ => return Err(self.error("unknown left-hand side")),
            };
            let setter = self.attrsym(method);
            let sidx = self.msym(setter)?;
            let sp = self.cursp();
            self.genop(op::mkop_abc(Op::SEND, sp, sidx, callargs as u32));
        }
        Ok(())
    }
}
