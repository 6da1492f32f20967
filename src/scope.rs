//! Per-unit compilation state.
//!
//! A `Scope` accumulates everything that becomes one [`Irep`](crate::Irep):
//! the instruction buffer with its parallel line table, the literal pool and
//! symbol table, finished sub-procedures, and the simulated register stack
//! whose high-water mark becomes the unit's register count. The generator
//! keeps scopes on a stack; the innermost one receives all emissions.

use crate::irep::{FileSpan, Value};
use crate::op::{self, Code, Op};
use crate::Irep;
use crate::SymbolTable;
use smallvec::SmallVec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopKind {
    Normal,
    Block,
    For,
    Begin,
    Rescue,
}

/// Bookkeeping for one enclosing loop-like construct.
///
/// `pc1` is the continue target, `pc2` the body restart point for `redo`,
/// `pc3` the head of the chained break-jump list, and `acc` the register a
/// `break` value lands in.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LoopInfo {
    pub kind: LoopKind,
    pub pc1: usize,
    pub pc2: usize,
    pub pc3: usize,
    pub acc: u32,
    pub ensure_level: u16,
}

pub(crate) struct Scope<T: SymbolTable> {
    pub iseq: Vec<Code>,
    pub lines: Vec<u16>,
    pub pool: Vec<Value>,
    pub syms: Vec<Option<T::Symbol>>,
    pub reps: Vec<Irep<T>>,
    /// Local slots by name; slot `i` occupies register `i + 1`.
    pub lv: Vec<Option<T::Symbol>>,

    /// Next free register.
    pub sp: i32,
    pub nlocals: u16,
    pub nregs: u16,
    /// Highest pc that is a jump target; the peephole never rewrites across it.
    pub lastlabel: usize,
    /// Packed arity of this unit's parameters, for `SUPER`/`ARGARY`/`BLKPUSH`.
    pub ainfo: u16,
    /// True for method scopes (not blocks).
    pub mscope: bool,

    pub loops: SmallVec<[LoopInfo; 4]>,
    pub ensure_level: u16,

    pub lineno: u16,
    pub filename_index: u16,
    pub debug: Vec<FileSpan>,

    pub no_peephole: bool,
}

impl<T: SymbolTable> Scope<T> {
    pub fn new(lv: Vec<Option<T::Symbol>>, filename_index: u16, lineno: u16, no_peephole: bool) -> Scope<T> {
        let nlocals = lv.len() as u16 + 1; // locals plus self
        Scope {
            iseq: Vec::new(),
            lines: Vec::new(),
            pool: Vec::new(),
            syms: Vec::new(),
            reps: Vec::new(),
            lv,
            sp: nlocals as i32,
            nlocals,
            nregs: 0,
            lastlabel: 0,
            ainfo: 0,
            mscope: false,
            loops: SmallVec::new(),
            ensure_level: 0,
            lineno,
            filename_index,
            debug: vec![FileSpan {
                start: 0,
                filename_index,
            }],
            no_peephole,
        }
    }

    pub fn pc(&self) -> usize {
        self.iseq.len()
    }

    /// Appends one instruction, recording the current line, and returns its pc.
    pub fn genop(&mut self, i: Code) -> usize {
        self.iseq.push(i);
        self.lines.push(self.lineno);
        self.iseq.len() - 1
    }

    /// Removes the most recently emitted instruction.
    pub fn drop_last(&mut self) {
        self.iseq.pop();
        self.lines.pop();
    }

    /// Marks the current pc as a jump target and returns it.
    pub fn new_label(&mut self) -> usize {
        self.lastlabel = self.pc();
        self.pc()
    }

    /// Patches the jump at `pc` to target the current pc. Returns false if
    /// the instruction there is not a jump (an internal invariant violation).
    pub fn dispatch(&mut self, pc: usize) -> bool {
        let i = self.iseq[pc];
        let c = op::get_opcode(i);
        self.lastlabel = self.pc();
        match c {
            Op::JMP | Op::JMPIF | Op::JMPNOT | Op::ONERR => {}
            _ => return false,
        }
        let diff = self.pc() as i32 - pc as i32;
        self.iseq[pc] = op::mkop_asbx(c, op::getarg_a(i), diff);
        true
    }

    /// Resolves a chain of forward jumps threaded through their `sBx` fields
    /// (zero-terminated, links are absolute pcs). `pc == 0` is the empty
    /// chain.
    pub fn dispatch_linked(&mut self, mut pc: usize) -> bool {
        if pc == 0 {
            return true;
        }
        loop {
            let pos = op::getarg_sbx(self.iseq[pc]);
            if !self.dispatch(pc) {
                return false;
            }
            if pos == 0 {
                break;
            }
            pc = pos as usize;
        }
        true
    }

    /// Interns a literal in the unit's pool, deduplicating by value.
    pub fn new_lit(&mut self, val: Value) -> usize {
        let found = self.pool.iter().position(|v| match (v, &val) {
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            _ => false,
        });
        match found {
            Some(i) => i,
            None => {
                self.pool.push(val);
                self.pool.len() - 1
            }
        }
    }

    /// Interns a method symbol in the first 256 slots, reusing reserved
    /// holes. Returns `None` when the window is full.
    pub fn new_msym(&mut self, sym: T::Symbol) -> Option<u32> {
        let len = self.syms.len().min(256);
        for i in 0..len {
            match self.syms[i] {
                Some(s) if s == sym => return Some(i as u32),
                None => {
                    self.syms[i] = Some(sym);
                    return Some(i as u32);
                }
                _ => {}
            }
        }
        if len == 256 {
            return None;
        }
        self.syms.push(Some(sym));
        Some(self.syms.len() as u32 - 1)
    }

    /// Interns a symbol in the general table. Crossing 125 entries reserves
    /// the rest of the 256-slot method-symbol window so later method symbols
    /// can still land below the `Bx` boundary.
    pub fn new_sym(&mut self, sym: T::Symbol) -> usize {
        if let Some(i) = self.syms.iter().position(|s| *s == Some(sym)) {
            return i;
        }
        if self.syms.len() > 125 && self.syms.len() < 256 {
            self.syms.resize(256, None);
        }
        self.syms.push(Some(sym));
        self.syms.len() - 1
    }

    /// 1-based register index of a named local, if declared in this scope.
    pub fn lv_idx(&self, name: T::Symbol) -> Option<u32> {
        self.lv
            .iter()
            .position(|l| *l == Some(name))
            .map(|i| i as u32 + 1)
    }
}
