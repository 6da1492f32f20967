//! Peephole optimization over the last emitted instruction.
//!
//! [`Scope::genop_peep`] is used in place of the raw emitter wherever the new
//! instruction may fuse with its predecessor. It never fires across a jump
//! target (`lastlabel`) and never reorders existing instructions; each rule
//! either elides the new instruction, rewrites the previous one in place, or
//! falls through to a plain append. Rewrites return 0 (no new pc); only the
//! branch-retarget rule returns the rewritten jump's pc, which callers thread
//! into dispatch chains.

use crate::irep::Value;
use crate::op::{self, Code, Op, R_NORMAL};
use crate::scope::Scope;
use crate::SymbolTable;

impl<T: SymbolTable> Scope<T> {
    pub fn genop_peep(&mut self, i: Code, val: bool) -> usize {
        if self.no_peephole || self.lastlabel == self.pc() || self.pc() == 0 {
            return self.genop(i);
        }
        let i0 = self.iseq[self.pc() - 1];
        let c1 = op::get_opcode(i);
        let c0 = op::get_opcode(i0);
        let nlocals = self.nlocals as u32;

        match c1 {
            Op::MOVE => {
                if op::getarg_a(i) == op::getarg_b(i) {
                    // useless move
                    return 0;
                }
                if !val {
                    match c0 {
                        Op::MOVE => {
                            if op::getarg_a(i) == op::getarg_a(i0) {
                                // overridden move
                                self.drop_last();
                                return self.genop(i);
                            }
                            if op::getarg_b(i) == op::getarg_a(i0)
                                && op::getarg_a(i) == op::getarg_b(i0)
                            {
                                // swapping move
                                return 0;
                            }
                            if op::getarg_b(i) == op::getarg_a(i0)
                                && op::getarg_a(i0) >= nlocals
                            {
                                self.drop_last();
                                return self.genop_peep(
                                    op::mkop_ab(Op::MOVE, op::getarg_a(i), op::getarg_b(i0)),
                                    val,
                                );
                            }
                        }
                        Op::LOADI => {
                            if op::getarg_b(i) == op::getarg_a(i0) && op::getarg_a(i0) >= nlocals {
                                let pc = self.pc();
                                self.iseq[pc - 1] =
                                    op::mkop_asbx(Op::LOADI, op::getarg_a(i), op::getarg_sbx(i0));
                                return 0;
                            }
                        }
                        Op::ARRAY | Op::HASH | Op::RANGE | Op::AREF | Op::GETUPVAR => {
                            if op::getarg_b(i) == op::getarg_a(i0) && op::getarg_a(i0) >= nlocals {
                                let pc = self.pc();
                                self.iseq[pc - 1] = op::mkop_abc(
                                    c0,
                                    op::getarg_a(i),
                                    op::getarg_b(i0),
                                    op::getarg_c(i0),
                                );
                                return 0;
                            }
                        }
                        Op::LOADSYM | Op::GETGLOBAL | Op::GETIV | Op::GETCV | Op::GETCONST
                        | Op::GETSPECIAL | Op::LOADL | Op::STRING => {
                            if op::getarg_b(i) == op::getarg_a(i0) && op::getarg_a(i0) >= nlocals {
                                let pc = self.pc();
                                self.iseq[pc - 1] =
                                    op::mkop_abx(c0, op::getarg_a(i), op::getarg_bx(i0));
                                return 0;
                            }
                        }
                        Op::SCLASS => {
                            if op::getarg_b(i) == op::getarg_a(i0) && op::getarg_a(i0) >= nlocals {
                                let pc = self.pc();
                                self.iseq[pc - 1] =
                                    op::mkop_ab(c0, op::getarg_a(i), op::getarg_b(i0));
                                return 0;
                            }
                        }
                        Op::LOADNIL | Op::LOADSELF | Op::LOADT | Op::LOADF | Op::OCLASS => {
                            if op::getarg_b(i) == op::getarg_a(i0) && op::getarg_a(i0) >= nlocals {
                                let pc = self.pc();
                                self.iseq[pc - 1] = op::mkop_a(c0, op::getarg_a(i));
                                return 0;
                            }
                        }
                        _ => {}
                    }
                }
            }
            Op::SETIV | Op::SETCV | Op::SETCONST | Op::SETMCNST | Op::SETGLOBAL => {
                if !val && c0 == Op::MOVE && op::getarg_a(i) == op::getarg_a(i0) {
                    let pc = self.pc();
                    self.iseq[pc - 1] = op::mkop_abx(c1, op::getarg_b(i0), op::getarg_bx(i));
                    return 0;
                }
            }
            Op::SETUPVAR => {
                if !val && c0 == Op::MOVE && op::getarg_a(i) == op::getarg_a(i0) {
                    let pc = self.pc();
                    self.iseq[pc - 1] =
                        op::mkop_abc(c1, op::getarg_b(i0), op::getarg_b(i), op::getarg_c(i));
                    return 0;
                }
            }
            Op::EPOP => {
                if c0 == Op::EPOP {
                    let pc = self.pc();
                    self.iseq[pc - 1] =
                        op::mkop_a(Op::EPOP, op::getarg_a(i0) + op::getarg_a(i));
                    return 0;
                }
            }
            Op::POPERR => {
                if c0 == Op::POPERR {
                    let pc = self.pc();
                    self.iseq[pc - 1] =
                        op::mkop_a(Op::POPERR, op::getarg_a(i0) + op::getarg_a(i));
                    return 0;
                }
            }
            Op::RETURN => match c0 {
                Op::RETURN => return 0,
                Op::MOVE => {
                    if op::getarg_a(i0) >= nlocals {
                        let pc = self.pc();
                        self.iseq[pc - 1] =
                            op::mkop_ab(Op::RETURN, op::getarg_b(i0), R_NORMAL);
                        return 0;
                    }
                }
                Op::SETIV | Op::SETCV | Op::SETCONST | Op::SETMCNST | Op::SETUPVAR
                | Op::SETGLOBAL => {
                    // fold the store's source register into the return,
                    // letting the store itself fuse further first
                    self.drop_last();
                    self.genop_peep(i0, false);
                    let i0 = self.iseq[self.pc() - 1];
                    return self.genop(op::mkop_ab(Op::RETURN, op::getarg_a(i0), R_NORMAL));
                }
                _ => {}
            },
            Op::ADD | Op::SUB => {
                if c0 == Op::LOADI {
                    let mut k = op::getarg_sbx(i0);
                    if c1 == Op::SUB {
                        k = -k;
                    }
                    if (-127..=127).contains(&k) {
                        let pc = self.pc();
                        self.iseq[pc - 1] = if k >= 0 {
                            op::mkop_abc(Op::ADDI, op::getarg_a(i), op::getarg_b(i), k as u32)
                        } else {
                            op::mkop_abc(Op::SUBI, op::getarg_a(i), op::getarg_b(i), (-k) as u32)
                        };
                        return 0;
                    }
                }
            }
            Op::STRCAT => {
                if c0 == Op::STRING {
                    if let Some(Value::Str(s)) = self.pool.get(op::getarg_bx(i0) as usize) {
                        if s.is_empty() {
                            self.drop_last();
                            return 0;
                        }
                    }
                }
                if c0 == Op::LOADNIL && op::getarg_b(i) == op::getarg_a(i0) {
                    self.drop_last();
                    return 0;
                }
            }
            Op::JMPIF | Op::JMPNOT => {
                if c0 == Op::MOVE && op::getarg_a(i) == op::getarg_a(i0) {
                    let pc = self.pc();
                    self.iseq[pc - 1] = op::mkop_asbx(c1, op::getarg_b(i0), op::getarg_sbx(i));
                    return pc - 1;
                }
            }
            _ => {}
        }
        self.genop(i)
    }
}
