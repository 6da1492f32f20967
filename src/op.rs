//! Instruction encoding.
//!
//! Instructions are 32-bit words with the opcode in the low seven bits and
//! operand fields packed above it:
//!
//! ```text
//! A:9 | B:9 | C:7 | op:7      A B C
//! A:9 |    Bx:16  | op:7      A Bx   (sBx = Bx biased by MAXARG_SBX)
//! A:9 |  b:14 |c:2| op:7      A b c  (proc index + kind, used by LAMBDA)
//!     Ax:25      | op:7       Ax     (argument descriptor, used by ENTER)
//! ```
//!
//! Jump offsets are stored in `sBx` relative to the jump instruction itself;
//! a resolved jump at `pc` transfers to `pc + sBx`.

use std::fmt;

/// An encoded instruction.
pub type Code = u32;

pub const MAXARG_A: u32 = 0x1ff;
pub const MAXARG_B: u32 = 0x1ff;
pub const MAXARG_C: u32 = 0x7f;
pub const MAXARG_BX: u32 = 0xffff;
pub const MAXARG_SBX: i32 = 0x7fff;
pub const MAXARG_AX: u32 = 0x1ff_ffff;

/// Wire-level argument-count sentinel: the arguments were packed into a
/// single array sitting on top of the stack.
pub const CALL_MAXARGS: u32 = 127;

/// `RETURN` B operands.
pub const R_NORMAL: u32 = 0;
pub const R_BREAK: u32 = 1;
pub const R_RETURN: u32 = 2;

/// `LAMBDA` c operands.
pub const L_METHOD: u32 = 0;
pub const L_LAMBDA: u32 = 1;
pub const L_BLOCK: u32 = 2;

macro_rules! def_op {
    ($($op:ident = $val:expr,)+) => {
        /// VM operations.
        pub struct Op(pub u32);

        mod _hidden {
            #[repr(u32)]
            #[allow(non_camel_case_types)]
            enum __enum_for_compile_time_verification_of_uniqueness {
                $($op = $val,)+
            }
        }

        impl Op {
            $(pub const $op: u32 = $val;)+
        }

        impl fmt::Display for Op {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                match self.0 {
                    $($val => write!(f, "{}", stringify!($op)),)+
                    i => write!(f, "<{:02x}>", i),
                }
            }
        }
    }
}

def_op! {
    NOP = 0,
    MOVE = 1,
    LOADL = 2,
    LOADI = 3,
    LOADSYM = 4,
    LOADNIL = 5,
    LOADSELF = 6,
    LOADT = 7,
    LOADF = 8,
    GETGLOBAL = 9,
    SETGLOBAL = 10,
    GETSPECIAL = 11,
    GETIV = 12,
    SETIV = 13,
    GETCV = 14,
    SETCV = 15,
    GETCONST = 16,
    SETCONST = 17,
    GETMCNST = 18,
    SETMCNST = 19,
    GETUPVAR = 20,
    SETUPVAR = 21,
    JMP = 22,
    JMPIF = 23,
    JMPNOT = 24,
    ONERR = 25,
    RESCUE = 26,
    POPERR = 27,
    RAISE = 28,
    EPUSH = 29,
    EPOP = 30,
    SEND = 31,
    SENDB = 32,
    CALL = 33,
    SUPER = 34,
    ARGARY = 35,
    ENTER = 36,
    RETURN = 37,
    TAILCALL = 38,
    BLKPUSH = 39,
    ADD = 40,
    ADDI = 41,
    SUB = 42,
    SUBI = 43,
    MUL = 44,
    DIV = 45,
    EQ = 46,
    LT = 47,
    LE = 48,
    GT = 49,
    GE = 50,
    ARRAY = 51,
    ARYCAT = 52,
    ARYPUSH = 53,
    AREF = 54,
    APOST = 55,
    STRING = 56,
    STRCAT = 57,
    HASH = 58,
    LAMBDA = 59,
    RANGE = 60,
    OCLASS = 61,
    CLASS = 62,
    MODULE = 63,
    EXEC = 64,
    METHOD = 65,
    SCLASS = 66,
    TCLASS = 67,
    STOP = 68,
    ERR = 69,
}

pub fn get_opcode(i: Code) -> u32 {
    i & 0x7f
}

pub fn getarg_a(i: Code) -> u32 {
    (i >> 23) & MAXARG_A
}

pub fn getarg_b(i: Code) -> u32 {
    (i >> 14) & MAXARG_B
}

pub fn getarg_c(i: Code) -> u32 {
    (i >> 7) & MAXARG_C
}

pub fn getarg_bx(i: Code) -> u32 {
    (i >> 7) & MAXARG_BX
}

pub fn getarg_sbx(i: Code) -> i32 {
    getarg_bx(i) as i32 - MAXARG_SBX
}

pub fn getarg_ax(i: Code) -> u32 {
    (i >> 7) & MAXARG_AX
}

/// The 14-bit half of a `b:14 | c:2` split.
pub fn getarg_bz(i: Code) -> u32 {
    getarg_bx(i) >> 2
}

/// The 2-bit half of a `b:14 | c:2` split.
pub fn getarg_cz(i: Code) -> u32 {
    getarg_bx(i) & 3
}

pub fn mkop_a(op: u32, a: u32) -> Code {
    op | (a & MAXARG_A) << 23
}

pub fn mkop_ab(op: u32, a: u32, b: u32) -> Code {
    mkop_a(op, a) | (b & MAXARG_B) << 14
}

pub fn mkop_abc(op: u32, a: u32, b: u32, c: u32) -> Code {
    mkop_ab(op, a, b) | (c & MAXARG_C) << 7
}

pub fn mkop_abx(op: u32, a: u32, bx: u32) -> Code {
    mkop_a(op, a) | (bx & MAXARG_BX) << 7
}

pub fn mkop_bx(op: u32, bx: u32) -> Code {
    mkop_abx(op, 0, bx)
}

pub fn mkop_sbx(op: u32, sbx: i32) -> Code {
    mkop_bx(op, (sbx + MAXARG_SBX) as u32)
}

pub fn mkop_asbx(op: u32, a: u32, sbx: i32) -> Code {
    mkop_abx(op, a, (sbx + MAXARG_SBX) as u32)
}

pub fn mkop_ax(op: u32, ax: u32) -> Code {
    op | (ax & MAXARG_AX) << 7
}

/// `A b c` shape: a 14-bit operand and a 2-bit operand in the `Bx` field.
pub fn mkop_abz(op: u32, a: u32, b: u32, c: u32) -> Code {
    mkop_abx(op, a, ((b & 0x3fff) << 2) | (c & 3))
}

/// Packs a method argument descriptor into the 25-bit `Ax` field carried by
/// `ENTER`: required:5 | optional:5 | rest:1 | post:5 | keyword:5 |
/// keyword-dict:1 | block:1.
pub fn pack_aspec(req: u32, opt: u32, rest: bool, post: u32, kw: u32, kw_dict: bool, block: bool) -> u32 {
    (req & 0x1f) << 18
        | (opt & 0x1f) << 13
        | (rest as u32) << 12
        | (post & 0x1f) << 7
        | (kw & 0x1f) << 2
        | (kw_dict as u32) << 1
        | block as u32
}

/// The 12-bit aspec derivative carried by `SUPER`/`ARGARY`/`BLKPUSH` to
/// recover a frame's argv: (required+optional):6 | rest:1 | post:5.
pub fn pack_ainfo(req: u32, opt: u32, rest: bool, post: u32) -> u32 {
    ((req + opt) & 0x3f) << 6 | (rest as u32) << 5 | (post & 0x1f)
}

/// Renders one instruction as `MNEMONIC operands`.
pub fn disasm(i: Code) -> String {
    let c = get_opcode(i);
    match c {
        Op::NOP | Op::STOP => format!("{}", Op(c)),
        Op::LOADNIL | Op::LOADSELF | Op::LOADT | Op::LOADF | Op::RESCUE | Op::RAISE
        | Op::POPERR | Op::EPOP | Op::OCLASS | Op::TCLASS | Op::CALL => {
            format!("{}\t{}", Op(c), getarg_a(i))
        }
        Op::MOVE | Op::ARYCAT | Op::ARYPUSH | Op::STRCAT | Op::CLASS | Op::MODULE
        | Op::SCLASS | Op::METHOD | Op::RETURN => {
            format!("{}\t{}, {}", Op(c), getarg_a(i), getarg_b(i))
        }
        Op::LOADI | Op::JMPIF | Op::JMPNOT => {
            format!("{}\t{}, {}", Op(c), getarg_a(i), getarg_sbx(i))
        }
        Op::JMP | Op::ONERR => format!("{}\t{}", Op(c), getarg_sbx(i)),
        Op::EPUSH => format!("{}\t{}", Op(c), getarg_bx(i)),
        Op::LOADL | Op::LOADSYM | Op::GETGLOBAL | Op::SETGLOBAL | Op::GETSPECIAL
        | Op::GETIV | Op::SETIV | Op::GETCV | Op::SETCV | Op::GETCONST | Op::SETCONST
        | Op::GETMCNST | Op::SETMCNST | Op::STRING | Op::EXEC | Op::ARGARY
        | Op::BLKPUSH | Op::ERR => {
            format!("{}\t{}, {}", Op(c), getarg_a(i), getarg_bx(i))
        }
        Op::ENTER => format!("{}\t{:07x}", Op(c), getarg_ax(i)),
        Op::LAMBDA => format!("{}\t{}, {}, {}", Op(c), getarg_a(i), getarg_bz(i), getarg_cz(i)),
        _ => format!("{}\t{}, {}, {}", Op(c), getarg_a(i), getarg_b(i), getarg_c(i)),
    }
}
