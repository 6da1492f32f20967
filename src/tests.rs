//! End-to-end compilation scenarios over hand-built syntax trees.

use crate::ast::*;
use crate::op::{self, Op, CALL_MAXARGS, L_BLOCK, R_NORMAL};
use crate::{generate, CodegenError, Irep, ParserState, Symbol, SymbolTable, Symbols};

fn n(kind: NodeKind<Symbol>) -> Node<Symbol> {
    Node::new(kind)
}

fn bx(kind: NodeKind<Symbol>) -> Box<Node<Symbol>> {
    Box::new(Node::new(kind))
}

fn int(text: &str) -> NodeKind<Symbol> {
    NodeKind::Int {
        text: text.to_string(),
        base: 10,
    }
}

fn program(locals: Vec<Option<Symbol>>, body: NodeKind<Symbol>) -> ParserState<Symbol> {
    ParserState {
        tree: n(NodeKind::Scope(ScopeBody {
            locals,
            body: bx(body),
        })),
        filenames: vec!["test.grb".to_string()],
        filename_index: 0,
        no_optimize: false,
    }
}

fn compile_with(
    table: &mut Symbols,
    locals: Vec<Option<Symbol>>,
    body: NodeKind<Symbol>,
) -> Irep<Symbols> {
    generate(table, &program(locals, body)).expect("compile failed")
}

fn compile(table: &mut Symbols, body: NodeKind<Symbol>) -> Irep<Symbols> {
    compile_with(table, vec![], body)
}

fn compile_err(
    table: &mut Symbols,
    locals: Vec<Option<Symbol>>,
    body: NodeKind<Symbol>,
) -> CodegenError {
    generate(table, &program(locals, body)).expect_err("compile unexpectedly succeeded")
}

fn opcodes(irep: &Irep<Symbols>) -> Vec<u32> {
    irep.iseq.iter().map(|&i| op::get_opcode(i)).collect()
}

fn count_op(irep: &Irep<Symbols>, c: u32) -> usize {
    irep.iseq.iter().filter(|&&i| op::get_opcode(i) == c).count()
}

fn check_jumps(irep: &Irep<Symbols>) {
    for (pc, &i) in irep.iseq.iter().enumerate() {
        match op::get_opcode(i) {
            Op::JMP | Op::JMPIF | Op::JMPNOT | Op::ONERR => {
                let target = pc as i32 + op::getarg_sbx(i);
                assert!(
                    target >= 0 && (target as usize) < irep.iseq.len(),
                    "jump at {} escapes [0, {}): {}",
                    pc,
                    irep.iseq.len(),
                    op::disasm(i)
                );
            }
            _ => {}
        }
    }
    for rep in &irep.reps {
        check_jumps(rep);
    }
}

#[test]
fn integer_literal() {
    let mut t = Symbols::new();
    let irep = compile(&mut t, int("1"));
    assert_eq!(
        irep.iseq,
        vec![op::mkop_asbx(Op::LOADI, 1, 1), op::mkop_a(Op::STOP, 0)]
    );
    assert_eq!(irep.nregs, 2);
    assert_eq!(irep.nlocals, 1);
    assert!(irep.pool.is_empty());
}

#[test]
fn assignment_folds_into_load() {
    let mut t = Symbols::new();
    let x = t.symbol("x");
    let irep = compile_with(
        &mut t,
        vec![Some(x)],
        NodeKind::Begin(vec![
            n(NodeKind::Asgn {
                lhs: bx(NodeKind::Lvar(x)),
                rhs: bx(int("42")),
            }),
            n(NodeKind::Nil),
        ]),
    );
    assert_eq!(irep.iseq[0], op::mkop_asbx(Op::LOADI, 1, 42));
    assert_eq!(count_op(&irep, Op::MOVE), 0);
}

#[test]
fn literal_condition_folds_to_taken_branch() {
    let mut t = Symbols::new();
    let f = t.symbol("f");
    let irep = compile(
        &mut t,
        NodeKind::Def {
            name: f,
            body: Box::new(BlockBody {
                locals: vec![],
                params: None,
                body: bx(NodeKind::If {
                    cond: bx(NodeKind::True),
                    then: Some(bx(int("1"))),
                    els: Some(bx(int("2"))),
                }),
            }),
        },
    );
    let method = &irep.reps[0];
    assert_eq!(
        method.iseq,
        vec![
            op::mkop_asbx(Op::LOADI, 1, 1),
            op::mkop_ab(Op::RETURN, 1, R_NORMAL),
        ]
    );
}

#[test]
fn plus_call_uses_immediate_add() {
    let mut t = Symbols::new();
    let a = t.symbol("a");
    let plus = t.symbol("+");
    let irep = compile_with(
        &mut t,
        vec![Some(a)],
        NodeKind::Call {
            recv: bx(NodeKind::Lvar(a)),
            method: plus,
            args: Some(CallArgs {
                args: vec![n(int("1"))],
                block: None,
            }),
            safe: false,
        },
    );
    assert_eq!(
        irep.iseq,
        vec![
            op::mkop_ab(Op::MOVE, 2, 1),
            op::mkop_abc(Op::ADDI, 2, 0, 1),
            op::mkop_a(Op::STOP, 0),
        ]
    );
}

#[test]
fn while_loop_shape() {
    let mut t = Symbols::new();
    let irep = compile(
        &mut t,
        NodeKind::While {
            cond: bx(NodeKind::True),
            body: bx(NodeKind::Nil),
        },
    );
    assert_eq!(
        irep.iseq,
        vec![
            op::mkop_sbx(Op::JMP, 1),
            op::mkop_a(Op::LOADT, 1),
            op::mkop_asbx(Op::JMPIF, 1, -1),
            op::mkop_a(Op::LOADNIL, 1),
            op::mkop_a(Op::STOP, 0),
        ]
    );
    check_jumps(&irep);
}

#[test]
fn rescue_clause_shape() {
    let mut t = Symbols::new();
    let e = t.symbol("e");
    let raise = t.symbol("raise");
    let err_class = t.symbol("MyError");
    let irep = compile_with(
        &mut t,
        vec![Some(e)],
        NodeKind::Rescue {
            body: Some(bx(NodeKind::Call {
                recv: bx(NodeKind::SelfRef),
                method: raise,
                args: None,
                safe: false,
            })),
            clauses: vec![RescueClause {
                classes: vec![n(NodeKind::Const(err_class))],
                var: Some(bx(NodeKind::Lvar(e))),
                body: None,
            }],
            else_body: None,
        },
    );
    assert_eq!(
        opcodes(&irep),
        vec![
            Op::ONERR,
            Op::LOADSELF,
            Op::SEND,
            Op::JMP,
            Op::RESCUE,
            Op::GETCONST,
            Op::MOVE,
            Op::SEND,
            Op::JMPIF,
            Op::JMP,
            Op::MOVE,
            Op::JMP,
            Op::RAISE,
            Op::POPERR,
            Op::STOP,
        ]
    );
    // the handler entry is where ONERR lands
    assert_eq!(op::getarg_sbx(irep.iseq[0]), 4);
    check_jumps(&irep);
}

#[test]
fn or_assign_short_circuits() {
    let mut t = Symbols::new();
    let x = t.symbol("x");
    let or = t.symbol("||");
    let irep = compile_with(
        &mut t,
        vec![Some(x)],
        NodeKind::Begin(vec![
            n(NodeKind::OpAsgn {
                lhs: bx(NodeKind::Lvar(x)),
                op: or,
                rhs: bx(int("1")),
            }),
            n(NodeKind::Nil),
        ]),
    );
    assert_eq!(
        irep.iseq,
        vec![
            op::mkop_asbx(Op::JMPIF, 1, 2),
            op::mkop_asbx(Op::LOADI, 1, 1),
            op::mkop_a(Op::LOADNIL, 2),
            op::mkop_a(Op::STOP, 0),
        ]
    );
}

#[test]
fn safe_navigation_skips_call_on_nil() {
    let mut t = Symbols::new();
    let a = t.symbol("a");
    let b = t.symbol("b");
    let irep = compile_with(
        &mut t,
        vec![Some(a)],
        NodeKind::Call {
            recv: bx(NodeKind::Lvar(a)),
            method: b,
            args: None,
            safe: true,
        },
    );
    assert_eq!(
        opcodes(&irep),
        vec![Op::MOVE, Op::LOADNIL, Op::MOVE, Op::EQ, Op::JMPIF, Op::SEND, Op::STOP]
    );
    // the skip jump resolves to just past the send
    assert_eq!(op::getarg_sbx(irep.iseq[4]), 2);
    check_jumps(&irep);
}

#[test]
fn block_captures_enclosing_local() {
    let mut t = Symbols::new();
    let x = t.symbol("x");
    let each = t.symbol("each");
    let irep = compile_with(
        &mut t,
        vec![Some(x)],
        NodeKind::Call {
            recv: bx(NodeKind::Array(vec![n(int("1"))])),
            method: each,
            args: Some(CallArgs {
                args: vec![],
                block: Some(bx(NodeKind::Block(Box::new(BlockBody {
                    locals: vec![],
                    params: None,
                    body: bx(NodeKind::Begin(vec![
                        n(NodeKind::Asgn {
                            lhs: bx(NodeKind::Lvar(x)),
                            rhs: bx(int("2")),
                        }),
                        n(NodeKind::Lvar(x)),
                    ])),
                })))),
            }),
            safe: false,
        },
    );
    assert_eq!(count_op(&irep, Op::SENDB), 1);
    assert_eq!(count_op(&irep, Op::LAMBDA), 1);
    let block = &irep.reps[0];
    assert!(block.iseq.contains(&op::mkop_abc(Op::SETUPVAR, 1, 1, 0)));
    assert!(block.iseq.contains(&op::mkop_abc(Op::GETUPVAR, 1, 1, 0)));
}

#[test]
fn for_loop_lowers_to_each_block() {
    let mut t = Symbols::new();
    let i = t.symbol("i");
    let irep = compile_with(
        &mut t,
        vec![Some(i)],
        NodeKind::For {
            var: MultiLhs {
                pre: vec![n(NodeKind::Lvar(i))],
                rest: None,
                post: vec![],
            },
            iter: bx(NodeKind::Array(vec![n(int("1"))])),
            body: bx(NodeKind::Lvar(i)),
        },
    );
    assert_eq!(count_op(&irep, Op::SENDB), 1);
    let lambda = irep
        .iseq
        .iter()
        .copied()
        .find(|&c| op::get_opcode(c) == Op::LAMBDA)
        .expect("no block literal emitted");
    assert_eq!(op::getarg_cz(lambda), L_BLOCK);
    let block = &irep.reps[0];
    assert_eq!(
        block.iseq,
        vec![
            op::mkop_ax(Op::ENTER, 0x40000),
            op::mkop_abc(Op::SETUPVAR, 1, 1, 0),
            op::mkop_abc(Op::GETUPVAR, 2, 1, 0),
            op::mkop_ab(Op::RETURN, 2, R_NORMAL),
        ]
    );
}

#[test]
fn ensure_region_is_balanced() {
    let mut t = Symbols::new();
    let irep = compile(
        &mut t,
        NodeKind::Ensure {
            body: bx(int("1")),
            ensure: ScopeBody {
                locals: vec![],
                body: bx(NodeKind::Nil),
            },
        },
    );
    assert_eq!(
        opcodes(&irep),
        vec![Op::EPUSH, Op::LOADI, Op::EPOP, Op::STOP]
    );
    assert_eq!(op::getarg_bx(irep.iseq[0]), 0); // ensure handler is rep 0
    assert_eq!(op::getarg_a(irep.iseq[2]), 1);
    assert_eq!(irep.reps.len(), 1);
    assert_eq!(
        opcodes(&irep.reps[0]),
        vec![Op::LOADNIL, Op::RETURN]
    );
}

#[test]
fn zsuper_forwards_method_arguments() {
    let mut t = Symbols::new();
    let f = t.symbol("f");
    let p = t.symbol("p");
    let irep = compile(
        &mut t,
        NodeKind::Def {
            name: f,
            body: Box::new(BlockBody {
                locals: vec![Some(p)],
                params: Some(Params {
                    mandatory: vec![p],
                    optional: vec![],
                    rest: false,
                    post: vec![],
                    block: false,
                }),
                body: bx(NodeKind::ZSuper { block: None }),
            }),
        },
    );
    let method = &irep.reps[0];
    let argary = method
        .iseq
        .iter()
        .copied()
        .find(|&c| op::get_opcode(c) == Op::ARGARY)
        .expect("no ARGARY emitted");
    // one mandatory argument, depth 0
    assert_eq!(op::getarg_bx(argary), (1 << 6) << 4);
    let sup = method
        .iseq
        .iter()
        .copied()
        .find(|&c| op::get_opcode(c) == Op::SUPER)
        .expect("no SUPER emitted");
    assert_eq!(op::getarg_c(sup), CALL_MAXARGS);
}

#[test]
fn yield_sends_call_to_block() {
    let mut t = Symbols::new();
    let f = t.symbol("f");
    let p = t.symbol("p");
    let irep = compile(
        &mut t,
        NodeKind::Def {
            name: f,
            body: Box::new(BlockBody {
                locals: vec![Some(p)],
                params: Some(Params {
                    mandatory: vec![p],
                    optional: vec![],
                    rest: false,
                    post: vec![],
                    block: false,
                }),
                body: bx(NodeKind::Yield(vec![n(NodeKind::Lvar(p))])),
            }),
        },
    );
    let method = &irep.reps[0];
    assert_eq!(count_op(method, Op::BLKPUSH), 1);
    let send = method
        .iseq
        .iter()
        .copied()
        .find(|&c| op::get_opcode(c) == Op::SEND)
        .expect("no SEND emitted");
    assert_eq!(op::getarg_c(send), 1);
}

#[test]
fn fixed_multiple_assignment() {
    let mut t = Symbols::new();
    let a = t.symbol("a");
    let b = t.symbol("b");
    let irep = compile_with(
        &mut t,
        vec![Some(a), Some(b)],
        NodeKind::Begin(vec![
            n(NodeKind::Masgn {
                lhs: MultiLhs {
                    pre: vec![n(NodeKind::Lvar(a)), n(NodeKind::Lvar(b))],
                    rest: None,
                    post: vec![],
                },
                rhs: Some(bx(NodeKind::Array(vec![n(int("1")), n(int("2"))]))),
            }),
            n(NodeKind::Nil),
        ]),
    );
    assert_eq!(
        &irep.iseq[..4],
        &[
            op::mkop_asbx(Op::LOADI, 3, 1),
            op::mkop_asbx(Op::LOADI, 4, 2),
            op::mkop_ab(Op::MOVE, 1, 3),
            op::mkop_ab(Op::MOVE, 2, 4),
        ]
    );
    assert_eq!(count_op(&irep, Op::AREF), 0);
}

#[test]
fn splat_multiple_assignment_uses_apost() {
    let mut t = Symbols::new();
    let a = t.symbol("a");
    let b = t.symbol("b");
    let c = t.symbol("c");
    let irep = compile_with(
        &mut t,
        vec![Some(a), Some(b), Some(c)],
        NodeKind::Begin(vec![
            n(NodeKind::Masgn {
                lhs: MultiLhs {
                    pre: vec![n(NodeKind::Lvar(a))],
                    rest: Some(Some(bx(NodeKind::Lvar(b)))),
                    post: vec![],
                },
                rhs: Some(bx(NodeKind::Lvar(c))),
            }),
            n(NodeKind::Nil),
        ]),
    );
    assert!(irep.iseq.contains(&op::mkop_abc(Op::AREF, 1, 4, 0)));
    assert!(irep.iseq.contains(&op::mkop_abc(Op::APOST, 4, 1, 0)));
}

#[test]
fn loadi_boundaries() {
    let mut t = Symbols::new();
    let irep = compile(&mut t, int("32766"));
    assert_eq!(op::get_opcode(irep.iseq[0]), Op::LOADI);
    assert!(irep.pool.is_empty());

    let irep = compile(&mut t, int("32767"));
    assert_eq!(op::get_opcode(irep.iseq[0]), Op::LOADL);
    assert_eq!(irep.pool, vec![crate::Value::Int(32767)]);

    let irep = compile(&mut t, NodeKind::Negate(bx(int("32766"))));
    assert_eq!(irep.iseq[0], op::mkop_asbx(Op::LOADI, 1, -32766));

    let irep = compile(&mut t, NodeKind::Negate(bx(int("32767"))));
    assert_eq!(op::get_opcode(irep.iseq[0]), Op::LOADL);
    assert_eq!(irep.pool, vec![crate::Value::Int(-32767)]);
}

#[test]
fn integer_overflow_falls_back_to_float() {
    let mut t = Symbols::new();
    let irep = compile(&mut t, int("99999999999999999999999999"));
    assert_eq!(op::get_opcode(irep.iseq[0]), Op::LOADL);
    match &irep.pool[0] {
        crate::Value::Float(f) => assert!(*f > 9.9e25 && *f < 1.1e26),
        other => panic!("expected float literal, got {:?}", other),
    }
}

#[test]
fn malformed_integer_is_rejected() {
    let mut t = Symbols::new();
    let err = compile_err(
        &mut t,
        vec![],
        NodeKind::Int {
            text: "12z".to_string(),
            base: 10,
        },
    );
    assert!(err.message.contains("malformed integer"));
}

#[test]
fn hash_of_126_pairs_emits_one_hash() {
    let mut t = Symbols::new();
    let pairs: Vec<_> = (0..126)
        .map(|i| (n(int(&i.to_string())), n(NodeKind::Nil)))
        .collect();
    let irep = compile(&mut t, NodeKind::Hash(pairs));
    assert_eq!(count_op(&irep, Op::HASH), 1);
    assert_eq!(count_op(&irep, Op::SEND), 0);
}

#[test]
fn hash_of_127_pairs_merges() {
    let mut t = Symbols::new();
    let pairs: Vec<_> = (0..127)
        .map(|i| (n(int(&i.to_string())), n(NodeKind::Nil)))
        .collect();
    let irep = compile(&mut t, NodeKind::Hash(pairs));
    assert_eq!(count_op(&irep, Op::HASH), 2);
    assert_eq!(count_op(&irep, Op::SEND), 1);
}

#[test]
fn method_symbol_window_overflow() {
    let mut t = Symbols::new();
    let call = |t: &mut Symbols, i: usize| {
        n(NodeKind::Call {
            recv: bx(NodeKind::SelfRef),
            method: t.symbol(&format!("m{}", i)),
            args: None,
            safe: false,
        })
    };
    let stmts: Vec<_> = (0..256).map(|i| call(&mut t, i)).collect();
    assert!(generate(&mut t, &program(vec![], NodeKind::Begin(stmts))).is_ok());

    let stmts: Vec<_> = (0..257).map(|i| call(&mut t, i)).collect();
    let err = generate(&mut t, &program(vec![], NodeKind::Begin(stmts)))
        .expect_err("window overflow not detected");
    assert!(err.message.contains("too many symbols"));
}

#[test]
fn argument_spread_switches_to_array_path() {
    let mut t = Symbols::new();
    let f = t.symbol("f");
    let rest = t.symbol("rest");
    let irep = compile_with(
        &mut t,
        vec![Some(rest)],
        NodeKind::Call {
            recv: bx(NodeKind::SelfRef),
            method: f,
            args: Some(CallArgs {
                args: vec![
                    n(int("1")),
                    n(NodeKind::Splat(bx(NodeKind::Lvar(rest)))),
                ],
                block: None,
            }),
            safe: false,
        },
    );
    assert_eq!(count_op(&irep, Op::ARYCAT), 1);
    let send = irep
        .iseq
        .iter()
        .copied()
        .find(|&c| op::get_opcode(c) == Op::SEND)
        .expect("no SEND emitted");
    assert_eq!(op::getarg_c(send), CALL_MAXARGS);
}

#[test]
fn direct_path_holds_below_arg_limit() {
    let mut t = Symbols::new();
    let f = t.symbol("f");
    let args: Vec<_> = (0..127).map(|i| n(int(&i.to_string()))).collect();
    let irep = compile(
        &mut t,
        NodeKind::Call {
            recv: bx(NodeKind::SelfRef),
            method: f,
            args: Some(CallArgs { args, block: None }),
            safe: false,
        },
    );
    assert_eq!(count_op(&irep, Op::ARRAY), 0);
    let send = irep
        .iseq
        .iter()
        .copied()
        .find(|&c| op::get_opcode(c) == Op::SEND)
        .expect("no SEND emitted");
    assert_eq!(op::getarg_c(send), 127);
}

#[test]
fn words_literal_builds_array() {
    let mut t = Symbols::new();
    let irep = compile(
        &mut t,
        NodeKind::Words(vec![
            n(NodeKind::Str("a".to_string())),
            n(NodeKind::LiteralDelim),
            n(NodeKind::Str("b".to_string())),
            n(NodeKind::LiteralDelim),
        ]),
    );
    assert_eq!(count_op(&irep, Op::STRING), 2);
    let array = irep
        .iseq
        .iter()
        .copied()
        .find(|&c| op::get_opcode(c) == Op::ARRAY)
        .expect("no ARRAY emitted");
    assert_eq!(op::getarg_c(array), 2);
}

#[test]
fn trailing_empty_word_is_dropped() {
    let mut t = Symbols::new();
    let irep = compile(
        &mut t,
        NodeKind::Words(vec![
            n(NodeKind::Str("a".to_string())),
            n(NodeKind::LiteralDelim),
            n(NodeKind::Str(String::new())),
        ]),
    );
    let array = irep
        .iseq
        .iter()
        .copied()
        .find(|&c| op::get_opcode(c) == Op::ARRAY)
        .expect("no ARRAY emitted");
    assert_eq!(op::getarg_c(array), 1);
}

#[test]
fn symbols_literal_interns_each_word() {
    let mut t = Symbols::new();
    let irep = compile(
        &mut t,
        NodeKind::Symbols(vec![
            n(NodeKind::Str("a".to_string())),
            n(NodeKind::LiteralDelim),
            n(NodeKind::Str("b".to_string())),
            n(NodeKind::LiteralDelim),
        ]),
    );
    assert_eq!(count_op(&irep, Op::SEND), 2);
}

#[test]
fn class_definition_shape() {
    let mut t = Symbols::new();
    let a = t.symbol("A");
    let f = t.symbol("f");
    let irep = compile(
        &mut t,
        NodeKind::Class {
            path: ClassPath::Local(a),
            superclass: None,
            body: ScopeBody {
                locals: vec![],
                body: bx(NodeKind::Def {
                    name: f,
                    body: Box::new(BlockBody {
                        locals: vec![],
                        params: None,
                        body: bx(NodeKind::Nil),
                    }),
                }),
            },
        },
    );
    assert_eq!(
        opcodes(&irep),
        vec![Op::LOADNIL, Op::LOADNIL, Op::CLASS, Op::EXEC, Op::STOP]
    );
    let body = &irep.reps[0];
    assert_eq!(
        opcodes(body),
        vec![Op::TCLASS, Op::LAMBDA, Op::METHOD, Op::LOADSYM, Op::RETURN]
    );
    // the method itself nests one level further down
    assert_eq!(body.reps.len(), 1);
    assert_eq!(
        opcodes(&body.reps[0]),
        vec![Op::LOADNIL, Op::RETURN]
    );
}

#[test]
fn optional_parameters_emit_fallback_jumps() {
    let mut t = Symbols::new();
    let f = t.symbol("f");
    let p = t.symbol("p");
    let q = t.symbol("q");
    let irep = compile(
        &mut t,
        NodeKind::Def {
            name: f,
            body: Box::new(BlockBody {
                locals: vec![Some(p), Some(q)],
                params: Some(Params {
                    mandatory: vec![p],
                    optional: vec![(q, n(int("5")))],
                    rest: false,
                    post: vec![],
                    block: false,
                }),
                body: bx(NodeKind::Lvar(q)),
            }),
        },
    );
    let method = &irep.reps[0];
    assert_eq!(op::get_opcode(method.iseq[0]), Op::ENTER);
    assert_eq!(op::getarg_ax(method.iseq[0]), op::pack_aspec(1, 0, false, 0, 0, false, false) | (1 << 13));
    // one fallback jump per optional plus the trailing skip
    assert_eq!(count_op(method, Op::JMP), 2);
    check_jumps(method);
}

#[test]
fn break_outside_loop_is_an_error() {
    let mut t = Symbols::new();
    let err = compile_err(&mut t, vec![], NodeKind::Break(None));
    assert!(err.message.contains("unexpected break"));
}

#[test]
fn next_outside_loop_is_an_error() {
    let mut t = Symbols::new();
    let err = compile_err(&mut t, vec![], NodeKind::Next(None));
    assert!(err.message.contains("unexpected next"));
}

#[test]
fn retry_without_rescue_is_an_error() {
    let mut t = Symbols::new();
    let err = compile_err(
        &mut t,
        vec![],
        NodeKind::While {
            cond: bx(NodeKind::True),
            body: bx(NodeKind::Retry),
        },
    );
    assert!(err.message.contains("unexpected retry"));
}

#[test]
fn error_display_carries_location() {
    let mut t = Symbols::new();
    let state = ParserState {
        tree: n(NodeKind::Scope(ScopeBody {
            locals: vec![],
            body: Box::new(Node::with_line(NodeKind::Break(None), 3)),
        })),
        filenames: vec!["broken.grb".to_string()],
        filename_index: 0,
        no_optimize: false,
    };
    let err = generate(&mut t, &state).expect_err("break should not compile");
    assert_eq!(
        err.to_string(),
        "codegen error:broken.grb:3: unexpected break"
    );
}

#[test]
fn break_in_loop_targets_loop_value() {
    let mut t = Symbols::new();
    let irep = compile(
        &mut t,
        NodeKind::While {
            cond: bx(NodeKind::True),
            body: bx(NodeKind::Break(Some(bx(int("9"))))),
        },
    );
    check_jumps(&irep);
    // break value lands in the loop accumulator, then jumps to the loop end
    assert!(irep.iseq.contains(&op::mkop_asbx(Op::LOADI, 1, 9)));
}

#[test]
fn compilation_is_deterministic() {
    let build = |t: &mut Symbols| {
        let x = t.symbol("x");
        let f = t.symbol("f");
        program(
            vec![Some(x)],
            NodeKind::Begin(vec![
                n(NodeKind::Asgn {
                    lhs: bx(NodeKind::Lvar(x)),
                    rhs: bx(int("1")),
                }),
                n(NodeKind::While {
                    cond: bx(NodeKind::Lvar(x)),
                    body: bx(NodeKind::Call {
                        recv: bx(NodeKind::SelfRef),
                        method: f,
                        args: None,
                        safe: false,
                    }),
                }),
            ]),
        )
    };
    let mut t1 = Symbols::new();
    let p1 = build(&mut t1);
    let a = generate(&mut t1, &p1).expect("compile failed");
    let mut t2 = Symbols::new();
    let p2 = build(&mut t2);
    let b = generate(&mut t2, &p2).expect("compile failed");
    assert_eq!(a, b);
}

#[test]
fn peephole_never_lengthens_output() {
    let mut t = Symbols::new();
    let x = t.symbol("x");
    let body = || {
        NodeKind::Begin(vec![
            n(NodeKind::Asgn {
                lhs: bx(NodeKind::Lvar(x)),
                rhs: bx(int("42")),
            }),
            n(NodeKind::If {
                cond: bx(NodeKind::Lvar(x)),
                then: Some(bx(NodeKind::Return(Some(bx(NodeKind::Lvar(x)))))),
                els: None,
            }),
        ])
    };
    let mut opt = program(vec![Some(x)], body());
    opt.no_optimize = false;
    let mut raw = program(vec![Some(x)], body());
    raw.no_optimize = true;
    let a = generate(&mut t, &opt).expect("compile failed");
    let b = generate(&mut t, &raw).expect("compile failed");
    assert!(a.iseq.len() <= b.iseq.len());
    check_jumps(&a);
    check_jumps(&b);
}

#[test]
fn mixed_control_flow_resolves_all_jumps() {
    let mut t = Symbols::new();
    let x = t.symbol("x");
    let lt = t.symbol("<");
    let plus = t.symbol("+");
    let irep = compile_with(
        &mut t,
        vec![Some(x)],
        NodeKind::Begin(vec![
            n(NodeKind::Asgn {
                lhs: bx(NodeKind::Lvar(x)),
                rhs: bx(int("0")),
            }),
            n(NodeKind::While {
                cond: bx(NodeKind::Call {
                    recv: bx(NodeKind::Lvar(x)),
                    method: lt,
                    args: Some(CallArgs {
                        args: vec![n(int("10"))],
                        block: None,
                    }),
                    safe: false,
                }),
                body: bx(NodeKind::Asgn {
                    lhs: bx(NodeKind::Lvar(x)),
                    rhs: bx(NodeKind::Call {
                        recv: bx(NodeKind::Lvar(x)),
                        method: plus,
                        args: Some(CallArgs {
                            args: vec![n(int("1"))],
                            block: None,
                        }),
                        safe: false,
                    }),
                }),
            }),
            n(NodeKind::Case {
                head: Some(bx(NodeKind::Lvar(x))),
                clauses: vec![
                    WhenClause {
                        patterns: vec![n(int("10"))],
                        body: Some(bx(NodeKind::Str("ten".to_string()))),
                    },
                    WhenClause {
                        patterns: vec![],
                        body: Some(bx(NodeKind::Str("other".to_string()))),
                    },
                ],
            }),
            n(NodeKind::Rescue {
                body: Some(bx(NodeKind::Lvar(x))),
                clauses: vec![RescueClause {
                    classes: vec![],
                    var: None,
                    body: Some(bx(NodeKind::Nil)),
                }],
                else_body: None,
            }),
        ]),
    );
    check_jumps(&irep);
    assert_eq!(count_op(&irep, Op::ONERR), 1);
    assert!(count_op(&irep, Op::POPERR) >= 1);
}

#[test]
fn string_interpolation_folds_pieces() {
    let mut t = Symbols::new();
    let x = t.symbol("x");
    let irep = compile_with(
        &mut t,
        vec![Some(x)],
        NodeKind::DStr(vec![
            n(NodeKind::Str("a".to_string())),
            n(NodeKind::Lvar(x)),
            n(NodeKind::Str(String::new())),
        ]),
    );
    // the empty trailing piece is swallowed by the peephole
    assert_eq!(count_op(&irep, Op::STRING), 1);
    assert_eq!(count_op(&irep, Op::STRCAT), 1);
}
