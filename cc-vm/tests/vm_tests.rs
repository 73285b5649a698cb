mod common;

use common::*;

fn binary(op_code: OpCode, lhs: Word, rhs: Word) -> Result<Word, VmError> {
    let mut machine = Machine::new(1024).expect("allocate");
    machine
        .append_all(&[
            op(OpCode::Imm),
            lhs,
            op(OpCode::Push),
            op(OpCode::Imm),
            rhs,
            op(op_code),
            op(OpCode::Push),
            op(OpCode::Exit),
        ])
        .expect("fits");
    machine.run(false)
}

#[test]
fn binary_operators_take_lhs_from_stack_and_rhs_from_ax() {
    let cases = [
        (OpCode::Or, 12, 10, 14),
        (OpCode::Xor, 12, 10, 6),
        (OpCode::And, 12, 10, 8),
        (OpCode::Eq, 3, 3, 1),
        (OpCode::Ne, 3, 3, 0),
        (OpCode::Lt, 2, 3, 1),
        (OpCode::Gt, 2, 3, 0),
        (OpCode::Le, 3, 3, 1),
        (OpCode::Ge, 2, 3, 0),
        (OpCode::Shl, 1, 4, 16),
        (OpCode::Shr, -16, 2, -4),
        (OpCode::Add, 10, 20, 30),
        (OpCode::Sub, 10, 3, 7),
        (OpCode::Mul, -4, 5, -20),
        (OpCode::Div, -7, 2, -3),
        (OpCode::Mod, -7, 2, -1),
    ];
    for (op_code, lhs, rhs, expected) in cases {
        assert_eq!(
            binary(op_code, lhs, rhs),
            Ok(expected),
            "{} {lhs} {rhs}",
            op_code.mnemonic()
        );
    }
}

#[test]
fn arithmetic_wraps_and_shift_counts_are_masked() {
    assert_eq!(binary(OpCode::Add, Word::MAX, 1), Ok(Word::MIN));
    assert_eq!(binary(OpCode::Mul, Word::MIN, -1), Ok(Word::MIN));
    assert_eq!(binary(OpCode::Div, Word::MIN, -1), Ok(Word::MIN));
    assert_eq!(binary(OpCode::Shl, 1, 65), Ok(2));
}

#[test]
fn division_by_zero_is_a_recoverable_fault() {
    let mut machine = Machine::new(1024).expect("allocate");
    machine
        .append_all(&[
            op(OpCode::Imm),
            1,
            op(OpCode::Push),
            op(OpCode::Imm),
            0,
            op(OpCode::Div),
            op(OpCode::Push),
            op(OpCode::Exit),
        ])
        .expect("fits");
    let err = machine.run(false).expect_err("division by zero");
    assert_eq!(err, VmError::DivisionByZero);
    assert_eq!(machine.status(), Status::Error);
    assert_eq!(machine.last_error(), Some(&VmError::DivisionByZero));

    let rendered = vm::render_vm_error(&machine, &err);
    assert_eq!(
        rendered,
        "runtime error: division by zero\nat pc cell 5 (cycle 4)\n  | 0005: DIV"
    );
    assert_eq!(binary(OpCode::Mod, 1, 0), Err(VmError::DivisionByZero));
}

#[test]
fn straight_line_program_exits_with_sum() {
    let mut machine = Machine::new(vm::DEFAULT_POOLSIZE).expect("allocate");
    machine
        .append_all(&[
            op(OpCode::Imm),
            10,
            op(OpCode::Push),
            op(OpCode::Imm),
            20,
            op(OpCode::Add),
            op(OpCode::Push),
            op(OpCode::Exit),
        ])
        .expect("fits");
    assert_eq!(machine.run(false), Ok(30));
    assert_eq!(machine.status(), Status::Exit);
    assert_eq!(machine.result(), 30);
    assert_eq!(machine.cycle(), 6);
}

#[test]
fn reset_makes_runs_repeatable() {
    let source = "IMM 6\nPUSH\nIMM 7\nMUL\nPUSH\nEXIT\n";
    let program = assemble(source).expect("assemble");
    let mut machine = Machine::new(4096).expect("allocate");
    program.load(&mut machine).expect("load");
    assert_eq!(machine.run(false), Ok(42));
    let first_cycles = machine.cycle();

    machine.reset();
    assert_eq!(machine.status(), Status::Init);
    assert_eq!(machine.op_counter(), 0);
    assert_eq!(machine.cycle(), 0);
    assert_eq!(machine.stack_pointer(), machine.stack_top());
    assert!(machine.code_cells().is_empty());

    let other = assemble("IMM 1\nPUSH\nEXIT\n").expect("assemble");
    other.load(&mut machine).expect("load other");
    assert_eq!(machine.run(false), Ok(1));
    assert_eq!(machine.cycle(), 3);

    machine.reset();
    program.load(&mut machine).expect("reload");
    assert_eq!(machine.run(false), Ok(42));
    assert_eq!(machine.cycle(), first_cycles);
}

#[test]
fn call_and_return_through_the_entry_frame() {
    let source = r#"
        .entry main
        .label add
            ENT 0
            LEA 3
            LI
            PUSH
            LEA 2
            LI
            ADD
            LEV
        .label main
            ENT 0
            IMM 10
            PUSH
            IMM 20
            PUSH
            CALL add
            ADJ 2
            LEV
    "#;
    let (recorded, result) = run_source(source);
    assert_eq!(result, Ok(30));
    let machine = &recorded.machine;
    assert_eq!(machine.base_pointer(), machine.stack_top());
    // only the value pushed for EXIT remains
    assert_eq!(machine.stack_words(4), vec![30]);
}

#[test]
fn outer_return_leaves_an_empty_frame() {
    let source = r#"
        .entry main
        .label sum
            ENT 0
            LEA 3
            LI
            PUSH
            LEA 2
            LI
            ADD
            LEV
        .label main
            ENT 0
            IMM -8
            PUSH
            IMM 21
            PUSH
            CALL sum
            ADJ 2
            LEV
    "#;
    let program = assemble(source).expect("assemble");
    let mut machine = Machine::new(4096).expect("allocate");
    program.load(&mut machine).expect("load");
    // the stub starts with ADJ 2; stop once it has run
    let after_adj = program.len() + 2;
    while machine.program_counter_offset() != after_adj {
        assert_eq!(machine.step(false), Status::Running);
    }
    assert_eq!(machine.stack_pointer(), machine.stack_top());
    assert_eq!(machine.base_pointer(), machine.stack_top());
    assert_eq!(machine.ax(), 13);
    assert_eq!(machine.run(false), Ok(13));
}

#[test]
fn entry_frame_exposes_argc_and_argv() {
    let mut machine = Machine::new(4096).expect("allocate");
    let mut asm = Assembler::new();
    asm.label("main").expect("label");
    asm.ent(0);
    asm.lea(3);
    asm.li();
    asm.push();
    asm.lea(2);
    asm.li();
    asm.op(OpCode::Add).expect("no operand");
    asm.lev();
    let program = asm.finish_program().expect("finish");
    program.load(&mut machine).expect("load");

    let entry = Address::Code(0).encode();
    machine.setup_entry(entry, 3, 40).expect("entry frame");
    // ADJ 2, PUSH, EXIT follow the program cells
    assert_eq!(machine.op_counter(), program.len() + 4);
    assert_eq!(machine.stack_words(3)[1..], [40, 3]);
    assert_eq!(machine.run(false), Ok(43));
}

#[test]
fn loops_with_locals() {
    let source = r#"
        .entry main
        .label main
            ENT 2           ; i at -1, sum at -2
            LEA -1
            PUSH
            IMM 1
            SI
            LEA -2
            PUSH
            IMM 0
            SI
        .label loop
            LEA -1
            LI
            PUSH
            IMM 10
            LE
            JZ done
            LEA -2          ; sum = sum + i
            PUSH
            LEA -2
            LI
            PUSH
            LEA -1
            LI
            ADD
            SI
            LEA -1          ; i = i + 1
            PUSH
            LEA -1
            LI
            PUSH
            IMM 1
            ADD
            SI
            JMP loop
        .label done
            LEA -2
            LI
            LEV
    "#;
    let (recorded, result) = run_source(source);
    assert_eq!(result, Ok(55));
    assert_eq!(
        recorded.machine.stack_pointer(),
        recorded.machine.stack_top() - WORD_SIZE
    );
}

#[test]
fn globals_round_trip_through_the_data_segment() {
    let mut machine = Machine::new(4096).expect("allocate");
    let slot = machine.put_constant(0).expect("data");
    machine
        .append_all(&[
            op(OpCode::Imm),
            slot,
            op(OpCode::Push),
            op(OpCode::Imm),
            99,
            op(OpCode::Si),
            op(OpCode::Imm),
            slot,
            op(OpCode::Li),
            op(OpCode::Push),
            op(OpCode::Exit),
        ])
        .expect("fits");
    assert_eq!(machine.run(false), Ok(99));
    assert_eq!(machine.load_word(slot), Ok(99));
}

#[test]
fn lc_sign_extends_like_a_char() {
    let mut machine = Machine::new(4096).expect("allocate");
    let bytes = machine.put_bytes(&[0x80, 0x7f]).expect("data");
    machine
        .append_all(&[
            op(OpCode::Imm),
            bytes,
            op(OpCode::Lc),
            op(OpCode::Push),
            op(OpCode::Exit),
        ])
        .expect("fits");
    assert_eq!(machine.run(false), Ok(-128));
}

#[test]
fn unknown_opcode_halts_with_error() {
    let mut machine = Machine::new(1024).expect("allocate");
    machine.append_all(&[99, op(OpCode::Exit)]).expect("fits");
    assert_eq!(machine.step(false), Status::Error);
    assert_eq!(machine.last_error(), Some(&VmError::UnknownOpcode(99)));
    assert_eq!(machine.step(false), Status::Error);
    assert_eq!(machine.cycle(), 1);
    assert_eq!(machine.run(false), Err(VmError::UnknownOpcode(99)));
}

#[test]
fn full_code_segment_rejects_further_cells() {
    let mut machine = Machine::new(2 * WORD_SIZE).expect("allocate");
    assert_eq!(machine.capacity(), 2);
    machine.append(op(OpCode::Imm)).expect("first cell");
    machine.append(5).expect("second cell");
    assert_eq!(
        machine.append(op(OpCode::Push)),
        Err(VmError::OpCounterOverflow { capacity: 2 })
    );
    assert_eq!(machine.op_counter(), 2);
    assert_eq!(machine.step(false), Status::Running);
    assert_eq!(machine.ax(), 5);
}

#[test]
fn append_all_is_all_or_nothing() {
    let mut machine = Machine::new(3 * WORD_SIZE).expect("allocate");
    machine.append(op(OpCode::Push)).expect("fits");
    let err = machine
        .append_all(&[op(OpCode::Imm), 1, op(OpCode::Exit)])
        .expect_err("three cells do not fit in two");
    assert_eq!(err, VmError::OpCounterOverflow { capacity: 3 });
    assert_eq!(machine.op_counter(), 1);
}

#[test]
fn pool_smaller_than_a_word_is_rejected() {
    let err = Machine::new(WORD_SIZE - 1).expect_err("too small");
    assert_eq!(err, vm::MemoryError::PoolTooSmall(WORD_SIZE - 1));
}

#[test]
fn stack_overflow_is_reported() {
    let mut machine = Machine::new(2 * WORD_SIZE).expect("allocate");
    machine
        .append_all(&[op(OpCode::Ent), 4])
        .expect("fits");
    assert_eq!(machine.run(false), Err(VmError::StackOverflow));
}

#[test]
fn load_that_cannot_fit_the_entry_stub_commits_nothing() {
    let source = r#"
        .data
        word unused 5
        .code
        .entry main
        .label main
            ENT 0
            IMM 1
            PUSH
            LEV
    "#;
    let program = assemble(source).expect("assemble");
    assert_eq!(program.len(), 6);
    let mut machine = Machine::new(8 * WORD_SIZE).expect("allocate");
    assert_eq!(machine.capacity(), 8);
    let err = program.load(&mut machine).expect_err("stub does not fit");
    assert_eq!(err, VmError::OpCounterOverflow { capacity: 8 });
    assert_eq!(machine.op_counter(), 0);
    assert_eq!(machine.stack_pointer(), machine.stack_top());

    let mut roomy = Machine::new((6 + vm::ENTRY_STUB_CELLS) * WORD_SIZE).expect("allocate");
    program.load(&mut roomy).expect("exact fit");
    assert_eq!(roomy.op_counter(), roomy.capacity());
    assert_eq!(roomy.run(false), Ok(1));
}

#[test]
fn jump_past_the_code_segment_faults() {
    let mut machine = Machine::new(4 * WORD_SIZE).expect("allocate");
    let past_end = Address::Code(4 * WORD_SIZE).encode();
    machine
        .append_all(&[op(OpCode::Jmp), past_end])
        .expect("fits");
    assert_eq!(
        machine.run(false),
        Err(VmError::SegmentFault {
            address: past_end,
            width: WORD_SIZE,
        })
    );
}
