mod common;

use common::*;
use wasmjit::Value;
use wasmjit::ir::{BlockType, FloatBinary, IntBinary, IntCompare, LoadOp, MemArg, StoreOp};

#[test]
fn integer_arithmetic_matches_wasm_semantics() {
    if !native_backend_available() {
        return;
    }
    let engine = engine();
    let mut instance = instantiate(
        &engine,
        vec![
            binary_i32(0, "add", IntBinary::Add),
            binary_i32(1, "sub", IntBinary::Sub),
            binary_i32(2, "mul", IntBinary::Mul),
            binary_i32(3, "div_s", IntBinary::DivS),
            binary_i32(4, "rem_s", IntBinary::RemS),
            binary_i32(5, "div_u", IntBinary::DivU),
            binary_i32(6, "shl", IntBinary::Shl),
            binary_i32(7, "rotr", IntBinary::Rotr),
        ],
    );

    assert_eq!(call_i32(&mut instance, 0, &[2, 40]), Ok(42));
    assert_eq!(call_i32(&mut instance, 0, &[-5, 3]), Ok(-2));
    assert_eq!(call_i32(&mut instance, 1, &[i32::MIN, 1]), Ok(i32::MAX));
    assert_eq!(call_i32(&mut instance, 2, &[-6, 7]), Ok(-42));
    assert_eq!(call_i32(&mut instance, 3, &[-7, 2]), Ok(-3));
    assert_eq!(call_i32(&mut instance, 4, &[-7, 2]), Ok(-1));
    assert_eq!(call_i32(&mut instance, 4, &[i32::MIN, -1]), Ok(0));
    assert_eq!(call_i32(&mut instance, 5, &[-1, 2]), Ok(i32::MAX));
    assert_eq!(call_i32(&mut instance, 6, &[1, 33]), Ok(2));
    assert_eq!(call_i32(&mut instance, 7, &[1, 1]), Ok(i32::MIN));
}

#[test]
fn i32_results_are_zero_extended_in_their_slot() {
    if !native_backend_available() {
        return;
    }
    let engine = engine();
    let mut instance = instantiate(&engine, vec![binary_i32(0, "add", IntBinary::Add)]);
    let results = instance
        .call(&ExecContext::new(), 0, &[encode_i32(-1), encode_i32(0)])
        .expect("add never traps");
    assert_eq!(results, vec![0xFFFF_FFFF]);
}

#[test]
fn i64_arithmetic_uses_the_full_slot() {
    if !native_backend_available() {
        return;
    }
    let engine = engine();
    let mut builder = FunctionBuilder::new(def(
        0,
        "mul64",
        &[ValueType::I64, ValueType::I64],
        &[ValueType::I64],
    ));
    builder
        .local_get(0)
        .local_get(1)
        .op(Op::I64Binary(IntBinary::Mul))
        .end();
    let mut instance = instantiate(&engine, vec![builder.finish()]);

    let results = instance
        .call(
            &ExecContext::new(),
            0,
            &[encode_i64(-3_000_000_000), encode_i64(3)],
        )
        .expect("mul never traps");
    assert_eq!(decode_i64(results[0]), -9_000_000_000);
}

#[test]
fn float_arithmetic_round_trips_through_values() {
    if !native_backend_available() {
        return;
    }
    let engine = engine();
    let mut add = FunctionBuilder::new(def(
        0,
        "fadd",
        &[ValueType::F64, ValueType::F64],
        &[ValueType::F64],
    ));
    add.local_get(0)
        .local_get(1)
        .op(Op::F64Binary(FloatBinary::Add))
        .end();
    let mut mul = FunctionBuilder::new(def(
        1,
        "fmul32",
        &[ValueType::F32, ValueType::F32],
        &[ValueType::F32],
    ));
    mul.local_get(0)
        .local_get(1)
        .op(Op::F32Binary(FloatBinary::Mul))
        .end();
    let mut instance = instantiate(&engine, vec![add.finish(), mul.finish()]);
    let ctx = ExecContext::new();

    let sum = instance
        .call_values(&ctx, 0, &[Value::F64(1.5), Value::F64(2.25)])
        .expect("fadd");
    assert_eq!(sum[0].as_f64(), Some(3.75));
    let product = instance
        .call_values(&ctx, 1, &[Value::F32(-2.5), Value::F32(4.0)])
        .expect("fmul32");
    assert_eq!(product[0].as_f32(), Some(-10.0));
}

#[test]
fn division_traps_carry_their_source_offset() {
    if !native_backend_available() {
        return;
    }
    let engine = engine();
    let mut instance = instantiate(
        &engine,
        vec![
            binary_i32(0, "div_s", IntBinary::DivS),
            binary_i32(1, "div_u", IntBinary::DivU),
        ],
    );

    let trap = call_i32(&mut instance, 0, &[1, 0]).expect_err("divide by zero");
    assert_eq!(trap.trap_code(), Some(TrapCode::IntegerDivideByZero));
    assert_eq!(trap.function(), Some("div_s"));
    assert_eq!(trap.source_offset(), Some(2));

    let trap = call_i32(&mut instance, 0, &[i32::MIN, -1]).expect_err("overflow");
    assert_eq!(trap.trap_code(), Some(TrapCode::IntegerOverflow));

    let trap = call_i32(&mut instance, 1, &[5, 0]).expect_err("unsigned divide by zero");
    assert_eq!(trap.trap_code(), Some(TrapCode::IntegerDivideByZero));
    assert_eq!(trap.function(), Some("div_u"));
}

#[test]
fn unreachable_traps_at_its_own_offset() {
    if !native_backend_available() {
        return;
    }
    let engine = engine();
    let mut builder = FunctionBuilder::new(def(0, "boom", &[], &[])).start_offset(0x40);
    builder.op(Op::Nop).op(Op::Unreachable).end();
    let mut instance = instantiate(&engine, vec![builder.finish()]);

    let trap = instance
        .call(&ExecContext::new(), 0, &[])
        .expect_err("unreachable traps");
    assert_eq!(trap.trap_code(), Some(TrapCode::Unreachable));
    assert_eq!(trap.source_offset(), Some(0x41));
    assert_eq!(
        trap.to_string().lines().next(),
        Some("trap: unreachable executed in 'boom' at offset 0x41")
    );
}

#[test]
fn loops_and_branches_run_to_completion() {
    if !native_backend_available() {
        return;
    }
    let engine = engine();
    // sum(n) = n + (n - 1) + ... + 1
    let mut builder = FunctionBuilder::new(def(0, "sum", &[ValueType::I32], &[ValueType::I32]));
    let acc = builder.local(ValueType::I32);
    builder
        .op(Op::Block(BlockType::EMPTY))
        .op(Op::Loop(BlockType::EMPTY))
        .local_get(0)
        .op(Op::I32Eqz)
        .op(Op::BrIf(1))
        .local_get(acc)
        .local_get(0)
        .op(Op::I32Binary(IntBinary::Add))
        .local_set(acc)
        .local_get(0)
        .i32_const(1)
        .op(Op::I32Binary(IntBinary::Sub))
        .local_set(0)
        .op(Op::Br(0))
        .end()
        .end()
        .local_get(acc)
        .end();
    let mut instance = instantiate(&engine, vec![builder.finish()]);

    assert_eq!(call_i32(&mut instance, 0, &[10]), Ok(55));
    assert_eq!(call_i32(&mut instance, 0, &[0]), Ok(0));
}

#[test]
fn if_else_and_select_pick_the_right_arm() {
    if !native_backend_available() {
        return;
    }
    let engine = engine();
    let mut abs = FunctionBuilder::new(def(0, "abs", &[ValueType::I32], &[ValueType::I32]));
    abs.local_get(0)
        .i32_const(0)
        .op(Op::I32Compare(IntCompare::LtS))
        .op(Op::If(BlockType::results(1)))
        .i32_const(0)
        .local_get(0)
        .op(Op::I32Binary(IntBinary::Sub))
        .op(Op::Else)
        .local_get(0)
        .end()
        .end();

    let mut pick = FunctionBuilder::new(def(
        1,
        "pick",
        &[ValueType::I32, ValueType::I32, ValueType::I32],
        &[ValueType::I32],
    ));
    pick.local_get(0)
        .local_get(1)
        .local_get(2)
        .op(Op::Select)
        .end();

    let mut instance = instantiate(&engine, vec![abs.finish(), pick.finish()]);
    assert_eq!(call_i32(&mut instance, 0, &[-9]), Ok(9));
    assert_eq!(call_i32(&mut instance, 0, &[4]), Ok(4));
    assert_eq!(call_i32(&mut instance, 1, &[7, 8, 1]), Ok(7));
    assert_eq!(call_i32(&mut instance, 1, &[7, 8, 0]), Ok(8));
}

#[test]
fn functions_call_each_other_and_return_multiple_values() {
    if !native_backend_available() {
        return;
    }
    let engine = engine();
    let square = def(1, "square", &[ValueType::I32], &[ValueType::I32]);
    let swap = def(2, "swap", &[ValueType::I32, ValueType::I32], &[ValueType::I32, ValueType::I32]);

    let mut main = FunctionBuilder::new(def(0, "main", &[ValueType::I32], &[ValueType::I32]));
    main.local_get(0)
        .call(&square)
        .i32_const(1)
        .op(Op::I32Binary(IntBinary::Add))
        .end();

    let mut square_body = FunctionBuilder::new(square.clone());
    square_body
        .local_get(0)
        .local_get(0)
        .op(Op::I32Binary(IntBinary::Mul))
        .end();

    let mut swap_body = FunctionBuilder::new(swap.clone());
    swap_body.local_get(1).local_get(0).end();

    let mut instance = instantiate(
        &engine,
        vec![main.finish(), square_body.finish(), swap_body.finish()],
    );
    assert_eq!(call_i32(&mut instance, 0, &[7]), Ok(50));

    let swapped = instance
        .call(&ExecContext::new(), 2, &[encode_i32(1), encode_i32(2)])
        .expect("swap");
    assert_eq!(swapped, vec![encode_i32(2), encode_i32(1)]);
}

fn store_then_load(index: u32, load: LoadOp) -> FunctionIr {
    let mut builder = FunctionBuilder::new(def(
        index,
        "store_then_load",
        &[ValueType::I32, ValueType::I32],
        &[ValueType::I32],
    ));
    builder
        .local_get(0)
        .local_get(1)
        .op(Op::Store(StoreOp::I32, MemArg::default()))
        .local_get(0)
        .op(Op::Load(load, MemArg::default()))
        .end();
    builder.finish()
}

#[test]
fn memory_accesses_are_bounds_checked() {
    if !native_backend_available() {
        return;
    }
    let engine = engine();
    let module = engine
        .compile_module(&ModuleIr::new(vec![
            store_then_load(0, LoadOp::I32),
            store_then_load(1, LoadOp::I32Load8S),
        ]))
        .expect("module compiles");
    let mut instance = Instance::new(module, Vec::new(), Some(MemoryInstance::new(1, None)), Vec::new())
        .expect("instance");

    assert_eq!(call_i32(&mut instance, 0, &[16, 0x1234]), Ok(0x1234));
    assert_eq!(instance.memory().read_u32(16), Some(0x1234));
    assert_eq!(call_i32(&mut instance, 1, &[32, 0xFF]), Ok(-1));
    assert_eq!(call_i32(&mut instance, 0, &[65532, 9]), Ok(9));

    let trap = call_i32(&mut instance, 0, &[65533, 1]).expect_err("store crosses the end");
    assert_eq!(trap.trap_code(), Some(TrapCode::MemoryOutOfBounds));
    assert_eq!(trap.function(), Some("store_then_load"));
    assert_eq!(trap.source_offset(), Some(2));
    assert_eq!(trap.backtrace().len(), 1);
    assert_eq!(trap.backtrace()[0].function, "store_then_load");
    assert_eq!(trap.backtrace()[0].source_offset, Some(2));
}

#[test]
fn instances_without_memory_trap_on_access() {
    if !native_backend_available() {
        return;
    }
    let engine = engine();
    let mut instance = instantiate(&engine, vec![store_then_load(0, LoadOp::I32)]);
    let trap = call_i32(&mut instance, 0, &[0, 1]).expect_err("no memory");
    assert_eq!(trap.trap_code(), Some(TrapCode::MemoryOutOfBounds));
}

#[test]
fn memory_grow_reports_previous_size_or_failure() {
    if !native_backend_available() {
        return;
    }
    let engine = engine();
    let mut grow = FunctionBuilder::new(def(0, "grow", &[ValueType::I32], &[ValueType::I32]));
    grow.local_get(0).op(Op::MemoryGrow).end();
    let mut size = FunctionBuilder::new(def(1, "size", &[], &[ValueType::I32]));
    size.op(Op::MemorySize).end();

    let module = engine
        .compile_module(&ModuleIr::new(vec![grow.finish(), size.finish()]))
        .expect("module compiles");
    let mut instance = Instance::new(
        module,
        Vec::new(),
        Some(MemoryInstance::new(1, Some(3))),
        Vec::new(),
    )
    .expect("instance");

    assert_eq!(call_i32(&mut instance, 0, &[1]), Ok(1));
    assert_eq!(call_i32(&mut instance, 0, &[5]), Ok(-1));
    assert_eq!(call_i32(&mut instance, 1, &[]), Ok(2));
    assert_eq!(instance.memory().size_in_pages(), 2);
}

#[test]
fn globals_are_read_and_written_in_place() {
    if !native_backend_available() {
        return;
    }
    let engine = engine();
    let mut bump = FunctionBuilder::new(def(0, "bump", &[], &[ValueType::I32]));
    bump.op(Op::GlobalGet(1))
        .i32_const(1)
        .op(Op::I32Binary(IntBinary::Add))
        .op(Op::GlobalSet(1))
        .op(Op::GlobalGet(1))
        .end();
    let module = engine
        .compile_module(&ModuleIr::new(vec![bump.finish()]))
        .expect("module compiles");
    assert_eq!(module.requirements().globals, 2);

    let err = Instance::new(
        module.clone(),
        vec![GlobalInstance::from_value(Value::I32(0), false)],
        None,
        Vec::new(),
    )
    .expect_err("one global is not enough");
    assert_eq!(
        err,
        wasmjit::InstanceError::MissingGlobal {
            index: 1,
            provided: 1
        }
    );

    let mut instance = Instance::new(
        module,
        vec![
            GlobalInstance::from_value(Value::I32(0), false),
            GlobalInstance::from_value(Value::I32(10), true),
        ],
        None,
        Vec::new(),
    )
    .expect("instance");
    assert_eq!(call_i32(&mut instance, 0, &[]), Ok(11));
    assert_eq!(call_i32(&mut instance, 0, &[]), Ok(12));
    assert_eq!(
        instance.global(1).map(|global| global.get_value().as_i32()),
        Some(Some(12))
    );
}

#[test]
fn tables_are_read_with_bounds_checks() {
    if !native_backend_available() {
        return;
    }
    let engine = engine();
    let mut get = FunctionBuilder::new(def(0, "get", &[ValueType::I32], &[ValueType::ExternRef]));
    get.local_get(0).op(Op::TableGet(1)).end();
    let mut size = FunctionBuilder::new(def(1, "size", &[], &[ValueType::I32]));
    size.op(Op::TableSize(1)).end();
    let module = engine
        .compile_module(&ModuleIr::new(vec![get.finish(), size.finish()]))
        .expect("module compiles");

    let mut refs = TableInstance::new(ValueType::ExternRef, 2, None);
    refs.set(1, 0xABC).expect("in bounds");
    let tables = vec![TableInstance::new(ValueType::FuncRef, 0, None), refs];
    let mut instance = Instance::new(module, Vec::new(), None, tables).expect("instance");
    let ctx = ExecContext::new();

    assert_eq!(instance.call(&ctx, 0, &[encode_i32(1)]), Ok(vec![0xABC]));
    assert_eq!(instance.call(&ctx, 0, &[encode_i32(0)]), Ok(vec![0]));
    assert_eq!(call_i32(&mut instance, 1, &[]), Ok(2));

    let trap = instance
        .call(&ctx, 0, &[encode_i32(2)])
        .expect_err("index 2 is past the end");
    assert_eq!(trap.trap_code(), Some(TrapCode::TableOutOfBounds));
    assert_eq!(trap.source_offset(), Some(1));
}

#[test]
fn runaway_recursion_exhausts_the_call_stack() {
    if !native_backend_available() {
        return;
    }
    let engine = engine_with(EngineConfig {
        max_call_depth: 16,
        ..EngineConfig::default()
    });
    let recurse = def(0, "recurse", &[], &[]);
    let mut builder = FunctionBuilder::new(recurse.clone());
    builder.call(&recurse).end();
    let mut instance = instantiate(&engine, vec![builder.finish()]);

    let trap = instance
        .call(&ExecContext::new(), 0, &[])
        .expect_err("recursion never ends");
    assert_eq!(trap.reason(), &TrapReason::CallStackExhausted);
    assert_eq!(trap.function(), Some("recurse"));
    assert_eq!(trap.source_offset(), Some(0));
    assert_eq!(trap.backtrace().len(), 16);
}

#[test]
fn default_limits_trap_before_a_small_thread_stack_overflows() {
    if !native_backend_available() {
        return;
    }
    let worker = std::thread::Builder::new()
        .stack_size(2 << 20)
        .spawn(|| {
            let engine = engine();
            let recurse = def(0, "recurse", &[], &[]);
            let mut builder = FunctionBuilder::new(recurse.clone());
            builder.call(&recurse).end();
            let mut instance = instantiate(&engine, vec![builder.finish()]);
            instance.call(&ExecContext::new(), 0, &[])
        })
        .expect("spawn worker");

    let trap = worker
        .join()
        .expect("worker returns instead of overflowing")
        .expect_err("recursion never ends");
    assert_eq!(trap.reason(), &TrapReason::CallStackExhausted);
    assert_eq!(trap.function(), Some("recurse"));
    assert!(!trap.backtrace().is_empty());
}

#[test]
fn stack_budget_applies_below_the_depth_limit() {
    if !native_backend_available() {
        return;
    }
    let engine = engine_with(EngineConfig {
        max_call_depth: usize::MAX,
        max_stack_bytes: 64 * 1024,
        ..EngineConfig::default()
    });
    let recurse = def(0, "recurse", &[], &[]);
    let mut builder = FunctionBuilder::new(recurse.clone());
    builder.call(&recurse).end();
    let mut instance = instantiate(&engine, vec![builder.finish()]);

    let trap = instance
        .call(&ExecContext::new(), 0, &[])
        .expect_err("recursion never ends");
    assert_eq!(trap.reason(), &TrapReason::CallStackExhausted);
}

#[test]
fn backtraces_can_be_disabled() {
    if !native_backend_available() {
        return;
    }
    let engine = engine_with(EngineConfig {
        capture_backtrace: false,
        ..EngineConfig::default()
    });
    let mut instance = instantiate(&engine, vec![binary_i32(0, "div_s", IntBinary::DivS)]);
    let trap = call_i32(&mut instance, 0, &[1, 0]).expect_err("divide by zero");
    assert_eq!(trap.source_offset(), Some(2));
    assert!(trap.backtrace().is_empty());
}

#[test]
fn bad_calls_are_rejected_before_entering_code() {
    if !native_backend_available() {
        return;
    }
    let engine = engine();
    let mut instance = instantiate(&engine, vec![binary_i32(0, "add", IntBinary::Add)]);
    let ctx = ExecContext::new();

    let trap = instance.call(&ctx, 9, &[]).expect_err("no function 9");
    assert_eq!(trap.reason(), &TrapReason::UnknownFunction(9));

    let trap = instance.call(&ctx, 0, &[encode_i32(1)]).expect_err("one argument short");
    assert_eq!(
        trap.reason(),
        &TrapReason::ArgumentCount {
            expected: 2,
            got: 1
        }
    );
}
