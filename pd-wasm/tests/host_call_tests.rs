mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use common::*;
use wasmjit::ir::{IntBinary, LoadOp, MemArg};
use wasmjit::{Caller, host_fn};

fn host(name: &str, params: &[ValueType], results: &[ValueType], callable: Arc<dyn wasmjit::HostFunction>) -> HostFunc {
    HostFunc::new(
        FunctionDefinition::host(name, params.to_vec(), results.to_vec()),
        callable,
    )
}

fn add_one() -> HostFunc {
    host(
        "env.add_one",
        &[ValueType::I32],
        &[ValueType::I32],
        host_fn(|_, stack| {
            stack[0] = encode_i32(decode_i32(stack[0]).wrapping_add(1));
            Ok(())
        }),
    )
}

/// `main(x) = host(x)`, with the call at source offset 1.
fn forward_to(host: &HostFunc) -> FunctionIr {
    let mut builder = FunctionBuilder::new(def(0, "main", &[ValueType::I32], &[ValueType::I32]));
    builder.local_get(0).call_host(host).end();
    builder.finish()
}

#[test]
fn host_functions_receive_and_return_slots() {
    if !native_backend_available() {
        return;
    }
    let engine = engine();
    let mut instance = instantiate(&engine, vec![forward_to(&add_one())]);
    assert_eq!(call_i32(&mut instance, 0, &[41]), Ok(42));
    assert_eq!(call_i32(&mut instance, 0, &[-1]), Ok(0));
}

#[test]
fn repeated_imports_share_one_slot() {
    if !native_backend_available() {
        return;
    }
    let engine = engine();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let tick = host(
        "env.tick",
        &[],
        &[],
        host_fn(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );
    let mut builder = FunctionBuilder::new(def(0, "main", &[], &[]));
    builder.call_host(&tick).call_host(&tick).call_host(&tick).end();
    let mut instance = instantiate(&engine, vec![builder.finish()]);

    let code = instance.module().function(0).expect("compiled");
    assert_eq!(code.host_imports().len(), 1);
    instance.call(&ExecContext::new(), 0, &[]).expect("ticks");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn host_functions_reach_linear_memory_through_the_caller() {
    if !native_backend_available() {
        return;
    }
    let engine = engine();
    let seen = Arc::new(Mutex::new(None));
    let recorder = seen.clone();
    let poke = host(
        "env.poke",
        &[ValueType::I32, ValueType::I32],
        &[],
        host_fn(move |caller: &mut Caller<'_>, stack| {
            *recorder.lock().expect("recorder") = caller.function_name().map(str::to_string);
            let addr = decode_i32(stack[0]) as usize;
            let value = decode_i32(stack[1]) as u32;
            let memory = caller.memory_mut().ok_or_else(|| Trap::host("no memory"))?;
            if !memory.write_u32(addr, value) {
                return Err(Trap::host("poke out of bounds"));
            }
            Ok(())
        }),
    );

    let mut builder = FunctionBuilder::new(def(
        0,
        "main",
        &[ValueType::I32, ValueType::I32],
        &[ValueType::I32],
    ));
    builder
        .local_get(0)
        .local_get(1)
        .call_host(&poke)
        .local_get(0)
        .op(Op::Load(LoadOp::I32, MemArg::default()))
        .end();
    let module = engine
        .compile_module(&ModuleIr::new(vec![builder.finish()]))
        .expect("module compiles");
    let mut instance = Instance::new(module, Vec::new(), Some(MemoryInstance::new(1, None)), Vec::new())
        .expect("instance");

    assert_eq!(call_i32(&mut instance, 0, &[8, 77]), Ok(77));
    assert_eq!(seen.lock().expect("recorder").as_deref(), Some("main"));

    let trap = call_i32(&mut instance, 0, &[65535, 1]).expect_err("host rejects the address");
    assert_eq!(trap.reason(), &TrapReason::Host("poke out of bounds".to_string()));
}

#[test]
fn host_errors_are_located_at_the_compiled_caller() {
    if !native_backend_available() {
        return;
    }
    let engine = engine();
    let deny = host(
        "env.deny",
        &[ValueType::I32],
        &[ValueType::I32],
        host_fn(|_, _| Err(Trap::host("denied"))),
    );

    let helper = def(1, "helper", &[ValueType::I32], &[ValueType::I32]);
    let mut main = FunctionBuilder::new(def(0, "main", &[ValueType::I32], &[ValueType::I32]));
    main.local_get(0).call(&helper).end();
    let mut helper_body = FunctionBuilder::new(helper.clone()).start_offset(0x20);
    helper_body.local_get(0).call_host(&deny).end();
    let mut instance = instantiate(&engine, vec![main.finish(), helper_body.finish()]);

    let trap = call_i32(&mut instance, 0, &[3]).expect_err("host denies");
    assert_eq!(trap.reason(), &TrapReason::Host("denied".to_string()));
    assert_eq!(trap.function(), Some("helper"));
    assert_eq!(trap.source_offset(), Some(0x21));
    let frames: Vec<(&str, Option<u64>)> = trap
        .backtrace()
        .iter()
        .map(|frame| (frame.function.as_str(), frame.source_offset))
        .collect();
    assert_eq!(frames, vec![("helper", Some(0x21)), ("main", Some(1))]);
}

#[test]
fn host_panics_become_traps() {
    if !native_backend_available() {
        return;
    }
    let engine = engine();
    let explode = host(
        "env.explode",
        &[ValueType::I32],
        &[ValueType::I32],
        host_fn(|_, _| panic!("boom")),
    );
    let mut instance = instantiate(&engine, vec![forward_to(&explode)]);

    let trap = call_i32(&mut instance, 0, &[1]).expect_err("host panics");
    assert_eq!(trap.reason(), &TrapReason::HostPanic("boom".to_string()));
    assert_eq!(trap.function(), Some("main"));
    assert_eq!(trap.source_offset(), Some(1));

    // The instance stays usable after a host panic.
    let mut instance = instantiate(&engine, vec![forward_to(&add_one())]);
    assert_eq!(call_i32(&mut instance, 0, &[1]), Ok(2));
}

#[test]
fn host_functions_can_walk_the_compiled_stack() {
    if !native_backend_available() {
        return;
    }
    let engine = engine();
    let walked = Arc::new(Mutex::new(Vec::new()));
    let recorder = walked.clone();
    let inspect = host(
        "env.inspect",
        &[],
        &[],
        host_fn(move |caller, _| {
            let mut stack = caller.stack();
            let mut frames = recorder.lock().expect("recorder");
            while let Some(frame) = stack.next_frame() {
                frames.push((
                    frame.function().definition().debug_name().to_string(),
                    frame.parameters().to_vec(),
                    frame.source_offset(),
                ));
            }
            Ok(())
        }),
    );

    let leaf = def(1, "leaf", &[ValueType::I32, ValueType::I32], &[ValueType::I32]);
    let mut main = FunctionBuilder::new(def(0, "main", &[], &[ValueType::I32]));
    main.i32_const(4).i32_const(5).call(&leaf).end();
    let mut leaf_body = FunctionBuilder::new(leaf.clone()).start_offset(0x10);
    leaf_body
        .call_host(&inspect)
        .local_get(0)
        .local_get(1)
        .op(Op::I32Binary(IntBinary::Add))
        .end();
    let mut instance = instantiate(&engine, vec![main.finish(), leaf_body.finish()]);

    assert_eq!(call_i32(&mut instance, 0, &[]), Ok(9));
    assert_eq!(
        *walked.lock().expect("recorder"),
        vec![
            ("leaf".to_string(), vec![encode_i32(4), encode_i32(5)], Some(0x10)),
            ("main".to_string(), vec![], Some(2)),
        ]
    );
}
