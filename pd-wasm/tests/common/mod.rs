#![allow(dead_code, unused_imports)]

use std::sync::{Arc, Once};

pub use wasmjit::abi::{decode_i32, decode_i64, encode_i32, encode_i64};
pub use wasmjit::{
    CompiledModule, Engine, EngineConfig, ExecContext, FunctionBuilder, FunctionDefinition,
    FunctionIr, GlobalInstance, HostFunc, Instance, MemoryInstance, ModuleIr, Op, TableInstance,
    Trap, TrapCode, TrapReason, ValueType,
};

use wasmjit::ir::IntBinary;

/// Generated code only runs where an executable mapping and the x86-64
/// backend are both available.
pub fn native_backend_available() -> bool {
    cfg!(all(
        target_arch = "x86_64",
        any(target_os = "linux", target_os = "macos", target_os = "windows")
    ))
}

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn engine() -> Engine {
    engine_with(EngineConfig::default())
}

pub fn engine_with(config: EngineConfig) -> Engine {
    init_tracing();
    Engine::new(config).expect("host architecture has a backend")
}

pub fn def(index: u32, name: &str, params: &[ValueType], results: &[ValueType]) -> Arc<FunctionDefinition> {
    Arc::new(FunctionDefinition::new(
        index,
        name,
        params.to_vec(),
        results.to_vec(),
    ))
}

/// `(i32, i32) -> i32` applying `op` to both parameters.
pub fn binary_i32(index: u32, name: &str, op: IntBinary) -> FunctionIr {
    let mut builder = FunctionBuilder::new(def(
        index,
        name,
        &[ValueType::I32, ValueType::I32],
        &[ValueType::I32],
    ));
    builder
        .local_get(0)
        .local_get(1)
        .op(Op::I32Binary(op))
        .end();
    builder.finish()
}

pub fn instantiate(engine: &Engine, functions: Vec<FunctionIr>) -> Instance {
    let module = engine
        .compile_module(&ModuleIr::new(functions))
        .expect("module compiles");
    Instance::new(module, Vec::new(), None, Vec::new()).expect("no records required")
}

pub fn call_i32(instance: &mut Instance, index: u32, args: &[i32]) -> Result<i32, Trap> {
    let args: Vec<u64> = args.iter().map(|arg| encode_i32(*arg)).collect();
    let results = instance.call(&ExecContext::new(), index, &args)?;
    Ok(decode_i32(results[0]))
}
