pub mod abi;
pub mod backend;
pub mod bridge;
pub mod config;
pub mod debug_info;
pub mod engine;
pub mod error;
pub mod exec;
pub mod ir;
pub mod layout;
pub mod listener;
pub mod runtime;
pub mod stack;
pub mod trap;

pub use abi::{Slot, Value, ValueType};
pub use backend::{BackendRegistry, CodeRequirements, LoweredFunction, MachineBackend};
pub use bridge::{Caller, HostCallSlot, HostFunction, host_fn};
pub use config::{ConfigError, EngineConfig};
pub use debug_info::{FunctionDefinition, FunctionKind, PcMapping, SourceMap};
pub use engine::{CompiledCode, CompiledModule, Engine};
pub use error::{CompileError, CompileResult, EngineError, InstanceError, InstanceResult};
pub use exec::ExecContext;
pub use ir::{CallTarget, FunctionBuilder, FunctionIr, HostFunc, ModuleIr, Op};
pub use listener::{FunctionListener, FunctionListenerFactory, LoggingListenerFactory, LoggingScope};
pub use runtime::{GlobalInstance, GlobalType, Instance, MemoryInstance, TableInstance};
pub use stack::{InternalFunction, ProgramCounter, StackFrame, StackWalker};
pub use trap::{FrameInfo, Trap, TrapCode, TrapReason};
