//! Machine backends.
//!
//! A backend lowers one [`FunctionIr`] into position-independent machine
//! code followed by a data region. Which backend runs is decided once, when
//! the [`Engine`](crate::Engine) is built, by looking the host architecture
//! up in a [`BackendRegistry`].

use std::collections::BTreeMap;

use crate::debug_info::SourceMap;
use crate::error::{CompileResult, EngineError};
use crate::ir::{FunctionIr, HostFunc};

mod executable;
#[cfg(target_arch = "x86_64")]
pub mod x86_64;

pub(crate) use executable::ExecutableMemory;

/// Generated code returned normally; results are in the frame's slots.
pub const STATUS_OK: u32 = 0;
/// Generated code hit a trap; the frame holds the trap code and exit pc.
pub const STATUS_TRAP: u32 = 1;
/// A call-out failed; the trap is parked in the frame's pending slot.
pub const STATUS_PROPAGATE: u32 = 2;

pub trait MachineBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn lower(&self, function: &FunctionIr) -> CompileResult<LoweredFunction>;
}

/// Instance records a function's code addresses directly.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CodeRequirements {
    pub globals: u32,
    pub tables: u32,
}

impl CodeRequirements {
    pub fn merge(self, other: CodeRequirements) -> Self {
        Self {
            globals: self.globals.max(other.globals),
            tables: self.tables.max(other.tables),
        }
    }
}

#[derive(Debug)]
pub struct LoweredFunction {
    /// Machine code, then the data region starting at `data_offset`.
    pub bytes: Vec<u8>,
    pub data_offset: usize,
    /// Slots the caller must allocate: locals then operand stack.
    pub frame_slots: usize,
    pub source_map: SourceMap,
    /// Host callables whose slots are embedded in the data region.
    pub host_imports: Vec<HostFunc>,
    pub requirements: CodeRequirements,
}

pub type BackendFactory = fn() -> Box<dyn MachineBackend>;

#[derive(Default)]
pub struct BackendRegistry {
    factories: BTreeMap<String, BackendFactory>,
}

impl BackendRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry holding every backend compiled into this build.
    pub fn with_host_backends() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::empty();
        #[cfg(target_arch = "x86_64")]
        registry.register("x86_64", || Box::new(x86_64::X86_64Backend));
        registry
    }

    pub fn register(&mut self, arch: impl Into<String>, factory: BackendFactory) {
        self.factories.insert(arch.into(), factory);
    }

    pub fn architectures(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn select(&self, arch: &str) -> Result<Box<dyn MachineBackend>, EngineError> {
        self.factories
            .get(arch)
            .map(|factory| factory())
            .ok_or_else(|| EngineError::UnsupportedArchitecture(arch.to_string()))
    }
}
