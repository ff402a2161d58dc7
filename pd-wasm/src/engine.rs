//! Compilation entry point.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::backend::{BackendRegistry, CodeRequirements, ExecutableMemory, MachineBackend};
use crate::config::EngineConfig;
use crate::debug_info::{FunctionDefinition, SourceMap};
use crate::error::{CompileError, CompileResult, EngineError};
use crate::exec::CallFrame;
use crate::ir::{FunctionIr, HostFunc, ModuleIr};

/// Native entry point of a compiled function: `(frame, slots) -> status`.
pub(crate) type NativeEntry = unsafe extern "C" fn(*const CallFrame<'static>, *mut u64) -> u32;

pub struct Engine {
    config: EngineConfig,
    backend: Box<dyn MachineBackend>,
}

impl Engine {
    /// Engine for the architecture this process runs on.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Self::with_registry(
            config,
            &BackendRegistry::with_host_backends(),
            std::env::consts::ARCH,
        )
    }

    pub fn with_registry(
        config: EngineConfig,
        registry: &BackendRegistry,
        arch: &str,
    ) -> Result<Self, EngineError> {
        let backend = registry.select(arch)?;
        info!(
            arch,
            backend = backend.name(),
            max_call_depth = config.max_call_depth,
            "selected machine backend"
        );
        Ok(Self { config, backend })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn compile(&self, function: &FunctionIr) -> CompileResult<CompiledCode> {
        let lowered = self.backend.lower(function)?;
        let memory = ExecutableMemory::from_code(&lowered.bytes)?;
        debug!(
            function = function.name(),
            code_bytes = lowered.data_offset,
            data_bytes = lowered.bytes.len() - lowered.data_offset,
            frame_slots = lowered.frame_slots,
            host_imports = lowered.host_imports.len(),
            "compiled function"
        );
        Ok(CompiledCode {
            definition: function.definition.clone(),
            memory,
            code_len: lowered.data_offset,
            frame_slots: lowered.frame_slots,
            source_map: lowered.source_map,
            host_imports: lowered.host_imports,
            requirements: lowered.requirements,
        })
    }

    /// Compiles every function; function `i` must carry definition index `i`.
    pub fn compile_module(&self, module: &ModuleIr) -> CompileResult<Arc<CompiledModule>> {
        let mut functions = Vec::with_capacity(module.functions.len());
        let mut requirements = CodeRequirements::default();
        for (position, function) in module.functions.iter().enumerate() {
            if function.definition.index() as usize != position {
                return Err(CompileError::Malformed {
                    function: function.name().to_string(),
                    source_offset: function.body.first().map_or(0, |instr| instr.source_offset),
                    reason: format!(
                        "function index {} does not match its position {position}",
                        function.definition.index()
                    ),
                });
            }
            let code = self.compile(function)?;
            requirements = requirements.merge(code.requirements);
            functions.push(code);
        }
        info!(functions = functions.len(), "compiled module");
        Ok(Arc::new(CompiledModule {
            functions,
            config: self.config.clone(),
            requirements,
        }))
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("backend", &self.backend.name())
            .finish()
    }
}

/// One function's executable code plus everything needed to run it.
///
/// Owns the host callables whose slots are embedded in its data region, so
/// those slots stay valid for as long as the code can run.
pub struct CompiledCode {
    definition: Arc<FunctionDefinition>,
    memory: ExecutableMemory,
    code_len: usize,
    frame_slots: usize,
    source_map: SourceMap,
    host_imports: Vec<HostFunc>,
    requirements: CodeRequirements,
}

impl CompiledCode {
    pub fn definition(&self) -> &FunctionDefinition {
        &self.definition
    }

    pub fn frame_slots(&self) -> usize {
        self.frame_slots
    }

    pub fn source_map(&self) -> &SourceMap {
        &self.source_map
    }

    pub fn host_imports(&self) -> &[HostFunc] {
        &self.host_imports
    }

    pub fn requirements(&self) -> CodeRequirements {
        self.requirements
    }

    /// Address of the first instruction.
    pub fn code_base(&self) -> usize {
        self.memory.as_ptr() as usize
    }

    pub fn code_len(&self) -> usize {
        self.code_len
    }

    /// Size of the whole mapping, data region included.
    pub fn mapped_len(&self) -> usize {
        self.memory.len()
    }

    /// Source offset of the instruction covering the absolute address `pc`.
    pub fn source_offset_for_pc(&self, pc: usize) -> Option<u64> {
        if !self.memory.contains(pc) {
            return None;
        }
        let offset = pc - self.code_base();
        if offset >= self.code_len {
            return None;
        }
        self.source_map.source_offset_for(offset as u64)
    }

    pub(crate) fn entry(&self) -> NativeEntry {
        // SAFETY: the mapping starts with the prologue of a function lowered
        // with exactly this signature.
        unsafe { std::mem::transmute::<*const u8, NativeEntry>(self.memory.as_ptr()) }
    }
}

impl fmt::Debug for CompiledCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledCode")
            .field("definition", &self.definition)
            .field("code_len", &self.code_len)
            .field("frame_slots", &self.frame_slots)
            .field("host_imports", &self.host_imports.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct CompiledModule {
    functions: Vec<CompiledCode>,
    config: EngineConfig,
    requirements: CodeRequirements,
}

impl CompiledModule {
    pub fn function(&self, index: u32) -> Option<&CompiledCode> {
        self.functions.get(index as usize)
    }

    pub fn functions(&self) -> &[CompiledCode] {
        &self.functions
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Globals and tables an instance must provide to run this module.
    pub fn requirements(&self) -> CodeRequirements {
        self.requirements
    }
}
