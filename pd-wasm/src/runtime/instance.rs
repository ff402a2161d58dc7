use std::sync::Arc;

use crate::abi::{Value, decode_values, encode_values, format_slots};
use crate::engine::CompiledModule;
use crate::error::{InstanceError, InstanceResult};
use crate::exec::{self, ExecContext, Session};
use crate::trap::{Trap, TrapReason};

use super::{GlobalInstance, MemoryInstance, TableInstance};

/// A compiled module bound to the runtime records its code addresses.
///
/// Globals and tables are fixed in number for the instance's lifetime, so
/// the array bases handed to generated code never move during a call.
#[derive(Debug)]
pub struct Instance {
    module: Arc<CompiledModule>,
    globals: Vec<GlobalInstance>,
    memory: MemoryInstance,
    tables: Vec<TableInstance>,
}

impl Instance {
    /// Fails if the module addresses more globals or tables than provided.
    /// Without a memory the instance gets one that cannot grow.
    pub fn new(
        module: Arc<CompiledModule>,
        globals: Vec<GlobalInstance>,
        memory: Option<MemoryInstance>,
        tables: Vec<TableInstance>,
    ) -> InstanceResult<Self> {
        let requirements = module.requirements();
        if globals.len() < requirements.globals as usize {
            return Err(InstanceError::MissingGlobal {
                index: requirements.globals - 1,
                provided: globals.len(),
            });
        }
        if tables.len() < requirements.tables as usize {
            return Err(InstanceError::MissingTable {
                index: requirements.tables - 1,
                provided: tables.len(),
            });
        }
        Ok(Self {
            module,
            globals,
            memory: memory.unwrap_or_else(MemoryInstance::empty),
            tables,
        })
    }

    pub fn module(&self) -> &Arc<CompiledModule> {
        &self.module
    }

    pub fn globals(&self) -> &[GlobalInstance] {
        &self.globals
    }

    pub fn global(&self, index: u32) -> Option<&GlobalInstance> {
        self.globals.get(index as usize)
    }

    pub fn global_mut(&mut self, index: u32) -> Option<&mut GlobalInstance> {
        self.globals.get_mut(index as usize)
    }

    pub fn memory(&self) -> &MemoryInstance {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut MemoryInstance {
        &mut self.memory
    }

    pub fn table(&self, index: u32) -> Option<&TableInstance> {
        self.tables.get(index as usize)
    }

    pub fn table_mut(&mut self, index: u32) -> Option<&mut TableInstance> {
        self.tables.get_mut(index as usize)
    }

    /// Calls function `index` with slot-encoded `args`, returning its results.
    pub fn call(&mut self, ctx: &ExecContext, index: u32, args: &[u64]) -> Result<Vec<u64>, Trap> {
        let Some(code) = self.module.function(index) else {
            return Err(Trap::new(TrapReason::UnknownFunction(index)));
        };
        let definition = code.definition();
        if args.len() != definition.params().len() {
            return Err(Trap::new(TrapReason::ArgumentCount {
                expected: definition.params().len(),
                got: args.len(),
            }));
        }
        tracing::trace!(
            function = definition.debug_name(),
            args = %format_slots(definition.params(), args),
            "call"
        );

        let session = Session::new(
            &self.module,
            ctx,
            self.globals.as_mut_ptr(),
            &mut self.memory,
            self.tables.as_mut_ptr(),
        );
        let mut stack = vec![0u64; definition.stack_len()];
        stack[..args.len()].copy_from_slice(args);
        exec::call_compiled(&session, None, code, &mut stack)?;
        stack.truncate(definition.results().len());
        Ok(stack)
    }

    /// [`Instance::call`] with typed values.
    pub fn call_values(
        &mut self,
        ctx: &ExecContext,
        index: u32,
        args: &[Value],
    ) -> Result<Vec<Value>, Trap> {
        let results = self.call(ctx, index, &encode_values(args))?;
        let types = self
            .module
            .function(index)
            .map(|code| code.definition().results().to_vec())
            .unwrap_or_default();
        Ok(decode_values(&types, &results))
    }
}
