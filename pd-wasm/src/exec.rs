//! Call execution.
//!
//! Every compiled or host call goes through [`dispatch`], which asks the
//! context's listener factory about the callee and fires the before, after
//! and abort notifications around it. Generated code re-enters Rust only
//! through the `extern "C"` trampolines at the bottom of this file.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::abi::{decode_i32, encode_i32};
use crate::backend::{STATUS_OK, STATUS_PROPAGATE, STATUS_TRAP};
use crate::bridge::{self, Caller, HostCallSlot};
use crate::debug_info::{FunctionDefinition, SourceMap};
use crate::engine::{CompiledCode, CompiledModule};
use crate::listener::FunctionListenerFactory;
use crate::runtime::{GlobalInstance, MemoryInstance, TableInstance};
use crate::stack::StackWalker;
use crate::trap::{FrameInfo, Trap, TrapCode, TrapReason};

/// Shape shared by every helper generated code calls:
/// `(frame, argument, operand stack, argument) -> status`.
pub(crate) type Trampoline =
    extern "C" fn(*const CallFrame<'static>, u64, *mut u64, u64) -> u32;

/// Per-call-tree settings threaded through every call.
#[derive(Clone, Default)]
pub struct ExecContext {
    listener_factory: Option<Arc<dyn FunctionListenerFactory>>,
}

impl ExecContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listener_factory(mut self, factory: Arc<dyn FunctionListenerFactory>) -> Self {
        self.listener_factory = Some(factory);
        self
    }

    pub fn listener_factory(&self) -> Option<&Arc<dyn FunctionListenerFactory>> {
        self.listener_factory.as_ref()
    }
}

impl fmt::Debug for ExecContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecContext")
            .field("listener_factory", &self.listener_factory.is_some())
            .finish()
    }
}

/// State shared by all frames of one top-level call.
pub(crate) struct Session<'a> {
    module: &'a CompiledModule,
    ctx: &'a ExecContext,
    globals: *mut GlobalInstance,
    memory: *mut MemoryInstance,
    tables: *mut TableInstance,
    depth: Cell<usize>,
    /// Lowest native stack address a call may start at.
    stack_limit: usize,
}

impl<'a> Session<'a> {
    pub(crate) fn new(
        module: &'a CompiledModule,
        ctx: &'a ExecContext,
        globals: *mut GlobalInstance,
        memory: *mut MemoryInstance,
        tables: *mut TableInstance,
    ) -> Self {
        let stack_limit = stack_pointer().saturating_sub(module.config().max_stack_bytes);
        Self {
            module,
            ctx,
            globals,
            memory,
            tables,
            depth: Cell::new(0),
            stack_limit,
        }
    }
}

/// Approximate native stack pointer of the calling frame. Every supported
/// target grows its stack downwards.
#[inline(never)]
fn stack_pointer() -> usize {
    let marker = 0u8;
    std::hint::black_box(&marker) as *const u8 as usize
}

/// One live activation of a compiled function.
///
/// Generated code addresses the leading fields through the
/// `CALL_FRAME_*` constants in [`crate::layout`].
#[repr(C)]
pub(crate) struct CallFrame<'a> {
    pub(crate) exit_pc: Cell<usize>,
    pub(crate) trap_code: Cell<u32>,
    pub(crate) globals: *mut GlobalInstance,
    pub(crate) memory: *mut MemoryInstance,
    pub(crate) tables: *mut TableInstance,
    pub(crate) session: Option<&'a Session<'a>>,
    pub(crate) caller: Option<&'a CallFrame<'a>>,
    pub(crate) definition: &'a FunctionDefinition,
    pub(crate) code_base: usize,
    pub(crate) source_map: &'a SourceMap,
    pub(crate) params: &'a [u64],
    /// Trap parked by a failed call-out until the body unwinds.
    pub(crate) pending: RefCell<Option<Trap>>,
}

impl<'a> CallFrame<'a> {
    fn enter(
        session: &'a Session<'a>,
        caller: Option<&'a CallFrame<'a>>,
        code: &'a CompiledCode,
        params: &'a [u64],
    ) -> Self {
        Self {
            exit_pc: Cell::new(0),
            trap_code: Cell::new(0),
            globals: session.globals,
            memory: session.memory,
            tables: session.tables,
            session: Some(session),
            caller,
            definition: code.definition(),
            code_base: code.code_base(),
            source_map: code.source_map(),
            params,
            pending: RefCell::new(None),
        }
    }

    /// A frame with no session or runtime state, positioned at `pc`.
    #[cfg(test)]
    pub(crate) fn synthetic(
        definition: &'a FunctionDefinition,
        source_map: &'a SourceMap,
        params: &'a [u64],
        pc: usize,
        caller: Option<&'a CallFrame<'a>>,
    ) -> Self {
        Self {
            exit_pc: Cell::new(pc),
            trap_code: Cell::new(0),
            globals: std::ptr::null_mut(),
            memory: std::ptr::null_mut(),
            tables: std::ptr::null_mut(),
            session: None,
            caller,
            definition,
            code_base: 0,
            source_map,
            params,
            pending: RefCell::new(None),
        }
    }

    pub(crate) fn source_offset(&self) -> Option<u64> {
        let offset = self.exit_pc.get().checked_sub(self.code_base)?;
        self.source_map.source_offset_for(offset as u64)
    }
}

/// Calls a compiled function; `stack` carries the arguments in and the
/// results out and is at least `definition.stack_len()` long.
pub(crate) fn call_compiled<'a>(
    session: &'a Session<'a>,
    caller: Option<&'a CallFrame<'a>>,
    code: &'a CompiledCode,
    stack: &mut [u64],
) -> Result<(), Trap> {
    dispatch(session, caller, code.definition(), stack, |stack| {
        execute(session, caller, code, stack)
    })
}

struct DepthGuard<'s> {
    depth: &'s Cell<usize>,
    previous: usize,
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.depth.set(self.previous);
    }
}

fn dispatch<'a>(
    session: &'a Session<'a>,
    caller: Option<&'a CallFrame<'a>>,
    definition: &FunctionDefinition,
    stack: &mut [u64],
    body: impl FnOnce(&mut [u64]) -> Result<(), Trap>,
) -> Result<(), Trap> {
    let previous = session.depth.get();
    if previous >= session.module.config().max_call_depth
        || stack_pointer() < session.stack_limit
    {
        return Err(locate(
            caller,
            Trap::new(TrapReason::CallStackExhausted),
        ));
    }

    let listener = session
        .ctx
        .listener_factory()
        .and_then(|factory| factory.new_listener(definition));
    if let Some(listener) = &listener {
        let mut walker = StackWalker::new(caller);
        listener.before(definition, &stack[..definition.params().len()], &mut walker);
    }

    let result = {
        session.depth.set(previous + 1);
        let _guard = DepthGuard {
            depth: &session.depth,
            previous,
        };
        body(stack)
    };

    if let Some(listener) = &listener {
        match &result {
            Ok(()) => listener.after(definition, &stack[..definition.results().len()]),
            Err(trap) => listener.abort(definition, trap),
        }
    }
    result
}

fn execute<'a>(
    session: &'a Session<'a>,
    caller: Option<&'a CallFrame<'a>>,
    code: &'a CompiledCode,
    stack: &mut [u64],
) -> Result<(), Trap> {
    let definition = code.definition();
    let params = definition.params().len();
    let mut slots = vec![0u64; code.frame_slots()];
    slots[..params].copy_from_slice(&stack[..params]);

    {
        let frame = CallFrame::enter(session, caller, code, &stack[..params]);
        let entry = code.entry();
        // SAFETY: `entry` was lowered for this definition, `slots` has the
        // frame size it was lowered with, and the frame outlives the call.
        let status = unsafe {
            entry(
                (&frame as *const CallFrame<'_>).cast::<CallFrame<'static>>(),
                slots.as_mut_ptr(),
            )
        };
        finish(&frame, status)?;
    }

    let results = definition.results().len();
    stack[..results].copy_from_slice(&slots[..results]);
    Ok(())
}

fn finish(frame: &CallFrame<'_>, status: u32) -> Result<(), Trap> {
    match status {
        STATUS_OK => Ok(()),
        STATUS_TRAP => {
            let raw = frame.trap_code.get();
            let trap = match TrapCode::from_raw(raw) {
                Some(code) => Trap::code(code),
                None => Trap::host(format!("generated code raised unknown trap code {raw}")),
            };
            let trap = locate(Some(frame), trap);
            tracing::debug!(
                function = frame.definition.debug_name(),
                source_offset = ?trap.source_offset(),
                reason = %trap.reason(),
                "trap raised in generated code"
            );
            Err(trap)
        }
        STATUS_PROPAGATE => Err(frame
            .pending
            .borrow_mut()
            .take()
            .unwrap_or_else(|| Trap::host("call-out failed without parking a trap"))),
        other => Err(Trap::host(format!(
            "generated code returned unknown status {other}"
        ))),
    }
}

/// Stamps `trap` with `frame`'s location and, if configured, a backtrace
/// walked from `frame`. Traps that already carry a location keep it.
fn locate(frame: Option<&CallFrame<'_>>, trap: Trap) -> Trap {
    let Some(frame) = frame else {
        return trap;
    };
    let trap = trap.at(frame.definition.debug_name(), frame.source_offset());
    let capture = frame
        .session
        .is_none_or(|session| session.module.config().capture_backtrace);
    if !capture {
        return trap;
    }
    trap.with_backtrace(backtrace(frame))
}

pub(crate) fn backtrace(frame: &CallFrame<'_>) -> Vec<FrameInfo> {
    let mut walker = StackWalker::new(Some(frame));
    let mut frames = Vec::new();
    while let Some(frame) = walker.next_frame() {
        frames.push(FrameInfo {
            function: frame.function().definition().debug_name().to_string(),
            source_offset: frame.source_offset(),
        });
    }
    frames
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Runs a call-out body, parking any failure in `frame` for the generated
/// code to propagate. Panics never cross back into generated code.
fn run_call_out(frame: &CallFrame<'_>, body: impl FnOnce() -> Result<(), Trap>) -> u32 {
    let trap = match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(())) => return STATUS_OK,
        Ok(Err(trap)) => trap,
        Err(payload) => locate(
            Some(frame),
            Trap::new(TrapReason::HostPanic(panic_message(payload.as_ref()))),
        ),
    };
    *frame.pending.borrow_mut() = Some(trap);
    STATUS_PROPAGATE
}

fn session_of<'a>(frame: &CallFrame<'a>) -> Result<&'a Session<'a>, Trap> {
    frame
        .session
        .ok_or_else(|| Trap::host("call-out from a frame without a session"))
}

pub(crate) extern "C" fn call_function_trampoline(
    frame: *const CallFrame<'static>,
    index: u64,
    stack: *mut u64,
    _unused: u64,
) -> u32 {
    // SAFETY: generated code passes back the frame it was entered with.
    let frame: &CallFrame<'_> = unsafe { &*frame };
    run_call_out(frame, || {
        let session = session_of(frame)?;
        let index = index as u32;
        let Some(code) = session.module.function(index) else {
            return Err(locate(Some(frame), Trap::new(TrapReason::UnknownFunction(index))));
        };
        // SAFETY: the lowering reserved `stack_len` slots at `stack`.
        let stack =
            unsafe { std::slice::from_raw_parts_mut(stack, code.definition().stack_len()) };
        call_compiled(session, Some(frame), code, stack)
    })
}

pub(crate) extern "C" fn call_host_trampoline(
    frame: *const CallFrame<'static>,
    slot: u64,
    stack: *mut u64,
    definition: u64,
) -> u32 {
    // SAFETY: `slot` and `definition` point into the data region and host
    // imports of the calling code object, which outlive this call.
    let (frame, slot, definition): (&CallFrame<'_>, &HostCallSlot, &FunctionDefinition) = unsafe {
        (
            &*frame,
            &*(slot as usize as *const HostCallSlot),
            &*(definition as usize as *const FunctionDefinition),
        )
    };
    // Unwinding out of an `extern "C"` fn aborts, which is what a corrupt
    // code object deserves.
    assert!(slot.is_bound(), "generated code referenced an unbound host-call slot");
    run_call_out(frame, || {
        let session = session_of(frame)?;
        // SAFETY: see `call_function_trampoline`.
        let stack = unsafe { std::slice::from_raw_parts_mut(stack, definition.stack_len()) };
        call_host(session, frame, definition, slot, stack)
    })
}

fn call_host<'a>(
    session: &'a Session<'a>,
    frame: &'a CallFrame<'a>,
    definition: &FunctionDefinition,
    slot: &HostCallSlot,
    stack: &mut [u64],
) -> Result<(), Trap> {
    dispatch(session, Some(frame), definition, stack, |stack| {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut caller = Caller::new(frame);
            // SAFETY: the code object holding `slot` keeps the callable alive.
            unsafe { bridge::invoke(slot, &mut caller, stack) }
        }));
        let outcome = outcome.unwrap_or_else(|payload| {
            Err(Trap::new(TrapReason::HostPanic(panic_message(payload.as_ref()))))
        });
        outcome.map_err(|trap| locate(Some(frame), trap))
    })
}

pub(crate) extern "C" fn memory_grow_trampoline(
    frame: *const CallFrame<'static>,
    _unused: u64,
    stack: *mut u64,
    _unused_too: u64,
) -> u32 {
    // SAFETY: generated code passes back the frame it was entered with.
    let frame: &CallFrame<'_> = unsafe { &*frame };
    run_call_out(frame, || {
        // SAFETY: the operand slot holding the delta is reserved.
        let slot = unsafe { &mut *stack };
        // SAFETY: the instance's memory outlives the call and generated
        // code does not touch it while this runs.
        let Some(memory) = (unsafe { frame.memory.as_mut() }) else {
            *slot = encode_i32(-1);
            return Ok(());
        };
        let delta = decode_i32(*slot) as u32;
        let previous = memory.grow(delta);
        tracing::trace!(delta, ?previous, "memory.grow");
        *slot = encode_i32(previous.map_or(-1, |pages| pages as i32));
        Ok(())
    })
}
