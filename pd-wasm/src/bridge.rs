//! Host-call bridge.
//!
//! A host callable is encoded into a fixed-size [`HostCallSlot`] that the
//! backend copies into a compiled function's data region. Generated code
//! never interprets those bytes; it hands the slot's address to the host
//! trampoline, which recovers the callable through [`invoke`].

use std::fmt;
use std::mem::size_of;
use std::sync::Arc;

use crate::exec::CallFrame;
use crate::runtime::MemoryInstance;
use crate::stack::StackWalker;
use crate::trap::Trap;

/// A function supplied by the embedder.
///
/// `stack` holds the arguments in slot encoding on entry and must hold the
/// results on return; it is `max(params, results)` slots long.
pub trait HostFunction: Send + Sync {
    fn call(&self, caller: &mut Caller<'_>, stack: &mut [u64]) -> Result<(), Trap>;
}

impl<F> HostFunction for F
where
    F: Fn(&mut Caller<'_>, &mut [u64]) -> Result<(), Trap> + Send + Sync,
{
    fn call(&self, caller: &mut Caller<'_>, stack: &mut [u64]) -> Result<(), Trap> {
        self(caller, stack)
    }
}

/// Wraps a closure as a shareable host function.
pub fn host_fn<F>(function: F) -> Arc<dyn HostFunction>
where
    F: Fn(&mut Caller<'_>, &mut [u64]) -> Result<(), Trap> + Send + Sync + 'static,
{
    Arc::new(function)
}

/// The compiled frame a host function was called from.
pub struct Caller<'a> {
    frame: Option<&'a CallFrame<'a>>,
}

impl<'a> Caller<'a> {
    pub(crate) fn new(frame: &'a CallFrame<'a>) -> Self {
        Self { frame: Some(frame) }
    }

    /// A caller with no compiled frame behind it.
    pub fn detached() -> Self {
        Self { frame: None }
    }

    pub fn memory(&self) -> Option<&MemoryInstance> {
        let frame = self.frame?;
        // SAFETY: the frame's memory pointer targets the instance's memory,
        // which outlives the call and is not touched by generated code while
        // the host function runs.
        unsafe { frame.memory.as_ref() }
    }

    pub fn memory_mut(&mut self) -> Option<&mut MemoryInstance> {
        let frame = self.frame?;
        // SAFETY: see `memory`; `&mut self` keeps this the only live borrow.
        unsafe { frame.memory.as_mut() }
    }

    /// Walker positioned at the compiled caller.
    pub fn stack(&self) -> StackWalker<'a> {
        StackWalker::new(self.frame)
    }

    pub fn function_name(&self) -> Option<&str> {
        self.frame.map(|frame| frame.definition.debug_name())
    }
}

pub const HOST_CALL_SLOT_SIZE: usize = 24;

const TAG_UNBOUND: u64 = 0;
const TAG_BOUND: u64 = 1;
const TAG_LEN: usize = 8;

const _: () = assert!(TAG_LEN + size_of::<*const dyn HostFunction>() == HOST_CALL_SLOT_SIZE);

/// `{tag, fat pointer}` encoding of a host callable.
///
/// The slot borrows the callable: whoever embeds it must keep the `Arc`
/// passed to [`bind`] alive for as long as the slot can be invoked.
///
/// Outside this crate the encoding is opaque:
///
/// ```compile_fail
/// let bytes = wasmjit::HostCallSlot::UNBOUND.as_bytes();
/// ```
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct HostCallSlot {
    bytes: [u8; HOST_CALL_SLOT_SIZE],
}

impl HostCallSlot {
    pub const UNBOUND: HostCallSlot = HostCallSlot {
        bytes: [0; HOST_CALL_SLOT_SIZE],
    };

    /// Raw encoding, copied verbatim into a code object's data region.
    pub(crate) fn as_bytes(&self) -> &[u8; HOST_CALL_SLOT_SIZE] {
        &self.bytes
    }

    #[cfg(test)]
    fn from_bytes(bytes: [u8; HOST_CALL_SLOT_SIZE]) -> Self {
        Self { bytes }
    }

    fn tag(&self) -> u64 {
        let mut tag = [0; TAG_LEN];
        tag.copy_from_slice(&self.bytes[..TAG_LEN]);
        u64::from_le_bytes(tag)
    }

    pub fn is_bound(&self) -> bool {
        self.tag() == TAG_BOUND
    }
}

impl fmt::Debug for HostCallSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostCallSlot")
            .field("bound", &self.is_bound())
            .finish()
    }
}

pub fn bind(callable: &Arc<dyn HostFunction>) -> HostCallSlot {
    let mut slot = HostCallSlot::UNBOUND;
    slot.bytes[..TAG_LEN].copy_from_slice(&TAG_BOUND.to_le_bytes());
    let raw: *const dyn HostFunction = Arc::as_ptr(callable);
    // SAFETY: the tail of the slot is exactly one fat pointer wide.
    unsafe {
        std::ptr::write_unaligned(
            slot.bytes[TAG_LEN..].as_mut_ptr().cast::<*const dyn HostFunction>(),
            raw,
        );
    }
    slot
}

/// Recovers the callable from `slot` and calls it.
///
/// # Panics
/// If `slot` was never bound. That means the code object carrying it is
/// corrupt, so there is nothing sensible to return.
///
/// # Safety
/// The callable `slot` was bound from must still be alive.
pub unsafe fn invoke(
    slot: &HostCallSlot,
    caller: &mut Caller<'_>,
    stack: &mut [u64],
) -> Result<(), Trap> {
    match slot.tag() {
        TAG_BOUND => {}
        TAG_UNBOUND => panic!("invoked an unbound host-call slot"),
        other => panic!("host-call slot carries unknown tag {other:#x}"),
    }
    // SAFETY: bound slots hold a pointer written by `bind`; the caller
    // guarantees its referent is alive.
    let callable = unsafe {
        let raw = std::ptr::read_unaligned(
            slot.bytes[TAG_LEN..].as_ptr().cast::<*const dyn HostFunction>(),
        );
        &*raw
    };
    callable.call(caller, stack)
}
