//! Read-only walking of live compiled frames, innermost first.

use std::fmt;

use crate::debug_info::{FunctionDefinition, SourceMap};
use crate::exec::CallFrame;

/// Native return address of a frame, as recorded at its last call-out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProgramCounter(pub u64);

impl fmt::Display for ProgramCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Cursor over the frames below a call.
///
/// Each [`StackFrame`] borrows the walker, so a frame view cannot outlive
/// the step that produced it.
pub struct StackWalker<'a> {
    next: Option<&'a CallFrame<'a>>,
}

impl<'a> StackWalker<'a> {
    pub(crate) fn new(start: Option<&'a CallFrame<'a>>) -> Self {
        Self { next: start }
    }

    pub fn next_frame(&mut self) -> Option<StackFrame<'_>> {
        let frame = self.next?;
        self.next = frame.caller;
        Some(StackFrame { frame })
    }

    pub fn is_exhausted(&self) -> bool {
        self.next.is_none()
    }

    /// Frames remaining, without advancing.
    pub fn depth(&self) -> usize {
        std::iter::successors(self.next, |frame| frame.caller).count()
    }
}

impl fmt::Debug for StackWalker<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackWalker")
            .field("remaining", &self.depth())
            .finish()
    }
}

pub struct StackFrame<'w> {
    frame: &'w CallFrame<'w>,
}

impl<'w> StackFrame<'w> {
    pub fn function(&self) -> InternalFunction<'w> {
        InternalFunction {
            definition: self.frame.definition,
            source_map: self.frame.source_map,
            code_base: self.frame.code_base,
        }
    }

    /// Arguments the frame was entered with, in slot encoding.
    pub fn parameters(&self) -> &'w [u64] {
        self.frame.params
    }

    pub fn program_counter(&self) -> ProgramCounter {
        ProgramCounter(self.frame.exit_pc.get() as u64)
    }

    pub fn source_offset(&self) -> Option<u64> {
        self.frame.source_offset()
    }
}

/// The compiled function behind a [`StackFrame`].
#[derive(Clone, Copy)]
pub struct InternalFunction<'w> {
    definition: &'w FunctionDefinition,
    source_map: &'w SourceMap,
    code_base: usize,
}

impl<'w> InternalFunction<'w> {
    pub fn definition(&self) -> &'w FunctionDefinition {
        self.definition
    }

    pub fn source_offset_for_pc(&self, pc: ProgramCounter) -> Option<u64> {
        let offset = pc.0.checked_sub(self.code_base as u64)?;
        self.source_map.source_offset_for(offset)
    }
}
