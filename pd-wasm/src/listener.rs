//! Per-call observation hooks.
//!
//! An [`ExecContext`](crate::exec::ExecContext) may carry a
//! [`FunctionListenerFactory`]. Before every call, compiled or host, the
//! factory is asked once whether it wants to observe the callee; declining
//! costs nothing beyond that question.

use std::sync::Arc;

use crate::debug_info::FunctionDefinition;
use crate::stack::StackWalker;
use crate::trap::Trap;

pub mod logging;

pub use logging::{LoggingListenerFactory, LoggingScope};

pub trait FunctionListenerFactory: Send + Sync {
    fn new_listener(&self, definition: &FunctionDefinition) -> Option<Arc<dyn FunctionListener>>;
}

/// Notifications for one call. Exactly one of `after` or `abort` follows
/// each `before`.
pub trait FunctionListener: Send + Sync {
    /// `stack` is positioned at the caller and must not be retained.
    fn before(&self, _definition: &FunctionDefinition, _params: &[u64], _stack: &mut StackWalker<'_>) {}

    fn after(&self, _definition: &FunctionDefinition, _results: &[u64]) {}

    fn abort(&self, _definition: &FunctionDefinition, _trap: &Trap) {}
}
