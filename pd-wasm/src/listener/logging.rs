use std::cell::RefCell;
use std::sync::Arc;

use crate::abi::format_slots;
use crate::debug_info::FunctionDefinition;
use crate::stack::StackWalker;
use crate::trap::Trap;

use super::{FunctionListener, FunctionListenerFactory};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LoggingScope {
    #[default]
    All,
    HostOnly,
}

/// Emits a `tracing` event per call entry and exit, indented by call depth.
#[derive(Debug, Default)]
pub struct LoggingListenerFactory {
    scope: LoggingScope,
    listener: Arc<LoggingListener>,
}

impl LoggingListenerFactory {
    pub fn new(scope: LoggingScope) -> Self {
        Self {
            scope,
            listener: Arc::new(LoggingListener),
        }
    }

    pub fn scope(&self) -> LoggingScope {
        self.scope
    }
}

impl FunctionListenerFactory for LoggingListenerFactory {
    fn new_listener(&self, definition: &FunctionDefinition) -> Option<Arc<dyn FunctionListener>> {
        if self.scope == LoggingScope::HostOnly && !definition.is_host() {
            return None;
        }
        Some(self.listener.clone())
    }
}

thread_local! {
    // Depth of every call this thread has entered but not yet left.
    static OPEN_CALLS: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

#[derive(Debug, Default)]
struct LoggingListener;

fn indent(depth: usize) -> String {
    "  ".repeat(depth)
}

pub(crate) fn format_enter(depth: usize, definition: &FunctionDefinition, params: &[u64]) -> String {
    format!(
        "{}--> {}({})",
        indent(depth),
        definition.debug_name(),
        format_slots(definition.params(), params)
    )
}

pub(crate) fn format_exit(depth: usize, definition: &FunctionDefinition, results: &[u64]) -> String {
    format!(
        "{}<-- ({})",
        indent(depth),
        format_slots(definition.results(), results)
    )
}

pub(crate) fn format_abort(depth: usize, trap: &Trap) -> String {
    format!("{}<-- trap: {}", indent(depth), trap.reason())
}

impl FunctionListener for LoggingListener {
    fn before(&self, definition: &FunctionDefinition, params: &[u64], stack: &mut StackWalker<'_>) {
        let depth = stack.depth();
        OPEN_CALLS.with(|open| open.borrow_mut().push(depth));
        tracing::info!(target: "wasmjit::calls", "{}", format_enter(depth, definition, params));
    }

    fn after(&self, definition: &FunctionDefinition, results: &[u64]) {
        let depth = OPEN_CALLS.with(|open| open.borrow_mut().pop()).unwrap_or_default();
        tracing::info!(target: "wasmjit::calls", "{}", format_exit(depth, definition, results));
    }

    fn abort(&self, _definition: &FunctionDefinition, trap: &Trap) {
        let depth = OPEN_CALLS.with(|open| open.borrow_mut().pop()).unwrap_or_default();
        tracing::info!(target: "wasmjit::calls", "{}", format_abort(depth, trap));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{ValueType, encode_i32};
    use crate::trap::TrapCode;

    #[test]
    fn host_only_scope_declines_module_functions() {
        let factory = LoggingListenerFactory::new(LoggingScope::HostOnly);
        let module_fn = FunctionDefinition::new(0, "main", vec![], vec![]);
        let host_fn = FunctionDefinition::host("env.log", vec![ValueType::I32], vec![]);
        assert!(factory.new_listener(&module_fn).is_none());
        assert!(factory.new_listener(&host_fn).is_some());

        let everything = LoggingListenerFactory::new(LoggingScope::All);
        assert!(everything.new_listener(&module_fn).is_some());
    }

    #[test]
    fn lines_are_indented_by_depth() {
        let definition =
            FunctionDefinition::new(3, "add", vec![ValueType::I32, ValueType::I32], vec![ValueType::I32]);
        let params = [encode_i32(1), encode_i32(-2)];
        let enter = format_enter(2, &definition, &params);
        assert!(enter.starts_with("    --> add("), "{enter}");
        let exit = format_exit(0, &definition, &[encode_i32(-1)]);
        assert!(exit.starts_with("<-- ("), "{exit}");
        assert_eq!(
            format_abort(1, &Trap::code(TrapCode::Unreachable)),
            format!("  <-- trap: {}", Trap::code(TrapCode::Unreachable).reason())
        );
    }

    #[test]
    fn unmatched_exit_does_not_panic() {
        let definition = FunctionDefinition::new(0, "f", vec![], vec![]);
        LoggingListener.after(&definition, &[]);
        LoggingListener.abort(&definition, &Trap::host("x"));
    }
}
