use std::fmt;

use crate::abi::ValueType;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FunctionKind {
    /// Compiled from module bytecode.
    Module,
    /// Supplied by the embedder and reached through the host-call bridge.
    Host,
}

/// Static metadata for one function. Shared by reference between compiled
/// code, call frames and listeners.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FunctionDefinition {
    index: u32,
    debug_name: String,
    params: Vec<ValueType>,
    results: Vec<ValueType>,
    kind: FunctionKind,
}

impl FunctionDefinition {
    pub fn new(
        index: u32,
        debug_name: impl Into<String>,
        params: Vec<ValueType>,
        results: Vec<ValueType>,
    ) -> Self {
        Self {
            index,
            debug_name: debug_name.into(),
            params,
            results,
            kind: FunctionKind::Module,
        }
    }

    pub fn host(
        debug_name: impl Into<String>,
        params: Vec<ValueType>,
        results: Vec<ValueType>,
    ) -> Self {
        Self {
            index: u32::MAX,
            debug_name: debug_name.into(),
            params,
            results,
            kind: FunctionKind::Host,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    pub fn params(&self) -> &[ValueType] {
        &self.params
    }

    pub fn results(&self) -> &[ValueType] {
        &self.results
    }

    pub fn kind(&self) -> FunctionKind {
        self.kind
    }

    pub fn is_host(&self) -> bool {
        self.kind == FunctionKind::Host
    }

    /// Slots a caller reserves for this function: params on entry, results on return.
    pub fn stack_len(&self) -> usize {
        self.params.len().max(self.results.len())
    }
}

impl fmt::Display for FunctionDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params = self
            .params
            .iter()
            .map(|ty| ty.name())
            .collect::<Vec<_>>()
            .join(", ");
        let results = self
            .results
            .iter()
            .map(|ty| ty.name())
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "{}({params}) -> ({results})", self.debug_name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PcMapping {
    pub native_offset: u64,
    pub source_offset: u64,
}

/// Sorted native-offset → source-offset table for one compiled function.
///
/// An entry covers every native offset from its own up to the next entry,
/// so any program counter inside an instruction's lowering resolves to
/// that instruction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceMap {
    entries: Vec<PcMapping>,
}

impl SourceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(mut entries: Vec<PcMapping>) -> Self {
        entries.sort_by_key(|entry| entry.native_offset);
        Self { entries }
    }

    pub fn entries(&self) -> &[PcMapping] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends a mapping; offsets must be pushed in ascending native order.
    pub fn mark(&mut self, native_offset: u64, source_offset: u64) {
        if let Some(last) = self.entries.last_mut() {
            if last.source_offset == source_offset {
                return;
            }
            if last.native_offset == native_offset {
                last.source_offset = source_offset;
                return;
            }
        }
        self.entries.push(PcMapping {
            native_offset,
            source_offset,
        });
    }

    pub fn source_offset_for(&self, native_offset: u64) -> Option<u64> {
        if self.entries.is_empty() {
            return None;
        }
        let mut lo = 0;
        let mut hi = self.entries.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.entries[mid].native_offset <= native_offset {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo == 0 {
            None
        } else {
            Some(self.entries[lo - 1].source_offset)
        }
    }
}
