use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TrapCode {
    Unreachable = 1,
    MemoryOutOfBounds = 2,
    TableOutOfBounds = 3,
    IntegerDivideByZero = 4,
    IntegerOverflow = 5,
}

impl TrapCode {
    /// Decodes the code generated code writes into its call frame.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(TrapCode::Unreachable),
            2 => Some(TrapCode::MemoryOutOfBounds),
            3 => Some(TrapCode::TableOutOfBounds),
            4 => Some(TrapCode::IntegerDivideByZero),
            5 => Some(TrapCode::IntegerOverflow),
            _ => None,
        }
    }

    pub fn raw(self) -> u32 {
        self as u32
    }

    pub fn message(self) -> &'static str {
        match self {
            TrapCode::Unreachable => "unreachable executed",
            TrapCode::MemoryOutOfBounds => "out of bounds memory access",
            TrapCode::TableOutOfBounds => "out of bounds table access",
            TrapCode::IntegerDivideByZero => "integer divide by zero",
            TrapCode::IntegerOverflow => "integer overflow",
        }
    }
}

impl fmt::Display for TrapCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrapReason {
    Code(TrapCode),
    /// A host function returned an error.
    Host(String),
    /// A host function panicked; the payload is rendered as text.
    HostPanic(String),
    CallStackExhausted,
    ArgumentCount { expected: usize, got: usize },
    UnknownFunction(u32),
}

impl fmt::Display for TrapReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrapReason::Code(code) => write!(f, "{code}"),
            TrapReason::Host(message) => write!(f, "host error: {message}"),
            TrapReason::HostPanic(message) => write!(f, "host function panicked: {message}"),
            TrapReason::CallStackExhausted => write!(f, "call stack exhausted"),
            TrapReason::ArgumentCount { expected, got } => {
                write!(f, "expected {expected} arguments, got {got}")
            }
            TrapReason::UnknownFunction(index) => write!(f, "unknown function index {index}"),
        }
    }
}

/// One walked frame recorded when a trap is raised.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameInfo {
    pub function: String,
    pub source_offset: Option<u64>,
}

impl fmt::Display for FrameInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.source_offset {
            Some(offset) => write!(f, "{} @ {offset:#x}", self.function),
            None => write!(f, "{} @ ?", self.function),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Trap {
    reason: TrapReason,
    function: Option<String>,
    source_offset: Option<u64>,
    backtrace: Vec<FrameInfo>,
}

impl Trap {
    pub fn new(reason: TrapReason) -> Self {
        Self {
            reason,
            function: None,
            source_offset: None,
            backtrace: Vec::new(),
        }
    }

    pub fn host(message: impl Into<String>) -> Self {
        Self::new(TrapReason::Host(message.into()))
    }

    pub fn code(code: TrapCode) -> Self {
        Self::new(TrapReason::Code(code))
    }

    pub(crate) fn at(mut self, function: &str, source_offset: Option<u64>) -> Self {
        if self.function.is_none() {
            self.function = Some(function.to_string());
            self.source_offset = source_offset;
        }
        self
    }

    pub(crate) fn with_backtrace(mut self, backtrace: Vec<FrameInfo>) -> Self {
        if self.backtrace.is_empty() {
            self.backtrace = backtrace;
        }
        self
    }

    pub fn reason(&self) -> &TrapReason {
        &self.reason
    }

    pub fn trap_code(&self) -> Option<TrapCode> {
        match self.reason {
            TrapReason::Code(code) => Some(code),
            _ => None,
        }
    }

    /// Name of the innermost function the trap was raised in.
    pub fn function(&self) -> Option<&str> {
        self.function.as_deref()
    }

    pub fn source_offset(&self) -> Option<u64> {
        self.source_offset
    }

    pub fn backtrace(&self) -> &[FrameInfo] {
        &self.backtrace
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trap: {}", self.reason)?;
        if let Some(function) = &self.function {
            write!(f, " in '{function}'")?;
        }
        if let Some(offset) = self.source_offset {
            write!(f, " at offset {offset:#x}")?;
        }
        for frame in &self.backtrace {
            write!(f, "\n  at {frame}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Trap {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_codes_decode_back() {
        for code in [
            TrapCode::Unreachable,
            TrapCode::MemoryOutOfBounds,
            TrapCode::TableOutOfBounds,
            TrapCode::IntegerDivideByZero,
            TrapCode::IntegerOverflow,
        ] {
            assert_eq!(TrapCode::from_raw(code.raw()), Some(code));
        }
        assert_eq!(TrapCode::from_raw(0), None);
    }

    #[test]
    fn innermost_location_wins() {
        let trap = Trap::code(TrapCode::Unreachable)
            .at("inner", Some(0x10))
            .at("outer", Some(0x20))
            .with_backtrace(vec![FrameInfo {
                function: "inner".to_string(),
                source_offset: Some(0x10),
            }]);
        assert_eq!(trap.function(), Some("inner"));
        assert_eq!(trap.source_offset(), Some(0x10));
        assert_eq!(
            trap.to_string(),
            "trap: unreachable executed in 'inner' at offset 0x10\n  at inner @ 0x10"
        );
    }
}
