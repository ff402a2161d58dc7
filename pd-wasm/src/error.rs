use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// The backend has no lowering for a construct the IR allows.
    Unsupported {
        function: String,
        source_offset: u64,
        construct: &'static str,
    },
    /// The body violates a structural rule the validator should have enforced.
    Malformed {
        function: String,
        source_offset: u64,
        reason: String,
    },
    FrameTooLarge {
        function: String,
        slots: usize,
    },
    Executable(String),
}

impl CompileError {
    pub fn function(&self) -> Option<&str> {
        match self {
            CompileError::Unsupported { function, .. }
            | CompileError::Malformed { function, .. }
            | CompileError::FrameTooLarge { function, .. } => Some(function),
            CompileError::Executable(_) => None,
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::Unsupported {
                function,
                source_offset,
                construct,
            } => write!(
                f,
                "function '{function}' at offset {source_offset:#x}: {construct} is not supported by this backend"
            ),
            CompileError::Malformed {
                function,
                source_offset,
                reason,
            } => write!(
                f,
                "function '{function}' at offset {source_offset:#x}: malformed body: {reason}"
            ),
            CompileError::FrameTooLarge { function, slots } => write!(
                f,
                "function '{function}' needs {slots} frame slots, exceeding the 32-bit displacement range"
            ),
            CompileError::Executable(message) => {
                write!(f, "failed to map executable code: {message}")
            }
        }
    }
}

impl std::error::Error for CompileError {}

pub type CompileResult<T> = Result<T, CompileError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    UnsupportedArchitecture(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::UnsupportedArchitecture(arch) => {
                write!(f, "no machine backend is registered for architecture '{arch}'")
            }
        }
    }
}

impl std::error::Error for EngineError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceError {
    MissingGlobal { index: u32, provided: usize },
    MissingTable { index: u32, provided: usize },
    ImmutableGlobal,
    TableIndexOutOfBounds { index: u32, len: usize },
}

impl fmt::Display for InstanceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceError::MissingGlobal { index, provided } => write!(
                f,
                "compiled code addresses global {index} but only {provided} globals were provided"
            ),
            InstanceError::MissingTable { index, provided } => write!(
                f,
                "compiled code addresses table {index} but only {provided} tables were provided"
            ),
            InstanceError::ImmutableGlobal => write!(f, "cannot set an immutable global"),
            InstanceError::TableIndexOutOfBounds { index, len } => {
                write!(f, "table index {index} out of bounds for length {len}")
            }
        }
    }
}

impl std::error::Error for InstanceError {}

pub type InstanceResult<T> = Result<T, InstanceError>;
