use std::env;
use std::fmt;

pub const MAX_CALL_DEPTH_ENV: &str = "PD_WASM_MAX_CALL_DEPTH";
pub const CAPTURE_BACKTRACE_ENV: &str = "PD_WASM_CAPTURE_BACKTRACE";
pub const MAX_STACK_BYTES_ENV: &str = "PD_WASM_MAX_STACK_BYTES";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// Nested calls beyond this depth trap with `CallStackExhausted`.
    pub max_call_depth: usize,
    /// Native stack one top-level call may use, measured from its entry.
    /// Calls that would start below this budget trap with
    /// `CallStackExhausted` instead of overflowing the thread's stack.
    pub max_stack_bytes: usize,
    pub capture_backtrace: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_call_depth: 1024,
            max_stack_bytes: 512 * 1024,
            capture_backtrace: true,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `PD_WASM_MAX_CALL_DEPTH`,
    /// `PD_WASM_MAX_STACK_BYTES` and `PD_WASM_CAPTURE_BACKTRACE` when set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            max_call_depth: parse_positive(MAX_CALL_DEPTH_ENV, defaults.max_call_depth)?,
            max_stack_bytes: parse_positive(MAX_STACK_BYTES_ENV, defaults.max_stack_bytes)?,
            capture_backtrace: parse_flag(CAPTURE_BACKTRACE_ENV, defaults.capture_backtrace)?,
        })
    }
}

fn parse_positive(key: &'static str, default: usize) -> Result<usize, ConfigError> {
    match env::var(key) {
        Ok(value) => match value.trim().parse::<usize>() {
            Ok(0) | Err(_) => Err(ConfigError::InvalidValue { key, value }),
            Ok(limit) => Ok(limit),
        },
        Err(_) => Ok(default),
    }
}

fn parse_flag(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env::var(key) {
        Ok(value) => parse_bool(&value).ok_or(ConfigError::InvalidValue { key, value }),
        Err(_) => Ok(default),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    InvalidValue { key: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidValue { key, value } => {
                write!(f, "invalid value '{value}' for {key}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
