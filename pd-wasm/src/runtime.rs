//! Runtime instance records addressed directly by generated code.
//!
//! Field offsets of these records are part of the contract with compiled
//! code; see [`crate::layout`].

mod global;
mod instance;
mod memory;
mod table;

pub use global::{GlobalInstance, GlobalType};
pub use instance::Instance;
pub use memory::{MAX_PAGES, MemoryInstance, PAGE_SIZE};
pub use table::TableInstance;

/// Opaque reference value stored in tables; zero is the null reference.
pub type Reference = u64;

pub const NULL_REFERENCE: Reference = 0;
