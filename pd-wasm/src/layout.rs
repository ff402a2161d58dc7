//! Byte offsets generated code is compiled against.
//!
//! Every constant here is checked against the real record layout at compile
//! time, so a field reorder fails the build instead of miscompiling.

use std::mem::{offset_of, size_of};

use crate::exec::CallFrame;
use crate::runtime::{GlobalInstance, MemoryInstance, TableInstance};

pub const GLOBAL_INSTANCE_VALUE_OFFSET: usize = 8;
pub const GLOBAL_INSTANCE_SIZE: usize = size_of::<GlobalInstance>();

pub const MEMORY_INSTANCE_BASE_OFFSET: usize = 0;
pub const MEMORY_INSTANCE_LEN_OFFSET: usize = 8;

pub const TABLE_INSTANCE_BASE_OFFSET: usize = 0;
pub const TABLE_INSTANCE_LEN_OFFSET: usize = 8;
pub const TABLE_INSTANCE_SIZE: usize = size_of::<TableInstance>();

/// Address of the last call-out or trap site, written before leaving the body.
pub const CALL_FRAME_EXIT_PC_OFFSET: usize = 0;
pub const CALL_FRAME_TRAP_CODE_OFFSET: usize = 8;
/// Pointer to the first element of the instance's contiguous global array.
pub const CALL_FRAME_GLOBALS_OFFSET: usize = 16;
pub const CALL_FRAME_MEMORY_OFFSET: usize = 24;
pub const CALL_FRAME_TABLES_OFFSET: usize = 32;

pub const SLOT_SIZE: usize = size_of::<u64>();

const _: () = assert!(offset_of!(GlobalInstance, value) == GLOBAL_INSTANCE_VALUE_OFFSET);
const _: () = assert!(offset_of!(MemoryInstance, base) == MEMORY_INSTANCE_BASE_OFFSET);
const _: () = assert!(offset_of!(MemoryInstance, len) == MEMORY_INSTANCE_LEN_OFFSET);
const _: () = assert!(offset_of!(TableInstance, base) == TABLE_INSTANCE_BASE_OFFSET);
const _: () = assert!(offset_of!(TableInstance, len) == TABLE_INSTANCE_LEN_OFFSET);
const _: () = assert!(offset_of!(CallFrame<'static>, exit_pc) == CALL_FRAME_EXIT_PC_OFFSET);
const _: () = assert!(offset_of!(CallFrame<'static>, trap_code) == CALL_FRAME_TRAP_CODE_OFFSET);
const _: () = assert!(offset_of!(CallFrame<'static>, globals) == CALL_FRAME_GLOBALS_OFFSET);
const _: () = assert!(offset_of!(CallFrame<'static>, memory) == CALL_FRAME_MEMORY_OFFSET);
const _: () = assert!(offset_of!(CallFrame<'static>, tables) == CALL_FRAME_TABLES_OFFSET);

/// Displacement of a global's value field from the start of the global array.
pub fn global_value_displacement(index: u32) -> Option<i32> {
    let offset = (index as usize)
        .checked_mul(GLOBAL_INSTANCE_SIZE)?
        .checked_add(GLOBAL_INSTANCE_VALUE_OFFSET)?;
    i32::try_from(offset).ok()
}

/// Displacement of a table record from the start of the table array.
pub fn table_displacement(index: u32) -> Option<i32> {
    let offset = (index as usize).checked_mul(TABLE_INSTANCE_SIZE)?;
    i32::try_from(offset).ok()
}
