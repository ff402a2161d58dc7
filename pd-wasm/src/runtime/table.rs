use crate::abi::ValueType;
use crate::error::{InstanceError, InstanceResult};

use super::{NULL_REFERENCE, Reference};

/// A table of references.
///
/// As with [`MemoryInstance`](super::MemoryInstance), `base`/`len` mirror
/// `references` for generated code.
#[derive(Debug)]
#[repr(C)]
pub struct TableInstance {
    pub(crate) base: *mut Reference,
    pub(crate) len: usize,
    references: Vec<Reference>,
    element_type: ValueType,
    maximum: Option<u32>,
}

unsafe impl Send for TableInstance {}

impl TableInstance {
    pub fn new(element_type: ValueType, minimum: u32, maximum: Option<u32>) -> Self {
        let mut table = Self {
            base: std::ptr::null_mut(),
            len: 0,
            references: vec![NULL_REFERENCE; minimum as usize],
            element_type,
            maximum,
        };
        table.sync();
        table
    }

    fn sync(&mut self) {
        self.base = self.references.as_mut_ptr();
        self.len = self.references.len();
    }

    pub fn element_type(&self) -> ValueType {
        self.element_type
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: u32) -> Option<Reference> {
        self.references.get(index as usize).copied()
    }

    pub fn set(&mut self, index: u32, reference: Reference) -> InstanceResult<()> {
        let len = self.references.len();
        let slot = self
            .references
            .get_mut(index as usize)
            .ok_or(InstanceError::TableIndexOutOfBounds { index, len })?;
        *slot = reference;
        Ok(())
    }

    /// Grows by `delta` entries filled with `init`, returning the previous length.
    pub fn grow(&mut self, delta: u32, init: Reference) -> Option<u32> {
        let previous = u32::try_from(self.references.len()).ok()?;
        let target = previous.checked_add(delta)?;
        if self.maximum.is_some_and(|maximum| target > maximum) {
            return None;
        }
        if delta > 0 {
            self.references.resize(target as usize, init);
            self.sync();
        }
        Some(previous)
    }

    pub fn references(&self) -> &[Reference] {
        &self.references
    }
}
