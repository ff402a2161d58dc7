use std::collections::TryReserveError;

pub const PAGE_SIZE: usize = 65536;
/// 4 GiB of 64 KiB pages, the 32-bit address space limit.
pub const MAX_PAGES: u32 = 65536;

/// Linear memory.
///
/// `base` and `len` mirror `buffer` and are what generated code reads (at
/// [`MEMORY_INSTANCE_BASE_OFFSET`](crate::layout::MEMORY_INSTANCE_BASE_OFFSET)
/// and [`MEMORY_INSTANCE_LEN_OFFSET`](crate::layout::MEMORY_INSTANCE_LEN_OFFSET));
/// every resize must refresh them.
#[derive(Debug)]
#[repr(C)]
pub struct MemoryInstance {
    pub(crate) base: *mut u8,
    pub(crate) len: usize,
    buffer: Vec<u8>,
    maximum_pages: u32,
}

// `base` always points into `buffer`, which this record owns.
unsafe impl Send for MemoryInstance {}

impl MemoryInstance {
    pub fn new(minimum_pages: u32, maximum_pages: Option<u32>) -> Self {
        let maximum_pages = maximum_pages.unwrap_or(MAX_PAGES).min(MAX_PAGES);
        let mut memory = Self {
            base: std::ptr::null_mut(),
            len: 0,
            buffer: vec![0; minimum_pages.min(maximum_pages) as usize * PAGE_SIZE],
            maximum_pages,
        };
        memory.sync();
        memory
    }

    /// A zero-page memory that cannot grow; every access traps.
    pub fn empty() -> Self {
        Self::new(0, Some(0))
    }

    fn sync(&mut self) {
        self.base = self.buffer.as_mut_ptr();
        self.len = self.buffer.len();
    }

    pub fn size_in_pages(&self) -> u32 {
        (self.len / PAGE_SIZE) as u32
    }

    pub fn maximum_pages(&self) -> u32 {
        self.maximum_pages
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Grows by `delta` pages, returning the previous size in pages.
    /// Fails without changing the memory when the limit is hit or the
    /// allocation cannot be satisfied.
    pub fn grow(&mut self, delta: u32) -> Option<u32> {
        self.grow_reserving(delta, Vec::try_reserve_exact)
    }

    fn grow_reserving(
        &mut self,
        delta: u32,
        reserve: impl FnOnce(&mut Vec<u8>, usize) -> Result<(), TryReserveError>,
    ) -> Option<u32> {
        let previous = self.size_in_pages();
        let target = previous.checked_add(delta)?;
        if target > self.maximum_pages {
            return None;
        }
        if delta > 0 {
            let additional = delta as usize * PAGE_SIZE;
            if let Err(error) = reserve(&mut self.buffer, additional) {
                tracing::debug!(delta, %error, "memory.grow allocation failed");
                return None;
            }
            self.buffer.resize(target as usize * PAGE_SIZE, 0);
            self.sync();
        }
        Some(previous)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    pub fn read(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let end = offset.checked_add(len)?;
        self.buffer.get(offset..end)
    }

    pub fn write(&mut self, offset: usize, data: &[u8]) -> bool {
        let Some(end) = offset.checked_add(data.len()) else {
            return false;
        };
        match self.buffer.get_mut(offset..end) {
            Some(target) => {
                target.copy_from_slice(data);
                true
            }
            None => false,
        }
    }

    pub fn read_u32(&self, offset: usize) -> Option<u32> {
        let bytes = self.read(offset, 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) -> bool {
        self.write(offset, &value.to_le_bytes())
    }
}
