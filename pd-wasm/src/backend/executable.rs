use std::io;

use crate::error::{CompileError, CompileResult};

/// A W^X region holding one function's code and data.
///
/// The region is writable only while [`ExecutableMemory::from_code`] copies
/// the bytes in; afterwards it is read + execute until dropped.
pub(crate) struct ExecutableMemory {
    ptr: *mut u8,
    len: usize,
}

// The mapping is immutable after construction.
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}

impl ExecutableMemory {
    pub(crate) fn from_code(code: &[u8]) -> CompileResult<Self> {
        if code.is_empty() {
            return Err(CompileError::Executable(
                "cannot map an empty code object".to_string(),
            ));
        }
        let ptr = sys::map_writable(code.len()).map_err(|err| mapping_failed("map", err))?;
        // Dropping `memory` unmaps the region if sealing fails.
        let memory = Self {
            ptr,
            len: code.len(),
        };
        // SAFETY: the region is freshly mapped, writable and `len` bytes long.
        unsafe { sys::copy_in(memory.ptr, code) };
        sys::seal(memory.ptr, memory.len).map_err(|err| mapping_failed("seal", err))?;
        Ok(memory)
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn contains(&self, address: usize) -> bool {
        let start = self.ptr as usize;
        address >= start && address < start + self.len
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        if let Err(err) = sys::unmap(self.ptr, self.len) {
            tracing::warn!(error = %err, len = self.len, "failed to release executable region");
        }
    }
}

fn mapping_failed(step: &str, err: io::Error) -> CompileError {
    CompileError::Executable(format!("executable region {step} failed: {err}"))
}

#[cfg(all(unix, not(target_os = "macos")))]
mod sys {
    use std::io;

    pub(super) fn map_writable(len: usize) -> io::Result<*mut u8> {
        // SAFETY: an anonymous private mapping aliases nothing.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(ptr.cast())
    }

    pub(super) unsafe fn copy_in(ptr: *mut u8, code: &[u8]) {
        unsafe { std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len()) };
    }

    pub(super) fn seal(ptr: *mut u8, len: usize) -> io::Result<()> {
        // SAFETY: `ptr..ptr + len` is a mapping this module created.
        let rc = unsafe { libc::mprotect(ptr.cast(), len, libc::PROT_READ | libc::PROT_EXEC) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(super) fn unmap(ptr: *mut u8, len: usize) -> io::Result<()> {
        // SAFETY: see `seal`.
        if unsafe { libc::munmap(ptr.cast(), len) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// macOS hands out RWX `MAP_JIT` pages and toggles per-thread write
/// protection around the copy instead of calling `mprotect`.
#[cfg(target_os = "macos")]
mod sys {
    use std::io;

    unsafe extern "C" {
        fn pthread_jit_write_protect_supported_np() -> libc::c_int;
        fn pthread_jit_write_protect_np(enabled: libc::c_int);
    }

    pub(super) fn map_writable(len: usize) -> io::Result<*mut u8> {
        // SAFETY: an anonymous private mapping aliases nothing.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_JIT,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(ptr.cast())
    }

    pub(super) unsafe fn copy_in(ptr: *mut u8, code: &[u8]) {
        unsafe {
            let toggle = pthread_jit_write_protect_supported_np() != 0;
            if toggle {
                pthread_jit_write_protect_np(0);
            }
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
            if toggle {
                pthread_jit_write_protect_np(1);
            }
        }
    }

    pub(super) fn seal(_ptr: *mut u8, _len: usize) -> io::Result<()> {
        Ok(())
    }

    pub(super) fn unmap(ptr: *mut u8, len: usize) -> io::Result<()> {
        // SAFETY: `ptr..ptr + len` is a mapping this module created.
        if unsafe { libc::munmap(ptr.cast(), len) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(windows)]
mod sys {
    use std::ffi::c_void;
    use std::io;

    use windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache;
    use windows_sys::Win32::System::Memory::{
        MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READ, PAGE_READWRITE, VirtualAlloc,
        VirtualFree, VirtualProtect,
    };
    use windows_sys::Win32::System::Threading::GetCurrentProcess;

    pub(super) fn map_writable(len: usize) -> io::Result<*mut u8> {
        // SAFETY: a fresh commit aliases nothing.
        let ptr = unsafe {
            VirtualAlloc(std::ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE)
        };
        if ptr.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(ptr.cast())
    }

    pub(super) unsafe fn copy_in(ptr: *mut u8, code: &[u8]) {
        unsafe { std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len()) };
    }

    pub(super) fn seal(ptr: *mut u8, len: usize) -> io::Result<()> {
        let mut previous = 0u32;
        // SAFETY: `ptr..ptr + len` is a region this module committed.
        let protected = unsafe {
            VirtualProtect(ptr as *const c_void, len, PAGE_EXECUTE_READ, &mut previous)
        };
        if protected == 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: as above; the pseudo handle needs no closing.
        let flushed =
            unsafe { FlushInstructionCache(GetCurrentProcess(), ptr as *const c_void, len) };
        if flushed == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(super) fn unmap(ptr: *mut u8, _len: usize) -> io::Result<()> {
        // SAFETY: see `seal`. MEM_RELEASE requires a zero size.
        if unsafe { VirtualFree(ptr.cast::<c_void>(), 0, MEM_RELEASE) } == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(not(any(unix, windows)))]
mod sys {
    use std::io;

    pub(super) fn map_writable(_len: usize) -> io::Result<*mut u8> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "no executable memory on this platform",
        ))
    }

    pub(super) unsafe fn copy_in(_ptr: *mut u8, _code: &[u8]) {}

    pub(super) fn seal(_ptr: *mut u8, _len: usize) -> io::Result<()> {
        Ok(())
    }

    pub(super) fn unmap(_ptr: *mut u8, _len: usize) -> io::Result<()> {
        Ok(())
    }
}
