//! Executable code buffers and the process-wide stub table.
//!
//! Publication is W^X: a stub's bytes are written into a fresh anonymous
//! read-write mapping, remapped read-execute, and only then wrapped in a
//! [`Stub`] and appended to the table. Readers can never observe a
//! partially-written code buffer, because the buffer is not reachable until
//! publication completes.

use std::ptr::NonNull;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::error::PublishError;
use crate::types::Signature;

// ============================================================================
// Executable buffers
// ============================================================================

/// An immutable block of executable machine code.
pub struct ExecutableBuffer {
    ptr: NonNull<u8>,
    len: usize,
    map_len: usize,
}

// Safety: the mapping is remapped read-execute before the buffer is
// constructed and is never written again.
unsafe impl Send for ExecutableBuffer {}
unsafe impl Sync for ExecutableBuffer {}

impl ExecutableBuffer {
    /// Copy `code` into a fresh anonymous mapping and remap it
    /// read-execute.
    pub fn publish(code: &[u8]) -> Result<Self, PublishError> {
        if code.is_empty() {
            return Err(PublishError::EmptyCode);
        }
        let map_len = page_align(code.len());
        let ptr = map_writable(map_len)?;
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr.as_ptr(), code.len());
        }
        if let Err(e) = protect_executable(ptr, map_len) {
            unmap(ptr, map_len);
            return Err(e);
        }
        Ok(ExecutableBuffer { ptr, len: code.len(), map_len })
    }

    /// Entry address of the code.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Length of the code image in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the buffer holds no code (never the case once published).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for ExecutableBuffer {
    fn drop(&mut self) {
        unmap(self.ptr, self.map_len);
    }
}

fn page_align(len: usize) -> usize {
    const PAGE: usize = 4096;
    (len + PAGE - 1) & !(PAGE - 1)
}

#[cfg(unix)]
fn map_writable(len: usize) -> Result<NonNull<u8>, PublishError> {
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
        return Err(PublishError::Map(
            std::io::Error::last_os_error().to_string(),
        ));
    }
    NonNull::new(ptr as *mut u8)
        .ok_or_else(|| PublishError::Map("mmap returned null".to_string()))
}

#[cfg(unix)]
fn protect_executable(ptr: NonNull<u8>, len: usize) -> Result<(), PublishError> {
    let rc = unsafe {
        libc::mprotect(
            ptr.as_ptr() as *mut libc::c_void,
            len,
            libc::PROT_READ | libc::PROT_EXEC,
        )
    };
    if rc != 0 {
        return Err(PublishError::Protect(
            std::io::Error::last_os_error().to_string(),
        ));
    }
    Ok(())
}

#[cfg(unix)]
fn unmap(ptr: NonNull<u8>, len: usize) {
    unsafe {
        libc::munmap(ptr.as_ptr() as *mut libc::c_void, len);
    }
}

#[cfg(windows)]
fn map_writable(len: usize) -> Result<NonNull<u8>, PublishError> {
    const MEM_COMMIT: u32 = 0x1000;
    const MEM_RESERVE: u32 = 0x2000;
    const PAGE_READWRITE: u32 = 0x04;

    let ptr = unsafe {
        VirtualAlloc(
            std::ptr::null_mut(),
            len,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_READWRITE,
        )
    };
    NonNull::new(ptr as *mut u8).ok_or_else(|| {
        PublishError::Map(std::io::Error::last_os_error().to_string())
    })
}

#[cfg(windows)]
fn protect_executable(ptr: NonNull<u8>, len: usize) -> Result<(), PublishError> {
    const PAGE_EXECUTE_READ: u32 = 0x20;

    let mut old: u32 = 0;
    let ok = unsafe {
        VirtualProtect(ptr.as_ptr() as *mut std::ffi::c_void, len, PAGE_EXECUTE_READ, &mut old)
    };
    if ok == 0 {
        return Err(PublishError::Protect(
            std::io::Error::last_os_error().to_string(),
        ));
    }
    Ok(())
}

#[cfg(windows)]
fn unmap(ptr: NonNull<u8>, _len: usize) {
    const MEM_RELEASE: u32 = 0x8000;
    unsafe {
        VirtualFree(ptr.as_ptr() as *mut std::ffi::c_void, 0, MEM_RELEASE);
    }
}

#[cfg(windows)]
extern "system" {
    fn VirtualAlloc(
        addr: *mut std::ffi::c_void,
        size: usize,
        alloc_type: u32,
        protect: u32,
    ) -> *mut std::ffi::c_void;
    fn VirtualProtect(
        addr: *mut std::ffi::c_void,
        size: usize,
        protect: u32,
        old_protect: *mut u32,
    ) -> i32;
    fn VirtualFree(addr: *mut std::ffi::c_void, size: usize, free_type: u32) -> i32;
}

#[cfg(not(any(unix, windows)))]
fn map_writable(_len: usize) -> Result<NonNull<u8>, PublishError> {
    Err(PublishError::Unsupported)
}

#[cfg(not(any(unix, windows)))]
fn protect_executable(_ptr: NonNull<u8>, _len: usize) -> Result<(), PublishError> {
    Err(PublishError::Unsupported)
}

#[cfg(not(any(unix, windows)))]
fn unmap(_ptr: NonNull<u8>, _len: usize) {}

// ============================================================================
// Stubs
// ============================================================================

/// A compiled trampoline: executable code bound to a symbolic name and the
/// signature it implements.
///
/// Once installed a stub stays resident and immutable for the life of the
/// process; re-entrant invocation racing a deallocation would be a
/// use-after-free of executable memory.
pub struct Stub {
    name: String,
    signature: Signature,
    code: Vec<u8>,
    exec: ExecutableBuffer,
}

impl Stub {
    /// Publish `code` and wrap it with its identity.
    pub fn new(
        name: impl Into<String>,
        signature: Signature,
        code: Vec<u8>,
    ) -> Result<Self, PublishError> {
        let exec = ExecutableBuffer::publish(&code)?;
        Ok(Stub { name: name.into(), signature, code, exec })
    }

    /// Symbolic name the stub was compiled for.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The signature the stub implements.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// The emitted code image (the bytes that were published).
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Executable entry point.
    pub fn entry(&self) -> *const u8 {
        self.exec.as_ptr()
    }
}

// ============================================================================
// Stub table
// ============================================================================

/// The process-wide, append-only table of compiled stubs.
///
/// Entries are `Arc`s and are never removed, so published code stays
/// resident while any call might still be in flight.
pub struct StubTable {
    stubs: Mutex<Vec<Arc<Stub>>>,
}

static GLOBAL_TABLE: Lazy<StubTable> = Lazy::new(|| StubTable { stubs: Mutex::new(Vec::new()) });

impl StubTable {
    /// The process-wide table.
    pub fn global() -> &'static StubTable {
        &GLOBAL_TABLE
    }

    /// Append a fully-published stub.
    pub fn append(&self, stub: Arc<Stub>) {
        tracing::debug!(name = stub.name(), bytes = stub.code().len(), "stub published");
        self.stubs.lock().push(stub);
    }

    /// Number of stubs ever published.
    pub fn len(&self) -> usize {
        self.stubs.lock().len()
    }

    /// True if no stub has been published yet.
    pub fn is_empty(&self) -> bool {
        self.stubs.lock().is_empty()
    }

    /// Snapshot of the current entries.
    pub fn snapshot(&self) -> Vec<Arc<Stub>> {
        self.stubs.lock().clone()
    }
}
