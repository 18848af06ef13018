//! errno capture.
//!
//! errno is only valid in the instant after a native call returns, before
//! any other libc-touching instruction executes. Stubs compiled with
//! `save_errno` embed a call to [`save_errno`] immediately after the native
//! call; the generic dispatcher calls it right after `ffi_call` returns.
//! The captured value is readable per-thread via [`last_errno`].

use std::cell::Cell;

thread_local! {
    static SAVED_ERRNO: Cell<i32> = const { Cell::new(0) };
}

/// Read the OS errno immediately and cache it in the current thread's slot.
///
/// This is the function whose address the stub compilers embed; it must not
/// unwind.
pub extern "C" fn save_errno() {
    SAVED_ERRNO.with(|slot| slot.set(os_errno()));
}

/// Address of [`save_errno`], for embedding in generated code.
pub fn save_errno_address() -> u64 {
    save_errno as usize as u64
}

/// The most recently captured errno for the current thread.
pub fn last_errno() -> i32 {
    SAVED_ERRNO.with(|slot| slot.get())
}

/// Reset the current thread's captured errno to zero.
pub fn clear() {
    SAVED_ERRNO.with(|slot| slot.set(0));
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn os_errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
fn os_errno() -> i32 {
    unsafe { *libc::__error() }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd"
)))]
fn os_errno() -> i32 {
    0
}
