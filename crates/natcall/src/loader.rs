//! Dynamic library loading and symbol resolution.
//!
//! Cross-platform support for resolving native function addresses out of
//! shared libraries (`.so`, `.dylib`, `.dll`). Resolution failures surface
//! before any stub compilation is attempted.

use std::ffi::CString;
use std::path::Path;

use crate::error::LinkError;

/// When symbols are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Binding {
    /// Resolve all symbols at load time (`RTLD_NOW`).
    #[default]
    Now,
    /// Resolve symbols on first use (`RTLD_LAZY`).
    Lazy,
}

/// Whether the library's symbols join the global lookup scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    /// Symbols are not available to subsequently loaded libraries
    /// (`RTLD_LOCAL`).
    #[default]
    Local,
    /// Symbols join the global scope (`RTLD_GLOBAL`).
    Global,
}

/// Symbol binding and visibility flags for [`Library::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadFlags {
    /// Lazy vs immediate symbol binding.
    pub binding: Binding,
    /// Local vs global symbol visibility.
    pub visibility: Visibility,
}

/// Cross-platform dynamic library handle.
///
/// Dropping the handle unloads the library where the platform supports it.
/// Any function address resolved from it (and any stub compiled against
/// such an address) is only valid while the handle, or another reference
/// to the same library, stays alive.
pub struct Library {
    handle: LibraryHandle,
    path: String,
}

impl Library {
    /// Load a dynamic library from the given path.
    ///
    /// # Platform-specific behavior
    ///
    /// - **Linux / macOS**: `dlopen` with the requested binding and
    ///   visibility flags
    /// - **Windows**: `LoadLibraryW`; the flags have no equivalent and are
    ///   ignored
    pub fn open<P: AsRef<Path>>(path: P, flags: LoadFlags) -> Result<Self, LinkError> {
        let path_ref = path.as_ref();
        let path_str = path_ref
            .to_str()
            .ok_or_else(|| LinkError::InvalidName(format!("{path_ref:?}")))?;

        let handle = LibraryHandle::load(path_str, flags)?;

        Ok(Library { handle, path: path_str.to_string() })
    }

    /// The program's own symbol scope (the executable plus everything
    /// already loaded into it, libc included).
    pub fn current() -> Result<Self, LinkError> {
        let handle = LibraryHandle::load_current()?;
        Ok(Library { handle, path: "<current process>".to_string() })
    }

    /// Resolve a symbol to a native function address.
    pub fn resolve(&self, symbol: &str) -> Result<u64, LinkError> {
        self.handle.symbol(symbol, &self.path)
    }

    /// The path this library was loaded from.
    pub fn path(&self) -> &str {
        &self.path
    }
}

// Platform-specific implementations

#[cfg(unix)]
type LibraryHandle = UnixLibrary;

#[cfg(windows)]
type LibraryHandle = WindowsLibrary;

// ============================================================================
// Unix Implementation (Linux, macOS, BSD)
// ============================================================================

#[cfg(unix)]
struct UnixLibrary {
    handle: *mut std::ffi::c_void,
    owned: bool,
}

#[cfg(unix)]
impl UnixLibrary {
    fn dl_flags(flags: LoadFlags) -> i32 {
        let binding = match flags.binding {
            Binding::Now => libc::RTLD_NOW,
            Binding::Lazy => libc::RTLD_LAZY,
        };
        let visibility = match flags.visibility {
            Visibility::Local => libc::RTLD_LOCAL,
            Visibility::Global => libc::RTLD_GLOBAL,
        };
        binding | visibility
    }

    fn load(path: &str, flags: LoadFlags) -> Result<Self, LinkError> {
        let c_path = CString::new(path)
            .map_err(|e| LinkError::InvalidName(format!("{path}: {e}")))?;

        let handle = unsafe { libc::dlopen(c_path.as_ptr(), Self::dl_flags(flags)) };

        if handle.is_null() {
            return Err(LinkError::LibraryNotFound {
                path: format!("{}: {}", path, last_dl_error()),
            });
        }

        Ok(UnixLibrary { handle, owned: true })
    }

    fn load_current() -> Result<Self, LinkError> {
        let handle = unsafe { libc::dlopen(std::ptr::null(), libc::RTLD_NOW) };
        if handle.is_null() {
            return Err(LinkError::Platform(last_dl_error()));
        }
        // the handle refers to the process image; never unload it
        Ok(UnixLibrary { handle, owned: false })
    }

    fn symbol(&self, name: &str, lib_path: &str) -> Result<u64, LinkError> {
        let c_name = CString::new(name)
            .map_err(|e| LinkError::InvalidName(format!("{name}: {e}")))?;

        unsafe {
            // clear any stale error so a null symbol is distinguishable
            libc::dlerror();

            let symbol = libc::dlsym(self.handle, c_name.as_ptr());

            let err = libc::dlerror();
            if !err.is_null() {
                return Err(LinkError::SymbolNotFound {
                    symbol: name.to_string(),
                    library: format!(
                        "{}: {}",
                        lib_path,
                        std::ffi::CStr::from_ptr(err).to_string_lossy()
                    ),
                });
            }
            if symbol.is_null() {
                return Err(LinkError::SymbolNotFound {
                    symbol: name.to_string(),
                    library: lib_path.to_string(),
                });
            }

            Ok(symbol as usize as u64)
        }
    }
}

#[cfg(unix)]
fn last_dl_error() -> String {
    unsafe {
        let err = libc::dlerror();
        if err.is_null() {
            "unknown error".to_string()
        } else {
            std::ffi::CStr::from_ptr(err).to_string_lossy().into_owned()
        }
    }
}

#[cfg(unix)]
impl Drop for UnixLibrary {
    fn drop(&mut self) {
        if self.owned {
            unsafe {
                libc::dlclose(self.handle);
            }
        }
    }
}

// Safety: dlopen handles are process-global and dlsym is thread-safe.
#[cfg(unix)]
unsafe impl Send for UnixLibrary {}
#[cfg(unix)]
unsafe impl Sync for UnixLibrary {}

// ============================================================================
// Windows Implementation
// ============================================================================

#[cfg(windows)]
struct WindowsLibrary {
    handle: *mut std::ffi::c_void,
    owned: bool,
}

#[cfg(windows)]
impl WindowsLibrary {
    fn load(path: &str, _flags: LoadFlags) -> Result<Self, LinkError> {
        use std::ffi::OsStr;
        use std::os::windows::ffi::OsStrExt;

        let wide: Vec<u16> = OsStr::new(path)
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();

        let handle = unsafe { LoadLibraryW(wide.as_ptr()) };

        if handle.is_null() {
            let error = unsafe { GetLastError() };
            return Err(LinkError::LibraryNotFound {
                path: format!("{path} (error code: {error})"),
            });
        }

        Ok(WindowsLibrary { handle, owned: true })
    }

    fn load_current() -> Result<Self, LinkError> {
        let handle = unsafe { GetModuleHandleW(std::ptr::null()) };
        if handle.is_null() {
            let error = unsafe { GetLastError() };
            return Err(LinkError::Platform(format!("error code: {error}")));
        }
        Ok(WindowsLibrary { handle, owned: false })
    }

    fn symbol(&self, name: &str, lib_path: &str) -> Result<u64, LinkError> {
        let c_name = CString::new(name)
            .map_err(|e| LinkError::InvalidName(format!("{name}: {e}")))?;

        let symbol = unsafe { GetProcAddress(self.handle, c_name.as_ptr()) };

        if symbol.is_null() {
            let error = unsafe { GetLastError() };
            return Err(LinkError::SymbolNotFound {
                symbol: name.to_string(),
                library: format!("{lib_path} (error code: {error})"),
            });
        }

        Ok(symbol as usize as u64)
    }
}

#[cfg(windows)]
impl Drop for WindowsLibrary {
    fn drop(&mut self) {
        if self.owned {
            unsafe {
                FreeLibrary(self.handle);
            }
        }
    }
}

#[cfg(windows)]
unsafe impl Send for WindowsLibrary {}
#[cfg(windows)]
unsafe impl Sync for WindowsLibrary {}

// Windows FFI declarations
#[cfg(windows)]
extern "system" {
    fn LoadLibraryW(filename: *const u16) -> *mut std::ffi::c_void;
    fn GetModuleHandleW(filename: *const u16) -> *mut std::ffi::c_void;
    fn GetProcAddress(
        module: *mut std::ffi::c_void,
        procname: *const i8,
    ) -> *mut std::ffi::c_void;
    fn FreeLibrary(module: *mut std::ffi::c_void) -> i32;
    fn GetLastError() -> u32;
}
