//! Architecture-specific stub compilation.
//!
//! Each supported architecture provides a [`StubCompiler`]: a capability
//! check deciding whether a signature can get a specialized trampoline, and
//! the code generator that emits one. Signatures the check rejects route
//! through the generic invocation path instead.
//!
//! # Stub ABI
//!
//! A compiled stub is entered through the managed dispatch convention:
//!
//! ```text
//! extern "C" fn(env: *mut c_void, recv: *mut c_void, args...) -> result
//! ```
//!
//! where `args` and `result` use the signature's carrier representations.
//! The two pointer-sized prefix slots belong to the embedding runtime; the
//! trampoline skips them while re-marshalling. A stub is always invoked
//! with arguments matching the carrier list it was compiled for; a
//! mismatch is a caller contract violation, not a checked error.

pub mod x86_32;
pub mod x86_64;

use std::sync::Arc;

#[cfg(any(target_arch = "x86", all(target_arch = "x86_64", target_family = "unix")))]
use once_cell::sync::Lazy;

use crate::code::Stub;
use crate::error::CompileError;
use crate::types::{CallingConvention, FunctionHandle, ParameterType, ResultType, Signature};

pub use x86_32::X86_32StubCompiler;
pub use x86_64::X86_64StubCompiler;

/// Supported stub target architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetArch {
    /// 32-bit x86, SysV.
    X86_32,
    /// 64-bit x86, SysV.
    X86_64,
}

impl TargetArch {
    /// Short architecture name for diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            TargetArch::X86_32 => "x86-32",
            TargetArch::X86_64 => "x86-64",
        }
    }
}

/// A per-architecture trampoline compiler.
pub trait StubCompiler: Send + Sync {
    /// The architecture this compiler targets.
    fn arch(&self) -> TargetArch;

    /// Whether a specialized trampoline can be generated for this
    /// signature. Pure; returning `false` is the designed fallback signal,
    /// never an error.
    fn can_compile(
        &self,
        result: &ResultType,
        params: &[ParameterType],
        convention: CallingConvention,
    ) -> bool;

    /// Emit a trampoline for `signature` calling `function`.
    ///
    /// Precondition: [`can_compile`](Self::can_compile) returned true for
    /// this exact signature; a violation yields
    /// [`CompileError::UnsupportedType`] and emits nothing. The published
    /// stub is appended to the process-wide [`crate::code::StubTable`].
    fn compile(
        &self,
        function: &FunctionHandle,
        name: &str,
        signature: &Signature,
    ) -> Result<Arc<Stub>, CompileError>;
}

#[cfg(target_arch = "x86")]
static HOST: Lazy<X86_32StubCompiler> = Lazy::new(X86_32StubCompiler::host);

#[cfg(all(target_arch = "x86_64", target_family = "unix"))]
static HOST: Lazy<X86_64StubCompiler> = Lazy::new(X86_64StubCompiler::host);

/// The stub compiler for the running process, if one exists.
///
/// The x86-64 compiler implements the SysV convention, so it is only
/// offered on unix-family hosts; everywhere else callers fall back to the
/// generic path.
pub fn host_compiler() -> Option<&'static dyn StubCompiler> {
    #[cfg(any(target_arch = "x86", all(target_arch = "x86_64", target_family = "unix")))]
    return Some(&*HOST);
    #[cfg(not(any(target_arch = "x86", all(target_arch = "x86_64", target_family = "unix"))))]
    return None;
}

/// Round `value` up to a multiple of `alignment` (a power of two).
pub(crate) fn align(value: i32, alignment: i32) -> i32 {
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align() {
        assert_eq!(align(0, 16), 0);
        assert_eq!(align(1, 16), 16);
        assert_eq!(align(16, 16), 16);
        assert_eq!(align(17, 16), 32);
        assert_eq!(align(24, 16), 32);
    }

    #[test]
    fn test_host_compiler_matches_target() {
        #[cfg(all(target_arch = "x86_64", target_family = "unix"))]
        assert_eq!(host_compiler().map(|c| c.arch()), Some(TargetArch::X86_64));

        #[cfg(target_arch = "x86")]
        assert_eq!(host_compiler().map(|c| c.arch()), Some(TargetArch::X86_32));
    }
}
