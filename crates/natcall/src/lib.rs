//! natcall — minimal-overhead native (C-ABI) calls for managed runtimes.
//!
//! This crate provides the two halves of a native invocation engine:
//! - **Stub compiler**: per-signature capability check and runtime machine
//!   code generation for specialized call trampolines (`arch` module)
//! - **Generic path**: argument buffer construction and libffi dispatch for
//!   every signature the compiler declines (`generic` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use natcall::{Callable, Library, LoadFlags, NativeType, ResultType, Signature};
//! use natcall::types::CallingConvention;
//!
//! let libc = Library::current()?;
//! let sig = Signature::new(
//!     ResultType::new(NativeType::SInt),
//!     vec![],
//!     CallingConvention::Default,
//! );
//! let getpid = Callable::bind_symbol(&libc, "getpid", &sig, false)?;
//!
//! // dynamic route, works for every signature
//! let pid = getpid.invoke(vec![])?.as_i32();
//!
//! // fast path for embedders, when a trampoline was compiled
//! if let Some(entry) = getpid.code_ptr() {
//!     /* cast to the stub ABI and install it */
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// ============================================================================
// Core Modules
// ============================================================================

/// Architecture-specific capability checks and stub compilers
pub mod arch;

/// Binding signatures to callables (stub or generic)
pub mod callable;

/// Executable code buffers and the stub table
pub mod code;

/// errno capture for generated and generic calls
pub mod errno;

/// Error taxonomy
pub mod error;

/// Generic invocation path (call contexts, buffers, dispatch)
pub mod generic;

/// Dynamic library loading and symbol resolution
pub mod loader;

/// Runtime support utilities
pub mod runtime;

/// Object parameter strategies
pub mod strategy;

/// Native type and signature model
pub mod types;

// ============================================================================
// Re-exports
// ============================================================================

pub use arch::{host_compiler, StubCompiler, TargetArch};
pub use callable::{Callable, Value};
pub use code::{ExecutableBuffer, Stub, StubTable};
pub use error::{CompileError, Error, InvokeError, LinkError, PublishError};
pub use generic::{invoke, invoke_into, CallContext, InvocationBuffer};
pub use loader::{Binding, Library, LoadFlags, Visibility};
pub use strategy::{BufferArg, ObjectParameterStrategy, StrategyType};
pub use types::{
    Carrier, CallingConvention, FunctionHandle, NativeType, ParameterType, RawValue, ResultType,
    Signature,
};
