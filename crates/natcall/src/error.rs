//! Error taxonomy.
//!
//! Capability rejection is not an error (`can_compile` returning false is
//! the designed fallback signal); everything here covers genuine failures:
//! contract violations reaching `compile`, symbol resolution, executable
//! memory publication, and generic-path invocation.

use crate::types::{Carrier, NativeType};

/// Errors constructing parameter or result types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TypeError {
    /// The carrier cannot represent the native kind.
    #[error("carrier {carrier:?} is incompatible with native type {native:?}")]
    IncompatibleCarrier {
        /// The native kind being described.
        native: NativeType,
        /// The rejected carrier.
        carrier: Carrier,
    },
}

/// Errors from stub compilation.
///
/// Reaching `compile` with a signature the capability check rejects is a
/// programming-contract violation; it surfaces as `UnsupportedType` and
/// never emits partial code.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    /// The signature uses a type or convention the target cannot compile.
    #[error("unsupported type for {arch} stub compilation: {reason}")]
    UnsupportedType {
        /// Target architecture name.
        arch: &'static str,
        /// What was rejected.
        reason: String,
    },

    /// A code address does not fit the target's immediate width.
    #[error("address {address:#x} out of range for {arch}")]
    AddressOutOfRange {
        /// Target architecture name.
        arch: &'static str,
        /// The offending address.
        address: u64,
    },

    /// Publishing the emitted code as executable memory failed.
    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Errors publishing an executable code buffer.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// Refusing to map an empty code buffer.
    #[error("cannot publish an empty code buffer")]
    EmptyCode,

    /// Anonymous mapping failed.
    #[error("mmap failed: {0}")]
    Map(String),

    /// Remapping the buffer read-execute failed.
    #[error("mprotect failed: {0}")]
    Protect(String),

    /// No executable-memory implementation for this platform.
    #[error("executable memory is not supported on this platform")]
    Unsupported,
}

/// Errors loading libraries or resolving symbols.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// Library file not found or could not be loaded.
    #[error("library not found: {path}")]
    LibraryNotFound {
        /// Path that was attempted, with the loader's diagnostic appended.
        path: String,
    },

    /// Symbol not found in the library.
    #[error("symbol not found: {symbol} in {library}")]
    SymbolNotFound {
        /// Symbol name that was not found.
        symbol: String,
        /// Library the lookup ran against.
        library: String,
    },

    /// Invalid path or symbol encoding.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// Platform-specific error.
    #[error("platform error: {0}")]
    Platform(String),
}

/// Errors from the generic invocation path.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    /// The buffer holds a different number of arguments than the context
    /// declares.
    #[error("arity mismatch: context declares {expected} parameters, buffer holds {got}")]
    ArityMismatch {
        /// Parameters declared by the call context.
        expected: usize,
        /// Arguments appended to the buffer.
        got: usize,
    },

    /// `Void` is not a valid parameter kind.
    #[error("void is not a parameter type")]
    VoidParameter,

    /// The signature returns an aggregate; use `invoke_into`.
    #[error("aggregate result of {size} bytes requires invoke_into")]
    AggregateResult {
        /// Declared aggregate size.
        size: usize,
    },

    /// The output buffer does not match the declared aggregate size.
    #[error("aggregate result is {expected} bytes, output buffer holds {got}")]
    AggregateSizeMismatch {
        /// Declared aggregate size.
        expected: usize,
        /// Output buffer length.
        got: usize,
    },
}

/// A failure raised by a converter-layer hook.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct HookError(pub String);

/// Top-level error for the bind-a-callable front door.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Library or symbol resolution failed.
    #[error(transparent)]
    Link(#[from] LinkError),

    /// Stub compilation failed.
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// Generic-path invocation failed.
    #[error(transparent)]
    Invoke(#[from] InvokeError),
}
