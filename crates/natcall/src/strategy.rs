//! Object parameter strategies.
//!
//! A buffer-like argument crosses the native boundary one of two ways:
//! by its own stable native address (`Direct`), or as an (object, offset,
//! length) triple the invocation layer must pin or copy for the duration of
//! the call (`Heap`). Which applies is a pure function of the argument's
//! representation, decided once and reused for every call.

use std::fmt;

/// The two argument-passing policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyType {
    /// The argument already has a stable native address.
    Direct,
    /// The argument is a managed buffer; it must be pinned or copied.
    Heap,
}

/// A buffer-like call argument.
pub enum BufferArg<'a> {
    /// Memory that is already native-backed and stable for the call.
    Native {
        /// Address of the first byte.
        addr: u64,
        /// Extent in bytes.
        len: usize,
    },
    /// A managed byte buffer; `offset..offset + len` is the extent exposed
    /// to the native callee.
    Managed {
        /// The backing object.
        data: &'a mut [u8],
        /// Byte offset of the exposed extent.
        offset: usize,
        /// Length of the exposed extent.
        len: usize,
    },
}

impl<'a> BufferArg<'a> {
    /// Wrap a whole managed byte buffer.
    pub fn managed(data: &'a mut [u8]) -> Self {
        let len = data.len();
        BufferArg::Managed { data, offset: 0, len }
    }

    /// True if the argument is backed by stable native memory.
    pub fn is_native(&self) -> bool {
        matches!(self, BufferArg::Native { .. })
    }
}

impl fmt::Debug for BufferArg<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferArg::Native { addr, len } => f
                .debug_struct("Native")
                .field("addr", &format_args!("{addr:#x}"))
                .field("len", len)
                .finish(),
            BufferArg::Managed { offset, len, .. } => f
                .debug_struct("Managed")
                .field("offset", offset)
                .field("len", len)
                .finish(),
        }
    }
}

/// How a buffer-like argument is exposed to native code.
///
/// `Direct` strategies answer [`address`](Self::address) only; `Heap`
/// strategies answer the (object, offset, length) accessors. Consulting the
/// other group is a caller error and yields neutral values, never a panic.
pub trait ObjectParameterStrategy: Send + Sync {
    /// Which policy this strategy implements.
    fn strategy_type(&self) -> StrategyType;

    /// The argument's native address (`Direct` only).
    fn address(&self, arg: &BufferArg<'_>) -> u64;

    /// The backing object (`Heap` only).
    fn object<'a>(&self, arg: &'a BufferArg<'_>) -> &'a [u8];

    /// Byte offset of the exposed extent (`Heap` only).
    fn offset(&self, arg: &BufferArg<'_>) -> usize;

    /// Length of the exposed extent (`Heap` only).
    fn length(&self, arg: &BufferArg<'_>) -> usize;
}

/// Policy for arguments with a stable native address.
pub struct DirectStrategy;

impl ObjectParameterStrategy for DirectStrategy {
    fn strategy_type(&self) -> StrategyType {
        StrategyType::Direct
    }

    fn address(&self, arg: &BufferArg<'_>) -> u64 {
        match arg {
            BufferArg::Native { addr, .. } => *addr,
            BufferArg::Managed { .. } => {
                debug_assert!(false, "direct strategy applied to a managed buffer");
                0
            }
        }
    }

    fn object<'a>(&self, _arg: &'a BufferArg<'_>) -> &'a [u8] {
        debug_assert!(false, "direct strategy has no backing object");
        &[]
    }

    fn offset(&self, _arg: &BufferArg<'_>) -> usize {
        debug_assert!(false, "direct strategy has no offset");
        0
    }

    fn length(&self, _arg: &BufferArg<'_>) -> usize {
        debug_assert!(false, "direct strategy has no length");
        0
    }
}

/// Policy for managed buffers that must be pinned or copied for the call.
pub struct HeapStrategy;

impl ObjectParameterStrategy for HeapStrategy {
    fn strategy_type(&self) -> StrategyType {
        StrategyType::Heap
    }

    fn address(&self, _arg: &BufferArg<'_>) -> u64 {
        debug_assert!(false, "heap strategy has no stable address");
        0
    }

    fn object<'a>(&self, arg: &'a BufferArg<'_>) -> &'a [u8] {
        match arg {
            BufferArg::Managed { data, .. } => data,
            BufferArg::Native { .. } => {
                debug_assert!(false, "heap strategy applied to a native buffer");
                &[]
            }
        }
    }

    fn offset(&self, arg: &BufferArg<'_>) -> usize {
        match arg {
            BufferArg::Managed { offset, .. } => *offset,
            BufferArg::Native { .. } => 0,
        }
    }

    fn length(&self, arg: &BufferArg<'_>) -> usize {
        match arg {
            BufferArg::Managed { len, .. } => *len,
            BufferArg::Native { .. } => 0,
        }
    }
}

static DIRECT: DirectStrategy = DirectStrategy;
static HEAP: HeapStrategy = HeapStrategy;

/// Classify an argument. Native-backed memory is `Direct`; managed buffers
/// are `Heap`.
pub fn strategy_for(arg: &BufferArg<'_>) -> &'static dyn ObjectParameterStrategy {
    match arg {
        BufferArg::Native { .. } => &DIRECT,
        BufferArg::Managed { .. } => &HEAP,
    }
}
