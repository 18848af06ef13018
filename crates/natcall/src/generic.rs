//! Generic invocation path.
//!
//! The correctness fallback for every signature the capability check
//! rejects: arguments are appended to an [`InvocationBuffer`] in declared
//! order and dispatched through the libffi call primitive. Slower than a
//! compiled stub, always applicable: aggregates, foreign conventions, and
//! over-budget register mixes included.

use std::os::raw::{c_long, c_void};

use libffi::middle::{Cif, CodePtr, Type};
use libffi::raw;

use crate::error::InvokeError;
use crate::strategy::{strategy_for, BufferArg, StrategyType};
use crate::types::{FunctionHandle, NativeType, RawValue, Signature, TypeKind};

// ============================================================================
// Call contexts
// ============================================================================

/// A prepared call descriptor for one signature: the libffi CIF plus the
/// signature it was built from. Built once, reused for every call.
pub struct CallContext {
    cif: Cif,
    signature: Signature,
}

// Safety: the CIF is immutable after construction and ffi_call only reads
// it, so sharing across threads is sound.
unsafe impl Send for CallContext {}
unsafe impl Sync for CallContext {}

impl CallContext {
    /// Prepare a context for `signature`.
    pub fn new(signature: &Signature) -> Result<Self, InvokeError> {
        let mut args = Vec::with_capacity(signature.param_count());
        for p in signature.parameters() {
            args.push(parameter_ffi_type(p.kind())?);
        }
        let result = result_ffi_type(signature.result().kind())?;
        let cif = Cif::new(args, result);
        Ok(CallContext { cif, signature: signature.clone() })
    }

    /// The signature this context describes.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Number of declared parameters.
    pub fn param_count(&self) -> usize {
        self.signature.param_count()
    }
}

fn parameter_ffi_type(kind: &TypeKind) -> Result<Type, InvokeError> {
    match kind {
        TypeKind::Primitive(NativeType::Void) => Err(InvokeError::VoidParameter),
        other => result_ffi_type(other),
    }
}

fn result_ffi_type(kind: &TypeKind) -> Result<Type, InvokeError> {
    match kind {
        TypeKind::Primitive(t) => Ok(primitive_ffi_type(*t)),
        TypeKind::Aggregate(layout) => {
            let mut fields = Vec::with_capacity(layout.fields.len());
            for &f in &layout.fields {
                if f == NativeType::Void {
                    return Err(InvokeError::VoidParameter);
                }
                fields.push(primitive_ffi_type(f));
            }
            Ok(Type::structure(fields))
        }
    }
}

fn primitive_ffi_type(t: NativeType) -> Type {
    match t {
        NativeType::Void => Type::void(),
        NativeType::SChar => Type::i8(),
        NativeType::UChar => Type::u8(),
        NativeType::SShort => Type::i16(),
        NativeType::UShort => Type::u16(),
        NativeType::SInt => Type::i32(),
        NativeType::UInt => Type::u32(),
        // C long is 4 bytes on LLP64 targets, pointer-width elsewhere
        NativeType::SLong => {
            if long_is_32() {
                Type::i32()
            } else {
                Type::i64()
            }
        }
        NativeType::ULong => {
            if long_is_32() {
                Type::u32()
            } else {
                Type::u64()
            }
        }
        NativeType::SLongLong => Type::i64(),
        NativeType::ULongLong => Type::u64(),
        NativeType::Float => Type::f32(),
        NativeType::Double => Type::f64(),
        NativeType::Pointer => Type::pointer(),
    }
}

fn long_is_32() -> bool {
    std::mem::size_of::<c_long>() == 4
}

// ============================================================================
// Invocation buffers
// ============================================================================

/// One argument slot: wide enough for any primitive.
type Slot = [u8; 8];

struct HeapCopy<'a> {
    data: &'a mut [u8],
    offset: usize,
    len: usize,
    copy: Box<[u8]>,
}

/// An argument buffer for one generic call.
///
/// Arguments are appended in declared-parameter order. Object arguments
/// are classified through their
/// [`ObjectParameterStrategy`](crate::strategy::ObjectParameterStrategy):
/// a `Direct` argument contributes its raw address, a `Heap` argument is
/// copied in for the duration of the call and written back afterwards.
pub struct InvocationBuffer<'a> {
    // slot storage is fixed-size so argument pointers stay stable
    slots: Box<[Slot]>,
    count: usize,
    overflow: usize,
    ptrs: Vec<*mut c_void>,
    aggregates: Vec<Box<[u8]>>,
    heap: Vec<HeapCopy<'a>>,
}

impl<'a> InvocationBuffer<'a> {
    /// An empty buffer sized from a call context.
    pub fn from_context(context: &CallContext) -> Self {
        Self::with_object_count(context, 0)
    }

    /// An empty buffer pre-sized for a known count of heap-backed object
    /// arguments.
    pub fn with_object_count(context: &CallContext, objects: usize) -> Self {
        let declared = context.param_count();
        InvocationBuffer {
            slots: vec![[0u8; 8]; declared].into_boxed_slice(),
            count: 0,
            overflow: 0,
            ptrs: Vec::with_capacity(declared),
            aggregates: Vec::new(),
            heap: Vec::with_capacity(objects),
        }
    }

    /// Number of arguments appended so far.
    pub fn len(&self) -> usize {
        self.count + self.overflow
    }

    /// True if no argument has been appended.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push_slot(&mut self, bytes: &[u8]) {
        if self.count == self.slots.len() {
            // over-appended; counted so invoke reports the arity mismatch
            self.overflow += 1;
            return;
        }
        self.slots[self.count][..bytes.len()].copy_from_slice(bytes);
        self.ptrs.push(self.slots[self.count].as_mut_ptr() as *mut c_void);
        self.count += 1;
    }

    /// Append a signed 8-bit argument.
    pub fn push_i8(&mut self, v: i8) {
        self.push_slot(&v.to_ne_bytes());
    }

    /// Append an unsigned 8-bit argument.
    pub fn push_u8(&mut self, v: u8) {
        self.push_slot(&v.to_ne_bytes());
    }

    /// Append a signed 16-bit argument.
    pub fn push_i16(&mut self, v: i16) {
        self.push_slot(&v.to_ne_bytes());
    }

    /// Append an unsigned 16-bit argument.
    pub fn push_u16(&mut self, v: u16) {
        self.push_slot(&v.to_ne_bytes());
    }

    /// Append a signed 32-bit argument.
    pub fn push_i32(&mut self, v: i32) {
        self.push_slot(&v.to_ne_bytes());
    }

    /// Append an unsigned 32-bit argument.
    pub fn push_u32(&mut self, v: u32) {
        self.push_slot(&v.to_ne_bytes());
    }

    /// Append a signed 64-bit argument.
    pub fn push_i64(&mut self, v: i64) {
        self.push_slot(&v.to_ne_bytes());
    }

    /// Append an unsigned 64-bit argument.
    pub fn push_u64(&mut self, v: u64) {
        self.push_slot(&v.to_ne_bytes());
    }

    /// Append a 32-bit float argument.
    pub fn push_f32(&mut self, v: f32) {
        self.push_slot(&v.to_ne_bytes());
    }

    /// Append a 64-bit float argument.
    pub fn push_f64(&mut self, v: f64) {
        self.push_slot(&v.to_ne_bytes());
    }

    /// Append a raw pointer argument.
    pub fn push_pointer(&mut self, addr: u64) {
        self.push_slot(&(addr as usize).to_ne_bytes());
    }

    /// Append an aggregate argument by value (copied).
    pub fn push_aggregate(&mut self, bytes: &[u8]) {
        let copy: Box<[u8]> = Box::from(bytes);
        if self.count == self.slots.len() {
            self.overflow += 1;
            return;
        }
        self.ptrs.push(copy.as_ptr() as *mut c_void);
        self.count += 1;
        self.aggregates.push(copy);
    }

    /// Append a buffer-like argument according to its strategy.
    pub fn push_buffer(&mut self, arg: BufferArg<'a>) {
        let strategy = strategy_for(&arg);
        match strategy.strategy_type() {
            StrategyType::Direct => {
                let addr = strategy.address(&arg);
                self.push_pointer(addr);
            }
            StrategyType::Heap => {
                let (offset, len) = (strategy.offset(&arg), strategy.length(&arg));
                match arg {
                    BufferArg::Managed { data, .. } => {
                        let end = (offset + len).min(data.len());
                        let copy: Box<[u8]> = Box::from(&data[offset..end]);
                        self.push_pointer(copy.as_ptr() as u64);
                        self.heap.push(HeapCopy { data, offset, len: end - offset, copy });
                    }
                    BufferArg::Native { addr, .. } => self.push_pointer(addr),
                }
            }
        }
    }

    fn avalue(&mut self) -> *mut *mut c_void {
        self.ptrs.as_mut_ptr()
    }

    fn write_back(&mut self) {
        for h in &mut self.heap {
            h.data[h.offset..h.offset + h.len].copy_from_slice(&h.copy);
        }
    }
}

// ============================================================================
// Dispatch
// ============================================================================

#[repr(C, align(16))]
struct RetBuffer([u8; 16]);

/// Call `function` through the libffi primitive with the arguments in
/// `buffer`, returning the raw primitive result.
///
/// Aggregate results need [`invoke_into`]. When the handle requests errno
/// preservation it is captured immediately after the call returns.
pub fn invoke(
    context: &CallContext,
    function: &FunctionHandle,
    buffer: &mut InvocationBuffer<'_>,
) -> Result<RawValue, InvokeError> {
    let result = match context.signature().result().kind() {
        TypeKind::Primitive(t) => *t,
        TypeKind::Aggregate(layout) => {
            return Err(InvokeError::AggregateResult { size: layout.size })
        }
    };
    check_arity(context, buffer)?;

    let mut ret = RetBuffer([0u8; 16]);
    unsafe {
        raw::ffi_call(
            context.cif.as_raw_ptr(),
            Some(*CodePtr(function.address() as usize as *mut c_void).as_safe_fun()),
            ret.0.as_mut_ptr() as *mut c_void,
            buffer.avalue(),
        );
    }
    if function.save_errno() {
        crate::errno::save_errno();
    }
    buffer.write_back();

    Ok(decode_result(result, &ret.0))
}

/// Call `function`, writing an aggregate result into `out`.
pub fn invoke_into(
    context: &CallContext,
    function: &FunctionHandle,
    buffer: &mut InvocationBuffer<'_>,
    out: &mut [u8],
) -> Result<(), InvokeError> {
    let size = match context.signature().result().kind() {
        TypeKind::Aggregate(layout) => layout.size,
        TypeKind::Primitive(_) => {
            return Err(InvokeError::AggregateSizeMismatch { expected: 0, got: out.len() })
        }
    };
    if out.len() != size {
        return Err(InvokeError::AggregateSizeMismatch { expected: size, got: out.len() });
    }
    check_arity(context, buffer)?;

    // 8-aligned scratch large enough for the declared aggregate
    let mut ret = vec![0u64; size.div_ceil(8).max(1)];
    unsafe {
        raw::ffi_call(
            context.cif.as_raw_ptr(),
            Some(*CodePtr(function.address() as usize as *mut c_void).as_safe_fun()),
            ret.as_mut_ptr() as *mut c_void,
            buffer.avalue(),
        );
    }
    if function.save_errno() {
        crate::errno::save_errno();
    }
    buffer.write_back();

    let bytes = unsafe { std::slice::from_raw_parts(ret.as_ptr() as *const u8, size) };
    out.copy_from_slice(bytes);
    Ok(())
}

fn check_arity(
    context: &CallContext,
    buffer: &InvocationBuffer<'_>,
) -> Result<(), InvokeError> {
    if buffer.len() != context.param_count() {
        return Err(InvokeError::ArityMismatch {
            expected: context.param_count(),
            got: buffer.len(),
        });
    }
    Ok(())
}

/// Interpret the libffi return buffer. Integral results smaller than a
/// machine word are widened by libffi; truncating to the declared width and
/// re-extending gives a canonical 64-bit image either way.
fn decode_result(t: NativeType, ret: &[u8; 16]) -> RawValue {
    let word = read_word(ret);
    match t {
        NativeType::Void => RawValue::VOID,
        NativeType::SChar => RawValue::from_i64(word as i8 as i64),
        NativeType::UChar => RawValue::from_bits(word as u8 as u64),
        NativeType::SShort => RawValue::from_i64(word as i16 as i64),
        NativeType::UShort => RawValue::from_bits(word as u16 as u64),
        NativeType::SInt => RawValue::from_i64(word as i32 as i64),
        NativeType::UInt => RawValue::from_bits(word as u32 as u64),
        NativeType::SLong => {
            if long_is_32() {
                RawValue::from_i64(word as i32 as i64)
            } else {
                RawValue::from_i64(word as i64)
            }
        }
        NativeType::ULong => {
            if long_is_32() {
                RawValue::from_bits(word as u32 as u64)
            } else {
                RawValue::from_bits(word)
            }
        }
        NativeType::SLongLong => RawValue::from_i64(word as i64),
        NativeType::ULongLong | NativeType::Pointer => RawValue::from_bits(word),
        NativeType::Float => {
            let mut b = [0u8; 4];
            b.copy_from_slice(&ret[..4]);
            RawValue::from_f32(f32::from_ne_bytes(b))
        }
        NativeType::Double => {
            let mut b = [0u8; 8];
            b.copy_from_slice(&ret[..8]);
            RawValue::from_f64(f64::from_ne_bytes(b))
        }
    }
}

/// Read one machine word (libffi's `ffi_arg`) from the return buffer.
fn read_word(ret: &[u8; 16]) -> u64 {
    let mut b = [0u8; std::mem::size_of::<usize>()];
    b.copy_from_slice(&ret[..std::mem::size_of::<usize>()]);
    usize::from_ne_bytes(b) as u64
}
