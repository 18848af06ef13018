//! The front door: binding a signature to a callable.
//!
//! Binding runs the host capability check once. If the signature is
//! compilable, the trampoline is compiled (deduplicated per function and
//! signature, first compiler wins) and its entry point becomes the fast
//! path; otherwise the callable wraps a prepared generic call context.
//! Either way the caller sees identical observable semantics, and an
//! installed callable never re-consults the compiler.

use std::ptr::NonNull;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use rustc_hash::FxBuildHasher;

use crate::arch::{self, StubCompiler};
use crate::code::Stub;
use crate::error::{CompileError, Error, InvokeError};
use crate::generic::{self, CallContext, InvocationBuffer};
use crate::loader::Library;
use crate::strategy::BufferArg;
use crate::types::{FunctionHandle, RawValue, Signature};

/// A dynamic call argument for [`Callable::invoke`].
///
/// Runtime values must match the carrier list of the bound signature; a
/// mismatch is a caller contract violation, as with any native call.
pub enum Value<'a> {
    /// Signed 8-bit integer.
    I8(i8),
    /// Unsigned 8-bit integer.
    U8(u8),
    /// Signed 16-bit integer.
    I16(i16),
    /// Unsigned 16-bit integer.
    U16(u16),
    /// Signed 32-bit integer.
    I32(i32),
    /// Unsigned 32-bit integer.
    U32(u32),
    /// Signed 64-bit integer.
    I64(i64),
    /// Unsigned 64-bit integer.
    U64(u64),
    /// 32-bit float.
    F32(f32),
    /// 64-bit float.
    F64(f64),
    /// Raw native address.
    Pointer(u64),
    /// Buffer-like argument, classified by its parameter strategy.
    Buffer(BufferArg<'a>),
    /// Aggregate passed by value.
    Aggregate(&'a [u8]),
}

#[derive(PartialEq, Eq, Hash)]
struct StubKey {
    address: u64,
    save_errno: bool,
    signature: Signature,
}

static STUB_CACHE: Lazy<DashMap<StubKey, Arc<Stub>, FxBuildHasher>> =
    Lazy::new(|| DashMap::with_hasher(FxBuildHasher));

/// A bound native callable: either a compiled trampoline or a generic-path
/// dispatcher for one function and signature.
pub struct Callable {
    name: String,
    function: FunctionHandle,
    signature: Signature,
    context: Arc<CallContext>,
    stub: Option<Arc<Stub>>,
}

impl Callable {
    /// Bind a resolved function to a signature.
    pub fn bind(
        function: FunctionHandle,
        name: &str,
        signature: &Signature,
    ) -> Result<Self, Error> {
        let context = Arc::new(CallContext::new(signature)?);

        let stub = match arch::host_compiler() {
            Some(compiler)
                if compiler.can_compile(
                    signature.result(),
                    signature.parameters(),
                    signature.convention(),
                ) =>
            {
                Some(compile_cached(compiler, &function, name, signature)?)
            }
            _ => None,
        };

        Ok(Callable {
            name: name.to_string(),
            function,
            signature: signature.clone(),
            context,
            stub,
        })
    }

    /// Resolve `symbol` out of `library` and bind it.
    pub fn bind_symbol(
        library: &Library,
        symbol: &str,
        signature: &Signature,
        save_errno: bool,
    ) -> Result<Self, Error> {
        let address = library.resolve(symbol)?;
        Self::bind(FunctionHandle::new(address, save_errno), symbol, signature)
    }

    /// The symbolic name this callable was bound under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bound function handle.
    pub fn function(&self) -> &FunctionHandle {
        &self.function
    }

    /// The bound signature.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// The prepared generic call context.
    pub fn context(&self) -> &Arc<CallContext> {
        &self.context
    }

    /// True if a compiled trampoline backs this callable.
    pub fn is_compiled(&self) -> bool {
        self.stub.is_some()
    }

    /// Entry point of the compiled trampoline, if one was installed.
    ///
    /// The embedder casts this to the concrete stub ABI for the signature
    /// (see `crate::arch` for the entry convention); the pointer stays
    /// valid for the life of the process.
    pub fn code_ptr(&self) -> Option<NonNull<u8>> {
        self.stub
            .as_ref()
            .and_then(|s| NonNull::new(s.entry() as *mut u8))
    }

    /// Invoke dynamically through the generic dispatcher.
    ///
    /// Available for every callable; compiled callables keep their
    /// trampoline as the embedder's fast path, this route trades speed for
    /// a uniform argument interface.
    pub fn invoke(&self, args: Vec<Value<'_>>) -> Result<RawValue, InvokeError> {
        let mut buffer = self.fill_buffer(args);
        generic::invoke(&self.context, &self.function, &mut buffer)
    }

    /// Invoke dynamically, writing an aggregate result into `out`.
    pub fn invoke_into(&self, args: Vec<Value<'_>>, out: &mut [u8]) -> Result<(), InvokeError> {
        let mut buffer = self.fill_buffer(args);
        generic::invoke_into(&self.context, &self.function, &mut buffer, out)
    }

    fn fill_buffer<'a>(&self, args: Vec<Value<'a>>) -> InvocationBuffer<'a> {
        let mut buffer = InvocationBuffer::from_context(&self.context);
        for arg in args {
            match arg {
                Value::I8(v) => buffer.push_i8(v),
                Value::U8(v) => buffer.push_u8(v),
                Value::I16(v) => buffer.push_i16(v),
                Value::U16(v) => buffer.push_u16(v),
                Value::I32(v) => buffer.push_i32(v),
                Value::U32(v) => buffer.push_u32(v),
                Value::I64(v) => buffer.push_i64(v),
                Value::U64(v) => buffer.push_u64(v),
                Value::F32(v) => buffer.push_f32(v),
                Value::F64(v) => buffer.push_f64(v),
                Value::Pointer(v) => buffer.push_pointer(v),
                Value::Buffer(b) => buffer.push_buffer(b),
                Value::Aggregate(bytes) => buffer.push_aggregate(bytes),
            }
        }
        buffer
    }
}

/// Compile through the signature-keyed cache: concurrent requests for the
/// same function and signature deduplicate, first compiler wins.
fn compile_cached(
    compiler: &dyn StubCompiler,
    function: &FunctionHandle,
    name: &str,
    signature: &Signature,
) -> Result<Arc<Stub>, CompileError> {
    let key = StubKey {
        address: function.address(),
        save_errno: function.save_errno(),
        signature: signature.clone(),
    };
    match STUB_CACHE.entry(key) {
        Entry::Occupied(hit) => Ok(hit.get().clone()),
        Entry::Vacant(slot) => {
            // racers block on this shard until the winner publishes
            let stub = compiler.compile(function, name, signature)?;
            slot.insert(stub.clone());
            Ok(stub)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        AggregateLayout, CallingConvention, NativeType, ParameterType, ResultType,
    };

    extern "C" fn nop() {}

    fn void_sig() -> Signature {
        Signature::new(
            ResultType::new(NativeType::Void),
            vec![],
            CallingConvention::Default,
        )
    }

    #[test]
    fn test_aggregate_signature_binds_generic() {
        let layout = Arc::new(AggregateLayout {
            size: 8,
            alignment: 4,
            fields: vec![NativeType::SInt, NativeType::SInt],
        });
        let sig = Signature::new(
            ResultType::aggregate(layout),
            vec![],
            CallingConvention::Default,
        );
        let callable =
            Callable::bind(FunctionHandle::new(nop as usize as u64, false), "agg", &sig).unwrap();
        assert!(!callable.is_compiled());
        assert!(callable.code_ptr().is_none());
    }

    #[test]
    fn test_stdcall_signature_binds_generic() {
        let sig = Signature::new(
            ResultType::new(NativeType::Void),
            vec![],
            CallingConvention::Stdcall,
        );
        let callable =
            Callable::bind(FunctionHandle::new(nop as usize as u64, false), "std", &sig).unwrap();
        assert!(!callable.is_compiled());
    }

    #[cfg(all(target_arch = "x86_64", target_family = "unix"))]
    #[test]
    fn test_compilable_signature_installs_stub() {
        let sig = void_sig();
        let callable =
            Callable::bind(FunctionHandle::new(nop as usize as u64, false), "nop", &sig).unwrap();
        assert!(callable.is_compiled());
        assert!(callable.code_ptr().is_some());
    }

    #[cfg(all(target_arch = "x86_64", target_family = "unix"))]
    #[test]
    fn test_rebinding_reuses_the_cached_stub() {
        let sig = void_sig();
        let f = FunctionHandle::new(nop as usize as u64, false);
        let first = Callable::bind(f, "nop_cached", &sig).unwrap();
        let second = Callable::bind(f, "nop_cached", &sig).unwrap();
        assert_eq!(
            first.code_ptr().map(|p| p.as_ptr() as usize),
            second.code_ptr().map(|p| p.as_ptr() as usize)
        );
    }
}
