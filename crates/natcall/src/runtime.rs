//! Runtime support utilities.
//!
//! Thin, stateless helpers consumed by generated trampolines and the
//! generic path: raw address extraction from buffer-like values, invocation
//! buffer construction, and best-effort post-call hook execution.

use crate::callable::Callable;
use crate::generic::{CallContext, InvocationBuffer};
use crate::strategy::BufferArg;
use crate::types::{PostInvoke, RawValue};

/// Extract the raw native address of a buffer-like value.
///
/// Returns 0 for anything not backed by stable native memory; never fails.
pub fn buffer_address(arg: &BufferArg<'_>) -> u64 {
    match arg {
        BufferArg::Native { addr, .. } => *addr,
        BufferArg::Managed { .. } => 0,
    }
}

/// A fresh invocation buffer sized from a call context.
pub fn new_invocation_buffer<'a>(context: &CallContext) -> InvocationBuffer<'a> {
    InvocationBuffer::from_context(context)
}

/// A fresh invocation buffer pre-sized for `objects` heap-backed object
/// arguments.
pub fn new_invocation_buffer_with_objects<'a>(
    context: &CallContext,
    objects: usize,
) -> InvocationBuffer<'a> {
    InvocationBuffer::with_object_count(context, objects)
}

/// A fresh invocation buffer sized from a bound callable's descriptor.
pub fn new_invocation_buffer_for<'a>(callable: &Callable) -> InvocationBuffer<'a> {
    InvocationBuffer::from_context(callable.context())
}

/// Run a post-call conversion hook, discarding any failure it raises.
///
/// Only the hook's own failure is discarded: by the time it runs, the
/// native call has already completed successfully, so a conversion problem
/// must not retroactively fail the call.
pub fn post_invoke(hook: &dyn PostInvoke, managed: RawValue, native: RawValue) {
    if let Err(err) = hook.post_invoke(managed, native) {
        tracing::debug!(error = %err, "post-invocation hook failed; result kept");
    }
}
