//! Native type and signature model.
//!
//! Everything else in the crate operates on the types defined here: the
//! closed set of native primitive kinds, the caller-side carrier
//! representations, parameter/result wrappers with their optional conversion
//! hooks, and structurally-comparable signatures suitable for keying a stub
//! cache.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::error::HookError;

// ============================================================================
// Native primitive kinds
// ============================================================================

/// The closed enumeration of native primitive kinds.
///
/// Storage sizes for the `long` and pointer kinds depend on the target
/// architecture, so the per-kind size tables live with the stub compilers
/// (`arch` module) and the generic path derives layout from its call
/// context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeType {
    /// No value (results only).
    Void,
    /// `signed char`
    SChar,
    /// `unsigned char`
    UChar,
    /// `short`
    SShort,
    /// `unsigned short`
    UShort,
    /// `int`
    SInt,
    /// `unsigned int`
    UInt,
    /// `long`
    SLong,
    /// `unsigned long`
    ULong,
    /// `long long`
    SLongLong,
    /// `unsigned long long`
    ULongLong,
    /// `float`
    Float,
    /// `double`
    Double,
    /// any data or function pointer
    Pointer,
}

impl NativeType {
    /// True for the integer kinds (signed or unsigned, any width).
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            NativeType::SChar
                | NativeType::UChar
                | NativeType::SShort
                | NativeType::UShort
                | NativeType::SInt
                | NativeType::UInt
                | NativeType::SLong
                | NativeType::ULong
                | NativeType::SLongLong
                | NativeType::ULongLong
        )
    }

    /// True for the signed integer kinds.
    pub fn is_signed(self) -> bool {
        matches!(
            self,
            NativeType::SChar
                | NativeType::SShort
                | NativeType::SInt
                | NativeType::SLong
                | NativeType::SLongLong
        )
    }

    /// True for the unsigned integer kinds.
    pub fn is_unsigned(self) -> bool {
        self.is_integer() && !self.is_signed()
    }

    /// True for `Float` and `Double`.
    pub fn is_floating(self) -> bool {
        matches!(self, NativeType::Float | NativeType::Double)
    }
}

// ============================================================================
// Carriers: caller-side machine representations
// ============================================================================

/// The machine representation a value uses on the managed side of a call.
///
/// A sub-word native type is always carried widened (there is no 8-bit
/// carrier); the stub compiler narrows and re-extends while marshalling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Carrier {
    /// 32-bit integer slot.
    I32,
    /// 64-bit integer slot (also carries addresses).
    I64,
    /// 32-bit float slot.
    F32,
    /// 64-bit float slot.
    F64,
}

impl Carrier {
    /// Slot width in bytes on the managed side.
    pub fn size(self) -> u32 {
        match self {
            Carrier::I32 | Carrier::F32 => 4,
            Carrier::I64 | Carrier::F64 => 8,
        }
    }

    /// True for the integer-class carriers.
    pub fn is_integer(self) -> bool {
        matches!(self, Carrier::I32 | Carrier::I64)
    }
}

/// The default carrier for a native kind: 32-bit integer kinds travel as
/// `I32`, everything 64-bit-capable (including addresses) as `I64`, floats
/// as their own width.
pub fn default_carrier(native: NativeType) -> Carrier {
    match native {
        NativeType::Void
        | NativeType::SChar
        | NativeType::UChar
        | NativeType::SShort
        | NativeType::UShort
        | NativeType::SInt
        | NativeType::UInt => Carrier::I32,
        NativeType::SLong
        | NativeType::ULong
        | NativeType::SLongLong
        | NativeType::ULongLong
        | NativeType::Pointer => Carrier::I64,
        NativeType::Float => Carrier::F32,
        NativeType::Double => Carrier::F64,
    }
}

fn carrier_compatible(native: NativeType, carrier: Carrier) -> bool {
    match native {
        NativeType::Float => carrier == Carrier::F32,
        NativeType::Double => carrier == Carrier::F64,
        NativeType::Void => carrier.is_integer(),
        _ => carrier.is_integer(),
    }
}

// ============================================================================
// Aggregates
// ============================================================================

/// Layout of an aggregate (struct-by-value) type.
///
/// The stub compilers reject aggregates; only the generic invocation path
/// handles them, deriving the libffi element list from `fields`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AggregateLayout {
    /// Total size in bytes.
    pub size: usize,
    /// Required alignment in bytes.
    pub alignment: usize,
    /// Flattened field kinds, in declaration order.
    pub fields: Vec<NativeType>,
}

/// A parameter or result type: either one native primitive kind or an
/// aggregate layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeKind {
    /// One of the closed set of primitive kinds.
    Primitive(NativeType),
    /// Struct passed or returned by value.
    Aggregate(Arc<AggregateLayout>),
}

impl TypeKind {
    /// The primitive kind, if this is not an aggregate.
    pub fn primitive(&self) -> Option<NativeType> {
        match self {
            TypeKind::Primitive(t) => Some(*t),
            TypeKind::Aggregate(_) => None,
        }
    }
}

// ============================================================================
// Conversion hooks (owned by the converter framework)
// ============================================================================

/// Pre-call transformation supplied per parameter by the converter layer.
pub trait PreInvoke: Send + Sync {
    /// Transform a managed value into its native representation.
    fn pre_invoke(&self, value: RawValue) -> Result<RawValue, HookError>;
}

/// Post-call transformation supplied per result by the converter layer.
///
/// Failures of this hook are swallowed by [`crate::runtime::post_invoke`];
/// the native call has already completed by the time it runs.
pub trait PostInvoke: Send + Sync {
    /// Observe the managed and native result values after a call.
    fn post_invoke(&self, managed: RawValue, native: RawValue) -> Result<(), HookError>;
}

// ============================================================================
// Parameter and result types
// ============================================================================

/// A declared parameter: its kind, carrier, and optional pre-call hook.
#[derive(Clone)]
pub struct ParameterType {
    kind: TypeKind,
    carrier: Carrier,
    to_native: Option<Arc<dyn PreInvoke>>,
}

impl ParameterType {
    /// A primitive parameter with the default carrier.
    pub fn new(native: NativeType) -> Self {
        ParameterType {
            kind: TypeKind::Primitive(native),
            carrier: default_carrier(native),
            to_native: None,
        }
    }

    /// A primitive parameter with an explicit carrier.
    ///
    /// Integer and pointer kinds accept either integer carrier (a 32-bit
    /// carrier into a 64-bit native kind is sign- or zero-extended while
    /// marshalling); float kinds require their own width.
    pub fn with_carrier(native: NativeType, carrier: Carrier) -> Result<Self, crate::error::TypeError> {
        if !carrier_compatible(native, carrier) {
            return Err(crate::error::TypeError::IncompatibleCarrier { native, carrier });
        }
        Ok(ParameterType {
            kind: TypeKind::Primitive(native),
            carrier,
            to_native: None,
        })
    }

    /// An aggregate (struct-by-value) parameter.
    pub fn aggregate(layout: Arc<AggregateLayout>) -> Self {
        ParameterType {
            kind: TypeKind::Aggregate(layout),
            carrier: Carrier::I64,
            to_native: None,
        }
    }

    /// Attach a pre-call conversion hook.
    pub fn with_pre_invoke(mut self, hook: Arc<dyn PreInvoke>) -> Self {
        self.to_native = Some(hook);
        self
    }

    /// The parameter's kind.
    pub fn kind(&self) -> &TypeKind {
        &self.kind
    }

    /// The primitive kind, if not an aggregate.
    pub fn native_type(&self) -> Option<NativeType> {
        self.kind.primitive()
    }

    /// The caller-side carrier.
    pub fn carrier(&self) -> Carrier {
        self.carrier
    }

    /// The pre-call hook, if any.
    pub fn pre_invoke_hook(&self) -> Option<&Arc<dyn PreInvoke>> {
        self.to_native.as_ref()
    }
}

impl fmt::Debug for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterType")
            .field("kind", &self.kind)
            .field("carrier", &self.carrier)
            .field("has_hook", &self.to_native.is_some())
            .finish()
    }
}

impl PartialEq for ParameterType {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.carrier == other.carrier
            && hook_ptr(&self.to_native) == hook_ptr(&other.to_native)
    }
}

impl Eq for ParameterType {}

impl Hash for ParameterType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.carrier.hash(state);
        hook_ptr(&self.to_native).hash(state);
    }
}

fn hook_ptr<T: ?Sized>(hook: &Option<Arc<T>>) -> usize {
    hook.as_ref()
        .map(|h| Arc::as_ptr(h) as *const () as usize)
        .unwrap_or(0)
}

/// A declared result: its kind, carrier, and optional post-call hook.
#[derive(Clone)]
pub struct ResultType {
    kind: TypeKind,
    carrier: Carrier,
    from_native: Option<Arc<dyn PostInvoke>>,
}

impl ResultType {
    /// A primitive result with the default carrier.
    pub fn new(native: NativeType) -> Self {
        ResultType {
            kind: TypeKind::Primitive(native),
            carrier: default_carrier(native),
            from_native: None,
        }
    }

    /// A primitive result with an explicit carrier.
    ///
    /// Declaring a 64-bit carrier over a 32-bit native kind makes the stub
    /// widen the raw result (sign-extending signed kinds, zero-filling
    /// unsigned and pointer kinds).
    pub fn with_carrier(native: NativeType, carrier: Carrier) -> Result<Self, crate::error::TypeError> {
        if !carrier_compatible(native, carrier) {
            return Err(crate::error::TypeError::IncompatibleCarrier { native, carrier });
        }
        Ok(ResultType {
            kind: TypeKind::Primitive(native),
            carrier,
            from_native: None,
        })
    }

    /// An aggregate (struct-by-value) result.
    pub fn aggregate(layout: Arc<AggregateLayout>) -> Self {
        ResultType {
            kind: TypeKind::Aggregate(layout),
            carrier: Carrier::I64,
            from_native: None,
        }
    }

    /// Attach a post-call conversion hook.
    pub fn with_post_invoke(mut self, hook: Arc<dyn PostInvoke>) -> Self {
        self.from_native = Some(hook);
        self
    }

    /// The result's kind.
    pub fn kind(&self) -> &TypeKind {
        &self.kind
    }

    /// The primitive kind, if not an aggregate.
    pub fn native_type(&self) -> Option<NativeType> {
        self.kind.primitive()
    }

    /// The caller-side carrier.
    pub fn carrier(&self) -> Carrier {
        self.carrier
    }

    /// The post-call hook, if any.
    pub fn post_invoke_hook(&self) -> Option<&Arc<dyn PostInvoke>> {
        self.from_native.as_ref()
    }
}

impl fmt::Debug for ResultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultType")
            .field("kind", &self.kind)
            .field("carrier", &self.carrier)
            .field("has_hook", &self.from_native.is_some())
            .finish()
    }
}

impl PartialEq for ResultType {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.carrier == other.carrier
            && hook_ptr(&self.from_native) == hook_ptr(&other.from_native)
    }
}

impl Eq for ResultType {}

impl Hash for ResultType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.carrier.hash(state);
        hook_ptr(&self.from_native).hash(state);
    }
}

// ============================================================================
// Calling conventions and signatures
// ============================================================================

/// Platform calling convention tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallingConvention {
    /// The platform's default C convention.
    Default,
    /// Win32 stdcall (callee cleans the stack). Never compilable on SysV
    /// targets; routed through the generic path.
    Stdcall,
}

/// An ordered parameter list, result type, and calling convention.
///
/// Signatures compare and hash structurally so a stub cache can key on them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    result: ResultType,
    params: Vec<ParameterType>,
    convention: CallingConvention,
}

impl Signature {
    /// Build a signature from its components.
    pub fn new(
        result: ResultType,
        params: Vec<ParameterType>,
        convention: CallingConvention,
    ) -> Self {
        Signature { result, params, convention }
    }

    /// The declared result type.
    pub fn result(&self) -> &ResultType {
        &self.result
    }

    /// The declared parameters, in order.
    pub fn parameters(&self) -> &[ParameterType] {
        &self.params
    }

    /// Number of declared parameters.
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    /// The calling convention tag.
    pub fn convention(&self) -> CallingConvention {
        self.convention
    }
}

// ============================================================================
// Function handles and raw values
// ============================================================================

/// A resolved native function: its address plus ABI metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionHandle {
    address: u64,
    save_errno: bool,
}

impl FunctionHandle {
    /// Wrap a resolved native address.
    pub fn new(address: u64, save_errno: bool) -> Self {
        FunctionHandle { address, save_errno }
    }

    /// The native code address.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Whether calls through this handle capture errno immediately after
    /// the native call returns.
    pub fn save_errno(&self) -> bool {
        self.save_errno
    }
}

/// A raw native call result: the 64-bit register image of the return value.
///
/// Integral results are stored sign- or zero-extended to 64 bits according
/// to their declared kind; float results store their bit patterns in the
/// low lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawValue(u64);

impl RawValue {
    /// A zero/void value.
    pub const VOID: RawValue = RawValue(0);

    /// Wrap raw result bits.
    pub fn from_bits(bits: u64) -> Self {
        RawValue(bits)
    }

    /// Wrap a signed integer (sign-extended representation).
    pub fn from_i64(v: i64) -> Self {
        RawValue(v as u64)
    }

    /// Wrap an f32 bit pattern.
    pub fn from_f32(v: f32) -> Self {
        RawValue(v.to_bits() as u64)
    }

    /// Wrap an f64 bit pattern.
    pub fn from_f64(v: f64) -> Self {
        RawValue(v.to_bits())
    }

    /// The raw 64-bit image.
    pub fn bits(self) -> u64 {
        self.0
    }

    /// Low 32 bits as a signed integer.
    pub fn as_i32(self) -> i32 {
        self.0 as i32
    }

    /// Low 32 bits as an unsigned integer.
    pub fn as_u32(self) -> u32 {
        self.0 as u32
    }

    /// Full image as a signed integer.
    pub fn as_i64(self) -> i64 {
        self.0 as i64
    }

    /// Full image as an unsigned integer.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Low 32 bits as an f32 bit pattern.
    pub fn as_f32(self) -> f32 {
        f32::from_bits(self.0 as u32)
    }

    /// Full image as an f64 bit pattern.
    pub fn as_f64(self) -> f64 {
        f64::from_bits(self.0)
    }

    /// Full image as a native address.
    pub fn as_address(self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_carriers() {
        assert_eq!(default_carrier(NativeType::SChar), Carrier::I32);
        assert_eq!(default_carrier(NativeType::UInt), Carrier::I32);
        assert_eq!(default_carrier(NativeType::SLongLong), Carrier::I64);
        assert_eq!(default_carrier(NativeType::Pointer), Carrier::I64);
        assert_eq!(default_carrier(NativeType::Float), Carrier::F32);
        assert_eq!(default_carrier(NativeType::Double), Carrier::F64);
    }

    #[test]
    fn test_carrier_compatibility() {
        // integer kinds accept either integer carrier
        assert!(ParameterType::with_carrier(NativeType::SChar, Carrier::I64).is_ok());
        assert!(ParameterType::with_carrier(NativeType::ULongLong, Carrier::I32).is_ok());
        // floats require their exact width
        assert!(ParameterType::with_carrier(NativeType::Float, Carrier::F64).is_err());
        assert!(ParameterType::with_carrier(NativeType::Double, Carrier::I64).is_err());
    }

    #[test]
    fn test_classification() {
        assert!(NativeType::SLongLong.is_integer());
        assert!(NativeType::SLongLong.is_signed());
        assert!(NativeType::ULong.is_unsigned());
        assert!(NativeType::Double.is_floating());
        assert!(!NativeType::Pointer.is_integer());
        assert!(!NativeType::Void.is_integer());
    }

    #[test]
    fn test_signature_structural_equality() {
        let a = Signature::new(
            ResultType::new(NativeType::SInt),
            vec![
                ParameterType::new(NativeType::SChar),
                ParameterType::new(NativeType::Double),
            ],
            CallingConvention::Default,
        );
        let b = Signature::new(
            ResultType::new(NativeType::SInt),
            vec![
                ParameterType::new(NativeType::SChar),
                ParameterType::new(NativeType::Double),
            ],
            CallingConvention::Default,
        );
        assert_eq!(a, b);

        let c = Signature::new(
            ResultType::new(NativeType::SInt),
            vec![ParameterType::new(NativeType::SChar)],
            CallingConvention::Default,
        );
        assert_ne!(a, c);

        let d = Signature::new(
            ResultType::new(NativeType::SInt),
            vec![
                ParameterType::new(NativeType::SChar),
                ParameterType::new(NativeType::Double),
            ],
            CallingConvention::Stdcall,
        );
        assert_ne!(a, d);
    }

    #[test]
    fn test_signature_hash_matches_equality() {
        use rustc_hash::FxHashMap;

        let mut map = FxHashMap::default();
        let a = Signature::new(
            ResultType::new(NativeType::UInt),
            vec![ParameterType::new(NativeType::Pointer)],
            CallingConvention::Default,
        );
        map.insert(a.clone(), 1u32);
        let b = Signature::new(
            ResultType::new(NativeType::UInt),
            vec![ParameterType::new(NativeType::Pointer)],
            CallingConvention::Default,
        );
        assert_eq!(map.get(&b), Some(&1));
    }

    #[test]
    fn test_hook_identity_distinguishes_types() {
        struct Nop;
        impl PreInvoke for Nop {
            fn pre_invoke(&self, value: RawValue) -> Result<RawValue, crate::error::HookError> {
                Ok(value)
            }
        }

        let plain = ParameterType::new(NativeType::SInt);
        let hooked = ParameterType::new(NativeType::SInt).with_pre_invoke(Arc::new(Nop));
        assert_ne!(plain, hooked);
        assert_eq!(hooked.clone(), hooked);
        assert!(hooked.pre_invoke_hook().is_some());

        struct Discard;
        impl PostInvoke for Discard {
            fn post_invoke(
                &self,
                _managed: RawValue,
                _native: RawValue,
            ) -> Result<(), crate::error::HookError> {
                Ok(())
            }
        }

        let plain = ResultType::new(NativeType::SInt);
        let hooked = ResultType::new(NativeType::SInt).with_post_invoke(Arc::new(Discard));
        assert_ne!(plain, hooked);
        assert!(hooked.post_invoke_hook().is_some());
    }

    #[test]
    fn test_raw_value_accessors() {
        assert_eq!(RawValue::from_i64(-5).as_i32(), -5);
        assert_eq!(RawValue::from_i64(-1).as_u32(), u32::MAX);
        assert_eq!(RawValue::from_f64(1.5).as_f64(), 1.5);
        assert_eq!(RawValue::from_f32(0.25).as_f32(), 0.25);
        assert_eq!(RawValue::from_bits(0xDEAD_BEEF).as_address(), 0xDEAD_BEEF);
    }
}
