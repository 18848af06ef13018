//! Stub compiler for 32-bit x86 (SysV).
//!
//! Every argument travels on the stack, so marshalling is a copy from the
//! caller's frame layout (carrier slots) into a freshly reserved parameter
//! area laid out for the native types, with sign/zero extension applied
//! where the widths differ.

use std::sync::Arc;

use natcall_asm::{byte_ptr, dword_ptr, qword_ptr, word_ptr, Assembler, Gpr, Mem, Mode};

use super::{align, StubCompiler, TargetArch};
use crate::code::{Stub, StubTable};
use crate::error::CompileError;
use crate::types::{
    Carrier, CallingConvention, FunctionHandle, NativeType, ParameterType, ResultType, Signature,
};

/// Emitted trampolines grow linearly with the parameter list; this bound
/// keeps a single stub to a few kilobytes of code.
const MAX_PARAMS: usize = 64;

/// Bytes between the re-marshalled parameter area and the first source
/// slot: the return address plus the two pointer-sized dispatch slots
/// (environment and receiver).
const FRAME_SKIP: i32 = 4 + 8;

/// Stub compiler for i386 unix.
pub struct X86_32StubCompiler {
    errno_function: u64,
}

impl X86_32StubCompiler {
    /// A compiler embedding this process's errno-capture helper.
    pub fn host() -> Self {
        X86_32StubCompiler { errno_function: crate::errno::save_errno_address() }
    }

    /// A compiler embedding an explicit errno-capture helper address.
    pub fn with_errno_function(errno_function: u64) -> Self {
        X86_32StubCompiler { errno_function }
    }

    fn unsupported(&self, reason: impl Into<String>) -> CompileError {
        CompileError::UnsupportedType { arch: self.arch().name(), reason: reason.into() }
    }
}

impl StubCompiler for X86_32StubCompiler {
    fn arch(&self) -> TargetArch {
        TargetArch::X86_32
    }

    fn can_compile(
        &self,
        result: &ResultType,
        params: &[ParameterType],
        convention: CallingConvention,
    ) -> bool {
        // SysV is the only conforming convention here; stdcall frames do
        // not fit the trampoline's caller-cleans layout
        if convention != CallingConvention::Default {
            return false;
        }
        if result.kind().primitive().is_none() {
            return false;
        }
        if params.len() > MAX_PARAMS {
            return false;
        }

        let mut icount = 0usize;
        let mut fcount = 0usize;
        for p in params {
            match p.kind().primitive() {
                Some(NativeType::Float | NativeType::Double) => fcount += 1,
                Some(t) if t.is_integer() || t == NativeType::Pointer => icount += 1,
                _ => return false,
            }
        }
        // every parameter is stack-passed; unlike register architectures
        // there is no register budget to enforce
        let _ = (icount, fcount);
        true
    }

    fn compile(
        &self,
        function: &FunctionHandle,
        name: &str,
        signature: &Signature,
    ) -> Result<Arc<Stub>, CompileError> {
        if !self.can_compile(signature.result(), signature.parameters(), signature.convention()) {
            return Err(self.unsupported("signature rejected by the capability check"));
        }
        if function.address() > u32::MAX as u64 {
            return Err(CompileError::AddressOutOfRange {
                arch: self.arch().name(),
                address: function.address(),
            });
        }
        if function.save_errno() && self.errno_function > u32::MAX as u64 {
            return Err(CompileError::AddressOutOfRange {
                arch: self.arch().name(),
                address: self.errno_function,
            });
        }

        let mut kinds = Vec::with_capacity(signature.param_count());
        for p in signature.parameters() {
            match p.kind().primitive() {
                Some(t) => kinds.push((t, p.carrier())),
                None => return Err(self.unsupported("aggregate parameter")),
            }
        }
        let rt = match signature.result().kind().primitive() {
            Some(t) => t,
            None => return Err(self.unsupported("aggregate result")),
        };

        let stackadj = stack_adjustment(&kinds, rt);

        let mut a = Assembler::new(Mode::X86);
        a.sub_ri(Gpr::Rsp, stackadj);

        // copy and convert the parameters from the original stack layout
        // to the freshly reserved native parameter area
        let mut srcoff = 0i32;
        let mut dstoff = 0i32;
        for &(t, carrier) in &kinds {
            let src_size = carrier.size() as i32;
            let dst_size = parameter_size(t);
            let disp = stackadj + FRAME_SKIP + srcoff;

            match t {
                NativeType::SChar | NativeType::SShort => {
                    a.movsx_rm(Gpr::Rax, ptr(Gpr::Rsp, disp, t));
                }
                NativeType::UChar | NativeType::UShort => {
                    a.movzx_rm(Gpr::Rax, ptr(Gpr::Rsp, disp, t));
                }
                _ => a.mov_rm(Gpr::Rax, dword_ptr(Gpr::Rsp, disp)),
            }
            a.mov_mr(dword_ptr(Gpr::Rsp, dstoff), Gpr::Rax);

            if dst_size > 4 {
                if t == NativeType::SLongLong && carrier != Carrier::I64 {
                    // sign-extend a 32-bit carrier into the upper half
                    a.sar_ri32(Gpr::Rax, 31);
                    a.mov_mr(dword_ptr(Gpr::Rsp, dstoff + 4), Gpr::Rax);
                } else if t == NativeType::ULongLong && carrier != Carrier::I64 {
                    // zero-fill the upper half
                    a.mov_mi32(dword_ptr(Gpr::Rsp, dstoff + 4), 0);
                } else {
                    a.mov_rm(Gpr::Rax, dword_ptr(Gpr::Rsp, disp + 4));
                    a.mov_mr(dword_ptr(Gpr::Rsp, dstoff + 4), Gpr::Rax);
                }
            }

            dstoff += dst_size;
            srcoff += src_size;
        }

        // absolute call through a scratch register; everything live is
        // already in the parameter area
        a.mov_ri32(Gpr::Rax, function.address() as u32);
        a.call_r(Gpr::Rax);

        if function.save_errno() {
            // stash the raw result, capture errno while it is still valid,
            // then restore the return registers
            let save = 0;
            match rt {
                NativeType::Float => a.fstp(dword_ptr(Gpr::Rsp, save)),
                NativeType::Double => a.fstp(qword_ptr(Gpr::Rsp, save)),
                NativeType::SLongLong | NativeType::ULongLong => {
                    a.mov_mr(dword_ptr(Gpr::Rsp, save), Gpr::Rax);
                    a.mov_mr(dword_ptr(Gpr::Rsp, save + 4), Gpr::Rdx);
                }
                NativeType::Void => {}
                _ => a.mov_mr(dword_ptr(Gpr::Rsp, save), Gpr::Rax),
            }

            a.mov_ri32(Gpr::Rax, self.errno_function as u32);
            a.call_r(Gpr::Rax);

            match rt {
                NativeType::Float => a.fld(dword_ptr(Gpr::Rsp, save)),
                NativeType::Double => a.fld(qword_ptr(Gpr::Rsp, save)),
                NativeType::SChar => a.movsx_rm(Gpr::Rax, byte_ptr(Gpr::Rsp, save)),
                NativeType::UChar => a.movzx_rm(Gpr::Rax, byte_ptr(Gpr::Rsp, save)),
                NativeType::SShort => a.movsx_rm(Gpr::Rax, word_ptr(Gpr::Rsp, save)),
                NativeType::UShort => a.movzx_rm(Gpr::Rax, word_ptr(Gpr::Rsp, save)),
                NativeType::SLongLong | NativeType::ULongLong => {
                    a.mov_rm(Gpr::Rax, dword_ptr(Gpr::Rsp, save));
                    a.mov_rm(Gpr::Rdx, dword_ptr(Gpr::Rsp, save + 4));
                }
                NativeType::Void => {}
                _ => a.mov_rm(Gpr::Rax, dword_ptr(Gpr::Rsp, save)),
            }
        } else {
            // normalize sub-word results to the declared width
            match rt {
                NativeType::SChar => a.movsx_rr8(Gpr::Rax, Gpr::Rax),
                NativeType::UChar => a.movzx_rr8(Gpr::Rax, Gpr::Rax),
                NativeType::SShort => a.movsx_rr16(Gpr::Rax, Gpr::Rax),
                NativeType::UShort => a.movzx_rr16(Gpr::Rax, Gpr::Rax),
                _ => {}
            }
        }

        if signature.result().carrier() == Carrier::I64 {
            // surface a 32-bit native result as the full edx:eax pair
            match rt {
                NativeType::SChar
                | NativeType::SShort
                | NativeType::SInt
                | NativeType::SLong => {
                    a.mov_rr32(Gpr::Rdx, Gpr::Rax);
                    a.sar_ri32(Gpr::Rdx, 31);
                }
                NativeType::UChar
                | NativeType::UShort
                | NativeType::UInt
                | NativeType::ULong
                | NativeType::Pointer => a.mov_ri32(Gpr::Rdx, 0),
                _ => {}
            }
        }

        // restore esp to its exact entry value and return
        a.add_ri(Gpr::Rsp, stackadj);
        a.ret();

        let stub = Arc::new(Stub::new(name, signature.clone(), a.finish())?);
        StubTable::global().append(stub.clone());
        Ok(stub)
    }
}

/// Destination (native) stack slot size for a parameter kind.
fn parameter_size(t: NativeType) -> i32 {
    match t {
        NativeType::SLongLong | NativeType::ULongLong | NativeType::Double => 8,
        // everything else, pointers and floats included, is one 4-byte slot
        _ => 4,
    }
}

/// Destination slot size reserved for the result; float results get a
/// widened area for the x87 transfer during errno capture.
fn result_size(t: NativeType) -> i32 {
    match t {
        NativeType::Void => 0,
        NativeType::SLongLong | NativeType::ULongLong => 8,
        NativeType::Float | NativeType::Double => 16,
        _ => 4,
    }
}

/// Stack reservation: room for the re-marshalled arguments (or the result
/// stash), keeping the mandatory 16-byte alignment at the call given the
/// 4-byte return address already pushed on entry.
fn stack_adjustment(kinds: &[(NativeType, Carrier)], result: NativeType) -> i32 {
    let psize: i32 = kinds.iter().map(|&(t, _)| parameter_size(t)).sum();
    let rsize = result_size(result);
    align(psize.max(rsize) + 4, 16) - 4
}

/// Memory operand at the access width of a sub-word kind.
fn ptr(base: Gpr, disp: i32, t: NativeType) -> Mem {
    match t {
        NativeType::SChar | NativeType::UChar => byte_ptr(base, disp),
        NativeType::SShort | NativeType::UShort => word_ptr(base, disp),
        _ => dword_ptr(base, disp),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compiler() -> X86_32StubCompiler {
        X86_32StubCompiler::with_errno_function(0x3000)
    }

    fn sig(result: ResultType, params: Vec<ParameterType>) -> Signature {
        Signature::new(result, params, CallingConvention::Default)
    }

    #[test]
    fn test_can_compile_accepts_primitives() {
        let c = compiler();
        let s = sig(
            ResultType::new(NativeType::SInt),
            vec![
                ParameterType::new(NativeType::SChar),
                ParameterType::new(NativeType::Double),
                ParameterType::new(NativeType::Pointer),
                ParameterType::new(NativeType::ULongLong),
            ],
        );
        assert!(c.can_compile(s.result(), s.parameters(), s.convention()));
    }

    #[test]
    fn test_can_compile_rejects_stdcall() {
        let c = compiler();
        let s = Signature::new(
            ResultType::new(NativeType::SInt),
            vec![ParameterType::new(NativeType::SInt)],
            CallingConvention::Stdcall,
        );
        assert!(!c.can_compile(s.result(), s.parameters(), s.convention()));
    }

    #[test]
    fn test_can_compile_rejects_aggregates() {
        use crate::types::AggregateLayout;

        let c = compiler();
        let layout = Arc::new(AggregateLayout {
            size: 8,
            alignment: 4,
            fields: vec![NativeType::SInt, NativeType::SInt],
        });

        let agg_result = sig(ResultType::aggregate(layout.clone()), vec![]);
        assert!(!c.can_compile(agg_result.result(), agg_result.parameters(), agg_result.convention()));

        let agg_param = sig(
            ResultType::new(NativeType::SInt),
            vec![ParameterType::aggregate(layout)],
        );
        assert!(!c.can_compile(agg_param.result(), agg_param.parameters(), agg_param.convention()));
    }

    #[test]
    fn test_stack_adjustment_keeps_call_alignment() {
        use NativeType::*;

        let grids: &[&[NativeType]] = &[
            &[],
            &[SInt],
            &[SInt, SInt],
            &[Double],
            &[SChar, Double, Pointer, ULongLong],
            &[SLongLong, SLongLong, SLongLong],
            &[Float; 7],
            &[SInt; 13],
        ];
        for params in grids {
            for result in [Void, SInt, ULongLong, Float, Double, Pointer] {
                let kinds: Vec<_> =
                    params.iter().map(|&t| (t, crate::types::default_carrier(t))).collect();
                let adj = stack_adjustment(&kinds, result);
                assert!(adj >= 0);
                // adding back the return-address slot must land on the
                // 16-byte boundary required at the call instruction
                assert_eq!((adj + 4) % 16, 0, "params {params:?} result {result:?}");
            }
        }
    }

    #[cfg(any(unix, windows))]
    #[test]
    fn test_compile_is_deterministic() {
        let c = compiler();
        let f = FunctionHandle::new(0x1000, false);
        let s = sig(
            ResultType::new(NativeType::SInt),
            vec![
                ParameterType::new(NativeType::SChar),
                ParameterType::new(NativeType::ULongLong),
            ],
        );
        let first = c.compile(&f, "det", &s).unwrap();
        let second = c.compile(&f, "det", &s).unwrap();
        assert_eq!(first.code(), second.code());
    }

    #[cfg(any(unix, windows))]
    #[test]
    fn test_zero_param_int_stub_bytes() {
        let c = compiler();
        let f = FunctionHandle::new(0x1000, false);
        let s = sig(ResultType::new(NativeType::SInt), vec![]);
        let stub = c.compile(&f, "zero_param", &s).unwrap();
        assert_eq!(
            stub.code(),
            &[
                0x83, 0xEC, 0x0C, // sub esp, 12
                0xB8, 0x00, 0x10, 0x00, 0x00, // mov eax, 0x1000
                0xFF, 0xD0, // call eax
                0x83, 0xC4, 0x0C, // add esp, 12
                0xC3, // ret
            ]
        );
    }

    #[cfg(any(unix, windows))]
    #[test]
    fn test_errno_capture_surrounds_result_stash() {
        let c = compiler();
        let f = FunctionHandle::new(0x2000, true);
        let s = sig(ResultType::new(NativeType::SInt), vec![]);
        let stub = c.compile(&f, "errno_stub", &s).unwrap();
        assert_eq!(
            stub.code(),
            &[
                0x83, 0xEC, 0x0C, // sub esp, 12
                0xB8, 0x00, 0x20, 0x00, 0x00, // mov eax, 0x2000
                0xFF, 0xD0, // call eax
                0x89, 0x04, 0x24, // mov [esp], eax     (stash result)
                0xB8, 0x00, 0x30, 0x00, 0x00, // mov eax, 0x3000 (errno helper)
                0xFF, 0xD0, // call eax
                0x8B, 0x04, 0x24, // mov eax, [esp]     (restore result)
                0x83, 0xC4, 0x0C, // add esp, 12
                0xC3, // ret
            ]
        );
    }

    #[cfg(any(unix, windows))]
    #[test]
    fn test_signed_byte_parameter_is_sign_extended() {
        let c = compiler();
        let f = FunctionHandle::new(0x1000, false);
        let s = sig(
            ResultType::new(NativeType::SInt),
            vec![ParameterType::new(NativeType::SChar)],
        );
        let stub = c.compile(&f, "sext8", &s).unwrap();
        // psize = 4, rsize = 4 → stackadj 12; source slot at 12 + 12
        assert!(stub.code().starts_with(&[
            0x83, 0xEC, 0x0C, // sub esp, 12
            0x0F, 0xBE, 0x44, 0x24, 0x18, // movsx eax, byte [esp+24]
            0x89, 0x04, 0x24, // mov [esp], eax
        ]));
    }

    #[cfg(any(unix, windows))]
    #[test]
    fn test_long_long_upper_half_from_narrow_carrier() {
        let c = compiler();
        let f = FunctionHandle::new(0x1000, false);

        let signed = sig(
            ResultType::new(NativeType::Void),
            vec![ParameterType::with_carrier(NativeType::SLongLong, Carrier::I32).unwrap()],
        );
        let stub = c.compile(&f, "sext64", &signed).unwrap();
        assert!(stub.code().starts_with(&[
            0x83, 0xEC, 0x0C, // sub esp, 12 (psize 8, rsize 0)
            0x8B, 0x44, 0x24, 0x18, // mov eax, [esp+24]
            0x89, 0x04, 0x24, // mov [esp], eax
            0xC1, 0xF8, 0x1F, // sar eax, 31
            0x89, 0x44, 0x24, 0x04, // mov [esp+4], eax
        ]));

        let unsigned = sig(
            ResultType::new(NativeType::Void),
            vec![ParameterType::with_carrier(NativeType::ULongLong, Carrier::I32).unwrap()],
        );
        let stub = c.compile(&f, "zext64", &unsigned).unwrap();
        assert!(stub.code().starts_with(&[
            0x83, 0xEC, 0x0C, // sub esp, 12
            0x8B, 0x44, 0x24, 0x18, // mov eax, [esp+24]
            0x89, 0x04, 0x24, // mov [esp], eax
            0xC7, 0x44, 0x24, 0x04, 0x00, 0x00, 0x00, 0x00, // mov dword [esp+4], 0
        ]));
    }

    #[cfg(any(unix, windows))]
    #[test]
    fn test_wide_result_carrier_extends_into_edx() {
        let c = compiler();
        let f = FunctionHandle::new(0x1000, false);

        let s = sig(
            ResultType::with_carrier(NativeType::SInt, Carrier::I64).unwrap(),
            vec![],
        );
        let stub = c.compile(&f, "widen_signed", &s).unwrap();
        // mov edx, eax; sar edx, 31 before the epilogue
        assert!(stub.code().ends_with(&[
            0x89, 0xC2, // mov edx, eax
            0xC1, 0xFA, 0x1F, // sar edx, 31
            0x83, 0xC4, 0x0C, // add esp, 12
            0xC3, // ret
        ]));

        let s = sig(
            ResultType::with_carrier(NativeType::Pointer, Carrier::I64).unwrap(),
            vec![],
        );
        let stub = c.compile(&f, "widen_pointer", &s).unwrap();
        assert!(stub.code().ends_with(&[
            0xBA, 0x00, 0x00, 0x00, 0x00, // mov edx, 0
            0x83, 0xC4, 0x0C, // add esp, 12
            0xC3, // ret
        ]));
    }

    #[test]
    fn test_compile_rejects_unchecked_signature() {
        let c = compiler();
        let f = FunctionHandle::new(0x1000, false);
        let s = Signature::new(
            ResultType::new(NativeType::SInt),
            vec![ParameterType::new(NativeType::SInt)],
            CallingConvention::Stdcall,
        );
        assert!(matches!(
            c.compile(&f, "bad", &s),
            Err(CompileError::UnsupportedType { .. })
        ));
    }

    #[test]
    fn test_compile_rejects_wide_address() {
        let c = compiler();
        let f = FunctionHandle::new(0x1_0000_0000, false);
        let s = sig(ResultType::new(NativeType::SInt), vec![]);
        assert!(matches!(
            c.compile(&f, "wide", &s),
            Err(CompileError::AddressOutOfRange { .. })
        ));
    }
}
