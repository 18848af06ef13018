//! Stub compiler for 64-bit x86 (SysV).
//!
//! Arguments arrive in registers on both sides of the managed boundary, so
//! marshalling is a register shuffle: the two pointer-sized dispatch slots
//! occupy the first two integer argument registers, shifting every integer
//! carrier down two positions, while float carriers already sit in the xmm
//! registers the native convention wants.

use std::sync::Arc;

use natcall_asm::{byte_ptr, dword_ptr, qword_ptr, word_ptr, Assembler, Gpr, Mode, Xmm};

use super::{align, StubCompiler, TargetArch};
use crate::code::{Stub, StubTable};
use crate::error::CompileError;
use crate::types::{
    Carrier, CallingConvention, FunctionHandle, NativeType, ParameterType, ResultType, Signature,
};

/// Integer argument registers as the managed caller fills them, after the
/// environment and receiver slots in `rdi`/`rsi`.
const MANAGED_INT_REGS: [Gpr; 4] = [Gpr::Rdx, Gpr::Rcx, Gpr::R8, Gpr::R9];

/// Integer argument registers the native convention expects.
const NATIVE_INT_REGS: [Gpr; 4] = [Gpr::Rdi, Gpr::Rsi, Gpr::Rdx, Gpr::Rcx];

/// Register budget: six SysV integer argument registers minus the two
/// dispatch slots. Larger signatures fall back to the generic path rather
/// than risking a miscompiled stack spill.
const MAX_INT_PARAMS: usize = 4;

/// All eight SysV float argument registers are usable; they need no shift.
const MAX_FLOAT_PARAMS: usize = 8;

/// Stub compiler for x86-64 SysV.
pub struct X86_64StubCompiler {
    errno_function: u64,
}

impl X86_64StubCompiler {
    /// A compiler embedding this process's errno-capture helper.
    pub fn host() -> Self {
        X86_64StubCompiler { errno_function: crate::errno::save_errno_address() }
    }

    /// A compiler embedding an explicit errno-capture helper address.
    pub fn with_errno_function(errno_function: u64) -> Self {
        X86_64StubCompiler { errno_function }
    }

    fn unsupported(&self, reason: impl Into<String>) -> CompileError {
        CompileError::UnsupportedType { arch: self.arch().name(), reason: reason.into() }
    }
}

impl StubCompiler for X86_64StubCompiler {
    fn arch(&self) -> TargetArch {
        TargetArch::X86_64
    }

    fn can_compile(
        &self,
        result: &ResultType,
        params: &[ParameterType],
        convention: CallingConvention,
    ) -> bool {
        if convention != CallingConvention::Default {
            return false;
        }
        if result.kind().primitive().is_none() {
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
        icount <= MAX_INT_PARAMS && fcount <= MAX_FLOAT_PARAMS
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

        // scratch for the errno stash; entry leaves rsp 8 past a 16-byte
        // boundary, so the reservation restores call-site alignment
        let rsize: i32 = if rt == NativeType::Void { 0 } else { 8 };
        let stackadj = align(rsize + 8, 16) - 8;

        let mut a = Assembler::new(Mode::X64);
        a.sub_ri(Gpr::Rsp, stackadj);

        let mut ireg = 0usize;
        for &(t, carrier) in &kinds {
            match t {
                // float carriers already occupy xmm0.. in native order
                NativeType::Float | NativeType::Double => {}
                _ => {
                    let src = MANAGED_INT_REGS[ireg];
                    let dst = NATIVE_INT_REGS[ireg];
                    ireg += 1;
                    match t {
                        NativeType::SChar => a.movsx_rr8(dst, src),
                        NativeType::UChar => a.movzx_rr8(dst, src),
                        NativeType::SShort => a.movsx_rr16(dst, src),
                        NativeType::UShort => a.movzx_rr16(dst, src),
                        NativeType::SInt | NativeType::UInt => a.mov_rr32(dst, src),
                        NativeType::SLong
                        | NativeType::ULong
                        | NativeType::SLongLong
                        | NativeType::ULongLong
                        | NativeType::Pointer => {
                            if carrier == Carrier::I64 {
                                a.mov_rr64(dst, src);
                            } else if t.is_signed() {
                                // sign-extend a 32-bit carrier
                                a.movsxd_rr(dst, src);
                            } else {
                                // 32-bit mov zero-extends
                                a.mov_rr32(dst, src);
                            }
                        }
                        // rejected by the capability check above
                        NativeType::Void | NativeType::Float | NativeType::Double => {}
                    }
                }
            }
        }

        // absolute call through a scratch register
        a.mov_ri64(Gpr::Rax, function.address());
        a.call_r(Gpr::Rax);

        if function.save_errno() {
            // stash the raw result, capture errno while it is still valid,
            // then restore the return register
            match rt {
                NativeType::Float => a.movss_mx(dword_ptr(Gpr::Rsp, 0), Xmm::Xmm0),
                NativeType::Double => a.movsd_mx(qword_ptr(Gpr::Rsp, 0), Xmm::Xmm0),
                NativeType::Void => {}
                _ => a.mov_mr(qword_ptr(Gpr::Rsp, 0), Gpr::Rax),
            }

            a.mov_ri64(Gpr::Rax, self.errno_function);
            a.call_r(Gpr::Rax);

            match rt {
                NativeType::Float => a.movss_xm(Xmm::Xmm0, dword_ptr(Gpr::Rsp, 0)),
                NativeType::Double => a.movsd_xm(Xmm::Xmm0, qword_ptr(Gpr::Rsp, 0)),
                NativeType::SChar => a.movsx_rm(Gpr::Rax, byte_ptr(Gpr::Rsp, 0)),
                NativeType::UChar => a.movzx_rm(Gpr::Rax, byte_ptr(Gpr::Rsp, 0)),
                NativeType::SShort => a.movsx_rm(Gpr::Rax, word_ptr(Gpr::Rsp, 0)),
                NativeType::UShort => a.movzx_rm(Gpr::Rax, word_ptr(Gpr::Rsp, 0)),
                NativeType::SInt | NativeType::UInt => {
                    a.mov_rm(Gpr::Rax, dword_ptr(Gpr::Rsp, 0));
                }
                NativeType::Void => {}
                _ => a.mov_rm(Gpr::Rax, qword_ptr(Gpr::Rsp, 0)),
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
            // widen a 32-bit native result to the full register
            match rt {
                NativeType::SChar | NativeType::SShort | NativeType::SInt => a.cdqe(),
                NativeType::UChar | NativeType::UShort | NativeType::UInt => {
                    a.mov_rr32(Gpr::Rax, Gpr::Rax);
                }
                _ => {}
            }
        }

        // restore rsp to its exact entry value and return
        a.add_ri(Gpr::Rsp, stackadj);
        a.ret();

        let stub = Arc::new(Stub::new(name, signature.clone(), a.finish())?);
        StubTable::global().append(stub.clone());
        Ok(stub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compiler() -> X86_64StubCompiler {
        X86_64StubCompiler::with_errno_function(0x3000)
    }

    fn sig(result: ResultType, params: Vec<ParameterType>) -> Signature {
        Signature::new(result, params, CallingConvention::Default)
    }

    #[test]
    fn test_register_budget() {
        let c = compiler();

        let four_ints = sig(
            ResultType::new(NativeType::SInt),
            vec![ParameterType::new(NativeType::SInt); 4],
        );
        assert!(c.can_compile(four_ints.result(), four_ints.parameters(), four_ints.convention()));

        let five_ints = sig(
            ResultType::new(NativeType::SInt),
            vec![ParameterType::new(NativeType::SInt); 5],
        );
        assert!(!c.can_compile(five_ints.result(), five_ints.parameters(), five_ints.convention()));

        let eight_floats = sig(
            ResultType::new(NativeType::Double),
            vec![ParameterType::new(NativeType::Double); 8],
        );
        assert!(c.can_compile(
            eight_floats.result(),
            eight_floats.parameters(),
            eight_floats.convention()
        ));

        let nine_floats = sig(
            ResultType::new(NativeType::Double),
            vec![ParameterType::new(NativeType::Double); 9],
        );
        assert!(!c.can_compile(
            nine_floats.result(),
            nine_floats.parameters(),
            nine_floats.convention()
        ));

        // floats do not consume the integer budget
        let mut mixed = vec![ParameterType::new(NativeType::Double); 6];
        mixed.extend(vec![ParameterType::new(NativeType::SInt); 4]);
        let mixed = sig(ResultType::new(NativeType::SInt), mixed);
        assert!(c.can_compile(mixed.result(), mixed.parameters(), mixed.convention()));
    }

    #[test]
    fn test_can_compile_rejects_stdcall() {
        let c = compiler();
        let s = Signature::new(
            ResultType::new(NativeType::SInt),
            vec![],
            CallingConvention::Stdcall,
        );
        assert!(!c.can_compile(s.result(), s.parameters(), s.convention()));
    }

    #[cfg(any(unix, windows))]
    #[test]
    fn test_zero_param_stub_bytes() {
        let c = compiler();
        let f = FunctionHandle::new(0x1122_3344_5566_7788, false);
        let s = sig(ResultType::new(NativeType::UInt), vec![]);
        let stub = c.compile(&f, "zero_param", &s).unwrap();
        assert_eq!(
            stub.code(),
            &[
                0x48, 0x83, 0xEC, 0x08, // sub rsp, 8
                0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, // mov rax, fn
                0xFF, 0xD0, // call rax
                0x48, 0x83, 0xC4, 0x08, // add rsp, 8
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
        assert!(stub.code().starts_with(&[
            0x48, 0x83, 0xEC, 0x08, // sub rsp, 8
            0x0F, 0xBE, 0xFA, // movsx edi, dl
        ]));
    }

    #[cfg(any(unix, windows))]
    #[test]
    fn test_integer_registers_shift_past_floats() {
        let c = compiler();
        let f = FunctionHandle::new(0x1000, false);
        let s = sig(
            ResultType::new(NativeType::SInt),
            vec![
                ParameterType::new(NativeType::SInt),
                ParameterType::new(NativeType::Double),
                ParameterType::new(NativeType::SInt),
            ],
        );
        let stub = c.compile(&f, "mixed", &s).unwrap();
        // int args shuffle rdx→rdi and rcx→rsi; the double rides xmm0
        assert!(stub.code().starts_with(&[
            0x48, 0x83, 0xEC, 0x08, // sub rsp, 8
            0x89, 0xD7, // mov edi, edx
            0x89, 0xCE, // mov esi, ecx
        ]));
    }

    #[cfg(any(unix, windows))]
    #[test]
    fn test_narrow_carrier_into_wide_native() {
        let c = compiler();
        let f = FunctionHandle::new(0x1000, false);

        let signed = sig(
            ResultType::new(NativeType::Void),
            vec![ParameterType::with_carrier(NativeType::SLongLong, Carrier::I32).unwrap()],
        );
        let stub = c.compile(&f, "sext64", &signed).unwrap();
        assert!(stub.code().starts_with(&[
            0x48, 0x83, 0xEC, 0x08, // sub rsp, 8
            0x48, 0x63, 0xFA, // movsxd rdi, edx
        ]));

        let unsigned = sig(
            ResultType::new(NativeType::Void),
            vec![ParameterType::with_carrier(NativeType::ULongLong, Carrier::I32).unwrap()],
        );
        let stub = c.compile(&f, "zext64", &unsigned).unwrap();
        assert!(stub.code().starts_with(&[
            0x48, 0x83, 0xEC, 0x08, // sub rsp, 8
            0x89, 0xD7, // mov edi, edx (zero-extends)
        ]));
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
                0x48, 0x83, 0xEC, 0x08, // sub rsp, 8
                0x48, 0xB8, 0x00, 0x20, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // mov rax, fn
                0xFF, 0xD0, // call rax
                0x48, 0x89, 0x04, 0x24, // mov [rsp], rax      (stash result)
                0x48, 0xB8, 0x00, 0x30, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // mov rax, errno
                0xFF, 0xD0, // call rax
                0x8B, 0x04, 0x24, // mov eax, [rsp]            (restore result)
                0x48, 0x83, 0xC4, 0x08, // add rsp, 8
                0xC3, // ret
            ]
        );
    }

    #[cfg(any(unix, windows))]
    #[test]
    fn test_compile_is_deterministic() {
        let c = compiler();
        let f = FunctionHandle::new(0x4000, true);
        let s = sig(
            ResultType::with_carrier(NativeType::UInt, Carrier::I64).unwrap(),
            vec![
                ParameterType::new(NativeType::Pointer),
                ParameterType::new(NativeType::Double),
            ],
        );
        let first = c.compile(&f, "det", &s).unwrap();
        let second = c.compile(&f, "det", &s).unwrap();
        assert_eq!(first.code(), second.code());
    }

    #[test]
    fn test_compile_rejects_unchecked_signature() {
        let c = compiler();
        let f = FunctionHandle::new(0x1000, false);
        let s = sig(
            ResultType::new(NativeType::SInt),
            vec![ParameterType::new(NativeType::SInt); 5],
        );
        assert!(matches!(
            c.compile(&f, "over_budget", &s),
            Err(CompileError::UnsupportedType { .. })
        ));
    }
}
