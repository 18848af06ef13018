//! Minimal x86 / x86-64 instruction emitter.
//!
//! This crate is the assembler collaborator consumed by the natcall stub
//! compilers: a linear, append-only instruction stream keyed by mnemonic and
//! typed operands (registers, base+displacement memory operands, immediates).
//! It covers exactly the instruction forms trampoline generation needs and
//! nothing else; callers never read code back, they take the finished byte
//! image with [`Assembler::code`].
//!
//! Encodings follow the Intel SDM. Every emitter method is pinned by a
//! byte-exact test at the bottom of this file.

/// Target encoding mode for an [`Assembler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// 32-bit protected mode (no REX prefixes, 4-byte native width).
    X86,
    /// 64-bit long mode (REX prefixes, 8-byte native width).
    X64,
}

/// General-purpose register.
///
/// Names use the 64-bit forms; in [`Mode::X86`] the first eight encode their
/// 32-bit counterparts (`Rax` = `eax`, ... `Rdi` = `edi`). The discriminant
/// is the hardware register number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Gpr {
    #[inline]
    fn num(self) -> u8 {
        self as u8
    }

    #[inline]
    fn low3(self) -> u8 {
        self as u8 & 7
    }
}

/// SSE register (`xmm0`..`xmm15`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Xmm {
    Xmm0 = 0,
    Xmm1 = 1,
    Xmm2 = 2,
    Xmm3 = 3,
    Xmm4 = 4,
    Xmm5 = 5,
    Xmm6 = 6,
    Xmm7 = 7,
}

impl Xmm {
    #[inline]
    fn low3(self) -> u8 {
        self as u8 & 7
    }
}

/// Operand width of a memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Word,
    Dword,
    Qword,
}

/// A `[base + disp]` memory operand with an access width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mem {
    /// Base register.
    pub base: Gpr,
    /// Signed byte displacement from the base.
    pub disp: i32,
    /// Access width.
    pub width: Width,
}

/// `byte [base + disp]`
pub fn byte_ptr(base: Gpr, disp: i32) -> Mem {
    Mem { base, disp, width: Width::Byte }
}

/// `word [base + disp]`
pub fn word_ptr(base: Gpr, disp: i32) -> Mem {
    Mem { base, disp, width: Width::Word }
}

/// `dword [base + disp]`
pub fn dword_ptr(base: Gpr, disp: i32) -> Mem {
    Mem { base, disp, width: Width::Dword }
}

/// `qword [base + disp]`
pub fn qword_ptr(base: Gpr, disp: i32) -> Mem {
    Mem { base, disp, width: Width::Qword }
}

/// A linear instruction stream for one stub.
///
/// All emitter methods append; there is no patching or label support. The
/// stub compilers only ever need straight-line code.
#[derive(Debug)]
pub struct Assembler {
    mode: Mode,
    code: Vec<u8>,
}

impl Assembler {
    /// Create an empty stream targeting `mode`.
    pub fn new(mode: Mode) -> Self {
        Assembler { mode, code: Vec::with_capacity(64) }
    }

    /// Encoding mode of this stream.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// The emitted bytes so far.
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Number of bytes emitted.
    pub fn len(&self) -> usize {
        self.code.len()
    }

    /// True if nothing has been emitted yet.
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Consume the assembler, returning the byte image.
    pub fn finish(self) -> Vec<u8> {
        self.code
    }

    /// Append a raw byte.
    pub fn emit_u8(&mut self, b: u8) {
        self.code.push(b);
    }

    /// Append a little-endian 32-bit immediate.
    pub fn emit_u32(&mut self, v: u32) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    /// Append a little-endian 64-bit immediate.
    pub fn emit_u64(&mut self, v: u64) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    // ------------------------------------------------------------------
    // Prefix / ModRM helpers
    // ------------------------------------------------------------------

    /// Emit a REX prefix if the mode and operands require one.
    ///
    /// `w` selects 64-bit operand size, `reg` extends the ModRM reg field,
    /// `rm` extends the ModRM rm (or SIB base) field. `byte_rm` forces an
    /// empty REX when the rm operand is one of the encodings 4..=7 accessed
    /// as an 8-bit register (spl/bpl/sil/dil rather than ah/ch/dh/bh).
    fn rex(&mut self, w: bool, reg: u8, rm: u8, byte_rm: bool) {
        if self.mode != Mode::X64 {
            debug_assert!(!w, "REX.W operand in 32-bit mode");
            return;
        }
        let mut b = 0x40u8;
        if w {
            b |= 0x08;
        }
        if reg >= 8 {
            b |= 0x04;
        }
        if rm >= 8 {
            b |= 0x01;
        }
        if b != 0x40 || (byte_rm && (4..8).contains(&rm)) {
            self.emit_u8(b);
        }
    }

    /// Emit ModRM (+SIB) (+displacement) for `[base + disp]` with the given
    /// reg-field value (register number or opcode extension).
    fn modrm_mem(&mut self, reg: u8, base: Gpr, disp: i32) {
        let base_enc = base.low3();
        let needs_sib = base_enc == 4;
        // [ebp]/[r13] with mod=00 means disp32-only, so always carry a disp
        let modbits: u8 = if disp == 0 && base_enc != 5 {
            0b00
        } else if (-128..=127).contains(&disp) {
            0b01
        } else {
            0b10
        };
        let rm = if needs_sib { 4 } else { base_enc };
        self.emit_u8(modbits << 6 | (reg & 7) << 3 | rm);
        if needs_sib {
            // scale=0, no index, base in the low bits
            self.emit_u8(0b00_100_000 | base_enc);
        }
        match modbits {
            0b01 => self.emit_u8(disp as i8 as u8),
            0b10 => self.emit_u32(disp as u32),
            _ => {}
        }
    }

    /// Emit ModRM for a register-direct operand.
    fn modrm_reg(&mut self, reg: u8, rm: u8) {
        self.emit_u8(0b11 << 6 | (reg & 7) << 3 | (rm & 7));
    }

    // ------------------------------------------------------------------
    // Pointer-width arithmetic (stack adjustment)
    // ------------------------------------------------------------------

    /// `sub reg, imm` at the mode's pointer width.
    pub fn sub_ri(&mut self, reg: Gpr, imm: i32) {
        self.alu_ri(5, reg, imm);
    }

    /// `add reg, imm` at the mode's pointer width.
    pub fn add_ri(&mut self, reg: Gpr, imm: i32) {
        self.alu_ri(0, reg, imm);
    }

    fn alu_ri(&mut self, ext: u8, reg: Gpr, imm: i32) {
        self.rex(self.mode == Mode::X64, 0, reg.num(), false);
        if (-128..=127).contains(&imm) {
            self.emit_u8(0x83);
            self.modrm_reg(ext, reg.low3());
            self.emit_u8(imm as i8 as u8);
        } else {
            self.emit_u8(0x81);
            self.modrm_reg(ext, reg.low3());
            self.emit_u32(imm as u32);
        }
    }

    /// `sar reg32, imm8` (arithmetic right shift).
    pub fn sar_ri32(&mut self, reg: Gpr, imm: u8) {
        self.rex(false, 0, reg.num(), false);
        self.emit_u8(0xC1);
        self.modrm_reg(7, reg.low3());
        self.emit_u8(imm);
    }

    // ------------------------------------------------------------------
    // Moves
    // ------------------------------------------------------------------

    /// `mov reg, [mem]`; the operand size comes from the memory width
    /// (`Dword` or `Qword`).
    pub fn mov_rm(&mut self, dst: Gpr, src: Mem) {
        debug_assert!(matches!(src.width, Width::Dword | Width::Qword));
        self.rex(src.width == Width::Qword, dst.num(), src.base.num(), false);
        self.emit_u8(0x8B);
        self.modrm_mem(dst.low3(), src.base, src.disp);
    }

    /// `mov [mem], reg`; the operand size comes from the memory width.
    pub fn mov_mr(&mut self, dst: Mem, src: Gpr) {
        debug_assert!(matches!(dst.width, Width::Dword | Width::Qword));
        self.rex(dst.width == Width::Qword, src.num(), dst.base.num(), false);
        self.emit_u8(0x89);
        self.modrm_mem(src.low3(), dst.base, dst.disp);
    }

    /// `mov dword [mem], imm32`.
    pub fn mov_mi32(&mut self, dst: Mem, imm: u32) {
        debug_assert_eq!(dst.width, Width::Dword);
        self.rex(false, 0, dst.base.num(), false);
        self.emit_u8(0xC7);
        self.modrm_mem(0, dst.base, dst.disp);
        self.emit_u32(imm);
    }

    /// `mov reg32, imm32`. In 64-bit mode this zero-extends into the full
    /// register.
    pub fn mov_ri32(&mut self, dst: Gpr, imm: u32) {
        self.rex(false, 0, dst.num(), false);
        self.emit_u8(0xB8 | dst.low3());
        self.emit_u32(imm);
    }

    /// `mov reg64, imm64` (64-bit mode only).
    pub fn mov_ri64(&mut self, dst: Gpr, imm: u64) {
        debug_assert_eq!(self.mode, Mode::X64);
        self.rex(true, 0, dst.num(), false);
        self.emit_u8(0xB8 | dst.low3());
        self.emit_u64(imm);
    }

    /// `mov dst32, src32`. In 64-bit mode this zero-extends the upper half.
    pub fn mov_rr32(&mut self, dst: Gpr, src: Gpr) {
        self.rex(false, src.num(), dst.num(), false);
        self.emit_u8(0x89);
        self.modrm_reg(src.low3(), dst.low3());
    }

    /// `mov dst64, src64` (64-bit mode only).
    pub fn mov_rr64(&mut self, dst: Gpr, src: Gpr) {
        debug_assert_eq!(self.mode, Mode::X64);
        self.rex(true, src.num(), dst.num(), false);
        self.emit_u8(0x89);
        self.modrm_reg(src.low3(), dst.low3());
    }

    // ------------------------------------------------------------------
    // Widening loads / register extensions
    // ------------------------------------------------------------------

    /// `movsx reg32, byte/word [mem]`.
    pub fn movsx_rm(&mut self, dst: Gpr, src: Mem) {
        self.wide_load(0xBE, 0xBF, dst, src);
    }

    /// `movzx reg32, byte/word [mem]`.
    pub fn movzx_rm(&mut self, dst: Gpr, src: Mem) {
        self.wide_load(0xB6, 0xB7, dst, src);
    }

    fn wide_load(&mut self, op8: u8, op16: u8, dst: Gpr, src: Mem) {
        let op = match src.width {
            Width::Byte => op8,
            Width::Word => op16,
            _ => unreachable!("movsx/movzx loads are byte or word"),
        };
        self.rex(false, dst.num(), src.base.num(), false);
        self.emit_u8(0x0F);
        self.emit_u8(op);
        self.modrm_mem(dst.low3(), src.base, src.disp);
    }

    /// `movsx dst32, src8` (sign-extend the low byte of `src`).
    pub fn movsx_rr8(&mut self, dst: Gpr, src: Gpr) {
        self.wide_reg(0xBE, dst, src);
    }

    /// `movzx dst32, src8`.
    pub fn movzx_rr8(&mut self, dst: Gpr, src: Gpr) {
        self.wide_reg(0xB6, dst, src);
    }

    /// `movsx dst32, src16` (sign-extend the low word of `src`).
    pub fn movsx_rr16(&mut self, dst: Gpr, src: Gpr) {
        self.wide_reg(0xBF, dst, src);
    }

    /// `movzx dst32, src16`.
    pub fn movzx_rr16(&mut self, dst: Gpr, src: Gpr) {
        self.wide_reg(0xB7, dst, src);
    }

    fn wide_reg(&mut self, op: u8, dst: Gpr, src: Gpr) {
        let byte_rm = op == 0xBE || op == 0xB6;
        self.rex(false, dst.num(), src.num(), byte_rm);
        self.emit_u8(0x0F);
        self.emit_u8(op);
        self.modrm_reg(dst.low3(), src.low3());
    }

    /// `movsxd dst64, src32` (64-bit mode only).
    pub fn movsxd_rr(&mut self, dst: Gpr, src: Gpr) {
        debug_assert_eq!(self.mode, Mode::X64);
        self.rex(true, dst.num(), src.num(), false);
        self.emit_u8(0x63);
        self.modrm_reg(dst.low3(), src.low3());
    }

    /// `cdqe`: sign-extend `eax` into `rax` (64-bit mode only).
    pub fn cdqe(&mut self) {
        debug_assert_eq!(self.mode, Mode::X64);
        self.emit_u8(0x48);
        self.emit_u8(0x98);
    }

    // ------------------------------------------------------------------
    // Control transfer
    // ------------------------------------------------------------------

    /// `call reg`: indirect near call through a register.
    pub fn call_r(&mut self, reg: Gpr) {
        self.rex(false, 0, reg.num(), false);
        self.emit_u8(0xFF);
        self.modrm_reg(2, reg.low3());
    }

    /// `ret`: near return.
    pub fn ret(&mut self) {
        self.emit_u8(0xC3);
    }

    // ------------------------------------------------------------------
    // x87 (32-bit float returns)
    // ------------------------------------------------------------------

    /// `fld dword/qword [mem]`: push a float onto the x87 stack
    /// (32-bit mode only).
    pub fn fld(&mut self, src: Mem) {
        debug_assert_eq!(self.mode, Mode::X86);
        self.x87(0, src);
    }

    /// `fstp dword/qword [mem]`: pop the x87 top of stack to memory
    /// (32-bit mode only).
    pub fn fstp(&mut self, dst: Mem) {
        debug_assert_eq!(self.mode, Mode::X86);
        self.x87(3, dst);
    }

    fn x87(&mut self, ext: u8, mem: Mem) {
        let op = match mem.width {
            Width::Dword => 0xD9,
            Width::Qword => 0xDD,
            _ => unreachable!("x87 load/store is dword or qword"),
        };
        self.emit_u8(op);
        self.modrm_mem(ext, mem.base, mem.disp);
    }

    // ------------------------------------------------------------------
    // SSE scalar moves (64-bit float returns)
    // ------------------------------------------------------------------

    /// `movss dword [mem], xmm` (64-bit mode only).
    pub fn movss_mx(&mut self, dst: Mem, src: Xmm) {
        self.sse_mov(0xF3, 0x11, src, dst);
    }

    /// `movss xmm, dword [mem]` (64-bit mode only).
    pub fn movss_xm(&mut self, dst: Xmm, src: Mem) {
        self.sse_mov(0xF3, 0x10, dst, src);
    }

    /// `movsd qword [mem], xmm` (64-bit mode only).
    pub fn movsd_mx(&mut self, dst: Mem, src: Xmm) {
        self.sse_mov(0xF2, 0x11, src, dst);
    }

    /// `movsd xmm, qword [mem]` (64-bit mode only).
    pub fn movsd_xm(&mut self, dst: Xmm, src: Mem) {
        self.sse_mov(0xF2, 0x10, dst, src);
    }

    fn sse_mov(&mut self, prefix: u8, op: u8, xmm: Xmm, mem: Mem) {
        debug_assert_eq!(self.mode, Mode::X64);
        self.emit_u8(prefix);
        self.rex(false, xmm as u8, mem.base.num(), false);
        self.emit_u8(0x0F);
        self.emit_u8(op);
        self.modrm_mem(xmm.low3(), mem.base, mem.disp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::Gpr::*;
    use super::Xmm::*;

    fn asm32() -> Assembler {
        Assembler::new(Mode::X86)
    }

    fn asm64() -> Assembler {
        Assembler::new(Mode::X64)
    }

    #[test]
    fn test_sub_add_esp() {
        let mut a = asm32();
        a.sub_ri(Rsp, 0x28);
        a.add_ri(Rsp, 0x28);
        assert_eq!(a.code(), &[0x83, 0xEC, 0x28, 0x83, 0xC4, 0x28]);

        let mut a = asm32();
        a.sub_ri(Rsp, 0x1000);
        assert_eq!(a.code(), &[0x81, 0xEC, 0x00, 0x10, 0x00, 0x00]);
    }

    #[test]
    fn test_mov_loads_and_stores() {
        let mut a = asm32();
        a.mov_rm(Rax, dword_ptr(Rsp, 0x10));
        assert_eq!(a.code(), &[0x8B, 0x44, 0x24, 0x10]);

        let mut a = asm32();
        a.mov_rm(Rax, dword_ptr(Rsp, 0x100));
        assert_eq!(a.code(), &[0x8B, 0x84, 0x24, 0x00, 0x01, 0x00, 0x00]);

        let mut a = asm32();
        a.mov_mr(dword_ptr(Rsp, 8), Rax);
        assert_eq!(a.code(), &[0x89, 0x44, 0x24, 0x08]);

        // zero displacement drops the disp byte
        let mut a = asm32();
        a.mov_mr(dword_ptr(Rsp, 0), Rax);
        assert_eq!(a.code(), &[0x89, 0x04, 0x24]);
    }

    #[test]
    fn test_ebp_base_keeps_displacement() {
        // [ebp] with mod=00 would mean disp32-only addressing
        let mut a = asm32();
        a.mov_rm(Rax, dword_ptr(Rbp, 0));
        assert_eq!(a.code(), &[0x8B, 0x45, 0x00]);
    }

    #[test]
    fn test_widening_loads() {
        let mut a = asm32();
        a.movsx_rm(Rax, byte_ptr(Rsp, 4));
        assert_eq!(a.code(), &[0x0F, 0xBE, 0x44, 0x24, 0x04]);

        let mut a = asm32();
        a.movzx_rm(Rax, word_ptr(Rsp, 4));
        assert_eq!(a.code(), &[0x0F, 0xB7, 0x44, 0x24, 0x04]);
    }

    #[test]
    fn test_register_extensions() {
        let mut a = asm32();
        a.movsx_rr8(Rax, Rax); // movsx eax, al
        a.movzx_rr16(Rax, Rax); // movzx eax, ax
        assert_eq!(a.code(), &[0x0F, 0xBE, 0xC0, 0x0F, 0xB7, 0xC0]);
    }

    #[test]
    fn test_imm_moves() {
        let mut a = asm32();
        a.mov_ri32(Rax, 0x12345678);
        assert_eq!(a.code(), &[0xB8, 0x78, 0x56, 0x34, 0x12]);

        let mut a = asm32();
        a.mov_mi32(dword_ptr(Rsp, 4), 0);
        assert_eq!(a.code(), &[0xC7, 0x44, 0x24, 0x04, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_sar_call_ret() {
        let mut a = asm32();
        a.sar_ri32(Rax, 31);
        a.sar_ri32(Rdx, 31);
        a.call_r(Rax);
        a.ret();
        assert_eq!(
            a.code(),
            &[0xC1, 0xF8, 0x1F, 0xC1, 0xFA, 0x1F, 0xFF, 0xD0, 0xC3]
        );
    }

    #[test]
    fn test_x87_moves() {
        let mut a = asm32();
        a.fstp(dword_ptr(Rsp, 0));
        a.fstp(qword_ptr(Rsp, 0));
        a.fld(dword_ptr(Rsp, 0));
        a.fld(qword_ptr(Rsp, 0));
        assert_eq!(
            a.code(),
            &[
                0xD9, 0x1C, 0x24, // fstp dword [esp]
                0xDD, 0x1C, 0x24, // fstp qword [esp]
                0xD9, 0x04, 0x24, // fld dword [esp]
                0xDD, 0x04, 0x24, // fld qword [esp]
            ]
        );
    }

    #[test]
    fn test_x64_mov_imm64() {
        let mut a = asm64();
        a.mov_ri64(Rax, 0x1122334455667788);
        assert_eq!(
            a.code(),
            &[0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
    }

    #[test]
    fn test_x64_reg_moves() {
        let mut a = asm64();
        a.mov_rr64(Rdi, Rdx); // mov rdi, rdx
        a.mov_rr32(Rdi, Rdx); // mov edi, edx
        a.mov_rr64(Rdx, R8); // mov rdx, r8
        assert_eq!(
            a.code(),
            &[0x48, 0x89, 0xD7, 0x89, 0xD7, 0x4C, 0x89, 0xC2]
        );
    }

    #[test]
    fn test_x64_extensions() {
        let mut a = asm64();
        a.movsxd_rr(Rdi, Rdx); // movsxd rdi, edx
        a.movsx_rr8(Rdi, Rdx); // movsx edi, dl
        a.movsx_rr8(Rdi, R8); // movsx edi, r8b
        a.movzx_rr16(Rcx, R9); // movzx ecx, r9w
        a.cdqe();
        assert_eq!(
            a.code(),
            &[
                0x48, 0x63, 0xFA, // movsxd rdi, edx
                0x0F, 0xBE, 0xFA, // movsx edi, dl
                0x41, 0x0F, 0xBE, 0xF8, // movsx edi, r8b
                0x41, 0x0F, 0xB7, 0xC9, // movzx ecx, r9w
                0x48, 0x98, // cdqe
            ]
        );
    }

    #[test]
    fn test_x64_byte_source_needs_rex() {
        // sil as a byte source is only reachable with a REX prefix;
        // without one the encoding would mean dh
        let mut a = asm64();
        a.movsx_rr8(Rax, Rsi);
        assert_eq!(a.code(), &[0x40, 0x0F, 0xBE, 0xC6]);
    }

    #[test]
    fn test_x64_stack_frame() {
        let mut a = asm64();
        a.sub_ri(Rsp, 8);
        a.mov_mr(qword_ptr(Rsp, 0), Rax);
        a.mov_rm(Rax, qword_ptr(Rsp, 0));
        a.add_ri(Rsp, 8);
        assert_eq!(
            a.code(),
            &[
                0x48, 0x83, 0xEC, 0x08, // sub rsp, 8
                0x48, 0x89, 0x04, 0x24, // mov [rsp], rax
                0x48, 0x8B, 0x04, 0x24, // mov rax, [rsp]
                0x48, 0x83, 0xC4, 0x08, // add rsp, 8
            ]
        );
    }

    #[test]
    fn test_x64_calls() {
        let mut a = asm64();
        a.call_r(Rax);
        a.call_r(R10);
        assert_eq!(a.code(), &[0xFF, 0xD0, 0x41, 0xFF, 0xD2]);
    }

    #[test]
    fn test_x64_sse_moves() {
        let mut a = asm64();
        a.movsd_mx(qword_ptr(Rsp, 0), Xmm0);
        a.movsd_xm(Xmm0, qword_ptr(Rsp, 8));
        a.movss_mx(dword_ptr(Rsp, 0), Xmm0);
        a.movss_xm(Xmm0, dword_ptr(Rsp, 0));
        assert_eq!(
            a.code(),
            &[
                0xF2, 0x0F, 0x11, 0x04, 0x24, // movsd [rsp], xmm0
                0xF2, 0x0F, 0x10, 0x44, 0x24, 0x08, // movsd xmm0, [rsp+8]
                0xF3, 0x0F, 0x11, 0x04, 0x24, // movss [rsp], xmm0
                0xF3, 0x0F, 0x10, 0x04, 0x24, // movss xmm0, [rsp]
            ]
        );
    }

    #[test]
    fn test_negative_displacement() {
        let mut a = asm64();
        a.mov_rm(Rax, qword_ptr(Rbp, -16));
        assert_eq!(a.code(), &[0x48, 0x8B, 0x45, 0xF0]);
    }
}
