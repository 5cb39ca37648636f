//! The x64 code stream. Uses [iced_x86] to assemble operations.
//!
//! This is the boundary between the backend core and the raw encoder: the register
//! allocator and the per-opcode emitters push named mnemonics with named operands, and
//! [CodeStream::finalize] turns the buffered operations into executable bytes.
//!
//! There is deliberately no label or relocation machinery here: a compiled block is a
//! straight-line run of operations ending in a return to the dispatcher, so every
//! operation can be encoded at a known offset in one pass.

use crate::x64::jitstate;
use crate::x64::regs::Reg;
use crate::CompilationError;
use iced_x86::{Code, IcedError, Instruction as Op, MemoryOperand, Register};
use libc::{mmap, munmap, MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_EXEC, PROT_READ, PROT_WRITE};
use std::ffi::c_void;

/// An operand for an instruction that accepts either a register or a spill-slot
/// memory reference. Immediates are not expressible: the allocator materialises them
/// into registers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpArg {
    Reg(Reg),
    /// `[r15 + spill_base + slot * SPILL_SLOT_SIZE]`.
    Spill(u8),
}

impl OpArg {
    pub fn reg(&self) -> Reg {
        match self {
            OpArg::Reg(r) => *r,
            OpArg::Spill(i) => panic!("spill slot {i} is not a register"),
        }
    }
}

fn spill_mem(slot: u8) -> MemoryOperand {
    MemoryOperand::with_base_displ(Register::R15, jitstate::spill_offset(slot))
}

fn state_mem(off: i64) -> MemoryOperand {
    MemoryOperand::with_base_displ(Register::R15, off)
}

#[derive(Debug, Default)]
pub struct CodeStream {
    ops: Vec<Op>,
}

impl CodeStream {
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    fn push(&mut self, op: Result<Op, IcedError>) {
        self.ops.push(op.unwrap());
    }

    // -- Movement primitives --

    /// 64-bit integer move between GPRs and/or spill slots. Both operands in memory is
    /// caller error.
    pub fn mov64(&mut self, to: OpArg, from: OpArg) {
        match (to, from) {
            (OpArg::Reg(t), OpArg::Reg(f)) => {
                self.push(Op::with2(Code::Mov_r64_rm64, t.to_reg64(), f.to_reg64()))
            }
            (OpArg::Reg(t), OpArg::Spill(f)) => {
                self.push(Op::with2(Code::Mov_r64_rm64, t.to_reg64(), spill_mem(f)))
            }
            (OpArg::Spill(t), OpArg::Reg(f)) => {
                self.push(Op::with2(Code::Mov_rm64_r64, spill_mem(t), f.to_reg64()))
            }
            (OpArg::Spill(_), OpArg::Spill(_)) => panic!("mov64 between two spill slots"),
        }
    }

    /// Full-width vector move.
    pub fn movaps(&mut self, to: Reg, from: Reg) {
        self.push(Op::with2(
            Code::Movaps_xmm_xmmm128,
            to.to_xmm(),
            from.to_xmm(),
        ));
    }

    /// Scalar double move between a vector register and a spill slot (low 64 bits).
    pub fn movsd(&mut self, to: OpArg, from: OpArg) {
        match (to, from) {
            (OpArg::Reg(t), OpArg::Spill(f)) => {
                self.push(Op::with2(Code::Movsd_xmm_xmmm64, t.to_xmm(), spill_mem(f)))
            }
            (OpArg::Spill(t), OpArg::Reg(f)) => {
                self.push(Op::with2(Code::Movsd_xmmm64_xmm, spill_mem(t), f.to_xmm()))
            }
            _ => panic!("movsd is only used between a vector register and a spill slot"),
        }
    }

    /// Atomic 64-bit GPR exchange.
    pub fn xchg64(&mut self, a: Reg, b: Reg) {
        self.push(Op::with2(Code::Xchg_rm64_r64, a.to_reg64(), b.to_reg64()));
    }

    pub fn mov_imm64(&mut self, to: Reg, imm: u64) {
        self.push(Op::with2(Code::Mov_r64_imm64, to.to_reg64(), imm));
    }

    /// `xor r32, r32`: the short zero idiom (also zero-extends to 64 bits).
    pub fn xor32(&mut self, to: Reg, from: Reg) {
        self.push(Op::with2(Code::Xor_r32_rm32, to.to_reg32(), from.to_reg32()));
    }

    // -- Guest state accesses --

    pub fn mov64_from_state(&mut self, to: Reg, off: i64) {
        self.push(Op::with2(Code::Mov_r64_rm64, to.to_reg64(), state_mem(off)));
    }

    pub fn mov64_to_state(&mut self, off: i64, from: Reg) {
        self.push(Op::with2(Code::Mov_rm64_r64, state_mem(off), from.to_reg64()));
    }

    // -- ALU --

    pub fn add32(&mut self, to: Reg, from: Reg) {
        self.push(Op::with2(Code::Add_r32_rm32, to.to_reg32(), from.to_reg32()));
    }

    pub fn add64(&mut self, to: Reg, from: Reg) {
        self.push(Op::with2(Code::Add_r64_rm64, to.to_reg64(), from.to_reg64()));
    }

    pub fn sub32(&mut self, to: Reg, from: Reg) {
        self.push(Op::with2(Code::Sub_r32_rm32, to.to_reg32(), from.to_reg32()));
    }

    pub fn sub64(&mut self, to: Reg, from: Reg) {
        self.push(Op::with2(Code::Sub_r64_rm64, to.to_reg64(), from.to_reg64()));
    }

    pub fn imul32(&mut self, to: Reg, from: Reg) {
        self.push(Op::with2(Code::Imul_r32_rm32, to.to_reg32(), from.to_reg32()));
    }

    pub fn imul64(&mut self, to: Reg, from: Reg) {
        self.push(Op::with2(Code::Imul_r64_rm64, to.to_reg64(), from.to_reg64()));
    }

    pub fn and32(&mut self, to: Reg, from: Reg) {
        self.push(Op::with2(Code::And_r32_rm32, to.to_reg32(), from.to_reg32()));
    }

    pub fn and64(&mut self, to: Reg, from: Reg) {
        self.push(Op::with2(Code::And_r64_rm64, to.to_reg64(), from.to_reg64()));
    }

    pub fn or32(&mut self, to: Reg, from: Reg) {
        self.push(Op::with2(Code::Or_r32_rm32, to.to_reg32(), from.to_reg32()));
    }

    pub fn or64(&mut self, to: Reg, from: Reg) {
        self.push(Op::with2(Code::Or_r64_rm64, to.to_reg64(), from.to_reg64()));
    }

    pub fn xor64(&mut self, to: Reg, from: Reg) {
        self.push(Op::with2(Code::Xor_r64_rm64, to.to_reg64(), from.to_reg64()));
    }

    pub fn not32(&mut self, reg: Reg) {
        self.push(Op::with1(Code::Not_rm32, reg.to_reg32()));
    }

    pub fn not64(&mut self, reg: Reg) {
        self.push(Op::with1(Code::Not_rm64, reg.to_reg64()));
    }

    pub fn and32_imm8(&mut self, reg: Reg, imm: u8) {
        self.push(Op::with2(Code::And_rm32_imm8, reg.to_reg32(), i32::from(imm)));
    }

    pub fn add64_imm(&mut self, reg: Reg, imm: u8) {
        self.push(Op::with2(Code::Add_rm64_imm8, reg.to_reg64(), i32::from(imm)));
    }

    pub fn sub64_imm(&mut self, reg: Reg, imm: u8) {
        self.push(Op::with2(Code::Sub_rm64_imm8, reg.to_reg64(), i32::from(imm)));
    }

    // -- Shifts and rotates --

    pub fn shl32_imm(&mut self, reg: Reg, imm: u8) {
        self.push(Op::with2(Code::Shl_rm32_imm8, reg.to_reg32(), u32::from(imm)));
    }

    pub fn shl64_imm(&mut self, reg: Reg, imm: u8) {
        self.push(Op::with2(Code::Shl_rm64_imm8, reg.to_reg64(), u32::from(imm)));
    }

    pub fn shr32_imm(&mut self, reg: Reg, imm: u8) {
        self.push(Op::with2(Code::Shr_rm32_imm8, reg.to_reg32(), u32::from(imm)));
    }

    pub fn shr64_imm(&mut self, reg: Reg, imm: u8) {
        self.push(Op::with2(Code::Shr_rm64_imm8, reg.to_reg64(), u32::from(imm)));
    }

    pub fn sar32_imm(&mut self, reg: Reg, imm: u8) {
        self.push(Op::with2(Code::Sar_rm32_imm8, reg.to_reg32(), u32::from(imm)));
    }

    pub fn sar64_imm(&mut self, reg: Reg, imm: u8) {
        self.push(Op::with2(Code::Sar_rm64_imm8, reg.to_reg64(), u32::from(imm)));
    }

    pub fn ror16_imm(&mut self, reg: Reg, imm: u8) {
        self.push(Op::with2(Code::Ror_rm16_imm8, reg.to_reg16(), u32::from(imm)));
    }

    pub fn ror32_imm(&mut self, reg: Reg, imm: u8) {
        self.push(Op::with2(Code::Ror_rm32_imm8, reg.to_reg32(), u32::from(imm)));
    }

    pub fn ror64_imm(&mut self, reg: Reg, imm: u8) {
        self.push(Op::with2(Code::Ror_rm64_imm8, reg.to_reg64(), u32::from(imm)));
    }

    /// Shift count in `CL`.
    pub fn shl64_cl(&mut self, reg: Reg) {
        self.push(Op::with2(Code::Shl_rm64_CL, reg.to_reg64(), Register::CL));
    }

    pub fn shr64_cl(&mut self, reg: Reg) {
        self.push(Op::with2(Code::Shr_rm64_CL, reg.to_reg64(), Register::CL));
    }

    pub fn sar64_cl(&mut self, reg: Reg) {
        self.push(Op::with2(Code::Sar_rm64_CL, reg.to_reg64(), Register::CL));
    }

    pub fn ror32_cl(&mut self, reg: Reg) {
        self.push(Op::with2(Code::Ror_rm32_CL, reg.to_reg32(), Register::CL));
    }

    pub fn ror64_cl(&mut self, reg: Reg) {
        self.push(Op::with2(Code::Ror_rm64_CL, reg.to_reg64(), Register::CL));
    }

    // -- Widening moves --

    /// `mov r32, r32/m32`: implicit zero extension to 64 bits.
    pub fn mov32(&mut self, to: Reg, from: OpArg) {
        match from {
            OpArg::Reg(f) => self.push(Op::with2(Code::Mov_r32_rm32, to.to_reg32(), f.to_reg32())),
            OpArg::Spill(f) => self.push(Op::with2(Code::Mov_r32_rm32, to.to_reg32(), spill_mem(f))),
        }
    }

    pub fn movzx32_8(&mut self, to: Reg, from: OpArg) {
        match from {
            OpArg::Reg(f) => {
                self.push(Op::with2(Code::Movzx_r32_rm8, to.to_reg32(), f.to_reg8()))
            }
            OpArg::Spill(f) => self.push(Op::with2(Code::Movzx_r32_rm8, to.to_reg32(), spill_mem(f))),
        }
    }

    pub fn movzx32_16(&mut self, to: Reg, from: OpArg) {
        match from {
            OpArg::Reg(f) => {
                self.push(Op::with2(Code::Movzx_r32_rm16, to.to_reg32(), f.to_reg16()))
            }
            OpArg::Spill(f) => {
                self.push(Op::with2(Code::Movzx_r32_rm16, to.to_reg32(), spill_mem(f)))
            }
        }
    }

    pub fn movsx32_8(&mut self, to: Reg, from: OpArg) {
        match from {
            OpArg::Reg(f) => {
                self.push(Op::with2(Code::Movsx_r32_rm8, to.to_reg32(), f.to_reg8()))
            }
            OpArg::Spill(f) => self.push(Op::with2(Code::Movsx_r32_rm8, to.to_reg32(), spill_mem(f))),
        }
    }

    pub fn movsx32_16(&mut self, to: Reg, from: OpArg) {
        match from {
            OpArg::Reg(f) => {
                self.push(Op::with2(Code::Movsx_r32_rm16, to.to_reg32(), f.to_reg16()))
            }
            OpArg::Spill(f) => {
                self.push(Op::with2(Code::Movsx_r32_rm16, to.to_reg32(), spill_mem(f)))
            }
        }
    }

    pub fn movsx64_8(&mut self, to: Reg, from: OpArg) {
        match from {
            OpArg::Reg(f) => {
                self.push(Op::with2(Code::Movsx_r64_rm8, to.to_reg64(), f.to_reg8()))
            }
            OpArg::Spill(f) => self.push(Op::with2(Code::Movsx_r64_rm8, to.to_reg64(), spill_mem(f))),
        }
    }

    pub fn movsx64_16(&mut self, to: Reg, from: OpArg) {
        match from {
            OpArg::Reg(f) => {
                self.push(Op::with2(Code::Movsx_r64_rm16, to.to_reg64(), f.to_reg16()))
            }
            OpArg::Spill(f) => {
                self.push(Op::with2(Code::Movsx_r64_rm16, to.to_reg64(), spill_mem(f)))
            }
        }
    }

    pub fn movsxd64_32(&mut self, to: Reg, from: OpArg) {
        match from {
            OpArg::Reg(f) => {
                self.push(Op::with2(Code::Movsxd_r64_rm32, to.to_reg64(), f.to_reg32()))
            }
            OpArg::Spill(f) => {
                self.push(Op::with2(Code::Movsxd_r64_rm32, to.to_reg64(), spill_mem(f)))
            }
        }
    }

    // -- Misc --

    pub fn bswap32(&mut self, reg: Reg) {
        self.push(Op::with1(Code::Bswap_r32, reg.to_reg32()));
    }

    pub fn bswap64(&mut self, reg: Reg) {
        self.push(Op::with1(Code::Bswap_r64, reg.to_reg64()));
    }

    pub fn cmp8_imm(&mut self, reg: Reg, imm: u8) {
        self.push(Op::with2(Code::Cmp_rm8_imm8, reg.to_reg8(), i32::from(imm)));
    }

    pub fn cmovae64(&mut self, to: Reg, from: Reg) {
        self.push(Op::with2(Code::Cmovae_r64_rm64, to.to_reg64(), from.to_reg64()));
    }

    pub fn cmove64(&mut self, to: Reg, from: Reg) {
        self.push(Op::with2(Code::Cmove_r64_rm64, to.to_reg64(), from.to_reg64()));
    }

    pub fn test64(&mut self, a: Reg, b: Reg) {
        self.push(Op::with2(Code::Test_rm64_r64, a.to_reg64(), b.to_reg64()));
    }

    pub fn call_reg(&mut self, reg: Reg) {
        self.push(Op::with1(Code::Call_rm64, reg.to_reg64()));
    }

    pub fn ret(&mut self) {
        self.push(Ok(Op::with(Code::Retnq)));
    }

    pub fn push64(&mut self, reg: Reg) {
        self.push(Op::with1(Code::Push_r64, reg.to_reg64()));
    }

    pub fn pop64(&mut self, reg: Reg) {
        self.push(Op::with1(Code::Pop_r64, reg.to_reg64()));
    }

    /// Render the buffered operations as a NASM-style listing.
    pub fn disasm(&self) -> String {
        use iced_x86::Formatter;
        let mut fmtr = iced_x86::NasmFormatter::new();
        fmtr.options_mut().set_hex_prefix("0x");
        fmtr.options_mut().set_hex_suffix("");
        fmtr.options_mut().set_space_after_operand_separator(true);
        let mut out = Vec::with_capacity(self.ops.len());
        for op in &self.ops {
            let mut s = String::new();
            fmtr.format(op, &mut s);
            out.push(s);
        }
        out.join("\n")
    }

    /// Encode the buffered operations into a fresh executable buffer.
    pub fn finalize(self) -> Result<ExecBuffer, CompilationError> {
        // Guess generously at the encoded size (most operations encode well under 16
        // bytes) and return what goes unused to the OS afterwards.
        let buflen = (self.ops.len() * 16)
            .next_multiple_of(page_size::get())
            .max(page_size::get());
        let buf = unsafe {
            mmap(
                std::ptr::null_mut(),
                buflen,
                PROT_READ | PROT_WRITE | PROT_EXEC,
                MAP_ANON | MAP_PRIVATE,
                -1,
                0,
            )
        };
        if buf == MAP_FAILED {
            return Err(CompilationError::ResourceExhausted(
                "mmap of the executable buffer failed".into(),
            ));
        }
        let buf = buf as *mut u8;

        let mut enc = iced_x86::Encoder::new(64);
        let base = buf as u64;
        let mut off: u64 = 0;
        for op in &self.ops {
            let lenb = enc.encode(op, base + off).map_err(|e| {
                // Encoding failures are programming errors in the emitters, but
                // surface them as an aborted compile rather than unwinding with the
                // buffer mapped.
                unsafe { munmap(buf as *mut c_void, buflen) };
                CompilationError::InternalError(format!("encoding {op:?} failed: {e}"))
            })?;
            off += u64::try_from(lenb).unwrap();
        }
        let enc = enc.take_buffer();
        assert!(enc.len() <= buflen);
        unsafe {
            buf.copy_from_nonoverlapping(enc.as_ptr(), enc.len());
        }

        // Return whole unused pages.
        let used = enc
            .len()
            .next_multiple_of(page_size::get())
            .max(page_size::get());
        if buflen > used {
            let rtn = unsafe { munmap(buf.add(used) as *mut c_void, buflen - used) };
            assert_eq!(rtn, 0);
        }

        Ok(ExecBuffer {
            buf,
            len: used,
            code_len: enc.len(),
        })
    }
}

/// An `mmap`ed, executable run of encoded operations.
#[derive(Debug)]
pub struct ExecBuffer {
    buf: *mut u8,
    len: usize,
    code_len: usize,
}

impl ExecBuffer {
    pub fn ptr(&self) -> *const u8 {
        self.buf
    }

    pub fn code_len(&self) -> usize {
        self.code_len
    }
}

impl Drop for ExecBuffer {
    fn drop(&mut self) {
        let rtn = unsafe { munmap(self.buf as *mut c_void, self.len) };
        debug_assert_eq!(rtn, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mnemonics_buffer_in_order() {
        let mut code = CodeStream::new();
        code.mov64(OpArg::Reg(Reg::RAX), OpArg::Reg(Reg::RBX));
        code.mov64(OpArg::Spill(3), OpArg::Reg(Reg::RAX));
        code.xchg64(Reg::RCX, Reg::RDX);
        code.xor32(Reg::RAX, Reg::RAX);

        use iced_x86::Mnemonic;
        let mnemonics: Vec<_> = code.ops().iter().map(|op| op.mnemonic()).collect();
        assert_eq!(
            mnemonics,
            vec![Mnemonic::Mov, Mnemonic::Mov, Mnemonic::Xchg, Mnemonic::Xor]
        );
    }

    #[test]
    fn spill_references_are_state_relative() {
        let mut code = CodeStream::new();
        code.mov64(OpArg::Reg(Reg::RAX), OpArg::Spill(0));
        let op = code.ops()[0];
        assert_eq!(op.memory_base(), Register::R15);
        assert_eq!(
            op.memory_displacement64(),
            jitstate::spill_offset(0) as u64
        );
    }

    #[test]
    fn finalize_produces_executable_bytes() {
        let mut code = CodeStream::new();
        // mov rax, 42; ret
        code.mov_imm64(Reg::RAX, 42);
        code.ret();
        let buf = code.finalize().unwrap();
        assert!(buf.code_len() > 0);

        let f: extern "C" fn() -> u64 = unsafe { std::mem::transmute(buf.ptr()) };
        assert_eq!(f(), 42);
    }

    #[test]
    #[should_panic]
    fn mov64_between_spills_is_rejected() {
        let mut code = CodeStream::new();
        code.mov64(OpArg::Spill(0), OpArg::Spill(1));
    }
}
