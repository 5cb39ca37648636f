//! The per-opcode emit loop.
//!
//! Walks a block in order, asking the [RegAlloc] to place each instruction's operands
//! and result and pushing the selected host operations into the [CodeStream]. The
//! instruction-selection rules here are deliberately mechanical: all the interesting
//! state lives in the allocator.
//!
//! A compiled block is an `extern "C" fn(*mut JitState)`. The prologue saves the
//! callee-saved registers and pins the guest state pointer in `R15`; the terminal
//! stores the successor PC into the state block; the dispatcher (not part of this
//! crate) decides what runs next.
//!
//! Guest memory accesses and divisions are lowered to native calls: the code stream
//! carries no branch targets, and the call helpers give the architectural
//! divide-by-zero result without inline flow control.

use crate::ir::{Block, Inst, InstIdx, Opcode, Terminal, Value};
use crate::log::{self, Phase};
use crate::x64::asm::{CodeStream, OpArg};
use crate::x64::jitstate::{self, JitState};
use crate::x64::reg_alloc::RegAlloc;
use crate::x64::regs::{HostLoc, Reg, ABI_PARAM1, GPR_ORDER};
use crate::CompilationError;

/// Native entry points for guest memory accesses. Reads return the value
/// zero-extended to 64 bits; writes receive it the same way.
#[derive(Clone, Copy)]
pub struct MemoryCallbacks {
    pub read8: extern "C" fn(*mut JitState, u64) -> u64,
    pub read16: extern "C" fn(*mut JitState, u64) -> u64,
    pub read32: extern "C" fn(*mut JitState, u64) -> u64,
    pub read64: extern "C" fn(*mut JitState, u64) -> u64,
    pub write8: extern "C" fn(*mut JitState, u64, u64),
    pub write16: extern "C" fn(*mut JitState, u64, u64),
    pub write32: extern "C" fn(*mut JitState, u64, u64),
    pub write64: extern "C" fn(*mut JitState, u64, u64),
}

extern "C" fn unmapped_read(_: *mut JitState, _: u64) -> u64 {
    std::process::abort()
}

extern "C" fn unmapped_write(_: *mut JitState, _: u64, _: u64) {
    std::process::abort()
}

impl Default for MemoryCallbacks {
    fn default() -> Self {
        Self {
            read8: unmapped_read,
            read16: unmapped_read,
            read32: unmapped_read,
            read64: unmapped_read,
            write8: unmapped_write,
            write16: unmapped_write,
            write32: unmapped_write,
            write64: unmapped_write,
        }
    }
}

#[derive(Clone, Copy, Default)]
pub struct EmitConfig {
    /// Run the IR passes before emission.
    pub optimize: bool,
    pub callbacks: MemoryCallbacks,
}

// Division helpers. The guest architecture defines x/0 as 0 and wraps
// INT_MIN / -1, so these are total functions.

extern "C" fn udiv32_helper(a: u64, b: u64) -> u64 {
    let (a, b) = (a as u32, b as u32);
    if b == 0 {
        0
    } else {
        u64::from(a / b)
    }
}

extern "C" fn sdiv32_helper(a: u64, b: u64) -> u64 {
    let (a, b) = (a as u32 as i32, b as u32 as i32);
    if b == 0 {
        0
    } else {
        a.wrapping_div(b) as u32 as u64
    }
}

extern "C" fn udiv64_helper(a: u64, b: u64) -> u64 {
    if b == 0 {
        0
    } else {
        a / b
    }
}

extern "C" fn sdiv64_helper(a: u64, b: u64) -> u64 {
    let (a, b) = (a as i64, b as i64);
    if b == 0 {
        0
    } else {
        a.wrapping_div(b) as u64
    }
}

/// Emit host code for `block` into a fresh [CodeStream].
///
/// # Panics
///
/// On malformed IR or an unimplemented opcode/operand combination; see the crate's
/// failure-semantics notes.
pub fn emit_block(block: &mut Block, config: &EmitConfig) -> CodeStream {
    let mut code = CodeStream::new();
    let mut emitter = BlockEmitter {
        ra: RegAlloc::new(block),
        config,
    };
    emitter.emit(&mut code);
    code
}

/// Run the IR passes (if configured), emit, and finalise into an executable block.
pub fn compile_block(
    block: &mut Block,
    config: &EmitConfig,
) -> Result<CompiledBlock, CompilationError> {
    if log::should_log(Phase::PreOpt) {
        log::log_ir(&block.to_string());
    }
    if config.optimize {
        crate::opt::constant_propagation(block);
        crate::opt::dead_code_elimination(block);
        if log::should_log(Phase::PostOpt) {
            log::log_ir(&block.to_string());
        }
    }
    if cfg!(debug_assertions) {
        crate::opt::verify_block(block);
    }

    let code = emit_block(block, config);
    if log::should_log(Phase::Asm) {
        log::log_ir(&code.disasm());
    }

    Ok(CompiledBlock {
        buf: code.finalize()?,
    })
}

/// An executable compiled block.
pub struct CompiledBlock {
    buf: crate::x64::asm::ExecBuffer,
}

impl CompiledBlock {
    pub fn entry(&self) -> *const u8 {
        self.buf.ptr()
    }

    /// Run the block against `state`.
    ///
    /// # Safety
    ///
    /// The generated code reads and writes through `state` and calls the configured
    /// memory callbacks with it; the caller vouches that those are sound for this
    /// state value.
    pub unsafe fn execute(&self, state: &mut JitState) {
        let f: extern "C" fn(*mut JitState) = std::mem::transmute(self.buf.ptr());
        f(state as *mut JitState);
    }
}

/// Callee-saved registers the emitted prologue preserves (the allocator may hand all
/// of these out except R15, which is pinned to the state pointer).
const CALLEE_SAVE: [Reg; 6] = [Reg::RBX, Reg::RBP, Reg::R12, Reg::R13, Reg::R14, Reg::R15];

struct BlockEmitter<'a> {
    ra: RegAlloc<'a>,
    config: &'a EmitConfig,
}

impl BlockEmitter<'_> {
    fn emit(&mut self, code: &mut CodeStream) {
        // Prologue: save callee-saved registers, keep RSP 16-byte aligned at emitted
        // call sites, pin the state pointer.
        for reg in CALLEE_SAVE {
            code.push64(reg);
        }
        code.sub64_imm(Reg::RSP, 8);
        code.mov64(OpArg::Reg(Reg::R15), OpArg::Reg(Reg::RDI));

        for i in 0..self.ra.block().len() {
            let iidx = InstIdx::from_usize(i);
            let inst = self.ra.block().inst(iidx).clone();
            if inst.opcode() == Opcode::Void {
                continue;
            }
            self.emit_inst(code, iidx, &inst);
            self.ra.end_of_alloc_scope();
        }

        self.emit_terminal(code);
        self.ra.assert_no_more_uses();

        code.add64_imm(Reg::RSP, 8);
        for reg in CALLEE_SAVE.iter().rev() {
            code.pop64(*reg);
        }
        code.ret();
    }

    fn emit_inst(&mut self, code: &mut CodeStream, iidx: InstIdx, inst: &Inst) {
        use Opcode as Op;
        match inst.opcode() {
            Op::Void => unreachable!(),

            Op::Identity => {
                let v = inst.arg(0);
                self.ra.register_add_def(code, iidx, v);
            }

            Op::GetGuestReg => {
                let off = jitstate::guest_reg_offset(inst.arg(0).guest_reg());
                let result = self.ra.def_reg(code, iidx, &GPR_ORDER);
                code.mov64_from_state(result.reg(), off);
            }

            Op::SetGuestReg => {
                let off = jitstate::guest_reg_offset(inst.arg(0).guest_reg());
                let value = self.ra.use_reg(code, inst.arg(1), &GPR_ORDER);
                code.mov64_to_state(off, value.reg());
            }

            Op::GetCarryFromOp => {
                if inst.has_uses() {
                    // The primary instruction's emitter defined our value.
                    assert!(
                        self.ra.is_value_live(iidx),
                        "carry consumed but its producer never defined it"
                    );
                } else {
                    self.ra.discard_use(inst.arg(0));
                }
            }

            // Narrowing extractions are pure aliases: consumers read the narrower
            // width out of the same register.
            Op::LeastSignificantWord | Op::LeastSignificantHalf | Op::LeastSignificantByte => {
                let v = inst.arg(0);
                self.ra.register_add_def(code, iidx, v);
            }

            Op::MostSignificantWord => self.emit_most_significant_word(code, iidx, inst),

            Op::MostSignificantBit => {
                let a = self.ra.use_reg(code, inst.arg(0), &GPR_ORDER);
                let result = self.ra.def_reg(code, iidx, &GPR_ORDER);
                code.mov64(OpArg::Reg(result.reg()), OpArg::Reg(a.reg()));
                code.shr32_imm(result.reg(), 31);
            }

            Op::LogicalShiftLeft32
            | Op::LogicalShiftRight32
            | Op::ArithmeticShiftRight32
            | Op::RotateRight32 => self.emit_shift32(code, iidx, inst),

            Op::LogicalShiftLeft64
            | Op::LogicalShiftRight64
            | Op::ArithmeticShiftRight64
            | Op::RotateRight64 => self.emit_shift64(code, iidx, inst),

            Op::Add32 => self.emit_binary(code, iidx, inst, CodeStream::add32),
            Op::Add64 => self.emit_binary(code, iidx, inst, CodeStream::add64),
            Op::Sub32 => self.emit_binary(code, iidx, inst, CodeStream::sub32),
            Op::Sub64 => self.emit_binary(code, iidx, inst, CodeStream::sub64),
            Op::Mul32 => self.emit_binary(code, iidx, inst, CodeStream::imul32),
            Op::Mul64 => self.emit_binary(code, iidx, inst, CodeStream::imul64),
            Op::And32 => self.emit_binary(code, iidx, inst, CodeStream::and32),
            Op::And64 => self.emit_binary(code, iidx, inst, CodeStream::and64),
            Op::Eor32 => self.emit_binary(code, iidx, inst, CodeStream::xor32),
            Op::Eor64 => self.emit_binary(code, iidx, inst, CodeStream::xor64),
            Op::Or32 => self.emit_binary(code, iidx, inst, CodeStream::or32),
            Op::Or64 => self.emit_binary(code, iidx, inst, CodeStream::or64),

            Op::Not32 => {
                let (src, result) = self.ra.use_def_op(code, inst.arg(0), iidx, &GPR_ORDER);
                code.mov64(OpArg::Reg(result.reg()), src);
                code.not32(result.reg());
            }
            Op::Not64 => {
                let (src, result) = self.ra.use_def_op(code, inst.arg(0), iidx, &GPR_ORDER);
                code.mov64(OpArg::Reg(result.reg()), src);
                code.not64(result.reg());
            }

            Op::UnsignedDiv32 => self.emit_div(code, iidx, inst, udiv32_helper as usize),
            Op::UnsignedDiv64 => self.emit_div(code, iidx, inst, udiv64_helper as usize),
            Op::SignedDiv32 => self.emit_div(code, iidx, inst, sdiv32_helper as usize),
            Op::SignedDiv64 => self.emit_div(code, iidx, inst, sdiv64_helper as usize),

            Op::SignExtendByteToWord => self.emit_extend(code, iidx, inst, CodeStream::movsx32_8),
            Op::SignExtendHalfToWord => self.emit_extend(code, iidx, inst, CodeStream::movsx32_16),
            Op::SignExtendByteToLong => self.emit_extend(code, iidx, inst, CodeStream::movsx64_8),
            Op::SignExtendHalfToLong => self.emit_extend(code, iidx, inst, CodeStream::movsx64_16),
            Op::SignExtendWordToLong => self.emit_extend(code, iidx, inst, CodeStream::movsxd64_32),
            Op::ZeroExtendByteToWord | Op::ZeroExtendByteToLong => {
                self.emit_extend(code, iidx, inst, CodeStream::movzx32_8)
            }
            Op::ZeroExtendHalfToWord | Op::ZeroExtendHalfToLong => {
                self.emit_extend(code, iidx, inst, CodeStream::movzx32_16)
            }
            Op::ZeroExtendWordToLong => self.emit_extend(code, iidx, inst, CodeStream::mov32),

            Op::ByteReverseWord => {
                let (src, result) = self.ra.use_def_op(code, inst.arg(0), iidx, &GPR_ORDER);
                code.mov64(OpArg::Reg(result.reg()), src);
                code.bswap32(result.reg());
            }
            Op::ByteReverseHalf => {
                let (src, result) = self.ra.use_def_op(code, inst.arg(0), iidx, &GPR_ORDER);
                code.movzx32_16(result.reg(), src);
                code.ror16_imm(result.reg(), 8);
            }
            Op::ByteReverseDual => {
                let (src, result) = self.ra.use_def_op(code, inst.arg(0), iidx, &GPR_ORDER);
                code.mov64(OpArg::Reg(result.reg()), src);
                code.bswap64(result.reg());
            }

            Op::ReadMemory8 => self.emit_read_memory(code, iidx, inst, self.config.callbacks.read8 as usize),
            Op::ReadMemory16 => self.emit_read_memory(code, iidx, inst, self.config.callbacks.read16 as usize),
            Op::ReadMemory32 => self.emit_read_memory(code, iidx, inst, self.config.callbacks.read32 as usize),
            Op::ReadMemory64 => self.emit_read_memory(code, iidx, inst, self.config.callbacks.read64 as usize),
            Op::WriteMemory8 => self.emit_write_memory(code, inst, self.config.callbacks.write8 as usize),
            Op::WriteMemory16 => self.emit_write_memory(code, inst, self.config.callbacks.write16 as usize),
            Op::WriteMemory32 => self.emit_write_memory(code, inst, self.config.callbacks.write32 as usize),
            Op::WriteMemory64 => self.emit_write_memory(code, inst, self.config.callbacks.write64 as usize),
        }
    }

    /// Two-address binary op: move the first operand into the result register, apply
    /// the op with the second.
    fn emit_binary(
        &mut self,
        code: &mut CodeStream,
        iidx: InstIdx,
        inst: &Inst,
        f: fn(&mut CodeStream, Reg, Reg),
    ) {
        let (a, result) = self.ra.use_def_op(code, inst.arg(0), iidx, &GPR_ORDER);
        let b = self.ra.use_reg(code, inst.arg(1), &GPR_ORDER);
        if a != OpArg::Reg(result.reg()) {
            code.mov64(OpArg::Reg(result.reg()), a);
        }
        f(code, result.reg(), b.reg());
    }

    fn emit_extend(
        &mut self,
        code: &mut CodeStream,
        iidx: InstIdx,
        inst: &Inst,
        f: fn(&mut CodeStream, Reg, OpArg),
    ) {
        let (src, result) = self.ra.use_def_op(code, inst.arg(0), iidx, &GPR_ORDER);
        f(code, result.reg(), src);
    }

    fn emit_most_significant_word(&mut self, code: &mut CodeStream, iidx: InstIdx, inst: &Inst) {
        let carry_inst = self
            .ra
            .block()
            .get_associated_pseudo_operation(iidx, Opcode::GetCarryFromOp);

        let a = self.ra.use_reg(code, inst.arg(0), &GPR_ORDER);
        if let Some(carry_inst) = carry_inst {
            let carry = self.ra.def_reg(code, carry_inst, &GPR_ORDER);
            code.mov64(OpArg::Reg(carry.reg()), OpArg::Reg(a.reg()));
            code.shr32_imm(carry.reg(), 31);
            // Consume the pseudo-operation's reference to this instruction.
            self.ra.discard_use(Value::Inst(iidx));
        }
        let result = self.ra.def_reg(code, iidx, &GPR_ORDER);
        code.mov64(OpArg::Reg(result.reg()), OpArg::Reg(a.reg()));
        code.shr64_imm(result.reg(), 32);
    }

    /// 32-bit shift family. The third operand is the incoming carry; a carry-out is
    /// produced only when the associated pseudo-operation is observed.
    fn emit_shift32(&mut self, code: &mut CodeStream, iidx: InstIdx, inst: &Inst) {
        let op = inst.opcode();
        let carry_inst = self
            .ra
            .block()
            .get_associated_pseudo_operation(iidx, Opcode::GetCarryFromOp);
        let a = inst.arg(0);
        let shift = inst.arg(1);
        let carry_in = inst.arg(2);

        if shift.is_immediate() {
            // The guest reads only the low byte of a shift amount.
            let s = (shift.imm_u64() & 0xff) as u8;

            if s == 0 {
                // Result and carry-out pass straight through.
                self.ra.register_add_def(code, iidx, a);
                if let Some(carry_inst) = carry_inst {
                    self.ra.register_add_def(code, carry_inst, carry_in);
                    self.ra.discard_use(Value::Inst(iidx));
                } else {
                    self.ra.discard_use(carry_in);
                }
                return;
            }

            let a_reg = self.ra.use_reg(code, a, &GPR_ORDER);
            self.ra.discard_use(carry_in);

            if let Some(carry_inst) = carry_inst {
                self.emit_shift32_carry(code, op, s, a_reg, carry_inst);
                self.ra.discard_use(Value::Inst(iidx));
            }

            let result = self.ra.def_reg(code, iidx, &GPR_ORDER);
            match op {
                Opcode::LogicalShiftLeft32 => {
                    if s >= 32 {
                        code.xor32(result.reg(), result.reg());
                    } else {
                        code.mov64(OpArg::Reg(result.reg()), OpArg::Reg(a_reg.reg()));
                        code.shl32_imm(result.reg(), s);
                    }
                }
                Opcode::LogicalShiftRight32 => {
                    if s >= 32 {
                        code.xor32(result.reg(), result.reg());
                    } else {
                        code.mov64(OpArg::Reg(result.reg()), OpArg::Reg(a_reg.reg()));
                        code.shr32_imm(result.reg(), s);
                    }
                }
                Opcode::ArithmeticShiftRight32 => {
                    code.mov64(OpArg::Reg(result.reg()), OpArg::Reg(a_reg.reg()));
                    code.sar32_imm(result.reg(), s.min(31));
                }
                Opcode::RotateRight32 => {
                    code.mov64(OpArg::Reg(result.reg()), OpArg::Reg(a_reg.reg()));
                    code.ror32_imm(result.reg(), s % 32);
                }
                _ => unreachable!(),
            }
            return;
        }

        // Register-amount shifts: the carry-out sequence for a runtime amount is not
        // wired up yet.
        assert!(
            carry_inst.is_none(),
            "TODO: carry-out for a non-immediate shift amount"
        );
        self.ra.discard_use(carry_in);

        // Count goes in CL. x64 masks the count mod 64, so do the operation at 64
        // bits and correct the >= 64 case with a conditional move; amounts 32..=63
        // then fall out naturally in the low 32 bits.
        self.ra
            .use_scratch_reg(code, shift, &[HostLoc::Reg(Reg::RCX)]);
        let (a_arg, result) = self.ra.use_def_op(code, a, iidx, &GPR_ORDER);

        match op {
            Opcode::LogicalShiftLeft32 | Opcode::LogicalShiftRight32 => {
                let zero = self.ra.scratch_reg(code, &GPR_ORDER);
                code.mov32(result.reg(), a_arg);
                code.xor32(zero.reg(), zero.reg());
                if op == Opcode::LogicalShiftLeft32 {
                    code.shl64_cl(result.reg());
                } else {
                    code.shr64_cl(result.reg());
                }
                code.cmp8_imm(Reg::RCX, 64);
                code.cmovae64(result.reg(), zero.reg());
            }
            Opcode::ArithmeticShiftRight32 => {
                let sign = self.ra.scratch_reg(code, &GPR_ORDER);
                code.movsxd64_32(result.reg(), a_arg);
                code.mov64(OpArg::Reg(sign.reg()), OpArg::Reg(result.reg()));
                code.sar64_imm(sign.reg(), 63);
                code.sar64_cl(result.reg());
                code.cmp8_imm(Reg::RCX, 64);
                code.cmovae64(result.reg(), sign.reg());
            }
            Opcode::RotateRight32 => {
                // x64 masks the rotate count mod 32, exactly the guest semantics.
                code.mov32(result.reg(), a_arg);
                code.ror32_cl(result.reg());
            }
            _ => unreachable!(),
        }
    }

    /// Carry-out of a 32-bit shift by the non-zero immediate `s`, defined into
    /// `carry_inst`'s register.
    fn emit_shift32_carry(
        &mut self,
        code: &mut CodeStream,
        op: Opcode,
        s: u8,
        a_reg: HostLoc,
        carry_inst: InstIdx,
    ) {
        // Which bit of the unshifted operand becomes the carry, if any.
        let bit = match op {
            Opcode::LogicalShiftLeft32 => {
                if s <= 32 {
                    Some(32 - s)
                } else {
                    None
                }
            }
            Opcode::LogicalShiftRight32 => {
                if s <= 32 {
                    Some(s - 1)
                } else {
                    None
                }
            }
            Opcode::ArithmeticShiftRight32 => Some((s - 1).min(31)),
            Opcode::RotateRight32 => Some((s - 1) % 32),
            _ => unreachable!(),
        };

        match bit {
            Some(bit) => {
                let carry = self.ra.def_reg(code, carry_inst, &GPR_ORDER);
                code.mov64(OpArg::Reg(carry.reg()), OpArg::Reg(a_reg.reg()));
                if bit > 0 {
                    code.shr32_imm(carry.reg(), bit);
                }
                code.and32_imm8(carry.reg(), 1);
            }
            None => {
                // Shifted out entirely: the carry is zero.
                self.ra.register_add_def(code, carry_inst, Value::U1(false));
            }
        }
    }

    /// 64-bit shift family: two operands, no carry. Both the guest and x64 take the
    /// count mod 64.
    fn emit_shift64(&mut self, code: &mut CodeStream, iidx: InstIdx, inst: &Inst) {
        let op = inst.opcode();
        let a = inst.arg(0);
        let shift = inst.arg(1);

        if shift.is_immediate() {
            let s = (shift.imm_u64() & 0x3f) as u8;
            let (a_arg, result) = self.ra.use_def_op(code, a, iidx, &GPR_ORDER);
            code.mov64(OpArg::Reg(result.reg()), a_arg);
            match op {
                Opcode::LogicalShiftLeft64 => code.shl64_imm(result.reg(), s),
                Opcode::LogicalShiftRight64 => code.shr64_imm(result.reg(), s),
                Opcode::ArithmeticShiftRight64 => code.sar64_imm(result.reg(), s),
                Opcode::RotateRight64 => code.ror64_imm(result.reg(), s),
                _ => unreachable!(),
            }
            return;
        }

        self.ra
            .use_scratch_reg(code, shift, &[HostLoc::Reg(Reg::RCX)]);
        let (a_arg, result) = self.ra.use_def_op(code, a, iidx, &GPR_ORDER);
        code.mov64(OpArg::Reg(result.reg()), a_arg);
        match op {
            Opcode::LogicalShiftLeft64 => code.shl64_cl(result.reg()),
            Opcode::LogicalShiftRight64 => code.shr64_cl(result.reg()),
            Opcode::ArithmeticShiftRight64 => code.sar64_cl(result.reg()),
            Opcode::RotateRight64 => code.ror64_cl(result.reg()),
            _ => unreachable!(),
        }
    }

    fn emit_div(&mut self, code: &mut CodeStream, iidx: InstIdx, inst: &Inst, helper: usize) {
        self.ra.host_call(
            code,
            Some(iidx),
            [inst.arg(0), inst.arg(1), Value::Void, Value::Void],
        );
        // The return register doubles as the call target: it is clobbered by the
        // call's result anyway.
        code.mov_imm64(Reg::RAX, helper as u64);
        code.call_reg(Reg::RAX);
    }

    fn emit_read_memory(&mut self, code: &mut CodeStream, iidx: InstIdx, inst: &Inst, callback: usize) {
        self.ra.host_call(
            code,
            Some(iidx),
            [Value::Void, inst.arg(0), Value::Void, Value::Void],
        );
        code.mov64(OpArg::Reg(ABI_PARAM1.reg()), OpArg::Reg(Reg::R15));
        code.mov_imm64(Reg::RAX, callback as u64);
        code.call_reg(Reg::RAX);
    }

    fn emit_write_memory(&mut self, code: &mut CodeStream, inst: &Inst, callback: usize) {
        self.ra.host_call(
            code,
            None,
            [Value::Void, inst.arg(0), inst.arg(1), Value::Void],
        );
        code.mov64(OpArg::Reg(ABI_PARAM1.reg()), OpArg::Reg(Reg::R15));
        code.mov_imm64(Reg::RAX, callback as u64);
        code.call_reg(Reg::RAX);
    }

    fn emit_terminal(&mut self, code: &mut CodeStream) {
        let terminal = *self.ra.block().terminal();
        match terminal {
            Terminal::Invalid => panic!("emitting a block with no terminal"),
            Terminal::LinkBlock { next } => {
                let tmp = self.ra.scratch_reg(code, &GPR_ORDER);
                code.mov_imm64(tmp.reg(), next);
                code.mov64_to_state(jitstate::pc_offset(), tmp.reg());
                self.ra.end_of_alloc_scope();
            }
            Terminal::If {
                cond,
                then_next,
                else_next,
            } => {
                let c = self.ra.use_reg(code, cond, &GPR_ORDER);
                let taken = self.ra.scratch_reg(code, &GPR_ORDER);
                let fallthrough = self.ra.scratch_reg(code, &GPR_ORDER);
                code.mov_imm64(taken.reg(), then_next);
                code.mov_imm64(fallthrough.reg(), else_next);
                code.test64(c.reg(), c.reg());
                code.cmove64(taken.reg(), fallthrough.reg());
                code.mov64_to_state(jitstate::pc_offset(), taken.reg());
                self.ra.end_of_alloc_scope();
            }
            // The next PC was stored by guest instructions (or the block simply
            // ends); nothing to emit.
            Terminal::ReturnToDispatch | Terminal::Return => (),
        }
    }
}
