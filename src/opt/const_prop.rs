//! Constant propagation and algebraic identity folding.
//!
//! A single forward sweep over a block. Each folder either replaces an instruction's
//! result block-wide (the instruction stays behind as a dead producer for
//! [super::dead_code_elimination] to reap) or rewrites its operands in place,
//! keeping the instruction live but simpler.
//!
//! The commutative folder also normalises operand order: after the sweep, no live
//! commutative instruction has an immediate in position 0 unless both operands are
//! immediate.

use crate::ir::{Block, InstIdx, Opcode, Value};

/// Build an immediate of the folding width.
fn imm(is_32_bit: bool, value: u64) -> Value {
    if is_32_bit {
        Value::U32(value as u32)
    } else {
        Value::U64(value)
    }
}

/// Replace every use of `iidx` with `value` clamped to the folding width.
fn replace_uses_imm(block: &mut Block, iidx: InstIdx, is_32_bit: bool, value: u64) {
    block.replace_uses_with(iidx, imm(is_32_bit, value));
}

/// The shared front half of every commutative folder.
///
/// Fully evaluates the instruction when both operands are immediate (returning
/// `false`: the instruction is dead, no identities apply). Otherwise fuses with a
/// producer of the same opcode whose second operand is immediate
/// (`imm1 ⊕ (x ⊕ imm2) → x ⊕ (imm1 ⊕ imm2)`), or normalises the immediate into
/// position 1, and returns `true` so the caller can apply per-op identities.
fn fold_commutative(
    block: &mut Block,
    iidx: InstIdx,
    is_32_bit: bool,
    imm_fn: impl Fn(u64, u64) -> u64,
) -> bool {
    let opcode = block.inst(iidx).opcode();
    let lhs = block.inst(iidx).arg(0);
    let rhs = block.inst(iidx).arg(1);

    let is_lhs_immediate = lhs.is_immediate();
    let is_rhs_immediate = rhs.is_immediate();

    if is_lhs_immediate && is_rhs_immediate {
        let result = imm_fn(lhs.imm_u64(), rhs.imm_u64());
        replace_uses_imm(block, iidx, is_32_bit, result);
        return false;
    }

    if is_lhs_immediate && !is_rhs_immediate {
        if let Value::Inst(rhs_inst) = block.resolve(rhs) {
            if block.inst(rhs_inst).opcode() == opcode && block.inst(rhs_inst).arg(1).is_immediate()
            {
                let combined = imm_fn(lhs.imm_u64(), block.inst(rhs_inst).arg(1).imm_u64());
                let inner = block.inst(rhs_inst).arg(0);
                block.set_arg(iidx, 0, inner);
                block.set_arg(iidx, 1, imm(is_32_bit, combined));
                return true;
            }
        }
        // Normalise the immediate into position 1.
        block.set_arg(iidx, 0, rhs);
        block.set_arg(iidx, 1, lhs);
    }

    if !is_lhs_immediate && is_rhs_immediate {
        if let Value::Inst(lhs_inst) = block.resolve(lhs) {
            if block.inst(lhs_inst).opcode() == opcode && block.inst(lhs_inst).arg(1).is_immediate()
            {
                let combined = imm_fn(rhs.imm_u64(), block.inst(lhs_inst).arg(1).imm_u64());
                let inner = block.inst(lhs_inst).arg(0);
                block.set_arg(iidx, 0, inner);
                block.set_arg(iidx, 1, imm(is_32_bit, combined));
            }
        }
    }

    true
}

// Folds AND operations based on the following:
//
// 1. imm_x & imm_y -> result
// 2. x & 0 -> 0
// 3. x & y -> x (where y has all bits set to 1)
//
fn fold_and(block: &mut Block, iidx: InstIdx, is_32_bit: bool) {
    if fold_commutative(block, iidx, is_32_bit, |a, b| a & b) {
        let rhs = block.inst(iidx).arg(1);
        if rhs.is_zero() {
            replace_uses_imm(block, iidx, is_32_bit, 0);
        } else if rhs.has_all_bits_set() {
            let lhs = block.inst(iidx).arg(0);
            block.replace_uses_with(iidx, lhs);
        }
    }
}

// Folds EOR operations based on the following:
//
// 1. imm_x ^ imm_y -> result
// 2. x ^ 0 -> x
//
fn fold_eor(block: &mut Block, iidx: InstIdx, is_32_bit: bool) {
    if fold_commutative(block, iidx, is_32_bit, |a, b| a ^ b) {
        let rhs = block.inst(iidx).arg(1);
        if rhs.is_zero() {
            let lhs = block.inst(iidx).arg(0);
            block.replace_uses_with(iidx, lhs);
        }
    }
}

// Folds OR operations based on the following:
//
// 1. imm_x | imm_y -> result
// 2. x | 0 -> x
//
fn fold_or(block: &mut Block, iidx: InstIdx, is_32_bit: bool) {
    if fold_commutative(block, iidx, is_32_bit, |a, b| a | b) {
        let rhs = block.inst(iidx).arg(1);
        if rhs.is_zero() {
            let lhs = block.inst(iidx).arg(0);
            block.replace_uses_with(iidx, lhs);
        }
    }
}

// Folds ADD operations based on the following:
//
// 1. imm_x + imm_y -> result
// 2. x + 0 -> x
//
fn fold_add(block: &mut Block, iidx: InstIdx, is_32_bit: bool) {
    if fold_commutative(block, iidx, is_32_bit, u64::wrapping_add) {
        let rhs = block.inst(iidx).arg(1);
        if rhs.is_zero() {
            let lhs = block.inst(iidx).arg(0);
            block.replace_uses_with(iidx, lhs);
        }
    }
}

// Folds multiplication operations based on the following:
//
// 1. imm_x * imm_y -> result
// 2. x * 0 -> 0
// 3. x * 1 -> x
//
fn fold_multiply(block: &mut Block, iidx: InstIdx, is_32_bit: bool) {
    if fold_commutative(block, iidx, is_32_bit, u64::wrapping_mul) {
        let rhs = block.inst(iidx).arg(1);
        if rhs.is_zero() {
            replace_uses_imm(block, iidx, is_32_bit, 0);
        } else if rhs.is_unsigned_immediate(1) {
            let lhs = block.inst(iidx).arg(0);
            block.replace_uses_with(iidx, lhs);
        }
    }
}

// Folds division operations based on the following:
//
// 1. x / 0 -> 0 (not undefined: the guest architecture defines this sentinel)
// 2. imm_x / imm_y -> result
// 3. x / 1 -> x
//
fn fold_divide(block: &mut Block, iidx: InstIdx, is_32_bit: bool, is_signed: bool) {
    let rhs = block.inst(iidx).arg(1);

    if rhs.is_zero() {
        replace_uses_imm(block, iidx, is_32_bit, 0);
        return;
    }

    let lhs = block.inst(iidx).arg(0);
    if lhs.is_immediate() && rhs.is_immediate() {
        if is_signed {
            let result = lhs.imm_s64().wrapping_div(rhs.imm_s64());
            replace_uses_imm(block, iidx, is_32_bit, result as u64);
        } else {
            let result = lhs.imm_u64() / rhs.imm_u64();
            replace_uses_imm(block, iidx, is_32_bit, result);
        }
    } else if rhs.is_unsigned_immediate(1) {
        block.replace_uses_with(iidx, lhs);
    }
}

// Folds NOT operations if the operand is an immediate.
fn fold_not(block: &mut Block, iidx: InstIdx, is_32_bit: bool) {
    let operand = block.inst(iidx).arg(0);

    if !operand.is_immediate() {
        return;
    }

    let result = !operand.imm_u64();
    replace_uses_imm(block, iidx, is_32_bit, result);
}

// Folds byte reversal opcodes: imm -> swap(imm), at the width of the variant.
fn fold_byte_reverse(block: &mut Block, iidx: InstIdx, op: Opcode) {
    let operand = block.inst(iidx).arg(0);

    if !operand.is_immediate() {
        return;
    }

    let value = match op {
        Opcode::ByteReverseWord => Value::U32((operand.imm_u64() as u32).swap_bytes()),
        Opcode::ByteReverseHalf => Value::U16((operand.imm_u64() as u16).swap_bytes()),
        Opcode::ByteReverseDual => Value::U64(operand.imm_u64().swap_bytes()),
        _ => unreachable!(),
    };
    block.replace_uses_with(iidx, value);
}

fn fold_least_significant_word(block: &mut Block, iidx: InstIdx) {
    if !block.inst(iidx).are_all_args_immediates() {
        return;
    }
    let operand = block.inst(iidx).arg(0);
    block.replace_uses_with(iidx, Value::U32(operand.imm_u64() as u32));
}

fn fold_least_significant_half(block: &mut Block, iidx: InstIdx) {
    if !block.inst(iidx).are_all_args_immediates() {
        return;
    }
    let operand = block.inst(iidx).arg(0);
    block.replace_uses_with(iidx, Value::U16(operand.imm_u64() as u16));
}

fn fold_least_significant_byte(block: &mut Block, iidx: InstIdx) {
    if !block.inst(iidx).are_all_args_immediates() {
        return;
    }
    let operand = block.inst(iidx).arg(0);
    block.replace_uses_with(iidx, Value::U8(operand.imm_u64() as u8));
}

fn fold_most_significant_bit(block: &mut Block, iidx: InstIdx) {
    if !block.inst(iidx).are_all_args_immediates() {
        return;
    }
    let operand = block.inst(iidx).arg(0);
    block.replace_uses_with(iidx, Value::U1((operand.imm_u64() >> 31) & 1 != 0));
}

// The high word extraction also forwards bit 31 of the operand into its associated
// carry pseudo-operation, when one is observed.
fn fold_most_significant_word(block: &mut Block, iidx: InstIdx) {
    let carry_inst = block.get_associated_pseudo_operation(iidx, Opcode::GetCarryFromOp);

    if !block.inst(iidx).are_all_args_immediates() {
        return;
    }

    let operand = block.inst(iidx).arg(0);
    if let Some(carry_inst) = carry_inst {
        block.replace_uses_with(carry_inst, Value::U1((operand.imm_u64() >> 31) & 1 != 0));
    }
    block.replace_uses_with(iidx, Value::U32((operand.imm_u64() >> 32) as u32));
}

// The 32-bit shift variants carry a third operand (the incoming carry) which only
// matters when a carry pseudo-operation is observed; when it is not, the operand is
// forced to constant false so the emitter never has to materialise it. A shift by
// zero yields the first operand unchanged, with the incoming carry passed through.
fn fold_shifts(block: &mut Block, iidx: InstIdx) {
    let carry_inst = block.get_associated_pseudo_operation(iidx, Opcode::GetCarryFromOp);

    if block.inst(iidx).num_args() == 3 && carry_inst.is_none() {
        block.set_arg(iidx, 2, Value::U1(false));
    }

    let shift_amount = block.inst(iidx).arg(1);
    if !shift_amount.is_zero() {
        return;
    }

    if let Some(carry_inst) = carry_inst {
        let carry_in = block.inst(iidx).arg(2);
        block.replace_uses_with(carry_inst, carry_in);
    }
    let operand = block.inst(iidx).arg(0);
    block.replace_uses_with(iidx, operand);
}

fn fold_sign_extend_to_word(block: &mut Block, iidx: InstIdx) {
    if !block.inst(iidx).are_all_args_immediates() {
        return;
    }
    let value = block.inst(iidx).arg(0).imm_s64();
    block.replace_uses_with(iidx, Value::U32(value as u32));
}

fn fold_sign_extend_to_long(block: &mut Block, iidx: InstIdx) {
    if !block.inst(iidx).are_all_args_immediates() {
        return;
    }
    let value = block.inst(iidx).arg(0).imm_s64();
    block.replace_uses_with(iidx, Value::U64(value as u64));
}

fn fold_zero_extend_to_word(block: &mut Block, iidx: InstIdx) {
    if !block.inst(iidx).are_all_args_immediates() {
        return;
    }
    let value = block.inst(iidx).arg(0).imm_u64();
    block.replace_uses_with(iidx, Value::U32(value as u32));
}

fn fold_zero_extend_to_long(block: &mut Block, iidx: InstIdx) {
    if !block.inst(iidx).are_all_args_immediates() {
        return;
    }
    let value = block.inst(iidx).arg(0).imm_u64();
    block.replace_uses_with(iidx, Value::U64(value));
}

/// Run the pass over `block`. A single sweep; re-running is permitted but not
/// required.
pub fn constant_propagation(block: &mut Block) {
    use Opcode as Op;

    for iidx in block.iter_idxs() {
        let opcode = block.inst(iidx).opcode();

        match opcode {
            Op::LeastSignificantWord => fold_least_significant_word(block, iidx),
            Op::MostSignificantWord => fold_most_significant_word(block, iidx),
            Op::LeastSignificantHalf => fold_least_significant_half(block, iidx),
            Op::LeastSignificantByte => fold_least_significant_byte(block, iidx),
            Op::MostSignificantBit => fold_most_significant_bit(block, iidx),
            Op::LogicalShiftLeft32
            | Op::LogicalShiftLeft64
            | Op::LogicalShiftRight32
            | Op::LogicalShiftRight64
            | Op::ArithmeticShiftRight32
            | Op::ArithmeticShiftRight64
            | Op::RotateRight32
            | Op::RotateRight64 => fold_shifts(block, iidx),
            Op::Add32 | Op::Add64 => fold_add(block, iidx, opcode == Op::Add32),
            Op::Mul32 | Op::Mul64 => fold_multiply(block, iidx, opcode == Op::Mul32),
            Op::SignedDiv32 | Op::SignedDiv64 => {
                fold_divide(block, iidx, opcode == Op::SignedDiv32, true)
            }
            Op::UnsignedDiv32 | Op::UnsignedDiv64 => {
                fold_divide(block, iidx, opcode == Op::UnsignedDiv32, false)
            }
            Op::And32 | Op::And64 => fold_and(block, iidx, opcode == Op::And32),
            Op::Eor32 | Op::Eor64 => fold_eor(block, iidx, opcode == Op::Eor32),
            Op::Or32 | Op::Or64 => fold_or(block, iidx, opcode == Op::Or32),
            Op::Not32 | Op::Not64 => fold_not(block, iidx, opcode == Op::Not32),
            Op::SignExtendByteToWord | Op::SignExtendHalfToWord => {
                fold_sign_extend_to_word(block, iidx)
            }
            Op::SignExtendByteToLong | Op::SignExtendHalfToLong | Op::SignExtendWordToLong => {
                fold_sign_extend_to_long(block, iidx)
            }
            Op::ZeroExtendByteToWord | Op::ZeroExtendHalfToWord => {
                fold_zero_extend_to_word(block, iidx)
            }
            Op::ZeroExtendByteToLong | Op::ZeroExtendHalfToLong | Op::ZeroExtendWordToLong => {
                fold_zero_extend_to_long(block, iidx)
            }
            Op::ByteReverseWord | Op::ByteReverseHalf | Op::ByteReverseDual => {
                fold_byte_reverse(block, iidx, opcode)
            }
            _ => (),
        }
    }
}
