//! Block well-formedness checking.

use crate::ir::{Block, Opcode, Terminal, Value};

/// Assert that `block` is well formed: operand arity matches each opcode, every
/// instruction reference points backwards (definition before use), and every stored
/// use count equals the number of consumers actually present in the arena and
/// terminal.
///
/// # Panics
///
/// On any violation. Malformed IR is a frontend or pass bug, not a runtime
/// condition.
pub fn verify_block(block: &Block) {
    let mut counts = vec![0u32; block.len()];

    for iidx in block.iter_idxs() {
        let inst = block.inst(iidx);
        if inst.opcode() != Opcode::Void {
            assert_eq!(
                inst.num_args(),
                inst.opcode().arg_count(),
                "%{}: wrong arity for {}",
                usize::from(iidx),
                inst.opcode()
            );
        }
        for arg in inst.args() {
            if let Value::Inst(j) = arg {
                assert!(
                    *j < iidx,
                    "%{} uses %{} before its definition",
                    usize::from(iidx),
                    usize::from(*j)
                );
                counts[usize::from(*j)] += 1;
            }
        }
    }

    if let Terminal::If { cond, .. } = block.terminal() {
        if let Value::Inst(j) = cond {
            counts[usize::from(*j)] += 1;
        }
    }

    for iidx in block.iter_idxs() {
        assert_eq!(
            counts[usize::from(iidx)],
            block.inst(iidx).use_count(),
            "%{}: stored use count diverges from actual consumers",
            usize::from(iidx)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BlockBuilder, GuestReg, Terminal, Value};
    use crate::opt::{constant_propagation, dead_code_elimination};

    #[test]
    fn freshly_built_blocks_verify() {
        let mut bb = BlockBuilder::new(0);
        let x = bb.get_guest_reg(GuestReg(0));
        let (res, carry) = bb.logical_shift_left32(x, Value::U8(3), Value::U1(false));
        bb.set_guest_reg(GuestReg(1), res);
        bb.set_guest_reg(GuestReg(2), carry);
        let b = bb.finish(Terminal::Return);
        verify_block(&b);
    }

    #[test]
    fn counts_stay_exact_through_passes() {
        let mut bb = BlockBuilder::new(0);
        let x = bb.get_guest_reg(GuestReg(0));
        let t0 = bb.and32(x, Value::U32(0xff00));
        let t1 = bb.and32(Value::U32(0x0ff0), t0);
        let t2 = bb.unsigned_div32(t1, Value::U32(0));
        let bit = bb.most_significant_bit(t2);
        bb.set_guest_reg(GuestReg(1), t2);
        let mut b = bb.finish(Terminal::If {
            cond: bit,
            then_next: 0x10,
            else_next: 0x20,
        });

        verify_block(&b);
        constant_propagation(&mut b);
        verify_block(&b);
        dead_code_elimination(&mut b);
        verify_block(&b);
    }
}
