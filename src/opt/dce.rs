//! Dead-code elimination.

use crate::ir::{Block, Opcode};

/// A single reverse sweep: any side-effect-free instruction with no remaining
/// consumers is tombstoned, releasing its operands (which may in turn kill their
/// producers, hence the direction of the sweep).
pub fn dead_code_elimination(block: &mut Block) {
    for iidx in block.iter_idxs().rev() {
        let inst = block.inst(iidx);
        if inst.opcode() == Opcode::Void {
            continue;
        }
        if !inst.has_uses() && !inst.opcode().has_side_effects() {
            block.invalidate(iidx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BlockBuilder, GuestReg, Terminal, Value};
    use crate::opt::constant_propagation;

    #[test]
    fn folded_chains_are_reaped() {
        let mut bb = BlockBuilder::new(0);
        let x = bb.get_guest_reg(GuestReg(0));
        let t0 = bb.and32(x, Value::U32(0x00ff));
        let t1 = bb.and32(t0, Value::U32(0xf0f0));
        bb.set_guest_reg(GuestReg(1), t1);
        let mut b = bb.finish(Terminal::Return);

        constant_propagation(&mut b);
        dead_code_elimination(&mut b);

        // t0 is dead after fusion; t1 and the guest accesses survive.
        assert_eq!(b.inst(t0.inst()).opcode(), Opcode::Void);
        assert_eq!(b.inst(t1.inst()).opcode(), Opcode::And32);
        assert_eq!(b.inst(x.inst()).opcode(), Opcode::GetGuestReg);
    }

    #[test]
    fn elimination_cascades_up_dependency_chains() {
        let mut bb = BlockBuilder::new(0);
        let x = bb.get_guest_reg(GuestReg(0));
        let a = bb.not32(x);
        let c = bb.eor32(a, Value::U32(1));
        // c is never consumed.
        bb.set_guest_reg(GuestReg(1), x);
        let mut b = bb.finish(Terminal::Return);

        dead_code_elimination(&mut b);

        assert_eq!(b.inst(c.inst()).opcode(), Opcode::Void);
        assert_eq!(b.inst(a.inst()).opcode(), Opcode::Void);
        // x is still read by the guest store.
        assert_eq!(b.inst(x.inst()).opcode(), Opcode::GetGuestReg);
    }

    #[test]
    fn side_effecting_instructions_survive() {
        let mut bb = BlockBuilder::new(0);
        let x = bb.get_guest_reg(GuestReg(0));
        let v = bb.read_memory32(x);
        let _unused = v;
        let mut b = bb.finish(Terminal::Return);

        dead_code_elimination(&mut b);

        assert_eq!(b.inst(v.inst()).opcode(), Opcode::ReadMemory32);
    }

    #[test]
    fn dead_carry_pseudo_op_is_reaped() {
        let mut bb = BlockBuilder::new(0);
        let x = bb.get_guest_reg(GuestReg(0));
        let (res, carry) = bb.logical_shift_left32(x, Value::U8(1), Value::U1(false));
        bb.set_guest_reg(GuestReg(1), res);
        let mut b = bb.finish(Terminal::Return);

        dead_code_elimination(&mut b);

        assert_eq!(b.inst(carry.inst()).opcode(), Opcode::Void);
        // The primary's use count no longer includes the dead pseudo-op.
        assert_eq!(b.inst(res.inst()).use_count(), 1);
    }
}
