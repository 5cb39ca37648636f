//! The block-local register allocator.
//!
//! Greedy, forward, driven by per-instruction use counts: the emitter asks for each
//! operand of the instruction it is about to emit, the allocator places values and
//! emits whatever `mov`/`movsd`/`xchg` traffic that requires, and at the end of each
//! instruction [RegAlloc::end_of_alloc_scope] releases the locks and evicts values
//! whose use count reached zero.
//!
//! Every location the allocator can hand out has a [LocInfo] record. At any point in
//! time a record is in one of four states:
//!
//! * *empty*: nothing resident, nothing reserved;
//! * *idle*: holds at least one value, nobody is consuming it right now;
//! * *use*: holds a value locked read-only for the in-flight instruction;
//! * *scratch*: reserved as a destination or temporary for the in-flight
//!   instruction; never selected for anything else until scope end.
//!
//! Misuse (asking for more simultaneous holds than a class affords, consuming a value
//! past its use count, defining a value twice) is a bug in the caller and is reported
//! by assertion: there is no recovery path, the block's compilation simply aborts.

use crate::ir::{Block, InstIdx, Value};
use crate::x64::asm::{CodeStream, OpArg};
use crate::x64::regs::{
    HostLoc, ABI_PARAM1, ABI_PARAM2, ABI_PARAM3, ABI_PARAM4, ABI_RETURN, GPR_ORDER,
    HOST_LOC_COUNT, OTHER_CALLER_SAVE,
};
use index_vec::{index_vec, IndexVec};
use smallvec::SmallVec;

index_vec::define_index_type! {
    struct HostLocIdx = u8;
}

/// Per-location allocator state.
#[derive(Clone, Debug, Default)]
struct LocInfo {
    /// The values currently homed here. Normally empty or a singleton; holds more when
    /// one value aliases another (see [RegAlloc::register_add_def]).
    values: SmallVec<[InstIdx; 1]>,
    being_used: bool,
    scratch: bool,
}

impl LocInfo {
    fn is_locked(&self) -> bool {
        self.being_used
    }

    fn is_empty(&self) -> bool {
        !self.being_used && self.values.is_empty()
    }

    fn is_idle(&self) -> bool {
        !self.being_used && !self.values.is_empty()
    }

    fn is_use(&self) -> bool {
        self.being_used && !self.scratch
    }

    fn is_scratch(&self) -> bool {
        self.being_used && self.scratch
    }

    fn contains_value(&self, iidx: InstIdx) -> bool {
        self.values.contains(&iidx)
    }

    /// Lock for the in-flight instruction: a location locked while holding a value is
    /// a read-only *use*; one locked while empty is a *scratch* reservation.
    fn lock(&mut self) {
        if self.values.is_empty() && !self.being_used {
            self.scratch = true;
        }
        self.being_used = true;
    }

    fn add_value(&mut self, iidx: InstIdx) {
        self.values.push(iidx);
    }

    /// Instruction-boundary transition: locks drop, and values that ran out of uses
    /// are evicted.
    fn end_of_alloc_scope(&mut self, block: &Block) {
        self.values.retain(|iidx| block.inst(*iidx).has_uses());
        self.being_used = false;
        self.scratch = false;
    }
}

pub struct RegAlloc<'a> {
    block: &'a mut Block,
    locs: IndexVec<HostLocIdx, LocInfo>,
}

impl<'a> RegAlloc<'a> {
    pub fn new(block: &'a mut Block) -> Self {
        Self {
            block,
            locs: index_vec![LocInfo::default(); HOST_LOC_COUNT],
        }
    }

    pub fn block(&self) -> &Block {
        &self.block
    }

    // -- Public operations, called once per operand/result while emitting --

    /// Read-only access: the value ends up resident in one of `desired`, locked for
    /// the in-flight instruction. Decrements the value's use count exactly once.
    /// Immediates are materialised into a scratch register.
    pub fn use_reg(&mut self, code: &mut CodeStream, value: Value, desired: &[HostLoc]) -> HostLoc {
        debug_assert!(desired.iter().all(HostLoc::is_register));
        if !value.is_immediate() {
            return self.use_reg_inst(code, value.inst(), desired);
        }
        let loc = self.scratch_reg(code, desired);
        self.load_immediate_into_reg(code, value, loc)
    }

    fn use_reg_inst(&mut self, code: &mut CodeStream, iidx: InstIdx, desired: &[HostLoc]) -> HostLoc {
        self.block.decrement_remaining_uses(iidx);

        let current = self
            .value_location(iidx)
            .unwrap_or_else(|| panic!("%{} has no location", usize::from(iidx)));

        if desired.contains(&current) {
            self.loc_info_mut(current).lock();
            return current;
        }

        if self.loc_info(current).is_locked() {
            // The in-flight instruction already holds this value elsewhere. Copy it
            // into a fresh scratch rather than disturbing the locked home.
            let new = self.select_a_register(desired);
            if self.is_occupied(new) {
                self.spill_register(code, new);
            }
            emit_move(code, new, current);
            *self.loc_info_mut(new) = LocInfo::default();
            self.loc_info_mut(new).lock();
            debug_assert!(self.loc_info(new).is_scratch());
            return new;
        }

        let destination = self.select_a_register(desired);
        if is_same_class(destination, current) {
            self.exchange(code, destination, current);
        } else {
            self.move_out_of_the_way(code, destination);
            self.move_value(code, destination, current);
        }
        self.loc_info_mut(destination).lock();
        destination
    }

    /// Like [RegAlloc::use_reg], but a value sitting in a spill slot is consumed
    /// directly as a memory operand instead of being reloaded. Immediates are not
    /// accepted.
    pub fn use_op(&mut self, code: &mut CodeStream, value: Value, desired: &[HostLoc]) -> OpArg {
        assert!(!value.is_immediate(), "use_op does not support immediates");
        let iidx = value.inst();
        let current = self
            .value_location(iidx)
            .unwrap_or_else(|| panic!("%{} has no location", usize::from(iidx)));

        if current.is_spill() && !self.loc_info(current).is_scratch() {
            self.block.decrement_remaining_uses(iidx);
            self.loc_info_mut(current).lock();
            debug_assert!(self.loc_info(current).is_use());
            return OpArg::Spill(current.spill_slot());
        }

        OpArg::Reg(self.use_reg_inst(code, iidx, desired).reg())
    }

    /// Destructive access: `desired` gets a copy of the value the caller may freely
    /// overwrite, in scratch state. Any surviving home of the value is left intact
    /// unless it was the chosen destination itself.
    pub fn use_scratch_reg(
        &mut self,
        code: &mut CodeStream,
        value: Value,
        desired: &[HostLoc],
    ) -> HostLoc {
        debug_assert!(desired.iter().all(HostLoc::is_register));
        if !value.is_immediate() {
            return self.use_scratch_reg_inst(code, value.inst(), desired);
        }
        let loc = self.scratch_reg(code, desired);
        self.load_immediate_into_reg(code, value, loc)
    }

    fn use_scratch_reg_inst(
        &mut self,
        code: &mut CodeStream,
        iidx: InstIdx,
        desired: &[HostLoc],
    ) -> HostLoc {
        assert!(
            self.block.inst(iidx).has_uses(),
            "%{} ran out of uses (consumed too many times)",
            usize::from(iidx)
        );
        let current = self
            .value_location(iidx)
            .unwrap_or_else(|| panic!("%{} has no location", usize::from(iidx)));

        let new = self.select_a_register(desired);
        if self.is_occupied(new) {
            self.spill_register(code, new);
        }

        if current.is_spill() {
            emit_move(code, new, current);
            self.loc_info_mut(new).lock();
            self.block.decrement_remaining_uses(iidx);
            debug_assert!(self.loc_info(new).is_scratch());
            new
        } else if current.is_register() {
            if current != new {
                assert!(self.loc_info(current).is_idle() || self.loc_info(current).is_use());
                emit_move(code, new, current);
            } else {
                // The value's own register was selected; its occupant was spilled
                // above, so the bits are still in place and the record is gone.
                assert!(self.loc_info(current).is_empty());
            }
            *self.loc_info_mut(new) = LocInfo::default();
            self.loc_info_mut(new).lock();
            self.block.decrement_remaining_uses(iidx);
            debug_assert!(self.loc_info(new).is_scratch());
            new
        } else {
            unreachable!("invalid current location {current}");
        }
    }

    /// Reserve a register with no pre-existing value, spilling its occupant if any.
    pub fn scratch_reg(&mut self, code: &mut CodeStream, desired: &[HostLoc]) -> HostLoc {
        debug_assert!(desired.iter().all(HostLoc::is_register));

        let location = self.select_a_register(desired);
        if self.is_occupied(location) {
            self.spill_register(code, location);
        }

        self.loc_info_mut(location).lock();
        debug_assert!(self.loc_info(location).is_scratch());
        location
    }

    /// Reserve a result register for `def_inst` and bind the definition to it.
    pub fn def_reg(&mut self, code: &mut CodeStream, def_inst: InstIdx, desired: &[HostLoc]) -> HostLoc {
        let location = self.scratch_reg(code, desired);
        self.define_value(def_inst, location);
        location
    }

    /// Fused operand pair for a two-address instruction: the source operand (possibly
    /// a spill-slot memory reference) and a fresh destination register bound to
    /// `def_inst`. The caller moves the source into the destination itself.
    pub fn use_def_op(
        &mut self,
        code: &mut CodeStream,
        use_value: Value,
        def_inst: InstIdx,
        desired: &[HostLoc],
    ) -> (OpArg, HostLoc) {
        debug_assert!(desired.iter().all(HostLoc::is_register));
        debug_assert!(
            self.value_location(def_inst).is_none(),
            "%{} has already been defined",
            usize::from(def_inst)
        );

        if !use_value.is_immediate() {
            let use_inst = use_value.inst();

            // Share the source's location with the destination, saving the move.
            // Unreachable until `is_last_use` is implemented; see that function.
            if self.is_last_use(use_inst) {
                let current = self.value_location(use_inst).unwrap();
                if self.loc_info(current).is_idle() {
                    self.loc_info_mut(current).lock();
                    self.block.decrement_remaining_uses(use_inst);
                    if current.is_spill() {
                        let location = self.scratch_reg(code, desired);
                        self.define_value(def_inst, location);
                        return (OpArg::Spill(current.spill_slot()), location);
                    }
                    self.define_value(def_inst, current);
                    return (OpArg::Reg(current.reg()), current);
                }
            }
        }

        let use_oparg = if use_value.is_immediate() {
            OpArg::Reg(self.use_reg(code, use_value, &GPR_ORDER).reg())
        } else {
            self.use_op(code, use_value, &GPR_ORDER)
        };
        let def_reg = self.scratch_reg(code, desired);
        self.define_value(def_inst, def_reg);
        (use_oparg, def_reg)
    }

    /// Define `def_inst` as an alias of `use_value`: same location, no move. An
    /// immediate is materialised into a scratch register instead.
    pub fn register_add_def(&mut self, code: &mut CodeStream, def_inst: InstIdx, use_value: Value) {
        debug_assert!(
            self.value_location(def_inst).is_none(),
            "%{} has already been defined",
            usize::from(def_inst)
        );

        if use_value.is_immediate() {
            let location = self.scratch_reg(code, &GPR_ORDER);
            self.define_value(def_inst, location);
            self.load_immediate_into_reg(code, use_value, location);
            return;
        }

        let use_inst = use_value.inst();
        self.block.decrement_remaining_uses(use_inst);
        let location = self
            .value_location(use_inst)
            .unwrap_or_else(|| panic!("%{} must already be defined", usize::from(use_inst)));
        self.define_value(def_inst, location);
    }

    /// Prepare for a native call under the host ABI: the return register is reserved
    /// (and bound to `result_def` if given), each present argument is copied into its
    /// parameter register, each absent slot's parameter register is reserved, and
    /// every other caller-saved register is reserved so the call clobbers nothing the
    /// allocator still cares about.
    pub fn host_call(
        &mut self,
        code: &mut CodeStream,
        result_def: Option<InstIdx>,
        args: [Value; 4],
    ) {
        const ARGS_HOSTLOC: [HostLoc; 4] = [ABI_PARAM1, ABI_PARAM2, ABI_PARAM3, ABI_PARAM4];

        match result_def {
            Some(def_inst) => {
                let location = self.scratch_reg(code, &[ABI_RETURN]);
                self.define_value(def_inst, location);
            }
            None => {
                self.scratch_reg(code, &[ABI_RETURN]);
            }
        }

        for (arg, hostloc) in args.iter().zip(ARGS_HOSTLOC) {
            if !arg.is_empty() {
                self.use_scratch_reg(code, *arg, &[hostloc]);
            } else {
                self.scratch_reg(code, &[hostloc]);
            }
        }

        for caller_saved in OTHER_CALLER_SAVE {
            self.scratch_reg(code, &[caller_saved]);
        }
    }

    /// Consume one use of `value` without placing it anywhere. For operands whose
    /// value is statically irrelevant to the emitted code (e.g. the incoming carry of
    /// a shift whose carry-out nobody reads, when the normalising pass has not run).
    pub fn discard_use(&mut self, value: Value) {
        if let Value::Inst(iidx) = value {
            self.block.decrement_remaining_uses(iidx);
        }
    }

    /// Instruction boundary: every use lock reverts to idle, every scratch
    /// reservation is released, and values with no remaining uses are evicted.
    pub fn end_of_alloc_scope(&mut self) {
        let block: &Block = self.block;
        for info in self.locs.iter_mut() {
            info.end_of_alloc_scope(block);
        }
    }

    /// Block-boundary check: nothing may still be resident.
    pub fn assert_no_more_uses(&self) {
        assert!(
            self.locs.iter().all(LocInfo::is_empty),
            "values are still resident at the end of the block"
        );
    }

    pub fn reset(&mut self) {
        for info in self.locs.iter_mut() {
            *info = LocInfo::default();
        }
    }

    /// The current home of `iidx`, if it has one.
    pub fn value_location(&self, iidx: InstIdx) -> Option<HostLoc> {
        (0..HOST_LOC_COUNT)
            .find(|i| self.locs[HostLocIdx::from_usize(*i)].contains_value(iidx))
            .map(HostLoc::from_index)
    }

    /// Bind the definition of `def_inst` to `host_loc`.
    pub fn define_value(&mut self, def_inst: InstIdx, host_loc: HostLoc) {
        debug_assert!(
            self.value_location(def_inst).is_none(),
            "%{} has already been defined",
            usize::from(def_inst)
        );
        self.loc_info_mut(host_loc).add_value(def_inst);
    }

    pub fn is_value_live(&self, iidx: InstIdx) -> bool {
        self.value_location(iidx).is_some()
    }

    // -- Selection and movement --

    /// Pick a location out of `desired` (in preference order): locked entries are
    /// ineligible, unoccupied entries are preferred over occupied ones.
    fn select_a_register(&self, desired: &[HostLoc]) -> HostLoc {
        let candidates: SmallVec<[HostLoc; 8]> = desired
            .iter()
            .copied()
            .filter(|loc| !self.loc_info(*loc).is_locked())
            .collect();
        assert!(
            !candidates.is_empty(),
            "all candidate registers have already been allocated"
        );

        // TODO: do LRU or something. Currently we just pick something without a value
        // if possible.
        candidates
            .iter()
            .copied()
            .find(|loc| !self.is_occupied(*loc))
            .unwrap_or(candidates[0])
    }

    fn is_occupied(&self, loc: HostLoc) -> bool {
        !self.loc_info(loc).is_empty()
    }

    /// Hook for the "reuse the source register as the destination" fast path in
    /// [RegAlloc::use_def_op]. Always false: enabling it requires tracking whether a
    /// value is resident in exactly one location, and a half-measure would let two
    /// locations claim the same live value.
    fn is_last_use(&self, _iidx: InstIdx) -> bool {
        false
    }

    /// Evict the occupant of `loc` to the first free spill slot, transplanting its
    /// record wholesale.
    fn spill_register(&mut self, code: &mut CodeStream, loc: HostLoc) {
        assert!(loc.is_register(), "only registers can be spilled");
        assert!(self.is_occupied(loc), "no need to spill an unoccupied register");
        assert!(!self.loc_info(loc).is_locked(), "cannot spill a locked register");

        let new_loc = self.find_free_spill();
        emit_move(code, new_loc, loc);
        *self.loc_info_mut(new_loc) = self.loc_info(loc).clone();
        *self.loc_info_mut(loc) = LocInfo::default();
    }

    fn find_free_spill(&self) -> HostLoc {
        crate::x64::regs::spill_slots()
            .find(|loc| !self.is_occupied(*loc))
            .unwrap_or_else(|| panic!("all spill slots are full"))
    }

    fn move_out_of_the_way(&mut self, code: &mut CodeStream, reg: HostLoc) {
        assert!(!self.loc_info(reg).is_locked());
        if self.is_occupied(reg) {
            self.spill_register(code, reg);
        }
    }

    /// Move the contents (bits and record) of `from` into the empty `to`.
    fn move_value(&mut self, code: &mut CodeStream, to: HostLoc, from: HostLoc) {
        assert!(self.loc_info(to).is_empty() && !self.loc_info(from).is_locked());

        if self.loc_info(from).is_empty() {
            return;
        }

        *self.loc_info_mut(to) = self.loc_info(from).clone();
        *self.loc_info_mut(from) = LocInfo::default();

        emit_move(code, to, from);
    }

    fn exchange(&mut self, code: &mut CodeStream, a: HostLoc, b: HostLoc) {
        assert!(!self.loc_info(a).is_locked() && !self.loc_info(b).is_locked());

        if self.loc_info(a).is_empty() {
            self.move_value(code, a, b);
            return;
        }

        if self.loc_info(b).is_empty() {
            self.move_value(code, b, a);
            return;
        }

        let tmp = self.loc_info(a).clone();
        *self.loc_info_mut(a) = self.loc_info(b).clone();
        *self.loc_info_mut(b) = tmp;

        emit_exchange(code, a, b);
    }

    /// Materialise an immediate into a GPR. Zero gets the short xor-self idiom, which
    /// also zero-extends implicitly.
    fn load_immediate_into_reg(
        &mut self,
        code: &mut CodeStream,
        imm: Value,
        host_loc: HostLoc,
    ) -> HostLoc {
        assert!(imm.is_immediate(), "imm is not an immediate");
        assert!(host_loc.is_gpr(), "immediates are materialised into GPRs");

        let reg = host_loc.reg();
        let imm_value = imm.imm_u64();
        if imm_value == 0 {
            code.xor32(reg, reg);
        } else {
            code.mov_imm64(reg, imm_value);
        }
        host_loc
    }

    fn loc_info(&self, loc: HostLoc) -> &LocInfo {
        &self.locs[HostLocIdx::from_usize(loc.index())]
    }

    fn loc_info_mut(&mut self, loc: HostLoc) -> &mut LocInfo {
        &mut self.locs[HostLocIdx::from_usize(loc.index())]
    }
}

fn is_same_class(a: HostLoc, b: HostLoc) -> bool {
    (a.is_gpr() && b.is_gpr()) || (a.is_xmm() && b.is_xmm()) || (a.is_spill() && b.is_spill())
}

/// Emit the move matching the class combination of `to` and `from`.
fn emit_move(code: &mut CodeStream, to: HostLoc, from: HostLoc) {
    if to.is_xmm() && from.is_xmm() {
        code.movaps(to.reg(), from.reg());
    } else if to.is_gpr() && from.is_gpr() {
        code.mov64(OpArg::Reg(to.reg()), OpArg::Reg(from.reg()));
    } else if to.is_xmm() && from.is_gpr() {
        panic!("TODO: vector <- gpr moves are not implemented");
    } else if to.is_gpr() && from.is_xmm() {
        panic!("TODO: gpr <- vector moves are not implemented");
    } else if to.is_xmm() && from.is_spill() {
        code.movsd(OpArg::Reg(to.reg()), OpArg::Spill(from.spill_slot()));
    } else if to.is_spill() && from.is_xmm() {
        code.movsd(OpArg::Spill(to.spill_slot()), OpArg::Reg(from.reg()));
    } else if to.is_gpr() && from.is_spill() {
        code.mov64(OpArg::Reg(to.reg()), OpArg::Spill(from.spill_slot()));
    } else if to.is_spill() && from.is_gpr() {
        code.mov64(OpArg::Spill(to.spill_slot()), OpArg::Reg(from.reg()));
    } else {
        panic!("invalid move {to} <- {from}");
    }
}

fn emit_exchange(code: &mut CodeStream, a: HostLoc, b: HostLoc) {
    if a.is_gpr() && b.is_gpr() {
        code.xchg64(a.reg(), b.reg());
    } else if a.is_xmm() && b.is_xmm() {
        panic!("check your code: exchanging vector registers is unnecessary");
    } else {
        panic!("invalid exchange {a} <-> {b}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BlockBuilder, GuestReg, Terminal};
    use crate::x64::regs::{Reg, XMM_ORDER};
    use iced_x86::Mnemonic;

    const RAX: HostLoc = HostLoc::Reg(Reg::RAX);
    const RBX: HostLoc = HostLoc::Reg(Reg::RBX);
    const R8: HostLoc = HostLoc::Reg(Reg::R8);
    const R9: HostLoc = HostLoc::Reg(Reg::R9);

    /// A block with `n` values, each with `uses` remaining consumers.
    fn block_with_values(n: usize, uses: usize) -> (Block, Vec<InstIdx>) {
        let mut bb = BlockBuilder::new(0);
        let mut vals = Vec::new();
        for _ in 0..n {
            let v = bb.get_guest_reg(GuestReg(0));
            for _ in 0..uses {
                bb.set_guest_reg(GuestReg(31), v);
            }
            vals.push(v.inst());
        }
        (bb.finish(Terminal::Return), vals)
    }

    fn mnemonics(code: &CodeStream) -> Vec<Mnemonic> {
        code.ops().iter().map(|op| op.mnemonic()).collect()
    }

    fn locations_of(ra: &RegAlloc<'_>, iidx: InstIdx) -> usize {
        (0..HOST_LOC_COUNT)
            .filter(|i| ra.locs[HostLocIdx::from_usize(*i)].contains_value(iidx))
            .count()
    }

    // A scratch request against an occupied, unlocked register spills the occupant to
    // the first free slot and leaves the register scratch with an empty value set.
    #[test]
    fn scratch_evicts_idle_occupant_to_first_free_spill() {
        let (mut block, vals) = block_with_values(1, 1);
        let v = vals[0];
        let mut ra = RegAlloc::new(&mut block);
        let mut code = CodeStream::new();

        ra.def_reg(&mut code, v, &[RAX]);
        ra.end_of_alloc_scope();
        assert!(ra.loc_info(RAX).is_idle());

        let got = ra.scratch_reg(&mut code, &[RAX]);
        assert_eq!(got, RAX);
        assert!(ra.loc_info(RAX).is_scratch());
        assert!(ra.loc_info(RAX).values.is_empty());
        assert_eq!(ra.value_location(v), Some(HostLoc::Spill(0)));

        // One move was emitted: a store of RAX into slot 0.
        assert_eq!(mnemonics(&code), vec![Mnemonic::Mov]);
        let op = code.ops()[0];
        assert_eq!(op.memory_base(), iced_x86::Register::R15);
    }

    // Every use/scratch operation leaves the returned location locked, and
    // end_of_alloc_scope releases every lock.
    #[test]
    fn locks_are_held_until_scope_end() {
        let (mut block, vals) = block_with_values(1, 2);
        let v = vals[0];
        let mut ra = RegAlloc::new(&mut block);
        let mut code = CodeStream::new();

        ra.def_reg(&mut code, v, &GPR_ORDER);
        ra.end_of_alloc_scope();

        let loc = ra.use_reg(&mut code, Value::Inst(v), &GPR_ORDER);
        assert!(ra.loc_info(loc).is_use());

        let scratch = ra.scratch_reg(&mut code, &GPR_ORDER);
        assert!(ra.loc_info(scratch).is_scratch());

        ra.end_of_alloc_scope();
        for i in 0..HOST_LOC_COUNT {
            let info = &ra.locs[HostLocIdx::from_usize(i)];
            assert!(!info.is_use() && !info.is_scratch());
        }
        // v still has a remaining use, so it survived eviction, in exactly one place.
        assert_eq!(locations_of(&ra, v), 1);
    }

    // A value whose use count reaches zero is evicted at the scope boundary.
    #[test]
    fn dead_values_are_evicted_at_scope_end() {
        let (mut block, vals) = block_with_values(1, 1);
        let v = vals[0];
        let mut ra = RegAlloc::new(&mut block);
        let mut code = CodeStream::new();

        ra.def_reg(&mut code, v, &GPR_ORDER);
        ra.end_of_alloc_scope();
        ra.use_reg(&mut code, Value::Inst(v), &GPR_ORDER);
        ra.end_of_alloc_scope();

        assert_eq!(ra.value_location(v), None);
        ra.assert_no_more_uses();
    }

    #[test]
    fn use_reg_prefers_the_current_location() {
        let (mut block, vals) = block_with_values(1, 1);
        let v = vals[0];
        let mut ra = RegAlloc::new(&mut block);
        let mut code = CodeStream::new();

        ra.def_reg(&mut code, v, &[RBX]);
        ra.end_of_alloc_scope();

        let before = code.len();
        let loc = ra.use_reg(&mut code, Value::Inst(v), &GPR_ORDER);
        assert_eq!(loc, RBX);
        // No movement was needed.
        assert_eq!(code.len(), before);
    }

    // When the value sits outside `desired` and the desired register holds another
    // value of the same class, the two are exchanged rather than spilled.
    #[test]
    fn use_reg_exchanges_within_a_class() {
        let (mut block, vals) = block_with_values(2, 1);
        let (a, b) = (vals[0], vals[1]);
        let mut ra = RegAlloc::new(&mut block);
        let mut code = CodeStream::new();

        ra.def_reg(&mut code, a, &[RAX]);
        ra.def_reg(&mut code, b, &[RBX]);
        ra.end_of_alloc_scope();

        let loc = ra.use_reg(&mut code, Value::Inst(a), &[RBX]);
        assert_eq!(loc, RBX);
        assert_eq!(*mnemonics(&code).last().unwrap(), Mnemonic::Xchg);
        assert_eq!(ra.value_location(a), Some(RBX));
        assert_eq!(ra.value_location(b), Some(RAX));
        assert_eq!(locations_of(&ra, a), 1);
        assert_eq!(locations_of(&ra, b), 1);
    }

    #[test]
    fn use_reg_materialises_immediates() {
        let (mut block, _) = block_with_values(0, 0);
        let mut ra = RegAlloc::new(&mut block);
        let mut code = CodeStream::new();

        let zero = ra.use_reg(&mut code, Value::U32(0), &[RAX]);
        assert!(ra.loc_info(zero).is_scratch());
        let nonzero = ra.use_reg(&mut code, Value::U64(0x1234), &[RBX]);
        assert!(ra.loc_info(nonzero).is_scratch());

        // Zero uses the xor-self idiom; everything else a full-width mov.
        assert_eq!(mnemonics(&code), vec![Mnemonic::Xor, Mnemonic::Mov]);
    }

    #[test]
    fn use_op_returns_a_memory_operand_for_spilled_values() {
        let (mut block, vals) = block_with_values(1, 2);
        let v = vals[0];
        let mut ra = RegAlloc::new(&mut block);
        let mut code = CodeStream::new();

        ra.def_reg(&mut code, v, &[RAX]);
        ra.end_of_alloc_scope();
        // Force v out of RAX.
        ra.scratch_reg(&mut code, &[RAX]);
        ra.end_of_alloc_scope();
        assert_eq!(ra.value_location(v), Some(HostLoc::Spill(0)));

        let oparg = ra.use_op(&mut code, Value::Inst(v), &GPR_ORDER);
        assert_eq!(oparg, OpArg::Spill(0));
        assert!(ra.loc_info(HostLoc::Spill(0)).is_use());
    }

    #[test]
    #[should_panic(expected = "use_op does not support immediates")]
    fn use_op_rejects_immediates() {
        let (mut block, _) = block_with_values(0, 0);
        let mut ra = RegAlloc::new(&mut block);
        let mut code = CodeStream::new();
        ra.use_op(&mut code, Value::U32(1), &GPR_ORDER);
    }

    // use_scratch_reg on a value living elsewhere copies it and leaves the original
    // record intact; the copy is the caller's to destroy.
    #[test]
    fn use_scratch_copies_and_preserves_the_source() {
        let (mut block, vals) = block_with_values(1, 2);
        let v = vals[0];
        let mut ra = RegAlloc::new(&mut block);
        let mut code = CodeStream::new();

        ra.def_reg(&mut code, v, &[R8]);
        ra.end_of_alloc_scope();

        let loc = ra.use_scratch_reg(&mut code, Value::Inst(v), &[RAX]);
        assert_eq!(loc, RAX);
        assert!(ra.loc_info(RAX).is_scratch());
        assert!(ra.loc_info(RAX).values.is_empty());
        assert_eq!(ra.value_location(v), Some(R8));
        assert_eq!(*mnemonics(&code).last().unwrap(), Mnemonic::Mov);
    }

    // host_call marshals arguments into the ABI registers and reserves everything
    // caller-saved.
    #[test]
    fn host_call_marshals_args_and_reserves_caller_save() {
        let (mut block, vals) = block_with_values(3, 2);
        let (r, a, b) = (vals[0], vals[1], vals[2]);
        let mut ra = RegAlloc::new(&mut block);
        let mut code = CodeStream::new();

        ra.def_reg(&mut code, a, &[R8]);
        ra.def_reg(&mut code, b, &[R9]);
        ra.end_of_alloc_scope();

        ra.host_call(
            &mut code,
            Some(r),
            [Value::Inst(a), Value::Inst(b), Value::Void, Value::Void],
        );

        // The result is defined in the return register.
        assert_eq!(ra.value_location(r), Some(ABI_RETURN));
        // The five ABI locations and every other caller-saved register are reserved.
        for loc in [ABI_RETURN, ABI_PARAM1, ABI_PARAM2, ABI_PARAM3, ABI_PARAM4] {
            assert!(ra.loc_info(loc).is_locked(), "{loc} not locked");
        }
        for loc in OTHER_CALLER_SAVE {
            assert!(ra.loc_info(loc).is_scratch(), "{loc} not scratch");
        }
        // a and b were copied into the first two parameter registers; their surviving
        // homes were then spilled when R8/R9 were reserved.
        assert!(ra.value_location(a).unwrap().is_spill());
        assert!(ra.value_location(b).unwrap().is_spill());
    }

    // With four present arguments and a result, every ABI location is individually
    // reserved and bound.
    #[test]
    fn host_call_with_four_arguments() {
        let (mut block, vals) = block_with_values(5, 2);
        let r = vals[0];
        let mut ra = RegAlloc::new(&mut block);
        let mut code = CodeStream::new();

        for (v, loc) in vals[1..].iter().zip([RAX, RBX, R8, R9]) {
            ra.def_reg(&mut code, *v, &[loc]);
        }
        ra.end_of_alloc_scope();

        ra.host_call(
            &mut code,
            Some(r),
            [
                Value::Inst(vals[1]),
                Value::Inst(vals[2]),
                Value::Inst(vals[3]),
                Value::Inst(vals[4]),
            ],
        );

        assert_eq!(ra.value_location(r), Some(ABI_RETURN));
        for loc in [ABI_PARAM1, ABI_PARAM2, ABI_PARAM3, ABI_PARAM4] {
            assert!(ra.loc_info(loc).is_scratch(), "{loc} not scratch");
        }
        for loc in OTHER_CALLER_SAVE {
            assert!(ra.loc_info(loc).is_scratch(), "{loc} not scratch");
        }
        // Each argument kept a surviving home outside the locked ABI set.
        for v in &vals[1..] {
            let home = ra.value_location(*v).unwrap();
            assert!(!ra.loc_info(home).is_locked(), "{home} should be unlocked");
        }
    }

    // With last-use detection disabled, use_def_op takes the fallback
    // path: a distinct destination register and no implicit move.
    #[test]
    fn use_def_op_allocates_a_distinct_destination() {
        let (mut block, vals) = block_with_values(2, 1);
        let (t, u) = (vals[0], vals[1]);
        let mut ra = RegAlloc::new(&mut block);
        let mut code = CodeStream::new();

        ra.def_reg(&mut code, t, &[RAX]);
        ra.end_of_alloc_scope();

        let before = code.len();
        let (oparg, def) = ra.use_def_op(&mut code, Value::Inst(t), u, &GPR_ORDER);
        assert_eq!(oparg, OpArg::Reg(Reg::RAX));
        assert_ne!(def, RAX);
        assert!(ra.loc_info(def).is_scratch());
        assert_eq!(ra.value_location(u), Some(def));
        // use_def_op itself emits nothing; the caller owns the move.
        assert_eq!(code.len(), before);
    }

    #[test]
    fn register_add_def_aliases_without_a_move() {
        let (mut block, vals) = block_with_values(2, 2);
        let (v, alias) = (vals[0], vals[1]);
        let mut ra = RegAlloc::new(&mut block);
        let mut code = CodeStream::new();

        ra.def_reg(&mut code, v, &[RBX]);
        ra.end_of_alloc_scope();

        let before = code.len();
        ra.register_add_def(&mut code, alias, Value::Inst(v));
        assert_eq!(code.len(), before);
        // Both values now name RBX as home.
        assert_eq!(ra.value_location(v), Some(RBX));
        assert_eq!(ra.value_location(alias), Some(RBX));
        assert_eq!(ra.loc_info(RBX).values.len(), 2);
    }

    #[test]
    fn select_prefers_unoccupied_in_preference_order() {
        let (mut block, vals) = block_with_values(1, 1);
        let v = vals[0];
        let mut ra = RegAlloc::new(&mut block);
        let mut code = CodeStream::new();

        ra.def_reg(&mut code, v, &[RAX]);
        ra.end_of_alloc_scope();

        // RAX is occupied, RBX is free: the scratch lands on RBX even though RAX is
        // earlier in preference order.
        let loc = ra.scratch_reg(&mut code, &[RAX, RBX]);
        assert_eq!(loc, RBX);
        // v was not disturbed; selection never spills when a free candidate exists.
        assert_eq!(ra.value_location(v), Some(RAX));
    }

    #[test]
    #[should_panic(expected = "all candidate registers have already been allocated")]
    fn select_fails_hard_when_every_candidate_is_locked() {
        let (mut block, _) = block_with_values(0, 0);
        let mut ra = RegAlloc::new(&mut block);
        let mut code = CodeStream::new();

        ra.scratch_reg(&mut code, &[RAX]);
        ra.scratch_reg(&mut code, &[RAX]);
    }

    #[test]
    #[should_panic(expected = "ran out of uses")]
    fn consuming_past_the_use_count_is_a_caller_bug() {
        let (mut block, vals) = block_with_values(1, 1);
        let v = vals[0];
        let mut ra = RegAlloc::new(&mut block);
        let mut code = CodeStream::new();

        ra.def_reg(&mut code, v, &GPR_ORDER);
        ra.end_of_alloc_scope();
        ra.use_scratch_reg(&mut code, Value::Inst(v), &GPR_ORDER);
        ra.end_of_alloc_scope();
        ra.use_scratch_reg(&mut code, Value::Inst(v), &GPR_ORDER);
    }

    #[test]
    #[should_panic(expected = "all spill slots are full")]
    fn spill_exhaustion_fails_hard() {
        let (mut block, vals) = block_with_values(crate::x64::regs::SPILL_COUNT + 1, 1);
        let mut ra = RegAlloc::new(&mut block);
        let mut code = CodeStream::new();

        for v in vals {
            ra.def_reg(&mut code, v, &[RAX]);
            ra.end_of_alloc_scope();
            // Each new scratch request pushes the previous occupant out to the next
            // free slot; the 65th has nowhere to go.
            ra.scratch_reg(&mut code, &[RAX]);
            ra.end_of_alloc_scope();
        }
    }

    #[test]
    fn vector_values_spill_with_scalar_double_moves() {
        let (mut block, vals) = block_with_values(1, 2);
        let v = vals[0];
        let mut ra = RegAlloc::new(&mut block);
        let mut code = CodeStream::new();

        ra.def_reg(&mut code, v, &XMM_ORDER);
        ra.end_of_alloc_scope();
        ra.scratch_reg(&mut code, &[HostLoc::Reg(Reg::XMM0)]);

        assert_eq!(*mnemonics(&code).last().unwrap(), Mnemonic::Movsd);
        assert_eq!(ra.value_location(v), Some(HostLoc::Spill(0)));

        // And back: using it in a vector register reloads with movsd.
        ra.end_of_alloc_scope();
        let loc = ra.use_reg(&mut code, Value::Inst(v), &[HostLoc::Reg(Reg::XMM1)]);
        assert_eq!(loc, HostLoc::Reg(Reg::XMM1));
        assert_eq!(*mnemonics(&code).last().unwrap(), Mnemonic::Movsd);
    }

    #[test]
    #[should_panic(expected = "TODO")]
    fn gpr_to_vector_moves_are_unimplemented() {
        let (mut block, vals) = block_with_values(1, 2);
        let v = vals[0];
        let mut ra = RegAlloc::new(&mut block);
        let mut code = CodeStream::new();

        ra.def_reg(&mut code, v, &[RAX]);
        ra.end_of_alloc_scope();
        // Cross-class placement request: the move matrix has no entry for it.
        ra.use_reg(&mut code, Value::Inst(v), &XMM_ORDER);
    }

    #[test]
    #[should_panic(expected = "exchanging vector registers is unnecessary")]
    fn vector_exchange_is_forbidden() {
        let (mut block, vals) = block_with_values(2, 1);
        let (a, b) = (vals[0], vals[1]);
        let mut ra = RegAlloc::new(&mut block);
        let mut code = CodeStream::new();

        ra.def_reg(&mut code, a, &[HostLoc::Reg(Reg::XMM0)]);
        ra.def_reg(&mut code, b, &[HostLoc::Reg(Reg::XMM1)]);
        ra.end_of_alloc_scope();
        ra.use_reg(&mut code, Value::Inst(a), &[HostLoc::Reg(Reg::XMM1)]);
    }

    // reset empties every record.
    #[test]
    fn reset_clears_all_state() {
        let (mut block, vals) = block_with_values(1, 5);
        let v = vals[0];
        let mut ra = RegAlloc::new(&mut block);
        let mut code = CodeStream::new();

        ra.def_reg(&mut code, v, &GPR_ORDER);
        ra.reset();
        for i in 0..HOST_LOC_COUNT {
            assert!(ra.locs[HostLocIdx::from_usize(i)].is_empty());
        }
    }
}
