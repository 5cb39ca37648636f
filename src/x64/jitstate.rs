//! The guest state block.
//!
//! Compiled blocks receive a pointer to a [JitState] in `RDI` and pin it in `R15` for
//! their whole run. Everything the generated code touches in memory (guest registers,
//! the successor PC, and the allocator's spill slots) lives at a fixed offset from
//! that pointer.

use crate::ir::GuestReg;
use crate::x64::regs::{SPILL_COUNT, SPILL_SLOT_SIZE};
use std::mem::offset_of;

/// Number of guest registers in the state block.
pub const GUEST_REG_COUNT: usize = 32;

#[derive(Clone, Debug)]
#[repr(C)]
pub struct JitState {
    pub guest_regs: [u64; GUEST_REG_COUNT],
    /// The next guest PC, written by the block's terminal.
    pub pc: u64,
    /// Spill area. Only the block currently being executed touches this, and only
    /// between its entry and exit.
    pub spill: [[u8; SPILL_SLOT_SIZE]; SPILL_COUNT],
}

impl JitState {
    pub fn new() -> Self {
        Self {
            guest_regs: [0; GUEST_REG_COUNT],
            pc: 0,
            spill: [[0; SPILL_SLOT_SIZE]; SPILL_COUNT],
        }
    }
}

impl Default for JitState {
    fn default() -> Self {
        Self::new()
    }
}

pub fn guest_reg_offset(r: GuestReg) -> i64 {
    assert!(usize::from(r.0) < GUEST_REG_COUNT);
    (offset_of!(JitState, guest_regs) + usize::from(r.0) * 8) as i64
}

pub fn pc_offset() -> i64 {
    offset_of!(JitState, pc) as i64
}

pub fn spill_offset(slot: u8) -> i64 {
    assert!(usize::from(slot) < SPILL_COUNT);
    (offset_of!(JitState, spill) + usize::from(slot) * SPILL_SLOT_SIZE) as i64
}
