//! The x64 storage-location catalog and ABI description.

use iced_x86::Register;
use strum::{EnumCount, FromRepr};

/// Number of anonymous spill slots in the guest state block.
pub const SPILL_COUNT: usize = 64;

/// Spill slots are wide enough for the widest register class (a vector register).
pub const SPILL_SLOT_SIZE: usize = 16;

/// A named host register.
#[derive(Clone, Copy, Debug, EnumCount, FromRepr, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    RAX = 0,
    RCX,
    RDX,
    RBX,
    RSP,
    RBP,
    RSI,
    RDI,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,

    XMM0,
    XMM1,
    XMM2,
    XMM3,
    XMM4,
    XMM5,
    XMM6,
    XMM7,
    XMM8,
    XMM9,
    XMM10,
    XMM11,
    XMM12,
    XMM13,
    XMM14,
    XMM15,
}

impl Reg {
    pub fn is_gpr(&self) -> bool {
        (*self as u8) < (Reg::XMM0 as u8)
    }

    pub fn is_xmm(&self) -> bool {
        !self.is_gpr()
    }

    pub fn to_reg8(self) -> Register {
        match self {
            Reg::RAX => Register::AL,
            Reg::RCX => Register::CL,
            Reg::RDX => Register::DL,
            Reg::RBX => Register::BL,
            Reg::RSP => Register::SPL,
            Reg::RBP => Register::BPL,
            Reg::RSI => Register::SIL,
            Reg::RDI => Register::DIL,
            Reg::R8 => Register::R8L,
            Reg::R9 => Register::R9L,
            Reg::R10 => Register::R10L,
            Reg::R11 => Register::R11L,
            Reg::R12 => Register::R12L,
            Reg::R13 => Register::R13L,
            Reg::R14 => Register::R14L,
            Reg::R15 => Register::R15L,
            x => unreachable!("{x:?}"),
        }
    }

    pub fn to_reg16(self) -> Register {
        match self {
            Reg::RAX => Register::AX,
            Reg::RCX => Register::CX,
            Reg::RDX => Register::DX,
            Reg::RBX => Register::BX,
            Reg::RSP => Register::SP,
            Reg::RBP => Register::BP,
            Reg::RSI => Register::SI,
            Reg::RDI => Register::DI,
            Reg::R8 => Register::R8W,
            Reg::R9 => Register::R9W,
            Reg::R10 => Register::R10W,
            Reg::R11 => Register::R11W,
            Reg::R12 => Register::R12W,
            Reg::R13 => Register::R13W,
            Reg::R14 => Register::R14W,
            Reg::R15 => Register::R15W,
            x => unreachable!("{x:?}"),
        }
    }

    pub fn to_reg32(self) -> Register {
        match self {
            Reg::RAX => Register::EAX,
            Reg::RCX => Register::ECX,
            Reg::RDX => Register::EDX,
            Reg::RBX => Register::EBX,
            Reg::RSP => Register::ESP,
            Reg::RBP => Register::EBP,
            Reg::RSI => Register::ESI,
            Reg::RDI => Register::EDI,
            Reg::R8 => Register::R8D,
            Reg::R9 => Register::R9D,
            Reg::R10 => Register::R10D,
            Reg::R11 => Register::R11D,
            Reg::R12 => Register::R12D,
            Reg::R13 => Register::R13D,
            Reg::R14 => Register::R14D,
            Reg::R15 => Register::R15D,
            x => unreachable!("{x:?}"),
        }
    }

    pub fn to_reg64(self) -> Register {
        match self {
            Reg::RAX => Register::RAX,
            Reg::RCX => Register::RCX,
            Reg::RDX => Register::RDX,
            Reg::RBX => Register::RBX,
            Reg::RSP => Register::RSP,
            Reg::RBP => Register::RBP,
            Reg::RSI => Register::RSI,
            Reg::RDI => Register::RDI,
            Reg::R8 => Register::R8,
            Reg::R9 => Register::R9,
            Reg::R10 => Register::R10,
            Reg::R11 => Register::R11,
            Reg::R12 => Register::R12,
            Reg::R13 => Register::R13,
            Reg::R14 => Register::R14,
            Reg::R15 => Register::R15,
            x => unreachable!("{x:?}"),
        }
    }

    pub fn to_xmm(self) -> Register {
        match self {
            Reg::XMM0 => Register::XMM0,
            Reg::XMM1 => Register::XMM1,
            Reg::XMM2 => Register::XMM2,
            Reg::XMM3 => Register::XMM3,
            Reg::XMM4 => Register::XMM4,
            Reg::XMM5 => Register::XMM5,
            Reg::XMM6 => Register::XMM6,
            Reg::XMM7 => Register::XMM7,
            Reg::XMM8 => Register::XMM8,
            Reg::XMM9 => Register::XMM9,
            Reg::XMM10 => Register::XMM10,
            Reg::XMM11 => Register::XMM11,
            Reg::XMM12 => Register::XMM12,
            Reg::XMM13 => Register::XMM13,
            Reg::XMM14 => Register::XMM14,
            Reg::XMM15 => Register::XMM15,
            x => unreachable!("{x:?}"),
        }
    }
}

impl std::fmt::Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", format!("{self:?}").to_lowercase())
    }
}

/// A storage location the allocator can assign a value to: a host register or one of
/// the [SPILL_COUNT] spill slots in the guest state block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HostLoc {
    Reg(Reg),
    Spill(u8),
}

/// Total number of [HostLoc]s, for dense per-location tables.
pub const HOST_LOC_COUNT: usize = Reg::COUNT + SPILL_COUNT;

impl HostLoc {
    pub fn is_gpr(&self) -> bool {
        matches!(self, HostLoc::Reg(r) if r.is_gpr())
    }

    pub fn is_xmm(&self) -> bool {
        matches!(self, HostLoc::Reg(r) if r.is_xmm())
    }

    pub fn is_spill(&self) -> bool {
        matches!(self, HostLoc::Spill(_))
    }

    pub fn is_register(&self) -> bool {
        matches!(self, HostLoc::Reg(_))
    }

    /// The named register. Panics on spill slots.
    pub fn reg(&self) -> Reg {
        match self {
            HostLoc::Reg(r) => *r,
            HostLoc::Spill(i) => panic!("spill slot {i} is not a register"),
        }
    }

    pub fn spill_slot(&self) -> u8 {
        match self {
            HostLoc::Spill(i) => *i,
            HostLoc::Reg(r) => panic!("{r} is not a spill slot"),
        }
    }

    /// Dense index into per-location tables.
    pub fn index(&self) -> usize {
        match self {
            HostLoc::Reg(r) => *r as usize,
            HostLoc::Spill(i) => Reg::COUNT + usize::from(*i),
        }
    }

    pub fn from_index(idx: usize) -> HostLoc {
        assert!(idx < HOST_LOC_COUNT);
        if idx < Reg::COUNT {
            HostLoc::Reg(Reg::from_repr(idx as u8).unwrap())
        } else {
            HostLoc::Spill((idx - Reg::COUNT) as u8)
        }
    }
}

impl std::fmt::Display for HostLoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostLoc::Reg(r) => write!(f, "{r}"),
            HostLoc::Spill(i) => write!(f, "spill{i}"),
        }
    }
}

/// General-purpose registers available to the allocator, in preference order. RSP is
/// the host stack pointer and R15 is pinned to the guest state block; neither is ever
/// handed out.
pub const GPR_ORDER: [HostLoc; 14] = [
    HostLoc::Reg(Reg::RAX),
    HostLoc::Reg(Reg::RBX),
    HostLoc::Reg(Reg::RCX),
    HostLoc::Reg(Reg::RDX),
    HostLoc::Reg(Reg::RSI),
    HostLoc::Reg(Reg::RDI),
    HostLoc::Reg(Reg::RBP),
    HostLoc::Reg(Reg::R8),
    HostLoc::Reg(Reg::R9),
    HostLoc::Reg(Reg::R10),
    HostLoc::Reg(Reg::R11),
    HostLoc::Reg(Reg::R12),
    HostLoc::Reg(Reg::R13),
    HostLoc::Reg(Reg::R14),
];

/// Vector registers available to the allocator, in preference order.
pub const XMM_ORDER: [HostLoc; 16] = [
    HostLoc::Reg(Reg::XMM0),
    HostLoc::Reg(Reg::XMM1),
    HostLoc::Reg(Reg::XMM2),
    HostLoc::Reg(Reg::XMM3),
    HostLoc::Reg(Reg::XMM4),
    HostLoc::Reg(Reg::XMM5),
    HostLoc::Reg(Reg::XMM6),
    HostLoc::Reg(Reg::XMM7),
    HostLoc::Reg(Reg::XMM8),
    HostLoc::Reg(Reg::XMM9),
    HostLoc::Reg(Reg::XMM10),
    HostLoc::Reg(Reg::XMM11),
    HostLoc::Reg(Reg::XMM12),
    HostLoc::Reg(Reg::XMM13),
    HostLoc::Reg(Reg::XMM14),
    HostLoc::Reg(Reg::XMM15),
];

/// All spill slots, in index order.
pub fn spill_slots() -> impl Iterator<Item = HostLoc> {
    (0..SPILL_COUNT as u8).map(HostLoc::Spill)
}

// System V AMD64 calling convention.

pub const ABI_RETURN: HostLoc = HostLoc::Reg(Reg::RAX);
pub const ABI_PARAM1: HostLoc = HostLoc::Reg(Reg::RDI);
pub const ABI_PARAM2: HostLoc = HostLoc::Reg(Reg::RSI);
pub const ABI_PARAM3: HostLoc = HostLoc::Reg(Reg::RDX);
pub const ABI_PARAM4: HostLoc = HostLoc::Reg(Reg::RCX);

/// Every register a callee may clobber.
pub const ABI_CALLER_SAVE: [HostLoc; 25] = [
    HostLoc::Reg(Reg::RAX),
    HostLoc::Reg(Reg::RCX),
    HostLoc::Reg(Reg::RDX),
    HostLoc::Reg(Reg::RSI),
    HostLoc::Reg(Reg::RDI),
    HostLoc::Reg(Reg::R8),
    HostLoc::Reg(Reg::R9),
    HostLoc::Reg(Reg::R10),
    HostLoc::Reg(Reg::R11),
    HostLoc::Reg(Reg::XMM0),
    HostLoc::Reg(Reg::XMM1),
    HostLoc::Reg(Reg::XMM2),
    HostLoc::Reg(Reg::XMM3),
    HostLoc::Reg(Reg::XMM4),
    HostLoc::Reg(Reg::XMM5),
    HostLoc::Reg(Reg::XMM6),
    HostLoc::Reg(Reg::XMM7),
    HostLoc::Reg(Reg::XMM8),
    HostLoc::Reg(Reg::XMM9),
    HostLoc::Reg(Reg::XMM10),
    HostLoc::Reg(Reg::XMM11),
    HostLoc::Reg(Reg::XMM12),
    HostLoc::Reg(Reg::XMM13),
    HostLoc::Reg(Reg::XMM14),
    HostLoc::Reg(Reg::XMM15),
];

/// [ABI_CALLER_SAVE] minus the return and parameter registers, which `host_call`
/// reserves individually.
pub const OTHER_CALLER_SAVE: [HostLoc; 20] = [
    HostLoc::Reg(Reg::R8),
    HostLoc::Reg(Reg::R9),
    HostLoc::Reg(Reg::R10),
    HostLoc::Reg(Reg::R11),
    HostLoc::Reg(Reg::XMM0),
    HostLoc::Reg(Reg::XMM1),
    HostLoc::Reg(Reg::XMM2),
    HostLoc::Reg(Reg::XMM3),
    HostLoc::Reg(Reg::XMM4),
    HostLoc::Reg(Reg::XMM5),
    HostLoc::Reg(Reg::XMM6),
    HostLoc::Reg(Reg::XMM7),
    HostLoc::Reg(Reg::XMM8),
    HostLoc::Reg(Reg::XMM9),
    HostLoc::Reg(Reg::XMM10),
    HostLoc::Reg(Reg::XMM11),
    HostLoc::Reg(Reg::XMM12),
    HostLoc::Reg(Reg::XMM13),
    HostLoc::Reg(Reg::XMM14),
    HostLoc::Reg(Reg::XMM15),
];
