//! Shared ABI types for the kernel core.
//!
//! Nothing in this crate has logic beyond simple bit-twiddling; it exists so
//! that the layout of a priority, a stack marker, or a page-table-entry flag
//! is defined exactly once and can't drift between `kern`'s arch ports.

#![no_std]

use zerocopy::{AsBytes, FromBytes, Unaligned};

/// Sentinel word written at the lowest address of every thread's stack.
///
/// Checked on every observable suspension point (spec.md §8); a corrupted
/// marker means the thread walked off the bottom of its stack.
pub const STACK_MARKER: u32 = 0x7777_7777;

/// Pattern used to pre-fill unused stack when `ThreadFlags::STACKTEST` is
/// set, so that `thread_measure_stack_usage` can later find the high-water
/// mark by scanning for the first word that isn't this pattern.
pub const STACK_CANARY: u32 = 0x2020_2020;

/// Number of priority levels supported by the ready structure. Priority 0 is
/// most important; `N_PRIORITIES - 1` is least important and is reserved for
/// the idle thread.
pub const N_PRIORITIES: usize = 16;

/// Priority reserved for the idle thread. The preemption ticker (C7) treats a
/// switch to this priority as "nothing to preempt."
pub const PRIORITY_IDLE: Priority = Priority(N_PRIORITIES as u8 - 1);

/// Default priority for threads that don't otherwise care, matching where
/// `kernel_init` parks the `main` thread.
pub const PRIORITY_MAIN: Priority = Priority(7);

/// Thread priority. Numerically smaller is more important.
///
/// Deliberately does not implement `PartialOrd`/`Ord` so callers can't
/// confuse "greater" with "more important" — use
/// [`Priority::is_more_important_than`].
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromBytes, AsBytes, Unaligned, Default,
)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 < other.0
    }
}

/// Stable thread identifier, assigned at creation and never reused while the
/// kernel is running.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Default)]
#[repr(transparent)]
pub struct Pid(pub u16);

impl Pid {
    pub const KERNEL: Self = Pid(u16::MAX);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

bitflags::bitflags! {
    /// Flags accepted by `thread_create`.
    #[derive(Default)]
    pub struct ThreadFlags: u8 {
        /// Fill unused stack with `STACK_CANARY` so that
        /// `thread_measure_stack_usage` can later compute high-water usage.
        const STACKTEST = 1 << 0;
        /// Suppress the "yield if the new thread outranks the caller" check
        /// that `thread_create` otherwise performs.
        const WOUT_YIELD = 1 << 1;

        const RESERVED = !(Self::STACKTEST.bits | Self::WOUT_YIELD.bits);
    }
}

/// Scheduling status of a thread.
///
/// `Healthy` states are eligible for scheduling subject to `SchedState`;
/// `Stopped` threads are unreachable from the scheduler's structures per the
/// invariant in spec.md §3.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SchedState {
    /// Parked, not yet run for the first time.
    Pending,
    /// Eligible to be picked by `sched_run`.
    Runnable,
    /// Suspended on a timed sleep.
    Sleeping,
    /// Suspended on an external synchronization primitive (mutex, message
    /// queue, ...). The core does not interpret the reason.
    Blocked,
    /// Exited; unreachable from scheduler structures.
    Stopped,
}

impl Default for SchedState {
    fn default() -> Self {
        SchedState::Stopped
    }
}

/// Return value of operations that may require the scheduler to run again.
///
/// Marked `#[must_use]`: forgetting to act on a pending switch request is a
/// correctness bug, not a style nit.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum NextTask {
    /// Keep running whoever is running.
    Same,
    /// A switch is needed, but the caller hasn't determined who to. The
    /// scheduler must figure it out.
    Other,
    /// A switch is needed and the caller already knows the target pid.
    Specific(Pid),
}

impl NextTask {
    pub fn combine(self, other: Self) -> Self {
        use NextTask::*;
        match (self, other) {
            (x, y) if x == y => x,
            (Specific(_), Specific(_)) => Other,
            (Specific(p), _) | (_, Specific(p)) => Specific(p),
            (Other, _) | (_, Other) => Other,
            (Same, Same) => Same,
        }
    }
}

/// x86 page-table-entry bit layout (Intel SDM, PAE mode).
///
/// Bit 9 is reserved-for-software and is repurposed here as the
/// "heap-owned" marker used by the demand-heap page-fault handler.
pub mod pte {
    pub const P: u64 = 1 << 0;
    pub const RW: u64 = 1 << 1;
    pub const US: u64 = 1 << 2;
    pub const PWT: u64 = 1 << 3;
    pub const PCD: u64 = 1 << 4;
    pub const A: u64 = 1 << 5;
    pub const D: u64 = 1 << 6;
    pub const PS: u64 = 1 << 7;
    pub const G: u64 = 1 << 8;
    pub const HEAP_OWNED: u64 = 1 << 9;
    pub const XD: u64 = 1 << 63;

    pub const ADDR_MASK: u64 = ((1u64 << 48) - 1) & !((1u64 << 12) - 1);

    /// Sentinel returned by `get_pte` when the address has no mapping at the
    /// PDPT/PD level. All bits set but `P`; PTE bits 48..63 besides `XD` are
    /// architecturally reserved so this value can never be a real PTE.
    pub const NO_PTE: u64 = !P;
}

/// Page-fault error-code bits (Intel SDM Vol. 3, §4.7).
pub mod pf_ec {
    pub const PRESENT: u32 = 1 << 0;
    pub const WRITE: u32 = 1 << 1;
    pub const USER: u32 = 1 << 2;
    pub const RESERVED_WRITE: u32 = 1 << 3;
    pub const INSTRUCTION: u32 = 1 << 4;
}

/// EFLAGS bits the kernel cares about.
pub mod eflags {
    pub const TF: u32 = 1 << 8;
    pub const IF: u32 = 1 << 9;
}

/// x86 exception and IRQ vector numbers used to build the IDT.
pub mod vector {
    pub const DIVIDE_ERROR: u8 = 0x00;
    pub const DEBUG: u8 = 0x01;
    pub const NMI: u8 = 0x02;
    pub const BREAKPOINT: u8 = 0x03;
    pub const OVERFLOW: u8 = 0x04;
    pub const BOUND_RANGE: u8 = 0x05;
    pub const INVALID_OPCODE: u8 = 0x06;
    pub const DEVICE_NOT_AVAILABLE: u8 = 0x07;
    pub const DOUBLE_FAULT: u8 = 0x08;
    pub const GENERAL_PROTECTION: u8 = 0x0d;
    pub const PAGE_FAULT: u8 = 0x0e;
    pub const FPU_ERROR: u8 = 0x10;
    pub const ALIGNMENT_CHECK: u8 = 0x11;
    pub const MACHINE_CHECK: u8 = 0x12;

    pub const PIC_MASTER_BASE: u8 = 0x20;
    pub const PIC_SLAVE_BASE: u8 = 0x28;

    /// One past the highest vector this kernel builds a gate for.
    pub const MAX: usize = 0x30;
}

/// Fields of an x86 interrupt gate descriptor, little-endian, 8 bytes.
#[derive(Copy, Clone, Debug, Default, FromBytes, AsBytes, Unaligned)]
#[repr(C, packed)]
pub struct IdtGate {
    pub offset_lo: u16,
    pub selector: u16,
    pub zero: u8,
    pub type_attr: u8,
    pub offset_hi: u16,
}

impl IdtGate {
    pub const CODE_SELECTOR: u16 = 0x0008;
    /// Present, 32-bit interrupt gate, DPL=0.
    pub const TYPE_ATTR_DPL0: u8 = 0x8E;
    /// Present, 32-bit interrupt gate, DPL=3 — used only for the
    /// breakpoint/`int3` gate.
    pub const TYPE_ATTR_DPL3: u8 = 0xEE;

    pub fn new(handler: u32, dpl3: bool) -> Self {
        IdtGate {
            offset_lo: handler as u16,
            selector: Self::CODE_SELECTOR,
            zero: 0,
            type_attr: if dpl3 {
                Self::TYPE_ATTR_DPL3
            } else {
                Self::TYPE_ATTR_DPL0
            },
            offset_hi: (handler >> 16) as u16,
        }
    }
}
