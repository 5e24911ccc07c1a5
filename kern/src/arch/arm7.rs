//! Architecture support for ARM7/ARM9 (ARMv4T/v5TE, no Thumb-mode
//! exception model, no PSP/MSP split).
//!
//! Unlike the Cortex-M port, ARM7/9 has no hardware-assisted exception stack
//! frame: a context switch here is an ordinary subroutine that pushes the
//! full register file, hands off to the scheduler, and pops the next
//! thread's register file back off whatever stack `sched_active` now points
//! at. There is no separate interrupt stack in this port; IRQ handlers run
//! on the interrupted thread's own stack, matching the single-stack model
//! this family's exception entry implies.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use abi::Pid;

use crate::arch::{Arch, IrqState};
use crate::sched;
use crate::time::Timestamp;

/// System mode, IRQs and FIQs both enabled.
const INITIAL_CPSR: u32 = 0x0000_001F;

static TICKS: AtomicU64 = AtomicU64::new(0);
static CURRENT_SP: AtomicU32 = AtomicU32::new(0);
static NEXT_SP: AtomicU32 = AtomicU32::new(0);

pub struct Selected;

impl Arch for Selected {
    fn stack_init(
        stack: &mut [u8],
        entry: extern "C" fn(usize) -> !,
        arg: usize,
        on_return: extern "C" fn() -> !,
    ) -> usize {
        let stack_base = stack.as_ptr() as usize;
        let top = (stack_base + stack.len()) & !0x3;
        let mut sp = top as *mut u32;

        unsafe {
            // The marker lives at the fixed bottom word of the stack, not
            // in the initial register frame below `top` — it's a
            // stand-alone overflow sentinel `check_stack_marker` reads
            // directly off `stack_base`, untouched by this thread ever
            // running.
            core::ptr::write_volatile(stack_base as *mut u32, abi::STACK_MARKER);

            if (sp as usize) & 0x7 != 0 {
                sp = sp.sub(1);
                *sp = !abi::STACK_MARKER;
            }

            sp = sp.sub(1);
            *sp = entry as usize as u32; // pc
            sp = sp.sub(1);
            *sp = on_return as usize as u32; // lr

            // r1..r12 (r0 is written separately below, after this loop,
            // since `context_restore_and_go`'s `pop {r0-r12, lr, pc}`
            // expects r0 nearest the stack pointer and pc furthest).
            for r in (1..=12).rev() {
                sp = sp.sub(1);
                *sp = r as u32;
            }

            sp = sp.sub(1);
            *sp = arg as u32; // r0

            sp = sp.sub(1);
            *sp = INITIAL_CPSR;
        }
        sp as usize
    }

    unsafe fn start_threading(sp: usize) -> ! {
        context_restore_and_go(sp)
    }

    fn yield_now() {
        unsafe { context_switch() };
    }

    fn disable_irq() -> IrqState {
        let cpsr = read_cpsr();
        unsafe { cpsid_if() };
        IrqState(cpsr)
    }

    unsafe fn restore_irq(state: IrqState) {
        write_cpsr(state.0);
    }

    fn reserved_idle_pid() -> Option<Pid> {
        None
    }
}

pub fn now() -> Timestamp {
    Timestamp::from(TICKS.load(Ordering::Relaxed))
}

pub fn tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
    crate::ticker::on_tick();
}

/// No generic on-chip timer exists across the ARM7/9 SoCs this port
/// targets (ZYNQ's TTC, AM3359's DMTimer are board-specific and not
/// modeled here); a board crate that wants preemption drives its own IRQ
/// handler to call [`tick`] directly, so these hooks stay no-ops.
pub fn arm_preemption_timer(_hz: u32) {}
pub fn disarm_preemption_timer() {}

#[cfg(target_arch = "arm")]
fn read_cpsr() -> u32 {
    let cpsr: u32;
    unsafe { core::arch::asm!("mrs {0}, cpsr", out(reg) cpsr) };
    cpsr
}

#[cfg(target_arch = "arm")]
unsafe fn write_cpsr(v: u32) {
    core::arch::asm!("msr cpsr, {0}", in(reg) v);
}

#[cfg(target_arch = "arm")]
unsafe fn cpsid_if() {
    core::arch::asm!("cpsid if");
}

#[cfg(not(target_arch = "arm"))]
fn read_cpsr() -> u32 {
    unreachable!("arm7 port compiled for non-ARM target")
}
#[cfg(not(target_arch = "arm"))]
unsafe fn write_cpsr(_v: u32) {
    unreachable!("arm7 port compiled for non-ARM target")
}
#[cfg(not(target_arch = "arm"))]
unsafe fn cpsid_if() {
    unreachable!("arm7 port compiled for non-ARM target")
}

/// Full save-switch-restore sequence used by a voluntary yield. Pushes the
/// full register file the way `thread_arch_yield` did, records the
/// outgoing stack pointer, calls into [`sched::run`] to pick the next
/// thread and populate [`NEXT_SP`], then restores from there.
///
/// # Safety
/// Only valid while a thread is actually running (never during boot, before
/// the first [`Arch::start_threading`] call).
#[naked]
unsafe extern "C" fn context_switch() {
    core::arch::asm!(
        "push {{r0-r12, lr}}",
        "mrs r0, cpsr",
        "cpsid if",
        "push {{r0}}",
        "mov r0, sp",
        "bl {store_sp}",
        "bl {sched_run}",
        "bl {load_sp}",
        "mov sp, r0",
        "pop {{r0}}",
        "msr cpsr, r0",
        "pop {{r0-r12, lr}}",
        "bx lr",
        store_sp = sym store_current_sp,
        sched_run = sym run_scheduler,
        load_sp = sym load_next_sp,
        options(noreturn),
    );
}

#[naked]
unsafe extern "C" fn context_restore_and_go(sp: usize) -> ! {
    core::arch::asm!(
        "mov sp, r0",
        "pop {{r0}}",
        "msr cpsr, r0",
        "pop {{r0-r12, lr, pc}}",
        options(noreturn),
    );
}

extern "C" fn store_current_sp(sp: u32) {
    CURRENT_SP.store(sp, Ordering::SeqCst);
}

extern "C" fn run_scheduler() {
    sched::run();
}

extern "C" fn load_next_sp() -> u32 {
    NEXT_SP.load(Ordering::SeqCst)
}

/// Records the stack pointer the scheduler chose for the next run.
///
/// # Safety
/// Must only be called from inside a critical section.
pub unsafe fn set_next_sp(sp: usize) {
    NEXT_SP.store(sp as u32, Ordering::SeqCst);
}
