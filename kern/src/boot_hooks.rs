//! Thin indirection between [`crate::ticker`] and whichever periodic timer
//! the active arch port actually has.
//!
//! The ticker's on/off edge logic is arch-independent (see `ticker.rs`),
//! but arming a periodic interrupt at a given rate is not: it's a SysTick
//! reload value on Cortex-M, a hwtimer one-shot re-armed on every fire on
//! x86, and a virtual clock subscription on the host backend. Rather than
//! let `ticker` match on target architecture, `boot` installs two function
//! pointers here once, during its own init sequence — the same shape as
//! upstream's vtimer callback registration, just without the owning vtimer
//! subsystem this core doesn't otherwise need.

use core::sync::atomic::{AtomicUsize, Ordering};

type ArmFn = fn(u32);
type DisarmFn = fn();

static ARM: AtomicUsize = AtomicUsize::new(0);
static DISARM: AtomicUsize = AtomicUsize::new(0);

/// Registers the arch port's timer arm/disarm functions.
///
/// # Safety
/// Must be called exactly once, during boot, before the ticker can ever
/// observe a non-idle thread running.
pub unsafe fn install(arm: ArmFn, disarm: DisarmFn) {
    ARM.store(arm as usize, Ordering::SeqCst);
    DISARM.store(disarm as usize, Ordering::SeqCst);
}

pub(crate) fn arm_preemption_timer(hz: u32) {
    let f = ARM.load(Ordering::SeqCst);
    if f != 0 {
        let f: ArmFn = unsafe { core::mem::transmute(f) };
        f(hz);
    }
}

pub(crate) fn disarm_preemption_timer() {
    let f = DISARM.load(Ordering::SeqCst);
    if f != 0 {
        let f: DisarmFn = unsafe { core::mem::transmute(f) };
        f();
    }
}
