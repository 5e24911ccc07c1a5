//! Host backend: runs the kernel core's architecture-independent logic on
//! top of a desktop OS for `cargo test` and local experimentation — the
//! same role `arch::simulator` plays upstream, adapted from "describes a
//! register ABI for an external simulator process" to "is a real, if
//! trivial, `Arch` impl usable in-process."
//!
//! There is deliberately no real stack switching here. Scheduling policy
//! (`sched::run`, priority selection, the ticker state machine) is pure
//! logic that doesn't care which registers a context switch touches, so
//! this backend represents "the currently running thread" with a plain
//! global instead of swapping a stack pointer, and leaves `start_threading`
//! as the one entry point a test harness calls directly rather than
//! through a real exception return.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use abi::Pid;

use crate::arch::{Arch, IrqState};
use crate::time::Timestamp;

static TICKS: AtomicU64 = AtomicU64::new(0);
static IRQ_MASKED: AtomicBool = AtomicBool::new(false);

pub struct Selected;

impl Arch for Selected {
    fn stack_init(
        stack: &mut [u8],
        _entry: extern "C" fn(usize) -> !,
        _arg: usize,
        _on_return: extern "C" fn() -> !,
    ) -> usize {
        // No real frame to build: the host backend never actually resumes
        // execution at a saved stack pointer, so this just has to be a
        // stable, distinct value per thread for the scheduler's
        // bookkeeping to key off of. The marker sentinel still goes at the
        // bottom word so `check_stack_marker` behaves the same as on a real
        // port.
        let stack_base = stack.as_ptr() as usize;
        unsafe { core::ptr::write_volatile(stack_base as *mut u32, abi::STACK_MARKER) };
        stack_base
    }

    unsafe fn start_threading(_sp: usize) -> ! {
        panic!("host backend has no real thread execution; drive `sched`/`thread` directly in tests")
    }

    fn yield_now() {
        crate::sched::run();
    }

    fn disable_irq() -> IrqState {
        let was = IRQ_MASKED.swap(true, Ordering::SeqCst);
        IrqState(if was { 1 } else { 0 })
    }

    unsafe fn restore_irq(state: IrqState) {
        if state.0 == 0 {
            IRQ_MASKED.store(false, Ordering::SeqCst);
        }
    }

    fn reserved_idle_pid() -> Option<Pid> {
        None
    }
}

/// No-op: the host backend never resumes at a saved stack pointer (see
/// [`Selected::start_threading`]), so there's nothing to record.
///
/// # Safety
/// Must only be called from inside a critical section, to match every
/// other port's `set_next_sp` contract.
pub unsafe fn set_next_sp(_sp: usize) {}

pub fn now() -> Timestamp {
    Timestamp::from(TICKS.load(Ordering::Relaxed))
}

/// Advances the virtual clock and, unless interrupts are "masked", runs the
/// preemption ticker's hook. Lets tests drive time forward deterministically
/// instead of depending on a wall clock. The arch-generic name (`tick`, not
/// `advance_tick`) matches every other port's periodic-timer entry point,
/// since `arch::mod` re-exports it uniformly.
pub fn tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
    if !IRQ_MASKED.load(Ordering::SeqCst) {
        crate::ticker::on_tick();
    }
}

static ARMED_HZ: AtomicU64 = AtomicU64::new(0);

/// Host backend's timer arm/disarm hooks: there's no real periodic
/// interrupt, just a flag a test can check, since [`tick`] is already
/// driven explicitly by whoever is simulating time.
pub fn arm_preemption_timer(hz: u32) {
    ARMED_HZ.store(hz as u64, Ordering::SeqCst);
}

pub fn disarm_preemption_timer() {
    ARMED_HZ.store(0, Ordering::SeqCst);
}
