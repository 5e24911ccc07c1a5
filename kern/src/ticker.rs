//! Cooperative-preemptive multitasking ticker.
//!
//! Mirrors the upstream `multitasking` module almost exactly: preemption is
//! only armed while it's both globally enabled *and* a non-idle thread is
//! actually running, and the timer is armed/disarmed only on the edges of
//! that combined condition rather than on every tick, so idling never pays
//! for a timer it isn't using.

use core::sync::atomic::{AtomicBool, Ordering};

use abi::{Pid, PRIORITY_IDLE};

/// Default preemption rate, matching SPEC_FULL's configuration section
/// (`MULTITASKING_HZ`).
pub const DEFAULT_HZ: u32 = 33;

static ACTIVE: AtomicBool = AtomicBool::new(true);
static NOT_IDLE: AtomicBool = AtomicBool::new(false);
static ARMED: AtomicBool = AtomicBool::new(false);

/// Globally enables or disables preemption. Disabling does not affect a
/// thread's ability to yield voluntarily — only whether the ticker will
/// force a switch.
pub fn set_active(active: bool) {
    if ACTIVE.swap(active, Ordering::SeqCst) != active {
        recompute();
    }
}

/// Called by [`crate::sched::run`] after every scheduling decision, so the
/// ticker can track whether the idle thread is the one running.
pub fn sched_ran(active_pid: Pid) {
    let not_idle = active_pid != idle_pid();
    if NOT_IDLE.swap(not_idle, Ordering::SeqCst) != not_idle {
        recompute();
    }
}

fn idle_pid() -> Pid {
    // The idle thread is always the lowest-priority runnable thread; its
    // pid is whatever `boot` assigned it. Ticker policy only needs to know
    // "is the running thread the idle priority," which it can read off the
    // thread table without a dedicated global.
    crate::thread::with_threads(|threads| {
        threads
            .iter()
            .position(|t| t.priority == PRIORITY_IDLE)
            .map(|i| Pid(i as u16))
            .unwrap_or(Pid(0))
    })
}

fn recompute() {
    let should_arm = ACTIVE.load(Ordering::SeqCst) && NOT_IDLE.load(Ordering::SeqCst);
    if ARMED.swap(should_arm, Ordering::SeqCst) == should_arm {
        return;
    }
    if should_arm {
        crate::boot_hooks::arm_preemption_timer(DEFAULT_HZ);
    } else {
        crate::boot_hooks::disarm_preemption_timer();
    }
}

/// Invoked from the arch-specific periodic-timer interrupt (`SysTick` on
/// ARM-M, the hwtimer IRQ on x86, [`crate::arch::host::tick`] on the
/// host backend). Requests a reschedule; the actual switch happens at the
/// next safe exit point, not from inside this call.
pub fn on_tick() {
    if ARMED.load(Ordering::SeqCst) {
        crate::sched::request_switch();
    }
}

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod tests {
    use super::*;
    use abi::SchedState;
    use core::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    static ARM_CALLS: AtomicUsize = AtomicUsize::new(0);
    static DISARM_CALLS: AtomicUsize = AtomicUsize::new(0);
    static LAST_HZ: AtomicUsize = AtomicUsize::new(0);
    // Serializes tests: ticker/boot_hooks state is global, like on real
    // hardware, so tests can't run concurrently against it.
    static LOCK: Mutex<()> = Mutex::new(());

    fn fake_arm(hz: u32) {
        ARM_CALLS.fetch_add(1, Ordering::SeqCst);
        LAST_HZ.store(hz as usize, Ordering::SeqCst);
    }

    fn fake_disarm() {
        DISARM_CALLS.fetch_add(1, Ordering::SeqCst);
    }

    fn reset() {
        ARM_CALLS.store(0, Ordering::SeqCst);
        DISARM_CALLS.store(0, Ordering::SeqCst);
        LAST_HZ.store(0, Ordering::SeqCst);
        ACTIVE.store(true, Ordering::SeqCst);
        NOT_IDLE.store(false, Ordering::SeqCst);
        ARMED.store(false, Ordering::SeqCst);
        unsafe { crate::boot_hooks::install(fake_arm, fake_disarm) };
    }

    #[test]
    fn arms_only_on_rising_edge() {
        let _guard = LOCK.lock().unwrap();
        reset();

        sched_ran(Pid(1)); // not-idle edge: false -> true, active already true
        assert_eq!(ARM_CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(LAST_HZ.load(Ordering::SeqCst), DEFAULT_HZ as usize);

        sched_ran(Pid(1)); // no edge: still not-idle
        assert_eq!(ARM_CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disarms_when_idle_runs() {
        let _guard = LOCK.lock().unwrap();
        reset();
        crate::thread::with_threads(|threads| {
            threads[0].priority = abi::PRIORITY_IDLE;
            threads[0].state = SchedState::Runnable;
        });

        sched_ran(Pid(1));
        assert_eq!(ARM_CALLS.load(Ordering::SeqCst), 1);

        sched_ran(Pid(0));
        assert_eq!(DISARM_CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn set_active_false_disarms_even_while_not_idle() {
        let _guard = LOCK.lock().unwrap();
        reset();

        sched_ran(Pid(1));
        assert_eq!(ARM_CALLS.load(Ordering::SeqCst), 1);

        set_active(false);
        assert_eq!(DISARM_CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn on_tick_requests_switch_only_when_armed() {
        let _guard = LOCK.lock().unwrap();
        reset();
        crate::sched::SWITCH_REQUESTED.store(false, Ordering::SeqCst);

        on_tick();
        assert!(!crate::sched::SWITCH_REQUESTED.load(Ordering::SeqCst));

        sched_ran(Pid(1));
        on_tick();
        assert!(crate::sched::SWITCH_REQUESTED.load(Ordering::SeqCst));
    }
}
