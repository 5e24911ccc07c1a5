//! Thread control blocks and the operations that create, yield, and tear
//! down threads.
//!
//! A fixed-size array of `Thread` slots backs the whole system — no
//! dynamic task table — which keeps `sched`'s scan loops the same shape as
//! the priority-scan algorithm this is grounded on. A slot's `pid` is its
//! index; `Stopped` slots are free for reuse by a later `create`.

use abi::{Pid, Priority, SchedState, ThreadFlags, N_PRIORITIES, STACK_CANARY, STACK_MARKER};

use crate::arch::{self, Arch};
use crate::err::FaultInfo;
use crate::time::Timestamp;

/// Maximum number of live threads. Chosen to match SPEC_FULL's "small,
/// fixed task count" assumption, carried over from the naive-algorithm
/// principles this scheduler's design is grounded on.
pub const MAX_THREADS: usize = 32;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TimerState {
    pub deadline: Option<Timestamp>,
}

/// One thread's control block.
#[repr(C)]
#[derive(Debug)]
pub struct Thread {
    /// Saved stack pointer. Only meaningful while this thread isn't the one
    /// currently executing.
    pub sp: usize,
    pub priority: Priority,
    pub state: SchedState,
    pub timer: TimerState,
    pub flags: ThreadFlags,
    /// Lowest address of this thread's stack, for
    /// [`measure_stack_usage`]/overflow checks.
    pub stack_base: usize,
    pub stack_size: usize,
    pub fault: Option<FaultInfo>,
}

impl Thread {
    pub fn is_runnable(&self) -> bool {
        self.state == SchedState::Runnable
    }

    /// Checks the stack-marker sentinel at the base of this thread's
    /// stack. A mismatch means the thread has run off the bottom of its
    /// stack.
    pub fn check_stack_marker(&self) -> bool {
        if self.stack_base == 0 {
            return true;
        }
        unsafe { core::ptr::read_volatile(self.stack_base as *const u32) == STACK_MARKER }
    }
}

static mut THREADS: [Thread; MAX_THREADS] = {
    const EMPTY: Thread = Thread {
        sp: 0,
        priority: abi::PRIORITY_IDLE,
        state: SchedState::Stopped,
        timer: TimerState { deadline: None },
        flags: ThreadFlags::empty(),
        stack_base: 0,
        stack_size: 0,
        fault: None,
    };
    [EMPTY; MAX_THREADS]
};

/// Runs `body` with exclusive access to the thread table, interrupts
/// masked for the duration.
pub fn with_threads<R>(body: impl FnOnce(&mut [Thread]) -> R) -> R {
    let irq = arch::Selected::disable_irq();
    let result = unsafe { body(&mut THREADS) };
    unsafe { arch::Selected::restore_irq(irq) };
    result
}

/// Creates a new thread running `entry(arg)` on `stack`, at `priority`.
///
/// Returns the new thread's pid, or `None` if every slot is in use.
///
/// Per SPEC_FULL: unless `flags` contains [`ThreadFlags::WOUT_YIELD`], and
/// the new thread outranks the caller, this yields before returning.
pub fn create(
    entry: extern "C" fn(usize) -> !,
    arg: usize,
    stack: &'static mut [u8],
    priority: Priority,
    flags: ThreadFlags,
) -> Option<Pid> {
    if priority.0 as usize >= N_PRIORITIES {
        return None;
    }

    if flags.contains(ThreadFlags::STACKTEST) {
        for word in stack.iter_mut() {
            *word = (STACK_CANARY & 0xFF) as u8;
        }
    }

    let stack_base = stack.as_ptr() as usize;
    let stack_len = stack.len();

    let sp = arch::Selected::stack_init(stack, entry, arg, sched_task_exit_trampoline);

    let pid = with_threads(|threads| {
        let slot = threads
            .iter()
            .position(|t| t.state == SchedState::Stopped)?;
        threads[slot] = Thread {
            sp,
            priority,
            state: SchedState::Runnable,
            timer: TimerState { deadline: None },
            flags,
            stack_base,
            stack_size: stack_len,
            fault: None,
        };
        Some(Pid(slot as u16))
    })?;

    if !flags.contains(ThreadFlags::WOUT_YIELD) {
        if let Some(caller) = crate::sched::active_priority() {
            if priority.is_more_important_than(caller) {
                arch::Selected::yield_now();
            }
        }
    }

    Some(pid)
}

pub fn getpid() -> Pid {
    crate::sched::active_pid()
}

/// Marks the current thread faulted. It will not be scheduled again until
/// something external clears the fault (this core has no fault-recovery
/// policy of its own, matching SPEC_FULL's error-handling design).
pub fn fault_current(fault: FaultInfo) {
    with_threads(|threads| {
        let pid = crate::sched::active_pid();
        let t = &mut threads[pid.index()];
        t.fault = Some(fault);
        t.state = SchedState::Blocked;
    });
    klog!("thread {} faulted: {:?}", crate::sched::active_pid().0, fault);
    arch::Selected::yield_now();
}

extern "C" fn sched_task_exit_trampoline() -> ! {
    sched_task_exit()
}

/// Non-returning thread exit path. Hands the thread's stack off to the
/// reaper thread (see [`crate::reaper`]) before removing it from the
/// scheduler, so the thread never has to free memory out from under
/// itself while still executing on it.
pub fn sched_task_exit() -> ! {
    let pid = crate::sched::active_pid();
    let (stack_base, stack_size) = with_threads(|threads| {
        let t = &mut threads[pid.index()];
        t.state = SchedState::Stopped;
        (t.stack_base, t.stack_size)
    });
    crate::reaper::post_stack(stack_base, stack_size);
    arch::Selected::yield_now();
    unreachable!("a Stopped thread must never be resumed")
}

/// Scans `stack` for the high-water mark left by [`ThreadFlags::STACKTEST`]
/// at creation time: the lowest address that no longer holds
/// [`abi::STACK_CANARY`].
///
/// Word 0 holds [`abi::STACK_MARKER`], not canary fill (every `stack_init`
/// writes it there before the canary fill is applied), so the scan starts
/// one word above it.
pub fn measure_stack_usage(stack_base: usize, stack_size: usize) -> usize {
    let base = stack_base as *const u32;
    let words = stack_size / 4;
    let mut unused = 0;
    for i in 1..words {
        let v = unsafe { core::ptr::read_volatile(base.add(i)) };
        if v != STACK_CANARY {
            break;
        }
        unused += 1;
    }
    stack_size - unused * 4
}

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod tests {
    use super::*;
    use std::boxed::Box;
    use std::sync::Mutex;
    use std::vec;

    // `THREADS` is a single global table; serialize tests that touch it.
    static LOCK: Mutex<()> = Mutex::new(());

    extern "C" fn dummy_entry(_arg: usize) -> ! {
        unreachable!("host backend never resumes at a saved stack pointer")
    }

    fn leak_stack(len: usize) -> &'static mut [u8] {
        Box::leak(vec![0u8; len].into_boxed_slice())
    }

    fn clear_table() {
        with_threads(|threads| {
            for t in threads.iter_mut() {
                *t = Thread {
                    sp: 0,
                    priority: abi::PRIORITY_IDLE,
                    state: SchedState::Stopped,
                    timer: TimerState { deadline: None },
                    flags: ThreadFlags::empty(),
                    stack_base: 0,
                    stack_size: 0,
                    fault: None,
                };
            }
        });
    }

    #[test]
    fn create_fills_first_free_slot_as_runnable() {
        let _guard = LOCK.lock().unwrap();
        clear_table();

        let stack = leak_stack(256);
        let pid = create(
            dummy_entry,
            0,
            stack,
            Priority(1),
            ThreadFlags::WOUT_YIELD,
        )
        .expect("slot available");

        with_threads(|threads| {
            let t = &threads[pid.index()];
            assert_eq!(t.state, SchedState::Runnable);
            assert_eq!(t.priority, Priority(1));
            assert!(t.check_stack_marker());
        });
    }

    #[test]
    fn create_rejects_out_of_range_priority() {
        let _guard = LOCK.lock().unwrap();
        clear_table();

        let stack = leak_stack(256);
        let result = create(
            dummy_entry,
            0,
            stack,
            Priority(abi::N_PRIORITIES as u8),
            ThreadFlags::WOUT_YIELD,
        );
        assert!(result.is_none());
    }

    #[test]
    fn measure_stack_usage_finds_high_water_mark() {
        let stack = leak_stack(64);
        let base = stack.as_ptr() as usize;
        let words = stack.len() / 4;
        for w in stack.chunks_exact_mut(4) {
            w.copy_from_slice(&STACK_CANARY.to_ne_bytes());
        }
        // Word 0 holds the marker `stack_init` always writes there, not
        // canary fill, exactly like the real `create()` flow.
        stack[0..4].copy_from_slice(&STACK_MARKER.to_ne_bytes());
        // The stack grows down toward `stack_base`, so light usage only
        // clobbers the top (highest-address) words. Leave everything below
        // the top 3 words as untouched canary.
        let top = (words - 3) * 4;
        stack[top..].copy_from_slice(&[0xAB; 12]);

        let used = measure_stack_usage(base, stack.len());
        assert_eq!(used, 12);
    }

    #[test]
    fn measure_stack_usage_reports_full_when_marker_is_first_mismatch() {
        // Heaviest possible usage: only the marker word at the bottom
        // survives, everything above it has been overwritten.
        let stack = leak_stack(64);
        let base = stack.as_ptr() as usize;
        for b in stack.iter_mut() {
            *b = 0xAB;
        }
        stack[0..4].copy_from_slice(&STACK_MARKER.to_ne_bytes());

        let used = measure_stack_usage(base, stack.len());
        assert_eq!(used, stack.len());
    }
}
