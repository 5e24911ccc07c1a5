//! The scheduler itself: picking who runs next and carrying out the
//! switch.
//!
//! The selection algorithm — scan forward from the thread after whoever's
//! running, prefer higher priority, break ties in scan order — is adapted
//! directly from the priority-scan approach this core's teacher uses for
//! its own task table.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use abi::{NextTask, Pid, Priority, SchedState};

use crate::arch::{self, Arch};
use crate::thread::{self, Thread, MAX_THREADS};

static ACTIVE: AtomicUsize = AtomicUsize::new(0);

/// Set by ISRs/timer callbacks that want the next voluntary or
/// ticker-driven exit point to re-run selection, without forcing an
/// immediate switch from inside the ISR itself.
pub static SWITCH_REQUESTED: AtomicBool = AtomicBool::new(false);

pub fn active_pid() -> Pid {
    Pid(ACTIVE.load(Ordering::SeqCst) as u16)
}

pub fn active_priority() -> Option<Priority> {
    thread::with_threads(|threads| {
        let idx = ACTIVE.load(Ordering::SeqCst);
        threads.get(idx).map(|t| t.priority)
    })
}

/// Used only by arch backends that key scheduler bookkeeping off of a
/// stack-pointer-shaped value instead of a pid (the host backend).
pub fn active_sp() -> usize {
    thread::with_threads(|threads| threads[ACTIVE.load(Ordering::SeqCst)].sp)
}

/// Scans `threads` for the next runnable one after `previous`, preferring
/// higher priority and, among equals, scan order starting just after
/// `previous`.
pub fn priority_scan(
    previous: usize,
    threads: &[Thread],
    pred: impl Fn(&Thread) -> bool,
) -> Option<usize> {
    let len = threads.len();
    let search_order = (previous + 1..len).chain(0..previous + 1);
    let mut choice: Option<(usize, Priority)> = None;
    for i in search_order {
        if !pred(&threads[i]) {
            continue;
        }
        if let Some((_, prio)) = choice {
            if !threads[i].priority.is_more_important_than(prio) {
                continue;
            }
        }
        choice = Some((i, threads[i].priority));
    }
    choice.map(|(idx, _)| idx)
}

fn select(previous: usize, threads: &[Thread]) -> usize {
    priority_scan(previous, threads, |t| t.is_runnable())
        .expect("no threads runnable: the idle thread must always be Runnable")
}

/// Advances any sleeping threads whose deadline has passed. Returns a
/// scheduling hint combining every thread that woke up.
pub fn process_timers(threads: &mut [Thread], now: crate::time::Timestamp) -> NextTask {
    let mut hint = NextTask::Same;
    for (index, t) in threads.iter_mut().enumerate() {
        if let Some(deadline) = t.timer.deadline {
            if deadline <= now {
                t.timer.deadline = None;
                if t.state == SchedState::Sleeping {
                    t.state = SchedState::Runnable;
                    hint = hint.combine(NextTask::Specific(Pid(index as u16)));
                }
            }
        }
    }
    hint
}

/// Picks the next thread to run and performs the switch. Called from every
/// arch port's yield path and from the preemption ticker.
///
/// If the selected thread is the one already running, this returns without
/// touching machine state.
pub fn run() {
    SWITCH_REQUESTED.store(false, Ordering::SeqCst);

    let (next_idx, next_sp) = thread::with_threads(|threads| {
        let now = crate::time::now();
        process_timers(threads, now);
        let previous = ACTIVE.load(Ordering::SeqCst);
        let next = if threads[previous].is_runnable() {
            select(previous, threads)
        } else {
            select_any_runnable(threads).unwrap_or(previous)
        };
        (next, threads[next].sp)
    });

    if next_idx != ACTIVE.load(Ordering::SeqCst) {
        ACTIVE.store(next_idx, Ordering::SeqCst);
        unsafe { set_next_sp(next_sp) };
    }

    crate::ticker::sched_ran(Pid(next_idx as u16));
}

fn select_any_runnable(threads: &[Thread]) -> Option<usize> {
    (0..MAX_THREADS).find(|&i| threads[i].is_runnable())
}

/// Forwards the scheduler's choice of next stack pointer to whichever arch
/// port is active, for the in-flight (or next) context switch to pick up.
unsafe fn set_next_sp(sp: usize) {
    arch::set_next_sp(sp)
}

/// Requests a reschedule at the next safe point without switching
/// immediately. Used by the preemption ticker and by any future
/// notification path.
pub fn request_switch() {
    SWITCH_REQUESTED.store(true, Ordering::SeqCst);
}

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::TimerState;
    use std::vec;

    fn thread(priority: u8, state: SchedState) -> Thread {
        Thread {
            sp: 0,
            priority: Priority(priority),
            state,
            timer: TimerState { deadline: None },
            flags: abi::ThreadFlags::empty(),
            stack_base: 0,
            stack_size: 0,
            fault: None,
        }
    }

    #[test]
    fn prefers_higher_priority() {
        let threads = vec![
            thread(5, SchedState::Runnable),
            thread(1, SchedState::Runnable),
            thread(3, SchedState::Runnable),
        ];
        // Lower Priority(n) is more important (see abi::Priority), so index
        // 1 (priority 1) should win regardless of scan start.
        let picked = priority_scan(0, &threads, |t| t.is_runnable()).unwrap();
        assert_eq!(picked, 1);
    }

    #[test]
    fn ties_break_in_scan_order_after_previous() {
        let threads = vec![
            thread(2, SchedState::Runnable),
            thread(2, SchedState::Runnable),
            thread(2, SchedState::Runnable),
        ];
        assert_eq!(priority_scan(0, &threads, |t| t.is_runnable()), Some(1));
        assert_eq!(priority_scan(1, &threads, |t| t.is_runnable()), Some(2));
        assert_eq!(priority_scan(2, &threads, |t| t.is_runnable()), Some(0));
    }

    #[test]
    fn skips_non_runnable() {
        let threads = vec![
            thread(1, SchedState::Runnable),
            thread(0, SchedState::Blocked),
            thread(2, SchedState::Stopped),
        ];
        assert_eq!(priority_scan(0, &threads, |t| t.is_runnable()), Some(0));
    }

    #[test]
    fn process_timers_wakes_expired_sleepers_only() {
        let mut threads = vec![
            thread(1, SchedState::Sleeping),
            thread(1, SchedState::Sleeping),
            thread(1, SchedState::Blocked),
        ];
        threads[0].timer.deadline = Some(crate::time::Timestamp::from(10));
        threads[1].timer.deadline = Some(crate::time::Timestamp::from(100));
        threads[2].timer.deadline = Some(crate::time::Timestamp::from(10));

        let hint = process_timers(&mut threads, crate::time::Timestamp::from(50));

        assert_eq!(threads[0].state, SchedState::Runnable);
        assert!(threads[0].timer.deadline.is_none());
        assert_eq!(threads[1].state, SchedState::Sleeping);
        assert!(threads[1].timer.deadline.is_some());
        // The blocked thread's deadline still clears even though it isn't
        // woken: `process_timers` only flips `Sleeping` threads to
        // `Runnable`, but a passed deadline is consumed regardless of state.
        assert_eq!(threads[2].state, SchedState::Blocked);
        assert!(threads[2].timer.deadline.is_none());

        assert_eq!(hint, NextTask::Specific(Pid(0)));
    }
}
