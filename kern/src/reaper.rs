//! The reaper thread: frees a dying thread's stack after it has left that
//! stack for good.
//!
//! A thread can't call `free` on the memory it's currently executing on —
//! the call frame for `free` itself lives there. [`crate::thread::sched_task_exit`]
//! instead posts `(stack_base, stack_size)` to a small fixed-capacity queue
//! here and yields away forever; a dedicated low-priority thread running
//! [`reaper_main`] drains the queue and returns each stack to the
//! allocator.

use core::sync::atomic::{AtomicUsize, Ordering};

use abi::{Pid, SchedState};

use crate::arch::{self, Arch};

const QUEUE_CAP: usize = 8;

static mut QUEUE: [Option<(usize, usize)>; QUEUE_CAP] = [None; QUEUE_CAP];
static mut HEAD: usize = 0;
static mut LEN: usize = 0;

/// `pid + 1` of the reaper thread, or 0 if [`set_pid`] hasn't run yet.
static REAPER_PID: AtomicUsize = AtomicUsize::new(0);

/// Records which thread runs [`reaper_main`], so [`post_stack`] knows who
/// to wake. Called once by `boot` right after creating that thread.
pub fn set_pid(pid: Pid) {
    REAPER_PID.store(pid.index() + 1, Ordering::SeqCst);
}

/// Queues a stack for reclamation and wakes the reaper if it's waiting.
///
/// If the queue is full, the stack is leaked rather than corrupting an
/// in-use slot — this core has no policy for what else to do with a
/// posted stack it can't record, and a fixed-size embedded system is
/// expected to size `QUEUE_CAP` for its actual thread churn.
pub fn post_stack(stack_base: usize, stack_size: usize) {
    let irq = arch::Selected::disable_irq();
    unsafe {
        if LEN < QUEUE_CAP {
            let tail = (HEAD + LEN) % QUEUE_CAP;
            QUEUE[tail] = Some((stack_base, stack_size));
            LEN += 1;
        }
    }
    unsafe { arch::Selected::restore_irq(irq) };

    let pid = REAPER_PID.load(Ordering::SeqCst);
    if pid != 0 {
        let pid = Pid((pid - 1) as u16);
        crate::thread::with_threads(|threads| {
            let t = &mut threads[pid.index()];
            if t.state == SchedState::Blocked {
                t.state = SchedState::Runnable;
            }
        });
    }
}

fn take_stack() -> Option<(usize, usize)> {
    let irq = arch::Selected::disable_irq();
    let item = unsafe {
        if LEN == 0 {
            None
        } else {
            let item = QUEUE[HEAD].take();
            HEAD = (HEAD + 1) % QUEUE_CAP;
            LEN -= 1;
            item
        }
    };
    unsafe { arch::Selected::restore_irq(irq) };
    item
}

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // The queue is a single global ring buffer; serialize tests against it.
    static LOCK: Mutex<()> = Mutex::new(());

    fn drain_all() {
        while take_stack().is_some() {}
    }

    #[test]
    fn fifo_order() {
        let _guard = LOCK.lock().unwrap();
        drain_all();

        post_stack(0x1000, 64);
        post_stack(0x2000, 128);

        assert_eq!(take_stack(), Some((0x1000, 64)));
        assert_eq!(take_stack(), Some((0x2000, 128)));
        assert_eq!(take_stack(), None);
    }

    #[test]
    fn full_queue_drops_excess_without_panicking() {
        let _guard = LOCK.lock().unwrap();
        drain_all();

        for i in 0..QUEUE_CAP + 2 {
            post_stack(i, i);
        }
        let mut count = 0;
        while take_stack().is_some() {
            count += 1;
        }
        assert_eq!(count, QUEUE_CAP);
    }
}

/// Entry point for the dedicated reaper thread. Never returns.
pub extern "C" fn reaper_main(_arg: usize) -> ! {
    loop {
        match take_stack() {
            Some((base, _size)) => unsafe {
                crate::alloc_facade::free(base as *mut u8);
            },
            None => {
                crate::thread::with_threads(|threads| {
                    let pid = crate::thread::getpid();
                    threads[pid.index()].state = SchedState::Blocked;
                });
                arch::Selected::yield_now();
            }
        }
    }
}
