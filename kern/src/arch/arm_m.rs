//! Architecture support for ARMv6-M/v7-M/v8-M ("Cortex-M0/M0+, M3, M4").
//!
//! # Context switch strategy
//!
//! On exception entry the processor automatically stacks `r0-r3, r12, lr,
//! pc, xpsr` (the "base exception frame"). The remaining registers
//! (`r4-r11`) are this port's responsibility. `PendSV` is the only exception
//! that performs a full save/restore: `SysTick` (the preemption ticker, see
//! [`crate::ticker`]) only ever *requests* a switch by setting `PendSV`
//! pending and letting it happen at the next exception-exit boundary, which
//! keeps `SysTick` itself cheap and reentrant-safe.
//!
//! Cortex-M0/M0+ (Thumb-1 only) can't `stmia`/`ldmia` the high registers
//! `r8-r11` directly, so the save/restore sequence below always moves them
//! through `r4-r7` with `mov` first. That costs a handful of cycles on M3/M4
//! (which could do it in one instruction) in exchange for one code path that
//! is correct on every variant this port targets.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use abi::Pid;

use crate::arch::{Arch, IrqState};
use crate::time::Timestamp;

const EXC_RETURN_THREAD_PSP: u32 = 0xFFFF_FFFD;

/// Registers saved across a context switch, lowest address first.
/// `EXC_RETURN` rides along with `r4-r11` rather than being assumed
/// constant, so a thread that was saved under one exception (PendSV) can
/// in principle be resumed via a different one without the restore path
/// hardcoding which. `r8-r11` sit between `EXC_RETURN` and `r4-r7` because
/// that's the order the M0-safe save sequence below produces: `r8-r11` get
/// moved through `r4-r7` as scratch and stored first, then the real
/// `r4-r7` overwrite the scratch and get stored second.
#[repr(C)]
#[derive(Debug, Default)]
struct SavedState {
    exc_return: u32,
    r8: u32,
    r9: u32,
    r10: u32,
    r11: u32,
    r4: u32,
    r5: u32,
    r6: u32,
    r7: u32,
}

/// What's on the stack at exception entry regardless of FPU presence.
#[repr(C)]
#[derive(Debug, Default)]
struct BaseExceptionFrame {
    r0: u32,
    r1: u32,
    r2: u32,
    r3: u32,
    r12: u32,
    lr: u32,
    pc: u32,
    xpsr: u32,
}

const INITIAL_XPSR: u32 = 1 << 24; // Thumb bit only.

static CURRENT_SP: AtomicU32 = AtomicU32::new(0);
static NEXT_SP: AtomicU32 = AtomicU32::new(0);
static SWITCH_REQUESTED: AtomicBool = AtomicBool::new(false);
static TICKS: AtomicU32 = AtomicU32::new(0);

pub struct Selected;

impl Arch for Selected {
    fn stack_init(
        stack: &mut [u8],
        entry: extern "C" fn(usize) -> !,
        arg: usize,
        on_return: extern "C" fn() -> !,
    ) -> usize {
        // 8-byte align the top per AAPCS, then carve off a guard word, a
        // base frame, and a saved-state block, each sitting directly below
        // the last.
        let stack_base = stack.as_ptr() as usize;
        let top = (stack_base + stack.len()) & !0x7;
        let top_marker_addr = top - 4;
        let base_addr = top_marker_addr - core::mem::size_of::<BaseExceptionFrame>();
        let saved_addr = base_addr - core::mem::size_of::<SavedState>();

        unsafe {
            // Overflow sentinel at the bottom word: `measure_stack_usage`
            // and `check_stack_marker` both key off `stack_base`.
            core::ptr::write_volatile(stack_base as *mut u32, abi::STACK_MARKER);
            // A second copy sits immediately above the frame this function
            // just built, so a corrupted `stack_init` result (wrong sizes,
            // off-by-one in the frame math) is visible right next to the
            // frame itself rather than only at the other end of the stack.
            core::ptr::write_volatile(top_marker_addr as *mut u32, abi::STACK_MARKER);

            let base = base_addr as *mut BaseExceptionFrame;
            base.write(BaseExceptionFrame {
                r0: arg as u32,
                r1: 0,
                r2: 0,
                r3: 0,
                r12: 0,
                lr: on_return as usize as u32,
                pc: (entry as usize as u32) | 1, // force Thumb
                xpsr: INITIAL_XPSR,
            });
            let saved = saved_addr as *mut SavedState;
            saved.write(SavedState {
                exc_return: EXC_RETURN_THREAD_PSP,
                ..SavedState::default()
            });
        }
        saved_addr
    }

    unsafe fn start_threading(sp: usize) -> ! {
        CURRENT_SP.store(sp as u32, Ordering::SeqCst);
        restore_and_go(sp as u32)
    }

    fn yield_now() {
        SWITCH_REQUESTED.store(true, Ordering::SeqCst);
        cortex_m::peripheral::SCB::set_pendsv();
        cortex_m::asm::isb();
    }

    fn disable_irq() -> IrqState {
        let primask = cortex_m::register::primask::read();
        cortex_m::interrupt::disable();
        IrqState(if primask.is_active() { 0 } else { 1 })
    }

    unsafe fn restore_irq(state: IrqState) {
        if state.0 == 0 {
            cortex_m::interrupt::enable();
        }
    }

    fn reserved_idle_pid() -> Option<Pid> {
        None
    }
}

/// Records the stack pointer the scheduler chose for the next run, to be
/// picked up by the `PendSV` trampoline.
///
/// # Safety
/// Must only be called from inside a critical section (the scheduler always
/// calls this with interrupts masked).
pub unsafe fn set_next_sp(sp: usize) {
    NEXT_SP.store(sp as u32, Ordering::SeqCst);
}

pub fn now() -> Timestamp {
    Timestamp::from(TICKS.load(Ordering::Relaxed) as u64)
}

/// Called from the `SysTick` handler.
pub fn tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
    crate::ticker::on_tick();
}

/// Core clock `SysTick` counts against, in Hz. Defaults to a conservative
/// value; boards with a known clock tree call [`set_clock_freq`] during
/// `cpu_init`, before the ticker ever arms the timer.
static CLOCK_HZ: AtomicU32 = AtomicU32::new(16_000_000);

pub fn set_clock_freq(hz: u32) {
    CLOCK_HZ.store(hz, Ordering::Relaxed);
}

/// Programs `SysTick` for a `hz`-rate periodic interrupt and enables it.
/// Installed into [`crate::boot_hooks`] by `boot::kernel_init`.
pub fn arm_preemption_timer(hz: u32) {
    let core_hz = CLOCK_HZ.load(Ordering::Relaxed);
    let reload = (core_hz / hz.max(1)).max(1);
    unsafe {
        let syst = &*cortex_m::peripheral::SYST::PTR;
        syst.rvr.write(reload - 1);
        syst.cvr.write(0);
        syst.csr.modify(|v| v | 0b111); // ENABLE | TICKINT | CLKSOURCE
    }
}

pub fn disarm_preemption_timer() {
    unsafe {
        let syst = &*cortex_m::peripheral::SYST::PTR;
        syst.csr.modify(|v| v & !0b1);
    }
}

#[naked]
#[no_mangle]
unsafe extern "C" fn PendSV() {
    // Save r4-r11 and the current EXC_RETURN of the outgoing thread below
    // its PSP, hand off to the scheduler to pick the next stack pointer via
    // NEXT_SP (already populated before the switch was requested), then
    // tail into `restore_and_go` to load the incoming thread's frame —
    // exactly the inverse of this save, whether the frame was built here or
    // by `stack_init`.
    core::arch::asm!(
        "mrs r0, psp",
        "subs r0, r0, #36",
        "mov r1, lr", // current EXC_RETURN
        "str r1, [r0]",
        "adds r2, r0, #20",
        "stmia r2!, {{r4-r7}}",
        "mov r4, r8",
        "mov r5, r9",
        "mov r6, r10",
        "mov r7, r11",
        "adds r2, r0, #4",
        "stmia r2!, {{r4-r7}}",
        "bl {store_current}",
        "bl {load_next}",
        "b {restore}",
        store_current = sym store_current_sp,
        load_next = sym load_next_sp,
        restore = sym restore_and_go,
        options(noreturn),
    );
}

extern "C" fn store_current_sp(sp: u32) {
    CURRENT_SP.store(sp, Ordering::SeqCst);
}

extern "C" fn load_next_sp() -> u32 {
    SWITCH_REQUESTED.store(false, Ordering::SeqCst);
    NEXT_SP.load(Ordering::SeqCst)
}

/// Loads the [`SavedState`] + [`BaseExceptionFrame`] at `sp` and returns to
/// it. Shared by [`Selected::start_threading`] (no prior context to save)
/// and [`PendSV`]'s tail (the mirror image of its own save sequence).
#[naked]
unsafe extern "C" fn restore_and_go(sp: u32) -> ! {
    core::arch::asm!(
        "adds r2, r0, #4",
        "ldmia r2!, {{r4-r7}}",
        "mov r8, r4",
        "mov r9, r5",
        "mov r10, r6",
        "mov r11, r7",
        "ldmia r2!, {{r4-r7}}",
        "ldr r1, [r0]", // stored EXC_RETURN
        "msr psp, r2",
        "bx r1",
        options(noreturn),
    );
}

#[no_mangle]
unsafe extern "C" fn SVCall() {
    // Thread-mode-to-thread-mode yields go through `yield_now`/`PendSV`;
    // `SVCall` is reserved for future syscalls the scheduler doesn't need.
}
