//! Architecture abstraction layer.
//!
//! Every port implements [`Arch`], which is the complete interface the
//! scheduler-independent core (`thread`, `sched`, `ticker`, `alloc_facade`)
//! needs from hardware: building an initial stack frame for a new thread,
//! starting the very first context switch, yielding voluntarily, and masking
//! interrupts around short critical sections.
//!
//! The core never matches on target architecture directly; it only ever
//! calls through this trait, so arch-specific naked functions and inline
//! assembly stay contained to the `arch::*` modules below.

use abi::Pid;

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "arm", target_feature = "thumb-mode"))] {
        #[path = "arm_m.rs"]
        mod selected;
    } else if #[cfg(target_arch = "arm")] {
        #[path = "arm7.rs"]
        mod selected;
    } else if #[cfg(target_arch = "msp430")] {
        #[path = "msp430.rs"]
        mod selected;
    } else if #[cfg(all(target_arch = "x86", target_os = "none"))] {
        #[path = "x86/mod.rs"]
        mod selected;
    } else {
        #[path = "host.rs"]
        mod selected;
    }
}

pub use selected::{
    arm_preemption_timer, disarm_preemption_timer, now, set_next_sp, tick, Selected,
};

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86", target_os = "none"))] {
        /// x86-only surface: GDT/IDT/PIC/paging setup plus the PIC and
        /// paging operations higher subsystems are expected to drive
        /// directly (interrupt routing, lazy-heap mapping). No Cortex-M/ARM
        /// port needs an equivalent: their interrupt controllers are set up
        /// through the PAC the board crate already depends on.
        pub use selected::init as x86_init;
        pub use selected::{pic_dispatch, pic_disable_irq, pic_enable_irq};
        pub use selected::idt::{interrupt_handler_set, irq_is_in};
        pub use selected::paging::{
            get_pte, get_virtual_pages, handle_page_fault, map_physical_pages,
            release_virtual_pages, reserve_heap_region,
        };
    }
}

/// An opaque token proving interrupts were disabled by [`Arch::disable_irq`].
/// Holding one and calling [`Arch::restore_irq`] with it is the only
/// sanctioned way to re-enable interrupts, which keeps nested critical
/// sections from re-enabling interrupts too early.
#[derive(Copy, Clone, Debug)]
pub struct IrqState(pub(crate) u32);

/// Operations every arch port must provide.
pub trait Arch {
    /// Builds the initial contents of a new thread's stack so that the first
    /// context switch into it looks exactly like a context switch *out* of a
    /// running thread that's about to run `entry(arg)` and, were it ever to
    /// return, would execute `on_return` is undefined; in this kernel core
    /// threads never return and `on_return` must itself never return.
    ///
    /// `stack` is the entire stack region, lowest address first. Returns the
    /// stack pointer value to record in the new thread's TCB.
    fn stack_init(
        stack: &mut [u8],
        entry: extern "C" fn(usize) -> !,
        arg: usize,
        on_return: extern "C" fn() -> !,
    ) -> usize;

    /// Performs the one-time transition from "kernel boot code running on
    /// its own stack" to "running the first scheduled thread." Does not
    /// return.
    ///
    /// # Safety
    /// May only be called once, after the scheduler has selected a first
    /// thread to run.
    unsafe fn start_threading(sp: usize) -> !;

    /// Requests a voluntary context switch to whichever thread the
    /// scheduler selects next, returning once this thread runs again.
    fn yield_now();

    /// Masks all maskable interrupts and returns a token recording the
    /// previous state.
    fn disable_irq() -> IrqState;

    /// Restores interrupts to the state recorded in `state`. Not simply
    /// "turn interrupts back on" — nesting `disable_irq`/`restore_irq` pairs
    /// must compose, so a restore inside an already-disabled outer section
    /// is a no-op.
    ///
    /// # Safety
    /// `state` must have come from a `disable_irq` call that hasn't been
    /// restored yet.
    unsafe fn restore_irq(state: IrqState);

    /// Arch-specific idle pid, if the port reserves one statically (the x86
    /// hwtimer thread, for instance). Most ports return `None` and let
    /// `boot` create an ordinary idle thread.
    fn reserved_idle_pid() -> Option<Pid> {
        None
    }
}
