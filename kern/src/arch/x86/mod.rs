//! Architecture support for x86-32 (protected mode, PAE paging, 8259 PIC).

mod gdt;
pub mod idt;
pub mod paging;
mod pic;
mod thread;

use abi::Pid;

use crate::arch::{Arch, IrqState};
use crate::time::Timestamp;

pub struct Selected;

impl Arch for Selected {
    fn stack_init(
        stack: &mut [u8],
        entry: extern "C" fn(usize) -> !,
        arg: usize,
        on_return: extern "C" fn() -> !,
    ) -> usize {
        thread::stack_init(stack, entry, arg, on_return)
    }

    unsafe fn start_threading(sp: usize) -> ! {
        thread::start_threading(sp)
    }

    fn yield_now() {
        thread::yield_now()
    }

    fn disable_irq() -> IrqState {
        thread::disable_irq()
    }

    unsafe fn restore_irq(state: IrqState) {
        thread::restore_irq(state)
    }

    fn reserved_idle_pid() -> Option<Pid> {
        thread::reserved_idle_pid()
    }
}

/// Full x86 boot sequence: GDT, IDT, PIC remap, PAE paging. Called from
/// `boot::kernel_main` before any thread runs.
///
/// # Safety
/// Must run exactly once, in order, before interrupts are unmasked and
/// before any thread is scheduled.
pub unsafe fn init() {
    gdt::init();
    idt::init();
    pic::init();
    paging::init();
    pic::set_handler(HWTIMER_IRQ, hwtimer_irq);
}

pub fn now() -> Timestamp {
    // Ticked by the hwtimer IRQ handler registered above; exposed here so
    // `crate::time` has one spelling regardless of arch.
    Timestamp::from(TICK_COUNT.load(core::sync::atomic::Ordering::Relaxed))
}

pub fn tick() {
    TICK_COUNT.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
    crate::ticker::on_tick();
}

static TICK_COUNT: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(0);

/// 8254 PIT input frequency; fixed by the hardware, not board-configurable.
const PIT_BASE_HZ: u32 = 1_193_182;
const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;
const PIT_CMD_CH0_RATE_GEN: u8 = 0x36; // channel 0, lobyte/hibyte, mode 3
const HWTIMER_IRQ: u8 = 0;

fn hwtimer_irq(_irq: u8) {
    tick();
}

unsafe fn outb(port: u16, val: u8) {
    core::arch::asm!("out dx, al", in("dx") port, in("al") val, options(nomem, nostack));
}

/// Programs the PIT for a `hz`-rate periodic interrupt on IRQ0 and unmasks
/// it. Installed into [`crate::boot_hooks`] by `boot::kernel_init`.
pub fn arm_preemption_timer(hz: u32) {
    let divisor = (PIT_BASE_HZ / hz.max(1)).clamp(1, 0xFFFF) as u16;
    unsafe {
        outb(PIT_COMMAND, PIT_CMD_CH0_RATE_GEN);
        outb(PIT_CHANNEL0, (divisor & 0xFF) as u8);
        outb(PIT_CHANNEL0, (divisor >> 8) as u8);
    }
    pic::enable_irq(HWTIMER_IRQ);
}

pub fn disarm_preemption_timer() {
    pic::disable_irq(HWTIMER_IRQ);
}

pub use pic::{dispatch as pic_dispatch, disable_irq as pic_disable_irq, enable_irq as pic_enable_irq};

/// # Safety
/// Must only be called from inside a critical section.
pub unsafe fn set_next_sp(sp: usize) {
    thread::set_next_sp(sp)
}
