//! Architecture support for MSP430 (16-bit, single register file, no
//! privilege levels).
//!
//! There is no `original_source` reference for this port in the retrieval
//! corpus the rest of this crate draws on; the register save list and
//! status-register handling below follow the MSP430 ISA's own calling
//! convention (r4-r11 callee-saved, r12-r15 caller-saved) rather than an
//! observed implementation. Treat this port as the weakest-grounded of the
//! five and re-derive it against real hardware before trusting it.

use abi::Pid;

use crate::arch::{Arch, IrqState};
use crate::time::Timestamp;

/// General interrupt enable bit in the status register.
const GIE: u16 = 0x0008;

// Field order matters: `switch()` pushes r4..r11 low-to-high (so r11 ends
// up at the lowest address, nearest the final stack pointer) and pops
// r11..r4 to match. This struct's field order must mirror that memory
// layout — r11 first (lowest address) through r4 last (highest) — not
// register-number order, or `stack_init` would hand a new thread's
// argument to the wrong register on its first switch-in.
#[repr(C)]
#[derive(Default)]
struct SavedState {
    r11: u16,
    r10: u16,
    r9: u16,
    r8: u16,
    r7: u16,
    r6: u16,
    r5: u16,
    r4: u16,
}

static mut TICKS: u64 = 0;
static mut CURRENT_SP: u16 = 0;
static mut NEXT_SP: u16 = 0;

pub struct Selected;

impl Arch for Selected {
    fn stack_init(
        stack: &mut [u8],
        entry: extern "C" fn(usize) -> !,
        arg: usize,
        on_return: extern "C" fn() -> !,
    ) -> usize {
        let stack_base = stack.as_ptr() as usize;
        let top = (stack_base + stack.len()) & !1;
        let mut sp = top as *mut u16;

        unsafe {
            // Fixed overflow sentinel at the bottom word, separate from the
            // initial register frame built below `top`.
            core::ptr::write_volatile(stack_base as *mut u32, abi::STACK_MARKER);

            sp = sp.sub(1);
            *sp = entry as usize as u16; // return PC when "popped" as if by `ret`
            sp = sp.sub(1);
            *sp = GIE; // initial SR: interrupts enabled

            let saved = sp.sub(core::mem::size_of::<SavedState>() / 2) as *mut SavedState;
            saved.write(SavedState {
                r4: arg as u16,
                r5: on_return as usize as u16,
                ..SavedState::default()
            });
            sp = saved as *mut u16;
        }
        sp as usize
    }

    unsafe fn start_threading(sp: usize) -> ! {
        CURRENT_SP = sp as u16;
        go(sp as u16)
    }

    fn yield_now() {
        unsafe { switch() };
    }

    fn disable_irq() -> IrqState {
        let sr = read_sr();
        unsafe { write_sr(sr & !GIE) };
        IrqState((sr & GIE) as u32)
    }

    unsafe fn restore_irq(state: IrqState) {
        if state.0 != 0 {
            write_sr(read_sr() | GIE);
        }
    }

    fn reserved_idle_pid() -> Option<Pid> {
        None
    }
}

pub fn now() -> Timestamp {
    unsafe { Timestamp::from(TICKS) }
}

pub fn tick() {
    unsafe { TICKS += 1 };
    crate::ticker::on_tick();
}

/// Timer_A registers, memory-mapped on the classic MSP430 layout. Like the
/// rest of this port, this isn't checked against real hardware — re-derive
/// before trusting it on a specific part.
const TACTL: usize = 0x0160;
const TACCTL0: usize = 0x0162;
const TACCR0: usize = 0x0172;
const TASSEL_ACLK: u16 = 0x0100;
const MC_UP: u16 = 0x0010;
const CCIE: u16 = 0x0010;
const ACLK_HZ: u32 = 32_768;

pub fn arm_preemption_timer(hz: u32) {
    let divisor = (ACLK_HZ / hz.max(1)).max(1).min(u16::MAX as u32) as u16;
    unsafe {
        write_reg(TACCR0, divisor);
        write_reg(TACCTL0, CCIE);
        write_reg(TACTL, TASSEL_ACLK | MC_UP);
    }
}

pub fn disarm_preemption_timer() {
    unsafe { write_reg(TACTL, 0) };
}

#[cfg(target_arch = "msp430")]
unsafe fn write_reg(addr: usize, val: u16) {
    core::ptr::write_volatile(addr as *mut u16, val);
}

#[cfg(not(target_arch = "msp430"))]
unsafe fn write_reg(_addr: usize, _val: u16) {
    unreachable!("msp430 port compiled for non-msp430 target")
}

/// # Safety
/// Must only be called from inside a critical section.
pub unsafe fn set_next_sp(sp: usize) {
    NEXT_SP = sp as u16;
}

#[cfg(target_arch = "msp430")]
fn read_sr() -> u16 {
    let sr: u16;
    unsafe { core::arch::asm!("mov r2, {0}", out(reg) sr) };
    sr
}

#[cfg(target_arch = "msp430")]
unsafe fn write_sr(v: u16) {
    core::arch::asm!("mov {0}, r2", in(reg) v);
}

#[cfg(not(target_arch = "msp430"))]
fn read_sr() -> u16 {
    unreachable!("msp430 port compiled for non-msp430 target")
}
#[cfg(not(target_arch = "msp430"))]
unsafe fn write_sr(_v: u16) {
    unreachable!("msp430 port compiled for non-msp430 target")
}

#[naked]
unsafe extern "C" fn switch() {
    // Push the callee-saved set, swap CURRENT_SP/NEXT_SP through the
    // scheduler, pop the incoming thread's set, `ret` into it.
    core::arch::asm!(
        "push r4", "push r5", "push r6", "push r7",
        "push r8", "push r9", "push r10", "push r11",
        "mov r1, r12", // arg for store_current_sp(sp: u16)
        "bl {store_sp}",
        "bl {sched_run}",
        "bl {load_sp}",
        "mov r12, r1", // load_next_sp's return value becomes the new SP
        "pop r11", "pop r10", "pop r9", "pop r8",
        "pop r7", "pop r6", "pop r5", "pop r4",
        "ret",
        store_sp = sym store_current_sp,
        sched_run = sym run_scheduler,
        load_sp = sym load_next_sp,
        options(noreturn),
    );
}

#[naked]
unsafe extern "C" fn go(sp: u16) -> ! {
    core::arch::asm!(
        "mov r12, r1",
        "pop r11", "pop r10", "pop r9", "pop r8",
        "pop r7", "pop r6", "pop r5", "pop r4",
        "ret",
        options(noreturn),
    );
}

extern "C" fn store_current_sp(sp: u16) {
    unsafe { CURRENT_SP = sp };
}

extern "C" fn run_scheduler() {
    crate::sched::run();
}

extern "C" fn load_next_sp() -> u16 {
    unsafe { NEXT_SP }
}
