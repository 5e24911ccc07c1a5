//! x86-32 thread switching.
//!
//! Cooperative, not interrupt-driven: there's no hardware equivalent of
//! Cortex-M's `PendSV` here, so every switch — voluntary yield or
//! scheduler-requested preemption — goes through the same save/call/restore
//! sequence, mirroring the `swapcontext`-based approach upstream except
//! using a plain callee-saved register frame instead of `ucontext_t`.

use core::sync::atomic::{AtomicU32, Ordering};

use abi::Pid;

use super::idt::Pushad;
use crate::arch::IrqState;
use crate::sched;

static CURRENT_SP: AtomicU32 = AtomicU32::new(0);
static NEXT_SP: AtomicU32 = AtomicU32::new(0);

/// Registers a context switch must preserve across the call boundary:
/// ebx, esi, edi, ebp (callee-saved under cdecl) plus eflags, since a
/// thread might be mid-critical-section when it's switched away from.
#[repr(C)]
#[derive(Default)]
struct SavedState {
    ebx: u32,
    esi: u32,
    edi: u32,
    ebp: u32,
    eflags: u32,
}

pub fn stack_init(
    stack: &mut [u8],
    entry: extern "C" fn(usize) -> !,
    arg: usize,
    on_return: extern "C" fn() -> !,
) -> usize {
    let stack_base = stack.as_ptr() as usize;
    let top = (stack_base + stack.len()) & !0xF;
    let mut sp = top as *mut u32;
    unsafe {
        // Fixed overflow sentinel at the bottom word, separate from the
        // initial register frame built below `top`.
        core::ptr::write_volatile(stack_base as *mut u32, abi::STACK_MARKER);

        // Fake return address slot `entry` will "ret" into, and the
        // argument `entry` expects per the cdecl convention a bare
        // `extern "C" fn(usize) -> !` trampoline would pop.
        sp = sp.sub(1);
        *sp = arg as u32;
        sp = sp.sub(1);
        *sp = on_return as usize as u32; // return address if entry ever returns
        sp = sp.sub(1);
        *sp = entry as usize as u32; // "return address" popped by `go`'s ret

        let saved = (sp as usize - core::mem::size_of::<SavedState>()) as *mut SavedState;
        saved.write(SavedState {
            eflags: 0x0202, // IF set
            ..SavedState::default()
        });
        sp = saved as *mut u32;
    }
    sp as usize
}

pub unsafe fn start_threading(sp: usize) -> ! {
    CURRENT_SP.store(sp as u32, Ordering::SeqCst);
    go(sp as u32)
}

pub fn yield_now() {
    unsafe { switch() };
}

pub fn disable_irq() -> IrqState {
    let eflags: u32;
    unsafe {
        core::arch::asm!("pushfd; pop {0}; cli", out(reg) eflags, options(nomem));
    }
    IrqState(eflags & abi::eflags::IF)
}

pub unsafe fn restore_irq(state: IrqState) {
    if state.0 != 0 {
        core::arch::asm!("sti", options(nomem, nostack));
    }
}

pub fn reserved_idle_pid() -> Option<Pid> {
    None
}

/// Canary values the breakpoint gate XORs into six saved general-purpose
/// registers, the same six-register round trip `test_int_bp` exercises
/// upstream.
pub(crate) const BP_CANARIES: [u32; 6] = [
    0x1111_1111, 0x2222_2222, 0x3333_3333, 0x4444_4444, 0x5555_5555, 0x6666_6666,
];

/// Called from [`super::idt::dispatch_one`] for `int3`. XORs a fixed set of
/// canaries into the saved context's general-purpose registers, in place,
/// so the handler's effect is observable by whatever executed the `int3`
/// once it resumes (used both as the boot self-test in [`super::idt::init`]
/// and by anything exercising the breakpoint gate directly).
///
/// Advancing past the `int3` opcode itself is the caller's responsibility —
/// the one-byte `CC` is already consumed by hardware before this handler
/// runs.
pub fn handle_breakpoint(regs: &mut Pushad) {
    regs.eax ^= BP_CANARIES[0];
    regs.ebx ^= BP_CANARIES[1];
    regs.ecx ^= BP_CANARIES[2];
    regs.edx ^= BP_CANARIES[3];
    regs.esi ^= BP_CANARIES[4];
    regs.edi ^= BP_CANARIES[5];
}

#[naked]
unsafe extern "C" fn switch() {
    core::arch::asm!(
        "pushfd",
        "push ebp",
        "push edi",
        "push esi",
        "push ebx",
        "mov eax, esp",
        "push eax", // cdecl arg for store_current_sp(sp: u32)
        "call {store_sp}",
        "add esp, 4",
        "call {sched_run}",
        "call {load_sp}",
        "mov esp, eax",
        "pop ebx",
        "pop esi",
        "pop edi",
        "pop ebp",
        "popfd",
        "ret",
        store_sp = sym store_current_sp,
        sched_run = sym run_scheduler,
        load_sp = sym load_next_sp,
        options(noreturn),
    );
}

/// Resumes whatever [`SavedState`]-shaped frame `sp` points at. Shared by
/// [`start_threading`] (the very first switch-in) and, via
/// [`super::idt::common_entry_trampoline`], by a thread being resumed after
/// an interrupt-driven reschedule — both cases just need "pop the callee-
/// saved set and `ret` into whatever comes next."
#[naked]
pub(crate) unsafe extern "C" fn go(sp: u32) -> ! {
    core::arch::asm!(
        "mov esp, [esp+4]",
        "pop ebx",
        "pop esi",
        "pop edi",
        "pop ebp",
        "popfd",
        "ret",
        options(noreturn),
    );
}

extern "C" fn store_current_sp(sp: u32) {
    CURRENT_SP.store(sp, Ordering::SeqCst);
}

extern "C" fn run_scheduler() {
    sched::run();
}

pub(crate) extern "C" fn load_next_sp() -> u32 {
    NEXT_SP.load(Ordering::SeqCst)
}

/// # Safety
/// Must only be called from inside a critical section.
pub unsafe fn set_next_sp(sp: usize) {
    NEXT_SP.store(sp as u32, Ordering::SeqCst);
}
