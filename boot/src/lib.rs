//! Board-facing boot sequence: the glue between "reset vector just ran" and
//! "the scheduler is running threads."
//!
//! `kern` never references a board directly — everything it needs from the
//! outside world comes through [`BoardSupport`], which a concrete board
//! crate implements and hands to [`kernel_main`]. This mirrors the
//! `app`/board-support split the teacher uses to keep its kernel reusable
//! across boards; here the same split keeps `kern` reusable by a host test
//! harness that never implements `BoardSupport` at all.
#![cfg_attr(target_os = "none", no_std)]

use abi::{Priority, ThreadFlags, PRIORITY_IDLE, PRIORITY_MAIN};
use kern::arch::{self, Arch};

/// Idle thread stack. Small: it only ever executes a `yield_now` loop.
pub const IDLE_STACK_SIZE: usize = 512;
/// Reaper thread stack: frees dying threads' stacks, never allocates more
/// than one stack-sized write-zero loop's worth of locals itself.
pub const REAPER_STACK_SIZE: usize = 512;
/// Default stack handed to the first (`main`) application thread. Board
/// crates that need more should spawn additional threads themselves once
/// `kernel_main` would otherwise idle.
pub const MAIN_STACK_SIZE: usize = 4096;

/// Everything `kernel_main` needs from the board, in boot order.
///
/// A board crate implements this and passes it by reference; the
/// implementor owns all board-specific memory and peripheral state, `kern`
/// never reaches around this trait to touch hardware directly.
pub trait BoardSupport {
    /// Early CPU setup: clocks, caches, anything that must happen before
    /// peripherals are touched. Called first, with interrupts still
    /// disabled.
    fn cpu_init(&self);

    /// Board init: GPIO, power rails, whatever this board needs beyond the
    /// CPU itself. Called once, right after `cpu_init`.
    fn board_init(&self);

    /// Brings up the debug/log UART (or equivalent), so `klog!` has
    /// somewhere to go for the rest of boot.
    fn uart_stdio_init(&self);

    /// The application's entry point, run as the `main` thread once
    /// threading starts. Returning marks the `main` thread stopped and
    /// hands its stack to the reaper; most boards loop forever instead.
    fn main_entry(&self);

    /// Called from the panic handler just before halting, for boards that
    /// can flash an LED or dump state over a debug port. Not required to
    /// return in any meaningful sense — the system halts immediately after.
    fn panic_arch(&self) {}
}

#[repr(align(8))]
struct Stack<const N: usize>([u8; N]);

static mut IDLE_STACK: Stack<IDLE_STACK_SIZE> = Stack([0; IDLE_STACK_SIZE]);
static mut REAPER_STACK: Stack<REAPER_STACK_SIZE> = Stack([0; REAPER_STACK_SIZE]);
static mut MAIN_STACK: Stack<MAIN_STACK_SIZE> = Stack([0; MAIN_STACK_SIZE]);

extern "C" fn idle_entry(_arg: usize) -> ! {
    loop {
        arch::Selected::yield_now();
    }
}

/// Thread entry point for the `main` thread: reconstructs the board
/// reference from the pid's stashed argument and runs its `main_entry`.
/// Monomorphized per board type, so unlike the kernel's own exit
/// trampoline this needs no dynamic function-pointer storage to recover
/// its target.
extern "C" fn main_trampoline<B: BoardSupport>(board_ptr: usize) -> ! {
    let board = unsafe { &*(board_ptr as *const B) };
    board.main_entry();
    kern::thread::sched_task_exit()
}

/// Spawns the idle and reaper threads, then the board's `main` thread, and
/// starts threading. Never returns.
///
/// # Safety
/// Must be called exactly once, after the arch-specific subsystem init
/// (`cpu_init`/interrupt controller/paging) has already run.
unsafe fn kernel_init<B: BoardSupport>(board: &'static B) -> ! {
    let idle_stack: &'static mut [u8] = &mut IDLE_STACK.0;
    let idle_pid = kern::thread::create(
        idle_entry,
        0,
        idle_stack,
        PRIORITY_IDLE,
        ThreadFlags::WOUT_YIELD,
    )
    .expect("idle thread creation must succeed at boot");

    let reaper_stack: &'static mut [u8] = &mut REAPER_STACK.0;
    let reaper_priority = Priority(PRIORITY_IDLE.0 - 1);
    let reaper_pid = kern::thread::create(
        kern::reaper::reaper_main,
        0,
        reaper_stack,
        reaper_priority,
        ThreadFlags::WOUT_YIELD,
    )
    .expect("reaper thread creation must succeed at boot");
    kern::reaper::set_pid(reaper_pid);

    let main_stack: &'static mut [u8] = &mut MAIN_STACK.0;
    let main_pid = kern::thread::create(
        main_trampoline::<B>,
        board as *const B as usize,
        main_stack,
        PRIORITY_MAIN,
        ThreadFlags::WOUT_YIELD,
    )
    .expect("main thread creation must succeed at boot");

    let _ = (idle_pid, main_pid);

    kern::boot_hooks::install(arch::arm_preemption_timer, arch::disarm_preemption_timer);
    kern::ticker::set_active(true);

    kern::sched::run();
    let sp = kern::sched::active_sp();
    arch::Selected::start_threading(sp)
}

/// Runs the full Cortex-M/ARM boot order: `board_init` (which calls
/// `cpu_init`, clocks, UART) then `kernel_init`.
///
/// # Safety
/// Must be called exactly once, from the reset handler, before `.data`/
/// `.bss` are assumed initialized by anything other than the runtime
/// startup code that calls this.
pub unsafe fn kernel_main_arm<B: BoardSupport>(board: &'static B) -> ! {
    board.cpu_init();
    board.board_init();
    board.uart_stdio_init();
    kernel_init(board)
}

/// Runs the x86-32 boot order: early UART, GDT, IDT, PIC remap, full UART,
/// memory (page tables + page-fault handler), board init, then
/// `kernel_init`.
///
/// # Safety
/// Must be called exactly once, from the bootloader entry point.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub unsafe fn kernel_main_x86<B: BoardSupport>(board: &'static B) -> ! {
    board.uart_stdio_init();
    kern::arch::x86_init();
    board.board_init();
    kernel_init(board)
}
