//! Interrupt Descriptor Table construction and the common entry/exit path
//! every vector funnels through.
//!
//! Each vector gets its own tiny stub, generated below: a dummy error-code
//! push for vectors that don't get one from hardware, the vector number,
//! then a jump to [`common_entry_trampoline`]. From there everything is
//! vector-number-driven: a per-vector callback installed through
//! [`interrupt_handler_set`] takes priority, falling back to PIC dispatch
//! for IRQ vectors and [`dispatch_fault`] for everything else — the C
//! dispatcher contract SPEC_FULL's interrupt-dispatch section describes.

use core::sync::atomic::{AtomicBool, Ordering};

use abi::{eflags, pf_ec, vector, IdtGate};

use crate::err::{FaultInfo, FaultSource};

/// General-purpose register snapshot taken by [`common_entry_trampoline`],
/// in push order (last pushed is first field so the struct overlays the
/// stack exactly as `pushad` left it, high to low: edi, esi, ebp, esp, ebx,
/// edx, ecx, eax).
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct Pushad {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp_dummy: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
}

static mut IDT: [IdtGate; vector::MAX] = [IdtGate {
    offset_lo: 0,
    selector: 0,
    zero: 0,
    type_attr: 0,
    offset_hi: 0,
}; vector::MAX];

static mut IDTR: [u8; 6] = [0; 6];

#[repr(C, packed)]
struct Idtr {
    limit: u16,
    base: u32,
}

/// Set for the duration of [`common_entry`], so a second interrupt arriving
/// while one is already being serviced is detectable — this port never
/// re-enables interrupts inside an ISR, so a reentrant interrupt can only
/// mean a hardware fault during dispatch itself, not legitimate nesting.
static IN_ISR: AtomicBool = AtomicBool::new(false);

/// True while the CPU is inside an interrupt handler. Exposed so code that
/// behaves differently in interrupt context (deferred work, allocation
/// policy) can check without threading a flag through every call.
pub fn irq_is_in() -> bool {
    IN_ISR.load(Ordering::SeqCst)
}

pub type VectorHandler = fn(u8, &mut Pushad, u32);

static mut HANDLERS: [Option<VectorHandler>; vector::MAX] = [None; vector::MAX];

/// Installs `handler` as the callback for `vec`, overriding the default
/// dispatch (PIC forwarding for IRQ vectors, the fault path for
/// exceptions). Replaces any previous registration for the same vector.
///
/// # Safety
/// Must not run concurrently with dispatch; callers mask interrupts first.
pub unsafe fn interrupt_handler_set(vec: u8, handler: VectorHandler) {
    HANDLERS[vec as usize] = Some(handler);
}

/// Builds and loads the IDT, then runs the breakpoint self-test.
///
/// # Safety
/// Must run once during boot, before interrupts are unmasked.
pub unsafe fn init() {
    for v in 0..vector::MAX {
        let addr = STUBS[v] as usize as u32;
        let dpl3 = v as u8 == vector::BREAKPOINT;
        IDT[v] = IdtGate::new(addr, dpl3);
    }

    let idtr = Idtr {
        limit: (core::mem::size_of_val(&IDT) - 1) as u16,
        base: IDT.as_ptr() as u32,
    };
    core::ptr::write_unaligned(IDTR.as_mut_ptr() as *mut Idtr, idtr);
    core::arch::asm!("lidt [{0}]", in(reg) IDTR.as_ptr(), options(readonly, nostack));

    self_test_breakpoint();
}

/// Stub for a vector the CPU pushes a real error code for, per the Intel
/// SDM (#DF, Invalid TSS, Segment Not Present, Stack-Segment Fault, #GP,
/// #PF, #AC — 8, 10-14, 17): the hardware value stays put, only the vector
/// number gets pushed.
macro_rules! ec_stub {
    ($vec:literal) => {{
        #[naked]
        unsafe extern "C" fn stub() {
            core::arch::asm!(
                "push {v}",
                "jmp {common}",
                v = const $vec,
                common = sym common_entry_trampoline,
                options(noreturn),
            );
        }
        stub as unsafe extern "C" fn()
    }};
}

/// Stub for a vector with no hardware error code: push a dummy zero first
/// so `common_entry` finds `(vector, error_code)` at the same offsets
/// regardless of which vector fired.
macro_rules! noec_stub {
    ($vec:literal) => {{
        #[naked]
        unsafe extern "C" fn stub() {
            core::arch::asm!(
                "push 0",
                "push {v}",
                "jmp {common}",
                v = const $vec,
                common = sym common_entry_trampoline,
                options(noreturn),
            );
        }
        stub as unsafe extern "C" fn()
    }};
}

/// One naked stub per vector. Each entry is a literal `ec_stub!`/
/// `noec_stub!` invocation picked per vector below, not a runtime branch
/// inside a naked function (which would corrupt the stack layout
/// `common_entry_trampoline` expects).
static STUBS: [unsafe extern "C" fn(); vector::MAX] = [
    noec_stub!(0), noec_stub!(1), noec_stub!(2), noec_stub!(3), noec_stub!(4),
    noec_stub!(5), noec_stub!(6), noec_stub!(7), ec_stub!(8), noec_stub!(9),
    ec_stub!(10), ec_stub!(11), ec_stub!(12), ec_stub!(13), ec_stub!(14),
    noec_stub!(15), noec_stub!(16), ec_stub!(17), noec_stub!(18), noec_stub!(19),
    noec_stub!(20), noec_stub!(21), noec_stub!(22), noec_stub!(23), noec_stub!(24),
    noec_stub!(25), noec_stub!(26), noec_stub!(27), noec_stub!(28), noec_stub!(29),
    noec_stub!(30), noec_stub!(31), noec_stub!(32), noec_stub!(33), noec_stub!(34),
    noec_stub!(35), noec_stub!(36), noec_stub!(37), noec_stub!(38), noec_stub!(39),
    noec_stub!(40), noec_stub!(41), noec_stub!(42), noec_stub!(43), noec_stub!(44),
    noec_stub!(45), noec_stub!(46), noec_stub!(47),
];

/// Offset, in `u32` words from a `&Pushad`, of the `eflags` word the CPU
/// pushed itself: 8 words of `Pushad`, then vector number, error code,
/// `eip`, `cs`, `eflags`.
const IFRAME_EFLAGS: isize = 12;

#[naked]
unsafe extern "C" fn common_entry_trampoline() {
    // `common_entry` takes `(&mut Pushad, vector, error_code)` under
    // cdecl: push right-to-left, call, then clean up. Its return value
    // (in eax) is 0 to resume this frame directly, nonzero to tail-switch
    // into whatever thread the scheduler picked instead.
    core::arch::asm!(
        "pushad",
        "mov eax, esp",
        "mov ecx, [esp + 32]", // vector number, pushed by the stub
        "mov edx, [esp + 36]", // error code, real or dummy
        "push edx",
        "push ecx",
        "push eax", // &mut Pushad
        "call {handler}",
        "add esp, 12",
        "test eax, eax",
        "jnz 2f",
        "popad",
        "add esp, 8", // discard vector number and error code
        "iretd",
        "2:",
        "call {load_sp}",
        "push eax",
        "call {go}",
        handler = sym common_entry,
        load_sp = sym super::thread::load_next_sp,
        go = sym super::thread::go,
        options(noreturn),
    );
}

extern "C" fn common_entry(pushad: &mut Pushad, vector_num: u32, error_code: u32) -> u32 {
    let vector_num = vector_num as u8;

    if IN_ISR.swap(true, Ordering::SeqCst) {
        klog!("reentrant interrupt on vector {}, halting", vector_num);
        halt_forever();
    }

    dispatch_one(vector_num, pushad, error_code);
    IN_ISR.store(false, Ordering::SeqCst);

    reschedule_on_return(pushad)
}

fn dispatch_one(vector_num: u8, pushad: &mut Pushad, error_code: u32) {
    if let Some(handler) = unsafe { HANDLERS[vector_num as usize] } {
        handler(vector_num, pushad, error_code);
        return;
    }
    if (vector::PIC_MASTER_BASE..vector::PIC_MASTER_BASE + 16).contains(&vector_num) {
        super::pic::dispatch(vector_num);
        return;
    }
    dispatch_fault(vector_num, pushad, error_code);
}

/// Decides whether this interrupt should hand off to a different thread on
/// return. No reschedule happens if none was requested, or if the
/// interrupted code had interrupts disabled (it's in a critical section and
/// must not be preempted). Otherwise copies the interrupted thread's
/// context into its TCB — as a frame [`super::thread::go`] already knows
/// how to resume — and lets the scheduler's pick take over instead.
fn reschedule_on_return(pushad: &mut Pushad) -> u32 {
    let iframe = pushad as *mut Pushad as *const u32;
    let iframe_eflags = unsafe { core::ptr::read_volatile(iframe.offset(IFRAME_EFLAGS)) };

    if !crate::sched::SWITCH_REQUESTED.load(Ordering::SeqCst) || iframe_eflags & eflags::IF == 0 {
        return 0;
    }

    let was_pid = crate::sched::active_pid();
    crate::sched::run();
    if crate::sched::active_pid() == was_pid {
        return 0;
    }

    let frame_top = pushad as *mut Pushad as u32;
    let resume_sp = unsafe { build_resume_frame(frame_top) };
    crate::thread::with_threads(|threads| {
        threads[was_pid.index()].sp = resume_sp as usize;
    });
    1
}

/// Builds a [`super::thread::go`]-resumable record (callee-saved registers
/// plus a return address) just below the untouched pushad/vector/
/// error-code/CPU-iret block at `frame_top`, so the preempted thread looks
/// exactly like one that yielded voluntarily the next time it's selected —
/// it just lands in [`resume_from_irq_frame`], which finishes unwinding the
/// block still sitting above it instead of popping real saved registers.
unsafe fn build_resume_frame(frame_top: u32) -> u32 {
    let mut sp = frame_top as *mut u32;
    sp = sp.sub(1);
    core::ptr::write(sp, resume_from_irq_frame as usize as u32); // return address
    sp = sp.sub(1);
    core::ptr::write(sp, 0); // eflags; the real iret frame below restores it
    sp = sp.sub(1);
    core::ptr::write(sp, 0); // ebp
    sp = sp.sub(1);
    core::ptr::write(sp, 0); // edi
    sp = sp.sub(1);
    core::ptr::write(sp, 0); // esi
    sp = sp.sub(1);
    core::ptr::write(sp, 0); // ebx
    sp as u32
}

/// Landing point for a thread resumed after an interrupt-driven
/// reschedule. `esp` already points at the pushad/vector/error-code/iret
/// block [`common_entry_trampoline`] built when this thread was preempted;
/// finish unwinding it exactly as the direct-resume path would have.
#[naked]
unsafe extern "C" fn resume_from_irq_frame() -> ! {
    core::arch::asm!("popad", "add esp, 8", "iretd", options(noreturn));
}

fn halt_forever() -> ! {
    loop {
        unsafe { core::arch::asm!("cli", "hlt", options(nomem, nostack)) };
    }
}

fn dispatch_fault(vector_num: u8, pushad: &mut Pushad, error_code: u32) {
    let fault = match vector_num {
        v if v == vector::PAGE_FAULT => {
            let cr2 = unsafe { read_cr2() };
            if let Some(resolved) = super::paging::handle_page_fault(cr2, error_code) {
                let _ = resolved;
                return;
            }
            FaultInfo::MemoryAccess {
                address: Some(cr2 as usize),
                source: if error_code & pf_ec::USER != 0 {
                    FaultSource::User
                } else {
                    FaultSource::Kernel
                },
            }
        }
        v if v == vector::GENERAL_PROTECTION => FaultInfo::MemoryAccess {
            address: None,
            source: FaultSource::User,
        },
        v if v == vector::BREAKPOINT => {
            super::thread::handle_breakpoint(pushad);
            return;
        }
        _ => FaultInfo::ProcessorException {
            pid: crate::sched::active_pid(),
        },
    };

    crate::thread::fault_current(fault);
}

unsafe fn read_cr2() -> u32 {
    let v: u32;
    core::arch::asm!("mov {0}, cr2", out(reg) v, options(nomem, nostack));
    v
}

/// Executes `int3` with six known register values and checks that
/// [`super::thread::handle_breakpoint`]'s XOR transform came back
/// correctly — a sanity check, run once at boot, that gate construction
/// and the trampoline's save/restore are wired correctly. Mirrors
/// upstream's `test_int_bp`.
fn self_test_breakpoint() {
    let canaries = super::thread::BP_CANARIES;
    let mut eax: u32 = 0xAAAA_0000;
    let mut ebx: u32 = 0xAAAA_0001;
    let mut ecx: u32 = 0xAAAA_0002;
    let mut edx: u32 = 0xAAAA_0003;
    let mut esi: u32 = 0xAAAA_0004;
    let mut edi: u32 = 0xAAAA_0005;
    unsafe {
        core::arch::asm!(
            "int3",
            inout("eax") eax,
            inout("ebx") ebx,
            inout("ecx") ecx,
            inout("edx") edx,
            inout("esi") esi,
            inout("edi") edi,
        );
    }
    let ok = eax == 0xAAAA_0000 ^ canaries[0]
        && ebx == 0xAAAA_0001 ^ canaries[1]
        && ecx == 0xAAAA_0002 ^ canaries[2]
        && edx == 0xAAAA_0003 ^ canaries[3]
        && esi == 0xAAAA_0004 ^ canaries[4]
        && edi == 0xAAAA_0005 ^ canaries[5];
    if !ok {
        panic!("breakpoint self-test failed: IDT gate or trampoline is miswired");
    }
}
