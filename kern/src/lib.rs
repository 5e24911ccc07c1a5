//! Kernel core: thread/scheduling primitives, arch ports, and the demand
//! heap. No task loading, no IPC, no drivers — just the scheduler and the
//! allocator it stands on.

#![cfg_attr(target_os = "none", no_std)]

/// Logs from kernel context.
///
/// Visible to the rest of the crate without an explicit `use` by virtue of
/// `#[macro_use]` below. Which backend actually moves bytes depends on the
/// `klog-itm`/`klog-semihosting`/`klog-host` Cargo features — exactly one is
/// expected to be active at a time, and with none active the macro compiles
/// away to nothing so call sites never need their own `cfg`.
#[cfg(all(
    not(feature = "klog-semihosting"),
    not(feature = "klog-itm"),
    not(feature = "klog-host")
))]
macro_rules! klog {
    ($s:expr) => {};
    ($s:expr, $($tt:tt)*) => {};
}

#[cfg(feature = "klog-itm")]
macro_rules! klog {
    ($s:expr) => {
        #[allow(unused_unsafe)]
        unsafe {
            let stim = &mut (*cortex_m::peripheral::ITM::ptr()).stim[0];
            cortex_m::iprintln!(stim, $s);
        }
    };
    ($s:expr, $($tt:tt)*) => {
        #[allow(unused_unsafe)]
        unsafe {
            let stim = &mut (*cortex_m::peripheral::ITM::ptr()).stim[0];
            cortex_m::iprintln!(stim, $s, $($tt)*);
        }
    };
}

#[cfg(feature = "klog-semihosting")]
macro_rules! klog {
    ($s:expr) => { let _ = cortex_m_semihosting::hprintln!($s); };
    ($s:expr, $($tt:tt)*) => { let _ = cortex_m_semihosting::hprintln!($s, $($tt)*); };
}

/// Host backend: plain `eprintln!`, for `cargo test` and local tools that
/// link this crate outside an embedded target.
#[cfg(feature = "klog-host")]
macro_rules! klog {
    ($s:expr) => { std::eprintln!($s); };
    ($s:expr, $($tt:tt)*) => { std::eprintln!($s, $($tt)*); };
}

pub mod alloc_facade;
pub mod arch;
pub mod boot_hooks;
pub mod err;
pub mod reaper;
pub mod sched;
pub mod thread;
pub mod ticker;
pub mod time;

pub use abi::{Pid, Priority, SchedState, ThreadFlags};
pub use err::{FaultInfo, FaultSource, KernelError};
