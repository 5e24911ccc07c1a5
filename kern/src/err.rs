//! Common error-handling support.
//!
//! Mirrors the kernel's own `Result`-based style: internal operations return
//! `Result<T, KernelError>` rather than panicking, so that a single fault
//! handler at the arch boundary can decide whether to recover, restart a
//! thread, or halt.

use abi::Pid;

/// Where a fault was detected.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultSource {
    /// Detected while a thread's own code was executing (a processor
    /// protection trap).
    User,
    /// Detected by the kernel while servicing a request on the thread's
    /// behalf (e.g. a bad argument to `thread_create`).
    Kernel,
}

/// Describes why a thread was faulted.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultInfo {
    /// The thread touched memory it has no business touching, or asked the
    /// kernel to do so on its behalf.
    MemoryAccess {
        /// The offending address, when the processor made it available.
        address: Option<usize>,
        source: FaultSource,
    },
    /// The stack marker at the base of the thread's stack no longer reads
    /// [`abi::STACK_MARKER`](crate::abi::STACK_MARKER) — it ran off the end
    /// of its stack.
    StackOverflow,
    /// An argument passed to a kernel operation was invalid (out-of-range
    /// priority, zero-sized stack, unknown pid, ...).
    BadArgument,
    /// An unrecoverable processor exception percolated up to the kernel
    /// (double fault, general protection fault on kernel code, ...) while
    /// `pid` was executing.
    ProcessorException { pid: Pid },
}

/// Top-level error type for internal kernel operations.
#[derive(Copy, Clone, Debug)]
pub enum KernelError {
    /// The caller can retry or otherwise handle this locally.
    Recoverable(u32),
    /// Associated thread has been moved to `Faulted` and should not run
    /// again until resolved (the core does not resolve faults on its own;
    /// that policy lives above it).
    Unrecoverable(FaultInfo),
}

impl From<FaultInfo> for KernelError {
    fn from(f: FaultInfo) -> Self {
        Self::Unrecoverable(f)
    }
}
