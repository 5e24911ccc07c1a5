//! Kernel timestamp representation.

use ufmt::derive::uDebug;

/// Monotonic in-kernel timestamp, measured in an arch-defined "tick" unit
/// (SysTick periods on ARM-M, hwtimer periods on x86, the test harness's
/// virtual clock on the host backend).
#[derive(Copy, Clone, Debug, uDebug, Eq, PartialEq, Ord, PartialOrd, Default)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl From<u64> for Timestamp {
    fn from(v: u64) -> Self {
        Timestamp(v)
    }
}

impl From<Timestamp> for u64 {
    fn from(v: Timestamp) -> Self {
        v.0
    }
}

impl Timestamp {
    pub fn checked_add_ticks(self, ticks: u64) -> Option<Self> {
        self.0.checked_add(ticks).map(Timestamp)
    }
}

/// Current kernel time, as seen by whichever arch port is active.
pub fn now() -> Timestamp {
    crate::arch::now()
}
