// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Newtype wrappers, type aliases and constants shared by the policy and
//! the host runtime.
//!
//! Newtypes for identifiers (DSQ IDs, PIDs, CPU IDs) and virtual time
//! prevent silent type confusion. Plain quantities (timestamps, slices,
//! weights) are type aliases.

use std::fmt;

/// Simulated or host time in nanoseconds.
pub type TimeNs = u64;

/// Scheduling weight. The baseline weight is [`WEIGHT_DFL`].
pub type Weight = u32;

/// Default time slice granted per dispatch (20ms, as SCX_SLICE_DFL).
pub const SLICE_DFL_NS: TimeNs = 20_000_000;

/// Baseline task weight. Charges are scaled by `WEIGHT_DFL / weight`.
pub const WEIGHT_DFL: Weight = 100;

/// Wake flag: the task is being woken up (SCX_WAKE_TTWU).
pub const SCX_WAKE_TTWU: u64 = 0x8;

/// Enqueue flag: the task is being enqueued on wakeup (SCX_ENQ_WAKEUP).
pub const SCX_ENQ_WAKEUP: u64 = 0x1;

/// Process identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub i32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// CPU identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CpuId(pub u32);

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Dispatch queue identifier. Wraps u64 with kernel bit-flag conventions:
/// user-created queues have the builtin bit clear, the global and local
/// queues are builtin, and `LOCAL_ON | cpu` names a specific CPU's local
/// queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DsqId(pub u64);

impl DsqId {
    pub const FLAG_BUILTIN: u64 = 1u64 << 63;
    pub const GLOBAL: DsqId = DsqId(Self::FLAG_BUILTIN | 1);
    pub const LOCAL: DsqId = DsqId(Self::FLAG_BUILTIN | 2);
    pub const LOCAL_ON_MASK: u64 = 0xC000000000000000;
    pub const LOCAL_CPU_MASK: u64 = 0x00000000FFFFFFFF;

    /// The local queue of a specific CPU.
    pub const fn local_on(cpu: CpuId) -> DsqId {
        DsqId(Self::LOCAL_ON_MASK | cpu.0 as u64)
    }

    pub fn is_local_on(self) -> bool {
        self.0 & Self::LOCAL_ON_MASK == Self::LOCAL_ON_MASK
    }

    /// Whether this is a built-in DSQ (LOCAL, GLOBAL, or LOCAL_ON).
    /// Built-in DSQs cannot be used as priority queues.
    pub fn is_builtin(self) -> bool {
        self.0 & Self::FLAG_BUILTIN != 0
    }

    pub fn local_on_cpu(self) -> CpuId {
        CpuId((self.0 & Self::LOCAL_CPU_MASK) as u32)
    }
}

impl fmt::Display for DsqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_local_on() {
            write!(f, "local_on({})", self.local_on_cpu())
        } else if *self == Self::LOCAL {
            write!(f, "local")
        } else if *self == Self::GLOBAL {
            write!(f, "global")
        } else {
            write!(f, "{:#x}", self.0)
        }
    }
}

/// Virtual time for fair scheduling (opaque u64, not nanoseconds).
///
/// Ordering uses wrapping comparison (like the kernel's `time_before64`),
/// so `Vtime(u64::MAX)` compares as less than `Vtime(0)` when they are
/// within half the u64 range of each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Vtime(pub u64);

impl Vtime {
    /// `self` is strictly before `other`, wrap-safe.
    pub fn before(self, other: Vtime) -> bool {
        time_before(self.0, other.0)
    }
}

impl PartialOrd for Vtime {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Vtime {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Matches kernel time_before64: (s64)(a - b) < 0 means a < b.
        (self.0.wrapping_sub(other.0) as i64).cmp(&0)
    }
}

/// Kernel `time_before64()`: `a` is before `b` modulo wraparound.
pub fn time_before(a: u64, b: u64) -> bool {
    (a.wrapping_sub(b) as i64) < 0
}
