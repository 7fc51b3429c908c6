// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-CPU replicated event counters (a PERCPU_ARRAY map of u64).
//!
//! Each CPU only increments its own slot, so writers never share a cache
//! line. Readers sum the slots themselves.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;

use crate::types::CpuId;

/// Counter indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum StatIdx {
    /// Tasks placed directly on an idle CPU's local queue.
    Local = 0,
    /// Tasks queued on the shared queue.
    Global = 1,
}

pub const NR_STATS: usize = 2;

#[derive(Debug)]
pub struct PerCpuStats {
    slots: Vec<CachePadded<[AtomicU64; NR_STATS]>>,
}

impl PerCpuStats {
    pub fn new(nr_cpus: u32) -> Self {
        let slots = (0..nr_cpus)
            .map(|_| CachePadded::new([AtomicU64::new(0), AtomicU64::new(0)]))
            .collect();
        Self { slots }
    }

    pub fn nr_cpus(&self) -> usize {
        self.slots.len()
    }

    /// Bump counter `idx` on `cpu`. Out-of-range CPUs are ignored, like a
    /// failed map lookup.
    pub fn inc(&self, cpu: CpuId, idx: StatIdx) {
        if let Some(slot) = self.slots.get(cpu.0 as usize) {
            slot[idx as usize].fetch_add(1, Ordering::Relaxed);
        }
    }

    /// One CPU's replica.
    pub fn read_cpu(&self, cpu: CpuId) -> [u64; NR_STATS] {
        match self.slots.get(cpu.0 as usize) {
            Some(slot) => [
                slot[0].load(Ordering::Relaxed),
                slot[1].load(Ordering::Relaxed),
            ],
            None => [0; NR_STATS],
        }
    }

    /// Every CPU's replica, indexed by CPU id.
    pub fn read_all(&self) -> Vec<[u64; NR_STATS]> {
        (0..self.slots.len() as u32)
            .map(|cpu| self.read_cpu(CpuId(cpu)))
            .collect()
    }
}
