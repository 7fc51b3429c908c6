// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The per-task scheduling state the host runtime hands to the policy.

use crate::types::{Pid, TimeNs, Weight, WEIGHT_DFL};

/// A schedulable task, owned by the host runtime.
///
/// Hooks receive `&mut Task`: a task never runs on two CPUs at once, so
/// the host can lend it exclusively to whichever CPU is acting on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub pid: Pid,
    /// Scheduling weight. Hosts must never set this to zero; the policy
    /// still clamps it to 1 before dividing.
    pub weight: Weight,
    /// Virtual time (p->scx.dsq_vtime). Set on enable, on vtime
    /// insertion and on stop. Never decreases once enabled.
    pub dsq_vtime: u64,
    /// Remaining time slice (p->scx.slice). Set by the host on insertion,
    /// consumed as the task runs, zeroed on yield.
    pub slice: TimeNs,
    /// Start of the current execution window, stored by the policy when
    /// charging by timestamps.
    pub exec_start: TimeNs,
}

impl Task {
    pub fn new(pid: Pid, weight: Weight) -> Self {
        Task {
            pid,
            weight,
            dsq_vtime: 0,
            slice: 0,
            exec_start: 0,
        }
    }

    /// Weight with the zero guard applied.
    pub fn effective_weight(&self) -> u64 {
        self.weight.max(1) as u64
    }
}

impl Default for Task {
    fn default() -> Self {
        Task::new(Pid(0), WEIGHT_DFL)
    }
}
