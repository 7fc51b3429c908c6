// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The two seams between a scheduling policy and the runtime hosting it.
//!
//! [`SchedOps`] is what a policy exposes: one method per sched_ext_ops
//! callback, invoked by the host at the matching scheduling event,
//! possibly on every CPU at once. [`Host`] is what a policy consumes: the
//! kfunc surface (idle CPU search, dispatch queues, clock).

use crate::exit_info::ExitInfo;
use crate::task::Task;
use crate::types::{CpuId, DsqId, TimeNs};

/// Scheduling policy callbacks.
///
/// Every method runs to completion without blocking. Only `init` can fail;
/// all other callbacks are infallible for well-formed input.
pub trait SchedOps: Send + Sync {
    /// Policy name, as reported to the host (ops.name).
    fn name(&self) -> &'static str;

    /// Activate the policy (ops.init). Returns 0 or a negative errno.
    fn init(&self) -> i32;

    /// Pick a CPU for a waking task (ops.select_cpu).
    fn select_cpu(&self, p: &mut Task, prev_cpu: CpuId, wake_flags: u64) -> CpuId;

    /// Queue a task that was not placed by `select_cpu` (ops.enqueue).
    fn enqueue(&self, p: &mut Task, enq_flags: u64);

    /// `cpu` ran out of local work (ops.dispatch). `prev` is the task that
    /// was running before, if any.
    fn dispatch(&self, cpu: CpuId, prev: Option<&Task>);

    /// A task started executing (ops.running).
    fn running(&self, p: &mut Task);

    /// A task stopped executing (ops.stopping).
    fn stopping(&self, p: &mut Task, runnable: bool);

    /// A task became eligible to run under this policy (ops.enable).
    fn enable(&self, p: &mut Task);

    /// The policy is being deactivated (ops.exit).
    fn exit(&self, ei: &ExitInfo);
}

/// Runtime services a policy calls into.
///
/// Implementations must be safe to call from every CPU concurrently.
pub trait Host: Send + Sync {
    /// Number of possible CPU ids.
    fn nr_cpu_ids(&self) -> u32;

    /// CPU the caller is currently running on.
    fn smp_processor_id(&self) -> CpuId;

    /// Monotonic host clock.
    fn now(&self) -> TimeNs;

    /// The default time slice (SCX_SLICE_DFL).
    fn slice_dfl(&self) -> TimeNs;

    /// Default idle CPU search. Returns the chosen CPU and whether it was
    /// idle (and has been claimed for the caller).
    fn select_cpu_dfl(&self, p: &Task, prev_cpu: CpuId, wake_flags: u64) -> (CpuId, bool);

    /// Create a user dispatch queue. Returns 0 or a negative errno.
    fn create_dsq(&self, dsq_id: DsqId, node: i32) -> i32;

    /// Insert `p` at the tail of `dsq_id` and grant it `slice`.
    fn dsq_insert(&self, p: &mut Task, dsq_id: DsqId, slice: TimeNs, enq_flags: u64);

    /// Insert `p` into `dsq_id` ordered by `vtime` and grant it `slice`.
    /// `vtime` becomes the task's `dsq_vtime`.
    fn dsq_insert_vtime(
        &self,
        p: &mut Task,
        dsq_id: DsqId,
        slice: TimeNs,
        vtime: u64,
        enq_flags: u64,
    );

    /// Move the first task of `dsq_id` to `cpu`'s local queue. Returns
    /// whether a task was moved.
    fn dsq_move_to_local(&self, dsq_id: DsqId, cpu: CpuId) -> bool;
}
