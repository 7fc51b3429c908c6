// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! A simple scheduler.
//!
//! By default, it operates as a simple global weighted vtime scheduler and
//! can be switched to FIFO scheduling. It also keeps per-CPU counters of
//! how many tasks went to local and to the shared queue, and records why
//! it was torn down for userspace.
//!
//! All CPUs consume from one shared queue, so whatever is at the front is
//! likely to run soon given enough CPUs even though nothing is preempted.
//! This works reasonably well on CPUs with a uniform L3 cache topology.
//! FIFO mode may suit some workloads but comes with the usual problem of
//! saturating threads drowning out interactive ones.

use std::sync::Arc;

use log::debug;
use log::info;

use crate::exit_info::{ExitInfo, ExitRecord, UserExitInfo};
use crate::ops::{Host, SchedOps};
use crate::percpu::{PerCpuStats, StatIdx};
use crate::task::Task;
use crate::types::{time_before, CpuId, DsqId, TimeNs, WEIGHT_DFL};
use crate::vtime::GlobalVtime;

/// Built-in DSQs such as [`DsqId::GLOBAL`] cannot be used as priority
/// queues, so both modes dispatch to and consume from a user DSQ with ID 0.
pub const SHARED_DSQ: DsqId = DsqId(0);

/// Longest default slice whose full-slice charge at the default weight
/// still fits in a u64.
pub const MAX_SLICE_NS: TimeNs = u64::MAX / WEIGHT_DFL as u64;

/// How the stopping hook measures the execution time it charges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChargeMode {
    /// Charge `slice_dfl - remaining slice`. A task that yields has its
    /// slice zeroed by the host and is charged the whole slice.
    #[default]
    Slice,
    /// Charge the time between the running and stopping hooks, read from
    /// the host clock.
    Timestamp,
}

/// Activation-time configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SimpleConfig {
    /// Order the shared queue FIFO instead of by weighted vtime.
    pub fifo_sched: bool,
    pub charge: ChargeMode,
}

/// The policy state. Shared by reference between every CPU.
pub struct ScxSimple<H: Host> {
    host: Arc<H>,
    cfg: SimpleConfig,
    vtime_now: GlobalVtime,
    stats: PerCpuStats,
    uei: ExitRecord,
}

impl<H: Host> ScxSimple<H> {
    pub fn new(host: Arc<H>, cfg: SimpleConfig) -> Self {
        let stats = PerCpuStats::new(host.nr_cpu_ids());
        Self {
            host,
            cfg,
            vtime_now: GlobalVtime::new(),
            stats,
            uei: ExitRecord::new(),
        }
    }

    pub fn config(&self) -> SimpleConfig {
        self.cfg
    }

    pub fn host(&self) -> &Arc<H> {
        &self.host
    }

    /// Current global virtual time.
    pub fn vtime_now(&self) -> u64 {
        self.vtime_now.now()
    }

    /// The per-CPU `[local, global]` counters.
    pub fn stats(&self) -> &PerCpuStats {
        &self.stats
    }

    pub fn exited(&self) -> bool {
        self.uei.exited()
    }

    pub fn exit_record(&self) -> &ExitRecord {
        &self.uei
    }

    /// The exit record, if the exit hook has run.
    pub fn uei(&self) -> Option<&UserExitInfo> {
        self.uei.read()
    }

    fn stat_inc(&self, idx: StatIdx) {
        self.stats.inc(self.host.smp_processor_id(), idx);
    }

    /// Execution time to charge for the window that is ending.
    fn consumed(&self, p: &Task) -> u64 {
        match self.cfg.charge {
            ChargeMode::Slice => self.host.slice_dfl().saturating_sub(p.slice),
            ChargeMode::Timestamp => self.host.now().saturating_sub(p.exec_start),
        }
    }
}

impl<H: Host> SchedOps for ScxSimple<H> {
    fn name(&self) -> &'static str {
        "simple"
    }

    fn init(&self) -> i32 {
        let ret = self.host.create_dsq(SHARED_DSQ, -1);
        if ret == 0 {
            info!(
                "simple: activated ({} mode, charge by {:?})",
                if self.cfg.fifo_sched { "FIFO" } else { "weighted vtime" },
                self.cfg.charge
            );
        }
        ret
    }

    fn select_cpu(&self, p: &mut Task, prev_cpu: CpuId, wake_flags: u64) -> CpuId {
        let (cpu, is_idle) = self.host.select_cpu_dfl(p, prev_cpu, wake_flags);
        if is_idle {
            self.stat_inc(StatIdx::Local);
            self.host
                .dsq_insert(p, DsqId::local_on(cpu), self.host.slice_dfl(), 0);
        }
        cpu
    }

    fn enqueue(&self, p: &mut Task, enq_flags: u64) {
        self.stat_inc(StatIdx::Global);

        let slice_dfl = self.host.slice_dfl();
        if self.cfg.fifo_sched {
            self.host.dsq_insert(p, SHARED_DSQ, slice_dfl, enq_flags);
        } else {
            let mut vtime = p.dsq_vtime;

            // Limit the amount of budget that an idling task can accumulate
            // to one slice.
            let floor = self.vtime_now.now().wrapping_sub(slice_dfl);
            if time_before(vtime, floor) {
                vtime = floor;
            }

            self.host
                .dsq_insert_vtime(p, SHARED_DSQ, slice_dfl, vtime, enq_flags);
        }
    }

    fn dispatch(&self, cpu: CpuId, _prev: Option<&Task>) {
        self.host.dsq_move_to_local(SHARED_DSQ, cpu);
    }

    fn running(&self, p: &mut Task) {
        if self.cfg.charge == ChargeMode::Timestamp {
            p.exec_start = self.host.now();
        }
        if self.cfg.fifo_sched {
            return;
        }

        // Global vtime always progresses forward as tasks start executing.
        // Racing CPUs may briefly leave it behind; the next running task
        // catches it up.
        self.vtime_now.advance(p.dsq_vtime);
    }

    fn stopping(&self, p: &mut Task, _runnable: bool) {
        if self.cfg.fifo_sched {
            return;
        }

        // Scale the execution time by the inverse of the weight and charge.
        let charge =
            self.consumed(p) as u128 * WEIGHT_DFL as u128 / p.effective_weight() as u128;
        p.dsq_vtime = p
            .dsq_vtime
            .wrapping_add(u64::try_from(charge).unwrap_or(u64::MAX));
    }

    fn enable(&self, p: &mut Task) {
        p.dsq_vtime = self.vtime_now.now();
    }

    fn exit(&self, ei: &ExitInfo) {
        if !self.uei.record(ei) {
            debug!("simple: exit already recorded, ignoring {:?}", ei.kind);
        }
    }
}
