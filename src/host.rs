// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! In-process host runtime.
//!
//! [`LocalHost`] provides everything a policy consumes through [`Host`]:
//! per-CPU local queues and idle state, user DSQs, the default slice and a
//! clock. It is safe to drive from many threads at once; each thread
//! declares which CPU it is acting as with [`LocalHost::enter_cpu`].
//!
//! Contract violations a policy can commit (mixing FIFO and vtime
//! insertion, unknown queues, out-of-range CPUs) are recorded as a
//! runtime error instead of panicking, like `scx_bpf_error()`. The driver
//! checks [`LocalHost::error`] and tears the policy down.

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};

use log::debug;
use log::warn;

use crate::dsq::DsqRegistry;
use crate::ops::Host;
use crate::task::Task;
use crate::types::{CpuId, DsqId, Pid, TimeNs, Vtime, SLICE_DFL_NS};

thread_local! {
    static CURRENT_CPU: Cell<u32> = const { Cell::new(0) };
}

/// One CPU as the host sees it.
#[derive(Debug)]
pub struct HostCpu {
    pub id: CpuId,
    /// The CPU's local dispatch queue (always FIFO).
    local_dsq: Mutex<VecDeque<Pid>>,
    idle: AtomicBool,
}

impl HostCpu {
    fn new(id: CpuId) -> Self {
        HostCpu {
            id,
            local_dsq: Mutex::new(VecDeque::new()),
            idle: AtomicBool::new(true),
        }
    }

    fn local(&self) -> MutexGuard<'_, VecDeque<Pid>> {
        self.local_dsq.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Acquire)
    }

    /// Atomically claim the CPU if it is idle
    /// (scx_bpf_test_and_clear_cpu_idle).
    fn test_and_clear_idle(&self) -> bool {
        self.idle
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[derive(Debug)]
pub struct LocalHost {
    cpus: Vec<HostCpu>,
    dsqs: DsqRegistry,
    slice_dfl: TimeNs,
    clock: AtomicU64,
    error: OnceLock<String>,
}

impl LocalHost {
    /// A host with `nr_cpus` idle CPUs and the default 20ms slice.
    pub fn new(nr_cpus: u32) -> Self {
        assert!(nr_cpus > 0, "host must have at least one CPU");
        let dsqs = DsqRegistry::new();
        // A fresh registry cannot refuse its first queue.
        let _ = dsqs.create(DsqId::GLOBAL);
        LocalHost {
            cpus: (0..nr_cpus).map(|i| HostCpu::new(CpuId(i))).collect(),
            dsqs,
            slice_dfl: SLICE_DFL_NS,
            clock: AtomicU64::new(0),
            error: OnceLock::new(),
        }
    }

    pub fn with_slice_dfl(mut self, slice_ns: TimeNs) -> Self {
        self.slice_dfl = slice_ns;
        self
    }

    /// Act as `cpu` on the calling thread until the next call.
    pub fn enter_cpu(&self, cpu: CpuId) {
        CURRENT_CPU.with(|c| c.set(cpu.0));
    }

    pub fn set_clock(&self, now: TimeNs) {
        self.clock.store(now, Ordering::Relaxed);
    }

    pub fn cpu(&self, cpu: CpuId) -> Option<&HostCpu> {
        self.cpus.get(cpu.0 as usize)
    }

    pub fn cpus(&self) -> &[HostCpu] {
        &self.cpus
    }

    /// Mark `cpu` idle or busy. The driver owns this state.
    pub fn set_idle(&self, cpu: CpuId, idle: bool) {
        if let Some(c) = self.cpu(cpu) {
            c.idle.store(idle, Ordering::Release);
        }
    }

    pub fn is_idle(&self, cpu: CpuId) -> bool {
        self.cpu(cpu).is_some_and(|c| c.is_idle())
    }

    /// Take the next task from `cpu`'s local queue.
    pub fn pop_local(&self, cpu: CpuId) -> Option<Pid> {
        self.cpu(cpu)?.local().pop_front()
    }

    pub fn nr_local(&self, cpu: CpuId) -> usize {
        self.cpu(cpu).map_or(0, |c| c.local().len())
    }

    pub fn local_pids(&self, cpu: CpuId) -> Vec<Pid> {
        self.cpu(cpu)
            .map_or_else(Vec::new, |c| c.local().iter().copied().collect())
    }

    pub fn local_contains(&self, cpu: CpuId, pid: Pid) -> bool {
        self.cpu(cpu).is_some_and(|c| c.local().contains(&pid))
    }

    pub fn dsqs(&self) -> &DsqRegistry {
        &self.dsqs
    }

    /// First runtime error reported, if any.
    pub fn error(&self) -> Option<&str> {
        self.error.get().map(String::as_str)
    }

    /// Report a policy error (scx_bpf_error). Only the first one sticks.
    pub fn scx_error(&self, msg: String) {
        warn!("scx_bpf_error: {}", msg);
        let _ = self.error.set(msg);
    }

    /// Resolve LOCAL / LOCAL_ON ids to a CPU. None for other queues.
    fn local_target(&self, dsq_id: DsqId) -> Option<CpuId> {
        if dsq_id == DsqId::LOCAL {
            Some(self.smp_processor_id())
        } else if dsq_id.is_local_on() {
            Some(dsq_id.local_on_cpu())
        } else {
            None
        }
    }

    fn push_local(&self, cpu: CpuId, pid: Pid) {
        match self.cpu(cpu) {
            Some(c) => c.local().push_back(pid),
            None => self.scx_error(format!("invalid CPU {} for local DSQ", cpu)),
        }
    }
}

impl Host for LocalHost {
    fn nr_cpu_ids(&self) -> u32 {
        self.cpus.len() as u32
    }

    fn smp_processor_id(&self) -> CpuId {
        CpuId(CURRENT_CPU.with(|c| c.get()))
    }

    fn now(&self) -> TimeNs {
        self.clock.load(Ordering::Relaxed)
    }

    fn slice_dfl(&self) -> TimeNs {
        self.slice_dfl
    }

    fn select_cpu_dfl(&self, _p: &Task, prev_cpu: CpuId, _wake_flags: u64) -> (CpuId, bool) {
        // Prefer prev_cpu if it's idle.
        if let Some(prev) = self.cpu(prev_cpu) {
            if prev.test_and_clear_idle() {
                return (prev_cpu, true);
            }
        }
        // Otherwise any idle CPU with nothing queued locally.
        for cpu in &self.cpus {
            if cpu.is_idle() && cpu.local().is_empty() && cpu.test_and_clear_idle() {
                return (cpu.id, true);
            }
        }
        let fallback = if (prev_cpu.0 as usize) < self.cpus.len() {
            prev_cpu
        } else {
            CpuId(0)
        };
        (fallback, false)
    }

    fn create_dsq(&self, dsq_id: DsqId, _node: i32) -> i32 {
        if dsq_id.is_builtin() {
            return -libc::EINVAL;
        }
        if let Err(errno) = self.dsqs.create(dsq_id) {
            return errno;
        }
        debug!("create_dsq: {}", dsq_id);
        0
    }

    fn dsq_insert(&self, p: &mut Task, dsq_id: DsqId, slice: TimeNs, _enq_flags: u64) {
        p.slice = slice;
        if let Some(cpu) = self.local_target(dsq_id) {
            self.push_local(cpu, p.pid);
            return;
        }
        match self.dsqs.with(dsq_id, |dsq| dsq.insert_fifo(p.pid)) {
            Some(Ok(())) => {}
            Some(Err(e)) => self.scx_error(format!("DSQ {}: {}", dsq_id, e)),
            None => self.scx_error(format!("non-existent DSQ {}", dsq_id)),
        }
    }

    fn dsq_insert_vtime(
        &self,
        p: &mut Task,
        dsq_id: DsqId,
        slice: TimeNs,
        vtime: u64,
        _enq_flags: u64,
    ) {
        if dsq_id.is_builtin() {
            self.scx_error(format!("cannot use vtime ordering for built-in DSQ {}", dsq_id));
            return;
        }
        p.slice = slice;
        p.dsq_vtime = vtime;
        match self.dsqs.with(dsq_id, |dsq| dsq.insert_vtime(p.pid, Vtime(vtime))) {
            Some(Ok(())) => {}
            Some(Err(e)) => self.scx_error(format!("DSQ {}: {}", dsq_id, e)),
            None => self.scx_error(format!("non-existent DSQ {}", dsq_id)),
        }
    }

    fn dsq_move_to_local(&self, dsq_id: DsqId, cpu: CpuId) -> bool {
        if self.cpu(cpu).is_none() {
            self.scx_error(format!("invalid CPU {} for local DSQ", cpu));
            return false;
        }
        // Hold the source lock across the move so a task is never visible
        // in neither or both queues.
        let moved = self.dsqs.with(dsq_id, |dsq| match dsq.pop() {
            Some(pid) => {
                self.push_local(cpu, pid);
                true
            }
            None => false,
        });
        match moved {
            Some(moved) => moved,
            None => {
                self.scx_error(format!("non-existent DSQ {}", dsq_id));
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_cpu_dfl_prefers_prev_if_idle() {
        let host = LocalHost::new(4);
        let p = Task::new(Pid(1), 100);
        assert_eq!(host.select_cpu_dfl(&p, CpuId(2), 0), (CpuId(2), true));
        // CPU 2 is claimed now; the next waker gets another idle CPU.
        assert_eq!(host.select_cpu_dfl(&p, CpuId(2), 0), (CpuId(0), true));
    }

    #[test]
    fn test_select_cpu_dfl_no_idle_falls_back_to_prev() {
        let host = LocalHost::new(2);
        host.set_idle(CpuId(0), false);
        host.set_idle(CpuId(1), false);
        let p = Task::new(Pid(1), 100);
        assert_eq!(host.select_cpu_dfl(&p, CpuId(1), 0), (CpuId(1), false));
        assert_eq!(host.select_cpu_dfl(&p, CpuId(9), 0), (CpuId(0), false));
    }

    #[test]
    fn test_create_dsq_errors() {
        let host = LocalHost::new(1);
        assert_eq!(host.create_dsq(DsqId(0), -1), 0);
        assert_eq!(host.create_dsq(DsqId(0), -1), -libc::EEXIST);
        assert_eq!(host.create_dsq(DsqId::GLOBAL, -1), -libc::EINVAL);

        // Queues cannot appear once tasks have started flowing.
        host.dsq_insert(&mut Task::new(Pid(1), 100), DsqId(0), 1, 0);
        assert_eq!(host.create_dsq(DsqId(1), -1), -libc::EBUSY);
        assert!(host.error().is_none());
    }

    #[test]
    fn test_insert_sets_slice_and_vtime() {
        let host = LocalHost::new(1);
        host.create_dsq(DsqId(0), -1);
        let mut p = Task::new(Pid(1), 100);
        host.dsq_insert_vtime(&mut p, DsqId(0), 5_000, 42, 0);
        assert_eq!(p.slice, 5_000);
        assert_eq!(p.dsq_vtime, 42);
        assert_eq!(host.dsqs().ordered_pids(DsqId(0)), vec![Pid(1)]);
        assert!(host.error().is_none());
    }

    #[test]
    fn test_contract_violations_become_errors() {
        let host = LocalHost::new(1);
        let mut p = Task::new(Pid(1), 100);
        host.dsq_insert_vtime(&mut p, DsqId::GLOBAL, 1, 1, 0);
        assert!(host.error().unwrap().contains("built-in"));

        let host = LocalHost::new(1);
        host.dsq_insert(&mut p, DsqId(7), 1, 0);
        assert!(host.error().unwrap().contains("non-existent"));

        let host = LocalHost::new(1);
        host.create_dsq(DsqId(0), -1);
        host.dsq_insert(&mut p, DsqId(0), 1, 0);
        host.dsq_insert_vtime(&mut Task::new(Pid(2), 100), DsqId(0), 1, 1, 0);
        assert!(host.error().unwrap().contains("FIFO DSQ"));
    }

    #[test]
    fn test_move_to_local() {
        let host = LocalHost::new(2);
        host.create_dsq(DsqId(0), -1);
        for i in 1..=2 {
            host.dsq_insert(&mut Task::new(Pid(i), 100), DsqId(0), 1, 0);
        }
        assert!(host.dsq_move_to_local(DsqId(0), CpuId(1)));
        assert_eq!(host.local_pids(CpuId(1)), vec![Pid(1)]);
        assert_eq!(host.dsqs().nr_queued(DsqId(0)), 1);
        assert!(host.dsq_move_to_local(DsqId(0), CpuId(1)));
        assert!(!host.dsq_move_to_local(DsqId(0), CpuId(1)));
        assert_eq!(host.pop_local(CpuId(1)), Some(Pid(1)));
        assert_eq!(host.pop_local(CpuId(1)), Some(Pid(2)));
        assert!(host.error().is_none());
    }
}
