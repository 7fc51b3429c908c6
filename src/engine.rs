// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Event-driven simulation engine.
//!
//! The engine plays the kernel's part: it keeps the event queue, the
//! simulated clock and per-CPU/per-task state, and invokes the policy's
//! callbacks at the points the kernel would. Queues, idle state and the
//! clock the policy sees live in the [`LocalHost`] it shares with the
//! engine.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::Arc;

use anyhow::bail;
use anyhow::Result;
use log::debug;
use log::info;

use crate::exit_info::{ExitInfo, ScxExitKind};
use crate::host::LocalHost;
use crate::ops::{Host, SchedOps};
use crate::scenario::{Phase, Scenario, TaskBehavior, TaskDef};
use crate::simple::{ScxSimple, SimpleConfig};
use crate::task::Task;
use crate::trace::{Trace, TraceKind};
use crate::types::{CpuId, Pid, TimeNs, SCX_ENQ_WAKEUP, SCX_WAKE_TTWU};

/// A simulation event, ordered by timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Event {
    time_ns: TimeNs,
    /// Tiebreaker for events at the same time (lower = first).
    seq: u64,
    kind: EventKind,
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.time_ns
            .cmp(&other.time_ns)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EventKind {
    /// A task becomes runnable.
    TaskWake { pid: Pid },
    /// The running task's slice expires on the given CPU.
    SliceExpired { cpu: CpuId },
    /// The running task finishes its current Run phase on the given CPU.
    TaskPhaseComplete { cpu: CpuId },
}

/// The state a simulated task can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Sleeping,
    /// Queued somewhere, not executing.
    Runnable,
    Running { cpu: CpuId },
    /// Completed all its phases.
    Exited,
}

/// A simulated task: the host-side `Task` plus its script.
#[derive(Debug)]
pub struct SimTask {
    pub task: Task,
    pub name: String,
    pub behavior: TaskBehavior,
    pub phase_idx: usize,
    /// Remaining nanoseconds in the current Run phase.
    pub run_remaining_ns: TimeNs,
    pub state: TaskState,
    /// Whether `enable` has been called for this task.
    pub enabled: bool,
    /// The last CPU the task was placed on (select_cpu prev_cpu).
    pub prev_cpu: CpuId,
}

impl SimTask {
    fn new(def: &TaskDef) -> Self {
        let run_remaining_ns = match def.behavior.phases.first() {
            Some(Phase::Run(ns)) => *ns,
            _ => 0,
        };
        SimTask {
            task: Task::new(def.pid, def.weight),
            name: def.name.clone(),
            behavior: def.behavior.clone(),
            phase_idx: 0,
            run_remaining_ns,
            state: TaskState::Sleeping,
            enabled: false,
            prev_cpu: CpuId(0),
        }
    }

    pub fn current_phase(&self) -> Option<&Phase> {
        self.behavior.phases.get(self.phase_idx)
    }

    /// Advance to the next phase. Returns true if there is a next phase.
    pub fn advance_phase(&mut self) -> bool {
        self.phase_idx += 1;
        if self.phase_idx >= self.behavior.phases.len() {
            if self.behavior.repeat {
                self.phase_idx = 0;
            } else {
                return false;
            }
        }
        if let Some(Phase::Run(ns)) = self.current_phase() {
            self.run_remaining_ns = *ns;
        }
        true
    }
}

/// Per-CPU bookkeeping the engine keeps on top of the host's view.
#[derive(Debug, Default)]
struct CpuState {
    current: Option<Pid>,
    prev_task: Option<Pid>,
    /// When the current execution window started.
    started_at: TimeNs,
    /// CpuIdle already traced since the CPU last ran something.
    idle_traced: bool,
}

/// What a task does after finishing a Run phase.
enum AfterRun {
    /// Next phase is Run: keep executing with the remaining slice.
    Continue,
    /// Yielded: requeue with a zeroed slice.
    Requeue,
    Sleep(TimeNs),
    Complete,
}

/// Everything a finished simulation leaves behind.
#[derive(Debug)]
pub struct SimulationResult {
    pub trace: Trace,
    /// Final state of every task.
    pub tasks: BTreeMap<Pid, Task>,
    /// What the exit callback was given.
    pub exit: ExitInfo,
}

/// The main simulator.
pub struct Simulator<S: SchedOps> {
    sched: S,
    host: Arc<LocalHost>,
    tasks: BTreeMap<Pid, SimTask>,
    cpus: Vec<CpuState>,
    events: BinaryHeap<Reverse<Event>>,
    seq: u64,
    clock: TimeNs,
    duration_ns: TimeNs,
    trace: Trace,
    exit: Option<ExitInfo>,
}

impl Simulator<ScxSimple<LocalHost>> {
    /// Activate `scx_simple` on a fresh host sized by the scenario.
    pub fn simple(scenario: Scenario, cfg: SimpleConfig) -> Result<Self> {
        let host = Arc::new(LocalHost::new(scenario.nr_cpus).with_slice_dfl(scenario.slice_ns));
        let sched = ScxSimple::new(host.clone(), cfg);
        Self::new(sched, host, scenario)
    }
}

impl<S: SchedOps> Simulator<S> {
    /// Activate `sched` on `host` and load the scenario's tasks.
    ///
    /// Fails if the policy's init callback fails; no other callback is
    /// invoked in that case.
    pub fn new(sched: S, host: Arc<LocalHost>, scenario: Scenario) -> Result<Self> {
        if host.nr_cpu_ids() != scenario.nr_cpus {
            bail!(
                "host has {} CPUs but the scenario wants {}",
                host.nr_cpu_ids(),
                scenario.nr_cpus
            );
        }
        if host.slice_dfl() != scenario.slice_ns {
            bail!(
                "host slice {}ns does not match the scenario's {}ns",
                host.slice_dfl(),
                scenario.slice_ns
            );
        }

        let rc = sched.init();
        if rc != 0 {
            bail!("{} init failed with rc={}", sched.name(), rc);
        }
        if let Some(err) = host.error() {
            bail!("{} init failed: {}", sched.name(), err);
        }
        host.dsqs().freeze();

        let cpus = (0..scenario.nr_cpus).map(|_| CpuState::default()).collect();
        let tasks = scenario
            .tasks
            .iter()
            .map(|def| (def.pid, SimTask::new(def)))
            .collect();

        let mut sim = Simulator {
            sched,
            host,
            tasks,
            cpus,
            events: BinaryHeap::new(),
            seq: 0,
            clock: 0,
            duration_ns: scenario.duration_ns,
            trace: Trace::new(),
            exit: None,
        };
        for def in &scenario.tasks {
            sim.push_event(def.start_time_ns, EventKind::TaskWake { pid: def.pid });
        }
        Ok(sim)
    }

    pub fn sched(&self) -> &S {
        &self.sched
    }

    pub fn host(&self) -> &Arc<LocalHost> {
        &self.host
    }

    pub fn clock(&self) -> TimeNs {
        self.clock
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn task(&self, pid: Pid) -> Option<&Task> {
        self.tasks.get(&pid).map(|st| &st.task)
    }

    pub fn task_state(&self, pid: Pid) -> Option<TaskState> {
        self.tasks.get(&pid).map(|st| st.state)
    }

    /// The policy has been torn down.
    pub fn exited(&self) -> bool {
        self.exit.is_some()
    }

    fn push_event(&mut self, time_ns: TimeNs, kind: EventKind) {
        self.events.push(Reverse(Event {
            time_ns,
            seq: self.seq,
            kind,
        }));
        self.seq += 1;
    }

    /// Process every event up to `limit_ns`. Returns false once there is
    /// nothing left to simulate: the policy exited, the scenario's
    /// duration elapsed, or no events remain.
    pub fn run_until(&mut self, limit_ns: TimeNs) -> bool {
        while !self.exited() {
            let next = match self.events.peek() {
                Some(Reverse(ev)) => ev.time_ns,
                None => return false,
            };
            if next >= self.duration_ns {
                self.clock = self.duration_ns;
                return false;
            }
            if next > limit_ns {
                self.clock = self.clock.max(limit_ns);
                return true;
            }
            let Some(Reverse(event)) = self.events.pop() else {
                return false;
            };

            self.clock = event.time_ns;
            self.host.set_clock(self.clock);

            match event.kind {
                EventKind::TaskWake { pid } => self.handle_task_wake(pid),
                EventKind::SliceExpired { cpu } => self.handle_slice_expired(cpu),
                EventKind::TaskPhaseComplete { cpu } => self.handle_task_phase_complete(cpu),
            }

            if let Some(err) = self.host.error() {
                let msg = err.to_string();
                self.unregister(ExitInfo::new(ScxExitKind::ErrorBPF, msg));
            }
        }
        false
    }

    /// Tear the policy down, invoking its exit callback once.
    pub fn unregister(&mut self, ei: ExitInfo) {
        if self.exit.is_some() {
            return;
        }
        info!(
            "unregistering {}: {}{}",
            self.sched.name(),
            ei.reason,
            if ei.msg.is_empty() {
                String::new()
            } else {
                format!(" ({})", ei.msg)
            }
        );
        self.sched.exit(&ei);
        self.exit = Some(ei);
    }

    /// Run the whole scenario and unregister from "user space".
    pub fn run(mut self) -> SimulationResult {
        self.run_until(TimeNs::MAX);
        self.finish(ExitInfo::new(ScxExitKind::Unreg, ""))
    }

    /// Unregister with `ei` unless already exited, and collect the results.
    pub fn finish(mut self, ei: ExitInfo) -> SimulationResult {
        self.unregister(ei);
        let exit = self
            .exit
            .take()
            .unwrap_or_else(|| ExitInfo::new(ScxExitKind::None, ""));
        SimulationResult {
            trace: self.trace,
            tasks: self
                .tasks
                .into_iter()
                .map(|(pid, st)| (pid, st.task))
                .collect(),
            exit,
        }
    }

    /// Handle a task waking up: enable on first wake, select_cpu, and
    /// enqueue unless select_cpu placed it directly.
    fn handle_task_wake(&mut self, pid: Pid) {
        let clock = self.clock;
        let duration_ns = self.duration_ns;
        let Some(st) = self.tasks.get_mut(&pid) else {
            return;
        };
        if st.state != TaskState::Sleeping {
            return;
        }

        // Get to a Run phase. A leading Sleep defers the wakeup.
        let mut sleep_for = None;
        loop {
            match st.current_phase() {
                Some(Phase::Run(_)) => break,
                Some(Phase::Yield) => {
                    if !st.advance_phase() {
                        st.state = TaskState::Exited;
                        return;
                    }
                }
                Some(Phase::Sleep(ns)) => {
                    let ns = *ns;
                    if !st.advance_phase() {
                        st.state = TaskState::Exited;
                        return;
                    }
                    sleep_for = Some(ns);
                    break;
                }
                None => return,
            }
        }
        if let Some(ns) = sleep_for {
            let wake_at = clock.saturating_add(ns);
            if wake_at < duration_ns {
                self.push_event(wake_at, EventKind::TaskWake { pid });
            }
            return;
        }

        st.state = TaskState::Runnable;
        let prev_cpu = st.prev_cpu;
        self.trace.record(clock, prev_cpu, TraceKind::TaskWoke { pid });

        self.host.enter_cpu(prev_cpu);
        if !st.enabled {
            debug!("enable pid={} weight={}", pid, st.task.weight);
            self.sched.enable(&mut st.task);
            st.enabled = true;
        }

        let selected_cpu = self.sched.select_cpu(&mut st.task, prev_cpu, SCX_WAKE_TTWU);
        if selected_cpu.0 >= self.host.nr_cpu_ids() {
            self.host.scx_error(format!(
                "select_cpu returned invalid CPU {} for pid {}",
                selected_cpu, pid
            ));
            return;
        }
        st.prev_cpu = selected_cpu;
        let direct = self.host.local_contains(selected_cpu, pid);
        debug!(
            "select_cpu pid={} prev_cpu={} selected_cpu={} direct={}",
            pid, prev_cpu, selected_cpu, direct
        );
        self.trace.record(
            clock,
            prev_cpu,
            TraceKind::SelectCpu {
                pid,
                prev_cpu,
                selected_cpu,
                direct,
            },
        );

        if !direct {
            self.host.enter_cpu(selected_cpu);
            self.sched.enqueue(&mut st.task, SCX_ENQ_WAKEUP);
            let vtime = st.task.dsq_vtime;
            debug!("enqueue pid={} enq_flags={:#x} vtime={}", pid, SCX_ENQ_WAKEUP, vtime);
            self.trace
                .record(clock, selected_cpu, TraceKind::Enqueued { pid, vtime });
        }

        self.kick_idle_cpus();
    }

    /// Handle the running task's slice running out.
    fn handle_slice_expired(&mut self, cpu: CpuId) {
        let clock = self.clock;
        let cs = &mut self.cpus[cpu.0 as usize];
        let Some(pid) = cs.current.take() else {
            return;
        };
        cs.prev_task = Some(pid);
        let ran = clock - cs.started_at;

        let Some(st) = self.tasks.get_mut(&pid) else {
            return;
        };
        st.run_remaining_ns = st.run_remaining_ns.saturating_sub(ran);
        st.task.slice = 0;
        st.state = TaskState::Runnable;
        debug!("PREEMPTED cpu={} task={} pid={} ran_ns={}", cpu, st.name, pid, ran);

        self.host.enter_cpu(cpu);
        debug!("stopping pid={} cpu={} runnable=true", pid, cpu);
        self.sched.stopping(&mut st.task, true);
        self.sched.enqueue(&mut st.task, 0);
        let vtime = st.task.dsq_vtime;
        debug!("enqueue (re-enqueue) pid={} vtime={}", pid, vtime);

        self.trace.record(clock, cpu, TraceKind::TaskPreempted { pid });
        self.trace.record(clock, cpu, TraceKind::Enqueued { pid, vtime });

        self.try_dispatch_and_run(cpu);
        self.kick_idle_cpus();
    }

    /// Handle the running task reaching the end of its Run phase.
    fn handle_task_phase_complete(&mut self, cpu: CpuId) {
        let clock = self.clock;
        let duration_ns = self.duration_ns;
        let cs = &mut self.cpus[cpu.0 as usize];
        let Some(pid) = cs.current else {
            return;
        };
        let ran = clock - cs.started_at;

        let Some(st) = self.tasks.get_mut(&pid) else {
            return;
        };
        st.task.slice = st.task.slice.saturating_sub(ran);
        st.run_remaining_ns = 0;

        let mut yielded = false;
        let mut steps = 0;
        let after = loop {
            if steps > st.behavior.phases.len() * 2 || !st.advance_phase() {
                break AfterRun::Complete;
            }
            steps += 1;
            match st.current_phase() {
                Some(Phase::Run(_)) if yielded => break AfterRun::Requeue,
                Some(Phase::Run(_)) => break AfterRun::Continue,
                Some(Phase::Yield) => yielded = true,
                Some(Phase::Sleep(ns)) => {
                    let ns = *ns;
                    break if st.advance_phase() {
                        AfterRun::Sleep(ns)
                    } else {
                        AfterRun::Complete
                    };
                }
                None => break AfterRun::Complete,
            }
        };

        if let AfterRun::Continue = after {
            // Same execution window as far as the policy is concerned.
            let (end, kind) = Self::window_end(clock, cpu, st);
            self.cpus[cpu.0 as usize].started_at = clock;
            self.push_event(end, kind);
            return;
        }

        self.cpus[cpu.0 as usize].current = None;
        self.cpus[cpu.0 as usize].prev_task = Some(pid);
        if yielded {
            // sched_yield() zeroes the slice before stopping runs.
            st.task.slice = 0;
        }

        self.host.enter_cpu(cpu);
        let runnable = matches!(after, AfterRun::Requeue);
        debug!("stopping pid={} cpu={} runnable={}", pid, cpu, runnable);
        self.sched.stopping(&mut st.task, runnable);

        match after {
            AfterRun::Requeue => {
                st.state = TaskState::Runnable;
                self.sched.enqueue(&mut st.task, 0);
                let vtime = st.task.dsq_vtime;
                debug!("YIELDED cpu={} task={} pid={}", cpu, st.name, pid);
                self.trace.record(clock, cpu, TraceKind::TaskYielded { pid });
                self.trace.record(clock, cpu, TraceKind::Enqueued { pid, vtime });
            }
            AfterRun::Sleep(ns) => {
                st.state = TaskState::Sleeping;
                debug!("SLEEPING cpu={} task={} pid={}", cpu, st.name, pid);
                self.trace.record(clock, cpu, TraceKind::TaskSlept { pid });
                let wake_at = clock.saturating_add(ns);
                if wake_at < duration_ns {
                    self.push_event(wake_at, EventKind::TaskWake { pid });
                }
            }
            AfterRun::Complete | AfterRun::Continue => {
                st.state = TaskState::Exited;
                debug!("COMPLETED cpu={} task={} pid={}", cpu, st.name, pid);
                self.trace.record(clock, cpu, TraceKind::TaskCompleted { pid });
            }
        }

        self.try_dispatch_and_run(cpu);
        self.kick_idle_cpus();
    }

    /// When and how the execution window starting at `now` ends.
    fn window_end(now: TimeNs, cpu: CpuId, st: &SimTask) -> (TimeNs, EventKind) {
        if st.run_remaining_ns <= st.task.slice {
            (
                now + st.run_remaining_ns,
                EventKind::TaskPhaseComplete { cpu },
            )
        } else {
            (now + st.task.slice, EventKind::SliceExpired { cpu })
        }
    }

    /// Give every CPU with nothing running a chance to pick up work.
    fn kick_idle_cpus(&mut self) {
        for idx in 0..self.cpus.len() {
            if self.cpus[idx].current.is_none() {
                self.try_dispatch_and_run(CpuId(idx as u32));
            }
        }
    }

    /// If `cpu` is free, refill its local queue through dispatch when
    /// empty and start the first task on it.
    fn try_dispatch_and_run(&mut self, cpu: CpuId) {
        let clock = self.clock;
        let idx = cpu.0 as usize;
        if self.cpus[idx].current.is_some() {
            return;
        }

        self.host.enter_cpu(cpu);
        if self.host.nr_local(cpu) == 0 {
            let prev = self.cpus[idx]
                .prev_task
                .and_then(|pid| self.tasks.get(&pid))
                .map(|st| &st.task);
            self.sched.dispatch(cpu, prev);
        }

        let Some(pid) = self.host.pop_local(cpu) else {
            self.host.set_idle(cpu, true);
            if !self.cpus[idx].idle_traced {
                self.cpus[idx].idle_traced = true;
                self.trace.record(clock, cpu, TraceKind::CpuIdle);
            }
            return;
        };
        self.host.set_idle(cpu, false);

        let Some(st) = self.tasks.get_mut(&pid) else {
            self.host
                .scx_error(format!("unknown pid {} on CPU {}'s local DSQ", pid, cpu));
            return;
        };
        if st.state != TaskState::Runnable {
            self.host.scx_error(format!(
                "pid {} dispatched to CPU {} while {:?}",
                pid, cpu, st.state
            ));
            return;
        }
        st.state = TaskState::Running { cpu };
        debug!("running pid={} cpu={} vtime={}", pid, cpu, st.task.dsq_vtime);
        self.sched.running(&mut st.task);
        debug!("SCHEDULED cpu={} task={} pid={}", cpu, st.name, pid);

        let (end, kind) = Self::window_end(clock, cpu, st);
        let cs = &mut self.cpus[idx];
        cs.current = Some(pid);
        cs.started_at = clock;
        cs.idle_traced = false;
        self.trace.record(clock, cpu, TraceKind::TaskScheduled { pid });
        self.push_event(end, kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simple::ChargeMode;

    #[test]
    fn test_single_task_runs_to_completion() {
        let scenario = Scenario::builder()
            .cpus(1)
            .add_task(
                "worker",
                100,
                TaskBehavior {
                    phases: vec![Phase::Run(5_000_000)],
                    repeat: false,
                },
            )
            .duration_ms(100)
            .build();

        let result = Simulator::simple(scenario, SimpleConfig::default())
            .unwrap()
            .run();
        assert_eq!(result.trace.total_runtime(Pid(1)), 5_000_000);
        assert_eq!(result.trace.schedule_count(Pid(1)), 1);
        // Placed directly on the idle CPU, never through enqueue.
        assert_eq!(result.trace.enqueue_count(), 0);
        assert_eq!(result.exit.kind, ScxExitKind::Unreg);
    }

    #[test]
    fn test_run_phases_continue_without_stopping() {
        let scenario = Scenario::builder()
            .cpus(1)
            .add_task(
                "chain",
                100,
                TaskBehavior {
                    phases: vec![Phase::Run(3_000_000), Phase::Run(4_000_000)],
                    repeat: false,
                },
            )
            .build();
        let cfg = SimpleConfig {
            fifo_sched: false,
            charge: ChargeMode::Slice,
        };
        let result = Simulator::simple(scenario, cfg).unwrap().run();
        assert_eq!(result.trace.schedule_count(Pid(1)), 1);
        assert_eq!(result.trace.total_runtime(Pid(1)), 7_000_000);
        // One stop after 7ms of a 20ms slice.
        assert_eq!(result.tasks[&Pid(1)].dsq_vtime, 7_000_000);
    }

    #[test]
    fn test_run_until_is_incremental() {
        let scenario = Scenario::builder()
            .cpus(1)
            .add_task("a", 100, TaskBehavior::cpu_hog())
            .duration_ms(100)
            .build();
        let mut sim = Simulator::simple(scenario, SimpleConfig::default()).unwrap();
        assert!(sim.host().dsqs().is_frozen());
        assert_eq!(sim.task_state(Pid(1)), Some(TaskState::Sleeping));
        assert!(sim.run_until(30_000_000));
        assert_eq!(sim.trace().schedule_count(Pid(1)), 2);
        // Requeued once when its first slice ran out at 20ms.
        assert_eq!(sim.trace().enqueue_count(), 1);
        assert_eq!(
            sim.task_state(Pid(1)),
            Some(TaskState::Running { cpu: CpuId(0) })
        );
        assert_eq!(sim.task_state(Pid(9)), None);
        assert!(!sim.run_until(TimeNs::MAX));
        assert!(!sim.exited());
        let result = sim.finish(ExitInfo::new(ScxExitKind::Unreg, ""));
        assert_eq!(result.trace.schedule_count(Pid(1)), 5);
    }
}
