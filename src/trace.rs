// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Trace event recording for the simulator.
//!
//! Every scheduling action (task woke, placed, scheduled, preempted,
//! yielded, slept, CPU idle) is recorded as a `TraceEvent` with a
//! simulated timestamp and CPU ID.

use crate::types::{CpuId, Pid, TimeNs};

/// A single trace event produced by the simulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    /// Simulated time in nanoseconds when this event occurred.
    pub time_ns: TimeNs,
    /// The CPU on which this event occurred.
    pub cpu: CpuId,
    pub kind: TraceKind,
}

/// The type of scheduling event recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceKind {
    /// A task woke up.
    TaskWoke { pid: Pid },
    /// select_cpu picked a CPU. `direct` is set when the task was placed
    /// straight onto that CPU's local queue.
    SelectCpu {
        pid: Pid,
        prev_cpu: CpuId,
        selected_cpu: CpuId,
        direct: bool,
    },
    /// A task went through enqueue. `vtime` is its dsq_vtime afterwards.
    Enqueued { pid: Pid, vtime: u64 },
    /// A task was scheduled to run on this CPU.
    TaskScheduled { pid: Pid },
    /// A task's slice expired on this CPU.
    TaskPreempted { pid: Pid },
    /// A task gave up the CPU voluntarily and was requeued.
    TaskYielded { pid: Pid },
    /// A task went to sleep on this CPU.
    TaskSlept { pid: Pid },
    /// A task completed all its phases.
    TaskCompleted { pid: Pid },
    /// The CPU became idle (no tasks to run).
    CpuIdle,
}

/// A complete simulation trace, containing all events in chronological order.
#[derive(Debug, Clone, Default)]
pub struct Trace {
    events: Vec<TraceEvent>,
}

impl Trace {
    pub(crate) fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub(crate) fn record(&mut self, time_ns: TimeNs, cpu: CpuId, kind: TraceKind) {
        self.events.push(TraceEvent { time_ns, cpu, kind });
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// Total runtime (nanoseconds) for a given task PID.
    ///
    /// Sums the intervals between `TaskScheduled` and the next
    /// `TaskPreempted`/`TaskYielded`/`TaskSlept`/`TaskCompleted` for that
    /// PID. A task still running at the end of the trace contributes
    /// nothing for its last interval.
    pub fn total_runtime(&self, pid: Pid) -> TimeNs {
        let mut total: TimeNs = 0;
        let mut running_since: Option<TimeNs> = None;

        for event in &self.events {
            match &event.kind {
                TraceKind::TaskScheduled { pid: p } if *p == pid => {
                    running_since = Some(event.time_ns);
                }
                TraceKind::TaskPreempted { pid: p }
                | TraceKind::TaskYielded { pid: p }
                | TraceKind::TaskSlept { pid: p }
                | TraceKind::TaskCompleted { pid: p }
                    if *p == pid =>
                {
                    if let Some(start) = running_since.take() {
                        total += event.time_ns - start;
                    }
                }
                _ => {}
            }
        }

        total
    }

    /// Count the number of times a task was scheduled.
    pub fn schedule_count(&self, pid: Pid) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e.kind, TraceKind::TaskScheduled { pid: p } if p == pid))
            .count()
    }

    /// PIDs in the order they were scheduled, across all CPUs.
    pub fn schedule_order(&self) -> Vec<Pid> {
        self.events
            .iter()
            .filter_map(|e| match e.kind {
                TraceKind::TaskScheduled { pid } => Some(pid),
                _ => None,
            })
            .collect()
    }

    /// Count the number of times a CPU went idle.
    pub fn idle_count(&self, cpu: CpuId) -> usize {
        self.events
            .iter()
            .filter(|e| e.cpu == cpu && matches!(e.kind, TraceKind::CpuIdle))
            .count()
    }

    /// Number of wakeups placed directly on an idle CPU.
    pub fn direct_count(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e.kind, TraceKind::SelectCpu { direct: true, .. }))
            .count()
    }

    /// Number of enqueue calls.
    pub fn enqueue_count(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e.kind, TraceKind::Enqueued { .. }))
            .count()
    }

    /// Pretty-print the trace for debugging.
    pub fn dump(&self) {
        for event in &self.events {
            let desc = match &event.kind {
                TraceKind::TaskWoke { pid } => format!("WAKE     pid={}", pid),
                TraceKind::SelectCpu {
                    pid,
                    prev_cpu,
                    selected_cpu,
                    direct,
                } => format!(
                    "SELECT   pid={} prev={} cpu={}{}",
                    pid,
                    prev_cpu,
                    selected_cpu,
                    if *direct { " (direct)" } else { "" }
                ),
                TraceKind::Enqueued { pid, vtime } => {
                    format!("ENQUEUE  pid={} vtime={}", pid, vtime)
                }
                TraceKind::TaskScheduled { pid } => format!("SCHED    pid={}", pid),
                TraceKind::TaskPreempted { pid } => format!("PREEMPT  pid={}", pid),
                TraceKind::TaskYielded { pid } => format!("YIELD    pid={}", pid),
                TraceKind::TaskSlept { pid } => format!("SLEEP    pid={}", pid),
                TraceKind::TaskCompleted { pid } => format!("COMPLETE pid={}", pid),
                TraceKind::CpuIdle => "IDLE".to_string(),
            };
            eprintln!(
                "[{:>12} ns] cpu={:<3} {}",
                event.time_ns, event.cpu.0, desc
            );
        }
    }
}
