// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Scenario definition and builder API.

use crate::types::{Pid, TimeNs, Weight, SLICE_DFL_NS};

/// A step in a task's scripted behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    /// Consume CPU for the given number of nanoseconds.
    Run(TimeNs),
    /// Block for the given number of nanoseconds.
    Sleep(TimeNs),
    /// Give up the CPU and go back to the queue (sched_yield). The host
    /// zeroes the remaining slice before the stopping hook runs.
    Yield,
}

/// The scripted behavior for a task: a sequence of phases, optionally
/// repeating.
#[derive(Debug, Clone)]
pub struct TaskBehavior {
    pub phases: Vec<Phase>,
    pub repeat: bool,
}

impl TaskBehavior {
    /// Run forever.
    pub fn cpu_hog() -> Self {
        TaskBehavior {
            phases: vec![Phase::Run(100_000_000)],
            repeat: true,
        }
    }
}

/// Definition of a task for scenario creation.
#[derive(Debug, Clone)]
pub struct TaskDef {
    pub name: String,
    pub pid: Pid,
    pub weight: Weight,
    pub behavior: TaskBehavior,
    /// When the task first becomes runnable (simulated ns).
    pub start_time_ns: TimeNs,
}

/// A complete simulation scenario: CPUs, slice, tasks, and duration.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub nr_cpus: u32,
    pub slice_ns: TimeNs,
    pub tasks: Vec<TaskDef>,
    pub duration_ns: TimeNs,
}

pub struct ScenarioBuilder {
    nr_cpus: u32,
    slice_ns: TimeNs,
    tasks: Vec<TaskDef>,
    duration_ns: TimeNs,
    next_pid: Pid,
}

impl Scenario {
    pub fn builder() -> ScenarioBuilder {
        ScenarioBuilder {
            nr_cpus: 1,
            slice_ns: SLICE_DFL_NS,
            tasks: Vec::new(),
            duration_ns: 100_000_000, // 100ms default
            next_pid: Pid(1),
        }
    }
}

impl ScenarioBuilder {
    pub fn cpus(mut self, n: u32) -> Self {
        self.nr_cpus = n;
        self
    }

    /// Override the host's default time slice.
    pub fn slice_ns(mut self, ns: TimeNs) -> Self {
        self.slice_ns = ns;
        self
    }

    pub fn task(mut self, def: TaskDef) -> Self {
        if def.pid.0 >= self.next_pid.0 {
            self.next_pid = Pid(def.pid.0 + 1);
        }
        self.tasks.push(def);
        self
    }

    /// Convenience: add a task with auto-assigned PID, runnable at t=0.
    pub fn add_task(mut self, name: &str, weight: Weight, behavior: TaskBehavior) -> Self {
        let pid = self.next_pid;
        self.next_pid = Pid(pid.0 + 1);
        self.tasks.push(TaskDef {
            name: name.to_string(),
            pid,
            weight,
            behavior,
            start_time_ns: 0,
        });
        self
    }

    pub fn duration_ns(mut self, ns: TimeNs) -> Self {
        self.duration_ns = ns;
        self
    }

    pub fn duration_ms(mut self, ms: u64) -> Self {
        self.duration_ns = ms * 1_000_000;
        self
    }

    pub fn build(self) -> Scenario {
        assert!(
            !self.tasks.is_empty(),
            "scenario must have at least one task"
        );
        assert!(self.nr_cpus > 0, "scenario must have at least one CPU");
        assert!(self.slice_ns > 0, "slice must be non-zero");
        for def in &self.tasks {
            assert!(def.weight > 0, "task {} has zero weight", def.name);
            assert!(
                def.behavior.phases.iter().any(|p| matches!(p, Phase::Run(_))),
                "task {} never runs",
                def.name
            );
        }
        Scenario {
            nr_cpus: self.nr_cpus,
            slice_ns: self.slice_ns,
            tasks: self.tasks,
            duration_ns: self.duration_ns,
        }
    }
}
