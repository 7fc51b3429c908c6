// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # scx_simple
//!
//! A minimal sched_ext policy: a global weighted virtual-time scheduler
//! that can be switched to plain FIFO, together with a user-space host
//! that runs it.
//!
//! The policy ([`ScxSimple`]) only sees the world through the [`Host`]
//! trait, the way a BPF scheduler only sees the kernel through kfuncs.
//! [`LocalHost`] implements that trait with in-process dispatch queues,
//! and [`Simulator`] drives the policy's callbacks through scripted
//! workloads on a simulated clock.
//!
//! ```no_run
//! use scx_simple::{Phase, Scenario, SimpleConfig, Simulator, TaskBehavior};
//!
//! let scenario = Scenario::builder()
//!     .cpus(2)
//!     .add_task("hog", 100, TaskBehavior::cpu_hog())
//!     .add_task(
//!         "sleepy",
//!         200,
//!         TaskBehavior {
//!             phases: vec![Phase::Run(1_000_000), Phase::Sleep(4_000_000)],
//!             repeat: true,
//!         },
//!     )
//!     .duration_ms(200)
//!     .build();
//!
//! let result = Simulator::simple(scenario, SimpleConfig::default())?.run();
//! result.trace.dump();
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod dsq;
pub mod engine;
pub mod exit_info;
pub mod host;
pub mod ops;
pub mod percpu;
pub mod scenario;
pub mod simple;
pub mod stats;
pub mod task;
pub mod trace;
pub mod types;
pub mod vtime;

pub use engine::{SimulationResult, Simulator, TaskState};
pub use exit_info::{ExitInfo, ScxExitKind, UserExitInfo, SCX_ECODE_ACT_RESTART};
pub use host::LocalHost;
pub use ops::{Host, SchedOps};
pub use scenario::{Phase, Scenario, TaskBehavior, TaskDef};
pub use simple::{ChargeMode, ScxSimple, SimpleConfig, MAX_SLICE_NS, SHARED_DSQ};
pub use stats::Metrics;
pub use task::Task;
pub use trace::{Trace, TraceEvent, TraceKind};
pub use types::{CpuId, DsqId, Pid, TimeNs, Weight, SLICE_DFL_NS, WEIGHT_DFL};

pub const SCHEDULER_NAME: &str = "scx_simple";
