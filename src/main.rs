// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use crossbeam::channel::RecvTimeoutError;
use log::warn;
use log::{debug, info};
use scx_simple::stats;
use scx_simple::ChargeMode;
use scx_simple::ExitInfo;
use scx_simple::LocalHost;
use scx_simple::MAX_SLICE_NS;
use scx_simple::Metrics;
use scx_simple::Phase;
use scx_simple::Scenario;
use scx_simple::ScxExitKind;
use scx_simple::ScxSimple;
use scx_simple::SimpleConfig;
use scx_simple::Simulator;
use scx_simple::TaskBehavior;
use scx_simple::TimeNs;
use scx_simple::SCHEDULER_NAME;
use scx_stats::prelude::*;

/// How much simulated time each iteration of the run loop covers.
const STEP: Duration = Duration::from_millis(100);

/// scx_simple: a simple global weighted vtime / FIFO scheduler.
///
/// The policy is activated on an in-process host with the requested
/// number of CPUs and drives a synthetic workload: one task per weight,
/// each running for --run-ms, optionally yielding and sleeping, forever.
/// Simulated time is paced to wall-clock time.
#[derive(Debug, Parser)]
struct Opts {
    /// Use FIFO scheduling instead of weighted vtime scheduling.
    #[clap(short = 'f', long, action = clap::ArgAction::SetTrue)]
    fifo: bool,

    /// Charge tasks the time measured between running and stopping instead
    /// of the consumed part of their slice.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    charge_by_timestamp: bool,

    /// Default scheduling slice duration in microseconds.
    #[clap(short = 's', long, default_value = "20000")]
    slice_us: u64,

    /// Number of simulated CPUs.
    #[clap(short = 'c', long, default_value = "4")]
    nr_cpus: u32,

    /// Comma-separated task weights, one task per entry (100 is the default
    /// weight).
    #[clap(short = 'w', long, value_delimiter = ',', default_value = "100,100,200")]
    weights: Vec<u32>,

    /// How long each task runs before yielding or sleeping, in milliseconds.
    #[clap(long, default_value = "5")]
    run_ms: u64,

    /// How long each task sleeps after running, in milliseconds. 0 keeps the
    /// tasks always runnable.
    #[clap(long, default_value = "0")]
    sleep_ms: u64,

    /// Yield the CPU after each run period.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    r#yield: bool,

    /// Stop after this many milliseconds of simulated time. Runs until
    /// interrupted if not set.
    #[clap(short = 'd', long)]
    duration_ms: Option<u64>,

    /// Enable stats monitoring with the specified interval.
    #[clap(long)]
    stats: Option<f64>,

    /// Run in stats monitoring mode with the specified interval. Scheduler
    /// is not launched.
    #[clap(long)]
    monitor: Option<f64>,

    /// Enable verbose output, including a line per scheduling callback.
    #[clap(short = 'v', long, action = clap::ArgAction::SetTrue)]
    verbose: bool,

    /// Print scheduler version and exit.
    #[clap(short = 'V', long, action = clap::ArgAction::SetTrue)]
    version: bool,

    /// Show descriptions for statistics.
    #[clap(long)]
    help_stats: bool,
}

impl Opts {
    fn simple_config(&self) -> SimpleConfig {
        SimpleConfig {
            fifo_sched: self.fifo,
            charge: if self.charge_by_timestamp {
                ChargeMode::Timestamp
            } else {
                ChargeMode::Slice
            },
        }
    }

    fn scenario(&self) -> Result<Scenario> {
        if self.nr_cpus == 0 {
            bail!("--nr-cpus must be at least 1");
        }
        let slice_ns = match self.slice_us.checked_mul(1000) {
            Some(ns) if ns > 0 && ns <= MAX_SLICE_NS => ns,
            _ => bail!("--slice-us must be within 1..={}", MAX_SLICE_NS / 1000),
        };
        if self.run_ms == 0 {
            bail!("--run-ms must be non-zero");
        }
        let run_ns = ms_to_ns(self.run_ms).context("--run-ms is too large")?;
        let sleep_ns = ms_to_ns(self.sleep_ms).context("--sleep-ms is too large")?;
        if self.weights.is_empty() {
            bail!("at least one task weight is required");
        }
        if let Some(w) = self.weights.iter().find(|w| **w == 0 || **w > 10000) {
            bail!("invalid weight {} (must be within 1..=10000)", w);
        }

        let mut phases = vec![Phase::Run(run_ns)];
        if self.r#yield {
            phases.push(Phase::Yield);
        }
        if sleep_ns > 0 {
            phases.push(Phase::Sleep(sleep_ns));
        }
        let behavior = TaskBehavior {
            phases,
            repeat: true,
        };

        let mut builder = Scenario::builder()
            .cpus(self.nr_cpus)
            .slice_ns(slice_ns)
            .duration_ns(
                self.duration_ms
                    .map(|ms| ms.saturating_mul(1_000_000))
                    .unwrap_or(TimeNs::MAX),
            );
        for (i, weight) in self.weights.iter().enumerate() {
            builder = builder.add_task(&format!("task{}", i), *weight, behavior.clone());
        }
        Ok(builder.build())
    }
}

fn ms_to_ns(ms: u64) -> Option<TimeNs> {
    ms.checked_mul(1_000_000)
}

struct Scheduler {
    sim: Option<Simulator<ScxSimple<LocalHost>>>,
    stats_server: Option<StatsServer<(), Metrics>>,
}

impl Scheduler {
    fn init(opts: &Opts) -> Result<Self> {
        let cfg = opts.simple_config();
        let scenario = opts.scenario()?;
        info!(
            "{} {} cpus={} slice={}us tasks={}",
            SCHEDULER_NAME,
            env!("CARGO_PKG_VERSION"),
            scenario.nr_cpus,
            opts.slice_us,
            scenario.tasks.len()
        );

        let sim = Simulator::simple(scenario, cfg).context("Failed to activate the scheduler")?;

        let stats_server = match StatsServer::new(stats::server_data()).launch() {
            Ok(server) => Some(server),
            Err(e) => {
                warn!("failed to launch the stats server: {}", e);
                None
            }
        };

        Ok(Self {
            sim: Some(sim),
            stats_server,
        })
    }

    fn get_metrics(sim: &Simulator<ScxSimple<LocalHost>>) -> Metrics {
        let sched = sim.sched();
        Metrics::from_stats(sched.stats(), sched.vtime_now())
    }

    fn run(&mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let Some(mut sim) = self.sim.take() else {
            bail!("{} is not initialized", SCHEDULER_NAME);
        };
        let (res_ch, req_ch) = match &self.stats_server {
            Some(server) => server.channels(),
            None => (crossbeam::channel::unbounded().0, crossbeam::channel::never()),
        };

        let step_ns = STEP.as_nanos() as TimeNs;
        while !shutdown.load(Ordering::Relaxed) && !sim.exited() {
            let more = sim.run_until(sim.clock().saturating_add(step_ns));
            match req_ch.recv_timeout(STEP) {
                Ok(()) => res_ch.send(Self::get_metrics(&sim))?,
                Err(RecvTimeoutError::Timeout) => {}
                Err(e) => Err(e)?,
            }
            if !more {
                break;
            }
        }

        sim.unregister(ExitInfo::new(ScxExitKind::Unreg, ""));
        let uei = sim.sched().exit_record().read_or_default();
        let metrics = Self::get_metrics(&sim);
        let clock = sim.clock();

        let result = sim.finish(ExitInfo::new(ScxExitKind::Unreg, ""));
        info!("simulated {} ms", clock / 1_000_000);
        for (pid, task) in &result.tasks {
            info!(
                "pid {:>3} weight {:>5} runtime {:>8} us scheduled {:>5} times vtime {}",
                pid,
                task.weight,
                result.trace.total_runtime(*pid) / 1000,
                result.trace.schedule_count(*pid),
                task.dsq_vtime
            );
        }
        metrics.format(&mut std::io::stdout())?;

        uei.report()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        info!("Unregister {} scheduler", SCHEDULER_NAME);
    }
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    if opts.version {
        println!("{} {}", SCHEDULER_NAME, env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    if opts.help_stats {
        stats::server_data().describe_meta(&mut std::io::stdout(), None)?;
        return Ok(());
    }

    let loglevel = if opts.verbose {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };

    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        loglevel,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    if let Some(intv) = opts.monitor.or(opts.stats) {
        let shutdown_copy = shutdown.clone();
        let jh = std::thread::spawn(move || {
            match stats::monitor(Duration::from_secs_f64(intv), shutdown_copy) {
                Ok(_) => {
                    debug!("stats monitor thread finished successfully")
                }
                Err(error_object) => {
                    warn!(
                        "stats monitor thread finished because of an error {}",
                        error_object
                    )
                }
            }
        });
        if opts.monitor.is_some() {
            let _ = jh.join();
            return Ok(());
        }
    }

    let mut sched = Scheduler::init(&opts)?;
    sched.run(shutdown)?;

    Ok(())
}
