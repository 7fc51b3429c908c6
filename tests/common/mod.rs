#![allow(dead_code)]

use std::sync::Arc;

use scx_simple::*;

/// Initialize logging from `RUST_LOG` (error, warn, info, debug, trace).
///
/// `TestLogger` writes through the test harness so output is captured per
/// test. Only the first call in the process installs the logger.
pub fn setup_test() {
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(simplelog::LevelFilter::Warn);
    let _ = simplelog::TestLogger::init(level, simplelog::Config::default());
}

/// A host and an activated `scx_simple` policy on it.
pub fn activate(nr_cpus: u32, slice_ns: TimeNs, cfg: SimpleConfig) -> (Arc<LocalHost>, ScxSimple<LocalHost>) {
    let host = Arc::new(LocalHost::new(nr_cpus).with_slice_dfl(slice_ns));
    let sched = ScxSimple::new(host.clone(), cfg);
    assert_eq!(sched.init(), 0, "activation failed");
    (host, sched)
}

pub fn weighted() -> SimpleConfig {
    SimpleConfig::default()
}

pub fn fifo() -> SimpleConfig {
    SimpleConfig {
        fifo_sched: true,
        ..Default::default()
    }
}

pub fn hog(name: &str, pid: i32, weight: Weight) -> TaskDef {
    TaskDef {
        name: name.into(),
        pid: Pid(pid),
        weight,
        behavior: TaskBehavior::cpu_hog(),
        start_time_ns: 0,
    }
}

/// Simple xorshift64 PRNG so stress tests are reproducible.
pub struct XorShift(u64);

impl XorShift {
    pub fn new(seed: u64) -> Self {
        XorShift(seed.max(1))
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    /// Uniform-ish value in `0..n`.
    pub fn below(&mut self, n: u64) -> u64 {
        self.next_u64() % n
    }
}
