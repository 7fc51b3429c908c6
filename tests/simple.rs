use std::sync::Arc;

use scx_simple::types::{SCX_ENQ_WAKEUP, SCX_WAKE_TTWU};
use scx_simple::*;

mod common;

/// Pop the next task from `cpu`'s local queue after a dispatch round.
fn dispatch_one(host: &LocalHost, sched: &ScxSimple<LocalHost>, cpu: CpuId) -> Option<Pid> {
    host.enter_cpu(cpu);
    if host.nr_local(cpu) == 0 {
        sched.dispatch(cpu, None);
    }
    host.pop_local(cpu)
}

/// T1 (weight 100) and T2 (weight 300) each burn a full slice; T2 is then
/// charged a third of what T1 is and goes ahead of it.
#[test]
fn test_end_to_end_weighted() {
    common::setup_test();
    let (host, sched) = common::activate(1, 100, common::weighted());
    host.enter_cpu(CpuId(0));

    let mut t1 = Task::new(Pid(1), 100);
    let mut t2 = Task::new(Pid(2), 300);
    sched.enable(&mut t1);
    sched.enable(&mut t2);
    assert_eq!((t1.dsq_vtime, t2.dsq_vtime), (0, 0));

    sched.enqueue(&mut t1, 0);
    sched.enqueue(&mut t2, 0);
    assert_eq!(
        host.dsqs().ordered_pids(SHARED_DSQ),
        vec![Pid(1), Pid(2)],
        "equal keys keep enqueue order"
    );

    assert_eq!(dispatch_one(&host, &sched, CpuId(0)), Some(Pid(1)));
    sched.running(&mut t1);
    t1.slice = 0;
    sched.stopping(&mut t1, true);
    assert_eq!(t1.dsq_vtime, 100);

    assert_eq!(dispatch_one(&host, &sched, CpuId(0)), Some(Pid(2)));
    sched.running(&mut t2);
    t2.slice = 0;
    sched.stopping(&mut t2, true);
    assert_eq!(t2.dsq_vtime, 33);

    sched.enqueue(&mut t1, 0);
    sched.enqueue(&mut t2, 0);
    assert_eq!(host.dsqs().ordered_pids(SHARED_DSQ), vec![Pid(2), Pid(1)]);
}

#[test]
fn test_charge_formula() {
    common::setup_test();
    let (_host, sched) = common::activate(1, 20, common::weighted());

    let mut p = Task::new(Pid(1), 100);
    p.slice = 5;
    sched.stopping(&mut p, true);
    assert_eq!(p.dsq_vtime, 15);

    // A yield leaves nothing of the slice: full slice at half rate.
    let mut q = Task::new(Pid(2), 200);
    q.slice = 0;
    sched.stopping(&mut q, true);
    assert_eq!(q.dsq_vtime, 10);
}

/// A slice near the top of the u64 range charges the full slice at the
/// default weight without overflowing, and saturates once it cannot fit.
#[test]
fn test_charge_with_huge_slice() {
    common::setup_test();
    let (_host, sched) = common::activate(1, MAX_SLICE_NS, common::weighted());

    let mut p = Task::new(Pid(1), 100);
    p.slice = 0;
    sched.stopping(&mut p, true);
    assert_eq!(p.dsq_vtime, MAX_SLICE_NS);

    let mut light = Task::new(Pid(2), 1);
    light.slice = 0;
    sched.stopping(&mut light, true);
    assert_eq!(light.dsq_vtime, MAX_SLICE_NS * 100);

    let mut heavy = Task::new(Pid(3), 10000);
    heavy.slice = MAX_SLICE_NS / 2;
    sched.stopping(&mut heavy, false);
    assert_eq!(heavy.dsq_vtime, (MAX_SLICE_NS - MAX_SLICE_NS / 2) / 100);

    // Past MAX_SLICE_NS the scaled charge no longer fits.
    let (_host, sched) = common::activate(1, u64::MAX, common::weighted());
    let mut q = Task::new(Pid(4), 1);
    q.slice = 0;
    sched.stopping(&mut q, true);
    assert_eq!(q.dsq_vtime, u64::MAX);
}

#[test]
fn test_equal_weights_equal_charge() {
    common::setup_test();
    let (_host, sched) = common::activate(1, 20_000_000, common::weighted());

    let mut a = Task::new(Pid(1), 100);
    let mut b = Task::new(Pid(2), 100);
    a.slice = 7_000_000;
    b.slice = 7_000_000;
    sched.stopping(&mut a, true);
    sched.stopping(&mut b, false);
    assert_eq!(a.dsq_vtime, b.dsq_vtime);
    assert_eq!(a.dsq_vtime, 13_000_000);
}

#[test]
fn test_fifo_order() {
    common::setup_test();
    let (host, sched) = common::activate(1, 20, common::fifo());
    host.enter_cpu(CpuId(0));

    let mut tasks: Vec<Task> = [(1, 1000), (2, 1), (3, 100)]
        .into_iter()
        .map(|(pid, w)| Task::new(Pid(pid), w))
        .collect();
    for t in tasks.iter_mut() {
        sched.enable(t);
        sched.enqueue(t, SCX_ENQ_WAKEUP);
        assert_eq!(t.slice, 20);
    }
    assert_eq!(
        host.dsqs().ordered_pids(SHARED_DSQ),
        vec![Pid(1), Pid(2), Pid(3)]
    );

    for (i, t) in tasks.iter_mut().enumerate() {
        assert_eq!(dispatch_one(&host, &sched, CpuId(0)), Some(t.pid), "slot {}", i);
        sched.running(t);
        t.slice = 0;
        sched.stopping(t, true);
        assert_eq!(t.dsq_vtime, 0, "FIFO mode charges nothing");
    }
    assert_eq!(sched.vtime_now(), 0);
    assert_eq!(dispatch_one(&host, &sched, CpuId(0)), None);
}

#[test]
fn test_idle_task_clamped_to_one_slice() {
    common::setup_test();
    let (host, sched) = common::activate(1, 20, common::weighted());
    host.enter_cpu(CpuId(0));

    let mut runner = Task::new(Pid(1), 100);
    runner.dsq_vtime = 1000;
    sched.running(&mut runner);
    assert_eq!(sched.vtime_now(), 1000);

    let mut stale = Task::new(Pid(2), 100);
    stale.dsq_vtime = 5;
    sched.enqueue(&mut stale, SCX_ENQ_WAKEUP);
    assert_eq!(stale.dsq_vtime, 980);

    let mut fresh = Task::new(Pid(3), 100);
    fresh.dsq_vtime = 990;
    sched.enqueue(&mut fresh, SCX_ENQ_WAKEUP);
    assert_eq!(fresh.dsq_vtime, 990);

    assert_eq!(host.dsqs().ordered_pids(SHARED_DSQ), vec![Pid(2), Pid(3)]);
}

#[test]
fn test_running_never_moves_vtime_backwards() {
    common::setup_test();
    let (_host, sched) = common::activate(1, 20, common::weighted());

    let mut ahead = Task::new(Pid(1), 100);
    ahead.dsq_vtime = 500;
    let mut behind = Task::new(Pid(2), 100);
    behind.dsq_vtime = 200;

    sched.running(&mut ahead);
    sched.running(&mut behind);
    assert_eq!(sched.vtime_now(), 500);

    // A task enabled now starts at the current global vtime.
    let mut newcomer = Task::new(Pid(3), 100);
    sched.enable(&mut newcomer);
    assert_eq!(newcomer.dsq_vtime, 500);
}

#[test]
fn test_select_cpu_direct_dispatch_and_stats() {
    common::setup_test();
    let (host, sched) = common::activate(2, 20, common::weighted());
    host.enter_cpu(CpuId(0));

    let mut a = Task::new(Pid(1), 100);
    let mut b = Task::new(Pid(2), 100);
    let mut c = Task::new(Pid(3), 100);

    assert_eq!(sched.select_cpu(&mut a, CpuId(1), SCX_WAKE_TTWU), CpuId(1));
    assert!(host.local_contains(CpuId(1), Pid(1)));
    assert_eq!(a.slice, 20);

    // CPU 1 was claimed; b lands on the other idle CPU.
    assert_eq!(sched.select_cpu(&mut b, CpuId(1), SCX_WAKE_TTWU), CpuId(0));
    assert!(host.local_contains(CpuId(0), Pid(2)));

    // No idle CPU left: c is not placed and must go through enqueue.
    assert_eq!(sched.select_cpu(&mut c, CpuId(1), SCX_WAKE_TTWU), CpuId(1));
    assert_eq!(host.nr_local(CpuId(1)), 1);
    host.enter_cpu(CpuId(1));
    sched.enqueue(&mut c, SCX_ENQ_WAKEUP);

    assert_eq!(sched.stats().read_cpu(CpuId(0)), [2, 0]);
    assert_eq!(sched.stats().read_cpu(CpuId(1)), [0, 1]);

    let m = Metrics::from_stats(sched.stats(), sched.vtime_now());
    assert_eq!((m.nr_local, m.nr_global, m.nr_cpus), (2, 1, 2));
}

#[test]
fn test_stats_count_every_call() {
    common::setup_test();
    let (host, sched) = common::activate(4, 20, common::fifo());
    let mut rng = common::XorShift::new(0x5eed);
    let mut expected = [[0u64; 2]; 4];

    for i in 0..200 {
        let cpu = CpuId(rng.below(4) as u32);
        host.enter_cpu(cpu);
        let mut p = Task::new(Pid(i), 100);
        sched.enqueue(&mut p, 0);
        expected[cpu.0 as usize][1] += 1;

        let before = sched.stats().read_all();
        sched.dispatch(cpu, None);
        host.pop_local(cpu);
        assert_eq!(sched.stats().read_all(), before, "dispatch must not count");
    }
    assert_eq!(sched.stats().read_all(), expected.to_vec());
}

#[test]
fn test_init_failure_is_surfaced() {
    common::setup_test();
    let host = Arc::new(LocalHost::new(1));
    assert_eq!(host.create_dsq(SHARED_DSQ, -1), 0);

    let sched = ScxSimple::new(host.clone(), SimpleConfig::default());
    assert_eq!(sched.init(), -libc::EEXIST);

    let scenario = Scenario::builder()
        .cpus(1)
        .task(common::hog("hog", 1, 100))
        .build();
    let sched = ScxSimple::new(host.clone(), SimpleConfig::default());
    let err = Simulator::new(sched, host, scenario).err().expect("init must fail");
    assert!(err.to_string().contains("init failed"), "{}", err);
}

#[test]
fn test_exit_recorded_once() {
    common::setup_test();
    let (_host, sched) = common::activate(1, 20, common::weighted());
    assert!(!sched.exited());

    sched.exit(&ExitInfo::new(ScxExitKind::Unreg, "bye"));
    sched.exit(&ExitInfo::new(ScxExitKind::ErrorBPF, "late"));

    let uei = sched.uei().expect("exit record");
    assert!(sched.exited());
    assert_eq!(uei.kind(), ScxExitKind::Unreg as i32);
    assert_eq!(uei.msg(), Some("bye"));
    assert!(uei.report().is_ok());
    assert!(!uei.should_restart());
}

/// Yielding after 5ms of a 20ms slice: charged the whole slice by default,
/// the measured 5ms when charging by timestamp.
#[test]
fn test_yield_charge_modes() {
    common::setup_test();
    let behavior = TaskBehavior {
        phases: vec![Phase::Run(5_000_000), Phase::Yield],
        repeat: true,
    };
    let scenario = Scenario::builder()
        .cpus(1)
        .add_task("yielder", 100, behavior)
        .duration_ms(6)
        .build();

    let slice = Simulator::simple(scenario.clone(), SimpleConfig::default())
        .unwrap()
        .run();
    assert_eq!(slice.trace.schedule_count(Pid(1)), 2);
    assert_eq!(slice.tasks[&Pid(1)].dsq_vtime, 20_000_000);

    let cfg = SimpleConfig {
        charge: ChargeMode::Timestamp,
        ..Default::default()
    };
    let timestamp = Simulator::simple(scenario, cfg).unwrap().run();
    assert_eq!(timestamp.trace.schedule_count(Pid(1)), 2);
    assert_eq!(timestamp.tasks[&Pid(1)].dsq_vtime, 5_000_000);
}

/// A policy that FIFO-inserts some tasks into the vtime-ordered shared
/// queue. The host catches it and the policy is torn down with an error.
struct MixedInsert {
    inner: ScxSimple<LocalHost>,
    host: Arc<LocalHost>,
}

impl SchedOps for MixedInsert {
    fn name(&self) -> &'static str {
        "mixed"
    }

    fn init(&self) -> i32 {
        self.inner.init()
    }

    fn select_cpu(&self, p: &mut Task, prev_cpu: CpuId, wake_flags: u64) -> CpuId {
        self.inner.select_cpu(p, prev_cpu, wake_flags)
    }

    fn enqueue(&self, p: &mut Task, enq_flags: u64) {
        if p.pid.0 % 2 == 0 {
            self.host
                .dsq_insert(p, SHARED_DSQ, self.host.slice_dfl(), enq_flags);
        } else {
            self.inner.enqueue(p, enq_flags);
        }
    }

    fn dispatch(&self, cpu: CpuId, prev: Option<&Task>) {
        self.inner.dispatch(cpu, prev)
    }

    fn running(&self, p: &mut Task) {
        self.inner.running(p)
    }

    fn stopping(&self, p: &mut Task, runnable: bool) {
        self.inner.stopping(p, runnable)
    }

    fn enable(&self, p: &mut Task) {
        self.inner.enable(p)
    }

    fn exit(&self, ei: &ExitInfo) {
        self.inner.exit(ei)
    }
}

#[test]
fn test_mixed_insertion_tears_policy_down() {
    common::setup_test();
    let host = Arc::new(LocalHost::new(1));
    let sched = MixedInsert {
        inner: ScxSimple::new(host.clone(), SimpleConfig::default()),
        host: host.clone(),
    };
    let scenario = Scenario::builder()
        .cpus(1)
        .task(common::hog("odd", 1, 100))
        .task(common::hog("odd2", 3, 100))
        .task(common::hog("even", 2, 100))
        .build();

    let result = Simulator::new(sched, host.clone(), scenario).unwrap().run();
    assert_eq!(result.exit.kind, ScxExitKind::ErrorBPF);
    assert!(
        result.exit.msg.contains("cannot insert FIFO"),
        "{}",
        result.exit.msg
    );
    assert!(host.error().is_some());

    let uei = UserExitInfo::from_exit_info(&result.exit);
    assert!(uei.report().is_err());
}
