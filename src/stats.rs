// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use anyhow::Result;
use log::info;
use log::warn;
use scx_stats::prelude::*;
use scx_stats_derive::stat_doc;
use scx_stats_derive::Stats;
use serde::Deserialize;
use serde::Serialize;

use crate::percpu::{PerCpuStats, StatIdx};

#[stat_doc]
#[derive(Clone, Debug, Default, Serialize, Deserialize, Stats)]
#[stat(top)]
pub struct Metrics {
    #[stat(desc = "Number of tasks placed directly on an idle CPU's local queue")]
    pub nr_local: u64,
    #[stat(desc = "Number of tasks inserted into the shared queue")]
    pub nr_global: u64,
    #[stat(desc = "Number of CPUs the counters were summed over")]
    pub nr_cpus: u64,
    #[stat(desc = "Current global virtual time")]
    pub vtime_now: u64,
}

impl Metrics {
    /// Sum the per-CPU counters.
    pub fn from_stats(stats: &PerCpuStats, vtime_now: u64) -> Self {
        let mut m = Metrics {
            nr_cpus: stats.nr_cpus() as u64,
            vtime_now,
            ..Default::default()
        };
        for cnts in stats.read_all() {
            m.nr_local += cnts[StatIdx::Local as usize];
            m.nr_global += cnts[StatIdx::Global as usize];
        }
        m
    }

    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(
            w,
            "[{}] local: {:<8} global: {:<8} cpus: {:<4} vtime: {}",
            crate::SCHEDULER_NAME,
            self.nr_local,
            self.nr_global,
            self.nr_cpus,
            self.vtime_now
        )?;
        Ok(())
    }

    pub fn delta(&self, rhs: &Self) -> Self {
        Self {
            nr_local: self.nr_local.saturating_sub(rhs.nr_local),
            nr_global: self.nr_global.saturating_sub(rhs.nr_global),
            ..self.clone()
        }
    }
}

pub fn server_data() -> StatsServerData<(), Metrics> {
    let open: Box<dyn StatsOpener<(), Metrics>> = Box::new(move |(req_ch, res_ch)| {
        req_ch.send(())?;
        let mut prev = res_ch.recv()?;

        let read: Box<dyn StatsReader<(), Metrics>> = Box::new(move |_args, (req_ch, res_ch)| {
            req_ch.send(())?;
            let cur = res_ch.recv()?;
            let delta = cur.delta(&prev);
            prev = cur;
            delta.to_json()
        });

        Ok(read)
    });

    StatsServerData::new()
        .add_meta(Metrics::meta())
        .add_ops("top", StatsOps { open, close: None })
}

/// How long to wait before trying the stats server again.
const RECONNECT_INTV: Duration = Duration::from_secs(1);

/// Print the metrics of a running scx_simple every `intv` until `shutdown`
/// is set.
///
/// The scheduler may not be up yet, or may go away and come back, so the
/// monitor keeps waiting for the server instead of failing.
pub fn monitor(intv: Duration, shutdown: Arc<AtomicBool>) -> Result<()> {
    let mut out = std::io::stdout();
    let mut waiting = false;

    while !shutdown.load(Ordering::Relaxed) {
        let mut client = match StatsClient::new().connect() {
            Ok(client) => client,
            Err(e) if server_unavailable(&e) => {
                if !waiting {
                    info!("waiting for the {} stats server", crate::SCHEDULER_NAME);
                    waiting = true;
                }
                sleep(RECONNECT_INTV);
                continue;
            }
            Err(e) => return Err(e),
        };
        if waiting {
            info!("connected to the {} stats server", crate::SCHEDULER_NAME);
            waiting = false;
        }
        poll(&mut client, intv, &shutdown, &mut out)?;
    }

    Ok(())
}

/// No server listening yet, as opposed to a real failure.
fn server_unavailable(e: &anyhow::Error) -> bool {
    e.downcast_ref::<std::io::Error>().is_some_and(|ioe| {
        matches!(
            ioe.kind(),
            std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
        )
    })
}

/// Request and print metrics until shutdown or the connection drops.
fn poll<W: Write>(
    client: &mut StatsClient,
    intv: Duration,
    shutdown: &AtomicBool,
    out: &mut W,
) -> Result<()> {
    while !shutdown.load(Ordering::Relaxed) {
        let metrics: Metrics = match client.request("stats", vec![]) {
            Ok(metrics) => metrics,
            Err(e) => {
                warn!("lost the stats server: {}", e);
                sleep(RECONNECT_INTV);
                return Ok(());
            }
        };
        metrics.format(out)?;
        sleep(intv);
    }
    Ok(())
}
