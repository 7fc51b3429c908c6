// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The global virtual clock.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::time_before;

/// `vtime_now`: the largest vtime seen among tasks that started running.
///
/// Updated from every CPU without a lock. The clock only needs to be an
/// approximate upper bound, so relaxed ordering is enough; the CAS loop
/// keeps it from moving backwards when two CPUs race.
#[derive(Debug, Default)]
pub struct GlobalVtime {
    now: AtomicU64,
}

impl GlobalVtime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }

    /// Advance the clock to `vtime` if it is ahead. Returns whether the
    /// clock moved.
    pub fn advance(&self, vtime: u64) -> bool {
        self.now
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
                time_before(cur, vtime).then_some(vtime)
            })
            .is_ok()
    }
}
