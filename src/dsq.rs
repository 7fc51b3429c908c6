// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Dispatch queue (DSQ) storage.
//!
//! A DSQ is either FIFO or vtime-ordered while it holds tasks; mixing the
//! two insertion forms is rejected, as the kernel does. Each queue sits
//! behind its own mutex in the [`DsqRegistry`], so producers and consumers
//! on different CPUs only contend on the queue they touch.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::mem;
use std::sync::{Mutex, MutexGuard, OnceLock};

use anyhow::bail;
use anyhow::Result;

use crate::types::{DsqId, Pid, Vtime};

/// The ordering mode of a DSQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DsqMode {
    /// No tasks queued, mode is undetermined.
    Empty,
    /// Tasks are ordered FIFO (inserted via dsq_insert).
    Fifo,
    /// Tasks are ordered by vtime (inserted via dsq_insert_vtime).
    Priq,
}

/// A single dispatch queue, supporting either FIFO or vtime ordering.
#[derive(Debug)]
pub struct Dsq {
    /// Vtime-ordered entries: (vtime, insertion_order) -> pid.
    /// The insertion_order breaks ties between equal vtimes.
    vtime_entries: BTreeMap<(Vtime, u64), Pid>,
    fifo_entries: VecDeque<Pid>,
    insertion_counter: u64,
    mode: DsqMode,
}

impl Dsq {
    pub fn new() -> Self {
        Dsq {
            vtime_entries: BTreeMap::new(),
            fifo_entries: VecDeque::new(),
            insertion_counter: 0,
            mode: DsqMode::Empty,
        }
    }

    /// Insert a task at the tail.
    pub fn insert_fifo(&mut self, pid: Pid) -> Result<()> {
        if self.mode == DsqMode::Priq {
            bail!("cannot insert FIFO task into a vtime-ordered DSQ");
        }
        self.mode = DsqMode::Fifo;
        self.fifo_entries.push_back(pid);
        Ok(())
    }

    /// Insert a task ordered by `vtime`, after any task with the same key.
    pub fn insert_vtime(&mut self, pid: Pid, vtime: Vtime) -> Result<()> {
        if self.mode == DsqMode::Fifo {
            bail!("cannot insert vtime task into a FIFO DSQ");
        }
        self.mode = DsqMode::Priq;
        let order = self.insertion_counter;
        self.insertion_counter += 1;
        self.vtime_entries.insert((vtime, order), pid);
        Ok(())
    }

    /// Pop the first task: lowest vtime for PRIQ, head for FIFO.
    pub fn pop(&mut self) -> Option<Pid> {
        let result = match self.mode {
            DsqMode::Priq => self.vtime_entries.pop_first().map(|(_, pid)| pid),
            DsqMode::Fifo => self.fifo_entries.pop_front(),
            DsqMode::Empty => None,
        };
        if self.is_empty() {
            self.mode = DsqMode::Empty;
        }
        result
    }

    pub fn len(&self) -> usize {
        self.vtime_entries.len() + self.fifo_entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vtime_entries.is_empty() && self.fifo_entries.is_empty()
    }

    /// All PIDs in dispatch order, without consuming.
    pub fn ordered_pids(&self) -> Vec<Pid> {
        match self.mode {
            DsqMode::Priq => self.vtime_entries.values().copied().collect(),
            DsqMode::Fifo => self.fifo_entries.iter().copied().collect(),
            DsqMode::Empty => Vec::new(),
        }
    }

    /// (pid, key) pairs in dispatch order. FIFO entries have no key.
    pub fn ordered_keys(&self) -> Vec<(Pid, Option<u64>)> {
        match self.mode {
            DsqMode::Priq => self
                .vtime_entries
                .iter()
                .map(|(&(vtime, _), &pid)| (pid, Some(vtime.0)))
                .collect(),
            DsqMode::Fifo => self.fifo_entries.iter().map(|&pid| (pid, None)).collect(),
            DsqMode::Empty => Vec::new(),
        }
    }
}

impl Default for Dsq {
    fn default() -> Self {
        Self::new()
    }
}

/// The user-created DSQs of a host, keyed by id.
///
/// Queues are only created during activation. The first lookup freezes
/// the set, after which creation fails with `-EBUSY` and lookups reach a
/// queue without any registry-wide lock; only the queue's own mutex is
/// taken.
#[derive(Debug, Default)]
pub struct DsqRegistry {
    pending: Mutex<HashMap<DsqId, Mutex<Dsq>>>,
    frozen: OnceLock<HashMap<DsqId, Mutex<Dsq>>>,
}

impl DsqRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new DSQ. Fails with `-EEXIST` if it already exists and
    /// with `-EBUSY` once the registry is frozen.
    pub fn create(&self, dsq_id: DsqId) -> Result<(), i32> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if self.frozen.get().is_some() {
            return Err(-libc::EBUSY);
        }
        if pending.contains_key(&dsq_id) {
            return Err(-libc::EEXIST);
        }
        pending.insert(dsq_id, Mutex::new(Dsq::new()));
        Ok(())
    }

    /// Stop accepting new queues and return the final set.
    pub fn freeze(&self) -> &HashMap<DsqId, Mutex<Dsq>> {
        if let Some(dsqs) = self.frozen.get() {
            return dsqs;
        }
        // Hold the pending lock so a racing create either lands before the
        // move or sees the frozen map.
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        self.frozen.get_or_init(|| mem::take(&mut *pending))
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.get().is_some()
    }

    pub fn contains(&self, dsq_id: DsqId) -> bool {
        match self.frozen.get() {
            Some(dsqs) => dsqs.contains_key(&dsq_id),
            None => self
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains_key(&dsq_id),
        }
    }

    /// Run `f` on the queue `dsq_id` with its lock held. Returns None if
    /// the queue does not exist.
    pub fn with<T>(&self, dsq_id: DsqId, f: impl FnOnce(&mut Dsq) -> T) -> Option<T> {
        let dsq = self.freeze().get(&dsq_id)?;
        let mut guard: MutexGuard<'_, Dsq> = dsq.lock().unwrap_or_else(|e| e.into_inner());
        Some(f(&mut guard))
    }

    pub fn nr_queued(&self, dsq_id: DsqId) -> usize {
        self.with(dsq_id, |dsq| dsq.len()).unwrap_or(0)
    }

    pub fn ordered_pids(&self, dsq_id: DsqId) -> Vec<Pid> {
        self.with(dsq_id, |dsq| dsq.ordered_pids())
            .unwrap_or_default()
    }
}
