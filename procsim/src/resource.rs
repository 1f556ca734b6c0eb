use std::collections::HashSet;

use serde::Serialize;

use crate::config::ResourceConfig;
use crate::{Priority, ProcessId, Time, Woken};

/// A process currently holding a slot of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Holder {
    /// The holding process.
    pub process: ProcessId,
    /// Priority of the request that was granted.
    pub priority: Priority,
    /// Time at which the slot was granted.
    pub since: Time,
    #[serde(skip)]
    seq: u64,
}

#[derive(Debug, Clone, Copy)]
struct Waiter {
    process: ProcessId,
    priority: Priority,
    /// Preempted processes re-requesting the resource go ahead of their priority class.
    resumed: bool,
    seq: u64,
    since: Time,
}

impl Waiter {
    fn key(&self) -> (Priority, bool, u64) {
        (self.priority, !self.resumed, self.seq)
    }
}

/// Outcome of a request.
#[derive(Debug, PartialEq)]
pub(crate) enum Grant {
    /// A free slot was granted right away.
    Granted,
    /// The requester was added to the wait queue.
    Queued,
    /// The slot of the returned holder was given to the requester.
    Preempted(Holder),
}

/// Outcome of a release.
#[derive(Debug, PartialEq)]
pub(crate) enum Release {
    /// The releasing process did not hold the resource.
    NotHolder,
    /// The slot was freed and possibly granted to the head of the wait queue.
    Released { granted: Option<Woken> },
}

/// Capacity-limited resource with a priority wait queue and optional preemption.
///
/// Waiters are ordered by ascending priority value, then by arrival. A process that lost its slot
/// to preemption and requests the resource again is placed in front of the waiters of its own
/// priority.
#[derive(Debug)]
pub struct Resource {
    name: String,
    capacity: usize,
    preemptive: bool,
    holders: Vec<Holder>,
    waiters: Vec<Waiter>,
    preempted: HashSet<ProcessId>,
    next_seq: u64,
}

impl Resource {
    pub(crate) fn new(name: String, config: &ResourceConfig) -> Self {
        Self {
            name,
            capacity: config.capacity,
            preemptive: config.preemptive,
            holders: Vec::with_capacity(config.capacity.min(1024)),
            waiters: Vec::new(),
            preempted: HashSet::new(),
            next_seq: 0,
        }
    }

    /// Name reported to observers.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether plain requests preempt lower-priority holders.
    #[must_use]
    pub fn is_preemptive(&self) -> bool {
        self.preemptive
    }

    /// Number of slots currently held. Always equal to `holders().len()`.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.holders.len()
    }

    /// Current holders in the order they were granted.
    #[must_use]
    pub fn holders(&self) -> &[Holder] {
        &self.holders
    }

    /// Number of waiting requests.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.waiters.len()
    }

    /// Waiting processes in the order they will be granted.
    pub fn waiting(&self) -> impl Iterator<Item = ProcessId> + '_ {
        self.waiters.iter().map(|w| w.process)
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn hold(&mut self, process: ProcessId, priority: Priority, now: Time) {
        let seq = self.next_seq();
        self.preempted.remove(&process);
        self.holders.push(Holder {
            process,
            priority,
            since: now,
            seq,
        });
    }

    pub(crate) fn request(
        &mut self,
        process: ProcessId,
        priority: Priority,
        preemptive: bool,
        now: Time,
    ) -> Grant {
        if self.holders.len() < self.capacity {
            self.hold(process, priority, now);
            return Grant::Granted;
        }
        if preemptive {
            let victim = self
                .holders
                .iter()
                .enumerate()
                .filter(|(_, h)| h.process != process)
                .max_by_key(|(_, h)| (h.priority, h.seq))
                .filter(|(_, h)| h.priority > priority)
                .map(|(idx, _)| idx);
            if let Some(idx) = victim {
                let victim = self.holders.remove(idx);
                self.preempted.insert(victim.process);
                self.hold(process, priority, now);
                return Grant::Preempted(victim);
            }
        }
        let waiter = Waiter {
            process,
            priority,
            resumed: self.preempted.remove(&process),
            seq: self.next_seq(),
            since: now,
        };
        let key = waiter.key();
        let pos = self.waiters.partition_point(|w| w.key() < key);
        self.waiters.insert(pos, waiter);
        Grant::Queued
    }

    pub(crate) fn release(&mut self, process: ProcessId, now: Time) -> Release {
        let Some(idx) = self.holders.iter().position(|h| h.process == process) else {
            return Release::NotHolder;
        };
        self.holders.remove(idx);
        let granted = if self.holders.len() < self.capacity && !self.waiters.is_empty() {
            let waiter = self.waiters.remove(0);
            self.hold(waiter.process, waiter.priority, now);
            Some(Woken {
                process: waiter.process,
                waited: now - waiter.since,
            })
        } else {
            None
        };
        Release::Released { granted }
    }

    /// Removes `process` from the wait queue, returning `true` if it was waiting.
    pub(crate) fn remove_waiter(&mut self, process: ProcessId) -> bool {
        if let Some(idx) = self.waiters.iter().position(|w| w.process == process) {
            self.waiters.remove(idx);
            true
        } else {
            false
        }
    }

    /// Forgets that `process` was preempted.
    pub(crate) fn forget(&mut self, process: ProcessId) {
        self.preempted.remove(&process);
    }

    pub(crate) fn reset(&mut self) {
        self.holders.clear();
        self.waiters.clear();
        self.preempted.clear();
        self.next_seq = 0;
    }
}
